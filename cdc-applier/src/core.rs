use cdc::error::ErrorKind;
use cdc::pipeline::Pipeline;
use cdc::transport::redis::{RedisChangeSource, RedisReadOptions};
use cdc::warehouse::Warehouse;
use cdc::warehouse::bigquery::BigQueryWarehouse;
use cdc::warehouse::memory::MemoryWarehouse;
use cdc::warehouse::postgres::PostgresWarehouse;
use cdc::cdc_error;
use cdc_config::shared::{
    ApplierConfig, BatchConfig, InputSource, PgConnectionConfig, RetryConfig, ServiceConfig,
    TransportConfig, WarehouseConfig,
};
use cdc_telemetry::metrics::init_metrics;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{ApplierError, ApplierResult};

/// Starts the applier with `config`, running until the pipeline stops or a signal arrives.
///
/// Warehouses are dispatched statically, one arm per kind.
pub async fn start_applier_with_config(config: ServiceConfig, run_id: Uuid) -> ApplierResult<()> {
    info!(%run_id, "starting cdc applier");

    log_config(&config);

    let ServiceConfig {
        applier,
        warehouse,
        transport,
    } = config;

    match warehouse {
        WarehouseConfig::Memory => {
            let warehouse = MemoryWarehouse::new();
            start_pipeline(applier, &transport, warehouse, run_id).await
        }
        WarehouseConfig::Postgres {
            connection,
            max_connections,
        } => {
            let warehouse = PostgresWarehouse::new(&connection, max_connections);
            start_pipeline(applier, &transport, warehouse, run_id).await
        }
        WarehouseConfig::BigQuery {
            project_id,
            service_account_key_path,
        } => {
            let warehouse =
                BigQueryWarehouse::new_with_key_path(project_id, &service_account_key_path).await?;
            start_pipeline(applier, &transport, warehouse, run_id).await
        }
    }
}

/// Connects one Redis source per configured topic or subscription.
async fn connect_sources(
    config: &ApplierConfig,
    transport: &TransportConfig,
) -> ApplierResult<Vec<RedisChangeSource>> {
    let TransportConfig::Redis {
        url,
        consumer_name,
        block_ms,
        read_count,
    } = transport
    else {
        return Err(cdc_error!(
            ErrorKind::ConfigError,
            "Memory transport has no external feed",
            "The service binary reads from redis, the memory transport is only for embedding"
        )
        .into());
    };

    let options = RedisReadOptions {
        consumer_name: consumer_name.clone(),
        block_ms: *block_ms,
        read_count: *read_count,
    };

    let mut sources = vec![];
    match config.input_source().map_err(ApplierError::config)? {
        InputSource::Topics(topics) => {
            for topic in &topics {
                sources.push(RedisChangeSource::topic(url, topic, options.clone()).await?);
            }
        }
        InputSource::Subscriptions(subscriptions) => {
            for subscription in &subscriptions {
                sources.push(
                    RedisChangeSource::subscription(url, subscription, options.clone()).await?,
                );
            }
        }
    }

    Ok(sources)
}

/// Starts a pipeline and shuts it down gracefully on SIGINT or SIGTERM.
#[tracing::instrument(skip_all, fields(%run_id))]
async fn start_pipeline<W>(
    config: ApplierConfig,
    transport: &TransportConfig,
    warehouse: W,
    run_id: Uuid,
) -> ApplierResult<()>
where
    W: Warehouse + Clone + Send + Sync + 'static,
{
    let sources = connect_sources(&config, transport).await?;
    let mut pipeline = Pipeline::with_run_id(config, warehouse, run_id)?;

    let labels = pipeline.descriptor().label_pairs();
    init_metrics(
        labels
            .iter()
            .map(|(key, value)| (key.as_str(), value.as_str())),
    )
    .map_err(ApplierError::config)?;

    pipeline.start(sources).await?;

    // Registered before waiting so an early SIGTERM is not lost.
    let mut sigterm = signal(SignalKind::terminate())?;
    let shutdown_tx = pipeline.shutdown_tx();
    let shutdown_handle = tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("sigint (ctrl+c) received, shutting down pipeline");
            }
            _ = sigterm.recv() => {
                info!("sigterm received, shutting down pipeline");
            }
        }

        if let Err(err) = shutdown_tx.shutdown() {
            warn!(error = ?err, "failed to send shutdown signal");
        }
    });

    let result = pipeline.wait().await;

    // The pipeline may stop on its own, in which case nobody is waiting for a signal anymore.
    shutdown_handle.abort();
    let _ = shutdown_handle.await;

    result?;

    Ok(())
}

fn log_config(config: &ServiceConfig) {
    log_applier_config(&config.applier);
    log_warehouse_config(&config.warehouse);
    log_transport_config(&config.transport);
}

fn log_applier_config(config: &ApplierConfig) {
    debug!(
        input_topics = ?config.input_topics,
        input_subscriptions = ?config.input_subscriptions,
        use_single_topic = config.use_single_topic,
        change_log_dataset = config.change_log_dataset,
        replica_dataset = config.replica_dataset,
        update_frequency_secs = config.update_frequency_secs,
        max_entries_per_merge = ?config.max_entries_per_merge,
        labels = ?config.labels,
        "applier config"
    );
    log_batch_config(&config.batch);
    log_retry_config(&config.retry);
}

fn log_batch_config(config: &BatchConfig) {
    debug!(
        max_size = config.max_size,
        max_fill_ms = config.max_fill_ms,
        "batch config"
    );
}

fn log_retry_config(config: &RetryConfig) {
    debug!(
        max_attempts = config.max_attempts,
        initial_delay_ms = config.initial_delay_ms,
        max_delay_ms = config.max_delay_ms,
        "retry config"
    );
}

fn log_warehouse_config(config: &WarehouseConfig) {
    match config {
        WarehouseConfig::Memory => debug!("using memory warehouse"),
        WarehouseConfig::Postgres {
            connection,
            max_connections,
        } => {
            debug!(max_connections, "using postgres warehouse");
            log_pg_connection_config(connection);
        }
        WarehouseConfig::BigQuery {
            project_id,
            service_account_key_path: _,
        } => debug!(project_id, "using bigquery warehouse"),
    }
}

fn log_pg_connection_config(config: &PgConnectionConfig) {
    debug!(
        host = config.host,
        port = config.port,
        dbname = config.name,
        username = config.username,
        tls_enabled = config.tls.enabled,
        "warehouse postgres connection config",
    );
}

fn log_transport_config(config: &TransportConfig) {
    match config {
        TransportConfig::Memory => debug!("using memory transport"),
        TransportConfig::Redis {
            url: _,
            consumer_name,
            block_ms,
            read_count,
        } => debug!(consumer_name, block_ms, read_count, "using redis transport"),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    fn applier_config() -> ApplierConfig {
        ApplierConfig {
            input_topics: Some(vec!["orders".to_string()]),
            input_subscriptions: None,
            use_single_topic: false,
            change_log_dataset: "changelog".to_string(),
            replica_dataset: "replica".to_string(),
            update_frequency_secs: 95,
            batch: BatchConfig::default(),
            retry: RetryConfig::default(),
            max_entries_per_merge: None,
            labels: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn memory_transport_is_rejected() {
        let err = connect_sources(&applier_config(), &TransportConfig::Memory)
            .await
            .unwrap_err();

        assert!(matches!(err, ApplierError::Cdc(ref err) if err.kind() == ErrorKind::ConfigError));
    }
}
