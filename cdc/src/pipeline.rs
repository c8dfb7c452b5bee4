use std::sync::Arc;

use cdc_config::shared::{ApplierConfig, InputMode};
use tracing::{error, info};
use uuid::Uuid;

use crate::bail;
use crate::concurrency::shutdown::{ShutdownTx, create_shutdown_channel};
use crate::descriptor::RunDescriptor;
use crate::error::{CdcResult, ErrorKind};
use crate::replication::demux::StreamDemultiplexer;
use crate::transport::ChangeSource;
use crate::warehouse::base::Warehouse;
use crate::workers::base::{Worker, WorkerHandle};
use crate::workers::demux::{DemuxWorker, DemuxWorkerHandle};
use crate::workers::pool::TableWorkerPool;

#[derive(Debug)]
enum PipelineState {
    NotStarted,
    Started {
        demux_workers: Vec<DemuxWorkerHandle>,
        pool: TableWorkerPool,
    },
}

/// Applies change records from one or more sources to a warehouse.
///
/// The configuration is validated on creation. Once started, the pipeline runs until
/// [`Pipeline::shutdown`] is called or every worker stopped.
#[derive(Debug)]
pub struct Pipeline<W> {
    config: Arc<ApplierConfig>,
    descriptor: RunDescriptor,
    warehouse: W,
    state: PipelineState,
    shutdown_tx: ShutdownTx,
}

impl<W> Pipeline<W>
where
    W: Warehouse + Clone + Send + Sync + 'static,
{
    pub fn new(config: ApplierConfig, warehouse: W) -> CdcResult<Self> {
        Self::with_run_id(config, warehouse, Uuid::new_v4())
    }

    /// Creates a pipeline whose run id is already known, e.g. because it was logged before.
    pub fn with_run_id(config: ApplierConfig, warehouse: W, run_id: Uuid) -> CdcResult<Self> {
        config.validate()?;

        let descriptor = RunDescriptor::with_run_id(&config, W::name(), run_id);
        let (shutdown_tx, _) = create_shutdown_channel();

        Ok(Self {
            config: Arc::new(config),
            descriptor,
            warehouse,
            state: PipelineState::NotStarted,
            shutdown_tx,
        })
    }

    pub fn descriptor(&self) -> &RunDescriptor {
        &self.descriptor
    }

    pub fn shutdown_tx(&self) -> ShutdownTx {
        self.shutdown_tx.clone()
    }

    /// Starts one demux worker per source.
    ///
    /// With a shared stream exactly one source is accepted. With dedicated streams every source
    /// feeds the table it is named after.
    pub async fn start<S>(&mut self, sources: Vec<S>) -> CdcResult<()>
    where
        S: ChangeSource,
    {
        if matches!(self.state, PipelineState::Started { .. }) {
            bail!(ErrorKind::InvalidState, "Pipeline already started");
        }

        let input_mode = self.config.input_mode();
        match (input_mode, sources.len()) {
            (_, 0) => bail!(
                ErrorKind::ConfigError,
                "No input source",
                "At least one topic or subscription must be provided"
            ),
            (InputMode::SingleStream, count) if count > 1 => bail!(
                ErrorKind::ConfigError,
                "Too many input sources for a shared stream",
                format!("use_single_topic requires exactly one source but {count} were provided")
            ),
            _ => {}
        }

        info!(
            run_id = %self.descriptor.run_id,
            input_mode = %input_mode,
            sources = sources.len(),
            warehouse = self.descriptor.warehouse,
            labels = ?self.descriptor.labels,
            "starting pipeline"
        );

        let pool = TableWorkerPool::new();
        let mut demux_workers = Vec::with_capacity(sources.len());
        for source in sources {
            let demux = StreamDemultiplexer::new(input_mode, source.name());
            let worker = DemuxWorker::new(
                source,
                demux,
                self.config.clone(),
                pool.clone(),
                self.warehouse.clone(),
                self.shutdown_tx.subscribe(),
            );

            demux_workers.push(worker.start().await?);
        }

        self.state = PipelineState::Started {
            demux_workers,
            pool,
        };

        Ok(())
    }

    /// Waits for every worker to stop and aggregates their errors.
    pub async fn wait(self) -> CdcResult<()> {
        let PipelineState::Started {
            demux_workers,
            pool,
        } = self.state
        else {
            info!("pipeline was not started, nothing to wait for");

            return Ok(());
        };

        let mut errors = vec![];

        // Demux workers go first since they are the only ones spawning table workers.
        for demux_worker in demux_workers {
            let worker_type = demux_worker.worker_type().clone();
            if let Err(err) = demux_worker.wait().await {
                error!(worker = %worker_type, error = %err, "demux worker failed");
                errors.push(err);
            }
        }

        if !errors.is_empty() {
            // Table workers cannot receive anything anymore, so they are stopped as well.
            let _ = self.shutdown_tx.shutdown();

            info!("demux workers failed, shutting down table workers");
        }

        info!("waiting for table workers to complete");

        if let Err(err) = pool.wait_all().await {
            info!(failed = err.kinds().len(), "table workers failed");
            errors.push(err);
        }

        if let Err(err) = self.warehouse.shutdown().await {
            errors.push(err);
        }

        if !errors.is_empty() {
            return Err(errors.into());
        }

        info!(run_id = %self.descriptor.run_id, "pipeline stopped");

        Ok(())
    }

    pub fn shutdown(&self) {
        info!("trying to shut down the pipeline");

        if let Err(err) = self.shutdown_tx.shutdown() {
            error!("failed to send shutdown signal to the pipeline: {}", err);
            return;
        }

        info!("shut down signal successfully sent to all workers");
    }

    pub async fn shutdown_and_wait(self) -> CdcResult<()> {
        self.shutdown();
        self.wait().await
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use cdc_config::shared::{BatchConfig, RetryConfig};

    use super::*;
    use crate::transport::memory::MemoryChangeSource;
    use crate::warehouse::memory::MemoryWarehouse;

    fn config() -> ApplierConfig {
        ApplierConfig {
            input_topics: Some(vec!["all_tables".to_string()]),
            input_subscriptions: None,
            use_single_topic: true,
            change_log_dataset: "changelog".to_string(),
            replica_dataset: "replica".to_string(),
            update_frequency_secs: 95,
            batch: BatchConfig::default(),
            retry: RetryConfig::default(),
            max_entries_per_merge: None,
            labels: BTreeMap::new(),
        }
    }

    #[test]
    fn invalid_configuration_is_fatal() {
        let mut config = config();
        config.update_frequency_secs = 94;

        let err = Pipeline::new(config, MemoryWarehouse::new()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConfigError);
    }

    #[tokio::test]
    async fn shared_stream_accepts_a_single_source() {
        let mut pipeline = Pipeline::new(config(), MemoryWarehouse::new()).unwrap();
        let (first, _first_publisher) = MemoryChangeSource::new("a");
        let (second, _second_publisher) = MemoryChangeSource::new("b");

        let err = pipeline.start(vec![first, second]).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConfigError);
    }

    #[test]
    fn run_id_chosen_by_the_caller_is_kept() {
        let run_id = Uuid::new_v4();
        let pipeline = Pipeline::with_run_id(config(), MemoryWarehouse::new(), run_id).unwrap();

        assert_eq!(pipeline.descriptor().run_id, run_id);
    }

    #[tokio::test]
    async fn waiting_on_a_pipeline_that_never_started_returns() {
        let pipeline = Pipeline::new(config(), MemoryWarehouse::new()).unwrap();

        assert!(pipeline.wait().await.is_ok());
    }
}
