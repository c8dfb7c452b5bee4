//! Change applier service binary.
//!
//! Reads change records from Redis streams and applies them to the configured warehouse,
//! keeping one changelog and one replica table per source table.

use cdc_config::shared::ServiceConfig;
use cdc_telemetry::tracing::{TopLevelFields, init_tracing_with_top_level_fields};
use tracing::error;
use uuid::Uuid;

use crate::config::load_service_config;
use crate::core::start_applier_with_config;
use crate::error::{ApplierError, ApplierResult};

mod config;
mod core;
mod error;

fn main() {
    if let Err(err) = run() {
        eprint!("{}", err.render_report());
        std::process::exit(1);
    }
}

/// Loads configuration, initializes tracing, and runs the applier on a multi-threaded runtime.
fn run() -> ApplierResult<()> {
    let config = load_service_config()?;

    // Chosen here so that every log line, including the first ones, carries it.
    let run_id = Uuid::new_v4();

    let _log_flusher = init_tracing_with_top_level_fields(
        env!("CARGO_BIN_NAME"),
        TopLevelFields {
            run_id: Some(run_id.to_string()),
            project: config.warehouse.project_id().map(str::to_owned),
        },
    )
    .map_err(ApplierError::config)?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main(config, run_id))
}

async fn async_main(config: ServiceConfig, run_id: Uuid) -> ApplierResult<()> {
    if let Err(err) = start_applier_with_config(config, run_id).await {
        error!("{err}");
        return Err(err);
    }

    Ok(())
}
