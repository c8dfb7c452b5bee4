use std::fmt;
use std::future::Future;

use crate::error::CdcResult;
use crate::types::TableId;

/// Kinds of workers run by a pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerType {
    /// Reads one transport source and routes its records to table workers.
    Demux {
        /// Name of the source stream.
        source: String,
    },
    /// Appends and merges the records of one table.
    Table { table_id: TableId },
}

impl fmt::Display for WorkerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerType::Demux { source } => write!(f, "demux({source})"),
            WorkerType::Table { table_id } => write!(f, "table({table_id})"),
        }
    }
}

/// A worker that can be started in the background.
pub trait Worker<H>
where
    H: WorkerHandle,
{
    /// Starts the worker and returns a handle to wait for it.
    fn start(self) -> impl Future<Output = CdcResult<H>> + Send;
}

/// Handle of a running worker.
pub trait WorkerHandle {
    fn worker_type(&self) -> &WorkerType;

    /// Waits for the worker to finish and returns its result.
    fn wait(self) -> impl Future<Output = CdcResult<()>> + Send;
}
