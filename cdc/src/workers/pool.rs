use std::collections::HashMap;
use std::future::Future;
use std::ops::Deref;
use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};
use tokio::task::{AbortHandle, JoinSet};
use tracing::{debug, error, warn};

use crate::cdc_error;
use crate::error::{CdcResult, ErrorKind};
use crate::replication::demux::TableMessage;
use crate::types::TableId;

/// Handle of a table worker living in a [`TableWorkerPool`].
#[derive(Debug)]
pub struct TableWorkerHandle {
    tx: mpsc::Sender<TableMessage>,
    abort_handle: AbortHandle,
}

impl TableWorkerHandle {
    /// Returns a sender into the worker input, `None` once the worker finished.
    pub fn sender(&self) -> Option<mpsc::Sender<TableMessage>> {
        (!self.is_finished()).then(|| self.tx.clone())
    }

    pub fn is_finished(&self) -> bool {
        self.abort_handle.is_finished() || self.tx.is_closed()
    }
}

/// Internal state of [`TableWorkerPool`].
#[derive(Debug)]
pub struct TableWorkerPoolInner {
    /// Every table worker ever spawned, including finished ones.
    workers: HashMap<TableId, TableWorkerHandle>,
    join_set: JoinSet<(TableId, CdcResult<()>)>,
}

impl TableWorkerPoolInner {
    fn new() -> Self {
        Self {
            workers: HashMap::new(),
            join_set: JoinSet::new(),
        }
    }

    /// Spawns the worker of `table_id` feeding on the channel behind `tx`.
    ///
    /// A table gets at most one worker per run. A worker that halted is not replaced, so this
    /// does nothing when `table_id` already has one.
    pub fn spawn<F>(&mut self, table_id: TableId, tx: mpsc::Sender<TableMessage>, future: F)
    where
        F: Future<Output = CdcResult<()>> + Send + 'static,
    {
        if self.workers.contains_key(&table_id) {
            warn!(%table_id, "table worker already exists in pool");

            return;
        }

        let worker_table_id = table_id.clone();
        let abort_handle = self.join_set.spawn(async move {
            let result = future.await;
            (worker_table_id, result)
        });

        self.workers
            .insert(table_id.clone(), TableWorkerHandle { tx, abort_handle });

        debug!(%table_id, "spawned table worker in pool");
    }

    pub fn get(&self, table_id: &TableId) -> Option<&TableWorkerHandle> {
        self.workers.get(table_id)
    }
}

/// Supervises the table workers of a pipeline, keyed by table.
#[derive(Debug, Clone)]
pub struct TableWorkerPool {
    inner: Arc<Mutex<TableWorkerPoolInner>>,
}

impl TableWorkerPool {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(TableWorkerPoolInner::new())),
        }
    }

    /// Waits for every table worker to finish.
    ///
    /// Must only be called once no more workers can be spawned. Errors of all failed workers are
    /// aggregated into the returned error.
    pub async fn wait_all(&self) -> CdcResult<()> {
        let mut errors = Vec::new();

        loop {
            let result = {
                let mut inner = self.inner.lock().await;
                inner.join_set.join_next().await
            };

            let Some(result) = result else {
                break;
            };

            match result {
                Ok((table_id, Err(err))) => {
                    error!(%table_id, error = %err, "table worker completed with error");
                    errors.push(err);
                }
                Ok((table_id, Ok(()))) => {
                    debug!(%table_id, "table worker completed");
                }
                Err(join_err) => {
                    if join_err.is_cancelled() {
                        debug!("table worker task was cancelled");
                    } else {
                        errors.push(cdc_error!(
                            ErrorKind::TableWorkerPanic,
                            "Table worker panicked",
                            join_err
                        ));
                    }
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors.into())
        }
    }
}

impl Default for TableWorkerPool {
    fn default() -> Self {
        Self::new()
    }
}

impl Deref for TableWorkerPool {
    type Target = Mutex<TableWorkerPoolInner>;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}
