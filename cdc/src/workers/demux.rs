use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use cdc_config::shared::ApplierConfig;
use metrics::counter;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info, warn};

use crate::cdc_error;
use crate::concurrency::backoff::retry_delay;
use crate::concurrency::shutdown::ShutdownRx;
use crate::error::{CdcError, CdcResult, ErrorKind};
use crate::metrics::{
    CDC_UNDELIVERED_MESSAGES_TOTAL, CDC_UNROUTABLE_MESSAGES_TOTAL, SOURCE_LABEL, TABLE_ID_LABEL,
};
use crate::replication::demux::{
    AckHandle, PendingRecord, RouteDecision, StreamDemultiplexer, TableMessage,
};
use crate::transport::{ChangeSource, SourceMessage};
use crate::types::{TableBinding, TableId};
use crate::warehouse::base::Warehouse;
use crate::workers::base::{Worker, WorkerHandle, WorkerType};
use crate::workers::policy::{RetryDirective, build_error_handling_policy};
use crate::workers::pool::TableWorkerPool;
use crate::workers::table::TableWorker;

/// Handle of a running [`DemuxWorker`].
#[derive(Debug)]
pub struct DemuxWorkerHandle {
    worker_type: WorkerType,
    handle: Option<JoinHandle<CdcResult<()>>>,
}

impl WorkerHandle for DemuxWorkerHandle {
    fn worker_type(&self) -> &WorkerType {
        &self.worker_type
    }

    async fn wait(mut self) -> CdcResult<()> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };

        handle
            .await
            .map_err(|err| cdc_error!(ErrorKind::DemuxWorkerPanic, "Demux worker panicked", err))??;

        Ok(())
    }
}

/// Reads one transport source and feeds the table workers.
///
/// Table workers are spawned into the pool the first time a table is seen. Messages are
/// acknowledged on the source once their table worker made them durable. Messages that cannot be
/// routed, or whose table worker halted, stay unacknowledged.
#[derive(Debug)]
pub struct DemuxWorker<S, W> {
    source: S,
    router: TableRouter<W>,
    shutdown_rx: ShutdownRx,
}

impl<S, W> DemuxWorker<S, W> {
    pub fn new(
        source: S,
        demux: StreamDemultiplexer,
        config: Arc<ApplierConfig>,
        pool: TableWorkerPool,
        warehouse: W,
        shutdown_rx: ShutdownRx,
    ) -> Self {
        let router = TableRouter {
            demux,
            config,
            pool,
            warehouse,
            shutdown_rx: shutdown_rx.clone(),
        };

        Self {
            source,
            router,
            shutdown_rx,
        }
    }
}

/// Routes decoded messages to the table workers, spawning them on first sight.
#[derive(Debug)]
struct TableRouter<W> {
    demux: StreamDemultiplexer,
    config: Arc<ApplierConfig>,
    pool: TableWorkerPool,
    warehouse: W,
    shutdown_rx: ShutdownRx,
}

impl<S, W> Worker<DemuxWorkerHandle> for DemuxWorker<S, W>
where
    S: ChangeSource,
    W: Warehouse + Clone + Send + Sync + 'static,
{
    async fn start(self) -> CdcResult<DemuxWorkerHandle> {
        let worker_type = WorkerType::Demux {
            source: self.router.demux.source().to_string(),
        };
        info!(worker = %worker_type, input_mode = %self.router.config.input_mode(), "starting demux worker");

        let span = tracing::info_span!("demux_worker", source = %self.router.demux.source());
        let handle = tokio::spawn(self.run().instrument(span.or_current()));

        Ok(DemuxWorkerHandle {
            worker_type,
            handle: Some(handle),
        })
    }
}

impl<S, W> DemuxWorker<S, W>
where
    S: ChangeSource,
    W: Warehouse + Clone + Send + Sync + 'static,
{
    async fn run(mut self) -> CdcResult<()> {
        let (ack_tx, mut ack_rx) = mpsc::unbounded_channel();
        let mut senders: HashMap<TableId, mpsc::Sender<TableMessage>> = HashMap::new();
        let mut failed_reads = 0;

        loop {
            self.flush_acks(&mut ack_rx).await?;

            let received = tokio::select! {
                biased;

                _ = self.shutdown_rx.changed() => {
                    info!("shutting down demux worker");
                    break;
                }
                received = self.source.receive() => received,
            };

            let messages = match received {
                Ok(Some(messages)) => {
                    failed_reads = 0;
                    messages
                }
                Ok(None) => {
                    info!("source exhausted");
                    break;
                }
                Err(err) => {
                    failed_reads += 1;
                    let delay = self.router.read_retry_delay(err, failed_reads)?;

                    tokio::select! {
                        biased;

                        _ = self.shutdown_rx.changed() => {
                            info!("shutting down demux worker");
                            break;
                        }
                        _ = tokio::time::sleep(delay) => continue,
                    }
                }
            };

            for message in messages {
                self.router.dispatch(message, &ack_tx, &mut senders).await;
            }
        }

        // Acknowledgements are still owed for records in flight in the table workers. The
        // channel closes once every table worker dropped the handles it received.
        drop(senders);
        drop(ack_tx);

        let mut pending = 0;
        while let Some(message_id) = ack_rx.recv().await {
            let mut message_ids = vec![message_id];
            while let Ok(message_id) = ack_rx.try_recv() {
                message_ids.push(message_id);
            }
            pending += message_ids.len();

            if let Err(err) = self.source.ack(message_ids).await {
                warn!(error = %err, "failed to acknowledge messages while draining");
            }
        }

        info!(drained_acks = pending, "demux worker stopped");

        Ok(())
    }

    /// Acknowledges every message made durable since the last call.
    async fn flush_acks(&mut self, ack_rx: &mut mpsc::UnboundedReceiver<String>) -> CdcResult<()> {
        let mut message_ids = Vec::new();
        while let Ok(message_id) = ack_rx.try_recv() {
            message_ids.push(message_id);
        }

        if message_ids.is_empty() {
            return Ok(());
        }

        let count = message_ids.len();
        match self.source.ack(message_ids).await {
            Ok(()) => {
                debug!(count, "acknowledged messages");

                Ok(())
            }
            // Unacknowledged messages are redelivered and dropped as duplicates on append.
            Err(err) if build_error_handling_policy(&err).retry_directive() == RetryDirective::Timed => {
                warn!(error = %err, count, "failed to acknowledge messages, they will be redelivered");

                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}

impl<W> TableRouter<W>
where
    W: Warehouse + Clone + Send + Sync + 'static,
{
    /// Decides how long to wait after a failed read, or fails the worker.
    fn read_retry_delay(&self, err: CdcError, failed_reads: u32) -> CdcResult<Duration> {
        if build_error_handling_policy(&err).retry_directive() != RetryDirective::Timed {
            error!(error = %err, "reading the source failed");

            return Err(err);
        }

        if failed_reads >= self.config.retry.max_attempts {
            return Err(cdc_error!(
                ErrorKind::RetriesExhausted,
                "Source read retries exhausted",
                format!(
                    "Reading '{}' failed {failed_reads} times in a row",
                    self.demux.source()
                ),
                source: err
            ));
        }

        let delay = retry_delay(&self.config.retry, failed_reads - 1);
        warn!(
            error = %err,
            attempt = failed_reads,
            delay_ms = delay.as_millis() as u64,
            "reading the source failed, retrying"
        );

        Ok(delay)
    }

    async fn dispatch(
        &self,
        message: SourceMessage,
        ack_tx: &mpsc::UnboundedSender<String>,
        senders: &mut HashMap<TableId, mpsc::Sender<TableMessage>>,
    ) {
        let (table_id, table_message) = match self.demux.route(&message) {
            RouteDecision::Unroutable(err) => {
                counter!(CDC_UNROUTABLE_MESSAGES_TOTAL, SOURCE_LABEL => self.demux.source().to_string())
                    .increment(1);
                warn!(message_id = %message.id, error = %err, "leaving unroutable message unacknowledged");

                return;
            }
            RouteDecision::Route {
                table_id,
                record: Ok(record),
            } => {
                let ack = AckHandle::new(message.id, ack_tx.clone());
                (table_id, TableMessage::Record(PendingRecord { record, ack }))
            }
            RouteDecision::Route {
                table_id,
                record: Err(err),
            } => {
                warn!(%table_id, message_id = %message.id, error = %err, "message could not be decoded");
                (table_id, TableMessage::Invalid(err))
            }
        };

        let sender = match senders.get(&table_id) {
            Some(sender) => Some(sender.clone()),
            None => self.table_sender(&table_id).await,
        };

        let delivered = match sender {
            Some(sender) => {
                // Waits while the table's input is full. A table stuck retrying its appends
                // therefore pauses the whole source, and nothing is buffered past the channel.
                let delivered = sender.send(table_message).await.is_ok();
                if delivered {
                    senders.insert(table_id.clone(), sender);
                } else {
                    senders.remove(&table_id);
                }
                delivered
            }
            None => false,
        };

        if !delivered {
            counter!(CDC_UNDELIVERED_MESSAGES_TOTAL, TABLE_ID_LABEL => table_id.to_string())
                .increment(1);
            debug!(%table_id, "table worker halted, leaving message unacknowledged");
        }
    }

    /// Returns the input of the table worker of `table_id`, spawning the worker if the table is
    /// new. Returns `None` when the worker already halted.
    async fn table_sender(&self, table_id: &TableId) -> Option<mpsc::Sender<TableMessage>> {
        let mut pool = self.pool.lock().await;
        if let Some(handle) = pool.get(table_id) {
            return handle.sender();
        }

        let binding = TableBinding::new(
            table_id.clone(),
            self.demux.source(),
            &self.config.change_log_dataset,
            &self.config.replica_dataset,
            Duration::from_secs(self.config.update_frequency_secs),
        );
        info!(%table_id, branch = %binding.branch_name(), "observed new table");

        let (tx, rx) = mpsc::channel(self.config.batch.max_size.max(1));
        let worker = TableWorker::new(
            binding,
            self.warehouse.clone(),
            self.config.clone(),
            rx,
            self.shutdown_rx.clone(),
        );
        pool.spawn(table_id.clone(), tx.clone(), worker.run());

        Some(tx)
    }
}
