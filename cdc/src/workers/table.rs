use std::pin::pin;
use std::sync::Arc;

use cdc_config::shared::ApplierConfig;
use futures::StreamExt;
use metrics::counter;
use tokio::sync::mpsc;
use tracing::{Instrument, debug, error, info, warn};

use crate::concurrency::shutdown::{ShutdownResult, ShutdownRx};
use crate::concurrency::stream::BatchStream;
use crate::error::CdcResult;
use crate::metrics::{CDC_MERGE_FAILURES_TOTAL, ERROR_KIND_LABEL, TABLE_ID_LABEL};
use crate::replication::appender::ChangelogAppender;
use crate::replication::demux::{PendingRecord, TableMessage};
use crate::replication::merger::ReplicaMerger;
use crate::replication::scheduler::MergeScheduler;
use crate::types::TableBinding;
use crate::warehouse::base::Warehouse;
use crate::workers::policy::{RetryDirective, build_error_handling_policy};

/// Branch applying the records of one table.
///
/// The branch prepares the warehouse tables, then runs two loops side by side: the append loop
/// persists incoming records to the changelog and acknowledges them, and the merge loop folds
/// the changelog into the replica on every scheduler trigger. Both loops stop on shutdown. The
/// first fatal error of either loop halts the branch.
#[derive(Debug)]
pub struct TableWorker<W> {
    binding: TableBinding,
    warehouse: W,
    config: Arc<ApplierConfig>,
    rx: mpsc::Receiver<TableMessage>,
    shutdown_rx: ShutdownRx,
}

impl<W> TableWorker<W>
where
    W: Warehouse + Clone + Send + Sync + 'static,
{
    pub fn new(
        binding: TableBinding,
        warehouse: W,
        config: Arc<ApplierConfig>,
        rx: mpsc::Receiver<TableMessage>,
        shutdown_rx: ShutdownRx,
    ) -> Self {
        Self {
            binding,
            warehouse,
            config,
            rx,
            shutdown_rx,
        }
    }

    pub async fn run(self) -> CdcResult<()> {
        let span = tracing::info_span!(
            "table_worker",
            branch = %self.binding.branch_name(),
            table_id = %self.binding.table_id,
            source = %self.binding.source,
        );

        self.run_inner().instrument(span.or_current()).await
    }

    async fn run_inner(self) -> CdcResult<()> {
        info!(
            changelog = %self.binding.changelog,
            replica = %self.binding.replica,
            "starting table branch"
        );

        let scheduler = MergeScheduler::new(self.config.update_frequency_secs)?;
        self.warehouse.prepare_table(&self.binding).await?;

        let appender = ChangelogAppender::new(
            self.binding.clone(),
            self.warehouse.clone(),
            self.config.retry.clone(),
            self.shutdown_rx.clone(),
        );
        let merger = ReplicaMerger::new(
            self.binding.clone(),
            self.warehouse,
            self.config.max_entries_per_merge,
        );

        let result = tokio::try_join!(
            append_loop(appender, self.rx, &self.config, self.shutdown_rx.clone()),
            merge_loop(&self.binding, merger, scheduler, self.shutdown_rx),
        );

        match result {
            Ok(_) => {
                info!("table branch stopped");

                Ok(())
            }
            Err(err) => {
                let policy = build_error_handling_policy(&err);
                error!(
                    error = %err,
                    solution = policy.solution().unwrap_or_default(),
                    "table branch halted"
                );

                Err(err)
            }
        }
    }
}

async fn append_loop<W>(
    mut appender: ChangelogAppender<W>,
    mut rx: mpsc::Receiver<TableMessage>,
    config: &ApplierConfig,
    shutdown_rx: ShutdownRx,
) -> CdcResult<()>
where
    W: Warehouse,
{
    let messages = futures::stream::poll_fn(move |cx| rx.poll_recv(cx));
    let mut batches = pin!(BatchStream::wrap(
        messages,
        config.batch.clone(),
        shutdown_rx
    ));

    while let Some(batch) = batches.next().await {
        match batch {
            ShutdownResult::Ok(messages) => {
                if flush(&mut appender, messages).await?.should_shutdown() {
                    return Ok(());
                }
            }
            ShutdownResult::Shutdown(messages) => {
                info!(buffered = messages.len(), "flushing buffered records before shutdown");
                flush(&mut appender, messages).await?;

                return Ok(());
            }
        }
    }

    debug!("table input closed");

    Ok(())
}

/// Appends the records of `messages` and acknowledges them once durable.
///
/// Records before an undecodable message are still appended and acknowledged, then the decoding
/// error is returned. Nothing is acknowledged when shutdown interrupted the append.
async fn flush<W>(
    appender: &mut ChangelogAppender<W>,
    messages: Vec<TableMessage>,
) -> CdcResult<ShutdownResult<(), ()>>
where
    W: Warehouse,
{
    let mut pending: Vec<PendingRecord> = Vec::with_capacity(messages.len());
    let mut invalid = None;
    for message in messages {
        match message {
            TableMessage::Record(record) => pending.push(record),
            TableMessage::Invalid(err) => {
                invalid = Some(err);
                break;
            }
        }
    }

    let (records, acks): (Vec<_>, Vec<_>) = pending
        .into_iter()
        .map(|pending| (pending.record, pending.ack))
        .unzip();

    if appender.append(records).await?.should_shutdown() {
        return Ok(ShutdownResult::Shutdown(()));
    }

    for ack in acks {
        ack.ack();
    }

    match invalid {
        Some(err) => Err(err),
        None => Ok(ShutdownResult::Ok(())),
    }
}

async fn merge_loop<W>(
    binding: &TableBinding,
    merger: ReplicaMerger<W>,
    mut scheduler: MergeScheduler,
    mut shutdown_rx: ShutdownRx,
) -> CdcResult<()>
where
    W: Warehouse,
{
    loop {
        if scheduler.next_trigger(&mut shutdown_rx).await.should_shutdown() {
            debug!("merge loop stopped by shutdown");

            return Ok(());
        }

        let Err(err) = merger.merge_pass().await else {
            continue;
        };

        counter!(
            CDC_MERGE_FAILURES_TOTAL,
            TABLE_ID_LABEL => binding.table_id.to_string(),
            ERROR_KIND_LABEL => format!("{:?}", err.kind())
        )
        .increment(1);

        // A failed pass committed nothing, so transient failures wait for the next trigger.
        if build_error_handling_policy(&err).retry_directive() == RetryDirective::Timed {
            warn!(
                error = %err,
                next_in_secs = scheduler.interval().as_secs(),
                "merge pass failed, retrying on next trigger"
            );

            continue;
        }

        return Err(err);
    }
}
