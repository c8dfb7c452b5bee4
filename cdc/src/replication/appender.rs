use cdc_config::shared::RetryConfig;
use metrics::{counter, histogram};
use tracing::{debug, error, warn};

use crate::cdc_error;
use crate::concurrency::backoff::retry_delay;
use crate::concurrency::shutdown::{ShutdownResult, ShutdownRx};
use crate::error::{CdcResult, ErrorKind};
use crate::failpoints::{APPEND_CHANGES__BEFORE_WRITE, cdc_fail_point};
use crate::metrics::{
    CDC_APPEND_BATCH_SIZE, CDC_APPEND_RETRIES_TOTAL, CDC_DUPLICATES_SKIPPED_TOTAL,
    CDC_RECORDS_APPENDED_TOTAL, ERROR_KIND_LABEL, TABLE_ID_LABEL,
};
use crate::types::{AppendOutcome, ChangeRecord, TableBinding};
use crate::warehouse::base::ChangelogStore;
use crate::workers::policy::{RetryDirective, build_error_handling_policy};

/// Writes the records of one table to its changelog.
///
/// Appends are idempotent: records whose (table, primary key, ordering token, kind) is already
/// durable are dropped by the store without consuming a sequence number. Failed appends that are
/// classified as transient are retried with the whole batch, so no record is ever skipped.
#[derive(Debug)]
pub struct ChangelogAppender<S> {
    binding: TableBinding,
    store: S,
    retry: RetryConfig,
    shutdown_rx: ShutdownRx,
}

impl<S> ChangelogAppender<S>
where
    S: ChangelogStore,
{
    pub fn new(binding: TableBinding, store: S, retry: RetryConfig, shutdown_rx: ShutdownRx) -> Self {
        Self {
            binding,
            store,
            retry,
            shutdown_rx,
        }
    }

    /// Appends `records` in the given order.
    ///
    /// Returns [`ShutdownResult::Shutdown`] when shutdown interrupted a retry wait, in which case
    /// the records may or may not be durable. Fails with [`ErrorKind::RetriesExhausted`] once
    /// `max_attempts` transient failures happened in a row, and immediately on any other error.
    pub async fn append(
        &mut self,
        records: Vec<ChangeRecord>,
    ) -> CdcResult<ShutdownResult<AppendOutcome, ()>> {
        if records.is_empty() {
            return Ok(ShutdownResult::Ok(AppendOutcome::default()));
        }

        let table_id = self.binding.table_id.to_string();
        histogram!(CDC_APPEND_BATCH_SIZE, TABLE_ID_LABEL => table_id.clone())
            .record(records.len() as f64);

        let mut attempt = 0;
        loop {
            let result = match cdc_fail_point(APPEND_CHANGES__BEFORE_WRITE) {
                Ok(()) => {
                    self.store
                        .append_changes(&self.binding, records.clone())
                        .await
                }
                Err(err) => Err(err),
            };

            let err = match result {
                Ok(outcome) => {
                    counter!(CDC_RECORDS_APPENDED_TOTAL, TABLE_ID_LABEL => table_id.clone())
                        .increment(outcome.appended);
                    counter!(CDC_DUPLICATES_SKIPPED_TOTAL, TABLE_ID_LABEL => table_id)
                        .increment(outcome.duplicates);

                    debug!(
                        table_id = %self.binding.table_id,
                        appended = outcome.appended,
                        duplicates = outcome.duplicates,
                        last_sequence = outcome.last_sequence,
                        "appended batch to changelog"
                    );

                    return Ok(ShutdownResult::Ok(outcome));
                }
                Err(err) => err,
            };

            let policy = build_error_handling_policy(&err);
            if policy.retry_directive() != RetryDirective::Timed {
                error!(
                    table_id = %self.binding.table_id,
                    error = %err,
                    "changelog append failed with a non retryable error"
                );

                return Err(err);
            }

            attempt += 1;
            if attempt >= self.retry.max_attempts {
                error!(
                    table_id = %self.binding.table_id,
                    attempts = attempt,
                    "changelog append retries exhausted"
                );

                return Err(cdc_error!(
                    ErrorKind::RetriesExhausted,
                    "Changelog append retries exhausted",
                    format!(
                        "Appending {} records to table '{}' failed {attempt} times",
                        records.len(),
                        self.binding.table_id
                    ),
                    source: err
                ));
            }

            counter!(
                CDC_APPEND_RETRIES_TOTAL,
                TABLE_ID_LABEL => table_id.clone(),
                ERROR_KIND_LABEL => format!("{:?}", err.kind())
            )
            .increment(1);

            let delay = retry_delay(&self.retry, attempt - 1);
            warn!(
                table_id = %self.binding.table_id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "changelog append failed, retrying"
            );

            tokio::select! {
                biased;

                _ = self.shutdown_rx.changed() => {
                    warn!(table_id = %self.binding.table_id, "changelog append retry interrupted by shutdown");

                    return Ok(ShutdownResult::Shutdown(()));
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concurrency::shutdown::create_shutdown_channel;
    use crate::test_utils::record::{binding, insert, update};
    use crate::test_utils::test_warehouse_wrapper::TestWarehouseWrapper;
    use crate::warehouse::memory::MemoryWarehouse;

    fn retry(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            initial_delay_ms: 10,
            max_delay_ms: 100,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried_with_the_same_records() {
        let warehouse = TestWarehouseWrapper::wrap(MemoryWarehouse::new());
        warehouse
            .fail_next_appends(2, ErrorKind::WarehouseConnectionFailed)
            .await;
        let (_shutdown_tx, shutdown_rx) = create_shutdown_channel();
        let mut appender =
            ChangelogAppender::new(binding("orders"), warehouse.clone(), retry(5), shutdown_rx);

        let outcome = appender
            .append(vec![insert(1, 10), update(1, 11)])
            .await
            .unwrap();

        assert_eq!(
            outcome,
            ShutdownResult::Ok(AppendOutcome {
                appended: 2,
                duplicates: 0,
                last_sequence: 2,
            })
        );
        assert_eq!(warehouse.append_attempts().await, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_are_fatal() {
        let warehouse = TestWarehouseWrapper::wrap(MemoryWarehouse::new());
        warehouse
            .fail_next_appends(10, ErrorKind::WarehouseConnectionFailed)
            .await;
        let (_shutdown_tx, shutdown_rx) = create_shutdown_channel();
        let mut appender =
            ChangelogAppender::new(binding("orders"), warehouse.clone(), retry(3), shutdown_rx);

        let err = appender.append(vec![insert(1, 10)]).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::RetriesExhausted);
        assert_eq!(warehouse.append_attempts().await, 3);
        assert!(warehouse.inner().changelog(&"orders".into()).await.is_empty());
    }

    #[tokio::test]
    async fn permanent_failures_are_not_retried() {
        let warehouse = TestWarehouseWrapper::wrap(MemoryWarehouse::new());
        warehouse
            .fail_next_appends(1, ErrorKind::WarehouseQueryFailed)
            .await;
        let (_shutdown_tx, shutdown_rx) = create_shutdown_channel();
        let mut appender =
            ChangelogAppender::new(binding("orders"), warehouse.clone(), retry(5), shutdown_rx);

        let err = appender.append(vec![insert(1, 10)]).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::WarehouseQueryFailed);
        assert_eq!(warehouse.append_attempts().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_interrupts_retry_wait() {
        let warehouse = TestWarehouseWrapper::wrap(MemoryWarehouse::new());
        warehouse
            .fail_next_appends(10, ErrorKind::WarehouseConnectionFailed)
            .await;
        let (shutdown_tx, shutdown_rx) = create_shutdown_channel();
        let mut appender =
            ChangelogAppender::new(binding("orders"), warehouse.clone(), retry(10), shutdown_rx);
        shutdown_tx.shutdown().unwrap();

        let outcome = appender.append(vec![insert(1, 10)]).await.unwrap();

        assert_eq!(outcome, ShutdownResult::Shutdown(()));
        assert_eq!(warehouse.append_attempts().await, 1);
    }
}
