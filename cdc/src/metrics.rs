//! Metric names and labels recorded by the engine.

/// Label for the table identifier.
pub const TABLE_ID_LABEL: &str = "table_id";

/// Label for the source stream name.
pub const SOURCE_LABEL: &str = "source";

/// Label for the error kind.
pub const ERROR_KIND_LABEL: &str = "error_kind";

// Changelog metrics

/// Counter of changelog entries created.
pub const CDC_RECORDS_APPENDED_TOTAL: &str = "cdc_records_appended_total";

/// Counter of redelivered records dropped as duplicates.
pub const CDC_DUPLICATES_SKIPPED_TOTAL: &str = "cdc_duplicates_skipped_total";

/// Counter of failed append attempts that were retried.
pub const CDC_APPEND_RETRIES_TOTAL: &str = "cdc_append_retries_total";

/// Histogram of batch sizes handed to the changelog.
pub const CDC_APPEND_BATCH_SIZE: &str = "cdc_append_batch_size";

// Merge metrics

/// Counter of committed merge passes.
pub const CDC_MERGE_PASSES_TOTAL: &str = "cdc_merge_passes_total";

/// Counter of changelog entries folded into replicas.
pub const CDC_MERGED_ENTRIES_TOTAL: &str = "cdc_merged_entries_total";

/// Counter of winners skipped because the replica already held a newer version.
pub const CDC_STALE_WINNERS_TOTAL: &str = "cdc_stale_winners_total";

/// Histogram of merge pass durations in seconds.
pub const CDC_MERGE_DURATION_SECONDS: &str = "cdc_merge_duration_seconds";

/// Counter of failed merge passes.
pub const CDC_MERGE_FAILURES_TOTAL: &str = "cdc_merge_failures_total";

// Transport metrics

/// Counter of messages no table could be derived for.
pub const CDC_UNROUTABLE_MESSAGES_TOTAL: &str = "cdc_unroutable_messages_total";

/// Counter of messages left unacknowledged because their table branch stopped.
pub const CDC_UNDELIVERED_MESSAGES_TOTAL: &str = "cdc_undelivered_messages_total";
