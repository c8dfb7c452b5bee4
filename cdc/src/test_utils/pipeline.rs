use std::collections::BTreeMap;

use cdc_config::shared::{ApplierConfig, BatchConfig, RetryConfig};

use crate::error::CdcResult;
use crate::pipeline::Pipeline;
use crate::test_utils::record::{CHANGELOG_DATASET, REPLICA_DATASET};
use crate::warehouse::base::Warehouse;

/// Seconds between merge passes in test pipelines, the smallest accepted value.
pub const TEST_UPDATE_FREQUENCY_SECS: u64 = 95;

/// Returns a configuration reading `topics`, merging every 95 seconds.
///
/// With `single_topic` the first topic is read as a shared stream.
pub fn test_config(topics: &[&str], single_topic: bool) -> ApplierConfig {
    ApplierConfig {
        input_topics: Some(topics.iter().map(|topic| topic.to_string()).collect()),
        input_subscriptions: None,
        use_single_topic: single_topic,
        change_log_dataset: CHANGELOG_DATASET.to_string(),
        replica_dataset: REPLICA_DATASET.to_string(),
        update_frequency_secs: TEST_UPDATE_FREQUENCY_SECS,
        batch: BatchConfig {
            max_size: 100,
            max_fill_ms: 50,
        },
        retry: RetryConfig {
            max_attempts: 3,
            initial_delay_ms: 10,
            max_delay_ms: 100,
        },
        max_entries_per_merge: None,
        labels: BTreeMap::from([("env".to_string(), "test".to_string())]),
    }
}

/// Creates a pipeline over `warehouse` with [`test_config`].
pub fn create_pipeline<W>(
    topics: &[&str],
    single_topic: bool,
    warehouse: W,
) -> CdcResult<Pipeline<W>>
where
    W: Warehouse + Clone + Send + Sync + 'static,
{
    Pipeline::new(test_config(topics, single_topic), warehouse)
}
