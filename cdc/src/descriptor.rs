use std::collections::BTreeMap;
use std::time::Duration;

use cdc_config::shared::{ApplierConfig, InputMode};
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Label identifying the engine that produced a run.
pub const ENGINE_LABEL: &str = "cdc-engine";

/// Value of [`ENGINE_LABEL`].
pub const ENGINE_NAME: &str = "change-applier";

/// Label carrying the engine version.
pub const ENGINE_VERSION_LABEL: &str = "cdc-engine-version";

/// Label carrying the input mode of the run.
pub const INPUT_MODE_LABEL: &str = "cdc-input-mode";

/// Immutable description of one pipeline run.
///
/// Built once when the pipeline is created and handed by value to whatever reports on the run:
/// logs, metrics global labels, or the embedding application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunDescriptor {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub input_mode: InputMode,
    pub change_log_dataset: String,
    pub replica_dataset: String,
    pub update_frequency: Duration,
    /// Name of the warehouse implementation.
    pub warehouse: &'static str,
    /// User labels merged with the engine labels. Engine labels win on collision.
    pub labels: BTreeMap<String, String>,
}

impl RunDescriptor {
    pub fn new(config: &ApplierConfig, warehouse: &'static str) -> Self {
        Self::with_run_id(config, warehouse, Uuid::new_v4())
    }

    /// Builds the descriptor of a run whose id was chosen by the caller.
    pub fn with_run_id(config: &ApplierConfig, warehouse: &'static str, run_id: Uuid) -> Self {
        let input_mode = config.input_mode();

        let mut labels = config.labels.clone();
        labels.insert(ENGINE_LABEL.to_string(), ENGINE_NAME.to_string());
        labels.insert(
            ENGINE_VERSION_LABEL.to_string(),
            env!("CARGO_PKG_VERSION").to_string(),
        );
        labels.insert(INPUT_MODE_LABEL.to_string(), input_mode.as_str().to_string());

        Self {
            run_id,
            started_at: Utc::now(),
            input_mode,
            change_log_dataset: config.change_log_dataset.clone(),
            replica_dataset: config.replica_dataset.clone(),
            update_frequency: Duration::from_secs(config.update_frequency_secs),
            warehouse,
            labels,
        }
    }

    /// Returns the labels as owned pairs, in key order.
    pub fn label_pairs(&self) -> Vec<(String, String)> {
        self.labels
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cdc_config::shared::{BatchConfig, RetryConfig};

    fn config() -> ApplierConfig {
        ApplierConfig {
            input_topics: Some(vec!["all_tables".to_string()]),
            input_subscriptions: None,
            use_single_topic: true,
            change_log_dataset: "changelog".to_string(),
            replica_dataset: "replica".to_string(),
            update_frequency_secs: 300,
            batch: BatchConfig::default(),
            retry: RetryConfig::default(),
            max_entries_per_merge: None,
            labels: BTreeMap::from([
                ("team".to_string(), "billing".to_string()),
                (ENGINE_LABEL.to_string(), "spoofed".to_string()),
            ]),
        }
    }

    #[test]
    fn engine_labels_override_user_labels() {
        let descriptor = RunDescriptor::new(&config(), "memory");

        assert_eq!(descriptor.labels["team"], "billing");
        assert_eq!(descriptor.labels[ENGINE_LABEL], ENGINE_NAME);
        assert_eq!(descriptor.labels[INPUT_MODE_LABEL], "single-stream");
        assert_eq!(
            descriptor.labels[ENGINE_VERSION_LABEL],
            env!("CARGO_PKG_VERSION")
        );
        assert_eq!(descriptor.update_frequency, Duration::from_secs(300));
    }

    #[test]
    fn every_run_gets_its_own_id() {
        let config = config();

        assert_ne!(
            RunDescriptor::new(&config, "memory").run_id,
            RunDescriptor::new(&config, "memory").run_id
        );
    }
}
