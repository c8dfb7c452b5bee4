use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::shared::{BatchConfig, RetryConfig, ValidationError};

/// Seconds in one day.
pub const SECONDS_PER_DAY: u64 = 24 * 60 * 60;

/// Merge operations the warehouse accepts per table per day.
pub const MAX_MERGES_PER_TABLE_PER_DAY: u64 = 1000;

/// Smallest accepted `update_frequency_secs`.
///
/// The daily ceiling spread over a day, with a 10% margin for scheduling jitter, rounded to the
/// nearest second: `round(86 * 1.10) = 95`.
pub const MINIMUM_UPDATE_FREQUENCY_SECS: u64 =
    ((SECONDS_PER_DAY / MAX_MERGES_PER_TABLE_PER_DAY) * 110 + 50) / 100;

/// Maximum length of a label key or value.
const MAX_LABEL_LENGTH: usize = 63;

/// Where change records are read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputSource {
    /// Streams tailed from their current end, without acknowledgements.
    Topics(Vec<String>),
    /// Durable subscriptions that redeliver until acknowledged.
    Subscriptions(Vec<String>),
}

impl InputSource {
    /// Returns the configured names regardless of source kind.
    pub fn names(&self) -> &[String] {
        match self {
            InputSource::Topics(names) | InputSource::Subscriptions(names) => names,
        }
    }
}

/// How incoming streams map to tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InputMode {
    /// One shared stream whose messages each name their table.
    SingleStream,
    /// One stream per table, named after the table.
    PerTableStreams,
}

impl InputMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            InputMode::SingleStream => "single-stream",
            InputMode::PerTableStreams => "per-table-streams",
        }
    }
}

impl fmt::Display for InputMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Options controlling how change records are applied to the warehouse.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ApplierConfig {
    /// Topics where change records are published.
    #[serde(default)]
    pub input_topics: Option<Vec<String>>,
    /// Subscriptions where change records are available.
    #[serde(default)]
    pub input_subscriptions: Option<Vec<String>>,
    /// Reads every table from a single shared stream.
    #[serde(default)]
    pub use_single_topic: bool,
    /// Namespace holding the changelog tables.
    pub change_log_dataset: String,
    /// Namespace holding the replica tables.
    pub replica_dataset: String,
    /// Seconds between two merge passes of the same table.
    pub update_frequency_secs: u64,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    /// Caps how many changelog entries one merge pass folds. Unbounded when unset.
    #[serde(default)]
    pub max_entries_per_merge: Option<usize>,
    /// Operational labels attached to the run.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl ApplierConfig {
    /// Validates every option, returning the first violation found.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let input_source = self.input_source()?;

        if self.use_single_topic && input_source.names().len() != 1 {
            return Err(ValidationError::SingleTopicRequiresOneSource {
                configured: input_source.names().len(),
            });
        }

        if self.update_frequency_secs < MINIMUM_UPDATE_FREQUENCY_SECS {
            return Err(ValidationError::UpdateFrequencyTooLow {
                configured: self.update_frequency_secs,
                minimum: MINIMUM_UPDATE_FREQUENCY_SECS,
                max_merges_per_day: MAX_MERGES_PER_TABLE_PER_DAY,
            });
        }

        validate_identifier("change_log_dataset", &self.change_log_dataset)?;
        validate_identifier("replica_dataset", &self.replica_dataset)?;

        if self.max_entries_per_merge == Some(0) {
            return Err(ValidationError::InvalidFieldValue {
                field: "max_entries_per_merge".to_string(),
                constraint: "must be greater than 0 when set".to_string(),
            });
        }

        self.batch.validate()?;
        self.retry.validate()?;

        for (key, value) in &self.labels {
            validate_label(key, value)?;
        }

        Ok(())
    }

    /// Resolves the mutually exclusive topic and subscription options.
    ///
    /// Empty lists count as unset.
    pub fn input_source(&self) -> Result<InputSource, ValidationError> {
        let topics = non_empty(&self.input_topics);
        let subscriptions = non_empty(&self.input_subscriptions);

        let source = match (topics, subscriptions) {
            (Some(_), Some(_)) => return Err(ValidationError::ConflictingInputSources),
            (None, None) => return Err(ValidationError::MissingInputSource),
            (Some(topics), None) => InputSource::Topics(topics),
            (None, Some(subscriptions)) => InputSource::Subscriptions(subscriptions),
        };

        if source.names().iter().any(|name| name.is_empty()) {
            return Err(ValidationError::InvalidFieldValue {
                field: match source {
                    InputSource::Topics(_) => "input_topics".to_string(),
                    InputSource::Subscriptions(_) => "input_subscriptions".to_string(),
                },
                constraint: "names must not be empty".to_string(),
            });
        }

        Ok(source)
    }

    pub fn input_mode(&self) -> InputMode {
        if self.use_single_topic {
            InputMode::SingleStream
        } else {
            InputMode::PerTableStreams
        }
    }
}

fn non_empty(names: &Option<Vec<String>>) -> Option<Vec<String>> {
    let names: Vec<String> = names
        .as_deref()?
        .iter()
        .map(|name| name.trim().to_string())
        .collect();

    (!names.is_empty()).then_some(names)
}

fn validate_identifier(field: &str, value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::InvalidFieldValue {
            field: field.to_string(),
            constraint: "must not be empty".to_string(),
        });
    }

    Ok(())
}

/// Label keys start with a lowercase letter; keys and values hold lowercase letters, digits,
/// `-` and `_`, up to 63 characters.
fn validate_label(key: &str, value: &str) -> Result<(), ValidationError> {
    let invalid = |reason: &str| ValidationError::InvalidLabel {
        key: key.to_string(),
        reason: reason.to_string(),
    };

    if !key.chars().next().is_some_and(|c| c.is_ascii_lowercase()) {
        return Err(invalid("keys must start with a lowercase letter"));
    }

    if key.len() > MAX_LABEL_LENGTH || value.len() > MAX_LABEL_LENGTH {
        return Err(invalid("keys and values must be at most 63 characters"));
    }

    let allowed = |c: char| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_';
    if !key.chars().all(allowed) || !value.chars().all(allowed) {
        return Err(invalid(
            "only lowercase letters, digits, `-` and `_` are allowed",
        ));
    }

    Ok(())
}
