use thiserror::Error;

/// Configuration validation errors.
///
/// Every variant is fatal: a configuration that fails validation never starts a pipeline.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    /// Topics and subscriptions were both configured.
    #[error(
        "Either an input topic or a subscription must be provided, not both: `input_topics` and `input_subscriptions` are mutually exclusive"
    )]
    ConflictingInputSources,
    /// Neither topics nor subscriptions were configured.
    #[error(
        "Either an input topic or a subscription must be provided: set `input_topics` or `input_subscriptions`"
    )]
    MissingInputSource,
    /// Single-topic mode was requested with more than one input.
    #[error(
        "`use_single_topic` requires exactly one input topic or subscription, but {configured} were provided"
    )]
    SingleTopicRequiresOneSource { configured: usize },
    /// The merge frequency would exceed the per-table daily merge ceiling.
    #[error(
        "The warehouse supports at most {max_merges_per_day} merge operations per table per day. `update_frequency_secs` must be at least {minimum} seconds, but {configured} was provided"
    )]
    UpdateFrequencyTooLow {
        configured: u64,
        minimum: u64,
        max_merges_per_day: u64,
    },
    /// An operational label key or value is malformed.
    #[error("Invalid label `{key}`: {reason}")]
    InvalidLabel { key: String, reason: String },
    /// A field holds a value outside of its allowed range.
    #[error("Invalid value for `{field}`: {constraint}")]
    InvalidFieldValue { field: String, constraint: String },
}
