use serde::Deserialize;

use crate::shared::ValidationError;

const fn default_block_ms() -> u64 {
    TransportConfig::DEFAULT_BLOCK_MS
}

const fn default_read_count() -> usize {
    TransportConfig::DEFAULT_READ_COUNT
}

/// Message bus delivering change records.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportConfig {
    /// In-process channels, fed by an embedding application.
    Memory,
    /// Redis Streams.
    ///
    /// Topics are stream keys. Subscriptions are written as `stream/group` and read through a
    /// consumer group named `group`.
    Redis {
        url: String,
        consumer_name: String,
        #[serde(default = "default_block_ms")]
        block_ms: u64,
        #[serde(default = "default_read_count")]
        read_count: usize,
    },
}

impl TransportConfig {
    pub const DEFAULT_BLOCK_MS: u64 = 1000;

    pub const DEFAULT_READ_COUNT: usize = 500;

    pub fn validate(&self) -> Result<(), ValidationError> {
        if let TransportConfig::Redis {
            consumer_name,
            read_count,
            ..
        } = self
        {
            if consumer_name.is_empty() {
                return Err(ValidationError::InvalidFieldValue {
                    field: "transport.redis.consumer_name".to_string(),
                    constraint: "must not be empty".to_string(),
                });
            }

            if *read_count == 0 {
                return Err(ValidationError::InvalidFieldValue {
                    field: "transport.redis.read_count".to_string(),
                    constraint: "must be greater than 0".to_string(),
                });
            }
        }

        Ok(())
    }
}
