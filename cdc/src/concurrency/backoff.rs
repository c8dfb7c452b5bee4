use std::time::Duration;

use cdc_config::shared::RetryConfig;
use rand::Rng;

/// Highest exponent applied to the initial delay.
const MAX_EXPONENT: u32 = 16;

/// Returns the delay before retry number `attempt` (starting at 0).
///
/// Uses exponential backoff with full jitter: a uniformly random delay between zero and
/// `min(max_delay, initial_delay * 2^attempt)`.
pub fn retry_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let ceiling = exponential_ceiling(config, attempt);
    if ceiling == 0 {
        return Duration::ZERO;
    }

    Duration::from_millis(rand::thread_rng().gen_range(0..=ceiling))
}

fn exponential_ceiling(config: &RetryConfig, attempt: u32) -> u64 {
    config
        .initial_delay_ms
        .saturating_mul(1u64 << attempt.min(MAX_EXPONENT))
        .min(config.max_delay_ms)
}
