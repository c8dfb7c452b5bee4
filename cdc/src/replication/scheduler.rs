use std::time::Duration;

use cdc_config::shared::{MAX_MERGES_PER_TABLE_PER_DAY, MINIMUM_UPDATE_FREQUENCY_SECS};
use tokio::time::Instant;

use crate::bail;
use crate::concurrency::shutdown::{ShutdownResult, ShutdownRx};
use crate::error::{CdcResult, ErrorKind};

/// Fires merge triggers for one table at a fixed interval.
///
/// The first trigger fires one interval after creation. Triggers never queue up: when a merge
/// pass outlasts the interval, the next trigger fires immediately once and the schedule restarts
/// from there, so at most one trigger is ever pending.
#[derive(Debug)]
pub struct MergeScheduler {
    interval: Duration,
    last_fired: Instant,
}

impl MergeScheduler {
    pub fn new(update_frequency_secs: u64) -> CdcResult<Self> {
        if update_frequency_secs < MINIMUM_UPDATE_FREQUENCY_SECS {
            bail!(
                ErrorKind::ConfigError,
                "Update frequency too low",
                format!(
                    "update_frequency_secs is {update_frequency_secs} but must be at least \
                     {MINIMUM_UPDATE_FREQUENCY_SECS} to stay within {MAX_MERGES_PER_TABLE_PER_DAY} \
                     merge operations per table per day"
                )
            );
        }

        Ok(Self {
            interval: Duration::from_secs(update_frequency_secs),
            last_fired: Instant::now(),
        })
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Waits for the next trigger, or for shutdown.
    pub async fn next_trigger(&mut self, shutdown_rx: &mut ShutdownRx) -> ShutdownResult<(), ()> {
        let deadline = self.last_fired + self.interval;

        tokio::select! {
            biased;

            _ = shutdown_rx.changed() => ShutdownResult::Shutdown(()),
            _ = tokio::time::sleep_until(deadline) => {
                self.last_fired = Instant::now();
                ShutdownResult::Ok(())
            }
        }
    }
}
