use std::future::Future;

use chrono::{DateTime, Utc};

use crate::error::CdcResult;

/// A raw message read from a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceMessage {
    /// Transport-assigned identifier, stable across redeliveries.
    pub id: String,
    pub payload: Vec<u8>,
    pub received_at: DateTime<Utc>,
}

/// A stream of change messages with at-least-once delivery.
///
/// Messages that are never acknowledged may be delivered again, possibly after a restart.
pub trait ChangeSource: Send + 'static {
    /// Name of the stream, used as table identifier when the stream is dedicated to one table.
    fn name(&self) -> &str;

    /// Waits for the next messages.
    ///
    /// Returns an empty batch when nothing arrived within the transport's polling window and
    /// `None` once the source is exhausted and will never deliver again.
    fn receive(&mut self) -> impl Future<Output = CdcResult<Option<Vec<SourceMessage>>>> + Send;

    /// Acknowledges durably processed messages.
    fn ack(&mut self, message_ids: Vec<String>) -> impl Future<Output = CdcResult<()>> + Send;
}
