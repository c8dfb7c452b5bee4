use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;

use crate::error::CdcResult;
use crate::transport::{ChangeSource, SourceMessage};

/// How long [`MemoryChangeSource::receive`] waits for a first message.
const POLL_WINDOW: Duration = Duration::from_millis(100);

/// Maximum messages returned by one receive.
const MAX_RECEIVE_BATCH: usize = 500;

#[derive(Debug, Default)]
struct Deliveries {
    next_id: u64,
    /// Delivered messages not yet acknowledged, by id.
    unacked: BTreeMap<String, SourceMessage>,
    acked: Vec<String>,
}

type SharedDeliveries = Arc<Mutex<Deliveries>>;

fn lock(deliveries: &SharedDeliveries) -> MutexGuard<'_, Deliveries> {
    deliveries.lock().unwrap_or_else(PoisonError::into_inner)
}

/// In-process change stream with acknowledgement tracking.
///
/// Created together with a [`MemoryPublisher`]. The source is exhausted once every publisher
/// handle was dropped and all published messages were received.
#[derive(Debug)]
pub struct MemoryChangeSource {
    name: String,
    rx: mpsc::UnboundedReceiver<SourceMessage>,
    deliveries: SharedDeliveries,
}

impl MemoryChangeSource {
    pub fn new(name: impl Into<String>) -> (Self, MemoryPublisher) {
        let (tx, rx) = mpsc::unbounded_channel();
        let deliveries = SharedDeliveries::default();

        let source = Self {
            name: name.into(),
            rx,
            deliveries: deliveries.clone(),
        };
        let publisher = MemoryPublisher { tx, deliveries };

        (source, publisher)
    }
}

impl ChangeSource for MemoryChangeSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn receive(&mut self) -> CdcResult<Option<Vec<SourceMessage>>> {
        let first = match tokio::time::timeout(POLL_WINDOW, self.rx.recv()).await {
            Err(_) => return Ok(Some(vec![])),
            Ok(None) => return Ok(None),
            Ok(Some(message)) => message,
        };

        let mut messages = vec![first];
        while messages.len() < MAX_RECEIVE_BATCH {
            match self.rx.try_recv() {
                Ok(message) => messages.push(message),
                Err(_) => break,
            }
        }

        let mut deliveries = lock(&self.deliveries);
        for message in &messages {
            deliveries
                .unacked
                .insert(message.id.clone(), message.clone());
        }

        Ok(Some(messages))
    }

    async fn ack(&mut self, message_ids: Vec<String>) -> CdcResult<()> {
        let mut deliveries = lock(&self.deliveries);
        for id in message_ids {
            if deliveries.unacked.remove(&id).is_some() {
                deliveries.acked.push(id);
            }
        }

        Ok(())
    }
}

/// Publishing side of a [`MemoryChangeSource`].
#[derive(Debug, Clone)]
pub struct MemoryPublisher {
    tx: mpsc::UnboundedSender<SourceMessage>,
    deliveries: SharedDeliveries,
}

impl MemoryPublisher {
    /// Publishes a raw payload and returns its message id.
    ///
    /// Publishing after the source was dropped is silently ignored.
    pub fn publish(&self, payload: impl Into<Vec<u8>>) -> String {
        let id = {
            let mut deliveries = lock(&self.deliveries);
            deliveries.next_id += 1;
            format!("{}-0", deliveries.next_id)
        };

        let _ = self.tx.send(SourceMessage {
            id: id.clone(),
            payload: payload.into(),
            received_at: Utc::now(),
        });

        id
    }

    pub fn publish_json(&self, payload: &serde_json::Value) -> String {
        self.publish(payload.to_string())
    }

    /// Delivers every received but unacknowledged message again, keeping its id.
    ///
    /// Returns the number of redelivered messages.
    pub fn redeliver_unacked(&self) -> usize {
        let messages: Vec<_> = lock(&self.deliveries).unacked.values().cloned().collect();
        let count = messages.len();
        for mut message in messages {
            message.received_at = Utc::now();
            let _ = self.tx.send(message);
        }

        count
    }

    /// Returns acknowledged message ids in acknowledgement order.
    pub fn acked(&self) -> Vec<String> {
        lock(&self.deliveries).acked.clone()
    }

    /// Returns the ids of received messages still waiting for acknowledgement.
    pub fn unacked(&self) -> Vec<String> {
        lock(&self.deliveries).unacked.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn tracks_acknowledgements_and_redelivers() {
        let (mut source, publisher) = MemoryChangeSource::new("orders");
        let first = publisher.publish("a");
        let second = publisher.publish("b");

        let received = source.receive().await.unwrap().unwrap();
        assert_eq!(received.len(), 2);

        source.ack(vec![first.clone()]).await.unwrap();
        assert_eq!(publisher.acked(), vec![first]);
        assert_eq!(publisher.unacked(), vec![second.clone()]);

        assert_eq!(publisher.redeliver_unacked(), 1);
        let redelivered = source.receive().await.unwrap().unwrap();
        assert_eq!(redelivered[0].id, second);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_window_and_exhaustion() {
        let (mut source, publisher) = MemoryChangeSource::new("orders");

        assert_eq!(source.receive().await.unwrap(), Some(vec![]));

        drop(publisher);
        assert_eq!(source.receive().await.unwrap(), None);
    }
}
