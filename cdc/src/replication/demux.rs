use cdc_config::shared::InputMode;
use tokio::sync::mpsc;

use crate::cdc_error;
use crate::error::{CdcError, ErrorKind};
use crate::transport::SourceMessage;
use crate::transport::message::{decode_change_record, payload_table};
use crate::types::{ChangeRecord, TableId};

/// Acknowledges one transport message once its record is durable.
#[derive(Debug, Clone)]
pub struct AckHandle {
    message_id: String,
    tx: mpsc::UnboundedSender<String>,
}

impl AckHandle {
    pub fn new(message_id: String, tx: mpsc::UnboundedSender<String>) -> Self {
        Self { message_id, tx }
    }

    /// Requests the acknowledgement. Lost if the source already stopped, in which case the
    /// transport redelivers the message.
    pub fn ack(self) {
        let _ = self.tx.send(self.message_id);
    }
}

/// A decoded record waiting to be appended.
#[derive(Debug)]
pub struct PendingRecord {
    pub record: ChangeRecord,
    pub ack: AckHandle,
}

/// Item of a table branch input.
#[derive(Debug)]
pub enum TableMessage {
    Record(PendingRecord),
    /// A message of this table that could not be decoded.
    Invalid(CdcError),
}

/// Where a message goes.
#[derive(Debug)]
pub enum RouteDecision {
    Route {
        table_id: TableId,
        record: Result<ChangeRecord, CdcError>,
    },
    /// No table could be recovered from the message.
    Unroutable(CdcError),
}

/// Splits a transport stream into per-table streams.
///
/// A shared stream routes each message by the table named in its payload. A dedicated stream
/// sends every message to the table named after the stream.
#[derive(Debug, Clone)]
pub struct StreamDemultiplexer {
    mode: InputMode,
    source: String,
}

impl StreamDemultiplexer {
    pub fn new(mode: InputMode, source: impl Into<String>) -> Self {
        Self {
            mode,
            source: source.into(),
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn route(&self, message: &SourceMessage) -> RouteDecision {
        let table_id = match self.mode {
            InputMode::SingleStream => match payload_table(&message.payload) {
                Some(table_id) => table_id,
                None => {
                    return RouteDecision::Unroutable(cdc_error!(
                        ErrorKind::UnroutableMessage,
                        "Message names no table",
                        format!(
                            "message {} of shared stream {} carries no table",
                            message.id, self.source
                        )
                    ));
                }
            },
            InputMode::PerTableStreams => TableId::from(self.source.as_str()),
        };

        let record = decode_change_record(message, &table_id);

        RouteDecision::Route { table_id, record }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn message(payload: &str) -> SourceMessage {
        SourceMessage {
            id: "7-0".to_string(),
            payload: payload.as_bytes().to_vec(),
            received_at: Utc::now(),
        }
    }

    #[test]
    fn shared_stream_routes_by_embedded_table() {
        let demux = StreamDemultiplexer::new(InputMode::SingleStream, "all_tables");

        let decision = demux.route(&message(
            r#"{"table": "customers", "kind": "DELETE", "primary_key": {"id": 3}, "ordering_token": 4}"#,
        ));

        let RouteDecision::Route { table_id, record } = decision else {
            panic!("expected the message to be routed");
        };
        assert_eq!(table_id, TableId::from("customers"));
        assert_eq!(record.unwrap().table_id, TableId::from("customers"));
    }

    #[test]
    fn shared_stream_without_table_is_unroutable() {
        let demux = StreamDemultiplexer::new(InputMode::SingleStream, "all_tables");

        assert!(matches!(
            demux.route(&message(r#"{"kind": "DELETE", "primary_key": {"id": 3}}"#)),
            RouteDecision::Unroutable(err) if err.kind() == ErrorKind::UnroutableMessage
        ));
        assert!(matches!(
            demux.route(&message("garbage")),
            RouteDecision::Unroutable(err) if err.kind() == ErrorKind::UnroutableMessage
        ));
    }

    #[test]
    fn dedicated_stream_routes_invalid_payloads_to_its_table() {
        let demux = StreamDemultiplexer::new(InputMode::PerTableStreams, "orders");

        let RouteDecision::Route { table_id, record } = demux.route(&message("garbage")) else {
            panic!("expected the message to be routed");
        };
        assert_eq!(table_id, TableId::from("orders"));
        assert_eq!(record.unwrap_err().kind(), ErrorKind::DeserializationError);
    }

    #[tokio::test]
    async fn ack_handles_send_their_message_id() {
        let (tx, mut rx) = mpsc::unbounded_channel();

        AckHandle::new("9-0".to_string(), tx).ack();

        assert_eq!(rx.recv().await, Some("9-0".to_string()));
    }
}
