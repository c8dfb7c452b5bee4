//! Redis Streams transport.
//!
//! A topic is a stream key tailed with `XREAD` from its end at startup. Nothing is acknowledged,
//! so records published while the applier is down are not seen.
//!
//! A subscription `stream/group` reads through the consumer group `group` with `XREADGROUP`.
//! Entries left pending by a previous run of the same consumer are read first, then new entries.
//! Durably appended entries are acknowledged with `XACK`.

use std::collections::HashMap;

use chrono::Utc;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use redis::streams::{StreamReadOptions, StreamReadReply};
use tracing::{info, warn};

use crate::bail;
use crate::error::{CdcResult, ErrorKind};
use crate::transport::{ChangeSource, SourceMessage};

/// Entry field holding the JSON payload.
pub const PAYLOAD_FIELD: &str = "payload";

/// Start of new entries for `XREAD`.
const TAIL_ID: &str = "$";

/// Start of the entries left pending for this consumer, for `XREADGROUP`.
const PENDING_ID: &str = "0";

/// Never-delivered entries for `XREADGROUP`.
const NEW_ENTRIES_ID: &str = ">";

/// Options shared by every Redis source of a run.
#[derive(Debug, Clone)]
pub struct RedisReadOptions {
    pub consumer_name: String,
    pub block_ms: u64,
    pub read_count: usize,
}

#[derive(Debug, Clone)]
enum ReadMode {
    Topic {
        last_id: String,
    },
    Subscription {
        group: String,
        /// Position in the entries left pending by a previous run, `None` once replayed.
        pending_cursor: Option<String>,
    },
}

/// A topic or subscription backed by a Redis stream.
pub struct RedisChangeSource {
    stream: String,
    mode: ReadMode,
    options: RedisReadOptions,
    connection: ConnectionManager,
}

impl std::fmt::Debug for RedisChangeSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisChangeSource")
            .field("stream", &self.stream)
            .field("mode", &self.mode)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl RedisChangeSource {
    /// Connects a source tailing the stream `topic`.
    pub async fn topic(url: &str, topic: &str, options: RedisReadOptions) -> CdcResult<Self> {
        let connection = connect(url).await?;

        info!(stream = topic, "tailing redis stream");

        Ok(Self {
            stream: topic.to_string(),
            mode: ReadMode::Topic {
                last_id: TAIL_ID.to_string(),
            },
            options,
            connection,
        })
    }

    /// Connects a source reading the subscription `stream/group`, creating the group if needed.
    pub async fn subscription(
        url: &str,
        subscription: &str,
        options: RedisReadOptions,
    ) -> CdcResult<Self> {
        let (stream, group) = parse_subscription(subscription)?;
        let mut connection = connect(url).await?;

        let created: redis::RedisResult<()> = connection
            .xgroup_create_mkstream(&stream, &group, TAIL_ID)
            .await;
        match created {
            Ok(()) => info!(%stream, %group, "created redis consumer group"),
            Err(err) if err.code() == Some("BUSYGROUP") => {}
            Err(err) => return Err(err.into()),
        }

        info!(%stream, %group, consumer = %options.consumer_name, "reading redis subscription");

        Ok(Self {
            stream,
            mode: ReadMode::Subscription {
                group,
                pending_cursor: Some(PENDING_ID.to_string()),
            },
            options,
            connection,
        })
    }

    fn read_options(&self) -> StreamReadOptions {
        let options = StreamReadOptions::default()
            .block(usize::try_from(self.options.block_ms).unwrap_or(usize::MAX))
            .count(self.options.read_count);

        match &self.mode {
            ReadMode::Topic { .. } => options,
            ReadMode::Subscription { group, .. } => {
                options.group(group, &self.options.consumer_name)
            }
        }
    }

    fn read_id(&self) -> &str {
        match &self.mode {
            ReadMode::Topic { last_id } => last_id,
            ReadMode::Subscription {
                pending_cursor: Some(cursor),
                ..
            } => cursor,
            ReadMode::Subscription { .. } => NEW_ENTRIES_ID,
        }
    }
}

async fn connect(url: &str) -> CdcResult<ConnectionManager> {
    let client = redis::Client::open(url)?;
    Ok(client.get_connection_manager().await?)
}

/// Splits `stream/group` at its last `/`.
fn parse_subscription(subscription: &str) -> CdcResult<(String, String)> {
    match subscription.rsplit_once('/') {
        Some((stream, group)) if !stream.is_empty() && !group.is_empty() => {
            Ok((stream.to_string(), group.to_string()))
        }
        _ => bail!(
            ErrorKind::ConfigError,
            "Invalid subscription name",
            format!("Subscription '{subscription}' must be written as 'stream/group'")
        ),
    }
}

fn field_bytes(fields: &HashMap<String, redis::Value>, name: &str) -> Option<Vec<u8>> {
    match fields.get(name)? {
        redis::Value::BulkString(bytes) => Some(bytes.clone()),
        redis::Value::SimpleString(value) => Some(value.as_bytes().to_vec()),
        _ => None,
    }
}

impl ChangeSource for RedisChangeSource {
    fn name(&self) -> &str {
        &self.stream
    }

    async fn receive(&mut self) -> CdcResult<Option<Vec<SourceMessage>>> {
        let options = self.read_options();
        let read_id = self.read_id().to_string();

        let reply: Option<StreamReadReply> = self
            .connection
            .xread_options(&[&self.stream], &[&read_id], &options)
            .await?;

        let received_at = Utc::now();
        let mut messages = Vec::new();
        for key in reply.map(|reply| reply.keys).unwrap_or_default() {
            for entry in key.ids {
                match field_bytes(&entry.map, PAYLOAD_FIELD) {
                    Some(payload) => messages.push(SourceMessage {
                        id: entry.id,
                        payload,
                        received_at,
                    }),
                    None => {
                        // Surfaced as an undecodable message so routing can count and skip it.
                        warn!(stream = %self.stream, id = %entry.id, "redis entry has no payload field");
                        messages.push(SourceMessage {
                            id: entry.id,
                            payload: Vec::new(),
                            received_at,
                        });
                    }
                }
            }
        }

        match &mut self.mode {
            ReadMode::Topic { last_id } => {
                if let Some(last) = messages.last() {
                    *last_id = last.id.clone();
                }
            }
            ReadMode::Subscription {
                pending_cursor: pending_cursor @ Some(_),
                ..
            } => match messages.last() {
                Some(last) => *pending_cursor = Some(last.id.clone()),
                None => {
                    info!(stream = %self.stream, "replayed pending redis entries");
                    *pending_cursor = None;
                }
            },
            ReadMode::Subscription { .. } => {}
        }

        Ok(Some(messages))
    }

    async fn ack(&mut self, message_ids: Vec<String>) -> CdcResult<()> {
        let ReadMode::Subscription { group, .. } = &self.mode else {
            return Ok(());
        };

        if message_ids.is_empty() {
            return Ok(());
        }

        let acked: redis::RedisResult<u64> = self
            .connection
            .xack(&self.stream, group, &message_ids)
            .await;

        if let Err(err) = acked {
            let err: crate::error::CdcError = err.into();
            bail!(
                ErrorKind::TransportAckFailed,
                "Redis acknowledgement failed",
                format!("Could not acknowledge {} entries on '{}'", message_ids.len(), self.stream),
                source: err
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscriptions_split_at_last_slash() {
        assert_eq!(
            parse_subscription("cdc/orders/applier").unwrap(),
            ("cdc/orders".to_string(), "applier".to_string())
        );
        assert_eq!(
            parse_subscription("orders").unwrap_err().kind(),
            ErrorKind::ConfigError
        );
        assert!(parse_subscription("orders/").is_err());
    }

    #[test]
    fn payload_field_accepts_bulk_and_simple_strings() {
        let mut fields = HashMap::new();
        fields.insert(
            "payload".to_string(),
            redis::Value::BulkString(b"{}".to_vec()),
        );
        assert_eq!(field_bytes(&fields, PAYLOAD_FIELD), Some(b"{}".to_vec()));

        fields.insert(
            "payload".to_string(),
            redis::Value::SimpleString("{}".to_string()),
        );
        assert_eq!(field_bytes(&fields, PAYLOAD_FIELD), Some(b"{}".to_vec()));

        fields.insert("payload".to_string(), redis::Value::Int(1));
        assert_eq!(field_bytes(&fields, PAYLOAD_FIELD), None);
    }
}
