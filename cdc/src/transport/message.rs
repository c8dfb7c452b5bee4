//! Decoding of change records from transport payloads.
//!
//! Payloads are JSON objects:
//!
//! ```json
//! {
//!   "table": "orders",
//!   "kind": "UPDATE",
//!   "primary_key": {"id": 1},
//!   "columns": {"id": 1, "status": "paid"},
//!   "ordering_token": 42
//! }
//! ```
//!
//! `table` may be omitted on streams dedicated to a single table. `operation` is accepted as an
//! alias of `kind`, in any letter case.

use serde::Deserialize;

use crate::bail;
use crate::error::{CdcResult, ErrorKind};
use crate::transport::SourceMessage;
use crate::types::{ChangeKind, ChangeRecord, Columns, OrderingToken, PrimaryKey, TableId};

#[derive(Debug, Deserialize)]
struct ChangePayload {
    #[serde(default)]
    table: Option<String>,
    #[serde(alias = "operation")]
    kind: String,
    primary_key: PrimaryKey,
    #[serde(default)]
    columns: Option<Columns>,
    ordering_token: OrderingToken,
}

#[derive(Debug, Deserialize)]
struct RoutingHeader {
    #[serde(default)]
    table: Option<String>,
}

/// Extracts the table a payload belongs to, `None` when no table can be recovered.
pub fn payload_table(payload: &[u8]) -> Option<TableId> {
    let header: RoutingHeader = serde_json::from_slice(payload).ok()?;
    let table = header.table?;
    let table = table.trim();

    (!table.is_empty()).then(|| TableId::from(table))
}

/// Decodes the change record carried by `message` for `table_id`.
///
/// Fails with [`ErrorKind::InvalidData`] when the payload names another table, has an empty
/// primary key, or lacks the columns of an insert or update.
pub fn decode_change_record(message: &SourceMessage, table_id: &TableId) -> CdcResult<ChangeRecord> {
    let payload: ChangePayload = serde_json::from_slice(&message.payload)?;

    if let Some(table) = payload.table.as_deref().map(str::trim)
        && !table.is_empty()
        && table != table_id.as_str()
    {
        bail!(
            ErrorKind::InvalidData,
            "Change record belongs to another table",
            format!(
                "Message '{}' names table '{table}' but was delivered for table '{table_id}'",
                message.id
            )
        );
    }

    let kind: ChangeKind = payload.kind.parse()?;
    let columns = match kind {
        ChangeKind::Delete => None,
        ChangeKind::Insert | ChangeKind::Update => payload.columns,
    };

    let record = ChangeRecord {
        table_id: table_id.clone(),
        kind,
        primary_key: payload.primary_key,
        columns,
        ordering_token: payload.ordering_token,
        arrival_time: message.received_at,
        message_id: message.id.clone(),
    };
    record.validate()?;

    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Cell;
    use chrono::Utc;

    fn message(payload: &str) -> SourceMessage {
        SourceMessage {
            id: "1-0".to_string(),
            payload: payload.as_bytes().to_vec(),
            received_at: Utc::now(),
        }
    }

    #[test]
    fn decodes_update_with_operation_alias() {
        let message = message(
            r#"{"table": "orders", "operation": "update", "primary_key": {"id": 1},
                "columns": {"id": 1, "status": "paid"}, "ordering_token": 42}"#,
        );

        let record = decode_change_record(&message, &TableId::from("orders")).unwrap();

        assert_eq!(record.kind, ChangeKind::Update);
        assert_eq!(record.ordering_token, OrderingToken::new(42));
        assert_eq!(record.message_id, "1-0");
        assert_eq!(
            record.columns.unwrap()["status"],
            Cell::String("paid".to_string())
        );
    }

    #[test]
    fn deletes_drop_columns() {
        let message = message(
            r#"{"kind": "DELETE", "primary_key": {"id": 5}, "columns": {"id": 5}, "ordering_token": 20}"#,
        );

        let record = decode_change_record(&message, &TableId::from("orders")).unwrap();

        assert_eq!(record.kind, ChangeKind::Delete);
        assert!(record.columns.is_none());
    }

    #[test]
    fn rejects_records_of_another_table() {
        let message = message(
            r#"{"table": "customers", "kind": "DELETE", "primary_key": {"id": 5}, "ordering_token": 20}"#,
        );

        let err = decode_change_record(&message, &TableId::from("orders")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
    }

    #[test]
    fn rejects_inserts_without_columns() {
        let message =
            message(r#"{"kind": "INSERT", "primary_key": {"id": 5}, "ordering_token": 20}"#);

        let err = decode_change_record(&message, &TableId::from("orders")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
    }

    #[test]
    fn payload_table_requires_a_named_table() {
        assert_eq!(
            payload_table(br#"{"table": "orders", "kind": "INSERT"}"#),
            Some(TableId::from("orders"))
        );
        assert_eq!(payload_table(br#"{"table": "  "}"#), None);
        assert_eq!(payload_table(br#"{"kind": "INSERT"}"#), None);
        assert_eq!(payload_table(b"not json"), None);
    }
}
