use std::time::Duration;

use chrono::Utc;
use serde_json::json;

use crate::types::{
    Cell, ChangeKind, ChangeRecord, Columns, OrderingToken, PrimaryKey, TableBinding, TableId,
};

/// Table used by the short record builders.
pub const DEFAULT_TABLE: &str = "orders";

pub const CHANGELOG_DATASET: &str = "changelog";

pub const REPLICA_DATASET: &str = "replica";

/// Returns the binding of `table` in the test datasets, merged every 95 seconds.
pub fn binding(table: &str) -> TableBinding {
    TableBinding::new(
        TableId::from(table),
        table,
        CHANGELOG_DATASET,
        REPLICA_DATASET,
        Duration::from_secs(95),
    )
}

/// Builds a record of `table` keyed by `id` whose row has an `id` and a `status` column.
pub fn record(
    table: &str,
    kind: ChangeKind,
    id: i64,
    token: u64,
    status: Option<&str>,
) -> ChangeRecord {
    let columns = status.map(|status| {
        Columns::from([
            ("id".to_string(), Cell::from(id)),
            ("status".to_string(), Cell::from(status)),
        ])
    });

    ChangeRecord {
        table_id: TableId::from(table),
        kind,
        primary_key: PrimaryKey::from_iter([("id", id)]),
        columns,
        ordering_token: OrderingToken::new(token),
        arrival_time: Utc::now(),
        message_id: format!("{token}-{id}"),
    }
}

pub fn insert(id: i64, token: u64) -> ChangeRecord {
    insert_with(id, token, "created")
}

pub fn insert_with(id: i64, token: u64, status: &str) -> ChangeRecord {
    record(DEFAULT_TABLE, ChangeKind::Insert, id, token, Some(status))
}

pub fn update(id: i64, token: u64) -> ChangeRecord {
    record(DEFAULT_TABLE, ChangeKind::Update, id, token, Some("updated"))
}

pub fn delete(id: i64, token: u64) -> ChangeRecord {
    record(DEFAULT_TABLE, ChangeKind::Delete, id, token, None)
}

/// Builds the JSON payload a transport carries for a change.
///
/// `table` is omitted from the payload when `None`, as on streams dedicated to one table.
pub fn change_payload(
    table: Option<&str>,
    kind: ChangeKind,
    id: i64,
    token: u64,
    status: Option<&str>,
) -> serde_json::Value {
    let mut payload = json!({
        "kind": kind.as_str(),
        "primary_key": { "id": id },
        "ordering_token": token,
    });

    if let Some(table) = table {
        payload["table"] = json!(table);
    }
    if let Some(status) = status {
        payload["columns"] = json!({ "id": id, "status": status });
    }

    payload
}
