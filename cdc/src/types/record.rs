use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::bail;
use crate::error::{CdcError, CdcResult, ErrorKind};
use crate::types::{Cell, Columns, TableId};

/// Kind of change captured at the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Insert => "INSERT",
            ChangeKind::Update => "UPDATE",
            ChangeKind::Delete => "DELETE",
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChangeKind {
    type Err = CdcError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_uppercase().as_str() {
            "INSERT" => Ok(ChangeKind::Insert),
            "UPDATE" => Ok(ChangeKind::Update),
            "DELETE" => Ok(ChangeKind::Delete),
            _ => bail!(
                ErrorKind::ConversionError,
                "Unknown change kind",
                format!("'{value}' is not one of INSERT, UPDATE, DELETE")
            ),
        }
    }
}

/// Position of a change in its table's source history.
///
/// Tokens are unique and totally ordered within a table. Warehouses persist them as fixed-width
/// hexadecimal so that text comparison matches numeric comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderingToken(u64);

impl OrderingToken {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u64 {
        self.0
    }

    /// Returns the token as 16 lowercase hexadecimal digits.
    pub fn to_hex(&self) -> String {
        format!("{:016x}", self.0)
    }

    pub fn from_hex(value: &str) -> CdcResult<Self> {
        Ok(Self(u64::from_str_radix(value, 16)?))
    }
}

impl fmt::Display for OrderingToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for OrderingToken {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// Primary key values of a row, by column name.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PrimaryKey(Columns);

impl PrimaryKey {
    pub fn new(columns: Columns) -> Self {
        Self(columns)
    }

    pub fn columns(&self) -> &Columns {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns a stable text form of the key, identical for equal keys.
    ///
    /// Used to group records and as the uniqueness key of replica rows.
    pub fn canonical(&self) -> String {
        // Column names are ordered by the map and cells always serialize.
        serde_json::to_string(&self.0).unwrap_or_default()
    }
}

impl<K: Into<String>, V: Into<Cell>> FromIterator<(K, V)> for PrimaryKey {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        )
    }
}

/// Identity used to drop redelivered records.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DedupeKey {
    pub table_id: TableId,
    pub primary_key: String,
    pub ordering_token: OrderingToken,
    pub kind: ChangeKind,
}

impl fmt::Display for DedupeKey {
    /// Renders the key as `{table}|{primary key}|{token hex}|{kind}`, the form warehouses store.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}|{}|{}|{}",
            self.table_id,
            self.primary_key,
            self.ordering_token.to_hex(),
            self.kind
        )
    }
}

/// One change captured from a source table.
///
/// Two records are equal when they describe the same change: same table, primary key, ordering
/// token and kind. Arrival time and message id do not take part in equality.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub table_id: TableId,
    pub kind: ChangeKind,
    pub primary_key: PrimaryKey,
    /// Full row for inserts and updates. Deletes carry no columns.
    pub columns: Option<Columns>,
    pub ordering_token: OrderingToken,
    pub arrival_time: DateTime<Utc>,
    /// Transport identifier of the message that carried the record.
    pub message_id: String,
}

impl ChangeRecord {
    pub fn dedupe_key(&self) -> DedupeKey {
        DedupeKey {
            table_id: self.table_id.clone(),
            primary_key: self.primary_key.canonical(),
            ordering_token: self.ordering_token,
            kind: self.kind,
        }
    }

    /// Orders records by ordering token, then arrival time, then message id.
    pub fn order_cmp(&self, other: &ChangeRecord) -> Ordering {
        self.ordering_token
            .cmp(&other.ordering_token)
            .then_with(|| self.arrival_time.cmp(&other.arrival_time))
            .then_with(|| self.message_id.cmp(&other.message_id))
    }

    /// Checks the shape of the record.
    pub fn validate(&self) -> CdcResult<()> {
        if self.primary_key.is_empty() {
            bail!(
                ErrorKind::InvalidData,
                "Change record has no primary key",
                format!(
                    "The {} change with token {} for table '{}' has an empty primary key",
                    self.kind, self.ordering_token, self.table_id
                )
            );
        }

        if self.kind != ChangeKind::Delete && self.columns.is_none() {
            bail!(
                ErrorKind::InvalidData,
                "Change record has no columns",
                format!(
                    "The {} change with token {} for table '{}' must carry the row columns",
                    self.kind, self.ordering_token, self.table_id
                )
            );
        }

        Ok(())
    }
}

impl PartialEq for ChangeRecord {
    fn eq(&self, other: &Self) -> bool {
        self.table_id == other.table_id
            && self.kind == other.kind
            && self.ordering_token == other.ordering_token
            && self.primary_key.canonical() == other.primary_key.canonical()
    }
}

impl Eq for ChangeRecord {}

impl Hash for ChangeRecord {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.dedupe_key().hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record(token: u64, kind: ChangeKind, message_id: &str, arrival_secs: i64) -> ChangeRecord {
        ChangeRecord {
            table_id: TableId::from("orders"),
            kind,
            primary_key: PrimaryKey::from_iter([("id", 1i64)]),
            columns: (kind != ChangeKind::Delete)
                .then(|| Columns::from([("id".to_string(), Cell::I64(1))])),
            ordering_token: OrderingToken::new(token),
            arrival_time: Utc.timestamp_opt(arrival_secs, 0).unwrap(),
            message_id: message_id.to_string(),
        }
    }

    #[test]
    fn redeliveries_are_equal_regardless_of_arrival() {
        let first = record(10, ChangeKind::Insert, "m-1", 100);
        let redelivered = record(10, ChangeKind::Insert, "m-7", 200);

        assert_eq!(first, redelivered);
        assert_eq!(first.dedupe_key(), redelivered.dedupe_key());
        assert_ne!(first, record(10, ChangeKind::Update, "m-1", 100));
        assert_ne!(first, record(11, ChangeKind::Insert, "m-1", 100));
    }

    #[test]
    fn dedupe_key_renders_stable_text() {
        let key = record(10, ChangeKind::Insert, "m-1", 100).dedupe_key();

        assert_eq!(key.to_string(), r#"orders|{"id":1}|000000000000000a|INSERT"#);
    }

    #[test]
    fn ordering_uses_token_then_arrival_then_message_id() {
        let early_token = record(9, ChangeKind::Update, "m-2", 500);
        let late_token = record(10, ChangeKind::Insert, "m-1", 100);
        assert_eq!(early_token.order_cmp(&late_token), Ordering::Less);

        let earlier_arrival = record(10, ChangeKind::Insert, "m-9", 100);
        let later_arrival = record(10, ChangeKind::Insert, "m-1", 101);
        assert_eq!(earlier_arrival.order_cmp(&later_arrival), Ordering::Less);

        let a = record(10, ChangeKind::Insert, "m-1", 100);
        let b = record(10, ChangeKind::Insert, "m-2", 100);
        assert_eq!(a.order_cmp(&b), Ordering::Less);
    }

    #[test]
    fn hex_tokens_sort_like_numbers() {
        let small = OrderingToken::new(9).to_hex();
        let large = OrderingToken::new(10).to_hex();

        assert_eq!(small, "0000000000000009");
        assert!(small < large);
        assert_eq!(OrderingToken::from_hex(&large).unwrap(), OrderingToken::new(10));
    }

    #[test]
    fn canonical_key_ignores_insertion_order() {
        let a = PrimaryKey::from_iter([("tenant", Cell::from("acme")), ("id", Cell::from(5i64))]);
        let b = PrimaryKey::from_iter([("id", Cell::from(5i64)), ("tenant", Cell::from("acme"))]);

        assert_eq!(a.canonical(), b.canonical());
        assert_eq!(a.canonical(), r#"{"id":5,"tenant":"acme"}"#);
    }

    #[test]
    fn validation_rejects_missing_key_and_columns() {
        let mut missing_key = record(1, ChangeKind::Insert, "m-1", 0);
        missing_key.primary_key = PrimaryKey::default();
        assert_eq!(
            missing_key.validate().unwrap_err().kind(),
            ErrorKind::InvalidData
        );

        let mut missing_columns = record(1, ChangeKind::Update, "m-1", 0);
        missing_columns.columns = None;
        assert!(missing_columns.validate().is_err());

        assert!(record(1, ChangeKind::Delete, "m-1", 0).validate().is_ok());
    }

    #[test]
    fn change_kind_parses_case_insensitively() {
        assert_eq!("delete".parse::<ChangeKind>().unwrap(), ChangeKind::Delete);
        assert_eq!(
            "UPSERT".parse::<ChangeKind>().unwrap_err().kind(),
            ErrorKind::ConversionError
        );
    }
}
