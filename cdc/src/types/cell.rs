use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A single column value as carried by change records.
///
/// Values keep their JSON shape: scalars map to the matching variant and arrays or objects are
/// kept as [`Cell::Json`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Cell {
    Null,
    Bool(bool),
    I64(i64),
    F64(f64),
    String(String),
    Json(serde_json::Value),
}

impl Cell {
    pub fn is_null(&self) -> bool {
        matches!(self, Cell::Null)
    }
}

impl From<i64> for Cell {
    fn from(value: i64) -> Self {
        Cell::I64(value)
    }
}

impl From<bool> for Cell {
    fn from(value: bool) -> Self {
        Cell::Bool(value)
    }
}

impl From<f64> for Cell {
    fn from(value: f64) -> Self {
        Cell::F64(value)
    }
}

impl From<&str> for Cell {
    fn from(value: &str) -> Self {
        Cell::String(value.to_string())
    }
}

impl From<String> for Cell {
    fn from(value: String) -> Self {
        Cell::String(value)
    }
}

/// Column name to value mapping of a row.
pub type Columns = BTreeMap<String, Cell>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cells_keep_their_json_shape() {
        let columns: Columns = serde_json::from_str(
            r#"{"id": 1, "price": 9.5, "name": "pen", "paid": true, "note": null, "tags": ["a"]}"#,
        )
        .unwrap();

        assert_eq!(columns["id"], Cell::I64(1));
        assert_eq!(columns["price"], Cell::F64(9.5));
        assert_eq!(columns["name"], Cell::String("pen".to_string()));
        assert_eq!(columns["paid"], Cell::Bool(true));
        assert!(columns["note"].is_null());
        assert_eq!(columns["tags"], Cell::Json(serde_json::json!(["a"])));
    }
}
