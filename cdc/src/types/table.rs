use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Suffix appended to a table identifier to name its branch.
const BRANCH_NAME_SUFFIX: &str = "apply-changes";

/// Identifier of a source table, as carried by change records or named by a dedicated stream.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TableId(Arc<str>);

impl TableId {
    pub fn new(id: impl Into<Arc<str>>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TableId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for TableId {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

/// A table inside a warehouse dataset.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableName {
    pub dataset: String,
    pub table: String,
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.dataset, self.table)
    }
}

/// Everything a table branch needs to know about where its data lives.
///
/// Built once when the table is first observed and never changed afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableBinding {
    pub table_id: TableId,
    /// Name of the transport stream the table was first observed on.
    pub source: String,
    pub changelog: TableName,
    pub replica: TableName,
    pub update_frequency: Duration,
}

impl TableBinding {
    pub fn new(
        table_id: TableId,
        source: impl Into<String>,
        change_log_dataset: &str,
        replica_dataset: &str,
        update_frequency: Duration,
    ) -> Self {
        let changelog = TableName {
            dataset: change_log_dataset.to_string(),
            table: table_id.to_string(),
        };
        let replica = TableName {
            dataset: replica_dataset.to_string(),
            table: table_id.to_string(),
        };

        Self {
            table_id,
            source: source.into(),
            changelog,
            replica,
            update_frequency,
        }
    }

    /// Returns the branch name, `{table}/apply-changes`.
    pub fn branch_name(&self) -> String {
        format!("{}/{BRANCH_NAME_SUFFIX}", self.table_id)
    }
}
