use serde::{Deserialize, Serialize};

use crate::types::{Columns, OrderingToken, PrimaryKey, SequenceNumber};

/// Materialized state of one primary key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicaRow {
    pub primary_key: PrimaryKey,
    pub columns: Columns,
    /// Token of the change that produced the current values.
    pub ordering_token: OrderingToken,
}

/// Highest changelog sequence number already folded into a replica.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MergeCursor(SequenceNumber);

impl MergeCursor {
    pub const fn new(sequence_number: SequenceNumber) -> Self {
        Self(sequence_number)
    }

    pub fn sequence_number(&self) -> SequenceNumber {
        self.0
    }
}

/// Replica changes and cursor movement committed by one merge pass.
///
/// The batch commits only if the stored cursor still equals `expected_cursor`.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeBatch {
    pub expected_cursor: MergeCursor,
    pub new_cursor: MergeCursor,
    pub upserts: Vec<ReplicaRow>,
    /// Keys to remove, each with the token of the deleting change.
    pub deletes: Vec<(PrimaryKey, OrderingToken)>,
}
