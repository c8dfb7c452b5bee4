use serde::{Deserialize, Serialize};

use crate::types::ChangeRecord;

/// Position of an entry in a table's changelog.
///
/// Numbers start at 1 and are contiguous per table. Zero means "before the first entry".
pub type SequenceNumber = u64;

/// A change record persisted in the changelog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangelogEntry {
    pub sequence_number: SequenceNumber,
    pub record: ChangeRecord,
}

/// Result of appending a batch of records to a changelog.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AppendOutcome {
    /// Records that became new entries.
    pub appended: u64,
    /// Records that were already durable, in the changelog or earlier in the same batch.
    pub duplicates: u64,
    /// Highest committed sequence number after the append.
    pub last_sequence: SequenceNumber,
}
