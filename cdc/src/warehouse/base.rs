use std::collections::HashMap;
use std::future::Future;

use crate::error::CdcResult;
use crate::types::{
    AppendOutcome, ChangeRecord, ChangelogEntry, MergeBatch, MergeCursor, OrderingToken,
    PrimaryKey, ReplicaRow, SequenceNumber, TableBinding,
};

/// Append-only, per-table history of change records.
///
/// Implementations assign contiguous sequence numbers starting at 1 and must make each
/// [`ChangelogStore::append_changes`] call all-or-nothing, so that a failed append can be retried
/// with the same records.
pub trait ChangelogStore {
    /// Creates the changelog, replica and cursor tables of `binding` if they do not exist.
    fn prepare_table(&self, binding: &TableBinding) -> impl Future<Output = CdcResult<()>> + Send;

    /// Appends `records` in order, skipping any whose dedupe identity is already durable or
    /// appeared earlier in the same batch.
    fn append_changes(
        &self,
        binding: &TableBinding,
        records: Vec<ChangeRecord>,
    ) -> impl Future<Output = CdcResult<AppendOutcome>> + Send;

    /// Returns the highest sequence number whose entry is durably committed, 0 when empty.
    fn committed_sequence(
        &self,
        binding: &TableBinding,
    ) -> impl Future<Output = CdcResult<SequenceNumber>> + Send;

    /// Reads entries with `after < sequence_number <= up_to` in sequence order, at most `limit`.
    fn read_changelog(
        &self,
        binding: &TableBinding,
        after: SequenceNumber,
        up_to: SequenceNumber,
        limit: Option<usize>,
    ) -> impl Future<Output = CdcResult<Vec<ChangelogEntry>>> + Send;

    /// Returns, per canonical key, the highest ordering token among entries with
    /// `sequence_number <= up_to`. Keys without such entries are absent.
    fn merged_tokens(
        &self,
        binding: &TableBinding,
        keys: &[PrimaryKey],
        up_to: SequenceNumber,
    ) -> impl Future<Output = CdcResult<HashMap<String, OrderingToken>>> + Send;
}

/// Materialized replica of each table plus its merge cursor.
pub trait ReplicaStore {
    /// Returns the stored cursor, [`MergeCursor::default`] when no pass committed yet.
    fn merge_cursor(
        &self,
        binding: &TableBinding,
    ) -> impl Future<Output = CdcResult<MergeCursor>> + Send;

    /// Returns the ordering token of the stored row, per canonical key, for the keys that have
    /// a row.
    fn replica_tokens(
        &self,
        binding: &TableBinding,
        keys: &[PrimaryKey],
    ) -> impl Future<Output = CdcResult<HashMap<String, OrderingToken>>> + Send;

    /// Applies `batch` and moves the cursor in one transaction.
    ///
    /// Fails with [`crate::error::ErrorKind::MergeCursorConflict`] and changes nothing when the
    /// stored cursor is not `batch.expected_cursor`.
    fn commit_merge(
        &self,
        binding: &TableBinding,
        batch: MergeBatch,
    ) -> impl Future<Output = CdcResult<()>> + Send;

    /// Reads every replica row of the table.
    fn read_replica(
        &self,
        binding: &TableBinding,
    ) -> impl Future<Output = CdcResult<Vec<ReplicaRow>>> + Send;
}

/// A warehouse holding both the changelogs and the replicas.
pub trait Warehouse: ChangelogStore + ReplicaStore {
    /// Name used in logs and run descriptors.
    fn name() -> &'static str;

    /// Releases connections. Called once when the pipeline stops.
    fn shutdown(&self) -> impl Future<Output = CdcResult<()>> + Send {
        async { Ok(()) }
    }
}
