use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::bail;
use crate::error::{CdcResult, ErrorKind};
use crate::failpoints::{COMMIT_MERGE__AFTER_APPLY, cdc_fail_point};
use crate::types::{
    AppendOutcome, ChangeRecord, ChangelogEntry, DedupeKey, MergeBatch, MergeCursor,
    OrderingToken, PrimaryKey, ReplicaRow, SequenceNumber, TableBinding, TableId,
};
use crate::warehouse::base::{ChangelogStore, ReplicaStore, Warehouse};

#[derive(Debug, Default)]
struct MemoryTable {
    changelog: Vec<ChangelogEntry>,
    durable: HashSet<DedupeKey>,
    /// Rows by canonical primary key.
    replica: BTreeMap<String, ReplicaRow>,
    cursor: MergeCursor,
}

impl MemoryTable {
    fn last_sequence(&self) -> SequenceNumber {
        self.changelog
            .last()
            .map(|entry| entry.sequence_number)
            .unwrap_or(0)
    }
}

#[derive(Debug, Default)]
struct Inner {
    tables: HashMap<TableId, MemoryTable>,
}

/// Warehouse keeping changelogs and replicas in process memory.
///
/// Useful for tests and embedding. Everything is lost when the process exits.
///
/// ```rust,no_run
/// use cdc::warehouse::memory::MemoryWarehouse;
///
/// let warehouse = MemoryWarehouse::new();
/// // Hand a clone to the pipeline and inspect the original afterwards.
/// let _ = warehouse.clone();
/// ```
#[derive(Debug, Clone, Default)]
pub struct MemoryWarehouse {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the changelog of a table, empty if the table is unknown.
    pub async fn changelog(&self, table_id: &TableId) -> Vec<ChangelogEntry> {
        let inner = self.inner.lock().await;
        inner
            .tables
            .get(table_id)
            .map(|table| table.changelog.clone())
            .unwrap_or_default()
    }

    /// Returns the replica rows of a table by canonical primary key.
    pub async fn replica(&self, table_id: &TableId) -> BTreeMap<String, ReplicaRow> {
        let inner = self.inner.lock().await;
        inner
            .tables
            .get(table_id)
            .map(|table| table.replica.clone())
            .unwrap_or_default()
    }

    pub async fn cursor(&self, table_id: &TableId) -> MergeCursor {
        let inner = self.inner.lock().await;
        inner
            .tables
            .get(table_id)
            .map(|table| table.cursor)
            .unwrap_or_default()
    }

    /// Returns the identifiers of every table that has been prepared.
    pub async fn table_ids(&self) -> Vec<TableId> {
        let inner = self.inner.lock().await;
        let mut table_ids: Vec<_> = inner.tables.keys().cloned().collect();
        table_ids.sort();

        table_ids
    }
}

/// Collects the tokens `token_of` knows for `keys`, by canonical key.
fn lookup_tokens(
    keys: &[PrimaryKey],
    token_of: impl Fn(&str) -> Option<OrderingToken>,
) -> HashMap<String, OrderingToken> {
    keys.iter()
        .filter_map(|key| {
            let canonical = key.canonical();
            token_of(&canonical).map(|token| (canonical, token))
        })
        .collect()
}

impl ChangelogStore for MemoryWarehouse {
    async fn prepare_table(&self, binding: &TableBinding) -> CdcResult<()> {
        let mut inner = self.inner.lock().await;
        inner.tables.entry(binding.table_id.clone()).or_default();

        info!(table_id = %binding.table_id, "prepared memory tables");

        Ok(())
    }

    async fn append_changes(
        &self,
        binding: &TableBinding,
        records: Vec<ChangeRecord>,
    ) -> CdcResult<AppendOutcome> {
        let mut inner = self.inner.lock().await;
        let table = inner.tables.entry(binding.table_id.clone()).or_default();

        let mut outcome = AppendOutcome::default();
        for record in records {
            if !table.durable.insert(record.dedupe_key()) {
                outcome.duplicates += 1;
                continue;
            }

            let sequence_number = table.last_sequence() + 1;
            table.changelog.push(ChangelogEntry {
                sequence_number,
                record,
            });
            outcome.appended += 1;
        }
        outcome.last_sequence = table.last_sequence();

        debug!(
            table_id = %binding.table_id,
            appended = outcome.appended,
            duplicates = outcome.duplicates,
            "appended changes to memory changelog"
        );

        Ok(outcome)
    }

    async fn committed_sequence(&self, binding: &TableBinding) -> CdcResult<SequenceNumber> {
        let inner = self.inner.lock().await;

        Ok(inner
            .tables
            .get(&binding.table_id)
            .map(MemoryTable::last_sequence)
            .unwrap_or(0))
    }

    async fn read_changelog(
        &self,
        binding: &TableBinding,
        after: SequenceNumber,
        up_to: SequenceNumber,
        limit: Option<usize>,
    ) -> CdcResult<Vec<ChangelogEntry>> {
        let inner = self.inner.lock().await;
        let Some(table) = inner.tables.get(&binding.table_id) else {
            return Ok(vec![]);
        };

        // Sequence numbers are contiguous from 1, so they double as vector indexes.
        let start = usize::try_from(after).unwrap_or(usize::MAX);
        let end = usize::try_from(up_to)
            .unwrap_or(usize::MAX)
            .min(table.changelog.len());
        if start >= end {
            return Ok(vec![]);
        }

        let entries = table.changelog[start..end].iter().cloned();
        Ok(match limit {
            Some(limit) => entries.take(limit).collect(),
            None => entries.collect(),
        })
    }

    async fn merged_tokens(
        &self,
        binding: &TableBinding,
        keys: &[PrimaryKey],
        up_to: SequenceNumber,
    ) -> CdcResult<HashMap<String, OrderingToken>> {
        let inner = self.inner.lock().await;
        let Some(table) = inner.tables.get(&binding.table_id) else {
            return Ok(HashMap::new());
        };

        let mut highest: HashMap<String, OrderingToken> = HashMap::new();
        for entry in table
            .changelog
            .iter()
            .take_while(|entry| entry.sequence_number <= up_to)
        {
            let token = highest
                .entry(entry.record.primary_key.canonical())
                .or_insert(entry.record.ordering_token);
            *token = (*token).max(entry.record.ordering_token);
        }

        Ok(lookup_tokens(keys, |canonical| highest.get(canonical).copied()))
    }
}

impl ReplicaStore for MemoryWarehouse {
    async fn merge_cursor(&self, binding: &TableBinding) -> CdcResult<MergeCursor> {
        Ok(self.cursor(&binding.table_id).await)
    }

    async fn replica_tokens(
        &self,
        binding: &TableBinding,
        keys: &[PrimaryKey],
    ) -> CdcResult<HashMap<String, OrderingToken>> {
        let inner = self.inner.lock().await;
        let Some(table) = inner.tables.get(&binding.table_id) else {
            return Ok(HashMap::new());
        };

        Ok(lookup_tokens(keys, |canonical| {
            table.replica.get(canonical).map(|row| row.ordering_token)
        }))
    }

    async fn commit_merge(&self, binding: &TableBinding, batch: MergeBatch) -> CdcResult<()> {
        let mut inner = self.inner.lock().await;
        let table = inner.tables.entry(binding.table_id.clone()).or_default();

        if table.cursor != batch.expected_cursor {
            bail!(
                ErrorKind::MergeCursorConflict,
                "Merge cursor moved during the merge pass",
                format!(
                    "Expected cursor {} for table '{}' but found {}",
                    batch.expected_cursor.sequence_number(),
                    binding.table_id,
                    table.cursor.sequence_number()
                )
            );
        }

        // Changes are staged on a copy which only replaces the replica once everything applied.
        let mut staged = table.replica.clone();
        for row in batch.upserts {
            let canonical = row.primary_key.canonical();
            if staged
                .get(&canonical)
                .is_none_or(|existing| existing.ordering_token < row.ordering_token)
            {
                staged.insert(canonical, row);
            }
        }
        for (primary_key, token) in batch.deletes {
            let canonical = primary_key.canonical();
            if staged
                .get(&canonical)
                .is_some_and(|existing| existing.ordering_token < token)
            {
                staged.remove(&canonical);
            }
        }

        cdc_fail_point(COMMIT_MERGE__AFTER_APPLY)?;

        table.replica = staged;
        table.cursor = batch.new_cursor;

        Ok(())
    }

    async fn read_replica(&self, binding: &TableBinding) -> CdcResult<Vec<ReplicaRow>> {
        Ok(self
            .replica(&binding.table_id)
            .await
            .into_values()
            .collect())
    }
}

impl Warehouse for MemoryWarehouse {
    fn name() -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::record::{binding, delete, insert, update};

    #[tokio::test]
    async fn duplicates_do_not_consume_sequence_numbers() {
        let warehouse = MemoryWarehouse::new();
        let binding = binding("orders");

        let outcome = warehouse
            .append_changes(&binding, vec![insert(1, 10), insert(1, 10), update(1, 11)])
            .await
            .unwrap();
        assert_eq!(
            outcome,
            AppendOutcome {
                appended: 2,
                duplicates: 1,
                last_sequence: 2,
            }
        );

        let outcome = warehouse
            .append_changes(&binding, vec![update(1, 11), delete(1, 12)])
            .await
            .unwrap();
        assert_eq!(outcome.appended, 1);
        assert_eq!(outcome.last_sequence, 3);

        let sequences: Vec<_> = warehouse
            .changelog(&binding.table_id)
            .await
            .iter()
            .map(|entry| entry.sequence_number)
            .collect();
        assert_eq!(sequences, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn reads_changelog_range_with_limit() {
        let warehouse = MemoryWarehouse::new();
        let binding = binding("orders");
        let records = (1..=5).map(|token| insert(token as i64, token)).collect();
        warehouse.append_changes(&binding, records).await.unwrap();

        let entries = warehouse
            .read_changelog(&binding, 1, 4, None)
            .await
            .unwrap();
        assert_eq!(
            entries.iter().map(|e| e.sequence_number).collect::<Vec<_>>(),
            vec![2, 3, 4]
        );

        let entries = warehouse
            .read_changelog(&binding, 1, 4, Some(2))
            .await
            .unwrap();
        assert_eq!(entries.len(), 2);
        assert!(warehouse
            .read_changelog(&binding, 5, 9, None)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn commit_with_stale_cursor_changes_nothing() {
        let warehouse = MemoryWarehouse::new();
        let binding = binding("orders");
        let row = ReplicaRow {
            primary_key: insert(1, 1).primary_key,
            columns: insert(1, 1).columns.unwrap(),
            ordering_token: OrderingToken::new(1),
        };

        let err = warehouse
            .commit_merge(
                &binding,
                MergeBatch {
                    expected_cursor: MergeCursor::new(3),
                    new_cursor: MergeCursor::new(4),
                    upserts: vec![row],
                    deletes: vec![],
                },
            )
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::MergeCursorConflict);
        assert!(warehouse.replica(&binding.table_id).await.is_empty());
        assert_eq!(warehouse.cursor(&binding.table_id).await, MergeCursor::new(0));
    }
}
