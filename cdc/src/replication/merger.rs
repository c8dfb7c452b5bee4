use std::collections::BTreeMap;
use std::time::Instant;

use metrics::{counter, histogram};
use tracing::{debug, info};

use crate::bail;
use crate::error::{CdcResult, ErrorKind};
use crate::failpoints::{MERGE_PASS__AFTER_TRIGGER, cdc_fail_point};
use crate::metrics::{
    CDC_MERGE_DURATION_SECONDS, CDC_MERGE_PASSES_TOTAL, CDC_MERGED_ENTRIES_TOTAL,
    CDC_STALE_WINNERS_TOTAL, TABLE_ID_LABEL,
};
use crate::types::{
    ChangeKind, ChangeRecord, ChangelogEntry, MergeBatch, MergeCursor, PrimaryKey, ReplicaRow,
    TableBinding,
};
use crate::warehouse::base::Warehouse;

/// Summary of one merge pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    /// Cursor after the pass.
    pub cursor: MergeCursor,
    /// Changelog entries folded by the pass.
    pub entries: usize,
    pub upserts: usize,
    pub deletes: usize,
    /// Winners skipped because a newer version was already merged.
    pub stale: usize,
}

impl MergeOutcome {
    /// Returns `true` when the pass found nothing to fold and committed nothing.
    pub fn is_noop(&self) -> bool {
        self.entries == 0
    }
}

/// Picks the latest record of every primary key among `entries`, keyed by canonical key.
///
/// The latest record is the greatest by [`ChangeRecord::order_cmp`].
pub fn select_winners(entries: &[ChangelogEntry]) -> BTreeMap<String, &ChangeRecord> {
    let mut winners: BTreeMap<String, &ChangeRecord> = BTreeMap::new();
    for entry in entries {
        let record = &entry.record;
        winners
            .entry(record.primary_key.canonical())
            .and_modify(|winner| {
                if record.order_cmp(winner).is_gt() {
                    *winner = record;
                }
            })
            .or_insert(record);
    }

    winners
}

/// Folds the unmerged tail of a table's changelog into its replica.
#[derive(Debug)]
pub struct ReplicaMerger<W> {
    binding: TableBinding,
    warehouse: W,
    max_entries: Option<usize>,
}

impl<W> ReplicaMerger<W>
where
    W: Warehouse,
{
    pub fn new(binding: TableBinding, warehouse: W, max_entries: Option<usize>) -> Self {
        Self {
            binding,
            warehouse,
            max_entries,
        }
    }

    /// Runs one merge pass.
    ///
    /// Reads the entries after the stored cursor up to the committed high watermark, keeps the
    /// latest record per key, drops winners that are not newer than what was already merged,
    /// and commits the replica changes together with the new cursor. A failing pass leaves the
    /// replica and the cursor untouched.
    pub async fn merge_pass(&self) -> CdcResult<MergeOutcome> {
        let started = Instant::now();
        let table_id = self.binding.table_id.to_string();

        cdc_fail_point(MERGE_PASS__AFTER_TRIGGER)?;

        let cursor = self.warehouse.merge_cursor(&self.binding).await?;
        let committed = self.warehouse.committed_sequence(&self.binding).await?;
        if committed <= cursor.sequence_number() {
            debug!(table_id = %self.binding.table_id, cursor = cursor.sequence_number(), "nothing to merge");

            return Ok(MergeOutcome {
                cursor,
                ..MergeOutcome::default()
            });
        }

        let entries = self
            .warehouse
            .read_changelog(
                &self.binding,
                cursor.sequence_number(),
                committed,
                self.max_entries,
            )
            .await?;
        let Some(last) = entries.last() else {
            return Ok(MergeOutcome {
                cursor,
                ..MergeOutcome::default()
            });
        };
        let new_cursor = MergeCursor::new(last.sequence_number);

        let winners = select_winners(&entries);
        let keys: Vec<PrimaryKey> = winners
            .values()
            .map(|record| record.primary_key.clone())
            .collect();

        let mut prior = self.warehouse.replica_tokens(&self.binding, &keys).await?;
        let merged = self
            .warehouse
            .merged_tokens(&self.binding, &keys, cursor.sequence_number())
            .await?;
        for (canonical, token) in merged {
            let known = prior.entry(canonical).or_insert(token);
            *known = (*known).max(token);
        }

        let mut batch = MergeBatch {
            expected_cursor: cursor,
            new_cursor,
            upserts: vec![],
            deletes: vec![],
        };
        let mut stale = 0;
        for (canonical, winner) in winners {
            if prior
                .get(&canonical)
                .is_some_and(|token| *token >= winner.ordering_token)
            {
                stale += 1;
                continue;
            }

            match (winner.kind, &winner.columns) {
                (ChangeKind::Delete, _) => batch
                    .deletes
                    .push((winner.primary_key.clone(), winner.ordering_token)),
                (ChangeKind::Insert | ChangeKind::Update, Some(columns)) => {
                    batch.upserts.push(ReplicaRow {
                        primary_key: winner.primary_key.clone(),
                        columns: columns.clone(),
                        ordering_token: winner.ordering_token,
                    })
                }
                (kind @ (ChangeKind::Insert | ChangeKind::Update), None) => bail!(
                    ErrorKind::InvalidData,
                    "Changelog entry without columns",
                    format!(
                        "{kind} of key {canonical} at token {} carries no columns",
                        winner.ordering_token
                    )
                ),
            }
        }

        let outcome = MergeOutcome {
            cursor: new_cursor,
            entries: entries.len(),
            upserts: batch.upserts.len(),
            deletes: batch.deletes.len(),
            stale,
        };

        // The cursor moves even when every winner was stale.
        self.warehouse.commit_merge(&self.binding, batch).await?;

        counter!(CDC_MERGE_PASSES_TOTAL, TABLE_ID_LABEL => table_id.clone()).increment(1);
        counter!(CDC_MERGED_ENTRIES_TOTAL, TABLE_ID_LABEL => table_id.clone())
            .increment(outcome.entries as u64);
        counter!(CDC_STALE_WINNERS_TOTAL, TABLE_ID_LABEL => table_id.clone())
            .increment(outcome.stale as u64);
        histogram!(CDC_MERGE_DURATION_SECONDS, TABLE_ID_LABEL => table_id)
            .record(started.elapsed().as_secs_f64());

        info!(
            table_id = %self.binding.table_id,
            cursor = new_cursor.sequence_number(),
            entries = outcome.entries,
            upserts = outcome.upserts,
            deletes = outcome.deletes,
            stale = outcome.stale,
            "committed merge pass"
        );

        Ok(outcome)
    }
}
