use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, Notify};

use crate::cdc_error;
use crate::error::{CdcError, CdcResult, ErrorKind};
use crate::test_utils::notify::TimedNotify;
use crate::types::{
    AppendOutcome, ChangeRecord, ChangelogEntry, MergeBatch, MergeCursor, OrderingToken,
    PrimaryKey, ReplicaRow, SequenceNumber, TableBinding, TableId,
};
use crate::warehouse::base::{ChangelogStore, ReplicaStore, Warehouse};

/// What a wrapped warehouse durably did so far, per table.
#[derive(Debug, Clone, Default)]
pub struct WarehouseActivity {
    /// Changelog entries created.
    pub appended: HashMap<TableId, u64>,
    /// Records dropped as duplicates.
    pub duplicates: HashMap<TableId, u64>,
    /// Committed merge passes.
    pub merges: HashMap<TableId, u64>,
    pub cursors: HashMap<TableId, MergeCursor>,
}

impl WarehouseActivity {
    pub fn appended(&self, table_id: &TableId) -> u64 {
        self.appended.get(table_id).copied().unwrap_or(0)
    }

    pub fn duplicates(&self, table_id: &TableId) -> u64 {
        self.duplicates.get(table_id).copied().unwrap_or(0)
    }

    pub fn merges(&self, table_id: &TableId) -> u64 {
        self.merges.get(table_id).copied().unwrap_or(0)
    }

    pub fn cursor(&self, table_id: &TableId) -> MergeCursor {
        self.cursors.get(table_id).copied().unwrap_or_default()
    }
}

type ActivityCondition = Box<dyn Fn(&WarehouseActivity) -> bool + Send + Sync>;

/// Failures to inject into the next calls of one operation.
#[derive(Debug, Default)]
struct Faults {
    remaining: u32,
    kind: Option<ErrorKind>,
}

impl Faults {
    fn next(&mut self, operation: &'static str) -> Option<CdcError> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;

        let kind = self.kind?;
        Some(cdc_error!(
            kind,
            "Injected warehouse failure",
            format!("{operation} was configured to fail")
        ))
    }
}

struct Inner {
    activity: WarehouseActivity,
    conditions: Vec<(ActivityCondition, Arc<Notify>)>,
    append_attempts: u64,
    commit_attempts: u64,
    append_faults: Faults,
    commit_faults: Faults,
    shutdown_called: bool,
}

impl Inner {
    fn check_conditions(&mut self) {
        let activity = &self.activity;
        self.conditions.retain(|(condition, notify)| {
            let satisfied = condition(activity);
            if satisfied {
                notify.notify_one();
            }
            !satisfied
        });
    }
}

/// Wraps a warehouse to record its activity and make chosen calls fail.
///
/// Conditions registered with [`TestWarehouseWrapper::notify_on_activity`] fire once the
/// recorded activity satisfies them, letting tests wait for appends and merges.
#[derive(Clone)]
pub struct TestWarehouseWrapper<W> {
    wrapped: W,
    inner: Arc<Mutex<Inner>>,
}

impl<W> std::fmt::Debug for TestWarehouseWrapper<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestWarehouseWrapper").finish_non_exhaustive()
    }
}

impl<W> TestWarehouseWrapper<W> {
    pub fn wrap(warehouse: W) -> Self {
        let inner = Inner {
            activity: WarehouseActivity::default(),
            conditions: Vec::new(),
            append_attempts: 0,
            commit_attempts: 0,
            append_faults: Faults::default(),
            commit_faults: Faults::default(),
            shutdown_called: false,
        };

        Self {
            wrapped: warehouse,
            inner: Arc::new(Mutex::new(inner)),
        }
    }

    /// Returns the wrapped warehouse, for inspecting its contents.
    pub fn inner(&self) -> &W {
        &self.wrapped
    }

    pub async fn activity(&self) -> WarehouseActivity {
        self.inner.lock().await.activity.clone()
    }

    /// Makes the next `count` appends fail with `kind` before reaching the warehouse.
    pub async fn fail_next_appends(&self, count: u32, kind: ErrorKind) {
        let mut inner = self.inner.lock().await;
        inner.append_faults = Faults {
            remaining: count,
            kind: Some(kind),
        };
    }

    /// Makes the next `count` merge commits fail with `kind` before reaching the warehouse.
    pub async fn fail_next_commits(&self, count: u32, kind: ErrorKind) {
        let mut inner = self.inner.lock().await;
        inner.commit_faults = Faults {
            remaining: count,
            kind: Some(kind),
        };
    }

    /// Returns how many appends were attempted, failed ones included.
    pub async fn append_attempts(&self) -> u64 {
        self.inner.lock().await.append_attempts
    }

    pub async fn commit_attempts(&self) -> u64 {
        self.inner.lock().await.commit_attempts
    }

    pub async fn shutdown_called(&self) -> bool {
        self.inner.lock().await.shutdown_called
    }

    /// Registers a notification fired once `condition` holds.
    pub async fn notify_on_activity<F>(&self, condition: F) -> TimedNotify
    where
        F: Fn(&WarehouseActivity) -> bool + Send + Sync + 'static,
    {
        let notify = Arc::new(Notify::new());
        let mut inner = self.inner.lock().await;
        inner.conditions.push((Box::new(condition), notify.clone()));

        // The condition may already hold.
        inner.check_conditions();

        TimedNotify::new(notify)
    }

    /// Fires once `table` has at least `count` changelog entries.
    pub async fn wait_for_appended(&self, table: &str, count: u64) -> TimedNotify {
        let table_id = TableId::from(table);
        self.notify_on_activity(move |activity| activity.appended(&table_id) >= count)
            .await
    }

    /// Fires once `table` has at least `count` committed merge passes.
    pub async fn wait_for_merges(&self, table: &str, count: u64) -> TimedNotify {
        let table_id = TableId::from(table);
        self.notify_on_activity(move |activity| activity.merges(&table_id) >= count)
            .await
    }

    async fn record<F>(&self, update: F)
    where
        F: FnOnce(&mut WarehouseActivity),
    {
        let mut inner = self.inner.lock().await;
        update(&mut inner.activity);
        inner.check_conditions();
    }
}

impl<W> ChangelogStore for TestWarehouseWrapper<W>
where
    W: Warehouse + Send + Sync,
{
    async fn prepare_table(&self, binding: &TableBinding) -> CdcResult<()> {
        self.wrapped.prepare_table(binding).await
    }

    async fn append_changes(
        &self,
        binding: &TableBinding,
        records: Vec<ChangeRecord>,
    ) -> CdcResult<AppendOutcome> {
        let fault = {
            let mut inner = self.inner.lock().await;
            inner.append_attempts += 1;
            inner.append_faults.next("append_changes")
        };
        if let Some(err) = fault {
            return Err(err);
        }

        let outcome = self.wrapped.append_changes(binding, records).await?;

        self.record(|activity| {
            *activity
                .appended
                .entry(binding.table_id.clone())
                .or_default() += outcome.appended;
            *activity
                .duplicates
                .entry(binding.table_id.clone())
                .or_default() += outcome.duplicates;
        })
        .await;

        Ok(outcome)
    }

    async fn committed_sequence(&self, binding: &TableBinding) -> CdcResult<SequenceNumber> {
        self.wrapped.committed_sequence(binding).await
    }

    async fn read_changelog(
        &self,
        binding: &TableBinding,
        after: SequenceNumber,
        up_to: SequenceNumber,
        limit: Option<usize>,
    ) -> CdcResult<Vec<ChangelogEntry>> {
        self.wrapped
            .read_changelog(binding, after, up_to, limit)
            .await
    }

    async fn merged_tokens(
        &self,
        binding: &TableBinding,
        keys: &[PrimaryKey],
        up_to: SequenceNumber,
    ) -> CdcResult<HashMap<String, OrderingToken>> {
        self.wrapped.merged_tokens(binding, keys, up_to).await
    }
}

impl<W> ReplicaStore for TestWarehouseWrapper<W>
where
    W: Warehouse + Send + Sync,
{
    async fn merge_cursor(&self, binding: &TableBinding) -> CdcResult<MergeCursor> {
        self.wrapped.merge_cursor(binding).await
    }

    async fn replica_tokens(
        &self,
        binding: &TableBinding,
        keys: &[PrimaryKey],
    ) -> CdcResult<HashMap<String, OrderingToken>> {
        self.wrapped.replica_tokens(binding, keys).await
    }

    async fn commit_merge(&self, binding: &TableBinding, batch: MergeBatch) -> CdcResult<()> {
        let fault = {
            let mut inner = self.inner.lock().await;
            inner.commit_attempts += 1;
            inner.commit_faults.next("commit_merge")
        };
        if let Some(err) = fault {
            return Err(err);
        }

        let new_cursor = batch.new_cursor;
        self.wrapped.commit_merge(binding, batch).await?;

        self.record(|activity| {
            *activity.merges.entry(binding.table_id.clone()).or_default() += 1;
            activity
                .cursors
                .insert(binding.table_id.clone(), new_cursor);
        })
        .await;

        Ok(())
    }

    async fn read_replica(&self, binding: &TableBinding) -> CdcResult<Vec<ReplicaRow>> {
        self.wrapped.read_replica(binding).await
    }
}

impl<W> Warehouse for TestWarehouseWrapper<W>
where
    W: Warehouse + Send + Sync,
{
    fn name() -> &'static str {
        W::name()
    }

    async fn shutdown(&self) -> CdcResult<()> {
        let result = self.wrapped.shutdown().await;
        self.inner.lock().await.shutdown_called = true;

        result
    }
}
