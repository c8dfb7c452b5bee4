use std::collections::{HashMap, HashSet};
use std::time::Duration;

use cdc_config::shared::PgConnectionConfig;
use pg_escape::quote_identifier;
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tracing::{debug, info};

use crate::error::{CdcResult, ErrorKind};
use crate::failpoints::{COMMIT_MERGE__AFTER_APPLY, cdc_fail_point};
use crate::types::{
    AppendOutcome, ChangeRecord, ChangelogEntry, MergeBatch, MergeCursor, OrderingToken,
    PrimaryKey, ReplicaRow, SequenceNumber, TableBinding, TableName,
};
use crate::warehouse::base::{ChangelogStore, ReplicaStore, Warehouse};
use crate::{bail, cdc_error};

/// Table of the replica schema holding one merge cursor per table.
const MERGE_CURSORS_TABLE: &str = "_cdc_merge_cursors";

/// Duration after which idle connections are closed.
const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Returns the quoted `schema.table` name of `name`.
fn qualified(name: &TableName) -> String {
    format!(
        "{}.{}",
        quote_identifier(&name.dataset),
        quote_identifier(&name.table)
    )
}

/// Returns the quoted name of the index serving per-key token lookups on the changelog.
fn changelog_key_index(binding: &TableBinding) -> String {
    quote_identifier(&format!("{}_pk_token_idx", binding.changelog.table)).into_owned()
}

fn cursors_table(binding: &TableBinding) -> String {
    format!(
        "{}.{}",
        quote_identifier(&binding.replica.dataset),
        quote_identifier(MERGE_CURSORS_TABLE)
    )
}

/// Converts a sequence number to the `bigint` Postgres stores.
fn to_bigint(sequence_number: SequenceNumber) -> CdcResult<i64> {
    i64::try_from(sequence_number).map_err(|err| {
        cdc_error!(
            ErrorKind::ConversionError,
            "Sequence number out of range",
            format!("{sequence_number} does not fit a bigint"),
            source: err
        )
    })
}

fn canonical_keys(keys: &[PrimaryKey]) -> Vec<String> {
    keys.iter().map(PrimaryKey::canonical).collect()
}

/// Warehouse storing changelogs, replicas, and merge cursors in Postgres.
///
/// Datasets map to schemas and every table of the source gets a table of the same name in the
/// changelog and replica schemas. Merge cursors of every table live in a shared side table of the
/// replica schema.
#[derive(Debug, Clone)]
pub struct PostgresWarehouse {
    pool: PgPool,
}

impl PostgresWarehouse {
    /// Creates a warehouse on a lazily connected pool.
    pub fn new(config: &PgConnectionConfig, max_connections: u32) -> Self {
        let pool = PgPoolOptions::new()
            .min_connections(0)
            .max_connections(max_connections)
            .idle_timeout(Some(IDLE_TIMEOUT))
            .connect_lazy_with(config.with_db());

        Self { pool }
    }

    async fn token_map(
        &self,
        query: &str,
        keys: &[PrimaryKey],
        up_to: Option<SequenceNumber>,
    ) -> CdcResult<HashMap<String, OrderingToken>> {
        if keys.is_empty() {
            return Ok(HashMap::new());
        }

        let mut statement = sqlx::query(query).bind(canonical_keys(keys));
        if let Some(up_to) = up_to {
            statement = statement.bind(to_bigint(up_to)?);
        }

        let rows = statement.fetch_all(&self.pool).await?;
        let mut tokens = HashMap::with_capacity(rows.len());
        for row in rows {
            let primary_key: String = row.try_get("primary_key")?;
            let token: String = row.try_get("ordering_token")?;
            tokens.insert(primary_key, OrderingToken::from_hex(&token)?);
        }

        Ok(tokens)
    }
}

impl ChangelogStore for PostgresWarehouse {
    async fn prepare_table(&self, binding: &TableBinding) -> CdcResult<()> {
        let changelog = qualified(&binding.changelog);
        let replica = qualified(&binding.replica);
        let cursors = cursors_table(binding);
        let changelog_index = changelog_key_index(binding);

        let statements = [
            format!(
                "create schema if not exists {}",
                quote_identifier(&binding.changelog.dataset)
            ),
            format!(
                "create schema if not exists {}",
                quote_identifier(&binding.replica.dataset)
            ),
            format!(
                r#"
                create table if not exists {changelog} (
                    sequence_number bigint primary key,
                    dedupe_key text not null unique,
                    primary_key text not null,
                    ordering_token text not null,
                    kind text not null,
                    record jsonb not null,
                    arrival_time timestamptz not null
                )
                "#
            ),
            format!(
                "create index if not exists {changelog_index} \
                 on {changelog} (primary_key, ordering_token)"
            ),
            format!(
                r#"
                create table if not exists {replica} (
                    primary_key text primary key,
                    ordering_token text not null,
                    payload jsonb not null
                )
                "#
            ),
            format!(
                r#"
                create table if not exists {cursors} (
                    table_id text primary key,
                    merge_cursor bigint not null
                )
                "#
            ),
        ];

        let mut tx = self.pool.begin().await?;
        for statement in &statements {
            sqlx::query(statement).execute(&mut *tx).await?;
        }
        tx.commit().await?;

        info!(
            table_id = %binding.table_id,
            changelog = %binding.changelog,
            replica = %binding.replica,
            "prepared postgres tables"
        );

        Ok(())
    }

    async fn append_changes(
        &self,
        binding: &TableBinding,
        records: Vec<ChangeRecord>,
    ) -> CdcResult<AppendOutcome> {
        let changelog = qualified(&binding.changelog);

        let mut tx = self.pool.begin().await?;

        // Sequence numbers are assigned here, so concurrent appends to the same table must queue.
        sqlx::query(&format!("lock table {changelog} in share row exclusive mode"))
            .execute(&mut *tx)
            .await?;

        let last: i64 = sqlx::query_scalar(&format!(
            "select coalesce(max(sequence_number), 0) from {changelog}"
        ))
        .fetch_one(&mut *tx)
        .await?;

        let insert = format!(
            r#"
            insert into {changelog}
                (sequence_number, dedupe_key, primary_key, ordering_token, kind, record, arrival_time)
            values ($1, $2, $3, $4, $5, $6, $7)
            on conflict (dedupe_key) do nothing
            "#
        );

        let mut outcome = AppendOutcome::default();
        let mut next = last + 1;
        let mut seen = HashSet::with_capacity(records.len());
        for record in records {
            let dedupe_key = record.dedupe_key().to_string();
            if !seen.insert(dedupe_key.clone()) {
                outcome.duplicates += 1;
                continue;
            }

            let result = sqlx::query(&insert)
                .bind(next)
                .bind(dedupe_key)
                .bind(record.primary_key.canonical())
                .bind(record.ordering_token.to_hex())
                .bind(record.kind.as_str())
                .bind(Json(&record))
                .bind(record.arrival_time)
                .execute(&mut *tx)
                .await?;

            if result.rows_affected() == 1 {
                next += 1;
                outcome.appended += 1;
            } else {
                outcome.duplicates += 1;
            }
        }

        tx.commit().await?;

        outcome.last_sequence = SequenceNumber::try_from(next - 1).unwrap_or_default();

        debug!(
            table_id = %binding.table_id,
            appended = outcome.appended,
            duplicates = outcome.duplicates,
            last_sequence = outcome.last_sequence,
            "appended changes to postgres changelog"
        );

        Ok(outcome)
    }

    async fn committed_sequence(&self, binding: &TableBinding) -> CdcResult<SequenceNumber> {
        let last: i64 = sqlx::query_scalar(&format!(
            "select coalesce(max(sequence_number), 0) from {}",
            qualified(&binding.changelog)
        ))
        .fetch_one(&self.pool)
        .await?;

        Ok(SequenceNumber::try_from(last).unwrap_or_default())
    }

    async fn read_changelog(
        &self,
        binding: &TableBinding,
        after: SequenceNumber,
        up_to: SequenceNumber,
        limit: Option<usize>,
    ) -> CdcResult<Vec<ChangelogEntry>> {
        let limit = limit.map(|limit| i64::try_from(limit).unwrap_or(i64::MAX));

        // A null limit returns every row.
        let rows = sqlx::query(&format!(
            r#"
            select sequence_number, record
            from {}
            where sequence_number > $1 and sequence_number <= $2
            order by sequence_number
            limit $3
            "#,
            qualified(&binding.changelog)
        ))
        .bind(to_bigint(after)?)
        .bind(to_bigint(up_to)?)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let sequence_number: i64 = row.try_get("sequence_number")?;
            let Json(record): Json<ChangeRecord> = row.try_get("record")?;
            entries.push(ChangelogEntry {
                sequence_number: SequenceNumber::try_from(sequence_number).unwrap_or_default(),
                record,
            });
        }

        Ok(entries)
    }

    async fn merged_tokens(
        &self,
        binding: &TableBinding,
        keys: &[PrimaryKey],
        up_to: SequenceNumber,
    ) -> CdcResult<HashMap<String, OrderingToken>> {
        let query = format!(
            r#"
            select primary_key, max(ordering_token) as ordering_token
            from {}
            where primary_key = any($1) and sequence_number <= $2
            group by primary_key
            "#,
            qualified(&binding.changelog)
        );

        self.token_map(&query, keys, Some(up_to)).await
    }
}

impl ReplicaStore for PostgresWarehouse {
    async fn merge_cursor(&self, binding: &TableBinding) -> CdcResult<MergeCursor> {
        let cursor: Option<i64> = sqlx::query_scalar(&format!(
            "select merge_cursor from {} where table_id = $1",
            cursors_table(binding)
        ))
        .bind(binding.table_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(cursor
            .and_then(|cursor| SequenceNumber::try_from(cursor).ok())
            .map(MergeCursor::new)
            .unwrap_or_default())
    }

    async fn replica_tokens(
        &self,
        binding: &TableBinding,
        keys: &[PrimaryKey],
    ) -> CdcResult<HashMap<String, OrderingToken>> {
        let query = format!(
            "select primary_key, ordering_token from {} where primary_key = any($1)",
            qualified(&binding.replica)
        );

        self.token_map(&query, keys, None).await
    }

    async fn commit_merge(&self, binding: &TableBinding, batch: MergeBatch) -> CdcResult<()> {
        let replica = qualified(&binding.replica);
        let cursors = cursors_table(binding);

        let mut tx = self.pool.begin().await?;

        sqlx::query(&format!(
            "insert into {cursors} (table_id, merge_cursor) values ($1, 0) on conflict (table_id) do nothing"
        ))
        .bind(binding.table_id.as_str())
        .execute(&mut *tx)
        .await?;

        let stored: i64 = sqlx::query_scalar(&format!(
            "select merge_cursor from {cursors} where table_id = $1 for update"
        ))
        .bind(binding.table_id.as_str())
        .fetch_one(&mut *tx)
        .await?;

        let expected = to_bigint(batch.expected_cursor.sequence_number())?;
        if stored != expected {
            // Dropping the transaction rolls it back.
            bail!(
                ErrorKind::MergeCursorConflict,
                "Merge cursor moved during the merge pass",
                format!(
                    "Expected cursor {expected} for table '{}' but found {stored}",
                    binding.table_id
                )
            );
        }

        let upsert = format!(
            r#"
            insert into {replica} as replica (primary_key, ordering_token, payload)
            values ($1, $2, $3)
            on conflict (primary_key) do update
            set ordering_token = excluded.ordering_token, payload = excluded.payload
            where replica.ordering_token < excluded.ordering_token
            "#
        );
        for row in &batch.upserts {
            sqlx::query(&upsert)
                .bind(row.primary_key.canonical())
                .bind(row.ordering_token.to_hex())
                .bind(Json(row))
                .execute(&mut *tx)
                .await?;
        }

        let delete =
            format!("delete from {replica} where primary_key = $1 and ordering_token < $2");
        for (primary_key, token) in &batch.deletes {
            sqlx::query(&delete)
                .bind(primary_key.canonical())
                .bind(token.to_hex())
                .execute(&mut *tx)
                .await?;
        }

        cdc_fail_point(COMMIT_MERGE__AFTER_APPLY)?;

        sqlx::query(&format!(
            "update {cursors} set merge_cursor = $2 where table_id = $1"
        ))
        .bind(binding.table_id.as_str())
        .bind(to_bigint(batch.new_cursor.sequence_number())?)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(())
    }

    async fn read_replica(&self, binding: &TableBinding) -> CdcResult<Vec<ReplicaRow>> {
        let rows: Vec<Json<ReplicaRow>> = sqlx::query_scalar(&format!(
            "select payload from {} order by primary_key",
            qualified(&binding.replica)
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|Json(row)| row).collect())
    }
}

impl Warehouse for PostgresWarehouse {
    fn name() -> &'static str {
        "postgres"
    }

    async fn shutdown(&self) -> CdcResult<()> {
        self.pool.close().await;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::record::binding;

    #[test]
    fn names_are_quoted_per_schema() {
        let binding = binding("Orders");

        assert_eq!(qualified(&binding.changelog), r#"changelog."Orders""#);
        assert_eq!(qualified(&binding.replica), r#"replica."Orders""#);
        assert_eq!(cursors_table(&binding), "replica._cdc_merge_cursors");
    }

    #[test]
    fn changelog_key_index_is_named_after_the_table() {
        assert_eq!(changelog_key_index(&binding("orders")), "orders_pk_token_idx");
        assert_eq!(
            changelog_key_index(&binding("Orders")),
            r#""Orders_pk_token_idx""#
        );
    }

    #[test]
    fn sequence_numbers_beyond_bigint_are_rejected() {
        assert_eq!(to_bigint(42).unwrap(), 42);
        assert_eq!(
            to_bigint(u64::MAX).unwrap_err().kind(),
            ErrorKind::ConversionError
        );
    }
}
