use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use gcp_bigquery_client::Client;
use gcp_bigquery_client::client_builder::ClientBuilder;
use gcp_bigquery_client::model::{
    query_parameter::QueryParameter, query_parameter_type::QueryParameterType,
    query_parameter_value::QueryParameterValue, query_request::QueryRequest,
    query_response::ResultSet,
};
use serde_json::json;
use tracing::{debug, info};

use crate::error::{CdcResult, ErrorKind};
use crate::types::{
    AppendOutcome, ChangeRecord, ChangelogEntry, MergeBatch, MergeCursor, OrderingToken,
    PrimaryKey, ReplicaRow, SequenceNumber, TableBinding, TableName,
};
use crate::warehouse::base::{ChangelogStore, ReplicaStore, Warehouse};
use crate::{bail, cdc_error};

/// Table of the replica dataset holding one merge cursor per table.
const MERGE_CURSORS_TABLE: &str = "_cdc_merge_cursors";

/// Message raised by the merge script when the stored cursor moved.
const CURSOR_CONFLICT_MESSAGE: &str = "cdc merge cursor conflict";

/// Checks that `identifier` only holds letters, digits, and underscores.
///
/// Project ids may also contain hyphens.
fn validate_identifier(identifier: &str, context: &str, allow_hyphen: bool) -> CdcResult<()> {
    if identifier.is_empty() {
        bail!(
            ErrorKind::WarehouseTableNameInvalid,
            "Invalid BigQuery identifier",
            format!("{context} cannot be empty")
        );
    }

    let valid = identifier
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || (allow_hyphen && ch == '-'));
    if !valid {
        bail!(
            ErrorKind::WarehouseTableNameInvalid,
            "Invalid BigQuery identifier",
            format!("{context} '{identifier}' may only contain letters, digits, and underscores")
        );
    }

    Ok(())
}

fn string_parameter(name: &str, value: String) -> QueryParameter {
    QueryParameter {
        name: Some(name.to_string()),
        parameter_type: Some(QueryParameterType {
            r#type: "STRING".to_string(),
            array_type: None,
            struct_types: None,
        }),
        parameter_value: Some(QueryParameterValue {
            value: Some(value),
            array_values: None,
            struct_values: None,
        }),
    }
}

fn request(query: String, parameters: Vec<QueryParameter>) -> QueryRequest {
    let mut request = QueryRequest::new(query);
    request.query_parameters = Some(parameters);

    request
}

/// Returns the canonical keys as a JSON array, the form the queries unnest.
fn keys_parameter(keys: &[PrimaryKey]) -> CdcResult<QueryParameter> {
    let keys: Vec<String> = keys.iter().map(PrimaryKey::canonical).collect();

    Ok(string_parameter("keys", serde_json::to_string(&keys)?))
}

/// Warehouse storing changelogs, replicas, and merge cursors in BigQuery.
///
/// Appends and merge commits run as multi-statement transactions, so a failed call leaves
/// nothing behind.
#[derive(Clone)]
pub struct BigQueryWarehouse {
    project_id: String,
    client: Arc<Client>,
}

impl std::fmt::Debug for BigQueryWarehouse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BigQueryWarehouse")
            .field("project_id", &self.project_id)
            .finish()
    }
}

impl BigQueryWarehouse {
    /// Creates a warehouse authenticated with the service account key at `key_path`.
    pub async fn new_with_key_path(project_id: String, key_path: &str) -> CdcResult<Self> {
        validate_identifier(&project_id, "BigQuery project id", true)?;

        let client = ClientBuilder::new()
            .build_from_service_account_key_file(key_path)
            .await?;

        Ok(Self {
            project_id,
            client: Arc::new(client),
        })
    }

    /// Returns the backtick-quoted `project.dataset.table` name.
    fn full_table_name(&self, dataset: &str, table: &str) -> CdcResult<String> {
        validate_identifier(dataset, "BigQuery dataset id", false)?;
        validate_identifier(table, "BigQuery table id", false)?;

        Ok(format!("`{}.{dataset}.{table}`", self.project_id))
    }

    fn table(&self, name: &TableName) -> CdcResult<String> {
        self.full_table_name(&name.dataset, &name.table)
    }

    fn cursors_table(&self, binding: &TableBinding) -> CdcResult<String> {
        self.full_table_name(&binding.replica.dataset, MERGE_CURSORS_TABLE)
    }

    async fn query(&self, request: QueryRequest) -> CdcResult<ResultSet> {
        let response = self
            .client
            .job()
            .query(&self.project_id, request)
            .await?;

        Ok(ResultSet::new_from_query_response(response))
    }

    async fn token_map(
        &self,
        query: String,
        keys: &[PrimaryKey],
    ) -> CdcResult<HashMap<String, OrderingToken>> {
        if keys.is_empty() {
            return Ok(HashMap::new());
        }

        let mut result_set = self
            .query(request(query, vec![keys_parameter(keys)?]))
            .await?;

        let mut tokens = HashMap::new();
        while result_set.next_row() {
            let primary_key = result_set.get_string_by_name("primary_key")?;
            let token = result_set.get_string_by_name("ordering_token")?;
            if let (Some(primary_key), Some(token)) = (primary_key, token) {
                tokens.insert(primary_key, OrderingToken::from_hex(&token)?);
            }
        }

        Ok(tokens)
    }
}

impl ChangelogStore for BigQueryWarehouse {
    async fn prepare_table(&self, binding: &TableBinding) -> CdcResult<()> {
        let changelog = self.table(&binding.changelog)?;
        let replica = self.table(&binding.replica)?;
        let cursors = self.cursors_table(binding)?;
        let project_id = &self.project_id;

        let script = format!(
            r#"
            create schema if not exists `{project_id}.{changelog_dataset}`;
            create schema if not exists `{project_id}.{replica_dataset}`;
            create table if not exists {changelog} (
                sequence_number int64 not null,
                dedupe_key string not null,
                primary_key string not null,
                ordering_token string not null,
                kind string not null,
                record string not null,
                arrival_time timestamp not null
            );
            create table if not exists {replica} (
                primary_key string not null,
                ordering_token string not null,
                payload string not null
            );
            create table if not exists {cursors} (
                table_id string not null,
                merge_cursor int64 not null
            );
            "#,
            changelog_dataset = binding.changelog.dataset,
            replica_dataset = binding.replica.dataset,
        );

        self.query(QueryRequest::new(script)).await?;

        info!(
            table_id = %binding.table_id,
            changelog = %binding.changelog,
            replica = %binding.replica,
            "prepared bigquery tables"
        );

        Ok(())
    }

    async fn append_changes(
        &self,
        binding: &TableBinding,
        records: Vec<ChangeRecord>,
    ) -> CdcResult<AppendOutcome> {
        let changelog = self.table(&binding.changelog)?;

        let mut outcome = AppendOutcome::default();
        let mut seen = HashSet::with_capacity(records.len());
        let mut rows = Vec::with_capacity(records.len());
        for record in &records {
            let dedupe_key = record.dedupe_key().to_string();
            if !seen.insert(dedupe_key.clone()) {
                outcome.duplicates += 1;
                continue;
            }

            rows.push(json!({
                "dedupe_key": dedupe_key,
                "primary_key": record.primary_key.canonical(),
                "ordering_token": record.ordering_token.to_hex(),
                "kind": record.kind.as_str(),
                "record": serde_json::to_string(record)?,
                "arrival_time": record.arrival_time.to_rfc3339(),
            }));
        }

        // Rows already in the changelog are filtered inside the transaction and numbered after
        // the current maximum in batch order.
        let script = format!(
            r#"
            declare base_sequence int64;
            begin transaction;
            set base_sequence = (select coalesce(max(sequence_number), 0) from {changelog});
            insert into {changelog}
                (sequence_number, dedupe_key, primary_key, ordering_token, kind, record, arrival_time)
            select
                base_sequence + row_number() over (order by position),
                dedupe_key, primary_key, ordering_token, kind, record, timestamp(arrival_time)
            from (
                select
                    position,
                    json_value(item, '$.dedupe_key') as dedupe_key,
                    json_value(item, '$.primary_key') as primary_key,
                    json_value(item, '$.ordering_token') as ordering_token,
                    json_value(item, '$.kind') as kind,
                    json_value(item, '$.record') as record,
                    json_value(item, '$.arrival_time') as arrival_time
                from unnest(json_query_array(@rows)) as item with offset as position
            )
            where dedupe_key not in (select dedupe_key from {changelog});
            commit transaction;
            select
                base_sequence,
                (select coalesce(max(sequence_number), 0) from {changelog}) as last_sequence;
            "#
        );

        let parameters = vec![string_parameter("rows", serde_json::to_string(&rows)?)];
        let mut result_set = self.query(request(script, parameters)).await?;

        if !result_set.next_row() {
            bail!(
                ErrorKind::WarehouseQueryFailed,
                "BigQuery append returned no summary",
                format!("The append to {changelog} did not report its sequence numbers")
            );
        }
        let base = result_set.get_i64_by_name("base_sequence")?.unwrap_or(0);
        let last = result_set.get_i64_by_name("last_sequence")?.unwrap_or(0);

        let appended = u64::try_from(last - base).unwrap_or(0);
        outcome.appended = appended;
        outcome.duplicates += rows.len() as u64 - appended.min(rows.len() as u64);
        outcome.last_sequence = SequenceNumber::try_from(last).unwrap_or(0);

        debug!(
            table_id = %binding.table_id,
            appended = outcome.appended,
            duplicates = outcome.duplicates,
            last_sequence = outcome.last_sequence,
            "appended changes to bigquery changelog"
        );

        Ok(outcome)
    }

    async fn committed_sequence(&self, binding: &TableBinding) -> CdcResult<SequenceNumber> {
        let query = format!(
            "select coalesce(max(sequence_number), 0) as last_sequence from {}",
            self.table(&binding.changelog)?
        );

        let mut result_set = self.query(QueryRequest::new(query)).await?;
        let last = if result_set.next_row() {
            result_set.get_i64_by_name("last_sequence")?.unwrap_or(0)
        } else {
            0
        };

        Ok(SequenceNumber::try_from(last).unwrap_or(0))
    }

    async fn read_changelog(
        &self,
        binding: &TableBinding,
        after: SequenceNumber,
        up_to: SequenceNumber,
        limit: Option<usize>,
    ) -> CdcResult<Vec<ChangelogEntry>> {
        let limit = limit.map(|limit| format!("limit {limit}")).unwrap_or_default();
        let query = format!(
            r#"
            select sequence_number, record
            from {}
            where sequence_number > {after} and sequence_number <= {up_to}
            order by sequence_number
            {limit}
            "#,
            self.table(&binding.changelog)?
        );

        let mut result_set = self.query(QueryRequest::new(query)).await?;

        let mut entries = Vec::new();
        while result_set.next_row() {
            let sequence_number = result_set.get_i64_by_name("sequence_number")?;
            let record = result_set.get_string_by_name("record")?;
            let (Some(sequence_number), Some(record)) = (sequence_number, record) else {
                bail!(
                    ErrorKind::InvalidData,
                    "Changelog entry is incomplete",
                    format!("An entry of {} has no sequence number or record", binding.changelog)
                );
            };

            entries.push(ChangelogEntry {
                sequence_number: SequenceNumber::try_from(sequence_number).unwrap_or(0),
                record: serde_json::from_str(&record)?,
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
            where sequence_number <= {up_to}
                and primary_key in unnest(json_value_array(@keys))
            group by primary_key
            "#,
            self.table(&binding.changelog)?
        );

        self.token_map(query, keys).await
    }
}

impl ReplicaStore for BigQueryWarehouse {
    async fn merge_cursor(&self, binding: &TableBinding) -> CdcResult<MergeCursor> {
        let query = format!(
            "select merge_cursor from {} where table_id = @table_id",
            self.cursors_table(binding)?
        );
        let parameters = vec![string_parameter(
            "table_id",
            binding.table_id.to_string(),
        )];

        let mut result_set = self.query(request(query, parameters)).await?;
        if !result_set.next_row() {
            return Ok(MergeCursor::default());
        }

        let cursor = result_set.get_i64_by_name("merge_cursor")?.unwrap_or(0);

        Ok(MergeCursor::new(SequenceNumber::try_from(cursor).unwrap_or(0)))
    }

    async fn replica_tokens(
        &self,
        binding: &TableBinding,
        keys: &[PrimaryKey],
    ) -> CdcResult<HashMap<String, OrderingToken>> {
        let query = format!(
            r#"
            select primary_key, ordering_token
            from {}
            where primary_key in unnest(json_value_array(@keys))
            "#,
            self.table(&binding.replica)?
        );

        self.token_map(query, keys).await
    }

    async fn commit_merge(&self, binding: &TableBinding, batch: MergeBatch) -> CdcResult<()> {
        let replica = self.table(&binding.replica)?;
        let cursors = self.cursors_table(binding)?;
        let expected = batch.expected_cursor.sequence_number();
        let new_cursor = batch.new_cursor.sequence_number();

        let mut upserts = Vec::with_capacity(batch.upserts.len());
        for row in &batch.upserts {
            upserts.push(json!({
                "primary_key": row.primary_key.canonical(),
                "ordering_token": row.ordering_token.to_hex(),
                "payload": serde_json::to_string(row)?,
            }));
        }
        let deletes: Vec<_> = batch
            .deletes
            .iter()
            .map(|(primary_key, token)| {
                json!({
                    "primary_key": primary_key.canonical(),
                    "ordering_token": token.to_hex(),
                })
            })
            .collect();

        // An error raised inside the transaction rolls every statement back.
        let script = format!(
            r#"
            begin transaction;
            if coalesce((select max(merge_cursor) from {cursors} where table_id = @table_id), 0) != {expected} then
                raise using message = '{CURSOR_CONFLICT_MESSAGE}';
            end if;
            merge {replica} as target
            using (
                select
                    json_value(item, '$.primary_key') as primary_key,
                    json_value(item, '$.ordering_token') as ordering_token,
                    json_value(item, '$.payload') as payload
                from unnest(json_query_array(@upserts)) as item
            ) as source
            on target.primary_key = source.primary_key
            when matched and target.ordering_token < source.ordering_token then
                update set ordering_token = source.ordering_token, payload = source.payload
            when not matched then
                insert (primary_key, ordering_token, payload)
                values (source.primary_key, source.ordering_token, source.payload);
            delete from {replica} as target
            where exists (
                select 1
                from unnest(json_query_array(@deletes)) as item
                where json_value(item, '$.primary_key') = target.primary_key
                    and target.ordering_token < json_value(item, '$.ordering_token')
            );
            merge {cursors} as target
            using (select @table_id as table_id) as source
            on target.table_id = source.table_id
            when matched then update set merge_cursor = {new_cursor}
            when not matched then insert (table_id, merge_cursor) values (source.table_id, {new_cursor});
            commit transaction;
            "#
        );

        let parameters = vec![
            string_parameter("table_id", binding.table_id.to_string()),
            string_parameter("upserts", serde_json::to_string(&upserts)?),
            string_parameter("deletes", serde_json::to_string(&deletes)?),
        ];

        match self.query(request(script, parameters)).await {
            Ok(_) => Ok(()),
            Err(err) if err.to_string().contains(CURSOR_CONFLICT_MESSAGE) => Err(cdc_error!(
                ErrorKind::MergeCursorConflict,
                "Merge cursor moved during the merge pass",
                format!(
                    "Expected cursor {expected} for table '{}' but found another",
                    binding.table_id
                ),
                source: err
            )),
            Err(err) => Err(err),
        }
    }

    async fn read_replica(&self, binding: &TableBinding) -> CdcResult<Vec<ReplicaRow>> {
        let query = format!(
            "select payload from {} order by primary_key",
            self.table(&binding.replica)?
        );

        let mut result_set = self.query(QueryRequest::new(query)).await?;

        let mut rows = Vec::new();
        while result_set.next_row() {
            if let Some(payload) = result_set.get_string_by_name("payload")? {
                rows.push(serde_json::from_str(&payload)?);
            }
        }

        Ok(rows)
    }
}

impl Warehouse for BigQueryWarehouse {
    fn name() -> &'static str {
        "bigquery"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifiers_are_restricted_to_word_characters() {
        assert!(validate_identifier("orders_2024", "table", false).is_ok());
        assert!(validate_identifier("my-project-1", "project", true).is_ok());

        for invalid in ["", "orders-v2", "orders`; drop", "schema.orders"] {
            let err = validate_identifier(invalid, "table", false).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::WarehouseTableNameInvalid);
        }
    }

    #[test]
    fn string_parameters_are_named_and_typed() {
        let parameter = string_parameter("keys", r#"["{\"id\":1}"]"#.to_string());

        assert_eq!(parameter.name.as_deref(), Some("keys"));
        assert_eq!(
            parameter.parameter_type.map(|parameter_type| parameter_type.r#type),
            Some("STRING".to_string())
        );
    }
}
