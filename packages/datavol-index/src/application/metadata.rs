//! Metadata store
//!
//! Wide, sparse rows keyed by content hash. Columns appear the first time a
//! key is written and are never dropped or retyped; both tables are patched
//! before any row carrying the new key lands. Reads pick the latest `_ts`
//! per `_sha`.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::domain::clock;
use crate::domain::models::{
    Column, ColumnType, CommitSha, MergePolicy, MetadataRecord, Row, Sha, TableSchema, TreeId,
    Value, META_COMMIT_COLUMN, META_SHA_COLUMN, META_TS_COLUMN,
};
use crate::domain::ports::Connection;
use crate::domain::query::{CompareOp, LatestQuery, Predicate};
use crate::{Result, StorageError};

// Column names are always quoted, so dots and dashes are safe. A leading `_`
// is left to the base columns; 63 is the Postgres identifier limit.
static KEY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9_.\-]{0,62}$").expect("static regex"));

/// Right-hand side of a filter: a literal or a named variable
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Value(Value),
    Var(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub column: String,
    pub op: CompareOp,
    pub operand: Operand,
}

/// Template query over committed metadata
///
/// ```rust
/// use datavol_index::application::MetadataQuery;
/// use datavol_index::domain::CompareOp;
///
/// let query = MetadataQuery::new()
///     .select(["width"])
///     .filter_var("width", CompareOp::Ge, "min_width")
///     .bind("min_width", 100i64)
///     .limit(50);
/// assert_eq!(query.vars.len(), 1);
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetadataQuery {
    /// Fields to return besides `_sha`, `_commit_sha`, `_ts`; all when `None`
    pub select: Option<Vec<String>>,
    pub filters: Vec<Filter>,
    pub vars: BTreeMap<String, Value>,
    pub limit: Option<usize>,
    pub offset: usize,
}

impl MetadataQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn select<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.select = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    pub fn filter(mut self, column: impl Into<String>, op: CompareOp, value: impl Into<Value>) -> Self {
        self.filters.push(Filter {
            column: column.into(),
            op,
            operand: Operand::Value(value.into()),
        });
        self
    }

    pub fn filter_var(
        mut self,
        column: impl Into<String>,
        op: CompareOp,
        var: impl Into<String>,
    ) -> Self {
        self.filters.push(Filter {
            column: column.into(),
            op,
            operand: Operand::Var(var.into()),
        });
        self
    }

    pub fn bind(mut self, var: impl Into<String>, value: impl Into<Value>) -> Self {
        self.vars.insert(var.into(), value.into());
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }
}

fn validate_key(key: &str) -> Result<()> {
    if KEY_RE.is_match(key) {
        Ok(())
    } else {
        Err(StorageError::validation(format!(
            "Metadata key '{}' must start with a letter and contain only [A-Za-z0-9_.-] (max 63)",
            key
        )))
    }
}

/// Columns a batch of records needs; a key carrying two types is a conflict
fn columns_of(records: &[MetadataRecord]) -> Result<TableSchema> {
    let mut schema = TableSchema::default();
    for record in records {
        for (key, value) in &record.fields {
            validate_key(key)?;
            if let Some(ty) = value.column_type() {
                schema.add(Column::new(key.clone(), ty))?;
            }
        }
    }
    Ok(schema)
}

fn comparable(column: ColumnType, value: &Value) -> bool {
    matches!(
        (column, value.column_type()),
        (ColumnType::Text, Some(ColumnType::Text))
            | (
                ColumnType::Integer | ColumnType::Float,
                Some(ColumnType::Integer | ColumnType::Float)
            )
    )
}

pub struct MetadataDb {
    conn: Arc<dyn Connection>,
    committed: String,
    staging: String,
    policy: MergePolicy,
}

impl MetadataDb {
    pub fn new(
        conn: Arc<dyn Connection>,
        committed: impl Into<String>,
        staging: impl Into<String>,
        policy: MergePolicy,
    ) -> Self {
        Self {
            conn,
            committed: committed.into(),
            staging: staging.into(),
            policy,
        }
    }

    /// Create both tables with the base columns if missing
    pub async fn init(&self) -> Result<()> {
        let schema = MetadataRecord::base_schema();
        self.conn.create_table(&self.committed, &schema).await?;
        self.conn.create_table(&self.staging, &schema).await
    }

    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self.conn
    }

    pub fn policy(&self) -> MergePolicy {
        self.policy
    }

    async fn describe(&self, table: &str) -> Result<TableSchema> {
        self.conn
            .describe_table(table)
            .await?
            .ok_or_else(|| StorageError::table_not_found(table))
    }

    pub async fn committed_schema(&self) -> Result<TableSchema> {
        self.describe(&self.committed).await
    }

    pub async fn staging_schema(&self) -> Result<TableSchema> {
        self.describe(&self.staging).await
    }

    /// Patch both tables with every key of `record` they lack
    pub async fn add_missing_columns(&self, record: &MetadataRecord) -> Result<Vec<Column>> {
        let wanted = columns_of(std::slice::from_ref(record))?;
        self.ensure_columns(&wanted).await
    }

    async fn ensure_columns(&self, wanted: &TableSchema) -> Result<Vec<Column>> {
        if wanted.is_empty() {
            return Ok(Vec::new());
        }
        let staging = self.staging_schema().await?;
        let committed = self.committed_schema().await?;
        // Check both before patching either
        wanted.check_compatible(&staging)?;
        wanted.check_compatible(&committed)?;

        let mut added: Vec<Column> = Vec::new();
        for (table, current) in [(&self.staging, &staging), (&self.committed, &committed)] {
            let missing = wanted.missing_from(current);
            if missing.is_empty() {
                continue;
            }
            self.conn.add_columns(table, &missing).await?;
            info!(
                table = %table,
                columns = ?missing.iter().map(|c| c.name.as_str()).collect::<Vec<_>>(),
                "Evolved metadata schema"
            );
            for column in missing {
                if !added.contains(&column) {
                    added.push(column);
                }
            }
        }
        Ok(added)
    }

    /// Stage records. Every row gets a fresh `_ts`; unset columns read as
    /// NULL. Under `MergePolicy::Merge` each record is first laid over the
    /// current head record of its hash.
    pub async fn add_data(&self, records: &[MetadataRecord]) -> Result<u64> {
        if records.is_empty() {
            return Ok(0);
        }
        self.ensure_columns(&columns_of(records)?).await?;

        let mut heads: HashMap<Sha, MetadataRecord> = match self.policy {
            MergePolicy::Replace => HashMap::new(),
            MergePolicy::Merge => {
                let mut shas: Vec<Sha> = records.iter().map(|r| r.sha.clone()).collect();
                shas.sort();
                shas.dedup();
                self.query_head_data(&shas)
                    .await?
                    .into_iter()
                    .map(|r| (r.sha.clone(), r))
                    .collect()
            }
        };

        let mut rows: Vec<Row> = Vec::with_capacity(records.len());
        for record in records {
            let mut staged = match heads.get(&record.sha) {
                Some(head) => record.overlay(head),
                None => record.clone(),
            };
            staged.commit_sha = None;
            staged.ts = Some(clock::next_timestamp());
            rows.push(staged.to_row());
            if self.policy == MergePolicy::Merge {
                heads.insert(staged.sha.clone(), staged);
            }
        }

        let inserted = self.conn.insert_rows(&self.staging, &rows).await?;
        debug!(table = %self.staging, count = inserted, "Staged metadata records");
        Ok(inserted)
    }

    /// Promote the latest staged row per `_sha`, labelled with
    /// `commit_sha`, then truncate staging
    pub async fn commit(&self, commit_sha: &CommitSha, tree_id: &TreeId) -> Result<u64> {
        let staging = self.staging_schema().await?;
        let committed = self.committed_schema().await?;
        if !staging.same_columns(&committed) {
            return Err(StorageError::schema_conflict(format!(
                "Metadata tables {} and {} have diverged (missing in {}: {:?}, missing in {}: {:?}); run repair_schema",
                self.staging,
                self.committed,
                self.committed,
                staging.missing_from(&committed).iter().map(|c| &c.name).collect::<Vec<_>>(),
                self.staging,
                committed.missing_from(&staging).iter().map(|c| &c.name).collect::<Vec<_>>(),
            )));
        }

        let query = LatestQuery::new(
            vec![self.staging.clone()],
            META_SHA_COLUMN,
            META_TS_COLUMN,
            staging.names(),
        );
        let mut rows = self.conn.select_latest(&query).await?;
        for row in &mut rows {
            row.insert(
                META_COMMIT_COLUMN.to_string(),
                Value::from(commit_sha.as_str()),
            );
        }

        let promoted = if rows.is_empty() {
            0
        } else {
            self.conn.insert_rows(&self.committed, &rows).await?
        };
        self.conn.delete_all(&self.staging).await?;
        info!(commit = %commit_sha, tree = %tree_id, promoted, "Committed metadata");
        Ok(promoted)
    }

    /// Columns both tables carry, in staging order
    async fn readable_columns(&self) -> Result<Vec<String>> {
        let staging = self.staging_schema().await?;
        let committed = self.committed_schema().await?;
        if !staging.same_columns(&committed) {
            warn!(
                staging = %self.staging,
                committed = %self.committed,
                "Metadata schemas diverged, reading shared columns only"
            );
        }
        Ok(staging
            .columns()
            .iter()
            .filter(|c| committed.contains(&c.name))
            .map(|c| c.name.clone())
            .collect())
    }

    /// Current record per hash across staging and committed, ordered by hash.
    /// Hashes with no record are absent from the result.
    pub async fn query_head_data(&self, shas: &[Sha]) -> Result<Vec<MetadataRecord>> {
        if shas.is_empty() {
            return Ok(Vec::new());
        }
        let query = LatestQuery::new(
            vec![self.staging.clone(), self.committed.clone()],
            META_SHA_COLUMN,
            META_TS_COLUMN,
            self.readable_columns().await?,
        )
        .with_keys(shas.iter().map(|s| s.as_str().to_string()).collect());

        self.conn
            .select_latest(&query)
            .await?
            .iter()
            .map(MetadataRecord::from_row)
            .collect()
    }

    /// Filter committed records by field predicates; latest `_ts` per
    /// `_sha` only, ordered by `_sha`
    pub async fn query(&self, query: &MetadataQuery) -> Result<Vec<MetadataRecord>> {
        let schema = self.committed_schema().await?;

        let columns = match &query.select {
            None => schema.names(),
            Some(fields) => {
                let mut columns: Vec<String> = MetadataRecord::base_schema().names();
                for field in fields {
                    if !schema.contains(field) {
                        return Err(StorageError::validation(format!(
                            "Unknown metadata field '{}'",
                            field
                        )));
                    }
                    if !columns.contains(field) {
                        columns.push(field.clone());
                    }
                }
                columns
            }
        };

        let mut latest = LatestQuery::new(
            vec![self.committed.clone()],
            META_SHA_COLUMN,
            META_TS_COLUMN,
            columns,
        )
        .limit(query.limit)
        .offset(query.offset);

        for filter in &query.filters {
            let column = schema.get(&filter.column).ok_or_else(|| {
                StorageError::validation(format!("Unknown metadata field '{}'", filter.column))
            })?;
            let value = match &filter.operand {
                Operand::Value(value) => value.clone(),
                Operand::Var(name) => query.vars.get(name).cloned().ok_or_else(|| {
                    StorageError::validation(format!("Unbound query variable '{}'", name))
                })?,
            };
            if !comparable(column.ty, &value) {
                return Err(StorageError::validation(format!(
                    "Cannot compare {} field '{}' with {:?}",
                    column.ty, filter.column, value
                )));
            }
            latest = latest.filter(Predicate::new(filter.column.clone(), filter.op, value));
        }

        self.conn
            .select_latest(&latest)
            .await?
            .iter()
            .map(MetadataRecord::from_row)
            .collect()
    }

    /// Add columns present in one table but missing in the other.
    /// Never retypes; a type mismatch stays a `SchemaConflict`.
    pub async fn repair_schema(&self) -> Result<Vec<Column>> {
        let staging = self.staging_schema().await?;
        let committed = self.committed_schema().await?;
        staging.check_compatible(&committed)?;

        let to_committed = staging.missing_from(&committed);
        let to_staging = committed.missing_from(&staging);
        if !to_committed.is_empty() {
            self.conn.add_columns(&self.committed, &to_committed).await?;
        }
        if !to_staging.is_empty() {
            self.conn.add_columns(&self.staging, &to_staging).await?;
        }

        let mut repaired = to_committed;
        repaired.extend(to_staging);
        if !repaired.is_empty() {
            info!(
                columns = ?repaired.iter().map(|c| c.name.as_str()).collect::<Vec<_>>(),
                "Repaired metadata schema"
            );
        }
        Ok(repaired)
    }

    /// Committed rows, optionally only those for `sha`
    pub async fn committed_count(&self, sha: Option<&Sha>) -> Result<u64> {
        let predicates: Vec<Predicate> = sha
            .map(|s| vec![Predicate::eq(META_SHA_COLUMN, s.as_str())])
            .unwrap_or_default();
        self.conn.count_rows(&self.committed, &predicates).await
    }

    pub async fn staging_count(&self) -> Result<u64> {
        self.conn.count_rows(&self.staging, &[]).await
    }
}
