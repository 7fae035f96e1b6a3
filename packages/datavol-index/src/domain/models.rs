//! Domain models for the volume index and metadata store

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use super::clock;
use crate::{Result, StorageError};

/// Longest accepted content hash (SHA-512 in hex)
pub const MAX_SHA_LEN: usize = 128;

// ═══════════════════════════════════════════════════════════════════════════
// Identifiers
// ═══════════════════════════════════════════════════════════════════════════

/// Content hash of a blob (lowercase hex)
///
/// Used as the dedup key for commits: a staged entry is promoted only if no
/// committed row carries the same hash.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Sha(String);

impl Sha {
    /// Parse and validate a content hash
    ///
    /// ```rust
    /// use datavol_index::Sha;
    ///
    /// assert!(Sha::parse("aa11").is_ok());
    /// assert!(Sha::parse("not-hex").is_err());
    /// ```
    pub fn parse(value: impl Into<String>) -> Result<Self> {
        let value = value.into();
        if value.is_empty() || value.len() > MAX_SHA_LEN {
            return Err(StorageError::validation(format!(
                "Content hash must be 1..={} hex chars, got {}",
                MAX_SHA_LEN,
                value.len()
            )));
        }
        if !value
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
        {
            return Err(StorageError::validation(format!(
                "Content hash is not lowercase hex: {}",
                value
            )));
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Sha {
    type Error = StorageError;

    fn try_from(value: String) -> Result<Self> {
        Sha::parse(value)
    }
}

impl From<Sha> for String {
    fn from(sha: Sha) -> Self {
        sha.0
    }
}

impl fmt::Display for Sha {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque tree hash supplied by the commit-graph layer
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TreeId(String);

impl TreeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TreeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Commit identifier returned by the commit-graph layer
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommitSha(String);

impl CommitSha {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CommitSha {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Cells, Columns, Schemas
// ═══════════════════════════════════════════════════════════════════════════

/// Column type of a backend table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Text,
    Integer,
    Float,
}

impl ColumnType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ColumnType::Text => "text",
            ColumnType::Integer => "integer",
            ColumnType::Float => "float",
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single cell value
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    #[default]
    Null,
    Text(String),
    Integer(i64),
    Float(f64),
}

impl Value {
    /// Column type this value requires, `None` for NULL
    pub fn column_type(&self) -> Option<ColumnType> {
        match self {
            Value::Null => None,
            Value::Text(_) => Some(ColumnType::Text),
            Value::Integer(_) => Some(ColumnType::Integer),
            Value::Float(_) => Some(ColumnType::Float),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v),
            Value::Integer(v) => Some(*v as f64),
            _ => None,
        }
    }

    /// Ordering used by predicates; numbers compare across integer/float,
    /// NULL and mismatched kinds are incomparable.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Text(a), Value::Text(b)) => Some(a.cmp(b)),
            (Value::Integer(a), Value::Integer(b)) => Some(a.cmp(b)),
            (Value::Integer(_) | Value::Float(_), Value::Integer(_) | Value::Float(_)) => {
                self.as_f64()?.partial_cmp(&other.as_f64()?)
            }
            _ => None,
        }
    }

    /// Convert a JSON metadata value.
    ///
    /// Only strings, integers and floats map to columns. JSON null maps to
    /// NULL; booleans, arrays and objects are rejected.
    pub fn from_json(key: &str, value: &serde_json::Value) -> Result<Self> {
        match value {
            serde_json::Value::Null => Ok(Value::Null),
            serde_json::Value::String(s) => Ok(Value::Text(s.clone())),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(Value::Integer(i))
                } else if n.is_u64() {
                    Err(StorageError::metadata_type_not_supported(key, "u64 > i64::MAX"))
                } else {
                    n.as_f64()
                        .map(Value::Float)
                        .ok_or_else(|| StorageError::metadata_type_not_supported(key, "number"))
                }
            }
            serde_json::Value::Bool(_) => {
                Err(StorageError::metadata_type_not_supported(key, "bool"))
            }
            serde_json::Value::Array(_) => {
                Err(StorageError::metadata_type_not_supported(key, "array"))
            }
            serde_json::Value::Object(_) => {
                Err(StorageError::metadata_type_not_supported(key, "object"))
            }
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Text(s) => serde_json::Value::String(s.clone()),
            Value::Integer(i) => serde_json::Value::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
        }
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

/// A table row: column name -> value. Absent columns read as NULL.
pub type Row = BTreeMap<String, Value>;

/// Named, typed column
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub ty: ColumnType,
}

impl Column {
    pub fn new(name: impl Into<String>, ty: ColumnType) -> Self {
        Self {
            name: name.into(),
            ty,
        }
    }
}

/// Ordered column registry of a table.
///
/// Columns keep their creation order and are only ever appended.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    columns: Vec<Column>,
}

impl TableSchema {
    pub fn new(columns: Vec<Column>) -> Self {
        let mut schema = Self::default();
        for column in columns {
            if schema.get(&column.name).is_none() {
                schema.columns.push(column);
            }
        }
        schema
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    pub fn get(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Add a column if absent.
    ///
    /// Returns `true` when the column was appended. Re-adding an existing
    /// column with the same type is a no-op; with another type it is a
    /// `SchemaConflict`.
    pub fn add(&mut self, column: Column) -> Result<bool> {
        match self.get(&column.name) {
            Some(existing) if existing.ty == column.ty => Ok(false),
            Some(existing) => Err(StorageError::schema_conflict(format!(
                "Column '{}' is {}, refusing to retype as {}",
                column.name, existing.ty, column.ty
            ))),
            None => {
                self.columns.push(column);
                Ok(true)
            }
        }
    }

    /// Columns of `self` that `other` lacks, in creation order
    pub fn missing_from(&self, other: &TableSchema) -> Vec<Column> {
        self.columns
            .iter()
            .filter(|c| !other.contains(&c.name))
            .cloned()
            .collect()
    }

    /// Fail if any shared column has a different type
    pub fn check_compatible(&self, other: &TableSchema) -> Result<()> {
        for column in &self.columns {
            if let Some(theirs) = other.get(&column.name) {
                if theirs.ty != column.ty {
                    return Err(StorageError::schema_conflict(format!(
                        "Column '{}' is {} in one table and {} in the other",
                        column.name, column.ty, theirs.ty
                    )));
                }
            }
        }
        Ok(())
    }

    /// Fail unless every cell of `row` fits a column of this schema
    pub fn check_row(&self, table: &str, row: &Row) -> Result<()> {
        for (name, value) in row {
            let column = self.get(name).ok_or_else(|| {
                StorageError::schema_conflict(format!("Table {} has no column '{}'", table, name))
            })?;
            if let Some(ty) = value.column_type() {
                if ty != column.ty {
                    return Err(StorageError::schema_conflict(format!(
                        "Column {}.{} is {}, got {}",
                        table, name, column.ty, ty
                    )));
                }
            }
        }
        Ok(())
    }

    /// Same set of columns with the same types (order ignored)
    pub fn same_columns(&self, other: &TableSchema) -> bool {
        self.len() == other.len() && self.missing_from(other).is_empty()
            && self.check_compatible(other).is_ok()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Index Entry
// ═══════════════════════════════════════════════════════════════════════════

pub const NAME_COLUMN: &str = "name";
pub const SHA_COLUMN: &str = "sha";
pub const TS_COLUMN: &str = "ts";

/// Stat attributes of a file
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct FileStat {
    pub ctime: f64,
    pub mtime: f64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
}

/// Index row: `path -> (content hash, stat attributes, url)`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    /// Path of the blob inside the volume
    pub name: String,
    pub sha: Sha,
    /// Seconds since the epoch
    pub ctime: f64,
    pub mtime: f64,
    /// Permission bits
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    /// Size in bytes
    pub size: u64,
    /// Object-store handle, absent when content is inlined elsewhere
    pub url: Option<String>,
    /// Insertion timestamp, restamped when staged
    pub ts: DateTime<Utc>,
}

impl Entry {
    pub fn new(name: impl Into<String>, sha: Sha, size: u64) -> Self {
        Self {
            name: name.into(),
            sha,
            ctime: 0.0,
            mtime: 0.0,
            mode: 0o644,
            uid: 0,
            gid: 0,
            size,
            url: None,
            ts: Utc::now(),
        }
    }

    pub fn with_stat(mut self, stat: FileStat) -> Self {
        self.ctime = stat.ctime;
        self.mtime = stat.mtime;
        self.mode = stat.mode;
        self.uid = stat.uid;
        self.gid = stat.gid;
        self
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn stat(&self) -> FileStat {
        FileStat {
            ctime: self.ctime,
            mtime: self.mtime,
            mode: self.mode,
            uid: self.uid,
            gid: self.gid,
        }
    }

    /// Table layout shared by the committed and staging index tables
    pub fn schema() -> TableSchema {
        TableSchema::new(vec![
            Column::new(NAME_COLUMN, ColumnType::Text),
            Column::new(SHA_COLUMN, ColumnType::Text),
            Column::new("ctime", ColumnType::Float),
            Column::new("mtime", ColumnType::Float),
            Column::new("mode", ColumnType::Integer),
            Column::new("uid", ColumnType::Integer),
            Column::new("gid", ColumnType::Integer),
            Column::new("size", ColumnType::Integer),
            Column::new("url", ColumnType::Text),
            Column::new(TS_COLUMN, ColumnType::Integer),
        ])
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(StorageError::validation("Entry name must not be empty"));
        }
        if self.size > i64::MAX as u64 {
            return Err(StorageError::validation(format!(
                "Entry {} size {} exceeds i64::MAX",
                self.name, self.size
            )));
        }
        Ok(())
    }

    pub fn to_row(&self) -> Row {
        let mut row = Row::new();
        row.insert(NAME_COLUMN.into(), Value::from(self.name.as_str()));
        row.insert(SHA_COLUMN.into(), Value::from(self.sha.as_str()));
        row.insert("ctime".into(), Value::Float(self.ctime));
        row.insert("mtime".into(), Value::Float(self.mtime));
        row.insert("mode".into(), Value::Integer(self.mode as i64));
        row.insert("uid".into(), Value::Integer(self.uid as i64));
        row.insert("gid".into(), Value::Integer(self.gid as i64));
        row.insert("size".into(), Value::Integer(self.size as i64));
        row.insert("url".into(), Value::from(self.url.clone()));
        row.insert(TS_COLUMN.into(), Value::Integer(clock::to_micros(&self.ts)));
        row
    }

    pub fn from_row(row: &Row) -> Result<Self> {
        let text = |column: &str| -> Result<String> {
            row.get(column)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| StorageError::serialization(format!("Missing {}", column)))
        };
        let int = |column: &str| -> i64 { row.get(column).and_then(Value::as_i64).unwrap_or(0) };
        let float =
            |column: &str| -> f64 { row.get(column).and_then(Value::as_f64).unwrap_or(0.0) };

        Ok(Self {
            name: text(NAME_COLUMN)?,
            sha: Sha::parse(text(SHA_COLUMN)?)?,
            ctime: float("ctime"),
            mtime: float("mtime"),
            mode: int("mode") as u32,
            uid: int("uid") as u32,
            gid: int("gid") as u32,
            size: int("size").max(0) as u64,
            url: row.get("url").and_then(Value::as_str).map(str::to_string),
            ts: clock::from_micros(int(TS_COLUMN)),
        })
    }
}

/// Result of `version_count_items` / `staging_count_items`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemCounts {
    /// Distinct names that are data files
    pub data_points: u64,
    /// Distinct names ending with the metadata-file suffix
    pub metadata_files: u64,
}

// ═══════════════════════════════════════════════════════════════════════════
// Metadata Record
// ═══════════════════════════════════════════════════════════════════════════

pub const META_SHA_COLUMN: &str = "_sha";
pub const META_COMMIT_COLUMN: &str = "_commit_sha";
pub const META_TS_COLUMN: &str = "_ts";

/// How a metadata write relates to the record already stored for its hash
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergePolicy {
    /// The latest write is the whole record; keys it omits read as absent
    #[default]
    Replace,
    /// The latest write is laid over the current head record when staged
    Merge,
}

/// Wide, sparse metadata row keyed by content hash
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataRecord {
    pub sha: Sha,
    /// Set once the record has been committed
    pub commit_sha: Option<CommitSha>,
    /// Write time, assigned when staged
    pub ts: Option<DateTime<Utc>>,
    pub fields: BTreeMap<String, Value>,
}

impl MetadataRecord {
    pub fn new(sha: Sha) -> Self {
        Self {
            sha,
            commit_sha: None,
            ts: None,
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Build from a JSON object carrying `_sha` plus free-form keys
    ///
    /// ```rust
    /// use datavol_index::MetadataRecord;
    ///
    /// let record = MetadataRecord::from_json(&serde_json::json!({
    ///     "_sha": "aa11",
    ///     "width": 100
    /// }))
    /// .unwrap();
    /// assert_eq!(record.sha.as_str(), "aa11");
    /// ```
    pub fn from_json(value: &serde_json::Value) -> Result<Self> {
        let object = value
            .as_object()
            .ok_or_else(|| StorageError::validation("Metadata record must be a JSON object"))?;
        let sha = object
            .get(META_SHA_COLUMN)
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| StorageError::validation("Metadata record is missing '_sha'"))?;

        let mut record = Self::new(Sha::parse(sha)?);
        for (key, value) in object {
            if key.starts_with('_') {
                continue;
            }
            let value = Value::from_json(key, value)?;
            if !value.is_null() {
                record.fields.insert(key.clone(), value);
            }
        }
        Ok(record)
    }

    pub fn to_json(&self) -> serde_json::Value {
        let mut object = serde_json::Map::new();
        object.insert(META_SHA_COLUMN.into(), self.sha.as_str().into());
        if let Some(commit) = &self.commit_sha {
            object.insert(META_COMMIT_COLUMN.into(), commit.as_str().into());
        }
        if let Some(ts) = &self.ts {
            object.insert(META_TS_COLUMN.into(), clock::to_micros(ts).into());
        }
        for (key, value) in &self.fields {
            object.insert(key.clone(), value.to_json());
        }
        serde_json::Value::Object(object)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Keys of `self` laid over `base`; keys only `base` carries survive
    pub fn overlay(&self, base: &MetadataRecord) -> MetadataRecord {
        let mut fields = base.fields.clone();
        fields.extend(self.fields.clone());
        MetadataRecord {
            sha: self.sha.clone(),
            commit_sha: self.commit_sha.clone(),
            ts: self.ts,
            fields,
        }
    }

    /// Columns every metadata table starts with
    pub fn base_schema() -> TableSchema {
        TableSchema::new(vec![
            Column::new(META_SHA_COLUMN, ColumnType::Text),
            Column::new(META_COMMIT_COLUMN, ColumnType::Text),
            Column::new(META_TS_COLUMN, ColumnType::Integer),
        ])
    }

    pub fn to_row(&self) -> Row {
        let mut row: Row = self
            .fields
            .iter()
            .filter(|(_, v)| !v.is_null())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        row.insert(META_SHA_COLUMN.into(), Value::from(self.sha.as_str()));
        row.insert(
            META_COMMIT_COLUMN.into(),
            Value::from(self.commit_sha.as_ref().map(|c| c.as_str().to_string())),
        );
        row.insert(
            META_TS_COLUMN.into(),
            Value::from(self.ts.as_ref().map(clock::to_micros)),
        );
        row
    }

    pub fn from_row(row: &Row) -> Result<Self> {
        let sha = row
            .get(META_SHA_COLUMN)
            .and_then(Value::as_str)
            .ok_or_else(|| StorageError::serialization("Metadata row is missing _sha"))?;

        let mut record = Self::new(Sha::parse(sha)?);
        record.commit_sha = row
            .get(META_COMMIT_COLUMN)
            .and_then(Value::as_str)
            .map(CommitSha::new);
        record.ts = row
            .get(META_TS_COLUMN)
            .and_then(Value::as_i64)
            .map(clock::from_micros);
        for (key, value) in row {
            if !key.starts_with('_') && !value.is_null() {
                record.fields.insert(key.clone(), value.clone());
            }
        }
        Ok(record)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Commit workflow
// ═══════════════════════════════════════════════════════════════════════════

/// Per-attempt commit state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommitState {
    /// Nothing staged since the last successful commit
    Clean,
    /// Staged rows waiting for a commit (also after a failed commit)
    Dirty,
    /// A commit is in progress
    Committing,
}

/// Kind of change between two trees
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    Added,
    Modified,
    Deleted,
}

/// One path that differs between two trees
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeChange {
    pub name: String,
    pub kind: ChangeKind,
    pub old_sha: Option<Sha>,
    pub new_sha: Option<Sha>,
}
