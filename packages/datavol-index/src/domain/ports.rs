//! Ports (Trait Interfaces)
//!
//! Port/Adapter pattern for backend flexibility:
//! - Testing / warehouse emulation: InMemory (append-only, no transactions)
//! - Development: SQLite (zero-config, transactional)
//! - Production: PostgreSQL (pooled, transactional)
//!
//! The collaborator ports (`KeyValueStore`, `CommitGraph`, `ObjectStore`)
//! describe systems this crate talks to but does not own.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::models::{Column, CommitSha, Entry, Row, Sha, TableSchema, TreeChange, TreeId};
use super::query::{AntiJoin, LatestQuery, Predicate};
use crate::Result;

/// Concrete engine behind a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Memory,
    Sqlite,
    Postgres,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BackendKind::Memory => "memory",
            BackendKind::Sqlite => "sqlite",
            BackendKind::Postgres => "postgres",
        };
        f.write_str(name)
    }
}

/// Backend Connection Port (Primary Interface)
///
/// The normalized query surface every table backend implements. Inserts are
/// append-only, schema changes are additive, and nothing here updates or
/// deletes individual rows.
#[async_trait]
pub trait Connection: Send + Sync {
    fn kind(&self) -> BackendKind;

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Transaction Scope
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Whether `rollback_transaction` actually discards writes
    fn supports_transactions(&self) -> bool {
        false
    }

    async fn begin_transaction(&self) -> Result<()> {
        Ok(())
    }

    async fn commit_transaction(&self) -> Result<()> {
        Ok(())
    }

    async fn rollback_transaction(&self) -> Result<()> {
        Ok(())
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Schema
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Create the table if missing; an existing table is left untouched
    async fn create_table(&self, table: &str, schema: &TableSchema) -> Result<()>;

    /// Append columns the table lacks. Existing columns are skipped.
    async fn add_columns(&self, table: &str, columns: &[Column]) -> Result<()>;

    /// Current schema, `None` if the table does not exist
    async fn describe_table(&self, table: &str) -> Result<Option<TableSchema>>;

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Rows
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Append rows. Columns absent from a row are written as NULL; a row
    /// naming a column the table lacks is a `SchemaConflict`.
    async fn insert_rows(&self, table: &str, rows: &[Row]) -> Result<u64>;

    /// `SELECT ... WHERE key NOT IN (SELECT key FROM target)`, deduplicated
    async fn select_unseen(&self, query: &AntiJoin) -> Result<Vec<Row>>;

    /// Last-writer-wins rows per key, ordered by key
    async fn select_latest(&self, query: &LatestQuery) -> Result<Vec<Row>>;

    /// Distinct values of `column` across `tables`, split into
    /// `(not ending with suffix, ending with suffix)`
    async fn count_distinct_by_suffix(
        &self,
        tables: &[String],
        column: &str,
        suffix: &str,
    ) -> Result<(u64, u64)>;

    /// `SELECT COUNT(*) FROM table WHERE predicates`
    async fn count_rows(&self, table: &str, predicates: &[Predicate]) -> Result<u64>;

    /// Remove every row of the table
    async fn delete_all(&self, table: &str) -> Result<u64>;
}

/// Low-latency key-value store backing the TreeCache
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: &str) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;
}

/// Ref / commit-graph collaborator
///
/// Authoritative for what a ref looks like; the index and metadata store
/// only catch up to it.
#[async_trait]
pub trait CommitGraph: Send + Sync {
    /// Commit a ref points at, `None` for an unborn ref
    async fn get_ref(&self, name: &str) -> Result<Option<CommitSha>>;

    /// Tree hash a ref currently describes, `None` if it has none
    async fn tree_id(&self, reference: &str) -> Result<Option<TreeId>>;

    /// Overlay `entries` on the ref's current tree and point the ref at the
    /// resulting tree ("create tree")
    async fn write_tree(&self, reference: &str, entries: &[Entry]) -> Result<TreeId>;

    /// Record a commit for `tree_id` and advance HEAD to it
    async fn create_commit(&self, tree_id: &TreeId, message: &str) -> Result<CommitSha>;

    /// Paths that differ between two trees
    async fn diff_tree(&self, from: Option<&TreeId>, to: &TreeId) -> Result<Vec<TreeChange>>;
}

/// Content-addressed blob store collaborator
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store bytes under their hash, returning the handle kept in `Entry::url`
    async fn put(&self, sha: &Sha, bytes: &[u8]) -> Result<String>;

    async fn get(&self, url: &str) -> Result<Vec<u8>>;
}
