//! Common test utilities for datavol-index
//!
//! Fixtures, a fault-injecting `Connection` wrapper and tracing setup
//! shared by the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;

use datavol_index::application::Repository;
use datavol_index::config::EngineConfig;
use datavol_index::domain::{
    AntiJoin, BackendKind, Column, CommitGraph, Connection, KeyValueStore, LatestQuery,
    ObjectStore, Predicate, Row, TableSchema,
};
use datavol_index::infrastructure::{
    InMemoryCommitGraph, InMemoryConnection, InMemoryObjectStore, MokaKeyValueStore,
};
use datavol_index::{Entry, Result, Sha, StorageError};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

pub fn sha(s: &str) -> Sha {
    Sha::parse(s).unwrap()
}

pub fn entry(name: &str, hash: &str, size: u64) -> Entry {
    Entry::new(name, sha(hash), size)
}

pub fn config() -> EngineConfig {
    EngineConfig::new("acme", "images")
}

/// Everything a repository is wired from, kept so tests can reopen or
/// inspect the parts
pub struct Parts {
    pub conn: Arc<dyn Connection>,
    pub kv: Arc<dyn KeyValueStore>,
    pub graph: Arc<InMemoryCommitGraph>,
    pub objects: Arc<InMemoryObjectStore>,
}

impl Parts {
    pub fn with_connection(conn: Arc<dyn Connection>) -> Self {
        Self {
            conn,
            kv: Arc::new(MokaKeyValueStore::default()),
            graph: Arc::new(InMemoryCommitGraph::new()),
            objects: Arc::new(InMemoryObjectStore::new()),
        }
    }

    pub fn in_memory() -> Self {
        Self::with_connection(Arc::new(InMemoryConnection::new()))
    }

    pub async fn repository(&self, config: &EngineConfig) -> Repository {
        let graph: Arc<dyn CommitGraph> = self.graph.clone();
        let objects: Arc<dyn ObjectStore> = self.objects.clone();
        Repository::new(
            config,
            self.conn.clone(),
            self.conn.clone(),
            self.kv.clone(),
            graph,
            objects,
        )
        .await
        .unwrap()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Fault injection
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
struct Fault {
    op: &'static str,
    table: Option<String>,
    remaining: u32,
}

/// Wraps a connection and fails chosen calls with `BackendUnavailable`
pub struct FlakyConnection {
    inner: Arc<dyn Connection>,
    faults: Mutex<Vec<Fault>>,
    calls: Mutex<Vec<String>>,
}

impl FlakyConnection {
    pub fn new(inner: Arc<dyn Connection>) -> Self {
        Self {
            inner,
            faults: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Fail the next `op` call, on any table when `table` is `None`
    pub fn fail_on(&self, op: &'static str, table: Option<&str>) {
        self.faults.lock().push(Fault {
            op,
            table: table.map(str::to_string),
            remaining: 1,
        });
    }

    pub fn clear_faults(&self) {
        self.faults.lock().clear();
    }

    /// Calls seen so far, as `op` or `op:table`
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    fn check(&self, op: &'static str, table: Option<&str>) -> Result<()> {
        self.calls.lock().push(match table {
            Some(t) => format!("{}:{}", op, t),
            None => op.to_string(),
        });

        let mut faults = self.faults.lock();
        let hit = faults.iter_mut().find(|f| {
            f.op == op && f.remaining > 0 && (f.table.is_none() || f.table.as_deref() == table)
        });
        match hit {
            Some(fault) => {
                fault.remaining -= 1;
                Err(StorageError::backend_unavailable(format!(
                    "injected failure in {}",
                    op
                )))
            }
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Connection for FlakyConnection {
    fn kind(&self) -> BackendKind {
        self.inner.kind()
    }

    fn supports_transactions(&self) -> bool {
        self.inner.supports_transactions()
    }

    async fn begin_transaction(&self) -> Result<()> {
        self.check("begin_transaction", None)?;
        self.inner.begin_transaction().await
    }

    async fn commit_transaction(&self) -> Result<()> {
        self.check("commit_transaction", None)?;
        self.inner.commit_transaction().await
    }

    async fn rollback_transaction(&self) -> Result<()> {
        self.check("rollback_transaction", None)?;
        self.inner.rollback_transaction().await
    }

    async fn create_table(&self, table: &str, schema: &TableSchema) -> Result<()> {
        self.check("create_table", Some(table))?;
        self.inner.create_table(table, schema).await
    }

    async fn add_columns(&self, table: &str, columns: &[Column]) -> Result<()> {
        self.check("add_columns", Some(table))?;
        self.inner.add_columns(table, columns).await
    }

    async fn describe_table(&self, table: &str) -> Result<Option<TableSchema>> {
        self.check("describe_table", Some(table))?;
        self.inner.describe_table(table).await
    }

    async fn insert_rows(&self, table: &str, rows: &[Row]) -> Result<u64> {
        self.check("insert_rows", Some(table))?;
        self.inner.insert_rows(table, rows).await
    }

    async fn select_unseen(&self, query: &AntiJoin) -> Result<Vec<Row>> {
        self.check("select_unseen", Some(&query.source))?;
        self.inner.select_unseen(query).await
    }

    async fn select_latest(&self, query: &LatestQuery) -> Result<Vec<Row>> {
        self.check("select_latest", query.tables.first().map(String::as_str))?;
        self.inner.select_latest(query).await
    }

    async fn count_distinct_by_suffix(
        &self,
        tables: &[String],
        column: &str,
        suffix: &str,
    ) -> Result<(u64, u64)> {
        self.check("count_distinct_by_suffix", None)?;
        self.inner
            .count_distinct_by_suffix(tables, column, suffix)
            .await
    }

    async fn count_rows(&self, table: &str, predicates: &[Predicate]) -> Result<u64> {
        self.check("count_rows", Some(table))?;
        self.inner.count_rows(table, predicates).await
    }

    async fn delete_all(&self, table: &str) -> Result<u64> {
        self.check("delete_all", Some(table))?;
        self.inner.delete_all(table).await
    }
}
