//! SQLite Connection
//!
//! File-based transactional backend. A single connection sits behind a
//! mutex; the transaction scope is an explicit `BEGIN` held open until
//! `commit_transaction` / `rollback_transaction`.

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::types::{Value as SqlValue, ValueRef};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::sql::{self, Dialect, Statement};
use crate::domain::models::{Column, ColumnType, Row, TableSchema, Value};
use crate::domain::ports::{BackendKind, Connection};
use crate::domain::query::{AntiJoin, LatestQuery, Predicate};
use crate::{Result, StorageError};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// SQLite-based Connection implementation
#[derive(Clone)]
pub struct SqliteConnection {
    conn: Arc<Mutex<rusqlite::Connection>>,
    in_transaction: Arc<AtomicBool>,
}

impl SqliteConnection {
    /// Open (or create) a database file
    pub fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let conn = rusqlite::Connection::open(db_path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Ok(Self::wrap(conn))
    }

    /// Private in-memory database (for testing)
    pub fn in_memory() -> Result<Self> {
        Ok(Self::wrap(rusqlite::Connection::open_in_memory()?))
    }

    fn wrap(conn: rusqlite::Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
            in_transaction: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn in_transaction(&self) -> bool {
        self.in_transaction.load(Ordering::Acquire)
    }
}

fn to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Text(s) => SqlValue::Text(s.clone()),
        Value::Integer(i) => SqlValue::Integer(*i),
        Value::Float(f) => SqlValue::Real(*f),
    }
}

fn from_sql(value: ValueRef<'_>) -> Result<Value> {
    match value {
        ValueRef::Null => Ok(Value::Null),
        ValueRef::Integer(i) => Ok(Value::Integer(i)),
        ValueRef::Real(f) => Ok(Value::Float(f)),
        ValueRef::Text(bytes) => String::from_utf8(bytes.to_vec())
            .map(Value::Text)
            .map_err(|e| StorageError::serialization(format!("Non UTF-8 text cell: {}", e))),
        ValueRef::Blob(_) => Err(StorageError::serialization("Unexpected BLOB cell")),
    }
}

fn query_rows(conn: &rusqlite::Connection, stmt: &Statement) -> Result<Vec<Row>> {
    let mut prepared = conn.prepare(&stmt.sql)?;
    let names: Vec<String> = prepared
        .column_names()
        .into_iter()
        .map(str::to_string)
        .collect();
    let mut cursor = prepared.query(rusqlite::params_from_iter(stmt.params.iter().map(to_sql)))?;

    let mut rows = Vec::new();
    while let Some(record) = cursor.next()? {
        let mut row = Row::new();
        for (i, name) in names.iter().enumerate() {
            row.insert(name.clone(), from_sql(record.get_ref(i)?)?);
        }
        rows.push(row);
    }
    Ok(rows)
}

fn describe(conn: &rusqlite::Connection, table: &str) -> Result<Option<TableSchema>> {
    let mut stmt = conn.prepare("SELECT name, type FROM pragma_table_info(?1) ORDER BY cid")?;
    let columns = stmt
        .query_map([table], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    if columns.is_empty() {
        return Ok(None);
    }

    let columns = columns
        .into_iter()
        .map(|(name, declared)| {
            let ty = Dialect::Sqlite.parse_column_type(&declared).unwrap_or(ColumnType::Text);
            Column::new(name, ty)
        })
        .collect();
    Ok(Some(TableSchema::new(columns)))
}

#[async_trait]
impl Connection for SqliteConnection {
    fn kind(&self) -> BackendKind {
        BackendKind::Sqlite
    }

    fn supports_transactions(&self) -> bool {
        true
    }

    async fn begin_transaction(&self) -> Result<()> {
        let conn = self.conn.lock();
        if self.in_transaction.load(Ordering::Acquire) {
            return Err(StorageError::transaction("SQLite transaction already open"));
        }
        conn.execute_batch("BEGIN IMMEDIATE")?;
        self.in_transaction.store(true, Ordering::Release);
        Ok(())
    }

    async fn commit_transaction(&self) -> Result<()> {
        let conn = self.conn.lock();
        if !self.in_transaction.load(Ordering::Acquire) {
            return Err(StorageError::transaction("No SQLite transaction to commit"));
        }
        conn.execute_batch("COMMIT")?;
        self.in_transaction.store(false, Ordering::Release);
        Ok(())
    }

    async fn rollback_transaction(&self) -> Result<()> {
        let conn = self.conn.lock();
        if !self.in_transaction.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        conn.execute_batch("ROLLBACK")?;
        Ok(())
    }

    async fn create_table(&self, table: &str, schema: &TableSchema) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(&sql::create_table(Dialect::Sqlite, table, schema), [])?;
        Ok(())
    }

    async fn add_columns(&self, table: &str, columns: &[Column]) -> Result<()> {
        let conn = self.conn.lock();
        let mut schema =
            describe(&conn, table)?.ok_or_else(|| StorageError::table_not_found(table))?;
        for column in columns {
            if schema.add(column.clone())? {
                debug!(table, column = %column.name, ty = %column.ty, "Adding column");
                conn.execute(&sql::add_column(Dialect::Sqlite, table, column), [])?;
            }
        }
        Ok(())
    }

    async fn describe_table(&self, table: &str) -> Result<Option<TableSchema>> {
        let conn = self.conn.lock();
        describe(&conn, table)
    }

    async fn insert_rows(&self, table: &str, rows: &[Row]) -> Result<u64> {
        let mut conn = self.conn.lock();
        let schema = describe(&conn, table)?.ok_or_else(|| StorageError::table_not_found(table))?;
        for row in rows {
            schema.check_row(table, row)?;
        }

        // Savepoint keeps a split batch atomic, inside or outside BEGIN
        let savepoint = conn.savepoint()?;
        let mut inserted = 0u64;
        for stmt in sql::insert(Dialect::Sqlite, table, rows) {
            inserted += savepoint.execute(
                &stmt.sql,
                rusqlite::params_from_iter(stmt.params.iter().map(to_sql)),
            )? as u64;
        }
        savepoint.commit()?;
        Ok(inserted)
    }

    async fn select_unseen(&self, query: &AntiJoin) -> Result<Vec<Row>> {
        let conn = self.conn.lock();
        query_rows(&conn, &sql::select_unseen(Dialect::Sqlite, query))
    }

    async fn select_latest(&self, query: &LatestQuery) -> Result<Vec<Row>> {
        let conn = self.conn.lock();
        query_rows(&conn, &sql::select_latest(Dialect::Sqlite, query))
    }

    async fn count_distinct_by_suffix(
        &self,
        tables: &[String],
        column: &str,
        suffix: &str,
    ) -> Result<(u64, u64)> {
        let conn = self.conn.lock();
        let stmt = sql::count_distinct_by_suffix(Dialect::Sqlite, tables, column, suffix);
        let (total, with_suffix): (i64, i64) = conn.query_row(
            &stmt.sql,
            rusqlite::params_from_iter(stmt.params.iter().map(to_sql)),
            |r| Ok((r.get(0)?, r.get(1)?)),
        )?;
        Ok(((total - with_suffix).max(0) as u64, with_suffix.max(0) as u64))
    }

    async fn count_rows(&self, table: &str, predicates: &[Predicate]) -> Result<u64> {
        let conn = self.conn.lock();
        let stmt = sql::count_rows(Dialect::Sqlite, table, predicates);
        let count: i64 = conn.query_row(
            &stmt.sql,
            rusqlite::params_from_iter(stmt.params.iter().map(to_sql)),
            |r| r.get(0),
        )?;
        Ok(count.max(0) as u64)
    }

    async fn delete_all(&self, table: &str) -> Result<u64> {
        let conn = self.conn.lock();
        Ok(conn.execute(&sql::delete_all(table), [])? as u64)
    }
}
