//! PostgreSQL Connection
//!
//! Pooled transactional backend. Outside a transaction scope every call
//! borrows a pooled connection; inside one, calls run on the single
//! `Transaction` opened by `begin_transaction`.

use async_trait::async_trait;
use sqlx::postgres::{PgArguments, PgPool, PgPoolOptions, PgRow};
use sqlx::query::Query;
use sqlx::{Column as _, Executor, Postgres, Row as _, Transaction, TypeInfo as _};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::sql::{self, Dialect, Statement};
use crate::domain::models::{Column, ColumnType, Row, TableSchema, Value};
use crate::domain::ports::{BackendKind, Connection};
use crate::domain::query::{AntiJoin, LatestQuery, Predicate};
use crate::{Result, StorageError};

const DESCRIBE_SQL: &str = "SELECT column_name::text, data_type::text \
     FROM information_schema.columns \
     WHERE table_schema = current_schema() AND table_name = $1 \
     ORDER BY ordinal_position";

/// PostgreSQL Connection (production)
pub struct PostgresConnection {
    pool: PgPool,
    tx: Mutex<Option<Transaction<'static, Postgres>>>,
}

impl PostgresConnection {
    /// Connect a pool
    ///
    /// # Example
    /// ```no_run
    /// use datavol_index::infrastructure::PostgresConnection;
    ///
    /// #[tokio::main]
    /// async fn main() {
    ///     let conn = PostgresConnection::new("postgres://localhost/datavol", 5)
    ///         .await
    ///         .unwrap();
    /// }
    /// ```
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(5))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| {
                StorageError::backend_unavailable(format!("Failed to connect to PostgreSQL: {}", e))
                    .with_source(e)
            })?;
        info!(max_connections, "Connected PostgreSQL pool");

        Ok(Self {
            pool,
            tx: Mutex::new(None),
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn bind_all<'q>(
    mut query: Query<'q, Postgres, PgArguments>,
    params: &'q [Value],
) -> Query<'q, Postgres, PgArguments> {
    for param in params {
        query = match param {
            Value::Null => query.bind(Option::<String>::None),
            Value::Text(s) => query.bind(s.as_str()),
            Value::Integer(i) => query.bind(*i),
            Value::Float(f) => query.bind(*f),
        };
    }
    query
}

async fn fetch<'c, E>(executor: E, stmt: &Statement) -> Result<Vec<PgRow>>
where
    E: Executor<'c, Database = Postgres>,
{
    Ok(bind_all(sqlx::query(&stmt.sql), &stmt.params)
        .fetch_all(executor)
        .await?)
}

async fn execute<'c, E>(executor: E, stmt: &Statement) -> Result<u64>
where
    E: Executor<'c, Database = Postgres>,
{
    Ok(bind_all(sqlx::query(&stmt.sql), &stmt.params)
        .execute(executor)
        .await?
        .rows_affected())
}

async fn describe<'c, E>(executor: E, table: &str) -> Result<Option<TableSchema>>
where
    E: Executor<'c, Database = Postgres>,
{
    let stmt = Statement {
        sql: DESCRIBE_SQL.to_string(),
        params: vec![Value::from(table)],
    };
    let rows = fetch(executor, &stmt).await?;
    if rows.is_empty() {
        return Ok(None);
    }

    let mut columns = Vec::with_capacity(rows.len());
    for row in &rows {
        let name: String = row.try_get(0)?;
        let declared: String = row.try_get(1)?;
        let ty = Dialect::Postgres
            .parse_column_type(&declared)
            .unwrap_or(ColumnType::Text);
        columns.push(Column::new(name, ty));
    }
    Ok(Some(TableSchema::new(columns)))
}

fn decode_row(record: &PgRow) -> Result<Row> {
    let mut row = Row::new();
    for (i, column) in record.columns().iter().enumerate() {
        let value = match column.type_info().name() {
            "TEXT" | "VARCHAR" | "NAME" | "BPCHAR" => {
                Value::from(record.try_get::<Option<String>, _>(i)?)
            }
            "INT8" => Value::from(record.try_get::<Option<i64>, _>(i)?),
            "INT4" => Value::from(record.try_get::<Option<i32>, _>(i)?.map(i64::from)),
            "INT2" => Value::from(record.try_get::<Option<i16>, _>(i)?.map(i64::from)),
            "FLOAT8" => Value::from(record.try_get::<Option<f64>, _>(i)?),
            "FLOAT4" => Value::from(record.try_get::<Option<f32>, _>(i)?.map(f64::from)),
            other => {
                return Err(StorageError::serialization(format!(
                    "Unsupported PostgreSQL column type {} for {}",
                    other,
                    column.name()
                )))
            }
        };
        row.insert(column.name().to_string(), value);
    }
    Ok(row)
}

fn count_of(rows: &[PgRow], index: usize) -> Result<u64> {
    let row = rows
        .first()
        .ok_or_else(|| StorageError::database("Aggregate query returned no rows"))?;
    let count: i64 = row.try_get(index)?;
    Ok(count.max(0) as u64)
}

#[async_trait]
impl Connection for PostgresConnection {
    fn kind(&self) -> BackendKind {
        BackendKind::Postgres
    }

    fn supports_transactions(&self) -> bool {
        true
    }

    async fn begin_transaction(&self) -> Result<()> {
        let mut guard = self.tx.lock().await;
        if guard.is_some() {
            return Err(StorageError::transaction("PostgreSQL transaction already open"));
        }
        *guard = Some(self.pool.begin().await?);
        Ok(())
    }

    async fn commit_transaction(&self) -> Result<()> {
        let tx = self
            .tx
            .lock()
            .await
            .take()
            .ok_or_else(|| StorageError::transaction("No PostgreSQL transaction to commit"))?;
        tx.commit().await?;
        Ok(())
    }

    async fn rollback_transaction(&self) -> Result<()> {
        if let Some(tx) = self.tx.lock().await.take() {
            tx.rollback().await?;
        }
        Ok(())
    }

    async fn create_table(&self, table: &str, schema: &TableSchema) -> Result<()> {
        let stmt = Statement {
            sql: sql::create_table(Dialect::Postgres, table, schema),
            params: Vec::new(),
        };
        let mut guard = self.tx.lock().await;
        match guard.as_mut() {
            Some(tx) => execute(&mut **tx, &stmt).await?,
            None => execute(&self.pool, &stmt).await?,
        };
        Ok(())
    }

    async fn add_columns(&self, table: &str, columns: &[Column]) -> Result<()> {
        let mut guard = self.tx.lock().await;
        let current = match guard.as_mut() {
            Some(tx) => describe(&mut **tx, table).await?,
            None => describe(&self.pool, table).await?,
        };
        let mut schema = current.ok_or_else(|| StorageError::table_not_found(table))?;

        for column in columns {
            if !schema.add(column.clone())? {
                continue;
            }
            debug!(table, column = %column.name, ty = %column.ty, "Adding column");
            let stmt = Statement {
                sql: sql::add_column(Dialect::Postgres, table, column),
                params: Vec::new(),
            };
            match guard.as_mut() {
                Some(tx) => execute(&mut **tx, &stmt).await?,
                None => execute(&self.pool, &stmt).await?,
            };
        }
        Ok(())
    }

    async fn describe_table(&self, table: &str) -> Result<Option<TableSchema>> {
        let mut guard = self.tx.lock().await;
        match guard.as_mut() {
            Some(tx) => describe(&mut **tx, table).await,
            None => describe(&self.pool, table).await,
        }
    }

    async fn insert_rows(&self, table: &str, rows: &[Row]) -> Result<u64> {
        let statements = sql::insert(Dialect::Postgres, table, rows);
        let mut guard = self.tx.lock().await;

        match guard.as_mut() {
            Some(tx) => {
                let schema = describe(&mut **tx, table)
                    .await?
                    .ok_or_else(|| StorageError::table_not_found(table))?;
                for row in rows {
                    schema.check_row(table, row)?;
                }
                let mut inserted = 0;
                for stmt in &statements {
                    inserted += execute(&mut **tx, stmt).await?;
                }
                Ok(inserted)
            }
            None => {
                // Local transaction keeps a split batch atomic
                let mut local = self.pool.begin().await?;
                let schema = describe(&mut *local, table)
                    .await?
                    .ok_or_else(|| StorageError::table_not_found(table))?;
                for row in rows {
                    schema.check_row(table, row)?;
                }
                let mut inserted = 0;
                for stmt in &statements {
                    inserted += execute(&mut *local, stmt).await?;
                }
                local.commit().await?;
                Ok(inserted)
            }
        }
    }

    async fn select_unseen(&self, query: &AntiJoin) -> Result<Vec<Row>> {
        let stmt = sql::select_unseen(Dialect::Postgres, query);
        let mut guard = self.tx.lock().await;
        let rows = match guard.as_mut() {
            Some(tx) => fetch(&mut **tx, &stmt).await?,
            None => fetch(&self.pool, &stmt).await?,
        };
        rows.iter().map(decode_row).collect()
    }

    async fn select_latest(&self, query: &LatestQuery) -> Result<Vec<Row>> {
        let stmt = sql::select_latest(Dialect::Postgres, query);
        let mut guard = self.tx.lock().await;
        let rows = match guard.as_mut() {
            Some(tx) => fetch(&mut **tx, &stmt).await?,
            None => fetch(&self.pool, &stmt).await?,
        };
        rows.iter().map(decode_row).collect()
    }

    async fn count_distinct_by_suffix(
        &self,
        tables: &[String],
        column: &str,
        suffix: &str,
    ) -> Result<(u64, u64)> {
        let stmt = sql::count_distinct_by_suffix(Dialect::Postgres, tables, column, suffix);
        let mut guard = self.tx.lock().await;
        let rows = match guard.as_mut() {
            Some(tx) => fetch(&mut **tx, &stmt).await?,
            None => fetch(&self.pool, &stmt).await?,
        };
        let total = count_of(&rows, 0)?;
        let with_suffix = count_of(&rows, 1)?;
        Ok((total.saturating_sub(with_suffix), with_suffix))
    }

    async fn count_rows(&self, table: &str, predicates: &[Predicate]) -> Result<u64> {
        let stmt = sql::count_rows(Dialect::Postgres, table, predicates);
        let mut guard = self.tx.lock().await;
        let rows = match guard.as_mut() {
            Some(tx) => fetch(&mut **tx, &stmt).await?,
            None => fetch(&self.pool, &stmt).await?,
        };
        count_of(&rows, 0)
    }

    async fn delete_all(&self, table: &str) -> Result<u64> {
        let stmt = Statement {
            sql: sql::delete_all(table),
            params: Vec::new(),
        };
        let mut guard = self.tx.lock().await;
        match guard.as_mut() {
            Some(tx) => execute(&mut **tx, &stmt).await,
            None => execute(&self.pool, &stmt).await,
        }
    }
}
