//! In-Memory Connection
//!
//! Emulates an analytical warehouse: tables are append-only row vectors,
//! there are no transactions, and inserts naming unknown columns are
//! rejected. Used for unit tests and as the reference semantics for the
//! query shapes.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use crate::domain::models::{Column, Row, TableSchema, Value};
use crate::domain::ports::{BackendKind, Connection};
use crate::domain::query::{AntiJoin, LatestQuery, Predicate};
use crate::{Result, StorageError};

#[derive(Debug, Default)]
struct MemTable {
    schema: TableSchema,
    rows: Vec<Row>,
}

#[derive(Clone, Default)]
pub struct InMemoryConnection {
    tables: Arc<RwLock<HashMap<String, MemTable>>>,
}

impl InMemoryConnection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw rows of a table in insertion order (inspection helper)
    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.tables
            .read()
            .get(table)
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    pub fn table_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tables.read().keys().cloned().collect();
        names.sort();
        names
    }
}

/// Text form of a cell used for grouping; NULL groups as its own key
fn group_key(row: &Row, column: &str) -> Option<String> {
    match row.get(column) {
        None | Some(Value::Null) => None,
        Some(Value::Text(s)) => Some(s.clone()),
        Some(Value::Integer(i)) => Some(i.to_string()),
        Some(Value::Float(f)) => Some(f.to_string()),
    }
}

fn order_value(row: &Row, column: &str) -> i64 {
    row.get(column).and_then(Value::as_i64).unwrap_or(i64::MIN)
}

fn project(row: &Row, columns: &[String]) -> Row {
    columns
        .iter()
        .map(|c| (c.clone(), row.get(c).cloned().unwrap_or(Value::Null)))
        .collect()
}

#[async_trait]
impl Connection for InMemoryConnection {
    fn kind(&self) -> BackendKind {
        BackendKind::Memory
    }

    async fn create_table(&self, table: &str, schema: &TableSchema) -> Result<()> {
        self.tables
            .write()
            .entry(table.to_string())
            .or_insert_with(|| MemTable {
                schema: schema.clone(),
                rows: Vec::new(),
            });
        Ok(())
    }

    async fn add_columns(&self, table: &str, columns: &[Column]) -> Result<()> {
        let mut tables = self.tables.write();
        let target = tables
            .get_mut(table)
            .ok_or_else(|| StorageError::table_not_found(table))?;
        for column in columns {
            target.schema.add(column.clone())?;
        }
        Ok(())
    }

    async fn describe_table(&self, table: &str) -> Result<Option<TableSchema>> {
        Ok(self.tables.read().get(table).map(|t| t.schema.clone()))
    }

    async fn insert_rows(&self, table: &str, rows: &[Row]) -> Result<u64> {
        let mut tables = self.tables.write();
        let target = tables
            .get_mut(table)
            .ok_or_else(|| StorageError::table_not_found(table))?;

        // Validate the whole batch first so a bad row appends nothing
        for row in rows {
            target.schema.check_row(table, row)?;
        }
        target.rows.extend(rows.iter().cloned());
        Ok(rows.len() as u64)
    }

    async fn select_unseen(&self, query: &AntiJoin) -> Result<Vec<Row>> {
        let tables = self.tables.read();
        let source = tables
            .get(&query.source)
            .ok_or_else(|| StorageError::table_not_found(&query.source))?;
        let target = tables
            .get(&query.target)
            .ok_or_else(|| StorageError::table_not_found(&query.target))?;

        let seen: HashSet<String> = target
            .rows
            .iter()
            .filter_map(|r| group_key(r, &query.key))
            .collect();

        // partition -> (order value, insertion position)
        let mut winners: HashMap<Vec<Option<String>>, (i64, usize)> = HashMap::new();
        for (pos, row) in source.rows.iter().enumerate() {
            match group_key(row, &query.key) {
                Some(key) if !seen.contains(&key) => {}
                _ => continue,
            }
            let partition: Vec<Option<String>> = query
                .partition_by
                .iter()
                .map(|c| group_key(row, c))
                .collect();
            let order = order_value(row, &query.order_by);
            winners
                .entry(partition)
                .and_modify(|best| {
                    if order < best.0 {
                        *best = (order, pos);
                    }
                })
                .or_insert((order, pos));
        }

        let mut picked: Vec<(i64, usize)> = winners.into_values().collect();
        picked.sort();
        Ok(picked
            .into_iter()
            .map(|(_, pos)| project(&source.rows[pos], &query.columns))
            .collect())
    }

    async fn select_latest(&self, query: &LatestQuery) -> Result<Vec<Row>> {
        let tables = self.tables.read();
        let wanted: Option<HashSet<&str>> = query
            .keys
            .as_ref()
            .map(|keys| keys.iter().map(String::as_str).collect());

        let mut latest: BTreeMap<String, &Row> = BTreeMap::new();
        for name in &query.tables {
            let table = tables
                .get(name)
                .ok_or_else(|| StorageError::table_not_found(name))?;
            for row in &table.rows {
                let Some(key) = group_key(row, &query.key) else {
                    continue;
                };
                if let Some(wanted) = &wanted {
                    if !wanted.contains(key.as_str()) {
                        continue;
                    }
                }
                let ts = order_value(row, &query.ts);
                let newer = latest
                    .get(&key)
                    .map_or(true, |current| order_value(current, &query.ts) <= ts);
                if newer {
                    latest.insert(key, row);
                }
            }
        }

        let limit = query.limit.unwrap_or(usize::MAX);
        Ok(latest
            .into_values()
            .filter(|row| query.predicates.iter().all(|p| p.matches(row)))
            .skip(query.offset)
            .take(limit)
            .map(|row| project(row, &query.columns))
            .collect())
    }

    async fn count_distinct_by_suffix(
        &self,
        tables: &[String],
        column: &str,
        suffix: &str,
    ) -> Result<(u64, u64)> {
        let store = self.tables.read();
        let mut distinct: HashSet<String> = HashSet::new();
        for name in tables {
            let table = store
                .get(name)
                .ok_or_else(|| StorageError::table_not_found(name))?;
            distinct.extend(table.rows.iter().filter_map(|r| group_key(r, column)));
        }

        let with_suffix = distinct.iter().filter(|v| v.ends_with(suffix)).count() as u64;
        Ok((distinct.len() as u64 - with_suffix, with_suffix))
    }

    async fn count_rows(&self, table: &str, predicates: &[Predicate]) -> Result<u64> {
        let tables = self.tables.read();
        let target = tables
            .get(table)
            .ok_or_else(|| StorageError::table_not_found(table))?;
        Ok(target
            .rows
            .iter()
            .filter(|row| predicates.iter().all(|p| p.matches(row)))
            .count() as u64)
    }

    async fn delete_all(&self, table: &str) -> Result<u64> {
        let mut tables = self.tables.write();
        let target = tables
            .get_mut(table)
            .ok_or_else(|| StorageError::table_not_found(table))?;
        let removed = target.rows.len() as u64;
        target.rows.clear();
        Ok(removed)
    }
}
