//! Fixed query shapes every backend implements
//!
//! The engine never issues free-form SQL. Each read it needs is one of the
//! shapes below, which adapters translate to their own dialect (or evaluate
//! in memory).

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use super::models::{Row, Value};

/// Comparison operator of a field predicate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    pub fn as_sql(&self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::Ne => "<>",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
        }
    }

    fn accepts(&self, ordering: Ordering) -> bool {
        match self {
            CompareOp::Eq => ordering == Ordering::Equal,
            CompareOp::Ne => ordering != Ordering::Equal,
            CompareOp::Lt => ordering == Ordering::Less,
            CompareOp::Le => ordering != Ordering::Greater,
            CompareOp::Gt => ordering == Ordering::Greater,
            CompareOp::Ge => ordering != Ordering::Less,
        }
    }
}

/// `column <op> value`, with SQL semantics: NULL never matches
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Predicate {
    pub column: String,
    pub op: CompareOp,
    pub value: Value,
}

impl Predicate {
    pub fn new(column: impl Into<String>, op: CompareOp, value: impl Into<Value>) -> Self {
        Self {
            column: column.into(),
            op,
            value: value.into(),
        }
    }

    pub fn eq(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(column, CompareOp::Eq, value)
    }

    pub fn matches(&self, row: &Row) -> bool {
        row.get(&self.column)
            .and_then(|cell| cell.compare(&self.value))
            .map(|ordering| self.op.accepts(ordering))
            .unwrap_or(false)
    }
}

/// Staging-minus-committed anti-join:
///
/// ```sql
/// SELECT cols FROM source
/// WHERE key NOT IN (SELECT key FROM target)
/// -- one row per partition, earliest order_by first
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AntiJoin {
    pub source: String,
    pub target: String,
    /// Column whose presence in `target` excludes a source row
    pub key: String,
    /// Duplicates inside `source` collapse per these columns
    pub partition_by: Vec<String>,
    /// The row with the smallest value wins a partition
    pub order_by: String,
    pub columns: Vec<String>,
}

/// Last-writer-wins read:
///
/// ```sql
/// SELECT cols FROM (tables UNION ALL)
/// -- row with MAX(ts) per key, then predicates, ordered by key
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct LatestQuery {
    /// Tables read together; all must carry `columns`
    pub tables: Vec<String>,
    pub key: String,
    pub ts: String,
    pub columns: Vec<String>,
    /// Restrict to these key values
    pub keys: Option<Vec<String>>,
    /// Applied to the winning row of each key
    pub predicates: Vec<Predicate>,
    pub limit: Option<usize>,
    pub offset: usize,
}

impl LatestQuery {
    pub fn new(
        tables: Vec<String>,
        key: impl Into<String>,
        ts: impl Into<String>,
        columns: Vec<String>,
    ) -> Self {
        Self {
            tables,
            key: key.into(),
            ts: ts.into(),
            columns,
            keys: None,
            predicates: Vec::new(),
            limit: None,
            offset: 0,
        }
    }

    pub fn with_keys(mut self, keys: Vec<String>) -> Self {
        self.keys = Some(keys);
        self
    }

    pub fn filter(mut self, predicate: Predicate) -> Self {
        self.predicates.push(predicate);
        self
    }

    pub fn limit(mut self, limit: Option<usize>) -> Self {
        self.limit = limit;
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }
}
