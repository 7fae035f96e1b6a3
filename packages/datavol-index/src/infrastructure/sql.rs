//! SQL text for the relational adapters
//!
//! Every identifier is quoted and every user value is a bound parameter.
//! NULL cells are written as the `NULL` literal so no parameter needs a type
//! the driver cannot infer.

use std::collections::BTreeSet;

use crate::domain::models::{Column, ColumnType, Row, TableSchema, Value};
use crate::domain::query::{AntiJoin, LatestQuery, Predicate};

/// Upper bound on bound parameters per INSERT statement
const MAX_PARAMS_PER_STATEMENT: usize = 30_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Sqlite,
    Postgres,
}

/// SQL text plus its positional parameters
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<Value>,
}

impl Dialect {
    fn placeholder(&self, n: usize) -> String {
        match self {
            Dialect::Sqlite => format!("?{}", n),
            Dialect::Postgres => format!("${}", n),
        }
    }

    pub fn column_type(&self, ty: ColumnType) -> &'static str {
        match (self, ty) {
            (_, ColumnType::Text) => "TEXT",
            (Dialect::Sqlite, ColumnType::Integer) => "INTEGER",
            (Dialect::Sqlite, ColumnType::Float) => "REAL",
            (Dialect::Postgres, ColumnType::Integer) => "BIGINT",
            (Dialect::Postgres, ColumnType::Float) => "DOUBLE PRECISION",
        }
    }

    /// Map a declared/reported column type back to a `ColumnType`
    pub fn parse_column_type(&self, declared: &str) -> Option<ColumnType> {
        match declared.trim().to_ascii_uppercase().as_str() {
            "TEXT" | "CHARACTER VARYING" | "VARCHAR" => Some(ColumnType::Text),
            "INTEGER" | "BIGINT" | "INT8" => Some(ColumnType::Integer),
            "REAL" | "DOUBLE PRECISION" | "FLOAT8" => Some(ColumnType::Float),
            _ => None,
        }
    }

    fn order_key(&self, column: &str) -> String {
        match self {
            Dialect::Sqlite => quote_ident(column),
            Dialect::Postgres => format!("{} COLLATE \"C\"", quote_ident(column)),
        }
    }

    fn limit_clause(&self, limit: Option<usize>, offset: usize) -> String {
        match (limit, offset, self) {
            (None, 0, _) => String::new(),
            (Some(limit), offset, _) => format!(" LIMIT {} OFFSET {}", limit, offset),
            (None, offset, Dialect::Sqlite) => format!(" LIMIT -1 OFFSET {}", offset),
            (None, offset, Dialect::Postgres) => format!(" OFFSET {}", offset),
        }
    }
}

pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn column_list(columns: &[String]) -> String {
    columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ")
}

struct Binder {
    dialect: Dialect,
    params: Vec<Value>,
}

impl Binder {
    fn new(dialect: Dialect) -> Self {
        Self {
            dialect,
            params: Vec::new(),
        }
    }

    fn bind(&mut self, value: &Value) -> String {
        if value.is_null() {
            return "NULL".to_string();
        }
        self.params.push(value.clone());
        self.dialect.placeholder(self.params.len())
    }

    fn predicates(&mut self, predicates: &[Predicate]) -> Vec<String> {
        predicates
            .iter()
            .map(|p| {
                let rhs = self.bind(&p.value);
                format!("{} {} {}", quote_ident(&p.column), p.op.as_sql(), rhs)
            })
            .collect()
    }

    fn finish(self, sql: String) -> Statement {
        Statement {
            sql,
            params: self.params,
        }
    }
}

pub fn create_table(dialect: Dialect, table: &str, schema: &TableSchema) -> String {
    let columns = schema
        .columns()
        .iter()
        .map(|c| format!("{} {}", quote_ident(&c.name), dialect.column_type(c.ty)))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "CREATE TABLE IF NOT EXISTS {} ({})",
        quote_ident(table),
        columns
    )
}

pub fn add_column(dialect: Dialect, table: &str, column: &Column) -> String {
    let if_not_exists = match dialect {
        Dialect::Sqlite => "",
        Dialect::Postgres => "IF NOT EXISTS ",
    };
    format!(
        "ALTER TABLE {} ADD COLUMN {}{} {}",
        quote_ident(table),
        if_not_exists,
        quote_ident(&column.name),
        dialect.column_type(column.ty)
    )
}

/// Multi-row INSERTs, split so no statement exceeds the parameter budget
pub fn insert(dialect: Dialect, table: &str, rows: &[Row]) -> Vec<Statement> {
    let columns: Vec<String> = rows
        .iter()
        .flat_map(|r| r.keys().cloned())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    if rows.is_empty() || columns.is_empty() {
        return Vec::new();
    }

    let rows_per_statement = (MAX_PARAMS_PER_STATEMENT / columns.len()).max(1);
    rows.chunks(rows_per_statement)
        .map(|chunk| {
            let mut binder = Binder::new(dialect);
            let tuples = chunk
                .iter()
                .map(|row| {
                    let cells = columns
                        .iter()
                        .map(|c| binder.bind(row.get(c).unwrap_or(&Value::Null)))
                        .collect::<Vec<_>>()
                        .join(", ");
                    format!("({})", cells)
                })
                .collect::<Vec<_>>()
                .join(", ");
            binder.finish(format!(
                "INSERT INTO {} ({}) VALUES {}",
                quote_ident(table),
                column_list(&columns),
                tuples
            ))
        })
        .collect()
}

pub fn select_unseen(dialect: Dialect, query: &AntiJoin) -> Statement {
    let cols = column_list(&query.columns);
    let key = quote_ident(&query.key);
    let partition = column_list(&query.partition_by);
    let order = quote_ident(&query.order_by);

    let sql = format!(
        "SELECT {cols} FROM (\
         SELECT {cols}, ROW_NUMBER() OVER (PARTITION BY {partition} ORDER BY {order} ASC) AS \"__rn\" \
         FROM {source} \
         WHERE {key} NOT IN (SELECT {key} FROM {target} WHERE {key} IS NOT NULL)\
         ) AS \"__d\" WHERE \"__rn\" = 1 ORDER BY {order}",
        source = quote_ident(&query.source),
        target = quote_ident(&query.target),
    );
    Binder::new(dialect).finish(sql)
}

pub fn select_latest(dialect: Dialect, query: &LatestQuery) -> Statement {
    let mut binder = Binder::new(dialect);
    let cols = column_list(&query.columns);
    let key = quote_ident(&query.key);

    // Inner selects also carry the key, ts and filtered columns
    let mut needed = query.columns.clone();
    let extra = [&query.key, &query.ts]
        .into_iter()
        .chain(query.predicates.iter().map(|p| &p.column));
    for column in extra {
        if !needed.contains(column) {
            needed.push(column.clone());
        }
    }
    let inner = column_list(&needed);

    let union = query
        .tables
        .iter()
        .map(|t| format!("SELECT {} FROM {}", inner, quote_ident(t)))
        .collect::<Vec<_>>()
        .join(" UNION ALL ");

    let key_filter = match &query.keys {
        None => String::new(),
        Some(keys) if keys.is_empty() => " WHERE 1 = 0".to_string(),
        Some(keys) => {
            let placeholders = keys
                .iter()
                .map(|k| binder.bind(&Value::from(k.as_str())))
                .collect::<Vec<_>>()
                .join(", ");
            format!(" WHERE {} IN ({})", key, placeholders)
        }
    };

    let mut outer = vec!["\"__rn\" = 1".to_string()];
    outer.extend(binder.predicates(&query.predicates));

    let sql = format!(
        "SELECT {cols} FROM (\
         SELECT {inner}, ROW_NUMBER() OVER (PARTITION BY {key} ORDER BY {ts} DESC) AS \"__rn\" \
         FROM ({union}) AS \"__u\"{key_filter}\
         ) AS \"__l\" WHERE {outer} ORDER BY {order}{limit}",
        ts = quote_ident(&query.ts),
        outer = outer.join(" AND "),
        order = dialect.order_key(&query.key),
        limit = dialect.limit_clause(query.limit, query.offset),
    );
    binder.finish(sql)
}

/// Yields one row: `(distinct count, count ending with suffix)`
pub fn count_distinct_by_suffix(
    dialect: Dialect,
    tables: &[String],
    column: &str,
    suffix: &str,
) -> Statement {
    let mut binder = Binder::new(dialect);
    let col = quote_ident(column);
    let p = binder.bind(&Value::from(suffix));

    let tail = match dialect {
        Dialect::Sqlite => format!(
            "length({col}) >= length({p}) AND substr({col}, length({col}) - length({p}) + 1) = {p}"
        ),
        Dialect::Postgres => format!("right({col}, length({p})) = {p}"),
    };
    let union = tables
        .iter()
        .map(|t| format!("SELECT {} FROM {}", col, quote_ident(t)))
        .collect::<Vec<_>>()
        .join(" UNION ");

    let sql = format!(
        "SELECT COUNT(*), COALESCE(SUM(CASE WHEN {tail} THEN 1 ELSE 0 END), 0) \
         FROM ({union}) AS \"__n\" WHERE {col} IS NOT NULL"
    );
    binder.finish(sql)
}

pub fn count_rows(dialect: Dialect, table: &str, predicates: &[Predicate]) -> Statement {
    let mut binder = Binder::new(dialect);
    let conditions = binder.predicates(predicates);
    let mut sql = format!("SELECT COUNT(*) FROM {}", quote_ident(table));
    if !conditions.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&conditions.join(" AND "));
    }
    binder.finish(sql)
}

pub fn delete_all(table: &str) -> String {
    format!("DELETE FROM {}", quote_ident(table))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::query::CompareOp;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_quote_ident_escapes() {
        assert_eq!(quote_ident("index"), "\"index\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn test_create_table_types_per_dialect() {
        let schema = TableSchema::new(vec![
            Column::new("name", ColumnType::Text),
            Column::new("size", ColumnType::Integer),
            Column::new("mtime", ColumnType::Float),
        ]);
        assert_eq!(
            create_table(Dialect::Sqlite, "index", &schema),
            "CREATE TABLE IF NOT EXISTS \"index\" (\"name\" TEXT, \"size\" INTEGER, \"mtime\" REAL)"
        );
        assert_eq!(
            create_table(Dialect::Postgres, "index", &schema),
            "CREATE TABLE IF NOT EXISTS \"index\" (\"name\" TEXT, \"size\" BIGINT, \"mtime\" DOUBLE PRECISION)"
        );
    }

    #[test]
    fn test_add_column_idempotent_on_postgres() {
        let column = Column::new("width", ColumnType::Integer);
        assert_eq!(
            add_column(Dialect::Postgres, "staging", &column),
            "ALTER TABLE \"staging\" ADD COLUMN IF NOT EXISTS \"width\" BIGINT"
        );
        assert_eq!(
            add_column(Dialect::Sqlite, "staging", &column),
            "ALTER TABLE \"staging\" ADD COLUMN \"width\" INTEGER"
        );
    }

    #[test]
    fn test_insert_null_is_literal() {
        let mut a = Row::new();
        a.insert("name".into(), Value::from("a"));
        a.insert("url".into(), Value::Null);
        let mut b = Row::new();
        b.insert("name".into(), Value::from("b"));

        let stmts = insert(Dialect::Sqlite, "staging", &[a, b]);
        assert_eq!(stmts.len(), 1);
        assert_eq!(
            stmts[0].sql,
            "INSERT INTO \"staging\" (\"name\", \"url\") VALUES (?1, NULL), (?2, NULL)"
        );
        assert_eq!(stmts[0].params, vec![Value::from("a"), Value::from("b")]);
    }

    #[test]
    fn test_insert_splits_large_batches() {
        let rows: Vec<Row> = (0..(MAX_PARAMS_PER_STATEMENT + 1))
            .map(|i| {
                let mut row = Row::new();
                row.insert("n".into(), Value::Integer(i as i64));
                row
            })
            .collect();
        let stmts = insert(Dialect::Postgres, "t", &rows);
        assert_eq!(stmts.len(), 2);
        assert_eq!(stmts[1].params.len(), 1);
        assert!(stmts[1].sql.ends_with("VALUES ($1)"));
    }

    #[test]
    fn test_select_latest_binds_keys_and_predicates() {
        let query = LatestQuery::new(
            vec!["staging".into(), "metadata".into()],
            "_sha",
            "_ts",
            vec!["_sha".into(), "_ts".into(), "width".into()],
        )
        .with_keys(vec!["aa".into(), "bb".into()])
        .filter(Predicate::new("width", CompareOp::Gt, 10i64))
        .limit(Some(5));

        let stmt = select_latest(Dialect::Postgres, &query);
        assert!(stmt.sql.contains("UNION ALL"));
        assert!(stmt.sql.contains("WHERE \"_sha\" IN ($1, $2)"));
        assert!(stmt.sql.contains("\"__rn\" = 1 AND \"width\" > $3"));
        assert!(stmt.sql.contains("ORDER BY \"_sha\" COLLATE \"C\" LIMIT 5 OFFSET 0"));
        assert_eq!(
            stmt.params,
            vec![Value::from("aa"), Value::from("bb"), Value::Integer(10)]
        );
    }

    #[test]
    fn test_select_latest_filters_on_unprojected_column() {
        let query = LatestQuery::new(vec!["m".into()], "_sha", "_ts", vec!["_sha".into()])
            .filter(Predicate::eq("label", "cat"));
        let stmt = select_latest(Dialect::Sqlite, &query);
        assert!(stmt
            .sql
            .starts_with("SELECT \"_sha\" FROM (SELECT \"_sha\", \"_ts\", \"label\", ROW_NUMBER()"));
        assert!(stmt
            .sql
            .contains("FROM (SELECT \"_sha\", \"_ts\", \"label\" FROM \"m\") AS \"__u\""));
    }

    #[test]
    fn test_select_latest_empty_key_list() {
        let query = LatestQuery::new(vec!["t".into()], "k", "ts", vec!["k".into()])
            .with_keys(Vec::new());
        let stmt = select_latest(Dialect::Sqlite, &query);
        assert!(stmt.sql.contains("WHERE 1 = 0"));
        assert!(stmt.params.is_empty());
    }

    #[test]
    fn test_sqlite_offset_without_limit() {
        let query = LatestQuery::new(vec!["t".into()], "k", "ts", vec!["k".into()]).offset(3);
        let stmt = select_latest(Dialect::Sqlite, &query);
        assert!(stmt.sql.ends_with("LIMIT -1 OFFSET 3"));
    }

    #[test]
    fn test_select_unseen_shape() {
        let query = AntiJoin {
            source: "staging_index_1".into(),
            target: "index".into(),
            key: "sha".into(),
            partition_by: vec!["name".into(), "sha".into()],
            order_by: "ts".into(),
            columns: vec!["name".into(), "sha".into(), "ts".into()],
        };
        let stmt = select_unseen(Dialect::Sqlite, &query);
        assert!(stmt
            .sql
            .contains("WHERE \"sha\" NOT IN (SELECT \"sha\" FROM \"index\" WHERE \"sha\" IS NOT NULL)"));
        assert!(stmt
            .sql
            .contains("PARTITION BY \"name\", \"sha\" ORDER BY \"ts\" ASC"));
        assert!(stmt.params.is_empty());
    }

    #[test]
    fn test_count_rows_without_predicates() {
        let stmt = count_rows(Dialect::Sqlite, "index", &[]);
        assert_eq!(stmt.sql, "SELECT COUNT(*) FROM \"index\"");
    }
}
