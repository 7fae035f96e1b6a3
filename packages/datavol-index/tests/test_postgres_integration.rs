//! PostgreSQL backend integration tests
//!
//! Need a running server:
//! `TEST_DATABASE_URL=postgres://localhost/datavol_test cargo test --features postgres -- --ignored`
//!
//! Every test uses its own table prefix so runs do not collide.

#![cfg(feature = "postgres")]

mod common;

use common::*;
use pretty_assertions::assert_eq;
use std::env;
use std::sync::Arc;

use datavol_index::config::{BackendConfig, EngineConfig};
use datavol_index::domain::ColumnType;
use datavol_index::infrastructure::PostgresConnection;
use datavol_index::{CommitState, ErrorKind, MergePolicy, MetadataRecord, Value};

/// Helper: Get test database URL
fn get_test_db_url() -> String {
    env::var("TEST_DATABASE_URL").unwrap_or_else(|_| "postgres://localhost/datavol_test".to_string())
}

fn unique_prefix(test: &str) -> String {
    let nanos = chrono::Utc::now().timestamp_subsec_nanos();
    format!("t_{}_{}_", test, nanos % 1_000_000)
}

async fn parts() -> Parts {
    let conn = PostgresConnection::new(&get_test_db_url(), 4)
        .await
        .expect("Failed to connect to PostgreSQL");
    Parts::with_connection(Arc::new(conn))
}

fn pg_config(test: &str) -> EngineConfig {
    config()
        .with_backend(BackendConfig::Postgres {
            url: get_test_db_url(),
            max_connections: 4,
        })
        .with_table_prefix(unique_prefix(test))
}

#[tokio::test]
#[ignore] // Requires PostgreSQL server
async fn test_postgres_commit_cycle() {
    init_tracing();
    let parts = parts().await;
    let repo = parts.repository(&pg_config("cycle")).await;

    repo.stage_entries(&[entry("a.txt", "aa11", 10), entry("b.txt", "aa11", 10)])
        .await
        .unwrap();
    repo.stage_metadata(&[MetadataRecord::new(sha("aa11")).with_field("width", 100i64)])
        .await
        .unwrap();
    let commit = repo.commit("first").await.unwrap().unwrap();

    assert_eq!(repo.state(), CommitState::Clean);
    assert_eq!(repo.index().committed_count(Some(&sha("aa11"))).await.unwrap(), 2);
    assert_eq!(repo.index().staging_count().await.unwrap(), 0);

    let head = repo
        .metadata()
        .query_head_data(&[sha("aa11")])
        .await
        .unwrap();
    assert_eq!(head[0].commit_sha, Some(commit));
    assert_eq!(head[0].get("width"), Some(&Value::Integer(100)));
}

#[tokio::test]
#[ignore] // Requires PostgreSQL server
async fn test_postgres_rollback() {
    init_tracing();
    let inner = PostgresConnection::new(&get_test_db_url(), 4)
        .await
        .expect("Failed to connect to PostgreSQL");
    let flaky = Arc::new(FlakyConnection::new(Arc::new(inner)));
    let parts = Parts::with_connection(flaky.clone());
    let config = pg_config("rollback");
    let repo = parts.repository(&config).await;

    repo.stage_entries(&[entry("a.txt", "aa11", 10)])
        .await
        .unwrap();
    flaky.fail_on("delete_all", Some(repo.index().staging_table()));

    let err = repo.commit("truncate fails").await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::BackendUnavailable);
    assert_eq!(repo.index().committed_count(None).await.unwrap(), 0);
    assert_eq!(repo.index().staging_count().await.unwrap(), 1);

    repo.commit("retry").await.unwrap().unwrap();
    assert_eq!(repo.index().committed_count(None).await.unwrap(), 1);
}

#[tokio::test]
#[ignore] // Requires PostgreSQL server
async fn test_postgres_schema_evolution() {
    init_tracing();
    let parts = parts().await;
    let repo = parts
        .repository(&pg_config("schema").with_merge_policy(MergePolicy::Merge))
        .await;

    repo.stage_metadata(&[MetadataRecord::new(sha("aa11")).with_field("width", 100i64)])
        .await
        .unwrap();
    repo.stage_metadata(&[MetadataRecord::new(sha("aa11"))
        .with_field("ratio", 0.5f64)
        .with_field("label", "cat")])
        .await
        .unwrap();

    let staging = repo.metadata().staging_schema().await.unwrap();
    let committed = repo.metadata().committed_schema().await.unwrap();
    assert_eq!(committed.get("width").unwrap().ty, ColumnType::Integer);
    assert_eq!(committed.get("ratio").unwrap().ty, ColumnType::Float);
    assert_eq!(committed.get("label").unwrap().ty, ColumnType::Text);
    assert!(staging.same_columns(&committed));

    let head = repo
        .metadata()
        .query_head_data(&[sha("aa11")])
        .await
        .unwrap();
    assert_eq!(head[0].get("width"), Some(&Value::Integer(100)));
    assert_eq!(head[0].get("label"), Some(&Value::from("cat")));
}
