//! Property-based tests
//!
//! Invariants that should hold for ALL staged inputs:
//! - Idempotence: a second commit with nothing new changes nothing
//! - Never lost: every staged `name -> sha` pair ends up committed, at most
//!   duplicated, whatever order two writers interleave in
//! - Monotonicity: metadata columns never disappear or change type
//! - Last writer wins: head reads return the latest write per hash

mod common;

use common::*;
use proptest::prelude::*;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use datavol_index::application::{Index, MetadataDb, TreeCache};
use datavol_index::config::{IndexOptions, TableNames};
use datavol_index::domain::{Connection, Predicate};
use datavol_index::infrastructure::{InMemoryConnection, MokaKeyValueStore};
use datavol_index::{CommitSha, Entry, ErrorKind, MergePolicy, MetadataRecord, TreeId, Value};

fn block_on<F: std::future::Future>(future: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
        .block_on(future)
}

// ============================================================================
// Strategies
// ============================================================================

fn name_strategy() -> impl Strategy<Value = String> {
    prop::sample::select(vec!["a.txt", "b.txt", "c/d.bin", "e.png", "e.png.meta.json"])
        .prop_map(str::to_string)
}

fn sha_strategy() -> impl Strategy<Value = String> {
    prop::sample::select(vec!["aa11", "bb22", "cc33", "dd44"]).prop_map(str::to_string)
}

fn batch_strategy() -> impl Strategy<Value = Vec<(String, String)>> {
    prop::collection::vec((name_strategy(), sha_strategy()), 1..8)
}

#[derive(Debug, Clone)]
enum Field {
    Int(i64),
    Float(f64),
    Text(String),
}

impl Field {
    fn value(&self) -> Value {
        match self {
            Field::Int(v) => Value::Integer(*v),
            Field::Float(v) => Value::Float(*v),
            Field::Text(v) => Value::from(v.as_str()),
        }
    }
}

fn field_strategy() -> impl Strategy<Value = Field> {
    prop_oneof![
        (-1000i64..1000).prop_map(Field::Int),
        (-1.0e3f64..1.0e3).prop_map(Field::Float),
        "[a-z]{1,8}".prop_map(Field::Text),
    ]
}

fn key_strategy() -> impl Strategy<Value = String> {
    prop::sample::select(vec!["width", "height", "label", "score"]).prop_map(str::to_string)
}

// ============================================================================
// Fixtures
// ============================================================================

fn index_on(conn: Arc<dyn Connection>) -> Index {
    let names = TableNames::default();
    Index::new(
        conn,
        TreeCache::new(Arc::new(MokaKeyValueStore::default()), "acme", "images"),
        names.index,
        names.staging_index,
        IndexOptions::default(),
    )
}

fn metadata_on(conn: Arc<dyn Connection>, policy: MergePolicy) -> MetadataDb {
    let names = TableNames::default();
    MetadataDb::new(conn, names.metadata, names.metadata_staging, policy)
}

fn entries(batch: &[(String, String)]) -> Vec<Entry> {
    batch
        .iter()
        .map(|(name, hash)| entry(name, hash, 1))
        .collect()
}

async fn commit_index(index: &Index, n: usize) -> u64 {
    let tree = TreeId::new(format!("t{}", n));
    let promoted = index.begin_commit(&tree).await.unwrap();
    index.end_commit().await.unwrap();
    index.set_commit_id(&tree).await.unwrap();
    promoted
}

// ============================================================================
// Properties
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_commit_is_idempotent(batch in batch_strategy()) {
        block_on(async {
            let index = index_on(Arc::new(InMemoryConnection::new()));
            index.init().await.unwrap();
            index.set_entries(&entries(&batch)).await.unwrap();

            commit_index(&index, 1).await;
            let once = index.committed_count(None).await.unwrap();
            let head_once = index.head_entries(None).await.unwrap();

            assert_eq!(commit_index(&index, 2).await, 0);
            assert_eq!(index.committed_count(None).await.unwrap(), once);
            assert_eq!(index.head_entries(None).await.unwrap(), head_once);
        });
    }

    #[test]
    fn prop_staged_pairs_never_lost(
        batch in batch_strategy(),
        order in prop::collection::vec(any::<bool>(), 4),
    ) {
        block_on(async {
            // Two writers on one warehouse, each with its own cache
            let conn: Arc<dyn Connection> = Arc::new(InMemoryConnection::new());
            let writers = [index_on(conn.clone()), index_on(conn.clone())];
            writers[0].init().await.unwrap();

            // Each writer stages the batch once and commits once, in a
            // generated interleaving
            let mut staged = [false, false];
            let mut committed = [false, false];
            let mut steps = order.iter().copied().cycle();
            let mut n = 0;
            while committed.iter().any(|c| !c) {
                let w = usize::from(steps.next().unwrap_or(false));
                let w = if committed[w] { 1 - w } else { w };
                if !staged[w] {
                    writers[w].set_entries(&entries(&batch)).await.unwrap();
                    staged[w] = true;
                } else {
                    n += 1;
                    commit_index(&writers[w], n).await;
                    committed[w] = true;
                }
            }

            let table = writers[0].committed_table().to_string();
            let pairs: BTreeSet<&(String, String)> = batch.iter().collect();
            for (name, hash) in pairs {
                let rows = conn
                    .count_rows(
                        &table,
                        &[Predicate::eq("name", name.as_str()), Predicate::eq("sha", hash.as_str())],
                    )
                    .await
                    .unwrap();
                assert!((1..=2).contains(&rows), "{} -> {} committed {} times", name, hash, rows);
            }
        });
    }

    #[test]
    fn prop_schema_is_monotonic(
        writes in prop::collection::vec((key_strategy(), field_strategy()), 1..12),
    ) {
        block_on(async {
            let db = metadata_on(Arc::new(InMemoryConnection::new()), MergePolicy::Replace);
            db.init().await.unwrap();

            let mut seen = db.committed_schema().await.unwrap();
            for (i, (key, field)) in writes.iter().enumerate() {
                let record = MetadataRecord::new(sha("aa11")).with_field(key.as_str(), field.value());
                match db.add_data(&[record]).await {
                    Ok(_) => {}
                    Err(err) => assert_eq!(err.kind, ErrorKind::SchemaConflict),
                }
                if i % 3 == 2 {
                    db.commit(&CommitSha::new(format!("c{}", i)), &TreeId::new(format!("t{}", i)))
                        .await
                        .unwrap();
                }

                let now = db.committed_schema().await.unwrap();
                for column in seen.columns() {
                    assert_eq!(now.get(&column.name), Some(column), "column {} changed", column.name);
                }
                assert!(now.same_columns(&db.staging_schema().await.unwrap()));
                seen = now;
            }
        });
    }

    #[test]
    fn prop_last_writer_wins(
        widths in prop::collection::vec(0i64..10_000, 1..10),
        commit_after in prop::collection::vec(any::<bool>(), 10),
    ) {
        block_on(async {
            let db = metadata_on(Arc::new(InMemoryConnection::new()), MergePolicy::Replace);
            db.init().await.unwrap();

            let mut expected: BTreeMap<&str, i64> = BTreeMap::new();
            for (i, width) in widths.iter().enumerate() {
                let hash = if i % 2 == 0 { "aa11" } else { "bb22" };
                db.add_data(&[MetadataRecord::new(sha(hash)).with_field("width", *width)])
                    .await
                    .unwrap();
                expected.insert(hash, *width);
                if commit_after[i] {
                    db.commit(&CommitSha::new(format!("c{}", i)), &TreeId::new(format!("t{}", i)))
                        .await
                        .unwrap();
                }
            }

            let shas: Vec<_> = expected.keys().map(|h| sha(h)).collect();
            let head = db.query_head_data(&shas).await.unwrap();
            assert_eq!(head.len(), expected.len());
            for record in head {
                assert_eq!(
                    record.get("width"),
                    Some(&Value::Integer(expected[record.sha.as_str()]))
                );
            }
        });
    }
}
