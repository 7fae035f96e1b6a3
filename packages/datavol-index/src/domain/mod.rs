//! Domain Layer
//!
//! Models, query shapes and the ports backends and collaborators implement

pub mod clock;
pub mod models;
pub mod ports;
pub mod query;

pub use models::{
    ChangeKind, Column, ColumnType, CommitSha, CommitState, Entry, FileStat, ItemCounts,
    MergePolicy, MetadataRecord, Row, Sha, TableSchema, TreeChange, TreeId, Value,
};
pub use ports::{BackendKind, CommitGraph, Connection, KeyValueStore, ObjectStore};
pub use query::{AntiJoin, CompareOp, LatestQuery, Predicate};
