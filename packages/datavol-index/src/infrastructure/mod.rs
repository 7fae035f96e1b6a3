//! Infrastructure Layer
//!
//! Adapters implementing the domain ports:
//! - InMemory: warehouse emulation, no transactions
//! - SQLite: file-based, transactional (feature `sqlite`, default)
//! - PostgreSQL: pooled, transactional (feature `postgres`)

pub mod factory;
pub mod kv_store;
pub mod memory_collaborators;
pub mod memory_store;
pub mod sql;

#[cfg(feature = "sqlite")]
pub mod sqlite_store;

#[cfg(feature = "postgres")]
pub mod postgres_store;

pub use factory::{connect, connect_backends, open_kv_store};
pub use kv_store::MokaKeyValueStore;
pub use memory_collaborators::{CommitRecord, InMemoryCommitGraph, InMemoryObjectStore, HEAD};
pub use memory_store::InMemoryConnection;

#[cfg(feature = "sqlite")]
pub use kv_store::SqliteKeyValueStore;
#[cfg(feature = "sqlite")]
pub use sqlite_store::SqliteConnection;

#[cfg(feature = "postgres")]
pub use postgres_store::PostgresConnection;
