//! Application Layer
//!
//! - `Index`: path -> hash table pair with anti-join promotion
//! - `MetadataDb`: schema-evolving metadata keyed by hash
//! - `TreeCache`: last committed tree per volume
//! - `Repository`: stage -> commit orchestration

pub mod index;
pub mod metadata;
pub mod repository;
pub mod tree_cache;

pub use index::Index;
pub use metadata::{Filter, MetadataDb, MetadataQuery, Operand};
pub use repository::Repository;
pub use tree_cache::TreeCache;
