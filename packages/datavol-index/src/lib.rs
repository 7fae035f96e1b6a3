//! datavol-index: staged-commit storage for versioned data volumes
//!
//! ## Core Principles
//!
//! 1. **Two tables per group**: writes land in an append-only staging
//!    table; a commit copies them into the committed history
//! 2. **Content addressed**: commits insert only hashes the committed table
//!    has never seen, so a repeated or concurrent commit adds nothing or a
//!    harmless duplicate, never an update
//! 3. **Last writer wins**: every read picks the latest `ts` per key
//! 4. **Additive schema**: metadata columns are added, never dropped or
//!    retyped
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use datavol_index::application::Repository;
//! use datavol_index::config::EngineConfig;
//! use datavol_index::infrastructure::{InMemoryCommitGraph, InMemoryObjectStore};
//! use datavol_index::{Entry, MetadataRecord, Sha};
//!
//! # async fn run() -> datavol_index::Result<()> {
//! let config = EngineConfig::from_yaml("volume.yaml")?;
//! let repo = Repository::open(
//!     &config,
//!     Arc::new(InMemoryCommitGraph::new()),
//!     Arc::new(InMemoryObjectStore::new()),
//! )
//! .await?;
//!
//! let sha = Sha::parse("aa11")?;
//! repo.stage_entries(&[Entry::new("a.txt", sha.clone(), 10)]).await?;
//! repo.stage_metadata(&[MetadataRecord::new(sha).with_field("label", "cat")])
//!     .await?;
//!
//! if let Some(commit) = repo.commit("add a.txt").await? {
//!     println!("committed {}", commit);
//! }
//! # Ok(())
//! # }
//! ```

pub mod application;
pub mod config;
pub mod domain;
pub mod error;
pub mod infrastructure;

pub use error::{ErrorKind, Result, StorageError};

pub use application::{Index, MetadataDb, MetadataQuery, Repository, TreeCache};
pub use config::EngineConfig;
pub use domain::{
    CommitSha, CommitState, Entry, FileStat, ItemCounts, MergePolicy, MetadataRecord, Sha,
    TreeId, Value,
};
