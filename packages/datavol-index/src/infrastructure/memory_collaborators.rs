//! In-memory commit graph and object store
//!
//! Reference implementations of the collaborator ports, used by tests and
//! by embedders that keep refs and blobs in process.

use async_trait::async_trait;
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::domain::models::{ChangeKind, CommitSha, Entry, Sha, TreeChange, TreeId};
use crate::domain::ports::{CommitGraph, ObjectStore};
use crate::{Result, StorageError};

pub const HEAD: &str = "HEAD";

const MEM_URL_SCHEME: &str = "mem://";

type Listing = BTreeMap<String, Sha>;

#[derive(Debug, Clone, Default)]
struct RefState {
    commit: Option<CommitSha>,
    tree: Option<TreeId>,
}

#[derive(Debug, Clone)]
pub struct CommitRecord {
    pub tree: TreeId,
    pub parent: Option<CommitSha>,
    pub message: String,
}

#[derive(Default)]
struct GraphState {
    refs: HashMap<String, RefState>,
    trees: HashMap<TreeId, Listing>,
    commits: HashMap<CommitSha, CommitRecord>,
    log: Vec<CommitSha>,
}

/// Commit graph holding refs, trees and commits in memory
#[derive(Clone, Default)]
pub struct InMemoryCommitGraph {
    state: Arc<RwLock<GraphState>>,
}

fn tree_hash(listing: &Listing) -> TreeId {
    let mut hasher = Sha256::new();
    for (name, sha) in listing {
        hasher.update(name.as_bytes());
        hasher.update([0u8]);
        hasher.update(sha.as_str().as_bytes());
        hasher.update(b"\n");
    }
    TreeId::new(format!("{:x}", hasher.finalize()))
}

impl InMemoryCommitGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn commit(&self, sha: &CommitSha) -> Option<CommitRecord> {
        self.state.read().commits.get(sha).cloned()
    }

    /// Commits in creation order
    pub fn log(&self) -> Vec<CommitSha> {
        self.state.read().log.clone()
    }

    /// Paths and hashes of a stored tree
    pub fn tree(&self, id: &TreeId) -> Option<BTreeMap<String, Sha>> {
        self.state.read().trees.get(id).cloned()
    }
}

#[async_trait]
impl CommitGraph for InMemoryCommitGraph {
    async fn get_ref(&self, name: &str) -> Result<Option<CommitSha>> {
        Ok(self
            .state
            .read()
            .refs
            .get(name)
            .and_then(|r| r.commit.clone()))
    }

    async fn tree_id(&self, reference: &str) -> Result<Option<TreeId>> {
        Ok(self
            .state
            .read()
            .refs
            .get(reference)
            .and_then(|r| r.tree.clone()))
    }

    async fn write_tree(&self, reference: &str, entries: &[Entry]) -> Result<TreeId> {
        let mut state = self.state.write();
        let mut listing = state
            .refs
            .get(reference)
            .and_then(|r| r.tree.as_ref())
            .and_then(|id| state.trees.get(id))
            .cloned()
            .unwrap_or_default();
        for entry in entries {
            listing.insert(entry.name.clone(), entry.sha.clone());
        }

        let id = tree_hash(&listing);
        state.trees.insert(id.clone(), listing);
        state.refs.entry(reference.to_string()).or_default().tree = Some(id.clone());
        Ok(id)
    }

    async fn create_commit(&self, tree_id: &TreeId, message: &str) -> Result<CommitSha> {
        let mut state = self.state.write();
        let parent = state.refs.get(HEAD).and_then(|r| r.commit.clone());

        let mut hasher = Sha256::new();
        hasher.update(format!("tree {}\n", tree_id));
        if let Some(parent) = &parent {
            hasher.update(format!("parent {}\n", parent));
        }
        hasher.update(format!("seq {}\n\n{}", state.log.len(), message));
        let sha = CommitSha::new(format!("{:x}", hasher.finalize()));

        state.commits.insert(
            sha.clone(),
            CommitRecord {
                tree: tree_id.clone(),
                parent,
                message: message.to_string(),
            },
        );
        state.log.push(sha.clone());
        let head = state.refs.entry(HEAD.to_string()).or_default();
        head.commit = Some(sha.clone());
        head.tree = Some(tree_id.clone());
        Ok(sha)
    }

    async fn diff_tree(&self, from: Option<&TreeId>, to: &TreeId) -> Result<Vec<TreeChange>> {
        let state = self.state.read();
        let empty = Listing::new();
        let old = match from {
            Some(id) => state
                .trees
                .get(id)
                .ok_or_else(|| StorageError::not_found(format!("Tree not found: {}", id)))?,
            None => &empty,
        };
        let new = state
            .trees
            .get(to)
            .ok_or_else(|| StorageError::not_found(format!("Tree not found: {}", to)))?;

        let mut changes = Vec::new();
        for (name, sha) in new {
            match old.get(name) {
                None => changes.push(TreeChange {
                    name: name.clone(),
                    kind: ChangeKind::Added,
                    old_sha: None,
                    new_sha: Some(sha.clone()),
                }),
                Some(previous) if previous != sha => changes.push(TreeChange {
                    name: name.clone(),
                    kind: ChangeKind::Modified,
                    old_sha: Some(previous.clone()),
                    new_sha: Some(sha.clone()),
                }),
                Some(_) => {}
            }
        }
        for (name, sha) in old {
            if !new.contains_key(name) {
                changes.push(TreeChange {
                    name: name.clone(),
                    kind: ChangeKind::Deleted,
                    old_sha: Some(sha.clone()),
                    new_sha: None,
                });
            }
        }
        changes.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(changes)
    }
}

/// Content-addressed blob store in memory; urls look like `mem://<sha>`
#[derive(Clone, Default)]
pub struct InMemoryObjectStore {
    blobs: Arc<RwLock<HashMap<Sha, Vec<u8>>>>,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.read().is_empty()
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn put(&self, sha: &Sha, bytes: &[u8]) -> Result<String> {
        self.blobs
            .write()
            .entry(sha.clone())
            .or_insert_with(|| bytes.to_vec());
        Ok(format!("{}{}", MEM_URL_SCHEME, sha))
    }

    async fn get(&self, url: &str) -> Result<Vec<u8>> {
        let sha = url
            .strip_prefix(MEM_URL_SCHEME)
            .ok_or_else(|| StorageError::validation(format!("Not an in-memory object url: {}", url)))
            .and_then(Sha::parse)?;
        self.blobs
            .read()
            .get(&sha)
            .cloned()
            .ok_or_else(|| StorageError::not_found(format!("Object not found: {}", url)))
    }
}
