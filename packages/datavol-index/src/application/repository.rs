//! Repository
//!
//! Drives the two-phase stage -> commit workflow over one Index and one
//! MetadataDb, and owns the transaction scope across their connections.
//!
//! Commit order: promote index rows, create the commit object, promote
//! metadata, truncate index staging, close transactions, then record the
//! new tree in the TreeCache. Any failure rolls back what the backends can
//! roll back and leaves the repository `Dirty` with staging intact.
//!
//! Staging shares connections with the commit, so it waits while a
//! transaction scope is open: rows written inside the scope would vanish
//! with a rollback after their stage call already returned.

use sha2::{Digest, Sha256};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{OwnedRwLockWriteGuard, RwLock};
use tracing::{debug, info, warn};

use super::index::Index;
use super::metadata::MetadataDb;
use super::tree_cache::TreeCache;
use crate::config::{EngineConfig, Validatable};
use crate::domain::models::{
    CommitSha, CommitState, Entry, FileStat, MetadataRecord, Sha, TreeChange, TreeId,
};
use crate::domain::ports::{CommitGraph, Connection, KeyValueStore, ObjectStore};
use crate::infrastructure::{connect_backends, open_kv_store, HEAD};
use crate::{Result, StorageError};

pub struct Repository {
    index: Index,
    metadata: MetadataDb,
    graph: Arc<dyn CommitGraph>,
    objects: Arc<dyn ObjectStore>,
    state: Mutex<CommitState>,
    /// Staging holds it shared; an open transaction scope holds it exclusively
    scope: Arc<RwLock<()>>,
    scope_guard: Mutex<Option<OwnedRwLockWriteGuard<()>>>,
}

impl Repository {
    /// Wire a repository from already opened parts and create its tables
    pub async fn new(
        config: &EngineConfig,
        index_conn: Arc<dyn Connection>,
        metadata_conn: Arc<dyn Connection>,
        kv: Arc<dyn KeyValueStore>,
        graph: Arc<dyn CommitGraph>,
        objects: Arc<dyn ObjectStore>,
    ) -> Result<Self> {
        config.validate()?;
        let names = config.table_names();

        let cache = TreeCache::new(kv, &config.organization, &config.volume);
        let index = Index::new(
            index_conn,
            cache,
            names.index,
            names.staging_index,
            config.index.clone(),
        );
        let metadata = MetadataDb::new(
            metadata_conn,
            names.metadata,
            names.metadata_staging,
            config.metadata.merge_policy,
        );
        index.init().await?;
        metadata.init().await?;

        let pending = index.has_staged().await?
            || index.has_pending().await?
            || metadata.staging_count().await? > 0;
        let state = if pending {
            CommitState::Dirty
        } else {
            CommitState::Clean
        };
        info!(
            organization = %config.organization,
            volume = %config.volume,
            index_backend = %index.connection().kind(),
            metadata_backend = %metadata.connection().kind(),
            state = ?state,
            "Opened repository"
        );

        Ok(Self {
            index,
            metadata,
            graph,
            objects,
            state: Mutex::new(state),
            scope: Arc::new(RwLock::new(())),
            scope_guard: Mutex::new(None),
        })
    }

    /// Open backends and the TreeCache store from `config`
    pub async fn open(
        config: &EngineConfig,
        graph: Arc<dyn CommitGraph>,
        objects: Arc<dyn ObjectStore>,
    ) -> Result<Self> {
        config.validate()?;
        let (index_conn, metadata_conn) = connect_backends(&config.backends).await?;
        let kv = open_kv_store(&config.tree_cache)?;
        Self::new(config, index_conn, metadata_conn, kv, graph, objects).await
    }

    pub fn index(&self) -> &Index {
        &self.index
    }

    pub fn metadata(&self) -> &MetadataDb {
        &self.metadata
    }

    pub fn state(&self) -> CommitState {
        *self.state.lock()
    }

    fn set_state(&self, state: CommitState) {
        let mut current = self.state.lock();
        if *current != state {
            debug!(from = ?*current, to = ?state, "Commit state changed");
            *current = state;
        }
    }

    fn mark_dirty(&self) {
        let mut current = self.state.lock();
        if *current == CommitState::Clean {
            *current = CommitState::Dirty;
        }
    }

    /// Distinct connections; a connection shared by both table groups
    /// appears once
    fn connections(&self) -> Vec<Arc<dyn Connection>> {
        let mut connections = vec![self.index.connection().clone()];
        let metadata = self.metadata.connection();
        if !Arc::ptr_eq(&connections[0], metadata) {
            connections.push(metadata.clone());
        }
        connections
    }

    fn all_transactional(&self) -> bool {
        self.connections()
            .iter()
            .all(|c| c.supports_transactions())
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Transaction Scope
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Open a transaction on every connection. If one fails to begin, the
    /// ones already opened are rolled back.
    ///
    /// Staging calls wait until the scope is closed by `end_transactions` or
    /// `rollback_transactions`, so do not stage from the task holding it.
    pub async fn start_transactions(&self) -> Result<()> {
        let guard = self.scope.clone().write_owned().await;
        self.begin_all().await?;
        *self.scope_guard.lock() = Some(guard);
        Ok(())
    }

    async fn begin_all(&self) -> Result<()> {
        let connections = self.connections();
        for (i, conn) in connections.iter().enumerate() {
            if !conn.supports_transactions() {
                debug!(backend = %conn.kind(), "Backend has no transactions, scope is advisory");
            }
            if let Err(err) = conn.begin_transaction().await {
                for opened in &connections[..i] {
                    if let Err(rollback_err) = opened.rollback_transaction().await {
                        warn!(backend = %opened.kind(), error = %rollback_err, "Rollback failed");
                    }
                }
                return Err(err);
            }
        }
        Ok(())
    }

    /// Commit every connection and close the scope. On failure the scope
    /// stays open until `rollback_transactions`.
    pub async fn end_transactions(&self) -> Result<()> {
        self.commit_all().await?;
        self.close_scope();
        Ok(())
    }

    async fn commit_all(&self) -> Result<()> {
        for conn in self.connections() {
            conn.commit_transaction().await?;
        }
        Ok(())
    }

    fn close_scope(&self) {
        self.scope_guard.lock().take();
    }

    /// Roll back every connection, attempting all of them even if one
    /// fails; the first failure is returned
    pub async fn rollback_transactions(&self) -> Result<()> {
        let mut first_err = None;
        for conn in self.connections() {
            if !conn.supports_transactions() {
                warn!(
                    backend = %conn.kind(),
                    "Rollback is advisory, rows already written stay"
                );
            }
            if let Err(err) = conn.rollback_transaction().await {
                first_err.get_or_insert(err);
            }
        }
        self.close_scope();
        first_err.map_or(Ok(()), Err)
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Stage
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    async fn stage(&self, entries: &[Entry]) -> Result<(Vec<Entry>, TreeId)> {
        let _scope = self.scope.read().await;
        let staged = self.index.set_entries(entries).await?;
        self.mark_dirty();
        let tree = self.graph.write_tree(HEAD, &staged).await?;
        debug!(tree = %tree, count = staged.len(), "Wrote staged tree");
        Ok((staged, tree))
    }

    /// Stage index entries and lay them over the working tree of `HEAD`
    pub async fn stage_entries(&self, entries: &[Entry]) -> Result<TreeId> {
        Ok(self.stage(entries).await?.1)
    }

    pub async fn stage_metadata(&self, records: &[MetadataRecord]) -> Result<u64> {
        let _scope = self.scope.read().await;
        let staged = self.metadata.add_data(records).await?;
        if staged > 0 {
            self.mark_dirty();
        }
        Ok(staged)
    }

    /// Store `bytes` in the object store under their SHA-256 and stage an
    /// entry pointing at them
    pub async fn stage_blob(&self, name: &str, bytes: &[u8], stat: FileStat) -> Result<Entry> {
        let sha = Sha::parse(format!("{:x}", Sha256::digest(bytes)))?;
        let url = self.objects.put(&sha, bytes).await?;
        let entry = Entry::new(name, sha, bytes.len() as u64)
            .with_stat(stat)
            .with_url(url);

        let (mut staged, _) = self.stage(&[entry]).await?;
        staged
            .pop()
            .ok_or_else(|| StorageError::database("Staging returned no entry"))
    }

    /// Paths that differ between the last committed tree and `reference`
    pub async fn pending_changes(&self, reference: &str) -> Result<Vec<TreeChange>> {
        let Some(to) = self.graph.tree_id(reference).await? else {
            return Ok(Vec::new());
        };
        let from = self.index.get_commit_id().await?;
        if from.as_ref() == Some(&to) {
            return Ok(Vec::new());
        }
        self.graph.diff_tree(from.as_ref(), &to).await
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Commit
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Tree of `reference` if it differs from the last committed tree.
    ///
    /// An empty TreeCache (evicted, expired, or a fresh process) falls back
    /// to the staging tables: with nothing pending the tree is taken as
    /// committed and written back to the cache.
    pub async fn has_change_set(&self, reference: &str) -> Result<Option<TreeId>> {
        let Some(tree) = self.graph.tree_id(reference).await? else {
            return Ok(None);
        };
        match self.index.get_commit_id().await? {
            Some(committed) if committed == tree => Ok(None),
            Some(_) => Ok(Some(tree)),
            None => {
                if self.index.has_pending().await? || self.metadata.staging_count().await? > 0 {
                    return Ok(Some(tree));
                }
                debug!(tree = %tree, "TreeCache empty and nothing staged, reseeding");
                self.index.set_commit_id(&tree).await?;
                Ok(None)
            }
        }
    }

    /// Commit the working tree of `HEAD`. Returns `None` when nothing changed.
    pub async fn commit(&self, message: &str) -> Result<Option<CommitSha>> {
        let Some(tree) = self.has_change_set(HEAD).await? else {
            debug!("Nothing to commit");
            return Ok(None);
        };

        let previous = self.state();
        self.set_state(CommitState::Committing);
        match self.run_commit(message).await {
            Ok(Some((commit_sha, tree))) => {
                self.set_state(CommitState::Clean);
                info!(commit = %commit_sha, tree = %tree, "Committed");
                Ok(Some(commit_sha))
            }
            Ok(None) => {
                self.set_state(previous);
                debug!("Nothing left to commit once the scope opened");
                Ok(None)
            }
            Err(err) => {
                if let Err(rollback_err) = self.rollback_transactions().await {
                    warn!(error = %rollback_err, "Rollback after failed commit also failed");
                }
                self.set_state(CommitState::Dirty);
                warn!(tree = %tree, error = %err, "Commit failed, staging retained");
                Err(err)
            }
        }
    }

    /// Runs under the exclusive scope, so the tree is re-read there: another
    /// handle may have committed it, or staging may have moved it, while
    /// this call waited.
    async fn run_commit(&self, message: &str) -> Result<Option<(CommitSha, TreeId)>> {
        self.start_transactions().await?;
        let Some(tree) = self.has_change_set(HEAD).await? else {
            self.end_transactions().await?;
            return Ok(None);
        };
        let tree = &tree;
        self.index.begin_commit(tree).await?;

        // Past this point promoted rows may already be visible
        let advisory = !self.all_transactional();
        let after_promote = |step: &str, err: StorageError| {
            if advisory {
                StorageError::partial_commit(step, err)
            } else {
                err
            }
        };

        let commit_sha = self
            .graph
            .create_commit(tree, message)
            .await
            .map_err(|e| after_promote("create_commit", e))?;
        self.metadata
            .commit(&commit_sha, tree)
            .await
            .map_err(|e| after_promote("metadata commit", e))?;
        self.index
            .end_commit()
            .await
            .map_err(|e| after_promote("end_commit", e))?;
        self.commit_all()
            .await
            .map_err(|e| after_promote("end_transactions", e))?;

        // Rows are durable now; only the cache lags. The scope stays held so
        // no stage call lands between the promote and the cache update.
        self.index
            .set_commit_id(tree)
            .await
            .map_err(|e| StorageError::partial_commit("tree cache update", e))?;
        self.close_scope();
        Ok(Some((commit_sha, tree.clone())))
    }
}
