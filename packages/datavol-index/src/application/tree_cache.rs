//! TreeCache
//!
//! Remembers the last committed tree of one (organization, volume) pair in a
//! low-latency key-value store, plus a marker that staged rows exist. Both
//! answers are allowed to be stale in the conservative direction: a missing
//! commit id only triggers an extra change check.

use std::sync::Arc;
use tracing::debug;

use crate::domain::clock;
use crate::domain::models::{Entry, TreeId};
use crate::domain::ports::KeyValueStore;
use crate::Result;

pub struct TreeCache {
    store: Arc<dyn KeyValueStore>,
    key: String,
    staged_key: String,
}

impl TreeCache {
    pub fn new(store: Arc<dyn KeyValueStore>, organization: &str, volume: &str) -> Self {
        let key = format!("tree:{}:{}", organization, volume);
        Self {
            store,
            staged_key: format!("{}:staged", key),
            key,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Last committed tree, `None` if no commit has succeeded
    pub async fn get_commit_id(&self) -> Result<Option<TreeId>> {
        Ok(self.store.get(&self.key).await?.map(TreeId::new))
    }

    /// Record a successful commit and clear the staged marker
    pub async fn set_commit_id(&self, tree_id: &TreeId) -> Result<()> {
        self.store.set(&self.key, tree_id.as_str()).await?;
        self.store.delete(&self.staged_key).await
    }

    /// Note that entries were staged since the last commit
    pub async fn set_entries(&self, entries: &[Entry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let newest = entries
            .iter()
            .map(|e| clock::to_micros(&e.ts))
            .max()
            .unwrap_or_default();
        debug!(key = %self.key, count = entries.len(), "Marking staged entries");
        self.store.set(&self.staged_key, &newest.to_string()).await
    }

    /// Whether entries were staged and not yet committed
    pub async fn has_staged(&self) -> Result<bool> {
        Ok(self.store.get(&self.staged_key).await?.is_some())
    }
}
