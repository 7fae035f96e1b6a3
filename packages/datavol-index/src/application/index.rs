//! Volume Index
//!
//! Maps `path -> (content hash, stat, url)` across two tables: an
//! append-only staging table and the committed history. A commit copies the
//! staged rows whose hash the committed table has never seen; nothing in the
//! committed table is ever updated or deleted.

use std::sync::Arc;
use tracing::{debug, info};

use super::tree_cache::TreeCache;
use crate::config::IndexOptions;
use crate::domain::clock;
use crate::domain::models::{Entry, ItemCounts, Row, Sha, TreeId, NAME_COLUMN, SHA_COLUMN, TS_COLUMN};
use crate::domain::ports::Connection;
use crate::domain::query::{AntiJoin, LatestQuery, Predicate};
use crate::{Result, StorageError};

pub struct Index {
    conn: Arc<dyn Connection>,
    tree_cache: TreeCache,
    committed: String,
    staging: String,
    options: IndexOptions,
}

impl Index {
    pub fn new(
        conn: Arc<dyn Connection>,
        tree_cache: TreeCache,
        committed: impl Into<String>,
        staging: impl Into<String>,
        options: IndexOptions,
    ) -> Self {
        Self {
            conn,
            tree_cache,
            committed: committed.into(),
            staging: staging.into(),
            options,
        }
    }

    /// Create both tables if missing
    pub async fn init(&self) -> Result<()> {
        let schema = Entry::schema();
        self.conn.create_table(&self.committed, &schema).await?;
        self.conn.create_table(&self.staging, &schema).await
    }

    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self.conn
    }

    pub fn committed_table(&self) -> &str {
        &self.committed
    }

    pub fn staging_table(&self) -> &str {
        &self.staging
    }

    /// Append a timestamped copy of each entry to staging.
    ///
    /// No dedup happens here; duplicates are resolved at read and commit
    /// time. A failed insert leaves the batch for the caller to retry.
    pub async fn set_entries(&self, entries: &[Entry]) -> Result<Vec<Entry>> {
        if entries.is_empty() {
            return Err(StorageError::validation("set_entries needs at least one entry"));
        }
        let mut staged = Vec::with_capacity(entries.len());
        for entry in entries {
            entry.validate()?;
            let mut entry = entry.clone();
            entry.ts = clock::next_timestamp();
            staged.push(entry);
        }

        let rows: Vec<Row> = staged.iter().map(Entry::to_row).collect();
        self.conn.insert_rows(&self.staging, &rows).await?;
        self.tree_cache.set_entries(&staged).await?;
        debug!(table = %self.staging, count = staged.len(), "Staged index entries");
        Ok(staged)
    }

    /// Distinct names across committed and staging
    pub async fn version_count_items(&self) -> Result<ItemCounts> {
        self.count_items(vec![self.committed.clone(), self.staging.clone()])
            .await
    }

    /// Distinct names in staging only
    pub async fn staging_count_items(&self) -> Result<ItemCounts> {
        self.count_items(vec![self.staging.clone()]).await
    }

    async fn count_items(&self, tables: Vec<String>) -> Result<ItemCounts> {
        let (data_points, metadata_files) = self
            .conn
            .count_distinct_by_suffix(&tables, NAME_COLUMN, &self.options.metadata_file_suffix)
            .await?;
        Ok(ItemCounts {
            data_points,
            metadata_files,
        })
    }

    /// Promote staged rows whose hash is not yet committed.
    ///
    /// Duplicates inside staging collapse to the earliest row per
    /// `(name, sha)`, so one hash staged under two names yields two rows.
    /// Returns the number of rows copied.
    pub async fn begin_commit(&self, tree_id: &TreeId) -> Result<u64> {
        let delta = self.conn.select_unseen(&self.unseen_query()).await?;
        let promoted = if delta.is_empty() {
            0
        } else {
            self.conn.insert_rows(&self.committed, &delta).await?
        };
        info!(tree = %tree_id, promoted, "Promoted staged index entries");
        Ok(promoted)
    }

    fn unseen_query(&self) -> AntiJoin {
        AntiJoin {
            source: self.staging.clone(),
            target: self.committed.clone(),
            key: SHA_COLUMN.to_string(),
            partition_by: vec![NAME_COLUMN.to_string(), SHA_COLUMN.to_string()],
            order_by: TS_COLUMN.to_string(),
            columns: Entry::schema().names(),
        }
    }

    /// Whether staging holds rows no commit has taken yet. With
    /// `delete_temp_on_commit` off, staging keeps promoted rows, so only
    /// the anti-join answers this.
    pub async fn has_pending(&self) -> Result<bool> {
        if self.options.delete_temp_on_commit {
            return Ok(self.staging_count().await? > 0);
        }
        Ok(!self.conn.select_unseen(&self.unseen_query()).await?.is_empty())
    }

    /// Truncate staging unless `delete_temp_on_commit` is off
    pub async fn end_commit(&self) -> Result<()> {
        if !self.options.delete_temp_on_commit {
            debug!(table = %self.staging, "Keeping staging after commit");
            return Ok(());
        }
        let removed = self.conn.delete_all(&self.staging).await?;
        debug!(table = %self.staging, removed, "Truncated staging");
        Ok(())
    }

    pub async fn get_commit_id(&self) -> Result<Option<TreeId>> {
        self.tree_cache.get_commit_id().await
    }

    /// Record `tree_id` as the last committed tree
    pub async fn set_commit_id(&self, tree_id: &TreeId) -> Result<()> {
        self.tree_cache.set_commit_id(tree_id).await
    }

    pub async fn has_staged(&self) -> Result<bool> {
        self.tree_cache.has_staged().await
    }

    /// Read-time winner per name: the latest `ts` across staging and
    /// committed, optionally restricted to `names`
    pub async fn head_entries(&self, names: Option<&[String]>) -> Result<Vec<Entry>> {
        let mut query = LatestQuery::new(
            vec![self.staging.clone(), self.committed.clone()],
            NAME_COLUMN,
            TS_COLUMN,
            Entry::schema().names(),
        );
        if let Some(names) = names {
            query = query.with_keys(names.to_vec());
        }
        self.conn
            .select_latest(&query)
            .await?
            .iter()
            .map(Entry::from_row)
            .collect()
    }

    /// Committed rows, optionally only those carrying `sha`
    pub async fn committed_count(&self, sha: Option<&Sha>) -> Result<u64> {
        let predicates: Vec<Predicate> = sha
            .map(|s| vec![Predicate::eq(SHA_COLUMN, s.as_str())])
            .unwrap_or_default();
        self.conn.count_rows(&self.committed, &predicates).await
    }

    pub async fn staging_count(&self) -> Result<u64> {
        self.conn.count_rows(&self.staging, &[]).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TableNames;
    use crate::infrastructure::{InMemoryConnection, MokaKeyValueStore};
    use pretty_assertions::assert_eq;

    fn sha(s: &str) -> Sha {
        Sha::parse(s).unwrap()
    }

    async fn index_with(options: IndexOptions) -> Index {
        let names = TableNames::default();
        let cache = TreeCache::new(Arc::new(MokaKeyValueStore::default()), "acme", "images");
        let index = Index::new(
            Arc::new(InMemoryConnection::new()),
            cache,
            names.index,
            names.staging_index,
            options,
        );
        index.init().await.unwrap();
        index
    }

    async fn index() -> Index {
        index_with(IndexOptions::default()).await
    }

    async fn commit(index: &Index, tree: &str) -> u64 {
        let tree = TreeId::new(tree);
        let promoted = index.begin_commit(&tree).await.unwrap();
        index.end_commit().await.unwrap();
        index.set_commit_id(&tree).await.unwrap();
        promoted
    }

    #[tokio::test]
    async fn test_set_entries_rejects_empty_batch() {
        let index = index().await;
        let err = index.set_entries(&[]).await.unwrap_err();
        assert_eq!(err.kind, crate::ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_single_entry_commit_counts() {
        let index = index().await;
        index
            .set_entries(&[Entry::new("a.txt", sha("aa11"), 10)])
            .await
            .unwrap();
        assert_eq!(
            index.staging_count_items().await.unwrap(),
            ItemCounts {
                data_points: 1,
                metadata_files: 0
            }
        );

        assert_eq!(commit(&index, "t1").await, 1);
        assert_eq!(
            index.version_count_items().await.unwrap(),
            ItemCounts {
                data_points: 1,
                metadata_files: 0
            }
        );
        assert_eq!(index.staging_count().await.unwrap(), 0);
        assert_eq!(
            index.get_commit_id().await.unwrap(),
            Some(TreeId::new("t1"))
        );
    }

    #[tokio::test]
    async fn test_same_sha_two_names() {
        let index = index().await;
        index
            .set_entries(&[
                Entry::new("a.txt", sha("aa11"), 10),
                Entry::new("b.txt", sha("aa11"), 10),
            ])
            .await
            .unwrap();

        assert_eq!(commit(&index, "t1").await, 2);
        assert_eq!(index.committed_count(Some(&sha("aa11"))).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_duplicates_in_staging_collapse() {
        let index = index().await;
        let entry = Entry::new("a.txt", sha("aa11"), 10);
        index.set_entries(&[entry.clone()]).await.unwrap();
        index.set_entries(&[entry]).await.unwrap();
        assert_eq!(index.staging_count().await.unwrap(), 2);

        assert_eq!(commit(&index, "t1").await, 1);
    }

    #[tokio::test]
    async fn test_committed_hash_not_promoted_again() {
        let index = index().await;
        index
            .set_entries(&[Entry::new("a.txt", sha("aa11"), 10)])
            .await
            .unwrap();
        commit(&index, "t1").await;

        index
            .set_entries(&[
                Entry::new("a.txt", sha("aa11"), 10),
                Entry::new("b.txt", sha("bb22"), 5),
            ])
            .await
            .unwrap();
        assert_eq!(commit(&index, "t2").await, 1);
        assert_eq!(index.committed_count(None).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_keep_staging_when_configured() {
        let options = IndexOptions {
            delete_temp_on_commit: false,
            ..IndexOptions::default()
        };
        let index = index_with(options).await;
        index
            .set_entries(&[Entry::new("a.txt", sha("aa11"), 10)])
            .await
            .unwrap();
        commit(&index, "t1").await;

        assert_eq!(index.staging_count().await.unwrap(), 1);
        // Re-running the anti-join finds nothing new
        assert_eq!(commit(&index, "t2").await, 0);
        assert_eq!(index.committed_count(None).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_has_pending() {
        let index = index().await;
        assert!(!index.has_pending().await.unwrap());
        index
            .set_entries(&[Entry::new("a.txt", sha("aa11"), 10)])
            .await
            .unwrap();
        assert!(index.has_pending().await.unwrap());
        commit(&index, "t1").await;
        assert!(!index.has_pending().await.unwrap());
    }

    #[tokio::test]
    async fn test_has_pending_with_kept_staging() {
        let options = IndexOptions {
            delete_temp_on_commit: false,
            ..IndexOptions::default()
        };
        let index = index_with(options).await;
        index
            .set_entries(&[Entry::new("a.txt", sha("aa11"), 10)])
            .await
            .unwrap();
        commit(&index, "t1").await;
        assert_eq!(index.staging_count().await.unwrap(), 1);
        assert!(!index.has_pending().await.unwrap());

        index
            .set_entries(&[Entry::new("b.txt", sha("bb22"), 5)])
            .await
            .unwrap();
        assert!(index.has_pending().await.unwrap());
    }

    #[tokio::test]
    async fn test_metadata_file_counts() {
        let index = index().await;
        index
            .set_entries(&[
                Entry::new("img.png", sha("aa"), 1),
                Entry::new("img.png.meta.json", sha("ab"), 1),
                Entry::new("img.png", sha("ac"), 1),
            ])
            .await
            .unwrap();

        assert_eq!(
            index.staging_count_items().await.unwrap(),
            ItemCounts {
                data_points: 1,
                metadata_files: 1
            }
        );
    }

    #[tokio::test]
    async fn test_head_entries_latest_wins() {
        let index = index().await;
        index
            .set_entries(&[Entry::new("a.txt", sha("aa11"), 10)])
            .await
            .unwrap();
        commit(&index, "t1").await;
        index
            .set_entries(&[
                Entry::new("a.txt", sha("aa22"), 12),
                Entry::new("b.txt", sha("bb11"), 3),
            ])
            .await
            .unwrap();

        let head = index.head_entries(None).await.unwrap();
        let pairs: Vec<(String, String)> = head
            .iter()
            .map(|e| (e.name.clone(), e.sha.to_string()))
            .collect();
        assert_eq!(
            pairs,
            vec![
                ("a.txt".to_string(), "aa22".to_string()),
                ("b.txt".to_string(), "bb11".to_string())
            ]
        );

        let only_b = index
            .head_entries(Some(&["b.txt".to_string()]))
            .await
            .unwrap();
        assert_eq!(only_b.len(), 1);
        assert_eq!(only_b[0].size, 3);
    }

    #[tokio::test]
    async fn test_staged_marker() {
        let index = index().await;
        assert!(!index.has_staged().await.unwrap());
        index
            .set_entries(&[Entry::new("a.txt", sha("aa11"), 10)])
            .await
            .unwrap();
        assert!(index.has_staged().await.unwrap());
        commit(&index, "t1").await;
        assert!(!index.has_staged().await.unwrap());
    }
}
