//! Key-value stores backing the TreeCache

use async_trait::async_trait;
use moka::sync::Cache;
use std::time::Duration;

use crate::domain::ports::KeyValueStore;
use crate::Result;

/// In-process KV store (moka, bounded, optional TTL)
///
/// Losing an entry is harmless: a missing tree cache only makes
/// `has_change_set` report a pending change.
#[derive(Clone)]
pub struct MokaKeyValueStore {
    cache: Cache<String, String>,
}

impl MokaKeyValueStore {
    pub fn new(max_entries: u64, ttl: Option<Duration>) -> Self {
        let mut builder = Cache::builder().max_capacity(max_entries);
        if let Some(ttl) = ttl {
            builder = builder.time_to_live(ttl);
        }
        Self {
            cache: builder.build(),
        }
    }

    pub fn entry_count(&self) -> u64 {
        self.cache.run_pending_tasks();
        self.cache.entry_count()
    }
}

impl Default for MokaKeyValueStore {
    fn default() -> Self {
        Self::new(10_000, None)
    }
}

#[async_trait]
impl KeyValueStore for MokaKeyValueStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.cache.get(key))
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.cache.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.cache.invalidate(key);
        Ok(())
    }
}

#[cfg(feature = "sqlite")]
pub use sqlite_kv::SqliteKeyValueStore;

#[cfg(feature = "sqlite")]
mod sqlite_kv {
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use rusqlite::OptionalExtension;
    use std::path::Path;
    use std::sync::Arc;

    use crate::domain::ports::KeyValueStore;
    use crate::Result;

    /// Durable KV store in a single SQLite table
    #[derive(Clone)]
    pub struct SqliteKeyValueStore {
        conn: Arc<Mutex<rusqlite::Connection>>,
    }

    impl SqliteKeyValueStore {
        pub fn new(db_path: impl AsRef<Path>) -> Result<Self> {
            Self::init(rusqlite::Connection::open(db_path)?)
        }

        pub fn in_memory() -> Result<Self> {
            Self::init(rusqlite::Connection::open_in_memory()?)
        }

        fn init(conn: rusqlite::Connection) -> Result<Self> {
            conn.execute(
                "CREATE TABLE IF NOT EXISTS kv_store (
                    key TEXT PRIMARY KEY,
                    value TEXT NOT NULL
                )",
                [],
            )?;
            Ok(Self {
                conn: Arc::new(Mutex::new(conn)),
            })
        }
    }

    #[async_trait]
    impl KeyValueStore for SqliteKeyValueStore {
        async fn get(&self, key: &str) -> Result<Option<String>> {
            let conn = self.conn.lock();
            Ok(conn
                .query_row("SELECT value FROM kv_store WHERE key = ?1", [key], |r| {
                    r.get(0)
                })
                .optional()?)
        }

        async fn set(&self, key: &str, value: &str) -> Result<()> {
            let conn = self.conn.lock();
            conn.execute(
                "INSERT INTO kv_store (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                [key, value],
            )?;
            Ok(())
        }

        async fn delete(&self, key: &str) -> Result<()> {
            let conn = self.conn.lock();
            conn.execute("DELETE FROM kv_store WHERE key = ?1", [key])?;
            Ok(())
        }
    }
}
