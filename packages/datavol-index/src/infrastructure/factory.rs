//! Adapter selection from configuration

use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use super::kv_store::MokaKeyValueStore;
use super::memory_store::InMemoryConnection;
use crate::config::{BackendConfig, Backends, ConfigError, TreeCacheConfig};
use crate::domain::ports::{Connection, KeyValueStore};
use crate::Result;

/// Open the connection a backend config describes
pub async fn connect(config: &BackendConfig) -> Result<Arc<dyn Connection>> {
    match config {
        BackendConfig::Memory => Ok(Arc::new(InMemoryConnection::new())),
        #[cfg(feature = "sqlite")]
        BackendConfig::Sqlite { path } => {
            info!(path = %path.display(), "Opening SQLite backend");
            Ok(Arc::new(super::sqlite_store::SqliteConnection::new(path)?))
        }
        #[cfg(not(feature = "sqlite"))]
        BackendConfig::Sqlite { .. } => Err(ConfigError::FeatureDisabled {
            backend: "sqlite".into(),
            feature: "sqlite".into(),
        }
        .into()),
        #[cfg(feature = "postgres")]
        BackendConfig::Postgres {
            url,
            max_connections,
        } => Ok(Arc::new(
            super::postgres_store::PostgresConnection::new(url, *max_connections).await?,
        )),
        #[cfg(not(feature = "postgres"))]
        BackendConfig::Postgres { .. } => Err(ConfigError::FeatureDisabled {
            backend: "postgres".into(),
            feature: "postgres".into(),
        }
        .into()),
    }
}

/// Connections for the index and metadata table groups.
///
/// Identical configs share one connection, so a single transaction scope
/// covers both groups.
pub async fn connect_backends(
    backends: &Backends,
) -> Result<(Arc<dyn Connection>, Arc<dyn Connection>)> {
    let index = connect(&backends.index).await?;
    if backends.metadata == backends.index {
        return Ok((index.clone(), index));
    }
    let metadata = connect(&backends.metadata).await?;
    Ok((index, metadata))
}

pub fn open_kv_store(config: &TreeCacheConfig) -> Result<Arc<dyn KeyValueStore>> {
    match config {
        TreeCacheConfig::Memory {
            max_entries,
            ttl_secs,
        } => Ok(Arc::new(MokaKeyValueStore::new(
            *max_entries,
            ttl_secs.map(Duration::from_secs),
        ))),
        #[cfg(feature = "sqlite")]
        TreeCacheConfig::Sqlite { path } => {
            Ok(Arc::new(super::kv_store::SqliteKeyValueStore::new(path)?))
        }
        #[cfg(not(feature = "sqlite"))]
        TreeCacheConfig::Sqlite { .. } => Err(ConfigError::FeatureDisabled {
            backend: "sqlite".into(),
            feature: "sqlite".into(),
        }
        .into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::BackendKind;

    #[tokio::test]
    async fn test_identical_backends_share_connection() {
        let (index, metadata) = connect_backends(&Backends::default()).await.unwrap();
        assert!(Arc::ptr_eq(&index, &metadata));
        assert_eq!(index.kind(), BackendKind::Memory);
    }

    #[cfg(feature = "sqlite")]
    #[tokio::test]
    async fn test_distinct_backends() {
        let dir = tempfile::TempDir::new().unwrap();
        let backends = Backends {
            index: BackendConfig::Sqlite {
                path: dir.path().join("index.db"),
            },
            metadata: BackendConfig::Memory,
        };
        let (index, metadata) = connect_backends(&backends).await.unwrap();
        assert!(!Arc::ptr_eq(&index, &metadata));
        assert_eq!(index.kind(), BackendKind::Sqlite);
        assert_eq!(metadata.kind(), BackendKind::Memory);
    }

    #[tokio::test]
    async fn test_open_memory_kv_store() {
        let kv = open_kv_store(&TreeCacheConfig::default()).unwrap();
        kv.set("k", "v").await.unwrap();
        assert_eq!(kv.get("k").await.unwrap().as_deref(), Some("v"));
    }
}
