//! Engine configuration
//!
//! One YAML document describes a volume: who owns it, how its tables are
//! named, which backend holds each table group and where the TreeCache
//! lives.
//!
//! ```yaml
//! version: 1
//! organization: acme
//! volume: images
//! table_prefix: acme_images_
//! index:
//!   delete_temp_on_commit: true
//! metadata:
//!   merge_policy: replace
//! backends:
//!   index: { kind: sqlite, path: /var/lib/datavol/index.db }
//!   metadata: { kind: sqlite, path: /var/lib/datavol/index.db }
//! tree_cache: { kind: memory, max_entries: 1000 }
//! ```

pub mod error;
pub mod io;

pub use error::{ConfigError, ConfigResult};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::domain::models::MergePolicy;

/// Schema versions `from_yaml` accepts
pub const SUPPORTED_VERSIONS: &[u32] = &[1];

pub const DEFAULT_METADATA_FILE_SUFFIX: &str = ".meta.json";

static TABLE_PREFIX_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,31}$").expect("static regex"));

/// Trait for validatable configuration objects
pub trait Validatable {
    fn validate(&self) -> ConfigResult<()>;

    fn config_name(&self) -> &'static str {
        "Config"
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Sections
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct IndexOptions {
    /// Suffix of the staging table, `staging_index_<version>`
    pub version: u32,
    /// Truncate staging in `end_commit`
    pub delete_temp_on_commit: bool,
    /// Names ending with this count as metadata files
    pub metadata_file_suffix: String,
}

impl Default for IndexOptions {
    fn default() -> Self {
        Self {
            version: 1,
            delete_temp_on_commit: true,
            metadata_file_suffix: DEFAULT_METADATA_FILE_SUFFIX.to_string(),
        }
    }
}

impl Validatable for IndexOptions {
    fn validate(&self) -> ConfigResult<()> {
        if self.version == 0 {
            return Err(ConfigError::range_with_hint(
                "index.version",
                self.version,
                1,
                u32::MAX,
                "Staging tables are numbered from 1",
            ));
        }
        if self.metadata_file_suffix.is_empty() {
            return Err(ConfigError::invalid(
                "index.metadata_file_suffix",
                "must not be empty",
            ));
        }
        Ok(())
    }

    fn config_name(&self) -> &'static str {
        "IndexOptions"
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct MetadataOptions {
    pub merge_policy: MergePolicy,
}

/// Where one table group lives
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BackendConfig {
    /// In-process warehouse emulation
    #[default]
    Memory,
    Sqlite {
        path: PathBuf,
    },
    Postgres {
        url: String,
        #[serde(default = "default_max_connections")]
        max_connections: u32,
    },
}

fn default_max_connections() -> u32 {
    5
}

impl Validatable for BackendConfig {
    fn validate(&self) -> ConfigResult<()> {
        match self {
            BackendConfig::Memory => Ok(()),
            BackendConfig::Sqlite { path } => {
                if path.as_os_str().is_empty() {
                    return Err(ConfigError::invalid("backends.*.path", "must not be empty"));
                }
                if cfg!(not(feature = "sqlite")) {
                    return Err(ConfigError::FeatureDisabled {
                        backend: "sqlite".into(),
                        feature: "sqlite".into(),
                    });
                }
                Ok(())
            }
            BackendConfig::Postgres {
                url,
                max_connections,
            } => {
                if !(url.starts_with("postgres://") || url.starts_with("postgresql://")) {
                    return Err(ConfigError::invalid(
                        "backends.*.url",
                        "expected a postgres:// connection string",
                    ));
                }
                if !(1..=100).contains(max_connections) {
                    return Err(ConfigError::range_with_hint(
                        "backends.*.max_connections",
                        max_connections,
                        1,
                        100,
                        "A commit holds one connection per table group",
                    ));
                }
                if cfg!(not(feature = "postgres")) {
                    return Err(ConfigError::FeatureDisabled {
                        backend: "postgres".into(),
                        feature: "postgres".into(),
                    });
                }
                Ok(())
            }
        }
    }

    fn config_name(&self) -> &'static str {
        "BackendConfig"
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Backends {
    pub index: BackendConfig,
    pub metadata: BackendConfig,
}

/// Key-value store behind the TreeCache
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TreeCacheConfig {
    Memory {
        #[serde(default = "default_cache_entries")]
        max_entries: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ttl_secs: Option<u64>,
    },
    Sqlite {
        path: PathBuf,
    },
}

fn default_cache_entries() -> u64 {
    10_000
}

impl Default for TreeCacheConfig {
    fn default() -> Self {
        TreeCacheConfig::Memory {
            max_entries: default_cache_entries(),
            ttl_secs: None,
        }
    }
}

impl Validatable for TreeCacheConfig {
    fn validate(&self) -> ConfigResult<()> {
        match self {
            TreeCacheConfig::Memory {
                max_entries,
                ttl_secs,
            } => {
                if *max_entries == 0 {
                    return Err(ConfigError::range_with_hint(
                        "tree_cache.max_entries",
                        max_entries,
                        1,
                        u64::MAX,
                        "The cache holds one entry per volume",
                    ));
                }
                if *ttl_secs == Some(0) {
                    return Err(ConfigError::invalid(
                        "tree_cache.ttl_secs",
                        "omit the field to disable expiry",
                    ));
                }
                Ok(())
            }
            TreeCacheConfig::Sqlite { path } => {
                if path.as_os_str().is_empty() {
                    return Err(ConfigError::invalid("tree_cache.path", "must not be empty"));
                }
                if cfg!(not(feature = "sqlite")) {
                    return Err(ConfigError::FeatureDisabled {
                        backend: "sqlite".into(),
                        feature: "sqlite".into(),
                    });
                }
                Ok(())
            }
        }
    }

    fn config_name(&self) -> &'static str {
        "TreeCacheConfig"
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// EngineConfig
// ═══════════════════════════════════════════════════════════════════════════

/// Complete configuration of one volume
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    /// Schema version (always 1 for v1)
    pub version: u32,
    pub organization: String,
    pub volume: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table_prefix: Option<String>,
    #[serde(default)]
    pub index: IndexOptions,
    #[serde(default)]
    pub metadata: MetadataOptions,
    #[serde(default)]
    pub backends: Backends,
    #[serde(default)]
    pub tree_cache: TreeCacheConfig,
}

impl EngineConfig {
    /// In-memory defaults for a volume
    pub fn new(organization: impl Into<String>, volume: impl Into<String>) -> Self {
        Self {
            version: 1,
            organization: organization.into(),
            volume: volume.into(),
            table_prefix: None,
            index: IndexOptions::default(),
            metadata: MetadataOptions::default(),
            backends: Backends::default(),
            tree_cache: TreeCacheConfig::default(),
        }
    }

    pub fn with_backend(mut self, backend: BackendConfig) -> Self {
        self.backends.index = backend.clone();
        self.backends.metadata = backend;
        self
    }

    pub fn with_table_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.table_prefix = Some(prefix.into());
        self
    }

    pub fn with_merge_policy(mut self, policy: MergePolicy) -> Self {
        self.metadata.merge_policy = policy;
        self
    }

    pub fn table_names(&self) -> TableNames {
        TableNames::new(self.table_prefix.as_deref(), self.index.version)
    }
}

impl Validatable for EngineConfig {
    fn validate(&self) -> ConfigResult<()> {
        if !SUPPORTED_VERSIONS.contains(&self.version) {
            return Err(ConfigError::UnsupportedVersion {
                found: self.version,
                supported: SUPPORTED_VERSIONS.to_vec(),
            });
        }
        if self.organization.trim().is_empty() {
            return Err(ConfigError::invalid("organization", "must not be empty"));
        }
        if self.volume.trim().is_empty() {
            return Err(ConfigError::invalid("volume", "must not be empty"));
        }
        if let Some(prefix) = &self.table_prefix {
            if !TABLE_PREFIX_RE.is_match(prefix) {
                return Err(ConfigError::invalid(
                    "table_prefix",
                    format!("'{}' is not a valid identifier prefix", prefix),
                ));
            }
        }
        self.index.validate()?;
        self.backends.index.validate()?;
        self.backends.metadata.validate()?;
        self.tree_cache.validate()
    }

    fn config_name(&self) -> &'static str {
        "EngineConfig"
    }
}

/// Physical table names of one volume
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableNames {
    pub index: String,
    pub staging_index: String,
    pub metadata: String,
    pub metadata_staging: String,
}

impl TableNames {
    pub fn new(prefix: Option<&str>, index_version: u32) -> Self {
        let prefix = prefix.unwrap_or_default();
        Self {
            index: format!("{}index", prefix),
            staging_index: format!("{}staging_index_{}", prefix, index_version),
            metadata: format!("{}metadata", prefix),
            metadata_staging: format!("{}staging", prefix),
        }
    }
}

impl Default for TableNames {
    fn default() -> Self {
        Self::new(None, 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_default_table_names() {
        let names = EngineConfig::new("acme", "images").table_names();
        assert_eq!(names.index, "index");
        assert_eq!(names.staging_index, "staging_index_1");
        assert_eq!(names.metadata, "metadata");
        assert_eq!(names.metadata_staging, "staging");
    }

    #[test]
    fn test_prefixed_table_names() {
        let mut config = EngineConfig::new("acme", "images").with_table_prefix("acme_");
        config.index.version = 3;
        let names = config.table_names();
        assert_eq!(names.index, "acme_index");
        assert_eq!(names.staging_index, "acme_staging_index_3");
    }

    #[test]
    fn test_validate_defaults() {
        assert!(EngineConfig::new("acme", "images").validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_prefix() {
        let config = EngineConfig::new("acme", "images").with_table_prefix("drop table;");
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_empty_volume() {
        let config = EngineConfig::new("acme", " ");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_index_options() {
        let mut options = IndexOptions::default();
        options.version = 0;
        assert!(matches!(options.validate(), Err(ConfigError::Range { .. })));

        let mut options = IndexOptions::default();
        options.metadata_file_suffix.clear();
        assert!(options.validate().is_err());
    }

    #[test]
    fn test_validate_postgres_backend() {
        let bad_url = BackendConfig::Postgres {
            url: "mysql://x".into(),
            max_connections: 5,
        };
        assert!(matches!(
            bad_url.validate(),
            Err(ConfigError::InvalidValue { .. })
        ));

        let no_connections = BackendConfig::Postgres {
            url: "postgres://localhost/db".into(),
            max_connections: 0,
        };
        assert!(matches!(
            no_connections.validate(),
            Err(ConfigError::Range { .. })
        ));
    }

    #[test]
    fn test_validate_tree_cache() {
        let zero = TreeCacheConfig::Memory {
            max_entries: 0,
            ttl_secs: None,
        };
        assert!(zero.validate().is_err());

        let no_ttl = TreeCacheConfig::Memory {
            max_entries: 1,
            ttl_secs: Some(0),
        };
        assert!(no_ttl.validate().is_err());
    }
}
