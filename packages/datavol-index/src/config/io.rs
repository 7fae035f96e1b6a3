//! Configuration I/O (YAML loading)

use std::path::Path;

use super::{ConfigError, ConfigResult, EngineConfig, Validatable, SUPPORTED_VERSIONS};

impl EngineConfig {
    /// Load and validate a YAML file
    pub fn from_yaml(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    /// Parse and validate a YAML document
    pub fn from_yaml_str(content: &str) -> ConfigResult<Self> {
        let config: EngineConfig = serde_yaml::from_str(content)?;
        if !SUPPORTED_VERSIONS.contains(&config.version) {
            return Err(ConfigError::UnsupportedVersion {
                found: config.version,
                supported: SUPPORTED_VERSIONS.to_vec(),
            });
        }
        config.validate()?;
        Ok(config)
    }

    pub fn to_yaml(&self) -> ConfigResult<String> {
        serde_yaml::to_string(self).map_err(ConfigError::Yaml)
    }
}
