//! Client configuration.
//!
//! Loaded from TOML; every field has a default so an empty file is valid.

use serde::{Deserialize, Serialize};
use std::{fs, io, path::Path};
use thiserror::Error;

/// Upper bound on the output length the client will allocate for, in bytes.
pub const DEFAULT_MAX_OUTPUT_LEN: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Handles requested per `C_FindObjects` call.
    pub find_batch_size: usize,
    /// Largest length reported by the token that will be allocated.
    pub max_output_len: usize,
    /// Whether `create_object` checks mandatory attributes before calling the token.
    pub strict_objects: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            find_batch_size: 32,
            max_output_len: DEFAULT_MAX_OUTPUT_LEN,
            strict_objects: true,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration: {0}")]
    Io(#[from] io::Error),
    #[error("invalid configuration syntax: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl ClientConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        self.validate()?;
        fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.find_batch_size == 0 {
            return Err(ConfigError::Invalid(
                "find_batch_size must be at least 1".into(),
            ));
        }
        if self.max_output_len == 0 {
            return Err(ConfigError::Invalid(
                "max_output_len must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn empty_document_yields_defaults() {
        assert_eq!(ClientConfig::from_toml_str("").unwrap(), ClientConfig::default());
    }

    #[test]
    fn partial_document_overrides_fields() {
        let config = ClientConfig::from_toml_str("find_batch_size = 4\nstrict_objects = false\n")
            .unwrap();
        assert_eq!(config.find_batch_size, 4);
        assert!(!config.strict_objects);
        assert_eq!(config.max_output_len, DEFAULT_MAX_OUTPUT_LEN);
    }

    #[test]
    fn zero_batch_is_invalid() {
        assert!(matches!(
            ClientConfig::from_toml_str("find_batch_size = 0"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            ClientConfig::from_toml_str("find_batch_size = \"many\""),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn save_and_load_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("client.toml");
        let config = ClientConfig {
            find_batch_size: 8,
            max_output_len: 4096,
            strict_objects: false,
        };
        config.save(&path).unwrap();
        assert_eq!(ClientConfig::load(&path).unwrap(), config);
        assert!(matches!(
            ClientConfig::load(dir.path().join("missing.toml")),
            Err(ConfigError::Io(_))
        ));
    }
}
