use serde::de::DeserializeOwned;
use std::fs;
use std::path::Path;
use thiserror::Error;

/// Configuration store related errors
#[derive(Debug, Error)]
pub enum ConfigStoreError {
    #[error("Configuration file not found at path: {0}")]
    ConfigFileNotFound(String),

    #[error("Configuration file read failed: {path}: {source}")]
    ReadFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("YAML parsing failed for {path}: {source}")]
    YamlParsingFailed {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("JSON parsing failed for {path}: {source}")]
    JsonParsingFailed {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Reads YAML or JSON configuration files
#[derive(Debug, Default, Clone, Copy)]
pub struct ConfigStore;

impl ConfigStore {
    pub fn new() -> Self {
        Self
    }

    /// Read and parse a configuration file. Files ending in `.json` are
    /// parsed as JSON, everything else as YAML. An empty file yields an
    /// empty mapping.
    pub fn read_config<T, P>(&self, config_path: P) -> Result<T, ConfigStoreError>
    where
        T: DeserializeOwned,
        P: AsRef<Path>,
    {
        let config_path = config_path.as_ref();
        let display = config_path.display().to_string();

        if !config_path.exists() {
            return Err(ConfigStoreError::ConfigFileNotFound(display));
        }

        let content = fs::read_to_string(config_path).map_err(|source| ConfigStoreError::ReadFailed {
            path: display.clone(),
            source,
        })?;
        tracing::debug!(path = %config_path.display(), "Read configuration");

        let is_json = config_path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        if is_json {
            serde_json::from_str(&content).map_err(|source| ConfigStoreError::JsonParsingFailed {
                path: display,
                source,
            })
        } else {
            let content = if content.trim().is_empty() { "{}" } else { content.as_str() };
            serde_yaml::from_str(content).map_err(|source| ConfigStoreError::YamlParsingFailed {
                path: display,
                source,
            })
        }
    }
}
