use std::path::PathBuf;
use thiserror::Error;

use crate::infrastructure::filesystem::config_store::ConfigStoreError;
use crate::infrastructure::filesystem::lock::LockError;
use crate::infrastructure::http::rest_client::RestError;
use crate::infrastructure::scm::ScmError;

#[derive(Error, Debug)]
pub enum MirrorError {
    #[error("Configuration error: {message}")]
    ConfigError {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("File system operation failed: {message}")]
    FileSystemError {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Repository operation failed: {message}")]
    RepositoryError {
        message: String,
        repository: Option<String>,
        #[source]
        source: Option<ScmError>,
    },

    #[error("Indexing service request failed: {message}")]
    ProtocolError {
        message: String,
        url: Option<String>,
        #[source]
        source: Option<RestError>,
    },

    #[error("Already running: lock {key} is held by another instance")]
    LockContention { key: String },

    #[error("Validation error: {field} - {message}")]
    ValidationError {
        field: String,
        message: String,
        value: Option<String>,
    },

    #[error("Serialization error: {message}")]
    SerializationError {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Internal error: {message}")]
    InternalError {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl MirrorError {
    pub fn config_error(message: impl Into<String>) -> Self {
        Self::ConfigError {
            message: message.into(),
            source: None,
        }
    }

    pub fn config_error_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::ConfigError {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn filesystem_error(message: impl Into<String>, path: Option<PathBuf>) -> Self {
        Self::FileSystemError {
            message: message.into(),
            path,
            source: None,
        }
    }

    pub fn filesystem_error_with_source(
        message: impl Into<String>,
        path: Option<PathBuf>,
        source: std::io::Error,
    ) -> Self {
        Self::FileSystemError {
            message: message.into(),
            path,
            source: Some(source),
        }
    }

    pub fn repository_error(message: impl Into<String>, repository: Option<String>) -> Self {
        Self::RepositoryError {
            message: message.into(),
            repository,
            source: None,
        }
    }

    pub fn repository_error_with_source(
        message: impl Into<String>,
        repository: Option<String>,
        source: ScmError,
    ) -> Self {
        Self::RepositoryError {
            message: message.into(),
            repository,
            source: Some(source),
        }
    }

    pub fn protocol_error(message: impl Into<String>, url: Option<String>) -> Self {
        Self::ProtocolError {
            message: message.into(),
            url,
            source: None,
        }
    }

    pub fn protocol_error_with_source(
        message: impl Into<String>,
        url: Option<String>,
        source: RestError,
    ) -> Self {
        Self::ProtocolError {
            message: message.into(),
            url,
            source: Some(source),
        }
    }

    pub fn lock_contention(key: impl Into<String>) -> Self {
        Self::LockContention { key: key.into() }
    }

    pub fn validation_error(
        field: impl Into<String>,
        message: impl Into<String>,
        value: Option<String>,
    ) -> Self {
        Self::ValidationError {
            field: field.into(),
            message: message.into(),
            value,
        }
    }

    pub fn serialization_error_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::SerializationError {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn internal_error_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::InternalError {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }
}

impl From<std::io::Error> for MirrorError {
    fn from(error: std::io::Error) -> Self {
        Self::filesystem_error_with_source("File system operation failed", None, error)
    }
}

impl From<serde_yaml::Error> for MirrorError {
    fn from(error: serde_yaml::Error) -> Self {
        Self::serialization_error_with_source("YAML serialization failed", error)
    }
}

impl From<serde_json::Error> for MirrorError {
    fn from(error: serde_json::Error) -> Self {
        Self::serialization_error_with_source("JSON serialization failed", error)
    }
}

impl From<ScmError> for MirrorError {
    fn from(error: ScmError) -> Self {
        Self::repository_error_with_source("Repository operation failed", None, error)
    }
}

impl From<RestError> for MirrorError {
    fn from(error: RestError) -> Self {
        let url = error.url().map(str::to_string);
        Self::protocol_error_with_source("Indexing service request failed", url, error)
    }
}

impl From<ConfigStoreError> for MirrorError {
    fn from(error: ConfigStoreError) -> Self {
        Self::config_error_with_source("Cannot load configuration", error)
    }
}

impl From<LockError> for MirrorError {
    fn from(error: LockError) -> Self {
        match error {
            LockError::AlreadyHeld { key } => Self::lock_contention(key),
            other => Self::internal_error_with_source("Cannot acquire lock", other),
        }
    }
}

impl From<validator::ValidationErrors> for MirrorError {
    fn from(errors: validator::ValidationErrors) -> Self {
        Self::config_error_with_source("Configuration validation failed", errors)
    }
}
