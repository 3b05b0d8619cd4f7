//! Error taxonomy for the provider
//!
//! Configuration errors are fatal at construction. Cache write errors are
//! reported by the cache store and discarded by the provider. Remote errors
//! are propagated unchanged.

use std::path::PathBuf;

pub use crate::remote::RemoteError;

/// Invalid or incomplete provider configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("containerName cannot be empty")]
    MissingContainerName,

    #[error("ignoreCacheQueryKey cannot be empty")]
    MissingIgnoreCacheQueryKey,

    #[error("must set either connectionString or serviceUri + token")]
    MissingCredential,

    #[error("connectionString and serviceUri + token are mutually exclusive")]
    AmbiguousCredential,

    #[error("containerId is required when authenticating with serviceUri + token")]
    MissingContainerId,

    #[error("invalid connection string: {0}")]
    InvalidConnectionString(String),

    #[error("failed to read config file {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid value for {name}: {value}")]
    InvalidValue { name: &'static str, value: String },

    #[error("failed to prepare local cache root {path:?}: {source}")]
    CacheRoot {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Failure while copying remote content into the local cache
#[derive(Debug, thiserror::Error)]
pub enum CacheWriteError {
    #[error("cache I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("remote stream failed while caching {path:?}: {source}")]
    Stream {
        path: PathBuf,
        #[source]
        source: RemoteError,
    },

    #[error("failed to replace {path:?}: {source}")]
    Persist {
        path: PathBuf,
        #[source]
        source: tempfile::PathPersistError,
    },
}

/// Errors surfaced by provider lookups
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("file not found: {0}")]
    NotFound(String),

    #[error("change notifications are not supported")]
    WatchUnsupported,

    #[error("failed to open cached file {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T, E = ProviderError> = std::result::Result<T, E>;
