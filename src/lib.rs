//! blobcache - read-through local disk cache in front of a Backblaze B2 bucket
//!
//! [`BlobFileProvider`] answers file and directory lookups against a remote
//! container, serving recently validated files straight from local disk.

pub mod b2;
pub mod cache;
pub mod config;
pub mod error;
pub mod provider;
pub mod remote;

pub use config::{Credential, LookupMode, ProviderConfig};
pub use error::{CacheWriteError, ConfigError, ProviderError, RemoteError, Result};
pub use provider::{
    BlobFileProvider, DirectoryContents, FileInfo, LookupOptions, ProviderStats, ReadStream,
};
pub use remote::{MemoryStore, RemoteObject, RemoteStore};
