//! Remote object store seam
//!
//! The provider only needs three things from the remote side: a lazy prefix
//! listing, the authoritative metadata of each object, and a byte stream for
//! an object's content.

pub mod errors;
pub mod memory;

use std::time::SystemTime;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::TryStreamExt;

use crate::config::LookupMode;

pub use errors::RemoteError;
pub use memory::MemoryStore;

/// Byte stream of an object's content; the holder owns it until dropped
pub type ContentStream = BoxStream<'static, Result<Bytes, RemoteError>>;

/// Lazy, finite listing of remote objects
pub type ObjectStream<'a> = BoxStream<'a, Result<RemoteObject, RemoteError>>;

/// Authoritative metadata of one remote object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteObject {
    /// Full object name within the container
    pub name: String,
    /// Content length in bytes
    pub size: u64,
    pub last_modified: SystemTime,
}

/// A remote blob store, already authenticated and safe to share across tasks
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Account the store belongs to, used to namespace the default cache root
    fn account_name(&self) -> &str;

    /// Name of the container being served
    fn container_name(&self) -> &str;

    /// Objects whose name starts with `prefix`, in whatever order the store
    /// returns them. Pages are fetched as the stream is polled.
    fn list_by_prefix(&self, prefix: &str) -> ObjectStream<'_>;

    /// Open a stream positioned at the start of the object's content
    async fn open_content(&self, object: &RemoteObject) -> Result<ContentStream, RemoteError>;

    /// Whether listings come back sorted by object name
    fn lists_in_name_order(&self) -> bool {
        false
    }

    /// The object a single-file lookup for `path` resolves to
    ///
    /// In `Prefix` mode this is the first listing result, which may be named
    /// differently from `path`. In `Exact` mode the listing is scanned until
    /// an object named exactly `path` appears, or, for stores that list in
    /// name order, until a name sorts after `path`.
    async fn first_match(
        &self,
        path: &str,
        mode: LookupMode,
    ) -> Result<Option<RemoteObject>, RemoteError> {
        let sorted = self.lists_in_name_order();
        let mut objects = self.list_by_prefix(path);
        while let Some(object) = objects.try_next().await? {
            if mode == LookupMode::Prefix || object.name == path {
                return Ok(Some(object));
            }
            if sorted && object.name.as_str() > path {
                break;
            }
        }
        Ok(None)
    }
}
