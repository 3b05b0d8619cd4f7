//! In-process remote store
//!
//! Holds objects in memory and counts every call made against it. Used by
//! tests and for running the provider without network access.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::SystemTime;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, StreamExt};

use super::{ContentStream, ObjectStream, RemoteError, RemoteObject, RemoteStore};

/// Size of the chunks content streams are split into
const CHUNK_SIZE: usize = 16 * 1024;

#[derive(Clone)]
struct StoredObject {
    data: Bytes,
    last_modified: SystemTime,
}

/// Remote store backed by a sorted in-memory map
pub struct MemoryStore {
    account: String,
    container: String,
    objects: RwLock<BTreeMap<String, StoredObject>>,
    /// Number of listings started
    list_calls: AtomicUsize,
    /// Number of content streams opened
    open_calls: AtomicUsize,
    /// HTTP status every call fails with, if set
    failure: Mutex<Option<u16>>,
    /// Objects whose content stream breaks after the first chunk
    broken: Mutex<HashSet<String>>,
}

impl MemoryStore {
    pub fn new(account: &str, container: &str) -> Self {
        Self {
            account: account.to_string(),
            container: container.to_string(),
            objects: RwLock::new(BTreeMap::new()),
            list_calls: AtomicUsize::new(0),
            open_calls: AtomicUsize::new(0),
            failure: Mutex::new(None),
            broken: Mutex::new(HashSet::new()),
        }
    }

    /// Create or replace an object
    pub fn put(&self, name: &str, data: impl Into<Bytes>, last_modified: SystemTime) {
        let object = StoredObject {
            data: data.into(),
            last_modified,
        };
        self.objects
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_string(), object);
    }

    /// Delete an object
    pub fn remove(&self, name: &str) {
        self.objects
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(name);
    }

    /// Make every subsequent call fail as if the store answered `status`
    pub fn fail_with(&self, status: Option<u16>) {
        *self.failure.lock().unwrap_or_else(|e| e.into_inner()) = status;
    }

    /// Make the content stream of `name` error out after its first chunk
    pub fn break_content(&self, name: &str) {
        self.broken
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_string());
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn open_calls(&self) -> usize {
        self.open_calls.load(Ordering::SeqCst)
    }

    /// Total calls of any kind
    pub fn calls(&self) -> usize {
        self.list_calls() + self.open_calls()
    }

    fn check_failure(&self) -> Result<(), RemoteError> {
        match *self.failure.lock().unwrap_or_else(|e| e.into_inner()) {
            Some(status) => Err(RemoteError::from_status(status, "injected failure")),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    fn account_name(&self) -> &str {
        &self.account
    }

    fn container_name(&self) -> &str {
        &self.container
    }

    fn lists_in_name_order(&self) -> bool {
        true
    }

    fn list_by_prefix(&self, prefix: &str) -> ObjectStream<'_> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if let Err(e) = self.check_failure() {
            return stream::once(async move { Err::<RemoteObject, _>(e) }).boxed();
        }

        let matches: Vec<Result<RemoteObject, RemoteError>> = self
            .objects
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .range(prefix.to_string()..)
            .take_while(|(name, _)| name.starts_with(prefix))
            .map(|(name, object)| {
                Ok(RemoteObject {
                    name: name.clone(),
                    size: object.data.len() as u64,
                    last_modified: object.last_modified,
                })
            })
            .collect();
        stream::iter(matches).boxed()
    }

    async fn open_content(&self, object: &RemoteObject) -> Result<ContentStream, RemoteError> {
        self.open_calls.fetch_add(1, Ordering::SeqCst);
        self.check_failure()?;

        let data = self
            .objects
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&object.name)
            .map(|o| o.data.clone())
            .ok_or_else(|| RemoteError::NotFound(object.name.clone()))?;
        let broken = self
            .broken
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&object.name);

        let mut chunks: Vec<Result<Bytes, RemoteError>> = Vec::new();
        let mut offset = 0;
        while offset < data.len() {
            let end = (offset + CHUNK_SIZE).min(data.len());
            chunks.push(Ok(data.slice(offset..end)));
            offset = end;
        }
        if broken {
            chunks.truncate(1);
            chunks.push(Err(RemoteError::Network("connection reset".to_string())));
        }
        Ok(stream::iter(chunks).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LookupMode;
    use futures::TryStreamExt;
    use std::time::{Duration, UNIX_EPOCH};

    fn store() -> MemoryStore {
        let store = MemoryStore::new("acct", "files");
        let t0 = UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        store.put("docs/a.txt", "alpha", t0);
        store.put("docs/b.txt", "bravo", t0);
        store.put("report-2024.csv", "1,2,3", t0);
        store.put("zeta", "z", t0);
        store
    }

    #[tokio::test]
    async fn test_list_by_prefix() {
        let store = store();
        let names: Vec<String> = store
            .list_by_prefix("docs/")
            .map_ok(|o| o.name)
            .try_collect()
            .await
            .unwrap();
        assert_eq!(names, vec!["docs/a.txt", "docs/b.txt"]);
        assert_eq!(store.list_calls(), 1);

        let all: Vec<RemoteObject> = store.list_by_prefix("").try_collect().await.unwrap();
        assert_eq!(all.len(), 4);
    }

    #[tokio::test]
    async fn test_first_match_modes() {
        let store = store();
        let prefix = store.first_match("report", LookupMode::Prefix).await.unwrap();
        assert_eq!(prefix.unwrap().name, "report-2024.csv");

        let exact = store.first_match("report", LookupMode::Exact).await.unwrap();
        assert!(exact.is_none());

        let exact = store.first_match("zeta", LookupMode::Exact).await.unwrap();
        assert_eq!(exact.unwrap().size, 1);
    }

    #[tokio::test]
    async fn test_open_content_chunks() {
        let store = MemoryStore::new("acct", "files");
        let data = vec![7u8; CHUNK_SIZE * 2 + 10];
        store.put("big.bin", data.clone(), UNIX_EPOCH);
        let object = store.first_match("big.bin", LookupMode::Exact).await.unwrap().unwrap();

        let chunks: Vec<Bytes> = store.open_content(&object).await.unwrap().try_collect().await.unwrap();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks.concat(), data);
        assert_eq!(store.open_calls(), 1);
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let store = store();
        store.fail_with(Some(503));
        let err = store.first_match("zeta", LookupMode::Exact).await.unwrap_err();
        assert!(matches!(err, RemoteError::Server(503, _)));
    }
}
