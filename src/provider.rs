//! Blob file provider
//!
//! Resolves request paths to files in a remote container, keeping a local
//! disk copy of everything it serves. A lookup is answered from the local
//! copy only while its trust window is open; otherwise the remote store is
//! asked, the local copy is refreshed if it differs, and the window is
//! re-armed. Directory listings always go to the remote store.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use tracing::{debug, info, warn};

use crate::b2::B2Client;
use crate::cache::{paths, Clock, FreshnessTracker, LocalCache, LocalEntry, SystemClock};
use crate::config::{LookupMode, ProviderConfig};
use crate::error::{ConfigError, ProviderError, RemoteError, Result};
use crate::remote::{RemoteObject, RemoteStore};

/// Byte stream returned by [`FileInfo::open_read`]
pub type ReadStream = BoxStream<'static, Result<Bytes>>;

/// Per-lookup overrides
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LookupOptions {
    /// Skip the trust check and do not re-arm the trust window
    pub ignore_cache: bool,
}

impl LookupOptions {
    /// Read the bypass flag named `key` from a raw query string
    ///
    /// The key is matched case-insensitively and the value must be `true` or
    /// `false` (any case); anything else leaves the cache enabled.
    pub fn from_query(key: &str, query: &str) -> Self {
        let query = query.strip_prefix('?').unwrap_or(query);
        let value = query
            .split('&')
            .filter(|pair| !pair.is_empty())
            .map(|pair| pair.split_once('=').unwrap_or((pair, "")))
            .find(|(name, _)| decode_component(name).eq_ignore_ascii_case(key))
            .map(|(_, value)| decode_component(value));

        Self {
            ignore_cache: value.is_some_and(|v| v.trim().eq_ignore_ascii_case("true")),
        }
    }
}

fn decode_component(raw: &str) -> String {
    let raw = raw.replace('+', " ");
    match urlencoding::decode(&raw) {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => raw,
    }
}

enum Source {
    /// Served from the local cache
    Local(PathBuf),
    /// Served from the remote object that was just validated
    Remote {
        store: Arc<dyn RemoteStore>,
        object: RemoteObject,
    },
    Missing,
}

/// Result of a single-file lookup
pub struct FileInfo {
    name: String,
    size: u64,
    last_modified: Option<SystemTime>,
    source: Source,
}

impl FileInfo {
    fn local(name: &str, entry: LocalEntry) -> Self {
        Self {
            name: name.to_string(),
            size: entry.size,
            last_modified: Some(entry.last_modified),
            source: Source::Local(entry.path),
        }
    }

    fn remote(store: Arc<dyn RemoteStore>, object: RemoteObject) -> Self {
        Self {
            name: object.name.clone(),
            size: object.size,
            last_modified: Some(object.last_modified),
            source: Source::Remote { store, object },
        }
    }

    fn not_found(requested: &str) -> Self {
        Self {
            name: requested.to_string(),
            size: 0,
            last_modified: None,
            source: Source::Missing,
        }
    }

    pub fn exists(&self) -> bool {
        !matches!(self.source, Source::Missing)
    }

    /// Always false; directories are only reachable through listings
    pub fn is_directory(&self) -> bool {
        false
    }

    /// Object name, or the requested path when nothing was found
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Content length in bytes (0 when not found)
    pub fn len(&self) -> u64 {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn last_modified(&self) -> Option<SystemTime> {
        self.last_modified
    }

    /// Local file backing this result, when it was served from the cache
    pub fn physical_path(&self) -> Option<&Path> {
        match &self.source {
            Source::Local(path) => Some(path),
            _ => None,
        }
    }

    /// Open the content for reading
    pub async fn open_read(&self) -> Result<ReadStream> {
        match &self.source {
            Source::Local(path) => {
                let stream = LocalCache::open_read(path)
                    .await
                    .map_err(|source| ProviderError::Io {
                        path: path.clone(),
                        source,
                    })?;
                let path = path.clone();
                Ok(stream
                    .map_err(move |source| ProviderError::Io {
                        path: path.clone(),
                        source,
                    })
                    .boxed())
            }
            Source::Remote { store, object } => {
                let stream = store.open_content(object).await?;
                Ok(stream.map_err(ProviderError::from).boxed())
            }
            Source::Missing => Err(ProviderError::NotFound(self.name.clone())),
        }
    }
}

impl fmt::Debug for FileInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let source = match &self.source {
            Source::Local(path) => format!("local:{}", path.display()),
            Source::Remote { .. } => "remote".to_string(),
            Source::Missing => "missing".to_string(),
        };
        f.debug_struct("FileInfo")
            .field("name", &self.name)
            .field("size", &self.size)
            .field("last_modified", &self.last_modified)
            .field("source", &source)
            .finish()
    }
}

/// Objects sharing a path prefix
#[derive(Debug)]
pub struct DirectoryContents {
    entries: Vec<FileInfo>,
}

impl DirectoryContents {
    /// True iff at least one object matched
    pub fn exists(&self) -> bool {
        !self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, FileInfo> {
        self.entries.iter()
    }
}

impl IntoIterator for DirectoryContents {
    type Item = FileInfo;
    type IntoIter = std::vec::IntoIter<FileInfo>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl<'a> IntoIterator for &'a DirectoryContents {
    type Item = &'a FileInfo;
    type IntoIter = std::slice::Iter<'a, FileInfo>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

/// Snapshot of lookup counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProviderStats {
    /// Lookups answered from the local cache
    pub hits: u64,
    /// Lookups that had to ask the remote store
    pub misses: u64,
    /// Local copies rewritten
    pub cache_writes: u64,
    /// Local copy rewrites that failed and were ignored
    pub cache_write_failures: u64,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    cache_writes: AtomicU64,
    cache_write_failures: AtomicU64,
}

/// Read-through file provider over a remote container
pub struct BlobFileProvider {
    remote: Arc<dyn RemoteStore>,
    cache: LocalCache,
    freshness: FreshnessTracker,
    lookup_mode: LookupMode,
    ignore_cache_query_key: String,
    counters: Counters,
}

impl BlobFileProvider {
    /// Validate `config`, connect to B2 and build a provider
    pub async fn connect(config: &ProviderConfig) -> Result<Self> {
        let credential = config.validate()?;
        let client = B2Client::connect(&credential, &config.container_name).await?;
        Ok(Self::new(config, Arc::new(client))?)
    }

    /// Build a provider over an already connected remote store
    pub fn new(config: &ProviderConfig, remote: Arc<dyn RemoteStore>) -> Result<Self, ConfigError> {
        Self::with_clock(config, remote, Arc::new(SystemClock))
    }

    /// Build a provider whose trust windows follow `clock`
    pub fn with_clock(
        config: &ProviderConfig,
        remote: Arc<dyn RemoteStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let cache = LocalCache::open(config.cache_root(remote.account_name()))?;
        let freshness = FreshnessTracker::with_clock(config.cache_timeout(), clock);

        info!(
            container = remote.container_name(),
            cache_root = %cache.root().display(),
            ttl_secs = config.local_cache_timeout,
            lookup_mode = ?config.lookup_mode,
            "Blob file provider ready"
        );

        Ok(Self {
            remote,
            cache,
            freshness,
            lookup_mode: config.lookup_mode,
            ignore_cache_query_key: config.ignore_cache_query_key.clone(),
            counters: Counters::default(),
        })
    }

    /// Canonical local cache root
    pub fn cache_root(&self) -> &Path {
        self.cache.root()
    }

    /// Lookup options for a request, read from its raw query string
    pub fn lookup_options(&self, query: &str) -> LookupOptions {
        LookupOptions::from_query(&self.ignore_cache_query_key, query)
    }

    /// Resolve `subpath` to a file
    pub async fn get_file_info(&self, subpath: &str) -> Result<FileInfo> {
        self.get_file_info_with(subpath, LookupOptions::default()).await
    }

    /// Resolve `subpath` to a file, honoring per-request overrides
    pub async fn get_file_info_with(&self, subpath: &str, options: LookupOptions) -> Result<FileInfo> {
        let relative = paths::trim_leading_separators(subpath);
        if relative.is_empty() {
            return Ok(FileInfo::not_found(subpath));
        }

        let escaped = paths::escape(relative);
        let full_path = self.cache.resolve(&escaped);
        let cache_key = full_path.as_deref().map(paths::cache_key);
        let local = match &full_path {
            Some(path) => self.cache.stat(path).await,
            None => None,
        };

        if !options.ignore_cache {
            if let (Some(entry), Some(key)) = (&local, &cache_key) {
                if let Some(name) = self.freshness.trusted_object(key) {
                    self.counters.hits.fetch_add(1, Ordering::Relaxed);
                    debug!(path = relative, object = %name, "Local cache HIT");
                    return Ok(FileInfo::local(&name, entry.clone()));
                }
            }
        }

        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        debug!(
            path = relative,
            cached = local.is_some(),
            ignore_cache = options.ignore_cache,
            "Local cache MISS, asking remote store"
        );

        let object = match self.remote.first_match(relative, self.lookup_mode).await? {
            Some(object) => object,
            None => {
                debug!(path = relative, "Not found in remote store");
                return Ok(FileInfo::not_found(subpath));
            }
        };

        match &full_path {
            Some(path) => {
                let unchanged = local.as_ref().is_some_and(|entry| {
                    entry.size == object.size && entry.last_modified == object.last_modified
                });
                if !unchanged {
                    self.refresh_local(path, &object).await?;
                }
            }
            None => {
                warn!(path = subpath, "Path escapes the cache root, serving remote data only");
            }
        }

        if !options.ignore_cache {
            if let Some(key) = &cache_key {
                self.freshness.mark_fresh(key, &object.name);
            }
        }

        Ok(FileInfo::remote(self.remote.clone(), object))
    }

    /// Copy `object` into the local cache at `path`
    ///
    /// Opening the remote stream can fail like any remote call and is
    /// propagated. Failures while writing the copy are logged and ignored;
    /// the caller still gets the remote data.
    async fn refresh_local(&self, path: &Path, object: &RemoteObject) -> Result<(), RemoteError> {
        let content = self.remote.open_content(object).await?;

        match self.cache.write(path, content, object.last_modified).await {
            Ok(size) => {
                self.counters.cache_writes.fetch_add(1, Ordering::Relaxed);
                debug!(path = %object.name, size = size, "Refreshed local copy");
            }
            Err(e) => {
                self.counters.cache_write_failures.fetch_add(1, Ordering::Relaxed);
                warn!(path = %object.name, error = %e, "Failed to refresh local copy");
            }
        }
        Ok(())
    }

    /// List the objects whose name starts with `subpath`
    pub async fn get_directory_contents(&self, subpath: &str) -> Result<DirectoryContents> {
        let prefix = paths::trim_leading_separators(subpath);
        let entries: Vec<FileInfo> = self
            .remote
            .list_by_prefix(prefix)
            .map_ok(|object| FileInfo::remote(self.remote.clone(), object))
            .try_collect()
            .await?;

        debug!(prefix = prefix, count = entries.len(), "Listed directory");
        Ok(DirectoryContents { entries })
    }

    /// Change notifications are not available; callers must poll
    pub fn watch(&self, _filter: &str) -> Result<()> {
        Err(ProviderError::WatchUnsupported)
    }

    /// Get lookup counters
    pub fn stats(&self) -> ProviderStats {
        ProviderStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            cache_writes: self.counters.cache_writes.load(Ordering::Relaxed),
            cache_write_failures: self.counters.cache_write_failures.load(Ordering::Relaxed),
        }
    }

    /// Log current lookup metrics
    pub fn log_metrics(&self) {
        let stats = self.stats();
        let total = stats.hits + stats.misses;
        let hit_rate = if total > 0 {
            (stats.hits as f64 / total as f64) * 100.0
        } else {
            0.0
        };

        info!(
            hits = stats.hits,
            misses = stats.misses,
            hit_rate = format!("{:.1}%", hit_rate),
            cache_writes = stats.cache_writes,
            cache_write_failures = stats.cache_write_failures,
            tracked_windows = self.freshness.entry_count(),
            "Provider metrics"
        );
    }
}
