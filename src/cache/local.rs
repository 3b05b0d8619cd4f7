//! Local file cache
//!
//! Mirrors remote objects under a cache root directory. Entries are looked
//! up by stat and replaced by writing a temp file next to the target, then
//! renaming it over the target, so readers never observe a partial file.

use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use filetime::FileTime;
use futures::stream::{self, BoxStream, StreamExt};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::paths;
use crate::error::{CacheWriteError, ConfigError};
use crate::remote::ContentStream;

/// Prefix of in-flight temp files
const TEMP_PREFIX: &str = ".blobcache-";

/// Suffix of in-flight temp files
const TEMP_SUFFIX: &str = ".tmp";

/// Temp files older than this are leftovers from interrupted writes
const STALE_TEMP_AGE: Duration = Duration::from_secs(60 * 60);

/// Read buffer size for streaming a cached file
const READ_CHUNK_SIZE: usize = 64 * 1024;

/// Stat of a cached file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalEntry {
    /// Full path of the cached file
    pub path: PathBuf,
    pub size: u64,
    pub last_modified: SystemTime,
}

/// Byte stream over a cached file
pub type LocalReadStream = BoxStream<'static, io::Result<Bytes>>;

/// Physical-directory cache for remote object content
pub struct LocalCache {
    /// Canonical cache root
    root: PathBuf,
}

impl LocalCache {
    /// Open (creating if needed) a cache rooted at `root`
    pub fn open(root: PathBuf) -> Result<Self, ConfigError> {
        std::fs::create_dir_all(&root).map_err(|source| ConfigError::CacheRoot {
            path: root.clone(),
            source,
        })?;
        let root = std::fs::canonicalize(&root).map_err(|source| ConfigError::CacheRoot {
            path: root.clone(),
            source,
        })?;

        let cache = Self { root };
        let swept = cache.sweep_stale_temp_files();

        info!(
            cache_root = %cache.root.display(),
            swept_temp_files = swept,
            "Local cache initialized"
        );

        Ok(cache)
    }

    /// Get the cache root
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Full path for an escaped, root-relative path, or `None` if it would
    /// leave the cache root
    pub fn resolve(&self, escaped_relative: &str) -> Option<PathBuf> {
        paths::resolve_under_root(&self.root, escaped_relative)
    }

    /// Stat a cached file by full path; directories count as absent
    pub async fn stat(&self, full_path: &Path) -> Option<LocalEntry> {
        let metadata = fs::metadata(full_path).await.ok()?;
        if !metadata.is_file() {
            return None;
        }
        let last_modified = metadata.modified().ok()?;
        Some(LocalEntry {
            path: full_path.to_path_buf(),
            size: metadata.len(),
            last_modified,
        })
    }

    /// Replace the cached file at `full_path` with `content`
    ///
    /// The content stream is consumed and dropped on every exit path. On
    /// failure the target is left untouched and the temp file is removed.
    pub async fn write(
        &self,
        full_path: &Path,
        mut content: ContentStream,
        last_modified: SystemTime,
    ) -> Result<u64, CacheWriteError> {
        let parent = full_path
            .parent()
            .ok_or_else(|| CacheWriteError::Io {
                path: full_path.to_path_buf(),
                source: io::Error::new(io::ErrorKind::InvalidInput, "cache path has no parent"),
            })?;
        fs::create_dir_all(parent).await.map_err(io_error(parent))?;

        // Same directory as the target, so the final rename stays on one volume
        let temp = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .suffix(TEMP_SUFFIX)
            .tempfile_in(parent)
            .map_err(io_error(parent))?;
        let (file, temp_path) = temp.into_parts();
        let mut file = fs::File::from_std(file);

        let mut written: u64 = 0;
        while let Some(chunk) = content.next().await {
            let chunk = chunk.map_err(|source| CacheWriteError::Stream {
                path: full_path.to_path_buf(),
                source,
            })?;
            file.write_all(&chunk).await.map_err(io_error(&temp_path))?;
            written += chunk.len() as u64;
        }
        drop(content);

        file.flush().await.map_err(io_error(&temp_path))?;
        file.sync_all().await.map_err(io_error(&temp_path))?;
        drop(file);

        filetime::set_file_mtime(&temp_path, FileTime::from_system_time(last_modified))
            .map_err(io_error(&temp_path))?;

        temp_path
            .persist(full_path)
            .map_err(|source| CacheWriteError::Persist {
                path: full_path.to_path_buf(),
                source,
            })?;

        debug!(
            local = %full_path.display(),
            size = written,
            "Stored file in cache"
        );

        Ok(written)
    }

    /// Open a cached file as a byte stream
    pub async fn open_read(full_path: &Path) -> io::Result<LocalReadStream> {
        let file = fs::File::open(full_path).await?;
        let chunks = stream::try_unfold(file, |mut file| async move {
            let mut buf = vec![0u8; READ_CHUNK_SIZE];
            let n = file.read(&mut buf).await?;
            if n == 0 {
                return Ok(None);
            }
            buf.truncate(n);
            Ok::<_, io::Error>(Some((Bytes::from(buf), file)))
        });
        Ok(chunks.boxed())
    }

    /// Remove temp files left behind by interrupted writes
    ///
    /// Only files older than an hour are removed; younger ones may belong to
    /// another process writing into the same root.
    pub fn sweep_stale_temp_files(&self) -> usize {
        let now = SystemTime::now();
        let mut removed = 0;

        for entry in WalkDir::new(&self.root).into_iter().flatten() {
            if !entry.file_type().is_file() || !is_temp_file_name(&entry.file_name().to_string_lossy()) {
                continue;
            }
            let age = entry
                .metadata()
                .ok()
                .and_then(|m| m.modified().ok())
                .and_then(|modified| now.duration_since(modified).ok());
            if !matches!(age, Some(age) if age >= STALE_TEMP_AGE) {
                continue;
            }
            match std::fs::remove_file(entry.path()) {
                Ok(()) => {
                    debug!(path = %entry.path().display(), "Removed stale temp file");
                    removed += 1;
                }
                Err(e) => {
                    warn!(path = %entry.path().display(), error = %e, "Failed to remove stale temp file");
                }
            }
        }

        removed
    }
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> CacheWriteError {
    let path = path.to_path_buf();
    move |source| CacheWriteError::Io { path, source }
}

fn is_temp_file_name(name: &str) -> bool {
    name.starts_with(TEMP_PREFIX) && name.ends_with(TEMP_SUFFIX)
}
