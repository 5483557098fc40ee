//! Content-addressed disk cache with age- and size-capped cleanup.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use bytes::Bytes;
use tokio::fs;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, trace, warn};

use crate::domain::entities::CacheKey;
use crate::domain::errors::ImageError;
use crate::domain::ports::DiskCachePort;
use crate::infrastructure::config::{CacheConfig, ConfigHandle};

/// Default namespace under the cache root.
pub const DEFAULT_NAMESPACE: &str = "default";

/// File-backed image store at `{root}/{namespace}/{key}`.
///
/// Every operation flows through one serial worker task, so write ordering
/// per key is preserved and directory scans never interleave with
/// mutations. Read failures are treated as misses; the caller's recovery
/// path is the network.
pub struct DiskImageCache {
    cmd_tx: mpsc::UnboundedSender<DiskCommand>,
    dir: PathBuf,
}

enum DiskCommand {
    Read {
        key: CacheKey,
        reply: oneshot::Sender<Option<Bytes>>,
    },
    Write {
        key: CacheKey,
        data: Bytes,
        reply: oneshot::Sender<Result<(), ImageError>>,
    },
    Remove {
        key: CacheKey,
        reply: oneshot::Sender<()>,
    },
    Clear {
        reply: oneshot::Sender<()>,
    },
    Cleanup {
        now: SystemTime,
        reply: oneshot::Sender<()>,
    },
    Contains {
        key: CacheKey,
        reply: oneshot::Sender<bool>,
    },
    Stats {
        reply: oneshot::Sender<(u64, usize)>,
    },
}

impl DiskImageCache {
    /// Creates a disk cache rooted at `{root}/{namespace}`.
    ///
    /// The namespace directory is created lazily and a bootstrap cleanup
    /// pass runs before the first command is served.
    ///
    /// # Panics
    /// Panics when called outside a Tokio runtime: the serial I/O worker
    /// is spawned here.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>, namespace: &str, config: &ConfigHandle) -> Self {
        let dir = root.into().join(namespace);
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let worker = DiskWorker {
            dir: dir.clone(),
            config: config.subscribe(),
        };
        tokio::spawn(worker.run(cmd_rx));
        Self { cmd_tx, dir }
    }

    /// Creates a disk cache in the platform cache directory.
    ///
    /// # Panics
    /// Panics when called outside a Tokio runtime.
    #[must_use]
    pub fn with_default_location(config: &ConfigHandle) -> Self {
        Self::new(default_cache_root(), DEFAULT_NAMESPACE, config)
    }

    /// The namespace directory backing this cache.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub(crate) async fn cleanup_at(&self, now: SystemTime) {
        let (reply, rx) = oneshot::channel();
        if self.cmd_tx.send(DiskCommand::Cleanup { now, reply }).is_ok() {
            let _ = rx.await;
        }
    }
}

/// Resolves the platform cache root, falling back to the temp directory.
fn default_cache_root() -> PathBuf {
    directories::ProjectDirs::from("dev", "webimage", "webimage").map_or_else(
        || std::env::temp_dir().join("webimage").join("cache"),
        |dirs| dirs.cache_dir().join("images"),
    )
}

#[async_trait::async_trait]
impl DiskCachePort for DiskImageCache {
    async fn get(&self, key: &CacheKey) -> Option<Bytes> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(DiskCommand::Read {
                key: key.clone(),
                reply,
            })
            .ok()?;
        rx.await.ok().flatten()
    }

    async fn put(&self, key: &CacheKey, data: Bytes) -> Result<(), ImageError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(DiskCommand::Write {
                key: key.clone(),
                data,
                reply,
            })
            .map_err(|_| ImageError::io("disk cache worker unavailable"))?;
        rx.await
            .map_err(|_| ImageError::io("disk cache worker unavailable"))?
    }

    async fn remove(&self, key: &CacheKey) {
        let (reply, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(DiskCommand::Remove {
                key: key.clone(),
                reply,
            })
            .is_ok()
        {
            let _ = rx.await;
        }
    }

    async fn clear(&self) {
        let (reply, rx) = oneshot::channel();
        if self.cmd_tx.send(DiskCommand::Clear { reply }).is_ok() {
            let _ = rx.await;
        }
    }

    async fn cleanup(&self) {
        self.cleanup_at(SystemTime::now()).await;
    }

    async fn contains(&self, key: &CacheKey) -> bool {
        let (reply, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(DiskCommand::Contains {
                key: key.clone(),
                reply,
            })
            .is_err()
        {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    async fn total_size(&self) -> u64 {
        let (reply, rx) = oneshot::channel();
        if self.cmd_tx.send(DiskCommand::Stats { reply }).is_err() {
            return 0;
        }
        rx.await.map_or(0, |(size, _)| size)
    }

    async fn entry_count(&self) -> usize {
        let (reply, rx) = oneshot::channel();
        if self.cmd_tx.send(DiskCommand::Stats { reply }).is_err() {
            return 0;
        }
        rx.await.map_or(0, |(_, count)| count)
    }
}

struct DiskWorker {
    dir: PathBuf,
    config: watch::Receiver<CacheConfig>,
}

impl DiskWorker {
    async fn run(self, mut cmd_rx: mpsc::UnboundedReceiver<DiskCommand>) {
        if let Err(err) = fs::create_dir_all(&self.dir).await {
            warn!(dir = %self.dir.display(), error = %err, "failed to create cache dir");
        }
        self.cleanup(SystemTime::now()).await;

        while let Some(command) = cmd_rx.recv().await {
            match command {
                DiskCommand::Read { key, reply } => {
                    let _ = reply.send(self.read(&key).await);
                }
                DiskCommand::Write { key, data, reply } => {
                    let _ = reply.send(self.write(&key, &data).await);
                }
                DiskCommand::Remove { key, reply } => {
                    self.remove(&key).await;
                    let _ = reply.send(());
                }
                DiskCommand::Clear { reply } => {
                    self.clear().await;
                    let _ = reply.send(());
                }
                DiskCommand::Cleanup { now, reply } => {
                    self.cleanup(now).await;
                    let _ = reply.send(());
                }
                DiskCommand::Contains { key, reply } => {
                    let exists = fs::try_exists(self.path(&key)).await.unwrap_or(false);
                    let _ = reply.send(exists);
                }
                DiskCommand::Stats { reply } => {
                    let entries = self.scan().await;
                    let size = entries.iter().map(|e| e.size).sum();
                    let _ = reply.send((size, entries.len()));
                }
            }
        }
    }

    fn path(&self, key: &CacheKey) -> PathBuf {
        self.dir.join(key.as_str())
    }

    /// Sibling temp path for atomic writes; hidden from directory scans.
    fn temp_path(&self, key: &CacheKey) -> PathBuf {
        self.dir.join(format!(".{}.tmp", key.as_str()))
    }

    async fn read(&self, key: &CacheKey) -> Option<Bytes> {
        let path = self.path(key);
        match fs::read(&path).await {
            Ok(bytes) => {
                trace!(key = %key, "disk cache hit");
                Some(Bytes::from(bytes))
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                trace!(key = %key, "disk cache miss");
                None
            }
            Err(err) => {
                warn!(key = %key, error = %err, "disk cache read failed, treating as miss");
                None
            }
        }
    }

    async fn write(&self, key: &CacheKey, data: &Bytes) -> Result<(), ImageError> {
        fs::create_dir_all(&self.dir).await?;
        let path = self.path(key);
        let (atomic, disable_backup) = {
            let config = self.config.borrow();
            (config.atomic_writes, config.disable_backup)
        };
        if atomic {
            let temp = self.temp_path(key);
            fs::write(&temp, data).await?;
            if let Err(err) = fs::rename(&temp, &path).await {
                let _ = fs::remove_file(&temp).await;
                return Err(err.into());
            }
        } else {
            fs::write(&path, data).await?;
        }
        if disable_backup {
            mark_non_backup(&path);
        }
        debug!(key = %key, size = data.len(), "stored disk cache entry");
        Ok(())
    }

    async fn remove(&self, key: &CacheKey) {
        let path = self.path(key);
        match fs::remove_file(&path).await {
            Ok(()) => debug!(key = %key, "removed disk cache entry"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!(key = %key, error = %err, "failed to remove disk cache entry"),
        }
    }

    async fn clear(&self) {
        match fs::remove_dir_all(&self.dir).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!(dir = %self.dir.display(), error = %err, "failed to clear cache dir"),
        }
        if let Err(err) = fs::create_dir_all(&self.dir).await {
            warn!(dir = %self.dir.display(), error = %err, "failed to recreate cache dir");
        }
        debug!("cleared disk image cache");
    }

    /// Deletes entries older than `max_age`, then oldest-first until the
    /// namespace fits under `max_size`.
    async fn cleanup(&self, now: SystemTime) {
        let (max_age, max_size) = {
            let config = self.config.borrow();
            (config.max_age(), config.max_size_bytes)
        };

        let mut entries = self.scan().await;
        if entries.is_empty() {
            return;
        }

        let mut removed = 0usize;
        if let Some(cutoff) = max_age.and_then(|age| now.checked_sub(age)) {
            let (expired, kept): (Vec<_>, Vec<_>) =
                entries.into_iter().partition(|e| e.modified < cutoff);
            for entry in expired {
                if fs::remove_file(&entry.path).await.is_ok() {
                    removed += 1;
                }
            }
            entries = kept;
        }

        if max_size > 0 {
            let mut total: u64 = entries.iter().map(|e| e.size).sum();
            if total > max_size {
                entries.sort_by_key(|e| e.modified);
                for entry in &entries {
                    if total <= max_size {
                        break;
                    }
                    if fs::remove_file(&entry.path).await.is_ok() {
                        total = total.saturating_sub(entry.size);
                        removed += 1;
                    }
                }
            }
        }

        if removed > 0 {
            debug!(removed, "disk cache cleanup complete");
        }
    }

    async fn scan(&self) -> Vec<ScannedEntry> {
        let mut found = Vec::new();
        let Ok(mut entries) = fs::read_dir(&self.dir).await else {
            return found;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name();
            if name.to_string_lossy().starts_with('.') {
                continue;
            }
            let Ok(meta) = entry.metadata().await else {
                continue;
            };
            if !meta.is_file() {
                continue;
            }
            found.push(ScannedEntry {
                path: entry.path(),
                modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
                size: meta.len(),
            });
        }
        found
    }
}

struct ScannedEntry {
    path: PathBuf,
    modified: SystemTime,
    size: u64,
}

/// Marks a freshly written cache file as excluded from backups.
///
/// Setting the actual platform attribute is the embedder's job; this seam
/// records that the file was flagged so embedders can hook the call.
fn mark_non_backup(path: &Path) {
    trace!(path = %path.display(), "cache entry flagged as non-backup");
}
