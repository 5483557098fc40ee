//! Cache configuration and live update publication.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Default maximum age for disk entries: one week, in seconds.
const DEFAULT_MAX_AGE_SECS: u64 = 7 * 24 * 60 * 60;

/// Default interval between periodic memory trim passes, in milliseconds.
const DEFAULT_AUTO_TRIM_INTERVAL_MS: u64 = 5_000;

/// Tunables for both cache tiers.
///
/// Zero for any limit means unlimited. Updates published through a
/// [`ConfigHandle`] reach the stores live; the next mutation enforces the
/// new thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Pre-decode images on a background worker (advisory; forwarded to
    /// decoder collaborators).
    #[serde(default = "default_true")]
    pub decompress_images: bool,

    /// Mark disk entries as excluded from backups (advisory; the platform
    /// flag is applied by embedders).
    #[serde(default = "default_true")]
    pub disable_backup: bool,

    /// Whether resolved images populate the memory tier.
    #[serde(default = "default_true")]
    pub cache_in_memory: bool,

    /// Write disk entries through a temp file plus rename.
    #[serde(default = "default_true")]
    pub atomic_writes: bool,

    /// Maximum age of a disk entry in seconds; 0 keeps entries forever.
    #[serde(default = "default_max_age")]
    pub max_age_secs: u64,

    /// Maximum total size of the disk namespace in bytes; 0 is unlimited.
    #[serde(default)]
    pub max_size_bytes: u64,

    /// Maximum total memory cost in bytes; 0 is unlimited.
    #[serde(default)]
    pub max_memory_cost: u64,

    /// Maximum number of memory entries; 0 is unlimited.
    #[serde(default)]
    pub max_memory_count: u64,

    /// Milliseconds between periodic memory trim passes.
    #[serde(default = "default_trim_interval")]
    pub auto_trim_interval_ms: u64,
}

const fn default_true() -> bool {
    true
}

const fn default_max_age() -> u64 {
    DEFAULT_MAX_AGE_SECS
}

const fn default_trim_interval() -> u64 {
    DEFAULT_AUTO_TRIM_INTERVAL_MS
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            decompress_images: true,
            disable_backup: true,
            cache_in_memory: true,
            atomic_writes: true,
            max_age_secs: DEFAULT_MAX_AGE_SECS,
            max_size_bytes: 0,
            max_memory_cost: 0,
            max_memory_count: 0,
            auto_trim_interval_ms: DEFAULT_AUTO_TRIM_INTERVAL_MS,
        }
    }
}

impl CacheConfig {
    /// Maximum disk entry age as a duration; `None` when unlimited.
    #[must_use]
    pub fn max_age(&self) -> Option<Duration> {
        (self.max_age_secs > 0).then(|| Duration::from_secs(self.max_age_secs))
    }

    /// Interval between periodic memory trim passes.
    #[must_use]
    pub fn auto_trim_interval(&self) -> Duration {
        Duration::from_millis(self.auto_trim_interval_ms.max(1))
    }
}

/// Publishes configuration changes to subscribed stores.
///
/// Stores hold a [`watch::Receiver`] and read the latest snapshot at each
/// mutation, so updates take effect without restarting anything.
#[derive(Debug)]
pub struct ConfigHandle {
    tx: watch::Sender<CacheConfig>,
}

impl ConfigHandle {
    /// Creates a handle publishing the given initial configuration.
    #[must_use]
    pub fn new(config: CacheConfig) -> Self {
        let (tx, _rx) = watch::channel(config);
        Self { tx }
    }

    /// Subscribes a store to configuration changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<CacheConfig> {
        self.tx.subscribe()
    }

    /// Returns the current configuration snapshot.
    #[must_use]
    pub fn current(&self) -> CacheConfig {
        self.tx.borrow().clone()
    }

    /// Applies a mutation and publishes the result to all subscribers.
    pub fn update(&self, apply: impl FnOnce(&mut CacheConfig)) {
        self.tx.send_modify(apply);
    }
}

impl Default for ConfigHandle {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}
