//! End-to-end load orchestration: memory, disk, then network.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use once_cell::sync::OnceCell;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace, warn};
use url::Url;

use crate::domain::entities::{
    CacheKey, CacheType, CachedImage, DownloadCompletionFn, DownloadOptions, DownloadOutcome,
    LoadCompletionFn, LoadContext, LoadOptions, LoadResult, ProgressFn,
};
use crate::domain::errors::ImageError;
use crate::domain::ports::{CancellableOperation, ImageCachePort, ImageTransformerPort};
use crate::infrastructure::cache::ImageCache;
use crate::infrastructure::config::{CacheConfig, ConfigHandle};
use crate::infrastructure::download::{DownloadCallbacks, DownloadHandle, ImageDownloader};

/// Presence of a URL in each cache tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheAvailability {
    /// The key is resident in the memory tier.
    pub in_memory: bool,
    /// A file exists for the key in the disk tier.
    pub on_disk: bool,
}

/// Orchestrates image loads end to end.
///
/// Given a URL, the manager checks the failed-URL blacklist, queries the
/// memory tier, reads through from disk, and finally downloads, writing the
/// result back into both tiers and delivering completions to the caller.
/// Multiple managers with independent cache roots can coexist; the
/// [`shared`](Self::shared) instance is a convenience, not a requirement.
pub struct ImageManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    cache: Arc<dyn ImageCachePort>,
    downloader: Arc<ImageDownloader>,
    config: ConfigHandle,
    failed_urls: RwLock<HashMap<Url, ImageError>>,
    operations: Mutex<Vec<Weak<LoadState>>>,
}

#[derive(Default)]
struct LoadState {
    cancelled: AtomicBool,
    download: Mutex<Option<DownloadHandle>>,
}

impl LoadState {
    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(handle) = self.download.lock().take() {
            handle.cancel();
        }
    }
}

static SHARED: OnceCell<ImageManager> = OnceCell::new();

impl ImageManager {
    /// Creates a manager with built-in tiers rooted at
    /// `{root}/{namespace}`.
    ///
    /// # Panics
    /// Panics when called outside a Tokio runtime: the tier workers and
    /// the download dispatcher are spawned here.
    #[must_use]
    pub fn new(
        root: impl Into<std::path::PathBuf>,
        namespace: &str,
        config: CacheConfig,
    ) -> Self {
        let config = ConfigHandle::new(config);
        let cache = Arc::new(ImageCache::new(root, namespace, &config));
        Self::with_parts(cache, Arc::new(ImageDownloader::new()), config)
    }

    /// Creates a manager over custom cache and downloader instances.
    #[must_use]
    pub fn with_parts(
        cache: Arc<dyn ImageCachePort>,
        downloader: Arc<ImageDownloader>,
        config: ConfigHandle,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                cache,
                downloader,
                config,
                failed_urls: RwLock::new(HashMap::new()),
                operations: Mutex::new(Vec::new()),
            }),
        }
    }

    /// The process-wide convenience instance, using the platform cache
    /// directory and default configuration.
    ///
    /// # Panics
    /// Panics when first called outside a Tokio runtime.
    #[must_use]
    pub fn shared() -> &'static Self {
        SHARED.get_or_init(|| {
            let config = ConfigHandle::default();
            let cache = Arc::new(ImageCache::with_default_location(&config));
            Self::with_parts(cache, Arc::new(ImageDownloader::new()), config)
        })
    }

    /// The configuration handle; updates apply to the tiers live.
    #[must_use]
    pub fn config(&self) -> &ConfigHandle {
        &self.inner.config
    }

    /// The two-tier cache.
    #[must_use]
    pub fn cache(&self) -> &Arc<dyn ImageCachePort> {
        &self.inner.cache
    }

    /// The downloader.
    #[must_use]
    pub fn downloader(&self) -> &Arc<ImageDownloader> {
        &self.inner.downloader
    }

    /// Resolves a URL through cache tiers and network, delivering results
    /// to `completion` and returning a cancellable handle.
    ///
    /// Invalid input completes synchronously before anything is scheduled;
    /// every other callback fires from a worker task. With
    /// [`LoadOptions::REFRESH_CACHED`] a cached result is delivered first
    /// with `finished = false`, always before the terminal delivery.
    pub fn load_image(
        &self,
        url: &str,
        options: LoadOptions,
        context: LoadContext,
        progress: Option<ProgressFn>,
        completion: LoadCompletionFn,
    ) -> LoadHandle {
        let state = Arc::new(LoadState::default());
        let handle = LoadHandle {
            state: state.clone(),
            operation_key: context.operation_key.clone(),
        };

        let trimmed = url.trim();
        let parsed = if trimmed.is_empty() {
            Err(ImageError::invalid_url("empty URL"))
        } else {
            Url::parse(trimmed).map_err(|err| ImageError::invalid_url(err.to_string()))
        };
        let parsed = match parsed {
            Ok(parsed) => parsed,
            Err(error) => {
                completion(&LoadResult::failure(error, None));
                return handle;
            }
        };

        self.register(&state);
        tokio::spawn(run_load(
            self.inner.clone(),
            parsed,
            options,
            context,
            progress,
            completion,
            state,
        ));
        handle
    }

    /// Cancels every in-flight load and clears the failed-URL blacklist.
    pub fn cancel_all(&self) {
        let operations = std::mem::take(&mut *self.inner.operations.lock());
        for operation in operations {
            if let Some(state) = operation.upgrade() {
                state.cancel();
            }
        }
        self.inner.failed_urls.write().clear();
        debug!("cancelled all loads");
    }

    /// Reports whether a URL is resident in each tier.
    pub async fn cached_status(&self, url: &str) -> CacheAvailability {
        let Ok(parsed) = Url::parse(url.trim()) else {
            return CacheAvailability {
                in_memory: false,
                on_disk: false,
            };
        };
        let key = CacheKey::from_url(parsed.as_str());
        CacheAvailability {
            in_memory: self.inner.cache.contains(&key, CacheType::Memory).await,
            on_disk: self.inner.cache.contains(&key, CacheType::Disk).await,
        }
    }

    /// Clears the addressed cache tiers.
    pub async fn clear_cache(&self, target: CacheType) {
        self.inner.cache.clear(target).await;
    }

    /// Forgets previously failed URLs without cancelling anything.
    pub fn clear_failed_urls(&self) {
        self.inner.failed_urls.write().clear();
    }

    fn register(&self, state: &Arc<LoadState>) {
        let mut operations = self.inner.operations.lock();
        operations.retain(|weak| weak.strong_count() > 0);
        operations.push(Arc::downgrade(state));
    }
}

fn deliver(state: &LoadState, completion: &LoadCompletionFn, result: &LoadResult) {
    if state.is_cancelled() {
        return;
    }
    completion(result);
}

#[allow(clippy::too_many_lines)]
async fn run_load(
    inner: Arc<ManagerInner>,
    url: Url,
    options: LoadOptions,
    context: LoadContext,
    progress: Option<ProgressFn>,
    completion: LoadCompletionFn,
    state: Arc<LoadState>,
) {
    if state.is_cancelled() {
        return;
    }

    // Previously failed URLs complete with the retained error unless the
    // caller asked for a retry.
    if !options.contains(LoadOptions::RETRY_FAILED) {
        let failed = inner.failed_urls.read().get(&url).cloned();
        if let Some(error) = failed {
            trace!(url = %url, "URL previously failed, delivering retained error");
            deliver(&state, &completion, &LoadResult::failure(error, Some(url)));
            return;
        }
    }

    let key = context.cache_key_for(&url);
    let query_tiers = context.query_cache_type.unwrap_or(CacheType::Both);

    if query_tiers != CacheType::None {
        if let Some(hit) = inner
            .cache
            .query(&key, query_tiers, context.decoder.clone())
            .await
        {
            if state.is_cancelled() {
                return;
            }
            let refresh = options.contains(LoadOptions::REFRESH_CACHED);
            deliver(
                &state,
                &completion,
                &LoadResult {
                    image: Some(hit.image),
                    error: None,
                    cache_type: hit.source,
                    finished: !refresh,
                    url: Some(url.clone()),
                },
            );
            if !refresh {
                return;
            }
        }
    }

    if state.is_cancelled() {
        return;
    }

    let download_completion = make_download_completion(
        &inner,
        &state,
        &completion,
        &url,
        &key,
        options,
        &context,
    );
    let download_handle = inner.downloader.download_keyed(
        key,
        url,
        DownloadOptions::from(options),
        DownloadCallbacks {
            progress,
            redirect: None,
            completion: Some(download_completion),
        },
        context.decoder,
    );

    *state.download.lock() = Some(download_handle);
    if state.is_cancelled() {
        if let Some(handle) = state.download.lock().take() {
            handle.cancel();
        }
    }
}

/// Builds the downloader completion that applies the write-back policy and
/// blacklist rules before delivering to the caller.
fn make_download_completion(
    inner: &Arc<ManagerInner>,
    state: &Arc<LoadState>,
    completion: &LoadCompletionFn,
    url: &Url,
    key: &CacheKey,
    options: LoadOptions,
    context: &LoadContext,
) -> DownloadCompletionFn {
    let inner = inner.clone();
    let state = state.clone();
    let completion = completion.clone();
    let url = url.clone();
    let key = key.clone();
    let transformer = context.transformer.clone();

    // `CacheMemoryOnly` strips the disk tier out of the write-back target;
    // with `RefreshCached` also set, the preview still fetches but nothing
    // is persisted to disk.
    let store_target = {
        let target = context.store_cache_type.unwrap_or(CacheType::Both);
        if options.contains(LoadOptions::CACHE_MEMORY_ONLY) {
            if target.includes_memory() {
                CacheType::Memory
            } else {
                CacheType::None
            }
        } else {
            target
        }
    };

    Arc::new(move |outcome: &DownloadOutcome| {
        if state.is_cancelled() {
            return;
        }

        if !outcome.finished {
            deliver(
                &state,
                &completion,
                &LoadResult {
                    image: outcome.image.clone(),
                    error: None,
                    cache_type: CacheType::None,
                    finished: false,
                    url: Some(url.clone()),
                },
            );
            return;
        }

        if let Some(error) = &outcome.error {
            if !error.is_retriable() {
                debug!(url = %url, error = %error, "retaining non-retriable failure");
                inner.failed_urls.write().insert(url.clone(), error.clone());
            }
            deliver(
                &state,
                &completion,
                &LoadResult::failure(error.clone(), Some(url.clone())),
            );
            return;
        }

        let Some(image) = outcome.image.clone() else {
            deliver(
                &state,
                &completion,
                &LoadResult::failure(
                    ImageError::decode("transfer finished without an image"),
                    Some(url.clone()),
                ),
            );
            return;
        };

        let inner = inner.clone();
        let state = state.clone();
        let completion = completion.clone();
        let url = url.clone();
        let key = key.clone();
        let transformer = transformer.clone();
        tokio::spawn(async move {
            let (final_image, final_key) = apply_transformer(transformer, image, key).await;
            if store_target != CacheType::None {
                inner.cache.store(&final_key, final_image.clone(), store_target).await;
            }
            deliver(
                &state,
                &completion,
                &LoadResult {
                    image: Some(final_image),
                    error: None,
                    cache_type: CacheType::None,
                    finished: true,
                    url: Some(url),
                },
            );
        });
    })
}

async fn apply_transformer(
    transformer: Option<Arc<dyn ImageTransformerPort>>,
    image: CachedImage,
    key: CacheKey,
) -> (CachedImage, CacheKey) {
    let Some(transformer) = transformer else {
        return (image, key);
    };
    let transformed_key = key.with_transformer(transformer.transformer_key());
    let input = image.clone();
    let worker = transformer.clone();
    match tokio::task::spawn_blocking(move || worker.transform(&input)).await {
        Ok(transformed) => (transformed, transformed_key),
        Err(err) => {
            warn!(error = %err, "image transformer panicked, keeping the original");
            (image, key)
        }
    }
}

/// Cancellable token for one manager load request.
///
/// Cancelling suppresses every further callback for this request; a shared
/// underlying transfer continues while other subscribers remain. Cancel is
/// idempotent and a no-op after completion.
pub struct LoadHandle {
    state: Arc<LoadState>,
    operation_key: Option<String>,
}

impl LoadHandle {
    /// Caller-defined grouping key from the request context.
    #[must_use]
    pub fn operation_key(&self) -> Option<&str> {
        self.operation_key.as_deref()
    }
}

impl CancellableOperation for LoadHandle {
    fn cancel(&self) {
        self.state.cancel();
    }

    fn is_cancelled(&self) -> bool {
        self.state.is_cancelled()
    }
}
