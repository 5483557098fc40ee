//! Bounded-concurrency downloader with per-URL request coalescing.

use std::collections::{HashMap, VecDeque};
use std::collections::hash_map::Entry;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, trace, warn};
use url::Url;

use super::fetcher::{FetchCallbacks, Fetcher, build_client};
use crate::domain::entities::{
    CacheKey, CancelledFn, DownloadCompletionFn, DownloadOptions, DownloadOutcome, ProgressFn,
    RedirectFn,
};
use crate::domain::errors::ImageError;
use crate::domain::ports::{CancellableOperation, ImageDecoderPort};
use crate::infrastructure::decode::DefaultImageDecoder;

/// Default bound on concurrently running transfers.
pub const DEFAULT_MAX_CONCURRENT: usize = 2;

/// Observability signal emitted when a URL starts or stops transferring.
///
/// Delivery is best-effort pub/sub with no cross-URL ordering guarantees.
#[derive(Debug, Clone)]
pub enum DownloadEvent {
    /// The first transfer for this URL began.
    Started {
        /// The transferring URL.
        url: Url,
    },
    /// The transfer reached a terminal event (success, failure, or
    /// cancellation).
    Finished {
        /// The transferred URL.
        url: Url,
    },
}

/// Optional callbacks one subscriber attaches to a download.
#[derive(Default)]
pub struct DownloadCallbacks {
    /// Per-chunk progress.
    pub progress: Option<ProgressFn>,
    /// Redirect veto hook.
    pub redirect: Option<RedirectFn>,
    /// Terminal (and progressive) completion.
    pub completion: Option<DownloadCompletionFn>,
}

struct Subscriber {
    id: u64,
    progress: Option<ProgressFn>,
    redirect: Option<RedirectFn>,
    completion: Option<DownloadCompletionFn>,
}

struct Bucket {
    subscribers: Vec<Subscriber>,
    cancel: Arc<watch::Sender<bool>>,
}

type BucketRef = Arc<Mutex<Bucket>>;

struct Job {
    key: CacheKey,
    fetcher: Fetcher,
    options: DownloadOptions,
    decoder: Arc<dyn ImageDecoderPort>,
}

enum DispatchCommand {
    Enqueue { job: Job, front: bool },
    SetLimit(usize),
    JobFinished,
}

/// Pool of bounded concurrent fetchers with duplicate-request coalescing.
///
/// All subscribers for the same cache key share one [`Fetcher`]: the first
/// subscriber creates the transfer, later ones attach to it, and handle
/// cancellation only aborts the transfer once the last subscriber is gone.
/// Completion fan-out removes the bucket before invoking callbacks, so a
/// subscriber arriving during fan-out starts a fresh transfer instead of
/// observing a stale completion.
pub struct ImageDownloader {
    inner: Arc<DownloaderInner>,
}

struct DownloaderInner {
    buckets: RwLock<HashMap<CacheKey, BucketRef>>,
    dispatch_tx: mpsc::UnboundedSender<DispatchCommand>,
    events: broadcast::Sender<DownloadEvent>,
    clients: Mutex<HashMap<(bool, bool), reqwest::Client>>,
    decoder: Arc<dyn ImageDecoderPort>,
    next_subscriber: AtomicU64,
}

impl ImageDownloader {
    /// Creates a downloader with the default decoder and concurrency.
    ///
    /// # Panics
    /// Panics when called outside a Tokio runtime: the dispatcher task is
    /// spawned here.
    #[must_use]
    pub fn new() -> Self {
        Self::with_decoder(Arc::new(DefaultImageDecoder), DEFAULT_MAX_CONCURRENT)
    }

    /// Creates a downloader with a custom decoder and concurrency bound.
    ///
    /// # Panics
    /// Panics when called outside a Tokio runtime.
    #[must_use]
    pub fn with_decoder(decoder: Arc<dyn ImageDecoderPort>, max_concurrent: usize) -> Self {
        let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(64);
        let inner = Arc::new(DownloaderInner {
            buckets: RwLock::new(HashMap::new()),
            dispatch_tx,
            events,
            clients: Mutex::new(HashMap::new()),
            decoder,
            next_subscriber: AtomicU64::new(0),
        });
        tokio::spawn(dispatch_loop(
            Arc::downgrade(&inner),
            dispatch_rx,
            max_concurrent,
        ));
        Self { inner }
    }

    /// Subscribes to a download of `url`, coalescing onto an in-flight
    /// transfer for the same cache key when one exists.
    pub fn download(
        &self,
        url: Url,
        options: DownloadOptions,
        callbacks: DownloadCallbacks,
    ) -> DownloadHandle {
        let key = CacheKey::from_url(url.as_str());
        self.download_keyed(key, url, options, callbacks, None)
    }

    /// Keyed subscription with an optional decoder override.
    ///
    /// The override applies when this subscriber creates the transfer;
    /// subscribers coalescing onto an in-flight transfer share the
    /// creator's decoder.
    pub(crate) fn download_keyed(
        &self,
        key: CacheKey,
        url: Url,
        options: DownloadOptions,
        callbacks: DownloadCallbacks,
        decoder: Option<Arc<dyn ImageDecoderPort>>,
    ) -> DownloadHandle {
        let id = self.inner.next_subscriber.fetch_add(1, Ordering::Relaxed);
        let subscriber = Subscriber {
            id,
            progress: callbacks.progress,
            redirect: callbacks.redirect,
            completion: callbacks.completion,
        };
        let handle = DownloadHandle {
            key: key.clone(),
            id,
            inner: Arc::downgrade(&self.inner),
            cancelled: AtomicBool::new(false),
        };

        // Shared path: attach to an in-flight transfer.
        {
            let buckets = self.inner.buckets.read();
            if let Some(bucket) = buckets.get(&key) {
                bucket.lock().subscribers.push(subscriber);
                trace!(key = %key, "coalesced onto in-flight download");
                return handle;
            }
        }

        // Barrier path: create the bucket and enqueue a fetcher.
        let mut buckets = self.inner.buckets.write();
        match buckets.entry(key.clone()) {
            Entry::Occupied(entry) => {
                entry.get().lock().subscribers.push(subscriber);
                trace!(key = %key, "coalesced onto in-flight download");
            }
            Entry::Vacant(entry) => {
                let fetcher = make_fetcher(&self.inner, key.clone(), url, options);
                entry.insert(Arc::new(Mutex::new(Bucket {
                    subscribers: vec![subscriber],
                    cancel: fetcher.cancel_signal(),
                })));
                drop(buckets);

                let front = options.contains(DownloadOptions::HIGH_PRIORITY);
                let job = Job {
                    key: key.clone(),
                    fetcher,
                    options,
                    decoder: decoder.unwrap_or_else(|| self.inner.decoder.clone()),
                };
                if self
                    .inner
                    .dispatch_tx
                    .send(DispatchCommand::Enqueue { job, front })
                    .is_err()
                {
                    warn!(key = %key, "download dispatcher is gone");
                    self.inner.complete_terminal(
                        &key,
                        &DownloadOutcome {
                            image: None,
                            data: None,
                            error: Some(ImageError::network("download dispatcher is gone")),
                            finished: true,
                        },
                    );
                }
            }
        }
        handle
    }

    /// Changes the concurrency bound; queued transfers pick it up as
    /// running ones finish.
    pub fn set_max_concurrent(&self, max_concurrent: usize) {
        let _ = self
            .inner
            .dispatch_tx
            .send(DispatchCommand::SetLimit(max_concurrent));
    }

    /// Subscribes to start/stop download signals.
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<DownloadEvent> {
        self.inner.events.subscribe()
    }

    /// Returns true while a transfer for this URL is in flight.
    #[must_use]
    pub fn is_downloading(&self, url: &Url) -> bool {
        let key = CacheKey::from_url(url.as_str());
        self.inner.buckets.read().contains_key(&key)
    }

    /// Aborts every in-flight transfer; no subscriber receives a
    /// completion.
    pub fn cancel_all(&self) {
        let drained: Vec<BucketRef> = {
            let mut buckets = self.inner.buckets.write();
            buckets.drain().map(|(_, bucket)| bucket).collect()
        };
        for bucket in drained {
            let guard = bucket.lock();
            let _ = guard.cancel.send(true);
        }
    }
}

impl Default for ImageDownloader {
    fn default() -> Self {
        Self::new()
    }
}

/// Builds the fetcher whose callbacks fan out to this key's bucket.
fn make_fetcher(
    inner: &Arc<DownloaderInner>,
    key: CacheKey,
    url: Url,
    options: DownloadOptions,
) -> Fetcher {
    let progress_inner = inner.clone();
    let progress_key = key.clone();
    let progress: ProgressFn = Arc::new(move |received, expected| {
        for cb in progress_inner.snapshot_progress(&progress_key) {
            cb(received, expected);
        }
    });

    let redirect_inner = inner.clone();
    let redirect_key = key.clone();
    let redirect: RedirectFn = Arc::new(move |info| {
        // Any subscriber veto stops the follow; no callbacks means follow
        // by default.
        redirect_inner
            .snapshot_redirect(&redirect_key)
            .iter()
            .all(|cb| cb(info))
    });

    let completion_inner = inner.clone();
    let completion_key = key.clone();
    let completion: DownloadCompletionFn = Arc::new(move |outcome| {
        if outcome.finished {
            completion_inner.complete_terminal(&completion_key, outcome);
        } else {
            completion_inner.deliver_partial(&completion_key, outcome);
        }
    });

    let cancelled_inner = inner.clone();
    let cancelled: CancelledFn = Box::new(move || {
        cancelled_inner.drop_bucket(&key);
    });

    Fetcher::new(
        url,
        options,
        FetchCallbacks {
            progress: Some(progress),
            redirect: Some(redirect),
            completion,
            cancelled,
        },
    )
}

impl DownloaderInner {
    fn snapshot_progress(&self, key: &CacheKey) -> Vec<ProgressFn> {
        let buckets = self.buckets.read();
        let Some(bucket) = buckets.get(key) else {
            return Vec::new();
        };
        let guard = bucket.lock();
        guard
            .subscribers
            .iter()
            .filter_map(|s| s.progress.clone())
            .collect()
    }

    fn snapshot_redirect(&self, key: &CacheKey) -> Vec<RedirectFn> {
        let buckets = self.buckets.read();
        let Some(bucket) = buckets.get(key) else {
            return Vec::new();
        };
        let guard = bucket.lock();
        guard
            .subscribers
            .iter()
            .filter_map(|s| s.redirect.clone())
            .collect()
    }

    /// Terminal fan-out: the bucket is removed from the map first, then
    /// callbacks run in subscription order. A subscriber arriving between
    /// removal and fan-out gets a fresh bucket, never a stale completion.
    fn complete_terminal(&self, key: &CacheKey, outcome: &DownloadOutcome) {
        let bucket = { self.buckets.write().remove(key) };
        let Some(bucket) = bucket else {
            return;
        };
        let subscribers = {
            let mut guard = bucket.lock();
            std::mem::take(&mut guard.subscribers)
        };
        trace!(key = %key, subscribers = subscribers.len(), "download completion fan-out");
        for subscriber in subscribers {
            if let Some(completion) = subscriber.completion {
                completion(outcome);
            }
        }
    }

    /// Progressive fan-out; the bucket stays in place.
    fn deliver_partial(&self, key: &CacheKey, outcome: &DownloadOutcome) {
        let bucket = { self.buckets.read().get(key).cloned() };
        let Some(bucket) = bucket else {
            return;
        };
        let completions: Vec<_> = {
            let guard = bucket.lock();
            guard
                .subscribers
                .iter()
                .filter_map(|s| s.completion.clone())
                .collect()
        };
        for completion in completions {
            completion(outcome);
        }
    }

    fn drop_bucket(&self, key: &CacheKey) {
        let _ = self.buckets.write().remove(key);
    }

    fn cancel_subscriber(&self, key: &CacheKey, id: u64) {
        let becomes_empty = {
            let buckets = self.buckets.read();
            let Some(bucket) = buckets.get(key) else {
                return;
            };
            let mut guard = bucket.lock();
            let before = guard.subscribers.len();
            guard.subscribers.retain(|s| s.id != id);
            before != guard.subscribers.len() && guard.subscribers.is_empty()
        };
        if !becomes_empty {
            return;
        }
        // Re-check under the barrier: a new subscriber may have attached.
        let mut buckets = self.buckets.write();
        if let Some(bucket) = buckets.get(key) {
            let guard = bucket.lock();
            if guard.subscribers.is_empty() {
                let _ = guard.cancel.send(true);
                drop(guard);
                buckets.remove(key);
                debug!(key = %key, "last subscriber cancelled, aborting transfer");
            }
        }
    }

    fn client_for(&self, options: DownloadOptions) -> Result<reqwest::Client, ImageError> {
        let flavor = (
            options.contains(DownloadOptions::HANDLE_COOKIES),
            options.contains(DownloadOptions::ALLOW_INVALID_SSL_CERTIFICATES),
        );
        let mut clients = self.clients.lock();
        if let Some(client) = clients.get(&flavor) {
            return Ok(client.clone());
        }
        let client = build_client(options)?;
        clients.insert(flavor, client.clone());
        Ok(client)
    }
}

async fn dispatch_loop(
    inner: Weak<DownloaderInner>,
    mut rx: mpsc::UnboundedReceiver<DispatchCommand>,
    initial_limit: usize,
) {
    let mut limit = initial_limit.max(1);
    let mut active = 0usize;
    let mut queue: VecDeque<Job> = VecDeque::new();

    while let Some(command) = rx.recv().await {
        match command {
            DispatchCommand::Enqueue { job, front } => {
                if front {
                    queue.push_front(job);
                } else {
                    queue.push_back(job);
                }
            }
            DispatchCommand::SetLimit(new_limit) => limit = new_limit.max(1),
            DispatchCommand::JobFinished => active = active.saturating_sub(1),
        }

        while active < limit {
            let Some(job) = queue.pop_front() else {
                break;
            };
            if job.fetcher.is_cancelled() {
                continue;
            }
            let Some(inner) = inner.upgrade() else {
                return;
            };
            active += 1;
            tokio::spawn(run_job(inner, job));
        }
    }
}

async fn run_job(inner: Arc<DownloaderInner>, job: Job) {
    let url = job.fetcher.url().clone();
    match inner.client_for(job.options) {
        Ok(client) => {
            let _ = inner.events.send(DownloadEvent::Started { url: url.clone() });
            job.fetcher.run(client, job.decoder).await;
            let _ = inner.events.send(DownloadEvent::Finished { url });
        }
        Err(error) => {
            inner.complete_terminal(
                &job.key,
                &DownloadOutcome {
                    image: None,
                    data: None,
                    error: Some(error),
                    finished: true,
                },
            );
        }
    }
    let _ = inner.dispatch_tx.send(DispatchCommand::JobFinished);
}

/// Cancellable token for one download subscriber.
///
/// Cancelling removes this subscriber's callbacks; the shared transfer is
/// only aborted when no subscribers remain.
pub struct DownloadHandle {
    key: CacheKey,
    id: u64,
    inner: Weak<DownloaderInner>,
    cancelled: AtomicBool,
}

impl CancellableOperation for DownloadHandle {
    fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(inner) = self.inner.upgrade() {
            inner.cancel_subscriber(&self.key, self.id);
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use super::super::test_server::{CannedResponse, TestServer, png_body};
    use super::*;

    async fn wait_until(what: &str, condition: impl Fn() -> bool) {
        for _ in 0..500 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {what}");
    }

    fn counting_completion(counter: &Arc<AtomicUsize>) -> DownloadCallbacks {
        let counter = counter.clone();
        DownloadCallbacks {
            completion: Some(Arc::new(move |outcome| {
                if outcome.finished {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            })),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn duplicate_requests_share_one_transfer() {
        let server = TestServer::serve(
            CannedResponse::ok("image/png", png_body()).with_delay(Duration::from_millis(200)),
        )
        .await;
        let downloader = ImageDownloader::new();
        let url = server.url("/b.png");

        let completions = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..50)
            .map(|_| {
                downloader.download(
                    url.clone(),
                    DownloadOptions::empty(),
                    counting_completion(&completions),
                )
            })
            .collect();

        wait_until("all completions", || {
            completions.load(Ordering::SeqCst) == 50
        })
        .await;
        assert_eq!(server.hit_count(), 1);
        drop(handles);
    }

    #[tokio::test]
    async fn completions_are_delivered_in_subscription_order() {
        let server = TestServer::serve(
            CannedResponse::ok("image/png", png_body()).with_delay(Duration::from_millis(150)),
        )
        .await;
        let downloader = ImageDownloader::new();
        let url = server.url("/ordered.png");

        let order = Arc::new(Mutex::new(Vec::new()));
        let _handles: Vec<_> = (0..8)
            .map(|i| {
                let order = order.clone();
                downloader.download(
                    url.clone(),
                    DownloadOptions::empty(),
                    DownloadCallbacks {
                        completion: Some(Arc::new(move |_| order.lock().push(i))),
                        ..Default::default()
                    },
                )
            })
            .collect();

        wait_until("ordered completions", || order.lock().len() == 8).await;
        assert_eq!(*order.lock(), (0..8).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn cancelling_some_subscribers_keeps_the_transfer_alive() {
        let server = TestServer::serve(
            CannedResponse::ok("image/png", png_body()).with_delay(Duration::from_millis(300)),
        )
        .await;
        let downloader = ImageDownloader::new();
        let url = server.url("/c.png");

        let kept = Arc::new(AtomicUsize::new(0));
        let dropped = Arc::new(AtomicUsize::new(0));

        let cancel_handles: Vec<_> = (0..3)
            .map(|_| {
                downloader.download(
                    url.clone(),
                    DownloadOptions::empty(),
                    counting_completion(&dropped),
                )
            })
            .collect();
        let _keep_handles: Vec<_> = (0..3)
            .map(|_| {
                downloader.download(
                    url.clone(),
                    DownloadOptions::empty(),
                    counting_completion(&kept),
                )
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(50)).await;
        for handle in &cancel_handles {
            handle.cancel();
        }

        wait_until("surviving completions", || kept.load(Ordering::SeqCst) == 3).await;
        assert_eq!(dropped.load(Ordering::SeqCst), 0);
        assert_eq!(server.hit_count(), 1);
    }

    #[tokio::test]
    async fn cancelling_the_last_subscriber_aborts_the_transfer() {
        let server = TestServer::serve(
            CannedResponse::ok("image/png", png_body()).with_delay(Duration::from_millis(400)),
        )
        .await;
        let downloader = ImageDownloader::new();
        let url = server.url("/d.png");

        let completions = Arc::new(AtomicUsize::new(0));
        let handle = downloader.download(
            url.clone(),
            DownloadOptions::empty(),
            counting_completion(&completions),
        );

        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.cancel();
        handle.cancel();

        wait_until("bucket removal", || !downloader.is_downloading(&url)).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(completions.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failures_fan_out_to_every_subscriber() {
        let server = TestServer::serve(
            CannedResponse::status(500, "Internal Server Error")
                .with_delay(Duration::from_millis(100)),
        )
        .await;
        let downloader = ImageDownloader::new();
        let url = server.url("/err.png");

        let errors = Arc::new(AtomicUsize::new(0));
        let _handles: Vec<_> = (0..5)
            .map(|_| {
                let errors = errors.clone();
                downloader.download(
                    url.clone(),
                    DownloadOptions::empty(),
                    DownloadCallbacks {
                        completion: Some(Arc::new(move |outcome| {
                            if matches!(
                                outcome.error,
                                Some(ImageError::Protocol { status: 500, .. })
                            ) {
                                errors.fetch_add(1, Ordering::SeqCst);
                            }
                        })),
                        ..Default::default()
                    },
                )
            })
            .collect();

        wait_until("error fan-out", || errors.load(Ordering::SeqCst) == 5).await;
        assert_eq!(server.hit_count(), 1);
    }

    #[tokio::test]
    async fn a_finished_download_leaves_a_fresh_bucket_behind() {
        let server = TestServer::serve(CannedResponse::ok("image/png", png_body())).await;
        let downloader = ImageDownloader::new();
        let url = server.url("/e.png");

        let completions = Arc::new(AtomicUsize::new(0));
        let _first = downloader.download(
            url.clone(),
            DownloadOptions::empty(),
            counting_completion(&completions),
        );
        wait_until("first completion", || completions.load(Ordering::SeqCst) == 1).await;

        // A later subscriber starts a new transfer rather than observing
        // the finished one.
        let _second = downloader.download(
            url.clone(),
            DownloadOptions::empty(),
            counting_completion(&completions),
        );
        wait_until("second completion", || {
            completions.load(Ordering::SeqCst) == 2
        })
        .await;
        assert_eq!(server.hit_count(), 2);
    }

    #[tokio::test]
    async fn start_and_finish_events_are_emitted() {
        let server = TestServer::serve(CannedResponse::ok("image/png", png_body())).await;
        let downloader = ImageDownloader::new();
        let mut events = downloader.subscribe_events();
        let url = server.url("/f.png");

        let completions = Arc::new(AtomicUsize::new(0));
        let _handle = downloader.download(
            url.clone(),
            DownloadOptions::empty(),
            counting_completion(&completions),
        );

        let first = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(first, DownloadEvent::Started { url: started } if started == url));

        let second = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(second, DownloadEvent::Finished { url: finished } if finished == url));
    }

    #[tokio::test]
    async fn progress_reaches_subscribers() {
        let body = png_body();
        let total = body.len() as u64;
        let server = TestServer::serve(CannedResponse::ok("image/png", body)).await;
        let downloader = ImageDownloader::new();

        let final_progress = Arc::new(Mutex::new(None));
        let progress_sink = final_progress.clone();
        let completions = Arc::new(AtomicUsize::new(0));
        let completions_cb = completions.clone();

        let _handle = downloader.download(
            server.url("/g.png"),
            DownloadOptions::empty(),
            DownloadCallbacks {
                progress: Some(Arc::new(move |received, expected| {
                    *progress_sink.lock() = Some((received, expected));
                })),
                completion: Some(Arc::new(move |_| {
                    completions_cb.fetch_add(1, Ordering::SeqCst);
                })),
                redirect: None,
            },
        );

        wait_until("completion", || completions.load(Ordering::SeqCst) == 1).await;
        let last = *final_progress.lock();
        assert_eq!(last, Some((total, i64::try_from(total).unwrap())));
    }
}
