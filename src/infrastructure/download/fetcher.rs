//! Single HTTP transfer with progress, redirect, and cancellation signals.

use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use tokio::sync::watch;
use tracing::{debug, trace};
use url::Url;

use crate::domain::entities::{
    CancelledFn, DownloadCompletionFn, DownloadOptions, DownloadOutcome, ProgressFn, RedirectFn,
    RedirectInfo,
};
use crate::domain::errors::ImageError;
use crate::domain::ports::ImageDecoderPort;

/// Per-request timeout, covering the full transfer.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Redirect hops before the transfer is abandoned.
const MAX_REDIRECTS: u8 = 10;

/// Sentinel progress total when the server did not announce a length.
const UNKNOWN_LENGTH: i64 = -1;

/// Callbacks wired into one transfer by the downloader.
pub(crate) struct FetchCallbacks {
    pub(crate) progress: Option<ProgressFn>,
    pub(crate) redirect: Option<RedirectFn>,
    pub(crate) completion: DownloadCompletionFn,
    pub(crate) cancelled: CancelledFn,
}

/// One HTTP transfer.
///
/// Emits at most one terminal signal: the completion callback on success
/// or failure, or the cancelled callback when [`cancel`](Self::cancel)
/// aborts the transfer first. Progress fires per received chunk, and every
/// 3xx response consults the redirect callback before being followed.
pub struct Fetcher {
    url: Url,
    options: DownloadOptions,
    callbacks: FetchCallbacks,
    cancel_tx: Arc<watch::Sender<bool>>,
    cancel_rx: watch::Receiver<bool>,
}

impl Fetcher {
    pub(crate) fn new(url: Url, options: DownloadOptions, callbacks: FetchCallbacks) -> Self {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        Self {
            url,
            options,
            callbacks,
            cancel_tx: Arc::new(cancel_tx),
            cancel_rx,
        }
    }

    /// The URL this transfer targets.
    #[must_use]
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Aborts the transfer. Idempotent; safe after completion.
    pub fn cancel(&self) {
        let _ = self.cancel_tx.send(true);
    }

    /// Shared cancel signal, held by the downloader's bucket so the last
    /// unsubscribing caller can abort the transfer.
    pub(crate) fn cancel_signal(&self) -> Arc<watch::Sender<bool>> {
        self.cancel_tx.clone()
    }

    /// Snapshot of the cancel state, for skipping queued work.
    pub(crate) fn is_cancelled(&self) -> bool {
        *self.cancel_rx.borrow()
    }

    /// Drives the transfer to its terminal signal.
    pub(crate) async fn run(self, client: reqwest::Client, decoder: Arc<dyn ImageDecoderPort>) {
        if self.is_cancelled() {
            return self.finish_cancelled();
        }

        // A local clone keeps the cancel signal out of `self`, which the
        // terminal paths consume.
        let mut cancel_rx = self.cancel_rx.clone();
        let mut current = self.url.clone();
        let mut hops = 0u8;

        let response = loop {
            let send = client
                .get(current.clone())
                .timeout(REQUEST_TIMEOUT)
                .header(reqwest::header::ACCEPT, "image/*")
                .send();
            tokio::pin!(send);

            let result = tokio::select! {
                _ = cancel_rx.changed() => return self.finish_cancelled(),
                result = &mut send => result,
            };

            let response = match result {
                Ok(response) => response,
                Err(err) => return self.finish_error(ImageError::from_transport(&err)),
            };

            let status = response.status();
            if status.is_redirection() {
                hops += 1;
                if hops > MAX_REDIRECTS {
                    return self
                        .finish_error(ImageError::protocol(status.as_u16(), "too many redirects"));
                }
                let Some(location) = response
                    .headers()
                    .get(reqwest::header::LOCATION)
                    .and_then(|value| value.to_str().ok())
                else {
                    return self.finish_error(ImageError::protocol(
                        status.as_u16(),
                        "redirect without a Location header",
                    ));
                };
                let Ok(target) = current.join(location) else {
                    return self.finish_error(ImageError::protocol(
                        status.as_u16(),
                        "unparseable redirect location",
                    ));
                };

                let info = RedirectInfo {
                    status: status.as_u16(),
                    from: current.clone(),
                    to: target.clone(),
                };
                let follow = self.callbacks.redirect.as_ref().is_none_or(|cb| cb(&info));
                if !follow {
                    debug!(url = %current, to = %target, "redirect vetoed by caller");
                    return self.finish_error(ImageError::protocol(
                        status.as_u16(),
                        "redirect refused by caller",
                    ));
                }
                trace!(url = %current, to = %target, "following redirect");
                current = target;
                continue;
            }

            if !status.is_success() {
                return self.finish_error(ImageError::protocol(
                    status.as_u16(),
                    status.canonical_reason().unwrap_or("request failed"),
                ));
            }
            break response;
        };

        let expected = response
            .content_length()
            .and_then(|len| i64::try_from(len).ok())
            .unwrap_or(UNKNOWN_LENGTH);

        let stream = response.bytes_stream();
        tokio::pin!(stream);
        let mut received = BytesMut::new();

        loop {
            let chunk = tokio::select! {
                _ = cancel_rx.changed() => return self.finish_cancelled(),
                chunk = stream.next() => chunk,
            };
            match chunk {
                Some(Ok(chunk)) => {
                    received.extend_from_slice(&chunk);
                    if let Some(progress) = &self.callbacks.progress {
                        progress(received.len() as u64, expected);
                    }
                    if self.options.contains(DownloadOptions::PROGRESSIVE_LOAD) {
                        self.deliver_partial(&received, &decoder).await;
                    }
                }
                Some(Err(err)) => return self.finish_error(ImageError::from_transport(&err)),
                None => break,
            }
        }

        let data = received.freeze();
        let total = data.len() as u64;
        if let Some(progress) = &self.callbacks.progress {
            progress(total, i64::try_from(total).unwrap_or(UNKNOWN_LENGTH));
        }

        let decode_input = data.clone();
        let decoded =
            tokio::task::spawn_blocking(move || decoder.decode(&decode_input)).await;
        let outcome = match decoded {
            Ok(Ok(image)) => DownloadOutcome {
                image: Some(image),
                data: Some(data),
                error: None,
                finished: true,
            },
            // Undecodable bytes are discarded, not persisted.
            Ok(Err(err)) => DownloadOutcome {
                image: None,
                data: None,
                error: Some(err),
                finished: true,
            },
            Err(err) => DownloadOutcome {
                image: None,
                data: None,
                error: Some(ImageError::decode(format!("decode task panicked: {err}"))),
                finished: true,
            },
        };
        (self.callbacks.completion)(&outcome);
    }

    async fn deliver_partial(&self, received: &BytesMut, decoder: &Arc<dyn ImageDecoderPort>) {
        let snapshot = Bytes::copy_from_slice(received);
        let decoder = decoder.clone();
        let partial = tokio::task::spawn_blocking(move || decoder.decode_partial(&snapshot))
            .await
            .ok()
            .flatten();
        if let Some(image) = partial {
            (self.callbacks.completion)(&DownloadOutcome {
                image: Some(image),
                data: None,
                error: None,
                finished: false,
            });
        }
    }

    fn finish_error(self, error: ImageError) {
        debug!(url = %self.url, error = %error, "transfer failed");
        (self.callbacks.completion)(&DownloadOutcome {
            image: None,
            data: None,
            error: Some(error),
            finished: true,
        });
    }

    fn finish_cancelled(self) {
        trace!(url = %self.url, "transfer cancelled");
        (self.callbacks.cancelled)();
    }
}

/// Builds the HTTP client a transfer with these options needs.
///
/// Redirects are handled manually by the fetcher so per-request redirect
/// callbacks can veto them, and transport-level response caching stays
/// disabled to avoid double-caching with the disk tier.
pub(crate) fn build_client(options: DownloadOptions) -> Result<reqwest::Client, ImageError> {
    let mut builder = reqwest::Client::builder().redirect(reqwest::redirect::Policy::none());
    if options.contains(DownloadOptions::HANDLE_COOKIES) {
        builder = builder.cookie_store(true);
    }
    if options.contains(DownloadOptions::ALLOW_INVALID_SSL_CERTIFICATES) {
        builder = builder.danger_accept_invalid_certs(true);
    }
    builder
        .build()
        .map_err(|err| ImageError::network(format!("failed to build HTTP client: {err}")))
}
