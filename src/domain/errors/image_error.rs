//! Image pipeline error types.

use thiserror::Error;

/// Errors surfaced by the image loading pipeline.
///
/// Cache misses are not errors; they are reported as empty results. The
/// variants are `Clone`able so a failure can be fanned out to every
/// coalesced subscriber and retained in the failed-URL blacklist.
#[derive(Debug, Clone, Error)]
pub enum ImageError {
    /// The URL was null, empty, or failed to parse.
    #[error("invalid image URL: {reason}")]
    InvalidUrl {
        /// Why the URL was rejected.
        reason: String,
    },

    /// Transport-level failure: connection, DNS, timeout.
    #[error("network failure: {message}")]
    Network {
        /// Transport error description.
        message: String,
    },

    /// TLS handshake or certificate validation failure.
    #[error("TLS failure: {message}")]
    Tls {
        /// TLS error description.
        message: String,
    },

    /// The server answered with a non-success status or malformed response.
    #[error("HTTP {status}: {message}")]
    Protocol {
        /// The HTTP status code, 0 for malformed responses.
        status: u16,
        /// Response description.
        message: String,
    },

    /// Bytes were received but the decoder rejected them.
    #[error("decode failure: {message}")]
    Decode {
        /// Decoder error description.
        message: String,
    },

    /// A disk read, write, or enumeration failed.
    #[error("I/O failure: {message}")]
    Io {
        /// I/O error description.
        message: String,
    },

    /// The caller cancelled the request.
    #[error("cancelled")]
    Cancelled,
}

/// HTTP statuses that mark a URL as not worth retrying.
const NON_RETRIABLE_STATUSES: [u16; 4] = [400, 403, 404, 410];

impl ImageError {
    /// Creates an invalid-URL error.
    #[must_use]
    pub fn invalid_url(reason: impl Into<String>) -> Self {
        Self::InvalidUrl {
            reason: reason.into(),
        }
    }

    /// Creates a network error.
    #[must_use]
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    /// Creates a TLS error.
    #[must_use]
    pub fn tls(message: impl Into<String>) -> Self {
        Self::Tls {
            message: message.into(),
        }
    }

    /// Creates a protocol error for an HTTP status.
    #[must_use]
    pub fn protocol(status: u16, message: impl Into<String>) -> Self {
        Self::Protocol {
            status,
            message: message.into(),
        }
    }

    /// Creates a decode error.
    #[must_use]
    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode {
            message: message.into(),
        }
    }

    /// Creates an I/O error.
    #[must_use]
    pub fn io(message: impl Into<String>) -> Self {
        Self::Io {
            message: message.into(),
        }
    }

    /// Classifies a transport error, separating TLS failures out of the
    /// generic network bucket.
    #[must_use]
    pub fn from_transport(error: &reqwest::Error) -> Self {
        if error.is_timeout() {
            return Self::network(format!("timed out: {error}"));
        }
        let mut source: Option<&(dyn std::error::Error + 'static)> = Some(error);
        while let Some(err) = source {
            let text = err.to_string();
            if text.contains("certificate") || text.contains("TLS") || text.contains("tls") {
                return Self::tls(text);
            }
            source = err.source();
        }
        Self::network(error.to_string())
    }

    /// Returns true when retrying the same URL could plausibly succeed.
    ///
    /// Non-retriable failures (client-error statuses, TLS) put the URL on
    /// the manager's blacklist.
    #[must_use]
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Protocol { status, .. } => !NON_RETRIABLE_STATUSES.contains(status),
            Self::Tls { .. } => false,
            _ => true,
        }
    }

    /// Returns true for caller cancellation.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl From<std::io::Error> for ImageError {
    fn from(error: std::io::Error) -> Self {
        Self::io(error.to_string())
    }
}
