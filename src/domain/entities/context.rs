//! Per-request context carried through the loading pipeline.

use std::collections::HashMap;
use std::sync::Arc;

use super::{CacheKey, CacheType};
use crate::domain::ports::{ImageDecoderPort, ImageTransformerPort};

/// Replaces the canonical cache key derivation for one request.
pub type CacheKeyFilterFn = Arc<dyn Fn(&url::Url) -> CacheKey + Send + Sync>;

/// Open-ended key-value context accompanying a load request.
///
/// Recognized collaborators get typed fields; unknown entries live in
/// `extra` and are ignored by the core, available verbatim to collaborators.
#[derive(Clone, Default)]
pub struct LoadContext {
    /// Caller-defined grouping key for this operation.
    pub operation_key: Option<String>,
    /// Decoder override for this request, used for the disk read-through
    /// and for the transfer this request creates. Requests coalescing onto
    /// an in-flight transfer share the creator's decoder.
    pub decoder: Option<Arc<dyn ImageDecoderPort>>,
    /// Transformer applied to freshly downloaded images before caching.
    pub transformer: Option<Arc<dyn ImageTransformerPort>>,
    /// Custom cache key derivation.
    pub cache_key_filter: Option<CacheKeyFilterFn>,
    /// Restricts which tiers the result is written back to.
    pub store_cache_type: Option<CacheType>,
    /// Restricts which tiers are queried.
    pub query_cache_type: Option<CacheType>,
    /// Unrecognized entries, forwarded to collaborators verbatim.
    pub extra: HashMap<String, String>,
}

impl LoadContext {
    /// Derives the cache key for a URL, honoring the filter when present.
    #[must_use]
    pub fn cache_key_for(&self, url: &url::Url) -> CacheKey {
        match &self.cache_key_filter {
            Some(filter) => filter(url),
            None => CacheKey::from_url(url.as_str()),
        }
    }
}

impl std::fmt::Debug for LoadContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadContext")
            .field("operation_key", &self.operation_key)
            .field("has_decoder", &self.decoder.is_some())
            .field("has_transformer", &self.transformer.is_some())
            .field("has_cache_key_filter", &self.cache_key_filter.is_some())
            .field("store_cache_type", &self.store_cache_type)
            .field("query_cache_type", &self.query_cache_type)
            .field("extra", &self.extra)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_context_uses_canonical_key() {
        let url = url::Url::parse("http://example.com/a.png").unwrap();
        let context = LoadContext::default();
        assert_eq!(
            context.cache_key_for(&url),
            CacheKey::from_url("http://example.com/a.png")
        );
    }

    #[test]
    fn filter_overrides_key_derivation() {
        let url = url::Url::parse("http://example.com/a.png?token=x").unwrap();
        let context = LoadContext {
            cache_key_filter: Some(Arc::new(|url: &url::Url| {
                CacheKey::from_url(&url[..url::Position::AfterPath])
            })),
            ..Default::default()
        };
        assert_eq!(
            context.cache_key_for(&url),
            CacheKey::from_url("http://example.com/a.png")
        );
    }
}
