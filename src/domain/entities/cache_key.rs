//! Cache key derivation.

use md5::{Digest, Md5};

/// Stable, filesystem-safe identifier for a cached image.
///
/// The canonical derivation is the lowercase hexadecimal encoding of the
/// 128-bit md5 digest of the source URL, which doubles as the on-disk file
/// name. Two URLs yielding the same key refer to the same cached object.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    /// Creates a key from an already-derived string.
    ///
    /// Used by custom key filters; the string must be filesystem-safe.
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Derives the canonical key for a URL.
    #[must_use]
    pub fn from_url(url: &str) -> Self {
        let mut hasher = Md5::new();
        hasher.update(url.as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    /// Returns the inner string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Derives the key a transformed variant of this image is stored under.
    #[must_use]
    pub fn with_transformer(&self, transformer_key: &str) -> Self {
        Self(format!("{}-{transformer_key}", self.0))
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for CacheKey {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for CacheKey {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derivation_is_deterministic() {
        let a = CacheKey::from_url("http://example.com/a.png");
        let b = CacheKey::from_url("http://example.com/a.png");
        assert_eq!(a, b);
    }

    #[test]
    fn derivation_matches_md5_hex() {
        // Fixed md5 vectors.
        assert_eq!(
            CacheKey::from_url("").as_str(),
            "d41d8cd98f00b204e9800998ecf8427e"
        );
        assert_eq!(
            CacheKey::from_url("abc").as_str(),
            "900150983cd24fb0d6963f7d28e17f72"
        );
    }

    #[test]
    fn key_is_filesystem_safe() {
        let key = CacheKey::from_url("https://example.com/path?query=1&x=/../");
        assert_eq!(key.as_str().len(), 32);
        assert!(key.as_str().chars().all(|c| c.is_ascii_hexdigit()));
        assert!(!key.as_str().chars().any(|c| c.is_ascii_uppercase()));
    }

    #[test]
    fn distinct_urls_get_distinct_keys() {
        let a = CacheKey::from_url("http://example.com/a.png");
        let b = CacheKey::from_url("http://example.com/b.png");
        assert_ne!(a, b);
    }

    #[test]
    fn transformer_key_is_appended() {
        let key = CacheKey::new("abcd");
        assert_eq!(key.with_transformer("thumb").as_str(), "abcd-thumb");
    }
}
