//! Content hashing for integrity pinning and cache keys.
//!
//! Source text is addressed by its SHA-256 digest. The same digest doubles
//! as the compiled-artifact cache key, so identical source can never
//! compile twice concurrently.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Lowercase hex-encoded SHA-256 digest of strategy source text.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentHash(String);

impl ContentHash {
    /// Digest of the given source text.
    pub fn of(source: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(source.as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    /// Wrap a digest that was stored elsewhere. Normalized to lowercase so
    /// comparisons are casing-independent.
    pub fn from_hex(digest: impl Into<String>) -> Self {
        Self(digest.into().to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Abbreviated digest for log lines.
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl std::fmt::Display for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Recomputes digests and compares them against pinned values.
pub struct IntegrityVerifier;

impl IntegrityVerifier {
    pub fn compute(source: &str) -> ContentHash {
        ContentHash::of(source)
    }

    /// True when the source still hashes to the pinned digest.
    pub fn matches(source: &str, expected: &ContentHash) -> bool {
        ContentHash::of(source) == *expected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn digest_is_deterministic() {
        let a = ContentHash::of("(module)");
        let b = ContentHash::of("(module)");
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);
    }

    #[test]
    fn casing_is_normalized() {
        let lower = ContentHash::of("abc");
        let upper = ContentHash::from_hex(lower.as_str().to_uppercase());
        assert_eq!(lower, upper);
    }

    #[test]
    fn verifier_rejects_tampered_source() {
        let pinned = ContentHash::of("(module (func $f))");
        assert!(IntegrityVerifier::matches("(module (func $f))", &pinned));
        assert!(!IntegrityVerifier::matches("(module (func $g))", &pinned));
    }

    proptest! {
        #[test]
        fn distinct_sources_rarely_collide(a in ".{0,64}", b in ".{0,64}") {
            prop_assume!(a != b);
            prop_assert_ne!(ContentHash::of(&a), ContentHash::of(&b));
        }

        #[test]
        fn digest_survives_round_trip(source in ".{0,128}") {
            let hash = ContentHash::of(&source);
            let json = serde_json::to_string(&hash).unwrap();
            let back: ContentHash = serde_json::from_str(&json).unwrap();
            prop_assert_eq!(hash, back);
        }
    }
}
