/// Offline embedders.
///
/// [`HashingEmbedder`] produces deterministic vectors by hashing identifier
/// tokens into signed buckets, so texts sharing identifiers land close to
/// each other without any model. [`FlakyEmbedder`] injects failures for
/// exercising retry and degradation paths.
use std::sync::LazyLock;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use regex::Regex;
use sha2::{Digest, Sha256};

use super::{Embedder, EmbedderError};

const STOP_WORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "defined", "do", "does", "for", "from", "how",
    "in", "is", "it", "of", "on", "or", "self", "that", "the", "this", "to", "what", "where",
    "which", "who", "why", "with",
];

static WORD: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[A-Za-z][A-Za-z0-9]*").unwrap());

/// A token-hashing embedder producing unit-length vectors.
pub struct HashingEmbedder {
    pub dimensions: usize,
}

impl HashingEmbedder {
    /// Create a new `HashingEmbedder` with the given dimensionality.
    #[must_use]
    pub fn new(dimensions: usize) -> Self {
        Self { dimensions }
    }

    /// Lowercased identifier fragments; `snake_case` and `camelCase` are split.
    pub fn tokens(&self, text: &str) -> Vec<String> {
        let mut out = Vec::new();
        for word in WORD.find_iter(text) {
            for part in split_camel(word.as_str()) {
                let lower = part.to_lowercase();
                if !STOP_WORDS.contains(&lower.as_str()) {
                    out.push(lower);
                }
            }
        }
        out
    }

    fn vectorize(&self, text: &str) -> Vec<f32> {
        let mut embedding = vec![0.0f32; self.dimensions];
        if self.dimensions == 0 {
            return embedding;
        }
        for token in self.tokens(text) {
            let hash = token_hash(&token);
            let bucket = (hash % self.dimensions as u64) as usize;
            let sign = if hash >> 63 == 0 { 1.0 } else { -1.0 };
            embedding[bucket] += sign;
        }

        // L2 normalize
        let norm_sq: f32 = embedding.iter().map(|v| v * v).sum();
        if norm_sq > 0.0 {
            let inv = 1.0 / norm_sq.sqrt();
            for v in &mut embedding {
                *v *= inv;
            }
        }
        embedding
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(384)
    }
}

/// First eight bytes of the token's SHA-256, stable across toolchains and
/// platforms so persisted vectors stay comparable.
fn token_hash(token: &str) -> u64 {
    let digest = Sha256::digest(token.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}

fn split_camel(word: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut prev_lower = false;
    for (i, c) in word.char_indices() {
        if c.is_ascii_uppercase() && prev_lower {
            parts.push(&word[start..i]);
            start = i;
        }
        prev_lower = c.is_ascii_lowercase() || c.is_ascii_digit();
    }
    parts.push(&word[start..]);
    parts
}

#[async_trait]
impl Embedder for HashingEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedderError> {
        Ok(self.vectorize(text))
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn name(&self) -> &str {
        "hashing-sha256"
    }
}

/// Wraps a [`HashingEmbedder`] and fails on demand.
pub struct FlakyEmbedder {
    inner: HashingEmbedder,
    fail_first: usize,
    fail_when_contains: Option<String>,
    error: EmbedderError,
    calls: AtomicUsize,
}

impl FlakyEmbedder {
    /// Fail the first `n` calls with `error`, then behave normally.
    pub fn failing_first(n: usize, dimensions: usize, error: EmbedderError) -> Self {
        Self {
            inner: HashingEmbedder::new(dimensions),
            fail_first: n,
            fail_when_contains: None,
            error,
            calls: AtomicUsize::new(0),
        }
    }

    /// Fail every call whose text contains `needle`.
    pub fn failing_on(needle: &str, dimensions: usize, error: EmbedderError) -> Self {
        Self {
            inner: HashingEmbedder::new(dimensions),
            fail_first: 0,
            fail_when_contains: Some(needle.to_string()),
            error,
            calls: AtomicUsize::new(0),
        }
    }

    /// Number of `embed` calls made so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Embedder for FlakyEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedderError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.fail_first {
            return Err(self.error.clone());
        }
        if let Some(needle) = &self.fail_when_contains {
            if text.contains(needle.as_str()) {
                return Err(self.error.clone());
            }
        }
        self.inner.embed(text).await
    }

    fn dimensions(&self) -> usize {
        self.inner.dimensions
    }

    fn name(&self) -> &str {
        "flaky"
    }
}
