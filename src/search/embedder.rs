//! Embedder trait and types for dense retrieval.
//!
//! All encoders used by the learned family implement [`Embedder`]: a
//! synchronous `text -> vector` capability. Vectors are L2-normalized so a dot
//! product is a cosine similarity.
//!
//! # Implementations
//!
//! - **Hash embedder**: FNV-1a feature hashing (always available, configurable dimensions)
//! - **ML embedder**: FastEmbed with a local ONNX bundle
//!   (see [`crate::search::fastembed_embedder`])

use std::fmt;

use thiserror::Error;

use crate::search::tokenizer::tokenize;

/// Errors raised by an embedder.
#[derive(Debug, Error)]
pub enum EmbedderError {
    #[error("embedder {model} unavailable: {reason}")]
    EmbedderUnavailable { model: String, reason: String },

    #[error("embedding with {model} failed: {reason}")]
    EmbeddingFailed { model: String, reason: String },

    #[error("invalid embedder input: {0}")]
    InvalidInput(String),
}

pub type EmbedderResult<T> = Result<T, EmbedderError>;

/// A text encoder.
pub trait Embedder: Send + Sync {
    /// Encode one text.
    fn embed(&self, text: &str) -> EmbedderResult<Vec<f32>>;

    /// Encode many texts. The default encodes them one at a time.
    fn embed_batch(&self, texts: &[&str]) -> EmbedderResult<Vec<Vec<f32>>> {
        texts.iter().map(|t| self.embed(t)).collect()
    }

    /// Output dimension.
    fn dimension(&self) -> usize;

    /// Unique identifier, also used to key memoized corpus embeddings.
    fn id(&self) -> &str;

    /// Whether it's a semantic (ML) embedder.
    fn is_semantic(&self) -> bool;
}

/// Metadata about an embedder for display and logging.
#[derive(Debug, Clone)]
pub struct EmbedderInfo {
    pub id: String,
    pub dimension: usize,
    pub is_semantic: bool,
}

impl EmbedderInfo {
    pub fn from_embedder(embedder: &dyn Embedder) -> Self {
        Self {
            id: embedder.id().to_string(),
            dimension: embedder.dimension(),
            is_semantic: embedder.is_semantic(),
        }
    }
}

impl fmt::Display for EmbedderInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.is_semantic {
            "semantic"
        } else {
            "hashed"
        };
        write!(f, "{} ({}, {} dims)", self.id, kind, self.dimension)
    }
}

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET;
    for &b in bytes {
        hash ^= u64::from(b);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Deterministic feature-hashing embedder.
///
/// Each token (and each adjacent token pair) is hashed into one of
/// `dimension` buckets with a hash-derived sign. Not semantic, but stable
/// across runs and platforms, so results are reproducible and cacheable.
#[derive(Debug, Clone)]
pub struct HashEmbedder {
    dimension: usize,
    id: String,
}

impl HashEmbedder {
    pub fn new(dimension: usize) -> Self {
        let dimension = dimension.max(1);
        Self {
            dimension,
            id: format!("fnv1a-{dimension}"),
        }
    }

    fn add_feature(&self, vector: &mut [f32], feature: &str, weight: f32) {
        let hash = fnv1a(feature.as_bytes());
        let bucket = (hash % self.dimension as u64) as usize;
        let sign = if hash >> 63 == 0 { 1.0 } else { -1.0 };
        vector[bucket] += sign * weight;
    }
}

impl Embedder for HashEmbedder {
    fn embed(&self, text: &str) -> EmbedderResult<Vec<f32>> {
        let mut vector = vec![0.0_f32; self.dimension];
        let tokens = tokenize(text);
        for token in &tokens {
            self.add_feature(&mut vector, token, 1.0);
        }
        for pair in tokens.windows(2) {
            self.add_feature(&mut vector, &format!("{} {}", pair[0], pair[1]), 0.5);
        }
        normalize_in_place(&mut vector);
        Ok(vector)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn id(&self) -> &str {
        &self.id
    }

    fn is_semantic(&self) -> bool {
        false
    }
}

/// L2-normalize; vectors with no usable magnitude are zeroed.
pub fn normalize_in_place(embedding: &mut [f32]) {
    let norm_sq: f32 = embedding.iter().map(|x| x * x).sum();
    if norm_sq.is_finite() && norm_sq > f32::EPSILON {
        let inv_norm = 1.0 / norm_sq.sqrt();
        for v in embedding.iter_mut() {
            *v *= inv_norm;
        }
    } else {
        embedding.fill(0.0);
    }
}

/// Dot product of two equal-length vectors.
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_embedder_basic() {
        let embedder = HashEmbedder::new(256);
        let embedding = embedder.embed("hello world").unwrap();
        assert_eq!(embedding.len(), 256);
        assert_eq!(embedder.id(), "fnv1a-256");
        assert!(!embedder.is_semantic());
        let norm: f32 = embedding.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn hash_embedder_is_deterministic() {
        let embedder = HashEmbedder::new(64);
        assert_eq!(
            embedder.embed("finance in Paris").unwrap(),
            embedder.embed("finance in Paris").unwrap()
        );
    }

    #[test]
    fn shared_terms_score_higher() {
        let embedder = HashEmbedder::new(512);
        let q = embedder.embed("municipal finance budget").unwrap();
        let near = embedder.embed("the municipal budget and finance office").unwrap();
        let far = embedder.embed("river boats and bridges").unwrap();
        assert!(dot(&q, &near) > dot(&q, &far));
    }

    #[test]
    fn empty_text_is_zero_vector() {
        let embedder = HashEmbedder::new(16);
        let v = embedder.embed("").unwrap();
        assert!(v.iter().all(|&x| x == 0.0));
    }

    #[test]
    fn batch_matches_single() {
        let embedder = HashEmbedder::new(32);
        let batch = embedder.embed_batch(&["one two", "three four"]).unwrap();
        assert_eq!(batch[1], embedder.embed("three four").unwrap());
    }

    #[test]
    fn info_display() {
        let embedder = HashEmbedder::new(128);
        let info = EmbedderInfo::from_embedder(&embedder);
        let display = format!("{info}");
        assert!(display.contains("fnv1a-128"));
        assert!(display.contains("hashed"));
        assert!(display.contains("128"));
    }

    #[test]
    fn normalize_zeroes_non_finite() {
        let mut v = vec![f32::NAN, 1.0];
        normalize_in_place(&mut v);
        assert_eq!(v, vec![0.0, 0.0]);
    }
}
