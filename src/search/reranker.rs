//! Pairwise query/document scorers used by the `cross_encoder` method.
//!
//! [`FastEmbedReranker`](super::fastembed_reranker::FastEmbedReranker) runs an
//! ONNX cross-encoder bundle from disk; [`OverlapReranker`] is the
//! dependency-free scorer used when no bundle is configured.

use thiserror::Error;

use crate::search::tokenizer::distinct_terms;

#[derive(Error, Debug)]
pub enum RerankerError {
    #[error("reranker unavailable: {0}")]
    Unavailable(String),
    #[error("rerank failed: {0}")]
    RerankFailed(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

pub type RerankerResult<T> = Result<T, RerankerError>;

pub trait Reranker: Send + Sync {
    /// One score per document, in input order. Higher is more relevant.
    fn rerank(&self, query: &str, documents: &[&str]) -> RerankerResult<Vec<f32>>;

    fn id(&self) -> &str;
}

/// Scores by the Ochiai coefficient of distinct query and document terms.
#[derive(Debug, Default, Clone)]
pub struct OverlapReranker;

impl Reranker for OverlapReranker {
    fn rerank(&self, query: &str, documents: &[&str]) -> RerankerResult<Vec<f32>> {
        let query_terms = distinct_terms(query);
        if query_terms.is_empty() {
            return Err(RerankerError::InvalidInput("query has no terms".to_string()));
        }
        Ok(documents
            .iter()
            .map(|doc| {
                let doc_terms = distinct_terms(doc);
                if doc_terms.is_empty() {
                    return 0.0;
                }
                let shared = query_terms.intersection(&doc_terms).count() as f32;
                shared / ((query_terms.len() * doc_terms.len()) as f32).sqrt()
            })
            .collect())
    }

    fn id(&self) -> &str {
        "token-overlap"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlap_prefers_shared_terms() {
        let scores = OverlapReranker
            .rerank(
                "city government budget",
                &["the city government", "river cruise", "budget"],
            )
            .unwrap();
        assert_eq!(scores.len(), 3);
        assert!(scores[0] > scores[2]);
        assert!(scores[2] > scores[1]);
        assert_eq!(scores[1], 0.0);
    }

    #[test]
    fn overlap_rejects_empty_query() {
        let result = OverlapReranker.rerank("", &["doc"]);
        assert!(matches!(result, Err(RerankerError::InvalidInput(_))));
    }

    #[test]
    fn error_messages_name_the_failure() {
        assert_eq!(
            RerankerError::Unavailable("no bundle".into()).to_string(),
            "reranker unavailable: no bundle"
        );
        assert_eq!(
            RerankerError::RerankFailed("onnx".into()).to_string(),
            "rerank failed: onnx"
        );
    }
}
