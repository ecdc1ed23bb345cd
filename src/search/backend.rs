//! The uniform retrieval backend contract.
//!
//! Every strategy, lexical or learned, ranks the documents of a [`Corpus`]
//! against a query and returns at most `k` hits. The orchestrator never looks
//! inside a backend; it only sees this trait.

use std::fmt;

use thiserror::Error;

use crate::corpus::Corpus;
use crate::model::types::{RankedDocument, sort_and_truncate};
use crate::search::embedder::EmbedderError;
use crate::search::reranker::RerankerError;

/// Backend families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    /// Works on raw text, no model state.
    Lexical,
    /// Needs an encode or score step backed by a model.
    Learned,
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Family::Lexical => write!(f, "lexical"),
            Family::Learned => write!(f, "learned"),
        }
    }
}

/// Errors raised by a backend invocation.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error(transparent)]
    Embedding(#[from] EmbedderError),

    #[error(transparent)]
    Rerank(#[from] RerankerError),

    #[error("invalid backend input: {0}")]
    InvalidInput(String),

    #[error("malformed backend output: {0}")]
    MalformedOutput(String),

    #[error("backend error: {0}")]
    Internal(String),
}

/// A retrieval strategy.
///
/// Implementations must be `Send + Sync`: one instance serves every worker,
/// and an invocation may be abandoned on a background thread after its
/// deadline passes.
pub trait Backend: Send + Sync {
    /// Stable identifier for logging.
    fn id(&self) -> &str;

    fn family(&self) -> Family;

    /// Rank `corpus` against `query`, returning at most `k` documents.
    fn invoke(
        &self,
        corpus: &Corpus,
        query: &str,
        k: usize,
    ) -> Result<Vec<RankedDocument>, BackendError>;
}

/// Turn `(document position, score)` pairs into a ranked, truncated list.
pub(crate) fn ranked_from_positions(
    corpus: &Corpus,
    scores: impl IntoIterator<Item = (usize, f32)>,
    k: usize,
) -> Vec<RankedDocument> {
    let docs = corpus.documents();
    let mut ranked: Vec<RankedDocument> = scores
        .into_iter()
        .filter_map(|(pos, score)| {
            docs.get(pos).map(|doc| RankedDocument {
                id: doc.id.clone(),
                similarity: score,
            })
        })
        .collect();
    sort_and_truncate(&mut ranked, k);
    ranked
}
