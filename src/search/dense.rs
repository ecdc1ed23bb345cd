//! Learned family: dense encoders and cross-encoder re-scoring.
//!
//! | Method | Backend | Candidates |
//! |---|---|---|
//! | `encoder` | [`DenseBackend`], one encoder | whole corpus |
//! | `embedding` | [`DenseBackend`], one encoder | TF-IDF pool |
//! | `dpr` | [`DenseBackend`], query + context encoders | whole corpus |
//! | `cross_encoder` | [`CrossEncoderBackend`] | TF-IDF pool |
//!
//! Document vectors are computed once per (corpus, context encoder) and
//! memoized on the [`Corpus`].

use std::sync::Arc;

use tracing::debug;

use crate::corpus::{Corpus, Document};
use crate::model::types::RankedDocument;
use crate::search::backend::{Backend, BackendError, Family, ranked_from_positions};
use crate::search::embedder::{Embedder, EmbedderError, dot};
use crate::search::lexical::tfidf_candidates;
use crate::search::reranker::Reranker;

/// Documents encoded per embedder call.
const ENCODE_BATCH_SIZE: usize = 64;

/// Which documents get re-scored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Candidates {
    /// Every document in the corpus.
    All,
    /// The top `n` documents by TF-IDF.
    TfIdfPool(usize),
}

impl Candidates {
    fn positions(self, corpus: &Corpus, query: &str) -> Vec<usize> {
        match self {
            Candidates::All => (0..corpus.len()).collect(),
            Candidates::TfIdfPool(pool) => tfidf_candidates(corpus, query, pool),
        }
    }
}

/// Dense similarity between a query vector and document vectors.
pub struct DenseBackend {
    id: String,
    query_encoder: Arc<dyn Embedder>,
    context_encoder: Arc<dyn Embedder>,
    candidates: Candidates,
}

impl DenseBackend {
    /// A single encoder for both queries and documents.
    pub fn single(id: &str, encoder: Arc<dyn Embedder>, candidates: Candidates) -> Self {
        Self {
            id: id.to_string(),
            query_encoder: encoder.clone(),
            context_encoder: encoder,
            candidates,
        }
    }

    /// Separate question and context encoders (DPR).
    pub fn dual(
        id: &str,
        query_encoder: Arc<dyn Embedder>,
        context_encoder: Arc<dyn Embedder>,
    ) -> Self {
        Self {
            id: id.to_string(),
            query_encoder,
            context_encoder,
            candidates: Candidates::All,
        }
    }
}

impl Backend for DenseBackend {
    fn id(&self) -> &str {
        &self.id
    }

    fn family(&self) -> Family {
        Family::Learned
    }

    fn invoke(
        &self,
        corpus: &Corpus,
        query: &str,
        k: usize,
    ) -> Result<Vec<RankedDocument>, BackendError> {
        if query.trim().is_empty() {
            return Err(BackendError::InvalidInput("empty query".to_string()));
        }
        let positions = self.candidates.positions(corpus, query);
        if positions.is_empty() {
            return Ok(Vec::new());
        }

        let context = self.context_encoder.as_ref();
        let doc_vectors = corpus
            .document_embeddings(context.id(), |docs| {
                encode_documents(context, docs).map_err(|e| e.to_string())
            })
            .map_err(|reason| EmbedderError::EmbeddingFailed {
                model: context.id().to_string(),
                reason,
            })?;
        let query_vector = self.query_encoder.embed(query)?;

        let mut scores = Vec::with_capacity(positions.len());
        for pos in positions {
            let doc_vector = &doc_vectors[pos];
            if doc_vector.len() != query_vector.len() {
                return Err(BackendError::Internal(format!(
                    "dimension mismatch: query {} vs document {} ({} / {})",
                    query_vector.len(),
                    doc_vector.len(),
                    self.query_encoder.id(),
                    context.id()
                )));
            }
            scores.push((pos, dot(&query_vector, doc_vector)));
        }
        Ok(ranked_from_positions(corpus, scores, k))
    }
}

/// Encode every document in batches. Documents without text get zero vectors.
fn encode_documents(
    encoder: &dyn Embedder,
    docs: &[Document],
) -> Result<Vec<Vec<f32>>, EmbedderError> {
    let with_text: Vec<usize> = (0..docs.len())
        .filter(|&i| !docs[i].text.trim().is_empty())
        .collect();

    let mut encoded: Vec<Option<Vec<f32>>> = vec![None; docs.len()];
    for chunk in with_text.chunks(ENCODE_BATCH_SIZE) {
        let texts: Vec<&str> = chunk.iter().map(|&i| docs[i].text.as_str()).collect();
        let vectors = encoder.embed_batch(&texts)?;
        if vectors.len() != texts.len() {
            return Err(EmbedderError::EmbeddingFailed {
                model: encoder.id().to_string(),
                reason: format!("expected {} vectors, got {}", texts.len(), vectors.len()),
            });
        }
        for (&i, vector) in chunk.iter().zip(vectors) {
            encoded[i] = Some(vector);
        }
    }

    let dimension = encoded
        .iter()
        .flatten()
        .map(Vec::len)
        .next()
        .unwrap_or_else(|| encoder.dimension());
    debug!(
        encoder = encoder.id(),
        encoded = with_text.len(),
        empty = docs.len() - with_text.len(),
        "Encoded corpus documents"
    );
    Ok(encoded
        .into_iter()
        .map(|v| v.unwrap_or_else(|| vec![0.0; dimension]))
        .collect())
}

/// Cross-encoder scoring of lexical candidates.
pub struct CrossEncoderBackend {
    reranker: Arc<dyn Reranker>,
    pool: usize,
}

impl CrossEncoderBackend {
    pub fn new(reranker: Arc<dyn Reranker>, pool: usize) -> Self {
        Self { reranker, pool }
    }
}

impl Backend for CrossEncoderBackend {
    fn id(&self) -> &str {
        "cross_encoder"
    }

    fn family(&self) -> Family {
        Family::Learned
    }

    fn invoke(
        &self,
        corpus: &Corpus,
        query: &str,
        k: usize,
    ) -> Result<Vec<RankedDocument>, BackendError> {
        if query.trim().is_empty() {
            return Err(BackendError::InvalidInput("empty query".to_string()));
        }
        let positions = tfidf_candidates(corpus, query, self.pool);
        if positions.is_empty() {
            return Ok(Vec::new());
        }
        let texts: Vec<&str> = positions
            .iter()
            .map(|&pos| corpus.documents()[pos].text.as_str())
            .collect();
        let scores = self.reranker.rerank(query, &texts)?;
        if scores.len() != positions.len() {
            return Err(BackendError::MalformedOutput(format!(
                "reranker {} returned {} scores for {} documents",
                self.reranker.id(),
                scores.len(),
                positions.len()
            )));
        }
        Ok(ranked_from_positions(
            corpus,
            positions.into_iter().zip(scores),
            k,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::types::RecordId;
    use crate::search::embedder::{EmbedderResult, HashEmbedder};
    use crate::search::reranker::OverlapReranker;

    fn paris() -> Corpus {
        Corpus::from_documents(
            vec![
                Document::new(1, "Paris is the financial centre of France with many banks"),
                Document::new(2, "The government of Paris sits at the Hotel de Ville"),
                Document::new(3, "Paris hosts museums such as the Louvre"),
            ],
            &["text".to_string()],
        )
        .unwrap()
    }

    #[test]
    fn encoder_scores_whole_corpus() {
        let backend = DenseBackend::single(
            "encoder",
            Arc::new(HashEmbedder::new(512)),
            Candidates::All,
        );
        let hits = backend.invoke(&paris(), "government of Paris", 3).unwrap();
        assert_eq!(hits.len(), 3);
        assert_eq!(hits[0].id, RecordId::Int(2));
        assert!(hits[0].similarity >= hits[1].similarity);
    }

    #[test]
    fn embedding_only_scores_lexical_candidates() {
        let backend = DenseBackend::single(
            "embedding",
            Arc::new(HashEmbedder::new(512)),
            Candidates::TfIdfPool(100),
        );
        let hits = backend.invoke(&paris(), "Louvre museums", 3).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, RecordId::Int(3));
    }

    #[test]
    fn empty_query_is_rejected() {
        let backend =
            DenseBackend::single("encoder", Arc::new(HashEmbedder::new(8)), Candidates::All);
        assert!(matches!(
            backend.invoke(&paris(), "  ", 3),
            Err(BackendError::InvalidInput(_))
        ));
    }

    struct FixedDim(usize, &'static str);

    impl Embedder for FixedDim {
        fn embed(&self, _text: &str) -> EmbedderResult<Vec<f32>> {
            Ok(vec![1.0; self.0])
        }
        fn dimension(&self) -> usize {
            self.0
        }
        fn id(&self) -> &str {
            self.1
        }
        fn is_semantic(&self) -> bool {
            false
        }
    }

    #[test]
    fn dual_encoder_dimension_mismatch_fails() {
        let backend = DenseBackend::dual(
            "dpr",
            Arc::new(FixedDim(4, "q4")),
            Arc::new(FixedDim(8, "c8")),
        );
        let err = backend.invoke(&paris(), "Paris", 2).unwrap_err();
        assert!(err.to_string().contains("dimension mismatch"));
    }

    #[test]
    fn documents_without_text_get_zero_vectors() {
        let corpus = Corpus::from_documents(
            vec![Document::new(1, ""), Document::new(2, "city hall")],
            &["text".to_string()],
        )
        .unwrap();
        let backend =
            DenseBackend::single("encoder", Arc::new(HashEmbedder::new(64)), Candidates::All);
        let hits = backend.invoke(&corpus, "city hall", 2).unwrap();
        assert_eq!(hits[0].id, RecordId::Int(2));
        assert_eq!(hits[1].similarity, 0.0);
    }

    #[test]
    fn cross_encoder_reranks_candidates() {
        let backend = CrossEncoderBackend::new(Arc::new(OverlapReranker), 100);
        let hits = backend.invoke(&paris(), "government of Paris", 2).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id, RecordId::Int(2));
    }

    #[test]
    fn cross_encoder_without_candidates_is_empty() {
        let backend = CrossEncoderBackend::new(Arc::new(OverlapReranker), 100);
        assert!(backend.invoke(&paris(), "zebra", 2).unwrap().is_empty());
    }
}
