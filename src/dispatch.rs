//! Method identifiers and the dispatch table.
//!
//! The set of methods is closed: [`Method`] enumerates every identifier the
//! engine understands, and [`RetrievalDispatcher`] maps each to one backend
//! instance built at startup. Resolution is a pure lookup; it never touches
//! the cache or a backend.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::RetrievalConfig;
use crate::corpus::Corpus;
use crate::model::types::{RankedDocument, sort_and_truncate};
use crate::search::backend::{Backend, BackendError, Family};
use crate::search::dense::{Candidates, CrossEncoderBackend, DenseBackend};
use crate::search::embedder::{Embedder, EmbedderInfo, HashEmbedder};
use crate::search::fastembed_embedder::FastEmbedder;
use crate::search::fastembed_reranker::FastEmbedReranker;
use crate::search::lexical::{LexicalBackend, LexicalKind};
use crate::search::reranker::{OverlapReranker, Reranker};

/// Every retrieval method the engine recognizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Method {
    Bm25,
    TfIdf,
    Fuzz,
    Flash,
    Encoder,
    Embedding,
    Dpr,
    CrossEncoder,
}

impl Method {
    pub const ALL: [Method; 8] = [
        Method::Bm25,
        Method::TfIdf,
        Method::Fuzz,
        Method::Flash,
        Method::Encoder,
        Method::Embedding,
        Method::Dpr,
        Method::CrossEncoder,
    ];

    /// Canonical identifier. Cache keys use this, not the caller's spelling.
    pub fn id(self) -> &'static str {
        match self {
            Method::Bm25 => "bm25",
            Method::TfIdf => "tfidf",
            Method::Fuzz => "fuzz",
            Method::Flash => "flash",
            Method::Encoder => "encoder",
            Method::Embedding => "embedding",
            Method::Dpr => "dpr",
            Method::CrossEncoder => "cross_encoder",
        }
    }

    pub fn aliases(self) -> &'static [&'static str] {
        match self {
            Method::Bm25 => &["lexical", "lunr"],
            Method::Fuzz => &["fuzzy"],
            Method::Encoder => &["learned"],
            Method::CrossEncoder => &["cross-encoder"],
            Method::TfIdf | Method::Flash | Method::Embedding | Method::Dpr => &[],
        }
    }

    pub fn family(self) -> Family {
        match self {
            Method::Bm25 | Method::TfIdf | Method::Fuzz | Method::Flash => Family::Lexical,
            Method::Encoder | Method::Embedding | Method::Dpr | Method::CrossEncoder => {
                Family::Learned
            }
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Method::Bm25 => "BM25 Okapi over tokenized text fields",
            Method::TfIdf => "TF-IDF cosine similarity",
            Method::Fuzz => "fuzzy term matching (normalized Levenshtein)",
            Method::Flash => "fraction of query keywords present",
            Method::Encoder => "dense similarity against every document",
            Method::Embedding => "TF-IDF candidates re-scored by dense similarity",
            Method::Dpr => "dual encoder (question and context models)",
            Method::CrossEncoder => "TF-IDF candidates re-scored by a cross-encoder",
        }
    }

    /// Parse a canonical identifier or alias, ignoring case and surrounding whitespace.
    pub fn parse(raw: &str) -> Option<Method> {
        let needle = raw.trim().to_ascii_lowercase();
        Method::ALL
            .into_iter()
            .find(|m| m.id() == needle || m.aliases().contains(&needle.as_str()))
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

impl FromStr for Method {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Method::parse(s).ok_or_else(|| DispatchError::UnsupportedMethod(s.to_string()))
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("unsupported method: {0}")]
    UnsupportedMethod(String),
}

/// Closed table from method to backend.
#[derive(Clone, Default)]
pub struct RetrievalDispatcher {
    backends: HashMap<Method, Arc<dyn Backend>>,
}

impl fmt::Debug for RetrievalDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetrievalDispatcher")
            .field("methods", &self.methods())
            .finish()
    }
}

impl RetrievalDispatcher {
    /// A table with nothing registered.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build the full table from configuration.
    ///
    /// Configured model bundles are loaded here, once. A bundle that fails to
    /// load is reported and replaced by the deterministic implementation.
    pub fn from_config(config: &RetrievalConfig) -> Self {
        let lexical = config.lexical.clone();
        let learned = &config.learned;
        let pool = learned.candidate_pool;

        let hash: Arc<dyn Embedder> = Arc::new(HashEmbedder::new(learned.hash_dimension));
        let mut loaded: HashMap<PathBuf, Arc<dyn Embedder>> = HashMap::new();
        let mut embedder_for = |dir: Option<&Path>, role: &str| -> Arc<dyn Embedder> {
            let Some(dir) = dir else {
                return hash.clone();
            };
            if let Some(existing) = loaded.get(dir) {
                return existing.clone();
            }
            match FastEmbedder::load_from_dir(dir, None) {
                Ok(embedder) => {
                    let embedder: Arc<dyn Embedder> = Arc::new(embedder);
                    info!(
                        role,
                        embedder = %EmbedderInfo::from_embedder(embedder.as_ref()),
                        "Loaded embedding model"
                    );
                    loaded.insert(dir.to_path_buf(), embedder.clone());
                    embedder
                }
                Err(err) => {
                    warn!(
                        role,
                        dir = %dir.display(),
                        error = %err,
                        "Embedding model unavailable; using hash embedder"
                    );
                    loaded.insert(dir.to_path_buf(), hash.clone());
                    hash.clone()
                }
            }
        };

        let model_dir = learned.model_dir.as_deref();
        let encoder = embedder_for(model_dir, "encoder");
        let query_encoder =
            embedder_for(learned.query_model_dir.as_deref().or(model_dir), "dpr-query");
        let context_encoder =
            embedder_for(learned.context_model_dir.as_deref().or(model_dir), "dpr-context");

        let reranker: Arc<dyn Reranker> = match learned.reranker_dir.as_deref() {
            None => Arc::new(OverlapReranker),
            Some(dir) => match FastEmbedReranker::load_from_dir(dir) {
                Ok(reranker) => {
                    info!(reranker = reranker.id(), "Loaded cross-encoder model");
                    Arc::new(reranker)
                }
                Err(err) => {
                    warn!(
                        dir = %dir.display(),
                        error = %err,
                        "Cross-encoder unavailable; using token overlap"
                    );
                    Arc::new(OverlapReranker)
                }
            },
        };

        Self::empty()
            .with_backend(
                Method::Bm25,
                Arc::new(LexicalBackend::new(LexicalKind::Bm25, lexical.clone())),
            )
            .with_backend(
                Method::TfIdf,
                Arc::new(LexicalBackend::new(LexicalKind::TfIdf, lexical.clone())),
            )
            .with_backend(
                Method::Fuzz,
                Arc::new(LexicalBackend::new(LexicalKind::Fuzzy, lexical.clone())),
            )
            .with_backend(
                Method::Flash,
                Arc::new(LexicalBackend::new(LexicalKind::Keyword, lexical)),
            )
            .with_backend(
                Method::Encoder,
                Arc::new(DenseBackend::single("encoder", encoder.clone(), Candidates::All)),
            )
            .with_backend(
                Method::Embedding,
                Arc::new(DenseBackend::single(
                    "embedding",
                    encoder,
                    Candidates::TfIdfPool(pool),
                )),
            )
            .with_backend(
                Method::Dpr,
                Arc::new(DenseBackend::dual("dpr", query_encoder, context_encoder)),
            )
            .with_backend(
                Method::CrossEncoder,
                Arc::new(CrossEncoderBackend::new(reranker, pool)),
            )
    }

    /// Register (or replace) the backend for a method.
    pub fn with_backend(mut self, method: Method, backend: Arc<dyn Backend>) -> Self {
        self.backends.insert(method, backend);
        self
    }

    /// Resolve a method string to its canonical method and backend.
    pub fn resolve(&self, method: &str) -> Result<(Method, Arc<dyn Backend>), DispatchError> {
        let parsed: Method = method.parse()?;
        self.backends
            .get(&parsed)
            .map(|backend| (parsed, backend.clone()))
            .ok_or_else(|| DispatchError::UnsupportedMethod(method.to_string()))
    }

    /// Registered methods in canonical order.
    pub fn methods(&self) -> Vec<Method> {
        Method::ALL
            .into_iter()
            .filter(|m| self.backends.contains_key(m))
            .collect()
    }
}

/// Invoke a backend and validate what it returns.
pub fn checked_invoke(
    backend: &dyn Backend,
    corpus: &Corpus,
    query: &str,
    k: usize,
) -> Result<Vec<RankedDocument>, BackendError> {
    let docs = backend.invoke(corpus, query, k)?;
    validate_output(corpus, docs, k)
}

/// Reject non-finite scores and unknown or repeated ids, then sort and truncate to `k`.
pub fn validate_output(
    corpus: &Corpus,
    mut docs: Vec<RankedDocument>,
    k: usize,
) -> Result<Vec<RankedDocument>, BackendError> {
    {
        let mut seen = HashSet::with_capacity(docs.len());
        for doc in &docs {
            if !doc.similarity.is_finite() {
                return Err(BackendError::MalformedOutput(format!(
                    "non-finite similarity for document {}",
                    doc.id
                )));
            }
            if !corpus.contains(&doc.id) {
                return Err(BackendError::MalformedOutput(format!(
                    "unknown document id {}",
                    doc.id
                )));
            }
            if !seen.insert(&doc.id) {
                return Err(BackendError::MalformedOutput(format!(
                    "duplicate document id {}",
                    doc.id
                )));
            }
        }
    }
    sort_and_truncate(&mut docs, k);
    Ok(docs)
}
