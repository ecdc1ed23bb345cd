//! Lexical family: scorers that read raw document text.
//!
//! All four strategies share one [`LexicalIndex`] per corpus, built lazily the
//! first time any of them runs.
//!
//! - **bm25**: BM25 Okapi with configurable `k1` / `b`.
//! - **tfidf**: cosine similarity of log-tf × smoothed-idf vectors.
//! - **fuzz**: per-term best normalized Levenshtein similarity, averaged.
//! - **flash**: fraction of distinct query keywords found in the document.

use std::collections::{HashMap, HashSet};

use crate::config::LexicalConfig;
use crate::corpus::{Corpus, Document};
use crate::model::types::RankedDocument;
use crate::search::backend::{Backend, BackendError, Family, ranked_from_positions};
use crate::search::tokenizer::tokenize;

/// Term statistics for one corpus.
#[derive(Debug, Default)]
pub struct LexicalIndex {
    term_freqs: Vec<HashMap<String, u32>>,
    doc_lengths: Vec<u32>,
    doc_freq: HashMap<String, u32>,
    avg_doc_length: f32,
    tfidf_norms: Vec<f32>,
}

impl LexicalIndex {
    pub fn build(documents: &[Document]) -> Self {
        let mut term_freqs = Vec::with_capacity(documents.len());
        let mut doc_lengths = Vec::with_capacity(documents.len());
        let mut doc_freq: HashMap<String, u32> = HashMap::new();

        for doc in documents {
            let tokens = tokenize(&doc.text);
            doc_lengths.push(tokens.len() as u32);
            let mut tf: HashMap<String, u32> = HashMap::new();
            for token in tokens {
                *tf.entry(token).or_insert(0) += 1;
            }
            for term in tf.keys() {
                *doc_freq.entry(term.clone()).or_insert(0) += 1;
            }
            term_freqs.push(tf);
        }

        let total: u64 = doc_lengths.iter().map(|&l| u64::from(l)).sum();
        let avg_doc_length = if documents.is_empty() {
            0.0
        } else {
            total as f32 / documents.len() as f32
        };

        let mut index = Self {
            term_freqs,
            doc_lengths,
            doc_freq,
            avg_doc_length,
            tfidf_norms: Vec::new(),
        };
        index.tfidf_norms = index
            .term_freqs
            .iter()
            .map(|tf| {
                tf.iter()
                    .map(|(term, &count)| {
                        let w = tf_weight(count) * index.idf(term);
                        w * w
                    })
                    .sum::<f32>()
                    .sqrt()
            })
            .collect();
        index
    }

    pub fn doc_count(&self) -> usize {
        self.term_freqs.len()
    }

    /// Smoothed idf: `ln((1 + N) / (1 + df)) + 1`.
    fn idf(&self, term: &str) -> f32 {
        let n = self.doc_count() as f32;
        let df = self.doc_freq.get(term).copied().unwrap_or(0) as f32;
        ((1.0 + n) / (1.0 + df)).ln() + 1.0
    }

    /// BM25 Okapi scores. Only documents with a positive score are returned.
    pub fn bm25(&self, query: &str, k1: f32, b: f32) -> Vec<(usize, f32)> {
        let query_terms: HashSet<String> = tokenize(query).into_iter().collect();
        if query_terms.is_empty() || self.doc_count() == 0 {
            return Vec::new();
        }
        let n = self.doc_count() as f32;
        let avgdl = self.avg_doc_length.max(f32::EPSILON);

        let mut scores: HashMap<usize, f32> = HashMap::new();
        for term in &query_terms {
            let Some(&df) = self.doc_freq.get(term) else {
                continue;
            };
            let df = df as f32;
            // IDF: log((N - df + 0.5) / (df + 0.5) + 1)
            let idf = ((n - df + 0.5) / (df + 0.5) + 1.0).ln();
            for (pos, tf) in self.term_freqs.iter().enumerate() {
                let Some(&count) = tf.get(term) else {
                    continue;
                };
                let tf = count as f32;
                let dl = self.doc_lengths[pos] as f32;
                let tf_norm = (tf * (k1 + 1.0)) / (tf + k1 * (1.0 - b + b * dl / avgdl));
                *scores.entry(pos).or_insert(0.0) += idf * tf_norm;
            }
        }
        scores.into_iter().filter(|&(_, s)| s > 0.0).collect()
    }

    /// TF-IDF cosine similarity. Only documents sharing a term are returned.
    pub fn tfidf(&self, query: &str) -> Vec<(usize, f32)> {
        let mut query_tf: HashMap<String, u32> = HashMap::new();
        for token in tokenize(query) {
            *query_tf.entry(token).or_insert(0) += 1;
        }
        if query_tf.is_empty() {
            return Vec::new();
        }
        let query_weights: HashMap<&str, f32> = query_tf
            .iter()
            .map(|(term, &count)| (term.as_str(), tf_weight(count) * self.idf(term)))
            .collect();
        let query_norm = query_weights.values().map(|w| w * w).sum::<f32>().sqrt();
        if query_norm <= f32::EPSILON {
            return Vec::new();
        }

        self.term_freqs
            .iter()
            .enumerate()
            .filter_map(|(pos, tf)| {
                let dot: f32 = query_weights
                    .iter()
                    .filter_map(|(term, qw)| {
                        tf.get(*term)
                            .map(|&count| qw * tf_weight(count) * self.idf(term))
                    })
                    .sum();
                let norm = self.tfidf_norms[pos];
                (dot > 0.0 && norm > f32::EPSILON).then(|| (pos, dot / (query_norm * norm)))
            })
            .collect()
    }

    /// Average over query terms of the best normalized Levenshtein similarity
    /// to any document term.
    pub fn fuzzy(&self, query: &str) -> Vec<(usize, f32)> {
        let query_terms: Vec<String> = {
            let mut seen = HashSet::new();
            tokenize(query)
                .into_iter()
                .filter(|t| seen.insert(t.clone()))
                .collect()
        };
        if query_terms.is_empty() {
            return Vec::new();
        }
        self.term_freqs
            .iter()
            .enumerate()
            .filter_map(|(pos, tf)| {
                if tf.is_empty() {
                    return None;
                }
                let total: f64 = query_terms
                    .iter()
                    .map(|q| {
                        tf.keys()
                            .map(|d| strsim::normalized_levenshtein(q, d))
                            .fold(0.0_f64, f64::max)
                    })
                    .sum();
                let score = (total / query_terms.len() as f64) as f32;
                (score > 0.0).then_some((pos, score))
            })
            .collect()
    }

    /// Fraction of distinct query keywords present in each document.
    pub fn keyword_match(&self, query: &str) -> Vec<(usize, f32)> {
        let keywords: HashSet<String> = tokenize(query).into_iter().collect();
        if keywords.is_empty() {
            return Vec::new();
        }
        self.term_freqs
            .iter()
            .enumerate()
            .filter_map(|(pos, tf)| {
                let found = keywords.iter().filter(|k| tf.contains_key(*k)).count();
                (found > 0).then(|| (pos, found as f32 / keywords.len() as f32))
            })
            .collect()
    }
}

fn tf_weight(count: u32) -> f32 {
    if count == 0 {
        0.0
    } else {
        1.0 + (count as f32).ln()
    }
}

/// Which lexical scorer a [`LexicalBackend`] runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LexicalKind {
    Bm25,
    TfIdf,
    Fuzzy,
    Keyword,
}

/// A lexical strategy bound to its scoring parameters.
pub struct LexicalBackend {
    kind: LexicalKind,
    params: LexicalConfig,
}

impl LexicalBackend {
    pub fn new(kind: LexicalKind, params: LexicalConfig) -> Self {
        Self { kind, params }
    }

    /// Raw scores for every matching document position.
    pub fn scores(&self, corpus: &Corpus, query: &str) -> Vec<(usize, f32)> {
        let index = corpus.lexical_index();
        match self.kind {
            LexicalKind::Bm25 => index.bm25(query, self.params.bm25_k1, self.params.bm25_b),
            LexicalKind::TfIdf => index.tfidf(query),
            LexicalKind::Fuzzy => index.fuzzy(query),
            LexicalKind::Keyword => index.keyword_match(query),
        }
    }
}

impl Backend for LexicalBackend {
    fn id(&self) -> &str {
        match self.kind {
            LexicalKind::Bm25 => "bm25",
            LexicalKind::TfIdf => "tfidf",
            LexicalKind::Fuzzy => "fuzz",
            LexicalKind::Keyword => "flash",
        }
    }

    fn family(&self) -> Family {
        Family::Lexical
    }

    fn invoke(
        &self,
        corpus: &Corpus,
        query: &str,
        k: usize,
    ) -> Result<Vec<RankedDocument>, BackendError> {
        Ok(ranked_from_positions(corpus, self.scores(corpus, query), k))
    }
}

/// Top `pool` document positions by TF-IDF, used as candidates by re-scoring methods.
pub fn tfidf_candidates(corpus: &Corpus, query: &str, pool: usize) -> Vec<usize> {
    let mut scored = corpus.lexical_index().tfidf(query);
    scored.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| corpus.documents()[a.0].id.cmp(&corpus.documents()[b.0].id))
    });
    scored.truncate(pool);
    scored.into_iter().map(|(pos, _)| pos).collect()
}
