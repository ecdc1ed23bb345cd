//! Search layer facade.
//!
//! This module provides the retrieval backends for clauseret:
//!
//! - **[`backend`]**: The `Backend` trait every strategy implements, plus `Family`.
//! - **[`tokenizer`]**: Tokenization shared by the lexical scorers and the hash embedder.
//! - **[`lexical`]**: BM25, TF-IDF, fuzzy and keyword scorers over a per-corpus index.
//! - **[`embedder`]**: Embedder trait for dense retrieval and the FNV-1a hash embedder.
//! - **[`fastembed_embedder`]**: FastEmbed-backed ML embedder loaded from a local bundle.
//! - **[`reranker`]**: Reranker trait for cross-encoder scoring and the overlap fallback.
//! - **[`fastembed_reranker`]**: FastEmbed-backed cross-encoder reranker.
//! - **[`dense`]**: Learned-family backends built on embedders and rerankers.

pub mod backend;
pub mod dense;
pub mod embedder;
pub mod fastembed_embedder;
pub mod fastembed_reranker;
pub mod lexical;
pub mod reranker;
pub mod tokenizer;
