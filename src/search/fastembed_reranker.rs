//! FastEmbed-based cross-encoder reranker (e.g. ms-marco-MiniLM-L-6-v2).
//!
//! Same bundle layout and no-download policy as
//! [`crate::search::fastembed_embedder`].

use std::path::Path;
use std::sync::Mutex;

use fastembed::{RerankInitOptionsUserDefined, TextRerank, UserDefinedRerankingModel};

use super::fastembed_embedder::{bundle_id, read_bundle};
use super::reranker::{Reranker, RerankerError, RerankerResult};

pub struct FastEmbedReranker {
    model: Mutex<TextRerank>,
    id: String,
}

impl FastEmbedReranker {
    pub fn load_from_dir(model_dir: &Path) -> RerankerResult<Self> {
        let id = bundle_id(model_dir, "onnx-reranker");

        let (model_file, tokenizer_files) =
            read_bundle(model_dir, &id).map_err(RerankerError::Unavailable)?;

        let model = UserDefinedRerankingModel::new(model_file, tokenizer_files);
        let model =
            TextRerank::try_new_from_user_defined(model, RerankInitOptionsUserDefined::default())
                .map_err(|e| RerankerError::Unavailable(format!("fastembed init failed: {e}")))?;

        Ok(Self {
            model: Mutex::new(model),
            id,
        })
    }
}

impl Reranker for FastEmbedReranker {
    fn rerank(&self, query: &str, documents: &[&str]) -> RerankerResult<Vec<f32>> {
        if query.is_empty() {
            return Err(RerankerError::InvalidInput("empty query".to_string()));
        }
        if documents.is_empty() {
            return Ok(Vec::new());
        }

        #[allow(unused_mut)]
        let mut model = self
            .model
            .lock()
            .map_err(|_| RerankerError::RerankFailed("fastembed lock poisoned".to_string()))?;

        let results = model
            .rerank(query, documents.to_vec(), false, None)
            .map_err(|e| RerankerError::RerankFailed(format!("fastembed rerank failed: {e}")))?;

        let mut scores = vec![f32::NAN; documents.len()];
        for result in results {
            if let Some(slot) = scores.get_mut(result.index) {
                *slot = result.score;
            }
        }
        if scores.iter().any(|s| s.is_nan()) {
            return Err(RerankerError::RerankFailed(
                "fastembed returned fewer scores than documents".to_string(),
            ));
        }
        Ok(scores)
    }

    fn id(&self) -> &str {
        &self.id
    }
}
