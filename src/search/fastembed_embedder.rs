//! ONNX sentence encoders loaded from local bundles through fastembed.
//!
//! Nothing is downloaded. A bundle directory must already hold the ONNX file
//! and tokenizer JSONs; anything missing is reported as `EmbedderUnavailable`
//! so dispatch can fall back to the hash encoder.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use fastembed::{
    InitOptionsUserDefined, Pooling, TextEmbedding, TokenizerFiles, UserDefinedEmbeddingModel,
};

use super::embedder::{Embedder, EmbedderError, EmbedderResult, normalize_in_place};

// Standard ONNX file names: prefer the onnx/ subdir, fall back to flat.
const MODEL_ONNX_SUBDIR: &str = "onnx/model.onnx";
const MODEL_ONNX_LEGACY: &str = "model.onnx";
const TOKENIZER_JSON: &str = "tokenizer.json";
const CONFIG_JSON: &str = "config.json";
const SPECIAL_TOKENS_JSON: &str = "special_tokens_map.json";
const TOKENIZER_CONFIG_JSON: &str = "tokenizer_config.json";

/// Stable id for a bundle directory: its lowercased name plus a short hash
/// of the canonical path, so same-named bundles in different places differ.
pub(crate) fn bundle_id(model_dir: &Path, fallback: &str) -> String {
    let name = model_dir
        .file_name()
        .map(|n| n.to_string_lossy().to_lowercase())
        .unwrap_or_else(|| fallback.to_string());
    let canonical = fs::canonicalize(model_dir).unwrap_or_else(|_| model_dir.to_path_buf());
    let digest = blake3::hash(canonical.to_string_lossy().as_bytes()).to_hex();
    format!("{name}-{}", &digest[..8])
}

/// `onnx/model.onnx` if present, else `model.onnx`.
pub(crate) fn select_model_file(model_dir: &Path) -> Option<PathBuf> {
    let modern = model_dir.join(MODEL_ONNX_SUBDIR);
    if modern.is_file() {
        return Some(modern);
    }
    let legacy = model_dir.join(MODEL_ONNX_LEGACY);
    if legacy.is_file() {
        return Some(legacy);
    }
    None
}

/// Check a model directory and read the tokenizer bundle plus the ONNX bytes.
///
/// `model` names the bundle in error messages.
pub(crate) fn read_bundle(
    model_dir: &Path,
    model: &str,
) -> Result<(Vec<u8>, TokenizerFiles), String> {
    if !model_dir.is_dir() {
        return Err(format!("model directory not found: {}", model_dir.display()));
    }
    let onnx_path = select_model_file(model_dir).ok_or_else(|| {
        format!(
            "no ONNX model file in {} (checked {} and {})",
            model_dir.display(),
            MODEL_ONNX_SUBDIR,
            MODEL_ONNX_LEGACY
        )
    })?;

    let missing: Vec<&str> = [
        TOKENIZER_JSON,
        CONFIG_JSON,
        SPECIAL_TOKENS_JSON,
        TOKENIZER_CONFIG_JSON,
    ]
    .into_iter()
    .filter(|name| !model_dir.join(name).is_file())
    .collect();
    if !missing.is_empty() {
        return Err(format!(
            "model files missing in {}: {}",
            model_dir.display(),
            missing.join(", ")
        ));
    }

    let read = |path: PathBuf, label: &str| {
        fs::read(&path).map_err(|e| {
            format!(
                "unable to read {label} for {model} at {}: {e}",
                path.display()
            )
        })
    };

    let model_file = read(onnx_path, "model.onnx")?;
    let tokenizer_files = TokenizerFiles {
        tokenizer_file: read(model_dir.join(TOKENIZER_JSON), TOKENIZER_JSON)?,
        config_file: read(model_dir.join(CONFIG_JSON), CONFIG_JSON)?,
        special_tokens_map_file: read(model_dir.join(SPECIAL_TOKENS_JSON), SPECIAL_TOKENS_JSON)?,
        tokenizer_config_file: read(
            model_dir.join(TOKENIZER_CONFIG_JSON),
            TOKENIZER_CONFIG_JSON,
        )?,
    };
    Ok((model_file, tokenizer_files))
}

/// Mean-pooled ONNX encoder shared by every task that uses it.
pub struct FastEmbedder {
    model: Mutex<TextEmbedding>,
    id: String,
    dimension: Option<usize>,
}

impl FastEmbedder {
    /// Load a bundle from `model_dir` with mean pooling.
    ///
    /// The embedder id comes from `bundle_id`. When `dimension` is given
    /// every output is checked against it.
    pub fn load_from_dir(model_dir: &Path, dimension: Option<usize>) -> EmbedderResult<Self> {
        let id = bundle_id(model_dir, "onnx-embedder");

        let (model_file, tokenizer_files) = read_bundle(model_dir, &id)
            .map_err(|reason| EmbedderError::EmbedderUnavailable {
                model: id.clone(),
                reason,
            })?;

        let mut model = UserDefinedEmbeddingModel::new(model_file, tokenizer_files);
        model.pooling = Some(Pooling::Mean);

        let model = TextEmbedding::try_new_from_user_defined(model, InitOptionsUserDefined::new())
            .map_err(|e| EmbedderError::EmbedderUnavailable {
                model: id.clone(),
                reason: format!("fastembed init failed: {e}"),
            })?;

        Ok(Self {
            model: Mutex::new(model),
            id,
            dimension,
        })
    }

    fn check_dimension(&self, embedding: &[f32]) -> EmbedderResult<()> {
        match self.dimension {
            Some(expected) if expected != embedding.len() => Err(EmbedderError::EmbeddingFailed {
                model: self.id.clone(),
                reason: format!(
                    "dimension mismatch: expected {expected}, got {}",
                    embedding.len()
                ),
            }),
            _ => Ok(()),
        }
    }
}

impl Embedder for FastEmbedder {
    fn embed(&self, text: &str) -> EmbedderResult<Vec<f32>> {
        let mut batch = self.embed_batch(&[text])?;
        batch.pop().ok_or_else(|| EmbedderError::EmbeddingFailed {
            model: self.id.clone(),
            reason: "fastembed returned no embedding".to_string(),
        })
    }

    fn embed_batch(&self, texts: &[&str]) -> EmbedderResult<Vec<Vec<f32>>> {
        if texts.iter().any(|t| t.is_empty()) {
            return Err(EmbedderError::InvalidInput("empty text in batch".to_string()));
        }
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        #[allow(unused_mut)]
        let mut model = self
            .model
            .lock()
            .map_err(|_| EmbedderError::EmbeddingFailed {
                model: self.id.clone(),
                reason: "fastembed lock poisoned".to_string(),
            })?;

        let mut embeddings =
            model
                .embed(texts.to_vec(), None)
                .map_err(|e| EmbedderError::EmbeddingFailed {
                    model: self.id.clone(),
                    reason: format!("fastembed embed failed: {e}"),
                })?;

        for embedding in embeddings.iter_mut() {
            self.check_dimension(embedding)?;
            normalize_in_place(embedding);
        }
        Ok(embeddings)
    }

    fn dimension(&self) -> usize {
        self.dimension.unwrap_or(0)
    }

    fn id(&self) -> &str {
        &self.id
    }

    fn is_semantic(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_files_return_unavailable() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let err = match FastEmbedder::load_from_dir(tmp.path(), None) {
            Ok(_) => panic!("expected missing-model error"),
            Err(err) => err,
        };
        assert!(
            matches!(err, EmbedderError::EmbedderUnavailable { .. }),
            "expected EmbedderUnavailable, got {err:?}"
        );
    }

    #[test]
    fn missing_tokenizer_files_are_listed() {
        let tmp = tempfile::tempdir().expect("tempdir");
        std::fs::write(tmp.path().join("model.onnx"), b"legacy").unwrap();
        let reason = read_bundle(tmp.path(), "test").unwrap_err();
        assert!(reason.contains(TOKENIZER_JSON), "{reason}");
        assert!(reason.contains(CONFIG_JSON), "{reason}");
    }

    #[test]
    fn same_named_bundles_get_distinct_ids() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let a = tmp.path().join("a").join("MiniLM");
        let b = tmp.path().join("b").join("MiniLM");
        std::fs::create_dir_all(&a).unwrap();
        std::fs::create_dir_all(&b).unwrap();

        let id_a = bundle_id(&a, "onnx-embedder");
        let id_b = bundle_id(&b, "onnx-embedder");
        assert!(id_a.starts_with("minilm-"), "{id_a}");
        assert_ne!(id_a, id_b);
        // Different spellings of one directory share an id.
        assert_eq!(id_a, bundle_id(&tmp.path().join("a/../a/MiniLM"), "onnx-embedder"));
    }

    #[test]
    fn onnx_subdir_wins_over_flat_file() {
        let tmp = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(tmp.path().join("onnx")).unwrap();
        std::fs::write(tmp.path().join("onnx/model.onnx"), b"modern").unwrap();
        std::fs::write(tmp.path().join("model.onnx"), b"legacy").unwrap();

        let selected = select_model_file(tmp.path()).unwrap();
        assert!(
            selected.ends_with("onnx/model.onnx"),
            "picked {selected:?}"
        );
    }

    #[test]
    fn flat_model_file_is_accepted() {
        let tmp = tempfile::tempdir().expect("tempdir");
        std::fs::write(tmp.path().join("model.onnx"), b"legacy").unwrap();

        let selected = select_model_file(tmp.path()).unwrap();
        assert!(selected.ends_with("model.onnx"));
    }

    #[test]
    fn empty_dir_has_no_model_file() {
        let tmp = tempfile::tempdir().expect("tempdir");
        assert!(select_model_file(tmp.path()).is_none());
    }
}
