//! Corpus and clause loading.
//!
//! A corpus is a JSON array of objects, each carrying a unique `id` and one or
//! more text fields. The fields that are searched are chosen by the caller
//! (`on`); their values are joined into a single searchable text per document.
//!
//! Loading is the only fatal step of a run: any problem here aborts before a
//! single task is scheduled.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::model::types::{Clause, RecordId};
use crate::search::lexical::LexicalIndex;

/// Upstream stages report skipped uploads by passing this message where a
/// path is expected.
pub const UPSTREAM_SKIP_PREFIX: &str = "Skipping unsupported file format:";

/// Whether a path argument is actually an upstream "skipped file" message.
pub fn is_upstream_skip_message(arg: &str) -> bool {
    arg.trim_start().starts_with(UPSTREAM_SKIP_PREFIX)
}

/// Errors raised while loading a corpus or a clause file.
#[derive(Error, Debug)]
pub enum CorpusError {
    #[error("file not found: {0}")]
    NotFound(PathBuf),

    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid JSON in {origin}: {source}")]
    Json {
        origin: String,
        source: serde_json::Error,
    },

    #[error("invalid structure: {0}")]
    Structure(String),

    #[error("duplicate document id: {0}")]
    DuplicateId(RecordId),
}

/// One searchable document.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: RecordId,
    /// Configured text fields joined with a single space.
    pub text: String,
}

impl Document {
    pub fn new(id: impl Into<RecordId>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
        }
    }
}

type DenseSlot = Arc<OnceLock<Result<Arc<Vec<Vec<f32>>>, String>>>;

/// The fixed document collection a batch runs against.
///
/// Read-only once built. Derived indexes are computed at most once and shared
/// by every task over the same corpus.
pub struct Corpus {
    documents: Vec<Document>,
    fields: Vec<String>,
    digest: String,
    positions: HashMap<RecordId, usize>,
    lexical: OnceLock<LexicalIndex>,
    dense: Mutex<HashMap<String, DenseSlot>>,
}

impl std::fmt::Debug for Corpus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Corpus")
            .field("documents", &self.documents.len())
            .field("fields", &self.fields)
            .field("digest", &self.digest)
            .finish()
    }
}

impl Corpus {
    /// Load a corpus file, searching the given text fields.
    pub fn load(path: &Path, fields: &[String]) -> Result<Self, CorpusError> {
        if !path.exists() {
            return Err(CorpusError::NotFound(path.to_path_buf()));
        }
        let bytes = std::fs::read(path).map_err(|source| CorpusError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let corpus = Self::from_slice(&bytes, fields, &path.display().to_string())?;
        info!(
            path = %path.display(),
            documents = corpus.len(),
            fields = ?corpus.fields,
            "Loaded corpus"
        );
        Ok(corpus)
    }

    /// Parse a corpus from raw JSON bytes. `origin` names the source in errors.
    pub fn from_slice(bytes: &[u8], fields: &[String], origin: &str) -> Result<Self, CorpusError> {
        let value: Value = serde_json::from_slice(bytes).map_err(|source| CorpusError::Json {
            origin: origin.to_string(),
            source,
        })?;
        let items = value.as_array().ok_or_else(|| {
            CorpusError::Structure(format!("{origin}: expected a JSON array of documents"))
        })?;

        let mut documents = Vec::with_capacity(items.len());
        for (idx, item) in items.iter().enumerate() {
            let object = item.as_object().ok_or_else(|| {
                CorpusError::Structure(format!("{origin}: document #{idx} is not an object"))
            })?;
            let id = object
                .get("id")
                .and_then(RecordId::from_json)
                .ok_or_else(|| {
                    CorpusError::Structure(format!(
                        "{origin}: document #{idx} has no integer or string `id`"
                    ))
                })?;
            let text = fields
                .iter()
                .filter_map(|field| object.get(field).and_then(field_text))
                .filter(|t| !t.is_empty())
                .collect::<Vec<_>>()
                .join(" ");
            documents.push(Document { id, text });
        }

        let mut hasher = blake3::Hasher::new();
        hasher.update(bytes);
        Self::build(documents, fields, hasher)
    }

    /// Build a corpus from already-extracted documents.
    pub fn from_documents(
        documents: Vec<Document>,
        fields: &[String],
    ) -> Result<Self, CorpusError> {
        let mut hasher = blake3::Hasher::new();
        for doc in &documents {
            hasher.update(doc.id.to_string().as_bytes());
            hasher.update(&[0]);
            hasher.update(doc.text.as_bytes());
            hasher.update(&[0]);
        }
        Self::build(documents, fields, hasher)
    }

    fn build(
        documents: Vec<Document>,
        fields: &[String],
        mut hasher: blake3::Hasher,
    ) -> Result<Self, CorpusError> {
        let mut positions = HashMap::with_capacity(documents.len());
        for (idx, doc) in documents.iter().enumerate() {
            if positions.insert(doc.id.clone(), idx).is_some() {
                return Err(CorpusError::DuplicateId(doc.id.clone()));
            }
        }
        for field in fields {
            hasher.update(b"\x1ffield:");
            hasher.update(field.as_bytes());
        }
        let digest = hasher.finalize().to_hex().to_string();
        let empty = documents.iter().filter(|d| d.text.is_empty()).count();
        if empty > 0 {
            debug!(empty, "documents without text in the configured fields");
        }
        Ok(Self {
            documents,
            fields: fields.to_vec(),
            digest,
            positions,
            lexical: OnceLock::new(),
            dense: Mutex::new(HashMap::new()),
        })
    }

    pub fn documents(&self) -> &[Document] {
        &self.documents
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    /// Content digest of the corpus and the searched fields.
    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub fn contains(&self, id: &RecordId) -> bool {
        self.positions.contains_key(id)
    }

    pub fn position(&self, id: &RecordId) -> Option<usize> {
        self.positions.get(id).copied()
    }

    /// Tokenized term statistics, built on first use.
    pub fn lexical_index(&self) -> &LexicalIndex {
        self.lexical.get_or_init(|| LexicalIndex::build(&self.documents))
    }

    /// Document embeddings for one encoder, computed at most once per encoder id.
    ///
    /// A failed computation is remembered too, so every task on this corpus
    /// sees the same failure instead of recomputing it.
    pub fn document_embeddings<F>(
        &self,
        encoder_id: &str,
        compute: F,
    ) -> Result<Arc<Vec<Vec<f32>>>, String>
    where
        F: FnOnce(&[Document]) -> Result<Vec<Vec<f32>>, String>,
    {
        let slot = {
            let mut dense = self.dense.lock();
            dense.entry(encoder_id.to_string()).or_default().clone()
        };
        slot.get_or_init(|| {
            debug!(encoder = encoder_id, documents = self.len(), "Encoding corpus");
            compute(&self.documents).map(Arc::new)
        })
        .clone()
    }
}

fn field_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Array(items) => {
            let parts: Vec<String> = items.iter().filter_map(field_text).collect();
            Some(parts.join(" "))
        }
        Value::Null | Value::Object(_) => None,
    }
}

/// Fallback clause text fields tried after the configured one.
const CLAUSE_FIELD_FALLBACKS: &[&str] = &["Clause", "clause", "text"];

/// Load clauses from a JSON file.
///
/// Accepts an array of `{id, <field>}` objects or an object keyed by clause id.
pub fn load_clauses(path: &Path, clause_field: &str) -> Result<Vec<Clause>, CorpusError> {
    if !path.exists() {
        return Err(CorpusError::NotFound(path.to_path_buf()));
    }
    let content = std::fs::read_to_string(path).map_err(|source| CorpusError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let value: Value = serde_json::from_str(&content).map_err(|source| CorpusError::Json {
        origin: path.display().to_string(),
        source,
    })?;
    let clauses = parse_clauses(&value, clause_field)?;
    reject_key_collisions(&clauses)?;
    info!(path = %path.display(), clauses = clauses.len(), "Loaded clauses");
    Ok(clauses)
}

/// Interpret a parsed clauses document.
pub fn parse_clauses(value: &Value, clause_field: &str) -> Result<Vec<Clause>, CorpusError> {
    match value {
        Value::Array(items) => items
            .iter()
            .enumerate()
            .map(|(idx, item)| {
                let object = item.as_object().ok_or_else(|| {
                    CorpusError::Structure(format!("clause #{idx} is not an object"))
                })?;
                let id = object
                    .get("id")
                    .and_then(RecordId::from_json)
                    .ok_or_else(|| {
                        CorpusError::Structure(format!(
                            "clause #{idx} has no integer or string `id`"
                        ))
                    })?;
                let text = clause_text(object, clause_field).ok_or_else(|| {
                    CorpusError::Structure(format!("clause {id} has no `{clause_field}` text"))
                })?;
                Ok(Clause { id, text })
            })
            .collect(),
        Value::Object(map) => map
            .iter()
            .map(|(key, item)| {
                let id = RecordId::from_key(key);
                let text = match item {
                    Value::String(s) => Some(s.clone()),
                    Value::Object(object) => clause_text(object, clause_field),
                    _ => None,
                }
                .ok_or_else(|| {
                    CorpusError::Structure(format!("clause {id} has no `{clause_field}` text"))
                })?;
                Ok(Clause { id, text })
            })
            .collect(),
        _ => Err(CorpusError::Structure(
            "clauses must be a JSON array or an object keyed by id".into(),
        )),
    }
}

fn clause_text(object: &serde_json::Map<String, Value>, clause_field: &str) -> Option<String> {
    std::iter::once(clause_field)
        .chain(CLAUSE_FIELD_FALLBACKS.iter().copied())
        .find_map(|field| object.get(field).and_then(Value::as_str))
        .map(str::to_string)
}

/// Fail when two distinct ids would share one report key (`1` and `"1"`).
///
/// Repeats of the exact same id are left to [`dedupe_clauses`].
pub fn reject_key_collisions(clauses: &[Clause]) -> Result<(), CorpusError> {
    let mut by_key: HashMap<String, &RecordId> = HashMap::with_capacity(clauses.len());
    for clause in clauses {
        match by_key.get(&clause.id.as_key()) {
            Some(first) if **first != clause.id => {
                return Err(CorpusError::Structure(format!(
                    "clause ids {first:?} and {:?} collide as report key \"{}\"",
                    clause.id,
                    clause.id.as_key()
                )));
            }
            Some(_) => {}
            None => {
                by_key.insert(clause.id.as_key(), &clause.id);
            }
        }
    }
    Ok(())
}

/// Drop clauses whose report key was already seen, keeping the first occurrence.
pub fn dedupe_clauses(clauses: Vec<Clause>) -> Vec<Clause> {
    let mut seen = HashSet::new();
    let before = clauses.len();
    let kept: Vec<Clause> = clauses
        .into_iter()
        .filter(|c| seen.insert(c.id.as_key()))
        .collect();
    if kept.len() < before {
        warn!(
            dropped = before - kept.len(),
            "duplicate clause ids in input; keeping first occurrence"
        );
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parses_documents_and_joins_fields() {
        let raw = json!([
            {"id": 1, "title": "Paris", "article": "Capital of France"},
            {"id": "b", "title": "Lyon"},
        ])
        .to_string();
        let corpus =
            Corpus::from_slice(raw.as_bytes(), &fields(&["title", "article"]), "t").unwrap();
        assert_eq!(corpus.len(), 2);
        assert_eq!(corpus.documents()[0].text, "Paris Capital of France");
        assert_eq!(corpus.documents()[1].text, "Lyon");
        assert!(corpus.contains(&RecordId::from("b")));
    }

    #[test]
    fn rejects_non_array() {
        let err = Corpus::from_slice(b"{\"id\": 1}", &fields(&["text"]), "t").unwrap_err();
        assert!(matches!(err, CorpusError::Structure(_)));
    }

    #[test]
    fn rejects_missing_id() {
        let err = Corpus::from_slice(b"[{\"text\": \"x\"}]", &fields(&["text"]), "t").unwrap_err();
        assert!(err.to_string().contains("`id`"));
    }

    #[test]
    fn rejects_duplicate_ids() {
        let raw = b"[{\"id\": 1, \"text\": \"a\"}, {\"id\": 1, \"text\": \"b\"}]";
        let err = Corpus::from_slice(raw, &fields(&["text"]), "t").unwrap_err();
        assert!(matches!(err, CorpusError::DuplicateId(RecordId::Int(1))));
    }

    #[test]
    fn rejects_malformed_json() {
        let err = Corpus::from_slice(b"[{", &fields(&["text"]), "t").unwrap_err();
        assert!(matches!(err, CorpusError::Json { .. }));
    }

    #[test]
    fn missing_file_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let err = Corpus::load(&tmp.path().join("missing.json"), &fields(&["text"])).unwrap_err();
        assert!(matches!(err, CorpusError::NotFound(_)));
    }

    #[test]
    fn digest_depends_on_fields() {
        let raw = b"[{\"id\": 1, \"text\": \"a\", \"title\": \"b\"}]";
        let a = Corpus::from_slice(raw, &fields(&["text"]), "t").unwrap();
        let b = Corpus::from_slice(raw, &fields(&["title"]), "t").unwrap();
        assert_ne!(a.digest(), b.digest());
    }

    #[test]
    fn document_embeddings_computed_once() {
        let corpus = Corpus::from_documents(
            vec![Document::new(1, "a"), Document::new(2, "b")],
            &fields(&["text"]),
        )
        .unwrap();
        let calls = std::sync::atomic::AtomicUsize::new(0);
        for _ in 0..3 {
            let vectors = corpus
                .document_embeddings("enc", |docs| {
                    calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    Ok(docs.iter().map(|_| vec![1.0]).collect())
                })
                .unwrap();
            assert_eq!(vectors.len(), 2);
        }
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn skip_message_detection() {
        assert!(is_upstream_skip_message(
            "Skipping unsupported file format: notes.xyz"
        ));
        assert!(!is_upstream_skip_message("/data/extracted.json"));
    }

    #[test]
    fn parses_clause_array_and_object_forms() {
        let array = json!([{"id": 1, "Clause": "finance in Paris"}]);
        let clauses = parse_clauses(&array, "Clause").unwrap();
        assert_eq!(clauses, vec![Clause::new(1, "finance in Paris")]);

        let object = json!({"7": {"Clause": "government of Paris"}, "x": "plain text"});
        let mut clauses = parse_clauses(&object, "Clause").unwrap();
        clauses.sort_by(|a, b| a.id.cmp(&b.id));
        assert_eq!(clauses[0], Clause::new(7, "government of Paris"));
        assert_eq!(clauses[1], Clause::new("x", "plain text"));
    }

    #[test]
    fn clause_field_falls_back_to_text() {
        let array = json!([{"id": "a", "text": "fallback"}]);
        let clauses = parse_clauses(&array, "Body").unwrap();
        assert_eq!(clauses[0].text, "fallback");
    }

    #[test]
    fn clause_without_text_is_rejected() {
        let array = json!([{"id": "a"}]);
        assert!(parse_clauses(&array, "Clause").is_err());
    }

    #[test]
    fn object_keys_keep_their_spelling() {
        let object = json!({"01": {"Clause": "banks"}, "1": {"Clause": "mayor"}});
        let mut clauses = parse_clauses(&object, "Clause").unwrap();
        clauses.sort_by(|a, b| a.id.cmp(&b.id));
        assert_eq!(clauses[0], Clause::new(1, "mayor"));
        assert_eq!(clauses[1], Clause::new("01", "banks"));
        assert!(reject_key_collisions(&clauses).is_ok());
        assert_eq!(dedupe_clauses(clauses).len(), 2);
    }

    #[test]
    fn colliding_clause_keys_are_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("clauses.json");
        let raw = json!([{"id": 1, "Clause": "banks"}, {"id": "1", "Clause": "mayor"}]);
        std::fs::write(&path, raw.to_string()).unwrap();
        let err = load_clauses(&path, "Clause").unwrap_err();
        assert!(
            matches!(err, CorpusError::Structure(ref msg) if msg.contains("collide")),
            "{err}"
        );
    }

    #[test]
    fn repeated_identical_ids_are_not_collisions() {
        let clauses = vec![Clause::new(1, "first"), Clause::new(1, "second")];
        assert!(reject_key_collisions(&clauses).is_ok());
    }

    #[test]
    fn dedupe_uses_report_keys() {
        let kept = dedupe_clauses(vec![Clause::new(1, "banks"), Clause::new("1", "mayor")]);
        assert_eq!(kept, vec![Clause::new(1, "banks")]);
    }

    #[test]
    fn dedupe_keeps_first() {
        let clauses = vec![
            Clause::new(1, "first"),
            Clause::new(1, "second"),
            Clause::new(2, "other"),
        ];
        let kept = dedupe_clauses(clauses);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].text, "first");
    }
}
