//! Normalized entity structs shared by every retrieval stage.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::time::Duration;

/// Identifier of a document or clause, exactly as it appeared in the input JSON.
///
/// Integers sort numerically and come before strings, which sort
/// lexicographically. This is the tie-break order for ranked results.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RecordId {
    Int(i64),
    Text(String),
}

impl RecordId {
    /// Parse an id from a raw map key (clause files keyed by id).
    ///
    /// Keys in canonical integer form become [`RecordId::Int`] so they line
    /// up with ids written as numbers elsewhere. Anything else (`"01"`,
    /// `"+5"`, `"-0"`) stays text, so the key round-trips unchanged.
    pub fn from_key(key: &str) -> Self {
        match key.parse::<i64>() {
            Ok(n) if n.to_string() == key => RecordId::Int(n),
            _ => RecordId::Text(key.to_string()),
        }
    }

    /// The id as it appears when used as a JSON object key.
    pub fn as_key(&self) -> String {
        self.to_string()
    }

    /// Convert a JSON value into an id. Only integers and strings qualify.
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Number(n) => n.as_i64().map(RecordId::Int),
            serde_json::Value::String(s) => Some(RecordId::Text(s.clone())),
            _ => None,
        }
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordId::Int(n) => write!(f, "{n}"),
            RecordId::Text(s) => write!(f, "{s}"),
        }
    }
}

impl From<i64> for RecordId {
    fn from(value: i64) -> Self {
        RecordId::Int(value)
    }
}

impl From<&str> for RecordId {
    fn from(value: &str) -> Self {
        RecordId::Text(value.to_string())
    }
}

/// One ranked hit: a document id and its similarity to the query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedDocument {
    pub id: RecordId,
    pub similarity: f32,
}

impl RankedDocument {
    pub fn new(id: impl Into<RecordId>, similarity: f32) -> Self {
        Self {
            id: id.into(),
            similarity,
        }
    }
}

/// Result ordering: similarity descending, then id ascending.
pub fn rank_order(a: &RankedDocument, b: &RankedDocument) -> Ordering {
    b.similarity
        .partial_cmp(&a.similarity)
        .unwrap_or(Ordering::Equal)
        .then_with(|| a.id.cmp(&b.id))
}

/// Sort in place by [`rank_order`] and keep the top `k`.
pub fn sort_and_truncate(docs: &mut Vec<RankedDocument>, k: usize) {
    docs.sort_by(rank_order);
    docs.truncate(k);
}

/// A unit of query text to retrieve documents for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Clause {
    pub id: RecordId,
    pub text: String,
}

impl Clause {
    pub fn new(id: impl Into<RecordId>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
        }
    }
}

/// One (clause, method) pair. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct RetrievalTask {
    pub clause_id: RecordId,
    pub clause_text: String,
    /// The method identifier as the caller spelled it; it is also the report key.
    pub method: String,
    pub k: usize,
}

/// What happened to one task. Exactly one variant per task.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Success(Vec<RankedDocument>),
    BackendFailure(String),
    Timeout(Duration),
    UnsupportedMethod,
}

impl TaskOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, TaskOutcome::Success(_))
    }

    /// The ranked list for successful outcomes.
    pub fn documents(&self) -> Option<&[RankedDocument]> {
        match self {
            TaskOutcome::Success(docs) => Some(docs),
            _ => None,
        }
    }

    /// Short machine-readable label used in logs and summaries.
    pub fn kind(&self) -> &'static str {
        match self {
            TaskOutcome::Success(_) => "success",
            TaskOutcome::BackendFailure(_) => "backend_failure",
            TaskOutcome::Timeout(_) => "timeout",
            TaskOutcome::UnsupportedMethod => "unsupported_method",
        }
    }

    /// Human-readable reason for failure variants.
    pub fn failure_reason(&self) -> Option<String> {
        match self {
            TaskOutcome::Success(_) => None,
            TaskOutcome::BackendFailure(reason) => Some(reason.clone()),
            TaskOutcome::Timeout(budget) => Some(format!(
                "timed out after {:.3}s",
                budget.as_secs_f64()
            )),
            TaskOutcome::UnsupportedMethod => Some("unsupported method".to_string()),
        }
    }
}

/// A finished task as reported by a worker to the collector.
#[derive(Debug, Clone)]
pub struct TaskCompletion {
    pub task: RetrievalTask,
    pub outcome: TaskOutcome,
    /// Served from the cache without invoking a backend.
    pub cached: bool,
    pub elapsed: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ints_sort_before_text() {
        let mut ids = vec![
            RecordId::from("b"),
            RecordId::Int(10),
            RecordId::from("a"),
            RecordId::Int(2),
        ];
        ids.sort();
        assert_eq!(
            ids,
            vec![
                RecordId::Int(2),
                RecordId::Int(10),
                RecordId::from("a"),
                RecordId::from("b")
            ]
        );
    }

    #[test]
    fn record_id_serializes_as_written() {
        let int: RecordId = serde_json::from_str("7").unwrap();
        let text: RecordId = serde_json::from_str("\"doc-7\"").unwrap();
        assert_eq!(int, RecordId::Int(7));
        assert_eq!(text, RecordId::from("doc-7"));
        assert_eq!(serde_json::to_string(&int).unwrap(), "7");
        assert_eq!(serde_json::to_string(&text).unwrap(), "\"doc-7\"");
    }

    #[test]
    fn from_key_prefers_integers() {
        assert_eq!(RecordId::from_key("42"), RecordId::Int(42));
        assert_eq!(RecordId::from_key("-7"), RecordId::Int(-7));
        assert_eq!(RecordId::from_key("c-42"), RecordId::from("c-42"));
        for key in ["01", "007", "+5", "-0", " 3"] {
            assert_eq!(RecordId::from_key(key), RecordId::from(key), "{key}");
            assert_eq!(RecordId::from_key(key).as_key(), key);
        }
    }

    #[test]
    fn ranking_breaks_ties_by_ascending_id() {
        let mut docs = vec![
            RankedDocument::new(3, 0.5),
            RankedDocument::new(1, 0.5),
            RankedDocument::new(2, 0.9),
        ];
        sort_and_truncate(&mut docs, 10);
        let ids: Vec<_> = docs.iter().map(|d| d.id.clone()).collect();
        assert_eq!(ids, vec![RecordId::Int(2), RecordId::Int(1), RecordId::Int(3)]);
    }

    #[test]
    fn sort_and_truncate_keeps_top_k() {
        let mut docs = (0..10)
            .map(|i| RankedDocument::new(i, i as f32))
            .collect::<Vec<_>>();
        sort_and_truncate(&mut docs, 3);
        assert_eq!(docs.len(), 3);
        assert_eq!(docs[0].id, RecordId::Int(9));
    }

    #[test]
    fn outcome_reason_only_for_failures() {
        assert!(TaskOutcome::Success(vec![]).failure_reason().is_none());
        assert!(
            TaskOutcome::Timeout(Duration::from_millis(1500))
                .failure_reason()
                .unwrap()
                .contains("1.500s")
        );
        assert_eq!(TaskOutcome::UnsupportedMethod.kind(), "unsupported_method");
    }
}
