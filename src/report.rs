//! Aggregation of task outcomes into the batch report.
//!
//! The aggregator lives on the collecting thread only. Folding is keyed by
//! (clause id, method) with last-write-wins, so the order completions arrive
//! in never changes the final report.

use std::collections::{BTreeMap, HashSet};
use std::io::Write as _;
use std::path::{Path, PathBuf};

use serde::ser::{Serialize, SerializeMap, Serializer};
use thiserror::Error;
use tracing::{error, warn};

use crate::model::types::{RankedDocument, RecordId, TaskOutcome};

/// Outcome recorded for an expected pair that never reported back.
pub const NO_OUTCOME_REASON: &str = "no outcome recorded";

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("failed to write report {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to encode report: {0}")]
    Json(#[from] serde_json::Error),
}

type Entries = BTreeMap<RecordId, BTreeMap<String, TaskOutcome>>;

/// Incremental `clause_id -> method -> outcome` map.
#[derive(Debug, Default)]
pub struct ResultAggregator {
    expected_clauses: Vec<RecordId>,
    expected_methods: Vec<String>,
    entries: Entries,
}

impl ResultAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// An aggregator that will report every `clause x method` pair, even
    /// those that never receive an outcome.
    pub fn expecting(
        clause_ids: impl IntoIterator<Item = RecordId>,
        methods: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            expected_clauses: clause_ids.into_iter().collect(),
            expected_methods: methods.into_iter().collect(),
            entries: BTreeMap::new(),
        }
    }

    /// Record an outcome, replacing any earlier one for the same pair.
    pub fn fold(&mut self, clause_id: RecordId, method: &str, outcome: TaskOutcome) {
        self.entries
            .entry(clause_id)
            .or_default()
            .insert(method.to_string(), outcome);
    }

    /// Number of recorded (clause, method) outcomes.
    pub fn len(&self) -> usize {
        self.entries.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Freeze the report, filling in any expected pair that has no outcome.
    pub fn finalize(mut self) -> AggregatedReport {
        for clause_id in &self.expected_clauses {
            let methods = self.entries.entry(clause_id.clone()).or_default();
            for method in &self.expected_methods {
                if !methods.contains_key(method) {
                    error!(clause = %clause_id, method = %method, "task produced no outcome");
                    methods.insert(
                        method.clone(),
                        TaskOutcome::BackendFailure(NO_OUTCOME_REASON.to_string()),
                    );
                }
            }
        }
        AggregatedReport {
            entries: self.entries,
        }
    }
}

/// Immutable batch report.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AggregatedReport {
    entries: Entries,
}

impl AggregatedReport {
    pub fn get(&self, clause_id: &RecordId, method: &str) -> Option<&TaskOutcome> {
        self.entries.get(clause_id).and_then(|m| m.get(method))
    }

    /// Methods and outcomes recorded for one clause.
    pub fn clause(&self, clause_id: &RecordId) -> Option<&BTreeMap<String, TaskOutcome>> {
        self.entries.get(clause_id)
    }

    pub fn clause_ids(&self) -> impl Iterator<Item = &RecordId> {
        self.entries.keys()
    }

    pub fn clause_count(&self) -> usize {
        self.entries.len()
    }

    /// Total (clause, method) entries.
    pub fn len(&self) -> usize {
        self.entries.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&RecordId, &str, &TaskOutcome)> {
        self.entries.iter().flat_map(|(clause, methods)| {
            methods
                .iter()
                .map(move |(method, outcome)| (clause, method.as_str(), outcome))
        })
    }

    /// External shape: successful entries become their ranked list, anything
    /// else becomes `null`. Failure reasons are logged here, not serialized.
    pub fn to_view(&self) -> ReportView<'_> {
        let mut seen_keys = HashSet::with_capacity(self.entries.len());
        for (clause, methods) in &self.entries {
            if !seen_keys.insert(clause.to_string()) {
                warn!(clause = %clause, "clause ids collide as JSON keys; keeping the first");
            }
            for (method, outcome) in methods {
                if let Some(reason) = outcome.failure_reason() {
                    warn!(
                        clause = %clause,
                        method = %method,
                        outcome = outcome.kind(),
                        %reason,
                        "reporting null"
                    );
                }
            }
        }
        ReportView { report: self }
    }

    pub fn to_json_pretty(&self) -> Result<String, ReportError> {
        Ok(serde_json::to_string_pretty(&self.to_view())?)
    }

    /// Write the view as pretty JSON, atomically replacing `path`.
    pub fn write_json(&self, path: &Path) -> Result<(), ReportError> {
        let io = |source| ReportError::Io {
            path: path.to_path_buf(),
            source,
        };
        let parent = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(parent).map_err(io)?;
        let mut tmp = tempfile::NamedTempFile::new_in(parent).map_err(io)?;
        serde_json::to_writer_pretty(&mut tmp, &self.to_view())?;
        tmp.write_all(b"\n").map_err(io)?;
        tmp.persist(path).map_err(|e| io(e.error))?;
        Ok(())
    }
}

/// Serializable projection of an [`AggregatedReport`].
pub struct ReportView<'a> {
    report: &'a AggregatedReport,
}

struct MethodsView<'a>(&'a BTreeMap<String, TaskOutcome>);

impl Serialize for ReportView<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut keys = HashSet::with_capacity(self.report.entries.len());
        let mut map = serializer.serialize_map(None)?;
        for (clause, methods) in &self.report.entries {
            let key = clause.as_key();
            if keys.insert(key.clone()) {
                map.serialize_entry(&key, &MethodsView(methods))?;
            }
        }
        map.end()
    }
}

impl Serialize for MethodsView<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (method, outcome) in self.0 {
            let docs: Option<&[RankedDocument]> = outcome.documents();
            map.serialize_entry(method, &docs)?;
        }
        map.end()
    }
}
