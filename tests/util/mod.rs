use clause_retriever::corpus::Corpus;
use clause_retriever::model::types::RankedDocument;
use clause_retriever::search::backend::{Backend, BackendError, Family};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::TempDir;

/// Captures tracing output for tests.
#[allow(dead_code)]
pub struct TestTracing {
    buffer: std::sync::Arc<std::sync::Mutex<Vec<u8>>>,
}

#[allow(dead_code)]
impl TestTracing {
    pub fn new() -> Self {
        Self {
            buffer: std::sync::Arc::new(std::sync::Mutex::new(Vec::new())),
        }
    }

    /// Install for the current thread only.
    pub fn install(&self) -> tracing::subscriber::DefaultGuard {
        let writer = self.buffer.clone();
        let make_writer = move || TestWriter(writer.clone());
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .without_time()
            .with_max_level(tracing::Level::DEBUG)
            .with_writer(make_writer)
            .finish();
        tracing::subscriber::set_default(subscriber)
    }

    pub fn output(&self) -> String {
        let buf = self.buffer.lock().unwrap();
        String::from_utf8_lossy(&buf).to_string()
    }

    /// Assert that the captured log output contains the provided substring.
    pub fn assert_contains(&self, needle: &str) {
        let out = self.output();
        assert!(
            out.contains(needle),
            "expected logs to contain `{needle}`, got:\n{out}"
        );
    }
}

struct TestWriter(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);

impl std::io::Write for TestWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut guard = self.0.lock().unwrap();
        guard.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Temp directory holding corpus, clause, and cache files for one test.
#[allow(dead_code)]
pub struct Fixture {
    pub dir: TempDir,
}

#[allow(dead_code)]
impl Fixture {
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().expect("tempdir"),
        }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.dir.path().join("cache")
    }

    pub fn write_json(&self, name: &str, value: &serde_json::Value) -> PathBuf {
        let path = self.dir.path().join(name);
        std::fs::write(&path, serde_json::to_vec_pretty(value).unwrap()).unwrap();
        path
    }

    pub fn paris_corpus_file(&self) -> PathBuf {
        self.write_json("corpus.json", &paris_corpus_json())
    }
}

/// Three short documents about Paris.
#[allow(dead_code)]
pub fn paris_corpus_json() -> serde_json::Value {
    json!([
        {"id": 1, "text": "Paris is the financial centre of France, home to banks and the stock exchange."},
        {"id": 2, "text": "The government of Paris is led by the mayor and the city council."},
        {"id": 3, "text": "Paris hosts museums such as the Louvre and the Musée d'Orsay."}
    ])
}

#[allow(dead_code)]
pub fn paris_corpus() -> Arc<Corpus> {
    let bytes = serde_json::to_vec(&paris_corpus_json()).unwrap();
    Arc::new(Corpus::from_slice(&bytes, &["text".to_string()], "paris").unwrap())
}

/// Returns every corpus document with a fixed score and counts invocations.
#[allow(dead_code)]
#[derive(Default)]
pub struct CountingBackend {
    pub calls: AtomicUsize,
}

#[allow(dead_code)]
impl CountingBackend {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Backend for CountingBackend {
    fn id(&self) -> &str {
        "counting"
    }

    fn family(&self) -> Family {
        Family::Lexical
    }

    fn invoke(
        &self,
        corpus: &Corpus,
        _query: &str,
        _k: usize,
    ) -> Result<Vec<RankedDocument>, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(corpus
            .documents()
            .iter()
            .map(|d| RankedDocument {
                id: d.id.clone(),
                similarity: 0.5,
            })
            .collect())
    }
}

/// Fails for one query, succeeds with the first document otherwise.
#[allow(dead_code)]
pub struct FailingFor(pub &'static str);

impl Backend for FailingFor {
    fn id(&self) -> &str {
        "failing-for"
    }

    fn family(&self) -> Family {
        Family::Learned
    }

    fn invoke(
        &self,
        corpus: &Corpus,
        query: &str,
        _k: usize,
    ) -> Result<Vec<RankedDocument>, BackendError> {
        if query == self.0 {
            return Err(BackendError::Internal(format!("refusing {query}")));
        }
        Ok(vec![RankedDocument {
            id: corpus.documents()[0].id.clone(),
            similarity: 1.0,
        }])
    }
}

/// Sleeps far past any test deadline.
#[allow(dead_code)]
pub struct BlockingBackend(pub Duration);

impl Backend for BlockingBackend {
    fn id(&self) -> &str {
        "blocking"
    }

    fn family(&self) -> Family {
        Family::Learned
    }

    fn invoke(
        &self,
        _corpus: &Corpus,
        _query: &str,
        _k: usize,
    ) -> Result<Vec<RankedDocument>, BackendError> {
        std::thread::sleep(self.0);
        Ok(Vec::new())
    }
}

#[allow(dead_code)]
pub struct PanickingBackend;

impl Backend for PanickingBackend {
    fn id(&self) -> &str {
        "panicking"
    }

    fn family(&self) -> Family {
        Family::Learned
    }

    fn invoke(
        &self,
        _corpus: &Corpus,
        _query: &str,
        _k: usize,
    ) -> Result<Vec<RankedDocument>, BackendError> {
        panic!("model weights missing")
    }
}
