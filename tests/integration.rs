//! End-to-end tests: ingest documents, then ask questions against them with
//! stub providers, over both index backends.

use std::fs;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tempfile::TempDir;

use roadwise::answer::Generator;
use roadwise::config::Config;
use roadwise::embedding::Embedder;
use roadwise::error::Result;
use roadwise::index::{MemoryIndex, SqliteIndex, VectorIndex};
use roadwise::RagEngine;

/// Deterministic embedder: vector is a letter histogram of the text, so
/// texts sharing vocabulary land close together.
struct HistogramEmbedder;

fn histogram(text: &str) -> Vec<f32> {
    let mut v = vec![0.0f32; 26];
    for c in text.chars() {
        if c.is_ascii_alphabetic() {
            v[(c.to_ascii_lowercase() as u8 - b'a') as usize] += 1.0;
        }
    }
    v
}

#[async_trait]
impl Embedder for HistogramEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| histogram(t)).collect())
    }
    fn model_name(&self) -> &str {
        "histogram"
    }
    fn dims(&self) -> usize {
        26
    }
}

/// Generator that echoes the prompt back, so tests can assert on what the
/// model was actually shown. Also tracks concurrent in-flight calls.
struct EchoGenerator {
    in_flight: AtomicU32,
    max_in_flight: AtomicU32,
}

impl EchoGenerator {
    fn new() -> Self {
        Self {
            in_flight: AtomicU32::new(0),
            max_in_flight: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl Generator for EchoGenerator {
    async fn generate(&self, prompt: &str) -> Result<String> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(format!("ANSWER<<{prompt}>>"))
    }
    fn model_name(&self) -> &str {
        "echo"
    }
}

fn engine_with(index: Arc<dyn VectorIndex>) -> (RagEngine, Arc<EchoGenerator>) {
    let generator = Arc::new(EchoGenerator::new());
    let engine = RagEngine::new(
        Config::default(),
        index,
        Arc::new(HistogramEmbedder),
        generator.clone(),
    );
    (engine, generator)
}

fn write_corpus(dir: &TempDir) -> std::path::PathBuf {
    let path = dir.path().join("road-act.txt");
    fs::write(
        &path,
        "Section 12. The maximum speed in residential zones is thirty kilometers per hour. \
         Vehicles must yield to pedestrians at marked crossings.\u{0C}\
         Section 31. Parking is prohibited on bridges and inside tunnels. \
         Stopping is permitted only in marked emergency bays.",
    )
    .unwrap();
    path
}

/// Minimal multi-page PDF with one line of text per page, with the xref
/// offsets computed so pdf-extract can parse it.
fn minimal_pdf(pages: &[&str]) -> Vec<u8> {
    let n = pages.len();
    // Object numbering: 1 catalog, 2 pages, 3..3+n page objects,
    // 3+n..3+2n content streams, 3+2n font.
    let font_obj = 3 + 2 * n;
    let total_objs = font_obj + 1;

    let mut out: Vec<u8> = Vec::new();
    let mut offsets = Vec::with_capacity(total_objs);
    out.extend_from_slice(b"%PDF-1.4\n");

    offsets.push(out.len());
    out.extend_from_slice(b"1 0 obj << /Type /Catalog /Pages 2 0 R >> endobj\n");

    offsets.push(out.len());
    let kids: Vec<String> = (0..n).map(|i| format!("{} 0 R", 3 + i)).collect();
    out.extend_from_slice(
        format!(
            "2 0 obj << /Type /Pages /Kids [{}] /Count {} >> endobj\n",
            kids.join(" "),
            n
        )
        .as_bytes(),
    );

    for i in 0..n {
        offsets.push(out.len());
        out.extend_from_slice(
            format!(
                "{} 0 obj << /Type /Page /Parent 2 0 R /MediaBox [0 0 612 792] \
                 /Contents {} 0 R /Resources << /Font << /F1 {} 0 R >> >> >> endobj\n",
                3 + i,
                3 + n + i,
                font_obj
            )
            .as_bytes(),
        );
    }

    for (i, text) in pages.iter().enumerate() {
        let stream = format!("BT /F1 12 Tf 72 720 Td ({text}) Tj ET\n");
        offsets.push(out.len());
        out.extend_from_slice(
            format!(
                "{} 0 obj << /Length {} >> stream\n{}endstream endobj\n",
                3 + n + i,
                stream.len(),
                stream
            )
            .as_bytes(),
        );
    }

    offsets.push(out.len());
    out.extend_from_slice(
        format!(
            "{} 0 obj << /Type /Font /Subtype /Type1 /BaseFont /Helvetica >> endobj\n",
            font_obj
        )
        .as_bytes(),
    );

    let xref_start = out.len();
    out.extend_from_slice(format!("xref\n0 {}\n", total_objs + 1).as_bytes());
    out.extend_from_slice(b"0000000000 65535 f \n");
    for offset in &offsets {
        out.extend_from_slice(format!("{offset:010} 00000 n \n").as_bytes());
    }
    out.extend_from_slice(
        format!(
            "trailer << /Size {} /Root 1 0 R >>\nstartxref\n{}\n%%EOF\n",
            total_objs + 1,
            xref_start
        )
        .as_bytes(),
    );
    out
}

#[tokio::test]
async fn ingest_then_ask_produces_grounded_answer() {
    let dir = TempDir::new().unwrap();
    let path = write_corpus(&dir);
    let (engine, _) = engine_with(Arc::new(MemoryIndex::new()));

    let report = engine.ingest(&path).await.unwrap();
    assert_eq!(report.page_count, 2);
    assert!(report.chunk_count >= 2);

    let record = engine.document(&report.document_id).await.unwrap().unwrap();
    assert_eq!(record.title, "road-act");
    assert_eq!(record.chunk_count, report.chunk_count);

    let outcome = engine
        .ask(None, "What is the speed limit in residential zones?")
        .await
        .unwrap();

    assert!(!outcome.answer.low_confidence);
    assert!(!outcome.answer.citations.is_empty());
    // The echoed prompt must contain the relevant passage and its marker.
    assert!(outcome.answer.text.contains("thirty kilometers"));
    assert!(outcome
        .answer
        .text
        .contains(&format!("[doc {} p.", report.document_id)));
}

#[tokio::test]
async fn empty_index_yields_low_confidence_not_error() {
    let (engine, _) = engine_with(Arc::new(MemoryIndex::new()));

    let outcome = engine.ask(None, "Can I park on a bridge?").await.unwrap();
    assert!(outcome.answer.low_confidence);
    assert!(outcome.answer.citations.is_empty());
    assert!(outcome.answer.text.contains("cannot answer"));
}

#[tokio::test]
async fn reingest_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let path = write_corpus(&dir);
    let (engine, _) = engine_with(Arc::new(MemoryIndex::new()));

    let first = engine.ingest(&path).await.unwrap();
    let second = engine.ingest(&path).await.unwrap();

    assert_eq!(first.document_id, second.document_id);
    assert_eq!(first.chunk_count, second.chunk_count);
    assert_eq!(engine.indexed_chunks().await.unwrap(), first.chunk_count);
}

#[tokio::test]
async fn followup_question_sees_conversation_history() {
    let dir = TempDir::new().unwrap();
    let path = write_corpus(&dir);
    let (engine, _) = engine_with(Arc::new(MemoryIndex::new()));
    engine.ingest(&path).await.unwrap();

    let first = engine
        .ask(None, "Where is parking prohibited?")
        .await
        .unwrap();
    let second = engine
        .ask(Some(&first.session_id), "What about stopping there?")
        .await
        .unwrap();

    assert_eq!(first.session_id, second.session_id);
    // The second prompt carries the first exchange.
    assert!(second.answer.text.contains("User: Where is parking prohibited?"));
    assert!(second.answer.text.contains("Assistant: ANSWER<<"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_asks_on_one_session_serialize() {
    let dir = TempDir::new().unwrap();
    let path = write_corpus(&dir);
    let (engine, generator) = engine_with(Arc::new(MemoryIndex::new()));
    engine.ingest(&path).await.unwrap();
    let engine = Arc::new(engine);

    let first = engine.ask(None, "warm up").await.unwrap();
    let session_id = first.session_id;

    let mut handles = Vec::new();
    for i in 0..4 {
        let engine = engine.clone();
        let session_id = session_id.clone();
        handles.push(tokio::spawn(async move {
            engine
                .ask(Some(&session_id), &format!("question number {i}"))
                .await
        }));
    }
    for h in handles {
        h.await.unwrap().unwrap();
    }

    // Same session: never more than one generation in flight at a time.
    assert_eq!(generator.max_in_flight.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn distinct_sessions_run_concurrently() {
    let (engine, generator) = engine_with(Arc::new(MemoryIndex::new()));
    let engine = Arc::new(engine);

    let mut handles = Vec::new();
    for i in 0..4 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            engine.ask(None, &format!("question {i}")).await
        }));
    }
    for h in handles {
        h.await.unwrap().unwrap();
    }

    assert!(generator.max_in_flight.load(Ordering::SeqCst) >= 1);
}

#[tokio::test]
async fn reset_clears_history() {
    let dir = TempDir::new().unwrap();
    let path = write_corpus(&dir);
    let (engine, _) = engine_with(Arc::new(MemoryIndex::new()));
    engine.ingest(&path).await.unwrap();

    let first = engine.ask(None, "Where is parking banned?").await.unwrap();
    engine.reset_session(&first.session_id).unwrap();
    assert!(matches!(
        engine.reset_session(&first.session_id),
        Err(roadwise::RagError::SessionNotFound(_))
    ));

    let second = engine
        .ask(Some(&first.session_id), "What did I just ask?")
        .await
        .unwrap();
    assert!(!second.answer.text.contains("Conversation so far"));
}

#[tokio::test]
async fn pdf_pages_flow_into_citations() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("traffic-code.pdf");
    fs::write(
        &path,
        minimal_pdf(&[
            "Speed limits protect everyone on the road",
            "Overtaking on the right is forbidden",
            "Winter tires are mandatory in icy conditions",
        ]),
    )
    .unwrap();

    let (engine, _) = engine_with(Arc::new(MemoryIndex::new()));
    let report = engine.ingest(&path).await.unwrap();
    assert_eq!(report.page_count, 3);
    assert_eq!(report.chunk_count, 3);
    assert_eq!(report.title, "traffic-code");

    let outcome = engine
        .ask(None, "Is overtaking on the right forbidden?")
        .await
        .unwrap();
    let pages: Vec<usize> = outcome.answer.citations.iter().map(|c| c.page).collect();
    assert!(pages.contains(&2), "expected a page-2 citation, got {pages:?}");
}

#[tokio::test]
async fn sqlite_backend_end_to_end() {
    let dir = TempDir::new().unwrap();
    let path = write_corpus(&dir);
    let index = Arc::new(SqliteIndex::open(&dir.path().join("index.db")).await.unwrap());
    let (engine, _) = engine_with(index.clone());

    let report = engine.ingest(&path).await.unwrap();
    assert_eq!(index.entry_count().await.unwrap(), report.chunk_count);

    let outcome = engine
        .ask(None, "Are vehicles required to yield at marked crossings?")
        .await
        .unwrap();
    assert!(!outcome.answer.low_confidence);
    assert!(outcome.answer.text.contains("yield to pedestrians"));
}

#[tokio::test]
async fn directory_ingest_skips_unsupported_files() {
    let dir = TempDir::new().unwrap();
    write_corpus(&dir);
    fs::write(dir.path().join("signs.md"), "Give way signs are triangular.").unwrap();
    fs::write(dir.path().join("notes.docx"), b"binary blob").unwrap();

    let (engine, _) = engine_with(Arc::new(MemoryIndex::new()));
    let reports = engine.ingest_dir(dir.path()).await.unwrap();
    assert_eq!(reports.len(), 2);
}

#[tokio::test]
async fn unsupported_extension_is_rejected() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("rules.docx");
    fs::write(&path, b"not really a docx").unwrap();

    let (engine, _) = engine_with(Arc::new(MemoryIndex::new()));
    let err = engine.ingest(&path).await.unwrap_err();
    assert!(matches!(err, roadwise::RagError::UnsupportedFormat(_)));
}
