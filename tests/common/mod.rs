//! Test harness: an [`App`] wired to deterministic mock services.

#![allow(dead_code)]

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

use doc_rag::app::App;
use doc_rag::blob::LocalBlobStore;
use doc_rag::chat::{ChatMessage, ChatModel, CompletionOptions};
use doc_rag::chunk::{Chunker, TextTokenizer};
use doc_rag::embedding::{Embedder, EmbeddingProvider};
use doc_rag::index::{InMemoryVectorIndex, SqliteVectorIndex, VectorIndex};
use doc_rag::ingest::IngestOptions;
use doc_rag::metadata::{MetadataStore, SqliteMetadataStore};
use doc_rag::query::QueryOptions;
use doc_rag::{db, migrate};

pub const DIMS: usize = 32;

/// Bag-of-words embedding: each lowercase word bumps one hashed bucket.
pub struct HashEmbedder {
    pub fail: AtomicBool,
}

impl HashEmbedder {
    pub fn new() -> Self {
        Self {
            fail: AtomicBool::new(false),
        }
    }
}

pub fn hash_embed(text: &str) -> Vec<f32> {
    let mut v = vec![0.0f32; DIMS];
    for word in text.split_whitespace() {
        let word = word
            .trim_matches(|c: char| !c.is_alphanumeric())
            .to_lowercase();
        if word.is_empty() {
            continue;
        }
        // FNV-1a
        let mut h: u64 = 0xcbf29ce484222325;
        for b in word.bytes() {
            h ^= b as u64;
            h = h.wrapping_mul(0x100000001b3);
        }
        v[(h % DIMS as u64) as usize] += 1.0;
    }
    v
}

#[async_trait]
impl EmbeddingProvider for HashEmbedder {
    fn model_name(&self) -> &str {
        "hash-embedder"
    }
    fn dims(&self) -> usize {
        DIMS
    }
    async fn embed_batch(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("embedding service unavailable");
        }
        Ok(texts.iter().map(|t| hash_embed(t)).collect())
    }
}

/// Returns a fixed answer and records every request.
pub struct RecordingChat {
    pub requests: Mutex<Vec<(Vec<ChatMessage>, CompletionOptions)>>,
}

impl RecordingChat {
    pub fn new() -> Self {
        Self {
            requests: Mutex::new(Vec::new()),
        }
    }
}

pub const MOCK_ANSWER: &str = "The answer, from context.";

#[async_trait]
impl ChatModel for RecordingChat {
    fn model_name(&self) -> &str {
        "recording-chat"
    }
    async fn complete(
        &self,
        messages: &[ChatMessage],
        options: CompletionOptions,
    ) -> anyhow::Result<String> {
        self.requests
            .lock()
            .unwrap()
            .push((messages.to_vec(), options));
        Ok(MOCK_ANSWER.to_string())
    }
}

pub enum IndexKind {
    Memory,
    Sqlite,
}

pub struct Harness {
    pub tmp: TempDir,
    pub app: App,
    pub metadata: Arc<dyn MetadataStore>,
    pub index: Arc<dyn VectorIndex>,
    pub embedder: Arc<HashEmbedder>,
    pub chat: Arc<RecordingChat>,
    pub scratch_dir: PathBuf,
}

impl Harness {
    pub async fn new(size: usize, overlap: usize, kind: IndexKind) -> Self {
        let tmp = TempDir::new().unwrap();
        let pool = db::connect_path(&tmp.path().join("data/docrag.sqlite"))
            .await
            .unwrap();
        migrate::run_migrations(&pool).await.unwrap();

        let metadata: Arc<dyn MetadataStore> = Arc::new(SqliteMetadataStore::new(pool.clone()));
        let index: Arc<dyn VectorIndex> = match kind {
            IndexKind::Memory => Arc::new(InMemoryVectorIndex::new(DIMS)),
            IndexKind::Sqlite => Arc::new(SqliteVectorIndex::new(pool, "documents", DIMS)),
        };
        index.ensure_schema().await.unwrap();

        let embedder = Arc::new(HashEmbedder::new());
        let chat = Arc::new(RecordingChat::new());
        let scratch_dir = tmp.path().join("scratch");

        let app = App::new(
            metadata.clone(),
            Arc::new(LocalBlobStore::new(tmp.path().join("blobs"))),
            Arc::new(Chunker::new(size, overlap, TextTokenizer::Words).unwrap()),
            Embedder::new(embedder.clone(), 16, Duration::from_secs(5)),
            index.clone(),
            chat.clone(),
            IngestOptions {
                scratch_dir: scratch_dir.clone(),
                mirror_chunks: true,
                storage_timeout: Duration::from_secs(5),
                extract_timeout: Duration::from_secs(5),
                index_timeout: Duration::from_secs(5),
                upsert_retries: 1,
            },
            QueryOptions {
                default_top_k: 5,
                max_top_k: 50,
                temperature: 0.0,
                max_tokens: 256,
                index_timeout: Duration::from_secs(5),
                chat_timeout: Duration::from_secs(5),
            },
        );

        Self {
            tmp,
            app,
            metadata,
            index,
            embedder,
            chat,
            scratch_dir,
        }
    }

    /// Files left behind in the scratch directory.
    pub fn scratch_files(&self) -> usize {
        std::fs::read_dir(&self.scratch_dir)
            .map(|entries| entries.count())
            .unwrap_or(0)
    }
}

/// `n` distinct words, `topic` first so it is retrievable.
pub fn corpus(topic: &str, n: usize) -> String {
    (0..n)
        .map(|i| format!("{}{}", topic, i))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Single-page PDF with an empty content stream (no text layer).
pub fn pdf_without_text_layer() -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(b"%PDF-1.4\n");
    let o1 = out.len();
    out.extend_from_slice(b"1 0 obj << /Type /Catalog /Pages 2 0 R >> endobj\n");
    let o2 = out.len();
    out.extend_from_slice(b"2 0 obj << /Type /Pages /Kids [3 0 R] /Count 1 >> endobj\n");
    let o3 = out.len();
    out.extend_from_slice(
        b"3 0 obj << /Type /Page /Parent 2 0 R /MediaBox [0 0 612 792] /Contents 4 0 R >> endobj\n",
    );
    let o4 = out.len();
    out.extend_from_slice(b"4 0 obj << /Length 0 >> stream\n\nendstream endobj\n");
    let xref_start = out.len();
    out.extend_from_slice(b"xref\n0 5\n");
    out.extend_from_slice(format!("{:010} 65535 f \n", 0).as_bytes());
    for offset in [o1, o2, o3, o4] {
        out.extend_from_slice(format!("{:010} 00000 n \n", offset).as_bytes());
    }
    out.extend_from_slice(b"trailer << /Size 5 /Root 1 0 R >>\nstartxref\n");
    out.extend_from_slice(format!("{}\n", xref_start).as_bytes());
    out.extend_from_slice(b"%%EOF\n");
    out
}

/// Minimal docx with one `<w:p>` per paragraph.
pub fn docx_with_paragraphs(paragraphs: &[&str]) -> Vec<u8> {
    use std::io::Write;
    let body: String = paragraphs
        .iter()
        .map(|p| format!("<w:p><w:r><w:t>{}</w:t></w:r></w:p>", p))
        .collect();
    let mut buf = Vec::new();
    {
        let mut zip = zip::ZipWriter::new(std::io::Cursor::new(&mut buf));
        zip.start_file(
            "word/document.xml",
            zip::write::SimpleFileOptions::default(),
        )
        .unwrap();
        let xml = format!(
            "<?xml version=\"1.0\"?><w:document xmlns:w=\"http://schemas.openxmlformats.org/wordprocessingml/2006/main\"><w:body>{}</w:body></w:document>",
            body
        );
        zip.write_all(xml.as_bytes()).unwrap();
        zip.finish().unwrap();
    }
    buf
}
