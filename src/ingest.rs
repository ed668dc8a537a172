//! Ingestion pipeline: the write path.
//!
//! Turns one uploaded document into indexed fragments:
//!
//! ```text
//! Fetched ─► Extracted ─► Chunked ─► Embedded ─► Indexed ─► Done
//!    │           │           │           │          │
//!    └───────────┴───────────┴───────────┴──────────┴──► Failed(stage)
//! ```
//!
//! The run is not transactional. Fragment ids are derived from the
//! document id and ordinal, and upserts overwrite by id, so re-running a
//! document after a partial failure converges on the same index state.
//!
//! The downloaded file lives in a scratch file under `ingest.scratch_dir`
//! that is removed when the run ends, whatever the outcome.

use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::blob::BlobStore;
use crate::chunk::{fragment_id, Chunker};
use crate::config::Config;
use crate::embedding::Embedder;
use crate::error::{PipelineError, Service};
use crate::extract::{self, ExtractError};
use crate::guard;
use crate::index::VectorIndex;
use crate::metadata::MetadataStore;
use crate::models::{ChunkMirror, FragmentRecord};

/// Stage at which an ingestion run failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestStage {
    Fetch,
    Extract,
    Chunk,
    Embed,
    Index,
}

impl fmt::Display for IngestStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IngestStage::Fetch => "fetch",
            IngestStage::Extract => "extract",
            IngestStage::Chunk => "chunk",
            IngestStage::Embed => "embed",
            IngestStage::Index => "index",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
#[error("ingestion failed at {stage} stage: {error}")]
pub struct IngestFailure {
    pub stage: IngestStage,
    #[source]
    pub error: PipelineError,
}

trait AtStage<T> {
    fn at(self, stage: IngestStage) -> Result<T, IngestFailure>;
}

impl<T> AtStage<T> for Result<T, PipelineError> {
    fn at(self, stage: IngestStage) -> Result<T, IngestFailure> {
        self.map_err(|error| IngestFailure { stage, error })
    }
}

/// Successful ingestion of one document.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IngestReport {
    pub doc_id: String,
    pub num_chunks: usize,
    pub fragment_ids: Vec<String>,
}

/// Tunables of the write path.
#[derive(Debug, Clone)]
pub struct IngestOptions {
    pub scratch_dir: PathBuf,
    pub mirror_chunks: bool,
    pub storage_timeout: Duration,
    pub extract_timeout: Duration,
    pub index_timeout: Duration,
    /// Extra attempts for fragments an upsert reported as failed.
    pub upsert_retries: u32,
}

impl IngestOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            scratch_dir: config.ingest.scratch_dir.clone(),
            mirror_chunks: config.ingest.mirror_chunks,
            storage_timeout: Duration::from_secs(config.ingest.storage_timeout_secs),
            extract_timeout: Duration::from_secs(config.ingest.extract_timeout_secs),
            index_timeout: config.index.timeout(),
            upsert_retries: config.index.upsert_retries,
        }
    }
}

pub struct IngestionPipeline {
    metadata: Arc<dyn MetadataStore>,
    blobs: Arc<dyn BlobStore>,
    chunker: Arc<Chunker>,
    embedder: Embedder,
    index: Arc<dyn VectorIndex>,
    options: IngestOptions,
}

impl IngestionPipeline {
    pub fn new(
        metadata: Arc<dyn MetadataStore>,
        blobs: Arc<dyn BlobStore>,
        chunker: Arc<Chunker>,
        embedder: Embedder,
        index: Arc<dyn VectorIndex>,
        options: IngestOptions,
    ) -> Self {
        Self {
            metadata,
            blobs,
            chunker,
            embedder,
            index,
            options,
        }
    }

    /// Run the whole pipeline for `doc_id`.
    pub async fn process(
        &self,
        doc_id: &str,
        cancel: &CancellationToken,
    ) -> Result<IngestReport, IngestFailure> {
        let result = self.run(doc_id, cancel).await;
        match &result {
            Ok(report) => info!(doc_id, fragments = report.num_chunks, "ingestion done"),
            Err(failure) => warn!(
                doc_id,
                stage = %failure.stage,
                code = failure.error.code(),
                error = %failure.error,
                "ingestion failed"
            ),
        }
        result
    }

    async fn run(&self, doc_id: &str, cancel: &CancellationToken) -> Result<IngestReport, IngestFailure> {
        // Fetched
        let doc = self
            .metadata
            .get_document(doc_id)
            .await
            .map_err(|e| PipelineError::from_service(Service::Metadata, e))
            .at(IngestStage::Fetch)?
            .ok_or_else(|| PipelineError::not_found("document", doc_id))
            .at(IngestStage::Fetch)?;

        let scratch = self.scratch_file(&doc.name).at(IngestStage::Fetch)?;
        guard::bounded(
            Service::Storage,
            self.options.storage_timeout,
            cancel,
            self.blobs.get(&doc.blob_url, scratch.path()),
        )
        .await
        .at(IngestStage::Fetch)?;
        debug!(doc_id, blob = %doc.blob_url, "fetched");

        // Extracted
        let path = scratch.path().to_path_buf();
        let name = doc.name.clone();
        let text = guard::bounded_typed(Service::Extraction, self.options.extract_timeout, cancel, async move {
            tokio::task::spawn_blocking(move || extract::extract_file(&path, &name))
                .await
                .map_err(|e| PipelineError::internal(format!("extraction task failed: {}", e)))?
                .map_err(classify_extract_error)
        })
        .await
        .at(IngestStage::Extract)?;
        drop(scratch);

        if text.trim().is_empty() {
            return Err(PipelineError::client_data(format!(
                "no extractable text in '{}'",
                doc.name
            )))
            .at(IngestStage::Extract);
        }
        debug!(doc_id, chars = text.len(), "extracted");

        // Chunked
        let chunks = self.chunker.chunk(&text);
        if chunks.is_empty() {
            return Err(PipelineError::client_data(format!(
                "'{}' produced no fragments",
                doc.name
            )))
            .at(IngestStage::Chunk);
        }
        debug!(doc_id, fragments = chunks.len(), "chunked");

        // Embedded
        let embeddings = self.embedder.embed_many(&chunks, cancel).await;
        if cancel.is_cancelled() {
            return Err(PipelineError::transient(Service::Embedding, "request cancelled"))
                .at(IngestStage::Embed);
        }
        let missing = embeddings.iter().filter(|e| e.is_empty()).count();
        if missing > 0 {
            return Err(PipelineError::transient(
                Service::Embedding,
                format!(
                    "embeddings unavailable for {} of {} fragments",
                    missing,
                    chunks.len()
                ),
            ))
            .at(IngestStage::Embed);
        }
        debug!(doc_id, "embedded");

        // Indexed
        let records: Vec<FragmentRecord> = chunks
            .into_iter()
            .zip(embeddings)
            .enumerate()
            .map(|(ordinal, (text, embedding))| FragmentRecord {
                id: fragment_id(doc_id, ordinal),
                doc_id: doc_id.to_string(),
                ordinal,
                text,
                embedding,
            })
            .collect();

        self.index_with_retry(doc_id, &records, cancel)
            .await
            .at(IngestStage::Index)?;
        debug!(doc_id, fragments = records.len(), "indexed");

        if self.options.mirror_chunks {
            self.mirror(doc_id, &records).await;
        }

        Ok(IngestReport {
            doc_id: doc_id.to_string(),
            num_chunks: records.len(),
            fragment_ids: records.into_iter().map(|r| r.id).collect(),
        })
    }

    fn scratch_file(&self, file_name: &str) -> Result<tempfile::NamedTempFile, PipelineError> {
        std::fs::create_dir_all(&self.options.scratch_dir).map_err(|e| {
            PipelineError::internal(format!(
                "cannot create scratch dir {}: {}",
                self.options.scratch_dir.display(),
                e
            ))
        })?;
        tempfile::Builder::new()
            .prefix("docrag-")
            .suffix(&format!("-{}", crate::blob::sanitize_file_name(file_name)))
            .tempfile_in(&self.options.scratch_dir)
            .map_err(|e| PipelineError::internal(format!("cannot create scratch file: {}", e)))
    }

    /// Upsert `records`, re-sending only the fragments that failed.
    async fn index_with_retry(
        &self,
        doc_id: &str,
        records: &[FragmentRecord],
        cancel: &CancellationToken,
    ) -> Result<(), PipelineError> {
        let mut pending: Vec<FragmentRecord> = records.to_vec();

        for attempt in 0..=self.options.upsert_retries {
            let report = guard::bounded_typed(
                Service::VectorIndex,
                self.options.index_timeout,
                cancel,
                self.index.upsert(&pending),
            )
            .await?;

            if report.is_complete() {
                return Ok(());
            }

            let failed: HashSet<&str> = report.failed.iter().map(|f| f.id.as_str()).collect();
            warn!(
                doc_id,
                attempt,
                failed = failed.len(),
                first_reason = %report.failed[0].reason,
                "some fragments failed to index"
            );
            if attempt == self.options.upsert_retries {
                return Err(PipelineError::transient(
                    Service::VectorIndex,
                    format!(
                        "{} of {} fragments failed to index: {}",
                        failed.len(),
                        records.len(),
                        report.failed[0].reason
                    ),
                ));
            }
            pending.retain(|r| failed.contains(r.id.as_str()));
        }

        Ok(())
    }

    async fn mirror(&self, doc_id: &str, records: &[FragmentRecord]) {
        let now = chrono::Utc::now();
        let rows: Vec<ChunkMirror> = records
            .iter()
            .map(|r| ChunkMirror {
                id: r.id.clone(),
                document_id: doc_id.to_string(),
                ordinal: r.ordinal as i64,
                text: r.text.clone(),
                embedding: serde_json::to_string(&r.embedding).ok(),
                created_at: now,
            })
            .collect();

        if let Err(e) = self.metadata.replace_chunk_mirror(doc_id, &rows).await {
            warn!(doc_id, error = %e, "chunk mirror not updated");
        }
    }
}

/// Unparseable files are the client's problem; I/O on our scratch file is ours.
fn classify_extract_error(err: ExtractError) -> PipelineError {
    match err {
        ExtractError::Pdf(_) | ExtractError::Docx(_) => PipelineError::client_data(err.to_string()),
        ExtractError::Io(_) => PipelineError::internal(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{FailedUpsert, UpsertReport};
    use crate::models::IndexHit;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Fails each id in `flaky` on its first upsert; records every batch.
    struct FlakyIndex {
        flaky: Mutex<HashSet<String>>,
        batches: Mutex<Vec<Vec<String>>>,
    }

    #[async_trait]
    impl VectorIndex for FlakyIndex {
        fn dims(&self) -> usize {
            1
        }
        async fn ensure_schema(&self) -> crate::error::Result<()> {
            Ok(())
        }
        async fn upsert(&self, fragments: &[FragmentRecord]) -> crate::error::Result<UpsertReport> {
            self.batches
                .lock()
                .unwrap()
                .push(fragments.iter().map(|f| f.id.clone()).collect());
            let mut flaky = self.flaky.lock().unwrap();
            let mut report = UpsertReport::default();
            for f in fragments {
                if flaky.remove(&f.id) {
                    report.failed.push(FailedUpsert {
                        id: f.id.clone(),
                        reason: "throttled".into(),
                    });
                } else {
                    report.succeeded.push(f.id.clone());
                }
            }
            Ok(report)
        }
        async fn search(&self, _: &[f32], _: usize, _: Option<&str>) -> crate::error::Result<Vec<IndexHit>> {
            Ok(Vec::new())
        }
        async fn count(&self, _: Option<&str>) -> crate::error::Result<usize> {
            Ok(0)
        }
    }

    #[test]
    fn extract_errors_are_classified() {
        assert!(classify_extract_error(ExtractError::Pdf("bad xref".into())).is_client_fault());
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk");
        assert!(!classify_extract_error(ExtractError::Io(io)).is_client_fault());
    }

    #[test]
    fn failure_names_its_stage() {
        let failure = IngestFailure {
            stage: IngestStage::Extract,
            error: PipelineError::client_data("no extractable text in 'scan.pdf'"),
        };
        assert_eq!(
            failure.to_string(),
            "ingestion failed at extract stage: no extractable text in 'scan.pdf'"
        );
    }

    #[tokio::test]
    async fn retries_only_failed_fragments() {
        use crate::blob::LocalBlobStore;
        use crate::chunk::TextTokenizer;
        use crate::embedding::DisabledProvider;
        use crate::{db, metadata::SqliteMetadataStore, migrate};

        let tmp = tempfile::TempDir::new().unwrap();
        let pool = db::connect_path(&tmp.path().join("m.sqlite")).await.unwrap();
        migrate::run_migrations(&pool).await.unwrap();

        let index = Arc::new(FlakyIndex {
            flaky: Mutex::new(["d_1".to_string()].into_iter().collect()),
            batches: Mutex::new(Vec::new()),
        });
        let pipeline = IngestionPipeline::new(
            Arc::new(SqliteMetadataStore::new(pool)),
            Arc::new(LocalBlobStore::new(tmp.path().join("blobs"))),
            Arc::new(Chunker::new(10, 2, TextTokenizer::Words).unwrap()),
            Embedder::new(Arc::new(DisabledProvider), 8, Duration::from_secs(1)),
            index.clone(),
            IngestOptions {
                scratch_dir: tmp.path().join("scratch"),
                mirror_chunks: false,
                storage_timeout: Duration::from_secs(5),
                extract_timeout: Duration::from_secs(5),
                index_timeout: Duration::from_secs(5),
                upsert_retries: 1,
            },
        );

        let records: Vec<FragmentRecord> = (0..3)
            .map(|i| FragmentRecord {
                id: fragment_id("d", i),
                doc_id: "d".into(),
                ordinal: i,
                text: format!("t{}", i),
                embedding: vec![1.0],
            })
            .collect();
        pipeline
            .index_with_retry("d", &records, &CancellationToken::new())
            .await
            .unwrap();

        let batches = index.batches.lock().unwrap().clone();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[1], vec!["d_1".to_string()]);
    }
}
