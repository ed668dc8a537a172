//! Application wiring.
//!
//! [`App`] builds every collaborator once from [`Config`] and hands the
//! same instances to both pipelines. Tests construct it with [`App::new`]
//! and substitute their own trait objects.

use anyhow::Context;
use chrono::Utc;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::blob::{self, BlobStore};
use crate::chat;
use crate::chunk::Chunker;
use crate::config::Config;
use crate::db;
use crate::embedding::Embedder;
use crate::error::{PipelineError, Result, Service};
use crate::guard;
use crate::index::{self, VectorIndex};
use crate::ingest::{IngestFailure, IngestOptions, IngestReport, IngestionPipeline};
use crate::metadata::{MetadataStore, SqliteMetadataStore};
use crate::migrate;
use crate::models::{Document, Session};
use crate::query::{Answer, ChatQuery, QueryOptions, QueryPipeline};

pub struct App {
    metadata: Arc<dyn MetadataStore>,
    blobs: Arc<dyn BlobStore>,
    index: Arc<dyn VectorIndex>,
    ingest: IngestionPipeline,
    query: QueryPipeline,
    scratch_dir: PathBuf,
    storage_timeout: Duration,
}

impl App {
    /// Connect to every configured service, run metadata migrations and
    /// create the vector index schema if it is missing.
    pub async fn from_config(config: &Config) -> anyhow::Result<Self> {
        let pool = db::connect(config).await?;
        migrate::run_migrations(&pool).await?;

        let metadata: Arc<dyn MetadataStore> = Arc::new(SqliteMetadataStore::new(pool.clone()));
        let blobs = blob::create_blob_store(&config.storage)?;
        let chunker = Arc::new(Chunker::from_config(&config.chunking)?);
        let embedder = Embedder::from_config(&config.embedding)?;
        let index = index::create_index(&config.index, embedder.dims(), &pool)?;
        index
            .ensure_schema()
            .await
            .with_context(|| format!("failed to prepare vector index '{}'", config.index.name))?;
        let chat = chat::create_chat(&config.chat)?;

        info!(
            storage = %config.storage.backend,
            index = %config.index.backend,
            embedding = embedder.model_name(),
            chat = chat.model_name(),
            "services configured"
        );

        Ok(Self::new(
            metadata,
            blobs,
            chunker,
            embedder,
            index,
            chat,
            IngestOptions::from_config(config),
            QueryOptions::from_config(config),
        ))
    }

    #[allow(clippy::too_many_arguments)]
    pub fn new(
        metadata: Arc<dyn MetadataStore>,
        blobs: Arc<dyn BlobStore>,
        chunker: Arc<Chunker>,
        embedder: Embedder,
        index: Arc<dyn VectorIndex>,
        chat: Arc<dyn chat::ChatModel>,
        ingest_options: IngestOptions,
        query_options: QueryOptions,
    ) -> Self {
        let scratch_dir = ingest_options.scratch_dir.clone();
        let storage_timeout = ingest_options.storage_timeout;
        let ingest = IngestionPipeline::new(
            metadata.clone(),
            blobs.clone(),
            chunker,
            embedder.clone(),
            index.clone(),
            ingest_options,
        );
        let query = QueryPipeline::new(embedder, index.clone(), chat, query_options);
        Self {
            metadata,
            blobs,
            index,
            ingest,
            query,
            scratch_dir,
            storage_timeout,
        }
    }

    /// Create the vector index schema if it does not exist.
    pub async fn ensure_index(&self) -> Result<()> {
        self.index.ensure_schema().await
    }

    /// Store an uploaded file and record its Document row.
    pub async fn upload(
        &self,
        file_name: &str,
        bytes: &[u8],
        session_id: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<Document> {
        if bytes.is_empty() {
            return Err(PipelineError::client_data("uploaded file is empty"));
        }
        if let Some(sid) = session_id {
            if self.get_session(sid).await?.is_none() {
                return Err(PipelineError::not_found("session", sid));
            }
        }

        let display_name = blob::sanitize_file_name(file_name);
        let blob_name = blob::upload_blob_name(file_name, Utc::now());

        let staged = self
            .stage(bytes)
            .map_err(|e| PipelineError::internal(format!("{:#}", e)))?;
        guard::bounded(
            Service::Storage,
            self.storage_timeout,
            cancel,
            self.blobs.put(staged.path(), &blob_name),
        )
        .await?;
        drop(staged);

        let doc = self
            .metadata
            .create_document(session_id, &display_name, &blob_name)
            .await
            .map_err(|e| PipelineError::from_service(Service::Metadata, e))?;
        info!(doc_id = %doc.id, blob = %blob_name, bytes = bytes.len(), "uploaded document");
        Ok(doc)
    }

    fn stage(&self, bytes: &[u8]) -> anyhow::Result<tempfile::NamedTempFile> {
        std::fs::create_dir_all(&self.scratch_dir)
            .with_context(|| format!("cannot create {}", self.scratch_dir.display()))?;
        let mut staged = tempfile::Builder::new()
            .prefix("docrag-upload-")
            .tempfile_in(&self.scratch_dir)?;
        staged.write_all(bytes)?;
        staged.flush()?;
        Ok(staged)
    }

    pub async fn process(
        &self,
        doc_id: &str,
        cancel: &CancellationToken,
    ) -> std::result::Result<IngestReport, IngestFailure> {
        self.ingest.process(doc_id, cancel).await
    }

    pub async fn ask(&self, query: &ChatQuery, cancel: &CancellationToken) -> Result<Answer> {
        self.query.answer(query, cancel).await
    }

    pub async fn create_session(&self, user_id: &str) -> Result<Session> {
        if user_id.trim().is_empty() {
            return Err(PipelineError::client_data("user_id must not be empty"));
        }
        self.metadata
            .create_session(user_id)
            .await
            .map_err(|e| PipelineError::from_service(Service::Metadata, e))
    }

    pub async fn get_session(&self, id: &str) -> Result<Option<Session>> {
        self.metadata
            .get_session(id)
            .await
            .map_err(|e| PipelineError::from_service(Service::Metadata, e))
    }

    pub async fn list_documents(&self, session_id: Option<&str>) -> Result<Vec<Document>> {
        self.metadata
            .list_documents(session_id)
            .await
            .map_err(|e| PipelineError::from_service(Service::Metadata, e))
    }

    pub async fn list_blobs(&self, prefix: &str, cancel: &CancellationToken) -> Result<Vec<String>> {
        guard::bounded(
            Service::Storage,
            self.storage_timeout,
            cancel,
            self.blobs.list(prefix),
        )
        .await
    }

    /// Fragments currently indexed, optionally for one document.
    pub async fn indexed_fragments(&self, doc_id: Option<&str>) -> Result<usize> {
        self.index.count(doc_id).await
    }
}
