//! Vector index: the authoritative store of fragment vectors.
//!
//! Fragments are keyed by their synthetic id (`"{doc_id}_{ordinal}"`), so
//! upserting a re-chunked document overwrites its fragments rather than
//! duplicating them. Every backend writes each fragment atomically and
//! reports per-item outcomes in an [`UpsertReport`], letting callers retry
//! only the failed subset.
//!
//! # Backends
//!
//! | `index.backend` | Type | Search |
//! |-----------------|------|--------|
//! | `sqlite` | [`SqliteVectorIndex`] | brute-force cosine in Rust |
//! | `memory` | [`InMemoryVectorIndex`] | brute-force cosine in Rust |
//! | `azure` | [`AzureSearchIndex`] | Azure AI Search HNSW vector query |
//!
//! All backends honor the optional document-id filter on search.

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use sqlx::{Row, SqlitePool};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, info};

use crate::config::IndexConfig;
use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use crate::error::{PipelineError, Result, Service};
use crate::http;
use crate::models::{FragmentRecord, IndexHit};

/// Outcome of one bulk upsert.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UpsertReport {
    pub succeeded: Vec<String>,
    pub failed: Vec<FailedUpsert>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailedUpsert {
    pub id: String,
    pub reason: String,
}

impl UpsertReport {
    /// True when every fragment of the batch was written.
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    fn fail(&mut self, id: &str, reason: impl Into<String>) {
        self.failed.push(FailedUpsert {
            id: id.to_string(),
            reason: reason.into(),
        });
    }
}

/// A named collection of fragment vectors.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Embedding dimension fixed for this index.
    fn dims(&self) -> usize;

    /// Create the collection if absent. Idempotent.
    async fn ensure_schema(&self) -> Result<()>;

    /// Insert or overwrite `fragments` by id.
    ///
    /// Fails without writing anything if the batch is malformed (see
    /// [`validate_batch`]); otherwise reports the outcome of each item.
    async fn upsert(&self, fragments: &[FragmentRecord]) -> Result<UpsertReport>;

    /// Top-`k` fragments by decreasing similarity to `query`, restricted to
    /// one document when `doc_filter` is given.
    async fn search(&self, query: &[f32], k: usize, doc_filter: Option<&str>)
        -> Result<Vec<IndexHit>>;

    /// Number of stored fragments, optionally for one document.
    async fn count(&self, doc_filter: Option<&str>) -> Result<usize>;
}

/// Reject a batch in which any fragment lacks an embedding of `dims` values.
pub fn validate_batch(fragments: &[FragmentRecord], dims: usize) -> Result<()> {
    for fragment in fragments {
        if fragment.embedding.is_empty() {
            return Err(PipelineError::internal(format!(
                "malformed upsert batch: fragment {} has no embedding",
                fragment.id
            )));
        }
        if fragment.embedding.len() != dims {
            return Err(PipelineError::internal(format!(
                "malformed upsert batch: fragment {} has {} dims, index expects {}",
                fragment.id,
                fragment.embedding.len(),
                dims
            )));
        }
    }
    Ok(())
}

/// Sort by decreasing score, breaking ties by id so results are stable.
fn rank(mut hits: Vec<IndexHit>, k: usize) -> Vec<IndexHit> {
    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.id.cmp(&b.id))
    });
    hits.truncate(k);
    hits
}

/// Create the configured [`VectorIndex`].
///
/// The SQLite backend shares the metadata store's pool.
pub fn create_index(
    config: &IndexConfig,
    dims: usize,
    pool: &SqlitePool,
) -> anyhow::Result<Arc<dyn VectorIndex>> {
    match config.backend.as_str() {
        "sqlite" => Ok(Arc::new(SqliteVectorIndex::new(
            pool.clone(),
            &config.name,
            dims,
        ))),
        "memory" => Ok(Arc::new(InMemoryVectorIndex::new(dims))),
        "azure" => Ok(Arc::new(AzureSearchIndex::from_config(config, dims)?)),
        other => anyhow::bail!("Unknown index backend: {}", other),
    }
}

// ============ SQLite ============

/// Vector index stored in SQLite next to the metadata tables.
///
/// Several named indexes can share one database; rows are scoped by
/// `index_name`.
pub struct SqliteVectorIndex {
    pool: SqlitePool,
    name: String,
    dims: usize,
}

impl SqliteVectorIndex {
    pub fn new(pool: SqlitePool, name: &str, dims: usize) -> Self {
        Self {
            pool,
            name: name.to_string(),
            dims,
        }
    }

    fn storage_err(e: sqlx::Error) -> PipelineError {
        PipelineError::external(Service::VectorIndex, e.to_string())
    }
}

#[async_trait]
impl VectorIndex for SqliteVectorIndex {
    fn dims(&self) -> usize {
        self.dims
    }

    async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS vector_indexes (
                name TEXT PRIMARY KEY,
                dims INTEGER NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(Self::storage_err)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS index_fragments (
                index_name TEXT NOT NULL,
                id TEXT NOT NULL,
                doc_id TEXT NOT NULL,
                ordinal INTEGER NOT NULL,
                content_text TEXT NOT NULL,
                embedding BLOB NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (index_name, id)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(Self::storage_err)?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_index_fragments_doc ON index_fragments(index_name, doc_id)",
        )
        .execute(&self.pool)
        .await
        .map_err(Self::storage_err)?;

        // Dims are unknown until an embedding provider is configured.
        if self.dims == 0 {
            return Ok(());
        }

        sqlx::query("INSERT OR IGNORE INTO vector_indexes (name, dims, created_at) VALUES (?, ?, ?)")
            .bind(&self.name)
            .bind(self.dims as i64)
            .bind(Utc::now().to_rfc3339())
            .execute(&self.pool)
            .await
            .map_err(Self::storage_err)?;

        let stored: i64 = sqlx::query_scalar("SELECT dims FROM vector_indexes WHERE name = ?")
            .bind(&self.name)
            .fetch_one(&self.pool)
            .await
            .map_err(Self::storage_err)?;
        if stored as usize != self.dims {
            return Err(PipelineError::internal(format!(
                "index '{}' was created with {} dims but embeddings have {}",
                self.name, stored, self.dims
            )));
        }
        Ok(())
    }

    async fn upsert(&self, fragments: &[FragmentRecord]) -> Result<UpsertReport> {
        validate_batch(fragments, self.dims)?;

        let now = Utc::now().to_rfc3339();
        let mut report = UpsertReport::default();
        for fragment in fragments {
            let result = sqlx::query(
                r#"
                INSERT INTO index_fragments (index_name, id, doc_id, ordinal, content_text, embedding, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(index_name, id) DO UPDATE SET
                    doc_id = excluded.doc_id,
                    ordinal = excluded.ordinal,
                    content_text = excluded.content_text,
                    embedding = excluded.embedding,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(&self.name)
            .bind(&fragment.id)
            .bind(&fragment.doc_id)
            .bind(fragment.ordinal as i64)
            .bind(&fragment.text)
            .bind(vec_to_blob(&fragment.embedding))
            .bind(&now)
            .execute(&self.pool)
            .await;

            match result {
                Ok(_) => report.succeeded.push(fragment.id.clone()),
                Err(e) => report.fail(&fragment.id, e.to_string()),
            }
        }

        debug!(
            index = %self.name,
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            "sqlite upsert"
        );
        Ok(report)
    }

    async fn search(
        &self,
        query: &[f32],
        k: usize,
        doc_filter: Option<&str>,
    ) -> Result<Vec<IndexHit>> {
        if k == 0 {
            return Ok(Vec::new());
        }

        let rows = match doc_filter {
            Some(doc_id) => {
                sqlx::query(
                    "SELECT id, doc_id, ordinal, content_text, embedding FROM index_fragments
                     WHERE index_name = ? AND doc_id = ?",
                )
                .bind(&self.name)
                .bind(doc_id)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query(
                    "SELECT id, doc_id, ordinal, content_text, embedding FROM index_fragments
                     WHERE index_name = ?",
                )
                .bind(&self.name)
                .fetch_all(&self.pool)
                .await
            }
        }
        .map_err(Self::storage_err)?;

        let hits = rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                let ordinal: i64 = row.get("ordinal");
                IndexHit {
                    id: row.get("id"),
                    doc_id: row.get("doc_id"),
                    ordinal: ordinal as usize,
                    text: row.get("content_text"),
                    score: cosine_similarity(query, &blob_to_vec(&blob)),
                }
            })
            .collect();

        Ok(rank(hits, k))
    }

    async fn count(&self, doc_filter: Option<&str>) -> Result<usize> {
        let count: i64 = match doc_filter {
            Some(doc_id) => {
                sqlx::query_scalar(
                    "SELECT COUNT(*) FROM index_fragments WHERE index_name = ? AND doc_id = ?",
                )
                .bind(&self.name)
                .bind(doc_id)
                .fetch_one(&self.pool)
                .await
            }
            None => {
                sqlx::query_scalar("SELECT COUNT(*) FROM index_fragments WHERE index_name = ?")
                    .bind(&self.name)
                    .fetch_one(&self.pool)
                    .await
            }
        }
        .map_err(Self::storage_err)?;
        Ok(count as usize)
    }
}

// ============ In-memory ============

/// Process-local index, mostly for tests and ephemeral runs.
pub struct InMemoryVectorIndex {
    dims: usize,
    fragments: RwLock<BTreeMap<String, FragmentRecord>>,
}

impl InMemoryVectorIndex {
    pub fn new(dims: usize) -> Self {
        Self {
            dims,
            fragments: RwLock::new(BTreeMap::new()),
        }
    }

    fn poisoned() -> PipelineError {
        PipelineError::internal("in-memory index lock poisoned")
    }
}

#[async_trait]
impl VectorIndex for InMemoryVectorIndex {
    fn dims(&self) -> usize {
        self.dims
    }

    async fn ensure_schema(&self) -> Result<()> {
        Ok(())
    }

    async fn upsert(&self, fragments: &[FragmentRecord]) -> Result<UpsertReport> {
        validate_batch(fragments, self.dims)?;

        let mut store = self.fragments.write().map_err(|_| Self::poisoned())?;
        let mut report = UpsertReport::default();
        for fragment in fragments {
            store.insert(fragment.id.clone(), fragment.clone());
            report.succeeded.push(fragment.id.clone());
        }
        Ok(report)
    }

    async fn search(
        &self,
        query: &[f32],
        k: usize,
        doc_filter: Option<&str>,
    ) -> Result<Vec<IndexHit>> {
        let store = self.fragments.read().map_err(|_| Self::poisoned())?;
        let hits = store
            .values()
            .filter(|f| doc_filter.map_or(true, |doc_id| f.doc_id == doc_id))
            .map(|f| IndexHit {
                id: f.id.clone(),
                doc_id: f.doc_id.clone(),
                ordinal: f.ordinal,
                text: f.text.clone(),
                score: cosine_similarity(query, &f.embedding),
            })
            .collect();
        Ok(rank(hits, k))
    }

    async fn count(&self, doc_filter: Option<&str>) -> Result<usize> {
        let store = self.fragments.read().map_err(|_| Self::poisoned())?;
        Ok(store
            .values()
            .filter(|f| doc_filter.map_or(true, |doc_id| f.doc_id == doc_id))
            .count())
    }
}

// ============ Azure AI Search ============

/// Retries for a single REST call; pipeline-level retries sit above this.
const AZURE_HTTP_RETRIES: u32 = 3;
/// Azure AI Search accepts at most 1000 actions per indexing request.
const AZURE_MAX_BATCH: usize = 1000;

/// Index hosted in Azure AI Search, accessed through its REST API.
///
/// The API key is read from `AZURE_SEARCH_API_KEY`.
pub struct AzureSearchIndex {
    endpoint: String,
    name: String,
    api_version: String,
    api_key: String,
    dims: usize,
    client: reqwest::Client,
}

impl AzureSearchIndex {
    pub fn from_config(config: &IndexConfig, dims: usize) -> anyhow::Result<Self> {
        let endpoint = config
            .endpoint
            .clone()
            .ok_or_else(|| anyhow::anyhow!("index.endpoint required for azure backend"))?;
        if dims == 0 {
            anyhow::bail!("embedding.dims must be set to use the azure index backend");
        }
        let api_key = std::env::var("AZURE_SEARCH_API_KEY")
            .map_err(|_| anyhow::anyhow!("AZURE_SEARCH_API_KEY environment variable not set"))?;
        Ok(Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            name: config.name.clone(),
            api_version: config.api_version.clone(),
            api_key,
            dims,
            client: http::client(config.timeout())?,
        })
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/indexes/{}{}?api-version={}",
            self.endpoint, self.name, path, self.api_version
        )
    }

    fn service_err(e: impl std::fmt::Display) -> PipelineError {
        PipelineError::external(Service::VectorIndex, e.to_string())
    }

    fn schema_body(&self) -> serde_json::Value {
        serde_json::json!({
            "name": self.name,
            "fields": [
                {"name": "id", "type": "Edm.String", "key": true, "filterable": true},
                {"name": "doc_id", "type": "Edm.String", "filterable": true},
                {"name": "chunk_id", "type": "Edm.Int32", "filterable": true, "sortable": true},
                {"name": "content_text", "type": "Edm.String", "searchable": true},
                {
                    "name": "embedding",
                    "type": "Collection(Edm.Single)",
                    "searchable": true,
                    "dimensions": self.dims,
                    "vectorSearchProfile": "default-profile"
                }
            ],
            "vectorSearch": {
                "algorithms": [{"name": "default-hnsw", "kind": "hnsw"}],
                "profiles": [{"name": "default-profile", "algorithm": "default-hnsw"}]
            }
        })
    }

    async fn post_json(&self, path: &str, body: &serde_json::Value) -> Result<serde_json::Value> {
        let url = self.url(path);
        let response = http::send_with_retry("Azure Search", AZURE_HTTP_RETRIES, || {
            self.client
                .post(&url)
                .header("api-key", &self.api_key)
                .json(body)
        })
        .await
        .map_err(Self::service_err)?;
        response.json().await.map_err(Self::service_err)
    }
}

/// OData string literal: single quotes are doubled.
fn odata_eq(field: &str, value: &str) -> String {
    format!("{} eq '{}'", field, value.replace('\'', "''"))
}

/// Map the per-item results of a `docs/index` call onto `report`.
fn parse_index_results(json: &serde_json::Value, batch: &[FragmentRecord], report: &mut UpsertReport) {
    let mut seen = std::collections::HashSet::new();
    if let Some(items) = json.get("value").and_then(|v| v.as_array()) {
        for item in items {
            let Some(key) = item.get("key").and_then(|k| k.as_str()) else {
                continue;
            };
            seen.insert(key.to_string());
            if item.get("status").and_then(|s| s.as_bool()).unwrap_or(false) {
                report.succeeded.push(key.to_string());
            } else {
                let reason = item
                    .get("errorMessage")
                    .and_then(|m| m.as_str())
                    .unwrap_or("indexing failed");
                report.fail(key, reason);
            }
        }
    }
    for fragment in batch {
        if !seen.contains(&fragment.id) {
            report.fail(&fragment.id, "missing from indexing response");
        }
    }
}

fn parse_search_results(json: &serde_json::Value) -> Vec<IndexHit> {
    json.get("value")
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .map(|item| IndexHit {
                    id: item["id"].as_str().unwrap_or_default().to_string(),
                    doc_id: item["doc_id"].as_str().unwrap_or_default().to_string(),
                    ordinal: item["chunk_id"].as_u64().unwrap_or(0) as usize,
                    text: item["content_text"].as_str().unwrap_or_default().to_string(),
                    score: item["@search.score"].as_f64().unwrap_or(0.0) as f32,
                })
                .collect()
        })
        .unwrap_or_default()
}

#[async_trait]
impl VectorIndex for AzureSearchIndex {
    fn dims(&self) -> usize {
        self.dims
    }

    async fn ensure_schema(&self) -> Result<()> {
        let existing = self
            .client
            .get(self.url(""))
            .header("api-key", &self.api_key)
            .send()
            .await
            .map_err(Self::service_err)?;

        match existing.status().as_u16() {
            200 => return Ok(()),
            404 => {}
            status => {
                return Err(Self::service_err(format!(
                    "unexpected status {} reading index '{}'",
                    status, self.name
                )))
            }
        }

        let url = self.url("");
        let body = self.schema_body();
        http::send_with_retry("Azure Search", AZURE_HTTP_RETRIES, || {
            self.client
                .put(&url)
                .header("api-key", &self.api_key)
                .json(&body)
        })
        .await
        .map_err(Self::service_err)?;

        info!(index = %self.name, dims = self.dims, "created search index");
        Ok(())
    }

    async fn upsert(&self, fragments: &[FragmentRecord]) -> Result<UpsertReport> {
        validate_batch(fragments, self.dims)?;

        let mut report = UpsertReport::default();
        for batch in fragments.chunks(AZURE_MAX_BATCH) {
            let actions: Vec<serde_json::Value> = batch
                .iter()
                .map(|f| {
                    serde_json::json!({
                        "@search.action": "mergeOrUpload",
                        "id": f.id,
                        "doc_id": f.doc_id,
                        "chunk_id": f.ordinal,
                        "content_text": f.text,
                        "embedding": f.embedding,
                    })
                })
                .collect();

            // 207 Multi-Status is a success status; per-item outcomes are in the body.
            match self
                .post_json("/docs/index", &serde_json::json!({ "value": actions }))
                .await
            {
                Ok(json) => parse_index_results(&json, batch, &mut report),
                Err(e) => {
                    let reason = e.to_string();
                    for f in batch {
                        report.fail(&f.id, reason.clone());
                    }
                }
            }
        }
        Ok(report)
    }

    async fn search(
        &self,
        query: &[f32],
        k: usize,
        doc_filter: Option<&str>,
    ) -> Result<Vec<IndexHit>> {
        if k == 0 {
            return Ok(Vec::new());
        }
        let mut body = serde_json::json!({
            "select": "id,doc_id,chunk_id,content_text",
            "top": k,
            "vectorQueries": [{
                "kind": "vector",
                "vector": query,
                "fields": "embedding",
                "k": k
            }]
        });
        if let Some(doc_id) = doc_filter {
            body["filter"] = serde_json::Value::String(odata_eq("doc_id", doc_id));
        }

        let json = self.post_json("/docs/search", &body).await?;
        Ok(rank(parse_search_results(&json), k))
    }

    async fn count(&self, doc_filter: Option<&str>) -> Result<usize> {
        let mut body = serde_json::json!({"search": "*", "count": true, "top": 0});
        if let Some(doc_id) = doc_filter {
            body["filter"] = serde_json::Value::String(odata_eq("doc_id", doc_id));
        }
        let json = self.post_json("/docs/search", &body).await?;
        Ok(json["@odata.count"].as_u64().unwrap_or(0) as usize)
    }
}
