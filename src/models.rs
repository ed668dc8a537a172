//! Core data models used throughout the service.
//!
//! These types represent the sessions, documents, and fragments that flow
//! through the ingestion and query pipelines.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Groups uploaded documents under one user.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Session {
    pub id: String,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
}

/// One uploaded file. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Document {
    pub id: String,
    pub session_id: Option<String>,
    /// Original client file name; its extension selects the extractor.
    pub name: String,
    /// Blob name in external storage.
    pub blob_url: String,
    pub created_at: DateTime<Utc>,
}

/// A bounded span of a document's text together with its embedding,
/// as written to the vector index.
#[derive(Debug, Clone, PartialEq)]
pub struct FragmentRecord {
    /// `"{doc_id}_{ordinal}"`, see [`crate::chunk::fragment_id`].
    pub id: String,
    pub doc_id: String,
    pub ordinal: usize,
    pub text: String,
    pub embedding: Vec<f32>,
}

/// Non-authoritative relational copy of a fragment (`chunks` table).
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkMirror {
    pub id: String,
    pub document_id: String,
    pub ordinal: i64,
    pub text: String,
    /// Embedding serialized as a JSON array, `None` when unavailable.
    pub embedding: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A fragment returned by vector search.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexHit {
    pub id: String,
    pub doc_id: String,
    pub ordinal: usize,
    pub text: String,
    pub score: f32,
}
