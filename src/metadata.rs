//! Relational metadata store for sessions, documents, and the chunk mirror.
//!
//! The pipelines consume this store only to resolve a document id to its
//! blob location and to write the best-effort audit mirror of indexed
//! fragments. The vector index stays authoritative for retrieval.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row, SqlitePool};
use uuid::Uuid;

use crate::models::{ChunkMirror, Document, Session};

/// Persistence for [`Session`] and [`Document`] rows plus the chunk mirror.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn create_session(&self, user_id: &str) -> Result<Session>;

    async fn get_session(&self, id: &str) -> Result<Option<Session>>;

    /// Record an uploaded file. Fails if `session_id` names no session.
    async fn create_document(
        &self,
        session_id: Option<&str>,
        name: &str,
        blob_url: &str,
    ) -> Result<Document>;

    async fn get_document(&self, id: &str) -> Result<Option<Document>>;

    async fn list_documents(&self, session_id: Option<&str>) -> Result<Vec<Document>>;

    /// Replace every mirror row of `document_id` with `chunks`.
    async fn replace_chunk_mirror(&self, document_id: &str, chunks: &[ChunkMirror]) -> Result<()>;

    async fn count_chunk_mirror(&self, document_id: &str) -> Result<i64>;
}

/// SQLite implementation of [`MetadataStore`].
pub struct SqliteMetadataStore {
    pool: SqlitePool,
}

impl SqliteMetadataStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("invalid timestamp in metadata store: {}", raw))?
        .with_timezone(&Utc))
}

fn row_to_document(row: &SqliteRow) -> Result<Document> {
    let created_at: String = row.get("created_at");
    Ok(Document {
        id: row.get("id"),
        session_id: row.get("session_id"),
        name: row.get("name"),
        blob_url: row.get("blob_url"),
        created_at: parse_ts(&created_at)?,
    })
}

#[async_trait]
impl MetadataStore for SqliteMetadataStore {
    async fn create_session(&self, user_id: &str) -> Result<Session> {
        let session = Session {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            created_at: Utc::now(),
        };

        sqlx::query("INSERT INTO sessions (id, user_id, created_at) VALUES (?, ?, ?)")
            .bind(&session.id)
            .bind(&session.user_id)
            .bind(session.created_at.to_rfc3339())
            .execute(&self.pool)
            .await?;

        Ok(session)
    }

    async fn get_session(&self, id: &str) -> Result<Option<Session>> {
        let row = sqlx::query("SELECT id, user_id, created_at FROM sessions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| {
            let created_at: String = row.get("created_at");
            Ok(Session {
                id: row.get("id"),
                user_id: row.get("user_id"),
                created_at: parse_ts(&created_at)?,
            })
        })
        .transpose()
    }

    async fn create_document(
        &self,
        session_id: Option<&str>,
        name: &str,
        blob_url: &str,
    ) -> Result<Document> {
        let doc = Document {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.map(str::to_string),
            name: name.to_string(),
            blob_url: blob_url.to_string(),
            created_at: Utc::now(),
        };

        sqlx::query(
            "INSERT INTO documents (id, session_id, name, blob_url, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&doc.id)
        .bind(&doc.session_id)
        .bind(&doc.name)
        .bind(&doc.blob_url)
        .bind(doc.created_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to record document {}", name))?;

        Ok(doc)
    }

    async fn get_document(&self, id: &str) -> Result<Option<Document>> {
        let row = sqlx::query(
            "SELECT id, session_id, name, blob_url, created_at FROM documents WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_document).transpose()
    }

    async fn list_documents(&self, session_id: Option<&str>) -> Result<Vec<Document>> {
        let rows = match session_id {
            Some(sid) => {
                sqlx::query(
                    "SELECT id, session_id, name, blob_url, created_at FROM documents
                     WHERE session_id = ? ORDER BY created_at, id",
                )
                .bind(sid)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT id, session_id, name, blob_url, created_at FROM documents
                     ORDER BY created_at, id",
                )
                .fetch_all(&self.pool)
                .await?
            }
        };

        rows.iter().map(row_to_document).collect()
    }

    async fn replace_chunk_mirror(&self, document_id: &str, chunks: &[ChunkMirror]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;

        for chunk in chunks {
            sqlx::query(
                "INSERT INTO chunks (id, document_id, ordinal, text, embedding, created_at)
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(&chunk.id)
            .bind(&chunk.document_id)
            .bind(chunk.ordinal)
            .bind(&chunk.text)
            .bind(&chunk.embedding)
            .bind(chunk.created_at.to_rfc3339())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn count_chunk_mirror(&self, document_id: &str) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks WHERE document_id = ?")
            .bind(document_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{db, migrate};
    use tempfile::TempDir;

    async fn store() -> (TempDir, SqliteMetadataStore) {
        let tmp = TempDir::new().unwrap();
        let pool = db::connect_path(&tmp.path().join("meta.sqlite"))
            .await
            .unwrap();
        migrate::run_migrations(&pool).await.unwrap();
        (tmp, SqliteMetadataStore::new(pool))
    }

    #[tokio::test]
    async fn session_roundtrip() {
        let (_tmp, store) = store().await;
        let created = store.create_session("alice").await.unwrap();
        let fetched = store.get_session(&created.id).await.unwrap().unwrap();
        assert_eq!(fetched.user_id, "alice");
        assert_eq!(fetched.id, created.id);
    }

    #[tokio::test]
    async fn missing_session_is_none() {
        let (_tmp, store) = store().await;
        assert!(store.get_session("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn document_without_session() {
        let (_tmp, store) = store().await;
        let doc = store
            .create_document(None, "notes.txt", "20240101000000_notes.txt")
            .await
            .unwrap();
        let fetched = store.get_document(&doc.id).await.unwrap().unwrap();
        assert_eq!(fetched.session_id, None);
        assert_eq!(fetched.blob_url, "20240101000000_notes.txt");
    }

    #[tokio::test]
    async fn document_with_unknown_session_rejected() {
        let (_tmp, store) = store().await;
        assert!(store
            .create_document(Some("ghost"), "a.txt", "blob")
            .await
            .is_err());
    }

    #[tokio::test]
    async fn list_documents_scoped_by_session() {
        let (_tmp, store) = store().await;
        let s = store.create_session("bob").await.unwrap();
        store
            .create_document(Some(&s.id), "a.md", "blob-a")
            .await
            .unwrap();
        store.create_document(None, "b.md", "blob-b").await.unwrap();

        assert_eq!(store.list_documents(None).await.unwrap().len(), 2);
        let scoped = store.list_documents(Some(&s.id)).await.unwrap();
        assert_eq!(scoped.len(), 1);
        assert_eq!(scoped[0].name, "a.md");
    }

    #[tokio::test]
    async fn chunk_mirror_is_replaced_not_appended() {
        let (_tmp, store) = store().await;
        let doc = store.create_document(None, "a.txt", "blob").await.unwrap();
        let mirror: Vec<ChunkMirror> = (0..3)
            .map(|i| ChunkMirror {
                id: format!("{}_{}", doc.id, i),
                document_id: doc.id.clone(),
                ordinal: i,
                text: format!("chunk {}", i),
                embedding: Some("[0.5]".to_string()),
                created_at: Utc::now(),
            })
            .collect();

        store.replace_chunk_mirror(&doc.id, &mirror).await.unwrap();
        store.replace_chunk_mirror(&doc.id, &mirror).await.unwrap();
        assert_eq!(store.count_chunk_mirror(&doc.id).await.unwrap(), 3);
    }
}
