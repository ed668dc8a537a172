//! Blob storage for uploaded files.
//!
//! Defines the [`BlobStore`] trait consumed by the upload path and the
//! ingestion pipeline, with three backends:
//!
//! - **[`LocalBlobStore`]**: a directory on local disk; blob names map to
//!   relative paths under the root.
//! - **[`S3BlobStore`]**: an S3 bucket (or S3-compatible service) accessed
//!   through the REST API with AWS Signature V4 authentication.
//! - **[`AzureBlobStore`]**: an Azure Storage container accessed through
//!   the Blob REST API with Shared Key authentication.
//!
//! # Configuration
//!
//! ```toml
//! [storage]
//! backend = "s3"
//! bucket = "acme-uploads"
//! region = "us-east-1"
//! prefix = "docrag/"
//! # endpoint_url = "http://localhost:9000"   # MinIO, path-style addressing
//! ```
//!
//! ```toml
//! [storage]
//! backend = "azure"
//! account = "acmestorage"
//! container = "uploads"
//! # endpoint_url = "http://127.0.0.1:10000/devstoreaccount1"   # Azurite
//! ```
//!
//! S3 credentials are read from `AWS_ACCESS_KEY_ID`, `AWS_SECRET_ACCESS_KEY`
//! and optionally `AWS_SESSION_TOKEN`; the Azure account key from
//! `AZURE_STORAGE_ACCOUNT_KEY`.

mod azure;
mod s3;

pub use azure::AzureBlobStore;
pub use s3::S3BlobStore;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::StorageConfig;

/// Object storage consumed by the pipelines.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Upload the file at `local_path` under `blob_name`, overwriting.
    async fn put(&self, local_path: &Path, blob_name: &str) -> Result<()>;

    /// Download `blob_name` into `local_path`. Errors if the blob is absent.
    async fn get(&self, blob_name: &str, local_path: &Path) -> Result<()>;

    /// List blob names starting with `prefix`, sorted.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;
}

/// Build the blob name for an upload: `"{UTC %Y%m%d%H%M%S}_{filename}"`.
///
/// Directory components of the client-supplied name are dropped. Two
/// uploads of the same file name within one second collide.
pub fn upload_blob_name(file_name: &str, now: DateTime<Utc>) -> String {
    format!("{}_{}", now.format("%Y%m%d%H%M%S"), sanitize_file_name(file_name))
}

/// Strip any directory components from a client-supplied file name.
pub fn sanitize_file_name(file_name: &str) -> String {
    let base = file_name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim();
    if base.is_empty() || base == "." || base == ".." {
        "upload".to_string()
    } else {
        base.to_string()
    }
}

/// Create the configured [`BlobStore`].
pub fn create_blob_store(config: &StorageConfig) -> Result<Arc<dyn BlobStore>> {
    match config.backend.as_str() {
        "local" => Ok(Arc::new(LocalBlobStore::new(config.root.clone()))),
        "s3" => Ok(Arc::new(S3BlobStore::from_config(config)?)),
        "azure" => Ok(Arc::new(AzureBlobStore::from_config(config)?)),
        other => bail!("Unknown storage backend: {}", other),
    }
}

// ============ Local directory ============

/// Blob store backed by a local directory.
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn resolve(&self, blob_name: &str) -> Result<PathBuf> {
        let rel = Path::new(blob_name);
        let safe = !blob_name.is_empty()
            && rel
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !safe {
            bail!("invalid blob name: '{}'", blob_name);
        }
        Ok(self.root.join(rel))
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn put(&self, local_path: &Path, blob_name: &str) -> Result<()> {
        let dest = self.resolve(blob_name)?;
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(local_path, &dest)
            .await
            .with_context(|| format!("failed to store blob {}", blob_name))?;
        info!(blob = blob_name, "uploaded blob");
        Ok(())
    }

    async fn get(&self, blob_name: &str, local_path: &Path) -> Result<()> {
        let src = self.resolve(blob_name)?;
        tokio::fs::copy(&src, local_path)
            .await
            .with_context(|| format!("blob not readable: {}", blob_name))?;
        debug!(blob = blob_name, "downloaded blob");
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let root = self.root.clone();
        let prefix = prefix.to_string();
        tokio::task::spawn_blocking(move || {
            let mut names = Vec::new();
            for entry in walkdir::WalkDir::new(&root) {
                let entry = entry?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let rel = entry.path().strip_prefix(&root)?;
                let name = rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                if name.starts_with(&prefix) {
                    names.push(name);
                }
            }
            names.sort();
            Ok::<_, anyhow::Error>(names)
        })
        .await?
    }
}

// ============ Shared REST helpers ============

type HmacSha256 = Hmac<Sha256>;

/// A request ready to send: URL plus the headers that were signed.
struct SignedRequest {
    url: String,
    headers: Vec<(String, String)>,
}

impl SignedRequest {
    fn apply(&self, mut req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        for (k, v) in &self.headers {
            req = req.header(k.as_str(), v.as_str());
        }
        req
    }
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    // HMAC accepts keys of any length, so new_from_slice cannot fail here.
    let mut mac = match HmacSha256::new_from_slice(key) {
        Ok(mac) => mac,
        Err(_) => unreachable!("HMAC can take key of any size"),
    };
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// URI-encode per RFC 3986, leaving only `A-Z a-z 0-9 - _ . ~` unescaped.
fn uri_encode(s: &str) -> String {
    let mut result = String::new();
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                result.push(byte as char);
            }
            _ => {
                result.push_str(&format!("%{:02X}", byte));
            }
        }
    }
    result
}

/// Encode each `/`-separated segment of a blob path.
fn encode_path(key: &str) -> String {
    key.split('/').map(uri_encode).collect::<Vec<_>>().join("/")
}

/// Text content of the first simple, non-nested `tag`, with XML entities
/// resolved.
fn extract_xml_value(xml: &str, tag: &str) -> Option<String> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let start = xml.find(&open)? + open.len();
    let end = xml[start..].find(&close)?;
    let raw = &xml[start..start + end];
    match quick_xml::escape::unescape(raw) {
        Ok(text) => Some(text.into_owned()),
        Err(_) => Some(raw.to_string()),
    }
}

/// Text content of every `<block>` element in `xml`, in document order.
fn xml_blocks<'a>(xml: &'a str, block: &str) -> Vec<&'a str> {
    let open = format!("<{}>", block);
    let close = format!("</{}>", block);
    let mut blocks = Vec::new();
    let mut remaining = xml;
    while let Some(start) = remaining.find(&open) {
        let block_start = start + open.len();
        let Some(end) = remaining[block_start..].find(&close) else {
            break;
        };
        blocks.push(&remaining[block_start..block_start + end]);
        remaining = &remaining[block_start + end + close.len()..];
    }
    blocks
}
