//! Azure Storage backend: Blob REST API with Shared Key authentication.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use std::path::Path;
use tracing::{debug, info};

use super::{
    encode_path, extract_xml_value, hmac_sha256, uri_encode, xml_blocks, BlobStore, SignedRequest,
};
use crate::config::StorageConfig;

/// `x-ms-version` sent with every request.
const STORAGE_API_VERSION: &str = "2021-08-06";

/// Blob store backed by an Azure Storage container.
///
/// Talks to `https://{account}.blob.core.windows.net` unless `endpoint_url`
/// is set, in which case the endpoint may carry a path (Azurite serves
/// `http://127.0.0.1:10000/{account}`).
pub struct AzureBlobStore {
    account: String,
    container: String,
    prefix: String,
    /// `scheme://host[:port]`
    origin: String,
    /// Path component of the endpoint, empty or starting with `/`.
    base_path: String,
    key: Vec<u8>,
    client: reqwest::Client,
}

impl AzureBlobStore {
    /// # Errors
    ///
    /// Returns an error if `storage.account` or `storage.container` is unset,
    /// or `AZURE_STORAGE_ACCOUNT_KEY` is missing or not base64.
    pub fn from_config(config: &StorageConfig) -> Result<Self> {
        let account = config
            .account
            .clone()
            .ok_or_else(|| anyhow::anyhow!("storage.account required for azure backend"))?;
        let container = config
            .container
            .clone()
            .ok_or_else(|| anyhow::anyhow!("storage.container required for azure backend"))?;
        let account_key = std::env::var("AZURE_STORAGE_ACCOUNT_KEY")
            .context("AZURE_STORAGE_ACCOUNT_KEY environment variable not set")?;
        Self::new(
            account,
            container,
            config.prefix.clone(),
            config.endpoint_url.as_deref(),
            &account_key,
        )
    }

    pub fn new(
        account: String,
        container: String,
        prefix: String,
        endpoint_url: Option<&str>,
        account_key: &str,
    ) -> Result<Self> {
        let key = BASE64
            .decode(account_key.trim())
            .context("Azure storage account key is not valid base64")?;

        let endpoint = match endpoint_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => format!("https://{}.blob.core.windows.net", account),
        };
        let Some((scheme, rest)) = endpoint.split_once("://") else {
            bail!("storage.endpoint_url must include a scheme: '{}'", endpoint);
        };
        let (host, base_path) = match rest.find('/') {
            Some(i) => (&rest[..i], rest[i..].to_string()),
            None => (rest, String::new()),
        };

        Ok(Self {
            origin: format!("{}://{}", scheme, host),
            base_path,
            account,
            container,
            prefix,
            key,
            client: reqwest::Client::new(),
        })
    }

    fn container_path(&self) -> String {
        format!("{}/{}", self.base_path, uri_encode(&self.container))
    }

    fn blob_path(&self, blob_name: &str) -> String {
        format!(
            "{}/{}",
            self.container_path(),
            encode_path(&format!("{}{}", self.prefix, blob_name))
        )
    }

    /// Sign a request for `path` (already URI-encoded) with the account key.
    ///
    /// `content_length` must equal the body length reqwest will send.
    fn sign(
        &self,
        method: &str,
        path: &str,
        query: &[(&str, String)],
        content_length: usize,
        extra_headers: &[(&str, &str)],
        now: DateTime<Utc>,
    ) -> SignedRequest {
        let mut headers: Vec<(String, String)> = vec![
            (
                "x-ms-date".to_string(),
                now.format("%a, %d %b %Y %H:%M:%S GMT").to_string(),
            ),
            ("x-ms-version".to_string(), STORAGE_API_VERSION.to_string()),
        ];
        headers.extend(
            extra_headers
                .iter()
                .map(|(k, v)| (k.to_ascii_lowercase(), v.to_string())),
        );
        headers.sort_by(|a, b| a.0.cmp(&b.0));

        let mut params: Vec<(&str, &str)> = query.iter().map(|(k, v)| (*k, v.as_str())).collect();
        params.sort();

        let mut canonical_resource = format!("/{}{}", self.account, path);
        for (k, v) in &params {
            canonical_resource.push_str(&format!("\n{}:{}", k.to_ascii_lowercase(), v));
        }

        let to_sign = string_to_sign(method, content_length, &headers, &canonical_resource);
        let signature = BASE64.encode(hmac_sha256(&self.key, to_sign.as_bytes()));

        let mut url = format!("{}{}", self.origin, path);
        if !params.is_empty() {
            let query_string = params
                .iter()
                .map(|(k, v)| format!("{}={}", k, uri_encode(v)))
                .collect::<Vec<_>>()
                .join("&");
            url.push('?');
            url.push_str(&query_string);
        }

        headers.push((
            "Authorization".to_string(),
            format!("SharedKey {}:{}", self.account, signature),
        ));
        SignedRequest { url, headers }
    }
}

#[async_trait]
impl BlobStore for AzureBlobStore {
    async fn put(&self, local_path: &Path, blob_name: &str) -> Result<()> {
        let body = tokio::fs::read(local_path)
            .await
            .with_context(|| format!("failed to read {}", local_path.display()))?;
        let path = self.blob_path(blob_name);
        let signed = self.sign(
            "PUT",
            &path,
            &[],
            body.len(),
            &[("x-ms-blob-type", "BlockBlob")],
            Utc::now(),
        );

        let resp = signed
            .apply(self.client.put(&signed.url).body(body))
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to put blob {}/{}: {}", self.container, blob_name, e))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            bail!(
                "Azure Put Blob failed (HTTP {}) for '{}': {}",
                status,
                blob_name,
                body.chars().take(500).collect::<String>()
            );
        }
        info!(blob = blob_name, container = %self.container, "uploaded blob");
        Ok(())
    }

    async fn get(&self, blob_name: &str, local_path: &Path) -> Result<()> {
        let path = self.blob_path(blob_name);
        let signed = self.sign("GET", &path, &[], 0, &[], Utc::now());

        let resp = signed
            .apply(self.client.get(&signed.url))
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to get blob {}/{}: {}", self.container, blob_name, e))?;
        if !resp.status().is_success() {
            bail!(
                "Azure Get Blob failed (HTTP {}) for '{}'",
                resp.status(),
                blob_name
            );
        }

        let bytes = resp.bytes().await?;
        tokio::fs::write(local_path, &bytes)
            .await
            .with_context(|| format!("failed to write {}", local_path.display()))?;
        debug!(blob = blob_name, bytes = bytes.len(), "downloaded blob");
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let full_prefix = format!("{}{}", self.prefix, prefix);
        let path = self.container_path();
        let mut names = Vec::new();
        let mut marker: Option<String> = None;

        loop {
            let mut query = vec![
                ("restype", "container".to_string()),
                ("comp", "list".to_string()),
            ];
            if !full_prefix.is_empty() {
                query.push(("prefix", full_prefix.clone()));
            }
            if let Some(ref m) = marker {
                query.push(("marker", m.clone()));
            }

            let signed = self.sign("GET", &path, &query, 0, &[], Utc::now());
            let resp = signed
                .apply(self.client.get(&signed.url))
                .send()
                .await
                .map_err(|e| anyhow::anyhow!("Failed to list container {}: {}", self.container, e))?;
            if !resp.status().is_success() {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                bail!(
                    "Azure List Blobs failed (HTTP {}): {}",
                    status,
                    body.chars().take(500).collect::<String>()
                );
            }

            let xml_body = resp.text().await?;
            let (blobs, next_marker) = parse_blob_list(&xml_body);
            names.extend(blobs.into_iter().map(|name| {
                name.strip_prefix(&self.prefix)
                    .map(str::to_string)
                    .unwrap_or(name)
            }));

            match next_marker {
                Some(next) => marker = Some(next),
                None => break,
            }
        }

        names.sort();
        Ok(names)
    }
}

/// Shared Key string-to-sign for the Blob service.
///
/// Only `Content-Length` among the standard headers is ever sent; it is
/// empty for bodiless requests.
fn string_to_sign(
    method: &str,
    content_length: usize,
    ms_headers: &[(String, String)],
    canonical_resource: &str,
) -> String {
    let length = if content_length == 0 {
        String::new()
    } else {
        content_length.to_string()
    };
    // VERB, Content-Encoding, Content-Language, Content-Length
    let mut out = format!("{}\n\n\n{}\n", method, length);
    // Content-MD5, Content-Type, Date, If-Modified-Since, If-Match,
    // If-None-Match, If-Unmodified-Since, Range
    out.push_str(&"\n".repeat(8));
    for (k, v) in ms_headers {
        out.push_str(&format!("{}:{}\n", k, v.trim()));
    }
    out.push_str(canonical_resource);
    out
}

/// Parse a List Blobs response into blob names and the continuation marker.
fn parse_blob_list(xml: &str) -> (Vec<String>, Option<String>) {
    let names = xml_blocks(xml, "Blob")
        .into_iter()
        .filter_map(|block| extract_xml_value(block, "Name"))
        .filter(|name| !name.is_empty())
        .collect();
    let next_marker = extract_xml_value(xml, "NextMarker").filter(|m| !m.is_empty());
    (names, next_marker)
}
