//! S3 backend: REST API with AWS Signature V4.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::path::Path;
use tracing::{debug, info};

use super::{encode_path, extract_xml_value, hmac_sha256, uri_encode, xml_blocks, BlobStore, SignedRequest};
use crate::config::StorageConfig;

/// AWS credentials loaded from environment variables.
struct AwsCredentials {
    access_key_id: String,
    secret_access_key: String,
    session_token: Option<String>,
}

impl AwsCredentials {
    fn from_env() -> Result<Self> {
        let access_key_id = std::env::var("AWS_ACCESS_KEY_ID")
            .context("AWS_ACCESS_KEY_ID environment variable not set")?;
        let secret_access_key = std::env::var("AWS_SECRET_ACCESS_KEY")
            .context("AWS_SECRET_ACCESS_KEY environment variable not set")?;
        let session_token = std::env::var("AWS_SESSION_TOKEN").ok();

        Ok(Self {
            access_key_id,
            secret_access_key,
            session_token,
        })
    }
}

/// Blob store backed by an S3 bucket.
///
/// Uses virtual-hosted addressing against AWS and path-style addressing
/// when a custom `endpoint_url` is configured.
pub struct S3BlobStore {
    bucket: String,
    region: String,
    prefix: String,
    endpoint_url: Option<String>,
    creds: AwsCredentials,
    client: reqwest::Client,
}

impl S3BlobStore {
    pub fn from_config(config: &StorageConfig) -> Result<Self> {
        let bucket = config
            .bucket
            .clone()
            .ok_or_else(|| anyhow::anyhow!("storage.bucket required for s3 backend"))?;
        Ok(Self {
            bucket,
            region: config.region.clone(),
            prefix: config.prefix.clone(),
            endpoint_url: config.endpoint_url.clone(),
            creds: AwsCredentials::from_env()?,
            client: reqwest::Client::new(),
        })
    }

    fn full_key(&self, blob_name: &str) -> String {
        format!("{}{}", self.prefix, blob_name)
    }

    /// Returns `(scheme, host, path prefix)` for requests to this bucket.
    fn endpoint(&self) -> (String, String, String) {
        match self.endpoint_url {
            Some(ref endpoint) => {
                let scheme = if endpoint.starts_with("http://") {
                    "http"
                } else {
                    "https"
                };
                let host = endpoint
                    .trim_start_matches("https://")
                    .trim_start_matches("http://")
                    .trim_end_matches('/')
                    .to_string();
                (scheme.to_string(), host, format!("/{}", self.bucket))
            }
            None => (
                "https".to_string(),
                format!("{}.s3.{}.amazonaws.com", self.bucket, self.region),
                String::new(),
            ),
        }
    }

    /// Sign a request with AWS SigV4.
    fn sign(
        &self,
        method: &str,
        key: Option<&str>,
        query_params: &[(String, String)],
        payload: &[u8],
        now: DateTime<Utc>,
    ) -> SignedRequest {
        let (scheme, host, path_prefix) = self.endpoint();
        let encoded_key = key.map(encode_path).unwrap_or_default();
        let canonical_uri = format!("{}/{}", path_prefix, encoded_key);

        let date_stamp = now.format("%Y%m%d").to_string();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();

        // Build canonical query string (must be sorted)
        let mut sorted_params = query_params.to_vec();
        sorted_params.sort_by(|a, b| a.0.cmp(&b.0));
        let canonical_querystring: String = sorted_params
            .iter()
            .map(|(k, v)| format!("{}={}", uri_encode(k), uri_encode(v)))
            .collect::<Vec<_>>()
            .join("&");

        let payload_hash = hex_sha256(payload);

        let mut headers = vec![
            ("host".to_string(), host.clone()),
            ("x-amz-content-sha256".to_string(), payload_hash.clone()),
            ("x-amz-date".to_string(), amz_date.clone()),
        ];
        if let Some(ref token) = self.creds.session_token {
            headers.push(("x-amz-security-token".to_string(), token.clone()));
        }
        headers.sort_by(|a, b| a.0.cmp(&b.0));

        let signed_headers: String = headers
            .iter()
            .map(|(k, _)| k.as_str())
            .collect::<Vec<_>>()
            .join(";");

        let canonical_headers: String = headers
            .iter()
            .map(|(k, v)| format!("{}:{}\n", k, v))
            .collect();

        let canonical_request = format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            method,
            canonical_uri,
            canonical_querystring,
            canonical_headers,
            signed_headers,
            payload_hash
        );

        let credential_scope = format!("{}/{}/s3/aws4_request", date_stamp, self.region);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            amz_date,
            credential_scope,
            hex_sha256(canonical_request.as_bytes())
        );

        let signing_key = derive_signing_key(
            &self.creds.secret_access_key,
            &date_stamp,
            &self.region,
            "s3",
        );
        let signature = hex_hmac_sha256(&signing_key, string_to_sign.as_bytes());

        let authorization = format!(
            "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
            self.creds.access_key_id, credential_scope, signed_headers, signature
        );

        let mut url = format!("{}://{}{}", scheme, host, canonical_uri);
        if !canonical_querystring.is_empty() {
            url.push('?');
            url.push_str(&canonical_querystring);
        }

        let mut out_headers: Vec<(String, String)> = headers
            .into_iter()
            .filter(|(k, _)| k != "host")
            .collect();
        out_headers.push(("Authorization".to_string(), authorization));

        SignedRequest {
            url,
            headers: out_headers,
        }
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    async fn put(&self, local_path: &Path, blob_name: &str) -> Result<()> {
        let body = tokio::fs::read(local_path)
            .await
            .with_context(|| format!("failed to read {}", local_path.display()))?;
        let key = self.full_key(blob_name);
        let signed = self.sign("PUT", Some(&key), &[], &body, Utc::now());

        let resp = signed
            .apply(self.client.put(&signed.url).body(body))
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to put s3://{}/{}: {}", self.bucket, key, e))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            bail!(
                "S3 PutObject failed (HTTP {}) for key '{}': {}",
                status,
                key,
                body.chars().take(500).collect::<String>()
            );
        }
        info!(blob = blob_name, bucket = %self.bucket, "uploaded blob");
        Ok(())
    }

    async fn get(&self, blob_name: &str, local_path: &Path) -> Result<()> {
        let key = self.full_key(blob_name);
        let signed = self.sign("GET", Some(&key), &[], b"", Utc::now());

        let resp = signed
            .apply(self.client.get(&signed.url))
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to get s3://{}/{}: {}", self.bucket, key, e))?;
        if !resp.status().is_success() {
            let status = resp.status();
            bail!("S3 GetObject failed (HTTP {}) for key '{}'", status, key);
        }

        let bytes = resp.bytes().await?;
        tokio::fs::write(local_path, &bytes)
            .await
            .with_context(|| format!("failed to write {}", local_path.display()))?;
        debug!(blob = blob_name, bytes = bytes.len(), "downloaded blob");
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let full_prefix = self.full_key(prefix);
        let mut names = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut query_params = vec![
                ("list-type".to_string(), "2".to_string()),
                ("max-keys".to_string(), "1000".to_string()),
            ];
            if !full_prefix.is_empty() {
                query_params.push(("prefix".to_string(), full_prefix.clone()));
            }
            if let Some(ref token) = continuation_token {
                query_params.push(("continuation-token".to_string(), token.clone()));
            }

            let signed = self.sign("GET", None, &query_params, b"", Utc::now());
            let resp = signed.apply(self.client.get(&signed.url)).send().await.map_err(|e| {
                anyhow::anyhow!(
                    "Failed to list S3 objects in s3://{}/{}: {}",
                    self.bucket,
                    full_prefix,
                    e
                )
            })?;

            if !resp.status().is_success() {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                bail!(
                    "S3 ListObjectsV2 failed (HTTP {}): {}",
                    status,
                    body.chars().take(500).collect::<String>()
                );
            }

            let xml_body = resp.text().await?;
            let (keys, is_truncated, next_token) = parse_list_objects_response(&xml_body);
            names.extend(keys.into_iter().map(|k| {
                k.strip_prefix(&self.prefix)
                    .map(str::to_string)
                    .unwrap_or(k)
            }));

            if is_truncated && next_token.is_some() {
                continuation_token = next_token;
            } else {
                break;
            }
        }

        names.sort();
        Ok(names)
    }
}

// ============ AWS SigV4 Helpers ============

fn hex_sha256(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

fn hex_hmac_sha256(key: &[u8], data: &[u8]) -> String {
    hex::encode(hmac_sha256(key, data))
}

/// Derive the AWS SigV4 signing key for a given date, region, and service.
///
/// ```text
/// kDate    = HMAC("AWS4" + secret, dateStamp)
/// kRegion  = HMAC(kDate, region)
/// kService = HMAC(kRegion, service)
/// kSigning = HMAC(kService, "aws4_request")
/// ```
fn derive_signing_key(secret_key: &str, date_stamp: &str, region: &str, service: &str) -> Vec<u8> {
    let k_date = hmac_sha256(
        format!("AWS4{}", secret_key).as_bytes(),
        date_stamp.as_bytes(),
    );
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());
    hmac_sha256(&k_service, b"aws4_request")
}

/// Parse a `ListObjectsV2` response into keys, truncation flag and next token.
fn parse_list_objects_response(xml: &str) -> (Vec<String>, bool, Option<String>) {
    let is_truncated = extract_xml_value(xml, "IsTruncated")
        .map(|v| v == "true")
        .unwrap_or(false);
    let next_token = extract_xml_value(xml, "NextContinuationToken");

    let keys = xml_blocks(xml, "Contents")
        .into_iter()
        .filter_map(|block| extract_xml_value(block, "Key"))
        .filter(|key| !key.is_empty() && !key.ends_with('/'))
        .collect();

    (keys, is_truncated, next_token)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn store(endpoint_url: Option<&str>) -> S3BlobStore {
        S3BlobStore {
            bucket: "uploads".to_string(),
            region: "us-east-1".to_string(),
            prefix: "docrag/".to_string(),
            endpoint_url: endpoint_url.map(str::to_string),
            creds: AwsCredentials {
                access_key_id: "AKIDEXAMPLE".to_string(),
                secret_access_key: "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY".to_string(),
                session_token: None,
            },
            client: reqwest::Client::new(),
        }
    }

    #[test]
    fn parses_list_objects_page() {
        let xml = "<ListBucketResult><IsTruncated>true</IsTruncated>\
            <Contents><Key>a/one.txt</Key></Contents>\
            <Contents><Key>a/</Key></Contents>\
            <Contents><Key>a/R&amp;D.pdf</Key></Contents>\
            <NextContinuationToken>tok</NextContinuationToken></ListBucketResult>";
        let (keys, truncated, token) = parse_list_objects_response(xml);
        assert_eq!(keys, vec!["a/one.txt", "a/R&D.pdf"]);
        assert!(truncated);
        assert_eq!(token.as_deref(), Some("tok"));
    }

    #[test]
    fn signing_key_matches_aws_example() {
        // Example from the AWS SigV4 documentation.
        let key = derive_signing_key(
            "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY",
            "20120215",
            "us-east-1",
            "iam",
        );
        assert_eq!(
            hex::encode(key),
            "f4780e2d9f65fa895f9c67b32ce1baf0b0d8a43505a000a1a9e090d414db404d"
        );
    }

    #[test]
    fn signed_urls_follow_addressing_style() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();

        let signed = store(None).sign("GET", Some("docrag/a b.txt"), &[], b"", now);
        assert_eq!(
            signed.url,
            "https://uploads.s3.us-east-1.amazonaws.com/docrag/a%20b.txt"
        );

        let signed = store(Some("http://localhost:9000/")).sign(
            "GET",
            None,
            &[("list-type".to_string(), "2".to_string())],
            b"",
            now,
        );
        assert_eq!(signed.url, "http://localhost:9000/uploads/?list-type=2");
        let auth = signed
            .headers
            .iter()
            .find(|(k, _)| k == "Authorization")
            .map(|(_, v)| v.as_str())
            .unwrap();
        assert!(auth.starts_with("AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/20240501/us-east-1/s3/aws4_request"));
        assert!(auth.contains("SignedHeaders=host;x-amz-content-sha256;x-amz-date"));
    }
}
