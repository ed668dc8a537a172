//! Retrying HTTP transport shared by the embedding, chat and search clients.
//!
//! # Retry Strategy
//!
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)

use anyhow::{bail, Result};
use std::time::Duration;
use tracing::warn;

/// Which flavor of the OpenAI-compatible REST API an endpoint speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiFlavor {
    /// `api.openai.com` style: bearer token, model in the body.
    OpenAi,
    /// Azure OpenAI: `api-key` header, deployment in the path.
    Azure,
}

impl ApiFlavor {
    pub fn from_provider(provider: &str) -> Option<Self> {
        match provider {
            "openai" => Some(ApiFlavor::OpenAi),
            "azure" => Some(ApiFlavor::Azure),
            _ => None,
        }
    }

    /// Environment variable that holds the API key.
    pub fn key_var(self) -> &'static str {
        match self {
            ApiFlavor::OpenAi => "OPENAI_API_KEY",
            ApiFlavor::Azure => "AZURE_OPENAI_API_KEY",
        }
    }
}

/// Location and credentials of an OpenAI-compatible deployment.
#[derive(Clone)]
pub struct ApiEndpoint {
    pub flavor: ApiFlavor,
    base_url: String,
    api_key: String,
    api_version: String,
}

impl ApiEndpoint {
    /// Resolve the endpoint, reading the key from the flavor's env var.
    pub fn new(flavor: ApiFlavor, url: Option<&str>, api_version: &str) -> Result<Self> {
        let api_key = std::env::var(flavor.key_var())
            .map_err(|_| anyhow::anyhow!("{} environment variable not set", flavor.key_var()))?;
        Ok(Self::with_key(flavor, url, api_version, api_key))
    }

    pub fn with_key(flavor: ApiFlavor, url: Option<&str>, api_version: &str, api_key: String) -> Self {
        let base_url = url
            .unwrap_or("https://api.openai.com")
            .trim_end_matches('/')
            .to_string();
        Self {
            flavor,
            base_url,
            api_key,
            api_version: api_version.to_string(),
        }
    }

    /// URL for an operation such as `"embeddings"` or `"chat/completions"`.
    pub fn operation_url(&self, model: &str, operation: &str) -> String {
        match self.flavor {
            ApiFlavor::OpenAi => format!("{}/v1/{}", self.base_url, operation),
            ApiFlavor::Azure => format!(
                "{}/openai/deployments/{}/{}?api-version={}",
                self.base_url, model, operation, self.api_version
            ),
        }
    }

    /// Attach the flavor's authentication header.
    pub fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.flavor {
            ApiFlavor::OpenAi => req.header("Authorization", format!("Bearer {}", self.api_key)),
            ApiFlavor::Azure => req.header("api-key", &self.api_key),
        }
    }
}

/// Build a client with a per-request timeout.
pub fn client(timeout: Duration) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder().timeout(timeout).build()?)
}

/// Send the request produced by `build` until it succeeds, retrying
/// transient failures up to `max_retries` times.
///
/// Returns the first successful response.
pub async fn send_with_retry<F>(label: &str, max_retries: u32, build: F) -> Result<reqwest::Response>
where
    F: Fn() -> reqwest::RequestBuilder,
{
    let mut last_err = None;

    for attempt in 0..=max_retries {
        if attempt > 0 {
            let delay = Duration::from_secs(1 << (attempt - 1).min(5));
            tokio::time::sleep(delay).await;
        }

        match build().send().await {
            Ok(response) => {
                let status = response.status();

                if status.is_success() {
                    return Ok(response);
                }

                if status.as_u16() == 429 || status.is_server_error() {
                    let body_text = response.text().await.unwrap_or_default();
                    warn!(%status, attempt, "{} request failed, will retry", label);
                    last_err = Some(anyhow::anyhow!("{} API error {}: {}", label, status, body_text));
                    continue;
                }

                let body_text = response.text().await.unwrap_or_default();
                bail!("{} API error {}: {}", label, status, body_text);
            }
            Err(e) => {
                warn!(error = %e, attempt, "{} request failed, will retry", label);
                last_err = Some(e.into());
                continue;
            }
        }
    }

    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("{} request failed after retries", label)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn openai_urls() {
        let ep = ApiEndpoint::with_key(ApiFlavor::OpenAi, None, "unused", "k".into());
        assert_eq!(
            ep.operation_url("text-embedding-3-small", "embeddings"),
            "https://api.openai.com/v1/embeddings"
        );
    }

    #[test]
    fn azure_urls_name_the_deployment() {
        let ep = ApiEndpoint::with_key(
            ApiFlavor::Azure,
            Some("https://acme.openai.azure.com/"),
            "2024-06-01",
            "k".into(),
        );
        assert_eq!(
            ep.operation_url("gpt-4o", "chat/completions"),
            "https://acme.openai.azure.com/openai/deployments/gpt-4o/chat/completions?api-version=2024-06-01"
        );
    }

    #[test]
    fn provider_names_map_to_flavors() {
        assert_eq!(ApiFlavor::from_provider("azure"), Some(ApiFlavor::Azure));
        assert_eq!(ApiFlavor::from_provider("openai"), Some(ApiFlavor::OpenAi));
        assert_eq!(ApiFlavor::from_provider("disabled"), None);
    }
}
