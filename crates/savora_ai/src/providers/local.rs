//! Client for OpenAI-compatible local inference servers.
//!
//! Covers the `local-a` and `local-b` backends (vLLM, LocalAI, llama.cpp and
//! similar servers). No API key is sent; local servers typically don't
//! require one.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::types::{InferenceResponse, Provider};

use super::{ProviderClient, ProviderError};

// ---------------------------------------------------------------------------
// Wire types (serialization only)
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct InferRequest<'a> {
    model: &'a str,
    input: &'a serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct InferResponse {
    output: serde_json::Value,
    #[serde(default)]
    model: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ModelsResponse {
    data: Option<Vec<ModelEntry>>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    id: String,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// HTTP client for a local inference server.
pub struct LocalHttpClient {
    provider: Provider,
    base_url: String,
    client: reqwest::Client,
    display_name: String,
}

impl LocalHttpClient {
    pub fn new(provider: Provider, base_url: String) -> Self {
        Self {
            display_name: format!("Local inference ({provider})"),
            provider,
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    /// Map an HTTP error status to a provider error.
    fn error_for_status(status: reqwest::StatusCode, body: String) -> ProviderError {
        if status == reqwest::StatusCode::REQUEST_TIMEOUT
            || status == reqwest::StatusCode::GATEWAY_TIMEOUT
        {
            ProviderError::Timeout
        } else if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            ProviderError::RateLimit
        } else if status == reqwest::StatusCode::NOT_FOUND {
            ProviderError::ModelUnavailable(body)
        } else {
            ProviderError::Other(format!("Local API error {status}: {body}"))
        }
    }
}

#[async_trait]
impl ProviderClient for LocalHttpClient {
    fn provider(&self) -> Provider {
        self.provider
    }

    fn name(&self) -> &str {
        &self.display_name
    }

    async fn invoke(
        &self,
        model: &str,
        payload: &serde_json::Value,
        timeout: Duration,
    ) -> Result<InferenceResponse, ProviderError> {
        let url = format!("{}/v1/infer", self.base_url);
        let body = InferRequest {
            model,
            input: payload,
        };

        let resp = self
            .client
            .post(&url)
            .timeout(timeout)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::Timeout
                } else {
                    ProviderError::Network(e.to_string())
                }
            })?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(Self::error_for_status(status, text));
        }

        let data: InferResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::MalformedResponse(e.to_string()))?;

        Ok(InferenceResponse {
            output: data.output,
            model: data.model,
        })
    }

    /// Hit `/v1/models` and, when the server returns a listing, require the
    /// model to be present in it. A 2xx with an unparsable body still counts
    /// as alive -- not every server implements the listing.
    async fn health_check(&self, model: &str, timeout: Duration) -> bool {
        let url = format!("{}/v1/models", self.base_url);
        let resp = match self.client.get(&url).timeout(timeout).send().await {
            Ok(r) if r.status().is_success() => r,
            Ok(r) => {
                debug!(provider = %self.provider, status = %r.status(), "Health check failed");
                return false;
            }
            Err(_) => return false,
        };

        match resp.json::<ModelsResponse>().await {
            Ok(data) => match data.data {
                Some(entries) if !entries.is_empty() => {
                    entries.iter().any(|m| m.id == model)
                }
                _ => true,
            },
            Err(_) => true,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_metadata() {
        let client = LocalHttpClient::new(Provider::LocalA, "http://localhost:8000".into());
        assert_eq!(client.provider(), Provider::LocalA);
        assert!(client.name().contains("local-a"));
    }

    #[test]
    fn trailing_slash_trimmed() {
        let client = LocalHttpClient::new(Provider::LocalB, "http://localhost:8080/".into());
        assert_eq!(client.base_url, "http://localhost:8080");
    }

    #[test]
    fn status_mapping() {
        assert!(matches!(
            LocalHttpClient::error_for_status(reqwest::StatusCode::GATEWAY_TIMEOUT, String::new()),
            ProviderError::Timeout
        ));
        assert!(matches!(
            LocalHttpClient::error_for_status(
                reqwest::StatusCode::TOO_MANY_REQUESTS,
                String::new()
            ),
            ProviderError::RateLimit
        ));
        assert!(matches!(
            LocalHttpClient::error_for_status(
                reqwest::StatusCode::NOT_FOUND,
                "no such model".into()
            ),
            ProviderError::ModelUnavailable(_)
        ));
        assert!(matches!(
            LocalHttpClient::error_for_status(
                reqwest::StatusCode::INTERNAL_SERVER_ERROR,
                String::new()
            ),
            ProviderError::Other(_)
        ));
    }

    #[test]
    fn request_body_serializes() {
        let payload = serde_json::json!({ "cuisine": "thai", "budget": 2 });
        let body = InferRequest {
            model: "savora-rec-7b",
            input: &payload,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["model"], "savora-rec-7b");
        assert_eq!(json["input"]["cuisine"], "thai");
    }

    #[tokio::test]
    async fn invoke_against_dead_port_is_network_error() {
        let client = LocalHttpClient::new(Provider::LocalA, "http://127.0.0.1:19999".into());
        let result = client
            .invoke(
                "m",
                &serde_json::json!({}),
                Duration::from_millis(500),
            )
            .await;
        assert!(matches!(
            result,
            Err(ProviderError::Network(_)) | Err(ProviderError::Timeout)
        ));
    }

    #[tokio::test]
    async fn health_check_against_dead_port_is_false() {
        let client = LocalHttpClient::new(Provider::LocalA, "http://127.0.0.1:19999".into());
        assert!(!client.health_check("m", Duration::from_millis(500)).await);
    }
}
