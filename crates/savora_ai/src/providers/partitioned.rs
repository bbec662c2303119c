//! Client for the partitioned-computation gateway.
//!
//! The gateway fronts a multi-party computation cluster: the payload is
//! secret-shared across compute nodes and no single node ever sees the
//! plaintext, which is why this backend is the privacy-capable one. From the
//! router's side it is just another HTTP backend with a submit endpoint and a
//! readiness endpoint.

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
struct JobRequest<'a> {
    model: &'a str,
    payload: &'a serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct JobResponse {
    output: serde_json::Value,
    /// Number of compute parties that contributed shares.
    #[serde(default)]
    parties: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    ready: bool,
    #[serde(default)]
    models: Vec<String>,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// HTTP client for the partitioned-computation gateway.
pub struct PartitionedClient {
    base_url: String,
    client: reqwest::Client,
}

impl PartitionedClient {
    pub fn new(base_url: String) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl ProviderClient for PartitionedClient {
    fn provider(&self) -> Provider {
        Provider::Partitioned
    }

    fn name(&self) -> &str {
        "Partitioned computation"
    }

    async fn invoke(
        &self,
        model: &str,
        payload: &serde_json::Value,
        timeout: Duration,
    ) -> Result<InferenceResponse, ProviderError> {
        let url = format!("{}/api/v1/jobs", self.base_url);
        let body = JobRequest { model, payload };

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
        if status == reqwest::StatusCode::SERVICE_UNAVAILABLE {
            // Gateway up but not enough compute parties online.
            let text = resp.text().await.unwrap_or_default();
            return Err(ProviderError::ModelUnavailable(text));
        }
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(ProviderError::RateLimit);
        }
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(ProviderError::Other(format!(
                "Partitioned gateway error {status}: {text}"
            )));
        }

        let data: JobResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::MalformedResponse(e.to_string()))?;

        if let Some(parties) = data.parties {
            debug!(parties, model, "Partitioned job completed");
        }

        Ok(InferenceResponse {
            output: data.output,
            model: Some(model.to_string()),
        })
    }

    /// The gateway is live for a model when it reports `ready` and either
    /// lists the model or lists nothing at all.
    async fn health_check(&self, model: &str, timeout: Duration) -> bool {
        let url = format!("{}/api/v1/status", self.base_url);
        let resp = match self.client.get(&url).timeout(timeout).send().await {
            Ok(r) if r.status().is_success() => r,
            _ => return false,
        };

        match resp.json::<StatusResponse>().await {
            Ok(status) => {
                status.ready && (status.models.is_empty() || status.models.iter().any(|m| m == model))
            }
            Err(_) => false,
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
        let client = PartitionedClient::new("http://localhost:9400/".into());
        assert_eq!(client.provider(), Provider::Partitioned);
        assert_eq!(client.base_url, "http://localhost:9400");
        assert!(client.provider().privacy_capable());
    }

    #[test]
    fn job_request_serializes() {
        let payload = serde_json::json!({ "diner_id": "u-93" });
        let body = JobRequest {
            model: "secure-rec",
            payload: &payload,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["model"], "secure-rec");
        assert_eq!(json["payload"]["diner_id"], "u-93");
    }

    #[test]
    fn status_response_parses_without_models() {
        let status: StatusResponse = serde_json::from_str(r#"{"ready": true}"#).unwrap();
        assert!(status.ready);
        assert!(status.models.is_empty());
    }

    #[tokio::test]
    async fn health_check_against_dead_port_is_false() {
        let client = PartitionedClient::new("http://127.0.0.1:19998".into());
        assert!(
            !client
                .health_check("secure-rec", Duration::from_millis(500))
                .await
        );
    }
}
