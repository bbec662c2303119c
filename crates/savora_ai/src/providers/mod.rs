//! Provider client trait and implementations.
//!
//! Each backend module exposes a struct that implements [`ProviderClient`].
//! The engine never talks to a backend directly; everything flows through a
//! [`ProviderRegistry`] keyed by the typed [`Provider`] tag, which is also the
//! seam tests use to inject scripted clients.

pub mod local;
pub mod partitioned;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use savora_core::config::ProviderEndpoints;

use crate::types::{InferenceResponse, Provider};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that any provider client may return.
///
/// From the router's viewpoint every variant is transient: the executor
/// records it against the model and advances to the next candidate.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Timeout")]
    Timeout,

    #[error("Rate limited")]
    RateLimit,

    #[error("Model not available: {0}")]
    ModelUnavailable(String),

    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("Provider error: {0}")]
    Other(String),
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Unified interface to one inference backend.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// Which backend this client talks to.
    fn provider(&self) -> Provider;

    /// Human-readable display name.
    fn name(&self) -> &str;

    /// Run one inference call against the named model.
    async fn invoke(
        &self,
        model: &str,
        payload: &serde_json::Value,
        timeout: Duration,
    ) -> Result<InferenceResponse, ProviderError>;

    /// Lightweight liveness check for the named model.
    async fn health_check(&self, model: &str, timeout: Duration) -> bool;
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Maps each [`Provider`] tag to its client instance.
#[derive(Default)]
pub struct ProviderRegistry {
    clients: HashMap<Provider, Arc<dyn ProviderClient>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build clients for every configured endpoint.
    pub fn from_endpoints(endpoints: &ProviderEndpoints) -> Self {
        let mut registry = Self::new();

        if !endpoints.local_a_url.is_empty() {
            registry.register(Arc::new(local::LocalHttpClient::new(
                Provider::LocalA,
                endpoints.local_a_url.clone(),
            )));
        }
        if !endpoints.local_b_url.is_empty() {
            registry.register(Arc::new(local::LocalHttpClient::new(
                Provider::LocalB,
                endpoints.local_b_url.clone(),
            )));
        }
        if !endpoints.partitioned_url.is_empty() {
            registry.register(Arc::new(partitioned::PartitionedClient::new(
                endpoints.partitioned_url.clone(),
            )));
        }

        info!("{} provider client(s) registered", registry.clients.len());
        registry
    }

    /// Register (or replace) the client for a provider.
    pub fn register(&mut self, client: Arc<dyn ProviderClient>) {
        self.clients.insert(client.provider(), client);
    }

    pub fn get(&self, provider: Provider) -> Option<Arc<dyn ProviderClient>> {
        self.clients.get(&provider).cloned()
    }

    pub fn providers(&self) -> Vec<Provider> {
        self.clients.keys().copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
