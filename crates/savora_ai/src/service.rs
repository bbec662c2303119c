//! Routing service.
//!
//! The single entry point tying the pieces together: resolve the task,
//! refresh availability for its candidates, rank them, then execute either a
//! single dispatch with fallback or an ensemble. Holds the long-lived shared
//! state (providers, prober, ledger) behind `Arc` so one service instance can
//! serve many concurrent callers.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use savora_core::config::SavoraConfig;
use savora_core::kv::KvStore;

use crate::ensemble::MergeKeys;
use crate::error::RouteError;
use crate::executor::RequestExecutor;
use crate::ledger::PerformanceLedger;
use crate::probe::AvailabilityProber;
use crate::providers::ProviderRegistry;
use crate::registry::TaskRegistry;
use crate::scoring::ModelScorer;
use crate::types::{ModelRef, PrivacyLevel, RouteOptions, RoutingResult};

// ---------------------------------------------------------------------------
// RoutingService
// ---------------------------------------------------------------------------

/// Model routing and ensemble engine.
pub struct RoutingService {
    registry: TaskRegistry,
    providers: Arc<ProviderRegistry>,
    prober: Arc<AvailabilityProber>,
    scorer: ModelScorer,
    executor: RequestExecutor,
    ledger: Arc<PerformanceLedger>,
    default_timeout: Duration,
    default_ensemble_size: usize,
}

impl RoutingService {
    /// Service over the built-in task catalog and the configured provider
    /// endpoints, without persistence.
    pub fn new(config: &SavoraConfig) -> Self {
        Self::with_parts(
            config,
            TaskRegistry::with_defaults(),
            Arc::new(ProviderRegistry::from_endpoints(&config.endpoints)),
            None,
        )
    }

    /// Service with an explicit registry, provider set, and optional KV
    /// store. This is the constructor embedders (and tests) use to inject
    /// their own catalog or backends.
    pub fn with_parts(
        config: &SavoraConfig,
        registry: TaskRegistry,
        providers: Arc<ProviderRegistry>,
        store: Option<Arc<dyn KvStore>>,
    ) -> Self {
        let ledger = Arc::new(match store.clone() {
            Some(store) => PerformanceLedger::with_store(&config.ledger, store),
            None => PerformanceLedger::new(&config.ledger),
        });
        let prober = Arc::new(match store {
            Some(store) => {
                AvailabilityProber::with_store(Arc::clone(&providers), &config.prober, store)
            }
            None => AvailabilityProber::new(Arc::clone(&providers), &config.prober),
        });
        // Availability has no lazy read-through path, so load persisted
        // records up front. The ledger rehydrates lazily on first access.
        prober.rehydrate();
        let executor = RequestExecutor::new(
            Arc::clone(&providers),
            Arc::clone(&ledger),
            &config.executor,
        );

        info!(
            tasks = registry.len(),
            providers = providers.providers().len(),
            "Routing service initialized"
        );

        Self {
            registry,
            providers,
            prober,
            scorer: ModelScorer::new(config.scoring.clone()),
            executor,
            ledger,
            default_timeout: Duration::from_millis(config.executor.request_timeout_ms),
            default_ensemble_size: config.executor.ensemble_size,
        }
    }

    // ------------------------------------------------------------------
    // Routing
    // ------------------------------------------------------------------

    /// Route one inference request to the best model(s) for its task.
    pub async fn route_request(
        &self,
        task_id: &str,
        payload: &serde_json::Value,
        options: &RouteOptions,
    ) -> Result<RoutingResult, RouteError> {
        let profile = self.registry.resolve_task(task_id)?;
        debug!(
            task = task_id,
            complexity = %profile.complexity,
            ensemble = options.use_ensemble,
            "Routing request"
        );

        let candidates: Vec<ModelRef> = profile.candidates().cloned().collect();
        let availability = self.prober.ensure_fresh(&candidates).await;

        let requires_privacy = profile.requires_privacy
            || options.privacy_level == Some(PrivacyLevel::Isolated);
        let ranked =
            self.scorer
                .select_candidates(profile, requires_privacy, &availability, &self.ledger);
        if ranked.is_empty() {
            return Err(RouteError::NoModelAvailable {
                task: task_id.to_string(),
            });
        }

        let timeout = options.timeout.unwrap_or(self.default_timeout);
        if options.use_ensemble {
            let size = options.ensemble_size.unwrap_or(self.default_ensemble_size);
            let mut keys = MergeKeys::default();
            if let Some(ref identity) = options.identity_key {
                keys.identity = identity.clone();
            }
            if let Some(ref rank) = options.rank_key {
                keys.rank = rank.clone();
            }
            self.executor
                .execute_ensemble(profile, &ranked, payload, timeout, size, &keys)
                .await
        } else {
            self.executor.execute(profile, &ranked, payload, timeout).await
        }
    }

    // ------------------------------------------------------------------
    // Lifecycle and introspection
    // ------------------------------------------------------------------

    /// Start background availability polling over every model any task can
    /// route to.
    pub fn start_health_polling(&self) {
        let models: Vec<ModelRef> = self.registry.all_known_model_ids().into_iter().collect();
        self.prober.start_polling(models);
    }

    pub fn stop_health_polling(&self) {
        self.prober.stop_polling();
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    pub fn providers(&self) -> &ProviderRegistry {
        &self.providers
    }

    pub fn prober(&self) -> &AvailabilityProber {
        &self.prober
    }

    pub fn ledger(&self) -> &PerformanceLedger {
        &self.ledger
    }

    /// Recent per-model dispatch outcomes, for diagnostics.
    pub fn dispatch_history(&self) -> Vec<crate::executor::DispatchEvent> {
        self.executor.dispatch_history()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
