//! Availability prober.
//!
//! Checks liveness of each configured model backend and caches the results
//! with a short TTL. Probes for independent models run concurrently; each
//! probe carries its own timeout so one unreachable backend never stalls the
//! cycle. Probe failures mean `available = false`, never an error --
//! availability is advisory, not fatal.
//!
//! Background polling has an explicit start/stop lifecycle so tests can drive
//! probes deterministically instead of waiting on timers.
//!
//! Probe results are written through to a [`KvStore`] so a restarted process
//! can reuse still-fresh records instead of re-probing every backend cold.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use savora_core::config::ProberConfig;
use savora_core::kv::KvStore;

use crate::providers::ProviderRegistry;
use crate::types::ModelRef;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Cached liveness of one model backend.
#[derive(Debug, Clone)]
pub struct AvailabilityRecord {
    pub model: ModelRef,
    pub available: bool,
    pub last_checked: Instant,
    /// Health-check round-trip time.
    pub latency_ms: u64,
}

/// Wire form of an [`AvailabilityRecord`]: the check time is a wall-clock
/// timestamp so it survives a process restart.
#[derive(Debug, Serialize, Deserialize)]
struct PersistedAvailability {
    model: ModelRef,
    available: bool,
    checked_at: DateTime<Utc>,
    latency_ms: u64,
}

/// A recorded probe outcome for diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeEvent {
    /// Milliseconds since the prober was created (avoids `Instant`
    /// serialization issues).
    pub age_ms: u64,
    pub model: ModelRef,
    pub available: bool,
    pub latency_ms: u64,
}

// ---------------------------------------------------------------------------
// AvailabilityProber
// ---------------------------------------------------------------------------

/// Probes model backends and caches liveness records.
pub struct AvailabilityProber {
    providers: Arc<ProviderRegistry>,
    records: RwLock<HashMap<ModelRef, AvailabilityRecord>>,
    ttl: Duration,
    probe_timeout: Duration,
    poll_interval: Duration,
    poll_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    history: RwLock<Vec<ProbeEvent>>,
    created_at: Instant,
    store: Option<Arc<dyn KvStore>>,
}

/// KV key prefix for persisted availability records.
const KV_PREFIX: &str = "avail";

impl AvailabilityProber {
    pub fn new(providers: Arc<ProviderRegistry>, config: &ProberConfig) -> Self {
        Self {
            providers,
            records: RwLock::new(HashMap::new()),
            ttl: Duration::from_secs(config.ttl_secs),
            probe_timeout: Duration::from_millis(config.probe_timeout_ms),
            poll_interval: Duration::from_secs(config.poll_interval_secs),
            poll_task: Mutex::new(None),
            history: RwLock::new(Vec::new()),
            created_at: Instant::now(),
            store: None,
        }
    }

    /// Attach a KV store for write-through persistence and startup
    /// rehydration of availability records.
    pub fn with_store(
        providers: Arc<ProviderRegistry>,
        config: &ProberConfig,
        store: Arc<dyn KvStore>,
    ) -> Self {
        let mut prober = Self::new(providers, config);
        prober.store = Some(store);
        prober
    }

    /// Recent probe outcomes, oldest first.
    pub fn probe_history(&self) -> Vec<ProbeEvent> {
        self.history.read().clone()
    }

    // ------------------------------------------------------------------
    // Probing
    // ------------------------------------------------------------------

    /// Return a record per requested model, probing any that is missing or
    /// older than the TTL. Records fresher than the TTL are served from
    /// cache without network traffic.
    pub async fn ensure_fresh(&self, models: &[ModelRef]) -> HashMap<ModelRef, AvailabilityRecord> {
        let stale: Vec<ModelRef> = {
            let records = self.records.read();
            models
                .iter()
                .filter(|m| {
                    records
                        .get(*m)
                        .is_none_or(|r| r.last_checked.elapsed() >= self.ttl)
                })
                .cloned()
                .collect()
        };

        if !stale.is_empty() {
            self.probe(&stale).await;
        }

        let records = self.records.read();
        models
            .iter()
            .filter_map(|m| records.get(m).map(|r| (m.clone(), r.clone())))
            .collect()
    }

    /// Probe every given model now, ignoring the TTL. Results are written to
    /// the cache.
    pub async fn probe(&self, models: &[ModelRef]) {
        let futures = models.iter().map(|model| {
            let client = self.providers.get(model.provider);
            let model = model.clone();
            let probe_timeout = self.probe_timeout;
            async move {
                let started = Instant::now();
                let available = match client {
                    Some(client) => {
                        // The outer timeout guards against clients that do not
                        // honor the per-call timeout themselves.
                        tokio::time::timeout(
                            probe_timeout,
                            client.health_check(&model.name, probe_timeout),
                        )
                        .await
                        .unwrap_or(false)
                    }
                    None => {
                        warn!(model = %model, "No client registered for provider");
                        false
                    }
                };
                let latency_ms = started.elapsed().as_millis() as u64;
                AvailabilityRecord {
                    model,
                    available,
                    last_checked: Instant::now(),
                    latency_ms,
                }
            }
        });

        let results = futures::future::join_all(futures).await;

        let online = results.iter().filter(|r| r.available).count();
        debug!(
            probed = results.len(),
            online, "Availability probe cycle complete"
        );

        for record in &results {
            self.persist(record);
        }

        {
            let mut history = self.history.write();
            for record in &results {
                history.push(ProbeEvent {
                    age_ms: self.created_at.elapsed().as_millis() as u64,
                    model: record.model.clone(),
                    available: record.available,
                    latency_ms: record.latency_ms,
                });
            }
            // Cap at 1000, keep the last 500.
            if history.len() > 1000 {
                let drain_end = history.len() - 500;
                history.drain(..drain_end);
            }
        }

        let mut records = self.records.write();
        for record in results {
            records.insert(record.model.clone(), record);
        }
    }

    fn persist(&self, record: &AvailabilityRecord) {
        let Some(ref store) = self.store else {
            return;
        };
        let saved = PersistedAvailability {
            model: record.model.clone(),
            available: record.available,
            checked_at: Utc::now(),
            latency_ms: record.latency_ms,
        };
        let key = format!("{}:{}", KV_PREFIX, saved.model);
        match serde_json::to_string(&saved) {
            Ok(json) => {
                if let Err(e) = store.set(&key, &json, Some(self.ttl)) {
                    warn!(key, "Failed to persist availability record: {e:#}");
                }
            }
            Err(e) => warn!(key, "Failed to serialize availability record: {e}"),
        }
    }

    /// Load persisted records that are still within the TTL. Called once at
    /// startup; anything stale or unreadable is skipped and re-probed on
    /// first use.
    pub fn rehydrate(&self) {
        let Some(ref store) = self.store else {
            return;
        };
        let keys = match store.keys_with_prefix(&format!("{KV_PREFIX}:")) {
            Ok(keys) => keys,
            Err(e) => {
                warn!("Failed to enumerate persisted availability records: {e:#}");
                return;
            }
        };

        let mut loaded = 0usize;
        let mut records = self.records.write();
        for key in keys {
            let Ok(Some(json)) = store.get(&key) else {
                continue;
            };
            let Ok(saved) = serde_json::from_str::<PersistedAvailability>(&json) else {
                warn!(key, "Skipping unreadable persisted availability record");
                continue;
            };
            let Ok(age) = Utc::now().signed_duration_since(saved.checked_at).to_std() else {
                continue;
            };
            if age >= self.ttl {
                continue;
            }
            // Shift the wall-clock age onto the monotonic clock so the TTL
            // check keeps working unchanged.
            let Some(last_checked) = Instant::now().checked_sub(age) else {
                continue;
            };
            records.entry(saved.model.clone()).or_insert(AvailabilityRecord {
                model: saved.model,
                available: saved.available,
                last_checked,
                latency_ms: saved.latency_ms,
            });
            loaded += 1;
        }
        debug!(loaded, "Rehydrated availability records");
    }

    /// Snapshot of all cached records.
    pub fn snapshot(&self) -> Vec<AvailabilityRecord> {
        self.records.read().values().cloned().collect()
    }

    /// Overwrite the cached record for a model. Test seam and manual
    /// override (e.g. operator forcing a backend out of rotation).
    pub fn set_available(&self, model: ModelRef, available: bool) {
        self.records.write().insert(
            model.clone(),
            AvailabilityRecord {
                model,
                available,
                last_checked: Instant::now(),
                latency_ms: 0,
            },
        );
    }

    // ------------------------------------------------------------------
    // Background polling lifecycle
    // ------------------------------------------------------------------

    /// Start a background task re-probing the given models on the configured
    /// interval. A previous polling task, if any, is stopped first.
    pub fn start_polling(self: &Arc<Self>, models: Vec<ModelRef>) {
        self.stop_polling();

        let prober = Arc::clone(self);
        let interval = self.poll_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // First tick fires immediately; skip it so callers control the
            // initial probe explicitly.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                prober.probe(&models).await;
            }
        });

        info!(
            interval_secs = interval.as_secs(),
            "Availability polling started"
        );
        *self.poll_task.lock() = Some(handle);
    }

    /// Stop the background polling task, if running.
    pub fn stop_polling(&self) {
        if let Some(handle) = self.poll_task.lock().take() {
            handle.abort();
            info!("Availability polling stopped");
        }
    }
}

impl Drop for AvailabilityProber {
    fn drop(&mut self) {
        if let Some(handle) = self.poll_task.lock().take() {
            handle.abort();
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
