//! Performance ledger.
//!
//! Rolling (success rate, latency) history per (model, task) pair, used by
//! the scorer to rank candidates. Counters are monotonically non-decreasing
//! within a process lifetime; every update happens under a single write lock
//! per ledger so concurrent requests never lose increments.
//!
//! Records are written through to a [`KvStore`] so a restarted process can
//! rehydrate recent history, and evicted after a retention window.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use savora_core::config::LedgerConfig;
use savora_core::kv::KvStore;

use crate::types::ModelRef;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Rolling performance history for one (model, task) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceRecord {
    pub model: ModelRef,
    pub task_id: String,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub total_response_time_ms: u64,
    pub last_updated: DateTime<Utc>,
}

impl PerformanceRecord {
    fn new(model: ModelRef, task_id: String) -> Self {
        Self {
            model,
            task_id,
            total_requests: 0,
            successful_requests: 0,
            total_response_time_ms: 0,
            last_updated: Utc::now(),
        }
    }

    /// Fraction of requests that succeeded, or `None` with no history --
    /// zero history means unknown confidence, not failure.
    pub fn success_rate(&self) -> Option<f64> {
        if self.total_requests == 0 {
            None
        } else {
            Some(self.successful_requests as f64 / self.total_requests as f64)
        }
    }

    /// Mean response time, or `None` with no history.
    pub fn avg_response_time_ms(&self) -> Option<f64> {
        if self.total_requests == 0 {
            None
        } else {
            Some(self.total_response_time_ms as f64 / self.total_requests as f64)
        }
    }
}

#[derive(Clone, PartialEq, Eq, Hash)]
struct LedgerKey {
    model: ModelRef,
    task_id: String,
}

// ---------------------------------------------------------------------------
// PerformanceLedger
// ---------------------------------------------------------------------------

/// Shared performance history with optional KV persistence.
pub struct PerformanceLedger {
    records: RwLock<HashMap<LedgerKey, PerformanceRecord>>,
    /// Requests currently dispatched per model, for load balancing.
    in_flight: RwLock<HashMap<ModelRef, u32>>,
    store: Option<Arc<dyn KvStore>>,
    retention: Duration,
    namespace: String,
}

impl PerformanceLedger {
    pub fn new(config: &LedgerConfig) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            in_flight: RwLock::new(HashMap::new()),
            store: None,
            retention: Duration::from_secs(config.retention_secs),
            namespace: config.kv_namespace.clone(),
        }
    }

    /// Attach a KV store for write-through persistence and startup
    /// rehydration.
    pub fn with_store(config: &LedgerConfig, store: Arc<dyn KvStore>) -> Self {
        let mut ledger = Self::new(config);
        ledger.store = Some(store);
        ledger
    }

    fn kv_key(&self, model: &ModelRef, task_id: &str) -> String {
        format!("{}:{}:{}", self.namespace, task_id, model)
    }

    // ------------------------------------------------------------------
    // Recording
    // ------------------------------------------------------------------

    /// Record the outcome of one completed request. Failures count toward
    /// `total_requests` but not `successful_requests`.
    pub fn record_outcome(&self, model: &ModelRef, task_id: &str, success: bool, latency_ms: u64) {
        let key = LedgerKey {
            model: model.clone(),
            task_id: task_id.to_string(),
        };

        let snapshot = {
            let mut records = self.records.write();
            let record = records
                .entry(key)
                .or_insert_with(|| PerformanceRecord::new(model.clone(), task_id.to_string()));
            record.total_requests += 1;
            if success {
                record.successful_requests += 1;
            }
            record.total_response_time_ms += latency_ms;
            record.last_updated = Utc::now();
            record.clone()
        };

        debug!(
            model = %model,
            task = task_id,
            success,
            latency_ms,
            total = snapshot.total_requests,
            "Recorded request outcome"
        );

        self.persist(&snapshot);
    }

    fn persist(&self, record: &PerformanceRecord) {
        let Some(ref store) = self.store else {
            return;
        };
        let key = self.kv_key(&record.model, &record.task_id);
        match serde_json::to_string(record) {
            Ok(json) => {
                if let Err(e) = store.set(&key, &json, Some(self.retention)) {
                    warn!(key, "Failed to persist performance record: {e:#}");
                }
            }
            Err(e) => warn!(key, "Failed to serialize performance record: {e}"),
        }
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Current record for a (model, task) pair. Falls through to the KV
    /// store on a memory miss (first access after a restart).
    pub fn record_for(&self, model: &ModelRef, task_id: &str) -> Option<PerformanceRecord> {
        let key = LedgerKey {
            model: model.clone(),
            task_id: task_id.to_string(),
        };
        if let Some(record) = self.records.read().get(&key) {
            return Some(record.clone());
        }

        let store = self.store.as_ref()?;
        let kv_key = self.kv_key(model, task_id);
        let json = store.get(&kv_key).ok().flatten()?;
        match serde_json::from_str::<PerformanceRecord>(&json) {
            Ok(record) => {
                self.records.write().entry(key).or_insert(record.clone());
                Some(record)
            }
            Err(e) => {
                warn!(key = kv_key, "Discarding unreadable persisted record: {e}");
                None
            }
        }
    }

    /// Models with history for a task, best success rate first.
    pub fn top_models_for_task(&self, task_id: &str, limit: usize) -> Vec<PerformanceRecord> {
        let records = self.records.read();
        let mut matching: Vec<PerformanceRecord> = records
            .values()
            .filter(|r| r.task_id == task_id)
            .cloned()
            .collect();
        matching.sort_by(|a, b| {
            b.success_rate()
                .unwrap_or(0.0)
                .partial_cmp(&a.success_rate().unwrap_or(0.0))
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        matching.truncate(limit);
        matching
    }

    // ------------------------------------------------------------------
    // In-flight tracking
    // ------------------------------------------------------------------

    /// Note a dispatched request against a model.
    pub fn begin_request(&self, model: &ModelRef) {
        *self.in_flight.write().entry(model.clone()).or_insert(0) += 1;
    }

    /// Note a settled request (success or failure).
    pub fn end_request(&self, model: &ModelRef) {
        let mut in_flight = self.in_flight.write();
        if let Some(count) = in_flight.get_mut(model) {
            *count = count.saturating_sub(1);
        }
    }

    /// Requests currently in flight against a model.
    pub fn in_flight(&self, model: &ModelRef) -> u32 {
        self.in_flight.read().get(model).copied().unwrap_or(0)
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    /// Evict in-memory records idle past the retention window. The KV tier
    /// expires its copies via per-entry TTL. Returns the number evicted.
    pub fn sweep(&self) -> usize {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.retention).unwrap_or(chrono::Duration::hours(1));
        let mut records = self.records.write();
        let before = records.len();
        records.retain(|_, r| r.last_updated > cutoff);
        let evicted = before - records.len();
        if evicted > 0 {
            debug!(evicted, "Swept stale performance records");
        }
        evicted
    }

    /// Load every persisted record in this ledger's namespace into memory.
    /// Called once at startup; later misses still read through lazily.
    pub fn rehydrate(&self) {
        let Some(ref store) = self.store else {
            return;
        };
        let prefix = format!("{}:", self.namespace);
        let keys = match store.keys_with_prefix(&prefix) {
            Ok(keys) => keys,
            Err(e) => {
                warn!("Failed to enumerate persisted records: {e:#}");
                return;
            }
        };

        let mut loaded = 0usize;
        let mut records = self.records.write();
        for key in keys {
            let Ok(Some(json)) = store.get(&key) else {
                continue;
            };
            let Ok(record) = serde_json::from_str::<PerformanceRecord>(&json) else {
                warn!(key, "Skipping unreadable persisted record");
                continue;
            };
            let map_key = LedgerKey {
                model: record.model.clone(),
                task_id: record.task_id.clone(),
            };
            // In-memory counters win; they are never behind the store.
            records.entry(map_key).or_insert(record);
            loaded += 1;
        }
        debug!(loaded, "Rehydrated performance ledger");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Provider;
    use savora_core::kv::MemoryKvStore;

    fn m(name: &str) -> ModelRef {
        ModelRef::new(Provider::LocalA, name)
    }

    fn config() -> LedgerConfig {
        LedgerConfig::default()
    }

    #[test]
    fn outcome_accumulates() {
        let ledger = PerformanceLedger::new(&config());
        ledger.record_outcome(&m("x"), "t", true, 100);
        ledger.record_outcome(&m("x"), "t", false, 300);

        let record = ledger.record_for(&m("x"), "t").unwrap();
        assert_eq!(record.total_requests, 2);
        assert_eq!(record.successful_requests, 1);
        assert_eq!(record.total_response_time_ms, 400);
        assert_eq!(record.success_rate(), Some(0.5));
        assert_eq!(record.avg_response_time_ms(), Some(200.0));
    }

    #[test]
    fn zero_history_is_unknown_not_failure() {
        let record = PerformanceRecord::new(m("fresh"), "t".into());
        assert_eq!(record.success_rate(), None);
        assert_eq!(record.avg_response_time_ms(), None);
    }

    #[test]
    fn records_are_scoped_per_task() {
        let ledger = PerformanceLedger::new(&config());
        ledger.record_outcome(&m("x"), "t1", true, 10);
        ledger.record_outcome(&m("x"), "t2", false, 10);

        assert_eq!(
            ledger.record_for(&m("x"), "t1").unwrap().success_rate(),
            Some(1.0)
        );
        assert_eq!(
            ledger.record_for(&m("x"), "t2").unwrap().success_rate(),
            Some(0.0)
        );
    }

    #[test]
    fn in_flight_tracking() {
        let ledger = PerformanceLedger::new(&config());
        assert_eq!(ledger.in_flight(&m("x")), 0);
        ledger.begin_request(&m("x"));
        ledger.begin_request(&m("x"));
        assert_eq!(ledger.in_flight(&m("x")), 2);
        ledger.end_request(&m("x"));
        assert_eq!(ledger.in_flight(&m("x")), 1);
        // Ending more than began never underflows.
        ledger.end_request(&m("x"));
        ledger.end_request(&m("x"));
        assert_eq!(ledger.in_flight(&m("x")), 0);
    }

    #[test]
    fn no_lost_updates_under_concurrency() {
        let ledger = Arc::new(PerformanceLedger::new(&config()));
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let ledger = Arc::clone(&ledger);
                std::thread::spawn(move || {
                    for _ in 0..250 {
                        ledger.record_outcome(&m("hot"), "t", true, 1);
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        let record = ledger.record_for(&m("hot"), "t").unwrap();
        assert_eq!(record.total_requests, 2000);
        assert_eq!(record.successful_requests, 2000);
        assert_eq!(record.total_response_time_ms, 2000);
    }

    #[test]
    fn write_through_and_rehydrate() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        {
            let ledger = PerformanceLedger::with_store(&config(), Arc::clone(&store));
            ledger.record_outcome(&m("x"), "t", true, 42);
        }

        // Fresh ledger over the same store, as after a restart.
        let ledger = PerformanceLedger::with_store(&config(), store);
        ledger.rehydrate();
        let record = ledger.record_for(&m("x"), "t").unwrap();
        assert_eq!(record.total_requests, 1);
        assert_eq!(record.total_response_time_ms, 42);
    }

    #[test]
    fn read_through_on_memory_miss() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        {
            let ledger = PerformanceLedger::with_store(&config(), Arc::clone(&store));
            ledger.record_outcome(&m("x"), "t", false, 9);
        }

        let ledger = PerformanceLedger::with_store(&config(), store);
        // No rehydrate call; record_for reads through lazily.
        let record = ledger.record_for(&m("x"), "t").unwrap();
        assert_eq!(record.success_rate(), Some(0.0));
    }

    #[test]
    fn sweep_evicts_stale_records() {
        let ledger = PerformanceLedger::new(&LedgerConfig {
            retention_secs: 0,
            ..config()
        });
        ledger.record_outcome(&m("old"), "t", true, 1);
        // Retention of zero makes everything immediately stale.
        assert_eq!(ledger.sweep(), 1);
        // In-memory copy is gone and there is no store to read through.
        assert!(ledger.record_for(&m("old"), "t").is_none());
    }

    #[test]
    fn top_models_sorted_by_success_rate() {
        let ledger = PerformanceLedger::new(&config());
        ledger.record_outcome(&m("good"), "t", true, 1);
        ledger.record_outcome(&m("good"), "t", true, 1);
        ledger.record_outcome(&m("bad"), "t", false, 1);
        ledger.record_outcome(&m("bad"), "t", true, 1);
        ledger.record_outcome(&m("other-task"), "elsewhere", true, 1);

        let top = ledger.top_models_for_task("t", 10);
        assert_eq!(top.len(), 2);
        assert_eq!(top[0].model, m("good"));
        assert_eq!(top[1].model, m("bad"));
    }
}
