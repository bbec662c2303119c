use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

// ---------------------------------------------------------------------------
// Scoring weights
// ---------------------------------------------------------------------------

/// Tunable weights for the model scoring function.
///
/// Every term of the composite score is driven by one of these fields so that
/// deployments can rebalance routing behavior without code changes. The
/// defaults are calibrated so that availability and declared preference
/// dominate, with history and load acting as tie-shifters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ScoringWeights {
    /// Score step between adjacent candidates in declaration order.
    pub preference_step: f64,
    /// Multiplier applied to the historical success rate (0.0..=1.0).
    pub success_weight: f64,
    /// Multiplier applied to the latency-vs-budget score (0.0..=1.0).
    pub latency_weight: f64,
    /// Flat bonus for a model that passed its last availability probe.
    pub availability_bonus: f64,
    /// Penalty per in-flight request currently held by a model.
    pub load_penalty: f64,
    /// Bonus for privacy-capable models when the task requires privacy.
    pub privacy_bonus: f64,
    /// Success rate assumed for a model with no recorded history, so that
    /// untested models are not starved out of the rotation.
    pub neutral_success_rate: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            preference_step: 20.0,
            success_weight: 40.0,
            latency_weight: 20.0,
            availability_bonus: 10.0,
            load_penalty: 2.0,
            privacy_bonus: 15.0,
            neutral_success_rate: 0.8,
        }
    }
}

// ---------------------------------------------------------------------------
// Section configs
// ---------------------------------------------------------------------------

/// Availability prober settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProberConfig {
    /// Seconds an availability record stays trustworthy before re-probing.
    pub ttl_secs: u64,
    /// Per-probe timeout in milliseconds. One unreachable backend must not
    /// stall the whole probe cycle.
    pub probe_timeout_ms: u64,
    /// Interval for the optional background polling task, in seconds.
    pub poll_interval_secs: u64,
}

impl Default for ProberConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 300,
            probe_timeout_ms: 5_000,
            poll_interval_secs: 60,
        }
    }
}

/// Request executor settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Default per-request timeout in milliseconds when the caller does not
    /// supply one.
    pub request_timeout_ms: u64,
    /// Hard cap on retry attempts regardless of candidate list length.
    pub max_attempts: usize,
    /// Default number of models in an ensemble request.
    pub ensemble_size: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 30_000,
            max_attempts: 5,
            ensemble_size: 3,
        }
    }
}

/// Performance ledger settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LedgerConfig {
    /// Seconds a performance record is retained before the sweep evicts it.
    pub retention_secs: u64,
    /// Key prefix used when persisting records to the KV store.
    pub kv_namespace: String,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            retention_secs: 3_600,
            kv_namespace: "perf".into(),
        }
    }
}

/// Provider endpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProviderEndpoints {
    /// Primary local inference server (OpenAI-compatible API).
    pub local_a_url: String,
    /// Secondary local inference server.
    pub local_b_url: String,
    /// Gateway for the partitioned-computation (privacy-preserving) backend.
    pub partitioned_url: String,
}

impl Default for ProviderEndpoints {
    fn default() -> Self {
        Self {
            local_a_url: "http://127.0.0.1:8000".into(),
            local_b_url: "http://127.0.0.1:8080".into(),
            partitioned_url: "http://127.0.0.1:9400".into(),
        }
    }
}

// ---------------------------------------------------------------------------
// SavoraConfig
// ---------------------------------------------------------------------------

/// Top-level configuration for the routing engine.
///
/// Loadable from a TOML file; every field has a default so a missing or
/// partial file still yields a working configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SavoraConfig {
    pub endpoints: ProviderEndpoints,
    pub prober: ProberConfig,
    pub executor: ExecutorConfig,
    pub ledger: LedgerConfig,
    pub scoring: ScoringWeights,
}

impl SavoraConfig {
    /// Load configuration from a TOML file. A missing file yields defaults;
    /// a malformed file is an error (silent fallback would hide typos).
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config: {}", path.display()))
    }

    /// Write configuration to a TOML file, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config: {}", path.display()))?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = SavoraConfig::default();
        assert_eq!(config.prober.ttl_secs, 300);
        assert_eq!(config.prober.probe_timeout_ms, 5_000);
        assert_eq!(config.executor.ensemble_size, 3);
        assert!(config.scoring.neutral_success_rate > 0.0);
        assert!(config.scoring.neutral_success_rate <= 1.0);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let config = SavoraConfig::load(&tmp.path().join("nope.toml")).unwrap();
        assert_eq!(config, SavoraConfig::default());
    }

    #[test]
    fn save_and_reload_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.toml");

        let mut config = SavoraConfig::default();
        config.scoring.privacy_bonus = 42.0;
        config.prober.ttl_secs = 10;
        config.save(&path).unwrap();

        let reloaded = SavoraConfig::load(&path).unwrap();
        assert_eq!(reloaded, config);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("partial.toml");
        std::fs::write(&path, "[prober]\nttl_secs = 7\n").unwrap();

        let config = SavoraConfig::load(&path).unwrap();
        assert_eq!(config.prober.ttl_secs, 7);
        // Untouched sections keep defaults.
        assert_eq!(config.executor, ExecutorConfig::default());
        assert_eq!(config.scoring, ScoringWeights::default());
    }

    #[test]
    fn malformed_file_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("broken.toml");
        std::fs::write(&path, "prober = [not toml").unwrap();
        assert!(SavoraConfig::load(&path).is_err());
    }
}
