use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

// ---------------------------------------------------------------------------
// Providers
// ---------------------------------------------------------------------------

/// Supported inference backends.
///
/// Each variant maps to exactly one `ProviderClient` implementation; adding a
/// backend means adding a variant here and registering a client for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Provider {
    /// Primary local inference server (OpenAI-compatible API).
    LocalA,
    /// Secondary local inference server.
    LocalB,
    /// Partitioned-computation backend with strict data isolation.
    Partitioned,
}

impl Provider {
    /// Whether this backend runs under strict data-isolation guarantees.
    pub fn privacy_capable(&self) -> bool {
        matches!(self, Self::Partitioned)
    }

    pub const ALL: &[Provider] = &[Self::LocalA, Self::LocalB, Self::Partitioned];
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::LocalA => "local-a",
            Self::LocalB => "local-b",
            Self::Partitioned => "partitioned",
        };
        f.write_str(s)
    }
}

impl FromStr for Provider {
    type Err = ModelRefError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local-a" => Ok(Self::LocalA),
            "local-b" => Ok(Self::LocalB),
            "partitioned" => Ok(Self::Partitioned),
            other => Err(ModelRefError::UnknownProvider(other.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// Model references
// ---------------------------------------------------------------------------

/// Error parsing a `<provider>.<name>` model identifier.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ModelRefError {
    #[error("Unknown provider prefix: {0}")]
    UnknownProvider(String),

    #[error("Malformed model id (expected <provider>.<name>): {0}")]
    Malformed(String),
}

/// A fully-qualified model identifier, parsed once at configuration load.
///
/// The wire/config form is `<provider>.<name>` (e.g. `local-a.llama3-8b`);
/// after parsing, dispatch is by the typed [`Provider`] tag, never by string
/// splitting.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModelRef {
    pub provider: Provider,
    pub name: String,
}

impl ModelRef {
    pub fn new(provider: Provider, name: impl Into<String>) -> Self {
        Self {
            provider,
            name: name.into(),
        }
    }

    /// Parse a `<provider>.<name>` identifier.
    pub fn parse(id: &str) -> Result<Self, ModelRefError> {
        let (prefix, name) = id
            .split_once('.')
            .ok_or_else(|| ModelRefError::Malformed(id.to_string()))?;
        if name.is_empty() {
            return Err(ModelRefError::Malformed(id.to_string()));
        }
        Ok(Self {
            provider: prefix.parse()?,
            name: name.to_string(),
        })
    }
}

impl fmt::Display for ModelRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.provider, self.name)
    }
}

impl FromStr for ModelRef {
    type Err = ModelRefError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

// Serialized as the `<provider>.<name>` string so config files and persisted
// records stay human-readable.
impl Serialize for ModelRef {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ModelRef {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Task metadata
// ---------------------------------------------------------------------------

/// Informational complexity class of a task, used for logging and SLA
/// reporting only -- it never affects candidate selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Complexity {
    Low,
    Medium,
    High,
    VeryHigh,
}

impl fmt::Display for Complexity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::VeryHigh => "very-high",
        };
        f.write_str(s)
    }
}

/// Data-isolation level a request was (or must be) served under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrivacyLevel {
    /// Any registered backend may serve the request.
    Standard,
    /// Served by a privacy-capable backend under strict data isolation.
    Isolated,
}

// ---------------------------------------------------------------------------
// Request / Response
// ---------------------------------------------------------------------------

/// Raw response from a provider backend. Latency and routing metadata are
/// attached by the executor, not the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceResponse {
    /// Opaque inference output (recommendation lists, scores, text, ...).
    pub output: serde_json::Value,
    /// Model name as reported by the backend, when it reports one.
    #[serde(default)]
    pub model: Option<String>,
}

/// Per-call options supplied by the caller of `route_request`.
#[derive(Debug, Clone, Default)]
pub struct RouteOptions {
    /// Force a privacy level; `Some(Isolated)` makes privacy-capable
    /// backends preferred even when the task profile does not require it.
    pub privacy_level: Option<PrivacyLevel>,
    /// Per-attempt timeout; falls back to the configured default.
    pub timeout: Option<Duration>,
    /// Dispatch to several models and combine their outputs.
    pub use_ensemble: bool,
    /// Number of ensemble branches; falls back to the configured default.
    pub ensemble_size: Option<usize>,
    /// Field name used to merge list items across ensemble branches.
    /// Defaults to `"id"`.
    pub identity_key: Option<String>,
    /// Field name used to order merged list items. Defaults to `"score"`.
    pub rank_key: Option<String>,
}

/// The value returned to the caller for every routed request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingResult {
    pub request_id: uuid::Uuid,
    pub task_id: String,
    /// Single-model output, or the combined ensemble output.
    pub output: serde_json::Value,
    /// Model(s) that actually contributed to the output.
    pub models_used: Vec<ModelRef>,
    pub response_time_ms: u64,
    pub privacy_level: PrivacyLevel,
    /// Agreement-derived confidence; present only for ensemble results.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

// ---------------------------------------------------------------------------
// Request lifecycle
// ---------------------------------------------------------------------------

/// Lifecycle of one routed request. Terminal states absorb: no transition
/// ever leaves `Succeeded` or `FailedTerminal`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    Pending,
    CandidateSelected,
    Dispatched,
    Succeeded,
    FailedRetrying,
    FailedTerminal,
}

impl RequestState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::FailedTerminal)
    }

    /// Whether `next` is a legal successor of this state.
    pub fn can_advance_to(&self, next: RequestState) -> bool {
        use RequestState::*;
        matches!(
            (self, next),
            (Pending, CandidateSelected)
                | (CandidateSelected, Dispatched)
                | (Dispatched, Succeeded)
                | (Dispatched, FailedRetrying)
                | (Dispatched, FailedTerminal)
                | (FailedRetrying, Dispatched)
                | (FailedRetrying, FailedTerminal)
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_round_trip() {
        for p in Provider::ALL {
            let parsed: Provider = p.to_string().parse().unwrap();
            assert_eq!(parsed, *p);
        }
    }

    #[test]
    fn only_partitioned_is_privacy_capable() {
        assert!(Provider::Partitioned.privacy_capable());
        assert!(!Provider::LocalA.privacy_capable());
        assert!(!Provider::LocalB.privacy_capable());
    }

    #[test]
    fn model_ref_parse() {
        let m = ModelRef::parse("local-a.llama3-8b").unwrap();
        assert_eq!(m.provider, Provider::LocalA);
        assert_eq!(m.name, "llama3-8b");
        assert_eq!(m.to_string(), "local-a.llama3-8b");
    }

    #[test]
    fn model_ref_name_may_contain_dots() {
        let m = ModelRef::parse("local-b.qwen2.5-7b").unwrap();
        assert_eq!(m.provider, Provider::LocalB);
        assert_eq!(m.name, "qwen2.5-7b");
    }

    #[test]
    fn model_ref_rejects_bad_ids() {
        assert!(matches!(
            ModelRef::parse("no-dot-here"),
            Err(ModelRefError::Malformed(_))
        ));
        assert!(matches!(
            ModelRef::parse("cloud.gpt"),
            Err(ModelRefError::UnknownProvider(_))
        ));
        assert!(matches!(
            ModelRef::parse("local-a."),
            Err(ModelRefError::Malformed(_))
        ));
    }

    #[test]
    fn model_ref_serde_as_string() {
        let m = ModelRef::parse("partitioned.secure-rec").unwrap();
        let json = serde_json::to_string(&m).unwrap();
        assert_eq!(json, "\"partitioned.secure-rec\"");
        let back: ModelRef = serde_json::from_str(&json).unwrap();
        assert_eq!(back, m);
    }

    #[test]
    fn routing_result_round_trips_through_json() {
        let result = RoutingResult {
            request_id: uuid::Uuid::new_v4(),
            task_id: "review-sentiment".into(),
            output: serde_json::json!({"label": "positive"}),
            models_used: vec![ModelRef::new(Provider::LocalB, "sentiment-distilled")],
            response_time_ms: 120,
            privacy_level: PrivacyLevel::Standard,
            confidence: None,
            timestamp: chrono::Utc::now(),
        };

        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["task_id"], "review-sentiment");
        assert_eq!(json["models_used"][0], "local-b.sentiment-distilled");
        // Absent confidence is omitted entirely.
        assert!(json.get("confidence").is_none());

        let back: RoutingResult = serde_json::from_value(json).unwrap();
        assert_eq!(back.request_id, result.request_id);
        assert_eq!(back.timestamp, result.timestamp);
    }

    #[test]
    fn terminal_states_absorb() {
        use RequestState::*;
        for next in [
            Pending,
            CandidateSelected,
            Dispatched,
            Succeeded,
            FailedRetrying,
            FailedTerminal,
        ] {
            assert!(!Succeeded.can_advance_to(next));
            assert!(!FailedTerminal.can_advance_to(next));
        }
    }

    #[test]
    fn retry_loop_transitions() {
        use RequestState::*;
        assert!(Pending.can_advance_to(CandidateSelected));
        assert!(CandidateSelected.can_advance_to(Dispatched));
        assert!(Dispatched.can_advance_to(FailedRetrying));
        assert!(FailedRetrying.can_advance_to(Dispatched));
        assert!(Dispatched.can_advance_to(Succeeded));
        assert!(FailedRetrying.can_advance_to(FailedTerminal));
        // No shortcuts.
        assert!(!Pending.can_advance_to(Dispatched));
        assert!(!CandidateSelected.can_advance_to(Succeeded));
    }
}
