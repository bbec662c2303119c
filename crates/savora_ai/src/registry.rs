//! Task registry.
//!
//! Maps each named inference task to its candidate models, privacy
//! requirement, complexity class, and latency budget. Profiles are loaded
//! once at startup (built-in catalog or deserialized from config) and never
//! mutated at runtime; lookups are pure.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::RouteError;
use crate::types::{Complexity, ModelRef, Provider};

// ---------------------------------------------------------------------------
// TaskProfile
// ---------------------------------------------------------------------------

/// Immutable routing configuration for one task category.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskProfile {
    pub task_id: String,
    /// Most preferred first.
    pub primary: Vec<ModelRef>,
    /// Consulted only after every primary candidate failed or was unavailable.
    #[serde(default)]
    pub fallback: Vec<ModelRef>,
    /// Prefer privacy-capable backends for this task.
    #[serde(default)]
    pub requires_privacy: bool,
    pub complexity: Complexity,
    /// Latency budget; historical performers slower than this are penalized.
    pub expected_latency_ms: u64,
}

impl TaskProfile {
    /// All candidates in declaration order: primary first, then fallback.
    pub fn candidates(&self) -> impl Iterator<Item = &ModelRef> {
        self.primary.iter().chain(self.fallback.iter())
    }

    pub fn candidate_count(&self) -> usize {
        self.primary.len() + self.fallback.len()
    }
}

// ---------------------------------------------------------------------------
// Default catalog
// ---------------------------------------------------------------------------

fn model(provider: Provider, name: &str) -> ModelRef {
    ModelRef::new(provider, name)
}

/// Built-in task catalog for the platform's inference workloads.
pub fn default_task_catalog() -> Vec<TaskProfile> {
    use Provider::*;
    vec![
        TaskProfile {
            task_id: "restaurant-recommendation".into(),
            primary: vec![
                model(LocalA, "savora-rec-7b"),
                model(LocalB, "llama3-8b-instruct"),
            ],
            fallback: vec![model(Partitioned, "secure-rec")],
            requires_privacy: false,
            complexity: Complexity::High,
            expected_latency_ms: 2_500,
        },
        TaskProfile {
            task_id: "review-sentiment".into(),
            primary: vec![
                model(LocalB, "sentiment-distilled"),
                model(LocalA, "llama3-8b-instruct"),
            ],
            fallback: vec![],
            requires_privacy: false,
            complexity: Complexity::Low,
            expected_latency_ms: 800,
        },
        TaskProfile {
            task_id: "menu-analysis".into(),
            primary: vec![
                model(LocalA, "savora-menu-13b"),
                model(LocalB, "llama3-8b-instruct"),
            ],
            fallback: vec![model(LocalA, "savora-rec-7b")],
            requires_privacy: false,
            complexity: Complexity::Medium,
            expected_latency_ms: 1_500,
        },
        TaskProfile {
            task_id: "description-generation".into(),
            primary: vec![model(LocalB, "llama3-8b-instruct")],
            fallback: vec![model(LocalA, "savora-rec-7b")],
            requires_privacy: false,
            complexity: Complexity::Medium,
            expected_latency_ms: 3_000,
        },
        TaskProfile {
            task_id: "market-insights".into(),
            primary: vec![model(Partitioned, "secure-insights")],
            fallback: vec![model(LocalA, "savora-menu-13b")],
            // Aggregates per-tenant sales data; must stay isolated.
            requires_privacy: true,
            complexity: Complexity::VeryHigh,
            expected_latency_ms: 8_000,
        },
    ]
}

// ---------------------------------------------------------------------------
// TaskRegistry
// ---------------------------------------------------------------------------

/// Static lookup of task profiles.
pub struct TaskRegistry {
    profiles: HashMap<String, TaskProfile>,
}

impl TaskRegistry {
    /// Registry over the built-in catalog.
    pub fn with_defaults() -> Self {
        // The built-in catalog is known-valid.
        Self::from_profiles(default_task_catalog()).expect("default catalog is valid")
    }

    /// Build a registry from explicit profiles, validating each one.
    pub fn from_profiles(profiles: Vec<TaskProfile>) -> anyhow::Result<Self> {
        let mut map = HashMap::with_capacity(profiles.len());
        for profile in profiles {
            if profile.candidate_count() == 0 {
                anyhow::bail!("Task '{}' has no candidate models", profile.task_id);
            }
            if map.insert(profile.task_id.clone(), profile).is_some() {
                anyhow::bail!("Duplicate task id in catalog");
            }
        }
        Ok(Self { profiles: map })
    }

    /// Resolve a task id to its profile.
    pub fn resolve_task(&self, task_id: &str) -> Result<&TaskProfile, RouteError> {
        self.profiles
            .get(task_id)
            .ok_or_else(|| RouteError::UnknownTask(task_id.to_string()))
    }

    /// Every model id referenced by any profile.
    pub fn all_known_model_ids(&self) -> HashSet<ModelRef> {
        self.profiles
            .values()
            .flat_map(|p| p.candidates().cloned())
            .collect()
    }

    pub fn task_ids(&self) -> Vec<&str> {
        self.profiles.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
