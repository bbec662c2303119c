//! Model scorer and selector.
//!
//! Ranks a task's candidate models by a weighted composite of declared
//! preference, historical performance, current load, and privacy fit.
//! Unavailable models are excluded outright, never merely penalized. Equal
//! scores keep candidate declaration order (primary before fallback), so
//! selection is deterministic and testable.

use std::collections::HashMap;

use tracing::debug;

use savora_core::config::ScoringWeights;

use crate::ledger::PerformanceLedger;
use crate::probe::AvailabilityRecord;
use crate::registry::TaskProfile;
use crate::types::ModelRef;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// One ranked candidate with its composite score.
#[derive(Debug, Clone)]
pub struct ScoredCandidate {
    pub model: ModelRef,
    pub score: f64,
    /// Historical success rate in `0.0..=1.0` (neutral default with no
    /// history); reused as the model's contribution weight in ensembles.
    pub weight: f64,
    /// Human-readable breakdown of the score, for logs and diagnostics.
    pub reasoning: String,
}

// ---------------------------------------------------------------------------
// ModelScorer
// ---------------------------------------------------------------------------

/// Computes composite scores and ranks candidates.
pub struct ModelScorer {
    weights: ScoringWeights,
}

impl ModelScorer {
    pub fn new(weights: ScoringWeights) -> Self {
        Self { weights }
    }

    /// Rank a task's candidates, best first. Models without a positive
    /// availability record are excluded entirely.
    ///
    /// `requires_privacy` is passed separately from the profile so a caller
    /// option can force it on for a single request.
    pub fn select_candidates(
        &self,
        profile: &TaskProfile,
        requires_privacy: bool,
        availability: &HashMap<ModelRef, AvailabilityRecord>,
        ledger: &PerformanceLedger,
    ) -> Vec<ScoredCandidate> {
        let total = profile.candidate_count();

        let mut scored: Vec<ScoredCandidate> = profile
            .candidates()
            .enumerate()
            .filter(|(_, model)| {
                availability
                    .get(model)
                    .is_some_and(|record| record.available)
            })
            .map(|(index, model)| {
                self.score_candidate(profile, requires_privacy, model, index, total, ledger)
            })
            .collect();

        // Stable sort keeps declaration order for equal scores.
        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));

        debug!(
            task = %profile.task_id,
            candidates = total,
            eligible = scored.len(),
            "Ranked candidates"
        );
        scored
    }

    /// The single best candidate, or `None` when nothing is available.
    pub fn select_best(
        &self,
        profile: &TaskProfile,
        requires_privacy: bool,
        availability: &HashMap<ModelRef, AvailabilityRecord>,
        ledger: &PerformanceLedger,
    ) -> Option<ScoredCandidate> {
        self.select_candidates(profile, requires_privacy, availability, ledger)
            .into_iter()
            .next()
    }

    // ------------------------------------------------------------------
    // Score terms
    // ------------------------------------------------------------------

    fn score_candidate(
        &self,
        profile: &TaskProfile,
        requires_privacy: bool,
        model: &ModelRef,
        index: usize,
        total: usize,
        ledger: &PerformanceLedger,
    ) -> ScoredCandidate {
        let w = &self.weights;
        let record = ledger.record_for(model, &profile.task_id);

        // Earlier in the declared list = higher preference.
        let preference = w.preference_step * (total - index) as f64;

        // Zero history gets a neutral default so untested models still get
        // traffic; it is never treated as a zero success rate.
        let success_rate = record
            .as_ref()
            .and_then(|r| r.success_rate())
            .unwrap_or(w.neutral_success_rate);

        // 1.0 at or under budget, declining linearly to 0.0 at twice the
        // budget. No history means no penalty.
        let latency_budget_score = match record.as_ref().and_then(|r| r.avg_response_time_ms()) {
            Some(avg) => {
                let budget = profile.expected_latency_ms.max(1) as f64;
                (1.0 - (avg - budget).max(0.0) / budget).max(0.0)
            }
            None => 1.0,
        };

        let performance = success_rate * w.success_weight + latency_budget_score * w.latency_weight;

        let load = f64::from(ledger.in_flight(model)) * w.load_penalty;

        let privacy = if requires_privacy && model.provider.privacy_capable() {
            w.privacy_bonus
        } else {
            0.0
        };

        let score = preference + performance + w.availability_bonus - load + privacy;

        ScoredCandidate {
            model: model.clone(),
            score,
            weight: success_rate,
            reasoning: format!(
                "pref={preference:.1} success={success_rate:.2} latency={latency_budget_score:.2} load=-{load:.1} privacy=+{privacy:.1}"
            ),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
