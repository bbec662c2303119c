//! Request executor.
//!
//! Walks the scorer's ranked candidate list, dispatching to one model at a
//! time with a per-attempt timeout, or fans out to several models at once in
//! ensemble mode. Every attempt's outcome lands in the performance ledger,
//! including the failures a later success papers over.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use savora_core::config::ExecutorConfig;

use crate::ensemble::{self, Contribution, MergeKeys};
use crate::error::{FailedAttempt, RouteError};
use crate::ledger::PerformanceLedger;
use crate::providers::ProviderRegistry;
use crate::registry::TaskProfile;
use crate::scoring::ScoredCandidate;
use crate::types::{ModelRef, PrivacyLevel, RequestState, RoutingResult};

/// A recorded dispatch outcome for diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchEvent {
    /// Milliseconds since the executor was created (avoids `Instant`
    /// serialization issues).
    pub age_ms: u64,
    pub task_id: String,
    pub model: ModelRef,
    pub success: bool,
    pub latency_ms: u64,
    /// Failure reason, when the dispatch failed.
    pub reason: Option<String>,
}

// ---------------------------------------------------------------------------
// RequestExecutor
// ---------------------------------------------------------------------------

/// Dispatches routed requests and records their outcomes.
pub struct RequestExecutor {
    providers: Arc<ProviderRegistry>,
    ledger: Arc<PerformanceLedger>,
    max_attempts: usize,
    history: RwLock<Vec<DispatchEvent>>,
    created_at: Instant,
}

/// Outcome of one dispatched branch, before ledger bookkeeping.
struct BranchOutcome {
    candidate: ScoredCandidate,
    latency_ms: u64,
    result: Result<serde_json::Value, String>,
}

impl RequestExecutor {
    pub fn new(
        providers: Arc<ProviderRegistry>,
        ledger: Arc<PerformanceLedger>,
        config: &ExecutorConfig,
    ) -> Self {
        Self {
            providers,
            ledger,
            max_attempts: config.max_attempts.max(1),
            history: RwLock::new(Vec::new()),
            created_at: Instant::now(),
        }
    }

    /// Recent dispatch outcomes, oldest first.
    pub fn dispatch_history(&self) -> Vec<DispatchEvent> {
        self.history.read().clone()
    }

    fn record_event(&self, event: DispatchEvent) {
        let mut history = self.history.write();
        history.push(event);
        // Cap at 1000, keep the last 500.
        if history.len() > 1000 {
            let drain_end = history.len() - 500;
            history.drain(..drain_end);
        }
    }

    // ------------------------------------------------------------------
    // Single-model execution
    // ------------------------------------------------------------------

    /// Try ranked candidates in order until one succeeds or the attempt
    /// budget runs out. A success after earlier failures is a success; the
    /// failures live on only in the ledger and the debug log.
    pub async fn execute(
        &self,
        profile: &TaskProfile,
        ranked: &[ScoredCandidate],
        payload: &serde_json::Value,
        timeout: Duration,
    ) -> Result<RoutingResult, RouteError> {
        if ranked.is_empty() {
            return Err(RouteError::NoModelAvailable {
                task: profile.task_id.clone(),
            });
        }

        let mut state = RequestState::Pending;
        let mut attempts: Vec<FailedAttempt> = Vec::new();
        let budget = ranked.len().min(self.max_attempts);
        let started = Instant::now();

        for candidate in &ranked[..budget] {
            // Retries re-enter at Dispatched; only the first attempt passes
            // through candidate selection.
            if state == RequestState::Pending {
                state = advance(state, RequestState::CandidateSelected, &profile.task_id);
            }
            state = advance(state, RequestState::Dispatched, &profile.task_id);

            let outcome = self.dispatch(candidate, &profile.task_id, payload, timeout).await;
            match outcome.result {
                Ok(output) => {
                    advance(state, RequestState::Succeeded, &profile.task_id);
                    return Ok(self.result_for(
                        profile,
                        output,
                        vec![candidate.model.clone()],
                        started.elapsed().as_millis() as u64,
                        None,
                    ));
                }
                Err(reason) => {
                    state = advance(state, RequestState::FailedRetrying, &profile.task_id);
                    attempts.push(FailedAttempt {
                        model: candidate.model.clone(),
                        reason,
                        latency_ms: outcome.latency_ms,
                    });
                }
            }
        }

        advance(state, RequestState::FailedTerminal, &profile.task_id);
        warn!(
            task = %profile.task_id,
            attempts = attempts.len(),
            "Every candidate failed"
        );
        Err(RouteError::AllModelsFailed {
            task: profile.task_id.clone(),
            attempts,
        })
    }

    // ------------------------------------------------------------------
    // Ensemble execution
    // ------------------------------------------------------------------

    /// Dispatch the top `size` candidates concurrently and combine their
    /// outputs. Branch failures are isolated: any subset of successes still
    /// produces a result. With fewer eligible candidates than the requested
    /// size the request degrades to single-model execution with fallback.
    pub async fn execute_ensemble(
        &self,
        profile: &TaskProfile,
        ranked: &[ScoredCandidate],
        payload: &serde_json::Value,
        timeout: Duration,
        size: usize,
        keys: &MergeKeys,
    ) -> Result<RoutingResult, RouteError> {
        let size = size.max(2);
        if ranked.len() < size {
            debug!(
                task = %profile.task_id,
                requested = size,
                eligible = ranked.len(),
                "Fewer candidates than the requested ensemble size, degrading to single dispatch"
            );
            return self.execute(profile, ranked, payload, timeout).await;
        }
        let branches = &ranked[..size];

        let started = Instant::now();
        let futures = branches
            .iter()
            .map(|candidate| self.dispatch(candidate, &profile.task_id, payload, timeout));
        let outcomes = futures::future::join_all(futures).await;

        let dispatched = outcomes.len();
        let mut contributions: Vec<Contribution> = Vec::new();
        let mut models_used: Vec<_> = Vec::new();
        let mut failures: Vec<FailedAttempt> = Vec::new();
        for outcome in outcomes {
            match outcome.result {
                Ok(output) => {
                    models_used.push(outcome.candidate.model.clone());
                    contributions.push(Contribution {
                        weight: outcome.candidate.weight,
                        output,
                    });
                }
                Err(reason) => failures.push(FailedAttempt {
                    model: outcome.candidate.model.clone(),
                    reason,
                    latency_ms: outcome.latency_ms,
                }),
            }
        }

        if contributions.is_empty() {
            warn!(task = %profile.task_id, dispatched, "Every ensemble branch failed");
            return Err(RouteError::EnsembleExhausted {
                task: profile.task_id.clone(),
                attempts: failures,
            });
        }

        debug!(
            task = %profile.task_id,
            dispatched,
            succeeded = contributions.len(),
            "Combining ensemble branches"
        );
        let confidence = ensemble::confidence(&contributions, dispatched);
        let output = ensemble::combine_outputs(&contributions, keys);
        Ok(self.result_for(
            profile,
            output,
            models_used,
            started.elapsed().as_millis() as u64,
            Some(confidence),
        ))
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    /// One timed dispatch to one model, with ledger bookkeeping on both
    /// sides. Never returns early without `end_request`.
    async fn dispatch(
        &self,
        candidate: &ScoredCandidate,
        task_id: &str,
        payload: &serde_json::Value,
        timeout: Duration,
    ) -> BranchOutcome {
        let model = &candidate.model;
        let Some(client) = self.providers.get(model.provider) else {
            return BranchOutcome {
                candidate: candidate.clone(),
                latency_ms: 0,
                result: Err(format!("no client registered for provider {}", model.provider)),
            };
        };

        self.ledger.begin_request(model);
        let started = Instant::now();
        let invocation =
            tokio::time::timeout(timeout, client.invoke(&model.name, payload, timeout)).await;
        let latency_ms = started.elapsed().as_millis() as u64;
        self.ledger.end_request(model);

        let result = match invocation {
            Ok(Ok(response)) => Ok(response.output),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("timed out after {}ms", timeout.as_millis())),
        };

        let success = result.is_ok();
        self.ledger.record_outcome(model, task_id, success, latency_ms);
        if let Err(ref reason) = result {
            debug!(model = %model, task = task_id, latency_ms, reason, "Dispatch failed");
        }
        self.record_event(DispatchEvent {
            age_ms: self.created_at.elapsed().as_millis() as u64,
            task_id: task_id.to_string(),
            model: model.clone(),
            success,
            latency_ms,
            reason: result.as_ref().err().cloned(),
        });

        BranchOutcome {
            candidate: candidate.clone(),
            latency_ms,
            result,
        }
    }

    fn result_for(
        &self,
        profile: &TaskProfile,
        output: serde_json::Value,
        models_used: Vec<ModelRef>,
        response_time_ms: u64,
        confidence: Option<f64>,
    ) -> RoutingResult {
        // The result is Isolated only if every contributing backend is
        // privacy-capable.
        let privacy_level = if !models_used.is_empty()
            && models_used.iter().all(|m| m.provider.privacy_capable())
        {
            PrivacyLevel::Isolated
        } else {
            PrivacyLevel::Standard
        };

        RoutingResult {
            request_id: uuid::Uuid::new_v4(),
            task_id: profile.task_id.clone(),
            output,
            models_used,
            response_time_ms,
            privacy_level,
            confidence,
            timestamp: chrono::Utc::now(),
        }
    }
}

/// Log and apply one state transition. Illegal transitions indicate a bug in
/// the retry loop, so they are logged loudly but never panic in production.
fn advance(from: RequestState, to: RequestState, task_id: &str) -> RequestState {
    if from.can_advance_to(to) {
        debug!(task = task_id, ?from, ?to, "Request state transition");
    } else {
        warn!(task = task_id, ?from, ?to, "Illegal request state transition");
    }
    to
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
