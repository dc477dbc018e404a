//! Quorum fan-out for distributed decisions.
//!
//! A consensus call snapshots the healthy candidate set for a capability,
//! fans one transport call out to every candidate in parallel under a single
//! shared deadline, waits for every sub-call's terminal state, and decides
//! by strict majority: `ok_count / N > quorum`. An exact split at the quorum
//! fraction does **not** decide.
//!
//! The engine takes its registry snapshot before the fan-out and holds no
//! lock across transport I/O. The returned decision sequence is ordered by
//! agent id and is deterministic for a given candidate set and set of
//! transport outcomes; sub-call interleaving never leaks into the result.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::join_all;
use tokio_util::sync::CancellationToken;

use crate::error::{FederationError, FederationResult};
use crate::metrics::AfcpMetrics;
use crate::registry::Registry;
use crate::transport::{Transport, TransportError};

/// Multiplicative load reward applied per successful consensus sub-call.
pub const SUCCESS_LOAD_DECAY: f64 = 0.95;

/// Default quorum fraction: a strict majority.
pub const DEFAULT_QUORUM: f64 = 0.5;

/// Options for a consensus call.
#[derive(Debug, Clone, Default)]
pub struct ConsensusOptions {
    /// Required fraction of successful sub-calls, in `[0, 1]`; the decision
    /// requires strictly more than this. Defaults to [`DEFAULT_QUORUM`].
    pub quorum: Option<f64>,
    /// Shared deadline for the fan-out; the configured consensus timeout
    /// when unset.
    pub timeout: Option<Duration>,
}

/// One candidate's terminal state within a consensus call.
#[derive(Debug, Clone)]
pub struct AgentDecision {
    /// The candidate agent's id.
    pub agent_id: String,
    /// Whether the sub-call succeeded.
    pub ok: bool,
    /// Response bytes on success.
    pub value: Option<Bytes>,
    /// Failure description otherwise.
    pub error: Option<String>,
}

/// Result of a consensus call: the decision plus every candidate's outcome,
/// ordered by agent id.
#[derive(Debug, Clone, Default)]
pub struct ConsensusOutcome {
    /// Whether the quorum was strictly exceeded.
    pub decided: bool,
    /// Per-candidate outcomes in ascending agent-id order.
    pub decisions: Vec<AgentDecision>,
}

#[derive(Debug)]
enum SubOutcome {
    Succeeded(Bytes),
    DeadlineElapsed,
    Failed(String),
    CallerCancelled,
}

/// Fans proposals out to every capable agent and counts votes.
pub struct QuorumEngine {
    registry: Arc<Registry>,
    transport: Arc<dyn Transport>,
    metrics: Arc<AfcpMetrics>,
    default_timeout: Duration,
}

impl QuorumEngine {
    /// Wires a quorum engine over shared component handles.
    #[must_use]
    pub fn new(
        registry: Arc<Registry>,
        transport: Arc<dyn Transport>,
        metrics: Arc<AfcpMetrics>,
        default_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            transport,
            metrics,
            default_timeout,
        }
    }

    /// Runs one consensus round for `capability` with `proposal`.
    ///
    /// An empty candidate set yields `{decided: false, decisions: []}`.
    /// Caller cancellation observed before the snapshot raises
    /// [`FederationError::Cancelled`]; cancellation mid-fan-out returns the
    /// partial decision sequence with `decided: false` and applies no load
    /// feedback.
    ///
    /// # Errors
    ///
    /// Returns [`FederationError::InvalidInput`] on an empty capability or a
    /// quorum outside `[0, 1]`, and [`FederationError::Cancelled`] when the
    /// caller cancelled before the fan-out began.
    pub async fn consensus(
        &self,
        capability: &str,
        proposal: Bytes,
        opts: &ConsensusOptions,
        cancel: &CancellationToken,
    ) -> FederationResult<ConsensusOutcome> {
        if capability.is_empty() {
            return Err(FederationError::InvalidInput(
                "capability must not be empty".into(),
            ));
        }
        let quorum = opts.quorum.unwrap_or(DEFAULT_QUORUM);
        if !quorum.is_finite() || !(0.0..=1.0).contains(&quorum) {
            return Err(FederationError::InvalidInput(format!(
                "quorum must be within [0, 1], got {quorum}"
            )));
        }
        if cancel.is_cancelled() {
            return Err(FederationError::Cancelled);
        }

        let candidates = self.registry.candidates(capability, true);
        if candidates.is_empty() {
            self.metrics.record_consensus(capability, false);
            return Ok(ConsensusOutcome::default());
        }

        let timeout = opts.timeout.unwrap_or(self.default_timeout);
        let deadline = tokio::time::Instant::now() + timeout;
        tracing::debug!(
            capability = %capability,
            candidates = candidates.len(),
            timeout = ?timeout,
            "consensus fan-out"
        );

        let sub_calls: Vec<_> = candidates
            .iter()
            .map(|agent| {
                let transport = Arc::clone(&self.transport);
                let endpoint = agent.endpoint.clone();
                let capability = capability.to_string();
                let payload = proposal.clone();
                let cancel = cancel.clone();
                async move {
                    let call_token = cancel.child_token();
                    tokio::select! {
                        biased;
                        () = cancel.cancelled() => SubOutcome::CallerCancelled,
                        () = tokio::time::sleep_until(deadline) => {
                            call_token.cancel();
                            SubOutcome::DeadlineElapsed
                        },
                        result = transport.send(
                            &endpoint,
                            &capability,
                            payload,
                            call_token.clone(),
                        ) => match result {
                            Ok(bytes) => SubOutcome::Succeeded(bytes),
                            Err(TransportError::Timeout) => SubOutcome::DeadlineElapsed,
                            Err(err) => SubOutcome::Failed(err.to_string()),
                        },
                    }
                }
            })
            .collect();

        // Every sub-call reaches a terminal state; there is no early return
        // on first success because the decision needs all of them.
        let outcomes = join_all(sub_calls).await;

        let interrupted = cancel.is_cancelled()
            || outcomes
                .iter()
                .any(|outcome| matches!(outcome, SubOutcome::CallerCancelled));

        let total = candidates.len();
        let mut ok_count = 0usize;
        let mut decisions = Vec::with_capacity(total);
        for (agent, outcome) in candidates.iter().zip(outcomes) {
            match outcome {
                SubOutcome::Succeeded(bytes) => {
                    if !interrupted {
                        self.registry.record_success(&agent.id, SUCCESS_LOAD_DECAY);
                    }
                    ok_count += 1;
                    decisions.push(AgentDecision {
                        agent_id: agent.id.clone(),
                        ok: true,
                        value: Some(bytes),
                        error: None,
                    });
                },
                SubOutcome::DeadlineElapsed => {
                    if !interrupted {
                        self.registry.record_failure(&agent.id);
                    }
                    decisions.push(AgentDecision {
                        agent_id: agent.id.clone(),
                        ok: false,
                        value: None,
                        error: Some(FederationError::Timeout.to_string()),
                    });
                },
                SubOutcome::Failed(message) => {
                    if !interrupted {
                        self.registry.record_failure(&agent.id);
                    }
                    decisions.push(AgentDecision {
                        agent_id: agent.id.clone(),
                        ok: false,
                        value: None,
                        error: Some(message),
                    });
                },
                SubOutcome::CallerCancelled => {
                    decisions.push(AgentDecision {
                        agent_id: agent.id.clone(),
                        ok: false,
                        value: None,
                        error: Some(FederationError::Cancelled.to_string()),
                    });
                },
            }
        }

        #[allow(clippy::cast_precision_loss)] // candidate counts are small
        let decided = !interrupted && (ok_count as f64) / (total as f64) > quorum;
        self.metrics.record_consensus(capability, decided);
        tracing::debug!(
            capability = %capability,
            ok_count,
            total,
            decided,
            "consensus settled"
        );

        Ok(ConsensusOutcome { decided, decisions })
    }
}
