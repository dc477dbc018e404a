//! Single-agent request dispatch.
//!
//! The dispatcher is the routing hot path: admission check, selection,
//! transport send under a deadline, then load feedback into the registry.
//! Within one call those steps are strictly ordered; across concurrent
//! calls only per-mutation atomicity is guaranteed (feedback updates
//! commute, so ordering does not matter to observable tolerance).
//!
//! The dispatcher never retries on another agent; retry is the caller's
//! policy. Caller cancellation aborts before the feedback step and leaves
//! agent state untouched.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use crate::admission::AdmissionController;
use crate::clock::Clock;
use crate::error::{FederationError, FederationResult};
use crate::metrics::{AfcpMetrics, RouteOutcome};
use crate::registry::Registry;
use crate::selector::{self, SelectOptions};
use crate::transport::{Transport, TransportError};

/// Multiplicative load reward applied to an agent after a successful
/// dispatch.
pub const SUCCESS_LOAD_DECAY: f64 = 0.9;

/// Client key charged when the caller supplies none.
pub const ANONYMOUS_CLIENT: &str = "anonymous";

/// Options for a single route call.
#[derive(Debug, Clone, Default)]
pub struct RouteOptions {
    /// Client id charged against admission; [`ANONYMOUS_CLIENT`] when unset.
    pub client_id: Option<String>,
    /// Deadline for the transport call; the configured route timeout when
    /// unset.
    pub timeout: Option<Duration>,
    /// Selection policy options.
    pub select: SelectOptions,
}

/// Issues single requests via the transport and feeds outcomes back into
/// the registry.
pub struct Dispatcher {
    registry: Arc<Registry>,
    admission: Arc<AdmissionController>,
    transport: Arc<dyn Transport>,
    metrics: Arc<AfcpMetrics>,
    clock: Arc<dyn Clock>,
    default_timeout: Duration,
}

impl Dispatcher {
    /// Wires a dispatcher over shared component handles.
    #[must_use]
    pub fn new(
        registry: Arc<Registry>,
        admission: Arc<AdmissionController>,
        transport: Arc<dyn Transport>,
        metrics: Arc<AfcpMetrics>,
        clock: Arc<dyn Clock>,
        default_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            admission,
            transport,
            metrics,
            clock,
            default_timeout,
        }
    }

    /// Routes `payload` to the best agent for `capability`.
    ///
    /// # Errors
    ///
    /// - [`FederationError::InvalidInput`] on an empty capability.
    /// - [`FederationError::RateLimited`] when admission rejects the client.
    /// - [`FederationError::NoAgentAvailable`] on an empty candidate set.
    /// - [`FederationError::Timeout`] when the deadline elapses (failure
    ///   feedback is applied first).
    /// - [`FederationError::AgentError`] when the transport fails (failure
    ///   feedback is applied first).
    /// - [`FederationError::Cancelled`] when `cancel` fires; no agent state
    ///   is mutated.
    pub async fn dispatch(
        &self,
        capability: &str,
        payload: Bytes,
        opts: &RouteOptions,
        cancel: &CancellationToken,
    ) -> FederationResult<Bytes> {
        if capability.is_empty() {
            return Err(FederationError::InvalidInput(
                "capability must not be empty".into(),
            ));
        }

        let client_id = opts.client_id.as_deref().unwrap_or(ANONYMOUS_CLIENT);
        let decision = self.admission.check(client_id);
        if !decision.allowed {
            if let Some(reason) = decision.reason {
                self.metrics.record_rejection(reason);
            }
            self.metrics
                .record_route(capability, RouteOutcome::RateLimited, None);
            return Err(FederationError::RateLimited {
                retry_after: decision.retry_after.unwrap_or(Duration::from_secs(1)),
            });
        }

        let candidates = self
            .registry
            .candidates(capability, opts.select.require_healthy);
        let Some(agent) = selector::select(&candidates, &opts.select) else {
            self.metrics
                .record_route(capability, RouteOutcome::NoAgent, None);
            return Err(FederationError::NoAgentAvailable(capability.to_string()));
        };
        let agent_id = agent.id.clone();
        let endpoint = agent.endpoint.clone();

        let timeout = opts.timeout.unwrap_or(self.default_timeout);
        let call_token = cancel.child_token();
        let started = self.clock.now();

        tracing::debug!(
            agent_id = %agent_id,
            capability = %capability,
            timeout = ?timeout,
            "dispatching"
        );

        // Biased: caller cancellation must win over a transport result that
        // became ready in the same poll (cancelling the child token makes a
        // cooperative transport return immediately).
        let result = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                // Caller walked away: abort the transport, mutate nothing.
                call_token.cancel();
                self.metrics
                    .record_route(capability, RouteOutcome::Cancelled, None);
                return Err(FederationError::Cancelled);
            },
            () = tokio::time::sleep(timeout) => {
                call_token.cancel();
                Err(TransportError::Timeout)
            },
            result = self
                .transport
                .send(&endpoint, capability, payload, call_token.clone()) => result,
        };

        let elapsed = self
            .clock
            .now()
            .saturating_duration_since(started)
            .as_secs_f64();

        match result {
            Ok(bytes) => {
                self.registry.record_success(&agent_id, SUCCESS_LOAD_DECAY);
                self.metrics
                    .record_route(capability, RouteOutcome::Ok, Some(elapsed));
                Ok(bytes)
            },
            Err(TransportError::Timeout) => {
                self.registry.record_failure(&agent_id);
                self.metrics
                    .record_route(capability, RouteOutcome::Timeout, Some(elapsed));
                Err(FederationError::Timeout)
            },
            Err(source) => {
                self.registry.record_failure(&agent_id);
                self.metrics
                    .record_route(capability, RouteOutcome::AgentError, Some(elapsed));
                tracing::warn!(agent_id = %agent_id, error = %source, "transport failure");
                Err(FederationError::AgentError { agent_id, source })
            },
        }
    }
}
