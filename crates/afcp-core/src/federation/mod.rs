//! The public control plane facade.
//!
//! [`Federation`] wires the registry, admission controller, dispatcher,
//! quorum engine, health monitor, and metrics exporter together behind the
//! seven public operations: `register`, `deregister`, `heartbeat`, `list`,
//! `route`, `consensus`, and `metrics`.
//!
//! Construction is explicit: a [`Federation`] is built from an
//! [`AfcpConfig`] and a [`Transport`], with an optionally injected clock for
//! tests. There is no process-global state.

use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::admission::AdmissionController;
use crate::clock::{Clock, SystemClock};
use crate::config::AfcpConfig;
use crate::dispatcher::{Dispatcher, RouteOptions};
use crate::error::{FederationError, FederationResult};
use crate::metrics::AfcpMetrics;
use crate::monitor::HealthMonitor;
use crate::quorum::{ConsensusOptions, ConsensusOutcome, QuorumEngine};
use crate::registry::{AgentRecord, AgentSpec, HeartbeatUpdate, ListFilter, Registry};
use crate::transport::Transport;

/// Builder for [`Federation`].
pub struct FederationBuilder {
    config: AfcpConfig,
    transport: Option<Arc<dyn Transport>>,
    clock: Arc<dyn Clock>,
}

impl FederationBuilder {
    /// Sets the configuration. Defaults to [`AfcpConfig::default`].
    #[must_use]
    pub fn config(mut self, config: AfcpConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the transport used to reach agents. Required.
    #[must_use]
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Overrides the clock; tests inject a manual clock here.
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Validates the configuration and assembles the control plane.
    ///
    /// # Errors
    ///
    /// Returns [`FederationError::InvalidInput`] when the configuration is
    /// out of range or no transport was supplied.
    pub fn build(self) -> FederationResult<Federation> {
        self.config.validate()?;
        let transport = self.transport.ok_or_else(|| {
            FederationError::InvalidInput("a transport is required".into())
        })?;

        let registry = Arc::new(Registry::new(self.clock.clone()));
        let admission = Arc::new(AdmissionController::new(
            self.config.admission.clone(),
            self.clock.clone(),
        ));
        let metrics = Arc::new(AfcpMetrics::new(&self.config.metrics.histogram_buckets));
        let dispatcher = Dispatcher::new(
            registry.clone(),
            admission.clone(),
            transport.clone(),
            metrics.clone(),
            self.clock.clone(),
            self.config.route_timeout,
        );
        let quorum = QuorumEngine::new(
            registry.clone(),
            transport,
            metrics.clone(),
            self.config.consensus_timeout,
        );
        let monitor = Arc::new(HealthMonitor::new(
            registry.clone(),
            admission.clone(),
            metrics.clone(),
            self.config.health.clone(),
        ));

        Ok(Federation {
            registry,
            admission,
            metrics,
            dispatcher,
            quorum,
            monitor,
            monitor_cancel: CancellationToken::new(),
            monitor_task: Mutex::new(None),
        })
    }
}

/// The Agent Federation Control Plane.
pub struct Federation {
    registry: Arc<Registry>,
    admission: Arc<AdmissionController>,
    metrics: Arc<AfcpMetrics>,
    dispatcher: Dispatcher,
    quorum: QuorumEngine,
    monitor: Arc<HealthMonitor>,
    monitor_cancel: CancellationToken,
    monitor_task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Federation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Federation").finish_non_exhaustive()
    }
}

impl Federation {
    /// Starts building a federation.
    #[must_use]
    pub fn builder() -> FederationBuilder {
        FederationBuilder {
            config: AfcpConfig::default(),
            transport: None,
            clock: Arc::new(SystemClock),
        }
    }

    /// Registers a new agent or updates an existing one. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`FederationError::InvalidInput`] on an empty id or a
    /// non-finite load average.
    pub fn register(&self, agent: AgentSpec) -> FederationResult<()> {
        self.registry.upsert(agent)
    }

    /// Removes an agent, returning whether it was present.
    pub fn deregister(&self, id: &str) -> bool {
        self.registry.remove(id)
    }

    /// Records a heartbeat; a no-op on unknown ids (returns `false`).
    ///
    /// # Errors
    ///
    /// Returns [`FederationError::InvalidInput`] on a non-finite load
    /// average in the update.
    pub fn heartbeat(&self, id: &str, update: &HeartbeatUpdate) -> FederationResult<bool> {
        self.registry.heartbeat(id, update)
    }

    /// Returns an id-sorted snapshot of agents matching `filter`.
    #[must_use]
    pub fn list(&self, filter: &ListFilter) -> Vec<AgentRecord> {
        self.registry.list(filter)
    }

    /// Routes `payload` to the best agent for `capability`.
    ///
    /// # Errors
    ///
    /// See [`Dispatcher::dispatch`] for the error contract.
    pub async fn route(
        &self,
        capability: &str,
        payload: Bytes,
        opts: &RouteOptions,
        cancel: &CancellationToken,
    ) -> FederationResult<Bytes> {
        self.dispatcher.dispatch(capability, payload, opts, cancel).await
    }

    /// Runs a consensus round across every healthy agent advertising
    /// `capability`.
    ///
    /// # Errors
    ///
    /// See [`QuorumEngine::consensus`] for the error contract.
    pub async fn consensus(
        &self,
        capability: &str,
        proposal: Bytes,
        opts: &ConsensusOptions,
        cancel: &CancellationToken,
    ) -> FederationResult<ConsensusOutcome> {
        self.quorum.consensus(capability, proposal, opts, cancel).await
    }

    /// Renders the OpenMetrics payload.
    #[must_use]
    pub fn metrics(&self) -> String {
        self.metrics.render(&self.registry.observe())
    }

    /// Starts the health monitor's background ticker. Idempotent; must be
    /// called within a tokio runtime.
    pub fn start_monitor(&self) {
        let mut task = self
            .monitor_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if task.is_none() {
            *task = Some(self.monitor.clone().spawn(self.monitor_cancel.clone()));
        }
    }

    /// Stops the health monitor and waits for it to exit.
    pub async fn shutdown(&self) {
        self.monitor_cancel.cancel();
        let task = self
            .monitor_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                tracing::warn!(error = %err, "health monitor task failed");
            }
        }
    }

    /// The underlying registry, for direct component access.
    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// The underlying admission controller, for peek/reset access.
    #[must_use]
    pub fn admission(&self) -> &AdmissionController {
        &self.admission
    }

    /// Drives one health monitor tick synchronously, for deterministic
    /// tests and embedders running their own schedulers.
    pub fn tick_monitor(&self) {
        self.monitor.tick_once();
    }
}

impl Drop for Federation {
    fn drop(&mut self) {
        // Stop the ticker; the task itself is detached and will observe the
        // token on its next poll.
        self.monitor_cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::clock::ManualClock;
    use crate::registry::AgentHealth;
    use crate::transport::TransportError;

    struct EchoTransport;

    #[async_trait]
    impl Transport for EchoTransport {
        async fn send(
            &self,
            _endpoint: &str,
            _capability: &str,
            payload: Bytes,
            _cancel: CancellationToken,
        ) -> Result<Bytes, TransportError> {
            Ok(payload)
        }
    }

    fn federation() -> Federation {
        Federation::builder()
            .transport(Arc::new(EchoTransport))
            .clock(Arc::new(ManualClock::new()))
            .build()
            .unwrap()
    }

    #[test]
    fn test_build_requires_transport() {
        let err = Federation::builder().build().unwrap_err();
        assert!(matches!(err, FederationError::InvalidInput(_)));
    }

    #[test]
    fn test_build_validates_config() {
        let mut config = AfcpConfig::default();
        config.admission.max_requests = 0;
        let err = Federation::builder()
            .config(config)
            .transport(Arc::new(EchoTransport))
            .build()
            .unwrap_err();
        assert!(matches!(err, FederationError::InvalidInput(_)));
    }

    #[test]
    fn test_register_list_deregister() {
        let federation = federation();
        federation
            .register(AgentSpec::builder("a", "a.local").capability("x").build())
            .unwrap();

        let listed = federation.list(&ListFilter::default());
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, "a");

        assert!(federation.deregister("a"));
        assert!(!federation.deregister("a"));
        assert!(federation.list(&ListFilter::default()).is_empty());
    }

    #[test]
    fn test_heartbeat_unknown_is_noop() {
        let federation = federation();
        assert!(!federation.heartbeat("ghost", &HeartbeatUpdate::default()).unwrap());
    }

    #[tokio::test]
    async fn test_route_round_trip() {
        let federation = federation();
        federation
            .register(AgentSpec::builder("a", "a.local").capability("x").build())
            .unwrap();

        let response = federation
            .route(
                "x",
                Bytes::from_static(b"hello"),
                &RouteOptions::default(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(response, Bytes::from_static(b"hello"));
    }

    #[tokio::test]
    async fn test_consensus_round_trip() {
        let federation = federation();
        for id in ["a", "b", "c"] {
            federation
                .register(AgentSpec::builder(id, format!("{id}.local")).capability("decide").build())
                .unwrap();
        }

        let outcome = federation
            .consensus(
                "decide",
                Bytes::from_static(b"proposal"),
                &ConsensusOptions::default(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(outcome.decided);
        assert_eq!(outcome.decisions.len(), 3);
    }

    #[test]
    fn test_metrics_payload_shape() {
        let federation = federation();
        federation
            .register(
                AgentSpec::builder("a", "a.local")
                    .capability("x")
                    .load_avg(0.5)
                    .build(),
            )
            .unwrap();

        let payload = federation.metrics();
        assert!(payload.contains("afcp_agents_total{health=\"active\"} 1"));
        assert!(payload.contains("afcp_capabilities_total 1"));
        assert!(payload.contains("afcp_load_avg{agent=\"a\"} 0.5"));
        assert!(payload.ends_with("# EOF\n"));
    }

    #[test]
    fn test_tick_monitor_ages_agents() {
        let clock = Arc::new(ManualClock::new());
        let federation = Federation::builder()
            .transport(Arc::new(EchoTransport))
            .clock(clock.clone())
            .build()
            .unwrap();
        federation
            .register(
                AgentSpec::builder("a", "a.local")
                    .capability("x")
                    .last_heartbeat(clock.now() - std::time::Duration::from_secs(90))
                    .build(),
            )
            .unwrap();

        federation.tick_monitor();
        assert_eq!(
            federation.registry().get("a").unwrap().health,
            AgentHealth::Offline
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_monitor_lifecycle() {
        let federation = federation();
        federation.start_monitor();
        // Idempotent.
        federation.start_monitor();
        federation.shutdown().await;
    }
}
