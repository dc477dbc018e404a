//! Shared fixtures for the end-to-end suites.

#![allow(dead_code)] // each suite uses a subset

use std::collections::HashSet;
use std::sync::Arc;

use afcp_core::clock::ManualClock;
use afcp_core::config::AfcpConfig;
use afcp_core::federation::Federation;
use afcp_core::registry::AgentSpec;
use afcp_core::transport::{Transport, TransportError};
use async_trait::async_trait;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;

/// Answers every request with the endpoint it was sent to, so tests can
/// observe which agent served a route.
pub struct EndpointEcho;

#[async_trait]
impl Transport for EndpointEcho {
    async fn send(
        &self,
        endpoint: &str,
        _capability: &str,
        _payload: Bytes,
        _cancel: CancellationToken,
    ) -> Result<Bytes, TransportError> {
        Ok(Bytes::from(endpoint.to_string()))
    }
}

/// Succeeds unless the endpoint is scripted to fail.
pub struct ScriptedTransport {
    fail: HashSet<String>,
}

impl ScriptedTransport {
    pub fn failing(endpoints: &[&str]) -> Self {
        Self {
            fail: endpoints.iter().map(ToString::to_string).collect(),
        }
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(
        &self,
        endpoint: &str,
        _capability: &str,
        _payload: Bytes,
        _cancel: CancellationToken,
    ) -> Result<Bytes, TransportError> {
        if self.fail.contains(endpoint) {
            Err(TransportError::Refused("scripted failure".into()))
        } else {
            Ok(Bytes::from_static(b"ok"))
        }
    }
}

/// Blocks until cancelled, as a hung agent would.
pub struct BlockingTransport;

#[async_trait]
impl Transport for BlockingTransport {
    async fn send(
        &self,
        _endpoint: &str,
        _capability: &str,
        _payload: Bytes,
        cancel: CancellationToken,
    ) -> Result<Bytes, TransportError> {
        cancel.cancelled().await;
        Err(TransportError::Unknown("aborted".into()))
    }
}

/// A federation on a manual clock with the given transport and config.
pub fn federation_with(
    config: AfcpConfig,
    transport: Arc<dyn Transport>,
) -> (Federation, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new());
    let federation = Federation::builder()
        .config(config)
        .transport(transport)
        .clock(clock.clone())
        .build()
        .expect("federation should build");
    (federation, clock)
}

/// Registers an agent whose endpoint equals its id, advertising `caps`.
pub fn register_agent(federation: &Federation, id: &str, caps: &[&str], load: f64) {
    federation
        .register(
            AgentSpec::builder(id, id)
                .capabilities(caps.iter().copied())
                .load_avg(load)
                .build(),
        )
        .expect("agent should register");
}
