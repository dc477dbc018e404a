//! # afcp-core
//!
//! Core library for AFCP, the Agent Federation Control Plane.
//!
//! AFCP is a single-process, in-memory control plane that maintains a live
//! catalog of remote worker agents, each advertising a set of capabilities,
//! and dispatches incoming work to the best agent for a given capability
//! under failure, load, and latency constraints.
//!
//! ## Components
//!
//! - **Registry** ([`registry`]): owns the set of known agents, their health
//!   and load state, and a reverse capability index.
//! - **Admission Controller** ([`admission`]): per-client sliding-window plus
//!   token-bucket rate limiting.
//! - **Selector** ([`selector`]): routing policy with sticky sessions,
//!   preference lists, least-load tie-break.
//! - **Dispatcher** ([`dispatcher`]): issues a single request via the
//!   pluggable [`transport::Transport`] with a deadline, feeding load signals
//!   back into the registry.
//! - **Quorum Engine** ([`quorum`]): parallel fan-out to every agent with a
//!   capability, collecting votes under a shared deadline.
//! - **Health Monitor** ([`monitor`]): periodic tick that ages out stale
//!   heartbeats and decays load averages.
//! - **Metrics Exporter** ([`metrics`]): OpenMetrics projection of all of the
//!   above.
//!
//! The [`federation::Federation`] facade wires the components together and
//! exposes the public API: `register`, `deregister`, `heartbeat`, `list`,
//! `route`, `consensus`, and `metrics`.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use afcp_core::config::AfcpConfig;
//! use afcp_core::federation::Federation;
//! use afcp_core::registry::AgentSpec;
//! # use afcp_core::transport::Transport;
//! # fn transport() -> Arc<dyn Transport> { unimplemented!() }
//!
//! # fn example() -> Result<(), afcp_core::error::FederationError> {
//! let federation = Federation::builder()
//!     .config(AfcpConfig::default())
//!     .transport(transport())
//!     .build()?;
//!
//! federation.register(
//!     AgentSpec::builder("worker-1", "10.0.0.5:7433")
//!         .capability("transcode")
//!         .build(),
//! )?;
//! # Ok(())
//! # }
//! ```
//!
//! AFCP holds no persisted state, consumes no environment variables, and is
//! constructed explicitly from a config struct and a transport.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod admission;
pub mod clock;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod federation;
pub mod hash;
pub mod metrics;
pub mod monitor;
pub mod quorum;
pub mod registry;
pub mod selector;
pub mod transport;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::config::AfcpConfig;
    pub use crate::dispatcher::RouteOptions;
    pub use crate::error::{FederationError, FederationResult};
    pub use crate::federation::{Federation, FederationBuilder};
    pub use crate::quorum::{ConsensusOptions, ConsensusOutcome};
    pub use crate::registry::{AgentHealth, AgentRecord, AgentSpec, HeartbeatUpdate, ListFilter};
    pub use crate::selector::SelectOptions;
    pub use crate::transport::{Transport, TransportError};
}

/// Re-export commonly used types at the crate root.
pub use config::AfcpConfig;
pub use error::{FederationError, FederationResult};
pub use federation::{Federation, FederationBuilder};
pub use registry::{AgentHealth, AgentRecord, AgentSpec};
pub use transport::{Transport, TransportError};
