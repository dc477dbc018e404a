//! Public error kinds for the control plane.
//!
//! Component-level errors bubble to the public API unchanged; the dispatcher
//! and quorum engine convert raw [`TransportError`]s into the typed kinds
//! below and apply load feedback before surfacing them.

use std::time::Duration;

use thiserror::Error;

use crate::transport::TransportError;

/// Errors surfaced by the public federation API.
#[derive(Debug, Error)]
pub enum FederationError {
    /// Malformed agent record, update, or configuration.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Agent id not present in the registry.
    #[error("unknown agent '{0}'")]
    UnknownAgent(String),

    /// Empty candidate set after capability and health filters.
    #[error("no agent available for capability '{0}'")]
    NoAgentAvailable(String),

    /// Admission denied the request.
    #[error("rate limited; retry after {retry_after:?}")]
    RateLimited {
        /// How long the caller should wait before retrying.
        retry_after: Duration,
    },

    /// Deadline elapsed before a response arrived.
    #[error("deadline elapsed before response")]
    Timeout,

    /// The transport returned a failure for a specific agent.
    #[error("agent '{agent_id}' failed: {source}")]
    AgentError {
        /// Id of the failing agent.
        agent_id: String,
        /// The underlying transport failure.
        #[source]
        source: TransportError,
    },

    /// The caller cancelled before completion.
    #[error("cancelled before completion")]
    Cancelled,
}

/// Result type for federation operations.
pub type FederationResult<T> = Result<T, FederationError>;
