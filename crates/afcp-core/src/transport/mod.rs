//! Pluggable agent transport abstraction.
//!
//! AFCP never speaks to agents directly; concrete transports (HTTP, mTLS,
//! gRPC) live outside the control plane and implement [`Transport`]. The
//! contract is deliberately small: take `(endpoint, capability, payload,
//! cancellation)`, return bytes or a typed error, and honor cancellation
//! promptly; the dispatcher and quorum engine rely on it to abort in-flight
//! work when a deadline fires or the caller walks away.
//!
//! Endpoints are opaque strings; the control plane hands them through
//! unparsed.

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Typed failures a transport may report.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The transport's own deadline elapsed before a response.
    #[error("transport deadline elapsed")]
    Timeout,

    /// The endpoint actively refused the request.
    #[error("endpoint refused the request: {0}")]
    Refused(String),

    /// The endpoint responded with something the transport could not parse.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Any other failure.
    #[error("transport failure: {0}")]
    Unknown(String),
}

/// A concurrency-safe channel to remote agents.
///
/// Implementations must be safe to share across concurrent dispatches and
/// must observe `cancel`: when the token fires, abort the in-flight request
/// and return promptly (the returned error is discarded by callers that
/// cancelled).
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends `payload` to `endpoint` for the given `capability` and returns
    /// the response bytes.
    ///
    /// # Errors
    ///
    /// Returns a [`TransportError`] describing the failure.
    async fn send(
        &self,
        endpoint: &str,
        capability: &str,
        payload: Bytes,
        cancel: CancellationToken,
    ) -> Result<Bytes, TransportError>;
}
