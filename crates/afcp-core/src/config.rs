//! Configuration for the control plane.
//!
//! AFCP takes a fully formed [`AfcpConfig`] at construction; there is no
//! file loading, no environment lookup, and no process-global state. All
//! duration fields (de)serialize through `humantime_serde`, so a config
//! document can say `"60s"` or `"10m"`.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::FederationError;
use crate::metrics::ROUTE_LATENCY_BUCKETS;

/// Top-level control plane configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AfcpConfig {
    /// Default deadline for a single routed request.
    #[serde(default = "default_route_timeout")]
    #[serde(with = "humantime_serde")]
    pub route_timeout: Duration,

    /// Default deadline for a consensus fan-out.
    #[serde(default = "default_consensus_timeout")]
    #[serde(with = "humantime_serde")]
    pub consensus_timeout: Duration,

    /// Per-client admission control parameters.
    #[serde(default)]
    pub admission: AdmissionConfig,

    /// Health monitor parameters.
    #[serde(default)]
    pub health: HealthConfig,

    /// Metrics exporter parameters.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

const fn default_route_timeout() -> Duration {
    Duration::from_secs(30)
}

const fn default_consensus_timeout() -> Duration {
    Duration::from_secs(20)
}

impl Default for AfcpConfig {
    fn default() -> Self {
        Self {
            route_timeout: default_route_timeout(),
            consensus_timeout: default_consensus_timeout(),
            admission: AdmissionConfig::default(),
            health: HealthConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl AfcpConfig {
    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`FederationError::InvalidInput`] when any section is
    /// out of range.
    pub fn validate(&self) -> Result<(), FederationError> {
        if self.route_timeout.is_zero() {
            return Err(FederationError::InvalidInput(
                "route_timeout must be positive".into(),
            ));
        }
        if self.consensus_timeout.is_zero() {
            return Err(FederationError::InvalidInput(
                "consensus_timeout must be positive".into(),
            ));
        }
        self.admission.validate()?;
        self.health.validate()?;
        self.metrics.validate()
    }
}

/// Admission controller parameters: a sliding fixed window combined with a
/// token bucket, applied per client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionConfig {
    /// Length of the sliding window.
    #[serde(default = "default_window_length")]
    #[serde(with = "humantime_serde")]
    pub window_length: Duration,

    /// Maximum admitted requests per window.
    #[serde(default = "default_max_requests")]
    pub max_requests: u32,

    /// Token bucket capacity; bursts up to this size are admitted instantly.
    #[serde(default = "default_burst")]
    pub burst: u32,
}

const fn default_window_length() -> Duration {
    Duration::from_secs(60)
}

const fn default_max_requests() -> u32 {
    100
}

const fn default_burst() -> u32 {
    20
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            window_length: default_window_length(),
            max_requests: default_max_requests(),
            burst: default_burst(),
        }
    }
}

impl AdmissionConfig {
    /// Validates admission parameters.
    ///
    /// # Errors
    ///
    /// Returns [`FederationError::InvalidInput`] on a zero window, zero
    /// request budget, or zero burst.
    pub fn validate(&self) -> Result<(), FederationError> {
        if self.window_length.is_zero() {
            return Err(FederationError::InvalidInput(
                "admission.window_length must be positive".into(),
            ));
        }
        if self.max_requests == 0 {
            return Err(FederationError::InvalidInput(
                "admission.max_requests must be positive".into(),
            ));
        }
        if self.burst == 0 {
            return Err(FederationError::InvalidInput(
                "admission.burst must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Health monitor parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Interval between monitor ticks.
    #[serde(default = "default_tick_interval")]
    #[serde(with = "humantime_serde")]
    pub tick_interval: Duration,

    /// Heartbeat age beyond which an agent is marked offline.
    #[serde(default = "default_offline_threshold")]
    #[serde(with = "humantime_serde")]
    pub offline_threshold: Duration,

    /// Multiplicative load decay applied each tick.
    #[serde(default = "default_load_decay_factor")]
    pub load_decay_factor: f64,

    /// Additive load decay subtracted each tick, after the multiplication.
    #[serde(default = "default_load_decay_step")]
    pub load_decay_step: f64,
}

const fn default_tick_interval() -> Duration {
    Duration::from_secs(10)
}

const fn default_offline_threshold() -> Duration {
    Duration::from_secs(60)
}

const fn default_load_decay_factor() -> f64 {
    0.98
}

const fn default_load_decay_step() -> f64 {
    0.01
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            tick_interval: default_tick_interval(),
            offline_threshold: default_offline_threshold(),
            load_decay_factor: default_load_decay_factor(),
            load_decay_step: default_load_decay_step(),
        }
    }
}

impl HealthConfig {
    /// Validates health monitor parameters.
    ///
    /// # Errors
    ///
    /// Returns [`FederationError::InvalidInput`] when the decay terms are
    /// non-finite or out of `[0, 1]`, or an interval is zero.
    pub fn validate(&self) -> Result<(), FederationError> {
        if self.tick_interval.is_zero() {
            return Err(FederationError::InvalidInput(
                "health.tick_interval must be positive".into(),
            ));
        }
        if self.offline_threshold.is_zero() {
            return Err(FederationError::InvalidInput(
                "health.offline_threshold must be positive".into(),
            ));
        }
        if !self.load_decay_factor.is_finite() || !(0.0..=1.0).contains(&self.load_decay_factor) {
            return Err(FederationError::InvalidInput(
                "health.load_decay_factor must be within [0, 1]".into(),
            ));
        }
        if !self.load_decay_step.is_finite() || !(0.0..=1.0).contains(&self.load_decay_step) {
            return Err(FederationError::InvalidInput(
                "health.load_decay_step must be within [0, 1]".into(),
            ));
        }
        Ok(())
    }
}

/// Metrics exporter parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Upper bounds of the route latency histogram buckets, in seconds.
    #[serde(default = "default_histogram_buckets")]
    pub histogram_buckets: Vec<f64>,
}

fn default_histogram_buckets() -> Vec<f64> {
    ROUTE_LATENCY_BUCKETS.to_vec()
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            histogram_buckets: default_histogram_buckets(),
        }
    }
}

impl MetricsConfig {
    /// Validates the histogram bucket layout.
    ///
    /// # Errors
    ///
    /// Returns [`FederationError::InvalidInput`] when buckets are empty,
    /// non-finite, or not strictly ascending.
    pub fn validate(&self) -> Result<(), FederationError> {
        if self.histogram_buckets.is_empty() {
            return Err(FederationError::InvalidInput(
                "metrics.histogram_buckets must not be empty".into(),
            ));
        }
        for pair in self.histogram_buckets.windows(2) {
            if !pair[0].is_finite() || !pair[1].is_finite() || pair[0] >= pair[1] {
                return Err(FederationError::InvalidInput(
                    "metrics.histogram_buckets must be finite and strictly ascending".into(),
                ));
            }
        }
        Ok(())
    }
}
