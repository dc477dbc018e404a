//! OpenMetrics exporter.
//!
//! The exporter owns the traffic counters and latency histograms and renders
//! them, together with a read-only registry projection, as an OpenMetrics
//! text payload terminated by `# EOF`. Counters are recorded behind one
//! short-lived lock; scraping takes a read lock just long enough to format a
//! consistent snapshot.
//!
//! # Families
//!
//! | Family | Type | Labels |
//! |--------|------|--------|
//! | `afcp_agents_total` | gauge | `health` |
//! | `afcp_capabilities_total` | gauge | |
//! | `afcp_route_requests_total` | counter | `capability`, `outcome` |
//! | `afcp_route_latency_seconds` | histogram | `capability` |
//! | `afcp_consensus_total` | counter | `capability`, `decided` |
//! | `afcp_admission_rejections_total` | counter | `reason` |
//! | `afcp_load_avg` | gauge | `agent` |
//! | `afcp_monitor_load_avg` | histogram | |
//!
//! Label values are escaped (`\` → `\\`, `"` → `\"`, newline → `\n`, tab →
//! `\t`) and bounded in length at a UTF-8 character boundary.

use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};

use crate::admission::RejectReason;
use crate::registry::{RegistrySnapshot, TickReport};

/// Route latency histogram bucket upper bounds, in seconds.
pub const ROUTE_LATENCY_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Monitor tick load histogram bucket upper bounds.
pub const MONITOR_LOAD_BUCKETS: &[f64] = &[0.1, 0.25, 0.5, 0.75, 0.9];

/// Maximum byte length of a label value before truncation.
pub const MAX_LABEL_VALUE_LEN: usize = 128;

/// Terminal outcome of a route call, as counted by
/// `afcp_route_requests_total`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RouteOutcome {
    /// Transport returned bytes before the deadline.
    Ok,
    /// Admission rejected the request.
    RateLimited,
    /// Candidate set was empty after filters.
    NoAgent,
    /// Deadline elapsed before a response.
    Timeout,
    /// Transport reported a failure.
    AgentError,
    /// Caller cancelled before completion.
    Cancelled,
}

impl RouteOutcome {
    /// Metrics label value for this outcome.
    #[must_use]
    pub const fn as_label(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::RateLimited => "rate_limited",
            Self::NoAgent => "no_agent",
            Self::Timeout => "timeout",
            Self::AgentError => "agent_error",
            Self::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone)]
struct Histogram {
    buckets: Vec<f64>,
    counts: Vec<u64>,
    sum: f64,
    count: u64,
}

impl Histogram {
    fn new(buckets: &[f64]) -> Self {
        Self {
            buckets: buckets.to_vec(),
            counts: vec![0; buckets.len()],
            sum: 0.0,
            count: 0,
        }
    }

    fn observe(&mut self, value: f64) {
        for (bound, count) in self.buckets.iter().zip(self.counts.iter_mut()) {
            if value <= *bound {
                *count += 1;
            }
        }
        self.sum += value;
        self.count += 1;
    }
}

#[derive(Debug)]
struct MetricsState {
    route_requests: BTreeMap<(String, RouteOutcome), u64>,
    route_latency: BTreeMap<String, Histogram>,
    consensus: BTreeMap<(String, bool), u64>,
    admission_rejections: BTreeMap<RejectReason, u64>,
    monitor_load: Histogram,
}

/// Counter and histogram store for the control plane.
#[derive(Debug)]
pub struct AfcpMetrics {
    state: RwLock<MetricsState>,
    latency_buckets: Vec<f64>,
}

impl AfcpMetrics {
    /// Creates a metrics store with the given latency bucket layout.
    #[must_use]
    pub fn new(latency_buckets: &[f64]) -> Self {
        Self {
            state: RwLock::new(MetricsState {
                route_requests: BTreeMap::new(),
                route_latency: BTreeMap::new(),
                consensus: BTreeMap::new(),
                admission_rejections: BTreeMap::new(),
                monitor_load: Histogram::new(MONITOR_LOAD_BUCKETS),
            }),
            latency_buckets: latency_buckets.to_vec(),
        }
    }

    /// Counts a route call, observing its latency when one was measured.
    pub fn record_route(&self, capability: &str, outcome: RouteOutcome, latency_secs: Option<f64>) {
        let capability = truncate_label(capability).to_string();
        let mut state = self.write_lock();
        *state
            .route_requests
            .entry((capability.clone(), outcome))
            .or_insert(0) += 1;
        if let Some(latency) = latency_secs {
            let buckets = &self.latency_buckets;
            state
                .route_latency
                .entry(capability)
                .or_insert_with(|| Histogram::new(buckets))
                .observe(latency);
        }
    }

    /// Counts a consensus call by its decision.
    pub fn record_consensus(&self, capability: &str, decided: bool) {
        let capability = truncate_label(capability).to_string();
        let mut state = self.write_lock();
        *state.consensus.entry((capability, decided)).or_insert(0) += 1;
    }

    /// Counts an admission rejection by arm.
    pub fn record_rejection(&self, reason: RejectReason) {
        let mut state = self.write_lock();
        *state.admission_rejections.entry(reason).or_insert(0) += 1;
    }

    /// Records a health monitor tick's post-decay load distribution.
    pub fn record_tick(&self, report: &TickReport) {
        let mut state = self.write_lock();
        for load in &report.loads {
            state.monitor_load.observe(*load);
        }
    }

    /// Returns a counter value, for tests.
    #[must_use]
    pub fn route_request_count(&self, capability: &str, outcome: RouteOutcome) -> u64 {
        let state = self.read_lock();
        state
            .route_requests
            .get(&(capability.to_string(), outcome))
            .copied()
            .unwrap_or(0)
    }

    /// Returns a consensus counter value, for tests.
    #[must_use]
    pub fn consensus_count(&self, capability: &str, decided: bool) -> u64 {
        let state = self.read_lock();
        state
            .consensus
            .get(&(capability.to_string(), decided))
            .copied()
            .unwrap_or(0)
    }

    /// Renders the OpenMetrics payload from the counter store and a registry
    /// projection.
    #[must_use]
    pub fn render(&self, snapshot: &RegistrySnapshot) -> String {
        let state = self.read_lock();
        let mut out = String::with_capacity(1024);

        out.push_str("# HELP afcp_agents_total Registered agents by health state.\n");
        out.push_str("# TYPE afcp_agents_total gauge\n");
        for (health, count) in [
            ("active", snapshot.active),
            ("degraded", snapshot.degraded),
            ("offline", snapshot.offline),
        ] {
            out.push_str(&format!("afcp_agents_total{{health=\"{health}\"}} {count}\n"));
        }

        out.push_str("# HELP afcp_capabilities_total Distinct advertised capabilities.\n");
        out.push_str("# TYPE afcp_capabilities_total gauge\n");
        out.push_str(&format!(
            "afcp_capabilities_total {}\n",
            snapshot.capability_count
        ));

        out.push_str("# HELP afcp_route_requests_total Route calls by capability and outcome.\n");
        out.push_str("# TYPE afcp_route_requests_total counter\n");
        for ((capability, outcome), count) in &state.route_requests {
            out.push_str(&format!(
                "afcp_route_requests_total{{capability=\"{}\",outcome=\"{}\"}} {count}\n",
                escape_label_value(capability),
                outcome.as_label(),
            ));
        }

        out.push_str("# HELP afcp_route_latency_seconds Route latency by capability.\n");
        out.push_str("# TYPE afcp_route_latency_seconds histogram\n");
        for (capability, histogram) in &state.route_latency {
            let capability = escape_label_value(capability);
            for (bound, count) in histogram.buckets.iter().zip(&histogram.counts) {
                out.push_str(&format!(
                    "afcp_route_latency_seconds_bucket{{capability=\"{capability}\",le=\"{bound}\"}} {count}\n",
                ));
            }
            out.push_str(&format!(
                "afcp_route_latency_seconds_bucket{{capability=\"{capability}\",le=\"+Inf\"}} {}\n",
                histogram.count,
            ));
            out.push_str(&format!(
                "afcp_route_latency_seconds_sum{{capability=\"{capability}\"}} {}\n",
                histogram.sum,
            ));
            out.push_str(&format!(
                "afcp_route_latency_seconds_count{{capability=\"{capability}\"}} {}\n",
                histogram.count,
            ));
        }

        out.push_str("# HELP afcp_consensus_total Consensus calls by capability and decision.\n");
        out.push_str("# TYPE afcp_consensus_total counter\n");
        for ((capability, decided), count) in &state.consensus {
            out.push_str(&format!(
                "afcp_consensus_total{{capability=\"{}\",decided=\"{decided}\"}} {count}\n",
                escape_label_value(capability),
            ));
        }

        out.push_str("# HELP afcp_admission_rejections_total Admission rejections by arm.\n");
        out.push_str("# TYPE afcp_admission_rejections_total counter\n");
        for (reason, count) in &state.admission_rejections {
            out.push_str(&format!(
                "afcp_admission_rejections_total{{reason=\"{}\"}} {count}\n",
                reason.as_label(),
            ));
        }

        out.push_str("# HELP afcp_load_avg Current load average per agent.\n");
        out.push_str("# TYPE afcp_load_avg gauge\n");
        for (agent, load) in &snapshot.loads {
            out.push_str(&format!(
                "afcp_load_avg{{agent=\"{}\"}} {load}\n",
                escape_label_value(truncate_label(agent)),
            ));
        }

        out.push_str("# HELP afcp_monitor_load_avg Post-decay load distribution per monitor tick.\n");
        out.push_str("# TYPE afcp_monitor_load_avg histogram\n");
        let histogram = &state.monitor_load;
        for (bound, count) in histogram.buckets.iter().zip(&histogram.counts) {
            out.push_str(&format!(
                "afcp_monitor_load_avg_bucket{{le=\"{bound}\"}} {count}\n",
            ));
        }
        out.push_str(&format!(
            "afcp_monitor_load_avg_bucket{{le=\"+Inf\"}} {}\n",
            histogram.count,
        ));
        out.push_str(&format!("afcp_monitor_load_avg_sum {}\n", histogram.sum));
        out.push_str(&format!("afcp_monitor_load_avg_count {}\n", histogram.count));

        out.push_str("# EOF\n");
        out
    }

    fn read_lock(&self) -> std::sync::RwLockReadGuard<'_, MetricsState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_lock(&self) -> std::sync::RwLockWriteGuard<'_, MetricsState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Escapes a label value per the OpenMetrics text format.
#[must_use]
pub fn escape_label_value(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => escaped.push_str("\\\\"),
            '"' => escaped.push_str("\\\""),
            '\n' => escaped.push_str("\\n"),
            '\t' => escaped.push_str("\\t"),
            other => escaped.push(other),
        }
    }
    escaped
}

/// Bounds a label value to [`MAX_LABEL_VALUE_LEN`] bytes at a UTF-8
/// character boundary.
#[must_use]
pub fn truncate_label(value: &str) -> &str {
    if value.len() <= MAX_LABEL_VALUE_LEN {
        value
    } else {
        let end = value
            .char_indices()
            .map(|(i, _)| i)
            .take_while(|&i| i <= MAX_LABEL_VALUE_LEN)
            .last()
            .unwrap_or(0);
        &value[..end]
    }
}
