//! Agent registry and capability index.
//!
//! The registry owns the set of known agents and their live state: health,
//! load average, heartbeat age. Agents enter through [`Registry::upsert`]
//! (register-or-update), stay fresh through [`Registry::heartbeat`], pick up
//! load feedback from the dispatcher and quorum engine, age through the
//! health monitor's tick, and leave only through an explicit
//! [`Registry::remove`]; offline agents are retained because they may
//! recover.
//!
//! # Invariants
//!
//! - Agent id is the primary key; no two agents share one.
//! - Capability lists are sorted and deduplicated on every write so equality
//!   is stable.
//! - `load_avg` is within `[0, 1]` after any mutation; NaN and infinity are
//!   rejected at this boundary as programmer errors.
//! - The capability index is a pure function of the agent set; both live
//!   under one reader-writer lock, so no caller observes them out of sync.

mod index;


use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use self::index::CapabilityIndex;
use crate::clock::Clock;
use crate::error::{FederationError, FederationResult};

/// Load penalty added when a dispatch against an agent fails.
pub const FAILURE_LOAD_PENALTY: f64 = 0.2;

/// Tri-state agent liveness.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum AgentHealth {
    /// Agent is live and eligible for routing.
    #[default]
    Active,
    /// Agent has recently failed; still eligible unless the caller requires
    /// healthy candidates.
    Degraded,
    /// Agent's heartbeat has gone stale. Retained until removed.
    Offline,
}

impl std::fmt::Display for AgentHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Degraded => write!(f, "degraded"),
            Self::Offline => write!(f, "offline"),
        }
    }
}

/// A live agent record as held by the registry.
///
/// [`Registry::list`] and [`Registry::candidates`] return clones, so
/// snapshots are independent of later mutations.
#[derive(Debug, Clone)]
pub struct AgentRecord {
    /// Opaque unique id, stable across heartbeats.
    pub id: String,
    /// Opaque address handed to the transport; never parsed here.
    pub endpoint: String,
    /// Sorted, deduplicated capability strings (case-sensitive).
    pub capabilities: Vec<String>,
    /// Current liveness state.
    pub health: AgentHealth,
    /// Monotonic timestamp of the last register or heartbeat.
    pub last_heartbeat: Instant,
    /// Load average in `[0, 1]`.
    pub load_avg: f64,
    /// Wall-clock time of first registration.
    pub registered_at: DateTime<Utc>,
}

impl AgentRecord {
    /// Whether this agent advertises `capability`.
    #[must_use]
    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.binary_search_by(|c| c.as_str().cmp(capability)).is_ok()
    }
}

/// Input to [`Registry::upsert`].
///
/// Optional fields fall back to the existing record on update, or to
/// defaults on first registration (`Active` health, zero load, heartbeat at
/// the time of the call).
#[derive(Debug, Clone)]
pub struct AgentSpec {
    /// Agent id (must be non-empty).
    pub id: String,
    /// Transport endpoint.
    pub endpoint: String,
    /// Advertised capabilities; deduplicated and sorted on write.
    pub capabilities: Vec<String>,
    /// Health to record, if the caller supplies one.
    pub health: Option<AgentHealth>,
    /// Load average to record, if the caller supplies one (clamped).
    pub load_avg: Option<f64>,
    /// Heartbeat timestamp to record, if the caller supplies one.
    pub last_heartbeat: Option<Instant>,
}

impl AgentSpec {
    /// Starts building a spec for `id` reachable at `endpoint`.
    #[must_use]
    pub fn builder(id: impl Into<String>, endpoint: impl Into<String>) -> AgentSpecBuilder {
        AgentSpecBuilder {
            spec: Self {
                id: id.into(),
                endpoint: endpoint.into(),
                capabilities: Vec::new(),
                health: None,
                load_avg: None,
                last_heartbeat: None,
            },
        }
    }
}

/// Builder for [`AgentSpec`].
#[derive(Debug)]
pub struct AgentSpecBuilder {
    spec: AgentSpec,
}

impl AgentSpecBuilder {
    /// Adds one capability.
    #[must_use]
    pub fn capability(mut self, capability: impl Into<String>) -> Self {
        self.spec.capabilities.push(capability.into());
        self
    }

    /// Adds several capabilities.
    #[must_use]
    pub fn capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.spec
            .capabilities
            .extend(capabilities.into_iter().map(Into::into));
        self
    }

    /// Sets the initial health.
    #[must_use]
    pub fn health(mut self, health: AgentHealth) -> Self {
        self.spec.health = Some(health);
        self
    }

    /// Sets the initial load average.
    #[must_use]
    pub fn load_avg(mut self, load_avg: f64) -> Self {
        self.spec.load_avg = Some(load_avg);
        self
    }

    /// Sets an explicit heartbeat timestamp.
    #[must_use]
    pub fn last_heartbeat(mut self, at: Instant) -> Self {
        self.spec.last_heartbeat = Some(at);
        self
    }

    /// Finishes the spec.
    #[must_use]
    pub fn build(self) -> AgentSpec {
        self.spec
    }
}

/// Heartbeat side data: a small tagged update with exactly two optional
/// fields. Unknown fields are rejected at deserialization.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HeartbeatUpdate {
    /// New health, if supplied.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health: Option<AgentHealth>,
    /// New load average, if supplied (clamped on write).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_avg: Option<f64>,
}

/// Filter for [`Registry::list`]: a conjunction of required capabilities
/// (the agent must advertise all of them) and an optional required health.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListFilter {
    /// Capabilities the agent must all advertise.
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Exact health the agent must have.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health: Option<AgentHealth>,
}

/// Outcome of one health monitor tick, for logging and metrics.
#[derive(Debug, Clone, Default)]
pub struct TickReport {
    /// Agents in `Active` state after the tick.
    pub active: usize,
    /// Agents in `Degraded` state after the tick.
    pub degraded: usize,
    /// Agents in `Offline` state after the tick.
    pub offline: usize,
    /// Agents that transitioned to `Offline` during this tick.
    pub transitioned_offline: usize,
    /// Post-decay load averages, for the tick load histogram.
    pub loads: Vec<f64>,
}

/// Read-only registry projection consumed by the metrics exporter.
#[derive(Debug, Clone, Default)]
pub struct RegistrySnapshot {
    /// Agents in `Active` state.
    pub active: usize,
    /// Agents in `Degraded` state.
    pub degraded: usize,
    /// Agents in `Offline` state.
    pub offline: usize,
    /// Distinct capabilities advertised by at least one agent.
    pub capability_count: usize,
    /// `(agent id, load average)` pairs, sorted by id.
    pub loads: Vec<(String, f64)>,
}

#[derive(Debug, Default)]
struct RegistryState {
    agents: BTreeMap<String, AgentRecord>,
    index: CapabilityIndex,
}

/// The agent registry.
///
/// One reader-writer lock guards the agent table and the capability index
/// together; every mutation updates both before the lock is released.
#[derive(Debug)]
pub struct Registry {
    state: RwLock<RegistryState>,
    clock: Arc<dyn Clock>,
}

impl Registry {
    /// Creates an empty registry on the given clock.
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: RwLock::new(RegistryState::default()),
            clock,
        }
    }

    /// Registers a new agent or updates an existing one by id.
    ///
    /// Capabilities are sorted and deduplicated, the load average is clamped
    /// to `[0, 1]`, and fields the spec leaves unset fall back to the
    /// existing record. An existing heartbeat timestamp is preserved unless
    /// the spec carries an explicit one.
    ///
    /// # Errors
    ///
    /// Returns [`FederationError::InvalidInput`] when the id is empty or the
    /// supplied load average is NaN or infinite.
    pub fn upsert(&self, spec: AgentSpec) -> FederationResult<()> {
        if spec.id.is_empty() {
            return Err(FederationError::InvalidInput(
                "agent id must not be empty".into(),
            ));
        }
        if let Some(load) = spec.load_avg {
            if !load.is_finite() {
                return Err(FederationError::InvalidInput(format!(
                    "load_avg for agent '{}' must be finite",
                    spec.id
                )));
            }
        }

        let mut capabilities = spec.capabilities;
        capabilities.sort_unstable();
        capabilities.dedup();

        let now = self.clock.now();
        let mut guard = self.write_lock();
        let RegistryState { agents, index } = &mut *guard;

        match agents.get_mut(&spec.id) {
            Some(existing) => {
                let old_capabilities = std::mem::replace(&mut existing.capabilities, capabilities);
                existing.endpoint = spec.endpoint;
                if let Some(health) = spec.health {
                    existing.health = health;
                }
                if let Some(load) = spec.load_avg {
                    existing.load_avg = clamp_load(load);
                }
                if let Some(at) = spec.last_heartbeat {
                    existing.last_heartbeat = at;
                }
                index.update(&spec.id, &old_capabilities, &existing.capabilities);
                tracing::debug!(agent_id = %spec.id, "agent updated");
            },
            None => {
                let record = AgentRecord {
                    id: spec.id.clone(),
                    endpoint: spec.endpoint,
                    capabilities: capabilities.clone(),
                    health: spec.health.unwrap_or_default(),
                    last_heartbeat: spec.last_heartbeat.unwrap_or(now),
                    load_avg: clamp_load(spec.load_avg.unwrap_or(0.0)),
                    registered_at: Utc::now(),
                };
                index.insert(&spec.id, &capabilities);
                agents.insert(spec.id.clone(), record);
                tracing::debug!(agent_id = %spec.id, "agent registered");
            },
        }
        Ok(())
    }

    /// Removes an agent, returning whether it existed.
    pub fn remove(&self, id: &str) -> bool {
        let mut state = self.write_lock();
        let Some(record) = state.agents.remove(id) else {
            return false;
        };
        state.index.remove_agent(id, &record.capabilities);
        tracing::debug!(agent_id = %id, "agent removed");
        true
    }

    /// Records a heartbeat for `id`, optionally overwriting health and load.
    ///
    /// Unknown ids are a no-op; the return value reports whether the
    /// heartbeat was applied.
    ///
    /// # Errors
    ///
    /// Returns [`FederationError::InvalidInput`] when the update carries a
    /// NaN or infinite load average.
    pub fn heartbeat(&self, id: &str, update: &HeartbeatUpdate) -> FederationResult<bool> {
        if let Some(load) = update.load_avg {
            if !load.is_finite() {
                return Err(FederationError::InvalidInput(format!(
                    "load_avg for agent '{id}' must be finite"
                )));
            }
        }

        let now = self.clock.now();
        let mut state = self.write_lock();
        let Some(record) = state.agents.get_mut(id) else {
            return Ok(false);
        };
        record.last_heartbeat = now;
        if let Some(health) = update.health {
            record.health = health;
        }
        if let Some(load) = update.load_avg {
            record.load_avg = clamp_load(load);
        }
        Ok(true)
    }

    /// Returns an id-sorted snapshot of agents matching `filter`.
    #[must_use]
    pub fn list(&self, filter: &ListFilter) -> Vec<AgentRecord> {
        let state = self.read_lock();
        state
            .agents
            .values()
            .filter(|record| {
                filter
                    .capabilities
                    .iter()
                    .all(|c| record.has_capability(c))
                    && filter.health.is_none_or(|h| record.health == h)
            })
            .cloned()
            .collect()
    }

    /// Returns one agent by id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<AgentRecord> {
        self.read_lock().agents.get(id).cloned()
    }

    /// Returns the id-sorted candidate set for `capability`.
    ///
    /// With `require_healthy`, only `Active` agents qualify.
    #[must_use]
    pub fn candidates(&self, capability: &str, require_healthy: bool) -> Vec<AgentRecord> {
        let state = self.read_lock();
        let Some(ids) = state.index.agents_for(capability) else {
            return Vec::new();
        };
        ids.iter()
            .filter_map(|id| state.agents.get(id))
            .filter(|record| !require_healthy || record.health == AgentHealth::Active)
            .cloned()
            .collect()
    }

    /// Applies success feedback: multiplies the agent's load by `decay`.
    ///
    /// Unknown ids are ignored (the agent may have been removed while the
    /// request was in flight).
    pub fn record_success(&self, id: &str, decay: f64) {
        let mut state = self.write_lock();
        if let Some(record) = state.agents.get_mut(id) {
            record.load_avg = clamp_load(record.load_avg * decay);
            tracing::debug!(agent_id = %id, load_avg = record.load_avg, "success feedback");
        }
    }

    /// Applies failure feedback: adds [`FAILURE_LOAD_PENALTY`] to the load
    /// and degrades an `Active` agent.
    ///
    /// An `Offline` agent is never upgraded to `Degraded`.
    pub fn record_failure(&self, id: &str) {
        let mut state = self.write_lock();
        if let Some(record) = state.agents.get_mut(id) {
            record.load_avg = clamp_load(record.load_avg + FAILURE_LOAD_PENALTY);
            if record.health == AgentHealth::Active {
                record.health = AgentHealth::Degraded;
            }
            tracing::debug!(
                agent_id = %id,
                load_avg = record.load_avg,
                health = %record.health,
                "failure feedback"
            );
        }
    }

    /// One health monitor tick under a single write lock: ages stale
    /// heartbeats to `Offline` and applies gentle load decay.
    pub fn tick(
        &self,
        offline_threshold: Duration,
        decay_factor: f64,
        decay_step: f64,
    ) -> TickReport {
        let now = self.clock.now();
        let mut state = self.write_lock();
        let mut report = TickReport::default();

        for record in state.agents.values_mut() {
            if record.health != AgentHealth::Offline
                && now.saturating_duration_since(record.last_heartbeat) > offline_threshold
            {
                record.health = AgentHealth::Offline;
                report.transitioned_offline += 1;
                tracing::debug!(agent_id = %record.id, "heartbeat stale, agent offline");
            }
            record.load_avg = clamp_load(record.load_avg.mul_add(decay_factor, -decay_step));

            match record.health {
                AgentHealth::Active => report.active += 1,
                AgentHealth::Degraded => report.degraded += 1,
                AgentHealth::Offline => report.offline += 1,
            }
            report.loads.push(record.load_avg);
        }
        report
    }

    /// Read-only projection for the metrics exporter.
    #[must_use]
    pub fn observe(&self) -> RegistrySnapshot {
        let state = self.read_lock();
        let mut snapshot = RegistrySnapshot {
            capability_count: state.index.capability_count(),
            ..RegistrySnapshot::default()
        };
        for record in state.agents.values() {
            match record.health {
                AgentHealth::Active => snapshot.active += 1,
                AgentHealth::Degraded => snapshot.degraded += 1,
                AgentHealth::Offline => snapshot.offline += 1,
            }
            snapshot.loads.push((record.id.clone(), record.load_avg));
        }
        snapshot
    }

    /// Number of registered agents.
    #[must_use]
    pub fn len(&self) -> usize {
        self.read_lock().agents.len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read_lock(&self) -> std::sync::RwLockReadGuard<'_, RegistryState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_lock(&self) -> std::sync::RwLockWriteGuard<'_, RegistryState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Clamps a finite load value into `[0, 1]`.
fn clamp_load(value: f64) -> f64 {
    value.clamp(0.0, 1.0)
}
