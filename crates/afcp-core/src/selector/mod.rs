//! Routing policy: picks one agent from a candidate set.
//!
//! Selection is a pure function over an id-sorted candidate snapshot (as
//! produced by [`Registry::candidates`]); it holds no state, mutates
//! nothing, and never consults admission; that ordering is the
//! dispatcher's concern.
//!
//! The paths are tried in a fixed, testable order:
//!
//! 1. **Sticky**: a session key maps to `candidates[stable_hash(key) mod N]`
//!    so the same key lands on the same agent until the candidate set
//!    changes.
//! 2. **Preference**: the intersection of the candidate set with the
//!    caller's preferred ids, lowest load first.
//! 3. **Least load**: lowest load across all candidates.
//!
//! Ties always break by ascending agent id.
//!
//! [`Registry::candidates`]: crate::registry::Registry::candidates

use serde::{Deserialize, Serialize};

use crate::hash::stable_hash;
use crate::registry::AgentRecord;

/// Options steering agent selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectOptions {
    /// Restrict candidates to `Active` agents. Defaults to `true`.
    #[serde(default = "default_require_healthy")]
    pub require_healthy: bool,

    /// Ordered set of preferred agent ids.
    #[serde(default)]
    pub prefer_agents: Vec<String>,

    /// Opaque session key for sticky routing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sticky_session_key: Option<String>,
}

const fn default_require_healthy() -> bool {
    true
}

impl Default for SelectOptions {
    fn default() -> Self {
        Self {
            require_healthy: default_require_healthy(),
            prefer_agents: Vec::new(),
            sticky_session_key: None,
        }
    }
}

/// Picks one agent from `candidates` according to `opts`.
///
/// `candidates` must already be filtered by capability (and health, when
/// required) and sorted by ascending id; [`Registry::candidates`] produces
/// exactly that shape. Returns `None` on an empty set.
///
/// [`Registry::candidates`]: crate::registry::Registry::candidates
#[must_use]
pub fn select<'a>(candidates: &'a [AgentRecord], opts: &SelectOptions) -> Option<&'a AgentRecord> {
    if candidates.is_empty() {
        return None;
    }

    if let Some(key) = &opts.sticky_session_key {
        let idx = stable_hash(key) as usize % candidates.len();
        let chosen = &candidates[idx];
        tracing::debug!(agent_id = %chosen.id, "sticky selection");
        return Some(chosen);
    }

    if !opts.prefer_agents.is_empty() {
        let preferred = candidates
            .iter()
            .filter(|candidate| opts.prefer_agents.iter().any(|p| p == &candidate.id))
            .min_by(least_load);
        if let Some(chosen) = preferred {
            tracing::debug!(agent_id = %chosen.id, "preference selection");
            return Some(chosen);
        }
    }

    let chosen = candidates.iter().min_by(least_load);
    if let Some(chosen) = chosen {
        tracing::debug!(agent_id = %chosen.id, load_avg = chosen.load_avg, "least-load selection");
    }
    chosen
}

fn least_load(a: &&AgentRecord, b: &&AgentRecord) -> std::cmp::Ordering {
    a.load_avg
        .total_cmp(&b.load_avg)
        .then_with(|| a.id.cmp(&b.id))
}
