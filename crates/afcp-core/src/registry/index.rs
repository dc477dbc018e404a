//! Reverse capability index.
//!
//! Maps each capability string to the set of agent ids advertising it. The
//! index is owned by the registry and mutated under the same write lock as
//! the agent table, so it is a pure function of the current agent set at
//! every external observation point.

use std::collections::{BTreeSet, HashMap};

/// Capability → agent-id reverse index.
#[derive(Debug, Default)]
pub(crate) struct CapabilityIndex {
    by_capability: HashMap<String, BTreeSet<String>>,
}

impl CapabilityIndex {
    /// Adds `id` under every capability in `capabilities`.
    pub(crate) fn insert(&mut self, id: &str, capabilities: &[String]) {
        for capability in capabilities {
            self.by_capability
                .entry(capability.clone())
                .or_default()
                .insert(id.to_string());
        }
    }

    /// Applies the symmetric difference between `old` and `new` capability
    /// sets for `id`.
    ///
    /// Both slices must be sorted and deduplicated (the registry normalizes
    /// them on write), which lets the difference walk both in one pass.
    pub(crate) fn update(&mut self, id: &str, old: &[String], new: &[String]) {
        let mut i = 0;
        let mut j = 0;
        while i < old.len() || j < new.len() {
            match (old.get(i), new.get(j)) {
                (Some(o), Some(n)) if o == n => {
                    i += 1;
                    j += 1;
                },
                (Some(o), Some(n)) if o < n => {
                    self.remove_entry(o, id);
                    i += 1;
                },
                (Some(_), Some(n)) => {
                    self.by_capability
                        .entry(n.clone())
                        .or_default()
                        .insert(id.to_string());
                    j += 1;
                },
                (Some(o), None) => {
                    self.remove_entry(o, id);
                    i += 1;
                },
                (None, Some(n)) => {
                    self.by_capability
                        .entry(n.clone())
                        .or_default()
                        .insert(id.to_string());
                    j += 1;
                },
                (None, None) => unreachable!(),
            }
        }
    }

    /// Removes `id` from every capability in `capabilities`.
    pub(crate) fn remove_agent(&mut self, id: &str, capabilities: &[String]) {
        for capability in capabilities {
            self.remove_entry(capability, id);
        }
    }

    /// Returns the id set for `capability`, if any agent advertises it.
    pub(crate) fn agents_for(&self, capability: &str) -> Option<&BTreeSet<String>> {
        self.by_capability.get(capability)
    }

    /// Number of distinct capabilities advertised by at least one agent.
    pub(crate) fn capability_count(&self) -> usize {
        self.by_capability.len()
    }

    fn remove_entry(&mut self, capability: &str, id: &str) {
        if let Some(ids) = self.by_capability.get_mut(capability) {
            ids.remove(id);
            // Empty sets are dropped so capability_count only counts
            // capabilities that are actually advertised.
            if ids.is_empty() {
                self.by_capability.remove(capability);
            }
        }
    }
}
