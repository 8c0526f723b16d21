//! Inventory Diff Engine
//!
//! Partitions two `fqdn -> address` mappings into a [`Changeset`]. The
//! reconciler builds incremental changesets from connect/disconnect
//! transitions, and the full inventory sync diffs the live zone against
//! the desired zone so only the delta is pushed.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::Ipv4Addr;

/// Zone contents keyed by fully qualified name
pub type Inventory = BTreeMap<String, Ipv4Addr>;

/// Partition of a zone change
///
/// `new`, `updated` and `unchanged` carry the current value of a key,
/// `removed` carries the previous one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Changeset {
    #[serde(default)]
    pub new: Inventory,
    #[serde(default)]
    pub removed: Inventory,
    #[serde(default)]
    pub updated: Inventory,
    #[serde(default)]
    pub unchanged: Inventory,
}

impl Changeset {
    /// Whether applying this changeset would modify the zone
    pub fn has_changes(&self) -> bool {
        !(self.new.is_empty() && self.removed.is_empty() && self.updated.is_empty())
    }

    /// Number of records that would change
    pub fn change_count(&self) -> usize {
        self.new.len() + self.removed.len() + self.updated.len()
    }

    /// Apply this changeset to an inventory in place
    pub fn apply_to(&self, zone: &mut Inventory) {
        for fqdn in self.removed.keys() {
            zone.remove(fqdn);
        }
        for (fqdn, addr) in self.new.iter().chain(self.updated.iter()) {
            zone.insert(fqdn.clone(), *addr);
        }
    }
}

/// Compute the changeset that turns `previous` into `current`
///
/// Every key of `previous ∪ current` lands in exactly one bucket.
pub fn diff(previous: &Inventory, current: &Inventory) -> Changeset {
    let mut changes = Changeset::default();

    for (fqdn, addr) in current {
        match previous.get(fqdn) {
            None => {
                changes.new.insert(fqdn.clone(), *addr);
            }
            Some(old) if old != addr => {
                changes.updated.insert(fqdn.clone(), *addr);
            }
            Some(_) => {
                changes.unchanged.insert(fqdn.clone(), *addr);
            }
        }
    }

    for (fqdn, addr) in previous {
        if !current.contains_key(fqdn) {
            changes.removed.insert(fqdn.clone(), *addr);
        }
    }

    changes
}
