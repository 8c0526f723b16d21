//! Packet-filter compiler
//!
//! Turns rules and policies into chains in the `filter` table.
//!
//! ## Layout
//!
//! ```text
//! FORWARD
//!   -s <overlay> -j hub-main
//!
//! hub-main
//!   -m conntrack --ctstate RELATED,ESTABLISHED -j ACCEPT
//!   -s <overlay> -j hub-policy
//!   -s <overlay> -j DROP
//!
//! hub-policy                                    (one entry per target x rule)
//!   -d <target>/32 -m comment --comment hub-policy-<pid> -j hub-rule-<rid>
//!
//! hub-rule-<rid>                                (one entry per source)
//!   -s <source>/32 [-p <proto> [-m multiport --dports <ports>]] -j ACCEPT
//! ```
//!
//! Traffic that is not accepted inside a rule chain returns to `hub-main`
//! and is dropped. Each rule owns exactly one chain and each policy owns
//! the entries carrying its comment marker, so compilations of different
//! entities never touch each other's state. Only the job queue worker may
//! call into this module.

mod policies;
mod rules;
mod sync;

use ipnet::Ipv4Net;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::debug;

use crate::error::Result;
use crate::model::{Id, Identity, IdentityKind, Policy, Rule};
use crate::pool::SubnetKey;
use crate::traits::{HubStore, PacketFilter};

pub use policies::policy_entry;
pub use rules::rule_entries;

/// Builtin chain holding the hub's single entry point
pub const ENTRY_CHAIN: &str = "FORWARD";

/// Skeleton chain evaluated for all overlay traffic
pub const MAIN_CHAIN: &str = "hub-main";

/// Skeleton chain routing destinations into rule chains
pub const POLICY_CHAIN: &str = "hub-policy";

/// Prefix of per-rule chains
pub const RULE_CHAIN_PREFIX: &str = "hub-rule-";

/// Chain owned by a rule
pub fn rule_chain(rule_id: Id) -> String {
    format!("{}{}", RULE_CHAIN_PREFIX, rule_id)
}

/// Comment carried by every entry a policy emits
pub fn policy_marker(policy_id: Id) -> String {
    format!("hub-policy-{}", policy_id)
}

/// Comment carried by a policy's priming entry
pub fn prime_marker(policy_id: Id) -> String {
    format!("hub-prime-{}", policy_id)
}

fn parse_rule_chain(chain: &str) -> Option<Id> {
    chain.strip_prefix(RULE_CHAIN_PREFIX)?.parse().ok()
}

/// Outcome of a full packet-filter synchronization
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub rules_applied: usize,
    pub policies_applied: usize,
    pub orphan_chains_removed: usize,
}

/// Identity lookup used while resolving sources and targets
#[derive(Debug, Clone, Default)]
pub struct Topology {
    identities: BTreeMap<Id, Identity>,
}

impl Topology {
    pub async fn load(store: &dyn HubStore) -> Result<Self> {
        Ok(Self::from_identities(store.identities().await?))
    }

    pub fn from_identities(identities: impl IntoIterator<Item = Identity>) -> Self {
        Self {
            identities: identities.into_iter().map(|i| (i.id, i)).collect(),
        }
    }

    fn explicit(&self, ids: &BTreeSet<Id>, kind: IdentityKind) -> Vec<Ipv4Addr> {
        ids.iter()
            .filter_map(|id| match self.identities.get(id) {
                Some(identity) if identity.kind == kind => Some(identity.ipv4_address),
                _ => {
                    debug!("Skipping unknown {} {}", kind, id);
                    None
                }
            })
            .collect()
    }

    fn members(&self, groups: &BTreeSet<Id>, kind: IdentityKind) -> Vec<Ipv4Addr> {
        self.identities
            .values()
            .filter(|i| i.kind == kind && !i.groups.is_disjoint(groups))
            .map(|i| i.ipv4_address)
            .collect()
    }

    /// Flattened source addresses of a rule
    pub fn rule_sources(&self, rule: &Rule) -> BTreeSet<Ipv4Addr> {
        let mut sources = BTreeSet::new();
        sources.extend(self.explicit(&rule.source_users, IdentityKind::UserDevice));
        sources.extend(self.members(&rule.source_groups, IdentityKind::UserDevice));
        sources.extend(self.explicit(&rule.source_servers, IdentityKind::Server));
        sources.extend(self.members(&rule.source_servergroups, IdentityKind::Server));
        sources
    }

    /// Flattened target addresses of a policy
    pub fn policy_targets(&self, policy: &Policy) -> BTreeSet<Ipv4Addr> {
        let mut targets = BTreeSet::new();
        targets.extend(self.explicit(&policy.target_servers, IdentityKind::Server));
        targets.extend(self.members(&policy.target_servergroups, IdentityKind::Server));
        targets
    }
}

/// Packet-filter compiler bound to a backend and a store
pub struct Firewall {
    filter: Arc<dyn PacketFilter>,
    store: Arc<dyn HubStore>,
    overlay: Ipv4Net,
}

impl Firewall {
    pub fn new(filter: Arc<dyn PacketFilter>, store: Arc<dyn HubStore>, key: SubnetKey) -> Self {
        Self {
            filter,
            store,
            overlay: key.overlay_subnet(),
        }
    }

    pub fn overlay(&self) -> Ipv4Net {
        self.overlay
    }

    /// Create `chain` unless present; returns whether it was created
    async fn ensure_chain(&self, chain: &str) -> Result<bool> {
        if self.filter.chain_exists(chain).await? {
            return Ok(false);
        }
        self.filter.create_chain(chain).await?;
        debug!("Created chain {}", chain);
        Ok(true)
    }
}

fn host(addr: Ipv4Addr) -> Ipv4Net {
    Ipv4Net::from(addr)
}
