// Policy Compiler
//
// A policy owns the entries in hub-policy tagged with its marker. Apply
// deletes them all, primes the chain, then re-emits one jump per
// (target, rule) pair.

use ipnet::Ipv4Net;
use std::net::Ipv4Addr;
use tracing::{debug, info, warn};

use super::{Firewall, POLICY_CHAIN, Topology, host, policy_marker, prime_marker, rule_chain};
use crate::error::{Error, Result};
use crate::model::{Id, Policy};
use crate::traits::{FilterEntry, Target};

/// Jump for one (target, rule chain) pair of a policy
pub fn policy_entry(policy_id: Id, target: Ipv4Addr, chain: &str) -> FilterEntry {
    FilterEntry::new(Target::Jump(chain.to_string()))
        .destination(host(target))
        .comment(policy_marker(policy_id))
}

fn prime_entry(policy_id: Id) -> FilterEntry {
    FilterEntry::new(Target::Return)
        .destination(Ipv4Net::from(Ipv4Addr::BROADCAST))
        .comment(prime_marker(policy_id))
}

impl Firewall {
    /// Compile a stored policy into hub-policy
    ///
    /// # Returns
    ///
    /// Number of jump entries emitted.
    pub async fn apply_policy(&self, policy_id: Id) -> Result<usize> {
        let policy = self
            .store
            .policy(policy_id)
            .await?
            .ok_or_else(|| Error::not_found(format!("policy {}", policy_id)))?;
        let topology = Topology::load(self.store.as_ref()).await?;
        self.compile_policy(&policy, &topology).await
    }

    pub(crate) async fn compile_policy(&self, policy: &Policy, topology: &Topology) -> Result<usize> {
        self.ensure_chain(POLICY_CHAIN).await?;
        self.remove_marked(policy.id).await?;
        self.prime(policy.id).await?;

        let mut chains = Vec::new();
        for rule_id in &policy.rules {
            let chain = rule_chain(*rule_id);
            if !self.filter.chain_exists(&chain).await? {
                match self.store.rule(*rule_id).await? {
                    Some(rule) => {
                        self.compile_rule(&rule, topology).await?;
                    }
                    None => {
                        warn!("Policy {} references missing rule {}", policy.id, rule_id);
                        continue;
                    }
                }
            }
            chains.push(chain);
        }

        let targets = topology.policy_targets(policy);
        let mut emitted = 0;
        for target in &targets {
            for chain in &chains {
                self.filter
                    .insert_entry(POLICY_CHAIN, &policy_entry(policy.id, *target, chain))
                    .await?;
                emitted += 1;
            }
        }

        info!(
            "Applied policy '{}' ({}): {} targets x {} rules",
            policy.name,
            policy.id,
            targets.len(),
            chains.len()
        );
        Ok(emitted)
    }

    /// Remove every entry a policy emitted
    pub async fn delete_policy(&self, policy_id: Id) -> Result<usize> {
        if !self.filter.chain_exists(POLICY_CHAIN).await? {
            return Ok(0);
        }
        let removed = self.remove_marked(policy_id).await?;
        info!("Deleted policy {} ({} entries)", policy_id, removed);
        Ok(removed)
    }

    async fn remove_marked(&self, policy_id: Id) -> Result<usize> {
        let marker = policy_marker(policy_id);
        let marked: Vec<_> = self
            .filter
            .list_entries(POLICY_CHAIN)
            .await?
            .into_iter()
            .filter(|e| e.comment.as_deref() == Some(marker.as_str()))
            .collect();
        for entry in &marked {
            self.filter.delete_entry(POLICY_CHAIN, entry).await?;
        }
        Ok(marked.len())
    }

    /// Insert and remove a harmless entry so the next insertion lands
    ///
    /// The first insertion into a chain whose rules were just removed
    /// out-of-band can be lost; the priming entry absorbs that.
    async fn prime(&self, policy_id: Id) -> Result<()> {
        let dummy = prime_entry(policy_id);
        self.filter.insert_entry(POLICY_CHAIN, &dummy).await?;
        if self.filter.has_entry(POLICY_CHAIN, &dummy).await? {
            self.filter.delete_entry(POLICY_CHAIN, &dummy).await?;
        } else {
            debug!("Priming entry for policy {} was swallowed", policy_id);
        }
        Ok(())
    }
}
