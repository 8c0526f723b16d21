// Rule Compiler
//
// One chain per rule, rebuilt from scratch on every apply.

use tracing::{debug, info};

use super::{Firewall, POLICY_CHAIN, Topology, host, rule_chain};
use crate::error::{Error, Result};
use crate::model::{Id, Rule};
use crate::traits::{FilterEntry, Target};

/// Permit entries of a rule chain, in order
///
/// One entry per (source, multiport chunk); protocol ANY and ICMP emit a
/// single entry per source.
pub fn rule_entries(rule: &Rule, topology: &Topology) -> Vec<FilterEntry> {
    let chunks = rule.destination_ports.multiport_chunks();
    let mut entries = Vec::new();

    for source in topology.rule_sources(rule) {
        let base = FilterEntry::new(Target::Accept)
            .source(host(source))
            .protocol(rule.destination_protocol);

        if rule.destination_protocol.requires_ports() {
            entries.extend(chunks.iter().map(|ports| base.clone().dports(ports.clone())));
        } else {
            entries.push(base);
        }
    }
    entries
}

impl Firewall {
    /// Compile a stored rule into its chain
    ///
    /// # Returns
    ///
    /// Number of entries now in the rule's chain.
    pub async fn apply_rule(&self, rule_id: Id) -> Result<usize> {
        let rule = self
            .store
            .rule(rule_id)
            .await?
            .ok_or_else(|| Error::not_found(format!("rule {}", rule_id)))?;
        let topology = Topology::load(self.store.as_ref()).await?;
        self.compile_rule(&rule, &topology).await
    }

    pub(crate) async fn compile_rule(&self, rule: &Rule, topology: &Topology) -> Result<usize> {
        let chain = rule_chain(rule.id);
        if !self.ensure_chain(&chain).await? {
            self.filter.flush_chain(&chain).await?;
        }

        let entries = rule_entries(rule, topology);
        for entry in &entries {
            self.filter.append_entry(&chain, entry).await?;
        }

        info!(
            "Applied rule '{}' ({}): {} entries in {}",
            rule.name,
            rule.id,
            entries.len(),
            chain
        );
        Ok(entries.len())
    }

    /// Remove a rule's chain and every policy jump into it
    pub async fn delete_rule(&self, rule_id: Id) -> Result<()> {
        let chain = rule_chain(rule_id);

        if self.filter.chain_exists(POLICY_CHAIN).await? {
            let jump = Target::Jump(chain.clone());
            let referencing: Vec<_> = self
                .filter
                .list_entries(POLICY_CHAIN)
                .await?
                .into_iter()
                .filter(|e| e.target == jump)
                .collect();
            for entry in &referencing {
                self.filter.delete_entry(POLICY_CHAIN, entry).await?;
            }
            if !referencing.is_empty() {
                debug!("Removed {} policy jumps into {}", referencing.len(), chain);
            }
        }

        if !self.filter.chain_exists(&chain).await? {
            debug!("Chain {} already absent", chain);
            return Ok(());
        }
        self.filter.flush_chain(&chain).await?;
        self.filter.delete_chain(&chain).await?;
        info!("Deleted rule chain {}", chain);
        Ok(())
    }
}
