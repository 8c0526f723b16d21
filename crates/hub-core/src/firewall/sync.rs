// Packet-Filter Sync
//
// Skeleton management and disaster recovery: `init` builds the entry
// jump and the two skeleton chains, `full_sync` reclaims orphaned rule
// chains and recompiles everything, `teardown` unwinds it again.

use std::collections::BTreeSet;
use tracing::{info, warn};

use super::{
    ENTRY_CHAIN, Firewall, MAIN_CHAIN, POLICY_CHAIN, RULE_CHAIN_PREFIX, SyncReport, Topology,
    parse_rule_chain,
};
use crate::error::Result;
use crate::model::Id;
use crate::traits::{FilterEntry, Target};

const STATEFUL_STATES: &str = "RELATED,ESTABLISHED";

impl Firewall {
    /// `FORWARD -s <overlay> -j hub-main`
    pub fn entry_jump(&self) -> FilterEntry {
        FilterEntry::new(Target::Jump(MAIN_CHAIN.to_string())).source(self.overlay)
    }

    /// Contents of hub-main, in order
    pub fn main_entries(&self) -> Vec<FilterEntry> {
        vec![
            FilterEntry::new(Target::Accept).ctstate(STATEFUL_STATES),
            FilterEntry::new(Target::Jump(POLICY_CHAIN.to_string())).source(self.overlay),
            FilterEntry::new(Target::Drop).source(self.overlay),
        ]
    }

    /// Establish the skeleton; unless `core_only`, also run [`Firewall::full_sync`]
    pub async fn init(&self, core_only: bool) -> Result<Option<SyncReport>> {
        // hub-main jumps into hub-policy, so hub-policy must exist first
        self.ensure_chain(POLICY_CHAIN).await?;
        self.ensure_chain(MAIN_CHAIN).await?;

        self.filter.flush_chain(MAIN_CHAIN).await?;
        for entry in self.main_entries() {
            self.filter.append_entry(MAIN_CHAIN, &entry).await?;
        }

        let jump = self.entry_jump();
        let present = self
            .filter
            .list_entries(ENTRY_CHAIN)
            .await?
            .iter()
            .filter(|e| **e == jump)
            .count();
        match present {
            0 => self.filter.insert_entry(ENTRY_CHAIN, &jump).await?,
            1 => {}
            n => {
                warn!("Found {} entry jumps into {}, removing duplicates", n, MAIN_CHAIN);
                for _ in 1..n {
                    self.filter.delete_entry(ENTRY_CHAIN, &jump).await?;
                }
            }
        }
        info!("Packet-filter skeleton ready for {}", self.overlay);

        if core_only {
            return Ok(None);
        }
        self.full_sync().await.map(Some)
    }

    /// Reclaim orphaned rule chains and recompile every rule and policy
    pub async fn full_sync(&self) -> Result<SyncReport> {
        let rules = self.store.rules().await?;
        let policies = self.store.policies().await?;
        let topology = Topology::load(self.store.as_ref()).await?;

        // drop every policy jump so rule chains are unreferenced
        if !self.ensure_chain(POLICY_CHAIN).await? {
            self.filter.flush_chain(POLICY_CHAIN).await?;
        }

        let live: BTreeSet<Id> = rules.iter().map(|r| r.id).collect();
        let mut report = SyncReport {
            orphan_chains_removed: self.remove_rule_chains(&live).await?,
            ..SyncReport::default()
        };

        for rule in &rules {
            self.compile_rule(rule, &topology).await?;
            report.rules_applied += 1;
        }
        for policy in &policies {
            self.compile_policy(policy, &topology).await?;
            report.policies_applied += 1;
        }

        info!(
            "Full sync complete: {} rules, {} policies, {} orphan chains removed",
            report.rules_applied, report.policies_applied, report.orphan_chains_removed
        );
        Ok(report)
    }

    /// Flush back to the skeleton, or with `full` remove the hub entirely
    pub async fn teardown(&self, full: bool) -> Result<()> {
        if self.filter.chain_exists(POLICY_CHAIN).await? {
            self.filter.flush_chain(POLICY_CHAIN).await?;
        }
        let removed = self.remove_rule_chains(&BTreeSet::new()).await?;

        if !full {
            info!("Removed {} rule chains, restoring skeleton", removed);
            self.init(true).await?;
            return Ok(());
        }

        let jump = self.entry_jump();
        while self.filter.has_entry(ENTRY_CHAIN, &jump).await? {
            self.filter.delete_entry(ENTRY_CHAIN, &jump).await?;
        }
        for chain in [MAIN_CHAIN, POLICY_CHAIN] {
            if self.filter.chain_exists(chain).await? {
                self.filter.flush_chain(chain).await?;
                self.filter.delete_chain(chain).await?;
            }
        }
        info!("Removed {} rule chains and the packet-filter skeleton", removed);
        Ok(())
    }

    /// Delete rule chains whose id is not in `keep`
    async fn remove_rule_chains(&self, keep: &BTreeSet<Id>) -> Result<usize> {
        let mut removed = 0;
        for chain in self.filter.list_chains().await? {
            if !chain.starts_with(RULE_CHAIN_PREFIX) {
                continue;
            }
            if parse_rule_chain(&chain).is_some_and(|id| keep.contains(&id)) {
                continue;
            }
            self.filter.flush_chain(&chain).await?;
            self.filter.delete_chain(&chain).await?;
            removed += 1;
        }
        Ok(removed)
    }
}
