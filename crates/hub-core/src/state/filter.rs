// # Memory Packet Filter
//
// In-memory implementation of PacketFilter that mimics the iptables
// `filter` table closely enough to exercise the compiler: builtin chains,
// user chains, jump targets that must exist, chains that cannot be
// deleted while non-empty or referenced.
//
// It can also simulate the first-insert anomaly: a chain marked stale
// (as if modified out-of-band) silently drops the next insertion.

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use crate::error::{Error, Result};
use crate::traits::{FilterEntry, PacketFilter, Target};

const BUILTIN_CHAINS: [&str; 3] = ["INPUT", "FORWARD", "OUTPUT"];

#[derive(Debug, Default)]
struct FilterTable {
    chains: BTreeMap<String, Vec<FilterEntry>>,
    stale: BTreeSet<String>,
    mutations: usize,
}

impl FilterTable {
    fn chain_mut(&mut self, chain: &str) -> Result<&mut Vec<FilterEntry>> {
        self.chains
            .get_mut(chain)
            .ok_or_else(|| Error::firewall(format!("chain {} does not exist", chain)))
    }

    fn check_target(&self, entry: &FilterEntry) -> Result<()> {
        if let Target::Jump(target) = &entry.target {
            if !self.chains.contains_key(target) {
                return Err(Error::firewall(format!("jump target {} does not exist", target)));
            }
        }
        Ok(())
    }

    fn is_referenced(&self, chain: &str) -> bool {
        self.chains
            .values()
            .flatten()
            .any(|e| matches!(&e.target, Target::Jump(t) if t == chain))
    }
}

/// In-memory `filter` table
#[derive(Debug)]
pub struct MemoryPacketFilter {
    table: Mutex<FilterTable>,
}

impl Default for MemoryPacketFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryPacketFilter {
    /// A table holding only the empty builtin chains
    pub fn new() -> Self {
        let mut table = FilterTable::default();
        for builtin in BUILTIN_CHAINS {
            table.chains.insert(builtin.to_string(), Vec::new());
        }
        Self {
            table: Mutex::new(table),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FilterTable> {
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Entries of a chain, `None` if it does not exist
    pub fn entries(&self, chain: &str) -> Option<Vec<FilterEntry>> {
        self.lock().chains.get(chain).cloned()
    }

    /// Names of every chain, builtins included
    pub fn all_chains(&self) -> Vec<String> {
        self.lock().chains.keys().cloned().collect()
    }

    /// Number of mutating calls so far
    pub fn mutations(&self) -> usize {
        self.lock().mutations
    }

    /// Mark a chain as modified out-of-band; its next insertion is lost
    pub fn mark_stale(&self, chain: &str) {
        self.lock().stale.insert(chain.to_string());
    }

    /// Flush a chain behind the compiler's back
    pub fn flush_out_of_band(&self, chain: &str) {
        let mut table = self.lock();
        if let Some(entries) = table.chains.get_mut(chain) {
            entries.clear();
        }
        table.stale.insert(chain.to_string());
    }
}

#[async_trait]
impl PacketFilter for MemoryPacketFilter {
    async fn list_chains(&self) -> Result<Vec<String>> {
        Ok(self
            .lock()
            .chains
            .keys()
            .filter(|c| !BUILTIN_CHAINS.contains(&c.as_str()))
            .cloned()
            .collect())
    }

    async fn create_chain(&self, chain: &str) -> Result<()> {
        let mut table = self.lock();
        if table.chains.contains_key(chain) {
            return Err(Error::firewall(format!("chain {} already exists", chain)));
        }
        table.chains.insert(chain.to_string(), Vec::new());
        table.mutations += 1;
        Ok(())
    }

    async fn flush_chain(&self, chain: &str) -> Result<()> {
        let mut table = self.lock();
        table.chain_mut(chain)?.clear();
        table.mutations += 1;
        Ok(())
    }

    async fn delete_chain(&self, chain: &str) -> Result<()> {
        let mut table = self.lock();
        if BUILTIN_CHAINS.contains(&chain) {
            return Err(Error::firewall(format!("cannot delete builtin chain {}", chain)));
        }
        if !table.chain_mut(chain)?.is_empty() {
            return Err(Error::firewall(format!("chain {} is not empty", chain)));
        }
        if table.is_referenced(chain) {
            return Err(Error::firewall(format!("chain {} is still referenced", chain)));
        }
        table.chains.remove(chain);
        table.stale.remove(chain);
        table.mutations += 1;
        Ok(())
    }

    async fn list_entries(&self, chain: &str) -> Result<Vec<FilterEntry>> {
        let mut table = self.lock();
        Ok(table.chain_mut(chain)?.clone())
    }

    async fn insert_entry(&self, chain: &str, entry: &FilterEntry) -> Result<()> {
        let mut table = self.lock();
        table.check_target(entry)?;
        table.chain_mut(chain)?;
        table.mutations += 1;
        if table.stale.remove(chain) {
            // the anomaly: reported as success, nothing inserted
            return Ok(());
        }
        table.chain_mut(chain)?.insert(0, entry.clone());
        Ok(())
    }

    async fn append_entry(&self, chain: &str, entry: &FilterEntry) -> Result<()> {
        let mut table = self.lock();
        table.check_target(entry)?;
        table.chain_mut(chain)?.push(entry.clone());
        table.mutations += 1;
        Ok(())
    }

    async fn delete_entry(&self, chain: &str, entry: &FilterEntry) -> Result<()> {
        let mut table = self.lock();
        let entries = table.chain_mut(chain)?;
        let position = entries
            .iter()
            .position(|e| e == entry)
            .ok_or_else(|| Error::firewall(format!("no matching entry in {}: {}", chain, entry)))?;
        entries.remove(position);
        table.mutations += 1;
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
