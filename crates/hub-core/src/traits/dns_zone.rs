// # DNS Zone Trait
//
// The hub publishes one A record per connected identity. Zone backends
// receive whole changesets so a reconciliation cycle results in at most
// one API round trip.
//
// ## Implementations
//
// - Zone HTTP API: `hub-dns-http` crate
// - In-memory: `hub_core::state::MemoryZone`

use async_trait::async_trait;

use crate::error::Result;
use crate::inventory::{Changeset, Inventory};

/// Trait for DNS zone backends
///
/// # Trust Level
///
/// Zone backends perform API calls only. They must not retry, cache
/// or decide whether a change is needed: the reconciler owns those
/// decisions and retries on its next cycle.
#[async_trait]
pub trait DnsZone: Send + Sync {
    /// Current zone contents
    async fn records(&self) -> Result<Inventory>;

    /// Apply `new`, `updated` and `removed`; `unchanged` is informational
    ///
    /// # Returns
    ///
    /// - `Ok(())`: the zone accepted the whole changeset
    /// - `Err(Error::Transport)`: nothing may be assumed applied
    async fn apply_changeset(&self, changes: &Changeset) -> Result<()>;

    /// Backend name (for logging)
    fn provider_name(&self) -> &'static str;
}
