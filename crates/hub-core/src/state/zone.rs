// # Memory Zone
//
// In-memory DnsZone. Used when no zone API is configured and by tests.

use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::RwLock;

use crate::error::Result;
use crate::inventory::{Changeset, Inventory};
use crate::traits::DnsZone;

/// In-memory DNS zone
#[derive(Debug, Clone, Default)]
pub struct MemoryZone {
    records: Arc<RwLock<Inventory>>,
    applied: Arc<AtomicUsize>,
}

impl MemoryZone {
    pub fn new() -> Self {
        Self::default()
    }

    /// A zone pre-populated with `records`
    pub fn with_records(records: Inventory) -> Self {
        Self {
            records: Arc::new(RwLock::new(records)),
            applied: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of changesets applied so far
    pub fn apply_count(&self) -> usize {
        self.applied.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DnsZone for MemoryZone {
    async fn records(&self) -> Result<Inventory> {
        Ok(self.records.read().await.clone())
    }

    async fn apply_changeset(&self, changes: &Changeset) -> Result<()> {
        let mut records = self.records.write().await;
        changes.apply_to(&mut records);
        self.applied.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn provider_name(&self) -> &'static str {
        "memory"
    }
}
