//! Connection-State Reconciler
//!
//! Brings the persisted `connected` flags and the DNS zone in line with
//! what the VPN transports report.
//!
//! ## Cycle
//!
//! 1. Query every configured transport into a [`LiveConnections`]
//!    snapshot. Any failure aborts the cycle before anything is touched.
//! 2. Walk the persisted identities, recording connect and disconnect
//!    transitions into one incremental [`Changeset`].
//! 3. Push the changeset to the zone, then persist the flags. A zone
//!    failure therefore leaves the store as it was. Only the connection
//!    fields are written back; identities deleted meanwhile are skipped.
//! 4. Kill orphan connections: live identifiers with no identity of the
//!    transport's kind. Kill failures are counted, not fatal.
//!
//! The snapshot lives for one cycle only; nothing is cached across cycles.

use chrono::Utc;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::inventory::{Changeset, Inventory, diff};
use crate::model::IdentityKind;
use crate::traits::{DnsZone, HubStore, VpnManagement};

/// Identifiers reported live by each transport during one cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LiveConnections {
    by_kind: BTreeMap<IdentityKind, BTreeSet<String>>,
}

impl LiveConnections {
    /// Query all transports; the first failure aborts
    pub async fn query(
        transports: &BTreeMap<IdentityKind, Arc<dyn VpnManagement>>,
    ) -> Result<Self> {
        let mut by_kind = BTreeMap::new();
        for (kind, transport) in transports {
            let live = transport.connected_identifiers().await?;
            debug!("Transport {} reports {} live {}s", transport.name(), live.len(), kind);
            by_kind.insert(*kind, live);
        }
        Ok(Self { by_kind })
    }

    /// Live identifiers of a kind; `None` if no transport was queried for it
    pub fn identifiers(&self, kind: IdentityKind) -> Option<&BTreeSet<String>> {
        self.by_kind.get(&kind)
    }

    pub fn total(&self) -> usize {
        self.by_kind.values().map(BTreeSet::len).sum()
    }
}

/// Outcome of one reconciliation cycle
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Identities whose connected flag changed
    pub updated: usize,
    pub connected: usize,
    pub disconnected: usize,
    pub orphans_killed: usize,
    pub orphans_failed: usize,
}

/// Reconciles store and zone against the VPN transports
pub struct Reconciler {
    store: Arc<dyn HubStore>,
    transports: BTreeMap<IdentityKind, Arc<dyn VpnManagement>>,
    dns: Option<Arc<dyn DnsZone>>,
}

impl Reconciler {
    pub fn new(store: Arc<dyn HubStore>, dns: Option<Arc<dyn DnsZone>>) -> Self {
        Self {
            store,
            transports: BTreeMap::new(),
            dns,
        }
    }

    /// Register the transport serving one kind of identity
    pub fn with_transport(mut self, kind: IdentityKind, transport: Arc<dyn VpnManagement>) -> Self {
        self.transports.insert(kind, transport);
        self
    }

    pub fn has_dns(&self) -> bool {
        self.dns.is_some()
    }

    /// Run one reconciliation cycle
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        let live = match LiveConnections::query(&self.transports).await {
            Ok(live) => live,
            Err(e) => {
                warn!("Reconciliation aborted, transport query failed: {}", e);
                return Err(e);
            }
        };

        let identities = self.store.identities().await?;
        let now = Utc::now();
        let mut report = ReconcileReport::default();
        let mut changes = Changeset::default();
        let mut states = Vec::new();

        for mut identity in identities.iter().cloned() {
            let Some(ids) = live.identifiers(identity.kind) else {
                continue;
            };
            match (ids.contains(identity.vpn_identifier()), identity.connected) {
                (true, false) => {
                    identity.mark_connected(now);
                    changes.new.insert(identity.fqdn.clone(), identity.ipv4_address);
                    report.connected += 1;
                    info!("{} {} connected", identity.kind, identity.fqdn);
                }
                (false, true) => {
                    identity.mark_disconnected(now);
                    changes.removed.insert(identity.fqdn.clone(), identity.ipv4_address);
                    report.disconnected += 1;
                    info!("{} {} disconnected", identity.kind, identity.fqdn);
                }
                _ => continue,
            }
            states.push(identity.connection_state());
        }

        if changes.has_changes() {
            if let Some(dns) = &self.dns {
                dns.apply_changeset(&changes).await.inspect_err(|e| {
                    warn!("Zone update failed, connection flags left unchanged: {}", e);
                })?;
            }
        }
        if !states.is_empty() {
            report.updated = self.store.set_connection_states(&states).await?;
            if report.updated < states.len() {
                debug!(
                    "{} identities were deleted during the cycle",
                    states.len() - report.updated
                );
            }
        }

        for (kind, transport) in &self.transports {
            let Some(ids) = live.identifiers(*kind) else {
                continue;
            };
            let known: BTreeSet<&str> = identities
                .iter()
                .filter(|i| i.kind == *kind)
                .map(|i| i.vpn_identifier())
                .collect();

            for orphan in ids.iter().filter(|id| !known.contains(id.as_str())) {
                match transport.kill(orphan).await {
                    Ok(()) => {
                        info!("Killed orphan connection {} on {}", orphan, transport.name());
                        report.orphans_killed += 1;
                    }
                    Err(e) => {
                        warn!("Failed to kill orphan {} on {}: {}", orphan, transport.name(), e);
                        report.orphans_failed += 1;
                    }
                }
            }
        }

        if report == ReconcileReport::default() {
            debug!("Reconciliation found nothing to do ({} live)", live.total());
        } else {
            info!(
                "Reconciled: {} connected, {} disconnected, {} orphans killed",
                report.connected, report.disconnected, report.orphans_killed
            );
        }
        Ok(report)
    }

    /// Zone contents implied by the store: one record per connected identity
    pub async fn desired_inventory(&self) -> Result<Inventory> {
        Ok(self
            .store
            .identities()
            .await?
            .into_iter()
            .filter(|i| i.connected)
            .map(|i| (i.fqdn, i.ipv4_address))
            .collect())
    }

    /// Live zone contents
    pub async fn zone_records(&self) -> Result<Inventory> {
        self.zone()?.records().await
    }

    /// Recompute the whole zone and push only the delta
    pub async fn sync_inventory(&self) -> Result<Changeset> {
        let zone = self.zone()?;
        let desired = self.desired_inventory().await?;
        let current = zone.records().await?;

        let changes = diff(&current, &desired);
        if !changes.has_changes() {
            debug!("Zone already matches {} connected identities", desired.len());
            return Ok(changes);
        }
        zone.apply_changeset(&changes).await?;
        info!(
            "Zone synchronized: {} new, {} removed, {} updated",
            changes.new.len(),
            changes.removed.len(),
            changes.updated.len()
        );
        Ok(changes)
    }

    fn zone(&self) -> Result<&Arc<dyn DnsZone>> {
        self.dns
            .as_ref()
            .ok_or_else(|| Error::config("no DNS zone configured"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Identity;
    use crate::state::{MemoryStore, MemoryZone};
    use async_trait::async_trait;
    use std::net::Ipv4Addr;
    use std::sync::Mutex;

    struct FakeTransport {
        live: Option<BTreeSet<String>>,
        killed: Mutex<Vec<String>>,
    }

    impl FakeTransport {
        fn new(live: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                live: Some(live.iter().map(|s| s.to_string()).collect()),
                killed: Mutex::new(Vec::new()),
            })
        }

        fn down() -> Arc<Self> {
            Arc::new(Self {
                live: None,
                killed: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl VpnManagement for FakeTransport {
        fn name(&self) -> &str {
            "fake"
        }

        async fn connected_identifiers(&self) -> Result<BTreeSet<String>> {
            self.live
                .clone()
                .ok_or_else(|| Error::transport("fake", "connection refused"))
        }

        async fn send_command(&self, command: &str) -> Result<String> {
            if let Some(id) = command.strip_prefix("kill ") {
                self.killed.lock().unwrap().push(id.to_string());
            }
            Ok("SUCCESS: common name found and killed".to_string())
        }
    }

    async fn device(store: &MemoryStore, uuid: &str, octet: u8, connected: bool) -> Identity {
        let mut identity = Identity::new(
            IdentityKind::UserDevice,
            uuid,
            format!("{}.hub", uuid),
            Ipv4Addr::new(100, 3, 208, octet),
        );
        if connected {
            identity.mark_connected(Utc::now());
        }
        store.save_identity(identity).await.unwrap()
    }

    #[tokio::test]
    async fn test_cycle_transitions_and_orphans() {
        let store = Arc::new(MemoryStore::new());
        device(&store, "a", 2, false).await;
        device(&store, "c", 6, true).await;
        let zone = Arc::new(MemoryZone::with_records(
            [("c.hub".to_string(), Ipv4Addr::new(100, 3, 208, 6))].into(),
        ));
        let transport = FakeTransport::new(&["a", "b"]);

        let reconciler = Reconciler::new(store.clone(), Some(zone.clone()))
            .with_transport(IdentityKind::UserDevice, transport.clone());
        let report = reconciler.reconcile().await.unwrap();

        assert_eq!(report.updated, 2);
        assert_eq!(report.orphans_killed, 1);
        assert_eq!(*transport.killed.lock().unwrap(), vec!["b".to_string()]);

        let a = store.identity_by_uuid(IdentityKind::UserDevice, "a").await.unwrap().unwrap();
        let c = store.identity_by_uuid(IdentityKind::UserDevice, "c").await.unwrap().unwrap();
        assert!(a.connected && a.disconnected_since.is_none());
        assert!(!c.connected && c.disconnected_since.is_some());

        let records = zone.records().await.unwrap();
        assert_eq!(records.get("a.hub"), Some(&Ipv4Addr::new(100, 3, 208, 2)));
        assert!(!records.contains_key("c.hub"));
    }

    #[tokio::test]
    async fn test_second_cycle_is_noop() {
        let store = Arc::new(MemoryStore::new());
        device(&store, "a", 2, false).await;
        let zone = Arc::new(MemoryZone::new());
        let reconciler = Reconciler::new(store.clone(), Some(zone.clone()))
            .with_transport(IdentityKind::UserDevice, FakeTransport::new(&["a"]));

        reconciler.reconcile().await.unwrap();
        let report = reconciler.reconcile().await.unwrap();
        assert_eq!(report, ReconcileReport::default());
        assert_eq!(zone.apply_count(), 1);
    }

    #[tokio::test]
    async fn test_transport_failure_mutates_nothing() {
        let store = Arc::new(MemoryStore::new());
        device(&store, "c", 6, true).await;
        let before = store.snapshot().await;

        let reconciler = Reconciler::new(store.clone(), None)
            .with_transport(IdentityKind::UserDevice, FakeTransport::down());
        let err = reconciler.reconcile().await.unwrap_err();
        assert!(err.is_transport());
        assert_eq!(store.snapshot().await, before);
    }

    #[tokio::test]
    async fn test_kind_without_transport_is_untouched() {
        let store = Arc::new(MemoryStore::new());
        let mut server = Identity::new(
            IdentityKind::Server,
            "srv",
            "srv.hub",
            Ipv4Addr::new(100, 3, 224, 2),
        );
        server.mark_connected(Utc::now());
        store.save_identity(server).await.unwrap();

        let reconciler = Reconciler::new(store.clone(), None)
            .with_transport(IdentityKind::UserDevice, FakeTransport::new(&[]));
        reconciler.reconcile().await.unwrap();

        let server = store.identity_by_uuid(IdentityKind::Server, "srv").await.unwrap().unwrap();
        assert!(server.connected);
    }

    #[tokio::test]
    async fn test_sync_inventory_pushes_delta_only() {
        let store = Arc::new(MemoryStore::new());
        device(&store, "a", 2, true).await;
        device(&store, "b", 6, false).await;
        let zone = Arc::new(MemoryZone::with_records(
            [
                ("a.hub".to_string(), Ipv4Addr::new(100, 3, 208, 2)),
                ("stale.hub".to_string(), Ipv4Addr::new(100, 3, 208, 42)),
            ]
            .into(),
        ));
        let reconciler = Reconciler::new(store, Some(zone.clone()));

        let changes = reconciler.sync_inventory().await.unwrap();
        assert_eq!(changes.removed.len(), 1);
        assert_eq!(changes.unchanged.len(), 1);
        assert_eq!(zone.records().await.unwrap().len(), 1);

        let again = reconciler.sync_inventory().await.unwrap();
        assert!(!again.has_changes());
        assert_eq!(zone.apply_count(), 1);
    }

    #[tokio::test]
    async fn test_sync_inventory_requires_zone() {
        let reconciler = Reconciler::new(Arc::new(MemoryStore::new()), None);
        assert!(matches!(
            reconciler.sync_inventory().await,
            Err(Error::Config(_))
        ));
    }
}
