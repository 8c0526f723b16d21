//! Hub engine
//!
//! The HubEngine is responsible for:
//! - Turning domain events into job-queue submissions
//! - Validating administrative mutations before anything is queued
//! - Scheduling reconciliation and zone syncs
//! - Draining the queue and flushing the store on shutdown
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌──────────────┐
//! │ admin calls  │   │  VPN hooks   │   │    timers    │
//! └──────┬───────┘   └──────┬───────┘   └──────┬───────┘
//!        │      HubEvent    │                  │
//!        └──────────────────┼──────────────────┘
//!                           ▼
//!                   ┌──────────────┐
//!                   │   JobQueue   │  one worker, FIFO, dedup ids
//!                   └──────┬───────┘
//!         ┌────────────────┼────────────────┐
//!         ▼                ▼                ▼
//! ┌──────────────┐ ┌──────────────┐ ┌──────────────┐
//! │   Firewall   │ │  Reconciler  │ │  Admission   │
//! └──────────────┘ └──────────────┘ └──────────────┘
//! ```
//!
//! ## Event mapping
//!
//! | event | job | dedup id |
//! |---|---|---|
//! | `RuleChanged` / `RuleDeleted` | apply / delete rule | none |
//! | `PolicyChanged` / `PolicyDeleted` | apply / delete policy | none |
//! | `GroupChanged` | re-apply referencing rules and policies | `group-{id}` |
//! | `GroupDeleted`, `IdentityChanged`, `IdentityDeleted`, `FullSyncRequested` | full sync | `firewall-full-sync` |
//! | `IdentityConnected`, `IdentityDisconnected`, `ReconcileRequested` | reconcile | `reconcile` |
//! | `InventorySyncRequested` | zone sync | `inventory-sync` |

pub mod queue;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::admission::{Admission, AdmissionDecision, JoinRequest};
use crate::config::HubConfig;
use crate::error::Result;
use crate::firewall::{Firewall, SyncReport};
use crate::inventory::{Changeset, Inventory};
use crate::model::{AccessConfig, Group, Id, Identity, IdentityKind, Policy, Rule};
use crate::reconcile::{ReconcileReport, Reconciler};
use crate::traits::{DnsZone, HubStore, PacketFilter, VpnManagement};

pub use queue::{JobHandle, JobQueue, Submission};

/// Dedup id of the full packet-filter sync
pub const FULL_SYNC_JOB: &str = "firewall-full-sync";

/// Dedup id of the reconciliation cycle
pub const RECONCILE_JOB: &str = "reconcile";

/// Dedup id of the full zone sync
pub const INVENTORY_JOB: &str = "inventory-sync";

/// Dedup id of a group re-apply
pub fn group_job(group_id: Id) -> String {
    format!("group-{}", group_id)
}

/// Domain events published to the engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HubEvent {
    RuleChanged { id: Id },
    RuleDeleted { id: Id },
    PolicyChanged { id: Id },
    PolicyDeleted { id: Id },
    GroupChanged { id: Id },
    GroupDeleted { id: Id },
    IdentityChanged { id: Id },
    IdentityDeleted { id: Id },
    IdentityConnected { kind: IdentityKind, uuid: String },
    IdentityDisconnected { kind: IdentityKind, uuid: String },
    ReconcileRequested,
    InventorySyncRequested,
    FullSyncRequested,
}

/// Events emitted by the HubEngine for monitoring
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    /// Engine started
    Started { transports: usize, dns: bool },

    /// A reconciliation cycle changed something
    Reconciled { report: ReconcileReport },

    /// Packet filter rebuilt from the store
    FullSyncCompleted { report: SyncReport },

    /// Zone delta pushed
    InventorySynced { changes: usize },

    IdentityAdmitted { uuid: String, fqdn: String, created: bool },

    IdentityRejected { uuid: String, reason: String },

    /// Engine stopped
    Stopped { reason: String },
}

/// What a zone inspection returns
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InventoryView {
    /// Records implied by the connected identities
    pub desired: Inventory,
    /// Records in the zone, if one is configured
    pub zone: Option<Inventory>,
}

/// External systems the engine drives
pub struct Backends {
    pub store: Arc<dyn HubStore>,
    pub filter: Arc<dyn PacketFilter>,
    pub transports: BTreeMap<IdentityKind, Arc<dyn VpnManagement>>,
    pub dns: Option<Arc<dyn DnsZone>>,
}

#[derive(Clone)]
struct Emitter(mpsc::Sender<EngineEvent>);

impl Emitter {
    fn emit(&self, event: EngineEvent) {
        match self.0.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Event channel full, dropping event. Consider increasing event_channel_capacity.");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Event receiver gone, dropping event");
            }
        }
    }
}

struct Inner {
    store: Arc<dyn HubStore>,
    firewall: Arc<Firewall>,
    reconciler: Arc<Reconciler>,
    admission: Arc<Admission>,
    queue: JobQueue,
    events: Emitter,
}

impl Inner {
    fn publish(self: &Arc<Self>, event: HubEvent) -> Submission<()> {
        debug!("Publishing {:?}", event);
        match event {
            HubEvent::RuleChanged { id } => {
                let firewall = self.firewall.clone();
                self.queue.submit(None, format!("apply-rule-{}", id), async move {
                    firewall.apply_rule(id).await.map(drop)
                })
            }
            HubEvent::RuleDeleted { id } => {
                let firewall = self.firewall.clone();
                self.queue.submit(None, format!("delete-rule-{}", id), async move {
                    firewall.delete_rule(id).await
                })
            }
            HubEvent::PolicyChanged { id } => {
                let firewall = self.firewall.clone();
                self.queue.submit(None, format!("apply-policy-{}", id), async move {
                    firewall.apply_policy(id).await.map(drop)
                })
            }
            HubEvent::PolicyDeleted { id } => {
                let firewall = self.firewall.clone();
                self.queue.submit(None, format!("delete-policy-{}", id), async move {
                    firewall.delete_policy(id).await.map(drop)
                })
            }
            HubEvent::GroupChanged { id } => {
                let job = group_job(id);
                let this = self.clone();
                self.queue
                    .submit(Some(&job), job.clone(), async move { this.reapply_group(id).await })
            }
            HubEvent::IdentityDeleted { .. } => {
                let sync = self.full_sync().discard();
                if self.reconciler.has_dns() {
                    self.sync_inventory();
                }
                sync
            }
            HubEvent::GroupDeleted { .. }
            | HubEvent::IdentityChanged { .. }
            | HubEvent::FullSyncRequested => self.full_sync().discard(),
            HubEvent::IdentityConnected { .. }
            | HubEvent::IdentityDisconnected { .. }
            | HubEvent::ReconcileRequested => self.reconcile().discard(),
            HubEvent::InventorySyncRequested => self.sync_inventory().discard(),
        }
    }

    /// Re-apply rules and policies that reference a group
    async fn reapply_group(&self, group_id: Id) -> Result<()> {
        let Some(group) = self.store.group(group_id).await? else {
            debug!("Group {} no longer exists", group_id);
            return Ok(());
        };

        for rule in self.store.rules().await? {
            if rule.references_group(group_id) {
                self.firewall.apply_rule(rule.id).await?;
            }
        }
        if group.kind == IdentityKind::Server {
            for policy in self.store.policies().await? {
                if policy.target_servergroups.contains(&group_id) {
                    self.firewall.apply_policy(policy.id).await?;
                }
            }
        }
        info!("Re-applied enforcement for group '{}'", group.name);
        Ok(())
    }

    fn full_sync(self: &Arc<Self>) -> Submission<SyncReport> {
        let firewall = self.firewall.clone();
        let events = self.events.clone();
        self.queue.submit(Some(FULL_SYNC_JOB), FULL_SYNC_JOB, async move {
            let report = firewall.full_sync().await?;
            events.emit(EngineEvent::FullSyncCompleted {
                report: report.clone(),
            });
            Ok(report)
        })
    }

    fn reconcile(self: &Arc<Self>) -> Submission<ReconcileReport> {
        let reconciler = self.reconciler.clone();
        let events = self.events.clone();
        self.queue.submit(Some(RECONCILE_JOB), RECONCILE_JOB, async move {
            let report = reconciler.reconcile().await?;
            if report != ReconcileReport::default() {
                events.emit(EngineEvent::Reconciled {
                    report: report.clone(),
                });
            }
            Ok(report)
        })
    }

    fn sync_inventory(self: &Arc<Self>) -> Submission<Changeset> {
        let reconciler = self.reconciler.clone();
        let events = self.events.clone();
        self.queue.submit(Some(INVENTORY_JOB), INVENTORY_JOB, async move {
            let changes = reconciler.sync_inventory().await?;
            if changes.has_changes() {
                events.emit(EngineEvent::InventorySynced {
                    changes: changes.change_count(),
                });
            }
            Ok(changes)
        })
    }
}

/// Core overlay hub engine
///
/// ## Lifecycle
///
/// 1. Create with [`HubEngine::new()`] inside a tokio runtime
/// 2. Start with [`HubEngine::run()`]
/// 3. The engine runs until a shutdown signal is received, then drains
///    the job queue and flushes the store
///
/// Every method that touches the packet filter, the zone or a transport
/// only submits a job and returns its [`Submission`].
pub struct HubEngine {
    inner: Arc<Inner>,
    reconcile_interval: Duration,
    inventory_interval: Option<Duration>,
    init_on_start: bool,
    transport_count: usize,
}

impl HubEngine {
    /// Create a new engine
    ///
    /// # Returns
    ///
    /// A tuple of (engine, event_receiver) where event_receiver yields engine events
    pub fn new(
        config: &HubConfig,
        backends: Backends,
    ) -> Result<(Self, mpsc::Receiver<EngineEvent>)> {
        config.validate()?;

        let (tx, rx) = mpsc::channel(config.engine.event_channel_capacity.max(1));
        let transport_count = backends.transports.len();

        let firewall = Firewall::new(
            backends.filter.clone(),
            backends.store.clone(),
            config.subnet_key,
        );
        let mut reconciler = Reconciler::new(backends.store.clone(), backends.dns.clone());
        for (kind, transport) in backends.transports {
            reconciler = reconciler.with_transport(kind, transport);
        }
        let admission = Admission::new(backends.store.clone(), config.subnet_key, &config.domain);

        let inventory_interval = match config.engine.inventory_interval_secs {
            0 => None,
            _ if backends.dns.is_none() => None,
            secs => Some(Duration::from_secs(secs)),
        };

        let engine = Self {
            inner: Arc::new(Inner {
                store: backends.store,
                firewall: Arc::new(firewall),
                reconciler: Arc::new(reconciler),
                admission: Arc::new(admission),
                queue: JobQueue::new(),
                events: Emitter(tx),
            }),
            reconcile_interval: Duration::from_secs(config.engine.reconcile_interval_secs),
            inventory_interval,
            init_on_start: config.firewall.init_on_start,
            transport_count,
        };
        Ok((engine, rx))
    }

    pub fn store(&self) -> &Arc<dyn HubStore> {
        &self.inner.store
    }

    /// Queue the job(s) an event maps to
    pub fn publish(&self, event: HubEvent) -> Submission<()> {
        self.inner.publish(event)
    }

    // --- queued operations ---

    pub fn reconcile(&self) -> Submission<ReconcileReport> {
        self.inner.reconcile()
    }

    pub fn full_sync(&self) -> Submission<SyncReport> {
        self.inner.full_sync()
    }

    pub fn sync_inventory(&self) -> Submission<Changeset> {
        self.inner.sync_inventory()
    }

    pub fn init(&self, core_only: bool) -> Submission<Option<SyncReport>> {
        let firewall = self.inner.firewall.clone();
        self.inner
            .queue
            .submit(None, "firewall-init", async move { firewall.init(core_only).await })
    }

    pub fn teardown(&self, full: bool) -> Submission<()> {
        let firewall = self.inner.firewall.clone();
        self.inner
            .queue
            .submit(None, "firewall-teardown", async move { firewall.teardown(full).await })
    }

    pub fn apply_rule(&self, id: Id) -> Submission<usize> {
        let firewall = self.inner.firewall.clone();
        self.inner
            .queue
            .submit(None, format!("apply-rule-{}", id), async move { firewall.apply_rule(id).await })
    }

    pub fn apply_policy(&self, id: Id) -> Submission<usize> {
        let firewall = self.inner.firewall.clone();
        self.inner.queue.submit(None, format!("apply-policy-{}", id), async move {
            firewall.apply_policy(id).await
        })
    }

    pub fn allocate_address(&self, kind: IdentityKind) -> Submission<Ipv4Addr> {
        let admission = self.inner.admission.clone();
        self.inner.queue.submit(None, format!("allocate-{}", kind), async move {
            admission.allocate_address(kind).await
        })
    }

    /// Decide a join attempt; a newly created identity triggers a full sync
    pub fn admit(&self, request: JoinRequest) -> Submission<AdmissionDecision> {
        let inner = self.inner.clone();
        self.inner
            .queue
            .submit(None, format!("admit-{}", request.uuid), async move {
                let decision = inner.admission.admit(&request).await?;
                match &decision {
                    AdmissionDecision::Admitted { identity, created } => {
                        inner.events.emit(EngineEvent::IdentityAdmitted {
                            uuid: identity.uuid.clone(),
                            fqdn: identity.fqdn.clone(),
                            created: *created,
                        });
                        if *created {
                            inner.publish(HubEvent::IdentityChanged { id: identity.id });
                        }
                    }
                    AdmissionDecision::Rejected { reason, removed } => {
                        inner.events.emit(EngineEvent::IdentityRejected {
                            uuid: request.uuid.clone(),
                            reason: reason.clone(),
                        });
                        if let Some(identity) = removed {
                            inner.publish(HubEvent::IdentityDeleted { id: identity.id });
                        }
                    }
                }
                Ok(decision)
            })
    }

    pub fn client_config(&self, kind: IdentityKind, uuid: &str) -> Submission<String> {
        let admission = self.inner.admission.clone();
        let uuid = uuid.to_string();
        self.inner.queue.submit(None, format!("client-config-{}", uuid), async move {
            admission.client_config(kind, &uuid).await
        })
    }

    /// Desired records and, when a zone is configured, its live records
    pub fn inventory(&self) -> Submission<InventoryView> {
        let reconciler = self.inner.reconciler.clone();
        self.inner.queue.submit(None, "inventory-show", async move {
            let desired = reconciler.desired_inventory().await?;
            let zone = if reconciler.has_dns() {
                Some(reconciler.zone_records().await?)
            } else {
                None
            };
            Ok(InventoryView { desired, zone })
        })
    }

    // --- validated administrative mutations ---

    pub async fn save_rule(&self, rule: Rule) -> Result<Rule> {
        rule.validate()?;
        let saved = self.inner.store.save_rule(rule).await?;
        self.publish(HubEvent::RuleChanged { id: saved.id });
        Ok(saved)
    }

    pub async fn delete_rule(&self, id: Id) -> Result<Option<Rule>> {
        let removed = self.inner.store.delete_rule(id).await?;
        if removed.is_some() {
            self.publish(HubEvent::RuleDeleted { id });
        }
        Ok(removed)
    }

    pub async fn save_policy(&self, policy: Policy) -> Result<Policy> {
        policy.validate()?;
        let saved = self.inner.store.save_policy(policy).await?;
        self.publish(HubEvent::PolicyChanged { id: saved.id });
        Ok(saved)
    }

    pub async fn delete_policy(&self, id: Id) -> Result<Option<Policy>> {
        let removed = self.inner.store.delete_policy(id).await?;
        if removed.is_some() {
            self.publish(HubEvent::PolicyDeleted { id });
        }
        Ok(removed)
    }

    pub async fn save_group(&self, group: Group) -> Result<Group> {
        group.validate()?;
        let saved = self.inner.store.save_group(group).await?;
        self.publish(HubEvent::GroupChanged { id: saved.id });
        Ok(saved)
    }

    /// Reserved groups cannot be deleted
    pub async fn delete_group(&self, id: Id) -> Result<Option<Group>> {
        let removed = self.inner.store.delete_group(id).await?;
        if removed.is_some() {
            self.publish(HubEvent::GroupDeleted { id });
        }
        Ok(removed)
    }

    pub async fn add_member(&self, group_id: Id, identity_id: Id) -> Result<Identity> {
        self.set_membership(group_id, identity_id, true).await
    }

    /// Removal from a reserved group is rejected
    pub async fn remove_member(&self, group_id: Id, identity_id: Id) -> Result<Identity> {
        self.set_membership(group_id, identity_id, false).await
    }

    async fn set_membership(&self, group_id: Id, identity_id: Id, member: bool) -> Result<Identity> {
        let (identity, changed) = self
            .inner
            .store
            .set_membership(group_id, identity_id, member)
            .await?;
        if changed {
            self.publish(HubEvent::GroupChanged { id: group_id });
        }
        Ok(identity)
    }

    /// Save the join gate; identities whose uuid is now blacklisted are deleted
    pub async fn save_access_config(&self, config: AccessConfig) -> Result<Vec<Identity>> {
        self.inner.store.save_access_config(config.clone()).await?;

        let mut removed = Vec::new();
        for identity in self.inner.store.identities().await? {
            if !config.is_blacklisted(&identity.uuid) {
                continue;
            }
            if let Some(identity) = self.inner.store.delete_identity(identity.id).await? {
                warn!("Deleted blacklisted {} {}", identity.kind, identity.fqdn);
                self.publish(HubEvent::IdentityDeleted { id: identity.id });
                removed.push(identity);
            }
        }
        Ok(removed)
    }

    pub async fn delete_identity(&self, id: Id) -> Result<Option<Identity>> {
        let removed = self.inner.store.delete_identity(id).await?;
        if removed.is_some() {
            self.publish(HubEvent::IdentityDeleted { id });
        }
        Ok(removed)
    }

    // --- lifecycle ---

    /// Run the engine until SIGINT
    pub async fn run(&self) -> Result<()> {
        self.run_internal(None).await
    }

    /// Run the engine until `shutdown_rx` fires (or SIGINT when `None`)
    pub async fn run_with_shutdown(&self, shutdown_rx: Option<oneshot::Receiver<()>>) -> Result<()> {
        self.run_internal(shutdown_rx).await
    }

    async fn run_internal(&self, shutdown_rx: Option<oneshot::Receiver<()>>) -> Result<()> {
        self.inner.events.emit(EngineEvent::Started {
            transports: self.transport_count,
            dns: self.inner.reconciler.has_dns(),
        });
        info!(
            "Engine started: {} transports, reconcile every {}s",
            self.transport_count,
            self.reconcile_interval.as_secs()
        );

        if self.init_on_start {
            self.init(false);
        }

        let mut reconcile_tick = tokio::time::interval(self.reconcile_interval);
        reconcile_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut inventory_tick = self.inventory_interval.map(|period| {
            let mut tick = tokio::time::interval(period);
            tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
            tick
        });

        let shutdown = async move {
            match shutdown_rx {
                Some(rx) => {
                    let _ = rx.await;
                }
                None => {
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        warn!("Failed to listen for shutdown signal: {}", e);
                        std::future::pending::<()>().await;
                    }
                }
            }
        };
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = reconcile_tick.tick() => {
                    self.publish(HubEvent::ReconcileRequested);
                }
                _ = next_tick(&mut inventory_tick) => {
                    self.publish(HubEvent::InventorySyncRequested);
                }
                _ = &mut shutdown => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        self.inner.queue.shutdown().await;
        self.inner.store.flush().await?;
        info!("State flushed, engine stopped");
        self.inner.events.emit(EngineEvent::Stopped {
            reason: "Shutdown signal".to_string(),
        });
        Ok(())
    }
}

async fn next_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
