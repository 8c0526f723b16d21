//! Test doubles and common utilities for contract tests
//!
//! The doubles count their calls so tests can assert on what the engine
//! did, not only on what it returned.

#![allow(dead_code)]

use async_trait::async_trait;
use hub_core::error::{Error, Result};
use hub_core::inventory::{Changeset, Inventory};
use hub_core::model::{
    AccessConfig, ConnectionState, Group, Id, Identity, IdentityKind, Policy, Rule,
};
use hub_core::traits::{DnsZone, HubStore, VpnManagement};
use hub_core::{
    Backends, EngineEvent, HubConfig, HubEngine, MemoryPacketFilter, MemoryStore, MemoryZone,
    SubnetKey,
};
use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Semaphore, mpsc};

pub const SUBNET_KEY: u16 = 10;
pub const DOMAIN: &str = "hub.test";

/// A VPN transport whose live set and failures are set by the test
pub struct ScriptedTransport {
    name: &'static str,
    live: Mutex<BTreeSet<String>>,
    down: AtomicBool,
    refuse_kills: AtomicBool,
    query_count: Arc<AtomicUsize>,
    killed: Arc<Mutex<Vec<String>>>,
    gate: Option<Arc<Semaphore>>,
}

impl ScriptedTransport {
    pub fn new(name: &'static str, live: &[&str]) -> Arc<Self> {
        Arc::new(Self::build(name, live, None))
    }

    /// Every query waits for a permit on `gate`
    pub fn gated(name: &'static str, gate: Arc<Semaphore>) -> Arc<Self> {
        Arc::new(Self::build(name, &[], Some(gate)))
    }

    fn build(name: &'static str, live: &[&str], gate: Option<Arc<Semaphore>>) -> Self {
        Self {
            name,
            live: Mutex::new(live.iter().map(|s| s.to_string()).collect()),
            down: AtomicBool::new(false),
            refuse_kills: AtomicBool::new(false),
            query_count: Arc::new(AtomicUsize::new(0)),
            killed: Arc::new(Mutex::new(Vec::new())),
            gate,
        }
    }

    pub fn set_live(&self, live: &[&str]) {
        *self.live.lock().unwrap() = live.iter().map(|s| s.to_string()).collect();
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    pub fn refuse_kills(&self) {
        self.refuse_kills.store(true, Ordering::SeqCst);
    }

    pub fn query_count(&self) -> usize {
        self.query_count.load(Ordering::SeqCst)
    }

    pub fn killed(&self) -> Vec<String> {
        self.killed.lock().unwrap().clone()
    }
}

#[async_trait]
impl VpnManagement for ScriptedTransport {
    fn name(&self) -> &str {
        self.name
    }

    async fn connected_identifiers(&self) -> Result<BTreeSet<String>> {
        self.query_count.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.acquire().await.map_err(|e| Error::Other(e.to_string()))?.forget();
        }
        if self.down.load(Ordering::SeqCst) {
            return Err(Error::transport(self.name, "connection refused"));
        }
        Ok(self.live.lock().unwrap().clone())
    }

    async fn send_command(&self, command: &str) -> Result<String> {
        let Some(id) = command.strip_prefix("kill ") else {
            return Ok("ERROR: unknown command".to_string());
        };
        if self.refuse_kills.load(Ordering::SeqCst) {
            return Ok(format!("ERROR: common name '{}' not found", id));
        }
        self.killed.lock().unwrap().push(id.to_string());
        Ok(format!("SUCCESS: common name '{}' found, 1 client(s) killed", id))
    }
}

/// A zone that rejects every write
#[derive(Default)]
pub struct FailingZone {
    pub attempts: AtomicUsize,
}

#[async_trait]
impl DnsZone for FailingZone {
    async fn records(&self) -> Result<Inventory> {
        Ok(Inventory::new())
    }

    async fn apply_changeset(&self, _changes: &Changeset) -> Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(Error::transport("zone-api", "503 Service Unavailable"))
    }

    fn provider_name(&self) -> &'static str {
        "failing"
    }
}

/// A MemoryZone whose writes each wait for a permit on `gate`
pub struct GatedZone {
    pub inner: MemoryZone,
    gate: Arc<Semaphore>,
    attempts: AtomicUsize,
}

impl GatedZone {
    pub fn new(gate: Arc<Semaphore>) -> Arc<Self> {
        Arc::new(Self {
            inner: MemoryZone::new(),
            gate,
            attempts: AtomicUsize::new(0),
        })
    }

    /// Writes started so far, including the one waiting at the gate
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DnsZone for GatedZone {
    async fn records(&self) -> Result<Inventory> {
        self.inner.records().await
    }

    async fn apply_changeset(&self, changes: &Changeset) -> Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.gate
            .acquire()
            .await
            .map_err(|e| Error::Other(e.to_string()))?
            .forget();
        self.inner.apply_changeset(changes).await
    }

    fn provider_name(&self) -> &'static str {
        "gated"
    }
}

/// A MemoryStore that counts flushes
#[derive(Clone, Default)]
pub struct CountingStore {
    pub inner: MemoryStore,
    flushes: Arc<AtomicUsize>,
}

impl CountingStore {
    pub fn flush_count(&self) -> usize {
        self.flushes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HubStore for CountingStore {
    async fn identities(&self) -> Result<Vec<Identity>> {
        self.inner.identities().await
    }
    async fn identity(&self, id: Id) -> Result<Option<Identity>> {
        self.inner.identity(id).await
    }
    async fn identity_by_uuid(&self, kind: IdentityKind, uuid: &str) -> Result<Option<Identity>> {
        self.inner.identity_by_uuid(kind, uuid).await
    }
    async fn save_identity(&self, identity: Identity) -> Result<Identity> {
        self.inner.save_identity(identity).await
    }
    async fn set_connection_states(&self, states: &[ConnectionState]) -> Result<usize> {
        self.inner.set_connection_states(states).await
    }
    async fn set_membership(
        &self,
        group_id: Id,
        identity_id: Id,
        member: bool,
    ) -> Result<(Identity, bool)> {
        self.inner.set_membership(group_id, identity_id, member).await
    }
    async fn delete_identity(&self, id: Id) -> Result<Option<Identity>> {
        self.inner.delete_identity(id).await
    }
    async fn groups(&self) -> Result<Vec<Group>> {
        self.inner.groups().await
    }
    async fn group(&self, id: Id) -> Result<Option<Group>> {
        self.inner.group(id).await
    }
    async fn save_group(&self, group: Group) -> Result<Group> {
        self.inner.save_group(group).await
    }
    async fn delete_group(&self, id: Id) -> Result<Option<Group>> {
        self.inner.delete_group(id).await
    }
    async fn rules(&self) -> Result<Vec<Rule>> {
        self.inner.rules().await
    }
    async fn rule(&self, id: Id) -> Result<Option<Rule>> {
        self.inner.rule(id).await
    }
    async fn save_rule(&self, rule: Rule) -> Result<Rule> {
        self.inner.save_rule(rule).await
    }
    async fn delete_rule(&self, id: Id) -> Result<Option<Rule>> {
        self.inner.delete_rule(id).await
    }
    async fn policies(&self) -> Result<Vec<Policy>> {
        self.inner.policies().await
    }
    async fn policy(&self, id: Id) -> Result<Option<Policy>> {
        self.inner.policy(id).await
    }
    async fn save_policy(&self, policy: Policy) -> Result<Policy> {
        self.inner.save_policy(policy).await
    }
    async fn delete_policy(&self, id: Id) -> Result<Option<Policy>> {
        self.inner.delete_policy(id).await
    }
    async fn access_config(&self) -> Result<AccessConfig> {
        self.inner.access_config().await
    }
    async fn save_access_config(&self, config: AccessConfig) -> Result<()> {
        self.inner.save_access_config(config).await
    }
    async fn flush(&self) -> Result<()> {
        self.flushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Configuration with the firewall left alone at startup
pub fn config() -> HubConfig {
    let mut config = HubConfig::new(SubnetKey::new(SUBNET_KEY).unwrap(), DOMAIN);
    config.firewall.init_on_start = false;
    config
}

/// Everything a test needs to inspect after driving the engine
pub struct Harness {
    pub engine: HubEngine,
    pub events: mpsc::Receiver<EngineEvent>,
    pub store: Arc<dyn HubStore>,
    pub filter: Arc<MemoryPacketFilter>,
}

pub struct HarnessBuilder {
    config: HubConfig,
    store: Arc<dyn HubStore>,
    transports: BTreeMap<IdentityKind, Arc<dyn VpnManagement>>,
    dns: Option<Arc<dyn DnsZone>>,
}

impl HarnessBuilder {
    pub fn new() -> Self {
        Self {
            config: config(),
            store: Arc::new(MemoryStore::new()),
            transports: BTreeMap::new(),
            dns: None,
        }
    }

    pub fn config(mut self, config: HubConfig) -> Self {
        self.config = config;
        self
    }

    pub fn store(mut self, store: Arc<dyn HubStore>) -> Self {
        self.store = store;
        self
    }

    pub fn transport(mut self, kind: IdentityKind, transport: Arc<dyn VpnManagement>) -> Self {
        self.transports.insert(kind, transport);
        self
    }

    pub fn dns(mut self, dns: Arc<dyn DnsZone>) -> Self {
        self.dns = Some(dns);
        self
    }

    pub fn build(self) -> Harness {
        let filter = Arc::new(MemoryPacketFilter::new());
        let (engine, events) = HubEngine::new(
            &self.config,
            Backends {
                store: self.store.clone(),
                filter: filter.clone(),
                transports: self.transports,
                dns: self.dns,
            },
        )
        .expect("engine construction succeeds");
        Harness {
            engine,
            events,
            store: self.store,
            filter,
        }
    }
}

impl Harness {
    /// Wait until every job queued so far has run
    pub async fn settle(&self) {
        let handle = self
            .engine
            .allocate_address(IdentityKind::Server)
            .into_handle()
            .expect("queue open");
        tokio::time::timeout(Duration::from_secs(5), handle.wait())
            .await
            .expect("queue drains")
            .ok();
    }

    pub fn drain_events(&mut self) -> Vec<EngineEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }
}

pub fn server_address(n: u8) -> Ipv4Addr {
    Ipv4Addr::new(100, SUBNET_KEY as u8, 224, 4 * n + 2)
}

pub fn device_address(n: u8) -> Ipv4Addr {
    Ipv4Addr::new(100, SUBNET_KEY as u8, 208, 4 * n + 2)
}

/// Persist an identity directly, bypassing admission
pub async fn seed(
    store: &dyn HubStore,
    kind: IdentityKind,
    uuid: &str,
    address: Ipv4Addr,
    connected: bool,
) -> Identity {
    let mut identity = Identity::new(kind, uuid, format!("{}.{}", uuid, DOMAIN), address);
    if connected {
        identity.mark_connected(chrono::Utc::now());
    }
    store.save_identity(identity).await.expect("seed identity")
}

/// Poll `condition` until it holds or two seconds pass
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
