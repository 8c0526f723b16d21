// # Memory Store
//
// In-memory implementation of HubStore.
//
// ## Purpose
//
// Fast store without persistence. Used by tests and by one-shot
// administrative runs that rebuild packet-filter state from a snapshot.
//
// ## Crash Behavior
//
// - All state is lost on restart
// - Connection flags are rebuilt by the first reconciliation cycle

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::snapshot::Snapshot;
use crate::error::Result;
use crate::model::{
    AccessConfig, ConnectionState, Group, Id, Identity, IdentityKind, Policy, Rule,
};
use crate::traits::HubStore;

/// In-memory hub store
///
/// Clones share the same underlying snapshot.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<Snapshot>>,
}

impl MemoryStore {
    /// Create a store holding only the reserved groups
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store from an existing snapshot
    pub fn from_snapshot(snapshot: Snapshot) -> Self {
        Self {
            inner: Arc::new(RwLock::new(snapshot)),
        }
    }

    /// Copy of the current snapshot
    pub async fn snapshot(&self) -> Snapshot {
        self.inner.read().await.clone()
    }
}

#[async_trait]
impl HubStore for MemoryStore {
    async fn identities(&self) -> Result<Vec<Identity>> {
        Ok(self.inner.read().await.identities())
    }

    async fn identity(&self, id: Id) -> Result<Option<Identity>> {
        Ok(self.inner.read().await.identity(id))
    }

    async fn identity_by_uuid(&self, kind: IdentityKind, uuid: &str) -> Result<Option<Identity>> {
        Ok(self.inner.read().await.identity_by_uuid(kind, uuid))
    }

    async fn save_identity(&self, identity: Identity) -> Result<Identity> {
        self.inner.write().await.save_identity(identity)
    }

    async fn set_connection_states(&self, states: &[ConnectionState]) -> Result<usize> {
        Ok(self.inner.write().await.set_connection_states(states))
    }

    async fn set_membership(
        &self,
        group_id: Id,
        identity_id: Id,
        member: bool,
    ) -> Result<(Identity, bool)> {
        self.inner.write().await.set_membership(group_id, identity_id, member)
    }

    async fn delete_identity(&self, id: Id) -> Result<Option<Identity>> {
        Ok(self.inner.write().await.delete_identity(id))
    }

    async fn groups(&self) -> Result<Vec<Group>> {
        Ok(self.inner.read().await.groups())
    }

    async fn group(&self, id: Id) -> Result<Option<Group>> {
        Ok(self.inner.read().await.group(id))
    }

    async fn save_group(&self, group: Group) -> Result<Group> {
        self.inner.write().await.save_group(group)
    }

    async fn delete_group(&self, id: Id) -> Result<Option<Group>> {
        self.inner.write().await.delete_group(id)
    }

    async fn rules(&self) -> Result<Vec<Rule>> {
        Ok(self.inner.read().await.rules())
    }

    async fn rule(&self, id: Id) -> Result<Option<Rule>> {
        Ok(self.inner.read().await.rule(id))
    }

    async fn save_rule(&self, rule: Rule) -> Result<Rule> {
        self.inner.write().await.save_rule(rule)
    }

    async fn delete_rule(&self, id: Id) -> Result<Option<Rule>> {
        Ok(self.inner.write().await.delete_rule(id))
    }

    async fn policies(&self) -> Result<Vec<Policy>> {
        Ok(self.inner.read().await.policies())
    }

    async fn policy(&self, id: Id) -> Result<Option<Policy>> {
        Ok(self.inner.read().await.policy(id))
    }

    async fn save_policy(&self, policy: Policy) -> Result<Policy> {
        self.inner.write().await.save_policy(policy)
    }

    async fn delete_policy(&self, id: Id) -> Result<Option<Policy>> {
        Ok(self.inner.write().await.delete_policy(id))
    }

    async fn access_config(&self) -> Result<AccessConfig> {
        Ok(self.inner.read().await.access_config())
    }

    async fn save_access_config(&self, config: AccessConfig) -> Result<()> {
        self.inner.write().await.set_access_config(config);
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        // Nothing to flush for in-memory store
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[tokio::test]
    async fn test_memory_store_basic() {
        let store = MemoryStore::new();
        assert!(store.identities().await.unwrap().is_empty());
        assert_eq!(store.groups().await.unwrap().len(), 2);

        let saved = store
            .save_identity(Identity::new(
                IdentityKind::UserDevice,
                "dev-1",
                "laptop.hub.example",
                Ipv4Addr::new(100, 7, 208, 2),
            ))
            .await
            .unwrap();

        let found = store
            .identity_by_uuid(IdentityKind::UserDevice, "dev-1")
            .await
            .unwrap();
        assert_eq!(found, Some(saved.clone()));
        assert!(
            store
                .identity_by_uuid(IdentityKind::Server, "dev-1")
                .await
                .unwrap()
                .is_none()
        );

        assert_eq!(store.delete_identity(saved.id).await.unwrap(), Some(saved));
        assert!(store.identities().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let store = MemoryStore::new();
        let other = store.clone();
        let mut access = AccessConfig::default();
        access.discovery_mode = false;
        store.save_access_config(access).await.unwrap();
        assert!(!other.access_config().await.unwrap().discovery_mode);
    }
}
