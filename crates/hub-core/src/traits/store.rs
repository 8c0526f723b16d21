// # Hub Store Trait
//
// Persistence for identities, groups, rules, policies and the access
// configuration. The store is the system of record the console writes to;
// the engine reads it when compiling and writes connection flags back.
//
// ## Guarantees expected from implementations
//
// - Ids are assigned on first save (entities with `id == 0`)
// - `uuid` is unique per kind, `fqdn` is unique, `ipv4_address` is
//   unique per kind; violations are `Error::Validation`
// - References (rule sources, policy targets, memberships) must point at
//   existing entities of the right kind
// - Every identity belongs to its kind's reserved group; new identities
//   are enrolled on insert, removal is rejected
// - Deleting an entity removes every reference to it
// - Connection flags and memberships are patched in place on the current
//   row, never written back from a copy read earlier
//
// ## Implementations
//
// - `MemoryStore`: no persistence
// - `FileStore`: JSON snapshot with atomic writes and backup recovery

use async_trait::async_trait;

use crate::error::Result;
use crate::model::{
    AccessConfig, ConnectionState, Group, Id, Identity, IdentityKind, Policy, Rule,
};

/// Trait for hub persistence backends
#[async_trait]
pub trait HubStore: Send + Sync {
    /// All identities ordered by id
    async fn identities(&self) -> Result<Vec<Identity>>;

    /// Identities of one kind ordered by id
    async fn identities_of(&self, kind: IdentityKind) -> Result<Vec<Identity>> {
        let mut all = self.identities().await?;
        all.retain(|i| i.kind == kind);
        Ok(all)
    }

    async fn identity(&self, id: Id) -> Result<Option<Identity>>;

    async fn identity_by_uuid(&self, kind: IdentityKind, uuid: &str) -> Result<Option<Identity>>;

    /// Insert (`id == 0`) or update an identity
    ///
    /// # Returns
    ///
    /// The stored identity with its id and memberships filled in.
    async fn save_identity(&self, identity: Identity) -> Result<Identity>;

    /// Patch the connection fields of existing identities as one write
    ///
    /// Every other field keeps its current stored value. Ids that no
    /// longer exist are skipped.
    ///
    /// # Returns
    ///
    /// The number of identities patched.
    async fn set_connection_states(&self, states: &[ConnectionState]) -> Result<usize>;

    /// Add (`member == true`) or remove one group membership
    ///
    /// # Returns
    ///
    /// The stored identity and whether its memberships changed.
    async fn set_membership(
        &self,
        group_id: Id,
        identity_id: Id,
        member: bool,
    ) -> Result<(Identity, bool)>;

    /// Delete an identity, returning it if it existed
    async fn delete_identity(&self, id: Id) -> Result<Option<Identity>>;

    async fn groups(&self) -> Result<Vec<Group>>;

    async fn group(&self, id: Id) -> Result<Option<Group>>;

    /// Insert or update a group; reserved groups cannot be renamed
    async fn save_group(&self, group: Group) -> Result<Group>;

    /// Delete a group; reserved groups cannot be deleted
    async fn delete_group(&self, id: Id) -> Result<Option<Group>>;

    async fn rules(&self) -> Result<Vec<Rule>>;

    async fn rule(&self, id: Id) -> Result<Option<Rule>>;

    async fn save_rule(&self, rule: Rule) -> Result<Rule>;

    async fn delete_rule(&self, id: Id) -> Result<Option<Rule>>;

    async fn policies(&self) -> Result<Vec<Policy>>;

    async fn policy(&self, id: Id) -> Result<Option<Policy>>;

    async fn save_policy(&self, policy: Policy) -> Result<Policy>;

    async fn delete_policy(&self, id: Id) -> Result<Option<Policy>>;

    async fn access_config(&self) -> Result<AccessConfig>;

    async fn save_access_config(&self, config: AccessConfig) -> Result<()>;

    /// Flush pending writes (called on shutdown)
    async fn flush(&self) -> Result<()>;
}
