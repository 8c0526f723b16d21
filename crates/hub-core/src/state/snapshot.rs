// # Store Snapshot
//
// The complete persisted model and the constraint checks shared by every
// store backend. Backends wrap a `Snapshot` in a lock; `FileStore` also
// serializes it to disk after each mutation.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::error::{Error, Result};
use crate::model::{
    AccessConfig, ConnectionState, Group, Id, Identity, IdentityKind, Policy, Rule,
};

/// Persisted hub model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    next_id: Id,
    identities: BTreeMap<Id, Identity>,
    groups: BTreeMap<Id, Group>,
    rules: BTreeMap<Id, Rule>,
    policies: BTreeMap<Id, Policy>,
    #[serde(default)]
    access: AccessConfig,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self::new()
    }
}

impl Snapshot {
    /// Empty model containing only the reserved groups
    pub fn new() -> Self {
        let mut snapshot = Self {
            next_id: 1,
            identities: BTreeMap::new(),
            groups: BTreeMap::new(),
            rules: BTreeMap::new(),
            policies: BTreeMap::new(),
            access: AccessConfig::default(),
        };
        snapshot.ensure_reserved_groups();
        snapshot
    }

    /// Recreate missing reserved groups (e.g. after loading an old file)
    pub fn ensure_reserved_groups(&mut self) {
        for kind in IdentityKind::ALL {
            if self.reserved_group_id(kind).is_none() {
                let id = self.allocate_id();
                let mut group = Group::new(kind, kind.reserved_group());
                group.id = id;
                self.groups.insert(id, group);
            }
        }
    }

    fn allocate_id(&mut self) -> Id {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn reserved_group_id(&self, kind: IdentityKind) -> Option<Id> {
        self.groups
            .values()
            .find(|g| g.kind == kind && g.is_reserved())
            .map(|g| g.id)
    }

    // --- identities ---

    pub fn identities(&self) -> Vec<Identity> {
        self.identities.values().cloned().collect()
    }

    pub fn identity(&self, id: Id) -> Option<Identity> {
        self.identities.get(&id).cloned()
    }

    pub fn identity_by_uuid(&self, kind: IdentityKind, uuid: &str) -> Option<Identity> {
        self.identities
            .values()
            .find(|i| i.kind == kind && i.uuid == uuid)
            .cloned()
    }

    pub fn save_identity(&mut self, mut identity: Identity) -> Result<Identity> {
        if identity.uuid.trim().is_empty() {
            return Err(Error::validation("identity uuid cannot be empty"));
        }
        if identity.fqdn.trim().is_empty() {
            return Err(Error::validation("identity fqdn cannot be empty"));
        }

        let reserved = self.reserved_group_id(identity.kind).ok_or_else(|| {
            Error::store(format!("reserved group for {} is missing", identity.kind))
        })?;

        let inserting = identity.id == 0;
        if !inserting {
            let existing = self
                .identities
                .get(&identity.id)
                .ok_or_else(|| Error::not_found(format!("identity {}", identity.id)))?;
            if existing.kind != identity.kind {
                return Err(Error::validation(format!(
                    "identity {} cannot change kind",
                    identity.id
                )));
            }
            if existing.uuid == identity.uuid && existing.ipv4_address != identity.ipv4_address {
                return Err(Error::validation(format!(
                    "identity {} address is bound to its uuid and cannot change",
                    identity.id
                )));
            }
            if !identity.groups.contains(&reserved) {
                return Err(Error::validation(format!(
                    "identity {} cannot be removed from reserved group '{}'",
                    identity.id,
                    identity.kind.reserved_group()
                )));
            }
        } else {
            identity.groups.insert(reserved);
        }

        for other in self.identities.values().filter(|o| o.id != identity.id) {
            if other.kind == identity.kind && other.uuid == identity.uuid {
                return Err(Error::validation(format!(
                    "uuid '{}' is already registered",
                    identity.uuid
                )));
            }
            if other.fqdn.eq_ignore_ascii_case(&identity.fqdn) {
                return Err(Error::validation(format!(
                    "fqdn '{}' is already in use",
                    identity.fqdn
                )));
            }
            if other.kind == identity.kind && other.ipv4_address == identity.ipv4_address {
                return Err(Error::validation(format!(
                    "address {} is already assigned",
                    identity.ipv4_address
                )));
            }
        }

        for group_id in &identity.groups {
            self.require_group(*group_id, identity.kind)?;
        }

        if inserting {
            identity.id = self.allocate_id();
        }
        self.identities.insert(identity.id, identity.clone());
        Ok(identity)
    }

    /// Patch connection fields in place; vanished ids are skipped
    pub fn set_connection_states(&mut self, states: &[ConnectionState]) -> usize {
        let mut patched = 0;
        for state in states {
            if let Some(identity) = self.identities.get_mut(&state.id) {
                state.apply_to(identity);
                patched += 1;
            }
        }
        patched
    }

    pub fn set_membership(
        &mut self,
        group_id: Id,
        identity_id: Id,
        member: bool,
    ) -> Result<(Identity, bool)> {
        let group = self
            .groups
            .get(&group_id)
            .ok_or_else(|| Error::not_found(format!("group {}", group_id)))?;
        let identity = self
            .identities
            .get_mut(&identity_id)
            .ok_or_else(|| Error::not_found(format!("identity {}", identity_id)))?;

        if group.kind != identity.kind {
            return Err(Error::validation(format!(
                "{} {} cannot join {} group '{}'",
                identity.kind, identity.id, group.kind, group.name
            )));
        }
        if !member && group.is_reserved() {
            return Err(Error::validation(format!(
                "members cannot be removed from reserved group '{}'",
                group.name
            )));
        }

        let changed = if member {
            identity.groups.insert(group_id)
        } else {
            identity.groups.remove(&group_id)
        };
        Ok((identity.clone(), changed))
    }

    pub fn delete_identity(&mut self, id: Id) -> Option<Identity> {
        let removed = self.identities.remove(&id)?;
        for rule in self.rules.values_mut() {
            rule.source_users.remove(&id);
            rule.source_servers.remove(&id);
        }
        for policy in self.policies.values_mut() {
            policy.target_servers.remove(&id);
        }
        Some(removed)
    }

    fn require_identity(&self, id: Id, kind: IdentityKind) -> Result<()> {
        match self.identities.get(&id) {
            Some(identity) if identity.kind == kind => Ok(()),
            Some(_) => Err(Error::validation(format!("identity {} is not a {}", id, kind))),
            None => Err(Error::validation(format!("identity {} does not exist", id))),
        }
    }

    // --- groups ---

    pub fn groups(&self) -> Vec<Group> {
        self.groups.values().cloned().collect()
    }

    pub fn group(&self, id: Id) -> Option<Group> {
        self.groups.get(&id).cloned()
    }

    pub fn save_group(&mut self, mut group: Group) -> Result<Group> {
        group.validate()?;

        if group.id != 0 {
            let existing = self
                .groups
                .get(&group.id)
                .ok_or_else(|| Error::not_found(format!("group {}", group.id)))?;
            if existing.kind != group.kind {
                return Err(Error::validation(format!("group {} cannot change kind", group.id)));
            }
            if existing.is_reserved() && existing.name != group.name {
                return Err(Error::validation(format!(
                    "reserved group '{}' cannot be renamed",
                    existing.name
                )));
            }
        }

        if self
            .groups
            .values()
            .any(|g| g.id != group.id && g.kind == group.kind && g.name == group.name)
        {
            return Err(Error::validation(format!(
                "group name '{}' is already in use",
                group.name
            )));
        }

        if group.id == 0 {
            group.id = self.allocate_id();
        }
        self.groups.insert(group.id, group.clone());
        Ok(group)
    }

    pub fn delete_group(&mut self, id: Id) -> Result<Option<Group>> {
        match self.groups.get(&id) {
            None => return Ok(None),
            Some(group) if group.is_reserved() => {
                return Err(Error::validation(format!(
                    "reserved group '{}' cannot be deleted",
                    group.name
                )));
            }
            Some(_) => {}
        }

        let removed = self.groups.remove(&id);
        for identity in self.identities.values_mut() {
            identity.groups.remove(&id);
        }
        for rule in self.rules.values_mut() {
            rule.source_groups.remove(&id);
            rule.source_servergroups.remove(&id);
        }
        for policy in self.policies.values_mut() {
            policy.target_servergroups.remove(&id);
        }
        Ok(removed)
    }

    fn require_group(&self, id: Id, kind: IdentityKind) -> Result<()> {
        match self.groups.get(&id) {
            Some(group) if group.kind == kind => Ok(()),
            Some(group) => Err(Error::validation(format!(
                "group '{}' does not hold {} identities",
                group.name, kind
            ))),
            None => Err(Error::validation(format!("group {} does not exist", id))),
        }
    }

    // --- rules ---

    pub fn rules(&self) -> Vec<Rule> {
        self.rules.values().cloned().collect()
    }

    pub fn rule(&self, id: Id) -> Option<Rule> {
        self.rules.get(&id).cloned()
    }

    pub fn save_rule(&mut self, mut rule: Rule) -> Result<Rule> {
        rule.validate()?;
        if rule.id != 0 && !self.rules.contains_key(&rule.id) {
            return Err(Error::not_found(format!("rule {}", rule.id)));
        }
        if self.rules.values().any(|r| r.id != rule.id && r.name == rule.name) {
            return Err(Error::validation(format!("rule name '{}' is already in use", rule.name)));
        }
        for id in &rule.source_users {
            self.require_identity(*id, IdentityKind::UserDevice)?;
        }
        for id in &rule.source_servers {
            self.require_identity(*id, IdentityKind::Server)?;
        }
        for id in &rule.source_groups {
            self.require_group(*id, IdentityKind::UserDevice)?;
        }
        for id in &rule.source_servergroups {
            self.require_group(*id, IdentityKind::Server)?;
        }

        if rule.id == 0 {
            rule.id = self.allocate_id();
        }
        self.rules.insert(rule.id, rule.clone());
        Ok(rule)
    }

    pub fn delete_rule(&mut self, id: Id) -> Option<Rule> {
        let removed = self.rules.remove(&id)?;
        for policy in self.policies.values_mut() {
            policy.rules.remove(&id);
        }
        Some(removed)
    }

    // --- policies ---

    pub fn policies(&self) -> Vec<Policy> {
        self.policies.values().cloned().collect()
    }

    pub fn policy(&self, id: Id) -> Option<Policy> {
        self.policies.get(&id).cloned()
    }

    pub fn save_policy(&mut self, mut policy: Policy) -> Result<Policy> {
        policy.validate()?;
        if policy.id != 0 && !self.policies.contains_key(&policy.id) {
            return Err(Error::not_found(format!("policy {}", policy.id)));
        }
        if self
            .policies
            .values()
            .any(|p| p.id != policy.id && p.name == policy.name)
        {
            return Err(Error::validation(format!(
                "policy name '{}' is already in use",
                policy.name
            )));
        }
        let missing: BTreeSet<_> = policy
            .rules
            .iter()
            .filter(|id| !self.rules.contains_key(id))
            .collect();
        if !missing.is_empty() {
            return Err(Error::validation(format!("rules {:?} do not exist", missing)));
        }
        for id in &policy.target_servers {
            self.require_identity(*id, IdentityKind::Server)?;
        }
        for id in &policy.target_servergroups {
            self.require_group(*id, IdentityKind::Server)?;
        }

        if policy.id == 0 {
            policy.id = self.allocate_id();
        }
        self.policies.insert(policy.id, policy.clone());
        Ok(policy)
    }

    pub fn delete_policy(&mut self, id: Id) -> Option<Policy> {
        self.policies.remove(&id)
    }

    // --- access ---

    pub fn access_config(&self) -> AccessConfig {
        self.access.clone()
    }

    pub fn set_access_config(&mut self, config: AccessConfig) {
        self.access = config;
    }
}
