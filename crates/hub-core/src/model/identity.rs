// # Identities and groups
//
// An identity is a server or user device registered to the overlay. Its
// `uuid` is the join credential and doubles as the VPN common name; its
// address is bound to the uuid for the lifetime of the identity.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::net::Ipv4Addr;

use super::Id;
use crate::error::{Error, Result};

/// Reserved group every server belongs to
pub const ALL_SERVERS: &str = "All Servers";

/// Reserved group every user device belongs to
pub const ALL_DEVICES: &str = "All Devices";

/// Peer class of an identity; each class has its own pool and transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityKind {
    Server,
    UserDevice,
}

impl IdentityKind {
    pub const ALL: [IdentityKind; 2] = [IdentityKind::Server, IdentityKind::UserDevice];

    /// Name of the reserved group for this kind
    pub fn reserved_group(&self) -> &'static str {
        match self {
            IdentityKind::Server => ALL_SERVERS,
            IdentityKind::UserDevice => ALL_DEVICES,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            IdentityKind::Server => "server",
            IdentityKind::UserDevice => "user_device",
        }
    }
}

impl fmt::Display for IdentityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A server or user device joined to the overlay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// Store-assigned id (0 until persisted)
    pub id: Id,
    pub kind: IdentityKind,
    /// Stable join credential, also the VPN common name
    pub uuid: String,
    pub fqdn: String,
    pub ipv4_address: Ipv4Addr,
    pub connected: bool,
    /// Set when a connected identity is observed gone; cleared on reconnect
    pub disconnected_since: Option<DateTime<Utc>>,
    /// Last reconciliation that observed this identity live
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
    /// Group memberships (device groups or server groups, matching `kind`)
    #[serde(default)]
    pub groups: BTreeSet<Id>,
}

impl Identity {
    /// A never-connected identity, not yet persisted
    pub fn new(
        kind: IdentityKind,
        uuid: impl Into<String>,
        fqdn: impl Into<String>,
        ipv4_address: Ipv4Addr,
    ) -> Self {
        Self {
            id: 0,
            kind,
            uuid: uuid.into(),
            fqdn: fqdn.into(),
            ipv4_address,
            connected: false,
            disconnected_since: None,
            last_seen: None,
            groups: BTreeSet::new(),
        }
    }

    /// Identifier the VPN transport reports for this identity
    pub fn vpn_identifier(&self) -> &str {
        &self.uuid
    }

    pub fn mark_connected(&mut self, now: DateTime<Utc>) {
        self.connected = true;
        self.disconnected_since = None;
        self.last_seen = Some(now);
    }

    pub fn mark_disconnected(&mut self, now: DateTime<Utc>) {
        self.connected = false;
        self.disconnected_since = Some(now);
    }

    pub fn connection_state(&self) -> ConnectionState {
        ConnectionState {
            id: self.id,
            connected: self.connected,
            disconnected_since: self.disconnected_since,
            last_seen: self.last_seen,
        }
    }
}

/// The fields of an identity owned by the reconciler
///
/// Written back without touching memberships, names or addresses, so
/// administrative edits made while a cycle runs are kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionState {
    pub id: Id,
    pub connected: bool,
    pub disconnected_since: Option<DateTime<Utc>>,
    pub last_seen: Option<DateTime<Utc>>,
}

impl ConnectionState {
    pub fn apply_to(&self, identity: &mut Identity) {
        identity.connected = self.connected;
        identity.disconnected_since = self.disconnected_since;
        identity.last_seen = self.last_seen;
    }
}

/// A named collection of identities of one kind
///
/// Device groups have kind `UserDevice`, server groups kind `Server`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    #[serde(default)]
    pub id: Id,
    pub name: String,
    pub kind: IdentityKind,
}

impl Group {
    pub fn new(kind: IdentityKind, name: impl Into<String>) -> Self {
        Self {
            id: 0,
            name: name.into(),
            kind,
        }
    }

    /// Whether this is the kind's "All Servers" / "All Devices" group
    pub fn is_reserved(&self) -> bool {
        self.name == self.kind.reserved_group()
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::validation("group name cannot be empty"));
        }
        Ok(())
    }
}

/// Join gate settings (singleton)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessConfig {
    /// When false, only known or whitelisted uuids may join
    pub discovery_mode: bool,
    #[serde(default)]
    pub uuid_blacklist: BTreeSet<String>,
    #[serde(default)]
    pub uuid_whitelist: BTreeSet<String>,
}

impl Default for AccessConfig {
    fn default() -> Self {
        Self {
            discovery_mode: true,
            uuid_blacklist: BTreeSet::new(),
            uuid_whitelist: BTreeSet::new(),
        }
    }
}

impl AccessConfig {
    pub fn is_blacklisted(&self, uuid: &str) -> bool {
        self.uuid_blacklist.contains(uuid)
    }

    pub fn is_whitelisted(&self, uuid: &str) -> bool {
        self.uuid_whitelist.contains(uuid)
    }
}
