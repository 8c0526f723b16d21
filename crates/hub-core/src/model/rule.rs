// # Access rules and policies
//
// A Rule names who may send traffic (sources) and what traffic
// (protocol and ports). A Policy names where that traffic may go
// (target servers) and which rules apply.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use super::Id;
use super::portspec::PortSpec;
use crate::error::{Error, Result};

/// Destination protocol of a rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
    Any,
}

impl Protocol {
    /// TCP and UDP rules must carry ports; others must not
    pub fn requires_ports(&self) -> bool {
        matches!(self, Protocol::Tcp | Protocol::Udp)
    }

    /// Protocol name for a packet-filter match, `None` for ANY
    pub fn filter_name(&self) -> Option<&'static str> {
        match self {
            Protocol::Tcp => Some("tcp"),
            Protocol::Udp => Some("udp"),
            Protocol::Icmp => Some("icmp"),
            Protocol::Any => None,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.filter_name().unwrap_or("any"))
    }
}

/// An access rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    #[serde(default)]
    pub id: Id,
    pub name: String,
    /// Explicit user devices
    #[serde(default)]
    pub source_users: BTreeSet<Id>,
    /// Device groups
    #[serde(default)]
    pub source_groups: BTreeSet<Id>,
    #[serde(default)]
    pub source_servers: BTreeSet<Id>,
    #[serde(default)]
    pub source_servergroups: BTreeSet<Id>,
    pub destination_protocol: Protocol,
    #[serde(default)]
    pub destination_ports: PortSpec,
}

impl Rule {
    pub fn new(name: impl Into<String>, protocol: Protocol, ports: PortSpec) -> Self {
        Self {
            id: 0,
            name: name.into(),
            source_users: BTreeSet::new(),
            source_groups: BTreeSet::new(),
            source_servers: BTreeSet::new(),
            source_servergroups: BTreeSet::new(),
            destination_protocol: protocol,
            destination_ports: ports,
        }
    }

    /// Check the protocol/ports invariant and the name
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::validation("rule name cannot be empty"));
        }
        let protocol = self.destination_protocol;
        match (protocol.requires_ports(), self.destination_ports.is_empty()) {
            (true, true) => Err(Error::validation(format!(
                "rule '{}': protocol {} requires destination ports",
                self.name, protocol
            ))),
            (false, false) => Err(Error::validation(format!(
                "rule '{}': protocol {} does not accept destination ports",
                self.name, protocol
            ))),
            _ => Ok(()),
        }
    }

    /// Whether the rule draws sources from the given group
    pub fn references_group(&self, group: Id) -> bool {
        self.source_groups.contains(&group) || self.source_servergroups.contains(&group)
    }
}

/// An access policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    #[serde(default)]
    pub id: Id,
    pub name: String,
    #[serde(default)]
    pub rules: BTreeSet<Id>,
    #[serde(default)]
    pub target_servers: BTreeSet<Id>,
    #[serde(default)]
    pub target_servergroups: BTreeSet<Id>,
}

impl Policy {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: 0,
            name: name.into(),
            rules: BTreeSet::new(),
            target_servers: BTreeSet::new(),
            target_servergroups: BTreeSet::new(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::validation("policy name cannot be empty"));
        }
        Ok(())
    }
}
