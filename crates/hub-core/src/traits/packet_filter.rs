// # Packet Filter Trait
//
// Defines the interface to the kernel packet filter.
//
// ## Implementations
//
// - iptables: `hub-iptables` crate
// - In-memory: `hub_core::state::MemoryPacketFilter` (tests, dry runs)
//
// ## Model
//
// The hub only touches the `filter` table. It owns a set of named chains
// ("enforcement units") and the single jump from `FORWARD` into its main
// chain. Entries are typed [`FilterEntry`] values so that listing,
// deletion-by-match and insertion all speak the same language.

use async_trait::async_trait;
use ipnet::Ipv4Net;
use std::fmt;

use crate::error::Result;
use crate::model::Protocol;

/// The only table the hub manages
pub const FILTER_TABLE: &str = "filter";

/// What happens to a packet matching an entry
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Target {
    Accept,
    Drop,
    Return,
    /// Continue evaluation in another chain
    Jump(String),
}

impl Target {
    /// Parse the argument of `-j`
    pub fn parse(name: &str) -> Self {
        match name {
            "ACCEPT" => Target::Accept,
            "DROP" => Target::Drop,
            "RETURN" => Target::Return,
            other => Target::Jump(other.to_string()),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Accept => f.write_str("ACCEPT"),
            Target::Drop => f.write_str("DROP"),
            Target::Return => f.write_str("RETURN"),
            Target::Jump(chain) => f.write_str(chain),
        }
    }
}

/// One packet-filter entry
///
/// Only the matches the hub emits are modelled. Two entries are equal
/// exactly when the packet filter would consider them the same rule for
/// deletion-by-match.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FilterEntry {
    pub source: Option<Ipv4Net>,
    pub destination: Option<Ipv4Net>,
    pub protocol: Option<Protocol>,
    /// Multiport destination list in filter syntax (`80,443,8000:8080`)
    pub dports: Option<String>,
    /// Conntrack states (`RELATED,ESTABLISHED`)
    pub ctstate: Option<String>,
    pub comment: Option<String>,
    pub target: Target,
}

impl FilterEntry {
    /// An entry matching everything
    pub fn new(target: Target) -> Self {
        Self {
            source: None,
            destination: None,
            protocol: None,
            dports: None,
            ctstate: None,
            comment: None,
            target,
        }
    }

    pub fn source(mut self, net: Ipv4Net) -> Self {
        self.source = Some(net);
        self
    }

    pub fn destination(mut self, net: Ipv4Net) -> Self {
        self.destination = Some(net);
        self
    }

    /// Protocol match; `Protocol::Any` clears it
    pub fn protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = match protocol {
            Protocol::Any => None,
            other => Some(other),
        };
        self
    }

    pub fn dports(mut self, ports: impl Into<String>) -> Self {
        self.dports = Some(ports.into());
        self
    }

    pub fn ctstate(mut self, states: impl Into<String>) -> Self {
        self.ctstate = Some(states.into());
        self
    }

    pub fn comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    /// Rule specification arguments in iptables order, ending with `-j`
    pub fn to_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(src) = &self.source {
            args.extend(["-s".to_string(), src.to_string()]);
        }
        if let Some(dst) = &self.destination {
            args.extend(["-d".to_string(), dst.to_string()]);
        }
        if let Some(name) = self.protocol.and_then(|p| p.filter_name()) {
            args.extend(["-p".to_string(), name.to_string()]);
        }
        if let Some(ports) = &self.dports {
            args.extend([
                "-m".to_string(),
                "multiport".to_string(),
                "--dports".to_string(),
                ports.clone(),
            ]);
        }
        if let Some(states) = &self.ctstate {
            args.extend([
                "-m".to_string(),
                "conntrack".to_string(),
                "--ctstate".to_string(),
                states.clone(),
            ]);
        }
        if let Some(comment) = &self.comment {
            args.extend([
                "-m".to_string(),
                "comment".to_string(),
                "--comment".to_string(),
                comment.clone(),
            ]);
        }
        args.extend(["-j".to_string(), self.target.to_string()]);
        args
    }
}

impl fmt::Display for FilterEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_args().join(" "))
    }
}

/// Trait for packet-filter backends
///
/// All methods operate on the `filter` table. Backends execute exactly
/// what they are asked; ordering and idempotency are owned by the
/// firewall compiler, which is only ever driven from the job queue.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync`, but callers never issue
/// concurrent mutations.
#[async_trait]
pub trait PacketFilter: Send + Sync {
    /// List user-defined chains
    async fn list_chains(&self) -> Result<Vec<String>>;

    /// Whether a chain exists
    async fn chain_exists(&self, chain: &str) -> Result<bool> {
        Ok(self.list_chains().await?.iter().any(|c| c == chain))
    }

    /// Create an empty chain; fails if it already exists
    async fn create_chain(&self, chain: &str) -> Result<()>;

    /// Remove every entry from a chain
    async fn flush_chain(&self, chain: &str) -> Result<()>;

    /// Delete an empty, unreferenced chain
    async fn delete_chain(&self, chain: &str) -> Result<()>;

    /// Entries of a chain in evaluation order
    ///
    /// # Parameters
    ///
    /// - `chain`: a user-defined chain or a builtin such as `FORWARD`
    async fn list_entries(&self, chain: &str) -> Result<Vec<FilterEntry>>;

    /// Insert an entry at the head of a chain
    async fn insert_entry(&self, chain: &str, entry: &FilterEntry) -> Result<()>;

    /// Append an entry at the tail of a chain
    async fn append_entry(&self, chain: &str, entry: &FilterEntry) -> Result<()>;

    /// Delete the first entry equal to `entry`
    async fn delete_entry(&self, chain: &str, entry: &FilterEntry) -> Result<()>;

    /// Whether an entry equal to `entry` exists in the chain
    async fn has_entry(&self, chain: &str, entry: &FilterEntry) -> Result<bool> {
        Ok(self.list_entries(chain).await?.contains(entry))
    }

    /// Backend name (for logging)
    fn backend_name(&self) -> &'static str;
}
