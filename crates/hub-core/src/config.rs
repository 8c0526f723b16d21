//! Configuration types for the overlay hub
//!
//! Every structure here is plain serde; `hubd` fills [`HubConfig`] from
//! the environment and calls [`HubConfig::validate`] before starting.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::model::IdentityKind;
use crate::pool::SubnetKey;

/// Main hub configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfig {
    /// Second octet of the overlay subnet; required
    pub subnet_key: SubnetKey,

    /// Zone suffix appended to derived hostnames
    pub domain: String,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub transports: TransportsConfig,

    #[serde(default)]
    pub dns: DnsConfig,

    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub firewall: FirewallConfig,

    /// Unix socket accepting control requests
    #[serde(default = "default_control_socket")]
    pub control_socket: PathBuf,
}

impl HubConfig {
    /// Configuration with defaults for everything but the key and domain
    pub fn new(subnet_key: SubnetKey, domain: impl Into<String>) -> Self {
        Self {
            subnet_key,
            domain: domain.into(),
            store: StoreConfig::default(),
            transports: TransportsConfig::default(),
            dns: DnsConfig::default(),
            engine: EngineConfig::default(),
            firewall: FirewallConfig::default(),
            control_socket: default_control_socket(),
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        let domain = self.domain.trim_matches('.');
        if domain.is_empty() {
            return Err(Error::config("domain cannot be empty"));
        }
        if domain.split('.').any(|label| label.is_empty() || label.len() > 63) {
            return Err(Error::config(format!("invalid domain '{}'", self.domain)));
        }

        self.store.validate()?;
        self.transports.validate()?;
        self.dns.validate()?;

        if self.engine.reconcile_interval_secs == 0 {
            return Err(Error::config("reconcile interval must be > 0"));
        }
        if self.firewall.iptables_path.trim().is_empty() {
            return Err(Error::config("iptables path cannot be empty"));
        }
        Ok(())
    }
}

/// Persistence backend
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StoreConfig {
    /// In-memory store (not persistent)
    #[default]
    Memory,

    /// JSON snapshot file
    File {
        /// Path to the state file
        path: PathBuf,
    },
}

impl StoreConfig {
    pub fn validate(&self) -> Result<()> {
        match self {
            StoreConfig::File { path } if path.as_os_str().is_empty() => {
                Err(Error::config("store file path cannot be empty"))
            }
            _ => Ok(()),
        }
    }
}

/// One management interface per peer class
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransportsConfig {
    #[serde(default)]
    pub servers: Option<ManagementConfig>,

    #[serde(default)]
    pub users: Option<ManagementConfig>,
}

impl TransportsConfig {
    /// Configured transports with the kind each one serves
    pub fn configured(&self) -> Vec<(IdentityKind, &ManagementConfig)> {
        let mut out = Vec::new();
        if let Some(servers) = &self.servers {
            out.push((IdentityKind::Server, servers));
        }
        if let Some(users) = &self.users {
            out.push((IdentityKind::UserDevice, users));
        }
        out
    }

    pub fn validate(&self) -> Result<()> {
        for (kind, transport) in self.configured() {
            if transport.timeout_secs == 0 {
                return Err(Error::config(format!(
                    "{} management timeout must be > 0",
                    kind
                )));
            }
        }
        Ok(())
    }
}

/// Management interface of one VPN transport
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagementConfig {
    pub endpoint: ManagementEndpoint,

    /// Answer to the interface's password prompt
    #[serde(default)]
    pub password: Option<Secret>,

    /// Bound on one connect/command/disconnect round-trip
    #[serde(default = "default_management_timeout_secs")]
    pub timeout_secs: u64,
}

impl ManagementConfig {
    pub fn new(endpoint: ManagementEndpoint) -> Self {
        Self {
            endpoint,
            password: None,
            timeout_secs: default_management_timeout_secs(),
        }
    }
}

/// Where a management interface listens
///
/// Written as `unix:/path`, a bare absolute path, `tcp:host:port` or
/// `host:port`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ManagementEndpoint {
    Tcp { address: String },
    Unix { path: PathBuf },
}

impl FromStr for ManagementEndpoint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if let Some(path) = s.strip_prefix("unix:") {
            if path.is_empty() {
                return Err(Error::config("unix endpoint needs a path"));
            }
            return Ok(ManagementEndpoint::Unix { path: path.into() });
        }
        if s.starts_with('/') {
            return Ok(ManagementEndpoint::Unix { path: s.into() });
        }

        let address = s.strip_prefix("tcp:").unwrap_or(s);
        match address.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {
                Ok(ManagementEndpoint::Tcp {
                    address: address.to_string(),
                })
            }
            _ => Err(Error::config(format!(
                "invalid management endpoint '{}', expected host:port or unix:/path",
                s
            ))),
        }
    }
}

impl TryFrom<String> for ManagementEndpoint {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<ManagementEndpoint> for String {
    fn from(endpoint: ManagementEndpoint) -> Self {
        endpoint.to_string()
    }
}

impl fmt::Display for ManagementEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ManagementEndpoint::Tcp { address } => write!(f, "tcp:{}", address),
            ManagementEndpoint::Unix { path } => write!(f, "unix:{}", path.display()),
        }
    }
}

/// DNS zone backend
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DnsConfig {
    /// No zone; connection flags are still reconciled
    #[default]
    Disabled,

    /// In-process zone (tests, dry runs)
    Memory,

    /// Remote zone HTTP API
    Http {
        /// API base URL; records live under `{url}/zone/records`
        url: String,
        api_key: Secret,
        #[serde(default = "default_dns_timeout_secs")]
        timeout_secs: u64,
    },
}

impl DnsConfig {
    pub fn validate(&self) -> Result<()> {
        match self {
            DnsConfig::Http {
                url,
                api_key,
                timeout_secs,
            } => {
                if !(url.starts_with("http://") || url.starts_with("https://")) {
                    return Err(Error::config(format!("invalid zone API url '{}'", url)));
                }
                if api_key.expose().is_empty() {
                    return Err(Error::config("zone API key cannot be empty"));
                }
                if *timeout_secs == 0 {
                    return Err(Error::config("zone API timeout must be > 0"));
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            DnsConfig::Disabled => "disabled",
            DnsConfig::Memory => "memory",
            DnsConfig::Http { .. } => "http",
        }
    }
}

/// Engine timers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Seconds between scheduled reconciliation cycles
    #[serde(default = "default_reconcile_interval_secs")]
    pub reconcile_interval_secs: u64,

    /// Seconds between full zone syncs; 0 disables them
    #[serde(default = "default_inventory_interval_secs")]
    pub inventory_interval_secs: u64,

    /// Capacity of the outbound engine event channel
    ///
    /// When full, events are dropped with a warning.
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            reconcile_interval_secs: default_reconcile_interval_secs(),
            inventory_interval_secs: default_inventory_interval_secs(),
            event_channel_capacity: default_event_channel_capacity(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirewallConfig {
    #[serde(default = "default_iptables_path")]
    pub iptables_path: String,

    /// Run `init(false)` when the engine starts
    #[serde(default = "default_true")]
    pub init_on_start: bool,
}

impl Default for FirewallConfig {
    fn default() -> Self {
        Self {
            iptables_path: default_iptables_path(),
            init_on_start: true,
        }
    }
}

/// A credential that never shows up in logs
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

/// Control socket path when none is configured
pub const DEFAULT_CONTROL_SOCKET: &str = "/run/overlay-hub/control.sock";

fn default_control_socket() -> PathBuf {
    PathBuf::from(DEFAULT_CONTROL_SOCKET)
}

fn default_management_timeout_secs() -> u64 {
    5
}

fn default_dns_timeout_secs() -> u64 {
    10
}

fn default_reconcile_interval_secs() -> u64 {
    60
}

fn default_inventory_interval_secs() -> u64 {
    300
}

fn default_event_channel_capacity() -> usize {
    1000
}

fn default_iptables_path() -> String {
    "iptables".to_string()
}

fn default_true() -> bool {
    true
}
