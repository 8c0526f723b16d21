// # Environment configuration
//
// `hubd run` is configured through environment variables only:
//
// ### Addressing
// - `HUB_SUBNET_KEY`: second octet of the overlay subnet (required, 1-255)
// - `HUB_DOMAIN`: zone suffix for derived hostnames (required)
//
// ### State Store
// - `HUB_STORE_TYPE`: `memory` or `file` (default `file`)
// - `HUB_STORE_PATH`: state file (default `/var/lib/overlay-hub/state.json`)
//
// ### VPN Transports
// - `HUB_SERVERS_MANAGEMENT` / `HUB_USERS_MANAGEMENT`: management endpoint,
//   `host:port` or `unix:/path`; unset means the class is not reconciled
// - `HUB_SERVERS_MANAGEMENT_PASSWORD` / `HUB_USERS_MANAGEMENT_PASSWORD`
// - `HUB_MANAGEMENT_TIMEOUT_SECS`
//
// ### DNS Zone
// - `HUB_DNS_TYPE`: `disabled`, `memory` or `http` (default `disabled`)
// - `HUB_DNS_URL`, `HUB_DNS_API_KEY`, `HUB_DNS_TIMEOUT_SECS` (for http)
//
// ### Engine
// - `HUB_RECONCILE_INTERVAL_SECS`, `HUB_INVENTORY_INTERVAL_SECS`
// - `HUB_IPTABLES_PATH`, `HUB_FIREWALL_INIT_ON_START`
// - `HUB_CONTROL_SOCKET`
// - `HUB_LOG_LEVEL`: trace, debug, info, warn, error

use anyhow::{Context, Result, bail};
use hub_core::config::{
    DnsConfig, FirewallConfig, HubConfig, ManagementConfig, ManagementEndpoint, Secret,
    StoreConfig,
};
use hub_core::pool::SubnetKey;
use std::str::FromStr;
use tracing::Level;

const DEFAULT_STORE_PATH: &str = "/var/lib/overlay-hub/state.json";

/// Build a [`HubConfig`] from variables returned by `lookup`
pub fn load_config<F>(lookup: F) -> Result<HubConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

    let key: u16 = parse(&var, "HUB_SUBNET_KEY")?.context(
        "HUB_SUBNET_KEY is required. Set it via: export HUB_SUBNET_KEY=111",
    )?;
    let subnet_key = SubnetKey::new(key).context("HUB_SUBNET_KEY")?;
    let domain = var("HUB_DOMAIN")
        .context("HUB_DOMAIN is required. Set it via: export HUB_DOMAIN=hub.example.com")?;

    let mut config = HubConfig::new(subnet_key, domain.trim());

    config.store = match var("HUB_STORE_TYPE").as_deref().unwrap_or("file") {
        "memory" => StoreConfig::Memory,
        "file" => StoreConfig::File {
            path: var("HUB_STORE_PATH")
                .unwrap_or_else(|| DEFAULT_STORE_PATH.to_string())
                .into(),
        },
        other => bail!(
            "HUB_STORE_TYPE '{}' is not supported. Supported types: memory, file",
            other
        ),
    };

    let timeout: Option<u64> = parse(&var, "HUB_MANAGEMENT_TIMEOUT_SECS")?;
    let transport = |prefix: &str| -> Result<Option<ManagementConfig>> {
        let Some(endpoint) = var(format!("HUB_{}_MANAGEMENT", prefix).as_str()) else {
            return Ok(None);
        };
        let endpoint = ManagementEndpoint::from_str(&endpoint)
            .with_context(|| format!("HUB_{}_MANAGEMENT", prefix))?;
        let mut management = ManagementConfig::new(endpoint);
        management.password = var(format!("HUB_{}_MANAGEMENT_PASSWORD", prefix).as_str()).map(Secret::new);
        if let Some(secs) = timeout {
            management.timeout_secs = secs;
        }
        Ok(Some(management))
    };
    config.transports.servers = transport("SERVERS")?;
    config.transports.users = transport("USERS")?;

    config.dns = match var("HUB_DNS_TYPE").as_deref().unwrap_or("disabled") {
        "disabled" => DnsConfig::Disabled,
        "memory" => DnsConfig::Memory,
        "http" => DnsConfig::Http {
            url: var("HUB_DNS_URL").context("HUB_DNS_URL is required when HUB_DNS_TYPE=http")?,
            api_key: Secret::new(
                var("HUB_DNS_API_KEY")
                    .context("HUB_DNS_API_KEY is required when HUB_DNS_TYPE=http")?,
            ),
            timeout_secs: parse(&var, "HUB_DNS_TIMEOUT_SECS")?.unwrap_or(10),
        },
        other => bail!(
            "HUB_DNS_TYPE '{}' is not supported. Supported types: disabled, memory, http",
            other
        ),
    };

    if let Some(secs) = parse(&var, "HUB_RECONCILE_INTERVAL_SECS")? {
        config.engine.reconcile_interval_secs = secs;
    }
    if let Some(secs) = parse(&var, "HUB_INVENTORY_INTERVAL_SECS")? {
        config.engine.inventory_interval_secs = secs;
    }

    let defaults = FirewallConfig::default();
    config.firewall = FirewallConfig {
        iptables_path: var("HUB_IPTABLES_PATH").unwrap_or(defaults.iptables_path),
        init_on_start: parse(&var, "HUB_FIREWALL_INIT_ON_START")?
            .unwrap_or(defaults.init_on_start),
    };

    if let Some(path) = var("HUB_CONTROL_SOCKET") {
        config.control_socket = path.into();
    }

    config.validate()?;
    Ok(config)
}

/// Level named by `HUB_LOG_LEVEL`
pub fn log_level(value: Option<&str>) -> Result<Level> {
    match value.map(str::to_lowercase).as_deref() {
        None | Some("") | Some("info") => Ok(Level::INFO),
        Some("trace") => Ok(Level::TRACE),
        Some("debug") => Ok(Level::DEBUG),
        Some("warn") => Ok(Level::WARN),
        Some("error") => Ok(Level::ERROR),
        Some(other) => bail!(
            "HUB_LOG_LEVEL '{}' is not valid. Valid levels: trace, debug, info, warn, error",
            other
        ),
    }
}

fn parse<T, F>(var: &F, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match var(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("{} '{}' is invalid: {}", key, raw, e)),
    }
}
