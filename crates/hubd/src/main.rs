// # hubd - Overlay Hub Daemon
//
// A thin integration layer. All hub logic lives in `hub-core`; this binary:
// 1. Reads configuration from `HUB_*` environment variables (`env`)
// 2. Builds the iptables, OpenVPN and DNS backends and runs the engine
//    behind a Unix control socket (`daemon`)
// 3. Offers administrative subcommands and VPN script hooks that talk
//    to a running daemon through that socket (`client`, `hook`)
//
// ## Example
//
// ```bash
// export HUB_SUBNET_KEY=111
// export HUB_DOMAIN=hub.example.com
// export HUB_SERVERS_MANAGEMENT=unix:/run/openvpn/servers.sock
// export HUB_USERS_MANAGEMENT=unix:/run/openvpn/users.sock
// export HUB_STORE_PATH=/var/lib/overlay-hub/state.json
//
// hubd run
// hubd firewall sync
// hubd inventory show
// hubd rule save ssh-rule.json
// hubd member add 7 3
// ```
//
// ## Exit codes
//
// | code | meaning |
// |---|---|
// | 0 | success |
// | 1 | generic failure |
// | 2 | malformed input, exhausted pool |
// | 3 | management transport or DNS error |
// | 4 | configuration error |

mod cli;
mod client;
mod daemon;
mod env;
mod hook;

use anyhow::{Context, Result};
use clap::Parser;
use hub_core::config::HubConfig;
use hub_core::control::ControlRequest;
use hub_core::model::PortSpec;
use hub_core::{ErrorClass, Inventory, diff};
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::path::Path;
use std::process::ExitCode;
use tracing::{Level, error};
use tracing_subscriber::FmtSubscriber;

use cli::{
    Cli, Command, EntityAction, FirewallAction, HookCommand, IdentityAction, InventoryAction,
    MemberAction,
};
use client::ControlClient;

/// Process exit codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HubExitCode {
    Success = 0,
    Failure = 1,
    Invalid = 2,
    Transport = 3,
    Config = 4,
}

impl From<ErrorClass> for HubExitCode {
    fn from(class: ErrorClass) -> Self {
        match class {
            ErrorClass::Invalid => HubExitCode::Invalid,
            ErrorClass::Transport => HubExitCode::Transport,
            ErrorClass::Config => HubExitCode::Config,
            ErrorClass::Failure => HubExitCode::Failure,
        }
    }
}

impl From<HubExitCode> for ExitCode {
    fn from(code: HubExitCode) -> Self {
        ExitCode::from(code as u8)
    }
}

/// Exit code for an error that may wrap a [`hub_core::Error`]
fn exit_code(err: &anyhow::Error) -> HubExitCode {
    err.downcast_ref::<hub_core::Error>()
        .map_or(HubExitCode::Failure, |e| e.class().into())
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let log_level = if cli.debug {
        Level::DEBUG
    } else if cli.quiet {
        Level::ERROR
    } else {
        match env::log_level(std::env::var("HUB_LOG_LEVEL").ok().as_deref()) {
            Ok(level) => level,
            Err(e) => {
                eprintln!("Configuration error: {}", e);
                return HubExitCode::Config.into();
            }
        }
    };

    // stdout carries command output
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_writer(std::io::stderr)
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
        return HubExitCode::Config.into();
    }

    // The daemon refuses to start without a valid configuration
    let config = match cli.command {
        Command::Run => match env::load_config(|key| std::env::var(key).ok()) {
            Ok(config) => Some(config),
            Err(e) => {
                error!("Configuration error: {:#}", e);
                return HubExitCode::Config.into();
            }
        },
        _ => None,
    };

    let rt = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to create tokio runtime: {}", e);
            return HubExitCode::Failure.into();
        }
    };

    let client = ControlClient::new(&cli.socket);
    match rt.block_on(execute(cli.command, config, &client)) {
        Ok(()) => HubExitCode::Success.into(),
        Err(e) => {
            error!("{:#}", e);
            exit_code(&e).into()
        }
    }
}

async fn execute(command: Command, config: Option<HubConfig>, client: &ControlClient) -> Result<()> {
    let request = match command {
        Command::Run => {
            let config = config.context("configuration not loaded")?;
            return daemon::run_daemon(config).await;
        }
        Command::Diff { previous, current } => {
            let previous: Inventory = read_json(&previous)?;
            let current: Inventory = read_json(&current)?;
            let changes = diff(&previous, &current);
            return print(serde_json::to_value(changes)?);
        }
        Command::Portspec { spec } => {
            let spec = PortSpec::parse(&spec)?;
            return print(json!({
                "normalized": spec.to_string(),
                "multiport": spec.multiport_chunks(),
            }));
        }
        Command::Hook { hook } => {
            let lookup = |key: &str| std::env::var(key).ok();
            return match hook {
                HookCommand::Auth { kind } => hook::auth(client, kind.into(), lookup).await,
                HookCommand::Connect { kind, ccd_file } => {
                    hook::connect(client, kind.into(), &ccd_file, lookup).await
                }
                HookCommand::Disconnect { kind } => {
                    hook::disconnect(client, kind.into(), lookup).await
                }
            }
            .map_err(Into::into);
        }
        Command::Firewall { action } => match action {
            FirewallAction::Init { core_only } => ControlRequest::Init { core_only },
            FirewallAction::Teardown { full } => ControlRequest::Teardown { full },
            FirewallAction::Sync => ControlRequest::FullSync,
        },
        Command::Reconcile => ControlRequest::Reconcile,
        Command::Inventory { action } => match action {
            InventoryAction::Show => ControlRequest::ShowInventory,
            InventoryAction::Sync => ControlRequest::SyncInventory,
        },
        Command::Store => ControlRequest::ShowStore,
        Command::Rule { action } => match action {
            EntityAction::Save { file } => ControlRequest::SaveRule {
                rule: read_json(&file)?,
            },
            EntityAction::Delete { id } => ControlRequest::DeleteRule { id },
        },
        Command::Policy { action } => match action {
            EntityAction::Save { file } => ControlRequest::SavePolicy {
                policy: read_json(&file)?,
            },
            EntityAction::Delete { id } => ControlRequest::DeletePolicy { id },
        },
        Command::Group { action } => match action {
            EntityAction::Save { file } => ControlRequest::SaveGroup {
                group: read_json(&file)?,
            },
            EntityAction::Delete { id } => ControlRequest::DeleteGroup { id },
        },
        Command::Member { action } => match action {
            MemberAction::Add { group, identity } => ControlRequest::AddMember {
                group_id: group,
                identity_id: identity,
            },
            MemberAction::Remove { group, identity } => ControlRequest::RemoveMember {
                group_id: group,
                identity_id: identity,
            },
        },
        Command::Identity {
            action: IdentityAction::Delete { id },
        } => ControlRequest::DeleteIdentity { id },
        Command::Access { file } => ControlRequest::SaveAccessConfig {
            config: read_json(&file)?,
        },
    };

    print(client.request(&request).await?)
}

/// Read a JSON document from a file, or stdin for `-`
fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let data = if path == Path::new("-") {
        std::io::read_to_string(std::io::stdin())
    } else {
        std::fs::read_to_string(path)
    }
    .map_err(hub_core::Error::from)?;
    let value = serde_json::from_str(&data)
        .map_err(|e| hub_core::Error::validation(format!("{}: {}", path.display(), e)))?;
    Ok(value)
}

fn print(value: Value) -> Result<()> {
    if !value.is_null() {
        println!("{}", serde_json::to_string_pretty(&value)?);
    }
    Ok(())
}
