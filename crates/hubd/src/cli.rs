//! CLI argument parsing with clap.

use clap::{Parser, Subcommand};
use hub_core::config::DEFAULT_CONTROL_SOCKET;
use hub_core::model::{Id, IdentityKind};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "hubd")]
#[command(version, about = "Overlay network hub daemon")]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Control socket of the running daemon
    #[arg(long, env = "HUB_CONTROL_SOCKET", default_value = DEFAULT_CONTROL_SOCKET, global = true)]
    pub socket: PathBuf,

    /// Debug output
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    pub debug: bool,

    /// Errors only
    #[arg(short, long, global = true)]
    pub quiet: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the daemon (configuration from HUB_* environment variables)
    Run,

    /// Manage the packet-filter rule set
    Firewall {
        #[command(subcommand)]
        action: FirewallAction,
    },

    /// Run one reconciliation cycle now
    Reconcile,

    /// Inspect or synchronize the DNS zone
    Inventory {
        #[command(subcommand)]
        action: InventoryAction,
    },

    /// Print the changeset between two JSON `{fqdn: address}` files
    Diff {
        previous: PathBuf,
        current: PathBuf,
    },

    /// Validate and normalize a destination port spec
    Portspec {
        /// e.g. "22, 80, 8000-8080"
        spec: String,
    },

    /// Print every persisted identity, group, rule and policy
    Store,

    /// Create, update or delete access rules
    Rule {
        #[command(subcommand)]
        action: EntityAction,
    },

    /// Create, update or delete access policies
    Policy {
        #[command(subcommand)]
        action: EntityAction,
    },

    /// Create, update or delete device and server groups
    Group {
        #[command(subcommand)]
        action: EntityAction,
    },

    /// Add or remove group members
    Member {
        #[command(subcommand)]
        action: MemberAction,
    },

    /// Remove a registered identity
    Identity {
        #[command(subcommand)]
        action: IdentityAction,
    },

    /// Replace the join gate (discovery mode, uuid blacklist and whitelist)
    Access {
        /// JSON file, `-` for stdin
        file: PathBuf,
    },

    /// Entry points for the VPN server's script hooks
    Hook {
        #[command(subcommand)]
        hook: HookCommand,
    },
}

#[derive(Debug, Subcommand)]
pub enum FirewallAction {
    /// Build the chain skeleton, then resync everything
    Init {
        /// Only build the skeleton
        #[arg(long)]
        core_only: bool,
    },

    /// Restore the skeleton, or remove every hub chain with --full
    Teardown {
        #[arg(long)]
        full: bool,
    },

    /// Rebuild every rule and policy from the store
    Sync,
}

#[derive(Debug, Subcommand)]
pub enum InventoryAction {
    /// Print desired and live zone records
    Show,
    /// Push the desired zone to the DNS backend
    Sync,
}

#[derive(Debug, Subcommand)]
pub enum EntityAction {
    /// Insert (no `id`) or update from a JSON document
    Save {
        /// JSON file, `-` for stdin
        file: PathBuf,
    },
    Delete { id: Id },
}

#[derive(Debug, Subcommand)]
pub enum MemberAction {
    Add { group: Id, identity: Id },
    /// Members of the reserved groups cannot be removed
    Remove { group: Id, identity: Id },
}

#[derive(Debug, Subcommand)]
pub enum IdentityAction {
    Delete { id: Id },
}

/// Peer class as written on the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum KindArg {
    Server,
    User,
}

impl From<KindArg> for IdentityKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Server => IdentityKind::Server,
            KindArg::User => IdentityKind::UserDevice,
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum HookCommand {
    /// Admission gate (`auth-user-pass-verify ... via-env`)
    Auth {
        #[arg(value_enum)]
        kind: KindArg,
    },

    /// Write the client config and mark the peer connected (`client-connect`)
    Connect {
        #[arg(value_enum)]
        kind: KindArg,
        /// Client config file handed over by the VPN server
        ccd_file: PathBuf,
    },

    /// Mark the peer disconnected (`client-disconnect`)
    Disconnect {
        #[arg(value_enum)]
        kind: KindArg,
    },
}
