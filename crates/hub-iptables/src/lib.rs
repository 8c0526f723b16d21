// # iptables Packet-Filter Backend
//
// `PacketFilter` implementation driving the `iptables` binary. Each trait
// call is exactly one invocation against the `filter` table; ordering and
// idempotency are owned by the firewall compiler in `hub-core`.
//
// | call | invocation |
// |---|---|
// | `list_chains` | `iptables -w -t filter -S` |
// | `list_entries` | `iptables -w -t filter -S <chain>` |
// | `create_chain` / `flush_chain` / `delete_chain` | `-N` / `-F` / `-X` |
// | `insert_entry` | `-I <chain> 1 <spec>` |
// | `append_entry` / `delete_entry` / `has_entry` | `-A` / `-D` / `-C` |
//
// `-w` waits for the xtables lock instead of failing while another
// process holds it.

pub mod executor;
pub mod parse;

use async_trait::async_trait;
use hub_core::config::FirewallConfig;
use hub_core::traits::{FILTER_TABLE, FilterEntry, PacketFilter};
use hub_core::{Error, Result};
use std::sync::Arc;
use tracing::debug;

pub use executor::{CommandExecutor, CommandOutput, SystemExecutor};

/// `iptables -C` exit code for "no such rule"
const CHECK_MISSING: i32 = 1;

/// iptables-backed packet filter
pub struct IptablesFilter {
    program: String,
    executor: Arc<dyn CommandExecutor>,
}

impl IptablesFilter {
    /// Backend running `program` through `executor`
    pub fn new(program: impl Into<String>, executor: Arc<dyn CommandExecutor>) -> Self {
        Self {
            program: program.into(),
            executor,
        }
    }

    /// Backend running real processes
    pub fn from_config(config: &FirewallConfig) -> Self {
        Self::new(config.iptables_path.clone(), Arc::new(SystemExecutor))
    }

    fn args(&self, op: &[&str], entry: Option<&FilterEntry>) -> Vec<String> {
        let mut args: Vec<String> = ["-w", "-t", FILTER_TABLE]
            .iter()
            .chain(op)
            .map(|s| s.to_string())
            .collect();
        if let Some(entry) = entry {
            args.extend(entry.to_args());
        }
        args
    }

    async fn run(&self, args: Vec<String>) -> Result<CommandOutput> {
        debug!("{} {}", self.program, args.join(" "));
        self.executor.execute(&self.program, &args).await
    }

    /// Run and require exit code 0
    async fn run_ok(&self, args: Vec<String>) -> Result<String> {
        let command = args.join(" ");
        let output = self.run(args).await?;
        if output.success {
            return Ok(output.stdout);
        }
        Err(Error::firewall(format!(
            "`{} {}` failed ({}): {}",
            self.program,
            command,
            output
                .code
                .map_or_else(|| "signal".to_string(), |c| format!("exit {}", c)),
            output.stderr.trim()
        )))
    }
}

#[async_trait]
impl PacketFilter for IptablesFilter {
    async fn list_chains(&self) -> Result<Vec<String>> {
        let listing = self.run_ok(self.args(&["-S"], None)).await?;
        Ok(parse::parse_chains(&listing))
    }

    async fn create_chain(&self, chain: &str) -> Result<()> {
        self.run_ok(self.args(&["-N", chain], None)).await.map(drop)
    }

    async fn flush_chain(&self, chain: &str) -> Result<()> {
        self.run_ok(self.args(&["-F", chain], None)).await.map(drop)
    }

    async fn delete_chain(&self, chain: &str) -> Result<()> {
        self.run_ok(self.args(&["-X", chain], None)).await.map(drop)
    }

    async fn list_entries(&self, chain: &str) -> Result<Vec<FilterEntry>> {
        let listing = self.run_ok(self.args(&["-S", chain], None)).await?;
        Ok(parse::parse_entries(&listing, chain))
    }

    async fn insert_entry(&self, chain: &str, entry: &FilterEntry) -> Result<()> {
        self.run_ok(self.args(&["-I", chain, "1"], Some(entry)))
            .await
            .map(drop)
    }

    async fn append_entry(&self, chain: &str, entry: &FilterEntry) -> Result<()> {
        self.run_ok(self.args(&["-A", chain], Some(entry))).await.map(drop)
    }

    async fn delete_entry(&self, chain: &str, entry: &FilterEntry) -> Result<()> {
        self.run_ok(self.args(&["-D", chain], Some(entry))).await.map(drop)
    }

    async fn has_entry(&self, chain: &str, entry: &FilterEntry) -> Result<bool> {
        let args = self.args(&["-C", chain], Some(entry));
        let output = self.run(args).await?;
        match (output.success, output.code) {
            (true, _) => Ok(true),
            (false, Some(CHECK_MISSING)) => Ok(false),
            _ => Err(Error::firewall(format!(
                "checking entry in {} failed: {}",
                chain,
                output.stderr.trim()
            ))),
        }
    }

    fn backend_name(&self) -> &'static str {
        "iptables"
    }
}
