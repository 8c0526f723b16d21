// # VPN Management Trait
//
// Typed client for a VPN transport's management interface. One instance
// exists per peer class (servers, user devices), since each class runs
// its own transport.
//
// Every call is a complete round trip (connect, command, disconnect) and
// must be bounded by the implementation's timeout. Failures surface as
// `Error::Transport` so the reconciler can abort a cycle cleanly.

use async_trait::async_trait;
use std::collections::BTreeSet;

use crate::error::{Error, Result};

/// Trait for VPN management clients
#[async_trait]
pub trait VpnManagement: Send + Sync {
    /// Transport name used in logs and transport errors
    fn name(&self) -> &str;

    /// Identifiers (common names) of the peers currently connected
    ///
    /// # Returns
    ///
    /// - `Ok(set)`: live identifiers, possibly empty
    /// - `Err(Error::Transport)`: the interface could not be queried;
    ///   callers must not read this as "nobody is connected"
    async fn connected_identifiers(&self) -> Result<BTreeSet<String>>;

    /// Send a raw management command and return the reply text
    async fn send_command(&self, command: &str) -> Result<String>;

    /// Forcibly disconnect a peer
    async fn kill(&self, identifier: &str) -> Result<()> {
        let reply = self.send_command(&format!("kill {}", identifier)).await?;
        if reply.starts_with("SUCCESS") {
            Ok(())
        } else {
            Err(Error::transport(
                self.name(),
                format!("kill {} refused: {}", identifier, reply.trim()),
            ))
        }
    }
}
