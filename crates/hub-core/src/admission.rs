//! Admission of joining identities
//!
//! Decides whether a uuid may join, assigns its pool address and FQDN on
//! first contact and renders the per-client config the VPN transport
//! pushes on connect. Runs on the job queue like every other mutation.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::model::{Identity, IdentityKind};
use crate::pool::{SubnetKey, SubnetPool, peer_address};
use crate::traits::HubStore;

/// Longest DNS label
const MAX_LABEL: usize = 63;

/// A join attempt reported by the VPN transport's auth hook
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinRequest {
    pub kind: IdentityKind,
    pub uuid: String,
    /// Hostname the peer claims; only used to derive a new identity's FQDN
    pub hostname: String,
}

/// Outcome of [`Admission::admit`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum AdmissionDecision {
    Admitted {
        identity: Identity,
        /// Whether this join created the identity
        created: bool,
    },
    Rejected {
        reason: String,
        /// Identity deleted because its uuid is blacklisted
        removed: Option<Identity>,
    },
}

impl AdmissionDecision {
    pub fn is_admitted(&self) -> bool {
        matches!(self, AdmissionDecision::Admitted { .. })
    }
}

/// Lowercased DNS label derived from a claimed hostname
///
/// Characters outside `[a-z0-9-]` become `-`; leading and trailing dashes
/// are trimmed. An empty result falls back to the kind's default label.
pub fn hostname_label(hostname: &str, kind: IdentityKind) -> String {
    let short = hostname.split('.').next().unwrap_or_default();
    let mapped: String = short
        .chars()
        .map(|c| match c.to_ascii_lowercase() {
            c @ ('a'..='z' | '0'..='9' | '-') => c,
            _ => '-',
        })
        .take(MAX_LABEL)
        .collect();

    let label = mapped.trim_matches('-');
    if !label.is_empty() {
        return label.to_string();
    }
    match kind {
        IdentityKind::Server => "server".to_string(),
        IdentityKind::UserDevice => "device".to_string(),
    }
}

/// `label-N`, shortened so the result still fits in one DNS label
pub fn suffixed_label(label: &str, n: u32) -> String {
    let suffix = format!("-{}", n);
    let keep = MAX_LABEL.saturating_sub(suffix.len());
    let stem: String = label.chars().take(keep).collect();
    format!("{}{}", stem.trim_end_matches('-'), suffix)
}

/// Join gate and address assignment
pub struct Admission {
    store: Arc<dyn HubStore>,
    key: SubnetKey,
    domain: String,
}

impl Admission {
    pub fn new(store: Arc<dyn HubStore>, key: SubnetKey, domain: impl Into<String>) -> Self {
        Self {
            store,
            key,
            domain: domain.into().trim_matches('.').to_lowercase(),
        }
    }

    pub fn pool(&self, kind: IdentityKind) -> SubnetPool {
        SubnetPool::new(self.key, kind)
    }

    /// First free address of a kind's pool
    pub async fn allocate_address(&self, kind: IdentityKind) -> Result<Ipv4Addr> {
        let used: BTreeSet<Ipv4Addr> = self
            .store
            .identities_of(kind)
            .await?
            .into_iter()
            .map(|i| i.ipv4_address)
            .collect();
        self.pool(kind).allocate(&used)
    }

    /// Decide a join attempt
    ///
    /// Known uuids are admitted unchanged, so repeated joins are
    /// idempotent. A new uuid gets the first free address; exhaustion is
    /// returned as [`Error::ResourceExhausted`] and nothing is saved.
    pub async fn admit(&self, request: &JoinRequest) -> Result<AdmissionDecision> {
        let uuid = request.uuid.trim();
        if uuid.is_empty() || uuid.chars().any(char::is_whitespace) {
            return Err(Error::validation(format!("invalid uuid '{}'", request.uuid)));
        }

        let access = self.store.access_config().await?;
        let existing = self.store.identity_by_uuid(request.kind, uuid).await?;

        if access.is_blacklisted(uuid) {
            let removed = match existing {
                Some(identity) => self.store.delete_identity(identity.id).await?,
                None => None,
            };
            warn!("Rejected blacklisted {} {}", request.kind, uuid);
            return Ok(AdmissionDecision::Rejected {
                reason: format!("uuid {} is blacklisted", uuid),
                removed,
            });
        }

        if let Some(identity) = existing {
            debug!("Admitted known {} {}", identity.kind, identity.fqdn);
            return Ok(AdmissionDecision::Admitted {
                identity,
                created: false,
            });
        }

        if !access.discovery_mode && !access.is_whitelisted(uuid) {
            warn!("Rejected {} {}: discovery mode disabled", request.kind, uuid);
            return Ok(AdmissionDecision::Rejected {
                reason: "discovery mode disabled and uuid not whitelisted".to_string(),
                removed: None,
            });
        }

        let address = self.allocate_address(request.kind).await?;
        let fqdn = self.unique_fqdn(&hostname_label(&request.hostname, request.kind)).await?;
        let identity = self
            .store
            .save_identity(Identity::new(request.kind, uuid, fqdn, address))
            .await?;

        info!(
            "Admitted new {} {} as {} ({})",
            identity.kind, uuid, identity.fqdn, identity.ipv4_address
        );
        Ok(AdmissionDecision::Admitted {
            identity,
            created: true,
        })
    }

    /// `label.domain`, or `label-N.domain` for the first free N from 2
    async fn unique_fqdn(&self, label: &str) -> Result<String> {
        let taken: BTreeSet<String> = self
            .store
            .identities()
            .await?
            .into_iter()
            .map(|i| i.fqdn.to_lowercase())
            .collect();

        let candidate = format!("{}.{}", label, self.domain);
        if !taken.contains(&candidate) {
            return Ok(candidate);
        }
        (2..)
            .map(|n| format!("{}.{}", suffixed_label(label, n), self.domain))
            .find(|fqdn| !taken.contains(fqdn))
            .ok_or_else(|| Error::exhausted(format!("no free name for {}", label)))
    }

    /// Per-client config pushed when an identity connects
    pub async fn client_config(&self, kind: IdentityKind, uuid: &str) -> Result<String> {
        let identity = self
            .store
            .identity_by_uuid(kind, uuid)
            .await?
            .ok_or_else(|| Error::not_found(format!("{} {}", kind, uuid)))?;
        Ok(render_client_config(identity.ipv4_address))
    }
}

/// `ifconfig-push <local> <peer>`
pub fn render_client_config(address: Ipv4Addr) -> String {
    format!("ifconfig-push {} {}", address, peer_address(address))
}
