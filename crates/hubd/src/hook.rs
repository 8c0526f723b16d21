//! VPN server script hooks
//!
//! OpenVPN runs these as short-lived processes; each one forwards to the
//! daemon over the control socket and reports through its exit code.
//!
//! | hook | OpenVPN directive | environment |
//! |---|---|---|
//! | `auth` | `auth-user-pass-verify ... via-env` | `username` (uuid), `password` (hostname) |
//! | `connect` | `client-connect` | `common_name` |
//! | `disconnect` | `client-disconnect` | `common_name` |

use hub_core::admission::JoinRequest;
use hub_core::control::ControlRequest;
use hub_core::model::IdentityKind;
use hub_core::{Error, HubEvent, Result};
use std::path::Path;
use tracing::{info, warn};

use crate::client::ControlClient;

/// Admit or reject a joining peer; `Ok` means admitted
pub async fn auth<F>(client: &ControlClient, kind: IdentityKind, lookup: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    let uuid = lookup("username")
        .or_else(|| lookup("common_name"))
        .ok_or_else(|| Error::validation("neither username nor common_name is set"))?;
    let hostname = lookup("password").unwrap_or_default();

    info!("Authenticating {} with uuid {}", kind, uuid);
    let request = ControlRequest::Admit {
        request: JoinRequest {
            kind,
            uuid: uuid.clone(),
            hostname,
        },
    };
    let decision = client.request(&request).await?;

    match decision.get("decision").and_then(|d| d.as_str()) {
        Some("admitted") => {
            info!("Admitted {}", uuid);
            Ok(())
        }
        _ => {
            let reason = decision
                .get("reason")
                .and_then(|r| r.as_str())
                .unwrap_or("rejected");
            warn!("Denying {}: {}", uuid, reason);
            Err(Error::Other(format!("{} denied: {}", uuid, reason)))
        }
    }
}

/// Write the peer's client config and report the connection
pub async fn connect<F>(
    client: &ControlClient,
    kind: IdentityKind,
    ccd_file: &Path,
    lookup: F,
) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    let uuid = common_name(&lookup)?;
    let config = client
        .request(&ControlRequest::ClientConfig {
            kind,
            uuid: uuid.clone(),
        })
        .await?;
    let config = config
        .as_str()
        .ok_or_else(|| Error::Other("daemon returned a non-string client config".to_string()))?;

    tokio::fs::write(ccd_file, config).await?;
    info!("Wrote {} for {}: {}", ccd_file.display(), uuid, config);

    client
        .request(&ControlRequest::Publish {
            event: HubEvent::IdentityConnected { kind, uuid },
        })
        .await
        .map(drop)
}

/// Report a disconnection
pub async fn disconnect<F>(client: &ControlClient, kind: IdentityKind, lookup: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    let uuid = common_name(&lookup)?;
    info!("{} {} disconnected", kind, uuid);
    client
        .request(&ControlRequest::Publish {
            event: HubEvent::IdentityDisconnected { kind, uuid },
        })
        .await
        .map(drop)
}

fn common_name<F>(lookup: &F) -> Result<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup("common_name")
        .filter(|cn| !cn.is_empty())
        .ok_or_else(|| Error::validation("common_name is not set"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::{bind_control_socket, serve_control};
    use hub_core::pool::SubnetKey;
    use hub_core::state::MemoryPacketFilter;
    use hub_core::traits::HubStore;
    use hub_core::{Backends, ErrorClass, HubConfig, HubEngine, MemoryStore};
    use std::collections::{BTreeMap, HashMap};
    use std::sync::Arc;

    fn env(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    async fn daemon(dir: &tempfile::TempDir) -> (ControlClient, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let backends = Backends {
            store: store.clone(),
            filter: Arc::new(MemoryPacketFilter::new()),
            transports: BTreeMap::new(),
            dns: None,
        };
        let config = HubConfig::new(SubnetKey::new(10).unwrap(), "hub.test");
        let (engine, _events) = HubEngine::new(&config, backends).unwrap();

        let path = dir.path().join("control.sock");
        let listener = bind_control_socket(&path).await.unwrap();
        tokio::spawn(serve_control(Arc::new(engine), listener));
        (ControlClient::new(path), store)
    }

    #[tokio::test]
    async fn test_auth_then_connect_writes_client_config() {
        let dir = tempfile::tempdir().unwrap();
        let (client, store) = daemon(&dir).await;

        auth(
            &client,
            IdentityKind::UserDevice,
            env(&[("username", "u-laptop"), ("password", "Laptop.local")]),
        )
        .await
        .unwrap();

        let ccd = dir.path().join("ccd");
        connect(
            &client,
            IdentityKind::UserDevice,
            &ccd,
            env(&[("common_name", "u-laptop")]),
        )
        .await
        .unwrap();

        let written = std::fs::read_to_string(&ccd).unwrap();
        assert_eq!(written, "ifconfig-push 100.10.208.2 100.10.208.1");

        let identity = store
            .identity_by_uuid(IdentityKind::UserDevice, "u-laptop")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(identity.fqdn, "laptop.hub.test");
    }

    #[tokio::test]
    async fn test_unknown_peer_cannot_connect() {
        let dir = tempfile::tempdir().unwrap();
        let (client, _store) = daemon(&dir).await;

        let err = connect(
            &client,
            IdentityKind::Server,
            &dir.path().join("ccd"),
            env(&[("common_name", "u-ghost")]),
        )
        .await
        .unwrap_err();
        assert_eq!(err.class(), ErrorClass::Invalid);
        assert!(!dir.path().join("ccd").exists());
    }

    #[tokio::test]
    async fn test_missing_environment_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let (client, _store) = daemon(&dir).await;

        let err = disconnect(&client, IdentityKind::Server, env(&[])).await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::Invalid);

        let err = auth(&client, IdentityKind::Server, env(&[])).await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::Invalid);
    }

    #[tokio::test]
    async fn test_disconnect_is_queued() {
        let dir = tempfile::tempdir().unwrap();
        let (client, _store) = daemon(&dir).await;

        disconnect(
            &client,
            IdentityKind::Server,
            env(&[("common_name", "u-web")]),
        )
        .await
        .unwrap();
    }
}
