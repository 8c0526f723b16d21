//! Control protocol
//!
//! Line-delimited JSON spoken over the daemon's control socket by VPN
//! hook scripts, the administrative CLI and the external console. Each
//! request line yields exactly one response line.
//!
//! ```text
//! → {"op":"publish","event":{"type":"identity_connected","kind":"server","uuid":"u-1"}}
//! ← {"status":"ok","data":{"queued":true}}
//! → {"op":"reconcile"}
//! ← {"status":"ok","data":{"updated":1,"connected":1,...}}
//! → {"op":"admit","kind":"server","uuid":"","hostname":"web"}
//! ← {"status":"error","class":"invalid","message":"Validation error: invalid uuid ''"}
//! → {"op":"add_member","group_id":7,"identity_id":3}
//! ← {"status":"ok","data":{"id":3,"kind":"server",...,"groups":[1,7]}}
//! ```
//!
//! Store mutations are validated and persisted before the reply; the
//! enforcement jobs they trigger are queued and not waited for.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, warn};

use crate::admission::JoinRequest;
use crate::engine::{HubEngine, HubEvent, Submission};
use crate::error::{Error, ErrorClass, Result};
use crate::model::{AccessConfig, Group, Id, IdentityKind, Policy, Rule};
use crate::traits::HubStore;

/// One control request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ControlRequest {
    /// Queue the jobs an event maps to; does not wait for them
    Publish { event: HubEvent },
    Reconcile,
    FullSync,
    Init {
        #[serde(default)]
        core_only: bool,
    },
    Teardown {
        #[serde(default)]
        full: bool,
    },
    SyncInventory,
    ShowInventory,
    Admit {
        #[serde(flatten)]
        request: JoinRequest,
    },
    ClientConfig { kind: IdentityKind, uuid: String },
    /// Dump every persisted entity
    ShowStore,
    SaveRule { rule: Rule },
    DeleteRule { id: Id },
    SavePolicy { policy: Policy },
    DeletePolicy { id: Id },
    SaveGroup { group: Group },
    DeleteGroup { id: Id },
    AddMember { group_id: Id, identity_id: Id },
    RemoveMember { group_id: Id, identity_id: Id },
    DeleteIdentity { id: Id },
    SaveAccessConfig { config: AccessConfig },
}

/// Reply to a [`ControlRequest`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ControlResponse {
    Ok {
        #[serde(default)]
        data: Value,
    },
    Error { class: ErrorClass, message: String },
}

impl ControlResponse {
    pub fn error(err: &Error) -> Self {
        ControlResponse::Error {
            class: err.class(),
            message: err.to_string(),
        }
    }

    /// Turn a reply back into a result, keeping the error class
    pub fn into_result(self) -> Result<Value> {
        match self {
            ControlResponse::Ok { data } => Ok(data),
            ControlResponse::Error { class, message } => Err(match class {
                ErrorClass::Invalid => Error::Validation(message),
                ErrorClass::Transport => Error::transport("hubd", message),
                ErrorClass::Config => Error::Config(message),
                ErrorClass::Failure => Error::Other(message),
            }),
        }
    }
}

impl From<Result<Value>> for ControlResponse {
    fn from(result: Result<Value>) -> Self {
        match result {
            Ok(data) => ControlResponse::Ok { data },
            Err(e) => ControlResponse::error(&e),
        }
    }
}

/// Execute one request against the engine
pub async fn dispatch(engine: &HubEngine, request: ControlRequest) -> ControlResponse {
    debug!("Control request: {:?}", request);
    let result = match request {
        ControlRequest::Publish { event } => match engine.publish(event) {
            Submission::Queued(_) => Ok(json!({ "queued": true })),
            Submission::Duplicate => Ok(json!({ "queued": false, "duplicate": true })),
            Submission::Closed => Err(closed()),
        },
        ControlRequest::Reconcile => wait(engine.reconcile()).await,
        ControlRequest::FullSync => wait(engine.full_sync()).await,
        ControlRequest::Init { core_only } => wait(engine.init(core_only)).await,
        ControlRequest::Teardown { full } => wait(engine.teardown(full)).await,
        ControlRequest::SyncInventory => wait(engine.sync_inventory()).await,
        ControlRequest::ShowInventory => wait(engine.inventory()).await,
        ControlRequest::Admit { request } => wait(engine.admit(request)).await,
        ControlRequest::ClientConfig { kind, uuid } => wait(engine.client_config(kind, &uuid)).await,
        ControlRequest::ShowStore => show_store(engine).await,
        ControlRequest::SaveRule { rule } => reply(engine.save_rule(rule).await),
        ControlRequest::DeleteRule { id } => reply(engine.delete_rule(id).await),
        ControlRequest::SavePolicy { policy } => reply(engine.save_policy(policy).await),
        ControlRequest::DeletePolicy { id } => reply(engine.delete_policy(id).await),
        ControlRequest::SaveGroup { group } => reply(engine.save_group(group).await),
        ControlRequest::DeleteGroup { id } => reply(engine.delete_group(id).await),
        ControlRequest::AddMember {
            group_id,
            identity_id,
        } => reply(engine.add_member(group_id, identity_id).await),
        ControlRequest::RemoveMember {
            group_id,
            identity_id,
        } => reply(engine.remove_member(group_id, identity_id).await),
        ControlRequest::DeleteIdentity { id } => reply(engine.delete_identity(id).await),
        ControlRequest::SaveAccessConfig { config } => {
            reply(engine.save_access_config(config).await.map(|removed| {
                json!({ "removed": removed })
            }))
        }
    };
    result.into()
}

fn reply<T: Serialize>(result: Result<T>) -> Result<Value> {
    Ok(serde_json::to_value(result?)?)
}

async fn show_store(engine: &HubEngine) -> Result<Value> {
    let store = engine.store();
    Ok(json!({
        "identities": store.identities().await?,
        "groups": store.groups().await?,
        "rules": store.rules().await?,
        "policies": store.policies().await?,
        "access": store.access_config().await?,
    }))
}

async fn wait<T: Serialize>(submission: Submission<T>) -> Result<Value> {
    match submission {
        Submission::Queued(handle) => Ok(serde_json::to_value(handle.wait().await?)?),
        Submission::Duplicate => Ok(json!({ "duplicate": true })),
        Submission::Closed => Err(closed()),
    }
}

fn closed() -> Error {
    Error::Other("engine is shutting down".to_string())
}

/// Serve requests from one connection until it closes
pub async fn serve_connection<S>(engine: &HubEngine, stream: S) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<ControlRequest>(&line) {
            Ok(request) => dispatch(engine, request).await,
            Err(e) => {
                warn!("Malformed control request: {}", e);
                ControlResponse::error(&Error::validation(format!("malformed request: {}", e)))
            }
        };
        let mut encoded = serde_json::to_string(&response)?;
        encoded.push('\n');
        writer.write_all(encoded.as_bytes()).await?;
        writer.flush().await?;
    }
    Ok(())
}
