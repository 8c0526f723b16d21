// # File Store
//
// File-based implementation of HubStore with crash recovery.
//
// ## Purpose
//
// Persists the hub model across daemon restarts. Every mutation is
// written through before it becomes visible, so a crash never leaves
// memory ahead of disk.
//
// ## Crash Recovery
//
// - Atomic writes: write to `.tmp`, then rename over the live file
// - Automatic backup: the previous file is copied to `.backup` first
// - Corruption detection: a file that fails to parse is recovered from
//   the backup, or replaced by an empty model if the backup is bad too
//
// ## File Format
//
// ```json
// {
//   "version": "1.0",
//   "model": {
//     "next_id": 3,
//     "identities": {},
//     "groups": { "1": { "id": 1, "name": "All Servers", "kind": "server" } },
//     "rules": {},
//     "policies": {},
//     "access": { "discovery_mode": true, "uuid_blacklist": [], "uuid_whitelist": [] }
//   }
// }
// ```

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

use super::snapshot::Snapshot;
use crate::error::{Error, Result};
use crate::model::{
    AccessConfig, ConnectionState, Group, Id, Identity, IdentityKind, Policy, Rule,
};
use crate::traits::HubStore;

/// Store file format version
const STORE_FILE_VERSION: &str = "1.0";

/// File-based hub store with crash recovery
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    state: RwLock<Snapshot>,
}

#[derive(serde::Serialize, serde::Deserialize)]
struct StoreFileFormat {
    version: String,
    model: Snapshot,
}

impl FileStore {
    /// Create or load a file store
    ///
    /// This will:
    /// 1. Create parent directories if needed
    /// 2. Load the existing file
    /// 3. If it is corrupted, load the backup
    /// 4. If both fail to parse, start with an empty model
    pub async fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent).await.map_err(|e| {
                    Error::config(format!(
                        "Failed to create store directory {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }

        let mut snapshot = Self::load_with_recovery(&path).await?;
        snapshot.ensure_reserved_groups();

        Ok(Self {
            path,
            state: RwLock::new(snapshot),
        })
    }

    async fn load_with_recovery(path: &Path) -> Result<Snapshot> {
        match Self::load(path).await {
            Ok(snapshot) => Ok(snapshot),
            Err(Error::Json(e)) => {
                tracing::warn!(
                    "Store file {} is corrupted: {}. Attempting recovery from backup.",
                    path.display(),
                    e
                );

                let backup_path = Self::backup_path(path);
                if !backup_path.exists() {
                    tracing::warn!("No backup file found. Starting with an empty model.");
                    return Ok(Snapshot::new());
                }

                match Self::load(&backup_path).await {
                    Ok(snapshot) => {
                        tracing::info!("Recovered store from backup {}", backup_path.display());
                        if let Err(restore_err) = fs::copy(&backup_path, path).await {
                            tracing::error!(
                                "Failed to restore store file from backup: {}",
                                restore_err
                            );
                        }
                        Ok(snapshot)
                    }
                    Err(backup_err) => {
                        tracing::error!(
                            "Backup also unreadable: {}. Starting with an empty model.",
                            backup_err
                        );
                        Ok(Snapshot::new())
                    }
                }
            }
            Err(e) => Err(e),
        }
    }

    async fn load(path: &Path) -> Result<Snapshot> {
        if !path.exists() {
            tracing::debug!("Store file does not exist: {}", path.display());
            return Ok(Snapshot::new());
        }

        let content = fs::read_to_string(path).await.map_err(|e| {
            Error::store(format!("Failed to read store file {}: {}", path.display(), e))
        })?;

        let file: StoreFileFormat = serde_json::from_str(&content)?;
        if file.version != STORE_FILE_VERSION {
            tracing::warn!(
                "Store file version mismatch: expected {}, got {}. Attempting to load anyway.",
                STORE_FILE_VERSION,
                file.version
            );
        }
        Ok(file.model)
    }

    async fn write_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        let file = StoreFileFormat {
            version: STORE_FILE_VERSION.to_string(),
            model: snapshot.clone(),
        };
        let json = serde_json::to_string_pretty(&file)?;

        let temp_path = self.temp_path();
        {
            let mut tmp = fs::File::create(&temp_path).await.map_err(|e| {
                Error::store(format!(
                    "Failed to create temp file {}: {}",
                    temp_path.display(),
                    e
                ))
            })?;
            tmp.write_all(json.as_bytes()).await.map_err(|e| {
                Error::store(format!("Failed to write temp file {}: {}", temp_path.display(), e))
            })?;
            tmp.flush().await.map_err(|e| {
                Error::store(format!("Failed to flush temp file {}: {}", temp_path.display(), e))
            })?;
        }

        if self.path.exists() {
            if let Err(e) = fs::copy(&self.path, Self::backup_path(&self.path)).await {
                tracing::warn!("Failed to create backup: {}", e);
            }
        }

        fs::rename(&temp_path, &self.path).await.map_err(|e| {
            Error::store(format!(
                "Failed to rename {} to {}: {}",
                temp_path.display(),
                self.path.display(),
                e
            ))
        })?;

        tracing::trace!("Store written to {}", self.path.display());
        Ok(())
    }

    /// Apply a mutation to a staged copy, persist it, then publish it
    async fn mutate<T>(&self, f: impl FnOnce(&mut Snapshot) -> Result<T>) -> Result<T> {
        let mut guard = self.state.write().await;
        let mut staged = guard.clone();
        let out = f(&mut staged)?;
        self.write_snapshot(&staged).await?;
        *guard = staged;
        Ok(out)
    }

    fn temp_path(&self) -> PathBuf {
        let mut temp = self.path.clone();
        temp.set_extension("tmp");
        temp
    }

    fn backup_path(path: &Path) -> PathBuf {
        let mut backup = path.to_path_buf();
        backup.set_extension("backup");
        backup
    }
}

#[async_trait]
impl HubStore for FileStore {
    async fn identities(&self) -> Result<Vec<Identity>> {
        Ok(self.state.read().await.identities())
    }

    async fn identity(&self, id: Id) -> Result<Option<Identity>> {
        Ok(self.state.read().await.identity(id))
    }

    async fn identity_by_uuid(&self, kind: IdentityKind, uuid: &str) -> Result<Option<Identity>> {
        Ok(self.state.read().await.identity_by_uuid(kind, uuid))
    }

    async fn save_identity(&self, identity: Identity) -> Result<Identity> {
        self.mutate(|s| s.save_identity(identity)).await
    }

    async fn set_connection_states(&self, states: &[ConnectionState]) -> Result<usize> {
        self.mutate(|s| Ok(s.set_connection_states(states))).await
    }

    async fn set_membership(
        &self,
        group_id: Id,
        identity_id: Id,
        member: bool,
    ) -> Result<(Identity, bool)> {
        self.mutate(|s| s.set_membership(group_id, identity_id, member))
            .await
    }

    async fn delete_identity(&self, id: Id) -> Result<Option<Identity>> {
        self.mutate(|s| Ok(s.delete_identity(id))).await
    }

    async fn groups(&self) -> Result<Vec<Group>> {
        Ok(self.state.read().await.groups())
    }

    async fn group(&self, id: Id) -> Result<Option<Group>> {
        Ok(self.state.read().await.group(id))
    }

    async fn save_group(&self, group: Group) -> Result<Group> {
        self.mutate(|s| s.save_group(group)).await
    }

    async fn delete_group(&self, id: Id) -> Result<Option<Group>> {
        self.mutate(|s| s.delete_group(id)).await
    }

    async fn rules(&self) -> Result<Vec<Rule>> {
        Ok(self.state.read().await.rules())
    }

    async fn rule(&self, id: Id) -> Result<Option<Rule>> {
        Ok(self.state.read().await.rule(id))
    }

    async fn save_rule(&self, rule: Rule) -> Result<Rule> {
        self.mutate(|s| s.save_rule(rule)).await
    }

    async fn delete_rule(&self, id: Id) -> Result<Option<Rule>> {
        self.mutate(|s| Ok(s.delete_rule(id))).await
    }

    async fn policies(&self) -> Result<Vec<Policy>> {
        Ok(self.state.read().await.policies())
    }

    async fn policy(&self, id: Id) -> Result<Option<Policy>> {
        Ok(self.state.read().await.policy(id))
    }

    async fn save_policy(&self, policy: Policy) -> Result<Policy> {
        self.mutate(|s| s.save_policy(policy)).await
    }

    async fn delete_policy(&self, id: Id) -> Result<Option<Policy>> {
        self.mutate(|s| Ok(s.delete_policy(id))).await
    }

    async fn access_config(&self) -> Result<AccessConfig> {
        Ok(self.state.read().await.access_config())
    }

    async fn save_access_config(&self, config: AccessConfig) -> Result<()> {
        self.mutate(|s| {
            s.set_access_config(config);
            Ok(())
        })
        .await
    }

    async fn flush(&self) -> Result<()> {
        let guard = self.state.read().await;
        self.write_snapshot(&guard).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{PortSpec, Protocol};
    use std::net::Ipv4Addr;
    use tempfile::tempdir;

    fn server(uuid: &str, last_octet: u8) -> Identity {
        Identity::new(
            IdentityKind::Server,
            uuid,
            format!("{}.hub.example", uuid),
            Ipv4Addr::new(100, 1, 224, last_octet),
        )
    }

    #[tokio::test]
    async fn test_file_store_persists_across_restart() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("hub.json");

        let store = FileStore::new(&path).await.unwrap();
        let saved = store.save_identity(server("a", 2)).await.unwrap();
        store
            .save_rule(Rule::new("web", Protocol::Tcp, PortSpec::parse("443").unwrap()))
            .await
            .unwrap();
        assert!(path.exists());

        let reopened = FileStore::new(&path).await.unwrap();
        assert_eq!(reopened.identity(saved.id).await.unwrap(), Some(saved));
        assert_eq!(reopened.rules().await.unwrap().len(), 1);
        assert_eq!(reopened.groups().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_rejected_mutation_is_not_written() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("hub.json");

        let store = FileStore::new(&path).await.unwrap();
        store.save_identity(server("a", 2)).await.unwrap();
        assert!(store.save_identity(server("a", 6)).await.is_err());

        let reopened = FileStore::new(&path).await.unwrap();
        assert_eq!(reopened.identities().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_file_store_corruption_recovery() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("hub.json");

        let store = FileStore::new(&path).await.unwrap();
        store.save_identity(server("a", 2)).await.unwrap();
        // second write moves the first version into the backup
        store.save_identity(server("b", 6)).await.unwrap();
        assert!(FileStore::backup_path(&path).exists());

        fs::write(&path, b"corrupted json data").await.unwrap();

        let recovered = FileStore::new(&path)
            .await
            .expect("store recovers from backup");
        let uuids: Vec<_> = recovered
            .identities()
            .await
            .unwrap()
            .into_iter()
            .map(|i| i.uuid)
            .collect();
        assert_eq!(uuids, vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn test_corruption_without_backup_starts_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("hub.json");
        fs::write(&path, b"{ not json").await.unwrap();

        let store = FileStore::new(&path).await.unwrap();
        assert!(store.identities().await.unwrap().is_empty());
        assert_eq!(store.groups().await.unwrap().len(), 2);
    }
}
