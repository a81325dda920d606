//! Filesystem-backed `RemoteStore`, standing in for the real network
//! collaborator the same way `vault_share_core::vaultstorage::FilesystemVaultStorage`
//! stands in for real vault storage: the trait is an external-collaborator
//! contract (§6), out of scope for a concrete production implementation, but
//! a CLI invoked as separate processes per command needs *something*
//! durable across invocations to be useful for manual testing.
//!
//! Layout: `root/manifests/{share_vault_id}.json` holds one [`SharedVault`]
//! each; `root/chunks/{share_vault_id}/{index}.bin` holds chunk bytes.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use vault_share_core::remote::{RemoteError, RemoteStore, SharedVault};

/// `SharedVault` carries no `serde` impls of its own (the trait is an
/// opaque external-collaborator contract, §6) so this store mirrors it
/// field-for-field, the same way `FilesystemVaultStorage` mirrors
/// `VaultFileHeader` into a private `Raw` before touching disk.
#[derive(Serialize, Deserialize)]
struct RawManifest {
    share_vault_id: Uuid,
    phrase_vault_id: String,
    updated_at: DateTime<Utc>,
    version: i64,
    owner_fingerprint: String,
    chunk_count: u64,
    claimed: bool,
    revoked: bool,
    consumed: bool,
    encrypted_policy: Vec<u8>,
}

impl From<&SharedVault> for RawManifest {
    fn from(m: &SharedVault) -> Self {
        Self {
            share_vault_id: m.share_vault_id,
            phrase_vault_id: m.phrase_vault_id.clone(),
            updated_at: m.updated_at,
            version: m.version,
            owner_fingerprint: m.owner_fingerprint.clone(),
            chunk_count: m.chunk_count,
            claimed: m.claimed,
            revoked: m.revoked,
            consumed: m.consumed,
            encrypted_policy: m.encrypted_policy.clone(),
        }
    }
}

impl From<RawManifest> for SharedVault {
    fn from(r: RawManifest) -> Self {
        Self {
            share_vault_id: r.share_vault_id,
            phrase_vault_id: r.phrase_vault_id,
            updated_at: r.updated_at,
            version: r.version,
            owner_fingerprint: r.owner_fingerprint,
            chunk_count: r.chunk_count,
            claimed: r.claimed,
            revoked: r.revoked,
            consumed: r.consumed,
            encrypted_policy: r.encrypted_policy,
        }
    }
}

pub struct FilesystemRemoteStore {
    root: PathBuf,
}

impl FilesystemRemoteStore {
    #[must_use]
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn manifests_dir(&self) -> PathBuf {
        self.root.join("manifests")
    }

    fn manifest_path(&self, share_vault_id: Uuid) -> PathBuf {
        self.manifests_dir().join(format!("{share_vault_id}.json"))
    }

    fn chunk_path(&self, share_vault_id: Uuid, index: u64) -> PathBuf {
        self.root.join("chunks").join(share_vault_id.to_string()).join(format!("{index}.bin"))
    }

    async fn read_manifest(&self, share_vault_id: Uuid) -> Result<Option<SharedVault>, RemoteError> {
        match tokio::fs::read(self.manifest_path(share_vault_id)).await {
            Ok(bytes) => {
                let raw: RawManifest = serde_json::from_slice(&bytes).map_err(|e| {
                    tracing::warn!(%share_vault_id, error = %e, "corrupted manifest on disk");
                    RemoteError::InvalidData
                })?;
                Ok(Some(raw.into()))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(RemoteError::NetworkError(e.to_string())),
        }
    }

    async fn write_manifest(&self, manifest: &SharedVault) -> Result<(), RemoteError> {
        tokio::fs::create_dir_all(self.manifests_dir())
            .await
            .map_err(|e| RemoteError::NetworkError(e.to_string()))?;
        let json = serde_json::to_vec_pretty(&RawManifest::from(manifest)).map_err(|_| RemoteError::InvalidData)?;
        let path = self.manifest_path(manifest.share_vault_id);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &json).await.map_err(|e| RemoteError::NetworkError(e.to_string()))?;
        tokio::fs::rename(&tmp, &path).await.map_err(|e| RemoteError::NetworkError(e.to_string()))
    }

    async fn all_manifests(&self) -> Result<Vec<SharedVault>, RemoteError> {
        let mut out = Vec::new();
        let mut entries = match tokio::fs::read_dir(self.manifests_dir()).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(RemoteError::NetworkError(e.to_string())),
        };
        while let Some(entry) = entries.next_entry().await.map_err(|e| RemoteError::NetworkError(e.to_string()))? {
            if entry.path().extension().is_some_and(|ext| ext == "json") {
                let bytes = tokio::fs::read(entry.path()).await.map_err(|e| RemoteError::NetworkError(e.to_string()))?;
                if let Ok(raw) = serde_json::from_slice::<RawManifest>(&bytes) {
                    let manifest: SharedVault = raw.into();
                    out.push(manifest);
                }
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl RemoteStore for FilesystemRemoteStore {
    async fn get_manifest_by_phrase(&self, phrase_vault_id: &str) -> Result<Option<SharedVault>, RemoteError> {
        Ok(self.all_manifests().await?.into_iter().find(|m| m.phrase_vault_id == phrase_vault_id))
    }

    async fn get_manifest(&self, share_vault_id: Uuid) -> Result<Option<SharedVault>, RemoteError> {
        self.read_manifest(share_vault_id).await
    }

    async fn save_manifest(&self, mut manifest: SharedVault) -> Result<SharedVault, RemoteError> {
        if let Some(existing) = self.read_manifest(manifest.share_vault_id).await?
            && existing.version != manifest.version
        {
            return Err(RemoteError::RecordChanged);
        }
        manifest.updated_at = Utc::now();
        manifest.version += 1;
        self.write_manifest(&manifest).await?;
        Ok(manifest)
    }

    async fn get_chunk(&self, share_vault_id: Uuid, index: u64) -> Result<Vec<u8>, RemoteError> {
        tokio::fs::read(self.chunk_path(share_vault_id, index))
            .await
            .map_err(|_| RemoteError::DownloadFailed(format!("chunk {index} not found")))
    }

    async fn save_chunk(&self, share_vault_id: Uuid, index: u64, data: Vec<u8>) -> Result<(), RemoteError> {
        let path = self.chunk_path(share_vault_id, index);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| RemoteError::UploadFailed(e.to_string()))?;
        }
        tokio::fs::write(&path, &data).await.map_err(|e| RemoteError::UploadFailed(e.to_string()))
    }

    async fn delete_chunk(&self, share_vault_id: Uuid, index: u64) -> Result<(), RemoteError> {
        match tokio::fs::remove_file(self.chunk_path(share_vault_id, index)).await {
            Ok(()) | Err(_) => Ok(()),
        }
    }

    async fn list_chunk_indices(&self, share_vault_id: Uuid) -> Result<Vec<u64>, RemoteError> {
        let dir = self.root.join("chunks").join(share_vault_id.to_string());
        let mut out = Vec::new();
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(RemoteError::NetworkError(e.to_string())),
        };
        while let Some(entry) = entries.next_entry().await.map_err(|e| RemoteError::NetworkError(e.to_string()))? {
            if let Some(index) = entry.path().file_stem().and_then(|s| s.to_str()).and_then(|s| s.parse().ok()) {
                out.push(index);
            }
        }
        Ok(out)
    }

    async fn set_claimed(&self, share_vault_id: Uuid) -> Result<(), RemoteError> {
        if let Some(mut manifest) = self.read_manifest(share_vault_id).await? {
            manifest.claimed = true;
            self.write_manifest(&manifest).await?;
        }
        Ok(())
    }

    async fn set_revoked(&self, share_vault_id: Uuid) -> Result<(), RemoteError> {
        if let Some(mut manifest) = self.read_manifest(share_vault_id).await? {
            manifest.revoked = true;
            self.write_manifest(&manifest).await?;
        }
        Ok(())
    }

    async fn set_consumed(&self, share_vault_id: Uuid) -> Result<(), RemoteError> {
        if let Some(mut manifest) = self.read_manifest(share_vault_id).await? {
            manifest.consumed = true;
            self.write_manifest(&manifest).await?;
        }
        Ok(())
    }

    async fn consumed_status_by_share_vault_ids(
        &self,
        share_vault_ids: &[Uuid],
    ) -> Result<HashMap<Uuid, bool>, RemoteError> {
        let mut out = HashMap::new();
        for id in share_vault_ids {
            let consumed = self.read_manifest(*id).await?.is_some_and(|m| m.consumed);
            out.insert(*id, consumed);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(share_vault_id: Uuid) -> SharedVault {
        SharedVault {
            share_vault_id,
            phrase_vault_id: "abc".into(),
            updated_at: Utc::now(),
            version: SharedVault::INITIAL_VERSION,
            owner_fingerprint: "owner".into(),
            chunk_count: 1,
            claimed: false,
            revoked: false,
            consumed: false,
            encrypted_policy: Vec::new(),
        }
    }

    #[tokio::test]
    async fn manifest_round_trips_and_looks_up_by_phrase() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FilesystemRemoteStore::new(tmp.path().to_path_buf());
        let id = Uuid::new_v4();
        let saved = store.save_manifest(sample(id)).await.unwrap();
        assert_eq!(saved.version, SharedVault::INITIAL_VERSION + 1);

        let fetched = store.get_manifest(id).await.unwrap().unwrap();
        assert_eq!(fetched.share_vault_id, id);

        let by_phrase = store.get_manifest_by_phrase("abc").await.unwrap().unwrap();
        assert_eq!(by_phrase.share_vault_id, id);
    }

    #[tokio::test]
    async fn stale_version_save_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FilesystemRemoteStore::new(tmp.path().to_path_buf());
        let id = Uuid::new_v4();
        let saved = store.save_manifest(sample(id)).await.unwrap();

        let mut stale = saved.clone();
        stale.version = SharedVault::INITIAL_VERSION;
        let result = store.save_manifest(stale).await;
        assert!(matches!(result, Err(RemoteError::RecordChanged)));
    }

    #[tokio::test]
    async fn chunks_round_trip_and_list() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FilesystemRemoteStore::new(tmp.path().to_path_buf());
        let id = Uuid::new_v4();
        store.save_chunk(id, 0, vec![1, 2, 3]).await.unwrap();
        store.save_chunk(id, 1, vec![4, 5, 6]).await.unwrap();
        let mut indices = store.list_chunk_indices(id).await.unwrap();
        indices.sort_unstable();
        assert_eq!(indices, vec![0, 1]);
        assert_eq!(store.get_chunk(id, 0).await.unwrap(), vec![1, 2, 3]);
    }
}
