//! Per-share on-disk cache enabling O(new-bytes) incremental sync (§4.4).
//!
//! Grounded on `oxidized-cryptolib::vault::cache`'s fingerprint-keyed,
//! atomic-write-then-rename directory cache, generalized from a single
//! vault-wide cache to one directory per `(shareVaultId, vaultKeyFingerprint)`
//! pair.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::instrument;
use uuid::Uuid;

use crate::model::SyncState;
use crate::transport::compute_chunk_hashes_file;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed cache state: {0}")]
    InvalidState(#[from] serde_json::Error),
}

/// Per-share on-disk cache root:
/// `cache_root/share_cache/{shareVaultId}_{vaultKeyFingerprint}`.
pub struct ShareCache {
    root: PathBuf,
}

impl ShareCache {
    #[must_use]
    pub fn new(cache_root: &Path, share_vault_id: Uuid, vault_key_fingerprint: &str) -> Self {
        let root = cache_root.join("share_cache").join(format!("{share_vault_id}_{vault_key_fingerprint}"));
        Self { root }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn files_dir(&self) -> PathBuf {
        self.root.join("encrypted_files")
    }
    fn thumbs_dir(&self) -> PathBuf {
        self.root.join("encrypted_thumbs")
    }
    fn sync_state_path(&self) -> PathBuf {
        self.root.join("sync_state.json")
    }
    fn last_svdf_path(&self) -> PathBuf {
        self.root.join("last_svdf.bin")
    }

    async fn ensure_dir(dir: &Path) -> Result<(), CacheError> {
        tokio::fs::create_dir_all(dir).await?;
        Ok(())
    }

    #[instrument(level = "debug", skip(self, content))]
    pub async fn store_file(&self, file_id: Uuid, content: &[u8]) -> Result<(), CacheError> {
        Self::ensure_dir(&self.files_dir()).await?;
        atomic_write(&self.files_dir().join(format!("{file_id}.enc")), content).await
    }

    #[instrument(level = "debug", skip(self))]
    pub async fn load_file(&self, file_id: Uuid) -> Result<Vec<u8>, CacheError> {
        Ok(tokio::fs::read(self.files_dir().join(format!("{file_id}.enc"))).await?)
    }

    pub async fn has_file(&self, file_id: Uuid) -> bool {
        tokio::fs::try_exists(self.files_dir().join(format!("{file_id}.enc"))).await.unwrap_or(false)
    }

    #[instrument(level = "debug", skip(self, content))]
    pub async fn store_thumb(&self, file_id: Uuid, content: &[u8]) -> Result<(), CacheError> {
        Self::ensure_dir(&self.thumbs_dir()).await?;
        atomic_write(&self.thumbs_dir().join(format!("{file_id}.enc")), content).await
    }

    #[instrument(level = "debug", skip(self))]
    pub async fn load_thumb(&self, file_id: Uuid) -> Result<Vec<u8>, CacheError> {
        Ok(tokio::fs::read(self.thumbs_dir().join(format!("{file_id}.enc"))).await?)
    }

    pub async fn has_thumb(&self, file_id: Uuid) -> bool {
        tokio::fs::try_exists(self.thumbs_dir().join(format!("{file_id}.enc"))).await.unwrap_or(false)
    }

    /// Removes cached files/thumbs whose id is not in `keep`.
    #[instrument(level = "debug", skip(self, keep))]
    pub async fn prune(&self, keep: &std::collections::HashSet<Uuid>) -> Result<(), CacheError> {
        for dir in [self.files_dir(), self.thumbs_dir()] {
            let Ok(mut entries) = tokio::fs::read_dir(&dir).await else { continue };
            while let Some(entry) = entries.next_entry().await? {
                let Some(stem) = entry.path().file_stem().and_then(|s| s.to_str().map(str::to_string)) else {
                    continue;
                };
                if let Ok(id) = Uuid::parse_str(&stem) {
                    if !keep.contains(&id) {
                        let _ = tokio::fs::remove_file(entry.path()).await;
                    }
                }
            }
        }
        Ok(())
    }

    /// Deletes the entire cache directory for this share.
    #[instrument(level = "debug", skip(self))]
    pub async fn purge(&self) -> Result<(), CacheError> {
        match tokio::fs::remove_dir_all(&self.root).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    #[instrument(level = "debug", skip(self, svdf_bytes))]
    pub async fn save_svdf(&self, svdf_bytes: &[u8]) -> Result<(), CacheError> {
        Self::ensure_dir(&self.root).await?;
        atomic_write(&self.last_svdf_path(), svdf_bytes).await
    }

    /// Copies an already-staged SVDF file into the cache instead of
    /// re-reading it into memory first.
    #[instrument(level = "debug", skip(self))]
    pub async fn save_svdf_from_file(&self, svdf_path: &Path) -> Result<(), CacheError> {
        Self::ensure_dir(&self.root).await?;
        let tmp = self.last_svdf_path().with_extension("bin.tmp");
        tokio::fs::copy(svdf_path, &tmp).await?;
        tokio::fs::rename(&tmp, self.last_svdf_path()).await?;
        Ok(())
    }

    #[instrument(level = "debug", skip(self))]
    pub async fn load_svdf(&self) -> Result<Vec<u8>, CacheError> {
        Ok(tokio::fs::read(self.last_svdf_path()).await?)
    }

    #[must_use]
    pub fn last_svdf_file_path(&self) -> PathBuf {
        self.last_svdf_path()
    }

    pub async fn has_svdf(&self) -> bool {
        tokio::fs::try_exists(self.last_svdf_path()).await.unwrap_or(false)
    }

    #[instrument(level = "debug", skip(self, state))]
    pub async fn save_sync_state(&self, state: &SyncState) -> Result<(), CacheError> {
        Self::ensure_dir(&self.root).await?;
        let json = serde_json::to_vec_pretty(state)?;
        atomic_write(&self.sync_state_path(), &json).await
    }

    #[instrument(level = "debug", skip(self))]
    pub async fn load_sync_state(&self) -> Result<Option<SyncState>, CacheError> {
        match tokio::fs::read(self.sync_state_path()).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Streaming chunk-hash computation over the cached `last_svdf.bin`.
    #[instrument(level = "debug", skip(self))]
    pub async fn compute_chunk_hashes(&self) -> Result<Vec<String>, CacheError> {
        Ok(compute_chunk_hashes_file(&self.last_svdf_path())
            .await
            .map_err(|e| CacheError::Io(std::io::Error::other(e.to_string())))?)
    }
}

/// Atomic write-then-rename, matching the pattern
/// `oxidized-cryptolib::vault::cache` and `oxidized-cli::state` both use
/// for durable JSON/binary state.
async fn atomic_write(path: &Path, content: &[u8]) -> Result<(), CacheError> {
    let tmp_path = path.with_extension(match path.extension().and_then(|e| e.to_str()) {
        Some(ext) => format!("{ext}.tmp"),
        None => "tmp".to_string(),
    });
    let mut file = tokio::fs::File::create(&tmp_path).await?;
    file.write_all(content).await?;
    file.sync_all().await?;
    tokio::fs::rename(&tmp_path, path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_file_thumb_and_sync_state() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = ShareCache::new(tmp.path(), Uuid::new_v4(), "fp");
        let file_id = Uuid::new_v4();

        assert!(!cache.has_file(file_id).await);
        cache.store_file(file_id, b"encrypted-bytes").await.unwrap();
        assert!(cache.has_file(file_id).await);
        assert_eq!(cache.load_file(file_id).await.unwrap(), b"encrypted-bytes");

        cache.store_thumb(file_id, b"thumb-bytes").await.unwrap();
        assert!(cache.has_thumb(file_id).await);

        let mut state = SyncState::default();
        state.sync_sequence = 3;
        cache.save_sync_state(&state).await.unwrap();
        let loaded = cache.load_sync_state().await.unwrap().unwrap();
        assert_eq!(loaded.sync_sequence, 3);
    }

    #[tokio::test]
    async fn prune_removes_ids_not_in_keep_set() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = ShareCache::new(tmp.path(), Uuid::new_v4(), "fp");
        let keep_id = Uuid::new_v4();
        let drop_id = Uuid::new_v4();
        cache.store_file(keep_id, b"1").await.unwrap();
        cache.store_file(drop_id, b"2").await.unwrap();

        let keep = std::collections::HashSet::from([keep_id]);
        cache.prune(&keep).await.unwrap();

        assert!(cache.has_file(keep_id).await);
        assert!(!cache.has_file(drop_id).await);
    }

    #[tokio::test]
    async fn purge_removes_entire_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = ShareCache::new(tmp.path(), Uuid::new_v4(), "fp");
        cache.store_file(Uuid::new_v4(), b"x").await.unwrap();
        cache.purge().await.unwrap();
        assert!(!tokio::fs::try_exists(cache.root()).await.unwrap());
    }
}
