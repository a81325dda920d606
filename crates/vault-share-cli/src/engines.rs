//! Wires one `UploadEngine`/`SyncEngine`/`ImportEngine` trio together for a
//! single vault directory, the way `main.rs::unlock_vault` assembles a
//! `VaultOperations` handle from a vault path in the teacher.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use vault_share_core::crypto::{AeadCrypto, StreamingCrypto};
use vault_share_core::remote::RemoteStore;
use vault_share_core::vaultstorage::{FilesystemVaultStorage, VaultStorage};
use vault_share_engine::platform::{BackgroundExecution, DeferredTaskScheduler, NoopPlatform};
use vault_share_engine::{ImportEngine, SyncEngine, UploadEngine};

use crate::remote_store::FilesystemRemoteStore;

pub struct Engines {
    pub upload: Arc<UploadEngine>,
    pub sync: Arc<SyncEngine>,
    pub import: Arc<ImportEngine>,
    pub storage: Arc<dyn VaultStorage>,
}

/// Directory everyone sharing a machine-local "remote" agrees on, analogous
/// to the real record-store backend being a single shared service. Defaults
/// under the OS data directory, the way the teacher's `MountStateManager`
/// locates its state file via `directories::ProjectDirs`.
#[must_use]
pub fn default_remote_dir() -> PathBuf {
    directories::ProjectDirs::from("", "", "vault-share")
        .map(|dirs| dirs.data_dir().join("remote"))
        .unwrap_or_else(|| PathBuf::from(".vault-share-remote"))
}

#[must_use]
pub fn build(vault_dir: &Path, remote_dir: &Path) -> Engines {
    let crypto: Arc<dyn StreamingCrypto> = Arc::new(AeadCrypto);
    let storage: Arc<dyn VaultStorage> = Arc::new(FilesystemVaultStorage::new(vault_dir.join("data")));
    let remote: Arc<dyn RemoteStore> = Arc::new(FilesystemRemoteStore::new(remote_dir.to_path_buf()));
    let platform = Arc::new(NoopPlatform::new());
    let background: Arc<dyn BackgroundExecution> = Arc::clone(&platform) as Arc<dyn BackgroundExecution>;
    let scheduler: Arc<dyn DeferredTaskScheduler> = Arc::clone(&platform) as Arc<dyn DeferredTaskScheduler>;

    let state_dir = vault_dir.join(".vault-share");
    let cache_root = state_dir.join("cache");

    let upload = Arc::new(UploadEngine::new(
        Arc::clone(&crypto),
        Arc::clone(&storage),
        Arc::clone(&remote),
        Arc::clone(&background),
        Arc::clone(&scheduler),
        state_dir.join("pending_uploads"),
        cache_root.clone(),
    ));
    let sync = Arc::new(SyncEngine::new(
        Arc::clone(&crypto),
        Arc::clone(&storage),
        Arc::clone(&remote),
        Arc::clone(&background),
        state_dir.join("pending_syncs"),
        cache_root,
    ));
    let import = Arc::new(ImportEngine::new(
        crypto,
        Arc::clone(&storage),
        remote,
        background,
        state_dir.join("pending_imports"),
    ));

    Engines { upload, sync, import, storage }
}
