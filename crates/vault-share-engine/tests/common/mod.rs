//! Shared fixtures for the scenario integration tests, mirroring
//! `oxidized-cryptolib/tests/common`'s shape: one helper module per
//! concern, built from each engine's own `#[cfg(test)] make_engine`
//! pattern but usable from outside the crate.

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use vault_share_core::crypto::AeadCrypto;
use vault_share_core::remote::fake_store::InMemoryRemoteStore;
use vault_share_core::remote::RemoteStore;
use vault_share_core::vaultstorage::{FilesystemVaultStorage, VaultStorage};
use vault_share_engine::platform::{BackgroundExecution, DeferredTaskScheduler, NoopPlatform};
use vault_share_engine::{ImportEngine, SyncEngine, UploadEngine};

/// Switches key derivation to the cheap test KDF parameters, the way every
/// engine's own test module does before deriving a share key.
pub fn fast_kdf() {
    std::env::set_var("VAULT_SHARE_FAST_KDF", "1");
}

pub struct Harness {
    pub storage: Arc<FilesystemVaultStorage>,
    pub remote: Arc<InMemoryRemoteStore>,
    pub upload: Arc<UploadEngine>,
    pub sync: Arc<SyncEngine>,
    pub import: Arc<ImportEngine>,
    pub base_dir: std::path::PathBuf,
    pub cache_root: std::path::PathBuf,
}

#[must_use]
pub fn build(tmp: &Path) -> Harness {
    build_on(tmp, Arc::new(InMemoryRemoteStore::new()))
}

/// Builds a second vault's engines against a remote already in use by
/// another harness, the way an import recipient and the sharing owner
/// are two different local vaults talking to the same record store.
#[must_use]
pub fn build_on(tmp: &Path, remote: Arc<InMemoryRemoteStore>) -> Harness {
    let storage = Arc::new(FilesystemVaultStorage::new(tmp.join("vault")));
    let platform = Arc::new(NoopPlatform::new());
    let base_dir = tmp.join("pending_uploads");
    let cache_root = tmp.join("cache");

    let upload = Arc::new(UploadEngine::new(
        Arc::new(AeadCrypto),
        Arc::clone(&storage) as Arc<dyn VaultStorage>,
        Arc::clone(&remote) as Arc<dyn RemoteStore>,
        Arc::clone(&platform) as Arc<dyn BackgroundExecution>,
        Arc::clone(&platform) as Arc<dyn DeferredTaskScheduler>,
        base_dir.clone(),
        cache_root.clone(),
    ));
    let sync = Arc::new(SyncEngine::new(
        Arc::new(AeadCrypto),
        Arc::clone(&storage) as Arc<dyn VaultStorage>,
        Arc::clone(&remote) as Arc<dyn RemoteStore>,
        Arc::clone(&platform) as Arc<dyn BackgroundExecution>,
        tmp.join("pending_syncs"),
        cache_root.clone(),
    ));
    let import = Arc::new(ImportEngine::new(
        Arc::new(AeadCrypto),
        Arc::clone(&storage) as Arc<dyn VaultStorage>,
        Arc::clone(&remote) as Arc<dyn RemoteStore>,
        Arc::clone(&platform) as Arc<dyn BackgroundExecution>,
        tmp.join("pending_imports"),
    ));

    Harness { storage, remote, upload, sync, import, base_dir, cache_root }
}

/// Stores one plaintext file under vault storage and returns its id.
pub async fn store_file(storage: &FilesystemVaultStorage, name: &str, mime: &str, content: Vec<u8>) -> Uuid {
    let id = Uuid::new_v4();
    storage.store_file(id, name, mime, Utc::now(), None, None, content).await.unwrap();
    id
}

/// A byte buffer of exactly `len` bytes, cheap to build and distinct per
/// `seed` so two files never hash identically.
#[must_use]
pub fn sized_content(seed: u8, len: usize) -> Vec<u8> {
    vec![seed; len]
}

/// Marks a file deleted directly in `FilesystemVaultStorage`'s on-disk
/// `headers.json`, standing in for "the owner removed this file" since
/// `VaultStorage` has no public tombstone method (deletion happens inside
/// the real vault storage this trait abstracts away, per its own doc
/// comment on `list_active_files`).
pub async fn mark_deleted(vault_root: &Path, id: Uuid) {
    let path = vault_root.join("headers.json");
    let bytes = tokio::fs::read(&path).await.unwrap();
    let mut raw: Vec<serde_json::Value> = serde_json::from_slice(&bytes).unwrap();
    for entry in &mut raw {
        if entry["id"] == serde_json::json!(id) {
            entry["deleted"] = serde_json::json!(true);
        }
    }
    tokio::fs::write(&path, serde_json::to_vec(&raw).unwrap()).await.unwrap();
}
