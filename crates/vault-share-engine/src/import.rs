//! Import engine (§4.7): claims a share by phrase, downloads its container,
//! and recovers its files into local vault storage. State machine:
//!
//! ```text
//! (none) -> downloading -> extracting -> (removed)
//!                  \            |
//!                   `-> failed/paused (resumable)
//! ```
//!
//! Grounded on `oxidized-cryptolib::vault::locks::VaultLockManager` for the
//! per-share progress table, and on `oxidized-cli`'s atomically-persisted
//! state-file pattern for `PendingImportState`, mirroring `upload.rs`/
//! `sync.rs`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use thiserror::Error;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use vault_share_core::crypto::{derive_share_key_v1, derive_share_key_v2, phrase_vault_id, CryptoError, StreamingCrypto};
use vault_share_core::model::{FileManifestEntry, ImportJob, PendingImportState, ShareKey, SharedFile, ShareVaultId};
use vault_share_core::remote::{policy_from_json, RemoteError, RemoteStore, SharedVault};
use vault_share_core::svdf::{
    extract_and_decrypt_file_content, extract_file_entry_metadata, is_svdf, parse_header, parse_manifest,
    parse_metadata, SvdfError, SvdfHeader,
};
use vault_share_core::transport::{self, TransportError};
use vault_share_core::vaultstorage::{VaultStorage, VaultStorageError};

use crate::jobs::scan_pending_directory;
use crate::platform::BackgroundExecution;

/// Sentinel for "no duration" on a recovered file, matching the SVDF codec's
/// own `NO_DURATION` (not re-exported across the crate boundary).
const NO_DURATION: f64 = -1.0;
/// Attempts for the chunked download step before giving up (§4.7).
const MAX_DOWNLOAD_ATTEMPTS: u32 = 3;

#[derive(Error, Debug)]
pub enum ImportError {
    #[error("svdf error: {0}")]
    Svdf(#[from] SvdfError),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("remote store error: {0}")]
    Remote(#[from] RemoteError),
    #[error("vault storage error: {0}")]
    VaultStorage(#[from] VaultStorageError),
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Composes the codec, transport, remote client, and vault-storage
/// collaborator into the claim-download-extract flow of §4.7. One instance
/// tracks every in-flight import for a recipient's vault.
pub struct ImportEngine {
    crypto: Arc<dyn StreamingCrypto>,
    storage: Arc<dyn VaultStorage>,
    remote: Arc<dyn RemoteStore>,
    background: Arc<dyn BackgroundExecution>,
    base_dir: PathBuf,
    progress: DashMap<ShareVaultId, ImportJob>,
}

impl ImportEngine {
    #[must_use]
    pub fn new(
        crypto: Arc<dyn StreamingCrypto>,
        storage: Arc<dyn VaultStorage>,
        remote: Arc<dyn RemoteStore>,
        background: Arc<dyn BackgroundExecution>,
        base_dir: PathBuf,
    ) -> Self {
        Self { crypto, storage, remote, background, base_dir, progress: DashMap::new() }
    }

    fn share_dir(&self, share_vault_id: ShareVaultId) -> PathBuf {
        self.base_dir.join(share_vault_id.to_string())
    }
    fn state_path(&self, share_vault_id: ShareVaultId) -> PathBuf {
        self.share_dir(share_vault_id).join("state.json")
    }
    fn download_path(&self, share_vault_id: ShareVaultId) -> PathBuf {
        self.share_dir(share_vault_id).join("import_data.bin")
    }

    async fn persist_state(&self, state: &PendingImportState) -> Result<(), ImportError> {
        let dir = self.share_dir(state.share_vault_id);
        tokio::fs::create_dir_all(&dir).await?;
        let json = serde_json::to_vec_pretty(state)?;
        let tmp = self.state_path(state.share_vault_id).with_extension("json.tmp");
        tokio::fs::write(&tmp, &json).await?;
        tokio::fs::rename(&tmp, self.state_path(state.share_vault_id)).await?;
        Ok(())
    }

    async fn load_state(&self, share_vault_id: ShareVaultId) -> Option<PendingImportState> {
        let bytes = tokio::fs::read(self.state_path(share_vault_id)).await.ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    /// Begins or resumes an import by phrase (§4.7 steps 1-3): looks up the
    /// manifest, rejects revoked shares, and tolerates an already-claimed
    /// manifest only when local pending state for the same share already
    /// exists (this recipient's own earlier, interrupted attempt).
    #[instrument(level = "debug", skip(self, phrase))]
    pub async fn start_import(self: &Arc<Self>, phrase: &str) -> Result<ShareVaultId, ImportError> {
        let phrase_vault_id = phrase_vault_id(phrase);
        let manifest = self
            .remote
            .get_manifest_by_phrase(&phrase_vault_id)
            .await?
            .ok_or(RemoteError::VaultNotFound)?;
        if manifest.revoked {
            return Err(ImportError::Remote(RemoteError::Revoked));
        }
        let share_vault_id = manifest.share_vault_id;
        let existing = self.load_state(share_vault_id).await;
        if manifest.claimed && existing.is_none() {
            return Err(ImportError::Remote(RemoteError::AlreadyClaimed));
        }

        let state = match existing {
            Some(state) => state,
            None => {
                let policy = policy_from_json(&manifest.encrypted_policy)?;
                let state = PendingImportState {
                    share_vault_id,
                    phrase: phrase.to_string(),
                    share_key: derive_share_key_v2(phrase)?,
                    policy,
                    total_files: 0,
                    imported_file_ids: Vec::new(),
                    share_vault_version: 0,
                    is_download_complete: false,
                    created_at: Utc::now(),
                    download_error: None,
                };
                self.persist_state(&state).await?;
                state
            }
        };

        let token = self.background.begin();
        let result = self.run_import(manifest, state).await;
        self.background.end(token);
        result?;
        Ok(share_vault_id)
    }

    /// Downloads (if not already complete), detects the container format,
    /// and extracts every not-yet-imported file (§4.7 steps 4-9).
    #[instrument(level = "debug", skip(self, manifest, state))]
    async fn run_import(self: &Arc<Self>, manifest: SharedVault, mut state: PendingImportState) -> Result<(), ImportError> {
        let share_vault_id = state.share_vault_id;
        self.progress.insert(
            share_vault_id,
            ImportJob {
                share_vault_id,
                imported: state.imported_file_ids.len() as u64,
                total: state.total_files,
                download_error: state.download_error.clone(),
            },
        );

        let dir = self.share_dir(share_vault_id);
        tokio::fs::create_dir_all(&dir).await?;
        let download_path = self.download_path(share_vault_id);

        if !state.is_download_complete {
            self.download_with_retry(share_vault_id, manifest.chunk_count, &download_path, &mut state).await?;
            state.is_download_complete = true;
            self.persist_state(&state).await?;
        }

        let mut prefix = [0u8; 4];
        {
            use std::io::Read as _;
            let mut file = std::fs::File::open(&download_path)?;
            let _ = file.read(&mut prefix)?;
        }

        if is_svdf(&prefix) {
            self.import_svdf(&download_path, &mut state).await?;
        } else {
            self.import_legacy(&download_path, &mut state).await?;
        }

        let mut index = self.storage.load_index().await?;
        index.shared_vault_version = index.shared_vault_version.wrapping_add(1);
        self.storage.save_index(index).await?;

        self.progress.remove(&share_vault_id);
        let _ = tokio::fs::remove_dir_all(&dir).await;
        info!(%share_vault_id, "import finalized");
        Ok(())
    }

    async fn download_with_retry(
        &self,
        share_vault_id: ShareVaultId,
        total_chunks: u64,
        download_path: &Path,
        state: &mut PendingImportState,
    ) -> Result<(), ImportError> {
        let mut attempt = 0u32;
        loop {
            match transport::download_to_file(self.remote.as_ref(), share_vault_id, total_chunks, download_path).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt + 1 < MAX_DOWNLOAD_ATTEMPTS => {
                    warn!(%share_vault_id, attempt, error = %e, "retrying import download");
                    tokio::time::sleep(Duration::from_secs(u64::from(attempt) + 1)).await;
                    attempt += 1;
                }
                Err(e) => {
                    state.download_error = Some(e.to_string());
                    self.persist_state(state).await?;
                    return Err(e.into());
                }
            }
        }
    }

    /// Pre-claims the vault, then imports each manifest entry not already
    /// recorded in `state.imported_file_ids`. Tries the v2 share key first;
    /// on a decrypt failure, falls back to the legacy v1-derived key for the
    /// rest of this import (and persists the switch).
    async fn import_svdf(&self, path: &Path, state: &mut PendingImportState) -> Result<(), ImportError> {
        let mut container = std::fs::File::open(path)?;
        let header = parse_header(&mut container)?;

        let (manifest, effective_key) = match self.parse_container(&mut container, &header, &state.share_key) {
            Ok(result) => result,
            Err(ImportError::Svdf(SvdfError::Crypto(CryptoError::DecryptionFailed))) => {
                let v1_key = derive_share_key_v1(&state.phrase)?;
                let (manifest, _) = self.parse_container(&mut container, &header, &v1_key)?;
                state.share_key = v1_key.clone();
                self.persist_state(state).await?;
                (manifest, v1_key)
            }
            Err(e) => return Err(e),
        };

        let live_entries: Vec<FileManifestEntry> = manifest.into_iter().filter(|e| !e.deleted).collect();
        state.total_files = live_entries.len() as u64;
        self.persist_state(state).await?;

        self.storage
            .mark_as_shared_vault(state.share_vault_id, &self.crypto.key_fingerprint(&effective_key))
            .await?;
        if let Err(e) = self.remote.set_claimed(state.share_vault_id).await {
            warn!(share_vault_id = %state.share_vault_id, error = %e, "failed to mark share claimed remotely");
        }

        for entry in &live_entries {
            if state.is_imported(entry.id) {
                continue;
            }
            match self.import_one_svdf_entry(&mut container, &header, entry, &effective_key).await {
                Ok(()) => {
                    state.imported_file_ids.push(entry.id);
                    self.persist_state(state).await?;
                    self.bump_progress(state);
                }
                Err(e) if is_fatal(&e) => return Err(e),
                Err(e) => {
                    warn!(file_id = %entry.id, error = %e, "skipping file that failed to import");
                    state.download_error = Some(e.to_string());
                    self.persist_state(state).await?;
                }
            }
        }
        Ok(())
    }

    fn parse_container(
        &self,
        container: &mut std::fs::File,
        header: &SvdfHeader,
        key: &ShareKey,
    ) -> Result<(Vec<FileManifestEntry>, ShareKey), ImportError> {
        let manifest = parse_manifest(container, header, key, self.crypto.as_ref())?;
        let _metadata = parse_metadata(container, header, key, self.crypto.as_ref())?;
        Ok((manifest, key.clone()))
    }

    async fn import_one_svdf_entry(
        &self,
        container: &mut std::fs::File,
        header: &SvdfHeader,
        entry: &FileManifestEntry,
        share_key: &ShareKey,
    ) -> Result<(), ImportError> {
        let extracted = extract_file_entry_metadata(container, entry, header.version)?;

        let temp_path = std::env::temp_dir().join(format!("vault-share-import-{}", extracted.id));
        {
            let mut sink = std::fs::File::create(&temp_path)?;
            extract_and_decrypt_file_content(
                container,
                extracted.content_offset,
                extracted.content_size,
                share_key,
                self.crypto.as_ref(),
                &mut sink,
            )?;
        }

        let thumbnail = if extracted.encrypted_thumbnail.is_empty() {
            None
        } else {
            Some(self.crypto.decrypt(&extracted.encrypted_thumbnail, share_key)?)
        };
        let created_at = timestamp_to_utc(extracted.created_at);
        let duration = if extracted.duration == NO_DURATION { None } else { Some(extracted.duration) };

        let result = self
            .storage
            .store_file_from_url(extracted.id, &extracted.filename, &extracted.mime_type, created_at, duration, thumbnail, &temp_path)
            .await;
        let _ = tokio::fs::remove_file(&temp_path).await;
        result?;
        Ok(())
    }

    /// Whole-blob decrypt (v2 key, falling back to v1) then legacy decode,
    /// mirroring [`Self::import_svdf`]'s key-fallback shape for the pre-SVDF
    /// format.
    async fn import_legacy(&self, path: &Path, state: &mut PendingImportState) -> Result<(), ImportError> {
        let ciphertext = tokio::fs::read(path).await?;
        let (plaintext, effective_key) = match self.crypto.decrypt(&ciphertext, &state.share_key) {
            Ok(plaintext) => (plaintext, state.share_key.clone()),
            Err(CryptoError::DecryptionFailed) => {
                let v1_key = derive_share_key_v1(&state.phrase)?;
                let plaintext = self.crypto.decrypt(&ciphertext, &v1_key)?;
                state.share_key = v1_key.clone();
                self.persist_state(state).await?;
                (plaintext, v1_key)
            }
            Err(e) => return Err(e.into()),
        };

        let legacy = vault_share_core::svdf::legacy::decode_shared_vault_data(&plaintext)?;
        state.total_files = legacy.files.len() as u64;
        self.persist_state(state).await?;

        self.storage
            .mark_as_shared_vault(state.share_vault_id, &self.crypto.key_fingerprint(&effective_key))
            .await?;
        if let Err(e) = self.remote.set_claimed(state.share_vault_id).await {
            warn!(share_vault_id = %state.share_vault_id, error = %e, "failed to mark share claimed remotely");
        }

        for file in &legacy.files {
            if state.is_imported(file.id) {
                continue;
            }
            match self.import_one_legacy_file(file, &effective_key).await {
                Ok(()) => {
                    state.imported_file_ids.push(file.id);
                    self.persist_state(state).await?;
                    self.bump_progress(state);
                }
                Err(e) if is_fatal(&e) => return Err(e),
                Err(e) => {
                    warn!(file_id = %file.id, error = %e, "skipping legacy file that failed to import");
                    state.download_error = Some(e.to_string());
                    self.persist_state(state).await?;
                }
            }
        }
        Ok(())
    }

    async fn import_one_legacy_file(&self, file: &SharedFile, share_key: &ShareKey) -> Result<(), ImportError> {
        let content = self.crypto.decrypt(&file.encrypted_content, share_key)?;
        let thumbnail = if file.encrypted_thumbnail.is_empty() {
            None
        } else {
            Some(self.crypto.decrypt(&file.encrypted_thumbnail, share_key)?)
        };
        let created_at = timestamp_to_utc(file.created_at);
        let duration = if file.duration == NO_DURATION { None } else { Some(file.duration) };

        self.storage
            .store_file(file.id, &file.filename, &file.mime_type, created_at, duration, thumbnail, content)
            .await?;
        Ok(())
    }

    fn bump_progress(&self, state: &PendingImportState) {
        if let Some(mut progress) = self.progress.get_mut(&state.share_vault_id) {
            progress.imported = state.imported_file_ids.len() as u64;
        }
    }

    /// Resumes every import still on disk under `pending_imports/*` whose
    /// TTL hasn't elapsed, re-fetching the manifest (for `chunk_count`) if
    /// the download itself didn't finish last time.
    #[instrument(level = "debug", skip(self))]
    pub async fn resume_pending_imports(self: &Arc<Self>) -> Result<(), ImportError> {
        let now = Utc::now();
        let (live, stale) = scan_pending_directory(
            &self.base_dir,
            |name| Uuid::parse_str(name).ok(),
            |path| async move {
                let bytes = tokio::fs::read(path.join("state.json")).await.ok()?;
                serde_json::from_slice::<PendingImportState>(&bytes).ok()
            },
            |state: &PendingImportState| state.is_expired(now),
        )
        .await?;

        for path in stale {
            let _ = tokio::fs::remove_dir_all(path).await;
        }

        for (share_vault_id, state) in live {
            let Some(manifest) = self.remote.get_manifest(share_vault_id).await? else {
                continue;
            };
            let token = self.background.begin();
            if let Err(e) = self.run_import(manifest, state).await {
                warn!(%share_vault_id, error = %e, "resuming import failed");
            }
            self.background.end(token);
        }
        Ok(())
    }

    #[must_use]
    pub fn import_progress(&self, share_vault_id: ShareVaultId) -> Option<ImportJob> {
        self.progress.get(&share_vault_id).map(|p| p.clone())
    }
}

fn timestamp_to_utc(seconds: f64) -> DateTime<Utc> {
    DateTime::from_timestamp(seconds as i64, 0).unwrap_or_else(Utc::now)
}

/// Distinguishes a whole-import-aborting error (storage exhausted) from a
/// per-file error the import loop just logs and moves past (§4.7's
/// recoverable-vs-fatal split).
fn is_fatal(error: &ImportError) -> bool {
    matches!(error, ImportError::Io(e) if e.kind() == std::io::ErrorKind::StorageFull)
}

#[cfg(test)]
mod tests {
    use super::*;
    use vault_share_core::crypto::{derive_share_key_v2, AeadCrypto, Crypto};
    use vault_share_core::model::{SharePolicy, SvdfMetadata};
    use vault_share_core::remote::fake_store::InMemoryRemoteStore;
    use vault_share_core::remote::policy_to_json;
    use vault_share_core::svdf::build_full_streaming;
    use vault_share_core::vaultstorage::FilesystemVaultStorage;

    use crate::platform::NoopPlatform;

    fn fast_kdf() {
        std::env::set_var("VAULT_SHARE_FAST_KDF", "1");
    }

    fn make_engine(tmp: &std::path::Path) -> (Arc<ImportEngine>, Arc<FilesystemVaultStorage>, Arc<InMemoryRemoteStore>) {
        let storage = Arc::new(FilesystemVaultStorage::new(tmp.join("vault")));
        let remote = Arc::new(InMemoryRemoteStore::new());
        let platform = Arc::new(NoopPlatform::new());
        let engine = Arc::new(ImportEngine::new(
            Arc::new(AeadCrypto),
            Arc::clone(&storage) as Arc<dyn VaultStorage>,
            Arc::clone(&remote) as Arc<dyn RemoteStore>,
            platform as Arc<dyn BackgroundExecution>,
            tmp.join("pending_imports"),
        ));
        (engine, storage, remote)
    }

    async fn seed_share(remote: &InMemoryRemoteStore, phrase: &str, file: SharedFile) -> Uuid {
        let share_key = derive_share_key_v2(phrase).unwrap();
        let metadata = SvdfMetadata { owner_fingerprint: "owner".to_string(), shared_at: 1.0 };
        let mut buf = std::io::Cursor::new(Vec::new());
        build_full_streaming(&mut buf, 1, |_| file.clone(), &metadata, &share_key, &AeadCrypto).unwrap();
        let container = buf.into_inner();

        let share_vault_id = Uuid::new_v4();
        remote
            .save_manifest(SharedVault {
                share_vault_id,
                phrase_vault_id: phrase_vault_id(phrase),
                updated_at: Utc::now(),
                version: SharedVault::INITIAL_VERSION,
                owner_fingerprint: "owner".to_string(),
                chunk_count: 1,
                claimed: false,
                revoked: false,
                consumed: false,
                encrypted_policy: policy_to_json(&SharePolicy::default()).unwrap(),
            })
            .await
            .unwrap();
        remote.save_chunk(share_vault_id, 0, container).await.unwrap();
        share_vault_id
    }

    #[tokio::test]
    async fn fresh_import_downloads_and_stores_every_file() {
        fast_kdf();
        let tmp = tempfile::tempdir().unwrap();
        let (engine, storage, remote) = make_engine(tmp.path());

        let phrase = "import test phrase";
        let share_key = derive_share_key_v2(phrase).unwrap();
        let file = SharedFile {
            id: Uuid::new_v4(),
            filename: "a.txt".to_string(),
            mime_type: "text/plain".to_string(),
            original_size: 5,
            created_at: 1_700_000_000.0,
            duration: NO_DURATION,
            encrypted_thumbnail: vec![],
            encrypted_content: AeadCrypto.encrypt(b"hello", &share_key).unwrap(),
        };
        let share_vault_id = seed_share(&remote, phrase, file).await;

        let returned_id = engine.start_import(phrase).await.unwrap();
        assert_eq!(returned_id, share_vault_id);

        let active = storage.list_active_files().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].filename, "a.txt");

        let manifest = remote.get_manifest(share_vault_id).await.unwrap().unwrap();
        assert!(manifest.claimed);
        assert!(engine.import_progress(share_vault_id).is_none(), "progress cleared once finalized");
    }

    #[tokio::test]
    async fn claiming_an_already_imported_share_with_no_local_state_fails() {
        fast_kdf();
        let tmp = tempfile::tempdir().unwrap();
        let (engine, _storage, remote) = make_engine(tmp.path());

        let phrase = "already claimed phrase";
        let share_key = derive_share_key_v2(phrase).unwrap();
        let file = SharedFile {
            id: Uuid::new_v4(),
            filename: "b.txt".to_string(),
            mime_type: "text/plain".to_string(),
            original_size: 1,
            created_at: 1_700_000_000.0,
            duration: NO_DURATION,
            encrypted_thumbnail: vec![],
            encrypted_content: AeadCrypto.encrypt(b"x", &share_key).unwrap(),
        };
        let share_vault_id = seed_share(&remote, phrase, file).await;
        remote.set_claimed(share_vault_id).await.unwrap();

        let result = engine.start_import(phrase).await;
        assert!(matches!(result, Err(ImportError::Remote(RemoteError::AlreadyClaimed))));
    }

    #[tokio::test]
    async fn revoked_share_is_rejected() {
        fast_kdf();
        let tmp = tempfile::tempdir().unwrap();
        let (engine, _storage, remote) = make_engine(tmp.path());

        let phrase = "revoked phrase";
        let share_key = derive_share_key_v2(phrase).unwrap();
        let file = SharedFile {
            id: Uuid::new_v4(),
            filename: "c.txt".to_string(),
            mime_type: "text/plain".to_string(),
            original_size: 1,
            created_at: 1_700_000_000.0,
            duration: NO_DURATION,
            encrypted_thumbnail: vec![],
            encrypted_content: AeadCrypto.encrypt(b"x", &share_key).unwrap(),
        };
        let share_vault_id = seed_share(&remote, phrase, file).await;
        remote.set_revoked(share_vault_id).await.unwrap();

        let result = engine.start_import(phrase).await;
        assert!(matches!(result, Err(ImportError::Remote(RemoteError::Revoked))));
    }
}
