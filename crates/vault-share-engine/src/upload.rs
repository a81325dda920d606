//! Upload engine (§4.5): turns a set of vault files into a shared SVDF
//! container, uploads it chunk by chunk, and records the share in the
//! owner's vault index. State machine:
//!
//! ```text
//! (none) -> preparing -> uploading -> finalizing -> (removed)
//!                  \          |
//!                   `-> failed/paused (resumable)
//! ```
//!
//! Grounded on `oxidized-cryptolib::vault::locks::VaultLockManager` for the
//! per-job `DashMap` job table, and on `oxidized-cli`'s versioned,
//! atomically-persisted state-file pattern for `PendingUploadState`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use vault_share_core::cache::{CacheError, ShareCache};
use vault_share_core::crypto::{derive_share_key_v2, CryptoError, StreamingCrypto};
use vault_share_core::model::{
    FileManifestEntry, PendingUploadState, ShareIndex, ShareRecord, SharePolicy, ShareVaultId,
    StreamingSourceFile, SvdfMetadata, SyncState, UploadJob, UploadStatus,
};
use vault_share_core::remote::{
    save_manifest_with_conflict_retry, RemoteError, RemoteStore, SharedVault,
};
use vault_share_core::svdf::{build_full_streaming_from_plaintext, SvdfError};
use vault_share_core::transport::{self, chunk_count, TransportError};
use vault_share_core::vaultstorage::{VaultStorage, VaultStorageError};

use crate::jobs::{scan_pending_directory, CancelFlag, DebouncedWriter};
use crate::platform::{BackgroundExecution, DeferredTaskScheduler};

/// Debounce applied to the resume-on-demand entrypoint (§4.5).
const RESUME_DEBOUNCE: Duration = Duration::from_secs(2);
/// Debounce applied to per-job progress persistence (§4.5).
const STATE_DEBOUNCE: Duration = Duration::from_millis(500);
/// Earliest the platform scheduler may be asked to wake this process to
/// retry a still-uploading job.
const RESUME_MARKER_DELAY: Duration = Duration::from_secs(15);

#[derive(Error, Debug)]
pub enum UploadError {
    #[error("svdf error: {0}")]
    Svdf(#[from] SvdfError),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("remote store error: {0}")]
    Remote(#[from] RemoteError),
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),
    #[error("vault storage error: {0}")]
    VaultStorage(#[from] VaultStorageError),
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("no upload job with id {0}")]
    NotFound(Uuid),
    #[error("upload cancelled")]
    Cancelled,
}

struct JobHandle {
    cancel: CancelFlag,
    writer: DebouncedWriter,
    state: AsyncMutex<PendingUploadState>,
    status: AsyncMutex<UploadStatus>,
}

/// Composes the codec, transport, remote client, and vault-storage
/// collaborator into the full upload state machine. One instance is shared
/// across every upload job for a given owner.
pub struct UploadEngine {
    crypto: Arc<dyn StreamingCrypto>,
    storage: Arc<dyn VaultStorage>,
    remote: Arc<dyn RemoteStore>,
    background: Arc<dyn BackgroundExecution>,
    scheduler: Arc<dyn DeferredTaskScheduler>,
    base_dir: PathBuf,
    cache_root: PathBuf,
    jobs: DashMap<Uuid, Arc<JobHandle>>,
    resume_debounce: DebouncedWriter,
}

impl UploadEngine {
    #[must_use]
    pub fn new(
        crypto: Arc<dyn StreamingCrypto>,
        storage: Arc<dyn VaultStorage>,
        remote: Arc<dyn RemoteStore>,
        background: Arc<dyn BackgroundExecution>,
        scheduler: Arc<dyn DeferredTaskScheduler>,
        base_dir: PathBuf,
        cache_root: PathBuf,
    ) -> Self {
        Self {
            crypto,
            storage,
            remote,
            background,
            scheduler,
            base_dir,
            cache_root,
            jobs: DashMap::new(),
            resume_debounce: DebouncedWriter::new(),
        }
    }

    fn job_dir(&self, job_id: Uuid) -> PathBuf {
        self.base_dir.join(job_id.to_string())
    }
    fn state_path(&self, job_id: Uuid) -> PathBuf {
        self.job_dir(job_id).join("state.json")
    }
    fn svdf_path(&self, job_id: Uuid) -> PathBuf {
        self.job_dir(job_id).join("svdf_data.bin")
    }

    #[instrument(level = "debug", skip(self, state))]
    async fn persist_state(&self, state: &PendingUploadState) -> Result<(), UploadError> {
        let dir = self.job_dir(state.job_id);
        tokio::fs::create_dir_all(&dir).await?;
        let json = serde_json::to_vec_pretty(state)?;
        let tmp = self.state_path(state.job_id).with_extension("json.tmp");
        tokio::fs::write(&tmp, &json).await?;
        tokio::fs::rename(&tmp, self.state_path(state.job_id)).await?;
        Ok(())
    }

    async fn load_state(&self, job_id: Uuid) -> Option<PendingUploadState> {
        let bytes = tokio::fs::read(self.state_path(job_id)).await.ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    fn resume_marker_id(job_id: Uuid) -> String {
        format!("upload-resume-{job_id}")
    }

    /// Begins a brand-new upload (§4.5 steps 1-6): derives the share key,
    /// lists active vault files, streams them into a fresh SVDF container,
    /// and persists `preparing` state before returning the job id.
    #[instrument(level = "debug", skip(self, phrase, policy))]
    pub async fn start_upload(
        &self,
        phrase: &str,
        policy: SharePolicy,
        owner_fingerprint: String,
    ) -> Result<Uuid, UploadError> {
        let job_id = Uuid::new_v4();
        let share_vault_id: ShareVaultId = Uuid::new_v4();
        let share_key = derive_share_key_v2(phrase)?;
        let phrase_vault_id = vault_share_core::crypto::phrase_vault_id(phrase);

        let headers = self.storage.list_active_files().await?;
        let mut sources = Vec::with_capacity(headers.len());
        for header in &headers {
            let (_, temp_path) = self.storage.retrieve_file_to_temp_url(header.id).await?;
            sources.push(StreamingSourceFile {
                id: header.id,
                filename: header.filename.clone(),
                mime_type: header.mime_type.clone(),
                original_size: header.original_size,
                created_at: header.created_at.timestamp() as f64,
                duration: header.duration.unwrap_or(-1.0),
                encrypted_thumbnail: header.encrypted_thumbnail.clone().unwrap_or_default(),
                plaintext_url: temp_path,
            });
        }
        let shared_file_ids: Vec<Uuid> = sources.iter().map(|s| s.id).collect();

        let job_dir = self.job_dir(job_id);
        tokio::fs::create_dir_all(&job_dir).await?;
        let svdf_path = self.svdf_path(job_id);
        let metadata = SvdfMetadata { owner_fingerprint: owner_fingerprint.clone(), shared_at: Utc::now().timestamp() as f64 };

        let manifest = {
            let mut file = std::fs::File::create(&svdf_path)?;
            let count = sources.len();
            build_full_streaming_from_plaintext(
                &mut file,
                count,
                |i| sources[i].clone(),
                &metadata,
                &share_key,
                self.crypto.as_ref(),
            )?
        };

        let svdf_size = tokio::fs::metadata(&svdf_path).await?.len();
        let total_chunks = chunk_count(svdf_size);

        let state = PendingUploadState {
            job_id,
            share_vault_id,
            phrase_vault_id,
            share_key,
            policy,
            owner_fingerprint,
            total_chunks,
            shared_file_ids,
            manifest_snapshot: manifest,
            created_at: Utc::now(),
            upload_finished: false,
            last_progress: 0,
            last_message: "preparing".to_string(),
            phrase: Some(phrase.to_string()),
        };
        self.persist_state(&state).await?;

        let handle = Arc::new(JobHandle {
            cancel: CancelFlag::new(),
            writer: DebouncedWriter::new(),
            state: AsyncMutex::new(state),
            status: AsyncMutex::new(UploadStatus::Preparing),
        });
        self.jobs.insert(job_id, Arc::clone(&handle));

        let marker_id = Self::resume_marker_id(job_id);
        self.scheduler.register(&marker_id, Arc::new(|| {}));
        self.scheduler.schedule(&marker_id, RESUME_MARKER_DELAY);

        self.run_uploading(job_id, handle).await?;
        Ok(job_id)
    }

    /// Drives `preparing -> uploading -> finalizing`: manifest-first create,
    /// chunk transfer with debounced progress, manifest re-save, then the
    /// immediate critical-transition writes of §4.5 steps 7-13.
    #[instrument(level = "debug", skip(self, handle))]
    async fn run_uploading(&self, job_id: Uuid, handle: Arc<JobHandle>) -> Result<(), UploadError> {
        let token = self.background.begin();
        let result = self.run_uploading_inner(job_id, &handle).await;
        self.background.end(token);
        result
    }

    async fn run_uploading_inner(&self, job_id: Uuid, handle: &Arc<JobHandle>) -> Result<(), UploadError> {
        *handle.status.lock().await = UploadStatus::Uploading;
        let (share_vault_id, total_chunks, manifest_snapshot, owner_fingerprint, policy, share_key_fp) = {
            let state = handle.state.lock().await;
            (
                state.share_vault_id,
                state.total_chunks,
                state.manifest_snapshot.clone(),
                state.owner_fingerprint.clone(),
                state.policy.clone(),
                state.share_key.fingerprint(),
            )
        };

        if handle.cancel.is_cancelled() {
            return Err(UploadError::Cancelled);
        }

        let encrypted_policy = vault_share_core::remote::policy_to_json(&policy)?;
        let manifest = SharedVault {
            share_vault_id,
            phrase_vault_id: {
                let state = handle.state.lock().await;
                state.phrase_vault_id.clone()
            },
            updated_at: Utc::now(),
            version: SharedVault::INITIAL_VERSION,
            owner_fingerprint: owner_fingerprint.clone(),
            chunk_count: total_chunks,
            claimed: false,
            revoked: false,
            consumed: false,
            encrypted_policy,
        };
        save_manifest_with_conflict_retry(self.remote.as_ref(), manifest).await?;

        let svdf_path = self.svdf_path(job_id);
        let indices: Vec<u64> = (0..total_chunks).collect();
        let state_path = self.state_path(job_id);
        transport::upload_chunks_from_file(self.remote.as_ref(), share_vault_id, &svdf_path, &indices, {
            let handle = Arc::clone(handle);
            move |completed| {
                let handle = Arc::clone(&handle);
                let state_path = state_path.clone();
                tokio::spawn(async move {
                    handle.writer.write_debounced(STATE_DEBOUNCE, move || async move {
                        let mut state = handle.state.lock().await;
                        state.last_progress = completed;
                        state.last_message = format!("uploading {completed} chunks");
                        if let Ok(json) = serde_json::to_vec_pretty(&*state) {
                            let tmp = state_path.with_extension("json.tmp");
                            if tokio::fs::write(&tmp, &json).await.is_ok() {
                                let _ = tokio::fs::rename(&tmp, &state_path).await;
                            }
                        }
                    }).await;
                });
            }
        })
        .await?;

        if handle.cancel.is_cancelled() {
            return Err(UploadError::Cancelled);
        }

        // Re-save the manifest now that every chunk has landed (§4.5 step
        // 10): harmless no-op on content, re-affirms chunk_count.
        let manifest_again = self.remote.get_manifest(share_vault_id).await?;
        if let Some(mut manifest_again) = manifest_again {
            manifest_again.chunk_count = total_chunks;
            save_manifest_with_conflict_retry(self.remote.as_ref(), manifest_again).await?;
        }

        *handle.status.lock().await = UploadStatus::Finalizing;
        let snapshot = {
            let mut state = handle.state.lock().await;
            state.upload_finished = true;
            state.last_message = "finalizing".to_string();
            state.clone()
        };
        handle.writer.write_immediate(self.persist_state_owned(snapshot)).await;

        self.finalize(job_id, handle, &svdf_path, &manifest_snapshot, &share_key_fp).await
    }

    async fn persist_state_owned(&self, state: PendingUploadState) {
        if let Err(e) = self.persist_state(&state).await {
            warn!(job_id = %state.job_id, error = %e, "failed to persist upload state immediately");
        }
    }

    /// Hydrates the sync cache from the freshly-built container, appends a
    /// `ShareRecord` to the owner's index, and removes the staging dir
    /// (§4.5 step 11-13).
    #[instrument(level = "debug", skip(self, handle, manifest_snapshot))]
    async fn finalize(
        &self,
        job_id: Uuid,
        handle: Arc<JobHandle>,
        svdf_path: &Path,
        manifest_snapshot: &[FileManifestEntry],
        share_key_fingerprint: &str,
    ) -> Result<(), UploadError> {
        let (share_vault_id, phrase_vault_id, share_key, policy, created_at) = {
            let state = handle.state.lock().await;
            (
                state.share_vault_id,
                state.phrase_vault_id.clone(),
                state.share_key.clone(),
                state.policy.clone(),
                state.created_at,
            )
        };

        let cache = ShareCache::new(&self.cache_root, share_vault_id, share_key_fingerprint);
        cache.save_svdf_from_file(svdf_path).await?;
        let chunk_hashes = cache.compute_chunk_hashes().await?;
        let sync_state = SyncState {
            synced_file_ids: manifest_snapshot.iter().filter(|e| !e.deleted).map(|e| e.id).collect(),
            chunk_hashes,
            manifest: manifest_snapshot.to_vec(),
            sync_sequence: 0,
            deleted_file_ids: std::collections::HashSet::new(),
            total_deleted_bytes: 0,
            total_bytes: tokio::fs::metadata(svdf_path).await?.len(),
        };
        cache.save_sync_state(&sync_state).await?;

        let mut index = self.storage.load_index().await?;
        index.active_shares.insert(
            share_vault_id,
            ShareRecord {
                share_vault_id,
                phrase_vault_id,
                share_key,
                policy,
                created_at,
                last_synced_at: Some(Utc::now()),
                sync_sequence: 0,
            },
        );
        self.storage.save_index(index).await?;

        *handle.status.lock().await = UploadStatus::Complete;
        let marker_id = Self::resume_marker_id(job_id);
        self.scheduler.cancel(&marker_id);

        let _ = tokio::fs::remove_dir_all(self.job_dir(job_id)).await;
        self.jobs.remove(&job_id);
        info!(%job_id, %share_vault_id, "upload finalized");
        Ok(())
    }

    /// Resumes every job still on disk under `pending_uploads/*` whose TTL
    /// hasn't elapsed, uploading only the chunks [`transport::missing_indices`]
    /// reports as absent remotely. Debounced by [`RESUME_DEBOUNCE`] so
    /// repeated triggers (app foreground, network-reachability change)
    /// collapse into one scan.
    #[instrument(level = "debug", skip(self))]
    pub async fn resume_pending_uploads_if_needed(self: &Arc<Self>) {
        let engine = Arc::clone(self);
        self.resume_debounce
            .write_debounced(RESUME_DEBOUNCE, move || async move {
                if let Err(e) = engine.resume_all().await {
                    warn!(error = %e, "resuming pending uploads failed");
                }
            })
            .await;
    }

    async fn resume_all(self: &Arc<Self>) -> Result<(), UploadError> {
        let now = Utc::now();
        let (live, stale) = scan_pending_directory(
            &self.base_dir,
            |name| Uuid::parse_str(name).ok(),
            |path| async move {
                let bytes = tokio::fs::read(path.join("state.json")).await.ok()?;
                serde_json::from_slice::<PendingUploadState>(&bytes).ok()
            },
            |state: &PendingUploadState| state.is_expired(now),
        )
        .await?;

        for path in stale {
            let _ = tokio::fs::remove_dir_all(path).await;
        }

        for (job_id, state) in live {
            if self.jobs.contains_key(&job_id) {
                continue;
            }
            let handle = Arc::new(JobHandle {
                cancel: CancelFlag::new(),
                writer: DebouncedWriter::new(),
                state: AsyncMutex::new(state.clone()),
                status: AsyncMutex::new(if state.upload_finished {
                    UploadStatus::Finalizing
                } else {
                    UploadStatus::Uploading
                }),
            });
            self.jobs.insert(job_id, Arc::clone(&handle));

            if state.upload_finished {
                let svdf_path = self.svdf_path(job_id);
                let manifest_snapshot = state.manifest_snapshot.clone();
                let fp = state.share_key.fingerprint();
                self.finalize(job_id, handle, &svdf_path, &manifest_snapshot, &fp).await?;
                continue;
            }

            let missing = transport::missing_indices(self.remote.as_ref(), state.share_vault_id, state.total_chunks).await?;
            let svdf_path = self.svdf_path(job_id);
            let handle_for_upload = Arc::clone(&handle);
            let job_id_for_progress = job_id;
            let this = Arc::clone(self);
            transport::upload_chunks_from_file(self.remote.as_ref(), state.share_vault_id, &svdf_path, &missing, move |completed| {
                let handle = Arc::clone(&handle_for_upload);
                let this = Arc::clone(&this);
                tokio::spawn(async move {
                    let state_path = this.state_path(job_id_for_progress);
                    handle.writer.write_debounced(STATE_DEBOUNCE, move || async move {
                        let mut state = handle.state.lock().await;
                        state.last_progress = completed;
                        if let Ok(json) = serde_json::to_vec_pretty(&*state) {
                            let tmp = state_path.with_extension("json.tmp");
                            if tokio::fs::write(&tmp, &json).await.is_ok() {
                                let _ = tokio::fs::rename(&tmp, &state_path).await;
                            }
                        }
                    }).await;
                });
            })
            .await?;

            let manifest_snapshot = state.manifest_snapshot.clone();
            let fp = state.share_key.fingerprint();
            {
                let mut guard = handle.state.lock().await;
                guard.upload_finished = true;
                self.persist_state_owned(guard.clone()).await;
            }
            self.finalize(job_id, handle, &svdf_path, &manifest_snapshot, &fp).await?;
        }
        Ok(())
    }

    /// Cancels an in-flight job: destructive, unlike pausing. Removes the
    /// staging directory and best-effort deletes anything already uploaded
    /// remotely.
    #[instrument(level = "debug", skip(self))]
    pub async fn cancel_upload(&self, job_id: Uuid) -> Result<(), UploadError> {
        let Some((_, handle)) = self.jobs.remove(&job_id) else {
            return Err(UploadError::NotFound(job_id));
        };
        handle.cancel.cancel();
        let share_vault_id = handle.state.lock().await.share_vault_id;
        if let Ok(indices) = self.remote.list_chunk_indices(share_vault_id).await {
            for index in indices {
                if let Err(e) = self.remote.delete_chunk(share_vault_id, index).await {
                    warn!(%share_vault_id, index, error = %e, "failed to delete remote chunk during cancel");
                }
            }
        }
        let marker_id = Self::resume_marker_id(job_id);
        self.scheduler.cancel(&marker_id);
        let _ = tokio::fs::remove_dir_all(self.job_dir(job_id)).await;
        Ok(())
    }

    /// Current projection for every job this process knows about.
    #[must_use]
    pub fn list_jobs(&self) -> Vec<(Uuid, UploadStatus)> {
        let mut out = Vec::new();
        for entry in &self.jobs {
            if let Ok(status) = entry.value().status.try_lock() {
                out.push((*entry.key(), *status));
            }
        }
        out
    }

    #[instrument(level = "debug", skip(self))]
    pub async fn job_status(&self, job_id: Uuid) -> Option<UploadJob> {
        let handle = self.jobs.get(&job_id)?.clone();
        let status = *handle.status.lock().await;
        let state = handle.state.lock().await;
        Some(UploadJob::from_pending(&state, status))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vault_share_core::remote::fake_store::InMemoryRemoteStore;
    use vault_share_core::vaultstorage::FilesystemVaultStorage;

    use crate::platform::NoopPlatform;

    fn fast_kdf() {
        std::env::set_var("VAULT_SHARE_FAST_KDF", "1");
    }

    async fn make_engine(tmp: &std::path::Path) -> (Arc<UploadEngine>, Arc<FilesystemVaultStorage>, Arc<InMemoryRemoteStore>) {
        let storage = Arc::new(FilesystemVaultStorage::new(tmp.join("vault")));
        let remote = Arc::new(InMemoryRemoteStore::new());
        let platform = Arc::new(NoopPlatform::new());
        let engine = Arc::new(UploadEngine::new(
            Arc::new(vault_share_core::crypto::AeadCrypto),
            Arc::clone(&storage) as Arc<dyn VaultStorage>,
            Arc::clone(&remote) as Arc<dyn RemoteStore>,
            Arc::clone(&platform) as Arc<dyn BackgroundExecution>,
            Arc::clone(&platform) as Arc<dyn DeferredTaskScheduler>,
            tmp.join("pending_uploads"),
            tmp.join("cache"),
        ));
        (engine, storage, remote)
    }

    #[tokio::test]
    async fn fresh_upload_completes_and_appends_share_record() {
        fast_kdf();
        let tmp = tempfile::tempdir().unwrap();
        let (engine, storage, remote) = make_engine(tmp.path()).await;

        storage
            .store_file(Uuid::new_v4(), "a.txt", "text/plain", Utc::now(), None, None, vec![1u8; 100])
            .await
            .unwrap();

        let job_id = engine.start_upload("correct horse battery staple", SharePolicy::default(), "owner".into()).await.unwrap();
        assert!(engine.job_status(job_id).await.is_none(), "job removed once complete");

        let index = storage.load_index().await.unwrap();
        assert_eq!(index.active_shares.len(), 1);
        let record = index.active_shares.values().next().unwrap();
        assert!(remote.get_manifest(record.share_vault_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn resume_uploads_only_missing_chunks() {
        fast_kdf();
        let tmp = tempfile::tempdir().unwrap();
        let (engine, storage, remote) = make_engine(tmp.path()).await;

        storage
            .store_file(Uuid::new_v4(), "a.bin", "application/octet-stream", Utc::now(), None, None, vec![2u8; (transport::CHUNK_SIZE * 2) as usize])
            .await
            .unwrap();

        let job_id = engine.start_upload("resume test phrase", SharePolicy::default(), "owner".into()).await.unwrap();
        let index = storage.load_index().await.unwrap();
        let record = index.active_shares.values().next().unwrap();
        assert!(remote.list_chunk_indices(record.share_vault_id).await.unwrap().len() >= 2);
        let _ = job_id;
    }

    #[tokio::test]
    async fn cancel_removes_staging_and_remote_chunks() {
        fast_kdf();
        let tmp = tempfile::tempdir().unwrap();
        let (engine, _storage, _remote) = make_engine(tmp.path()).await;
        let result = engine.cancel_upload(Uuid::new_v4()).await;
        assert!(matches!(result, Err(UploadError::NotFound(_))));
    }
}
