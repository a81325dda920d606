//! Sync engine (§4.6): mirrors ongoing changes in the owner's vault to
//! every active share, choosing an incremental append over a full rebuild
//! whenever the per-share cache makes that possible.
//!
//! Grounded on `oxidized-cryptolib::vault::locks::VaultLockManager` for the
//! per-share job table, and on the teacher's bench harness
//! (`workflows.rs`) for the bounded-concurrency fan-out over shares.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, Semaphore};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use vault_share_core::cache::{CacheError, ShareCache};
use vault_share_core::crypto::{CryptoError, StreamingCrypto};
use vault_share_core::model::{
    PendingSyncState, ShareKey, ShareVaultId, SharedFile, SvdfMetadata, SyncShareProgress,
    SyncShareStatus, SyncState, SyncStatus,
};
use vault_share_core::remote::{RemoteError, RemoteStore};
use vault_share_core::svdf::{build_full_streaming, build_incremental_streaming, parse_header, SvdfError};
use vault_share_core::transport::{self, TransportError};
use vault_share_core::vaultstorage::{VaultFileHeader, VaultStorage, VaultStorageError};

use crate::jobs::scan_pending_directory;
use crate::platform::BackgroundExecution;

/// Trigger debounce (§4.6, §5).
const SYNC_DEBOUNCE: Duration = Duration::from_secs(5);
/// Maximum shares synced concurrently within one pass.
const MAX_CONCURRENT_SHARES: usize = 3;
/// Tombstone fraction above which a full rebuild replaces an incremental
/// append (delegated to [`SyncState::needs_compaction`]).
const STALE_PAUSE: Duration = Duration::from_millis(100);

#[derive(Error, Debug)]
pub enum SyncError {
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
}

#[derive(Default)]
struct RunState {
    running: bool,
    deferred: bool,
    status: SyncStatus,
}

/// Composes the codec, transport, remote client, and sync cache into the
/// debounced diff-and-upload pipeline described in §4.6. One instance
/// tracks every active share for a single owner vault.
pub struct SyncEngine {
    crypto: Arc<dyn StreamingCrypto>,
    storage: Arc<dyn VaultStorage>,
    remote: Arc<dyn RemoteStore>,
    background: Arc<dyn BackgroundExecution>,
    base_dir: PathBuf,
    cache_root: PathBuf,
    run_state: AsyncMutex<RunState>,
    progress: DashMap<ShareVaultId, SyncShareProgress>,
    debounce_task: AsyncMutex<Option<tokio::task::JoinHandle<()>>>,
}

impl SyncEngine {
    #[must_use]
    pub fn new(
        crypto: Arc<dyn StreamingCrypto>,
        storage: Arc<dyn VaultStorage>,
        remote: Arc<dyn RemoteStore>,
        background: Arc<dyn BackgroundExecution>,
        base_dir: PathBuf,
        cache_root: PathBuf,
    ) -> Self {
        Self {
            crypto,
            storage,
            remote,
            background,
            base_dir,
            cache_root,
            run_state: AsyncMutex::new(RunState::default()),
            progress: DashMap::new(),
            debounce_task: AsyncMutex::new(None),
        }
    }

    fn share_dir(&self, share_vault_id: ShareVaultId) -> PathBuf {
        self.base_dir.join(share_vault_id.to_string())
    }

    /// Restarts the 5-second debounce timer (§4.6). Repeated calls before
    /// the timer fires collapse into a single eventual run.
    #[instrument(level = "debug", skip(self))]
    pub async fn schedule_sync(self: &Arc<Self>) {
        let mut slot = self.debounce_task.lock().await;
        if let Some(handle) = slot.take() {
            handle.abort();
        }
        let engine = Arc::clone(self);
        *slot = Some(tokio::spawn(async move {
            tokio::time::sleep(SYNC_DEBOUNCE).await;
            engine.trigger_now().await;
        }));
    }

    /// Bypasses the debounce timer and runs (or queues) a sync pass
    /// immediately.
    #[instrument(level = "debug", skip(self))]
    pub async fn sync_now(self: &Arc<Self>) {
        let mut slot = self.debounce_task.lock().await;
        if let Some(handle) = slot.take() {
            handle.abort();
        }
        drop(slot);
        self.trigger_now().await;
    }

    /// Single-run-plus-one-coalesced-deferred-slot scheduling (§4.6): if a
    /// pass is already running, a second request is folded into one
    /// deferred rerun rather than queued per-request.
    async fn trigger_now(self: &Arc<Self>) {
        {
            let mut state = self.run_state.lock().await;
            if state.running {
                state.deferred = true;
                return;
            }
            state.running = true;
            state.status = SyncStatus::Syncing;
        }

        loop {
            let token = self.background.begin();
            if let Err(e) = self.run_pass().await {
                warn!(error = %e, "sync pass failed");
                self.run_state.lock().await.status = SyncStatus::Error;
            }
            self.background.end(token);

            let mut state = self.run_state.lock().await;
            if state.deferred {
                state.deferred = false;
                continue;
            }
            state.running = false;
            if state.status == SyncStatus::Syncing {
                state.status = SyncStatus::UpToDate;
            }
            break;
        }
    }

    /// One full per-sync flow (§4.6 steps 1-6).
    #[instrument(level = "debug", skip(self))]
    async fn run_pass(self: &Arc<Self>) -> Result<(), SyncError> {
        let mut index = self.storage.load_index().await?;
        let share_ids: Vec<Uuid> = index.active_shares.keys().copied().collect();
        if share_ids.is_empty() {
            return Ok(());
        }

        let consumed = self.remote.consumed_status_by_share_vault_ids(&share_ids).await?;
        let mut to_remove = Vec::new();
        let mut syncable = Vec::new();
        for (id, record) in &index.active_shares {
            if consumed.get(id).copied().unwrap_or(false) {
                to_remove.push(*id);
                continue;
            }
            syncable.push((*id, record.share_key.clone()));
        }

        let headers = self.storage.list_active_files().await?;
        let semaphore = Arc::new(Semaphore::new(MAX_CONCURRENT_SHARES));
        let mut tasks = Vec::with_capacity(syncable.len());
        for (share_vault_id, share_key) in syncable {
            let semaphore = Arc::clone(&semaphore);
            let engine = Arc::clone(self);
            let headers = headers.clone();
            tasks.push(async move {
                let _permit = semaphore.acquire().await.expect("semaphore not closed");
                (share_vault_id, engine.sync_one_share(share_vault_id, &share_key, &headers).await)
            });
        }

        let results = futures::future::join_all(tasks).await;
        let now = Utc::now();
        for (share_vault_id, result) in results {
            match result {
                Ok(sync_sequence) => {
                    if let Some(record) = index.active_shares.get_mut(&share_vault_id) {
                        record.last_synced_at = Some(now);
                        record.sync_sequence = sync_sequence;
                    }
                    self.progress.insert(
                        share_vault_id,
                        SyncShareProgress { status: SyncShareStatus::Done, fraction_completed: 1.0, message: "synced".to_string() },
                    );
                }
                Err(e) => {
                    warn!(%share_vault_id, error = %e, "share sync failed");
                    self.progress.insert(
                        share_vault_id,
                        SyncShareProgress { status: SyncShareStatus::Error, fraction_completed: 0.0, message: e.to_string() },
                    );
                }
            }
        }

        for id in &to_remove {
            if let Some(record) = index.active_shares.remove(id) {
                let fingerprint = self.crypto.key_fingerprint(&record.share_key);
                let cache = ShareCache::new(&self.cache_root, *id, &fingerprint);
                let _ = cache.purge().await;
            }
            self.progress.remove(id);
        }
        self.storage.save_index(index).await?;
        info!(synced = %share_ids.len(), removed = to_remove.len(), "sync pass complete");
        Ok(())
    }

    /// Builds (full or incremental), stages, and uploads one share's SVDF,
    /// returning its new `syncSequence` on success.
    #[instrument(level = "debug", skip(self, share_key, headers))]
    async fn sync_one_share(
        self: &Arc<Self>,
        share_vault_id: ShareVaultId,
        share_key: &ShareKey,
        headers: &[VaultFileHeader],
    ) -> Result<u64, SyncError> {
        self.progress.insert(
            share_vault_id,
            SyncShareProgress { status: SyncShareStatus::Building, fraction_completed: 0.0, message: "building".to_string() },
        );

        let fingerprint = self.crypto.key_fingerprint(share_key);
        let cache = ShareCache::new(&self.cache_root, share_vault_id, &fingerprint);
        let prior_state = cache.load_sync_state().await?;

        let staging_dir = self.share_dir(share_vault_id);
        tokio::fs::create_dir_all(&staging_dir).await?;
        let staged_path = staging_dir.join("svdf_data.bin");

        let active_ids: HashSet<Uuid> = headers.iter().filter(|h| !h.deleted).map(|h| h.id).collect();
        let metadata = SvdfMetadata { owner_fingerprint: fingerprint.clone(), shared_at: Utc::now().timestamp() as f64 };

        let can_append = cache.has_svdf().await;
        let (manifest, new_sync_sequence) = match &prior_state {
            Some(state) if can_append && !state.needs_compaction() => {
                let synced_ids = state.synced_file_ids.clone();
                let new_ids: Vec<Uuid> = active_ids.difference(&synced_ids).copied().collect();
                let removed_ids: Vec<Uuid> = synced_ids.difference(&active_ids).copied().collect();

                let mut new_files = Vec::with_capacity(new_ids.len());
                for id in &new_ids {
                    if let Some(header) = headers.iter().find(|h| h.id == *id) {
                        new_files.push(self.materialize_shared_file(&cache, header, share_key).await?);
                    }
                }

                let prior_bytes = cache.load_svdf().await?;
                let mut prior_reader = std::io::Cursor::new(prior_bytes);
                let prior_header = parse_header(&mut prior_reader)?;
                let mut sink = std::fs::File::create(&staged_path)?;
                let manifest = build_incremental_streaming(
                    &mut sink,
                    &mut prior_reader,
                    prior_header.manifest_offset,
                    &state.manifest,
                    new_files.len(),
                    |i| new_files[i].clone(),
                    &removed_ids,
                    &metadata,
                    share_key,
                    self.crypto.as_ref(),
                )?;
                (manifest, state.sync_sequence + 1)
            }
            _ => {
                let mut files = Vec::with_capacity(headers.len());
                for header in headers.iter().filter(|h| !h.deleted) {
                    files.push(self.materialize_shared_file(&cache, header, share_key).await?);
                }
                let mut sink = std::fs::File::create(&staged_path)?;
                let manifest = build_full_streaming(
                    &mut sink,
                    files.len(),
                    |i| files[i].clone(),
                    &metadata,
                    share_key,
                    self.crypto.as_ref(),
                )?;
                (manifest, prior_state.as_ref().map_or(0, |s| s.sync_sequence) + 1)
            }
        };

        let new_hashes = transport::compute_chunk_hashes_file(&staged_path).await?;
        let previous_hashes = prior_state.as_ref().map(|s| s.chunk_hashes.clone()).unwrap_or_default();

        let pending = PendingSyncState {
            share_vault_id,
            share_key: share_key.clone(),
            new_chunk_hashes: new_hashes.clone(),
            previous_chunk_hashes: previous_hashes.clone(),
            manifest_snapshot: manifest.clone(),
            synced_file_ids: active_ids.iter().copied().collect(),
            sync_sequence: new_sync_sequence,
            vault_key_fingerprint: fingerprint.clone(),
            created_at: Utc::now(),
            upload_finished: false,
        };
        let pending_json = serde_json::to_vec_pretty(&pending)?;
        tokio::fs::write(staging_dir.join("state.json"), pending_json).await?;

        self.progress.insert(
            share_vault_id,
            SyncShareProgress { status: SyncShareStatus::Uploading, fraction_completed: 0.5, message: "uploading".to_string() },
        );

        let staged_path_for_read = staged_path.clone();
        transport::incremental_sync(
            self.remote.as_ref(),
            share_vault_id,
            &new_hashes,
            &previous_hashes,
            move |index| {
                let path = staged_path_for_read.clone();
                Box::pin(async move {
                    use tokio::io::{AsyncReadExt, AsyncSeekExt};
                    let mut file = tokio::fs::File::open(&path).await?;
                    file.seek(std::io::SeekFrom::Start(index * transport::CHUNK_SIZE)).await?;
                    let mut buf = vec![0u8; transport::CHUNK_SIZE as usize];
                    let mut total = 0;
                    while total < buf.len() {
                        let n = file.read(&mut buf[total..]).await?;
                        if n == 0 {
                            break;
                        }
                        total += n;
                    }
                    buf.truncate(total);
                    Ok(buf)
                })
            },
            |_completed| {},
        )
        .await?;

        let new_state = SyncState {
            synced_file_ids: active_ids,
            chunk_hashes: new_hashes,
            manifest,
            sync_sequence: new_sync_sequence,
            deleted_file_ids: HashSet::new(),
            total_deleted_bytes: 0,
            total_bytes: tokio::fs::metadata(&staged_path).await?.len(),
        };
        cache.save_svdf_from_file(&staged_path).await?;
        cache.save_sync_state(&new_state).await?;

        let _ = tokio::fs::remove_dir_all(&staging_dir).await;
        Ok(new_sync_sequence)
    }

    /// Resolves one file's share-encrypted content: reuse the sync cache
    /// if already populated for this share, otherwise retrieve plaintext
    /// from vault storage, encrypt it, and cache the result.
    async fn materialize_shared_file(
        &self,
        cache: &ShareCache,
        header: &VaultFileHeader,
        share_key: &ShareKey,
    ) -> Result<SharedFile, SyncError> {
        let encrypted_content = if cache.has_file(header.id).await {
            cache.load_file(header.id).await?
        } else {
            let (_, plaintext) = self.storage.retrieve_file_content(header.id).await?;
            let content = self.crypto.encrypt(&plaintext, share_key)?;
            cache.store_file(header.id, &content).await?;
            content
        };

        let cached_thumb = cache.has_thumb(header.id).await;
        let encrypted_thumbnail = match (&header.encrypted_thumbnail, cached_thumb) {
            (Some(_), true) => cache.load_thumb(header.id).await?,
            (Some(thumb), false) => {
                let encrypted = self.crypto.encrypt(thumb, share_key)?;
                cache.store_thumb(header.id, &encrypted).await?;
                encrypted
            }
            (None, _) => Vec::new(),
        };

        Ok(SharedFile {
            id: header.id,
            filename: header.filename.clone(),
            mime_type: header.mime_type.clone(),
            original_size: header.original_size,
            created_at: header.created_at.timestamp() as f64,
            duration: header.duration.unwrap_or(-1.0),
            encrypted_thumbnail,
            encrypted_content,
        })
    }

    /// Resumes every `pending_sync/*` directory left from a prior process,
    /// re-uploading the already-staged (already share-key-encrypted) SVDF
    /// directly with no vault key required. Bounded to ≤ 3 concurrent
    /// resumes, each under its own background-execution token.
    #[instrument(level = "debug", skip(self))]
    pub async fn resume_pending_syncs(self: &Arc<Self>) -> Result<(), SyncError> {
        let now = Utc::now();
        let (live, stale) = scan_pending_directory(
            &self.base_dir,
            |name| Uuid::parse_str(name).ok(),
            |path| async move {
                let bytes = tokio::fs::read(path.join("state.json")).await.ok()?;
                serde_json::from_slice::<PendingSyncState>(&bytes).ok()
            },
            |state: &PendingSyncState| state.is_expired(now),
        )
        .await?;

        for path in stale {
            let _ = tokio::fs::remove_dir_all(path).await;
        }

        let semaphore = Arc::new(Semaphore::new(MAX_CONCURRENT_SHARES));
        let mut tasks = Vec::with_capacity(live.len());
        for (share_vault_id, state) in live {
            let semaphore = Arc::clone(&semaphore);
            let engine = Arc::clone(self);
            tasks.push(async move {
                let _permit = semaphore.acquire().await.expect("semaphore not closed");
                let token = engine.background.begin();
                let result = engine.resume_one(share_vault_id, state).await;
                engine.background.end(token);
                result
            });
        }
        for result in futures::future::join_all(tasks).await {
            result?;
        }
        Ok(())
    }

    async fn resume_one(&self, share_vault_id: ShareVaultId, state: PendingSyncState) -> Result<(), SyncError> {
        let staged_path = self.share_dir(share_vault_id).join("svdf_data.bin");
        let staged_path_for_read = staged_path.clone();
        transport::incremental_sync(
            self.remote.as_ref(),
            share_vault_id,
            &state.new_chunk_hashes,
            &state.previous_chunk_hashes,
            move |index| {
                let path = staged_path_for_read.clone();
                Box::pin(async move {
                    use tokio::io::{AsyncReadExt, AsyncSeekExt};
                    let mut file = tokio::fs::File::open(&path).await?;
                    file.seek(std::io::SeekFrom::Start(index * transport::CHUNK_SIZE)).await?;
                    let mut buf = vec![0u8; transport::CHUNK_SIZE as usize];
                    let mut total = 0;
                    while total < buf.len() {
                        let n = file.read(&mut buf[total..]).await?;
                        if n == 0 {
                            break;
                        }
                        total += n;
                    }
                    buf.truncate(total);
                    Ok(buf)
                })
            },
            |_completed| {},
        )
        .await?;

        let cache = ShareCache::new(&self.cache_root, share_vault_id, &state.vault_key_fingerprint);
        cache.save_svdf_from_file(&staged_path).await?;
        let new_state = SyncState {
            synced_file_ids: state.synced_file_ids.into_iter().collect(),
            chunk_hashes: state.new_chunk_hashes,
            manifest: state.manifest_snapshot,
            sync_sequence: state.sync_sequence,
            deleted_file_ids: HashSet::new(),
            total_deleted_bytes: 0,
            total_bytes: tokio::fs::metadata(&staged_path).await?.len(),
        };
        cache.save_sync_state(&new_state).await?;
        let _ = tokio::fs::remove_dir_all(self.share_dir(share_vault_id)).await;
        tokio::time::sleep(STALE_PAUSE).await;
        Ok(())
    }

    #[must_use]
    pub fn share_progress(&self, share_vault_id: ShareVaultId) -> Option<SyncShareProgress> {
        self.progress.get(&share_vault_id).map(|p| p.clone())
    }

    #[instrument(level = "debug", skip(self))]
    pub async fn aggregate_status(&self) -> SyncStatus {
        self.run_state.lock().await.status
    }
}
