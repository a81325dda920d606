//! Typed CRUD over the two CloudKit-style record types plus the retry
//! policy layered on top. The remote store itself is an opaque external
//! collaborator (§6); [`RemoteStore`] is the trait a production embedder
//! implements against a real record-store client, mirroring how
//! `oxcrypt-core` keeps its FUSE/WebDAV/NFS frontends behind narrow
//! storage traits rather than depending on a concrete backend.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{instrument, warn};
use uuid::Uuid;

use crate::model::SharePolicy;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedVault {
    pub share_vault_id: Uuid,
    pub phrase_vault_id: String,
    pub updated_at: DateTime<Utc>,
    pub version: i64,
    pub owner_fingerprint: String,
    pub chunk_count: u64,
    pub claimed: bool,
    pub revoked: bool,
    pub consumed: bool,
    pub encrypted_policy: Vec<u8>,
}

impl SharedVault {
    /// Version field starting point for v5-era writers (§6).
    pub const INITIAL_VERSION: i64 = 4;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedVaultChunk {
    pub share_vault_id: Uuid,
    pub chunk_index: u64,
    pub chunk_data: Vec<u8>,
}

#[derive(Error, Debug, Clone)]
pub enum RemoteError {
    #[error("remote account/zone not reachable")]
    NotAvailable,
    #[error("upload failed: {0}")]
    UploadFailed(String),
    #[error("download failed: {0}")]
    DownloadFailed(String),
    #[error("no share found for that phrase")]
    VaultNotFound,
    #[error("share has already been claimed")]
    AlreadyClaimed,
    #[error("share has been revoked")]
    Revoked,
    #[error("malformed remote record data")]
    InvalidData,
    #[error("network error: {0}")]
    NetworkError(String),
    #[error("record changed concurrently on the server")]
    RecordChanged,
    #[error("transient server error: {0}")]
    Transient(String),
}

impl RemoteError {
    /// Transient codes retried by [`with_retry`] (§4.3): network-ish and
    /// rate-limit/availability errors, not `RecordChanged` (handled by its
    /// own fetch-merge-retry path) and not terminal errors like
    /// `VaultNotFound`/`AlreadyClaimed`/`Revoked`.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RemoteError::NotAvailable | RemoteError::NetworkError(_) | RemoteError::Transient(_)
        )
    }
}

/// CRUD + status-flag operations over the two remote record types. A
/// concrete implementor owns whatever real network client backs it; this
/// crate ships only [`fake_store::InMemoryRemoteStore`] for tests.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn get_manifest_by_phrase(&self, phrase_vault_id: &str) -> Result<Option<SharedVault>, RemoteError>;
    async fn get_manifest(&self, share_vault_id: Uuid) -> Result<Option<SharedVault>, RemoteError>;
    async fn save_manifest(&self, manifest: SharedVault) -> Result<SharedVault, RemoteError>;

    async fn get_chunk(&self, share_vault_id: Uuid, index: u64) -> Result<Vec<u8>, RemoteError>;
    async fn save_chunk(&self, share_vault_id: Uuid, index: u64, data: Vec<u8>) -> Result<(), RemoteError>;
    async fn delete_chunk(&self, share_vault_id: Uuid, index: u64) -> Result<(), RemoteError>;
    async fn list_chunk_indices(&self, share_vault_id: Uuid) -> Result<Vec<u64>, RemoteError>;

    async fn set_claimed(&self, share_vault_id: Uuid) -> Result<(), RemoteError>;
    async fn set_revoked(&self, share_vault_id: Uuid) -> Result<(), RemoteError>;
    async fn set_consumed(&self, share_vault_id: Uuid) -> Result<(), RemoteError>;
    async fn consumed_status_by_share_vault_ids(
        &self,
        share_vault_ids: &[Uuid],
    ) -> Result<HashMap<Uuid, bool>, RemoteError>;
}

/// `checkPhraseAvailability` (§4.3): classifies a manifest lookup by
/// phrase into the four outcomes the import engine needs before deriving
/// a share key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhraseAvailability {
    Available,
    AlreadyClaimed,
    Revoked,
    NotFound,
}

#[instrument(level = "debug", skip(store))]
pub async fn check_phrase_availability(
    store: &(dyn RemoteStore + Sync),
    phrase_vault_id: &str,
) -> Result<PhraseAvailability, RemoteError> {
    match store.get_manifest_by_phrase(phrase_vault_id).await? {
        None => Ok(PhraseAvailability::NotFound),
        Some(manifest) if manifest.claimed => Ok(PhraseAvailability::AlreadyClaimed),
        Some(manifest) if manifest.revoked => Ok(PhraseAvailability::Revoked),
        Some(_) => Ok(PhraseAvailability::Available),
    }
}

const MAX_RETRIES: u32 = 3;

/// Retries `op` up to [`MAX_RETRIES`] times on a transient error, waiting
/// `2^attempt` seconds between attempts (server-supplied retry-after is
/// not modeled here since the trait above has no channel for it; a real
/// record-store client would surface it via a richer `RemoteError`
/// variant carrying the duration).
#[instrument(level = "debug", skip(op))]
pub async fn with_retry<T, F, Fut>(mut op: F) -> Result<T, RemoteError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, RemoteError>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < MAX_RETRIES => {
                warn!(attempt, error = %e, "retrying after transient remote error");
                tokio::time::sleep(Duration::from_secs(2u64.pow(attempt))).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Saves `manifest` with optimistic-concurrency retry: on `RecordChanged`,
/// fetches the current server record, copies the local-only fields back
/// onto it (preserving the server's version/updatedAt), and retries.
#[instrument(level = "debug", skip(store, manifest))]
pub async fn save_manifest_with_conflict_retry(
    store: &(dyn RemoteStore + Sync),
    mut manifest: SharedVault,
) -> Result<SharedVault, RemoteError> {
    let mut attempt = 0u32;
    loop {
        match store.save_manifest(manifest.clone()).await {
            Ok(saved) => return Ok(saved),
            Err(RemoteError::RecordChanged) if attempt < MAX_RETRIES => {
                if let Some(server) = store.get_manifest(manifest.share_vault_id).await? {
                    manifest.version = server.version;
                    manifest.updated_at = server.updated_at;
                }
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

pub mod fake_store {
    //! In-memory [`RemoteStore`] with injectable latency/error/conflict
    //! behavior, used to drive the S2/S6 scenarios deterministically.
    //! Deliberately not `#[cfg(test)]`: the engine crate's tests need it
    //! too, the same way the teacher's `tests/common` helpers are ordinary
    //! modules rather than test-only ones.

    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::Utc;
    use uuid::Uuid;

    use super::{RemoteError, RemoteStore, SharedVault};

    #[derive(Default)]
    struct State {
        manifests_by_id: HashMap<Uuid, SharedVault>,
        chunks: HashMap<(Uuid, u64), Vec<u8>>,
    }

    /// In-memory remote store. `force_conflict_once` makes the next
    /// `save_manifest` for a given id return `RecordChanged` exactly once,
    /// modeling the S6 concurrent-writer scenario.
    pub struct InMemoryRemoteStore {
        state: Mutex<State>,
        force_conflict_remaining: AtomicU32,
    }

    impl Default for InMemoryRemoteStore {
        fn default() -> Self {
            Self::new()
        }
    }

    impl InMemoryRemoteStore {
        #[must_use]
        pub fn new() -> Self {
            Self { state: Mutex::new(State::default()), force_conflict_remaining: AtomicU32::new(0) }
        }

        pub fn force_conflict_on_next_save(&self, times: u32) {
            self.force_conflict_remaining.store(times, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl RemoteStore for InMemoryRemoteStore {
        async fn get_manifest_by_phrase(&self, phrase_vault_id: &str) -> Result<Option<SharedVault>, RemoteError> {
            let state = self.state.lock().expect("lock poisoned");
            Ok(state.manifests_by_id.values().find(|m| m.phrase_vault_id == phrase_vault_id).cloned())
        }

        async fn get_manifest(&self, share_vault_id: Uuid) -> Result<Option<SharedVault>, RemoteError> {
            let state = self.state.lock().expect("lock poisoned");
            Ok(state.manifests_by_id.get(&share_vault_id).cloned())
        }

        async fn save_manifest(&self, mut manifest: SharedVault) -> Result<SharedVault, RemoteError> {
            if self
                .force_conflict_remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| if n > 0 { Some(n - 1) } else { None })
                .is_ok()
            {
                return Err(RemoteError::RecordChanged);
            }
            let mut state = self.state.lock().expect("lock poisoned");
            manifest.updated_at = Utc::now();
            manifest.version += 1;
            state.manifests_by_id.insert(manifest.share_vault_id, manifest.clone());
            Ok(manifest)
        }

        async fn get_chunk(&self, share_vault_id: Uuid, index: u64) -> Result<Vec<u8>, RemoteError> {
            let state = self.state.lock().expect("lock poisoned");
            state
                .chunks
                .get(&(share_vault_id, index))
                .cloned()
                .ok_or_else(|| RemoteError::DownloadFailed(format!("chunk {index} not found")))
        }

        async fn save_chunk(&self, share_vault_id: Uuid, index: u64, data: Vec<u8>) -> Result<(), RemoteError> {
            let mut state = self.state.lock().expect("lock poisoned");
            state.chunks.insert((share_vault_id, index), data);
            Ok(())
        }

        async fn delete_chunk(&self, share_vault_id: Uuid, index: u64) -> Result<(), RemoteError> {
            let mut state = self.state.lock().expect("lock poisoned");
            state.chunks.remove(&(share_vault_id, index));
            Ok(())
        }

        async fn list_chunk_indices(&self, share_vault_id: Uuid) -> Result<Vec<u64>, RemoteError> {
            let state = self.state.lock().expect("lock poisoned");
            Ok(state
                .chunks
                .keys()
                .filter(|(id, _)| *id == share_vault_id)
                .map(|(_, index)| *index)
                .collect())
        }

        async fn set_claimed(&self, share_vault_id: Uuid) -> Result<(), RemoteError> {
            let mut state = self.state.lock().expect("lock poisoned");
            if let Some(manifest) = state.manifests_by_id.get_mut(&share_vault_id) {
                manifest.claimed = true;
            }
            Ok(())
        }

        async fn set_revoked(&self, share_vault_id: Uuid) -> Result<(), RemoteError> {
            let mut state = self.state.lock().expect("lock poisoned");
            if let Some(manifest) = state.manifests_by_id.get_mut(&share_vault_id) {
                manifest.revoked = true;
            }
            Ok(())
        }

        async fn set_consumed(&self, share_vault_id: Uuid) -> Result<(), RemoteError> {
            let mut state = self.state.lock().expect("lock poisoned");
            if let Some(manifest) = state.manifests_by_id.get_mut(&share_vault_id) {
                manifest.consumed = true;
            }
            Ok(())
        }

        async fn consumed_status_by_share_vault_ids(
            &self,
            share_vault_ids: &[Uuid],
        ) -> Result<HashMap<Uuid, bool>, RemoteError> {
            let state = self.state.lock().expect("lock poisoned");
            Ok(share_vault_ids
                .iter()
                .map(|id| (*id, state.manifests_by_id.get(id).is_some_and(|m| m.consumed)))
                .collect())
        }
    }
}

/// Serializes a [`SharePolicy`] to the JSON asset format the manifest
/// record's `policy` field carries (encryption happens at the caller,
/// via [`crate::crypto::Crypto`], matching the §6 "asset containing
/// encrypted policy JSON" framing).
pub fn policy_to_json(policy: &SharePolicy) -> serde_json::Result<Vec<u8>> {
    serde_json::to_vec(policy)
}

pub fn policy_from_json(bytes: &[u8]) -> serde_json::Result<SharePolicy> {
    serde_json::from_slice(bytes)
}

#[cfg(test)]
mod tests {
    use super::fake_store::InMemoryRemoteStore;
    use super::*;

    fn sample_manifest(id: Uuid) -> SharedVault {
        SharedVault {
            share_vault_id: id,
            phrase_vault_id: "abc123".to_string(),
            updated_at: Utc::now(),
            version: SharedVault::INITIAL_VERSION,
            owner_fingerprint: "owner".to_string(),
            chunk_count: 1,
            claimed: false,
            revoked: false,
            consumed: false,
            encrypted_policy: vec![],
        }
    }

    #[tokio::test]
    async fn check_phrase_availability_reports_not_found() {
        let store = InMemoryRemoteStore::new();
        let result = check_phrase_availability(&store, "nope").await.unwrap();
        assert_eq!(result, PhraseAvailability::NotFound);
    }

    #[tokio::test]
    async fn check_phrase_availability_reports_claimed_and_revoked() {
        let store = InMemoryRemoteStore::new();
        let id = Uuid::new_v4();
        let mut manifest = sample_manifest(id);
        manifest.claimed = true;
        store.save_manifest(manifest).await.unwrap();
        assert_eq!(
            check_phrase_availability(&store, "abc123").await.unwrap(),
            PhraseAvailability::AlreadyClaimed
        );
    }

    #[tokio::test]
    async fn save_manifest_with_conflict_retry_recovers_from_one_conflict() {
        let store = InMemoryRemoteStore::new();
        let id = Uuid::new_v4();
        let manifest = sample_manifest(id);
        store.save_manifest(manifest.clone()).await.unwrap();

        store.force_conflict_on_next_save(1);
        let saved = save_manifest_with_conflict_retry(&store, manifest).await.unwrap();
        assert_eq!(saved.share_vault_id, id);
    }

    #[tokio::test]
    async fn with_retry_gives_up_on_non_transient_error() {
        let attempts = std::sync::atomic::AtomicU32::new(0);
        let result: Result<(), RemoteError> = with_retry(|| {
            attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            async { Err(RemoteError::VaultNotFound) }
        })
        .await;
        assert!(matches!(result, Err(RemoteError::VaultNotFound)));
        assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
