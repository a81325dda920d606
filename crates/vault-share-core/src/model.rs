//! Shared data model for the vault-sharing subsystem.
//!
//! These types cross crate boundaries (core codec/transport <-> engine) and
//! are the on-disk shape of persisted job state, so every type here derives
//! `Serialize`/`Deserialize` with forward-compatible defaults.

use std::collections::{HashSet, HashMap};

use secrecy::{ExposeSecret, SecretBox};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use zeroize::Zeroize;

/// A 32-byte symmetric key derived from a human share phrase.
///
/// Captured by value into tasks that outlive a vault unlock, so it must be
/// cheaply cloneable; the inner bytes are zeroized on drop and never
/// rendered by `Debug`.
#[derive(Clone)]
pub struct ShareKey(SecretBox<[u8; 32]>);

impl ShareKey {
    #[must_use]
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(SecretBox::new(Box::new(bytes)))
    }

    #[must_use]
    pub fn expose(&self) -> &[u8; 32] {
        self.0.expose_secret()
    }

    /// Stable, low-entropy identifier for this key, safe to log.
    ///
    /// Computed as the hex of the first 4 bytes of SHA-256(key) — enough to
    /// disambiguate keys in logs without leaking key material.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(self.expose());
        let digest = hasher.finalize();
        hex::encode(&digest[..4])
    }
}

impl std::fmt::Debug for ShareKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ShareKey").field(&self.fingerprint()).finish()
    }
}

impl PartialEq for ShareKey {
    fn eq(&self, other: &Self) -> bool {
        use subtle::ConstantTimeEq;
        self.expose().ct_eq(other.expose()).into()
    }
}
impl Eq for ShareKey {}

impl Serialize for ShareKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let encoded = base64::Engine::encode(
            &base64::engine::general_purpose::STANDARD,
            self.expose(),
        );
        serializer.serialize_str(&encoded)
    }
}

impl<'de> Deserialize<'de> for ShareKey {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        let mut decoded = base64::Engine::decode(&base64::engine::general_purpose::STANDARD, &encoded)
            .map_err(serde::de::Error::custom)?;
        if decoded.len() != 32 {
            return Err(serde::de::Error::custom(format!(
                "expected 32-byte share key, got {}",
                decoded.len()
            )));
        }
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&decoded);
        decoded.zeroize();
        Ok(Self::new(bytes))
    }
}

/// 128-bit random identifier for a share on the remote store.
pub type ShareVaultId = Uuid;

/// 128-bit deterministic digest of a normalized share phrase; the remote
/// manifest record name.
pub type PhraseVaultId = String;

/// One entry of the SVDF manifest: identity, location, and tombstone state
/// of a single file entry within the container.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileManifestEntry {
    pub id: Uuid,
    pub offset: u64,
    pub size: u32,
    #[serde(default)]
    pub deleted: bool,
}

/// Opaque-to-the-codec sharing policy, carried as encrypted JSON on the
/// remote manifest record.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct SharePolicy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_opens: Option<u32>,
    #[serde(default)]
    pub allow_screenshots: bool,
    #[serde(default)]
    pub allow_downloads: bool,
}

/// A single file as presented by vault storage, ready to be packed into an
/// SVDF container and re-encrypted under a share key.
#[derive(Debug, Clone)]
pub struct SharedFile {
    pub id: Uuid,
    pub filename: String,
    pub mime_type: String,
    pub original_size: u32,
    pub created_at: f64,
    /// -1.0 when absent (no duration, e.g. non-video files).
    pub duration: f64,
    pub encrypted_thumbnail: Vec<u8>,
    pub encrypted_content: Vec<u8>,
}

/// Same as [`SharedFile`] but referencing plaintext content on disk instead
/// of holding it in memory, for the streaming-from-plaintext build path.
#[derive(Debug, Clone)]
pub struct StreamingSourceFile {
    pub id: Uuid,
    pub filename: String,
    pub mime_type: String,
    pub original_size: u32,
    pub created_at: f64,
    pub duration: f64,
    pub encrypted_thumbnail: Vec<u8>,
    pub plaintext_url: std::path::PathBuf,
}

/// SVDF trailer metadata (encrypted alongside the manifest).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SvdfMetadata {
    pub owner_fingerprint: String,
    pub shared_at: f64,
}

/// Durable state for one upload job; the source of truth for an `UploadJob`
/// projection. TTL = 24h.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingUploadState {
    pub job_id: Uuid,
    pub share_vault_id: ShareVaultId,
    pub phrase_vault_id: PhraseVaultId,
    pub share_key: ShareKey,
    pub policy: SharePolicy,
    pub owner_fingerprint: String,
    pub total_chunks: u64,
    pub shared_file_ids: Vec<Uuid>,
    pub manifest_snapshot: Vec<FileManifestEntry>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    #[serde(default)]
    pub upload_finished: bool,
    #[serde(default)]
    pub last_progress: u64,
    #[serde(default)]
    pub last_message: String,
    #[serde(default)]
    pub phrase: Option<String>,
}

impl PendingUploadState {
    pub const TTL: chrono::Duration = chrono::Duration::hours(24);

    #[must_use]
    pub fn is_expired(&self, now: chrono::DateTime<chrono::Utc>) -> bool {
        now - self.created_at > Self::TTL
    }
}

/// Durable state for one share's ongoing sync. TTL = 48h.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingSyncState {
    pub share_vault_id: ShareVaultId,
    pub share_key: ShareKey,
    pub new_chunk_hashes: Vec<String>,
    pub previous_chunk_hashes: Vec<String>,
    pub manifest_snapshot: Vec<FileManifestEntry>,
    pub synced_file_ids: Vec<Uuid>,
    pub sync_sequence: u64,
    pub vault_key_fingerprint: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
    #[serde(default)]
    pub upload_finished: bool,
}

impl PendingSyncState {
    pub const TTL: chrono::Duration = chrono::Duration::hours(48);

    #[must_use]
    pub fn is_expired(&self, now: chrono::DateTime<chrono::Utc>) -> bool {
        now - self.created_at > Self::TTL
    }
}

/// Durable state for one in-flight import. TTL = 24h.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingImportState {
    pub share_vault_id: ShareVaultId,
    pub phrase: String,
    pub share_key: ShareKey,
    pub policy: SharePolicy,
    pub total_files: u64,
    #[serde(default)]
    pub imported_file_ids: Vec<Uuid>,
    pub share_vault_version: u32,
    #[serde(default)]
    pub is_download_complete: bool,
    pub created_at: chrono::DateTime<chrono::Utc>,
    #[serde(default)]
    pub download_error: Option<String>,
}

impl PendingImportState {
    pub const TTL: chrono::Duration = chrono::Duration::hours(24);

    #[must_use]
    pub fn is_expired(&self, now: chrono::DateTime<chrono::Utc>) -> bool {
        now - self.created_at > Self::TTL
    }

    #[must_use]
    pub fn is_imported(&self, id: Uuid) -> bool {
        self.imported_file_ids.contains(&id)
    }
}

/// In-cache per-share sync bookkeeping (distinct from the on-disk
/// [`PendingSyncState`]; this is the steady-state record the sync cache
/// keeps between syncs, not the staged-resume record).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SyncState {
    pub synced_file_ids: HashSet<Uuid>,
    pub chunk_hashes: Vec<String>,
    pub manifest: Vec<FileManifestEntry>,
    pub sync_sequence: u64,
    pub deleted_file_ids: HashSet<Uuid>,
    pub total_deleted_bytes: u64,
    pub total_bytes: u64,
}

impl SyncState {
    /// Fraction of container bytes that are tombstoned. > 0.30 triggers a
    /// full rebuild at the next sync instead of an incremental append.
    #[must_use]
    pub fn deleted_fraction(&self) -> f64 {
        if self.total_bytes == 0 {
            0.0
        } else {
            self.total_deleted_bytes as f64 / self.total_bytes as f64
        }
    }

    #[must_use]
    pub fn needs_compaction(&self) -> bool {
        self.deleted_fraction() > 0.30
    }
}

/// Status of an upload job, as observed by a caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UploadStatus {
    Preparing,
    Uploading,
    Finalizing,
    Paused,
    Failed,
    Complete,
    Cancelled,
}

/// In-memory projection of an upload job, rebuilt from [`PendingUploadState`]
/// on every app start. Never the source of truth.
#[derive(Debug, Clone)]
pub struct UploadJob {
    pub id: Uuid,
    pub owner_fingerprint: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub share_vault_id: ShareVaultId,
    pub phrase: Option<String>,
    pub status: UploadStatus,
    pub progress: u64,
    pub total: u64,
    pub message: String,
    pub error_message: Option<String>,
}

impl UploadJob {
    #[must_use]
    pub fn from_pending(state: &PendingUploadState, status: UploadStatus) -> Self {
        Self {
            id: state.job_id,
            owner_fingerprint: state.owner_fingerprint.clone(),
            created_at: state.created_at,
            share_vault_id: state.share_vault_id,
            phrase: state.phrase.clone(),
            status,
            progress: state.last_progress,
            total: state.total_chunks,
            message: state.last_message.clone(),
            error_message: None,
        }
    }
}

/// Per-share sync progress, as exposed to a UI layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncShareStatus {
    Waiting,
    Building,
    Uploading,
    Done,
    Error,
}

/// Aggregate sync-engine status across all shares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncStatus {
    #[default]
    Idle,
    Syncing,
    UpToDate,
    Error,
}

/// Per-share progress snapshot exposed by the sync engine.
#[derive(Debug, Clone)]
pub struct SyncShareProgress {
    pub status: SyncShareStatus,
    pub fraction_completed: f64,
    pub message: String,
}

/// In-memory projection of an import job.
#[derive(Debug, Clone)]
pub struct ImportJob {
    pub share_vault_id: ShareVaultId,
    pub imported: u64,
    pub total: u64,
    pub download_error: Option<String>,
}

/// A share record appended to the owner's vault index on upload completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShareRecord {
    pub share_vault_id: ShareVaultId,
    pub phrase_vault_id: PhraseVaultId,
    pub share_key: ShareKey,
    pub policy: SharePolicy,
    pub created_at: chrono::DateTime<chrono::Utc>,
    #[serde(default)]
    pub last_synced_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    pub sync_sequence: u64,
}

/// The subset of the owner's vault index this subsystem reads/writes.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ShareIndex {
    pub active_shares: HashMap<ShareVaultId, ShareRecord>,
    #[serde(default)]
    pub shared_vault_version: u32,
}
