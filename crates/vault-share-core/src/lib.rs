//! Pure, testable building blocks for encrypted vault sharing: the SVDF
//! container codec, chunked transport framing, the remote record model,
//! and the per-share re-encryption cache. No background tasks, no job
//! state machines — those live in `vault-share-engine`, which composes
//! this crate's traits and types into long-running work.

#[cfg(feature = "async")]
pub mod cache;
pub mod crypto;
pub mod model;
#[cfg(feature = "async")]
pub mod remote;
pub mod svdf;
#[cfg(feature = "async")]
pub mod transport;
#[cfg(feature = "async")]
pub mod vaultstorage;

pub use model::{
    FileManifestEntry, ImportJob, PendingImportState, PendingSyncState, PendingUploadState,
    PhraseVaultId, ShareIndex, ShareKey, ShareRecord, ShareVaultId, SharePolicy, SharedFile,
    StreamingSourceFile, SvdfMetadata, SyncShareProgress, SyncShareStatus, SyncState, SyncStatus,
    UploadJob, UploadStatus,
};
