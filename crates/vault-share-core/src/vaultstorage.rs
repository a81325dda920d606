//! The vault-storage external collaborator contract (§6): the interface
//! this subsystem needs from "the underlying vault storage", explicitly
//! out of scope as a concrete implementation. Ships a filesystem-backed
//! fake standing in for "already-decrypted vault content" so the engine
//! crate's tests don't need a real encrypted-vault implementation.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::model::{ShareIndex, ShareRecord, ShareVaultId};

#[derive(Error, Debug)]
pub enum VaultStorageError {
    #[error("vault data is corrupted: {0}")]
    CorruptedData(String),
    #[error("read error: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("no file with id {0} in the vault index")]
    FileNotFound(Uuid),
}

/// One vault-resident file as the vault storage layer exposes it: enough
/// metadata to build an SVDF entry, plus a way to retrieve its plaintext
/// content for re-encryption under a share key.
#[derive(Debug, Clone)]
pub struct VaultFileHeader {
    pub id: Uuid,
    pub filename: String,
    pub mime_type: String,
    pub original_size: u32,
    pub created_at: DateTime<Utc>,
    pub duration: Option<f64>,
    pub encrypted_thumbnail: Option<Vec<u8>>,
    pub deleted: bool,
}

/// The subset of vault storage this subsystem depends on (§6). A
/// production embedder implements this against its real encrypted vault;
/// this crate ships [`FilesystemVaultStorage`] for tests.
#[async_trait]
pub trait VaultStorage: Send + Sync {
    async fn load_index(&self) -> Result<ShareIndex, VaultStorageError>;
    async fn save_index(&self, index: ShareIndex) -> Result<(), VaultStorageError>;

    /// Decrypts file `id` to a plaintext temp file, returning its header
    /// and the temp path (consumed and deleted by the caller once its
    /// content has been streamed elsewhere — §4.5 step 4).
    async fn retrieve_file_to_temp_url(
        &self,
        id: Uuid,
    ) -> Result<(VaultFileHeader, PathBuf), VaultStorageError>;

    /// Decrypts file `id` fully into memory.
    async fn retrieve_file_content(&self, id: Uuid) -> Result<(VaultFileHeader, Vec<u8>), VaultStorageError>;

    /// Stores recovered content from an import under a new local file,
    /// preserving the imported file's original identity/metadata.
    #[allow(clippy::too_many_arguments)]
    async fn store_file(
        &self,
        id: Uuid,
        filename: &str,
        mime_type: &str,
        created_at: DateTime<Utc>,
        duration: Option<f64>,
        thumbnail: Option<Vec<u8>>,
        content: Vec<u8>,
    ) -> Result<(), VaultStorageError>;

    async fn store_file_from_url(
        &self,
        id: Uuid,
        filename: &str,
        mime_type: &str,
        created_at: DateTime<Utc>,
        duration: Option<f64>,
        thumbnail: Option<Vec<u8>>,
        content_path: &Path,
    ) -> Result<(), VaultStorageError>;

    /// Lists every non-tombstoned file header currently in the vault.
    async fn list_active_files(&self) -> Result<Vec<VaultFileHeader>, VaultStorageError>;

    /// Marks the vault as bound by an incoming share's policy ahead of
    /// storing any of its files (§4.7 step 6, the pre-claim step).
    async fn mark_as_shared_vault(
        &self,
        share_vault_id: ShareVaultId,
        share_key_fingerprint: &str,
    ) -> Result<(), VaultStorageError>;
}

/// Filesystem-backed `VaultStorage` fake: plaintext files on disk under
/// `root/files/{id}`, index persisted as JSON at `root/index.json`.
/// Nothing here is encrypted — it stands in for "already-decrypted vault
/// content", matching the spec's framing that real vault storage is out
/// of scope.
pub struct FilesystemVaultStorage {
    root: PathBuf,
}

impl FilesystemVaultStorage {
    #[must_use]
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn files_dir(&self) -> PathBuf {
        self.root.join("files")
    }
    fn index_path(&self) -> PathBuf {
        self.root.join("index.json")
    }
    fn headers_path(&self) -> PathBuf {
        self.root.join("headers.json")
    }

    async fn load_headers(&self) -> Result<HashMap<Uuid, VaultFileHeader>, VaultStorageError> {
        #[derive(serde::Serialize, serde::Deserialize)]
        struct Raw {
            id: Uuid,
            filename: String,
            mime_type: String,
            original_size: u32,
            created_at: DateTime<Utc>,
            duration: Option<f64>,
            encrypted_thumbnail: Option<Vec<u8>>,
            deleted: bool,
        }
        match tokio::fs::read(self.headers_path()).await {
            Ok(bytes) => {
                let raw: Vec<Raw> = serde_json::from_slice(&bytes)
                    .map_err(|e| VaultStorageError::CorruptedData(e.to_string()))?;
                Ok(raw
                    .into_iter()
                    .map(|r| {
                        (
                            r.id,
                            VaultFileHeader {
                                id: r.id,
                                filename: r.filename,
                                mime_type: r.mime_type,
                                original_size: r.original_size,
                                created_at: r.created_at,
                                duration: r.duration,
                                encrypted_thumbnail: r.encrypted_thumbnail,
                                deleted: r.deleted,
                            },
                        )
                    })
                    .collect())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn save_headers(&self, headers: &HashMap<Uuid, VaultFileHeader>) -> Result<(), VaultStorageError> {
        #[derive(serde::Serialize)]
        struct Raw<'a> {
            id: Uuid,
            filename: &'a str,
            mime_type: &'a str,
            original_size: u32,
            created_at: DateTime<Utc>,
            duration: Option<f64>,
            encrypted_thumbnail: &'a Option<Vec<u8>>,
            deleted: bool,
        }
        let raw: Vec<Raw> = headers
            .values()
            .map(|h| Raw {
                id: h.id,
                filename: &h.filename,
                mime_type: &h.mime_type,
                original_size: h.original_size,
                created_at: h.created_at,
                duration: h.duration,
                encrypted_thumbnail: &h.encrypted_thumbnail,
                deleted: h.deleted,
            })
            .collect();
        tokio::fs::create_dir_all(&self.root).await?;
        let json = serde_json::to_vec(&raw).map_err(|e| VaultStorageError::CorruptedData(e.to_string()))?;
        tokio::fs::write(self.headers_path(), json).await?;
        Ok(())
    }
}

#[async_trait]
impl VaultStorage for FilesystemVaultStorage {
    async fn load_index(&self) -> Result<ShareIndex, VaultStorageError> {
        match tokio::fs::read(self.index_path()).await {
            Ok(bytes) => {
                serde_json::from_slice(&bytes).map_err(|e| VaultStorageError::CorruptedData(e.to_string()))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ShareIndex::default()),
            Err(e) => Err(e.into()),
        }
    }

    async fn save_index(&self, index: ShareIndex) -> Result<(), VaultStorageError> {
        tokio::fs::create_dir_all(&self.root).await?;
        let json = serde_json::to_vec(&index).map_err(|e| VaultStorageError::CorruptedData(e.to_string()))?;
        tokio::fs::write(self.index_path(), json).await?;
        Ok(())
    }

    async fn retrieve_file_to_temp_url(&self, id: Uuid) -> Result<(VaultFileHeader, PathBuf), VaultStorageError> {
        let headers = self.load_headers().await?;
        let header = headers.get(&id).cloned().ok_or(VaultStorageError::FileNotFound(id))?;
        let source = self.files_dir().join(id.to_string());
        let temp = std::env::temp_dir().join(format!("vault-share-plaintext-{id}"));
        tokio::fs::copy(&source, &temp).await?;
        Ok((header, temp))
    }

    async fn retrieve_file_content(&self, id: Uuid) -> Result<(VaultFileHeader, Vec<u8>), VaultStorageError> {
        let headers = self.load_headers().await?;
        let header = headers.get(&id).cloned().ok_or(VaultStorageError::FileNotFound(id))?;
        let content = tokio::fs::read(self.files_dir().join(id.to_string())).await?;
        Ok((header, content))
    }

    async fn store_file(
        &self,
        id: Uuid,
        filename: &str,
        mime_type: &str,
        created_at: DateTime<Utc>,
        duration: Option<f64>,
        thumbnail: Option<Vec<u8>>,
        content: Vec<u8>,
    ) -> Result<(), VaultStorageError> {
        tokio::fs::create_dir_all(self.files_dir()).await?;
        let original_size = u32::try_from(content.len()).unwrap_or(u32::MAX);
        tokio::fs::write(self.files_dir().join(id.to_string()), content).await?;
        let mut headers = self.load_headers().await?;
        headers.insert(
            id,
            VaultFileHeader {
                id,
                filename: filename.to_string(),
                mime_type: mime_type.to_string(),
                original_size,
                created_at,
                duration,
                encrypted_thumbnail: thumbnail,
                deleted: false,
            },
        );
        self.save_headers(&headers).await
    }

    async fn store_file_from_url(
        &self,
        id: Uuid,
        filename: &str,
        mime_type: &str,
        created_at: DateTime<Utc>,
        duration: Option<f64>,
        thumbnail: Option<Vec<u8>>,
        content_path: &Path,
    ) -> Result<(), VaultStorageError> {
        let content = tokio::fs::read(content_path).await?;
        self.store_file(id, filename, mime_type, created_at, duration, thumbnail, content).await
    }

    async fn list_active_files(&self) -> Result<Vec<VaultFileHeader>, VaultStorageError> {
        let headers = self.load_headers().await?;
        Ok(headers.into_values().filter(|h| !h.deleted).collect())
    }

    async fn mark_as_shared_vault(
        &self,
        share_vault_id: ShareVaultId,
        share_key_fingerprint: &str,
    ) -> Result<(), VaultStorageError> {
        let marker = self.root.join("shared_vault_marker.json");
        let payload = serde_json::json!({
            "shareVaultId": share_vault_id,
            "shareKeyFingerprint": share_key_fingerprint,
        });
        tokio::fs::create_dir_all(&self.root).await?;
        tokio::fs::write(marker, serde_json::to_vec(&payload).unwrap()).await?;
        Ok(())
    }
}
