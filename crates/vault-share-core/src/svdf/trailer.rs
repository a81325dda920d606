//! Encrypted manifest/metadata trailer encode-decode.
//!
//! Both regions are plain JSON wrapped by the same symmetric-encryption
//! envelope used for file content (§6).

use crate::crypto::Crypto;
use crate::model::{FileManifestEntry, ShareKey, SvdfMetadata};

use super::SvdfError;

pub fn encrypt_manifest(
    manifest: &[FileManifestEntry],
    key: &ShareKey,
    crypto: &dyn Crypto,
) -> Result<Vec<u8>, SvdfError> {
    let json = serde_json::to_vec(manifest)?;
    Ok(crypto.encrypt(&json, key)?)
}

pub fn decrypt_manifest(
    encrypted: &[u8],
    key: &ShareKey,
    crypto: &dyn Crypto,
) -> Result<Vec<FileManifestEntry>, SvdfError> {
    let json = crypto.decrypt(encrypted, key)?;
    serde_json::from_slice(&json).map_err(|e| SvdfError::InvalidManifest(e.to_string()))
}

pub fn encrypt_metadata(
    metadata: &SvdfMetadata,
    key: &ShareKey,
    crypto: &dyn Crypto,
) -> Result<Vec<u8>, SvdfError> {
    let json = serde_json::to_vec(metadata)?;
    Ok(crypto.encrypt(&json, key)?)
}

pub fn decrypt_metadata(
    encrypted: &[u8],
    key: &ShareKey,
    crypto: &dyn Crypto,
) -> Result<SvdfMetadata, SvdfError> {
    let json = crypto.decrypt(encrypted, key)?;
    serde_json::from_slice(&json).map_err(|e| SvdfError::InvalidManifest(e.to_string()))
}
