//! SVDF — Shared Vault Data Format v5.
//!
//! The append-stable binary container described in the system spec §4.1.
//! Layout (little-endian throughout):
//!
//! ```text
//! Offset  Size  Field
//! 0       4     Magic ("SVD5" current, "SVD4" read-compat)
//! 4       2     Version (u16)
//! 6       4     Active file count (u32)
//! 10      8     Manifest offset (u64)
//! 18      4     Manifest size (u32)
//! 22      8     Metadata offset (u64)
//! 30      4     Metadata size (u32)
//! 34      30    Reserved (zero)
//! 64..mO        File entries, insertion order, immutable once written
//! mO..mO+mS     Encrypted manifest (JSON array of FileManifestEntry)
//! dO..dO+dS     Encrypted metadata (JSON object)
//! ```

mod entry;
mod header;
pub mod legacy;
mod reader;
mod trailer;
mod writer;

pub use entry::{
    decode_file_entry, encode_file_entry, encode_file_entry_prefix, ExtractedFileMetadata,
    MAX_MIME_LEN, MAX_NAME_LEN,
};
pub use header::{SvdfHeader, HEADER_SIZE, MAGIC_V4, MAGIC_V5};
pub use reader::{
    extract_and_decrypt_file_content, extract_file_content_to_sink, extract_file_entry_metadata,
    is_svdf, parse_header, parse_header_bytes, parse_manifest, parse_metadata,
};
pub use trailer::{decrypt_manifest, decrypt_metadata, encrypt_manifest, encrypt_metadata};
pub use writer::{
    build_full, build_full_streaming, build_full_streaming_from_plaintext,
    build_incremental_streaming, DEFAULT_BUDGET_BYTES,
};

use thiserror::Error;

/// Default size of the bounded prefix read when extracting file entry
/// metadata without loading content: enough for id + name + mime + all
/// fixed-size fields, with headroom for a small inline thumbnail.
pub const METADATA_PREFIX_SIZE: usize = 1024;
/// Chunk size used when streaming encrypted content to a sink.
pub const CONTENT_STREAM_CHUNK: usize = 256 * 1024;
/// Chunk size used when copying the prior file-entry region byte-for-byte
/// during an incremental append.
pub const PRIOR_REGION_COPY_CHUNK: usize = 4 * 1024 * 1024;

/// Context carried on I/O errors so failures name the offending entry,
/// mirroring `oxidized-cryptolib::fs::file::FileContext`.
#[derive(Debug, Clone, Default)]
pub struct SvdfContext {
    pub file_id: Option<uuid::Uuid>,
    pub offset: Option<u64>,
}

impl std::fmt::Display for SvdfContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut parts = Vec::new();
        if let Some(id) = self.file_id {
            parts.push(format!("entry {id}"));
        }
        if let Some(offset) = self.offset {
            parts.push(format!("at offset {offset}"));
        }
        if parts.is_empty() {
            write!(f, "(no context)")
        } else {
            write!(f, "{}", parts.join(", "))
        }
    }
}

#[derive(Error, Debug)]
pub enum SvdfError {
    #[error("header smaller than {HEADER_SIZE} bytes")]
    InvalidHeader,
    #[error("invalid SVDF magic bytes")]
    InvalidMagic,
    #[error("invalid manifest: {0}")]
    InvalidManifest(String),
    #[error("invalid entry {context}: {reason}")]
    InvalidEntry { reason: String, context: SvdfContext },
    #[error("field too large to encode: {0}")]
    FieldTooLarge(String),
    #[error("negative or non-finite field: {0}")]
    NegativeField(String),
    #[error("payload of {actual} bytes exceeds budget of {budget} bytes")]
    PayloadTooLarge { actual: u64, budget: u64 },
    #[error("crypto error: {0}")]
    Crypto(#[from] crate::crypto::CryptoError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("manifest/metadata JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
