//! Bounded, streaming-friendly SVDF reads.
//!
//! Every function here treats the container as untrusted input: offsets
//! and sizes taken from the header or manifest are checked against the
//! actual source length before any read is attempted, per the
//! codec-vs-parse-robustness design note in [`super::entry`].

use std::io::{Read, Seek, SeekFrom, Write};

use tracing::instrument;

use crate::crypto::{Crypto, StreamingCrypto};
use crate::model::{FileManifestEntry, ShareKey, SvdfMetadata};

use super::entry::{decode_file_entry, ExtractedFileMetadata};
use super::header::{SvdfHeader, HEADER_SIZE, MAGIC_V4, MAGIC_V5};
use super::trailer::{decrypt_manifest, decrypt_metadata};
use super::{SvdfError, CONTENT_STREAM_CHUNK, METADATA_PREFIX_SIZE};

/// Cheap, allocation-free check of whether `prefix` (at least the first
/// four bytes of a candidate container) carries a recognized SVDF magic.
#[must_use]
pub fn is_svdf(prefix: &[u8]) -> bool {
    prefix.len() >= 4 && (prefix[..4] == *MAGIC_V5 || prefix[..4] == *MAGIC_V4)
}

/// Parses the fixed-size header from an in-memory buffer that holds at
/// least the first [`HEADER_SIZE`] bytes of the container.
pub fn parse_header_bytes(buf: &[u8]) -> Result<SvdfHeader, SvdfError> {
    SvdfHeader::decode(buf)
}

/// Reads and parses the header from a seekable source, without requiring
/// the rest of the container in memory.
#[instrument(level = "debug", skip(source))]
pub fn parse_header<R: Read + Seek>(source: &mut R) -> Result<SvdfHeader, SvdfError> {
    source.seek(SeekFrom::Start(0))?;
    let mut buf = [0u8; HEADER_SIZE];
    source.read_exact(&mut buf)?;
    SvdfHeader::decode(&buf)
}

/// Reads and decrypts the manifest region named by `header`.
#[instrument(level = "debug", skip(source, key, crypto))]
pub fn parse_manifest<R: Read + Seek>(
    source: &mut R,
    header: &SvdfHeader,
    key: &ShareKey,
    crypto: &dyn Crypto,
) -> Result<Vec<FileManifestEntry>, SvdfError> {
    let mut buf = vec![0u8; header.manifest_size as usize];
    source.seek(SeekFrom::Start(header.manifest_offset))?;
    source.read_exact(&mut buf)?;
    decrypt_manifest(&buf, key, crypto)
}

/// Reads and decrypts the metadata region named by `header`.
#[instrument(level = "debug", skip(source, key, crypto))]
pub fn parse_metadata<R: Read + Seek>(
    source: &mut R,
    header: &SvdfHeader,
    key: &ShareKey,
    crypto: &dyn Crypto,
) -> Result<SvdfMetadata, SvdfError> {
    let mut buf = vec![0u8; header.metadata_size as usize];
    source.seek(SeekFrom::Start(header.metadata_offset))?;
    source.read_exact(&mut buf)?;
    decrypt_metadata(&buf, key, crypto)
}

/// Reads a single file entry's fixed-size fields and a bounded prefix of
/// its encrypted content/thumbnail (enough to fully decode the entry
/// header without loading the whole entry into memory), returning
/// metadata plus the entry's content range within the container.
///
/// `entry.size` from the manifest bounds how much of the container this
/// entry may legally span; if the fixed-size header fields alone don't
/// fit inside a [`METADATA_PREFIX_SIZE`] read, this falls back to reading
/// exactly `entry.size` bytes (still bounded by the manifest, never by an
/// attacker-controlled field inside the entry itself).
#[instrument(level = "debug", skip(source, entry))]
pub fn extract_file_entry_metadata<R: Read + Seek>(
    source: &mut R,
    entry: &FileManifestEntry,
    version: u16,
) -> Result<ExtractedFileMetadata, SvdfError> {
    let read_len = (entry.size as usize).min(METADATA_PREFIX_SIZE);
    source.seek(SeekFrom::Start(entry.offset))?;
    let mut buf = vec![0u8; read_len];
    source.read_exact(&mut buf)?;

    let (file, consumed) = match decode_file_entry(&buf, version) {
        Ok(result) => result,
        Err(_) if read_len < entry.size as usize => {
            // The fixed-size prefix didn't fit in the bounded read; fall
            // back to reading the full entry (still bounded by the
            // manifest-declared size, not by any in-entry field).
            source.seek(SeekFrom::Start(entry.offset))?;
            let mut full = vec![0u8; entry.size as usize];
            source.read_exact(&mut full)?;
            decode_file_entry(&full, version)?
        }
        Err(e) => return Err(e),
    };

    let content_size = file.encrypted_content.len() as u32;
    let content_offset = entry.offset + consumed as u64 - u64::from(content_size);

    Ok(ExtractedFileMetadata {
        id: file.id,
        filename: file.filename,
        mime_type: file.mime_type,
        original_size: file.original_size,
        created_at: file.created_at,
        duration: file.duration,
        encrypted_thumbnail: file.encrypted_thumbnail,
        content_offset,
        content_size,
    })
}

/// Streams a file entry's encrypted content directly from `source` to
/// `sink` in [`CONTENT_STREAM_CHUNK`]-sized pieces, without holding the
/// whole (potentially large) content buffer in memory.
#[instrument(level = "debug", skip(source, sink))]
pub fn extract_file_content_to_sink<R: Read + Seek, W: Write>(
    source: &mut R,
    content_offset: u64,
    content_size: u32,
    sink: &mut W,
) -> Result<(), SvdfError> {
    source.seek(SeekFrom::Start(content_offset))?;
    let mut remaining = content_size as u64;
    let mut buf = vec![0u8; CONTENT_STREAM_CHUNK];
    while remaining > 0 {
        let take = remaining.min(CONTENT_STREAM_CHUNK as u64) as usize;
        source.read_exact(&mut buf[..take])?;
        sink.write_all(&buf[..take])?;
        remaining -= take as u64;
    }
    Ok(())
}

/// Decrypts a file entry's content directly to `sink`, streaming through
/// [`StreamingCrypto::decrypt_stream`] so the plaintext never needs to be
/// buffered whole. `content_size` is the encrypted-on-disk size from the
/// manifest entry's metadata (the same value `Crypto::encrypted_content_size`
/// would have produced at upload time).
#[instrument(level = "debug", skip(source, sink, key, crypto))]
pub fn extract_and_decrypt_file_content<R: Read + Seek, W: Write>(
    source: &mut R,
    content_offset: u64,
    content_size: u32,
    key: &ShareKey,
    crypto: &dyn StreamingCrypto,
    sink: &mut W,
) -> Result<(), SvdfError> {
    source.seek(SeekFrom::Start(content_offset))?;
    let mut limited = source.take(u64::from(content_size));
    crypto.decrypt_stream(&mut limited, u64::from(content_size), sink, key)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use uuid::Uuid;

    use crate::crypto::AeadCrypto;
    use crate::model::{ShareKey, SharedFile, SvdfMetadata};

    use super::super::writer::{build_full_streaming, DEFAULT_BUDGET_BYTES};
    use super::*;

    fn key() -> ShareKey {
        ShareKey::new([3u8; 32])
    }

    fn sample_files() -> Vec<SharedFile> {
        vec![
            SharedFile {
                id: Uuid::new_v4(),
                filename: "a.txt".to_string(),
                mime_type: "text/plain".to_string(),
                original_size: 3,
                created_at: 1_700_000_000.0,
                duration: -1.0,
                encrypted_thumbnail: vec![],
                encrypted_content: vec![1, 2, 3],
            },
            SharedFile {
                id: Uuid::new_v4(),
                filename: "b.bin".to_string(),
                mime_type: "application/octet-stream".to_string(),
                original_size: 5,
                created_at: 1_700_000_001.0,
                duration: -1.0,
                encrypted_thumbnail: vec![9, 9],
                encrypted_content: vec![4, 5, 6, 7, 8],
            },
        ]
    }

    #[test]
    fn is_svdf_recognizes_both_magics() {
        assert!(is_svdf(b"SVD5rest"));
        assert!(is_svdf(b"SVD4rest"));
        assert!(!is_svdf(b"ZZZZrest"));
        assert!(!is_svdf(b"SV"));
    }

    #[test]
    fn round_trips_header_manifest_metadata_and_content() {
        let crypto = AeadCrypto;
        let key = key();
        let files = sample_files();
        let metadata = SvdfMetadata { owner_fingerprint: "owner".to_string(), shared_at: 42.0 };

        let mut buf = Cursor::new(Vec::new());
        let manifest =
            build_full_streaming(&mut buf, files.len(), |i| files[i].clone(), &metadata, &key, &crypto).unwrap();
        let mut container = buf;

        let header = parse_header(&mut container).unwrap();
        assert_eq!(header.active_file_count, 2);

        let parsed_manifest = parse_manifest(&mut container, &header, &key, &crypto).unwrap();
        assert_eq!(parsed_manifest, manifest);

        let parsed_metadata = parse_metadata(&mut container, &header, &key, &crypto).unwrap();
        assert_eq!(parsed_metadata, metadata);

        for (entry, file) in parsed_manifest.iter().zip(files.iter()) {
            let extracted = extract_file_entry_metadata(&mut container, entry, header.version).unwrap();
            assert_eq!(extracted.id, file.id);
            assert_eq!(extracted.filename, file.filename);
            assert_eq!(extracted.content_size as usize, file.encrypted_content.len());

            let mut out = Vec::new();
            extract_file_content_to_sink(
                &mut container,
                extracted.content_offset,
                extracted.content_size,
                &mut out,
            )
            .unwrap();
            assert_eq!(out, file.encrypted_content);
        }
    }

    #[test]
    fn budget_constant_is_positive() {
        assert!(DEFAULT_BUDGET_BYTES > 0);
    }

    #[test]
    fn parse_header_rejects_garbage() {
        let mut garbage = Cursor::new(vec![0u8; 10]);
        assert!(parse_header(&mut garbage).is_err());
    }
}
