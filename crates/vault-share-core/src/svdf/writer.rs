use std::io::{Read, Seek, SeekFrom, Write};

use tracing::{debug, instrument};
use uuid::Uuid;

use crate::crypto::{Crypto, StreamingCrypto};
use crate::model::{FileManifestEntry, ShareKey, SharedFile, StreamingSourceFile, SvdfMetadata};

use super::entry::{encode_file_entry, encode_file_entry_prefix};
use super::header::{SvdfHeader, HEADER_SIZE};
use super::trailer::{encrypt_manifest, encrypt_metadata};
use super::{SvdfError, PRIOR_REGION_COPY_CHUNK};

/// Default total-encoded-size budget for the in-memory builders.
pub const DEFAULT_BUDGET_BYTES: u64 = 100 * 1024 * 1024;

fn check_budget(total: u64, budget: u64) -> Result<(), SvdfError> {
    if total > budget {
        Err(SvdfError::PayloadTooLarge { actual: total, budget })
    } else {
        Ok(())
    }
}

/// In-memory build. Writes entries in the order given, then the encrypted
/// manifest, then the encrypted metadata, then the header.
#[instrument(level = "debug", skip(files, metadata, key, crypto))]
pub fn build_full(
    files: &[SharedFile],
    metadata: &SvdfMetadata,
    key: &ShareKey,
    crypto: &dyn Crypto,
) -> Result<(Vec<u8>, Vec<FileManifestEntry>), SvdfError> {
    build_full_with_budget(files, metadata, key, crypto, DEFAULT_BUDGET_BYTES)
}

pub fn build_full_with_budget(
    files: &[SharedFile],
    metadata: &SvdfMetadata,
    key: &ShareKey,
    crypto: &dyn Crypto,
    budget: u64,
) -> Result<(Vec<u8>, Vec<FileManifestEntry>), SvdfError> {
    let mut entries_bytes = Vec::new();
    let mut manifest = Vec::with_capacity(files.len());
    for file in files {
        let offset = HEADER_SIZE as u64 + entries_bytes.len() as u64;
        let block = encode_file_entry(file)?;
        manifest.push(FileManifestEntry {
            id: file.id,
            offset,
            size: u32::try_from(block.len())
                .map_err(|_| SvdfError::FieldTooLarge("entry block".to_string()))?,
            deleted: false,
        });
        entries_bytes.extend_from_slice(&block);
    }

    let encrypted_manifest = encrypt_manifest(&manifest, key, crypto)?;
    let encrypted_metadata = encrypt_metadata(metadata, key, crypto)?;

    let manifest_offset = HEADER_SIZE as u64 + entries_bytes.len() as u64;
    let metadata_offset = manifest_offset + encrypted_manifest.len() as u64;
    let total = metadata_offset + encrypted_metadata.len() as u64;
    check_budget(total, budget)?;

    let header = SvdfHeader {
        version: SvdfHeader::WRITER_VERSION,
        active_file_count: u32::try_from(files.len())
            .map_err(|_| SvdfError::FieldTooLarge("active file count".to_string()))?,
        manifest_offset,
        manifest_size: u32::try_from(encrypted_manifest.len())
            .map_err(|_| SvdfError::FieldTooLarge("manifest size".to_string()))?,
        metadata_offset,
        metadata_size: u32::try_from(encrypted_metadata.len())
            .map_err(|_| SvdfError::FieldTooLarge("metadata size".to_string()))?,
    };

    let mut out = Vec::with_capacity(total as usize);
    out.extend_from_slice(&header.encode());
    out.extend_from_slice(&entries_bytes);
    out.extend_from_slice(&encrypted_manifest);
    out.extend_from_slice(&encrypted_metadata);

    debug!(files = files.len(), total_bytes = total, "built SVDF container in memory");
    Ok((out, manifest))
}

/// Streaming variant of [`build_full`]. Writes a zero header placeholder,
/// emits each entry via `for_each`, appends the encrypted trailer, then
/// seeks back to rewrite the real header. Peak memory: one file's fixed
/// fields plus its single largest encrypted content buffer (the caller
/// supplies already-encrypted content per file through `for_each`).
#[instrument(level = "debug", skip(sink, for_each, metadata, key, crypto))]
pub fn build_full_streaming<W, F>(
    sink: &mut W,
    file_count: usize,
    mut for_each: F,
    metadata: &SvdfMetadata,
    key: &ShareKey,
    crypto: &dyn Crypto,
) -> Result<Vec<FileManifestEntry>, SvdfError>
where
    W: Write + Seek,
    F: FnMut(usize) -> SharedFile,
{
    sink.write_all(&[0u8; HEADER_SIZE])?;
    let mut offset = HEADER_SIZE as u64;
    let mut manifest = Vec::with_capacity(file_count);
    for i in 0..file_count {
        let file = for_each(i);
        let block = encode_file_entry(&file)?;
        sink.write_all(&block)?;
        manifest.push(FileManifestEntry {
            id: file.id,
            offset,
            size: u32::try_from(block.len())
                .map_err(|_| SvdfError::FieldTooLarge("entry block".to_string()))?,
            deleted: false,
        });
        offset += block.len() as u64;
    }

    finish_container(sink, offset, file_count, &manifest, metadata, key, crypto)?;
    Ok(manifest)
}

/// Streaming variant that reads plaintext from disk per file and encrypts
/// it straight into the sink via [`StreamingCrypto::encrypt_stream`],
/// bounding peak memory to a small constant number of crypto chunks.
#[instrument(level = "debug", skip(sink, for_each, metadata, key, crypto))]
pub fn build_full_streaming_from_plaintext<W, F>(
    sink: &mut W,
    file_count: usize,
    mut for_each: F,
    metadata: &SvdfMetadata,
    key: &ShareKey,
    crypto: &dyn StreamingCrypto,
) -> Result<Vec<FileManifestEntry>, SvdfError>
where
    W: Write + Seek,
    F: FnMut(usize) -> StreamingSourceFile,
{
    sink.write_all(&[0u8; HEADER_SIZE])?;
    let mut offset = HEADER_SIZE as u64;
    let mut manifest = Vec::with_capacity(file_count);
    for i in 0..file_count {
        let source = for_each(i);
        let plaintext_len = std::fs::metadata(&source.plaintext_url)?.len();
        let content_size = crypto.encrypted_content_size(plaintext_len);
        let content_size_u32 = u32::try_from(content_size)
            .map_err(|_| SvdfError::FieldTooLarge("encryptedContentSize".to_string()))?;

        let (prefix, block_size) = encode_file_entry_prefix(
            source.id,
            &source.filename,
            &source.mime_type,
            source.original_size,
            source.created_at,
            source.duration,
            &source.encrypted_thumbnail,
            content_size_u32,
        )?;
        sink.write_all(&prefix)?;

        let mut plaintext_file = std::fs::File::open(&source.plaintext_url)?;
        crypto.encrypt_stream(&mut plaintext_file, plaintext_len, sink, key)?;

        manifest.push(FileManifestEntry {
            id: source.id,
            offset,
            size: u32::try_from(block_size)
                .map_err(|_| SvdfError::FieldTooLarge("entry block".to_string()))?,
            deleted: false,
        });
        offset += block_size;

        // Caller contract (§4.5 step 4): delete the decrypted-plaintext
        // temp file as soon as its content has been streamed into the sink.
        let _ = std::fs::remove_file(&source.plaintext_url);
    }

    finish_container(sink, offset, file_count, &manifest, metadata, key, crypto)?;
    Ok(manifest)
}

/// Reads `prior`'s file-entry region `[0, manifest_offset)` and copies it
/// byte-for-byte into `sink` in [`PRIOR_REGION_COPY_CHUNK`]-sized chunks
/// (existing file entries never move), marks `removed_ids` in the cloned
/// manifest with `deleted=true`, appends new entries via `for_each_new`,
/// then appends a fresh encrypted manifest + metadata and rewrites the
/// header.
#[instrument(level = "debug", skip(sink, prior, prior_manifest, for_each_new, removed_ids, metadata, key, crypto))]
#[allow(clippy::too_many_arguments)]
pub fn build_incremental_streaming<R, W, F>(
    sink: &mut W,
    prior: &mut R,
    prior_manifest_offset: u64,
    prior_manifest: &[FileManifestEntry],
    new_file_count: usize,
    mut for_each_new: F,
    removed_ids: &[Uuid],
    metadata: &SvdfMetadata,
    key: &ShareKey,
    crypto: &dyn Crypto,
) -> Result<Vec<FileManifestEntry>, SvdfError>
where
    R: Read + Seek,
    W: Write + Seek,
    F: FnMut(usize) -> SharedFile,
{
    sink.write_all(&[0u8; HEADER_SIZE])?;

    prior.seek(SeekFrom::Start(0))?;
    let mut remaining = prior_manifest_offset;
    let mut buf = vec![0u8; PRIOR_REGION_COPY_CHUNK];
    while remaining > 0 {
        let take = remaining.min(PRIOR_REGION_COPY_CHUNK as u64) as usize;
        prior.read_exact(&mut buf[..take])?;
        sink.write_all(&buf[..take])?;
        remaining -= take as u64;
    }
    let mut offset = prior_manifest_offset;

    let mut manifest: Vec<FileManifestEntry> = prior_manifest
        .iter()
        .cloned()
        .map(|mut entry| {
            if removed_ids.contains(&entry.id) {
                entry.deleted = true;
            }
            entry
        })
        .collect();

    for i in 0..new_file_count {
        let file = for_each_new(i);
        let block = encode_file_entry(&file)?;
        sink.write_all(&block)?;
        manifest.push(FileManifestEntry {
            id: file.id,
            offset,
            size: u32::try_from(block.len())
                .map_err(|_| SvdfError::FieldTooLarge("entry block".to_string()))?,
            deleted: false,
        });
        offset += block.len() as u64;
    }

    let active_count = manifest.iter().filter(|e| !e.deleted).count();
    finish_container(sink, offset, active_count, &manifest, metadata, key, crypto)?;
    Ok(manifest)
}

/// Shared tail of every streaming builder: write the encrypted manifest
/// and metadata, then seek back and write the real header.
fn finish_container<W: Write + Seek>(
    sink: &mut W,
    entries_end_offset: u64,
    active_file_count: usize,
    manifest: &[FileManifestEntry],
    metadata: &SvdfMetadata,
    key: &ShareKey,
    crypto: &dyn Crypto,
) -> Result<(), SvdfError> {
    let encrypted_manifest = encrypt_manifest(manifest, key, crypto)?;
    let encrypted_metadata = encrypt_metadata(metadata, key, crypto)?;

    sink.write_all(&encrypted_manifest)?;
    sink.write_all(&encrypted_metadata)?;

    let metadata_offset = entries_end_offset + encrypted_manifest.len() as u64;
    let header = SvdfHeader {
        version: SvdfHeader::WRITER_VERSION,
        active_file_count: u32::try_from(active_file_count)
            .map_err(|_| SvdfError::FieldTooLarge("active file count".to_string()))?,
        manifest_offset: entries_end_offset,
        manifest_size: u32::try_from(encrypted_manifest.len())
            .map_err(|_| SvdfError::FieldTooLarge("manifest size".to_string()))?,
        metadata_offset,
        metadata_size: u32::try_from(encrypted_metadata.len())
            .map_err(|_| SvdfError::FieldTooLarge("metadata size".to_string()))?,
    };

    sink.seek(SeekFrom::Start(0))?;
    sink.write_all(&header.encode())?;
    sink.seek(SeekFrom::Start(entries_end_offset + encrypted_manifest.len() as u64 + encrypted_metadata.len() as u64))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use crate::crypto::AeadCrypto;
    use crate::model::ShareKey;

    use super::*;

    fn key() -> ShareKey {
        ShareKey::new([7u8; 32])
    }

    fn sample_files(n: usize) -> Vec<SharedFile> {
        (0..n)
            .map(|i| SharedFile {
                id: Uuid::new_v4(),
                filename: format!("file-{i}.bin"),
                mime_type: "application/octet-stream".to_string(),
                original_size: 10,
                created_at: 1_700_000_000.0,
                duration: -1.0,
                encrypted_thumbnail: vec![],
                encrypted_content: vec![i as u8; 10],
            })
            .collect()
    }

    #[test]
    fn build_full_and_build_full_streaming_are_byte_identical() {
        let crypto = AeadCrypto;
        let key = key();
        let files = sample_files(3);
        let metadata = SvdfMetadata { owner_fingerprint: "owner".to_string(), shared_at: 123.0 };

        // build_full uses random nonces for manifest/metadata encryption,
        // so compare structurally (same header fields, same entry bytes)
        // rather than byte-for-byte on the whole container.
        let (full_bytes, full_manifest) = build_full(&files, &metadata, &key, &crypto).unwrap();

        let mut streaming_buf = Cursor::new(Vec::new());
        let streaming_manifest =
            build_full_streaming(&mut streaming_buf, files.len(), |i| files[i].clone(), &metadata, &key, &crypto)
                .unwrap();

        assert_eq!(full_manifest.len(), streaming_manifest.len());
        for (a, b) in full_manifest.iter().zip(streaming_manifest.iter()) {
            assert_eq!(a.id, b.id);
            assert_eq!(a.offset, b.offset);
            assert_eq!(a.size, b.size);
        }

        let header_full = SvdfHeader::decode(&full_bytes).unwrap();
        let streaming_bytes = streaming_buf.into_inner();
        let header_streaming = SvdfHeader::decode(&streaming_bytes).unwrap();
        assert_eq!(header_full.active_file_count, header_streaming.active_file_count);
        assert_eq!(header_full.manifest_offset, header_streaming.manifest_offset);

        // The file-entry region (deterministic, no per-call randomness) must
        // be byte-for-byte identical.
        let entries_region = HEADER_SIZE..header_full.manifest_offset as usize;
        assert_eq!(&full_bytes[entries_region.clone()], &streaming_bytes[entries_region]);
    }

    #[test]
    fn incremental_append_preserves_prior_region() {
        let crypto = AeadCrypto;
        let key = key();
        let metadata = SvdfMetadata { owner_fingerprint: "owner".to_string(), shared_at: 1.0 };
        let files = sample_files(3);

        let mut prior = Cursor::new(Vec::new());
        let prior_manifest =
            build_full_streaming(&mut prior, files.len(), |i| files[i].clone(), &metadata, &key, &crypto).unwrap();
        let prior_bytes = prior.into_inner();
        let prior_header = SvdfHeader::decode(&prior_bytes).unwrap();

        let new_file = sample_files(1).remove(0);
        let removed = [files[1].id];

        let mut prior_reader = Cursor::new(prior_bytes.clone());
        let mut new_sink = Cursor::new(Vec::new());
        let new_manifest = build_incremental_streaming(
            &mut new_sink,
            &mut prior_reader,
            prior_header.manifest_offset,
            &prior_manifest,
            1,
            |_| new_file.clone(),
            &removed,
            &metadata,
            &key,
            &crypto,
        )
        .unwrap();

        let new_bytes = new_sink.into_inner();
        let prior_region = HEADER_SIZE..prior_header.manifest_offset as usize;
        assert_eq!(&prior_bytes[prior_region.clone()], &new_bytes[prior_region]);

        assert_eq!(new_manifest.len(), 4);
        assert!(new_manifest[1].deleted);
        assert_eq!(new_manifest[1].id, files[1].id);
        assert_eq!(new_manifest.last().unwrap().id, new_file.id);

        let active: Vec<_> = new_manifest.iter().filter(|e| !e.deleted).map(|e| e.id).collect();
        assert_eq!(active.len(), 3);
        assert!(active.contains(&files[0].id));
        assert!(active.contains(&files[2].id));
        assert!(active.contains(&new_file.id));
    }

    #[test]
    fn budget_rejects_oversized_payload() {
        let crypto = AeadCrypto;
        let key = key();
        let metadata = SvdfMetadata { owner_fingerprint: "owner".to_string(), shared_at: 1.0 };
        let files = sample_files(5);
        let err = build_full_with_budget(&files, &metadata, &key, &crypto, 10).unwrap_err();
        assert!(matches!(err, SvdfError::PayloadTooLarge { .. }));
    }
}
