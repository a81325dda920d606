//! Chunked transfer of SVDF containers: fixed-size chunking, bounded
//! concurrent upload/download, resume-by-enumeration, content-hash diffing.
//!
//! Grounded on `oxidized-cryptolib::fs::streaming`'s fixed-chunk-size,
//! bounded-read discipline, generalized from per-file chunked crypto to
//! per-container chunked network transfer, and on the teacher's bench
//! harness (`workflows.rs`) for the bounded-worker-pool shape.

use std::collections::HashSet;
use std::io::SeekFrom;
use std::path::Path;
use std::sync::Arc;

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Semaphore;
use tracing::{instrument, warn};
use uuid::Uuid;

use crate::crypto::chunk_hash;
use crate::remote::{RemoteError, RemoteStore};

/// Size of a single chunk. Deliberately distinct from
/// [`crate::crypto::CRYPTO_CHUNK_SIZE`]: this is a transport-level framing
/// unit, not a crypto envelope boundary.
pub const CHUNK_SIZE: u64 = 2 * 1024 * 1024;
/// Maximum concurrent chunk transfers per job.
pub const MAX_CONCURRENCY: usize = 4;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("remote store error: {0}")]
    Remote(#[from] RemoteError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("missing chunk {index} of {total} when assembling download")]
    MissingChunk { index: u64, total: u64 },
}

/// Total chunk count for a container of `size` bytes. Always at least 1
/// (an empty container is still one chunk).
#[must_use]
pub fn chunk_count(size: u64) -> u64 {
    size.div_ceil(CHUNK_SIZE).max(1)
}

/// Deterministic remote key for chunk `index` of `share_vault_id`.
#[must_use]
pub fn chunk_id(share_vault_id: Uuid, index: u64) -> String {
    format!("{share_vault_id}_chunk_{index}")
}

/// Hex SHA-256 of each fixed-size slice of an in-memory buffer.
#[must_use]
pub fn compute_chunk_hashes_buffer(data: &[u8]) -> Vec<String> {
    data.chunks(CHUNK_SIZE as usize).map(chunk_hash).collect()
}

/// Hex SHA-256 of each fixed-size slice of a file, read chunk-by-chunk so
/// peak memory stays at one [`CHUNK_SIZE`] buffer.
#[instrument(level = "debug", skip(path))]
pub async fn compute_chunk_hashes_file(path: &Path) -> Result<Vec<String>, TransportError> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hashes = Vec::new();
    let mut buf = vec![0u8; CHUNK_SIZE as usize];
    loop {
        let read = read_up_to(&mut file, &mut buf).await?;
        if read == 0 {
            break;
        }
        hashes.push(chunk_hash(&buf[..read]));
    }
    Ok(hashes)
}

async fn read_up_to<R: tokio::io::AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut [u8],
) -> std::io::Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        let n = reader.read(&mut buf[total..]).await?;
        if n == 0 {
            break;
        }
        total += n;
    }
    Ok(total)
}

/// Uploads the given `(index, bytes)` pairs with up to [`MAX_CONCURRENCY`]
/// concurrent store writes. Chunk completion order is not guaranteed;
/// `on_progress` is called once per completed chunk with the running count.
#[instrument(level = "debug", skip(store, chunks, on_progress))]
pub async fn upload_chunks(
    store: &(dyn RemoteStore + Sync),
    share_vault_id: Uuid,
    chunks: Vec<(u64, Vec<u8>)>,
    on_progress: impl Fn(u64) + Send + Sync + 'static,
) -> Result<(), TransportError> {
    let semaphore = Arc::new(Semaphore::new(MAX_CONCURRENCY));
    let mut tasks = Vec::with_capacity(chunks.len());

    for (index, bytes) in chunks {
        let semaphore = Arc::clone(&semaphore);
        tasks.push(async move {
            let _permit = semaphore.acquire().await.expect("semaphore not closed");
            store.save_chunk(share_vault_id, index, bytes).await
        });
    }

    let mut completed = 0u64;
    for result in futures::future::join_all(tasks).await {
        result?;
        completed += 1;
        on_progress(completed);
    }
    Ok(())
}

/// Resume-oriented upload: opens `file_path`, reads exactly one chunk per
/// requested index (deduplicated), and uploads only those. Indices whose
/// read returns zero bytes (past end-of-file) are skipped.
#[instrument(level = "debug", skip(store, indices, on_progress))]
pub async fn upload_chunks_from_file(
    store: &(dyn RemoteStore + Sync),
    share_vault_id: Uuid,
    file_path: &Path,
    indices: &[u64],
    on_progress: impl Fn(u64) + Send + Sync + 'static,
) -> Result<(), TransportError> {
    let mut unique: Vec<u64> = indices.iter().copied().collect::<HashSet<_>>().into_iter().collect();
    unique.sort_unstable();

    let mut chunks = Vec::with_capacity(unique.len());
    let mut file = tokio::fs::File::open(file_path).await?;
    for index in unique {
        file.seek(SeekFrom::Start(index * CHUNK_SIZE)).await?;
        let mut buf = vec![0u8; CHUNK_SIZE as usize];
        let read = read_up_to(&mut file, &mut buf).await?;
        if read == 0 {
            continue;
        }
        buf.truncate(read);
        chunks.push((index, buf));
    }
    upload_chunks(store, share_vault_id, chunks, on_progress).await
}

/// Indices that need uploading given old/new per-chunk hash lists: grown
/// indices (no entry in `previous`) or indices whose hash changed.
#[must_use]
pub fn incremental_diff_indices(new_hashes: &[String], previous_hashes: &[String]) -> Vec<u64> {
    new_hashes
        .iter()
        .enumerate()
        .filter(|(i, hash)| previous_hashes.get(*i).is_none_or(|prev| prev != *hash))
        .map(|(i, _)| i as u64)
        .collect()
}

/// Performs an incremental sync: uploads exactly the indices
/// [`incremental_diff_indices`] names, then deletes any now-stale remote
/// chunks at indices `[new.len(), previous.len())` (container shrank).
#[instrument(level = "debug", skip(store, read_chunk, on_progress))]
pub async fn incremental_sync(
    store: &(dyn RemoteStore + Sync),
    share_vault_id: Uuid,
    new_hashes: &[String],
    previous_hashes: &[String],
    read_chunk: impl Fn(u64) -> std::pin::Pin<Box<dyn std::future::Future<Output = std::io::Result<Vec<u8>>> + Send>>,
    on_progress: impl Fn(u64) + Send + Sync + 'static,
) -> Result<(), TransportError> {
    let to_upload = incremental_diff_indices(new_hashes, previous_hashes);
    let mut chunks = Vec::with_capacity(to_upload.len());
    for index in to_upload {
        let bytes = read_chunk(index).await?;
        chunks.push((index, bytes));
    }
    upload_chunks(store, share_vault_id, chunks, on_progress).await?;

    if new_hashes.len() < previous_hashes.len() {
        for index in new_hashes.len() as u64..previous_hashes.len() as u64 {
            if let Err(e) = store.delete_chunk(share_vault_id, index).await {
                warn!(%share_vault_id, index, error = %e, "failed to delete stale chunk after shrink");
            }
        }
    }
    Ok(())
}

/// Queries the store for all chunk indices already present for
/// `share_vault_id`, and returns the complement within `0..total_chunks`.
#[instrument(level = "debug", skip(store))]
pub async fn missing_indices(
    store: &(dyn RemoteStore + Sync),
    share_vault_id: Uuid,
    total_chunks: u64,
) -> Result<Vec<u64>, TransportError> {
    let existing: HashSet<u64> = store.list_chunk_indices(share_vault_id).await?.into_iter().collect();
    Ok((0..total_chunks).filter(|i| !existing.contains(i)).collect())
}

/// Downloads all chunks for a share, concatenated in index order. Fails if
/// any index in `0..total_chunks` is missing.
#[instrument(level = "debug", skip(store))]
pub async fn download(
    store: &(dyn RemoteStore + Sync),
    share_vault_id: Uuid,
    total_chunks: u64,
) -> Result<Vec<u8>, TransportError> {
    let semaphore = Arc::new(Semaphore::new(MAX_CONCURRENCY));
    let mut tasks = Vec::with_capacity(total_chunks as usize);
    for index in 0..total_chunks {
        let semaphore = Arc::clone(&semaphore);
        tasks.push(async move {
            let _permit = semaphore.acquire().await.expect("semaphore not closed");
            store.get_chunk(share_vault_id, index).await.map(|bytes| (index, bytes))
        });
    }

    let mut slots: Vec<Option<Vec<u8>>> = vec![None; total_chunks as usize];
    for result in futures::future::join_all(tasks).await {
        let (index, bytes) = result?;
        slots[index as usize] = Some(bytes);
    }

    let mut out = Vec::new();
    for (index, slot) in slots.into_iter().enumerate() {
        match slot {
            Some(bytes) => out.extend_from_slice(&bytes),
            None => return Err(TransportError::MissingChunk { index: index as u64, total: total_chunks }),
        }
    }
    Ok(out)
}

/// Downloads all chunks directly into `out_path` at their natural offsets,
/// bounding memory to one chunk regardless of container size.
#[instrument(level = "debug", skip(store, out_path))]
pub async fn download_to_file(
    store: &(dyn RemoteStore + Sync),
    share_vault_id: Uuid,
    total_chunks: u64,
    out_path: &Path,
) -> Result<(), TransportError> {
    let semaphore = Arc::new(Semaphore::new(MAX_CONCURRENCY));
    let mut tasks = Vec::with_capacity(total_chunks as usize);
    for index in 0..total_chunks {
        let semaphore = Arc::clone(&semaphore);
        tasks.push(async move {
            let _permit = semaphore.acquire().await.expect("semaphore not closed");
            store.get_chunk(share_vault_id, index).await.map(|bytes| (index, bytes))
        });
    }

    let file = tokio::fs::File::create(out_path).await?;
    let mut file = file;
    for result in futures::future::join_all(tasks).await {
        let (index, bytes) = result?;
        file.seek(SeekFrom::Start(index * CHUNK_SIZE)).await?;
        file.write_all(&bytes).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_count_rounds_up_and_floors_at_one() {
        assert_eq!(chunk_count(0), 1);
        assert_eq!(chunk_count(1), 1);
        assert_eq!(chunk_count(CHUNK_SIZE), 1);
        assert_eq!(chunk_count(CHUNK_SIZE + 1), 2);
        assert_eq!(chunk_count(CHUNK_SIZE * 3), 3);
    }

    #[test]
    fn chunk_id_is_deterministic() {
        let id = Uuid::new_v4();
        assert_eq!(chunk_id(id, 7), format!("{id}_chunk_7"));
    }

    #[test]
    fn incremental_diff_detects_growth_and_changes() {
        let previous = vec!["a".to_string(), "b".to_string()];
        let new = vec!["a".to_string(), "x".to_string(), "c".to_string()];
        assert_eq!(incremental_diff_indices(&new, &previous), vec![1, 2]);
    }

    #[test]
    fn incremental_diff_empty_when_unchanged() {
        let hashes = vec!["a".to_string(), "b".to_string()];
        assert!(incremental_diff_indices(&hashes, &hashes).is_empty());
    }

    #[test]
    fn compute_chunk_hashes_buffer_matches_manual_slicing() {
        let data = vec![7u8; (CHUNK_SIZE as usize) + 10];
        let hashes = compute_chunk_hashes_buffer(&data);
        assert_eq!(hashes.len(), 2);
        assert_eq!(hashes[0], chunk_hash(&data[..CHUNK_SIZE as usize]));
        assert_eq!(hashes[1], chunk_hash(&data[CHUNK_SIZE as usize..]));
    }
}
