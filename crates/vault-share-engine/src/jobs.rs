//! Shared job-table plumbing reused by the upload, sync, and import engines:
//! cooperative cancellation flags, debounced-vs-immediate state persistence,
//! and directory-scan-based TTL garbage collection of stale pending state.
//!
//! Grounded on `oxidized-cryptolib::vault::locks::VaultLockManager` for the
//! `DashMap<Id, Arc<...>>`, lazily-created-entry shape, generalized from
//! per-resource `RwLock`s to per-job cancel flags and debounce state.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::instrument;

/// Cooperative cancellation flag, cloned into every task that needs to
/// observe it. Checked between work units per spec §5 ("every chunked
/// transfer loop... checks a cooperative cancellation flag between work
/// units").
#[derive(Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Signals cooperative cancellation was observed mid-operation. Distinct
/// from a failure (§7): the caller should transition the job to `paused`,
/// not `failed`.
#[derive(Debug)]
pub struct Cancelled;

/// Per-job debounced persistence, matching spec §4.5's "state.json writes
/// are coalesced with a 500 ms debounce window per job; critical
/// transitions are immediate... cancelling a pending debounced write is
/// mandatory before engaging an immediate write for the same job."
#[derive(Default)]
pub struct DebouncedWriter {
    pending: AsyncMutex<Option<JoinHandle<()>>>,
}

impl DebouncedWriter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedules `write` to run after `delay`, cancelling any write already
    /// scheduled for this writer.
    #[instrument(level = "trace", skip(self, write))]
    pub async fn write_debounced<F, Fut>(&self, delay: Duration, write: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut slot = self.pending.lock().await;
        if let Some(handle) = slot.take() {
            handle.abort();
        }
        *slot = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            write().await;
        }));
    }

    /// Cancels any pending debounced write, then runs `write` synchronously.
    #[instrument(level = "trace", skip(self, write))]
    pub async fn write_immediate<Fut>(&self, write: Fut)
    where
        Fut: Future<Output = ()>,
    {
        let mut slot = self.pending.lock().await;
        if let Some(handle) = slot.take() {
            handle.abort();
        }
        drop(slot);
        write.await;
    }
}

/// Scans `dir` for immediate child directories, parses each name as the key
/// type via `parse_key`, loads per-entry state via `load`, and returns the
/// keys of entries whose state is expired or unreadable (candidates for
/// removal) alongside the keys and states of those still live.
///
/// Grounded on the TTL-sweep idiom in
/// `oxidized-mount-common::ttl_cache::TtlCache::cleanup_expired`,
/// generalized from an in-memory map to an on-disk directory scan.
#[instrument(level = "debug", skip(parse_key, load, is_expired))]
pub async fn scan_pending_directory<K, S, ParseKey, Load, Fut, Expired>(
    dir: &std::path::Path,
    parse_key: ParseKey,
    load: Load,
    is_expired: Expired,
) -> std::io::Result<(Vec<(K, S)>, Vec<std::path::PathBuf>)>
where
    ParseKey: Fn(&str) -> Option<K>,
    Load: Fn(std::path::PathBuf) -> Fut,
    Fut: Future<Output = Option<S>>,
    Expired: Fn(&S) -> bool,
{
    let mut live = Vec::new();
    let mut stale_paths = Vec::new();

    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok((live, stale_paths)),
        Err(e) => return Err(e),
    };

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if !entry.file_type().await?.is_dir() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let Some(key) = parse_key(name) else {
            continue;
        };
        match load(path.clone()).await {
            Some(state) if !is_expired(&state) => live.push((key, state)),
            _ => stale_paths.push(path),
        }
    }

    Ok((live, stale_paths))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn cancel_flag_starts_clear_and_latches() {
        let flag = CancelFlag::new();
        assert!(!flag.is_cancelled());
        let clone = flag.clone();
        clone.cancel();
        assert!(flag.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn debounced_write_is_cancelled_by_a_later_immediate_write() {
        let writer = DebouncedWriter::new();
        let counter = Arc::new(AtomicU32::new(0));

        let c = Arc::clone(&counter);
        writer
            .write_debounced(Duration::from_millis(500), move || async move {
                c.fetch_add(1, Ordering::SeqCst);
            })
            .await;

        writer.write_immediate(async { counter.fetch_add(10, Ordering::SeqCst); }).await;
        tokio::time::advance(Duration::from_millis(600)).await;
        tokio::time::sleep(Duration::from_millis(1)).await;

        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn a_second_debounced_write_cancels_the_first() {
        let writer = DebouncedWriter::new();
        let log = Arc::new(AsyncMutex::new(Vec::new()));

        let l = Arc::clone(&log);
        writer.write_debounced(Duration::from_millis(100), move || async move { l.lock().await.push(1); }).await;
        let l = Arc::clone(&log);
        writer.write_debounced(Duration::from_millis(100), move || async move { l.lock().await.push(2); }).await;

        tokio::time::advance(Duration::from_millis(200)).await;
        tokio::time::sleep(Duration::from_millis(1)).await;

        assert_eq!(*log.lock().await, vec![2]);
    }
}
