//! Time-bounded diff cache
//!
//! Each key maps to a single-flight slot: the first caller to miss drives
//! initialization, later callers await the same slot and never see a diff
//! mid-initialization. Expired and replaced diffs are retired and closed
//! once no caller holds a handle any more.

use crate::diff::{cache_key, Diff, DiffKind};
use crate::error::{RootsmithError, RootsmithResult};
use crate::storage::ObjectStore;
use futures_util::future::join_all;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type Slot = Arc<OnceCell<Result<Arc<Diff>, String>>>;

struct Entry {
    slot: Slot,
    expires_at: Instant,
}

/// Counters exposed for logs and tests
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub inits: u64,
    pub evicted: u64,
    pub closed: u64,
    pub close_failures: u64,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    inits: AtomicU64,
    evicted: AtomicU64,
    closed: AtomicU64,
    close_failures: AtomicU64,
}

struct Inner {
    dir: PathBuf,
    store: Arc<dyn ObjectStore>,
    retention: Duration,
    interval: Duration,
    entries: Mutex<HashMap<String, Entry>>,
    retired: Mutex<Vec<Slot>>,
    counters: Counters,
}

/// Process-local cache from build identity to [`Diff`]
#[derive(Clone)]
pub struct DiffCache {
    inner: Arc<Inner>,
}

impl DiffCache {
    /// Create the cache, creating `dir` if needed
    pub fn new(
        dir: impl Into<PathBuf>,
        store: Arc<dyn ObjectStore>,
        retention: Duration,
        interval: Duration,
    ) -> RootsmithResult<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| {
            RootsmithError::io(format!("creating cache directory {}", dir.display()), e)
        })?;

        debug!(
            dir = %dir.display(),
            retention_secs = retention.as_secs(),
            "Diff cache ready"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                dir,
                store,
                retention,
                interval,
                entries: Mutex::new(HashMap::new()),
                retired: Mutex::new(Vec::new()),
                counters: Counters::default(),
            }),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.inner.dir
    }

    /// Return the initialized diff for the triple, loading it from storage on a miss.
    ///
    /// A hit refreshes the entry's expiry.
    pub async fn get(
        &self,
        build_id: &str,
        kind: DiffKind,
        block_size: u64,
    ) -> RootsmithResult<Arc<Diff>> {
        let key = cache_key(build_id, kind, block_size);
        let now = Instant::now();

        let (slot, hit) = {
            let mut entries = self.entries();
            match entries.get_mut(&key) {
                Some(entry) if entry.expires_at > now => {
                    entry.expires_at = now + self.inner.retention;
                    (Arc::clone(&entry.slot), true)
                }
                _ => {
                    let slot: Slot = Arc::new(OnceCell::new());
                    let stale = entries.insert(
                        key.clone(),
                        Entry {
                            slot: Arc::clone(&slot),
                            expires_at: now + self.inner.retention,
                        },
                    );
                    if let Some(stale) = stale {
                        self.retire(stale.slot);
                    }
                    (slot, false)
                }
            }
        };

        let counter = if hit {
            &self.inner.counters.hits
        } else {
            &self.inner.counters.misses
        };
        counter.fetch_add(1, Ordering::Relaxed);

        let outcome = slot
            .get_or_init(|| self.initialize(build_id, kind, block_size))
            .await
            .clone();

        match outcome {
            Ok(diff) => Ok(diff),
            Err(reason) => {
                self.remove_slot(&key, &slot);
                Err(RootsmithError::DiffInit { key, reason })
            }
        }
    }

    async fn initialize(
        &self,
        build_id: &str,
        kind: DiffKind,
        block_size: u64,
    ) -> Result<Arc<Diff>, String> {
        self.inner.counters.inits.fetch_add(1, Ordering::Relaxed);

        let diff = Diff::storage(build_id, kind, block_size, &self.inner.dir)
            .map_err(|e| e.to_string())?;
        match diff.init(self.inner.store.as_ref()).await {
            Ok(()) => Ok(Arc::new(diff)),
            Err(e) => {
                warn!(key = %diff.cache_key(), "Diff initialization failed: {}", e);
                let _ = diff.close().await;
                Err(e.to_string())
            }
        }
    }

    /// Insert or replace a diff under its derived key with a full retention window
    pub async fn put(
        &self,
        build_id: &str,
        kind: DiffKind,
        diff: Diff,
    ) -> RootsmithResult<Arc<Diff>> {
        let key = cache_key(build_id, kind, diff.block_size());
        if diff.cache_key() != key {
            return Err(RootsmithError::Internal(format!(
                "diff {} cannot be stored under {}",
                diff.cache_key(),
                key
            )));
        }

        diff.init(self.inner.store.as_ref()).await?;

        let diff = Arc::new(diff);
        let slot: Slot = Arc::new(OnceCell::new_with(Some(Ok(Arc::clone(&diff)))));

        let replaced = self.entries().insert(
            key.clone(),
            Entry {
                slot,
                expires_at: Instant::now() + self.inner.retention,
            },
        );
        if let Some(replaced) = replaced {
            debug!(key, "Replacing cached diff");
            self.retire(replaced.slot);
        }

        Ok(diff)
    }

    /// Copy a locally produced artifact into the cache directory and put it
    pub async fn put_file(
        &self,
        build_id: &str,
        kind: DiffKind,
        block_size: u64,
        source: &Path,
    ) -> RootsmithResult<Arc<Diff>> {
        let staged = Diff::storage(build_id, kind, block_size, &self.inner.dir)?;
        let dest = staged.path().to_path_buf();

        tokio::fs::copy(source, &dest).await.map_err(|e| {
            RootsmithError::io(format!("copying {} into the cache", source.display()), e)
        })?;

        let diff = match Diff::local(build_id, kind, block_size, &dest).await {
            Ok(diff) => diff,
            Err(e) => {
                let _ = tokio::fs::remove_file(&dest).await;
                return Err(e);
            }
        };
        self.put(build_id, kind, diff).await
    }

    /// Drop the entry for the triple; its diff is closed once unused
    pub fn remove(&self, build_id: &str, kind: DiffKind, block_size: u64) -> bool {
        let removed = self
            .entries()
            .remove(&cache_key(build_id, kind, block_size));
        match removed {
            Some(entry) => {
                self.retire(entry.slot);
                true
            }
            None => false,
        }
    }

    /// Whether a live entry exists for the triple
    pub fn contains(&self, build_id: &str, kind: DiffKind, block_size: u64) -> bool {
        let now = Instant::now();
        self.entries()
            .get(&cache_key(build_id, kind, block_size))
            .is_some_and(|entry| entry.expires_at > now)
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let c = &self.inner.counters;
        CacheStats {
            hits: c.hits.load(Ordering::Relaxed),
            misses: c.misses.load(Ordering::Relaxed),
            inits: c.inits.load(Ordering::Relaxed),
            evicted: c.evicted.load(Ordering::Relaxed),
            closed: c.closed.load(Ordering::Relaxed),
            close_failures: c.close_failures.load(Ordering::Relaxed),
        }
    }

    /// Remove expired entries, retiring their diffs. Returns the number evicted.
    pub fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<(String, Entry)> = {
            let mut entries = self.entries();
            let keys: Vec<String> = entries
                .iter()
                .filter(|(_, entry)| entry.expires_at <= now)
                .map(|(key, _)| key.clone())
                .collect();
            keys.into_iter()
                .filter_map(|key| entries.remove_entry(&key))
                .collect()
        };

        let count = expired.len();
        for (key, entry) in expired {
            debug!(key, "Evicting expired diff");
            self.retire(entry.slot);
        }

        self.inner
            .counters
            .evicted
            .fetch_add(count as u64, Ordering::Relaxed);
        count
    }

    /// Close retired diffs nobody references any more. Returns the number closed.
    ///
    /// Diffs still held by callers stay retired until a later sweep.
    pub async fn sweep_retired(&self) -> usize {
        let ready: Vec<Arc<Diff>> = {
            let mut retired = self.retired();
            let mut ready = Vec::new();
            retired.retain(|slot| {
                // A caller may still be awaiting or cloning out of the slot
                if Arc::strong_count(slot) > 1 {
                    return true;
                }
                match slot.get() {
                    Some(Ok(diff)) if Arc::strong_count(diff) == 1 => {
                        ready.push(Arc::clone(diff));
                        false
                    }
                    Some(Ok(_)) => true,
                    // Failed, or abandoned before initialization finished
                    Some(Err(_)) | None => false,
                }
            });
            ready
        };

        let results = join_all(ready.iter().map(|diff| diff.close())).await;

        let mut closed = 0;
        for (diff, result) in ready.iter().zip(results) {
            match result {
                Ok(()) => {
                    closed += 1;
                    self.inner.counters.closed.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    self.inner
                        .counters
                        .close_failures
                        .fetch_add(1, Ordering::Relaxed);
                    warn!(key = %diff.cache_key(), "Failed to close evicted diff: {}", e);
                }
            }
        }
        closed
    }

    /// Number of retired diffs awaiting close
    pub fn retired_len(&self) -> usize {
        self.retired().len()
    }

    /// Spawn the background eviction loop; it stops when `cancel` fires
    pub fn start(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let cache = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(cache.inner.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let evicted = cache.evict_expired();
                        let closed = cache.sweep_retired().await;
                        if evicted > 0 || closed > 0 {
                            debug!(evicted, closed, "Eviction cycle");
                        }
                    }
                }
            }

            debug!("Diff cache eviction loop stopped");
        })
    }

    /// Retire every entry and close what is no longer referenced.
    ///
    /// Returns the number of diffs still held by callers.
    pub async fn close_all(&self) -> usize {
        let drained: Vec<Entry> = self.entries().drain().map(|(_, entry)| entry).collect();
        for entry in drained {
            self.retire(entry.slot);
        }

        let closed = self.sweep_retired().await;
        let pending = self.retired_len();
        info!(closed, pending, "Diff cache closed");
        pending
    }

    fn retire(&self, slot: Slot) {
        self.retired().push(slot);
    }

    fn remove_slot(&self, key: &str, slot: &Slot) {
        let mut entries = self.entries();
        if entries
            .get(key)
            .is_some_and(|entry| Arc::ptr_eq(&entry.slot, slot))
        {
            entries.remove(key);
        }
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, Entry>> {
        self.inner
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn retired(&self) -> std::sync::MutexGuard<'_, Vec<Slot>> {
        self.inner
            .retired
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
