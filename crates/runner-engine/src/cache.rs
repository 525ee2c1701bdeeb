//! Content-addressed store for downloaded agent images.
//!
//! Each image lives under `<cache_dir>/<sha256(url)>/` as the saved archive
//! plus a `meta.json` sidecar. The sidecar is written last, so entries
//! without a matching sidecar are incomplete and are discarded on startup.
//! Concurrent requests for the same URL share one in-flight download.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use runner_common::{Result, RunnerError};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument, warn};

use crate::fetch::ImageFetcher;

const ARCHIVE_FILE: &str = "image.tar";
const META_FILE: &str = "meta.json";

/// An agent URL together with its cache key.
#[derive(Debug, Clone)]
pub struct ImageRef {
    pub url: String,
    pub key: String,
}

impl ImageRef {
    pub fn from_url(url: &str) -> ImageRef {
        let mut hasher = Sha256::new();
        hasher.update(url.as_bytes());
        ImageRef {
            url: url.to_string(),
            key: format!("{:x}", hasher.finalize()),
        }
    }
}

/// A fully downloaded image ready to be loaded into the container runtime.
#[derive(Debug, Clone)]
pub struct CachedImage {
    pub key: String,
    pub url: String,
    pub archive_path: PathBuf,
    pub size_bytes: u64,
    pub repo_tag: String,
}

impl CachedImage {
    fn entry_dir(&self) -> Option<&Path> {
        self.archive_path.parent()
    }
}

/// Sidecar persisted next to the archive once a download completes.
#[derive(Debug, Serialize, Deserialize)]
struct CacheMeta {
    url: String,
    size_bytes: u64,
    repo_tag: String,
    fetched_at: DateTime<Utc>,
}

/// Whether a resolve was served from a completed cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOutcome {
    Hit,
    Miss,
}

impl std::fmt::Display for CacheOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheOutcome::Hit => write!(f, "hit"),
            CacheOutcome::Miss => write!(f, "miss"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct CacheStatsSnapshot {
    pub resolves: u64,
    pub hits: u64,
    pub misses: u64,
    pub downloads: u64,
    pub evictions: u64,
    pub entries: usize,
    pub total_bytes: u64,
}

#[derive(Default)]
struct CacheStats {
    resolves: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    downloads: AtomicU64,
    evictions: AtomicU64,
}

struct CacheEntry {
    image: CachedImage,
    refcount: usize,
    last_used: Instant,
}

struct CacheTable {
    map: HashMap<String, CacheEntry>,
    total_bytes: u64,
}

type Flight = Shared<BoxFuture<'static, Result<CachedImage>>>;

struct CacheInner {
    dir: PathBuf,
    max_bytes: u64,
    max_entries: usize,
    fetcher: Arc<dyn ImageFetcher>,
    entries: Mutex<CacheTable>,
    flights: Mutex<HashMap<String, Flight>>,
    stats: CacheStats,
}

/// Refcounted LRU cache over image archives on disk.
#[derive(Clone)]
pub struct ImageCache {
    inner: Arc<CacheInner>,
}

impl ImageCache {
    /// Opens the cache directory, restoring completed entries and removing
    /// anything left behind by an interrupted download.
    pub fn open(
        dir: PathBuf,
        max_bytes: u64,
        max_entries: usize,
        fetcher: Arc<dyn ImageFetcher>,
    ) -> Result<ImageCache> {
        std::fs::create_dir_all(&dir)
            .map_err(|e| RunnerError::Config(format!("creating cache dir {}: {e}", dir.display())))?;

        let mut table = CacheTable {
            map: HashMap::new(),
            total_bytes: 0,
        };
        let listing = std::fs::read_dir(&dir)
            .map_err(|e| RunnerError::Config(format!("reading cache dir {}: {e}", dir.display())))?;
        for dent in listing.flatten() {
            let path = dent.path();
            if !path.is_dir() {
                continue;
            }
            let key = dent.file_name().to_string_lossy().to_string();
            match restore_entry(&path, &key) {
                Some(image) => {
                    table.total_bytes += image.size_bytes;
                    table.map.insert(
                        key,
                        CacheEntry {
                            image,
                            refcount: 0,
                            last_used: Instant::now(),
                        },
                    );
                }
                None => {
                    warn!(path = %path.display(), "discarding incomplete cache entry");
                    let _ = std::fs::remove_dir_all(&path);
                }
            }
        }
        info!(
            entries = table.map.len(),
            total_bytes = table.total_bytes,
            dir = %dir.display(),
            "image cache opened"
        );

        let cache = ImageCache {
            inner: Arc::new(CacheInner {
                dir,
                max_bytes,
                max_entries,
                fetcher,
                entries: Mutex::new(table),
                flights: Mutex::new(HashMap::new()),
                stats: CacheStats::default(),
            }),
        };
        cache.evict_excluding(None);
        Ok(cache)
    }

    /// Resolves a URL to a cached image, downloading it if necessary. The
    /// returned image is retained and must be paired with [`release`].
    ///
    /// Concurrent callers for the same URL join a single download. Each
    /// caller waits at most `deadline`; the download itself keeps running
    /// for late joiners even if this caller times out.
    ///
    /// [`release`]: ImageCache::release
    #[instrument(skip(self, deadline))]
    pub async fn resolve(&self, url: &str, deadline: Duration) -> Result<(CachedImage, CacheOutcome)> {
        self.inner.stats.resolves.fetch_add(1, Ordering::Relaxed);
        let image_ref = ImageRef::from_url(url);
        let started = Instant::now();
        let mut missed = false;

        loop {
            if let Some(image) = self.try_retain(&image_ref.key) {
                self.inner.stats.hits.fetch_add(1, Ordering::Relaxed);
                debug!(key = %image_ref.key, "image cache hit");
                return Ok((image, CacheOutcome::Hit));
            }
            if !missed {
                self.inner.stats.misses.fetch_add(1, Ordering::Relaxed);
                missed = true;
            }

            let flight = self.join_flight(&image_ref, deadline);
            let remaining = deadline.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                return Err(RunnerError::deadline("image_resolve"));
            }
            let image = match tokio::time::timeout(remaining, flight).await {
                Err(_) => return Err(RunnerError::deadline("image_resolve")),
                Ok(Err(e)) => return Err(e),
                Ok(Ok(image)) => image,
            };

            if let Some(image) = self.try_retain(&image.key) {
                return Ok((image, CacheOutcome::Miss));
            }
            // The freshly inserted entry was evicted before we could pin it.
            // Other keys' churn can cause this; go around again.
            warn!(key = %image_ref.key, "cache entry evicted before retain, retrying");
        }
    }

    /// Takes an additional reference on an already cached image.
    pub fn retain(&self, key: &str) -> Result<CachedImage> {
        self.try_retain(key)
            .ok_or_else(|| RunnerError::Internal(format!("image {key} is not in the cache")))
    }

    /// Drops one reference. Zero-reference entries become eviction
    /// candidates when the cache is over budget.
    pub fn release(&self, key: &str) {
        {
            let mut table = self.lock_entries();
            match table.map.get_mut(key) {
                Some(entry) if entry.refcount > 0 => {
                    entry.refcount -= 1;
                    entry.last_used = Instant::now();
                }
                Some(_) => warn!(key, "release on image with zero references"),
                None => warn!(key, "release on image not in the cache"),
            }
        }
        self.evict_excluding(None);
    }

    pub fn stats(&self) -> CacheStatsSnapshot {
        let (entries, total_bytes) = {
            let table = self.lock_entries();
            (table.map.len(), table.total_bytes)
        };
        CacheStatsSnapshot {
            resolves: self.inner.stats.resolves.load(Ordering::Relaxed),
            hits: self.inner.stats.hits.load(Ordering::Relaxed),
            misses: self.inner.stats.misses.load(Ordering::Relaxed),
            downloads: self.inner.stats.downloads.load(Ordering::Relaxed),
            evictions: self.inner.stats.evictions.load(Ordering::Relaxed),
            entries,
            total_bytes,
        }
    }

    fn lock_entries(&self) -> std::sync::MutexGuard<'_, CacheTable> {
        self.inner.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn try_retain(&self, key: &str) -> Option<CachedImage> {
        let mut table = self.lock_entries();
        let entry = table.map.get_mut(key)?;
        entry.refcount += 1;
        entry.last_used = Instant::now();
        Some(entry.image.clone())
    }

    /// Returns the in-flight download for this key, starting one if none
    /// exists. The download runs on its own task so that a timed-out
    /// waiter does not cancel it for everyone else.
    fn join_flight(&self, image_ref: &ImageRef, deadline: Duration) -> Flight {
        let mut flights = self.inner.flights.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(flight) = flights.get(&image_ref.key) {
            debug!(key = %image_ref.key, "joining in-flight download");
            return flight.clone();
        }

        self.inner.stats.downloads.fetch_add(1, Ordering::Relaxed);
        let cache = self.clone();
        let task_ref = image_ref.clone();
        let handle = tokio::spawn(async move { cache.download(task_ref, deadline).await });
        let flight: Flight = async move {
            handle
                .await
                .map_err(|e| RunnerError::Internal(format!("image download task failed: {e}")))?
        }
        .boxed()
        .shared();
        flights.insert(image_ref.key.clone(), flight.clone());

        // Once the flight settles, drop it from the map so a failed
        // download is retried by the next request.
        let cache = self.clone();
        let key = image_ref.key.clone();
        let watched = flight.clone();
        tokio::spawn(async move {
            let _ = watched.clone().await;
            let mut flights = cache.inner.flights.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(current) = flights.get(&key) {
                if current.ptr_eq(&watched) {
                    flights.remove(&key);
                }
            }
        });

        flight
    }

    async fn download(&self, image_ref: ImageRef, deadline: Duration) -> Result<CachedImage> {
        // A download for this key may have completed between the caller's
        // miss and this flight starting. Reuse the entry instead of
        // rewriting files somebody may already hold a reference to.
        {
            let table = self.lock_entries();
            if let Some(entry) = table.map.get(&image_ref.key) {
                return Ok(entry.image.clone());
            }
        }

        info!(url = %image_ref.url, key = %image_ref.key, "downloading agent image");
        let entry_dir = self.inner.dir.join(&image_ref.key);
        tokio::fs::create_dir_all(&entry_dir).await.map_err(|e| {
            RunnerError::ImageResolve(format!("creating {}: {e}", entry_dir.display()))
        })?;

        let archive_path = entry_dir.join(ARCHIVE_FILE);
        let fetched = match self
            .inner
            .fetcher
            .fetch(image_ref.url.clone(), archive_path.clone(), deadline)
            .await
        {
            Ok(fetched) => fetched,
            Err(e) => {
                let _ = tokio::fs::remove_dir_all(&entry_dir).await;
                warn!(url = %image_ref.url, error = %e, "image download failed");
                return Err(e);
            }
        };

        let meta = CacheMeta {
            url: image_ref.url.clone(),
            size_bytes: fetched.size_bytes,
            repo_tag: fetched.repo_tag.clone(),
            fetched_at: Utc::now(),
        };
        let meta_bytes = serde_json::to_vec_pretty(&meta)
            .map_err(|e| RunnerError::Internal(format!("encoding cache metadata: {e}")))?;
        if let Err(e) = tokio::fs::write(entry_dir.join(META_FILE), meta_bytes).await {
            let _ = tokio::fs::remove_dir_all(&entry_dir).await;
            return Err(RunnerError::ImageResolve(format!(
                "persisting cache metadata: {e}"
            )));
        }

        let image = CachedImage {
            key: image_ref.key.clone(),
            url: image_ref.url,
            archive_path,
            size_bytes: fetched.size_bytes,
            repo_tag: fetched.repo_tag,
        };
        {
            let mut table = self.lock_entries();
            table.total_bytes += image.size_bytes;
            let previous = table.map.insert(
                image.key.clone(),
                CacheEntry {
                    image: image.clone(),
                    refcount: 0,
                    last_used: Instant::now(),
                },
            );
            if let Some(previous) = previous {
                table.total_bytes = table.total_bytes.saturating_sub(previous.image.size_bytes);
            }
        }
        info!(
            key = %image.key,
            size_bytes = image.size_bytes,
            repo_tag = %image.repo_tag,
            "image cached"
        );
        self.evict_excluding(Some(&image.key));
        Ok(image)
    }

    /// Evicts zero-reference entries, least recently used first, until both
    /// budgets are met. Pinned entries can keep the cache over budget.
    /// `exclude` protects a just-inserted entry that its waiters have not
    /// pinned yet.
    fn evict_excluding(&self, exclude: Option<&str>) {
        let victims: Vec<CachedImage> = {
            let mut table = self.lock_entries();
            let mut victims = Vec::new();
            while table.map.len() > self.inner.max_entries
                || table.total_bytes > self.inner.max_bytes
            {
                let victim_key = table
                    .map
                    .iter()
                    .filter(|(key, entry)| entry.refcount == 0 && Some(key.as_str()) != exclude)
                    .min_by_key(|(_, entry)| entry.last_used)
                    .map(|(key, _)| key.clone());
                let Some(key) = victim_key else {
                    break;
                };
                if let Some(entry) = table.map.remove(&key) {
                    table.total_bytes = table.total_bytes.saturating_sub(entry.image.size_bytes);
                    victims.push(entry.image);
                }
            }
            victims
        };

        for image in victims {
            self.inner.stats.evictions.fetch_add(1, Ordering::Relaxed);
            info!(key = %image.key, size_bytes = image.size_bytes, "evicting cached image");
            if let Some(dir) = image.entry_dir() {
                if let Err(e) = std::fs::remove_dir_all(dir) {
                    warn!(dir = %dir.display(), error = %e, "failed to remove evicted image");
                }
            }
        }
    }
}

fn restore_entry(entry_dir: &Path, key: &str) -> Option<CachedImage> {
    let meta_bytes = std::fs::read(entry_dir.join(META_FILE)).ok()?;
    let meta: CacheMeta = serde_json::from_slice(&meta_bytes).ok()?;
    let archive_path = entry_dir.join(ARCHIVE_FILE);
    let archive_len = std::fs::metadata(&archive_path).ok()?.len();
    if archive_len != meta.size_bytes {
        return None;
    }
    Some(CachedImage {
        key: key.to_string(),
        url: meta.url,
        archive_path,
        size_bytes: meta.size_bytes,
        repo_tag: meta.repo_tag,
    })
}
