use std::sync::Arc;
use tokio::sync::Mutex;

use super::{evict_overflow, CacheLimits};
use crate::clock::Clock;
use crate::storage::{CachedImage, Collection, OversizedImage, StorageError, Store};

/// Binary image blobs keyed by source URL.
///
/// Bounded three ways: a per-image size cap, an entry count and a total byte budget.
#[derive(Clone)]
pub struct ImageCache {
    store: Arc<Store>,
    limits: CacheLimits,
    clock: Arc<dyn Clock>,
    lock: Arc<Mutex<()>>,
}

impl ImageCache {
    pub fn new(store: Arc<Store>, limits: CacheLimits, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            limits,
            clock,
            lock: Arc::new(Mutex::new(())),
        }
    }

    /// Whether a blob of `size` bytes fits the per-image cap.
    pub fn check_size(&self, size: u64) -> Result<(), OversizedImage> {
        if size > self.limits.max_image_size {
            return Err(OversizedImage {
                size,
                limit: self.limits.max_image_size,
            });
        }
        Ok(())
    }

    /// Cache an image blob, replacing any entry for the same URL.
    ///
    /// Blobs over the per-image cap are skipped with a warning and `Ok(())`.
    /// After the write, least recently used images are evicted until both the
    /// entry cap and the byte budget hold.
    ///
    /// # Errors
    ///
    /// Returns the storage error if the image itself could not be written.
    pub async fn cache_image(&self, url: &str, blob: Vec<u8>) -> Result<(), StorageError> {
        let size = blob.len() as u64;
        if let Err(oversized) = self.check_size(size) {
            tracing::warn!(url = %url, size = oversized.size, limit = oversized.limit, "{oversized}");
            return Ok(());
        }

        let now = self.clock.now();
        let entry = CachedImage {
            url: url.to_string(),
            blob,
            size,
            cached_at: now,
            last_accessed: now,
            access_count: 0,
        };

        let _guard = self.lock.lock().await;

        if let Err(e) = self.store.put(&entry).await {
            tracing::error!(url = %url, size, error = %e, "Failed to cache image");
            return Err(e);
        }
        tracing::debug!(url = %url, size, "Cached image");

        if let Err(e) =
            evict_overflow(&self.store, Collection::Images, self.limits.max_cached_images).await
        {
            tracing::warn!(error = %e, "Image eviction sweep failed");
        }
        if let Err(e) = self.evict_over_budget(url).await {
            tracing::warn!(error = %e, "Image byte budget sweep failed");
        }

        Ok(())
    }

    /// Evict least recently used images until the total fits the byte budget.
    ///
    /// `keep` (the image just written) is only evicted if it alone is over budget.
    async fn evict_over_budget(&self, keep: &str) -> Result<u64, StorageError> {
        let budget = self.limits.max_total_image_bytes;
        let mut total = self.store.total_image_bytes().await?;
        if total <= budget {
            return Ok(0);
        }

        let mut victims = Vec::new();
        let mut kept_size = 0;
        for (url, size) in self.store.image_sizes_by_access().await? {
            if url == keep {
                kept_size = size;
                continue;
            }
            if total <= budget {
                break;
            }
            total -= size;
            victims.push(url);
        }
        if total > budget && kept_size > 0 {
            victims.push(keep.to_string());
        }

        let evicted = self.store.delete_many(Collection::Images, &victims).await?;
        tracing::debug!(evicted, budget, "Evicted images over byte budget");
        Ok(evicted)
    }

    /// Read a cached image.
    ///
    /// Same miss, expiry and touch rules as articles. Storage failures are
    /// logged and reported as a miss.
    pub async fn get_cached_image(&self, url: &str) -> Option<Vec<u8>> {
        match self.lookup(url).await {
            Ok(blob) => blob,
            Err(e) => {
                tracing::warn!(url = %url, error = %e, "Failed to read cached image");
                None
            }
        }
    }

    async fn lookup(&self, url: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let _guard = self.lock.lock().await;

        let Some(entry) = self.store.get::<CachedImage>(url).await? else {
            return Ok(None);
        };

        let now = self.clock.now();
        if self.limits.is_expired(entry.cached_at, now) {
            self.store.delete(Collection::Images, url).await?;
            tracing::debug!(url = %url, cached_at = %entry.cached_at, "Expired cached image removed");
            return Ok(None);
        }

        self.store
            .touch(Collection::Images, url, now.max(entry.cached_at))
            .await?;

        Ok(Some(entry.blob))
    }

    /// Entry with its access metadata, without counting as a read.
    pub async fn get_entry(&self, url: &str) -> Option<CachedImage> {
        match self.store.get::<CachedImage>(url).await {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(url = %url, error = %e, "Failed to read cached image entry");
                None
            }
        }
    }

    /// Remove one image. Returns whether it was cached.
    pub async fn remove(&self, url: &str) -> Result<bool, StorageError> {
        let _guard = self.lock.lock().await;
        self.store.delete(Collection::Images, url).await
    }

    pub(crate) async fn clear(&self) -> Result<u64, StorageError> {
        let _guard = self.lock.lock().await;
        self.store.clear(Collection::Images).await
    }

    pub(crate) async fn purge_expired(&self) -> Result<u64, StorageError> {
        let _guard = self.lock.lock().await;
        let Some(cutoff) = self.limits.expiry_cutoff(self.clock.now()) else {
            return Ok(0);
        };
        self.store
            .delete_cached_before(Collection::Images, cutoff)
            .await
    }
}
