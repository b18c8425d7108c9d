//! The offline cache engine: articles, images and offline read tracking.
//!
//! [`OfflineCache`] owns one [`Store`] and hands out the three caches built on
//! it. Each access-tracked cache serializes its own "write, then sweep" and
//! "check expiry, then touch" sections behind a per-collection async mutex, so
//! overlapping calls can never push a collection past its cap.

mod articles;
mod images;
mod reads;

pub use articles::ArticleCache;
pub use images::ImageCache;
pub use reads::ReadTracker;

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;

use crate::clock::{Clock, SystemClock};
use crate::storage::{CacheStats, Collection, StorageError, Store};

/// Maximum number of cached articles
pub const MAX_CACHED_ARTICLES: u64 = 500;
/// Maximum number of cached images
pub const MAX_CACHED_IMAGES: u64 = 200;
/// Per-image size cap (5 MiB)
pub const MAX_IMAGE_SIZE: u64 = 5 * 1024 * 1024;
/// Budget for all cached image bytes together (100 MiB)
pub const MAX_TOTAL_IMAGE_BYTES: u64 = 100 * 1024 * 1024;
/// Entries older than this are dropped on their next read
pub const CACHE_EXPIRY_DAYS: i64 = 30;
/// Longest expiry a config may ask for (100 years)
pub const MAX_EXPIRY_DAYS: i64 = 36_500;

// ============================================================================
// Limits
// ============================================================================

/// Size and age bounds applied by the caches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheLimits {
    pub max_cached_articles: u64,
    pub max_cached_images: u64,
    pub max_image_size: u64,
    pub max_total_image_bytes: u64,
    pub expiry: Duration,
}

impl Default for CacheLimits {
    fn default() -> Self {
        Self {
            max_cached_articles: MAX_CACHED_ARTICLES,
            max_cached_images: MAX_CACHED_IMAGES,
            max_image_size: MAX_IMAGE_SIZE,
            max_total_image_bytes: MAX_TOTAL_IMAGE_BYTES,
            expiry: Duration::days(CACHE_EXPIRY_DAYS),
        }
    }
}

impl CacheLimits {
    /// True once `now` is past `cached_at + expiry`.
    ///
    /// A deadline beyond the representable range never expires.
    pub fn is_expired(&self, cached_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        cached_at
            .checked_add_signed(self.expiry)
            .is_some_and(|deadline| now > deadline)
    }

    /// Entries cached strictly before this instant are expired at `now`.
    ///
    /// `None` when the cutoff falls before the representable range, i.e. nothing
    /// can be expired yet.
    pub fn expiry_cutoff(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        now.checked_sub_signed(self.expiry)
    }
}

/// Delete the least recently accessed records until at most `max` remain.
///
/// Callers hold the collection's lock. Returns the number evicted.
async fn evict_overflow(
    store: &Store,
    collection: Collection,
    max: u64,
) -> Result<u64, StorageError> {
    let count = store.count(collection).await?;
    if count <= max {
        return Ok(0);
    }

    let victims = store
        .least_recently_accessed(collection, count - max)
        .await?;
    let evicted = store.delete_many(collection, &victims).await?;
    tracing::debug!(
        collection = collection.table(),
        count,
        max,
        evicted,
        "Evicted least recently used entries"
    );
    Ok(evicted)
}

// ============================================================================
// Offline Cache
// ============================================================================

/// Owned context for the whole cache engine.
///
/// Create once at startup and share the caches (they are cheap `Clone` handles).
pub struct OfflineCache {
    store: Arc<Store>,
    articles: ArticleCache,
    images: ImageCache,
    reads: ReadTracker,
}

impl OfflineCache {
    pub fn new(store: Store, limits: CacheLimits, clock: Arc<dyn Clock>) -> Self {
        let store = Arc::new(store);
        Self {
            articles: ArticleCache::new(Arc::clone(&store), limits, Arc::clone(&clock)),
            images: ImageCache::new(Arc::clone(&store), limits, Arc::clone(&clock)),
            reads: ReadTracker::new(Arc::clone(&store), clock),
            store,
        }
    }

    /// Open the database at `path` eagerly, using wall-clock time.
    ///
    /// Surfaces lock and migration failures at startup instead of on first use.
    pub async fn open(path: &str, limits: CacheLimits) -> Result<Self, StorageError> {
        let store = Store::new(path);
        store.open().await?;
        Ok(Self::new(store, limits, Arc::new(SystemClock)))
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn articles(&self) -> &ArticleCache {
        &self.articles
    }

    pub fn images(&self) -> &ImageCache {
        &self.images
    }

    pub fn reads(&self) -> &ReadTracker {
        &self.reads
    }

    /// Aggregate counts, image bytes and the oldest entry date.
    ///
    /// Never fails: a storage error is logged and reported as an empty cache.
    pub async fn cache_stats(&self) -> CacheStats {
        match self.collect_stats().await {
            Ok(stats) => stats,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to compute cache stats");
                CacheStats::default()
            }
        }
    }

    async fn collect_stats(&self) -> Result<CacheStats, StorageError> {
        let (article_count, image_count, total_cache_size, oldest_article, oldest_image) =
            futures::try_join!(
                self.store.count(Collection::Articles),
                self.store.count(Collection::Images),
                self.store.total_image_bytes(),
                self.store.oldest_cached_at(Collection::Articles),
                self.store.oldest_cached_at(Collection::Images),
            )?;

        let oldest_cache_date = match (oldest_article, oldest_image) {
            (Some(a), Some(i)) => Some(a.min(i)),
            (a, i) => a.or(i),
        };

        Ok(CacheStats {
            article_count,
            image_count,
            total_cache_size,
            oldest_cache_date,
        })
    }

    /// Empty all three collections.
    pub async fn clear_cache(&self) -> Result<(), StorageError> {
        let (articles, images, reads) =
            futures::try_join!(self.articles.clear(), self.images.clear(), self.reads.clear())?;
        tracing::info!(articles, images, reads, "Cleared offline cache");
        Ok(())
    }

    /// Delete every expired article and image now rather than on next read.
    ///
    /// Returns the number of entries removed.
    pub async fn purge_expired(&self) -> Result<u64, StorageError> {
        let (articles, images) =
            futures::try_join!(self.articles.purge_expired(), self.images.purge_expired())?;
        tracing::info!(articles, images, "Purged expired cache entries");
        Ok(articles + images)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::storage::ArticleKind;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    fn test_cache(clock: Arc<ManualClock>) -> OfflineCache {
        OfflineCache::new(Store::in_memory(), CacheLimits::default(), clock)
    }

    #[test]
    fn test_default_limits() {
        let limits = CacheLimits::default();
        assert_eq!(limits.max_cached_articles, 500);
        assert_eq!(limits.max_cached_images, 200);
        assert_eq!(limits.max_image_size, 5 * 1024 * 1024);
        assert_eq!(limits.expiry, Duration::days(30));
    }

    #[test]
    fn test_expiry_boundary() {
        let limits = CacheLimits::default();
        let t0 = start();
        assert!(!limits.is_expired(t0, t0 + Duration::days(30)));
        assert!(limits.is_expired(t0, t0 + Duration::days(30) + Duration::milliseconds(1)));
    }

    #[test]
    fn test_huge_expiry_never_overflows() {
        let limits = CacheLimits {
            expiry: Duration::days(1_000_000_000),
            ..CacheLimits::default()
        };
        let t0 = start();
        assert!(!limits.is_expired(t0, t0 + Duration::days(365)));
        assert!(limits.expiry_cutoff(t0).is_none());
        assert_eq!(
            CacheLimits::default().expiry_cutoff(t0),
            Some(t0 - Duration::days(30))
        );
    }

    #[tokio::test]
    async fn test_huge_expiry_reads_and_purges_without_panicking() {
        let clock = Arc::new(ManualClock::new(start()));
        let limits = CacheLimits {
            expiry: Duration::days(1_000_000_000),
            ..CacheLimits::default()
        };
        let cache = OfflineCache::new(Store::in_memory(), limits, clock.clone());
        cache
            .articles()
            .cache_article("a1", ArticleKind::Blog, &serde_json::json!({"title": "A"}))
            .await
            .unwrap();
        clock.advance(Duration::days(400));

        let hit: Option<serde_json::Value> = cache
            .articles()
            .get_cached_article("a1", ArticleKind::Blog)
            .await;
        assert!(hit.is_some());
        assert_eq!(cache.purge_expired().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_stats_on_empty_cache() {
        let cache = test_cache(Arc::new(ManualClock::new(start())));
        assert_eq!(cache.cache_stats().await, CacheStats::default());
    }

    #[tokio::test]
    async fn test_stats_aggregate_both_collections() {
        let clock = Arc::new(ManualClock::new(start()));
        let cache = test_cache(Arc::clone(&clock));

        cache
            .images()
            .cache_image("https://example.com/a.png", vec![0u8; 100])
            .await
            .unwrap();
        clock.advance(Duration::hours(1));
        cache
            .articles()
            .cache_article("a1", ArticleKind::Blog, &serde_json::json!({"title": "A"}))
            .await
            .unwrap();
        cache
            .images()
            .cache_image("https://example.com/b.png", vec![0u8; 50])
            .await
            .unwrap();

        assert_eq!(
            cache.cache_stats().await,
            CacheStats {
                article_count: 1,
                image_count: 2,
                total_cache_size: 150,
                oldest_cache_date: Some(start()),
            }
        );
    }

    #[tokio::test]
    async fn test_clear_then_stats_is_empty() {
        let cache = test_cache(Arc::new(ManualClock::new(start())));
        cache
            .articles()
            .cache_article("a1", ArticleKind::Wiki, &serde_json::json!({}))
            .await
            .unwrap();
        cache
            .images()
            .cache_image("https://example.com/a.png", vec![1, 2, 3])
            .await
            .unwrap();
        cache
            .reads()
            .track_offline_read("a1", ArticleKind::Wiki, Some(20))
            .await
            .unwrap();

        cache.clear_cache().await.unwrap();

        assert_eq!(cache.cache_stats().await, CacheStats::default());
        assert!(cache.reads().get_offline_reads().await.is_empty());
    }

    #[tokio::test]
    async fn test_purge_expired_removes_only_old_entries() {
        let clock = Arc::new(ManualClock::new(start()));
        let cache = test_cache(Arc::clone(&clock));

        cache
            .articles()
            .cache_article("old", ArticleKind::Blog, &serde_json::json!({}))
            .await
            .unwrap();
        cache
            .images()
            .cache_image("https://example.com/old.png", vec![0; 10])
            .await
            .unwrap();
        clock.advance(Duration::days(20));
        cache
            .articles()
            .cache_article("fresh", ArticleKind::Blog, &serde_json::json!({}))
            .await
            .unwrap();
        clock.advance(Duration::days(11));

        assert_eq!(cache.purge_expired().await.unwrap(), 2);

        let stats = cache.cache_stats().await;
        assert_eq!(stats.article_count, 1);
        assert_eq!(stats.image_count, 0);
        assert!(cache.articles().get_entry("fresh").await.is_some());
    }
}
