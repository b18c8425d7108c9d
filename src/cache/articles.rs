use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;

use super::{evict_overflow, CacheLimits};
use crate::clock::Clock;
use crate::storage::{ArticleKind, CachedArticle, Collection, StorageError, Store};

/// Whole content records (blog posts and wiki articles) keyed by content id.
#[derive(Clone)]
pub struct ArticleCache {
    store: Arc<Store>,
    limits: CacheLimits,
    clock: Arc<dyn Clock>,
    lock: Arc<Mutex<()>>,
}

impl ArticleCache {
    pub fn new(store: Arc<Store>, limits: CacheLimits, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            limits,
            clock,
            lock: Arc::new(Mutex::new(())),
        }
    }

    /// Cache an article, replacing any entry with the same id.
    ///
    /// Resets the access metadata, then evicts the least recently used entries
    /// if the cache is over its cap. An eviction failure is logged and does not
    /// undo the write.
    ///
    /// # Errors
    ///
    /// Returns the storage error if the article itself could not be written.
    pub async fn cache_article<A>(
        &self,
        id: &str,
        kind: ArticleKind,
        article: &A,
    ) -> Result<(), StorageError>
    where
        A: Serialize + ?Sized,
    {
        let payload = serde_json::to_string(article)?;
        let now = self.clock.now();
        let entry = CachedArticle {
            id: id.to_string(),
            kind,
            payload,
            cached_at: now,
            last_accessed: now,
            access_count: 0,
        };

        let _guard = self.lock.lock().await;

        if let Err(e) = self.store.put(&entry).await {
            tracing::error!(id = %id, kind = %kind, error = %e, "Failed to cache article");
            return Err(e);
        }
        tracing::debug!(id = %id, kind = %kind, "Cached article");

        if let Err(e) =
            evict_overflow(&self.store, Collection::Articles, self.limits.max_cached_articles).await
        {
            tracing::warn!(error = %e, "Article eviction sweep failed");
        }

        Ok(())
    }

    /// Read a cached article.
    ///
    /// Returns `None` when the id is absent, cached under another kind, expired
    /// (the entry is deleted), or undecodable as `A`. Only a hit updates the
    /// entry's access time and count. Storage failures are logged and reported
    /// as a miss.
    pub async fn get_cached_article<A>(&self, id: &str, kind: ArticleKind) -> Option<A>
    where
        A: DeserializeOwned,
    {
        match self.lookup(id, kind).await {
            Ok(article) => article,
            Err(e) => {
                tracing::warn!(id = %id, error = %e, "Failed to read cached article");
                None
            }
        }
    }

    async fn lookup<A>(&self, id: &str, kind: ArticleKind) -> Result<Option<A>, StorageError>
    where
        A: DeserializeOwned,
    {
        let _guard = self.lock.lock().await;

        let Some(entry) = self.store.get::<CachedArticle>(id).await? else {
            return Ok(None);
        };

        if entry.kind != kind {
            tracing::debug!(id = %id, cached = %entry.kind, requested = %kind, "Cached article kind mismatch");
            return Ok(None);
        }

        let now = self.clock.now();
        if self.limits.is_expired(entry.cached_at, now) {
            self.store.delete(Collection::Articles, id).await?;
            tracing::debug!(id = %id, cached_at = %entry.cached_at, "Expired cached article removed");
            return Ok(None);
        }

        let article = match serde_json::from_str(&entry.payload) {
            Ok(article) => article,
            Err(e) => {
                tracing::warn!(id = %id, kind = %kind, error = %e, "Cached article payload did not decode");
                return Ok(None);
            }
        };

        // Keep last_accessed >= cached_at even if the clock stepped backwards.
        self.store
            .touch(Collection::Articles, id, now.max(entry.cached_at))
            .await?;

        Ok(Some(article))
    }

    /// Entry with its access metadata, without counting as a read.
    pub async fn get_entry(&self, id: &str) -> Option<CachedArticle> {
        match self.store.get::<CachedArticle>(id).await {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(id = %id, error = %e, "Failed to read cached article entry");
                None
            }
        }
    }

    /// Remove one article. Returns whether it was cached.
    pub async fn remove(&self, id: &str) -> Result<bool, StorageError> {
        let _guard = self.lock.lock().await;
        self.store.delete(Collection::Articles, id).await
    }

    pub(crate) async fn clear(&self) -> Result<u64, StorageError> {
        let _guard = self.lock.lock().await;
        self.store.clear(Collection::Articles).await
    }

    pub(crate) async fn purge_expired(&self) -> Result<u64, StorageError> {
        let _guard = self.lock.lock().await;
        let Some(cutoff) = self.limits.expiry_cutoff(self.clock.now()) else {
            return Ok(0);
        };
        self.store
            .delete_cached_before(Collection::Articles, cutoff)
            .await
    }
}
