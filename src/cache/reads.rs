use std::sync::Arc;

use crate::clock::Clock;
use crate::storage::{ArticleKind, Collection, OfflineRead, StorageError, Store};

/// Records which articles were read while offline, for later reconciliation.
///
/// One record per article; a later read overwrites the earlier one. Records are
/// never evicted and do not require the article to still be cached.
#[derive(Clone)]
pub struct ReadTracker {
    store: Arc<Store>,
    clock: Arc<dyn Clock>,
}

impl ReadTracker {
    pub fn new(store: Arc<Store>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Record a read of `article_id` at the current time.
    ///
    /// `progress` is a percentage; values above 100 are clamped.
    pub async fn track_offline_read(
        &self,
        article_id: &str,
        kind: ArticleKind,
        progress: Option<u8>,
    ) -> Result<(), StorageError> {
        let read = OfflineRead {
            article_id: article_id.to_string(),
            article_kind: kind,
            read_at: self.clock.now(),
            progress: progress.map(|p| p.min(100)),
        };

        self.store.put(&read).await.inspect_err(|e| {
            tracing::error!(article_id = %article_id, error = %e, "Failed to track offline read");
        })?;
        tracing::debug!(article_id = %article_id, kind = %kind, progress = ?read.progress, "Tracked offline read");
        Ok(())
    }

    /// All offline reads, most recent first. Empty on storage failure.
    pub async fn get_offline_reads(&self) -> Vec<OfflineRead> {
        match self.store.get_all::<OfflineRead>().await {
            Ok(mut reads) => {
                reads.sort_by(|a, b| b.read_at.cmp(&a.read_at));
                reads
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to load offline reads");
                Vec::new()
            }
        }
    }

    pub(crate) async fn clear(&self) -> Result<u64, StorageError> {
        self.store.clear(Collection::Reads).await
    }
}
