use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Errors raised by the persistent store.
///
/// Read paths in the cache layer swallow these (a miss is always an acceptable
/// fallback); write paths hand them back to the caller.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The database file is locked by another process or cannot be opened
    #[error("Cache database is unavailable: {0}")]
    Unavailable(String),

    /// The disk (or the database's page limit) is full
    #[error("Cache storage quota exceeded: {0}")]
    QuotaExceeded(String),

    /// Schema creation failed on first open
    #[error("Cache database migration failed: {0}")]
    Migration(String),

    /// A payload could not be encoded for storage
    #[error("Failed to serialize cached record: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Any other database error
    #[error("Database error: {0}")]
    Database(#[source] sqlx::Error),
}

impl StorageError {
    /// Classify a sqlx error by the SQLite condition it reports.
    pub(crate) fn from_sqlx(err: sqlx::Error) -> Self {
        let error_string = err.to_string().to_lowercase();

        // SQLITE_BUSY (5), SQLITE_LOCKED (6), SQLITE_CANTOPEN (14)
        if error_string.contains("database is locked")
            || error_string.contains("database table is locked")
            || error_string.contains("unable to open database file")
        {
            return StorageError::Unavailable(err.to_string());
        }

        // SQLITE_FULL (13)
        if error_string.contains("database or disk is full") {
            return StorageError::QuotaExceeded(err.to_string());
        }

        StorageError::Database(err)
    }
}

impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        Self::from_sqlx(err)
    }
}

/// An image was larger than the per-item cap and was not cached.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("Image too large to cache: {size} bytes (limit {limit} bytes)")]
pub struct OversizedImage {
    pub size: u64,
    pub limit: u64,
}

/// A stored kind tag did not match any known article kind.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("Unknown article kind: {0}")]
pub struct UnknownArticleKind(pub String);

// ============================================================================
// Data Structures
// ============================================================================

/// The two content shapes the cache stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArticleKind {
    Blog,
    Wiki,
}

impl ArticleKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ArticleKind::Blog => "blog",
            ArticleKind::Wiki => "wiki",
        }
    }
}

impl fmt::Display for ArticleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ArticleKind {
    type Err = UnknownArticleKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "blog" => Ok(ArticleKind::Blog),
            "wiki" => Ok(ArticleKind::Wiki),
            other => Err(UnknownArticleKind(other.to_string())),
        }
    }
}

/// A cached content record.
///
/// `payload` holds the caller's record as JSON text; the cache never looks
/// inside it.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedArticle {
    pub id: String,
    pub kind: ArticleKind,
    pub payload: String,
    pub cached_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    pub access_count: u64,
}

/// A cached image blob keyed by its source URL.
#[derive(Clone, PartialEq)]
pub struct CachedImage {
    pub url: String,
    pub blob: Vec<u8>,
    /// Always `blob.len()`, stored separately for cheap aggregation
    pub size: u64,
    pub cached_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    pub access_count: u64,
}

/// Blob bytes are left out of Debug output; images run to megabytes.
impl fmt::Debug for CachedImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachedImage")
            .field("url", &self.url)
            .field("size", &self.size)
            .field("cached_at", &self.cached_at)
            .field("last_accessed", &self.last_accessed)
            .field("access_count", &self.access_count)
            .finish()
    }
}

/// One record per article read while offline. Last write wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OfflineRead {
    pub article_id: String,
    pub article_kind: ArticleKind,
    pub read_at: DateTime<Utc>,
    /// Reading progress as a percentage (0..=100)
    pub progress: Option<u8>,
}

/// Aggregate cache figures for diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub article_count: u64,
    pub image_count: u64,
    /// Bytes held by cached images (article payloads are not counted)
    pub total_cache_size: u64,
    pub oldest_cache_date: Option<DateTime<Utc>>,
}
