//! Persistent key-value storage for the offline cache.
//!
//! A single SQLite database holds three independent collections: cached
//! articles, cached images and offline read records.

mod records;
mod schema;
mod types;

pub use records::{Collection, Record};
pub use schema::Store;
pub use types::{
    ArticleKind, CacheStats, CachedArticle, CachedImage, OfflineRead, OversizedImage,
    StorageError, UnknownArticleKind,
};
