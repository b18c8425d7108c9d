use chrono::{DateTime, Utc};
use sqlx::query::Query;
use sqlx::sqlite::{Sqlite, SqliteArguments, SqliteRow};
use sqlx::{FromRow, Row};

use super::types::{ArticleKind, CachedArticle, CachedImage, OfflineRead};

// ============================================================================
// Collections
// ============================================================================

/// The independent record collections held by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
    Articles,
    Images,
    Reads,
}

impl Collection {
    /// Backing table name
    pub fn table(self) -> &'static str {
        match self {
            Collection::Articles => "cached_articles",
            Collection::Images => "cached_images",
            Collection::Reads => "offline_reads",
        }
    }

    /// Primary key column
    pub fn key_column(self) -> &'static str {
        match self {
            Collection::Articles => "id",
            Collection::Images => "url",
            Collection::Reads => "article_id",
        }
    }
}

// ============================================================================
// Record Trait
// ============================================================================

/// A value the store can persist in one of its collections.
///
/// Implementors decode themselves from a full row (`SELECT *`) and supply the
/// upsert statement that writes them back.
pub trait Record: for<'r> FromRow<'r, SqliteRow> + Send + Unpin {
    const COLLECTION: Collection;

    /// `INSERT ... ON CONFLICT DO UPDATE` with all columns bound.
    fn upsert(&self) -> Query<'_, Sqlite, SqliteArguments<'_>>;
}

pub(crate) fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn millis_column(row: &SqliteRow, column: &str) -> Result<DateTime<Utc>, sqlx::Error> {
    let ms: i64 = row.try_get(column)?;
    DateTime::from_timestamp_millis(ms).ok_or_else(|| sqlx::Error::ColumnDecode {
        index: column.to_string(),
        source: format!("timestamp out of range: {ms}").into(),
    })
}

fn kind_column(row: &SqliteRow, column: &str) -> Result<ArticleKind, sqlx::Error> {
    let raw: String = row.try_get(column)?;
    raw.parse().map_err(|e| sqlx::Error::ColumnDecode {
        index: column.to_string(),
        source: Box::new(e),
    })
}

fn count_column(row: &SqliteRow, column: &str) -> Result<u64, sqlx::Error> {
    let count: i64 = row.try_get(column)?;
    Ok(count.max(0) as u64)
}

// ============================================================================
// Articles
// ============================================================================

impl<'r> FromRow<'r, SqliteRow> for CachedArticle {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            kind: kind_column(row, "kind")?,
            payload: row.try_get("payload")?,
            cached_at: millis_column(row, "cached_at")?,
            last_accessed: millis_column(row, "last_accessed")?,
            access_count: count_column(row, "access_count")?,
        })
    }
}

impl Record for CachedArticle {
    const COLLECTION: Collection = Collection::Articles;

    fn upsert(&self) -> Query<'_, Sqlite, SqliteArguments<'_>> {
        sqlx::query(
            r#"
            INSERT INTO cached_articles (id, kind, payload, cached_at, last_accessed, access_count)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                kind = excluded.kind,
                payload = excluded.payload,
                cached_at = excluded.cached_at,
                last_accessed = excluded.last_accessed,
                access_count = excluded.access_count
        "#,
        )
        .bind(self.id.as_str())
        .bind(self.kind.as_str())
        .bind(self.payload.as_str())
        .bind(to_millis(self.cached_at))
        .bind(to_millis(self.last_accessed))
        .bind(self.access_count as i64)
    }
}

// ============================================================================
// Images
// ============================================================================

impl<'r> FromRow<'r, SqliteRow> for CachedImage {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            url: row.try_get("url")?,
            blob: row.try_get("blob")?,
            size: count_column(row, "size")?,
            cached_at: millis_column(row, "cached_at")?,
            last_accessed: millis_column(row, "last_accessed")?,
            access_count: count_column(row, "access_count")?,
        })
    }
}

impl Record for CachedImage {
    const COLLECTION: Collection = Collection::Images;

    fn upsert(&self) -> Query<'_, Sqlite, SqliteArguments<'_>> {
        sqlx::query(
            r#"
            INSERT INTO cached_images (url, blob, size, cached_at, last_accessed, access_count)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(url) DO UPDATE SET
                blob = excluded.blob,
                size = excluded.size,
                cached_at = excluded.cached_at,
                last_accessed = excluded.last_accessed,
                access_count = excluded.access_count
        "#,
        )
        .bind(self.url.as_str())
        .bind(self.blob.as_slice())
        .bind(self.size as i64)
        .bind(to_millis(self.cached_at))
        .bind(to_millis(self.last_accessed))
        .bind(self.access_count as i64)
    }
}

// ============================================================================
// Offline Reads
// ============================================================================

impl<'r> FromRow<'r, SqliteRow> for OfflineRead {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        let progress: Option<i64> = row.try_get("progress")?;
        Ok(Self {
            article_id: row.try_get("article_id")?,
            article_kind: kind_column(row, "article_kind")?,
            read_at: millis_column(row, "read_at")?,
            progress: progress.map(|p| p.clamp(0, 100) as u8),
        })
    }
}

impl Record for OfflineRead {
    const COLLECTION: Collection = Collection::Reads;

    fn upsert(&self) -> Query<'_, Sqlite, SqliteArguments<'_>> {
        sqlx::query(
            r#"
            INSERT INTO offline_reads (article_id, article_kind, read_at, progress)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(article_id) DO UPDATE SET
                article_kind = excluded.article_kind,
                read_at = excluded.read_at,
                progress = excluded.progress
        "#,
        )
        .bind(self.article_id.as_str())
        .bind(self.article_kind.as_str())
        .bind(to_millis(self.read_at))
        .bind(self.progress.map(i64::from))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collection_tables_are_distinct() {
        let tables: std::collections::HashSet<_> =
            [Collection::Articles, Collection::Images, Collection::Reads]
                .iter()
                .map(|c| c.table())
                .collect();
        assert_eq!(tables.len(), 3);
    }

    #[test]
    fn test_record_collections() {
        assert_eq!(CachedArticle::COLLECTION, Collection::Articles);
        assert_eq!(OfflineRead::COLLECTION, Collection::Reads);
        assert_eq!(CachedImage::COLLECTION.key_column(), "url");
    }

    #[test]
    fn test_millis_conversion_keeps_millisecond_precision() {
        let ts = DateTime::from_timestamp_millis(1_700_000_000_123).unwrap();
        assert_eq!(to_millis(ts), 1_700_000_000_123);
    }
}
