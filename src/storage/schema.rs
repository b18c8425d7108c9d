use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    QueryBuilder, SqlitePool,
};
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::OnceCell;

use super::records::{to_millis, Collection, Record};
use super::types::StorageError;

/// Path that selects a private in-memory database
pub(crate) const IN_MEMORY: &str = ":memory:";

/// SQLite's default bind-parameter ceiling is 999; stay well under it.
const DELETE_CHUNK_SIZE: usize = 500;

// ============================================================================
// Store
// ============================================================================

/// Asynchronous key-value store over SQLite with one table per collection.
///
/// Construction is free. The pool is created by the first call that needs it
/// and reused by every call after that; concurrent first callers wait on the
/// same initialization instead of each opening the database.
#[derive(Debug)]
pub struct Store {
    path: String,
    pool: OnceCell<SqlitePool>,
}

impl Store {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            pool: OnceCell::new(),
        }
    }

    /// A store backed by a private in-memory database.
    pub fn in_memory() -> Self {
        Self::new(IN_MEMORY)
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Open the database (once) and return the live pool.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Unavailable` if the file is locked or cannot be
    /// opened, `StorageError::Migration` if schema creation fails.
    pub async fn open(&self) -> Result<&SqlitePool, StorageError> {
        self.pool.get_or_try_init(|| connect(&self.path)).await
    }

    // ========================================================================
    // Generic Record Operations
    // ========================================================================

    /// Fetch one record by primary key.
    pub async fn get<R: Record>(&self, key: &str) -> Result<Option<R>, StorageError> {
        let pool = self.open().await?;
        let collection = R::COLLECTION;
        let sql = format!(
            "SELECT * FROM {} WHERE {} = ?",
            collection.table(),
            collection.key_column()
        );
        let record = sqlx::query_as::<_, R>(&sql)
            .bind(key)
            .fetch_optional(pool)
            .await?;
        Ok(record)
    }

    /// Insert or replace a record.
    pub async fn put<R: Record>(&self, record: &R) -> Result<(), StorageError> {
        let pool = self.open().await?;
        record.upsert().execute(pool).await?;
        Ok(())
    }

    /// Delete one record. Returns whether a row was removed.
    pub async fn delete(&self, collection: Collection, key: &str) -> Result<bool, StorageError> {
        let pool = self.open().await?;
        let sql = format!(
            "DELETE FROM {} WHERE {} = ?",
            collection.table(),
            collection.key_column()
        );
        let result = sqlx::query(&sql).bind(key).execute(pool).await?;
        Ok(result.rows_affected() > 0)
    }

    /// Fetch every record in the record type's collection, in no particular order.
    pub async fn get_all<R: Record>(&self) -> Result<Vec<R>, StorageError> {
        let pool = self.open().await?;
        let sql = format!("SELECT * FROM {}", R::COLLECTION.table());
        let records = sqlx::query_as::<_, R>(&sql).fetch_all(pool).await?;
        Ok(records)
    }

    /// Remove every record from a collection. Returns the number removed.
    pub async fn clear(&self, collection: Collection) -> Result<u64, StorageError> {
        let pool = self.open().await?;
        let sql = format!("DELETE FROM {}", collection.table());
        let result = sqlx::query(&sql).execute(pool).await?;
        Ok(result.rows_affected())
    }

    /// Delete a batch of records inside one transaction.
    ///
    /// Chunks at 500 keys per statement to stay under SQLite's bind-parameter limit.
    pub async fn delete_many(
        &self,
        collection: Collection,
        keys: &[String],
    ) -> Result<u64, StorageError> {
        if keys.is_empty() {
            return Ok(0);
        }

        let pool = self.open().await?;
        let mut tx = pool.begin().await?;
        let mut removed = 0;

        for chunk in keys.chunks(DELETE_CHUNK_SIZE) {
            let mut builder: QueryBuilder<sqlx::Sqlite> = QueryBuilder::new(format!(
                "DELETE FROM {} WHERE {} IN (",
                collection.table(),
                collection.key_column()
            ));

            let mut separated = builder.separated(", ");
            for key in chunk {
                separated.push_bind(key.as_str());
            }
            separated.push_unseparated(")");

            removed += builder.build().execute(&mut *tx).await?.rows_affected();
        }

        tx.commit().await?;
        Ok(removed)
    }

    // ========================================================================
    // Aggregates and Access Tracking
    // ========================================================================
    //
    // These apply to the access-tracked collections (articles, images).

    /// Number of records in a collection.
    pub async fn count(&self, collection: Collection) -> Result<u64, StorageError> {
        let pool = self.open().await?;
        let sql = format!("SELECT COUNT(*) FROM {}", collection.table());
        let row: (i64,) = sqlx::query_as(&sql).fetch_one(pool).await?;
        Ok(row.0.max(0) as u64)
    }

    /// Keys of the `limit` least recently accessed records, oldest first.
    ///
    /// Walks the `last_accessed` index; ties fall back to insertion order.
    pub async fn least_recently_accessed(
        &self,
        collection: Collection,
        limit: u64,
    ) -> Result<Vec<String>, StorageError> {
        let pool = self.open().await?;
        let sql = format!(
            "SELECT {} FROM {} ORDER BY last_accessed ASC, rowid ASC LIMIT ?",
            collection.key_column(),
            collection.table()
        );
        let rows: Vec<(String,)> = sqlx::query_as(&sql)
            .bind(limit.min(i64::MAX as u64) as i64)
            .fetch_all(pool)
            .await?;
        Ok(rows.into_iter().map(|(key,)| key).collect())
    }

    /// Record a read: bump `access_count` and set `last_accessed`.
    ///
    /// Only touches an existing row; a record evicted in the meantime stays gone.
    pub async fn touch(
        &self,
        collection: Collection,
        key: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        let pool = self.open().await?;
        let sql = format!(
            "UPDATE {} SET last_accessed = ?, access_count = access_count + 1 WHERE {} = ?",
            collection.table(),
            collection.key_column()
        );
        let result = sqlx::query(&sql)
            .bind(to_millis(at))
            .bind(key)
            .execute(pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Earliest `cached_at` in a collection, if it holds anything.
    pub async fn oldest_cached_at(
        &self,
        collection: Collection,
    ) -> Result<Option<DateTime<Utc>>, StorageError> {
        let pool = self.open().await?;
        let sql = format!("SELECT MIN(cached_at) FROM {}", collection.table());
        let row: (Option<i64>,) = sqlx::query_as(&sql).fetch_one(pool).await?;
        Ok(row.0.and_then(DateTime::from_timestamp_millis))
    }

    /// Delete every record cached strictly before `cutoff`.
    pub async fn delete_cached_before(
        &self,
        collection: Collection,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, StorageError> {
        let pool = self.open().await?;
        let sql = format!("DELETE FROM {} WHERE cached_at < ?", collection.table());
        let result = sqlx::query(&sql)
            .bind(to_millis(cutoff))
            .execute(pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Total bytes held by cached images.
    pub async fn total_image_bytes(&self) -> Result<u64, StorageError> {
        let pool = self.open().await?;
        let row: (i64,) = sqlx::query_as("SELECT COALESCE(SUM(size), 0) FROM cached_images")
            .fetch_one(pool)
            .await?;
        Ok(row.0.max(0) as u64)
    }

    /// `(url, size)` for every image, least recently accessed first.
    pub async fn image_sizes_by_access(&self) -> Result<Vec<(String, u64)>, StorageError> {
        let pool = self.open().await?;
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT url, size FROM cached_images ORDER BY last_accessed ASC, rowid ASC",
        )
        .fetch_all(pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(url, size)| (url, size.max(0) as u64))
            .collect())
    }
}

// ============================================================================
// Connection and Migration
// ============================================================================

async fn connect(path: &str) -> Result<SqlitePool, StorageError> {
    let in_memory = path == IN_MEMORY;
    let url = if in_memory {
        "sqlite::memory:".to_string()
    } else {
        format!("sqlite:{}?mode=rwc", path)
    };

    // Cached content is private to the user: create the file owner-only.
    #[cfg(unix)]
    if !in_memory {
        use std::os::unix::fs::OpenOptionsExt;
        let db_path = std::path::Path::new(path);
        if !db_path.exists() {
            // If creation fails, SQLite reports the error at connect_with.
            let _file = std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .mode(0o600)
                .open(db_path)
                .ok();
        }
    }

    // busy_timeout=5000: wait up to 5 seconds for locks before SQLITE_BUSY.
    let options = SqliteConnectOptions::from_str(&url)
        .map_err(StorageError::from_sqlx)?
        .pragma("busy_timeout", "5000");

    // An in-memory database lives only as long as its connections, so keep a
    // single one open for the life of the pool.
    let pool_options = if in_memory {
        SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
    } else {
        SqlitePoolOptions::new().max_connections(5)
    };

    let pool = pool_options
        .acquire_timeout(Duration::from_secs(10))
        .connect_with(options)
        .await
        .map_err(StorageError::from_sqlx)?;

    migrate(&pool).await.map_err(|e| match StorageError::from_sqlx(e) {
        StorageError::Database(inner) => StorageError::Migration(inner.to_string()),
        other => other,
    })?;

    tracing::debug!(path = %path, "Opened offline cache database");
    Ok(pool)
}

/// Create all collections and their indexes in one transaction.
///
/// Every statement uses `IF NOT EXISTS`, so reopening an existing database is a no-op.
async fn migrate(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS cached_articles (
            id TEXT PRIMARY KEY,
            kind TEXT NOT NULL,
            payload TEXT NOT NULL,
            cached_at INTEGER NOT NULL,
            last_accessed INTEGER NOT NULL,
            access_count INTEGER NOT NULL DEFAULT 0
        )
    "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS cached_images (
            url TEXT PRIMARY KEY,
            blob BLOB NOT NULL,
            size INTEGER NOT NULL,
            cached_at INTEGER NOT NULL,
            last_accessed INTEGER NOT NULL,
            access_count INTEGER NOT NULL DEFAULT 0
        )
    "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS offline_reads (
            article_id TEXT PRIMARY KEY,
            article_kind TEXT NOT NULL,
            read_at INTEGER NOT NULL,
            progress INTEGER
        )
    "#,
    )
    .execute(&mut *tx)
    .await?;

    // LRU eviction walks these in ascending order
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_cached_articles_last_accessed ON cached_articles(last_accessed)",
    )
    .execute(&mut *tx)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_cached_images_last_accessed ON cached_images(last_accessed)",
    )
    .execute(&mut *tx)
    .await?;

    // Expiry purges and oldest-entry stats
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_cached_articles_cached_at ON cached_articles(cached_at)",
    )
    .execute(&mut *tx)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_cached_images_cached_at ON cached_images(cached_at)",
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_offline_reads_read_at ON offline_reads(read_at DESC)")
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok(())
}
