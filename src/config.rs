//! Configuration file parser for ~/.config/offline-cache/config.toml.
//!
//! The config file is optional: a missing file yields `Config::default()`.
//! Unknown keys are accepted by serde but logged as warnings, since they are
//! usually typos.
use chrono::Duration;
use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

use crate::cache::{
    CacheLimits, CACHE_EXPIRY_DAYS, MAX_CACHED_ARTICLES, MAX_CACHED_IMAGES, MAX_EXPIRY_DAYS,
    MAX_IMAGE_SIZE, MAX_TOTAL_IMAGE_BYTES,
};

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// Config file exceeds the maximum allowed size.
    #[error("Config file too large: {0}")]
    TooLarge(String),

    /// A value parsed but cannot be used (e.g. a zero cap).
    #[error("Invalid config value: {0}")]
    Invalid(String),
}

// ============================================================================
// Configuration Structs
// ============================================================================

/// Top-level configuration.
///
/// All fields use `#[serde(default)]` so any subset of keys can be specified.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Database file. `None` means `cache.db` next to the config file.
    pub database_path: Option<String>,

    /// Maximum number of cached articles.
    pub max_cached_articles: u64,

    /// Maximum number of cached images.
    pub max_cached_images: u64,

    /// Largest single image that will be cached, in bytes.
    pub max_image_size_bytes: u64,

    /// Budget for all cached image bytes together.
    pub max_total_image_bytes: u64,

    /// Days after which a cached entry is dropped on its next read.
    pub expiry_days: i64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: None,
            max_cached_articles: MAX_CACHED_ARTICLES,
            max_cached_images: MAX_CACHED_IMAGES,
            max_image_size_bytes: MAX_IMAGE_SIZE,
            max_total_image_bytes: MAX_TOTAL_IMAGE_BYTES,
            expiry_days: CACHE_EXPIRY_DAYS,
        }
    }
}

impl Config {
    /// Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    const KNOWN_KEYS: [&'static str; 6] = [
        "database_path",
        "max_cached_articles",
        "max_cached_images",
        "max_image_size_bytes",
        "max_total_image_bytes",
        "expiry_days",
    ];

    /// Load configuration from a TOML file.
    ///
    /// - Missing file → `Ok(Config::default())`
    /// - Empty file → `Ok(Config::default())`
    /// - Invalid TOML → `Err(ConfigError::Parse)` with line number info
    /// - Unknown keys → accepted, logged as warning
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        // Check size before reading so a huge or corrupted file is never slurped.
        match std::fs::metadata(path) {
            Ok(meta) if meta.len() > Self::MAX_FILE_SIZE => {
                return Err(ConfigError::TooLarge(format!(
                    "Config file is {} bytes (max {} bytes)",
                    meta.len(),
                    Self::MAX_FILE_SIZE
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
            Ok(_) => {}
        }

        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // Deleted between metadata and read
                tracing::debug!(path = %path.display(), "Config file disappeared, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };

        if content.trim().is_empty() {
            tracing::debug!(path = %path.display(), "Config file is empty, using defaults");
            return Ok(Self::default());
        }

        if let Ok(raw) = content.parse::<toml::Table>() {
            for key in raw.keys() {
                if !Self::KNOWN_KEYS.contains(&key.as_str()) {
                    tracing::warn!(key = %key, "Unknown key in config file, ignoring");
                }
            }
        }

        let config: Config = toml::from_str(&content)?;
        tracing::info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    /// Validated cache limits.
    pub fn limits(&self) -> Result<CacheLimits, ConfigError> {
        let positive = [
            ("max_cached_articles", self.max_cached_articles),
            ("max_cached_images", self.max_cached_images),
            ("max_image_size_bytes", self.max_image_size_bytes),
            ("max_total_image_bytes", self.max_total_image_bytes),
        ];
        for (key, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{key} must be greater than 0")));
            }
        }
        if !(1..=MAX_EXPIRY_DAYS).contains(&self.expiry_days) {
            return Err(ConfigError::Invalid(format!(
                "expiry_days must be between 1 and {MAX_EXPIRY_DAYS}"
            )));
        }
        let expiry = Duration::try_days(self.expiry_days).ok_or_else(|| {
            ConfigError::Invalid(format!("expiry_days out of range: {}", self.expiry_days))
        })?;
        if self.max_image_size_bytes > self.max_total_image_bytes {
            tracing::warn!(
                max_image_size_bytes = self.max_image_size_bytes,
                max_total_image_bytes = self.max_total_image_bytes,
                "Single-image cap exceeds the total image budget"
            );
        }

        Ok(CacheLimits {
            max_cached_articles: self.max_cached_articles,
            max_cached_images: self.max_cached_images,
            max_image_size: self.max_image_size_bytes,
            max_total_image_bytes: self.max_total_image_bytes,
            expiry,
        })
    }
}

// ============================================================================
// Tests
// ============================================================================
