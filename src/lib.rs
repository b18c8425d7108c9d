//! Offline content cache for a reading application.
//!
//! Keeps previously viewed articles (blog posts and wiki pages) and their
//! images readable without a network connection, within fixed count, size and
//! age bounds, and coordinates sync state across online/offline transitions.
//!
//! - [`storage`]: SQLite-backed key-value store with one table per collection
//! - [`cache`]: article cache, image cache, offline read tracker and the
//!   [`OfflineCache`](cache::OfflineCache) context that owns them
//! - [`sync`]: connectivity signal and the [`SyncCoordinator`](sync::SyncCoordinator)
//! - [`clock`]: injectable time source
//! - [`config`]: TOML configuration

pub mod cache;
pub mod clock;
pub mod config;
pub mod storage;
pub mod sync;
