//! Tollgate cache manager.
//!
//! Sources register the GVKs they need through [`CacheManager::add_source`]; a background loop
//! ([`CacheManager::start`]) keeps the watched set equal to the union of those GVKs, wipes and
//! replays the backing store when kinds go away or the namespace excluder changes, and retries
//! failed listings with backoff. Live objects flow in through [`CacheManager::add_object`] and
//! [`CacheManager::remove_object`].

#![forbid(unsafe_code)]

mod config;
mod error;
mod manager;
mod reconcile;
mod replay;
mod spec;
mod sync_metrics;

pub use config::{CacheManagerConfig, Settings};
pub use error::{CacheError, Result};
pub use manager::CacheManager;
pub use reconcile::CycleReport;
pub use replay::BackoffPolicy;
pub use sync_metrics::{SyncMetricsCache, SyncReport, SyncStatus, Tags};
