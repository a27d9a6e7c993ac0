//! Per-object sync bookkeeping and the `sync` gauges derived from it.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use tollgate_core::ObjectKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SyncStatus {
    Active,
    Error,
}

impl SyncStatus {
    pub const ALL: [SyncStatus; 2] = [SyncStatus::Active, SyncStatus::Error];

    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Active => "active",
            SyncStatus::Error => "error",
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tags {
    pub kind: String,
    pub status: SyncStatus,
}

/// Counts per `(kind, status)` at one report.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncReport {
    pub counts: BTreeMap<(String, SyncStatus), u64>,
    pub last_run: DateTime<Utc>,
}

impl SyncReport {
    pub fn count(&self, kind: &str, status: SyncStatus) -> u64 {
        self.counts.get(&(kind.to_string(), status)).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u64 { self.counts.values().sum() }
}

#[derive(Debug, Default)]
struct Entries {
    objects: FxHashMap<String, Tags>,
    known_kinds: FxHashSet<String>,
}

#[derive(Debug, Default)]
pub struct SyncMetricsCache {
    inner: Mutex<Entries>,
}

impl SyncMetricsCache {
    pub fn new() -> Self { Self::default() }

    /// `kind/namespace/name`; cluster-scoped objects have an empty namespace segment.
    pub fn key_for(key: &ObjectKey) -> String {
        format!("{}/{}/{}", key.gvk.kind, key.namespace.as_deref().unwrap_or(""), key.name)
    }

    pub fn add_object(&self, key: String, tags: Tags) { self.inner.lock().objects.insert(key, tags); }

    pub fn delete_object(&self, key: &str) { self.inner.lock().objects.remove(key); }

    pub fn get(&self, key: &str) -> Option<Tags> { self.inner.lock().objects.get(key).cloned() }

    pub fn has_object(&self, key: &str) -> bool { self.inner.lock().objects.contains_key(key) }

    pub fn len(&self) -> usize { self.inner.lock().objects.len() }

    pub fn is_empty(&self) -> bool { self.inner.lock().objects.is_empty() }

    pub fn add_kind(&self, kind: &str) {
        let mut inner = self.inner.lock();
        if !inner.known_kinds.contains(kind) {
            inner.known_kinds.insert(kind.to_string());
        }
    }

    /// Drop every object entry. Known kinds are kept so they keep reporting zero.
    pub fn reset_cache(&self) { self.inner.lock().objects.clear(); }

    pub fn report_sync(&self) -> SyncReport {
        let mut counts: BTreeMap<(String, SyncStatus), u64> = BTreeMap::new();
        {
            let inner = self.inner.lock();
            for kind in &inner.known_kinds {
                for status in SyncStatus::ALL {
                    counts.insert((kind.clone(), status), 0);
                }
            }
            for tags in inner.objects.values() {
                *counts.entry((tags.kind.clone(), tags.status)).or_insert(0) += 1;
            }
        }
        for ((kind, status), count) in &counts {
            metrics::gauge!("sync", *count as f64, "kind" => kind.clone(), "status" => status.as_str());
        }
        let last_run = Utc::now();
        metrics::gauge!("sync_last_run_time", last_run.timestamp() as f64);
        SyncReport { counts, last_run }
    }
}
