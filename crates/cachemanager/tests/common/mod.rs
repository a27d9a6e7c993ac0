#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use parking_lot::Mutex;
use tollgate_cachemanager::{BackoffPolicy, CacheManager, CacheManagerConfig, Settings};
use tollgate_core::{
    DataStore, Excluder, Expectations, Gvk, Object, ObjectKey, ReadinessTracker, Reader, SourceKey, WatchRegistrar,
};
use tollgate_store::MemStore;

pub fn cm() -> Gvk { Gvk::new("", "v1", "ConfigMap") }
pub fn pod() -> Gvk { Gvk::new("", "v1", "Pod") }
pub fn secret() -> Gvk { Gvk::new("", "v1", "Secret") }

pub fn source(id: &str) -> SourceKey { SourceKey::new("constraint", id) }

pub fn obj(gvk: &Gvk, ns: &str, name: &str) -> Object {
    Object::new(gvk.clone(), serde_json::json!({ "metadata": { "name": name, "namespace": ns } }))
}

/// MemStore with switchable failures and call counters.
#[derive(Default)]
pub struct FakeStore {
    pub mem: MemStore,
    pub fail_add: AtomicBool,
    pub fail_remove: AtomicBool,
    pub fail_wipe: AtomicBool,
    pub adds: AtomicUsize,
    pub wipes: AtomicUsize,
}

impl FakeStore {
    pub fn adds(&self) -> usize { self.adds.load(Ordering::SeqCst) }
    pub fn wipes(&self) -> usize { self.wipes.load(Ordering::SeqCst) }
    pub fn names(&self, gvk: &Gvk) -> Vec<String> {
        self.mem.list(gvk).iter().map(|o| o.name().unwrap_or_default().to_string()).collect()
    }
}

#[async_trait::async_trait]
impl DataStore for FakeStore {
    async fn add_data(&self, obj: &Object) -> Result<()> {
        self.adds.fetch_add(1, Ordering::SeqCst);
        if self.fail_add.load(Ordering::SeqCst) {
            return Err(anyhow!("store add boom"));
        }
        self.mem.add_data(obj).await
    }

    async fn remove_data(&self, obj: &Object) -> Result<()> {
        if self.fail_remove.load(Ordering::SeqCst) {
            return Err(anyhow!("store remove boom"));
        }
        self.mem.remove_data(obj).await
    }

    async fn wipe_data(&self) -> Result<()> {
        if self.fail_wipe.load(Ordering::SeqCst) {
            return Err(anyhow!("store wipe boom"));
        }
        self.wipes.fetch_add(1, Ordering::SeqCst);
        self.mem.wipe_data().await
    }
}

#[derive(Default)]
pub struct FakeRegistrar {
    pub calls: Mutex<Vec<Vec<Gvk>>>,
    pub fail: AtomicBool,
}

impl FakeRegistrar {
    pub fn call_count(&self) -> usize { self.calls.lock().len() }
    pub fn last(&self) -> Option<Vec<Gvk>> { self.calls.lock().last().cloned() }
}

#[async_trait::async_trait]
impl WatchRegistrar for FakeRegistrar {
    async fn replace_watch(&self, gvks: &[Gvk]) -> Result<()> {
        self.calls.lock().push(gvks.to_vec());
        if self.fail.load(Ordering::SeqCst) {
            return Err(anyhow!("registrar down"));
        }
        Ok(())
    }
}

/// Serves a fixed object set per GVK; can fail a GVK a number of times.
#[derive(Default)]
pub struct FakeReader {
    objects: Mutex<HashMap<Gvk, Vec<Object>>>,
    failures: Mutex<HashMap<Gvk, usize>>,
    hanging: Mutex<HashSet<Gvk>>,
    calls: Mutex<HashMap<Gvk, usize>>,
}

impl FakeReader {
    pub fn set(&self, gvk: &Gvk, objects: Vec<Object>) { self.objects.lock().insert(gvk.clone(), objects); }

    /// Fail the next `times` lists of `gvk`.
    pub fn fail(&self, gvk: &Gvk, times: usize) { self.failures.lock().insert(gvk.clone(), times); }

    pub fn fail_always(&self, gvk: &Gvk) { self.fail(gvk, usize::MAX) }

    pub fn heal(&self, gvk: &Gvk) {
        self.failures.lock().remove(gvk);
        self.hanging.lock().remove(gvk);
    }

    /// Lists of `gvk` never complete until healed.
    pub fn hang(&self, gvk: &Gvk) { self.hanging.lock().insert(gvk.clone()); }

    pub fn calls(&self, gvk: &Gvk) -> usize { self.calls.lock().get(gvk).copied().unwrap_or(0) }
}

#[async_trait::async_trait]
impl Reader for FakeReader {
    async fn list(&self, gvk: &Gvk) -> Result<Vec<Object>> {
        *self.calls.lock().entry(gvk.clone()).or_insert(0) += 1;
        let hangs = self.hanging.lock().contains(gvk);
        if hangs {
            std::future::pending::<()>().await;
        }
        {
            let mut failures = self.failures.lock();
            if let Some(left) = failures.get_mut(gvk) {
                if *left > 0 {
                    if *left != usize::MAX {
                        *left -= 1;
                    }
                    return Err(anyhow!("list {} boom", gvk));
                }
            }
        }
        Ok(self.objects.lock().get(gvk).cloned().unwrap_or_default())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackerCall {
    Observe(ObjectKey),
    CancelExpect(ObjectKey),
    CancelData(Gvk),
}

#[derive(Default)]
pub struct RecordingTracker {
    pub log: Arc<Mutex<Vec<TrackerCall>>>,
}

impl RecordingTracker {
    pub fn calls(&self) -> Vec<TrackerCall> { self.log.lock().clone() }
}

struct RecordingExpectations {
    log: Arc<Mutex<Vec<TrackerCall>>>,
}

impl Expectations for RecordingExpectations {
    fn expect(&self, _key: &ObjectKey) {}
    fn observe(&self, key: &ObjectKey) { self.log.lock().push(TrackerCall::Observe(key.clone())); }
    fn cancel_expect(&self, key: &ObjectKey) { self.log.lock().push(TrackerCall::CancelExpect(key.clone())); }
    fn expectations_done(&self) {}
    fn satisfied(&self) -> bool { true }
}

impl ReadinessTracker for RecordingTracker {
    fn for_data(&self, _gvk: &Gvk) -> Arc<dyn Expectations> {
        Arc::new(RecordingExpectations { log: Arc::clone(&self.log) })
    }

    fn cancel_data(&self, gvk: &Gvk) { self.log.lock().push(TrackerCall::CancelData(gvk.clone())); }
}

pub struct Harness {
    pub manager: CacheManager,
    pub store: Arc<FakeStore>,
    pub registrar: Arc<FakeRegistrar>,
    pub reader: Arc<FakeReader>,
    pub tracker: Arc<RecordingTracker>,
}

pub fn fast_settings() -> Settings {
    Settings {
        interval: Duration::from_millis(50),
        backoff: BackoffPolicy { initial: Duration::from_millis(10), factor: 2.0, jitter: 0.0, steps: 3, seed: 1 },
    }
}

pub fn harness() -> Harness { harness_with(Excluder::new()) }

pub fn harness_with(excluder: Excluder) -> Harness {
    let store = Arc::new(FakeStore::default());
    let registrar = Arc::new(FakeRegistrar::default());
    let reader = Arc::new(FakeReader::default());
    let tracker = Arc::new(RecordingTracker::default());
    let manager = CacheManager::new(
        CacheManagerConfig::new()
            .store(store.clone())
            .registrar(registrar.clone())
            .reader(reader.clone())
            .tracker(tracker.clone())
            .excluder(excluder)
            .settings(fast_settings()),
    )
    .expect("complete config");
    Harness { manager, store, registrar, reader, tracker }
}

impl Harness {
    /// Register `gvks` under `id` and reconcile once so they are watched.
    pub async fn watch(&self, id: &str, gvks: Vec<Gvk>) {
        self.manager.add_source(source(id), gvks).unwrap();
        self.manager.sync_once().await;
        self.manager.settle().await;
    }
}
