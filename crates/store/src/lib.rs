//! Tollgate store: in-RAM mirror of synced objects, keyed by object identity.
//! Writers go through [`DataStore`]; readers take immutable snapshots.

#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::sync::watch;
use tollgate_core::{DataStore, Gvk, Object, ObjectKey};
use tracing::{debug, info};

/// Immutable view of the store at one epoch, ordered by key.
#[derive(Debug, Clone, Default)]
pub struct StoreSnapshot {
    pub epoch: u64,
    pub objects: Vec<(ObjectKey, Arc<Object>)>,
}

impl StoreSnapshot {
    pub fn len(&self) -> usize { self.objects.len() }
    pub fn is_empty(&self) -> bool { self.objects.is_empty() }
}

#[derive(Default)]
struct State {
    objects: FxHashMap<ObjectKey, Arc<Object>>,
    epoch: u64,
}

/// In-memory [`DataStore`]. Snapshots are frozen lazily on read when the epoch moved.
pub struct MemStore {
    state: Mutex<State>,
    snap: ArcSwap<StoreSnapshot>,
    epoch_tx: watch::Sender<u64>,
}

impl Default for MemStore {
    fn default() -> Self { Self::new() }
}

impl MemStore {
    pub fn new() -> Self {
        let (epoch_tx, _) = watch::channel(0u64);
        Self { state: Mutex::new(State::default()), snap: ArcSwap::from_pointee(StoreSnapshot::default()), epoch_tx }
    }

    /// Current snapshot; rebuilt only if writes happened since the last one.
    pub fn current(&self) -> Arc<StoreSnapshot> {
        let cached = self.snap.load_full();
        let state = self.state.lock();
        if cached.epoch == state.epoch {
            return cached;
        }
        let mut objects: Vec<(ObjectKey, Arc<Object>)> =
            state.objects.iter().map(|(k, v)| (k.clone(), Arc::clone(v))).collect();
        let epoch = state.epoch;
        drop(state);
        objects.sort_by(|a, b| a.0.cmp(&b.0));
        let next = Arc::new(StoreSnapshot { epoch, objects });
        self.snap.store(Arc::clone(&next));
        next
    }

    pub fn subscribe_epoch(&self) -> watch::Receiver<u64> { self.epoch_tx.subscribe() }

    pub fn len(&self) -> usize { self.state.lock().objects.len() }

    pub fn is_empty(&self) -> bool { self.state.lock().objects.is_empty() }

    pub fn contains(&self, key: &ObjectKey) -> bool { self.state.lock().objects.contains_key(key) }

    pub fn get(&self, key: &ObjectKey) -> Option<Arc<Object>> { self.state.lock().objects.get(key).cloned() }

    pub fn list(&self, gvk: &Gvk) -> Vec<Arc<Object>> {
        let state = self.state.lock();
        let mut out: Vec<(ObjectKey, Arc<Object>)> = state
            .objects
            .iter()
            .filter(|(k, _)| &k.gvk == gvk)
            .map(|(k, v)| (k.clone(), Arc::clone(v)))
            .collect();
        drop(state);
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out.into_iter().map(|(_, v)| v).collect()
    }

    /// Distinct kinds currently held, sorted.
    pub fn kinds(&self) -> Vec<Gvk> {
        let state = self.state.lock();
        let mut kinds: Vec<Gvk> = state.objects.keys().map(|k| k.gvk.clone()).collect();
        drop(state);
        kinds.sort();
        kinds.dedup();
        kinds
    }

    fn bump(&self, state: &mut State) {
        state.epoch = state.epoch.saturating_add(1);
        metrics::gauge!("store_objects", state.objects.len() as f64);
        self.epoch_tx.send_replace(state.epoch);
    }
}

#[async_trait::async_trait]
impl DataStore for MemStore {
    async fn add_data(&self, obj: &Object) -> Result<()> {
        let key = obj.key().context("keying object for store")?;
        let mut state = self.state.lock();
        state.objects.insert(key, Arc::new(obj.clone()));
        self.bump(&mut state);
        Ok(())
    }

    async fn remove_data(&self, obj: &Object) -> Result<()> {
        let key = obj.key().context("keying object for store")?;
        let mut state = self.state.lock();
        if state.objects.remove(&key).is_some() {
            self.bump(&mut state);
        } else {
            debug!(key = %key, "remove of absent object");
        }
        Ok(())
    }

    async fn wipe_data(&self) -> Result<()> {
        let mut state = self.state.lock();
        let dropped = state.objects.len();
        state.objects.clear();
        self.bump(&mut state);
        drop(state);
        metrics::counter!("store_wipes_total", 1u64);
        info!(dropped, "store wiped");
        Ok(())
    }
}
