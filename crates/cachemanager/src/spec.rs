//! Desired state of the cache: the process excluder plus the GVK aggregator, behind one lock.
//!
//! Callers only get [`SpecLock::snapshot`] and [`SpecLock::mutate`]; no guard escapes, so the
//! lock can never be held across an `.await`.

use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashSet;
use tollgate_core::{Excluder, Gvk};
use tollgate_gvk::GvkAggregator;

#[derive(Debug)]
pub(crate) struct Spec {
    pub(crate) excluder: Arc<Excluder>,
    pub(crate) aggregator: GvkAggregator,
    excluder_changed: bool,
    // bumped on every excluder swap; the flag is only cleared for the epoch that was handled
    excluder_epoch: u64,
}

impl Spec {
    /// Swap the excluder if it differs by value. Returns whether it changed.
    pub(crate) fn replace_excluder(&mut self, next: Excluder) -> bool {
        if *self.excluder == next {
            return false;
        }
        self.excluder = Arc::new(next);
        self.excluder_changed = true;
        self.excluder_epoch += 1;
        true
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct SpecSnapshot {
    pub(crate) desired: FxHashSet<Gvk>,
    pub(crate) excluder_changed: bool,
    pub(crate) excluder_epoch: u64,
}

#[derive(Debug)]
pub(crate) struct SpecLock {
    inner: RwLock<Spec>,
}

impl SpecLock {
    pub(crate) fn new(excluder: Excluder) -> Self {
        Self {
            inner: RwLock::new(Spec {
                excluder: Arc::new(excluder),
                aggregator: GvkAggregator::new(),
                excluder_changed: false,
                excluder_epoch: 0,
            }),
        }
    }

    pub(crate) fn snapshot(&self) -> SpecSnapshot {
        let spec = self.inner.read();
        SpecSnapshot {
            desired: spec.aggregator.list_all_gvks().into_iter().collect(),
            excluder_changed: spec.excluder_changed,
            excluder_epoch: spec.excluder_epoch,
        }
    }

    pub(crate) fn read<R>(&self, f: impl FnOnce(&Spec) -> R) -> R { f(&self.inner.read()) }

    pub(crate) fn mutate<R>(&self, f: impl FnOnce(&mut Spec) -> R) -> R { f(&mut self.inner.write()) }

    pub(crate) fn excluder(&self) -> Arc<Excluder> { Arc::clone(&self.inner.read().excluder) }

    /// Clear the dirty flag unless the excluder was swapped again after `epoch` was snapshotted.
    pub(crate) fn clear_excluder_changed(&self, epoch: u64) -> bool {
        let mut spec = self.inner.write();
        if spec.excluder_epoch != epoch {
            return false;
        }
        spec.excluder_changed = false;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tollgate_core::{Process, SourceKey};

    fn excluder(ns: &str) -> Excluder {
        let mut e = Excluder::new();
        e.add(Process::Sync, [ns.to_string()]);
        e
    }

    #[test]
    fn equal_excluder_is_not_a_change() {
        let lock = SpecLock::new(excluder("kube-system"));
        assert!(!lock.mutate(|s| s.replace_excluder(excluder("kube-system"))));
        assert!(!lock.snapshot().excluder_changed);
        assert!(lock.mutate(|s| s.replace_excluder(excluder("other"))));
        assert!(lock.snapshot().excluder_changed);
    }

    #[test]
    fn flag_survives_a_newer_swap() {
        let lock = SpecLock::new(Excluder::new());
        lock.mutate(|s| s.replace_excluder(excluder("a")));
        let snap = lock.snapshot();
        // swapped again while the cycle for `snap` was running
        lock.mutate(|s| s.replace_excluder(excluder("b")));
        assert!(!lock.clear_excluder_changed(snap.excluder_epoch));
        assert!(lock.snapshot().excluder_changed);
        let snap = lock.snapshot();
        assert!(lock.clear_excluder_changed(snap.excluder_epoch));
        assert!(!lock.snapshot().excluder_changed);
    }

    #[test]
    fn snapshot_copies_desired_gvks() {
        let lock = SpecLock::new(Excluder::new());
        let gvk = Gvk::new("", "v1", "Pod");
        lock.mutate(|s| s.aggregator.upsert(SourceKey::new("config", "c"), [gvk.clone()])).unwrap();
        let snap = lock.snapshot();
        lock.mutate(|s| s.aggregator.remove(&SourceKey::new("config", "c"))).unwrap();
        assert!(snap.desired.contains(&gvk));
        assert!(lock.snapshot().desired.is_empty());
    }
}
