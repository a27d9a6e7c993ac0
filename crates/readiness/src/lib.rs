//! Tollgate readiness: tracks which objects of each GVK are expected and which were observed,
//! so startup can report when the mirror caught up.

#![forbid(unsafe_code)]

use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use tollgate_core::{Expectations, Gvk, ObjectKey, ReadinessTracker};
use tracing::debug;

#[derive(Debug, Default)]
struct TrackerState {
    expected: FxHashSet<ObjectKey>,
    seen: FxHashSet<ObjectKey>,
    canceled: FxHashSet<ObjectKey>,
    populated: bool,
    // latched once satisfied; no further bookkeeping after that
    all_satisfied: bool,
}

/// Expectations for a single GVK.
#[derive(Debug, Default)]
pub struct ObjectTracker {
    state: Mutex<TrackerState>,
}

impl ObjectTracker {
    pub fn new() -> Self { Self::default() }

    pub fn expected_len(&self) -> usize { self.state.lock().expected.len() }
}

impl Expectations for ObjectTracker {
    fn expect(&self, key: &ObjectKey) {
        let mut st = self.state.lock();
        if st.all_satisfied || st.canceled.contains(key) {
            return;
        }
        // observed before it was expected
        if st.seen.remove(key) {
            return;
        }
        st.expected.insert(key.clone());
    }

    fn observe(&self, key: &ObjectKey) {
        let mut st = self.state.lock();
        if st.all_satisfied {
            return;
        }
        if !st.expected.remove(key) {
            st.seen.insert(key.clone());
        }
    }

    fn cancel_expect(&self, key: &ObjectKey) {
        let mut st = self.state.lock();
        if st.all_satisfied {
            return;
        }
        st.expected.remove(key);
        st.seen.remove(key);
        st.canceled.insert(key.clone());
    }

    fn expectations_done(&self) { self.state.lock().populated = true; }

    fn satisfied(&self) -> bool {
        let mut st = self.state.lock();
        if st.all_satisfied {
            return true;
        }
        if !st.populated || !st.expected.is_empty() {
            return false;
        }
        st.all_satisfied = true;
        st.seen = FxHashSet::default();
        st.canceled = FxHashSet::default();
        true
    }
}

/// Per-GVK trackers, created on demand.
#[derive(Debug, Default)]
pub struct Tracker {
    data: Mutex<FxHashMap<Gvk, Arc<ObjectTracker>>>,
}

impl Tracker {
    pub fn new() -> Self { Self::default() }

    pub fn tracked(&self) -> Vec<Gvk> {
        let mut v: Vec<Gvk> = self.data.lock().keys().cloned().collect();
        v.sort();
        v
    }

    /// True once at least one GVK is tracked and every tracked GVK is satisfied.
    pub fn satisfied(&self) -> bool {
        let trackers: Vec<Arc<ObjectTracker>> = self.data.lock().values().cloned().collect();
        !trackers.is_empty() && trackers.iter().all(|t| t.satisfied())
    }
}

impl ReadinessTracker for Tracker {
    fn for_data(&self, gvk: &Gvk) -> Arc<dyn Expectations> {
        let tracker = Arc::clone(self.data.lock().entry(gvk.clone()).or_default());
        tracker
    }

    fn cancel_data(&self, gvk: &Gvk) {
        if self.data.lock().remove(gvk).is_some() {
            debug!(gvk = %gvk, "readiness expectations dropped");
        }
    }
}
