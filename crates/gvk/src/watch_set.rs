//! The set of GVKs currently watched and synced.
//!
//! Replacing the set is two-phase: [`WatchSet::plan`] computes a [`Transition`], and
//! [`WatchSet::commit`] stores the new membership and then runs the caller's side effect
//! (the external watch registration) within the same call. Membership is committed
//! before the side effect runs and is not rolled back if it fails.

use std::future::Future;

use parking_lot::RwLock;
use rustc_hash::FxHashSet;
use smallvec::SmallVec;
use tollgate_core::Gvk;
use tracing::debug;

#[derive(Debug, Default)]
pub struct WatchSet {
    members: RwLock<FxHashSet<Gvk>>,
    // serializes transitions; plain reads never wait on it
    transition: tokio::sync::Mutex<()>,
}

/// A computed membership change.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Transition {
    next: FxHashSet<Gvk>,
    added: SmallVec<[Gvk; 4]>,
    removed: SmallVec<[Gvk; 4]>,
}

impl Transition {
    pub fn added(&self) -> &[Gvk] { &self.added }
    pub fn removed(&self) -> &[Gvk] { &self.removed }
    pub fn next(&self) -> &FxHashSet<Gvk> { &self.next }
    pub fn is_noop(&self) -> bool { self.added.is_empty() && self.removed.is_empty() }

    /// New membership in a stable order.
    pub fn sorted(&self) -> Vec<Gvk> {
        let mut v: Vec<Gvk> = self.next.iter().cloned().collect();
        v.sort();
        v
    }
}

impl WatchSet {
    pub fn new() -> Self { Self::default() }

    pub fn add(&self, gvks: impl IntoIterator<Item = Gvk>) { self.members.write().extend(gvks); }

    pub fn remove<'a>(&self, gvks: impl IntoIterator<Item = &'a Gvk>) {
        let mut members = self.members.write();
        for gvk in gvks {
            members.remove(gvk);
        }
    }

    pub fn add_set(&self, other: &WatchSet) {
        let items = other.items();
        self.add(items);
    }

    pub fn remove_set(&self, other: &WatchSet) {
        let items = other.items();
        self.remove(items.iter());
    }

    pub fn contains(&self, gvk: &Gvk) -> bool { self.members.read().contains(gvk) }

    pub fn size(&self) -> usize { self.members.read().len() }

    pub fn is_empty(&self) -> bool { self.members.read().is_empty() }

    pub fn items(&self) -> Vec<Gvk> { self.members.read().iter().cloned().collect() }

    pub fn to_set(&self) -> FxHashSet<Gvk> { self.members.read().clone() }

    pub fn equals(&self, other: &WatchSet) -> bool {
        if std::ptr::eq(self, other) {
            return true;
        }
        let theirs = other.to_set();
        *self.members.read() == theirs
    }

    pub fn equals_set(&self, other: &FxHashSet<Gvk>) -> bool { *self.members.read() == *other }

    /// Members of `self` not in `other`.
    pub fn difference(&self, other: &WatchSet) -> WatchSet {
        let theirs = other.to_set();
        let out: FxHashSet<Gvk> = self.members.read().difference(&theirs).cloned().collect();
        WatchSet::from(out)
    }

    pub fn intersection(&self, other: &WatchSet) -> WatchSet {
        let theirs = other.to_set();
        let out: FxHashSet<Gvk> = self.members.read().intersection(&theirs).cloned().collect();
        WatchSet::from(out)
    }

    /// Compute the transition from the current membership to `next`.
    pub fn plan(&self, next: impl IntoIterator<Item = Gvk>) -> Transition {
        let next: FxHashSet<Gvk> = next.into_iter().collect();
        let current = self.members.read();
        let added = next.difference(&current).cloned().collect();
        let removed = current.difference(&next).cloned().collect();
        Transition { next, added, removed }
    }

    /// Commit `transition` and run `side_effect` with the new membership.
    ///
    /// The side effect's error is returned as-is; membership stays committed.
    pub async fn commit<F, Fut, E>(&self, transition: Transition, side_effect: F) -> Result<(), E>
    where
        F: FnOnce(Vec<Gvk>) -> Fut,
        Fut: Future<Output = Result<(), E>>,
    {
        let _guard = self.transition.lock().await;
        self.commit_locked(&transition, side_effect).await
    }

    /// `plan` + `commit` under one transition guard.
    pub async fn replace<F, Fut, E>(&self, next: impl IntoIterator<Item = Gvk>, side_effect: F) -> Result<Transition, E>
    where
        F: FnOnce(Vec<Gvk>) -> Fut,
        Fut: Future<Output = Result<(), E>>,
    {
        let _guard = self.transition.lock().await;
        let transition = self.plan(next);
        self.commit_locked(&transition, side_effect).await.map(|()| transition)
    }

    // caller holds the transition guard
    async fn commit_locked<F, Fut, E>(&self, transition: &Transition, side_effect: F) -> Result<(), E>
    where
        F: FnOnce(Vec<Gvk>) -> Fut,
        Fut: Future<Output = Result<(), E>>,
    {
        let gvks = transition.sorted();
        debug!(added = transition.added.len(), removed = transition.removed.len(), total = gvks.len(), "watch set commit");
        *self.members.write() = transition.next.clone();
        side_effect(gvks).await
    }
}

impl From<FxHashSet<Gvk>> for WatchSet {
    fn from(members: FxHashSet<Gvk>) -> Self {
        Self { members: RwLock::new(members), transition: tokio::sync::Mutex::new(()) }
    }
}

impl FromIterator<Gvk> for WatchSet {
    fn from_iter<I: IntoIterator<Item = Gvk>>(iter: I) -> Self { Self::from(iter.into_iter().collect::<FxHashSet<_>>()) }
}
