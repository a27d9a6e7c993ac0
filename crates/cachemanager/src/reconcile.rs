//! One reconciliation cycle: converge the watched set onto the aggregator's desired set,
//! wipe when kinds leave or the excluder changed, list new kinds and hand the rest to replay.

use rustc_hash::FxHashSet;
use tollgate_core::Gvk;
use tracing::{debug, error, info, Instrument};

use crate::CacheManager;

/// What a cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub watch_replaced: bool,
    pub wiped: bool,
    /// Newly watched GVKs listed and synced inline.
    pub listed: Vec<Gvk>,
    /// GVKs handed to the replay worker.
    pub replaying: Vec<Gvk>,
}

impl CycleReport {
    pub fn is_noop(&self) -> bool {
        !self.watch_replaced && !self.wiped && self.listed.is_empty() && self.replaying.is_empty()
    }
}

fn sorted(set: &FxHashSet<Gvk>) -> Vec<Gvk> {
    let mut v: Vec<Gvk> = set.iter().cloned().collect();
    v.sort();
    v
}

impl CacheManager {
    /// Run one reconciliation cycle.
    pub async fn sync_once(&self) -> CycleReport {
        let span = self.inner.span.clone();
        self.sync_once_inner().instrument(span).await
    }

    async fn sync_once_inner(&self) -> CycleReport {
        let inner = &self.inner;
        let mut replay = inner.replay.lock().await;
        replay.collect_finished().await;

        let snap = inner.spec.snapshot();
        let desired = snap.desired;
        replay.retain_desired(&desired);
        let watched = inner.watched.to_set();

        if desired == watched && !snap.excluder_changed && !replay.wipe_pending && replay.pending().is_empty() {
            return CycleReport::default();
        }

        let to_delete: FxHashSet<Gvk> = watched.difference(&desired).cloned().collect();
        let to_add: FxHashSet<Gvk> = desired.difference(&watched).cloned().collect();
        let mut report = CycleReport::default();

        // Work is queued on the supervisor before anything runs, so a cycle abandoned midway
        // leaves it for the next one.
        replay.queue(to_add.iter().cloned());
        if !to_delete.is_empty() {
            replay.wipe_pending = true;
        }

        if !to_delete.is_empty() || !to_add.is_empty() {
            let registrar = inner.registrar.clone();
            let res = inner
                .watched
                .replace(desired.iter().cloned(), move |gvks: Vec<Gvk>| async move {
                    registrar.replace_watch(&gvks).await
                })
                .await;
            if let Err(e) = res {
                // membership stays; the registrar re-delivers once it recovers
                error!(error = %e, "replacing watches failed");
            }
            report.watch_replaced = true;
            for gvk in &to_delete {
                inner.tracker.cancel_data(gvk);
            }
            info!(added = to_add.len(), removed = to_delete.len(), total = desired.len(), "watch set replaced");
        }

        if snap.excluder_changed || replay.wipe_pending {
            // the old worker must not re-add data behind the wipe
            replay.stop().await;
            replay.wipe_pending = true;
            match self.wipe_data().await {
                Ok(()) => {
                    report.wiped = true;
                    replay.wipe_pending = false;
                    replay.queue(desired.intersection(&watched).cloned());
                    if snap.excluder_changed && !inner.spec.clear_excluder_changed(snap.excluder_epoch) {
                        debug!("excluder changed again during the cycle; next cycle wipes again");
                    }
                }
                Err(e) => error!(error = %e, "wipe failed; retrying next cycle"),
            }
        }

        if !to_add.is_empty() {
            let synced = self.list_and_sync_data(&sorted(&to_add)).await;
            replay.done(&synced);
            report.listed = sorted(&synced);
        }

        if !replay.pending().is_empty() {
            report.replaying = replay.restart(self, &desired, &self.worker_parent()).await;
            if !report.replaying.is_empty() {
                info!(count = report.replaying.len(), "replay scheduled");
            }
        }
        report
    }

    /// Wait for the current replay worker to finish. Returns the GVKs still waiting for replay,
    /// which the next cycle picks up again.
    pub async fn settle(&self) -> Vec<Gvk> {
        let mut replay = self.inner.replay.lock().await;
        replay.settle().await;
        let desired: FxHashSet<Gvk> = self.inner.spec.snapshot().desired;
        replay.retain_desired(&desired);
        sorted(replay.pending())
    }

    /// Whether a replay worker is running right now.
    pub async fn is_replaying(&self) -> bool { self.inner.replay.lock().await.is_running() }
}
