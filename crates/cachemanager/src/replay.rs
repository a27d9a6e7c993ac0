//! Replay of GVKs that need re-listing, with exponential backoff.
//!
//! At most one worker runs at a time. The [`ReplaySupervisor`] owns its handle; starting a new
//! worker first cancels and awaits the previous one and folds its unfinished GVKs into the new
//! set, so two workers never list the same GVK concurrently.

use std::hash::{Hash, Hasher};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rustc_hash::{FxHashSet, FxHasher};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tollgate_core::Gvk;
use tracing::{debug, info, warn, Instrument};

use crate::CacheManager;

const MAX_DELAY: Duration = Duration::from_secs(600);

/// Exponential backoff with deterministic jitter.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub factor: f64,
    /// Fraction of the base delay added at most, in `[0, 1]`.
    pub jitter: f64,
    /// Attempts per worker run.
    pub steps: u32,
    pub seed: u64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        let seed = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_nanos() as u64).unwrap_or_default();
        Self { initial: Duration::from_secs(1), factor: 2.0, jitter: 0.1, steps: 3, seed }
    }
}

impl BackoffPolicy {
    /// Delay after failed attempt `attempt` (0-based). Same seed, same delays.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let exp = i32::try_from(attempt).unwrap_or(i32::MAX);
        let base = self.initial.as_secs_f64() * self.factor.powi(exp);
        let jitter = if self.jitter > 0.0 { base * self.jitter * unit_jitter(self.seed, attempt) } else { 0.0 };
        Duration::try_from_secs_f64(base + jitter).map(|d| d.min(MAX_DELAY)).unwrap_or(MAX_DELAY)
    }
}

fn unit_jitter(seed: u64, attempt: u32) -> f64 {
    let mut h = FxHasher::default();
    (seed, attempt).hash(&mut h);
    (h.finish() >> 11) as f64 / (1u64 << 53) as f64
}

struct ReplayHandle {
    stop: CancellationToken,
    gvks: FxHashSet<Gvk>,
    join: JoinHandle<FxHashSet<Gvk>>,
}

impl ReplayHandle {
    // borrows so the handle stays in place if the caller is dropped mid-wait
    async fn finish(&mut self) -> FxHashSet<Gvk> {
        match (&mut self.join).await {
            Ok(left) => left,
            Err(e) => {
                warn!(error = %e, "replay worker died; requeueing its gvks");
                std::mem::take(&mut self.gvks)
            }
        }
    }
}

/// Owns the single replay worker and the GVKs waiting for one.
#[derive(Default)]
pub(crate) struct ReplaySupervisor {
    current: Option<ReplayHandle>,
    pending: FxHashSet<Gvk>,
    pub(crate) wipe_pending: bool,
}

impl ReplaySupervisor {
    pub(crate) fn pending(&self) -> &FxHashSet<Gvk> { &self.pending }

    pub(crate) fn is_running(&self) -> bool { self.current.as_ref().is_some_and(|h| !h.join.is_finished()) }

    /// Move a finished worker's leftovers into the pending set.
    pub(crate) async fn collect_finished(&mut self) {
        if self.current.as_ref().is_some_and(|h| h.join.is_finished()) {
            self.settle().await;
        }
    }

    /// Signal the running worker, wait for it and keep what it did not finish.
    pub(crate) async fn stop(&mut self) {
        if let Some(handle) = self.current.as_mut() {
            handle.stop.cancel();
            let left = handle.finish().await;
            self.current = None;
            debug!(left = left.len(), "replay worker stopped");
            self.pending.extend(left);
        }
    }

    /// Wait for the running worker to finish on its own.
    pub(crate) async fn settle(&mut self) {
        if let Some(handle) = self.current.as_mut() {
            let left = handle.finish().await;
            self.current = None;
            self.pending.extend(left);
        }
    }

    pub(crate) fn retain_desired(&mut self, desired: &FxHashSet<Gvk>) { self.pending.retain(|g| desired.contains(g)); }

    pub(crate) fn queue(&mut self, gvks: impl IntoIterator<Item = Gvk>) { self.pending.extend(gvks); }

    pub(crate) fn done(&mut self, synced: &FxHashSet<Gvk>) { self.pending.retain(|g| !synced.contains(g)); }

    /// Replace the running worker with one replaying everything pending (including the old
    /// worker's leftovers) that is still desired.
    pub(crate) async fn restart(
        &mut self,
        manager: &CacheManager,
        desired: &FxHashSet<Gvk>,
        parent: &CancellationToken,
    ) -> Vec<Gvk> {
        self.stop().await;
        let mut gvks: FxHashSet<Gvk> = self.pending.drain().collect();
        gvks.retain(|g| desired.contains(g));
        let mut sorted: Vec<Gvk> = gvks.iter().cloned().collect();
        sorted.sort();
        if sorted.is_empty() {
            return sorted;
        }
        let stop = parent.child_token();
        let policy = manager.inner.settings.backoff.clone();
        let task = run_replay(manager.clone(), sorted.clone(), policy, stop.clone())
            .instrument(manager.inner.span.clone());
        self.current = Some(ReplayHandle { stop, gvks, join: tokio::spawn(task) });
        sorted
    }
}

/// Retry each GVK until it syncs, the steps run out or `stop` fires. Returns the GVKs left over.
async fn run_replay(
    manager: CacheManager,
    gvks: Vec<Gvk>,
    policy: BackoffPolicy,
    stop: CancellationToken,
) -> FxHashSet<Gvk> {
    info!(count = gvks.len(), "replay started");
    let mut remaining = gvks;
    let mut attempt = 0u32;
    while !remaining.is_empty() && attempt < policy.steps {
        let mut failed = Vec::new();
        let mut iter = remaining.into_iter();
        while let Some(gvk) = iter.next() {
            if !manager.inner.watched.contains(&gvk) {
                debug!(gvk = %gvk, "no longer watched; skipping replay");
                continue;
            }
            let outcome = tokio::select! {
                biased;
                _ = stop.cancelled() => None,
                res = manager.list_and_sync_data_for_gvk(&gvk) => Some(res),
            };
            match outcome {
                None => {
                    failed.push(gvk);
                    failed.extend(iter);
                    info!(left = failed.len(), "replay superseded");
                    return failed.into_iter().collect();
                }
                Some(Err(e)) => {
                    warn!(gvk = %gvk, attempt, error = %e, "replay failed");
                    metrics::counter!("replay_failures_total", 1u64);
                    failed.push(gvk);
                }
                Some(Ok(_)) => {}
            }
        }
        remaining = failed;
        if remaining.is_empty() || attempt + 1 == policy.steps {
            break;
        }
        let delay = policy.next_delay(attempt);
        debug!(attempt, delay_ms = delay.as_millis() as u64, left = remaining.len(), "replay backing off");
        tokio::select! {
            biased;
            _ = stop.cancelled() => {
                info!(left = remaining.len(), "replay superseded");
                return remaining.into_iter().collect();
            }
            _ = tokio::time::sleep(delay) => {}
        }
        attempt += 1;
    }
    manager.report_sync_metrics();
    if remaining.is_empty() {
        info!("replay finished");
    } else {
        warn!(left = remaining.len(), "replay exhausted its steps; requeueing");
    }
    remaining.into_iter().collect()
}
