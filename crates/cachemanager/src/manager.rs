use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tollgate_core::{
    DataStore, Excluder, Gvk, Object, Process, ReadinessTracker, Reader, SourceKey, WatchEvent, WatchRegistrar,
};
use tollgate_gvk::WatchSet;
use tracing::{debug, info, trace, warn, Instrument, Span};

use crate::config::{CacheManagerConfig, Settings};
use crate::error::{CacheError, Result};
use crate::replay::ReplaySupervisor;
use crate::spec::SpecLock;
use crate::sync_metrics::{SyncMetricsCache, SyncReport, SyncStatus, Tags};

pub(crate) struct Inner {
    pub(crate) store: Arc<dyn DataStore>,
    pub(crate) registrar: Arc<dyn WatchRegistrar>,
    pub(crate) reader: Arc<dyn Reader>,
    pub(crate) tracker: Arc<dyn ReadinessTracker>,
    pub(crate) spec: SpecLock,
    pub(crate) watched: WatchSet,
    pub(crate) sync_metrics: SyncMetricsCache,
    pub(crate) replay: AsyncMutex<ReplaySupervisor>,
    pub(crate) settings: Settings,
    pub(crate) span: Span,
    // parent of every replay worker's stop token; derived from the loop's context while started
    root: Mutex<CancellationToken>,
    started: AtomicBool,
}

/// Keeps the backing store mirroring exactly the kinds its sources ask for.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct CacheManager {
    pub(crate) inner: Arc<Inner>,
}

impl CacheManager {
    pub fn new(config: CacheManagerConfig) -> Result<Self> {
        let CacheManagerConfig { store, registrar, reader, tracker, excluder, settings, span } = config;
        let inner = Inner {
            store: store.ok_or(CacheError::Config("data store"))?,
            registrar: registrar.ok_or(CacheError::Config("watch registrar"))?,
            reader: reader.ok_or(CacheError::Config("reader"))?,
            tracker: tracker.ok_or(CacheError::Config("readiness tracker"))?,
            spec: SpecLock::new(excluder.ok_or(CacheError::Config("process excluder"))?),
            watched: WatchSet::new(),
            sync_metrics: SyncMetricsCache::new(),
            replay: AsyncMutex::new(ReplaySupervisor::default()),
            settings,
            span: span.unwrap_or_else(|| tracing::info_span!("cache_manager")),
            root: Mutex::new(CancellationToken::new()),
            started: AtomicBool::new(false),
        };
        Ok(Self { inner: Arc::new(inner) })
    }

    pub fn settings(&self) -> &Settings { &self.inner.settings }

    pub fn sync_metrics(&self) -> &SyncMetricsCache { &self.inner.sync_metrics }

    pub(crate) fn worker_parent(&self) -> CancellationToken { self.inner.root.lock().clone() }

    /// Run the reconciliation loop until `ctx` is cancelled, then stop any replay in flight.
    ///
    /// A cycle in progress is abandoned as soon as `ctx` fires; whatever it had not finished
    /// stays queued for the next cycle.
    pub async fn start(&self, ctx: CancellationToken) -> Result<()> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Err(CacheError::AlreadyStarted);
        }
        let run = ctx.child_token();
        *self.inner.root.lock() = run.clone();
        let span = self.inner.span.clone();
        async {
            let mut tick = tokio::time::interval(self.inner.settings.interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            info!(interval_ms = self.inner.settings.interval.as_millis() as u64, "reconciliation loop started");
            loop {
                tokio::select! {
                    biased;
                    _ = run.cancelled() => break,
                    _ = tick.tick() => {
                        let report = tokio::select! {
                            biased;
                            _ = run.cancelled() => break,
                            report = self.sync_once() => report,
                        };
                        if !report.is_noop() {
                            debug!(?report, "reconciled");
                        }
                    }
                }
            }
            run.cancel();
            self.inner.replay.lock().await.stop().await;
            info!("reconciliation loop stopped");
        }
        .instrument(span)
        .await;
        *self.inner.root.lock() = CancellationToken::new();
        self.inner.started.store(false, Ordering::SeqCst);
        Ok(())
    }

    // ---- object ingestion ----

    /// Mirror `obj` into the store unless its kind is unwatched or its namespace excluded.
    pub async fn add_object(&self, obj: &Object) -> Result<()> {
        self.add_object_inner(obj).instrument(self.inner.span.clone()).await
    }

    async fn add_object_inner(&self, obj: &Object) -> Result<()> {
        let gvk = obj.gvk();
        if !self.inner.watched.contains(gvk) {
            trace!(gvk = %gvk, "object for unwatched kind ignored");
            return Ok(());
        }
        let excluder = self.inner.spec.excluder();
        let excluded = excluder
            .is_namespace_excluded(Process::Sync, obj)
            .map_err(|source| CacheError::Exclusion { gvk: gvk.clone(), source })?;
        let key = obj.key()?;
        if excluded {
            self.inner.tracker.for_data(gvk).cancel_expect(&key);
            trace!(key = %key, "namespace excluded from sync");
            return Ok(());
        }

        let metrics_key = SyncMetricsCache::key_for(&key);
        match self.inner.store.add_data(obj).await {
            Ok(()) => {
                self.inner.tracker.for_data(gvk).observe(&key);
                self.inner.sync_metrics.add_object(metrics_key, Tags { kind: gvk.kind.clone(), status: SyncStatus::Active });
                self.inner.sync_metrics.add_kind(&gvk.kind);
                Ok(())
            }
            Err(cause) => {
                self.inner.sync_metrics.add_object(metrics_key, Tags { kind: gvk.kind.clone(), status: SyncStatus::Error });
                Err(CacheError::AddData { key: key.to_string(), cause })
            }
        }
    }

    /// Remove `obj` from the store. The metrics entry is only dropped once the store confirms.
    pub async fn remove_object(&self, obj: &Object) -> Result<()> {
        self.remove_object_inner(obj).instrument(self.inner.span.clone()).await
    }

    async fn remove_object_inner(&self, obj: &Object) -> Result<()> {
        let gvk = obj.gvk();
        if !self.inner.watched.contains(gvk) {
            trace!(gvk = %gvk, "removal for unwatched kind ignored");
            return Ok(());
        }
        let key = obj.key()?;
        self.inner
            .store
            .remove_data(obj)
            .await
            .map_err(|cause| CacheError::RemoveData { key: key.to_string(), cause })?;
        self.inner.sync_metrics.delete_object(&SyncMetricsCache::key_for(&key));
        self.inner.tracker.for_data(gvk).cancel_expect(&key);
        Ok(())
    }

    /// Drop everything from the store, then reset and report sync metrics.
    pub(crate) async fn wipe_data(&self) -> Result<()> {
        self.inner.store.wipe_data().await.map_err(|cause| CacheError::Wipe { cause })?;
        metrics::counter!("cache_wipes_total", 1u64);
        self.inner.sync_metrics.reset_cache();
        self.report_sync_metrics();
        info!("data store wiped");
        Ok(())
    }

    pub fn report_sync_metrics(&self) -> SyncReport { self.inner.sync_metrics.report_sync() }

    // ---- list and sync ----

    /// List every live object of `gvk` and add each one; stops at the first failure.
    ///
    /// Every listed object becomes a readiness expectation for `gvk`, and the expectations are
    /// marked complete once the whole list went through.
    pub async fn list_and_sync_data_for_gvk(&self, gvk: &Gvk) -> Result<usize> {
        let started = Instant::now();
        // tracked from the first attempt, so a failing list keeps readiness pending
        let expectations = self.inner.tracker.for_data(gvk);
        let objects =
            self.inner.reader.list(gvk).await.map_err(|cause| CacheError::List { gvk: gvk.clone(), cause })?;
        for obj in &objects {
            // nameless objects fail in add_object below
            if let Ok(key) = obj.key() {
                expectations.expect(&key);
            }
        }
        for obj in &objects {
            self.add_object(obj).await.map_err(|e| CacheError::Sync { gvk: gvk.clone(), source: Box::new(e) })?;
        }
        expectations.expectations_done();
        let elapsed = started.elapsed().as_secs_f64();
        metrics::histogram!("sync_duration_seconds", elapsed, "kind" => gvk.kind.clone());
        debug!(gvk = %gvk, count = objects.len(), elapsed_ms = (elapsed * 1000.0) as u64, "listed and synced");
        Ok(objects.len())
    }

    /// Sync each GVK independently; returns the ones that succeeded.
    pub async fn list_and_sync_data(&self, gvks: &[Gvk]) -> FxHashSet<Gvk> {
        let mut synced = FxHashSet::default();
        for gvk in gvks {
            match self.list_and_sync_data_for_gvk(gvk).await {
                Ok(_) => {
                    synced.insert(gvk.clone());
                }
                Err(e) => warn!(gvk = %gvk, error = %e, "list and sync failed"),
            }
        }
        synced
    }

    // ---- sources and policy ----

    /// Set the GVKs `source` needs. Watches follow on the next reconciliation.
    pub fn add_source(&self, source: SourceKey, gvks: impl IntoIterator<Item = Gvk>) -> Result<()> {
        let _g = self.inner.span.enter();
        let gvks: Vec<Gvk> = gvks.into_iter().collect();
        debug!(source = %source, count = gvks.len(), "source upserted");
        self.inner.spec.mutate(|spec| spec.aggregator.upsert(source, gvks))?;
        Ok(())
    }

    pub fn remove_source(&self, source: &SourceKey) -> Result<()> {
        let _g = self.inner.span.enter();
        debug!(source = %source, "source removed");
        self.inner.spec.mutate(|spec| spec.aggregator.remove(source))?;
        Ok(())
    }

    /// Swap the namespace excluder. A different excluder forces a wipe and full replay next cycle.
    pub fn exclude_processes(&self, excluder: Excluder) {
        let _g = self.inner.span.enter();
        if self.inner.spec.mutate(|spec| spec.replace_excluder(excluder)) {
            info!("process excluder changed; full replay scheduled");
        } else {
            trace!("process excluder unchanged");
        }
    }

    pub fn watched_gvks(&self) -> Vec<Gvk> {
        let mut v = self.inner.watched.items();
        v.sort();
        v
    }

    pub fn desired_gvks(&self) -> Vec<Gvk> {
        let mut v = self.inner.spec.read(|spec| spec.aggregator.list_all_gvks());
        v.sort();
        v
    }

    pub fn list_sources(&self, source: &SourceKey) -> Vec<Gvk> {
        let mut v: Vec<Gvk> = self.inner.spec.read(|spec| spec.aggregator.list(source)).into_iter().collect();
        v.sort();
        v
    }

    /// Apply watch events until the channel closes or `token` is cancelled.
    pub fn spawn_event_pump(&self, mut rx: mpsc::Receiver<WatchEvent>, token: CancellationToken) -> JoinHandle<()> {
        let manager = self.clone();
        let span = self.inner.span.clone();
        tokio::spawn(
            async move {
                loop {
                    let ev = tokio::select! {
                        _ = token.cancelled() => break,
                        ev = rx.recv() => match ev {
                            Some(ev) => ev,
                            None => break,
                        },
                    };
                    let res = match &ev {
                        WatchEvent::Upsert(obj) => manager.add_object(obj).await,
                        WatchEvent::Delete(obj) => manager.remove_object(obj).await,
                    };
                    if let Err(e) = res {
                        warn!(gvk = %ev.object().gvk(), error = %e, "applying watch event failed");
                    }
                }
                debug!("event pump stopped");
            }
            .instrument(span),
        )
    }
}
