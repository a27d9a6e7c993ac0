//! Tollgate kubehub: discovery, listing and dynamic watch registration against a live cluster.
//!
//! [`KubeReader`] and [`KubeRegistrar`] implement the core collaborator traits; watch events are
//! forwarded as [`WatchEvent`]s over an mpsc channel for the cache manager to apply.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use futures::TryStreamExt;
use kube::{
    api::{Api, ListParams},
    core::{ApiResource, DynamicObject},
    discovery::{Discovery, Scope},
    runtime::watcher::{self, Event},
    Client,
};
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
pub use tollgate_core::WatchEvent;
use tollgate_core::{Gvk, Object, Reader, WatchRegistrar};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveredResource {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub namespaced: bool,
}

impl DiscoveredResource {
    pub fn gvk(&self) -> Gvk { Gvk::new(self.group.clone(), self.version.clone(), self.kind.clone()) }
}

/// Discover served resources (incl. CRDs) using kube Discovery.
pub async fn discover(client: Client) -> Result<Vec<DiscoveredResource>> {
    let discovery = Discovery::new(client).run().await.context("running api discovery")?;
    let mut out = Vec::new();
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            out.push(DiscoveredResource {
                group: ar.group.clone(),
                version: ar.version.clone(),
                kind: ar.kind.clone(),
                namespaced: matches!(caps.scope, Scope::Namespaced),
            });
        }
    }
    out.sort_by(|a, b| a.group.cmp(&b.group).then(a.version.cmp(&b.version)).then(a.kind.cmp(&b.kind)));
    Ok(out)
}

const MISS_TTL: Duration = Duration::from_secs(30);

/// GVKs discovery did not find, remembered for a while.
#[derive(Debug)]
struct MissCache {
    ttl: Duration,
    seen: FxHashMap<Gvk, Instant>,
}

impl MissCache {
    fn new(ttl: Duration) -> Self { Self { ttl, seen: FxHashMap::default() } }

    fn record(&mut self, gvk: &Gvk, now: Instant) { self.seen.insert(gvk.clone(), now); }

    fn is_fresh(&mut self, gvk: &Gvk, now: Instant) -> bool {
        match self.seen.get(gvk) {
            Some(at) if now.saturating_duration_since(*at) < self.ttl => true,
            Some(_) => {
                self.seen.remove(gvk);
                false
            }
            None => false,
        }
    }
}

/// Resolves a [`Gvk`] to its served `ApiResource`; results are cached per client.
///
/// A miss runs one discovery and caches every served resource from it; kinds that are not
/// served are not looked up again for thirty seconds.
pub struct Resolver {
    client: Client,
    cache: Mutex<FxHashMap<Gvk, (ApiResource, bool)>>,
    misses: Mutex<MissCache>,
}

impl Resolver {
    pub fn new(client: Client) -> Self {
        Self { client, cache: Mutex::new(FxHashMap::default()), misses: Mutex::new(MissCache::new(MISS_TTL)) }
    }

    async fn resolve(&self, gvk: &Gvk) -> Result<(ApiResource, bool)> {
        if let Some(hit) = self.cache.lock().get(gvk).cloned() {
            return Ok(hit);
        }
        if self.misses.lock().is_fresh(gvk, Instant::now()) {
            return Err(anyhow!("GVK not served: {}", gvk));
        }
        let discovery = Discovery::new(self.client.clone()).run().await.context("running api discovery")?;
        let found = {
            let mut cache = self.cache.lock();
            for group in discovery.groups() {
                for (ar, caps) in group.recommended_resources() {
                    let key = Gvk::new(ar.group.clone(), ar.version.clone(), ar.kind.clone());
                    cache.insert(key, (ar, matches!(caps.scope, Scope::Namespaced)));
                }
            }
            cache.get(gvk).cloned()
        };
        match found {
            Some(hit) => Ok(hit),
            None => {
                self.misses.lock().record(gvk, Instant::now());
                debug!(gvk = %gvk, "not served; skipping discovery for a while");
                Err(anyhow!("GVK not served: {}", gvk))
            }
        }
    }

    /// Cluster-wide dynamic api for `gvk`.
    pub async fn api(&self, gvk: &Gvk) -> Result<Api<DynamicObject>> {
        let (ar, _namespaced) = self.resolve(gvk).await?;
        Ok(Api::all_with(self.client.clone(), &ar))
    }
}

fn object_from_dynamic(gvk: &Gvk, obj: &DynamicObject) -> Result<Object> {
    let mut raw = serde_json::to_value(obj).context("serializing DynamicObject")?;
    // list items come back without apiVersion/kind
    if let Some(map) = raw.as_object_mut() {
        map.entry("apiVersion").or_insert_with(|| serde_json::Value::String(gvk.api_version()));
        map.entry("kind").or_insert_with(|| serde_json::Value::String(gvk.kind.clone()));
    }
    Object::from_raw(raw).with_context(|| format!("decoding {} object", gvk))
}

/// Lists live objects cluster-wide.
pub struct KubeReader {
    resolver: Arc<Resolver>,
}

impl KubeReader {
    pub fn new(resolver: Arc<Resolver>) -> Self { Self { resolver } }
}

#[async_trait::async_trait]
impl Reader for KubeReader {
    async fn list(&self, gvk: &Gvk) -> Result<Vec<Object>> {
        let api = self.resolver.api(gvk).await?;
        let list = api.list(&ListParams::default()).await.with_context(|| format!("listing {}", gvk))?;
        list.items.iter().map(|o| object_from_dynamic(gvk, o)).collect()
    }
}

/// Restart delay for a watch stream: doubles from 1s up to `max`.
pub fn next_backoff(current: Option<Duration>, max: Duration) -> Duration {
    match current {
        None => Duration::from_secs(1).min(max),
        Some(d) => d.saturating_mul(2).min(max),
    }
}

/// Keeps one watch task per registered GVK.
pub struct KubeRegistrar {
    resolver: Arc<Resolver>,
    events: mpsc::Sender<WatchEvent>,
    tasks: Mutex<FxHashMap<Gvk, JoinHandle<()>>>,
    max_backoff: Duration,
}

impl KubeRegistrar {
    pub fn new(resolver: Arc<Resolver>, events: mpsc::Sender<WatchEvent>) -> Self {
        Self { resolver, events, tasks: Mutex::new(FxHashMap::default()), max_backoff: Duration::from_secs(30) }
    }

    pub fn with_max_backoff(mut self, max: Duration) -> Self {
        self.max_backoff = max;
        self
    }

    pub fn watched(&self) -> Vec<Gvk> {
        let mut v: Vec<Gvk> = self.tasks.lock().keys().cloned().collect();
        v.sort();
        v
    }
}

impl Drop for KubeRegistrar {
    fn drop(&mut self) {
        for (_, task) in self.tasks.lock().drain() {
            task.abort();
        }
    }
}

#[async_trait::async_trait]
impl WatchRegistrar for KubeRegistrar {
    async fn replace_watch(&self, gvks: &[Gvk]) -> Result<()> {
        let want: FxHashSet<&Gvk> = gvks.iter().collect();
        let missing: Vec<Gvk> = {
            let mut tasks = self.tasks.lock();
            tasks.retain(|gvk, task| {
                let keep = want.contains(gvk) && !task.is_finished();
                if !keep {
                    task.abort();
                    debug!(gvk = %gvk, "watch stopped");
                }
                keep
            });
            gvks.iter().filter(|g| !tasks.contains_key(*g)).cloned().collect()
        };

        let mut failed = Vec::new();
        for gvk in missing {
            match self.resolver.api(&gvk).await {
                Ok(api) => {
                    let task = tokio::spawn(run_watch(api, gvk.clone(), self.events.clone(), self.max_backoff));
                    self.tasks.lock().insert(gvk, task);
                }
                Err(e) => {
                    warn!(gvk = %gvk, error = %e, "watch registration failed");
                    failed.push(gvk.to_string());
                }
            }
        }
        if failed.is_empty() {
            Ok(())
        } else {
            Err(anyhow!("failed to register watches: {}", failed.join(", ")))
        }
    }
}

async fn run_watch(api: Api<DynamicObject>, gvk: Gvk, tx: mpsc::Sender<WatchEvent>, max_backoff: Duration) {
    let mut backoff = None;
    loop {
        let stream = watcher::watcher(api.clone(), watcher::Config::default());
        futures::pin_mut!(stream);
        info!(gvk = %gvk, "watcher started");
        loop {
            match stream.try_next().await {
                Ok(Some(ev)) => {
                    backoff = None;
                    if forward(&gvk, ev, &tx).await.is_err() {
                        debug!(gvk = %gvk, "event channel closed; watcher exiting");
                        return;
                    }
                }
                Ok(None) => {
                    warn!(gvk = %gvk, "watcher stream ended");
                    break;
                }
                Err(e) => {
                    warn!(gvk = %gvk, error = %e, "watcher stream error");
                    break;
                }
            }
        }
        if tx.is_closed() {
            return;
        }
        let delay = next_backoff(backoff, max_backoff);
        backoff = Some(delay);
        metrics::counter!("watch_restarts_total", 1u64);
        tokio::time::sleep(delay).await;
    }
}

async fn forward(gvk: &Gvk, ev: Event<DynamicObject>, tx: &mpsc::Sender<WatchEvent>) -> Result<()> {
    let send = |ev: WatchEvent| async move { tx.send(ev).await.map_err(|_| anyhow!("event channel closed")) };
    match ev {
        Event::Applied(o) => match object_from_dynamic(gvk, &o) {
            Ok(obj) => send(WatchEvent::Upsert(obj)).await?,
            Err(e) => warn!(gvk = %gvk, error = %e, "skipping undecodable object"),
        },
        Event::Deleted(o) => match object_from_dynamic(gvk, &o) {
            Ok(obj) => send(WatchEvent::Delete(obj)).await?,
            Err(e) => warn!(gvk = %gvk, error = %e, "skipping undecodable object"),
        },
        Event::Restarted(list) => {
            debug!(gvk = %gvk, count = list.len(), "watch restart");
            for o in list.iter() {
                match object_from_dynamic(gvk, o) {
                    Ok(obj) => send(WatchEvent::Upsert(obj)).await?,
                    Err(e) => warn!(gvk = %gvk, error = %e, "skipping undecodable object"),
                }
            }
        }
    }
    Ok(())
}
