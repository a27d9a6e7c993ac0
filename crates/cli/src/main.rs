use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tokio::signal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tollgate_cachemanager::{CacheManager, CacheManagerConfig, Settings};
use tollgate_core::{Excluder, Gvk, Process, SourceKey, WatchEvent};
use tollgate_kubehub::{KubeReader, KubeRegistrar, Resolver};
use tollgate_readiness::Tracker;
use tollgate_store::MemStore;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "tollgatectl", version, about = "Tollgate cache manager CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(clap::Args, Debug)]
struct SyncArgs {
    /// GVK to mirror, e.g. "v1/ConfigMap" or "apps/v1/Deployment" (repeatable)
    #[arg(long = "sync", required = true)]
    sync: Vec<String>,
    /// Namespace pattern excluded from sync: exact, "prefix-*" or "*-suffix" (repeatable)
    #[arg(long = "exclude-ns")]
    exclude_ns: Vec<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Discover served resources (incl. CRDs)
    Discover,
    /// Reconcile once, wait for replay and print the mirrored objects
    Once {
        #[command(flatten)]
        args: SyncArgs,
        /// Max seconds to wait for replay to settle
        #[arg(long = "wait-secs", default_value_t = 30)]
        wait_secs: u64,
    },
    /// Run the cache manager until Ctrl-C
    Run {
        #[command(flatten)]
        args: SyncArgs,
        /// Reconciliation interval
        #[arg(long = "interval-secs", env = "TOLLGATE_INTERVAL_SECS", default_value_t = 3)]
        interval_secs: u64,
    },
}

fn init_tracing() {
    let env = std::env::var("TOLLGATE_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("TOLLGATE_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid TOLLGATE_METRICS_ADDR; expected host:port");
        }
    }
}

impl SyncArgs {
    fn gvks(&self) -> Result<Vec<Gvk>> {
        self.sync.iter().map(|s| s.parse::<Gvk>().with_context(|| format!("parsing --sync {}", s))).collect()
    }

    fn excluder(&self) -> Excluder {
        let mut excluder = Excluder::new();
        excluder.add(Process::Sync, self.exclude_ns.iter().cloned());
        excluder
    }
}

struct Wiring {
    manager: CacheManager,
    store: Arc<MemStore>,
    tracker: Arc<Tracker>,
    events: mpsc::Receiver<WatchEvent>,
}

async fn wire(excluder: Excluder, settings: Settings) -> Result<Wiring> {
    let client = kube::Client::try_default().await.context("building kube client")?;
    let resolver = Arc::new(Resolver::new(client));
    let cap = std::env::var("TOLLGATE_QUEUE_CAP").ok().and_then(|s| s.parse::<usize>().ok()).unwrap_or(2048);
    let (tx, events) = mpsc::channel(cap);
    let store = Arc::new(MemStore::new());
    let tracker = Arc::new(Tracker::new());
    let manager = CacheManager::new(
        CacheManagerConfig::new()
            .store(store.clone())
            .registrar(Arc::new(KubeRegistrar::new(resolver.clone(), tx)))
            .reader(Arc::new(KubeReader::new(resolver)))
            .tracker(tracker.clone())
            .excluder(excluder)
            .settings(settings),
    )?;
    Ok(Wiring { manager, store, tracker, events })
}

fn cli_source() -> SourceKey { SourceKey::new("cli", "tollgatectl") }

#[derive(serde::Serialize)]
struct Row<'a> {
    gvk: String,
    namespace: Option<&'a str>,
    name: &'a str,
}

fn print_store(store: &MemStore, output: Output) -> Result<()> {
    let snap = store.current();
    match output {
        Output::Human => {
            println!("{:<32} {:<20} NAME", "KIND", "NAMESPACE");
            for (key, _) in &snap.objects {
                println!("{:<32} {:<20} {}", key.gvk.to_string(), key.namespace.as_deref().unwrap_or("-"), key.name);
            }
        }
        Output::Json => {
            let rows: Vec<Row<'_>> = snap
                .objects
                .iter()
                .map(|(k, _)| Row { gvk: k.gvk.to_string(), namespace: k.namespace.as_deref(), name: &k.name })
                .collect();
            println!("{}", serde_json::to_string_pretty(&rows)?);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Discover => {
            info!("discover invoked");
            let client = kube::Client::try_default().await.context("building kube client")?;
            let resources = tollgate_kubehub::discover(client).await?;
            match cli.output {
                Output::Human => {
                    for r in resources {
                        let scope = if r.namespaced { "namespaced" } else { "cluster" };
                        println!("{} • {}", r.gvk(), scope);
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&resources)?),
            }
        }
        Commands::Once { args, wait_secs } => {
            let gvks = args.gvks()?;
            info!(count = gvks.len(), "once invoked");
            let w = wire(args.excluder(), Settings::default()).await?;
            w.manager.add_source(cli_source(), gvks)?;
            let report = w.manager.sync_once().await;
            info!(listed = report.listed.len(), replaying = report.replaying.len(), "cycle done");
            match tokio::time::timeout(Duration::from_secs(wait_secs), w.manager.settle()).await {
                Ok(left) if left.is_empty() => {}
                Ok(left) => warn!(left = ?left, "some kinds could not be listed"),
                Err(_) => warn!(wait_secs, "replay did not settle in time"),
            }
            drop(w.events);
            print_store(&w.store, cli.output)?;
        }
        Commands::Run { args, interval_secs } => {
            init_metrics();
            let gvks = args.gvks()?;
            let settings = Settings { interval: Duration::from_secs(interval_secs.max(1)), ..Settings::default() };
            let w = wire(args.excluder(), settings).await?;
            w.manager.add_source(cli_source(), gvks)?;

            let token = CancellationToken::new();
            let pump = w.manager.spawn_event_pump(w.events, token.clone());
            let reconciler = tokio::spawn({
                let manager = w.manager.clone();
                let token = token.clone();
                async move { manager.start(token).await }
            });

            let mut epochs = w.store.subscribe_epoch();
            let mut ready_check = tokio::time::interval(Duration::from_secs(1));
            let mut ready = false;
            loop {
                tokio::select! {
                    _ = signal::ctrl_c() => {
                        info!("Ctrl-C received; shutting down");
                        break;
                    }
                    changed = epochs.changed() => {
                        if changed.is_err() { break; }
                    }
                    _ = ready_check.tick(), if !ready => {}
                }
                if !ready && w.tracker.satisfied() {
                    ready = true;
                    info!(objects = w.store.len(), "cache ready");
                }
            }

            token.cancel();
            if let Err(e) = pump.await {
                error!(error = %e, "event pump task failed");
            }
            match reconciler.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(error = %e, "reconciler failed"),
                Err(e) => error!(error = %e, "reconciler task failed"),
            }
            let report = w.manager.report_sync_metrics();
            info!(objects = report.total(), "stopped");
        }
    }

    Ok(())
}
