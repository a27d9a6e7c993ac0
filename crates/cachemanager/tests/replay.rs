#![forbid(unsafe_code)]

mod common;

use std::time::Duration;

use common::*;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tollgate_cachemanager::CacheError;
use tollgate_core::{Excluder, Process, WatchEvent};

#[tokio::test(start_paused = true)]
async fn failed_listing_recovers_with_backoff() {
    let h = harness();
    h.reader.set(&cm(), vec![obj(&cm(), "ns", "c1")]);
    h.reader.fail(&cm(), 2);

    h.manager.add_source(source("a"), vec![cm()]).unwrap();
    let r = h.manager.sync_once().await;
    assert!(r.listed.is_empty());
    assert_eq!(r.replaying, vec![cm()]);

    // inline list fails, first replay attempt fails, second succeeds after one backoff
    assert!(h.manager.settle().await.is_empty());
    assert_eq!(h.reader.calls(&cm()), 3);
    assert_eq!(h.store.names(&cm()), vec!["c1"]);
    assert!(h.manager.sync_once().await.is_noop());
}

#[tokio::test(start_paused = true)]
async fn exhausted_kind_is_retried_every_cycle() {
    let h = harness();
    h.reader.fail_always(&cm());
    h.manager.add_source(source("a"), vec![cm()]).unwrap();

    assert_eq!(h.manager.sync_once().await.replaying, vec![cm()]);
    assert_eq!(h.manager.settle().await, vec![cm()]);
    assert_eq!(h.reader.calls(&cm()), 1 + 3);

    let r = h.manager.sync_once().await;
    assert!(!r.watch_replaced);
    assert!(!r.wiped);
    assert_eq!(r.replaying, vec![cm()]);
    assert_eq!(h.manager.settle().await, vec![cm()]);
    assert_eq!(h.reader.calls(&cm()), 1 + 3 + 3);

    h.reader.heal(&cm());
    h.reader.set(&cm(), vec![obj(&cm(), "ns", "c1")]);
    assert_eq!(h.manager.sync_once().await.replaying, vec![cm()]);
    assert!(h.manager.settle().await.is_empty());
    assert_eq!(h.store.names(&cm()), vec!["c1"]);
    assert!(h.manager.sync_once().await.is_noop());
}

#[tokio::test(start_paused = true)]
async fn undesired_kinds_leave_the_relist_set() {
    let h = harness();
    h.reader.fail_always(&cm());
    h.manager.add_source(source("a"), vec![cm(), pod()]).unwrap();
    h.manager.sync_once().await;
    assert_eq!(h.manager.settle().await, vec![cm()]);

    h.manager.add_source(source("a"), vec![pod()]).unwrap();
    let r = h.manager.sync_once().await;
    assert!(r.wiped);
    assert_eq!(r.replaying, vec![pod()]);
    assert!(h.manager.settle().await.is_empty());
    let calls = h.reader.calls(&cm());
    assert!(h.manager.sync_once().await.is_noop());
    assert_eq!(h.reader.calls(&cm()), calls);
}

#[tokio::test(start_paused = true)]
async fn new_cycle_supersedes_running_replay() {
    let h = harness();
    h.reader.fail_always(&cm());
    h.manager.add_source(source("a"), vec![cm()]).unwrap();
    assert_eq!(h.manager.sync_once().await.replaying, vec![cm()]);
    assert!(h.manager.is_replaying().await);

    // a second failing kind arrives while the first worker is still going
    h.reader.fail_always(&secret());
    h.manager.add_source(source("b"), vec![secret()]).unwrap();
    let r = h.manager.sync_once().await;
    assert!(r.listed.is_empty());
    // the old worker's unfinished kind is folded into the new one
    assert_eq!(r.replaying, vec![cm(), secret()]);
    assert!(h.manager.is_replaying().await);
    assert_eq!(h.manager.settle().await, vec![cm(), secret()]);
}

#[tokio::test(start_paused = true)]
async fn start_reconciles_until_cancelled() {
    let h = harness();
    h.reader.set(&cm(), vec![obj(&cm(), "ns", "c1")]);
    h.manager.add_source(source("a"), vec![cm()]).unwrap();

    let token = CancellationToken::new();
    let manager = h.manager.clone();
    let loop_token = token.clone();
    let task = tokio::spawn(async move { manager.start(loop_token).await });

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(h.store.names(&cm()), vec!["c1"]);
    assert!(matches!(h.manager.start(CancellationToken::new()).await, Err(CacheError::AlreadyStarted)));

    // later source changes are picked up by the next tick
    h.reader.set(&pod(), vec![obj(&pod(), "ns", "p1")]);
    h.manager.add_source(source("b"), vec![pod()]).unwrap();
    tokio::time::sleep(h.manager.settings().interval * 2).await;
    assert_eq!(h.store.names(&pod()), vec!["p1"]);

    token.cancel();
    task.await.unwrap().unwrap();
    assert!(!h.manager.is_replaying().await);
}

#[tokio::test(start_paused = true)]
async fn start_returns_promptly_while_a_list_hangs() {
    let h = harness();
    h.reader.hang(&cm());
    h.manager.add_source(source("a"), vec![cm()]).unwrap();

    let token = CancellationToken::new();
    let manager = h.manager.clone();
    let loop_token = token.clone();
    let task = tokio::spawn(async move { manager.start(loop_token).await });

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.reader.calls(&cm()), 1);
    token.cancel();
    let res = tokio::time::timeout(Duration::from_secs(2), task).await;
    assert!(res.expect("start returns after cancellation").unwrap().is_ok());
    // the lock is free again and nothing is running
    assert!(!h.manager.is_replaying().await);

    // the abandoned kind is still queued and synced once the reader recovers
    h.reader.heal(&cm());
    h.reader.set(&cm(), vec![obj(&cm(), "ns", "c1")]);
    assert_eq!(h.manager.sync_once().await.replaying, vec![cm()]);
    assert!(h.manager.settle().await.is_empty());
    assert_eq!(h.store.names(&cm()), vec!["c1"]);
}

#[tokio::test(start_paused = true)]
async fn cancelling_start_stops_a_hanging_replay_worker() {
    let h = harness();
    h.reader.set(&cm(), vec![obj(&cm(), "ns", "c1")]);
    h.watch("a", vec![cm()]).await;

    let token = CancellationToken::new();
    let manager = h.manager.clone();
    let loop_token = token.clone();
    let task = tokio::spawn(async move { manager.start(loop_token).await });

    // an excluder change forces a replay of ConfigMaps, which then hangs
    h.reader.hang(&cm());
    let mut excluder = Excluder::new();
    excluder.add(Process::Sync, ["kube-system".to_string()]);
    h.manager.exclude_processes(excluder);
    tokio::time::sleep(h.manager.settings().interval * 2).await;
    assert!(h.manager.is_replaying().await);

    token.cancel();
    let res = tokio::time::timeout(Duration::from_secs(2), task).await;
    assert!(res.expect("start returns after cancellation").unwrap().is_ok());
    assert!(!h.manager.is_replaying().await);
    assert_eq!(h.manager.settle().await, vec![cm()]);
}

#[tokio::test]
async fn event_pump_applies_watch_events() {
    let h = harness();
    h.watch("a", vec![cm()]).await;
    let (tx, rx) = mpsc::channel(8);
    let pump = h.manager.spawn_event_pump(rx, CancellationToken::new());

    tx.send(WatchEvent::Upsert(obj(&cm(), "ns", "a"))).await.unwrap();
    tx.send(WatchEvent::Upsert(obj(&cm(), "ns", "b"))).await.unwrap();
    tx.send(WatchEvent::Delete(obj(&cm(), "ns", "a"))).await.unwrap();
    // unwatched kinds are dropped
    tx.send(WatchEvent::Upsert(obj(&pod(), "ns", "p"))).await.unwrap();
    drop(tx);
    pump.await.unwrap();

    assert_eq!(h.store.names(&cm()), vec!["b"]);
    assert!(h.store.names(&pod()).is_empty());
}

#[tokio::test]
async fn event_pump_stops_on_cancel() {
    let h = harness();
    let (_tx, rx) = mpsc::channel::<WatchEvent>(8);
    let token = CancellationToken::new();
    let pump = h.manager.spawn_event_pump(rx, token.clone());
    token.cancel();
    pump.await.unwrap();
}
