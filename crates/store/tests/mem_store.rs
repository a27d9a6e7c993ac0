#![forbid(unsafe_code)]

use tollgate_core::{DataStore, Gvk, Object};
use tollgate_store::MemStore;

fn obj(kind: &str, ns: Option<&str>, name: &str, rv: &str) -> Object {
    let mut meta = serde_json::json!({ "name": name, "resourceVersion": rv });
    if let Some(ns) = ns {
        meta["namespace"] = serde_json::Value::String(ns.to_string());
    }
    Object::new(Gvk::new("", "v1", kind), serde_json::json!({ "metadata": meta }))
}

#[tokio::test]
async fn upsert_replaces_by_identity() {
    let store = MemStore::new();
    store.add_data(&obj("ConfigMap", Some("ns"), "a", "1")).await.unwrap();
    store.add_data(&obj("ConfigMap", Some("ns"), "a", "2")).await.unwrap();
    // same name, different kind is a different object
    store.add_data(&obj("Secret", Some("ns"), "a", "1")).await.unwrap();
    assert_eq!(store.len(), 2);

    let key = obj("ConfigMap", Some("ns"), "a", "2").key().unwrap();
    let got = store.get(&key).unwrap();
    assert_eq!(got.raw()["metadata"]["resourceVersion"], "2");
    assert_eq!(store.kinds(), vec![Gvk::new("", "v1", "ConfigMap"), Gvk::new("", "v1", "Secret")]);
}

#[tokio::test]
async fn remove_is_idempotent_and_wipe_clears_everything() {
    let store = MemStore::new();
    let a = obj("Pod", Some("ns"), "a", "1");
    store.add_data(&a).await.unwrap();
    store.add_data(&obj("Node", None, "n1", "1")).await.unwrap();
    store.remove_data(&a).await.unwrap();
    store.remove_data(&a).await.unwrap();
    assert_eq!(store.len(), 1);
    assert!(!store.contains(&a.key().unwrap()));

    store.wipe_data().await.unwrap();
    assert!(store.is_empty());
}

#[tokio::test]
async fn unkeyable_objects_are_rejected() {
    let store = MemStore::new();
    let nameless = Object::new(Gvk::new("", "v1", "Pod"), serde_json::json!({ "metadata": {} }));
    let err = store.add_data(&nameless).await.unwrap_err();
    assert!(format!("{:#}", err).contains("metadata.name"));
    assert!(store.is_empty());
}

#[tokio::test]
async fn snapshots_are_frozen_per_epoch() {
    let store = MemStore::new();
    let mut rx = store.subscribe_epoch();
    store.add_data(&obj("Pod", Some("b"), "x", "1")).await.unwrap();
    store.add_data(&obj("Pod", Some("a"), "y", "1")).await.unwrap();
    assert_eq!(*rx.borrow_and_update(), 2);

    let s1 = store.current();
    assert_eq!(s1.epoch, 2);
    // ordered by key: namespace a before b
    assert_eq!(s1.objects[0].0.namespace.as_deref(), Some("a"));
    // no writes: same frozen snapshot
    assert!(std::sync::Arc::ptr_eq(&s1, &store.current()));

    store.wipe_data().await.unwrap();
    let s2 = store.current();
    assert_eq!(s2.epoch, 3);
    assert!(s2.is_empty());
    assert_eq!(s1.len(), 2);
    assert!(rx.has_changed().unwrap());
}
