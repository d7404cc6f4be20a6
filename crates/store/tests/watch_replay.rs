#![forbid(unsafe_code)]

use std::time::Duration;

use serde_json::json;
use tidal_core::{Event, EventType, ObjectStore, Resource, ResourceKind};
use tidal_store::MemStore;

fn kind() -> ResourceKind {
    "v1/ConfigMap".parse().unwrap()
}

fn cm(name: &str, ns: &str) -> Resource {
    Resource::new(kind(), Some(ns), name).with_spec(json!({ "v": 1 }))
}

async fn next(rx: &mut tokio::sync::mpsc::Receiver<Event>) -> Event {
    tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.expect("watch event").expect("open stream")
}

#[tokio::test]
async fn watch_replays_existing_then_streams_changes() {
    let store = MemStore::new();
    store.create(&cm("a", "ns1")).await.unwrap();
    store.create(&cm("b", "ns2")).await.unwrap();

    let mut h = store.watch(&kind(), None).await.unwrap();
    let first = next(&mut h.rx).await;
    let second = next(&mut h.rx).await;
    assert_eq!(first.event_type(), EventType::Create);
    assert_eq!(first.object().name(), "a");
    assert_eq!(second.object().name(), "b");

    let live = store.get(&cm("a", "ns1").key()).await.unwrap();
    let mut changed = live.clone();
    changed.set_field("spec", json!({ "v": 2 }));
    store.update(&changed).await.unwrap();
    match next(&mut h.rx).await {
        Event::Update { old, new } => {
            assert_eq!(old.spec(), Some(&json!({ "v": 1 })));
            assert_eq!(new.spec(), Some(&json!({ "v": 2 })));
        }
        other => panic!("unexpected {:?}", other),
    }

    store.delete(&live.key()).await.unwrap();
    assert_eq!(next(&mut h.rx).await.event_type(), EventType::Delete);
    h.cancel.cancel();
}

#[tokio::test]
async fn watch_filters_kind_and_namespace() {
    let store = MemStore::new();
    let mut h = store.watch(&kind(), Some("ns1")).await.unwrap();
    let secret = Resource::new("v1/Secret".parse().unwrap(), Some("ns1"), "s");
    store.create(&secret).await.unwrap();
    store.create(&cm("other", "ns2")).await.unwrap();
    store.create(&cm("mine", "ns1")).await.unwrap();
    let ev = next(&mut h.rx).await;
    assert_eq!(ev.object().name(), "mine");
    assert!(h.rx.try_recv().is_err());
}

#[tokio::test]
async fn touch_emits_generic_event() {
    let store = MemStore::new();
    let created = store.create(&cm("a", "ns")).await.unwrap();
    let mut h = store.watch(&kind(), None).await.unwrap();
    assert_eq!(next(&mut h.rx).await.event_type(), EventType::Create);
    store.touch(&created.key()).unwrap();
    assert_eq!(next(&mut h.rx).await.event_type(), EventType::Generic);
}

#[tokio::test]
async fn resource_versions_increase_per_object() {
    let store = MemStore::new();
    let mut h = store.watch(&kind(), None).await.unwrap();
    let mut cur = store.create(&cm("a", "ns")).await.unwrap();
    for i in 2..6 {
        cur.set_field("spec", json!({ "v": i }));
        cur = store.update(&cur).await.unwrap();
    }
    let mut last = 0u64;
    for _ in 0..5 {
        let ev = next(&mut h.rx).await;
        let rv: u64 = ev.object().resource_version().unwrap().parse().unwrap();
        assert!(rv > last);
        last = rv;
    }
}

#[tokio::test]
async fn lagged_watch_reports_deletes_missed_while_behind() {
    let store = MemStore::with_capacity(1);
    store.create(&cm("a", "ns")).await.unwrap();
    store.create(&cm("b", "ns")).await.unwrap();
    let mut h = store.watch(&kind(), None).await.unwrap();

    // The watch is stuck behind its replay while these overflow the fan-out buffer.
    store.delete(&cm("a", "ns").key()).await.unwrap();
    store.create(&cm("c", "ns")).await.unwrap();
    store.create(&cm("d", "ns")).await.unwrap();

    let mut seen = Vec::new();
    for _ in 0..6 {
        let ev = next(&mut h.rx).await;
        let done = ev.event_type() == EventType::Delete;
        seen.push((ev.event_type(), ev.object().name().to_string()));
        if done {
            break;
        }
    }
    assert!(seen.contains(&(EventType::Delete, "a".to_string())), "{:?}", seen);
    h.cancel.cancel();
}
