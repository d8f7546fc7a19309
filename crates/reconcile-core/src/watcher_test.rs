//! Unit tests for the watch loop

use super::*;
use crate::event::WatchFault;
use crate::mock::MemoryStore;
use async_trait::async_trait;
use crds::Vip;
use std::sync::Mutex;
use std::time::Duration;

/// Records what the loop dispatched and stops it after `stop_after` events.
struct Recorder {
    events: Mutex<Vec<String>>,
    resyncs: Mutex<Vec<Vec<String>>>,
    stop_after: usize,
    token: CancellationToken,
}

impl Recorder {
    fn new(stop_after: usize) -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(Vec::new()),
            resyncs: Mutex::new(Vec::new()),
            stop_after,
            token: CancellationToken::new(),
        })
    }

    fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    fn resyncs(&self) -> Vec<Vec<String>> {
        self.resyncs.lock().unwrap().clone()
    }
}

fn describe(vip: &Vip) -> String {
    format!(
        "{}/{}",
        vip.metadata.namespace.as_deref().unwrap_or_default(),
        vip.metadata.name.as_deref().unwrap_or_default()
    )
}

#[async_trait]
impl EventHandler<Vip> for Recorder {
    async fn handle(&self, event: ResourceEvent<Vip>) {
        let line = match &event {
            ResourceEvent::Added(vip) | ResourceEvent::Modified(vip) | ResourceEvent::Deleted(vip) => {
                format!("{} {}", event.kind(), describe(vip))
            }
            ResourceEvent::Error(fault) => format!("ERROR {}", fault.code),
        };
        let count = {
            let mut events = self.events.lock().unwrap();
            events.push(line);
            events.len()
        };
        if count >= self.stop_after {
            self.token.cancel();
        }
    }

    async fn resync(&self, objects: Vec<Vip>) {
        self.resyncs
            .lock()
            .unwrap()
            .push(objects.iter().map(describe).collect());
    }
}

fn vip(namespace: &str, name: &str, resource_version: &str) -> Vip {
    let mut vip = Vip::for_service(namespace, name);
    vip.metadata.resource_version = Some(resource_version.to_string());
    vip
}

async fn run_loop(store: Arc<MemoryStore<Vip>>, recorder: Arc<Recorder>, namespaces: &[&str]) {
    let watch_loop = WatchLoop::<Vip>::new(
        store,
        recorder.clone(),
        NamespaceFilter::new(namespaces.iter().copied()),
        recorder.token.clone(),
    )
    .with_backoff(FibonacciBackoff::new(0, 0));

    tokio::time::timeout(Duration::from_secs(5), watch_loop.run())
        .await
        .expect("watch loop did not stop");
}

#[test]
fn test_namespace_filter() {
    let filter = NamespaceFilter::new(["default", "team-a"]);

    assert!(filter.matches(Some("default")));
    assert!(filter.matches(Some("team-a")));
    assert!(!filter.matches(Some("kube-system")));
    assert!(!filter.matches(None));
    assert_eq!(filter.to_string(), "default,team-a");
}

#[test]
fn test_expired_fault_detection() {
    let gone = WatchFault {
        code: 410,
        reason: "Expired".to_string(),
        message: "too old resource version".to_string(),
    };
    let internal = WatchFault {
        code: 500,
        reason: "InternalError".to_string(),
        message: "boom".to_string(),
    };

    assert!(gone.is_expired());
    assert!(!internal.is_expired());
}

#[tokio::test]
async fn test_initial_listing_then_watch_from_list_version() {
    let store = Arc::new(MemoryStore::<Vip>::new());
    store.insert(Vip::for_service("default", "a"));
    store.insert(Vip::for_service("default", "b"));
    store.insert(Vip::for_service("other", "c"));
    store.push_session(vec![Ok(WatchEvent::Added(vip("default", "d", "4")))]);

    let recorder = Recorder::new(1);
    run_loop(store.clone(), recorder.clone(), &["default"]).await;

    assert_eq!(
        recorder.resyncs(),
        vec![vec!["default/a".to_string(), "default/b".to_string()]]
    );
    assert_eq!(recorder.events(), vec!["ADDED default/d"]);
    assert_eq!(store.watch_cursors(), vec!["3"]);
}

#[tokio::test]
async fn test_reconnect_resumes_from_last_cursor() {
    let store = Arc::new(MemoryStore::<Vip>::new());
    store.insert(Vip::for_service("default", "a"));
    store.push_session(vec![
        Ok(WatchEvent::Added(vip("default", "b", "5"))),
        Ok(WatchEvent::Bookmark("7".to_string())),
    ]);
    store.push_session(vec![Ok(WatchEvent::Modified(vip("default", "b", "9")))]);

    let recorder = Recorder::new(2);
    run_loop(store.clone(), recorder.clone(), &["default"]).await;

    assert_eq!(recorder.events(), vec!["ADDED default/b", "MODIFIED default/b"]);
    assert_eq!(store.watch_cursors(), vec!["1", "7"]);
    assert_eq!(store.lists(), 1);
}

#[tokio::test]
async fn test_stream_failure_resumes_from_last_cursor() {
    let store = Arc::new(MemoryStore::<Vip>::new());
    store.push_session(vec![
        Ok(WatchEvent::Added(vip("default", "b", "2"))),
        Err(StoreError::Api {
            code: 500,
            message: "connection reset".to_string(),
        }),
    ]);
    store.push_session(vec![Ok(WatchEvent::Added(vip("default", "c", "3")))]);

    let recorder = Recorder::new(2);
    run_loop(store.clone(), recorder.clone(), &["default"]).await;

    assert_eq!(recorder.events(), vec!["ADDED default/b", "ADDED default/c"]);
    assert_eq!(store.watch_cursors(), vec!["0", "2"]);
    assert_eq!(store.lists(), 1);
}

#[tokio::test]
async fn test_expired_error_event_triggers_relist() {
    let store = Arc::new(MemoryStore::<Vip>::new());
    store.insert(Vip::for_service("default", "a"));
    store.push_session(vec![Ok(WatchEvent::Error(WatchFault {
        code: 410,
        reason: "Expired".to_string(),
        message: "too old resource version: 1 (5)".to_string(),
    }))]);
    store.push_session(vec![Ok(WatchEvent::Added(vip("default", "c", "6")))]);

    let recorder = Recorder::new(1);
    run_loop(store.clone(), recorder.clone(), &["default"]).await;

    // The expiry itself is not handed to the handler
    assert_eq!(recorder.events(), vec!["ADDED default/c"]);
    assert_eq!(store.lists(), 2);
    assert_eq!(recorder.resyncs().len(), 2);
}

#[tokio::test]
async fn test_gone_on_open_triggers_relist() {
    let store = Arc::new(MemoryStore::<Vip>::new());
    store.push_watch_error(StoreError::Gone("too old resource version".to_string()));
    store.push_session(vec![Ok(WatchEvent::Added(vip("default", "c", "2")))]);

    let recorder = Recorder::new(1);
    run_loop(store.clone(), recorder.clone(), &["default"]).await;

    assert_eq!(store.lists(), 2);
    assert_eq!(recorder.events(), vec!["ADDED default/c"]);
}

#[tokio::test]
async fn test_filtered_events_still_advance_cursor() {
    let store = Arc::new(MemoryStore::<Vip>::new());
    store.push_session(vec![Ok(WatchEvent::Added(vip("other", "x", "2")))]);
    store.push_session(vec![Ok(WatchEvent::Added(vip("default", "y", "3")))]);

    let recorder = Recorder::new(1);
    run_loop(store.clone(), recorder.clone(), &["default"]).await;

    assert_eq!(recorder.events(), vec!["ADDED default/y"]);
    assert_eq!(store.watch_cursors(), vec!["0", "2"]);
}

#[tokio::test]
async fn test_error_events_are_dispatched() {
    let store = Arc::new(MemoryStore::<Vip>::new());
    store.push_session(vec![Ok(WatchEvent::Error(WatchFault {
        code: 500,
        reason: "InternalError".to_string(),
        message: "etcd unavailable".to_string(),
    }))]);

    let recorder = Recorder::new(1);
    run_loop(store, recorder.clone(), &["default"]).await;

    assert_eq!(recorder.events(), vec!["ERROR 500"]);
}

#[tokio::test]
async fn test_stop_is_observed_between_events() {
    let store = Arc::new(MemoryStore::<Vip>::new());
    store.push_session(vec![
        Ok(WatchEvent::Added(vip("default", "a", "2"))),
        Ok(WatchEvent::Added(vip("default", "b", "3"))),
        Ok(WatchEvent::Added(vip("default", "c", "4"))),
    ]);

    let recorder = Recorder::new(1);
    run_loop(store, recorder.clone(), &["default"]).await;

    assert_eq!(recorder.events(), vec!["ADDED default/a"]);
}

#[tokio::test]
async fn test_stop_while_waiting_for_events() {
    let store = Arc::new(MemoryStore::<Vip>::new());
    let recorder = Recorder::new(usize::MAX);
    let token = recorder.token.clone();

    let handle = tokio::spawn(run_loop(store, recorder, &["default"]));
    tokio::time::sleep(Duration::from_millis(50)).await;
    token.cancel();

    handle.await.unwrap();
}

#[tokio::test]
async fn test_live_writes_are_delivered() {
    let store = Arc::new(MemoryStore::<Vip>::new());
    let recorder = Recorder::new(2);

    let handle = tokio::spawn(run_loop(store.clone(), recorder.clone(), &["default"]));
    while store.watch_cursors().is_empty() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    store.insert(Vip::for_service("default", "web"));
    store.delete("default", "web", None).await.unwrap();

    handle.await.unwrap();
    assert_eq!(recorder.events(), vec!["ADDED default/web", "DELETED default/web"]);
}

#[tokio::test]
async fn test_metrics_and_readiness() {
    let store = Arc::new(MemoryStore::<Vip>::new());
    store.push_session(vec![Ok(WatchEvent::Added(vip("default", "a", "2")))]);
    let recorder = Recorder::new(1);
    let metrics = Metrics::new().unwrap();
    let readiness = Readiness::new(1);

    let watch_loop = WatchLoop::<Vip>::new(
        store,
        recorder.clone(),
        NamespaceFilter::new(["default"]),
        recorder.token.clone(),
    )
    .with_metrics(metrics.clone())
    .with_readiness(readiness.clone())
    .with_backoff(FibonacciBackoff::new(0, 0));
    watch_loop.run().await;

    assert!(readiness.is_ready());
    assert_eq!(metrics.watch_events("Vip", "ADDED"), 1);
    assert_eq!(metrics.watch_resyncs("Vip"), 1);
}
