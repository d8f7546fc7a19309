//! Unit tests for the IPAM reconciler

use super::*;
use crate::pool::AddressPool;
use reconcile_core::event::WatchFault;
use reconcile_core::{FibonacciBackoff, MemoryStore, NamespaceFilter, WatchLoop};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
}

fn setup(range: &str) -> (Arc<MemoryStore<Vip>>, Arc<AddressPool>, IpamReconciler) {
    let store = Arc::new(MemoryStore::<Vip>::new());
    let pool = Arc::new(AddressPool::from_cidrs(&[range]).unwrap());
    let reconciler = IpamReconciler::new(store.clone(), pool.clone());
    (store, pool, reconciler)
}

fn addressed(namespace: &str, service: &str, addr: &str) -> Vip {
    let mut vip = Vip::for_service(namespace, service);
    vip.spec.ipaddress = Some(addr.to_string());
    vip
}

fn address_of(store: &MemoryStore<Vip>, namespace: &str, name: &str) -> Option<String> {
    store
        .object(namespace, name)
        .and_then(|vip| vip.spec.ipaddress)
}

#[tokio::test]
async fn test_added_vip_gets_lowest_free_address() {
    let (store, pool, reconciler) = setup("10.0.0.0/29");
    let vip = store.insert(Vip::for_service("default", "web"));

    reconciler.handle(ResourceEvent::Added(vip)).await;

    assert_eq!(address_of(&store, "default", "web").as_deref(), Some("10.0.0.1"));
    assert!(!pool.is_free(ip("10.0.0.1")));
    assert_eq!(pool.available(), 5);
    assert_eq!(store.patches(), 1);
}

#[tokio::test]
async fn test_replayed_event_for_addressed_vip_is_noop() {
    let (store, pool, reconciler) = setup("10.0.0.0/29");
    let vip = store.insert(Vip::for_service("default", "web"));
    reconciler.handle(ResourceEvent::Added(vip)).await;
    let addressed = store.object("default", "web").unwrap();

    reconciler.handle(ResourceEvent::Added(addressed.clone())).await;
    reconciler.handle(ResourceEvent::Modified(addressed)).await;

    assert_eq!(store.patches(), 1);
    assert_eq!(pool.available(), 5);
}

#[tokio::test]
async fn test_deleted_vip_returns_address_once() {
    let (_store, pool, reconciler) = setup("10.0.0.0/28");
    pool.retain_in_use([ip("10.0.0.9")]);
    assert!(!pool.is_free(ip("10.0.0.9")));
    let vip = addressed("default", "web", "10.0.0.9");

    reconciler.handle(ResourceEvent::Deleted(vip.clone())).await;
    reconciler.handle(ResourceEvent::Deleted(vip)).await;

    assert!(pool.is_free(ip("10.0.0.9")));
    assert_eq!(pool.available(), 14);
}

#[tokio::test]
async fn test_deleted_vip_without_address_is_noop() {
    let (_store, pool, reconciler) = setup("10.0.0.0/30");
    let _ = pool.allocate();

    reconciler
        .handle(ResourceEvent::Deleted(Vip::for_service("default", "web")))
        .await;
    reconciler
        .handle(ResourceEvent::Deleted(addressed("default", "api", "garbage")))
        .await;

    assert_eq!(pool.available(), 1);
}

#[tokio::test]
async fn test_deleted_vip_outside_ranges_leaves_pool_alone() {
    let (_store, pool, reconciler) = setup("10.0.0.0/30");
    let _ = pool.allocate();

    reconciler
        .handle(ResourceEvent::Deleted(addressed("default", "web", "192.168.0.7")))
        .await;

    assert!(!pool.is_free(ip("192.168.0.7")));
    assert!(!pool.is_free(ip("10.0.0.1")));
    assert_eq!(pool.available(), 1);
}

#[tokio::test]
async fn test_exhausted_pool_leaves_vip_unaddressed() {
    let (store, pool, reconciler) = setup("10.0.0.0/30");
    for service in ["a", "b", "c"] {
        let vip = store.insert(Vip::for_service("default", service));
        reconciler.handle(ResourceEvent::Added(vip)).await;
    }

    assert_eq!(address_of(&store, "default", "a").as_deref(), Some("10.0.0.1"));
    assert_eq!(address_of(&store, "default", "b").as_deref(), Some("10.0.0.2"));
    assert_eq!(address_of(&store, "default", "c"), None);
    assert_eq!(pool.available(), 0);
    assert_eq!(store.patches(), 2);

    // An address freed later is picked up by the next event for the Vip
    let deleted = store.object("default", "a").unwrap();
    reconciler.handle(ResourceEvent::Deleted(deleted)).await;
    let pending = store.object("default", "c").unwrap();
    reconciler.handle(ResourceEvent::Modified(pending)).await;
    assert_eq!(address_of(&store, "default", "c").as_deref(), Some("10.0.0.1"));
}

#[tokio::test]
async fn test_failed_patch_returns_address() {
    let (store, pool, reconciler) = setup("10.0.0.0/30");
    let metrics = Metrics::new().unwrap();
    let reconciler = reconciler.with_metrics(metrics.clone());
    let vip = store.insert(Vip::for_service("default", "web"));
    store.fail_writes(true);

    reconciler.handle(ResourceEvent::Added(vip)).await;

    assert_eq!(address_of(&store, "default", "web"), None);
    assert_eq!(pool.available(), 2);
    assert_eq!(metrics.remote_faults("patch_vip"), 1);
}

#[tokio::test]
async fn test_stale_event_does_not_overwrite_address() {
    let (store, pool, reconciler) = setup("10.0.0.0/29");
    let stale = store.insert(Vip::for_service("default", "web"));
    store.insert(addressed("default", "web", "10.0.0.4"));
    pool.retain_in_use([ip("10.0.0.4")]);

    reconciler.handle(ResourceEvent::Modified(stale)).await;

    assert_eq!(address_of(&store, "default", "web").as_deref(), Some("10.0.0.4"));
    assert_eq!(pool.available(), 5);
    assert_eq!(store.patches(), 0);
}

#[tokio::test]
async fn test_error_event_leaves_pool_alone() {
    let (store, pool, reconciler) = setup("10.0.0.0/30");

    reconciler
        .handle(ResourceEvent::Error(WatchFault {
            code: 500,
            reason: "InternalError".to_string(),
            message: "boom".to_string(),
        }))
        .await;

    assert_eq!(pool.available(), 2);
    assert_eq!(store.patches(), 0);
}

#[tokio::test]
async fn test_resync_rebuilds_pool_and_fills_gaps() {
    let (store, pool, reconciler) = setup("10.0.0.0/29");
    let existing = store.insert(addressed("default", "web", "10.0.0.1"));
    let foreign = store.insert(addressed("default", "db", "192.168.0.7"));
    let pending = store.insert(Vip::for_service("default", "api"));

    reconciler.resync(vec![existing, foreign, pending]).await;

    assert!(!pool.is_free(ip("10.0.0.1")));
    assert_eq!(address_of(&store, "default", "api").as_deref(), Some("10.0.0.2"));
    assert_eq!(address_of(&store, "default", "db").as_deref(), Some("192.168.0.7"));
    assert_eq!(pool.available(), 4);
    assert_eq!(store.patches(), 1);
}

#[tokio::test]
async fn test_resync_keeps_addresses_of_unwatched_namespaces() {
    let (store, pool, reconciler) = setup("10.0.0.0/29");
    store.insert(addressed("team-b", "db", "10.0.0.1"));
    let pending = store.insert(Vip::for_service("default", "api"));

    // Only the watched namespace is handed over
    reconciler.resync(vec![pending]).await;

    assert!(!pool.is_free(ip("10.0.0.1")));
    assert_eq!(address_of(&store, "default", "api").as_deref(), Some("10.0.0.2"));
    assert_eq!(pool.available(), 4);
}

#[tokio::test]
async fn test_watch_loop_allocates_and_releases() {
    let (store, pool, reconciler) = setup("10.0.0.0/30");
    store.insert(addressed("default", "old", "10.0.0.1"));
    let token = CancellationToken::new();

    let watch_loop = WatchLoop::<Vip>::new(
        store.clone(),
        Arc::new(reconciler),
        NamespaceFilter::new(["default"]),
        token.clone(),
    )
    .with_backoff(FibonacciBackoff::new(0, 0));
    let handle = tokio::spawn(watch_loop.run());

    store.insert(Vip::for_service("default", "web"));
    store.insert(Vip::for_service("kube-system", "dns"));

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while address_of(&store, "default", "web").is_none() {
        assert!(tokio::time::Instant::now() < deadline, "Vip was never addressed");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(address_of(&store, "default", "web").as_deref(), Some("10.0.0.2"));
    assert_eq!(address_of(&store, "kube-system", "dns"), None);

    store.delete("default", "old", None).await.unwrap();
    while !pool.is_free(ip("10.0.0.1")) {
        assert!(tokio::time::Instant::now() < deadline, "address was never released");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    token.cancel();
    handle.await.unwrap();
}
