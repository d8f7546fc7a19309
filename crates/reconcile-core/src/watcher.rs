//! Resumable watch/reconcile loop.
//!
//! One [`WatchLoop`] turns the change stream of one resource kind into
//! namespace-filtered calls on an [`EventHandler`]:
//!
//! 1. List all objects, hand the watched ones to `EventHandler::resync` and
//!    position the cursor at the listing's resource version.
//! 2. Watch from the cursor, dispatching each event and advancing the cursor.
//! 3. When the stream ends, reopen it from the cursor. When the server says
//!    the cursor is too old, go back to 1.
//!
//! The loop only exits when its cancellation token fires. A handler call in
//! progress is never interrupted.

use std::collections::BTreeSet;
use std::fmt::Debug;
use std::sync::Arc;

use futures::StreamExt;
use kube::Resource;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::backoff::FibonacciBackoff;
use crate::cursor::WatchCursor;
use crate::error::StoreError;
use crate::event::{EventHandler, ResourceEvent, WatchEvent};
use crate::metrics::Metrics;
use crate::server::Readiness;
use crate::store::{EventStream, ResourceStore};

/// Allow-list of namespaces whose events are dispatched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespaceFilter {
    namespaces: BTreeSet<String>,
}

impl NamespaceFilter {
    /// Filter accepting exactly the given namespaces.
    pub fn new<I, S>(namespaces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            namespaces: namespaces.into_iter().map(Into::into).collect(),
        }
    }

    /// True when objects in `namespace` should be handled.
    pub fn matches(&self, namespace: Option<&str>) -> bool {
        namespace.is_some_and(|ns| self.namespaces.contains(ns))
    }
}

impl std::fmt::Display for NamespaceFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let joined: Vec<&str> = self.namespaces.iter().map(String::as_str).collect();
        write!(f, "{}", joined.join(","))
    }
}

/// Why a watch session ended.
#[derive(Debug)]
enum SessionEnd {
    Cancelled,
    Closed { delivered: usize },
    Expired,
    Failed(StoreError),
}

/// Watch loop for one resource kind.
pub struct WatchLoop<K: Send + Sync + 'static> {
    resource: String,
    store: Arc<dyn ResourceStore<K>>,
    handler: Arc<dyn EventHandler<K>>,
    namespaces: NamespaceFilter,
    shutdown: CancellationToken,
    cursor: WatchCursor,
    backoff: FibonacciBackoff,
    metrics: Option<Metrics>,
    readiness: Option<Arc<Readiness>>,
}

impl<K: Send + Sync + 'static> Debug for WatchLoop<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchLoop")
            .field("resource", &self.resource)
            .field("namespaces", &self.namespaces)
            .field("cursor", &self.cursor)
            .finish_non_exhaustive()
    }
}

impl<K> WatchLoop<K>
where
    K: Resource + Clone + Debug + Send + Sync + 'static,
    K::DynamicType: Default,
{
    /// Creates a loop that starts with a full listing.
    pub fn new(
        store: Arc<dyn ResourceStore<K>>,
        handler: Arc<dyn EventHandler<K>>,
        namespaces: NamespaceFilter,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            resource: K::kind(&K::DynamicType::default()).into_owned(),
            store,
            handler,
            namespaces,
            shutdown,
            cursor: WatchCursor::default(),
            backoff: FibonacciBackoff::default(),
            metrics: None,
            readiness: None,
        }
    }

    /// Records events, restarts and resyncs in `metrics`.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Marks `readiness` once the first listing has been handled.
    #[must_use]
    pub fn with_readiness(mut self, readiness: Arc<Readiness>) -> Self {
        self.readiness = Some(readiness);
        self
    }

    /// Overrides the reconnect backoff.
    #[must_use]
    pub fn with_backoff(mut self, backoff: FibonacciBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Runs until the cancellation token fires.
    pub async fn run(mut self) {
        info!(
            "Starting {} watch loop for namespaces [{}]",
            self.resource, self.namespaces
        );

        while !self.shutdown.is_cancelled() {
            if self.cursor.is_expired() {
                if let Err(e) = self.resync().await {
                    warn!("Failed to list {} objects: {}", self.resource, e);
                    self.pause().await;
                    continue;
                }
            }

            let stream = match self.store.watch(&self.cursor).await {
                Ok(stream) => stream,
                Err(e) if e.is_gone() => {
                    warn!(
                        "{} watch cursor {} expired, relisting",
                        self.resource,
                        self.cursor.as_str()
                    );
                    self.record_restart("expired");
                    self.cursor.expire();
                    continue;
                }
                Err(e) => {
                    warn!("Failed to open {} watch: {}", self.resource, e);
                    self.record_restart("failed");
                    self.pause().await;
                    continue;
                }
            };

            match self.consume(stream).await {
                SessionEnd::Cancelled => break,
                SessionEnd::Closed { delivered } => {
                    debug!(
                        "{} watch stream closed after {} events, resuming from {}",
                        self.resource,
                        delivered,
                        self.cursor.as_str()
                    );
                    self.record_restart("closed");
                    if delivered == 0 {
                        self.pause().await;
                    } else {
                        self.backoff.reset();
                    }
                }
                SessionEnd::Expired => {
                    warn!(
                        "{} watch cursor {} expired, relisting",
                        self.resource,
                        self.cursor.as_str()
                    );
                    self.record_restart("expired");
                    self.cursor.expire();
                }
                SessionEnd::Failed(e) => {
                    warn!("{} watch stream failed: {}", self.resource, e);
                    self.record_restart("failed");
                    self.pause().await;
                }
            }
        }

        info!("{} watch loop stopped", self.resource);
    }

    /// Lists, hands the watched objects to the handler and repositions the cursor.
    async fn resync(&mut self) -> Result<(), StoreError> {
        let listing = self.store.list().await?;
        if listing.resource_version.is_empty() {
            return Err(StoreError::Api {
                code: 500,
                message: "list returned no resource version".to_string(),
            });
        }

        let objects: Vec<K> = listing
            .items
            .into_iter()
            .filter(|obj| self.namespaces.matches(obj.meta().namespace.as_deref()))
            .collect();
        info!(
            "Resyncing {} {} objects at resource version {}",
            objects.len(),
            self.resource,
            listing.resource_version
        );

        self.handler.resync(objects).await;
        self.cursor = WatchCursor::at(listing.resource_version);
        self.backoff.reset();

        if let Some(metrics) = &self.metrics {
            metrics.watch_resync(&self.resource);
        }
        if let Some(readiness) = self.readiness.take() {
            readiness.mark_ready();
        }
        Ok(())
    }

    async fn consume(&mut self, mut stream: EventStream<K>) -> SessionEnd {
        let mut delivered = 0;
        loop {
            let next = tokio::select! {
                biased;
                () = self.shutdown.cancelled() => return SessionEnd::Cancelled,
                next = stream.next() => next,
            };

            let event = match next {
                None => return SessionEnd::Closed { delivered },
                Some(Err(e)) if e.is_gone() => return SessionEnd::Expired,
                Some(Err(e)) => return SessionEnd::Failed(e),
                Some(Ok(event)) => event,
            };
            delivered += 1;

            match event {
                WatchEvent::Bookmark(resource_version) => {
                    self.cursor.advance(&resource_version);
                    continue;
                }
                WatchEvent::Error(fault) if fault.is_expired() => return SessionEnd::Expired,
                WatchEvent::Error(fault) => {
                    warn!("{} watch delivered error: {}", self.resource, fault);
                    self.dispatch(ResourceEvent::Error(fault)).await;
                }
                WatchEvent::Added(obj) => self.observe(obj, ResourceEvent::Added).await,
                WatchEvent::Modified(obj) => self.observe(obj, ResourceEvent::Modified).await,
                WatchEvent::Deleted(obj) => self.observe(obj, ResourceEvent::Deleted).await,
            }

            if self.shutdown.is_cancelled() {
                return SessionEnd::Cancelled;
            }
        }
    }

    async fn observe(&mut self, obj: K, wrap: fn(K) -> ResourceEvent<K>) {
        let meta = obj.meta();
        if let Some(resource_version) = meta.resource_version.as_deref() {
            self.cursor.advance(resource_version);
        }

        let namespace = meta.namespace.clone();
        let name = meta.name.clone().unwrap_or_default();
        if !self.namespaces.matches(namespace.as_deref()) {
            trace!(
                "Ignoring {} {}/{} outside watched namespaces",
                self.resource,
                namespace.as_deref().unwrap_or("<none>"),
                name
            );
            return;
        }

        let event = wrap(obj);
        info!(
            "Event: {} {} {}/{}",
            event.kind(),
            self.resource,
            namespace.as_deref().unwrap_or_default(),
            name
        );
        self.dispatch(event).await;
    }

    async fn dispatch(&self, event: ResourceEvent<K>) {
        if let Some(metrics) = &self.metrics {
            metrics.watch_event(&self.resource, event.kind());
        }
        self.handler.handle(event).await;
    }

    fn record_restart(&self, reason: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.watch_restart(&self.resource, reason);
        }
    }

    async fn pause(&mut self) {
        let delay = self.backoff.next_backoff();
        tokio::select! {
            () = self.shutdown.cancelled() => {}
            () = tokio::time::sleep(delay) => {}
        }
    }
}

#[cfg(test)]
#[path = "watcher_test.rs"]
mod watcher_test;
