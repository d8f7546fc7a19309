//! Reconciliation logic for Vip resources.
//!
//! Every Vip in a watched namespace ends up with an address from the pool:
//!
//! - `ADDED`/`MODIFIED` without `spec.ipaddress`: allocate and patch it in
//! - `ADDED`/`MODIFIED` with an address: nothing to do
//! - `DELETED`: return the recorded address to the pool
//! - `ERROR`: logged only
//!
//! A full listing (start-up, expired watch cursor) first rebuilds the pool
//! from the addresses the listed Vips carry.

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use crds::Vip;
use reconcile_core::{EventHandler, Metrics, ResourceEvent, ResourceStore};
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::pool::{AddressPool, Release};

/// Reconciles Vip resources against the address pool.
pub struct IpamReconciler {
    store: Arc<dyn ResourceStore<Vip>>,
    pool: Arc<AddressPool>,
    metrics: Option<Metrics>,
}

impl std::fmt::Debug for IpamReconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IpamReconciler")
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

fn object_ref(vip: &Vip) -> (&str, &str) {
    (
        vip.metadata.namespace.as_deref().unwrap_or("default"),
        vip.metadata.name.as_deref().unwrap_or_default(),
    )
}

impl IpamReconciler {
    /// Creates a new reconciler instance.
    pub fn new(store: Arc<dyn ResourceStore<Vip>>, pool: Arc<AddressPool>) -> Self {
        Self {
            store,
            pool,
            metrics: None,
        }
    }

    /// Counts failed remote calls in `metrics`.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Makes sure `vip` carries an address.
    ///
    /// The patch is a JSON merge patch of `spec.ipaddress` guarded by the
    /// observed resourceVersion, so a stale event cannot overwrite an
    /// address assigned in the meantime. When the patch fails the address
    /// goes straight back to the pool; the next event for the Vip retries.
    pub async fn reconcile_vip(&self, vip: &Vip) {
        let (namespace, name) = object_ref(vip);
        if name.is_empty() {
            warn!("Ignoring Vip without a name in namespace {}", namespace);
            return;
        }

        if let Some(current) = vip.ipaddress() {
            if vip.address().is_none() {
                warn!(
                    "Vip {}/{} carries unparseable address {:?}, leaving it alone",
                    namespace, name, current
                );
            } else {
                debug!("Vip {}/{} already has address {}", namespace, name, current);
            }
            return;
        }

        let Some(addr) = self.pool.allocate() else {
            warn!(
                "Address pool exhausted, Vip {}/{} stays without an address",
                namespace, name
            );
            return;
        };
        info!("Allocated {} for Vip {}/{}", addr, namespace, name);

        let mut patch = json!({ "spec": { "ipaddress": addr.to_string() } });
        if let Some(rv) = vip.metadata.resource_version.as_deref() {
            patch["metadata"] = json!({ "resourceVersion": rv });
        }

        match self.store.patch(namespace, name, &patch).await {
            Ok(_) => info!("Patched Vip {}/{} with address {}", namespace, name, addr),
            Err(e) => {
                error!("Failed to patch Vip {}/{} with address {}: {}", namespace, name, addr, e);
                if let Some(metrics) = &self.metrics {
                    metrics.remote_fault("patch_vip");
                }
                self.pool.release(addr);
            }
        }
    }

    /// Returns the address recorded on a deleted Vip to the pool.
    pub fn release_vip(&self, vip: &Vip) {
        let (namespace, name) = object_ref(vip);
        let Some(raw) = vip.ipaddress() else {
            debug!("Deleted Vip {}/{} had no address", namespace, name);
            return;
        };
        let Ok(addr) = raw.parse::<IpAddr>() else {
            warn!(
                "Deleted Vip {}/{} carried unparseable address {:?}",
                namespace, name, raw
            );
            return;
        };

        match self.pool.release(addr) {
            Release::Returned => info!("Released {} from deleted Vip {}/{}", addr, namespace, name),
            Release::AlreadyFree => debug!("Address {} of Vip {}/{} was already free", addr, namespace, name),
            Release::OutOfRange => debug!(
                "Address {} of deleted Vip {}/{} is outside the configured ranges",
                addr, namespace, name
            ),
        }
    }
}

#[async_trait]
impl EventHandler<Vip> for IpamReconciler {
    async fn handle(&self, event: ResourceEvent<Vip>) {
        match event {
            ResourceEvent::Added(vip) | ResourceEvent::Modified(vip) => self.reconcile_vip(&vip).await,
            ResourceEvent::Deleted(vip) => self.release_vip(&vip),
            ResourceEvent::Error(fault) => warn!("Vip watch reported an error: {}", fault),
        }
    }

    /// Rebuilds the pool, then addresses every listed Vip that lacks one.
    ///
    /// `vips` only holds the watched namespaces. Addresses are taken from a
    /// cluster-wide listing so a Vip outside the filter still keeps its
    /// address out of the pool; if that listing fails the watched Vips are
    /// used instead.
    async fn resync(&self, vips: Vec<Vip>) {
        let held: Vec<IpAddr> = match self.store.list().await {
            Ok(listing) => listing.items.iter().filter_map(Vip::address).collect(),
            Err(e) => {
                warn!("Failed to list Vips in all namespaces, using watched ones only: {}", e);
                if let Some(metrics) = &self.metrics {
                    metrics.remote_fault("list_vips");
                }
                vips.iter().filter_map(Vip::address).collect()
            }
        };
        let in_use = self.pool.retain_in_use(held);
        info!(
            "Rebuilt address pool from {} watched Vips: {} addresses in use, {} free",
            vips.len(),
            in_use,
            self.pool.available()
        );

        for vip in vips.iter().filter(|vip| vip.ipaddress().is_none()) {
            self.reconcile_vip(vip).await;
        }
    }
}

#[cfg(test)]
#[path = "reconciler_test.rs"]
mod reconciler_test;
