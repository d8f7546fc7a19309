//! Reconciliation logic for LoadBalancer Services and their Vips.
//!
//! Two watch loops feed the same reconciler. The Service side requests a
//! Vip for every LoadBalancer Service (get-or-create, named after the
//! Service) and deletes it again with the Service, or once the Service is
//! no longer a LoadBalancer. The Vip side publishes an assigned address on
//! the Service as the `com.citrix.vip` annotation, and deletes Vips whose
//! Service no longer exists.
//!
//! Both sides end in [`LoadBalancerReconciler::update_service_vip_annotation`]
//! and both checks are idempotent, so the end state is the same whichever
//! side sees the assigned address first.
//!
//! Annotation updates are a plain read-modify-write without retry. A
//! concurrent writer to the same Service makes the replace fail with a
//! conflict, which is logged; the next event for the Service or the Vip
//! applies the annotation again.

use std::sync::Arc;

use async_trait::async_trait;
use crds::{VIP_ANNOTATION_KEY, Vip};
use k8s_openapi::api::core::v1::Service;
use reconcile_core::{EventHandler, Metrics, ResourceEvent, ResourceStore, StoreError};
use tracing::{debug, error, info, warn};

/// Grace period passed when deleting a Vip.
pub const VIP_DELETE_GRACE_SECONDS: u32 = 30;

const LOAD_BALANCER: &str = "LoadBalancer";

/// Reconciles Services against Vip resources.
pub struct LoadBalancerReconciler {
    services: Arc<dyn ResourceStore<Service>>,
    vips: Arc<dyn ResourceStore<Vip>>,
    metrics: Option<Metrics>,
}

impl std::fmt::Debug for LoadBalancerReconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadBalancerReconciler").finish_non_exhaustive()
    }
}

fn is_load_balancer(service: &Service) -> bool {
    service
        .spec
        .as_ref()
        .and_then(|spec| spec.type_.as_deref())
        == Some(LOAD_BALANCER)
}

/// Current VIP annotation of a Service, if set and non-empty.
fn vip_annotation(service: &Service) -> Option<&str> {
    service
        .metadata
        .annotations
        .as_ref()
        .and_then(|annotations| annotations.get(VIP_ANNOTATION_KEY))
        .map(String::as_str)
        .filter(|value| !value.is_empty())
}

impl LoadBalancerReconciler {
    /// Creates a new reconciler instance.
    pub fn new(services: Arc<dyn ResourceStore<Service>>, vips: Arc<dyn ResourceStore<Vip>>) -> Self {
        Self {
            services,
            vips,
            metrics: None,
        }
    }

    /// Counts failed remote calls in `metrics`.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    fn record_fault(&self, operation: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.remote_fault(operation);
        }
    }

    /// Reacts to an added or modified Service.
    ///
    /// - LoadBalancer without annotation: get-or-create its Vip and annotate
    ///   right away if the Vip already has an address
    /// - LoadBalancer with annotation: nothing to do
    /// - any other type: a Vip left over from an earlier LoadBalancer phase
    ///   is deleted (so IPAM gets the address back) and a leftover
    ///   annotation removed
    pub async fn reconcile_service(&self, service: &Service) {
        let namespace = service.metadata.namespace.as_deref().unwrap_or("default");
        let Some(name) = service.metadata.name.as_deref() else {
            warn!("Ignoring Service without a name in namespace {}", namespace);
            return;
        };

        if !is_load_balancer(service) {
            debug!(
                "Service {}/{} is not of type {}, making sure it holds no VIP",
                namespace, name, LOAD_BALANCER
            );
            self.delete_vip(namespace, name).await;
            if vip_annotation(service).is_some() {
                self.remove_service_vip_annotation(namespace, name).await;
            }
            return;
        }

        if let Some(current) = vip_annotation(service) {
            debug!("Service {}/{} already annotated with {}", namespace, name, current);
            return;
        }

        let Some(vip) = self.read_or_create_vip(namespace, name).await else {
            return;
        };
        if let Some(address) = vip.ipaddress() {
            // The address arrived before this Service event
            self.update_service_vip_annotation(namespace, name, address).await;
        }
    }

    /// Reads the Vip named after `service`, creating it when absent.
    ///
    /// A create that loses a race against another writer counts as success;
    /// the Vip is read again in that case.
    pub async fn read_or_create_vip(&self, namespace: &str, service: &str) -> Option<Vip> {
        match self.vips.get(namespace, service).await {
            Ok(vip) => {
                debug!("Found Vip {}/{}", namespace, service);
                return Some(vip);
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => {
                error!("Failed to read Vip {}/{}: {}", namespace, service, e);
                self.record_fault("get_vip");
                return None;
            }
        }

        match self.vips.create(namespace, &Vip::for_service(namespace, service)).await {
            Ok(vip) => {
                info!("Created Vip {}/{} for Service {}", namespace, service, service);
                Some(vip)
            }
            Err(StoreError::AlreadyExists(_)) => {
                info!("Vip {}/{} was created concurrently", namespace, service);
                match self.vips.get(namespace, service).await {
                    Ok(vip) => Some(vip),
                    Err(e) => {
                        warn!("Failed to re-read Vip {}/{}: {}", namespace, service, e);
                        self.record_fault("get_vip");
                        None
                    }
                }
            }
            Err(e) => {
                error!("Failed to create Vip {}/{}: {}", namespace, service, e);
                self.record_fault("create_vip");
                None
            }
        }
    }

    /// Deletes the Vip `name`. A missing Vip is fine.
    pub async fn delete_vip(&self, namespace: &str, name: &str) {
        match self
            .vips
            .delete(namespace, name, Some(VIP_DELETE_GRACE_SECONDS))
            .await
        {
            Ok(()) => info!("Deleted Vip {}/{}", namespace, name),
            Err(e) if e.is_not_found() => debug!("Vip {}/{} already gone", namespace, name),
            Err(e) => {
                error!("Failed to delete Vip {}/{}: {}", namespace, name, e);
                self.record_fault("delete_vip");
            }
        }
    }

    /// Sets the VIP annotation of a LoadBalancer Service to `address`,
    /// keeping every other annotation.
    ///
    /// Returns `false` only when the Service does not exist.
    pub async fn update_service_vip_annotation(&self, namespace: &str, service: &str, address: &str) -> bool {
        let mut svc = match self.services.get(namespace, service).await {
            Ok(svc) => svc,
            Err(e) if e.is_not_found() => {
                warn!(
                    "Service {}/{} not found, cannot publish VIP {}",
                    namespace, service, address
                );
                return false;
            }
            Err(e) => {
                error!("Failed to read Service {}/{}: {}", namespace, service, e);
                self.record_fault("get_service");
                return true;
            }
        };

        if !is_load_balancer(&svc) {
            debug!(
                "Service {}/{} is not of type {}, not publishing VIP {}",
                namespace, service, LOAD_BALANCER, address
            );
            return true;
        }
        match vip_annotation(&svc) {
            Some(current) if current == address => {
                debug!("Service {}/{} already annotated with {}", namespace, service, address);
                return true;
            }
            Some(current) => warn!(
                "Service {}/{} annotated with {} but its Vip holds {}, overwriting",
                namespace, service, current, address
            ),
            None => {}
        }

        svc.metadata
            .annotations
            .get_or_insert_with(Default::default)
            .insert(VIP_ANNOTATION_KEY.to_string(), address.to_string());
        self.replace_service(namespace, service, &svc, "annotate").await;
        true
    }

    /// Removes the VIP annotation from a Service, keeping every other annotation.
    pub async fn remove_service_vip_annotation(&self, namespace: &str, service: &str) {
        let mut svc = match self.services.get(namespace, service).await {
            Ok(svc) => svc,
            Err(e) if e.is_not_found() => {
                warn!("Service {}/{} not found, nothing to unannotate", namespace, service);
                return;
            }
            Err(e) => {
                error!("Failed to read Service {}/{}: {}", namespace, service, e);
                self.record_fault("get_service");
                return;
            }
        };

        let removed = svc
            .metadata
            .annotations
            .as_mut()
            .and_then(|annotations| annotations.remove(VIP_ANNOTATION_KEY));
        if removed.is_none() {
            debug!("Service {}/{} has no VIP annotation", namespace, service);
            return;
        }
        self.replace_service(namespace, service, &svc, "unannotate").await;
    }

    async fn replace_service(&self, namespace: &str, service: &str, svc: &Service, action: &str) {
        match self.services.replace(namespace, service, svc).await {
            Ok(_) => info!("Service {}/{}: {} done", namespace, service, action),
            Err(StoreError::Conflict(msg)) => {
                warn!(
                    "Service {}/{} changed concurrently, {} skipped until the next event: {}",
                    namespace, service, action, msg
                );
                self.record_fault("replace_service");
            }
            Err(StoreError::NotFound(_)) => {
                warn!("Service {}/{} disappeared before {}", namespace, service, action);
            }
            Err(e) => {
                error!("Failed to {} Service {}/{}: {}", action, namespace, service, e);
                self.record_fault("replace_service");
            }
        }
    }

    /// Reacts to an added or modified Vip: publishes its address on the
    /// owning Service.
    ///
    /// Vips are only created for existing Services, so a Vip whose Service
    /// is gone missed the Service's `DELETED` event (for instance while this
    /// controller was down) and is deleted to return its address.
    pub async fn reconcile_vip(&self, vip: &Vip) {
        let namespace = vip.metadata.namespace.as_deref().unwrap_or("default");
        let name = vip.metadata.name.as_deref().unwrap_or_default();

        let Some(address) = vip.ipaddress() else {
            debug!("Vip {}/{} has no address yet", namespace, name);
            return;
        };
        if vip.address().is_none() {
            warn!("Vip {}/{} carries unparseable address {:?}", namespace, name, address);
            return;
        }

        let service = if vip.spec.service.is_empty() {
            name
        } else {
            vip.spec.service.as_str()
        };
        if service.is_empty() {
            warn!("Vip in namespace {} names no Service", namespace);
            return;
        }
        if !self.update_service_vip_annotation(namespace, service, address).await {
            info!("Vip {}/{} outlived Service {}, deleting it", namespace, name, service);
            self.delete_vip(namespace, name).await;
        }
    }
}

#[async_trait]
impl EventHandler<Service> for LoadBalancerReconciler {
    async fn handle(&self, event: ResourceEvent<Service>) {
        match event {
            ResourceEvent::Added(svc) | ResourceEvent::Modified(svc) => {
                self.reconcile_service(&svc).await;
            }
            ResourceEvent::Deleted(svc) => {
                let namespace = svc.metadata.namespace.as_deref().unwrap_or("default");
                if let Some(name) = svc.metadata.name.as_deref() {
                    self.delete_vip(namespace, name).await;
                }
            }
            ResourceEvent::Error(fault) => warn!("Service watch reported an error: {}", fault),
        }
    }
}

#[async_trait]
impl EventHandler<Vip> for LoadBalancerReconciler {
    async fn handle(&self, event: ResourceEvent<Vip>) {
        match event {
            ResourceEvent::Added(vip) | ResourceEvent::Modified(vip) => self.reconcile_vip(&vip).await,
            ResourceEvent::Deleted(vip) => debug!(
                "Vip {}/{} deleted",
                vip.metadata.namespace.as_deref().unwrap_or_default(),
                vip.metadata.name.as_deref().unwrap_or_default()
            ),
            ResourceEvent::Error(fault) => warn!("Vip watch reported an error: {}", fault),
        }
    }
}

#[cfg(test)]
#[path = "reconciler_test.rs"]
mod reconciler_test;
