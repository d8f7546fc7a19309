//! Main controller implementation.
//!
//! This module contains the `Controller` struct that runs the Service and
//! Vip watch loops side by side. Both loops share one reconciler and one
//! cancellation token; they coordinate only through the API server.

use std::sync::Arc;

use crds::Vip;
use k8s_openapi::api::core::v1::Service;
use kube::Client;
use reconcile_core::{
    EventHandler, KubeStore, Metrics, NamespaceFilter, Readiness, ResourceStore, WatchLoop, server, shutdown,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::Config;
use crate::error::ControllerError;
use crate::reconciler::LoadBalancerReconciler;

/// Main controller for LoadBalancer Services.
pub struct Controller {
    service_watcher: JoinHandle<()>,
    vip_watcher: JoinHandle<()>,
    probe_server: JoinHandle<std::io::Result<()>>,
    shutdown: CancellationToken,
}

impl Controller {
    /// Creates a new controller instance and starts its tasks.
    pub async fn new(config: Config) -> Result<Self, ControllerError> {
        info!("Initializing VIP Load-Balancer Controller");

        let metrics = Metrics::new()?;

        // Create Kubernetes client
        let kube_client = Client::try_default().await?;
        let services: Arc<dyn ResourceStore<Service>> =
            Arc::new(KubeStore::<Service>::new(kube_client.clone()));
        let vips: Arc<dyn ResourceStore<Vip>> = Arc::new(KubeStore::<Vip>::new(kube_client));

        let reconciler = Arc::new(
            LoadBalancerReconciler::new(Arc::clone(&services), Arc::clone(&vips))
                .with_metrics(metrics.clone()),
        );

        let shutdown = CancellationToken::new();
        let readiness = Readiness::new(2);
        let namespaces = NamespaceFilter::new(config.namespaces.iter().map(String::as_str));

        let service_handler: Arc<dyn EventHandler<Service>> = reconciler.clone();
        let vip_handler: Arc<dyn EventHandler<Vip>> = reconciler;

        let service_loop = WatchLoop::new(services, service_handler, namespaces.clone(), shutdown.clone())
            .with_metrics(metrics.clone())
            .with_readiness(Arc::clone(&readiness));

        let vip_loop = WatchLoop::new(vips, vip_handler, namespaces, shutdown.clone())
            .with_metrics(metrics.clone())
            .with_readiness(Arc::clone(&readiness));

        // Start watchers and probe server in background tasks
        let service_watcher = tokio::spawn(service_loop.run());
        let vip_watcher = tokio::spawn(vip_loop.run());
        let probe_server = tokio::spawn(server::serve(
            config.metrics_addr,
            metrics,
            readiness,
            shutdown.clone(),
        ));

        Ok(Self {
            service_watcher,
            vip_watcher,
            probe_server,
            shutdown,
        })
    }

    /// Runs until SIGINT/SIGTERM, then waits for both watch loops to finish
    /// the event they are handling.
    pub async fn run(mut self) -> Result<(), ControllerError> {
        info!("VIP Load-Balancer Controller running");

        let server_result = tokio::select! {
            () = shutdown::cancel_on_signal(self.shutdown.clone()) => None,
            result = &mut self.probe_server => {
                self.shutdown.cancel();
                Some(result)
            }
        };

        let (service_result, vip_result) = tokio::join!(self.service_watcher, self.vip_watcher);
        service_result
            .map_err(|e| ControllerError::Watch(format!("Service watcher panicked: {}", e)))?;
        vip_result.map_err(|e| ControllerError::Watch(format!("Vip watcher panicked: {}", e)))?;

        let server_result = match server_result {
            Some(result) => result,
            None => self.probe_server.await,
        };
        server_result
            .map_err(|e| ControllerError::Watch(format!("Probe server panicked: {}", e)))?
            .map_err(|e| {
                error!("Probe server failed: {}", e);
                ControllerError::Server(e)
            })?;

        info!("VIP Load-Balancer Controller stopped");
        Ok(())
    }
}
