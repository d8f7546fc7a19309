//! Main controller implementation.
//!
//! This module contains the `Controller` struct that wires the address
//! pool, the Vip watch loop and the probe server together, and tears them
//! down again on SIGINT/SIGTERM.

use std::sync::Arc;

use crds::Vip;
use kube::Client;
use reconcile_core::{
    KubeStore, Metrics, NamespaceFilter, Readiness, ResourceStore, WatchLoop, server, shutdown,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::Config;
use crate::error::ControllerError;
use crate::pool::{AddressPool, PoolMetrics};
use crate::reconciler::IpamReconciler;

/// Main controller for VIP address management.
pub struct Controller {
    vip_watcher: JoinHandle<()>,
    probe_server: JoinHandle<std::io::Result<()>>,
    shutdown: CancellationToken,
}

impl Controller {
    /// Creates a new controller instance and starts its tasks.
    pub async fn new(config: Config) -> Result<Self, ControllerError> {
        info!("Initializing VIP IPAM Controller");

        let metrics = Metrics::new()?;
        let pool = AddressPool::from_cidrs(&config.vip_ranges)?
            .with_metrics(PoolMetrics::register(metrics.registry())?);
        info!(
            "Address pool built from {} ranges with {} addresses",
            pool.ranges().len(),
            pool.available()
        );

        // Create Kubernetes client
        let kube_client = Client::try_default().await?;
        let store: Arc<dyn ResourceStore<Vip>> = Arc::new(KubeStore::<Vip>::new(kube_client));

        let reconciler = IpamReconciler::new(Arc::clone(&store), Arc::new(pool))
            .with_metrics(metrics.clone());

        let shutdown = CancellationToken::new();
        let readiness = Readiness::new(1);

        let watch_loop = WatchLoop::new(
            store,
            Arc::new(reconciler),
            NamespaceFilter::new(config.namespaces.iter().map(String::as_str)),
            shutdown.clone(),
        )
        .with_metrics(metrics.clone())
        .with_readiness(Arc::clone(&readiness));

        // Start watcher and probe server in background tasks
        let vip_watcher = tokio::spawn(watch_loop.run());
        let probe_server = tokio::spawn(server::serve(
            config.metrics_addr,
            metrics,
            readiness,
            shutdown.clone(),
        ));

        Ok(Self {
            vip_watcher,
            probe_server,
            shutdown,
        })
    }

    /// Runs until SIGINT/SIGTERM, then waits for the watch loop to finish
    /// the event it is handling.
    pub async fn run(mut self) -> Result<(), ControllerError> {
        info!("VIP IPAM Controller running");

        let server_result = tokio::select! {
            () = shutdown::cancel_on_signal(self.shutdown.clone()) => None,
            result = &mut self.probe_server => {
                self.shutdown.cancel();
                Some(result)
            }
        };

        self.vip_watcher
            .await
            .map_err(|e| ControllerError::Watch(format!("Vip watcher panicked: {}", e)))?;

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

        info!("VIP IPAM Controller stopped");
        Ok(())
    }
}
