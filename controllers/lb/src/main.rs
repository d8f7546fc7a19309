//! VIP Load-Balancer Controller
//!
//! Requests a virtual IP for every `LoadBalancer` Service.
//!
//! This controller creates a `Vip` resource for each LoadBalancer Service
//! in the configured namespaces, publishes the address the IPAM controller
//! assigns as the `com.citrix.vip` Service annotation, and deletes the Vip
//! when the Service goes away.

mod config;
mod controller;
mod error;
mod reconciler;

use controller::Controller;
use crate::config::Config;
use crate::error::ControllerError;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    reconcile_core::telemetry::init();

    info!("Starting VIP Load-Balancer Controller");

    // Load configuration from environment variables
    let config = Config::from_env()?;

    info!("Configuration:");
    info!("  Namespaces: {}", config.namespaces.join(", "));
    info!("  Metrics address: {}", config.metrics_addr);

    // Initialize and run controller
    let controller = Controller::new(config).await?;
    controller.run().await?;

    Ok(())
}
