//! VIP IPAM Controller
//!
//! Assigns virtual IP addresses to `Vip` resources.
//!
//! This controller watches `Vip` custom resources in the configured
//! namespaces, allocates an address from the configured CIDR ranges for
//! every Vip lacking one, and returns the address to the pool when the Vip
//! is deleted.

mod config;
mod controller;
mod error;
mod pool;
mod reconciler;

use controller::Controller;
use crate::config::Config;
use crate::error::ControllerError;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    reconcile_core::telemetry::init();

    info!("Starting VIP IPAM Controller");

    // Load configuration from environment variables
    let config = Config::from_env()?;

    info!("Configuration:");
    info!("  Address ranges: {}", config.vip_ranges.join(", "));
    info!("  Namespaces: {}", config.namespaces.join(", "));
    info!("  Metrics address: {}", config.metrics_addr);

    // Initialize and run controller
    let controller = Controller::new(config).await?;
    controller.run().await?;

    Ok(())
}
