//! Controller-specific error types.
//!
//! Only start-up can fail the process. Faults seen while handling events
//! are logged by the reconciler and never surface here.

use thiserror::Error;
use kube::Error as KubeError;

use crate::pool::PoolError;

/// Errors that can occur in the VIP IPAM Controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Kubernetes client could not be built
    #[error("Kubernetes error: {0}")]
    Kube(#[from] KubeError),

    /// Configured address ranges are unusable
    #[error("Address pool error: {0}")]
    Pool(#[from] PoolError),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Metric registration failed
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// Probe/metrics server failed
    #[error("Probe server error: {0}")]
    Server(#[from] std::io::Error),

    /// Watch task ended abnormally
    #[error("Resource watch failed: {0}")]
    Watch(String),
}
