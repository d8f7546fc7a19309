//! Controller-specific error types.

use thiserror::Error;
use kube::Error as KubeError;

/// Errors that can occur in the VIP Load-Balancer Controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Kubernetes client could not be built
    #[error("Kubernetes error: {0}")]
    Kube(#[from] KubeError),

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
