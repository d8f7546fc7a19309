//! Configuration loaded from environment variables.

use std::env;
use std::net::SocketAddr;

use crate::error::ControllerError;

/// Namespace watched when `WATCH_NAMESPACES` is unset.
pub const DEFAULT_NAMESPACE: &str = "default";
/// Probe/metrics listen address when `METRICS_ADDR` is unset.
pub const DEFAULT_METRICS_ADDR: &str = "0.0.0.0:8080";

/// Controller configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Namespaces whose Services and Vips are reconciled
    pub namespaces: Vec<String>,
    /// Probe/metrics listen address
    pub metrics_addr: SocketAddr,
}

impl Config {
    /// Reads the configuration from the process environment.
    pub fn from_env() -> Result<Self, ControllerError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Reads the configuration through `lookup`; unset or blank values take defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ControllerError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let value = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let namespaces: Vec<String> = value("WATCH_NAMESPACES")
            .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string())
            .split(',')
            .map(str::trim)
            .filter(|ns| !ns.is_empty())
            .map(str::to_string)
            .collect();
        if namespaces.is_empty() {
            return Err(ControllerError::InvalidConfig(
                "WATCH_NAMESPACES lists no namespace".to_string(),
            ));
        }

        let raw_addr = value("METRICS_ADDR").unwrap_or_else(|| DEFAULT_METRICS_ADDR.to_string());
        let metrics_addr = raw_addr.trim().parse::<SocketAddr>().map_err(|e| {
            ControllerError::InvalidConfig(format!("METRICS_ADDR {:?} is not a socket address: {}", raw_addr, e))
        })?;

        Ok(Self {
            namespaces,
            metrics_addr,
        })
    }
}
