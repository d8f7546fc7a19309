//! Configuration loaded from environment variables.

use std::env;
use std::net::SocketAddr;

use crate::error::ControllerError;

/// Address ranges used when `VIP_RANGE` is unset.
pub const DEFAULT_VIP_RANGE: &str = "172.31.254.0/24";
/// Namespace watched when `WATCH_NAMESPACES` is unset.
pub const DEFAULT_NAMESPACE: &str = "default";
/// Probe/metrics listen address when `METRICS_ADDR` is unset.
pub const DEFAULT_METRICS_ADDR: &str = "0.0.0.0:8080";

/// Controller configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// CIDR ranges addresses are allocated from (`VIP_RANGE`, JSON array)
    pub vip_ranges: Vec<String>,
    /// Namespaces whose Vips are reconciled (`WATCH_NAMESPACES`, comma-separated)
    pub namespaces: Vec<String>,
    /// Probe/metrics listen address (`METRICS_ADDR`)
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

        let vip_ranges = match value("VIP_RANGE") {
            Some(raw) => serde_json::from_str::<Vec<String>>(&raw).map_err(|e| {
                ControllerError::InvalidConfig(format!(
                    "VIP_RANGE must be a JSON array of CIDR strings: {}",
                    e
                ))
            })?,
            None => vec![DEFAULT_VIP_RANGE.to_string()],
        };
        if vip_ranges.is_empty() {
            return Err(ControllerError::InvalidConfig(
                "VIP_RANGE lists no address range".to_string(),
            ));
        }

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
            vip_ranges,
            namespaces,
            metrics_addr,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<Config, ControllerError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[]).unwrap();
        assert_eq!(config.vip_ranges, vec!["172.31.254.0/24"]);
        assert_eq!(config.namespaces, vec!["default"]);
        assert_eq!(config.metrics_addr, "0.0.0.0:8080".parse::<SocketAddr>().unwrap());
    }

    #[test]
    fn test_explicit_values() {
        let config = load(&[
            ("VIP_RANGE", r#"["10.0.0.0/30", "10.1.0.0/24"]"#),
            ("WATCH_NAMESPACES", "default, team-a,,team-b"),
            ("METRICS_ADDR", "127.0.0.1:9100"),
        ])
        .unwrap();
        assert_eq!(config.vip_ranges, vec!["10.0.0.0/30", "10.1.0.0/24"]);
        assert_eq!(config.namespaces, vec!["default", "team-a", "team-b"]);
        assert_eq!(config.metrics_addr.port(), 9100);
    }

    #[test]
    fn test_blank_values_take_defaults() {
        let config = load(&[("VIP_RANGE", "  "), ("WATCH_NAMESPACES", "")]).unwrap();
        assert_eq!(config.vip_ranges, vec![DEFAULT_VIP_RANGE]);
        assert_eq!(config.namespaces, vec![DEFAULT_NAMESPACE]);
    }

    #[test]
    fn test_malformed_values_are_rejected() {
        assert!(matches!(
            load(&[("VIP_RANGE", "10.0.0.0/24")]),
            Err(ControllerError::InvalidConfig(_))
        ));
        assert!(matches!(
            load(&[("VIP_RANGE", "[]")]),
            Err(ControllerError::InvalidConfig(_))
        ));
        assert!(matches!(
            load(&[("WATCH_NAMESPACES", " , ")]),
            Err(ControllerError::InvalidConfig(_))
        ));
        assert!(matches!(
            load(&[("METRICS_ADDR", "localhost")]),
            Err(ControllerError::InvalidConfig(_))
        ));
    }
}
