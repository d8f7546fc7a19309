//! VIP CRD Definitions
//!
//! Kubernetes custom resource shared by the IPAM and load-balancer controllers.

pub mod vip;

pub use vip::*;
