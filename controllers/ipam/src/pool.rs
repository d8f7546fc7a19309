//! Address pool allocator.
//!
//! Expands the configured CIDR ranges into their usable host addresses and
//! hands them out one at a time. The pool is never persisted: on start-up
//! (and after a watch cursor expired) it is rebuilt from the configured
//! ranges minus the addresses carried by live Vip resources, see
//! [`AddressPool::retain_in_use`].

use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::{Mutex, MutexGuard, PoisonError};

use ipnet::IpNet;
use prometheus::{IntCounter, IntGauge, Registry};
use thiserror::Error;

/// Ranges with more host bits than this are rejected.
const MAX_HOST_BITS: u8 = 20;

/// Errors raised while building a pool from configuration.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Range is not valid CIDR syntax
    #[error("Invalid address range {range:?}: {source}")]
    InvalidRange {
        /// Offending range as configured
        range: String,
        /// Parser error
        #[source]
        source: ipnet::AddrParseError,
    },

    /// Range holds more than 2^20 addresses
    #[error("Address range {0} is too large (more than 2^20 addresses)")]
    RangeTooLarge(String),
}

/// Outcome of [`AddressPool::release`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    /// Address went back into the free set
    Returned,
    /// Address was already free; nothing changed
    AlreadyFree,
    /// Address is not a host of any configured range; nothing changed
    OutOfRange,
}

/// Prometheus instruments for the pool.
#[derive(Debug, Clone)]
pub struct PoolMetrics {
    available: IntGauge,
    allocations: IntCounter,
    exhausted: IntCounter,
}

impl PoolMetrics {
    /// Creates the pool instruments and registers them in `registry`.
    pub fn register(registry: &Registry) -> Result<Self, prometheus::Error> {
        let available = IntGauge::new("vip_pool_available", "Free addresses in the VIP pool")?;
        let allocations = IntCounter::new(
            "vip_pool_allocations_total",
            "Addresses handed out by the VIP pool",
        )?;
        let exhausted = IntCounter::new(
            "vip_pool_exhausted_total",
            "Allocation attempts that found the VIP pool empty",
        )?;

        registry.register(Box::new(available.clone()))?;
        registry.register(Box::new(allocations.clone()))?;
        registry.register(Box::new(exhausted.clone()))?;

        Ok(Self {
            available,
            allocations,
            exhausted,
        })
    }

    fn set_available(&self, count: usize) {
        self.available.set(i64::try_from(count).unwrap_or(i64::MAX));
    }
}

/// Free-address bookkeeping over a fixed set of ranges.
///
/// All methods take `&self`; the free set sits behind a mutex so the pool
/// can be shared through an `Arc`.
#[derive(Debug)]
pub struct AddressPool {
    ranges: Vec<IpNet>,
    hosts: BTreeSet<IpAddr>,
    free: Mutex<BTreeSet<IpAddr>>,
    metrics: Option<PoolMetrics>,
}

impl AddressPool {
    /// Builds a pool holding every usable host of the given ranges.
    ///
    /// Network and broadcast addresses are excluded (except for IPv4 /31
    /// and /32, which have none).
    pub fn from_cidrs<S: AsRef<str>>(cidrs: &[S]) -> Result<Self, PoolError> {
        let mut ranges = Vec::with_capacity(cidrs.len());
        for cidr in cidrs {
            let raw = cidr.as_ref().trim();
            let net: IpNet = raw.parse().map_err(|source| PoolError::InvalidRange {
                range: raw.to_string(),
                source,
            })?;
            if net.max_prefix_len() - net.prefix_len() > MAX_HOST_BITS {
                return Err(PoolError::RangeTooLarge(raw.to_string()));
            }
            ranges.push(net.trunc());
        }

        let hosts: BTreeSet<IpAddr> = ranges.iter().flat_map(IpNet::hosts).collect();
        Ok(Self {
            ranges,
            free: Mutex::new(hosts.clone()),
            hosts,
            metrics: None,
        })
    }

    /// Reports pool state to `metrics`.
    #[must_use]
    pub fn with_metrics(self, metrics: PoolMetrics) -> Self {
        metrics.set_available(self.available());
        Self {
            metrics: Some(metrics),
            ..self
        }
    }

    /// Configured ranges, normalised to their network address.
    pub fn ranges(&self) -> &[IpNet] {
        &self.ranges
    }

    /// Number of free addresses.
    pub fn available(&self) -> usize {
        self.lock().len()
    }

    /// True when `addr` is in the free set.
    pub fn is_free(&self, addr: IpAddr) -> bool {
        self.lock().contains(&addr)
    }

    /// Takes the lowest free address, or `None` when the pool is exhausted.
    pub fn allocate(&self) -> Option<IpAddr> {
        let mut free = self.lock();
        let addr = free.pop_first();
        if let Some(metrics) = &self.metrics {
            match addr {
                Some(_) => metrics.allocations.inc(),
                None => metrics.exhausted.inc(),
            }
            metrics.set_available(free.len());
        }
        addr
    }

    /// Puts `addr` back into the free set. Idempotent.
    pub fn release(&self, addr: IpAddr) -> Release {
        if !self.hosts.contains(&addr) {
            return Release::OutOfRange;
        }
        let mut free = self.lock();
        if !free.insert(addr) {
            return Release::AlreadyFree;
        }
        if let Some(metrics) = &self.metrics {
            metrics.set_available(free.len());
        }
        Release::Returned
    }

    /// Rebuilds the free set as every configured host not in `in_use`.
    ///
    /// Addresses outside the configured ranges are ignored. Returns how many
    /// configured hosts were found in use.
    pub fn retain_in_use<I>(&self, in_use: I) -> usize
    where
        I: IntoIterator<Item = IpAddr>,
    {
        let in_use: BTreeSet<IpAddr> = in_use
            .into_iter()
            .filter(|addr| self.hosts.contains(addr))
            .collect();

        let mut free = self.lock();
        *free = self.hosts.difference(&in_use).copied().collect();
        if let Some(metrics) = &self.metrics {
            metrics.set_available(free.len());
        }
        in_use.len()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeSet<IpAddr>> {
        // The set is consistent after every statement, so a poisoned lock is safe to reuse
        self.free.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
