//! Prometheus metrics shared by both controllers.

use prometheus::{IntCounterVec, Opts, Registry};

/// Registry plus the watch-loop and remote-call counters.
///
/// Cloning is cheap; all clones feed the same registry.
#[derive(Debug, Clone)]
pub struct Metrics {
    registry: Registry,
    watch_events: IntCounterVec,
    watch_restarts: IntCounterVec,
    watch_resyncs: IntCounterVec,
    remote_faults: IntCounterVec,
}

impl Metrics {
    /// Creates the counters and registers them in a fresh registry.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let watch_events = IntCounterVec::new(
            Opts::new("vip_watch_events_total", "Watch events dispatched to handlers"),
            &["resource", "event"],
        )?;
        let watch_restarts = IntCounterVec::new(
            Opts::new("vip_watch_restarts_total", "Watch streams reopened"),
            &["resource", "reason"],
        )?;
        let watch_resyncs = IntCounterVec::new(
            Opts::new("vip_watch_resyncs_total", "Full list-and-resync passes"),
            &["resource"],
        )?;
        let remote_faults = IntCounterVec::new(
            Opts::new("vip_remote_faults_total", "Failed calls to the orchestration API"),
            &["operation"],
        )?;

        registry.register(Box::new(watch_events.clone()))?;
        registry.register(Box::new(watch_restarts.clone()))?;
        registry.register(Box::new(watch_resyncs.clone()))?;
        registry.register(Box::new(remote_faults.clone()))?;

        Ok(Self {
            registry,
            watch_events,
            watch_restarts,
            watch_resyncs,
            remote_faults,
        })
    }

    /// Registry for controller-specific metrics and the `/metrics` endpoint.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Counts one dispatched event.
    pub fn watch_event(&self, resource: &str, event: &str) {
        self.watch_events.with_label_values(&[resource, event]).inc();
    }

    /// Counts one reopened watch stream.
    pub fn watch_restart(&self, resource: &str, reason: &str) {
        self.watch_restarts.with_label_values(&[resource, reason]).inc();
    }

    /// Counts one full resync.
    pub fn watch_resync(&self, resource: &str) {
        self.watch_resyncs.with_label_values(&[resource]).inc();
    }

    /// Counts one failed remote call.
    pub fn remote_fault(&self, operation: &str) {
        self.remote_faults.with_label_values(&[operation]).inc();
    }

    /// Current value of the dispatched-events counter.
    pub fn watch_events(&self, resource: &str, event: &str) -> u64 {
        self.watch_events.with_label_values(&[resource, event]).get()
    }

    /// Current value of the restart counter.
    pub fn watch_restarts(&self, resource: &str, reason: &str) -> u64 {
        self.watch_restarts.with_label_values(&[resource, reason]).get()
    }

    /// Current value of the resync counter.
    pub fn watch_resyncs(&self, resource: &str) -> u64 {
        self.watch_resyncs.with_label_values(&[resource]).get()
    }

    /// Current value of the remote-fault counter.
    pub fn remote_faults(&self, operation: &str) -> u64 {
        self.remote_faults.with_label_values(&[operation]).get()
    }
}
