//! Metrics collection for observability
//!
//! # Metrics
//!
//! - `claims_instances_provisioned_total` - Instances provisioned
//! - `claims_released_total{kind}` - Claims released, by distributor kind
//! - `claims_rejected_total{code}` - Rejected operations, by error code
//! - `claims_snapshots_opened_total` - Snapshot records appended
//! - `claims_upgrades_total` - Logic pointer replacements
//! - `claims_claim_duration_seconds` - Claim latency inside the actor
//!
//! Collectors live in a private [`Registry`], so several engines can run in
//! one process.

use crate::types::DistributorKind;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry};
use std::sync::Arc;

/// Metrics collector
#[derive(Clone)]
pub struct Metrics {
    /// Instances provisioned
    pub provisioned_total: IntCounter,

    /// Claims released per kind
    pub released_total: IntCounterVec,

    /// Rejections per error code
    pub rejected_total: IntCounterVec,

    /// Snapshot records appended
    pub snapshots_opened_total: IntCounter,

    /// Logic upgrades
    pub upgrades_total: IntCounter,

    /// Claim duration histogram
    pub claim_duration: Histogram,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics")
            .field("provisioned_total", &self.provisioned_total.get())
            .field("upgrades_total", &self.upgrades_total.get())
            .finish_non_exhaustive()
    }
}

impl Metrics {
    /// Create new metrics collector
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let provisioned_total = IntCounter::new(
            "claims_instances_provisioned_total",
            "Total number of instances provisioned",
        )?;
        registry.register(Box::new(provisioned_total.clone()))?;

        let released_total = IntCounterVec::new(
            Opts::new("claims_released_total", "Total number of claims released"),
            &["kind"],
        )?;
        registry.register(Box::new(released_total.clone()))?;

        let rejected_total = IntCounterVec::new(
            Opts::new("claims_rejected_total", "Total number of rejected operations"),
            &["code"],
        )?;
        registry.register(Box::new(rejected_total.clone()))?;

        let snapshots_opened_total = IntCounter::new(
            "claims_snapshots_opened_total",
            "Total number of snapshot records appended",
        )?;
        registry.register(Box::new(snapshots_opened_total.clone()))?;

        let upgrades_total =
            IntCounter::new("claims_upgrades_total", "Total number of logic upgrades")?;
        registry.register(Box::new(upgrades_total.clone()))?;

        let claim_duration = Histogram::with_opts(
            HistogramOpts::new(
                "claims_claim_duration_seconds",
                "Histogram of claim latencies",
            )
            .buckets(vec![0.0005, 0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 1.0]),
        )?;
        registry.register(Box::new(claim_duration.clone()))?;

        Ok(Self {
            provisioned_total,
            released_total,
            rejected_total,
            snapshots_opened_total,
            upgrades_total,
            claim_duration,
            registry,
        })
    }

    /// Record instance provisioning
    pub fn record_provisioned(&self) {
        self.provisioned_total.inc();
    }

    /// Record a released claim
    pub fn record_claim(&self, kind: DistributorKind, duration_seconds: f64) {
        self.released_total.with_label_values(&[kind.name()]).inc();
        self.claim_duration.observe(duration_seconds);
    }

    /// Record a rejected operation
    pub fn record_rejection(&self, code: &str) {
        self.rejected_total.with_label_values(&[code]).inc();
    }

    /// Record a snapshot record appended
    pub fn record_snapshot_opened(&self) {
        self.snapshots_opened_total.inc();
    }

    /// Record a logic upgrade
    pub fn record_upgrade(&self) {
        self.upgrades_total.inc();
    }

    /// Get metrics registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Text exposition of all collectors
    pub fn encode_text(&self) -> String {
        use prometheus::Encoder;

        let mut buffer = Vec::new();
        let encoder = prometheus::TextEncoder::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buffer) {
            tracing::warn!(error = %e, "Failed to encode metrics");
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}
