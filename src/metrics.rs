//! Prometheus counters for the sync path, on a private registry so several
//! engines can coexist in one process (and in tests).

use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

pub struct SyncMetrics {
    registry: Registry,
    /// Events applied to the store, by channel (`new_marker` / `approval`).
    pub events_applied: IntCounterVec,
    pub decode_failures: IntCounter,
    pub duplicates_dropped: IntCounter,
    pub approvals_published: IntCounter,
    pub approvals_republished: IntCounter,
    pub approvals_rolled_back: IntCounter,
    pub connect_failures: IntCounter,
}

impl SyncMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new_custom(Some("roadwatch".into()), None)?;

        let events_applied = IntCounterVec::new(
            Opts::new("events_applied_total", "Marker events applied to the store"),
            &["channel"],
        )?;
        let decode_failures = IntCounter::new(
            "decode_failures_total",
            "Inbound payloads dropped because they failed to decode",
        )?;
        let duplicates_dropped = IntCounter::new(
            "duplicates_dropped_total",
            "Inbound payloads dropped by the duplicate-delivery window",
        )?;
        let approvals_published = IntCounter::new(
            "approvals_published_total",
            "Local approvals handed to the broker",
        )?;
        let approvals_republished = IntCounter::new(
            "approvals_republished_total",
            "Local approvals re-published because their echo was overdue",
        )?;
        let approvals_rolled_back = IntCounter::new(
            "approvals_rolled_back_total",
            "Local approvals abandoned after failed publishes or a missing echo",
        )?;
        let connect_failures =
            IntCounter::new("connect_failures_total", "Failed broker connect attempts")?;

        registry.register(Box::new(events_applied.clone()))?;
        registry.register(Box::new(decode_failures.clone()))?;
        registry.register(Box::new(duplicates_dropped.clone()))?;
        registry.register(Box::new(approvals_published.clone()))?;
        registry.register(Box::new(approvals_republished.clone()))?;
        registry.register(Box::new(approvals_rolled_back.clone()))?;
        registry.register(Box::new(connect_failures.clone()))?;

        Ok(Self {
            registry,
            events_applied,
            decode_failures,
            duplicates_dropped,
            approvals_published,
            approvals_republished,
            approvals_rolled_back,
            connect_failures,
        })
    }

    /// Prometheus text exposition of every counter.
    pub fn render(&self) -> String {
        let mut buf = Vec::new();
        if let Err(e) = TextEncoder::new().encode(&self.registry.gather(), &mut buf) {
            tracing::warn!("Failed to encode metrics: {e}");
            return String::new();
        }
        String::from_utf8(buf).unwrap_or_default()
    }
}
