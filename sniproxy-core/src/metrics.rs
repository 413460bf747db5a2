//! Prometheus metrics (C11): session and packet counters for the UDP/QUIC
//! engine.
//!
//! Grounded on `connection.rs::ConnectionMetrics`'s field shapes (gauges and
//! counter-vecs registered against a caller-supplied `Registry`), retargeted
//! from TCP/protocol counters to the session/packet counters SPEC_FULL.md §3
//! names.

use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry};

/// UDP/QUIC session counters, registered once against the registry handed
/// in from `sniproxy-bin` (or left unregistered in tests that construct a
/// bare `Metrics::new` without a registry).
pub struct Metrics {
    pub sessions_active: IntGauge,
    pub sessions_total: IntCounterVec,
    pub bytes_transferred: IntCounterVec,
    pub sni_parse_errors: IntCounter,
    pub handler_drops: IntCounterVec,
    pub cid_reindex_total: IntCounter,
}

impl Metrics {
    pub fn new(registry: Option<&Registry>) -> Self {
        let sessions_active =
            IntGauge::new("sniproxy_sessions_active", "Currently active QUIC sessions").unwrap();
        let sessions_total = IntCounterVec::new(
            Opts::new("sniproxy_sessions_total", "Sessions created, by backend and outcome"),
            &["backend", "status"],
        )
        .unwrap();
        let bytes_transferred = IntCounterVec::new(
            Opts::new("sniproxy_bytes_transferred_total", "Bytes forwarded, by backend and direction"),
            &["backend", "direction"],
        )
        .unwrap();
        let sni_parse_errors = IntCounter::new(
            "sniproxy_sni_parse_errors_total",
            "ClientHello/SNI parse failures (dropped datagrams)",
        )
        .unwrap();
        let handler_drops = IntCounterVec::new(
            Opts::new("sniproxy_handler_drops_total", "Connections dropped by the handler chain, by reason"),
            &["reason"],
        )
        .unwrap();
        let cid_reindex_total = IntCounter::new(
            "sniproxy_cid_reindex_total",
            "Connection IDs learned from backend-sourced long-header packets",
        )
        .unwrap();

        if let Some(registry) = registry {
            registry.register(Box::new(sessions_active.clone())).ok();
            registry.register(Box::new(sessions_total.clone())).ok();
            registry.register(Box::new(bytes_transferred.clone())).ok();
            registry.register(Box::new(sni_parse_errors.clone())).ok();
            registry.register(Box::new(handler_drops.clone())).ok();
            registry.register(Box::new(cid_reindex_total.clone())).ok();
        }

        Self {
            sessions_active,
            sessions_total,
            bytes_transferred,
            sni_parse_errors,
            handler_drops,
            cid_reindex_total,
        }
    }

    /// Drop reason label, collapsing a handler's free-form `Drop(reason)`
    /// string down to a low-cardinality bucket so `handler_drops` doesn't
    /// grow an unbounded label set (e.g. per-unknown-SNI-hostname).
    pub fn drop_reason_label(reason: &str) -> &'static str {
        if reason.starts_with("unknown SNI") {
            "unknown_sni"
        } else if reason.starts_with("rate limited") {
            "rate_limited"
        } else if reason.contains("DNS") {
            "dns_failure"
        } else if reason.contains("dial") {
            "dial_failure"
        } else if reason.contains("terminator") {
            "terminator_unconfigured"
        } else {
            "other"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_without_panicking() {
        let registry = Registry::new();
        let metrics = Metrics::new(Some(&registry));
        metrics.sessions_active.inc();
        assert_eq!(metrics.sessions_active.get(), 1);
        assert!(!registry.gather().is_empty());
    }

    #[test]
    fn usable_without_a_registry() {
        let metrics = Metrics::new(None);
        metrics.sni_parse_errors.inc();
        assert_eq!(metrics.sni_parse_errors.get(), 1);
    }

    #[test]
    fn drop_reason_buckets_unknown_sni() {
        assert_eq!(
            Metrics::drop_reason_label("unknown SNI: foo.example"),
            "unknown_sni"
        );
        assert_eq!(Metrics::drop_reason_label("rate limited: 10 >= 10"), "rate_limited");
        assert_eq!(Metrics::drop_reason_label("something else"), "other");
    }
}
