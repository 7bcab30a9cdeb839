//! Engine metrics in a crate-local Prometheus registry.

use crate::error::FailureKind;
use once_cell::sync::Lazy;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

pub static PAIRS_ANALYZED: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new("kpi_pairs_analyzed_total", "(site, kpi) pairs analyzed")
        .expect("valid metric");
    REGISTRY.register(Box::new(c.clone())).expect("metric registered once");
    c
});

pub static PAIR_FAILURES: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new("kpi_pair_failures_total", "Pairs skipped, by failure kind"),
        &["kind"],
    )
    .expect("valid metric");
    REGISTRY.register(Box::new(c.clone())).expect("metric registered once");
    c
});

pub static CACHE_HITS: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new("kpi_cache_hits_total", "Pairs served from the result cache")
        .expect("valid metric");
    REGISTRY.register(Box::new(c.clone())).expect("metric registered once");
    c
});

pub static ANOMALIES_FLAGGED: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new("kpi_anomalies_flagged_total", "Points flagged by fusion")
        .expect("valid metric");
    REGISTRY.register(Box::new(c.clone())).expect("metric registered once");
    c
});

pub static PAIR_LATENCY: Lazy<Histogram> = Lazy::new(|| {
    let h = Histogram::with_opts(HistogramOpts::new(
        "kpi_pair_duration_seconds",
        "Detector and fusion time per pair",
    ))
    .expect("valid metric");
    REGISTRY.register(Box::new(h.clone())).expect("metric registered once");
    h
});

pub fn record_failure(kind: FailureKind) {
    PAIR_FAILURES.with_label_values(&[kind.label()]).inc();
}

/// Prometheus text exposition of every engine metric
pub fn render() -> String {
    // Touch each metric so it is registered before the first event.
    Lazy::force(&PAIRS_ANALYZED);
    Lazy::force(&PAIR_FAILURES);
    Lazy::force(&CACHE_HITS);
    Lazy::force(&ANOMALIES_FLAGGED);
    Lazy::force(&PAIR_LATENCY);

    TextEncoder::new()
        .encode_to_string(&REGISTRY.gather())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_lists_metrics() {
        record_failure(FailureKind::Timeout);
        CACHE_HITS.inc();
        let text = render();
        assert!(text.contains("kpi_pair_failures_total{kind=\"timeout\"}"));
        assert!(text.contains("kpi_cache_hits_total"));
        assert!(text.contains("kpi_pair_duration_seconds"));
    }
}
