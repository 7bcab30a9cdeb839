use chrono::{Duration, TimeZone, Utc};
use kpi_core::algo::normalize::{min_max, robust};
use kpi_core::config::{FusionConfig, FusionWeights};
use kpi_core::fusion::fuse;
use kpi_core::{AnomalyVerdict, ReportScope, Severity, VotePolicy, build_report};
use proptest::prelude::*;
use std::collections::BTreeSet;

const SITES: [&str; 3] = ["SITE_001", "SITE_002", "SITE_003"];
const KPIS: [&str; 4] = ["SINR", "RSRP", "DL_Throughput", "Packet_Loss"];

fn fusion(policy: VotePolicy, shape_threshold: f64, density_threshold: f64, shape_weight: f64) -> FusionConfig {
    FusionConfig {
        policy,
        shape_threshold,
        density_threshold,
        weights: FusionWeights {
            shape: shape_weight,
            density: 1.0 - shape_weight,
        },
        ..FusionConfig::default()
    }
}

fn verdict((site, kpi, hour, value, flagged): (usize, usize, i64, f64, bool)) -> AnomalyVerdict {
    AnomalyVerdict {
        site_id: SITES[site].to_string(),
        kpi_name: KPIS[kpi].to_string(),
        timestamp: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::hours(hour),
        value,
        is_anomaly: flagged,
        confidence: if flagged { 0.8 } else { 0.1 },
        severity: if flagged { Severity::High } else { Severity::None },
        shape_score: 0.5,
        density_score: 0.5,
        contributing_detectors: BTreeSet::new(),
    }
}

fn verdicts() -> impl Strategy<Value = Vec<AnomalyVerdict>> {
    prop::collection::vec(
        (0..SITES.len(), 0..KPIS.len(), 0i64..240, -120.0f64..120.0, any::<bool>()),
        0..200,
    )
    .prop_map(|rows| rows.into_iter().map(verdict).collect())
}

proptest! {
    #[test]
    fn prop_and_flags_subset_of_or(
        shape in 0.0f64..=1.0,
        density in 0.0f64..=1.0,
        shape_threshold in 0.01f64..=1.0,
        density_threshold in 0.01f64..=1.0,
        shape_weight in 0.0f64..=1.0,
    ) {
        let and = fuse(shape, density, &fusion(VotePolicy::And, shape_threshold, density_threshold, shape_weight));
        let or = fuse(shape, density, &fusion(VotePolicy::Or, shape_threshold, density_threshold, shape_weight));

        prop_assert!(!and.is_anomaly || or.is_anomaly);
        prop_assert_eq!(and.confidence, or.confidence);
        prop_assert!((0.0..=1.0).contains(&or.confidence));
        if or.is_anomaly {
            prop_assert!(!or.contributing.is_empty());
        }
    }

    #[test]
    fn prop_report_breakdowns_sum_to_total(
        verdicts in verdicts(),
        bounds in prop::option::of((0i64..240, 0i64..240)),
        site in prop::option::of(0..SITES.len()),
    ) {
        let mut scope = ReportScope::all();
        if let Some((a, b)) = bounds {
            let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
            scope.start = Some(t0 + Duration::hours(a.min(b)));
            scope.end = Some(t0 + Duration::hours(a.max(b)));
        }
        if let Some(site) = site {
            scope = scope.with_site(SITES[site]);
        }

        let report = build_report(&verdicts, &scope, Vec::new());

        let per_kpi: usize = report.per_kpi.values().map(|k| k.anomalies).sum();
        let per_site: usize = report.per_site.values().map(|s| s.anomalies).sum();
        let per_day: usize = report.per_day.values().map(|d| d.anomalies).sum();
        let points: usize = report.per_kpi.values().map(|k| k.points).sum();
        prop_assert_eq!(per_kpi, report.anomaly_count);
        prop_assert_eq!(per_site, report.anomaly_count);
        prop_assert_eq!(per_day, report.anomaly_count);
        prop_assert_eq!(points, report.total_points);

        prop_assert!((0.0..=1.0).contains(&report.rate));
        if report.total_points > 0 {
            prop_assert_eq!(report.rate, report.anomaly_count as f64 / report.total_points as f64);
        } else {
            prop_assert_eq!(report.rate, 0.0);
        }
        prop_assert_eq!(report.peak_day.is_some(), report.anomaly_count > 0);
    }

    #[test]
    fn prop_normalization_bounded_and_order_preserving(
        raw in prop::collection::vec(0.0f64..50.0, 1..120),
        z_cap in 1.0f64..10.0,
    ) {
        for scaled in [min_max(&raw), robust(&raw, z_cap)] {
            prop_assert_eq!(scaled.len(), raw.len());
            prop_assert!(scaled.iter().all(|s| (0.0..=1.0).contains(s)));
            for i in 0..raw.len() {
                for j in 0..raw.len() {
                    if raw[i] < raw[j] {
                        prop_assert!(scaled[i] <= scaled[j]);
                    }
                }
            }
        }
    }
}
