//! Voting Fusion
//!
//! Turns the two normalized detector scores for a timestamp into one verdict.
//! Confidence is always the weighted combination, whichever policy decides
//! `is_anomaly`, so verdicts stay comparable across policies.

use crate::config::{FusionConfig, VotePolicy};
use crate::signal::{AnomalyVerdict, DetectorId, DetectorScore, Severity};
use crate::store::KpiSeries;
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};

/// Outcome of voting on one timestamp
#[derive(Debug, Clone, PartialEq)]
pub struct Fused {
    pub is_anomaly: bool,
    pub confidence: f64,
    pub contributing: BTreeSet<DetectorId>,
}

pub fn combined_score(shape: f64, density: f64, config: &FusionConfig) -> f64 {
    let w = config.weights;
    let total = w.shape + w.density;
    if total <= 0.0 {
        return 0.0;
    }
    (w.shape * shape + w.density * density) / total
}

pub fn fuse(shape: f64, density: f64, config: &FusionConfig) -> Fused {
    let shape_fired = shape > config.shape_threshold;
    let density_fired = density > config.density_threshold;
    let confidence = combined_score(shape, density, config);

    let is_anomaly = match config.policy {
        VotePolicy::Or => shape_fired || density_fired,
        VotePolicy::And => shape_fired && density_fired,
        VotePolicy::Weighted => confidence >= config.combined_threshold,
    };

    Fused {
        is_anomaly,
        confidence,
        contributing: contributing_detectors(shape, density, is_anomaly, config),
    }
}

/// Detectors over their own threshold. A flagged verdict always names at
/// least one detector: the larger weighted share when neither fired alone.
pub fn contributing_detectors(
    shape: f64,
    density: f64,
    is_anomaly: bool,
    config: &FusionConfig,
) -> BTreeSet<DetectorId> {
    let mut contributing = BTreeSet::new();
    if shape > config.shape_threshold {
        contributing.insert(DetectorId::Shape);
    }
    if density > config.density_threshold {
        contributing.insert(DetectorId::Density);
    }
    if is_anomaly && contributing.is_empty() {
        let w = config.weights;
        if w.shape * shape >= w.density * density {
            contributing.insert(DetectorId::Shape);
        } else {
            contributing.insert(DetectorId::Density);
        }
    }
    contributing
}

/// Verdict from already-fused parts; used for fresh runs and cache replays.
pub fn verdict(
    series: &KpiSeries,
    timestamp: DateTime<Utc>,
    value: f64,
    shape: f64,
    density: f64,
    fused: Fused,
) -> AnomalyVerdict {
    AnomalyVerdict {
        site_id: series.site_id().to_string(),
        kpi_name: series.kpi_name().to_string(),
        timestamp,
        value,
        is_anomaly: fused.is_anomaly,
        severity: if fused.is_anomaly {
            Severity::from_score(fused.confidence)
        } else {
            Severity::None
        },
        confidence: fused.confidence,
        shape_score: shape,
        density_score: density,
        contributing_detectors: fused.contributing,
    }
}

/// One verdict per point of `series`; a timestamp missing from either score
/// list counts as a zero score for that detector.
pub fn fuse_series(
    series: &KpiSeries,
    shape: &[DetectorScore],
    density: &[DetectorScore],
    config: &FusionConfig,
) -> Vec<AnomalyVerdict> {
    let by_time = |scores: &[DetectorScore]| -> HashMap<DateTime<Utc>, f64> {
        scores
            .iter()
            .map(|s| (s.timestamp, s.normalized_score))
            .collect()
    };
    let shape_at = by_time(shape);
    let density_at = by_time(density);

    series
        .points()
        .iter()
        .map(|point| {
            let s = shape_at.get(&point.timestamp).copied().unwrap_or(0.0);
            let d = density_at.get(&point.timestamp).copied().unwrap_or(0.0);
            verdict(series, point.timestamp, point.value, s, d, fuse(s, d, config))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FusionWeights;
    use crate::store::SeriesKey;
    use chrono::{Duration, TimeZone};

    fn config(policy: VotePolicy) -> FusionConfig {
        FusionConfig::default().with_policy(policy)
    }

    #[test]
    fn test_policies() {
        let or = config(VotePolicy::Or);
        let and = config(VotePolicy::And);
        let weighted = config(VotePolicy::Weighted);

        assert!(fuse(0.9, 0.1, &or).is_anomaly);
        assert!(!fuse(0.9, 0.1, &and).is_anomaly);
        assert!(fuse(0.9, 0.1, &weighted).is_anomaly);
        assert!(!fuse(0.6, 0.2, &weighted).is_anomaly);
        assert!(fuse(0.6, 0.7, &and).is_anomaly);
    }

    #[test]
    fn test_thresholds_are_strict() {
        let or = config(VotePolicy::Or);
        assert!(!fuse(0.5, 0.5, &or).is_anomaly);
        // WEIGHTED compares with >=
        assert!(fuse(0.5, 0.5, &config(VotePolicy::Weighted)).is_anomaly);
    }

    #[test]
    fn test_confidence_is_weighted_combination() {
        let mut cfg = config(VotePolicy::And);
        cfg.weights = FusionWeights {
            shape: 3.0,
            density: 1.0,
        };
        let fused = fuse(0.8, 0.4, &cfg);
        assert!((fused.confidence - 0.7).abs() < 1e-12);
        assert!(!fused.is_anomaly);
    }

    #[test]
    fn test_contributing_fallback() {
        let fused = fuse(0.45, 0.55, &config(VotePolicy::Weighted));
        assert_eq!(fused.contributing, BTreeSet::from([DetectorId::Density]));

        let fused = fuse(0.49, 0.51, &FusionConfig {
            density_threshold: 0.6,
            ..config(VotePolicy::Weighted)
        });
        assert!(fused.is_anomaly);
        assert_eq!(fused.contributing, BTreeSet::from([DetectorId::Density]));

        assert!(fuse(0.1, 0.2, &config(VotePolicy::Weighted))
            .contributing
            .is_empty());
    }

    #[test]
    fn test_fuse_series_fills_missing_scores() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let series = KpiSeries::from_pairs(
            SeriesKey::new("S1", "RSRP"),
            (0..3).map(|i| (start + Duration::hours(i), -90.0 - i as f64)),
        )
        .unwrap();
        let score = |hour: i64, value: f64, detector_id| DetectorScore {
            site_id: "S1".into(),
            kpi_name: "RSRP".into(),
            timestamp: start + Duration::hours(hour),
            raw_score: value,
            normalized_score: value,
            detector_id,
        };
        let shape = vec![score(0, 0.2, DetectorId::Shape), score(1, 0.9, DetectorId::Shape)];
        let density = vec![score(1, 0.8, DetectorId::Density), score(2, 0.95, DetectorId::Density)];

        let verdicts = fuse_series(&series, &shape, &density, &config(VotePolicy::Or));
        assert_eq!(verdicts.len(), 3);
        assert_eq!(verdicts[0].density_score, 0.0);
        assert!(!verdicts[0].is_anomaly);
        assert!(verdicts[1].is_anomaly);
        assert_eq!(verdicts[1].value, -91.0);
        assert_eq!(verdicts[1].severity, Severity::High);
        assert_eq!(verdicts[2].shape_score, 0.0);
        assert_eq!(
            verdicts[2].contributing_detectors,
            BTreeSet::from([DetectorId::Density])
        );
    }
}
