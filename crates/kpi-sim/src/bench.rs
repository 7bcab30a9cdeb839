//! Detection Benchmark
//!
//! Runs the anomaly engine over a simulated dataset and compares its
//! verdicts with the injected ground truth:
//! - point level: precision, recall and F1 over (series, timestamp)
//! - event level: an injected anomaly counts as caught when any of its
//!   timestamps is flagged

use crate::core::SimulatedDataset;
use chrono::{DateTime, Utc};
use kpi_core::{
    AnomalyEngine, AnomalyReport, AnomalyVerdict, EngineConfig, ReportScope, Result, SeriesKey,
    build_report,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PointScore {
    pub true_positives: usize,
    pub false_positives: usize,
    pub false_negatives: usize,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
}

impl PointScore {
    pub fn from_counts(tp: usize, fp: usize, fn_: usize) -> Self {
        let precision = ratio(tp, tp + fp);
        let recall = ratio(tp, tp + fn_);
        let f1 = if precision + recall > 0.0 {
            2.0 * precision * recall / (precision + recall)
        } else {
            0.0
        };
        Self {
            true_positives: tp,
            false_positives: fp,
            false_negatives: fn_,
            precision,
            recall,
            f1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct EventRecall {
    pub injected: usize,
    pub detected: usize,
    pub recall: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchResult {
    pub points: PointScore,
    pub per_scenario: BTreeMap<String, EventRecall>,
    pub analyzed_points: usize,
    pub failed_pairs: usize,
    pub elapsed_ms: u128,
}

fn ratio(part: usize, whole: usize) -> f64 {
    if whole == 0 { 0.0 } else { part as f64 / whole as f64 }
}

/// Compare `verdicts` against the dataset's ground truth.
pub fn score(verdicts: &[AnomalyVerdict], dataset: &SimulatedDataset) -> BenchResult {
    let truth = dataset.anomalous_points();
    let flagged: BTreeSet<(SeriesKey, DateTime<Utc>)> = verdicts
        .iter()
        .filter(|v| v.is_anomaly)
        .map(|v| (SeriesKey::new(&v.site_id, &v.kpi_name), v.timestamp))
        .collect();

    let tp = flagged.intersection(&truth).count();
    let points = PointScore::from_counts(tp, flagged.len() - tp, truth.len() - tp);

    let mut per_scenario: BTreeMap<String, EventRecall> = BTreeMap::new();
    for gt in &dataset.ground_truth {
        let key = gt.key();
        let entry = per_scenario.entry(gt.scenario.clone()).or_default();
        entry.injected += 1;
        if gt.timestamps.iter().any(|ts| flagged.contains(&(key.clone(), *ts))) {
            entry.detected += 1;
        }
    }
    for recall in per_scenario.values_mut() {
        recall.recall = ratio(recall.detected, recall.injected);
    }

    BenchResult {
        points,
        per_scenario,
        analyzed_points: verdicts.len(),
        failed_pairs: 0,
        elapsed_ms: 0,
    }
}

/// Analyze every series of `dataset` and score the outcome.
pub fn run(dataset: &SimulatedDataset, config: EngineConfig) -> Result<(BenchResult, AnomalyReport)> {
    let started = Instant::now();
    let engine = AnomalyEngine::new(dataset.to_store()?, config)?;
    let batch = engine.analyze(&dataset.keys());

    let mut result = score(&batch.verdicts, dataset);
    result.failed_pairs = batch.failures.len();
    result.elapsed_ms = started.elapsed().as_millis();
    let report = build_report(&batch.verdicts, &ReportScope::all(), batch.failures);

    info!(
        points = result.analyzed_points,
        precision = result.points.precision,
        recall = result.points.recall,
        f1 = result.points.f1,
        elapsed_ms = result.elapsed_ms as u64,
        "Benchmark finished."
    );
    Ok((result, report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{GroundTruth, SeriesDraft};
    use crate::engine::{Injection, SimulationEngine};
    use crate::generator::SyntheticConfig;
    use chrono::{Duration, TimeZone};
    use kpi_core::{Severity, VotePolicy};

    fn t(h: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::hours(h)
    }

    fn verdict(kpi: &str, h: i64, flagged: bool) -> AnomalyVerdict {
        AnomalyVerdict {
            site_id: "SITE_001".into(),
            kpi_name: kpi.into(),
            timestamp: t(h),
            value: 1.0,
            is_anomaly: flagged,
            confidence: if flagged { 0.9 } else { 0.0 },
            severity: if flagged { Severity::Critical } else { Severity::None },
            shape_score: 0.0,
            density_score: 0.0,
            contributing_detectors: BTreeSet::new(),
        }
    }

    fn truth(scenario: &str, kpi: &str, hours: &[i64]) -> GroundTruth {
        GroundTruth {
            anomaly_id: format!("{scenario}-{kpi}"),
            scenario: scenario.into(),
            site_id: "SITE_001".into(),
            kpi_name: kpi.into(),
            start: t(hours[0]),
            end: t(hours[hours.len() - 1]),
            timestamps: hours.iter().map(|&h| t(h)).collect(),
        }
    }

    #[test]
    fn test_point_and_event_scores() {
        let dataset = SimulatedDataset {
            series: Vec::<SeriesDraft>::new(),
            ground_truth: vec![
                truth("dip", "SINR", &[10, 11, 12]),
                truth("spike", "RTT", &[40]),
            ],
        };
        let verdicts = vec![
            verdict("SINR", 10, true),
            verdict("SINR", 11, true),
            verdict("SINR", 12, false),
            verdict("SINR", 30, true),
            verdict("RTT", 40, false),
        ];

        let result = score(&verdicts, &dataset);
        assert_eq!(result.points.true_positives, 2);
        assert_eq!(result.points.false_positives, 1);
        assert_eq!(result.points.false_negatives, 2);
        assert!((result.points.precision - 2.0 / 3.0).abs() < 1e-12);
        assert_eq!(result.points.recall, 0.5);
        assert!((result.points.f1 - 4.0 / 7.0).abs() < 1e-12);

        assert_eq!(result.per_scenario["dip"].detected, 1);
        assert_eq!(result.per_scenario["spike"].recall, 0.0);
    }

    #[test]
    fn test_nothing_flagged_scores_zero() {
        let score = PointScore::from_counts(0, 0, 5);
        assert_eq!(score.precision, 0.0);
        assert_eq!(score.f1, 0.0);
    }

    #[test]
    fn test_engine_catches_injected_dip() {
        let config = SyntheticConfig {
            sites: 1,
            kpis: vec!["SINR".into(), "RSRP".into()],
            days: 10,
            ..SyntheticConfig::default()
        };
        let mut sim = SimulationEngine::new(config).unwrap();
        sim.schedule(Injection::new("dip", SeriesKey::new("SITE_001", "SINR"), 120))
            .unwrap();
        let dataset = sim.run().unwrap();

        let mut engine_config = EngineConfig::default().with_policy(VotePolicy::Or);
        engine_config.cache.enabled = false;
        let (result, report) = run(&dataset, engine_config).unwrap();

        assert_eq!(result.analyzed_points, 480);
        assert_eq!(result.failed_pairs, 0);
        assert_eq!(result.per_scenario["dip"].detected, 1);
        assert!(report.complete);
        assert!(report.per_kpi["SINR"].anomalies > 0);
    }
}
