//! Anomaly Report Assembler
//!
//! Aggregates fused verdicts into the summaries a question-answering layer
//! needs:
//! - totals and anomaly rate within a scope
//! - per-day counts with the peak day
//! - per-KPI and per-site breakdowns
//! - co-occurrence: which KPIs were anomalous together at each timestamp
//! - the strongest individual anomalies
//!
//! A report is built from whatever verdicts are available. Pairs that could
//! not be analyzed are listed in `partial_failures` and mark it incomplete.

use crate::error::PairFailure;
use crate::insights::KpiGroup;
use crate::signal::AnomalyVerdict;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Anomalies kept in `top_anomalies`
const TOP_ANOMALIES: usize = 10;

/// Filter applied to verdicts; `None` fields are unbounded
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReportScope {
    /// Inclusive lower bound
    pub start: Option<DateTime<Utc>>,
    /// Inclusive upper bound
    pub end: Option<DateTime<Utc>>,
    pub sites: Option<BTreeSet<String>>,
    pub kpis: Option<BTreeSet<String>>,
}

impl ReportScope {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn between(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            start: Some(start),
            end: Some(end),
            ..Self::default()
        }
    }

    pub fn with_site(mut self, site_id: impl Into<String>) -> Self {
        self.sites.get_or_insert_with(BTreeSet::new).insert(site_id.into());
        self
    }

    pub fn with_kpi(mut self, kpi_name: impl Into<String>) -> Self {
        self.kpis.get_or_insert_with(BTreeSet::new).insert(kpi_name.into());
        self
    }

    pub fn contains(&self, verdict: &AnomalyVerdict) -> bool {
        self.start.is_none_or(|s| verdict.timestamp >= s)
            && self.end.is_none_or(|e| verdict.timestamp <= e)
            && self
                .sites
                .as_ref()
                .is_none_or(|sites| sites.contains(&verdict.site_id))
            && self
                .kpis
                .as_ref()
                .is_none_or(|kpis| kpis.contains(&verdict.kpi_name))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DayCount {
    pub points: usize,
    pub anomalies: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KpiBreakdown {
    pub points: usize,
    pub anomalies: usize,
    pub rate: f64,
    /// Mean KPI value over all points in scope
    pub mean_value: f64,
    /// Anomalies whose value sits above `mean_value`
    pub anomalies_above_mean: usize,
    /// Anomalies at or below `mean_value`
    pub anomalies_below_mean: usize,
    /// Mean value of the anomalies above / at-or-below the KPI mean
    pub anomaly_mean_above: Option<f64>,
    pub anomaly_mean_below: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SiteBreakdown {
    pub points: usize,
    pub anomalies: usize,
    pub rate: f64,
    /// KPIs with at least one anomaly at this site
    pub affected_kpis: BTreeSet<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnomalyReport {
    pub scope: ReportScope,
    pub total_points: usize,
    pub anomaly_count: usize,
    /// `anomaly_count / total_points`, 0 when the scope is empty
    pub rate: f64,
    pub per_day: BTreeMap<NaiveDate, DayCount>,
    /// Day with the most anomalies; the earliest wins ties
    pub peak_day: Option<NaiveDate>,
    pub per_kpi: BTreeMap<String, KpiBreakdown>,
    pub per_site: BTreeMap<String, SiteBreakdown>,
    /// Timestamp -> KPIs flagged at that instant
    pub co_occurrence: BTreeMap<DateTime<Utc>, BTreeSet<String>>,
    /// Day -> KPI -> anomalies
    pub daily_kpi_counts: BTreeMap<NaiveDate, BTreeMap<String, usize>>,
    pub top_anomalies: Vec<AnomalyVerdict>,
    pub partial_failures: Vec<PairFailure>,
    pub complete: bool,
}

impl AnomalyReport {
    /// Report over nothing, e.g. when no pair matches a query
    pub fn empty(scope: ReportScope) -> Self {
        build_report(&[], &scope, Vec::new())
    }

    /// Timestamps where at least `min_kpis` KPIs were anomalous together
    pub fn co_occurring(&self, min_kpis: usize) -> BTreeMap<DateTime<Utc>, &BTreeSet<String>> {
        self.co_occurrence
            .iter()
            .filter(|(_, kpis)| kpis.len() >= min_kpis)
            .map(|(ts, kpis)| (*ts, kpis))
            .collect()
    }

    /// KPIs anomalous together at `timestamp`
    pub fn kpis_at(&self, timestamp: DateTime<Utc>) -> BTreeSet<String> {
        self.co_occurrence.get(&timestamp).cloned().unwrap_or_default()
    }

    /// For every other KPI of the same group as `kpi`, how many anomalies it
    /// had on the days `kpi` was anomalous.
    pub fn related_kpi_counts(&self, kpi: &str) -> BTreeMap<String, usize> {
        let group = KpiGroup::classify(kpi);
        let mut related = BTreeMap::new();
        if group == KpiGroup::Unknown {
            return related;
        }

        for counts in self.daily_kpi_counts.values() {
            if counts.get(kpi).copied().unwrap_or(0) == 0 {
                continue;
            }
            for (other, &n) in counts {
                if other != kpi && KpiGroup::classify(other) == group {
                    *related.entry(other.clone()).or_insert(0) += n;
                }
            }
        }
        related
    }
}

/// Aggregate `verdicts` that fall inside `scope`.
pub fn build_report(
    verdicts: &[AnomalyVerdict],
    scope: &ReportScope,
    failures: Vec<PairFailure>,
) -> AnomalyReport {
    let in_scope: Vec<&AnomalyVerdict> = verdicts.iter().filter(|v| scope.contains(v)).collect();

    let mut report = AnomalyReport {
        scope: scope.clone(),
        complete: failures.is_empty(),
        partial_failures: failures,
        ..AnomalyReport::default()
    };

    let mut value_sums: BTreeMap<&str, f64> = BTreeMap::new();
    for v in &in_scope {
        let day = v.timestamp.date_naive();
        report.total_points += 1;

        let day_count = report.per_day.entry(day).or_default();
        day_count.points += 1;

        let kpi = report.per_kpi.entry(v.kpi_name.clone()).or_default();
        kpi.points += 1;
        *value_sums.entry(v.kpi_name.as_str()).or_insert(0.0) += v.value;

        let site = report.per_site.entry(v.site_id.clone()).or_default();
        site.points += 1;

        if v.is_anomaly {
            report.anomaly_count += 1;
            day_count.anomalies += 1;
            kpi.anomalies += 1;
            site.anomalies += 1;
            site.affected_kpis.insert(v.kpi_name.clone());
            report
                .co_occurrence
                .entry(v.timestamp)
                .or_default()
                .insert(v.kpi_name.clone());
            *report
                .daily_kpi_counts
                .entry(day)
                .or_default()
                .entry(v.kpi_name.clone())
                .or_insert(0) += 1;
        }
    }

    for (name, kpi) in report.per_kpi.iter_mut() {
        kpi.rate = ratio(kpi.anomalies, kpi.points);
        kpi.mean_value = value_sums.get(name.as_str()).copied().unwrap_or(0.0) / kpi.points as f64;
    }
    for site in report.per_site.values_mut() {
        site.rate = ratio(site.anomalies, site.points);
    }
    let mut directional: BTreeMap<&str, (f64, f64)> = BTreeMap::new();
    for v in in_scope.iter().filter(|v| v.is_anomaly) {
        if let Some(kpi) = report.per_kpi.get_mut(&v.kpi_name) {
            let sums = directional.entry(v.kpi_name.as_str()).or_insert((0.0, 0.0));
            if v.value > kpi.mean_value {
                kpi.anomalies_above_mean += 1;
                sums.0 += v.value;
            } else {
                kpi.anomalies_below_mean += 1;
                sums.1 += v.value;
            }
        }
    }
    for (name, (above, below)) in directional {
        if let Some(kpi) = report.per_kpi.get_mut(name) {
            kpi.anomaly_mean_above =
                (kpi.anomalies_above_mean > 0).then(|| above / kpi.anomalies_above_mean as f64);
            kpi.anomaly_mean_below =
                (kpi.anomalies_below_mean > 0).then(|| below / kpi.anomalies_below_mean as f64);
        }
    }

    report.rate = ratio(report.anomaly_count, report.total_points);
    report.peak_day = peak_day(&report.per_day);
    report.top_anomalies = top_anomalies(&in_scope, TOP_ANOMALIES);
    report
}

fn ratio(part: usize, whole: usize) -> f64 {
    if whole == 0 { 0.0 } else { part as f64 / whole as f64 }
}

fn peak_day(per_day: &BTreeMap<NaiveDate, DayCount>) -> Option<NaiveDate> {
    let mut best: Option<(NaiveDate, usize)> = None;
    // Ascending iteration with a strict comparison keeps the earliest day.
    for (day, count) in per_day {
        if count.anomalies > 0 && best.is_none_or(|(_, n)| count.anomalies > n) {
            best = Some((*day, count.anomalies));
        }
    }
    best.map(|(day, _)| day)
}

fn top_anomalies(verdicts: &[&AnomalyVerdict], k: usize) -> Vec<AnomalyVerdict> {
    let mut flagged: Vec<&AnomalyVerdict> =
        verdicts.iter().copied().filter(|v| v.is_anomaly).collect();
    flagged.sort_by(|a, b| {
        b.confidence
            .total_cmp(&a.confidence)
            .then(a.timestamp.cmp(&b.timestamp))
            .then_with(|| a.site_id.cmp(&b.site_id))
            .then_with(|| a.kpi_name.cmp(&b.kpi_name))
    });
    flagged.into_iter().take(k).cloned().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{EngineError, FailureKind};
    use crate::signal::{DetectorId, Severity};
    use chrono::{Duration, TimeZone};

    fn at(hour: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::hours(hour)
    }

    fn verdict(site: &str, kpi: &str, hour: i64, value: f64, confidence: f64, flagged: bool) -> AnomalyVerdict {
        AnomalyVerdict {
            site_id: site.into(),
            kpi_name: kpi.into(),
            timestamp: at(hour),
            value,
            is_anomaly: flagged,
            confidence,
            severity: Severity::from_score(confidence),
            shape_score: confidence,
            density_score: confidence,
            contributing_detectors: if flagged {
                BTreeSet::from([DetectorId::Shape])
            } else {
                BTreeSet::new()
            },
        }
    }

    fn sample() -> Vec<AnomalyVerdict> {
        vec![
            verdict("S1", "SINR", 1, 10.0, 0.2, false),
            verdict("S1", "SINR", 2, 2.0, 0.9, true),
            verdict("S1", "DL_Throughput", 2, 5.0, 0.8, true),
            verdict("S1", "RSRP", 2, -90.0, 0.1, false),
            verdict("S1", "SINR", 30, 11.0, 0.7, true),
            verdict("S2", "SINR", 30, 12.0, 0.3, false),
            verdict("S2", "RSRP", 30, -70.0, 0.95, true),
            verdict("S2", "RSRP", 50, -92.0, 0.1, false),
        ]
    }

    #[test]
    fn test_totals_and_rate() {
        let report = build_report(&sample(), &ReportScope::all(), Vec::new());
        assert_eq!(report.total_points, 8);
        assert_eq!(report.anomaly_count, 4);
        assert_eq!(report.rate, 0.5);
        assert!(report.complete);

        let per_kpi_sum: usize = report.per_kpi.values().map(|k| k.anomalies).sum();
        assert_eq!(per_kpi_sum, report.anomaly_count);
        let per_site_sum: usize = report.per_site.values().map(|s| s.anomalies).sum();
        assert_eq!(per_site_sum, report.anomaly_count);
    }

    #[test]
    fn test_peak_day_earliest_wins() {
        let report = build_report(&sample(), &ReportScope::all(), Vec::new());
        let jan1 = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let jan2 = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();
        assert_eq!(report.per_day[&jan1].anomalies, 2);
        assert_eq!(report.per_day[&jan2].anomalies, 2);
        assert_eq!(report.peak_day, Some(jan1));
    }

    #[test]
    fn test_co_occurrence() {
        let report = build_report(&sample(), &ReportScope::all(), Vec::new());
        assert_eq!(
            report.kpis_at(at(2)),
            BTreeSet::from(["DL_Throughput".to_string(), "SINR".to_string()])
        );
        assert!(!report.co_occurrence.contains_key(&at(1)));
        assert_eq!(report.co_occurring(2).len(), 2);
        assert_eq!(report.co_occurring(3).len(), 0);
    }

    #[test]
    fn test_scope_filters() {
        let scope = ReportScope::between(at(24), at(72)).with_site("S2");
        let report = build_report(&sample(), &scope, Vec::new());
        assert_eq!(report.total_points, 3);
        assert_eq!(report.anomaly_count, 1);
        assert_eq!(report.per_site.len(), 1);

        let report = build_report(&sample(), &ReportScope::all().with_kpi("SINR"), Vec::new());
        assert_eq!(report.total_points, 4);
        assert_eq!(report.anomaly_count, 2);
        assert!(report.per_kpi.keys().all(|k| k == "SINR"));
    }

    #[test]
    fn test_empty_scope() {
        let report = AnomalyReport::empty(ReportScope::all().with_site("nowhere"));
        assert_eq!(report.total_points, 0);
        assert_eq!(report.rate, 0.0);
        assert_eq!(report.peak_day, None);
        assert!(report.top_anomalies.is_empty());
    }

    #[test]
    fn test_per_kpi_direction() {
        let report = build_report(&sample(), &ReportScope::all(), Vec::new());
        let sinr = &report.per_kpi["SINR"];
        // Mean of 10, 2, 11, 12 is 8.75
        assert_eq!(sinr.mean_value, 8.75);
        assert_eq!(sinr.anomalies_below_mean, 1);
        assert_eq!(sinr.anomalies_above_mean, 1);
        assert_eq!(sinr.anomaly_mean_below, Some(2.0));
        assert_eq!(sinr.anomaly_mean_above, Some(11.0));
        assert_eq!(report.per_kpi["DL_Throughput"].anomaly_mean_above, None);
    }

    #[test]
    fn test_top_anomalies_ordering() {
        let report = build_report(&sample(), &ReportScope::all(), Vec::new());
        let confidences: Vec<f64> = report.top_anomalies.iter().map(|v| v.confidence).collect();
        assert_eq!(confidences, vec![0.95, 0.9, 0.8, 0.7]);
    }

    #[test]
    fn test_related_kpis_in_same_group() {
        let mut verdicts = sample();
        verdicts.push(verdict("S1", "RSRP", 3, -120.0, 0.9, true));
        let report = build_report(&verdicts, &ReportScope::all(), Vec::new());

        let related = report.related_kpi_counts("SINR");
        // Jan 1: RSRP once; Jan 2: RSRP once. DL_Throughput is another group.
        assert_eq!(related.get("RSRP"), Some(&2));
        assert!(!related.contains_key("DL_Throughput"));
        assert!(report.related_kpi_counts("Mystery_KPI").is_empty());
    }

    #[test]
    fn test_failures_mark_incomplete() {
        let err = EngineError::Timeout {
            key: "S3/SINR".into(),
            budget_ms: 50,
        };
        let report = build_report(
            &sample(),
            &ReportScope::all(),
            vec![PairFailure::new("S3", "SINR", &err)],
        );
        assert!(!report.complete);
        assert_eq!(report.partial_failures[0].kind, FailureKind::Timeout);
        assert_eq!(report.anomaly_count, 4);
    }

    #[test]
    fn test_serializes_to_json() {
        let report = build_report(&sample(), &ReportScope::all(), Vec::new());
        let json = serde_json::to_string(&report).unwrap();
        let back: AnomalyReport = serde_json::from_str(&json).unwrap();
        assert_eq!(back.anomaly_count, report.anomaly_count);
        assert_eq!(back.co_occurrence, report.co_occurrence);
    }
}
