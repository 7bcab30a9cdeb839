//! Descriptive Queries Over the Store
//!
//! Non-detector questions an operator asks alongside anomaly queries:
//! dataset overview, best/worst site for a KPI, a site's peak reading, and a
//! simple "does X rising come with Y rising" check. KPI families used for
//! related-KPI lookups also live here.

use crate::error::{EngineError, Result};
use crate::store::{DateRange, KpiPoint, KpiStore, SeriesKey};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Ratio above which a directional relationship is reported as likely
const LIKELY_RATIO: f64 = 0.45;

/// Families of radio KPIs that tend to move together
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KpiGroup {
    Signal,
    Throughput,
    Access,
    Stability,
    Unknown,
}

impl KpiGroup {
    pub fn classify(kpi_name: &str) -> Self {
        [Self::Signal, Self::Throughput, Self::Access, Self::Stability]
            .into_iter()
            .find(|group| group.members().contains(&kpi_name))
            .unwrap_or(Self::Unknown)
    }

    pub fn members(&self) -> &'static [&'static str] {
        match self {
            Self::Signal => &["RSRP", "SINR"],
            Self::Throughput => &["DL_Throughput", "UL_Throughput", "RTT"],
            Self::Access => &["Active_Users", "CPU_Utilization", "Handover_Success_Rate"],
            Self::Stability => &["Packet_Loss", "Call_Drop_Rate"],
            Self::Unknown => &[],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KpiStats {
    pub count: usize,
    pub mean: f64,
    pub min: f64,
    pub max: f64,
    /// Empty cells skipped at load time
    pub missing: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetSummary {
    pub first_timestamp: Option<DateTime<Utc>>,
    pub last_timestamp: Option<DateTime<Utc>>,
    pub site_count: usize,
    pub kpis: Vec<String>,
    pub per_kpi: BTreeMap<String, KpiStats>,
}

pub fn describe(store: &KpiStore) -> DatasetSummary {
    let mut per_kpi: BTreeMap<String, KpiStats> = BTreeMap::new();
    let mut sums: BTreeMap<String, f64> = BTreeMap::new();
    let mut first: Option<DateTime<Utc>> = None;
    let mut last: Option<DateTime<Utc>> = None;

    for series in store.iter() {
        first = min_opt(first, series.first_timestamp());
        last = max_opt(last, series.last_timestamp());

        let stats = per_kpi
            .entry(series.kpi_name().to_string())
            .or_insert(KpiStats {
                count: 0,
                mean: 0.0,
                min: f64::INFINITY,
                max: f64::NEG_INFINITY,
                missing: 0,
            });
        let sum = sums.entry(series.kpi_name().to_string()).or_insert(0.0);
        for point in series.points() {
            stats.count += 1;
            stats.min = stats.min.min(point.value);
            stats.max = stats.max.max(point.value);
            *sum += point.value;
        }
    }

    for (kpi, stats) in per_kpi.iter_mut() {
        if stats.count > 0 {
            stats.mean = sums.get(kpi).copied().unwrap_or(0.0) / stats.count as f64;
        }
        stats.missing = store.missing_counts().get(kpi).copied().unwrap_or(0);
    }

    DatasetSummary {
        first_timestamp: first,
        last_timestamp: last,
        site_count: store.sites().len(),
        kpis: per_kpi.keys().cloned().collect(),
        per_kpi,
    }
}

fn min_opt(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

fn max_opt(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Extreme {
    Highest,
    Lowest,
}

impl Extreme {
    fn beats(&self, candidate: f64, current: f64) -> bool {
        match self {
            Self::Highest => candidate > current,
            Self::Lowest => candidate < current,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiteExtreme {
    pub kpi_name: String,
    pub site_id: String,
    pub mean_value: f64,
    pub extreme: Extreme,
}

fn no_data(kpi_name: &str, range: Option<DateRange>) -> EngineError {
    match range {
        Some(r) => EngineError::EmptyRange {
            key: format!("*/{kpi_name}"),
            start: r.start.to_rfc3339(),
            end: r.end.to_rfc3339(),
        },
        None => EngineError::EmptySeries {
            key: format!("*/{kpi_name}"),
            len: 0,
            min: 1,
        },
    }
}

/// Site with the highest or lowest mean of `kpi_name` within `range`.
/// Ties keep the site that sorts first.
pub fn site_extreme(
    store: &KpiStore,
    kpi_name: &str,
    extreme: Extreme,
    range: Option<DateRange>,
) -> Result<SiteExtreme> {
    let mut best: Option<(String, f64)> = None;

    for series in store.iter().filter(|s| s.kpi_name() == kpi_name) {
        let points = series.points_within(range);
        if points.is_empty() {
            continue;
        }
        let mean = points.iter().map(|p| p.value).sum::<f64>() / points.len() as f64;
        if best.as_ref().is_none_or(|(_, current)| extreme.beats(mean, *current)) {
            best = Some((series.site_id().to_string(), mean));
        }
    }

    let (site_id, mean_value) = best.ok_or_else(|| no_data(kpi_name, range))?;
    Ok(SiteExtreme {
        kpi_name: kpi_name.to_string(),
        site_id,
        mean_value,
        extreme,
    })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeakObservation {
    pub site_id: String,
    pub kpi_name: String,
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    pub extreme: Extreme,
}

/// Highest or lowest single reading of a site's KPI; the earliest wins ties.
pub fn peak_observation(
    store: &KpiStore,
    site_id: &str,
    kpi_name: &str,
    extreme: Extreme,
    range: Option<DateRange>,
) -> Result<PeakObservation> {
    let key = SeriesKey::new(site_id, kpi_name);
    let series = store.series(&key).ok_or_else(|| EngineError::EmptySeries {
        key: key.to_string(),
        len: 0,
        min: 1,
    })?;

    let mut peak: Option<&KpiPoint> = None;
    for point in series.points_within(range) {
        if peak.is_none_or(|p| extreme.beats(point.value, p.value)) {
            peak = Some(point);
        }
    }

    let point = peak.ok_or_else(|| no_data(kpi_name, range))?;
    Ok(PeakObservation {
        site_id: site_id.to_string(),
        kpi_name: kpi_name.to_string(),
        timestamp: point.timestamp,
        value: point.value,
        extreme,
    })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectionalImpact {
    pub kpi_x: String,
    pub kpi_y: String,
    pub site_id: Option<String>,
    /// Consecutive aligned steps where X rose
    pub rises_x: usize,
    /// Of those, steps where Y rose too
    pub rises_both: usize,
    pub ratio: f64,
    pub likely: bool,
}

/// How often a rise in `kpi_x` comes with a rise in `kpi_y`.
///
/// Steps are taken between consecutive timestamps where both KPIs have a
/// reading, separately per site, and pooled.
pub fn directional_impact(
    store: &KpiStore,
    kpi_x: &str,
    kpi_y: &str,
    site_id: Option<&str>,
    range: Option<DateRange>,
) -> Result<DirectionalImpact> {
    let sites: BTreeSet<String> = store
        .keys_matching(site_id, Some(kpi_x))
        .into_iter()
        .map(|k| k.site_id)
        .collect();

    let (mut steps, mut rises_x, mut rises_both) = (0usize, 0usize, 0usize);
    for site in &sites {
        let (Some(x), Some(y)) = (
            store.series(&SeriesKey::new(site.as_str(), kpi_x)),
            store.series(&SeriesKey::new(site.as_str(), kpi_y)),
        ) else {
            continue;
        };

        let aligned: Vec<(f64, f64)> = x
            .points_within(range)
            .iter()
            .filter_map(|p| y.value_at(p.timestamp).map(|vy| (p.value, vy)))
            .collect();

        for pair in aligned.windows(2) {
            steps += 1;
            if pair[1].0 > pair[0].0 {
                rises_x += 1;
                if pair[1].1 > pair[0].1 {
                    rises_both += 1;
                }
            }
        }
    }

    if steps == 0 {
        return Err(no_data(&format!("{kpi_x}~{kpi_y}"), range));
    }

    let ratio = if rises_x == 0 {
        0.0
    } else {
        rises_both as f64 / rises_x as f64
    };
    Ok(DirectionalImpact {
        kpi_x: kpi_x.to_string(),
        kpi_y: kpi_y.to_string(),
        site_id: site_id.map(str::to_string),
        rises_x,
        rises_both,
        ratio,
        likely: ratio > LIKELY_RATIO,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::KpiSeries;
    use chrono::{Duration, NaiveDate, TimeZone};

    fn series(site: &str, kpi: &str, values: &[f64]) -> KpiSeries {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        KpiSeries::from_pairs(
            SeriesKey::new(site, kpi),
            values
                .iter()
                .enumerate()
                .map(|(i, &v)| (start + Duration::days(i as i64), v)),
        )
        .unwrap()
    }

    fn store() -> KpiStore {
        KpiStore::from_series([
            series("SITE_001", "SINR", &[10.0, 12.0, 11.0, 15.0]),
            series("SITE_002", "SINR", &[4.0, 5.0, 3.0, 6.0]),
            series("SITE_001", "Active_Users", &[100.0, 120.0, 90.0, 130.0]),
            series("SITE_001", "CPU_Utilization", &[40.0, 55.0, 35.0, 30.0]),
        ])
    }

    #[test]
    fn test_classify_groups() {
        assert_eq!(KpiGroup::classify("SINR"), KpiGroup::Signal);
        assert_eq!(KpiGroup::classify("RTT"), KpiGroup::Throughput);
        assert_eq!(KpiGroup::classify("Call_Drop_Rate"), KpiGroup::Stability);
        assert_eq!(KpiGroup::classify("sinr"), KpiGroup::Unknown);
    }

    #[test]
    fn test_describe() {
        let summary = describe(&store());
        assert_eq!(summary.site_count, 2);
        assert_eq!(summary.kpis, vec!["Active_Users", "CPU_Utilization", "SINR"]);
        let sinr = &summary.per_kpi["SINR"];
        assert_eq!(sinr.count, 8);
        assert_eq!(sinr.min, 3.0);
        assert_eq!(sinr.max, 15.0);
        assert_eq!(sinr.mean, 8.25);
        assert_eq!(
            summary.last_timestamp,
            Some(Utc.with_ymd_and_hms(2024, 1, 4, 0, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_site_extreme() {
        let store = store();
        let best = site_extreme(&store, "SINR", Extreme::Highest, None).unwrap();
        assert_eq!(best.site_id, "SITE_001");
        assert_eq!(best.mean_value, 12.0);

        let worst = site_extreme(&store, "SINR", Extreme::Lowest, None).unwrap();
        assert_eq!(worst.site_id, "SITE_002");

        assert!(matches!(
            site_extreme(&store, "RSRP", Extreme::Highest, None),
            Err(EngineError::EmptySeries { .. })
        ));
    }

    #[test]
    fn test_peak_observation_in_range() {
        let store = store();
        let day = |d| NaiveDate::from_ymd_opt(2024, 1, d).unwrap();

        let peak = peak_observation(&store, "SITE_001", "SINR", Extreme::Highest, None).unwrap();
        assert_eq!(peak.value, 15.0);

        let early = DateRange::days(day(1), day(3));
        let peak =
            peak_observation(&store, "SITE_001", "SINR", Extreme::Highest, Some(early)).unwrap();
        assert_eq!(peak.value, 12.0);
        assert_eq!(peak.timestamp.date_naive(), day(2));

        let empty = DateRange::days(day(20), day(21));
        assert!(matches!(
            peak_observation(&store, "SITE_001", "SINR", Extreme::Lowest, Some(empty)),
            Err(EngineError::EmptyRange { .. })
        ));
    }

    #[test]
    fn test_directional_impact() {
        let impact =
            directional_impact(&store(), "Active_Users", "CPU_Utilization", None, None).unwrap();
        // Users rise on steps 1 and 3; CPU rises with them on step 1 only.
        assert_eq!(impact.rises_x, 2);
        assert_eq!(impact.rises_both, 1);
        assert_eq!(impact.ratio, 0.5);
        assert!(impact.likely);

        assert!(directional_impact(&store(), "Active_Users", "RTT", None, None).is_err());
    }
}
