//! KPI Store
//!
//! Loads cleaned KPI data from CSV and indexes it as immutable per
//! (site, kpi) series. Two layouts are understood:
//!
//! - long: `timestamp, site_id, kpi_name, value` (one observation per row)
//! - wide: `timestamp, site_id, <KPI columns...>` (one row per site and instant)
//!
//! Series are shared as `Arc<KpiSeries>` so detector threads can read them
//! without copying or locking.

use crate::config::ShapeConfig;
use crate::error::{EngineError, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::io;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

const TIMESTAMP_COLUMNS: &[&str] = &["timestamp", "date", "datetime", "time"];
const SITE_COLUMNS: &[&str] = &["site_id", "site"];
const SECTOR_COLUMNS: &[&str] = &["sector_id", "sector"];
const KPI_COLUMNS: &[&str] = &["kpi_name", "kpi"];
const VALUE_COLUMNS: &[&str] = &["value"];

/// Identity of one KPI series
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SeriesKey {
    pub site_id: String,
    pub kpi_name: String,
}

impl SeriesKey {
    pub fn new(site_id: impl Into<String>, kpi_name: impl Into<String>) -> Self {
        Self {
            site_id: site_id.into(),
            kpi_name: kpi_name.into(),
        }
    }
}

impl fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.site_id, self.kpi_name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct KpiPoint {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

/// Inclusive time window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl DateRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// Whole calendar days `first..=last`
    pub fn days(first: NaiveDate, last: NaiveDate) -> Self {
        let start = first.and_time(chrono::NaiveTime::MIN).and_utc();
        let end = last
            .and_hms_nano_opt(23, 59, 59, 999_999_999)
            .map(|t| t.and_utc())
            .unwrap_or(start);
        Self { start, end }
    }

    pub fn contains(&self, timestamp: DateTime<Utc>) -> bool {
        self.start <= timestamp && timestamp <= self.end
    }
}

/// Ordered observations of one KPI at one site
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KpiSeries {
    key: SeriesKey,
    points: Vec<KpiPoint>,
}

impl KpiSeries {
    /// Sorts by timestamp; duplicate timestamps or non-finite values are rejected.
    pub fn new(key: SeriesKey, mut points: Vec<KpiPoint>) -> Result<Self> {
        points.sort_by_key(|p| p.timestamp);

        if let Some(p) = points.iter().find(|p| !p.value.is_finite()) {
            return Err(EngineError::DataFormat(format!(
                "{key}: non-finite value at {}",
                p.timestamp
            )));
        }
        if let Some(pair) = points.windows(2).find(|w| w[0].timestamp == w[1].timestamp) {
            return Err(EngineError::DataFormat(format!(
                "{key}: duplicate timestamp {}",
                pair[0].timestamp
            )));
        }

        Ok(Self { key, points })
    }

    /// Builds a series from `(timestamp, value)` pairs
    pub fn from_pairs(
        key: SeriesKey,
        pairs: impl IntoIterator<Item = (DateTime<Utc>, f64)>,
    ) -> Result<Self> {
        let points = pairs
            .into_iter()
            .map(|(timestamp, value)| KpiPoint { timestamp, value })
            .collect();
        Self::new(key, points)
    }

    pub fn key(&self) -> &SeriesKey {
        &self.key
    }

    pub fn site_id(&self) -> &str {
        &self.key.site_id
    }

    pub fn kpi_name(&self) -> &str {
        &self.key.kpi_name
    }

    pub fn points(&self) -> &[KpiPoint] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn values(&self) -> Vec<f64> {
        self.points.iter().map(|p| p.value).collect()
    }

    pub fn first_timestamp(&self) -> Option<DateTime<Utc>> {
        self.points.first().map(|p| p.timestamp)
    }

    pub fn last_timestamp(&self) -> Option<DateTime<Utc>> {
        self.points.last().map(|p| p.timestamp)
    }

    pub fn value_at(&self, timestamp: DateTime<Utc>) -> Option<f64> {
        self.points
            .binary_search_by_key(&timestamp, |p| p.timestamp)
            .ok()
            .map(|idx| self.points[idx].value)
    }

    /// Points inside `range`, or all points when unbounded
    pub fn points_within(&self, range: Option<DateRange>) -> &[KpiPoint] {
        match range {
            Some(r) => {
                let lo = self.points.partition_point(|p| p.timestamp < r.start);
                let hi = self.points.partition_point(|p| p.timestamp <= r.end);
                &self.points[lo..hi.max(lo)]
            }
            None => &self.points,
        }
    }

    /// Sub-series within `[start, end]` (inclusive)
    pub fn slice(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<KpiSeries> {
        let lo = self.points.partition_point(|p| p.timestamp < start);
        let hi = self.points.partition_point(|p| p.timestamp <= end);

        if lo >= hi {
            return Err(EngineError::EmptyRange {
                key: self.key.to_string(),
                start: start.to_rfc3339(),
                end: end.to_rfc3339(),
            });
        }

        Ok(KpiSeries {
            key: self.key.clone(),
            points: self.points[lo..hi].to_vec(),
        })
    }
}

/// Parses the timestamp notations found in exported KPI tables.
///
/// Naive date/times are taken as UTC; bare integers as Unix seconds.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    const DATETIME_FORMATS: &[&str] = &[
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%d %H:%M",
        "%Y-%m-%dT%H:%M",
        "%Y/%m/%d %H:%M:%S",
        "%d.%m.%y %H:%M",
        "%d.%m.%Y %H:%M:%S",
        "%d.%m.%Y %H:%M",
    ];
    // Two-digit years first: %Y would happily read "24" as year 24.
    const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d", "%d.%m.%y", "%d.%m.%Y"];

    let s = raw.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in DATETIME_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(naive.and_utc());
        }
    }
    for fmt in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(s, fmt) {
            return date.and_hms_opt(0, 0, 0).map(|n| n.and_utc());
        }
    }
    s.parse::<i64>()
        .ok()
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
}

fn find_column(headers: &csv::StringRecord, names: &[&str]) -> Option<usize> {
    headers
        .iter()
        .position(|h| names.iter().any(|n| h.trim().eq_ignore_ascii_case(n)))
}

fn require_column(headers: &csv::StringRecord, names: &[&str]) -> Result<usize> {
    find_column(headers, names).ok_or_else(|| {
        EngineError::DataFormat(format!("missing required column '{}'", names[0]))
    })
}

fn csv_error(e: csv::Error) -> EngineError {
    if e.is_io_error() {
        EngineError::Io(e.to_string())
    } else {
        EngineError::DataFormat(e.to_string())
    }
}

fn field<'r>(record: &'r csv::StringRecord, idx: usize) -> &'r str {
    record.get(idx).map(str::trim).unwrap_or("")
}

/// Accumulates rows before series are sorted and validated
#[derive(Default)]
struct StoreBuilder {
    points: BTreeMap<SeriesKey, Vec<KpiPoint>>,
    missing: BTreeMap<String, usize>,
    sectors: BTreeMap<String, BTreeSet<String>>,
    rows: usize,
}

impl StoreBuilder {
    /// Series site for a row: the sector when present, indexed under its parent site.
    fn site_for(
        &mut self,
        record: &csv::StringRecord,
        site_col: usize,
        sector_col: Option<usize>,
    ) -> String {
        let site = field(record, site_col);
        match sector_col.map(|c| field(record, c)) {
            Some(sector) if !sector.is_empty() => {
                if !site.is_empty() && site != sector {
                    self.sectors
                        .entry(site.to_string())
                        .or_default()
                        .insert(sector.to_string());
                }
                sector.to_string()
            }
            _ => site.to_string(),
        }
    }

    fn timestamp(record: &csv::StringRecord, col: usize, line: usize) -> Result<DateTime<Utc>> {
        let raw = field(record, col);
        parse_timestamp(raw).ok_or_else(|| {
            EngineError::DataFormat(format!("line {line}: unparseable timestamp '{raw}'"))
        })
    }

    fn push(&mut self, key: SeriesKey, timestamp: DateTime<Utc>, raw: &str, line: usize) -> Result<()> {
        if raw.is_empty() || raw.eq_ignore_ascii_case("nan") {
            *self.missing.entry(key.kpi_name).or_default() += 1;
            return Ok(());
        }
        let value: f64 = raw.parse().map_err(|_| {
            EngineError::DataFormat(format!(
                "line {line}: non-numeric value '{raw}' for {key}"
            ))
        })?;
        self.points
            .entry(key)
            .or_default()
            .push(KpiPoint { timestamp, value });
        Ok(())
    }

    fn finish(self) -> Result<KpiStore> {
        let mut series = BTreeMap::new();
        for (key, points) in self.points {
            let s = KpiSeries::new(key.clone(), points)?;
            series.insert(key, Arc::new(s));
        }
        info!(
            rows = self.rows,
            series = series.len(),
            sectored_sites = self.sectors.len(),
            missing = self.missing.values().sum::<usize>(),
            "Loaded KPI store."
        );
        Ok(KpiStore {
            series,
            missing: self.missing,
            sectors: self.sectors,
            min_series_len: ShapeConfig::default().min_series_len(),
        })
    }
}

/// Read-only index of KPI series by (site, kpi)
#[derive(Debug, Clone)]
pub struct KpiStore {
    series: BTreeMap<SeriesKey, Arc<KpiSeries>>,
    missing: BTreeMap<String, usize>,
    /// Parent site -> sector ids used as series sites
    sectors: BTreeMap<String, BTreeSet<String>>,
    min_series_len: usize,
}

impl KpiStore {
    /// Load a long-format CSV file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!(path = %path.display(), "Opening long-format KPI table.");
        let file = std::fs::File::open(path)?;
        Self::from_reader(io::BufReader::new(file))
    }

    pub fn from_reader<R: io::Read>(reader: R) -> Result<Self> {
        let mut rdr = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_reader(reader);
        let headers = rdr.headers().map_err(csv_error)?.clone();

        let ts_col = require_column(&headers, TIMESTAMP_COLUMNS)?;
        let site_col = require_column(&headers, SITE_COLUMNS)?;
        let kpi_col = require_column(&headers, KPI_COLUMNS)?;
        let value_col = require_column(&headers, VALUE_COLUMNS)?;
        let sector_col = find_column(&headers, SECTOR_COLUMNS);

        let mut builder = StoreBuilder::default();
        for (idx, record) in rdr.records().enumerate() {
            let record = record.map_err(csv_error)?;
            let line = idx + 2;
            builder.rows += 1;

            let timestamp = StoreBuilder::timestamp(&record, ts_col, line)?;
            let site = builder.site_for(&record, site_col, sector_col);
            let kpi = field(&record, kpi_col);
            if site.is_empty() || kpi.is_empty() {
                return Err(EngineError::DataFormat(format!(
                    "line {line}: empty site_id or kpi_name"
                )));
            }
            builder.push(
                SeriesKey::new(site, kpi),
                timestamp,
                field(&record, value_col),
                line,
            )?;
        }
        builder.finish()
    }

    /// Load a wide-format CSV file (one column per KPI)
    pub fn load_wide(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!(path = %path.display(), "Opening wide-format KPI table.");
        let file = std::fs::File::open(path)?;
        Self::from_wide_reader(io::BufReader::new(file))
    }

    pub fn from_wide_reader<R: io::Read>(reader: R) -> Result<Self> {
        let mut rdr = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_reader(reader);
        let headers = rdr.headers().map_err(csv_error)?.clone();

        let ts_col = require_column(&headers, TIMESTAMP_COLUMNS)?;
        let site_col = require_column(&headers, SITE_COLUMNS)?;
        let sector_col = find_column(&headers, SECTOR_COLUMNS);
        let kpi_cols: Vec<(usize, String)> = headers
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != ts_col && *i != site_col && Some(*i) != sector_col)
            .map(|(i, h)| (i, h.trim().to_string()))
            .collect();
        if kpi_cols.is_empty() {
            return Err(EngineError::DataFormat("no KPI columns found".into()));
        }

        let mut builder = StoreBuilder::default();
        for (idx, record) in rdr.records().enumerate() {
            let record = record.map_err(csv_error)?;
            let line = idx + 2;
            builder.rows += 1;

            let timestamp = StoreBuilder::timestamp(&record, ts_col, line)?;
            let site = builder.site_for(&record, site_col, sector_col);
            if site.is_empty() {
                return Err(EngineError::DataFormat(format!("line {line}: empty site_id")));
            }
            for (col, kpi) in &kpi_cols {
                builder.push(
                    SeriesKey::new(site.clone(), kpi.clone()),
                    timestamp,
                    field(&record, *col),
                    line,
                )?;
            }
        }
        builder.finish()
    }

    /// Build from in-memory series
    pub fn from_series(series: impl IntoIterator<Item = KpiSeries>) -> Self {
        let series = series
            .into_iter()
            .map(|s| (s.key().clone(), Arc::new(s)))
            .collect();
        Self {
            series,
            missing: BTreeMap::new(),
            sectors: BTreeMap::new(),
            min_series_len: ShapeConfig::default().min_series_len(),
        }
    }

    pub fn with_min_series_len(mut self, min_series_len: usize) -> Self {
        self.min_series_len = min_series_len.max(1);
        self
    }

    pub fn min_series_len(&self) -> usize {
        self.min_series_len
    }

    /// Series for `key`, if it is long enough to analyze
    pub fn get(&self, key: &SeriesKey) -> Result<Arc<KpiSeries>> {
        match self.series.get(key) {
            Some(s) if s.len() >= self.min_series_len => Ok(Arc::clone(s)),
            found => Err(EngineError::EmptySeries {
                key: key.to_string(),
                len: found.map(|s| s.len()).unwrap_or(0),
                min: self.min_series_len,
            }),
        }
    }

    /// Series for `key` without the length requirement
    pub fn series(&self, key: &SeriesKey) -> Option<&Arc<KpiSeries>> {
        self.series.get(key)
    }

    /// Series for a site and KPI. A parent site without its own series
    /// resolves to its single sector, or to the per-timestamp mean across
    /// its sectors.
    pub fn site_series(&self, site_id: &str, kpi_name: &str) -> Option<KpiSeries> {
        let key = SeriesKey::new(site_id, kpi_name);
        if let Some(series) = self.series.get(&key) {
            return Some(KpiSeries::clone(series));
        }

        let sectors: Vec<&Arc<KpiSeries>> = self
            .sectors
            .get(site_id)?
            .iter()
            .filter_map(|sector| self.series.get(&SeriesKey::new(sector.as_str(), kpi_name)))
            .collect();
        match sectors.as_slice() {
            [] => None,
            [only] => Some(KpiSeries {
                key,
                points: only.points.clone(),
            }),
            many => {
                let mut sums: BTreeMap<DateTime<Utc>, (f64, usize)> = BTreeMap::new();
                for series in many {
                    for p in &series.points {
                        let slot = sums.entry(p.timestamp).or_default();
                        slot.0 += p.value;
                        slot.1 += 1;
                    }
                }
                let points = sums
                    .into_iter()
                    .map(|(timestamp, (sum, n))| KpiPoint {
                        timestamp,
                        value: sum / n as f64,
                    })
                    .collect();
                Some(KpiSeries { key, points })
            }
        }
    }

    pub fn slice(
        &self,
        series: &KpiSeries,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<KpiSeries> {
        series.slice(start, end)
    }

    pub fn len(&self) -> usize {
        self.series.len()
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<KpiSeries>> {
        self.series.values()
    }

    pub fn keys(&self) -> impl Iterator<Item = &SeriesKey> {
        self.series.keys()
    }

    /// Keys filtered by optional site and KPI. A parent site id also
    /// matches the series of its sectors.
    pub fn keys_matching(&self, site_id: Option<&str>, kpi_name: Option<&str>) -> Vec<SeriesKey> {
        self.series
            .keys()
            .filter(|k| site_id.is_none_or(|s| self.site_matches(&k.site_id, s)))
            .filter(|k| kpi_name.is_none_or(|kpi| k.kpi_name == kpi))
            .cloned()
            .collect()
    }

    /// Whether the series site `series_site` is `site_id` or one of its sectors
    pub fn site_matches(&self, series_site: &str, site_id: &str) -> bool {
        series_site == site_id
            || self
                .sectors
                .get(site_id)
                .is_some_and(|sectors| sectors.contains(series_site))
    }

    /// Sector ids loaded for a parent site
    pub fn sectors_of(&self, site_id: &str) -> Option<&BTreeSet<String>> {
        self.sectors.get(site_id)
    }

    pub fn sites(&self) -> BTreeSet<&str> {
        self.series.keys().map(|k| k.site_id.as_str()).collect()
    }

    pub fn kpis(&self) -> BTreeSet<&str> {
        self.series.keys().map(|k| k.kpi_name.as_str()).collect()
    }

    /// Empty cells skipped during load, per KPI
    pub fn missing_counts(&self) -> &BTreeMap<String, usize> {
        &self.missing
    }
}
