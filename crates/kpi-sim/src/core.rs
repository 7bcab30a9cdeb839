//! Core Types for kpi-sim
//!
//! Hourly KPI series under construction, the ground truth recorded while
//! anomalies are injected, and the finished dataset handed to the engine.

use chrono::{DateTime, Utc};
use kpi_core::{KpiSeries, KpiStore, Result, SeriesKey};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::io;

/// Mutable series before it is frozen into a `KpiSeries`
#[derive(Debug, Clone, PartialEq)]
pub struct SeriesDraft {
    pub key: SeriesKey,
    pub timestamps: Vec<DateTime<Utc>>,
    pub values: Vec<f64>,
}

impl SeriesDraft {
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Mean absolute level, used to size injected anomalies
    pub fn scale(&self) -> f64 {
        if self.values.is_empty() {
            return 1.0;
        }
        let mean_abs = self.values.iter().map(|v| v.abs()).sum::<f64>() / self.values.len() as f64;
        mean_abs.max(1.0)
    }

    pub fn freeze(&self) -> Result<KpiSeries> {
        KpiSeries::from_pairs(
            self.key.clone(),
            self.timestamps.iter().copied().zip(self.values.iter().copied()),
        )
    }
}

/// One injected anomaly and the timestamps it rewrote
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroundTruth {
    pub anomaly_id: String,
    pub scenario: String,
    pub site_id: String,
    pub kpi_name: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub timestamps: Vec<DateTime<Utc>>,
}

impl GroundTruth {
    pub fn key(&self) -> SeriesKey {
        SeriesKey::new(&self.site_id, &self.kpi_name)
    }
}

/// Generated series plus everything that was injected into them
#[derive(Debug, Clone, Default)]
pub struct SimulatedDataset {
    pub series: Vec<SeriesDraft>,
    pub ground_truth: Vec<GroundTruth>,
}

impl SimulatedDataset {
    pub fn keys(&self) -> Vec<SeriesKey> {
        self.series.iter().map(|s| s.key.clone()).collect()
    }

    pub fn point_count(&self) -> usize {
        self.series.iter().map(SeriesDraft::len).sum()
    }

    /// Every (series, timestamp) marked anomalous
    pub fn anomalous_points(&self) -> BTreeSet<(SeriesKey, DateTime<Utc>)> {
        self.ground_truth
            .iter()
            .flat_map(|gt| gt.timestamps.iter().map(move |ts| (gt.key(), *ts)))
            .collect()
    }

    pub fn to_store(&self) -> Result<KpiStore> {
        let series = self
            .series
            .iter()
            .map(SeriesDraft::freeze)
            .collect::<Result<Vec<_>>>()?;
        Ok(KpiStore::from_series(series))
    }

    /// Long-format CSV (`timestamp,site_id,kpi_name,value`), the layout
    /// `KpiStore::load` reads back.
    pub fn write_csv<W: io::Write>(&self, writer: W) -> io::Result<()> {
        let mut wtr = csv::Writer::from_writer(writer);
        wtr.write_record(["timestamp", "site_id", "kpi_name", "value"])?;
        for draft in &self.series {
            for (ts, value) in draft.timestamps.iter().zip(&draft.values) {
                wtr.write_record([
                    ts.format("%Y-%m-%d %H:%M:%S").to_string(),
                    draft.key.site_id.clone(),
                    draft.key.kpi_name.clone(),
                    format!("{value:.4}"),
                ])?;
            }
        }
        wtr.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn draft(values: Vec<f64>) -> SeriesDraft {
        let t0 = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        SeriesDraft {
            key: SeriesKey::new("SITE_001", "SINR"),
            timestamps: (0..values.len()).map(|h| t0 + Duration::hours(h as i64)).collect(),
            values,
        }
    }

    #[test]
    fn test_scale_floors_at_one() {
        assert_eq!(draft(vec![0.1, -0.2, 0.3]).scale(), 1.0);
        assert_eq!(draft(vec![-90.0, -110.0]).scale(), 100.0);
    }

    #[test]
    fn test_csv_round_trips_through_store() {
        let dataset = SimulatedDataset {
            series: vec![draft((0..40).map(|h| 10.0 + h as f64 * 0.25).collect())],
            ground_truth: Vec::new(),
        };
        let mut buf = Vec::new();
        dataset.write_csv(&mut buf).unwrap();

        let store = KpiStore::from_reader(buf.as_slice()).unwrap();
        let series = store.series(&SeriesKey::new("SITE_001", "SINR")).unwrap();
        assert_eq!(series.len(), 40);
        assert_eq!(series.values()[39], 10.0 + 39.0 * 0.25);
    }

    #[test]
    fn test_anomalous_points_are_keyed_by_series() {
        let t0 = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        let dataset = SimulatedDataset {
            series: Vec::new(),
            ground_truth: vec![GroundTruth {
                anomaly_id: "spike-0".into(),
                scenario: "spike".into(),
                site_id: "SITE_002".into(),
                kpi_name: "RTT".into(),
                start: t0,
                end: t0 + Duration::hours(1),
                timestamps: vec![t0, t0 + Duration::hours(1)],
            }],
        };
        let points = dataset.anomalous_points();
        assert_eq!(points.len(), 2);
        assert!(points.contains(&(SeriesKey::new("SITE_002", "RTT"), t0)));
    }
}
