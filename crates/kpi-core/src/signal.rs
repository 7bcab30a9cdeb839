//! Detector Scores and Fused Verdicts
//!
//! These are the values that flow out of the two detectors and out of the
//! voting stage. They are produced once per run and never mutated; reports
//! and the result cache are built from them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Detector identifiers for attribution
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DetectorId {
    /// DWT-MLEAD wavelet discord detector
    Shape,
    /// Isolation Forest detector
    Density,
}

impl DetectorId {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Shape => "Shape/DWT-MLEAD",
            Self::Density => "Density/IsolationForest",
        }
    }
}

impl fmt::Display for DetectorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Severity bands over the fused confidence
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    #[default]
    None,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn from_score(score: f64) -> Self {
        if score >= 0.9 {
            Self::Critical
        } else if score >= 0.75 {
            Self::High
        } else if score >= 0.6 {
            Self::Medium
        } else if score >= 0.4 {
            Self::Low
        } else {
            Self::None
        }
    }
}

/// One detector's opinion about one observation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectorScore {
    pub site_id: String,
    pub kpi_name: String,
    pub timestamp: DateTime<Utc>,
    /// Detector-native statistic (discord distance, isolation score)
    pub raw_score: f64,
    /// Per-series scaled score in [0, 1]
    pub normalized_score: f64,
    pub detector_id: DetectorId,
}

/// Fused per-point decision with explanation metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyVerdict {
    pub site_id: String,
    pub kpi_name: String,
    pub timestamp: DateTime<Utc>,
    /// Observed KPI value at this timestamp
    pub value: f64,
    pub is_anomaly: bool,
    /// Weighted combination of both normalized scores
    pub confidence: f64,
    pub severity: Severity,
    pub shape_score: f64,
    pub density_score: f64,
    pub contributing_detectors: BTreeSet<DetectorId>,
}

impl AnomalyVerdict {
    /// One-line explanation suitable for a chat answer
    pub fn reason(&self) -> String {
        if !self.is_anomaly {
            return "No anomaly".to_string();
        }
        let detectors: Vec<&str> = self
            .contributing_detectors
            .iter()
            .map(|d| d.name())
            .collect();
        format!(
            "{} {} at {}: value {:.2}, confidence {:.2} ({:?}) flagged by [{}]",
            self.site_id,
            self.kpi_name,
            self.timestamp.format("%Y-%m-%d %H:%M"),
            self.value,
            self.confidence,
            self.severity,
            detectors.join(", ")
        )
    }
}
