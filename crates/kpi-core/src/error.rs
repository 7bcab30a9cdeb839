//! Engine error taxonomy.

use crate::signal::DetectorId;
use serde::{Deserialize, Serialize};

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EngineError {
    /// Malformed or missing input columns, unparseable timestamps
    #[error("data format error: {0}")]
    DataFormat(String),

    #[error("series {key} has {len} points, fewer than the required {min}")]
    EmptySeries { key: String, len: usize, min: usize },

    #[error("no points of {key} fall between {start} and {end}")]
    EmptyRange {
        key: String,
        start: String,
        end: String,
    },

    #[error("{detector} needs at least {required} points, got {actual}")]
    InsufficientData {
        detector: DetectorId,
        required: usize,
        actual: usize,
    },

    #[error("analysis of {key} exceeded its {budget_ms}ms budget")]
    Timeout { key: String, budget_ms: u64 },

    /// A detector stopped without producing scores
    #[error("detector failure: {0}")]
    Detector(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("i/o error: {0}")]
    Io(String),

    #[error("cache error: {0}")]
    Cache(String),
}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

/// Category of a per-pair failure attached to a report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    EmptySeries,
    EmptyRange,
    InsufficientData,
    Timeout,
    Other,
}

impl FailureKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::EmptySeries => "empty_series",
            Self::EmptyRange => "empty_range",
            Self::InsufficientData => "insufficient_data",
            Self::Timeout => "timeout",
            Self::Other => "other",
        }
    }
}

impl From<&EngineError> for FailureKind {
    fn from(e: &EngineError) -> Self {
        match e {
            EngineError::EmptySeries { .. } => Self::EmptySeries,
            EngineError::EmptyRange { .. } => Self::EmptyRange,
            EngineError::InsufficientData { .. } => Self::InsufficientData,
            EngineError::Timeout { .. } => Self::Timeout,
            _ => Self::Other,
        }
    }
}

/// A (site, kpi) pair that was skipped, and why
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairFailure {
    pub site_id: String,
    pub kpi_name: String,
    pub kind: FailureKind,
    pub message: String,
}

impl PairFailure {
    pub fn new(site_id: &str, kpi_name: &str, error: &EngineError) -> Self {
        Self {
            site_id: site_id.to_string(),
            kpi_name: kpi_name.to_string(),
            kind: FailureKind::from(error),
            message: error.to_string(),
        }
    }
}
