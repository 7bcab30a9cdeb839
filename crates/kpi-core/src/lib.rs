//! KPI anomaly detection core.
//!
//! Loads per-site KPI time series, scores them with a wavelet discord
//! detector and an Isolation Forest, fuses both through a configurable vote
//! and aggregates the verdicts into reports for a query layer.

pub mod algo;
pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod fusion;
pub mod insights;
pub mod metrics;
pub mod report;
pub mod signal;
pub mod store;

pub use config::{DetectionConfig, EngineConfig, FusionConfig, VotePolicy};
pub use engine::{AnomalyEngine, PairBatch};
pub use error::{EngineError, PairFailure, Result};
pub use report::{AnomalyReport, ReportScope, build_report};
pub use signal::{AnomalyVerdict, DetectorId, DetectorScore, Severity};
pub use store::{DateRange, KpiSeries, KpiStore, SeriesKey};
