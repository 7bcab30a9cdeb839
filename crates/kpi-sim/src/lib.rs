//! # kpi-sim - Synthetic KPI Data with Ground Truth
//!
//! Generates hourly per-site KPI series, injects controlled anomalies and
//! tracks exactly which points were touched, so the detection engine can be
//! benchmarked with precision / recall / F1.
//!
//! ## Key Design Principles
//!
//! 1. **No Detection Logic** - Simulation only produces data and ground
//!    truth. Detection runs in `kpi-core`; `bench` only compares.
//!
//! 2. **Scenario-Based** - Every anomaly goes through the `Scenario` trait.
//!
//! 3. **Seeded** - The same `SyntheticConfig` always yields the same data,
//!    and scheduling anomalies never perturbs the clean series.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use kpi_sim::{Injection, SimulationEngine, SyntheticConfig};
//! use kpi_core::SeriesKey;
//!
//! let mut sim = SimulationEngine::new(SyntheticConfig::default()).unwrap();
//! sim.schedule(Injection::new("dip", SeriesKey::new("SITE_001", "SINR"), 100)).unwrap();
//! sim.schedule_random("spike", 3).unwrap();
//! let dataset = sim.run().unwrap();
//! dataset.write_csv(std::io::stdout()).unwrap();
//! ```

pub mod bench;
pub mod core;
pub mod engine;
pub mod generator;
pub mod scenarios;

pub use bench::{BenchResult, EventRecall, PointScore};
pub use core::{GroundTruth, SeriesDraft, SimulatedDataset};
pub use engine::{Injection, SimulationEngine};
pub use generator::{KpiProfile, SyntheticConfig};
pub use scenarios::{Dip, Drift, Flatline, Scenario, Spike, create_scenario, list_scenarios};
