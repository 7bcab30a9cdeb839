//! Simulation Scenarios
//!
//! Anomaly shapes injected into clean synthetic series:
//! - **level**: short spikes and dips against the series level
//! - **degradation**: slow drift and a stuck (flatlined) counter

pub mod degradation;
pub mod level;

use crate::core::SeriesDraft;
use std::ops::Range;

/// Trait for anomaly scenarios
///
/// A scenario rewrites part of a series in place. The indices it returns
/// are recorded as ground truth.
pub trait Scenario: Send {
    /// Registry name of the scenario
    fn name(&self) -> &str;

    /// Hours the anomaly lasts when no duration is given
    fn default_hours(&self) -> usize;

    /// Rewrite `window` of `draft` (clipped to the series) and return the
    /// indices that now hold anomalous values.
    fn inject(&self, draft: &mut SeriesDraft, window: Range<usize>) -> Vec<usize>;
}

pub use degradation::{Drift, Flatline};
pub use level::{Dip, Spike};

/// Clip `window` to a series of length `len`
pub(crate) fn clip(window: Range<usize>, len: usize) -> Range<usize> {
    window.start.min(len)..window.end.min(len)
}

/// Create a scenario by name with default parameters
pub fn create_scenario(name: &str) -> Option<Box<dyn Scenario>> {
    match name.trim().to_lowercase().as_str() {
        "spike" | "surge" => Some(Box::new(Spike::new(0.5))),
        "dip" | "drop" => Some(Box::new(Dip::new(0.5))),
        "drift" | "degradation" => Some(Box::new(Drift::new(0.6))),
        "flatline" | "stuck" => Some(Box::new(Flatline)),
        _ => None,
    }
}

/// List all available scenarios
pub fn list_scenarios() -> Vec<(&'static str, &'static str)> {
    vec![
        ("spike", "Short jump above the series level"),
        ("dip", "Short drop below the series level, e.g. SINR halving"),
        ("drift", "Gradual ramp away from the baseline over half a day"),
        ("flatline", "Counter stuck at one value for several hours"),
    ]
}
