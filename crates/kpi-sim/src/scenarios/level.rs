//! Level Anomalies
//!
//! Spikes and dips shift a few consecutive hours by a fraction of the
//! series' mean absolute level.

use crate::core::SeriesDraft;
use crate::scenarios::{Scenario, clip};
use std::ops::Range;

/// Sudden rise, e.g. an RTT or packet loss surge
pub struct Spike {
    pub magnitude: f64,
}

impl Spike {
    pub fn new(magnitude: f64) -> Self {
        Self { magnitude }
    }
}

impl Scenario for Spike {
    fn name(&self) -> &str {
        "spike"
    }

    fn default_hours(&self) -> usize {
        2
    }

    fn inject(&self, draft: &mut SeriesDraft, window: Range<usize>) -> Vec<usize> {
        shift(draft, window, self.magnitude)
    }
}

/// Sudden drop, e.g. SINR or throughput collapsing for a few hours
pub struct Dip {
    pub magnitude: f64,
}

impl Dip {
    pub fn new(magnitude: f64) -> Self {
        Self { magnitude }
    }
}

impl Scenario for Dip {
    fn name(&self) -> &str {
        "dip"
    }

    fn default_hours(&self) -> usize {
        3
    }

    fn inject(&self, draft: &mut SeriesDraft, window: Range<usize>) -> Vec<usize> {
        shift(draft, window, -self.magnitude)
    }
}

fn shift(draft: &mut SeriesDraft, window: Range<usize>, fraction: f64) -> Vec<usize> {
    let delta = fraction * draft.scale();
    let window = clip(window, draft.len());
    for v in &mut draft.values[window.clone()] {
        *v += delta;
    }
    window.collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use kpi_core::SeriesKey;

    fn flat(level: f64, len: usize) -> SeriesDraft {
        SeriesDraft {
            key: SeriesKey::new("SITE_001", "SINR"),
            timestamps: Vec::new(),
            values: vec![level; len],
        }
    }

    #[test]
    fn test_dip_halves_level() {
        let mut draft = flat(20.0, 10);
        let marked = Dip::new(0.5).inject(&mut draft, 4..7);

        assert_eq!(marked, vec![4, 5, 6]);
        assert_eq!(draft.values[3], 20.0);
        assert_eq!(draft.values[4], 10.0);
        assert_eq!(draft.values[7], 20.0);
    }

    #[test]
    fn test_spike_scales_with_magnitude_of_negative_series() {
        let mut draft = flat(-100.0, 6);
        Spike::new(0.25).inject(&mut draft, 0..1);
        assert_eq!(draft.values[0], -75.0);
    }

    #[test]
    fn test_window_past_end_is_clipped() {
        let mut draft = flat(1.0, 5);
        let marked = Spike::new(1.0).inject(&mut draft, 3..9);
        assert_eq!(marked, vec![3, 4]);
    }
}
