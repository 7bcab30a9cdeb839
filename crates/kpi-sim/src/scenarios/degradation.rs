//! Degradation Anomalies
//!
//! Slow failures that a point-wise threshold misses: a ramp away from the
//! baseline and a counter that stops updating.

use crate::core::SeriesDraft;
use crate::scenarios::{Scenario, clip};
use std::ops::Range;

/// Linear ramp that reaches `magnitude * scale` at the end of the window
pub struct Drift {
    pub magnitude: f64,
}

impl Drift {
    pub fn new(magnitude: f64) -> Self {
        Self { magnitude }
    }
}

impl Scenario for Drift {
    fn name(&self) -> &str {
        "drift"
    }

    fn default_hours(&self) -> usize {
        12
    }

    fn inject(&self, draft: &mut SeriesDraft, window: Range<usize>) -> Vec<usize> {
        let window = clip(window, draft.len());
        let steps = window.len();
        let peak = self.magnitude * draft.scale();
        for (i, v) in draft.values[window.clone()].iter_mut().enumerate() {
            *v += peak * (i + 1) as f64 / steps as f64;
        }
        window.collect()
    }
}

/// Repeats the value just before the window, as a stuck counter would
pub struct Flatline;

impl Scenario for Flatline {
    fn name(&self) -> &str {
        "flatline"
    }

    fn default_hours(&self) -> usize {
        6
    }

    fn inject(&self, draft: &mut SeriesDraft, window: Range<usize>) -> Vec<usize> {
        let window = clip(window, draft.len());
        let Some(&held) = window
            .start
            .checked_sub(1)
            .and_then(|i| draft.values.get(i))
            .or_else(|| draft.values.get(window.start))
        else {
            return Vec::new();
        };
        // Hours that already equal the held value are not anomalous.
        let mut marked = Vec::new();
        for i in window {
            if draft.values[i] != held {
                draft.values[i] = held;
                marked.push(i);
            }
        }
        marked
    }
}
