//! Per-series score scaling to [0, 1].
//!
//! Both methods are non-decreasing in the raw score, so ranking by the
//! normalized score never disagrees with ranking by the raw one.

use crate::config::Normalization;

/// Score ranges at or below this are treated as flat (all zero).
const FLAT_TOLERANCE: f64 = 1e-9;

/// MAD to standard deviation under normality
const MAD_SCALE: f64 = 1.4826;

pub fn normalize(raw: &[f64], method: Normalization) -> Vec<f64> {
    match method {
        Normalization::MinMax => min_max(raw),
        Normalization::Robust { z_cap } => robust(raw, z_cap),
    }
}

pub fn min_max(raw: &[f64]) -> Vec<f64> {
    let (min, max) = raw
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &x| {
            (lo.min(x), hi.max(x))
        });
    let range = max - min;
    if !(range > FLAT_TOLERANCE) {
        return vec![0.0; raw.len()];
    }
    raw.iter()
        .map(|&x| ((x - min) / range).clamp(0.0, 1.0))
        .collect()
}

pub fn robust(raw: &[f64], z_cap: f64) -> Vec<f64> {
    if raw.is_empty() {
        return Vec::new();
    }
    let med = median(raw);
    let deviations: Vec<f64> = raw.iter().map(|x| (x - med).abs()).collect();
    let scale = MAD_SCALE * median(&deviations);

    if scale > FLAT_TOLERANCE {
        let cap = z_cap.max(FLAT_TOLERANCE);
        return raw
            .iter()
            .map(|&x| ((x - med) / scale / cap).clamp(0.0, 1.0))
            .collect();
    }

    // More than half the scores are identical: anything above them is scaled
    // against the largest excursion instead.
    let max_dev = deviations.iter().copied().fold(0.0, f64::max);
    if max_dev <= FLAT_TOLERANCE {
        return vec![0.0; raw.len()];
    }
    raw.iter()
        .map(|&x| ((x - med) / max_dev).clamp(0.0, 1.0))
        .collect()
}

pub fn median(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}
