//! DWT-MLEAD Shape Detector
//!
//! Finds discords (subsequences unlike any other part of the series) at
//! several time scales at once.
//!
//! Pipeline per series:
//! - Remove a least-squares linear trend and z-score the residual
//! - Haar-decompose the residual; a level is used only while it still has
//!   `4 * window` detail coefficients
//! - At each level, score every window of `window` coefficients by the
//!   distance to its nearest non-overlapping neighbour window
//! - Map window scores back to the timestamps they cover, keeping the
//!   maximum across windows and levels
//! - Normalize per series to [0, 1]
//!
//! Runs are deterministic: there is no randomness anywhere in the pipeline.

use super::normalize::normalize;
use super::wavelet::haar_decompose;
use crate::config::ShapeConfig;
use crate::error::{EngineError, Result};
use crate::signal::{DetectorId, DetectorScore};
use crate::store::KpiSeries;

/// Residual standard deviations below this (relative to the signal's
/// magnitude) mean the series has no shape left to score.
const FLAT_RESIDUAL: f64 = 1e-12;

/// Score every point of `series` by shape unusualness.
pub fn score(series: &KpiSeries, config: &ShapeConfig) -> Result<Vec<DetectorScore>> {
    let required = config.min_series_len();
    if series.len() < required {
        return Err(EngineError::InsufficientData {
            detector: DetectorId::Shape,
            required,
            actual: series.len(),
        });
    }

    let raw = discord_profile(&series.values(), config);
    let normalized = normalize(&raw, config.normalization);

    Ok(series
        .points()
        .iter()
        .zip(raw.iter().zip(normalized))
        .map(|(point, (&raw_score, normalized_score))| DetectorScore {
            site_id: series.site_id().to_string(),
            kpi_name: series.kpi_name().to_string(),
            timestamp: point.timestamp,
            raw_score,
            normalized_score,
            detector_id: DetectorId::Shape,
        })
        .collect())
}

/// Raw per-timestamp discord distance (before normalization).
pub fn discord_profile(values: &[f64], config: &ShapeConfig) -> Vec<f64> {
    let n = values.len();
    let mut profile = vec![0.0; n];
    let Some(standardized) = standardized_residual(values) else {
        return profile;
    };

    let window = config.window.max(1);
    let levels = haar_decompose(&standardized, config.max_levels, config.min_level_coefficients());

    for level in &levels {
        let span = level.span();
        let distances = nearest_neighbor_distances(&level.details, window);
        for (j, &distance) in distances.iter().enumerate() {
            let start = (j * span).min(n);
            let end = ((j + window) * span).min(n);
            for slot in &mut profile[start..end] {
                if distance > *slot {
                    *slot = distance;
                }
            }
        }
    }

    profile
}

/// Sort by normalized score descending, ties broken by earlier timestamp.
pub fn top_discords(scores: &[DetectorScore], k: usize) -> Vec<DetectorScore> {
    let mut ranked: Vec<&DetectorScore> = scores.iter().collect();
    ranked.sort_by(|a, b| {
        b.normalized_score
            .total_cmp(&a.normalized_score)
            .then(a.timestamp.cmp(&b.timestamp))
    });
    ranked.into_iter().take(k).cloned().collect()
}

/// Detrended, z-scored values; `None` when nothing but a line remains.
fn standardized_residual(values: &[f64]) -> Option<Vec<f64>> {
    let n = values.len();
    if n < 2 {
        return None;
    }
    let (lo, hi) = values
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
    if hi <= lo {
        return None;
    }

    let nf = n as f64;
    let t_mean = (nf - 1.0) / 2.0;
    let x_mean = values.iter().sum::<f64>() / nf;
    let (mut cov, mut var_t) = (0.0, 0.0);
    for (t, &x) in values.iter().enumerate() {
        let dt = t as f64 - t_mean;
        cov += dt * (x - x_mean);
        var_t += dt * dt;
    }
    let slope = cov / var_t;
    let intercept = x_mean - slope * t_mean;

    let residual: Vec<f64> = values
        .iter()
        .enumerate()
        .map(|(t, &x)| x - (intercept + slope * t as f64))
        .collect();
    let mean = residual.iter().sum::<f64>() / nf;
    let std = (residual.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / nf).sqrt();

    let magnitude = lo.abs().max(hi.abs()).max(1.0);
    if !(std > FLAT_RESIDUAL * magnitude) {
        return None;
    }
    Some(residual.iter().map(|r| (r - mean) / std).collect())
}

/// Euclidean distance from each length-`window` window to its nearest
/// neighbour among windows that do not overlap it.
fn nearest_neighbor_distances(coefficients: &[f64], window: usize) -> Vec<f64> {
    if coefficients.len() < window {
        return Vec::new();
    }
    let count = coefficients.len() - window + 1;
    let mut best = vec![f64::INFINITY; count];

    for i in 0..count {
        let a = &coefficients[i..i + window];
        for j in (i + window)..count {
            let b = &coefficients[j..j + window];
            let d: f64 = a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum();
            if d < best[i] {
                best[i] = d;
            }
            if d < best[j] {
                best[j] = d;
            }
        }
    }

    best.into_iter()
        .map(|d| if d.is_finite() { d.sqrt() } else { 0.0 })
        .collect()
}
