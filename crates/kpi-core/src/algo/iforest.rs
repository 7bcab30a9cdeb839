//! Isolation Forest Density Detector
//!
//! Points that are easy to separate from the rest of the series (short
//! average path length across random trees) are outliers in value space,
//! regardless of where they sit in time.
//!
//! Key properties:
//! - Seeded `ChaCha8Rng`, trees built in order: same input and seed give
//!   bit-identical scores
//! - Subsample of `min(subsample_size, n)` points per tree, drawn without
//!   replacement
//! - Optional rolling mean / variance / rate-of-change features
//!
//! Reference: "Isolation Forest" (Liu, Ting, Zhou, ICDM 2008)

use super::normalize::normalize;
use crate::config::DensityConfig;
use crate::error::{EngineError, Result};
use crate::signal::{DetectorId, DetectorScore};
use crate::store::KpiSeries;
use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

/// Euler-Mascheroni constant
const EULER_GAMMA: f64 = 0.577_215_664_9;

/// A node in an isolation tree
#[derive(Debug, Clone)]
enum IsoNode {
    Internal {
        feature: usize,
        threshold: f64,
        left: Box<IsoNode>,
        right: Box<IsoNode>,
    },
    /// Unsplit remainder of the subsample
    Leaf { size: usize },
}

#[derive(Debug, Clone)]
struct IsolationTree {
    root: IsoNode,
}

impl IsolationTree {
    fn fit(rows: &[Vec<f64>], indices: &mut [usize], max_depth: usize, rng: &mut ChaCha8Rng) -> Self {
        Self {
            root: grow(rows, indices, 0, max_depth, rng),
        }
    }

    fn path_length(&self, point: &[f64]) -> f64 {
        let mut node = &self.root;
        let mut depth = 0usize;
        loop {
            match node {
                IsoNode::Internal {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    node = if point[*feature] <= *threshold { left } else { right };
                    depth += 1;
                }
                IsoNode::Leaf { size } => return depth as f64 + average_path_length(*size),
            }
        }
    }
}

fn grow(
    rows: &[Vec<f64>],
    indices: &mut [usize],
    depth: usize,
    max_depth: usize,
    rng: &mut ChaCha8Rng,
) -> IsoNode {
    if indices.len() <= 1 || depth >= max_depth {
        return IsoNode::Leaf { size: indices.len() };
    }

    let dims = rows[indices[0]].len();
    let splittable: Vec<(usize, f64, f64)> = (0..dims)
        .filter_map(|feature| {
            let (lo, hi) = indices.iter().fold(
                (f64::INFINITY, f64::NEG_INFINITY),
                |(lo, hi), &i| (lo.min(rows[i][feature]), hi.max(rows[i][feature])),
            );
            (hi > lo).then_some((feature, lo, hi))
        })
        .collect();
    if splittable.is_empty() {
        return IsoNode::Leaf { size: indices.len() };
    }

    let (feature, lo, hi) = splittable[rng.random_range(0..splittable.len())];
    let threshold = cut_between(lo, hi, rng);

    // In-place partition: `<= threshold` to the front
    let mut split = 0;
    for k in 0..indices.len() {
        if rows[indices[k]][feature] <= threshold {
            indices.swap(split, k);
            split += 1;
        }
    }
    let (left, right) = indices.split_at_mut(split);

    IsoNode::Internal {
        feature,
        threshold,
        left: Box::new(grow(rows, left, depth + 1, max_depth, rng)),
        right: Box::new(grow(rows, right, depth + 1, max_depth, rng)),
    }
}

/// Uniform cut in `[lo, hi)`; a convex blend so spans wider than
/// `f64::MAX` stay finite.
fn cut_between(lo: f64, hi: f64, rng: &mut ChaCha8Rng) -> f64 {
    if (hi - lo).is_finite() {
        return rng.random_range(lo..hi);
    }
    let u: f64 = rng.random();
    let cut = lo * (1.0 - u) + hi * u;
    if cut < hi { cut.max(lo) } else { lo }
}

/// Average unsuccessful-search path length in a BST of `n` points.
pub fn average_path_length(n: usize) -> f64 {
    match n {
        0 | 1 => 0.0,
        2 => 1.0,
        _ => {
            let n = n as f64;
            2.0 * ((n - 1.0).ln() + EULER_GAMMA) - 2.0 * (n - 1.0) / n
        }
    }
}

/// Fitted forest over a fixed feature matrix
#[derive(Debug, Clone)]
pub struct IsolationForest {
    trees: Vec<IsolationTree>,
    sample_size: usize,
}

impl IsolationForest {
    pub fn fit(rows: &[Vec<f64>], n_trees: usize, subsample_size: usize, seed: u64) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let sample_size = subsample_size.min(rows.len());
        let max_depth = (sample_size.max(2) as f64).log2().ceil() as usize;

        let trees = (0..n_trees)
            .map(|_| {
                let mut indices =
                    rand::seq::index::sample(&mut rng, rows.len(), sample_size).into_vec();
                IsolationTree::fit(rows, &mut indices, max_depth, &mut rng)
            })
            .collect();

        Self { trees, sample_size }
    }

    /// Mean path length over all trees
    pub fn expected_path_length(&self, point: &[f64]) -> f64 {
        if self.trees.is_empty() {
            return 0.0;
        }
        let total: f64 = self.trees.iter().map(|t| t.path_length(point)).sum();
        total / self.trees.len() as f64
    }

    /// Isolation score `2^(-E[h(x)] / c(psi))`; near 1 for outliers, around
    /// 0.5 or below for inliers.
    pub fn anomaly_score(&self, point: &[f64]) -> f64 {
        let c = average_path_length(self.sample_size);
        if c <= 0.0 {
            return 0.0;
        }
        2f64.powf(-self.expected_path_length(point) / c)
    }
}

/// Feature rows: value, then (if enabled) rolling mean, rolling variance and
/// rate of change over a trailing window.
pub fn build_features(values: &[f64], rolling_window: Option<usize>) -> Vec<Vec<f64>> {
    let Some(window) = rolling_window else {
        return values.iter().map(|&v| vec![v]).collect();
    };

    values
        .iter()
        .enumerate()
        .map(|(i, &v)| {
            let start = (i + 1).saturating_sub(window);
            let trailing = &values[start..=i];
            let len = trailing.len() as f64;
            let mean = trailing.iter().sum::<f64>() / len;
            let variance = trailing.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / len;
            let rate = if i == 0 { 0.0 } else { v - values[i - 1] };
            vec![v, mean, variance, rate]
        })
        .collect()
}

/// Score every point of `series` by isolation ease.
pub fn score(series: &KpiSeries, config: &DensityConfig) -> Result<Vec<DetectorScore>> {
    if series.len() < config.min_samples {
        return Err(EngineError::InsufficientData {
            detector: DetectorId::Density,
            required: config.min_samples,
            actual: series.len(),
        });
    }

    let rows = build_features(&series.values(), config.rolling_window);
    let raw: Vec<f64> = if all_constant(&rows) {
        vec![0.0; rows.len()]
    } else {
        let forest = IsolationForest::fit(&rows, config.n_trees, config.subsample_size, config.seed);
        rows.iter().map(|row| forest.anomaly_score(row)).collect()
    };
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
            detector_id: DetectorId::Density,
        })
        .collect())
}

fn all_constant(rows: &[Vec<f64>]) -> bool {
    match rows.first() {
        Some(first) => rows.iter().all(|row| row == first),
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SeriesKey;
    use chrono::{Duration, TimeZone, Utc};

    fn hourly(values: &[f64]) -> KpiSeries {
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        KpiSeries::from_pairs(
            SeriesKey::new("S2", "Packet_Loss"),
            values
                .iter()
                .enumerate()
                .map(|(i, &v)| (start + Duration::hours(i as i64), v)),
        )
        .unwrap()
    }

    fn wobble(len: usize) -> Vec<f64> {
        (0..len)
            .map(|i| 50.0 + (i as f64 * 0.7).sin() + 0.5 * (i as f64 * 1.3).cos())
            .collect()
    }

    #[test]
    fn test_average_path_length() {
        assert_eq!(average_path_length(0), 0.0);
        assert_eq!(average_path_length(1), 0.0);
        assert_eq!(average_path_length(2), 1.0);
        assert!((average_path_length(256) - 10.2447).abs() < 1e-3);
    }

    #[test]
    fn test_spike_is_isolated() {
        for (position, seed) in [(30, 42), (120, 7), (199, 1234)] {
            let mut values = wobble(200);
            values[position] += 10.0;
            let config = DensityConfig {
                seed,
                ..DensityConfig::default()
            };
            let scores = score(&hourly(&values), &config).unwrap();
            assert!(
                scores[position].normalized_score > 0.8,
                "spike at {position} scored {}",
                scores[position].normalized_score
            );
        }
    }

    #[test]
    fn test_constant_series_scores_zero() {
        let config = DensityConfig {
            rolling_window: Some(6),
            ..DensityConfig::default()
        };
        let scores = score(&hourly(&[3.0; 48]), &config).unwrap();
        assert!(scores
            .iter()
            .all(|s| s.raw_score == 0.0 && s.normalized_score == 0.0));
    }

    #[test]
    fn test_too_few_samples() {
        let err = score(&hourly(&[1.0, 2.0, 3.0]), &DensityConfig::default()).unwrap_err();
        assert!(matches!(
            err,
            EngineError::InsufficientData {
                detector: DetectorId::Density,
                required: 10,
                actual: 3,
            }
        ));
    }

    #[test]
    fn test_same_seed_is_bit_identical() {
        let mut values = wobble(300);
        values[77] = 80.0;
        let series = hourly(&values);
        let config = DensityConfig {
            rolling_window: Some(12),
            ..DensityConfig::default()
        };

        let a = score(&series, &config).unwrap();
        let b = score(&series, &config).unwrap();
        assert_eq!(a, b);

        let other = DensityConfig { seed: 9, ..config };
        let c = score(&series, &other).unwrap();
        assert_ne!(
            a.iter().map(|s| s.raw_score).collect::<Vec<_>>(),
            c.iter().map(|s| s.raw_score).collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_extreme_magnitudes_still_split() {
        let mut values = wobble(64);
        values[10] = 1e308;
        values[40] = -1e308;
        let scores = score(&hourly(&values), &DensityConfig::default()).unwrap();

        assert_eq!(scores.len(), 64);
        assert!(scores.iter().all(|s| s.raw_score.is_finite()));
        assert!(scores[10].normalized_score > scores[20].normalized_score);

        let mut rng = ChaCha8Rng::seed_from_u64(3);
        for _ in 0..1000 {
            let cut = cut_between(-f64::MAX, f64::MAX, &mut rng);
            assert!(cut.is_finite() && cut < f64::MAX);
        }
    }

    #[test]
    fn test_rolling_features() {
        let rows = build_features(&[1.0, 3.0, 5.0, 5.0], Some(2));
        assert_eq!(rows[0], vec![1.0, 1.0, 0.0, 0.0]);
        assert_eq!(rows[1], vec![3.0, 2.0, 1.0, 2.0]);
        assert_eq!(rows[3], vec![5.0, 5.0, 0.0, 0.0]);
        assert_eq!(build_features(&[1.0, 2.0], None), vec![vec![1.0], vec![2.0]]);
    }
}
