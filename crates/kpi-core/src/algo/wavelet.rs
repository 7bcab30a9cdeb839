//! Haar Discrete Wavelet Transform
//!
//! Orthonormal Haar analysis used by the shape detector. Each level halves the
//! resolution: detail coefficient `j` at level `l` summarizes the change
//! between the two halves of the original block `[j * 2^l, (j + 1) * 2^l)`.

use std::f64::consts::FRAC_1_SQRT_2;

/// Detail coefficients of one decomposition level
#[derive(Debug, Clone, PartialEq)]
pub struct HaarLevel {
    /// 1-based level; coefficient span in the original signal is `2^level`
    pub level: usize,
    pub details: Vec<f64>,
}

impl HaarLevel {
    /// Number of original samples each coefficient covers
    pub fn span(&self) -> usize {
        1usize << self.level
    }
}

/// One analysis step: returns `(approximation, detail)`.
///
/// Odd-length input is padded by repeating its last sample, so the padded
/// pair contributes a zero detail.
pub fn haar_step(signal: &[f64]) -> (Vec<f64>, Vec<f64>) {
    let half = signal.len().div_ceil(2);
    let mut approx = Vec::with_capacity(half);
    let mut detail = Vec::with_capacity(half);

    for pair in signal.chunks(2) {
        let a = pair[0];
        let b = pair.get(1).copied().unwrap_or(a);
        approx.push((a + b) * FRAC_1_SQRT_2);
        detail.push((a - b) * FRAC_1_SQRT_2);
    }

    (approx, detail)
}

/// Decompose up to `max_levels`, stopping before any level that would have
/// fewer than `min_coefficients` detail coefficients.
pub fn haar_decompose(signal: &[f64], max_levels: usize, min_coefficients: usize) -> Vec<HaarLevel> {
    let mut levels = Vec::new();
    let mut current = signal.to_vec();

    for level in 1..=max_levels {
        if current.len().div_ceil(2) < min_coefficients.max(1) {
            break;
        }
        let (approx, details) = haar_step(&current);
        levels.push(HaarLevel { level, details });
        current = approx;
    }

    levels
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_preserves_energy() {
        let signal = [4.0, 2.0, 5.0, 5.0, -1.0, 3.0];
        let (approx, detail) = haar_step(&signal);

        let before: f64 = signal.iter().map(|x| x * x).sum();
        let after: f64 = approx.iter().chain(detail.iter()).map(|x| x * x).sum();
        assert!((before - after).abs() < 1e-9);
        assert!((detail[1]).abs() < 1e-12);
    }

    #[test]
    fn test_odd_length_is_padded() {
        let (approx, detail) = haar_step(&[1.0, 3.0, 7.0]);
        assert_eq!(approx.len(), 2);
        assert_eq!(detail[1], 0.0);
        assert!((approx[1] - 7.0 * 2.0 * FRAC_1_SQRT_2).abs() < 1e-12);
    }

    #[test]
    fn test_decompose_stops_at_min_coefficients() {
        let signal: Vec<f64> = (0..336).map(|i| (i as f64).sin()).collect();
        let levels = haar_decompose(&signal, 6, 16);

        // 168, 84, 42, 21 coefficients; level 5 would have 11
        assert_eq!(levels.len(), 4);
        assert_eq!(levels[3].details.len(), 21);
        assert_eq!(levels[3].span(), 16);
    }

    #[test]
    fn test_constant_signal_has_zero_details() {
        let levels = haar_decompose(&[2.5; 64], 4, 2);
        assert!(levels
            .iter()
            .all(|l| l.details.iter().all(|d| d.abs() < 1e-12)));
    }
}
