//! Engine Configuration
//!
//! Everything tunable about detection lives here and is injected into the
//! engine; nothing about thresholds or voting is hardcoded in the detectors.
//! `DetectionConfig` is the part that changes results and therefore feeds the
//! cache fingerprint; `RuntimeConfig` and `CacheConfig` only change how the
//! work is scheduled and stored.

use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Per-series score scaling applied by both detectors
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Normalization {
    /// (x - min) / (max - min)
    #[default]
    MinMax,
    /// Robust z-score (x - median) / (1.4826 * MAD), divided by `z_cap` and clamped
    Robust { z_cap: f64 },
}

/// DWT-MLEAD shape detector settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShapeConfig {
    /// Window length in detail coefficients, at every level
    pub window: usize,
    /// Deepest decomposition level considered
    pub max_levels: usize,
    pub normalization: Normalization,
}

impl Default for ShapeConfig {
    fn default() -> Self {
        Self {
            window: 4,
            max_levels: 6,
            normalization: Normalization::MinMax,
        }
    }
}

impl ShapeConfig {
    /// Detail coefficients a level needs before it is scored
    pub fn min_level_coefficients(&self) -> usize {
        4 * self.window.max(1)
    }

    /// Shortest series for which level 1 fits
    pub fn min_series_len(&self) -> usize {
        2 * self.min_level_coefficients() - 1
    }
}

/// Isolation Forest density detector settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DensityConfig {
    pub n_trees: usize,
    /// Points drawn (without replacement) per tree
    pub subsample_size: usize,
    pub min_samples: usize,
    pub seed: u64,
    /// Adds rolling mean, rolling variance and rate of change as features
    pub rolling_window: Option<usize>,
    pub normalization: Normalization,
}

impl Default for DensityConfig {
    fn default() -> Self {
        Self {
            n_trees: 100,
            subsample_size: 256,
            min_samples: 10,
            seed: 42,
            rolling_window: None,
            normalization: Normalization::MinMax,
        }
    }
}

/// Voting rule applied to the two normalized scores
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum VotePolicy {
    /// Either detector over its threshold
    Or,
    /// Both detectors over their thresholds
    And,
    /// Weighted combination over `combined_threshold`
    #[default]
    Weighted,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FusionWeights {
    pub shape: f64,
    pub density: f64,
}

impl Default for FusionWeights {
    fn default() -> Self {
        Self {
            shape: 0.5,
            density: 0.5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    pub policy: VotePolicy,
    pub shape_threshold: f64,
    pub density_threshold: f64,
    pub weights: FusionWeights,
    pub combined_threshold: f64,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            policy: VotePolicy::Weighted,
            shape_threshold: 0.5,
            density_threshold: 0.5,
            weights: FusionWeights::default(),
            combined_threshold: 0.5,
        }
    }
}

impl FusionConfig {
    pub fn with_policy(mut self, policy: VotePolicy) -> Self {
        self.policy = policy;
        self
    }
}

/// Settings that determine detector output (fingerprinted by the cache)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct DetectionConfig {
    pub shape: ShapeConfig,
    pub density: DensityConfig,
    pub fusion: FusionConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Worker threads for per-pair analysis (None = available parallelism)
    pub workers: Option<usize>,
    /// Budget for one (site, kpi) analysis
    pub pair_timeout_ms: Option<u64>,
}

impl RuntimeConfig {
    pub fn worker_count(&self) -> usize {
        self.workers.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        })
    }

    pub fn pair_timeout(&self) -> Option<Duration> {
        self.pair_timeout_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    /// CSV result table; in-memory only when absent
    pub path: Option<PathBuf>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct EngineConfig {
    pub detection: DetectionConfig,
    pub runtime: RuntimeConfig,
    pub cache: CacheConfig,
}

impl EngineConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: EngineConfig =
            serde_json::from_str(json).map_err(|e| EngineError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn with_policy(mut self, policy: VotePolicy) -> Self {
        self.detection.fusion.policy = policy;
        self
    }

    pub fn validate(&self) -> Result<()> {
        let shape = &self.detection.shape;
        if shape.window == 0 || shape.max_levels == 0 {
            return Err(EngineError::Config(
                "shape.window and shape.max_levels must be at least 1".into(),
            ));
        }
        validate_normalization("shape", shape.normalization)?;

        let density = &self.detection.density;
        if density.n_trees == 0 {
            return Err(EngineError::Config("density.n_trees must be at least 1".into()));
        }
        if density.subsample_size < 2 || density.min_samples < 2 {
            return Err(EngineError::Config(
                "density.subsample_size and density.min_samples must be at least 2".into(),
            ));
        }
        if matches!(density.rolling_window, Some(w) if w < 2) {
            return Err(EngineError::Config(
                "density.rolling_window must be at least 2".into(),
            ));
        }
        validate_normalization("density", density.normalization)?;

        let fusion = &self.detection.fusion;
        for (name, value) in [
            ("shape_threshold", fusion.shape_threshold),
            ("density_threshold", fusion.density_threshold),
            ("combined_threshold", fusion.combined_threshold),
        ] {
            if !(value > 0.0 && value <= 1.0) {
                return Err(EngineError::Config(format!(
                    "fusion.{name} must be in (0, 1], got {value}"
                )));
            }
        }
        let w = fusion.weights;
        if !(w.shape.is_finite() && w.density.is_finite())
            || w.shape < 0.0
            || w.density < 0.0
            || w.shape + w.density <= 0.0
        {
            return Err(EngineError::Config(
                "fusion.weights must be non-negative with a positive sum".into(),
            ));
        }

        if self.runtime.workers == Some(0) || self.runtime.pair_timeout_ms == Some(0) {
            return Err(EngineError::Config(
                "runtime.workers and runtime.pair_timeout_ms must be positive".into(),
            ));
        }
        Ok(())
    }
}

fn validate_normalization(detector: &str, normalization: Normalization) -> Result<()> {
    match normalization {
        Normalization::Robust { z_cap } if !(z_cap.is_finite() && z_cap > 0.0) => Err(
            EngineError::Config(format!("{detector}.normalization z_cap must be positive")),
        ),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.detection.fusion.policy, VotePolicy::Weighted);
        assert_eq!(config.detection.shape.min_series_len(), 31);
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config = EngineConfig::from_json_str(
            r#"{
                "detection": {
                    "fusion": { "policy": "AND", "shape_threshold": 0.6 },
                    "density": { "seed": 7, "normalization": { "robust": { "z_cap": 5.0 } } }
                },
                "runtime": { "pair_timeout_ms": 2000 }
            }"#,
        )
        .unwrap();

        assert_eq!(config.detection.fusion.policy, VotePolicy::And);
        assert_eq!(config.detection.fusion.shape_threshold, 0.6);
        assert_eq!(config.detection.fusion.density_threshold, 0.5);
        assert_eq!(config.detection.density.seed, 7);
        assert_eq!(config.detection.density.n_trees, 100);
        assert_eq!(
            config.detection.density.normalization,
            Normalization::Robust { z_cap: 5.0 }
        );
        assert_eq!(
            config.runtime.pair_timeout(),
            Some(Duration::from_millis(2000))
        );
    }

    #[test]
    fn test_rejects_bad_thresholds() {
        let result = EngineConfig::from_json_str(
            r#"{ "detection": { "fusion": { "combined_threshold": 0.0 } } }"#,
        );
        assert!(matches!(result, Err(EngineError::Config(_))));

        let mut config = EngineConfig::default();
        config.detection.fusion.weights = FusionWeights {
            shape: 0.0,
            density: 0.0,
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_unknown_policy() {
        let result =
            EngineConfig::from_json_str(r#"{ "detection": { "fusion": { "policy": "XOR" } } }"#);
        assert!(matches!(result, Err(EngineError::Config(_))));
    }
}
