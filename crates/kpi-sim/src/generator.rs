//! Synthetic KPI Generator
//!
//! Produces hourly series per (site, kpi) with:
//! - a per-KPI baseline and daily sinusoidal profile
//! - a small per-site offset so sites are distinguishable
//! - Gaussian noise proportional to the daily amplitude
//!
//! Output is fully determined by the seed.

use crate::core::SeriesDraft;
use chrono::{DateTime, Duration, TimeZone, Utc};
use kpi_core::{EngineError, Result, SeriesKey};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

pub const DEFAULT_KPIS: &[&str] = &[
    "RSRP",
    "SINR",
    "DL_Throughput",
    "UL_Throughput",
    "RTT",
    "Active_Users",
    "CPU_Utilization",
    "Handover_Success_Rate",
    "Packet_Loss",
    "Call_Drop_Rate",
];

/// Typical level and daily swing of a KPI
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KpiProfile {
    pub baseline: f64,
    pub amplitude: f64,
    /// Hour of day at which the profile peaks
    pub peak_hour: f64,
}

impl KpiProfile {
    pub fn for_kpi(kpi: &str) -> Self {
        let (baseline, amplitude, peak_hour) = match kpi {
            "RSRP" => (-95.0, 4.0, 4.0),
            "SINR" => (15.0, 3.0, 4.0),
            "DL_Throughput" => (60.0, 15.0, 3.0),
            "UL_Throughput" => (18.0, 4.0, 3.0),
            "RTT" => (30.0, 6.0, 20.0),
            "Active_Users" => (180.0, 60.0, 20.0),
            "CPU_Utilization" => (45.0, 15.0, 20.0),
            "Handover_Success_Rate" => (97.0, 1.0, 4.0),
            "Packet_Loss" => (0.8, 0.3, 20.0),
            "Call_Drop_Rate" => (1.2, 0.4, 20.0),
            _ => (50.0, 10.0, 12.0),
        };
        Self {
            baseline,
            amplitude,
            peak_hour,
        }
    }

    pub fn value_at(&self, hour_of_day: f64) -> f64 {
        self.baseline + self.amplitude * (2.0 * PI * (hour_of_day - self.peak_hour + 6.0) / 24.0).sin()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyntheticConfig {
    pub sites: usize,
    pub kpis: Vec<String>,
    pub days: usize,
    pub start: DateTime<Utc>,
    pub seed: u64,
    /// Noise standard deviation as a fraction of each KPI's daily amplitude
    pub noise: f64,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            sites: 3,
            kpis: DEFAULT_KPIS.iter().map(|k| k.to_string()).collect(),
            days: 14,
            start: Utc
                .with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
                .single()
                .unwrap_or(DateTime::UNIX_EPOCH),
            seed: 42,
            noise: 0.1,
        }
    }
}

impl SyntheticConfig {
    pub fn hours(&self) -> usize {
        self.days * 24
    }

    pub fn site_ids(&self) -> Vec<String> {
        (1..=self.sites).map(|i| format!("SITE_{i:03}")).collect()
    }

    pub fn validate(&self) -> Result<()> {
        if self.sites == 0 || self.days == 0 || self.kpis.is_empty() {
            return Err(EngineError::Config(
                "sites, days and kpis must be non-empty".into(),
            ));
        }
        if !(self.noise.is_finite() && self.noise >= 0.0) {
            return Err(EngineError::Config(format!(
                "noise must be a non-negative fraction, got {}",
                self.noise
            )));
        }
        Ok(())
    }
}

/// Clean hourly series for every configured site and KPI
pub fn generate(config: &SyntheticConfig, rng: &mut ChaCha8Rng) -> Result<Vec<SeriesDraft>> {
    config.validate()?;
    let hours = config.hours();
    let timestamps: Vec<DateTime<Utc>> = (0..hours)
        .map(|h| config.start + Duration::hours(h as i64))
        .collect();

    let mut drafts = Vec::with_capacity(config.sites * config.kpis.len());
    for site in config.site_ids() {
        for kpi in &config.kpis {
            let profile = KpiProfile::for_kpi(kpi);
            let offset = rng.random_range(-0.1..0.1) * profile.amplitude;
            let noise = Normal::new(0.0, config.noise * profile.amplitude)
                .map_err(|e| EngineError::Config(format!("noise: {e}")))?;

            let values = (0..hours)
                .map(|h| {
                    let v = profile.value_at((h % 24) as f64) + offset + noise.sample(rng);
                    // Exported KPI tables carry two decimals.
                    (v * 100.0).round() / 100.0
                })
                .collect();

            drafts.push(SeriesDraft {
                key: SeriesKey::new(&site, kpi),
                timestamps: timestamps.clone(),
                values,
            });
        }
    }
    Ok(drafts)
}

pub fn seeded_rng(seed: u64) -> ChaCha8Rng {
    ChaCha8Rng::seed_from_u64(seed)
}
