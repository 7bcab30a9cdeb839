//! Simulation Engine
//!
//! Generates clean series, applies scheduled anomaly scenarios and records
//! ground truth for each one. No detection logic lives here; scoring against
//! the detector happens in `bench`.

use crate::core::{GroundTruth, SimulatedDataset};
use crate::generator::{self, SyntheticConfig};
use crate::scenarios::create_scenario;
use kpi_core::{EngineError, Result, SeriesKey};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Hours kept clean at both ends of a series when placing anomalies
const EDGE_HOURS: usize = 24;

/// Attempts to find a non-overlapping slot before giving up
const PLACEMENT_ATTEMPTS: usize = 64;

/// One scheduled anomaly
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Injection {
    pub scenario: String,
    pub key: SeriesKey,
    pub start_hour: usize,
    /// Defaults to the scenario's own duration
    pub hours: Option<usize>,
}

impl Injection {
    pub fn new(scenario: &str, key: SeriesKey, start_hour: usize) -> Self {
        Self {
            scenario: scenario.to_string(),
            key,
            start_hour,
            hours: None,
        }
    }

    pub fn lasting(mut self, hours: usize) -> Self {
        self.hours = Some(hours);
        self
    }
}

pub struct SimulationEngine {
    config: SyntheticConfig,
    injections: Vec<Injection>,
    /// Placement randomness, kept apart from the data stream so scheduling
    /// never changes the clean series.
    placement_rng: ChaCha8Rng,
}

impl SimulationEngine {
    pub fn new(config: SyntheticConfig) -> Result<Self> {
        config.validate()?;
        let placement_rng = ChaCha8Rng::seed_from_u64(config.seed.wrapping_add(1));
        Ok(Self {
            config,
            injections: Vec::new(),
            placement_rng,
        })
    }

    pub fn config(&self) -> &SyntheticConfig {
        &self.config
    }

    pub fn injections(&self) -> &[Injection] {
        &self.injections
    }

    pub fn schedule(&mut self, injection: Injection) -> Result<()> {
        let scenario = create_scenario(&injection.scenario).ok_or_else(|| {
            EngineError::Config(format!("unknown scenario '{}'", injection.scenario))
        })?;
        let known_site = self.config.site_ids().contains(&injection.key.site_id);
        if !known_site || !self.config.kpis.contains(&injection.key.kpi_name) {
            return Err(EngineError::Config(format!(
                "{} is not part of the simulated dataset",
                injection.key
            )));
        }
        let hours = injection.hours.unwrap_or(scenario.default_hours());
        if hours == 0 || injection.start_hour + hours > self.config.hours() {
            return Err(EngineError::Config(format!(
                "{} for {hours}h at hour {} does not fit in {} hours",
                injection.scenario,
                injection.start_hour,
                self.config.hours()
            )));
        }
        debug!(scenario = %injection.scenario, key = %injection.key, start = injection.start_hour, hours, "Scheduled anomaly.");
        self.injections.push(injection);
        Ok(())
    }

    /// Place `count` anomalies of `scenario` on random series and hours,
    /// never overlapping each other or an earlier injection on the same series.
    pub fn schedule_random(&mut self, scenario: &str, count: usize) -> Result<()> {
        let hours = create_scenario(scenario)
            .ok_or_else(|| EngineError::Config(format!("unknown scenario '{scenario}'")))?
            .default_hours();
        let total = self.config.hours();
        if total < 2 * EDGE_HOURS + hours {
            return Err(EngineError::Config(format!(
                "{} days are too short to place {scenario}",
                self.config.days
            )));
        }
        let sites = self.config.site_ids();

        for _ in 0..count {
            let mut placed = false;
            for _ in 0..PLACEMENT_ATTEMPTS {
                let site = &sites[self.placement_rng.random_range(0..sites.len())];
                let kpi = &self.config.kpis[self.placement_rng.random_range(0..self.config.kpis.len())];
                let start = self.placement_rng.random_range(EDGE_HOURS..=total - EDGE_HOURS - hours);
                let key = SeriesKey::new(site, kpi);
                if !self.overlaps(&key, start, hours) {
                    self.schedule(Injection::new(scenario, key, start).lasting(hours))?;
                    placed = true;
                    break;
                }
            }
            if !placed {
                return Err(EngineError::Config(format!(
                    "no free slot left for another {scenario}"
                )));
            }
        }
        Ok(())
    }

    fn overlaps(&self, key: &SeriesKey, start: usize, hours: usize) -> bool {
        self.injections.iter().any(|inj| {
            let inj_hours = inj
                .hours
                .or_else(|| create_scenario(&inj.scenario).map(|s| s.default_hours()))
                .unwrap_or(0);
            // One clean hour between anomalies keeps them separate events.
            inj.key == *key && start <= inj.start_hour + inj_hours && inj.start_hour <= start + hours
        })
    }

    /// Generate the dataset and apply every scheduled injection in order.
    pub fn run(&self) -> Result<SimulatedDataset> {
        let mut data_rng = generator::seeded_rng(self.config.seed);
        let mut series = generator::generate(&self.config, &mut data_rng)?;
        let mut ground_truth = Vec::with_capacity(self.injections.len());

        for (n, injection) in self.injections.iter().enumerate() {
            let scenario = create_scenario(&injection.scenario).ok_or_else(|| {
                EngineError::Config(format!("unknown scenario '{}'", injection.scenario))
            })?;
            let Some(draft) = series.iter_mut().find(|d| d.key == injection.key) else {
                continue;
            };
            let hours = injection.hours.unwrap_or(scenario.default_hours());
            let marked = scenario.inject(draft, injection.start_hour..injection.start_hour + hours);
            let (Some(&first), Some(&last)) = (marked.first(), marked.last()) else {
                continue;
            };

            ground_truth.push(GroundTruth {
                anomaly_id: format!("{}-{n}", scenario.name()),
                scenario: scenario.name().to_string(),
                site_id: injection.key.site_id.clone(),
                kpi_name: injection.key.kpi_name.clone(),
                start: draft.timestamps[first],
                end: draft.timestamps[last],
                timestamps: marked.iter().map(|&i| draft.timestamps[i]).collect(),
            });
        }

        // Injected values are rounded like the rest of the table.
        for draft in &mut series {
            for v in &mut draft.values {
                *v = (*v * 100.0).round() / 100.0;
            }
        }

        info!(
            series = series.len(),
            points = series.iter().map(|s| s.len()).sum::<usize>(),
            anomalies = ground_truth.len(),
            "Simulated KPI dataset."
        );
        Ok(SimulatedDataset {
            series,
            ground_truth,
        })
    }
}
