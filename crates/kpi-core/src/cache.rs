//! Ensemble Result Cache
//!
//! Fused results keyed by a content fingerprint of the input series plus the
//! detection configuration. Wall-clock time never enters the key, so a hit
//! is always a result for exactly this data under exactly these settings.
//!
//! Storage is an in-memory map, optionally backed by a flat CSV table that is
//! loaded on open and appended to on insert. Writers are serialized and the
//! first complete result stored for a key wins. A later insert for the same
//! key only lands when it carries more rows, which repairs an entry left
//! partial by an interrupted append.

use crate::config::{DetectionConfig, FusionConfig};
use crate::error::{EngineError, Result};
use crate::fusion::{self, Fused};
use crate::signal::AnomalyVerdict;
use crate::store::KpiSeries;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tracing::{debug, info, warn};
use xxhash_rust::xxh3::xxh3_128;

/// 128-bit content hash of (series, detection config)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(pub u128);

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

impl FromStr for Fingerprint {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        u128::from_str_radix(s, 16)
            .map(Fingerprint)
            .map_err(|e| EngineError::Cache(format!("bad fingerprint {s:?}: {e}")))
    }
}

/// Fingerprint `series` under `detection`.
pub fn fingerprint(series: &KpiSeries, detection: &DetectionConfig) -> Result<Fingerprint> {
    let config_json =
        serde_json::to_vec(detection).map_err(|e| EngineError::Config(e.to_string()))?;

    let mut buf = Vec::with_capacity(64 + series.len() * 16 + config_json.len());
    for part in [series.site_id(), series.kpi_name()] {
        buf.extend_from_slice(&(part.len() as u64).to_le_bytes());
        buf.extend_from_slice(part.as_bytes());
    }
    for point in series.points() {
        buf.extend_from_slice(&point.timestamp.timestamp_millis().to_le_bytes());
        buf.extend_from_slice(&point.value.to_bits().to_le_bytes());
    }
    buf.extend_from_slice(&config_json);

    Ok(Fingerprint(xxh3_128(&buf)))
}

/// One persisted fused result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheRow {
    pub fingerprint_key: String,
    pub site_id: String,
    pub kpi_name: String,
    pub timestamp: DateTime<Utc>,
    pub shape_score: f64,
    pub density_score: f64,
    pub is_anomaly: bool,
    pub confidence: f64,
}

impl CacheRow {
    pub fn from_verdict(key: Fingerprint, verdict: &AnomalyVerdict) -> Self {
        Self {
            fingerprint_key: key.to_string(),
            site_id: verdict.site_id.clone(),
            kpi_name: verdict.kpi_name.clone(),
            timestamp: verdict.timestamp,
            shape_score: verdict.shape_score,
            density_score: verdict.density_score,
            is_anomaly: verdict.is_anomaly,
            confidence: verdict.confidence,
        }
    }
}

/// Whether `rows` hold a result for every point of `series`.
pub fn covers(series: &KpiSeries, rows: &[CacheRow]) -> bool {
    rows.len() == series.len()
        && rows.iter().all(|row| {
            row.site_id == series.site_id()
                && row.kpi_name == series.kpi_name()
                && series.value_at(row.timestamp).is_some()
        })
}

/// Rebuild verdicts for `series` from cached rows. Values come from the
/// series; attribution and severity are recomputed from `fusion`.
pub fn replay(series: &KpiSeries, rows: &[CacheRow], config: &FusionConfig) -> Vec<AnomalyVerdict> {
    rows.iter()
        .filter_map(|row| {
            let value = series.value_at(row.timestamp)?;
            let contributing = fusion::contributing_detectors(
                row.shape_score,
                row.density_score,
                row.is_anomaly,
                config,
            );
            let fused = Fused {
                is_anomaly: row.is_anomaly,
                confidence: row.confidence,
                contributing,
            };
            Some(fusion::verdict(
                series,
                row.timestamp,
                value,
                row.shape_score,
                row.density_score,
                fused,
            ))
        })
        .collect()
}

pub struct ResultCache {
    entries: RwLock<HashMap<Fingerprint, Arc<Vec<CacheRow>>>>,
    /// Held for the whole check-and-insert; owns the backing file path
    writer: Mutex<Option<PathBuf>>,
}

impl ResultCache {
    pub fn in_memory() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            writer: Mutex::new(None),
        }
    }

    /// Open a CSV-backed cache, loading existing rows if the file exists.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let entries = if path.exists() {
            load_rows(&path)?
        } else {
            HashMap::new()
        };
        info!(path = %path.display(), keys = entries.len(), "Result cache opened");

        Ok(Self {
            entries: RwLock::new(entries),
            writer: Mutex::new(Some(path)),
        })
    }

    pub fn get(&self, key: Fingerprint) -> Option<Arc<Vec<CacheRow>>> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
            .cloned()
    }

    pub fn contains(&self, key: Fingerprint) -> bool {
        self.get(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Store `rows` under `key`. Returns `false` without touching anything
    /// when the key already holds at least as many rows.
    pub fn insert(&self, key: Fingerprint, rows: Vec<CacheRow>) -> Result<bool> {
        let writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = self.get(key) {
            if existing.len() >= rows.len() {
                debug!(%key, "Cache key already stored");
                return Ok(false);
            }
            warn!(%key, stored = existing.len(), rows = rows.len(), "Replacing partial cache entry");
        }

        if let Some(path) = writer.as_ref() {
            append_rows(path, &rows)?;
        }
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, Arc::new(rows));
        Ok(true)
    }
}

fn cache_error(path: &Path, e: csv::Error) -> EngineError {
    EngineError::Cache(format!("{}: {e}", path.display()))
}

fn load_rows(path: &Path) -> Result<HashMap<Fingerprint, Arc<Vec<CacheRow>>>> {
    let mut reader = csv::Reader::from_path(path).map_err(|e| cache_error(path, e))?;
    let mut grouped: HashMap<Fingerprint, Vec<CacheRow>> = HashMap::new();
    let mut seen: HashSet<(Fingerprint, String, String, DateTime<Utc>)> = HashSet::new();

    for record in reader.deserialize::<CacheRow>() {
        let row = record.map_err(|e| cache_error(path, e))?;
        let key: Fingerprint = row.fingerprint_key.parse()?;
        // First write wins for a repeated (key, site, kpi, timestamp)
        if seen.insert((key, row.site_id.clone(), row.kpi_name.clone(), row.timestamp)) {
            grouped.entry(key).or_default().push(row);
        }
    }

    Ok(grouped
        .into_iter()
        .map(|(key, mut rows)| {
            // A repaired entry interleaves its old and new appends
            rows.sort_by(|a, b| {
                (&a.site_id, &a.kpi_name, a.timestamp).cmp(&(&b.site_id, &b.kpi_name, b.timestamp))
            });
            (key, Arc::new(rows))
        })
        .collect())
}

/// Appends `rows` in one write call.
fn append_rows(path: &Path, rows: &[CacheRow]) -> Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    let needs_header = file.metadata()?.len() == 0;
    let mut writer = csv::WriterBuilder::new()
        .has_headers(needs_header)
        .from_writer(Vec::new());
    for row in rows {
        writer.serialize(row).map_err(|e| cache_error(path, e))?;
    }
    let buf = writer
        .into_inner()
        .map_err(|e| EngineError::Cache(format!("{}: {e}", path.display())))?;
    file.write_all(&buf)?;
    file.flush()?;
    Ok(())
}
