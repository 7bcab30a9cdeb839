//! KPI Anomaly Engine
//!
//! Pipeline per (site, kpi) pair:
//! 1. Fetch the series from the read-only store
//! 2. Serve it from the result cache when the fingerprint is known
//! 3. Otherwise run the shape and density detectors in parallel
//! 4. Fuse both score lists into verdicts and store them in the cache
//!
//! Many pairs are analyzed by a pool of worker threads fed through a
//! crossbeam channel. A pair that fails or overruns its time budget becomes
//! a `PairFailure` on the report; the remaining pairs are unaffected.

use crate::algo::{dwt_mlead, iforest};
use crate::cache::{self, CacheRow, ResultCache};
use crate::config::EngineConfig;
use crate::error::{EngineError, FailureKind, PairFailure, Result};
use crate::fusion::fuse_series;
use crate::metrics;
use crate::report::{AnomalyReport, ReportScope, build_report};
use crate::signal::AnomalyVerdict;
use crate::store::{DateRange, KpiSeries, KpiStore, SeriesKey};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded, unbounded};
use std::collections::HashSet;
use std::sync::Arc;
use std::thread;
use tracing::{debug, info, warn};

/// Verdicts and failures from analyzing a set of pairs
#[derive(Debug, Clone, Default)]
pub struct PairBatch {
    pub verdicts: Vec<AnomalyVerdict>,
    pub failures: Vec<PairFailure>,
}

impl PairBatch {
    fn record(&mut self, key: &SeriesKey, outcome: Result<Vec<AnomalyVerdict>>) {
        match outcome {
            Ok(verdicts) => self.verdicts.extend(verdicts),
            Err(e) => self.fail(key, &e),
        }
    }

    fn fail(&mut self, key: &SeriesKey, error: &EngineError) {
        let kind = FailureKind::from(error);
        metrics::record_failure(kind);
        warn!(%key, kind = kind.label(), error = %error, "Pair skipped");
        self.failures
            .push(PairFailure::new(&key.site_id, &key.kpi_name, error));
    }

    /// Keys a stopped worker took down with it still count as failures.
    fn fail_unanswered(&mut self, keys: &[SeriesKey], answered: &HashSet<SeriesKey>) {
        let mut missing: Vec<&SeriesKey> = keys.iter().filter(|k| !answered.contains(*k)).collect();
        missing.sort();
        missing.dedup();
        for key in missing {
            let error = EngineError::Detector(format!("worker stopped before analyzing {key}"));
            self.fail(key, &error);
        }
    }
}

struct EngineInner {
    store: KpiStore,
    config: EngineConfig,
    cache: Option<ResultCache>,
}

/// Cheap to clone; clones share the store, config and cache.
#[derive(Clone)]
pub struct AnomalyEngine {
    inner: Arc<EngineInner>,
}

impl AnomalyEngine {
    pub fn new(store: KpiStore, config: EngineConfig) -> Result<Self> {
        config.validate()?;

        let store = store.with_min_series_len(config.detection.shape.min_series_len());
        let cache = match (config.cache.enabled, &config.cache.path) {
            (false, _) => None,
            (true, Some(path)) => Some(ResultCache::open(path)?),
            (true, None) => Some(ResultCache::in_memory()),
        };

        info!(
            series = store.len(),
            sites = store.sites().len(),
            policy = ?config.detection.fusion.policy,
            workers = config.runtime.worker_count(),
            cached = cache.is_some(),
            "Anomaly engine ready."
        );

        Ok(Self {
            inner: Arc::new(EngineInner {
                store,
                config,
                cache,
            }),
        })
    }

    pub fn store(&self) -> &KpiStore {
        &self.inner.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Fused verdicts for every point of one series.
    pub fn analyze_pair(&self, key: &SeriesKey) -> Result<Vec<AnomalyVerdict>> {
        let timer = metrics::PAIR_LATENCY.start_timer();
        let series = self.inner.store.get(key)?;
        let detection = &self.inner.config.detection;
        let fingerprint = cache::fingerprint(&series, detection)?;

        if let Some(rows) = self.inner.cache.as_ref().and_then(|c| c.get(fingerprint)) {
            if cache::covers(&series, &rows) {
                metrics::CACHE_HITS.inc();
                debug!(%key, %fingerprint, "Served from result cache");
                timer.observe_duration();
                return Ok(cache::replay(&series, &rows, &detection.fusion));
            }
            warn!(
                %key,
                cached = rows.len(),
                points = series.len(),
                "Partial cache entry, recomputing"
            );
        }

        let (shape, density) = thread::scope(|scope| {
            let density_handle = thread::Builder::new()
                .name("kpi-density".into())
                .spawn_scoped(scope, || iforest::score(&series, &detection.density));
            let shape = dwt_mlead::score(&series, &detection.shape);
            let density = match density_handle {
                Ok(handle) => handle.join().unwrap_or_else(|_| {
                    Err(EngineError::Detector(format!(
                        "density detector panicked on {key}"
                    )))
                }),
                // No thread available: run it here instead
                Err(_) => iforest::score(&series, &detection.density),
            };
            (shape, density)
        });
        let verdicts = fuse_series(&series, &shape?, &density?, &detection.fusion);

        if let Some(cache) = &self.inner.cache {
            let rows = verdicts
                .iter()
                .map(|v| CacheRow::from_verdict(fingerprint, v))
                .collect();
            match cache.insert(fingerprint, rows) {
                Ok(stored) => debug!(%key, %fingerprint, stored, "Cached fused results"),
                Err(e) => warn!(%key, error = %e, "Result cache write failed"),
            }
        }

        let flagged = verdicts.iter().filter(|v| v.is_anomaly).count();
        metrics::PAIRS_ANALYZED.inc();
        metrics::ANOMALIES_FLAGGED.inc_by(flagged as u64);
        timer.observe_duration();
        debug!(%key, points = verdicts.len(), flagged, "Pair analyzed");

        Ok(verdicts)
    }

    /// Analyze `keys` on the worker pool. Results are ordered by site, KPI
    /// and timestamp regardless of completion order.
    pub fn analyze(&self, keys: &[SeriesKey]) -> PairBatch {
        let mut batch = PairBatch::default();
        if keys.is_empty() {
            return batch;
        }

        let (job_tx, job_rx) = bounded::<SeriesKey>(keys.len());
        let (result_tx, result_rx) = unbounded::<PairOutcome>();
        for key in keys {
            if job_tx.send(key.clone()).is_err() {
                break;
            }
        }
        drop(job_tx);

        let workers = self.inner.config.runtime.worker_count().clamp(1, keys.len());
        let handles: Vec<_> = (0..workers)
            .filter_map(|id| {
                PairWorker::spawn(id, self.clone(), job_rx.clone(), result_tx.clone())
                    .map_err(|e| warn!(worker = id, error = %e, "Failed to spawn pair worker"))
                    .ok()
            })
            .collect();
        if handles.is_empty() {
            // Drain the queue on this thread
            PairWorker {
                id: 0,
                engine: self.clone(),
                jobs: job_rx,
                results: result_tx,
            }
            .run();
        } else {
            drop(job_rx);
            drop(result_tx);
        }

        let mut answered = HashSet::with_capacity(keys.len());
        for (key, outcome) in result_rx.iter() {
            batch.record(&key, outcome);
            answered.insert(key);
        }
        for handle in handles {
            if handle.join().is_err() {
                warn!("Pair worker panicked");
            }
        }
        batch.fail_unanswered(keys, &answered);

        batch.verdicts.sort_by(|a, b| {
            (&a.site_id, &a.kpi_name, a.timestamp).cmp(&(&b.site_id, &b.kpi_name, b.timestamp))
        });
        batch
            .failures
            .sort_by(|a, b| (&a.site_id, &a.kpi_name).cmp(&(&b.site_id, &b.kpi_name)));
        batch
    }

    /// Run detectors on the full series of every matching pair and report
    /// over `range`. No matching pair gives an empty report.
    pub fn query_anomalies(
        &self,
        site_id: Option<&str>,
        kpi_name: Option<&str>,
        range: Option<DateRange>,
    ) -> AnomalyReport {
        let mut scope = ReportScope {
            start: range.map(|r| r.start),
            end: range.map(|r| r.end),
            ..ReportScope::default()
        };
        if let Some(kpi) = kpi_name {
            scope = scope.with_kpi(kpi);
        }

        // Pairs with nothing inside the window cannot contribute.
        // A parent site id also selects its sectors.
        let keys: Vec<SeriesKey> = self
            .inner
            .store
            .keys_matching(site_id, kpi_name)
            .into_iter()
            .filter(|key| {
                self.inner
                    .store
                    .series(key)
                    .is_some_and(|s| !s.points_within(range).is_empty())
            })
            .collect();
        if let Some(site) = site_id {
            scope = scope.with_site(site);
            for key in &keys {
                scope = scope.with_site(key.site_id.as_str());
            }
        }

        info!(
            site = site_id.unwrap_or("*"),
            kpi = kpi_name.unwrap_or("*"),
            pairs = keys.len(),
            "Anomaly query"
        );
        if keys.is_empty() {
            return AnomalyReport::empty(scope);
        }

        let batch = self.analyze(&keys);
        let report = build_report(&batch.verdicts, &scope, batch.failures);
        info!(
            points = report.total_points,
            anomalies = report.anomaly_count,
            rate = report.rate,
            complete = report.complete,
            "Anomaly report assembled"
        );
        report
    }

    /// Raw observations of one pair, optionally restricted to `range`.
    /// A parent site without its own series reads through its sectors.
    pub fn get_series(
        &self,
        site_id: &str,
        kpi_name: &str,
        range: Option<DateRange>,
    ) -> Result<KpiSeries> {
        let series = self
            .inner
            .store
            .site_series(site_id, kpi_name)
            .ok_or_else(|| EngineError::EmptySeries {
                key: SeriesKey::new(site_id, kpi_name).to_string(),
                len: 0,
                min: 1,
            })?;
        match range {
            Some(r) => series.slice(r.start, r.end),
            None => Ok(series),
        }
    }

    /// `analyze_pair`, bounded by the configured per-pair budget.
    fn analyze_within_budget(&self, key: &SeriesKey) -> Result<Vec<AnomalyVerdict>> {
        let Some(budget) = self.inner.config.runtime.pair_timeout() else {
            return self.analyze_pair(key);
        };

        let (tx, rx) = bounded(1);
        let engine = self.clone();
        let job_key = key.clone();
        thread::Builder::new()
            .name(format!("kpi-pair-{key}"))
            .spawn(move || {
                // The receiver is gone if the budget already expired.
                let _ = tx.send(engine.analyze_pair(&job_key));
            })?;

        match rx.recv_timeout(budget) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(EngineError::Timeout {
                key: key.to_string(),
                budget_ms: budget.as_millis() as u64,
            }),
            Err(RecvTimeoutError::Disconnected) => Err(EngineError::Detector(format!(
                "analysis of {key} ended without a result"
            ))),
        }
    }
}

type PairOutcome = (SeriesKey, Result<Vec<AnomalyVerdict>>);

struct PairWorker {
    id: usize,
    engine: AnomalyEngine,
    jobs: Receiver<SeriesKey>,
    results: Sender<PairOutcome>,
}

impl PairWorker {
    fn spawn(
        id: usize,
        engine: AnomalyEngine,
        jobs: Receiver<SeriesKey>,
        results: Sender<PairOutcome>,
    ) -> std::io::Result<thread::JoinHandle<()>> {
        thread::Builder::new()
            .name(format!("kpi-worker-{id}"))
            .spawn(move || {
                PairWorker {
                    id,
                    engine,
                    jobs,
                    results,
                }
                .run()
            })
    }

    fn run(self) {
        let mut handled = 0usize;
        while let Ok(key) = self.jobs.recv() {
            let outcome = self.engine.analyze_within_budget(&key);
            handled += 1;
            if self.results.send((key, outcome)).is_err() {
                break;
            }
        }
        debug!(worker = self.id, handled, "Pair worker finished");
    }
}
