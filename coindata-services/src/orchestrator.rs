//! Aggregation Orchestrator
//!
//! Decides per asset which target timeframes are stale relative to source
//! data, computes a minimal sufficient window per target so recurring runs
//! don't rescan full history, invokes the aggregation engine, and keeps the
//! coverage cache current. A failed target is recorded and retried on the
//! next scheduled run; it never blocks its siblings.

use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use chrono::Duration;
use coindata_core::{CountUpdate, DataError, Timeframe};

use crate::aggregation::{Aggregate, AggregationEngine, AggregationError, AggregationWindow};
use crate::candle_store::{CandleStore, CandleStoreError};
use crate::coverage_cache::{CoverageCache, CoverageCacheError};

/// Per-target result of an orchestrator run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetOutcome {
    /// Nothing to do: target already covers the source's latest data,
    /// or the source has no data at all
    UpToDate,
    /// Aggregation wrote this many candles (inserted + revised)
    Aggregated { records: usize },
    /// This target failed; siblings were unaffected
    Failed { reason: String },
}

/// Outcome map for one asset's aggregation run
pub type RunReport = BTreeMap<Timeframe, TargetOutcome>;

/// Per-asset entry from [`AggregationOrchestrator::run_all`]
#[derive(Debug)]
pub struct AssetRunReport {
    pub asset_id: i64,
    pub symbol: String,
    pub outcomes: RunReport,
}

/// Orchestrates windowed re-aggregation across timeframes
pub struct AggregationOrchestrator<E = AggregationEngine> {
    store: Arc<CandleStore>,
    engine: E,
    cache: Arc<CoverageCache>,
}

impl AggregationOrchestrator {
    pub fn new(store: Arc<CandleStore>, cache: Arc<CoverageCache>) -> Self {
        let engine = AggregationEngine::new(Arc::clone(&store));
        Self::with_engine(store, engine, cache)
    }
}

impl<E: Aggregate> AggregationOrchestrator<E> {
    pub fn with_engine(store: Arc<CandleStore>, engine: E, cache: Arc<CoverageCache>) -> Self {
        Self {
            store,
            engine,
            cache,
        }
    }

    /// Minimum window per target, guaranteeing at least one full target
    /// bucket of source data even when the target cache is empty. Coarse
    /// frames need generous lookbacks; fine frames are cheap to catch up.
    fn minimum_lookback(target: Timeframe) -> Duration {
        match target {
            Timeframe::OneMonth => Duration::days(35),
            Timeframe::OneWeek => Duration::days(12),
            Timeframe::OneDay => Duration::days(3),
            Timeframe::FourHours => Duration::days(2),
            _ => Duration::days(1),
        }
    }

    /// Valid aggregation targets for an asset's source timeframe, filtered
    /// to those not already caught up with the source's latest data
    pub fn aggregatable_targets_for(&self, asset_id: i64, source: Timeframe) -> Vec<Timeframe> {
        let source_latest = self.cache.get(asset_id, source).latest_time;

        source
            .aggregatable_targets()
            .into_iter()
            .filter(|target| {
                let Some(src_latest) = source_latest else {
                    // Unknown source coverage: keep the target, run() will
                    // resolve it against the store
                    return true;
                };
                match self.cache.get(asset_id, *target).latest_time {
                    // Exhausted once the target's latest bucket contains
                    // the source's latest candle
                    Some(tgt_latest) => tgt_latest < target.bucket_start(src_latest),
                    None => true,
                }
            })
            .collect()
    }

    /// Compute the re-aggregation window for one target.
    ///
    /// The window always ends at the source's latest known time. With no
    /// cached target data it reaches back the target's minimum lookback.
    /// With cached data it starts one target bucket before the target's
    /// latest time, so the still-forming bucket gets re-processed and the
    /// whole gap up to the source's latest is covered, without rescanning
    /// history the target already has.
    ///
    /// Returns `None` when the source has no known data at all.
    pub fn compute_window(
        &self,
        asset_id: i64,
        source: Timeframe,
        target: Timeframe,
    ) -> Option<AggregationWindow> {
        let end = self.cache.get(asset_id, source).latest_time?;

        let start = match self.cache.get(asset_id, target).latest_time {
            None => end - Self::minimum_lookback(target),
            Some(target_latest) => target_latest - target.duration(),
        };

        Some(AggregationWindow::new(start, end))
    }

    /// Run windowed aggregation for one asset from `source` into `targets`
    /// (all valid targets when `None`).
    ///
    /// Validation errors abort the whole request: an incompatible target is
    /// a caller bug. Everything downstream is isolated per target, and each
    /// successful target updates the coverage cache before the next begins.
    pub fn run(
        &self,
        asset_id: i64,
        source: Timeframe,
        targets: Option<Vec<Timeframe>>,
    ) -> Result<RunReport, OrchestratorError> {
        let targets = match targets {
            Some(requested) => {
                for target in &requested {
                    source.ensure_aggregates_to(*target)?;
                }
                requested
            }
            None => source.aggregatable_targets(),
        };

        // Repair an empty source cache before deciding anything from it.
        // The MAX probe keeps assets with no source data at all from
        // triggering a full rebuild on every scheduled run.
        if self.cache.get(asset_id, source).is_empty() {
            if self.store.latest_bucket(asset_id, source)?.is_none() {
                return Ok(targets
                    .into_iter()
                    .map(|target| (target, TargetOutcome::UpToDate))
                    .collect());
            }
            self.cache.refresh_from_store(asset_id)?;
        }

        let mut report = RunReport::new();
        for target in targets {
            let outcome = match self.run_target(asset_id, source, target) {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(asset_id, %source, %target, "Aggregation target failed: {e}");
                    TargetOutcome::Failed {
                        reason: e.to_string(),
                    }
                }
            };
            report.insert(target, outcome);
        }

        Ok(report)
    }

    fn run_target(
        &self,
        asset_id: i64,
        source: Timeframe,
        target: Timeframe,
    ) -> Result<TargetOutcome, OrchestratorError> {
        let Some(window) = self.compute_window(asset_id, source, target) else {
            debug!(asset_id, %source, %target, "Source has no data, skipping");
            return Ok(TargetOutcome::UpToDate);
        };

        let outcome = self.engine.aggregate(asset_id, source, target, Some(window))?;
        if outcome.written() == 0 {
            return Ok(TargetOutcome::UpToDate);
        }

        let (earliest, latest) = match outcome.time_range {
            Some((a, b)) => (Some(a), Some(b)),
            None => (None, None),
        };
        self.cache.update(
            asset_id,
            target,
            CountUpdate::Add(outcome.inserted as u64),
            earliest,
            latest,
        )?;

        info!(
            asset_id,
            %source,
            %target,
            records = outcome.written(),
            "Aggregated target timeframe"
        );
        Ok(TargetOutcome::Aggregated {
            records: outcome.written(),
        })
    }

    /// Forced full refresh: one unbounded multi-target engine call over all
    /// history, then a coverage rebuild from the store.
    pub fn full_refresh(
        &self,
        asset_id: i64,
        source: Timeframe,
    ) -> Result<RunReport, OrchestratorError> {
        let targets = source.aggregatable_targets();
        let results = self
            .engine
            .aggregate_multi(asset_id, source, &targets, None)?;

        let mut report = RunReport::new();
        for (target, result) in results {
            let outcome = match result {
                Ok(outcome) if outcome.written() == 0 => TargetOutcome::UpToDate,
                Ok(outcome) => TargetOutcome::Aggregated {
                    records: outcome.written(),
                },
                Err(e) => {
                    error!(asset_id, %source, %target, "Full refresh target failed: {e}");
                    TargetOutcome::Failed {
                        reason: e.to_string(),
                    }
                }
            };
            report.insert(target, outcome);
        }

        self.cache.refresh_from_store(asset_id)?;
        Ok(report)
    }

    /// Scheduler entry point: run windowed aggregation for every active
    /// asset. Per-asset failures are logged and reported, never fatal.
    pub fn run_all(&self, source: Timeframe) -> Result<Vec<AssetRunReport>, OrchestratorError> {
        let assets = self.store.list_active_assets()?;
        let mut reports = Vec::with_capacity(assets.len());

        for asset in assets {
            match self.run(asset.id, source, None) {
                Ok(outcomes) => reports.push(AssetRunReport {
                    asset_id: asset.id,
                    symbol: asset.symbol,
                    outcomes,
                }),
                Err(e) => {
                    warn!(asset_id = asset.id, symbol = %asset.symbol, "Asset aggregation run failed: {e}");
                }
            }
        }

        Ok(reports)
    }
}

/// Errors from orchestration
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Data(#[from] DataError),

    #[error("Aggregation error: {0}")]
    Aggregation(#[from] AggregationError),

    #[error("Coverage cache error: {0}")]
    Cache(#[from] CoverageCacheError),

    #[error("Store error: {0}")]
    Store(#[from] CandleStoreError),
}
