//! Timeframe Coverage Cache
//!
//! In-memory cache with SQLite persistence answering "how much candle data
//! exists for asset X at timeframe Y" without scanning the candle store.
//! The cache may lag the store but must never claim more data, or a
//! narrower span, than actually exists; `refresh_from_store` is the repair
//! path when staleness is suspected.

use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info};

use chrono::{DateTime, Utc};
use coindata_core::{CountUpdate, Timeframe, TimeframeCoverage};

use crate::candle_store::{CandleStore, CandleStoreError};

/// Coverage summary exposed to status/dashboard consumers
#[derive(Debug, Clone, Serialize)]
pub struct TimeframeSummary {
    pub count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub earliest_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest_time: Option<DateTime<Utc>>,
    pub can_aggregate_to: Vec<Timeframe>,
}

/// Per-asset, per-timeframe coverage cache backed by the asset row's
/// `timeframe_data` column
pub struct CoverageCache {
    /// In-memory cache for instant access
    cache: RwLock<HashMap<(i64, Timeframe), TimeframeCoverage>>,
    /// Backing store for persistence and repair scans
    store: Arc<CandleStore>,
}

impl CoverageCache {
    pub fn new(store: Arc<CandleStore>) -> Self {
        Self {
            cache: RwLock::new(HashMap::new()),
            store,
        }
    }

    /// Hydrate the in-memory map from the persisted column for one asset.
    ///
    /// Returns the number of timeframes loaded. Used at startup so a warm
    /// cache survives process restarts.
    pub fn load_asset(&self, asset_id: i64) -> Result<usize, CoverageCacheError> {
        let persisted = self.store.load_timeframe_data(asset_id)?;
        let loaded = persisted.len();

        let mut cache = self.cache.write();
        for (timeframe, coverage) in persisted {
            cache.insert((asset_id, timeframe), coverage);
        }

        debug!(asset_id, loaded, "Hydrated coverage cache from store");
        Ok(loaded)
    }

    /// Cached coverage for an asset/timeframe; zeros if nothing is cached
    pub fn get(&self, asset_id: i64, timeframe: Timeframe) -> TimeframeCoverage {
        self.cache
            .read()
            .get(&(asset_id, timeframe))
            .cloned()
            .unwrap_or_default()
    }

    /// Merge new write statistics into the cached coverage and persist.
    ///
    /// Counts replace or add per the caller's `CountUpdate`; time bounds
    /// only ever widen, so a partial refresh cannot erase knowledge of
    /// older data.
    pub fn update(
        &self,
        asset_id: i64,
        timeframe: Timeframe,
        count: CountUpdate,
        earliest: Option<DateTime<Utc>>,
        latest: Option<DateTime<Utc>>,
    ) -> Result<TimeframeCoverage, CoverageCacheError> {
        let merged = {
            let mut cache = self.cache.write();
            let entry = cache.entry((asset_id, timeframe)).or_default();
            entry.merge(count, earliest, latest);
            entry.clone()
        };

        self.persist_asset(asset_id)?;
        Ok(merged)
    }

    /// Recompute coverage for an asset by scanning the candle store.
    ///
    /// Replaces every cached entry for the asset with the scan result and
    /// persists it. This is the disaster-recovery path for assets whose
    /// cache was never populated or is suspected stale.
    pub fn refresh_from_store(
        &self,
        asset_id: i64,
    ) -> Result<HashMap<Timeframe, TimeframeCoverage>, CoverageCacheError> {
        let scanned = self.store.coverage_by_timeframe(asset_id)?;

        {
            let mut cache = self.cache.write();
            cache.retain(|(id, _), _| *id != asset_id);
            for (timeframe, coverage) in &scanned {
                cache.insert((asset_id, *timeframe), coverage.clone());
            }
        }

        self.store.save_timeframe_data(asset_id, &scanned)?;
        info!(
            asset_id,
            timeframes = scanned.len(),
            "Rebuilt coverage cache from candle store"
        );
        Ok(scanned)
    }

    /// Full coverage map for an asset, annotated with the timeframes each
    /// one can aggregate into. This is the read contract for the API layer.
    pub fn get_all_timeframe_data(&self, asset_id: i64) -> BTreeMap<Timeframe, TimeframeSummary> {
        let cache = self.cache.read();

        cache
            .iter()
            .filter(|((id, _), _)| *id == asset_id)
            .map(|((_, timeframe), coverage)| {
                (
                    *timeframe,
                    TimeframeSummary {
                        count: coverage.count,
                        earliest_time: coverage.earliest_time,
                        latest_time: coverage.latest_time,
                        can_aggregate_to: timeframe.aggregatable_targets(),
                    },
                )
            })
            .collect()
    }

    /// Write the asset's full cached coverage map back to its row
    /// (replace-on-write, no in-place mutation of the persisted value)
    fn persist_asset(&self, asset_id: i64) -> Result<(), CoverageCacheError> {
        let snapshot: HashMap<Timeframe, TimeframeCoverage> = {
            let cache = self.cache.read();
            cache
                .iter()
                .filter(|((id, _), _)| *id == asset_id)
                .map(|((_, timeframe), coverage)| (*timeframe, coverage.clone()))
                .collect()
        };

        self.store.save_timeframe_data(asset_id, &snapshot)?;
        Ok(())
    }
}

/// Errors from coverage cache operations
#[derive(Debug, thiserror::Error)]
pub enum CoverageCacheError {
    #[error("Store error: {0}")]
    Store(#[from] CandleStoreError),
}
