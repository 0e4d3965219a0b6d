//! Aggregation Engine
//!
//! Computes OHLCV rollups from a source timeframe into one or more target
//! timeframes and persists them through the candle store. The rollup itself
//! runs as a single grouped SQL query per target; this module validates
//! timeframe compatibility, hands derived candles to the store, and reports
//! what was written.

use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

use chrono::{DateTime, Utc};
use coindata_core::{DataError, Timeframe};

use crate::candle_store::{CandleStore, CandleStoreError, UpsertOutcome};

/// Inclusive time window over source candles
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AggregationWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl AggregationWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    fn as_range(&self) -> (DateTime<Utc>, DateTime<Utc>) {
        (self.start, self.end)
    }
}

/// Rollup computation as seen by the orchestrator
pub trait Aggregate {
    /// Aggregate one source timeframe into one target over a window
    /// (or all history when `window` is `None`)
    fn aggregate(
        &self,
        asset_id: i64,
        source: Timeframe,
        target: Timeframe,
        window: Option<AggregationWindow>,
    ) -> Result<UpsertOutcome, AggregationError>;

    /// Fan-out aggregation: one source into several targets in one pass
    fn aggregate_multi(
        &self,
        asset_id: i64,
        source: Timeframe,
        targets: &[Timeframe],
        window: Option<AggregationWindow>,
    ) -> Result<BTreeMap<Timeframe, Result<UpsertOutcome, AggregationError>>, DataError>;
}

/// Engine computing derived candles from stored source candles
pub struct AggregationEngine {
    store: Arc<CandleStore>,
}

impl AggregationEngine {
    pub fn new(store: Arc<CandleStore>) -> Self {
        Self { store }
    }

    fn aggregate_checked(
        &self,
        asset_id: i64,
        source: Timeframe,
        target: Timeframe,
        window: Option<AggregationWindow>,
    ) -> Result<UpsertOutcome, AggregationError> {
        let derived =
            self.store
                .select_rollup(asset_id, source, target, window.map(|w| w.as_range()))?;

        if derived.is_empty() {
            debug!(asset_id, %source, %target, "No source candles in window, nothing to aggregate");
            return Ok(UpsertOutcome::default());
        }

        let emitted = derived.len();
        let outcome = self.store.upsert_batch(asset_id, target, &derived)?;
        debug!(
            asset_id,
            %source,
            %target,
            emitted,
            inserted = outcome.inserted,
            updated = outcome.updated,
            skipped = outcome.skipped,
            "Aggregated candles"
        );
        Ok(outcome)
    }
}

impl Aggregate for AggregationEngine {
    /// An empty source window is a no-op, not an error. Incompatible
    /// timeframes fail before any SQL executes.
    fn aggregate(
        &self,
        asset_id: i64,
        source: Timeframe,
        target: Timeframe,
        window: Option<AggregationWindow>,
    ) -> Result<UpsertOutcome, AggregationError> {
        source.ensure_aggregates_to(target)?;
        self.aggregate_checked(asset_id, source, target, window)
    }

    /// All targets are validated before any SQL runs; after that, each
    /// target's rollup and persistence is independent, so one target's
    /// storage failure does not block the siblings.
    fn aggregate_multi(
        &self,
        asset_id: i64,
        source: Timeframe,
        targets: &[Timeframe],
        window: Option<AggregationWindow>,
    ) -> Result<BTreeMap<Timeframe, Result<UpsertOutcome, AggregationError>>, DataError> {
        for target in targets {
            source.ensure_aggregates_to(*target)?;
        }

        let mut results = BTreeMap::new();
        for target in targets {
            results.insert(
                *target,
                self.aggregate_checked(asset_id, source, *target, window),
            );
        }
        Ok(results)
    }
}

/// Errors that can occur during aggregation
#[derive(Debug, thiserror::Error)]
pub enum AggregationError {
    #[error(transparent)]
    Data(#[from] DataError),

    #[error("Store error: {0}")]
    Store(#[from] CandleStoreError),
}
