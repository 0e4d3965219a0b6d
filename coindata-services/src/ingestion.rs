//! Ingestion boundary
//!
//! Normalizes raw bars from an external price feed into base-timeframe
//! candles, persists them through the candle store, and keeps the coverage
//! cache current after every write batch. The feed itself is a collaborator
//! behind the [`PriceFeed`] trait; this module never talks HTTP.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

use chrono::{DateTime, Utc};
use coindata_core::{Asset, Candle, CountUpdate, RawBar, Timeframe};

use crate::candle_store::{CandleStore, CandleStoreError, UpsertOutcome};
use crate::coverage_cache::{CoverageCache, CoverageCacheError};

/// External market-data source for raw OHLCV bars
#[async_trait]
pub trait PriceFeed: Send + Sync {
    /// Fetch raw bars for a symbol/timeframe over a date range
    async fn fetch_bars(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<RawBar>, FeedError>;
}

/// Errors surfaced by a price feed implementation
#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    #[error("Feed API error: {0}")]
    Api(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Parse error: {0}")]
    Parse(String),
}

/// What happened to one ingested batch
#[derive(Debug, Clone, Default)]
pub struct IngestReport {
    /// Bars received from the feed
    pub received: usize,
    /// Bars dropped during normalization (invalid OHLC, bad timestamps)
    pub skipped_invalid: usize,
    /// Storage outcome for the normalized candles
    pub outcome: UpsertOutcome,
}

/// Service moving feed data into the candle store at the base timeframe
pub struct IngestionService {
    store: Arc<CandleStore>,
    cache: Arc<CoverageCache>,
    base_timeframe: Timeframe,
}

impl IngestionService {
    pub fn new(store: Arc<CandleStore>, cache: Arc<CoverageCache>, base_timeframe: Timeframe) -> Self {
        Self {
            store,
            cache,
            base_timeframe,
        }
    }

    pub fn base_timeframe(&self) -> Timeframe {
        self.base_timeframe
    }

    /// Normalize and persist a batch of raw bars for an asset.
    ///
    /// Invalid bars are dropped with a warning rather than poisoning the
    /// batch; feeds deliver occasional garbage and the validity invariants
    /// are enforced here, at the write boundary. When several bars truncate
    /// into the same bucket, the last one wins.
    pub fn ingest_bars(
        &self,
        asset_id: i64,
        bars: Vec<RawBar>,
    ) -> Result<IngestReport, IngestionError> {
        let received = bars.len();
        let mut skipped_invalid = 0;
        let mut by_bucket: BTreeMap<DateTime<Utc>, Candle> = BTreeMap::new();

        for bar in bars {
            match bar.into_candle(asset_id, self.base_timeframe) {
                Ok(candle) => {
                    by_bucket.insert(candle.bucket_start, candle);
                }
                Err(e) => {
                    warn!(asset_id, "Dropping invalid bar from feed: {e}");
                    skipped_invalid += 1;
                }
            }
        }

        let candles: Vec<Candle> = by_bucket.into_values().collect();
        let outcome = self
            .store
            .upsert_batch(asset_id, self.base_timeframe, &candles)?;

        if let Some((earliest, latest)) = outcome.time_range {
            self.cache.update(
                asset_id,
                self.base_timeframe,
                CountUpdate::Add(outcome.inserted as u64),
                Some(earliest),
                Some(latest),
            )?;
        }

        info!(
            asset_id,
            received,
            inserted = outcome.inserted,
            updated = outcome.updated,
            skipped = outcome.skipped,
            skipped_invalid,
            "Ingested feed batch"
        );

        Ok(IngestReport {
            received,
            skipped_invalid,
            outcome,
        })
    }

    /// Pull a date range from the feed for one asset and ingest it
    pub async fn sync_asset(
        &self,
        feed: &dyn PriceFeed,
        asset: &Asset,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<IngestReport, IngestionError> {
        let bars = feed
            .fetch_bars(&asset.symbol, self.base_timeframe, start, end)
            .await?;
        self.ingest_bars(asset.id, bars)
    }
}

/// Errors that can occur during ingestion
#[derive(Debug, thiserror::Error)]
pub enum IngestionError {
    #[error("Feed error: {0}")]
    Feed(#[from] FeedError),

    #[error("Store error: {0}")]
    Store(#[from] CandleStoreError),

    #[error("Coverage cache error: {0}")]
    Cache(#[from] CoverageCacheError),
}
