//! OHLCV candle types
//!
//! A `Candle` is one bar of price/volume activity for one asset, one
//! timeframe, one aligned time bucket. The `(asset_id, timeframe,
//! bucket_start)` triple is the idempotency key for all storage writes.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::DataError;
use crate::timeframe::Timeframe;

/// A single OHLCV candle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    /// Asset this candle belongs to
    pub asset_id: i64,
    /// Candle timeframe
    pub timeframe: Timeframe,
    /// Start of the candle's bucket, aligned to the timeframe boundary
    pub bucket_start: DateTime<Utc>,
    /// Opening price
    pub open: Decimal,
    /// Highest price during the bucket
    pub high: Decimal,
    /// Lowest price during the bucket
    pub low: Decimal,
    /// Closing price
    pub close: Decimal,
    /// Traded volume (non-negative)
    pub volume: Decimal,
    /// Market capitalization, when the feed provides it
    #[serde(skip_serializing_if = "Option::is_none")]
    pub market_cap: Option<Decimal>,
    /// Number of trades in the bucket, when known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trade_count: Option<i64>,
    /// Volume-weighted average price, when derivable
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vwap: Option<Decimal>,
    /// Whether the candle passed validation at write time
    pub validated: bool,
}

impl Candle {
    /// Create a candle with the optional fields unset
    pub fn new(
        asset_id: i64,
        timeframe: Timeframe,
        bucket_start: DateTime<Utc>,
        open: Decimal,
        high: Decimal,
        low: Decimal,
        close: Decimal,
        volume: Decimal,
    ) -> Self {
        Self {
            asset_id,
            timeframe,
            bucket_start,
            open,
            high,
            low,
            close,
            volume,
            market_cap: None,
            trade_count: None,
            vwap: None,
            validated: false,
        }
    }

    /// Enforce the OHLC invariants.
    ///
    /// Every price must be strictly positive, volume non-negative, the high
    /// at least every other price and the low at most every other price,
    /// and the bucket start must sit exactly on the timeframe boundary.
    pub fn validate(&self) -> Result<(), DataError> {
        if self.open <= Decimal::ZERO
            || self.high <= Decimal::ZERO
            || self.low <= Decimal::ZERO
            || self.close <= Decimal::ZERO
        {
            return Err(DataError::invalid_candle(format!(
                "non-positive price in candle at {}",
                self.bucket_start
            )));
        }
        if self.volume < Decimal::ZERO {
            return Err(DataError::invalid_candle(format!(
                "negative volume in candle at {}",
                self.bucket_start
            )));
        }
        if self.high < self.open || self.high < self.close || self.high < self.low {
            return Err(DataError::invalid_candle(format!(
                "high below open/close/low at {}",
                self.bucket_start
            )));
        }
        if self.low > self.open || self.low > self.close {
            return Err(DataError::invalid_candle(format!(
                "low above open/close at {}",
                self.bucket_start
            )));
        }
        if self.timeframe.bucket_start(self.bucket_start) != self.bucket_start {
            return Err(DataError::invalid_candle(format!(
                "bucket start {} not aligned to {}",
                self.bucket_start, self.timeframe
            )));
        }
        Ok(())
    }

    /// Validate and mark the candle as validated
    pub fn into_validated(mut self) -> Result<Self, DataError> {
        self.validate()?;
        self.validated = true;
        Ok(self)
    }

    /// Check if this is a bullish candle (close > open)
    pub fn is_bullish(&self) -> bool {
        self.close > self.open
    }

    /// Candle range (high - low)
    pub fn range(&self) -> Decimal {
        self.high - self.low
    }
}

/// A raw bar as delivered by an external price feed, before normalization.
///
/// Timestamps arrive as unix epoch seconds and are not necessarily aligned
/// to any bucket boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawBar {
    /// Unix epoch seconds
    pub timestamp: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub market_cap: Option<Decimal>,
}

impl RawBar {
    /// Normalize this bar into a validated candle at the given timeframe.
    ///
    /// The timestamp is truncated down to its containing bucket, so feeds
    /// that stamp bars mid-bucket still land on the canonical boundary.
    pub fn into_candle(self, asset_id: i64, timeframe: Timeframe) -> Result<Candle, DataError> {
        let ts = DateTime::from_timestamp(self.timestamp, 0).ok_or_else(|| {
            DataError::invalid_candle(format!("unrepresentable timestamp {}", self.timestamp))
        })?;

        let mut candle = Candle::new(
            asset_id,
            timeframe,
            timeframe.bucket_start(ts),
            self.open,
            self.high,
            self.low,
            self.close,
            self.volume,
        );
        candle.market_cap = self.market_cap;
        candle.into_validated()
    }
}
