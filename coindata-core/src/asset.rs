//! Asset types and per-timeframe coverage summaries

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::timeframe::Timeframe;

/// Kind of tradable instrument
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetType {
    Crypto,
    Stock,
    Forex,
    Commodity,
}

impl AssetType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssetType::Crypto => "crypto",
            AssetType::Stock => "stock",
            AssetType::Forex => "forex",
            AssetType::Commodity => "commodity",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "crypto" => Some(AssetType::Crypto),
            "stock" => Some(AssetType::Stock),
            "forex" => Some(AssetType::Forex),
            "commodity" => Some(AssetType::Commodity),
            _ => None,
        }
    }
}

impl fmt::Display for AssetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A tradable instrument tracked by the platform
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Asset {
    /// Storage-assigned id
    pub id: i64,
    /// Unique symbol, e.g. "BTC"
    pub symbol: String,
    /// Display name, e.g. "Bitcoin"
    pub name: String,
    /// Instrument kind
    pub asset_type: AssetType,
    /// Whether the asset is actively ingested
    pub is_active: bool,
    /// Whether the asset is exposed to consumers
    pub is_supported: bool,
    /// Derived coverage cache per timeframe. Always reconcilable by
    /// rescanning the candle store; may lag it but never overstates it.
    #[serde(default)]
    pub timeframe_data: HashMap<Timeframe, TimeframeCoverage>,
}

/// How a coverage update combines its count with the cached one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountUpdate {
    /// The new count is authoritative (full rescan)
    Replace(u64),
    /// The new count is a delta from a write batch
    Add(u64),
}

/// Cached summary of how much candle data exists for one timeframe
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimeframeCoverage {
    /// Number of stored candles
    pub count: u64,
    /// Earliest known bucket start
    #[serde(skip_serializing_if = "Option::is_none")]
    pub earliest_time: Option<DateTime<Utc>>,
    /// Latest known bucket start
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest_time: Option<DateTime<Utc>>,
    /// When this summary was last written
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,
}

impl TimeframeCoverage {
    /// Build a summary from a full rescan
    pub fn from_scan(
        count: u64,
        earliest_time: Option<DateTime<Utc>>,
        latest_time: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            count,
            earliest_time,
            latest_time,
            last_updated: Some(Utc::now()),
        }
    }

    /// Merge new write statistics into this summary.
    ///
    /// Bounds only ever widen: a partial refresh cannot erase knowledge of
    /// older data. Counts either replace (rescan) or add (write batch).
    pub fn merge(
        &mut self,
        count: CountUpdate,
        earliest: Option<DateTime<Utc>>,
        latest: Option<DateTime<Utc>>,
    ) {
        match count {
            CountUpdate::Replace(n) => self.count = n,
            CountUpdate::Add(n) => self.count += n,
        }
        self.earliest_time = match (self.earliest_time, earliest) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        self.latest_time = match (self.latest_time, latest) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        self.last_updated = Some(Utc::now());
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0 && self.latest_time.is_none()
    }
}
