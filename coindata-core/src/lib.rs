//! Core types for the Coindata price platform
//!
//! This crate defines the shared data structures used across the platform:
//! assets, OHLCV candles, timeframe codes, and the pure UTC time-bucketing
//! rules every other component builds on.

pub mod asset;
pub mod candle;
pub mod error;
pub mod timeframe;

pub use asset::{Asset, AssetType, CountUpdate, TimeframeCoverage};
pub use candle::{Candle, RawBar};
pub use error::{DataError, DataResult};
pub use timeframe::Timeframe;
