//! Error types shared across the platform

use thiserror::Error;

/// Domain-level errors for price data operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DataError {
    #[error("Invalid timeframe code: {0}")]
    InvalidTimeframe(String),

    #[error("Cannot aggregate {source_tf} into {target}: target duration is not a larger multiple of source")]
    IncompatibleTimeframe { source_tf: String, target: String },

    #[error("Invalid candle: {0}")]
    InvalidCandle(String),
}

impl DataError {
    pub fn invalid_timeframe(code: impl Into<String>) -> Self {
        DataError::InvalidTimeframe(code.into())
    }

    pub fn incompatible(source: impl Into<String>, target: impl Into<String>) -> Self {
        DataError::IncompatibleTimeframe {
            source_tf: source.into(),
            target: target.into(),
        }
    }

    pub fn invalid_candle(msg: impl Into<String>) -> Self {
        DataError::InvalidCandle(msg.into())
    }
}

/// Result type alias for domain operations
pub type DataResult<T> = Result<T, DataError>;
