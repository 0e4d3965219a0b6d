//! Storage and aggregation services for the Coindata price platform
//!
//! This crate provides the service layer that moves candles from the
//! external price feed into durable storage at the base timeframe and
//! rolls them up into higher timeframes, with a per-asset coverage cache
//! to keep recurring aggregation runs cheap.

pub mod aggregation;
pub mod candle_store;
pub mod coverage_cache;
pub mod ingestion;
pub mod orchestrator;

pub use aggregation::{Aggregate, AggregationEngine, AggregationError, AggregationWindow};
pub use candle_store::{CandleStore, CandleStoreError, UpsertOutcome};
pub use coverage_cache::{CoverageCache, CoverageCacheError, TimeframeSummary};
pub use ingestion::{FeedError, IngestReport, IngestionError, IngestionService, PriceFeed};
pub use orchestrator::{
    AggregationOrchestrator, AssetRunReport, OrchestratorError, RunReport, TargetOutcome,
};
