//! End-to-end pipeline: feed bars in, aggregate up, read back out.

use std::sync::Arc;

use chrono::{TimeZone, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use coindata_core::{AssetType, CountUpdate, RawBar, Timeframe};
use coindata_services::{
    AggregationOrchestrator, CandleStore, CoverageCache, IngestionService, TargetOutcome,
};

// 2024-01-01T00:00:00Z, a Monday
const DAY_START: i64 = 1_704_067_200;

fn hourly_bar(offset_hours: i64, close: Decimal) -> RawBar {
    let open = dec!(100);
    RawBar {
        timestamp: DAY_START + offset_hours * 3600,
        open,
        high: close.max(open),
        low: close.min(open),
        close,
        volume: dec!(10),
        market_cap: Some(dec!(1000000)),
    }
}

#[test]
fn ingest_then_aggregate_then_read() {
    let store = Arc::new(CandleStore::new_in_memory().unwrap());
    let cache = Arc::new(CoverageCache::new(Arc::clone(&store)));
    let ingestion =
        IngestionService::new(Arc::clone(&store), Arc::clone(&cache), Timeframe::OneHour);
    let orchestrator = AggregationOrchestrator::new(Arc::clone(&store), Arc::clone(&cache));

    let asset = store
        .upsert_asset("BTC", "Bitcoin", AssetType::Crypto)
        .unwrap();

    // Two full days of hourly bars
    let bars: Vec<RawBar> = (0..48)
        .map(|h| hourly_bar(h, dec!(100) + Decimal::from(h % 24)))
        .collect();
    let report = ingestion.ingest_bars(asset.id, bars).unwrap();
    assert_eq!(report.outcome.inserted, 48);

    let outcomes = orchestrator.run(asset.id, Timeframe::OneHour, None).unwrap();
    assert_eq!(
        outcomes[&Timeframe::OneDay],
        TargetOutcome::Aggregated { records: 2 }
    );
    assert_eq!(
        outcomes[&Timeframe::OneWeek],
        TargetOutcome::Aggregated { records: 1 }
    );

    // Daily candles read back in order with correct rollups
    let days = store
        .get_range(asset.id, Timeframe::OneDay, None, None, None)
        .unwrap();
    assert_eq!(days.len(), 2);
    assert_eq!(
        days[0].bucket_start,
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    );
    assert_eq!(days[0].open, dec!(100));
    assert_eq!(days[0].close, dec!(123));
    assert_eq!(days[0].volume, dec!(240));
    assert!(days[0].market_cap.is_some());

    // Coverage summary reflects both base and derived data
    let all = cache.get_all_timeframe_data(asset.id);
    assert_eq!(all[&Timeframe::OneHour].count, 48);
    assert_eq!(all[&Timeframe::OneDay].count, 2);
    assert!(all[&Timeframe::OneDay]
        .can_aggregate_to
        .contains(&Timeframe::OneWeek));

    // A second run finds everything caught up
    let second = orchestrator.run(asset.id, Timeframe::OneHour, None).unwrap();
    assert!(second.values().all(|o| *o == TargetOutcome::UpToDate));
}

#[test]
fn stale_cache_never_blocks_recovery() {
    let store = Arc::new(CandleStore::new_in_memory().unwrap());
    let cache = Arc::new(CoverageCache::new(Arc::clone(&store)));
    let ingestion =
        IngestionService::new(Arc::clone(&store), Arc::clone(&cache), Timeframe::OneHour);
    let orchestrator = AggregationOrchestrator::new(Arc::clone(&store), Arc::clone(&cache));

    let asset = store
        .upsert_asset("ETH", "Ethereum", AssetType::Crypto)
        .unwrap();

    let bars: Vec<RawBar> = (0..24)
        .map(|h| hourly_bar(h, dec!(200) + Decimal::from(h)))
        .collect();
    ingestion.ingest_bars(asset.id, bars).unwrap();

    // Corrupt the cache with an understated source span, then repair
    cache
        .update(
            asset.id,
            Timeframe::OneHour,
            CountUpdate::Replace(1),
            None,
            None,
        )
        .unwrap();
    let scanned = cache.refresh_from_store(asset.id).unwrap();
    assert_eq!(scanned[&Timeframe::OneHour].count, 24);

    let outcomes = orchestrator.run(asset.id, Timeframe::OneHour, None).unwrap();
    assert_eq!(
        outcomes[&Timeframe::OneDay],
        TargetOutcome::Aggregated { records: 1 }
    );
}
