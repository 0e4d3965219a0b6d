//! Candle Store
//!
//! SQLite-based storage for OHLCV candles and the asset registry. The
//! `(asset_id, timeframe, bucket_start)` uniqueness constraint is the only
//! concurrency-control primitive: concurrent writers racing on the same key
//! both treat a conflict as a benign skip.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use tracing::warn;

use coindata_core::{
    Asset, AssetType, Candle, DataError, Timeframe, TimeframeCoverage,
};

/// Revisions to the forming bucket below this threshold are ignored
const REVISION_TOLERANCE: f64 = 1e-8;

/// Keep IN-list sizes under SQLite's default host-parameter limit
const EXISTENCE_CHUNK: usize = 500;

/// Result of a batch upsert
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpsertOutcome {
    /// Rows newly inserted
    pub inserted: usize,
    /// Forming-bucket rows revised in place
    pub updated: usize,
    /// Rows skipped (historical, unchanged, or lost insert races)
    pub skipped: usize,
    /// Bucket span of the batch, when non-empty
    pub time_range: Option<(DateTime<Utc>, DateTime<Utc>)>,
}

impl UpsertOutcome {
    /// Rows that changed the table
    pub fn written(&self) -> usize {
        self.inserted + self.updated
    }
}

/// Candle and asset storage using SQLite
pub struct CandleStore {
    conn: Mutex<Connection>,
}

impl CandleStore {
    /// Create a new CandleStore instance
    ///
    /// Creates the database file and tables if they don't exist.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self, CandleStoreError> {
        if let Some(parent) = db_path.as_ref().parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                CandleStoreError::Io(format!("Failed to create database directory: {}", e))
            })?;
        }

        let conn = Connection::open(db_path).map_err(CandleStoreError::Database)?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;

        Ok(store)
    }

    /// Create an in-memory CandleStore (useful for testing)
    pub fn new_in_memory() -> Result<Self, CandleStoreError> {
        let conn = Connection::open_in_memory().map_err(CandleStoreError::Database)?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;

        Ok(store)
    }

    /// Initialize the database schema
    fn init_schema(&self) -> Result<(), CandleStoreError> {
        let conn = self.conn.lock().map_err(|_| CandleStoreError::LockError)?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS assets (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                symbol TEXT NOT NULL UNIQUE,
                name TEXT NOT NULL,
                asset_type TEXT NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1,
                is_supported INTEGER NOT NULL DEFAULT 1,
                timeframe_data JSON NOT NULL DEFAULT '{}'
            );

            CREATE TABLE IF NOT EXISTS candles (
                asset_id INTEGER NOT NULL,
                timeframe TEXT NOT NULL,
                bucket_start INTEGER NOT NULL,
                open REAL NOT NULL,
                high REAL NOT NULL,
                low REAL NOT NULL,
                close REAL NOT NULL,
                volume REAL NOT NULL,
                market_cap REAL,
                trade_count INTEGER,
                vwap REAL,
                validated INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (asset_id, timeframe, bucket_start)
            );

            CREATE INDEX IF NOT EXISTS idx_candles_asset_tf
            ON candles(asset_id, timeframe);

            CREATE INDEX IF NOT EXISTS idx_candles_tf_bucket
            ON candles(timeframe, bucket_start);
            "#,
        )
        .map_err(CandleStoreError::Database)?;

        Ok(())
    }

    // =========================================================================
    // Asset registry
    // =========================================================================

    /// Insert an asset if its symbol is new, returning the stored row either way
    pub fn upsert_asset(
        &self,
        symbol: &str,
        name: &str,
        asset_type: AssetType,
    ) -> Result<Asset, CandleStoreError> {
        let conn = self.conn.lock().map_err(|_| CandleStoreError::LockError)?;

        conn.execute(
            r#"
            INSERT INTO assets (symbol, name, asset_type)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(symbol) DO UPDATE SET name = excluded.name
            "#,
            params![symbol, name, asset_type.as_str()],
        )
        .map_err(CandleStoreError::Database)?;

        Self::select_asset(&conn, "symbol = ?1", params![symbol])?
            .ok_or_else(|| CandleStoreError::Io(format!("asset {} vanished after upsert", symbol)))
    }

    /// Get an asset by id
    pub fn get_asset(&self, asset_id: i64) -> Result<Option<Asset>, CandleStoreError> {
        let conn = self.conn.lock().map_err(|_| CandleStoreError::LockError)?;
        Self::select_asset(&conn, "id = ?1", params![asset_id])
    }

    /// Get an asset by symbol
    pub fn get_asset_by_symbol(&self, symbol: &str) -> Result<Option<Asset>, CandleStoreError> {
        let conn = self.conn.lock().map_err(|_| CandleStoreError::LockError)?;
        Self::select_asset(&conn, "symbol = ?1", params![symbol])
    }

    /// List all active assets
    pub fn list_active_assets(&self) -> Result<Vec<Asset>, CandleStoreError> {
        let conn = self.conn.lock().map_err(|_| CandleStoreError::LockError)?;

        let mut stmt = conn
            .prepare(
                "SELECT id, symbol, name, asset_type, is_active, is_supported, timeframe_data
                 FROM assets WHERE is_active = 1 ORDER BY symbol ASC",
            )
            .map_err(CandleStoreError::Database)?;

        let assets = stmt
            .query_map([], Self::row_to_asset)
            .map_err(CandleStoreError::Database)?
            .filter_map(|r| r.ok())
            .collect();

        Ok(assets)
    }

    fn select_asset(
        conn: &Connection,
        predicate: &str,
        args: impl rusqlite::Params,
    ) -> Result<Option<Asset>, CandleStoreError> {
        let sql = format!(
            "SELECT id, symbol, name, asset_type, is_active, is_supported, timeframe_data
             FROM assets WHERE {}",
            predicate
        );

        conn.query_row(&sql, args, Self::row_to_asset)
            .optional()
            .map_err(CandleStoreError::Database)
    }

    fn row_to_asset(row: &rusqlite::Row<'_>) -> rusqlite::Result<Asset> {
        let asset_type_str: String = row.get(3)?;
        let timeframe_json: String = row.get(6)?;

        Ok(Asset {
            id: row.get(0)?,
            symbol: row.get(1)?,
            name: row.get(2)?,
            asset_type: AssetType::parse(&asset_type_str).unwrap_or(AssetType::Crypto),
            is_active: row.get(4)?,
            is_supported: row.get(5)?,
            timeframe_data: serde_json::from_str(&timeframe_json).unwrap_or_default(),
        })
    }

    /// Replace the persisted coverage summary for an asset (replace-on-write)
    pub fn save_timeframe_data(
        &self,
        asset_id: i64,
        data: &HashMap<Timeframe, TimeframeCoverage>,
    ) -> Result<(), CandleStoreError> {
        let conn = self.conn.lock().map_err(|_| CandleStoreError::LockError)?;

        let json = serde_json::to_string(data)
            .map_err(|e| CandleStoreError::Serialization(e.to_string()))?;

        conn.execute(
            "UPDATE assets SET timeframe_data = ?1 WHERE id = ?2",
            params![json, asset_id],
        )
        .map_err(CandleStoreError::Database)?;

        Ok(())
    }

    /// Load the persisted coverage summary for an asset
    pub fn load_timeframe_data(
        &self,
        asset_id: i64,
    ) -> Result<HashMap<Timeframe, TimeframeCoverage>, CandleStoreError> {
        let conn = self.conn.lock().map_err(|_| CandleStoreError::LockError)?;

        let json: Option<String> = conn
            .query_row(
                "SELECT timeframe_data FROM assets WHERE id = ?1",
                params![asset_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(CandleStoreError::Database)?;

        Ok(json
            .and_then(|j| serde_json::from_str(&j).ok())
            .unwrap_or_default())
    }

    // =========================================================================
    // Candle reads
    // =========================================================================

    /// Get candles for an asset/timeframe within an optional time range,
    /// ascending by bucket start
    pub fn get_range(
        &self,
        asset_id: i64,
        timeframe: Timeframe,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        limit: Option<u32>,
    ) -> Result<Vec<Candle>, CandleStoreError> {
        let conn = self.conn.lock().map_err(|_| CandleStoreError::LockError)?;

        let from_ts = start.map(|t| t.timestamp()).unwrap_or(i64::MIN);
        let to_ts = end.map(|t| t.timestamp()).unwrap_or(i64::MAX);
        let limit = limit.map(|l| l as i64).unwrap_or(-1);

        let mut stmt = conn
            .prepare(
                r#"
            SELECT bucket_start, open, high, low, close, volume, market_cap, trade_count, vwap, validated
            FROM candles
            WHERE asset_id = ?1 AND timeframe = ?2 AND bucket_start >= ?3 AND bucket_start <= ?4
            ORDER BY bucket_start ASC
            LIMIT ?5
            "#,
            )
            .map_err(CandleStoreError::Database)?;

        let candles = stmt
            .query_map(
                params![asset_id, timeframe.as_str(), from_ts, to_ts, limit],
                |row| Self::row_to_candle(row, asset_id, timeframe),
            )
            .map_err(CandleStoreError::Database)?
            .filter_map(|r| r.ok())
            .collect();

        Ok(candles)
    }

    /// Latest stored bucket start for an asset/timeframe
    pub fn latest_bucket(
        &self,
        asset_id: i64,
        timeframe: Timeframe,
    ) -> Result<Option<DateTime<Utc>>, CandleStoreError> {
        let conn = self.conn.lock().map_err(|_| CandleStoreError::LockError)?;

        let ts: Option<i64> = conn
            .query_row(
                "SELECT MAX(bucket_start) FROM candles WHERE asset_id = ?1 AND timeframe = ?2",
                params![asset_id, timeframe.as_str()],
                |row| row.get(0),
            )
            .map_err(CandleStoreError::Database)?;

        Ok(ts.and_then(|t| DateTime::from_timestamp(t, 0)))
    }

    /// Number of stored candles for an asset/timeframe
    pub fn count(&self, asset_id: i64, timeframe: Timeframe) -> Result<u64, CandleStoreError> {
        let conn = self.conn.lock().map_err(|_| CandleStoreError::LockError)?;

        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM candles WHERE asset_id = ?1 AND timeframe = ?2",
                params![asset_id, timeframe.as_str()],
                |row| row.get(0),
            )
            .map_err(CandleStoreError::Database)?;

        Ok(count as u64)
    }

    /// Full-scan coverage summary per timeframe for one asset.
    ///
    /// This is the disaster-recovery path behind
    /// `CoverageCache::refresh_from_store`.
    pub fn coverage_by_timeframe(
        &self,
        asset_id: i64,
    ) -> Result<HashMap<Timeframe, TimeframeCoverage>, CandleStoreError> {
        let conn = self.conn.lock().map_err(|_| CandleStoreError::LockError)?;

        let mut stmt = conn
            .prepare(
                "SELECT timeframe, COUNT(*), MIN(bucket_start), MAX(bucket_start)
                 FROM candles WHERE asset_id = ?1 GROUP BY timeframe",
            )
            .map_err(CandleStoreError::Database)?;

        let rows = stmt
            .query_map(params![asset_id], |row| {
                let tf: String = row.get(0)?;
                let count: i64 = row.get(1)?;
                let min_ts: Option<i64> = row.get(2)?;
                let max_ts: Option<i64> = row.get(3)?;
                Ok((tf, count, min_ts, max_ts))
            })
            .map_err(CandleStoreError::Database)?;

        let mut coverage = HashMap::new();
        for row in rows.flatten() {
            let (tf_str, count, min_ts, max_ts) = row;
            let Ok(timeframe) = Timeframe::parse(&tf_str) else {
                warn!("Skipping unknown timeframe code in candles table: {}", tf_str);
                continue;
            };
            coverage.insert(
                timeframe,
                TimeframeCoverage::from_scan(
                    count as u64,
                    min_ts.and_then(|t| DateTime::from_timestamp(t, 0)),
                    max_ts.and_then(|t| DateTime::from_timestamp(t, 0)),
                ),
            );
        }

        Ok(coverage)
    }

    fn row_to_candle(
        row: &rusqlite::Row<'_>,
        asset_id: i64,
        timeframe: Timeframe,
    ) -> rusqlite::Result<Candle> {
        let bucket_ts: i64 = row.get(0)?;
        let open: f64 = row.get(1)?;
        let high: f64 = row.get(2)?;
        let low: f64 = row.get(3)?;
        let close: f64 = row.get(4)?;
        let volume: f64 = row.get(5)?;
        let market_cap: Option<f64> = row.get(6)?;
        let trade_count: Option<i64> = row.get(7)?;
        let vwap: Option<f64> = row.get(8)?;
        let validated: bool = row.get(9)?;

        let mut candle = Candle::new(
            asset_id,
            timeframe,
            DateTime::from_timestamp(bucket_ts, 0).unwrap_or_else(Utc::now),
            Decimal::try_from(open).unwrap_or_default(),
            Decimal::try_from(high).unwrap_or_default(),
            Decimal::try_from(low).unwrap_or_default(),
            Decimal::try_from(close).unwrap_or_default(),
            Decimal::try_from(volume).unwrap_or_default(),
        );
        candle.market_cap = market_cap.and_then(|m| Decimal::try_from(m).ok());
        candle.trade_count = trade_count;
        candle.vwap = vwap.and_then(|v| Decimal::try_from(v).ok());
        candle.validated = validated;
        Ok(candle)
    }

    // =========================================================================
    // Candle writes
    // =========================================================================

    /// Insert or revise a batch of candles for one asset/timeframe.
    ///
    /// Runs inside a single transaction. Existing rows are only revised when
    /// they are the most-recent known bucket for the timeframe (the still
    /// forming candle) and the incoming close/high/low actually differ;
    /// closed historical buckets are immutable. An insert that loses a race
    /// to a concurrent writer counts as skipped, never as an error.
    pub fn upsert_batch(
        &self,
        asset_id: i64,
        timeframe: Timeframe,
        candles: &[Candle],
    ) -> Result<UpsertOutcome, CandleStoreError> {
        if candles.is_empty() {
            return Ok(UpsertOutcome::default());
        }

        // Validation failures are caller bugs and abort before any write
        for candle in candles {
            candle.validate()?;
        }

        let mut conn = self.conn.lock().map_err(|_| CandleStoreError::LockError)?;
        let tx = conn.transaction().map_err(CandleStoreError::Database)?;

        let keys: Vec<i64> = candles.iter().map(|c| c.bucket_start.timestamp()).collect();
        let existing = Self::existing_rows(&tx, asset_id, timeframe, &keys)?;

        let mut latest: Option<i64> = tx
            .query_row(
                "SELECT MAX(bucket_start) FROM candles WHERE asset_id = ?1 AND timeframe = ?2",
                params![asset_id, timeframe.as_str()],
                |row| row.get(0),
            )
            .map_err(CandleStoreError::Database)?;

        let mut outcome = UpsertOutcome::default();

        for candle in candles {
            let bucket_ts = candle.bucket_start.timestamp();

            if let Some((close, high, low)) = existing.get(&bucket_ts) {
                let is_forming = latest == Some(bucket_ts);
                let revised = differs(dec_to_f64(candle.close), *close)
                    || differs(dec_to_f64(candle.high), *high)
                    || differs(dec_to_f64(candle.low), *low);

                if is_forming && revised {
                    tx.execute(
                        r#"
                        UPDATE candles
                        SET open = ?4, high = ?5, low = ?6, close = ?7, volume = ?8,
                            market_cap = ?9, trade_count = ?10, vwap = ?11, validated = ?12
                        WHERE asset_id = ?1 AND timeframe = ?2 AND bucket_start = ?3
                        "#,
                        params![
                            asset_id,
                            timeframe.as_str(),
                            bucket_ts,
                            dec_to_f64(candle.open),
                            dec_to_f64(candle.high),
                            dec_to_f64(candle.low),
                            dec_to_f64(candle.close),
                            dec_to_f64(candle.volume),
                            candle.market_cap.map(dec_to_f64),
                            candle.trade_count,
                            candle.vwap.map(dec_to_f64),
                            candle.validated,
                        ],
                    )
                    .map_err(CandleStoreError::Database)?;
                    outcome.updated += 1;
                } else {
                    outcome.skipped += 1;
                }
            } else {
                // ON CONFLICT DO NOTHING absorbs races with concurrent
                // writers between the existence check and this insert
                let changed = tx
                    .execute(
                        r#"
                        INSERT INTO candles
                            (asset_id, timeframe, bucket_start, open, high, low, close,
                             volume, market_cap, trade_count, vwap, validated)
                        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                        ON CONFLICT(asset_id, timeframe, bucket_start) DO NOTHING
                        "#,
                        params![
                            asset_id,
                            timeframe.as_str(),
                            bucket_ts,
                            dec_to_f64(candle.open),
                            dec_to_f64(candle.high),
                            dec_to_f64(candle.low),
                            dec_to_f64(candle.close),
                            dec_to_f64(candle.volume),
                            candle.market_cap.map(dec_to_f64),
                            candle.trade_count,
                            candle.vwap.map(dec_to_f64),
                            candle.validated,
                        ],
                    )
                    .map_err(CandleStoreError::Database)?;

                if changed == 0 {
                    outcome.skipped += 1;
                } else {
                    outcome.inserted += 1;
                    if latest.map_or(true, |l| bucket_ts > l) {
                        latest = Some(bucket_ts);
                    }
                }
            }
        }

        tx.commit().map_err(CandleStoreError::Database)?;

        let min_ts = keys.iter().min().copied();
        let max_ts = keys.iter().max().copied();
        outcome.time_range = match (min_ts, max_ts) {
            (Some(a), Some(b)) => DateTime::from_timestamp(a, 0)
                .zip(DateTime::from_timestamp(b, 0)),
            _ => None,
        };

        Ok(outcome)
    }

    /// Batched existence check: one IN query per chunk instead of one
    /// query per candle
    fn existing_rows(
        tx: &rusqlite::Transaction<'_>,
        asset_id: i64,
        timeframe: Timeframe,
        keys: &[i64],
    ) -> Result<HashMap<i64, (f64, f64, f64)>, CandleStoreError> {
        let mut existing = HashMap::new();

        for chunk in keys.chunks(EXISTENCE_CHUNK) {
            let placeholders = vec!["?"; chunk.len()].join(", ");
            let sql = format!(
                "SELECT bucket_start, close, high, low FROM candles
                 WHERE asset_id = ? AND timeframe = ? AND bucket_start IN ({})",
                placeholders
            );

            let mut args: Vec<rusqlite::types::Value> = Vec::with_capacity(chunk.len() + 2);
            args.push(asset_id.into());
            args.push(timeframe.as_str().to_string().into());
            args.extend(chunk.iter().map(|&ts| rusqlite::types::Value::from(ts)));

            let mut stmt = tx.prepare(&sql).map_err(CandleStoreError::Database)?;

            let rows = stmt
                .query_map(rusqlite::params_from_iter(args), |row| {
                    let bucket: i64 = row.get(0)?;
                    let close: f64 = row.get(1)?;
                    let high: f64 = row.get(2)?;
                    let low: f64 = row.get(3)?;
                    Ok((bucket, (close, high, low)))
                })
                .map_err(CandleStoreError::Database)?;

            for row in rows.flatten() {
                existing.insert(row.0, row.1);
            }
        }

        Ok(existing)
    }

    // =========================================================================
    // SQL rollup
    // =========================================================================

    /// Compute target-timeframe rollups from source candles in one grouped
    /// query.
    ///
    /// Open/close come from FIRST_VALUE/LAST_VALUE over each bucket
    /// partition ordered by time; high/low/volume are plain aggregates.
    /// This keeps the whole rollup in the query engine instead of
    /// iterating source candles in application code.
    pub fn select_rollup(
        &self,
        asset_id: i64,
        source: Timeframe,
        target: Timeframe,
        window: Option<(DateTime<Utc>, DateTime<Utc>)>,
    ) -> Result<Vec<Candle>, CandleStoreError> {
        let conn = self.conn.lock().map_err(|_| CandleStoreError::LockError)?;

        let bucket_expr = bucket_sql(target);
        let sql = format!(
            r#"
            SELECT bucket,
                   MIN(first_open),
                   MAX(high),
                   MIN(low),
                   MIN(last_close),
                   SUM(volume),
                   AVG(market_cap),
                   SUM(trade_count),
                   CASE WHEN SUM(volume) > 0 THEN SUM(close * volume) / SUM(volume) END
            FROM (
                SELECT {expr} AS bucket, high, low, close, volume, market_cap, trade_count,
                       FIRST_VALUE(open) OVER w AS first_open,
                       LAST_VALUE(close) OVER w AS last_close
                FROM candles
                WHERE asset_id = ?1 AND timeframe = ?2
                  AND bucket_start >= ?3 AND bucket_start <= ?4
                WINDOW w AS (
                    PARTITION BY {expr} ORDER BY bucket_start
                    ROWS BETWEEN UNBOUNDED PRECEDING AND UNBOUNDED FOLLOWING
                )
            )
            GROUP BY bucket
            ORDER BY bucket ASC
            "#,
            expr = bucket_expr
        );

        let (from_ts, to_ts) = match window {
            Some((start, end)) => (start.timestamp(), end.timestamp()),
            None => (i64::MIN, i64::MAX),
        };

        let mut stmt = conn.prepare(&sql).map_err(CandleStoreError::Database)?;

        let candles = stmt
            .query_map(
                params![asset_id, source.as_str(), from_ts, to_ts],
                |row| {
                    let bucket_ts: i64 = row.get(0)?;
                    let open: f64 = row.get(1)?;
                    let high: f64 = row.get(2)?;
                    let low: f64 = row.get(3)?;
                    let close: f64 = row.get(4)?;
                    let volume: f64 = row.get(5)?;
                    let market_cap: Option<f64> = row.get(6)?;
                    let trade_count: Option<i64> = row.get(7)?;
                    let vwap: Option<f64> = row.get(8)?;

                    let mut candle = Candle::new(
                        asset_id,
                        target,
                        DateTime::from_timestamp(bucket_ts, 0).unwrap_or_else(Utc::now),
                        Decimal::try_from(open).unwrap_or_default(),
                        Decimal::try_from(high).unwrap_or_default(),
                        Decimal::try_from(low).unwrap_or_default(),
                        Decimal::try_from(close).unwrap_or_default(),
                        Decimal::try_from(volume).unwrap_or_default(),
                    );
                    candle.market_cap = market_cap.and_then(|m| Decimal::try_from(m).ok());
                    candle.trade_count = trade_count;
                    candle.vwap = vwap.and_then(|v| Decimal::try_from(v).ok());
                    candle.validated = true;
                    Ok(candle)
                },
            )
            .map_err(CandleStoreError::Database)?
            .filter_map(|r| r.ok())
            .collect();

        Ok(candles)
    }
}

/// SQL expression mapping a source row's `bucket_start` to its target
/// bucket. Weeks snap to the ISO Monday and months to the first of the
/// calendar month via SQLite date functions; fixed-duration frames truncate
/// on the epoch grid.
fn bucket_sql(target: Timeframe) -> String {
    match target {
        Timeframe::OneWeek => {
            "CAST(strftime('%s', date(bucket_start, 'unixepoch', '-6 days', 'weekday 1')) AS INTEGER)"
                .to_string()
        }
        Timeframe::OneMonth => {
            "CAST(strftime('%s', strftime('%Y-%m-01 00:00:00', bucket_start, 'unixepoch')) AS INTEGER)"
                .to_string()
        }
        _ => format!("(bucket_start / {secs}) * {secs}", secs = target.seconds()),
    }
}

fn dec_to_f64(d: Decimal) -> f64 {
    d.try_into()
        .unwrap_or_else(|_| d.to_string().parse().unwrap_or(0.0))
}

fn differs(a: f64, b: f64) -> bool {
    (a - b).abs() > REVISION_TOLERANCE
}

/// Errors that can occur during candle storage operations
#[derive(Debug, thiserror::Error)]
pub enum CandleStoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error(transparent)]
    Core(#[from] DataError),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Failed to acquire lock")]
    LockError,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn hourly_candle(asset_id: i64, hour: u32, close: Decimal) -> Candle {
        let high = close.max(dec!(100));
        let low = close.min(dec!(100));
        Candle::new(
            asset_id,
            Timeframe::OneHour,
            Utc.with_ymd_and_hms(2024, 1, 1, hour, 0, 0).unwrap(),
            dec!(100),
            high,
            low,
            close,
            dec!(10),
        )
    }

    #[test]
    fn test_upsert_inserts_new_candles() {
        let store = CandleStore::new_in_memory().unwrap();
        let candles = vec![hourly_candle(1, 0, dec!(101)), hourly_candle(1, 1, dec!(102))];

        let outcome = store.upsert_batch(1, Timeframe::OneHour, &candles).unwrap();
        assert_eq!(outcome.inserted, 2);
        assert_eq!(outcome.updated, 0);
        assert_eq!(outcome.skipped, 0);
        assert_eq!(store.count(1, Timeframe::OneHour).unwrap(), 2);
    }

    #[test]
    fn test_upsert_is_idempotent() {
        let store = CandleStore::new_in_memory().unwrap();
        let candles = vec![hourly_candle(1, 0, dec!(101)), hourly_candle(1, 1, dec!(102))];

        store.upsert_batch(1, Timeframe::OneHour, &candles).unwrap();
        let second = store.upsert_batch(1, Timeframe::OneHour, &candles).unwrap();

        assert_eq!(second.inserted, 0);
        assert_eq!(second.updated, 0);
        assert_eq!(second.skipped, 2);
        assert_eq!(store.count(1, Timeframe::OneHour).unwrap(), 2);
    }

    #[test]
    fn test_existence_check_spans_param_chunks() {
        let store = CandleStore::new_in_memory().unwrap();
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let candles: Vec<Candle> = (0..EXISTENCE_CHUNK as i64 + 10)
            .map(|h| {
                Candle::new(
                    1,
                    Timeframe::OneHour,
                    base + chrono::Duration::hours(h),
                    dec!(100),
                    dec!(101),
                    dec!(99),
                    dec!(100.5),
                    dec!(1),
                )
            })
            .collect();

        store.upsert_batch(1, Timeframe::OneHour, &candles).unwrap();

        // The batch needs more than one IN-list chunk; every key must
        // still be recognized as existing on the second pass
        let second = store.upsert_batch(1, Timeframe::OneHour, &candles).unwrap();
        assert_eq!(second.inserted, 0);
        assert_eq!(second.updated, 0);
        assert_eq!(second.skipped, candles.len());
    }

    #[test]
    fn test_historical_buckets_are_immutable() {
        let store = CandleStore::new_in_memory().unwrap();
        let candles = vec![
            hourly_candle(1, 0, dec!(101)),
            hourly_candle(1, 1, dec!(102)),
            hourly_candle(1, 2, dec!(103)),
        ];
        store.upsert_batch(1, Timeframe::OneHour, &candles).unwrap();

        // Revise a bucket two timeframes in the past
        let revised = vec![hourly_candle(1, 0, dec!(999))];
        let outcome = store.upsert_batch(1, Timeframe::OneHour, &revised).unwrap();
        assert_eq!(outcome.updated, 0);
        assert_eq!(outcome.skipped, 1);

        let stored = store
            .get_range(1, Timeframe::OneHour, None, None, None)
            .unwrap();
        assert_eq!(stored[0].close, dec!(101));
    }

    #[test]
    fn test_forming_bucket_is_revisable() {
        let store = CandleStore::new_in_memory().unwrap();
        let candles = vec![hourly_candle(1, 0, dec!(101)), hourly_candle(1, 1, dec!(102))];
        store.upsert_batch(1, Timeframe::OneHour, &candles).unwrap();

        let revised = vec![hourly_candle(1, 1, dec!(110))];
        let outcome = store.upsert_batch(1, Timeframe::OneHour, &revised).unwrap();
        assert_eq!(outcome.updated, 1);

        let stored = store
            .get_range(1, Timeframe::OneHour, None, None, None)
            .unwrap();
        assert_eq!(stored[1].close, dec!(110));
    }

    #[test]
    fn test_forming_bucket_unchanged_values_skip() {
        let store = CandleStore::new_in_memory().unwrap();
        let candles = vec![hourly_candle(1, 0, dec!(101))];
        store.upsert_batch(1, Timeframe::OneHour, &candles).unwrap();

        let outcome = store.upsert_batch(1, Timeframe::OneHour, &candles).unwrap();
        assert_eq!(outcome.updated, 0);
        assert_eq!(outcome.skipped, 1);
    }

    #[test]
    fn test_upsert_rejects_invalid_candle() {
        let store = CandleStore::new_in_memory().unwrap();
        let mut bad = hourly_candle(1, 0, dec!(101));
        bad.low = dec!(500);

        let good = hourly_candle(1, 1, dec!(102));
        let result = store.upsert_batch(1, Timeframe::OneHour, &[good, bad]);
        assert!(result.is_err());
        // Nothing committed
        assert_eq!(store.count(1, Timeframe::OneHour).unwrap(), 0);
    }

    #[test]
    fn test_get_range_respects_bounds_and_limit() {
        let store = CandleStore::new_in_memory().unwrap();
        let candles: Vec<Candle> = (0..6)
            .map(|h| hourly_candle(1, h, dec!(100) + Decimal::from(h)))
            .collect();
        store.upsert_batch(1, Timeframe::OneHour, &candles).unwrap();

        let start = Utc.with_ymd_and_hms(2024, 1, 1, 2, 0, 0).unwrap();
        let fetched = store
            .get_range(1, Timeframe::OneHour, Some(start), None, Some(2))
            .unwrap();
        assert_eq!(fetched.len(), 2);
        assert_eq!(fetched[0].bucket_start, start);
        assert!(fetched[0].bucket_start < fetched[1].bucket_start);
    }

    #[test]
    fn test_coverage_by_timeframe_groups_correctly() {
        let store = CandleStore::new_in_memory().unwrap();
        let hourly: Vec<Candle> = (0..4)
            .map(|h| hourly_candle(1, h, dec!(101)))
            .collect();
        store.upsert_batch(1, Timeframe::OneHour, &hourly).unwrap();

        let daily = Candle::new(
            1,
            Timeframe::OneDay,
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            dec!(100),
            dec!(105),
            dec!(99),
            dec!(103),
            dec!(40),
        );
        store.upsert_batch(1, Timeframe::OneDay, &[daily]).unwrap();

        let coverage = store.coverage_by_timeframe(1).unwrap();
        assert_eq!(coverage[&Timeframe::OneHour].count, 4);
        assert_eq!(coverage[&Timeframe::OneDay].count, 1);
        assert_eq!(
            coverage[&Timeframe::OneHour].earliest_time,
            Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap())
        );
        assert_eq!(
            coverage[&Timeframe::OneHour].latest_time,
            Some(Utc.with_ymd_and_hms(2024, 1, 1, 3, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_rollup_full_day_of_hourly_candles() {
        let store = CandleStore::new_in_memory().unwrap();
        // Closes 100..=123 across a full UTC day, constant volume 10
        let candles: Vec<Candle> = (0..24)
            .map(|h| hourly_candle(1, h, dec!(100) + Decimal::from(h)))
            .collect();
        store.upsert_batch(1, Timeframe::OneHour, &candles).unwrap();

        let rollup = store
            .select_rollup(1, Timeframe::OneHour, Timeframe::OneDay, None)
            .unwrap();
        assert_eq!(rollup.len(), 1);

        let day = &rollup[0];
        assert_eq!(day.bucket_start, Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        assert_eq!(day.open, dec!(100));
        assert_eq!(day.close, dec!(123));
        assert_eq!(day.high, dec!(123));
        assert_eq!(day.low, dec!(100));
        assert_eq!(day.volume, dec!(240));
    }

    #[test]
    fn test_rollup_empty_window_yields_nothing() {
        let store = CandleStore::new_in_memory().unwrap();
        let rollup = store
            .select_rollup(1, Timeframe::OneHour, Timeframe::OneDay, None)
            .unwrap();
        assert!(rollup.is_empty());
    }

    #[test]
    fn test_rollup_monthly_buckets_are_calendar_aligned() {
        let store = CandleStore::new_in_memory().unwrap();
        let jan = Candle::new(
            1,
            Timeframe::OneDay,
            Utc.with_ymd_and_hms(2024, 1, 31, 0, 0, 0).unwrap(),
            dec!(100),
            dec!(105),
            dec!(99),
            dec!(103),
            dec!(5),
        );
        let feb = Candle::new(
            1,
            Timeframe::OneDay,
            Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap(),
            dec!(103),
            dec!(110),
            dec!(102),
            dec!(108),
            dec!(6),
        );
        store.upsert_batch(1, Timeframe::OneDay, &[jan, feb]).unwrap();

        let rollup = store
            .select_rollup(1, Timeframe::OneDay, Timeframe::OneMonth, None)
            .unwrap();
        assert_eq!(rollup.len(), 2);
        assert_eq!(
            rollup[0].bucket_start,
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
        );
        assert_eq!(
            rollup[1].bucket_start,
            Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_rollup_weekly_buckets_start_on_monday() {
        let store = CandleStore::new_in_memory().unwrap();
        // 2024-01-10 is a Wednesday; its ISO week starts Monday 2024-01-08
        let wed = Candle::new(
            1,
            Timeframe::OneDay,
            Utc.with_ymd_and_hms(2024, 1, 10, 0, 0, 0).unwrap(),
            dec!(100),
            dec!(105),
            dec!(99),
            dec!(103),
            dec!(5),
        );
        store.upsert_batch(1, Timeframe::OneDay, &[wed]).unwrap();

        let rollup = store
            .select_rollup(1, Timeframe::OneDay, Timeframe::OneWeek, None)
            .unwrap();
        assert_eq!(rollup.len(), 1);
        assert_eq!(
            rollup[0].bucket_start,
            Utc.with_ymd_and_hms(2024, 1, 8, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_rollup_vwap_and_single_candle_group() {
        let store = CandleStore::new_in_memory().unwrap();
        let lone = hourly_candle(1, 5, dec!(104));
        store.upsert_batch(1, Timeframe::OneHour, &[lone]).unwrap();

        let rollup = store
            .select_rollup(1, Timeframe::OneHour, Timeframe::FourHours, None)
            .unwrap();
        assert_eq!(rollup.len(), 1);

        let candle = &rollup[0];
        // Degenerate but valid: one source candle per group
        assert_eq!(candle.bucket_start, Utc.with_ymd_and_hms(2024, 1, 1, 4, 0, 0).unwrap());
        assert_eq!(candle.close, dec!(104));
        assert_eq!(candle.vwap, Some(dec!(104)));
        assert!(candle.validate().is_ok());
    }

    #[test]
    fn test_asset_upsert_and_lookup() {
        let store = CandleStore::new_in_memory().unwrap();
        let asset = store.upsert_asset("BTC", "Bitcoin", AssetType::Crypto).unwrap();
        assert!(asset.id > 0);

        let again = store.upsert_asset("BTC", "Bitcoin", AssetType::Crypto).unwrap();
        assert_eq!(asset.id, again.id);

        let fetched = store.get_asset_by_symbol("BTC").unwrap().unwrap();
        assert_eq!(fetched.symbol, "BTC");
        assert!(fetched.is_active);
    }

    #[test]
    fn test_timeframe_data_round_trip() {
        let store = CandleStore::new_in_memory().unwrap();
        let asset = store.upsert_asset("ETH", "Ethereum", AssetType::Crypto).unwrap();

        let mut data = HashMap::new();
        data.insert(
            Timeframe::OneHour,
            TimeframeCoverage::from_scan(
                24,
                Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()),
                Some(Utc.with_ymd_and_hms(2024, 1, 1, 23, 0, 0).unwrap()),
            ),
        );

        store.save_timeframe_data(asset.id, &data).unwrap();
        let loaded = store.load_timeframe_data(asset.id).unwrap();
        assert_eq!(loaded[&Timeframe::OneHour].count, 24);
        assert_eq!(
            loaded[&Timeframe::OneHour].latest_time,
            Some(Utc.with_ymd_and_hms(2024, 1, 1, 23, 0, 0).unwrap())
        );
    }
}
