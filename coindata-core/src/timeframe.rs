//! Timeframe codes and UTC time bucketing
//!
//! Every candle belongs to exactly one bucket per timeframe. Bucketing is
//! pure and always computed in UTC so that day/week/month boundaries are
//! unambiguous regardless of where the data was collected.

use chrono::{DateTime, Datelike, Duration, NaiveTime, Utc, Weekday};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::DataError;

/// Supported candle timeframes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Timeframe {
    /// 1 minute candles
    #[serde(rename = "1m")]
    OneMinute,
    /// 5 minute candles
    #[serde(rename = "5m")]
    FiveMinutes,
    /// 15 minute candles
    #[serde(rename = "15m")]
    FifteenMinutes,
    /// 1 hour candles
    #[serde(rename = "1h")]
    OneHour,
    /// 4 hour candles
    #[serde(rename = "4h")]
    FourHours,
    /// 1 day candles
    #[serde(rename = "1d")]
    OneDay,
    /// 1 week candles (ISO weeks, starting Monday)
    #[serde(rename = "1w")]
    OneWeek,
    /// 1 month candles (calendar months)
    #[serde(rename = "1M")]
    OneMonth,
}

impl Timeframe {
    /// All timeframes ordered from finest to coarsest
    pub fn all() -> &'static [Timeframe] {
        &[
            Timeframe::OneMinute,
            Timeframe::FiveMinutes,
            Timeframe::FifteenMinutes,
            Timeframe::OneHour,
            Timeframe::FourHours,
            Timeframe::OneDay,
            Timeframe::OneWeek,
            Timeframe::OneMonth,
        ]
    }

    /// Bucket duration in minutes.
    ///
    /// Months use a nominal 30-day duration; actual month buckets are
    /// calendar-aligned, the nominal value only drives compatibility checks
    /// and window sizing.
    pub fn minutes(&self) -> i64 {
        match self {
            Timeframe::OneMinute => 1,
            Timeframe::FiveMinutes => 5,
            Timeframe::FifteenMinutes => 15,
            Timeframe::OneHour => 60,
            Timeframe::FourHours => 240,
            Timeframe::OneDay => 1440,
            Timeframe::OneWeek => 10_080,
            Timeframe::OneMonth => 43_200,
        }
    }

    /// Bucket duration in seconds
    pub fn seconds(&self) -> i64 {
        self.minutes() * 60
    }

    /// Bucket duration as a chrono `Duration` (nominal for months)
    pub fn duration(&self) -> Duration {
        Duration::minutes(self.minutes())
    }

    /// The timeframe this one is most naturally aggregated from, if any
    pub fn base(&self) -> Option<Timeframe> {
        match self {
            Timeframe::OneMinute => None,
            Timeframe::FiveMinutes => Some(Timeframe::OneMinute),
            Timeframe::FifteenMinutes => Some(Timeframe::FiveMinutes),
            Timeframe::OneHour => Some(Timeframe::FifteenMinutes),
            Timeframe::FourHours => Some(Timeframe::OneHour),
            Timeframe::OneDay => Some(Timeframe::FourHours),
            Timeframe::OneWeek => Some(Timeframe::OneDay),
            Timeframe::OneMonth => Some(Timeframe::OneDay),
        }
    }

    /// String code for this timeframe
    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::OneMinute => "1m",
            Timeframe::FiveMinutes => "5m",
            Timeframe::FifteenMinutes => "15m",
            Timeframe::OneHour => "1h",
            Timeframe::FourHours => "4h",
            Timeframe::OneDay => "1d",
            Timeframe::OneWeek => "1w",
            Timeframe::OneMonth => "1M",
        }
    }

    /// Every timeframe this one can be aggregated into, ascending by
    /// duration. A target qualifies when its duration is a strictly larger
    /// integer multiple of the source's.
    pub fn aggregatable_targets(&self) -> Vec<Timeframe> {
        let source_minutes = self.minutes();
        Timeframe::all()
            .iter()
            .copied()
            .filter(|tf| {
                let m = tf.minutes();
                m > source_minutes && m % source_minutes == 0
            })
            .collect()
    }

    /// Check that `target` can be built from `self`.
    pub fn ensure_aggregates_to(&self, target: Timeframe) -> Result<(), DataError> {
        let m = target.minutes();
        if m > self.minutes() && m % self.minutes() == 0 {
            Ok(())
        } else {
            Err(DataError::incompatible(self.as_str(), target.as_str()))
        }
    }

    /// Truncate a timestamp down to the start of its containing bucket.
    ///
    /// Idempotent: `bucket_start(bucket_start(t)) == bucket_start(t)`, and
    /// the result is never after `t`. Sub-day frames truncate on the epoch
    /// grid (so `4h` buckets start at UTC hours divisible by 4 and `1d`
    /// buckets at UTC midnight); weeks snap to the ISO week's Monday and
    /// months to the first of the calendar month.
    pub fn bucket_start(&self, timestamp: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Timeframe::OneWeek => {
                let monday = timestamp.date_naive().week(Weekday::Mon).first_day();
                monday.and_time(NaiveTime::MIN).and_utc()
            }
            Timeframe::OneMonth => {
                let date = timestamp.date_naive();
                let first = date.with_day(1).unwrap_or(date);
                first.and_time(NaiveTime::MIN).and_utc()
            }
            _ => {
                let secs = self.seconds();
                let ts = timestamp.timestamp();
                let truncated = ts - ts.rem_euclid(secs);
                DateTime::from_timestamp(truncated, 0).unwrap_or(timestamp)
            }
        }
    }

    /// Start of the bucket immediately after the one containing `timestamp`
    pub fn next_bucket_start(&self, timestamp: DateTime<Utc>) -> DateTime<Utc> {
        let start = self.bucket_start(timestamp);
        match self {
            Timeframe::OneMonth => {
                let date = start.date_naive();
                let next = if date.month() == 12 {
                    date.with_year(date.year() + 1).and_then(|d| d.with_month(1))
                } else {
                    date.with_month(date.month() + 1)
                };
                next.map(|d| d.and_time(NaiveTime::MIN).and_utc())
                    .unwrap_or(start + self.duration())
            }
            _ => start + self.duration(),
        }
    }

    /// Parse a timeframe code
    pub fn parse(s: &str) -> Result<Self, DataError> {
        match s {
            "1m" => Ok(Timeframe::OneMinute),
            "5m" => Ok(Timeframe::FiveMinutes),
            "15m" => Ok(Timeframe::FifteenMinutes),
            "1h" => Ok(Timeframe::OneHour),
            "4h" => Ok(Timeframe::FourHours),
            "1d" => Ok(Timeframe::OneDay),
            "1w" => Ok(Timeframe::OneWeek),
            "1M" => Ok(Timeframe::OneMonth),
            other => Err(DataError::invalid_timeframe(other)),
        }
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Timeframe {
    type Err = DataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Timeframe::parse(s)
    }
}
