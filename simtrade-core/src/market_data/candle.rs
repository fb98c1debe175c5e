//! OHLCV candles and time-bucketed series

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;

use crate::errors::EngineError;
use crate::instruments::Symbol;

/// Candle bucket width.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CandleInterval {
    #[serde(rename = "1m")]
    OneMinute,
    #[serde(rename = "5m")]
    FiveMinutes,
    #[serde(rename = "15m")]
    FifteenMinutes,
    #[serde(rename = "1h")]
    OneHour,
}

impl CandleInterval {
    pub fn as_duration(&self) -> Duration {
        match self {
            CandleInterval::OneMinute => Duration::minutes(1),
            CandleInterval::FiveMinutes => Duration::minutes(5),
            CandleInterval::FifteenMinutes => Duration::minutes(15),
            CandleInterval::OneHour => Duration::hours(1),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CandleInterval::OneMinute => "1m",
            CandleInterval::FiveMinutes => "5m",
            CandleInterval::FifteenMinutes => "15m",
            CandleInterval::OneHour => "1h",
        }
    }

    pub fn parse(s: &str) -> Result<Self, EngineError> {
        match s {
            "1m" => Ok(CandleInterval::OneMinute),
            "5m" => Ok(CandleInterval::FiveMinutes),
            "15m" => Ok(CandleInterval::FifteenMinutes),
            "1h" => Ok(CandleInterval::OneHour),
            other => Err(EngineError::UnknownInterval(other.to_string())),
        }
    }

    /// Start of the bucket containing `ts`.
    pub fn bucket_start(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        let width = self.as_duration().num_milliseconds();
        let rem = ts.timestamp_millis().rem_euclid(width);
        ts - Duration::milliseconds(rem)
    }
}

impl fmt::Display for CandleInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One OHLCV bucket. Only the in-progress candle of a series mutates;
/// prior candles are frozen at rollover.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub symbol: Symbol,
    pub interval: CandleInterval,
    /// Bucket start time
    pub time: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: u64,
}

impl Candle {
    fn open_at(
        symbol: Symbol,
        interval: CandleInterval,
        time: DateTime<Utc>,
        open: Decimal,
    ) -> Self {
        Self {
            symbol,
            interval,
            time,
            open,
            high: open,
            low: open,
            close: open,
            volume: 0,
        }
    }

    fn apply(&mut self, price: Decimal, volume_delta: u64) {
        if price > self.high {
            self.high = price;
        }
        if price < self.low {
            self.low = price;
        }
        self.close = price;
        self.volume += volume_delta;
    }
}

/// Frozen history plus the mutable current candle for one interval.
#[derive(Clone, Debug)]
pub struct CandleSeries {
    symbol: Symbol,
    interval: CandleInterval,
    history: VecDeque<Candle>,
    current: Option<Candle>,
    history_limit: usize,
}

impl CandleSeries {
    pub fn new(symbol: Symbol, interval: CandleInterval, history_limit: usize) -> Self {
        Self {
            symbol,
            interval,
            history: VecDeque::new(),
            current: None,
            history_limit,
        }
    }

    pub fn interval(&self) -> CandleInterval {
        self.interval
    }

    /// Apply a tick. Returns the frozen candle when the tick crossed a
    /// bucket boundary; the new bucket opens at the previous close.
    pub fn update(
        &mut self,
        ts: DateTime<Utc>,
        price: Decimal,
        volume_delta: u64,
    ) -> Option<Candle> {
        let bucket = self.interval.bucket_start(ts);
        let mut frozen = None;

        match self.current.as_mut() {
            None => {
                self.current = Some(Candle::open_at(
                    self.symbol.clone(),
                    self.interval,
                    bucket,
                    price,
                ));
            }
            Some(candle) if candle.time != bucket => {
                let closed = candle.clone();
                self.history.push_back(closed.clone());
                if self.history.len() > self.history_limit {
                    self.history.pop_front();
                }
                self.current = Some(Candle::open_at(
                    self.symbol.clone(),
                    self.interval,
                    bucket,
                    closed.close,
                ));
                frozen = Some(closed);
            }
            Some(_) => {}
        }

        if let Some(candle) = self.current.as_mut() {
            candle.apply(price, volume_delta);
        }
        frozen
    }

    pub fn current(&self) -> Option<&Candle> {
        self.current.as_ref()
    }

    /// The most recent `count` frozen candles plus the in-progress candle.
    pub fn snapshot(&self, count: usize) -> Vec<Candle> {
        let start = self.history.len().saturating_sub(count);
        let mut out: Vec<Candle> = self.history.iter().skip(start).cloned().collect();
        if let Some(current) = &self.current {
            out.push(current.clone());
        }
        out
    }
}
