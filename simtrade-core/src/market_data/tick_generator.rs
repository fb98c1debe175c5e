//! Per-instrument synthetic price stream
//!
//! Each instrument gets its own generator instance with an explicit clock
//! and seed, so independent engines (and tests) run in isolation. The walk
//! moves in whole ticks, which keeps every emitted price on the instrument
//! grid.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::prelude::*;
use rand_chacha::ChaCha8Rng;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use super::candle::{Candle, CandleInterval, CandleSeries};
use crate::errors::EngineError;
use crate::instruments::Instrument;

/// A single tick: the new scalar price, the synthetic quote derived from
/// it, and a snapshot of the in-progress base-interval candle.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PriceTick {
    pub symbol: crate::instruments::Symbol,
    pub timestamp: DateTime<Utc>,
    pub price: Decimal,
    /// price - one tick
    pub bid: Decimal,
    /// price + one tick
    pub ask: Decimal,
    pub candle: Candle,
}

/// Generator configuration. Defaults suit an index-future style contract.
#[derive(Clone, Debug)]
pub struct TickGeneratorConfig {
    pub start_price: Decimal,
    /// Maximum walk distance per tick, in whole instrument ticks
    pub max_step_ticks: i64,
    /// Inclusive range for per-tick volume
    pub volume_range: (u64, u64),
    pub seed: u64,
    /// Candle series maintained per generator; the first entry is the base
    /// interval reported on every tick
    pub intervals: Vec<CandleInterval>,
    pub history_limit: usize,
}

impl Default for TickGeneratorConfig {
    fn default() -> Self {
        Self {
            start_price: Decimal::from(4500),
            max_step_ticks: 4,
            volume_range: (1, 25),
            seed: 7,
            intervals: vec![
                CandleInterval::OneMinute,
                CandleInterval::FiveMinutes,
                CandleInterval::FifteenMinutes,
            ],
            history_limit: 500,
        }
    }
}

struct GeneratorState {
    rng: ChaCha8Rng,
    last_price: Decimal,
    series: Vec<CandleSeries>,
}

/// Synthetic price service for one instrument.
pub struct TickGenerator {
    instrument: Instrument,
    config: TickGeneratorConfig,
    state: Mutex<GeneratorState>,
    events: broadcast::Sender<PriceTick>,
}

impl TickGenerator {
    pub fn new(instrument: Instrument, config: TickGeneratorConfig) -> Result<Self, EngineError> {
        if config.start_price <= Decimal::ZERO {
            return Err(EngineError::InvalidPrice {
                price: config.start_price,
                reason: "start price must be positive".to_string(),
            });
        }
        if config.intervals.is_empty() {
            return Err(EngineError::UnknownInterval("<none configured>".to_string()));
        }
        let start_price = instrument.round_price(config.start_price);
        let series = config
            .intervals
            .iter()
            .map(|interval| {
                CandleSeries::new(instrument.symbol.clone(), *interval, config.history_limit)
            })
            .collect();
        let (events, _) = broadcast::channel(1024);

        Ok(Self {
            state: Mutex::new(GeneratorState {
                rng: ChaCha8Rng::seed_from_u64(config.seed),
                last_price: start_price,
                series,
            }),
            instrument,
            config,
            events,
        })
    }

    /// Walk the price one step and fold the tick into every candle series.
    pub fn advance(&self, now: DateTime<Utc>) -> PriceTick {
        let (next, volume) = {
            let mut state = self.state.lock();
            let max = self.config.max_step_ticks;
            let step: i64 = state.rng.gen_range(-max..=max);
            let (lo, hi) = self.config.volume_range;
            let volume = state.rng.gen_range(lo..=hi);
            let mut next = state.last_price + Decimal::from(step) * self.instrument.tick_size;
            // keep the walk strictly positive
            if next < self.instrument.tick_size {
                next = self.instrument.tick_size;
            }
            (next, volume)
        };
        self.apply(next, volume, now)
    }

    /// Record an externally chosen price (deterministic tests, replays,
    /// book priming). Drives the exact same candle/broadcast path as
    /// `advance` but contributes no synthetic volume.
    pub fn observe(&self, price: Decimal, now: DateTime<Utc>) -> PriceTick {
        let rounded = self.instrument.round_price(price);
        self.apply(rounded, 0, now)
    }

    fn apply(&self, price: Decimal, volume: u64, now: DateTime<Utc>) -> PriceTick {
        let mut state = self.state.lock();
        state.last_price = price;
        for series in state.series.iter_mut() {
            series.update(now, price, volume);
        }
        // base-interval candle snapshot; update() always opens a current
        // bucket, the fallback only guards a fresh series
        let base_interval = state.series[0].interval();
        let candle = state.series[0].current().cloned().unwrap_or(Candle {
            symbol: self.instrument.symbol.clone(),
            interval: base_interval,
            time: base_interval.bucket_start(now),
            open: price,
            high: price,
            low: price,
            close: price,
            volume,
        });
        drop(state);

        let tick = PriceTick {
            symbol: self.instrument.symbol.clone(),
            timestamp: now,
            price,
            bid: price - self.instrument.tick_size,
            ask: price + self.instrument.tick_size,
            candle,
        };
        // no receivers is fine; fan-out is best effort
        let _ = self.events.send(tick.clone());
        tick
    }

    pub fn last_price(&self) -> Decimal {
        self.state.lock().last_price
    }

    /// Historical candles plus the in-progress one for a configured interval.
    pub fn candles(&self, interval: CandleInterval, count: usize) -> Result<Vec<Candle>, EngineError> {
        let state = self.state.lock();
        state
            .series
            .iter()
            .find(|s| s.interval() == interval)
            .map(|s| s.snapshot(count))
            .ok_or_else(|| EngineError::UnknownInterval(interval.to_string()))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PriceTick> {
        self.events.subscribe()
    }

    pub fn instrument(&self) -> &Instrument {
        &self.instrument
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn es() -> Instrument {
        Instrument::new("ES", dec!(0.25), dec!(50), dec!(12000))
    }

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn test_same_seed_same_stream() {
        let a = TickGenerator::new(es(), TickGeneratorConfig::default()).unwrap();
        let b = TickGenerator::new(es(), TickGeneratorConfig::default()).unwrap();
        for i in 0..50 {
            let ta = a.advance(ts(i));
            let tb = b.advance(ts(i));
            assert_eq!(ta.price, tb.price);
        }
    }

    #[test]
    fn test_prices_stay_on_tick_grid() {
        let generator = TickGenerator::new(es(), TickGeneratorConfig::default()).unwrap();
        let inst = es();
        for i in 0..200 {
            let tick = generator.advance(ts(i));
            assert_eq!(inst.round_price(tick.price), tick.price);
            assert!(tick.price > Decimal::ZERO);
        }
    }

    #[test]
    fn test_quote_straddles_price() {
        let generator = TickGenerator::new(es(), TickGeneratorConfig::default()).unwrap();
        let tick = generator.advance(ts(0));
        assert_eq!(tick.bid, tick.price - dec!(0.25));
        assert_eq!(tick.ask, tick.price + dec!(0.25));
    }

    #[test]
    fn test_candle_history_accumulates() {
        let generator = TickGenerator::new(es(), TickGeneratorConfig::default()).unwrap();
        for i in 0..180 {
            generator.advance(ts(i));
        }
        // 3 minutes of one-second ticks: two frozen 1m candles + current
        let candles = generator.candles(CandleInterval::OneMinute, 10).unwrap();
        assert_eq!(candles.len(), 3);
        // each bucket opens at the previous close
        assert_eq!(candles[1].open, candles[0].close);
        assert_eq!(candles[2].open, candles[1].close);
    }

    #[test]
    fn test_observe_rounds_to_grid() {
        let generator = TickGenerator::new(es(), TickGeneratorConfig::default()).unwrap();
        let tick = generator.observe(dec!(4500.30), ts(0));
        assert_eq!(tick.price, dec!(4500.25));
        assert_eq!(generator.last_price(), dec!(4500.25));
    }

    #[test]
    fn test_unknown_interval_rejected() {
        let mut config = TickGeneratorConfig::default();
        config.intervals = vec![CandleInterval::OneMinute];
        let generator = TickGenerator::new(es(), config).unwrap();
        generator.advance(ts(0));
        assert!(matches!(
            generator.candles(CandleInterval::OneHour, 5),
            Err(EngineError::UnknownInterval(_))
        ));
    }
}
