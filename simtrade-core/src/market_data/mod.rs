//! Synthetic market data: candles and the per-instrument tick generator

pub mod candle;
pub mod tick_generator;

pub use candle::{Candle, CandleInterval, CandleSeries};
pub use tick_generator::{PriceTick, TickGenerator, TickGeneratorConfig};
