//! Instrument definitions and tick-size arithmetic

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::errors::EngineError;

/// Trading symbol
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Symbol(pub String);

impl Symbol {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Static per-instrument configuration. Immutable at runtime.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Instrument {
    pub symbol: Symbol,
    /// Minimum price increment (0.25 for index futures, 0.01 for crude, ...)
    pub tick_size: Decimal,
    /// Dollar value of one full point of price movement per contract
    pub point_value: Decimal,
    /// Margin reserved per open contract
    pub margin_per_contract: Decimal,
}

impl Instrument {
    pub fn new(
        symbol: impl Into<String>,
        tick_size: Decimal,
        point_value: Decimal,
        margin_per_contract: Decimal,
    ) -> Self {
        Self {
            symbol: Symbol::new(symbol),
            tick_size,
            point_value,
            margin_per_contract,
        }
    }

    /// Round a price to the instrument grid, half-up.
    ///
    /// Idempotent: a price already on the grid maps to itself, so
    /// `round_price(round_price(x)) == round_price(x)`.
    pub fn round_price(&self, price: Decimal) -> Decimal {
        let ticks = (price / self.tick_size)
            .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero);
        (ticks * self.tick_size).normalize()
    }
}

/// Registry of configured instruments, shared read-only across the engine.
#[derive(Clone, Debug, Default)]
pub struct InstrumentRegistry {
    instruments: HashMap<Symbol, Instrument>,
}

impl InstrumentRegistry {
    pub fn new(instruments: impl IntoIterator<Item = Instrument>) -> Self {
        Self {
            instruments: instruments
                .into_iter()
                .map(|i| (i.symbol.clone(), i))
                .collect(),
        }
    }

    pub fn get(&self, symbol: &Symbol) -> Option<&Instrument> {
        self.instruments.get(symbol)
    }

    pub fn require(&self, symbol: &Symbol) -> Result<&Instrument, EngineError> {
        self.get(symbol)
            .ok_or_else(|| EngineError::UnknownInstrument(symbol.to_string()))
    }

    pub fn symbols(&self) -> impl Iterator<Item = &Symbol> {
        self.instruments.keys()
    }

    pub fn len(&self) -> usize {
        self.instruments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instruments.is_empty()
    }
}
