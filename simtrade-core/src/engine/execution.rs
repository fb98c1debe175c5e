//! Fill pricing rules
//!
//! The simulated market quotes one tick either side of the scalar price.
//! Market orders pay the spread; limit orders fill at their resting price
//! exactly (price improvement is not modeled). There is no order-book
//! depth, so a fill always covers the order's remaining quantity.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::instruments::Instrument;
use crate::orders::{Order, OrderParams, Side};

/// Synthetic top of book derived from the scalar price.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Quote {
    pub bid: Decimal,
    pub ask: Decimal,
}

/// A priced execution against an order's remaining quantity.
#[derive(Clone, Debug, PartialEq)]
pub struct Fill {
    pub quantity: i64,
    pub price: Decimal,
    pub timestamp: DateTime<Utc>,
}

/// Computes fill prices for eligible orders.
pub struct ExecutionEngine {
    instrument: Instrument,
}

impl ExecutionEngine {
    pub fn new(instrument: Instrument) -> Self {
        Self { instrument }
    }

    pub fn quote(&self, price: Decimal) -> Quote {
        Quote {
            bid: price - self.instrument.tick_size,
            ask: price + self.instrument.tick_size,
        }
    }

    /// Market buys lift the ask, market sells hit the bid.
    pub fn market_price(&self, side: Side, quote: &Quote) -> Decimal {
        let raw = match side {
            Side::Buy => quote.ask,
            Side::Sell => quote.bid,
        };
        self.instrument.round_price(raw)
    }

    /// Whether the synthetic quote reaches-or-betters a limit price.
    pub fn limit_crossed(&self, side: Side, limit: Decimal, quote: &Quote) -> bool {
        match side {
            Side::Buy => quote.ask <= limit,
            Side::Sell => quote.bid >= limit,
        }
    }

    /// Immediate execution decision for a just-submitted order. Market
    /// orders always fill; limit orders fill only if already marketable.
    pub fn immediate_fill(&self, order: &Order, quote: &Quote, at: DateTime<Utc>) -> Option<Fill> {
        match order.params {
            OrderParams::Market => Some(Fill {
                quantity: order.remaining(),
                price: self.market_price(order.side, quote),
                timestamp: at,
            }),
            OrderParams::Limit { price } if self.limit_crossed(order.side, price, quote) => {
                Some(Fill {
                    quantity: order.remaining(),
                    price,
                    timestamp: at,
                })
            }
            _ => None,
        }
    }

    /// Tick-driven evaluation of a resting order. Applies to limit orders
    /// and to stop-limits that have already triggered into resting limits.
    pub fn resting_fill(&self, order: &Order, quote: &Quote, at: DateTime<Utc>) -> Option<Fill> {
        let limit = match order.params {
            OrderParams::Limit { price } => price,
            OrderParams::StopLimit { limit, .. } if order.triggered_at.is_some() => limit,
            _ => return None,
        };
        if self.limit_crossed(order.side, limit, quote) {
            Some(Fill {
                quantity: order.remaining(),
                price: limit,
                timestamp: at,
            })
        } else {
            None
        }
    }
}
