//! Derived take-profit / stop-loss linkage
//!
//! Brackets are never stored as back-pointers. An order protects a position
//! exactly when it rests on the opposite side of that position for the same
//! account/symbol in a cancellable state, and the linked set is recomputed
//! from the working book whenever it is needed.

use std::collections::HashMap;

use crate::errors::EngineError;
use crate::orders::{Order, OrderId, OrderParams, Side};

use super::ledger::Position;

pub struct BracketManager;

impl BracketManager {
    /// Orders linked to a position held on `position_side`, FIFO by
    /// submission sequence.
    pub fn linked_order_ids(
        position_side: Side,
        working: &HashMap<OrderId, Order>,
    ) -> Vec<OrderId> {
        let mut linked: Vec<(u64, OrderId)> = working
            .values()
            .filter(|o| o.side == position_side.opposite() && o.status.is_cancellable())
            .map(|o| (o.seq, o.id.clone()))
            .collect();
        linked.sort();
        linked.into_iter().map(|(_, id)| id).collect()
    }

    /// Direction validation for protective orders. A take-profit must
    /// improve on the average entry and a stop-loss must sit on the losing
    /// side, strictly; trailing stops are exempt because their trigger is
    /// derived from the price path.
    pub fn validate_protective(
        position: &Position,
        side: Side,
        params: &OrderParams,
    ) -> Result<(), EngineError> {
        let Some(position_side) = position.side() else {
            return Ok(());
        };
        if side != position_side.opposite() {
            return Ok(());
        }
        let entry = position.avg_entry_price;

        match params {
            OrderParams::Limit { price } => match position_side {
                Side::Buy if *price <= entry => Err(EngineError::conflict(format!(
                    "take-profit {price} must be strictly above average entry {entry} for a long position"
                ))),
                Side::Sell if *price >= entry => Err(EngineError::conflict(format!(
                    "take-profit {price} must be strictly below average entry {entry} for a short position"
                ))),
                _ => Ok(()),
            },
            OrderParams::Stop { stop } | OrderParams::StopLimit { stop, .. } => {
                match position_side {
                    Side::Buy if *stop >= entry => Err(EngineError::conflict(format!(
                        "stop-loss {stop} must be strictly below average entry {entry} for a long position"
                    ))),
                    Side::Sell if *stop <= entry => Err(EngineError::conflict(format!(
                        "stop-loss {stop} must be strictly above average entry {entry} for a short position"
                    ))),
                    _ => Ok(()),
                }
            }
            OrderParams::Market | OrderParams::TrailingStop { .. } => Ok(()),
        }
    }
}
