//! Per-book position accounting

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::instruments::{Instrument, Symbol};
use crate::orders::{AccountId, Side};

/// Net position for one `(account, symbol)` pair. Quantity is signed:
/// positive long, negative short.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub account_id: AccountId,
    pub symbol: Symbol,
    pub quantity: i64,
    pub avg_entry_price: Decimal,
    /// Realized P&L accumulated since the position was last flat; resets to
    /// zero when quantity returns to zero
    pub realized_pnl: Decimal,
}

impl Position {
    pub fn flat(account_id: AccountId, symbol: Symbol) -> Self {
        Self {
            account_id,
            symbol,
            quantity: 0,
            avg_entry_price: Decimal::ZERO,
            realized_pnl: Decimal::ZERO,
        }
    }

    pub fn is_flat(&self) -> bool {
        self.quantity == 0
    }

    pub fn side(&self) -> Option<Side> {
        if self.quantity > 0 {
            Some(Side::Buy)
        } else if self.quantity < 0 {
            Some(Side::Sell)
        } else {
            None
        }
    }

    /// Mark-to-market P&L at `price`. Reporting only; never persisted.
    pub fn unrealized_pnl(&self, price: Decimal, point_value: Decimal) -> Decimal {
        (price - self.avg_entry_price) * point_value * Decimal::from(self.quantity)
    }
}

/// Result of applying one fill to a position.
#[derive(Clone, Debug, PartialEq)]
pub struct FillOutcome {
    /// Realized P&L from the reduced portion; the book folds it into the
    /// account balance immediately
    pub realized_pnl: Decimal,
    pub closed_quantity: i64,
    /// True when the fill brought the position through zero (fully closed
    /// or flipped); triggers the bracket cancellation cascade
    pub position_closed: bool,
}

/// Applies fills to positions and prices their P&L in instrument terms.
pub struct PositionLedger {
    instrument: Instrument,
}

impl PositionLedger {
    pub fn new(instrument: Instrument) -> Self {
        Self { instrument }
    }

    /// Apply a fill of `quantity` contracts on `side` at `price`.
    pub fn apply_fill(
        &self,
        position: &mut Position,
        side: Side,
        quantity: i64,
        price: Decimal,
    ) -> FillOutcome {
        let signed = side.sign() * quantity;
        let old_quantity = position.quantity;
        let same_direction = old_quantity == 0 || old_quantity.signum() == signed.signum();

        if same_direction {
            let old_abs = Decimal::from(old_quantity.abs());
            let add = Decimal::from(quantity);
            position.avg_entry_price = if old_quantity == 0 {
                price
            } else {
                (position.avg_entry_price * old_abs + price * add) / (old_abs + add)
            };
            position.quantity += signed;
            return FillOutcome {
                realized_pnl: Decimal::ZERO,
                closed_quantity: 0,
                position_closed: false,
            };
        }

        // reducing or flipping: realize the closed portion
        let closed = old_quantity.abs().min(quantity);
        let direction = Decimal::from(old_quantity.signum());
        let realized = (price - position.avg_entry_price)
            * self.instrument.point_value
            * Decimal::from(closed)
            * direction;

        position.quantity += signed;
        position.realized_pnl += realized;

        if position.quantity == 0 {
            position.avg_entry_price = Decimal::ZERO;
            position.realized_pnl = Decimal::ZERO;
        } else if position.quantity.signum() != old_quantity.signum() {
            // flipped through flat: the remainder opens fresh at the fill price
            position.avg_entry_price = price;
            position.realized_pnl = Decimal::ZERO;
        }

        FillOutcome {
            realized_pnl: realized,
            closed_quantity: closed,
            position_closed: position.quantity == 0
                || position.quantity.signum() != old_quantity.signum(),
        }
    }

    /// Margin reserved by the current position.
    pub fn margin_required(&self, position: &Position) -> Decimal {
        Decimal::from(position.quantity.abs()) * self.instrument.margin_per_contract
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn ledger() -> PositionLedger {
        PositionLedger::new(Instrument::new("ES", dec!(0.25), dec!(50), dec!(12000)))
    }

    fn flat() -> Position {
        Position::flat("acct-1".to_string(), Symbol::new("ES"))
    }

    #[test]
    fn test_opening_fill_sets_entry() {
        let ledger = ledger();
        let mut position = flat();
        let outcome = ledger.apply_fill(&mut position, Side::Buy, 2, dec!(4500.00));
        assert_eq!(position.quantity, 2);
        assert_eq!(position.avg_entry_price, dec!(4500.00));
        assert_eq!(outcome.realized_pnl, Decimal::ZERO);
        assert!(!outcome.position_closed);
    }

    #[test]
    fn test_adding_averages_entry() {
        let ledger = ledger();
        let mut position = flat();
        ledger.apply_fill(&mut position, Side::Buy, 1, dec!(4500.00));
        ledger.apply_fill(&mut position, Side::Buy, 1, dec!(4510.00));
        assert_eq!(position.quantity, 2);
        assert_eq!(position.avg_entry_price, dec!(4505.00));
    }

    #[test]
    fn test_quantity_is_running_signed_sum() {
        let ledger = ledger();
        let mut position = flat();
        for (side, qty) in [(Side::Buy, 3), (Side::Sell, 1), (Side::Buy, 2), (Side::Sell, 4)] {
            let before = position.quantity;
            ledger.apply_fill(&mut position, side, qty, dec!(4500.00));
            assert_eq!(position.quantity, before + side.sign() * qty);
        }
        assert_eq!(position.quantity, 0);
    }

    #[test]
    fn test_reducing_realizes_pnl() {
        let ledger = ledger();
        let mut position = flat();
        ledger.apply_fill(&mut position, Side::Buy, 2, dec!(4500.00));
        let outcome = ledger.apply_fill(&mut position, Side::Sell, 1, dec!(4510.00));
        // 10 points * $50 * 1 contract
        assert_eq!(outcome.realized_pnl, dec!(500));
        assert_eq!(outcome.closed_quantity, 1);
        assert!(!outcome.position_closed);
        assert_eq!(position.quantity, 1);
        assert_eq!(position.avg_entry_price, dec!(4500.00));
        assert_eq!(position.realized_pnl, dec!(500));
    }

    #[test]
    fn test_full_close_resets_position() {
        let ledger = ledger();
        let mut position = flat();
        ledger.apply_fill(&mut position, Side::Buy, 1, dec!(4500.00));
        let outcome = ledger.apply_fill(&mut position, Side::Sell, 1, dec!(4510.00));
        assert_eq!(outcome.realized_pnl, dec!(500));
        assert!(outcome.position_closed);
        assert!(position.is_flat());
        assert_eq!(position.avg_entry_price, Decimal::ZERO);
        assert_eq!(position.realized_pnl, Decimal::ZERO);
    }

    #[test]
    fn test_short_position_pnl_sign() {
        let ledger = ledger();
        let mut position = flat();
        ledger.apply_fill(&mut position, Side::Sell, 1, dec!(4500.00));
        assert_eq!(position.side(), Some(Side::Sell));
        // price fell: short profits
        let outcome = ledger.apply_fill(&mut position, Side::Buy, 1, dec!(4490.00));
        assert_eq!(outcome.realized_pnl, dec!(500));
    }

    #[test]
    fn test_flip_opens_remainder_at_fill_price() {
        let ledger = ledger();
        let mut position = flat();
        ledger.apply_fill(&mut position, Side::Buy, 1, dec!(4500.00));
        let outcome = ledger.apply_fill(&mut position, Side::Sell, 3, dec!(4504.00));
        assert_eq!(outcome.realized_pnl, dec!(200));
        assert_eq!(outcome.closed_quantity, 1);
        assert!(outcome.position_closed);
        assert_eq!(position.quantity, -2);
        assert_eq!(position.avg_entry_price, dec!(4504.00));
        assert_eq!(position.realized_pnl, Decimal::ZERO);
    }

    #[test]
    fn test_unrealized_pnl_marks_to_market() {
        let mut position = flat();
        let ledger = ledger();
        ledger.apply_fill(&mut position, Side::Buy, 2, dec!(4500.00));
        assert_eq!(position.unrealized_pnl(dec!(4505.00), dec!(50)), dec!(500));
        assert_eq!(position.unrealized_pnl(dec!(4495.00), dec!(50)), dec!(-500));
    }

    #[test]
    fn test_margin_required_scales_with_size() {
        let ledger = ledger();
        let mut position = flat();
        ledger.apply_fill(&mut position, Side::Sell, 3, dec!(4500.00));
        assert_eq!(ledger.margin_required(&position), dec!(36000));
    }
}
