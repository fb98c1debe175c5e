//! Conditional-order trigger evaluation

use rust_decimal::Decimal;
use std::collections::HashMap;

use crate::instruments::Instrument;
use crate::orders::{Order, OrderId, OrderParams, Side};

/// Scans working conditional orders against each tick.
pub struct TriggerEvaluator {
    instrument: Instrument,
}

impl TriggerEvaluator {
    pub fn new(instrument: Instrument) -> Self {
        Self { instrument }
    }

    /// Ratchet trailing stops against the new price, then return the ids of
    /// every conditional order whose trigger fires, FIFO by submission
    /// sequence so same-tick fills stay deterministic.
    pub fn evaluate(&self, working: &mut HashMap<OrderId, Order>, price: Decimal) -> Vec<OrderId> {
        for order in working.values_mut() {
            self.ratchet(order, price);
        }

        let mut hits: Vec<(u64, OrderId)> = working
            .values()
            .filter(|o| {
                o.params.is_conditional() && o.triggered_at.is_none() && Self::fires(o, price)
            })
            .map(|o| (o.seq, o.id.clone()))
            .collect();
        hits.sort();
        hits.into_iter().map(|(_, id)| id).collect()
    }

    /// Anchor or advance a trailing stop. A sell trailing stop (protecting
    /// a long) only ever moves up; a buy trailing stop only ever moves
    /// down.
    pub fn ratchet(&self, order: &mut Order, price: Decimal) {
        let OrderParams::TrailingStop { trail } = order.params else {
            return;
        };
        if order.triggered_at.is_some() {
            return;
        }
        let candidate = self.instrument.round_price(match order.side {
            Side::Sell => price - trail,
            Side::Buy => price + trail,
        });
        order.current_stop = Some(match order.current_stop {
            Some(stop) => match order.side {
                Side::Sell => stop.max(candidate),
                Side::Buy => stop.min(candidate),
            },
            None => candidate,
        });
    }

    /// Buy stops trigger at or above the stop; sell stops at or below.
    fn fires(order: &Order, price: Decimal) -> bool {
        let Some(stop) = order.current_stop else {
            return false;
        };
        match order.side {
            Side::Buy => price >= stop,
            Side::Sell => price <= stop,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruments::Symbol;
    use crate::orders::{OrderStatus, TimeInForce};
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn evaluator() -> TriggerEvaluator {
        TriggerEvaluator::new(Instrument::new("ES", dec!(0.25), dec!(50), dec!(12000)))
    }

    fn working_order(seq: u64, side: Side, params: OrderParams) -> Order {
        let mut order = Order::new(
            None,
            "acct-1".to_string(),
            Symbol::new("ES"),
            side,
            params,
            1,
            TimeInForce::Gtc,
            seq,
        )
        .unwrap();
        order.status = OrderStatus::Working;
        order
    }

    fn book_of(orders: Vec<Order>) -> HashMap<OrderId, Order> {
        orders.into_iter().map(|o| (o.id.clone(), o)).collect()
    }

    #[test]
    fn test_buy_stop_triggers_at_or_above_stop() {
        let evaluator = evaluator();
        let order = working_order(1, Side::Buy, OrderParams::Stop { stop: dec!(4510.00) });
        let mut book = book_of(vec![order]);

        assert!(evaluator.evaluate(&mut book, dec!(4509.75)).is_empty());
        assert_eq!(evaluator.evaluate(&mut book, dec!(4510.00)).len(), 1);
    }

    #[test]
    fn test_sell_stop_triggers_at_or_below_stop() {
        let evaluator = evaluator();
        let order = working_order(1, Side::Sell, OrderParams::Stop { stop: dec!(4490.00) });
        let mut book = book_of(vec![order]);

        assert!(evaluator.evaluate(&mut book, dec!(4490.25)).is_empty());
        assert_eq!(evaluator.evaluate(&mut book, dec!(4489.75)).len(), 1);
    }

    #[test]
    fn test_same_tick_triggers_are_fifo() {
        let evaluator = evaluator();
        let first = working_order(1, Side::Sell, OrderParams::Stop { stop: dec!(4495.00) });
        let second = working_order(2, Side::Sell, OrderParams::Stop { stop: dec!(4496.00) });
        let first_id = first.id.clone();
        let second_id = second.id.clone();
        let mut book = book_of(vec![second, first]);

        let hits = evaluator.evaluate(&mut book, dec!(4490.00));
        assert_eq!(hits, vec![first_id, second_id]);
    }

    #[test]
    fn test_trailing_stop_ratchets_monotonically() {
        let evaluator = evaluator();
        let mut order = working_order(
            1,
            Side::Sell,
            OrderParams::TrailingStop { trail: dec!(5.00) },
        );

        evaluator.ratchet(&mut order, dec!(4500.00));
        assert_eq!(order.current_stop, Some(dec!(4495.00)));

        // price advances: stop follows
        evaluator.ratchet(&mut order, dec!(4508.00));
        assert_eq!(order.current_stop, Some(dec!(4503.00)));

        // price retreats: stop holds
        evaluator.ratchet(&mut order, dec!(4501.00));
        assert_eq!(order.current_stop, Some(dec!(4503.00)));
    }

    #[test]
    fn test_trailing_stop_triggers_after_pullback() {
        let evaluator = evaluator();
        let order = working_order(
            1,
            Side::Sell,
            OrderParams::TrailingStop { trail: dec!(5.00) },
        );
        let mut book = book_of(vec![order]);

        assert!(evaluator.evaluate(&mut book, dec!(4500.00)).is_empty());
        assert!(evaluator.evaluate(&mut book, dec!(4510.00)).is_empty());
        // high water 4510 puts the stop at 4505; this tick crosses it
        let hits = evaluator.evaluate(&mut book, dec!(4504.75));
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn test_buy_trailing_stop_mirrors() {
        let evaluator = evaluator();
        let mut order = working_order(
            1,
            Side::Buy,
            OrderParams::TrailingStop { trail: dec!(5.00) },
        );

        evaluator.ratchet(&mut order, dec!(4500.00));
        assert_eq!(order.current_stop, Some(dec!(4505.00)));
        evaluator.ratchet(&mut order, dec!(4492.00));
        assert_eq!(order.current_stop, Some(dec!(4497.00)));
        evaluator.ratchet(&mut order, dec!(4498.00));
        assert_eq!(order.current_stop, Some(dec!(4497.00)));
    }

    #[test]
    fn test_triggered_orders_do_not_retrigger() {
        let evaluator = evaluator();
        let mut order = working_order(1, Side::Buy, OrderParams::Stop { stop: dec!(4510.00) });
        order.mark_triggered(Utc::now());
        let mut book = book_of(vec![order]);
        assert!(evaluator.evaluate(&mut book, dec!(4520.00)).is_empty());
    }
}
