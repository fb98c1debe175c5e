//! Single-writer book actor
//!
//! Every `(account, symbol)` pair is owned by one actor task. Tick-driven
//! trigger evaluation and client commands arrive as messages on one channel
//! and are processed strictly in arrival order, which is what makes a
//! cancel atomic relative to a concurrent fill: there is no moment where a
//! triggered order is visible in an intermediate state.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::errors::EngineError;
use crate::instruments::Instrument;
use crate::market_data::PriceTick;
use crate::orders::{
    Order, OrderId, OrderParams, OrderRequest, OrderStatus, OrderType, OrderUpdate, Side,
    TimeInForce,
};
use crate::store::{AccountStore, OrderStore};

use super::bracket::BracketManager;
use super::execution::{ExecutionEngine, Fill};
use super::ledger::{FillOutcome, Position, PositionLedger};
use super::trigger::TriggerEvaluator;

/// Result of an explicit position close.
#[derive(Clone, Debug, Serialize)]
pub struct CloseReport {
    pub closing_order_id: OrderId,
    /// Bracket orders cancelled as a side effect
    pub cancelled_orders: usize,
}

/// Read-only view of one book, served from inside the actor.
#[derive(Clone, Debug)]
pub struct BookView {
    pub position: Position,
    pub working: Vec<Order>,
    pub last_price: Option<Decimal>,
}

pub(crate) enum BookCommand {
    Tick(PriceTick),
    SessionClose,
    Submit {
        request: OrderRequest,
        reply: oneshot::Sender<Result<OrderId, EngineError>>,
    },
    Cancel {
        order_id: OrderId,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    Update {
        update: OrderUpdate,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    ClosePosition {
        reply: oneshot::Sender<Result<CloseReport, EngineError>>,
    },
    Snapshot {
        reply: oneshot::Sender<BookView>,
    },
}

pub(crate) struct AccountBook {
    account_id: String,
    instrument: Instrument,
    order_store: Arc<dyn OrderStore>,
    account_store: Arc<dyn AccountStore>,
    trigger: TriggerEvaluator,
    execution: ExecutionEngine,
    ledger: PositionLedger,
    working: HashMap<OrderId, Order>,
    position: Position,
    last_tick: Option<PriceTick>,
    next_seq: u64,
}

impl AccountBook {
    pub(crate) fn spawn(
        account_id: String,
        instrument: Instrument,
        order_store: Arc<dyn OrderStore>,
        account_store: Arc<dyn AccountStore>,
    ) -> mpsc::UnboundedSender<BookCommand> {
        let (tx, rx) = mpsc::unbounded_channel();
        let book = Self {
            position: Position::flat(account_id.clone(), instrument.symbol.clone()),
            trigger: TriggerEvaluator::new(instrument.clone()),
            execution: ExecutionEngine::new(instrument.clone()),
            ledger: PositionLedger::new(instrument.clone()),
            account_id,
            instrument,
            order_store,
            account_store,
            working: HashMap::new(),
            last_tick: None,
            next_seq: 1,
        };
        tokio::spawn(book.run(rx));
        tx
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<BookCommand>) {
        while let Some(command) = rx.recv().await {
            match command {
                BookCommand::Tick(tick) => self.on_tick(tick).await,
                BookCommand::SessionClose => self.on_session_close().await,
                BookCommand::Submit { request, reply } => {
                    let _ = reply.send(self.on_submit(request).await);
                }
                BookCommand::Cancel { order_id, reply } => {
                    let _ = reply.send(self.on_cancel(&order_id).await);
                }
                BookCommand::Update { update, reply } => {
                    let _ = reply.send(self.on_update(update).await);
                }
                BookCommand::ClosePosition { reply } => {
                    let _ = reply.send(self.on_close_position().await);
                }
                BookCommand::Snapshot { reply } => {
                    let _ = reply.send(self.view());
                }
            }
        }
    }

    // === Tick-driven path ===

    async fn on_tick(&mut self, tick: PriceTick) {
        let at = tick.timestamp;
        let quote = self.execution.quote(tick.price);
        let price = tick.price;
        self.last_tick = Some(tick);

        // conditional orders first: ratchet trailing stops, then fire FIFO
        let triggered = self.trigger.evaluate(&mut self.working, price);
        for order_id in triggered {
            if let Err(err) = self.execute_triggered(&order_id, at).await {
                error!(order_id = %order_id, error = %err, "triggered order execution failed");
            }
        }

        // resting limits, including stop-limits that just converted
        let mut resting: Vec<(u64, OrderId)> = self
            .working
            .values()
            .filter(|o| self.execution.resting_fill(o, &quote, at).is_some())
            .map(|o| (o.seq, o.id.clone()))
            .collect();
        resting.sort();
        for (_, order_id) in resting {
            // a cascade from an earlier fill may have removed this order
            let fill = match self.working.get(&order_id) {
                Some(order) => self.execution.resting_fill(order, &quote, at),
                None => None,
            };
            if let Some(fill) = fill {
                if let Err(err) = self.settle_fill(&order_id, fill).await {
                    error!(order_id = %order_id, error = %err, "resting order fill failed");
                }
            }
        }
    }

    async fn execute_triggered(
        &mut self,
        order_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        let quote = match &self.last_tick {
            Some(tick) => self.execution.quote(tick.price),
            None => return Ok(()),
        };
        let (params, side, remaining) = match self.working.get_mut(order_id) {
            Some(order) => {
                order.mark_triggered(at);
                (order.params, order.side, order.remaining())
            }
            None => return Ok(()),
        };

        match params {
            OrderParams::Stop { .. } | OrderParams::TrailingStop { .. } => {
                let fill = Fill {
                    quantity: remaining,
                    price: self.execution.market_price(side, &quote),
                    timestamp: at,
                };
                self.settle_fill(order_id, fill).await
            }
            OrderParams::StopLimit { limit, .. } => {
                // now a resting limit; persist the conversion, then see if
                // the quote already crosses it
                if let Some(order) = self.working.get(order_id) {
                    self.order_store.save_order(order).await?;
                }
                if self.execution.limit_crossed(side, limit, &quote) {
                    self.settle_fill(
                        order_id,
                        Fill {
                            quantity: remaining,
                            price: limit,
                            timestamp: at,
                        },
                    )
                    .await
                } else {
                    debug!(order_id = %order_id, limit = %limit, "stop-limit triggered, resting at limit");
                    Ok(())
                }
            }
            OrderParams::Market | OrderParams::Limit { .. } => Ok(()),
        }
    }

    /// Apply a fill: mutate scratch copies, persist, then commit in-memory
    /// state. A store failure leaves the book exactly as it was.
    async fn settle_fill(&mut self, order_id: &str, fill: Fill) -> Result<(), EngineError> {
        let order = self
            .working
            .get(order_id)
            .ok_or_else(|| EngineError::OrderNotFound(order_id.to_string()))?;

        let mut updated = order.clone();
        updated.apply_fill(fill.quantity, fill.price)?;

        let prior_side = self.position.side();
        let mut position = self.position.clone();
        let outcome = self
            .ledger
            .apply_fill(&mut position, updated.side, fill.quantity, fill.price);

        self.persist_fill(&updated, &position, &outcome).await?;

        if updated.is_terminal() {
            self.working.remove(order_id);
        } else {
            self.working.insert(order_id.to_string(), updated.clone());
        }
        self.position = position;
        info!(
            order = %updated,
            price = %fill.price,
            realized = %outcome.realized_pnl,
            "fill applied"
        );

        if outcome.position_closed {
            if let Some(side) = prior_side {
                let cancelled = self.cascade_cancel(side).await;
                if cancelled > 0 {
                    info!(count = cancelled, "bracket orders cancelled on position close");
                }
            }
        }
        Ok(())
    }

    async fn persist_fill(
        &self,
        order: &Order,
        position: &Position,
        outcome: &FillOutcome,
    ) -> Result<(), EngineError> {
        self.order_store.save_order(order).await?;
        if outcome.realized_pnl != Decimal::ZERO {
            self.account_store
                .apply_balance_delta(&self.account_id, outcome.realized_pnl)
                .await?;
        }
        self.account_store
            .set_margin_used(&self.account_id, self.ledger.margin_required(position))
            .await?;
        if order.is_terminal() {
            self.order_store.archive_order(order).await?;
        }
        Ok(())
    }

    /// Cancel every order protecting a position that was held on
    /// `position_side`. Returns the number cancelled.
    async fn cascade_cancel(&mut self, position_side: Side) -> usize {
        let linked = BracketManager::linked_order_ids(position_side, &self.working);
        let mut cancelled = 0;
        for order_id in linked {
            match self.cancel_working(&order_id).await {
                Ok(()) => cancelled += 1,
                Err(err) => {
                    error!(order_id = %order_id, error = %err, "bracket cancellation failed")
                }
            }
        }
        cancelled
    }

    async fn cancel_working(&mut self, order_id: &str) -> Result<(), EngineError> {
        let order = self
            .working
            .get(order_id)
            .ok_or_else(|| EngineError::OrderNotFound(order_id.to_string()))?;
        let previous = order.status;
        let mut updated = order.clone();
        updated.cancel()?;

        // CAS guards against another engine instance racing the same store
        let swapped = self
            .order_store
            .compare_and_swap_status(order_id, previous, OrderStatus::Cancelled)
            .await?;
        if !swapped {
            return Err(EngineError::conflict(format!(
                "order {order_id} changed state during cancellation"
            )));
        }
        self.order_store.archive_order(&updated).await?;
        self.working.remove(order_id);
        debug!(order_id = %order_id, "order cancelled");
        Ok(())
    }

    // === Client command path ===

    async fn on_submit(&mut self, request: OrderRequest) -> Result<OrderId, EngineError> {
        // idempotent replay of a client-supplied id
        if let Some(client_id) = &request.client_order_id {
            if let Some(existing) = self.order_store.load_order(client_id).await? {
                if existing.account_id == self.account_id {
                    return Ok(existing.id);
                }
                return Err(EngineError::conflict(format!(
                    "order id {client_id} belongs to another account"
                )));
            }
        }

        let params = request.params()?.rounded(&self.instrument);
        if params.is_conditional() && request.time_in_force.is_immediate() {
            return Err(EngineError::InvalidRequest {
                reason: format!(
                    "{} time-in-force cannot be combined with a {} order",
                    request.time_in_force,
                    params.order_type()
                ),
            });
        }

        BracketManager::validate_protective(&self.position, request.side, &params)?;

        let mut order = Order::new(
            request.client_order_id.clone(),
            self.account_id.clone(),
            self.instrument.symbol.clone(),
            request.side,
            params,
            request.quantity,
            request.time_in_force,
            self.next_seq,
        )?;
        self.next_seq += 1;

        if self.increases_exposure(order.side, order.quantity) {
            let account = self
                .account_store
                .load_account(&self.account_id)
                .await?
                .ok_or_else(|| EngineError::UnknownAccount(self.account_id.clone()))?;
            let required = Decimal::from(order.quantity) * self.instrument.margin_per_contract;
            if account.margin_used + required > account.balance {
                return Err(EngineError::InsufficientMargin {
                    required,
                    available: account.margin_available(),
                });
            }
        }

        order.transition_to(OrderStatus::Submitted)?;

        // trailing stops anchor to the live price at submission
        if matches!(order.params, OrderParams::TrailingStop { .. }) {
            let price = self
                .last_tick
                .as_ref()
                .map(|t| t.price)
                .ok_or_else(|| {
                    EngineError::conflict("no market price available to anchor trailing stop")
                })?;
            self.trigger.ratchet(&mut order, price);
        }

        let immediate =
            matches!(order.params, OrderParams::Market) || order.time_in_force.is_immediate();
        if immediate {
            return self.submit_immediate(order).await;
        }

        order.transition_to(OrderStatus::Working)?;
        self.order_store.save_order(&order).await?;
        let order_id = order.id.clone();
        debug!(order = %order, "order resting");
        self.working.insert(order_id.clone(), order);

        // a freshly rested limit may already be marketable
        if let Some(tick) = &self.last_tick {
            let quote = self.execution.quote(tick.price);
            let at = tick.timestamp;
            let fill = self
                .working
                .get(&order_id)
                .and_then(|o| self.execution.resting_fill(o, &quote, at));
            if let Some(fill) = fill {
                self.settle_fill(&order_id, fill).await?;
            }
        }
        Ok(order_id)
    }

    async fn submit_immediate(&mut self, mut order: Order) -> Result<OrderId, EngineError> {
        let tick = self.last_tick.clone().ok_or_else(|| {
            EngineError::conflict("no market price available for immediate execution")
        })?;
        let quote = self.execution.quote(tick.price);
        let order_id = order.id.clone();

        match self.execution.immediate_fill(&order, &quote, tick.timestamp) {
            Some(fill) => {
                self.order_store.save_order(&order).await?;
                self.working.insert(order_id.clone(), order);
                // FOK/IOC fill fully here or not at all; the settle either
                // completes or the submit fails with the store error
                if let Err(err) = self.settle_fill(&order_id, fill).await {
                    self.working.remove(&order_id);
                    return Err(err);
                }
                Ok(order_id)
            }
            None => {
                // not marketable: IOC/FOK cancel in full, no resting remainder
                order.transition_to(OrderStatus::Cancelled)?;
                self.order_store.save_order(&order).await?;
                self.order_store.archive_order(&order).await?;
                info!(order = %order, "immediate order not marketable, cancelled");
                Ok(order_id)
            }
        }
    }

    async fn on_cancel(&mut self, order_id: &str) -> Result<(), EngineError> {
        if self.working.contains_key(order_id) {
            return self.cancel_working(order_id).await;
        }
        // not resting here: either already terminal (distinct error) or unknown
        match self.order_store.load_order(order_id).await? {
            Some(order) if order.account_id == self.account_id => {
                Err(EngineError::NotCancellable {
                    order_id: order.id,
                    status: order.status,
                })
            }
            _ => Err(EngineError::OrderNotFound(order_id.to_string())),
        }
    }

    async fn on_update(&mut self, update: OrderUpdate) -> Result<(), EngineError> {
        for price in [update.limit_price, update.stop_price] {
            if let Some(price) = price {
                if price <= Decimal::ZERO {
                    return Err(EngineError::InvalidPrice {
                        price,
                        reason: "updated price must be positive".to_string(),
                    });
                }
            }
        }

        let order = match self.working.get(&update.order_id) {
            Some(order) => order,
            None => {
                return match self.order_store.load_order(&update.order_id).await? {
                    Some(order) if order.account_id == self.account_id => {
                        Err(EngineError::NotModifiable {
                            order_id: order.id,
                            status: order.status,
                        })
                    }
                    _ => Err(EngineError::OrderNotFound(update.order_id.clone())),
                };
            }
        };
        if !order.status.is_modifiable() {
            return Err(EngineError::NotModifiable {
                order_id: order.id.clone(),
                status: order.status,
            });
        }

        let mut updated = order.clone();
        updated.params = match updated.params {
            OrderParams::Market => {
                return Err(EngineError::InvalidRequest {
                    reason: "market orders carry no price to update".to_string(),
                })
            }
            OrderParams::Limit { price } => OrderParams::Limit {
                price: update.limit_price.unwrap_or(price),
            },
            OrderParams::Stop { stop } => OrderParams::Stop {
                stop: update.stop_price.unwrap_or(stop),
            },
            OrderParams::StopLimit { stop, limit } => OrderParams::StopLimit {
                stop: update.stop_price.unwrap_or(stop),
                limit: update.limit_price.unwrap_or(limit),
            },
            OrderParams::TrailingStop { trail } => OrderParams::TrailingStop { trail },
        }
        .rounded(&self.instrument);

        match updated.params {
            OrderParams::Stop { stop } | OrderParams::StopLimit { stop, .. }
                if updated.triggered_at.is_none() =>
            {
                updated.current_stop = Some(stop);
            }
            OrderParams::TrailingStop { .. } => {
                // moving a trailing stop re-anchors its live trigger
                if let Some(stop) = update.stop_price {
                    updated.current_stop = Some(self.instrument.round_price(stop));
                }
            }
            _ => {}
        }

        if let Some(quantity) = update.quantity {
            if quantity <= 0 {
                return Err(EngineError::InvalidQuantity { quantity });
            }
            if quantity < updated.filled_quantity {
                return Err(EngineError::InvalidRequest {
                    reason: format!(
                        "quantity {quantity} is below the filled amount {}",
                        updated.filled_quantity
                    ),
                });
            }
            updated.quantity = quantity;
        }

        BracketManager::validate_protective(&self.position, updated.side, &updated.params)?;

        updated.updated_at = Utc::now();
        self.order_store.save_order(&updated).await?;
        debug!(order = %updated, "order updated in place");
        self.working.insert(updated.id.clone(), updated);
        Ok(())
    }

    async fn on_close_position(&mut self) -> Result<CloseReport, EngineError> {
        let position_side = self.position.side().ok_or_else(|| {
            EngineError::conflict(format!(
                "no open position for {} {}",
                self.account_id, self.instrument.symbol
            ))
        })?;
        let quantity = self.position.quantity.abs();

        let cancelled_orders = self.cascade_cancel(position_side).await;

        let request = OrderRequest {
            account_id: self.account_id.clone(),
            symbol: self.instrument.symbol.to_string(),
            order_type: OrderType::Market,
            side: position_side.opposite(),
            quantity,
            limit_price: None,
            stop_price: None,
            trail_amount: None,
            time_in_force: TimeInForce::Ioc,
            client_order_id: None,
        };
        let closing_order_id = self.on_submit(request).await?;
        Ok(CloseReport {
            closing_order_id,
            cancelled_orders,
        })
    }

    async fn on_session_close(&mut self) {
        let day_orders: Vec<OrderId> = self
            .working
            .values()
            .filter(|o| o.time_in_force == TimeInForce::Day)
            .map(|o| o.id.clone())
            .collect();

        for order_id in day_orders {
            let Some(order) = self.working.get(&order_id) else {
                continue;
            };
            let mut updated = order.clone();
            let result = match updated.status {
                OrderStatus::Working => updated.transition_to(OrderStatus::Expired),
                // Partial has no expired transition; the remainder cancels
                _ => updated.transition_to(OrderStatus::Cancelled),
            };
            if let Err(err) = result {
                warn!(order_id = %order_id, error = %err, "session close skipped order");
                continue;
            }
            match self.order_store.save_order(&updated).await {
                Ok(()) => {
                    let _ = self.order_store.archive_order(&updated).await;
                    info!(order = %updated, "day order lapsed at session close");
                    self.working.remove(&order_id);
                }
                Err(err) => {
                    error!(order_id = %order_id, error = %err, "session close persistence failed")
                }
            }
        }
    }

    fn increases_exposure(&self, side: Side, quantity: i64) -> bool {
        match self.position.side() {
            None => true,
            Some(position_side) if position_side == side => true,
            Some(_) => quantity > self.position.quantity.abs(),
        }
    }

    fn view(&self) -> BookView {
        let mut working: Vec<Order> = self.working.values().cloned().collect();
        working.sort_by_key(|o| o.seq);
        BookView {
            position: self.position.clone(),
            working,
            last_price: self.last_tick.as_ref().map(|t| t.price),
        }
    }
}
