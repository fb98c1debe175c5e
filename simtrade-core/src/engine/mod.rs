//! Engine assembly
//!
//! `SimEngine` owns one tick generator and driver task per instrument and
//! routes every client request to the single-writer book actor for its
//! `(account, symbol)` pair. The driver fans each tick out to the books of
//! that symbol, so trigger evaluation and client traffic for one pair are
//! totally ordered; across pairs there is no ordering and none is needed.

mod book;
pub mod bracket;
pub mod execution;
pub mod ledger;
pub mod trigger;

pub use book::{BookView, CloseReport};
pub use bracket::BracketManager;
pub use execution::{ExecutionEngine, Fill, Quote};
pub use ledger::{FillOutcome, Position, PositionLedger};
pub use trigger::TriggerEvaluator;

use chrono::{DateTime, NaiveTime, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use book::{AccountBook, BookCommand};

use crate::errors::EngineError;
use crate::instruments::{Instrument, InstrumentRegistry, Symbol};
use crate::market_data::{Candle, CandleInterval, PriceTick, TickGenerator, TickGeneratorConfig};
use crate::orders::{AccountId, OrderId, OrderRequest, OrderUpdate};
use crate::store::{AccountStore, OrderStore};

/// Engine configuration.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Interval between generated ticks, per instrument
    pub tick_interval: Duration,
    /// Wall-clock session close; Day orders lapse when a tick crosses it
    pub session_close: Option<NaiveTime>,
    /// Generator settings shared by every instrument; the seed is mixed
    /// with the symbol so streams differ but stay reproducible
    pub generator: TickGeneratorConfig,
    /// Per-symbol starting prices overriding the generator default
    pub start_prices: HashMap<String, Decimal>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(250),
            session_close: None,
            generator: TickGeneratorConfig::default(),
            start_prices: HashMap::new(),
        }
    }
}

/// Account view with derived equity.
#[derive(Clone, Debug, Serialize)]
pub struct AccountSnapshot {
    pub id: AccountId,
    pub balance: Decimal,
    /// balance + unrealized P&L across open positions
    pub equity: Decimal,
    pub margin_used: Decimal,
    pub unrealized_pnl: Decimal,
    pub positions: Vec<Position>,
}

type BookKey = (AccountId, Symbol);
type BookSender = mpsc::UnboundedSender<BookCommand>;

pub struct SimEngine {
    config: EngineConfig,
    instruments: Arc<InstrumentRegistry>,
    order_store: Arc<dyn OrderStore>,
    account_store: Arc<dyn AccountStore>,
    generators: DashMap<Symbol, Arc<TickGenerator>>,
    books: Arc<DashMap<BookKey, BookSender>>,
    running: Arc<tokio::sync::RwLock<bool>>,
    driver_tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl SimEngine {
    pub fn new(
        config: EngineConfig,
        instruments: InstrumentRegistry,
        order_store: Arc<dyn OrderStore>,
        account_store: Arc<dyn AccountStore>,
    ) -> Result<Self, EngineError> {
        let instruments = Arc::new(instruments);
        let generators = DashMap::new();
        for symbol in instruments.symbols() {
            let instrument = instruments.require(symbol)?.clone();
            let mut generator_config = config.generator.clone();
            if let Some(start) = config.start_prices.get(symbol.as_str()) {
                generator_config.start_price = *start;
            }
            let mut hasher = DefaultHasher::new();
            symbol.as_str().hash(&mut hasher);
            generator_config.seed ^= hasher.finish();
            let generator = TickGenerator::new(instrument, generator_config)?;
            generators.insert(symbol.clone(), Arc::new(generator));
        }
        Ok(Self {
            config,
            instruments,
            order_store,
            account_store,
            generators,
            books: Arc::new(DashMap::new()),
            running: Arc::new(tokio::sync::RwLock::new(false)),
            driver_tasks: parking_lot::Mutex::new(Vec::new()),
        })
    }

    /// Spawn one tick driver per instrument. Idempotent.
    pub async fn start(&self) -> Result<(), EngineError> {
        {
            let mut running = self.running.write().await;
            if *running {
                return Ok(());
            }
            *running = true;
        }

        for entry in self.generators.iter() {
            let symbol = entry.key().clone();
            let generator = entry.value().clone();
            let books = self.books.clone();
            let running = self.running.clone();
            let tick_interval = self.config.tick_interval;
            let session_close = self.config.session_close;

            let handle = tokio::spawn(async move {
                let mut interval = tokio::time::interval(tick_interval);
                let mut last_seen: Option<DateTime<Utc>> = None;
                loop {
                    interval.tick().await;
                    if !*running.read().await {
                        break;
                    }
                    let now = Utc::now();
                    if let Some(close) = session_close {
                        if session_crossed(last_seen, now, close) {
                            fan_out(&books, &symbol, || BookCommand::SessionClose);
                        }
                    }
                    let tick = generator.advance(now);
                    fan_out(&books, &symbol, || BookCommand::Tick(tick.clone()));
                    last_seen = Some(now);
                }
                info!(symbol = %symbol, "tick driver stopped");
            });
            self.driver_tasks.lock().push(handle);
        }
        info!(instruments = self.generators.len(), "engine started");
        Ok(())
    }

    /// Stop tick drivers. Book actors stay alive for queries.
    pub async fn stop(&self) {
        {
            let mut running = self.running.write().await;
            *running = false;
        }
        for handle in self.driver_tasks.lock().drain(..) {
            handle.abort();
        }
        info!("engine stopped");
    }

    // === Client operations ===

    pub async fn submit_order(&self, request: OrderRequest) -> Result<OrderId, EngineError> {
        let symbol = Symbol::new(request.symbol.clone());
        let instrument = self.instruments.require(&symbol)?.clone();
        self.account_store
            .load_account(&request.account_id)
            .await?
            .ok_or_else(|| EngineError::UnknownAccount(request.account_id.clone()))?;

        let sender = self.book(&request.account_id, &symbol, instrument);
        let (tx, rx) = oneshot::channel();
        sender
            .send(BookCommand::Submit { request, reply: tx })
            .map_err(|_| EngineError::ChannelClosed)?;
        rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    pub async fn cancel_order(&self, account_id: &str, order_id: &str) -> Result<(), EngineError> {
        let sender = self.book_for_order(account_id, order_id).await?;
        let (tx, rx) = oneshot::channel();
        sender
            .send(BookCommand::Cancel {
                order_id: order_id.to_string(),
                reply: tx,
            })
            .map_err(|_| EngineError::ChannelClosed)?;
        rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    pub async fn update_order(&self, update: OrderUpdate) -> Result<(), EngineError> {
        let sender = self
            .book_for_order(&update.account_id, &update.order_id)
            .await?;
        let (tx, rx) = oneshot::channel();
        sender
            .send(BookCommand::Update { update, reply: tx })
            .map_err(|_| EngineError::ChannelClosed)?;
        rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Cancel linked bracket orders, then flatten with an offsetting market
    /// order. The report carries the cancellation count.
    pub async fn close_position(
        &self,
        account_id: &str,
        symbol: &Symbol,
    ) -> Result<CloseReport, EngineError> {
        let key = (account_id.to_string(), symbol.clone());
        let sender = self
            .books
            .get(&key)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| {
                EngineError::conflict(format!("no open position for {account_id} {symbol}"))
            })?;
        let (tx, rx) = oneshot::channel();
        sender
            .send(BookCommand::ClosePosition { reply: tx })
            .map_err(|_| EngineError::ChannelClosed)?;
        rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    // === Views ===

    pub async fn position(
        &self,
        account_id: &str,
        symbol: &Symbol,
    ) -> Result<Option<Position>, EngineError> {
        let key = (account_id.to_string(), symbol.clone());
        let Some(sender) = self.books.get(&key).map(|entry| entry.value().clone()) else {
            return Ok(None);
        };
        Ok(Some(snapshot(&sender).await?.position))
    }

    pub async fn book_view(
        &self,
        account_id: &str,
        symbol: &Symbol,
    ) -> Result<Option<BookView>, EngineError> {
        let key = (account_id.to_string(), symbol.clone());
        let Some(sender) = self.books.get(&key).map(|entry| entry.value().clone()) else {
            return Ok(None);
        };
        Ok(Some(snapshot(&sender).await?))
    }

    pub async fn account_snapshot(
        &self,
        account_id: &str,
    ) -> Result<AccountSnapshot, EngineError> {
        let account = self
            .account_store
            .load_account(account_id)
            .await?
            .ok_or_else(|| EngineError::UnknownAccount(account_id.to_string()))?;

        let senders: Vec<(Symbol, BookSender)> = self
            .books
            .iter()
            .filter(|entry| entry.key().0 == account_id)
            .map(|entry| (entry.key().1.clone(), entry.value().clone()))
            .collect();

        let mut positions = Vec::new();
        let mut unrealized_pnl = Decimal::ZERO;
        for (symbol, sender) in senders {
            let view = snapshot(&sender).await?;
            if view.position.is_flat() {
                continue;
            }
            let instrument = self.instruments.require(&symbol)?;
            let mark = match view.last_price {
                Some(price) => price,
                None => view.position.avg_entry_price,
            };
            unrealized_pnl += view.position.unrealized_pnl(mark, instrument.point_value);
            positions.push(view.position);
        }

        Ok(AccountSnapshot {
            id: account.id.clone(),
            equity: account.balance + unrealized_pnl,
            balance: account.balance,
            margin_used: account.margin_used,
            unrealized_pnl,
            positions,
        })
    }

    // === Market data ===

    pub fn candles(
        &self,
        symbol: &Symbol,
        interval: CandleInterval,
        count: usize,
    ) -> Result<Vec<Candle>, EngineError> {
        self.generator(symbol)?.candles(interval, count)
    }

    pub fn last_price(&self, symbol: &Symbol) -> Option<Decimal> {
        self.generators
            .get(symbol)
            .map(|entry| entry.value().last_price())
    }

    pub fn subscribe(&self, symbol: &Symbol) -> Result<broadcast::Receiver<PriceTick>, EngineError> {
        Ok(self.generator(symbol)?.subscribe())
    }

    /// Push an externally chosen price through the full tick pipeline and
    /// wait for every book of the symbol to process it. Deterministic
    /// driver for tests and replays.
    pub async fn advance_symbol(
        &self,
        symbol: &Symbol,
        price: Decimal,
    ) -> Result<PriceTick, EngineError> {
        let generator = self.generator(symbol)?;
        let tick = generator.observe(price, Utc::now());
        fan_out(&self.books, symbol, || BookCommand::Tick(tick.clone()));
        self.barrier(symbol).await?;
        Ok(tick)
    }

    /// Deliver a session-close boundary to every book of the symbol.
    pub async fn end_session(&self, symbol: &Symbol) -> Result<(), EngineError> {
        fan_out(&self.books, symbol, || BookCommand::SessionClose);
        self.barrier(symbol).await
    }

    // === Internals ===

    fn generator(&self, symbol: &Symbol) -> Result<Arc<TickGenerator>, EngineError> {
        self.generators
            .get(symbol)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| EngineError::UnknownInstrument(symbol.to_string()))
    }

    fn book(&self, account_id: &str, symbol: &Symbol, instrument: Instrument) -> BookSender {
        let key = (account_id.to_string(), symbol.clone());
        let generator = self.generators.get(symbol).map(|entry| entry.value().clone());
        self.books
            .entry(key)
            .or_insert_with(|| {
                let sender = AccountBook::spawn(
                    account_id.to_string(),
                    instrument,
                    self.order_store.clone(),
                    self.account_store.clone(),
                );
                // prime the new book with the current price so immediate
                // orders can execute before the next driver tick
                if let Some(generator) = generator {
                    let tick = generator.observe(generator.last_price(), Utc::now());
                    let _ = sender.send(BookCommand::Tick(tick));
                }
                sender
            })
            .value()
            .clone()
    }

    async fn book_for_order(
        &self,
        account_id: &str,
        order_id: &str,
    ) -> Result<BookSender, EngineError> {
        let order = self
            .order_store
            .load_order(order_id)
            .await?
            .ok_or_else(|| EngineError::OrderNotFound(order_id.to_string()))?;
        if order.account_id != account_id {
            // do not leak other accounts' order state
            return Err(EngineError::OrderNotFound(order_id.to_string()));
        }
        let instrument = self.instruments.require(&order.symbol)?.clone();
        Ok(self.book(account_id, &order.symbol, instrument))
    }

    /// Round-trip a snapshot through every book of `symbol`; because each
    /// book processes messages in order, returning means all previously
    /// sent commands have been handled.
    async fn barrier(&self, symbol: &Symbol) -> Result<(), EngineError> {
        let senders: Vec<BookSender> = self
            .books
            .iter()
            .filter(|entry| &entry.key().1 == symbol)
            .map(|entry| entry.value().clone())
            .collect();
        for sender in senders {
            snapshot(&sender).await?;
        }
        Ok(())
    }
}

async fn snapshot(sender: &BookSender) -> Result<BookView, EngineError> {
    let (tx, rx) = oneshot::channel();
    sender
        .send(BookCommand::Snapshot { reply: tx })
        .map_err(|_| EngineError::ChannelClosed)?;
    rx.await.map_err(|_| EngineError::ChannelClosed)
}

fn fan_out<F>(books: &DashMap<BookKey, BookSender>, symbol: &Symbol, mut command: F)
where
    F: FnMut() -> BookCommand,
{
    for entry in books.iter() {
        if &entry.key().1 == symbol {
            if entry.value().send(command()).is_err() {
                warn!(symbol = %symbol, "book channel closed during fan-out");
            }
        }
    }
}

fn session_crossed(prev: Option<DateTime<Utc>>, now: DateTime<Utc>, close: NaiveTime) -> bool {
    match prev {
        None => false,
        Some(prev) if prev.date_naive() == now.date_naive() => {
            prev.time() < close && now.time() >= close
        }
        Some(prev) => prev.time() < close || now.time() >= close,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::Account;
    use crate::errors::ErrorKind;
    use crate::orders::{OrderStatus, OrderType, Side, TimeInForce};
    use crate::store::{MemoryAccountStore, MemoryOrderStore};
    use rust_decimal_macros::dec;

    struct Harness {
        engine: SimEngine,
        orders: Arc<MemoryOrderStore>,
        accounts: Arc<MemoryAccountStore>,
    }

    const ACCT: &str = "acct-1";

    async fn harness_with_balance(balance: Decimal) -> Harness {
        let instruments =
            InstrumentRegistry::new([Instrument::new("ES", dec!(0.25), dec!(50), dec!(12000))]);
        let orders = Arc::new(MemoryOrderStore::new());
        let accounts = Arc::new(MemoryAccountStore::new());
        accounts
            .create_account(Account::new(ACCT, balance))
            .await
            .unwrap();
        let engine = SimEngine::new(
            EngineConfig::default(),
            instruments,
            orders.clone(),
            accounts.clone(),
        )
        .unwrap();
        Harness {
            engine,
            orders,
            accounts,
        }
    }

    async fn harness() -> Harness {
        harness_with_balance(dec!(100000)).await
    }

    fn es() -> Symbol {
        Symbol::new("ES")
    }

    fn request(
        order_type: OrderType,
        side: Side,
        quantity: i64,
        tif: TimeInForce,
    ) -> OrderRequest {
        OrderRequest {
            account_id: ACCT.to_string(),
            symbol: "ES".to_string(),
            order_type,
            side,
            quantity,
            limit_price: None,
            stop_price: None,
            trail_amount: None,
            time_in_force: tif,
            client_order_id: None,
        }
    }

    fn market(side: Side, quantity: i64) -> OrderRequest {
        request(OrderType::Market, side, quantity, TimeInForce::Gtc)
    }

    fn limit(side: Side, quantity: i64, price: Decimal, tif: TimeInForce) -> OrderRequest {
        let mut req = request(OrderType::Limit, side, quantity, tif);
        req.limit_price = Some(price);
        req
    }

    fn stop(side: Side, quantity: i64, stop_price: Decimal) -> OrderRequest {
        let mut req = request(OrderType::Stop, side, quantity, TimeInForce::Gtc);
        req.stop_price = Some(stop_price);
        req
    }

    // Scenario A: a market buy at synthetic price 4500.00 fills on the ask
    // side of the one-tick spread.
    #[tokio::test]
    async fn test_market_buy_fills_on_ask_side() {
        let h = harness().await;
        h.engine.advance_symbol(&es(), dec!(4500.00)).await.unwrap();

        let order_id = h.engine.submit_order(market(Side::Buy, 1)).await.unwrap();

        let position = h.engine.position(ACCT, &es()).await.unwrap().unwrap();
        assert_eq!(position.quantity, 1);
        assert_eq!(position.avg_entry_price, dec!(4500.25));

        let order = h.orders.load_order(&order_id).await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Filled);
        assert_eq!(order.avg_fill_price, Some(dec!(4500.25)));

        // margin reserved for one contract
        let account = h.accounts.load_account(ACCT).await.unwrap().unwrap();
        assert_eq!(account.margin_used, dec!(12000));
    }

    // Scenario B: TP fills at its limit when the price runs up, the SL is
    // cancelled in the same operation, and the realized P&L lands in the
    // account balance.
    #[tokio::test]
    async fn test_take_profit_fill_cancels_stop_loss() {
        let h = harness().await;
        h.engine.advance_symbol(&es(), dec!(4500.00)).await.unwrap();
        h.engine.submit_order(market(Side::Buy, 1)).await.unwrap();

        let tp_id = h
            .engine
            .submit_order(limit(Side::Sell, 1, dec!(4510.00), TimeInForce::Gtc))
            .await
            .unwrap();
        let sl_id = h
            .engine
            .submit_order(stop(Side::Sell, 1, dec!(4490.00)))
            .await
            .unwrap();

        h.engine.advance_symbol(&es(), dec!(4505.00)).await.unwrap();
        h.engine.advance_symbol(&es(), dec!(4511.00)).await.unwrap();

        let tp = h.orders.load_order(&tp_id).await.unwrap().unwrap();
        assert_eq!(tp.status, OrderStatus::Filled);
        assert_eq!(tp.avg_fill_price, Some(dec!(4510.00)));

        let sl = h.orders.load_order(&sl_id).await.unwrap().unwrap();
        assert_eq!(sl.status, OrderStatus::Cancelled);

        let position = h.engine.position(ACCT, &es()).await.unwrap().unwrap();
        assert!(position.is_flat());

        // entry 4500.25 (ask-side fill), exit 4510.00: 9.75 points * $50
        let account = h.accounts.load_account(ACCT).await.unwrap().unwrap();
        assert_eq!(account.balance, dec!(100000) + dec!(487.50));
        assert_eq!(account.margin_used, Decimal::ZERO);
    }

    // Scenario C: an SL above the long's entry is rejected before the order
    // is created.
    #[tokio::test]
    async fn test_stop_loss_above_long_entry_rejected() {
        let h = harness().await;
        h.engine.advance_symbol(&es(), dec!(4500.00)).await.unwrap();
        h.engine.submit_order(market(Side::Buy, 1)).await.unwrap();

        let err = h
            .engine
            .submit_order(stop(Side::Sell, 1, dec!(4505.00)))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StateConflict);

        // nothing rests
        let view = h.engine.book_view(ACCT, &es()).await.unwrap().unwrap();
        assert!(view.working.is_empty());
    }

    // Scenario D: cancelling an order that a tick just filled is a typed
    // conflict, not a silent no-op.
    #[tokio::test]
    async fn test_cancel_after_concurrent_fill_conflicts() {
        let h = harness().await;
        h.engine.advance_symbol(&es(), dec!(4500.00)).await.unwrap();
        let order_id = h
            .engine
            .submit_order(limit(Side::Buy, 1, dec!(4499.00), TimeInForce::Gtc))
            .await
            .unwrap();

        // tick drops through the limit and fills it
        h.engine.advance_symbol(&es(), dec!(4497.00)).await.unwrap();

        let err = h.engine.cancel_order(ACCT, &order_id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StateConflict);
        assert!(matches!(err, EngineError::NotCancellable { .. }));
    }

    #[tokio::test]
    async fn test_buy_stop_triggers_only_at_or_above_stop() {
        let h = harness().await;
        h.engine.advance_symbol(&es(), dec!(4500.00)).await.unwrap();
        let order_id = h
            .engine
            .submit_order(stop(Side::Buy, 1, dec!(4510.00)))
            .await
            .unwrap();

        h.engine.advance_symbol(&es(), dec!(4509.75)).await.unwrap();
        let order = h.orders.load_order(&order_id).await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Working);
        assert!(order.triggered_at.is_none());

        h.engine.advance_symbol(&es(), dec!(4510.00)).await.unwrap();
        let order = h.orders.load_order(&order_id).await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Filled);
        assert!(order.triggered_at.is_some());
        // triggered stop fills as a market order, ask side
        assert_eq!(order.avg_fill_price, Some(dec!(4510.25)));
    }

    #[tokio::test]
    async fn test_stop_limit_rests_at_limit_after_trigger() {
        let h = harness().await;
        h.engine.advance_symbol(&es(), dec!(4500.00)).await.unwrap();
        h.engine.submit_order(market(Side::Buy, 1)).await.unwrap();

        let mut req = request(OrderType::StopLimit, Side::Sell, 1, TimeInForce::Gtc);
        req.stop_price = Some(dec!(4495.00));
        req.limit_price = Some(dec!(4494.00));
        let order_id = h.engine.submit_order(req).await.unwrap();

        // gap straight through both stop and limit: converts and fills at
        // the limit price, not the market
        h.engine.advance_symbol(&es(), dec!(4495.00)).await.unwrap();
        let order = h.orders.load_order(&order_id).await.unwrap().unwrap();
        assert!(order.triggered_at.is_some());
        assert_eq!(order.status, OrderStatus::Filled);
        assert_eq!(order.avg_fill_price, Some(dec!(4494.00)));
    }

    #[tokio::test]
    async fn test_trailing_stop_follows_then_fills() {
        let h = harness().await;
        h.engine.advance_symbol(&es(), dec!(4500.00)).await.unwrap();
        h.engine.submit_order(market(Side::Buy, 1)).await.unwrap();

        let mut req = request(OrderType::TrailingStop, Side::Sell, 1, TimeInForce::Gtc);
        req.trail_amount = Some(dec!(5.00));
        let order_id = h.engine.submit_order(req).await.unwrap();

        // run up: the stop ratchets to 4510 - 5 = 4505
        h.engine.advance_symbol(&es(), dec!(4506.00)).await.unwrap();
        h.engine.advance_symbol(&es(), dec!(4510.00)).await.unwrap();
        let order = h.orders.load_order(&order_id).await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Working);

        // pull back through the ratcheted stop
        h.engine.advance_symbol(&es(), dec!(4504.75)).await.unwrap();
        let order = h.orders.load_order(&order_id).await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Filled);
        // sell stop fills on the bid
        assert_eq!(order.avg_fill_price, Some(dec!(4504.50)));

        let position = h.engine.position(ACCT, &es()).await.unwrap().unwrap();
        assert!(position.is_flat());
    }

    #[tokio::test]
    async fn test_ioc_not_marketable_cancels_whole() {
        let h = harness().await;
        h.engine.advance_symbol(&es(), dec!(4500.00)).await.unwrap();
        let order_id = h
            .engine
            .submit_order(limit(Side::Buy, 1, dec!(4490.00), TimeInForce::Ioc))
            .await
            .unwrap();

        let order = h.orders.load_order(&order_id).await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Cancelled);
        assert_eq!(order.filled_quantity, 0);
        // nothing rests
        let view = h.engine.book_view(ACCT, &es()).await.unwrap().unwrap();
        assert!(view.working.is_empty());
    }

    #[tokio::test]
    async fn test_fok_is_all_or_nothing() {
        let h = harness().await;
        h.engine.advance_symbol(&es(), dec!(4500.00)).await.unwrap();

        // marketable: fills in full at the limit
        let filled_id = h
            .engine
            .submit_order(limit(Side::Buy, 2, dec!(4501.00), TimeInForce::Fok))
            .await
            .unwrap();
        let filled = h.orders.load_order(&filled_id).await.unwrap().unwrap();
        assert_eq!(filled.status, OrderStatus::Filled);
        assert_eq!(filled.filled_quantity, 2);
        assert_eq!(filled.avg_fill_price, Some(dec!(4501.00)));

        // unmarketable: cancelled with zero filled
        let killed_id = h
            .engine
            .submit_order(limit(Side::Sell, 2, dec!(4520.00), TimeInForce::Fok))
            .await
            .unwrap();
        let killed = h.orders.load_order(&killed_id).await.unwrap().unwrap();
        assert_eq!(killed.status, OrderStatus::Cancelled);
        assert_eq!(killed.filled_quantity, 0);
    }

    #[tokio::test]
    async fn test_conditional_with_immediate_tif_rejected() {
        let h = harness().await;
        h.engine.advance_symbol(&es(), dec!(4500.00)).await.unwrap();
        let mut req = stop(Side::Buy, 1, dec!(4510.00));
        req.time_in_force = TimeInForce::Ioc;
        let err = h.engine.submit_order(req).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_day_orders_lapse_at_session_close() {
        let h = harness().await;
        h.engine.advance_symbol(&es(), dec!(4500.00)).await.unwrap();
        let day_id = h
            .engine
            .submit_order(limit(Side::Buy, 1, dec!(4490.00), TimeInForce::Day))
            .await
            .unwrap();
        let gtc_id = h
            .engine
            .submit_order(limit(Side::Buy, 1, dec!(4489.00), TimeInForce::Gtc))
            .await
            .unwrap();

        h.engine.end_session(&es()).await.unwrap();

        let day = h.orders.load_order(&day_id).await.unwrap().unwrap();
        assert_eq!(day.status, OrderStatus::Expired);
        let gtc = h.orders.load_order(&gtc_id).await.unwrap().unwrap();
        assert_eq!(gtc.status, OrderStatus::Working);
    }

    #[tokio::test]
    async fn test_close_position_cancels_brackets_and_flattens() {
        let h = harness().await;
        h.engine.advance_symbol(&es(), dec!(4500.00)).await.unwrap();
        h.engine.submit_order(market(Side::Buy, 2)).await.unwrap();
        h.engine
            .submit_order(limit(Side::Sell, 2, dec!(4510.00), TimeInForce::Gtc))
            .await
            .unwrap();
        h.engine
            .submit_order(stop(Side::Sell, 2, dec!(4490.00)))
            .await
            .unwrap();

        let report = h.engine.close_position(ACCT, &es()).await.unwrap();
        assert_eq!(report.cancelled_orders, 2);

        let closing = h
            .orders
            .load_order(&report.closing_order_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(closing.status, OrderStatus::Filled);
        // market sell hits the bid
        assert_eq!(closing.avg_fill_price, Some(dec!(4499.75)));

        let position = h.engine.position(ACCT, &es()).await.unwrap().unwrap();
        assert!(position.is_flat());
        let account = h.accounts.load_account(ACCT).await.unwrap().unwrap();
        assert_eq!(account.margin_used, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_close_without_position_conflicts() {
        let h = harness().await;
        h.engine.advance_symbol(&es(), dec!(4500.00)).await.unwrap();
        let err = h.engine.close_position(ACCT, &es()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StateConflict);
    }

    #[tokio::test]
    async fn test_update_moves_resting_order_in_place() {
        let h = harness().await;
        h.engine.advance_symbol(&es(), dec!(4500.00)).await.unwrap();
        h.engine.submit_order(market(Side::Buy, 1)).await.unwrap();
        let tp_id = h
            .engine
            .submit_order(limit(Side::Sell, 1, dec!(4510.00), TimeInForce::Gtc))
            .await
            .unwrap();

        h.engine
            .update_order(OrderUpdate {
                account_id: ACCT.to_string(),
                order_id: tp_id.clone(),
                limit_price: Some(dec!(4512.10)),
                stop_price: None,
                quantity: None,
            })
            .await
            .unwrap();

        let view = h.engine.book_view(ACCT, &es()).await.unwrap().unwrap();
        assert_eq!(view.working.len(), 1);
        assert_eq!(view.working[0].id, tp_id);
        // price rounded to the grid on the way in
        assert_eq!(
            view.working[0].params,
            crate::orders::OrderParams::Limit { price: dec!(4512.00) }
        );
    }

    #[tokio::test]
    async fn test_update_rejects_invalid_bracket_direction() {
        let h = harness().await;
        h.engine.advance_symbol(&es(), dec!(4500.00)).await.unwrap();
        h.engine.submit_order(market(Side::Buy, 1)).await.unwrap();
        let sl_id = h
            .engine
            .submit_order(stop(Side::Sell, 1, dec!(4490.00)))
            .await
            .unwrap();

        // dragging the SL above the entry is a direction violation
        let err = h
            .engine
            .update_order(OrderUpdate {
                account_id: ACCT.to_string(),
                order_id: sl_id,
                limit_price: None,
                stop_price: Some(dec!(4506.00)),
                quantity: None,
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StateConflict);
    }

    #[tokio::test]
    async fn test_update_terminal_order_conflicts() {
        let h = harness().await;
        h.engine.advance_symbol(&es(), dec!(4500.00)).await.unwrap();
        let order_id = h.engine.submit_order(market(Side::Buy, 1)).await.unwrap();

        let err = h
            .engine
            .update_order(OrderUpdate {
                account_id: ACCT.to_string(),
                order_id,
                limit_price: None,
                stop_price: None,
                quantity: Some(2),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotModifiable { .. }));
    }

    #[tokio::test]
    async fn test_insufficient_margin_rejected_at_submission() {
        let h = harness_with_balance(dec!(5000)).await;
        h.engine.advance_symbol(&es(), dec!(4500.00)).await.unwrap();

        let err = h.engine.submit_order(market(Side::Buy, 1)).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::InsufficientMargin { required, .. } if required == dec!(12000)
        ));
    }

    #[tokio::test]
    async fn test_client_order_id_resubmission_is_idempotent() {
        let h = harness().await;
        h.engine.advance_symbol(&es(), dec!(4500.00)).await.unwrap();

        let mut req = market(Side::Buy, 1);
        req.client_order_id = Some("client-42".to_string());
        let first = h.engine.submit_order(req.clone()).await.unwrap();
        let second = h.engine.submit_order(req).await.unwrap();
        assert_eq!(first, second);

        // retried submission did not double-apply
        let position = h.engine.position(ACCT, &es()).await.unwrap().unwrap();
        assert_eq!(position.quantity, 1);
    }

    #[tokio::test]
    async fn test_unknown_symbol_and_account_rejected() {
        let h = harness().await;
        let mut req = market(Side::Buy, 1);
        req.symbol = "NQ".to_string();
        assert!(matches!(
            h.engine.submit_order(req).await,
            Err(EngineError::UnknownInstrument(_))
        ));

        let mut req = market(Side::Buy, 1);
        req.account_id = "ghost".to_string();
        assert!(matches!(
            h.engine.submit_order(req).await,
            Err(EngineError::UnknownAccount(_))
        ));
    }

    #[tokio::test]
    async fn test_account_snapshot_marks_equity_to_market() {
        let h = harness().await;
        h.engine.advance_symbol(&es(), dec!(4500.00)).await.unwrap();
        h.engine.submit_order(market(Side::Buy, 1)).await.unwrap();
        h.engine.advance_symbol(&es(), dec!(4510.00)).await.unwrap();

        let snapshot = h.engine.account_snapshot(ACCT).await.unwrap();
        // entry 4500.25, mark 4510.00: 9.75 points * $50
        assert_eq!(snapshot.unrealized_pnl, dec!(487.50));
        assert_eq!(snapshot.equity, dec!(100487.50));
        assert_eq!(snapshot.balance, dec!(100000));
        assert_eq!(snapshot.positions.len(), 1);
    }

    #[tokio::test]
    async fn test_engine_lifecycle_ticks_books() {
        let h = harness().await;
        h.engine.start().await.unwrap();
        // generator-driven ticks reach a freshly created book
        h.engine.advance_symbol(&es(), dec!(4500.00)).await.unwrap();
        h.engine.submit_order(market(Side::Buy, 1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        h.engine.stop().await;

        let position = h.engine.position(ACCT, &es()).await.unwrap().unwrap();
        assert_eq!(position.quantity, 1);
    }

    #[test]
    fn test_session_crossing_detection() {
        use chrono::TimeZone;
        let close = NaiveTime::from_hms_opt(17, 0, 0).unwrap();
        let before = Utc.with_ymd_and_hms(2024, 3, 4, 16, 59, 0).unwrap();
        let after = Utc.with_ymd_and_hms(2024, 3, 4, 17, 0, 1).unwrap();

        assert!(!session_crossed(None, after, close));
        assert!(!session_crossed(Some(before), before, close));
        assert!(session_crossed(Some(before), after, close));

        let next_morning = Utc.with_ymd_and_hms(2024, 3, 5, 9, 0, 0).unwrap();
        // the 17:00 close fell inside the overnight gap
        assert!(session_crossed(Some(before), next_morning, close));
        // but a tick that already passed the close does not re-close
        assert!(!session_crossed(Some(after), next_morning, close));
    }
}
