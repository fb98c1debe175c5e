//! Simtrade service
//!
//! Wires the synthetic market engine together: instrument registry,
//! in-memory stores, one demo account, and a periodic stats report until
//! shutdown.

use anyhow::Result;
use chrono::NaiveTime;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info};

use simtrade_core::{
    Account, AccountStore, CandleInterval, EngineConfig, Instrument, InstrumentRegistry,
    MemoryAccountStore, MemoryOrderStore, OrderRequest, OrderType, Side, SimEngine, Symbol,
    TimeInForce,
};

const DEMO_ACCOUNT: &str = "demo";

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter("info")
        .init();

    info!("🚀 Starting simtrade engine");

    let instruments = InstrumentRegistry::new([
        // tick size, point value, margin per contract
        Instrument::new("ES", dec!(0.25), dec!(50), dec!(12000)),
        Instrument::new("CL", dec!(0.01), dec!(1000), dec!(6000)),
        Instrument::new("GC", dec!(0.10), dec!(100), dec!(9000)),
        Instrument::new("YM", dec!(1), dec!(5), dec!(8000)),
    ]);

    let mut config = EngineConfig::default();
    config.tick_interval = Duration::from_millis(250);
    config.session_close = NaiveTime::from_hms_opt(22, 0, 0);
    config.start_prices = HashMap::from([
        ("ES".to_string(), dec!(4500.00)),
        ("CL".to_string(), dec!(78.50)),
        ("GC".to_string(), dec!(2400.00)),
        ("YM".to_string(), dec!(39000)),
    ]);

    let order_store = Arc::new(MemoryOrderStore::new());
    let account_store = Arc::new(MemoryAccountStore::new());
    account_store
        .create_account(Account::new(DEMO_ACCOUNT, dec!(100000)))
        .await?;

    let engine = Arc::new(SimEngine::new(
        config,
        instruments,
        order_store,
        account_store.clone(),
    )?);
    engine.start().await?;
    info!("✅ Engine started, demo account funded with $100,000");

    // Seed some demo traffic so the stats loop has something to show
    let entry = engine
        .submit_order(OrderRequest {
            account_id: DEMO_ACCOUNT.to_string(),
            symbol: "ES".to_string(),
            order_type: OrderType::Market,
            side: Side::Buy,
            quantity: 1,
            limit_price: None,
            stop_price: None,
            trail_amount: None,
            time_in_force: TimeInForce::Gtc,
            client_order_id: None,
        })
        .await;
    match &entry {
        Ok(order_id) => info!(order_id = %order_id, "📈 Demo entry order filled"),
        Err(err) => error!(error = %err, "demo entry order rejected"),
    }

    // Periodic account report
    let stats_engine = engine.clone();
    let stats_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(10));
        loop {
            interval.tick().await;
            match stats_engine.account_snapshot(DEMO_ACCOUNT).await {
                Ok(snapshot) => {
                    info!(
                        balance = %snapshot.balance,
                        equity = %snapshot.equity,
                        unrealized = %snapshot.unrealized_pnl,
                        margin_used = %snapshot.margin_used,
                        open_positions = snapshot.positions.len(),
                        "💰 Account report"
                    );
                }
                Err(err) => error!(error = %err, "account report failed"),
            }

            let symbol = Symbol::new("ES");
            if let Ok(candles) = stats_engine.candles(&symbol, CandleInterval::OneMinute, 3) {
                if let Some(current) = candles.last() {
                    info!(
                        open = %current.open,
                        high = %current.high,
                        low = %current.low,
                        close = %current.close,
                        volume = current.volume,
                        "📊 ES current candle"
                    );
                }
            }
        }
    });

    info!("📡 Engine is running. Press Ctrl+C to stop.");
    signal::ctrl_c().await?;
    info!("🛑 Shutdown signal received");

    stats_task.abort();
    engine.stop().await;
    info!("✅ Simtrade engine shutdown complete");

    Ok(())
}
