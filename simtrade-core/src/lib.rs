//! Simtrade Core
//!
//! Backend engine for a simulated trading environment: a per-instrument
//! synthetic price stream coupled to an order lifecycle engine, position
//! ledger and bracket management. Storage is a trait boundary; in-memory
//! implementations back tests and single-process deployments.

pub mod accounts;
pub mod engine;
pub mod errors;
pub mod instruments;
pub mod market_data;
pub mod orders;
pub mod store;

// Re-export main types for easy access
pub use accounts::Account;
pub use engine::{
    AccountSnapshot, BookView, CloseReport, EngineConfig, Position, SimEngine,
};
pub use errors::{EngineError, ErrorKind, StoreError};
pub use instruments::{Instrument, InstrumentRegistry, Symbol};
pub use market_data::{Candle, CandleInterval, PriceTick, TickGenerator, TickGeneratorConfig};
pub use orders::{
    Order, OrderId, OrderParams, OrderRequest, OrderStatus, OrderType, OrderUpdate, Side,
    TimeInForce,
};
pub use store::{AccountStore, MemoryAccountStore, MemoryOrderStore, OrderStore};
