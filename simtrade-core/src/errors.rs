//! Engine and store error taxonomy

use rust_decimal::Decimal;
use thiserror::Error;

use crate::orders::{OrderStatus, OrderType};

/// Caller-visible error classes. Every `EngineError` maps onto exactly one
/// kind so client layers can react specifically (re-prompt for a price vs.
/// show a balance warning) without matching on individual variants.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    StateConflict,
    InsufficientMargin,
    Persistence,
    Internal,
}

/// Errors surfaced by the engine API.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("quantity {quantity} is not a positive integer")]
    InvalidQuantity { quantity: i64 },

    #[error("{order_type} order requires a {field} price")]
    MissingPrice {
        order_type: OrderType,
        field: &'static str,
    },

    #[error("invalid price {price}: {reason}")]
    InvalidPrice { price: Decimal, reason: String },

    #[error("unknown instrument {0}")]
    UnknownInstrument(String),

    #[error("unknown account {0}")]
    UnknownAccount(String),

    #[error("unknown candle interval {0}")]
    UnknownInterval(String),

    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },

    #[error("order {order_id} cannot be cancelled in status {status}")]
    NotCancellable {
        order_id: String,
        status: OrderStatus,
    },

    #[error("order {order_id} cannot be modified in status {status}")]
    NotModifiable {
        order_id: String,
        status: OrderStatus,
    },

    #[error("invalid status transition {from} -> {to} for order {order_id}")]
    InvalidTransition {
        order_id: String,
        from: OrderStatus,
        to: OrderStatus,
    },

    #[error("order {0} not found")]
    OrderNotFound(String),

    #[error("state conflict: {reason}")]
    StateConflict { reason: String },

    #[error("insufficient margin: required {required}, available {available}")]
    InsufficientMargin {
        required: Decimal,
        available: Decimal,
    },

    #[error("persistence failure: {0}")]
    Persistence(#[from] StoreError),

    #[error("engine is not running")]
    NotRunning,

    #[error("engine channel closed")]
    ChannelClosed,
}

impl EngineError {
    /// Classify this error into one of the caller-visible kinds.
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::InvalidQuantity { .. }
            | EngineError::MissingPrice { .. }
            | EngineError::InvalidPrice { .. }
            | EngineError::UnknownInstrument(_)
            | EngineError::UnknownAccount(_)
            | EngineError::UnknownInterval(_)
            | EngineError::InvalidRequest { .. } => ErrorKind::Validation,
            EngineError::NotCancellable { .. }
            | EngineError::NotModifiable { .. }
            | EngineError::InvalidTransition { .. }
            | EngineError::OrderNotFound(_)
            | EngineError::StateConflict { .. } => ErrorKind::StateConflict,
            EngineError::InsufficientMargin { .. } => ErrorKind::InsufficientMargin,
            EngineError::Persistence(_) => ErrorKind::Persistence,
            EngineError::NotRunning | EngineError::ChannelClosed => ErrorKind::Internal,
        }
    }

    pub(crate) fn conflict(reason: impl Into<String>) -> Self {
        EngineError::StateConflict {
            reason: reason.into(),
        }
    }
}

/// Errors raised by `OrderStore` / `AccountStore` implementations.
///
/// Surfaced to callers as `EngineError::Persistence`; the engine never
/// retries a financial mutation on its own (retries belong to the caller,
/// keyed by the client order id).
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("{entity} {id} not found in store")]
    NotFound { entity: &'static str, id: String },

    #[error("conflicting write for {entity} {id}")]
    Conflict { entity: &'static str, id: String },
}
