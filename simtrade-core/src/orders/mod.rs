//! Order model and lifecycle state machine
//!
//! Orders carry a tagged `OrderParams` union validated exhaustively at
//! construction, so execution logic never probes loose optional fields.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::errors::EngineError;
use crate::instruments::{Instrument, Symbol};

pub type OrderId = String;
pub type AccountId = String;

/// Order side
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(&self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    /// +1 for buy, -1 for sell; fills apply `sign() * quantity` to positions.
    pub fn sign(&self) -> i64 {
        match self {
            Side::Buy => 1,
            Side::Sell => -1,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

/// Order type discriminant, used in requests and error messages.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    Market,
    Limit,
    Stop,
    StopLimit,
    TrailingStop,
}

impl fmt::Display for OrderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderType::Market => write!(f, "MARKET"),
            OrderType::Limit => write!(f, "LIMIT"),
            OrderType::Stop => write!(f, "STOP"),
            OrderType::StopLimit => write!(f, "STOP_LIMIT"),
            OrderType::TrailingStop => write!(f, "TRAILING_STOP"),
        }
    }
}

/// Type-specific order parameters, validated at construction.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrderParams {
    Market,
    Limit { price: Decimal },
    Stop { stop: Decimal },
    StopLimit { stop: Decimal, limit: Decimal },
    TrailingStop { trail: Decimal },
}

impl OrderParams {
    /// Assemble params from a request's loose fields, rejecting missing or
    /// non-positive prices up front.
    pub fn from_request(
        order_type: OrderType,
        limit_price: Option<Decimal>,
        stop_price: Option<Decimal>,
        trail_amount: Option<Decimal>,
    ) -> Result<Self, EngineError> {
        let require = |value: Option<Decimal>, field: &'static str| {
            let price = value.ok_or(EngineError::MissingPrice { order_type, field })?;
            if price <= Decimal::ZERO {
                return Err(EngineError::InvalidPrice {
                    price,
                    reason: format!("{field} price must be positive"),
                });
            }
            Ok(price)
        };

        match order_type {
            OrderType::Market => Ok(OrderParams::Market),
            OrderType::Limit => Ok(OrderParams::Limit {
                price: require(limit_price, "limit")?,
            }),
            OrderType::Stop => Ok(OrderParams::Stop {
                stop: require(stop_price, "stop")?,
            }),
            OrderType::StopLimit => Ok(OrderParams::StopLimit {
                stop: require(stop_price, "stop")?,
                limit: require(limit_price, "limit")?,
            }),
            OrderType::TrailingStop => Ok(OrderParams::TrailingStop {
                trail: require(trail_amount, "trail")?,
            }),
        }
    }

    pub fn order_type(&self) -> OrderType {
        match self {
            OrderParams::Market => OrderType::Market,
            OrderParams::Limit { .. } => OrderType::Limit,
            OrderParams::Stop { .. } => OrderType::Stop,
            OrderParams::StopLimit { .. } => OrderType::StopLimit,
            OrderParams::TrailingStop { .. } => OrderType::TrailingStop,
        }
    }

    /// Snap every embedded price to the instrument grid.
    pub fn rounded(&self, instrument: &Instrument) -> OrderParams {
        match *self {
            OrderParams::Market => OrderParams::Market,
            OrderParams::Limit { price } => OrderParams::Limit {
                price: instrument.round_price(price),
            },
            OrderParams::Stop { stop } => OrderParams::Stop {
                stop: instrument.round_price(stop),
            },
            OrderParams::StopLimit { stop, limit } => OrderParams::StopLimit {
                stop: instrument.round_price(stop),
                limit: instrument.round_price(limit),
            },
            OrderParams::TrailingStop { trail } => OrderParams::TrailingStop {
                trail: instrument.round_price(trail),
            },
        }
    }

    /// Stop-family orders wait for a trigger before they execute.
    pub fn is_conditional(&self) -> bool {
        matches!(
            self,
            OrderParams::Stop { .. }
                | OrderParams::StopLimit { .. }
                | OrderParams::TrailingStop { .. }
        )
    }
}

/// Time in force
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeInForce {
    Day,
    Gtc,
    Ioc,
    Fok,
}

impl TimeInForce {
    /// IOC/FOK orders never rest.
    pub fn is_immediate(&self) -> bool {
        matches!(self, TimeInForce::Ioc | TimeInForce::Fok)
    }
}

impl fmt::Display for TimeInForce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeInForce::Day => write!(f, "DAY"),
            TimeInForce::Gtc => write!(f, "GTC"),
            TimeInForce::Ioc => write!(f, "IOC"),
            TimeInForce::Fok => write!(f, "FOK"),
        }
    }
}

/// Order status. Transitions are monotonic; see `can_transition_to`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Submitted,
    Working,
    Partial,
    Filled,
    Cancelled,
    Rejected,
    Expired,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled
                | OrderStatus::Cancelled
                | OrderStatus::Rejected
                | OrderStatus::Expired
        )
    }

    pub fn is_cancellable(&self) -> bool {
        matches!(self, OrderStatus::Working | OrderStatus::Partial)
    }

    pub fn is_modifiable(&self) -> bool {
        matches!(self, OrderStatus::Working | OrderStatus::Partial)
    }

    pub fn can_transition_to(&self, target: OrderStatus) -> bool {
        match self {
            OrderStatus::Pending => matches!(target, OrderStatus::Submitted),
            // market and IOC/FOK orders resolve without resting, so
            // Submitted can reach the fill/cancel terminals directly
            OrderStatus::Submitted => matches!(
                target,
                OrderStatus::Working
                    | OrderStatus::Rejected
                    | OrderStatus::Filled
                    | OrderStatus::Partial
                    | OrderStatus::Cancelled
            ),
            OrderStatus::Working => matches!(
                target,
                OrderStatus::Partial
                    | OrderStatus::Filled
                    | OrderStatus::Cancelled
                    | OrderStatus::Expired
            ),
            OrderStatus::Partial => matches!(target, OrderStatus::Filled | OrderStatus::Cancelled),
            OrderStatus::Filled
            | OrderStatus::Cancelled
            | OrderStatus::Rejected
            | OrderStatus::Expired => false,
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderStatus::Pending => write!(f, "PENDING"),
            OrderStatus::Submitted => write!(f, "SUBMITTED"),
            OrderStatus::Working => write!(f, "WORKING"),
            OrderStatus::Partial => write!(f, "PARTIAL"),
            OrderStatus::Filled => write!(f, "FILLED"),
            OrderStatus::Cancelled => write!(f, "CANCELLED"),
            OrderStatus::Rejected => write!(f, "REJECTED"),
            OrderStatus::Expired => write!(f, "EXPIRED"),
        }
    }
}

/// A resting or resolved order.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub account_id: AccountId,
    pub symbol: Symbol,
    pub side: Side,
    pub params: OrderParams,
    pub quantity: i64,
    pub filled_quantity: i64,
    pub avg_fill_price: Option<Decimal>,
    pub time_in_force: TimeInForce,
    pub status: OrderStatus,
    /// Live trigger price for stop-family orders; ratcheted for trailing
    /// stops, fixed for plain stops
    pub current_stop: Option<Decimal>,
    pub triggered_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Submission sequence within the owning book; FIFO tie-break for
    /// same-tick triggers
    pub seq: u64,
}

impl Order {
    pub fn new(
        id: Option<String>,
        account_id: AccountId,
        symbol: Symbol,
        side: Side,
        params: OrderParams,
        quantity: i64,
        time_in_force: TimeInForce,
        seq: u64,
    ) -> Result<Self, EngineError> {
        if quantity <= 0 {
            return Err(EngineError::InvalidQuantity { quantity });
        }
        let now = Utc::now();
        let id = id.unwrap_or_else(|| {
            format!("ORD_{}_{}", now.timestamp_millis(), nanoid::nanoid!(8))
        });
        let current_stop = match params {
            OrderParams::Stop { stop } | OrderParams::StopLimit { stop, .. } => Some(stop),
            // anchored by the owning book against the live price
            OrderParams::TrailingStop { .. } | OrderParams::Market | OrderParams::Limit { .. } => {
                None
            }
        };
        Ok(Self {
            id,
            account_id,
            symbol,
            side,
            params,
            quantity,
            filled_quantity: 0,
            avg_fill_price: None,
            time_in_force,
            status: OrderStatus::Pending,
            current_stop,
            triggered_at: None,
            created_at: now,
            updated_at: now,
            seq,
        })
    }

    pub fn order_type(&self) -> OrderType {
        self.params.order_type()
    }

    pub fn remaining(&self) -> i64 {
        self.quantity - self.filled_quantity
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Apply a status change, rejecting anything outside the state machine.
    pub fn transition_to(&mut self, target: OrderStatus) -> Result<(), EngineError> {
        if !self.status.can_transition_to(target) {
            return Err(EngineError::InvalidTransition {
                order_id: self.id.clone(),
                from: self.status,
                to: target,
            });
        }
        self.status = target;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Record a fill. The engine has no liquidity model, so fills normally
    /// cover the full remaining quantity; partial fills stay representable
    /// for multi-step trigger chains.
    pub fn apply_fill(&mut self, fill_quantity: i64, fill_price: Decimal) -> Result<(), EngineError> {
        if self.is_terminal() {
            return Err(EngineError::conflict(format!(
                "order {} is {} and cannot be filled",
                self.id, self.status
            )));
        }
        if fill_quantity <= 0 || fill_quantity > self.remaining() {
            return Err(EngineError::InvalidQuantity {
                quantity: fill_quantity,
            });
        }

        let prev = Decimal::from(self.filled_quantity);
        let add = Decimal::from(fill_quantity);
        self.avg_fill_price = Some(match self.avg_fill_price {
            Some(avg) => (avg * prev + fill_price * add) / (prev + add),
            None => fill_price,
        });
        self.filled_quantity += fill_quantity;

        let target = if self.remaining() == 0 {
            OrderStatus::Filled
        } else {
            OrderStatus::Partial
        };
        self.transition_to(target)
    }

    /// Cancel if cancellable; terminal orders are rejected, never ignored.
    pub fn cancel(&mut self) -> Result<(), EngineError> {
        if !(self.status.is_cancellable() || self.status == OrderStatus::Submitted) {
            return Err(EngineError::NotCancellable {
                order_id: self.id.clone(),
                status: self.status,
            });
        }
        self.transition_to(OrderStatus::Cancelled)
    }

    pub fn mark_triggered(&mut self, at: DateTime<Utc>) {
        self.triggered_at = Some(at);
        self.updated_at = at;
    }
}

impl fmt::Display for Order {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Order({} {} {} {}x{} status={} filled={}/{})",
            self.id,
            self.side,
            self.order_type(),
            self.symbol,
            self.quantity,
            self.status,
            self.filled_quantity,
            self.quantity,
        )
    }
}

/// Submission request, shaped for direct transport exposure.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OrderRequest {
    pub account_id: AccountId,
    pub symbol: String,
    pub order_type: OrderType,
    pub side: Side,
    pub quantity: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit_price: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_price: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trail_amount: Option<Decimal>,
    pub time_in_force: TimeInForce,
    /// Client-supplied idempotency key; resubmitting a known id returns the
    /// existing order instead of creating a duplicate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_order_id: Option<String>,
}

impl OrderRequest {
    pub fn params(&self) -> Result<OrderParams, EngineError> {
        OrderParams::from_request(
            self.order_type,
            self.limit_price,
            self.stop_price,
            self.trail_amount,
        )
    }
}

/// In-place modification of a working order.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OrderUpdate {
    pub account_id: AccountId,
    pub order_id: OrderId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit_price: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_price: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantity: Option<i64>,
}
