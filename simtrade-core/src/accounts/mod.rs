//! Account cash and margin state

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::orders::AccountId;

/// Persisted account state. Equity (balance + unrealized P&L) is derived on
/// query and never stored.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    /// Cash balance; realized P&L folds in here immediately on closing fills
    pub balance: Decimal,
    /// Margin reserved by open positions
    pub margin_used: Decimal,
}

impl Account {
    pub fn new(id: impl Into<AccountId>, balance: Decimal) -> Self {
        Self {
            id: id.into(),
            balance,
            margin_used: Decimal::ZERO,
        }
    }

    /// Margin headroom left for new exposure. `margin_used <= balance` is a
    /// soft constraint checked at submission time only.
    pub fn margin_available(&self) -> Decimal {
        self.balance - self.margin_used
    }
}
