//! Durable state boundary
//!
//! The engine never chooses a storage technology; it depends on these
//! traits and ships DashMap-backed in-memory implementations for tests and
//! single-process deployments. Order status CAS and per-account balance
//! deltas are the two operations that need transactional discipline when
//! several engine instances share a store.

use async_trait::async_trait;
use dashmap::DashMap;
use rust_decimal::Decimal;

use crate::accounts::Account;
use crate::errors::StoreError;
use crate::instruments::Symbol;
use crate::orders::{Order, OrderStatus};

#[async_trait]
pub trait OrderStore: Send + Sync {
    /// Insert or overwrite an order record.
    async fn save_order(&self, order: &Order) -> Result<(), StoreError>;

    async fn load_order(&self, id: &str) -> Result<Option<Order>, StoreError>;

    /// Atomically move an order to `next` only if it is still in
    /// `expected`. Returns false when the guard fails.
    async fn compare_and_swap_status(
        &self,
        id: &str,
        expected: OrderStatus,
        next: OrderStatus,
    ) -> Result<bool, StoreError>;

    /// All orders for one `(account, symbol)` book, any status.
    async fn orders_for_book(
        &self,
        account_id: &str,
        symbol: &Symbol,
    ) -> Result<Vec<Order>, StoreError>;

    /// Record a terminally resolved order. In-memory storage keeps it
    /// queryable; a real backend may move it to cold storage.
    async fn archive_order(&self, order: &Order) -> Result<(), StoreError>;
}

#[async_trait]
pub trait AccountStore: Send + Sync {
    async fn create_account(&self, account: Account) -> Result<(), StoreError>;

    async fn load_account(&self, id: &str) -> Result<Option<Account>, StoreError>;

    /// Atomically apply a cash delta (realized P&L) and return the updated
    /// account.
    async fn apply_balance_delta(&self, id: &str, delta: Decimal) -> Result<Account, StoreError>;

    /// Replace the margin reservation for an account.
    async fn set_margin_used(&self, id: &str, margin_used: Decimal) -> Result<(), StoreError>;
}

/// In-memory order store.
#[derive(Debug, Default)]
pub struct MemoryOrderStore {
    orders: DashMap<String, Order>,
}

impl MemoryOrderStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OrderStore for MemoryOrderStore {
    async fn save_order(&self, order: &Order) -> Result<(), StoreError> {
        self.orders.insert(order.id.clone(), order.clone());
        Ok(())
    }

    async fn load_order(&self, id: &str) -> Result<Option<Order>, StoreError> {
        Ok(self.orders.get(id).map(|o| o.clone()))
    }

    async fn compare_and_swap_status(
        &self,
        id: &str,
        expected: OrderStatus,
        next: OrderStatus,
    ) -> Result<bool, StoreError> {
        match self.orders.get_mut(id) {
            Some(mut entry) => {
                if entry.status != expected {
                    return Ok(false);
                }
                entry.status = next;
                entry.updated_at = chrono::Utc::now();
                Ok(true)
            }
            None => Err(StoreError::NotFound {
                entity: "order",
                id: id.to_string(),
            }),
        }
    }

    async fn orders_for_book(
        &self,
        account_id: &str,
        symbol: &Symbol,
    ) -> Result<Vec<Order>, StoreError> {
        let mut orders: Vec<Order> = self
            .orders
            .iter()
            .filter(|entry| entry.account_id == account_id && &entry.symbol == symbol)
            .map(|entry| entry.clone())
            .collect();
        orders.sort_by_key(|o| o.seq);
        Ok(orders)
    }

    async fn archive_order(&self, order: &Order) -> Result<(), StoreError> {
        self.save_order(order).await
    }
}

/// In-memory account store.
#[derive(Debug, Default)]
pub struct MemoryAccountStore {
    accounts: DashMap<String, Account>,
}

impl MemoryAccountStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AccountStore for MemoryAccountStore {
    async fn create_account(&self, account: Account) -> Result<(), StoreError> {
        self.accounts.insert(account.id.clone(), account);
        Ok(())
    }

    async fn load_account(&self, id: &str) -> Result<Option<Account>, StoreError> {
        Ok(self.accounts.get(id).map(|a| a.clone()))
    }

    async fn apply_balance_delta(&self, id: &str, delta: Decimal) -> Result<Account, StoreError> {
        match self.accounts.get_mut(id) {
            Some(mut entry) => {
                entry.balance += delta;
                Ok(entry.clone())
            }
            None => Err(StoreError::NotFound {
                entity: "account",
                id: id.to_string(),
            }),
        }
    }

    async fn set_margin_used(&self, id: &str, margin_used: Decimal) -> Result<(), StoreError> {
        match self.accounts.get_mut(id) {
            Some(mut entry) => {
                entry.margin_used = margin_used;
                Ok(())
            }
            None => Err(StoreError::NotFound {
                entity: "account",
                id: id.to_string(),
            }),
        }
    }
}
