//! Persistence boundary for the exchange.

pub mod in_memory;
#[cfg(feature = "db")]
pub mod postgres;
pub mod retry;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;
use uuid::Uuid;

use crate::config::{DatabaseConfig, DatabaseUrl};
use crate::domain::{Balance, Direction, Execution, Instrument, Order, OrderStatus, Trade, User};
use crate::error::Result;

pub use in_memory::InMemoryStorage;
#[cfg(feature = "db")]
pub use postgres::PgStorage;

/// Storage trait for persisting users, instruments, balances, orders and trades.
#[async_trait]
pub trait Storage: Send + Sync {
    // User operations
    async fn create_user(&self, user: &User) -> Result<()>;
    async fn get_user_by_id(&self, user_id: Uuid) -> Result<Option<User>>;
    async fn get_user_by_api_key(&self, api_key: &str) -> Result<Option<User>>;
    /// Removes the user together with their trades, balances and orders.
    async fn delete_user(&self, user_id: Uuid) -> Result<Option<User>>;

    // Instrument operations
    /// Returns `false` when the ticker is already listed.
    async fn create_instrument(&self, instrument: &Instrument) -> Result<bool>;
    async fn get_instrument(&self, ticker: &str) -> Result<Option<Instrument>>;
    async fn list_instruments(&self) -> Result<Vec<Instrument>>;
    /// Removes the instrument together with its balances, orders and trades.
    async fn delete_instrument(&self, ticker: &str) -> Result<bool>;

    // Balance operations
    async fn get_balances(&self, user_id: Uuid) -> Result<Vec<Balance>>;
    async fn get_balance(&self, user_id: Uuid, ticker: &str) -> Result<i64>;
    /// Adds `delta` to the balance, creating it when absent. Returns the new amount.
    async fn adjust_balance(&self, user_id: Uuid, ticker: &str, delta: i64) -> Result<i64>;

    // Order operations
    async fn get_order(&self, order_id: Uuid) -> Result<Option<Order>>;
    async fn list_orders_for_user(&self, user_id: Uuid) -> Result<Vec<Order>>;
    /// Resting limit orders for one side of one instrument, in no particular order.
    async fn resting_orders(&self, ticker: &str, direction: Direction) -> Result<Vec<Order>>;
    /// Resting limit orders of one user across all instruments.
    async fn resting_orders_for_user(&self, user_id: Uuid) -> Result<Vec<Order>>;
    async fn update_order_status(&self, order_id: Uuid, status: OrderStatus) -> Result<()>;

    /// Persists a placed order with every maker update, trade and balance
    /// change it caused. Either all of it is stored or none of it.
    async fn commit_execution(&self, execution: &Execution) -> Result<()>;

    // Trade operations
    async fn recent_trades(&self, ticker: &str, limit: usize) -> Result<Vec<Trade>>;

    /// Creates or upgrades the schema. A no-op for stores without one.
    async fn migrate(&self) -> Result<()> {
        Ok(())
    }
}

/// Opens the store selected by the configured database URL.
pub async fn connect(config: &DatabaseConfig) -> Result<Arc<dyn Storage>> {
    match config.parsed_url()? {
        None => {
            info!("No DATABASE_URL configured, using in-memory storage");
            Ok(Arc::new(InMemoryStorage::new()))
        }
        Some(url) => connect_url(&url, config).await,
    }
}

#[cfg(feature = "db")]
async fn connect_url(url: &DatabaseUrl, config: &DatabaseConfig) -> Result<Arc<dyn Storage>> {
    info!("Connecting to PostgreSQL at {}", url);
    let storage = PgStorage::connect(url, config.max_connections).await?;
    Ok(Arc::new(storage))
}

#[cfg(not(feature = "db"))]
async fn connect_url(url: &DatabaseUrl, _config: &DatabaseConfig) -> Result<Arc<dyn Storage>> {
    Err(crate::error::ExchangeError::Config(format!(
        "DATABASE_URL points at {url} but this build has no `db` feature"
    )))
}
