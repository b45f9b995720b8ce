use super::Storage;
use crate::domain::{Balance, Direction, Execution, Instrument, Order, OrderStatus, Trade, User};
use crate::error::{ExchangeError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tracing::debug;
use uuid::Uuid;

#[derive(Default)]
struct Tables {
    users: HashMap<Uuid, User>,
    instruments: HashMap<String, Instrument>,
    balances: HashMap<(Uuid, String), i64>,
    orders: HashMap<Uuid, Order>,
    trades: Vec<Trade>,
}

/// In-memory storage implementation for development/testing.
///
/// All tables sit behind one mutex so a committed execution is visible
/// either completely or not at all.
pub struct InMemoryStorage {
    tables: Mutex<Tables>,
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Tables>> {
        self.tables
            .lock()
            .map_err(|_| ExchangeError::storage("in-memory store mutex poisoned"))
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn create_user(&self, user: &User) -> Result<()> {
        let mut tables = self.lock()?;
        if tables.users.values().any(|u| u.api_key == user.api_key) {
            return Err(ExchangeError::storage("api key already in use"));
        }
        tables.users.insert(user.id, user.clone());
        debug!("Created user: {} with id {}", user.name, user.id);
        Ok(())
    }

    async fn get_user_by_id(&self, user_id: Uuid) -> Result<Option<User>> {
        Ok(self.lock()?.users.get(&user_id).cloned())
    }

    async fn get_user_by_api_key(&self, api_key: &str) -> Result<Option<User>> {
        let tables = self.lock()?;
        Ok(tables.users.values().find(|u| u.api_key == api_key).cloned())
    }

    async fn delete_user(&self, user_id: Uuid) -> Result<Option<User>> {
        let mut tables = self.lock()?;
        let Some(user) = tables.users.remove(&user_id) else {
            return Ok(None);
        };
        tables
            .trades
            .retain(|t| t.buyer_id != user_id && t.seller_id != user_id);
        tables.balances.retain(|(owner, _), _| *owner != user_id);
        tables.orders.retain(|_, o| o.user_id != user_id);
        debug!("Deleted user {} with dependent rows", user_id);
        Ok(Some(user))
    }

    async fn create_instrument(&self, instrument: &Instrument) -> Result<bool> {
        let mut tables = self.lock()?;
        if tables.instruments.contains_key(&instrument.ticker) {
            return Ok(false);
        }
        tables
            .instruments
            .insert(instrument.ticker.clone(), instrument.clone());
        debug!("Created instrument: {}", instrument.ticker);
        Ok(true)
    }

    async fn get_instrument(&self, ticker: &str) -> Result<Option<Instrument>> {
        Ok(self.lock()?.instruments.get(ticker).cloned())
    }

    async fn list_instruments(&self) -> Result<Vec<Instrument>> {
        let tables = self.lock()?;
        let mut instruments: Vec<Instrument> = tables.instruments.values().cloned().collect();
        instruments.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.ticker.cmp(&b.ticker)));
        Ok(instruments)
    }

    async fn delete_instrument(&self, ticker: &str) -> Result<bool> {
        let mut tables = self.lock()?;
        if tables.instruments.remove(ticker).is_none() {
            return Ok(false);
        }
        tables.balances.retain(|(_, t), _| t != ticker);
        tables.orders.retain(|_, o| o.ticker != ticker);
        tables.trades.retain(|t| t.ticker != ticker);
        debug!("Deleted instrument {} with dependent rows", ticker);
        Ok(true)
    }

    async fn get_balances(&self, user_id: Uuid) -> Result<Vec<Balance>> {
        let tables = self.lock()?;
        let mut balances: Vec<Balance> = tables
            .balances
            .iter()
            .filter(|((owner, _), _)| *owner == user_id)
            .map(|((owner, ticker), amount)| Balance {
                user_id: *owner,
                ticker: ticker.clone(),
                amount: *amount,
            })
            .collect();
        balances.sort_by(|a, b| a.ticker.cmp(&b.ticker));
        Ok(balances)
    }

    async fn get_balance(&self, user_id: Uuid, ticker: &str) -> Result<i64> {
        let tables = self.lock()?;
        Ok(tables
            .balances
            .get(&(user_id, ticker.to_string()))
            .copied()
            .unwrap_or(0))
    }

    async fn adjust_balance(&self, user_id: Uuid, ticker: &str, delta: i64) -> Result<i64> {
        let mut tables = self.lock()?;
        let amount = tables.balances.entry((user_id, ticker.to_string())).or_insert(0);
        *amount = amount
            .checked_add(delta)
            .ok_or_else(|| ExchangeError::Validation("balance overflows".to_string()))?;
        Ok(*amount)
    }

    async fn get_order(&self, order_id: Uuid) -> Result<Option<Order>> {
        Ok(self.lock()?.orders.get(&order_id).cloned())
    }

    async fn list_orders_for_user(&self, user_id: Uuid) -> Result<Vec<Order>> {
        let tables = self.lock()?;
        let mut orders: Vec<Order> = tables
            .orders
            .values()
            .filter(|o| o.user_id == user_id)
            .cloned()
            .collect();
        orders.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(orders)
    }

    async fn resting_orders(&self, ticker: &str, direction: Direction) -> Result<Vec<Order>> {
        let tables = self.lock()?;
        Ok(tables
            .orders
            .values()
            .filter(|o| o.ticker == ticker && o.direction == direction && o.is_resting())
            .cloned()
            .collect())
    }

    async fn resting_orders_for_user(&self, user_id: Uuid) -> Result<Vec<Order>> {
        let tables = self.lock()?;
        Ok(tables
            .orders
            .values()
            .filter(|o| o.user_id == user_id && o.is_resting())
            .cloned()
            .collect())
    }

    async fn update_order_status(&self, order_id: Uuid, status: OrderStatus) -> Result<()> {
        let mut tables = self.lock()?;
        let order = tables
            .orders
            .get_mut(&order_id)
            .ok_or_else(|| ExchangeError::storage(format!("order {order_id} does not exist")))?;
        order.status = status;
        Ok(())
    }

    async fn commit_execution(&self, execution: &Execution) -> Result<()> {
        let mut tables = self.lock()?;

        // Validate before mutating so a failure leaves every table untouched.
        for update in &execution.maker_updates {
            if !tables.orders.contains_key(&update.order_id) {
                return Err(ExchangeError::storage(format!(
                    "maker order {} does not exist",
                    update.order_id
                )));
            }
        }
        let mut balances = Vec::with_capacity(execution.balance_deltas.len());
        for delta in &execution.balance_deltas {
            let key = (delta.user_id, delta.ticker.clone());
            let current = tables.balances.get(&key).copied().unwrap_or(0);
            let amount = current
                .checked_add(delta.amount)
                .ok_or_else(|| ExchangeError::Validation("balance overflows".to_string()))?;
            balances.push((key, amount));
        }

        tables
            .orders
            .insert(execution.order.id, execution.order.clone());
        for update in &execution.maker_updates {
            if let Some(maker) = tables.orders.get_mut(&update.order_id) {
                maker.filled = update.filled;
                maker.status = update.status;
            }
        }
        tables.trades.extend(execution.trades.iter().cloned());
        tables.balances.extend(balances);

        debug!(
            "Committed order {} with {} trades",
            execution.order.id,
            execution.trades.len()
        );
        Ok(())
    }

    async fn recent_trades(&self, ticker: &str, limit: usize) -> Result<Vec<Trade>> {
        let tables = self.lock()?;
        // Trades are appended in execution order, newest last.
        Ok(tables
            .trades
            .iter()
            .rev()
            .filter(|t| t.ticker == ticker)
            .take(limit)
            .cloned()
            .collect())
    }
}
