use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::{debug, info};
use uuid::Uuid;

use super::{retry, Storage};
use crate::config::DatabaseUrl;
use crate::domain::{Balance, Direction, Execution, Instrument, Order, OrderStatus, Trade, User};
use crate::error::{ExchangeError, Result};

const MIGRATION_SQL: &str = include_str!("../../migrations/001_init.sql");

const DEADLOCK_DETECTED: &str = "40P01";
const SERIALIZATION_FAILURE: &str = "40001";

fn db_error(e: sqlx::Error) -> ExchangeError {
    let retryable = match &e {
        sqlx::Error::Database(db) => matches!(
            db.code().as_deref(),
            Some(DEADLOCK_DETECTED) | Some(SERIALIZATION_FAILURE)
        ),
        _ => false,
    };
    ExchangeError::Storage {
        message: e.to_string(),
        retryable,
    }
}

#[derive(sqlx::FromRow)]
struct UserRow {
    id: Uuid,
    name: String,
    role: String,
    api_key: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<UserRow> for User {
    type Error = ExchangeError;

    fn try_from(row: UserRow) -> Result<Self> {
        Ok(User {
            id: row.id,
            name: row.name,
            role: row.role.parse()?,
            api_key: row.api_key,
            created_at: row.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct InstrumentRow {
    ticker: String,
    name: String,
    kind: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<InstrumentRow> for Instrument {
    type Error = ExchangeError;

    fn try_from(row: InstrumentRow) -> Result<Self> {
        Ok(Instrument {
            ticker: row.ticker,
            name: row.name,
            kind: row.kind.parse()?,
            created_at: row.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct OrderRow {
    id: Uuid,
    user_id: Uuid,
    ticker: String,
    direction: String,
    kind: String,
    qty: i64,
    price: Option<i64>,
    filled: i64,
    status: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<OrderRow> for Order {
    type Error = ExchangeError;

    fn try_from(row: OrderRow) -> Result<Self> {
        Ok(Order {
            id: row.id,
            user_id: row.user_id,
            ticker: row.ticker,
            direction: row.direction.parse()?,
            kind: row.kind.parse()?,
            qty: row.qty,
            price: row.price,
            filled: row.filled,
            status: row.status.parse()?,
            created_at: row.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct TradeRow {
    ticker: String,
    amount: i64,
    price: i64,
    buyer_id: Uuid,
    seller_id: Uuid,
    created_at: DateTime<Utc>,
}

impl From<TradeRow> for Trade {
    fn from(row: TradeRow) -> Self {
        Trade {
            ticker: row.ticker,
            amount: row.amount,
            price: row.price,
            buyer_id: row.buyer_id,
            seller_id: row.seller_id,
            created_at: row.created_at,
        }
    }
}

const ORDER_COLUMNS: &str =
    "id, user_id, ticker, direction, kind, qty, price, filled, status, created_at";

fn collect<R, T>(rows: Vec<R>) -> Result<Vec<T>>
where
    T: TryFrom<R, Error = ExchangeError>,
{
    rows.into_iter().map(T::try_from).collect()
}

/// PostgreSQL-backed storage.
pub struct PgStorage {
    pool: PgPool,
}

impl PgStorage {
    pub async fn connect(url: &DatabaseUrl, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(&url.connection_string())
            .await
            .map_err(db_error)?;
        info!("Connected to PostgreSQL at {}", url);
        Ok(Self { pool })
    }

    async fn commit_once(&self, execution: &Execution) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;
        let order = &execution.order;

        sqlx::query(&format!(
            "INSERT INTO orders ({ORDER_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)"
        ))
        .bind(order.id)
        .bind(order.user_id)
        .bind(&order.ticker)
        .bind(order.direction.as_str())
        .bind(order.kind.as_str())
        .bind(order.qty)
        .bind(order.price)
        .bind(order.filled)
        .bind(order.status.as_str())
        .bind(order.created_at)
        .execute(&mut *tx)
        .await
        .map_err(db_error)?;

        for update in &execution.maker_updates {
            let result = sqlx::query("UPDATE orders SET filled = $2, status = $3 WHERE id = $1")
                .bind(update.order_id)
                .bind(update.filled)
                .bind(update.status.as_str())
                .execute(&mut *tx)
                .await
                .map_err(db_error)?;
            if result.rows_affected() == 0 {
                return Err(ExchangeError::storage(format!(
                    "maker order {} does not exist",
                    update.order_id
                )));
            }
        }

        for trade in &execution.trades {
            sqlx::query(
                "INSERT INTO transactions (ticker, amount, price, buyer_id, seller_id, created_at) \
                 VALUES ($1, $2, $3, $4, $5, $6)",
            )
            .bind(&trade.ticker)
            .bind(trade.amount)
            .bind(trade.price)
            .bind(trade.buyer_id)
            .bind(trade.seller_id)
            .bind(trade.created_at)
            .execute(&mut *tx)
            .await
            .map_err(db_error)?;
        }

        // Deltas arrive sorted by (user, ticker) so concurrent commits lock rows in one order.
        for delta in &execution.balance_deltas {
            sqlx::query(
                "INSERT INTO balances (user_id, ticker, amount) VALUES ($1, $2, $3) \
                 ON CONFLICT (user_id, ticker) DO UPDATE SET amount = balances.amount + EXCLUDED.amount",
            )
            .bind(delta.user_id)
            .bind(&delta.ticker)
            .bind(delta.amount)
            .execute(&mut *tx)
            .await
            .map_err(db_error)?;
        }

        tx.commit().await.map_err(db_error)?;
        debug!(
            "Committed order {} with {} trades",
            order.id,
            execution.trades.len()
        );
        Ok(())
    }
}

#[async_trait]
impl Storage for PgStorage {
    async fn create_user(&self, user: &User) -> Result<()> {
        sqlx::query(
            "INSERT INTO users (id, name, role, api_key, created_at) VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(user.id)
        .bind(&user.name)
        .bind(user.role.as_str())
        .bind(&user.api_key)
        .bind(user.created_at)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(())
    }

    async fn get_user_by_id(&self, user_id: Uuid) -> Result<Option<User>> {
        sqlx::query_as::<_, UserRow>(
            "SELECT id, name, role, api_key, created_at FROM users WHERE id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?
        .map(User::try_from)
        .transpose()
    }

    async fn get_user_by_api_key(&self, api_key: &str) -> Result<Option<User>> {
        sqlx::query_as::<_, UserRow>(
            "SELECT id, name, role, api_key, created_at FROM users WHERE api_key = $1",
        )
        .bind(api_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?
        .map(User::try_from)
        .transpose()
    }

    async fn delete_user(&self, user_id: Uuid) -> Result<Option<User>> {
        retry::with_retry("delete_user", move || async move {
            sqlx::query_as::<_, UserRow>(
                "DELETE FROM users WHERE id = $1 RETURNING id, name, role, api_key, created_at",
            )
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?
            .map(User::try_from)
            .transpose()
        })
        .await
    }

    async fn create_instrument(&self, instrument: &Instrument) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO instruments (ticker, name, kind, created_at) VALUES ($1, $2, $3, $4) \
             ON CONFLICT (ticker) DO NOTHING",
        )
        .bind(&instrument.ticker)
        .bind(&instrument.name)
        .bind(instrument.kind.as_str())
        .bind(instrument.created_at)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(result.rows_affected() == 1)
    }

    async fn get_instrument(&self, ticker: &str) -> Result<Option<Instrument>> {
        sqlx::query_as::<_, InstrumentRow>(
            "SELECT ticker, name, kind, created_at FROM instruments WHERE ticker = $1",
        )
        .bind(ticker)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?
        .map(Instrument::try_from)
        .transpose()
    }

    async fn list_instruments(&self) -> Result<Vec<Instrument>> {
        let rows = sqlx::query_as::<_, InstrumentRow>(
            "SELECT ticker, name, kind, created_at FROM instruments ORDER BY created_at, ticker",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;
        collect(rows)
    }

    async fn delete_instrument(&self, ticker: &str) -> Result<bool> {
        retry::with_retry("delete_instrument", move || async move {
            let result = sqlx::query("DELETE FROM instruments WHERE ticker = $1")
                .bind(ticker)
                .execute(&self.pool)
                .await
                .map_err(db_error)?;
            Ok(result.rows_affected() > 0)
        })
        .await
    }

    async fn get_balances(&self, user_id: Uuid) -> Result<Vec<Balance>> {
        let rows = sqlx::query_as::<_, (Uuid, String, i64)>(
            "SELECT user_id, ticker, amount FROM balances WHERE user_id = $1 ORDER BY ticker",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(rows
            .into_iter()
            .map(|(user_id, ticker, amount)| Balance {
                user_id,
                ticker,
                amount,
            })
            .collect())
    }

    async fn get_balance(&self, user_id: Uuid, ticker: &str) -> Result<i64> {
        let amount = sqlx::query_scalar::<_, i64>(
            "SELECT amount FROM balances WHERE user_id = $1 AND ticker = $2",
        )
        .bind(user_id)
        .bind(ticker)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(amount.unwrap_or(0))
    }

    async fn adjust_balance(&self, user_id: Uuid, ticker: &str, delta: i64) -> Result<i64> {
        retry::with_retry("adjust_balance", move || async move {
            sqlx::query_scalar::<_, i64>(
                "INSERT INTO balances (user_id, ticker, amount) VALUES ($1, $2, $3) \
                 ON CONFLICT (user_id, ticker) DO UPDATE SET amount = balances.amount + EXCLUDED.amount \
                 RETURNING amount",
            )
            .bind(user_id)
            .bind(ticker)
            .bind(delta)
            .fetch_one(&self.pool)
            .await
            .map_err(db_error)
        })
        .await
    }

    async fn get_order(&self, order_id: Uuid) -> Result<Option<Order>> {
        sqlx::query_as::<_, OrderRow>(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders WHERE id = $1"
        ))
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?
        .map(Order::try_from)
        .transpose()
    }

    async fn list_orders_for_user(&self, user_id: Uuid) -> Result<Vec<Order>> {
        let rows = sqlx::query_as::<_, OrderRow>(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders WHERE user_id = $1 ORDER BY created_at"
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;
        collect(rows)
    }

    async fn resting_orders(&self, ticker: &str, direction: Direction) -> Result<Vec<Order>> {
        let rows = sqlx::query_as::<_, OrderRow>(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders \
             WHERE ticker = $1 AND direction = $2 AND kind = 'LIMIT' \
             AND status IN ('NEW', 'PARTIALLY_EXECUTED')"
        ))
        .bind(ticker)
        .bind(direction.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;
        collect(rows)
    }

    async fn resting_orders_for_user(&self, user_id: Uuid) -> Result<Vec<Order>> {
        let rows = sqlx::query_as::<_, OrderRow>(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders \
             WHERE user_id = $1 AND kind = 'LIMIT' AND status IN ('NEW', 'PARTIALLY_EXECUTED')"
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;
        collect(rows)
    }

    async fn update_order_status(&self, order_id: Uuid, status: OrderStatus) -> Result<()> {
        let result = sqlx::query("UPDATE orders SET status = $2 WHERE id = $1")
            .bind(order_id)
            .bind(status.as_str())
            .execute(&self.pool)
            .await
            .map_err(db_error)?;
        if result.rows_affected() == 0 {
            return Err(ExchangeError::NotFound("order not found".to_string()));
        }
        Ok(())
    }

    async fn commit_execution(&self, execution: &Execution) -> Result<()> {
        retry::with_retry("commit_execution", move || self.commit_once(execution)).await
    }

    async fn recent_trades(&self, ticker: &str, limit: usize) -> Result<Vec<Trade>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = sqlx::query_as::<_, TradeRow>(
            "SELECT ticker, amount, price, buyer_id, seller_id, created_at FROM transactions \
             WHERE ticker = $1 ORDER BY created_at DESC, id DESC LIMIT $2",
        )
        .bind(ticker)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(rows.into_iter().map(Trade::from).collect())
    }

    async fn migrate(&self) -> Result<()> {
        info!("Running database migrations...");
        for statement in MIGRATION_SQL
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
        {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(db_error)?;
        }
        info!("Database migrations completed successfully");
        Ok(())
    }
}
