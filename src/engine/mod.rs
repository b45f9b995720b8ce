//! The exchange service: accounts, instruments, balances and order flow on
//! top of a [`Storage`] backend.

pub mod book;
pub mod matching;
pub mod settlement;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{ExchangeConfig, SeedInstrument};
use crate::domain::{
    Direction, Execution, Instrument, InstrumentKind, L2OrderBook, Order, OrderKind, OrderStatus,
    Trade, User, UserRole, QUOTE_TICKER,
};
use crate::error::{ExchangeError, Result};
use crate::metrics::ExchangeMetrics;
use crate::storage::Storage;

static TICKER_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Z]{2,10}$").expect("ticker pattern is valid"));

pub const MIN_USER_NAME_LEN: usize = 3;

/// What a user asks the engine to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderRequest {
    pub direction: Direction,
    pub ticker: String,
    pub qty: i64,
    /// `Some` for a limit order, `None` for a market order.
    pub price: Option<i64>,
}

impl OrderRequest {
    pub fn kind(&self) -> OrderKind {
        if self.price.is_some() {
            OrderKind::Limit
        } else {
            OrderKind::Market
        }
    }
}

pub fn validate_ticker(ticker: &str) -> Result<()> {
    if TICKER_PATTERN.is_match(ticker) {
        Ok(())
    } else {
        Err(ExchangeError::Validation(format!(
            "ticker '{ticker}' must be 2 to 10 upper-case latin letters"
        )))
    }
}

pub fn generate_api_key() -> String {
    format!("key-{}", Uuid::new_v4())
}

pub struct Exchange {
    storage: Arc<dyn Storage>,
    settings: ExchangeConfig,
    /// Serializes every operation that reads available funds or the book and
    /// then writes, so no two of them interleave.
    ledger: Mutex<()>,
}

impl Exchange {
    pub fn new(storage: Arc<dyn Storage>, settings: ExchangeConfig) -> Self {
        Self {
            storage,
            settings,
            ledger: Mutex::new(()),
        }
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    /// Ensures the admin account and the seed instruments exist.
    pub async fn bootstrap(&self, admin_token: &str) -> Result<()> {
        if self.storage.get_user_by_api_key(admin_token).await?.is_none() {
            let admin = User {
                id: Uuid::new_v4(),
                name: "Admin".to_string(),
                role: UserRole::Admin,
                api_key: admin_token.to_string(),
                created_at: Utc::now(),
            };
            self.storage.create_user(&admin).await?;
            info!("Created admin user {}", admin.id);
        }

        for seed in &self.settings.seed_instruments {
            self.ensure_instrument(seed).await?;
        }
        info!("Base instruments initialized");
        Ok(())
    }

    async fn ensure_instrument(&self, seed: &SeedInstrument) -> Result<()> {
        if self.storage.get_instrument(&seed.ticker).await?.is_some() {
            return Ok(());
        }
        let instrument = Instrument {
            ticker: seed.ticker.clone(),
            name: seed.name.clone(),
            kind: seed.kind,
            created_at: Utc::now(),
        };
        if self.storage.create_instrument(&instrument).await? {
            info!("Created base instrument {}", seed.ticker);
        }
        Ok(())
    }

    // ----- accounts -------------------------------------------------------

    pub async fn register(&self, name: &str) -> Result<User> {
        if name.chars().count() < MIN_USER_NAME_LEN {
            return Err(ExchangeError::Validation(format!(
                "name must be at least {MIN_USER_NAME_LEN} characters"
            )));
        }
        let user = User {
            id: Uuid::new_v4(),
            name: name.to_string(),
            role: UserRole::User,
            api_key: generate_api_key(),
            created_at: Utc::now(),
        };
        self.storage.create_user(&user).await?;
        info!(user_id = %user.id, "Registered user");
        Ok(user)
    }

    /// Resolves an `Authorization: TOKEN <api_key>` header to a user.
    pub async fn authenticate(&self, header: Option<&str>) -> Result<User> {
        let header = header
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .ok_or_else(|| ExchangeError::Unauthorized("authorization required".to_string()))?;

        let api_key = match header.split_once(' ') {
            Some(("TOKEN", key)) if !key.trim().is_empty() => key.trim(),
            _ => {
                return Err(ExchangeError::Unauthorized(
                    "invalid token format, expected 'TOKEN <api_key>'".to_string(),
                ))
            }
        };

        self.storage
            .get_user_by_api_key(api_key)
            .await?
            .ok_or_else(|| ExchangeError::Unauthorized("invalid token".to_string()))
    }

    pub fn require_admin(user: &User) -> Result<()> {
        if user.is_admin() {
            Ok(())
        } else {
            Err(ExchangeError::Forbidden(
                "administrator rights required".to_string(),
            ))
        }
    }

    // ----- market data ----------------------------------------------------

    pub async fn list_instruments(&self) -> Result<Vec<Instrument>> {
        self.storage.list_instruments().await
    }

    pub async fn orderbook(&self, ticker: &str, limit: Option<i64>) -> Result<L2OrderBook> {
        let depth = clamp_limit(
            limit,
            self.settings.orderbook_default_depth,
            self.settings.orderbook_max_depth,
        )?;
        let bids = self.storage.resting_orders(ticker, Direction::Buy).await?;
        let asks = self.storage.resting_orders(ticker, Direction::Sell).await?;
        Ok(L2OrderBook {
            bid_levels: book::aggregate(&bids, Direction::Buy, depth),
            ask_levels: book::aggregate(&asks, Direction::Sell, depth),
        })
    }

    pub async fn transactions(&self, ticker: &str, limit: Option<i64>) -> Result<Vec<Trade>> {
        let limit = clamp_limit(
            limit,
            self.settings.transactions_default_limit,
            self.settings.transactions_max_limit,
        )?;
        self.storage.recent_trades(ticker, limit).await
    }

    // ----- balances -------------------------------------------------------

    pub async fn balances(&self, user: &User) -> Result<BTreeMap<String, i64>> {
        Ok(self
            .storage
            .get_balances(user.id)
            .await?
            .into_iter()
            .map(|b| (b.ticker, b.amount))
            .collect())
    }

    /// Balance minus what the user's resting orders have reserved: open
    /// limit buys hold `remaining * price` of the quote currency, open sells
    /// hold their remaining quantity of the instrument.
    pub async fn available(&self, user_id: Uuid, ticker: &str) -> Result<i64> {
        let balance = self.storage.get_balance(user_id, ticker).await?;
        let mut reserved: i64 = 0;
        for order in self.storage.resting_orders_for_user(user_id).await? {
            let hold = match order.direction {
                Direction::Buy if ticker == QUOTE_TICKER => order
                    .remaining()
                    .checked_mul(order.price.unwrap_or(0))
                    .ok_or_else(|| ExchangeError::storage("reserved amount overflows"))?,
                Direction::Sell if order.ticker == ticker => order.remaining(),
                _ => 0,
            };
            reserved = reserved.saturating_add(hold);
        }
        Ok(balance - reserved)
    }

    // ----- orders ---------------------------------------------------------

    pub async fn place_order(&self, user: &User, request: OrderRequest) -> Result<Uuid> {
        let result = self.place_order_inner(user, request).await;
        match &result {
            Ok(_) => {}
            Err(ExchangeError::InsufficientFunds(_)) => {
                ExchangeMetrics::record_order_rejected("insufficient_funds")
            }
            Err(ExchangeError::Validation(_)) | Err(ExchangeError::BadRequest(_)) => {
                ExchangeMetrics::record_order_rejected("invalid")
            }
            Err(e) => {
                ExchangeMetrics::record_order_rejected("internal");
                debug!("Order placement failed: {}", e);
            }
        }
        result
    }

    async fn place_order_inner(&self, user: &User, request: OrderRequest) -> Result<Uuid> {
        let started = Instant::now();
        if request.qty < 1 {
            return Err(ExchangeError::Validation(
                "qty must be greater than or equal to 1".to_string(),
            ));
        }
        if let Some(price) = request.price {
            if price <= 0 {
                return Err(ExchangeError::Validation(
                    "price must be greater than 0".to_string(),
                ));
            }
        }
        if request.ticker == QUOTE_TICKER {
            return Err(ExchangeError::BadRequest(format!(
                "{QUOTE_TICKER} is the quote currency and cannot be traded against itself"
            )));
        }

        let _ledger = self.ledger.lock().await;

        // Both may have been deleted since the request was authenticated.
        if self.storage.get_user_by_id(user.id).await?.is_none() {
            return Err(ExchangeError::Unauthorized("invalid token".to_string()));
        }
        if self.storage.get_instrument(&request.ticker).await?.is_none() {
            return Err(ExchangeError::BadRequest("instrument not found".to_string()));
        }

        let mut book = self
            .storage
            .resting_orders(&request.ticker, request.direction.opposite())
            .await?;
        matching::sort_by_priority(&mut book, request.direction);

        self.check_funds(user, &request, &book).await?;

        let now = Utc::now();
        let mut order = Order {
            id: Uuid::new_v4(),
            user_id: user.id,
            ticker: request.ticker.clone(),
            direction: request.direction,
            kind: request.kind(),
            qty: request.qty,
            price: request.price,
            filled: 0,
            status: OrderStatus::New,
            created_at: now,
        };

        let fills = matching::match_order(&mut order, &mut book);
        let execution = Execution {
            maker_updates: matching::maker_updates(&book, &fills),
            trades: settlement::trades_for(&order, &fills, now),
            balance_deltas: settlement::balance_deltas(&order, &fills)?,
            order,
        };
        for delta in execution.balance_deltas.iter().filter(|d| d.amount > 0) {
            self.credited_balance(delta.user_id, &delta.ticker, delta.amount)
                .await?;
        }

        self.storage.commit_execution(&execution).await?;

        let volume: i64 = fills.iter().map(|f| f.qty).sum();
        ExchangeMetrics::record_order_placed(
            execution.order.kind,
            execution.order.direction,
            started.elapsed(),
        );
        if !fills.is_empty() {
            ExchangeMetrics::record_trades(fills.len(), volume);
        }
        info!(
            order_id = %execution.order.id,
            ticker = %execution.order.ticker,
            direction = %execution.order.direction,
            kind = %execution.order.kind,
            status = %execution.order.status,
            fills = fills.len(),
            "Order placed"
        );
        Ok(execution.order.id)
    }

    async fn check_funds(&self, user: &User, request: &OrderRequest, book: &[Order]) -> Result<()> {
        match request.direction {
            Direction::Buy => {
                let cost = match request.price {
                    Some(price) => request.qty.checked_mul(price),
                    None => matching::market_cost(book, request.qty),
                }
                .ok_or_else(|| ExchangeError::Validation("order value overflows".to_string()))?;
                if self.available(user.id, QUOTE_TICKER).await? < cost {
                    warn!(user_id = %user.id, cost, "Rejected buy: insufficient funds");
                    return Err(ExchangeError::InsufficientFunds(
                        "insufficient funds to buy".to_string(),
                    ));
                }
            }
            Direction::Sell => {
                if self.available(user.id, &request.ticker).await? < request.qty {
                    warn!(user_id = %user.id, ticker = %request.ticker, "Rejected sell: insufficient asset");
                    return Err(ExchangeError::InsufficientFunds(
                        "insufficient asset to sell".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }

    pub async fn list_orders(&self, user: &User) -> Result<Vec<Order>> {
        self.storage.list_orders_for_user(user.id).await
    }

    pub async fn get_order(&self, user: &User, order_id: Uuid) -> Result<Order> {
        self.storage
            .get_order(order_id)
            .await?
            .filter(|o| o.user_id == user.id)
            .ok_or_else(|| ExchangeError::NotFound("order not found".to_string()))
    }

    pub async fn cancel_order(&self, user: &User, order_id: Uuid) -> Result<()> {
        let _ledger = self.ledger.lock().await;
        let order = self
            .storage
            .get_order(order_id)
            .await?
            .filter(|o| o.user_id == user.id && o.status.is_open())
            .ok_or_else(|| {
                ExchangeError::NotFound("order not found or cannot be cancelled".to_string())
            })?;
        self.storage
            .update_order_status(order.id, OrderStatus::Cancelled)
            .await?;
        ExchangeMetrics::record_order_cancelled();
        info!(order_id = %order.id, "Order cancelled");
        Ok(())
    }

    // ----- administration -------------------------------------------------

    pub async fn delete_user(&self, user_id: Uuid) -> Result<User> {
        let _ledger = self.ledger.lock().await;
        let user = self
            .storage
            .delete_user(user_id)
            .await?
            .ok_or_else(|| ExchangeError::NotFound("user not found".to_string()))?;
        info!(user_id = %user.id, "Deleted user");
        Ok(user)
    }

    pub async fn add_instrument(&self, name: &str, ticker: &str) -> Result<()> {
        validate_ticker(ticker)?;
        if name.trim().is_empty() {
            return Err(ExchangeError::Validation(
                "instrument name must not be empty".to_string(),
            ));
        }
        let instrument = Instrument {
            ticker: ticker.to_string(),
            name: name.to_string(),
            kind: InstrumentKind::Stock,
            created_at: Utc::now(),
        };
        if !self.storage.create_instrument(&instrument).await? {
            return Err(ExchangeError::BadRequest(
                "instrument already exists".to_string(),
            ));
        }
        info!(ticker, "Listed instrument");
        Ok(())
    }

    pub async fn delete_instrument(&self, ticker: &str) -> Result<()> {
        let _ledger = self.ledger.lock().await;
        if !self.storage.delete_instrument(ticker).await? {
            return Err(ExchangeError::NotFound("instrument not found".to_string()));
        }
        info!(ticker, "Delisted instrument");
        Ok(())
    }

    pub async fn deposit(&self, user_id: Uuid, ticker: &str, amount: i64) -> Result<()> {
        require_positive(amount)?;
        let _ledger = self.ledger.lock().await;
        self.require_user(user_id).await?;
        if self.storage.get_instrument(ticker).await?.is_none() {
            return Err(ExchangeError::NotFound("instrument not found".to_string()));
        }
        self.credited_balance(user_id, ticker, amount).await?;
        let balance = self.storage.adjust_balance(user_id, ticker, amount).await?;
        info!(%user_id, ticker, amount, balance, "Deposit");
        Ok(())
    }

    pub async fn withdraw(&self, user_id: Uuid, ticker: &str, amount: i64) -> Result<()> {
        require_positive(amount)?;
        let _ledger = self.ledger.lock().await;
        self.require_user(user_id).await?;
        if self.available(user_id, ticker).await? < amount {
            return Err(ExchangeError::InsufficientFunds(
                "insufficient funds".to_string(),
            ));
        }
        let balance = self.storage.adjust_balance(user_id, ticker, -amount).await?;
        info!(%user_id, ticker, amount, balance, "Withdrawal");
        Ok(())
    }

    /// Balance after crediting `amount`, or an error if it would not fit.
    async fn credited_balance(&self, user_id: Uuid, ticker: &str, amount: i64) -> Result<i64> {
        self.storage
            .get_balance(user_id, ticker)
            .await?
            .checked_add(amount)
            .ok_or_else(|| ExchangeError::Validation("balance overflows".to_string()))
    }

    async fn require_user(&self, user_id: Uuid) -> Result<User> {
        self.storage
            .get_user_by_id(user_id)
            .await?
            .ok_or_else(|| ExchangeError::NotFound("user not found".to_string()))
    }
}

fn require_positive(amount: i64) -> Result<()> {
    if amount > 0 {
        Ok(())
    } else {
        Err(ExchangeError::Validation(
            "amount must be greater than 0".to_string(),
        ))
    }
}

fn clamp_limit(requested: Option<i64>, default: usize, max: usize) -> Result<usize> {
    match requested {
        None => Ok(default.min(max)),
        Some(n) if n < 0 => Err(ExchangeError::Validation(
            "limit must not be negative".to_string(),
        )),
        Some(n) => Ok(usize::try_from(n).unwrap_or(usize::MAX).min(max)),
    }
}
