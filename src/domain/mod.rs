use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::ExchangeError;

/// Ticker of the currency every instrument is priced in.
pub const QUOTE_TICKER: &str = "RUB";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Direction {
    Buy,
    Sell,
}

impl Direction {
    pub fn opposite(self) -> Self {
        match self {
            Direction::Buy => Direction::Sell,
            Direction::Sell => Direction::Buy,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Buy => "BUY",
            Direction::Sell => "SELL",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    New,
    Executed,
    PartiallyExecuted,
    Cancelled,
}

impl OrderStatus {
    /// Statuses under which a limit order still sits in the book.
    pub fn is_open(self) -> bool {
        matches!(self, OrderStatus::New | OrderStatus::PartiallyExecuted)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OrderStatus::New => "NEW",
            OrderStatus::Executed => "EXECUTED",
            OrderStatus::PartiallyExecuted => "PARTIALLY_EXECUTED",
            OrderStatus::Cancelled => "CANCELLED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UserRole {
    User,
    Admin,
}

impl UserRole {
    pub fn as_str(self) -> &'static str {
        match self {
            UserRole::User => "USER",
            UserRole::Admin => "ADMIN",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderKind {
    Limit,
    Market,
}

impl OrderKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OrderKind::Limit => "LIMIT",
            OrderKind::Market => "MARKET",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstrumentKind {
    Stock,
    Currency,
}

impl InstrumentKind {
    pub fn as_str(self) -> &'static str {
        match self {
            InstrumentKind::Stock => "STOCK",
            InstrumentKind::Currency => "CURRENCY",
        }
    }
}

macro_rules! impl_text_enum {
    ($ty:ident { $($text:literal => $variant:ident),+ $(,)? }) => {
        impl FromStr for $ty {
            type Err = ExchangeError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($ty::$variant),)+
                    other => Err(ExchangeError::storage(format!(
                        "unknown {} value '{}'",
                        stringify!($ty),
                        other
                    ))),
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

impl_text_enum!(Direction { "BUY" => Buy, "SELL" => Sell });
impl_text_enum!(OrderStatus {
    "NEW" => New,
    "EXECUTED" => Executed,
    "PARTIALLY_EXECUTED" => PartiallyExecuted,
    "CANCELLED" => Cancelled,
});
impl_text_enum!(UserRole { "USER" => User, "ADMIN" => Admin });
impl_text_enum!(OrderKind { "LIMIT" => Limit, "MARKET" => Market });
impl_text_enum!(InstrumentKind { "STOCK" => Stock, "CURRENCY" => Currency });

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub name: String,
    pub role: UserRole,
    pub api_key: String,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn is_admin(&self) -> bool {
        self.role == UserRole::Admin
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instrument {
    pub ticker: String,
    pub name: String,
    pub kind: InstrumentKind,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    pub user_id: Uuid,
    pub ticker: String,
    pub amount: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: Uuid,
    pub user_id: Uuid,
    pub ticker: String,
    pub direction: Direction,
    pub kind: OrderKind,
    pub qty: i64,
    /// Present for limit orders only.
    pub price: Option<i64>,
    pub filled: i64,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
}

impl Order {
    pub fn remaining(&self) -> i64 {
        self.qty - self.filled
    }

    /// A limit order with an open status and quantity left to trade.
    pub fn is_resting(&self) -> bool {
        self.kind == OrderKind::Limit && self.status.is_open() && self.remaining() > 0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub ticker: String,
    pub amount: i64,
    pub price: i64,
    pub buyer_id: Uuid,
    pub seller_id: Uuid,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Level {
    pub price: i64,
    pub qty: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct L2OrderBook {
    pub bid_levels: Vec<Level>,
    pub ask_levels: Vec<Level>,
}

/// Signed change to one user's holding of one ticker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BalanceDelta {
    pub user_id: Uuid,
    pub ticker: String,
    pub amount: i64,
}

/// New fill state of a resting order touched by a match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MakerUpdate {
    pub order_id: Uuid,
    pub filled: i64,
    pub status: OrderStatus,
}

/// Everything produced by placing one order; persisted as a single unit.
#[derive(Debug, Clone, PartialEq)]
pub struct Execution {
    pub order: Order,
    pub maker_updates: Vec<MakerUpdate>,
    pub trades: Vec<Trade>,
    pub balance_deltas: Vec<BalanceDelta>,
}
