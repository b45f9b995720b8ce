use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::{Direction, Instrument, Order, OrderKind, OrderStatus, Trade, User, UserRole};
use crate::engine::OrderRequest;

#[derive(Debug, Deserialize)]
pub struct NewUser {
    pub name: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UserView {
    pub id: Uuid,
    pub name: String,
    pub role: UserRole,
    pub api_key: String,
}

impl From<User> for UserView {
    fn from(user: User) -> Self {
        Self {
            id: user.id,
            name: user.name,
            role: user.role,
            api_key: user.api_key,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct InstrumentView {
    pub name: String,
    pub ticker: String,
}

impl From<Instrument> for InstrumentView {
    fn from(instrument: Instrument) -> Self {
        Self {
            name: instrument.name,
            ticker: instrument.ticker,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TransactionView {
    pub ticker: String,
    pub amount: i64,
    pub price: i64,
    pub timestamp: DateTime<Utc>,
}

impl From<Trade> for TransactionView {
    fn from(trade: Trade) -> Self {
        Self {
            ticker: trade.ticker,
            amount: trade.amount,
            price: trade.price,
            timestamp: trade.created_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitOrderBody {
    pub direction: Direction,
    pub ticker: String,
    pub qty: i64,
    pub price: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketOrderBody {
    pub direction: Direction,
    pub ticker: String,
    pub qty: i64,
}

/// A body carrying `price` is a limit order, otherwise a market order.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum CreateOrderBody {
    Limit(LimitOrderBody),
    Market(MarketOrderBody),
}

impl From<CreateOrderBody> for OrderRequest {
    fn from(body: CreateOrderBody) -> Self {
        match body {
            CreateOrderBody::Limit(b) => OrderRequest {
                direction: b.direction,
                ticker: b.ticker,
                qty: b.qty,
                price: Some(b.price),
            },
            CreateOrderBody::Market(b) => OrderRequest {
                direction: b.direction,
                ticker: b.ticker,
                qty: b.qty,
                price: None,
            },
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LimitOrderView {
    pub id: Uuid,
    pub status: OrderStatus,
    pub user_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub body: LimitOrderBody,
    pub filled: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MarketOrderView {
    pub id: Uuid,
    pub status: OrderStatus,
    pub user_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub body: MarketOrderBody,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum OrderView {
    Limit(LimitOrderView),
    Market(MarketOrderView),
}

impl From<Order> for OrderView {
    fn from(order: Order) -> Self {
        match (order.kind, order.price) {
            (OrderKind::Limit, Some(price)) => OrderView::Limit(LimitOrderView {
                id: order.id,
                status: order.status,
                user_id: order.user_id,
                timestamp: order.created_at,
                body: LimitOrderBody {
                    direction: order.direction,
                    ticker: order.ticker,
                    qty: order.qty,
                    price,
                },
                filled: order.filled,
            }),
            _ => OrderView::Market(MarketOrderView {
                id: order.id,
                status: order.status,
                user_id: order.user_id,
                timestamp: order.created_at,
                body: MarketOrderBody {
                    direction: order.direction,
                    ticker: order.ticker,
                    qty: order.qty,
                },
            }),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateOrderResponse {
    pub success: bool,
    pub order_id: Uuid,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OkResponse {
    pub success: bool,
}

impl OkResponse {
    pub fn ok() -> Self {
        Self { success: true }
    }
}

#[derive(Debug, Deserialize)]
pub struct DepositWithdrawBody {
    pub user_id: String,
    pub ticker: String,
    pub amount: i64,
}

#[derive(Debug, Default, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_body_with_price_is_limit() {
        let body: CreateOrderBody = serde_json::from_value(json!({
            "direction": "BUY", "ticker": "MEMCOIN", "qty": 2, "price": 10
        }))
        .unwrap();
        assert_eq!(OrderRequest::from(body).price, Some(10));

        let body: CreateOrderBody = serde_json::from_value(json!({
            "direction": "SELL", "ticker": "MEMCOIN", "qty": 2
        }))
        .unwrap();
        assert_eq!(OrderRequest::from(body).price, None);
    }

    #[test]
    fn test_market_view_has_no_filled_field() {
        let order = Order {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            ticker: "MEMCOIN".to_string(),
            direction: Direction::Buy,
            kind: OrderKind::Market,
            qty: 1,
            price: None,
            filled: 1,
            status: OrderStatus::Executed,
            created_at: Utc::now(),
        };
        let value = serde_json::to_value(OrderView::from(order)).unwrap();
        assert!(value.get("filled").is_none());
        assert!(value["body"].get("price").is_none());
        assert_eq!(value["status"], "EXECUTED");
    }
}
