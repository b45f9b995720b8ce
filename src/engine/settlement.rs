use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::matching::Fill;
use crate::domain::{BalanceDelta, Direction, Order, Trade, QUOTE_TICKER};
use crate::error::{ExchangeError, Result};

fn counterparties(taker: &Order, fill: &Fill) -> (Uuid, Uuid) {
    match taker.direction {
        Direction::Buy => (taker.user_id, fill.maker_user_id),
        Direction::Sell => (fill.maker_user_id, taker.user_id),
    }
}

/// Trade records for the fills of `taker`, all stamped with `at`.
pub fn trades_for(taker: &Order, fills: &[Fill], at: DateTime<Utc>) -> Vec<Trade> {
    fills
        .iter()
        .map(|fill| {
            let (buyer_id, seller_id) = counterparties(taker, fill);
            Trade {
                ticker: taker.ticker.clone(),
                amount: fill.qty,
                price: fill.price,
                buyer_id,
                seller_id,
                created_at: at,
            }
        })
        .collect()
}

/// Net balance movements caused by the fills of `taker`.
///
/// Deltas are merged per `(user, ticker)`, zero entries are dropped, and the
/// result is ordered by user id then ticker so every writer touches balance
/// rows in the same sequence.
pub fn balance_deltas(taker: &Order, fills: &[Fill]) -> Result<Vec<BalanceDelta>> {
    let mut net: BTreeMap<(Uuid, String), i64> = BTreeMap::new();
    let mut add = |user_id: Uuid, ticker: &str, amount: i64| -> Result<()> {
        let entry = net.entry((user_id, ticker.to_string())).or_insert(0);
        *entry = entry
            .checked_add(amount)
            .ok_or_else(|| ExchangeError::Validation("balance change overflows".to_string()))?;
        Ok(())
    };

    for fill in fills {
        let (buyer, seller) = counterparties(taker, fill);
        let cost = fill
            .qty
            .checked_mul(fill.price)
            .ok_or_else(|| ExchangeError::Validation("trade value overflows".to_string()))?;
        add(buyer, &taker.ticker, fill.qty)?;
        add(buyer, QUOTE_TICKER, -cost)?;
        add(seller, &taker.ticker, -fill.qty)?;
        add(seller, QUOTE_TICKER, cost)?;
    }

    Ok(net
        .into_iter()
        .filter(|(_, amount)| *amount != 0)
        .map(|((user_id, ticker), amount)| BalanceDelta {
            user_id,
            ticker,
            amount,
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{OrderKind, OrderStatus};

    fn taker(direction: Direction, user_id: Uuid) -> Order {
        Order {
            id: Uuid::new_v4(),
            user_id,
            ticker: "MEMCOIN".to_string(),
            direction,
            kind: OrderKind::Market,
            qty: 5,
            price: None,
            filled: 5,
            status: OrderStatus::Executed,
            created_at: Utc::now(),
        }
    }

    fn fill(maker_user_id: Uuid, qty: i64, price: i64) -> Fill {
        Fill {
            maker_order_id: Uuid::new_v4(),
            maker_user_id,
            qty,
            price,
        }
    }

    #[test]
    fn test_buyer_pays_seller_receives() {
        let buyer = Uuid::new_v4();
        let seller = Uuid::new_v4();
        let order = taker(Direction::Buy, buyer);

        let deltas = balance_deltas(&order, &[fill(seller, 2, 10), fill(seller, 3, 12)]).unwrap();

        let find = |user: Uuid, ticker: &str| {
            deltas
                .iter()
                .find(|d| d.user_id == user && d.ticker == ticker)
                .map(|d| d.amount)
        };
        assert_eq!(find(buyer, "MEMCOIN"), Some(5));
        assert_eq!(find(buyer, "RUB"), Some(-56));
        assert_eq!(find(seller, "MEMCOIN"), Some(-5));
        assert_eq!(find(seller, "RUB"), Some(56));
    }

    #[test]
    fn test_self_trade_nets_to_nothing() {
        let user = Uuid::new_v4();
        let order = taker(Direction::Sell, user);
        let deltas = balance_deltas(&order, &[fill(user, 5, 7)]).unwrap();
        assert!(deltas.is_empty());
    }

    #[test]
    fn test_deltas_are_sorted() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let order = taker(Direction::Sell, a);
        let deltas = balance_deltas(&order, &[fill(b, 1, 3)]).unwrap();
        let keys: Vec<(Uuid, String)> = deltas
            .iter()
            .map(|d| (d.user_id, d.ticker.clone()))
            .collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
    }

    #[test]
    fn test_trade_sides_follow_taker_direction() {
        let seller = Uuid::new_v4();
        let buyer = Uuid::new_v4();
        let order = taker(Direction::Sell, seller);
        let trades = trades_for(&order, &[fill(buyer, 2, 9)], Utc::now());
        assert_eq!(trades[0].buyer_id, buyer);
        assert_eq!(trades[0].seller_id, seller);
        assert_eq!(trades[0].amount, 2);
    }
}
