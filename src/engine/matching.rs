//! Price-time priority matching of one incoming order against the resting
//! orders on the opposite side of the book.

use crate::domain::{Direction, MakerUpdate, Order, OrderKind, OrderStatus};
use uuid::Uuid;

/// One execution between the incoming order and a resting order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fill {
    pub maker_order_id: Uuid,
    pub maker_user_id: Uuid,
    pub qty: i64,
    pub price: i64,
}

/// Sorts resting orders into the sequence an incoming order of `taker_side`
/// consumes them: cheapest asks first for a buyer, richest bids first for a
/// seller, oldest first within a price.
pub fn sort_by_priority(book: &mut [Order], taker_side: Direction) {
    book.sort_by(|a, b| {
        let by_price = match taker_side {
            Direction::Buy => a.price.cmp(&b.price),
            Direction::Sell => b.price.cmp(&a.price),
        };
        by_price.then_with(|| a.created_at.cmp(&b.created_at))
    });
}

fn crosses(taker: &Order, maker_price: i64) -> bool {
    match (taker.kind, taker.price) {
        (OrderKind::Market, _) | (OrderKind::Limit, None) => true,
        (OrderKind::Limit, Some(limit)) => match taker.direction {
            Direction::Buy => maker_price <= limit,
            Direction::Sell => maker_price >= limit,
        },
    }
}

fn status_after_fill(order: &Order) -> OrderStatus {
    if order.filled >= order.qty {
        OrderStatus::Executed
    } else if order.filled > 0 {
        OrderStatus::PartiallyExecuted
    } else {
        order.status
    }
}

/// Matches `taker` against `book`, which must already be in priority order
/// (see [`sort_by_priority`]). Updates fill counts and statuses of the taker
/// and of every maker touched, and returns the fills in execution order.
///
/// A limit order that found no counterparty stays `NEW`; a market order that
/// found none is `CANCELLED`.
pub fn match_order(taker: &mut Order, book: &mut [Order]) -> Vec<Fill> {
    let mut fills = Vec::new();

    for maker in book.iter_mut() {
        if taker.remaining() <= 0 {
            break;
        }
        if !maker.is_resting() || maker.direction == taker.direction {
            continue;
        }
        let Some(maker_price) = maker.price else {
            continue;
        };
        if !crosses(taker, maker_price) {
            // Book is sorted, nothing further can cross either.
            break;
        }

        let qty = taker.remaining().min(maker.remaining());
        taker.filled += qty;
        maker.filled += qty;
        maker.status = status_after_fill(maker);

        fills.push(Fill {
            maker_order_id: maker.id,
            maker_user_id: maker.user_id,
            qty,
            price: maker_price,
        });
    }

    taker.status = status_after_fill(taker);
    if taker.kind == OrderKind::Market && taker.filled == 0 {
        taker.status = OrderStatus::Cancelled;
    }
    fills
}

/// Maker states after matching, one entry per resting order that traded.
pub fn maker_updates(book: &[Order], fills: &[Fill]) -> Vec<MakerUpdate> {
    book.iter()
        .filter(|maker| fills.iter().any(|f| f.maker_order_id == maker.id))
        .map(|maker| MakerUpdate {
            order_id: maker.id,
            filled: maker.filled,
            status: maker.status,
        })
        .collect()
}

/// Quote currency needed to buy up to `qty` units at market from a book of
/// asks in priority order. Only the fillable part is priced. Returns `None`
/// on arithmetic overflow.
pub fn market_cost(asks: &[Order], qty: i64) -> Option<i64> {
    let mut left = qty;
    let mut cost: i64 = 0;
    for ask in asks.iter().filter(|o| o.is_resting()) {
        if left <= 0 {
            break;
        }
        let Some(price) = ask.price else { continue };
        let take = left.min(ask.remaining());
        cost = cost.checked_add(take.checked_mul(price)?)?;
        left -= take;
    }
    Some(cost)
}
