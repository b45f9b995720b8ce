use std::collections::BTreeMap;

use crate::domain::{Direction, Level, Order};

/// Aggregates the resting remainders of `orders` on `side` into price levels.
/// Bids come out highest price first, asks lowest first, at most `depth`.
pub fn aggregate(orders: &[Order], side: Direction, depth: usize) -> Vec<Level> {
    let mut levels: BTreeMap<i64, i64> = BTreeMap::new();
    for order in orders
        .iter()
        .filter(|o| o.direction == side && o.is_resting())
    {
        if let Some(price) = order.price {
            let level = levels.entry(price).or_insert(0);
            *level = level.saturating_add(order.remaining());
        }
    }

    let to_level = |(price, qty): (i64, i64)| Level { price, qty };
    match side {
        Direction::Buy => levels.into_iter().rev().take(depth).map(to_level).collect(),
        Direction::Sell => levels.into_iter().take(depth).map(to_level).collect(),
    }
}
