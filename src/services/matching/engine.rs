//! Price-time matching strategy.
//!
//! Walks the opposite side of the book from the best price inward, FIFO
//! within a level, and accumulates eligible counter ticks until the input's
//! remaining quantity is covered. The engine never mutates the book.

use std::collections::VecDeque;

use crate::models::{OrderId, Price, Timestamp};

use super::orderbook::{OrderBook, TickEntry};

/// Find counterparties for the tick with the given order id.
///
/// Returns counter order ids in match priority order. Empty when the tick is
/// missing, exhausted or expired.
pub fn match_tick(book: &OrderBook, order_id: &OrderId, now: Timestamp) -> Vec<OrderId> {
    let entry = match book.get_tick(order_id) {
        Some(entry) => entry,
        None => return Vec::new(),
    };
    if entry.available() == 0 || entry.is_expired(now) {
        return Vec::new();
    }

    let input_price = entry.tick.assets.price();
    let wanted = entry.available();
    let mut accumulated = 0u64;
    let mut matched = Vec::new();

    // For an ask walk bids from the highest price down, for a bid walk asks
    // from the lowest up. A level strictly worse than the input's own price
    // ends the scan; equality still matches.
    let levels: Box<dyn Iterator<Item = (&Price, &VecDeque<TickEntry>)>> = if entry.tick.is_ask {
        Box::new(book.bid_levels())
    } else {
        Box::new(book.ask_levels())
    };

    for (price, level) in levels {
        if !price.same_market(&input_price) {
            continue;
        }
        let acceptable =
            if entry.tick.is_ask { *price >= input_price } else { *price <= input_price };
        if !acceptable {
            break;
        }
        for candidate in level {
            if !eligible(entry, candidate, now) {
                continue;
            }
            accumulated += candidate.available();
            matched.push(candidate.tick.order_id);
            if accumulated >= wanted {
                return matched;
            }
        }
    }
    matched
}

fn eligible(input: &TickEntry, candidate: &TickEntry, now: Timestamp) -> bool {
    let input_id = input.tick.order_id;
    let candidate_id = candidate.tick.order_id;
    candidate_id.trader_id != input_id.trader_id
        && !candidate.is_blocked_for(&input_id)
        && !input.is_blocked_for(&candidate_id)
        && candidate.available() > 0
        && !candidate.is_expired(now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AssetAmount, AssetPair, Tick, TraderId, TRADER_ID_LEN};

    fn tick(trader: u8, number: u64, base: u64, quote: u64, is_ask: bool) -> Tick {
        let assets =
            AssetPair::new(AssetAmount::new(base, "BTC"), AssetAmount::new(quote, "EUR")).unwrap();
        Tick {
            order_id: OrderId::new(TraderId([trader; TRADER_ID_LEN]), number),
            assets,
            is_ask,
            timeout: 60_000,
            timestamp: Timestamp(0),
            traded: 0,
            block_hash: Default::default(),
        }
    }

    fn id(trader: u8, number: u64) -> OrderId {
        OrderId::new(TraderId([trader; TRADER_ID_LEN]), number)
    }

    #[test]
    fn ask_matches_best_bid_first() {
        let mut book = OrderBook::new();
        book.insert_tick(tick(1, 1, 100, 50, true), Timestamp(1));
        book.insert_tick(tick(2, 1, 50, 30, false), Timestamp(2)); // 0.6 EUR/BTC
        book.insert_tick(tick(3, 1, 50, 25, false), Timestamp(3)); // 0.5 EUR/BTC

        let matched = match_tick(&book, &id(1, 1), Timestamp(10));
        assert_eq!(matched, vec![id(2, 1), id(3, 1)]);
    }

    #[test]
    fn worse_priced_levels_are_skipped() {
        let mut book = OrderBook::new();
        book.insert_tick(tick(1, 1, 100, 50, true), Timestamp(1));
        book.insert_tick(tick(2, 1, 100, 40, false), Timestamp(2)); // 0.4 < 0.5, unacceptable

        assert!(match_tick(&book, &id(1, 1), Timestamp(10)).is_empty());

        // Equality matches.
        book.insert_tick(tick(3, 1, 100, 50, false), Timestamp(3));
        assert_eq!(match_tick(&book, &id(1, 1), Timestamp(10)), vec![id(3, 1)]);
    }

    #[test]
    fn accumulation_stops_once_covered() {
        let mut book = OrderBook::new();
        book.insert_tick(tick(1, 1, 60, 30, true), Timestamp(1));
        book.insert_tick(tick(2, 1, 40, 20, false), Timestamp(2));
        book.insert_tick(tick(3, 1, 40, 20, false), Timestamp(3));
        book.insert_tick(tick(4, 1, 40, 20, false), Timestamp(4));

        // 40 + 40 >= 60, third bid is never touched.
        let matched = match_tick(&book, &id(1, 1), Timestamp(10));
        assert_eq!(matched, vec![id(2, 1), id(3, 1)]);
    }

    #[test]
    fn fifo_order_within_a_level() {
        let mut book = OrderBook::new();
        book.insert_tick(tick(1, 1, 100, 50, false), Timestamp(1));
        book.insert_tick(tick(2, 1, 30, 15, true), Timestamp(2));
        book.insert_tick(tick(3, 1, 30, 15, true), Timestamp(3));

        let matched = match_tick(&book, &id(1, 1), Timestamp(10));
        assert_eq!(matched, vec![id(2, 1), id(3, 1)]);
    }

    #[test]
    fn skips_blocked_expired_and_same_trader() {
        let mut book = OrderBook::new();
        book.insert_tick(tick(1, 1, 100, 50, true), Timestamp(1));
        // Same trader on the other side.
        book.insert_tick(tick(1, 2, 100, 50, false), Timestamp(1));
        // Expired bid.
        let mut stale = tick(2, 1, 100, 50, false);
        stale.timeout = 1;
        book.insert_tick(stale, Timestamp(1));
        // Blocked bid.
        book.insert_tick(tick(3, 1, 100, 50, false), Timestamp(1));
        book.get_tick_mut(&id(3, 1)).unwrap().block_for_matching(id(1, 1));
        // The only eligible one.
        book.insert_tick(tick(4, 1, 100, 50, false), Timestamp(1));

        let matched = match_tick(&book, &id(1, 1), Timestamp(10_000));
        assert_eq!(matched, vec![id(4, 1)]);
    }
}
