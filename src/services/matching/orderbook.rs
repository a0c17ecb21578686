//! The matchmaker's orderbook.
//!
//! Two price-level indices (asks ascending, bids descending at read time),
//! FIFO queues per level, and the completed/cancelled exclusion sets that
//! keep finished ticks from ever re-entering the book.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use crate::models::{OrderId, OrderSnapshot, Price, Tick, Timestamp};

/// A tick plus its book-keeping state at a price level.
#[derive(Debug, Clone)]
pub struct TickEntry {
    pub tick: Tick,
    pub inserted_at: Timestamp,
    /// Counter orders this tick must not be matched with again.
    blocked: HashSet<OrderId>,
}

impl TickEntry {
    fn new(tick: Tick, inserted_at: Timestamp) -> Self {
        Self { tick, inserted_at, blocked: HashSet::new() }
    }

    pub fn available(&self) -> u64 {
        self.tick.available()
    }

    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.tick.is_expired(now)
    }

    pub fn block_for_matching(&mut self, order_id: OrderId) {
        self.blocked.insert(order_id);
    }

    pub fn is_blocked_for(&self, order_id: &OrderId) -> bool {
        self.blocked.contains(order_id)
    }
}

/// Price-level orderbook held by a matchmaker.
#[derive(Debug, Default)]
pub struct OrderBook {
    asks: BTreeMap<Price, VecDeque<TickEntry>>,
    bids: BTreeMap<Price, VecDeque<TickEntry>>,
    /// Side and level of every tick in the book, for O(1)-ish removal and the
    /// one-entry-per-order invariant.
    index: HashMap<OrderId, (bool, Price)>,
    pub completed_orders: HashSet<OrderId>,
    pub cancelled_orders: HashSet<OrderId>,
}

impl OrderBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn tick_exists(&self, order_id: &OrderId) -> bool {
        self.index.contains_key(order_id)
    }

    pub fn order_ids(&self) -> impl Iterator<Item = &OrderId> {
        self.index.keys()
    }

    fn side(&self, is_ask: bool) -> &BTreeMap<Price, VecDeque<TickEntry>> {
        if is_ask {
            &self.asks
        } else {
            &self.bids
        }
    }

    fn side_mut(&mut self, is_ask: bool) -> &mut BTreeMap<Price, VecDeque<TickEntry>> {
        if is_ask {
            &mut self.asks
        } else {
            &mut self.bids
        }
    }

    /// Insert a tick. Rejects duplicates, known-finished and known-cancelled
    /// orders, and ticks with nothing left to trade.
    pub fn insert_tick(&mut self, tick: Tick, now: Timestamp) -> bool {
        let order_id = tick.order_id;
        if self.tick_exists(&order_id)
            || self.completed_orders.contains(&order_id)
            || self.cancelled_orders.contains(&order_id)
            || tick.available() == 0
        {
            return false;
        }
        let price = tick.assets.price();
        let is_ask = tick.is_ask;
        self.side_mut(is_ask)
            .entry(price.clone())
            .or_default()
            .push_back(TickEntry::new(tick, now));
        self.index.insert(order_id, (is_ask, price));
        true
    }

    pub fn get_tick(&self, order_id: &OrderId) -> Option<&TickEntry> {
        let (is_ask, price) = self.index.get(order_id)?;
        self.side(*is_ask).get(price)?.iter().find(|entry| entry.tick.order_id == *order_id)
    }

    pub fn get_tick_mut(&mut self, order_id: &OrderId) -> Option<&mut TickEntry> {
        let (is_ask, price) = self.index.get(order_id)?.clone();
        self.side_mut(is_ask)
            .get_mut(&price)?
            .iter_mut()
            .find(|entry| entry.tick.order_id == *order_id)
    }

    pub fn remove_tick(&mut self, order_id: &OrderId) -> Option<Tick> {
        let (is_ask, price) = self.index.remove(order_id)?;
        let level = self.side_mut(is_ask).get_mut(&price)?;
        let position = level.iter().position(|entry| entry.tick.order_id == *order_id)?;
        let entry = level.remove(position);
        if level.is_empty() {
            self.side_mut(is_ask).remove(&price);
        }
        entry.map(|entry| entry.tick)
    }

    /// Ask levels in ascending price order.
    pub fn ask_levels(&self) -> impl Iterator<Item = (&Price, &VecDeque<TickEntry>)> {
        self.asks.iter()
    }

    /// Bid levels in descending price order.
    pub fn bid_levels(&self) -> impl Iterator<Item = (&Price, &VecDeque<TickEntry>)> {
        self.bids.iter().rev()
    }

    /// Advance the traded amount of both sides of a settled trade. A tick
    /// whose quantity is exhausted leaves the book into `completed_orders`.
    /// Returns the order ids whose ticks are still in the book.
    pub fn update_ticks(
        &mut self,
        ask: &OrderSnapshot,
        bid: &OrderSnapshot,
        transferred: u64,
    ) -> Vec<OrderId> {
        let mut remaining = Vec::new();
        for snapshot in [ask, bid] {
            let order_id = snapshot.order_id();
            let exhausted = match self.get_tick_mut(&order_id) {
                Some(entry) => {
                    entry.tick.traded = entry.tick.traded.saturating_add(transferred);
                    entry.tick.available() == 0
                }
                None => continue,
            };
            if exhausted {
                self.remove_tick(&order_id);
                self.completed_orders.insert(order_id);
            } else {
                remaining.push(order_id);
            }
        }
        remaining
    }

    /// Remove every expired tick, returning their ids.
    pub fn expire_due(&mut self, now: Timestamp) -> Vec<OrderId> {
        let expired: Vec<OrderId> = self
            .asks
            .values()
            .chain(self.bids.values())
            .flatten()
            .filter(|entry| entry.is_expired(now))
            .map(|entry| entry.tick.order_id)
            .collect();
        for order_id in &expired {
            self.remove_tick(order_id);
        }
        expired
    }
}
