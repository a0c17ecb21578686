//! Per-order aggregation of incoming match proposals.
//!
//! Matches arriving for a local order are batched for a short window, then
//! fed one at a time into the trade negotiation: the queue hands out the best
//! priced candidate, the single `outstanding_request` slot guarantees at most
//! one proposal in flight per order, and decline feedback re-inserts or drops
//! candidates.

use std::collections::{HashMap, HashSet};

use crate::models::{OrderId, Price, Timestamp, TraderId};
use crate::protocol::MatchPayload;

/// Inactivity timeout of a match cache.
pub const MATCH_CACHE_TIMEOUT_MS: u64 = 2 * 60 * 60 * 1000;

/// A queued match candidate.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueEntry {
    pub retries: u32,
    pub price: Price,
    pub order_id: OrderId,
    generation: u64,
}

/// Price-priority queue of match candidates for one local order.
///
/// An ask prefers the highest quote-per-base price, a bid the lowest. Ties
/// break on fewer retries, then on insertion order.
#[derive(Debug)]
pub struct MatchPriorityQueue {
    is_ask: bool,
    entries: Vec<QueueEntry>,
    next_generation: u64,
}

impl MatchPriorityQueue {
    pub fn new(is_ask: bool) -> Self {
        Self { is_ask, entries: Vec::new(), next_generation: 0 }
    }

    fn precedes(&self, a: &QueueEntry, b: &QueueEntry) -> bool {
        let price_order = if self.is_ask {
            b.price.cmp(&a.price)
        } else {
            a.price.cmp(&b.price)
        };
        price_order
            .then(a.retries.cmp(&b.retries))
            .then(a.generation.cmp(&b.generation))
            .is_lt()
    }

    pub fn insert(&mut self, retries: u32, price: Price, order_id: OrderId) {
        let entry = QueueEntry { retries, price, order_id, generation: self.next_generation };
        self.next_generation += 1;
        let position =
            self.entries.iter().position(|other| self.precedes(&entry, other)).unwrap_or(self.entries.len());
        self.entries.insert(position, entry);
    }

    pub fn pop(&mut self) -> Option<QueueEntry> {
        if self.entries.is_empty() {
            None
        } else {
            Some(self.entries.remove(0))
        }
    }

    pub fn contains_order(&self, order_id: &OrderId) -> bool {
        self.entries.iter().any(|entry| entry.order_id == *order_id)
    }

    pub fn remove_order(&mut self, order_id: &OrderId) {
        self.entries.retain(|entry| entry.order_id != *order_id);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// A delayed accept-and-propose for a popped candidate.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingPropose {
    pub due: Timestamp,
    pub counter_order_id: OrderId,
}

/// Outcome of adding a match to the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddMatchOutcome {
    /// First match: the batch timer was armed.
    Scheduled,
    /// Queued behind the timer or an outstanding request.
    Queued,
    /// The batch already ran and nothing is in flight: process immediately.
    ProcessNow,
}

/// Match bookkeeping for one local order.
#[derive(Debug)]
pub struct MatchCache {
    pub order_id: OrderId,
    pub is_ask: bool,
    /// Every match payload seen per counter order; one counter order may be
    /// announced by several matchmakers.
    pub matches: HashMap<OrderId, Vec<MatchPayload>>,
    pub queue: MatchPriorityQueue,
    pub outstanding_request: Option<QueueEntry>,
    pub received_responses: HashSet<OrderId>,
    pub schedule_at: Option<Timestamp>,
    pub schedule_done: bool,
    pub pending_propose: Option<PendingPropose>,
}

impl MatchCache {
    pub fn new(order_id: OrderId, is_ask: bool) -> Self {
        Self {
            order_id,
            is_ask,
            matches: HashMap::new(),
            queue: MatchPriorityQueue::new(is_ask),
            outstanding_request: None,
            received_responses: HashSet::new(),
            schedule_done: false,
            schedule_at: None,
            pending_propose: None,
        }
    }

    /// Record an incoming match payload.
    pub fn add_match(
        &mut self,
        payload: MatchPayload,
        now: Timestamp,
        match_window_ms: u64,
    ) -> AddMatchOutcome {
        let other_order_id = payload.tick_order_id();
        let price = payload.assets.price();

        let seen = self.matches.entry(other_order_id).or_default();
        if !seen
            .iter()
            .any(|existing| existing.matchmaker_trader_id == payload.matchmaker_trader_id)
        {
            seen.push(payload);
        }

        let outstanding_for_other = self
            .outstanding_request
            .as_ref()
            .map(|entry| entry.order_id == other_order_id)
            .unwrap_or(false)
            || self
                .pending_propose
                .as_ref()
                .map(|pending| pending.counter_order_id == other_order_id)
                .unwrap_or(false);
        if !self.queue.contains_order(&other_order_id)
            && !outstanding_for_other
            && !self.received_responses.contains(&other_order_id)
        {
            self.queue.insert(0, price, other_order_id);
        }

        if self.schedule_at.is_none() && !self.schedule_done {
            self.schedule_at = Some(now.plus(match_window_ms));
            AddMatchOutcome::Scheduled
        } else if self.schedule_done
            && self.outstanding_request.is_none()
            && self.pending_propose.is_none()
        {
            AddMatchOutcome::ProcessNow
        } else {
            AddMatchOutcome::Queued
        }
    }

    /// All matchmakers that announced the given counter order.
    pub fn matchmakers_for(&self, other_order_id: &OrderId) -> Vec<TraderId> {
        self.matches
            .get(other_order_id)
            .map(|payloads| payloads.iter().map(|p| p.matchmaker_trader_id).collect())
            .unwrap_or_default()
    }

    /// Drop every queue entry naming the given counter order.
    pub fn remove_order(&mut self, order_id: &OrderId) {
        self.queue.remove_order(order_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AssetAmount, AssetPair, TraderId, TRADER_ID_LEN};

    fn id(trader: u8, number: u64) -> OrderId {
        OrderId::new(TraderId([trader; TRADER_ID_LEN]), number)
    }

    fn price(base: u64, quote: u64) -> Price {
        AssetPair::new(AssetAmount::new(base, "BTC"), AssetAmount::new(quote, "EUR"))
            .unwrap()
            .price()
    }

    fn payload(trader: u8, number: u64, quote: u64, matchmaker: u8) -> MatchPayload {
        MatchPayload {
            trader_id: TraderId([trader; TRADER_ID_LEN]),
            timestamp: Timestamp(0),
            order_number: number,
            assets: AssetPair::new(AssetAmount::new(100, "BTC"), AssetAmount::new(quote, "EUR"))
                .unwrap(),
            is_ask: false,
            timeout: 60_000,
            tick_timestamp: Timestamp(0),
            traded: 0,
            recipient_order_number: 1,
            matchmaker_trader_id: TraderId([matchmaker; TRADER_ID_LEN]),
        }
    }

    #[test]
    fn ask_queue_pops_non_increasing_prices() {
        let mut queue = MatchPriorityQueue::new(true);
        queue.insert(0, price(100, 40), id(2, 1));
        queue.insert(0, price(100, 60), id(3, 1));
        queue.insert(0, price(100, 50), id(4, 1));

        let popped: Vec<u64> = std::iter::from_fn(|| queue.pop())
            .map(|entry| entry.price.numerator * 100 / entry.price.denominator)
            .collect();
        let mut sorted = popped.clone();
        sorted.sort_unstable_by(|a, b| b.cmp(a));
        assert_eq!(popped, sorted);
    }

    #[test]
    fn bid_queue_pops_non_decreasing_prices() {
        let mut queue = MatchPriorityQueue::new(false);
        queue.insert(0, price(100, 60), id(2, 1));
        queue.insert(0, price(100, 40), id(3, 1));
        queue.insert(0, price(100, 50), id(4, 1));

        assert_eq!(queue.pop().unwrap().order_id, id(3, 1));
        assert_eq!(queue.pop().unwrap().order_id, id(4, 1));
        assert_eq!(queue.pop().unwrap().order_id, id(2, 1));
    }

    #[test]
    fn ties_break_on_retries_then_insertion() {
        let mut queue = MatchPriorityQueue::new(true);
        queue.insert(1, price(100, 50), id(2, 1));
        queue.insert(0, price(100, 50), id(3, 1));
        queue.insert(0, price(100, 50), id(4, 1));

        assert_eq!(queue.pop().unwrap().order_id, id(3, 1));
        assert_eq!(queue.pop().unwrap().order_id, id(4, 1));
        assert_eq!(queue.pop().unwrap().order_id, id(2, 1));
    }

    #[test]
    fn contains_and_remove() {
        let mut queue = MatchPriorityQueue::new(true);
        queue.insert(0, price(100, 50), id(2, 1));
        assert!(queue.contains_order(&id(2, 1)));
        queue.remove_order(&id(2, 1));
        assert!(queue.is_empty());
    }

    #[test]
    fn first_match_schedules_batch_window() {
        let mut cache = MatchCache::new(id(1, 1), true);
        let outcome = cache.add_match(payload(2, 1, 50, 9), Timestamp(1_000), 2_000);
        assert_eq!(outcome, AddMatchOutcome::Scheduled);
        assert_eq!(cache.schedule_at, Some(Timestamp(3_000)));

        let outcome = cache.add_match(payload(3, 1, 60, 9), Timestamp(1_500), 2_000);
        assert_eq!(outcome, AddMatchOutcome::Queued);
        assert_eq!(cache.queue.len(), 2);
    }

    #[test]
    fn same_match_from_two_matchmakers_queues_once() {
        let mut cache = MatchCache::new(id(1, 1), true);
        cache.add_match(payload(2, 1, 50, 8), Timestamp(0), 1_000);
        cache.add_match(payload(2, 1, 50, 9), Timestamp(1), 1_000);

        assert_eq!(cache.queue.len(), 1);
        assert_eq!(cache.matchmakers_for(&id(2, 1)).len(), 2);
    }

    #[test]
    fn idle_cache_processes_immediately_after_batch() {
        let mut cache = MatchCache::new(id(1, 1), true);
        cache.add_match(payload(2, 1, 50, 9), Timestamp(0), 1_000);
        cache.schedule_done = true;
        cache.schedule_at = None;
        cache.queue.pop();

        let outcome = cache.add_match(payload(3, 1, 50, 9), Timestamp(2_000), 1_000);
        assert_eq!(outcome, AddMatchOutcome::ProcessNow);
    }
}
