//! Process-wide request cache.
//!
//! Outstanding protocol exchanges are tracked under a `(kind, number)` key
//! with a deadline; when the deadline passes the entry is handed back to the
//! community whose timeout path releases whatever the exchange was holding.

use std::collections::HashMap;

use tokio::sync::oneshot;

use crate::models::{OrderId, Timestamp, TransactionId};
use crate::protocol::TradePayload;

use super::match_cache::MatchCache;

/// Deadline for an outstanding proposed trade.
pub const PROPOSED_TRADE_TIMEOUT_MS: u64 = 10_000;
/// Deadline for an outstanding ping.
pub const PING_TIMEOUT_MS: u64 = 5_000;
/// Deadline for an outstanding order-status query.
pub const ORDER_STATUS_TIMEOUT_MS: u64 = 20_000;

/// The cache kinds used by the market core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheKind {
    Match,
    ProposedTrade,
    Ping,
    OrderStatus,
}

pub type CacheKey = (CacheKind, u64);

/// Why an order-status query is outstanding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusRequestPurpose {
    /// Building the bilateral `tx_init` block for this transaction.
    TxInit(TransactionId),
    /// Building the bilateral `tx_done` block for this transaction.
    TxDone(TransactionId),
}

/// Cache entry payloads, one variant per kind.
pub enum CacheData {
    Match(MatchCache),
    ProposedTrade(TradePayload),
    Ping(oneshot::Sender<bool>),
    OrderStatus(StatusRequestPurpose),
}

pub struct CacheEntry {
    pub deadline: Timestamp,
    pub data: CacheData,
}

/// Registry of outstanding exchanges.
#[derive(Default)]
pub struct RequestCache {
    entries: HashMap<CacheKey, CacheEntry>,
}

impl RequestCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, kind: CacheKind, number: u64, deadline: Timestamp, data: CacheData) {
        self.entries.insert((kind, number), CacheEntry { deadline, data });
    }

    /// A fresh random identifier without a live entry of this kind.
    pub fn unused_number(&self, kind: CacheKind) -> u32 {
        loop {
            let number = rand::random::<u32>();
            if !self.has(kind, number as u64) {
                return number;
            }
        }
    }

    pub fn has(&self, kind: CacheKind, number: u64) -> bool {
        self.entries.contains_key(&(kind, number))
    }

    pub fn get(&self, kind: CacheKind, number: u64) -> Option<&CacheData> {
        self.entries.get(&(kind, number)).map(|entry| &entry.data)
    }

    pub fn get_mut(&mut self, kind: CacheKind, number: u64) -> Option<&mut CacheData> {
        self.entries.get_mut(&(kind, number)).map(|entry| &mut entry.data)
    }

    pub fn pop(&mut self, kind: CacheKind, number: u64) -> Option<CacheData> {
        self.entries.remove(&(kind, number)).map(|entry| entry.data)
    }

    /// Push an entry's deadline out (match caches time out on inactivity).
    pub fn touch(&mut self, kind: CacheKind, number: u64, deadline: Timestamp) {
        if let Some(entry) = self.entries.get_mut(&(kind, number)) {
            entry.deadline = deadline;
        }
    }

    /// Remove and return every entry whose deadline has passed.
    pub fn take_expired(&mut self, now: Timestamp) -> Vec<(CacheKey, CacheData)> {
        let due: Vec<CacheKey> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.deadline < now)
            .map(|(key, _)| *key)
            .collect();
        due.into_iter()
            .filter_map(|key| self.entries.remove(&key).map(|entry| (key, entry.data)))
            .collect()
    }

    /// The match cache of the local order with this number, if any.
    pub fn match_cache_mut(&mut self, order_number: u64) -> Option<&mut MatchCache> {
        match self.get_mut(CacheKind::Match, order_number) {
            Some(CacheData::Match(cache)) => Some(cache),
            _ => None,
        }
    }

    /// Every live match cache.
    pub fn match_caches_mut(&mut self) -> impl Iterator<Item = &mut MatchCache> {
        self.entries.values_mut().filter_map(|entry| match &mut entry.data {
            CacheData::Match(cache) => Some(cache),
            _ => None,
        })
    }

    /// Proposal ids of outstanding proposed trades from `order_id` towards
    /// `partner_order_id`.
    pub fn outstanding_proposals(
        &self,
        order_id: &OrderId,
        partner_order_id: &OrderId,
    ) -> Vec<u32> {
        self.entries
            .iter()
            .filter_map(|((kind, number), entry)| match (&entry.data, kind) {
                (CacheData::ProposedTrade(trade), CacheKind::ProposedTrade)
                    if trade.order_id == *order_id
                        && trade.recipient_order_id == *partner_order_id =>
                {
                    Some(*number as u32)
                }
                _ => None,
            })
            .collect()
    }

    /// Drop everything. In-flight exchanges resolve through their cleanup
    /// paths at shutdown.
    pub fn clear(&mut self) -> Vec<(CacheKey, CacheData)> {
        self.entries.drain().map(|(key, entry)| (key, entry.data)).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{TraderId, TRADER_ID_LEN};

    fn purpose() -> CacheData {
        CacheData::OrderStatus(StatusRequestPurpose::TxInit(TransactionId::new(
            TraderId([1; TRADER_ID_LEN]),
            1,
        )))
    }

    #[test]
    fn lookup_and_pop() {
        let mut cache = RequestCache::new();
        cache.insert(CacheKind::OrderStatus, 7, Timestamp(100), purpose());
        assert!(cache.has(CacheKind::OrderStatus, 7));
        assert!(!cache.has(CacheKind::Ping, 7));

        assert!(cache.pop(CacheKind::OrderStatus, 7).is_some());
        assert!(cache.pop(CacheKind::OrderStatus, 7).is_none());
    }

    #[test]
    fn unused_number_avoids_collisions() {
        let mut cache = RequestCache::new();
        cache.insert(CacheKind::Ping, 1, Timestamp(100), purpose());
        for _ in 0..100 {
            let number = cache.unused_number(CacheKind::Ping);
            assert_ne!(number, 1);
        }
    }

    #[test]
    fn take_expired_respects_deadlines() {
        let mut cache = RequestCache::new();
        cache.insert(CacheKind::OrderStatus, 1, Timestamp(100), purpose());
        cache.insert(CacheKind::OrderStatus, 2, Timestamp(300), purpose());

        let expired = cache.take_expired(Timestamp(200));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].0, (CacheKind::OrderStatus, 1));
        assert_eq!(cache.len(), 1);

        // Touch pushes the survivor's deadline out.
        cache.touch(CacheKind::OrderStatus, 2, Timestamp(1_000));
        assert!(cache.take_expired(Timestamp(500)).is_empty());
    }
}
