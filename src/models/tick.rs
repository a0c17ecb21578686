//! Ticks: the orderbook's view of a remote order.

use serde::{Deserialize, Serialize};

use super::asset::AssetPair;
use super::order::Order;
use super::{OrderId, Timestamp};
use crate::chain::BlockHash;

/// A snapshot of a remote order as carried by an `ask`/`bid` block and held in
/// a matchmaker's orderbook. Immutable except for `traded`, which only ever
/// advances.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tick {
    pub order_id: OrderId,
    pub assets: AssetPair,
    pub is_ask: bool,
    /// Lifetime in milliseconds from `timestamp`.
    pub timeout: u64,
    pub timestamp: Timestamp,
    pub traded: u64,
    /// Hash of the block that created this tick; zero until attached.
    pub block_hash: BlockHash,
}

impl Tick {
    pub fn from_order(order: &Order) -> Self {
        Self {
            order_id: order.order_id,
            assets: order.assets.clone(),
            is_ask: order.is_ask,
            timeout: order.timeout,
            timestamp: order.created_at,
            traded: order.traded_quantity(),
            block_hash: BlockHash::default(),
        }
    }

    /// Base quantity still open for matching.
    pub fn available(&self) -> u64 {
        self.assets.first.amount.saturating_sub(self.traded)
    }

    pub fn is_expired(&self, now: Timestamp) -> bool {
        now > self.timestamp.plus(self.timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::asset::AssetAmount;
    use crate::models::{TraderId, TRADER_ID_LEN};

    fn tick() -> Tick {
        let assets =
            AssetPair::new(AssetAmount::new(100, "BTC"), AssetAmount::new(50, "EUR")).unwrap();
        Tick {
            order_id: OrderId::new(TraderId([3; TRADER_ID_LEN]), 5),
            assets,
            is_ask: true,
            timeout: 10_000,
            timestamp: Timestamp(1_000),
            traded: 0,
            block_hash: BlockHash::default(),
        }
    }

    #[test]
    fn available_tracks_traded() {
        let mut tick = tick();
        assert_eq!(tick.available(), 100);
        tick.traded = 40;
        assert_eq!(tick.available(), 60);
        tick.traded = 200;
        assert_eq!(tick.available(), 0);
    }

    #[test]
    fn expiry_is_deadline_exclusive() {
        let tick = tick();
        assert!(!tick.is_expired(Timestamp(11_000)));
        assert!(tick.is_expired(Timestamp(11_001)));
    }
}
