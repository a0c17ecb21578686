//! Orders and the per-counterparty reservation ledger.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::asset::AssetPair;
use super::{OrderId, OrderNumber, Timestamp, TraderId};

/// Order ledger errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OrderError {
    #[error("insufficient available quantity: requested {requested}, available {available}")]
    InsufficientAvailable { requested: u64, available: u64 },

    #[error("no reservation of {requested} for counterparty order {order_id}")]
    NoSuchReservation { order_id: OrderId, requested: u64 },

    #[error("quantity must be positive")]
    ZeroQuantity,
}

/// Lifecycle status of a local order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    /// Created locally, creation block not yet signed.
    Unverified,
    /// Live and eligible for matching.
    Open,
    /// Fully traded.
    Completed,
    /// Deadline passed before completion.
    Expired,
    /// Explicitly cancelled by its owner.
    Cancelled,
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderStatus::Unverified => write!(f, "unverified"),
            OrderStatus::Open => write!(f, "open"),
            OrderStatus::Completed => write!(f, "completed"),
            OrderStatus::Expired => write!(f, "expired"),
            OrderStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// A local order owned by this node.
///
/// The reservation ledger prevents the same base quantity from being offered
/// to two counterparties at once and gives decline/timeout paths an exact
/// amount to roll back.
#[derive(Debug, Clone)]
pub struct Order {
    pub order_id: OrderId,
    pub assets: AssetPair,
    pub is_ask: bool,
    /// Order lifetime in milliseconds from `created_at`.
    pub timeout: u64,
    pub created_at: Timestamp,
    pub verified: bool,
    cancelled: bool,
    traded: u64,
    reserved: HashMap<OrderId, u64>,
}

impl Order {
    pub fn new(
        order_id: OrderId,
        assets: AssetPair,
        is_ask: bool,
        timeout: u64,
        created_at: Timestamp,
    ) -> Self {
        Self {
            order_id,
            assets,
            is_ask,
            timeout,
            created_at,
            verified: false,
            cancelled: false,
            traded: 0,
            reserved: HashMap::new(),
        }
    }

    pub fn total_quantity(&self) -> u64 {
        self.assets.first.amount
    }

    pub fn traded_quantity(&self) -> u64 {
        self.traded
    }

    pub fn reserved_quantity(&self) -> u64 {
        self.reserved.values().sum()
    }

    /// Base quantity that can still be offered to a new counterparty.
    pub fn available_quantity(&self) -> u64 {
        self.total_quantity() - self.traded - self.reserved_quantity()
    }

    pub fn reservation_for(&self, peer_order_id: &OrderId) -> Option<u64> {
        self.reserved.get(peer_order_id).copied()
    }

    pub fn status(&self, now: Timestamp) -> OrderStatus {
        if self.cancelled {
            OrderStatus::Cancelled
        } else if !self.verified {
            OrderStatus::Unverified
        } else if self.traded == self.total_quantity() {
            OrderStatus::Completed
        } else if now > self.created_at.plus(self.timeout) {
            OrderStatus::Expired
        } else {
            OrderStatus::Open
        }
    }

    pub fn is_open(&self, now: Timestamp) -> bool {
        self.status(now) == OrderStatus::Open
    }

    pub fn set_verified(&mut self) {
        self.verified = true;
    }

    pub fn cancel(&mut self) {
        self.cancelled = true;
    }

    /// Hold `quantity` base units for the given counterparty order.
    pub fn reserve_for_tick(&mut self, peer_order_id: OrderId, quantity: u64) -> Result<(), OrderError> {
        if quantity == 0 {
            return Err(OrderError::ZeroQuantity);
        }
        let available = self.available_quantity();
        if available < quantity {
            return Err(OrderError::InsufficientAvailable { requested: quantity, available });
        }
        *self.reserved.entry(peer_order_id).or_insert(0) += quantity;
        Ok(())
    }

    /// Return `quantity` previously reserved for the counterparty to the pool.
    pub fn release_for_tick(&mut self, peer_order_id: &OrderId, quantity: u64) -> Result<(), OrderError> {
        let held = self.reserved.get_mut(peer_order_id).ok_or(OrderError::NoSuchReservation {
            order_id: *peer_order_id,
            requested: quantity,
        })?;
        if *held < quantity {
            return Err(OrderError::NoSuchReservation { order_id: *peer_order_id, requested: quantity });
        }
        *held -= quantity;
        if *held == 0 {
            self.reserved.remove(peer_order_id);
        }
        Ok(())
    }

    /// Move `quantity` from the counterparty's reservation into traded.
    pub fn add_trade(&mut self, peer_order_id: &OrderId, quantity: u64) -> Result<(), OrderError> {
        self.release_for_tick(peer_order_id, quantity)?;
        self.traded += quantity;
        Ok(())
    }

    /// Whether an incoming pair trades at a ratio at least as good as ours.
    ///
    /// For an ask that means at least our quote-per-base ratio, for a bid at
    /// most. Pairs from another market are never acceptable.
    pub fn has_acceptable_price(&self, incoming: &AssetPair) -> bool {
        if !self.assets.same_market(incoming) {
            return false;
        }
        if self.is_ask {
            incoming.price() >= self.assets.price()
        } else {
            incoming.price() <= self.assets.price()
        }
    }

    pub fn to_snapshot(&self) -> OrderSnapshot {
        OrderSnapshot {
            trader_id: self.order_id.trader_id,
            order_number: self.order_id.order_number,
            assets: self.assets.clone(),
            traded: self.traded,
            timeout: self.timeout,
            timestamp: self.created_at,
        }
    }
}

/// Authoritative point-in-time view of an order, as embedded in `tx_init` /
/// `tx_done` blocks and ORDER_RESPONSE messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderSnapshot {
    pub trader_id: TraderId,
    pub order_number: OrderNumber,
    pub assets: AssetPair,
    pub traded: u64,
    pub timeout: u64,
    pub timestamp: Timestamp,
}

impl OrderSnapshot {
    pub fn order_id(&self) -> OrderId {
        OrderId::new(self.trader_id, self.order_number)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::asset::AssetAmount;
    use crate::models::TRADER_ID_LEN;

    fn order(total: u64) -> Order {
        let assets =
            AssetPair::new(AssetAmount::new(total, "BTC"), AssetAmount::new(total / 2, "EUR"))
                .unwrap();
        let mut order = Order::new(
            OrderId::new(TraderId([7; TRADER_ID_LEN]), 1),
            assets,
            true,
            3_600_000,
            Timestamp(1_000),
        );
        order.set_verified();
        order
    }

    fn peer(n: u64) -> OrderId {
        OrderId::new(TraderId([9; TRADER_ID_LEN]), n)
    }

    #[test]
    fn reserve_release_trade_ledger() {
        let mut order = order(100);
        order.reserve_for_tick(peer(1), 60).unwrap();
        order.reserve_for_tick(peer(2), 30).unwrap();
        assert_eq!(order.available_quantity(), 10);

        assert!(matches!(
            order.reserve_for_tick(peer(3), 11),
            Err(OrderError::InsufficientAvailable { available: 10, .. })
        ));

        order.release_for_tick(&peer(2), 30).unwrap();
        assert_eq!(order.reservation_for(&peer(2)), None);

        order.add_trade(&peer(1), 60).unwrap();
        assert_eq!(order.traded_quantity(), 60);
        assert_eq!(order.available_quantity(), 40);
        assert!(order.traded_quantity() + order.reserved_quantity() <= order.total_quantity());
    }

    #[test]
    fn release_requires_matching_reservation() {
        let mut order = order(100);
        order.reserve_for_tick(peer(1), 10).unwrap();
        assert!(matches!(
            order.release_for_tick(&peer(1), 11),
            Err(OrderError::NoSuchReservation { .. })
        ));
        assert!(matches!(
            order.release_for_tick(&peer(2), 1),
            Err(OrderError::NoSuchReservation { .. })
        ));
    }

    #[test]
    fn status_lifecycle() {
        let mut current_order = order(100);
        current_order.verified = false;
        assert_eq!(current_order.status(Timestamp(1_000)), OrderStatus::Unverified);

        current_order.set_verified();
        assert_eq!(current_order.status(Timestamp(1_000)), OrderStatus::Open);
        assert_eq!(current_order.status(Timestamp(999_999_999)), OrderStatus::Expired);

        current_order.reserve_for_tick(peer(1), 100).unwrap();
        current_order.add_trade(&peer(1), 100).unwrap();
        assert_eq!(current_order.status(Timestamp(1_000)), OrderStatus::Completed);
        // Completion wins over the deadline.
        assert_eq!(current_order.status(Timestamp(999_999_999)), OrderStatus::Completed);

        let mut cancelled = order(100);
        cancelled.cancel();
        assert_eq!(cancelled.status(Timestamp(1_000)), OrderStatus::Cancelled);
    }

    #[test]
    fn acceptable_price_is_side_dependent() {
        let ask = order(100); // price 1/2 EUR per BTC
        let better =
            AssetPair::new(AssetAmount::new(100, "BTC"), AssetAmount::new(60, "EUR")).unwrap();
        let worse =
            AssetPair::new(AssetAmount::new(100, "BTC"), AssetAmount::new(40, "EUR")).unwrap();
        assert!(ask.has_acceptable_price(&better));
        assert!(!ask.has_acceptable_price(&worse));

        let mut bid = order(100);
        bid.is_ask = false;
        assert!(bid.has_acceptable_price(&worse));
        assert!(!bid.has_acceptable_price(&better));

        let alien =
            AssetPair::new(AssetAmount::new(100, "BTC"), AssetAmount::new(60, "USD")).unwrap();
        assert!(!ask.has_acceptable_price(&alien));
    }
}
