//! Core market data model.
//!
//! Identifiers, asset arithmetic, orders, ticks and transactions shared by
//! every other module.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub mod asset;
pub mod order;
pub mod tick;
pub mod transaction;

pub use asset::{AssetAmount, AssetError, AssetPair, Price};
pub use order::{Order, OrderError, OrderSnapshot, OrderStatus};
pub use tick::Tick;
pub use transaction::{
    Payment, Transaction, TransactionSnapshot, TransactionStatus, WalletAddress,
};

/// Length of a trader identifier in bytes.
pub const TRADER_ID_LEN: usize = 20;

/// Fixed 20-byte opaque identifier of a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TraderId(pub [u8; TRADER_ID_LEN]);

impl TraderId {
    pub fn as_bytes(&self) -> &[u8; TRADER_ID_LEN] {
        &self.0
    }

    pub fn as_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        let raw = hex::decode(s).ok()?;
        let bytes: [u8; TRADER_ID_LEN] = raw.try_into().ok()?;
        Some(TraderId(bytes))
    }
}

impl fmt::Display for TraderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_hex())
    }
}

impl Serialize for TraderId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.as_hex())
    }
}

impl<'de> Deserialize<'de> for TraderId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        TraderId::from_hex(&s).ok_or_else(|| serde::de::Error::custom("invalid trader id"))
    }
}

/// Per-trader monotonically assigned order number.
pub type OrderNumber = u64;

/// Globally unique order identifier: the creating trader plus their order number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OrderId {
    pub trader_id: TraderId,
    pub order_number: OrderNumber,
}

impl OrderId {
    pub fn new(trader_id: TraderId, order_number: OrderNumber) -> Self {
        Self { trader_id, order_number }
    }
}

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.trader_id, self.order_number)
    }
}

/// Per-trader monotonically assigned transaction number.
pub type TransactionNumber = u64;

/// Globally unique transaction identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransactionId {
    pub trader_id: TraderId,
    pub transaction_number: TransactionNumber,
}

impl TransactionId {
    pub fn new(trader_id: TraderId, transaction_number: TransactionNumber) -> Self {
        Self { trader_id, transaction_number }
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.trader_id, self.transaction_number)
    }
}

/// Identifier of an outstanding trade proposal, chosen by the proposer.
pub type ProposalId = u32;

/// Wall-clock timestamp in milliseconds. No monotonicity is assumed between peers.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct Timestamp(pub u64);

impl Timestamp {
    pub fn as_millis(&self) -> u64 {
        self.0
    }

    /// The timestamp `ms` milliseconds after this one.
    pub fn plus(&self, ms: u64) -> Timestamp {
        Timestamp(self.0.saturating_add(ms))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Wall-clock source.
///
/// The system variant reads the real clock; the manual variant is advanced
/// explicitly so timer behavior is deterministic under test.
#[derive(Clone)]
pub struct Clock(Option<Arc<AtomicU64>>);

impl Clock {
    pub fn system() -> Self {
        Clock(None)
    }

    pub fn manual(start_ms: u64) -> Self {
        Clock(Some(Arc::new(AtomicU64::new(start_ms))))
    }

    pub fn now(&self) -> Timestamp {
        match &self.0 {
            None => Timestamp(chrono::Utc::now().timestamp_millis() as u64),
            Some(ms) => Timestamp(ms.load(AtomicOrdering::Relaxed)),
        }
    }

    /// Advance a manual clock. No-op on the system clock.
    pub fn advance(&self, ms: u64) {
        if let Some(current) = &self.0 {
            current.fetch_add(ms, AtomicOrdering::Relaxed);
        }
    }
}

impl fmt::Debug for Clock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            None => write!(f, "Clock::system"),
            Some(ms) => write!(f, "Clock::manual({})", ms.load(AtomicOrdering::Relaxed)),
        }
    }
}
