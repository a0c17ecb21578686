//! Network capability and peer directory.
//!
//! Transport framing, signature verification and NAT traversal live behind
//! [`Network`]: a frame handed to the community is already authenticated.
//! [`PeerDirectory`] maps trader ids to addresses, falling back to a DHT
//! lookup when a peer is only known indirectly.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use crate::models::TraderId;

/// Outbound frame transport. Sends are fire-and-forget.
pub trait Network: Send + Sync {
    fn send(&self, address: SocketAddr, frame: Bytes);
}

/// Distributed address lookup for traders we only know by id.
#[async_trait]
pub trait Dht: Send + Sync {
    async fn resolve(&self, trader_id: TraderId) -> Option<SocketAddr>;
}

/// In-memory address map populated by inbound messages and DHT results.
#[derive(Debug, Default)]
pub struct PeerDirectory {
    addresses: HashMap<TraderId, SocketAddr>,
}

impl PeerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, trader_id: &TraderId) -> Option<SocketAddr> {
        self.addresses.get(trader_id).copied()
    }

    pub fn update(&mut self, trader_id: TraderId, address: SocketAddr) {
        tracing::debug!(trader = %trader_id, %address, "updating peer address");
        self.addresses.insert(trader_id, address);
    }
}

/// In-process network: frames accumulate in an outbox for a driver or test
/// to route.
#[derive(Default)]
pub struct MemoryNetwork {
    outbox: Mutex<Vec<(SocketAddr, Bytes)>>,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Drain the frames sent since the last call.
    pub fn take_sent(&self) -> Vec<(SocketAddr, Bytes)> {
        std::mem::take(&mut *self.outbox.lock())
    }
}

impl Network for MemoryNetwork {
    fn send(&self, address: SocketAddr, frame: Bytes) {
        self.outbox.lock().push((address, frame));
    }
}

/// In-memory DHT with explicit entries.
#[derive(Default)]
pub struct MemoryDht {
    entries: Mutex<HashMap<TraderId, SocketAddr>>,
}

impl MemoryDht {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn publish(&self, trader_id: TraderId, address: SocketAddr) {
        self.entries.lock().insert(trader_id, address);
    }
}

#[async_trait]
impl Dht for MemoryDht {
    async fn resolve(&self, trader_id: TraderId) -> Option<SocketAddr> {
        self.entries.lock().get(&trader_id).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TRADER_ID_LEN;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    #[test]
    fn directory_lookup_and_update() {
        let trader = TraderId([1; TRADER_ID_LEN]);
        let mut directory = PeerDirectory::new();
        assert_eq!(directory.lookup(&trader), None);
        directory.update(trader, addr(9000));
        assert_eq!(directory.lookup(&trader), Some(addr(9000)));
    }

    #[tokio::test]
    async fn memory_network_collects_frames() {
        let network = MemoryNetwork::new();
        network.send(addr(9000), Bytes::from_static(b"frame"));
        let sent = network.take_sent();
        assert_eq!(sent.len(), 1);
        assert!(network.take_sent().is_empty());
    }

    #[tokio::test]
    async fn dht_resolves_published_entries() {
        let trader = TraderId([1; TRADER_ID_LEN]);
        let dht = MemoryDht::new();
        assert_eq!(dht.resolve(trader).await, None);
        dht.publish(trader, addr(9001));
        assert_eq!(dht.resolve(trader).await, Some(addr(9001)));
    }
}
