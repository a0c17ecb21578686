//! Chain capability: the append-only signed-block history.
//!
//! The community only consumes this narrow surface: create a source block,
//! co-sign a block with a counterparty, look blocks up, gossip them. Block
//! creation, signing and persistence proper live behind the trait; the
//! in-process [`MemoryChain`] backs tests and single-process deployments.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha3::{Digest, Keccak256};

use crate::models::{
    OrderNumber, OrderSnapshot, Payment, Tick, Timestamp, TraderId, TransactionSnapshot,
};

/// Protocol version carried in every block payload. Blocks of any other
/// version are ignored.
pub const PROTOCOL_VERSION: u32 = 1;

/// Chain capability errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChainError {
    #[error("counterparty did not counter-sign the block")]
    NotSigned,

    #[error("block payload could not be serialized: {0}")]
    Serialization(String),
}

/// Hash of a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct BlockHash(pub [u8; 32]);

impl BlockHash {
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }
}

impl fmt::Display for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl Serialize for BlockHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for BlockHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let raw = hex::decode(&s).map_err(serde::de::Error::custom)?;
        let bytes: [u8; 32] =
            raw.try_into().map_err(|_| serde::de::Error::custom("bad block hash length"))?;
        Ok(BlockHash(bytes))
    }
}

/// The block types the market consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockType {
    Ask,
    Bid,
    CancelOrder,
    TxInit,
    TxPayment,
    TxDone,
}

impl fmt::Display for BlockType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockType::Ask => write!(f, "ask"),
            BlockType::Bid => write!(f, "bid"),
            BlockType::CancelOrder => write!(f, "cancel_order"),
            BlockType::TxInit => write!(f, "tx_init"),
            BlockType::TxPayment => write!(f, "tx_payment"),
            BlockType::TxDone => write!(f, "tx_done"),
        }
    }
}

/// Typed block payloads. Every payload carries the protocol version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BlockPayload {
    Tick(TickPayload),
    Cancel(CancelPayload),
    TxInit(TxInitDonePayload),
    TxPayment(TxPaymentPayload),
    TxDone(TxInitDonePayload),
}

impl BlockPayload {
    pub fn version(&self) -> u32 {
        match self {
            BlockPayload::Tick(p) => p.version,
            BlockPayload::Cancel(p) => p.version,
            BlockPayload::TxInit(p) | BlockPayload::TxDone(p) => p.version,
            BlockPayload::TxPayment(p) => p.version,
        }
    }
}

/// Payload of an `ask` / `bid` block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickPayload {
    pub tick: Tick,
    pub version: u32,
}

/// Payload of a `cancel_order` block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CancelPayload {
    pub trader_id: TraderId,
    pub order_number: OrderNumber,
    pub version: u32,
}

/// Payload of a `tx_init` / `tx_done` block: both order snapshots plus the
/// transaction at that point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxInitDonePayload {
    pub ask: OrderSnapshot,
    pub bid: OrderSnapshot,
    pub tx: TransactionSnapshot,
    pub version: u32,
}

/// Payload of a `tx_payment` block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxPaymentPayload {
    pub payment: Payment,
    pub version: u32,
}

/// A signed block. `creator` made and signed it; for co-signed block pairs
/// `linked` names the counterparty and `link_hash` its half of the pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub block_type: BlockType,
    pub payload: BlockPayload,
    pub creator: TraderId,
    pub linked: Option<TraderId>,
    pub link_hash: Option<BlockHash>,
    pub timestamp: Timestamp,
    pub hash: BlockHash,
}

/// The chain capability consumed by the market core.
#[async_trait]
pub trait Chain: Send + Sync {
    /// Create and persist a block signed only by us.
    fn create_source_block(
        &self,
        block_type: BlockType,
        payload: BlockPayload,
    ) -> Result<Block, ChainError>;

    /// Create a half-block addressed to `peer` and wait for the counter-signed
    /// half. Returns `(our_block, counter_block)`.
    async fn sign_block(
        &self,
        peer: TraderId,
        block_type: BlockType,
        payload: BlockPayload,
    ) -> Result<(Block, Block), ChainError>;

    /// Persist a block received from elsewhere (idempotent).
    fn persist(&self, block: &Block);

    fn get_linked(&self, block: &Block) -> Option<Block>;

    fn get_block_with_hash(&self, hash: &BlockHash) -> Option<Block>;

    /// Gossip a block to the network with a time-to-live.
    fn send_block(&self, block: Block, ttl: u32);

    /// Send a block to one specific peer.
    fn send_block_to(&self, address: std::net::SocketAddr, block: Block);

    /// Gossip a co-signed pair.
    fn send_block_pair(&self, block: Block, linked: Block);
}

/// In-process chain: blocks are stored in memory, counterparties counter-sign
/// immediately, and gossiped blocks accumulate in an outbox the driver (or a
/// test) distributes.
pub struct MemoryChain {
    me: TraderId,
    clock: crate::models::Clock,
    seq: AtomicU64,
    blocks: Mutex<HashMap<BlockHash, Block>>,
    outgoing: Mutex<Vec<Block>>,
    outgoing_direct: Mutex<Vec<(std::net::SocketAddr, Block)>>,
}

impl MemoryChain {
    pub fn new(me: TraderId, clock: crate::models::Clock) -> Arc<Self> {
        Arc::new(Self {
            me,
            clock,
            seq: AtomicU64::new(0),
            blocks: Mutex::new(HashMap::new()),
            outgoing: Mutex::new(Vec::new()),
            outgoing_direct: Mutex::new(Vec::new()),
        })
    }

    /// Drain the blocks gossiped since the last call.
    pub fn take_outgoing(&self) -> Vec<Block> {
        std::mem::take(&mut *self.outgoing.lock())
    }

    /// Drain the blocks sent to specific peers since the last call.
    pub fn take_outgoing_direct(&self) -> Vec<(std::net::SocketAddr, Block)> {
        std::mem::take(&mut *self.outgoing_direct.lock())
    }

    fn hash_block(
        &self,
        block_type: BlockType,
        payload: &BlockPayload,
        creator: &TraderId,
        seq: u64,
    ) -> Result<BlockHash, ChainError> {
        let body = serde_json::to_vec(payload)
            .map_err(|err| ChainError::Serialization(err.to_string()))?;
        let mut hasher = Keccak256::new();
        hasher.update(block_type.to_string().as_bytes());
        hasher.update(&body);
        hasher.update(creator.as_bytes());
        hasher.update(seq.to_be_bytes());
        Ok(BlockHash(hasher.finalize().into()))
    }
}

impl MemoryChain {
    fn build_block(
        &self,
        block_type: BlockType,
        payload: BlockPayload,
        creator: TraderId,
        linked: Option<TraderId>,
    ) -> Result<Block, ChainError> {
        let seq = self.seq.fetch_add(1, AtomicOrdering::Relaxed);
        let hash = self.hash_block(block_type, &payload, &creator, seq)?;
        Ok(Block {
            block_type,
            payload,
            creator,
            linked,
            link_hash: None,
            timestamp: self.clock.now(),
            hash,
        })
    }
}

#[async_trait]
impl Chain for MemoryChain {
    fn create_source_block(
        &self,
        block_type: BlockType,
        payload: BlockPayload,
    ) -> Result<Block, ChainError> {
        let block = self.build_block(block_type, payload, self.me, None)?;
        self.blocks.lock().insert(block.hash, block.clone());
        Ok(block)
    }

    async fn sign_block(
        &self,
        peer: TraderId,
        block_type: BlockType,
        payload: BlockPayload,
    ) -> Result<(Block, Block), ChainError> {
        let mut ours = self.build_block(block_type, payload.clone(), self.me, Some(peer))?;
        let mut theirs = self.build_block(block_type, payload, peer, Some(self.me))?;
        ours.link_hash = Some(theirs.hash);
        theirs.link_hash = Some(ours.hash);

        let mut blocks = self.blocks.lock();
        blocks.insert(ours.hash, ours.clone());
        blocks.insert(theirs.hash, theirs.clone());
        Ok((ours, theirs))
    }

    fn persist(&self, block: &Block) {
        self.blocks.lock().entry(block.hash).or_insert_with(|| block.clone());
    }

    fn get_linked(&self, block: &Block) -> Option<Block> {
        let hash = block.link_hash?;
        self.blocks.lock().get(&hash).cloned()
    }

    fn get_block_with_hash(&self, hash: &BlockHash) -> Option<Block> {
        self.blocks.lock().get(hash).cloned()
    }

    fn send_block(&self, block: Block, _ttl: u32) {
        self.outgoing.lock().push(block);
    }

    fn send_block_to(&self, address: std::net::SocketAddr, block: Block) {
        self.outgoing_direct.lock().push((address, block));
    }

    fn send_block_pair(&self, block: Block, linked: Block) {
        let mut outgoing = self.outgoing.lock();
        outgoing.push(block);
        outgoing.push(linked);
    }
}
