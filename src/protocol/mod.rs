//! Wire protocol: typed message kinds and their tagged binary encoding.

use serde::{Deserialize, Serialize};

use crate::chain::Block;
use crate::models::{
    AssetAmount, AssetPair, OrderId, OrderNumber, OrderSnapshot, ProposalId, Timestamp, TraderId,
    TransactionId,
};

pub mod codec;

pub use codec::{decode, encode, CodecError};

// Message tags.
pub const MSG_MATCH: u8 = 7;
pub const MSG_MATCH_DECLINE: u8 = 9;
pub const MSG_PROPOSED_TRADE: u8 = 10;
pub const MSG_DECLINED_TRADE: u8 = 11;
pub const MSG_COUNTER_TRADE: u8 = 12;
pub const MSG_START_TX: u8 = 13;
pub const MSG_WALLET_INFO: u8 = 14;
pub const MSG_PAYMENT: u8 = 15;
pub const MSG_ORDER_QUERY: u8 = 16;
pub const MSG_ORDER_RESPONSE: u8 = 17;
pub const MSG_BOOK_SYNC: u8 = 19;
pub const MSG_PING: u8 = 20;
pub const MSG_PONG: u8 = 21;
pub const MSG_MATCH_DONE: u8 = 22;

/// Reason a peer declines a match back to the announcing matchmaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DeclineMatchReason {
    OrderCompleted = 0,
    OtherOrderCompleted = 1,
    OtherOrderCancelled = 2,
    Other = 3,
}

impl DeclineMatchReason {
    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::OrderCompleted),
            1 => Some(Self::OtherOrderCompleted),
            2 => Some(Self::OtherOrderCancelled),
            3 => Some(Self::Other),
            _ => None,
        }
    }
}

/// Reason a proposed or counter trade is declined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DeclinedTradeReason {
    OrderInvalid = 0,
    OrderCompleted = 1,
    OrderExpired = 2,
    OrderCancelled = 3,
    OrderReserved = 4,
    UnacceptablePrice = 5,
    NoAvailableQuantity = 6,
    AddressLookupFail = 7,
    Other = 8,
}

impl DeclinedTradeReason {
    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::OrderInvalid),
            1 => Some(Self::OrderCompleted),
            2 => Some(Self::OrderExpired),
            3 => Some(Self::OrderCancelled),
            4 => Some(Self::OrderReserved),
            5 => Some(Self::UnacceptablePrice),
            6 => Some(Self::NoAvailableQuantity),
            7 => Some(Self::AddressLookupFail),
            8 => Some(Self::Other),
            _ => None,
        }
    }
}

/// A matchmaker's hint that the recipient's order is compatible with a tick.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchPayload {
    /// Owner of the matched tick.
    pub trader_id: TraderId,
    pub timestamp: Timestamp,
    pub order_number: OrderNumber,
    pub assets: AssetPair,
    pub is_ask: bool,
    pub timeout: u64,
    pub tick_timestamp: Timestamp,
    pub traded: u64,
    /// Which of the recipient's orders this match is for.
    pub recipient_order_number: OrderNumber,
    pub matchmaker_trader_id: TraderId,
}

impl MatchPayload {
    pub fn tick_order_id(&self) -> OrderId {
        OrderId::new(self.trader_id, self.order_number)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeclineMatchPayload {
    pub trader_id: TraderId,
    pub timestamp: Timestamp,
    pub order_number: OrderNumber,
    pub other_order_id: OrderId,
    pub decline_reason: DeclineMatchReason,
}

/// A proposed or counter trade.
#[derive(Debug, Clone, PartialEq)]
pub struct TradePayload {
    pub trader_id: TraderId,
    pub timestamp: Timestamp,
    pub proposal_id: ProposalId,
    pub order_id: OrderId,
    pub recipient_order_id: OrderId,
    pub assets: AssetPair,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeclineTradePayload {
    pub trader_id: TraderId,
    pub timestamp: Timestamp,
    pub proposal_id: ProposalId,
    pub order_id: OrderId,
    pub recipient_order_id: OrderId,
    pub decline_reason: DeclinedTradeReason,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StartTransactionPayload {
    pub trader_id: TraderId,
    pub timestamp: Timestamp,
    pub transaction_id: TransactionId,
    pub order_id: OrderId,
    pub recipient_order_id: OrderId,
    pub proposal_id: ProposalId,
    pub assets: AssetPair,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WalletInfoPayload {
    pub trader_id: TraderId,
    pub timestamp: Timestamp,
    pub transaction_id: TransactionId,
    pub incoming_address: String,
    pub outgoing_address: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PaymentPayload {
    pub trader_id: TraderId,
    pub timestamp: Timestamp,
    pub transaction_id: TransactionId,
    pub payment_id: String,
    pub transferred: AssetAmount,
    pub success: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderStatusRequestPayload {
    pub trader_id: TraderId,
    pub timestamp: Timestamp,
    pub order_id: OrderId,
    pub identifier: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderStatusResponsePayload {
    pub timestamp: Timestamp,
    pub order: OrderSnapshot,
    pub identifier: u32,
}

/// Serialized set-membership filter over a matchmaker's order ids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncFilter {
    pub bitmap: Vec<u8>,
    pub bits: u64,
    pub hashes: u32,
    pub sip_keys: [(u64, u64); 2],
}

#[derive(Debug, Clone, PartialEq)]
pub struct BookSyncPayload {
    pub trader_id: TraderId,
    pub timestamp: Timestamp,
    pub filter: SyncFilter,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PingPongPayload {
    pub trader_id: TraderId,
    pub timestamp: Timestamp,
    pub identifier: u32,
}

/// Co-signed block pair of a completed transaction, forwarded to matchmakers.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchDonePayload {
    pub block: Block,
    pub linked: Block,
}

/// Every message kind the market router dispatches.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Match(MatchPayload),
    MatchDecline(DeclineMatchPayload),
    ProposedTrade(TradePayload),
    DeclinedTrade(DeclineTradePayload),
    CounterTrade(TradePayload),
    StartTransaction(StartTransactionPayload),
    WalletInfo(WalletInfoPayload),
    Payment(PaymentPayload),
    OrderStatusRequest(OrderStatusRequestPayload),
    OrderStatusResponse(OrderStatusResponsePayload),
    BookSync(BookSyncPayload),
    Ping(PingPongPayload),
    Pong(PingPongPayload),
    MatchDone(MatchDonePayload),
}

impl Message {
    pub fn tag(&self) -> u8 {
        match self {
            Message::Match(_) => MSG_MATCH,
            Message::MatchDecline(_) => MSG_MATCH_DECLINE,
            Message::ProposedTrade(_) => MSG_PROPOSED_TRADE,
            Message::DeclinedTrade(_) => MSG_DECLINED_TRADE,
            Message::CounterTrade(_) => MSG_COUNTER_TRADE,
            Message::StartTransaction(_) => MSG_START_TX,
            Message::WalletInfo(_) => MSG_WALLET_INFO,
            Message::Payment(_) => MSG_PAYMENT,
            Message::OrderStatusRequest(_) => MSG_ORDER_QUERY,
            Message::OrderStatusResponse(_) => MSG_ORDER_RESPONSE,
            Message::BookSync(_) => MSG_BOOK_SYNC,
            Message::Ping(_) => MSG_PING,
            Message::Pong(_) => MSG_PONG,
            Message::MatchDone(_) => MSG_MATCH_DONE,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Message::Match(_) => "match",
            Message::MatchDecline(_) => "match_decline",
            Message::ProposedTrade(_) => "proposed_trade",
            Message::DeclinedTrade(_) => "declined_trade",
            Message::CounterTrade(_) => "counter_trade",
            Message::StartTransaction(_) => "start_tx",
            Message::WalletInfo(_) => "wallet_info",
            Message::Payment(_) => "payment",
            Message::OrderStatusRequest(_) => "order_query",
            Message::OrderStatusResponse(_) => "order_response",
            Message::BookSync(_) => "book_sync",
            Message::Ping(_) => "ping",
            Message::Pong(_) => "pong",
            Message::MatchDone(_) => "match_done",
        }
    }
}
