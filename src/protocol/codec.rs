//! Binary message framing.
//!
//! Every frame is `tag: u8` followed by the payload fields in declaration
//! order: trader ids as 20 raw bytes, numbers as big-endian unsigned,
//! strings length-prefixed with a big-endian u16, booleans as one byte.
//! Block pairs travel as a length-prefixed JSON blob since blocks belong to
//! the chain layer's schema, not ours.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::chain::Block;
use crate::models::{
    AssetAmount, AssetPair, OrderId, OrderSnapshot, Timestamp, TraderId, TransactionId,
    TRADER_ID_LEN,
};

use super::*;

/// Decoding errors. Malformed frames are dropped by the router, never fatal.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("unknown message tag {0}")]
    UnknownTag(u8),

    #[error("frame truncated")]
    Truncated,

    #[error("invalid utf-8 in string field")]
    InvalidUtf8,

    #[error("unknown decline reason {0}")]
    UnknownReason(u8),

    #[error("invalid asset pair")]
    InvalidAssetPair,

    #[error("malformed block blob: {0}")]
    MalformedBlock(#[from] serde_json::Error),
}

/// Encode a message into a wire frame.
pub fn encode(message: &Message) -> Bytes {
    let mut buf = BytesMut::with_capacity(128);
    buf.put_u8(message.tag());
    match message {
        Message::Match(p) => {
            put_trader_id(&mut buf, &p.trader_id);
            buf.put_u64(p.timestamp.0);
            buf.put_u64(p.order_number);
            put_asset_pair(&mut buf, &p.assets);
            buf.put_u8(p.is_ask as u8);
            buf.put_u64(p.timeout);
            buf.put_u64(p.tick_timestamp.0);
            buf.put_u64(p.traded);
            buf.put_u64(p.recipient_order_number);
            put_trader_id(&mut buf, &p.matchmaker_trader_id);
        }
        Message::MatchDecline(p) => {
            put_trader_id(&mut buf, &p.trader_id);
            buf.put_u64(p.timestamp.0);
            buf.put_u64(p.order_number);
            put_order_id(&mut buf, &p.other_order_id);
            buf.put_u8(p.decline_reason as u8);
        }
        Message::ProposedTrade(p) | Message::CounterTrade(p) => {
            put_trade(&mut buf, p);
        }
        Message::DeclinedTrade(p) => {
            put_trader_id(&mut buf, &p.trader_id);
            buf.put_u64(p.timestamp.0);
            buf.put_u32(p.proposal_id);
            put_order_id(&mut buf, &p.order_id);
            put_order_id(&mut buf, &p.recipient_order_id);
            buf.put_u8(p.decline_reason as u8);
        }
        Message::StartTransaction(p) => {
            put_trader_id(&mut buf, &p.trader_id);
            buf.put_u64(p.timestamp.0);
            put_trader_id(&mut buf, &p.transaction_id.trader_id);
            buf.put_u64(p.transaction_id.transaction_number);
            put_order_id(&mut buf, &p.order_id);
            put_order_id(&mut buf, &p.recipient_order_id);
            buf.put_u32(p.proposal_id);
            put_asset_pair(&mut buf, &p.assets);
        }
        Message::WalletInfo(p) => {
            put_trader_id(&mut buf, &p.trader_id);
            buf.put_u64(p.timestamp.0);
            put_trader_id(&mut buf, &p.transaction_id.trader_id);
            buf.put_u64(p.transaction_id.transaction_number);
            put_string(&mut buf, &p.incoming_address);
            put_string(&mut buf, &p.outgoing_address);
        }
        Message::Payment(p) => {
            put_trader_id(&mut buf, &p.trader_id);
            buf.put_u64(p.timestamp.0);
            put_trader_id(&mut buf, &p.transaction_id.trader_id);
            buf.put_u64(p.transaction_id.transaction_number);
            put_string(&mut buf, &p.payment_id);
            put_asset_amount(&mut buf, &p.transferred);
            buf.put_u8(p.success as u8);
        }
        Message::OrderStatusRequest(p) => {
            put_trader_id(&mut buf, &p.trader_id);
            buf.put_u64(p.timestamp.0);
            put_order_id(&mut buf, &p.order_id);
            buf.put_u32(p.identifier);
        }
        Message::OrderStatusResponse(p) => {
            buf.put_u64(p.timestamp.0);
            put_trader_id(&mut buf, &p.order.trader_id);
            buf.put_u64(p.order.order_number);
            put_asset_pair(&mut buf, &p.order.assets);
            buf.put_u64(p.order.traded);
            buf.put_u64(p.order.timeout);
            buf.put_u64(p.order.timestamp.0);
            buf.put_u32(p.identifier);
        }
        Message::BookSync(p) => {
            put_trader_id(&mut buf, &p.trader_id);
            buf.put_u64(p.timestamp.0);
            buf.put_u32(p.filter.bitmap.len() as u32);
            buf.put_slice(&p.filter.bitmap);
            buf.put_u64(p.filter.bits);
            buf.put_u32(p.filter.hashes);
            for (k0, k1) in p.filter.sip_keys {
                buf.put_u64(k0);
                buf.put_u64(k1);
            }
        }
        Message::Ping(p) | Message::Pong(p) => {
            put_trader_id(&mut buf, &p.trader_id);
            buf.put_u64(p.timestamp.0);
            buf.put_u32(p.identifier);
        }
        Message::MatchDone(p) => {
            let blob = serde_json::to_vec(&(&p.block, &p.linked)).unwrap_or_default();
            buf.put_u32(blob.len() as u32);
            buf.put_slice(&blob);
        }
    }
    buf.freeze()
}

/// Decode a wire frame into a message.
pub fn decode(frame: &[u8]) -> Result<Message, CodecError> {
    let mut buf = frame;
    let tag = get_u8(&mut buf)?;
    let message = match tag {
        MSG_MATCH => Message::Match(MatchPayload {
            trader_id: get_trader_id(&mut buf)?,
            timestamp: Timestamp(get_u64(&mut buf)?),
            order_number: get_u64(&mut buf)?,
            assets: get_asset_pair(&mut buf)?,
            is_ask: get_bool(&mut buf)?,
            timeout: get_u64(&mut buf)?,
            tick_timestamp: Timestamp(get_u64(&mut buf)?),
            traded: get_u64(&mut buf)?,
            recipient_order_number: get_u64(&mut buf)?,
            matchmaker_trader_id: get_trader_id(&mut buf)?,
        }),
        MSG_MATCH_DECLINE => Message::MatchDecline(DeclineMatchPayload {
            trader_id: get_trader_id(&mut buf)?,
            timestamp: Timestamp(get_u64(&mut buf)?),
            order_number: get_u64(&mut buf)?,
            other_order_id: get_order_id(&mut buf)?,
            decline_reason: {
                let raw = get_u8(&mut buf)?;
                DeclineMatchReason::from_u8(raw).ok_or(CodecError::UnknownReason(raw))?
            },
        }),
        MSG_PROPOSED_TRADE => Message::ProposedTrade(get_trade(&mut buf)?),
        MSG_COUNTER_TRADE => Message::CounterTrade(get_trade(&mut buf)?),
        MSG_DECLINED_TRADE => Message::DeclinedTrade(DeclineTradePayload {
            trader_id: get_trader_id(&mut buf)?,
            timestamp: Timestamp(get_u64(&mut buf)?),
            proposal_id: get_u32(&mut buf)?,
            order_id: get_order_id(&mut buf)?,
            recipient_order_id: get_order_id(&mut buf)?,
            decline_reason: {
                let raw = get_u8(&mut buf)?;
                DeclinedTradeReason::from_u8(raw).ok_or(CodecError::UnknownReason(raw))?
            },
        }),
        MSG_START_TX => Message::StartTransaction(StartTransactionPayload {
            trader_id: get_trader_id(&mut buf)?,
            timestamp: Timestamp(get_u64(&mut buf)?),
            transaction_id: get_transaction_id(&mut buf)?,
            order_id: get_order_id(&mut buf)?,
            recipient_order_id: get_order_id(&mut buf)?,
            proposal_id: get_u32(&mut buf)?,
            assets: get_asset_pair(&mut buf)?,
        }),
        MSG_WALLET_INFO => Message::WalletInfo(WalletInfoPayload {
            trader_id: get_trader_id(&mut buf)?,
            timestamp: Timestamp(get_u64(&mut buf)?),
            transaction_id: get_transaction_id(&mut buf)?,
            incoming_address: get_string(&mut buf)?,
            outgoing_address: get_string(&mut buf)?,
        }),
        MSG_PAYMENT => Message::Payment(PaymentPayload {
            trader_id: get_trader_id(&mut buf)?,
            timestamp: Timestamp(get_u64(&mut buf)?),
            transaction_id: get_transaction_id(&mut buf)?,
            payment_id: get_string(&mut buf)?,
            transferred: get_asset_amount(&mut buf)?,
            success: get_bool(&mut buf)?,
        }),
        MSG_ORDER_QUERY => Message::OrderStatusRequest(OrderStatusRequestPayload {
            trader_id: get_trader_id(&mut buf)?,
            timestamp: Timestamp(get_u64(&mut buf)?),
            order_id: get_order_id(&mut buf)?,
            identifier: get_u32(&mut buf)?,
        }),
        MSG_ORDER_RESPONSE => Message::OrderStatusResponse(OrderStatusResponsePayload {
            timestamp: Timestamp(get_u64(&mut buf)?),
            order: OrderSnapshot {
                trader_id: get_trader_id(&mut buf)?,
                order_number: get_u64(&mut buf)?,
                assets: get_asset_pair(&mut buf)?,
                traded: get_u64(&mut buf)?,
                timeout: get_u64(&mut buf)?,
                timestamp: Timestamp(get_u64(&mut buf)?),
            },
            identifier: get_u32(&mut buf)?,
        }),
        MSG_BOOK_SYNC => Message::BookSync(BookSyncPayload {
            trader_id: get_trader_id(&mut buf)?,
            timestamp: Timestamp(get_u64(&mut buf)?),
            filter: {
                let len = get_u32(&mut buf)? as usize;
                let bitmap = get_bytes(&mut buf, len)?;
                SyncFilter {
                    bitmap,
                    bits: get_u64(&mut buf)?,
                    hashes: get_u32(&mut buf)?,
                    sip_keys: [
                        (get_u64(&mut buf)?, get_u64(&mut buf)?),
                        (get_u64(&mut buf)?, get_u64(&mut buf)?),
                    ],
                }
            },
        }),
        MSG_PING => Message::Ping(get_ping_pong(&mut buf)?),
        MSG_PONG => Message::Pong(get_ping_pong(&mut buf)?),
        MSG_MATCH_DONE => {
            let len = get_u32(&mut buf)? as usize;
            let blob = get_bytes(&mut buf, len)?;
            let (block, linked): (Block, Block) = serde_json::from_slice(&blob)?;
            Message::MatchDone(MatchDonePayload { block, linked })
        }
        other => return Err(CodecError::UnknownTag(other)),
    };
    Ok(message)
}

// ==================== field writers ====================

fn put_trader_id(buf: &mut BytesMut, id: &TraderId) {
    buf.put_slice(id.as_bytes());
}

fn put_order_id(buf: &mut BytesMut, id: &OrderId) {
    put_trader_id(buf, &id.trader_id);
    buf.put_u64(id.order_number);
}

fn put_string(buf: &mut BytesMut, s: &str) {
    buf.put_u16(s.len() as u16);
    buf.put_slice(s.as_bytes());
}

fn put_asset_amount(buf: &mut BytesMut, amount: &AssetAmount) {
    buf.put_u64(amount.amount);
    put_string(buf, &amount.asset_id);
}

fn put_asset_pair(buf: &mut BytesMut, pair: &AssetPair) {
    put_asset_amount(buf, &pair.first);
    put_asset_amount(buf, &pair.second);
}

fn put_trade(buf: &mut BytesMut, trade: &TradePayload) {
    put_trader_id(buf, &trade.trader_id);
    buf.put_u64(trade.timestamp.0);
    buf.put_u32(trade.proposal_id);
    put_order_id(buf, &trade.order_id);
    put_order_id(buf, &trade.recipient_order_id);
    put_asset_pair(buf, &trade.assets);
}

// ==================== field readers ====================

fn get_u8(buf: &mut &[u8]) -> Result<u8, CodecError> {
    if buf.remaining() < 1 {
        return Err(CodecError::Truncated);
    }
    Ok(buf.get_u8())
}

fn get_u32(buf: &mut &[u8]) -> Result<u32, CodecError> {
    if buf.remaining() < 4 {
        return Err(CodecError::Truncated);
    }
    Ok(buf.get_u32())
}

fn get_u64(buf: &mut &[u8]) -> Result<u64, CodecError> {
    if buf.remaining() < 8 {
        return Err(CodecError::Truncated);
    }
    Ok(buf.get_u64())
}

fn get_bool(buf: &mut &[u8]) -> Result<bool, CodecError> {
    Ok(get_u8(buf)? != 0)
}

fn get_bytes(buf: &mut &[u8], len: usize) -> Result<Vec<u8>, CodecError> {
    if buf.remaining() < len {
        return Err(CodecError::Truncated);
    }
    let mut out = vec![0u8; len];
    buf.copy_to_slice(&mut out);
    Ok(out)
}

fn get_trader_id(buf: &mut &[u8]) -> Result<TraderId, CodecError> {
    let raw = get_bytes(buf, TRADER_ID_LEN)?;
    let bytes: [u8; TRADER_ID_LEN] = raw.try_into().map_err(|_| CodecError::Truncated)?;
    Ok(TraderId(bytes))
}

fn get_order_id(buf: &mut &[u8]) -> Result<OrderId, CodecError> {
    Ok(OrderId::new(get_trader_id(buf)?, get_u64(buf)?))
}

fn get_transaction_id(buf: &mut &[u8]) -> Result<TransactionId, CodecError> {
    Ok(TransactionId::new(get_trader_id(buf)?, get_u64(buf)?))
}

fn get_string(buf: &mut &[u8]) -> Result<String, CodecError> {
    if buf.remaining() < 2 {
        return Err(CodecError::Truncated);
    }
    let len = buf.get_u16() as usize;
    let raw = get_bytes(buf, len)?;
    String::from_utf8(raw).map_err(|_| CodecError::InvalidUtf8)
}

fn get_asset_amount(buf: &mut &[u8]) -> Result<AssetAmount, CodecError> {
    let amount = get_u64(buf)?;
    let asset_id = get_string(buf)?;
    Ok(AssetAmount { amount, asset_id })
}

fn get_asset_pair(buf: &mut &[u8]) -> Result<AssetPair, CodecError> {
    let first = get_asset_amount(buf)?;
    let second = get_asset_amount(buf)?;
    AssetPair::new(first, second).map_err(|_| CodecError::InvalidAssetPair)
}

fn get_trade(buf: &mut &[u8]) -> Result<TradePayload, CodecError> {
    Ok(TradePayload {
        trader_id: get_trader_id(buf)?,
        timestamp: Timestamp(get_u64(buf)?),
        proposal_id: get_u32(buf)?,
        order_id: get_order_id(buf)?,
        recipient_order_id: get_order_id(buf)?,
        assets: get_asset_pair(buf)?,
    })
}

fn get_ping_pong(buf: &mut &[u8]) -> Result<PingPongPayload, CodecError> {
    Ok(PingPongPayload {
        trader_id: get_trader_id(buf)?,
        timestamp: Timestamp(get_u64(buf)?),
        identifier: get_u32(buf)?,
    })
}
