//! Inbound signed-block handling.
//!
//! Blocks reach us through chain gossip. Ticks feed the orderbook, cancel
//! blocks retire them, and counter-signed `tx_done` blocks close the loop on
//! settlements we took part in.

use crate::chain::{Block, BlockPayload, BlockType, PROTOCOL_VERSION};
use crate::models::{OrderId, TransactionStatus};

use super::MarketCommunity;

impl MarketCommunity {
    /// Consume one block delivered by the chain layer.
    pub async fn handle_block(&mut self, block: Block) {
        if block.payload.version() != PROTOCOL_VERSION {
            tracing::debug!(version = block.payload.version(), "ignoring block of foreign protocol version");
            return;
        }
        self.chain().persist(&block);
        match block.block_type {
            BlockType::Ask | BlockType::Bid => self.process_tick_block(block).await,
            BlockType::TxInit => self.process_tx_init_block(block).await,
            BlockType::TxDone => self.process_tx_done_block(block).await,
            BlockType::CancelOrder => self.process_cancel_order_block(block),
            // Payment blocks are framing only; the Payment message drives us.
            BlockType::TxPayment => {}
        }
    }

    async fn process_tick_block(&mut self, block: Block) {
        let payload = match &block.payload {
            BlockPayload::Tick(payload) => payload,
            _ => {
                tracing::warn!("tick block with mismatched payload");
                return;
            }
        };
        let expected_ask = block.block_type == BlockType::Ask;
        if payload.tick.is_ask != expected_ask {
            tracing::warn!(order = %payload.tick.order_id, "tick side does not match block type");
            return;
        }
        if !self.is_matchmaker() {
            return;
        }

        let mut tick = payload.tick.clone();
        tick.block_hash = block.hash;
        let order_id = tick.order_id;
        let now = self.now();

        let inserted = match self.order_book_mut() {
            Some(book) => book.insert_tick(tick, now),
            None => false,
        };
        if !inserted {
            return;
        }
        tracing::info!(order = %order_id, "inserted tick from block");

        // Give this node's own orders first shot at the new tick.
        let local_ticks: Vec<OrderId> = {
            let book = match self.order_book() {
                Some(book) => book,
                None => return,
            };
            self.orders()
                .filter(|order| order.is_open(now) && book.tick_exists(&order.order_id))
                .map(|order| order.order_id)
                .collect()
        };
        for local_order_id in local_ticks {
            self.announce_matches_for(local_order_id).await;
        }
        self.announce_matches_for(order_id).await;
    }

    async fn process_tx_init_block(&mut self, block: Block) {
        let payload = match &block.payload {
            BlockPayload::TxInit(payload) => payload.clone(),
            _ => {
                tracing::warn!("tx_init block with mismatched payload");
                return;
            }
        };
        if self.is_matchmaker() {
            self.match_order_ids(&[payload.ask.order_id(), payload.bid.order_id()]).await;
        }
        self.record_transaction(payload.tx);
    }

    async fn process_tx_done_block(&mut self, block: Block) {
        let payload = match &block.payload {
            BlockPayload::TxDone(payload) => payload.clone(),
            _ => {
                tracing::warn!("tx_done block with mismatched payload");
                return;
            }
        };

        if block.linked == Some(self.trader_id()) && block.creator != self.trader_id() {
            // Our counterparty finalized the settlement with our signature;
            // report it to the matchmakers that brokered the match.
            let transaction_id = payload.tx.transaction_id();
            let already_completed = self
                .transaction(&transaction_id)
                .map(|transaction| transaction.status == TransactionStatus::Completed);
            if already_completed == Some(false) {
                if let Some(transaction) = self.transaction_mut(&transaction_id) {
                    transaction.status = TransactionStatus::Completed;
                }
                tracing::info!(transaction = %transaction_id, "counter-signed tx_done observed, settlement finished");
                let snapshot = self.transaction(&transaction_id).map(|t| t.to_snapshot());
                if let Some(snapshot) = snapshot {
                    self.record_transaction(snapshot);
                }
                self.send_matched_transaction_completed(transaction_id, block.clone()).await;
            }
        }

        if self.is_matchmaker() {
            let fresh = self.mark_tx_done_seen(block.hash);
            let fresh_linked =
                block.link_hash.map(|hash| self.mark_tx_done_seen(hash)).unwrap_or(true);
            if !fresh && !fresh_linked {
                return;
            }
            let transferred = payload.tx.transferred.first.amount;
            if let Some(book) = self.order_book_mut() {
                book.update_ticks(&payload.ask, &payload.bid, transferred);
            }
            self.match_order_ids(&[payload.ask.order_id(), payload.bid.order_id()]).await;
        }
        self.record_transaction(payload.tx);
    }

    fn process_cancel_order_block(&mut self, block: Block) {
        let payload = match &block.payload {
            BlockPayload::Cancel(payload) => payload,
            _ => {
                tracing::warn!("cancel block with mismatched payload");
                return;
            }
        };
        let order_id = OrderId::new(payload.trader_id, payload.order_number);
        if let Some(book) = self.order_book_mut() {
            book.remove_tick(&order_id);
            book.cancelled_orders.insert(order_id);
            tracing::info!(order = %order_id, "tick cancelled by block");
        }
    }
}
