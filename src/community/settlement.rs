//! The settlement protocol: start-tx, order-status queries, wallet info
//! exchange, payments, and the bilateral `tx_init` / `tx_done` blocks.
//!
//! Strictly ordered: a side only advances once the previous step's durable
//! artifact exists (a signed block, or a payment accepted by the wallet).
//! The whole protocol is advanced by message arrivals; the order-status
//! round-trips carry a purpose tag in the request cache instead of blocking
//! the event loop.

use crate::chain::{BlockPayload, BlockType, TxInitDonePayload, TxPaymentPayload, PROTOCOL_VERSION};
use crate::models::{
    OrderId, OrderSnapshot, Payment, TraderId, Transaction, TransactionId, TransactionStatus,
    WalletAddress,
};
use crate::protocol::{
    MatchDonePayload, Message, OrderStatusRequestPayload, OrderStatusResponsePayload,
    PaymentPayload, StartTransactionPayload, WalletInfoPayload,
};
use crate::services::requests::{
    CacheData, CacheKind, StatusRequestPurpose, ORDER_STATUS_TIMEOUT_MS,
};

use super::MarketCommunity;

impl MarketCommunity {
    // ==================== transaction creation ====================

    /// Accepting side: create the settlement record and invite the proposer.
    pub(crate) async fn start_transaction(&mut self, trade: &crate::protocol::TradePayload) {
        let now = self.now();
        let transaction_id = self.next_transaction_id();
        let transaction = Transaction::new(
            transaction_id,
            trade.recipient_order_id,
            trade.order_id,
            trade.assets.clone(),
            now,
        );
        self.insert_transaction(transaction);
        tracing::info!(
            transaction = %transaction_id,
            order = %trade.recipient_order_id,
            partner = %trade.order_id,
            "starting transaction"
        );
        let message = Message::StartTransaction(StartTransactionPayload {
            trader_id: self.trader_id(),
            timestamp: now,
            transaction_id,
            order_id: trade.recipient_order_id,
            recipient_order_id: trade.order_id,
            proposal_id: trade.proposal_id,
            assets: trade.assets.clone(),
        });
        self.send_to_trader(&trade.trader_id, &message);
    }

    /// Proposing side: our proposal was accepted as-is.
    pub(crate) async fn received_start_transaction(&mut self, payload: StartTransactionPayload) {
        if self
            .request_cache
            .pop(CacheKind::ProposedTrade, payload.proposal_id as u64)
            .is_none()
        {
            tracing::warn!(proposal = payload.proposal_id, "start transaction for unknown proposal");
            return;
        }
        if payload.recipient_order_id.trader_id != self.trader_id()
            || self.order(&payload.recipient_order_id).is_none()
        {
            tracing::warn!(order = %payload.recipient_order_id, "start transaction for unknown order");
            return;
        }

        let now = self.now();
        let transaction = Transaction::new(
            payload.transaction_id,
            payload.recipient_order_id,
            payload.order_id,
            payload.assets.clone(),
            now,
        );
        self.insert_transaction(transaction);
        tracing::info!(transaction = %payload.transaction_id, "transaction accepted, querying partner order");

        // The exact partner order snapshot goes into the tx_init block.
        self.send_order_status_request(
            payload.order_id,
            StatusRequestPurpose::TxInit(payload.transaction_id),
        );
    }

    // ==================== order status query ====================

    pub(crate) fn send_order_status_request(
        &mut self,
        order_id: OrderId,
        purpose: StatusRequestPurpose,
    ) {
        let identifier = self.request_cache.unused_number(CacheKind::OrderStatus);
        let deadline = self.now().plus(ORDER_STATUS_TIMEOUT_MS);
        self.request_cache.insert(
            CacheKind::OrderStatus,
            identifier as u64,
            deadline,
            CacheData::OrderStatus(purpose),
        );
        tracing::debug!(order = %order_id, identifier, "sending order status request");
        let message = Message::OrderStatusRequest(OrderStatusRequestPayload {
            trader_id: self.trader_id(),
            timestamp: self.now(),
            order_id,
            identifier,
        });
        self.send_to_trader(&order_id.trader_id, &message);
    }

    pub(crate) fn received_order_status_request(
        &mut self,
        from: std::net::SocketAddr,
        payload: OrderStatusRequestPayload,
    ) {
        let snapshot = match self.order(&payload.order_id) {
            Some(order) => order.to_snapshot(),
            None => {
                tracing::warn!(order = %payload.order_id, "status request for unknown order");
                return;
            }
        };
        let message = Message::OrderStatusResponse(OrderStatusResponsePayload {
            timestamp: self.now(),
            order: snapshot,
            identifier: payload.identifier,
        });
        self.send_message(from, &message);
    }

    pub(crate) async fn received_order_status(&mut self, payload: OrderStatusResponsePayload) {
        let purpose = match self.request_cache.pop(CacheKind::OrderStatus, payload.identifier as u64)
        {
            Some(CacheData::OrderStatus(purpose)) => purpose,
            _ => {
                tracing::warn!(identifier = payload.identifier, "unsolicited order status response");
                return;
            }
        };
        match purpose {
            StatusRequestPurpose::TxInit(transaction_id) => {
                self.build_tx_init(transaction_id, payload.order).await;
            }
            StatusRequestPurpose::TxDone(transaction_id) => {
                self.build_tx_done(transaction_id, payload.order).await;
            }
        }
    }

    /// Both parties' order snapshots, ask side first.
    fn side_ordered_snapshots(
        &self,
        transaction_id: &TransactionId,
        partner: OrderSnapshot,
    ) -> Option<(TraderId, OrderSnapshot, OrderSnapshot)> {
        let transaction = self.transaction(transaction_id)?;
        let order = self.order(&transaction.order_id)?;
        let mine = order.to_snapshot();
        let partner_trader = transaction.partner_order_id.trader_id;
        if order.is_ask {
            Some((partner_trader, mine, partner))
        } else {
            Some((partner_trader, partner, mine))
        }
    }

    // ==================== tx_init ====================

    async fn build_tx_init(&mut self, transaction_id: TransactionId, partner: OrderSnapshot) {
        let (partner_trader, ask, bid) = match self.side_ordered_snapshots(&transaction_id, partner)
        {
            Some(parts) => parts,
            None => return,
        };
        let tx = match self.transaction(&transaction_id) {
            Some(transaction) => transaction.to_snapshot(),
            None => return,
        };
        let payload =
            BlockPayload::TxInit(TxInitDonePayload { ask, bid, tx, version: PROTOCOL_VERSION });

        match self.chain().sign_block(partner_trader, BlockType::TxInit, payload).await {
            Ok(_) => {
                tracing::info!(transaction = %transaction_id, "tx_init co-signed");
                self.send_wallet_info(transaction_id).await;
            }
            Err(err) => {
                tracing::error!(transaction = %transaction_id, error = %err, "tx_init signing failed");
                self.abort_transaction(transaction_id);
            }
        }
    }

    // ==================== wallet info ====================

    pub(crate) async fn send_wallet_info(&mut self, transaction_id: TransactionId) {
        let addresses = {
            let transaction = match self.transaction(&transaction_id) {
                Some(transaction) => transaction,
                None => return,
            };
            match self.order(&transaction.order_id) {
                Some(order) => self.get_order_addresses(order),
                None => return,
            }
        };
        let (incoming, outgoing) = match addresses {
            Ok(addresses) => addresses,
            Err(err) => {
                tracing::error!(transaction = %transaction_id, error = %err, "wallet unavailable");
                self.abort_transaction(transaction_id);
                return;
            }
        };

        let partner_trader = match self.transaction_mut(&transaction_id) {
            Some(transaction) => {
                transaction.incoming_address = Some(incoming.clone());
                transaction.outgoing_address = Some(outgoing.clone());
                transaction.sent_wallet_info = true;
                if transaction.received_wallet_info {
                    transaction.status = TransactionStatus::WalletInfoExchanged;
                }
                transaction.partner_order_id.trader_id
            }
            None => return,
        };
        let message = Message::WalletInfo(WalletInfoPayload {
            trader_id: self.trader_id(),
            timestamp: self.now(),
            transaction_id,
            incoming_address: incoming.0,
            outgoing_address: outgoing.0,
        });
        tracing::debug!(transaction = %transaction_id, "sending wallet info");
        self.send_to_trader(&partner_trader, &message);
    }

    pub(crate) async fn received_wallet_info(&mut self, payload: WalletInfoPayload) {
        let transaction_id = payload.transaction_id;
        let already_sent = match self.transaction_mut(&transaction_id) {
            Some(transaction) => {
                transaction.received_wallet_info = true;
                transaction.partner_incoming_address =
                    Some(WalletAddress(payload.incoming_address.clone()));
                transaction.partner_outgoing_address =
                    Some(WalletAddress(payload.outgoing_address.clone()));
                if transaction.sent_wallet_info {
                    transaction.status = TransactionStatus::WalletInfoExchanged;
                }
                transaction.sent_wallet_info
            }
            None => {
                tracing::warn!(transaction = %transaction_id, "wallet info for unknown transaction");
                return;
            }
        };
        tracing::info!(transaction = %transaction_id, "received wallet info");

        // The wallet-info flags are the only guard against a reply loop: a
        // side that already sent its own proceeds to the payment phase.
        if already_sent {
            self.send_payment(transaction_id).await;
        } else {
            self.send_wallet_info(transaction_id).await;
        }
    }

    // ==================== payments ====================

    pub(crate) async fn send_payment(&mut self, transaction_id: TransactionId) {
        let (is_ask, asset_id, destination) = {
            let transaction = match self.transaction(&transaction_id) {
                Some(transaction) => transaction,
                None => return,
            };
            let order = match self.order(&transaction.order_id) {
                Some(order) => order,
                None => return,
            };
            let asset_id = if order.is_ask {
                transaction.assets.first.asset_id.clone()
            } else {
                transaction.assets.second.asset_id.clone()
            };
            (order.is_ask, asset_id, transaction.partner_incoming_address.clone())
        };

        let wallet = match self.wallet(&asset_id) {
            Some(wallet) if wallet.created() => wallet,
            _ => {
                tracing::error!(transaction = %transaction_id, asset = %asset_id, "no wallet for payment");
                let zero = crate::models::AssetAmount::new(0, asset_id);
                self.send_payment_message(transaction_id, String::new(), zero, false).await;
                return;
            }
        };

        let incremental = self.config.use_incremental_payments;
        let transfer = match self.transaction(&transaction_id) {
            Some(transaction) => transaction.next_payment(is_ask, wallet.min_unit(), incremental),
            None => return,
        };

        if transfer.amount == 0 {
            // Our leg is already complete; an empty payment keeps the
            // alternation going until the partner's leg is done too.
            self.send_payment_message(transaction_id, String::new(), transfer, true).await;
            return;
        }

        let destination = match destination {
            Some(destination) => destination,
            None => {
                tracing::error!(transaction = %transaction_id, "partner wallet address missing");
                self.send_payment_message(transaction_id, String::new(), transfer, false).await;
                return;
            }
        };

        if let Some(transaction) = self.transaction_mut(&transaction_id) {
            transaction.status = TransactionStatus::Paying;
        }

        tracing::info!(
            transaction = %transaction_id,
            amount = transfer.amount,
            asset = %transfer.asset_id,
            "sending payment"
        );
        match wallet.transfer(transfer.amount, &destination).await {
            Ok(payment_id) => {
                self.send_payment_message(transaction_id, payment_id, transfer, true).await;
            }
            Err(err) => {
                tracing::error!(transaction = %transaction_id, error = %err, "payment failed");
                self.send_payment_message(transaction_id, String::new(), transfer, false).await;
            }
        }
    }

    async fn send_payment_message(
        &mut self,
        transaction_id: TransactionId,
        payment_id: String,
        transferred: crate::models::AssetAmount,
        success: bool,
    ) {
        if !success {
            self.abort_transaction(transaction_id);
        }

        let (order_id, partner_order_id) = match self.transaction(&transaction_id) {
            Some(transaction) => (transaction.order_id, transaction.partner_order_id),
            None => return,
        };

        // The ask side's traded quantity advances as its base leg leaves.
        if success && transferred.amount > 0 {
            let is_ask = self.order(&order_id).map(|order| order.is_ask).unwrap_or(false);
            if is_ask {
                if let Some(order) = self.order_mut(&order_id) {
                    if let Err(err) = order.add_trade(&partner_order_id, transferred.amount) {
                        tracing::warn!(order = %order_id, error = %err, "trade accounting failed");
                    }
                }
            }
        }

        let payment = Payment {
            trader_id: self.trader_id(),
            transaction_id,
            payment_id,
            transferred,
            timestamp: self.now(),
            success,
        };
        if let Some(transaction) = self.transaction_mut(&transaction_id) {
            transaction.add_payment(payment.clone());
        }

        let message = Message::Payment(PaymentPayload {
            trader_id: payment.trader_id,
            timestamp: payment.timestamp,
            transaction_id,
            payment_id: payment.payment_id,
            transferred: payment.transferred,
            success,
        });
        self.send_to_trader(&partner_order_id.trader_id, &message);
    }

    pub(crate) async fn received_payment_message(&mut self, payload: PaymentPayload) {
        let transaction_id = payload.transaction_id;
        match self.transaction(&transaction_id) {
            Some(transaction) if !transaction.is_payment_complete() => {}
            _ => {
                tracing::warn!(transaction = %transaction_id, "payment for unknown or finished transaction");
                return;
            }
        }

        if !payload.success {
            tracing::info!(transaction = %transaction_id, "partner payment failed, aborting");
            let payment = Payment {
                trader_id: payload.trader_id,
                transaction_id,
                payment_id: payload.payment_id,
                transferred: payload.transferred,
                timestamp: payload.timestamp,
                success: false,
            };
            if let Some(transaction) = self.transaction_mut(&transaction_id) {
                transaction.add_payment(payment);
            }
            self.abort_transaction(transaction_id);
            return;
        }

        // Wait for the ledger to actually include the payment.
        if payload.transferred.amount > 0 {
            let wallet = match self.wallet(&payload.transferred.asset_id) {
                Some(wallet) => wallet,
                None => {
                    tracing::warn!(asset = %payload.transferred.asset_id, "payment in unknown asset");
                    return;
                }
            };
            if let Err(err) = wallet.monitor_transaction(&payload.payment_id).await {
                tracing::warn!(transaction = %transaction_id, error = %err, "payment never confirmed");
                return;
            }
        }

        // The transaction may have aborted while we watched the ledger.
        match self.transaction(&transaction_id) {
            Some(transaction) if transaction.status != TransactionStatus::Aborted => {}
            _ => return,
        }
        self.received_payment(payload).await;
    }

    async fn received_payment(&mut self, payload: PaymentPayload) {
        let transaction_id = payload.transaction_id;
        tracing::info!(
            transaction = %transaction_id,
            amount = payload.transferred.amount,
            asset = %payload.transferred.asset_id,
            "payment confirmed"
        );
        let payment = Payment {
            trader_id: payload.trader_id,
            transaction_id,
            payment_id: payload.payment_id,
            transferred: payload.transferred.clone(),
            timestamp: payload.timestamp,
            success: true,
        };
        let (order_id, partner_order_id) = match self.transaction_mut(&transaction_id) {
            Some(transaction) => {
                transaction.add_payment(payment.clone());
                transaction.status = TransactionStatus::Paying;
                (transaction.order_id, transaction.partner_order_id)
            }
            None => return,
        };

        // The bid side's traded quantity advances as the base leg arrives.
        if payload.transferred.amount > 0 {
            let is_ask = self.order(&order_id).map(|order| order.is_ask).unwrap_or(true);
            if !is_ask {
                if let Some(order) = self.order_mut(&order_id) {
                    if let Err(err) = order.add_trade(&partner_order_id, payload.transferred.amount) {
                        tracing::warn!(order = %order_id, error = %err, "trade accounting failed");
                    }
                }
            }
        }

        // Record the confirmed payment on the chain with the payer.
        let block_payload =
            BlockPayload::TxPayment(TxPaymentPayload { payment, version: PROTOCOL_VERSION });
        if let Err(err) = self
            .chain()
            .sign_block(partner_order_id.trader_id, BlockType::TxPayment, block_payload)
            .await
        {
            tracing::error!(transaction = %transaction_id, error = %err, "tx_payment signing failed");
            return;
        }

        let complete = self
            .transaction(&transaction_id)
            .map(|transaction| transaction.is_payment_complete())
            .unwrap_or(false);
        if !complete {
            self.send_payment(transaction_id).await;
        } else {
            self.send_order_status_request(
                partner_order_id,
                StatusRequestPurpose::TxDone(transaction_id),
            );
        }
    }

    // ==================== abort ====================

    /// Release everything the transaction still holds and mark it aborted.
    pub(crate) fn abort_transaction(&mut self, transaction_id: TransactionId) {
        let (order_id, partner_order_id, remaining) = match self.transaction_mut(&transaction_id) {
            Some(transaction) if transaction.status != TransactionStatus::Aborted => {
                transaction.status = TransactionStatus::Aborted;
                (
                    transaction.order_id,
                    transaction.partner_order_id,
                    transaction
                        .assets
                        .first
                        .amount
                        .saturating_sub(transaction.transferred.first.amount),
                )
            }
            _ => return,
        };
        tracing::error!(transaction = %transaction_id, remaining, "aborting transaction");
        if remaining > 0 {
            if let Some(order) = self.order_mut(&order_id) {
                if let Err(err) = order.release_for_tick(&partner_order_id, remaining) {
                    tracing::warn!(order = %order_id, error = %err, "release on abort failed");
                }
            }
        }
    }

    // ==================== tx_done ====================

    async fn build_tx_done(&mut self, transaction_id: TransactionId, partner: OrderSnapshot) {
        let (partner_trader, ask, bid) = match self.side_ordered_snapshots(&transaction_id, partner)
        {
            Some(parts) => parts,
            None => return,
        };
        let tx = match self.transaction(&transaction_id) {
            Some(transaction) => transaction.to_snapshot(),
            None => return,
        };
        let payload =
            BlockPayload::TxDone(TxInitDonePayload { ask, bid, tx, version: PROTOCOL_VERSION });

        match self.chain().sign_block(partner_trader, BlockType::TxDone, payload).await {
            Ok((block, _counter)) => {
                tracing::info!(transaction = %transaction_id, "tx_done co-signed, settlement finished");
                if let Some(transaction) = self.transaction_mut(&transaction_id) {
                    transaction.status = TransactionStatus::Completed;
                }
                let snapshot = self.transaction(&transaction_id).map(|t| t.to_snapshot());
                if let Some(snapshot) = snapshot {
                    self.record_transaction(snapshot);
                }
                self.send_matched_transaction_completed(transaction_id, block).await;
            }
            Err(err) => {
                tracing::error!(transaction = %transaction_id, error = %err, "tx_done signing failed");
            }
        }
    }

    /// Tell every matchmaker that announced this counterparty that the
    /// settlement is finalized, then keep working the match queue.
    pub(crate) async fn send_matched_transaction_completed(
        &mut self,
        transaction_id: TransactionId,
        block: crate::chain::Block,
    ) {
        let (order_id, partner_order_id) = match self.transaction(&transaction_id) {
            Some(transaction) => (transaction.order_id, transaction.partner_order_id),
            None => return,
        };
        let linked = self.chain().get_linked(&block).unwrap_or_else(|| block.clone());

        let deadline = self.match_cache_deadline();
        let matchmakers: Vec<TraderId> = match self.request_cache.match_cache_mut(order_id.order_number)
        {
            Some(cache) => {
                cache.outstanding_request = None;
                cache.pending_propose = None;
                if cache.matches.contains_key(&partner_order_id) {
                    cache.received_responses.insert(partner_order_id);
                    cache.matchmakers_for(&partner_order_id)
                } else {
                    Vec::new()
                }
            }
            None => Vec::new(),
        };
        self.request_cache.touch(CacheKind::Match, order_id.order_number, deadline);

        let message = Message::MatchDone(MatchDonePayload { block, linked });
        for matchmaker in matchmakers {
            tracing::info!(
                transaction = %transaction_id,
                matchmaker = %matchmaker,
                "reporting settled transaction to matchmaker"
            );
            self.send_to_trader(&matchmaker, &message);
        }

        let now = self.now();
        let open = self.order(&order_id).map(|order| order.is_open(now)).unwrap_or(false);
        if open {
            self.process_match(order_id).await;
        }
    }

    /// Matchmaker side of MATCH_DONE: fold the settled quantities into the
    /// book, re-match residuals, and re-broadcast the block pair.
    pub(crate) async fn received_matched_tx_complete(&mut self, payload: MatchDonePayload) {
        if !self.is_matchmaker() {
            return;
        }
        if payload.block.payload.version() != PROTOCOL_VERSION {
            return;
        }
        let done = match &payload.block.payload {
            BlockPayload::TxDone(done) => done.clone(),
            _ => {
                tracing::warn!("match-done carrying a non tx_done block");
                return;
            }
        };
        let fresh = self.mark_tx_done_seen(payload.block.hash);
        let fresh_linked = self.mark_tx_done_seen(payload.linked.hash);
        if !fresh && !fresh_linked {
            return;
        }
        self.chain().persist(&payload.block);
        self.chain().persist(&payload.linked);

        let transferred = done.tx.transferred.first.amount;
        if let Some(book) = self.order_book_mut() {
            book.update_ticks(&done.ask, &done.bid, transferred);
        }
        self.match_order_ids(&[done.ask.order_id(), done.bid.order_id()]).await;

        self.chain().send_block_pair(payload.block, payload.linked);
        self.record_transaction(done.tx);
    }
}
