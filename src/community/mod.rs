//! The market community: order lifecycle, matchmaking, trade negotiation and
//! settlement over a peer-to-peer network.
//!
//! The community is a single owned value driven by one task. Inbound frames,
//! inbound blocks and the periodic timer tick are the only entry points;
//! every handler runs to completion on `&mut self`, so in-memory state is
//! totally ordered and block-producing operations are naturally serialized.
//! Handlers re-validate order and cache state after every capability await.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;

use rand::Rng;
use tokio::sync::oneshot;

use crate::chain::{
    BlockPayload, BlockType, CancelPayload, Chain, ChainError, TickPayload, PROTOCOL_VERSION,
};
use crate::config::AppConfig;
use crate::models::{
    AssetError, AssetPair, Clock, Order, OrderError, OrderId, Tick, Timestamp, TraderId,
    Transaction, TransactionId, TransactionSnapshot, WalletAddress,
};
use crate::network::{Dht, Network, PeerDirectory};
use crate::protocol::{
    codec, BookSyncPayload, Message, PingPongPayload, SyncFilter,
};
use crate::services::match_cache::MATCH_CACHE_TIMEOUT_MS;
use crate::services::matching::{self, OrderBook};
use crate::services::requests::{CacheData, CacheKind, RequestCache, PING_TIMEOUT_MS};
use crate::wallet::Wallet;

mod blocks;
mod negotiation;
mod settlement;

/// Request-boundary errors surfaced to the local caller.
#[derive(Debug, thiserror::Error)]
pub enum MarketError {
    #[error(transparent)]
    Asset(#[from] AssetError),

    #[error("no {0} wallet present, create it first")]
    MissingWallet(String),

    #[error("amount is below the minimum unit of the {0} wallet")]
    BelowMinUnit(String),

    #[error("order timeout {timeout} ms exceeds the maximum of {max} ms")]
    TimeoutTooLong { timeout: u64, max: u64 },

    #[error("unknown order {0}")]
    UnknownOrder(OrderId),

    #[error("order {0} can no longer be cancelled")]
    NotCancellable(OrderId),

    #[error(transparent)]
    Chain(#[from] ChainError),

    #[error(transparent)]
    Order(#[from] OrderError),
}

/// A matchmaker MATCH announcement waiting on its send jitter.
#[derive(Debug, Clone)]
struct DeferredMatch {
    due: Timestamp,
    tick_order_id: OrderId,
    recipient_order_id: OrderId,
}

/// The market community. See the module docs for the execution model.
pub struct MarketCommunity {
    pub config: AppConfig,
    clock: Clock,
    trader_id: TraderId,
    address: SocketAddr,
    network: Arc<dyn Network>,
    chain: Arc<dyn Chain>,
    dht: Option<Arc<dyn Dht>>,
    wallets: HashMap<String, Arc<dyn Wallet>>,
    pub directory: PeerDirectory,
    orders: HashMap<OrderId, Order>,
    next_order_number: u64,
    transactions: HashMap<TransactionId, Transaction>,
    next_transaction_number: u64,
    pub request_cache: RequestCache,
    order_book: Option<OrderBook>,
    matchmakers: HashSet<TraderId>,
    sent_matches: HashSet<(OrderId, OrderId)>,
    deferred_matches: Vec<DeferredMatch>,
    matching_enabled: bool,
    /// Hashes of `tx_done` blocks already folded into the book, so replays
    /// cannot double-count settled quantity.
    seen_tx_done: HashSet<crate::chain::BlockHash>,
    /// Observed settlements, kept when `record_transactions` is on.
    recorded_transactions: HashMap<TransactionId, TransactionSnapshot>,
}

impl MarketCommunity {
    pub fn new(
        config: AppConfig,
        clock: Clock,
        trader_id: TraderId,
        address: SocketAddr,
        network: Arc<dyn Network>,
        chain: Arc<dyn Chain>,
        dht: Option<Arc<dyn Dht>>,
        wallets: HashMap<String, Arc<dyn Wallet>>,
    ) -> Self {
        let order_book = config.is_matchmaker.then(OrderBook::new);
        tracing::info!(trader = %trader_id, matchmaker = config.is_matchmaker, "market community initialized");
        Self {
            config,
            clock,
            trader_id,
            address,
            network,
            chain,
            dht,
            wallets,
            directory: PeerDirectory::new(),
            orders: HashMap::new(),
            next_order_number: 1,
            transactions: HashMap::new(),
            next_transaction_number: 1,
            request_cache: RequestCache::new(),
            order_book,
            matchmakers: HashSet::new(),
            sent_matches: HashSet::new(),
            deferred_matches: Vec::new(),
            matching_enabled: true,
            seen_tx_done: HashSet::new(),
            recorded_transactions: HashMap::new(),
        }
    }

    pub fn trader_id(&self) -> TraderId {
        self.trader_id
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    pub fn is_matchmaker(&self) -> bool {
        self.order_book.is_some()
    }

    pub fn order(&self, order_id: &OrderId) -> Option<&Order> {
        self.orders.get(order_id)
    }

    pub fn orders(&self) -> impl Iterator<Item = &Order> {
        self.orders.values()
    }

    pub fn transaction(&self, transaction_id: &TransactionId) -> Option<&Transaction> {
        self.transactions.get(transaction_id)
    }

    pub fn transactions(&self) -> impl Iterator<Item = &Transaction> {
        self.transactions.values()
    }

    pub fn order_book(&self) -> Option<&OrderBook> {
        self.order_book.as_ref()
    }

    pub fn matchmakers(&self) -> &HashSet<TraderId> {
        &self.matchmakers
    }

    pub fn recorded_transactions(&self) -> &HashMap<TransactionId, TransactionSnapshot> {
        &self.recorded_transactions
    }

    /// Volunteer as a matchmaker (starts with an empty book).
    pub fn enable_matchmaker(&mut self) {
        if self.order_book.is_none() {
            self.order_book = Some(OrderBook::new());
        }
    }

    pub fn disable_matchmaker(&mut self) {
        self.order_book = None;
    }

    pub fn set_matching_enabled(&mut self, enabled: bool) {
        self.matching_enabled = enabled;
    }

    // ==================== sending ====================

    pub(crate) fn send_message(&self, address: SocketAddr, message: &Message) {
        tracing::trace!(%address, kind = message.name(), "sending message");
        self.network.send(address, codec::encode(message));
    }

    /// Send to a trader we already know an address for.
    pub(crate) fn send_to_trader(&self, trader_id: &TraderId, message: &Message) {
        match self.directory.lookup(trader_id) {
            Some(address) => self.send_message(address, message),
            None => {
                tracing::warn!(trader = %trader_id, kind = message.name(), "no address for trader, dropping message")
            }
        }
    }

    /// Resolve a trader's address, falling back to the DHT.
    pub(crate) async fn get_address_for_trader(&mut self, trader_id: &TraderId) -> Option<SocketAddr> {
        if *trader_id == self.trader_id {
            return Some(self.address);
        }
        if let Some(address) = self.directory.lookup(trader_id) {
            return Some(address);
        }
        tracing::info!(trader = %trader_id, "address not known locally, doing DHT lookup");
        let dht = self.dht.clone()?;
        let address = dht.resolve(*trader_id).await?;
        self.directory.update(*trader_id, address);
        Some(address)
    }

    // ==================== order creation / cancellation ====================

    fn verify_offer_creation(&self, assets: &AssetPair, timeout: u64) -> Result<(), MarketError> {
        for leg in [&assets.first, &assets.second] {
            let wallet = self
                .wallets
                .get(&leg.asset_id)
                .ok_or_else(|| MarketError::MissingWallet(leg.asset_id.clone()))?;
            if !wallet.created() {
                return Err(MarketError::MissingWallet(leg.asset_id.clone()));
            }
            if leg.amount < wallet.min_unit() {
                return Err(MarketError::BelowMinUnit(leg.asset_id.clone()));
            }
        }
        if timeout > self.config.max_order_timeout_ms {
            return Err(MarketError::TimeoutTooLong {
                timeout,
                max: self.config.max_order_timeout_ms,
            });
        }
        Ok(())
    }

    /// Create an ask order (selling the base asset).
    pub async fn create_ask(&mut self, assets: AssetPair, timeout: u64) -> Result<OrderId, MarketError> {
        self.create_order(assets, true, timeout).await
    }

    /// Create a bid order (buying the base asset).
    pub async fn create_bid(&mut self, assets: AssetPair, timeout: u64) -> Result<OrderId, MarketError> {
        self.create_order(assets, false, timeout).await
    }

    async fn create_order(
        &mut self,
        assets: AssetPair,
        is_ask: bool,
        timeout: u64,
    ) -> Result<OrderId, MarketError> {
        self.verify_offer_creation(&assets, timeout)?;

        let order_number = self.next_order_number;
        self.next_order_number += 1;
        let order_id = OrderId::new(self.trader_id, order_number);
        let order = Order::new(order_id, assets.clone(), is_ask, timeout, self.now());
        let mut tick = Tick::from_order(&order);
        self.orders.insert(order_id, order);

        let block_type = if is_ask { BlockType::Ask } else { BlockType::Bid };
        let payload = BlockPayload::Tick(TickPayload { tick: tick.clone(), version: PROTOCOL_VERSION });
        let block = self.chain.create_source_block(block_type, payload)?;
        self.chain.send_block(block.clone(), 2);

        // The creation block exists, the order is now live.
        if let Some(order) = self.orders.get_mut(&order_id) {
            order.set_verified();
        }

        if self.is_matchmaker() {
            tick.block_hash = block.hash;
            let now = self.now();
            if let Some(book) = self.order_book.as_mut() {
                book.insert_tick(tick, now);
            }
            self.announce_matches_for(order_id).await;
        }

        tracing::info!(order = %order_id, %assets, ask = is_ask, "order created");
        Ok(order_id)
    }

    /// Cancel a local order that is still open or unverified.
    pub async fn cancel_order(&mut self, order_id: &OrderId) -> Result<(), MarketError> {
        let now = self.now();
        let order = self.orders.get_mut(order_id).ok_or(MarketError::UnknownOrder(*order_id))?;
        let status = order.status(now);
        if !matches!(status, crate::models::OrderStatus::Open | crate::models::OrderStatus::Unverified) {
            return Err(MarketError::NotCancellable(*order_id));
        }
        order.cancel();
        let verified = order.verified;

        if let Some(book) = self.order_book.as_mut() {
            book.remove_tick(order_id);
            book.cancelled_orders.insert(*order_id);
        }

        if verified {
            let payload = BlockPayload::Cancel(CancelPayload {
                trader_id: order_id.trader_id,
                order_number: order_id.order_number,
                version: PROTOCOL_VERSION,
            });
            let block = self.chain.create_source_block(BlockType::CancelOrder, payload)?;
            self.chain.send_block(block, 2);
        }
        tracing::info!(order = %order_id, "order cancelled");
        Ok(())
    }

    // ==================== matchmaking ====================

    /// Run matching for the ticks with the given order ids.
    pub(crate) async fn match_order_ids(&mut self, order_ids: &[OrderId]) {
        for order_id in order_ids {
            let exists = self
                .order_book
                .as_ref()
                .map(|book| book.tick_exists(order_id))
                .unwrap_or(false);
            if exists {
                self.announce_matches_for(*order_id).await;
            }
        }
    }

    /// Find counterparties for one tick and announce the pairing to both
    /// owners.
    pub(crate) async fn announce_matches_for(&mut self, order_id: OrderId) {
        if !self.matching_enabled {
            return;
        }
        let now = self.now();
        let matched = match self.order_book.as_ref() {
            Some(book) => matching::match_tick(book, &order_id, now),
            None => return,
        };
        if matched.is_empty() {
            return;
        }
        tracing::debug!(order = %order_id, candidates = matched.len(), "matched tick");
        for counter_id in matched {
            self.send_match_message(counter_id, order_id).await;
            self.send_match_message(order_id, counter_id).await;
        }
    }

    /// Announce the tick with `tick_order_id` to the owner of
    /// `recipient_order_id`, honoring the configured send jitter.
    pub(crate) async fn send_match_message(
        &mut self,
        tick_order_id: OrderId,
        recipient_order_id: OrderId,
    ) {
        if self.sent_matches.contains(&(recipient_order_id, tick_order_id)) {
            return;
        }
        self.sent_matches.insert((recipient_order_id, tick_order_id));

        if self.config.match_send_interval_ms > 0 {
            let jitter = rand::thread_rng().gen_range(0..=self.config.match_send_interval_ms);
            self.deferred_matches.push(DeferredMatch {
                due: self.now().plus(jitter),
                tick_order_id,
                recipient_order_id,
            });
            return;
        }
        self.dispatch_match_message(tick_order_id, recipient_order_id).await;
    }

    async fn dispatch_match_message(&mut self, tick_order_id: OrderId, recipient_order_id: OrderId) {
        let tick = match self
            .order_book
            .as_ref()
            .and_then(|book| book.get_tick(&tick_order_id))
        {
            Some(entry) => entry.tick.clone(),
            None => return,
        };
        let address = match self.get_address_for_trader(&recipient_order_id.trader_id).await {
            Some(address) => address,
            None => {
                tracing::warn!(trader = %recipient_order_id.trader_id, "cannot resolve match recipient");
                return;
            }
        };
        tracing::info!(
            tick = %tick_order_id,
            recipient = %recipient_order_id,
            "announcing match"
        );
        let message = Message::Match(crate::protocol::MatchPayload {
            trader_id: tick.order_id.trader_id,
            timestamp: self.now(),
            order_number: tick.order_id.order_number,
            assets: tick.assets.clone(),
            is_ask: tick.is_ask,
            timeout: tick.timeout,
            tick_timestamp: tick.timestamp,
            traded: tick.traded,
            recipient_order_number: recipient_order_id.order_number,
            matchmaker_trader_id: self.trader_id,
        });
        self.send_message(address, &message);
    }

    pub(crate) fn add_matchmaker(&mut self, trader_id: TraderId) {
        if trader_id != self.trader_id {
            self.matchmakers.insert(trader_id);
        }
    }

    // ==================== peer handshake & orderbook sync ====================

    /// Called by the discovery layer whenever a peer introduces itself.
    pub fn peer_discovered(&mut self, trader_id: TraderId, address: SocketAddr, is_matchmaker: bool) {
        self.directory.update(trader_id, address);
        if is_matchmaker {
            self.add_matchmaker(trader_id);
        }
        if self.is_matchmaker() {
            self.send_orderbook_sync(address);
        }
    }

    /// Send the peer a membership filter over our current order ids.
    pub(crate) fn send_orderbook_sync(&self, address: SocketAddr) {
        let book = match self.order_book.as_ref() {
            Some(book) => book,
            None => return,
        };
        tracing::debug!(%address, orders = book.len(), "sending orderbook sync");
        let mut bloom =
            bloomfilter::Bloom::new_for_fp_rate(book.len().max(1), 0.005);
        for order_id in book.order_ids() {
            bloom.set(&order_id_filter_key(order_id));
        }
        let message = Message::BookSync(BookSyncPayload {
            trader_id: self.trader_id,
            timestamp: self.now(),
            filter: SyncFilter {
                bitmap: bloom.bitmap(),
                bits: bloom.number_of_bits(),
                hashes: bloom.number_of_hash_functions(),
                sip_keys: bloom.sip_keys(),
            },
        });
        self.send_message(address, &message);
    }

    pub(crate) fn received_orderbook_sync(&mut self, from: SocketAddr, payload: BookSyncPayload) {
        let book = match self.order_book.as_ref() {
            Some(book) => book,
            None => return,
        };
        let bloom = bloomfilter::Bloom::from_existing(
            &payload.filter.bitmap,
            payload.filter.bits,
            payload.filter.hashes,
            payload.filter.sip_keys,
        );
        let missing: Vec<OrderId> = book
            .order_ids()
            .filter(|order_id| !bloom.check(&order_id_filter_key(order_id)))
            .copied()
            .collect();

        let mut rng = rand::thread_rng();
        let sample = rand::seq::index::sample(
            &mut rng,
            missing.len(),
            missing.len().min(self.config.num_order_sync),
        );
        for index in sample {
            let order_id = missing[index];
            let block_hash = match book.get_tick(&order_id) {
                Some(entry) => entry.tick.block_hash,
                None => continue,
            };
            if let Some(block) = self.chain.get_block_with_hash(&block_hash) {
                self.chain.send_block_to(from, block);
            }
        }
    }

    // ==================== ping / pong ====================

    /// Ping a peer; the returned channel resolves `true` on a pong within the
    /// deadline, `false` otherwise.
    pub fn ping_peer(&mut self, trader_id: &TraderId) -> oneshot::Receiver<bool> {
        let (sender, receiver) = oneshot::channel();
        let identifier = self.request_cache.unused_number(CacheKind::Ping);
        let deadline = self.now().plus(PING_TIMEOUT_MS);
        self.request_cache.insert(
            CacheKind::Ping,
            identifier as u64,
            deadline,
            CacheData::Ping(sender),
        );
        let message = Message::Ping(PingPongPayload {
            trader_id: self.trader_id,
            timestamp: self.now(),
            identifier,
        });
        self.send_to_trader(trader_id, &message);
        receiver
    }

    fn received_ping(&mut self, from: SocketAddr, payload: PingPongPayload) {
        let message = Message::Pong(PingPongPayload {
            trader_id: self.trader_id,
            timestamp: self.now(),
            identifier: payload.identifier,
        });
        self.send_message(from, &message);
    }

    fn received_pong(&mut self, payload: PingPongPayload) {
        match self.request_cache.pop(CacheKind::Ping, payload.identifier as u64) {
            Some(CacheData::Ping(sender)) => {
                let _ = sender.send(true);
            }
            _ => tracing::warn!(identifier = payload.identifier, "ping cache entry not found"),
        }
    }

    // ==================== router ====================

    /// Decode and dispatch one authenticated inbound frame.
    pub async fn handle_frame(&mut self, from: SocketAddr, frame: &[u8]) {
        match codec::decode(frame) {
            Ok(message) => self.handle_message(from, message).await,
            Err(err) => {
                tracing::warn!(%from, error = %err, "dropping malformed frame");
            }
        }
    }

    /// Dispatch one inbound message to its handler.
    pub async fn handle_message(&mut self, from: SocketAddr, message: Message) {
        if let Some(sender) = message_sender(&message) {
            if sender != self.trader_id {
                self.directory.update(sender, from);
            }
        }
        match message {
            Message::Match(payload) => self.received_match(from, payload).await,
            Message::MatchDecline(payload) => self.received_decline_match(payload).await,
            Message::ProposedTrade(payload) => self.received_proposed_trade(payload).await,
            Message::DeclinedTrade(payload) => self.received_decline_trade(payload).await,
            Message::CounterTrade(payload) => self.received_counter_trade(payload).await,
            Message::StartTransaction(payload) => self.received_start_transaction(payload).await,
            Message::WalletInfo(payload) => self.received_wallet_info(payload).await,
            Message::Payment(payload) => self.received_payment_message(payload).await,
            Message::OrderStatusRequest(payload) => self.received_order_status_request(from, payload),
            Message::OrderStatusResponse(payload) => self.received_order_status(payload).await,
            Message::BookSync(payload) => self.received_orderbook_sync(from, payload),
            Message::Ping(payload) => self.received_ping(from, payload),
            Message::Pong(payload) => self.received_pong(payload),
            Message::MatchDone(payload) => self.received_matched_tx_complete(payload).await,
        }
    }

    // ==================== timers ====================

    /// Run every due timer: request-cache deadlines, match batch windows,
    /// delayed proposals, deferred announcements and tick expiry.
    pub async fn poll_timers(&mut self) {
        let now = self.now();

        for ((_kind, number), data) in self.request_cache.take_expired(now) {
            match data {
                CacheData::ProposedTrade(trade) => {
                    tracing::info!(proposal = number, "proposed trade timed out");
                    self.proposed_trade_timed_out(trade).await;
                }
                CacheData::Ping(sender) => {
                    let _ = sender.send(false);
                }
                CacheData::OrderStatus(purpose) => {
                    tracing::warn!(?purpose, "no order status response in time");
                }
                CacheData::Match(cache) => {
                    tracing::debug!(order = %cache.order_id, "match cache expired after inactivity");
                }
            }
        }

        // Match cache batch windows and delayed proposals.
        let mut batches = Vec::new();
        let mut proposals = Vec::new();
        for cache in self.request_cache.match_caches_mut() {
            if cache.schedule_at.map(|due| due <= now).unwrap_or(false) {
                cache.schedule_at = None;
                cache.schedule_done = true;
                batches.push(cache.order_id);
            }
            if cache.pending_propose.as_ref().map(|p| p.due <= now).unwrap_or(false) {
                if let Some(pending) = cache.pending_propose.take() {
                    proposals.push((cache.order_id, pending.counter_order_id));
                }
            }
        }
        for order_id in batches {
            self.start_process_matches(order_id).await;
        }
        for (order_id, counter_order_id) in proposals {
            self.accept_match_and_propose(order_id, counter_order_id).await;
        }

        // Deferred MATCH announcements.
        let due: Vec<DeferredMatch> = {
            let (ready, waiting): (Vec<_>, Vec<_>) =
                self.deferred_matches.drain(..).partition(|m| m.due <= now);
            self.deferred_matches = waiting;
            ready
        };
        for deferred in due {
            self.dispatch_match_message(deferred.tick_order_id, deferred.recipient_order_id).await;
        }

        // Tick expiry.
        if let Some(book) = self.order_book.as_mut() {
            for order_id in book.expire_due(now) {
                tracing::info!(order = %order_id, "tick expired, removed from orderbook");
            }
        }
    }

    /// Clear all caches; cleanup paths of outstanding exchanges run.
    pub async fn shutdown(&mut self) {
        for (_, data) in self.request_cache.clear() {
            match data {
                CacheData::ProposedTrade(trade) => self.proposed_trade_timed_out(trade).await,
                CacheData::Ping(sender) => {
                    let _ = sender.send(false);
                }
                _ => {}
            }
        }
        tracing::info!(trader = %self.trader_id, "market community shut down");
    }

    pub(crate) fn record_transaction(&mut self, snapshot: TransactionSnapshot) {
        if self.config.record_transactions {
            self.recorded_transactions.insert(snapshot.transaction_id(), snapshot);
        }
    }

    /// Incoming and outgoing payment addresses for an order: the incoming
    /// address receives the leg we buy, the outgoing address pays the leg we
    /// sell.
    pub(crate) fn get_order_addresses(
        &self,
        order: &Order,
    ) -> Result<(WalletAddress, WalletAddress), MarketError> {
        let base = &order.assets.first.asset_id;
        let quote = &order.assets.second.asset_id;
        let wallet_address = |asset_id: &String| -> Result<WalletAddress, MarketError> {
            self.wallets
                .get(asset_id)
                .map(|wallet| wallet.get_address())
                .ok_or_else(|| MarketError::MissingWallet(asset_id.clone()))
        };
        if order.is_ask {
            Ok((wallet_address(quote)?, wallet_address(base)?))
        } else {
            Ok((wallet_address(base)?, wallet_address(quote)?))
        }
    }

    pub(crate) fn wallet(&self, asset_id: &str) -> Option<Arc<dyn Wallet>> {
        self.wallets.get(asset_id).cloned()
    }

    pub(crate) fn chain(&self) -> Arc<dyn Chain> {
        self.chain.clone()
    }

    pub(crate) fn order_mut(&mut self, order_id: &OrderId) -> Option<&mut Order> {
        self.orders.get_mut(order_id)
    }

    pub(crate) fn transaction_mut(&mut self, transaction_id: &TransactionId) -> Option<&mut Transaction> {
        self.transactions.get_mut(transaction_id)
    }

    pub(crate) fn insert_transaction(&mut self, transaction: Transaction) {
        self.transactions.insert(transaction.transaction_id, transaction);
    }

    pub(crate) fn next_transaction_id(&mut self) -> TransactionId {
        let number = self.next_transaction_number;
        self.next_transaction_number += 1;
        TransactionId::new(self.trader_id, number)
    }

    pub(crate) fn order_book_mut(&mut self) -> Option<&mut OrderBook> {
        self.order_book.as_mut()
    }

    pub(crate) fn match_cache_deadline(&self) -> Timestamp {
        self.now().plus(MATCH_CACHE_TIMEOUT_MS)
    }

    /// Returns false when this `tx_done` block was already processed.
    pub(crate) fn mark_tx_done_seen(&mut self, hash: crate::chain::BlockHash) -> bool {
        self.seen_tx_done.insert(hash)
    }
}

/// Key under which an order id is inserted into the sync membership filter.
fn order_id_filter_key(order_id: &OrderId) -> Vec<u8> {
    let mut key = Vec::with_capacity(28);
    key.extend_from_slice(order_id.trader_id.as_bytes());
    key.extend_from_slice(&order_id.order_number.to_be_bytes());
    key
}

/// The authenticated sender named in a message payload, used to keep the
/// peer directory fresh.
fn message_sender(message: &Message) -> Option<TraderId> {
    match message {
        Message::Match(p) => Some(p.matchmaker_trader_id),
        Message::MatchDecline(p) => Some(p.trader_id),
        Message::ProposedTrade(p) | Message::CounterTrade(p) => Some(p.trader_id),
        Message::DeclinedTrade(p) => Some(p.trader_id),
        Message::StartTransaction(p) => Some(p.trader_id),
        Message::WalletInfo(p) => Some(p.trader_id),
        Message::Payment(p) => Some(p.trader_id),
        Message::OrderStatusRequest(p) => Some(p.trader_id),
        Message::OrderStatusResponse(p) => Some(p.order.trader_id),
        Message::BookSync(p) => Some(p.trader_id),
        Message::Ping(p) | Message::Pong(p) => Some(p.trader_id),
        Message::MatchDone(_) => None,
    }
}

#[cfg(test)]
mod tests;
