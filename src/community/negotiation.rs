//! Match intake and the propose / counter / decline trade state machine.

use rand::Rng;

use crate::models::{OrderId, OrderStatus, TraderId};
use crate::protocol::{
    DeclineMatchPayload, DeclineMatchReason, DeclineTradePayload, DeclinedTradeReason,
    MatchPayload, Message, TradePayload,
};
use crate::services::match_cache::{MatchCache, PendingPropose};
use crate::services::requests::{CacheData, CacheKind, PROPOSED_TRADE_TIMEOUT_MS};

use super::MarketCommunity;

impl MarketCommunity {
    // ==================== match intake ====================

    /// A matchmaker told us one of our orders is compatible with a tick.
    pub(crate) async fn received_match(&mut self, _from: std::net::SocketAddr, payload: MatchPayload) {
        tracing::info!(
            matchmaker = %payload.matchmaker_trader_id,
            order_number = payload.recipient_order_number,
            other = %payload.tick_order_id(),
            "received match"
        );
        self.add_matchmaker(payload.matchmaker_trader_id);

        let order_id = OrderId::new(self.trader_id(), payload.recipient_order_number);
        let now = self.now();
        let (status, is_ask) = match self.order(&order_id) {
            Some(order) => (order.status(now), order.is_ask),
            None => {
                tracing::warn!(order = %order_id, "match for unknown order");
                return;
            }
        };

        if status != OrderStatus::Open {
            // Tell the matchmaker so it drops our tick.
            self.send_decline_match_message(
                order_id,
                payload.tick_order_id(),
                payload.matchmaker_trader_id,
                DeclineMatchReason::OrderCompleted,
            );
            return;
        }

        let deadline = self.match_cache_deadline();
        if self.request_cache.match_cache_mut(order_id.order_number).is_none() {
            self.request_cache.insert(
                CacheKind::Match,
                order_id.order_number,
                deadline,
                CacheData::Match(MatchCache::new(order_id, is_ask)),
            );
        }
        let window = self.config.match_window_ms;
        let outcome = match self.request_cache.match_cache_mut(order_id.order_number) {
            Some(cache) => cache.add_match(payload, now, window),
            None => return,
        };
        self.request_cache.touch(CacheKind::Match, order_id.order_number, deadline);

        if outcome == crate::services::match_cache::AddMatchOutcome::ProcessNow {
            self.process_match(order_id).await;
        }
    }

    /// The batch window of an order's match cache fired.
    pub(crate) async fn start_process_matches(&mut self, order_id: OrderId) {
        let now = self.now();
        let open = self.order(&order_id).map(|order| order.is_open(now)).unwrap_or(false);

        if !open {
            // The order finished while the batch was pending; let every
            // announcing matchmaker know.
            let pending: Vec<(OrderId, TraderId)> = match self
                .request_cache
                .match_cache_mut(order_id.order_number)
            {
                Some(cache) => {
                    let pending = cache
                        .matches
                        .iter()
                        .flat_map(|(other, payloads)| {
                            payloads.iter().map(|p| (*other, p.matchmaker_trader_id))
                        })
                        .collect();
                    cache.matches.clear();
                    while cache.queue.pop().is_some() {}
                    pending
                }
                None => return,
            };
            tracing::info!(order = %order_id, "order no longer open, declining batched matches");
            for (other_order_id, matchmaker) in pending {
                self.send_decline_match_message(
                    order_id,
                    other_order_id,
                    matchmaker,
                    DeclineMatchReason::OrderCompleted,
                );
            }
            return;
        }

        self.process_match(order_id).await;
    }

    /// Pop the best candidate and schedule the outgoing proposal.
    pub(crate) async fn process_match(&mut self, order_id: OrderId) {
        let now = self.now();
        let popped = match self.request_cache.match_cache_mut(order_id.order_number) {
            Some(cache) => {
                if cache.outstanding_request.is_some() || cache.pending_propose.is_some() {
                    return;
                }
                match cache.queue.pop() {
                    None => {
                        tracing::debug!(order = %order_id, "match queue drained");
                        None
                    }
                    Some(entry) => {
                        let first_attempt =
                            entry.retries == 0 && !cache.received_responses.contains(&entry.order_id);
                        let delay_ms = if first_attempt {
                            0
                        } else {
                            // Jitter retries so competing traders do not
                            // re-propose in lockstep.
                            rand::thread_rng().gen_range(1_000..=2_000)
                        };
                        let counter_order_id = entry.order_id;
                        cache.outstanding_request = Some(entry);
                        if delay_ms > 0 {
                            cache.pending_propose = Some(PendingPropose {
                                due: now.plus(delay_ms),
                                counter_order_id,
                            });
                            None
                        } else {
                            Some(counter_order_id)
                        }
                    }
                }
            }
            None => return,
        };

        if let Some(counter_order_id) = popped {
            self.accept_match_and_propose(order_id, counter_order_id).await;
        }
    }

    // ==================== propose ====================

    /// Accept a popped match and propose a trade to the counterparty.
    pub(crate) async fn accept_match_and_propose(
        &mut self,
        order_id: OrderId,
        counter_order_id: OrderId,
    ) {
        let now = self.now();
        let proposal_assets = match self.order(&order_id) {
            Some(order) => {
                let quantity = order.available_quantity();
                if quantity == 0 {
                    None
                } else {
                    order.assets.proportional_downscale(quantity)
                }
            }
            None => return,
        };

        let assets = match proposal_assets {
            Some(assets) => assets,
            None => {
                tracing::info!(order = %order_id, "no available quantity, not proposing");
                self.handle_cache_decline(
                    order_id,
                    counter_order_id,
                    DeclinedTradeReason::NoAvailableQuantity,
                )
                .await;
                return;
            }
        };

        let amount = assets.first.amount;
        if let Some(order) = self.order_mut(&order_id) {
            if let Err(err) = order.reserve_for_tick(counter_order_id, amount) {
                tracing::warn!(order = %order_id, error = %err, "reservation failed");
                self.handle_cache_decline(
                    order_id,
                    counter_order_id,
                    DeclinedTradeReason::NoAvailableQuantity,
                )
                .await;
                return;
            }
        }

        // The counterparty may only be known through the orderbook; resolve
        // its address before committing to the proposal.
        match self.get_address_for_trader(&counter_order_id.trader_id).await {
            Some(address) => {
                let proposal_id = self.request_cache.unused_number(CacheKind::ProposedTrade);
                let trade = TradePayload {
                    trader_id: self.trader_id(),
                    timestamp: now,
                    proposal_id,
                    order_id,
                    recipient_order_id: counter_order_id,
                    assets,
                };
                self.request_cache.insert(
                    CacheKind::ProposedTrade,
                    proposal_id as u64,
                    now.plus(PROPOSED_TRADE_TIMEOUT_MS),
                    CacheData::ProposedTrade(trade.clone()),
                );
                tracing::debug!(
                    order = %order_id,
                    counter = %counter_order_id,
                    proposal = proposal_id,
                    amount,
                    "sending proposed trade"
                );
                self.send_message(address, &Message::ProposedTrade(trade));
            }
            None => {
                if let Some(order) = self.order_mut(&order_id) {
                    let _ = order.release_for_tick(&counter_order_id, amount);
                }
                self.handle_cache_decline(
                    order_id,
                    counter_order_id,
                    DeclinedTradeReason::AddressLookupFail,
                )
                .await;
            }
        }
    }

    /// An outstanding proposal expired: roll the reservation back and let the
    /// match cache move on.
    pub(crate) async fn proposed_trade_timed_out(&mut self, trade: TradePayload) {
        if let Some(order) = self.order_mut(&trade.order_id) {
            if let Err(err) = order.release_for_tick(&trade.recipient_order_id, trade.assets.first.amount)
            {
                tracing::warn!(order = %trade.order_id, error = %err, "release on timeout failed");
            }
        }
        // The cache cannot tell silence from a failed lookup after send; both
        // surface as the generic reason.
        self.handle_cache_decline(trade.order_id, trade.recipient_order_id, DeclinedTradeReason::Other)
            .await;
    }

    /// Feed decline feedback for a counter order into the order's match cache.
    pub(crate) async fn handle_cache_decline(
        &mut self,
        order_id: OrderId,
        counter_order_id: OrderId,
        reason: DeclinedTradeReason,
    ) {
        let deadline = self.match_cache_deadline();
        let notifications: Vec<(TraderId, DeclineMatchReason)> = {
            let cache = match self.request_cache.match_cache_mut(order_id.order_number) {
                Some(cache) => cache,
                None => return,
            };
            cache.received_responses.insert(counter_order_id);

            let mut notifications = Vec::new();
            match reason {
                DeclinedTradeReason::OrderCompleted => {
                    for matchmaker in cache.matchmakers_for(&counter_order_id) {
                        notifications.push((matchmaker, DeclineMatchReason::OtherOrderCompleted));
                    }
                }
                DeclinedTradeReason::OrderCancelled => {
                    for matchmaker in cache.matchmakers_for(&counter_order_id) {
                        notifications.push((matchmaker, DeclineMatchReason::OtherOrderCancelled));
                    }
                }
                DeclinedTradeReason::AddressLookupFail => {
                    for matchmaker in cache.matchmakers_for(&counter_order_id) {
                        notifications.push((matchmaker, DeclineMatchReason::Other));
                    }
                }
                DeclinedTradeReason::OrderReserved => {
                    if let Some(entry) = cache.outstanding_request.as_ref() {
                        // Back off: the counterparty may free up quantity.
                        cache.queue.insert(entry.retries + 1, entry.price.clone(), entry.order_id);
                    }
                }
                DeclinedTradeReason::NoAvailableQuantity => {
                    if let Some(entry) = cache.outstanding_request.as_ref() {
                        cache.queue.insert(entry.retries, entry.price.clone(), entry.order_id);
                    }
                }
                _ => {}
            }
            cache.outstanding_request = None;
            cache.pending_propose = None;
            notifications
        };
        self.request_cache.touch(CacheKind::Match, order_id.order_number, deadline);

        for (matchmaker, decline_reason) in notifications {
            self.send_decline_match_message(order_id, counter_order_id, matchmaker, decline_reason);
        }

        let now = self.now();
        let open = self.order(&order_id).map(|order| order.is_open(now)).unwrap_or(false);
        if open {
            // Boxed: this closes the propose -> decline -> propose cycle.
            Box::pin(self.process_match(order_id)).await;
        }
    }

    /// Purge a finished counter order from every match cache.
    pub(crate) fn on_order_completed(&mut self, order_id: OrderId) {
        for cache in self.request_cache.match_caches_mut() {
            cache.remove_order(&order_id);
        }
    }

    pub(crate) fn send_decline_match_message(
        &mut self,
        order_id: OrderId,
        other_order_id: OrderId,
        matchmaker_trader_id: TraderId,
        decline_reason: DeclineMatchReason,
    ) {
        tracing::info!(
            order = %order_id,
            other = %other_order_id,
            matchmaker = %matchmaker_trader_id,
            ?decline_reason,
            "sending decline match"
        );
        let message = Message::MatchDecline(DeclineMatchPayload {
            trader_id: self.trader_id(),
            timestamp: self.now(),
            order_number: order_id.order_number,
            other_order_id,
            decline_reason,
        });
        self.send_to_trader(&matchmaker_trader_id, &message);
    }

    /// A peer declined a match we announced (matchmaker side).
    pub(crate) async fn received_decline_match(&mut self, payload: DeclineMatchPayload) {
        let order_id = OrderId::new(payload.trader_id, payload.order_number);
        let matched_order_id = payload.other_order_id;
        tracing::info!(
            order = %order_id,
            matched = %matched_order_id,
            reason = ?payload.decline_reason,
            "received decline match"
        );

        let (tick_exists, matched_exists) = {
            let book = match self.order_book_mut() {
                Some(book) => book,
                None => return,
            };
            let tick_exists = book.tick_exists(&order_id);
            let matched_exists = book.tick_exists(&matched_order_id);
            // Never suggest this pairing again, in either direction.
            if tick_exists && matched_exists {
                if let Some(entry) = book.get_tick_mut(&order_id) {
                    entry.block_for_matching(matched_order_id);
                }
                if let Some(entry) = book.get_tick_mut(&matched_order_id) {
                    entry.block_for_matching(order_id);
                }
            }
            (tick_exists, matched_exists)
        };

        if matched_exists
            && matches!(
                payload.decline_reason,
                DeclineMatchReason::OtherOrderCompleted | DeclineMatchReason::OtherOrderCancelled
            )
        {
            if let Some(book) = self.order_book_mut() {
                book.remove_tick(&matched_order_id);
                if payload.decline_reason == DeclineMatchReason::OtherOrderCancelled {
                    book.cancelled_orders.insert(matched_order_id);
                } else {
                    book.completed_orders.insert(matched_order_id);
                }
            }
            self.on_order_completed(matched_order_id);
        }

        if payload.decline_reason == DeclineMatchReason::OrderCompleted && tick_exists {
            if let Some(book) = self.order_book_mut() {
                book.remove_tick(&order_id);
                book.completed_orders.insert(order_id);
            }
        } else if tick_exists {
            // The pairing failed for a transient reason; look for another.
            self.announce_matches_for(order_id).await;
        }
    }

    // ==================== proposed / counter / declined trade ====================

    fn trade_payload_is_for_us(&self, recipient_order_id: &OrderId) -> bool {
        recipient_order_id.trader_id == self.trader_id()
            && self.order(recipient_order_id).is_some()
    }

    fn send_decline_trade(&mut self, incoming: &TradePayload, decline_reason: DeclinedTradeReason) {
        tracing::debug!(
            order = %incoming.recipient_order_id,
            other = %incoming.order_id,
            ?decline_reason,
            "declining trade"
        );
        let message = Message::DeclinedTrade(DeclineTradePayload {
            trader_id: self.trader_id(),
            timestamp: self.now(),
            proposal_id: incoming.proposal_id,
            order_id: incoming.recipient_order_id,
            recipient_order_id: incoming.order_id,
            decline_reason,
        });
        self.send_to_trader(&incoming.trader_id, &message);
    }

    pub(crate) async fn received_proposed_trade(&mut self, payload: TradePayload) {
        if !self.trade_payload_is_for_us(&payload.recipient_order_id) {
            tracing::warn!(recipient = %payload.recipient_order_id, "proposed trade not for this node");
            return;
        }
        let order_id = payload.recipient_order_id;
        tracing::debug!(order = %order_id, other = %payload.order_id, "received proposed trade");

        // Simultaneous proposals for the same pair of orders: the smaller
        // proposal loses; on equal size the ask side withdraws its own.
        let outstanding = self.request_cache.outstanding_proposals(&order_id, &payload.order_id);
        for proposal_number in outstanding {
            let ours = match self.request_cache.get(CacheKind::ProposedTrade, proposal_number as u64)
            {
                Some(CacheData::ProposedTrade(trade)) => trade.assets.first.amount,
                _ => continue,
            };
            let is_ask = self.order(&order_id).map(|order| order.is_ask).unwrap_or(false);
            let incoming = payload.assets.first.amount;
            if ours < incoming || (ours == incoming && is_ask) {
                tracing::info!(
                    order = %order_id,
                    proposal = proposal_number,
                    "discarding our own outstanding proposal after race"
                );
                if let Some(CacheData::ProposedTrade(trade)) =
                    self.request_cache.pop(CacheKind::ProposedTrade, proposal_number as u64)
                {
                    self.proposed_trade_timed_out(trade).await;
                }
            }
        }

        let now = self.now();
        let (decline_reason, available) = match self.order(&order_id) {
            Some(order) => {
                let reason = if !order.assets.same_market(&payload.assets) {
                    Some(DeclinedTradeReason::OrderInvalid)
                } else {
                    match order.status(now) {
                        OrderStatus::Unverified => Some(DeclinedTradeReason::OrderInvalid),
                        OrderStatus::Completed => Some(DeclinedTradeReason::OrderCompleted),
                        OrderStatus::Expired => Some(DeclinedTradeReason::OrderExpired),
                        OrderStatus::Cancelled => Some(DeclinedTradeReason::OrderCancelled),
                        OrderStatus::Open => {
                            if order.available_quantity() == 0 {
                                Some(DeclinedTradeReason::OrderReserved)
                            } else if !order.has_acceptable_price(&payload.assets) {
                                Some(DeclinedTradeReason::UnacceptablePrice)
                            } else {
                                None
                            }
                        }
                    }
                };
                (reason, order.available_quantity())
            }
            None => return,
        };

        if let Some(reason) = decline_reason {
            self.send_decline_trade(&payload, reason);
            return;
        }

        let requested = payload.assets.first.amount;
        if available >= requested {
            if let Some(order) = self.order_mut(&order_id) {
                if let Err(err) = order.reserve_for_tick(payload.order_id, requested) {
                    tracing::warn!(order = %order_id, error = %err, "reservation failed");
                    self.send_decline_trade(&payload, DeclinedTradeReason::OrderReserved);
                    return;
                }
            }
            self.start_transaction(&payload).await;
        } else {
            // Partial fill: counter with what we have, at our exact ratio.
            let counter_assets = self
                .order(&order_id)
                .and_then(|order| order.assets.proportional_downscale(available));
            let counter_assets = match counter_assets {
                Some(assets) => assets,
                None => {
                    self.send_decline_trade(&payload, DeclinedTradeReason::NoAvailableQuantity);
                    return;
                }
            };
            let amount = counter_assets.first.amount;
            if let Some(order) = self.order_mut(&order_id) {
                if let Err(err) = order.reserve_for_tick(payload.order_id, amount) {
                    tracing::warn!(order = %order_id, error = %err, "reservation failed");
                    self.send_decline_trade(&payload, DeclinedTradeReason::OrderReserved);
                    return;
                }
            }
            let counter = TradePayload {
                trader_id: self.trader_id(),
                timestamp: now,
                proposal_id: payload.proposal_id,
                order_id,
                recipient_order_id: payload.order_id,
                assets: counter_assets,
            };
            self.request_cache.insert(
                CacheKind::ProposedTrade,
                counter.proposal_id as u64,
                now.plus(PROPOSED_TRADE_TIMEOUT_MS),
                CacheData::ProposedTrade(counter.clone()),
            );
            tracing::debug!(order = %order_id, amount, "sending counter trade");
            self.send_to_trader(&payload.trader_id, &Message::CounterTrade(counter));
        }
    }

    pub(crate) async fn received_counter_trade(&mut self, payload: TradePayload) {
        if !self.trade_payload_is_for_us(&payload.recipient_order_id) {
            tracing::warn!(recipient = %payload.recipient_order_id, "counter trade not for this node");
            return;
        }
        let request = match self.request_cache.pop(CacheKind::ProposedTrade, payload.proposal_id as u64)
        {
            Some(CacheData::ProposedTrade(trade)) => trade,
            _ => {
                tracing::warn!(proposal = payload.proposal_id, "counter trade for unknown proposal");
                return;
            }
        };

        let order_id = payload.recipient_order_id;
        tracing::info!(order = %order_id, amount = payload.assets.first.amount, "received counter trade");

        let decline_reason = match self.order(&order_id) {
            Some(order) => {
                if !order.assets.same_market(&payload.assets) {
                    Some(DeclinedTradeReason::OrderInvalid)
                } else if !order.has_acceptable_price(&payload.assets) {
                    Some(DeclinedTradeReason::UnacceptablePrice)
                } else {
                    None
                }
            }
            None => return,
        };

        match decline_reason {
            Some(reason) => {
                self.send_decline_trade(&payload, reason);
                if let Some(order) = self.order_mut(&order_id) {
                    let _ = order
                        .release_for_tick(&request.recipient_order_id, request.assets.first.amount);
                }
            }
            None => {
                if let Some(order) = self.order_mut(&order_id) {
                    if let Err(err) = order
                        .release_for_tick(&request.recipient_order_id, request.assets.first.amount)
                    {
                        tracing::warn!(order = %order_id, error = %err, "release of proposal failed");
                    }
                    if let Err(err) = order.reserve_for_tick(payload.order_id, payload.assets.first.amount)
                    {
                        tracing::warn!(order = %order_id, error = %err, "reservation of counter failed");
                        self.send_decline_trade(&payload, DeclinedTradeReason::OrderReserved);
                        return;
                    }
                }
                self.start_transaction(&payload).await;
            }
        }
    }

    pub(crate) async fn received_decline_trade(&mut self, payload: DeclineTradePayload) {
        if !self.trade_payload_is_for_us(&payload.recipient_order_id) {
            tracing::warn!(recipient = %payload.recipient_order_id, "declined trade not for this node");
            return;
        }
        let request = match self.request_cache.pop(CacheKind::ProposedTrade, payload.proposal_id as u64)
        {
            Some(CacheData::ProposedTrade(trade)) => trade,
            _ => {
                tracing::warn!(proposal = payload.proposal_id, "declined trade for unknown proposal");
                return;
            }
        };

        let order_id = payload.recipient_order_id;
        tracing::debug!(
            order = %order_id,
            proposal = payload.proposal_id,
            reason = ?payload.decline_reason,
            "received declined trade"
        );

        if let Some(order) = self.order_mut(&order_id) {
            if let Err(err) =
                order.release_for_tick(&request.recipient_order_id, request.assets.first.amount)
            {
                tracing::warn!(order = %order_id, error = %err, "release after decline failed");
            }
        }

        // A terminal counter order leaves every cache before feedback runs,
        // so it cannot be proposed to again.
        if matches!(
            payload.decline_reason,
            DeclinedTradeReason::OrderCompleted | DeclinedTradeReason::OrderCancelled
        ) {
            self.on_order_completed(payload.order_id);
        }

        self.handle_cache_decline(order_id, payload.order_id, payload.decline_reason).await;
    }
}
