//! Community-level scenarios over in-memory capabilities.
//!
//! Each test wires a handful of communities together through a shared manual
//! clock, routes frames and gossiped blocks until the mesh goes quiet, and
//! asserts on observable order, transaction and orderbook state.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::chain::MemoryChain;
use crate::config::AppConfig;
use crate::models::{
    AssetAmount, AssetPair, Clock, OrderId, OrderStatus, TraderId, TransactionStatus,
    TRADER_ID_LEN,
};
use crate::network::{MemoryDht, MemoryNetwork};
use crate::wallet::{MemoryWallet, Wallet};

use super::MarketCommunity;

struct Node {
    community: MarketCommunity,
    network: Arc<MemoryNetwork>,
    chain: Arc<MemoryChain>,
    btc: Arc<MemoryWallet>,
    eur: Arc<MemoryWallet>,
}

fn trader(byte: u8) -> TraderId {
    TraderId([byte; TRADER_ID_LEN])
}

fn pair(base: u64, quote: u64) -> AssetPair {
    AssetPair::new(AssetAmount::new(base, "BTC"), AssetAmount::new(quote, "EUR")).unwrap()
}

fn node(byte: u8, is_matchmaker: bool, clock: &Clock, dht: &Arc<MemoryDht>) -> Node {
    let trader_id = trader(byte);
    let address: SocketAddr = format!("127.0.0.1:{}", 9000 + byte as u16).parse().unwrap();
    let network = MemoryNetwork::new();
    let chain = MemoryChain::new(trader_id, clock.clone());
    let btc = MemoryWallet::new("BTC", 1_000_000);
    let eur = MemoryWallet::new("EUR", 1_000_000);
    let mut wallets: HashMap<String, Arc<dyn Wallet>> = HashMap::new();
    wallets.insert("BTC".to_string(), btc.clone());
    wallets.insert("EUR".to_string(), eur.clone());
    dht.publish(trader_id, address);

    let config = AppConfig {
        is_matchmaker,
        match_window_ms: 100,
        match_send_interval_ms: 0,
        record_transactions: true,
        ..AppConfig::default()
    };
    let community = MarketCommunity::new(
        config,
        clock.clone(),
        trader_id,
        address,
        network.clone(),
        chain.clone(),
        Some(dht.clone() as Arc<dyn crate::network::Dht>),
        wallets,
    );
    Node { community, network, chain, btc, eur }
}

/// Route queued frames and gossiped blocks between the given nodes until
/// nothing moves anymore.
async fn pump(nodes: &mut [&mut Node]) {
    for _ in 0..64 {
        let mut activity = false;
        for i in 0..nodes.len() {
            let src = nodes[i].community.address();
            for (addr, frame) in nodes[i].network.take_sent() {
                activity = true;
                if let Some(j) = (0..nodes.len()).find(|&j| nodes[j].community.address() == addr) {
                    nodes[j].community.handle_frame(src, &frame).await;
                }
            }
            for block in nodes[i].chain.take_outgoing() {
                activity = true;
                for j in 0..nodes.len() {
                    if j != i {
                        nodes[j].community.handle_block(block.clone()).await;
                    }
                }
            }
            for (addr, block) in nodes[i].chain.take_outgoing_direct() {
                activity = true;
                if let Some(j) = (0..nodes.len()).find(|&j| nodes[j].community.address() == addr) {
                    nodes[j].community.handle_block(block.clone()).await;
                }
            }
        }
        if !activity {
            return;
        }
    }
    panic!("message mesh did not quiesce");
}

/// Advance the clock, run every node's timers, and route the fallout.
async fn advance(nodes: &mut [&mut Node], clock: &Clock, ms: u64) {
    clock.advance(ms);
    for _ in 0..6 {
        for node in nodes.iter_mut() {
            node.community.poll_timers().await;
        }
        pump(nodes).await;
    }
}

/// Introduce every node to every other node.
fn introduce_all(nodes: &mut [&mut Node]) {
    let peers: Vec<(TraderId, SocketAddr, bool)> = nodes
        .iter()
        .map(|node| {
            (
                node.community.trader_id(),
                node.community.address(),
                node.community.is_matchmaker(),
            )
        })
        .collect();
    for node in nodes.iter_mut() {
        for (trader_id, address, is_matchmaker) in &peers {
            if *trader_id != node.community.trader_id() {
                node.community.peer_discovered(*trader_id, *address, *is_matchmaker);
            }
        }
        // Handshake traffic is routed by the caller's next pump.
        node.network.take_sent();
    }
}

#[tokio::test]
async fn full_match_settles_both_orders() {
    let clock = Clock::manual(1_000_000);
    let dht = MemoryDht::new();
    let mut a = node(1, false, &clock, &dht);
    let mut b = node(2, false, &clock, &dht);
    let mut m = node(9, true, &clock, &dht);
    let mut nodes = [&mut a, &mut b, &mut m];
    introduce_all(&mut nodes);

    let ask = nodes[0].community.create_ask(pair(100, 50), 3_600_000).await.unwrap();
    pump(&mut nodes).await;
    let bid = nodes[1].community.create_bid(pair(100, 50), 3_600_000).await.unwrap();
    pump(&mut nodes).await;

    // The matchmaker saw both ticks and announced the pairing to both sides.
    assert_eq!(nodes[2].community.order_book().unwrap().len(), 2);

    advance(&mut nodes, &clock, 150).await;
    advance(&mut nodes, &clock, 2_500).await;

    let now = clock.now();
    let order_a = nodes[0].community.order(&ask).unwrap();
    let order_b = nodes[1].community.order(&bid).unwrap();
    assert_eq!(order_a.status(now), OrderStatus::Completed);
    assert_eq!(order_b.status(now), OrderStatus::Completed);
    assert_eq!(order_a.reserved_quantity(), 0);
    assert_eq!(order_b.reserved_quantity(), 0);

    // Exactly one settlement, visible on both sides, fully paid out.
    let tx_a = nodes[0].community.transactions().next().unwrap();
    assert_eq!(tx_a.status, TransactionStatus::Completed);
    assert_eq!(tx_a.transferred, tx_a.assets);
    let tx_b = nodes[1].community.transactions().next().unwrap();
    assert_eq!(tx_b.status, TransactionStatus::Completed);
    assert_eq!(tx_b.transferred, tx_b.assets);

    // The sum of successful payments per asset equals the agreed size.
    let paid_base: u64 = tx_a
        .payments
        .iter()
        .filter(|p| p.success && p.transferred.asset_id == "BTC")
        .map(|p| p.transferred.amount)
        .sum();
    assert_eq!(paid_base, 100);

    // The ask paid 100 base units, the bid 50 quote units.
    assert_eq!(nodes[0].btc.balance(), 1_000_000 - 100);
    assert_eq!(nodes[1].eur.balance(), 1_000_000 - 50);

    // The matchmaker retired both ticks.
    let book = nodes[2].community.order_book().unwrap();
    assert!(book.is_empty());
    assert!(book.completed_orders.contains(&ask));
    assert!(book.completed_orders.contains(&bid));
}

#[tokio::test]
async fn partial_fill_via_counter_trade() {
    let clock = Clock::manual(1_000_000);
    let dht = MemoryDht::new();
    let mut a = node(1, false, &clock, &dht);
    let mut b = node(2, false, &clock, &dht);
    let mut m = node(9, true, &clock, &dht);
    let mut nodes = [&mut a, &mut b, &mut m];
    introduce_all(&mut nodes);

    let ask = nodes[0].community.create_ask(pair(100, 50), 3_600_000).await.unwrap();
    pump(&mut nodes).await;
    let bid = nodes[1].community.create_bid(pair(60, 30), 3_600_000).await.unwrap();
    pump(&mut nodes).await;

    advance(&mut nodes, &clock, 150).await;
    advance(&mut nodes, &clock, 2_500).await;
    advance(&mut nodes, &clock, 2_500).await;

    let now = clock.now();
    let order_a = nodes[0].community.order(&ask).unwrap();
    let order_b = nodes[1].community.order(&bid).unwrap();
    assert_eq!(order_a.traded_quantity(), 60);
    assert_eq!(order_a.available_quantity(), 40);
    assert_eq!(order_a.status(now), OrderStatus::Open);
    assert_eq!(order_b.traded_quantity(), 60);
    assert_eq!(order_b.status(now), OrderStatus::Completed);

    // The matchmaker kept the residual ask and retired the bid.
    let book = nodes[2].community.order_book().unwrap();
    assert!(book.tick_exists(&ask));
    assert_eq!(book.get_tick(&ask).unwrap().available(), 40);
    assert!(!book.tick_exists(&bid));
    assert!(book.completed_orders.contains(&bid));
}

#[tokio::test]
async fn simultaneous_proposals_leave_one_survivor() {
    let clock = Clock::manual(1_000_000);
    let dht = MemoryDht::new();
    let mut a = node(1, false, &clock, &dht);
    let mut b = node(2, false, &clock, &dht);
    let mut m = node(9, true, &clock, &dht);
    let mut nodes = [&mut a, &mut b, &mut m];
    introduce_all(&mut nodes);

    nodes[0].community.create_ask(pair(50, 25), 3_600_000).await.unwrap();
    pump(&mut nodes).await;
    nodes[1].community.create_bid(pair(50, 25), 3_600_000).await.unwrap();
    pump(&mut nodes).await;

    // Both sides pop their single candidate in the same timer round and
    // propose to each other; the tiebreak must leave exactly one settlement.
    advance(&mut nodes, &clock, 150).await;
    advance(&mut nodes, &clock, 2_500).await;

    assert_eq!(nodes[0].community.transactions().count(), 1);
    assert_eq!(nodes[1].community.transactions().count(), 1);
    let tx_a = nodes[0].community.transactions().next().unwrap();
    assert_eq!(tx_a.status, TransactionStatus::Completed);
    assert_eq!(tx_a.assets.first.amount, 50);

    let now = clock.now();
    for node in nodes.iter().take(2) {
        for order in node.community.orders() {
            assert_eq!(order.status(now), OrderStatus::Completed);
            assert_eq!(order.reserved_quantity(), 0);
        }
    }
}

#[tokio::test]
async fn reserved_decline_backs_off_and_retries() {
    let clock = Clock::manual(1_000_000);
    let dht = MemoryDht::new();
    let mut a = node(1, false, &clock, &dht);
    let mut b = node(2, false, &clock, &dht);
    let mut c = node(3, false, &clock, &dht);
    let mut m = node(9, true, &clock, &dht);

    let parked = OrderId::new(trader(100), 1);

    let mut nodes = [&mut a, &mut b, &mut c, &mut m];
    introduce_all(&mut nodes);

    let ask = nodes[0].community.create_ask(pair(100, 50), 3_600_000).await.unwrap();
    pump(&mut nodes).await;
    let bid_b = nodes[1].community.create_bid(pair(100, 50), 3_600_000).await.unwrap();
    pump(&mut nodes).await;
    let bid_c = nodes[2].community.create_bid(pair(100, 50), 3_600_000).await.unwrap();
    pump(&mut nodes).await;

    // B's quantity is momentarily tied up elsewhere; C is already done.
    nodes[1].community.order_mut(&bid_b).unwrap().reserve_for_tick(parked, 100).unwrap();
    {
        let order_c = nodes[2].community.order_mut(&bid_c).unwrap();
        order_c.reserve_for_tick(parked, 100).unwrap();
        order_c.add_trade(&parked, 100).unwrap();
    }

    // A proposes to B first (FIFO at equal price), gets ORDER_RESERVED, then
    // burns through C's ORDER_COMPLETED decline.
    advance(&mut nodes, &clock, 150).await;

    // B frees up before the backoff retry fires.
    nodes[1].community.order_mut(&bid_b).unwrap().release_for_tick(&parked, 100).unwrap();
    advance(&mut nodes, &clock, 2_500).await;
    advance(&mut nodes, &clock, 2_500).await;

    let now = clock.now();
    assert_eq!(nodes[0].community.order(&ask).unwrap().status(now), OrderStatus::Completed);
    assert_eq!(nodes[1].community.order(&bid_b).unwrap().traded_quantity(), 100);

    // C's completed order was reported back and retired from the book.
    let book = nodes[3].community.order_book().unwrap();
    assert!(!book.tick_exists(&bid_c));
    assert!(book.completed_orders.contains(&bid_c));
}

#[tokio::test]
async fn payment_failure_aborts_and_releases() {
    let clock = Clock::manual(1_000_000);
    let dht = MemoryDht::new();
    let mut a = node(1, false, &clock, &dht);
    let mut b = node(2, false, &clock, &dht);
    let mut m = node(9, true, &clock, &dht);

    // The ask side's base-asset wallet rejects every transfer.
    a.btc.set_fail_transfers(true);

    let mut nodes = [&mut a, &mut b, &mut m];
    introduce_all(&mut nodes);

    let ask = nodes[0].community.create_ask(pair(100, 50), 3_600_000).await.unwrap();
    pump(&mut nodes).await;
    let bid = nodes[1].community.create_bid(pair(100, 50), 3_600_000).await.unwrap();
    pump(&mut nodes).await;

    advance(&mut nodes, &clock, 150).await;
    advance(&mut nodes, &clock, 2_500).await;

    let now = clock.now();
    let order_a = nodes[0].community.order(&ask).unwrap();
    let order_b = nodes[1].community.order(&bid).unwrap();
    assert_eq!(order_a.status(now), OrderStatus::Open);
    assert_eq!(order_b.status(now), OrderStatus::Open);
    assert_eq!(order_a.traded_quantity(), 0);
    assert_eq!(order_b.traded_quantity(), 0);
    assert_eq!(order_a.reserved_quantity(), 0);
    assert_eq!(order_b.reserved_quantity(), 0);

    let tx_a = nodes[0].community.transactions().next().unwrap();
    let tx_b = nodes[1].community.transactions().next().unwrap();
    assert_eq!(tx_a.status, TransactionStatus::Aborted);
    assert_eq!(tx_b.status, TransactionStatus::Aborted);
    assert!(tx_a.payments.iter().any(|p| !p.success));
}

#[tokio::test]
async fn orderbook_sync_converges() {
    let clock = Clock::manual(1_000_000);
    let dht = MemoryDht::new();
    let mut m1 = node(8, true, &clock, &dht);
    let mut m2 = node(9, true, &clock, &dht);
    let mut t1 = node(1, false, &clock, &dht);
    let mut t2 = node(2, false, &clock, &dht);
    let mut t3 = node(3, false, &clock, &dht);
    let mut t4 = node(4, false, &clock, &dht);

    // M1 knows T1, T2, T3. M2 knows T2, T4. Prices are chosen not to cross.
    let o1 = {
        let mut group = [&mut t1, &mut m1];
        let id = group[0].community.create_ask(pair(100, 50), 3_600_000).await.unwrap();
        pump(&mut group).await;
        id
    };
    let o2 = {
        let mut group = [&mut t2, &mut m1, &mut m2];
        let id = group[0].community.create_ask(pair(100, 60), 3_600_000).await.unwrap();
        pump(&mut group).await;
        id
    };
    let o3 = {
        let mut group = [&mut t3, &mut m1];
        let id = group[0].community.create_bid(pair(100, 40), 3_600_000).await.unwrap();
        pump(&mut group).await;
        id
    };
    let o4 = {
        let mut group = [&mut t4, &mut m2];
        let id = group[0].community.create_bid(pair(100, 30), 3_600_000).await.unwrap();
        pump(&mut group).await;
        id
    };
    assert_eq!(m1.community.order_book().unwrap().len(), 3);
    assert_eq!(m2.community.order_book().unwrap().len(), 2);

    // Matchmakers meet; both send their membership filter, each replays the
    // blocks the other is missing.
    let m2_id = m2.community.trader_id();
    let m2_addr = m2.community.address();
    let m1_id = m1.community.trader_id();
    let m1_addr = m1.community.address();
    m1.community.peer_discovered(m2_id, m2_addr, true);
    m2.community.peer_discovered(m1_id, m1_addr, true);

    let mut group = [&mut m1, &mut m2];
    pump(&mut group).await;

    let book1 = group[0].community.order_book().unwrap();
    let book2 = group[1].community.order_book().unwrap();
    // One miss per side is tolerated (filter false positives), more is a bug.
    let book1_known = [o1, o2, o3, o4].iter().filter(|id| book1.tick_exists(id)).count();
    let book2_known = [o1, o2, o3, o4].iter().filter(|id| book2.tick_exists(id)).count();
    assert!(book1_known >= 3, "m1 only knows {book1_known} ticks");
    assert!(book2_known >= 3, "m2 only knows {book2_known} ticks");
}

#[tokio::test]
async fn replayed_tick_block_inserts_once() {
    let clock = Clock::manual(1_000_000);
    let dht = MemoryDht::new();
    let mut a = node(1, false, &clock, &dht);
    let mut m = node(9, true, &clock, &dht);
    let mut nodes = [&mut a, &mut m];
    introduce_all(&mut nodes);

    nodes[0].community.create_ask(pair(100, 50), 3_600_000).await.unwrap();
    let blocks = nodes[0].chain.take_outgoing();
    assert_eq!(blocks.len(), 1);
    nodes[1].community.handle_block(blocks[0].clone()).await;
    nodes[1].community.handle_block(blocks[0].clone()).await;
    pump(&mut nodes).await;

    assert_eq!(nodes[1].community.order_book().unwrap().len(), 1);
}

#[tokio::test]
async fn cancel_order_produces_block_and_retires_tick() {
    let clock = Clock::manual(1_000_000);
    let dht = MemoryDht::new();
    let mut a = node(1, false, &clock, &dht);
    let mut m = node(9, true, &clock, &dht);

    a.community.peer_discovered(m.community.trader_id(), m.community.address(), true);
    m.community.peer_discovered(a.community.trader_id(), a.community.address(), false);
    m.network.take_sent();

    let ask = a.community.create_ask(pair(100, 50), 3_600_000).await.unwrap();
    let tick_block = a.chain.take_outgoing().pop().unwrap();
    m.community.handle_block(tick_block.clone()).await;
    assert!(m.community.order_book().unwrap().tick_exists(&ask));

    a.community.cancel_order(&ask).await.unwrap();
    let cancel_block = a.chain.take_outgoing().pop().unwrap();
    m.community.handle_block(cancel_block).await;

    let now = clock.now();
    assert_eq!(a.community.order(&ask).unwrap().status(now), OrderStatus::Cancelled);
    {
        let book = m.community.order_book().unwrap();
        assert!(!book.tick_exists(&ask));
        assert!(book.cancelled_orders.contains(&ask));
    }

    // A replay of the original tick block must not resurrect the tick.
    m.community.handle_block(tick_block).await;
    assert!(!m.community.order_book().unwrap().tick_exists(&ask));

    // A second cancel is rejected at the request boundary.
    assert!(a.community.cancel_order(&ask).await.is_err());
}

#[tokio::test]
async fn order_creation_is_validated() {
    let clock = Clock::manual(1_000_000);
    let dht = MemoryDht::new();
    let mut a = node(1, false, &clock, &dht);

    let alien =
        AssetPair::new(AssetAmount::new(10, "BTC"), AssetAmount::new(10, "XYZ")).unwrap();
    assert!(a.community.create_ask(alien, 1_000).await.is_err());

    let too_long = a.community.create_bid(pair(10, 5), u64::MAX).await;
    assert!(too_long.is_err());

    assert!(a.community.create_ask(pair(10, 5), 1_000).await.is_ok());
}

#[tokio::test]
async fn ping_resolves_true_then_times_out() {
    let clock = Clock::manual(1_000_000);
    let dht = MemoryDht::new();
    let mut a = node(1, false, &clock, &dht);
    let mut m = node(9, true, &clock, &dht);
    let mut nodes = [&mut a, &mut m];
    introduce_all(&mut nodes);

    let m_id = nodes[1].community.trader_id();
    let pong = nodes[0].community.ping_peer(&m_id);
    pump(&mut nodes).await;
    assert!(pong.await.unwrap());

    // A ping into the void resolves false after the deadline.
    let silent = nodes[0].community.ping_peer(&trader(42));
    advance(&mut nodes, &clock, 6_000).await;
    assert!(!silent.await.unwrap());
}
