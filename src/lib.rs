//! Peer-to-peer decentralized exchange core.
//!
//! Peers publish signed offers for bilateral asset swaps; volunteer
//! matchmakers maintain an orderbook and hint compatible counterparties at
//! each other; matched peers negotiate a quantity and settle through two
//! wallet transfers framed by co-signed `tx_init` / `tx_done` blocks on an
//! append-only signed-block history.
//!
//! The [`community::MarketCommunity`] owns all market state and is driven by
//! a single task; the chain, wallet, network and DHT dependencies are narrow
//! capability traits with in-process implementations.

pub mod chain;
pub mod community;
pub mod config;
pub mod models;
pub mod network;
pub mod protocol;
pub mod services;
pub mod wallet;
