//! Matchmaker orderbook and price-time matching.

pub mod engine;
pub mod orderbook;

pub use engine::match_tick;
pub use orderbook::{OrderBook, TickEntry};
