//! Application configuration.
//!
//! Defaults are overridden by an optional `peerdex.toml` next to the binary
//! and then by `PEERDEX_*` environment variables.

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Volunteer as a matchmaker and maintain an orderbook.
    pub is_matchmaker: bool,
    /// Batch window before the first incoming matches are processed.
    pub match_window_ms: u64,
    /// Maximum random jitter before a MATCH announcement goes out; 0 sends
    /// immediately.
    pub match_send_interval_ms: u64,
    /// Maximum number of ticks replayed per orderbook sync response.
    pub num_order_sync: usize,
    /// Upper bound on an order's lifetime.
    pub max_order_timeout_ms: u64,
    /// Send payments in doubling chunks instead of one transfer per leg.
    pub use_incremental_payments: bool,
    /// Keep records of observed settled transactions.
    pub record_transactions: bool,
    /// Interval of the community timer tick.
    pub tick_interval_ms: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            is_matchmaker: true,
            match_window_ms: 1_000,
            match_send_interval_ms: 0,
            num_order_sync: 10,
            max_order_timeout_ms: 24 * 60 * 60 * 1000,
            use_incremental_payments: false,
            record_transactions: false,
            tick_interval_ms: 100,
        }
    }
}

impl AppConfig {
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name("peerdex").required(false))
            .add_source(config::Environment::with_prefix("PEERDEX"))
            .build()?;
        Ok(config.try_deserialize()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = AppConfig::default();
        assert!(config.is_matchmaker);
        assert_eq!(config.match_send_interval_ms, 0);
        assert!(config.max_order_timeout_ms >= config.match_window_ms);
    }
}
