use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use rand::RngCore;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use peerdex::chain::MemoryChain;
use peerdex::community::MarketCommunity;
use peerdex::config::AppConfig;
use peerdex::models::{Clock, TraderId, TRADER_ID_LEN};
use peerdex::network::MemoryNetwork;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "peerdex=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = AppConfig::load()?;

    tracing::info!("Starting peerdex v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!(matchmaker = config.is_matchmaker, "configuration loaded");

    let mut id_bytes = [0u8; TRADER_ID_LEN];
    rand::thread_rng().fill_bytes(&mut id_bytes);
    let trader_id = TraderId(id_bytes);
    let address: SocketAddr = "127.0.0.1:7759".parse()?;

    let clock = Clock::system();
    let network = MemoryNetwork::new();
    let chain = MemoryChain::new(trader_id, clock.clone());

    let mut community = MarketCommunity::new(
        config.clone(),
        clock,
        trader_id,
        address,
        network,
        chain,
        None,
        HashMap::new(),
    );
    tracing::info!(trader = %trader_id, %address, "community running");

    let mut ticker = tokio::time::interval(Duration::from_millis(community.config.tick_interval_ms));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                community.poll_timers().await;
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutting down");
                community.shutdown().await;
                break;
            }
        }
    }

    Ok(())
}
