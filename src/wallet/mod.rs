//! Wallet capability: one ledger adapter per asset tag.
//!
//! The market core never touches wallet internals. It resolves a wallet by
//! asset tag, asks for addresses, transfers, and monitors inclusion of a
//! payment id. [`MemoryWallet`] is the in-process implementation used by
//! tests and local runs.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::models::WalletAddress;

/// Wallet capability errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WalletError {
    #[error("insufficient funds: requested {requested}, balance {balance}")]
    InsufficientFunds { requested: u64, balance: u64 },

    #[error("transfer rejected by the ledger")]
    TransferRejected,

    #[error("payment {0} was never confirmed")]
    NotConfirmed(String),
}

/// A ledger adapter for a single asset.
#[async_trait]
pub trait Wallet: Send + Sync {
    /// Whether the underlying wallet has been created and is usable.
    fn created(&self) -> bool;

    fn get_address(&self) -> WalletAddress;

    /// Send `amount` smallest units to `destination`; resolves with the
    /// ledger-level payment id.
    async fn transfer(&self, amount: u64, destination: &WalletAddress)
        -> Result<String, WalletError>;

    /// Resolve once the payment with the given id is included on the ledger.
    async fn monitor_transaction(&self, payment_id: &str) -> Result<(), WalletError>;

    /// Smallest transferable unit.
    fn min_unit(&self) -> u64;

    /// Number of decimals of the asset.
    fn precision(&self) -> u32;
}

/// In-memory wallet with an explicit balance and a failure switch for tests.
pub struct MemoryWallet {
    asset_id: String,
    address: WalletAddress,
    balance: Mutex<u64>,
    seq: AtomicU64,
    fail_transfers: AtomicBool,
    min_unit: u64,
    precision: u32,
}

impl MemoryWallet {
    pub fn new(asset_id: impl Into<String>, balance: u64) -> Arc<Self> {
        let asset_id = asset_id.into();
        let address = WalletAddress(format!("{}-wallet-{}", asset_id.to_lowercase(), balance));
        Arc::new(Self {
            asset_id,
            address,
            balance: Mutex::new(balance),
            seq: AtomicU64::new(0),
            fail_transfers: AtomicBool::new(false),
            min_unit: 1,
            precision: 8,
        })
    }

    pub fn balance(&self) -> u64 {
        *self.balance.lock()
    }

    pub fn deposit(&self, amount: u64) {
        *self.balance.lock() += amount;
    }

    /// Make every subsequent transfer fail.
    pub fn set_fail_transfers(&self, fail: bool) {
        self.fail_transfers.store(fail, AtomicOrdering::Relaxed);
    }
}

#[async_trait]
impl Wallet for MemoryWallet {
    fn created(&self) -> bool {
        true
    }

    fn get_address(&self) -> WalletAddress {
        self.address.clone()
    }

    async fn transfer(
        &self,
        amount: u64,
        _destination: &WalletAddress,
    ) -> Result<String, WalletError> {
        if self.fail_transfers.load(AtomicOrdering::Relaxed) {
            return Err(WalletError::TransferRejected);
        }
        let mut balance = self.balance.lock();
        if *balance < amount {
            return Err(WalletError::InsufficientFunds { requested: amount, balance: *balance });
        }
        *balance -= amount;
        let seq = self.seq.fetch_add(1, AtomicOrdering::Relaxed);
        Ok(format!("{}-tx-{}", self.asset_id.to_lowercase(), seq))
    }

    async fn monitor_transaction(&self, _payment_id: &str) -> Result<(), WalletError> {
        Ok(())
    }

    fn min_unit(&self) -> u64 {
        self.min_unit
    }

    fn precision(&self) -> u32 {
        self.precision
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn transfer_debits_balance() {
        let wallet = MemoryWallet::new("BTC", 100);
        let destination = WalletAddress("elsewhere".to_string());
        let payment_id = wallet.transfer(40, &destination).await.unwrap();
        assert_eq!(wallet.balance(), 60);
        wallet.monitor_transaction(&payment_id).await.unwrap();

        assert!(matches!(
            wallet.transfer(61, &destination).await,
            Err(WalletError::InsufficientFunds { .. })
        ));
    }

    #[tokio::test]
    async fn failure_switch_rejects_transfers() {
        let wallet = MemoryWallet::new("BTC", 100);
        wallet.set_fail_transfers(true);
        let destination = WalletAddress("elsewhere".to_string());
        assert_eq!(
            wallet.transfer(1, &destination).await,
            Err(WalletError::TransferRejected)
        );
        assert_eq!(wallet.balance(), 100);
    }
}
