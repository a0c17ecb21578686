//! Bilateral settlement records.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::asset::{AssetAmount, AssetPair};
use super::{OrderId, Timestamp, TraderId, TransactionId};

/// A payment address on some asset's ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletAddress(pub String);

impl fmt::Display for WalletAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Settlement status of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    WalletInfoExchanged,
    Paying,
    Completed,
    Aborted,
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionStatus::Pending => write!(f, "pending"),
            TransactionStatus::WalletInfoExchanged => write!(f, "wallet_info_exchanged"),
            TransactionStatus::Paying => write!(f, "paying"),
            TransactionStatus::Completed => write!(f, "completed"),
            TransactionStatus::Aborted => write!(f, "aborted"),
        }
    }
}

/// A single ledger-level transfer attempt within a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payment {
    pub trader_id: TraderId,
    pub transaction_id: TransactionId,
    /// Ledger transaction identifier returned by the wallet; empty on failure.
    pub payment_id: String,
    pub transferred: AssetAmount,
    pub timestamp: Timestamp,
    pub success: bool,
}

/// The settlement record of one agreed trade between two orders.
#[derive(Debug, Clone)]
pub struct Transaction {
    pub transaction_id: TransactionId,
    pub order_id: OrderId,
    pub partner_order_id: OrderId,
    /// The agreed exchange size.
    pub assets: AssetPair,
    /// Amounts actually moved so far, per leg.
    pub transferred: AssetPair,
    pub payments: Vec<Payment>,
    pub incoming_address: Option<WalletAddress>,
    pub outgoing_address: Option<WalletAddress>,
    pub partner_incoming_address: Option<WalletAddress>,
    pub partner_outgoing_address: Option<WalletAddress>,
    pub sent_wallet_info: bool,
    pub received_wallet_info: bool,
    pub status: TransactionStatus,
    pub created_at: Timestamp,
}

impl Transaction {
    pub fn new(
        transaction_id: TransactionId,
        order_id: OrderId,
        partner_order_id: OrderId,
        assets: AssetPair,
        created_at: Timestamp,
    ) -> Self {
        let transferred = AssetPair {
            first: AssetAmount::new(0, assets.first.asset_id.clone()),
            second: AssetAmount::new(0, assets.second.asset_id.clone()),
        };
        Self {
            transaction_id,
            order_id,
            partner_order_id,
            assets,
            transferred,
            payments: Vec::new(),
            incoming_address: None,
            outgoing_address: None,
            partner_incoming_address: None,
            partner_outgoing_address: None,
            sent_wallet_info: false,
            received_wallet_info: false,
            status: TransactionStatus::Pending,
            created_at,
        }
    }

    /// Record a payment, advancing the transferred leg matching its asset tag.
    pub fn add_payment(&mut self, payment: Payment) {
        if payment.success {
            if payment.transferred.asset_id == self.transferred.first.asset_id {
                self.transferred.first.amount = (self.transferred.first.amount
                    + payment.transferred.amount)
                    .min(self.assets.first.amount);
            } else if payment.transferred.asset_id == self.transferred.second.asset_id {
                self.transferred.second.amount = (self.transferred.second.amount
                    + payment.transferred.amount)
                    .min(self.assets.second.amount);
            }
        }
        self.payments.push(payment);
    }

    pub fn is_payment_complete(&self) -> bool {
        self.transferred.first.amount == self.assets.first.amount
            && self.transferred.second.amount == self.assets.second.amount
    }

    /// The next amount to transfer on our leg.
    ///
    /// The ask side pays the base leg, the bid side the quote leg. Incremental
    /// mode starts at the wallet's smallest unit and doubles each round,
    /// capped by what remains; single-shot sends the full remaining leg.
    pub fn next_payment(&self, is_ask: bool, min_unit: u64, incremental: bool) -> AssetAmount {
        let (total, done) = if is_ask {
            (&self.assets.first, self.transferred.first.amount)
        } else {
            (&self.assets.second, self.transferred.second.amount)
        };
        let remaining = total.amount.saturating_sub(done);
        let amount = if incremental {
            remaining.min(done.saturating_add(min_unit.max(1)))
        } else {
            remaining
        };
        AssetAmount::new(amount, total.asset_id.clone())
    }

    pub fn to_snapshot(&self) -> TransactionSnapshot {
        TransactionSnapshot {
            trader_id: self.transaction_id.trader_id,
            transaction_number: self.transaction_id.transaction_number,
            order_trader_id: self.order_id.trader_id,
            order_number: self.order_id.order_number,
            partner_trader_id: self.partner_order_id.trader_id,
            partner_order_number: self.partner_order_id.order_number,
            assets: self.assets.clone(),
            transferred: self.transferred.clone(),
            timestamp: self.created_at,
        }
    }
}

/// Transaction view embedded in `tx_init` / `tx_done` blocks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionSnapshot {
    pub trader_id: TraderId,
    pub transaction_number: u64,
    pub order_trader_id: TraderId,
    pub order_number: u64,
    pub partner_trader_id: TraderId,
    pub partner_order_number: u64,
    pub assets: AssetPair,
    pub transferred: AssetPair,
    pub timestamp: Timestamp,
}

impl TransactionSnapshot {
    pub fn transaction_id(&self) -> TransactionId {
        TransactionId::new(self.trader_id, self.transaction_number)
    }

    pub fn order_id(&self) -> OrderId {
        OrderId::new(self.order_trader_id, self.order_number)
    }

    pub fn partner_order_id(&self) -> OrderId {
        OrderId::new(self.partner_trader_id, self.partner_order_number)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TRADER_ID_LEN;

    fn transaction() -> Transaction {
        let me = TraderId([1; TRADER_ID_LEN]);
        let peer = TraderId([2; TRADER_ID_LEN]);
        let assets =
            AssetPair::new(AssetAmount::new(100, "BTC"), AssetAmount::new(50, "EUR")).unwrap();
        Transaction::new(
            TransactionId::new(me, 1),
            OrderId::new(me, 1),
            OrderId::new(peer, 4),
            assets,
            Timestamp(5),
        )
    }

    fn payment(amount: u64, asset: &str, success: bool) -> Payment {
        Payment {
            trader_id: TraderId([1; TRADER_ID_LEN]),
            transaction_id: TransactionId::new(TraderId([1; TRADER_ID_LEN]), 1),
            payment_id: "pay-1".to_string(),
            transferred: AssetAmount::new(amount, asset),
            timestamp: Timestamp(6),
            success,
        }
    }

    #[test]
    fn payments_advance_the_matching_leg() {
        let mut tx = transaction();
        tx.add_payment(payment(100, "BTC", true));
        assert_eq!(tx.transferred.first.amount, 100);
        assert_eq!(tx.transferred.second.amount, 0);
        assert!(!tx.is_payment_complete());

        tx.add_payment(payment(50, "EUR", true));
        assert!(tx.is_payment_complete());
    }

    #[test]
    fn failed_payment_is_recorded_but_moves_nothing() {
        let mut tx = transaction();
        tx.add_payment(payment(100, "BTC", false));
        assert_eq!(tx.transferred.first.amount, 0);
        assert_eq!(tx.payments.len(), 1);
    }

    #[test]
    fn single_shot_pays_the_full_leg() {
        let tx = transaction();
        assert_eq!(tx.next_payment(true, 1, false), AssetAmount::new(100, "BTC"));
        assert_eq!(tx.next_payment(false, 1, false), AssetAmount::new(50, "EUR"));
    }

    #[test]
    fn incremental_payments_double_until_capped() {
        let mut tx = transaction();
        let mut sent = Vec::new();
        loop {
            let next = tx.next_payment(true, 1, true);
            if next.amount == 0 {
                break;
            }
            sent.push(next.amount);
            tx.add_payment(payment(next.amount, "BTC", true));
        }
        assert_eq!(sent, vec![1, 2, 4, 8, 16, 32, 37]);
        assert_eq!(tx.transferred.first.amount, 100);
    }
}
