//! Asset amounts, pairs and exact-ratio prices.
//!
//! All quantities are integer counts in the smallest unit of an asset; price
//! comparisons cross-multiply in 128-bit integers so no floating point ever
//! enters the order flow.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Asset arithmetic errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AssetError {
    #[error("asset mismatch: {0} vs {1}")]
    AssetMismatch(String, String),

    #[error("amount overflow")]
    Overflow,

    #[error("amount underflow")]
    Underflow,

    #[error("asset pair is not in canonical order: {0} / {1}")]
    NotCanonical(String, String),
}

/// An integer count in the smallest unit of a named asset.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AssetAmount {
    pub amount: u64,
    pub asset_id: String,
}

impl AssetAmount {
    pub fn new(amount: u64, asset_id: impl Into<String>) -> Self {
        Self { amount, asset_id: asset_id.into() }
    }

    pub fn checked_add(&self, other: &AssetAmount) -> Result<AssetAmount, AssetError> {
        if self.asset_id != other.asset_id {
            return Err(AssetError::AssetMismatch(self.asset_id.clone(), other.asset_id.clone()));
        }
        let amount = self.amount.checked_add(other.amount).ok_or(AssetError::Overflow)?;
        Ok(AssetAmount::new(amount, self.asset_id.clone()))
    }

    pub fn checked_sub(&self, other: &AssetAmount) -> Result<AssetAmount, AssetError> {
        if self.asset_id != other.asset_id {
            return Err(AssetError::AssetMismatch(self.asset_id.clone(), other.asset_id.clone()));
        }
        let amount = self.amount.checked_sub(other.amount).ok_or(AssetError::Underflow)?;
        Ok(AssetAmount::new(amount, self.asset_id.clone()))
    }
}

impl fmt::Display for AssetAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.amount, self.asset_id)
    }
}

/// A pair of amounts in two distinct assets.
///
/// The pair is canonical: the base asset tag sorts strictly before the quote
/// asset tag, so every peer derives the same price orientation for a market.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AssetPair {
    pub first: AssetAmount,
    pub second: AssetAmount,
}

impl AssetPair {
    pub fn new(first: AssetAmount, second: AssetAmount) -> Result<Self, AssetError> {
        if first.asset_id == second.asset_id {
            return Err(AssetError::AssetMismatch(first.asset_id, second.asset_id));
        }
        if first.asset_id > second.asset_id {
            return Err(AssetError::NotCanonical(first.asset_id, second.asset_id));
        }
        Ok(Self { first, second })
    }

    /// The derived price of this pair: quote units per base unit.
    pub fn price(&self) -> Price {
        Price::new(
            self.second.amount,
            self.first.amount,
            self.first.asset_id.clone(),
            self.second.asset_id.clone(),
        )
    }

    /// Whether `other` quotes the same market (same base and quote tags).
    pub fn same_market(&self, other: &AssetPair) -> bool {
        self.first.asset_id == other.first.asset_id && self.second.asset_id == other.second.asset_id
    }

    /// A pair of at most `quantity` base units at exactly this pair's price.
    ///
    /// The quantity is rounded down to the largest value whose quote leg is an
    /// exact integer; `None` when no positive such quantity exists.
    pub fn proportional_downscale(&self, quantity: u64) -> Option<AssetPair> {
        if self.first.amount == 0 || quantity == 0 {
            return None;
        }
        let step = self.first.amount / gcd(self.first.amount, self.second.amount);
        let scaled = quantity - quantity % step;
        if scaled == 0 {
            return None;
        }
        let quote = (scaled as u128 * self.second.amount as u128 / self.first.amount as u128) as u64;
        Some(AssetPair {
            first: AssetAmount::new(scaled, self.first.asset_id.clone()),
            second: AssetAmount::new(quote, self.second.asset_id.clone()),
        })
    }
}

impl fmt::Display for AssetPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} / {}", self.first, self.second)
    }
}

/// An exact price: `numerator` quote units per `denominator` base units.
///
/// Stored gcd-normalized so structural equality matches ratio equality, which
/// makes `Ord` lawful for use as an orderbook level key. Prices of different
/// markets order by their tags first.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Price {
    pub numerator: u64,
    pub denominator: u64,
    pub base: String,
    pub quote: String,
}

impl Price {
    pub fn new(numerator: u64, denominator: u64, base: String, quote: String) -> Self {
        let divisor = gcd(numerator, denominator).max(1);
        Self { numerator: numerator / divisor, denominator: denominator / divisor, base, quote }
    }

    pub fn same_market(&self, other: &Price) -> bool {
        self.base == other.base && self.quote == other.quote
    }

    fn cross(&self, other: &Price) -> Ordering {
        let lhs = self.numerator as u128 * other.denominator as u128;
        let rhs = other.numerator as u128 * self.denominator as u128;
        lhs.cmp(&rhs)
    }
}

impl Ord for Price {
    fn cmp(&self, other: &Self) -> Ordering {
        (&self.base, &self.quote)
            .cmp(&(&other.base, &other.quote))
            .then_with(|| self.cross(other))
    }
}

impl PartialOrd for Price {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Price {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} {}/{}", self.numerator, self.denominator, self.quote, self.base)
    }
}

fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        let rem = a % b;
        a = b;
        b = rem;
    }
    a
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(base: u64, quote: u64) -> AssetPair {
        AssetPair::new(AssetAmount::new(base, "BTC"), AssetAmount::new(quote, "EUR")).unwrap()
    }

    #[test]
    fn amount_arithmetic_requires_matching_tags() {
        let a = AssetAmount::new(10, "BTC");
        let b = AssetAmount::new(3, "BTC");
        assert_eq!(a.checked_add(&b).unwrap().amount, 13);
        assert_eq!(a.checked_sub(&b).unwrap().amount, 7);

        let other = AssetAmount::new(1, "EUR");
        assert!(matches!(a.checked_add(&other), Err(AssetError::AssetMismatch(_, _))));
        assert!(matches!(b.checked_sub(&a), Err(AssetError::Underflow)));
    }

    #[test]
    fn pair_rejects_same_and_non_canonical_tags() {
        let same = AssetPair::new(AssetAmount::new(1, "BTC"), AssetAmount::new(1, "BTC"));
        assert!(matches!(same, Err(AssetError::AssetMismatch(_, _))));

        let flipped = AssetPair::new(AssetAmount::new(1, "EUR"), AssetAmount::new(1, "BTC"));
        assert!(matches!(flipped, Err(AssetError::NotCanonical(_, _))));
    }

    #[test]
    fn price_comparison_is_exact() {
        // 50/100 == 1/2, no float rounding involved.
        assert_eq!(pair(100, 50).price(), pair(2, 1).price());
        assert!(pair(100, 51).price() > pair(2, 1).price());
        assert!(pair(3, 1).price() < pair(2, 1).price());
    }

    #[test]
    fn price_normalizes_ratio() {
        let price = pair(100, 50).price();
        assert_eq!((price.numerator, price.denominator), (1, 2));
    }

    #[test]
    fn downscale_preserves_ratio_exactly() {
        let full = pair(100, 50);
        let scaled = full.proportional_downscale(60).unwrap();
        assert_eq!(scaled.first.amount, 60);
        assert_eq!(scaled.second.amount, 30);
        assert_eq!(scaled.price(), full.price());
    }

    #[test]
    fn downscale_rounds_down_to_exact_quote() {
        // 3 base / 2 quote: only multiples of 3 keep the quote leg integral.
        let full = pair(3, 2);
        assert!(full.proportional_downscale(2).is_none());
        let scaled = pair(6, 4).proportional_downscale(5).unwrap();
        assert_eq!((scaled.first.amount, scaled.second.amount), (3, 2));
    }
}
