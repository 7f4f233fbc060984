//! Merge expired lot volume with live balances into forced sells.

use crate::config::ForcedSellMode;
use crate::exchange::{AccountSnapshot, OrderIntent};
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Forced liquidation derived from one market's expired volume.
#[derive(Debug, Clone, PartialEq)]
pub struct ForcedSell {
    pub market: String,
    pub balance: Decimal,
    pub expired_volume: Decimal,
    pub intent: OrderIntent,
}

/// Builds forced market sells from expired volume and a balance snapshot.
pub struct PositionReconciler {
    mode: ForcedSellMode,
}

impl PositionReconciler {
    pub fn new(mode: ForcedSellMode) -> Self {
        Self { mode }
    }

    /// Volume to sell for a market holding `balance` with `expired` aged volume.
    pub fn sell_volume(&self, balance: Decimal, expired: Decimal) -> Decimal {
        match self.mode {
            // balance minus expired: the non-expired remainder is what gets sold
            ForcedSellMode::Remainder => balance - expired,
            ForcedSellMode::ExpiredOnly => expired.min(balance),
        }
    }

    /// One forced sell per market present in both inputs with positive volume.
    pub fn reconcile(
        &self,
        expired: &BTreeMap<String, Decimal>,
        accounts: &AccountSnapshot,
    ) -> Vec<ForcedSell> {
        let mut sells = Vec::new();

        for (market, expired_volume) in expired {
            let Some(account) = accounts.by_market(market) else {
                debug!(%market, "No balance row for expired market, skipping");
                continue;
            };

            let volume = self.sell_volume(account.balance, *expired_volume);
            if volume <= Decimal::ZERO {
                debug!(
                    %market,
                    balance = %account.balance,
                    expired = %expired_volume,
                    "Nothing to liquidate"
                );
                continue;
            }

            info!(
                %market,
                balance = %account.balance,
                expired = %expired_volume,
                sell_volume = %volume,
                mode = ?self.mode,
                "Forced sell planned"
            );

            sells.push(ForcedSell {
                market: market.clone(),
                balance: account.balance,
                expired_volume: *expired_volume,
                intent: OrderIntent::market_sell(market.clone(), volume),
            });
        }

        sells
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::AccountBalance;
    use rust_decimal_macros::dec;

    fn account(currency: &str, balance: Decimal) -> AccountBalance {
        AccountBalance {
            currency: currency.to_string(),
            balance,
            locked: Decimal::ZERO,
            avg_buy_price: Decimal::ZERO,
            avg_buy_price_modified: false,
            unit_currency: "KRW".to_string(),
        }
    }

    fn snapshot() -> AccountSnapshot {
        AccountSnapshot::new(vec![
            account("KRW", dec!(50000)),
            account("ETH", dec!(5)),
            account("XRP", dec!(100)),
        ])
    }

    #[test]
    fn test_remainder_mode_sells_balance_minus_expired() {
        let expired = BTreeMap::from([("KRW-ETH".to_string(), dec!(2))]);
        let sells = PositionReconciler::new(ForcedSellMode::Remainder).reconcile(&expired, &snapshot());

        assert_eq!(sells.len(), 1);
        assert_eq!(sells[0].intent, OrderIntent::market_sell("KRW-ETH", dec!(3)));
    }

    #[test]
    fn test_remainder_mode_skips_when_nothing_remains() {
        let expired = BTreeMap::from([("KRW-XRP".to_string(), dec!(100))]);
        let sells = PositionReconciler::new(ForcedSellMode::Remainder).reconcile(&expired, &snapshot());
        assert!(sells.is_empty());
    }

    #[test]
    fn test_expired_only_mode_caps_at_balance() {
        let expired = BTreeMap::from([
            ("KRW-ETH".to_string(), dec!(2)),
            ("KRW-XRP".to_string(), dec!(150)),
        ]);
        let sells = PositionReconciler::new(ForcedSellMode::ExpiredOnly).reconcile(&expired, &snapshot());

        assert_eq!(sells.len(), 2);
        assert_eq!(sells[0].intent.volume, Some(dec!(2)));
        assert_eq!(sells[1].intent.volume, Some(dec!(100)));
    }

    #[test]
    fn test_market_missing_from_snapshot_is_skipped() {
        let expired = BTreeMap::from([("KRW-SOL".to_string(), dec!(1))]);
        let sells = PositionReconciler::new(ForcedSellMode::Remainder).reconcile(&expired, &snapshot());
        assert!(sells.is_empty());
    }
}
