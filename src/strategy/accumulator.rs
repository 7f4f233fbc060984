//! Periodic fixed-amount accumulation buys.
//!
//! Accumulation orders go straight to the exchange and are kept out of the
//! trade history, so they never age into forced liquidation.

use crate::config::AccumulationConfig;
use crate::exchange::{AccountSnapshot, ExchangeApi, OrderIntent, OrderResponse};
use crate::notify::{notify_best_effort, Notifier};
use crate::utils::format_krw;
use anyhow::{Context, Result};
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{info, warn};

/// What an accumulation run did.
#[derive(Debug, Clone)]
pub enum AccumulationOutcome {
    /// Quote balance at or below one trade unit; operator was warned.
    LowBalance { balance: Decimal },
    Bought {
        balance_before: Decimal,
        order: OrderResponse,
    },
}

pub struct Accumulator {
    exchange: Arc<dyn ExchangeApi>,
    notifier: Arc<dyn Notifier>,
    config: AccumulationConfig,
    quote_currency: String,
}

impl Accumulator {
    pub fn new(
        exchange: Arc<dyn ExchangeApi>,
        notifier: Arc<dyn Notifier>,
        config: AccumulationConfig,
        quote_currency: impl Into<String>,
    ) -> Self {
        Self {
            exchange,
            notifier,
            config,
            quote_currency: quote_currency.into(),
        }
    }

    fn trade_unit(&self) -> Decimal {
        Decimal::from(self.config.trade_unit)
    }

    pub async fn run(&self) -> Result<AccumulationOutcome> {
        let accounts = AccountSnapshot::new(
            self.exchange
                .get_accounts()
                .await
                .context("Failed to fetch balances for accumulation")?,
        );
        let balance = accounts.free_balance(&self.quote_currency);
        let unit = self.trade_unit();

        info!(balance = %format_krw(balance), "Current quote balance");

        if balance <= unit {
            warn!(balance = %balance, trade_unit = %unit, "Balance too low for accumulation");
            let contents = format!(
                "*KRW 잔고*: `{}`\n*설정 거래 단위*: `{}`\n거래소에 입금해 주세요.",
                format_krw(balance),
                format_krw(unit)
            );
            notify_best_effort(self.notifier.as_ref(), "[Accumulation] Low balance", &contents)
                .await;
            return Ok(AccumulationOutcome::LowBalance { balance });
        }

        info!(market = %self.config.market, amount = %unit, "Accumulation market buy");
        let order = self
            .exchange
            .place_order(&OrderIntent::market_buy(self.config.market.clone(), unit).to_request())
            .await
            .with_context(|| format!("Accumulation buy on {} failed", self.config.market))?;

        info!(uuid = %order.uuid, market = %order.market, "Accumulation order placed");

        let contents = format!(
            "*마켓*: `{}`\n*매수 금액*: `{}`\n*거래 직전 KRW 잔고*: `{}`\n*주문 uuid*: `{}`",
            self.config.market,
            format_krw(unit),
            format_krw(balance),
            order.uuid
        );
        notify_best_effort(self.notifier.as_ref(), "[Accumulation] Buy placed", &contents).await;

        Ok(AccumulationOutcome::Bought {
            balance_before: balance,
            order,
        })
    }
}
