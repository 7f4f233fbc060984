//! Mock exchange for paper trading and tests.

use super::error::ExchangeError;
use super::traits::{ExchangeApi, ExchangeResult};
use super::types::*;
use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

/// Simulated account and order book state.
#[derive(Debug)]
pub struct MockTradingState {
    /// currency -> free balance
    pub balances: HashMap<String, Decimal>,
    /// uuid -> order payload as `GET /v1/order` would return it
    pub orders: HashMap<String, serde_json::Value>,
    pub order_count: u64,
}

/// Paper exchange that fills market orders instantly at fixed prices.
pub struct MockExchange {
    state: Arc<RwLock<MockTradingState>>,
    order_id_counter: AtomicU64,
    /// Simulated prices per market, in quote currency
    prices: Arc<RwLock<HashMap<String, Decimal>>>,
    /// Markets whose orders fail with a transport-style error
    failing_markets: Arc<RwLock<HashSet<String>>>,
    quote_currency: String,
    /// Minimum order total in quote currency
    min_order_total: Decimal,
    /// Trading fee rate (0.04%)
    fee_rate: Decimal,
}

impl MockExchange {
    /// Create a new mock exchange holding `initial_krw` of the quote currency.
    pub fn new(initial_krw: Decimal) -> Self {
        let mut balances = HashMap::new();
        balances.insert("KRW".to_string(), initial_krw);

        Self {
            state: Arc::new(RwLock::new(MockTradingState {
                balances,
                orders: HashMap::new(),
                order_count: 0,
            })),
            order_id_counter: AtomicU64::new(1),
            prices: Arc::new(RwLock::new(HashMap::new())),
            failing_markets: Arc::new(RwLock::new(HashSet::new())),
            quote_currency: "KRW".to_string(),
            min_order_total: dec!(5000),
            fee_rate: dec!(0.0004),
        }
    }

    /// Set the simulated price for a market.
    pub async fn set_price(&self, market: &str, price: Decimal) {
        self.prices.write().await.insert(market.to_string(), price);
    }

    /// Set a free balance directly.
    pub async fn set_balance(&self, currency: &str, amount: Decimal) {
        self.state
            .write()
            .await
            .balances
            .insert(currency.to_string(), amount);
    }

    /// Make every order on `market` fail until cleared.
    pub async fn fail_market(&self, market: &str) {
        self.failing_markets.write().await.insert(market.to_string());
    }

    pub async fn balance(&self, currency: &str) -> Decimal {
        self.state
            .read()
            .await
            .balances
            .get(currency)
            .copied()
            .unwrap_or(Decimal::ZERO)
    }

    pub async fn order_count(&self) -> u64 {
        self.state.read().await.order_count
    }

    fn next_uuid(&self) -> String {
        format!("mock-{}", self.order_id_counter.fetch_add(1, Ordering::SeqCst))
    }

    fn rejection(name: &str, message: String) -> ExchangeError {
        ExchangeError::Rejected {
            name: name.to_string(),
            payload: json!({"error": {"name": name, "message": message}}),
            message,
        }
    }

    fn base_currency(market: &str) -> &str {
        market.split_once('-').map(|(_, base)| base).unwrap_or(market)
    }
}

#[async_trait]
impl ExchangeApi for MockExchange {
    async fn get_accounts(&self) -> ExchangeResult<Vec<AccountBalance>> {
        let state = self.state.read().await;
        let mut balances: Vec<AccountBalance> = state
            .balances
            .iter()
            .map(|(currency, amount)| AccountBalance {
                currency: currency.clone(),
                balance: *amount,
                locked: Decimal::ZERO,
                avg_buy_price: Decimal::ZERO,
                avg_buy_price_modified: false,
                unit_currency: self.quote_currency.clone(),
            })
            .collect();
        balances.sort_by(|a, b| a.currency.cmp(&b.currency));
        Ok(balances)
    }

    async fn place_order(&self, order: &NewOrder) -> ExchangeResult<OrderResponse> {
        if self.failing_markets.read().await.contains(&order.market) {
            return Err(ExchangeError::Other(format!(
                "simulated outage for {}",
                order.market
            )));
        }

        let price = self
            .prices
            .read()
            .await
            .get(&order.market)
            .copied()
            .ok_or_else(|| {
                Self::rejection("market_not_found", format!("unknown market {}", order.market))
            })?;

        let base = Self::base_currency(&order.market).to_string();
        let mut state = self.state.write().await;

        let (executed_volume, quote_delta, base_delta, fee) = match (order.side, order.ord_type) {
            (OrderSide::Ask, OrdType::Market) => {
                let volume = order.volume.unwrap_or(Decimal::ZERO);
                let notional = volume * price;
                if notional < self.min_order_total {
                    return Err(Self::rejection(
                        "under_min_total_ask",
                        format!("order total {} below minimum {}", notional, self.min_order_total),
                    ));
                }
                let held = state.balances.get(&base).copied().unwrap_or(Decimal::ZERO);
                if volume > held {
                    return Err(Self::rejection(
                        "insufficient_funds_ask",
                        format!("requested {} but only {} available", volume, held),
                    ));
                }
                let fee = notional * self.fee_rate;
                (volume, notional - fee, -volume, fee)
            }
            (OrderSide::Bid, OrdType::Price) => {
                let amount = order.price.unwrap_or(Decimal::ZERO);
                if amount < self.min_order_total {
                    return Err(Self::rejection(
                        "under_min_total_bid",
                        format!("order total {} below minimum {}", amount, self.min_order_total),
                    ));
                }
                let cash = state
                    .balances
                    .get(&self.quote_currency)
                    .copied()
                    .unwrap_or(Decimal::ZERO);
                if amount > cash {
                    return Err(Self::rejection(
                        "insufficient_funds_bid",
                        format!("requested {} but only {} available", amount, cash),
                    ));
                }
                let fee = amount * self.fee_rate;
                let volume = ((amount - fee) / price).round_dp(8);
                (volume, -amount, volume, fee)
            }
            (side, ord_type) => {
                return Err(Self::rejection(
                    "invalid_ord_type",
                    format!("{:?}/{:?} is not supported by the paper exchange", side, ord_type),
                ));
            }
        };

        *state
            .balances
            .entry(self.quote_currency.clone())
            .or_insert(Decimal::ZERO) += quote_delta;
        let base_balance = state.balances.entry(base.clone()).or_insert(Decimal::ZERO);
        *base_balance += base_delta;
        if base_balance.is_zero() {
            state.balances.remove(&base);
        }
        state.order_count += 1;

        let uuid = self.next_uuid();
        let created_at = Utc::now();
        let payload = json!({
            "uuid": uuid,
            "side": order.side.as_str(),
            "ord_type": order.ord_type.as_str(),
            "market": order.market,
            "state": "done",
            "created_at": created_at.to_rfc3339(),
            "price": order.price.map(|p| p.to_string()),
            "volume": order.volume.map(|v| v.to_string()),
            "remaining_volume": "0",
            "executed_volume": executed_volume.to_string(),
            "paid_fee": fee.to_string(),
            "trades_count": 1,
        });
        state.orders.insert(uuid.clone(), payload.clone());

        info!(
            %uuid,
            market = %order.market,
            side = ?order.side,
            executed_volume = %executed_volume,
            price = %price,
            fee = %fee,
            "Mock order executed"
        );

        Ok(serde_json::from_value(payload)?)
    }

    async fn get_order(&self, uuid: &str) -> ExchangeResult<serde_json::Value> {
        self.state
            .read()
            .await
            .orders
            .get(uuid)
            .cloned()
            .ok_or_else(|| Self::rejection("order_not_found", format!("no order {}", uuid)))
    }
}
