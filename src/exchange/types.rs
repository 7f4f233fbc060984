//! Type definitions for Bithumb API requests and responses.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Account balance row as returned by `GET /v1/accounts`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountBalance {
    pub currency: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub balance: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub locked: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub avg_buy_price: Decimal,
    #[serde(default)]
    pub avg_buy_price_modified: bool,
    pub unit_currency: String,
}

impl AccountBalance {
    /// Market code for this holding, e.g. "KRW-ETH".
    pub fn market(&self) -> String {
        format!("{}-{}", self.unit_currency, self.currency)
    }
}

/// Point-in-time account snapshot.
#[derive(Debug, Clone, Default)]
pub struct AccountSnapshot {
    pub balances: Vec<AccountBalance>,
}

impl AccountSnapshot {
    pub fn new(balances: Vec<AccountBalance>) -> Self {
        Self { balances }
    }

    /// Balance row for a currency symbol (e.g. "ETH", "KRW").
    pub fn by_symbol(&self, symbol: &str) -> Option<&AccountBalance> {
        self.balances.iter().find(|b| b.currency == symbol)
    }

    /// Balance row for a market code (e.g. "KRW-ETH").
    pub fn by_market(&self, market: &str) -> Option<&AccountBalance> {
        self.balances.iter().find(|b| b.market() == market)
    }

    /// Free balance of a currency, zero when the row is missing.
    pub fn free_balance(&self, symbol: &str) -> Decimal {
        self.by_symbol(symbol)
            .map(|b| b.balance)
            .unwrap_or(Decimal::ZERO)
    }
}

/// Order side. `bid` buys, `ask` sells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Bid,
    Ask,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Bid => "bid",
            OrderSide::Ask => "ask",
        }
    }
}

/// Order type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrdType {
    /// Limit order (volume + price)
    Limit,
    /// Market buy denominated in quote currency (price only)
    Price,
    /// Market sell denominated in base volume (volume only)
    Market,
}

impl OrdType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrdType::Limit => "limit",
            OrdType::Price => "price",
            OrdType::Market => "market",
        }
    }
}

/// Trade direction as recorded in the trade history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeKind {
    Buy,
    Sell,
}

impl TradeKind {
    pub fn side(&self) -> OrderSide {
        match self {
            TradeKind::Buy => OrderSide::Bid,
            TradeKind::Sell => OrderSide::Ask,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TradeKind::Buy => "buy",
            TradeKind::Sell => "sell",
        }
    }
}

impl fmt::Display for TradeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TradeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "buy" | "bid" => Ok(TradeKind::Buy),
            "sell" | "ask" => Ok(TradeKind::Sell),
            other => Err(format!("unknown trade kind: {other}")),
        }
    }
}

/// A single order the engine intends to place.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderIntent {
    pub kind: TradeKind,
    pub market: String,
    pub ord_type: OrdType,
    /// Base volume (sells, limit orders)
    pub volume: Option<Decimal>,
    /// Quote amount (price-denominated buys) or limit price
    pub price: Option<Decimal>,
}

impl OrderIntent {
    /// Market sell of `volume` base units.
    pub fn market_sell(market: impl Into<String>, volume: Decimal) -> Self {
        Self {
            kind: TradeKind::Sell,
            market: market.into(),
            ord_type: OrdType::Market,
            volume: Some(volume),
            price: None,
        }
    }

    /// Market buy spending `amount` of the quote currency.
    pub fn market_buy(market: impl Into<String>, amount: Decimal) -> Self {
        Self {
            kind: TradeKind::Buy,
            market: market.into(),
            ord_type: OrdType::Price,
            volume: None,
            price: Some(amount),
        }
    }

    /// Wire request for this intent.
    pub fn to_request(&self) -> NewOrder {
        NewOrder {
            market: self.market.clone(),
            side: self.kind.side(),
            ord_type: self.ord_type,
            volume: self.volume,
            price: self.price,
        }
    }
}

/// New order request for `POST /v1/orders`.
#[derive(Debug, Clone, PartialEq)]
pub struct NewOrder {
    pub market: String,
    pub side: OrderSide,
    pub ord_type: OrdType,
    pub volume: Option<Decimal>,
    pub price: Option<Decimal>,
}

impl NewOrder {
    /// Ordered key/value parameters. The query hash and the JSON body are
    /// both built from these strings and must never be rendered separately.
    pub fn params(&self) -> Vec<(&'static str, String)> {
        let mut params = vec![
            ("market", self.market.clone()),
            ("side", self.side.as_str().to_string()),
            ("ord_type", self.ord_type.as_str().to_string()),
        ];
        if let Some(volume) = self.volume {
            params.push(("volume", volume.normalize().to_string()));
        }
        if let Some(price) = self.price {
            params.push(("price", price.normalize().to_string()));
        }
        params
    }

    /// JSON body carrying exactly the strings from [`NewOrder::params`].
    pub fn body(&self) -> serde_json::Map<String, serde_json::Value> {
        self.params()
            .into_iter()
            .map(|(k, v)| (k.to_string(), serde_json::Value::String(v)))
            .collect()
    }
}

/// Order as returned by placement and `GET /v1/order`.
#[derive(Debug, Clone, Deserialize)]
pub struct OrderResponse {
    pub uuid: String,
    pub side: OrderSide,
    pub ord_type: OrdType,
    pub market: String,
    #[serde(default)]
    pub state: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, with = "rust_decimal::serde::str_option")]
    pub price: Option<Decimal>,
    #[serde(default, with = "rust_decimal::serde::str_option")]
    pub volume: Option<Decimal>,
    #[serde(default, with = "rust_decimal::serde::str_option")]
    pub remaining_volume: Option<Decimal>,
    #[serde(default, with = "rust_decimal::serde::str_option")]
    pub executed_volume: Option<Decimal>,
}

impl OrderResponse {
    pub fn executed_volume(&self) -> Decimal {
        self.executed_volume.unwrap_or(Decimal::ZERO)
    }

    /// Whether the order reached a final state on the exchange.
    pub fn is_settled(&self) -> bool {
        matches!(self.state.as_deref(), Some("done") | Some("cancel"))
    }
}

/// Structured error body: `{"error": {"name": ..., "message": ...}}`.
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorEnvelope {
    pub error: ErrorBody,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ErrorBody {
    pub name: String,
    #[serde(default)]
    pub message: String,
}
