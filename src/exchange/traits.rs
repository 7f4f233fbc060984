//! Exchange boundary used by the execution engine.
//!
//! The sequencer and executor only see this trait, so the live Bithumb
//! client, the paper exchange and test doubles are interchangeable.

use super::error::ExchangeError;
use super::types::{AccountBalance, NewOrder, OrderResponse};
use async_trait::async_trait;

#[cfg(test)]
use mockall::automock;

/// Result of a raw exchange call.
pub type ExchangeResult<T> = std::result::Result<T, ExchangeError>;

/// Order placement and account query RPCs.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ExchangeApi: Send + Sync {
    /// Point-in-time balances for every currency held.
    async fn get_accounts(&self) -> ExchangeResult<Vec<AccountBalance>>;

    /// Place an order. The response carries the exchange uuid.
    async fn place_order(&self, order: &NewOrder) -> ExchangeResult<OrderResponse>;

    /// Look up an order by uuid, returning the raw payload.
    async fn get_order(&self, uuid: &str) -> ExchangeResult<serde_json::Value>;
}
