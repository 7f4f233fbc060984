//! Exchange integration for the rebalancer.
//!
//! ## Bithumb
//! REST connectivity (JWT-signed) for:
//! - Account balances
//! - Order placement (market sell by volume, market buy by KRW amount)
//! - Order lookup by uuid, used to record executed trades
//!
//! ## Paper trading
//! [`MockExchange`] simulates fills against an in-memory book of balances.

mod client;
mod error;
pub mod mock;
mod traits;
mod types;

pub use client::BithumbClient;
pub use error::ExchangeError;
pub use mock::MockExchange;
#[cfg(test)]
pub use traits::MockExchangeApi;
pub use traits::{ExchangeApi, ExchangeResult};
pub use types::*;
