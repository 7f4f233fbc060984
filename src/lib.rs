//! # Crypto Rebalancer
//!
//! Prediction-driven rebalancing of a KRW spot portfolio on Bithumb, with
//! FIFO lot aging reconstructed from the trade log.
//!
//! ## Architecture
//!
//! - `config`: Configuration management and validation
//! - `exchange`: Bithumb REST client, order/account types, paper exchange
//! - `ledger`: FIFO lot reconstruction, expiry filter, forced-sell reconciliation
//! - `signal`: Prediction loading and long/short quantile routing
//! - `strategy`: Order execution adapter, rebalance sequencer, accumulation
//! - `persistence`: SQLite-backed append-only trade history
//! - `notify`: Slack / log notifications
//! - `utils`: Shared utilities and decimal arithmetic

pub mod config;
pub mod exchange;
pub mod ledger;
pub mod notify;
pub mod persistence;
pub mod signal;
pub mod strategy;
pub mod utils;

pub use config::Config;
