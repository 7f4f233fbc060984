//! Position state derived from the trade log.
//!
//! - FIFO lot reconstruction
//! - Expiry filtering by lot age
//! - Reconciliation of expired volume against live balances

mod expiry;
mod lots;
mod reconciler;

pub use expiry::{expired_volume, expiry_cutoff};
pub use lots::{Holdings, LedgerReplay, Lot, LotLedger, TradeEvent};
pub use reconciler::{ForcedSell, PositionReconciler};
