//! Rebalancing strategy.
//!
//! - Order execution with trade recording
//! - The sell/settle/budget/buy cycle and forced expiry liquidation
//! - Periodic accumulation buys

mod accumulator;
mod executor;
mod sequencer;

pub use accumulator::{AccumulationOutcome, Accumulator};
pub use executor::{ExecutionError, OrderConfirmation, OrderExecutor, SubmitOutcome};
pub use sequencer::{
    compute_each_budget, plan_buys, plan_sells, CyclePhase, CycleReport, LiquidationReport,
    PhaseFailure, RebalancePlan, RebalanceSequencer, RejectedOrder, RunReport,
};
