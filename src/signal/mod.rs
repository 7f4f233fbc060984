//! Trading signals from model predictions.
//!
//! - Loading the prediction table handed over by the model
//! - Quantile routing into long and short candidate sets

mod loader;
mod router;

pub use loader::{CsvPredictionLoader, PredictionQuery, PredictionSource};
pub use router::{quantile, CandidateSet, PredictionRecord, SignalRouter};
