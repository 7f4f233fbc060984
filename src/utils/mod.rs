//! Shared utilities.

pub mod decimal;

pub use decimal::{floor_to_unit, format_krw};
