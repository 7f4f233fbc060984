//! Decimal arithmetic utilities for order sizing and reporting.

use rust_decimal::Decimal;

/// Round down to a multiple of `unit` (e.g. 1000 KRW budget steps).
pub fn floor_to_unit(value: Decimal, unit: Decimal) -> Decimal {
    if unit <= Decimal::ZERO {
        return value.floor();
    }
    (value / unit).floor() * unit
}

/// Whole-won amount with thousands separators, e.g. `1,234,567원`.
pub fn format_krw(value: Decimal) -> String {
    let whole = value.round().abs().to_string();
    let mut grouped = String::with_capacity(whole.len() + whole.len() / 3);
    for (i, ch) in whole.chars().enumerate() {
        if i > 0 && (whole.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }
    let sign = if value.round().is_sign_negative() && !value.round().is_zero() {
        "-"
    } else {
        ""
    };
    format!("{sign}{grouped}원")
}
