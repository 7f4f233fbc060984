//! Quantile split of a prediction table into long and short candidates.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Model output for one asset on one inference date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionRecord {
    pub as_of_date: NaiveDate,
    /// Market code, e.g. "KRW-ETH"
    pub market: String,
    /// Base currency, e.g. "ETH"
    pub symbol: String,
    pub predicted_score: f64,
}

/// Long and short candidates for one rebalance cycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CandidateSet {
    pub long: Vec<PredictionRecord>,
    pub short: Vec<PredictionRecord>,
    pub long_threshold: Option<f64>,
    pub short_threshold: Option<f64>,
}

/// Quantile with linear interpolation between closest ranks.
///
/// `sorted` must be ascending.
pub fn quantile(sorted: &[f64], q: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let q = q.clamp(0.0, 1.0);
    let pos = (sorted.len() - 1) as f64 * q;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    let frac = pos - lo as f64;
    Some(sorted[lo] + (sorted[hi] - sorted[lo]) * frac)
}

/// Splits predictions by score quantiles. Both bounds are inclusive, so a
/// degenerate distribution can put the same row in both sets.
#[derive(Debug, Clone)]
pub struct SignalRouter {
    long_quantile: f64,
    short_quantile: f64,
}

impl Default for SignalRouter {
    fn default() -> Self {
        Self::new(0.8, 0.2)
    }
}

impl SignalRouter {
    pub fn new(long_quantile: f64, short_quantile: f64) -> Self {
        Self {
            long_quantile,
            short_quantile,
        }
    }

    /// Route every record in `predictions`.
    pub fn route(&self, predictions: &[PredictionRecord]) -> CandidateSet {
        let usable: Vec<&PredictionRecord> = predictions
            .iter()
            .filter(|p| {
                let finite = p.predicted_score.is_finite();
                if !finite {
                    warn!(market = %p.market, "Dropping prediction with non-finite score");
                }
                finite
            })
            .collect();

        let mut scores: Vec<f64> = usable.iter().map(|p| p.predicted_score).collect();
        scores.sort_by(f64::total_cmp);

        let (Some(long_threshold), Some(short_threshold)) = (
            quantile(&scores, self.long_quantile),
            quantile(&scores, self.short_quantile),
        ) else {
            return CandidateSet::default();
        };

        let long: Vec<PredictionRecord> = usable
            .iter()
            .filter(|p| p.predicted_score >= long_threshold)
            .map(|p| (*p).clone())
            .collect();
        let short: Vec<PredictionRecord> = usable
            .iter()
            .filter(|p| p.predicted_score <= short_threshold)
            .map(|p| (*p).clone())
            .collect();

        debug!(
            rows = usable.len(),
            long_threshold,
            short_threshold,
            long = long.len(),
            short = short.len(),
            "Predictions routed"
        );

        CandidateSet {
            long,
            short,
            long_threshold: Some(long_threshold),
            short_threshold: Some(short_threshold),
        }
    }

    /// Route only the rows of `inference_date`.
    pub fn route_for_date(
        &self,
        predictions: &[PredictionRecord],
        inference_date: NaiveDate,
    ) -> CandidateSet {
        let rows: Vec<PredictionRecord> = predictions
            .iter()
            .filter(|p| p.as_of_date == inference_date)
            .cloned()
            .collect();
        self.route(&rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(market: &str, score: f64) -> PredictionRecord {
        PredictionRecord {
            as_of_date: NaiveDate::from_ymd_opt(2024, 5, 9).unwrap(),
            market: market.to_string(),
            symbol: market.trim_start_matches("KRW-").to_string(),
            predicted_score: score,
        }
    }

    fn markets(records: &[PredictionRecord]) -> Vec<&str> {
        records.iter().map(|r| r.market.as_str()).collect()
    }

    #[test]
    fn test_quantile_interpolates() {
        let scores = [1.0, 2.0, 3.0, 4.0, 5.0];
        assert!((quantile(&scores, 0.8).unwrap() - 4.2).abs() < 1e-9);
        assert!((quantile(&scores, 0.2).unwrap() - 1.8).abs() < 1e-9);
        assert_eq!(quantile(&scores, 0.0), Some(1.0));
        assert_eq!(quantile(&scores, 1.0), Some(5.0));
        assert_eq!(quantile(&[], 0.5), None);
    }

    #[test]
    fn test_five_scores_select_extremes() {
        let table: Vec<_> = (1..=5).map(|i| record(&format!("KRW-C{i}"), i as f64)).collect();
        let candidates = SignalRouter::default().route(&table);

        assert_eq!(markets(&candidates.long), vec!["KRW-C5"]);
        assert_eq!(markets(&candidates.short), vec!["KRW-C1"]);
    }

    #[test]
    fn test_equal_scores_land_in_both_sets() {
        let table = vec![record("KRW-A", 0.3), record("KRW-B", 0.3), record("KRW-C", 0.3)];
        let candidates = SignalRouter::default().route(&table);

        assert_eq!(candidates.long.len(), 3);
        assert_eq!(candidates.short.len(), 3);
    }

    #[test]
    fn test_empty_table_yields_empty_sets() {
        let candidates = SignalRouter::default().route(&[]);
        assert!(candidates.long.is_empty());
        assert!(candidates.short.is_empty());
        assert_eq!(candidates.long_threshold, None);
    }

    #[test]
    fn test_non_finite_scores_are_ignored() {
        let table = vec![record("KRW-A", 1.0), record("KRW-B", f64::NAN), record("KRW-C", 2.0)];
        let candidates = SignalRouter::new(1.0, 0.0).route(&table);

        assert_eq!(markets(&candidates.long), vec!["KRW-C"]);
        assert_eq!(markets(&candidates.short), vec!["KRW-A"]);
    }

    #[test]
    fn test_route_for_date_filters_other_days() {
        let mut stale = record("KRW-OLD", 9.0);
        stale.as_of_date = NaiveDate::from_ymd_opt(2024, 5, 8).unwrap();
        let table = vec![stale, record("KRW-A", 1.0), record("KRW-B", 2.0)];

        let candidates = SignalRouter::default()
            .route_for_date(&table, NaiveDate::from_ymd_opt(2024, 5, 9).unwrap());

        assert_eq!(markets(&candidates.long), vec!["KRW-B"]);
        assert!(!markets(&candidates.short).contains(&"KRW-OLD"));
    }
}
