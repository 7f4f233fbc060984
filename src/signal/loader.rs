//! Prediction table loading.
//!
//! The model lives outside this crate; it hands over its ranked scores as a
//! CSV or JSON file.

use super::router::PredictionRecord;
use anyhow::{Context, Result};
use chrono::NaiveDate;
use std::path::{Path, PathBuf};

/// Parameters the prediction source is asked for.
#[derive(Debug, Clone, PartialEq)]
pub struct PredictionQuery {
    pub inference_date: NaiveDate,
    /// History length the model was trained on (days)
    pub train_window_days: u32,
}

/// Source of per-cycle prediction tables.
pub trait PredictionSource: Send + Sync {
    fn predictions(&self, query: &PredictionQuery) -> Result<Vec<PredictionRecord>>;
}

/// File-backed prediction table.
///
/// Files ending in `.json` hold an array of records; anything else is read
/// as CSV:
/// ```csv
/// as_of_date,market,symbol,predicted_score
/// 2024-05-09,KRW-ETH,ETH,0.0132
/// ```
#[derive(Debug, Clone)]
pub struct CsvPredictionLoader {
    path: PathBuf,
}

impl CsvPredictionLoader {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Load every row of the file.
    pub fn load_all(&self) -> Result<Vec<PredictionRecord>> {
        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read prediction file: {}", self.path.display()))?;

        let is_json = self
            .path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        if is_json {
            serde_json::from_str(&content).context("Failed to parse prediction JSON")
        } else {
            Self::from_csv_content(&content)
        }
    }

    /// Parse CSV content with an optional header row.
    pub fn from_csv_content(content: &str) -> Result<Vec<PredictionRecord>> {
        let mut rows = Vec::new();

        for (line_num, line) in content.lines().enumerate() {
            // Skip header
            if line_num == 0 && line.starts_with("as_of_date") {
                continue;
            }

            if line.trim().is_empty() {
                continue;
            }

            let row = Self::parse_line(line)
                .with_context(|| format!("Failed to parse line {}: {}", line_num + 1, line))?;
            rows.push(row);
        }

        Ok(rows)
    }

    fn parse_line(line: &str) -> Result<PredictionRecord> {
        let parts: Vec<&str> = line.split(',').map(str::trim).collect();
        anyhow::ensure!(parts.len() == 4, "expected 4 columns, got {}", parts.len());

        Ok(PredictionRecord {
            as_of_date: NaiveDate::parse_from_str(parts[0], "%Y-%m-%d")
                .context("Invalid as_of_date")?,
            market: parts[1].to_string(),
            symbol: parts[2].to_string(),
            predicted_score: parts[3].parse().context("Invalid predicted_score")?,
        })
    }
}

impl PredictionSource for CsvPredictionLoader {
    fn predictions(&self, query: &PredictionQuery) -> Result<Vec<PredictionRecord>> {
        Ok(self
            .load_all()?
            .into_iter()
            .filter(|p| p.as_of_date == query.inference_date)
            .collect())
    }
}
