//! FIFO lot reconstruction from the append-only trade log.
//!
//! Holdings are never persisted: they are rebuilt from [`TradeEvent`]s on
//! every pass, so replaying the same log always yields the same lots.

use crate::exchange::TradeKind;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::debug;

/// A confirmed trade as recorded in the trade history.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TradeEvent {
    /// Exchange order uuid
    pub id: String,
    pub kind: TradeKind,
    pub market: String,
    pub executed_volume: Decimal,
    pub created_at: DateTime<Utc>,
    /// Order payload as returned by the exchange
    pub raw_payload: serde_json::Value,
}

/// A partially consumable quantity bought at `opened_at`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Lot {
    pub market: String,
    pub opened_at: DateTime<Utc>,
    pub remaining_volume: Decimal,
}

/// Open lots per market, oldest first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Holdings {
    markets: BTreeMap<String, BTreeMap<DateTime<Utc>, Decimal>>,
}

impl Holdings {
    pub fn is_empty(&self) -> bool {
        self.markets.is_empty()
    }

    pub fn markets(&self) -> impl Iterator<Item = &str> {
        self.markets.keys().map(String::as_str)
    }

    /// Lots of one market ordered by `opened_at` ascending.
    pub fn lots(&self, market: &str) -> Vec<Lot> {
        self.markets
            .get(market)
            .map(|book| {
                book.iter()
                    .map(|(opened_at, volume)| Lot {
                        market: market.to_string(),
                        opened_at: *opened_at,
                        remaining_volume: *volume,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Every open lot, grouped by market then ordered by age.
    pub fn iter_lots(&self) -> impl Iterator<Item = Lot> + '_ {
        self.markets.iter().flat_map(|(market, book)| {
            book.iter().map(move |(opened_at, volume)| Lot {
                market: market.clone(),
                opened_at: *opened_at,
                remaining_volume: *volume,
            })
        })
    }

    /// Total open volume of a market.
    pub fn total_volume(&self, market: &str) -> Decimal {
        self.markets
            .get(market)
            .map(|book| book.values().copied().sum())
            .unwrap_or(Decimal::ZERO)
    }

    fn add(&mut self, market: &str, opened_at: DateTime<Utc>, volume: Decimal) {
        *self
            .markets
            .entry(market.to_string())
            .or_default()
            .entry(opened_at)
            .or_insert(Decimal::ZERO) += volume;
    }

    /// Consume `volume` from lots opened strictly before `sold_at`, oldest first.
    /// Returns the part of `volume` that found no lot.
    fn consume(&mut self, market: &str, sold_at: DateTime<Utc>, volume: Decimal) -> Decimal {
        let Some(book) = self.markets.get_mut(market) else {
            return volume;
        };

        let mut remaining = volume;
        let mut drained = Vec::new();

        for (opened_at, available) in book.iter_mut() {
            if remaining <= Decimal::ZERO {
                break;
            }
            if *opened_at >= sold_at {
                continue;
            }

            let deduct = remaining.min(*available);
            *available -= deduct;
            remaining -= deduct;

            if available.is_zero() {
                drained.push(*opened_at);
            }
        }

        for opened_at in drained {
            book.remove(&opened_at);
        }
        if book.is_empty() {
            self.markets.remove(market);
        }

        remaining
    }
}

/// Outcome of one replay pass.
#[derive(Debug, Clone, Default)]
pub struct LedgerReplay {
    pub holdings: Holdings,
    /// Sell volume per market that matched no earlier lot (dropped)
    pub unmatched_sells: BTreeMap<String, Decimal>,
}

/// Replays trade events into FIFO holdings.
pub struct LotLedger;

impl LotLedger {
    /// Rebuild holdings from the full trade log.
    pub fn build(events: &[TradeEvent]) -> Holdings {
        Self::replay(events).holdings
    }

    /// Rebuild holdings and report unmatched sell volume.
    ///
    /// Events are processed in `created_at` order; ties keep log order.
    pub fn replay(events: &[TradeEvent]) -> LedgerReplay {
        let mut ordered: Vec<&TradeEvent> = events.iter().collect();
        ordered.sort_by_key(|e| e.created_at);

        let mut replay = LedgerReplay::default();

        for event in ordered {
            match event.kind {
                TradeKind::Buy => {
                    if event.executed_volume > Decimal::ZERO {
                        replay
                            .holdings
                            .add(&event.market, event.created_at, event.executed_volume);
                    }
                }
                TradeKind::Sell => {
                    let unmatched = replay.holdings.consume(
                        &event.market,
                        event.created_at,
                        event.executed_volume,
                    );
                    if unmatched > Decimal::ZERO {
                        debug!(
                            market = %event.market,
                            sell_id = %event.id,
                            %unmatched,
                            "Sell volume without an earlier lot dropped"
                        );
                        *replay
                            .unmatched_sells
                            .entry(event.market.clone())
                            .or_insert(Decimal::ZERO) += unmatched;
                    }
                }
            }
        }

        replay
    }
}
