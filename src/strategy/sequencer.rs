//! Rebalance cycle sequencing.
//!
//! One cycle walks SELLING → SETTLING → BUDGETING → BUYING → DONE. Order
//! failures are isolated per order and reported; the cycle always finishes.

use super::executor::{OrderConfirmation, OrderExecutor, SubmitOutcome};
use crate::config::{Config, ExpiryConfig, RebalanceConfig};
use crate::exchange::{AccountSnapshot, ExchangeApi, OrderIntent, OrderResponse, TradeKind};
use crate::ledger::{expired_volume, expiry_cutoff, LotLedger, PositionReconciler};
use crate::notify::{notify_best_effort, Notifier};
use crate::persistence::TradeStore;
use crate::signal::{CandidateSet, PredictionQuery, PredictionSource, SignalRouter};
use crate::utils::{floor_to_unit, format_krw};
use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Cycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CyclePhase {
    Expiry,
    Selling,
    Settling,
    Budgeting,
    Buying,
    Done,
}

impl fmt::Display for CyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CyclePhase::Expiry => "EXPIRY",
            CyclePhase::Selling => "SELLING",
            CyclePhase::Settling => "SETTLING",
            CyclePhase::Budgeting => "BUDGETING",
            CyclePhase::Buying => "BUYING",
            CyclePhase::Done => "DONE",
        };
        f.write_str(name)
    }
}

/// Orders for one cycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RebalancePlan {
    pub sell_orders: Vec<OrderIntent>,
    pub buy_orders: Vec<OrderIntent>,
    pub each_budget: Decimal,
}

/// Business-rule rejection returned by the exchange.
#[derive(Debug, Clone)]
pub struct RejectedOrder {
    pub phase: CyclePhase,
    pub market: String,
    pub name: String,
    pub message: String,
}

/// Caught failure. `market` is `None` for phase-level failures such as a
/// balance query.
#[derive(Debug, Clone)]
pub struct PhaseFailure {
    pub phase: CyclePhase,
    pub market: Option<String>,
    pub kind: Option<TradeKind>,
    pub error: String,
}

/// Summary handed back to the caller once DONE is reached.
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub long_count: usize,
    pub short_count: usize,
    /// `None` when budgeting was skipped
    pub each_budget: Option<Decimal>,
    pub plan: RebalancePlan,
    pub sells: Vec<OrderConfirmation>,
    pub buys: Vec<OrderConfirmation>,
    pub rejections: Vec<RejectedOrder>,
    pub failures: Vec<PhaseFailure>,
    pub phase: CyclePhase,
}

impl CycleReport {
    fn new(candidates: &CandidateSet) -> Self {
        Self {
            long_count: candidates.long.len(),
            short_count: candidates.short.len(),
            each_budget: None,
            plan: RebalancePlan::default(),
            sells: Vec::new(),
            buys: Vec::new(),
            rejections: Vec::new(),
            failures: Vec::new(),
            phase: CyclePhase::Selling,
        }
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Outcome of a forced expiry liquidation.
#[derive(Debug, Clone)]
pub struct LiquidationReport {
    pub target_date: NaiveDate,
    pub cutoff: DateTime<Utc>,
    pub expired: BTreeMap<String, Decimal>,
    pub sells: Vec<OrderConfirmation>,
    pub rejections: Vec<RejectedOrder>,
    pub failures: Vec<PhaseFailure>,
}

/// Full `run` result: liquidation (when enabled) followed by the cycle.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub inference_date: NaiveDate,
    pub liquidation: Option<LiquidationReport>,
    pub cycle: CycleReport,
}

#[derive(Default)]
struct BatchOutcome {
    filled: Vec<OrderConfirmation>,
    rejections: Vec<RejectedOrder>,
    failures: Vec<PhaseFailure>,
}

/// Sell-side markets from the short set: a non-zero balance for the symbol
/// and a market that is not excluded. The full balance is sold.
pub fn plan_sells(
    candidates: &CandidateSet,
    accounts: &AccountSnapshot,
    config: &RebalanceConfig,
) -> Vec<OrderIntent> {
    let mut orders: Vec<OrderIntent> = Vec::new();

    for row in &candidates.short {
        if config.is_excluded(&row.market) {
            debug!(market = %row.market, "Excluded market, not selling");
            continue;
        }
        let Some(account) = accounts.by_symbol(&row.symbol) else {
            continue;
        };
        if account.balance <= Decimal::ZERO {
            continue;
        }
        if orders.iter().any(|o| o.market == row.market) {
            continue;
        }
        orders.push(OrderIntent::market_sell(row.market.clone(), account.balance));
    }

    orders
}

/// Equal per-market budget, floored to `unit`. Zero when there are no longs.
pub fn compute_each_budget(budget: Decimal, long_count: usize, unit: Decimal) -> Decimal {
    if long_count == 0 {
        return Decimal::ZERO;
    }
    floor_to_unit(budget.floor() / Decimal::from(long_count), unit)
}

/// Price-denominated market buys of `each_budget` for non-excluded longs.
pub fn plan_buys(
    candidates: &CandidateSet,
    each_budget: Decimal,
    config: &RebalanceConfig,
) -> Vec<OrderIntent> {
    let mut orders: Vec<OrderIntent> = Vec::new();

    for row in &candidates.long {
        if config.is_excluded(&row.market) {
            debug!(market = %row.market, "Excluded market, not buying");
            continue;
        }
        if orders.iter().any(|o| o.market == row.market) {
            continue;
        }
        orders.push(OrderIntent::market_buy(row.market.clone(), each_budget));
    }

    orders
}

/// Drives forced liquidation and the sell/buy cycle.
pub struct RebalanceSequencer {
    exchange: Arc<dyn ExchangeApi>,
    executor: OrderExecutor,
    store: Arc<dyn TradeStore>,
    notifier: Arc<dyn Notifier>,
    rebalance: RebalanceConfig,
    expiry: ExpiryConfig,
    quote_currency: String,
}

impl RebalanceSequencer {
    pub fn new(
        exchange: Arc<dyn ExchangeApi>,
        store: Arc<dyn TradeStore>,
        notifier: Arc<dyn Notifier>,
        config: &Config,
    ) -> Self {
        let executor = OrderExecutor::new(
            exchange.clone(),
            store.clone(),
            config.exchange.non_fatal_rejections.clone(),
        );

        Self {
            exchange,
            executor,
            store,
            notifier,
            rebalance: config.rebalance.clone(),
            expiry: config.expiry.clone(),
            quote_currency: config.exchange.quote_currency.clone(),
        }
    }

    /// Forced liquidation, prediction routing and one rebalance cycle.
    pub async fn run(
        &self,
        source: &dyn PredictionSource,
        router: &SignalRouter,
        today: NaiveDate,
    ) -> Result<RunReport> {
        let liquidation = if self.expiry.enabled {
            Some(self.liquidate_expired(today).await?)
        } else {
            None
        };

        let inference_date = self.rebalance.resolve_inference_date(today);
        let predictions = source
            .predictions(&PredictionQuery {
                inference_date,
                train_window_days: self.rebalance.train_window_days,
            })
            .context("Failed to load predictions")?;

        info!(%inference_date, rows = predictions.len(), "Predictions loaded");
        let candidates = router.route_for_date(&predictions, inference_date);

        let cycle = self.run_cycle(&candidates).await;

        let contents = format!(
            "*매수 종목 개수*: `{}`\n*매도 종목 개수*: `{}`\n",
            cycle.long_count, cycle.short_count
        );
        notify_best_effort(self.notifier.as_ref(), "[Rebalance] Cycle complete", &contents).await;

        Ok(RunReport {
            inference_date,
            liquidation,
            cycle,
        })
    }

    /// Sell positions whose lots aged past the expiry window as of `target_date`.
    pub async fn liquidate_expired(&self, target_date: NaiveDate) -> Result<LiquidationReport> {
        let events = self
            .store
            .load_all()
            .context("Failed to load trade history")?;
        let holdings = LotLedger::build(&events);

        let cutoff = expiry_cutoff(target_date, self.expiry.expire_range_days, self.expiry.offset());
        let expired = expired_volume(&holdings, cutoff);

        info!(
            %target_date,
            %cutoff,
            trades = events.len(),
            expired_markets = expired.len(),
            "Expiry scan complete"
        );

        let mut report = LiquidationReport {
            target_date,
            cutoff,
            expired,
            sells: Vec::new(),
            rejections: Vec::new(),
            failures: Vec::new(),
        };

        if report.expired.is_empty() {
            return Ok(report);
        }

        let accounts = match self.exchange.get_accounts().await {
            Ok(balances) => AccountSnapshot::new(balances),
            Err(e) => {
                error!(error = %e, "Failed to fetch balances for expiry liquidation");
                report.failures.push(PhaseFailure {
                    phase: CyclePhase::Expiry,
                    market: None,
                    kind: None,
                    error: e.to_string(),
                });
                self.report_failures(CyclePhase::Expiry, &report.failures).await;
                return Ok(report);
            }
        };

        let forced = PositionReconciler::new(self.expiry.forced_sell_mode)
            .reconcile(&report.expired, &accounts);
        let intents: Vec<OrderIntent> = forced.into_iter().map(|f| f.intent).collect();

        let batch = self.execute_batch(CyclePhase::Expiry, &intents).await;
        self.report_failures(CyclePhase::Expiry, &batch.failures).await;

        report.sells = batch.filled;
        report.rejections = batch.rejections;
        report.failures = batch.failures;
        Ok(report)
    }

    /// Run SELLING → SETTLING → BUDGETING → BUYING → DONE once.
    pub async fn run_cycle(&self, candidates: &CandidateSet) -> CycleReport {
        let mut report = CycleReport::new(candidates);

        info!(
            long = report.long_count,
            short = report.short_count,
            "Starting rebalance cycle"
        );

        // SELLING
        self.enter(&mut report, CyclePhase::Selling);
        if report.short_count == 0 {
            info!("No short candidates, skipping sells");
        } else {
            match self.fetch_accounts(CyclePhase::Selling, &mut report).await {
                Some(accounts) => {
                    let sells = plan_sells(candidates, &accounts, &self.rebalance);
                    info!(orders = sells.len(), "Sell orders planned");
                    let batch = self.execute_batch(CyclePhase::Selling, &sells).await;
                    report.plan.sell_orders = sells;
                    report.sells = batch.filled;
                    report.rejections.extend(batch.rejections);
                    report.failures.extend(batch.failures);
                }
                None => warn!("Skipping sells, balances unavailable"),
            }
        }
        self.report_phase_failures(CyclePhase::Selling, &report).await;

        // SETTLING
        self.enter(&mut report, CyclePhase::Settling);
        self.settle(&report.sells).await;

        // BUDGETING
        self.enter(&mut report, CyclePhase::Budgeting);
        let buys = if report.long_count == 0 {
            info!("No long candidates, skipping budget");
            Vec::new()
        } else {
            match self.fetch_accounts(CyclePhase::Budgeting, &mut report).await {
                Some(accounts) => {
                    let budget = accounts.free_balance(&self.quote_currency).floor();
                    let each_budget =
                        compute_each_budget(budget, report.long_count, self.budget_unit());
                    info!(
                        budget = %format_krw(budget),
                        each_budget = %format_krw(each_budget),
                        long = report.long_count,
                        "Budget computed"
                    );
                    report.each_budget = Some(each_budget);
                    report.plan.each_budget = each_budget;

                    if each_budget.is_zero() {
                        warn!(%budget, long = report.long_count, "Per-market budget is zero, skipping buys");
                        Vec::new()
                    } else {
                        plan_buys(candidates, each_budget, &self.rebalance)
                    }
                }
                None => {
                    warn!("Skipping buys, balances unavailable");
                    Vec::new()
                }
            }
        };
        self.report_phase_failures(CyclePhase::Budgeting, &report).await;

        // BUYING
        self.enter(&mut report, CyclePhase::Buying);
        let batch = self.execute_batch(CyclePhase::Buying, &buys).await;
        report.plan.buy_orders = buys;
        report.buys = batch.filled;
        report.rejections.extend(batch.rejections);
        report.failures.extend(batch.failures);
        self.report_phase_failures(CyclePhase::Buying, &report).await;

        self.enter(&mut report, CyclePhase::Done);
        info!(
            sells = report.sells.len(),
            buys = report.buys.len(),
            rejections = report.rejections.len(),
            failures = report.failures.len(),
            "Rebalance cycle complete"
        );

        report
    }

    fn enter(&self, report: &mut CycleReport, phase: CyclePhase) {
        debug!(from = %report.phase, to = %phase, "Cycle phase");
        report.phase = phase;
    }

    fn budget_unit(&self) -> Decimal {
        Decimal::from(self.rebalance.budget_unit)
    }

    async fn fetch_accounts(
        &self,
        phase: CyclePhase,
        report: &mut CycleReport,
    ) -> Option<AccountSnapshot> {
        match self.exchange.get_accounts().await {
            Ok(balances) => Some(AccountSnapshot::new(balances)),
            Err(e) => {
                error!(%phase, error = %e, "Failed to fetch balances");
                report.failures.push(PhaseFailure {
                    phase,
                    market: None,
                    kind: None,
                    error: e.to_string(),
                });
                None
            }
        }
    }

    async fn execute_batch(&self, phase: CyclePhase, intents: &[OrderIntent]) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();

        for intent in intents {
            match self.executor.submit(intent).await {
                Ok(SubmitOutcome::Executed(confirmation)) => outcome.filled.push(confirmation),
                Ok(SubmitOutcome::Rejected {
                    market,
                    name,
                    message,
                    ..
                }) => outcome.rejections.push(RejectedOrder {
                    phase,
                    market,
                    name,
                    message,
                }),
                Err(e) => {
                    error!(%phase, market = %intent.market, error = %e, "Order failed, continuing");
                    outcome.failures.push(PhaseFailure {
                        phase,
                        market: Some(intent.market.clone()),
                        kind: Some(intent.kind),
                        error: e.to_string(),
                    });
                }
            }
        }

        outcome
    }

    /// Wait for sells to clear before the budget is read.
    async fn settle(&self, sells: &[OrderConfirmation]) {
        let Some(timeout_secs) = self.rebalance.settlement_poll_timeout_secs else {
            let wait = self.rebalance.settlement_wait();
            info!(wait_secs = wait.as_secs(), "Waiting for sell settlement");
            tokio::time::sleep(wait).await;
            return;
        };

        let deadline = Instant::now() + Duration::from_secs(timeout_secs);
        let interval = Duration::from_secs(self.rebalance.settlement_poll_interval_secs);
        let mut pending: Vec<&str> = sells.iter().map(|s| s.uuid.as_str()).collect();

        while !pending.is_empty() {
            let mut still_pending = Vec::new();
            for uuid in pending {
                let detail = self
                    .exchange
                    .get_order(uuid)
                    .await
                    .map(serde_json::from_value::<OrderResponse>);
                match detail {
                    Ok(Ok(order)) if order.is_settled() => {}
                    Ok(Ok(_)) => still_pending.push(uuid),
                    Ok(Err(e)) => {
                        debug!(%uuid, error = %e, "Unreadable order detail");
                        still_pending.push(uuid);
                    }
                    Err(e) => {
                        debug!(%uuid, error = %e, "Settlement lookup failed");
                        still_pending.push(uuid);
                    }
                }
            }
            pending = still_pending;

            if pending.is_empty() {
                break;
            }
            if Instant::now() >= deadline {
                warn!(pending = pending.len(), "Settlement poll timed out, continuing");
                break;
            }
            tokio::time::sleep(interval).await;
        }
    }

    async fn report_phase_failures(&self, phase: CyclePhase, report: &CycleReport) {
        let failures: Vec<PhaseFailure> = report
            .failures
            .iter()
            .filter(|f| f.phase == phase)
            .cloned()
            .collect();
        self.report_failures(phase, &failures).await;
    }

    async fn report_failures(&self, phase: CyclePhase, failures: &[PhaseFailure]) {
        if failures.is_empty() {
            return;
        }

        let orders = failures.iter().filter(|f| f.market.is_some()).count();
        let title = if orders == 0 {
            format!("[Rebalance] {} balance query failed", phase)
        } else {
            format!("[Rebalance] {} failed for {} order(s)", phase, orders)
        };
        let contents = failures
            .iter()
            .map(|f| {
                format!(
                    "*{}* `{}`: {}",
                    f.market.as_deref().unwrap_or("-"),
                    f.kind.map(|k| k.as_str()).unwrap_or("accounts"),
                    f.error
                )
            })
            .collect::<Vec<_>>()
            .join("\n");

        notify_best_effort(self.notifier.as_ref(), &title, &contents).await;
    }
}
