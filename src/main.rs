//! Crypto Rebalancer - Main Entry Point
//!
//! Live trading against Bithumb, or paper trading with `--mock`.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use crypto_rebalancer::config::Config;
use crypto_rebalancer::exchange::{BithumbClient, ExchangeApi, MockExchange};
use crypto_rebalancer::ledger::{expired_volume, expiry_cutoff, LotLedger};
use crypto_rebalancer::notify::{self, Notifier};
use crypto_rebalancer::persistence::{SqliteTradeStore, TradeStore};
use crypto_rebalancer::signal::{CsvPredictionLoader, SignalRouter};
use crypto_rebalancer::strategy::{
    AccumulationOutcome, Accumulator, CycleReport, LiquidationReport, RebalanceSequencer,
};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, warn, Level};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

/// Crypto Rebalancer CLI
#[derive(Parser)]
#[command(name = "crypto-rebalancer")]
#[command(version, about = "Prediction-driven spot rebalancing on Bithumb")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Liquidate expired lots, route predictions and run one rebalance cycle
    Run {
        /// Prediction table (CSV, or JSON when the file ends in .json)
        #[arg(short, long)]
        predictions: String,

        #[command(flatten)]
        exchange: ExchangeArgs,
    },

    /// Liquidate expired lots only
    Expire {
        #[command(flatten)]
        exchange: ExchangeArgs,
    },

    /// Print lots reconstructed from the trade history
    Holdings {
        /// Path to SQLite database (default: persistence.db_path)
        #[arg(short, long)]
        db: Option<String>,
    },

    /// Place one accumulation buy
    Accumulate {
        #[command(flatten)]
        exchange: ExchangeArgs,
    },
}

#[derive(Args, Clone)]
struct ExchangeArgs {
    /// Paper trade against an in-memory exchange
    #[arg(long)]
    mock: bool,

    /// Starting KRW balance for the paper exchange
    #[arg(long, default_value = "1000000")]
    initial_krw: Decimal,

    /// Paper exchange price, e.g. --price KRW-ETH=4000000 (repeatable)
    #[arg(long = "price", value_parser = parse_price)]
    prices: Vec<(String, Decimal)>,

    /// Path to SQLite database (default: persistence.db_path, in-memory with --mock)
    #[arg(long)]
    db: Option<String>,
}

fn parse_price(s: &str) -> Result<(String, Decimal), String> {
    let (market, price) = s
        .split_once('=')
        .ok_or_else(|| format!("expected MARKET=PRICE, got {s}"))?;
    let price = Decimal::from_str(price).map_err(|e| format!("invalid price {price}: {e}"))?;
    Ok((market.to_string(), price))
}

/// Trading mode: Live (real money) or Mock (paper trading).
#[derive(Debug, Clone, Copy, PartialEq)]
enum TradingMode {
    Live,
    Mock,
}

/// Exchange, trade store and notifier for one invocation.
struct Runtime {
    mode: TradingMode,
    exchange: Arc<dyn ExchangeApi>,
    store: Arc<dyn TradeStore>,
    notifier: Arc<dyn Notifier>,
}

impl Runtime {
    async fn build(config: &Config, args: &ExchangeArgs) -> Result<Self> {
        let notifier = notify::from_config(&config.notification)?;

        if args.mock {
            info!("📝 MOCK TRADING MODE - Paper trading enabled");
            let exchange = MockExchange::new(args.initial_krw);
            for (market, price) in &args.prices {
                exchange.set_price(market, *price).await;
            }

            let store: Arc<dyn TradeStore> = match &args.db {
                Some(path) => Arc::new(SqliteTradeStore::new(path)?),
                None => Arc::new(SqliteTradeStore::in_memory()?),
            };

            return Ok(Self {
                mode: TradingMode::Mock,
                exchange: Arc::new(exchange),
                store,
                notifier,
            });
        }

        warn!("⚠️  LIVE TRADING MODE - Real money at risk!");
        anyhow::ensure!(
            !config.exchange.api_key.is_empty() && !config.exchange.secret_key.is_empty(),
            "Live trading requires REB__EXCHANGE__API_KEY and REB__EXCHANGE__SECRET_KEY"
        );

        let db_path = args.db.as_deref().unwrap_or(&config.persistence.db_path);
        Ok(Self {
            mode: TradingMode::Live,
            exchange: Arc::new(BithumbClient::new(&config.exchange)?),
            store: Arc::new(SqliteTradeStore::new(db_path)?),
            notifier,
        })
    }

    fn sequencer(&self, config: &Config) -> RebalanceSequencer {
        RebalanceSequencer::new(
            self.exchange.clone(),
            self.store.clone(),
            self.notifier.clone(),
            config,
        )
    }

    fn accumulator(&self, config: &Config) -> Accumulator {
        Accumulator::new(
            self.exchange.clone(),
            self.notifier.clone(),
            config.accumulation.clone(),
            config.exchange.quote_currency.clone(),
        )
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse();

    init_logging()?;

    let config = Config::load()?;
    config.validate()?;

    match cli.command {
        Commands::Run {
            predictions,
            exchange,
        } => run(&config, &predictions, &exchange).await,
        Commands::Expire { exchange } => expire(&config, &exchange).await,
        Commands::Holdings { db } => {
            show_holdings(&config, db.as_deref().unwrap_or(&config.persistence.db_path))
        }
        Commands::Accumulate { exchange } => {
            let runtime = Runtime::build(&config, &exchange).await?;
            accumulate(&runtime, &config).await
        }
    }
}

async fn run(config: &Config, predictions: &str, args: &ExchangeArgs) -> Result<()> {
    info!("╔════════════════════════════════════════════════════════════╗");
    info!(
        "║          Crypto Rebalancer v{} - Rebalance Run            ║",
        env!("CARGO_PKG_VERSION")
    );
    info!("╚════════════════════════════════════════════════════════════╝");
    log_config(config);

    let runtime = Runtime::build(config, args).await?;
    let sequencer = runtime.sequencer(config);
    let source = CsvPredictionLoader::new(predictions);
    let router = SignalRouter::new(config.rebalance.long_quantile, config.rebalance.short_quantile);

    let today = config.expiry.local_today();
    let report = sequencer.run(&source, &router, today).await?;

    if let Some(liquidation) = &report.liquidation {
        log_liquidation(liquidation);
    }
    log_cycle(&report.cycle);

    if config.accumulation.enabled {
        accumulate(&runtime, config).await?;
    }

    info!(mode = ?runtime.mode, inference_date = %report.inference_date, "👋 Run complete");
    Ok(())
}

async fn expire(config: &Config, args: &ExchangeArgs) -> Result<()> {
    let runtime = Runtime::build(config, args).await?;
    let report = runtime
        .sequencer(config)
        .liquidate_expired(config.expiry.local_today())
        .await?;
    log_liquidation(&report);
    Ok(())
}

async fn accumulate(runtime: &Runtime, config: &Config) -> Result<()> {
    match runtime.accumulator(config).run().await? {
        AccumulationOutcome::LowBalance { balance } => {
            warn!(%balance, "Accumulation skipped, balance too low");
        }
        AccumulationOutcome::Bought {
            balance_before,
            order,
        } => {
            info!(uuid = %order.uuid, %balance_before, "Accumulation buy placed");
        }
    }
    Ok(())
}

/// Initialize logging to stdout and a daily log file.
///
/// `LOG_FORMAT=json` switches both outputs to JSON lines.
fn init_logging() -> Result<()> {
    use tracing_subscriber::fmt::writer::MakeWriterExt;

    std::fs::create_dir_all("logs")?;

    let file_appender = tracing_appender::rolling::daily("logs", "rebalancer.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    // Leak the guard to keep it alive for the program duration
    Box::leak(Box::new(guard));

    let filter = EnvFilter::from_default_env()
        .add_directive("crypto_rebalancer=debug".parse()?)
        .add_directive(Level::INFO.into());

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stdout.and(file_writer))
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::CLOSE);

    if std::env::var("LOG_FORMAT").map(|v| v == "json").unwrap_or(false) {
        builder.json().init();
    } else {
        builder.with_ansi(true).init();
    }

    Ok(())
}

/// Log configuration on startup.
fn log_config(config: &Config) {
    let rebalance = &config.rebalance;
    info!("📋 Configuration:");
    info!("   Train Window: {} days", rebalance.train_window_days);
    info!(
        "   Quantiles: long ≥ q{:.2}, short ≤ q{:.2}",
        rebalance.long_quantile, rebalance.short_quantile
    );
    info!("   Excluded Markets: {:?}", rebalance.excluded_markets);
    info!("   Settlement Wait: {}s", rebalance.settlement_wait_secs);
    info!("   Budget Unit: {} KRW", rebalance.budget_unit);
    info!(
        "   Expiry: {} ({} days, {:?}, UTC{:+})",
        if config.expiry.enabled { "on" } else { "off" },
        config.expiry.expire_range_days,
        config.expiry.forced_sell_mode,
        config.expiry.utc_offset_hours
    );
    info!(
        "   Accumulation: {} ({} per run on {})",
        if config.accumulation.enabled { "on" } else { "off" },
        config.accumulation.trade_unit,
        config.accumulation.market
    );
}

fn log_liquidation(report: &LiquidationReport) {
    info!(
        target_date = %report.target_date,
        cutoff = %report.cutoff,
        expired_markets = report.expired.len(),
        sells = report.sells.len(),
        rejections = report.rejections.len(),
        failures = report.failures.len(),
        "Expiry liquidation finished"
    );
}

fn log_cycle(report: &CycleReport) {
    info!(
        long = report.long_count,
        short = report.short_count,
        each_budget = ?report.each_budget,
        sells = report.sells.len(),
        buys = report.buys.len(),
        rejections = report.rejections.len(),
        failures = report.failures.len(),
        "Rebalance cycle finished"
    );
    for failure in &report.failures {
        warn!(
            phase = %failure.phase,
            market = ?failure.market,
            error = %failure.error,
            "Cycle failure"
        );
    }
}

/// Print lots reconstructed from the persisted trade history.
fn show_holdings(config: &Config, db_path: &str) -> Result<()> {
    println!("╔════════════════════════════════════════════════════════════╗");
    println!("║              LOT HOLDINGS                                  ║");
    println!("╚════════════════════════════════════════════════════════════╝");

    if !Path::new(db_path).exists() {
        println!("\n❌ Database not found: {}", db_path);
        println!("   No trades have been recorded yet, or the database path is incorrect.");
        return Ok(());
    }

    let store = SqliteTradeStore::new(db_path)?;
    let events = store.load_all().context("Failed to load trade history")?;
    let replay = LotLedger::replay(&events);

    let today = config.expiry.local_today();
    let cutoff = expiry_cutoff(today, config.expiry.expire_range_days, config.expiry.offset());
    let expired = expired_volume(&replay.holdings, cutoff);
    let offset = config.expiry.offset();

    println!("\n📊 Trade History");
    println!("   ├─ Recorded Trades:  {}", events.len());
    println!("   ├─ Open Markets:     {}", replay.holdings.markets().count());
    println!("   └─ Expiry Cutoff:    {}", cutoff.with_timezone(&offset).format("%Y-%m-%d %H:%M %:z"));

    if replay.holdings.is_empty() {
        println!("\n   No open lots.");
    }

    for market in replay.holdings.markets() {
        let expired_here = expired.get(market).copied().unwrap_or(dec!(0));
        println!("\n🔓 {}", market);
        println!("   ├─ Total:   {}", replay.holdings.total_volume(market));
        println!("   ├─ Expired: {}", expired_here);
        for lot in replay.holdings.lots(market) {
            let marker = if lot.opened_at < cutoff { "⏰" } else { "  " };
            println!(
                "   │  {} {}  {}",
                marker,
                lot.opened_at.with_timezone(&offset).format("%Y-%m-%d %H:%M"),
                lot.remaining_volume
            );
        }
        println!("   └─");
    }

    if !replay.unmatched_sells.is_empty() {
        println!("\n⚠️  Unmatched Sell Volume");
        for (market, volume) in &replay.unmatched_sells {
            if *volume > Decimal::ZERO {
                println!("   ├─ {}: {}", market, volume);
            }
        }
    }

    println!();
    Ok(())
}
