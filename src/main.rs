use anyhow::Context;
use clap::{Parser, Subcommand};
use perpguard::execution::{ControlLoop, LoopExit};
use perpguard::gateway::{PaperExchange, SyntheticFeed};
use perpguard::journal::{trade_log, PerformanceSummary, TradeLog};
use perpguard::strategy::rsi_bollinger::RsiBollingerSignal;
use perpguard::{telemetry, BotConfig};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Leveraged single-position risk engine
#[derive(Parser, Debug)]
#[command(name = "perpguard", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the control loop against the paper exchange with a synthetic feed
    Run {
        /// TOML config file (PERPGUARD_* env vars still override it)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Seed for the synthetic price feed
        #[arg(long, default_value_t = 42)]
        seed: u64,

        /// Stop after publishing this many new candles
        #[arg(long)]
        max_candles: Option<usize>,

        /// Delay between intrabar updates in milliseconds
        #[arg(long, default_value_t = 500)]
        tick_ms: u64,

        /// Intrabar updates per candle
        #[arg(long, default_value_t = 4)]
        updates: usize,

        /// Starting price of the synthetic feed
        #[arg(long, default_value_t = 2000.0)]
        start_price: f64,

        /// Free margin of the paper account in USDT
        #[arg(long, default_value_t = 1000.0)]
        balance: f64,
    },
    /// Print performance metrics from a trade log
    Summary {
        /// Trade log to read (defaults to the configured path)
        #[arg(short, long)]
        trade_log: Option<PathBuf>,

        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Emit JSON instead of the text report
        #[arg(long)]
        json: bool,
    },
}

struct RunArgs {
    config: Option<PathBuf>,
    seed: u64,
    max_candles: Option<usize>,
    tick_ms: u64,
    updates: usize,
    start_price: f64,
    balance: f64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            config,
            seed,
            max_candles,
            tick_ms,
            updates,
            start_price,
            balance,
        } => {
            let exit = run(RunArgs {
                config,
                seed,
                max_candles,
                tick_ms,
                updates,
                start_price,
                balance,
            })
            .await?;

            if let LoopExit::BreakerTripped(trip) = exit {
                eprintln!("halted by circuit breaker: {}", trip);
                std::process::exit(1);
            }
            Ok(())
        }
        Command::Summary {
            trade_log,
            config,
            json,
        } => summary(trade_log, config, json),
    }
}

async fn run(args: RunArgs) -> anyhow::Result<LoopExit> {
    let config = BotConfig::load(args.config.as_deref()).context("loading configuration")?;
    telemetry::init(&config.logging)?;

    tracing::info!("🚀 perpguard starting (paper mode)");
    tracing::info!("\n📊 Configuration:");
    tracing::info!("  Symbol: {} @ {}", config.symbol, config.timeframe);
    tracing::info!(
        "  Sizing: {:.2} USDT x{} (buffer {:.2})",
        config.sizing.notional_usdt,
        config.sizing.leverage,
        config.sizing.margin_buffer
    );
    tracing::info!(
        "  Stops: {}x ATR({}), breakeven at {}R, trail from {}R",
        config.risk.initial_sl_mult,
        config.risk.atr_period,
        config.risk.breakeven_trigger_r,
        config.risk.trail_activate_r
    );
    tracing::info!("  Trade log: {}", config.logging.trade_log.display());

    let journal = TradeLog::file(&config.logging.trade_log)?;

    let mut feed = SyntheticFeed::new(args.seed, args.start_price, config.timeframe);
    let exchange = Arc::new(PaperExchange::new(args.start_price, args.balance));
    exchange.seed_history(feed.history(config.control.history_candles));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown_tx = Arc::new(shutdown_tx);

    let feed_task = {
        let exchange = Arc::clone(&exchange);
        let shutdown_tx = Arc::clone(&shutdown_tx);
        let tick = Duration::from_millis(args.tick_ms);
        let updates = args.updates;
        let max_candles = args.max_candles;
        tokio::spawn(async move {
            let mut published = 0usize;
            loop {
                for candle in feed.next_candle(updates) {
                    tokio::time::sleep(tick).await;
                    exchange.push_candle(candle);
                }
                published += 1;

                if max_candles.is_some_and(|max| published >= max) {
                    tracing::info!("📈 Feed finished after {} candles", published);
                    shutdown_tx.send_replace(true);
                    break;
                }
            }
        })
    };

    let signal_task = {
        let shutdown_tx = Arc::clone(&shutdown_tx);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("\n⚠️  Received Ctrl+C, shutting down...");
                shutdown_tx.send_replace(true);
            }
        })
    };

    let mut control = ControlLoop::new(
        Arc::clone(&exchange),
        config.clone(),
        RsiBollingerSignal::default(),
        journal.clone(),
    );
    let exit = control.run(shutdown_rx).await;

    feed_task.abort();
    signal_task.abort();

    let exit = exit?;
    match journal.records() {
        Ok(records) => {
            let summary = PerformanceSummary::from_records(&records);
            println!("{}", summary);
        }
        Err(e) => tracing::warn!("Could not read trade log back: {:#}", e),
    }

    Ok(exit)
}

fn summary(trade_log: Option<PathBuf>, config: Option<PathBuf>, json: bool) -> anyhow::Result<()> {
    let path = match trade_log {
        Some(path) => path,
        None => BotConfig::load(config.as_deref())?.logging.trade_log,
    };

    let records = trade_log::read_records(&path)
        .with_context(|| format!("reading trade log {}", path.display()))?;
    let summary = PerformanceSummary::from_records(&records);

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!("{}", summary);
    }
    Ok(())
}
