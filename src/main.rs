//! Upbit Daily Trader - Main Entry Point
//!
//! Runs the schedulers and trade lifecycles until Ctrl-C or a fatal error,
//! then drains active lifecycles and exits.

use anyhow::{anyhow, Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use futures_util::future::join_all;
use rust_decimal::Decimal;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn, Level};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;
use upbit_daily_trader::alerts::{AlertDispatcher, WebhookSink};
use upbit_daily_trader::config::Config;
use upbit_daily_trader::exchange::{
    MockExchange, OrderPlacer, UpbitClient, UpbitWebSocket, WalletProvider,
};
use upbit_daily_trader::market::{PriceFeedKeeper, WalletSync};
use upbit_daily_trader::persistence::PurchaseLedger;
use upbit_daily_trader::state::SharedState;
use upbit_daily_trader::strategy::{
    AcceptAll, BreakoutPredicate, CandidatePredicate, CandidateSelector, IndicatorScheduler,
    MovingAverageCalculator, TradeContext, TradeSpawner, TradingQueueRotator,
};
use upbit_daily_trader::utils::{Clock, ExchangeClock, Shutdown, ShutdownReason};

/// Upbit Daily Trader CLI
#[derive(Parser)]
#[command(name = "upbit-daily-trader")]
#[command(version, about = "Once-a-day buy / take-profit sell on Upbit KRW markets")]
struct Cli {
    /// Paper trading: real market data, simulated orders and wallet
    #[arg(long)]
    paper: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show open purchases and the trades of a day from the ledger
    Status {
        /// Path to the ledger database (default: from configuration)
        #[arg(short, long)]
        db: Option<String>,

        /// Day to report (YYYY-MM-DD, default: today in the exchange timezone)
        #[arg(short = 'D', long)]
        date: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging()?;

    let config = Config::load()?;
    config.validate()?;

    match cli.command {
        Some(Commands::Status { db, date }) => {
            let default_path = if cli.paper {
                &config.ledger.paper_path
            } else {
                &config.ledger.path
            };
            let path = db.unwrap_or_else(|| default_path.clone());
            show_status(&config, &path, date.as_deref())
        }
        None => run(config, cli.paper).await,
    }
}

async fn run(config: Config, paper: bool) -> Result<()> {
    info!("╔════════════════════════════════════════════════════════════╗");
    info!(
        "║        Upbit Daily Trader v{} - {}                  ║",
        env!("CARGO_PKG_VERSION"),
        if paper { "Paper Trading" } else { "LIVE Trading " }
    );
    info!("╚════════════════════════════════════════════════════════════╝");

    if !paper {
        warn!("⚠️  LIVE TRADING MODE - Real money at risk!");
        anyhow::ensure!(
            !config.upbit.access_key.is_empty() && !config.upbit.secret_key.is_empty(),
            "Upbit credentials missing: set UPBIT_ACCESS_KEY / UPBIT_SECRET_KEY or run with --paper"
        );
    }
    log_config(&config, paper);

    let clock: Arc<dyn Clock> = Arc::new(ExchangeClock::new(config.timezone()?));
    let shutdown = Shutdown::new();

    let sink = Arc::new(WebhookSink::new(&config.alerts)?);
    let (alerts, _alert_worker) = AlertDispatcher::spawn(
        sink,
        config.alerts.queue_capacity,
        Duration::from_secs(config.alerts.fatal_timeout_secs),
    );

    let ledger_path = if paper {
        &config.ledger.paper_path
    } else {
        &config.ledger.path
    };
    let ledger = match PurchaseLedger::open(ledger_path, clock.today()) {
        Ok(ledger) => Arc::new(ledger),
        Err(e) => {
            error!(error = %e, "Failed to open purchase ledger");
            alerts
                .fatal(format!("Purchase ledger unavailable: {:#}. Not starting.", e))
                .await;
            return Err(e.context("Purchase ledger unavailable"));
        }
    };

    let client = Arc::new(UpbitClient::new(&config.upbit)?);
    let (orders, wallet): (Arc<dyn OrderPlacer>, Arc<dyn WalletProvider>) = if paper {
        info!("📝 Paper trading: orders and wallet are simulated");
        let mock = Arc::new(MockExchange::paper());
        (mock.clone() as Arc<dyn OrderPlacer>, mock as Arc<dyn WalletProvider>)
    } else {
        (
            client.clone() as Arc<dyn OrderPlacer>,
            client.clone() as Arc<dyn WalletProvider>,
        )
    };

    let state = Arc::new(SharedState::new(config.trading.slot_capacity));

    let predicate: Box<dyn CandidatePredicate> = if config.indicators.accept_all {
        warn!("Accept-all predicate enabled: every market with a full window is a candidate");
        Box::new(AcceptAll)
    } else {
        Box::new(BreakoutPredicate::default())
    };

    let scheduler = IndicatorScheduler::new(
        client.clone(),
        Arc::new(MovingAverageCalculator),
        CandidateSelector::new(predicate, state.clone()),
        state.clone(),
        alerts.clone(),
        clock.clone(),
        config.indicators.clone(),
    );
    let rotator = TradingQueueRotator::new(state.clone(), config.trading.rotation_interval());
    let keeper = PriceFeedKeeper::new(
        UpbitWebSocket::new(),
        state.clone(),
        alerts.clone(),
        shutdown.clone(),
        config.feed.clone(),
    );
    let wallet_sync = WalletSync::new(
        wallet,
        state.clone(),
        alerts.clone(),
        shutdown.clone(),
        config.feed.wallet_refresh(),
        config.feed.max_wallet_failures,
    );
    let spawner = TradeSpawner::new(TradeContext {
        state: state.clone(),
        ledger: ledger.clone(),
        orders,
        alerts: alerts.clone(),
        clock: clock.clone(),
        config: config.trading.clone(),
        shutdown: shutdown.clone(),
    });

    // Shutdown signal
    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("🛑 Shutdown signal received");
        signal_shutdown.trigger(ShutdownReason::Signal);
    });

    info!("🚀 Starting schedulers...");
    alerts.notify(format!(
        "Trader started ({})",
        if paper { "paper" } else { "live" }
    ));

    let mut loops: Vec<JoinHandle<()>> = Vec::new();
    loops.push(tokio::spawn({
        let shutdown = shutdown.clone();
        async move { scheduler.run(shutdown).await }
    }));
    loops.push(tokio::spawn({
        let shutdown = shutdown.clone();
        async move { rotator.run(shutdown).await }
    }));
    loops.push(tokio::spawn(async move {
        if let Err(e) = keeper.run().await {
            error!(error = %e, "Price feed keeper exited");
        }
    }));
    loops.push(tokio::spawn(async move {
        if let Err(e) = wallet_sync.run().await {
            error!(error = %e, "Wallet sync exited");
        }
    }));
    loops.push(tokio::spawn(spawner.run()));

    shutdown.wait().await;
    let reason = shutdown.reason().unwrap_or(ShutdownReason::Signal);
    info!(%reason, "Shutting down");

    let grace = config.trading.shutdown_grace();
    if tokio::time::timeout(grace, join_all(loops)).await.is_err() {
        warn!(?grace, "Schedulers did not stop within grace period");
    }
    drain_lifecycles(&state, grace).await;

    alerts.notify(format!("Trader stopped: {}", reason));
    alerts
        .flush(Duration::from_secs(config.alerts.fatal_timeout_secs))
        .await;

    info!("👋 Upbit Daily Trader shutdown complete");
    match reason {
        ShutdownReason::Fatal(msg) => Err(anyhow!("Stopped after fatal error: {}", msg)),
        ShutdownReason::Signal => Ok(()),
    }
}

/// Wait for running lifecycles to release their slots.
async fn drain_lifecycles(state: &SharedState, grace: Duration) {
    let deadline = tokio::time::Instant::now() + grace;
    loop {
        let active = state.active_count().await;
        if active == 0 {
            info!("All trade lifecycles finished");
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            warn!(active, "Trade lifecycles still running at exit; open purchases stay in the ledger");
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

/// Initialize logging with file output.
fn init_logging() -> Result<()> {
    use tracing_subscriber::fmt::writer::MakeWriterExt;

    std::fs::create_dir_all("logs")?;

    let file_appender = tracing_appender::rolling::hourly("logs", "trader.log");
    let (file_writer, _guard) = tracing_appender::non_blocking(file_appender);

    // Leak the guard to keep it alive for the program duration
    Box::leak(Box::new(_guard));

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("upbit_daily_trader=debug".parse()?)
                .add_directive(Level::INFO.into()),
        )
        .with_writer(std::io::stdout.and(file_writer))
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .init();

    Ok(())
}

/// Log configuration on startup.
fn log_config(config: &Config, paper: bool) {
    info!("📋 Configuration:");
    info!("   Purchase Amount: {} KRW", config.trading.purchase_amount);
    info!(
        "   Take Profit: +{}%",
        (config.trading.take_profit_multiplier - Decimal::ONE) * Decimal::ONE_HUNDRED
    );
    info!(
        "   Daily Buy Time: {} {}",
        config.trading.daily_buy_time, config.trading.timezone
    );
    info!("   Trading Slots: {}", config.trading.slot_capacity);
    info!(
        "   Indicator Window: {} bars, {} fetch workers",
        config.indicators.bar_window, config.indicators.worker_threads
    );
    info!(
        "   Ledger: {}",
        if paper {
            &config.ledger.paper_path
        } else {
            &config.ledger.path
        }
    );
    if config.alerts.webhook_url.is_none() {
        info!("   Webhook: not configured, alerts are logged only");
    }
}

/// Print open purchases and the day's completed trades.
fn show_status(config: &Config, db_path: &str, date: Option<&str>) -> Result<()> {
    println!("╔════════════════════════════════════════════════════════════╗");
    println!("║              UPBIT DAILY TRADER STATUS                     ║");
    println!("╚════════════════════════════════════════════════════════════╝");

    if !Path::new(db_path).exists() {
        println!("\n❌ Ledger not found: {}", db_path);
        println!("   The trader has not been started yet, or the path is incorrect.");
        return Ok(());
    }

    let day = match date {
        Some(s) => NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .with_context(|| format!("Invalid date '{}', expected YYYY-MM-DD", s))?,
        None => ExchangeClock::new(config.timezone()?).today(),
    };

    let ledger = PurchaseLedger::open(db_path, day)?;
    let open = ledger.open_purchases();
    let trades = ledger.history_for(day)?;

    println!("\n🔓 Open Purchases ({})", open.len());
    for record in &open {
        let bought_today = if record.date == day { " (today)" } else { "" };
        println!(
            "   ├─ {:<12} {} @ {} KRW  bought {}{}",
            record.symbol, record.volume, record.buy_price, record.date, bought_today
        );
    }

    println!("\n📈 Trades bought on {} ({})", day, trades.len());
    let mut total = Decimal::ZERO;
    for trade in &trades {
        total += trade.profit();
        println!(
            "   ├─ {:<12} {} → {} KRW  P/L {:.0} KRW  sold {}",
            trade.symbol,
            trade.buy_price,
            trade.sell_price,
            trade.profit(),
            trade.sold_at.format("%Y-%m-%d %H:%M:%S UTC")
        );
    }
    println!("   └─ Realized P/L: {:.0} KRW", total);

    Ok(())
}
