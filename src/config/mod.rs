//! Configuration management for the daily trader.
//!
//! Loads settings from environment variables and config files.

use anyhow::{anyhow, Context, Result};
use chrono::NaiveTime;
use chrono_tz::Tz;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Upbit API credentials
    #[serde(default)]
    pub upbit: UpbitConfig,
    /// Outbound alert settings
    #[serde(default)]
    pub alerts: AlertConfig,
    /// Trade lifecycle parameters
    #[serde(default)]
    pub trading: TradingConfig,
    /// Indicator computation parameters
    #[serde(default)]
    pub indicators: IndicatorConfig,
    /// Live price feed and wallet sync parameters
    #[serde(default)]
    pub feed: FeedConfig,
    /// Purchase ledger location
    #[serde(default)]
    pub ledger: LedgerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpbitConfig {
    /// Access key used as the JWT `access_key` claim
    #[serde(default)]
    pub access_key: String,
    /// Secret key for signing requests
    #[serde(default)]
    pub secret_key: String,
    /// Number of retries on HTTP 429 before giving up
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Fixed delay between rate-limit retries in milliseconds
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertConfig {
    /// Webhook for regular notifications (buys, sells, connections)
    #[serde(default)]
    pub webhook_url: Option<String>,
    /// Webhook for error alerts
    #[serde(default)]
    pub error_webhook_url: Option<String>,
    /// Bounded queue size; alerts beyond it are dropped and logged
    #[serde(default = "default_alert_queue_capacity")]
    pub queue_capacity: usize,
    /// Upper bound on waiting for a fatal alert to be delivered
    #[serde(default = "default_fatal_timeout_secs")]
    pub fatal_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingConfig {
    /// KRW amount spent on each market buy
    #[serde(default = "default_purchase_amount")]
    pub purchase_amount: Decimal,
    /// Maximum number of concurrent trading slots
    #[serde(default = "default_slot_capacity")]
    pub slot_capacity: usize,
    /// Sell once price >= buy price * multiplier
    #[serde(default = "default_take_profit_multiplier")]
    pub take_profit_multiplier: Decimal,
    /// Wall-clock time of the daily buy, in the exchange timezone
    #[serde(default = "default_daily_buy_time")]
    pub daily_buy_time: NaiveTime,
    /// IANA name of the exchange timezone
    #[serde(default = "default_timezone")]
    pub timezone: String,
    /// Seconds between candidate rotations
    #[serde(default = "default_rotation_interval_secs")]
    pub rotation_interval_secs: u64,
    /// Seconds between slot scans for new lifecycles
    #[serde(default = "default_spawn_interval_secs")]
    pub spawn_interval_secs: u64,
    /// Seconds to wait for the wallet to reflect a buy
    #[serde(default = "default_wallet_confirm_timeout_secs")]
    pub wallet_confirm_timeout_secs: u64,
    /// Milliseconds between wallet polls during confirmation
    #[serde(default = "default_poll_interval_ms")]
    pub wallet_poll_interval_ms: u64,
    /// Milliseconds between price checks while monitoring
    #[serde(default = "default_poll_interval_ms")]
    pub monitor_poll_interval_ms: u64,
    /// Seconds to wait for active lifecycles on shutdown
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndicatorConfig {
    /// Concurrent candle fetches per cycle
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
    /// Minute bars requested per market
    #[serde(default = "default_bar_window")]
    pub bar_window: usize,
    /// Cycle duration above which an alert is raised
    #[serde(default = "default_cycle_alert_secs")]
    pub cycle_alert_secs: u64,
    /// Use the accept-all predicate instead of the breakout rule
    #[serde(default)]
    pub accept_all: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    /// Milliseconds between subscription rounds
    #[serde(default = "default_refresh_interval_ms")]
    pub refresh_interval_ms: u64,
    /// Upper bound on a single receive
    #[serde(default = "default_receive_timeout_secs")]
    pub receive_timeout_secs: u64,
    /// Upper bound on a connect or subscription send
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Consecutive send or receive failures before fatal shutdown
    #[serde(default = "default_max_feed_failures")]
    pub max_consecutive_failures: u32,
    /// Milliseconds between wallet refreshes
    #[serde(default = "default_wallet_refresh_ms")]
    pub wallet_refresh_ms: u64,
    /// Consecutive wallet refresh failures before fatal shutdown
    #[serde(default = "default_max_wallet_failures")]
    pub max_wallet_failures: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// SQLite file holding purchase records
    #[serde(default = "default_ledger_path")]
    pub path: String,
    /// Ledger used with `--paper`, kept apart from live records
    #[serde(default = "default_paper_ledger_path")]
    pub paper_path: String,
}

// Default value functions
fn default_max_retries() -> u32 {
    5
}

fn default_retry_delay_ms() -> u64 {
    100
}

fn default_alert_queue_capacity() -> usize {
    64
}

fn default_fatal_timeout_secs() -> u64 {
    5
}

fn default_purchase_amount() -> Decimal {
    Decimal::new(10_000, 0) // 10,000 KRW
}

fn default_slot_capacity() -> usize {
    5
}

fn default_take_profit_multiplier() -> Decimal {
    Decimal::new(103, 2) // 1.03
}

fn default_daily_buy_time() -> NaiveTime {
    NaiveTime::from_hms_opt(9, 0, 0).unwrap_or(NaiveTime::MIN)
}

fn default_timezone() -> String {
    "Asia/Seoul".to_string()
}

fn default_rotation_interval_secs() -> u64 {
    3
}

fn default_spawn_interval_secs() -> u64 {
    1
}

fn default_wallet_confirm_timeout_secs() -> u64 {
    30
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_shutdown_grace_secs() -> u64 {
    10
}

fn default_worker_threads() -> usize {
    2
}

fn default_bar_window() -> usize {
    102
}

fn default_cycle_alert_secs() -> u64 {
    30
}

fn default_refresh_interval_ms() -> u64 {
    1000
}

fn default_receive_timeout_secs() -> u64 {
    5
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_max_feed_failures() -> u32 {
    10
}

fn default_wallet_refresh_ms() -> u64 {
    1000
}

fn default_max_wallet_failures() -> u32 {
    100
}

fn default_ledger_path() -> String {
    "data/purchases.db".to_string()
}

fn default_paper_ledger_path() -> String {
    "data/paper_purchases.db".to_string()
}

impl Config {
    /// Load configuration from environment variables and config files.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::default().separator("__").prefix("UDT"))
            .build()
            .context("Failed to build configuration")?;

        let mut config: Config = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        if config.upbit.access_key.is_empty() {
            config.upbit.access_key = std::env::var("UPBIT_ACCESS_KEY").unwrap_or_default();
        }
        if config.upbit.secret_key.is_empty() {
            config.upbit.secret_key = std::env::var("UPBIT_SECRET_KEY").unwrap_or_default();
        }

        Ok(config)
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.trading.purchase_amount > Decimal::ZERO,
            "purchase_amount must be positive"
        );

        anyhow::ensure!(
            self.trading.slot_capacity >= 1,
            "slot_capacity must be at least 1"
        );

        anyhow::ensure!(
            self.trading.take_profit_multiplier > Decimal::ONE,
            "take_profit_multiplier must be greater than 1"
        );

        anyhow::ensure!(
            self.indicators.worker_threads >= 1,
            "worker_threads must be at least 1"
        );

        // SMA(20)/VWMA(100) at T-1 and T-2 plus the in-progress bar
        anyhow::ensure!(
            self.indicators.bar_window >= crate::strategy::MIN_BAR_WINDOW,
            "bar_window must be at least {}",
            crate::strategy::MIN_BAR_WINDOW
        );

        anyhow::ensure!(
            self.indicators.bar_window <= 200,
            "bar_window must be at most 200 (Upbit candle limit)"
        );

        anyhow::ensure!(
            self.feed.max_consecutive_failures >= 1 && self.feed.max_wallet_failures >= 1,
            "failure limits must be at least 1"
        );

        anyhow::ensure!(
            self.trading.rotation_interval_secs > 0
                && self.trading.spawn_interval_secs > 0
                && self.trading.wallet_poll_interval_ms > 0
                && self.trading.monitor_poll_interval_ms > 0
                && self.feed.refresh_interval_ms > 0
                && self.feed.receive_timeout_secs > 0
                && self.feed.connect_timeout_secs > 0
                && self.feed.wallet_refresh_ms > 0,
            "polling intervals and feed timeouts must be non-zero"
        );

        self.timezone()?;
        Ok(())
    }

    /// Parsed exchange timezone.
    pub fn timezone(&self) -> Result<Tz> {
        self.trading
            .timezone
            .parse::<Tz>()
            .map_err(|e| anyhow!("Invalid timezone '{}': {}", self.trading.timezone, e))
    }
}

impl TradingConfig {
    pub fn rotation_interval(&self) -> Duration {
        Duration::from_secs(self.rotation_interval_secs)
    }

    pub fn spawn_interval(&self) -> Duration {
        Duration::from_secs(self.spawn_interval_secs)
    }

    pub fn wallet_confirm_timeout(&self) -> Duration {
        Duration::from_secs(self.wallet_confirm_timeout_secs)
    }

    pub fn wallet_poll_interval(&self) -> Duration {
        Duration::from_millis(self.wallet_poll_interval_ms)
    }

    pub fn monitor_poll_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_poll_interval_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

impl FeedConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }

    pub fn receive_timeout(&self) -> Duration {
        Duration::from_secs(self.receive_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn wallet_refresh(&self) -> Duration {
        Duration::from_millis(self.wallet_refresh_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            upbit: UpbitConfig::default(),
            alerts: AlertConfig::default(),
            trading: TradingConfig::default(),
            indicators: IndicatorConfig::default(),
            feed: FeedConfig::default(),
            ledger: LedgerConfig::default(),
        }
    }
}

impl Default for UpbitConfig {
    fn default() -> Self {
        Self {
            access_key: String::new(),
            secret_key: String::new(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            error_webhook_url: None,
            queue_capacity: default_alert_queue_capacity(),
            fatal_timeout_secs: default_fatal_timeout_secs(),
        }
    }
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            purchase_amount: default_purchase_amount(),
            slot_capacity: default_slot_capacity(),
            take_profit_multiplier: default_take_profit_multiplier(),
            daily_buy_time: default_daily_buy_time(),
            timezone: default_timezone(),
            rotation_interval_secs: default_rotation_interval_secs(),
            spawn_interval_secs: default_spawn_interval_secs(),
            wallet_confirm_timeout_secs: default_wallet_confirm_timeout_secs(),
            wallet_poll_interval_ms: default_poll_interval_ms(),
            monitor_poll_interval_ms: default_poll_interval_ms(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

impl Default for IndicatorConfig {
    fn default() -> Self {
        Self {
            worker_threads: default_worker_threads(),
            bar_window: default_bar_window(),
            cycle_alert_secs: default_cycle_alert_secs(),
            accept_all: false,
        }
    }
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            refresh_interval_ms: default_refresh_interval_ms(),
            receive_timeout_secs: default_receive_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            max_consecutive_failures: default_max_feed_failures(),
            wallet_refresh_ms: default_wallet_refresh_ms(),
            max_wallet_failures: default_max_wallet_failures(),
        }
    }
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            path: default_ledger_path(),
            paper_path: default_paper_ledger_path(),
        }
    }
}
