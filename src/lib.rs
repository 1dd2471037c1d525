//! # Upbit Daily Trader
//!
//! Unattended once-a-day buy / take-profit sell automation for the KRW
//! markets of Upbit.
//!
//! ## Architecture
//!
//! - `config`: Configuration loading and validation
//! - `exchange`: Upbit API client (REST + WebSocket) and the in-memory mock
//! - `state`: Shared maps and their locking discipline
//! - `persistence`: SQLite purchase ledger
//! - `market`: Live slot prices and the wallet view
//! - `strategy`: Indicators, candidate selection, rotation, trade lifecycle
//! - `alerts`: Webhook notifications through a bounded queue
//! - `utils`: Decimal helpers, the exchange clock, and the shutdown signal

pub mod alerts;
pub mod config;
pub mod exchange;
pub mod market;
pub mod persistence;
pub mod state;
pub mod strategy;
pub mod utils;

pub use config::Config;
