//! Collaborator traits the orchestration layer is written against.
//!
//! `UpbitClient` / `UpbitWebSocket` implement these for live trading and
//! `MockExchange` implements them for paper trading and tests.

use super::error::ExchangeError;
use super::types::{Bar, MarketOrder, OrderResponse, PriceTick, WalletPosition};
use async_trait::async_trait;
use std::collections::HashMap;

/// Historical market data.
#[async_trait]
pub trait MarketDataProvider: Send + Sync {
    /// All tradable KRW market codes.
    async fn list_markets(&self) -> Result<Vec<String>, ExchangeError>;

    /// The `count` most recent one-minute bars, oldest first.
    ///
    /// Returns `ExchangeError::InsufficientHistory` when fewer than `count`
    /// bars are available.
    async fn minute_bars(&self, symbol: &str, count: usize) -> Result<Vec<Bar>, ExchangeError>;
}

/// Market order placement.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait OrderPlacer: Send + Sync {
    /// Place a market order. Exchange-reported rejections come back as
    /// `ExchangeError::Api`.
    async fn place_market_order(&self, order: &MarketOrder)
        -> Result<OrderResponse, ExchangeError>;
}

/// Account positions.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait WalletProvider: Send + Sync {
    /// Held positions keyed by market code (quote currency excluded).
    async fn positions(&self) -> Result<HashMap<String, WalletPosition>, ExchangeError>;
}

/// Live trade price subscription.
#[async_trait]
pub trait PriceStream: Send {
    /// (Re)establish the connection, dropping any previous one.
    async fn connect(&mut self) -> Result<(), ExchangeError>;

    /// Replace the subscription with exactly `symbols`.
    async fn subscribe(&mut self, symbols: &[String]) -> Result<(), ExchangeError>;

    /// Next price update.
    async fn next_tick(&mut self) -> Result<PriceTick, ExchangeError>;
}
