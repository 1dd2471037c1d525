//! Upbit exchange integration.
//!
//! Provides REST and WebSocket connectivity for:
//! - Market data (market listing, minute candles)
//! - Account operations (balances, market orders)
//! - Live ticker snapshots for the active trading slots
//!
//! The orchestration layer only sees the traits in `traits`, so the
//! in-memory `MockExchange` can stand in for paper trading and tests.

mod client;
mod error;
pub mod mock;
pub mod traits;
mod types;
mod websocket;

pub use client::UpbitClient;
pub use error::ExchangeError;
pub use mock::{MockExchange, MockFeedState, MockPriceStream};
pub use traits::{MarketDataProvider, OrderPlacer, PriceStream, WalletProvider};
pub use types::*;
pub use websocket::UpbitWebSocket;
