//! Type definitions for Upbit API requests and responses.

use super::error::ExchangeError;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Quote currency of every traded market.
pub const QUOTE_CURRENCY: &str = "KRW";

/// Market listing entry from `/v1/market/all`.
#[derive(Debug, Clone, Deserialize)]
pub struct MarketInfo {
    pub market: String,
    #[serde(default)]
    pub korean_name: Option<String>,
    #[serde(default)]
    pub english_name: Option<String>,
}

impl MarketInfo {
    /// True for `KRW-*` markets.
    pub fn is_krw(&self) -> bool {
        self.market
            .strip_prefix(QUOTE_CURRENCY)
            .is_some_and(|rest| rest.starts_with('-'))
    }
}

/// Minute candle as returned by `/v1/candles/minutes/1` (newest first).
#[derive(Debug, Clone, Deserialize)]
pub struct Candle {
    pub market: String,
    pub candle_date_time_kst: String,
    pub trade_price: Decimal,
    pub candle_acc_trade_volume: Decimal,
}

/// Normalized bar: close and volume, oldest first in a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bar {
    pub close: Decimal,
    pub volume: Decimal,
}

impl Bar {
    pub fn new(close: Decimal, volume: Decimal) -> Self {
        Self { close, volume }
    }
}

impl From<&Candle> for Bar {
    fn from(candle: &Candle) -> Self {
        Self {
            close: candle.trade_price,
            volume: candle.candle_acc_trade_volume,
        }
    }
}

/// Account entry from `/v1/accounts`.
#[derive(Debug, Clone, Deserialize)]
pub struct AccountBalance {
    pub currency: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub balance: Decimal,
    #[serde(default, with = "rust_decimal::serde::str_option")]
    pub locked: Option<Decimal>,
    #[serde(with = "rust_decimal::serde::str")]
    pub avg_buy_price: Decimal,
    #[serde(default)]
    pub unit_currency: Option<String>,
}

impl AccountBalance {
    /// Market code for this holding, `None` for the quote currency itself.
    pub fn market(&self) -> Option<String> {
        if self.currency == QUOTE_CURRENCY {
            None
        } else {
            Some(format!("{}-{}", QUOTE_CURRENCY, self.currency))
        }
    }
}

/// Held position as seen in the exchange wallet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalletPosition {
    pub avg_buy_price: Decimal,
    pub quantity: Decimal,
}

/// Order side (bid = buy, ask = sell).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Bid,
    Ask,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Bid => "bid",
            OrderSide::Ask => "ask",
        }
    }
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderSide {
    type Err = ExchangeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bid" => Ok(OrderSide::Bid),
            "ask" => Ok(OrderSide::Ask),
            other => Err(ExchangeError::InvalidOrderSide(other.to_string())),
        }
    }
}

/// Market order: bids are denominated in KRW, asks in base volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarketOrder {
    pub market: String,
    pub side: OrderSide,
    pub amount: Decimal,
}

impl MarketOrder {
    /// Buy `krw` worth of `market`.
    pub fn buy(market: &str, krw: Decimal) -> Self {
        Self {
            market: market.to_string(),
            side: OrderSide::Bid,
            amount: krw,
        }
    }

    /// Sell `volume` units of `market`.
    pub fn sell(market: &str, volume: Decimal) -> Self {
        Self {
            market: market.to_string(),
            side: OrderSide::Ask,
            amount: volume,
        }
    }

    /// Request parameters in the order Upbit hashes them.
    pub fn params(&self) -> Vec<(&'static str, String)> {
        let mut params = vec![
            ("market", self.market.clone()),
            ("side", self.side.as_str().to_string()),
        ];
        match self.side {
            OrderSide::Bid => {
                params.push(("price", self.amount.normalize().to_string()));
                params.push(("ord_type", "price".to_string()));
            }
            OrderSide::Ask => {
                params.push(("volume", self.amount.normalize().to_string()));
                params.push(("ord_type", "market".to_string()));
            }
        }
        params
    }
}

/// Accepted order.
#[derive(Debug, Clone, Deserialize)]
pub struct OrderResponse {
    pub uuid: String,
    pub side: String,
    pub ord_type: String,
    pub market: String,
    #[serde(default)]
    pub state: Option<String>,
}

impl OrderResponse {
    /// Parsed side; unknown values are rejected.
    pub fn order_side(&self) -> Result<OrderSide, ExchangeError> {
        self.side.parse()
    }
}

/// Error body: `{"error": {"name": ..., "message": ...}}`.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiErrorBody {
    pub error: ApiErrorDetail,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiErrorDetail {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl From<ApiErrorBody> for ExchangeError {
    fn from(body: ApiErrorBody) -> Self {
        ExchangeError::Api {
            name: body.error.name.unwrap_or_else(|| "unknown".to_string()),
            message: body.error.message.unwrap_or_default(),
        }
    }
}

/// Latest trade price for one market.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriceTick {
    pub symbol: String,
    pub price: Decimal,
}

/// Ticker frame from the public WebSocket (DEFAULT format).
#[derive(Debug, Clone, Deserialize)]
pub struct TickerMessage {
    pub code: String,
    pub trade_price: Decimal,
}

impl From<TickerMessage> for PriceTick {
    fn from(msg: TickerMessage) -> Self {
        Self {
            symbol: msg.code,
            price: msg.trade_price,
        }
    }
}
