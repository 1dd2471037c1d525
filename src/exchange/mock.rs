//! In-memory exchange for paper trading and tests.

use super::error::ExchangeError;
use super::traits::{MarketDataProvider, OrderPlacer, PriceStream, WalletProvider};
use super::types::*;
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Simulated exchange state.
#[derive(Debug, Default)]
pub struct MockExchangeState {
    pub markets: Vec<String>,
    pub bars: HashMap<String, Vec<Bar>>,
    /// Fill prices for market orders
    pub prices: HashMap<String, Decimal>,
    pub wallet: HashMap<String, WalletPosition>,
    /// Every order accepted or rejected, in arrival order
    pub orders: Vec<MarketOrder>,
    /// Sides that are rejected with an API error
    pub rejected_sides: HashSet<OrderSide>,
}

/// Mock client that simulates Upbit REST responses.
///
/// Orders always fill at the configured price. When `fill_wallet` is set a
/// filled bid also shows up in the wallet, the way a live account would.
pub struct MockExchange {
    state: Arc<RwLock<MockExchangeState>>,
    order_id_counter: AtomicU64,
    fill_wallet: bool,
}

impl MockExchange {
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(MockExchangeState::default())),
            order_id_counter: AtomicU64::new(1),
            fill_wallet: true,
        }
    }

    /// Paper trading: orders are accepted but the wallet never confirms.
    pub fn paper() -> Self {
        Self {
            fill_wallet: false,
            ..Self::new()
        }
    }

    pub async fn set_bars(&self, symbol: &str, bars: Vec<Bar>) {
        let mut state = self.state.write().await;
        if !state.markets.iter().any(|m| m == symbol) {
            state.markets.push(symbol.to_string());
        }
        state.bars.insert(symbol.to_string(), bars);
    }

    pub async fn set_price(&self, symbol: &str, price: Decimal) {
        self.state
            .write()
            .await
            .prices
            .insert(symbol.to_string(), price);
    }

    pub async fn set_position(&self, symbol: &str, position: WalletPosition) {
        self.state
            .write()
            .await
            .wallet
            .insert(symbol.to_string(), position);
    }

    pub async fn reject_side(&self, side: OrderSide) {
        self.state.write().await.rejected_sides.insert(side);
    }

    pub async fn orders(&self) -> Vec<MarketOrder> {
        self.state.read().await.orders.clone()
    }
}

impl Default for MockExchange {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MarketDataProvider for MockExchange {
    async fn list_markets(&self) -> Result<Vec<String>, ExchangeError> {
        Ok(self.state.read().await.markets.clone())
    }

    async fn minute_bars(&self, symbol: &str, count: usize) -> Result<Vec<Bar>, ExchangeError> {
        let state = self.state.read().await;
        let bars = state.bars.get(symbol).cloned().unwrap_or_default();
        if bars.len() < count {
            return Err(ExchangeError::InsufficientHistory {
                requested: count,
                received: bars.len(),
            });
        }
        Ok(bars[bars.len() - count..].to_vec())
    }
}

#[async_trait]
impl OrderPlacer for MockExchange {
    async fn place_market_order(
        &self,
        order: &MarketOrder,
    ) -> Result<OrderResponse, ExchangeError> {
        let mut state = self.state.write().await;
        state.orders.push(order.clone());

        if state.rejected_sides.contains(&order.side) {
            return Err(ExchangeError::Api {
                name: "mock_rejected".to_string(),
                message: format!("{} orders are rejected", order.side),
            });
        }

        let order_id = self.order_id_counter.fetch_add(1, Ordering::SeqCst);
        let price = state.prices.get(&order.market).copied();

        if self.fill_wallet {
            if let Some(price) = price.filter(|p| *p > Decimal::ZERO) {
                match order.side {
                    OrderSide::Bid => {
                        let qty = order.amount / price;
                        let entry = state.wallet.entry(order.market.clone()).or_insert(
                            WalletPosition {
                                avg_buy_price: price,
                                quantity: Decimal::ZERO,
                            },
                        );
                        let cost = entry.avg_buy_price * entry.quantity + order.amount;
                        entry.quantity += qty;
                        entry.avg_buy_price = cost / entry.quantity;
                    }
                    OrderSide::Ask => {
                        let remove = match state.wallet.get_mut(&order.market) {
                            Some(position) => {
                                position.quantity -= order.amount.min(position.quantity);
                                position.quantity.is_zero()
                            }
                            None => false,
                        };
                        if remove {
                            state.wallet.remove(&order.market);
                        }
                    }
                }
            }
        }

        info!(
            market = %order.market,
            side = %order.side,
            amount = %order.amount,
            ?price,
            "[MOCK] Market order filled"
        );

        Ok(OrderResponse {
            uuid: format!("mock-{}", order_id),
            side: order.side.as_str().to_string(),
            ord_type: match order.side {
                OrderSide::Bid => "price".to_string(),
                OrderSide::Ask => "market".to_string(),
            },
            market: order.market.clone(),
            state: Some("done".to_string()),
        })
    }
}

#[async_trait]
impl WalletProvider for MockExchange {
    async fn positions(&self) -> Result<HashMap<String, WalletPosition>, ExchangeError> {
        Ok(self.state.read().await.wallet.clone())
    }
}

/// Observable state shared between a `MockPriceStream` and its test.
#[derive(Debug, Default)]
pub struct MockFeedState {
    pub prices: Mutex<HashMap<String, Decimal>>,
    /// Symbols whose receive fails
    pub failing_symbols: Mutex<HashSet<String>>,
    pub connects: AtomicUsize,
    /// Connection attempts never complete while set
    pub hang_connects: AtomicBool,
    pub subscriptions: Mutex<Vec<Vec<String>>>,
}

/// Scripted live feed: each subscription queues one reply per symbol.
pub struct MockPriceStream {
    shared: Arc<MockFeedState>,
    fail_sends: bool,
    pending: VecDeque<String>,
}

impl MockPriceStream {
    pub fn new(shared: Arc<MockFeedState>) -> Self {
        Self {
            shared,
            fail_sends: false,
            pending: VecDeque::new(),
        }
    }

    /// A stream whose every subscription send fails.
    pub fn failing_sends(shared: Arc<MockFeedState>) -> Self {
        Self {
            fail_sends: true,
            ..Self::new(shared)
        }
    }
}

#[async_trait]
impl PriceStream for MockPriceStream {
    async fn connect(&mut self) -> Result<(), ExchangeError> {
        self.shared.connects.fetch_add(1, Ordering::SeqCst);
        if self.shared.hang_connects.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.pending.clear();
        Ok(())
    }

    async fn subscribe(&mut self, symbols: &[String]) -> Result<(), ExchangeError> {
        if self.fail_sends {
            return Err(ExchangeError::WebSocket("mock send failure".to_string()));
        }
        if let Ok(mut subs) = self.shared.subscriptions.lock() {
            subs.push(symbols.to_vec());
        }
        self.pending = symbols.iter().cloned().collect();
        debug!(count = symbols.len(), "[MOCK] Subscribed");
        Ok(())
    }

    async fn next_tick(&mut self) -> Result<PriceTick, ExchangeError> {
        let symbol = self
            .pending
            .pop_front()
            .ok_or_else(|| ExchangeError::WebSocket("no pending reply".to_string()))?;

        let failing = self
            .shared
            .failing_symbols
            .lock()
            .map(|s| s.contains(&symbol))
            .unwrap_or(false);
        if failing {
            return Err(ExchangeError::WebSocket(format!("mock receive failure for {}", symbol)));
        }

        let price = self
            .shared
            .prices
            .lock()
            .ok()
            .and_then(|p| p.get(&symbol).copied())
            .ok_or_else(|| ExchangeError::WebSocket(format!("no price for {}", symbol)))?;

        Ok(PriceTick { symbol, price })
    }
}
