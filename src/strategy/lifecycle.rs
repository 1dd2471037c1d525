//! Per-asset trade lifecycle.
//!
//! ```text
//! Selected -> WaitBuyWindow -> Buying -> ConfirmWallet -> Monitoring -> Selling -> Done
//!     |                          |             |
//!     +-> Done (bought today)    +-> Failed    +-> Failed (position unknown)
//! ```
//!
//! Each slot symbol gets one lifecycle task, claimed through the active set.
//! Cleanup (releasing the slot and the claim) runs however the task ends,
//! including a panic inside the lifecycle.

use crate::alerts::AlertDispatcher;
use crate::config::TradingConfig;
use crate::exchange::{MarketOrder, OrderPlacer};
use crate::persistence::{PurchaseLedger, PurchaseRecord};
use crate::state::SharedState;
use crate::utils::clock::pending_buy_time;
use crate::utils::decimal::{percent_change, round_down_dp, safe_div, VOLUME_DECIMALS};
use crate::utils::{Clock, Shutdown};
use chrono::Utc;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TradeState {
    Selected,
    WaitBuyWindow,
    Buying,
    ConfirmWallet,
    Monitoring,
    Selling,
    Done,
    Failed,
}

impl TradeState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TradeState::Done | TradeState::Failed)
    }
}

/// How a lifecycle ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TradeOutcome {
    /// Already bought today; nothing was ordered
    SkippedBoughtToday,
    BuyFailed,
    /// Bought, but neither the wallet nor the price feed gave a position
    PositionUnknown,
    Sold { buy_price: Decimal, sell_price: Decimal },
    /// Sell rejected; the position needs a manual sell
    SellFailed,
    /// Stopped by shutdown
    Interrupted,
    /// The lifecycle task panicked
    Aborted,
}

/// Everything a lifecycle needs, shared by all of them.
#[derive(Clone)]
pub struct TradeContext {
    pub state: Arc<SharedState>,
    pub ledger: Arc<PurchaseLedger>,
    pub orders: Arc<dyn OrderPlacer>,
    pub alerts: AlertDispatcher,
    pub clock: Arc<dyn Clock>,
    pub config: TradingConfig,
    pub shutdown: Shutdown,
}

#[derive(Debug, Clone, Copy)]
struct Position {
    buy_price: Decimal,
    volume: Decimal,
}

pub struct TradeLifecycle {
    ctx: TradeContext,
    symbol: String,
    position: Option<Position>,
    /// Wallet quantity seen just before the bid
    held_before_buy: Decimal,
    outcome: Option<TradeOutcome>,
}

impl TradeLifecycle {
    pub fn new(ctx: TradeContext, symbol: impl Into<String>) -> Self {
        Self {
            ctx,
            symbol: symbol.into(),
            position: None,
            held_before_buy: Decimal::ZERO,
            outcome: None,
        }
    }

    /// Drive the state machine to a terminal state. Does not clean up;
    /// see [`run_guarded`].
    pub async fn run(mut self) -> TradeOutcome {
        info!(symbol = %self.symbol, "Trade lifecycle started");
        let mut state = TradeState::Selected;

        while !state.is_terminal() {
            let next = match state {
                TradeState::Selected => self.select(),
                TradeState::WaitBuyWindow => self.wait_buy_window().await,
                TradeState::Buying => self.buy().await,
                TradeState::ConfirmWallet => self.confirm_wallet().await,
                TradeState::Monitoring => self.monitor().await,
                TradeState::Selling => self.sell().await,
                TradeState::Done | TradeState::Failed => state,
            };
            debug!(symbol = %self.symbol, from = ?state, to = ?next, "Lifecycle transition");
            state = next;
        }

        let outcome = self.outcome.unwrap_or(TradeOutcome::Interrupted);
        info!(symbol = %self.symbol, ?state, ?outcome, "Trade lifecycle finished");
        outcome
    }

    fn finish(&mut self, outcome: TradeOutcome, state: TradeState) -> TradeState {
        self.outcome = Some(outcome);
        state
    }

    fn select(&mut self) -> TradeState {
        let today = self.ctx.clock.today();
        if self.ctx.ledger.bought_on(&self.symbol, today) {
            info!(symbol = %self.symbol, %today, "Already bought today, skipping");
            return self.finish(TradeOutcome::SkippedBoughtToday, TradeState::Done);
        }
        TradeState::WaitBuyWindow
    }

    async fn wait_buy_window(&mut self) -> TradeState {
        let at = self.ctx.config.daily_buy_time;
        let Some(target) = pending_buy_time(self.ctx.clock.now(), at) else {
            return TradeState::Buying;
        };
        info!(symbol = %self.symbol, %target, "Waiting for buy window");

        loop {
            let remaining = target - self.ctx.clock.now();
            let Ok(remaining) = remaining.to_std() else {
                return TradeState::Buying;
            };
            if remaining.is_zero() {
                return TradeState::Buying;
            }

            tokio::select! {
                _ = self.ctx.shutdown.wait() => {
                    return self.finish(TradeOutcome::Interrupted, TradeState::Done);
                }
                _ = tokio::time::sleep(remaining.min(Duration::from_secs(1))) => {}
            }
        }
    }

    async fn buy(&mut self) -> TradeState {
        let amount = self.ctx.config.purchase_amount;
        let order = MarketOrder::buy(&self.symbol, amount);
        self.held_before_buy = self
            .ctx
            .state
            .wallet_position(&self.symbol)
            .await
            .map(|pos| pos.quantity)
            .unwrap_or(Decimal::ZERO);

        match self.ctx.orders.place_market_order(&order).await {
            Ok(response) => {
                info!(symbol = %self.symbol, %amount, uuid = %response.uuid, "Buy order placed");
                self.ctx
                    .alerts
                    .notify(format!("{} bought for {} KRW (daily buy)", self.symbol, amount));
                TradeState::ConfirmWallet
            }
            Err(e) => {
                error!(symbol = %self.symbol, error = %e, "Buy order failed");
                self.ctx
                    .alerts
                    .error(format!("{} buy failed: {}", self.symbol, e));
                self.finish(TradeOutcome::BuyFailed, TradeState::Failed)
            }
        }
    }

    async fn confirm_wallet(&mut self) -> TradeState {
        let deadline = Instant::now() + self.ctx.config.wallet_confirm_timeout();
        let poll = self.ctx.config.wallet_poll_interval();

        let confirmed = loop {
            if let Some(pos) = self.ctx.state.wallet_position(&self.symbol).await {
                // Only a holding that grew past its pre-bid size confirms the buy
                if pos.quantity > self.held_before_buy {
                    break Some(Position {
                        buy_price: pos.avg_buy_price,
                        volume: pos.quantity - self.held_before_buy,
                    });
                }
            }
            if Instant::now() >= deadline {
                break None;
            }
            tokio::select! {
                _ = self.ctx.shutdown.wait() => break None,
                _ = tokio::time::sleep_until((Instant::now() + poll).min(deadline)) => {}
            }
        };

        let position = match confirmed {
            Some(position) => position,
            None => self.approximate_position().await,
        };

        let record = PurchaseRecord {
            symbol: self.symbol.clone(),
            date: self.ctx.clock.today(),
            buy_price: position.buy_price,
            volume: position.volume,
        };
        if let Err(e) = self.ctx.ledger.record_purchase(record) {
            error!(symbol = %self.symbol, error = %e, "Failed to persist purchase");
            self.ctx
                .alerts
                .error(format!("{} purchase not persisted: {:#}", self.symbol, e));
        }

        if position.volume.is_zero() {
            self.ctx.alerts.error(format!(
                "{} bought but position is unknown, check the account manually",
                self.symbol
            ));
            return self.finish(TradeOutcome::PositionUnknown, TradeState::Failed);
        }

        self.position = Some(position);
        TradeState::Monitoring
    }

    /// Fallback when the wallet never shows the buy: the last slot price and
    /// the volume that amount would have bought.
    async fn approximate_position(&self) -> Position {
        let amount = self.ctx.config.purchase_amount;
        let buy_price = self
            .ctx
            .state
            .slot_price(&self.symbol)
            .await
            .filter(|p| *p > Decimal::ZERO)
            .unwrap_or(Decimal::ZERO);
        let volume = round_down_dp(safe_div(amount, buy_price), VOLUME_DECIMALS);

        warn!(
            symbol = %self.symbol,
            %buy_price,
            %volume,
            "Wallet did not confirm buy, using approximate position"
        );
        Position { buy_price, volume }
    }

    async fn monitor(&mut self) -> TradeState {
        let Some(position) = self.position else {
            return self.finish(TradeOutcome::PositionUnknown, TradeState::Failed);
        };
        let take_profit = position.buy_price * self.ctx.config.take_profit_multiplier;
        info!(
            symbol = %self.symbol,
            buy_price = %position.buy_price,
            %take_profit,
            "Monitoring for take profit"
        );

        let mut ticker = tokio::time::interval(self.ctx.config.monitor_poll_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.ctx.shutdown.wait() => {
                    info!(symbol = %self.symbol, "Monitoring interrupted, position stays open");
                    return self.finish(TradeOutcome::Interrupted, TradeState::Done);
                }
                _ = ticker.tick() => {}
            }

            if let Some(price) = self.ctx.state.slot_price(&self.symbol).await {
                if price >= take_profit {
                    debug!(symbol = %self.symbol, %price, "Take profit reached");
                    return TradeState::Selling;
                }
            }
        }
    }

    async fn sell(&mut self) -> TradeState {
        let Some(position) = self.position else {
            return self.finish(TradeOutcome::PositionUnknown, TradeState::Failed);
        };
        let order = MarketOrder::sell(&self.symbol, position.volume);

        if let Err(e) = self.ctx.orders.place_market_order(&order).await {
            error!(symbol = %self.symbol, error = %e, "Sell order failed");
            self.ctx.alerts.error(format!(
                "{} sell failed: {}. Sell {} manually.",
                self.symbol, e, position.volume
            ));
            return self.finish(TradeOutcome::SellFailed, TradeState::Done);
        }

        let sell_price = self
            .ctx
            .state
            .slot_price(&self.symbol)
            .await
            .unwrap_or(position.buy_price);

        if let Err(e) = self
            .ctx
            .ledger
            .complete_sale(&self.symbol, sell_price, Utc::now())
        {
            error!(symbol = %self.symbol, error = %e, "Failed to archive sale");
            self.ctx
                .alerts
                .error(format!("{} sale not persisted: {:#}", self.symbol, e));
        }

        let change = percent_change(position.buy_price, sell_price).round_dp(2);
        info!(symbol = %self.symbol, %sell_price, change_pct = %change, "Sold");
        self.ctx.alerts.notify(format!(
            "{} sold at {} ({}%, take profit)",
            self.symbol, sell_price, change
        ));

        self.finish(
            TradeOutcome::Sold {
                buy_price: position.buy_price,
                sell_price,
            },
            TradeState::Done,
        )
    }
}

/// Run one lifecycle and release its slot and claim afterwards, even if the
/// lifecycle panics.
pub async fn run_guarded(ctx: TradeContext, symbol: String) -> TradeOutcome {
    let state = ctx.state.clone();
    let alerts = ctx.alerts.clone();
    let lifecycle = TradeLifecycle::new(ctx, symbol.clone());

    let outcome = match tokio::spawn(lifecycle.run()).await {
        Ok(outcome) => outcome,
        Err(e) => {
            error!(%symbol, error = %e, "Trade lifecycle aborted");
            alerts.error(format!("{} trade aborted: {}", symbol, e));
            TradeOutcome::Aborted
        }
    };

    state.release(&symbol).await;
    outcome
}

/// Starts a lifecycle for every slot symbol not already owned by one.
pub struct TradeSpawner {
    ctx: TradeContext,
}

impl TradeSpawner {
    pub fn new(ctx: TradeContext) -> Self {
        Self { ctx }
    }

    /// Claim and spawn each unowned slot symbol.
    pub async fn spawn_ready(&self) -> Vec<JoinHandle<TradeOutcome>> {
        let mut handles = Vec::new();
        for symbol in self.ctx.state.slot_symbols().await {
            if !self.ctx.state.try_claim_slot(&symbol).await {
                continue;
            }
            debug!(%symbol, "Claimed slot, spawning lifecycle");
            handles.push(tokio::spawn(run_guarded(self.ctx.clone(), symbol)));
        }
        handles
    }

    pub async fn run(self) {
        let shutdown = self.ctx.shutdown.clone();
        let mut ticker = tokio::time::interval(self.ctx.config.spawn_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        debug!("Trade spawner started");

        loop {
            tokio::select! {
                _ = shutdown.wait() => break,
                _ = ticker.tick() => {
                    self.spawn_ready().await;
                }
            }
        }

        info!("Trade spawner stopped");
    }
}
