//! Once-per-minute indicator refresh.
//!
//! The clock is polled every second and a cycle fires when the minute
//! changes. A cycle:
//! - lists the KRW markets
//! - fetches the bar window for each, `worker_threads` at a time
//! - computes snapshots on the blocking pool
//! - replaces or removes each asset's snapshot
//! - hands the snapshots to the candidate selector

use super::indicators::{IndicatorCalculator, IndicatorSnapshot};
use super::selector::CandidateSelector;
use crate::alerts::AlertDispatcher;
use crate::config::IndicatorConfig;
use crate::exchange::{Bar, ExchangeError, MarketDataProvider};
use crate::state::SharedState;
use crate::utils::{Clock, Shutdown};
use anyhow::{Context, Result};
use chrono::DateTime;
use chrono_tz::Tz;
use futures_util::stream::{self, StreamExt};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Detects minute-boundary crossings by comparing successive observations.
#[derive(Debug, Default)]
pub struct MinuteEdge {
    last: Option<i64>,
}

impl MinuteEdge {
    /// Returns `true` when `now` falls in a different minute than the
    /// previous observation. The first observation only seeds the edge.
    pub fn observe(&mut self, now: DateTime<Tz>) -> bool {
        let minute = now.timestamp().div_euclid(60);
        match self.last.replace(minute) {
            Some(prev) => prev != minute,
            None => false,
        }
    }
}

/// Outcome of one indicator cycle.
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    pub markets: usize,
    pub computed: usize,
    pub skipped: usize,
    pub targets: usize,
    pub elapsed: Duration,
}

pub struct IndicatorScheduler {
    market_data: Arc<dyn MarketDataProvider>,
    calculator: Arc<dyn IndicatorCalculator>,
    selector: CandidateSelector,
    state: Arc<SharedState>,
    alerts: AlertDispatcher,
    clock: Arc<dyn Clock>,
    config: IndicatorConfig,
}

impl IndicatorScheduler {
    pub fn new(
        market_data: Arc<dyn MarketDataProvider>,
        calculator: Arc<dyn IndicatorCalculator>,
        selector: CandidateSelector,
        state: Arc<SharedState>,
        alerts: AlertDispatcher,
        clock: Arc<dyn Clock>,
        config: IndicatorConfig,
    ) -> Self {
        Self {
            market_data,
            calculator,
            selector,
            state,
            alerts,
            clock,
            config,
        }
    }

    /// Poll the clock every second and run a cycle on each minute change.
    pub async fn run(&self, shutdown: Shutdown) {
        let mut edge = MinuteEdge::default();
        edge.observe(self.clock.now());
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!(
            window = self.config.bar_window,
            workers = self.config.worker_threads,
            "Indicator scheduler started"
        );

        loop {
            tokio::select! {
                _ = shutdown.wait() => break,
                _ = ticker.tick() => {}
            }

            if !edge.observe(self.clock.now()) {
                continue;
            }

            tokio::select! {
                _ = shutdown.wait() => break,
                result = self.run_cycle() => {
                    if let Err(e) = result {
                        error!(error = %e, "Indicator cycle failed");
                        self.alerts.error(format!("Indicator cycle failed: {:#}", e));
                    }
                }
            }
        }

        info!("Indicator scheduler stopped");
    }

    /// One full refresh: fetch, compute, store, classify.
    pub async fn run_cycle(&self) -> Result<CycleReport> {
        let started = Instant::now();
        let markets = self
            .market_data
            .list_markets()
            .await
            .context("Failed to list markets")?;

        self.prune_delisted(&markets).await;

        let window = self.config.bar_window;
        let fetched: Vec<(String, Result<Vec<Bar>, ExchangeError>)> = stream::iter(markets.iter().cloned())
            .map(|symbol| async move {
                let bars = self.market_data.minute_bars(&symbol, window).await;
                (symbol, bars)
            })
            .buffer_unordered(self.config.worker_threads.max(1))
            .collect()
            .await;

        let mut windows = Vec::with_capacity(fetched.len());
        let mut skipped = 0;
        for (symbol, result) in fetched {
            match result {
                Ok(bars) => windows.push((symbol, bars)),
                Err(ExchangeError::InsufficientHistory { requested, received }) => {
                    debug!(%symbol, requested, received, "Short bar window, skipping");
                    self.state.remove_snapshot(&symbol).await;
                    skipped += 1;
                }
                Err(e) => {
                    warn!(%symbol, error = %e, "Failed to fetch bars, skipping");
                    self.state.remove_snapshot(&symbol).await;
                    skipped += 1;
                }
            }
        }

        let calculator = self.calculator.clone();
        let computed: Vec<(String, Option<IndicatorSnapshot>)> = tokio::task::spawn_blocking(move || {
            windows
                .into_iter()
                .map(|(symbol, bars)| {
                    let snapshot = calculator.compute(&bars);
                    (symbol, snapshot)
                })
                .collect()
        })
        .await
        .context("Indicator computation task failed")?;

        let mut stored = 0;
        for (symbol, snapshot) in computed {
            match snapshot {
                Some(snapshot) => {
                    self.state.set_snapshot(&symbol, snapshot).await;
                    stored += 1;
                }
                None => {
                    self.state.remove_snapshot(&symbol).await;
                    skipped += 1;
                }
            }
        }

        let targets = self.selector.refresh_targets().await;
        let elapsed = started.elapsed();

        let report = CycleReport {
            markets: markets.len(),
            computed: stored,
            skipped,
            targets,
            elapsed,
        };
        info!(
            markets = report.markets,
            computed = report.computed,
            skipped = report.skipped,
            targets = report.targets,
            elapsed_ms = elapsed.as_millis() as u64,
            "Indicator cycle complete"
        );

        let limit = Duration::from_secs(self.config.cycle_alert_secs);
        if elapsed > limit {
            self.alerts.error(format!(
                "Indicator cycle took {:.1}s (limit {}s)",
                elapsed.as_secs_f64(),
                self.config.cycle_alert_secs
            ));
        }

        Ok(report)
    }

    async fn prune_delisted(&self, markets: &[String]) {
        let listed: HashSet<&str> = markets.iter().map(String::as_str).collect();
        for symbol in self.state.snapshots().await.into_keys() {
            if !listed.contains(symbol.as_str()) {
                debug!(%symbol, "Market no longer listed, dropping snapshot");
                self.state.remove_snapshot(&symbol).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::testing::{recording_dispatcher, RecordingSink};
    use crate::alerts::AlertLevel;
    use crate::exchange::MockExchange;
    use crate::strategy::indicators::{MovingAverageCalculator, MIN_BAR_WINDOW};
    use crate::strategy::selector::AcceptAll;
    use crate::utils::clock::testing::FixedClock;
    use rust_decimal_macros::dec;

    fn bars(n: usize) -> Vec<Bar> {
        (0..n).map(|_| Bar::new(dec!(100), dec!(1))).collect()
    }

    async fn scheduler(
        market_data: Arc<dyn MarketDataProvider>,
    ) -> (IndicatorScheduler, Arc<SharedState>, Arc<RecordingSink>) {
        let state = Arc::new(SharedState::new(5));
        let (alerts, sink) = recording_dispatcher();
        let selector = CandidateSelector::new(Box::new(AcceptAll), state.clone());
        let scheduler = IndicatorScheduler::new(
            market_data,
            Arc::new(MovingAverageCalculator),
            selector,
            state.clone(),
            alerts,
            Arc::new(FixedClock::seoul(2024, 5, 1, 10, 0, 0)),
            IndicatorConfig::default(),
        );
        (scheduler, state, sink)
    }

    /// Market data source that stalls before listing markets.
    struct SlowMarkets {
        inner: Arc<MockExchange>,
        delay: Duration,
    }

    #[async_trait::async_trait]
    impl MarketDataProvider for SlowMarkets {
        async fn list_markets(&self) -> Result<Vec<String>, ExchangeError> {
            tokio::time::sleep(self.delay).await;
            self.inner.list_markets().await
        }

        async fn minute_bars(&self, symbol: &str, count: usize) -> Result<Vec<Bar>, ExchangeError> {
            self.inner.minute_bars(symbol, count).await
        }
    }

    #[test]
    fn test_minute_edge_fires_on_change_only() {
        let clock = FixedClock::seoul(2024, 5, 1, 10, 0, 5);
        let mut edge = MinuteEdge::default();

        assert!(!edge.observe(clock.now()));
        clock.set(clock.now() + chrono::Duration::seconds(30));
        assert!(!edge.observe(clock.now()));
        clock.set(clock.now() + chrono::Duration::seconds(30));
        assert!(edge.observe(clock.now()));
        assert!(!edge.observe(clock.now()));
    }

    #[tokio::test]
    async fn test_short_window_yields_no_snapshot() {
        let exchange = Arc::new(MockExchange::new());
        exchange.set_bars("KRW-SHORT", bars(MIN_BAR_WINDOW - 1)).await;
        exchange.set_bars("KRW-FULL", bars(MIN_BAR_WINDOW)).await;
        let (scheduler, state, _sink) = scheduler(exchange).await;

        let report = scheduler.run_cycle().await.unwrap();

        assert_eq!(report.markets, 2);
        assert_eq!(report.computed, 1);
        assert_eq!(report.skipped, 1);
        assert!(state.snapshot("KRW-SHORT").await.is_none());
        assert!(state.snapshot("KRW-FULL").await.is_some());
        assert_eq!(state.targets().await.len(), 1);
    }

    #[tokio::test]
    async fn test_stale_snapshot_removed_when_window_shrinks() {
        let exchange = Arc::new(MockExchange::new());
        exchange.set_bars("KRW-A", bars(MIN_BAR_WINDOW)).await;
        let (scheduler, state, _sink) = scheduler(exchange.clone()).await;

        scheduler.run_cycle().await.unwrap();
        assert!(state.snapshot("KRW-A").await.is_some());

        exchange.set_bars("KRW-A", bars(10)).await;
        scheduler.run_cycle().await.unwrap();
        assert!(state.snapshot("KRW-A").await.is_none());
        assert!(state.targets().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_cycle_raises_alert_and_still_completes() {
        let exchange = Arc::new(MockExchange::new());
        exchange.set_bars("KRW-A", bars(MIN_BAR_WINDOW)).await;
        let limit = IndicatorConfig::default().cycle_alert_secs;
        let slow = Arc::new(SlowMarkets {
            inner: exchange,
            delay: Duration::from_secs(limit + 1),
        });
        let (scheduler, state, sink) = scheduler(slow).await;

        let report = scheduler.run_cycle().await.unwrap();
        scheduler.alerts.flush(Duration::from_secs(1)).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(report.elapsed > Duration::from_secs(limit));
        assert_eq!(report.computed, 1);
        assert!(state.snapshot("KRW-A").await.is_some());
        let errors = sink.messages(AlertLevel::Error);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("Indicator cycle took"));
    }

    #[tokio::test]
    async fn test_fast_cycle_raises_no_alert() {
        let exchange = Arc::new(MockExchange::new());
        exchange.set_bars("KRW-A", bars(MIN_BAR_WINDOW)).await;
        let (scheduler, _state, sink) = scheduler(exchange).await;

        scheduler.run_cycle().await.unwrap();
        scheduler.alerts.flush(Duration::from_secs(1)).await;

        assert!(sink.messages(AlertLevel::Error).is_empty());
    }
}
