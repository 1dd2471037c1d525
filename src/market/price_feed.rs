//! Live prices for the trading slots.
//!
//! Every refresh interval the keeper locks the slot map for the whole round,
//! resubscribes to exactly the slot symbols, then reads one reply per symbol.
//! Send and receive failures are counted separately; each one raises an
//! error alert and a reconnect. Connects and subscription sends are bounded
//! by `connect_timeout`, and a failed or timed-out connect counts as a send
//! failure. Hitting the limit on either counter sends a
//! fatal alert, triggers shutdown, and stops the keeper.

use super::error::FeedError;
use crate::alerts::AlertDispatcher;
use crate::config::FeedConfig;
use crate::exchange::PriceStream;
use crate::state::{SharedState, SlotRound};
use crate::utils::{Shutdown, ShutdownReason};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub struct PriceFeedKeeper<S: PriceStream> {
    stream: S,
    state: Arc<SharedState>,
    alerts: AlertDispatcher,
    shutdown: Shutdown,
    config: FeedConfig,
    send_failures: u32,
    recv_failures: u32,
}

impl<S: PriceStream> PriceFeedKeeper<S> {
    pub fn new(
        stream: S,
        state: Arc<SharedState>,
        alerts: AlertDispatcher,
        shutdown: Shutdown,
        config: FeedConfig,
    ) -> Self {
        Self {
            stream,
            state,
            alerts,
            shutdown,
            config,
            send_failures: 0,
            recv_failures: 0,
        }
    }

    pub fn failure_counts(&self) -> (u32, u32) {
        (self.send_failures, self.recv_failures)
    }

    /// Connect and refresh until shutdown or exhaustion.
    pub async fn run(mut self) -> Result<(), FeedError> {
        if let Err(e) = self.reconnect().await {
            self.fail(&e).await;
            return Err(e);
        }

        let mut ticker = tokio::time::interval(self.config.refresh_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let shutdown = self.shutdown.clone();
        loop {
            tokio::select! {
                _ = shutdown.wait() => break,
                _ = ticker.tick() => {}
            }

            if let Err(e) = self.round().await {
                self.fail(&e).await;
                return Err(e);
            }
        }

        info!("Price feed keeper stopped");
        Ok(())
    }

    /// One subscribe-and-receive round. Returns the number of prices stored.
    pub async fn round(&mut self) -> Result<usize, FeedError> {
        let state = self.state.clone();
        let mut slots = state.slot_round().await;
        let symbols = slots.symbols();
        if symbols.is_empty() {
            return Ok(0);
        }

        let mut pending: VecDeque<String> = symbols.into();
        let mut updated = 0;
        let mut recv_failed = false;

        'round: while !pending.is_empty() {
            let request: Vec<String> = pending.iter().cloned().collect();
            if let Err(last) = self.subscribe(&request).await {
                self.count_send_failure("Price subscription failed", last)?;
                self.reconnect().await?;
                break 'round;
            }
            self.send_failures = 0;

            while pending.pop_front().is_some() {
                match self.receive(&mut slots).await {
                    Ok(stored) => updated += usize::from(stored),
                    Err(last) => {
                        recv_failed = true;
                        self.recv_failures += 1;
                        warn!(failures = self.recv_failures, error = %last, "Price receive failed");
                        if self.recv_failures >= self.config.max_consecutive_failures {
                            return Err(FeedError::ReceiveExhausted {
                                failures: self.recv_failures,
                                last,
                            });
                        }
                        self.alerts
                            .error(format!("Price receive failed: {}. Reconnecting.", last));
                        self.reconnect().await?;
                        // The new connection needs its own subscription
                        continue 'round;
                    }
                }
            }
        }

        if !recv_failed && self.send_failures == 0 {
            self.recv_failures = 0;
        }
        debug!(updated, "Price round complete");
        Ok(updated)
    }

    async fn receive(&mut self, slots: &mut SlotRound<'_>) -> Result<bool, String> {
        match tokio::time::timeout(self.config.receive_timeout(), self.stream.next_tick()).await {
            Ok(Ok(tick)) => Ok(slots.update_price(&tick.symbol, tick.price)),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!(
                "no reply within {}s",
                self.config.receive_timeout_secs
            )),
        }
    }

    async fn subscribe(&mut self, symbols: &[String]) -> Result<(), String> {
        let limit = self.config.connect_timeout();
        match tokio::time::timeout(limit, self.stream.subscribe(symbols)).await {
            Ok(result) => result.map_err(|e| e.to_string()),
            Err(_) => Err(format!("send timed out after {}s", limit.as_secs())),
        }
    }

    /// Reconnect; a failed or timed-out attempt counts as a send failure.
    async fn reconnect(&mut self) -> Result<(), FeedError> {
        let limit = self.config.connect_timeout();
        let last = match tokio::time::timeout(limit, self.stream.connect()).await {
            Ok(Ok(())) => {
                debug!("Price stream connected");
                return Ok(());
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("connect timed out after {}s", limit.as_secs()),
        };
        self.count_send_failure("Price stream connect failed", last)
    }

    fn count_send_failure(&mut self, what: &str, last: String) -> Result<(), FeedError> {
        self.send_failures += 1;
        warn!(failures = self.send_failures, error = %last, "{}", what);
        if self.send_failures >= self.config.max_consecutive_failures {
            return Err(FeedError::SendExhausted {
                failures: self.send_failures,
                last,
            });
        }
        self.alerts.error(format!("{}: {}. Reconnecting.", what, last));
        Ok(())
    }

    async fn fail(&self, error: &FeedError) {
        error!(error = %error, "Price feed exhausted, shutting down");
        if self
            .shutdown
            .trigger(ShutdownReason::Fatal(error.to_string()))
        {
            self.alerts
                .fatal(format!("{}. Shutting down.", error))
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::testing::recording_dispatcher;
    use crate::alerts::AlertLevel;
    use crate::exchange::{MockFeedState, MockPriceStream};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use std::sync::atomic::Ordering;

    fn config() -> FeedConfig {
        FeedConfig {
            refresh_interval_ms: 1,
            receive_timeout_secs: 1,
            max_consecutive_failures: 10,
            ..FeedConfig::default()
        }
    }

    async fn state_with(slots: &[(&str, Decimal)]) -> Arc<SharedState> {
        let state = Arc::new(SharedState::new(5));
        state
            .with_targets_and_slots(|_, s| {
                for (symbol, price) in slots {
                    s.insert(symbol.to_string(), *price);
                }
            })
            .await;
        state
    }

    fn feed(prices: &[(&str, Decimal)]) -> Arc<MockFeedState> {
        let shared = Arc::new(MockFeedState::default());
        let mut map = shared.prices.lock().unwrap();
        for (symbol, price) in prices {
            map.insert(symbol.to_string(), *price);
        }
        drop(map);
        shared
    }

    #[tokio::test]
    async fn test_round_updates_slot_prices() {
        let state = state_with(&[("KRW-A", dec!(1)), ("KRW-B", dec!(2))]).await;
        let shared = feed(&[("KRW-A", dec!(10)), ("KRW-B", dec!(20))]);
        let (alerts, _sink) = recording_dispatcher();
        let mut keeper = PriceFeedKeeper::new(
            MockPriceStream::new(shared.clone()),
            state.clone(),
            alerts,
            Shutdown::new(),
            config(),
        );

        assert_eq!(keeper.round().await.unwrap(), 2);
        assert_eq!(state.slot_price("KRW-A").await, Some(dec!(10)));
        assert_eq!(state.slot_price("KRW-B").await, Some(dec!(20)));
        assert_eq!(
            shared.subscriptions.lock().unwrap().last().unwrap(),
            &vec!["KRW-A".to_string(), "KRW-B".to_string()]
        );
    }

    #[tokio::test]
    async fn test_empty_slots_skip_subscription() {
        let state = Arc::new(SharedState::new(5));
        let shared = feed(&[]);
        let (alerts, _sink) = recording_dispatcher();
        let mut keeper = PriceFeedKeeper::new(
            MockPriceStream::new(shared.clone()),
            state,
            alerts,
            Shutdown::new(),
            config(),
        );

        assert_eq!(keeper.round().await.unwrap(), 0);
        assert!(shared.subscriptions.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_receive_failure_does_not_abort_round() {
        let state = state_with(&[("KRW-A", dec!(1)), ("KRW-B", dec!(2))]).await;
        let shared = feed(&[("KRW-A", dec!(10)), ("KRW-B", dec!(20))]);
        shared
            .failing_symbols
            .lock()
            .unwrap()
            .insert("KRW-A".to_string());
        let (alerts, _sink) = recording_dispatcher();
        let mut keeper = PriceFeedKeeper::new(
            MockPriceStream::new(shared.clone()),
            state.clone(),
            alerts,
            Shutdown::new(),
            config(),
        );

        assert_eq!(keeper.round().await.unwrap(), 1);
        assert_eq!(keeper.failure_counts(), (0, 1));
        assert_eq!(state.slot_price("KRW-A").await, Some(dec!(1)));
        assert_eq!(state.slot_price("KRW-B").await, Some(dec!(20)));
        assert_eq!(shared.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_clean_round_resets_receive_counter() {
        let state = state_with(&[("KRW-A", dec!(1))]).await;
        let shared = feed(&[("KRW-A", dec!(10))]);
        shared
            .failing_symbols
            .lock()
            .unwrap()
            .insert("KRW-A".to_string());
        let (alerts, _sink) = recording_dispatcher();
        let mut keeper = PriceFeedKeeper::new(
            MockPriceStream::new(shared.clone()),
            state,
            alerts,
            Shutdown::new(),
            config(),
        );

        for _ in 0..3 {
            keeper.round().await.unwrap();
        }
        assert_eq!(keeper.failure_counts(), (0, 3));

        shared.failing_symbols.lock().unwrap().clear();
        keeper.round().await.unwrap();
        assert_eq!(keeper.failure_counts(), (0, 0));
    }

    #[tokio::test]
    async fn test_send_failures_trigger_single_fatal() {
        let state = state_with(&[("KRW-A", dec!(1))]).await;
        let shared = feed(&[("KRW-A", dec!(10))]);
        let (alerts, sink) = recording_dispatcher();
        let shutdown = Shutdown::new();
        let keeper = PriceFeedKeeper::new(
            MockPriceStream::failing_sends(shared.clone()),
            state,
            alerts.clone(),
            shutdown.clone(),
            config(),
        );

        let err = keeper.run().await.unwrap_err();
        alerts.flush(std::time::Duration::from_secs(1)).await;

        assert!(matches!(err, FeedError::SendExhausted { failures: 10, .. }));
        assert!(shutdown.reason().unwrap().is_fatal());
        assert_eq!(sink.messages(AlertLevel::Fatal).len(), 1);
        // Initial connect plus one reconnect per non-final failure
        assert_eq!(shared.connects.load(Ordering::SeqCst), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_connect_escalates_and_frees_slots() {
        let state = state_with(&[("KRW-A", dec!(1))]).await;
        let shared = feed(&[("KRW-A", dec!(10))]);
        shared.hang_connects.store(true, Ordering::SeqCst);
        let (alerts, sink) = recording_dispatcher();
        let shutdown = Shutdown::new();
        let keeper = PriceFeedKeeper::new(
            MockPriceStream::failing_sends(shared.clone()),
            state.clone(),
            alerts,
            shutdown.clone(),
            config(),
        );

        let err = tokio::time::timeout(std::time::Duration::from_secs(3600), keeper.run())
            .await
            .expect("keeper stuck on a hanging connect")
            .unwrap_err();

        assert!(matches!(err, FeedError::SendExhausted { failures: 10, .. }));
        assert!(shutdown.reason().unwrap().is_fatal());
        assert_eq!(sink.messages(AlertLevel::Fatal).len(), 1);
        assert_eq!(state.slot_price("KRW-A").await, Some(dec!(1)));
    }

    #[tokio::test]
    async fn test_receive_failures_trigger_single_fatal() {
        let state = state_with(&[("KRW-A", dec!(1))]).await;
        let shared = feed(&[]);
        let (alerts, sink) = recording_dispatcher();
        let shutdown = Shutdown::new();
        let keeper = PriceFeedKeeper::new(
            MockPriceStream::new(shared.clone()),
            state,
            alerts,
            shutdown.clone(),
            config(),
        );

        let err = keeper.run().await.unwrap_err();

        assert!(matches!(err, FeedError::ReceiveExhausted { failures: 10, .. }));
        assert!(shutdown.is_triggered());
        assert_eq!(sink.messages(AlertLevel::Fatal).len(), 1);
    }

    #[tokio::test]
    async fn test_no_fatal_when_already_shutting_down() {
        let state = state_with(&[("KRW-A", dec!(1))]).await;
        let (alerts, sink) = recording_dispatcher();
        let shutdown = Shutdown::new();
        let keeper = PriceFeedKeeper::new(
            MockPriceStream::failing_sends(feed(&[])),
            state,
            alerts,
            shutdown.clone(),
            config(),
        );

        shutdown.trigger(ShutdownReason::Fatal("wallet rejected".to_string()));
        keeper
            .fail(&FeedError::SendExhausted {
                failures: 10,
                last: "closed".to_string(),
            })
            .await;

        assert!(sink.messages(AlertLevel::Fatal).is_empty());
        assert_eq!(
            shutdown.reason(),
            Some(ShutdownReason::Fatal("wallet rejected".to_string()))
        );
    }
}
