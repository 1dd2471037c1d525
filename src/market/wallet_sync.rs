//! Periodic account refresh into the shared wallet map.

use super::error::FeedError;
use crate::alerts::AlertDispatcher;
use crate::exchange::WalletProvider;
use crate::state::SharedState;
use crate::utils::{Shutdown, ShutdownReason};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub struct WalletSync {
    provider: Arc<dyn WalletProvider>,
    state: Arc<SharedState>,
    alerts: AlertDispatcher,
    shutdown: Shutdown,
    interval: Duration,
    max_failures: u32,
    failures: u32,
}

impl WalletSync {
    pub fn new(
        provider: Arc<dyn WalletProvider>,
        state: Arc<SharedState>,
        alerts: AlertDispatcher,
        shutdown: Shutdown,
        interval: Duration,
        max_failures: u32,
    ) -> Self {
        Self {
            provider,
            state,
            alerts,
            shutdown,
            interval,
            max_failures,
            failures: 0,
        }
    }

    pub async fn run(mut self) -> Result<(), FeedError> {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let shutdown = self.shutdown.clone();

        loop {
            tokio::select! {
                _ = shutdown.wait() => break,
                _ = ticker.tick() => {}
            }

            if let Err(e) = self.sync_once().await {
                error!(error = %e, "Wallet sync stopped");
                if self.shutdown.trigger(ShutdownReason::Fatal(e.to_string())) {
                    self.alerts.fatal(format!("{}. Shutting down.", e)).await;
                }
                return Err(e);
            }
        }

        info!("Wallet sync stopped");
        Ok(())
    }

    /// Fetch positions once. Transient failures are counted; an exchange
    /// rejection or too many consecutive failures is an error.
    pub async fn sync_once(&mut self) -> Result<(), FeedError> {
        match self.provider.positions().await {
            Ok(positions) => {
                if self.failures > 0 {
                    info!(after = self.failures, "Wallet sync recovered");
                }
                self.failures = 0;
                debug!(positions = positions.len(), "Wallet refreshed");
                self.state.replace_wallet(positions).await;
                Ok(())
            }
            Err(e) if e.is_transient() => {
                self.failures += 1;
                warn!(failures = self.failures, error = %e, "Wallet refresh failed");
                if self.failures >= self.max_failures {
                    return Err(FeedError::WalletExhausted {
                        failures: self.failures,
                        last: e.to_string(),
                    });
                }
                Ok(())
            }
            Err(e) => Err(FeedError::WalletRejected(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::testing::recording_dispatcher;
    use crate::alerts::AlertLevel;
    use crate::exchange::traits::MockWalletProvider;
    use crate::exchange::{ExchangeError, MockExchange, WalletPosition};
    use rust_decimal_macros::dec;

    fn sync(provider: Arc<dyn WalletProvider>, state: Arc<SharedState>) -> (WalletSync, Shutdown) {
        let (alerts, _sink) = recording_dispatcher();
        let shutdown = Shutdown::new();
        let sync = WalletSync::new(
            provider,
            state,
            alerts,
            shutdown.clone(),
            Duration::from_millis(1),
            3,
        );
        (sync, shutdown)
    }

    fn rate_limited() -> ExchangeError {
        ExchangeError::RateLimited {
            endpoint: "/v1/accounts".to_string(),
            attempts: 6,
        }
    }

    #[tokio::test]
    async fn test_sync_replaces_wallet() {
        let exchange = Arc::new(MockExchange::new());
        exchange
            .set_position(
                "KRW-BTC",
                WalletPosition {
                    avg_buy_price: dec!(50_000_000),
                    quantity: dec!(0.001),
                },
            )
            .await;
        let state = Arc::new(SharedState::new(5));
        let (mut sync, _) = sync(exchange, state.clone());

        sync.sync_once().await.unwrap();

        let position = state.wallet_position("KRW-BTC").await.unwrap();
        assert_eq!(position.quantity, dec!(0.001));
    }

    #[tokio::test]
    async fn test_transient_failures_escalate_at_limit() {
        let mut provider = MockWalletProvider::new();
        provider
            .expect_positions()
            .times(3)
            .returning(|| Err(rate_limited()));
        let (mut sync, _) = sync(Arc::new(provider), Arc::new(SharedState::new(5)));

        assert!(sync.sync_once().await.is_ok());
        assert!(sync.sync_once().await.is_ok());
        assert!(matches!(
            sync.sync_once().await,
            Err(FeedError::WalletExhausted { failures: 3, .. })
        ));
    }

    #[tokio::test]
    async fn test_success_resets_failure_count() {
        let mut provider = MockWalletProvider::new();
        let mut seq = mockall::Sequence::new();
        for _ in 0..2 {
            provider
                .expect_positions()
                .times(1)
                .in_sequence(&mut seq)
                .returning(|| Err(rate_limited()));
        }
        provider
            .expect_positions()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok(Default::default()));
        provider
            .expect_positions()
            .times(2)
            .in_sequence(&mut seq)
            .returning(|| Err(rate_limited()));
        let (mut sync, _) = sync(Arc::new(provider), Arc::new(SharedState::new(5)));

        for _ in 0..5 {
            assert!(sync.sync_once().await.is_ok());
        }
    }

    #[tokio::test]
    async fn test_rejection_is_fatal_immediately() {
        let mut provider = MockWalletProvider::new();
        provider.expect_positions().times(1).returning(|| {
            Err(ExchangeError::Api {
                name: "invalid_access_key".to_string(),
                message: "잘못된 엑세스 키입니다.".to_string(),
            })
        });
        let state = Arc::new(SharedState::new(5));
        let (alerts, sink) = recording_dispatcher();
        let shutdown = Shutdown::new();
        let sync = WalletSync::new(
            Arc::new(provider),
            state,
            alerts,
            shutdown.clone(),
            Duration::from_millis(1),
            100,
        );

        let err = sync.run().await.unwrap_err();

        assert!(matches!(err, FeedError::WalletRejected(_)));
        assert!(shutdown.reason().unwrap().is_fatal());
        assert_eq!(sink.messages(AlertLevel::Fatal).len(), 1);
    }
}
