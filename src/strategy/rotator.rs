//! Promotes targets into the capacity-bounded trading slots.

use crate::state::SharedState;
use crate::utils::Shutdown;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

pub struct TradingQueueRotator<R: Rng + Send = StdRng> {
    state: Arc<SharedState>,
    interval: Duration,
    rng: R,
}

impl TradingQueueRotator<StdRng> {
    pub fn new(state: Arc<SharedState>, interval: Duration) -> Self {
        Self::with_rng(state, interval, StdRng::from_entropy())
    }
}

impl<R: Rng + Send> TradingQueueRotator<R> {
    pub fn with_rng(state: Arc<SharedState>, interval: Duration, rng: R) -> Self {
        Self {
            state,
            interval,
            rng,
        }
    }

    /// Fill free slots with targets sampled uniformly without replacement.
    ///
    /// Promoted symbols leave the target set. Returns the promoted symbols.
    pub async fn rotate_once(&mut self) -> Vec<String> {
        let capacity = self.state.slot_capacity();
        let rng = &mut self.rng;

        let promoted = self
            .state
            .with_targets_and_slots(|targets, slots| {
                let deficit = capacity.saturating_sub(slots.len());
                if deficit == 0 || targets.is_empty() {
                    return Vec::new();
                }

                let mut eligible: Vec<&String> = targets
                    .keys()
                    .filter(|symbol| !slots.contains_key(*symbol))
                    .collect();
                // Map iteration order is random; sort so a seeded rng is reproducible
                eligible.sort();

                let picked: Vec<String> = eligible
                    .choose_multiple(rng, deficit)
                    .map(|symbol| (*symbol).clone())
                    .collect();

                for symbol in &picked {
                    if let Some(price) = targets.remove(symbol) {
                        slots.insert(symbol.clone(), price);
                    }
                }
                picked
            })
            .await;

        if !promoted.is_empty() {
            info!(?promoted, "Promoted targets to trading slots");
        }
        promoted
    }

    pub async fn run(mut self, shutdown: Shutdown) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        debug!(interval = ?self.interval, "Trading queue rotator started");

        loop {
            tokio::select! {
                _ = shutdown.wait() => break,
                _ = ticker.tick() => {
                    self.rotate_once().await;
                }
            }
        }

        info!("Trading queue rotator stopped");
    }
}
