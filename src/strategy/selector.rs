//! Candidate selection from indicator snapshots.

use super::indicators::IndicatorSnapshot;
use crate::state::{PriceMap, SharedState};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Decides whether a snapshot makes its asset a buy candidate.
pub trait CandidatePredicate: Send + Sync {
    fn accepts(&self, snapshot: &IndicatorSnapshot) -> bool;
}

/// Volume breakout above both moving averages.
///
/// All of:
/// - T-2 SMA20 and T-2 VWMA100 below the T-2 close
/// - T-1 SMA20 and T-1 VWMA100 below the T-1 close
/// - T-1 volume more than `volume_multiple` times the T-2 volume
/// - current price above the T-1 close
/// - T-1 traded value (volume x close) above `min_traded_value`
#[derive(Debug, Clone)]
pub struct BreakoutPredicate {
    pub volume_multiple: Decimal,
    pub min_traded_value: Decimal,
}

impl Default for BreakoutPredicate {
    fn default() -> Self {
        Self {
            volume_multiple: dec!(3),
            min_traded_value: dec!(30_000_000),
        }
    }
}

impl CandidatePredicate for BreakoutPredicate {
    fn accepts(&self, s: &IndicatorSnapshot) -> bool {
        s.t2_sma20 < s.t2_close
            && s.t2_vwma100 < s.t2_close
            && s.t1_sma20 < s.t1_close
            && s.t1_vwma100 < s.t1_close
            && s.t1_volume > s.t2_volume * self.volume_multiple
            && s.current_price > s.t1_close
            && s.t1_volume * s.t1_close > self.min_traded_value
    }
}

/// Accepts every asset that has a snapshot.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl CandidatePredicate for AcceptAll {
    fn accepts(&self, _snapshot: &IndicatorSnapshot) -> bool {
        true
    }
}

/// Classifies snapshots and publishes the result as the target set.
pub struct CandidateSelector {
    predicate: Box<dyn CandidatePredicate>,
    state: Arc<SharedState>,
}

impl CandidateSelector {
    pub fn new(predicate: Box<dyn CandidatePredicate>, state: Arc<SharedState>) -> Self {
        Self { predicate, state }
    }

    /// Accepted symbols mapped to their current price.
    pub fn classify(&self, snapshots: &HashMap<String, IndicatorSnapshot>) -> PriceMap {
        snapshots
            .iter()
            .filter(|(_, snap)| self.predicate.accepts(snap))
            .map(|(symbol, snap)| (symbol.clone(), snap.current_price))
            .collect()
    }

    /// Classify the current snapshots and replace the target set.
    ///
    /// Returns the number of targets stored.
    pub async fn refresh_targets(&self) -> usize {
        let snapshots = self.state.snapshots().await;
        let targets = self.classify(&snapshots);
        let accepted = targets.len();
        let stored = self.state.replace_targets(targets).await;

        if stored > 0 {
            info!(evaluated = snapshots.len(), accepted, stored, "Targets updated");
        } else {
            debug!(evaluated = snapshots.len(), "No targets this cycle");
        }
        stored
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breakout() -> IndicatorSnapshot {
        IndicatorSnapshot {
            t2_close: dec!(100),
            t1_close: dec!(110),
            t2_volume: dec!(100_000),
            t1_volume: dec!(400_000),
            t2_sma20: dec!(95),
            t1_sma20: dec!(96),
            t2_vwma100: dec!(90),
            t1_vwma100: dec!(91),
            current_price: dec!(111),
        }
    }

    #[test]
    fn test_breakout_accepts_all_conditions() {
        assert!(BreakoutPredicate::default().accepts(&breakout()));
    }

    #[test]
    fn test_breakout_rejects_each_failed_condition() {
        let p = BreakoutPredicate::default();
        let cases: Vec<fn(&mut IndicatorSnapshot)> = vec![
            |s| s.t2_sma20 = dec!(100),
            |s| s.t2_vwma100 = dec!(101),
            |s| s.t1_sma20 = dec!(110),
            |s| s.t1_vwma100 = dec!(120),
            |s| s.t1_volume = dec!(300_000),
            |s| s.current_price = dec!(110),
            |s| {
                s.t1_close = dec!(1);
                s.t2_close = dec!(0.9);
                s.current_price = dec!(2);
                s.t2_sma20 = dec!(0.5);
                s.t1_sma20 = dec!(0.5);
                s.t2_vwma100 = dec!(0.5);
                s.t1_vwma100 = dec!(0.5);
            },
        ];

        for mutate in cases {
            let mut snap = breakout();
            mutate(&mut snap);
            assert!(!p.accepts(&snap), "should reject {:?}", snap);
        }
    }

    #[tokio::test]
    async fn test_refresh_replaces_targets() {
        let state = Arc::new(SharedState::new(5));
        let mut quiet = breakout();
        quiet.t1_volume = dec!(1);
        state.set_snapshot("KRW-HOT", breakout()).await;
        state.set_snapshot("KRW-QUIET", quiet).await;
        state
            .replace_targets(HashMap::from([("KRW-STALE".to_string(), dec!(1))]))
            .await;

        let selector = CandidateSelector::new(Box::new(BreakoutPredicate::default()), state.clone());
        assert_eq!(selector.refresh_targets().await, 1);

        let targets = state.targets().await;
        assert_eq!(targets.len(), 1);
        assert_eq!(targets.get("KRW-HOT"), Some(&dec!(111)));
    }

    #[tokio::test]
    async fn test_accept_all_takes_every_snapshot() {
        let state = Arc::new(SharedState::new(5));
        let mut quiet = breakout();
        quiet.t1_volume = dec!(1);
        state.set_snapshot("KRW-A", breakout()).await;
        state.set_snapshot("KRW-B", quiet).await;

        let selector = CandidateSelector::new(Box::new(AcceptAll), state.clone());
        assert_eq!(selector.refresh_targets().await, 2);
    }
}
