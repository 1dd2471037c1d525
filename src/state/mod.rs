//! Shared state store.
//!
//! Every map the schedulers share lives here, each behind its own lock so
//! unrelated loops proceed concurrently. Operations that need more than one
//! lock acquire them in the fixed order
//!
//! ```text
//! targets -> slots -> active
//! ```
//!
//! and only this module takes more than one lock at a time. Indicator
//! snapshots and wallet positions have independent read/write locks and are
//! never held together with the others.

use crate::exchange::WalletPosition;
use crate::strategy::IndicatorSnapshot;
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use tokio::sync::{Mutex, MutexGuard, RwLock};
use tracing::debug;

pub type PriceMap = HashMap<String, Decimal>;

/// Maps shared between the schedulers and lifecycle tasks.
pub struct SharedState {
    indicators: RwLock<HashMap<String, IndicatorSnapshot>>,
    targets: Mutex<PriceMap>,
    slots: Mutex<PriceMap>,
    active: Mutex<HashSet<String>>,
    wallet: RwLock<HashMap<String, WalletPosition>>,
    slot_capacity: usize,
}

impl SharedState {
    pub fn new(slot_capacity: usize) -> Self {
        Self {
            indicators: RwLock::new(HashMap::new()),
            targets: Mutex::new(HashMap::new()),
            slots: Mutex::new(HashMap::new()),
            active: Mutex::new(HashSet::new()),
            wallet: RwLock::new(HashMap::new()),
            slot_capacity,
        }
    }

    pub fn slot_capacity(&self) -> usize {
        self.slot_capacity
    }

    // ==================== Indicators ====================

    pub async fn set_snapshot(&self, symbol: &str, snapshot: IndicatorSnapshot) {
        self.indicators
            .write()
            .await
            .insert(symbol.to_string(), snapshot);
    }

    pub async fn remove_snapshot(&self, symbol: &str) -> Option<IndicatorSnapshot> {
        self.indicators.write().await.remove(symbol)
    }

    pub async fn snapshot(&self, symbol: &str) -> Option<IndicatorSnapshot> {
        self.indicators.read().await.get(symbol).copied()
    }

    pub async fn snapshots(&self) -> HashMap<String, IndicatorSnapshot> {
        self.indicators.read().await.clone()
    }

    // ==================== Targets ====================

    /// Replace the target set in one step (clear, then fill).
    ///
    /// Symbols already holding a trading slot are left out so the two maps
    /// stay disjoint. Returns the number of targets stored.
    pub async fn replace_targets(&self, targets: PriceMap) -> usize {
        let mut current = self.targets.lock().await;
        let slots = self.slots.lock().await;

        current.clear();
        current.extend(
            targets
                .into_iter()
                .filter(|(symbol, _)| !slots.contains_key(symbol)),
        );
        current.len()
    }

    pub async fn targets(&self) -> PriceMap {
        self.targets.lock().await.clone()
    }

    /// Run `f` with the target map and slot map locked, in lock order.
    pub async fn with_targets_and_slots<R>(
        &self,
        f: impl FnOnce(&mut PriceMap, &mut PriceMap) -> R,
    ) -> R {
        let mut targets = self.targets.lock().await;
        let mut slots = self.slots.lock().await;
        let result = f(&mut targets, &mut slots);
        debug_assert!(slots.len() <= self.slot_capacity);
        result
    }

    // ==================== Trading slots ====================

    pub async fn slot_symbols(&self) -> Vec<String> {
        self.slots.lock().await.keys().cloned().collect()
    }

    pub async fn slot_price(&self, symbol: &str) -> Option<Decimal> {
        self.slots.lock().await.get(symbol).copied()
    }

    pub async fn slot_count(&self) -> usize {
        self.slots.lock().await.len()
    }

    pub async fn slots(&self) -> PriceMap {
        self.slots.lock().await.clone()
    }

    /// Update the price of an existing slot. Unknown symbols are ignored.
    pub async fn set_slot_price(&self, symbol: &str, price: Decimal) -> bool {
        match self.slots.lock().await.get_mut(symbol) {
            Some(current) => {
                *current = price;
                true
            }
            None => false,
        }
    }

    /// Hold the slot lock for a whole price refresh round.
    pub async fn slot_round(&self) -> SlotRound<'_> {
        SlotRound {
            slots: self.slots.lock().await,
        }
    }

    // ==================== Active trades ====================

    /// Atomically claim `symbol` for a lifecycle task.
    ///
    /// Returns `false` if another task already owns it.
    pub async fn try_claim(&self, symbol: &str) -> bool {
        self.active.lock().await.insert(symbol.to_string())
    }

    /// Claim `symbol` only while it still holds a trading slot.
    ///
    /// Slot membership and the claim are checked under one slots -> active
    /// critical section, so a symbol released between listing the slots and
    /// claiming cannot be picked up again.
    pub async fn try_claim_slot(&self, symbol: &str) -> bool {
        let slots = self.slots.lock().await;
        if !slots.contains_key(symbol) {
            return false;
        }
        self.active.lock().await.insert(symbol.to_string())
    }

    pub async fn is_active(&self, symbol: &str) -> bool {
        self.active.lock().await.contains(symbol)
    }

    pub async fn active_count(&self) -> usize {
        self.active.lock().await.len()
    }

    /// Lifecycle cleanup: drop the slot and release ownership.
    pub async fn release(&self, symbol: &str) {
        let mut slots = self.slots.lock().await;
        let mut active = self.active.lock().await;
        slots.remove(symbol);
        active.remove(symbol);
        debug!(%symbol, slots = slots.len(), active = active.len(), "Released trading slot");
    }

    // ==================== Wallet ====================

    pub async fn replace_wallet(&self, positions: HashMap<String, WalletPosition>) {
        *self.wallet.write().await = positions;
    }

    pub async fn wallet_position(&self, symbol: &str) -> Option<WalletPosition> {
        self.wallet.read().await.get(symbol).copied()
    }
}

/// Slot map held locked across a subscribe-and-receive round, so the
/// subscribed symbol set cannot change mid-round.
pub struct SlotRound<'a> {
    slots: MutexGuard<'a, PriceMap>,
}

impl SlotRound<'_> {
    /// Current slot symbols, sorted for a stable subscription order.
    pub fn symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self.slots.keys().cloned().collect();
        symbols.sort();
        symbols
    }

    /// Store a received price; ignored for symbols not in the slot set.
    pub fn update_price(&mut self, symbol: &str, price: Decimal) -> bool {
        match self.slots.get_mut(symbol) {
            Some(current) => {
                *current = price;
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    async fn state_with_slots(slots: &[(&str, Decimal)]) -> SharedState {
        let state = SharedState::new(5);
        state
            .with_targets_and_slots(|_, s| {
                for (symbol, price) in slots {
                    s.insert(symbol.to_string(), *price);
                }
            })
            .await;
        state
    }

    #[tokio::test]
    async fn test_claim_is_exclusive_under_contention() {
        let state = Arc::new(SharedState::new(5));
        let mut handles = Vec::new();
        for _ in 0..50 {
            let state = state.clone();
            handles.push(tokio::spawn(async move { state.try_claim("KRW-BTC").await }));
        }

        let mut claimed = 0;
        for handle in handles {
            if handle.await.unwrap() {
                claimed += 1;
            }
        }
        assert_eq!(claimed, 1);
        assert_eq!(state.active_count().await, 1);
    }

    #[tokio::test]
    async fn test_claim_slot_requires_slot_membership() {
        let state = state_with_slots(&[("KRW-A", dec!(10))]).await;
        let listed = state.slot_symbols().await;

        assert!(state.try_claim_slot("KRW-A").await);
        assert!(!state.try_claim_slot("KRW-A").await);
        state.release("KRW-A").await;

        // Stale listing from before the release
        for symbol in &listed {
            assert!(!state.try_claim_slot(symbol).await);
        }
        assert_eq!(state.active_count().await, 0);
        assert!(!state.try_claim_slot("KRW-Z").await);
    }

    #[tokio::test]
    async fn test_replace_targets_skips_slot_symbols() {
        let state = state_with_slots(&[("KRW-A", dec!(10))]).await;

        let stored = state
            .replace_targets(HashMap::from([
                ("KRW-A".to_string(), dec!(11)),
                ("KRW-B".to_string(), dec!(20)),
            ]))
            .await;

        assert_eq!(stored, 1);
        let targets = state.targets().await;
        assert!(!targets.contains_key("KRW-A"));
        assert_eq!(targets.get("KRW-B"), Some(&dec!(20)));
    }

    #[tokio::test]
    async fn test_replace_targets_clears_previous_cycle() {
        let state = SharedState::new(5);
        state
            .replace_targets(HashMap::from([("KRW-OLD".to_string(), dec!(1))]))
            .await;
        state
            .replace_targets(HashMap::from([("KRW-NEW".to_string(), dec!(2))]))
            .await;

        let targets = state.targets().await;
        assert_eq!(targets.len(), 1);
        assert!(targets.contains_key("KRW-NEW"));
    }

    #[tokio::test]
    async fn test_release_removes_slot_and_claim() {
        let state = state_with_slots(&[("KRW-A", dec!(10))]).await;
        assert!(state.try_claim("KRW-A").await);

        state.release("KRW-A").await;

        assert_eq!(state.slot_count().await, 0);
        assert!(!state.is_active("KRW-A").await);
        assert!(state.try_claim("KRW-A").await);
    }

    #[tokio::test]
    async fn test_slot_price_updates_only_existing_slots() {
        let state = state_with_slots(&[("KRW-A", dec!(10))]).await;

        assert!(state.set_slot_price("KRW-A", dec!(12)).await);
        assert!(!state.set_slot_price("KRW-Z", dec!(1)).await);

        let mut round = state.slot_round().await;
        assert_eq!(round.symbols(), vec!["KRW-A".to_string()]);
        assert!(!round.update_price("KRW-Z", dec!(1)));
        drop(round);

        assert_eq!(state.slot_price("KRW-A").await, Some(dec!(12)));
        assert_eq!(state.slot_count().await, 1);
    }
}
