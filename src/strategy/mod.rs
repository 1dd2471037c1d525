//! Trading strategy implementation.
//!
//! Contains the core logic for:
//! - Indicator computation over minute bars, once per minute
//! - Candidate selection from indicator snapshots
//! - Rotation of candidates into the bounded trading slots
//! - The per-asset buy / take-profit lifecycle

mod indicators;
mod lifecycle;
mod rotator;
mod scheduler;
mod selector;

pub use indicators::{
    IndicatorCalculator, IndicatorSnapshot, MovingAverageCalculator, MIN_BAR_WINDOW, SMA_PERIOD,
    VWMA_PERIOD,
};
pub use lifecycle::{run_guarded, TradeContext, TradeLifecycle, TradeOutcome, TradeSpawner, TradeState};
pub use rotator::TradingQueueRotator;
pub use scheduler::{CycleReport, IndicatorScheduler, MinuteEdge};
pub use selector::{AcceptAll, BreakoutPredicate, CandidatePredicate, CandidateSelector};
