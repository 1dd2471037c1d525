//! Moving-average indicators over a one-minute bar window.

use crate::exchange::Bar;
use crate::utils::decimal::{mean, weighted_average};
use rust_decimal::Decimal;

pub const SMA_PERIOD: usize = 20;
pub const VWMA_PERIOD: usize = 100;

/// Bars needed for a snapshot: the VWMA period at T-2, plus T-1 and the
/// in-progress bar.
pub const MIN_BAR_WINDOW: usize = VWMA_PERIOD + 2;

/// Per-asset indicator values for the last two closed bars.
///
/// T-1 is the most recent closed bar, T-2 the one before it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndicatorSnapshot {
    pub t2_close: Decimal,
    pub t1_close: Decimal,
    pub t2_volume: Decimal,
    pub t1_volume: Decimal,
    pub t2_sma20: Decimal,
    pub t1_sma20: Decimal,
    pub t2_vwma100: Decimal,
    pub t1_vwma100: Decimal,
    pub current_price: Decimal,
}

/// Indicator math behind the scheduler. Pure and CPU-bound.
pub trait IndicatorCalculator: Send + Sync {
    /// Build a snapshot from bars ordered oldest first.
    ///
    /// Returns `None` unless every field can be computed.
    fn compute(&self, bars: &[Bar]) -> Option<IndicatorSnapshot>;
}

/// SMA(20) of closes and VWMA(100) of closes weighted by volume.
#[derive(Debug, Clone, Copy, Default)]
pub struct MovingAverageCalculator;

impl MovingAverageCalculator {
    /// Average of the `period` bars ending at `end` (exclusive).
    fn sma(bars: &[Bar], end: usize, period: usize) -> Option<Decimal> {
        let start = end.checked_sub(period)?;
        let closes: Vec<Decimal> = bars.get(start..end)?.iter().map(|b| b.close).collect();
        mean(&closes)
    }

    fn vwma(bars: &[Bar], end: usize, period: usize) -> Option<Decimal> {
        let start = end.checked_sub(period)?;
        let pairs: Vec<(Decimal, Decimal)> = bars
            .get(start..end)?
            .iter()
            .map(|b| (b.close, b.volume))
            .collect();
        weighted_average(&pairs)
    }
}

impl IndicatorCalculator for MovingAverageCalculator {
    fn compute(&self, bars: &[Bar]) -> Option<IndicatorSnapshot> {
        if bars.len() < MIN_BAR_WINDOW {
            return None;
        }

        let current = bars.len() - 1;
        let t1 = current - 1;
        let t2 = current - 2;

        Some(IndicatorSnapshot {
            t2_close: bars[t2].close,
            t1_close: bars[t1].close,
            t2_volume: bars[t2].volume,
            t1_volume: bars[t1].volume,
            t2_sma20: Self::sma(bars, t2 + 1, SMA_PERIOD)?,
            t1_sma20: Self::sma(bars, t1 + 1, SMA_PERIOD)?,
            t2_vwma100: Self::vwma(bars, t2 + 1, VWMA_PERIOD)?,
            t1_vwma100: Self::vwma(bars, t1 + 1, VWMA_PERIOD)?,
            current_price: bars[current].close,
        })
    }
}
