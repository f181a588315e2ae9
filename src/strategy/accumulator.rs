//! Fill accumulation toward a randomized target size.
//!
//! A single opening order may not fill the whole target. The accumulator
//! tracks how much has been filled and hedged, locks the side on the first
//! fill, and bounds the number of opening attempts.

use crate::exchange::Side;
use crate::utils::decimal::round_to_precision;
use rust_decimal::Decimal;
use tracing::info;

#[derive(Debug, Clone)]
pub struct FillAccumulator {
    target: Decimal,
    total_filled: Decimal,
    locked_side: Option<Side>,
    attempts: u32,
    max_attempts: u32,
    fill_ratio: Decimal,
    size_decimals: u32,
}

impl FillAccumulator {
    pub fn new(target: Decimal, max_attempts: u32, fill_ratio: Decimal, size_decimals: u32) -> Self {
        Self {
            target,
            total_filled: Decimal::ZERO,
            locked_side: None,
            attempts: 0,
            max_attempts,
            fill_ratio,
            size_decimals,
        }
    }

    pub fn target(&self) -> Decimal {
        self.target
    }

    pub fn total_filled(&self) -> Decimal {
        self.total_filled
    }

    pub fn locked_side(&self) -> Option<Side> {
        self.locked_side
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Size still to open.
    pub fn remaining(&self) -> Decimal {
        round_to_precision(self.target - self.total_filled, self.size_decimals).max(Decimal::ZERO)
    }

    /// Filled at least `fill_ratio` of the target.
    pub fn is_complete(&self) -> bool {
        self.total_filled >= self.target * self.fill_ratio || self.remaining().is_zero()
    }

    pub fn attempts_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }

    /// Whether another opening attempt should be made.
    pub fn should_continue(&self) -> bool {
        !self.is_complete() && !self.attempts_exhausted()
    }

    /// Count an opening attempt. Returns the attempt number.
    pub fn begin_attempt(&mut self) -> u32 {
        self.attempts += 1;
        self.attempts
    }

    /// Record a hedged fill. The first fill locks the side for the rest of
    /// the cycle; `total_filled` never decreases.
    pub fn record_fill(&mut self, side: Side, size: Decimal) {
        if self.locked_side.is_none() {
            info!(%side, "🔒 Side locked");
            self.locked_side = Some(side);
        }
        self.total_filled += size.max(Decimal::ZERO);

        info!(
            filled = %self.total_filled,
            target = %self.target,
            pct = %(self.progress() * Decimal::ONE_HUNDRED).round(),
            "📊 Accumulated"
        );
    }

    /// Fraction of the target filled.
    pub fn progress(&self) -> Decimal {
        if self.target.is_zero() {
            return Decimal::ONE;
        }
        self.total_filled / self.target
    }
}
