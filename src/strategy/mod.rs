//! Trading strategy implementation.
//!
//! Contains the core logic for:
//! - Quote pricing and per-cycle sampling
//! - Fill accumulation across partial maker fills
//! - Opening with post-only quotes and remainder re-quoting
//! - Closing as a maker while unwinding the hedge incrementally
//! - The cycle state machine tying the phases together

mod accumulator;
mod closing;
mod cycle;
mod opening;
pub mod pricing;
#[cfg(test)]
mod testing;

pub use accumulator::FillAccumulator;
pub use cycle::{Cycle, CycleFarmer, SessionPnl};
pub use opening::{OpenFill, OpeningOutcome};

use crate::exchange::VenueError;
use rust_decimal::Decimal;
use thiserror::Error;

/// Failures that abort the cycle in flight and trigger an emergency unwind.
#[derive(Debug, Error)]
pub enum CycleError {
    /// The taker venue refused to neutralize a maker fill
    #[error("hedge of {size} failed: {source}")]
    HedgeFailed {
        size: Decimal,
        #[source]
        source: VenueError,
    },
    #[error(transparent)]
    Venue(#[from] VenueError),
}
