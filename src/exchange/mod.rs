//! Venue interfaces for the two legs of a cycle.
//!
//! ## Maker venue
//! Rests post-only quotes to open and close; fills are detected by
//! polling the account position.
//!
//! ## Taker venue
//! Hedges every maker fill with a bounded-slippage market order and
//! unwinds with idempotent client order ids.
//!
//! `mock` provides in-memory venues for paper runs and tests; `dry_run`
//! wraps any venue so order flow can be simulated at runtime.

pub mod dry_run;
pub mod mock;
pub mod traits;
mod types;

pub use dry_run::{DryRunMaker, DryRunTaker};
pub use mock::{MockMakerVenue, MockMarket, MockTakerVenue};
pub use traits::{MakerVenue, TakerVenue, Venue};
pub use types::*;
