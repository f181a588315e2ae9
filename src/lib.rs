//! # Cycle Farmer
//!
//! Delta-neutral maker/taker volume cycling across two perpetuals venues.
//!
//! ## Architecture
//!
//! - `config`: Static configuration plus live-editable tunables
//! - `exchange`: Venue traits, dry-run wrappers and simulated venues
//! - `strategy`: Pricing, fill accumulation and the cycle state machine
//! - `risk`: Hedge reconciliation, liquidation guard, collateral gate and
//!   emergency unwind
//! - `control`: Pause/resume/shutdown flags and published cycle status
//! - `alert`: Operator notifications
//! - `utils`: Shared utilities and decimal arithmetic

pub mod alert;
pub mod config;
pub mod control;
pub mod exchange;
pub mod risk;
pub mod strategy;
pub mod utils;

pub use config::Config;
