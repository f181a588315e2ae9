//! Risk management for cycle farming.
//!
//! Keeps the two legs delta-neutral and exits before trouble:
//! - Pre-cycle collateral gate
//! - Hedge, corrective hedge and end-of-cycle unwind reconciliation
//! - Liquidation risk monitoring during the hold
//! - Emergency unwind of both legs and a net-exposure hedge for recovery

mod emergency;
mod liquidation;
mod margin;
mod reconcile;

pub use emergency::{EmergencyReport, EmergencyUnwind, Exposure};
pub use liquidation::{HoldExit, Leg, LiquidationGuard};
pub use margin::{CollateralCheck, CollateralGate};
pub use reconcile::{ReconcileSettings, Reconciler, UnwindOutcome};
