//! Liquidation risk monitoring during the hold.
//!
//! Estimates each leg's leveraged return from the taker mid and ends the
//! hold early once either leg crosses the configured threshold. This is a
//! conservative proxy for venue margin ratios: at 40x, a -80% estimate
//! corresponds to a 2% adverse move.

use crate::exchange::{MakerVenue, Side, TakerVenue, Venue};
use crate::utils::decimal::{is_dust, safe_div};
use rust_decimal::Decimal;
use std::time::Duration;
use tracing::{debug, error, warn};

/// One hedged leg held through the hold phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Leg {
    pub venue: Venue,
    /// `Bid` = long, `Ask` = short
    pub side: Side,
    pub entry: Decimal,
}

/// Why the liquidation watch ended the hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HoldExit {
    /// A leg's estimated return fell below the threshold
    Breach { venue: Venue, pnl: Decimal },
    /// The maker position was closed outside the farmer
    Flattened,
}

/// Guards against liquidation by exiting the hold early.
#[derive(Debug, Clone)]
pub struct LiquidationGuard {
    /// Negative fraction, e.g. -0.80
    threshold: Decimal,
    leverage: Decimal,
}

impl LiquidationGuard {
    pub fn new(threshold: Decimal, leverage: u32) -> Self {
        Self {
            threshold,
            leverage: Decimal::from(leverage),
        }
    }

    /// Leveraged return of a leg at `mid`. Losses are negative for both
    /// long and short legs.
    pub fn leg_return(&self, leg: &Leg, mid: Decimal) -> Decimal {
        let change = safe_div(mid - leg.entry, leg.entry);
        match leg.side {
            Side::Bid => change * self.leverage,
            Side::Ask => -change * self.leverage,
        }
    }

    /// First leg whose estimated return is below the threshold.
    pub fn evaluate(&self, legs: &[Leg], mid: Decimal) -> Option<HoldExit> {
        legs.iter().find_map(|leg| {
            let pnl = self.leg_return(leg, mid);
            (pnl < self.threshold).then_some(HoldExit::Breach {
                venue: leg.venue,
                pnl,
            })
        })
    }

    /// Check the legs every `interval` until a breach or an external
    /// flatten is observed. Never returns otherwise; callers race it
    /// against the hold timer.
    pub async fn watch(
        &self,
        maker: &dyn MakerVenue,
        taker: &dyn TakerVenue,
        legs: &[Leg],
        interval: Duration,
        flat_tolerance: Decimal,
    ) -> HoldExit {
        let mut ticker = tokio::time::interval(interval);
        // First tick completes immediately
        ticker.tick().await;

        loop {
            ticker.tick().await;

            match taker.get_best_bid_ask().await {
                Ok(bbo) if bbo.is_valid() => {
                    let mid = bbo.mid();
                    if let Some(exit) = self.evaluate(legs, mid) {
                        if let HoldExit::Breach { venue, pnl } = exit {
                            error!(
                                %venue,
                                pnl_pct = %(pnl * Decimal::ONE_HUNDRED).round_dp(1),
                                threshold_pct = %(self.threshold * Decimal::ONE_HUNDRED),
                                %mid,
                                "🚨 Liquidation risk, ending hold"
                            );
                        }
                        return exit;
                    }
                    debug!(%mid, "Liquidation check passed");
                }
                Ok(bbo) => warn!(bid = %bbo.bid, ask = %bbo.ask, "Invalid taker BBO during hold"),
                Err(e) => warn!(error = %e, "Failed to read taker BBO during hold"),
            }

            match maker.get_position().await {
                Ok(position) if is_dust(position, flat_tolerance) => {
                    warn!("⚠️ Maker position closed externally, ending hold");
                    return HoldExit::Flattened;
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Failed to read maker position during hold"),
            }
        }
    }
}
