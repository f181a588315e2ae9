//! Pre-cycle collateral checks.

use crate::config::Tunables;
use crate::exchange::{MakerVenue, TakerVenue, Venue, VenueError};
use rust_decimal::Decimal;
use tracing::{debug, warn};

/// Outcome of the pre-cycle collateral gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollateralCheck {
    /// Both venues can carry a max-size cycle
    Sufficient,
    /// One venue is short of free collateral
    Insufficient {
        venue: Venue,
        free: Decimal,
        required: Decimal,
    },
}

impl CollateralCheck {
    pub fn is_sufficient(&self) -> bool {
        matches!(self, CollateralCheck::Sufficient)
    }
}

/// Refuses to start a cycle unless both venues hold enough free collateral
/// to margin the largest possible order with headroom.
#[derive(Debug, Clone)]
pub struct CollateralGate {
    safety_factor: Decimal,
}

impl CollateralGate {
    pub fn new(safety_factor: Decimal) -> Self {
        Self { safety_factor }
    }

    /// Required free collateral = factor * (max order size / leverage).
    pub fn required(&self, tunables: &Tunables) -> Decimal {
        let leverage = Decimal::from(tunables.leverage.max(1));
        self.safety_factor * tunables.order_size_usd.max / leverage
    }

    /// Compare free collateral on both venues against the requirement.
    pub fn evaluate(
        &self,
        maker_free: Decimal,
        taker_free: Decimal,
        tunables: &Tunables,
    ) -> CollateralCheck {
        let required = self.required(tunables);

        for (venue, free) in [(Venue::Maker, maker_free), (Venue::Taker, taker_free)] {
            if free < required {
                warn!(%venue, %free, %required, "Insufficient free collateral");
                return CollateralCheck::Insufficient {
                    venue,
                    free,
                    required,
                };
            }
        }

        debug!(%maker_free, %taker_free, %required, "Collateral check passed");
        CollateralCheck::Sufficient
    }

    /// Read both balances and evaluate.
    pub async fn check(
        &self,
        maker: &dyn MakerVenue,
        taker: &dyn TakerVenue,
        tunables: &Tunables,
    ) -> Result<CollateralCheck, VenueError> {
        let maker_balance = maker.get_balance().await?;
        let taker_balance = taker.get_balance().await?;
        Ok(self.evaluate(
            maker_balance.free_collateral,
            taker_balance.free_collateral,
            tunables,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Bounds;
    use rust_decimal_macros::dec;

    fn tunables() -> Tunables {
        Tunables {
            order_size_usd: Bounds::new(dec!(1000), dec!(1300)),
            leverage: 40,
            ..Tunables::default()
        }
    }

    #[test]
    fn test_required_collateral() {
        let gate = CollateralGate::new(dec!(1.5));
        // 1.5 * 1300 / 40
        assert_eq!(gate.required(&tunables()), dec!(48.75));
    }

    #[test]
    fn test_either_venue_short_blocks() {
        let gate = CollateralGate::new(dec!(1.5));
        let t = tunables();

        assert!(gate.evaluate(dec!(100), dec!(100), &t).is_sufficient());
        assert!(gate.evaluate(dec!(48.75), dec!(48.75), &t).is_sufficient());

        assert_eq!(
            gate.evaluate(dec!(100), dec!(48), &t),
            CollateralCheck::Insufficient {
                venue: Venue::Taker,
                free: dec!(48),
                required: dec!(48.75),
            }
        );
        assert!(matches!(
            gate.evaluate(dec!(10), dec!(100), &t),
            CollateralCheck::Insufficient { venue: Venue::Maker, .. }
        ));
    }
}
