//! Force both legs flat after a fatal cycle error, or hedge away the net
//! exposure left behind by a crash.

use crate::alert::AlertSink;
use crate::exchange::{
    ClientOrderId, MakerVenue, OrderId, OrderSide, Side, TakerFill, TakerVenue, VenueError,
};
use crate::utils::decimal::{is_dust, round_to_tick};
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

/// What the emergency unwind did on each venue.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EmergencyReport {
    /// Maker position found and the size sent to close it
    pub maker_closed: Option<Decimal>,
    /// Taker position found and the size sent to close it
    pub taker_closed: Option<Decimal>,
    /// Set when manual action is needed
    pub manual_action: bool,
}

/// Signed positions on both venues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exposure {
    pub maker: Decimal,
    pub taker: Decimal,
}

impl Exposure {
    pub async fn read(maker: &dyn MakerVenue, taker: &dyn TakerVenue) -> Result<Self, VenueError> {
        Ok(Self {
            maker: maker.get_position().await?,
            taker: taker.get_position().await?,
        })
    }

    pub fn net(&self) -> Decimal {
        self.maker + self.taker
    }
}

pub struct EmergencyUnwind {
    alerts: Arc<dyn AlertSink>,
    flat_tolerance: Decimal,
    price_tick: Decimal,
    slippage_bps: u32,
}

impl EmergencyUnwind {
    pub fn new(
        alerts: Arc<dyn AlertSink>,
        flat_tolerance: Decimal,
        price_tick: Decimal,
        slippage_bps: u32,
    ) -> Self {
        Self {
            alerts,
            flat_tolerance,
            price_tick,
            slippage_bps,
        }
    }

    /// Cancel every resting order, then close the maker position at the
    /// touch and the taker position with wide slippage. Never fails; every
    /// problem is alerted for manual follow-up.
    #[instrument(skip_all, fields(resting = resting.len()))]
    pub async fn run(
        &self,
        maker: &dyn MakerVenue,
        taker: &dyn TakerVenue,
        resting: &[OrderId],
    ) -> EmergencyReport {
        warn!("🚨 EMERGENCY UNWIND, forcing all positions flat");

        for id in resting {
            if let Err(e) = maker.cancel_order(id).await {
                debug!(order_id = %id, error = %e, "Cancel failed (may already be filled)");
            }
        }

        let mut report = EmergencyReport::default();

        if let Err(e) = self.close_maker(maker, &mut report).await {
            error!(error = %e, "Emergency maker close failed");
            report.manual_action = true;
            self.alerts
                .send(&format!(
                    "🚨 EMERGENCY CLOSE FAILED on maker venue: {}. Manual intervention needed!",
                    e
                ))
                .await;
        }

        if let Err(e) = self.close_taker(taker, &mut report).await {
            error!(error = %e, "Emergency taker close failed");
            report.manual_action = true;
            self.alerts
                .send(&format!(
                    "🚨 EMERGENCY CLOSE FAILED on taker venue: {}. Manual intervention needed!",
                    e
                ))
                .await;
        }

        report
    }

    /// Hedge the net exposure across both venues on the taker venue,
    /// leaving the individual legs open. Returns `None` when already
    /// neutral.
    #[instrument(skip_all)]
    pub async fn neutralize(
        &self,
        maker: &dyn MakerVenue,
        taker: &dyn TakerVenue,
    ) -> Result<Option<TakerFill>, VenueError> {
        let exposure = Exposure::read(maker, taker).await?;
        let net = exposure.net();
        if is_dust(net, self.flat_tolerance) {
            info!(maker = %exposure.maker, taker = %exposure.taker, "✅ Already delta neutral");
            return Ok(None);
        }

        let side = OrderSide::flatten(net);
        let size = net.abs();
        warn!(%side, %size, maker = %exposure.maker, taker = %exposure.taker, "🚨 Hedging net exposure");
        let fill = taker
            .place_taker_order(side, size, self.slippage_bps, Some(ClientOrderId::from_clock()))
            .await?;

        self.alerts
            .send(&format!(
                "🚨 EMERGENCY HEDGE: {} {} on taker venue @ ${}. Net exposure ≈ 0",
                side, fill.size, fill.price
            ))
            .await;
        Ok(Some(fill))
    }

    async fn close_maker(
        &self,
        maker: &dyn MakerVenue,
        report: &mut EmergencyReport,
    ) -> Result<(), VenueError> {
        let position = maker.get_position().await?;
        if is_dust(position, self.flat_tolerance) {
            return Ok(());
        }

        let side = if position > Decimal::ZERO { Side::Ask } else { Side::Bid };
        let size = position.abs();

        let bbo = match maker.get_best_bid_ask().await {
            Ok(bbo) if bbo.is_valid() => bbo,
            _ => {
                error!(%position, "Cannot read maker BBO for emergency close");
                report.manual_action = true;
                self.alerts
                    .send(&format!(
                        "🚨 EMERGENCY: cannot close maker position ({}). Close it manually!",
                        position
                    ))
                    .await;
                return Ok(());
            }
        };

        // Cross at the touch rather than sweeping the book
        let price = match side {
            Side::Ask => round_to_tick(bbo.bid, self.price_tick),
            Side::Bid => round_to_tick(bbo.ask, self.price_tick),
        };

        maker.place_limit_order(side, price, size, false).await?;
        warn!(%side, %size, %price, "Emergency maker close sent");
        report.maker_closed = Some(size);
        Ok(())
    }

    async fn close_taker(
        &self,
        taker: &dyn TakerVenue,
        report: &mut EmergencyReport,
    ) -> Result<(), VenueError> {
        let position = taker.get_position().await?;
        if is_dust(position, self.flat_tolerance) {
            return Ok(());
        }

        let side = OrderSide::flatten(position);
        let size = position.abs();
        taker
            .place_taker_order(side, size, self.slippage_bps, None)
            .await?;
        warn!(%side, %size, slippage_bps = self.slippage_bps, "Emergency taker close sent");
        report.taker_closed = Some(size);
        Ok(())
    }
}
