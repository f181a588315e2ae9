//! Hedging and position reconciliation between the two venues.
//!
//! Venue position reads may lag their own fills by a few seconds, so every
//! correction here is confirmed by a settle wait and a fresh read rather
//! than by the order acknowledgement.

use crate::alert::AlertSink;
use crate::config::Config;
use crate::exchange::{ClientOrderId, MakerVenue, OrderSide, Side, TakerFill, TakerVenue};
use crate::strategy::CycleError;
use crate::utils::decimal::{is_dust, round_to_precision, sign_flipped};
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

/// Result of the end-of-cycle taker unwind.
#[derive(Debug, Clone, PartialEq)]
pub enum UnwindOutcome {
    /// Nothing to unwind after the settle reads
    AlreadyFlat,
    /// Unwound and verified flat
    Flat,
    /// Position crossed zero; automatic retries stopped
    SignFlip { before: Decimal, after: Decimal },
    /// Still exposed after the single retry
    Stuck { position: Decimal },
    /// Unwind order was refused
    Failed { reason: String },
}

impl UnwindOutcome {
    /// Whether the taker leg ended within dust.
    pub fn is_flat(&self) -> bool {
        matches!(self, UnwindOutcome::AlreadyFlat | UnwindOutcome::Flat)
    }
}

/// Settle waits and tolerances used for reconciliation.
#[derive(Debug, Clone)]
pub struct ReconcileSettings {
    pub corrective_settle: Duration,
    pub unwind_settle: Duration,
    pub unwind_recheck: Duration,
    pub verify_window: Duration,
    pub verify_poll: Duration,
    pub retry_settle: Duration,
    pub fill_dust: Decimal,
    pub unwind_dust: Decimal,
    pub size_decimals: u32,
}

impl ReconcileSettings {
    pub fn from_config(config: &Config) -> Self {
        let timing = &config.timing;
        Self {
            corrective_settle: Duration::from_secs(timing.corrective_settle_secs),
            unwind_settle: Duration::from_secs(timing.unwind_settle_secs),
            unwind_recheck: Duration::from_secs(timing.unwind_recheck_secs),
            verify_window: Duration::from_secs(timing.unwind_verify_window_secs),
            verify_poll: timing.poll_interval(),
            retry_settle: Duration::from_secs(timing.unwind_retry_settle_secs),
            fill_dust: config.risk.fill_dust,
            unwind_dust: config.risk.unwind_dust,
            size_decimals: config.instrument.size_decimals,
        }
    }
}

/// Keeps the taker leg matched to the maker leg.
pub struct Reconciler {
    settings: ReconcileSettings,
    alerts: Arc<dyn AlertSink>,
}

impl Reconciler {
    pub fn new(settings: ReconcileSettings, alerts: Arc<dyn AlertSink>) -> Self {
        Self { settings, alerts }
    }

    /// Neutralize a maker fill on `fill_side`. Any failure is fatal for
    /// the cycle.
    pub async fn hedge(
        &self,
        taker: &dyn TakerVenue,
        fill_side: Side,
        size: Decimal,
        slippage_bps: u32,
    ) -> Result<TakerFill, CycleError> {
        let side = fill_side.hedge();
        info!(%side, %size, slippage_bps, "🛡️ HEDGING on taker venue");

        match taker.place_taker_order(side, size, slippage_bps, None).await {
            Ok(fill) => {
                info!(price = %fill.price, confirmation = %fill.confirmation, "✅ Hedge filled");
                Ok(fill)
            }
            Err(source) => {
                error!(%side, %size, error = %source, "❌ Hedge failed");
                Err(CycleError::HedgeFailed { size, source })
            }
        }
    }

    /// Re-read the settled maker position and hedge any fill that raced
    /// the cancel. Returns the extra size hedged.
    pub async fn corrective_hedge(
        &self,
        maker: &dyn MakerVenue,
        taker: &dyn TakerVenue,
        baseline: Decimal,
        hedged: Decimal,
        fill_side: Side,
        slippage_bps: u32,
    ) -> Result<Decimal, CycleError> {
        sleep(self.settings.corrective_settle).await;

        let settled = match maker.get_position().await {
            Ok(position) => position,
            Err(e) => {
                warn!(error = %e, "Could not re-read maker position, skipping corrective check");
                return Ok(Decimal::ZERO);
            }
        };

        let true_size = round_to_precision((settled - baseline).abs(), self.settings.size_decimals);
        let gap = round_to_precision(true_size - hedged, self.settings.size_decimals);

        if gap <= self.settings.fill_dust {
            debug!(%true_size, %hedged, "Maker fill matches hedge");
            return Ok(Decimal::ZERO);
        }

        warn!(%true_size, %hedged, %gap, "⚠️ Extra maker fill detected after cancel, correcting hedge");
        self.alerts
            .send(&format!(
                "⚠️ Dual fill detected: maker filled {} but hedged {}. Correcting {}.",
                true_size, hedged, gap
            ))
            .await;

        self.hedge(taker, fill_side, gap, slippage_bps).await?;
        Ok(gap)
    }

    /// Best-effort taker unwind of a partial maker close. Errors are
    /// logged; the final unwind picks up anything left behind.
    pub async fn partial_unwind(
        &self,
        taker: &dyn TakerVenue,
        side: OrderSide,
        size: Decimal,
        slippage_bps: u32,
    ) -> bool {
        info!(%side, %size, "🔄 Partial close fill, unwinding increment on taker venue");
        match taker.place_taker_order(side, size, slippage_bps, None).await {
            Ok(_) => true,
            Err(e) => {
                error!(%side, %size, error = %e, "Failed to unwind partial close fill");
                false
            }
        }
    }

    /// Settle, read the true taker residual and flatten it.
    ///
    /// Two reads are taken; when the second is smaller in magnitude it is
    /// trusted as the more recent one. Unwinds carry a clock-derived client
    /// id so a resubmission cannot execute twice. A sign flip stops all
    /// automatic retries; otherwise one retry is made before escalating.
    pub async fn unwind(&self, taker: &dyn TakerVenue, slippage_bps: u32) -> UnwindOutcome {
        let dust = self.settings.unwind_dust;

        info!(settle_secs = self.settings.unwind_settle.as_secs(), "⏳ Waiting for taker position to settle");
        sleep(self.settings.unwind_settle).await;

        let mut residual = match self.read_taker(taker).await {
            Ok(position) => position,
            Err(outcome) => return outcome,
        };

        if !is_dust(residual, dust) {
            sleep(self.settings.unwind_recheck).await;
            if let Ok(second) = taker.get_position().await {
                if second.abs() < residual.abs() {
                    info!(first = %residual, %second, "📉 Taker position updated during settle");
                    residual = second;
                }
            }
        }

        if is_dust(residual, dust) {
            info!("✅ Taker position already flat");
            return UnwindOutcome::AlreadyFlat;
        }

        let side = OrderSide::flatten(residual);
        let size = residual.abs();
        let client_id = ClientOrderId::from_clock();
        info!(%side, %size, %client_id, "🔓 UNWINDING taker leg");

        if let Err(e) = taker
            .place_taker_order(side, size, slippage_bps, Some(client_id))
            .await
        {
            let reason = e.to_string();
            error!(error = %reason, "❌ Unwind order failed");
            self.alerts
                .send(&format!("⚠️ Taker unwind failed: {}. Check balances.", reason))
                .await;
            return UnwindOutcome::Failed { reason };
        }

        let last = self.verify_flat(taker, residual).await;
        if is_dust(last, dust) {
            info!("✅ Taker leg verified flat");
            return UnwindOutcome::Flat;
        }

        if sign_flipped(residual, last, dust) {
            let msg = format!(
                "⚠️ Unwind produced the OPPOSITE position ({} -> {}). Not retrying, manual check required.",
                residual, last
            );
            error!("{}", msg);
            self.alerts.send(&msg).await;
            return UnwindOutcome::SignFlip {
                before: residual,
                after: last,
            };
        }

        let msg = format!("⚠️ Unwind verification failed, {} remaining. Retrying once.", last);
        warn!("{}", msg);
        self.alerts.send(&msg).await;

        let retry_id = ClientOrderId::from_clock();
        if let Err(e) = taker
            .place_taker_order(OrderSide::flatten(last), last.abs(), slippage_bps, Some(retry_id))
            .await
        {
            let reason = e.to_string();
            error!(error = %reason, "❌ Unwind retry failed");
            self.alerts
                .send(&format!("🚨 CRITICAL: taker unwind retry failed ({}), {} open.", reason, last))
                .await;
            return UnwindOutcome::Failed { reason };
        }

        sleep(self.settings.retry_settle).await;
        let position = taker.get_position().await.unwrap_or(last);

        if sign_flipped(residual, position, dust) {
            let msg = format!(
                "⚠️ Unwind retry produced the OPPOSITE position ({} -> {}). Manual check required.",
                residual, position
            );
            error!("{}", msg);
            self.alerts.send(&msg).await;
            return UnwindOutcome::SignFlip {
                before: residual,
                after: position,
            };
        }

        if is_dust(position, dust) {
            info!("✅ Taker leg flat after retry");
            return UnwindOutcome::Flat;
        }

        let msg = format!("🚨 CRITICAL: taker unwind blocked, stuck with {}.", position);
        error!("{}", msg);
        self.alerts.send(&msg).await;
        UnwindOutcome::Stuck { position }
    }

    async fn read_taker(&self, taker: &dyn TakerVenue) -> Result<Decimal, UnwindOutcome> {
        match taker.get_position().await {
            Ok(position) => Ok(position),
            Err(e) => {
                let reason = e.to_string();
                error!(error = %reason, "Cannot read taker position for unwind");
                self.alerts
                    .send(&format!("⚠️ Cannot read taker position for unwind: {}", reason))
                    .await;
                Err(UnwindOutcome::Failed { reason })
            }
        }
    }

    /// Poll until flat, a sign flip, or the verification window closes.
    /// Returns the last position read.
    async fn verify_flat(&self, taker: &dyn TakerVenue, before: Decimal) -> Decimal {
        let dust = self.settings.unwind_dust;
        let deadline = Instant::now() + self.settings.verify_window;
        let mut last = before;

        while Instant::now() < deadline {
            sleep(self.settings.verify_poll).await;
            match taker.get_position().await {
                Ok(position) => last = position,
                Err(e) => {
                    debug!(error = %e, "Taker read failed during unwind verification");
                    continue;
                }
            }

            if is_dust(last, dust) {
                break;
            }
            if sign_flipped(before, last, dust) {
                warn!(%before, after = %last, "🚨 Position flipped sign during unwind");
                break;
            }
        }

        last
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::MockAlertSink;
    use crate::exchange::mock::{MockMakerVenue, MockMarket, MockTakerVenue};
    use rust_decimal_macros::dec;

    fn market() -> MockMarket {
        MockMarket::new(dec!(50000), dec!(10))
    }

    fn reconciler(alerts: MockAlertSink) -> Reconciler {
        Reconciler::new(
            ReconcileSettings::from_config(&Config::default()),
            Arc::new(alerts),
        )
    }

    fn quiet() -> MockAlertSink {
        let mut alerts = MockAlertSink::new();
        alerts.expect_send().returning(|_| ());
        alerts
    }

    // ===== Hedging =====

    #[tokio::test(start_paused = true)]
    async fn test_hedge_failure_is_fatal() {
        let taker = MockTakerVenue::new(market());
        taker.fail_next_orders(1).await;

        let result = reconciler(quiet())
            .hedge(&taker, Side::Bid, dec!(0.01), 10)
            .await;
        assert!(matches!(result, Err(CycleError::HedgeFailed { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_corrective_hedge_covers_raced_fill() {
        let maker = MockMakerVenue::new(market());
        let taker = MockTakerVenue::new(market());
        // Maker actually filled 0.013 but only 0.01 was hedged
        maker.set_position(dec!(0.013)).await;
        taker.set_position(dec!(-0.01)).await;

        let mut alerts = MockAlertSink::new();
        alerts
            .expect_send()
            .withf(|text| text.contains("Dual fill"))
            .times(1)
            .returning(|_| ());

        let extra = reconciler(alerts)
            .corrective_hedge(&maker, &taker, Decimal::ZERO, dec!(0.01), Side::Bid, 10)
            .await
            .unwrap();

        assert_eq!(extra, dec!(0.003));
        assert_eq!(taker.state().await.position, dec!(-0.013));
    }

    #[tokio::test(start_paused = true)]
    async fn test_corrective_hedge_noop_when_matched() {
        let maker = MockMakerVenue::new(market());
        let taker = MockTakerVenue::new(market());
        maker.set_position(dec!(-0.01)).await;

        let extra = reconciler(MockAlertSink::new())
            .corrective_hedge(&maker, &taker, Decimal::ZERO, dec!(0.01), Side::Ask, 10)
            .await
            .unwrap();

        assert_eq!(extra, Decimal::ZERO);
        assert!(taker.state().await.orders.is_empty());
    }

    // ===== Unwind =====

    #[tokio::test(start_paused = true)]
    async fn test_unwind_flattens_residual() {
        let taker = MockTakerVenue::new(market());
        taker.set_position(dec!(-0.02)).await;

        let outcome = reconciler(MockAlertSink::new()).unwind(&taker, 10).await;

        assert_eq!(outcome, UnwindOutcome::Flat);
        let state = taker.state().await;
        assert_eq!(state.position, Decimal::ZERO);
        assert_eq!(state.orders[0].side, OrderSide::Buy);
        assert!(state.orders[0].client_id.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unwind_trusts_smaller_second_read() {
        let taker = MockTakerVenue::new(market());
        // First read lags a partial unwind that already happened
        taker.push_stale_read(dec!(-0.02)).await;
        taker.set_position(dec!(-0.005)).await;

        let outcome = reconciler(MockAlertSink::new()).unwind(&taker, 10).await;

        assert_eq!(outcome, UnwindOutcome::Flat);
        let state = taker.state().await;
        assert_eq!(state.orders.len(), 1);
        assert_eq!(state.orders[0].size, dec!(0.005));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unwind_dust_is_already_flat() {
        let taker = MockTakerVenue::new(market());
        taker.set_position(dec!(0.000004)).await;

        let outcome = reconciler(MockAlertSink::new()).unwind(&taker, 10).await;
        assert_eq!(outcome, UnwindOutcome::AlreadyFlat);
        assert!(taker.state().await.orders.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sign_flip_halts_retries() {
        let taker = MockTakerVenue::new(market());
        taker.set_position(dec!(0.01)).await;
        taker.set_overshoot(dec!(2)).await;

        let mut alerts = MockAlertSink::new();
        alerts
            .expect_send()
            .withf(|text| text.contains("OPPOSITE"))
            .times(1)
            .returning(|_| ());

        let outcome = reconciler(alerts).unwind(&taker, 10).await;

        assert_eq!(
            outcome,
            UnwindOutcome::SignFlip {
                before: dec!(0.01),
                after: dec!(-0.01),
            }
        );
        // Exactly one order, no retry
        assert_eq!(taker.state().await.orders.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_once_then_escalate() {
        let taker = MockTakerVenue::new(market());
        taker.set_position(dec!(0.01)).await;
        taker.drop_next_orders(2).await;

        let mut alerts = MockAlertSink::new();
        alerts
            .expect_send()
            .withf(|text| text.contains("Retrying once"))
            .times(1)
            .returning(|_| ());
        alerts
            .expect_send()
            .withf(|text| text.contains("CRITICAL"))
            .times(1)
            .returning(|_| ());

        let outcome = reconciler(alerts).unwind(&taker, 10).await;

        assert_eq!(outcome, UnwindOutcome::Stuck { position: dec!(0.01) });
        let state = taker.state().await;
        assert_eq!(state.orders.len(), 2);
        assert_ne!(state.orders[0].client_id, state.orders[1].client_id);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_recovers_dropped_order() {
        let taker = MockTakerVenue::new(market());
        taker.set_position(dec!(-0.01)).await;
        taker.drop_next_orders(1).await;

        let outcome = reconciler(quiet()).unwind(&taker, 10).await;

        assert_eq!(outcome, UnwindOutcome::Flat);
        assert_eq!(taker.state().await.orders.len(), 2);
    }
}
