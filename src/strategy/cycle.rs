//! Cycle state machine.
//!
//! One cycle runs `IDLE → OPENING → HEDGING → HOLDING → CLOSING →
//! UNWINDING → COOLDOWN → IDLE` against the two venues. Only one cycle is
//! ever in flight. The `enabled` flag on [`ControlHandle`] gates entry
//! into a new cycle; any [`CycleError`] escaping a phase triggers an
//! emergency unwind, disables trading and the loop carries on after a
//! backoff.

use super::accumulator::FillAccumulator;
use super::opening::{OpenFill, OpeningOutcome};
use super::pricing;
use super::CycleError;
use crate::alert::AlertSink;
use crate::config::{Config, ConfigHandle};
use crate::control::{AccountSnapshot, ControlHandle, CycleState, CycleStatus, CycleSummary};
use crate::exchange::{MakerVenue, OrderId, Side, TakerVenue, Venue, VenueError};
use crate::risk::{
    CollateralCheck, CollateralGate, EmergencyUnwind, HoldExit, Leg, LiquidationGuard,
    ReconcileSettings, Reconciler, UnwindOutcome,
};
use crate::utils::decimal::{is_dust, safe_div};
use chrono::Utc;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

/// State of the cycle in flight.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Cycle {
    pub number: u64,
    pub state: CycleState,
    pub open_side: Option<Side>,
    /// Total maker size opened and hedged
    pub open_size: Decimal,
    /// Size-weighted maker entry price
    pub open_price: Option<Decimal>,
    /// Size-weighted taker hedge price
    pub hedge_price: Option<Decimal>,
    pub bid_order: Option<OrderId>,
    pub ask_order: Option<OrderId>,
    pub close_order: Option<OrderId>,
    pub hold_duration: Duration,
    pub cooldown_duration: Duration,
    hedged_size: Decimal,
}

impl Cycle {
    fn next(number: u64) -> Self {
        Self {
            number,
            ..Self::default()
        }
    }

    fn record_open(&mut self, side: Side, size: Decimal, price: Decimal) {
        self.open_side.get_or_insert(side);
        self.open_price = Some(weighted(self.open_price, self.open_size, price, size));
        self.open_size += size;
    }

    fn record_hedge(&mut self, size: Decimal, price: Decimal) {
        self.hedge_price = Some(weighted(self.hedge_price, self.hedged_size, price, size));
        self.hedged_size += size;
    }

    fn take_orders(&mut self) -> Vec<OrderId> {
        [
            self.bid_order.take(),
            self.ask_order.take(),
            self.close_order.take(),
        ]
        .into_iter()
        .flatten()
        .collect()
    }
}

fn weighted(avg: Option<Decimal>, size: Decimal, price: Decimal, add: Decimal) -> Decimal {
    match avg {
        Some(avg) if !(size + add).is_zero() => safe_div(avg * size + price * add, size + add),
        _ => price,
    }
}

/// Equity change on each venue since startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionPnl {
    pub maker: Decimal,
    pub taker: Decimal,
    pub total: Decimal,
}

/// Drives cycles against a maker venue and a taker venue.
pub struct CycleFarmer {
    pub(super) maker: Arc<dyn MakerVenue>,
    pub(super) taker: Arc<dyn TakerVenue>,
    pub(super) config: Config,
    pub(super) tunables: ConfigHandle,
    pub(super) control: ControlHandle,
    pub(super) alerts: Arc<dyn AlertSink>,
    pub(super) reconciler: Reconciler,
    emergency: EmergencyUnwind,
    collateral: CollateralGate,
    pub(super) cycle: Cycle,
    cycles_completed: u64,
    last_summary: Option<CycleSummary>,
    start_equity: Option<(Decimal, Decimal)>,
    account: Option<AccountSnapshot>,
}

impl CycleFarmer {
    /// Tunables are read through the control handle's [`ConfigHandle`];
    /// the other sections of `config` are fixed for the farmer's lifetime.
    pub fn new(
        config: Config,
        maker: Arc<dyn MakerVenue>,
        taker: Arc<dyn TakerVenue>,
        alerts: Arc<dyn AlertSink>,
        control: ControlHandle,
    ) -> Self {
        let reconciler = Reconciler::new(ReconcileSettings::from_config(&config), alerts.clone());
        let emergency = EmergencyUnwind::new(
            alerts.clone(),
            config.risk.fill_dust,
            config.instrument.price_tick,
            config.risk.emergency_slippage_bps,
        );
        let collateral = CollateralGate::new(config.risk.collateral_safety_factor);

        Self {
            maker,
            taker,
            tunables: control.config().clone(),
            config,
            control,
            alerts,
            reconciler,
            emergency,
            collateral,
            cycle: Cycle::default(),
            cycles_completed: 0,
            last_summary: None,
            start_equity: None,
            account: None,
        }
    }

    pub fn cycle(&self) -> &Cycle {
        &self.cycle
    }

    pub fn cycles_completed(&self) -> u64 {
        self.cycles_completed
    }

    pub fn last_summary(&self) -> Option<&CycleSummary> {
        self.last_summary.as_ref()
    }

    /// Run cycles until shutdown is requested.
    pub async fn run(&mut self) {
        self.initialize().await;

        while !self.control.is_shutdown_requested() {
            if !self.control.is_enabled() {
                if self.cycle.state != CycleState::Paused {
                    info!("⏸️  Bot paused, waiting for resume");
                    self.set_state(CycleState::Paused);
                }
                self.idle(Duration::from_secs(self.config.timing.pause_poll_secs))
                    .await;
                continue;
            }

            if let Err(e) = self.run_cycle().await {
                self.handle_cycle_error(e).await;
            }
        }

        self.shutdown().await;
    }

    /// Check for leftover positions and capture starting equity.
    pub async fn initialize(&mut self) {
        info!("─── Initializing ───");
        let dust = self.config.risk.fill_dust;

        let positions = [
            (Venue::Maker, self.maker.get_position().await),
            (Venue::Taker, self.taker.get_position().await),
        ];
        for (venue, position) in positions {
            match position {
                Ok(position) if !is_dust(position, dust) => {
                    let msg = format!(
                        "⚠️ Existing {} position detected: {}. Close it manually for a clean start.",
                        venue, position
                    );
                    warn!("{}", msg);
                    self.alerts.send(&msg).await;
                }
                Ok(_) => {}
                Err(e) => warn!(%venue, error = %e, "Failed to read starting position"),
            }
        }

        match (self.maker.get_balance().await, self.taker.get_balance().await) {
            (Ok(maker), Ok(taker)) => {
                info!(maker = %maker.equity, taker = %taker.equity, "💰 Session start equity");
                self.start_equity = Some((maker.equity, taker.equity));
            }
            (Err(e), _) | (_, Err(e)) => error!(error = %e, "Failed to capture start equity"),
        }

        self.refresh_account().await;
        self.set_state(CycleState::Idle);
    }

    /// Equity change since [`initialize`](Self::initialize).
    pub async fn session_pnl(&self) -> Result<Option<SessionPnl>, VenueError> {
        let Some((maker_start, taker_start)) = self.start_equity else {
            return Ok(None);
        };
        let maker = self.maker.get_balance().await?.equity - maker_start;
        let taker = self.taker.get_balance().await?.equity - taker_start;
        Ok(Some(SessionPnl {
            maker,
            taker,
            total: maker + taker,
        }))
    }

    /// Re-read both balances for the operator's balance view. A failed
    /// read keeps the previous snapshot.
    async fn refresh_account(&mut self) {
        match (self.maker.get_balance().await, self.taker.get_balance().await) {
            (Ok(maker), Ok(taker)) => {
                let pnl = self.start_equity;
                self.account = Some(AccountSnapshot {
                    maker,
                    taker,
                    maker_pnl: pnl.map(|(start, _)| maker.equity - start),
                    taker_pnl: pnl.map(|(_, start)| taker.equity - start),
                    updated_at: Utc::now(),
                });
                self.publish();
            }
            (Err(e), _) | (_, Err(e)) => debug!(error = %e, "Balance refresh failed"),
        }
    }

    /// One full cycle. Returns `Ok` when the cycle completed or was skipped.
    pub async fn run_cycle(&mut self) -> Result<(), CycleError> {
        let tunables = self.tunables.snapshot();
        let backoff = Duration::from_secs(self.config.timing.bbo_backoff_secs);

        match self
            .collateral
            .check(self.maker.as_ref(), self.taker.as_ref(), &tunables)
            .await
        {
            Ok(CollateralCheck::Sufficient) => {}
            Ok(CollateralCheck::Insufficient {
                venue,
                free,
                required,
            }) => {
                let msg = format!(
                    "⚠️ LOW BALANCE ({})\nFree: ${}\nRequired: ${}\n🛑 Bot PAUSED. Top up funds, then resume.",
                    venue,
                    free.round_dp(2),
                    required.round_dp(2)
                );
                warn!("{}", msg);
                self.alerts.send(&msg).await;
                self.control.pause();
                return Ok(());
            }
            Err(e) => {
                warn!(error = %e, "Cannot read balances, skipping cycle");
                self.idle(backoff).await;
                return Ok(());
            }
        }

        let Some(mid) = self.taker_mid().await else {
            error!("Cannot fetch taker BBO, skipping cycle");
            self.idle(backoff).await;
            return Ok(());
        };

        let notional = pricing::sample_notional(&tunables.order_size_usd);
        let target = pricing::target_size(notional, mid, self.config.instrument.size_decimals);

        self.cycle = Cycle::next(self.cycle.number + 1);
        info!("{}", "━".repeat(60));
        info!("  🔄 CYCLE {}", self.cycle.number);
        info!("{}", "━".repeat(60));
        info!(%target, %notional, %mid, "🎯 Target");

        let filled = self.open_position(target).await?;
        if filled.is_zero() {
            info!("Nothing filled, abandoning cycle attempt");
            self.set_state(CycleState::Idle);
            return Ok(());
        }

        self.hold().await;
        self.close_position().await?;
        self.unwind().await;
        self.complete_cycle().await;
        self.cooldown().await;
        Ok(())
    }

    /// Accumulate fills toward `target`, hedging each increment. Returns
    /// the total size opened and hedged.
    pub(super) async fn open_position(&mut self, target: Decimal) -> Result<Decimal, CycleError> {
        let risk = &self.config.risk;
        let mut acc = FillAccumulator::new(
            target,
            risk.max_fill_attempts,
            risk.fill_ratio,
            self.config.instrument.size_decimals,
        );

        while acc.should_continue()
            && self.control.is_enabled()
            && !self.control.is_shutdown_requested()
        {
            let remaining = acc.remaining();
            if acc.begin_attempt() > 1 {
                info!(
                    %remaining,
                    locked = ?acc.locked_side(),
                    filled = %acc.total_filled(),
                    %target,
                    "📋 Placing remainder"
                );
            }

            match self.open_step(remaining, acc.locked_side()).await? {
                OpeningOutcome::Filled(fill) => {
                    let hedged = self.hedge_fill(&fill).await?;
                    acc.record_fill(fill.side, hedged);
                }
                OpeningOutcome::NoFill => {
                    self.cancel_open_orders().await;
                    if !acc.total_filled().is_zero() {
                        info!(filled = %acc.total_filled(), "No more fills, proceeding");
                        break;
                    }
                }
                OpeningOutcome::Paused => break,
            }
        }

        if !acc.is_complete() && acc.attempts_exhausted() {
            warn!(
                attempts = acc.attempts(),
                filled = %acc.total_filled(),
                %target,
                "⚠️ Max fill attempts reached"
            );
        }

        Ok(acc.total_filled())
    }

    /// Hedge a maker fill and correct for any fill that raced the cancel.
    async fn hedge_fill(&mut self, fill: &OpenFill) -> Result<Decimal, CycleError> {
        self.set_state(CycleState::Hedging);
        let slippage = self.tunables.snapshot().hedge_slippage_bps;

        let msg = format!(
            "🔔 FILL! {} {} @ ~${} on maker venue",
            fill.side, fill.size, fill.price
        );
        info!("{}", msg);
        self.alerts.send(&msg).await;

        self.cycle.record_open(fill.side, fill.size, fill.price);
        let hedge = self
            .reconciler
            .hedge(self.taker.as_ref(), fill.side, fill.size, slippage)
            .await?;
        self.cycle.record_hedge(fill.size, hedge.price);
        self.publish();

        let extra = self
            .reconciler
            .corrective_hedge(
                self.maker.as_ref(),
                self.taker.as_ref(),
                fill.baseline,
                fill.size,
                fill.side,
                slippage,
            )
            .await?;
        if !extra.is_zero() {
            self.cycle.record_open(fill.side, extra, fill.price);
            self.cycle.record_hedge(extra, hedge.price);
            self.publish();
        }

        self.alerts
            .send("✅ Hedge complete! Both legs open. Net exposure ≈ 0")
            .await;
        Ok(fill.size + extra)
    }

    /// Hold for a sampled duration while watching liquidation risk. Ends
    /// early on a risk breach, an external flatten or shutdown.
    pub(super) async fn hold(&mut self) {
        let tunables = self.tunables.snapshot();
        let duration = pricing::sample_duration(&tunables.hold_secs);
        self.cycle.hold_duration = duration;
        self.set_state(CycleState::Holding);

        let Some(side) = self.cycle.open_side else {
            return;
        };
        let entry = self.cycle.open_price.unwrap_or_default();
        let legs = [
            Leg {
                venue: Venue::Maker,
                side,
                entry,
            },
            Leg {
                venue: Venue::Taker,
                side: side.opposite(),
                entry: self.cycle.hedge_price.unwrap_or(entry),
            },
        ];
        let guard = LiquidationGuard::new(self.config.risk.liquidation_threshold, tunables.leverage);
        let check_interval = self.config.timing.liquidation_check();

        info!(
            minutes = %(Decimal::from(duration.as_secs()) / Decimal::from(60)).round_dp(1),
            check_secs = check_interval.as_secs(),
            "⏳ HOLDING (monitoring liquidation risk)"
        );

        let exit = tokio::select! {
            _ = sleep(duration) => None,
            exit = guard.watch(
                self.maker.as_ref(),
                self.taker.as_ref(),
                &legs,
                check_interval,
                self.config.risk.fill_dust,
            ) => Some(exit),
            _ = self.control.shutdown_requested() => {
                info!("Shutdown requested, ending hold early");
                None
            }
            _ = self.hold_status(duration) => None,
        };

        match exit {
            Some(HoldExit::Breach { venue, pnl }) => {
                let msg = format!(
                    "🚨 LIQUIDATION RISK! {} leg at {}% (threshold {}%). Closing early!",
                    venue,
                    (pnl * Decimal::ONE_HUNDRED).round_dp(1),
                    self.config.risk.liquidation_threshold * Decimal::ONE_HUNDRED
                );
                warn!("{}", msg);
                self.alerts.send(&msg).await;
            }
            Some(HoldExit::Flattened) => {
                self.alerts
                    .send("⚠️ Maker position closed externally, ending hold early")
                    .await;
            }
            None => info!("⏳ Hold complete"),
        }
    }

    async fn hold_status(&self, duration: Duration) {
        let interval = self.config.timing.status_interval().max(Duration::from_secs(1));
        let start = Instant::now();
        loop {
            sleep(interval).await;
            let elapsed = start.elapsed();
            info!(
                elapsed_secs = elapsed.as_secs(),
                remaining_secs = duration.saturating_sub(elapsed).as_secs(),
                side = ?self.cycle.open_side,
                size = %self.cycle.open_size,
                "   ⏳ Holding..."
            );
        }
    }

    /// Flatten any residual taker exposure. A leg that does not end flat
    /// disables trading until an operator resumes.
    pub(super) async fn unwind(&mut self) -> UnwindOutcome {
        self.set_state(CycleState::Unwinding);
        let slippage = self.tunables.snapshot().hedge_slippage_bps;

        let outcome = self.reconciler.unwind(self.taker.as_ref(), slippage).await;
        if !outcome.is_flat() {
            warn!(?outcome, "Taker leg not flat, pausing until resumed");
            self.control.pause();
        }

        if let (Ok(maker), Ok(taker)) =
            (self.maker.get_position().await, self.taker.get_position().await)
        {
            let net = maker + taker;
            if is_dust(net, self.config.risk.fill_dust) {
                debug!(%maker, %taker, "Net exposure flat");
            } else {
                warn!(%maker, %taker, %net, "⚠️ Net exposure after unwind");
            }
        }

        outcome
    }

    async fn complete_cycle(&mut self) {
        let Some(side) = self.cycle.open_side else {
            return;
        };
        let summary = CycleSummary::new(
            side,
            self.cycle.open_size,
            self.cycle.open_price.unwrap_or_default(),
        );

        info!(
            "\n{line}\n  Cycle {} Complete\n  Opened: {} {} @ ${}\n  Volume generated: ${}\n{line}",
            self.cycle.number,
            summary.side,
            summary.size,
            summary.price,
            summary.volume_usd.round_dp(2),
            line = "─".repeat(40)
        );
        self.alerts
            .send(&format!(
                "✅ Cycle {} complete\nSide: {}\nSize: {}\nVol: ${}\nStatus: Cooling down...",
                self.cycle.number,
                summary.side,
                summary.size,
                summary.volume_usd.round_dp(2)
            ))
            .await;

        match self.session_pnl().await {
            Ok(Some(pnl)) => info!(maker = %pnl.maker, taker = %pnl.taker, total = %pnl.total, "💰 Session PnL"),
            Ok(None) => {}
            Err(e) => debug!(error = %e, "Session PnL unavailable"),
        }

        self.cycles_completed += 1;
        self.last_summary = Some(summary);
        self.refresh_account().await;
        self.publish();
    }

    async fn cooldown(&mut self) {
        let duration = pricing::sample_duration(&self.tunables.snapshot().cooldown_secs);
        self.cycle.cooldown_duration = duration;
        self.set_state(CycleState::Cooldown);

        info!(
            minutes = %(Decimal::from(duration.as_secs()) / Decimal::from(60)).round_dp(1),
            "💤 Cooling down"
        );
        self.idle(duration).await;
        self.set_state(CycleState::Idle);
    }

    /// Emergency-unwind both legs, disable trading and back off.
    pub async fn handle_cycle_error(&mut self, err: CycleError) {
        error!(error = %err, "❌ Cycle error");
        self.alerts
            .send(&format!("🚨 CRITICAL CYCLE ERROR: {}\nPausing bot.", err))
            .await;
        self.control.pause();

        let resting = self.cycle.take_orders();
        self.set_state(CycleState::Unwinding);
        let report = self
            .emergency
            .run(self.maker.as_ref(), self.taker.as_ref(), &resting)
            .await;
        if report.manual_action {
            error!(?report, "Emergency unwind incomplete, manual intervention required");
        }

        self.cycle = Cycle::next(self.cycle.number);
        self.publish();
        self.idle(Duration::from_secs(self.config.timing.error_backoff_secs))
            .await;
    }

    /// Cancel resting orders, warn about open exposure and release the
    /// taker connection.
    pub async fn shutdown(&mut self) {
        info!("─── Shutting down ───");

        for id in self.cycle.take_orders() {
            if let Err(e) = self.maker.cancel_order(&id).await {
                debug!(order_id = %id, error = %e, "Cancel failed during shutdown");
            }
        }

        let dust = self.config.risk.fill_dust;
        let positions = [
            (Venue::Maker, self.maker.get_position().await),
            (Venue::Taker, self.taker.get_position().await),
        ];
        for (venue, position) in positions {
            if let Ok(position) = position {
                if !is_dust(position, dust) {
                    let msg = format!(
                        "⚠️ SHUTDOWN WARNING: open {} position {}. Close it manually!",
                        venue, position
                    );
                    warn!("{}", msg);
                    self.alerts.send(&msg).await;
                }
            }
        }

        if let Err(e) = self.taker.close().await {
            warn!(error = %e, "Failed to close taker connection");
        }

        if let Ok(Some(pnl)) = self.session_pnl().await {
            info!(total = %pnl.total, "💰 Session PnL");
        }

        self.refresh_account().await;
        self.set_state(CycleState::Idle);
        info!(cycles = self.cycles_completed, "─── Shutdown complete ───");
    }

    // ===== Shared helpers =====

    pub(super) async fn taker_mid(&self) -> Option<Decimal> {
        match self.taker.get_best_bid_ask().await {
            Ok(bbo) if bbo.is_valid() => Some(bbo.mid()),
            Ok(bbo) => {
                warn!(bid = %bbo.bid, ask = %bbo.ask, "Invalid taker BBO");
                None
            }
            Err(e) => {
                warn!(error = %e, "Failed to read taker BBO");
                None
            }
        }
    }

    /// Cancel the opening quotes. Cancels are idempotent; failures only
    /// mean the order already filled.
    pub(super) async fn cancel_open_orders(&mut self) {
        let ids = [self.cycle.bid_order.take(), self.cycle.ask_order.take()];
        for id in ids.into_iter().flatten() {
            if let Err(e) = self.maker.cancel_order(&id).await {
                debug!(order_id = %id, error = %e, "Cancel failed (may already be filled)");
            }
        }
        self.publish();
    }

    /// Sleep that ends early on shutdown.
    pub(super) async fn idle(&self, duration: Duration) {
        tokio::select! {
            _ = sleep(duration) => {}
            _ = self.control.shutdown_requested() => {}
        }
    }

    pub(super) fn set_state(&mut self, state: CycleState) {
        self.cycle.state = state;
        self.publish();
    }

    pub(super) fn publish(&self) {
        let cycle = &self.cycle;
        let now = Utc::now();
        let until = |duration: Duration| {
            chrono::Duration::from_std(duration)
                .ok()
                .map(|d| now + d)
        };

        let status = CycleStatus {
            state: cycle.state,
            cycles_completed: self.cycles_completed,
            side: cycle.open_side,
            size: cycle.open_size,
            open_price: cycle.open_price,
            hedge_price: cycle.hedge_price,
            bid_order: cycle.bid_order.clone(),
            ask_order: cycle.ask_order.clone(),
            close_order: cycle.close_order.clone(),
            hold_until: (cycle.state == CycleState::Holding)
                .then(|| until(cycle.hold_duration))
                .flatten(),
            cooldown_until: (cycle.state == CycleState::Cooldown)
                .then(|| until(cycle.cooldown_duration))
                .flatten(),
            last_summary: self.last_summary.clone(),
            account: self.account.clone(),
        };
        self.control.update_status(|s| *s = status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::MockAlertSink;
    use crate::exchange::mock::ScriptedFill;
    use crate::exchange::{DryRunMaker, DryRunTaker, OrderSide};
    use crate::strategy::testing::{harness, harness_with_alerts, test_config, Harness};
    use rust_decimal_macros::dec;

    // ===== Fill accumulation =====

    #[tokio::test(start_paused = true)]
    async fn test_partial_fills_accumulate_to_target() {
        let Harness {
            mut farmer,
            maker,
            taker,
            ..
        } = harness(test_config());

        maker
            .push_fill(ScriptedFill::next_poll(Side::Bid, dec!(0.015)))
            .await;
        maker
            .push_fill(ScriptedFill::next_poll(Side::Bid, dec!(0.005)))
            .await;

        // 1000 USD at mid 50,000
        let target = pricing::target_size(dec!(1000), dec!(50000), 5);
        assert_eq!(target, dec!(0.02));

        let filled = farmer.open_position(target).await.unwrap();
        assert_eq!(filled, dec!(0.02));
        assert_eq!(farmer.cycle.open_side, Some(Side::Bid));

        // Remainder was requested on the locked side only
        let placed = maker.state().await.placed;
        assert_eq!(placed.len(), 3);
        assert_eq!(placed[2].side, Side::Bid);
        assert_eq!(placed[2].size, dec!(0.005));

        let hedges: Vec<_> = taker
            .state()
            .await
            .orders
            .iter()
            .map(|o| (o.side, o.size))
            .collect();
        assert_eq!(
            hedges,
            vec![(OrderSide::Sell, dec!(0.015)), (OrderSide::Sell, dec!(0.005))]
        );

        let net = maker.get_position().await.unwrap() + taker.get_position().await.unwrap();
        assert!(is_dust(net, dec!(0.000005)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fill_at_timeout_is_hedged() {
        let mut config = test_config();
        config.risk.max_fill_attempts = 1;
        let Harness {
            mut farmer,
            maker,
            taker,
            ..
        } = harness(config);

        maker
            .push_fill(ScriptedFill::on_cancel(Side::Ask, dec!(0.004)))
            .await;

        let start = Instant::now();
        let filled = farmer.open_position(dec!(0.02)).await.unwrap();

        assert!(start.elapsed() >= Duration::from_secs(300));
        assert_eq!(filled, dec!(0.004));
        assert_eq!(farmer.cycle.open_side, Some(Side::Ask));
        assert_eq!(taker.state().await.position, dec!(0.004));
        assert_eq!(maker.state().await.position, dec!(-0.004));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_fill_exhausts_attempts_without_exposure() {
        let mut config = test_config();
        config.risk.max_fill_attempts = 2;
        let Harness {
            mut farmer,
            maker,
            taker,
            ..
        } = harness(config);

        let filled = farmer.open_position(dec!(0.02)).await.unwrap();

        assert_eq!(filled, Decimal::ZERO);
        assert!(maker.state().await.orders.is_empty());
        assert!(taker.state().await.orders.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dual_fill_race_is_corrected() {
        let Harness {
            mut farmer,
            maker,
            taker,
            ..
        } = harness(test_config());

        // Bid fills 0.015, then the rest of the bid fills as it is cancelled
        maker
            .push_fill(ScriptedFill::next_poll(Side::Bid, dec!(0.015)))
            .await;
        maker
            .push_fill(ScriptedFill::on_cancel(Side::Bid, dec!(0.005)))
            .await;

        let filled = farmer.open_position(dec!(0.02)).await.unwrap();

        assert_eq!(filled, dec!(0.02));
        assert_eq!(taker.state().await.position, dec!(-0.02));
        assert_eq!(taker.state().await.orders.len(), 2);
    }

    // ===== Full cycle =====

    #[tokio::test(start_paused = true)]
    async fn test_full_cycle_returns_to_neutral() {
        let Harness {
            mut farmer,
            maker,
            taker,
            control,
            ..
        } = harness(test_config());
        maker.set_auto_fill(true).await;

        farmer.initialize().await;
        farmer.run_cycle().await.unwrap();

        assert_eq!(maker.get_position().await.unwrap(), Decimal::ZERO);
        assert_eq!(taker.get_position().await.unwrap(), Decimal::ZERO);
        assert_eq!(farmer.cycles_completed(), 1);

        let summary = farmer.last_summary().unwrap();
        assert_eq!(summary.side, Side::Bid);
        assert_eq!(summary.size, dec!(0.02));
        assert_eq!(summary.volume_usd, dec!(0.02) * dec!(49980) * dec!(2));

        let status = control.status();
        assert_eq!(status.state, CycleState::Idle);
        assert_eq!(status.cycles_completed, 1);
        assert!(status.last_summary.is_some());
        assert!(control.is_enabled());

        let account = status.account.unwrap();
        assert_eq!(account.maker.equity, dec!(10000));
        assert_eq!(account.maker_pnl, Some(Decimal::ZERO));
        assert!(control.balance_report().contains("Session PnL: $0"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dry_run_cycle_never_touches_venues() {
        let Harness {
            farmer: _,
            maker,
            taker,
            control,
            ..
        } = harness(test_config());
        control.configure("DRY_RUN", &["true"]).unwrap();

        let dry_maker = Arc::new(DryRunMaker::new(maker.clone(), control.config().clone()));
        let dry_taker = Arc::new(DryRunTaker::new(taker.clone(), control.config().clone()));
        let mut farmer = CycleFarmer::new(
            test_config(),
            dry_maker,
            dry_taker,
            Arc::new(crate::alert::LogAlertSink),
            control.clone(),
        );

        farmer.run_cycle().await.unwrap();

        assert_eq!(farmer.cycles_completed(), 1);
        assert!(maker.state().await.placed.is_empty());
        assert!(taker.state().await.orders.is_empty());
    }

    // ===== Safety gates and failures =====

    #[tokio::test(start_paused = true)]
    async fn test_low_collateral_pauses_before_quoting() {
        let mut alerts = MockAlertSink::new();
        alerts
            .expect_send()
            .withf(|text| text.contains("LOW BALANCE"))
            .times(1)
            .returning(|_| ());

        let Harness {
            mut farmer,
            maker,
            taker,
            control,
            ..
        } = harness_with_alerts(test_config(), Arc::new(alerts));
        taker.set_free_collateral(dec!(10)).await;

        farmer.run_cycle().await.unwrap();

        assert!(!control.is_enabled());
        assert!(maker.state().await.placed.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_margin_rejection_pauses() {
        let mut alerts = MockAlertSink::new();
        alerts
            .expect_send()
            .withf(|text| text.contains("MARGIN"))
            .times(1)
            .returning(|_| ());

        let Harness {
            mut farmer,
            maker,
            control,
            ..
        } = harness_with_alerts(test_config(), Arc::new(alerts));
        maker.set_margin_reject(true).await;

        farmer.run_cycle().await.unwrap();

        assert!(!control.is_enabled());
        assert_eq!(farmer.cycles_completed(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fill_racing_margin_pause_is_hedged() {
        let Harness {
            mut farmer,
            maker,
            taker,
            control,
            ..
        } = harness(test_config());
        maker.reject_margin_after(1).await;
        maker
            .push_fill(ScriptedFill::on_cancel(Side::Bid, dec!(0.004)))
            .await;

        let filled = farmer.open_position(dec!(0.02)).await.unwrap();

        assert_eq!(filled, dec!(0.004));
        assert!(!control.is_enabled());
        assert_eq!(farmer.cycle.open_side, Some(Side::Bid));
        assert_eq!(maker.get_position().await.unwrap(), dec!(0.004));
        assert_eq!(taker.get_position().await.unwrap(), dec!(-0.004));
        // One attempt only; the pause ends the opening loop
        assert_eq!(maker.state().await.placed.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hedge_failure_unwinds_and_pauses() {
        let Harness {
            mut farmer,
            maker,
            taker,
            control,
            ..
        } = harness(test_config());
        maker.set_auto_fill(true).await;
        taker.fail_next_orders(1).await;

        let err = farmer.run_cycle().await.unwrap_err();
        assert!(matches!(err, CycleError::HedgeFailed { .. }));

        farmer.handle_cycle_error(err).await;

        assert!(!control.is_enabled());
        assert_eq!(maker.state().await.position, Decimal::ZERO);
        assert_eq!(taker.state().await.position, Decimal::ZERO);
        assert!(maker.state().await.orders.is_empty());
    }

    // ===== Hold =====

    #[tokio::test(start_paused = true)]
    async fn test_liquidation_risk_ends_hold_early() {
        let mut config = test_config();
        config.tunables.hold_secs = crate::config::Bounds::new(900, 900);
        let Harness {
            mut farmer,
            maker,
            market,
            ..
        } = harness(config);

        maker.set_position(dec!(1)).await;
        farmer.cycle.record_open(Side::Bid, dec!(1), dec!(100));
        farmer.cycle.record_hedge(dec!(1), dec!(100));
        market.set_mid(dec!(97.9)).await;

        let start = Instant::now();
        farmer.hold().await;

        assert!(start.elapsed() < Duration::from_secs(900));
        assert_eq!(farmer.cycle.hold_duration, Duration::from_secs(900));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_ends_hold() {
        let mut config = test_config();
        config.tunables.hold_secs = crate::config::Bounds::new(900, 900);
        let Harness {
            mut farmer,
            maker,
            control,
            ..
        } = harness(config);

        maker.set_position(dec!(0.02)).await;
        farmer.cycle.record_open(Side::Bid, dec!(0.02), dec!(50000));
        control.request_shutdown();

        let start = Instant::now();
        farmer.hold().await;
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    // ===== Run loop =====

    #[tokio::test(start_paused = true)]
    async fn test_paused_loop_parks_and_stops() {
        let Harness {
            mut farmer,
            maker,
            control,
            ..
        } = harness(test_config());
        control.pause();

        let handle = tokio::spawn(async move {
            farmer.run().await;
            farmer
        });

        sleep(Duration::from_secs(5)).await;
        assert_eq!(control.status().state, CycleState::Paused);
        assert!(maker.state().await.placed.is_empty());

        control.request_shutdown();
        let farmer = handle.await.unwrap();
        assert_eq!(farmer.cycles_completed(), 0);
        assert_eq!(control.status().state, CycleState::Idle);
    }

    #[test]
    fn test_weighted_prices() {
        let mut cycle = Cycle::default();
        cycle.record_open(Side::Ask, dec!(0.015), dec!(100));
        cycle.record_open(Side::Bid, dec!(0.005), dec!(104));

        assert_eq!(cycle.open_side, Some(Side::Ask));
        assert_eq!(cycle.open_size, dec!(0.02));
        assert_eq!(cycle.open_price, Some(dec!(101)));
    }
}
