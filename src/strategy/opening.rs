//! Opening phase: post-only quotes on the maker venue, fill detection by
//! position delta.
//!
//! Fills are never trusted from order acknowledgements. A baseline
//! position is read before any quote goes out and every poll compares
//! against it, so a fill that lands while a quote is being cancelled is
//! still observed.

use super::cycle::CycleFarmer;
use super::pricing::{self, Quotes};
use super::CycleError;
use crate::config::Tunables;
use crate::control::CycleState;
use crate::exchange::{PlaceOutcome, Side, VenueError};
use crate::utils::decimal::round_to_precision;
use rust_decimal::Decimal;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

/// Maker fill observed during the opening phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenFill {
    pub side: Side,
    pub size: Decimal,
    /// Quote price of the side that filled
    pub price: Decimal,
    /// Maker position read before the quotes were placed
    pub baseline: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpeningOutcome {
    Filled(OpenFill),
    NoFill,
    /// Margin rejection with no fill; trading has been disabled
    Paused,
}

impl CycleFarmer {
    /// One opening attempt for `size`. With no locked side both sides are
    /// quoted; otherwise only the locked side, re-quoted as the market
    /// moves.
    pub(super) async fn open_step(
        &mut self,
        size: Decimal,
        locked: Option<Side>,
    ) -> Result<OpeningOutcome, CycleError> {
        let tunables = self.tunables.snapshot();
        let timing = self.config.timing.clone();
        self.set_state(CycleState::Opening);

        let Some(mid) = self.taker_mid().await else {
            error!("Cannot fetch taker BBO, retrying");
            sleep(Duration::from_secs(timing.bbo_backoff_secs)).await;
            return Ok(OpeningOutcome::NoFill);
        };
        let mut quotes = self.quotes_around(mid, &tunables).await;

        let baseline = match self.maker.get_position().await {
            Ok(position) => position,
            Err(e) => {
                warn!(error = %e, "Failed to read maker baseline position");
                sleep(timing.poll_interval()).await;
                return Ok(OpeningOutcome::NoFill);
            }
        };

        match locked {
            Some(side) => {
                info!(%side, price = %quotes.price(side), %size, "📋 OPENING remainder");
                match self.place_quote(side, quotes.price(side), size).await {
                    Ok(()) => {}
                    Err(VenueError::CrossesBook) => {
                        warn!(%side, "⚠️ Quote would cross the book (post-only), retrying shortly");
                        sleep(Duration::from_secs(timing.post_only_retry_secs)).await;
                        return Ok(OpeningOutcome::NoFill);
                    }
                    Err(VenueError::Margin(reason)) => {
                        self.margin_pause(&reason).await;
                        return self.settle_after_pause(baseline, &quotes).await;
                    }
                    Err(e) => {
                        self.cancel_open_orders().await;
                        return Err(e.into());
                    }
                }
            }
            None => {
                info!(
                    bid = %quotes.bid,
                    ask = %quotes.ask,
                    %size,
                    taker_mid = %mid,
                    "📋 OPENING both sides"
                );
                let mut placed = false;
                for side in [Side::Bid, Side::Ask] {
                    match self.place_quote(side, quotes.price(side), size).await {
                        Ok(()) => placed = true,
                        Err(VenueError::CrossesBook) => {
                            warn!(%side, "⚠️ Quote would cross the book (post-only), skipping side")
                        }
                        Err(VenueError::Margin(reason)) => {
                            self.margin_pause(&reason).await;
                            return self.settle_after_pause(baseline, &quotes).await;
                        }
                        Err(e) => {
                            self.cancel_open_orders().await;
                            return Err(e.into());
                        }
                    }
                }
                if !placed {
                    warn!(
                        retry_secs = timing.cross_retry_secs,
                        "⚠️ Both sides would cross the book, retrying"
                    );
                    sleep(Duration::from_secs(timing.cross_retry_secs)).await;
                    return Ok(OpeningOutcome::NoFill);
                }
            }
        }

        let start = Instant::now();
        let mut last_reprice = start;
        let mut last_status = start;

        loop {
            sleep(timing.poll_interval()).await;

            match self.maker.get_position().await {
                Ok(position) => {
                    if let Some(fill) = self.detect_fill(position, baseline, &quotes) {
                        self.cancel_open_orders().await;
                        info!(side = %fill.side, size = %fill.size, price = %fill.price, "🔔 FILL on maker venue");
                        return Ok(OpeningOutcome::Filled(fill));
                    }
                }
                Err(e) => warn!(error = %e, "Failed to read maker position while waiting for fill"),
            }

            if start.elapsed() >= tunables.order_timeout() {
                warn!(timeout_secs = tunables.order_timeout_secs, "⏰ No fill, cancelling");
                self.cancel_open_orders().await;
                sleep(Duration::from_secs(timing.cancel_settle_secs)).await;

                // A fill can race the cancel; the last read decides
                let position = self.maker.get_position().await?;
                if let Some(fill) = self.detect_fill(position, baseline, &quotes) {
                    info!(side = %fill.side, size = %fill.size, "🔔 Fill detected after cancel, hedging");
                    return Ok(OpeningOutcome::Filled(fill));
                }
                info!("No fill detected");
                return Ok(OpeningOutcome::NoFill);
            }

            if let Some(side) = locked {
                if last_reprice.elapsed() >= tunables.reprice_interval() {
                    if self.requote(side, size, &mut quotes, &tunables).await {
                        return self.settle_after_pause(baseline, &quotes).await;
                    }
                    last_reprice = Instant::now();
                }
            }

            if last_status.elapsed() >= timing.status_interval() {
                info!(elapsed_secs = start.elapsed().as_secs(), "   ⏳ Waiting for fill...");
                last_status = Instant::now();
            }
        }
    }

    /// Quotes cancelled by a margin pause may have filled on the way out.
    /// Trading stays disabled, but any such fill is handed back for hedging.
    async fn settle_after_pause(
        &mut self,
        baseline: Decimal,
        quotes: &Quotes,
    ) -> Result<OpeningOutcome, CycleError> {
        sleep(Duration::from_secs(self.config.timing.cancel_settle_secs)).await;

        let position = self.maker.get_position().await?;
        match self.detect_fill(position, baseline, quotes) {
            Some(fill) => {
                warn!(side = %fill.side, size = %fill.size, "🔔 Fill detected after margin pause, hedging");
                Ok(OpeningOutcome::Filled(fill))
            }
            None => Ok(OpeningOutcome::Paused),
        }
    }

    fn detect_fill(&self, position: Decimal, baseline: Decimal, quotes: &Quotes) -> Option<OpenFill> {
        let delta = position - baseline;
        if delta.abs() <= self.config.risk.fill_dust {
            return None;
        }
        let side = Side::from_delta(delta);
        Some(OpenFill {
            side,
            size: round_to_precision(delta.abs(), self.config.instrument.size_decimals),
            price: quotes.price(side),
            baseline,
        })
    }

    async fn quotes_around(&self, mid: Decimal, tunables: &Tunables) -> Quotes {
        let maker_book = match self.maker.get_best_bid_ask().await {
            Ok(book) if book.is_valid() => Some(book),
            Ok(_) => None,
            Err(e) => {
                debug!(error = %e, "Maker BBO unavailable, quoting without clamp");
                None
            }
        };
        pricing::opening_quotes(
            mid,
            tunables.spread_offset_bps,
            self.config.instrument.price_tick,
            maker_book,
        )
    }

    /// Re-price the resting remainder quote to follow the taker mid.
    /// Returns true when a margin rejection paused trading. The cancelled
    /// quote may have filled, so the caller must re-read the position.
    async fn requote(
        &mut self,
        side: Side,
        size: Decimal,
        quotes: &mut Quotes,
        tunables: &Tunables,
    ) -> bool {
        let Some(mid) = self.taker_mid().await else {
            return false;
        };
        let price = self.quotes_around(mid, tunables).await.price(side);

        let resting = match side {
            Side::Bid => &self.cycle.bid_order,
            Side::Ask => &self.cycle.ask_order,
        };
        if resting.is_some() && price == quotes.price(side) {
            return false;
        }

        let resting = match side {
            Side::Bid => self.cycle.bid_order.take(),
            Side::Ask => self.cycle.ask_order.take(),
        };
        if let Some(id) = resting {
            if let Err(e) = self.maker.cancel_order(&id).await {
                debug!(order_id = %id, error = %e, "Cancel failed (may already be filled)");
            }
        }
        self.place_requote(side, price, size, quotes).await
    }

    async fn place_requote(
        &mut self,
        side: Side,
        price: Decimal,
        size: Decimal,
        quotes: &mut Quotes,
    ) -> bool {
        match self.place_quote(side, price, size).await {
            Ok(()) => {
                info!(%side, old = %quotes.price(side), new = %price, "🔄 Re-priced remainder");
                match side {
                    Side::Bid => quotes.bid = price,
                    Side::Ask => quotes.ask = price,
                }
                false
            }
            Err(VenueError::CrossesBook) => {
                warn!(%side, %price, "⚠️ Re-price would cross the book, skipping this update");
                false
            }
            Err(VenueError::Margin(reason)) => {
                self.margin_pause(&reason).await;
                true
            }
            Err(e) => {
                error!(%side, error = %e, "Re-price failed");
                false
            }
        }
    }

    async fn place_quote(&mut self, side: Side, price: Decimal, size: Decimal) -> Result<(), VenueError> {
        match self.maker.place_limit_order(side, price, size, true).await? {
            PlaceOutcome::Posted(id) => {
                debug!(%side, %price, %size, order_id = %id, "Quote posted");
                match side {
                    Side::Bid => self.cycle.bid_order = Some(id),
                    Side::Ask => self.cycle.ask_order = Some(id),
                }
                self.publish();
            }
            PlaceOutcome::Filled => debug!(%side, %price, %size, "Quote executed on submission"),
        }
        Ok(())
    }

    async fn margin_pause(&mut self, reason: &str) {
        self.cancel_open_orders().await;
        let msg = format!(
            "⚠️ MARGIN ERROR: {}\nInsufficient collateral, pausing bot.",
            reason
        );
        warn!("{}", msg);
        self.alerts.send(&msg).await;
        self.control.pause();
    }
}
