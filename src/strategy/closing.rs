//! Closing phase: exit the maker leg as a maker, unwinding the taker leg
//! in step with each partial close fill.

use super::cycle::CycleFarmer;
use super::pricing;
use super::CycleError;
use crate::control::CycleState;
use crate::exchange::{PlaceOutcome, Side, VenueError};
use crate::utils::decimal::{is_dust, round_to_precision};
use rust_decimal::Decimal;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

impl CycleFarmer {
    /// Chase the maker touch with a post-only close order until the maker
    /// position is flat. Each observed reduction is unwound on the taker
    /// venue straight away so the legs never drift apart.
    pub(super) async fn close_position(&mut self) -> Result<(), CycleError> {
        let Some(open_side) = self.cycle.open_side else {
            return Ok(());
        };
        self.set_state(CycleState::Closing);

        let close_side = open_side.opposite();
        let unwind_side = open_side.hedge().opposite();
        let poll = self.config.timing.poll_interval();
        let dust = self.config.risk.fill_dust;
        let decimals = self.config.instrument.size_decimals;

        info!(%close_side, "📋 CLOSING | chasing the market as maker");

        let start = Instant::now();
        let mut last: Option<Decimal> = None;
        let mut current_price: Option<Decimal> = None;
        let mut last_reprice: Option<Instant> = None;

        loop {
            let tunables = self.tunables.snapshot();

            let position = match self.maker.get_position().await {
                Ok(position) => position,
                Err(e) => {
                    warn!(error = %e, "Failed to read maker position while closing");
                    sleep(poll).await;
                    continue;
                }
            };

            if let Some(previous) = last {
                let closed = round_to_precision(previous.abs() - position.abs(), decimals);
                if closed > dust {
                    self.reconciler
                        .partial_unwind(
                            self.taker.as_ref(),
                            unwind_side,
                            closed,
                            tunables.hedge_slippage_bps,
                        )
                        .await;
                }
            }
            last = Some(position);

            if is_dust(position, dust) {
                if let Some(id) = self.cycle.close_order.take() {
                    if let Err(e) = self.maker.cancel_order(&id).await {
                        debug!(order_id = %id, error = %e, "Close order already gone");
                    }
                }
                self.publish();
                info!(elapsed_secs = start.elapsed().as_secs(), "✅ Maker position closed");
                return Ok(());
            }

            let due = last_reprice.map_or(true, |at| at.elapsed() >= tunables.reprice_interval());
            if due {
                match self.maker.get_best_bid_ask().await {
                    Ok(book) if book.is_valid() => {
                        let price = pricing::close_price(
                            close_side,
                            book,
                            tunables.close_buffer_usd,
                            self.config.instrument.price_tick,
                        );
                        if current_price != Some(price) {
                            info!(
                                %close_side,
                                %price,
                                remaining = %position.abs(),
                                elapsed_secs = start.elapsed().as_secs(),
                                "📋 Re-pricing close"
                            );
                            current_price = self.requote_close(close_side, price, position.abs()).await?;
                        }
                        last_reprice = Some(Instant::now());
                    }
                    Ok(_) => warn!("Invalid maker BBO, keeping close order"),
                    Err(e) => warn!(error = %e, "Failed to read maker BBO, keeping close order"),
                }
            }

            sleep(poll).await;
        }
    }

    /// Replace the close order. Returns the price now resting, or `None`
    /// when nothing rests and the next pass should try again.
    async fn requote_close(
        &mut self,
        side: Side,
        price: Decimal,
        size: Decimal,
    ) -> Result<Option<Decimal>, CycleError> {
        if let Some(id) = self.cycle.close_order.take() {
            if let Err(e) = self.maker.cancel_order(&id).await {
                debug!(order_id = %id, error = %e, "Cancel failed (may already be filled)");
            }
        }

        // The old order may have filled further while it was cancelled
        let size = match self.maker.get_position().await {
            Ok(position) => position.abs().min(size),
            Err(_) => size,
        };
        if is_dust(size, self.config.risk.fill_dust) {
            return Ok(None);
        }

        match self.maker.place_limit_order(side, price, size, true).await {
            Ok(PlaceOutcome::Posted(id)) => {
                self.cycle.close_order = Some(id);
                self.publish();
                Ok(Some(price))
            }
            Ok(PlaceOutcome::Filled) => Ok(Some(price)),
            Err(VenueError::CrossesBook) => {
                warn!(%side, %price, "⚠️ Close order would cross the book, retrying next pass");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::mock::ScriptedFill;
    use crate::exchange::{MakerVenue, OrderSide, TakerVenue};
    use crate::strategy::testing::{harness, test_config, Harness};
    use rust_decimal_macros::dec;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test(start_paused = true)]
    async fn test_close_order_not_requoted_when_price_unchanged() {
        let Harness {
            mut farmer, maker, ..
        } = harness(test_config());
        maker.set_position(dec!(0.02)).await;
        farmer.cycle.open_side = Some(Side::Bid);

        // Nothing fills; the close keeps chasing
        let result = timeout(Duration::from_secs(95), farmer.close_position()).await;
        assert!(result.is_err());

        let state = maker.state().await;
        assert_eq!(state.placed.len(), 1);
        assert_eq!(state.cancels, 0);
        assert_eq!(state.placed[0].side, Side::Ask);
        // Outside the maker ask by the buffer
        assert_eq!(state.placed[0].price, dec!(50025));
        assert!(state.placed[0].post_only);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_order_follows_moving_book() {
        let Harness {
            mut farmer,
            maker,
            market,
            ..
        } = harness(test_config());
        maker.set_position(dec!(-0.02)).await;
        farmer.cycle.open_side = Some(Side::Ask);

        let mover = market.clone();
        tokio::spawn(async move {
            sleep(Duration::from_secs(40)).await;
            mover.set_mid(dec!(49900)).await;
        });

        let result = timeout(Duration::from_secs(65), farmer.close_position()).await;
        assert!(result.is_err());

        let state = maker.state().await;
        assert_eq!(state.placed.len(), 2);
        assert_eq!(state.cancels, 1);
        assert_eq!(state.placed[0].side, Side::Bid);
        assert_eq!(state.placed[0].price, dec!(49975));
        assert_eq!(state.placed[1].price, dec!(49875));
        assert_eq!(state.orders.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_closes_unwind_taker_incrementally() {
        let Harness {
            mut farmer,
            maker,
            taker,
            ..
        } = harness(test_config());
        maker.set_position(dec!(0.02)).await;
        taker.set_position(dec!(-0.02)).await;
        farmer.cycle.open_side = Some(Side::Bid);

        maker
            .push_fill(ScriptedFill::next_poll(Side::Ask, dec!(0.008)))
            .await;
        maker
            .push_fill(ScriptedFill::next_poll(Side::Ask, dec!(0.012)))
            .await;

        farmer.close_position().await.unwrap();

        let unwinds: Vec<_> = taker
            .state()
            .await
            .orders
            .iter()
            .map(|o| (o.side, o.size))
            .collect();
        assert_eq!(
            unwinds,
            vec![(OrderSide::Buy, dec!(0.008)), (OrderSide::Buy, dec!(0.012))]
        );
        assert!(maker.get_position().await.unwrap().is_zero());
        assert!(taker.get_position().await.unwrap().is_zero());
        assert!(farmer.cycle.close_order.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_already_flat_places_nothing() {
        let Harness {
            mut farmer, maker, ..
        } = harness(test_config());
        farmer.cycle.open_side = Some(Side::Bid);

        farmer.close_position().await.unwrap();

        assert!(maker.state().await.placed.is_empty());
    }
}
