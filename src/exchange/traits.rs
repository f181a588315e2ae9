//! Venue-agnostic traits for the two legs of a cycle.
//!
//! Provides a common interface over the venues the farmer trades on:
//! - The maker venue rests post-only limit orders and is polled for fills
//! - The taker venue neutralizes exposure with bounded-slippage market orders
//!
//! Wire protocols, signing and sessions live behind these traits.

use super::types::{
    Balance, Bbo, ClientOrderId, OrderId, OrderSide, PlaceOutcome, Side, TakerFill, VenueError,
};
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::fmt;

/// Venue role identifier for logs and alerts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Venue {
    Maker,
    Taker,
}

impl fmt::Display for Venue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Venue::Maker => write!(f, "Maker venue"),
            Venue::Taker => write!(f, "Taker venue"),
        }
    }
}

/// Venue where the farmer opens and closes as a maker.
#[async_trait]
pub trait MakerVenue: Send + Sync {
    /// Place a limit order. With `post_only`, fails with
    /// [`VenueError::CrossesBook`] instead of taking liquidity.
    async fn place_limit_order(
        &self,
        side: Side,
        price: Decimal,
        size: Decimal,
        post_only: bool,
    ) -> Result<PlaceOutcome, VenueError>;

    /// Cancel an order. Succeeds if the order is already filled or gone.
    async fn cancel_order(&self, id: &OrderId) -> Result<(), VenueError>;

    /// Signed position: positive = long, negative = short.
    async fn get_position(&self) -> Result<Decimal, VenueError>;

    async fn get_balance(&self) -> Result<Balance, VenueError>;

    async fn get_best_bid_ask(&self) -> Result<Bbo, VenueError>;
}

/// Venue where the farmer hedges and unwinds as a taker.
#[async_trait]
pub trait TakerVenue: Send + Sync {
    /// Execute a market order bounded by `slippage_bps` from the touch.
    /// A repeated `client_id` must not execute twice.
    async fn place_taker_order(
        &self,
        side: OrderSide,
        size: Decimal,
        slippage_bps: u32,
        client_id: Option<ClientOrderId>,
    ) -> Result<TakerFill, VenueError>;

    /// Signed position: positive = long, negative = short.
    async fn get_position(&self) -> Result<Decimal, VenueError>;

    async fn get_balance(&self) -> Result<Balance, VenueError>;

    async fn get_best_bid_ask(&self) -> Result<Bbo, VenueError>;

    /// Release any held connection.
    async fn close(&self) -> Result<(), VenueError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_venue_display() {
        assert_eq!(Venue::Maker.to_string(), "Maker venue");
        assert_eq!(Venue::Taker.to_string(), "Taker venue");
    }
}
