//! Venue-neutral order, position and market data types.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

/// Side of a maker quote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    /// Buy (opens long)
    Bid,
    /// Sell (opens short)
    Ask,
}

impl Side {
    pub fn opposite(self) -> Self {
        match self {
            Side::Bid => Side::Ask,
            Side::Ask => Side::Bid,
        }
    }

    /// Side whose fill produced a signed position delta.
    pub fn from_delta(delta: Decimal) -> Self {
        if delta > Decimal::ZERO {
            Side::Bid
        } else {
            Side::Ask
        }
    }

    /// Signed position change for a fill of `size`.
    pub fn signed(self, size: Decimal) -> Decimal {
        match self {
            Side::Bid => size,
            Side::Ask => -size,
        }
    }

    /// Taker direction that neutralizes a maker fill on this side.
    pub fn hedge(self) -> OrderSide {
        match self {
            Side::Bid => OrderSide::Sell,
            Side::Ask => OrderSide::Buy,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Bid => "BID",
            Side::Ask => "ASK",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Direction of a taker order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    /// Direction that brings a signed position back to zero.
    pub fn flatten(position: Decimal) -> Self {
        if position > Decimal::ZERO {
            OrderSide::Sell
        } else {
            OrderSide::Buy
        }
    }

    pub fn opposite(self) -> Self {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }

    pub fn signed(self, size: Decimal) -> Decimal {
        match self {
            OrderSide::Buy => size,
            OrderSide::Sell => -size,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque venue-assigned order handle.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrderId(pub String);

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<u64> for OrderId {
    fn from(id: u64) -> Self {
        OrderId(id.to_string())
    }
}

static LAST_CLIENT_ID: AtomicU64 = AtomicU64::new(0);

/// Client-assigned idempotency key for taker orders.
///
/// Derived from wall-clock milliseconds so keys stay unique across
/// restarts; strictly increasing within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientOrderId(pub u64);

impl ClientOrderId {
    pub fn from_clock() -> Self {
        let now = chrono::Utc::now().timestamp_millis().max(0) as u64;
        let previous = LAST_CLIENT_ID
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(now.max(last + 1))
            })
            .unwrap_or(now);
        ClientOrderId(now.max(previous + 1))
    }
}

impl fmt::Display for ClientOrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Best bid and offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bbo {
    pub bid: Decimal,
    pub ask: Decimal,
}

impl Bbo {
    pub fn new(bid: Decimal, ask: Decimal) -> Self {
        Self { bid, ask }
    }

    pub fn mid(&self) -> Decimal {
        crate::utils::decimal::mid(self.bid, self.ask)
    }

    /// Both sides populated and not crossed.
    pub fn is_valid(&self) -> bool {
        self.bid > Decimal::ZERO && self.ask > Decimal::ZERO && self.bid <= self.ask
    }
}

/// Account collateral snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Balance {
    pub collateral: Decimal,
    pub free_collateral: Decimal,
    pub equity: Decimal,
}

/// Successful limit order submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaceOutcome {
    /// Resting on the book
    Posted(OrderId),
    /// Executed in full on submission
    Filled,
}

impl PlaceOutcome {
    pub fn order_id(&self) -> Option<&OrderId> {
        match self {
            PlaceOutcome::Posted(id) => Some(id),
            PlaceOutcome::Filled => None,
        }
    }

    pub fn into_order_id(self) -> Option<OrderId> {
        match self {
            PlaceOutcome::Posted(id) => Some(id),
            PlaceOutcome::Filled => None,
        }
    }
}

/// Confirmation of an executed taker order.
#[derive(Debug, Clone, PartialEq)]
pub struct TakerFill {
    pub confirmation: String,
    pub price: Decimal,
    pub size: Decimal,
}

/// Structured venue failure kinds.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum VenueError {
    /// Post-only order would have taken liquidity
    #[error("post-only order would cross the book")]
    CrossesBook,
    /// Insufficient collateral or risk-engine refusal
    #[error("margin rejected: {0}")]
    Margin(String),
    /// Any other venue-side refusal
    #[error("order rejected: {0}")]
    Rejected(String),
    /// Transport or read failure
    #[error("venue unavailable: {0}")]
    Unavailable(String),
}
