//! Quote prices, target sizes and per-cycle random sampling.

use crate::config::Bounds;
use crate::exchange::{Bbo, Side};
use crate::utils::decimal::{from_basis_points, from_f64, round_to_precision, round_to_tick};
use rand::Rng;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::time::Duration;
use tracing::info;

/// Opening quote pair around the taker mid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quotes {
    pub bid: Decimal,
    pub ask: Decimal,
}

impl Quotes {
    pub fn price(&self, side: Side) -> Decimal {
        match side {
            Side::Bid => self.bid,
            Side::Ask => self.ask,
        }
    }
}

/// Quotes at `mid ∓ mid * offset_bps / 10000`, rounded to tick and clamped
/// one tick inside the maker venue's opposite touch so neither side
/// crosses its book.
pub fn opening_quotes(
    taker_mid: Decimal,
    offset_bps: Decimal,
    tick: Decimal,
    maker_book: Option<Bbo>,
) -> Quotes {
    let offset = taker_mid * from_basis_points(offset_bps);
    let mut bid = round_to_tick(taker_mid - offset, tick);
    let mut ask = round_to_tick(taker_mid + offset, tick);

    if let Some(book) = maker_book {
        if book.ask > Decimal::ZERO && bid >= book.ask {
            info!(%bid, maker_ask = %book.ask, "⚠️ Bid would cross maker book, clamping");
            bid = book.ask - tick;
        }
        if book.bid > Decimal::ZERO && ask <= book.bid {
            info!(%ask, maker_bid = %book.bid, "⚠️ Ask would cross maker book, clamping");
            ask = book.bid + tick;
        }
    }

    Quotes { bid, ask }
}

/// Close price strictly outside the maker touch by `buffer`.
/// `close_side` is the side of the closing order.
pub fn close_price(close_side: Side, maker_book: Bbo, buffer: Decimal, tick: Decimal) -> Decimal {
    match close_side {
        Side::Ask => round_to_tick(maker_book.ask + buffer, tick),
        Side::Bid => round_to_tick(maker_book.bid - buffer, tick),
    }
}

/// Base units for a USD notional at `mid`.
pub fn target_size(notional_usd: Decimal, mid: Decimal, size_decimals: u32) -> Decimal {
    if mid <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    round_to_precision(notional_usd / mid, size_decimals)
}

/// Uniform USD notional from the configured range, to the cent.
pub fn sample_notional(range: &Bounds<Decimal>) -> Decimal {
    let (Some(min), Some(max)) = (range.min.to_f64(), range.max.to_f64()) else {
        return range.min;
    };
    if max <= min {
        return range.min;
    }
    round_to_precision(from_f64(rand::thread_rng().gen_range(min..=max)), 2)
}

/// Uniform whole-second duration from the configured range.
pub fn sample_duration(range: &Bounds<u64>) -> Duration {
    if range.max <= range.min {
        return Duration::from_secs(range.min);
    }
    Duration::from_secs(rand::thread_rng().gen_range(range.min..=range.max))
}
