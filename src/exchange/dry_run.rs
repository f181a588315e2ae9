//! Dry-run wrappers around live venues.
//!
//! While the `dry_run` tunable is on, order placement is logged and
//! simulated against a shadow position; market data and balances still
//! come from the wrapped venue. Post-only maker quotes rest in a shadow
//! book and the oldest one fills on the next position read, so the cycle
//! sees the same fill-by-position-delta flow as in live trading. The flag
//! is read on every call so it can be toggled at runtime.

use super::traits::{MakerVenue, TakerVenue};
use super::types::*;
use crate::config::ConfigHandle;
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

#[derive(Debug, Default)]
struct ShadowBook {
    position: Decimal,
    orders: BTreeMap<u64, (Side, Decimal)>,
}

pub struct DryRunMaker {
    inner: Arc<dyn MakerVenue>,
    config: ConfigHandle,
    shadow: RwLock<ShadowBook>,
    order_id_counter: AtomicU64,
}

impl DryRunMaker {
    pub fn new(inner: Arc<dyn MakerVenue>, config: ConfigHandle) -> Self {
        Self {
            inner,
            config,
            shadow: RwLock::new(ShadowBook::default()),
            order_id_counter: AtomicU64::new(1),
        }
    }

    fn parse_id(id: &OrderId) -> Option<u64> {
        id.0.strip_prefix("dry-")?.parse().ok()
    }
}

#[async_trait]
impl MakerVenue for DryRunMaker {
    async fn place_limit_order(
        &self,
        side: Side,
        price: Decimal,
        size: Decimal,
        post_only: bool,
    ) -> Result<PlaceOutcome, VenueError> {
        if !self.config.dry_run() {
            return self.inner.place_limit_order(side, price, size, post_only).await;
        }

        let mut shadow = self.shadow.write().await;
        if !post_only {
            shadow.position += side.signed(size);
            info!(%side, %price, %size, "[DRY RUN] Maker order simulated as filled");
            return Ok(PlaceOutcome::Filled);
        }

        let id = self.order_id_counter.fetch_add(1, Ordering::SeqCst);
        shadow.orders.insert(id, (side, size));
        info!(%side, %price, %size, "[DRY RUN] Maker quote simulated");
        Ok(PlaceOutcome::Posted(OrderId(format!("dry-{}", id))))
    }

    async fn cancel_order(&self, id: &OrderId) -> Result<(), VenueError> {
        if !self.config.dry_run() {
            return self.inner.cancel_order(id).await;
        }
        if let Some(numeric) = Self::parse_id(id) {
            self.shadow.write().await.orders.remove(&numeric);
        }
        Ok(())
    }

    async fn get_position(&self) -> Result<Decimal, VenueError> {
        if !self.config.dry_run() {
            return self.inner.get_position().await;
        }

        let mut shadow = self.shadow.write().await;
        let oldest = shadow.orders.keys().next().copied();
        if let Some((side, size)) = oldest.and_then(|id| shadow.orders.remove(&id)) {
            shadow.position += side.signed(size);
            info!(%side, %size, "[DRY RUN] Simulated maker fill");
        }
        Ok(shadow.position)
    }

    async fn get_balance(&self) -> Result<Balance, VenueError> {
        self.inner.get_balance().await
    }

    async fn get_best_bid_ask(&self) -> Result<Bbo, VenueError> {
        self.inner.get_best_bid_ask().await
    }
}

pub struct DryRunTaker {
    inner: Arc<dyn TakerVenue>,
    config: ConfigHandle,
    shadow_position: RwLock<Decimal>,
    order_id_counter: AtomicU64,
}

impl DryRunTaker {
    pub fn new(inner: Arc<dyn TakerVenue>, config: ConfigHandle) -> Self {
        Self {
            inner,
            config,
            shadow_position: RwLock::new(Decimal::ZERO),
            order_id_counter: AtomicU64::new(1),
        }
    }
}

#[async_trait]
impl TakerVenue for DryRunTaker {
    async fn place_taker_order(
        &self,
        side: OrderSide,
        size: Decimal,
        slippage_bps: u32,
        client_id: Option<ClientOrderId>,
    ) -> Result<TakerFill, VenueError> {
        if !self.config.dry_run() {
            return self
                .inner
                .place_taker_order(side, size, slippage_bps, client_id)
                .await;
        }

        let bbo = self.inner.get_best_bid_ask().await?;
        let price = match side {
            OrderSide::Buy => bbo.ask,
            OrderSide::Sell => bbo.bid,
        };
        *self.shadow_position.write().await += side.signed(size);

        let id = self.order_id_counter.fetch_add(1, Ordering::SeqCst);
        info!(%side, %size, %price, slippage_bps, "[DRY RUN] Taker order simulated");
        Ok(TakerFill {
            confirmation: format!("dry-{}", id),
            price,
            size,
        })
    }

    async fn get_position(&self) -> Result<Decimal, VenueError> {
        if self.config.dry_run() {
            return Ok(*self.shadow_position.read().await);
        }
        self.inner.get_position().await
    }

    async fn get_balance(&self) -> Result<Balance, VenueError> {
        self.inner.get_balance().await
    }

    async fn get_best_bid_ask(&self) -> Result<Bbo, VenueError> {
        self.inner.get_best_bid_ask().await
    }

    async fn close(&self) -> Result<(), VenueError> {
        self.inner.close().await
    }
}
