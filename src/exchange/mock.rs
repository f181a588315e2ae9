//! In-memory venues for paper trading and scenario tests.
//!
//! Both mock venues quote around a shared [`MockMarket`]. The maker venue
//! rests post-only orders and fills them either from a script of
//! [`ScriptedFill`]s or automatically; the taker venue executes market
//! orders immediately and can be told to lag, overshoot or fail.

use super::traits::{MakerVenue, TakerVenue};
use super::types::*;
use async_trait::async_trait;
use rand::Rng;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Shared reference price for both mock venues.
#[derive(Debug, Clone)]
pub struct MockMarket {
    state: Arc<RwLock<MarketState>>,
}

#[derive(Debug, Clone, Copy)]
struct MarketState {
    mid: Decimal,
    half_spread: Decimal,
}

impl MockMarket {
    /// Create a market at `mid` with a total quoted `spread`.
    pub fn new(mid: Decimal, spread: Decimal) -> Self {
        Self {
            state: Arc::new(RwLock::new(MarketState {
                mid,
                half_spread: spread / dec!(2),
            })),
        }
    }

    pub async fn set_mid(&self, mid: Decimal) {
        self.state.write().await.mid = mid;
    }

    pub async fn mid(&self) -> Decimal {
        self.state.read().await.mid
    }

    pub async fn bbo(&self) -> Bbo {
        let state = self.state.read().await;
        Bbo::new(state.mid - state.half_spread, state.mid + state.half_spread)
    }

    /// Move the mid by a random step of at most `max_step_bps`.
    pub async fn random_walk(&self, max_step_bps: u32) {
        let bps = i64::from(max_step_bps);
        let step = rand::thread_rng().gen_range(-bps..=bps);
        let mut state = self.state.write().await;
        let mid = state.mid;
        state.mid = mid + mid * Decimal::new(step, 4);
        debug!(mid = %state.mid, "Mock market moved");
    }
}

/// When a scripted maker fill is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillTrigger {
    /// On the next position read while a matching order rests
    NextPoll,
    /// While cancelling a matching resting order
    OnCancel,
}

/// A fill the mock maker venue applies to a resting order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScriptedFill {
    pub side: Side,
    pub size: Decimal,
    pub trigger: FillTrigger,
}

impl ScriptedFill {
    pub fn next_poll(side: Side, size: Decimal) -> Self {
        Self {
            side,
            size,
            trigger: FillTrigger::NextPoll,
        }
    }

    pub fn on_cancel(side: Side, size: Decimal) -> Self {
        Self {
            side,
            size,
            trigger: FillTrigger::OnCancel,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestingOrder {
    pub side: Side,
    pub price: Decimal,
    pub remaining: Decimal,
}

/// Record of a limit order submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlacedOrder {
    pub side: Side,
    pub price: Decimal,
    pub size: Decimal,
    pub post_only: bool,
}

/// Simulated maker venue state.
#[derive(Debug, Clone)]
pub struct MakerState {
    pub position: Decimal,
    pub balance: Balance,
    pub orders: BTreeMap<u64, RestingOrder>,
    pub script: VecDeque<ScriptedFill>,
    /// Fill the oldest resting order on each position read when unscripted
    pub auto_fill: bool,
    pub margin_reject: bool,
    /// Accept this many more placements, then reject on margin
    pub margin_reject_after: Option<u32>,
    /// Own book; defaults to the shared market when unset
    pub book: Option<Bbo>,
    pub placed: Vec<PlacedOrder>,
    pub cancels: u32,
    pub failing_reads: u32,
    pub volume_usd: Decimal,
}

impl Default for MakerState {
    fn default() -> Self {
        Self {
            position: Decimal::ZERO,
            balance: default_balance(),
            orders: BTreeMap::new(),
            script: VecDeque::new(),
            auto_fill: false,
            margin_reject: false,
            margin_reject_after: None,
            book: None,
            placed: Vec::new(),
            cancels: 0,
            failing_reads: 0,
            volume_usd: Decimal::ZERO,
        }
    }
}

fn default_balance() -> Balance {
    Balance {
        collateral: dec!(10000),
        free_collateral: dec!(10000),
        equity: dec!(10000),
    }
}

impl MakerState {
    fn apply_fill(&mut self, id: u64, size: Decimal) -> Option<(Side, Decimal)> {
        let order = self.orders.get_mut(&id)?;
        let filled = size.min(order.remaining);
        order.remaining -= filled;
        let side = order.side;
        let price = order.price;
        if order.remaining <= Decimal::ZERO {
            self.orders.remove(&id);
        }
        self.position += side.signed(filled);
        self.volume_usd += filled * price;
        Some((side, filled))
    }

    fn resting_on(&self, side: Side) -> Option<u64> {
        self.orders
            .iter()
            .find(|(_, order)| order.side == side)
            .map(|(id, _)| *id)
    }
}

/// Mock maker venue.
pub struct MockMakerVenue {
    market: MockMarket,
    state: Arc<RwLock<MakerState>>,
    order_id_counter: AtomicU64,
}

impl MockMakerVenue {
    pub fn new(market: MockMarket) -> Self {
        Self {
            market,
            state: Arc::new(RwLock::new(MakerState::default())),
            order_id_counter: AtomicU64::new(1),
        }
    }

    /// Paper-trading venue that fills every resting order on the next poll.
    pub fn auto_filling(market: MockMarket) -> Self {
        Self {
            market,
            state: Arc::new(RwLock::new(MakerState {
                auto_fill: true,
                ..MakerState::default()
            })),
            order_id_counter: AtomicU64::new(1),
        }
    }

    /// Current mock state for assertions and logging.
    pub async fn state(&self) -> MakerState {
        self.state.read().await.clone()
    }

    pub async fn push_fill(&self, fill: ScriptedFill) {
        self.state.write().await.script.push_back(fill);
    }

    pub async fn set_auto_fill(&self, enabled: bool) {
        self.state.write().await.auto_fill = enabled;
    }

    pub async fn set_margin_reject(&self, reject: bool) {
        self.state.write().await.margin_reject = reject;
    }

    pub async fn reject_margin_after(&self, accepted: u32) {
        self.state.write().await.margin_reject_after = Some(accepted);
    }

    pub async fn set_book(&self, book: Option<Bbo>) {
        self.state.write().await.book = book;
    }

    pub async fn set_position(&self, position: Decimal) {
        self.state.write().await.position = position;
    }

    pub async fn set_free_collateral(&self, free: Decimal) {
        self.state.write().await.balance.free_collateral = free;
    }

    pub async fn fail_next_reads(&self, count: u32) {
        self.state.write().await.failing_reads = count;
    }

    fn next_order_id(&self) -> u64 {
        self.order_id_counter.fetch_add(1, Ordering::SeqCst)
    }

    async fn book(&self) -> Bbo {
        match self.state.read().await.book {
            Some(book) => book,
            None => self.market.bbo().await,
        }
    }
}

#[async_trait]
impl MakerVenue for MockMakerVenue {
    async fn place_limit_order(
        &self,
        side: Side,
        price: Decimal,
        size: Decimal,
        post_only: bool,
    ) -> Result<PlaceOutcome, VenueError> {
        let book = self.book().await;
        let mut state = self.state.write().await;

        state.placed.push(PlacedOrder {
            side,
            price,
            size,
            post_only,
        });

        match state.margin_reject_after {
            Some(0) => state.margin_reject = true,
            Some(left) => state.margin_reject_after = Some(left - 1),
            None => {}
        }
        if state.margin_reject {
            return Err(VenueError::Margin("insufficient free collateral".to_string()));
        }

        let crosses = match side {
            Side::Bid => price >= book.ask,
            Side::Ask => price <= book.bid,
        };

        if crosses && post_only {
            return Err(VenueError::CrossesBook);
        }

        if crosses {
            state.position += side.signed(size);
            state.volume_usd += size * price;
            info!(%side, %price, %size, "Mock maker order executed on submission");
            return Ok(PlaceOutcome::Filled);
        }

        let id = self.next_order_id();
        state.orders.insert(
            id,
            RestingOrder {
                side,
                price,
                remaining: size,
            },
        );

        debug!(order_id = id, %side, %price, %size, "Mock maker order resting");
        Ok(PlaceOutcome::Posted(OrderId::from(id)))
    }

    async fn cancel_order(&self, id: &OrderId) -> Result<(), VenueError> {
        let mut state = self.state.write().await;
        state.cancels += 1;

        let Ok(numeric) = id.0.parse::<u64>() else {
            return Ok(());
        };
        let Some(side) = state.orders.get(&numeric).map(|order| order.side) else {
            // Already filled or cancelled
            return Ok(());
        };

        let cancel_fill = matches!(
            state.script.front(),
            Some(fill) if fill.trigger == FillTrigger::OnCancel && fill.side == side
        );
        if cancel_fill {
            if let Some(fill) = state.script.pop_front() {
                state.apply_fill(numeric, fill.size);
                debug!(order_id = numeric, size = %fill.size, "Mock fill raced the cancel");
            }
        }

        state.orders.remove(&numeric);
        Ok(())
    }

    async fn get_position(&self) -> Result<Decimal, VenueError> {
        let mut state = self.state.write().await;

        if state.failing_reads > 0 {
            state.failing_reads -= 1;
            return Err(VenueError::Unavailable("mock read failure".to_string()));
        }

        let scripted = match state.script.front() {
            Some(fill) if fill.trigger == FillTrigger::NextPoll => state
                .resting_on(fill.side)
                .map(|id| (id, fill.size)),
            _ => None,
        };

        if let Some((id, size)) = scripted {
            state.script.pop_front();
            state.apply_fill(id, size);
        } else if state.script.is_empty() && state.auto_fill {
            let oldest = state
                .orders
                .iter()
                .next()
                .map(|(id, order)| (*id, order.remaining));
            if let Some((id, remaining)) = oldest {
                state.apply_fill(id, remaining);
            }
        }

        Ok(state.position)
    }

    async fn get_balance(&self) -> Result<Balance, VenueError> {
        Ok(self.state.read().await.balance)
    }

    async fn get_best_bid_ask(&self) -> Result<Bbo, VenueError> {
        Ok(self.book().await)
    }
}

/// Record of a taker order submission.
#[derive(Debug, Clone, PartialEq)]
pub struct TakerOrderRecord {
    pub side: OrderSide,
    pub size: Decimal,
    pub slippage_bps: u32,
    pub client_id: Option<ClientOrderId>,
    pub executed: bool,
}

/// Simulated taker venue state.
#[derive(Debug, Clone)]
pub struct TakerState {
    /// True settled position
    pub position: Decimal,
    pub balance: Balance,
    /// Lagging values returned ahead of the true position
    pub stale_reads: VecDeque<Decimal>,
    pub failing_orders: u32,
    /// Accepted but never executed
    pub dropped_orders: u32,
    /// Executed size = requested size * overshoot
    pub overshoot: Decimal,
    pub orders: Vec<TakerOrderRecord>,
    pub fills_by_client_id: HashMap<ClientOrderId, TakerFill>,
    pub failing_reads: u32,
    pub closed: bool,
    pub volume_usd: Decimal,
}

impl Default for TakerState {
    fn default() -> Self {
        Self {
            position: Decimal::ZERO,
            balance: default_balance(),
            stale_reads: VecDeque::new(),
            failing_orders: 0,
            dropped_orders: 0,
            overshoot: Decimal::ONE,
            orders: Vec::new(),
            fills_by_client_id: HashMap::new(),
            failing_reads: 0,
            closed: false,
            volume_usd: Decimal::ZERO,
        }
    }
}

/// Mock taker venue.
pub struct MockTakerVenue {
    market: MockMarket,
    state: Arc<RwLock<TakerState>>,
    order_id_counter: AtomicU64,
}

impl MockTakerVenue {
    pub fn new(market: MockMarket) -> Self {
        Self {
            market,
            state: Arc::new(RwLock::new(TakerState::default())),
            order_id_counter: AtomicU64::new(1),
        }
    }

    pub async fn state(&self) -> TakerState {
        self.state.read().await.clone()
    }

    pub async fn push_stale_read(&self, position: Decimal) {
        self.state.write().await.stale_reads.push_back(position);
    }

    pub async fn fail_next_orders(&self, count: u32) {
        self.state.write().await.failing_orders = count;
    }

    pub async fn drop_next_orders(&self, count: u32) {
        self.state.write().await.dropped_orders = count;
    }

    pub async fn set_overshoot(&self, factor: Decimal) {
        self.state.write().await.overshoot = factor;
    }

    pub async fn set_position(&self, position: Decimal) {
        self.state.write().await.position = position;
    }

    pub async fn set_free_collateral(&self, free: Decimal) {
        self.state.write().await.balance.free_collateral = free;
    }

    pub async fn fail_next_reads(&self, count: u32) {
        self.state.write().await.failing_reads = count;
    }
}

#[async_trait]
impl TakerVenue for MockTakerVenue {
    async fn place_taker_order(
        &self,
        side: OrderSide,
        size: Decimal,
        slippage_bps: u32,
        client_id: Option<ClientOrderId>,
    ) -> Result<TakerFill, VenueError> {
        let bbo = self.market.bbo().await;
        let mut state = self.state.write().await;

        if let Some(fill) = client_id.and_then(|id| state.fills_by_client_id.get(&id)) {
            debug!(client_id = ?client_id, "Duplicate client id, returning original fill");
            return Ok(fill.clone());
        }

        if state.failing_orders > 0 {
            state.failing_orders -= 1;
            state.orders.push(TakerOrderRecord {
                side,
                size,
                slippage_bps,
                client_id,
                executed: false,
            });
            return Err(VenueError::Rejected("mock taker rejection".to_string()));
        }

        let price = match side {
            OrderSide::Buy => bbo.ask,
            OrderSide::Sell => bbo.bid,
        };

        let executed = if state.dropped_orders > 0 {
            state.dropped_orders -= 1;
            false
        } else {
            let filled = size * state.overshoot;
            state.position += side.signed(filled);
            state.volume_usd += filled * price;
            true
        };

        state.orders.push(TakerOrderRecord {
            side,
            size,
            slippage_bps,
            client_id,
            executed,
        });

        let fill = TakerFill {
            confirmation: format!("mock-{}", self.order_id_counter.fetch_add(1, Ordering::SeqCst)),
            price,
            size,
        };
        if let Some(id) = client_id {
            state.fills_by_client_id.insert(id, fill.clone());
        }

        info!(%side, %size, %price, executed, "Mock taker order");
        Ok(fill)
    }

    async fn get_position(&self) -> Result<Decimal, VenueError> {
        let mut state = self.state.write().await;

        if state.failing_reads > 0 {
            state.failing_reads -= 1;
            return Err(VenueError::Unavailable("mock read failure".to_string()));
        }

        Ok(state.stale_reads.pop_front().unwrap_or(state.position))
    }

    async fn get_balance(&self) -> Result<Balance, VenueError> {
        Ok(self.state.read().await.balance)
    }

    async fn get_best_bid_ask(&self) -> Result<Bbo, VenueError> {
        Ok(self.market.bbo().await)
    }

    async fn close(&self) -> Result<(), VenueError> {
        self.state.write().await.closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn market() -> MockMarket {
        MockMarket::new(dec!(50000), dec!(10))
    }

    #[tokio::test]
    async fn test_post_only_crossing_rejected() {
        let maker = MockMakerVenue::new(market());

        let result = maker
            .place_limit_order(Side::Bid, dec!(50006), dec!(0.01), true)
            .await;
        assert_eq!(result, Err(VenueError::CrossesBook));

        let result = maker
            .place_limit_order(Side::Bid, dec!(49990), dec!(0.01), true)
            .await;
        assert!(matches!(result, Ok(PlaceOutcome::Posted(_))));
    }

    #[tokio::test]
    async fn test_non_post_only_crossing_fills() {
        let maker = MockMakerVenue::new(market());

        let result = maker
            .place_limit_order(Side::Ask, dec!(49995), dec!(0.01), false)
            .await;
        assert_eq!(result, Ok(PlaceOutcome::Filled));
        assert_eq!(maker.get_position().await.unwrap(), dec!(-0.01));
    }

    #[tokio::test]
    async fn test_scripted_fill_applies_to_matching_order() {
        let maker = MockMakerVenue::new(market());
        maker.push_fill(ScriptedFill::next_poll(Side::Bid, dec!(0.015))).await;

        // No resting bid yet: fill is held back
        assert_eq!(maker.get_position().await.unwrap(), Decimal::ZERO);

        maker
            .place_limit_order(Side::Bid, dec!(49990), dec!(0.02), true)
            .await
            .unwrap();
        assert_eq!(maker.get_position().await.unwrap(), dec!(0.015));

        let state = maker.state().await;
        assert_eq!(state.orders.values().next().unwrap().remaining, dec!(0.005));
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent_and_can_race_a_fill() {
        let maker = MockMakerVenue::new(market());
        maker.push_fill(ScriptedFill::on_cancel(Side::Ask, dec!(0.004))).await;

        let outcome = maker
            .place_limit_order(Side::Ask, dec!(50010), dec!(0.01), true)
            .await
            .unwrap();
        let id = outcome.into_order_id().unwrap();

        maker.cancel_order(&id).await.unwrap();
        assert_eq!(maker.get_position().await.unwrap(), dec!(-0.004));

        // Second cancel of the same id is a no-op
        maker.cancel_order(&id).await.unwrap();
        assert_eq!(maker.get_position().await.unwrap(), dec!(-0.004));
        assert!(maker.state().await.orders.is_empty());
    }

    #[tokio::test]
    async fn test_taker_idempotency_key_executes_once() {
        let taker = MockTakerVenue::new(market());
        let id = ClientOrderId(42);

        taker
            .place_taker_order(OrderSide::Sell, dec!(0.02), 10, Some(id))
            .await
            .unwrap();
        taker
            .place_taker_order(OrderSide::Sell, dec!(0.02), 10, Some(id))
            .await
            .unwrap();

        assert_eq!(taker.get_position().await.unwrap(), dec!(-0.02));
        assert_eq!(taker.state().await.orders.len(), 1);
    }

    #[tokio::test]
    async fn test_taker_stale_reads_precede_truth() {
        let taker = MockTakerVenue::new(market());
        taker.set_position(dec!(-0.01)).await;
        taker.push_stale_read(dec!(-0.02)).await;

        assert_eq!(taker.get_position().await.unwrap(), dec!(-0.02));
        assert_eq!(taker.get_position().await.unwrap(), dec!(-0.01));
    }

    #[tokio::test]
    async fn test_margin_rejection_after_accepted_placements() {
        let maker = MockMakerVenue::new(market());
        maker.reject_margin_after(1).await;

        let first = maker
            .place_limit_order(Side::Bid, dec!(49990), dec!(0.01), true)
            .await;
        assert!(matches!(first, Ok(PlaceOutcome::Posted(_))));

        let second = maker
            .place_limit_order(Side::Ask, dec!(50010), dec!(0.01), true)
            .await;
        assert!(matches!(second, Err(VenueError::Margin(_))));
    }

    #[tokio::test]
    async fn test_random_walk_stays_near_mid() {
        let market = market();
        market.random_walk(5).await;
        let mid = market.mid().await;
        assert!(mid >= dec!(49975) && mid <= dec!(50025));
    }
}
