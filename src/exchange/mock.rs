//! Scriptable in-memory venue for tests and paper trading.
//!
//! Fills market orders instantly at the configured mark price, parks limit
//! and stop orders as resting orders, and lets tests inject rejections,
//! timeouts, partial fills, and latency per venue.

use crate::exchange::error::{ExchangeError, ExchangeResult};
use crate::exchange::traits::{ExchangeAdapter, Venue};
use crate::exchange::types::{Order, OrderHandle, OrderId, OrderKind, OrderStatus, Position, Side};
use crate::utils::Clock;
use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Debug)]
struct MockState {
    mark_price: Decimal,
    /// One-shot partial fill: the next market order executes this fraction.
    partial_fill_next: Option<Decimal>,
    position: Decimal,
    entry_price: Decimal,
    open_orders: Vec<Order>,
    canceled: Vec<OrderId>,
    /// Every market submission accepted, in order.
    market_orders: Vec<(Side, Decimal)>,
    latency: Duration,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            mark_price: dec!(100),
            partial_fill_next: None,
            position: Decimal::ZERO,
            entry_price: Decimal::ZERO,
            open_orders: Vec::new(),
            canceled: Vec::new(),
            market_orders: Vec::new(),
            latency: Duration::ZERO,
        }
    }
}

/// In-memory exchange implementing the full adapter capability.
pub struct MockExchange {
    venue: Venue,
    clock: Arc<dyn Clock>,
    state: Arc<RwLock<MockState>>,
    order_seq: AtomicU64,
    reject_next: AtomicU32,
    timeout_next: AtomicU32,
    fail_queries_next: AtomicU32,
    fail_auth: AtomicBool,
}

impl MockExchange {
    pub fn new(venue: Venue, clock: Arc<dyn Clock>) -> Self {
        Self {
            venue,
            clock,
            state: Arc::new(RwLock::new(MockState::default())),
            order_seq: AtomicU64::new(1),
            reject_next: AtomicU32::new(0),
            timeout_next: AtomicU32::new(0),
            fail_queries_next: AtomicU32::new(0),
            fail_auth: AtomicBool::new(false),
        }
    }

    pub async fn set_mark_price(&self, price: Decimal) {
        self.state.write().await.mark_price = price;
    }

    /// Make the next market order fill only `ratio` of its requested size.
    pub async fn partial_fill_next_order(&self, ratio: Decimal) {
        self.state.write().await.partial_fill_next = Some(ratio);
    }

    /// Artificial per-call delay, for overlap tests.
    pub async fn set_latency(&self, latency: Duration) {
        self.state.write().await.latency = latency;
    }

    /// Reject the next `n` order submissions.
    pub fn reject_next_orders(&self, n: u32) {
        self.reject_next.store(n, Ordering::SeqCst);
    }

    /// Time out the next `n` order submissions.
    pub fn timeout_next_orders(&self, n: u32) {
        self.timeout_next.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` order/position queries with a transport error.
    pub fn fail_next_queries(&self, n: u32) {
        self.fail_queries_next.store(n, Ordering::SeqCst);
    }

    pub fn fail_authentication(&self, fail: bool) {
        self.fail_auth.store(fail, Ordering::SeqCst);
    }

    /// Market submissions recorded so far, as (side, requested size).
    pub async fn market_orders(&self) -> Vec<(Side, Decimal)> {
        self.state.read().await.market_orders.clone()
    }

    pub async fn open_order_count(&self) -> usize {
        self.state.read().await.open_orders.len()
    }

    pub async fn canceled_orders(&self) -> Vec<OrderId> {
        self.state.read().await.canceled.clone()
    }

    /// Simulate the venue filling a resting order: it leaves the open book
    /// and its size is applied to the net position.
    pub async fn fill_order(&self, id: &OrderId) -> bool {
        let mut state = self.state.write().await;
        let Some(index) = state.open_orders.iter().position(|o| &o.id == id) else {
            return false;
        };
        let order = state.open_orders.remove(index);
        match order.side {
            Side::Buy => state.position += order.size,
            Side::Sell => state.position -= order.size,
        }
        debug!(venue = %self.venue, order_id = %id, "mock resting order filled");
        true
    }

    /// Simulate an external flattening of the venue position.
    pub async fn flatten_position(&self) {
        let mut state = self.state.write().await;
        state.position = Decimal::ZERO;
        state.entry_price = Decimal::ZERO;
    }

    pub async fn position_size(&self) -> Decimal {
        self.state.read().await.position
    }

    fn next_order_id(&self) -> OrderId {
        let seq = self.order_seq.fetch_add(1, Ordering::SeqCst);
        OrderId::new(format!("{}-{}", self.venue.short_code(), seq))
    }

    /// Consume one unit from a failure counter if armed.
    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    async fn simulate_call(&self) -> ExchangeResult<()> {
        let latency = self.state.read().await.latency;
        if latency > Duration::ZERO {
            tokio::time::sleep(latency).await;
        }
        if Self::take_failure(&self.timeout_next) {
            return Err(ExchangeError::Timeout("mock timeout".into()));
        }
        if Self::take_failure(&self.reject_next) {
            return Err(ExchangeError::OrderRejected("mock rejection".into()));
        }
        Ok(())
    }

    async fn place_resting_order(
        &self,
        side: Side,
        size: Decimal,
        kind: OrderKind,
        price: Option<Decimal>,
        trigger_price: Option<Decimal>,
    ) -> ExchangeResult<OrderHandle> {
        self.simulate_call().await?;
        let id = self.next_order_id();
        let now = self.clock.now();
        let mut state = self.state.write().await;
        state.open_orders.push(Order {
            id: id.clone(),
            venue: self.venue,
            side,
            kind,
            size,
            price,
            trigger_price,
            status: OrderStatus::Open,
            executed_size: Decimal::ZERO,
            created_at: now,
            last_seen_at: now,
        });
        Ok(OrderHandle {
            id,
            status: OrderStatus::Open,
            executed_size: Decimal::ZERO,
            avg_fill_price: Decimal::ZERO,
        })
    }
}

#[async_trait]
impl ExchangeAdapter for MockExchange {
    fn venue(&self) -> Venue {
        self.venue
    }

    async fn authenticate(&self) -> ExchangeResult<()> {
        if self.fail_auth.load(Ordering::SeqCst) {
            return Err(ExchangeError::Auth("mock credentials refused".into()));
        }
        Ok(())
    }

    async fn place_market_order(&self, side: Side, size: Decimal) -> ExchangeResult<OrderHandle> {
        self.simulate_call().await?;
        let id = self.next_order_id();
        let mut state = self.state.write().await;
        let ratio = state.partial_fill_next.take().unwrap_or(Decimal::ONE);
        let executed = size * ratio;
        match side {
            Side::Buy => state.position += executed,
            Side::Sell => state.position -= executed,
        }
        state.entry_price = state.mark_price;
        state.market_orders.push((side, size));
        debug!(
            venue = %self.venue,
            order_id = %id,
            %side,
            %size,
            %executed,
            "mock market order executed"
        );
        Ok(OrderHandle {
            id,
            status: OrderStatus::Filled,
            executed_size: executed,
            avg_fill_price: state.mark_price,
        })
    }

    async fn place_limit_order(
        &self,
        side: Side,
        size: Decimal,
        price: Decimal,
    ) -> ExchangeResult<OrderHandle> {
        self.place_resting_order(side, size, OrderKind::Limit, Some(price), None)
            .await
    }

    async fn place_stop_order(
        &self,
        side: Side,
        size: Decimal,
        trigger_price: Decimal,
    ) -> ExchangeResult<OrderHandle> {
        self.place_resting_order(side, size, OrderKind::Stop, None, Some(trigger_price))
            .await
    }

    async fn cancel_order(&self, id: &OrderId) -> ExchangeResult<()> {
        let mut state = self.state.write().await;
        let Some(index) = state.open_orders.iter().position(|o| &o.id == id) else {
            return Err(ExchangeError::OrderNotFound(id.clone()));
        };
        state.open_orders.remove(index);
        state.canceled.push(id.clone());
        Ok(())
    }

    async fn list_open_orders(&self) -> ExchangeResult<Vec<Order>> {
        if Self::take_failure(&self.fail_queries_next) {
            return Err(ExchangeError::Transport("mock query failure".into()));
        }
        let now = self.clock.now();
        let mut state = self.state.write().await;
        for order in &mut state.open_orders {
            order.last_seen_at = now;
        }
        Ok(state.open_orders.clone())
    }

    async fn get_position(&self) -> ExchangeResult<Position> {
        if Self::take_failure(&self.fail_queries_next) {
            return Err(ExchangeError::Transport("mock query failure".into()));
        }
        let state = self.state.read().await;
        Ok(Position {
            venue: self.venue,
            size: state.position,
            entry_price: state.entry_price,
            unrealized_pnl: Decimal::ZERO,
        })
    }
}
