//! Periodic reconciliation between the registry and live venue state.
//!
//! Once per scheduler tick: snapshot open orders and positions on both
//! venues, cancel stale orders, detect protective fills and externally
//! flattened legs, close finished pairs, and hand drifted pairs to the
//! coordinator for repair. Ticks are strictly serialized; an overlapping
//! tick is skipped, never queued.

use crate::exchange::{
    ExchangeAdapter, ExchangeError, Order, OrderId, OrderStatus, Position, Venue,
};
use crate::pair::{PairRegistry, PairState, RiskOrderKind};
use crate::risk::RiskManager;
use crate::trading::coordinator::{OrderCoordinator, RepairOutcome};
use crate::utils::Clock;
use anyhow::{Context, Result};
use chrono::Duration as ChronoDuration;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Reconciliation parameters.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Open orders older than this are canceled.
    pub staleness_threshold: ChronoDuration,
    /// Leg imbalance beyond this triggers repair.
    pub drift_tolerance: Decimal,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            staleness_threshold: ChronoDuration::minutes(10),
            drift_tolerance: dec!(0.001),
        }
    }
}

/// What one reconciliation pass did.
#[derive(Debug, Clone, Default)]
pub struct TickReport {
    pub skipped: bool,
    pub stale_canceled: usize,
    pub protections_placed: usize,
    pub legs_closed: usize,
    pub repairs: usize,
    pub pairs_closed: usize,
    pub pairs_archived: usize,
}

impl TickReport {
    fn skipped() -> Self {
        Self {
            skipped: true,
            ..Default::default()
        }
    }
}

/// Detects and repairs divergence between registry and venues.
pub struct PositionReconciler {
    adapters: HashMap<Venue, Arc<dyn ExchangeAdapter>>,
    registry: Arc<PairRegistry>,
    coordinator: Arc<OrderCoordinator>,
    risk: Arc<RiskManager>,
    clock: Arc<dyn Clock>,
    config: ReconcilerConfig,
    /// Serializes ticks; a contended tick is skipped.
    tick_guard: Mutex<()>,
}

impl PositionReconciler {
    pub fn new(
        adapters: HashMap<Venue, Arc<dyn ExchangeAdapter>>,
        registry: Arc<PairRegistry>,
        coordinator: Arc<OrderCoordinator>,
        risk: Arc<RiskManager>,
        clock: Arc<dyn Clock>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            adapters,
            registry,
            coordinator,
            risk,
            clock,
            config,
            tick_guard: Mutex::new(()),
        }
    }

    /// One reconciliation pass. Returns a skipped report if the previous
    /// pass is still running. Any venue query error abandons the whole
    /// tick with registry state unchanged.
    pub async fn tick(&self) -> Result<TickReport> {
        let Ok(_running) = self.tick_guard.try_lock() else {
            warn!("previous reconciliation still in progress, skipping tick");
            return Ok(TickReport::skipped());
        };

        let now = self.clock.now();
        let mut report = TickReport::default();

        let mut open_orders: HashMap<Venue, Vec<Order>> = HashMap::new();
        let mut positions: HashMap<Venue, Position> = HashMap::new();
        for (venue, adapter) in &self.adapters {
            let orders = adapter
                .list_open_orders()
                .await
                .with_context(|| format!("listing open orders on {venue}"))?;
            let position = adapter
                .get_position()
                .await
                .with_context(|| format!("querying position on {venue}"))?;
            debug!(%venue, open_orders = orders.len(), position = %position.size, "venue snapshot");
            open_orders.insert(*venue, orders);
            positions.insert(*venue, position);
        }

        report.stale_canceled = self.cancel_stale_orders(&open_orders, now).await?;

        let open_ids: HashMap<Venue, HashSet<OrderId>> = open_orders
            .iter()
            .map(|(venue, orders)| {
                (
                    *venue,
                    orders
                        .iter()
                        .filter(|o| o.status.is_open())
                        .map(|o| o.id.clone())
                        .collect(),
                )
            })
            .collect();

        let mut attach_queue = Vec::new();
        let mut repair_queue = Vec::new();

        for pair in self.registry.active().await {
            let mut guard = pair.lock().await;
            if guard.state != PairState::BothFilled {
                continue;
            }

            for leg in guard.legs_mut() {
                if !leg.is_open() {
                    continue;
                }
                let venue_open = open_ids.get(&leg.venue);

                // A protective order we believe active but the venue no
                // longer lists has filled (cancellations are recorded at
                // cancel time).
                let triggered = [RiskOrderKind::TakeProfit, RiskOrderKind::StopLoss]
                    .into_iter()
                    .find(|kind| {
                        leg.risk_order(*kind).is_some_and(|r| {
                            r.is_active()
                                && venue_open.is_some_and(|ids| !ids.contains(&r.order_id))
                        })
                    });
                if let Some(kind) = triggered {
                    self.risk.handle_protection_fill(leg, kind).await?;
                    report.legs_closed += 1;
                    continue;
                }

                // Venue flat without an observed protective fill: the leg
                // was closed externally. Retire its protection.
                let venue_flat = positions.get(&leg.venue).is_some_and(|p| !p.is_open());
                if venue_flat {
                    info!(
                        venue = %leg.venue,
                        "venue reports flat position, marking leg closed"
                    );
                    self.risk.retire_protection(leg).await?;
                    leg.closed = true;
                    report.legs_closed += 1;
                }
            }

            if guard.both_legs_closed() {
                guard.transition(PairState::Closed, now)?;
                info!(pair_id = guard.id, "pair closed, both legs exited");
                report.pairs_closed += 1;
                continue;
            }

            if guard.drift() > self.config.drift_tolerance {
                repair_queue.push(pair.clone());
            }

            let missing_protection = guard.legs().into_iter().any(|leg| {
                leg.is_open()
                    && (!leg.protection_active(RiskOrderKind::TakeProfit)
                        || !leg.protection_active(RiskOrderKind::StopLoss))
            });
            if missing_protection {
                attach_queue.push(pair.clone());
            }
        }

        for pair in attach_queue {
            report.protections_placed += self.risk.attach_risk_orders(&pair).await?;
        }

        for pair in repair_queue {
            match self.coordinator.repair(&pair).await? {
                RepairOutcome::Repaired { venue, size } => {
                    info!(%venue, %size, "reconciler repaired drifted pair");
                    report.repairs += 1;
                }
                RepairOutcome::Escalated => {
                    warn!("drift repair escalated to unwind");
                }
                RepairOutcome::NotNeeded => {}
            }
        }

        report.pairs_archived = self.registry.archive_finished().await;

        debug!(
            stale_canceled = report.stale_canceled,
            legs_closed = report.legs_closed,
            repairs = report.repairs,
            pairs_closed = report.pairs_closed,
            "reconciliation pass complete"
        );
        Ok(report)
    }

    /// Cancel every open order older than the staleness threshold.
    ///
    /// Not an error path: stale protective orders are marked canceled in
    /// the registry so the protection pass re-places them.
    async fn cancel_stale_orders(
        &self,
        open_orders: &HashMap<Venue, Vec<Order>>,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<usize> {
        let mut canceled = 0;
        for (venue, orders) in open_orders {
            let Some(adapter) = self.adapters.get(venue) else {
                continue;
            };
            for order in orders.iter().filter(|o| o.status.is_open()) {
                let age = order.age(now);
                if age <= self.config.staleness_threshold {
                    continue;
                }
                info!(
                    %venue,
                    order_id = %order.id,
                    age_secs = age.num_seconds(),
                    "canceling stale order"
                );
                match adapter.cancel_order(&order.id).await {
                    Ok(()) => {
                        canceled += 1;
                        self.mark_risk_order_canceled(&order.id).await;
                    }
                    Err(ExchangeError::OrderNotFound(_)) => {
                        self.mark_risk_order_canceled(&order.id).await;
                    }
                    Err(e) => {
                        warn!(%venue, order_id = %order.id, error = %e, "stale cancel failed");
                    }
                }
            }
        }
        Ok(canceled)
    }

    /// Record a venue-side cancellation in the owning pair, if any.
    async fn mark_risk_order_canceled(&self, id: &OrderId) {
        for pair in self.registry.active().await {
            let mut guard = pair.lock().await;
            if let Some(risk_order) = guard.find_risk_order_mut(id) {
                risk_order.status = OrderStatus::Canceled;
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{MockExchange, Side};
    use crate::pair::DeltaPair;
    use crate::trading::coordinator::CoordinatorConfig;
    use crate::utils::MockClock;
    use chrono::{TimeZone, Utc};
    use std::time::Duration as StdDuration;

    struct Harness {
        paradex: Arc<MockExchange>,
        backpack: Arc<MockExchange>,
        registry: Arc<PairRegistry>,
        coordinator: Arc<OrderCoordinator>,
        reconciler: PositionReconciler,
        clock: Arc<MockClock>,
    }

    fn harness() -> Harness {
        let clock = Arc::new(MockClock::new(
            Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap(),
        ));
        let clock_dyn: Arc<dyn Clock> = clock.clone();
        let paradex = Arc::new(MockExchange::new(Venue::Paradex, clock_dyn.clone()));
        let backpack = Arc::new(MockExchange::new(Venue::Backpack, clock_dyn.clone()));
        let registry = Arc::new(PairRegistry::new());

        let mut adapters: HashMap<Venue, Arc<dyn ExchangeAdapter>> = HashMap::new();
        adapters.insert(Venue::Paradex, paradex.clone());
        adapters.insert(Venue::Backpack, backpack.clone());

        let coordinator = Arc::new(OrderCoordinator::new(
            adapters.clone(),
            registry.clone(),
            clock_dyn.clone(),
            CoordinatorConfig {
                order_timeout: StdDuration::from_secs(2),
                max_order_retries: 3,
                retry_backoff: StdDuration::from_millis(1),
                drift_tolerance: dec!(0.001),
            },
        ));
        let risk = Arc::new(RiskManager::new(
            adapters.clone(),
            crate::risk::ProtectionConfig::default(),
        ));
        let reconciler = PositionReconciler::new(
            adapters,
            registry.clone(),
            coordinator.clone(),
            risk,
            clock_dyn,
            ReconcilerConfig::default(),
        );

        Harness {
            paradex,
            backpack,
            registry,
            coordinator,
            reconciler,
            clock,
        }
    }

    async fn open_pair(h: &Harness) -> Arc<Mutex<DeltaPair>> {
        h.coordinator
            .open_pair(dec!(0.1), Venue::Paradex, Venue::Backpack)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_stale_order_canceled_only_after_threshold() {
        let h = harness();
        h.paradex
            .place_limit_order(Side::Sell, dec!(0.1), dec!(110))
            .await
            .unwrap();

        // 9 minutes old: kept.
        h.clock.advance(ChronoDuration::minutes(9));
        let report = h.reconciler.tick().await.unwrap();
        assert_eq!(report.stale_canceled, 0);
        assert_eq!(h.paradex.open_order_count().await, 1);

        // 11 minutes old: canceled.
        h.clock.advance(ChronoDuration::minutes(2));
        let report = h.reconciler.tick().await.unwrap();
        assert_eq!(report.stale_canceled, 1);
        assert_eq!(h.paradex.open_order_count().await, 0);
    }

    #[tokio::test]
    async fn test_first_tick_attaches_protection() {
        let h = harness();
        open_pair(&h).await;

        let report = h.reconciler.tick().await.unwrap();
        assert_eq!(report.protections_placed, 4);
        assert_eq!(h.paradex.open_order_count().await, 2);
        assert_eq!(h.backpack.open_order_count().await, 2);

        // Second tick is a no-op.
        let report = h.reconciler.tick().await.unwrap();
        assert_eq!(report.protections_placed, 0);
    }

    #[tokio::test]
    async fn test_protective_fill_closes_leg_and_cancels_sibling() {
        let h = harness();
        let pair = open_pair(&h).await;
        h.reconciler.tick().await.unwrap();

        let tp_id = pair
            .lock()
            .await
            .long_leg
            .take_profit
            .as_ref()
            .unwrap()
            .order_id
            .clone();
        assert!(h.paradex.fill_order(&tp_id).await);

        let report = h.reconciler.tick().await.unwrap();
        assert_eq!(report.legs_closed, 1);

        let guard = pair.lock().await;
        assert!(guard.long_leg.closed);
        assert_eq!(guard.state, PairState::BothFilled);
        // Sibling stop-loss canceled on the venue.
        assert_eq!(h.paradex.open_order_count().await, 0);
    }

    #[tokio::test]
    async fn test_both_protective_fills_close_and_archive_pair() {
        let h = harness();
        let pair = open_pair(&h).await;
        h.reconciler.tick().await.unwrap();

        let (long_tp, short_tp) = {
            let guard = pair.lock().await;
            (
                guard.long_leg.take_profit.as_ref().unwrap().order_id.clone(),
                guard.short_leg.take_profit.as_ref().unwrap().order_id.clone(),
            )
        };
        h.paradex.fill_order(&long_tp).await;
        h.backpack.fill_order(&short_tp).await;

        let report = h.reconciler.tick().await.unwrap();
        assert_eq!(report.legs_closed, 2);
        assert_eq!(report.pairs_closed, 1);
        assert_eq!(report.pairs_archived, 1);
        assert_eq!(pair.lock().await.state, PairState::Closed);
        assert_eq!(h.registry.active_count().await, 0);
    }

    #[tokio::test]
    async fn test_externally_flattened_leg_retires_protection() {
        let h = harness();
        let pair = open_pair(&h).await;
        h.reconciler.tick().await.unwrap();

        h.paradex.flatten_position().await;

        let report = h.reconciler.tick().await.unwrap();
        assert_eq!(report.legs_closed, 1);
        assert!(pair.lock().await.long_leg.closed);
        assert_eq!(h.paradex.open_order_count().await, 0);
    }

    #[tokio::test]
    async fn test_drifted_pair_is_repaired() {
        let h = harness();
        let pair = open_pair(&h).await;
        h.reconciler.tick().await.unwrap();

        pair.lock().await.short_leg.executed_size = dec!(0.08);

        let report = h.reconciler.tick().await.unwrap();
        assert_eq!(report.repairs, 1);
        assert_eq!(pair.lock().await.drift(), Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_stale_protective_order_is_replaced_same_tick() {
        let h = harness();
        let pair = open_pair(&h).await;
        h.reconciler.tick().await.unwrap();
        let old_tp = pair
            .lock()
            .await
            .long_leg
            .take_profit
            .as_ref()
            .unwrap()
            .order_id
            .clone();

        // All four protective orders age past the threshold.
        h.clock.advance(ChronoDuration::minutes(11));

        let report = h.reconciler.tick().await.unwrap();
        assert_eq!(report.stale_canceled, 4);
        assert_eq!(report.protections_placed, 4);

        let guard = pair.lock().await;
        let new_tp = guard.long_leg.take_profit.as_ref().unwrap();
        assert_ne!(new_tp.order_id, old_tp);
        assert!(new_tp.is_active());
    }

    #[tokio::test]
    async fn test_overlapping_ticks_skip_instead_of_queueing() {
        let h = harness();
        open_pair(&h).await;
        h.paradex.set_latency(StdDuration::from_millis(50)).await;
        h.backpack.set_latency(StdDuration::from_millis(50)).await;

        let (a, b) = tokio::join!(h.reconciler.tick(), h.reconciler.tick());
        let (a, b) = (a.unwrap(), b.unwrap());
        assert!(a.skipped != b.skipped, "exactly one tick must be skipped");
    }

    #[tokio::test]
    async fn test_venue_query_failure_abandons_tick() {
        let h = harness();
        open_pair(&h).await;
        h.paradex.fail_next_queries(1);

        assert!(h.reconciler.tick().await.is_err());
        // No protection was attached during the abandoned tick.
        assert_eq!(h.paradex.open_order_count().await, 0);

        // Next tick recovers.
        let report = h.reconciler.tick().await.unwrap();
        assert_eq!(report.protections_placed, 4);
    }
}
