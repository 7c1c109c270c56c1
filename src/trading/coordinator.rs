//! Dual-leg order coordination.
//!
//! Places the two legs of a pair concurrently, resolves partial failure
//! into a terminal pair state, and repairs drift on live pairs. There is
//! no transaction across the two venues: a non-`BothFilled` outcome is
//! always followed by an unwind attempt so no leg is left naked.

use crate::exchange::{ExchangeAdapter, ExchangeError, ExchangeResult, OrderHandle, Side, Venue};
use crate::pair::{DeltaPair, PairRegistry, PairState};
use crate::utils::decimal::percentage_diff;
use crate::utils::Clock;
use anyhow::{anyhow, ensure, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

/// Execution parameters for pair entry, unwind, and repair.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Shared confirmation bound for both legs of a submission.
    pub order_timeout: Duration,
    /// Attempts per leg before a submission counts as failed.
    pub max_order_retries: u32,
    /// Base backoff between attempts, scaled linearly per attempt.
    pub retry_backoff: Duration,
    /// Maximum tolerated size imbalance between the legs.
    pub drift_tolerance: Decimal,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            order_timeout: Duration::from_secs(30),
            max_order_retries: 3,
            retry_backoff: Duration::from_millis(500),
            drift_tolerance: dec!(0.001),
        }
    }
}

/// Result of a drift repair attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum RepairOutcome {
    /// Drift within tolerance, nothing placed.
    NotNeeded,
    /// The lagging leg was extended by `size`.
    Repaired { venue: Venue, size: Decimal },
    /// The repair order failed; the pair was pushed onto the unwind path.
    Escalated,
}

/// Places matched pairs of opposite orders across two venues.
pub struct OrderCoordinator {
    adapters: HashMap<Venue, Arc<dyn ExchangeAdapter>>,
    registry: Arc<PairRegistry>,
    clock: Arc<dyn Clock>,
    config: CoordinatorConfig,
}

impl OrderCoordinator {
    pub fn new(
        adapters: HashMap<Venue, Arc<dyn ExchangeAdapter>>,
        registry: Arc<PairRegistry>,
        clock: Arc<dyn Clock>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            adapters,
            registry,
            clock,
            config,
        }
    }

    fn adapter(&self, venue: Venue) -> Result<Arc<dyn ExchangeAdapter>> {
        self.adapters
            .get(&venue)
            .cloned()
            .ok_or_else(|| anyhow!("no adapter registered for {venue}"))
    }

    /// Open a delta-neutral pair: buy `size` on `long_venue`, sell `size`
    /// on `short_venue`, both at market and at the same time.
    ///
    /// The returned pair is registered and already in its resolved state:
    /// `BothFilled` on success, or a terminal state after unwind handling.
    pub async fn open_pair(
        &self,
        size: Decimal,
        long_venue: Venue,
        short_venue: Venue,
    ) -> Result<Arc<Mutex<DeltaPair>>> {
        ensure!(size > Decimal::ZERO, "order size must be positive, got {size}");
        ensure!(
            long_venue != short_venue,
            "pair legs must be on distinct exchanges"
        );
        let long_adapter = self.adapter(long_venue)?;
        let short_adapter = self.adapter(short_venue)?;

        let pair = self
            .registry
            .create(size, long_venue, short_venue, self.clock.now())
            .await;
        let mut guard = pair.lock().await;
        info!(
            pair_id = guard.id,
            %size,
            long = %long_venue,
            short = %short_venue,
            "opening delta-neutral pair"
        );

        // Both legs go out together; one shared confirmation bound.
        let (long_result, short_result) = tokio::join!(
            Self::submit_leg(long_adapter.as_ref(), Side::Buy, size, &self.config),
            Self::submit_leg(short_adapter.as_ref(), Side::Sell, size, &self.config),
        );

        if let Ok(handle) = &long_result {
            guard.long_leg.apply_fill(handle);
        }
        if let Ok(handle) = &short_result {
            guard.short_leg.apply_fill(handle);
        }

        let both_confirmed = matches!(
            (&long_result, &short_result),
            (Ok(l), Ok(s)) if l.is_filled() && s.is_filled()
        );
        let imbalance =
            (guard.long_leg.executed_size - guard.short_leg.executed_size).abs();

        if both_confirmed && imbalance <= self.config.drift_tolerance {
            guard.transition(PairState::BothFilled, self.clock.now())?;
            info!(
                pair_id = guard.id,
                long_filled = %guard.long_leg.executed_size,
                short_filled = %guard.short_leg.executed_size,
                "both legs filled"
            );
            drop(guard);
            return Ok(pair);
        }

        if let Err(e) = &long_result {
            warn!(pair_id = guard.id, venue = %long_venue, error = %e, "long leg failed");
        }
        if let Err(e) = &short_result {
            warn!(pair_id = guard.id, venue = %short_venue, error = %e, "short leg failed");
        }
        if both_confirmed {
            warn!(
                pair_id = guard.id,
                %imbalance,
                mismatch_pct = %percentage_diff(
                    guard.long_leg.executed_size,
                    guard.short_leg.executed_size
                ),
                tolerance = %self.config.drift_tolerance,
                "fill sizes diverged beyond tolerance"
            );
        }

        if !guard.long_leg.is_filled() && !guard.short_leg.is_filled() {
            // Rejected before any fill: nothing to unwind.
            guard.transition(PairState::Failed, self.clock.now())?;
            warn!(pair_id = guard.id, "pair failed with no fills");
            drop(guard);
            return Ok(pair);
        }

        self.unwind_locked(&mut guard).await?;
        drop(guard);
        Ok(pair)
    }

    /// Extend the lagging leg of a drifted pair back toward balance.
    ///
    /// The repair order is sized to the detected gap, never more, so it
    /// cannot overshoot into the opposite imbalance. A repair that fails
    /// after retries escalates the pair onto the unwind path.
    pub async fn repair(&self, pair: &Arc<Mutex<DeltaPair>>) -> Result<RepairOutcome> {
        let mut guard = pair.lock().await;
        if guard.state != PairState::BothFilled {
            return Ok(RepairOutcome::NotNeeded);
        }
        let drift = guard.drift();
        if drift <= self.config.drift_tolerance {
            return Ok(RepairOutcome::NotNeeded);
        }

        let (lagging_venue, lagging_side, gap) = {
            let (lagging, leading) =
                if guard.long_leg.executed_size < guard.short_leg.executed_size {
                    (&guard.long_leg, &guard.short_leg)
                } else {
                    (&guard.short_leg, &guard.long_leg)
                };
            (
                lagging.venue,
                lagging.side,
                leading.executed_size - lagging.executed_size,
            )
        };
        let quantity = gap.min(guard.target_size);
        info!(
            pair_id = guard.id,
            venue = %lagging_venue,
            %drift,
            %quantity,
            "repairing leg drift"
        );

        let adapter = self.adapter(lagging_venue)?;
        match Self::submit_leg(adapter.as_ref(), lagging_side, quantity, &self.config).await {
            Ok(handle) if handle.is_filled() => {
                if let Some(leg) = guard.leg_mut(lagging_venue) {
                    leg.apply_fill(&handle);
                }
                info!(
                    pair_id = guard.id,
                    venue = %lagging_venue,
                    repaired = %handle.executed_size,
                    remaining_drift = %guard.drift(),
                    "drift repaired"
                );
                Ok(RepairOutcome::Repaired {
                    venue: lagging_venue,
                    size: handle.executed_size,
                })
            }
            Ok(handle) => {
                error!(
                    pair_id = guard.id,
                    status = ?handle.status,
                    "repair order not filled, unwinding pair"
                );
                self.unwind_locked(&mut guard).await?;
                Ok(RepairOutcome::Escalated)
            }
            Err(e) => {
                error!(
                    pair_id = guard.id,
                    error = %e,
                    "repair order failed, unwinding pair"
                );
                self.unwind_locked(&mut guard).await?;
                Ok(RepairOutcome::Escalated)
            }
        }
    }

    /// Close every filled leg at market so no naked position survives.
    ///
    /// Single pass with the same bounded retry as entries; a leg that
    /// still fails parks the pair in `UnwindFailed` for the operator
    /// instead of retrying forever against a possibly naked position.
    async fn unwind_locked(&self, pair: &mut DeltaPair) -> Result<()> {
        pair.transition(PairState::Unwinding, self.clock.now())?;
        warn!(pair_id = pair.id, "unwinding filled legs");

        let mut all_closed = true;
        for leg in pair.legs_mut() {
            if !leg.is_open() {
                continue;
            }
            let Some(adapter) = self.adapters.get(&leg.venue).cloned() else {
                error!(venue = %leg.venue, "no adapter for leg, cannot unwind");
                all_closed = false;
                continue;
            };
            let close_side = leg.side.opposite();
            match Self::place_with_retry(
                adapter.as_ref(),
                close_side,
                leg.executed_size,
                &self.config,
            )
            .await
            {
                Ok(handle) if handle.is_filled() && handle.executed_size >= leg.executed_size => {
                    info!(
                        venue = %leg.venue,
                        side = %close_side,
                        size = %leg.executed_size,
                        "leg unwound"
                    );
                    leg.closed = true;
                }
                Ok(handle) => {
                    error!(venue = %leg.venue, status = ?handle.status, "unwind order not filled");
                    all_closed = false;
                }
                Err(e) => {
                    error!(venue = %leg.venue, error = %e, "unwind order failed");
                    all_closed = false;
                }
            }
        }

        if all_closed {
            pair.transition(PairState::Unwound, self.clock.now())?;
            info!(pair_id = pair.id, "pair unwound");
        } else {
            pair.transition(PairState::UnwindFailed, self.clock.now())?;
            error!(
                pair_id = pair.id,
                "unwind failed, operator attention required"
            );
        }
        Ok(())
    }

    /// One leg submission: bounded retry under the shared timeout.
    async fn submit_leg(
        adapter: &dyn ExchangeAdapter,
        side: Side,
        size: Decimal,
        config: &CoordinatorConfig,
    ) -> ExchangeResult<OrderHandle> {
        match tokio::time::timeout(
            config.order_timeout,
            Self::place_with_retry(adapter, side, size, config),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(ExchangeError::Timeout(format!(
                "leg confirmation exceeded {:?}",
                config.order_timeout
            ))),
        }
    }

    /// Market order with bounded retry and linear backoff.
    ///
    /// Rejections and transient failures both count against the bound;
    /// auth failures abort immediately.
    async fn place_with_retry(
        adapter: &dyn ExchangeAdapter,
        side: Side,
        size: Decimal,
        config: &CoordinatorConfig,
    ) -> ExchangeResult<OrderHandle> {
        let mut last_error = None;
        for attempt in 1..=config.max_order_retries {
            match adapter.place_market_order(side, size).await {
                Ok(handle) => return Ok(handle),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!(
                        venue = %adapter.venue(),
                        attempt,
                        max_retries = config.max_order_retries,
                        error = %e,
                        "order attempt failed"
                    );
                    last_error = Some(e);
                    if attempt < config.max_order_retries {
                        tokio::time::sleep(config.retry_backoff * attempt).await;
                    }
                }
            }
        }
        Err(last_error
            .unwrap_or_else(|| ExchangeError::OrderRejected("retries exhausted".into())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::MockExchange;
    use crate::utils::SystemClock;

    struct Harness {
        paradex: Arc<MockExchange>,
        backpack: Arc<MockExchange>,
        registry: Arc<PairRegistry>,
        coordinator: OrderCoordinator,
    }

    fn fast_config() -> CoordinatorConfig {
        CoordinatorConfig {
            order_timeout: Duration::from_secs(2),
            max_order_retries: 3,
            retry_backoff: Duration::from_millis(1),
            drift_tolerance: dec!(0.001),
        }
    }

    fn harness() -> Harness {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let paradex = Arc::new(MockExchange::new(Venue::Paradex, clock.clone()));
        let backpack = Arc::new(MockExchange::new(Venue::Backpack, clock.clone()));
        let registry = Arc::new(PairRegistry::new());

        let mut adapters: HashMap<Venue, Arc<dyn ExchangeAdapter>> = HashMap::new();
        adapters.insert(Venue::Paradex, paradex.clone());
        adapters.insert(Venue::Backpack, backpack.clone());

        let coordinator =
            OrderCoordinator::new(adapters, registry.clone(), clock, fast_config());
        Harness {
            paradex,
            backpack,
            registry,
            coordinator,
        }
    }

    #[tokio::test]
    async fn test_open_pair_reaches_both_filled_within_tolerance() {
        let h = harness();
        let pair = h
            .coordinator
            .open_pair(dec!(0.1), Venue::Paradex, Venue::Backpack)
            .await
            .unwrap();

        let guard = pair.lock().await;
        assert_eq!(guard.state, PairState::BothFilled);
        assert!(guard.drift() <= dec!(0.001));
        assert_eq!(guard.long_leg.executed_size, dec!(0.1));
        assert_eq!(guard.short_leg.executed_size, dec!(0.1));
        assert_eq!(h.paradex.position_size().await, dec!(0.1));
        assert_eq!(h.backpack.position_size().await, dec!(-0.1));
    }

    #[tokio::test]
    async fn test_rejected_short_leg_unwinds_filled_long_leg() {
        let h = harness();
        h.backpack.reject_next_orders(3); // exhaust all attempts

        let pair = h
            .coordinator
            .open_pair(dec!(0.1), Venue::Paradex, Venue::Backpack)
            .await
            .unwrap();

        let guard = pair.lock().await;
        assert_eq!(guard.state, PairState::Unwound);
        assert!(guard.long_leg.closed);

        // Entry buy then unwind sell, leaving the venue flat.
        let orders = h.paradex.market_orders().await;
        assert_eq!(orders, vec![(Side::Buy, dec!(0.1)), (Side::Sell, dec!(0.1))]);
        assert_eq!(h.paradex.position_size().await, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_both_legs_rejected_is_failed_without_unwind() {
        let h = harness();
        h.paradex.reject_next_orders(3);
        h.backpack.reject_next_orders(3);

        let pair = h
            .coordinator
            .open_pair(dec!(0.1), Venue::Paradex, Venue::Backpack)
            .await
            .unwrap();

        let guard = pair.lock().await;
        assert_eq!(guard.state, PairState::Failed);
        assert_eq!(h.paradex.market_orders().await.len(), 3);
        assert_eq!(h.backpack.market_orders().await.len(), 3);
    }

    #[tokio::test]
    async fn test_timeouts_are_retried_then_unwound() {
        let h = harness();
        h.backpack.timeout_next_orders(3);

        let pair = h
            .coordinator
            .open_pair(dec!(0.1), Venue::Paradex, Venue::Backpack)
            .await
            .unwrap();

        assert_eq!(pair.lock().await.state, PairState::Unwound);
        assert_eq!(h.paradex.position_size().await, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_partial_fill_mismatch_unwinds_both_legs() {
        let h = harness();
        h.backpack.partial_fill_next_order(dec!(0.5)).await;

        let pair = h
            .coordinator
            .open_pair(dec!(0.1), Venue::Paradex, Venue::Backpack)
            .await
            .unwrap();

        let guard = pair.lock().await;
        assert_eq!(guard.state, PairState::Unwound);
        assert!(guard.long_leg.closed);
        assert!(guard.short_leg.closed);
        assert_eq!(h.paradex.position_size().await, Decimal::ZERO);
        assert_eq!(h.backpack.position_size().await, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_open_pair_validates_inputs() {
        let h = harness();
        assert!(h
            .coordinator
            .open_pair(Decimal::ZERO, Venue::Paradex, Venue::Backpack)
            .await
            .is_err());
        assert!(h
            .coordinator
            .open_pair(dec!(0.1), Venue::Paradex, Venue::Paradex)
            .await
            .is_err());
        assert_eq!(h.registry.active_count().await, 0);
    }

    #[tokio::test]
    async fn test_repair_extends_lagging_leg_by_gap() {
        let h = harness();
        let pair = h
            .coordinator
            .open_pair(dec!(0.1), Venue::Paradex, Venue::Backpack)
            .await
            .unwrap();

        // Simulate the short leg having shrunk since entry.
        pair.lock().await.short_leg.executed_size = dec!(0.08);

        let outcome = h.coordinator.repair(&pair).await.unwrap();
        assert_eq!(
            outcome,
            RepairOutcome::Repaired {
                venue: Venue::Backpack,
                size: dec!(0.02)
            }
        );

        let guard = pair.lock().await;
        assert_eq!(guard.short_leg.executed_size, dec!(0.1));
        assert_eq!(guard.drift(), Decimal::ZERO);
        let orders = h.backpack.market_orders().await;
        assert_eq!(orders.last(), Some(&(Side::Sell, dec!(0.02))));
    }

    #[tokio::test]
    async fn test_drift_at_tolerance_is_not_repaired() {
        let h = harness();
        let pair = h
            .coordinator
            .open_pair(dec!(0.1), Venue::Paradex, Venue::Backpack)
            .await
            .unwrap();

        // Exactly at tolerance: no repair.
        pair.lock().await.short_leg.executed_size = dec!(0.099);
        assert_eq!(
            h.coordinator.repair(&pair).await.unwrap(),
            RepairOutcome::NotNeeded
        );

        // One tick beyond: repaired.
        pair.lock().await.short_leg.executed_size = dec!(0.0989);
        assert!(matches!(
            h.coordinator.repair(&pair).await.unwrap(),
            RepairOutcome::Repaired { .. }
        ));
    }

    #[tokio::test]
    async fn test_failed_repair_escalates_to_unwind() {
        let h = harness();
        let pair = h
            .coordinator
            .open_pair(dec!(0.1), Venue::Paradex, Venue::Backpack)
            .await
            .unwrap();

        pair.lock().await.short_leg.executed_size = dec!(0.08);
        h.backpack.reject_next_orders(3);

        let outcome = h.coordinator.repair(&pair).await.unwrap();
        assert_eq!(outcome, RepairOutcome::Escalated);
        assert_eq!(pair.lock().await.state, PairState::Unwound);
        assert_eq!(h.paradex.position_size().await, Decimal::ZERO);
    }
}
