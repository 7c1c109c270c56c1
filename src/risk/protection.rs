//! Protective order management for filled pairs.
//!
//! Every filled leg gets one take-profit (reduce-direction limit) and one
//! stop-loss (reduce-direction stop). Attachment is idempotent per leg, so
//! the reconciler can invoke it every tick without duplicating orders.

use crate::exchange::{ExchangeAdapter, ExchangeError, OrderStatus, Side, Venue};
use crate::pair::{DeltaPair, Leg, PairState, RiskOrder, RiskOrderKind};
use crate::utils::decimal::round_to_tick;
use anyhow::{Context, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Protective order parameters.
#[derive(Debug, Clone)]
pub struct ProtectionConfig {
    /// Take-profit distance from entry, in percent (0.5 = 0.5%).
    pub take_profit_pct: Decimal,
    /// Stop-loss distance from entry, in percent.
    pub stop_loss_pct: Decimal,
    /// Venue price tick used to round trigger prices.
    pub price_tick: Decimal,
}

impl Default for ProtectionConfig {
    fn default() -> Self {
        Self {
            take_profit_pct: dec!(0.5),
            stop_loss_pct: dec!(0.5),
            price_tick: dec!(0.01),
        }
    }
}

/// Attaches and maintains take-profit / stop-loss orders per leg.
pub struct RiskManager {
    adapters: HashMap<Venue, Arc<dyn ExchangeAdapter>>,
    config: ProtectionConfig,
}

impl RiskManager {
    pub fn new(
        adapters: HashMap<Venue, Arc<dyn ExchangeAdapter>>,
        config: ProtectionConfig,
    ) -> Self {
        Self { adapters, config }
    }

    /// Take-profit trigger for a leg entered on `side` at `entry_price`.
    ///
    /// Long legs profit above entry, short legs below.
    pub fn take_profit_price(&self, side: Side, entry_price: Decimal) -> Decimal {
        let fraction = self.config.take_profit_pct / dec!(100);
        let raw = match side {
            Side::Buy => entry_price * (Decimal::ONE + fraction),
            Side::Sell => entry_price * (Decimal::ONE - fraction),
        };
        round_to_tick(raw, self.config.price_tick)
    }

    /// Stop-loss trigger, symmetric to the take-profit on the other side
    /// of entry.
    pub fn stop_loss_price(&self, side: Side, entry_price: Decimal) -> Decimal {
        let fraction = self.config.stop_loss_pct / dec!(100);
        let raw = match side {
            Side::Buy => entry_price * (Decimal::ONE - fraction),
            Side::Sell => entry_price * (Decimal::ONE + fraction),
        };
        round_to_tick(raw, self.config.price_tick)
    }

    /// Ensure each open leg of a filled pair carries one active take-profit
    /// and one active stop-loss. Legs that already have active protection
    /// are left alone. Returns the number of orders placed.
    pub async fn attach_risk_orders(&self, pair: &Arc<Mutex<DeltaPair>>) -> Result<usize> {
        let mut guard = pair.lock().await;
        if guard.state != PairState::BothFilled {
            return Ok(0);
        }

        let pair_id = guard.id;
        let mut placed = 0;
        for leg in guard.legs_mut() {
            if !leg.is_open() {
                continue;
            }
            let Some(adapter) = self.adapters.get(&leg.venue).cloned() else {
                warn!(venue = %leg.venue, "no adapter for leg, skipping protection");
                continue;
            };
            let close_side = leg.side.opposite();

            if !leg.protection_active(RiskOrderKind::TakeProfit) {
                let price = self.take_profit_price(leg.side, leg.entry_price);
                let handle = adapter
                    .place_limit_order(close_side, leg.executed_size, price)
                    .await
                    .with_context(|| format!("placing take-profit on {}", leg.venue))?;
                info!(
                    pair_id,
                    venue = %leg.venue,
                    order_id = %handle.id,
                    %price,
                    "take-profit attached"
                );
                leg.take_profit = Some(RiskOrder {
                    order_id: handle.id,
                    kind: RiskOrderKind::TakeProfit,
                    trigger_price: price,
                    status: OrderStatus::Open,
                });
                placed += 1;
            }

            if !leg.protection_active(RiskOrderKind::StopLoss) {
                let price = self.stop_loss_price(leg.side, leg.entry_price);
                let handle = adapter
                    .place_stop_order(close_side, leg.executed_size, price)
                    .await
                    .with_context(|| format!("placing stop-loss on {}", leg.venue))?;
                info!(
                    pair_id,
                    venue = %leg.venue,
                    order_id = %handle.id,
                    %price,
                    "stop-loss attached"
                );
                leg.stop_loss = Some(RiskOrder {
                    order_id: handle.id,
                    kind: RiskOrderKind::StopLoss,
                    trigger_price: price,
                    status: OrderStatus::Open,
                });
                placed += 1;
            }
        }
        Ok(placed)
    }

    /// A protective order on `leg` filled: cancel its sibling and mark the
    /// leg closed. Safe to re-run if the sibling cancel fails transiently.
    pub async fn handle_protection_fill(
        &self,
        leg: &mut Leg,
        filled_kind: RiskOrderKind,
    ) -> Result<()> {
        if let Some(filled) = leg.risk_order_mut(filled_kind) {
            filled.status = OrderStatus::Filled;
        }
        info!(
            venue = %leg.venue,
            kind = ?filled_kind,
            "protective order filled, closing leg"
        );

        let sibling_kind = filled_kind.sibling();
        let sibling_id = leg
            .risk_order(sibling_kind)
            .filter(|r| r.is_active())
            .map(|r| r.order_id.clone());

        if let Some(id) = sibling_id {
            let Some(adapter) = self.adapters.get(&leg.venue).cloned() else {
                anyhow::bail!("no adapter for {} while canceling sibling", leg.venue);
            };
            match adapter.cancel_order(&id).await {
                Ok(()) => {}
                // Already gone on the venue: nothing left to cancel.
                Err(ExchangeError::OrderNotFound(_)) => {}
                Err(e) => {
                    return Err(e).with_context(|| {
                        format!("canceling sibling {sibling_kind:?} on {}", leg.venue)
                    })
                }
            }
            if let Some(sibling) = leg.risk_order_mut(sibling_kind) {
                sibling.status = OrderStatus::Canceled;
            }
        }

        leg.closed = true;
        Ok(())
    }

    /// Cancel every still-active protective order on a leg that no longer
    /// carries exposure (e.g. the venue position was flattened externally).
    pub async fn retire_protection(&self, leg: &mut Leg) -> Result<usize> {
        let mut retired = 0;
        for kind in [RiskOrderKind::TakeProfit, RiskOrderKind::StopLoss] {
            let Some(id) = leg
                .risk_order(kind)
                .filter(|r| r.is_active())
                .map(|r| r.order_id.clone())
            else {
                continue;
            };
            let Some(adapter) = self.adapters.get(&leg.venue).cloned() else {
                anyhow::bail!("no adapter for {} while retiring protection", leg.venue);
            };
            match adapter.cancel_order(&id).await {
                Ok(()) | Err(ExchangeError::OrderNotFound(_)) => {}
                Err(e) => {
                    return Err(e)
                        .with_context(|| format!("retiring {kind:?} on {}", leg.venue))
                }
            }
            if let Some(risk_order) = leg.risk_order_mut(kind) {
                risk_order.status = OrderStatus::Canceled;
            }
            retired += 1;
        }
        if retired > 0 {
            info!(venue = %leg.venue, retired, "protective orders retired");
        }
        Ok(retired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{MockExchange, OrderHandle, OrderId};
    use crate::pair::PairRegistry;
    use crate::utils::{Clock, SystemClock};
    use chrono::Utc;

    struct Harness {
        paradex: Arc<MockExchange>,
        backpack: Arc<MockExchange>,
        registry: Arc<PairRegistry>,
        risk: RiskManager,
    }

    fn harness() -> Harness {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let paradex = Arc::new(MockExchange::new(Venue::Paradex, clock.clone()));
        let backpack = Arc::new(MockExchange::new(Venue::Backpack, clock.clone()));
        let registry = Arc::new(PairRegistry::new());

        let mut adapters: HashMap<Venue, Arc<dyn ExchangeAdapter>> = HashMap::new();
        adapters.insert(Venue::Paradex, paradex.clone());
        adapters.insert(Venue::Backpack, backpack.clone());

        let risk = RiskManager::new(adapters, ProtectionConfig::default());
        Harness {
            paradex,
            backpack,
            registry,
            risk,
        }
    }

    async fn filled_pair(h: &Harness) -> Arc<Mutex<DeltaPair>> {
        let pair = h
            .registry
            .create(dec!(0.1), Venue::Paradex, Venue::Backpack, Utc::now())
            .await;
        let mut guard = pair.lock().await;
        let fill = |id: &str| OrderHandle {
            id: OrderId::new(id),
            status: OrderStatus::Filled,
            executed_size: dec!(0.1),
            avg_fill_price: dec!(100),
        };
        guard.long_leg.apply_fill(&fill("entry-long"));
        guard.short_leg.apply_fill(&fill("entry-short"));
        guard.transition(PairState::BothFilled, Utc::now()).unwrap();
        drop(guard);
        pair
    }

    #[test]
    fn test_trigger_prices_at_half_percent() {
        let h = harness();
        // entry 100, 0.5%: long TP above, short TP below
        assert_eq!(h.risk.take_profit_price(Side::Buy, dec!(100)), dec!(100.5));
        assert_eq!(h.risk.take_profit_price(Side::Sell, dec!(100)), dec!(99.5));
        assert_eq!(h.risk.stop_loss_price(Side::Buy, dec!(100)), dec!(99.5));
        assert_eq!(h.risk.stop_loss_price(Side::Sell, dec!(100)), dec!(100.5));
    }

    #[test]
    fn test_trigger_prices_round_to_tick() {
        let h = harness();
        // 3333.33 * 1.005 = 3349.996..., rounds to the cent
        assert_eq!(
            h.risk.take_profit_price(Side::Buy, dec!(3333.33)),
            dec!(3350.00)
        );
    }

    #[tokio::test]
    async fn test_attach_is_idempotent() {
        let h = harness();
        let pair = filled_pair(&h).await;

        let first = h.risk.attach_risk_orders(&pair).await.unwrap();
        assert_eq!(first, 4); // TP + SL on each of two legs

        let second = h.risk.attach_risk_orders(&pair).await.unwrap();
        assert_eq!(second, 0);

        // Exactly one TP and one SL per leg on each venue.
        assert_eq!(h.paradex.open_order_count().await, 2);
        assert_eq!(h.backpack.open_order_count().await, 2);
    }

    #[tokio::test]
    async fn test_attach_replaces_canceled_protection() {
        let h = harness();
        let pair = filled_pair(&h).await;
        h.risk.attach_risk_orders(&pair).await.unwrap();

        {
            let mut guard = pair.lock().await;
            let tp = guard.long_leg.take_profit.as_mut().unwrap();
            tp.status = OrderStatus::Canceled;
        }

        let placed = h.risk.attach_risk_orders(&pair).await.unwrap();
        assert_eq!(placed, 1);
        assert!(pair
            .lock()
            .await
            .long_leg
            .protection_active(RiskOrderKind::TakeProfit));
    }

    #[tokio::test]
    async fn test_attach_skips_unfilled_pairs() {
        let h = harness();
        let pair = h
            .registry
            .create(dec!(0.1), Venue::Paradex, Venue::Backpack, Utc::now())
            .await;

        assert_eq!(h.risk.attach_risk_orders(&pair).await.unwrap(), 0);
        assert_eq!(h.paradex.open_order_count().await, 0);
    }

    #[tokio::test]
    async fn test_protection_fill_cancels_sibling_and_closes_leg() {
        let h = harness();
        let pair = filled_pair(&h).await;
        h.risk.attach_risk_orders(&pair).await.unwrap();

        let mut guard = pair.lock().await;
        let tp_id = guard.long_leg.take_profit.as_ref().unwrap().order_id.clone();
        // The venue fills the take-profit.
        assert!(h.paradex.fill_order(&tp_id).await);

        h.risk
            .handle_protection_fill(&mut guard.long_leg, RiskOrderKind::TakeProfit)
            .await
            .unwrap();

        assert!(guard.long_leg.closed);
        assert!(!guard.long_leg.has_active_protection());
        // Stop-loss was canceled on the venue; nothing remains open there.
        assert_eq!(h.paradex.open_order_count().await, 0);
        assert_eq!(h.paradex.canceled_orders().await.len(), 1);
    }
}
