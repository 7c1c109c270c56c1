//! The delta-neutral pair record and its lifecycle state machine.

use crate::exchange::{OrderHandle, OrderId, OrderStatus, Side, Venue};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use thiserror::Error;

/// Registry-assigned pair identifier.
pub type PairId = u64;

/// Lifecycle state of a pair.
///
/// Success path: `Pending -> BothFilled -> Closed`.
/// Failure path: `Pending -> Unwinding -> Unwound | UnwindFailed`, with
/// `Pending -> Failed` when nothing filled, and `BothFilled -> Unwinding`
/// when a later repair fails catastrophically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PairState {
    Pending,
    BothFilled,
    Unwinding,
    Closed,
    Unwound,
    UnwindFailed,
    Failed,
}

impl PairState {
    /// Terminal states are entered exactly once and never left.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PairState::Closed | PairState::Unwound | PairState::UnwindFailed | PairState::Failed
        )
    }

    fn can_transition_to(&self, next: PairState) -> bool {
        matches!(
            (self, next),
            (
                PairState::Pending,
                PairState::BothFilled | PairState::Unwinding | PairState::Failed
            ) | (
                PairState::BothFilled,
                PairState::Closed | PairState::Unwinding
            ) | (
                PairState::Unwinding,
                PairState::Unwound | PairState::UnwindFailed
            )
        )
    }
}

/// Violations of the pair state machine.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PairStateError {
    #[error("pair {id} is already terminal in state {state:?}")]
    AlreadyTerminal { id: PairId, state: PairState },

    #[error("pair {id}: invalid transition {from:?} -> {to:?}")]
    InvalidTransition {
        id: PairId,
        from: PairState,
        to: PairState,
    },
}

/// Kind of protective order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RiskOrderKind {
    TakeProfit,
    StopLoss,
}

impl RiskOrderKind {
    /// The other protective order on the same leg.
    pub fn sibling(&self) -> RiskOrderKind {
        match self {
            RiskOrderKind::TakeProfit => RiskOrderKind::StopLoss,
            RiskOrderKind::StopLoss => RiskOrderKind::TakeProfit,
        }
    }
}

/// A protective order attached to one leg.
#[derive(Debug, Clone)]
pub struct RiskOrder {
    pub order_id: OrderId,
    pub kind: RiskOrderKind,
    pub trigger_price: Decimal,
    pub status: OrderStatus,
}

impl RiskOrder {
    pub fn is_active(&self) -> bool {
        self.status.is_open()
    }
}

/// One side of a pair on one venue.
#[derive(Debug, Clone)]
pub struct Leg {
    pub venue: Venue,
    pub side: Side,
    pub order_id: Option<OrderId>,
    pub executed_size: Decimal,
    pub entry_price: Decimal,
    pub take_profit: Option<RiskOrder>,
    pub stop_loss: Option<RiskOrder>,
    pub closed: bool,
}

impl Leg {
    fn new(venue: Venue, side: Side) -> Self {
        Self {
            venue,
            side,
            order_id: None,
            executed_size: Decimal::ZERO,
            entry_price: Decimal::ZERO,
            take_profit: None,
            stop_loss: None,
            closed: false,
        }
    }

    pub fn is_filled(&self) -> bool {
        self.executed_size > Decimal::ZERO
    }

    /// Filled and not yet closed: the leg carries live exposure.
    pub fn is_open(&self) -> bool {
        self.is_filled() && !self.closed
    }

    /// Record an executed fill, averaging the entry price across fills.
    pub fn apply_fill(&mut self, handle: &OrderHandle) {
        if handle.executed_size <= Decimal::ZERO {
            return;
        }
        let previous = self.executed_size;
        let total = previous + handle.executed_size;
        self.entry_price = if previous == Decimal::ZERO {
            handle.avg_fill_price
        } else {
            (self.entry_price * previous + handle.avg_fill_price * handle.executed_size) / total
        };
        self.executed_size = total;
        self.order_id = Some(handle.id.clone());
    }

    pub fn risk_order(&self, kind: RiskOrderKind) -> Option<&RiskOrder> {
        match kind {
            RiskOrderKind::TakeProfit => self.take_profit.as_ref(),
            RiskOrderKind::StopLoss => self.stop_loss.as_ref(),
        }
    }

    pub fn risk_order_mut(&mut self, kind: RiskOrderKind) -> Option<&mut RiskOrder> {
        match kind {
            RiskOrderKind::TakeProfit => self.take_profit.as_mut(),
            RiskOrderKind::StopLoss => self.stop_loss.as_mut(),
        }
    }

    /// Whether an active protective order of `kind` exists.
    pub fn protection_active(&self, kind: RiskOrderKind) -> bool {
        self.risk_order(kind).is_some_and(|r| r.is_active())
    }

    /// Whether any protective order on this leg is still active.
    pub fn has_active_protection(&self) -> bool {
        self.protection_active(RiskOrderKind::TakeProfit)
            || self.protection_active(RiskOrderKind::StopLoss)
    }
}

/// The unit of a neutral trade across two venues.
#[derive(Debug, Clone)]
pub struct DeltaPair {
    pub id: PairId,
    pub target_size: Decimal,
    pub long_leg: Leg,
    pub short_leg: Leg,
    pub state: PairState,
    pub created_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl DeltaPair {
    pub fn new(
        id: PairId,
        target_size: Decimal,
        long_venue: Venue,
        short_venue: Venue,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            target_size,
            long_leg: Leg::new(long_venue, Side::Buy),
            short_leg: Leg::new(short_venue, Side::Sell),
            state: PairState::Pending,
            created_at: now,
            closed_at: None,
        }
    }

    pub fn legs(&self) -> [&Leg; 2] {
        [&self.long_leg, &self.short_leg]
    }

    pub fn legs_mut(&mut self) -> [&mut Leg; 2] {
        [&mut self.long_leg, &mut self.short_leg]
    }

    pub fn leg(&self, venue: Venue) -> Option<&Leg> {
        self.legs().into_iter().find(|l| l.venue == venue)
    }

    pub fn leg_mut(&mut self, venue: Venue) -> Option<&mut Leg> {
        self.legs_mut().into_iter().find(|l| l.venue == venue)
    }

    /// Size imbalance between the two legs.
    ///
    /// Only meaningful while both legs carry live exposure; a leg closed by
    /// its protective order is an exit, not drift.
    pub fn drift(&self) -> Decimal {
        if self.long_leg.is_open() && self.short_leg.is_open() {
            (self.long_leg.executed_size - self.short_leg.executed_size).abs()
        } else {
            Decimal::ZERO
        }
    }

    pub fn both_legs_closed(&self) -> bool {
        !self.long_leg.is_open() && !self.short_leg.is_open()
    }

    /// Locate a protective order by venue order id.
    pub fn find_risk_order_mut(&mut self, id: &OrderId) -> Option<&mut RiskOrder> {
        self.legs_mut().into_iter().find_map(|leg| {
            [&mut leg.take_profit, &mut leg.stop_loss]
                .into_iter()
                .flatten()
                .find(|r| &r.order_id == id)
        })
    }

    /// Move to `to`, enforcing the state machine. Terminal states set
    /// `closed_at` and can never be left again.
    pub fn transition(
        &mut self,
        to: PairState,
        now: DateTime<Utc>,
    ) -> Result<(), PairStateError> {
        if self.state.is_terminal() {
            return Err(PairStateError::AlreadyTerminal {
                id: self.id,
                state: self.state,
            });
        }
        if !self.state.can_transition_to(to) {
            return Err(PairStateError::InvalidTransition {
                id: self.id,
                from: self.state,
                to,
            });
        }
        self.state = to;
        if to.is_terminal() {
            self.closed_at = Some(now);
        }
        Ok(())
    }
}
