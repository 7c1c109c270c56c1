//! Venue-agnostic exchange adapter capability.
//!
//! Each supported exchange implements [`ExchangeAdapter`] once; the
//! coordinator, risk manager, and reconciler consume the trait and never
//! touch venue-specific transport, signing, or payload shapes.

use crate::exchange::error::ExchangeResult;
use crate::exchange::types::{Order, OrderHandle, OrderId, Position, Side};
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Venue identifier for the two legs of a pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Venue {
    Paradex,
    Backpack,
}

impl fmt::Display for Venue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Venue::Paradex => write!(f, "Paradex"),
            Venue::Backpack => write!(f, "Backpack"),
        }
    }
}

impl Venue {
    /// Short code for display (2-3 chars).
    pub fn short_code(&self) -> &'static str {
        match self {
            Venue::Paradex => "PDX",
            Venue::Backpack => "BP",
        }
    }
}

/// Uniform capability over one exchange.
///
/// All methods return typed results; transient transport failures,
/// rejections, and auth failures are distinguished so callers can choose
/// between retry, unwind, and abort. Implementations absorb venue schema
/// drift; this trait is the only surface the trading core sees.
#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    /// Returns the venue identifier.
    fn venue(&self) -> Venue;

    /// Establish credentials. Failure is fatal to startup.
    async fn authenticate(&self) -> ExchangeResult<()>;

    /// Submit a market order for immediate execution.
    async fn place_market_order(&self, side: Side, size: Decimal) -> ExchangeResult<OrderHandle>;

    /// Submit a resting limit order.
    async fn place_limit_order(
        &self,
        side: Side,
        size: Decimal,
        price: Decimal,
    ) -> ExchangeResult<OrderHandle>;

    /// Submit a stop order triggered at `trigger_price`.
    async fn place_stop_order(
        &self,
        side: Side,
        size: Decimal,
        trigger_price: Decimal,
    ) -> ExchangeResult<OrderHandle>;

    /// Cancel a resting order.
    async fn cancel_order(&self, id: &OrderId) -> ExchangeResult<()>;

    /// All currently open orders on this venue.
    async fn list_open_orders(&self) -> ExchangeResult<Vec<Order>>;

    /// Current net position on this venue.
    async fn get_position(&self) -> ExchangeResult<Position>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_venue_display() {
        assert_eq!(Venue::Paradex.to_string(), "Paradex");
        assert_eq!(Venue::Backpack.short_code(), "BP");
    }
}
