//! Delta-neutral pair data model.
//!
//! A [`DeltaPair`] is the unit of a neutral trade: one long leg and one
//! short leg on two different venues, plus the protective orders attached
//! to each leg. The [`registry::PairRegistry`] owns all live pairs and
//! provides per-pair mutual exclusion.

mod delta_pair;
pub mod registry;

pub use delta_pair::{
    DeltaPair, Leg, PairId, PairState, PairStateError, RiskOrder, RiskOrderKind,
};
pub use registry::PairRegistry;
