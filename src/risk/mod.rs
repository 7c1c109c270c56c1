//! Risk management for delta-neutral pairs.
//!
//! Attaches take-profit and stop-loss orders to every filled leg and
//! retires them when one side triggers.

mod protection;

pub use protection::{ProtectionConfig, RiskManager};
