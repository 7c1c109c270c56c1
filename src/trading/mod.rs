//! Trading orchestration core.
//!
//! - `coordinator`: dual-leg order placement, unwind, and drift repair
//! - `reconciler`: per-tick reconciliation against live venue state
//! - `scheduler`: fixed-cadence loop driving the reconciler

pub mod coordinator;
pub mod reconciler;
pub mod scheduler;

pub use coordinator::{CoordinatorConfig, OrderCoordinator, RepairOutcome};
pub use reconciler::{PositionReconciler, ReconcilerConfig, TickReport};
pub use scheduler::TradingLoop;
