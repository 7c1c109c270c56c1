//! Exchange integrations for delta-neutral pair trading.
//!
//! ## Paradex
//! JWT-authenticated REST client for the ETH-USD perpetual.
//!
//! ## Backpack
//! HMAC-authenticated REST client for the ETH_USDC perpetual.
//!
//! Both implement the single [`ExchangeAdapter`] capability; the mock
//! venue implements the same trait for tests and paper trading.

mod backpack;
mod error;
pub mod mock;
mod paradex;
mod traits;
mod types;

pub use backpack::BackpackClient;
pub use error::{ExchangeError, ExchangeResult};
pub use mock::MockExchange;
pub use paradex::ParadexClient;
pub use traits::{ExchangeAdapter, Venue};
pub use types::*;
