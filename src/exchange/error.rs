//! Typed errors returned at the exchange adapter boundary.
//!
//! Every adapter call resolves to one of these variants so callers can
//! decide between retry, unwind, and abort without string matching.

use crate::exchange::types::OrderId;
use thiserror::Error;

/// Errors surfaced by an exchange adapter.
#[derive(Error, Debug)]
pub enum ExchangeError {
    /// Credentials were refused. Fatal at startup, fatal mid-run.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// The venue accepted the request and said no.
    #[error("order rejected: {0}")]
    OrderRejected(String),

    /// The request did not complete in time. Venue-side outcome unknown.
    #[error("request timed out: {0}")]
    Timeout(String),

    /// Connection-level failure before a response was received.
    #[error("transport error: {0}")]
    Transport(String),

    /// The venue responded with a payload we could not interpret.
    #[error("malformed venue response: {0}")]
    InvalidResponse(String),

    /// Cancel targeted an order the venue no longer knows about.
    #[error("order {0} not found")]
    OrderNotFound(OrderId),
}

impl ExchangeError {
    /// Whether a retry of the same request is reasonable.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Transport(_))
    }

    /// Whether this error must stop the process.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Auth(_))
    }
}

impl From<reqwest::Error> for ExchangeError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout(err.to_string())
        } else {
            Self::Transport(err.to_string())
        }
    }
}

pub type ExchangeResult<T> = Result<T, ExchangeError>;
