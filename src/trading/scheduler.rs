//! Fixed-cadence driver for the reconciler.
//!
//! Runs until a shutdown signal arrives. Tick errors are contained at the
//! tick boundary: the loop logs them and keeps going, except for auth
//! failures, which stop the process. An in-flight tick always finishes
//! before shutdown is honored.

use crate::exchange::ExchangeError;
use crate::trading::reconciler::PositionReconciler;
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

/// Drives reconciliation at a fixed interval.
pub struct TradingLoop {
    reconciler: Arc<PositionReconciler>,
    tick_interval: Duration,
}

impl TradingLoop {
    pub fn new(reconciler: Arc<PositionReconciler>, tick_interval: Duration) -> Self {
        Self {
            reconciler,
            tick_interval,
        }
    }

    /// Run until `shutdown` flips to true or a fatal error occurs.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut ticker = tokio::time::interval(self.tick_interval);
        // A tick that overruns the interval is dropped, not replayed.
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(
            interval_secs = self.tick_interval.as_secs(),
            "trading loop started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.reconciler.tick().await {
                        Ok(report) if report.skipped => {}
                        Ok(report) => {
                            info!(
                                stale_canceled = report.stale_canceled,
                                protections_placed = report.protections_placed,
                                legs_closed = report.legs_closed,
                                repairs = report.repairs,
                                pairs_closed = report.pairs_closed,
                                pairs_archived = report.pairs_archived,
                                "tick complete"
                            );
                        }
                        Err(e) if is_fatal(&e) => {
                            error!(error = %e, "fatal error, stopping trading loop");
                            return Err(e);
                        }
                        Err(e) => {
                            error!(error = %e, "tick failed, continuing at next interval");
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("shutdown signal received, stopping trading loop");
                        return Ok(());
                    }
                }
            }
        }
    }
}

/// Only authentication failures terminate the loop.
fn is_fatal(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<ExchangeError>()
            .is_some_and(|e| e.is_fatal())
    })
}
