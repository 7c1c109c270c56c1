//! In-memory registry of live pairs.
//!
//! Each pair sits behind its own `tokio::sync::Mutex`, so the coordinator
//! and the reconciler can never mutate the same pair concurrently. The
//! registry itself is only a directory; all pair state lives in the
//! per-pair records. Nothing is persisted: a restart loses pair linkage
//! and truth is re-derived from live venue queries.

use crate::exchange::Venue;
use crate::pair::{DeltaPair, PairId};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

/// Directory of live and archived pairs.
pub struct PairRegistry {
    pairs: RwLock<HashMap<PairId, Arc<Mutex<DeltaPair>>>>,
    archived: RwLock<Vec<DeltaPair>>,
    next_id: AtomicU64,
}

impl PairRegistry {
    pub fn new() -> Self {
        Self {
            pairs: RwLock::new(HashMap::new()),
            archived: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Create a new pair in `Pending` state and register it.
    pub async fn create(
        &self,
        target_size: Decimal,
        long_venue: Venue,
        short_venue: Venue,
        now: DateTime<Utc>,
    ) -> Arc<Mutex<DeltaPair>> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let pair = Arc::new(Mutex::new(DeltaPair::new(
            id,
            target_size,
            long_venue,
            short_venue,
            now,
        )));
        self.pairs.write().await.insert(id, pair.clone());
        debug!(pair_id = id, %long_venue, %short_venue, "pair registered");
        pair
    }

    pub async fn get(&self, id: PairId) -> Option<Arc<Mutex<DeltaPair>>> {
        self.pairs.read().await.get(&id).cloned()
    }

    /// Snapshot of all live pairs, ordered by id for deterministic iteration.
    pub async fn active(&self) -> Vec<Arc<Mutex<DeltaPair>>> {
        let pairs = self.pairs.read().await;
        let mut entries: Vec<_> = pairs.iter().map(|(id, p)| (*id, p.clone())).collect();
        entries.sort_by_key(|(id, _)| *id);
        entries.into_iter().map(|(_, p)| p).collect()
    }

    pub async fn active_count(&self) -> usize {
        self.pairs.read().await.len()
    }

    pub async fn archived_count(&self) -> usize {
        self.archived.read().await.len()
    }

    /// Move finished pairs out of the live directory.
    ///
    /// A pair is archivable once its state is terminal, no leg carries
    /// exposure, and no protective order is still active. An
    /// `UnwindFailed` pair with a live leg is deliberately retained so the
    /// operator keeps seeing it.
    pub async fn archive_finished(&self) -> usize {
        let snapshot = self.active().await;
        let mut finished = Vec::new();

        for pair in snapshot {
            let guard = pair.lock().await;
            let archivable = guard.state.is_terminal()
                && guard.both_legs_closed()
                && !guard.long_leg.has_active_protection()
                && !guard.short_leg.has_active_protection();
            if archivable {
                finished.push((guard.id, guard.clone()));
            }
        }

        if finished.is_empty() {
            return 0;
        }

        let mut pairs = self.pairs.write().await;
        let mut archived = self.archived.write().await;
        let count = finished.len();
        for (id, record) in finished {
            pairs.remove(&id);
            debug!(pair_id = id, state = ?record.state, "pair archived");
            archived.push(record);
        }
        count
    }
}

impl Default for PairRegistry {
    fn default() -> Self {
        Self::new()
    }
}
