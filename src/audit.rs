//! Append-only transition audit log.
//!
//! Writes are best-effort: a store failure is logged and the caller still
//! gets the in-memory entry back, so a flaky audit store never aborts a run.

use std::sync::Arc;

use tracing::warn;

use crate::error::DatabaseError;
use crate::store::{Database, SortOrder};
use crate::worker::state::TransitionLogEntry;

#[derive(Clone)]
pub struct TransitionLog {
    store: Arc<dyn Database>,
}

impl TransitionLog {
    pub fn new(store: Arc<dyn Database>) -> Self {
        Self { store }
    }

    /// Persist `entry`. Never fails.
    pub async fn record(&self, entry: TransitionLogEntry) -> TransitionLogEntry {
        if let Err(e) = self.store.insert_transition(&entry).await {
            warn!(
                subtask_id = %entry.subtask_id,
                from = %entry.from_state,
                to = %entry.to_state,
                error = %e,
                "Failed to persist transition; continuing with in-memory entry"
            );
        }
        entry
    }

    pub async fn history(
        &self,
        subtask_id: &str,
        order: SortOrder,
    ) -> Result<Vec<TransitionLogEntry>, DatabaseError> {
        self.store.list_transitions(subtask_id, order).await
    }

    pub async fn latest(&self, subtask_id: &str) -> Result<Option<TransitionLogEntry>, DatabaseError> {
        self.store.latest_transition(subtask_id).await
    }
}
