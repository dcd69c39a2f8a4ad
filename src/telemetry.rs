//! Transition telemetry: fire-and-forget fan-out of state changes.
//!
//! Publishers ignore errors from `publish`; a dead or absent subscriber must
//! never affect the run that produced the event.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::error::TelemetryError;
use crate::worker::state::TransitionLogEntry;

/// Default broadcast channel capacity.
const DEFAULT_BROADCAST_CAPACITY: usize = 256;

/// Published after every FSM or workflow transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransitionEvent {
    pub subtask_id: String,
    pub agent: String,
    pub from: String,
    pub to: String,
    pub timestamp: DateTime<Utc>,
}

impl From<&TransitionLogEntry> for TransitionEvent {
    fn from(entry: &TransitionLogEntry) -> Self {
        Self {
            subtask_id: entry.subtask_id.clone(),
            agent: entry.agent.clone(),
            from: entry.from_state.clone(),
            to: entry.to_state.clone(),
            timestamp: entry.timestamp,
        }
    }
}

/// Destination for transition events.
pub trait TelemetrySink: Send + Sync {
    fn publish(&self, event: TransitionEvent) -> Result<(), TelemetryError>;
}

/// Fans events out to any number of in-process subscribers.
pub struct BroadcastSink {
    tx: broadcast::Sender<TransitionEvent>,
}

impl BroadcastSink {
    pub fn new() -> Arc<Self> {
        let (tx, _rx) = broadcast::channel(DEFAULT_BROADCAST_CAPACITY);
        Arc::new(Self { tx })
    }

    /// Subscribe to transition events. Slow receivers lag and lose old events.
    pub fn subscribe(&self) -> broadcast::Receiver<TransitionEvent> {
        self.tx.subscribe()
    }

    /// Log every event at debug level until the sink is dropped.
    pub fn spawn_log_forwarder(&self) -> JoinHandle<u64> {
        let mut rx = self.subscribe();
        tokio::spawn(async move {
            let mut forwarded = 0;
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        forwarded += 1;
                        tracing::debug!(
                            subtask_id = %event.subtask_id,
                            agent = %event.agent,
                            from = %event.from,
                            to = %event.to,
                            "Transition"
                        );
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Telemetry log forwarder lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            forwarded
        })
    }
}

impl TelemetrySink for BroadcastSink {
    fn publish(&self, event: TransitionEvent) -> Result<(), TelemetryError> {
        self.tx
            .send(event)
            .map(|_| ())
            .map_err(|_| TelemetryError::NoSubscribers)
    }
}

/// Sink that drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl TelemetrySink for NullSink {
    fn publish(&self, _event: TransitionEvent) -> Result<(), TelemetryError> {
        Ok(())
    }
}
