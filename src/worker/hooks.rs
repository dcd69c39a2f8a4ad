//! WAIT and VERIFY stage hooks.

use async_trait::async_trait;

use crate::worker::context::ExecutionContext;
use crate::worker::state::AgentEvent;

/// Intercepts the WAIT and VERIFY states of a run.
///
/// `wait` must return `WaitComplete` or `ErrorOccurred`. `verify` must return
/// `VerificationPassed`, `VerificationFailed` or `ErrorOccurred`.
#[async_trait]
pub trait StageHooks: Send + Sync {
    async fn wait(&self, context: &ExecutionContext) -> AgentEvent;

    async fn verify(&self, context: &ExecutionContext) -> AgentEvent;
}

/// WAIT completes immediately and VERIFY always passes.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassThroughHooks;

#[async_trait]
impl StageHooks for PassThroughHooks {
    async fn wait(&self, _context: &ExecutionContext) -> AgentEvent {
        AgentEvent::WaitComplete
    }

    async fn verify(&self, _context: &ExecutionContext) -> AgentEvent {
        AgentEvent::VerificationPassed
    }
}
