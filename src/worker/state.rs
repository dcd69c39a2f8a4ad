//! Agent state machine.
//!
//! `transition` and `update_context` are pure: given the same state, event and
//! context they always produce the same result and touch nothing else.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::worker::context::{ExecutionContext, Plan};

/// State of the agent reasoning loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentState {
    Observe,
    Think,
    Act,
    Wait,
    Verify,
    /// Terminal. No outgoing transitions.
    Complete,
    Error,
}

impl AgentState {
    /// Check if this is the terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Observe => "OBSERVE",
            Self::Think => "THINK",
            Self::Act => "ACT",
            Self::Wait => "WAIT",
            Self::Verify => "VERIFY",
            Self::Complete => "COMPLETE",
            Self::Error => "ERROR",
        }
    }
}

impl std::fmt::Display for AgentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload-free discriminant of an [`AgentEvent`], recorded as `last_event`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    ObserveComplete,
    ThinkComplete,
    ActionComplete,
    WaitComplete,
    VerificationPassed,
    VerificationFailed,
    ErrorOccurred,
    ErrorHandled,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::ObserveComplete => "OBSERVE_COMPLETE",
            Self::ThinkComplete => "THINK_COMPLETE",
            Self::ActionComplete => "ACTION_COMPLETE",
            Self::WaitComplete => "WAIT_COMPLETE",
            Self::VerificationPassed => "VERIFICATION_PASSED",
            Self::VerificationFailed => "VERIFICATION_FAILED",
            Self::ErrorOccurred => "ERROR_OCCURRED",
            Self::ErrorHandled => "ERROR_HANDLED",
        };
        f.write_str(s)
    }
}

/// An event driving the agent state machine, carrying the data it produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentEvent {
    ObserveComplete { observation: String },
    ThinkComplete { plan: Plan },
    ActionComplete { results: Vec<serde_json::Value> },
    WaitComplete,
    VerificationPassed,
    VerificationFailed,
    ErrorOccurred { message: String },
    ErrorHandled,
}

impl AgentEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::ObserveComplete { .. } => EventKind::ObserveComplete,
            Self::ThinkComplete { .. } => EventKind::ThinkComplete,
            Self::ActionComplete { .. } => EventKind::ActionComplete,
            Self::WaitComplete => EventKind::WaitComplete,
            Self::VerificationPassed => EventKind::VerificationPassed,
            Self::VerificationFailed => EventKind::VerificationFailed,
            Self::ErrorOccurred { .. } => EventKind::ErrorOccurred,
            Self::ErrorHandled => EventKind::ErrorHandled,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::ErrorOccurred {
            message: message.into(),
        }
    }
}

/// Compute the next state. Unmapped events leave the state unchanged.
pub fn transition(state: AgentState, event: &AgentEvent, _context: &ExecutionContext) -> AgentState {
    use AgentState::*;
    use EventKind as E;

    match (state, event.kind()) {
        (Observe, E::ObserveComplete) => Think,
        (Think, E::ThinkComplete) => Act,
        (Act, E::ActionComplete) => Wait,
        (Wait, E::WaitComplete) => Verify,
        (Verify, E::VerificationPassed) => Complete,
        (Verify, E::VerificationFailed) => Think,
        (Error, E::ErrorHandled) => Observe,
        (Complete, _) => Complete,
        (_, E::ErrorOccurred) => Error,
        (unchanged, _) => unchanged,
    }
}

/// Fold an event into the execution context.
///
/// `step_count` grows by one for every event except `ERROR_HANDLED` taken
/// from the `ERROR` state.
pub fn update_context(
    from: AgentState,
    event: &AgentEvent,
    context: ExecutionContext,
) -> ExecutionContext {
    let mut next = context;

    if !(from == AgentState::Error && event.kind() == EventKind::ErrorHandled) {
        next.step_count += 1;
    }
    next.last_event = Some(event.kind());

    match event {
        AgentEvent::ObserveComplete { observation } => {
            next.last_observation = Some(observation.clone());
        }
        AgentEvent::ThinkComplete { plan } => {
            next.tool_calls = plan.tool_calls.clone();
            next.plan = Some(plan.clone());
        }
        AgentEvent::ActionComplete { results } => {
            next.action_result = Some(results.clone());
        }
        AgentEvent::VerificationFailed => {
            next.retry_count += 1;
        }
        AgentEvent::ErrorOccurred { message } => {
            next.error = Some(message.clone());
        }
        AgentEvent::ErrorHandled => {
            next.error = None;
        }
        AgentEvent::WaitComplete | AgentEvent::VerificationPassed => {}
    }

    next
}

/// One append-only audit record of a state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransitionLogEntry {
    pub subtask_id: String,
    pub agent: String,
    pub from_state: String,
    pub to_state: String,
    pub timestamp: DateTime<Utc>,
}

/// Build a log entry stamped with the current time.
pub fn create_log_entry(
    from: impl ToString,
    to: impl ToString,
    agent: &str,
    subtask_id: &str,
) -> TransitionLogEntry {
    TransitionLogEntry {
        subtask_id: subtask_id.to_string(),
        agent: agent.to_string(),
        from_state: from.to_string(),
        to_state: to.to_string(),
        timestamp: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_STATES: [AgentState; 7] = [
        AgentState::Observe,
        AgentState::Think,
        AgentState::Act,
        AgentState::Wait,
        AgentState::Verify,
        AgentState::Complete,
        AgentState::Error,
    ];

    fn all_events() -> Vec<AgentEvent> {
        vec![
            AgentEvent::ObserveComplete {
                observation: "obs".into(),
            },
            AgentEvent::ThinkComplete {
                plan: Plan::no_tools(),
            },
            AgentEvent::ActionComplete { results: vec![] },
            AgentEvent::WaitComplete,
            AgentEvent::VerificationPassed,
            AgentEvent::VerificationFailed,
            AgentEvent::error("boom"),
            AgentEvent::ErrorHandled,
        ]
    }

    #[test]
    fn happy_path_transitions() {
        let ctx = ExecutionContext::default();
        let mut state = AgentState::Observe;
        let path = [
            AgentEvent::ObserveComplete {
                observation: "x".into(),
            },
            AgentEvent::ThinkComplete {
                plan: Plan::no_tools(),
            },
            AgentEvent::ActionComplete { results: vec![] },
            AgentEvent::WaitComplete,
            AgentEvent::VerificationPassed,
        ];
        let expected = [
            AgentState::Think,
            AgentState::Act,
            AgentState::Wait,
            AgentState::Verify,
            AgentState::Complete,
        ];
        for (event, want) in path.iter().zip(expected) {
            state = transition(state, event, &ctx);
            assert_eq!(state, want);
        }
    }

    #[test]
    fn complete_is_a_fixed_point() {
        let ctx = ExecutionContext::default();
        for event in all_events() {
            assert_eq!(
                transition(AgentState::Complete, &event, &ctx),
                AgentState::Complete
            );
        }
    }

    #[test]
    fn verification_events_only_drive_verify() {
        let ctx = ExecutionContext::default();
        for state in ALL_STATES {
            let passed = transition(state, &AgentEvent::VerificationPassed, &ctx);
            let failed = transition(state, &AgentEvent::VerificationFailed, &ctx);
            if state == AgentState::Verify {
                assert_eq!(passed, AgentState::Complete);
                assert_eq!(failed, AgentState::Think);
            } else {
                assert_eq!(passed, state);
                assert_eq!(failed, state);
            }
        }
    }

    #[test]
    fn error_from_any_non_terminal_state() {
        let ctx = ExecutionContext::default();
        for state in ALL_STATES {
            let next = transition(state, &AgentEvent::error("x"), &ctx);
            if state.is_terminal() {
                assert_eq!(next, AgentState::Complete);
            } else {
                assert_eq!(next, AgentState::Error);
            }
        }
        assert_eq!(
            transition(AgentState::Error, &AgentEvent::ErrorHandled, &ctx),
            AgentState::Observe
        );
    }

    #[test]
    fn unmapped_events_leave_state_unchanged() {
        let ctx = ExecutionContext::default();
        assert_eq!(
            transition(AgentState::Observe, &AgentEvent::WaitComplete, &ctx),
            AgentState::Observe
        );
        assert_eq!(
            transition(AgentState::Act, &AgentEvent::ErrorHandled, &ctx),
            AgentState::Act
        );
    }

    #[test]
    fn step_count_increments_for_every_event_but_error_handled() {
        for state in ALL_STATES {
            for event in all_events() {
                let ctx = ExecutionContext {
                    step_count: 5,
                    ..Default::default()
                };
                let next = update_context(state, &event, ctx);
                if state == AgentState::Error && event == AgentEvent::ErrorHandled {
                    assert_eq!(next.step_count, 5);
                } else {
                    assert_eq!(next.step_count, 6, "{state} / {}", event.kind());
                }
            }
        }
    }

    #[test]
    fn update_context_records_payloads() {
        let ctx = ExecutionContext::default();
        let ctx = update_context(
            AgentState::Observe,
            &AgentEvent::ObserveComplete {
                observation: "saw it".into(),
            },
            ctx,
        );
        assert_eq!(ctx.last_observation.as_deref(), Some("saw it"));
        assert_eq!(ctx.last_event, Some(EventKind::ObserveComplete));

        let plan = Plan::with_calls(vec![crate::worker::ToolCall {
            tool: "filesystem".into(),
            action: "read".into(),
            params: serde_json::json!({"path": "a.txt"}),
        }]);
        let ctx = update_context(AgentState::Think, &AgentEvent::ThinkComplete { plan }, ctx);
        assert_eq!(ctx.tool_calls.len(), 1);
        assert!(ctx.plan.is_some());

        let ctx = update_context(
            AgentState::Act,
            &AgentEvent::ActionComplete {
                results: vec![serde_json::json!({"ok": true})],
            },
            ctx,
        );
        assert_eq!(ctx.action_result.as_ref().map(|r| r.len()), Some(1));
    }

    #[test]
    fn retry_count_and_error_bookkeeping() {
        let ctx = ExecutionContext::default();
        let ctx = update_context(AgentState::Verify, &AgentEvent::VerificationFailed, ctx);
        assert_eq!(ctx.retry_count, 1);

        let ctx = update_context(AgentState::Think, &AgentEvent::error("bad"), ctx);
        assert_eq!(ctx.error.as_deref(), Some("bad"));

        let ctx = update_context(AgentState::Error, &AgentEvent::ErrorHandled, ctx);
        assert!(ctx.error.is_none());
        assert_eq!(ctx.step_count, 2);
    }

    #[test]
    fn log_entry_fields() {
        let entry = create_log_entry(AgentState::Observe, AgentState::Think, "implementer", "T1");
        assert_eq!(entry.from_state, "OBSERVE");
        assert_eq!(entry.to_state, "THINK");
        assert_eq!(entry.agent, "implementer");
        assert_eq!(entry.subtask_id, "T1");
    }

    #[test]
    fn state_serde_uses_upper_case() {
        let json = serde_json::to_string(&AgentState::Verify).unwrap();
        assert_eq!(json, "\"VERIFY\"");
    }
}
