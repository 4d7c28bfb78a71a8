use std::time::Duration;

use thiserror::Error;

/// Errors raised by the state machine core.
///
/// The first group is only ever produced while building a machine; the
/// second group is produced by `transition_to` and leaves the machine
/// untouched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FsmError {
    #[error("machine `{machine_id}` declares no states")]
    EmptyDefinition { machine_id: String },

    #[error("initial state `{state}` is not declared")]
    InvalidInitialState { state: String },

    #[error("transition {from} -> {to} references an undeclared state")]
    UndefinedStateInTransition { from: String, to: String },

    #[error("{kind} hook registered for undeclared state `{state}`")]
    UndefinedStateInHook { kind: &'static str, state: String },

    #[error("illegal transition {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("guard `{guard}` refused transition {from} -> {to}")]
    GuardRejected {
        from: String,
        to: String,
        guard: String,
    },
}

impl FsmError {
    /// Stable error code, suitable for logs and API payloads.
    pub fn code(&self) -> &'static str {
        match self {
            FsmError::EmptyDefinition { .. } => "EMPTY_DEFINITION",
            FsmError::InvalidInitialState { .. } => "INVALID_INITIAL_STATE",
            FsmError::UndefinedStateInTransition { .. } => "UNDEFINED_STATE_IN_TRANSITION",
            FsmError::UndefinedStateInHook { .. } => "UNDEFINED_STATE_IN_HOOK",
            FsmError::InvalidTransition { .. } => "INVALID_TRANSITION",
            FsmError::GuardRejected { .. } => "GUARD_REJECTED",
        }
    }

    /// True for errors that can only come out of the builder.
    pub fn is_configuration(&self) -> bool {
        !matches!(
            self,
            FsmError::InvalidTransition { .. } | FsmError::GuardRejected { .. }
        )
    }
}

/// Failure of a single outbound agent-execution call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    #[error("transport failure: {0}")]
    Transport(String),

    #[error("upstream throttled, retry after {retry_after_ms}ms")]
    Throttled { retry_after_ms: u64 },

    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    #[error("upstream rejected call (status {status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("malformed payload: {0}")]
    Malformed(String),
}

/// Outcome of a call routed through the reliability stack.
///
/// Exhaustion variants mean "try later"; [`ReliabilityError::Call`] carries
/// the last real failure of the wrapped action.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReliabilityError {
    #[error("circuit for `{resource}` is open, retry in {retry_in:?}")]
    CircuitOpen { resource: String, retry_in: Duration },

    #[error("rate limit for `{resource}` exceeded ({requested} token(s) requested)")]
    RateLimited { resource: String, requested: u32 },

    #[error("no bulkhead slot for `{resource}` within {waited:?}")]
    BulkheadTimeout { resource: String, waited: Duration },

    #[error(transparent)]
    Call(#[from] CallError),
}

impl ReliabilityError {
    pub fn code(&self) -> &'static str {
        match self {
            ReliabilityError::CircuitOpen { .. } => "CIRCUIT_OPEN",
            ReliabilityError::RateLimited { .. } => "RATE_LIMITED",
            ReliabilityError::BulkheadTimeout { .. } => "BULKHEAD_TIMEOUT",
            ReliabilityError::Call(_) => "CALL_FAILED",
        }
    }

    /// Resource exhaustion: the target may accept the call later.
    pub fn is_exhaustion(&self) -> bool {
        !matches!(self, ReliabilityError::Call(_))
    }
}

/// Errors raised by subagent task bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DelegationError {
    #[error("task {task_id} cannot move from {from} to {to}")]
    InvalidTaskTransition {
        task_id: String,
        from: &'static str,
        to: &'static str,
    },

    #[error("no subagent registered for `{0}`")]
    UnknownSubagent(String),

    #[error("delegator is closed, no new tasks accepted")]
    Closed,
}

/// Reasons a reported finding is refused by the finding ledger.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FindingRejection {
    #[error("finding {id} has no evidence")]
    EmptyEvidence { id: String },

    #[error("finding {id} references `{file}`, which is not part of the change set")]
    OutOfScope { id: String, file: String },

    #[error("finding {id} was already recorded")]
    DuplicateId { id: String },
}

/// Invalid values in an [`OrchestratorConfig`](crate::config::OrchestratorConfig).
#[derive(Debug, Clone, PartialEq, Error)]
#[error("invalid configuration `{field}`: {reason}")]
pub struct ConfigError {
    pub field: &'static str,
    pub reason: String,
}

/// Top-level error returned by the orchestration loops.
#[derive(Debug, Error)]
pub enum LoopError {
    #[error("state machine error: {0}")]
    Fsm(#[from] FsmError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("handler for state {state} failed: {reason}")]
    HandlerFailed { state: String, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fsm_error_codes() {
        let err = FsmError::InvalidTransition {
            from: "IDLE".into(),
            to: "DONE".into(),
        };
        assert_eq!(err.code(), "INVALID_TRANSITION");
        assert!(!err.is_configuration());

        let err = FsmError::InvalidInitialState {
            state: "NOPE".into(),
        };
        assert_eq!(err.code(), "INVALID_INITIAL_STATE");
        assert!(err.is_configuration());
    }

    #[test]
    fn reliability_error_classification() {
        let open = ReliabilityError::CircuitOpen {
            resource: "security".into(),
            retry_in: Duration::from_secs(1),
        };
        assert!(open.is_exhaustion());
        assert_eq!(open.code(), "CIRCUIT_OPEN");

        let call: ReliabilityError = CallError::Transport("reset".into()).into();
        assert!(!call.is_exhaustion());
        assert_eq!(call.to_string(), "transport failure: reset");
    }

    #[test]
    fn errors_are_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<FsmError>();
        assert_send_sync::<ReliabilityError>();
        assert_send_sync::<LoopError>();
    }
}
