//! Orchestration core for AI coding agents.
//!
//! A generic state machine engine ([`state_machine`]), bounded subagent
//! delegation with finding dedup ([`delegation`]), fault-tolerance wrappers
//! for every outbound call ([`reliability`]) and the two loops built from
//! them ([`orchestrator`]).

pub mod changes;
pub mod config;
pub mod delegation;
pub mod error;
pub mod orchestrator;
pub mod reliability;
pub mod router;
pub mod state_machine;
pub mod telemetry;
pub mod todo;

pub use config::OrchestratorConfig;
pub use error::{
    CallError, ConfigError, DelegationError, FindingRejection, FsmError, LoopError,
    ReliabilityError,
};
pub use orchestrator::{Assessment, FinalOutcome, ReviewOrchestrator, StopReason, WorkLoop};
