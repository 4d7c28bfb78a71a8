//! Subagent delegation: the agent-execution contract, task bookkeeping,
//! finding validation and the bounded-concurrency delegator.

mod agent;
mod delegator;
mod findings;
mod task;

pub use agent::{AgentExecutor, AgentPayload, FnExecutor, RawFinding};
pub use delegator::{Dispatch, SkipReason, TaskDelegator};
pub use findings::{
    Admission, Admitted, FALLBACK_CONFIDENCE, Finding, FindingLedger, Severity, Signature,
    parse_confidence,
};
pub use task::{SubagentTask, TaskStatus};
