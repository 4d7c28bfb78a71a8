//! The two orchestration loops built on the state machine core.
//!
//! [`WorkLoop`] drives intake → plan → act → synthesize → evaluate with
//! hard budgets and stagnation detection. [`ReviewOrchestrator`] fans review
//! work out to subagents, validates what comes back and rolls it up into an
//! [`Assessment`].

mod assessment;
mod review;
mod work_loop;

pub use assessment::{Assessment, Recommendation};
pub use review::{ReviewContext, ReviewOrchestrator, ReviewState, StaticScanner};
pub use work_loop::{FinalOutcome, StopReason, WorkContext, WorkLoop, WorkState};
