use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::changes::ChangeSet;
use crate::config::OrchestratorConfig;
use crate::delegation::{AgentExecutor, Finding, FindingLedger, SubagentTask, TaskDelegator};
use crate::error::{FsmError, LoopError};
use crate::reliability::ReliabilityRegistry;
use crate::router::SubagentRegistry;
use crate::state_machine::{
    AsyncMachine, AuditEntry, MachineBuilder, SnapshotStore, TransitionObserver,
};
use crate::todo::{TodoItem, TodoList, TodoPlanner, TodoStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkState {
    Intake,
    Plan,
    Act,
    Synthesize,
    Evaluate,
    Done,
    Failed,
}

impl WorkState {
    pub const ALL: [WorkState; 7] = [
        WorkState::Intake,
        WorkState::Plan,
        WorkState::Act,
        WorkState::Synthesize,
        WorkState::Evaluate,
        WorkState::Done,
        WorkState::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkState::Intake => "INTAKE",
            WorkState::Plan => "PLAN",
            WorkState::Act => "ACT",
            WorkState::Synthesize => "SYNTHESIZE",
            WorkState::Evaluate => "EVALUATE",
            WorkState::Done => "DONE",
            WorkState::Failed => "FAILED",
        }
    }
}

impl fmt::Display for WorkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why the work loop terminated. Exactly one is recorded per run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StopReason {
    RecommendationReady,
    BlockingQuestion,
    BudgetExhausted,
    Stagnation,
    RiskThreshold,
    HumanRequired,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopReason::RecommendationReady => "recommendation-ready",
            StopReason::BlockingQuestion => "blocking-question",
            StopReason::BudgetExhausted => "budget-exhausted",
            StopReason::Stagnation => "stagnation",
            StopReason::RiskThreshold => "risk-threshold",
            StopReason::HumanRequired => "human-required",
        }
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Context owned by one work-loop machine.
#[derive(Debug, Clone)]
pub struct WorkContext {
    pub goal: String,
    pub changes: ChangeSet,
    pub todos: TodoList,
    /// Evidence in arrival order, without duplicates.
    pub evidence: Vec<String>,
    pub findings: FindingLedger,
    pub iteration: u32,
    pub subagent_calls: u32,
    pub follow_ups: Vec<String>,
    pub recommendation: Option<String>,
    pub blocking_question: Option<String>,
    pub needs_human: bool,
    pub proposed_stop: Option<StopReason>,
    pub stop_reason: Option<StopReason>,
    fingerprint: Option<String>,
    stagnant_iterations: u32,
}

impl WorkContext {
    pub fn new(goal: impl Into<String>) -> Self {
        Self {
            goal: goal.into(),
            changes: ChangeSet::default(),
            todos: TodoList::new(),
            evidence: Vec::new(),
            findings: FindingLedger::new(ChangeSet::default()),
            iteration: 0,
            subagent_calls: 0,
            follow_ups: Vec::new(),
            recommendation: None,
            blocking_question: None,
            needs_human: false,
            proposed_stop: None,
            stop_reason: None,
            fingerprint: None,
            stagnant_iterations: 0,
        }
    }

    /// Findings are only accepted for files in `changes`.
    pub fn with_changes(mut self, changes: ChangeSet) -> Self {
        self.findings = FindingLedger::new(changes.clone());
        self.changes = changes;
        self
    }

    /// Pre-planned todos; the planner is skipped when any are given.
    pub fn with_todos(mut self, todos: impl IntoIterator<Item = TodoItem>) -> Self {
        self.todos.extend(todos);
        self
    }

    pub fn stagnant_iterations(&self) -> u32 {
        self.stagnant_iterations
    }
}

/// Result of a finished work loop.
#[derive(Debug, Clone)]
pub struct FinalOutcome {
    pub stop_reason: StopReason,
    pub iteration_count: u32,
    pub subagent_calls: u32,
    pub evidence: Vec<String>,
    pub findings: Vec<Finding>,
    pub todos: Vec<TodoItem>,
    pub history: Vec<AuditEntry<WorkState>>,
}

/// SHA-256 over the evidence list, entries separated by a NUL byte.
pub(crate) fn fingerprint(evidence: &[String]) -> String {
    let mut hasher = Sha256::new();
    for item in evidence {
        hasher.update(item.as_bytes());
        hasher.update([0u8]);
    }
    format!("{:x}", hasher.finalize())
}

/// The bounded intake → plan → act → synthesize → evaluate loop.
pub struct WorkLoop<E> {
    config: OrchestratorConfig,
    executor: Arc<E>,
    reliability: Arc<ReliabilityRegistry>,
    subagents: Arc<SubagentRegistry>,
    observers: Vec<Arc<dyn TransitionObserver<WorkState>>>,
    persistence: Option<Arc<dyn SnapshotStore>>,
}

type WorkMachine = AsyncMachine<WorkState, WorkContext>;

impl<E: AgentExecutor> WorkLoop<E> {
    pub fn new(config: OrchestratorConfig, executor: Arc<E>) -> Result<Self, LoopError> {
        config.validate()?;
        let reliability = Arc::new(ReliabilityRegistry::new(config.reliability.clone()));
        Ok(Self {
            config,
            executor,
            reliability,
            subagents: Arc::new(SubagentRegistry::default()),
            observers: Vec::new(),
            persistence: None,
        })
    }

    /// Shares reliability state (breakers, buckets, bulkheads) with other loops.
    pub fn with_reliability(mut self, reliability: Arc<ReliabilityRegistry>) -> Self {
        self.reliability = reliability;
        self
    }

    pub fn with_subagents(mut self, subagents: Arc<SubagentRegistry>) -> Self {
        self.subagents = subagents;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn TransitionObserver<WorkState>>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn with_persistence(mut self, store: Arc<dyn SnapshotStore>) -> Self {
        self.persistence = Some(store);
        self
    }

    pub fn reliability(&self) -> &Arc<ReliabilityRegistry> {
        &self.reliability
    }

    fn machine(&self, context: WorkContext) -> Result<WorkMachine, FsmError> {
        use WorkState::*;

        let id = format!("work-loop-{}", Uuid::new_v4());
        let mut builder = MachineBuilder::<WorkState, WorkContext>::new(id)
            .states(WorkState::ALL)
            .transition(Intake, [Plan])
            .transition(Plan, [Act])
            .transition(Act, [Synthesize])
            .transition(Synthesize, [Evaluate])
            .transition(Evaluate, [Plan, Done])
            .from_any(Failed)
            .initial(Intake)
            .on_enter(Plan, |ctx| {
                ctx.data.iteration += 1;
                ctx.set_meta("iteration", ctx.data.iteration);
                Ok(())
            });
        for observer in &self.observers {
            builder = builder.observer(Arc::clone(observer));
        }
        if let Some(store) = &self.persistence {
            builder = builder.persistence(Arc::clone(store));
        }
        builder.build_async(context)
    }

    /// Runs the loop to completion.
    pub async fn run(&self, initial: WorkContext) -> Result<FinalOutcome, LoopError> {
        let machine = self.machine(initial)?;
        let mut delegator = TaskDelegator::new(
            Arc::clone(&self.executor),
            Arc::clone(&self.reliability),
            Arc::clone(&self.subagents),
            self.config.delegation.concurrency_cap,
        );
        let started = Instant::now();

        let driven = self.drive(&machine, &mut delegator, started).await;
        delegator.abandon();
        if let Err(err) = driven {
            warn!(machine_id = %machine.id(), error = %err, "work loop failed");
            if let Err(e) = machine.transition_to(WorkState::Failed).await {
                warn!(machine_id = %machine.id(), error = %e, "could not record failure state");
            }
            return Err(err);
        }

        let history = machine.history().await;
        let ctx = machine.into_context().data;
        let stop_reason = ctx.stop_reason.ok_or_else(|| LoopError::HandlerFailed {
            state: WorkState::Done.to_string(),
            reason: "loop finished without a stop reason".into(),
        })?;
        info!(
            stop_reason = %stop_reason,
            iterations = ctx.iteration,
            subagent_calls = ctx.subagent_calls,
            "work loop finished"
        );
        Ok(FinalOutcome {
            stop_reason,
            iteration_count: ctx.iteration,
            subagent_calls: ctx.subagent_calls,
            evidence: ctx.evidence,
            findings: ctx.findings.findings().to_vec(),
            todos: ctx.todos.items().to_vec(),
            history,
        })
    }

    async fn drive(
        &self,
        machine: &WorkMachine,
        delegator: &mut TaskDelegator<E>,
        started: Instant,
    ) -> Result<(), LoopError> {
        loop {
            let next = match machine.state().await {
                WorkState::Intake => self.intake(machine).await?,
                WorkState::Plan => self.plan(machine).await,
                WorkState::Act => self.act(machine, delegator).await,
                WorkState::Synthesize => self.synthesize(machine).await,
                WorkState::Evaluate => self.evaluate(machine, started).await,
                WorkState::Done => return Ok(()),
                WorkState::Failed => {
                    return Err(LoopError::HandlerFailed {
                        state: WorkState::Failed.to_string(),
                        reason: "machine is in the failure state".into(),
                    });
                }
            };
            machine.transition_to(next).await?;
        }
    }

    async fn intake(&self, machine: &WorkMachine) -> Result<WorkState, LoopError> {
        let mut guard = machine.context().await;
        if guard.data.goal.trim().is_empty() {
            return Err(LoopError::HandlerFailed {
                state: WorkState::Intake.to_string(),
                reason: "goal must not be empty".into(),
            });
        }
        let goal = guard.data.goal.clone();
        guard.set_meta("goal", goal);
        Ok(WorkState::Plan)
    }

    async fn plan(&self, machine: &WorkMachine) -> WorkState {
        let mut guard = machine.context().await;
        let ctx = &mut guard.data;
        if ctx.todos.is_empty() {
            let planned = TodoPlanner::plan(&ctx.goal);
            debug!(count = planned.len(), "planned todos from goal");
            ctx.todos.extend(planned);
        }
        for follow_up in std::mem::take(&mut ctx.follow_ups) {
            let known = ctx
                .todos
                .items()
                .iter()
                .any(|t| t.description.eq_ignore_ascii_case(follow_up.trim()));
            if !known && !follow_up.trim().is_empty() {
                ctx.todos.push(TodoPlanner::item(&follow_up));
            }
        }
        WorkState::Act
    }

    async fn act(&self, machine: &WorkMachine, delegator: &mut TaskDelegator<E>) -> WorkState {
        let mut guard = machine.context().await;
        let ctx = &mut guard.data;

        let remaining = self
            .config
            .work_loop
            .max_subagent_calls
            .saturating_sub(ctx.subagent_calls) as usize;
        let ready: Vec<TodoItem> = ctx.todos.ready().into_iter().take(remaining).collect();
        for todo in &ready {
            match delegator.delegate(todo) {
                Ok(dispatch) if dispatch.is_dispatched() => {
                    ctx.todos.set_status(&todo.id, TodoStatus::InProgress);
                }
                Ok(_) => {}
                Err(e) => warn!(todo_id = %todo.id, error = %e, "delegation refused"),
            }
        }

        for task in delegator.join_completed().await {
            ctx.subagent_calls += 1;
            absorb(ctx, delegator, task);
        }
        WorkState::Synthesize
    }

    async fn synthesize(&self, machine: &WorkMachine) -> WorkState {
        let mut guard = machine.context().await;
        let ctx = &mut guard.data;
        ctx.proposed_stop = if ctx.needs_human {
            Some(StopReason::HumanRequired)
        } else if ctx.blocking_question.is_some() {
            Some(StopReason::BlockingQuestion)
        } else if ctx.recommendation.is_some()
            || (ctx.todos.unresolved() == 0 && ctx.follow_ups.is_empty())
        {
            Some(StopReason::RecommendationReady)
        } else {
            None
        };
        WorkState::Evaluate
    }

    /// Stop gate. Starts from the proposal, then each hard check overrides
    /// it in turn: budgets, stagnation, risk.
    async fn evaluate(&self, machine: &WorkMachine, started: Instant) -> WorkState {
        let cfg = &self.config.work_loop;
        let mut guard = machine.context().await;
        let ctx = &mut guard.data;

        let mut stop = ctx.proposed_stop.take();

        let current = fingerprint(&ctx.evidence);
        if ctx.fingerprint.as_deref() == Some(current.as_str()) {
            ctx.stagnant_iterations += 1;
        } else {
            ctx.stagnant_iterations = 0;
        }
        ctx.fingerprint = Some(current);

        if ctx.iteration >= cfg.max_iterations
            || ctx.subagent_calls >= cfg.max_subagent_calls
            || started.elapsed() >= cfg.max_wall_clock()
        {
            stop = Some(StopReason::BudgetExhausted);
        }
        if ctx.stagnant_iterations >= cfg.stagnation_threshold {
            stop = Some(StopReason::Stagnation);
        }
        let risk = ctx.findings.max_risk();
        if risk > cfg.max_risk {
            stop = Some(StopReason::RiskThreshold);
        }

        match stop {
            Some(reason) => {
                debug!(
                    stop_reason = %reason,
                    iteration = ctx.iteration,
                    stagnant = ctx.stagnant_iterations,
                    risk,
                    "stopping work loop"
                );
                ctx.stop_reason = Some(reason);
                WorkState::Done
            }
            None => WorkState::Plan,
        }
    }
}

/// Folds one finished task into the context.
fn absorb<E: AgentExecutor>(ctx: &mut WorkContext, delegator: &mut TaskDelegator<E>, task: SubagentTask) {
    if let Some(payload) = task.result() {
        for item in &payload.evidence {
            if !ctx.evidence.contains(item) {
                ctx.evidence.push(item.clone());
            }
        }
        let findings = payload.findings.iter().cloned().map(|raw| {
            Finding::from_raw(raw, task.subagent.clone(), Some(task.todo_id.clone()))
        });
        let admitted = ctx.findings.admit_all(findings);
        for (previous, current) in &admitted.replaced {
            ctx.todos.repoint_finding(previous, current);
        }
        ctx.todos.attach_findings(&task.todo_id, admitted.retained);
        ctx.follow_ups.extend(payload.follow_ups.iter().cloned());
        ctx.needs_human |= payload.needs_human;
        if let Some(question) = &payload.blocking_question {
            ctx.blocking_question = Some(question.clone());
        }
        if let Some(recommendation) = &payload.recommendation {
            ctx.recommendation = Some(recommendation.clone());
        }
        ctx.todos.set_status(&task.todo_id, TodoStatus::Completed);
        delegator.mark_processed(&task.todo_id);
        return;
    }

    match task.error() {
        Some(err) if err.is_exhaustion() => {
            info!(todo_id = %task.todo_id, code = err.code(), "resource exhausted, todo requeued");
            ctx.todos.requeue(&task.todo_id);
        }
        Some(err) => {
            warn!(todo_id = %task.todo_id, error = %err, "todo cancelled after failed task");
            ctx.todos.set_status(&task.todo_id, TodoStatus::Cancelled);
            delegator.mark_processed(&task.todo_id);
        }
        None => {}
    }
}
