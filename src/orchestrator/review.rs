use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::assessment::Assessment;
use crate::changes::{ChangeProvider, ChangeSet};
use crate::config::OrchestratorConfig;
use crate::delegation::{
    AgentExecutor, Finding, FindingLedger, RawFinding, SubagentTask, TaskDelegator,
};
use crate::error::{FsmError, LoopError};
use crate::reliability::ReliabilityRegistry;
use crate::router::SubagentRegistry;
use crate::state_machine::{AsyncMachine, MachineBuilder, SnapshotStore, TransitionObserver};
use crate::todo::{Priority, TodoItem, TodoList, TodoPlanner, TodoStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReviewState {
    Idle,
    InitialExploration,
    DelegatingInvestigation,
    ReviewingResults,
    CreatingReviewTasks,
    FinalAssessment,
    Completed,
    Failed,
}

impl ReviewState {
    pub const ALL: [ReviewState; 8] = [
        ReviewState::Idle,
        ReviewState::InitialExploration,
        ReviewState::DelegatingInvestigation,
        ReviewState::ReviewingResults,
        ReviewState::CreatingReviewTasks,
        ReviewState::FinalAssessment,
        ReviewState::Completed,
        ReviewState::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewState::Idle => "IDLE",
            ReviewState::InitialExploration => "INITIAL_EXPLORATION",
            ReviewState::DelegatingInvestigation => "DELEGATING_INVESTIGATION",
            ReviewState::ReviewingResults => "REVIEWING_RESULTS",
            ReviewState::CreatingReviewTasks => "CREATING_REVIEW_TASKS",
            ReviewState::FinalAssessment => "FINAL_ASSESSMENT",
            ReviewState::Completed => "COMPLETED",
            ReviewState::Failed => "FAILED",
        }
    }
}

impl fmt::Display for ReviewState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Static analysis run during initial exploration. Its findings go through
/// the same validation and dedup as subagent findings.
pub trait StaticScanner: Send + Sync {
    fn name(&self) -> &str;
    fn scan(&self, changes: &ChangeSet) -> anyhow::Result<Vec<RawFinding>>;
}

/// Context owned by one review machine.
#[derive(Debug, Clone)]
pub struct ReviewContext {
    pub description: String,
    pub changes: ChangeSet,
    pub todos: TodoList,
    pub ledger: FindingLedger,
    pub iteration: u32,
    pub follow_ups: Vec<String>,
    pub failed_tasks: usize,
    pub assessment: Option<Assessment>,
}

impl ReviewContext {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            changes: ChangeSet::default(),
            todos: TodoList::new(),
            ledger: FindingLedger::new(ChangeSet::default()),
            iteration: 0,
            follow_ups: Vec::new(),
            failed_tasks: 0,
            assessment: None,
        }
    }

    /// Review todos to start from. Without any, one is created per changed
    /// file.
    pub fn with_todos(mut self, todos: impl IntoIterator<Item = TodoItem>) -> Self {
        self.todos.extend(todos);
        self
    }
}

type ReviewMachine = AsyncMachine<ReviewState, ReviewContext>;

/// The explore → delegate → collect → assess review loop.
pub struct ReviewOrchestrator<E> {
    config: OrchestratorConfig,
    executor: Arc<E>,
    changes: Arc<dyn ChangeProvider>,
    reliability: Arc<ReliabilityRegistry>,
    subagents: Arc<SubagentRegistry>,
    scanners: Vec<Arc<dyn StaticScanner>>,
    observers: Vec<Arc<dyn TransitionObserver<ReviewState>>>,
    persistence: Option<Arc<dyn SnapshotStore>>,
}

impl<E: AgentExecutor> ReviewOrchestrator<E> {
    pub fn new(
        config: OrchestratorConfig,
        executor: Arc<E>,
        changes: Arc<dyn ChangeProvider>,
    ) -> Result<Self, LoopError> {
        config.validate()?;
        let reliability = Arc::new(ReliabilityRegistry::new(config.reliability.clone()));
        Ok(Self {
            config,
            executor,
            changes,
            reliability,
            subagents: Arc::new(SubagentRegistry::default()),
            scanners: Vec::new(),
            observers: Vec::new(),
            persistence: None,
        })
    }

    pub fn with_reliability(mut self, reliability: Arc<ReliabilityRegistry>) -> Self {
        self.reliability = reliability;
        self
    }

    pub fn with_subagents(mut self, subagents: Arc<SubagentRegistry>) -> Self {
        self.subagents = subagents;
        self
    }

    pub fn with_scanner(mut self, scanner: Arc<dyn StaticScanner>) -> Self {
        self.scanners.push(scanner);
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn TransitionObserver<ReviewState>>) -> Self {
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

    fn machine(&self, context: ReviewContext) -> Result<ReviewMachine, FsmError> {
        use ReviewState::*;

        let max_iterations = self.config.review.max_iterations;
        let id = format!("review-{}", Uuid::new_v4());
        let mut builder = MachineBuilder::<ReviewState, ReviewContext>::new(id)
            .states(ReviewState::ALL)
            .transition(Idle, [InitialExploration])
            .transition(InitialExploration, [DelegatingInvestigation])
            .transition(DelegatingInvestigation, [ReviewingResults])
            .transition(ReviewingResults, [CreatingReviewTasks, FinalAssessment])
            .transition(CreatingReviewTasks, [DelegatingInvestigation])
            .transition(FinalAssessment, [Completed])
            .from_any(Failed)
            .initial(Idle)
            .guard(
                CreatingReviewTasks,
                DelegatingInvestigation,
                "iteration-budget",
                move |_, _, ctx| ctx.data.iteration < max_iterations,
            )
            .on_enter(DelegatingInvestigation, |ctx| {
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

    /// Runs one review to completion.
    pub async fn run_review(&self, context: ReviewContext) -> Result<Assessment, LoopError> {
        let machine = self.machine(context)?;
        let mut delegator = TaskDelegator::new(
            Arc::clone(&self.executor),
            Arc::clone(&self.reliability),
            Arc::clone(&self.subagents),
            self.config.delegation.concurrency_cap,
        );

        let driven = self.drive(&machine, &mut delegator).await;
        delegator.abandon();
        if let Err(err) = driven {
            warn!(machine_id = %machine.id(), error = %err, "review failed");
            if let Err(e) = machine.transition_to(ReviewState::Failed).await {
                warn!(machine_id = %machine.id(), error = %e, "could not record failure state");
            }
            return Err(err);
        }

        let ctx = machine.into_context().data;
        ctx.assessment.ok_or_else(|| LoopError::HandlerFailed {
            state: ReviewState::Completed.to_string(),
            reason: "review completed without an assessment".into(),
        })
    }

    async fn drive(
        &self,
        machine: &ReviewMachine,
        delegator: &mut TaskDelegator<E>,
    ) -> Result<(), LoopError> {
        loop {
            let next = match machine.state().await {
                ReviewState::Idle => ReviewState::InitialExploration,
                ReviewState::InitialExploration => self.explore(machine).await?,
                ReviewState::DelegatingInvestigation => self.delegate(machine, delegator).await,
                ReviewState::ReviewingResults => self.review_results(machine, delegator).await,
                ReviewState::CreatingReviewTasks => self.create_tasks(machine).await,
                ReviewState::FinalAssessment => self.assess(machine).await,
                ReviewState::Completed => return Ok(()),
                ReviewState::Failed => {
                    return Err(LoopError::HandlerFailed {
                        state: ReviewState::Failed.to_string(),
                        reason: "machine is in the failure state".into(),
                    });
                }
            };
            machine.transition_to(next).await?;
        }
    }

    async fn explore(&self, machine: &ReviewMachine) -> Result<ReviewState, LoopError> {
        let changes = self
            .changes
            .changed_files()
            .map_err(|e| LoopError::HandlerFailed {
                state: ReviewState::InitialExploration.to_string(),
                reason: format!("{e:#}"),
            })?;

        let mut guard = machine.context().await;
        let ctx = &mut guard.data;
        info!(changed_files = changes.len(), "review scope loaded");
        ctx.ledger = FindingLedger::new(changes.clone());
        ctx.changes = changes;

        if ctx.todos.is_empty() {
            let todos: Vec<TodoItem> = ctx
                .changes
                .files()
                .map(|file| TodoItem::new(format!("Security review of {file}"), Priority::High))
                .collect();
            ctx.todos.extend(todos);
        }

        for scanner in &self.scanners {
            match scanner.scan(&ctx.changes) {
                Ok(raw) => {
                    let findings = raw
                        .into_iter()
                        .map(|r| Finding::from_raw(r, scanner.name(), None));
                    let admitted = ctx.ledger.admit_all(findings);
                    for (previous, current) in &admitted.replaced {
                        ctx.todos.repoint_finding(previous, current);
                    }
                    debug!(
                        scanner = scanner.name(),
                        kept = admitted.retained.len(),
                        "static scan done"
                    );
                }
                Err(e) => warn!(scanner = scanner.name(), error = %e, "static scan failed"),
            }
        }
        Ok(ReviewState::DelegatingInvestigation)
    }

    async fn delegate(
        &self,
        machine: &ReviewMachine,
        delegator: &mut TaskDelegator<E>,
    ) -> ReviewState {
        let mut guard = machine.context().await;
        let ctx = &mut guard.data;
        let scope: Vec<&str> = ctx.changes.files().collect();
        let scope = scope.join("\n- ");

        for todo in ctx.todos.ready() {
            let instructions = format!(
                "{}\n\nContext: {}\n\nChanged files:\n- {scope}",
                todo.description, ctx.description
            );
            match delegator.delegate_with(&todo, instructions) {
                Ok(dispatch) if dispatch.is_dispatched() => {
                    ctx.todos.set_status(&todo.id, TodoStatus::InProgress);
                }
                Ok(_) => {}
                Err(e) => warn!(todo_id = %todo.id, error = %e, "delegation refused"),
            }
        }
        ReviewState::ReviewingResults
    }

    async fn review_results(
        &self,
        machine: &ReviewMachine,
        delegator: &mut TaskDelegator<E>,
    ) -> ReviewState {
        let mut guard = machine.context().await;
        let ctx = &mut guard.data;

        for task in delegator.join_completed().await {
            collect(ctx, delegator, task);
        }

        let more_work = ctx.todos.unresolved() > 0 || !ctx.follow_ups.is_empty();
        if more_work && ctx.iteration < self.config.review.max_iterations {
            ReviewState::CreatingReviewTasks
        } else {
            if more_work {
                info!(
                    iteration = ctx.iteration,
                    unresolved = ctx.todos.unresolved(),
                    "review iteration budget spent"
                );
            }
            ReviewState::FinalAssessment
        }
    }

    async fn create_tasks(&self, machine: &ReviewMachine) -> ReviewState {
        let mut guard = machine.context().await;
        let ctx = &mut guard.data;
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
        ReviewState::DelegatingInvestigation
    }

    async fn assess(&self, machine: &ReviewMachine) -> ReviewState {
        let mut guard = machine.context().await;
        let ctx = &mut guard.data;
        let assessment =
            Assessment::from_findings(ctx.ledger.findings(), self.config.review.confidence_threshold);
        info!(
            total_findings = assessment.total_findings,
            filtered_out = assessment.filtered_out,
            rejected = ctx.ledger.rejected(),
            recommendation = %assessment.recommendation,
            "review assessed"
        );
        ctx.assessment = Some(assessment);
        ReviewState::Completed
    }
}

/// Validates a finished task's findings and settles its todo.
fn collect<E: AgentExecutor>(
    ctx: &mut ReviewContext,
    delegator: &mut TaskDelegator<E>,
    task: SubagentTask,
) {
    if let Some(payload) = task.result() {
        let findings = payload.findings.iter().cloned().map(|raw| {
            Finding::from_raw(raw, task.subagent.clone(), Some(task.todo_id.clone()))
        });
        let admitted = ctx.ledger.admit_all(findings);
        for (previous, current) in &admitted.replaced {
            ctx.todos.repoint_finding(previous, current);
        }
        ctx.todos.attach_findings(&task.todo_id, admitted.retained);
        ctx.follow_ups.extend(payload.follow_ups.iter().cloned());
        ctx.todos.set_status(&task.todo_id, TodoStatus::Completed);
        delegator.mark_processed(&task.todo_id);
        return;
    }

    ctx.failed_tasks += 1;
    match task.error() {
        Some(err) if err.is_exhaustion() => {
            info!(todo_id = %task.todo_id, code = err.code(), "resource exhausted, todo requeued");
            ctx.todos.requeue(&task.todo_id);
        }
        Some(err) => {
            warn!(todo_id = %task.todo_id, error = %err, "review todo cancelled after failed task");
            ctx.todos.set_status(&task.todo_id, TodoStatus::Cancelled);
            delegator.mark_processed(&task.todo_id);
        }
        None => {}
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use serde_json::json;

    use super::*;
    use crate::changes::StaticChanges;
    use crate::delegation::{AgentPayload, FnExecutor, Severity};
    use crate::orchestrator::Recommendation;
    use crate::state_machine::InMemorySnapshotStore;

    fn config() -> OrchestratorConfig {
        let mut config = OrchestratorConfig::default();
        config.reliability.retry.base_delay_ms = 1;
        config.reliability.retry.max_delay_ms = 2;
        config.reliability.retry.jitter_factor = 0.0;
        config.reliability.rate_limiter.capacity = 1_000;
        config
    }

    fn finding(id: &str, file: &str, severity: &str, confidence: serde_json::Value) -> RawFinding {
        RawFinding {
            id: Some(id.into()),
            severity: severity.into(),
            confidence,
            title: format!("issue {id}"),
            evidence: format!("{file}:1"),
            file: Some(file.into()),
            line: Some(1),
            ..RawFinding::default()
        }
    }

    struct FixedScanner(Vec<RawFinding>);

    impl StaticScanner for FixedScanner {
        fn name(&self) -> &str {
            "fixed"
        }

        fn scan(&self, _changes: &ChangeSet) -> anyhow::Result<Vec<RawFinding>> {
            Ok(self.0.clone())
        }
    }

    struct BrokenScanner;

    impl StaticScanner for BrokenScanner {
        fn name(&self) -> &str {
            "broken"
        }

        fn scan(&self, _changes: &ChangeSet) -> anyhow::Result<Vec<RawFinding>> {
            anyhow::bail!("scanner crashed")
        }
    }

    #[tokio::test]
    async fn one_todo_per_changed_file_and_critical_blocks() {
        let executor = FnExecutor(|_a: String, instr: String| async move {
            let file = if instr.contains("Security review of a.py") { "a.py" } else { "b.py" };
            let severity = if file == "a.py" { "critical" } else { "low" };
            Ok(AgentPayload {
                findings: vec![finding(&format!("F-{file}"), file, severity, json!(0.9))],
                ..AgentPayload::default()
            })
        });
        let review = ReviewOrchestrator::new(
            config(),
            Arc::new(executor),
            Arc::new(StaticChanges::new(["a.py", "b.py"])),
        )
        .unwrap();

        let assessment = review.run_review(ReviewContext::new("PR #1")).await.unwrap();
        assert_eq!(assessment.total_findings, 2);
        assert_eq!(assessment.recommendation, Recommendation::Block);
        assert_eq!(assessment.overall_severity, Some(Severity::Critical));
        assert_eq!(assessment.count(Severity::Low), 1);
    }

    #[tokio::test]
    async fn follow_ups_trigger_another_round() {
        let calls = Arc::new(AtomicU32::new(0));
        let executor = {
            let calls = Arc::clone(&calls);
            FnExecutor(move |_a: String, _i: String| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                let mut reported = finding(&format!("F-{n}"), "config.py", "medium", json!(0.8));
                reported.line = Some(n + 1);
                async move {
                    Ok(AgentPayload {
                        findings: vec![reported],
                        follow_ups: if n == 0 {
                            vec!["Check config loading for injection".into()]
                        } else {
                            Vec::new()
                        },
                        ..AgentPayload::default()
                    })
                }
            })
        };
        let review = ReviewOrchestrator::new(
            config(),
            Arc::new(executor),
            Arc::new(StaticChanges::new(["config.py"])),
        )
        .unwrap();
        let assessment = review.run_review(ReviewContext::new("PR")).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(assessment.total_findings, 2);
        assert_eq!(assessment.recommendation, Recommendation::NeedsChanges);
    }

    #[tokio::test]
    async fn iteration_budget_stops_endless_follow_ups() {
        let calls = Arc::new(AtomicU32::new(0));
        let executor = {
            let calls = Arc::clone(&calls);
            FnExecutor(move |_a: String, _i: String| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    Ok(AgentPayload {
                        follow_ups: vec![format!("Dig deeper {n}")],
                        ..AgentPayload::default()
                    })
                }
            })
        };
        let mut cfg = config();
        cfg.review.max_iterations = 3;
        let review = ReviewOrchestrator::new(
            cfg,
            Arc::new(executor),
            Arc::new(StaticChanges::new(["config.py"])),
        )
        .unwrap();
        let assessment = review.run_review(ReviewContext::new("PR")).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(assessment.recommendation, Recommendation::Approve);
    }

    #[tokio::test]
    async fn scanner_findings_are_validated_and_failures_tolerated() {
        let executor = FnExecutor(|_a: String, _i: String| async { Ok(AgentPayload::default()) });
        let review = ReviewOrchestrator::new(
            config(),
            Arc::new(executor),
            Arc::new(StaticChanges::new(["config.py"])),
        )
        .unwrap()
        .with_scanner(Arc::new(FixedScanner(vec![
            finding("S-1", "config.py", "high", json!(0.7)),
            finding("S-2", "vendor/lib.py", "high", json!(0.7)),
        ])))
        .with_scanner(Arc::new(BrokenScanner));

        let assessment = review.run_review(ReviewContext::new("PR")).await.unwrap();
        assert_eq!(assessment.total_findings, 1);
        assert_eq!(assessment.findings[0].source, "fixed");
    }

    #[tokio::test]
    async fn final_state_is_persisted() {
        let executor = FnExecutor(|_a: String, _i: String| async { Ok(AgentPayload::default()) });
        let store = Arc::new(InMemorySnapshotStore::new());
        let review = ReviewOrchestrator::new(
            config(),
            Arc::new(executor),
            Arc::new(StaticChanges::new(["config.py"])),
        )
        .unwrap()
        .with_persistence(store.clone());

        review.run_review(ReviewContext::new("PR")).await.unwrap();
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn change_provider_failure_fails_the_review() {
        struct NoRepo;
        impl ChangeProvider for NoRepo {
            fn changed_files(&self) -> anyhow::Result<ChangeSet> {
                anyhow::bail!("not a git repository")
            }
        }
        let executor = FnExecutor(|_a: String, _i: String| async { Ok(AgentPayload::default()) });
        let review = ReviewOrchestrator::new(config(), Arc::new(executor), Arc::new(NoRepo)).unwrap();
        let err = review.run_review(ReviewContext::new("PR")).await.unwrap_err();
        assert!(
            matches!(err, LoopError::HandlerFailed { ref reason, .. } if reason.contains("not a git repository"))
        );
    }
}
