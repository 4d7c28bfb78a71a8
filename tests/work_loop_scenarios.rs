use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use taskforge::delegation::{AgentPayload, FnExecutor};
use taskforge::orchestrator::{StopReason, WorkContext, WorkLoop, WorkState};
use taskforge::todo::{Priority, TodoItem, TodoStatus};
use taskforge::OrchestratorConfig;

fn fast_config() -> OrchestratorConfig {
    let mut config = OrchestratorConfig::default();
    config.reliability.retry.base_delay_ms = 1;
    config.reliability.retry.max_delay_ms = 2;
    config.reliability.retry.jitter_factor = 0.0;
    config.reliability.rate_limiter.capacity = 1_000;
    config
}

#[tokio::test]
async fn repeated_evidence_stops_on_stagnation() {
    let executor = FnExecutor(|_agent: String, _instructions: String| async {
        Ok(AgentPayload {
            evidence: vec!["same observation".into()],
            follow_ups: vec!["look again".into()],
            ..AgentPayload::default()
        })
    });
    let mut config = fast_config();
    config.work_loop.max_iterations = 2;
    config.work_loop.stagnation_threshold = 1;

    let work = WorkLoop::new(config, Arc::new(executor)).unwrap();
    let outcome = work
        .run(WorkContext::new("investigate flaky login").with_todos([TodoItem::new(
            "reproduce the failure",
            Priority::High,
        )]))
        .await
        .unwrap();

    assert_eq!(outcome.stop_reason, StopReason::Stagnation);
    assert_eq!(outcome.stop_reason.as_str(), "stagnation");
    assert_eq!(outcome.iteration_count, 2);
    assert_eq!(outcome.evidence, vec!["same observation".to_string()]);
}

#[tokio::test]
async fn human_escalation_stops_after_first_round() {
    let executor = FnExecutor(|_agent: String, _instructions: String| async {
        Ok(AgentPayload {
            needs_human: true,
            blocking_question: Some("which region?".into()),
            follow_ups: vec!["continue".into()],
            ..AgentPayload::default()
        })
    });
    let work = WorkLoop::new(fast_config(), Arc::new(executor)).unwrap();
    let outcome = work
        .run(WorkContext::new("migrate storage").with_todos([TodoItem::new(
            "choose a bucket",
            Priority::Medium,
        )]))
        .await
        .unwrap();

    assert_eq!(outcome.stop_reason, StopReason::HumanRequired);
    assert_eq!(outcome.iteration_count, 1);
    let path: Vec<WorkState> = outcome.history.iter().map(|e| e.to).collect();
    assert_eq!(path.first(), Some(&WorkState::Plan));
    assert_eq!(path.last(), Some(&WorkState::Done));
}

#[tokio::test]
async fn rate_limited_todo_is_requeued_not_cancelled() {
    let calls = Arc::new(AtomicU32::new(0));
    let executor = {
        let calls = Arc::clone(&calls);
        FnExecutor(move |_agent: String, _instructions: String| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                Ok(AgentPayload {
                    evidence: vec![format!("step {n}")],
                    follow_ups: vec!["write the migration".into()],
                    ..AgentPayload::default()
                })
            }
        })
    };
    let mut config = fast_config();
    config.reliability.rate_limiter.capacity = 1;
    config.reliability.rate_limiter.refill_per_sec = 0.0;
    config.work_loop.max_iterations = 3;
    config.work_loop.stagnation_threshold = 10;

    let work = WorkLoop::new(config, Arc::new(executor)).unwrap();
    let outcome = work
        .run(WorkContext::new("add audit table").with_todos([TodoItem::new(
            "design the schema",
            Priority::High,
        )]))
        .await
        .unwrap();

    assert_eq!(outcome.stop_reason, StopReason::BudgetExhausted);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(outcome.todos[0].status, TodoStatus::Completed);
    let follow_up = outcome
        .todos
        .iter()
        .find(|t| t.description.contains("migration"))
        .unwrap();
    assert_eq!(follow_up.status, TodoStatus::Pending);
}

#[tokio::test]
async fn explicit_goal_list_becomes_todos() {
    let executor = FnExecutor(|_agent: String, instructions: String| async move {
        Ok(AgentPayload {
            evidence: vec![format!("done: {instructions}")],
            ..AgentPayload::default()
        })
    });
    let mut config = fast_config();
    config.delegation.concurrency_cap = 2;
    let work = WorkLoop::new(config, Arc::new(executor)).unwrap();
    let outcome = work
        .run(WorkContext::new("1. add logging\n2. fix the typo in README"))
        .await
        .unwrap();

    assert_eq!(outcome.stop_reason, StopReason::RecommendationReady);
    assert_eq!(outcome.todos.len(), 2);
    assert!(outcome.todos.iter().all(|t| t.status == TodoStatus::Completed));
    assert_eq!(outcome.evidence.len(), 2);
}
