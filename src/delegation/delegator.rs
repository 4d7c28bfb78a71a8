use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::agent::AgentExecutor;
use super::task::SubagentTask;
use crate::error::DelegationError;
use crate::reliability::ReliabilityRegistry;
use crate::router::SubagentRegistry;
use crate::todo::TodoItem;

/// Why a todo was not dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    AlreadyProcessed,
    InFlight,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    Dispatched { task_id: String, subagent: String },
    Skipped(SkipReason),
}

impl Dispatch {
    pub fn is_dispatched(&self) -> bool {
        matches!(self, Dispatch::Dispatched { .. })
    }
}

/// Bounded-concurrency dispatch of subagent tasks.
///
/// At most `concurrency_cap` tasks call out at once; further tasks are
/// spawned immediately but wait for a slot. A todo id recorded with
/// [`mark_processed`](Self::mark_processed) is never dispatched again, and a
/// todo with a task still running is skipped.
///
/// Every call goes through the [`ReliabilityRegistry`] under the resource
/// the subagent is bound to.
pub struct TaskDelegator<E> {
    executor: Arc<E>,
    reliability: Arc<ReliabilityRegistry>,
    subagents: Arc<SubagentRegistry>,
    slots: Arc<Semaphore>,
    concurrency_cap: usize,
    running: JoinSet<SubagentTask>,
    in_flight: HashSet<String>,
    processed: HashSet<String>,
    dispatched: u32,
    closed: bool,
    late: Arc<AtomicUsize>,
}

impl<E: AgentExecutor> TaskDelegator<E> {
    pub fn new(
        executor: Arc<E>,
        reliability: Arc<ReliabilityRegistry>,
        subagents: Arc<SubagentRegistry>,
        concurrency_cap: usize,
    ) -> Self {
        let concurrency_cap = concurrency_cap.max(1);
        Self {
            executor,
            reliability,
            subagents,
            slots: Arc::new(Semaphore::new(concurrency_cap)),
            concurrency_cap,
            running: JoinSet::new(),
            in_flight: HashSet::new(),
            processed: HashSet::new(),
            dispatched: 0,
            closed: false,
            late: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn concurrency_cap(&self) -> usize {
        self.concurrency_cap
    }

    /// Dispatches `todo` with its description as instructions.
    pub fn delegate(&mut self, todo: &TodoItem) -> Result<Dispatch, DelegationError> {
        self.delegate_with(todo, todo.description.clone())
    }

    pub fn delegate_with(
        &mut self,
        todo: &TodoItem,
        instructions: String,
    ) -> Result<Dispatch, DelegationError> {
        if self.closed {
            return Err(DelegationError::Closed);
        }
        if self.processed.contains(&todo.id) {
            info!(todo_id = %todo.id, "skipping delegation: todo already processed");
            return Ok(Dispatch::Skipped(SkipReason::AlreadyProcessed));
        }
        if self.in_flight.contains(&todo.id) {
            info!(todo_id = %todo.id, "skipping delegation: task still running");
            return Ok(Dispatch::Skipped(SkipReason::InFlight));
        }

        let binding = self.subagents.route(&todo.description)?;
        let mut task = SubagentTask::new(
            todo.id.clone(),
            binding.name.clone(),
            binding.resource.clone(),
            instructions,
        );
        task.start()?;

        let dispatch = Dispatch::Dispatched {
            task_id: task.id.clone(),
            subagent: task.subagent.clone(),
        };
        debug!(
            todo_id = %todo.id,
            task_id = %task.id,
            subagent = %task.subagent,
            resource = %task.resource,
            "delegating"
        );

        let executor = Arc::clone(&self.executor);
        let reliability = Arc::clone(&self.reliability);
        let slots = Arc::clone(&self.slots);
        self.running.spawn(async move {
            // The semaphore is never closed, so acquisition only fails on shutdown.
            let _slot = slots.acquire_owned().await.ok();
            let outcome = reliability
                .execute(&task.resource, || {
                    executor.execute(&task.subagent, &task.instructions)
                })
                .await;
            if let Err(e) = &outcome {
                warn!(
                    task_id = %task.id,
                    resource = %task.resource,
                    code = e.code(),
                    error = %e,
                    "subagent task failed"
                );
            }
            if let Err(e) = task.complete(outcome) {
                error!(task_id = %task.id, error = %e, "task completed twice");
            }
            task
        });

        self.in_flight.insert(todo.id.clone());
        self.dispatched += 1;
        Ok(dispatch)
    }

    /// Dispatches every todo in `todos`, returning the number actually
    /// dispatched.
    pub fn delegate_all<'a>(
        &mut self,
        todos: impl IntoIterator<Item = &'a TodoItem>,
    ) -> Result<usize, DelegationError> {
        let mut count = 0;
        for todo in todos {
            if self.delegate(todo)?.is_dispatched() {
                count += 1;
            }
        }
        Ok(count)
    }

    /// Waits for the next task to finish. Order is completion order.
    pub async fn join_next(&mut self) -> Option<SubagentTask> {
        loop {
            match self.running.join_next().await? {
                Ok(task) => {
                    self.in_flight.remove(&task.todo_id);
                    return Some(task);
                }
                Err(e) => error!(error = %e, "subagent task panicked or was aborted"),
            }
        }
    }

    /// Waits for every in-flight task.
    pub async fn join_completed(&mut self) -> Vec<SubagentTask> {
        let mut done = Vec::new();
        while let Some(task) = self.join_next().await {
            done.push(task);
        }
        done
    }

    pub fn mark_processed(&mut self, todo_id: impl Into<String>) {
        self.processed.insert(todo_id.into());
    }

    pub fn is_processed(&self, todo_id: &str) -> bool {
        self.processed.contains(todo_id)
    }

    pub fn processed_count(&self) -> usize {
        self.processed.len()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Tasks dispatched so far.
    pub fn dispatched(&self) -> u32 {
        self.dispatched
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Results that arrived after [`abandon`](Self::abandon) and were dropped.
    pub fn late_results(&self) -> usize {
        self.late.load(Ordering::SeqCst)
    }

    /// Stops accepting tasks. Running tasks are left to finish; their
    /// results are dropped and counted as late.
    pub fn abandon(&mut self) {
        self.closed = true;
        self.release_in_flight();
    }

    fn release_in_flight(&mut self) {
        self.in_flight.clear();
        hand_off(std::mem::take(&mut self.running), Arc::clone(&self.late));
    }
}

impl<E> Drop for TaskDelegator<E> {
    fn drop(&mut self) {
        // Dropping the JoinSet would abort in-flight calls.
        hand_off(std::mem::take(&mut self.running), Arc::clone(&self.late));
    }
}

/// Lets still-running tasks finish in the background, counting and logging
/// each result as late.
fn hand_off(mut running: JoinSet<SubagentTask>, late: Arc<AtomicUsize>) {
    if running.is_empty() {
        return;
    }
    let Ok(handle) = tokio::runtime::Handle::try_current() else {
        warn!(
            tasks = running.len(),
            "no runtime to drain in-flight subagent tasks; detaching them"
        );
        running.detach_all();
        return;
    };
    handle.spawn(async move {
        while let Some(joined) = running.join_next().await {
            if let Ok(task) = joined {
                late.fetch_add(1, Ordering::SeqCst);
                warn!(
                    task_id = %task.id,
                    todo_id = %task.todo_id,
                    subagent = %task.subagent,
                    "late subagent result dropped"
                );
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::{
        BulkheadConfig, CircuitBreakerConfig, RateLimiterConfig, ReliabilityConfig, RetryConfig,
    };
    use crate::delegation::{AgentPayload, FnExecutor};
    use crate::error::CallError;
    use crate::todo::Priority;

    fn reliability() -> Arc<ReliabilityRegistry> {
        Arc::new(ReliabilityRegistry::new(ReliabilityConfig {
            call_timeout_ms: 5_000,
            circuit_breaker: CircuitBreakerConfig {
                failure_threshold: 10,
                reset_timeout_ms: 60_000,
            },
            retry: RetryConfig {
                max_attempts: 2,
                base_delay_ms: 1,
                max_delay_ms: 2,
                jitter_factor: 0.0,
            },
            rate_limiter: RateLimiterConfig {
                capacity: 1_000,
                refill_per_sec: 0.0,
            },
            bulkhead: BulkheadConfig {
                capacity: 16,
                acquire_timeout_ms: 5_000,
            },
        }))
    }

    fn todo(id: &str, description: &str) -> TodoItem {
        TodoItem::new(description, Priority::Medium).with_id(id)
    }

    #[tokio::test]
    async fn never_exceeds_concurrency_cap() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let executor = {
            let active = Arc::clone(&active);
            let peak = Arc::clone(&peak);
            FnExecutor(move |_agent: String, _instr: String| {
                let active = Arc::clone(&active);
                let peak = Arc::clone(&peak);
                async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok(AgentPayload::summary("ok"))
                }
            })
        };

        let mut delegator = TaskDelegator::new(
            Arc::new(executor),
            reliability(),
            Arc::new(SubagentRegistry::default()),
            2,
        );
        let todos: Vec<TodoItem> = (0..6).map(|i| todo(&format!("t{i}"), "review auth")).collect();
        assert_eq!(delegator.delegate_all(&todos).unwrap(), 6);

        let done = delegator.join_completed().await;
        assert_eq!(done.len(), 6);
        assert!(done.iter().all(SubagentTask::succeeded));
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(delegator.in_flight(), 0);
    }

    #[tokio::test]
    async fn processed_and_in_flight_todos_are_skipped() {
        let executor = FnExecutor(|_a: String, _i: String| async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok(AgentPayload::default())
        });
        let mut delegator = TaskDelegator::new(
            Arc::new(executor),
            reliability(),
            Arc::new(SubagentRegistry::default()),
            4,
        );
        let t = todo("t1", "check for injection");

        let first = delegator.delegate(&t).unwrap();
        assert!(matches!(first, Dispatch::Dispatched { ref subagent, .. } if subagent == "security_audit"));
        assert_eq!(
            delegator.delegate(&t).unwrap(),
            Dispatch::Skipped(SkipReason::InFlight)
        );

        let done = delegator.join_completed().await;
        assert_eq!(done.len(), 1);
        delegator.mark_processed(&done[0].todo_id);

        assert_eq!(
            delegator.delegate(&t).unwrap(),
            Dispatch::Skipped(SkipReason::AlreadyProcessed)
        );
        assert_eq!(delegator.dispatched(), 1);
    }

    #[tokio::test]
    async fn call_failure_is_carried_on_the_task() {
        let executor = FnExecutor(|_a: String, _i: String| async {
            Err::<AgentPayload, _>(CallError::Rejected {
                status: 400,
                message: "bad".into(),
            })
        });
        let mut delegator = TaskDelegator::new(
            Arc::new(executor),
            reliability(),
            Arc::new(SubagentRegistry::default()),
            1,
        );
        delegator.delegate(&todo("t1", "write docs")).unwrap();
        let task = delegator.join_next().await.unwrap();
        assert!(!task.succeeded());
        assert_eq!(task.error().unwrap().code(), "CALL_FAILED");
    }

    #[tokio::test]
    async fn abandoned_results_are_counted_as_late() {
        let executor = FnExecutor(|_a: String, _i: String| async {
            tokio::time::sleep(Duration::from_millis(30)).await;
            Ok(AgentPayload::default())
        });
        let mut delegator = TaskDelegator::new(
            Arc::new(executor),
            reliability(),
            Arc::new(SubagentRegistry::default()),
            2,
        );
        delegator.delegate(&todo("t1", "a")).unwrap();
        delegator.delegate(&todo("t2", "b")).unwrap();
        delegator.abandon();

        assert!(delegator.is_closed());
        assert!(matches!(
            delegator.delegate(&todo("t3", "c")),
            Err(DelegationError::Closed)
        ));
        assert!(delegator.join_next().await.is_none());

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(delegator.late_results(), 2);
    }
}
