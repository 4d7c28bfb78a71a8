use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::agent::AgentPayload;
use crate::error::{DelegationError, ReliabilityError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
        }
    }
}

/// One unit of work handed to a subagent on behalf of a todo.
///
/// Status moves exactly once along pending → in-progress → completed. A
/// completed task carries either a payload or the error that ended it.
#[derive(Debug, Clone)]
pub struct SubagentTask {
    pub id: String,
    pub todo_id: String,
    pub subagent: String,
    pub resource: String,
    pub instructions: String,
    status: TaskStatus,
    result: Option<AgentPayload>,
    error: Option<ReliabilityError>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl SubagentTask {
    pub fn new(
        todo_id: impl Into<String>,
        subagent: impl Into<String>,
        resource: impl Into<String>,
        instructions: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            todo_id: todo_id.into(),
            subagent: subagent.into(),
            resource: resource.into(),
            instructions: instructions.into(),
            status: TaskStatus::Pending,
            result: None,
            error: None,
            created_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn status(&self) -> TaskStatus {
        self.status
    }

    pub fn result(&self) -> Option<&AgentPayload> {
        self.result.as_ref()
    }

    pub fn error(&self) -> Option<&ReliabilityError> {
        self.error.as_ref()
    }

    pub fn succeeded(&self) -> bool {
        self.status == TaskStatus::Completed && self.result.is_some()
    }

    fn advance(&mut self, from: TaskStatus, to: TaskStatus) -> Result<(), DelegationError> {
        if self.status != from {
            return Err(DelegationError::InvalidTaskTransition {
                task_id: self.id.clone(),
                from: self.status.as_str(),
                to: to.as_str(),
            });
        }
        self.status = to;
        Ok(())
    }

    pub fn start(&mut self) -> Result<(), DelegationError> {
        self.advance(TaskStatus::Pending, TaskStatus::InProgress)
    }

    pub fn complete(
        &mut self,
        outcome: Result<AgentPayload, ReliabilityError>,
    ) -> Result<(), DelegationError> {
        self.advance(TaskStatus::InProgress, TaskStatus::Completed)?;
        match outcome {
            Ok(payload) => self.result = Some(payload),
            Err(err) => self.error = Some(err),
        }
        self.finished_at = Some(Utc::now());
        Ok(())
    }
}
