use std::future::Future;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CallError;

/// Finding as reported by a subagent, before validation.
///
/// `confidence` and `severity` are kept loose on purpose: they are parsed
/// leniently when the finding enters the ledger.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawFinding {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub severity: String,
    #[serde(default)]
    pub confidence: Value,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub evidence: String,
    #[serde(default)]
    pub file: Option<String>,
    #[serde(default)]
    pub line: Option<u32>,
    #[serde(default)]
    pub recommendation: String,
}

/// Result of one agent-execution call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentPayload {
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub evidence: Vec<String>,
    #[serde(default)]
    pub findings: Vec<RawFinding>,
    /// Additional work the agent suggests; becomes new todos.
    #[serde(default)]
    pub follow_ups: Vec<String>,
    /// Final recommendation; its presence proposes stopping the work loop.
    #[serde(default)]
    pub recommendation: Option<String>,
    #[serde(default)]
    pub blocking_question: Option<String>,
    #[serde(default)]
    pub needs_human: bool,
}

impl AgentPayload {
    pub fn from_json(text: &str) -> Result<Self, CallError> {
        serde_json::from_str(text).map_err(|e| CallError::Malformed(e.to_string()))
    }

    pub fn summary(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            ..Self::default()
        }
    }
}

/// The opaque "agent execution" capability.
///
/// One call is one external request; implementations must not retry
/// internally, the reliability stack does that.
pub trait AgentExecutor: Send + Sync + 'static {
    fn execute(
        &self,
        subagent: &str,
        instructions: &str,
    ) -> impl Future<Output = Result<AgentPayload, CallError>> + Send;
}

/// Adapts an async closure taking owned `(subagent, instructions)`.
pub struct FnExecutor<F>(pub F);

impl<F, Fut> AgentExecutor for FnExecutor<F>
where
    F: Fn(String, String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<AgentPayload, CallError>> + Send,
{
    fn execute(
        &self,
        subagent: &str,
        instructions: &str,
    ) -> impl Future<Output = Result<AgentPayload, CallError>> + Send {
        (self.0)(subagent.to_string(), instructions.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_from_json_defaults_missing_fields() {
        let payload = AgentPayload::from_json(
            r#"{"summary":"ok","findings":[{"severity":"high","confidence":"0.9","evidence":"a.py:3"}]}"#,
        )
        .unwrap();
        assert_eq!(payload.summary, "ok");
        assert!(payload.evidence.is_empty());
        assert_eq!(payload.findings.len(), 1);
        assert_eq!(payload.findings[0].confidence, Value::String("0.9".into()));
        assert!(!payload.needs_human);
    }

    #[test]
    fn payload_from_garbage_is_malformed() {
        let err = AgentPayload::from_json("not json").unwrap_err();
        assert!(matches!(err, CallError::Malformed(_)));
    }

    #[tokio::test]
    async fn fn_executor_forwards_arguments() {
        let exec = FnExecutor(|agent: String, instructions: String| async move {
            Ok(AgentPayload::summary(format!("{agent}:{instructions}")))
        });
        let payload = exec.execute("testing", "write tests").await.unwrap();
        assert_eq!(payload.summary, "testing:write tests");
    }
}
