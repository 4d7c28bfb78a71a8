use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::DelegationError;

/// The closed set of specialised subagents work can be delegated to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubagentKind {
    SecurityAudit,
    CodeReview,
    Testing,
    Refactoring,
    Documentation,
    BugFix,
    Implementation,
}

impl SubagentKind {
    pub const ALL: [SubagentKind; 7] = [
        SubagentKind::SecurityAudit,
        SubagentKind::CodeReview,
        SubagentKind::Testing,
        SubagentKind::Refactoring,
        SubagentKind::Documentation,
        SubagentKind::BugFix,
        SubagentKind::Implementation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SubagentKind::SecurityAudit => "security_audit",
            SubagentKind::CodeReview => "code_review",
            SubagentKind::Testing => "testing",
            SubagentKind::Refactoring => "refactoring",
            SubagentKind::Documentation => "documentation",
            SubagentKind::BugFix => "bug_fix",
            SubagentKind::Implementation => "implementation",
        }
    }
}

impl fmt::Display for SubagentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Routes a work description to a subagent kind using weighted keyword scoring.
pub struct SubagentRouter;

impl SubagentRouter {
    /// Highest total score wins; ties go to the kind declared first in
    /// [`SubagentKind::ALL`]. No keyword hit means `fallback`.
    pub fn route_or(description: &str, fallback: SubagentKind) -> SubagentKind {
        let lower = description.to_lowercase();

        let keyword_kinds: &[(&str, SubagentKind, u32)] = &[
            ("security", SubagentKind::SecurityAudit, 10),
            ("vulnerab", SubagentKind::SecurityAudit, 10),
            ("inject", SubagentKind::SecurityAudit, 8),
            ("auth", SubagentKind::SecurityAudit, 5),
            ("secret", SubagentKind::SecurityAudit, 7),
            ("review", SubagentKind::CodeReview, 10),
            ("audit", SubagentKind::CodeReview, 5),
            ("inspect", SubagentKind::CodeReview, 5),
            ("test", SubagentKind::Testing, 10),
            ("spec", SubagentKind::Testing, 5),
            ("verify", SubagentKind::Testing, 5),
            ("refactor", SubagentKind::Refactoring, 10),
            ("clean up", SubagentKind::Refactoring, 5),
            ("doc", SubagentKind::Documentation, 10),
            ("readme", SubagentKind::Documentation, 5),
            ("fix", SubagentKind::BugFix, 10),
            ("bug", SubagentKind::BugFix, 10),
            ("debug", SubagentKind::BugFix, 7),
            ("error", SubagentKind::BugFix, 5),
            ("implement", SubagentKind::Implementation, 5),
            ("add", SubagentKind::Implementation, 3),
            ("create", SubagentKind::Implementation, 5),
            ("build", SubagentKind::Implementation, 5),
        ];

        let mut scores: HashMap<SubagentKind, u32> = HashMap::new();
        for &(keyword, kind, weight) in keyword_kinds {
            if lower.contains(keyword) {
                *scores.entry(kind).or_insert(0) += weight;
            }
        }

        let mut best: Option<(SubagentKind, u32)> = None;
        for kind in SubagentKind::ALL {
            let Some(&score) = scores.get(&kind) else {
                continue;
            };
            if best.is_none_or(|(_, s)| score > s) {
                best = Some((kind, score));
            }
        }
        best.map(|(kind, _)| kind).unwrap_or(fallback)
    }

    pub fn route(description: &str) -> SubagentKind {
        Self::route_or(description, SubagentKind::Implementation)
    }
}

/// Where one subagent kind is dispatched: the agent name handed to the
/// executor and the reliability resource guarding its calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubagentBinding {
    pub kind: SubagentKind,
    pub name: String,
    pub resource: String,
}

/// Frozen mapping from kinds to bindings. Built once, then read-only.
#[derive(Debug, Clone)]
pub struct SubagentRegistry {
    bindings: HashMap<SubagentKind, SubagentBinding>,
    fallback: SubagentKind,
}

impl Default for SubagentRegistry {
    fn default() -> Self {
        SubagentRegistry::builder().build()
    }
}

impl SubagentRegistry {
    pub fn builder() -> SubagentRegistryBuilder {
        SubagentRegistryBuilder::default()
    }

    pub fn get(&self, kind: SubagentKind) -> Option<&SubagentBinding> {
        self.bindings.get(&kind)
    }

    pub fn by_name(&self, name: &str) -> Result<&SubagentBinding, DelegationError> {
        self.bindings
            .values()
            .find(|b| b.name == name)
            .ok_or_else(|| DelegationError::UnknownSubagent(name.to_string()))
    }

    /// Routes a description to a registered binding. Kinds without a binding
    /// fall back to the registry's fallback kind.
    pub fn route(&self, description: &str) -> Result<&SubagentBinding, DelegationError> {
        let kind = SubagentRouter::route_or(description, self.fallback);
        self.get(kind)
            .or_else(|| self.get(self.fallback))
            .ok_or_else(|| DelegationError::UnknownSubagent(kind.to_string()))
    }

    pub fn kinds(&self) -> Vec<SubagentKind> {
        let mut kinds: Vec<SubagentKind> = self.bindings.keys().copied().collect();
        kinds.sort();
        kinds
    }
}

/// Collects bindings before freezing them into a [`SubagentRegistry`].
/// Starts with every kind bound to its own name and an `agent:<name>`
/// resource.
pub struct SubagentRegistryBuilder {
    bindings: HashMap<SubagentKind, SubagentBinding>,
    fallback: SubagentKind,
}

impl Default for SubagentRegistryBuilder {
    fn default() -> Self {
        let bindings = SubagentKind::ALL
            .into_iter()
            .map(|kind| {
                let binding = SubagentBinding {
                    kind,
                    name: kind.as_str().to_string(),
                    resource: format!("agent:{}", kind.as_str()),
                };
                (kind, binding)
            })
            .collect();
        Self {
            bindings,
            fallback: SubagentKind::Implementation,
        }
    }
}

impl SubagentRegistryBuilder {
    /// Starts with no bindings at all.
    pub fn empty() -> Self {
        Self {
            bindings: HashMap::new(),
            fallback: SubagentKind::Implementation,
        }
    }

    pub fn bind(
        mut self,
        kind: SubagentKind,
        name: impl Into<String>,
        resource: impl Into<String>,
    ) -> Self {
        self.bindings.insert(
            kind,
            SubagentBinding {
                kind,
                name: name.into(),
                resource: resource.into(),
            },
        );
        self
    }

    pub fn fallback(mut self, kind: SubagentKind) -> Self {
        self.fallback = kind;
        self
    }

    pub fn build(self) -> SubagentRegistry {
        SubagentRegistry {
            bindings: self.bindings,
            fallback: self.fallback,
        }
    }
}
