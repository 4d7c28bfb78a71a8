use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Immutable record of one applied transition.
///
/// Entries are also the payload published to observers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry<S> {
    pub machine_id: String,
    pub from: S,
    pub to: S,
    pub at: DateTime<Utc>,
}

/// Append-only command history of a machine. There is no undo.
#[derive(Debug, Clone)]
pub struct CommandHistory<S> {
    entries: Vec<AuditEntry<S>>,
}

impl<S> Default for CommandHistory<S> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<S: Clone> CommandHistory<S> {
    pub(crate) fn record(&mut self, entry: AuditEntry<S>) {
        self.entries.push(entry);
    }

    pub fn entries(&self) -> &[AuditEntry<S>] {
        &self.entries
    }

    pub fn last(&self) -> Option<&AuditEntry<S>> {
        self.entries.last()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Visited states in order, starting with the first `from`.
    pub fn path(&self) -> Vec<S> {
        let mut path: Vec<S> = Vec::with_capacity(self.entries.len() + 1);
        if let Some(first) = self.entries.first() {
            path.push(first.from.clone());
        }
        path.extend(self.entries.iter().map(|e| e.to.clone()));
        path
    }
}
