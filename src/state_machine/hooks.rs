//! Extension points of a machine: entry/exit hooks, guards, observers and
//! snapshot persistence.
//!
//! Failures of hooks, observers and persistence are logged by the machine
//! and never roll back a transition. Guards are the only extension that can
//! refuse one.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use super::audit::AuditEntry;
use super::machine::MachineContext;

/// Entry or exit hook, run while the transition lock is held.
pub type Hook<C> = Arc<dyn Fn(&mut MachineContext<C>) -> Result<()> + Send + Sync>;

/// Named predicate over `(current, next, context)`.
pub struct Guard<S, C> {
    name: String,
    check: Arc<dyn Fn(&S, &S, &MachineContext<C>) -> bool + Send + Sync>,
}

impl<S, C> Guard<S, C> {
    pub fn new(
        name: impl Into<String>,
        check: impl Fn(&S, &S, &MachineContext<C>) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            check: Arc::new(check),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn allows(&self, from: &S, to: &S, ctx: &MachineContext<C>) -> bool {
        (self.check)(from, to, ctx)
    }
}

impl<S, C> Clone for Guard<S, C> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            check: Arc::clone(&self.check),
        }
    }
}

impl<S, C> fmt::Debug for Guard<S, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Guard").field("name", &self.name).finish()
    }
}

/// Receives a notification after every applied transition.
pub trait TransitionObserver<S>: Send + Sync {
    fn on_transition(&self, event: &AuditEntry<S>) -> Result<()>;
}

/// Publishes state changes on a tokio broadcast channel.
///
/// Having no live receiver is not an error.
pub struct BroadcastObserver<S> {
    tx: broadcast::Sender<AuditEntry<S>>,
}

impl<S: Clone + Send + 'static> BroadcastObserver<S> {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AuditEntry<S>> {
        self.tx.subscribe()
    }
}

impl<S: Clone + Send + Sync + 'static> TransitionObserver<S> for BroadcastObserver<S> {
    fn on_transition(&self, event: &AuditEntry<S>) -> Result<()> {
        let _ = self.tx.send(event.clone());
        Ok(())
    }
}

/// Persisted view of a machine: current state plus metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub machine_id: String,
    pub state: String,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    pub transition_count: usize,
    pub taken_at: DateTime<Utc>,
}

/// Optional persistence backend, keyed by machine id.
pub trait SnapshotStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Snapshot>>;
    fn set(&self, key: &str, snapshot: Snapshot) -> Result<()>;
}

/// Process-local store, mostly useful for tests and short-lived hosts.
#[derive(Default)]
pub struct InMemorySnapshotStore {
    snapshots: Mutex<HashMap<String, Snapshot>>,
}

impl InMemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.snapshots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.lock().is_empty()
    }
}

impl SnapshotStore for InMemorySnapshotStore {
    fn get(&self, key: &str) -> Result<Option<Snapshot>> {
        Ok(self.snapshots.lock().get(key).cloned())
    }

    fn set(&self, key: &str, snapshot: Snapshot) -> Result<()> {
        self.snapshots.lock().insert(key.to_string(), snapshot);
        Ok(())
    }
}
