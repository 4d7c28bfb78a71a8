//! Hierarchical composition: a machine owns named sub-machines.
//!
//! A child never holds a reference to its parent. It receives a
//! [`ParentHandle`] (a channel sender) at registration and reports each of
//! its transitions through it; the parent drains the reports when it wants
//! them. Each child keeps its own lock.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::debug;

use super::definition::{MachineBuilder, StateId};
use super::machine::Machine;
use crate::error::FsmError;

/// Transition reported by a child to its parent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildReport {
    pub parent_id: String,
    pub child: String,
    pub from: String,
    pub to: String,
    pub at: DateTime<Utc>,
}

/// Handle given to a child at registration.
#[derive(Debug, Clone)]
pub struct ParentHandle {
    parent_id: String,
    child: String,
    tx: mpsc::UnboundedSender<ChildReport>,
}

impl ParentHandle {
    pub fn parent_id(&self) -> &str {
        &self.parent_id
    }

    pub(crate) fn report(&self, from: &str, to: &str) {
        let report = ChildReport {
            parent_id: self.parent_id.clone(),
            child: self.child.clone(),
            from: from.to_string(),
            to: to.to_string(),
            at: Utc::now(),
        };
        if self.tx.send(report).is_err() {
            debug!(parent_id = %self.parent_id, child = %self.child, "parent gone, report dropped");
        }
    }
}

/// Type-erased view of a child, driven by state name.
pub trait SubMachine: Send + Sync {
    fn id(&self) -> &str;
    fn state_name(&self) -> String;
    fn transition_named(&self, state: &str) -> Result<(), FsmError>;
    fn transition_count(&self) -> usize;
}

impl<S: StateId, C: Send + 'static> SubMachine for Machine<S, C> {
    fn id(&self) -> &str {
        Machine::id(self)
    }

    fn state_name(&self) -> String {
        self.state().to_string()
    }

    fn transition_named(&self, state: &str) -> Result<(), FsmError> {
        let Some(next) = self.definition().state_named(state).cloned() else {
            return Err(FsmError::InvalidTransition {
                from: self.state_name(),
                to: state.to_string(),
            });
        };
        self.transition_to(next)
    }

    fn transition_count(&self) -> usize {
        self.view().transition_count
    }
}

/// Registry of the sub-machines owned by one parent.
pub struct Children {
    parent_id: String,
    machines: RwLock<HashMap<String, Arc<dyn SubMachine>>>,
    tx: mpsc::UnboundedSender<ChildReport>,
    rx: Mutex<mpsc::UnboundedReceiver<ChildReport>>,
}

impl Children {
    pub(crate) fn new(parent_id: String) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            parent_id,
            machines: RwLock::new(HashMap::new()),
            tx,
            rx: Mutex::new(rx),
        }
    }

    /// Builds a child from `builder` and takes ownership of it. Replaces any
    /// child previously registered under `name`.
    ///
    /// Children are always blocking [`Machine`]s, even under an
    /// [`AsyncMachine`](super::AsyncMachine) parent: an async machine cannot
    /// be registered as a sub-machine, since it carries no parent handle.
    /// Child transitions never await, so driving them from async code is fine.
    pub fn register<S: StateId, C: Send + 'static>(
        &self,
        name: impl Into<String>,
        builder: MachineBuilder<S, C>,
        data: C,
    ) -> Result<(), FsmError> {
        let name = name.into();
        let handle = ParentHandle {
            parent_id: self.parent_id.clone(),
            child: name.clone(),
            tx: self.tx.clone(),
        };
        let child = Machine::new(builder.definition()?, data, Some(handle));
        self.machines.write().insert(name, Arc::new(child));
        Ok(())
    }

    pub fn transition(&self, name: &str, state: &str) -> Result<(), FsmError> {
        let child = self.machines.read().get(name).cloned();
        match child {
            Some(child) => child.transition_named(state),
            None => Err(FsmError::InvalidTransition {
                from: format!("{}/<missing:{name}>", self.parent_id),
                to: state.to_string(),
            }),
        }
    }

    pub fn state_of(&self, name: &str) -> Option<String> {
        self.machines.read().get(name).map(|c| c.state_name())
    }

    pub fn remove(&self, name: &str) -> bool {
        self.machines.write().remove(name).is_some()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.machines.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.machines.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.machines.read().is_empty()
    }

    /// Returns every report received since the last drain, oldest first.
    pub fn drain_reports(&self) -> Vec<ChildReport> {
        let mut rx = self.rx.lock();
        let mut out = Vec::new();
        while let Ok(report) = rx.try_recv() {
            out.push(report);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn child_builder(id: &str) -> MachineBuilder<&'static str, ()> {
        MachineBuilder::new(id)
            .states(["pending", "running", "finished"])
            .transition("pending", ["running"])
            .transition("running", ["finished"])
            .initial("pending")
    }

    fn parent() -> Machine<&'static str, ()> {
        MachineBuilder::new("parent")
            .states(["open", "closed"])
            .transition("open", ["closed"])
            .initial("open")
            .build(())
            .unwrap()
    }

    #[test]
    fn parent_drives_child_and_receives_reports() {
        let p = parent();
        p.children()
            .register("scan", child_builder("scan-machine"), ())
            .unwrap();

        p.children().transition("scan", "running").unwrap();
        p.children().transition("scan", "finished").unwrap();
        assert_eq!(p.children().state_of("scan").as_deref(), Some("finished"));

        let reports = p.children().drain_reports();
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].parent_id, "parent");
        assert_eq!(reports[0].child, "scan");
        assert_eq!(reports[1].to, "finished");
        assert!(p.children().drain_reports().is_empty());
    }

    #[test]
    fn child_and_parent_lock_independently() {
        let p = parent();
        p.children()
            .register("scan", child_builder("scan-machine"), ())
            .unwrap();
        p.update_context(|_| {
            // Parent context lock held while the child transitions.
            p.children().transition("scan", "running").unwrap();
        });
        assert_eq!(p.children().state_of("scan").as_deref(), Some("running"));
        p.transition_to("closed").unwrap();
    }

    #[test]
    fn illegal_child_transitions_are_reported_as_errors() {
        let p = parent();
        p.children()
            .register("scan", child_builder("scan-machine"), ())
            .unwrap();
        assert!(p.children().transition("scan", "finished").is_err());
        assert!(p.children().transition("scan", "unknown").is_err());
        assert!(p.children().transition("missing", "running").is_err());
        assert!(p.children().drain_reports().is_empty());
    }

    #[tokio::test]
    async fn async_parent_owns_blocking_children() {
        let p = MachineBuilder::<&'static str, ()>::new("async-parent")
            .states(["open", "closed"])
            .transition("open", ["closed"])
            .initial("open")
            .build_async(())
            .unwrap();
        p.children()
            .register("scan", child_builder("scan-machine"), ())
            .unwrap();

        p.children().transition("scan", "running").unwrap();
        p.transition_to("closed").await.unwrap();

        let reports = p.children().drain_reports();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].parent_id, "async-parent");
        assert_eq!(reports[0].to, "running");
    }

    #[test]
    fn invalid_child_definition_is_rejected_at_registration() {
        let p = parent();
        let err = p
            .children()
            .register("bad", child_builder("bad").initial("nope"), ())
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_INITIAL_STATE");
        assert!(p.children().is_empty());

        p.children().register("ok", child_builder("ok"), ()).unwrap();
        assert_eq!(p.children().names(), vec!["ok".to_string()]);
        assert!(p.children().remove("ok"));
    }
}
