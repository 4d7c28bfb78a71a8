use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::MappedMutexGuard;
use tracing::{debug, warn};

use super::audit::{AuditEntry, CommandHistory};
use super::definition::{MachineDefinition, StateId};
use super::hierarchy::{Children, ParentHandle};
use super::hooks::{Hook, Snapshot};
use crate::error::FsmError;

/// Data owned by exactly one machine instance.
#[derive(Debug, Clone, Default)]
pub struct MachineContext<C> {
    pub data: C,
    pub metadata: HashMap<String, Value>,
}

impl<C> MachineContext<C> {
    pub fn new(data: C) -> Self {
        Self {
            data,
            metadata: HashMap::new(),
        }
    }

    pub fn set_meta(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.metadata.insert(key.into(), value.into());
    }

    pub fn meta(&self, key: &str) -> Option<&Value> {
        self.metadata.get(key)
    }
}

/// Consistent read of a machine taken under its lock.
#[derive(Debug, Clone)]
pub struct MachineView<S> {
    pub state: S,
    pub transition_count: usize,
    pub last: Option<AuditEntry<S>>,
}

pub(crate) struct Core<S, C> {
    state: S,
    context: MachineContext<C>,
    history: CommandHistory<S>,
}

impl<S: StateId, C> Core<S, C> {
    fn new(initial: S, data: C) -> Self {
        Self {
            state: initial,
            context: MachineContext::new(data),
            history: CommandHistory::default(),
        }
    }

    fn view(&self) -> MachineView<S> {
        MachineView {
            state: self.state.clone(),
            transition_count: self.history.len(),
            last: self.history.last().cloned(),
        }
    }
}

/// The single transition algorithm shared by [`Machine`] and [`AsyncMachine`].
///
/// Legality and guards are checked before anything changes. Once the state
/// is replaced the transition is committed; hook, persistence and observer
/// failures after that point are only logged.
fn apply_transition<S: StateId, C>(
    def: &MachineDefinition<S, C>,
    core: &mut Core<S, C>,
    next: S,
) -> Result<AuditEntry<S>, FsmError> {
    let current = core.state.clone();

    if !def.allows(&current, &next) {
        return Err(FsmError::InvalidTransition {
            from: current.to_string(),
            to: next.to_string(),
        });
    }

    for guard in def.guards_for(&current, &next) {
        if !guard.allows(&current, &next, &core.context) {
            debug!(
                machine_id = %def.id,
                from = %current,
                to = %next,
                guard = guard.name(),
                "guard refused transition"
            );
            return Err(FsmError::GuardRejected {
                from: current.to_string(),
                to: next.to_string(),
                guard: guard.name().to_string(),
            });
        }
    }

    run_hooks(&def.id, "exit", &current, def.on_exit.get(&current), &mut core.context);
    core.state = next.clone();
    run_hooks(&def.id, "entry", &next, def.on_enter.get(&next), &mut core.context);

    let entry = AuditEntry {
        machine_id: def.id.clone(),
        from: current,
        to: next,
        at: Utc::now(),
    };
    core.history.record(entry.clone());
    debug!(machine_id = %def.id, from = %entry.from, to = %entry.to, "state transition");

    if let Some(store) = &def.persistence {
        let snapshot = Snapshot {
            machine_id: def.id.clone(),
            state: entry.to.to_string(),
            metadata: core.context.metadata.clone(),
            transition_count: core.history.len(),
            taken_at: entry.at,
        };
        if let Err(e) = store.set(&def.id, snapshot) {
            warn!(machine_id = %def.id, error = %e, "failed to persist snapshot");
        }
    }

    for observer in &def.observers {
        if let Err(e) = observer.on_transition(&entry) {
            warn!(machine_id = %def.id, error = %e, "transition observer failed");
        }
    }

    Ok(entry)
}

fn run_hooks<S: StateId, C>(
    machine_id: &str,
    kind: &str,
    state: &S,
    hooks: Option<&Vec<Hook<C>>>,
    ctx: &mut MachineContext<C>,
) {
    for hook in hooks.into_iter().flatten() {
        if let Err(e) = hook(ctx) {
            warn!(machine_id, state = %state, hook = kind, error = %e, "state hook failed");
        }
    }
}

/// Loads the persisted snapshot (if any) into `core`, without running hooks.
fn restore_core<S: StateId, C>(
    def: &MachineDefinition<S, C>,
    core: &mut Core<S, C>,
) -> anyhow::Result<bool> {
    let Some(store) = &def.persistence else {
        return Ok(false);
    };
    let Some(snapshot) = store.get(&def.id)? else {
        return Ok(false);
    };
    let Some(state) = def.state_named(&snapshot.state) else {
        warn!(
            machine_id = %def.id,
            state = %snapshot.state,
            "snapshot references an undeclared state, ignoring it"
        );
        return Ok(false);
    };
    core.state = state.clone();
    core.context.metadata = snapshot.metadata;
    debug!(machine_id = %def.id, state = %core.state, "restored from snapshot");
    Ok(true)
}

/// Machine whose transitions serialize behind a blocking mutex.
pub struct Machine<S, C> {
    def: Arc<MachineDefinition<S, C>>,
    core: parking_lot::Mutex<Core<S, C>>,
    parent: Option<ParentHandle>,
    children: Children,
}

impl<S: StateId, C: Send + 'static> Machine<S, C> {
    pub(crate) fn new(
        def: Arc<MachineDefinition<S, C>>,
        data: C,
        parent: Option<ParentHandle>,
    ) -> Self {
        let core = Core::new(def.initial.clone(), data);
        let children = Children::new(def.id.clone());
        Self {
            def,
            core: parking_lot::Mutex::new(core),
            parent,
            children,
        }
    }

    /// Builds another machine from an already validated definition.
    pub fn from_definition(def: Arc<MachineDefinition<S, C>>, data: C) -> Self {
        Self::new(def, data, None)
    }

    pub fn id(&self) -> &str {
        &self.def.id
    }

    pub fn definition(&self) -> &Arc<MachineDefinition<S, C>> {
        &self.def
    }

    pub fn state(&self) -> S {
        self.core.lock().state.clone()
    }

    pub fn is_in(&self, state: &S) -> bool {
        self.core.lock().state == *state
    }

    pub fn transition_to(&self, next: S) -> Result<(), FsmError> {
        let entry = {
            let mut core = self.core.lock();
            apply_transition(&self.def, &mut core, next)?
        };
        if let Some(parent) = &self.parent {
            parent.report(&entry.from.to_string(), &entry.to.to_string());
        }
        Ok(())
    }

    pub fn history(&self) -> Vec<AuditEntry<S>> {
        self.core.lock().history.entries().to_vec()
    }

    pub fn view(&self) -> MachineView<S> {
        self.core.lock().view()
    }

    pub fn with_context<R>(&self, f: impl FnOnce(&MachineContext<C>) -> R) -> R {
        f(&self.core.lock().context)
    }

    pub fn update_context<R>(&self, f: impl FnOnce(&mut MachineContext<C>) -> R) -> R {
        f(&mut self.core.lock().context)
    }

    /// Resumes from the persisted snapshot. Returns `true` if one was applied.
    pub fn restore(&self) -> anyhow::Result<bool> {
        let mut core = self.core.lock();
        restore_core(&self.def, &mut core)
    }

    pub fn children(&self) -> &Children {
        &self.children
    }

    /// Consumes the machine, returning its context.
    pub fn into_context(self) -> MachineContext<C> {
        self.core.into_inner().context
    }
}

/// Machine whose transitions serialize behind an async-aware mutex, so a
/// state handler may hold the context across `.await` points.
pub struct AsyncMachine<S, C> {
    def: Arc<MachineDefinition<S, C>>,
    core: tokio::sync::Mutex<Core<S, C>>,
    children: Children,
}

impl<S: StateId, C: Send + 'static> AsyncMachine<S, C> {
    pub(crate) fn new(def: Arc<MachineDefinition<S, C>>, data: C) -> Self {
        let core = Core::new(def.initial.clone(), data);
        let children = Children::new(def.id.clone());
        Self {
            def,
            core: tokio::sync::Mutex::new(core),
            children,
        }
    }

    pub fn from_definition(def: Arc<MachineDefinition<S, C>>, data: C) -> Self {
        Self::new(def, data)
    }

    pub fn id(&self) -> &str {
        &self.def.id
    }

    pub fn definition(&self) -> &Arc<MachineDefinition<S, C>> {
        &self.def
    }

    pub async fn state(&self) -> S {
        self.core.lock().await.state.clone()
    }

    pub async fn transition_to(&self, next: S) -> Result<(), FsmError> {
        let mut core = self.core.lock().await;
        apply_transition(&self.def, &mut core, next).map(|_| ())
    }

    pub async fn history(&self) -> Vec<AuditEntry<S>> {
        self.core.lock().await.history.entries().to_vec()
    }

    pub async fn view(&self) -> MachineView<S> {
        self.core.lock().await.view()
    }

    /// Exclusive access to the context. Transitions wait until it is dropped.
    pub async fn context(&self) -> MappedMutexGuard<'_, MachineContext<C>> {
        let guard = self.core.lock().await;
        tokio::sync::MutexGuard::map(guard, |core| &mut core.context)
    }

    pub async fn with_context<R>(&self, f: impl FnOnce(&MachineContext<C>) -> R) -> R {
        f(&self.core.lock().await.context)
    }

    pub async fn update_context<R>(&self, f: impl FnOnce(&mut MachineContext<C>) -> R) -> R {
        f(&mut self.core.lock().await.context)
    }

    pub async fn restore(&self) -> anyhow::Result<bool> {
        let mut core = self.core.lock().await;
        restore_core(&self.def, &mut core)
    }

    pub fn children(&self) -> &Children {
        &self.children
    }

    pub fn into_context(self) -> MachineContext<C> {
        self.core.into_inner().context
    }
}
