use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use anyhow::Result;

use super::hooks::{Guard, Hook, SnapshotStore, TransitionObserver};
use super::machine::{AsyncMachine, Machine, MachineContext};
use crate::error::FsmError;

/// Anything usable as a state identifier.
pub trait StateId: Clone + Eq + Hash + fmt::Debug + fmt::Display + Send + Sync + 'static {}

impl<T> StateId for T where T: Clone + Eq + Hash + fmt::Debug + fmt::Display + Send + Sync + 'static {}

/// Validated, immutable description of a machine. Shared by every machine
/// built from the same builder.
pub struct MachineDefinition<S, C> {
    pub(crate) id: String,
    pub(crate) states: Vec<S>,
    pub(crate) transitions: HashMap<S, HashSet<S>>,
    pub(crate) initial: S,
    pub(crate) on_enter: HashMap<S, Vec<Hook<C>>>,
    pub(crate) on_exit: HashMap<S, Vec<Hook<C>>>,
    pub(crate) guards: HashMap<(S, S), Vec<Guard<S, C>>>,
    pub(crate) persistence: Option<Arc<dyn SnapshotStore>>,
    pub(crate) observers: Vec<Arc<dyn TransitionObserver<S>>>,
}

impl<S: StateId, C> MachineDefinition<S, C> {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn initial(&self) -> &S {
        &self.initial
    }

    pub fn states(&self) -> &[S] {
        &self.states
    }

    pub fn is_declared(&self, state: &S) -> bool {
        self.states.contains(state)
    }

    /// Membership check against the transition table.
    pub fn allows(&self, from: &S, to: &S) -> bool {
        self.transitions
            .get(from)
            .is_some_and(|targets| targets.contains(to))
    }

    pub fn targets(&self, from: &S) -> Vec<S> {
        let mut out: Vec<S> = self
            .states
            .iter()
            .filter(|s| self.allows(from, s))
            .cloned()
            .collect();
        out.dedup();
        out
    }

    /// Finds a declared state by its display name.
    pub fn state_named(&self, name: &str) -> Option<&S> {
        self.states.iter().find(|s| s.to_string() == name)
    }

    pub(crate) fn guards_for(&self, from: &S, to: &S) -> &[Guard<S, C>] {
        self.guards
            .get(&(from.clone(), to.clone()))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

/// Fluent builder. Nothing is validated until [`MachineBuilder::definition`]
/// (or one of the `build*` methods) is called.
pub struct MachineBuilder<S, C> {
    id: String,
    states: Vec<S>,
    transitions: Vec<(S, S)>,
    any_targets: Vec<S>,
    initial: Option<S>,
    on_enter: Vec<(S, Hook<C>)>,
    on_exit: Vec<(S, Hook<C>)>,
    guards: Vec<(S, S, Guard<S, C>)>,
    persistence: Option<Arc<dyn SnapshotStore>>,
    observers: Vec<Arc<dyn TransitionObserver<S>>>,
}

impl<S: StateId, C: Send + 'static> MachineBuilder<S, C> {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            states: Vec::new(),
            transitions: Vec::new(),
            any_targets: Vec::new(),
            initial: None,
            on_enter: Vec::new(),
            on_exit: Vec::new(),
            guards: Vec::new(),
            persistence: None,
            observers: Vec::new(),
        }
    }

    pub fn states(mut self, states: impl IntoIterator<Item = S>) -> Self {
        for state in states {
            if !self.states.contains(&state) {
                self.states.push(state);
            }
        }
        self
    }

    pub fn transition(mut self, from: S, targets: impl IntoIterator<Item = S>) -> Self {
        for to in targets {
            self.transitions.push((from.clone(), to));
        }
        self
    }

    /// Makes `to` reachable from every other declared state.
    pub fn from_any(mut self, to: S) -> Self {
        self.any_targets.push(to);
        self
    }

    pub fn initial(mut self, state: S) -> Self {
        self.initial = Some(state);
        self
    }

    pub fn on_enter(
        mut self,
        state: S,
        hook: impl Fn(&mut MachineContext<C>) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.on_enter.push((state, Arc::new(hook)));
        self
    }

    pub fn on_exit(
        mut self,
        state: S,
        hook: impl Fn(&mut MachineContext<C>) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.on_exit.push((state, Arc::new(hook)));
        self
    }

    pub fn guard(
        mut self,
        from: S,
        to: S,
        name: impl Into<String>,
        check: impl Fn(&S, &S, &MachineContext<C>) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.guards.push((from, to, Guard::new(name, check)));
        self
    }

    pub fn persistence(mut self, store: Arc<dyn SnapshotStore>) -> Self {
        self.persistence = Some(store);
        self
    }

    pub fn observer(mut self, observer: Arc<dyn TransitionObserver<S>>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Validates the definition. Configuration errors surface here and
    /// nowhere else.
    pub fn definition(self) -> Result<Arc<MachineDefinition<S, C>>, FsmError> {
        if self.states.is_empty() {
            return Err(FsmError::EmptyDefinition {
                machine_id: self.id,
            });
        }

        let declared: HashSet<&S> = self.states.iter().collect();

        let initial = match self.initial {
            Some(state) if declared.contains(&state) => state,
            Some(state) => {
                return Err(FsmError::InvalidInitialState {
                    state: state.to_string(),
                });
            }
            None => {
                return Err(FsmError::InvalidInitialState {
                    state: "<unset>".into(),
                });
            }
        };

        let mut transitions: HashMap<S, HashSet<S>> = HashMap::new();
        for (from, to) in &self.transitions {
            if !declared.contains(from) || !declared.contains(to) {
                return Err(FsmError::UndefinedStateInTransition {
                    from: from.to_string(),
                    to: to.to_string(),
                });
            }
            transitions
                .entry(from.clone())
                .or_default()
                .insert(to.clone());
        }
        for to in &self.any_targets {
            if !declared.contains(to) {
                return Err(FsmError::UndefinedStateInTransition {
                    from: "*".into(),
                    to: to.to_string(),
                });
            }
            for from in self.states.iter().filter(|s| *s != to) {
                transitions
                    .entry(from.clone())
                    .or_default()
                    .insert(to.clone());
            }
        }

        let mut on_enter: HashMap<S, Vec<Hook<C>>> = HashMap::new();
        for (state, hook) in self.on_enter {
            if !declared.contains(&state) {
                return Err(FsmError::UndefinedStateInHook {
                    kind: "entry",
                    state: state.to_string(),
                });
            }
            on_enter.entry(state).or_default().push(hook);
        }

        let mut on_exit: HashMap<S, Vec<Hook<C>>> = HashMap::new();
        for (state, hook) in self.on_exit {
            if !declared.contains(&state) {
                return Err(FsmError::UndefinedStateInHook {
                    kind: "exit",
                    state: state.to_string(),
                });
            }
            on_exit.entry(state).or_default().push(hook);
        }

        let mut guards: HashMap<(S, S), Vec<Guard<S, C>>> = HashMap::new();
        for (from, to, guard) in self.guards {
            if !declared.contains(&from) || !declared.contains(&to) {
                return Err(FsmError::UndefinedStateInTransition {
                    from: from.to_string(),
                    to: to.to_string(),
                });
            }
            guards.entry((from, to)).or_default().push(guard);
        }

        Ok(Arc::new(MachineDefinition {
            id: self.id,
            states: self.states,
            transitions,
            initial,
            on_enter,
            on_exit,
            guards,
            persistence: self.persistence,
            observers: self.observers,
        }))
    }

    /// Builds a machine guarded by a blocking mutex.
    pub fn build(self, data: C) -> Result<Machine<S, C>, FsmError> {
        Ok(Machine::new(self.definition()?, data, None))
    }

    /// Builds a machine guarded by an async-aware mutex.
    pub fn build_async(self, data: C) -> Result<AsyncMachine<S, C>, FsmError> {
        Ok(AsyncMachine::new(self.definition()?, data))
    }
}
