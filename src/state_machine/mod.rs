mod audit;
mod definition;
mod hierarchy;
mod hooks;
mod machine;

pub use audit::{AuditEntry, CommandHistory};
pub use definition::{MachineBuilder, MachineDefinition, StateId};
pub use hierarchy::{ChildReport, Children, ParentHandle, SubMachine};
pub use hooks::{
    BroadcastObserver, Guard, Hook, InMemorySnapshotStore, Snapshot, SnapshotStore,
    TransitionObserver,
};
pub use machine::{AsyncMachine, Machine, MachineContext, MachineView};
