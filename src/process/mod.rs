//! Subprocess tracking: supervisor, output monitor, hook dispatcher, and
//! the callback builder.

pub mod callback_builder;
pub mod hooks;
pub mod manager;
pub mod models;
pub mod monitor;

pub use hooks::{BranchSpawner, HookDispatcher};
pub use manager::{ProcessManager, SpawnRequest};
pub use models::{
    CallbackAction, ExitFilter, HookTrigger, ProcessCallback, ProcessKind, ProcessStatus,
    TrackedProcess,
};
pub use monitor::{OutputMonitor, StreamKind};
