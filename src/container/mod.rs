//! Workspace containers: lifecycle, concurrency, idle eviction, and
//! reconciliation with the runtime's view.

pub mod guard;
pub mod idle;
pub mod manager;
pub mod reconcile;
pub mod spec;

pub use manager::{ContainerManager, SandboxExecutor};
