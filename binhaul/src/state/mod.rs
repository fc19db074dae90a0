//! Durable transfer state: per-repository phase progress and run counters.

pub mod model;
pub mod store;

pub use model::{DiffDetails, PhaseKind, PhaseProgress, RepoState, RunState, TimeRange};
pub use store::{StateLock, TransferStateManager};
