//! Saga building blocks: the phase capability and the compensation stack.
//!
//! A phase performs forward work and hands back the compensations that
//! undo it, whether it succeeded or failed partway. Phases never run their
//! own compensations; the orchestrator owns
//! one [`CompensationStack`] for the whole task and unwinds it LIFO on the
//! first failure.

pub mod compensation;
pub mod phase;

pub use compensation::{
    Compensation, CompensationStack, DeleteAppRecords, RemoveDirectory, RemoveResourceFiles,
    RollbackReport,
};
pub use phase::{Artifacts, Phase, PhaseContext, PhaseFailure, PhaseKind, PhaseOutput};
