//! Error taxonomy for phases and for the terminal result of a creation task.

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use appforge_db::models::CreationStatus;

use crate::lock::TargetKey;
use crate::request::RequestError;
use crate::saga::PhaseKind;

/// Coarse classification of a [`PhaseError`], recorded in log payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    TransientIo,
    Timeout,
    Cancelled,
    Internal,
}

/// Why a single phase failed.
#[derive(Debug, Error)]
pub enum PhaseError {
    /// Rejected before any side effect of this phase (duplicate ids, an
    /// existing target directory, a missing template).
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{context}: {cause:#}")]
    Database {
        context: String,
        cause: anyhow::Error,
    },

    #[error("{operation} timed out after {}ms", .after.as_millis())]
    Timeout { operation: String, after: Duration },

    #[error("cancelled before the {0} phase started")]
    Cancelled(PhaseKind),

    /// An earlier phase did not hand over an artifact this phase needs.
    #[error("missing artifact from an earlier phase: {0}")]
    MissingArtifact(&'static str),
}

impl PhaseError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::Io { .. } | Self::Database { .. } => ErrorKind::TransientIo,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Cancelled(_) => ErrorKind::Cancelled,
            Self::MissingArtifact(_) => ErrorKind::Internal,
        }
    }

    /// Whether resubmitting the same request may succeed. Never acted on
    /// inside the core; it is surfaced to the caller.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::TransientIo | ErrorKind::Timeout)
    }
}

/// A compensation that could not undo its step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompensationFailure {
    pub description: String,
    pub error: String,
}

/// The single terminal error a caller receives for a creation task.
#[derive(Debug, Error)]
pub enum CreationError {
    #[error("invalid request: {0}")]
    InvalidRequest(#[from] RequestError),

    /// Another task holds the target; nothing was touched.
    #[error("task in progress: another creation is already running for {target}")]
    InProgress { target: TargetKey },

    /// A phase failed and every registered compensation succeeded.
    #[error("{phase} phase failed: {cause}; rolled back")]
    RolledBack { phase: PhaseKind, cause: PhaseError },

    /// A phase failed and at least one compensation failed too. Leftover
    /// rows or files need manual cleanup.
    #[error(
        "{phase} phase failed: {cause}; rollback incomplete ({} compensation(s) failed), manual cleanup required",
        .failures.len()
    )]
    RollbackIncomplete {
        phase: PhaseKind,
        cause: PhaseError,
        failures: Vec<CompensationFailure>,
    },

    /// The creation task row could not be recorded before any phase ran.
    #[error("task bookkeeping failed: {0:#}")]
    Bookkeeping(anyhow::Error),
}

impl CreationError {
    /// The phase that failed, if the task got as far as running phases.
    pub fn phase(&self) -> Option<PhaseKind> {
        match self {
            Self::RolledBack { phase, .. } | Self::RollbackIncomplete { phase, .. } => Some(*phase),
            _ => None,
        }
    }

    /// The terminal status recorded for the task, if it ran.
    pub fn terminal_status(&self) -> Option<CreationStatus> {
        match self {
            Self::RolledBack { .. } => Some(CreationStatus::RolledBack),
            Self::RollbackIncomplete { .. } => Some(CreationStatus::Failed),
            _ => None,
        }
    }

    /// `Some(true)` when every compensation ran cleanly, `Some(false)` when
    /// manual cleanup is needed, `None` when nothing needed compensating.
    pub fn rollback_complete(&self) -> Option<bool> {
        match self {
            Self::RolledBack { .. } => Some(true),
            Self::RollbackIncomplete { .. } => Some(false),
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Self::InProgress { .. } => true,
            Self::RolledBack { cause, .. } => cause.is_retryable(),
            _ => false,
        }
    }
}
