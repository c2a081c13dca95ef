//! The `Phase` trait and the values passed between phases.

use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Value, json};
use uuid::Uuid;

use appforge_db::models::LogLevel;

use super::compensation::Compensation;
use crate::error::PhaseError;
use crate::progress::{TaskLog, events};
use crate::request::CreateNovelAppRequest;

/// The three phases of a creation, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseKind {
    Database,
    LocalFile,
    ResourceFile,
}

impl PhaseKind {
    /// Fixed execution order.
    pub const ORDER: [PhaseKind; 3] = [
        PhaseKind::Database,
        PhaseKind::LocalFile,
        PhaseKind::ResourceFile,
    ];

    /// 1-based position, as stored in `creation_tasks.current_phase`.
    pub fn index(self) -> i32 {
        match self {
            Self::Database => 1,
            Self::LocalFile => 2,
            Self::ResourceFile => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Database => "database",
            Self::LocalFile => "local_file",
            Self::ResourceFile => "resource_file",
        }
    }
}

impl fmt::Display for PhaseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Values produced by earlier phases for later ones.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Artifacts {
    pub app_id: Option<Uuid>,
    pub app_key: Option<String>,
    pub target_dir: Option<PathBuf>,
}

impl Artifacts {
    /// Overlay every value `other` sets.
    pub fn merge(&mut self, other: Artifacts) {
        if other.app_id.is_some() {
            self.app_id = other.app_id;
        }
        if other.app_key.is_some() {
            self.app_key = other.app_key;
        }
        if other.target_dir.is_some() {
            self.target_dir = other.target_dir;
        }
    }

    pub fn require_app_id(&self) -> Result<Uuid, PhaseError> {
        self.app_id.ok_or(PhaseError::MissingArtifact("app_id"))
    }

    pub fn require_app_key(&self) -> Result<&str, PhaseError> {
        self.app_key
            .as_deref()
            .ok_or(PhaseError::MissingArtifact("app_key"))
    }

    pub fn require_target_dir(&self) -> Result<&Path, PhaseError> {
        self.target_dir
            .as_deref()
            .ok_or(PhaseError::MissingArtifact("target_dir"))
    }
}

/// Everything a phase may read. Passed explicitly; there is no ambient
/// task context.
pub struct PhaseContext<'a> {
    pub task_id: Uuid,
    pub request: &'a CreateNovelAppRequest,
    pub artifacts: &'a Artifacts,
    pub log: &'a TaskLog,
}

impl PhaseContext<'_> {
    /// Record an intermediate step of a phase in the task log.
    pub async fn progress(&self, phase: PhaseKind, message: impl Into<String>, detail: Value) {
        self.log
            .append(
                self.task_id,
                LogLevel::Info,
                message,
                json!({ "event": events::PHASE_PROGRESS, "phase": phase, "detail": detail }),
            )
            .await;
    }
}

/// A successful phase: artifacts for later phases plus the compensations
/// that undo its forward work.
#[derive(Default)]
pub struct PhaseOutput {
    pub artifacts: Artifacts,
    pub compensations: Vec<Box<dyn Compensation>>,
}

impl PhaseOutput {
    pub fn new(artifacts: Artifacts) -> Self {
        Self {
            artifacts,
            compensations: Vec::new(),
        }
    }

    pub fn with_compensation(mut self, compensation: impl Compensation + 'static) -> Self {
        self.compensations.push(Box::new(compensation));
        self
    }
}

impl fmt::Debug for PhaseOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PhaseOutput")
            .field("artifacts", &self.artifacts)
            .field(
                "compensations",
                &self
                    .compensations
                    .iter()
                    .map(|c| c.describe())
                    .collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// A failed phase: the error plus compensations for whatever it created
/// before failing. The orchestrator pushes them before unwinding, so the
/// sweep is the one place partial output is removed and reported.
pub struct PhaseFailure {
    pub error: PhaseError,
    pub compensations: Vec<Box<dyn Compensation>>,
}

impl PhaseFailure {
    pub fn with_compensation(mut self, compensation: impl Compensation + 'static) -> Self {
        self.compensations.push(Box::new(compensation));
        self
    }
}

impl From<PhaseError> for PhaseFailure {
    fn from(error: PhaseError) -> Self {
        Self {
            error,
            compensations: Vec::new(),
        }
    }
}

impl fmt::Debug for PhaseFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PhaseFailure")
            .field("error", &self.error)
            .field(
                "compensations",
                &self
                    .compensations
                    .iter()
                    .map(|c| c.describe())
                    .collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// One step of the creation pipeline.
///
/// `apply` either succeeds, returning what it registered, or fails
/// returning compensations for anything it left behind.
#[async_trait]
pub trait Phase: Send + Sync {
    fn kind(&self) -> PhaseKind;

    async fn apply(&self, ctx: &PhaseContext<'_>) -> Result<PhaseOutput, PhaseFailure>;
}

const _: () = {
    fn _assert_object_safe(_: &dyn Phase) {}
};
