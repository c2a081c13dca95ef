//! Creation orchestrator: runs the three phases in order against one
//! compensation stack and resolves the terminal task status.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use serde_json::json;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use appforge_db::models::{CreationStatus, LogLevel};
use appforge_db::queries::creation_tasks as task_db;

use crate::error::{CreationError, PhaseError};
use crate::lock::{TargetKey, TargetLocks};
use crate::phases::{DatabasePhase, FileLayout, LocalFilePhase, ResourceFilePhase};
use crate::progress::{TaskLog, events};
use crate::request::CreateNovelAppRequest;
use crate::saga::{Artifacts, CompensationStack, Phase, PhaseContext, PhaseKind};
use crate::state::CreationStateMachine;

/// Time bounds applied to phases and compensations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseLimits {
    /// Server-side `statement_timeout` for the database phase.
    pub statement_timeout: Duration,
    /// Bound on each individual filesystem operation.
    pub fs_op_timeout: Duration,
    /// Bound on each compensation during rollback.
    pub compensation_timeout: Duration,
}

impl Default for PhaseLimits {
    fn default() -> Self {
        Self {
            statement_timeout: Duration::from_secs(30),
            fs_op_timeout: Duration::from_secs(30),
            compensation_timeout: Duration::from_secs(60),
        }
    }
}

/// The phases of a creation, in their fixed order.
pub struct Pipeline {
    phases: [Arc<dyn Phase>; 3],
}

impl Pipeline {
    /// Assemble a pipeline, checking each phase sits in its slot.
    pub fn new(
        database: Arc<dyn Phase>,
        local_file: Arc<dyn Phase>,
        resource_file: Arc<dyn Phase>,
    ) -> Result<Self> {
        let phases = [database, local_file, resource_file];
        for (phase, expected) in phases.iter().zip(PhaseKind::ORDER) {
            if phase.kind() != expected {
                bail!(
                    "pipeline slot for the {expected} phase holds a {} phase",
                    phase.kind()
                );
            }
        }
        Ok(Self { phases })
    }

    /// The production pipeline over PostgreSQL and the local filesystem.
    pub fn standard(pool: PgPool, layout: FileLayout, limits: &PhaseLimits) -> Self {
        let database: Arc<dyn Phase> =
            Arc::new(DatabasePhase::new(pool, limits.statement_timeout));
        let local_file: Arc<dyn Phase> =
            Arc::new(LocalFilePhase::new(layout.clone(), limits.fs_op_timeout));
        let resource_file: Arc<dyn Phase> =
            Arc::new(ResourceFilePhase::new(layout, limits.fs_op_timeout));
        Self {
            phases: [database, local_file, resource_file],
        }
    }

    pub fn phases(&self) -> &[Arc<dyn Phase>] {
        &self.phases
    }
}

/// A committed creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedApp {
    pub task_id: Uuid,
    pub artifacts: Artifacts,
}

impl CreatedApp {
    pub fn app_id(&self) -> Option<Uuid> {
        self.artifacts.app_id
    }

    pub fn target_dir(&self) -> Option<&Path> {
        self.artifacts.target_dir.as_deref()
    }
}

/// Runs creation tasks. Cheap to clone; clones share the lock map and the
/// task log.
#[derive(Clone)]
pub struct Orchestrator {
    pool: PgPool,
    pipeline: Arc<Pipeline>,
    log: TaskLog,
    locks: TargetLocks,
    compensation_timeout: Duration,
}

impl Orchestrator {
    pub fn new(pool: PgPool, pipeline: Pipeline, log: TaskLog, limits: &PhaseLimits) -> Self {
        Self {
            pool,
            pipeline: Arc::new(pipeline),
            log,
            locks: TargetLocks::new(),
            compensation_timeout: limits.compensation_timeout,
        }
    }

    pub fn log(&self) -> &TaskLog {
        &self.log
    }

    pub fn locks(&self) -> &TargetLocks {
        &self.locks
    }

    /// Create one application.
    ///
    /// Rejects invalid requests and requests whose target is already being
    /// created before any side effect. Otherwise records the task, runs the
    /// phases in order, and on the first failure unwinds every registered
    /// compensation newest first. Cancellation is observed between phases.
    pub async fn run(
        &self,
        task_id: Uuid,
        request: &CreateNovelAppRequest,
        cancel: &CancellationToken,
    ) -> Result<CreatedApp, CreationError> {
        if let Err(e) = request.validate() {
            tracing::warn!(task_id = %task_id, error = %e, "rejected invalid creation request");
            return Err(e.into());
        }

        let target = TargetKey::for_request(request);
        let Some(_guard) = self.locks.try_acquire(target.clone()) else {
            tracing::warn!(task_id = %task_id, target = %target, "creation already in progress");
            return Err(CreationError::InProgress { target });
        };

        self.begin(task_id, request, &target).await?;

        let mut stack = CompensationStack::new();
        let mut artifacts = Artifacts::default();

        for phase in self.pipeline.phases() {
            let kind = phase.kind();
            if cancel.is_cancelled() {
                return Err(self
                    .roll_back(task_id, kind, PhaseError::Cancelled(kind), stack)
                    .await);
            }

            if let Err(e) = task_db::set_current_phase(&self.pool, task_id, kind.index()).await {
                tracing::warn!(task_id = %task_id, phase = %kind, error = %format!("{e:#}"), "failed to record current phase");
            }
            self.log
                .append(
                    task_id,
                    LogLevel::Info,
                    format!("{kind} phase started"),
                    json!({ "event": events::PHASE_STARTED, "phase": kind, "index": kind.index() }),
                )
                .await;

            let ctx = PhaseContext {
                task_id,
                request,
                artifacts: &artifacts,
                log: &self.log,
            };
            let output = match phase.apply(&ctx).await {
                Ok(output) => output,
                Err(failure) => {
                    // Partial output of the failed phase unwinds first.
                    stack.extend(failure.compensations);
                    return Err(self.roll_back(task_id, kind, failure.error, stack).await);
                }
            };

            let registered = output.compensations.len();
            stack.extend(output.compensations);
            artifacts.merge(output.artifacts);

            if let (PhaseKind::Database, Some(app_id)) = (kind, artifacts.app_id) {
                if let Err(e) = task_db::set_app_id(&self.pool, task_id, app_id).await {
                    tracing::warn!(task_id = %task_id, error = %format!("{e:#}"), "failed to record app id");
                }
            }

            tracing::info!(task_id = %task_id, phase = %kind, registered, "phase succeeded");
            self.log
                .append(
                    task_id,
                    LogLevel::Info,
                    format!("{kind} phase succeeded"),
                    json!({
                        "event": events::PHASE_SUCCEEDED,
                        "phase": kind,
                        "compensations": registered,
                    }),
                )
                .await;
        }

        stack.clear();
        self.log
            .append(
                task_id,
                LogLevel::Info,
                "creation committed",
                json!({
                    "event": events::TASK_COMMITTED,
                    "app_id": artifacts.app_id,
                    "target_dir": artifacts.target_dir.as_ref().map(|p| p.display().to_string()),
                }),
            )
            .await;
        self.finalize(task_id, CreationStatus::Committed, None).await;
        self.log.finish(task_id);
        tracing::info!(task_id = %task_id, target = %target, "creation committed");

        Ok(CreatedApp { task_id, artifacts })
    }

    /// Record the task row and move it to `running`.
    async fn begin(
        &self,
        task_id: Uuid,
        request: &CreateNovelAppRequest,
        target: &TargetKey,
    ) -> Result<(), CreationError> {
        let snapshot = serde_json::to_value(request)
            .map_err(|e| CreationError::Bookkeeping(anyhow::Error::new(e)))?;

        task_db::insert_creation_task(
            &self.pool,
            task_id,
            &request.user_id,
            &request.base_config.app_name,
            &snapshot,
        )
        .await
        .map_err(CreationError::Bookkeeping)?;

        self.log
            .append(
                task_id,
                LogLevel::Info,
                format!("creation task recorded for {target}"),
                json!({ "event": events::TASK_CREATED, "target": target.to_string() }),
            )
            .await;

        if let Err(e) = CreationStateMachine::transition(
            &self.pool,
            task_id,
            CreationStatus::Pending,
            CreationStatus::Running,
            None,
        )
        .await
        {
            let reason = format!("{e:#}");
            if let Err(e2) = CreationStateMachine::transition(
                &self.pool,
                task_id,
                CreationStatus::Pending,
                CreationStatus::Failed,
                Some(&reason),
            )
            .await
            {
                tracing::error!(task_id = %task_id, error = %format!("{e2:#}"), "failed to mark task failed");
            }
            self.log.finish(task_id);
            return Err(CreationError::Bookkeeping(e));
        }

        self.log
            .append(
                task_id,
                LogLevel::Info,
                "creation started",
                json!({ "event": events::TASK_STARTED }),
            )
            .await;
        Ok(())
    }

    /// Unwind the stack after `phase` failed and resolve the terminal status.
    async fn roll_back(
        &self,
        task_id: Uuid,
        phase: PhaseKind,
        cause: PhaseError,
        mut stack: CompensationStack,
    ) -> CreationError {
        tracing::warn!(task_id = %task_id, phase = %phase, error = %cause, "phase failed, rolling back");
        self.log
            .append(
                task_id,
                LogLevel::Error,
                format!("{phase} phase failed: {cause}"),
                json!({
                    "event": events::PHASE_FAILED,
                    "phase": phase,
                    "error_kind": cause.kind(),
                    "error": cause.to_string(),
                    "retryable": cause.is_retryable(),
                }),
            )
            .await;

        self.log
            .append(
                task_id,
                LogLevel::Info,
                format!("rolling back {} step(s)", stack.len()),
                json!({
                    "event": events::ROLLBACK_STARTED,
                    "steps": stack.descriptions(),
                }),
            )
            .await;

        let report = stack
            .unwind(task_id, &self.log, self.compensation_timeout)
            .await;

        let error = if report.is_complete() {
            self.log
                .append(
                    task_id,
                    LogLevel::Info,
                    "rollback complete",
                    json!({
                        "event": events::ROLLBACK_COMPLETE,
                        "compensated": report.succeeded.len(),
                    }),
                )
                .await;
            CreationError::RolledBack { phase, cause }
        } else {
            self.log
                .append(
                    task_id,
                    LogLevel::Critical,
                    format!(
                        "rollback incomplete: {} of {} compensation(s) failed, manual cleanup required",
                        report.failures.len(),
                        report.attempted()
                    ),
                    json!({
                        "event": events::ROLLBACK_INCOMPLETE,
                        "failures": report.failures,
                    }),
                )
                .await;
            CreationError::RollbackIncomplete {
                phase,
                cause,
                failures: report.failures,
            }
        };

        if let Some(status) = error.terminal_status() {
            self.finalize(task_id, status, Some(&error.to_string())).await;
        }
        self.log.finish(task_id);
        error
    }

    /// Move a running task to its terminal status. A failure here is traced
    /// and not propagated: the outcome already happened.
    async fn finalize(&self, task_id: Uuid, status: CreationStatus, error: Option<&str>) {
        if let Err(e) = CreationStateMachine::transition(
            &self.pool,
            task_id,
            CreationStatus::Running,
            status,
            error,
        )
        .await
        {
            tracing::error!(
                task_id = %task_id,
                status = %status,
                error = %format!("{e:#}"),
                "failed to record terminal status"
            );
        }
    }
}
