//! Creation task state machine transitions.
//!
//! Validates and executes status transitions for `creation_tasks` rows,
//! enforcing the allowed transition graph, optimistic locking and timestamp
//! management.

use anyhow::{bail, Context, Result};
use chrono::Utc;
use sqlx::PgPool;
use uuid::Uuid;

use appforge_db::models::CreationStatus;
use appforge_db::queries::creation_tasks as db;

/// The creation task state machine.
///
/// Enforces the valid transition graph:
///
/// ```text
/// pending -> running
/// pending -> failed       (rejected before any phase ran)
/// running -> committed
/// running -> rolled_back
/// running -> failed       (rollback incomplete)
/// ```
///
/// Terminal rows are never rewritten.
pub struct CreationStateMachine;

impl CreationStateMachine {
    pub fn is_valid_transition(from: CreationStatus, to: CreationStatus) -> bool {
        matches!(
            (from, to),
            (CreationStatus::Pending, CreationStatus::Running)
                | (CreationStatus::Pending, CreationStatus::Failed)
                | (CreationStatus::Running, CreationStatus::Committed)
                | (CreationStatus::Running, CreationStatus::RolledBack)
                | (CreationStatus::Running, CreationStatus::Failed)
        )
    }

    /// Execute a transition with optimistic locking.
    ///
    /// - Sets `started_at` on `pending -> running`.
    /// - Sets `completed_at` on every transition into a terminal status.
    /// - Records `error` when given.
    ///
    /// Fails if the edge is not in the graph, the task does not exist, or
    /// its current status is not `from`.
    pub async fn transition(
        pool: &PgPool,
        task_id: Uuid,
        from: CreationStatus,
        to: CreationStatus,
        error: Option<&str>,
    ) -> Result<()> {
        if !Self::is_valid_transition(from, to) {
            bail!("invalid state transition: {from} -> {to} for creation task {task_id}");
        }

        let now = Utc::now();
        let started_at = (to == CreationStatus::Running).then_some(now);
        let completed_at = to.is_terminal().then_some(now);

        let rows = db::transition_creation_status(
            pool,
            task_id,
            from,
            to,
            started_at,
            completed_at,
            error,
        )
        .await
        .with_context(|| format!("failed to transition creation task {task_id} from {from} to {to}"))?;

        if rows == 0 {
            match db::get_creation_task(pool, task_id).await? {
                None => bail!("creation task {task_id} not found"),
                Some(t) => bail!(
                    "optimistic lock failed: creation task {task_id} has status {}, expected {from}",
                    t.status
                ),
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use CreationStatus::*;

    const ALL: [CreationStatus; 5] = [Pending, Running, Committed, RolledBack, Failed];

    #[test]
    fn forward_edges_are_valid() {
        assert!(CreationStateMachine::is_valid_transition(Pending, Running));
        assert!(CreationStateMachine::is_valid_transition(Pending, Failed));
        assert!(CreationStateMachine::is_valid_transition(Running, Committed));
        assert!(CreationStateMachine::is_valid_transition(Running, RolledBack));
        assert!(CreationStateMachine::is_valid_transition(Running, Failed));
    }

    #[test]
    fn terminal_states_have_no_outgoing_edges() {
        for from in ALL.into_iter().filter(|s| s.is_terminal()) {
            for to in ALL {
                assert!(
                    !CreationStateMachine::is_valid_transition(from, to),
                    "{from} -> {to} should be rejected"
                );
            }
        }
    }

    #[test]
    fn pending_cannot_skip_to_success() {
        assert!(!CreationStateMachine::is_valid_transition(Pending, Committed));
        assert!(!CreationStateMachine::is_valid_transition(Pending, RolledBack));
        assert!(!CreationStateMachine::is_valid_transition(Running, Pending));
    }
}
