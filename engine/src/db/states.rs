/// Step state persistence
///
/// One row per operation holds the serialized `StepState`. The `step_count`
/// column doubles as an optimistic-concurrency token: a step commits only if
/// the row still carries the step count the step started from. The commit
/// and its history row land in one transaction, so a step either fully
/// commits or leaves no trace.
use sdk::errors::EngineError;
use sdk::operations::StepHistoryEntry;
use sdk::state::{OperationStatus, StatusKind, StepContext, StepState};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use super::{db_error, from_millis, now_millis};

/// A loaded state row
#[derive(Debug, Clone)]
pub struct StoredState {
    pub state: StepState,
    /// Context of a continuation that was committed but not yet handed to
    /// the scheduler
    pub pending_continuation: Option<StepContext>,
}

/// History row written alongside a committed step
#[derive(Debug, Clone)]
pub struct HistoryRecord {
    pub step_index: u64,
    pub cost_delta: f64,
    pub execution_time_ms: u64,
    pub summary: String,
}

/// Step state repository
#[derive(Clone)]
pub struct StateRepository {
    pool: SqlitePool,
}

impl StateRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Load the current state of an operation
    pub async fn load(&self, operation_id: &str) -> Result<Option<StoredState>, EngineError> {
        let row = sqlx::query(
            "SELECT state, continuation_pending, next_context FROM step_states
             WHERE operation_id = ?",
        )
        .bind(operation_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("Failed to fetch step state"))?;

        row.map(|r| decode_row(operation_id, &r)).transpose()
    }

    /// Commit one executed step
    ///
    /// Replaces the state only if the stored step count still equals
    /// `expected_step_count` and the operation was not cancelled meanwhile.
    /// `continuation` is kept on the row until `mark_continuation_scheduled`
    /// clears it.
    ///
    /// # Errors
    ///
    /// Returns `StateConflict` when another delivery committed first.
    pub async fn commit_step(
        &self,
        expected_step_count: u64,
        state: &StepState,
        continuation: Option<&StepContext>,
        history: &HistoryRecord,
    ) -> Result<(), EngineError> {
        let state_json = serde_json::to_string(state)?;
        let context_json = continuation.map(serde_json::to_string).transpose()?;
        let now = now_millis();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(db_error("Failed to begin transaction"))?;

        let updated = sqlx::query(
            "UPDATE step_states
             SET step_count = ?, status = ?, state = ?, continuation_pending = ?,
                 next_context = ?, updated_at = ?
             WHERE operation_id = ? AND step_count = ? AND status != 'cancelled'",
        )
        .bind(state.step_count as i64)
        .bind(state.status.kind().as_str())
        .bind(state_json)
        .bind(context_json.is_some())
        .bind(context_json)
        .bind(now)
        .bind(&state.operation_id)
        .bind(expected_step_count as i64)
        .execute(&mut *tx)
        .await
        .map_err(db_error("Failed to commit step state"))?;

        if updated.rows_affected() == 0 {
            tx.rollback()
                .await
                .map_err(db_error("Failed to roll back step"))?;
            return Err(EngineError::StateConflict {
                id: state.operation_id.clone(),
                expected: expected_step_count,
            });
        }

        sqlx::query(
            "INSERT INTO step_history
             (operation_id, step_index, status, cost_delta, total_cost, execution_time_ms, summary, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&state.operation_id)
        .bind(history.step_index as i64)
        .bind(state.status.kind().as_str())
        .bind(history.cost_delta)
        .bind(state.cost.total)
        .bind(history.execution_time_ms as i64)
        .bind(&history.summary)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(db_error("Failed to record step history"))?;

        tx.commit()
            .await
            .map_err(db_error("Failed to commit step"))?;

        Ok(())
    }

    /// Clear the pending continuation once the scheduler accepted it
    pub async fn mark_continuation_scheduled(
        &self,
        operation_id: &str,
        step_count: u64,
    ) -> Result<(), EngineError> {
        sqlx::query(
            "UPDATE step_states SET continuation_pending = 0, next_context = NULL
             WHERE operation_id = ? AND step_count = ?",
        )
        .bind(operation_id)
        .bind(step_count as i64)
        .execute(&self.pool)
        .await
        .map_err(db_error("Failed to clear continuation"))?;

        Ok(())
    }

    /// Overwrite the status without executing a step
    ///
    /// Used for cancellation. Returns the state as it was before, or `None`
    /// for unknown operations. The step count is left alone, so any step
    /// already in flight loses its commit.
    pub async fn force_status(
        &self,
        operation_id: &str,
        status: OperationStatus,
    ) -> Result<Option<StepState>, EngineError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(db_error("Failed to begin transaction"))?;

        let row = sqlx::query(
            "SELECT state, continuation_pending, next_context FROM step_states
             WHERE operation_id = ?",
        )
        .bind(operation_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_error("Failed to fetch step state"))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let previous = decode_row(operation_id, &row)?.state;

        let mut state = previous.clone();
        state.status = status;
        state.touch();

        sqlx::query(
            "UPDATE step_states
             SET status = ?, state = ?, continuation_pending = 0, next_context = NULL, updated_at = ?
             WHERE operation_id = ?",
        )
        .bind(state.status.kind().as_str())
        .bind(serde_json::to_string(&state)?)
        .bind(now_millis())
        .bind(operation_id)
        .execute(&mut *tx)
        .await
        .map_err(db_error("Failed to update status"))?;

        tx.commit()
            .await
            .map_err(db_error("Failed to commit status change"))?;

        Ok(Some(previous))
    }

    /// States currently running or waiting for a human
    pub async fn list_active(&self) -> Result<Vec<StepState>, EngineError> {
        self.list_where(
            "SELECT s.operation_id, s.state, s.continuation_pending, s.next_context
             FROM step_states s
             WHERE s.status IN ('running', 'waiting_for_human')
             ORDER BY s.updated_at DESC",
            None,
        )
        .await
    }

    /// States waiting for a human, optionally restricted to one owner
    pub async fn list_waiting(
        &self,
        owner_user_id: Option<&str>,
    ) -> Result<Vec<StepState>, EngineError> {
        match owner_user_id {
            Some(owner) => {
                self.list_where(
                    "SELECT s.operation_id, s.state, s.continuation_pending, s.next_context
                     FROM step_states s JOIN operations o ON o.id = s.operation_id
                     WHERE s.status = 'waiting_for_human' AND o.owner_user_id = ?
                     ORDER BY s.updated_at DESC",
                    Some(owner),
                )
                .await
            }
            None => {
                self.list_where(
                    "SELECT s.operation_id, s.state, s.continuation_pending, s.next_context
                     FROM step_states s
                     WHERE s.status = 'waiting_for_human'
                     ORDER BY s.updated_at DESC",
                    None,
                )
                .await
            }
        }
    }

    async fn list_where(
        &self,
        sql: &'static str,
        bind: Option<&str>,
    ) -> Result<Vec<StepState>, EngineError> {
        let mut query = sqlx::query(sql);
        if let Some(value) = bind {
            query = query.bind(value);
        }

        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(db_error("Failed to list step states"))?;

        rows.iter()
            .map(|r| {
                let operation_id: String = r.get("operation_id");
                decode_row(&operation_id, r).map(|stored| stored.state)
            })
            .collect()
    }

    /// Most recent `limit` history entries, oldest first
    pub async fn history(
        &self,
        operation_id: &str,
        limit: u32,
    ) -> Result<Vec<StepHistoryEntry>, EngineError> {
        let rows = sqlx::query(
            "SELECT step_index, status, cost_delta, total_cost, execution_time_ms, summary, created_at
             FROM step_history WHERE operation_id = ?
             ORDER BY step_index DESC LIMIT ?",
        )
        .bind(operation_id)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("Failed to fetch step history"))?;

        let mut entries = rows
            .into_iter()
            .map(|r| {
                let status: String = r.get("status");
                let step_index: i64 = r.get("step_index");
                let execution_time_ms: i64 = r.get("execution_time_ms");
                Ok(StepHistoryEntry {
                    step_index: step_index as u64,
                    status: StatusKind::parse(&status).ok_or_else(|| {
                        EngineError::CorruptState(format!("unknown status '{}'", status))
                    })?,
                    cost_delta: r.get("cost_delta"),
                    total_cost: r.get("total_cost"),
                    execution_time_ms: execution_time_ms as u64,
                    summary: r.get("summary"),
                    created_at: from_millis(r.get("created_at")),
                })
            })
            .collect::<Result<Vec<_>, EngineError>>()?;

        entries.reverse();
        Ok(entries)
    }
}

fn decode_row(operation_id: &str, row: &SqliteRow) -> Result<StoredState, EngineError> {
    let state_json: String = row.get("state");
    let state: StepState = serde_json::from_str(&state_json)
        .map_err(|e| EngineError::CorruptState(format!("{}: {}", operation_id, e)))?;

    let pending = row.get::<i64, _>("continuation_pending") != 0;
    let context_json: Option<String> = row.get("next_context");
    let pending_continuation = match (pending, context_json) {
        (true, Some(json)) => Some(
            serde_json::from_str(&json)
                .map_err(|e| EngineError::CorruptState(format!("{}: {}", operation_id, e)))?,
        ),
        _ => None,
    };

    Ok(StoredState {
        state,
        pending_continuation,
    })
}
