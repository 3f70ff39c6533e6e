/// Operation metadata persistence
///
/// The metadata row is written exactly once, together with the operation's
/// initial step state, and is read on every step to resolve the owner.
use sdk::errors::EngineError;
use sdk::state::StepState;
use sdk::step::OperationMetadata;
use sqlx::{Row, SqlitePool};

use super::{db_error, from_millis};

/// Operation metadata repository
#[derive(Clone)]
pub struct OperationRepository {
    pool: SqlitePool,
}

impl OperationRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert the metadata row and the initial state in one transaction
    ///
    /// Fails with `OperationExists` if the id is already taken.
    pub async fn create(
        &self,
        metadata: &OperationMetadata,
        initial: &StepState,
    ) -> Result<(), EngineError> {
        let state_json = serde_json::to_string(initial)?;
        let created_at = metadata.created_at.timestamp_millis();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(db_error("Failed to begin transaction"))?;

        let inserted = sqlx::query(
            "INSERT INTO operations (id, owner_user_id, created_at) VALUES (?, ?, ?)",
        )
        .bind(&metadata.operation_id)
        .bind(&metadata.owner_user_id)
        .bind(created_at)
        .execute(&mut *tx)
        .await;

        if let Err(e) = inserted {
            let duplicate = e
                .as_database_error()
                .map(|d| d.is_unique_violation())
                .unwrap_or(false);
            if duplicate {
                return Err(EngineError::OperationExists(metadata.operation_id.clone()));
            }
            return Err(db_error("Failed to create operation")(e));
        }

        sqlx::query(
            "INSERT INTO step_states (operation_id, step_count, status, state, updated_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&initial.operation_id)
        .bind(initial.step_count as i64)
        .bind(initial.status.kind().as_str())
        .bind(state_json)
        .bind(created_at)
        .execute(&mut *tx)
        .await
        .map_err(db_error("Failed to store initial state"))?;

        tx.commit()
            .await
            .map_err(db_error("Failed to commit operation"))?;

        Ok(())
    }

    /// Get metadata by operation id
    pub async fn get(&self, operation_id: &str) -> Result<Option<OperationMetadata>, EngineError> {
        let row = sqlx::query("SELECT id, owner_user_id, created_at FROM operations WHERE id = ?")
            .bind(operation_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error("Failed to fetch operation"))?;

        Ok(row.map(|r| OperationMetadata {
            operation_id: r.get("id"),
            owner_user_id: r.get("owner_user_id"),
            created_at: from_millis(r.get("created_at")),
        }))
    }

    /// List operations owned by a user, newest first
    pub async fn list_by_owner(
        &self,
        owner_user_id: &str,
    ) -> Result<Vec<OperationMetadata>, EngineError> {
        let rows = sqlx::query(
            "SELECT id, owner_user_id, created_at FROM operations
             WHERE owner_user_id = ? ORDER BY created_at DESC",
        )
        .bind(owner_user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("Failed to list operations"))?;

        Ok(rows
            .into_iter()
            .map(|r| OperationMetadata {
                operation_id: r.get("id"),
                owner_user_id: r.get("owner_user_id"),
                created_at: from_millis(r.get("created_at")),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use tempfile::TempDir;

    fn metadata(id: &str, owner: &str) -> OperationMetadata {
        OperationMetadata {
            operation_id: id.to_string(),
            owner_user_id: owner.to_string(),
            created_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let temp_dir = TempDir::new().unwrap();
        let db = Database::new(&temp_dir.path().join("test.db")).await.unwrap();
        let repo = db.operations();

        let meta = metadata("op-1", "user-1");
        repo.create(&meta, &StepState::new("op-1", vec![])).await.unwrap();

        let fetched = repo.get("op-1").await.unwrap().unwrap();
        assert_eq!(fetched.owner_user_id, "user-1");
        assert_eq!(
            fetched.created_at.timestamp_millis(),
            meta.created_at.timestamp_millis()
        );

        assert!(repo.get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_create_is_write_once() {
        let temp_dir = TempDir::new().unwrap();
        let db = Database::new(&temp_dir.path().join("test.db")).await.unwrap();
        let repo = db.operations();

        repo.create(&metadata("op-1", "user-1"), &StepState::new("op-1", vec![]))
            .await
            .unwrap();
        let err = repo
            .create(&metadata("op-1", "user-2"), &StepState::new("op-1", vec![]))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::OperationExists(_)));

        let fetched = repo.get("op-1").await.unwrap().unwrap();
        assert_eq!(fetched.owner_user_id, "user-1");
    }

    #[tokio::test]
    async fn test_list_by_owner() {
        let temp_dir = TempDir::new().unwrap();
        let db = Database::new(&temp_dir.path().join("test.db")).await.unwrap();
        let repo = db.operations();

        for (id, owner) in [("a", "u1"), ("b", "u2"), ("c", "u1")] {
            repo.create(&metadata(id, owner), &StepState::new(id, vec![]))
                .await
                .unwrap();
        }

        let owned = repo.list_by_owner("u1").await.unwrap();
        assert_eq!(owned.len(), 2);
        assert!(owned.iter().all(|m| m.owner_user_id == "u1"));
    }
}
