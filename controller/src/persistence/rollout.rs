use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::error::{Error, Result};
use super::state::{FailedStage, RolloutStage, RolloutStatus};
use super::Persistence;

/// A coordinated transition from the current set of deployments to a new
/// desired set. The row *is* the state machine: `current_stage` is committed
/// on every transition so a restarted engine resumes exactly where the last
/// one stopped.
#[derive(Clone, Debug, PartialEq, sqlx::FromRow)]
pub struct Rollout {
    pub id: Uuid,
    pub service_id: Uuid,
    pub status: RolloutStatus,
    pub current_stage: RolloutStage,
    pub failed_stage: Option<FailedStage>,
    pub is_rolling_update: bool,
    pub cancel_requested: bool,
    pub stage_started_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Persistence {
    /// Creates an `in_progress` rollout. The caller must hold the service
    /// lock; this still refuses a second in-progress row as a backstop.
    pub async fn insert_rollout(&self, service_id: &Uuid) -> Result<Rollout> {
        let (in_progress,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM rollouts WHERE service_id = ? AND status = ?",
        )
        .bind(service_id)
        .bind(RolloutStatus::InProgress)
        .fetch_one(&self.pool)
        .await?;

        if in_progress > 0 {
            return Err(Error::Conflict("a rollout for this service is already in progress"));
        }

        let id = Uuid::new_v4();
        let now = Utc::now();

        sqlx::query(
            "INSERT INTO rollouts (id, service_id, status, current_stage, stage_started_at, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(id)
        .bind(service_id)
        .bind(RolloutStatus::InProgress)
        .bind(RolloutStage::Preparing)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.rollout(&id).await
    }

    pub async fn rollout(&self, id: &Uuid) -> Result<Rollout> {
        sqlx::query_as("SELECT * FROM rollouts WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(Error::NotFound("rollout"))
    }

    pub async fn rollouts_for_service(&self, service_id: &Uuid) -> Result<Vec<Rollout>> {
        sqlx::query_as(
            "SELECT * FROM rollouts WHERE service_id = ? ORDER BY created_at DESC, id",
        )
        .bind(service_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::from)
    }

    pub async fn in_progress_rollout(&self, service_id: &Uuid) -> Result<Option<Rollout>> {
        sqlx::query_as("SELECT * FROM rollouts WHERE service_id = ? AND status = ?")
            .bind(service_id)
            .bind(RolloutStatus::InProgress)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::from)
    }

    /// Every in-progress rollout in the store; the resume sweep re-enters
    /// these after a controller restart.
    pub async fn in_progress_rollouts(&self) -> Result<Vec<Rollout>> {
        sqlx::query_as("SELECT * FROM rollouts WHERE status = ? ORDER BY created_at, id")
            .bind(RolloutStatus::InProgress)
            .fetch_all(&self.pool)
            .await
            .map_err(Error::from)
    }

    /// Commits a stage transition. Refused once the rollout is terminal, so a
    /// stale engine cannot resurrect a finished rollout.
    pub async fn advance_rollout_stage(&self, id: &Uuid, stage: RolloutStage) -> Result<()> {
        let updated = sqlx::query(
            "UPDATE rollouts SET current_stage = ?, stage_started_at = ?
             WHERE id = ? AND status = ?",
        )
        .bind(stage)
        .bind(Utc::now())
        .bind(id)
        .bind(RolloutStatus::InProgress)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(Error::Conflict("rollout is no longer in progress"));
        }

        Ok(())
    }

    /// Terminal transition; immutable afterwards.
    pub async fn finish_rollout(
        &self,
        id: &Uuid,
        status: RolloutStatus,
        failed_stage: Option<FailedStage>,
    ) -> Result<()> {
        let stage = match status {
            RolloutStatus::Completed => RolloutStage::Completed,
            _ => RolloutStage::RolledBack,
        };

        let updated = sqlx::query(
            "UPDATE rollouts
             SET status = ?, current_stage = ?, failed_stage = ?, completed_at = ?
             WHERE id = ? AND status = ?",
        )
        .bind(status)
        .bind(stage)
        .bind(failed_stage)
        .bind(Utc::now())
        .bind(id)
        .bind(RolloutStatus::InProgress)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(Error::Conflict("rollout already finished"));
        }

        Ok(())
    }

    pub async fn set_rollout_rolling_update(&self, id: &Uuid, rolling: bool) -> Result<()> {
        sqlx::query("UPDATE rollouts SET is_rolling_update = ? WHERE id = ?")
            .bind(rolling)
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Cooperative cancellation: the flag is read by the engine at the next
    /// stage boundary.
    pub async fn request_rollout_cancel(&self, id: &Uuid) -> Result<()> {
        let updated = sqlx::query(
            "UPDATE rollouts SET cancel_requested = 1 WHERE id = ? AND status = ?",
        )
        .bind(id)
        .bind(RolloutStatus::InProgress)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(Error::Conflict("rollout already finished"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn one_in_progress_rollout_per_service() {
        let p = Persistence::new_in_memory().await.unwrap();
        let service = p
            .insert_service(crate::persistence::service::tests::new_service("api"))
            .await
            .unwrap();

        let rollout = p.insert_rollout(&service.id).await.unwrap();
        assert_eq!(rollout.status, RolloutStatus::InProgress);
        assert_eq!(rollout.current_stage, RolloutStage::Preparing);

        assert!(matches!(
            p.insert_rollout(&service.id).await,
            Err(Error::Conflict(_))
        ));

        p.finish_rollout(&rollout.id, RolloutStatus::Completed, None)
            .await
            .unwrap();

        // Terminal rollouts are immutable.
        assert!(matches!(
            p.advance_rollout_stage(&rollout.id, RolloutStage::Deploying)
                .await,
            Err(Error::Conflict(_))
        ));
        assert!(matches!(
            p.finish_rollout(&rollout.id, RolloutStatus::RolledBack, None)
                .await,
            Err(Error::Conflict(_))
        ));

        // A new rollout may start now.
        p.insert_rollout(&service.id).await.unwrap();
    }

    #[tokio::test]
    async fn cancellation_is_a_row_flag() {
        let p = Persistence::new_in_memory().await.unwrap();
        let service = p
            .insert_service(crate::persistence::service::tests::new_service("api"))
            .await
            .unwrap();

        let rollout = p.insert_rollout(&service.id).await.unwrap();
        assert!(!rollout.cancel_requested);

        p.request_rollout_cancel(&rollout.id).await.unwrap();
        assert!(p.rollout(&rollout.id).await.unwrap().cancel_requested);
    }
}
