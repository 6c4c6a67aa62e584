use chrono::{DateTime, Duration, Utc};
use flotilla_common::models::work_item::{WorkItemPayload, WorkItemType};
use uuid::Uuid;

use super::error::{Error, Result};
use super::state::WorkItemStatus;
use super::Persistence;

/// A durable imperative command queued for one server's agent.
#[derive(Clone, Debug, PartialEq, sqlx::FromRow)]
pub struct WorkItem {
    pub id: Uuid,
    pub server_id: Uuid,
    #[sqlx(rename = "type")]
    pub r#type: WorkItemType,
    pub payload: serde_json::Value,
    pub status: WorkItemStatus,
    pub attempts: i64,
    pub not_before: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl WorkItem {
    /// Deserialise and re-validate the payload against the stored type tag.
    pub fn typed_payload(&self) -> Result<WorkItemPayload> {
        let payload: WorkItemPayload = serde_json::from_value(self.payload.clone())
            .map_err(|_| Error::Unexpected("work item payload does not parse"))?;
        payload
            .validate_for(self.r#type)
            .map_err(|_| Error::Unexpected("work item payload failed validation"))?;
        Ok(payload)
    }
}

impl Persistence {
    /// Inserts a pending item. Items that target a deployment are
    /// deduplicated on `(deployment id, type)`: if an equivalent item is
    /// already pending or processing the enqueue is a no-op and `None` is
    /// returned.
    pub async fn enqueue_work_item(
        &self,
        server_id: &Uuid,
        payload: &WorkItemPayload,
    ) -> Result<Option<WorkItem>> {
        payload
            .validate()
            .map_err(|_| Error::Unexpected("refusing to enqueue invalid payload"))?;

        let item_type = payload.item_type();
        let value =
            serde_json::to_value(payload).map_err(|_| Error::Unexpected("payload serialise"))?;

        if let Some(deployment_id) = value.get("deployment_id").and_then(|v| v.as_str()) {
            let (existing,): (i64,) = sqlx::query_as(
                "SELECT COUNT(*) FROM work_items
                 WHERE type = ? AND status IN ('pending', 'processing')
                   AND json_extract(payload, '$.deployment_id') = ?",
            )
            .bind(item_type)
            .bind(deployment_id)
            .fetch_one(&self.pool)
            .await?;

            if existing > 0 {
                return Ok(None);
            }
        }

        let id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO work_items (id, server_id, type, payload, status, attempts, created_at)
             VALUES (?, ?, ?, ?, ?, 0, ?)",
        )
        .bind(id)
        .bind(server_id)
        .bind(item_type)
        .bind(&value)
        .bind(WorkItemStatus::Pending)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        self.work_item(&id).await.map(Some)
    }

    pub async fn work_item(&self, id: &Uuid) -> Result<WorkItem> {
        sqlx::query_as("SELECT * FROM work_items WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(Error::NotFound("work item"))
    }

    /// Atomically moves up to `max` oldest claimable pending items of one
    /// server to `processing`, stamping `started_at` and bumping `attempts`.
    /// FIFO by `(created_at, id)`; items under a retry backoff are skipped.
    pub async fn claim_work_items(&self, server_id: &Uuid, max: u32) -> Result<Vec<WorkItem>> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let batch: Vec<WorkItem> = sqlx::query_as(
            "SELECT * FROM work_items
             WHERE server_id = ? AND status = ?
               AND (not_before IS NULL OR not_before <= ?)
             ORDER BY created_at, id
             LIMIT ?",
        )
        .bind(server_id)
        .bind(WorkItemStatus::Pending)
        .bind(now)
        .bind(max as i64)
        .fetch_all(&mut *tx)
        .await?;

        for item in &batch {
            sqlx::query(
                "UPDATE work_items
                 SET status = ?, started_at = ?, attempts = attempts + 1
                 WHERE id = ?",
            )
            .bind(WorkItemStatus::Processing)
            .bind(now)
            .bind(item.id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        let mut claimed = Vec::with_capacity(batch.len());
        for item in batch {
            claimed.push(self.work_item(&item.id).await?);
        }

        Ok(claimed)
    }

    pub async fn complete_work_item(&self, id: &Uuid) -> Result<()> {
        let updated = sqlx::query(
            "UPDATE work_items SET status = ?, finished_at = ? WHERE id = ? AND status = ?",
        )
        .bind(WorkItemStatus::Completed)
        .bind(Utc::now())
        .bind(id)
        .bind(WorkItemStatus::Processing)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(Error::Conflict("work item is not processing"));
        }

        Ok(())
    }

    /// Marks an attempt failed. Below `max_attempts` the item is re-enqueued
    /// behind an attempt-scaled backoff; at the limit it fails terminally.
    /// Returns the resulting status.
    pub async fn fail_work_item(
        &self,
        id: &Uuid,
        reason: &str,
        max_attempts: i64,
        backoff_step: Duration,
    ) -> Result<WorkItemStatus> {
        let item = self.work_item(id).await?;

        if item.status != WorkItemStatus::Processing {
            return Err(Error::Conflict("work item is not processing"));
        }

        let status = if item.attempts < max_attempts {
            let not_before = Utc::now() + backoff_step * item.attempts as i32;
            sqlx::query(
                "UPDATE work_items SET status = ?, not_before = ?, error = ? WHERE id = ?",
            )
            .bind(WorkItemStatus::Pending)
            .bind(not_before)
            .bind(reason)
            .bind(id)
            .execute(&self.pool)
            .await?;
            WorkItemStatus::Pending
        } else {
            sqlx::query(
                "UPDATE work_items SET status = ?, finished_at = ?, error = ? WHERE id = ?",
            )
            .bind(WorkItemStatus::Failed)
            .bind(Utc::now())
            .bind(reason)
            .bind(id)
            .execute(&self.pool)
            .await?;
            WorkItemStatus::Failed
        };

        Ok(status)
    }

    /// The processing item of a given type correlated to a deployment or
    /// backup id, if any. Agent callbacks resolve their work item this way.
    pub async fn processing_work_item(
        &self,
        server_id: &Uuid,
        item_type: WorkItemType,
        correlation_field: &str,
        correlation_id: &Uuid,
    ) -> Result<Option<WorkItem>> {
        sqlx::query_as(
            "SELECT * FROM work_items
             WHERE server_id = ? AND type = ? AND status = 'processing'
               AND json_extract(payload, ?) = ?
             ORDER BY created_at, id",
        )
        .bind(server_id)
        .bind(item_type)
        .bind(format!("$.{correlation_field}"))
        .bind(correlation_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::from)
    }

    /// Returns items stuck in `processing` beyond the threshold to `pending`.
    /// Their attempt count already reflects the claim that stalled.
    pub async fn requeue_stuck_work_items(&self, stuck_after: Duration) -> Result<Vec<Uuid>> {
        let cutoff = Utc::now() - stuck_after;

        let stuck: Vec<WorkItem> = sqlx::query_as(
            "SELECT * FROM work_items WHERE status = ? AND started_at < ?",
        )
        .bind(WorkItemStatus::Processing)
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        for item in &stuck {
            sqlx::query("UPDATE work_items SET status = ?, not_before = NULL WHERE id = ?")
                .bind(WorkItemStatus::Pending)
                .bind(item.id)
                .execute(&self.pool)
                .await?;
        }

        Ok(stuck.iter().map(|i| i.id).collect())
    }

    /// Drops pending items of one service, used when a rollout is aborted.
    /// Items an agent is already processing are left to finish.
    pub async fn clear_pending_work_items_for_service(&self, service_id: &Uuid) -> Result<u64> {
        let deleted = sqlx::query(
            "DELETE FROM work_items
             WHERE status = ? AND json_extract(payload, '$.service_id') = ?",
        )
        .bind(WorkItemStatus::Pending)
        .bind(service_id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(deleted.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use flotilla_common::models::work_item::StopPayload;

    use super::*;

    async fn seeded() -> (Persistence, Uuid) {
        let p = Persistence::new_in_memory().await.unwrap();
        let server = p
            .insert_server("s1", None, false, "tok", Duration::hours(24))
            .await
            .unwrap();
        (p, server.id)
    }

    fn stop_payload(deployment_id: Uuid) -> WorkItemPayload {
        WorkItemPayload::Stop(StopPayload {
            deployment_id,
            container_id: "c1".to_string(),
        })
    }

    #[tokio::test]
    async fn fifo_claim_order() {
        let (p, server_id) = seeded().await;

        let first = p
            .enqueue_work_item(&server_id, &stop_payload(Uuid::new_v4()))
            .await
            .unwrap()
            .unwrap();
        let second = p
            .enqueue_work_item(&server_id, &stop_payload(Uuid::new_v4()))
            .await
            .unwrap()
            .unwrap();
        let third = p
            .enqueue_work_item(&server_id, &stop_payload(Uuid::new_v4()))
            .await
            .unwrap()
            .unwrap();

        let claimed = p.claim_work_items(&server_id, 2).await.unwrap();
        assert_eq!(
            claimed.iter().map(|i| i.id).collect::<Vec<_>>(),
            vec![first.id, second.id]
        );
        assert_eq!(claimed[0].status, WorkItemStatus::Processing);
        assert_eq!(claimed[0].attempts, 1);

        let rest = p.claim_work_items(&server_id, 10).await.unwrap();
        assert_eq!(rest.iter().map(|i| i.id).collect::<Vec<_>>(), vec![third.id]);
    }

    #[tokio::test]
    async fn duplicate_deployment_item_is_a_noop() {
        let (p, server_id) = seeded().await;
        let deployment_id = Uuid::new_v4();

        let first = p
            .enqueue_work_item(&server_id, &stop_payload(deployment_id))
            .await
            .unwrap();
        assert!(first.is_some());

        let duplicate = p
            .enqueue_work_item(&server_id, &stop_payload(deployment_id))
            .await
            .unwrap();
        assert!(duplicate.is_none());

        // Still deduplicated while processing.
        p.claim_work_items(&server_id, 1).await.unwrap();
        let duplicate = p
            .enqueue_work_item(&server_id, &stop_payload(deployment_id))
            .await
            .unwrap();
        assert!(duplicate.is_none());
    }

    #[tokio::test]
    async fn retry_then_terminal_failure() {
        let (p, server_id) = seeded().await;

        let item = p
            .enqueue_work_item(&server_id, &stop_payload(Uuid::new_v4()))
            .await
            .unwrap()
            .unwrap();

        // First attempt fails: re-enqueued with a backoff.
        p.claim_work_items(&server_id, 1).await.unwrap();
        let status = p
            .fail_work_item(&item.id, "engine offline", 3, Duration::seconds(0))
            .await
            .unwrap();
        assert_eq!(status, WorkItemStatus::Pending);

        // Second attempt fails.
        let claimed = p.claim_work_items(&server_id, 1).await.unwrap();
        assert_eq!(claimed[0].attempts, 2);
        let status = p
            .fail_work_item(&item.id, "engine offline", 3, Duration::seconds(0))
            .await
            .unwrap();
        assert_eq!(status, WorkItemStatus::Pending);

        // Third attempt exhausts max_attempts.
        p.claim_work_items(&server_id, 1).await.unwrap();
        let status = p
            .fail_work_item(&item.id, "engine offline", 3, Duration::seconds(0))
            .await
            .unwrap();
        assert_eq!(status, WorkItemStatus::Failed);

        assert!(p.claim_work_items(&server_id, 1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn stuck_items_return_to_pending() {
        let (p, server_id) = seeded().await;

        let item = p
            .enqueue_work_item(&server_id, &stop_payload(Uuid::new_v4()))
            .await
            .unwrap()
            .unwrap();
        p.claim_work_items(&server_id, 1).await.unwrap();

        // Nothing is stuck yet.
        assert!(p
            .requeue_stuck_work_items(Duration::minutes(5))
            .await
            .unwrap()
            .is_empty());

        sqlx::query("UPDATE work_items SET started_at = ? WHERE id = ?")
            .bind(Utc::now() - Duration::minutes(10))
            .bind(item.id)
            .execute(p.pool())
            .await
            .unwrap();

        let requeued = p
            .requeue_stuck_work_items(Duration::minutes(5))
            .await
            .unwrap();
        assert_eq!(requeued, vec![item.id]);
        assert_eq!(
            p.work_item(&item.id).await.unwrap().status,
            WorkItemStatus::Pending
        );
    }
}
