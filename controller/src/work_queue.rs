use chrono::Duration;
use flotilla_common::models::work_item::WorkItemPayload;
use tracing::{info, warn};
use uuid::Uuid;

use crate::persistence::{
    self, DeploymentStatus, FailedStage, Persistence, WorkItem, WorkItemStatus,
};

/// Retry policy of the per-server queues.
#[derive(Debug, Clone, Copy)]
pub struct QueueConfig {
    pub max_attempts: i64,
    /// The backoff before attempt `n` retries is `n * backoff_step_secs`.
    pub backoff_step_secs: i64,
    /// Items processing longer than this are considered stuck and requeued.
    pub stuck_after_secs: i64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_step_secs: 30,
            stuck_after_secs: 300,
        }
    }
}

/// Durable, strictly FIFO per-server queue of agent commands, layered over
/// the store. Claiming is what hands an item to an agent; completion and
/// failure come back through the dispatcher.
#[derive(Clone)]
pub struct WorkQueue {
    persistence: Persistence,
    config: QueueConfig,
}

impl WorkQueue {
    pub fn new(persistence: Persistence, config: QueueConfig) -> Self {
        Self {
            persistence,
            config,
        }
    }

    /// Enqueue a command for a server. Deployment-scoped duplicates are
    /// dropped; the `Option` tells the caller whether a new item was created.
    pub async fn enqueue(
        &self,
        server_id: &Uuid,
        payload: WorkItemPayload,
    ) -> persistence::Result<Option<WorkItem>> {
        let item = self.persistence.enqueue_work_item(server_id, &payload).await?;

        if let Some(item) = &item {
            info!(
                item_id = %item.id,
                server_id = %server_id,
                item_type = %item.r#type,
                "work item enqueued"
            );
        }

        Ok(item)
    }

    pub async fn claim(&self, server_id: &Uuid, max: u32) -> persistence::Result<Vec<WorkItem>> {
        self.persistence.claim_work_items(server_id, max).await
    }

    pub async fn complete(&self, item_id: &Uuid) -> persistence::Result<()> {
        self.persistence.complete_work_item(item_id).await
    }

    /// Record a failed attempt. Under the attempt limit the item goes back to
    /// `pending` behind a backoff; otherwise it fails terminally and, for
    /// `deploy` items, the owning deployment is marked failed so the rollout
    /// engine observes `deployment.failed`.
    pub async fn fail(&self, item_id: &Uuid, reason: &str) -> persistence::Result<WorkItemStatus> {
        let status = self
            .persistence
            .fail_work_item(
                item_id,
                reason,
                self.config.max_attempts,
                Duration::seconds(self.config.backoff_step_secs),
            )
            .await?;

        if status == WorkItemStatus::Failed {
            warn!(item_id = %item_id, reason, "work item failed terminally");
            self.surface_terminal_failure(item_id).await?;
        }

        Ok(status)
    }

    async fn surface_terminal_failure(&self, item_id: &Uuid) -> persistence::Result<()> {
        let item = self.persistence.work_item(item_id).await?;

        let Ok(WorkItemPayload::Deploy(payload)) = item.typed_payload() else {
            return Ok(());
        };

        let deployment = self.persistence.deployment(&payload.deployment_id).await;
        if let Ok(deployment) = deployment {
            if !deployment.status.is_terminal() {
                self.persistence
                    .update_deployment_status(&deployment.id, DeploymentStatus::Failed)
                    .await?;
                self.persistence
                    .set_deployment_failed_stage(&deployment.id, FailedStage::DeployFailed)
                    .await?;
            }
        }

        Ok(())
    }

    /// Scheduler entry point for the stuck-item sweep.
    pub async fn requeue_stuck(&self) -> persistence::Result<Vec<Uuid>> {
        let requeued = self
            .persistence
            .requeue_stuck_work_items(Duration::seconds(self.config.stuck_after_secs))
            .await?;

        if !requeued.is_empty() {
            warn!(count = requeued.len(), "returned stuck work items to pending");
        }

        Ok(requeued)
    }
}
