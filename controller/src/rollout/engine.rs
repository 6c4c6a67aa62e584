use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info, instrument};
use uuid::Uuid;

use flotilla_common::models::error::ErrorKind;

use crate::alerts::AlertSink;
use crate::allocator::Allocator;
use crate::certificates::CertificateIssuer;
use crate::error::{Error, Result};
use crate::persistence::{
    self, FailedStage, Persistence, Rollout, RolloutStage, RolloutStatus, ServiceLock,
};
use crate::work_queue::WorkQueue;

use super::stages::{self, StageOutcome};
use super::supervisor::{Completion, EngineJob, ServiceSupervisor, Step};

/// Consecutive stage errors tolerated before the engine gives up on a
/// rollout and compensates.
const MAX_STAGE_ERRORS: u32 = 5;

/// Stage wait deadlines.
#[derive(Debug, Clone, Copy)]
pub struct RolloutConfig {
    /// Per-deployment health gate, 10 minutes unless configured.
    pub health_check_timeout_secs: i64,
    /// Per-server DNS confirmation wait; elapsing is a warning, not a
    /// failure.
    pub dns_sync_timeout_secs: i64,
}

impl Default for RolloutConfig {
    fn default() -> Self {
        Self {
            health_check_timeout_secs: 600,
            dns_sync_timeout_secs: 300,
        }
    }
}

/// Everything a rollout or migration job needs to transact.
pub struct EngineCtx {
    pub persistence: Persistence,
    pub allocator: Allocator,
    pub queue: WorkQueue,
    pub issuer: Arc<dyn CertificateIssuer>,
    pub alerts: Arc<dyn AlertSink>,
    pub config: RolloutConfig,
}

/// Drives service rollouts through their staged state machine. One job per
/// active rollout runs on the owning service's supervisor lane; the rollout
/// row is the source of truth, the job just advances it.
#[derive(Clone)]
pub struct RolloutEngine {
    ctx: Arc<EngineCtx>,
    supervisor: ServiceSupervisor,
}

impl RolloutEngine {
    pub fn new(ctx: Arc<EngineCtx>, supervisor: ServiceSupervisor) -> Self {
        Self { ctx, supervisor }
    }

    pub fn ctx(&self) -> &Arc<EngineCtx> {
        &self.ctx
    }

    /// Create a rollout for a service and start driving it. Returns as soon
    /// as the rollout row exists; the completion resolves when the
    /// background job reaches a terminal state.
    #[instrument(skip(self), fields(service_id = %service_id))]
    pub async fn start(&self, service_id: &Uuid) -> Result<(Rollout, Completion)> {
        let service = self.ctx.persistence.service(service_id).await?;

        if matches!(
            service.migration_status,
            Some(status) if status != crate::persistence::MigrationStatus::Failed
        ) {
            return Err(Error::custom(
                ErrorKind::Conflict,
                "service is being migrated",
            ));
        }

        let lock = self.ctx.persistence.try_lock_service(service_id).await?;

        let rollout = match self.ctx.persistence.insert_rollout(service_id).await {
            Ok(rollout) => rollout,
            Err(err) => {
                let _ = self.ctx.persistence.release_lock(lock).await;
                return Err(err.into());
            }
        };

        info!(rollout_id = %rollout.id, "rollout created");

        let completion = self
            .supervisor
            .submit(
                *service_id,
                Box::new(RolloutJob {
                    ctx: self.ctx.clone(),
                    rollout_id: rollout.id,
                    service_id: *service_id,
                    lock: Some(lock),
                    consecutive_errors: 0,
                }),
            )
            .await;

        Ok((rollout, completion))
    }

    /// Cooperative cancellation: flags the rollout, clears work the agents
    /// have not picked up yet and makes sure a job is driving the rollback.
    #[instrument(skip(self), fields(rollout_id = %rollout_id))]
    pub async fn abort(&self, rollout_id: &Uuid) -> Result<()> {
        let rollout = self.ctx.persistence.rollout(rollout_id).await?;

        self.ctx.persistence.request_rollout_cancel(rollout_id).await?;
        self.ctx
            .persistence
            .clear_pending_work_items_for_service(&rollout.service_id)
            .await?;

        // The live job observes the flag at its next step. After a restart
        // there is none, so submit one; a duplicate sees the terminal row
        // and exits immediately.
        self.resume(&rollout).await;

        Ok(())
    }

    /// Re-enter one in-progress rollout (restart recovery). The job
    /// re-acquires the advisory lock, waiting out a crashed holder's lease.
    pub async fn resume(&self, rollout: &Rollout) -> Completion {
        self.supervisor
            .submit(
                rollout.service_id,
                Box::new(RolloutJob {
                    ctx: self.ctx.clone(),
                    rollout_id: rollout.id,
                    service_id: rollout.service_id,
                    lock: None,
                    consecutive_errors: 0,
                }),
            )
            .await
    }

    /// Startup sweep: resume every in-progress rollout found in the store.
    pub async fn resume_all(&self) -> Result<usize> {
        let rollouts = self.ctx.persistence.in_progress_rollouts().await?;
        let count = rollouts.len();

        for rollout in rollouts {
            info!(rollout_id = %rollout.id, stage = %rollout.current_stage, "resuming rollout");
            self.resume(&rollout).await;
        }

        Ok(count)
    }
}

/// The per-rollout engine job. Each step advances the persisted stage
/// machine by at most one transition; errors are retried a bounded number of
/// times, then the rollout is compensated.
struct RolloutJob {
    ctx: Arc<EngineCtx>,
    rollout_id: Uuid,
    service_id: Uuid,
    lock: Option<ServiceLock>,
    consecutive_errors: u32,
}

impl RolloutJob {
    async fn release_lock(&mut self) {
        if let Some(lock) = self.lock.take() {
            if let Err(err) = self.ctx.persistence.release_lock(lock).await {
                error!(
                    error = &err as &dyn std::error::Error,
                    rollout_id = %self.rollout_id,
                    "failed to release service lock"
                );
            }
        }
    }

    /// Run compensation and finish the job.
    async fn compensate(&mut self, rollout: &Rollout, failed: FailedStage) -> Result<Step> {
        stages::rollback(&self.ctx, rollout, failed).await?;
        self.release_lock().await;
        Ok(Step::Finished)
    }

    /// Terminal happy path: mark completed and pin first-rollout stateful
    /// services to the server that now runs them.
    async fn complete(&mut self, rollout: &Rollout) -> Result<()> {
        self.ctx
            .persistence
            .finish_rollout(&rollout.id, RolloutStatus::Completed, None)
            .await?;

        let service = self.ctx.persistence.service(&self.service_id).await?;
        if service.stateful && service.locked_server_id.is_none() {
            let deployments = self
                .ctx
                .persistence
                .deployments_for_rollout(&rollout.id)
                .await?;
            if let Some(deployment) = deployments.first() {
                self.ctx
                    .persistence
                    .set_locked_server(&self.service_id, Some(deployment.server_id))
                    .await?;
            }
        }

        info!(rollout_id = %rollout.id, service_id = %self.service_id, "rollout completed");

        Ok(())
    }

    async fn advance(&mut self) -> Result<Step> {
        // A resumed job first has to win the advisory lock back; a crashed
        // holder's lease expires on its own.
        if self.lock.is_none() {
            match self.ctx.persistence.try_lock_service(&self.service_id).await {
                Ok(lock) => self.lock = Some(lock),
                Err(persistence::Error::Conflict(_)) => return Ok(Step::Idle),
                Err(err) => return Err(err.into()),
            }
        }
        if let Some(lock) = &self.lock {
            self.ctx.persistence.refresh_lock(lock).await?;
        }

        let rollout = self.ctx.persistence.rollout(&self.rollout_id).await?;

        if rollout.status.is_terminal() {
            self.release_lock().await;
            return Ok(Step::Finished);
        }

        if rollout.cancel_requested {
            return self.compensate(&rollout, FailedStage::Aborted).await;
        }

        match stages::run_stage(&self.ctx, &rollout).await? {
            StageOutcome::Advance(RolloutStage::Completed) => {
                self.complete(&rollout).await?;
                self.release_lock().await;
                Ok(Step::Finished)
            }
            StageOutcome::Advance(next) => {
                self.ctx
                    .persistence
                    .advance_rollout_stage(&rollout.id, next)
                    .await?;
                info!(
                    rollout_id = %rollout.id,
                    service_id = %self.service_id,
                    from = %rollout.current_stage,
                    to = %next,
                    "rollout stage advanced"
                );
                Ok(Step::Advanced)
            }
            StageOutcome::Wait => Ok(Step::Idle),
            StageOutcome::Fail(failed) => self.compensate(&rollout, failed).await,
        }
    }

    /// Bounded retry on errors; past the budget the rollout is compensated
    /// (best-effort) and the job ends. Anything still inconsistent is picked
    /// up by the resume sweep.
    async fn handle_error(&mut self, err: Error) -> Step {
        self.consecutive_errors += 1;

        if self.consecutive_errors < MAX_STAGE_ERRORS {
            error!(
                error = &err as &dyn std::error::Error,
                rollout_id = %self.rollout_id,
                attempt = self.consecutive_errors,
                "rollout step errored; will retry"
            );
            return Step::Idle;
        }

        error!(
            error = &err as &dyn std::error::Error,
            rollout_id = %self.rollout_id,
            "rollout kept failing; compensating"
        );

        match self.ctx.persistence.rollout(&self.rollout_id).await {
            Ok(rollout) if !rollout.status.is_terminal() => {
                if let Err(err) =
                    stages::rollback(&self.ctx, &rollout, FailedStage::DeployFailed).await
                {
                    error!(
                        error = &err as &dyn std::error::Error,
                        rollout_id = %self.rollout_id,
                        "rollback failed; rollout left for the resume sweep"
                    );
                }
            }
            _ => {}
        }

        self.release_lock().await;
        Step::Finished
    }
}

#[async_trait]
impl EngineJob for RolloutJob {
    fn describe(&self) -> String {
        format!("rollout {}", self.rollout_id)
    }

    async fn step(&mut self) -> Step {
        match self.advance().await {
            Ok(step) => {
                self.consecutive_errors = 0;
                step
            }
            Err(err) => self.handle_error(err).await,
        }
    }
}
