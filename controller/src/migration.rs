use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use flotilla_common::models::agent::ReportKind;
use flotilla_common::models::error::ErrorKind;
use flotilla_common::models::work_item::{StopPayload, WorkItemPayload};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::backup::BackupEngine;
use crate::error::{Error, Result};
use crate::persistence::{
    BackupStatus, Deployment, DeploymentStatus, MigrationStatus, Service, ServiceLock,
};
use crate::rollout::supervisor::{Completion, EngineJob, ServiceSupervisor, Step};
use crate::rollout::EngineCtx;

/// Moves a stateful service between servers: drain the source, snapshot its
/// volumes, restore them on the target, bring a fresh replica up there and
/// repin the service. Progress lives in `service.migration_status`; any step
/// failure parks the migration as `failed` for the operator to clear.
#[derive(Clone)]
pub struct MigrationEngine {
    ctx: Arc<EngineCtx>,
    backups: BackupEngine,
    supervisor: ServiceSupervisor,
}

impl MigrationEngine {
    pub fn new(ctx: Arc<EngineCtx>, backups: BackupEngine, supervisor: ServiceSupervisor) -> Self {
        Self {
            ctx,
            backups,
            supervisor,
        }
    }

    /// Begin migrating a stateful service to `target_server_id`.
    #[instrument(skip(self), fields(service_id = %service_id, target = %target_server_id))]
    pub async fn start(&self, service_id: &Uuid, target_server_id: &Uuid) -> Result<Completion> {
        let service = self.ctx.persistence.service(service_id).await?;

        if !service.stateful {
            return Err(Error::custom(
                ErrorKind::Validation,
                "only stateful services migrate",
            ));
        }
        let Some(locked) = service.locked_server_id else {
            return Err(Error::custom(
                ErrorKind::Validation,
                "service has never been rolled out",
            ));
        };
        if locked == *target_server_id {
            return Err(Error::custom(
                ErrorKind::Validation,
                "service already lives on this server",
            ));
        }
        if service.migration_status.is_some() {
            return Err(Error::custom(
                ErrorKind::Conflict,
                "a migration is already recorded for this service",
            ));
        }

        let target = self.ctx.persistence.server(target_server_id).await?;
        if !target.is_deployable() {
            return Err(Error::custom(
                ErrorKind::Validation,
                "target server is not online",
            ));
        }

        let lock = self.ctx.persistence.try_lock_service(service_id).await?;

        if let Err(err) = self
            .ctx
            .persistence
            .set_migration_state(
                service_id,
                Some(MigrationStatus::Stopping),
                None,
                Some(*target_server_id),
            )
            .await
        {
            let _ = self.ctx.persistence.release_lock(lock).await;
            return Err(err.into());
        }

        info!("migration started");

        Ok(self
            .supervisor
            .submit(
                *service_id,
                Box::new(MigrationJob {
                    ctx: self.ctx.clone(),
                    backups: self.backups.clone(),
                    service_id: *service_id,
                    lock: Some(lock),
                }),
            )
            .await)
    }

    /// The explicit "clear migration state" action for failed migrations.
    pub async fn clear(&self, service_id: &Uuid) -> Result<()> {
        let service = self.ctx.persistence.service(service_id).await?;

        match service.migration_status {
            Some(MigrationStatus::Failed) => {
                self.ctx
                    .persistence
                    .set_migration_state(service_id, None, None, None)
                    .await?;
                Ok(())
            }
            Some(_) => Err(Error::custom(
                ErrorKind::Conflict,
                "migration is still running",
            )),
            None => Err(Error::custom(ErrorKind::NotFound, "no migration recorded")),
        }
    }

    /// Startup sweep: re-enter migrations that were mid-flight when the
    /// controller stopped.
    pub async fn resume_all(&self) -> Result<usize> {
        let services = self.ctx.persistence.services().await?;
        let mut count = 0;

        for service in services {
            if matches!(
                service.migration_status,
                Some(status) if status != MigrationStatus::Failed
            ) {
                info!(service_id = %service.id, "resuming migration");
                self.supervisor
                    .submit(
                        service.id,
                        Box::new(MigrationJob {
                            ctx: self.ctx.clone(),
                            backups: self.backups.clone(),
                            service_id: service.id,
                            lock: None,
                        }),
                    )
                    .await;
                count += 1;
            }
        }

        Ok(count)
    }
}

struct MigrationJob {
    ctx: Arc<EngineCtx>,
    backups: BackupEngine,
    service_id: Uuid,
    lock: Option<ServiceLock>,
}

enum StepOutcome {
    Progress,
    Wait,
    Finished,
    Failed(String),
}

impl MigrationJob {
    async fn release_lock(&mut self) {
        if let Some(lock) = self.lock.take() {
            if let Err(err) = self.ctx.persistence.release_lock(lock).await {
                error!(
                    error = &err as &dyn std::error::Error,
                    service_id = %self.service_id,
                    "failed to release service lock"
                );
            }
        }
    }

    async fn set_status(&self, status: MigrationStatus, target: Uuid) -> Result<()> {
        self.ctx
            .persistence
            .set_migration_state(&self.service_id, Some(status), None, Some(target))
            .await
            .map_err(Into::into)
    }

    /// Drain the source replica(s); once everything stopped, snapshot each
    /// volume from the source server.
    async fn step_stopping(&self, service: &Service, target: Uuid) -> Result<StepOutcome> {
        let deployments = self
            .ctx
            .persistence
            .deployments_for_service(&self.service_id)
            .await?;

        let mut waiting = false;
        for deployment in &deployments {
            match deployment.status {
                DeploymentStatus::Stopping => waiting = true,
                status if status.is_active() => {
                    self.ctx
                        .persistence
                        .update_deployment_status(&deployment.id, DeploymentStatus::Stopping)
                        .await?;

                    match &deployment.container_id {
                        Some(container_id) => {
                            self.ctx
                                .queue
                                .enqueue(
                                    &deployment.server_id,
                                    WorkItemPayload::Stop(StopPayload {
                                        deployment_id: deployment.id,
                                        container_id: container_id.clone(),
                                    }),
                                )
                                .await?;
                            waiting = true;
                        }
                        None => {
                            self.ctx
                                .persistence
                                .update_deployment_status(
                                    &deployment.id,
                                    DeploymentStatus::Stopped,
                                )
                                .await?;
                        }
                    }
                }
                _ => {}
            }
        }

        if waiting {
            return Ok(StepOutcome::Wait);
        }

        let volumes = self.ctx.persistence.service_volumes(&self.service_id).await?;
        if volumes.is_empty() {
            // Nothing to carry over; skip straight to the target deploy.
            self.set_status(MigrationStatus::Starting, target).await?;
            return Ok(StepOutcome::Progress);
        }

        // All stopped. Snapshot every volume from the source server.
        let Some(source) = source_deployment(&deployments, service) else {
            return Ok(StepOutcome::Failed(
                "no source deployment with a container to snapshot".to_string(),
            ));
        };

        for volume in &volumes {
            self.backups
                .trigger_on(
                    service,
                    volume,
                    &source.server_id,
                    source.container_id.as_deref().unwrap_or_default(),
                    None,
                    true,
                )
                .await?;
        }

        self.set_status(MigrationStatus::BackingUp, target).await?;
        Ok(StepOutcome::Progress)
    }

    async fn step_backing_up(&self, target: Uuid) -> Result<StepOutcome> {
        let backups = self
            .ctx
            .persistence
            .latest_migration_backups(&self.service_id)
            .await?;

        if backups.iter().any(|b| b.status == BackupStatus::Failed) {
            return Ok(StepOutcome::Failed("volume backup failed".to_string()));
        }
        if backups
            .iter()
            .any(|b| matches!(b.status, BackupStatus::Pending | BackupStatus::Uploading))
        {
            return Ok(StepOutcome::Wait);
        }

        self.set_status(MigrationStatus::DeployingTarget, target).await?;
        Ok(StepOutcome::Progress)
    }

    /// Hand every snapshot to the target server for restore.
    async fn step_deploying_target(&self, target: Uuid) -> Result<StepOutcome> {
        let backups = self
            .ctx
            .persistence
            .latest_migration_backups(&self.service_id)
            .await?;

        for backup in &backups {
            self.backups.restore(&backup.id, Some(target)).await?;
        }

        self.set_status(MigrationStatus::Restoring, target).await?;
        Ok(StepOutcome::Progress)
    }

    async fn step_restoring(&self, target: Uuid) -> Result<StepOutcome> {
        let backups = self
            .ctx
            .persistence
            .latest_migration_backups(&self.service_id)
            .await?;

        for backup in &backups {
            if self
                .ctx
                .persistence
                .agent_report_exists(&backup.id, ReportKind::RestoreFailed.as_str())
                .await?
            {
                return Ok(StepOutcome::Failed("volume restore failed".to_string()));
            }
            if !self
                .ctx
                .persistence
                .agent_report_exists(&backup.id, ReportKind::RestoreCompleted.as_str())
                .await?
            {
                return Ok(StepOutcome::Wait);
            }
        }

        self.set_status(MigrationStatus::Starting, target).await?;
        Ok(StepOutcome::Progress)
    }

    /// Bring a fresh replica up on the target; on healthy, repin and finish.
    async fn step_starting(&self, service: &Service, target: Uuid) -> Result<StepOutcome> {
        let deployments = self
            .ctx
            .persistence
            .deployments_for_service(&self.service_id)
            .await?;

        let on_target: Vec<&Deployment> = deployments
            .iter()
            .filter(|d| d.server_id == target && !d.status.is_terminal())
            .collect();

        let Some(fresh) = on_target.first() else {
            let server = self.ctx.persistence.server(&target).await?;
            if !server.is_deployable() {
                return Ok(StepOutcome::Failed("target server went offline".to_string()));
            }

            let ordinal = deployments.len() as u32;
            return match crate::rollout::stages::provision_replica(
                &self.ctx, service, &server, None, ordinal,
            )
            .await?
            {
                Ok(_) => Ok(StepOutcome::Wait),
                Err(failed) => Ok(StepOutcome::Failed(format!(
                    "target deploy failed: {failed}"
                ))),
            };
        };

        match fresh.status {
            DeploymentStatus::Healthy | DeploymentStatus::Running => {
                self.ctx
                    .persistence
                    .update_deployment_status(&fresh.id, DeploymentStatus::Running)
                    .await?;
                self.ctx
                    .persistence
                    .set_locked_server(&self.service_id, Some(target))
                    .await?;
                self.ctx
                    .persistence
                    .set_migration_state(&self.service_id, None, None, None)
                    .await?;

                info!(service_id = %self.service_id, target = %target, "migration completed");
                Ok(StepOutcome::Finished)
            }
            DeploymentStatus::Failed => {
                Ok(StepOutcome::Failed("target replica failed".to_string()))
            }
            _ => {
                let timeout = Duration::seconds(self.ctx.config.health_check_timeout_secs);
                if Utc::now() - fresh.created_at > timeout {
                    return Ok(StepOutcome::Failed(
                        "target replica never became healthy".to_string(),
                    ));
                }
                Ok(StepOutcome::Wait)
            }
        }
    }

    async fn run_step(&self, service: &Service, status: MigrationStatus, target: Uuid) -> Result<StepOutcome> {
        match status {
            MigrationStatus::Stopping => self.step_stopping(service, target).await,
            MigrationStatus::BackingUp => self.step_backing_up(target).await,
            MigrationStatus::DeployingTarget => self.step_deploying_target(target).await,
            MigrationStatus::Restoring => self.step_restoring(target).await,
            MigrationStatus::Starting => self.step_starting(service, target).await,
            MigrationStatus::Failed => Ok(StepOutcome::Finished),
        }
    }
}

/// The replica whose volumes hold the data: the one on the locked server
/// that has a container, preferring the most recent row.
fn source_deployment<'d>(deployments: &'d [Deployment], service: &Service) -> Option<&'d Deployment> {
    deployments
        .iter()
        .rev()
        .find(|d| Some(d.server_id) == service.locked_server_id && d.container_id.is_some())
}

impl MigrationJob {
    async fn advance(&mut self) -> Result<Step> {
        if self.lock.is_none() {
            match self.ctx.persistence.try_lock_service(&self.service_id).await {
                Ok(lock) => self.lock = Some(lock),
                Err(crate::persistence::Error::Conflict(_)) => return Ok(Step::Idle),
                Err(err) => return Err(err.into()),
            }
        }
        if let Some(lock) = &self.lock {
            self.ctx.persistence.refresh_lock(lock).await?;
        }

        let service = match self.ctx.persistence.service(&self.service_id).await {
            Ok(service) => service,
            // The service went away under us; there is nothing left to move.
            Err(crate::persistence::Error::NotFound(_)) => {
                self.release_lock().await;
                return Ok(Step::Finished);
            }
            Err(err) => return Err(err.into()),
        };

        let (Some(status), Some(target)) =
            (service.migration_status, service.migration_target_server_id)
        else {
            // Cleared or finished elsewhere.
            self.release_lock().await;
            return Ok(Step::Finished);
        };

        if status == MigrationStatus::Failed {
            self.release_lock().await;
            return Ok(Step::Finished);
        }

        match self.run_step(&service, status, target).await? {
            StepOutcome::Progress => Ok(Step::Advanced),
            StepOutcome::Wait => Ok(Step::Idle),
            StepOutcome::Finished => {
                self.release_lock().await;
                Ok(Step::Finished)
            }
            StepOutcome::Failed(message) => {
                warn!(
                    service_id = %self.service_id,
                    message, "migration failed"
                );
                self.ctx
                    .persistence
                    .set_migration_state(
                        &self.service_id,
                        Some(MigrationStatus::Failed),
                        Some(&message),
                        Some(target),
                    )
                    .await?;
                self.release_lock().await;
                Ok(Step::Finished)
            }
        }
    }
}

#[async_trait]
impl EngineJob for MigrationJob {
    fn describe(&self) -> String {
        format!("migration of service {}", self.service_id)
    }

    async fn step(&mut self) -> Step {
        match self.advance().await {
            Ok(step) => step,
            // Parking the migration as failed is itself a store write; if
            // even that errors there is nothing to do but retry the whole
            // step later.
            Err(err) => {
                error!(
                    error = &err as &dyn std::error::Error,
                    service_id = %self.service_id,
                    "migration step errored; will retry"
                );
                Step::Idle
            }
        }
    }
}
