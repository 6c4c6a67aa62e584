use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{error, info, warn};

use crate::backup::BackupEngine;
use crate::certificates::{self, CertificateIssuer, RENEWAL_VALIDITY_THRESHOLD_IN_DAYS};
use crate::error::Result;
use crate::persistence::Persistence;
use crate::rollout::RolloutEngine;
use crate::work_queue::WorkQueue;

#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    pub heartbeat_staleness_secs: i64,
    pub retention_days: i64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            heartbeat_staleness_secs: flotilla_common::DEFAULT_HEARTBEAT_STALENESS_SECS as i64,
            retention_days: 14,
        }
    }
}

/// Periodic sweeps. Every sweep is idempotent and swallows per-item failures
/// so one bad row cannot jam a whole pass.
pub struct Scheduler {
    pub persistence: Persistence,
    pub queue: WorkQueue,
    pub rollouts: RolloutEngine,
    pub backups: BackupEngine,
    pub issuer: Arc<dyn CertificateIssuer>,
    pub config: SchedulerConfig,
}

impl Scheduler {
    /// Spawns every sweep loop. The handles run for the life of the process.
    pub fn spawn(self) -> Vec<JoinHandle<()>> {
        let this = Arc::new(self);
        let mut handles = Vec::new();

        handles.push(spawn_interval(
            this.clone(),
            Duration::from_secs(300),
            "stale-servers",
            |s| Box::pin(async move { s.sweep_stale_servers().await }),
        ));
        handles.push(spawn_interval(
            this.clone(),
            Duration::from_secs(900),
            "scheduled-deploys",
            |s| Box::pin(async move { s.sweep_scheduled_deploys().await }),
        ));
        handles.push(spawn_interval(
            this.clone(),
            Duration::from_secs(600),
            "acme-challenges",
            |s| Box::pin(async move { s.sweep_expired_challenges().await }),
        ));
        handles.push(spawn_interval(
            this.clone(),
            Duration::from_secs(900),
            "scheduled-backups",
            |s| Box::pin(async move { s.sweep_scheduled_backups().await }),
        ));
        handles.push(spawn_interval(
            this.clone(),
            Duration::from_secs(300),
            "stuck-items",
            |s| Box::pin(async move { s.sweep_stuck_items().await }),
        ));
        handles.push(spawn_daily(
            this.clone(),
            "0 0 2 * * *",
            "certificate-renewal",
            |s| Box::pin(async move { s.sweep_certificates().await }),
        ));
        handles.push(spawn_daily(
            this,
            "0 0 3 * * *",
            "backup-retention",
            |s| Box::pin(async move { s.sweep_retention().await }),
        ));

        handles
    }

    /// Servers silent past the staleness window go offline; auto-placed
    /// services that lose replicas with them get a recovery rollout.
    pub async fn sweep_stale_servers(&self) -> Result<()> {
        let offline = self
            .persistence
            .mark_stale_servers_offline(chrono::Duration::seconds(
                self.config.heartbeat_staleness_secs,
            ))
            .await?;

        for server_id in &offline {
            warn!(server_id = %server_id, "server went offline");

            let stranded = self
                .persistence
                .active_deployments_for_server(server_id)
                .await?;
            let mut services: Vec<_> = stranded.iter().map(|d| d.service_id).collect();
            services.sort();
            services.dedup();

            for service_id in services {
                let service = match self.persistence.service(&service_id).await {
                    Ok(service) => service,
                    Err(err) => {
                        error!(error = &err as &dyn std::error::Error, "recovery lookup failed");
                        continue;
                    }
                };

                if !service.auto_place || service.stateful {
                    continue;
                }

                match self.rollouts.start(&service_id).await {
                    Ok((rollout, _)) => {
                        info!(
                            service_id = %service_id,
                            rollout_id = %rollout.id,
                            "started recovery rollout"
                        );
                    }
                    // A rollout is already running, or the lock is held:
                    // recovery happens on the next pass.
                    Err(err) => {
                        warn!(
                            error = %err,
                            service_id = %service_id,
                            "recovery rollout not started"
                        );
                    }
                }
            }
        }

        Ok(())
    }

    /// Services with a cron `deployment_schedule` whose window elapsed since
    /// their last rollout get an automatic deploy.
    pub async fn sweep_scheduled_deploys(&self) -> Result<()> {
        let services = self.persistence.services().await?;

        for service in services {
            let Some(expr) = &service.deployment_schedule else {
                continue;
            };
            let Some(due) = last_occurrence(expr, Utc::now()) else {
                continue;
            };

            let rollouts = self.persistence.rollouts_for_service(&service.id).await?;
            if let Some(latest) = rollouts.first() {
                if latest.created_at >= due || !latest.status.is_terminal() {
                    continue;
                }
            }

            match self.rollouts.start(&service.id).await {
                Ok((rollout, _)) => {
                    info!(service_id = %service.id, rollout_id = %rollout.id, "scheduled deploy");
                }
                Err(err) => {
                    warn!(error = %err, service_id = %service.id, "scheduled deploy skipped");
                }
            }
        }

        Ok(())
    }

    /// Certificates inside the renewal window get re-issued.
    pub async fn sweep_certificates(&self) -> Result<()> {
        let expiring = self
            .persistence
            .certificates_expiring_within(chrono::Duration::days(
                RENEWAL_VALIDITY_THRESHOLD_IN_DAYS,
            ))
            .await?;

        for cert in expiring {
            if let Err(err) = certificates::ensure_certificate(
                &self.persistence,
                self.issuer.as_ref(),
                &cert.domain,
            )
            .await
            {
                error!(
                    error = &err as &dyn std::error::Error,
                    domain = %cert.domain,
                    "certificate renewal failed"
                );
            }
        }

        Ok(())
    }

    pub async fn sweep_expired_challenges(&self) -> Result<()> {
        let deleted = self.persistence.delete_expired_challenges().await?;
        if deleted > 0 {
            info!(deleted, "removed expired acme challenges");
        }

        Ok(())
    }

    /// Backup-enabled services whose schedule elapsed get a snapshot per
    /// volume.
    pub async fn sweep_scheduled_backups(&self) -> Result<()> {
        let services = self.persistence.services().await?;

        for service in services {
            if !service.backup_enabled {
                continue;
            }
            let Some(expr) = &service.backup_schedule else {
                continue;
            };
            let Some(due) = last_occurrence(expr, Utc::now()) else {
                continue;
            };

            let backups = self
                .persistence
                .volume_backups_for_service(&service.id)
                .await?;
            let latest = backups.iter().find(|b| !b.is_migration_backup);
            if let Some(latest) = latest {
                if latest.created_at >= due {
                    continue;
                }
            }

            let volumes = self.persistence.service_volumes(&service.id).await?;
            for volume in volumes {
                if let Err(err) = self
                    .backups
                    .trigger(&service.id, &volume.id, None, false)
                    .await
                {
                    warn!(
                        error = %err,
                        service_id = %service.id,
                        volume = %volume.name,
                        "scheduled backup skipped"
                    );
                }
            }
        }

        Ok(())
    }

    /// Drops backups past the retention window. The object-storage side is
    /// pruned by the bucket's own lifecycle rule on the same window.
    pub async fn sweep_retention(&self) -> Result<()> {
        let expired = self
            .persistence
            .expired_backups(chrono::Duration::days(self.config.retention_days))
            .await?;

        for backup in expired {
            info!(backup_id = %backup.id, path = %backup.storage_path, "retiring backup");
            if let Err(err) = self.persistence.delete_volume_backup(&backup.id).await {
                error!(
                    error = &err as &dyn std::error::Error,
                    backup_id = %backup.id,
                    "failed to delete expired backup"
                );
            }
        }

        Ok(())
    }

    pub async fn sweep_stuck_items(&self) -> Result<()> {
        self.queue.requeue_stuck().await?;
        Ok(())
    }
}

/// The most recent time the cron expression fired at or before `now`.
pub(crate) fn last_occurrence(expr: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let schedule = crate::api::parse_schedule(expr)?;

    // Look back far enough for any sane schedule; anything rarer than
    // yearly is treated as never due.
    let lookback = now - chrono::Duration::days(366);
    schedule
        .after(&lookback)
        .take_while(|occurrence| *occurrence <= now)
        .last()
}

type SweepFuture = std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send>>;

fn spawn_interval(
    scheduler: Arc<Scheduler>,
    period: Duration,
    name: &'static str,
    sweep: fn(Arc<Scheduler>) -> SweepFuture,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = interval(period);
        loop {
            tick.tick().await;
            if let Err(err) = sweep(scheduler.clone()).await {
                error!(
                    error = &err as &dyn std::error::Error,
                    sweep = name,
                    "sweep failed"
                );
            }
        }
    })
}

fn spawn_daily(
    scheduler: Arc<Scheduler>,
    cron_expr: &'static str,
    name: &'static str,
    sweep: fn(Arc<Scheduler>) -> SweepFuture,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let schedule = cron::Schedule::from_str(cron_expr).expect("static cron expression");
        loop {
            let Some(next) = schedule.upcoming(Utc).next() else {
                break;
            };
            let wait = (next - Utc::now()).to_std().unwrap_or_default();
            tokio::time::sleep(wait).await;

            if let Err(err) = sweep(scheduler.clone()).await {
                error!(
                    error = &err as &dyn std::error::Error,
                    sweep = name,
                    "sweep failed"
                );
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_occurrence_of_six_hourly_schedule() {
        let now = DateTime::parse_from_rfc3339("2024-05-01T06:15:00Z")
            .unwrap()
            .with_timezone(&Utc);

        let due = last_occurrence("0 */6 * * *", now).unwrap();
        assert_eq!(
            due,
            DateTime::parse_from_rfc3339("2024-05-01T06:00:00Z").unwrap()
        );
    }

    #[test]
    fn malformed_schedule_is_never_due() {
        assert!(last_occurrence("not a cron", Utc::now()).is_none());
    }
}
