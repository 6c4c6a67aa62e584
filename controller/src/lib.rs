pub mod alerts;
pub mod allocator;
pub mod api;
pub mod args;
pub mod backup;
pub mod certificates;
pub mod config_diff;
pub mod error;
pub mod migration;
pub mod persistence;
pub mod placer;
pub mod rollout;
pub mod scheduler;
pub mod work_queue;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use flotilla_common::models::backup::StorageConfig;

use crate::alerts::{AlertSink, LogAlerts, WebhookAlerts};
use crate::allocator::Allocator;
use crate::api::{make_router, ApiConfig, ApiState};
use crate::args::Args;
use crate::backup::BackupEngine;
use crate::certificates::{CertificateIssuer, HttpCertificateIssuer, IssuedCertificate};
use crate::migration::MigrationEngine;
use crate::persistence::Persistence;
use crate::rollout::supervisor::ServiceSupervisor;
use crate::rollout::{EngineCtx, RolloutConfig, RolloutEngine};
use crate::scheduler::{Scheduler, SchedulerConfig};
use crate::work_queue::{QueueConfig, WorkQueue};

/// Stand-in issuer when no sidecar is configured; rollouts needing
/// certificates fail loudly instead of silently serving without TLS.
struct UnconfiguredIssuer;

#[async_trait]
impl CertificateIssuer for UnconfiguredIssuer {
    async fn issue(&self, domain: &str) -> certificates::Result<IssuedCertificate> {
        Err(certificates::Error::Issuance {
            domain: domain.to_string(),
            message: "no certificate issuer configured".to_string(),
        })
    }
}

/// Wire everything up and serve until the process is stopped.
pub async fn start(args: Args) -> error::Result<()> {
    let persistence = Persistence::new(&args.db_path).await?;

    let allocator = Allocator::new(persistence.clone(), args.container_net_base());

    let queue = WorkQueue::new(
        persistence.clone(),
        QueueConfig {
            max_attempts: args.work_item_max_attempts,
            backoff_step_secs: args.work_item_backoff_secs,
            stuck_after_secs: args.work_item_stuck_secs,
        },
    );

    let alerts: Arc<dyn AlertSink> = match &args.alert_webhook_url {
        Some(url) => Arc::new(WebhookAlerts::new(url.clone())),
        None => Arc::new(LogAlerts),
    };

    let issuer: Arc<dyn CertificateIssuer> = match &args.cert_issuer_url {
        Some(url) => Arc::new(HttpCertificateIssuer::new(url.clone())),
        None => {
            warn!("no certificate issuer configured; public domains will fail to roll out");
            Arc::new(UnconfiguredIssuer)
        }
    };

    let ctx = Arc::new(EngineCtx {
        persistence: persistence.clone(),
        allocator,
        queue: queue.clone(),
        issuer: issuer.clone(),
        alerts,
        config: RolloutConfig {
            health_check_timeout_secs: args.health_check_timeout_secs,
            dns_sync_timeout_secs: args.dns_sync_timeout_secs,
        },
    });

    let supervisor = ServiceSupervisor::default();
    let rollouts = RolloutEngine::new(ctx.clone(), supervisor.clone());

    let storage = StorageConfig {
        provider: args.storage_provider.clone(),
        bucket: args.storage_bucket.clone(),
        region: args.storage_region.clone(),
        endpoint: args.storage_endpoint.clone(),
        access_key: args.storage_access_key.clone(),
        secret_key: args.storage_secret_key.clone(),
    };
    let backups = BackupEngine::new(persistence.clone(), queue.clone(), storage);
    let migrations = MigrationEngine::new(ctx, backups.clone(), supervisor);

    // Re-enter whatever was mid-flight when the last controller stopped.
    let resumed = rollouts.resume_all().await?;
    let resumed_migrations = migrations.resume_all().await?;
    if resumed > 0 || resumed_migrations > 0 {
        info!(
            rollouts = resumed,
            migrations = resumed_migrations,
            "resumed in-flight work"
        );
    }

    let scheduler = Scheduler {
        persistence: persistence.clone(),
        queue: queue.clone(),
        rollouts: rollouts.clone(),
        backups: backups.clone(),
        issuer,
        config: SchedulerConfig {
            heartbeat_staleness_secs: args.heartbeat_staleness_secs,
            retention_days: args.backup_retention_days,
        },
    };
    let _sweeps = scheduler.spawn();

    let state = ApiState {
        persistence,
        queue,
        rollouts,
        migrations,
        backups,
        config: ApiConfig {
            public_url: args.public_url.clone(),
            ..ApiConfig::default()
        },
    };

    let router = make_router(state);
    info!(address = %args.api_address, "control plane listening");

    axum::Server::bind(&args.api_address)
        .serve(router.into_make_service())
        .await
        .map_err(|err| {
            error::Error::source(flotilla_common::models::error::ErrorKind::Internal, err)
        })
}
