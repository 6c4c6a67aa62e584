//! End-to-end engine scenarios driven against an in-memory store with a
//! scripted in-process agent standing in for the fleet.

use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use uuid::Uuid;

use flotilla_common::models::agent::{ReportKind, ReportRequest};
use flotilla_common::models::backup::StorageConfig;
use flotilla_common::models::work_item::WorkItemPayload;
use flotilla_common::validation::Hostname;

use flotilla_controller::alerts::{AlertSink, DeploymentFailure};
use flotilla_controller::allocator::Allocator;
use flotilla_controller::api::{apply_report, AuthenticatedServer};
use flotilla_controller::backup::BackupEngine;
use flotilla_controller::certificates::{CertificateIssuer, IssuedCertificate};
use flotilla_controller::migration::MigrationEngine;
use flotilla_controller::persistence::{
    DeploymentStatus, FailedStage, NewService, Persistence, RolloutStatus, Server,
};
use flotilla_controller::rollout::supervisor::ServiceSupervisor;
use flotilla_controller::rollout::{EngineCtx, RolloutConfig, RolloutEngine};
use flotilla_controller::work_queue::{QueueConfig, WorkQueue};

const TEST_TIMEOUT: Duration = Duration::from_secs(30);

struct RecordingAlerts {
    failures: Mutex<Vec<DeploymentFailure>>,
}

#[async_trait]
impl AlertSink for RecordingAlerts {
    async fn notify_deployment_failure(&self, failure: &DeploymentFailure) {
        self.failures.lock().unwrap().push(failure.clone());
    }
}

struct OkIssuer;

#[async_trait]
impl CertificateIssuer for OkIssuer {
    async fn issue(&self, domain: &str) -> flotilla_controller::certificates::Result<IssuedCertificate> {
        Ok(IssuedCertificate {
            certificate_pem: format!("CERT {domain}"),
            private_key_pem: "KEY".to_string(),
            expires_at: Utc::now() + chrono::Duration::days(90),
        })
    }
}

struct Harness {
    persistence: Persistence,
    queue: WorkQueue,
    rollouts: RolloutEngine,
    migrations: MigrationEngine,
    backups: BackupEngine,
    alerts: Arc<RecordingAlerts>,
}

async fn harness(config: RolloutConfig) -> Harness {
    let persistence = Persistence::new_in_memory().await.unwrap();
    let queue = WorkQueue::new(
        persistence.clone(),
        QueueConfig {
            max_attempts: 3,
            backoff_step_secs: 0,
            stuck_after_secs: 300,
        },
    );
    let alerts = Arc::new(RecordingAlerts {
        failures: Mutex::new(Vec::new()),
    });

    let ctx = Arc::new(EngineCtx {
        persistence: persistence.clone(),
        allocator: Allocator::new(persistence.clone(), (10, 100)),
        queue: queue.clone(),
        issuer: Arc::new(OkIssuer),
        alerts: alerts.clone(),
        config,
    });

    let supervisor = ServiceSupervisor::default();
    let rollouts = RolloutEngine::new(ctx.clone(), supervisor.clone());
    let backups = BackupEngine::new(
        persistence.clone(),
        queue.clone(),
        StorageConfig {
            provider: "s3".into(),
            bucket: "test".into(),
            region: "us-east-1".into(),
            endpoint: None,
            access_key: "AK".into(),
            secret_key: "SK".into(),
        },
    );
    let migrations = MigrationEngine::new(ctx, backups.clone(), supervisor);

    Harness {
        persistence,
        queue,
        rollouts,
        migrations,
        backups,
        alerts,
    }
}

async fn online_server(h: &Harness, name: &str, octet: u8) -> Server {
    let server = h
        .persistence
        .insert_server(
            name,
            Some(Ipv4Addr::new(10, 8, 0, octet)),
            false,
            &format!("reg-{name}"),
            chrono::Duration::hours(24),
        )
        .await
        .unwrap();

    h.persistence
        .record_heartbeat(
            &server.id,
            &flotilla_common::models::agent::ServerResources {
                cpus: 4,
                mem_mb: 8192,
                disk_gb: 100,
            },
            &serde_json::json!({}),
        )
        .await
        .unwrap();

    h.persistence.server(&server.id).await.unwrap()
}

/// What the scripted agent does with deploy items. Container names end in
/// `-<ordinal>`, so suffixes select replicas deterministically.
#[derive(Clone, Default)]
struct AgentScript {
    /// Deploy items whose container name ends with this never get a health
    /// report.
    ignore_deploys_ending: Option<String>,
    /// Deploy items whose container name ends with this report failure.
    fail_deploys_ending: Option<String>,
}

fn report(kind: ReportKind) -> ReportRequest {
    ReportRequest {
        kind,
        deployment_id: None,
        backup_id: None,
        container_id: None,
        timestamp: Utc::now(),
        checksum: None,
        size_bytes: None,
        error_message: None,
    }
}

/// Claims and executes work for one server until aborted, confirming DNS
/// sync on every pass like the real agent does after table rewrites.
fn spawn_agent(h: &Harness, server: Server, script: AgentScript) -> JoinHandle<()> {
    let persistence = h.persistence.clone();
    let queue = h.queue.clone();

    tokio::spawn(async move {
        let caller = AuthenticatedServer(server.clone());

        loop {
            let items = queue.claim(&server.id, 10).await.unwrap_or_default();

            for item in items {
                let Ok(payload) = item.typed_payload() else {
                    continue;
                };

                match payload {
                    WorkItemPayload::Deploy(deploy) => {
                        let matches = |needle: &Option<String>| {
                            needle
                                .as_ref()
                                .is_some_and(|needle| deploy.name.ends_with(needle.as_str()))
                        };

                        if matches(&script.ignore_deploys_ending) {
                            continue;
                        }

                        if matches(&script.fail_deploys_ending) {
                            let mut request = report(ReportKind::DeploymentFailed);
                            request.deployment_id = Some(deploy.deployment_id);
                            request.error_message = Some("image pull failed".to_string());
                            let _ = apply_report(&persistence, &queue, &caller, &request).await;
                            continue;
                        }

                        let mut request = report(ReportKind::DeploymentHealthy);
                        request.deployment_id = Some(deploy.deployment_id);
                        request.container_id = Some(format!("c-{}", deploy.name));
                        let _ = apply_report(&persistence, &queue, &caller, &request).await;
                    }
                    WorkItemPayload::Stop(stop) => {
                        let mut request = report(ReportKind::DeploymentStopped);
                        request.deployment_id = Some(stop.deployment_id);
                        let _ = apply_report(&persistence, &queue, &caller, &request).await;
                    }
                    WorkItemPayload::BackupVolume(backup) => {
                        let mut request = report(ReportKind::BackupCompleted);
                        request.backup_id = Some(backup.backup_id);
                        request.checksum = Some("sha256:test".to_string());
                        request.size_bytes = Some(4096);
                        let _ = apply_report(&persistence, &queue, &caller, &request).await;
                    }
                    WorkItemPayload::RestoreVolume(restore) => {
                        let mut request = report(ReportKind::RestoreCompleted);
                        request.backup_id = Some(restore.backup_id);
                        let _ = apply_report(&persistence, &queue, &caller, &request).await;
                    }
                    WorkItemPayload::ForceCleanup(_)
                    | WorkItemPayload::CleanupVolumes(_)
                    | WorkItemPayload::Build(_) => {
                        let _ = queue.complete(&item.id).await;
                    }
                }
            }

            let _ = apply_report(&persistence, &queue, &caller, &report(ReportKind::ServerDnsSynced))
                .await;

            sleep(Duration::from_millis(100)).await;
        }
    })
}

async fn make_service(h: &Harness, hostname: &str, replicas: i64, stateful: bool) -> Uuid {
    let service = h
        .persistence
        .insert_service(NewService {
            project_id: Uuid::new_v4(),
            env_id: Uuid::new_v4(),
            name: hostname.to_string(),
            hostname: Hostname::new(hostname).unwrap(),
            image: "ghcr.io/acme/api:v1".to_string(),
            replicas,
            stateful,
            auto_place: !stateful,
        })
        .await
        .unwrap();

    service.id
}

async fn run_rollout(h: &Harness, service_id: &Uuid) -> RolloutStatus {
    let (rollout, handle) = h.rollouts.start(service_id).await.unwrap();
    timeout(TEST_TIMEOUT, handle.done())
        .await
        .expect("rollout job hung");
    h.persistence.rollout(&rollout.id).await.unwrap().status
}

#[tokio::test]
async fn rolling_update_happy_path() {
    let h = harness(RolloutConfig::default()).await;
    let server = online_server(&h, "s1", 2).await;
    let service_id = make_service(&h, "api", 2, false).await;

    h.persistence
        .replace_service_ports(&service_id, &[(8080, false, None, "http".into(), false)])
        .await
        .unwrap();

    let agent = spawn_agent(&h, server.clone(), AgentScript::default());

    // First rollout: fresh deploy, no draining involved.
    let status = run_rollout(&h, &service_id).await;
    assert_eq!(status, RolloutStatus::Completed);

    let running = h
        .persistence
        .deployments_with_status(&service_id, &[DeploymentStatus::Running])
        .await
        .unwrap();
    assert_eq!(running.len(), 2);
    let first_generation: Vec<Uuid> = running.iter().map(|d| d.id).collect();

    // The user bumps the image tag; the next rollout is a rolling update.
    let mut service = h.persistence.service(&service_id).await.unwrap();
    service.image = "ghcr.io/acme/api:v2".to_string();
    h.persistence.update_service(&service).await.unwrap();

    let (rollout, handle) = h.rollouts.start(&service_id).await.unwrap();
    timeout(TEST_TIMEOUT, handle.done())
        .await
        .expect("rollout job hung");

    let rollout = h.persistence.rollout(&rollout.id).await.unwrap();
    assert_eq!(rollout.status, RolloutStatus::Completed);
    assert!(rollout.is_rolling_update);
    assert!(rollout.completed_at.is_some());

    let deployments = h
        .persistence
        .deployments_for_service(&service_id)
        .await
        .unwrap();

    let running: Vec<_> = deployments
        .iter()
        .filter(|d| d.status == DeploymentStatus::Running)
        .collect();
    assert_eq!(running.len(), 2);
    for deployment in &running {
        assert_eq!(deployment.image, "ghcr.io/acme/api:v2");
        assert!(!first_generation.contains(&deployment.id));
    }

    // The old generation stops once the agent works through its stop items;
    // the rows survive until the next fresh-deploy purge.
    timeout(TEST_TIMEOUT, async {
        loop {
            let stopped = h
                .persistence
                .deployments_with_status(&service_id, &[DeploymentStatus::Stopped])
                .await
                .unwrap();
            if stopped.len() == 2 {
                break;
            }
            sleep(Duration::from_millis(100)).await;
        }
    })
    .await
    .expect("old generation never stopped");

    // Snapshot taken: no pending changes remain.
    let service = h.persistence.service(&service_id).await.unwrap();
    assert!(service.deployed_config.is_some());

    agent.abort();
}

#[tokio::test]
async fn health_check_timeout_rolls_back_and_alerts() {
    let h = harness(RolloutConfig {
        health_check_timeout_secs: 2,
        dns_sync_timeout_secs: 60,
    })
    .await;
    let server = online_server(&h, "s1", 2).await;
    let service_id = make_service(&h, "api", 2, false).await;

    let agent = spawn_agent(&h, server.clone(), AgentScript::default());
    assert_eq!(run_rollout(&h, &service_id).await, RolloutStatus::Completed);
    agent.abort();

    let old_running: Vec<Uuid> = h
        .persistence
        .deployments_with_status(&service_id, &[DeploymentStatus::Running])
        .await
        .unwrap()
        .iter()
        .map(|d| d.id)
        .collect();
    assert_eq!(old_running.len(), 2);

    // Second generation: one replica never reports healthy.
    let agent = spawn_agent(
        &h,
        server.clone(),
        AgentScript {
            // Ordinals continue across generations: the first rollout used
            // `-0`/`-1`, so the second new generation is `-2`/`-3`.
            ignore_deploys_ending: Some("-3".to_string()),
            ..AgentScript::default()
        },
    );

    let (rollout, handle) = h.rollouts.start(&service_id).await.unwrap();
    timeout(TEST_TIMEOUT, handle.done())
        .await
        .expect("rollout job hung");
    agent.abort();

    let rollout = h.persistence.rollout(&rollout.id).await.unwrap();
    assert_eq!(rollout.status, RolloutStatus::RolledBack);
    assert_eq!(rollout.failed_stage, Some(FailedStage::HealthCheckTimeout));

    // The drained old replicas never stopped serving and are running again.
    let running: Vec<Uuid> = h
        .persistence
        .deployments_with_status(&service_id, &[DeploymentStatus::Running])
        .await
        .unwrap()
        .iter()
        .map(|d| d.id)
        .collect();
    assert_eq!(running, old_running);

    // The new generation is rolled back with the failure stage recorded.
    let new_rows = h
        .persistence
        .deployments_for_rollout(&rollout.id)
        .await
        .unwrap();
    assert_eq!(new_rows.len(), 2);
    for deployment in &new_rows {
        assert_eq!(deployment.status, DeploymentStatus::RolledBack);
        assert_eq!(deployment.failed_stage, Some(FailedStage::HealthCheckTimeout));
    }

    let alerts = h.alerts.failures.lock().unwrap();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].service_id, service_id);
    assert_eq!(alerts[0].failed_stage, FailedStage::HealthCheckTimeout);
}

#[tokio::test]
async fn allocator_exhaustion_fails_before_any_insert() {
    let h = harness(RolloutConfig::default()).await;
    let server = online_server(&h, "s1", 2).await;
    let service_id = make_service(&h, "api", 2, false).await;

    h.persistence
        .replace_service_ports(&service_id, &[(8080, false, None, "http".into(), false)])
        .await
        .unwrap();

    let agent = spawn_agent(&h, server.clone(), AgentScript::default());
    assert_eq!(run_rollout(&h, &service_id).await, RolloutStatus::Completed);
    agent.abort();

    // Burn the free port range down to a single port; the next rollout
    // needs two.
    let used = h.persistence.used_host_ports(&server.id).await.unwrap();
    let free: Vec<u16> = (30000..=32767u16).filter(|p| !used.contains(p)).collect();

    let filler = Uuid::new_v4();
    let mut tx = h.persistence.pool().begin().await.unwrap();
    let now = Utc::now();
    sqlx::query(
        "INSERT INTO deployments (id, service_id, server_id, container_name, image, ip_address, status, created_at, updated_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(filler)
    .bind(service_id)
    .bind(server.id)
    .bind("exhaustion-fixture")
    .bind("redis")
    .bind(std::net::Ipv4Addr::new(192, 0, 2, 9).to_string())
    .bind("stopped")
    .bind(now)
    .bind(now)
    .execute(&mut *tx)
    .await
    .unwrap();
    for (seq, port) in free.iter().take(free.len() - 1).enumerate() {
        sqlx::query(
            "INSERT INTO deployment_ports (deployment_id, server_id, container_port, host_port)
             VALUES (?, ?, ?, ?)",
        )
        .bind(filler)
        .bind(server.id)
        .bind(seq as i64)
        .bind(*port as i64)
        .execute(&mut *tx)
        .await
        .unwrap();
    }
    tx.commit().await.unwrap();

    let (rollout, handle) = h.rollouts.start(&service_id).await.unwrap();
    timeout(TEST_TIMEOUT, handle.done())
        .await
        .expect("rollout job hung");

    let rollout = h.persistence.rollout(&rollout.id).await.unwrap();
    assert_eq!(rollout.status, RolloutStatus::RolledBack);
    assert_eq!(rollout.failed_stage, Some(FailedStage::InsufficientCapacity));

    // Failure struck during preparing: nothing was drained, nothing was
    // inserted for this rollout.
    assert!(h
        .persistence
        .deployments_for_rollout(&rollout.id)
        .await
        .unwrap()
        .is_empty());
    assert_eq!(
        h.persistence
            .deployments_with_status(&service_id, &[DeploymentStatus::Running])
            .await
            .unwrap()
            .len(),
        2
    );
    assert!(h
        .persistence
        .deployments_with_status(&service_id, &[DeploymentStatus::Draining])
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn abort_before_running_restores_previous_set() {
    let h = harness(RolloutConfig::default()).await;
    let server = online_server(&h, "s1", 2).await;
    let service_id = make_service(&h, "api", 2, false).await;

    let agent = spawn_agent(&h, server.clone(), AgentScript::default());
    assert_eq!(run_rollout(&h, &service_id).await, RolloutStatus::Completed);
    agent.abort();

    let before: Vec<Uuid> = h
        .persistence
        .deployments_with_status(&service_id, &[DeploymentStatus::Running])
        .await
        .unwrap()
        .iter()
        .map(|d| d.id)
        .collect();

    // No agent running: the new deployments never leave pending.
    let (rollout, handle) = h.rollouts.start(&service_id).await.unwrap();

    // Give the engine time to reach the health gate, then pull the plug.
    sleep(Duration::from_millis(1500)).await;
    h.rollouts.abort(&rollout.id).await.unwrap();
    timeout(TEST_TIMEOUT, handle.done())
        .await
        .expect("rollout job hung");

    let rollout = h.persistence.rollout(&rollout.id).await.unwrap();
    assert_eq!(rollout.status, RolloutStatus::RolledBack);
    assert_eq!(rollout.failed_stage, Some(FailedStage::Aborted));

    let after: Vec<Uuid> = h
        .persistence
        .deployments_with_status(&service_id, &[DeploymentStatus::Running])
        .await
        .unwrap()
        .iter()
        .map(|d| d.id)
        .collect();
    assert_eq!(after, before);
}

#[tokio::test]
async fn stateful_migration_moves_the_service() {
    let h = harness(RolloutConfig::default()).await;
    let s1 = online_server(&h, "s1", 2).await;
    let service_id = make_service(&h, "db", 1, true).await;

    h.persistence
        .replace_service_volumes(&service_id, &[("data".into(), "/var/lib/data".into())])
        .await
        .unwrap();

    // Only s1 is enrolled for the first rollout, so the service pins there.
    let agent1 = spawn_agent(&h, s1.clone(), AgentScript::default());
    assert_eq!(run_rollout(&h, &service_id).await, RolloutStatus::Completed);

    let service = h.persistence.service(&service_id).await.unwrap();
    assert_eq!(service.locked_server_id, Some(s1.id));

    let s2 = online_server(&h, "s2", 3).await;
    let agent2 = spawn_agent(&h, s2.clone(), AgentScript::default());

    let handle = h.migrations.start(&service_id, &s2.id).await.unwrap();
    timeout(TEST_TIMEOUT, handle.done())
        .await
        .expect("migration job hung");

    let service = h.persistence.service(&service_id).await.unwrap();
    assert_eq!(service.locked_server_id, Some(s2.id));
    assert_eq!(service.migration_status, None);

    let running = h
        .persistence
        .deployments_with_status(&service_id, &[DeploymentStatus::Running])
        .await
        .unwrap();
    assert_eq!(running.len(), 1);
    assert_eq!(running[0].server_id, s2.id);

    // The snapshot that carried the data is marked as a migration backup.
    let backups = h
        .persistence
        .latest_migration_backups(&service_id)
        .await
        .unwrap();
    assert_eq!(backups.len(), 1);
    assert_eq!(
        backups[0].status,
        flotilla_controller::persistence::BackupStatus::Completed
    );

    agent1.abort();
    agent2.abort();
}

#[tokio::test]
async fn replayed_terminal_callbacks_are_discarded() {
    let h = harness(RolloutConfig::default()).await;
    let server = online_server(&h, "s1", 2).await;
    let service_id = make_service(&h, "api", 1, false).await;

    let deployment = h
        .persistence
        .insert_deployment(flotilla_controller::persistence::NewDeployment {
            service_id,
            server_id: server.id,
            rollout_id: None,
            previous_deployment_id: None,
            container_name: "api-0".into(),
            image: "redis".into(),
            ip_address: Ipv4Addr::new(10, 100, 2, 2),
            ports: vec![],
        })
        .await
        .unwrap();

    let caller = AuthenticatedServer(server.clone());
    let mut healthy = report(ReportKind::DeploymentHealthy);
    healthy.deployment_id = Some(deployment.id);
    healthy.container_id = Some("c-api-0".into());

    apply_report(&h.persistence, &h.queue, &caller, &healthy)
        .await
        .unwrap();
    let after_first = h.persistence.deployment(&deployment.id).await.unwrap();
    assert_eq!(after_first.status, DeploymentStatus::Healthy);

    // The engine moved it on; a replayed healthy callback must not yank it
    // back.
    h.persistence
        .update_deployment_status(&deployment.id, DeploymentStatus::Running)
        .await
        .unwrap();

    apply_report(&h.persistence, &h.queue, &caller, &healthy)
        .await
        .unwrap();
    assert_eq!(
        h.persistence.deployment(&deployment.id).await.unwrap().status,
        DeploymentStatus::Running
    );
}

fn scheduler_for(h: &Harness) -> flotilla_controller::scheduler::Scheduler {
    flotilla_controller::scheduler::Scheduler {
        persistence: h.persistence.clone(),
        queue: h.queue.clone(),
        rollouts: h.rollouts.clone(),
        backups: h.backups.clone(),
        issuer: Arc::new(OkIssuer),
        config: flotilla_controller::scheduler::SchedulerConfig {
            heartbeat_staleness_secs: 90,
            retention_days: 14,
        },
    }
}

#[tokio::test]
async fn stale_server_sweep_starts_a_recovery_rollout() {
    let h = harness(RolloutConfig::default()).await;
    let s1 = online_server(&h, "s1", 2).await;
    let s2 = online_server(&h, "s2", 3).await;
    let service_id = make_service(&h, "api", 2, false).await;

    let agent1 = spawn_agent(&h, s1.clone(), AgentScript::default());
    let agent2 = spawn_agent(&h, s2.clone(), AgentScript::default());

    assert_eq!(run_rollout(&h, &service_id).await, RolloutStatus::Completed);

    // s1 dies: its agent stops and its heartbeat goes stale.
    agent1.abort();
    sqlx::query("UPDATE servers SET last_heartbeat = ? WHERE id = ?")
        .bind(Utc::now() - chrono::Duration::seconds(300))
        .bind(s1.id)
        .execute(h.persistence.pool())
        .await
        .unwrap();

    let scheduler = scheduler_for(&h);
    scheduler.sweep_stale_servers().await.unwrap();

    assert_eq!(
        h.persistence.server(&s1.id).await.unwrap().status,
        flotilla_controller::persistence::ServerStatus::Offline
    );

    // The sweep kicked off a recovery rollout; it lands everything on s2.
    timeout(TEST_TIMEOUT, async {
        loop {
            let rollouts = h.persistence.rollouts_for_service(&service_id).await.unwrap();
            if rollouts.len() == 2 && rollouts[0].status == RolloutStatus::Completed {
                break;
            }
            sleep(Duration::from_millis(100)).await;
        }
    })
    .await
    .expect("recovery rollout never completed");

    let running = h
        .persistence
        .deployments_with_status(&service_id, &[DeploymentStatus::Running])
        .await
        .unwrap();
    assert_eq!(running.len(), 2);
    assert!(running.iter().all(|d| d.server_id == s2.id));

    agent2.abort();
}

#[tokio::test]
async fn retention_sweep_drops_old_backups() {
    let h = harness(RolloutConfig::default()).await;
    let server = online_server(&h, "s1", 2).await;
    let service_id = make_service(&h, "db", 1, true).await;
    h.persistence
        .replace_service_volumes(&service_id, &[("data".into(), "/data".into())])
        .await
        .unwrap();
    let volume = h
        .persistence
        .service_volumes(&service_id)
        .await
        .unwrap()
        .remove(0);

    let backup = h
        .persistence
        .insert_volume_backup(
            &Uuid::new_v4(),
            &volume.id,
            &service_id,
            &server.id,
            "backups/old",
            false,
        )
        .await
        .unwrap();

    // Fresh backup survives the sweep.
    let scheduler = scheduler_for(&h);
    scheduler.sweep_retention().await.unwrap();
    assert!(h.persistence.volume_backup(&backup.id).await.is_ok());

    sqlx::query("UPDATE volume_backups SET created_at = ? WHERE id = ?")
        .bind(Utc::now() - chrono::Duration::days(30))
        .bind(backup.id)
        .execute(h.persistence.pool())
        .await
        .unwrap();

    scheduler.sweep_retention().await.unwrap();
    assert!(h.persistence.volume_backup(&backup.id).await.is_err());
}

#[tokio::test]
async fn backup_trigger_and_agent_completion() {
    let h = harness(RolloutConfig::default()).await;
    let server = online_server(&h, "s1", 2).await;
    let service_id = make_service(&h, "db", 1, true).await;

    h.persistence
        .replace_service_volumes(&service_id, &[("data".into(), "/data".into())])
        .await
        .unwrap();

    let agent = spawn_agent(&h, server.clone(), AgentScript::default());
    assert_eq!(run_rollout(&h, &service_id).await, RolloutStatus::Completed);

    let volume = h
        .persistence
        .service_volumes(&service_id)
        .await
        .unwrap()
        .remove(0);
    let backup = h
        .backups
        .trigger(&service_id, &volume.id, None, false)
        .await
        .unwrap();

    // The agent picks the item up and reports checksum and size.
    let completed = timeout(TEST_TIMEOUT, async {
        loop {
            let backup = h.persistence.volume_backup(&backup.id).await.unwrap();
            if backup.status == flotilla_controller::persistence::BackupStatus::Completed {
                return backup;
            }
            sleep(Duration::from_millis(100)).await;
        }
    })
    .await
    .expect("backup never completed");

    assert_eq!(completed.checksum.as_deref(), Some("sha256:test"));
    assert_eq!(completed.size_bytes, Some(4096));
    assert!(completed.completed_at.is_some());

    agent.abort();
}
