use std::collections::{BTreeMap, HashMap};

use chrono::{Duration, Utc};
use flotilla_common::image::ImageReference;
use flotilla_common::models::work_item::{
    DeployPayload, ForceCleanupPayload, PortMapping, StopPayload, VolumeMount, WorkItemPayload,
};
use tracing::{info, warn};
use uuid::Uuid;

use crate::allocator;
use crate::alerts::DeploymentFailure;
use crate::config_diff;
use crate::certificates::ensure_certificate;
use crate::error::{Error, Result};
use crate::persistence::{
    Deployment, DeploymentStatus, FailedStage, Rollout, RolloutStage, Server, Service,
};
use crate::placer::{self, Candidate, Placement, PlacementRequest};
use flotilla_common::models::error::ErrorKind;

use super::engine::EngineCtx;

/// What a stage decided on this poll.
#[derive(Debug)]
pub(crate) enum StageOutcome {
    /// Commit the transition to the given stage; `Completed` finishes the
    /// rollout.
    Advance(RolloutStage),
    /// Waiting on agent callbacks; poll again later.
    Wait,
    /// Give up and run compensation.
    Fail(FailedStage),
}

/// Runs the rollout's current stage once. Every stage is idempotent: a
/// re-entered stage observes the rows committed by a previous attempt and
/// only does the remaining work.
pub(crate) async fn run_stage(ctx: &EngineCtx, rollout: &Rollout) -> Result<StageOutcome> {
    match rollout.current_stage {
        RolloutStage::Preparing => prepare(ctx, rollout).await,
        RolloutStage::Certificates => certificates(ctx, rollout).await,
        RolloutStage::Deploying => deploying(ctx, rollout).await,
        RolloutStage::HealthCheck => health_check(ctx, rollout).await,
        RolloutStage::DnsSync => dns_sync(ctx, rollout).await,
        RolloutStage::Completed | RolloutStage::RolledBack => {
            // Terminal stages never run; the task short-circuits on status.
            Ok(StageOutcome::Wait)
        }
    }
}

/// Placement plus capacity validation against the live fleet.
async fn compute_placements(
    ctx: &EngineCtx,
    service: &Service,
) -> Result<std::result::Result<Vec<Placement>, FailedStage>> {
    let loads: HashMap<Uuid, i64> = ctx
        .persistence
        .active_deployment_counts()
        .await?
        .into_iter()
        .collect();

    let candidates: Vec<Candidate> = ctx
        .persistence
        .online_servers()
        .await?
        .into_iter()
        .filter(Server::is_deployable)
        .map(|server| Candidate {
            id: server.id,
            load: loads.get(&server.id).copied().unwrap_or(0),
        })
        .collect();

    let explicit = ctx
        .persistence
        .service_replicas(&service.id)
        .await?
        .into_iter()
        .map(|row| (row.server_id, row.count as u32))
        .collect();

    let request = PlacementRequest {
        replicas: service.replicas as u32,
        stateful: service.stateful,
        auto_place: service.auto_place,
        locked_server_id: service.locked_server_id,
        explicit,
    };

    match placer::place(&request, &candidates) {
        Ok(placements) => Ok(Ok(placements)),
        Err(placer::Error::InsufficientCapacity) => {
            Ok(Err(FailedStage::InsufficientCapacity))
        }
    }
}

/// Stage 1: placements, capacity pre-checks and the pre-cutover move. No
/// deployment row exists yet, so a failure here leaves the service exactly as
/// it was.
async fn prepare(ctx: &EngineCtx, rollout: &Rollout) -> Result<StageOutcome> {
    let service = ctx.persistence.service(&rollout.service_id).await?;

    let placements = match compute_placements(ctx, &service).await? {
        Ok(placements) => placements,
        Err(failed) => return Ok(StageOutcome::Fail(failed)),
    };

    let ports_per_replica = ctx.persistence.service_ports(&service.id).await?.len();

    for placement in &placements {
        let server = match ctx.persistence.server(&placement.server_id).await {
            Ok(server) if server.is_deployable() => server,
            _ => {
                warn!(server_id = %placement.server_id, "placement targets an unusable server");
                return Ok(StageOutcome::Fail(FailedStage::InsufficientCapacity));
            }
        };

        // Probe allocations without reserving anything; reservation happens
        // with the row inserts in the deploying stage.
        let wanted_ports = ports_per_replica * placement.count as usize;
        if wanted_ports > 0 {
            match ctx
                .allocator
                .allocate_host_ports(&server.id, wanted_ports)
                .await
            {
                Ok(_) => {}
                Err(allocator::Error::Exhausted(_)) => {
                    return Ok(StageOutcome::Fail(FailedStage::InsufficientCapacity));
                }
                Err(err) => return Err(Error::source(ErrorKind::Internal, err)),
            }
        }

        let used_ips = ctx.persistence.used_container_ips(&server.id).await?.len();
        if used_ips + placement.count as usize > 253 {
            return Ok(StageOutcome::Fail(FailedStage::InsufficientCapacity));
        }
    }

    let running = ctx
        .persistence
        .deployments_with_status(
            &service.id,
            &[DeploymentStatus::Running, DeploymentStatus::Healthy],
        )
        .await?;
    let is_rolling_update = !service.stateful && !running.is_empty();

    ctx.persistence
        .set_rollout_rolling_update(&rollout.id, is_rolling_update)
        .await?;

    if is_rolling_update {
        // Old replicas keep serving traffic until the new set is healthy.
        let drained = ctx
            .persistence
            .transition_deployments(
                &service.id,
                &[DeploymentStatus::Running, DeploymentStatus::Healthy],
                DeploymentStatus::Draining,
            )
            .await?;
        info!(rollout_id = %rollout.id, count = drained.len(), "marked old deployments draining");
    } else {
        // Fresh deploy: clear out every non-running prior row so its port
        // and address reservations cannot collide with the new replicas.
        let purged = ctx
            .persistence
            .purge_non_running_deployments(&service.id)
            .await?;
        if purged > 0 {
            info!(rollout_id = %rollout.id, purged, "purged prior deployments");
        }
    }

    Ok(StageOutcome::Advance(RolloutStage::Certificates))
}

/// Stage 2: every public port with a domain needs a live certificate before
/// traffic can cut over to it.
async fn certificates(ctx: &EngineCtx, rollout: &Rollout) -> Result<StageOutcome> {
    let ports = ctx.persistence.service_ports(&rollout.service_id).await?;

    for port in ports.iter().filter(|p| p.is_public) {
        let Some(domain) = &port.domain else { continue };

        if let Err(err) = ensure_certificate(&ctx.persistence, ctx.issuer.as_ref(), domain).await
        {
            warn!(
                error = &err as &dyn std::error::Error,
                domain, "certificate provisioning failed"
            );
            return Ok(StageOutcome::Fail(FailedStage::CertificateProvisioningFailed));
        }
    }

    Ok(StageOutcome::Advance(RolloutStage::Deploying))
}

/// Stage 3: materialise the new deployment rows (which reserves ports and
/// addresses) and hand the imperative work to the agents. The canonical
/// config snapshot lands after the rows are persisted and before any agent
/// callback can complete the rollout.
async fn deploying(ctx: &EngineCtx, rollout: &Rollout) -> Result<StageOutcome> {
    let service = ctx.persistence.service(&rollout.service_id).await?;
    let volumes = ctx.persistence.service_volumes(&service.id).await?;
    let secrets = ctx.persistence.secrets(&service.id).await?;

    let image = match service.image.parse::<ImageReference>() {
        Ok(image) => image.qualified(),
        Err(err) => {
            warn!(error = %err, "declared image does not parse");
            return Ok(StageOutcome::Fail(FailedStage::DeployFailed));
        }
    };

    let placements = match compute_placements(ctx, &service).await? {
        Ok(placements) => placements,
        Err(failed) => return Ok(StageOutcome::Fail(failed)),
    };

    let existing = ctx.persistence.deployments_for_rollout(&rollout.id).await?;

    // Ordinals count every row of the service, not just this rollout's, so a
    // new generation never reuses a draining container's name on the server.
    let mut ordinal = ctx
        .persistence
        .deployments_for_service(&service.id)
        .await?
        .len() as u32;

    let env: BTreeMap<String, String> = secrets
        .into_iter()
        .map(|secret| (secret.key, secret.encrypted_value))
        .collect();
    let volume_mounts: Vec<VolumeMount> = volumes
        .iter()
        .map(|v| VolumeMount {
            name: v.name.clone(),
            container_path: v.container_path.clone(),
        })
        .collect();

    for placement in &placements {
        let server = ctx.persistence.server(&placement.server_id).await?;

        let already_placed = existing
            .iter()
            .filter(|d| d.server_id == placement.server_id)
            .count() as u32;

        for _ in already_placed..placement.count {
            match provision_replica(ctx, &service, &server, Some(rollout.id), ordinal).await? {
                Ok(_) => ordinal += 1,
                Err(failed) => return Ok(StageOutcome::Fail(failed)),
            }
        }
    }

    // Re-enqueue for rows whose items were lost before ever reaching an
    // agent; the per-deployment dedup makes this a no-op normally.
    for deployment in &existing {
        if deployment.status == DeploymentStatus::Pending {
            let payload = deploy_payload_for(ctx, &service, deployment, &image, &env, &volume_mounts)
                .await?;
            ctx.queue.enqueue(&deployment.server_id, payload).await?;
        }
    }

    let snapshot = canonical_config(ctx, &service).await?;
    ctx.persistence
        .set_deployed_config(
            &service.id,
            &serde_json::to_value(&snapshot)
                .map_err(|err| Error::source(ErrorKind::Internal, err))?,
        )
        .await?;

    Ok(StageOutcome::Advance(RolloutStage::HealthCheck))
}

/// Allocate, persist and enqueue one replica on a server. Used by the
/// deploying stage for each missing replica and by the migration engine for
/// the fresh replica on the target server. A capacity miss is a stage-level
/// failure, not an error.
pub(crate) async fn provision_replica(
    ctx: &EngineCtx,
    service: &Service,
    server: &Server,
    rollout_id: Option<Uuid>,
    ordinal: u32,
) -> Result<std::result::Result<Deployment, FailedStage>> {
    let ports = ctx.persistence.service_ports(&service.id).await?;
    let secrets = ctx.persistence.secrets(&service.id).await?;
    let volumes = ctx.persistence.service_volumes(&service.id).await?;

    let image = match service.image.parse::<ImageReference>() {
        Ok(image) => image.qualified(),
        Err(err) => {
            warn!(error = %err, "declared image does not parse");
            return Ok(Err(FailedStage::DeployFailed));
        }
    };

    let wireguard_ip = server.wireguard_addr().ok_or_else(|| {
        Error::custom(ErrorKind::Internal, "deployable server lost its mesh address")
    })?;

    let host_ports = match ctx.allocator.allocate_host_ports(&server.id, ports.len()).await {
        Ok(host_ports) => host_ports,
        Err(allocator::Error::Exhausted(_)) => {
            return Ok(Err(FailedStage::InsufficientCapacity));
        }
        Err(err) => return Err(Error::source(ErrorKind::Internal, err)),
    };
    let ip_address = match ctx.allocator.allocate_container_ip(server).await {
        Ok(ip) => ip,
        Err(allocator::Error::Exhausted(_)) => {
            return Ok(Err(FailedStage::InsufficientCapacity));
        }
        Err(err) => return Err(Error::source(ErrorKind::Internal, err)),
    };

    let port_pairs: Vec<(u16, u16)> = ports
        .iter()
        .zip(host_ports.iter())
        .map(|(service_port, host_port)| (service_port.port as u16, *host_port))
        .collect();

    let deployment = ctx
        .persistence
        .insert_deployment(crate::persistence::NewDeployment {
            service_id: service.id,
            server_id: server.id,
            rollout_id,
            previous_deployment_id: None,
            container_name: format!("{}-{ordinal}", service.id),
            image: image.clone(),
            ip_address,
            ports: port_pairs.clone(),
        })
        .await?;

    let payload = WorkItemPayload::Deploy(DeployPayload {
        deployment_id: deployment.id,
        service_id: service.id,
        service_name: service.name.clone(),
        image,
        port_mappings: port_pairs
            .iter()
            .map(|(container_port, host_port)| PortMapping {
                container_port: *container_port,
                host_port: *host_port,
            })
            .collect(),
        wireguard_ip,
        ip_address,
        name: deployment.container_name.clone(),
        health_check: Some(service.health_check_spec()),
        env: secrets
            .into_iter()
            .map(|secret| (secret.key, secret.encrypted_value))
            .collect(),
        volume_mounts: volumes
            .iter()
            .map(|v| VolumeMount {
                name: v.name.clone(),
                container_path: v.container_path.clone(),
            })
            .collect(),
    });
    ctx.queue.enqueue(&server.id, payload).await?;

    Ok(Ok(deployment))
}

async fn deploy_payload_for(
    ctx: &EngineCtx,
    service: &Service,
    deployment: &Deployment,
    image: &str,
    env: &BTreeMap<String, String>,
    volume_mounts: &[VolumeMount],
) -> Result<WorkItemPayload> {
    let server = ctx.persistence.server(&deployment.server_id).await?;
    let wireguard_ip = server
        .wireguard_addr()
        .ok_or_else(|| Error::custom(ErrorKind::Internal, "server lost its mesh address"))?;
    let ip_address = deployment
        .ip()
        .ok_or_else(|| Error::custom(ErrorKind::Internal, "deployment has a malformed address"))?;

    let port_rows = ctx.persistence.deployment_ports(&deployment.id).await?;

    Ok(WorkItemPayload::Deploy(DeployPayload {
        deployment_id: deployment.id,
        service_id: service.id,
        service_name: service.name.clone(),
        image: image.to_string(),
        port_mappings: port_rows
            .iter()
            .map(|p| PortMapping {
                container_port: p.container_port as u16,
                host_port: p.host_port as u16,
            })
            .collect(),
        wireguard_ip,
        ip_address,
        name: deployment.container_name.clone(),
        health_check: Some(service.health_check_spec()),
        env: env.clone(),
        volume_mounts: volume_mounts.to_vec(),
    }))
}

pub(crate) async fn canonical_config(
    ctx: &EngineCtx,
    service: &Service,
) -> Result<config_diff::CanonicalConfig> {
    let ports = ctx.persistence.service_ports(&service.id).await?;
    let replicas = ctx.persistence.service_replicas(&service.id).await?;
    let volumes = ctx.persistence.service_volumes(&service.id).await?;
    let secret_keys: Vec<String> = ctx
        .persistence
        .secrets(&service.id)
        .await?
        .into_iter()
        .map(|secret| secret.key)
        .collect();

    Ok(config_diff::canonicalize(
        service,
        &ports,
        &replicas,
        &volumes,
        &secret_keys,
    ))
}

/// Stage 4: block until every new deployment reports healthy. A deployment
/// that fails, or one that stays silent past the per-deployment timeout,
/// fails the rollout.
async fn health_check(ctx: &EngineCtx, rollout: &Rollout) -> Result<StageOutcome> {
    let deployments = ctx.persistence.deployments_for_rollout(&rollout.id).await?;

    if deployments
        .iter()
        .any(|d| d.status == DeploymentStatus::Failed)
    {
        return Ok(StageOutcome::Fail(FailedStage::DeployFailed));
    }

    let settled = deployments.iter().all(|d| {
        matches!(
            d.status,
            DeploymentStatus::Healthy | DeploymentStatus::Running
        )
    });
    if settled {
        return Ok(StageOutcome::Advance(RolloutStage::DnsSync));
    }

    let timeout = Duration::seconds(ctx.config.health_check_timeout_secs);
    let now = Utc::now();
    let timed_out = deployments.iter().any(|d| {
        !matches!(
            d.status,
            DeploymentStatus::Healthy | DeploymentStatus::Running
        ) && now - d.created_at > timeout
    });
    if timed_out {
        return Ok(StageOutcome::Fail(FailedStage::HealthCheckTimeout));
    }

    Ok(StageOutcome::Wait)
}

/// Stage 5: cut traffic over. New deployments go `healthy -> running`, the
/// drained old set goes `draining -> stopping` (with graceful stop items),
/// then we wait for each targeted server to confirm its DNS tables synced. A
/// sync timeout is a warning, not a failure; the proxy reconciles eventually.
async fn dns_sync(ctx: &EngineCtx, rollout: &Rollout) -> Result<StageOutcome> {
    let deployments = ctx.persistence.deployments_for_rollout(&rollout.id).await?;

    for deployment in &deployments {
        if deployment.status == DeploymentStatus::Healthy {
            ctx.persistence
                .update_deployment_status(&deployment.id, DeploymentStatus::Running)
                .await?;
        }
    }

    let draining = ctx
        .persistence
        .deployments_with_status(&rollout.service_id, &[DeploymentStatus::Draining])
        .await?;
    for old in draining {
        ctx.persistence
            .update_deployment_status(&old.id, DeploymentStatus::Stopping)
            .await?;

        match &old.container_id {
            Some(container_id) => {
                ctx.queue
                    .enqueue(
                        &old.server_id,
                        WorkItemPayload::Stop(StopPayload {
                            deployment_id: old.id,
                            container_id: container_id.clone(),
                        }),
                    )
                    .await?;
            }
            // Never materialised into a container; nothing to stop.
            None => {
                ctx.persistence
                    .update_deployment_status(&old.id, DeploymentStatus::Stopped)
                    .await?;
            }
        }
    }

    let mut targeted: Vec<Uuid> = deployments.iter().map(|d| d.server_id).collect();
    targeted.sort();
    targeted.dedup();

    let mut synced = true;
    for server_id in &targeted {
        let server = ctx.persistence.server(server_id).await?;
        match server.last_dns_sync_at {
            Some(at) if at >= rollout.stage_started_at => {}
            _ => synced = false,
        }
    }

    if synced {
        return Ok(StageOutcome::Advance(RolloutStage::Completed));
    }

    let deadline =
        rollout.stage_started_at + Duration::seconds(ctx.config.dns_sync_timeout_secs);
    if Utc::now() > deadline {
        warn!(
            rollout_id = %rollout.id,
            "dns sync confirmation timed out; completing anyway"
        );
        return Ok(StageOutcome::Advance(RolloutStage::Completed));
    }

    Ok(StageOutcome::Wait)
}

/// Compensation. Rolling updates revert their drained replicas (which never
/// stopped serving); everything this rollout created that is not serving gets
/// destroyed on its server.
pub(crate) async fn rollback(ctx: &EngineCtx, rollout: &Rollout, failed: FailedStage) -> Result<()> {
    warn!(
        rollout_id = %rollout.id,
        service_id = %rollout.service_id,
        failed_stage = %failed,
        "rolling back"
    );

    if rollout.is_rolling_update {
        let reverted = ctx
            .persistence
            .transition_deployments(
                &rollout.service_id,
                &[DeploymentStatus::Draining],
                DeploymentStatus::Running,
            )
            .await?;
        info!(rollout_id = %rollout.id, count = reverted.len(), "reverted draining deployments");
    }

    let deployments = ctx.persistence.deployments_for_rollout(&rollout.id).await?;
    let mut cleanup: HashMap<Uuid, Vec<String>> = HashMap::new();

    for deployment in &deployments {
        if deployment.status == DeploymentStatus::Running {
            continue;
        }

        if !deployment.status.is_terminal() {
            ctx.persistence
                .update_deployment_status(&deployment.id, DeploymentStatus::RolledBack)
                .await?;
            ctx.persistence
                .set_deployment_failed_stage(&deployment.id, failed)
                .await?;
        }

        if let Some(container_id) = &deployment.container_id {
            cleanup
                .entry(deployment.server_id)
                .or_default()
                .push(container_id.clone());
        }
    }

    for (server_id, container_ids) in cleanup {
        ctx.queue
            .enqueue(
                &server_id,
                WorkItemPayload::ForceCleanup(ForceCleanupPayload {
                    service_id: rollout.service_id,
                    container_ids,
                }),
            )
            .await?;
    }

    ctx.persistence
        .finish_rollout(
            &rollout.id,
            crate::persistence::RolloutStatus::RolledBack,
            Some(failed),
        )
        .await?;

    let service_name = ctx
        .persistence
        .service(&rollout.service_id)
        .await
        .map(|s| s.name)
        .unwrap_or_default();
    ctx.alerts
        .notify_deployment_failure(&DeploymentFailure {
            service_id: rollout.service_id,
            service_name,
            server_id: deployments.first().map(|d| d.server_id),
            failed_stage: failed,
        })
        .await;

    Ok(())
}
