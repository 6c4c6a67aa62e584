use std::str::FromStr;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use flotilla_common::image::ImageReference;
use flotilla_common::models::error::ErrorKind;
use flotilla_common::models::work_item::{
    CleanupVolumesPayload, HealthCheckSpec, StopPayload, WorkItemPayload,
};
use flotilla_common::validation::{validate_domain, validate_secret_key, Hostname};

use crate::config_diff::{self, FieldDiff};
use crate::error::{Error, Result};
use crate::persistence::{DeploymentStatus, NewService, Service};

use super::{ApiState, DeploymentResponse, RolloutResponse, ServiceResponse};

const MAX_REPLICAS: u32 = 10;

#[derive(Debug, Deserialize)]
pub(super) struct CreateServiceRequest {
    pub project_id: Option<Uuid>,
    pub env_id: Option<Uuid>,
    pub name: String,
    pub hostname: String,
    pub image: String,
    #[serde(default = "default_replicas")]
    pub replicas: u32,
    #[serde(default)]
    pub stateful: bool,
    #[serde(default = "default_auto_place")]
    pub auto_place: bool,
}

fn default_replicas() -> u32 {
    1
}

fn default_auto_place() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub(super) struct PortInput {
    pub port: u16,
    #[serde(default)]
    pub is_public: bool,
    pub domain: Option<String>,
    pub protocol: Option<String>,
    #[serde(default)]
    pub tls_passthrough: bool,
}

#[derive(Debug, Deserialize)]
pub(super) struct ReplicaInput {
    pub server_id: Uuid,
    pub count: u32,
}

#[derive(Debug, Deserialize)]
pub(super) struct VolumeInput {
    pub name: String,
    pub container_path: String,
}

#[derive(Debug, Deserialize)]
pub(super) struct SecretInput {
    pub key: String,
    pub value: String,
}

/// Declared-state patch. Absent fields keep their value; child collections
/// are replaced wholesale when present.
#[derive(Debug, Default, Deserialize)]
pub(super) struct UpdateServiceRequest {
    pub name: Option<String>,
    pub hostname: Option<String>,
    pub image: Option<String>,
    pub replicas: Option<u32>,
    pub stateful: Option<bool>,
    pub auto_place: Option<bool>,
    pub health_check: Option<HealthCheckSpec>,
    pub deployment_schedule: Option<String>,
    pub backup_enabled: Option<bool>,
    pub backup_schedule: Option<String>,
    pub ports: Option<Vec<PortInput>>,
    pub placements: Option<Vec<ReplicaInput>>,
    pub volumes: Option<Vec<VolumeInput>>,
    pub secrets: Option<Vec<SecretInput>>,
}

/// Accepts the conventional 5-field cron form and the 6-field form with
/// seconds.
fn parse_cron(expr: &str) -> Result<cron::Schedule> {
    let normalised = if expr.split_whitespace().count() == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    };

    cron::Schedule::from_str(&normalised)
        .map_err(|_| Error::custom(ErrorKind::Validation, "invalid cron expression"))
}

pub(crate) fn parse_schedule(expr: &str) -> Option<cron::Schedule> {
    parse_cron(expr).ok()
}

fn validate_image(image: &str) -> Result<()> {
    image
        .parse::<ImageReference>()
        .map(|_| ())
        .map_err(|err| Error::custom(ErrorKind::Validation, err.to_string()))
}

fn validate_schedule(expr: &str) -> Result<()> {
    parse_cron(expr).map(|_| ())
}

pub(super) async fn list_services(
    State(state): State<ApiState>,
) -> Result<Json<Vec<ServiceResponse>>> {
    let services = state.persistence.services().await?;
    Ok(Json(services.into_iter().map(Into::into).collect()))
}

pub(super) async fn get_service(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ServiceResponse>> {
    let service = state.persistence.service(&id).await?;
    Ok(Json(service.into()))
}

pub(super) async fn create_service(
    State(state): State<ApiState>,
    Json(request): Json<CreateServiceRequest>,
) -> Result<Json<ServiceResponse>> {
    let hostname = Hostname::new(&request.hostname)
        .map_err(|err| Error::custom(ErrorKind::Validation, err.to_string()))?;
    validate_image(&request.image)?;

    if request.replicas > MAX_REPLICAS {
        return Err(Error::custom(
            ErrorKind::Validation,
            "replicas must be between 0 and 10",
        ));
    }
    if request.stateful && request.replicas != 1 {
        return Err(Error::custom(
            ErrorKind::Validation,
            "stateful services run exactly one replica",
        ));
    }

    let service = state
        .persistence
        .insert_service(NewService {
            project_id: request.project_id.unwrap_or_else(Uuid::new_v4),
            env_id: request.env_id.unwrap_or_else(Uuid::new_v4),
            name: request.name,
            hostname,
            image: request.image,
            replicas: request.replicas as i64,
            stateful: request.stateful,
            auto_place: request.auto_place,
        })
        .await?;

    Ok(Json(service.into()))
}

/// Validate and write declared state. Never blocked by a running rollout;
/// the changes only take effect on the next one.
pub(super) async fn update_service(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
    Json(request): Json<UpdateServiceRequest>,
) -> Result<Json<ServiceResponse>> {
    let mut service = state.persistence.service(&id).await?;

    apply_patch(&mut service, &request)?;
    validate_children(&request)?;

    state.persistence.update_service(&service).await?;

    if let Some(ports) = &request.ports {
        let rows: Vec<(u16, bool, Option<String>, String, bool)> = ports
            .iter()
            .map(|p| {
                (
                    p.port,
                    p.is_public,
                    p.domain.clone(),
                    p.protocol.clone().unwrap_or_else(|| "http".to_string()),
                    p.tls_passthrough,
                )
            })
            .collect();
        state.persistence.replace_service_ports(&id, &rows).await?;
    }

    if let Some(placements) = &request.placements {
        let rows: Vec<(Uuid, i64)> = placements
            .iter()
            .map(|r| (r.server_id, r.count as i64))
            .collect();
        state.persistence.replace_service_replicas(&id, &rows).await?;
    }

    if let Some(volumes) = &request.volumes {
        let rows: Vec<(String, String)> = volumes
            .iter()
            .map(|v| (v.name.clone(), v.container_path.clone()))
            .collect();
        state.persistence.replace_service_volumes(&id, &rows).await?;
    }

    if let Some(secrets) = &request.secrets {
        for secret in secrets {
            state
                .persistence
                .upsert_secret(&id, &secret.key, &secret.value)
                .await?;
        }
    }

    let service = state.persistence.service(&id).await?;
    Ok(Json(service.into()))
}

fn apply_patch(service: &mut Service, request: &UpdateServiceRequest) -> Result<()> {
    if let Some(name) = &request.name {
        service.name = name.clone();
    }
    if let Some(hostname) = &request.hostname {
        service.hostname = Hostname::new(hostname)
            .map_err(|err| Error::custom(ErrorKind::Validation, err.to_string()))?;
    }
    if let Some(image) = &request.image {
        validate_image(image)?;
        service.image = image.clone();
    }
    if let Some(replicas) = request.replicas {
        if replicas > MAX_REPLICAS {
            return Err(Error::custom(
                ErrorKind::Validation,
                "replicas must be between 0 and 10",
            ));
        }
        service.replicas = replicas as i64;
    }
    if let Some(stateful) = request.stateful {
        service.stateful = stateful;
    }
    if let Some(auto_place) = request.auto_place {
        service.auto_place = auto_place;
    }
    if let Some(health) = &request.health_check {
        service.health_cmd = health.cmd.clone();
        service.health_interval_s = health.interval_s as i64;
        service.health_timeout_s = health.timeout_s as i64;
        service.health_retries = health.retries as i64;
        service.health_start_period_s = health.start_period_s as i64;
    }
    if let Some(schedule) = &request.deployment_schedule {
        if schedule.is_empty() {
            service.deployment_schedule = None;
        } else {
            validate_schedule(schedule)?;
            service.deployment_schedule = Some(schedule.clone());
        }
    }
    if let Some(enabled) = request.backup_enabled {
        service.backup_enabled = enabled;
    }
    if let Some(schedule) = &request.backup_schedule {
        if schedule.is_empty() {
            service.backup_schedule = None;
        } else {
            validate_schedule(schedule)?;
            service.backup_schedule = Some(schedule.clone());
        }
    }

    if service.stateful && service.replicas != 1 {
        return Err(Error::custom(
            ErrorKind::Validation,
            "stateful services run exactly one replica",
        ));
    }

    Ok(())
}

fn validate_children(request: &UpdateServiceRequest) -> Result<()> {
    if let Some(ports) = &request.ports {
        for port in ports {
            if port.port == 0 {
                return Err(Error::custom(
                    ErrorKind::Validation,
                    "port must be between 1 and 65535",
                ));
            }
            if let Some(domain) = &port.domain {
                validate_domain(domain)
                    .map_err(|err| Error::custom(ErrorKind::Validation, err.to_string()))?;
            }
        }
    }

    if let Some(placements) = &request.placements {
        for row in placements {
            if row.count > MAX_REPLICAS {
                return Err(Error::custom(
                    ErrorKind::Validation,
                    "per-server replica count must be between 0 and 10",
                ));
            }
        }
    }

    if let Some(secrets) = &request.secrets {
        for secret in secrets {
            validate_secret_key(&secret.key)
                .map_err(|err| Error::custom(ErrorKind::Validation, err.to_string()))?;
        }
    }

    Ok(())
}

/// The UI's "pending changes" banner: declared vs last-deployed config.
pub(super) async fn pending_changes(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<FieldDiff>>> {
    let service = state.persistence.service(&id).await?;

    let ports = state.persistence.service_ports(&id).await?;
    let replicas = state.persistence.service_replicas(&id).await?;
    let volumes = state.persistence.service_volumes(&id).await?;
    let secret_keys: Vec<String> = state
        .persistence
        .secrets(&id)
        .await?
        .into_iter()
        .map(|secret| secret.key)
        .collect();

    let current = config_diff::canonicalize(&service, &ports, &replicas, &volumes, &secret_keys);
    let deployed = service
        .deployed_config
        .as_ref()
        .and_then(|value| serde_json::from_value(value.clone()).ok());

    Ok(Json(config_diff::diff(deployed.as_ref(), &current)))
}

#[derive(Debug, Serialize)]
pub(super) struct DeployResponse {
    pub rollout_id: Uuid,
}

/// Create a rollout and return immediately; the engine drives it in the
/// background.
pub(super) async fn deploy(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> Result<(StatusCode, Json<DeployResponse>)> {
    let (rollout, _handle) = state.rollouts.start(&id).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(DeployResponse {
            rollout_id: rollout.id,
        }),
    ))
}

pub(super) async fn abort(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode> {
    let rollout = state
        .persistence
        .in_progress_rollout(&id)
        .await?
        .ok_or_else(|| Error::custom(ErrorKind::NotFound, "no rollout in progress"))?;

    state.rollouts.abort(&rollout.id).await?;

    Ok(StatusCode::ACCEPTED)
}

pub(super) async fn list_rollouts(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<RolloutResponse>>> {
    let rollouts = state.persistence.rollouts_for_service(&id).await?;
    Ok(Json(rollouts.into_iter().map(Into::into).collect()))
}

pub(super) async fn list_deployments(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<DeploymentResponse>>> {
    let deployments = state.persistence.deployments_for_service(&id).await?;
    Ok(Json(deployments.into_iter().map(Into::into).collect()))
}

pub(super) async fn stop_deployment(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode> {
    let deployment = state.persistence.deployment(&id).await?;

    if !deployment.status.is_active() {
        return Err(Error::custom(
            ErrorKind::Conflict,
            "deployment is not running",
        ));
    }

    let Some(container_id) = deployment.container_id.clone() else {
        state
            .persistence
            .update_deployment_status(&id, DeploymentStatus::Stopped)
            .await?;
        return Ok(StatusCode::ACCEPTED);
    };

    state
        .persistence
        .update_deployment_status(&id, DeploymentStatus::Stopping)
        .await?;
    state
        .queue
        .enqueue(
            &deployment.server_id,
            WorkItemPayload::Stop(StopPayload {
                deployment_id: deployment.id,
                container_id,
            }),
        )
        .await?;

    Ok(StatusCode::ACCEPTED)
}

pub(super) async fn delete_deployment(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> Result<Json<()>> {
    state.persistence.delete_deployment(&id).await?;
    Ok(Json(()))
}

pub(super) async fn delete_service(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> Result<Json<()>> {
    if state.persistence.in_progress_rollout(&id).await?.is_some() {
        return Err(Error::custom(
            ErrorKind::Conflict,
            "a rollout for this service is in progress",
        ));
    }

    // Named volumes outlive their containers; tell every server that ever
    // hosted this service to drop them before the rows disappear.
    let volumes = state.persistence.service_volumes(&id).await?;
    if !volumes.is_empty() {
        let deployments = state.persistence.deployments_for_service(&id).await?;
        let mut servers: Vec<Uuid> = deployments.iter().map(|d| d.server_id).collect();
        servers.sort();
        servers.dedup();

        let volume_names: Vec<String> = volumes.iter().map(|v| v.name.clone()).collect();
        for server_id in servers {
            state
                .queue
                .enqueue(
                    &server_id,
                    WorkItemPayload::CleanupVolumes(CleanupVolumesPayload {
                        service_id: id,
                        volume_names: volume_names.clone(),
                    }),
                )
                .await?;
        }
    }

    state.persistence.delete_service(&id).await?;
    Ok(Json(()))
}

#[derive(Debug, Deserialize)]
pub(super) struct MigrateRequest {
    pub target_server_id: Uuid,
}

pub(super) async fn migrate(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
    Json(request): Json<MigrateRequest>,
) -> Result<StatusCode> {
    state
        .migrations
        .start(&id, &request.target_server_id)
        .await?;

    Ok(StatusCode::ACCEPTED)
}

pub(super) async fn clear_migration(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode> {
    state.migrations.clear(&id).await?;
    Ok(StatusCode::OK)
}

#[derive(Debug, Serialize)]
pub(super) struct BackupResponse {
    pub id: Uuid,
    pub volume_id: Uuid,
    pub service_id: Uuid,
    pub server_id: Option<Uuid>,
    pub status: crate::persistence::BackupStatus,
    pub storage_path: String,
    pub size_bytes: Option<i64>,
    pub checksum: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl From<crate::persistence::VolumeBackup> for BackupResponse {
    fn from(backup: crate::persistence::VolumeBackup) -> Self {
        Self {
            id: backup.id,
            volume_id: backup.volume_id,
            service_id: backup.service_id,
            server_id: backup.server_id,
            status: backup.status,
            storage_path: backup.storage_path,
            size_bytes: backup.size_bytes,
            checksum: backup.checksum,
            created_at: backup.created_at,
            completed_at: backup.completed_at,
        }
    }
}

pub(super) async fn trigger_backup(
    State(state): State<ApiState>,
    Path((id, volume_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<BackupResponse>> {
    let backup = state.backups.trigger(&id, &volume_id, None, false).await?;
    Ok(Json(backup.into()))
}

pub(super) async fn list_backups(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<BackupResponse>>> {
    let backups = state.persistence.volume_backups_for_service(&id).await?;
    Ok(Json(backups.into_iter().map(Into::into).collect()))
}

#[derive(Debug, Default, Deserialize)]
pub(super) struct RestoreRequest {
    pub target_server_id: Option<Uuid>,
}

pub(super) async fn restore_backup(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
    Json(request): Json<RestoreRequest>,
) -> Result<StatusCode> {
    state.backups.restore(&id, request.target_server_id).await?;
    Ok(StatusCode::ACCEPTED)
}
