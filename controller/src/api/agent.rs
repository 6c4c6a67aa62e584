use std::time::Duration;

use axum::extract::{FromRef, FromRequestParts, Query, State};
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use rand::distributions::Alphanumeric;
use rand::Rng;
use ring::hmac;
use tokio::time::{sleep, Instant};
use tracing::{debug, instrument};
use uuid::Uuid;

use flotilla_common::models::agent::{
    heartbeat_signing_input, ClaimQuery, ClaimedWorkItem, HeartbeatRequest, RegisterRequest,
    RegisterResponse, ReportKind, ReportRequest,
};
use flotilla_common::models::error::ErrorKind;
use flotilla_common::models::work_item::WorkItemType;

use crate::error::{Error, Result};
use crate::persistence::{DeploymentStatus, HealthStatus, Persistence, Server};
use crate::work_queue::WorkQueue;

use super::ApiState;

/// Heartbeat signatures older than this are replays.
const HEARTBEAT_MAX_SKEW_SECS: i64 = 300;

pub(crate) fn mint_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(40)
        .map(char::from)
        .collect()
}

/// Guard that resolves the per-server bearer token to the calling [`Server`].
pub struct AuthenticatedServer(pub Server);

#[axum::async_trait]
impl<S> FromRequestParts<S> for AuthenticatedServer
where
    S: Send + Sync,
    ApiState: FromRef<S>,
{
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self> {
        let token = parts
            .headers
            .get(http::header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .ok_or_else(|| Error::from_kind(ErrorKind::Unauthorized))?;

        let ApiState { persistence, .. } = ApiState::from_ref(state);

        let server = persistence
            .server_by_agent_token(token)
            .await
            .map_err(|_| Error::from_kind(ErrorKind::Unauthorized))?;

        Ok(Self(server))
    }
}

/// `POST /agent/register` — exchange a one-shot enrolment token for the
/// permanent agent token.
pub(super) async fn register(
    State(state): State<ApiState>,
    Json(request): Json<RegisterRequest>,
) -> Result<Json<RegisterResponse>> {
    let agent_token = mint_token();

    let server = state
        .persistence
        .redeem_registration_token(
            &request.registration_token,
            &agent_token,
            request.public_ip.map(|ip| ip.to_string()).as_deref(),
        )
        .await
        .map_err(|_| Error::from_kind(ErrorKind::Unauthorized))?;

    Ok(Json(RegisterResponse {
        server_id: server.id,
        agent_token,
        wireguard_ip: server.wireguard_addr(),
    }))
}

/// `GET /agent/claim` — long-poll for the next batch of work. Returns early
/// as soon as anything is claimable, or empty at the end of the poll window.
pub(super) async fn claim(
    State(state): State<ApiState>,
    AuthenticatedServer(server): AuthenticatedServer,
    Query(query): Query<ClaimQuery>,
) -> Result<Json<Vec<ClaimedWorkItem>>> {
    let max = query.max.unwrap_or(state.config.claim_batch_size).min(32);
    let deadline = Instant::now() + Duration::from_secs(state.config.claim_long_poll_secs);

    loop {
        let items = state.queue.claim(&server.id, max).await?;

        if !items.is_empty() {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(ClaimedWorkItem {
                    id: item.id,
                    r#type: item.r#type,
                    payload: item.typed_payload()?,
                });
            }
            return Ok(Json(out));
        }

        if Instant::now() >= deadline {
            return Ok(Json(Vec::new()));
        }

        sleep(Duration::from_millis(state.config.claim_poll_interval_ms)).await;
    }
}

/// `POST /agent/report` — progress callbacks. Accepted with 202; duplicates
/// of terminal callbacks are discarded.
pub(super) async fn report(
    State(state): State<ApiState>,
    server: AuthenticatedServer,
    Json(request): Json<ReportRequest>,
) -> Result<StatusCode> {
    apply_report(&state.persistence, &state.queue, &server, &request).await?;

    Ok(StatusCode::ACCEPTED)
}

/// `POST /agent/heartbeat` — liveness, resources and health snapshot.
pub(super) async fn heartbeat(
    State(state): State<ApiState>,
    AuthenticatedServer(server): AuthenticatedServer,
    Json(request): Json<HeartbeatRequest>,
) -> Result<StatusCode> {
    if request.server_id != server.id {
        return Err(Error::from_kind(ErrorKind::Unauthorized));
    }

    if (Utc::now() - request.timestamp).num_seconds().abs() > HEARTBEAT_MAX_SKEW_SECS {
        return Err(Error::custom(ErrorKind::Unauthorized, "heartbeat too old"));
    }

    let token = server
        .agent_token
        .as_deref()
        .ok_or_else(|| Error::from_kind(ErrorKind::Unauthorized))?;
    let key = hmac::Key::new(hmac::HMAC_SHA256, token.as_bytes());
    let input = heartbeat_signing_input(&request.server_id, &request.timestamp);
    let signature = hex_decode(&request.signature)
        .ok_or_else(|| Error::custom(ErrorKind::Unauthorized, "malformed signature"))?;
    hmac::verify(&key, input.as_bytes(), &signature)
        .map_err(|_| Error::custom(ErrorKind::Unauthorized, "bad heartbeat signature"))?;

    let health_stats = serde_json::json!({
        "network": request.network_health,
        "agent": request.agent_health,
    });

    state
        .persistence
        .record_heartbeat(&server.id, &request.resources, &health_stats)
        .await?;

    Ok(StatusCode::ACCEPTED)
}

/// `POST /agent/items/:id/complete` — finalise a claimed item that has no
/// deployment or backup callback of its own (cleanups, builds).
pub(super) async fn complete_item(
    State(state): State<ApiState>,
    AuthenticatedServer(server): AuthenticatedServer,
    axum::extract::Path(id): axum::extract::Path<Uuid>,
) -> Result<StatusCode> {
    let item = state.persistence.work_item(&id).await?;
    if item.server_id != server.id {
        return Err(Error::from_kind(ErrorKind::Unauthorized));
    }

    state.queue.complete(&id).await?;
    Ok(StatusCode::OK)
}

#[derive(Debug, serde::Deserialize)]
pub(super) struct FailItemRequest {
    pub reason: Option<String>,
}

/// `POST /agent/items/:id/fail` — the retry budget decides whether the item
/// goes back to pending or fails terminally.
pub(super) async fn fail_item(
    State(state): State<ApiState>,
    AuthenticatedServer(server): AuthenticatedServer,
    axum::extract::Path(id): axum::extract::Path<Uuid>,
    Json(request): Json<FailItemRequest>,
) -> Result<StatusCode> {
    let item = state.persistence.work_item(&id).await?;
    if item.server_id != server.id {
        return Err(Error::from_kind(ErrorKind::Unauthorized));
    }

    state
        .queue
        .fail(&id, request.reason.as_deref().unwrap_or("agent reported failure"))
        .await?;
    Ok(StatusCode::OK)
}

fn hex_decode(input: &str) -> Option<Vec<u8>> {
    if input.len() % 2 != 0 {
        return None;
    }

    (0..input.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&input[i..i + 2], 16).ok())
        .collect()
}

/// Applies one agent callback to the data model. Idempotent: terminal
/// callbacks are keyed by `(correlation id, kind)` in the report ledger, and
/// state transitions only fire from their legal predecessor statuses.
#[instrument(skip(persistence, queue, server, report), fields(server_id = %server.0.id, kind = %report.kind))]
pub async fn apply_report(
    persistence: &Persistence,
    queue: &WorkQueue,
    server: &AuthenticatedServer,
    report: &ReportRequest,
) -> Result<()> {
    let server = &server.0;

    match report.kind {
        ReportKind::DeploymentPulling
        | ReportKind::DeploymentStarting
        | ReportKind::DeploymentHealthy
        | ReportKind::DeploymentUnhealthy
        | ReportKind::DeploymentStopped
        | ReportKind::DeploymentFailed => {
            let deployment_id = report
                .deployment_id
                .ok_or_else(|| Error::custom(ErrorKind::Validation, "deployment_id is required"))?;

            apply_deployment_report(persistence, queue, server, deployment_id, report).await
        }
        ReportKind::ServerDnsSynced => {
            persistence.record_dns_sync(&server.id).await?;
            Ok(())
        }
        ReportKind::BackupCompleted | ReportKind::BackupFailed => {
            let backup_id = report
                .backup_id
                .ok_or_else(|| Error::custom(ErrorKind::Validation, "backup_id is required"))?;

            if !persistence
                .record_agent_report(&backup_id, report.kind.as_str())
                .await?
            {
                debug!("duplicate backup callback discarded");
                return Ok(());
            }

            let status = if report.kind == ReportKind::BackupCompleted {
                crate::persistence::BackupStatus::Completed
            } else {
                crate::persistence::BackupStatus::Failed
            };
            persistence
                .finish_backup(
                    &backup_id,
                    status,
                    report.checksum.as_deref(),
                    report.size_bytes,
                    report.error_message.as_deref(),
                )
                .await?;

            resolve_item(
                persistence,
                queue,
                &server.id,
                WorkItemType::BackupVolume,
                "backup_id",
                &backup_id,
                report.kind == ReportKind::BackupCompleted,
                report.error_message.as_deref(),
            )
            .await
        }
        ReportKind::RestoreCompleted | ReportKind::RestoreFailed => {
            let backup_id = report
                .backup_id
                .ok_or_else(|| Error::custom(ErrorKind::Validation, "backup_id is required"))?;

            if !persistence
                .record_agent_report(&backup_id, report.kind.as_str())
                .await?
            {
                debug!("duplicate restore callback discarded");
                return Ok(());
            }

            resolve_item(
                persistence,
                queue,
                &server.id,
                WorkItemType::RestoreVolume,
                "backup_id",
                &backup_id,
                report.kind == ReportKind::RestoreCompleted,
                report.error_message.as_deref(),
            )
            .await
        }
    }
}

async fn apply_deployment_report(
    persistence: &Persistence,
    queue: &WorkQueue,
    server: &Server,
    deployment_id: Uuid,
    report: &ReportRequest,
) -> Result<()> {
    let deployment = persistence.deployment(&deployment_id).await?;

    if deployment.server_id != server.id {
        return Err(Error::custom(
            ErrorKind::Unauthorized,
            "deployment belongs to another server",
        ));
    }

    if let Some(container_id) = &report.container_id {
        persistence
            .set_deployment_container(&deployment_id, container_id)
            .await?;
    }

    match report.kind {
        ReportKind::DeploymentPulling => {
            if deployment.status == DeploymentStatus::Pending {
                persistence
                    .update_deployment_status(&deployment_id, DeploymentStatus::Pulling)
                    .await?;
            }
        }
        ReportKind::DeploymentStarting => {
            if matches!(
                deployment.status,
                DeploymentStatus::Pending | DeploymentStatus::Pulling
            ) {
                persistence
                    .update_deployment_status(&deployment_id, DeploymentStatus::Starting)
                    .await?;
                persistence
                    .update_deployment_health(&deployment_id, HealthStatus::Starting)
                    .await?;
            }
        }
        ReportKind::DeploymentHealthy => {
            if !persistence
                .record_agent_report(&deployment_id, report.kind.as_str())
                .await?
            {
                debug!("duplicate healthy callback discarded");
                return Ok(());
            }

            if matches!(
                deployment.status,
                DeploymentStatus::Pending | DeploymentStatus::Pulling | DeploymentStatus::Starting
            ) {
                persistence
                    .update_deployment_status(&deployment_id, DeploymentStatus::Healthy)
                    .await?;
            }
            persistence
                .update_deployment_health(&deployment_id, HealthStatus::Healthy)
                .await?;

            resolve_item(
                persistence,
                queue,
                &server.id,
                WorkItemType::Deploy,
                "deployment_id",
                &deployment_id,
                true,
                None,
            )
            .await?;
        }
        ReportKind::DeploymentUnhealthy => {
            persistence
                .update_deployment_health(&deployment_id, HealthStatus::Unhealthy)
                .await?;
        }
        ReportKind::DeploymentStopped => {
            if !persistence
                .record_agent_report(&deployment_id, report.kind.as_str())
                .await?
            {
                debug!("duplicate stopped callback discarded");
                return Ok(());
            }

            if deployment.status.is_active() {
                persistence
                    .update_deployment_status(&deployment_id, DeploymentStatus::Stopped)
                    .await?;
            }

            resolve_item(
                persistence,
                queue,
                &server.id,
                WorkItemType::Stop,
                "deployment_id",
                &deployment_id,
                true,
                None,
            )
            .await?;
        }
        ReportKind::DeploymentFailed => {
            // Routed through the queue so the attempt budget decides whether
            // this retries or surfaces as a terminal deployment failure.
            resolve_item(
                persistence,
                queue,
                &server.id,
                WorkItemType::Deploy,
                "deployment_id",
                &deployment_id,
                false,
                report.error_message.as_deref(),
            )
            .await?;
        }
        _ => {}
    }

    Ok(())
}

/// Completes or fails the processing work item correlated to a callback.
/// Callbacks without a matching item (already resolved, requeued by the
/// stuck sweep) are discarded.
#[allow(clippy::too_many_arguments)]
async fn resolve_item(
    persistence: &Persistence,
    queue: &WorkQueue,
    server_id: &Uuid,
    item_type: WorkItemType,
    correlation_field: &str,
    correlation_id: &Uuid,
    success: bool,
    error_message: Option<&str>,
) -> Result<()> {
    let item = persistence
        .processing_work_item(server_id, item_type, correlation_field, correlation_id)
        .await?;

    let Some(item) = item else {
        debug!(%correlation_id, "callback without a processing work item");
        return Ok(());
    };

    if success {
        queue.complete(&item.id).await?;
    } else {
        queue
            .fail(&item.id, error_message.unwrap_or("agent reported failure"))
            .await?;
    }

    Ok(())
}
