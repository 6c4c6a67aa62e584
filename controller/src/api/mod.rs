mod agent;
mod servers;
mod services;

use axum::routing::{delete, get, post};
use axum::Router;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::backup::BackupEngine;
use crate::migration::MigrationEngine;
use crate::persistence::{
    self, DeploymentStatus, FailedStage, HealthStatus, MigrationStatus, Persistence, RolloutStage,
    RolloutStatus, ServerStatus,
};
use crate::rollout::RolloutEngine;
use crate::work_queue::WorkQueue;

pub use agent::{apply_report, AuthenticatedServer};
pub(crate) use services::parse_schedule;

/// Knobs the HTTP surface needs beyond its collaborators.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Externally reachable base URL, templated into install commands.
    pub public_url: String,
    pub registration_token_ttl_hours: i64,
    pub claim_batch_size: u32,
    pub claim_long_poll_secs: u64,
    pub claim_poll_interval_ms: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            public_url: "http://localhost:7030".to_string(),
            registration_token_ttl_hours: flotilla_common::REGISTRATION_TOKEN_TTL_HOURS,
            claim_batch_size: 8,
            claim_long_poll_secs: 25,
            claim_poll_interval_ms: 1000,
        }
    }
}

#[derive(Clone)]
pub struct ApiState {
    pub persistence: Persistence,
    pub queue: WorkQueue,
    pub rollouts: RolloutEngine,
    pub migrations: MigrationEngine,
    pub backups: BackupEngine,
    pub config: ApiConfig,
}

pub fn make_router(state: ApiState) -> Router {
    Router::new()
        // Agent dispatch protocol.
        .route("/agent/register", post(agent::register))
        .route("/agent/claim", get(agent::claim))
        .route("/agent/report", post(agent::report))
        .route("/agent/heartbeat", post(agent::heartbeat))
        .route("/agent/items/:id/complete", post(agent::complete_item))
        .route("/agent/items/:id/fail", post(agent::fail_item))
        // Fleet management.
        .route("/servers", get(servers::list_servers).post(servers::create_server))
        .route("/servers/:id", delete(servers::delete_server))
        // Declared state and rollouts.
        .route(
            "/services",
            get(services::list_services).post(services::create_service),
        )
        .route(
            "/services/:id",
            get(services::get_service)
                .patch(services::update_service)
                .delete(services::delete_service),
        )
        .route("/services/:id/diff", get(services::pending_changes))
        .route("/services/:id/deploy", post(services::deploy))
        .route("/services/:id/abort", post(services::abort))
        .route("/services/:id/rollouts", get(services::list_rollouts))
        .route("/services/:id/deployments", get(services::list_deployments))
        .route("/services/:id/migrate", post(services::migrate))
        .route(
            "/services/:id/migration/clear",
            post(services::clear_migration),
        )
        .route(
            "/services/:id/volumes/:volume_id/backups",
            post(services::trigger_backup),
        )
        .route("/services/:id/backups", get(services::list_backups))
        .route("/backups/:id/restore", post(services::restore_backup))
        .route(
            "/deployments/:id",
            delete(services::delete_deployment),
        )
        .route("/deployments/:id/stop", post(services::stop_deployment))
        .with_state(state)
}

/// Server as the UI sees it; credentials never leave the store.
#[derive(Debug, Serialize)]
pub struct ServerResponse {
    pub id: Uuid,
    pub name: String,
    pub public_ip: Option<String>,
    pub wireguard_ip: Option<String>,
    pub status: ServerStatus,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub cpus: i64,
    pub mem_mb: i64,
    pub disk_gb: i64,
    pub is_proxy: bool,
    pub created_at: DateTime<Utc>,
}

impl From<persistence::Server> for ServerResponse {
    fn from(server: persistence::Server) -> Self {
        Self {
            id: server.id,
            name: server.name,
            public_ip: server.public_ip,
            wireguard_ip: server.wireguard_ip,
            status: server.status,
            last_heartbeat: server.last_heartbeat,
            cpus: server.cpus,
            mem_mb: server.mem_mb,
            disk_gb: server.disk_gb,
            is_proxy: server.is_proxy,
            created_at: server.created_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ServiceResponse {
    pub id: Uuid,
    pub project_id: Uuid,
    pub env_id: Uuid,
    pub name: String,
    pub hostname: String,
    pub image: String,
    pub replicas: i64,
    pub stateful: bool,
    pub auto_place: bool,
    pub locked_server_id: Option<Uuid>,
    pub migration_status: Option<MigrationStatus>,
    pub migration_error: Option<String>,
    pub deployment_schedule: Option<String>,
    pub backup_enabled: bool,
    pub backup_schedule: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<persistence::Service> for ServiceResponse {
    fn from(service: persistence::Service) -> Self {
        Self {
            id: service.id,
            project_id: service.project_id,
            env_id: service.env_id,
            name: service.name,
            hostname: service.hostname.to_string(),
            image: service.image,
            replicas: service.replicas,
            stateful: service.stateful,
            auto_place: service.auto_place,
            locked_server_id: service.locked_server_id,
            migration_status: service.migration_status,
            migration_error: service.migration_error,
            deployment_schedule: service.deployment_schedule,
            backup_enabled: service.backup_enabled,
            backup_schedule: service.backup_schedule,
            created_at: service.created_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct DeploymentResponse {
    pub id: Uuid,
    pub service_id: Uuid,
    pub server_id: Uuid,
    pub rollout_id: Option<Uuid>,
    pub container_name: String,
    pub image: String,
    pub ip_address: String,
    pub status: DeploymentStatus,
    pub health_status: HealthStatus,
    pub failed_stage: Option<FailedStage>,
    pub created_at: DateTime<Utc>,
}

impl From<persistence::Deployment> for DeploymentResponse {
    fn from(deployment: persistence::Deployment) -> Self {
        Self {
            id: deployment.id,
            service_id: deployment.service_id,
            server_id: deployment.server_id,
            rollout_id: deployment.rollout_id,
            container_name: deployment.container_name,
            image: deployment.image,
            ip_address: deployment.ip_address,
            status: deployment.status,
            health_status: deployment.health_status,
            failed_stage: deployment.failed_stage,
            created_at: deployment.created_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct RolloutResponse {
    pub id: Uuid,
    pub service_id: Uuid,
    pub status: RolloutStatus,
    pub current_stage: RolloutStage,
    pub failed_stage: Option<FailedStage>,
    pub is_rolling_update: bool,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<persistence::Rollout> for RolloutResponse {
    fn from(rollout: persistence::Rollout) -> Self {
        Self {
            id: rollout.id,
            service_id: rollout.service_id,
            status: rollout.status,
            current_stage: rollout.current_stage,
            failed_stage: rollout.failed_stage,
            is_rolling_update: rollout.is_rolling_update,
            created_at: rollout.created_at,
            completed_at: rollout.completed_at,
        }
    }
}
