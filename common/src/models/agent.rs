use std::net::{IpAddr, Ipv4Addr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::work_item::{WorkItemPayload, WorkItemType};

/// Query half of `GET /agent/claim`. The server identity comes from the
/// bearer token; `max` caps the batch size.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ClaimQuery {
    pub max: Option<u32>,
}

/// One claimed item as an agent receives it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimedWorkItem {
    pub id: Uuid,
    pub r#type: WorkItemType,
    pub payload: WorkItemPayload,
}

/// Progress callbacks an agent posts to `/agent/report`. The dotted names are
/// the stable wire identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReportKind {
    #[serde(rename = "deployment.pulling")]
    DeploymentPulling,
    #[serde(rename = "deployment.starting")]
    DeploymentStarting,
    #[serde(rename = "deployment.healthy")]
    DeploymentHealthy,
    #[serde(rename = "deployment.unhealthy")]
    DeploymentUnhealthy,
    #[serde(rename = "deployment.stopped")]
    DeploymentStopped,
    #[serde(rename = "deployment.failed")]
    DeploymentFailed,
    #[serde(rename = "server.dns_synced")]
    ServerDnsSynced,
    #[serde(rename = "backup.completed")]
    BackupCompleted,
    #[serde(rename = "backup.failed")]
    BackupFailed,
    #[serde(rename = "restore.completed")]
    RestoreCompleted,
    #[serde(rename = "restore.failed")]
    RestoreFailed,
}

impl ReportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DeploymentPulling => "deployment.pulling",
            Self::DeploymentStarting => "deployment.starting",
            Self::DeploymentHealthy => "deployment.healthy",
            Self::DeploymentUnhealthy => "deployment.unhealthy",
            Self::DeploymentStopped => "deployment.stopped",
            Self::DeploymentFailed => "deployment.failed",
            Self::ServerDnsSynced => "server.dns_synced",
            Self::BackupCompleted => "backup.completed",
            Self::BackupFailed => "backup.failed",
            Self::RestoreCompleted => "restore.completed",
            Self::RestoreFailed => "restore.failed",
        }
    }

    /// Terminal kinds are deduplicated per `(deployment_id, kind)`.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::DeploymentHealthy
                | Self::DeploymentStopped
                | Self::DeploymentFailed
                | Self::BackupCompleted
                | Self::BackupFailed
                | Self::RestoreCompleted
                | Self::RestoreFailed
        )
    }
}

impl std::fmt::Display for ReportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Body of `POST /agent/report`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportRequest {
    pub kind: ReportKind,
    pub deployment_id: Option<Uuid>,
    pub backup_id: Option<Uuid>,
    pub container_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub checksum: Option<String>,
    pub size_bytes: Option<i64>,
    pub error_message: Option<String>,
}

/// Resource totals an agent reports with each heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ServerResources {
    pub cpus: u32,
    pub mem_mb: u64,
    pub disk_gb: u64,
}

/// Body of `POST /agent/heartbeat`. The health blobs are opaque to the
/// control plane; they are persisted for the UI as-is.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub server_id: Uuid,
    pub resources: ServerResources,
    pub network_health: serde_json::Value,
    pub agent_health: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    /// Hex HMAC-SHA256 over [`heartbeat_signing_input`], keyed by the agent
    /// token.
    pub signature: String,
}

/// The byte string both sides sign for a heartbeat.
pub fn heartbeat_signing_input(server_id: &Uuid, timestamp: &DateTime<Utc>) -> String {
    format!("{server_id}.{}", timestamp.timestamp())
}

/// Body of `POST /agent/register` — exchanges a one-shot enrolment token for
/// the server's permanent agent credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub registration_token: String,
    pub public_ip: Option<IpAddr>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub server_id: Uuid,
    pub agent_token: String,
    pub wireguard_ip: Option<Ipv4Addr>,
}

/// The one-liner operators paste on a fresh machine.
pub fn install_command(control_plane_url: &str, registration_token: &str) -> String {
    format!(
        "curl -fsSL {url}/install.sh | CONTROL_PLANE_URL={url} REGISTRATION_TOKEN={token} sh",
        url = control_plane_url.trim_end_matches('/'),
        token = registration_token,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_kind_wire_names_are_dotted() {
        let json = serde_json::to_string(&ReportKind::ServerDnsSynced).unwrap();
        assert_eq!(json, "\"server.dns_synced\"");

        let back: ReportKind = serde_json::from_str("\"deployment.healthy\"").unwrap();
        assert_eq!(back, ReportKind::DeploymentHealthy);
    }

    #[test]
    fn install_command_is_templated() {
        let cmd = install_command("https://cp.example.com/", "tok123");
        assert_eq!(
            cmd,
            "curl -fsSL https://cp.example.com/install.sh | CONTROL_PLANE_URL=https://cp.example.com REGISTRATION_TOKEN=tok123 sh"
        );
    }
}
