use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

use crate::models::backup::{BackupType, StorageConfig};
use crate::HOST_PORT_RANGE;

/// The imperative commands an agent knows how to execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum WorkItemType {
    Deploy,
    Stop,
    ForceCleanup,
    CleanupVolumes,
    Build,
    BackupVolume,
    RestoreVolume,
}

/// One host-port binding for a container port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    pub container_port: u16,
    pub host_port: u16,
}

/// Health probe executed by the agent inside the container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheckSpec {
    pub cmd: Option<String>,
    pub interval_s: u32,
    pub timeout_s: u32,
    pub retries: u32,
    pub start_period_s: u32,
}

impl Default for HealthCheckSpec {
    fn default() -> Self {
        Self {
            cmd: None,
            interval_s: 10,
            timeout_s: 5,
            retries: 3,
            start_period_s: 15,
        }
    }
}

/// A named volume mounted into the container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMount {
    pub name: String,
    pub container_path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeployPayload {
    pub deployment_id: Uuid,
    pub service_id: Uuid,
    pub service_name: String,
    /// Fully qualified `registry/namespace/repo:tag` form.
    pub image: String,
    pub port_mappings: Vec<PortMapping>,
    /// The server's own mesh endpoint the container publishes on.
    pub wireguard_ip: Ipv4Addr,
    /// The VPN address assigned to this container.
    pub ip_address: Ipv4Addr,
    /// Container name, `<service id>-<replica ordinal>`.
    pub name: String,
    pub health_check: Option<HealthCheckSpec>,
    pub env: BTreeMap<String, String>,
    pub volume_mounts: Vec<VolumeMount>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopPayload {
    pub deployment_id: Uuid,
    pub container_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForceCleanupPayload {
    pub service_id: Uuid,
    pub container_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupVolumesPayload {
    pub service_id: Uuid,
    pub volume_names: Vec<String>,
}

/// Hand-off to a build worker; the control plane only records the request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildPayload {
    pub service_id: Uuid,
    pub repo_url: String,
    pub git_ref: String,
    /// The tag the produced image will be pushed under.
    pub image: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupVolumePayload {
    pub backup_id: Uuid,
    pub service_id: Uuid,
    pub container_id: String,
    pub volume_name: String,
    pub storage_path: String,
    pub backup_type: BackupType,
    pub service_image: String,
    pub storage_config: StorageConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreVolumePayload {
    pub backup_id: Uuid,
    pub service_id: Uuid,
    pub volume_name: String,
    pub storage_path: String,
    pub backup_type: BackupType,
    pub storage_config: StorageConfig,
    /// Verified against the stored object before anything is applied.
    pub expected_checksum: String,
}

/// The payload of a work item, tagged by the item type. Both the enqueue and
/// the dispatch paths run [`WorkItemPayload::validate`] so malformed items
/// never reach an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkItemPayload {
    Deploy(DeployPayload),
    Stop(StopPayload),
    ForceCleanup(ForceCleanupPayload),
    CleanupVolumes(CleanupVolumesPayload),
    Build(BuildPayload),
    BackupVolume(BackupVolumePayload),
    RestoreVolume(RestoreVolumePayload),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PayloadError {
    #[error("payload field `{0}` must not be empty")]
    Empty(&'static str),
    #[error("host port {0} is outside the allocatable range")]
    HostPortOutOfRange(u16),
    #[error("container port must be non-zero")]
    ZeroContainerPort,
    #[error("payload type `{actual}` does not match item type `{expected}`")]
    TypeMismatch {
        expected: WorkItemType,
        actual: WorkItemType,
    },
}

impl WorkItemPayload {
    pub fn item_type(&self) -> WorkItemType {
        match self {
            Self::Deploy(_) => WorkItemType::Deploy,
            Self::Stop(_) => WorkItemType::Stop,
            Self::ForceCleanup(_) => WorkItemType::ForceCleanup,
            Self::CleanupVolumes(_) => WorkItemType::CleanupVolumes,
            Self::Build(_) => WorkItemType::Build,
            Self::BackupVolume(_) => WorkItemType::BackupVolume,
            Self::RestoreVolume(_) => WorkItemType::RestoreVolume,
        }
    }

    /// Structural validation of the wire contract.
    pub fn validate(&self) -> Result<(), PayloadError> {
        match self {
            Self::Deploy(p) => {
                if p.service_name.is_empty() {
                    return Err(PayloadError::Empty("service_name"));
                }
                if p.image.is_empty() {
                    return Err(PayloadError::Empty("image"));
                }
                if p.name.is_empty() {
                    return Err(PayloadError::Empty("name"));
                }
                for mapping in &p.port_mappings {
                    if mapping.container_port == 0 {
                        return Err(PayloadError::ZeroContainerPort);
                    }
                    if !HOST_PORT_RANGE.contains(&mapping.host_port) {
                        return Err(PayloadError::HostPortOutOfRange(mapping.host_port));
                    }
                }
                Ok(())
            }
            Self::Stop(p) => {
                if p.container_id.is_empty() {
                    return Err(PayloadError::Empty("container_id"));
                }
                Ok(())
            }
            Self::ForceCleanup(_) | Self::CleanupVolumes(_) => Ok(()),
            Self::Build(p) => {
                if p.repo_url.is_empty() {
                    return Err(PayloadError::Empty("repo_url"));
                }
                if p.image.is_empty() {
                    return Err(PayloadError::Empty("image"));
                }
                Ok(())
            }
            Self::BackupVolume(p) => {
                if p.volume_name.is_empty() {
                    return Err(PayloadError::Empty("volume_name"));
                }
                if p.storage_path.is_empty() {
                    return Err(PayloadError::Empty("storage_path"));
                }
                if p.container_id.is_empty() {
                    return Err(PayloadError::Empty("container_id"));
                }
                Ok(())
            }
            Self::RestoreVolume(p) => {
                if p.volume_name.is_empty() {
                    return Err(PayloadError::Empty("volume_name"));
                }
                if p.storage_path.is_empty() {
                    return Err(PayloadError::Empty("storage_path"));
                }
                if p.expected_checksum.is_empty() {
                    return Err(PayloadError::Empty("expected_checksum"));
                }
                Ok(())
            }
        }
    }

    /// Validate and additionally check the tag matches the column the item
    /// was stored under.
    pub fn validate_for(&self, expected: WorkItemType) -> Result<(), PayloadError> {
        let actual = self.item_type();
        if actual != expected {
            return Err(PayloadError::TypeMismatch { expected, actual });
        }
        self.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deploy_payload() -> DeployPayload {
        DeployPayload {
            deployment_id: Uuid::new_v4(),
            service_id: Uuid::new_v4(),
            service_name: "api".to_string(),
            image: "docker.io/library/redis:7".to_string(),
            port_mappings: vec![PortMapping {
                container_port: 6379,
                host_port: 30000,
            }],
            wireguard_ip: Ipv4Addr::new(10, 8, 0, 1),
            ip_address: Ipv4Addr::new(10, 100, 4, 2),
            name: "svc-0".to_string(),
            health_check: Some(HealthCheckSpec::default()),
            env: BTreeMap::new(),
            volume_mounts: Vec::new(),
        }
    }

    #[test]
    fn round_trips_through_tagged_json() {
        let payload = WorkItemPayload::Deploy(deploy_payload());
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["type"], "deploy");

        let back: WorkItemPayload = serde_json::from_value(json).unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn rejects_out_of_range_host_port() {
        let mut inner = deploy_payload();
        inner.port_mappings[0].host_port = 29999;
        let payload = WorkItemPayload::Deploy(inner);
        assert_eq!(
            payload.validate(),
            Err(PayloadError::HostPortOutOfRange(29999))
        );
    }

    #[test]
    fn rejects_mismatched_tag() {
        let payload = WorkItemPayload::Stop(StopPayload {
            deployment_id: Uuid::new_v4(),
            container_id: "c1".to_string(),
        });
        assert!(matches!(
            payload.validate_for(WorkItemType::Deploy),
            Err(PayloadError::TypeMismatch { .. })
        ));
    }
}
