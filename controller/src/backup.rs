use flotilla_common::models::backup::{BackupType, StorageConfig};
use flotilla_common::models::error::ErrorKind;
use flotilla_common::models::work_item::{
    BackupVolumePayload, RestoreVolumePayload, WorkItemPayload,
};
use tracing::{info, instrument};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::persistence::{BackupStatus, DeploymentStatus, Persistence, VolumeBackup};
use crate::work_queue::WorkQueue;

/// Volume/database snapshot lifecycle. The engine resolves where the data
/// lives, records the backup row and hands the actual transfer to the owning
/// server's agent; checksums come back through the dispatcher.
#[derive(Clone)]
pub struct BackupEngine {
    persistence: Persistence,
    queue: WorkQueue,
    storage: StorageConfig,
}

impl BackupEngine {
    pub fn new(persistence: Persistence, queue: WorkQueue, storage: StorageConfig) -> Self {
        Self {
            persistence,
            queue,
            storage,
        }
    }

    /// Deterministic object key for a backup.
    fn storage_path(
        service_id: &Uuid,
        volume_name: &str,
        backup_id: &Uuid,
        backup_type: BackupType,
    ) -> String {
        format!(
            "backups/{service_id}/{volume_name}/{backup_id}{}",
            backup_type.extension()
        )
    }

    /// Snapshot one volume of a service. The owning server is wherever the
    /// service currently has a running deployment with a known container.
    #[instrument(skip(self), fields(service_id = %service_id, volume_id = %volume_id))]
    pub async fn trigger(
        &self,
        service_id: &Uuid,
        volume_id: &Uuid,
        type_override: Option<BackupType>,
        is_migration_backup: bool,
    ) -> Result<VolumeBackup> {
        let service = self.persistence.service(service_id).await?;
        let volume = self.persistence.service_volume(volume_id).await?;

        if volume.service_id != *service_id {
            return Err(Error::custom(
                ErrorKind::Validation,
                "volume does not belong to this service",
            ));
        }

        let running = self
            .persistence
            .deployments_with_status(
                service_id,
                &[DeploymentStatus::Running, DeploymentStatus::Healthy],
            )
            .await?;
        let deployment = running
            .into_iter()
            .find(|d| d.container_id.is_some())
            .ok_or_else(|| {
                Error::custom(
                    ErrorKind::Conflict,
                    "service has no running deployment to snapshot from",
                )
            })?;

        let container_id = deployment.container_id.clone().unwrap_or_default();
        self.trigger_on(
            &service,
            &volume,
            &deployment.server_id,
            &container_id,
            type_override,
            is_migration_backup,
        )
        .await
    }

    /// Snapshot a volume from an explicit server/container, regardless of
    /// deployment status. The migration engine uses this after it has stopped
    /// the source replica.
    pub async fn trigger_on(
        &self,
        service: &crate::persistence::Service,
        volume: &crate::persistence::ServiceVolume,
        server_id: &Uuid,
        container_id: &str,
        type_override: Option<BackupType>,
        is_migration_backup: bool,
    ) -> Result<VolumeBackup> {
        let backup_type = type_override.unwrap_or_else(|| BackupType::for_image(&service.image));
        let backup_id = Uuid::new_v4();
        let storage_path = Self::storage_path(&service.id, &volume.name, &backup_id, backup_type);

        let backup = self
            .persistence
            .insert_volume_backup(
                &backup_id,
                &volume.id,
                &service.id,
                server_id,
                &storage_path,
                is_migration_backup,
            )
            .await?;

        let payload = WorkItemPayload::BackupVolume(BackupVolumePayload {
            backup_id: backup.id,
            service_id: service.id,
            container_id: container_id.to_string(),
            volume_name: volume.name.clone(),
            storage_path,
            backup_type,
            service_image: service.image.clone(),
            storage_config: self.storage.clone(),
        });
        self.queue.enqueue(server_id, payload).await?;

        info!(backup_id = %backup.id, server_id = %server_id, "backup triggered");

        Ok(backup)
    }

    /// Restore a completed backup, optionally onto a different server. The
    /// stored checksum rides along so the agent verifies the object before
    /// applying anything.
    #[instrument(skip(self), fields(backup_id = %backup_id))]
    pub async fn restore(&self, backup_id: &Uuid, target_server_id: Option<Uuid>) -> Result<()> {
        let backup = self.persistence.volume_backup(backup_id).await?;

        if backup.status != BackupStatus::Completed {
            return Err(Error::custom(
                ErrorKind::Conflict,
                "backup has not completed",
            ));
        }
        let checksum = backup.checksum.clone().ok_or_else(|| {
            Error::custom(ErrorKind::Conflict, "backup has no recorded checksum")
        })?;

        let volume = self.persistence.service_volume(&backup.volume_id).await?;
        let server_id = target_server_id
            .or(backup.server_id)
            .ok_or_else(|| Error::custom(ErrorKind::Validation, "no target server for restore"))?;

        let service = self.persistence.service(&backup.service_id).await?;
        let backup_type = BackupType::for_image(&service.image);

        let payload = WorkItemPayload::RestoreVolume(RestoreVolumePayload {
            backup_id: backup.id,
            service_id: backup.service_id,
            volume_name: volume.name,
            storage_path: backup.storage_path.clone(),
            backup_type,
            storage_config: self.storage.clone(),
            expected_checksum: checksum,
        });
        self.queue.enqueue(&server_id, payload).await?;

        info!(server_id = %server_id, "restore enqueued");

        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::net::Ipv4Addr;

    use chrono::Duration;
    use flotilla_common::validation::Hostname;

    use super::*;
    use crate::persistence::{NewDeployment, NewService};
    use crate::work_queue::QueueConfig;

    pub(crate) fn storage_config() -> StorageConfig {
        StorageConfig {
            provider: "s3".into(),
            bucket: "flotilla-backups".into(),
            region: "us-east-1".into(),
            endpoint: None,
            access_key: "AK".into(),
            secret_key: "SK".into(),
        }
    }

    #[tokio::test]
    async fn trigger_targets_the_running_deployments_server() {
        let p = Persistence::new_in_memory().await.unwrap();
        let queue = WorkQueue::new(p.clone(), QueueConfig::default());
        let engine = BackupEngine::new(p.clone(), queue.clone(), storage_config());

        let server = p
            .insert_server("s1", Some(Ipv4Addr::new(10, 8, 0, 1)), false, "tok", Duration::hours(24))
            .await
            .unwrap();
        let service = p
            .insert_service(NewService {
                project_id: Uuid::new_v4(),
                env_id: Uuid::new_v4(),
                name: "db".into(),
                hostname: Hostname::new("db").unwrap(),
                image: "docker.io/library/postgres:16".into(),
                replicas: 1,
                stateful: true,
                auto_place: false,
            })
            .await
            .unwrap();
        p.replace_service_volumes(&service.id, &[("data".into(), "/var/lib/postgresql".into())])
            .await
            .unwrap();
        let volume = p.service_volumes(&service.id).await.unwrap().remove(0);

        // No running deployment yet: conflict.
        assert!(engine
            .trigger(&service.id, &volume.id, None, false)
            .await
            .is_err());

        let deployment = p
            .insert_deployment(NewDeployment {
                service_id: service.id,
                server_id: server.id,
                rollout_id: None,
                previous_deployment_id: None,
                container_name: "db-0".into(),
                image: "postgres".into(),
                ip_address: Ipv4Addr::new(10, 100, 1, 2),
                ports: vec![],
            })
            .await
            .unwrap();
        p.update_deployment_status(&deployment.id, DeploymentStatus::Running)
            .await
            .unwrap();
        p.set_deployment_container(&deployment.id, "c-db").await.unwrap();

        let backup = engine
            .trigger(&service.id, &volume.id, None, false)
            .await
            .unwrap();
        assert_eq!(backup.server_id, Some(server.id));
        assert_eq!(
            backup.storage_path,
            format!("backups/{}/data/{}.dump", service.id, backup.id)
        );

        // The agent sees a backup_volume item with the storage credentials.
        let claimed = queue.claim(&server.id, 10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        let WorkItemPayload::BackupVolume(payload) = claimed[0].typed_payload().unwrap() else {
            panic!("expected a backup_volume payload");
        };
        assert_eq!(payload.backup_id, backup.id);
        assert_eq!(payload.backup_type, BackupType::Dump);
        assert_eq!(payload.container_id, "c-db");
    }

    #[tokio::test]
    async fn restore_requires_a_completed_backup_with_checksum() {
        let p = Persistence::new_in_memory().await.unwrap();
        let queue = WorkQueue::new(p.clone(), QueueConfig::default());
        let engine = BackupEngine::new(p.clone(), queue.clone(), storage_config());

        let server = p
            .insert_server("s1", None, false, "tok", Duration::hours(24))
            .await
            .unwrap();
        let service = p
            .insert_service(NewService {
                project_id: Uuid::new_v4(),
                env_id: Uuid::new_v4(),
                name: "db".into(),
                hostname: Hostname::new("db").unwrap(),
                image: "redis".into(),
                replicas: 1,
                stateful: true,
                auto_place: false,
            })
            .await
            .unwrap();
        p.replace_service_volumes(&service.id, &[("data".into(), "/data".into())])
            .await
            .unwrap();
        let volume = p.service_volumes(&service.id).await.unwrap().remove(0);

        let backup = p
            .insert_volume_backup(
                &Uuid::new_v4(),
                &volume.id,
                &service.id,
                &server.id,
                "backups/x",
                false,
            )
            .await
            .unwrap();

        // Pending backup cannot be restored.
        assert!(engine.restore(&backup.id, None).await.is_err());

        p.finish_backup(
            &backup.id,
            BackupStatus::Completed,
            Some("sha256:abc"),
            Some(1024),
            None,
        )
        .await
        .unwrap();

        engine.restore(&backup.id, None).await.unwrap();

        let claimed = queue.claim(&server.id, 10).await.unwrap();
        let WorkItemPayload::RestoreVolume(payload) = claimed[0].typed_payload().unwrap() else {
            panic!("expected a restore_volume payload");
        };
        assert_eq!(payload.expected_checksum, "sha256:abc");
    }
}
