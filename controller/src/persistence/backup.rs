use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use super::error::{Error, Result};
use super::state::BackupStatus;
use super::Persistence;

/// One snapshot of a service volume in object storage.
#[derive(Clone, Debug, PartialEq, sqlx::FromRow)]
pub struct VolumeBackup {
    pub id: Uuid,
    pub volume_id: Uuid,
    pub service_id: Uuid,
    pub server_id: Option<Uuid>,
    pub status: BackupStatus,
    pub storage_path: String,
    pub size_bytes: Option<i64>,
    pub checksum: Option<String>,
    pub is_migration_backup: bool,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Persistence {
    /// The id is supplied by the caller because the storage path embeds it.
    pub async fn insert_volume_backup(
        &self,
        id: &Uuid,
        volume_id: &Uuid,
        service_id: &Uuid,
        server_id: &Uuid,
        storage_path: &str,
        is_migration_backup: bool,
    ) -> Result<VolumeBackup> {
        sqlx::query(
            "INSERT INTO volume_backups (id, volume_id, service_id, server_id, status,
                                         storage_path, is_migration_backup, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(id)
        .bind(volume_id)
        .bind(service_id)
        .bind(server_id)
        .bind(BackupStatus::Pending)
        .bind(storage_path)
        .bind(is_migration_backup)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        self.volume_backup(id).await
    }

    pub async fn volume_backup(&self, id: &Uuid) -> Result<VolumeBackup> {
        sqlx::query_as("SELECT * FROM volume_backups WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(Error::NotFound("backup"))
    }

    pub async fn volume_backups_for_service(&self, service_id: &Uuid) -> Result<Vec<VolumeBackup>> {
        sqlx::query_as(
            "SELECT * FROM volume_backups WHERE service_id = ? ORDER BY created_at DESC, id",
        )
        .bind(service_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::from)
    }

    pub async fn mark_backup_uploading(&self, id: &Uuid) -> Result<()> {
        sqlx::query("UPDATE volume_backups SET status = ? WHERE id = ? AND status = ?")
            .bind(BackupStatus::Uploading)
            .bind(id)
            .bind(BackupStatus::Pending)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Terminal transition reported by the agent. Idempotent: a second
    /// terminal report leaves the row unchanged.
    pub async fn finish_backup(
        &self,
        id: &Uuid,
        status: BackupStatus,
        checksum: Option<&str>,
        size_bytes: Option<i64>,
        error: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE volume_backups
             SET status = ?, checksum = ?, size_bytes = ?, error = ?, completed_at = ?
             WHERE id = ? AND status IN ('pending', 'uploading')",
        )
        .bind(status)
        .bind(checksum)
        .bind(size_bytes)
        .bind(error)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// The most recent migration backup of each volume of a service.
    pub async fn latest_migration_backups(&self, service_id: &Uuid) -> Result<Vec<VolumeBackup>> {
        let all: Vec<VolumeBackup> = sqlx::query_as(
            "SELECT * FROM volume_backups
             WHERE service_id = ? AND is_migration_backup = 1
             ORDER BY created_at DESC, id",
        )
        .bind(service_id)
        .fetch_all(&self.pool)
        .await?;

        let mut seen = std::collections::HashSet::new();
        Ok(all
            .into_iter()
            .filter(|backup| seen.insert(backup.volume_id))
            .collect())
    }

    /// Backups older than the retention window, for the retention sweep.
    pub async fn expired_backups(&self, retention: Duration) -> Result<Vec<VolumeBackup>> {
        sqlx::query_as(
            "SELECT * FROM volume_backups WHERE created_at < ? AND is_migration_backup = 0",
        )
        .bind(Utc::now() - retention)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::from)
    }

    pub async fn delete_volume_backup(&self, id: &Uuid) -> Result<()> {
        let deleted = sqlx::query("DELETE FROM volume_backups WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        if deleted.rows_affected() == 0 {
            return Err(Error::NotFound("backup"));
        }

        Ok(())
    }
}
