use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// How a volume snapshot is taken on the agent side. Database images get a
/// native dump instead of a filesystem tarball so the snapshot is consistent
/// without stopping the container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum BackupType {
    /// `pg_dump` custom format.
    Dump,
    /// `mysqldump` / `mariadb-dump` plain SQL.
    Sql,
    /// `mongodump --archive` piped through gzip.
    ArchiveGz,
    /// Redis RDB snapshot.
    Rdb,
    /// Volume tarball for everything else.
    Generic,
}

impl BackupType {
    /// Detect the backup type from the image the service runs.
    pub fn for_image(image: &str) -> Self {
        let name = image
            .rsplit('/')
            .next()
            .unwrap_or(image)
            .split([':', '@'])
            .next()
            .unwrap_or(image);

        match name {
            "postgres" | "postgresql" | "timescaledb" => Self::Dump,
            "mysql" | "mariadb" => Self::Sql,
            "mongo" | "mongodb" => Self::ArchiveGz,
            "redis" | "valkey" => Self::Rdb,
            _ => Self::Generic,
        }
    }

    /// File extension appended to the storage path, dot included.
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Dump => ".dump",
            Self::Sql => ".sql",
            Self::ArchiveGz => ".archive.gz",
            Self::Rdb => ".rdb",
            Self::Generic => ".backup",
        }
    }
}

/// Credentials and location of the S3-compatible bucket backups land in.
/// Travels inside `backup_volume`/`restore_volume` payloads only; the value
/// never appears in API responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfig {
    pub provider: String,
    pub bucket: String,
    pub region: String,
    pub endpoint: Option<String>,
    pub access_key: String,
    pub secret_key: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_database_images() {
        assert_eq!(
            BackupType::for_image("docker.io/library/postgres:16"),
            BackupType::Dump
        );
        assert_eq!(BackupType::for_image("mariadb:11"), BackupType::Sql);
        assert_eq!(
            BackupType::for_image("docker.io/library/mongo:7"),
            BackupType::ArchiveGz
        );
        assert_eq!(BackupType::for_image("redis:7-alpine"), BackupType::Rdb);
        assert_eq!(
            BackupType::for_image("ghcr.io/acme/api@sha256:abc"),
            BackupType::Generic
        );
    }
}
