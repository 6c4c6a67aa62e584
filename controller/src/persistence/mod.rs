mod backup;
mod certificate;
mod deployment;
mod error;
mod rollout;
mod server;
mod service;
mod state;
mod work_item;

use std::path::Path;
use std::str::FromStr;

use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::info;
use uuid::Uuid;

pub use self::backup::VolumeBackup;
pub use self::certificate::{AcmeChallenge, DomainCertificate};
pub use self::deployment::{Deployment, DeploymentPort, NewDeployment};
pub use self::error::{Error, Result};
pub use self::rollout::Rollout;
pub use self::server::Server;
pub use self::service::{NewService, Secret, Service, ServicePort, ServiceReplica, ServiceVolume};
pub use self::state::{
    BackupStatus, DeploymentStatus, FailedStage, HealthStatus, MigrationStatus, RolloutStage,
    RolloutStatus, ServerStatus, WorkItemStatus,
};
pub use self::work_item::WorkItem;

/// How long a service lock lease lives before a crashed holder's lock can be
/// stolen. Engines refresh the lease on every stage commit.
pub const LOCK_LEASE_SECS: i64 = 600;

/// Typed, transactional access to the entity graph. Cheap to clone; new
/// connections should be made by cloning [`Persistence`] rather than
/// repeatedly calling [`Persistence::new`].
#[derive(Clone)]
pub struct Persistence {
    pool: SqlitePool,
}

impl Persistence {
    /// Opens (creating if needed) the controller database and runs the schema.
    pub async fn new(db_path: &str) -> Result<Self> {
        let exists = Path::new(db_path).exists();
        let options = SqliteConnectOptions::from_str(db_path)
            .map_err(Error::Database)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePool::connect_with(options).await?;

        if !exists {
            info!(path = db_path, "created controller database");
        }

        Self::from_pool(pool).await
    }

    /// A single-connection in-memory database for tests. One connection keeps
    /// every handle on the same database and serialises writers.
    pub async fn new_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;

        Self::from_pool(pool).await
    }

    async fn from_pool(pool: SqlitePool) -> Result<Self> {
        sqlx::query(SCHEMA).execute(&pool).await?;

        Ok(Self { pool })
    }

    /// Raw pool access, for embedding and test fixtures.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Acquire the per-service advisory lock serialising rollouts and
    /// migrations of one service across control-plane replicas. Returns
    /// [`Error::Conflict`] when another holder owns a live lease.
    pub async fn try_lock_service(&self, service_id: &Uuid) -> Result<ServiceLock> {
        let now = Utc::now();

        sqlx::query("DELETE FROM service_locks WHERE service_id = ? AND expires_at < ?")
            .bind(service_id)
            .bind(now)
            .execute(&self.pool)
            .await?;

        let owner = Uuid::new_v4();
        let inserted = sqlx::query(
            "INSERT OR IGNORE INTO service_locks (service_id, owner, acquired_at, expires_at)
             VALUES (?, ?, ?, ?)",
        )
        .bind(service_id)
        .bind(owner)
        .bind(now)
        .bind(now + chrono::Duration::seconds(LOCK_LEASE_SECS))
        .execute(&self.pool)
        .await?;

        if inserted.rows_affected() == 0 {
            return Err(Error::Conflict("an operation on this service is already in progress"));
        }

        Ok(ServiceLock {
            service_id: *service_id,
            owner,
        })
    }

    /// Extend the lease of a held lock. A no-op if the lock was stolen after
    /// its lease lapsed; the stage commit that follows will then fail its
    /// status preconditions rather than corrupt another holder's rollout.
    pub async fn refresh_lock(&self, lock: &ServiceLock) -> Result<()> {
        sqlx::query("UPDATE service_locks SET expires_at = ? WHERE service_id = ? AND owner = ?")
            .bind(Utc::now() + chrono::Duration::seconds(LOCK_LEASE_SECS))
            .bind(lock.service_id)
            .bind(lock.owner)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn release_lock(&self, lock: ServiceLock) -> Result<()> {
        sqlx::query("DELETE FROM service_locks WHERE service_id = ? AND owner = ?")
            .bind(lock.service_id)
            .bind(lock.owner)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Records an agent callback in the idempotency ledger. Returns `false`
    /// when the same `(correlation id, kind)` pair was seen before, in which
    /// case the caller discards the duplicate.
    pub async fn record_agent_report(&self, correlation_id: &Uuid, kind: &str) -> Result<bool> {
        let inserted = sqlx::query(
            "INSERT OR IGNORE INTO agent_reports (correlation_id, kind, received_at)
             VALUES (?, ?, ?)",
        )
        .bind(correlation_id)
        .bind(kind)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(inserted.rows_affected() > 0)
    }

    pub async fn agent_report_exists(&self, correlation_id: &Uuid, kind: &str) -> Result<bool> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM agent_reports WHERE correlation_id = ? AND kind = ?",
        )
        .bind(correlation_id)
        .bind(kind)
        .fetch_one(&self.pool)
        .await?;

        Ok(count > 0)
    }
}

/// Proof of holding a service's advisory lock. Released explicitly; a crashed
/// holder's lease simply expires.
#[derive(Debug)]
pub struct ServiceLock {
    pub service_id: Uuid,
    owner: Uuid,
}

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS servers (
        id TEXT PRIMARY KEY,
        name TEXT UNIQUE NOT NULL,
        public_ip TEXT,
        wireguard_ip TEXT,
        status TEXT NOT NULL,
        last_heartbeat TEXT,
        cpus INTEGER NOT NULL DEFAULT 0,
        mem_mb INTEGER NOT NULL DEFAULT 0,
        disk_gb INTEGER NOT NULL DEFAULT 0,
        is_proxy INTEGER NOT NULL DEFAULT 0,
        agent_token TEXT,
        registration_token TEXT,
        token_expires_at TEXT,
        health_stats TEXT,
        last_dns_sync_at TEXT,
        created_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS services (
        id TEXT PRIMARY KEY,
        project_id TEXT NOT NULL,
        env_id TEXT NOT NULL,
        name TEXT NOT NULL,
        hostname TEXT UNIQUE NOT NULL,
        image TEXT NOT NULL,
        source_type TEXT NOT NULL DEFAULT 'image',
        repo_url TEXT,
        git_ref TEXT,
        replicas INTEGER NOT NULL DEFAULT 1,
        stateful INTEGER NOT NULL DEFAULT 0,
        auto_place INTEGER NOT NULL DEFAULT 1,
        locked_server_id TEXT,
        health_cmd TEXT,
        health_interval_s INTEGER NOT NULL DEFAULT 10,
        health_timeout_s INTEGER NOT NULL DEFAULT 5,
        health_retries INTEGER NOT NULL DEFAULT 3,
        health_start_period_s INTEGER NOT NULL DEFAULT 15,
        deployed_config TEXT,
        migration_status TEXT,
        migration_error TEXT,
        migration_target_server_id TEXT,
        deployment_schedule TEXT,
        backup_enabled INTEGER NOT NULL DEFAULT 0,
        backup_schedule TEXT,
        created_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS service_ports (
        id TEXT PRIMARY KEY,
        service_id TEXT NOT NULL REFERENCES services(id),
        port INTEGER NOT NULL,
        is_public INTEGER NOT NULL DEFAULT 0,
        domain TEXT UNIQUE,
        protocol TEXT NOT NULL DEFAULT 'http',
        tls_passthrough INTEGER NOT NULL DEFAULT 0,
        UNIQUE (service_id, port)
    );

    CREATE TABLE IF NOT EXISTS service_replicas (
        service_id TEXT NOT NULL REFERENCES services(id),
        server_id TEXT NOT NULL,
        count INTEGER NOT NULL,
        PRIMARY KEY (service_id, server_id)
    );

    CREATE TABLE IF NOT EXISTS service_volumes (
        id TEXT PRIMARY KEY,
        service_id TEXT NOT NULL REFERENCES services(id),
        name TEXT NOT NULL,
        container_path TEXT NOT NULL,
        UNIQUE (service_id, name)
    );

    CREATE TABLE IF NOT EXISTS secrets (
        service_id TEXT NOT NULL REFERENCES services(id),
        key TEXT NOT NULL,
        encrypted_value TEXT NOT NULL,
        PRIMARY KEY (service_id, key)
    );

    CREATE TABLE IF NOT EXISTS rollouts (
        id TEXT PRIMARY KEY,
        service_id TEXT NOT NULL REFERENCES services(id),
        status TEXT NOT NULL,
        current_stage TEXT NOT NULL,
        failed_stage TEXT,
        is_rolling_update INTEGER NOT NULL DEFAULT 0,
        cancel_requested INTEGER NOT NULL DEFAULT 0,
        stage_started_at TEXT NOT NULL,
        created_at TEXT NOT NULL,
        completed_at TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_rollouts_service_status
        ON rollouts(service_id, status);

    CREATE TABLE IF NOT EXISTS deployments (
        id TEXT PRIMARY KEY,
        service_id TEXT NOT NULL REFERENCES services(id),
        server_id TEXT NOT NULL REFERENCES servers(id),
        rollout_id TEXT,
        previous_deployment_id TEXT,
        container_id TEXT,
        container_name TEXT NOT NULL,
        image TEXT NOT NULL,
        ip_address TEXT NOT NULL,
        status TEXT NOT NULL,
        health_status TEXT NOT NULL DEFAULT 'none',
        failed_stage TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_deployments_service_status
        ON deployments(service_id, status);
    CREATE INDEX IF NOT EXISTS idx_deployments_server_status
        ON deployments(server_id, status);
    CREATE UNIQUE INDEX IF NOT EXISTS uq_deployments_server_ip
        ON deployments(server_id, ip_address);

    CREATE TABLE IF NOT EXISTS deployment_ports (
        deployment_id TEXT NOT NULL REFERENCES deployments(id),
        server_id TEXT NOT NULL,
        container_port INTEGER NOT NULL,
        host_port INTEGER NOT NULL,
        PRIMARY KEY (deployment_id, container_port)
    );
    CREATE UNIQUE INDEX IF NOT EXISTS uq_deployment_ports_host
        ON deployment_ports(server_id, host_port);

    CREATE TABLE IF NOT EXISTS work_items (
        id TEXT PRIMARY KEY,
        server_id TEXT NOT NULL REFERENCES servers(id),
        type TEXT NOT NULL,
        payload TEXT NOT NULL,
        status TEXT NOT NULL,
        attempts INTEGER NOT NULL DEFAULT 0,
        not_before TEXT,
        error TEXT,
        created_at TEXT NOT NULL,
        started_at TEXT,
        finished_at TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_work_items_server_status
        ON work_items(server_id, status);

    CREATE TABLE IF NOT EXISTS volume_backups (
        id TEXT PRIMARY KEY,
        volume_id TEXT NOT NULL,
        service_id TEXT NOT NULL REFERENCES services(id),
        server_id TEXT,
        status TEXT NOT NULL,
        storage_path TEXT NOT NULL,
        size_bytes INTEGER,
        checksum TEXT,
        is_migration_backup INTEGER NOT NULL DEFAULT 0,
        error TEXT,
        created_at TEXT NOT NULL,
        completed_at TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_volume_backups_service
        ON volume_backups(service_id, status);

    CREATE TABLE IF NOT EXISTS domain_certificates (
        domain TEXT PRIMARY KEY,
        certificate_pem TEXT NOT NULL,
        private_key_pem TEXT NOT NULL,
        expires_at TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_certificates_expiry
        ON domain_certificates(expires_at);

    CREATE TABLE IF NOT EXISTS acme_challenges (
        domain TEXT NOT NULL,
        token TEXT NOT NULL,
        key_authorization TEXT NOT NULL,
        expires_at TEXT NOT NULL,
        PRIMARY KEY (domain, token)
    );

    CREATE TABLE IF NOT EXISTS service_locks (
        service_id TEXT PRIMARY KEY,
        owner TEXT NOT NULL,
        acquired_at TEXT NOT NULL,
        expires_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS agent_reports (
        correlation_id TEXT NOT NULL,
        kind TEXT NOT NULL,
        received_at TEXT NOT NULL,
        PRIMARY KEY (correlation_id, kind)
    );
";
