use chrono::{DateTime, Utc};
use flotilla_common::models::work_item::HealthCheckSpec;
use flotilla_common::validation::Hostname;
use uuid::Uuid;

use super::error::{Error, Result};
use super::state::MigrationStatus;
use super::Persistence;

/// The declared spec of a container workload. What should run, not what is
/// running; deployments realise it.
#[derive(Clone, Debug, PartialEq, sqlx::FromRow)]
pub struct Service {
    pub id: Uuid,
    pub project_id: Uuid,
    pub env_id: Uuid,
    pub name: String,
    pub hostname: Hostname,
    pub image: String,
    pub source_type: String,
    pub repo_url: Option<String>,
    pub git_ref: Option<String>,
    pub replicas: i64,
    pub stateful: bool,
    pub auto_place: bool,
    pub locked_server_id: Option<Uuid>,
    pub health_cmd: Option<String>,
    pub health_interval_s: i64,
    pub health_timeout_s: i64,
    pub health_retries: i64,
    pub health_start_period_s: i64,
    /// Canonical config snapshot of the last successful rollout.
    pub deployed_config: Option<serde_json::Value>,
    pub migration_status: Option<MigrationStatus>,
    pub migration_error: Option<String>,
    pub migration_target_server_id: Option<Uuid>,
    pub deployment_schedule: Option<String>,
    pub backup_enabled: bool,
    pub backup_schedule: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Service {
    pub fn health_check_spec(&self) -> HealthCheckSpec {
        HealthCheckSpec {
            cmd: self.health_cmd.clone(),
            interval_s: self.health_interval_s as u32,
            timeout_s: self.health_timeout_s as u32,
            retries: self.health_retries as u32,
            start_period_s: self.health_start_period_s as u32,
        }
    }
}

/// A container port exposed by a service, optionally published on a domain.
#[derive(Clone, Debug, PartialEq, Eq, sqlx::FromRow)]
pub struct ServicePort {
    pub id: Uuid,
    pub service_id: Uuid,
    pub port: i64,
    pub is_public: bool,
    pub domain: Option<String>,
    pub protocol: String,
    pub tls_passthrough: bool,
}

/// Explicit replica placement row, meaningful when `auto_place` is off.
#[derive(Clone, Debug, PartialEq, Eq, sqlx::FromRow)]
pub struct ServiceReplica {
    pub service_id: Uuid,
    pub server_id: Uuid,
    pub count: i64,
}

#[derive(Clone, Debug, PartialEq, Eq, sqlx::FromRow)]
pub struct ServiceVolume {
    pub id: Uuid,
    pub service_id: Uuid,
    pub name: String,
    pub container_path: String,
}

/// Secret material; the value is encrypted at rest and only ever leaves the
/// store inside `deploy` payloads for the owning server.
#[derive(Clone, Debug, PartialEq, Eq, sqlx::FromRow)]
pub struct Secret {
    pub service_id: Uuid,
    pub key: String,
    pub encrypted_value: String,
}

/// Fields callers supply when creating a service.
#[derive(Clone, Debug)]
pub struct NewService {
    pub project_id: Uuid,
    pub env_id: Uuid,
    pub name: String,
    pub hostname: Hostname,
    pub image: String,
    pub replicas: i64,
    pub stateful: bool,
    pub auto_place: bool,
}

impl Persistence {
    pub async fn insert_service(&self, new: NewService) -> Result<Service> {
        let id = Uuid::new_v4();

        sqlx::query(
            "INSERT INTO services (id, project_id, env_id, name, hostname, image, source_type,
                                   replicas, stateful, auto_place, created_at)
             VALUES (?, ?, ?, ?, ?, ?, 'image', ?, ?, ?, ?)",
        )
        .bind(id)
        .bind(new.project_id)
        .bind(new.env_id)
        .bind(&new.name)
        .bind(&new.hostname)
        .bind(&new.image)
        .bind(new.replicas)
        .bind(new.stateful)
        .bind(new.auto_place)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|err| Error::on_unique(err, "hostname"))?;

        self.service(&id).await
    }

    pub async fn service(&self, id: &Uuid) -> Result<Service> {
        sqlx::query_as("SELECT * FROM services WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(Error::NotFound("service"))
    }

    pub async fn services(&self) -> Result<Vec<Service>> {
        sqlx::query_as("SELECT * FROM services ORDER BY name")
            .fetch_all(&self.pool)
            .await
            .map_err(Error::from)
    }

    /// Writes the declared-state columns. Child collections are replaced
    /// through their own operations.
    pub async fn update_service(&self, service: &Service) -> Result<()> {
        let updated = sqlx::query(
            "UPDATE services
             SET name = ?, hostname = ?, image = ?, source_type = ?, repo_url = ?, git_ref = ?,
                 replicas = ?, stateful = ?, auto_place = ?, health_cmd = ?, health_interval_s = ?,
                 health_timeout_s = ?, health_retries = ?, health_start_period_s = ?,
                 deployment_schedule = ?, backup_enabled = ?, backup_schedule = ?
             WHERE id = ?",
        )
        .bind(&service.name)
        .bind(&service.hostname)
        .bind(&service.image)
        .bind(&service.source_type)
        .bind(&service.repo_url)
        .bind(&service.git_ref)
        .bind(service.replicas)
        .bind(service.stateful)
        .bind(service.auto_place)
        .bind(&service.health_cmd)
        .bind(service.health_interval_s)
        .bind(service.health_timeout_s)
        .bind(service.health_retries)
        .bind(service.health_start_period_s)
        .bind(&service.deployment_schedule)
        .bind(service.backup_enabled)
        .bind(&service.backup_schedule)
        .bind(service.id)
        .execute(&self.pool)
        .await
        .map_err(|err| Error::on_unique(err, "hostname"))?;

        if updated.rows_affected() == 0 {
            return Err(Error::NotFound("service"));
        }

        Ok(())
    }

    pub async fn set_deployed_config(
        &self,
        service_id: &Uuid,
        config: &serde_json::Value,
    ) -> Result<()> {
        sqlx::query("UPDATE services SET deployed_config = ? WHERE id = ?")
            .bind(config)
            .bind(service_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Pin a stateful service to its server; set on first rollout, changed
    /// only by a completed migration.
    pub async fn set_locked_server(&self, service_id: &Uuid, server_id: Option<Uuid>) -> Result<()> {
        sqlx::query("UPDATE services SET locked_server_id = ? WHERE id = ?")
            .bind(server_id)
            .bind(service_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn set_migration_state(
        &self,
        service_id: &Uuid,
        status: Option<MigrationStatus>,
        error: Option<&str>,
        target_server_id: Option<Uuid>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE services
             SET migration_status = ?, migration_error = ?, migration_target_server_id = ?
             WHERE id = ?",
        )
        .bind(status)
        .bind(error)
        .bind(target_server_id)
        .bind(service_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn service_ports(&self, service_id: &Uuid) -> Result<Vec<ServicePort>> {
        sqlx::query_as("SELECT * FROM service_ports WHERE service_id = ? ORDER BY port")
            .bind(service_id)
            .fetch_all(&self.pool)
            .await
            .map_err(Error::from)
    }

    /// Replaces the port rows in one transaction. Domain uniqueness is
    /// enforced by the store across all services.
    pub async fn replace_service_ports(
        &self,
        service_id: &Uuid,
        ports: &[(u16, bool, Option<String>, String, bool)],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM service_ports WHERE service_id = ?")
            .bind(service_id)
            .execute(&mut *tx)
            .await?;

        for (port, is_public, domain, protocol, tls_passthrough) in ports {
            sqlx::query(
                "INSERT INTO service_ports (id, service_id, port, is_public, domain, protocol, tls_passthrough)
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(Uuid::new_v4())
            .bind(service_id)
            .bind(*port as i64)
            .bind(is_public)
            .bind(domain)
            .bind(protocol)
            .bind(tls_passthrough)
            .execute(&mut *tx)
            .await
            .map_err(|err| Error::on_unique(err, "domain"))?;
        }

        tx.commit().await.map_err(Error::from)
    }

    pub async fn service_replicas(&self, service_id: &Uuid) -> Result<Vec<ServiceReplica>> {
        sqlx::query_as("SELECT * FROM service_replicas WHERE service_id = ? ORDER BY server_id")
            .bind(service_id)
            .fetch_all(&self.pool)
            .await
            .map_err(Error::from)
    }

    /// The batched child rewrite used when explicit placements change.
    pub async fn replace_service_replicas(
        &self,
        service_id: &Uuid,
        rows: &[(Uuid, i64)],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM service_replicas WHERE service_id = ?")
            .bind(service_id)
            .execute(&mut *tx)
            .await?;

        for (server_id, count) in rows {
            sqlx::query(
                "INSERT INTO service_replicas (service_id, server_id, count) VALUES (?, ?, ?)",
            )
            .bind(service_id)
            .bind(server_id)
            .bind(count)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await.map_err(Error::from)
    }

    pub async fn service_volumes(&self, service_id: &Uuid) -> Result<Vec<ServiceVolume>> {
        sqlx::query_as("SELECT * FROM service_volumes WHERE service_id = ? ORDER BY name")
            .bind(service_id)
            .fetch_all(&self.pool)
            .await
            .map_err(Error::from)
    }

    pub async fn service_volume(&self, volume_id: &Uuid) -> Result<ServiceVolume> {
        sqlx::query_as("SELECT * FROM service_volumes WHERE id = ?")
            .bind(volume_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(Error::NotFound("volume"))
    }

    pub async fn replace_service_volumes(
        &self,
        service_id: &Uuid,
        volumes: &[(String, String)],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM service_volumes WHERE service_id = ?")
            .bind(service_id)
            .execute(&mut *tx)
            .await?;

        for (name, container_path) in volumes {
            sqlx::query(
                "INSERT INTO service_volumes (id, service_id, name, container_path)
                 VALUES (?, ?, ?, ?)",
            )
            .bind(Uuid::new_v4())
            .bind(service_id)
            .bind(name)
            .bind(container_path)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await.map_err(Error::from)
    }

    pub async fn secrets(&self, service_id: &Uuid) -> Result<Vec<Secret>> {
        sqlx::query_as("SELECT * FROM secrets WHERE service_id = ? ORDER BY key")
            .bind(service_id)
            .fetch_all(&self.pool)
            .await
            .map_err(Error::from)
    }

    pub async fn upsert_secret(
        &self,
        service_id: &Uuid,
        key: &str,
        encrypted_value: &str,
    ) -> Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO secrets (service_id, key, encrypted_value) VALUES (?, ?, ?)",
        )
        .bind(service_id)
        .bind(key)
        .bind(encrypted_value)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn delete_secret(&self, service_id: &Uuid, key: &str) -> Result<()> {
        let deleted = sqlx::query("DELETE FROM secrets WHERE service_id = ? AND key = ?")
            .bind(service_id)
            .bind(key)
            .execute(&self.pool)
            .await?;

        if deleted.rows_affected() == 0 {
            return Err(Error::NotFound("secret"));
        }

        Ok(())
    }

    /// Cascades over every child collection. Refused while any deployment or
    /// rollout of the service is still in progress; callers check first, this
    /// re-checks to stay safe under races.
    pub async fn delete_service(&self, id: &Uuid) -> Result<()> {
        let (active,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM deployments
             WHERE service_id = ? AND status IN ('pending', 'pulling', 'starting', 'healthy',
                                                 'running', 'draining', 'stopping')",
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await?;

        if active > 0 {
            return Err(Error::Conflict("service still has active deployments"));
        }

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "DELETE FROM deployment_ports WHERE deployment_id IN
                 (SELECT id FROM deployments WHERE service_id = ?)",
        )
        .bind(id)
        .execute(&mut *tx)
        .await?;

        for table in [
            "deployments",
            "rollouts",
            "volume_backups",
            "service_ports",
            "service_replicas",
            "service_volumes",
            "secrets",
        ] {
            sqlx::query(&format!("DELETE FROM {table} WHERE service_id = ?"))
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }

        let deleted = sqlx::query("DELETE FROM services WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        if deleted.rows_affected() == 0 {
            return Err(Error::NotFound("service"));
        }

        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn new_service(hostname: &str) -> NewService {
        NewService {
            project_id: Uuid::new_v4(),
            env_id: Uuid::new_v4(),
            name: hostname.to_string(),
            hostname: Hostname::new(hostname).unwrap(),
            image: "docker.io/library/redis:7".to_string(),
            replicas: 1,
            stateful: false,
            auto_place: true,
        }
    }

    #[tokio::test]
    async fn hostname_is_unique_cluster_wide() {
        let p = Persistence::new_in_memory().await.unwrap();

        p.insert_service(new_service("api")).await.unwrap();
        assert!(matches!(
            p.insert_service(new_service("api")).await,
            Err(Error::AlreadyExists("hostname"))
        ));
    }

    #[tokio::test]
    async fn child_collections_replace_and_cascade() {
        let p = Persistence::new_in_memory().await.unwrap();
        let service = p.insert_service(new_service("api")).await.unwrap();

        p.replace_service_ports(
            &service.id,
            &[
                (8080, true, Some("api.example.com".into()), "http".into(), false),
                (9090, false, None, "tcp".into(), false),
            ],
        )
        .await
        .unwrap();

        let ports = p.service_ports(&service.id).await.unwrap();
        assert_eq!(ports.len(), 2);
        assert_eq!(ports[0].port, 8080);

        // Same domain on another service violates cluster-wide uniqueness.
        let other = p.insert_service(new_service("web")).await.unwrap();
        assert!(matches!(
            p.replace_service_ports(
                &other.id,
                &[(80, true, Some("api.example.com".into()), "http".into(), false)],
            )
            .await,
            Err(Error::AlreadyExists("domain"))
        ));

        p.upsert_secret(&service.id, "DATABASE_URL", "enc:abc")
            .await
            .unwrap();
        p.replace_service_volumes(&service.id, &[("data".into(), "/var/lib/data".into())])
            .await
            .unwrap();

        p.delete_service(&service.id).await.unwrap();
        assert!(matches!(
            p.service(&service.id).await,
            Err(Error::NotFound("service"))
        ));
        assert!(p.service_ports(&service.id).await.unwrap().is_empty());
        assert!(p.secrets(&service.id).await.unwrap().is_empty());
    }
}
