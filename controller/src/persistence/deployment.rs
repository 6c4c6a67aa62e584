use std::net::Ipv4Addr;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::error::{Error, Result};
use super::state::{DeploymentStatus, FailedStage, HealthStatus};
use super::Persistence;

/// One realised (or intended) replica of a service on a specific server.
#[derive(Clone, Debug, PartialEq, sqlx::FromRow)]
pub struct Deployment {
    pub id: Uuid,
    pub service_id: Uuid,
    pub server_id: Uuid,
    pub rollout_id: Option<Uuid>,
    pub previous_deployment_id: Option<Uuid>,
    pub container_id: Option<String>,
    pub container_name: String,
    pub image: String,
    pub ip_address: String,
    pub status: DeploymentStatus,
    pub health_status: HealthStatus,
    pub failed_stage: Option<FailedStage>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Deployment {
    pub fn ip(&self) -> Option<Ipv4Addr> {
        self.ip_address.parse().ok()
    }
}

/// A host-port binding owned by a deployment. `server_id` is denormalised so
/// the `(server, host port)` uniqueness lives in one index.
#[derive(Clone, Debug, PartialEq, Eq, sqlx::FromRow)]
pub struct DeploymentPort {
    pub deployment_id: Uuid,
    pub server_id: Uuid,
    pub container_port: i64,
    pub host_port: i64,
}

/// Input for inserting a deployment together with its port reservations.
#[derive(Clone, Debug)]
pub struct NewDeployment {
    pub service_id: Uuid,
    pub server_id: Uuid,
    pub rollout_id: Option<Uuid>,
    pub previous_deployment_id: Option<Uuid>,
    pub container_name: String,
    pub image: String,
    pub ip_address: Ipv4Addr,
    /// `(container port, host port)` pairs.
    pub ports: Vec<(u16, u16)>,
}

impl Persistence {
    /// Inserts the deployment and its port rows in one transaction. The
    /// unique indexes on `(server, ip)` and `(server, host port)` are what
    /// make allocations race-safe: a lost race surfaces as `AlreadyExists`.
    pub async fn insert_deployment(&self, new: NewDeployment) -> Result<Deployment> {
        let id = Uuid::new_v4();
        let now = Utc::now();

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO deployments (id, service_id, server_id, rollout_id, previous_deployment_id,
                                      container_name, image, ip_address, status, health_status,
                                      created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(id)
        .bind(new.service_id)
        .bind(new.server_id)
        .bind(new.rollout_id)
        .bind(new.previous_deployment_id)
        .bind(&new.container_name)
        .bind(&new.image)
        .bind(new.ip_address.to_string())
        .bind(DeploymentStatus::Pending)
        .bind(HealthStatus::None)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|err| Error::on_unique(err, "container ip"))?;

        for (container_port, host_port) in &new.ports {
            sqlx::query(
                "INSERT INTO deployment_ports (deployment_id, server_id, container_port, host_port)
                 VALUES (?, ?, ?, ?)",
            )
            .bind(id)
            .bind(new.server_id)
            .bind(*container_port as i64)
            .bind(*host_port as i64)
            .execute(&mut *tx)
            .await
            .map_err(|err| Error::on_unique(err, "host port"))?;
        }

        tx.commit().await?;

        self.deployment(&id).await
    }

    pub async fn deployment(&self, id: &Uuid) -> Result<Deployment> {
        sqlx::query_as("SELECT * FROM deployments WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(Error::NotFound("deployment"))
    }

    pub async fn deployments_for_service(&self, service_id: &Uuid) -> Result<Vec<Deployment>> {
        sqlx::query_as("SELECT * FROM deployments WHERE service_id = ? ORDER BY created_at, id")
            .bind(service_id)
            .fetch_all(&self.pool)
            .await
            .map_err(Error::from)
    }

    pub async fn deployments_for_rollout(&self, rollout_id: &Uuid) -> Result<Vec<Deployment>> {
        sqlx::query_as("SELECT * FROM deployments WHERE rollout_id = ? ORDER BY created_at, id")
            .bind(rollout_id)
            .fetch_all(&self.pool)
            .await
            .map_err(Error::from)
    }

    pub async fn deployments_with_status(
        &self,
        service_id: &Uuid,
        statuses: &[DeploymentStatus],
    ) -> Result<Vec<Deployment>> {
        let all = self.deployments_for_service(service_id).await?;
        Ok(all
            .into_iter()
            .filter(|d| statuses.contains(&d.status))
            .collect())
    }

    /// Deployments still holding resources on a server, across services.
    pub async fn active_deployments_for_server(&self, server_id: &Uuid) -> Result<Vec<Deployment>> {
        sqlx::query_as(
            "SELECT * FROM deployments
             WHERE server_id = ? AND status IN ('pending', 'pulling', 'starting', 'healthy',
                                                'running', 'draining', 'stopping')
             ORDER BY created_at, id",
        )
        .bind(server_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::from)
    }

    /// `(server id, active deployment count)` for spread placement.
    pub async fn active_deployment_counts(&self) -> Result<Vec<(Uuid, i64)>> {
        sqlx::query_as(
            "SELECT server_id, COUNT(*) FROM deployments
             WHERE status IN ('pending', 'pulling', 'starting', 'healthy',
                              'running', 'draining', 'stopping')
             GROUP BY server_id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(Error::from)
    }

    pub async fn deployment_ports(&self, deployment_id: &Uuid) -> Result<Vec<DeploymentPort>> {
        sqlx::query_as(
            "SELECT * FROM deployment_ports WHERE deployment_id = ? ORDER BY container_port",
        )
        .bind(deployment_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::from)
    }

    /// Every host port currently reserved on a server, in ascending order.
    pub async fn used_host_ports(&self, server_id: &Uuid) -> Result<Vec<u16>> {
        let rows: Vec<(i64,)> = sqlx::query_as(
            "SELECT host_port FROM deployment_ports WHERE server_id = ? ORDER BY host_port",
        )
        .bind(server_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|(p,)| p as u16).collect())
    }

    /// Every container VPN address currently reserved on a server.
    pub async fn used_container_ips(&self, server_id: &Uuid) -> Result<Vec<Ipv4Addr>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT ip_address FROM deployments WHERE server_id = ?")
                .bind(server_id)
                .fetch_all(&self.pool)
                .await?;

        Ok(rows.into_iter().filter_map(|(ip,)| ip.parse().ok()).collect())
    }

    pub async fn update_deployment_status(
        &self,
        id: &Uuid,
        status: DeploymentStatus,
    ) -> Result<()> {
        let updated = sqlx::query("UPDATE deployments SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status)
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;

        if updated.rows_affected() == 0 {
            return Err(Error::NotFound("deployment"));
        }

        Ok(())
    }

    pub async fn update_deployment_health(&self, id: &Uuid, health: HealthStatus) -> Result<()> {
        sqlx::query("UPDATE deployments SET health_status = ?, updated_at = ? WHERE id = ?")
            .bind(health)
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn set_deployment_container(&self, id: &Uuid, container_id: &str) -> Result<()> {
        sqlx::query("UPDATE deployments SET container_id = ?, updated_at = ? WHERE id = ?")
            .bind(container_id)
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn set_deployment_failed_stage(
        &self,
        id: &Uuid,
        failed_stage: FailedStage,
    ) -> Result<()> {
        sqlx::query("UPDATE deployments SET failed_stage = ?, updated_at = ? WHERE id = ?")
            .bind(failed_stage)
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Moves every deployment of a service currently in one of `from` to
    /// `to`; returns the ids that transitioned.
    pub async fn transition_deployments(
        &self,
        service_id: &Uuid,
        from: &[DeploymentStatus],
        to: DeploymentStatus,
    ) -> Result<Vec<Uuid>> {
        let matching = self.deployments_with_status(service_id, from).await?;

        for deployment in &matching {
            self.update_deployment_status(&deployment.id, to).await?;
        }

        Ok(matching.into_iter().map(|d| d.id).collect())
    }

    /// Drops every deployment row of a service that is not serving traffic,
    /// freeing its port and address reservations. A fresh (non-rolling)
    /// deploy runs this first: anything short of `running` — stopped rows,
    /// failed rows, but also stale `pending`/`starting` leftovers of an
    /// earlier attempt — would otherwise keep hold of host ports and
    /// addresses the new replicas need.
    pub async fn purge_non_running_deployments(&self, service_id: &Uuid) -> Result<u64> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "DELETE FROM deployment_ports WHERE deployment_id IN
                 (SELECT id FROM deployments
                  WHERE service_id = ? AND status != 'running')",
        )
        .bind(service_id)
        .execute(&mut *tx)
        .await?;

        let deleted = sqlx::query(
            "DELETE FROM deployments WHERE service_id = ? AND status != 'running'",
        )
        .bind(service_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(deleted.rows_affected())
    }

    pub async fn delete_deployment(&self, id: &Uuid) -> Result<()> {
        let deployment = self.deployment(id).await?;
        if deployment.status.is_active() {
            return Err(Error::Conflict("deployment is still active"));
        }

        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM deployment_ports WHERE deployment_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM deployments WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await.map_err(Error::from)
    }
}
