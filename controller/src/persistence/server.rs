use std::net::Ipv4Addr;

use chrono::{DateTime, Duration, Utc};
use flotilla_common::models::agent::ServerResources;
use uuid::Uuid;

use super::error::{Error, Result};
use super::state::ServerStatus;
use super::Persistence;

/// A machine in the fleet, managed by an agent over the mesh VPN.
#[derive(Clone, Debug, PartialEq, sqlx::FromRow)]
pub struct Server {
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
    pub agent_token: Option<String>,
    pub registration_token: Option<String>,
    pub token_expires_at: Option<DateTime<Utc>>,
    pub health_stats: Option<serde_json::Value>,
    /// When the agent last confirmed its local DNS/proxy tables were synced.
    pub last_dns_sync_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Server {
    pub fn wireguard_addr(&self) -> Option<Ipv4Addr> {
        self.wireguard_ip.as_deref().and_then(|ip| ip.parse().ok())
    }

    /// Eligible as a rollout target: agent is calling in and the mesh address
    /// is known.
    pub fn is_deployable(&self) -> bool {
        self.status == ServerStatus::Online && self.wireguard_ip.is_some()
    }
}

impl Persistence {
    /// Enrols a new server with a single-use registration token.
    pub async fn insert_server(
        &self,
        name: &str,
        wireguard_ip: Option<Ipv4Addr>,
        is_proxy: bool,
        registration_token: &str,
        token_ttl: Duration,
    ) -> Result<Server> {
        let now = Utc::now();
        let id = Uuid::new_v4();

        sqlx::query(
            "INSERT INTO servers (id, name, wireguard_ip, status, is_proxy, registration_token, token_expires_at, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(id)
        .bind(name)
        .bind(wireguard_ip.map(|ip| ip.to_string()))
        .bind(ServerStatus::Pending)
        .bind(is_proxy)
        .bind(registration_token)
        .bind(now + token_ttl)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|err| Error::on_unique(err, "server name"))?;

        self.server(&id).await
    }

    pub async fn server(&self, id: &Uuid) -> Result<Server> {
        sqlx::query_as("SELECT * FROM servers WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(Error::NotFound("server"))
    }

    pub async fn servers(&self) -> Result<Vec<Server>> {
        sqlx::query_as("SELECT * FROM servers ORDER BY name")
            .fetch_all(&self.pool)
            .await
            .map_err(Error::from)
    }

    pub async fn online_servers(&self) -> Result<Vec<Server>> {
        sqlx::query_as("SELECT * FROM servers WHERE status = ? ORDER BY id")
            .bind(ServerStatus::Online)
            .fetch_all(&self.pool)
            .await
            .map_err(Error::from)
    }

    /// Consumes a live registration token: clears it, mints the permanent
    /// agent token and moves the server out of `pending` on its first
    /// heartbeat rather than here.
    pub async fn redeem_registration_token(
        &self,
        registration_token: &str,
        agent_token: &str,
        public_ip: Option<&str>,
    ) -> Result<Server> {
        let server: Option<Server> = sqlx::query_as(
            "SELECT * FROM servers WHERE registration_token = ? AND token_expires_at > ?",
        )
        .bind(registration_token)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await?;

        let server = server.ok_or(Error::NotFound("registration token"))?;

        sqlx::query(
            "UPDATE servers
             SET registration_token = NULL, token_expires_at = NULL, agent_token = ?,
                 public_ip = COALESCE(?, public_ip)
             WHERE id = ?",
        )
        .bind(agent_token)
        .bind(public_ip)
        .bind(server.id)
        .execute(&self.pool)
        .await?;

        self.server(&server.id).await
    }

    pub async fn server_by_agent_token(&self, token: &str) -> Result<Server> {
        sqlx::query_as("SELECT * FROM servers WHERE agent_token = ?")
            .bind(token)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(Error::NotFound("server"))
    }

    /// Applies a heartbeat: refreshes liveness, resources and the opaque
    /// health snapshot. Any server that heartbeats is `online`.
    pub async fn record_heartbeat(
        &self,
        id: &Uuid,
        resources: &ServerResources,
        health_stats: &serde_json::Value,
    ) -> Result<()> {
        let updated = sqlx::query(
            "UPDATE servers
             SET status = ?, last_heartbeat = ?, cpus = ?, mem_mb = ?, disk_gb = ?, health_stats = ?
             WHERE id = ?",
        )
        .bind(ServerStatus::Online)
        .bind(Utc::now())
        .bind(resources.cpus as i64)
        .bind(resources.mem_mb as i64)
        .bind(resources.disk_gb as i64)
        .bind(health_stats)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(Error::NotFound("server"));
        }

        Ok(())
    }

    pub async fn record_dns_sync(&self, id: &Uuid) -> Result<()> {
        sqlx::query("UPDATE servers SET last_dns_sync_at = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Flips servers whose last heartbeat predates the staleness window to
    /// `offline`; returns the ids that changed.
    pub async fn mark_stale_servers_offline(&self, staleness: Duration) -> Result<Vec<Uuid>> {
        let cutoff = Utc::now() - staleness;

        let stale: Vec<Server> = sqlx::query_as(
            "SELECT * FROM servers
             WHERE status = ? AND (last_heartbeat IS NULL OR last_heartbeat < ?)",
        )
        .bind(ServerStatus::Online)
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        for server in &stale {
            sqlx::query("UPDATE servers SET status = ? WHERE id = ?")
                .bind(ServerStatus::Offline)
                .bind(server.id)
                .execute(&self.pool)
                .await?;
        }

        Ok(stale.iter().map(|s| s.id).collect())
    }

    /// Removal is refused while any deployment still references the server.
    pub async fn delete_server(&self, id: &Uuid) -> Result<()> {
        let (referencing,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM deployments WHERE server_id = ?")
                .bind(id)
                .fetch_one(&self.pool)
                .await?;

        if referencing > 0 {
            return Err(Error::Conflict("server still has deployments"));
        }

        let deleted = sqlx::query("DELETE FROM servers WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        if deleted.rows_affected() == 0 {
            return Err(Error::NotFound("server"));
        }

        sqlx::query("DELETE FROM work_items WHERE server_id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn enrolment_round_trip() {
        let p = Persistence::new_in_memory().await.unwrap();

        let server = p
            .insert_server(
                "worker-1",
                Some(Ipv4Addr::new(10, 8, 0, 2)),
                false,
                "tok-abc",
                Duration::hours(24),
            )
            .await
            .unwrap();
        assert_eq!(server.status, ServerStatus::Pending);
        assert!(server.agent_token.is_none());

        // Duplicate names are rejected.
        assert!(matches!(
            p.insert_server("worker-1", None, false, "tok-2", Duration::hours(24))
                .await,
            Err(Error::AlreadyExists(_))
        ));

        let redeemed = p
            .redeem_registration_token("tok-abc", "agent-key", Some("203.0.113.9"))
            .await
            .unwrap();
        assert_eq!(redeemed.id, server.id);
        assert!(redeemed.registration_token.is_none());

        // The token is single-use.
        assert!(matches!(
            p.redeem_registration_token("tok-abc", "agent-key-2", None)
                .await,
            Err(Error::NotFound(_))
        ));

        let by_token = p.server_by_agent_token("agent-key").await.unwrap();
        assert_eq!(by_token.id, server.id);
    }

    #[tokio::test]
    async fn heartbeat_brings_server_online_and_staleness_takes_it_down() {
        let p = Persistence::new_in_memory().await.unwrap();
        let server = p
            .insert_server("s1", None, false, "tok", Duration::hours(24))
            .await
            .unwrap();

        let resources = ServerResources {
            cpus: 4,
            mem_mb: 8192,
            disk_gb: 100,
        };
        p.record_heartbeat(&server.id, &resources, &serde_json::json!({"wg": "up"}))
            .await
            .unwrap();

        let server = p.server(&server.id).await.unwrap();
        assert_eq!(server.status, ServerStatus::Online);
        assert_eq!(server.cpus, 4);

        // Fresh heartbeat: not stale yet.
        let flipped = p
            .mark_stale_servers_offline(Duration::seconds(90))
            .await
            .unwrap();
        assert!(flipped.is_empty());

        sqlx::query("UPDATE servers SET last_heartbeat = ? WHERE id = ?")
            .bind(Utc::now() - Duration::seconds(120))
            .bind(server.id)
            .execute(p.pool())
            .await
            .unwrap();

        let flipped = p
            .mark_stale_servers_offline(Duration::seconds(90))
            .await
            .unwrap();
        assert_eq!(flipped, vec![server.id]);
        assert_eq!(
            p.server(&server.id).await.unwrap().status,
            ServerStatus::Offline
        );
    }
}
