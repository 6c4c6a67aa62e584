use std::collections::HashSet;
use std::net::Ipv4Addr;

use flotilla_common::HOST_PORT_RANGE;
use uuid::Uuid;

use crate::persistence::{self, Persistence};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("no free {0} left on this server")]
    Exhausted(&'static str),

    #[error("server has no mesh address to derive a container subnet from")]
    NoSubnet,

    #[error(transparent)]
    Persistence(#[from] persistence::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Hands out host ports and container VPN addresses. Allocations are derived
/// from the persisted child rows, so they are only reserved once the caller
/// inserts the deployment; a lost race against a concurrent insert surfaces
/// as `AlreadyExists` there and the caller re-allocates.
#[derive(Clone)]
pub struct Allocator {
    persistence: Persistence,
    /// First two octets of the container network; the third comes from the
    /// server's mesh address, giving every server its own /24.
    container_net_base: (u8, u8),
}

impl Allocator {
    pub fn new(persistence: Persistence, container_net_base: (u8, u8)) -> Self {
        Self {
            persistence,
            container_net_base,
        }
    }

    /// Returns `n` distinct free host ports on the server, ascending.
    pub async fn allocate_host_ports(&self, server_id: &Uuid, n: usize) -> Result<Vec<u16>> {
        let used: HashSet<u16> = self
            .persistence
            .used_host_ports(server_id)
            .await?
            .into_iter()
            .collect();

        let free: Vec<u16> = HOST_PORT_RANGE
            .filter(|port| !used.contains(port))
            .take(n)
            .collect();

        if free.len() < n {
            return Err(Error::Exhausted("host ports"));
        }

        Ok(free)
    }

    /// The server's container /24, derived from its mesh address.
    pub fn container_subnet(&self, server: &persistence::Server) -> Result<(u8, u8, u8)> {
        let wg = server.wireguard_addr().ok_or(Error::NoSubnet)?;
        let (a, b) = self.container_net_base;
        Ok((a, b, wg.octets()[3]))
    }

    /// Returns the lowest unused host-part in the server's /24. Host parts
    /// 0, 1 and 255 are reserved (network, gateway, broadcast), leaving 253
    /// usable addresses.
    pub async fn allocate_container_ip(
        &self,
        server: &persistence::Server,
    ) -> Result<Ipv4Addr> {
        let (a, b, c) = self.container_subnet(server)?;

        let used: HashSet<Ipv4Addr> = self
            .persistence
            .used_container_ips(&server.id)
            .await?
            .into_iter()
            .collect();

        (2..=254u8)
            .map(|host| Ipv4Addr::new(a, b, c, host))
            .find(|candidate| !used.contains(candidate))
            .ok_or(Error::Exhausted("container addresses"))
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use flotilla_common::validation::Hostname;

    use super::*;
    use crate::persistence::{NewDeployment, NewService};

    async fn seeded() -> (Persistence, Allocator, persistence::Server, Uuid) {
        let p = Persistence::new_in_memory().await.unwrap();
        let allocator = Allocator::new(p.clone(), (10, 100));

        let server = p
            .insert_server(
                "s1",
                Some(Ipv4Addr::new(10, 8, 0, 7)),
                false,
                "tok",
                Duration::hours(24),
            )
            .await
            .unwrap();
        let service = p
            .insert_service(NewService {
                project_id: Uuid::new_v4(),
                env_id: Uuid::new_v4(),
                name: "api".into(),
                hostname: Hostname::new("api").unwrap(),
                image: "redis".into(),
                replicas: 1,
                stateful: false,
                auto_place: true,
            })
            .await
            .unwrap();

        (p, allocator, server, service.id)
    }

    #[tokio::test]
    async fn ports_come_out_ascending_and_distinct() {
        let (p, allocator, server, service_id) = seeded().await;

        let ports = allocator.allocate_host_ports(&server.id, 3).await.unwrap();
        assert_eq!(ports, vec![30000, 30001, 30002]);

        // Reserve the first two; the next allocation skips them.
        p.insert_deployment(NewDeployment {
            service_id,
            server_id: server.id,
            rollout_id: None,
            previous_deployment_id: None,
            container_name: "api-0".into(),
            image: "redis".into(),
            ip_address: Ipv4Addr::new(10, 100, 7, 2),
            ports: vec![(80, 30000), (81, 30001)],
        })
        .await
        .unwrap();

        let ports = allocator.allocate_host_ports(&server.id, 2).await.unwrap();
        assert_eq!(ports, vec![30002, 30003]);
    }

    #[tokio::test]
    async fn exhaustion_when_one_port_short() {
        let (p, allocator, server, service_id) = seeded().await;

        // Occupy all but two ports of the range, pathological but cheap via
        // direct row inserts.
        let total = *HOST_PORT_RANGE.end() as usize - *HOST_PORT_RANGE.start() as usize + 1;
        let mut tx = p.pool().begin().await.unwrap();
        let deployment_id = Uuid::new_v4();
        let now = chrono::Utc::now();
        sqlx::query(
            "INSERT INTO deployments (id, service_id, server_id, container_name, image, ip_address, status, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(deployment_id)
        .bind(service_id)
        .bind(server.id)
        .bind("exhaustion-fixture")
        .bind("redis")
        .bind(Ipv4Addr::new(10, 100, 7, 9).to_string())
        .bind("running")
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await
        .unwrap();
        for (i, port) in HOST_PORT_RANGE.take(total - 2).enumerate() {
            sqlx::query(
                "INSERT INTO deployment_ports (deployment_id, server_id, container_port, host_port)
                 VALUES (?, ?, ?, ?)",
            )
            .bind(deployment_id)
            .bind(server.id)
            .bind(i as i64)
            .bind(port as i64)
            .execute(&mut *tx)
            .await
            .unwrap();
        }
        tx.commit().await.unwrap();
        let _ = service_id;

        assert_eq!(
            allocator.allocate_host_ports(&server.id, 2).await.unwrap(),
            vec![32766, 32767]
        );
        assert!(matches!(
            allocator.allocate_host_ports(&server.id, 3).await,
            Err(Error::Exhausted(_))
        ));
    }

    #[tokio::test]
    async fn container_ips_fill_the_slash_24() {
        let (p, allocator, server, service_id) = seeded().await;

        let first = allocator.allocate_container_ip(&server).await.unwrap();
        assert_eq!(first, Ipv4Addr::new(10, 100, 7, 2));

        p.insert_deployment(NewDeployment {
            service_id,
            server_id: server.id,
            rollout_id: None,
            previous_deployment_id: None,
            container_name: "api-0".into(),
            image: "redis".into(),
            ip_address: first,
            ports: vec![],
        })
        .await
        .unwrap();

        let second = allocator.allocate_container_ip(&server).await.unwrap();
        assert_eq!(second, Ipv4Addr::new(10, 100, 7, 3));
    }
}
