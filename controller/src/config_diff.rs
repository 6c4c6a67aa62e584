use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use flotilla_common::models::work_item::HealthCheckSpec;

use crate::persistence::{Service, ServicePort, ServiceReplica, ServiceVolume};

/// The canonical form of a service's declared configuration. Collections are
/// sorted so equal configurations serialise identically; `deployed_config` on
/// the service row is this structure as captured at the end of the last
/// successful rollout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalConfig {
    pub source: SourceSpec,
    pub health_check: HealthCheckSpec,
    pub replica_count: i64,
    pub ports: Vec<CanonicalPort>,
    pub replicas: Vec<CanonicalReplica>,
    pub secret_keys: Vec<String>,
    pub volumes: Vec<CanonicalVolume>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSpec {
    pub r#type: String,
    pub r#ref: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalPort {
    pub port: i64,
    pub is_public: bool,
    pub domain: Option<String>,
    pub protocol: String,
    pub tls_passthrough: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalReplica {
    pub server_id: Uuid,
    pub count: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalVolume {
    pub name: String,
    pub container_path: String,
}

/// One field-level difference between the deployed and the declared
/// configuration; the UI's "pending changes" banner renders these.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldDiff {
    pub field: String,
    pub from: Value,
    pub to: Value,
}

pub fn canonicalize(
    service: &Service,
    ports: &[ServicePort],
    replicas: &[ServiceReplica],
    volumes: &[ServiceVolume],
    secret_keys: &[String],
) -> CanonicalConfig {
    let source = match service.source_type.as_str() {
        "repo" => SourceSpec {
            r#type: "repo".to_string(),
            r#ref: format!(
                "{}@{}",
                service.repo_url.as_deref().unwrap_or_default(),
                service.git_ref.as_deref().unwrap_or("HEAD"),
            ),
        },
        _ => SourceSpec {
            r#type: "image".to_string(),
            r#ref: service.image.clone(),
        },
    };

    let mut ports: Vec<CanonicalPort> = ports
        .iter()
        .map(|p| CanonicalPort {
            port: p.port,
            is_public: p.is_public,
            domain: p.domain.clone(),
            protocol: p.protocol.clone(),
            tls_passthrough: p.tls_passthrough,
        })
        .collect();
    ports.sort_by_key(|p| p.port);

    let mut replicas: Vec<CanonicalReplica> = replicas
        .iter()
        .map(|r| CanonicalReplica {
            server_id: r.server_id,
            count: r.count,
        })
        .collect();
    replicas.sort_by_key(|r| r.server_id);

    let mut secret_keys = secret_keys.to_vec();
    secret_keys.sort();

    let mut volumes: Vec<CanonicalVolume> = volumes
        .iter()
        .map(|v| CanonicalVolume {
            name: v.name.clone(),
            container_path: v.container_path.clone(),
        })
        .collect();
    volumes.sort_by(|a, b| a.name.cmp(&b.name));

    CanonicalConfig {
        source,
        health_check: service.health_check_spec(),
        replica_count: service.replicas,
        ports,
        replicas,
        secret_keys,
        volumes,
    }
}

/// Field-level diff between two canonical configurations. `deployed = None`
/// (service never rolled out) reports every field as new.
pub fn diff(deployed: Option<&CanonicalConfig>, current: &CanonicalConfig) -> Vec<FieldDiff> {
    let from = deployed
        .map(|c| serde_json::to_value(c).unwrap_or(Value::Null))
        .unwrap_or(Value::Null);
    let to = serde_json::to_value(current).unwrap_or(Value::Null);

    let empty = serde_json::Map::new();
    let from_map = from.as_object().unwrap_or(&empty);
    let to_map = to.as_object().unwrap_or(&empty);

    to_map
        .iter()
        .filter_map(|(field, to_value)| {
            let from_value = from_map.get(field).cloned().unwrap_or(Value::Null);
            (from_value != *to_value).then(|| FieldDiff {
                field: field.clone(),
                from: from_value,
                to: to_value.clone(),
            })
        })
        .collect()
}

/// A rollout is required when any field differs.
pub fn rollout_required(deployed: Option<&CanonicalConfig>, current: &CanonicalConfig) -> bool {
    !diff(deployed, current).is_empty()
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn config() -> CanonicalConfig {
        CanonicalConfig {
            source: SourceSpec {
                r#type: "image".into(),
                r#ref: "docker.io/library/redis:7".into(),
            },
            health_check: HealthCheckSpec::default(),
            replica_count: 2,
            ports: vec![CanonicalPort {
                port: 6379,
                is_public: false,
                domain: None,
                protocol: "tcp".into(),
                tls_passthrough: false,
            }],
            replicas: vec![],
            secret_keys: vec!["DATABASE_URL".into()],
            volumes: vec![],
        }
    }

    #[test]
    fn identical_configs_have_no_diff() {
        let c = config();
        assert_eq!(diff(Some(&c), &c), Vec::new());
        assert!(!rollout_required(Some(&c), &c));
    }

    #[test]
    fn image_change_is_a_source_diff() {
        let deployed = config();
        let mut current = config();
        current.source.r#ref = "docker.io/library/redis:8".into();

        let changes = diff(Some(&deployed), &current);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].field, "source");
    }

    #[test]
    fn never_deployed_means_everything_changed() {
        let current = config();
        let changes = diff(None, &current);
        assert!(changes.iter().any(|c| c.field == "source"));
        assert!(changes.iter().all(|c| c.from == Value::Null));
        assert!(rollout_required(None, &current));
    }

    #[test]
    fn collection_order_does_not_matter_after_canonicalisation() {
        let mut a = config();
        a.secret_keys = vec!["B".into(), "A".into()];
        a.secret_keys.sort();

        let mut b = config();
        b.secret_keys = vec!["A".into(), "B".into()];

        assert_eq!(diff(Some(&a), &b), Vec::new());
    }
}
