use std::fmt;
use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Reference to a container image as users write it.
///
/// In the [OCI distribution spec](https://github.com/opencontainers/distribution-spec/blob/main/spec.md):
/// > `<reference>` as a tag MUST be at most 128 characters
/// > in length and MUST match the following regular expression:
/// > ```text
/// > [a-zA-Z0-9_][a-zA-Z0-9._-]{0,127}
/// > ```
///
/// Accepted shorthands follow the usual registry conventions: `repo`,
/// `ns/repo`, `ns/repo:tag`, `host/ns/repo:tag` and any of those with an
/// `@digest` suffix. [`ImageReference::qualified`] is the fully expanded form
/// the agents receive.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ImageReference {
    pub registry: String,
    pub repository: String,
    pub tag: Option<String>,
    pub digest: Option<String>,
}

pub const DEFAULT_REGISTRY: &str = "docker.io";
pub const DEFAULT_NAMESPACE: &str = "library";
pub const DEFAULT_TAG: &str = "latest";

static TAG_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-zA-Z0-9_][a-zA-Z0-9._-]{0,127}$").expect("to create a regex from pattern")
});

static REPO_COMPONENT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-z0-9]+(?:(?:[._]|__|-+)[a-z0-9]+)*$").expect("to create a regex from pattern")
});

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid image reference: {0}")]
pub struct InvalidImageReference(pub String);

impl ImageReference {
    /// The fully qualified `registry/namespace/repo[:tag][@digest]` form.
    /// A digest pins the image exactly, so the tag is omitted alongside one.
    pub fn qualified(&self) -> String {
        let mut out = format!("{}/{}", self.registry, self.repository);
        if let Some(digest) = &self.digest {
            out.push('@');
            out.push_str(digest);
        } else {
            out.push(':');
            out.push_str(self.tag.as_deref().unwrap_or(DEFAULT_TAG));
        }
        out
    }

    /// Best-effort short name used for backup type detection and display,
    /// e.g. `postgres` out of `docker.io/library/postgres:16`.
    pub fn short_name(&self) -> &str {
        self.repository
            .rsplit('/')
            .next()
            .unwrap_or(&self.repository)
    }
}

impl FromStr for ImageReference {
    type Err = InvalidImageReference;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        if input.is_empty() {
            return Err(InvalidImageReference(input.to_string()));
        }

        let (rest, digest) = match input.split_once('@') {
            Some((rest, digest)) if !digest.is_empty() => (rest, Some(digest.to_string())),
            Some(_) => return Err(InvalidImageReference(input.to_string())),
            None => (input, None),
        };

        // A colon after the last slash separates the tag; earlier colons
        // belong to a registry port.
        let (name, tag) = match rest.rfind(':') {
            Some(idx) if !rest[idx..].contains('/') => {
                let tag = &rest[idx + 1..];
                if !TAG_RE.is_match(tag) {
                    return Err(InvalidImageReference(input.to_string()));
                }
                (&rest[..idx], Some(tag.to_string()))
            }
            _ => (rest, None),
        };

        let segments: Vec<&str> = name.split('/').collect();
        if segments.iter().any(|s| s.is_empty()) {
            return Err(InvalidImageReference(input.to_string()));
        }

        // The first segment is a registry host when it looks like one
        // (contains a dot or port, or is "localhost"); otherwise the whole
        // name is a repository on the default registry.
        let (registry, repo_segments) = match segments.as_slice() {
            [_single] => (DEFAULT_REGISTRY.to_string(), segments.as_slice()),
            [first, rest @ ..]
                if first.contains('.') || first.contains(':') || *first == "localhost" =>
            {
                (first.to_string(), rest)
            }
            _ => (DEFAULT_REGISTRY.to_string(), segments.as_slice()),
        };

        if repo_segments.is_empty()
            || !repo_segments.iter().all(|s| REPO_COMPONENT_RE.is_match(s))
        {
            return Err(InvalidImageReference(input.to_string()));
        }

        let repository = if repo_segments.len() == 1 && registry == DEFAULT_REGISTRY {
            format!("{DEFAULT_NAMESPACE}/{}", repo_segments[0])
        } else {
            repo_segments.join("/")
        };

        Ok(Self {
            registry,
            repository,
            tag,
            digest,
        })
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.qualified())
    }
}

impl TryFrom<String> for ImageReference {
    type Error = InvalidImageReference;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ImageReference> for String {
    fn from(value: ImageReference) -> Self {
        value.qualified()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn q(input: &str) -> String {
        input.parse::<ImageReference>().unwrap().qualified()
    }

    #[test]
    fn bare_repo_gets_library_namespace() {
        assert_eq!(q("redis"), "docker.io/library/redis:latest");
    }

    #[test]
    fn namespaced_repo_stays_on_default_registry() {
        assert_eq!(q("grafana/grafana"), "docker.io/grafana/grafana:latest");
        assert_eq!(q("grafana/grafana:10.2"), "docker.io/grafana/grafana:10.2");
    }

    #[test]
    fn registry_host_is_detected() {
        assert_eq!(
            q("ghcr.io/acme/api:v3"),
            "ghcr.io/acme/api:v3"
        );
        assert_eq!(
            q("localhost:5000/acme/api"),
            "localhost:5000/acme/api:latest"
        );
    }

    #[test]
    fn digest_suppresses_tag() {
        let image: ImageReference = "redis@sha256:deadbeef".parse().unwrap();
        assert_eq!(image.qualified(), "docker.io/library/redis@sha256:deadbeef");
    }

    #[test]
    fn short_name_strips_namespace() {
        let image: ImageReference = "bitnami/postgresql:16".parse().unwrap();
        assert_eq!(image.short_name(), "postgresql");
    }

    #[test]
    fn rejects_garbage() {
        assert!("".parse::<ImageReference>().is_err());
        assert!("re dis".parse::<ImageReference>().is_err());
        assert!("redis:".parse::<ImageReference>().is_err());
        assert!("a//b".parse::<ImageReference>().is_err());
        assert!("redis@".parse::<ImageReference>().is_err());
    }
}
