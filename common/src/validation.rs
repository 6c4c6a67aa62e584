use std::fmt::Formatter;
use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("hostname must be a lowercase DNS label (a-z, 0-9, '-', max 63 chars)")]
pub struct InvalidHostname;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("domain is not a valid fully qualified domain name")]
pub struct InvalidDomain;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("secret keys must match [A-Za-z_][A-Za-z0-9_]*")]
pub struct InvalidSecretKey;

static DOMAIN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([a-z0-9]([a-z0-9-]{0,61}[a-z0-9])?\.)+[a-z]{2,63}$")
        .expect("to create a regex from pattern")
});

static SECRET_KEY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("to create a regex from pattern"));

/// Service hostnames must conform to valid Host segments (or labels) as per
/// [IETF RFC 1123](https://datatracker.ietf.org/doc/html/rfc1123). They double
/// as container name prefixes and DNS names on the mesh, so they are
/// restricted to lower case.
#[derive(Clone, Serialize, Debug, Eq, Hash, PartialEq, PartialOrd, Ord)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(transparent))]
pub struct Hostname(String);

impl Hostname {
    pub fn new(name: &str) -> Result<Self, InvalidHostname> {
        if Self::is_valid(name) {
            Ok(Self(name.to_owned()))
        } else {
            Err(InvalidHostname)
        }
    }

    pub fn is_valid(name: &str) -> bool {
        fn is_valid_char(byte: u8) -> bool {
            matches!(byte, b'a'..=b'z' | b'0'..=b'9' | b'-')
        }

        !name.is_empty()
            && name.len() < 64
            && !name.starts_with('-')
            && !name.ends_with('-')
            && name.bytes().all(is_valid_char)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::ops::Deref for Hostname {
    type Target = String;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl std::fmt::Display for Hostname {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for Hostname {
    type Err = InvalidHostname;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl<'de> Deserialize<'de> for Hostname {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::new(&s).map_err(DeError::custom)
    }
}

pub fn is_valid_domain(domain: &str) -> bool {
    domain.len() < 254 && DOMAIN_RE.is_match(domain)
}

pub fn validate_domain(domain: &str) -> Result<(), InvalidDomain> {
    if is_valid_domain(domain) {
        Ok(())
    } else {
        Err(InvalidDomain)
    }
}

pub fn validate_secret_key(key: &str) -> Result<(), InvalidSecretKey> {
    if SECRET_KEY_RE.is_match(key) {
        Ok(())
    } else {
        Err(InvalidSecretKey)
    }
}

/// Container ports live in the full unprivileged range; zero is never valid.
pub fn is_valid_container_port(port: u16) -> bool {
    port >= 1
}
