use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use tracing::info;

use crate::persistence::{self, DomainCertificate, Persistence};

/// Certificates are re-issued inside the last 30 days of their validity.
pub const RENEWAL_VALIDITY_THRESHOLD_IN_DAYS: i64 = 30;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("certificate issuance failed for {domain}: {message}")]
    Issuance { domain: String, message: String },

    #[error(transparent)]
    Persistence(#[from] persistence::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Material returned by the external issuer.
#[derive(Debug, Clone, Deserialize)]
pub struct IssuedCertificate {
    pub certificate_pem: String,
    pub private_key_pem: String,
    pub expires_at: DateTime<Utc>,
}

/// The external ACME collaborator. The control plane only triggers issuance
/// and stores the resulting material; challenges are answered by the proxy.
#[async_trait]
pub trait CertificateIssuer: Send + Sync {
    async fn issue(&self, domain: &str) -> Result<IssuedCertificate>;
}

/// Issuer reached over HTTP, e.g. the bundled ACME sidecar.
pub struct HttpCertificateIssuer {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpCertificateIssuer {
    pub fn new(endpoint: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint,
        }
    }
}

#[async_trait]
impl CertificateIssuer for HttpCertificateIssuer {
    async fn issue(&self, domain: &str) -> Result<IssuedCertificate> {
        let response = self
            .client
            .post(format!("{}/issue", self.endpoint.trim_end_matches('/')))
            .json(&serde_json::json!({ "domain": domain }))
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|err| Error::Issuance {
                domain: domain.to_string(),
                message: err.to_string(),
            })?;

        response.json().await.map_err(|err| Error::Issuance {
            domain: domain.to_string(),
            message: err.to_string(),
        })
    }
}

/// Make sure a live certificate exists for the domain: reuse a stored one
/// outside its renewal window, otherwise request issuance and persist the
/// result.
pub async fn ensure_certificate(
    persistence: &Persistence,
    issuer: &dyn CertificateIssuer,
    domain: &str,
) -> Result<DomainCertificate> {
    if let Some(existing) = persistence.certificate(domain).await? {
        let renew_after =
            existing.expires_at - Duration::days(RENEWAL_VALIDITY_THRESHOLD_IN_DAYS);
        if Utc::now() < renew_after {
            return Ok(existing);
        }
    }

    let issued = issuer.issue(domain).await?;
    let cert = DomainCertificate {
        domain: domain.to_string(),
        certificate_pem: issued.certificate_pem,
        private_key_pem: issued.private_key_pem,
        expires_at: issued.expires_at,
    };
    persistence.upsert_certificate(&cert).await?;

    info!(domain, expires_at = %cert.expires_at, "certificate issued");

    Ok(cert)
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    /// Test issuer: counts calls, optionally fails.
    pub(crate) struct StubIssuer {
        pub calls: Arc<AtomicUsize>,
        pub fail: bool,
    }

    impl StubIssuer {
        pub(crate) fn new() -> Self {
            Self {
                calls: Arc::new(AtomicUsize::new(0)),
                fail: false,
            }
        }
    }

    #[async_trait]
    impl CertificateIssuer for StubIssuer {
        async fn issue(&self, domain: &str) -> Result<IssuedCertificate> {
            self.calls.fetch_add(1, Ordering::SeqCst);

            if self.fail {
                return Err(Error::Issuance {
                    domain: domain.to_string(),
                    message: "issuer unreachable".to_string(),
                });
            }

            Ok(IssuedCertificate {
                certificate_pem: format!("CERT {domain}"),
                private_key_pem: "KEY".to_string(),
                expires_at: Utc::now() + Duration::days(90),
            })
        }
    }

    #[tokio::test]
    async fn issues_once_and_reuses_until_renewal_window() {
        let p = Persistence::new_in_memory().await.unwrap();
        let issuer = StubIssuer::new();

        ensure_certificate(&p, &issuer, "api.example.com")
            .await
            .unwrap();
        ensure_certificate(&p, &issuer, "api.example.com")
            .await
            .unwrap();
        assert_eq!(issuer.calls.load(Ordering::SeqCst), 1);

        // Push the certificate into its renewal window.
        sqlx::query("UPDATE domain_certificates SET expires_at = ? WHERE domain = ?")
            .bind(Utc::now() + Duration::days(10))
            .bind("api.example.com")
            .execute(p.pool())
            .await
            .unwrap();

        ensure_certificate(&p, &issuer, "api.example.com")
            .await
            .unwrap();
        assert_eq!(issuer.calls.load(Ordering::SeqCst), 2);
    }
}
