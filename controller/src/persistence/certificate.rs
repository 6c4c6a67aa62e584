use chrono::{DateTime, Duration, Utc};

use super::error::{Error, Result};
use super::Persistence;

/// PEM material for a public port's domain. Issuance happens in the external
/// ACME collaborator; this row is the bookkeeping the renewal sweep runs on.
#[derive(Clone, Debug, PartialEq, Eq, sqlx::FromRow)]
pub struct DomainCertificate {
    pub domain: String,
    pub certificate_pem: String,
    pub private_key_pem: String,
    pub expires_at: DateTime<Utc>,
}

/// HTTP-01 challenge token the proxy answers on behalf of the issuer.
#[derive(Clone, Debug, PartialEq, Eq, sqlx::FromRow)]
pub struct AcmeChallenge {
    pub domain: String,
    pub token: String,
    pub key_authorization: String,
    pub expires_at: DateTime<Utc>,
}

impl Persistence {
    pub async fn upsert_certificate(&self, cert: &DomainCertificate) -> Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO domain_certificates
                 (domain, certificate_pem, private_key_pem, expires_at)
             VALUES (?, ?, ?, ?)",
        )
        .bind(&cert.domain)
        .bind(&cert.certificate_pem)
        .bind(&cert.private_key_pem)
        .bind(cert.expires_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn certificate(&self, domain: &str) -> Result<Option<DomainCertificate>> {
        sqlx::query_as("SELECT * FROM domain_certificates WHERE domain = ?")
            .bind(domain)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::from)
    }

    /// Certificates within `threshold` of expiry (or already expired).
    pub async fn certificates_expiring_within(
        &self,
        threshold: Duration,
    ) -> Result<Vec<DomainCertificate>> {
        sqlx::query_as("SELECT * FROM domain_certificates WHERE expires_at < ? ORDER BY expires_at")
            .bind(Utc::now() + threshold)
            .fetch_all(&self.pool)
            .await
            .map_err(Error::from)
    }

    pub async fn upsert_acme_challenge(&self, challenge: &AcmeChallenge) -> Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO acme_challenges (domain, token, key_authorization, expires_at)
             VALUES (?, ?, ?, ?)",
        )
        .bind(&challenge.domain)
        .bind(&challenge.token)
        .bind(&challenge.key_authorization)
        .bind(challenge.expires_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn acme_challenge(&self, domain: &str, token: &str) -> Result<Option<AcmeChallenge>> {
        sqlx::query_as("SELECT * FROM acme_challenges WHERE domain = ? AND token = ?")
            .bind(domain)
            .bind(token)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::from)
    }

    pub async fn delete_expired_challenges(&self) -> Result<u64> {
        let deleted = sqlx::query("DELETE FROM acme_challenges WHERE expires_at < ?")
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;

        Ok(deleted.rows_affected())
    }
}
