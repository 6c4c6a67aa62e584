use std::net::SocketAddr;

use clap::Parser;

/// The flotilla control plane: drives declared services into running
/// deployments across an agent-managed fleet.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about)]
pub struct Args {
    /// Path of the controller state database
    #[arg(long, env = "FLOTILLA_DB_PATH", default_value = "flotilla-controller.sqlite")]
    pub db_path: String,

    /// Address to bind the API to
    #[arg(long, env = "FLOTILLA_API_ADDRESS", default_value = "0.0.0.0:7030")]
    pub api_address: SocketAddr,

    /// Externally reachable base URL, used in agent install commands
    #[arg(long, env = "FLOTILLA_PUBLIC_URL", default_value = "http://localhost:7030")]
    pub public_url: String,

    /// First two octets of the container VPN network; each server owns one
    /// /24 below it
    #[arg(long, env = "FLOTILLA_CONTAINER_NET", default_value = "10.100")]
    pub container_net: String,

    /// Seconds without a heartbeat before a server is considered offline
    #[arg(long, env = "FLOTILLA_HEARTBEAT_STALENESS_SECS", default_value_t = 90)]
    pub heartbeat_staleness_secs: i64,

    /// Maximum delivery attempts per work item
    #[arg(long, env = "FLOTILLA_WORK_ITEM_MAX_ATTEMPTS", default_value_t = 3)]
    pub work_item_max_attempts: i64,

    /// Backoff step between work item retries, in seconds
    #[arg(long, env = "FLOTILLA_WORK_ITEM_BACKOFF_SECS", default_value_t = 30)]
    pub work_item_backoff_secs: i64,

    /// Seconds after which a processing work item counts as stuck
    #[arg(long, env = "FLOTILLA_WORK_ITEM_STUCK_SECS", default_value_t = 300)]
    pub work_item_stuck_secs: i64,

    /// Per-deployment health gate during rollouts, in seconds
    #[arg(long, env = "FLOTILLA_HEALTH_CHECK_TIMEOUT_SECS", default_value_t = 600)]
    pub health_check_timeout_secs: i64,

    /// Per-server DNS confirmation wait during rollouts, in seconds
    #[arg(long, env = "FLOTILLA_DNS_SYNC_TIMEOUT_SECS", default_value_t = 300)]
    pub dns_sync_timeout_secs: i64,

    /// Days a volume backup is retained
    #[arg(long, env = "FLOTILLA_BACKUP_RETENTION_DAYS", default_value_t = 14)]
    pub backup_retention_days: i64,

    /// Webhook that receives deployment-failure alerts
    #[arg(long, env = "FLOTILLA_ALERT_WEBHOOK_URL")]
    pub alert_webhook_url: Option<String>,

    /// Base URL of the certificate issuance sidecar
    #[arg(long, env = "FLOTILLA_CERT_ISSUER_URL")]
    pub cert_issuer_url: Option<String>,

    /// Object storage settings for volume backups
    #[arg(long, env = "FLOTILLA_STORAGE_PROVIDER", default_value = "s3")]
    pub storage_provider: String,

    #[arg(long, env = "FLOTILLA_STORAGE_BUCKET", default_value = "flotilla-backups")]
    pub storage_bucket: String,

    #[arg(long, env = "FLOTILLA_STORAGE_REGION", default_value = "us-east-1")]
    pub storage_region: String,

    #[arg(long, env = "FLOTILLA_STORAGE_ENDPOINT")]
    pub storage_endpoint: Option<String>,

    #[arg(long, env = "FLOTILLA_STORAGE_ACCESS_KEY", default_value = "")]
    pub storage_access_key: String,

    #[arg(long, env = "FLOTILLA_STORAGE_SECRET_KEY", default_value = "")]
    pub storage_secret_key: String,
}

impl Args {
    /// The `(a, b)` of the container network's `a.b.0.0/16`.
    pub fn container_net_base(&self) -> (u8, u8) {
        let mut octets = self.container_net.split('.');
        let a = octets.next().and_then(|o| o.parse().ok()).unwrap_or(10);
        let b = octets.next().and_then(|o| o.parse().ok()).unwrap_or(100);
        (a, b)
    }
}
