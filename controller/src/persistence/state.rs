use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Where a server sits in its enrolment/heartbeat lifecycle.
#[derive(
    sqlx::Type, Debug, Display, Clone, Copy, EnumString, PartialEq, Eq, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ServerStatus {
    /// Enrolled but the agent has never called in.
    Pending,
    Online,
    Offline,
    Unknown,
}

/// States a deployment can be in.
#[derive(
    sqlx::Type, Debug, Display, Clone, Copy, EnumString, PartialEq, Eq, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DeploymentStatus {
    /// Row persisted, work item not yet picked up by the agent.
    Pending,
    /// Agent is pulling the image.
    Pulling,
    /// Container created and starting up.
    Starting,
    /// Health probe passed; not yet receiving traffic.
    Healthy,
    /// Serving traffic.
    Running,
    /// Old replica kept serving while its replacement comes up.
    Draining,
    /// Graceful stop requested.
    Stopping,
    Stopped,
    Failed,
    /// Belonged to a rollout that was rolled back before going live.
    RolledBack,
    /// We never expect this state and entering it should be considered a bug.
    Unknown,
}

impl DeploymentStatus {
    /// Statuses that hold on to their server resources (IP, host ports).
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Self::Pending
                | Self::Pulling
                | Self::Starting
                | Self::Healthy
                | Self::Running
                | Self::Draining
                | Self::Stopping
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Failed | Self::RolledBack)
    }
}

impl Default for DeploymentStatus {
    fn default() -> Self {
        Self::Unknown
    }
}

/// Result of the agent-side health probe.
#[derive(
    sqlx::Type, Debug, Display, Clone, Copy, EnumString, PartialEq, Eq, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum HealthStatus {
    None,
    Starting,
    Healthy,
    Unhealthy,
}

#[derive(
    sqlx::Type, Debug, Display, Clone, Copy, EnumString, PartialEq, Eq, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RolloutStatus {
    InProgress,
    Completed,
    Failed,
    RolledBack,
}

impl RolloutStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::InProgress)
    }
}

/// The stages a rollout moves through. Terminal stages mirror the terminal
/// [`RolloutStatus`] values so a restarted engine can resume from the row
/// alone.
#[derive(
    sqlx::Type, Debug, Display, Clone, Copy, EnumString, PartialEq, Eq, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RolloutStage {
    Preparing,
    Certificates,
    Deploying,
    HealthCheck,
    DnsSync,
    Completed,
    RolledBack,
}

/// Why a rollout ended up rolled back.
#[derive(
    sqlx::Type, Debug, Display, Clone, Copy, EnumString, PartialEq, Eq, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FailedStage {
    HealthCheckTimeout,
    DeployFailed,
    CertificateProvisioningFailed,
    InsufficientCapacity,
    Aborted,
    Cancelled,
}

#[derive(
    sqlx::Type, Debug, Display, Clone, Copy, EnumString, PartialEq, Eq, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum WorkItemStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

#[derive(
    sqlx::Type, Debug, Display, Clone, Copy, EnumString, PartialEq, Eq, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum BackupStatus {
    Pending,
    Uploading,
    Completed,
    Failed,
}

/// Progress of a stateful-service move between servers.
#[derive(
    sqlx::Type, Debug, Display, Clone, Copy, EnumString, PartialEq, Eq, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum MigrationStatus {
    Stopping,
    BackingUp,
    DeployingTarget,
    Restoring,
    Starting,
    Failed,
}
