use async_trait::async_trait;
use serde::Serialize;
use tracing::{error, warn};
use uuid::Uuid;

use crate::persistence::FailedStage;

/// A rollout that ended in compensation.
#[derive(Debug, Clone, Serialize)]
pub struct DeploymentFailure {
    pub service_id: Uuid,
    pub service_name: String,
    pub server_id: Option<Uuid>,
    pub failed_stage: FailedStage,
}

/// Fire-and-forget notification sink. Delivery failures are logged and never
/// fail the rollout that raised them.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn notify_deployment_failure(&self, failure: &DeploymentFailure);
}

/// Posts failures as JSON to a configured webhook.
pub struct WebhookAlerts {
    client: reqwest::Client,
    url: String,
}

impl WebhookAlerts {
    pub fn new(url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
        }
    }
}

#[async_trait]
impl AlertSink for WebhookAlerts {
    async fn notify_deployment_failure(&self, failure: &DeploymentFailure) {
        let result = self
            .client
            .post(&self.url)
            .json(failure)
            .send()
            .await
            .and_then(|response| response.error_for_status());

        if let Err(err) = result {
            error!(
                error = &err as &dyn std::error::Error,
                service = %failure.service_id,
                "failed to deliver deployment-failure alert"
            );
        }
    }
}

/// Fallback sink when no webhook is configured.
pub struct LogAlerts;

#[async_trait]
impl AlertSink for LogAlerts {
    async fn notify_deployment_failure(&self, failure: &DeploymentFailure) {
        warn!(
            service = %failure.service_id,
            service_name = %failure.service_name,
            failed_stage = %failure.failed_stage,
            "deployment failure"
        );
    }
}
