use crate::DeploymentRef;
use anyhow::Result;

/// Triggers a rolling restart of a deployment's pods.
///
/// Every successful call starts a new rollout. Implementations do not retry.
#[async_trait::async_trait]
pub trait Restart {
    async fn restart(&self, target: &DeploymentRef) -> Result<()>;
}
