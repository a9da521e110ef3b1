use crate::{Client, Deployment};
use anyhow::{anyhow, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use kube::api::{Api, PostParams};
use kube_restart_core::{DeploymentRef, Restart};
use thiserror::Error;
use tokio::time;
use tracing::{debug, info};

/// Changing this pod template annotation causes the deployment controller to roll out new pods,
/// matching `kubectl rollout restart`.
pub const RESTARTED_AT_ANNOTATION: &str = "kubectl.kubernetes.io/restartedAt";

const FIELD_MANAGER: &str = "kube-restart";

/// Restarts deployments through the Kubernetes API.
#[derive(Clone)]
pub struct DeploymentRestarter {
    client: Client,
    timeout: time::Duration,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("deployment {0} has no spec")]
pub struct MissingSpec(DeploymentRef);

// === impl DeploymentRestarter ===

impl DeploymentRestarter {
    pub fn new(client: Client, timeout: time::Duration) -> Self {
        Self { client, timeout }
    }
}

#[async_trait::async_trait]
impl Restart for DeploymentRestarter {
    async fn restart(&self, target: &DeploymentRef) -> Result<()> {
        let api = Api::<Deployment>::namespaced(self.client.clone(), target.namespace());
        let update = async {
            let mut deployment = api.get(target.name()).await?;
            annotate_restarted_at(target, &mut deployment, Utc::now())?;
            let params = PostParams {
                dry_run: false,
                field_manager: Some(FIELD_MANAGER.to_string()),
            };
            // Carries the resource version read above; a concurrent write fails with a conflict.
            api.replace(target.name(), &params, &deployment).await?;
            Ok::<_, anyhow::Error>(())
        };

        time::timeout(self.timeout, update)
            .await
            .map_err(|_| anyhow!("timed out restarting {target} after {:?}", self.timeout))??;
        info!(%target, "Restarted deployment");
        Ok(())
    }
}

/// Stamps the deployment's pod template with the restart time.
fn annotate_restarted_at(
    target: &DeploymentRef,
    deployment: &mut Deployment,
    now: DateTime<Utc>,
) -> Result<(), MissingSpec> {
    let spec = deployment
        .spec
        .as_mut()
        .ok_or_else(|| MissingSpec(target.clone()))?;
    let timestamp = now.to_rfc3339_opts(SecondsFormat::Secs, true);
    debug!(%target, %timestamp, "Annotating pod template");
    spec.template
        .metadata
        .get_or_insert_with(Default::default)
        .annotations
        .get_or_insert_with(Default::default)
        .insert(RESTARTED_AT_ANNOTATION.to_string(), timestamp);
    Ok(())
}
