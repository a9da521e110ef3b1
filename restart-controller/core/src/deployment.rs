use std::fmt;
use thiserror::Error;

/// Identifies a Deployment by namespace and name.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeploymentRef {
    namespace: String,
    name: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("deployment references require a non-empty namespace and name")]
pub struct InvalidDeploymentRef(());

// === impl DeploymentRef ===

impl DeploymentRef {
    pub fn new(
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Result<Self, InvalidDeploymentRef> {
        let namespace = namespace.into();
        let name = name.into();
        if namespace.is_empty() || name.is_empty() {
            return Err(InvalidDeploymentRef(()));
        }
        Ok(Self { namespace, name })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for DeploymentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}
