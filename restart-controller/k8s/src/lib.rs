//! Kubernetes bindings for the restart trigger.
//!
//! Tokens are read from a single `Secret` whose data keys have the form `<namespace>.<name>`. The
//! [`watch::Watcher`] keeps the token store in sync with that secret, and the
//! [`restart::DeploymentRestarter`] rolls a `Deployment` by stamping its pod template.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod metrics;
pub mod restart;
pub mod watch;

pub use self::{
    metrics::WatchMetrics,
    restart::DeploymentRestarter,
    watch::{SecretSource, TokenSource, Watcher},
};
pub use k8s_openapi::api::{apps::v1::Deployment, core::v1::Secret};
pub use kube::{api::ObjectMeta, Client};

/// The default name of the secret holding deployment tokens.
pub const DEFAULT_TOKEN_SECRET: &str = "kube-restart-tokens";
