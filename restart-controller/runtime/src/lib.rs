#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use kube_restart_core as core;
pub use kube_restart_k8s as k8s;

mod args;
pub mod http;
mod metrics;

pub use self::{args::Args, http::Trigger, metrics::HttpMetrics};
