//! Credential handling for the restart trigger.
//!
//! Each deployment that may be restarted is provisioned with its own token. Tokens are loaded from
//! a single credential bundle and held in a [`store::Store`], an actor task that owns the current
//! [`Tokens`] snapshot. Request handlers read the snapshot through a [`store::Handle`] and the
//! [`auth::Gate`] verifies an HMAC-SHA256 signature over each request body with the deployment's
//! token before a [`Restart`] is issued.
//!
//! ```text
//! [ bundle ] -> decode -> [ Store ] <- Get -- [ Gate ] <- request
//!                            ^
//!                            +-- Replace -- [ watch ]
//! ```

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod auth;
mod deployment;
mod restart;
pub mod store;
pub mod tokens;

pub use self::{
    deployment::{DeploymentRef, InvalidDeploymentRef},
    restart::Restart,
    tokens::{Token, Tokens},
};
