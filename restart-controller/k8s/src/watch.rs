use crate::{Client, WatchMetrics};
use anyhow::{Context, Result};
use futures::{prelude::*, stream::BoxStream};
use k8s_openapi::api::core::v1::Secret;
use kube::{runtime::watcher, Api};
use kube_restart_core::{
    store,
    tokens::{self, DecodeError},
    Tokens,
};
use thiserror::Error;
use tokio::time;
use tracing::{debug, error, info, warn};

pub use kube::runtime::watcher::Event;

const MIN_BACKOFF: time::Duration = time::Duration::from_secs(1);
const MAX_BACKOFF: time::Duration = time::Duration::from_secs(30);

pub type SecretEvents = BoxStream<'static, watcher::Result<Event<Secret>>>;

/// Provides the token secret and a subscription to its changes.
#[async_trait::async_trait]
pub trait TokenSource: Send + Sync {
    /// Fetches the current secret, if it exists.
    async fn fetch(&self) -> Result<Option<Secret>>;

    /// Starts a new subscription. The returned stream may terminate.
    fn watch(&self) -> SecretEvents;
}

/// Reads a single named `Secret` from the Kubernetes API.
#[derive(Clone)]
pub struct SecretSource {
    api: Api<Secret>,
    name: String,
}

/// Keeps the token store in sync with the token secret.
pub struct Watcher<S> {
    source: S,
    store: store::Handle,
    metrics: WatchMetrics,
    backoff: Backoff,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("token secret not found")]
pub struct SecretNotFound;

#[derive(Debug)]
struct Backoff {
    next: time::Duration,
}

// === impl SecretSource ===

impl SecretSource {
    pub fn new(client: Client, namespace: &str, name: impl Into<String>) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            name: name.into(),
        }
    }
}

#[async_trait::async_trait]
impl TokenSource for SecretSource {
    async fn fetch(&self) -> Result<Option<Secret>> {
        Ok(self.api.get_opt(&self.name).await?)
    }

    fn watch(&self) -> SecretEvents {
        let config = watcher::Config::default().fields(&format!("metadata.name={}", self.name));
        watcher(self.api.clone(), config).boxed()
    }
}

// === impl Watcher ===

impl<S: TokenSource> Watcher<S> {
    pub fn new(source: S, store: store::Handle, metrics: WatchMetrics) -> Self {
        Self {
            source,
            store,
            metrics,
            backoff: Backoff::default(),
        }
    }

    /// Fetches the secret and publishes its tokens.
    ///
    /// Any failure here is fatal, including a missing secret: the process must not serve requests
    /// with a token set it could not read.
    pub async fn init(&self) -> Result<()> {
        let secret = self
            .source
            .fetch()
            .await
            .context("failed to fetch token secret")?
            .ok_or(SecretNotFound)?;
        let tokens = decode(Some(&secret)).context("invalid token secret")?;
        self.publish(tokens).await?;
        Ok(())
    }

    /// Follows changes to the secret, re-establishing the watch whenever it terminates.
    ///
    /// Only returns if the store has stopped.
    pub async fn run(mut self) -> Result<(), store::Closed> {
        loop {
            let mut events = self.source.watch();

            // Holds the secret seen while the watch lists its initial state.
            let mut listing = None;
            while let Some(event) = events.next().await {
                match event {
                    Ok(event) => {
                        self.backoff.reset();
                        self.handle(event, &mut listing).await?;
                    }
                    Err(error) => {
                        warn!(%error, "Token secret watch failed");
                        self.backoff.wait().await;
                    }
                }
            }

            warn!("Token secret watch terminated; restarting");
            self.metrics.restarted();
            self.backoff.wait().await;
        }
    }

    async fn handle(
        &self,
        event: Event<Secret>,
        listing: &mut Option<Secret>,
    ) -> Result<(), store::Closed> {
        match event {
            Event::Init => {
                debug!("Listing token secret");
                *listing = None;
                Ok(())
            }
            Event::InitApply(secret) => {
                *listing = Some(secret);
                Ok(())
            }
            Event::InitDone => {
                let secret = listing.take();
                if secret.is_none() {
                    warn!("Token secret not found");
                }
                self.update(secret.as_ref()).await
            }
            Event::Apply(secret) => self.update(Some(&secret)).await,
            Event::Delete(_) => {
                warn!("Token secret deleted");
                self.update(None).await
            }
        }
    }

    async fn update(&self, secret: Option<&Secret>) -> Result<(), store::Closed> {
        match decode(secret) {
            Ok(tokens) => self.publish(tokens).await,
            Err(error) => {
                // Keep serving the last tokens that could be read.
                error!(%error, "Rejected token secret; retaining previous tokens");
                self.metrics.rejected();
                Ok(())
            }
        }
    }

    async fn publish(&self, tokens: Tokens) -> Result<(), store::Closed> {
        let count = tokens.len();
        self.store.replace(tokens).await?;
        self.metrics.published(count);
        info!(tokens = count, "Updated tokens");
        Ok(())
    }
}

/// Decodes a secret's data. A missing secret has no tokens.
fn decode(secret: Option<&Secret>) -> Result<Tokens, DecodeError> {
    let data = secret.and_then(|s| s.data.as_ref());
    tokens::decode(data.into_iter().flatten().map(|(k, v)| (k, v.0.clone())))
}

// === impl Backoff ===

impl Default for Backoff {
    fn default() -> Self {
        Self { next: MIN_BACKOFF }
    }
}

impl Backoff {
    fn reset(&mut self) {
        self.next = MIN_BACKOFF;
    }

    async fn wait(&mut self) {
        debug!(backoff = ?self.next, "Waiting");
        time::sleep(self.next).await;
        self.next = (self.next * 2).min(MAX_BACKOFF);
    }
}
