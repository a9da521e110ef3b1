use crate::{
    core::{auth::Gate, store},
    http::{self, Trigger, DEFAULT_MAX_BODY_BYTES},
    k8s, HttpMetrics,
};
use anyhow::{bail, Result};
use clap::Parser;
use prometheus_client::registry::Registry;
use std::{net::SocketAddr, sync::Arc};
use tokio::{net::TcpListener, time::Duration};
use tracing::{error, info_span, Instrument};

#[derive(Debug, Parser)]
#[clap(
    name = "kube-restart",
    about = "Restarts deployments on signed HTTP requests"
)]
pub struct Args {
    #[clap(
        long,
        default_value = "kube_restart=info,warn",
        env = "KUBE_RESTART_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    /// The admin server's address, serving readiness, liveness and metrics.
    #[clap(long, default_value = "0.0.0.0:9990")]
    admin_addr: SocketAddr,

    #[clap(long, default_value = "0.0.0.0:8080")]
    listen_addr: SocketAddr,

    /// Namespace of the secret holding deployment tokens.
    #[clap(long, default_value = "default", env = "TOKEN_SECRET_NAMESPACE")]
    token_secret_namespace: String,

    /// Name of the secret holding deployment tokens.
    ///
    /// Each data key has the form `<namespace>.<deployment>`.
    #[clap(long, default_value = k8s::DEFAULT_TOKEN_SECRET)]
    token_secret_name: String,

    /// Limits the time spent reading and updating a deployment.
    #[clap(long, default_value = "10000")]
    restart_timeout_ms: u64,

    #[clap(long, default_value_t = DEFAULT_MAX_BODY_BYTES)]
    max_body_bytes: usize,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            log_level,
            log_format,
            client,
            admin_addr,
            listen_addr,
            token_secret_namespace,
            token_secret_name,
            restart_timeout_ms,
            max_body_bytes,
        } = self;

        let mut prom = <Registry>::default();
        let reg = prom.sub_registry_with_prefix("kube_restart");
        let watch_metrics = k8s::WatchMetrics::register(reg);
        let http_metrics = HttpMetrics::register(reg);
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let mut runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(kubert::admin::Builder::new(admin_addr).with_prometheus(prom))
            .with_client(client)
            .build()
            .await?;

        // Readiness is withheld until the initial tokens are published.
        let initialized = runtime.initialized_handle();

        // The store is the only owner of the current tokens. Everything else holds a handle.
        let (tokens, store) = store::channel(store::DEFAULT_CAPACITY);
        tokio::spawn(store.run().instrument(info_span!("store")));

        let source =
            k8s::SecretSource::new(runtime.client(), &token_secret_namespace, token_secret_name);
        let watcher = k8s::Watcher::new(source, tokens.clone(), watch_metrics);
        watcher
            .init()
            .instrument(info_span!("tokens", ns = %token_secret_namespace))
            .await?;
        drop(initialized);

        tokio::spawn(
            async move {
                if let Err(error) = watcher.run().await {
                    error!(%error, "Token secret watch stopped");
                }
            }
            .instrument(info_span!("watch", ns = %token_secret_namespace)),
        );

        let restarter = k8s::DeploymentRestarter::new(
            runtime.client(),
            Duration::from_millis(restart_timeout_ms),
        );
        let trigger = Trigger::new(Gate::new(tokens), Arc::new(restarter))
            .with_metrics(http_metrics)
            .with_max_body_bytes(max_body_bytes);
        let listener = TcpListener::bind(listen_addr).await?;
        let shutdown = runtime.shutdown_handle();
        tokio::spawn(async move {
            if let Err(error) = http::serve(listener, trigger, shutdown).await {
                error!(%error, "HTTP server failed");
            }
        });

        // Block the main thread on the shutdown signal. Once it fires, wait for the background
        // tasks to complete before exiting.
        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}
