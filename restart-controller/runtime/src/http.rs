//! The HTTP front door.
//!
//! - `POST /restart/{namespace}/{deployment}` restarts a deployment when the request body is signed
//!   with the deployment's token in the `X-Hub-Signature-256` header.
//! - `GET /live` always succeeds.
//!
//! Readiness and metrics are served by the admin server.

use crate::HttpMetrics;
use anyhow::Result;
use futures::future;
use http::{header, Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Limited};
use hyper_util::{
    rt::{TokioExecutor, TokioIo},
    server::conn::auto,
    service::TowerToHyperService,
};
use kube_restart_core::{
    auth::{Denied, Gate, SIGNATURE_HEADER},
    DeploymentRef, Restart,
};
use kubert::shutdown;
use prometheus_client::encoding::EncodeLabelValue;
use std::{convert::Infallible, sync::Arc, task};
use tokio::{
    net::{TcpListener, TcpStream},
    time,
};
use tracing::{debug, error, info, info_span, instrument, trace, warn, Instrument};

/// Restart requests larger than this are rejected unless configured otherwise.
pub const DEFAULT_MAX_BODY_BYTES: usize = 1024 * 1024;

const RESTART_PREFIX: &str = "/restart/";

type Body = http_body_util::Full<bytes::Bytes>;

/// Serves restart requests and the liveness probe.
#[derive(Clone)]
pub struct Trigger {
    gate: Gate,
    restart: Arc<dyn Restart + Send + Sync>,
    metrics: HttpMetrics,
    max_body_bytes: usize,
}

/// The result of a restart request.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum Outcome {
    Restarted,
    BadRequest,
    Unauthorized,
    UnknownDeployment,
    Failed,
}

// === impl Trigger ===

impl Trigger {
    pub fn new(gate: Gate, restart: Arc<dyn Restart + Send + Sync>) -> Self {
        Self {
            gate,
            restart,
            metrics: HttpMetrics::default(),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }

    pub fn with_metrics(self, metrics: HttpMetrics) -> Self {
        Self { metrics, ..self }
    }

    pub fn with_max_body_bytes(self, max_body_bytes: usize) -> Self {
        Self {
            max_body_bytes,
            ..self
        }
    }

    async fn handle_restart<B>(self, target: DeploymentRef, req: Request<B>) -> Response<Body>
    where
        B: http_body::Body + Send + 'static,
        B::Data: Send,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let (parts, body) = req.into_parts();
        let body = match Limited::new(body, self.max_body_bytes).collect().await {
            Ok(body) => body.to_bytes(),
            Err(error) => {
                info!(%target, %error, "Failed to read request body");
                return self.respond(Outcome::BadRequest);
            }
        };

        let signature = parts.headers.get(SIGNATURE_HEADER).map(|v| v.as_bytes());
        if let Err(denied) = self.gate.authorize(&target, &body, signature).await {
            let outcome = match denied {
                Denied::Malformed(_) => Outcome::BadRequest,
                Denied::UnknownDeployment(_) => Outcome::UnknownDeployment,
                Denied::Unauthorized(_) => Outcome::Unauthorized,
                Denied::Store(_) => Outcome::Failed,
            };
            if outcome == Outcome::Failed {
                error!(%target, error = %denied, "Failed to authorize request");
            } else {
                info!(%target, error = %denied, "Denied");
            }
            return self.respond(outcome);
        }

        match self.restart.restart(&target).await {
            Ok(()) => self.respond(Outcome::Restarted),
            Err(error) => {
                error!(%target, error = %format_args!("{error:#}"), "Failed to restart deployment");
                self.respond(Outcome::Failed)
            }
        }
    }

    fn respond(&self, outcome: Outcome) -> Response<Body> {
        self.metrics.observe(outcome);
        empty(outcome.status())
    }
}

impl<B> tower::Service<Request<B>> for Trigger
where
    B: http_body::Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    type Response = Response<Body>;
    type Error = Infallible;
    type Future = future::BoxFuture<'static, Result<Response<Body>, Infallible>>;

    fn poll_ready(&mut self, _cx: &mut task::Context<'_>) -> task::Poll<Result<(), Infallible>> {
        task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<B>) -> Self::Future {
        trace!(method = %req.method(), path = %req.uri().path());
        let rsp = match req.uri().path() {
            // Liveness never depends on the token store.
            "/live" => live(req.method()),
            path => match path.strip_prefix(RESTART_PREFIX).and_then(parse_target) {
                Some(target) if req.method() == Method::POST => {
                    let trigger = self.clone();
                    return Box::pin(async move { Ok(trigger.handle_restart(target, req).await) });
                }
                Some(_) => empty(StatusCode::METHOD_NOT_ALLOWED),
                None => empty(StatusCode::NOT_FOUND),
            },
        };
        Box::pin(future::ok(rsp))
    }
}

/// Parses `{namespace}/{deployment}`.
fn parse_target(path: &str) -> Option<DeploymentRef> {
    let (namespace, name) = path.split_once('/')?;
    if name.contains('/') {
        return None;
    }
    DeploymentRef::new(namespace, name).ok()
}

fn live(method: &Method) -> Response<Body> {
    if method != Method::GET && method != Method::HEAD {
        return empty(StatusCode::METHOD_NOT_ALLOWED);
    }
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/plain")
        .body(Body::from("live\n"))
        .expect("live response must be valid")
}

fn empty(status: StatusCode) -> Response<Body> {
    Response::builder()
        .status(status)
        .body(Body::default())
        .expect("empty response must be valid")
}

// === impl Outcome ===

impl Outcome {
    fn status(self) -> StatusCode {
        match self {
            Self::Restarted => StatusCode::NO_CONTENT,
            Self::BadRequest => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::UnknownDeployment => StatusCode::NOT_FOUND,
            Self::Failed => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

// === serve ===

/// Accepts connections until shutdown is signaled.
#[instrument(skip_all, fields(addr = ?listener.local_addr().ok()))]
pub async fn serve(
    listener: TcpListener,
    trigger: Trigger,
    drain: shutdown::Watch,
) -> Result<()> {
    info!("HTTP server listening");
    loop {
        let (io, client) = tokio::select! {
            res = listener.accept() => match res {
                Ok(conn) => conn,
                Err(error) => {
                    warn!(%error, "Failed to accept connection");
                    time::sleep(time::Duration::from_millis(100)).await;
                    continue;
                }
            },
            _handle = drain.clone().signaled() => {
                debug!("No longer accepting connections");
                return Ok(());
            }
        };

        tokio::spawn(
            serve_connection(io, trigger.clone(), drain.clone())
                .instrument(info_span!("conn", %client)),
        );
    }
}

async fn serve_connection(io: TcpStream, trigger: Trigger, drain: shutdown::Watch) {
    let builder = auto::Builder::new(TokioExecutor::new());
    let conn = builder.serve_connection(TokioIo::new(io), TowerToHyperService::new(trigger));
    tokio::pin!(conn);

    let res = tokio::select! {
        res = conn.as_mut() => res,
        handle = drain.signaled() => {
            conn.as_mut().graceful_shutdown();
            handle.release_after(conn.as_mut()).await
        }
    };
    if let Err(error) = res {
        debug!(%error, "Connection closed");
    }
}

#[cfg(test)]
mod tests;
