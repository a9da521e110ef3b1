use super::*;
use crate::k8s::{
    watch::{Event, SecretEvents},
    ObjectMeta, Secret, TokenSource, WatchMetrics, Watcher,
};
use anyhow::bail;
use bytes::Bytes;
use futures::{stream, StreamExt};
use http_body_util::Full;
use k8s_openapi::ByteString;
use kube_restart_core::{auth::Signature, store, tokens, Token, Tokens};
use maplit::btreemap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tower::ServiceExt;

/// Records restarts instead of calling the Kubernetes API.
#[derive(Clone, Default)]
struct Recorder {
    restarts: Arc<Mutex<Vec<DeploymentRef>>>,
    fail: bool,
}

#[async_trait::async_trait]
impl Restart for Recorder {
    async fn restart(&self, target: &DeploymentRef) -> Result<()> {
        self.restarts.lock().push(target.clone());
        if self.fail {
            bail!("deployments.apps {:?} not found", target.name());
        }
        Ok(())
    }
}

struct Test {
    trigger: Trigger,
    store: store::Handle,
    recorder: Recorder,
}

impl Test {
    fn new() -> Self {
        Self::with_recorder(Recorder::default())
    }

    fn with_recorder(recorder: Recorder) -> Self {
        let (handle, store) = store::channel(store::DEFAULT_CAPACITY);
        tokio::spawn(store.run());
        let trigger = Trigger::new(Gate::new(handle.clone()), Arc::new(recorder.clone()));
        Self {
            trigger,
            store: handle,
            recorder,
        }
    }

    async fn with_tokens(
        self,
        bundle: impl IntoIterator<Item = (&'static str, &'static str)>,
    ) -> Self {
        let bundle = bundle.into_iter().map(|(k, v)| (k, v.as_bytes().to_vec()));
        let tokens = tokens::decode(bundle).expect("bundle must decode");
        self.store.replace(tokens).await.unwrap();
        self
    }

    async fn send(&self, req: Request<Full<Bytes>>) -> Response<Body> {
        self.trigger
            .clone()
            .oneshot(req)
            .await
            .expect("service must not fail")
    }

    async fn post(&self, path: &str, body: &'static str, signature: Option<&str>) -> StatusCode {
        let mut req = Request::post(path);
        if let Some(signature) = signature {
            req = req.header(SIGNATURE_HEADER, signature);
        }
        let req = req.body(Full::new(Bytes::from(body))).unwrap();
        self.send(req).await.status()
    }

    async fn get(&self, path: &str) -> StatusCode {
        let req = Request::get(path).body(Full::default()).unwrap();
        self.send(req).await.status()
    }

    fn restarts(&self) -> Vec<DeploymentRef> {
        self.recorder.restarts.lock().clone()
    }
}

fn sign(token: &str, body: &str) -> String {
    Signature::compute(&Token::from(token.as_bytes().to_vec()), body.as_bytes()).to_header()
}

fn web() -> DeploymentRef {
    DeploymentRef::new("default", "web").unwrap()
}

#[tokio::test]
async fn restarts_with_valid_signature() {
    let test = Test::new().with_tokens(btreemap! { "default.web" => "K" }).await;

    let status = test
        .post("/restart/default/web", "b", Some(&sign("K", "b")))
        .await;

    assert_eq!(status, StatusCode::NO_CONTENT);
    assert_eq!(test.restarts(), vec![web()]);
    assert_eq!(test.trigger.metrics.count(Outcome::Restarted), 1);
}

#[tokio::test]
async fn signature_prefix_is_optional() {
    let test = Test::new().with_tokens(btreemap! { "default.web" => "K" }).await;
    let signature = sign("K", "b");
    let bare = signature.strip_prefix("sha256=").unwrap();

    let status = test.post("/restart/default/web", "b", Some(bare)).await;

    assert_eq!(status, StatusCode::NO_CONTENT);
    assert_eq!(test.restarts(), vec![web()]);
}

#[tokio::test]
async fn malformed_signature_is_bad_request() {
    let test = Test::new().with_tokens(btreemap! { "default.web" => "K" }).await;

    let status = test
        .post("/restart/default/web", "b", Some("not-a-hex-digest"))
        .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(test.restarts().is_empty());
    assert_eq!(test.trigger.metrics.count(Outcome::BadRequest), 1);
}

#[tokio::test]
async fn missing_signature_is_unauthorized() {
    let test = Test::new().with_tokens(btreemap! { "default.web" => "K" }).await;
    let status = test.post("/restart/default/web", "b", None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(
        test.post("/restart/default/web", "b", Some("")).await,
        StatusCode::UNAUTHORIZED
    );
    assert!(test.restarts().is_empty());
}

#[tokio::test]
async fn missing_signature_for_unknown_deployment_is_not_found() {
    let test = Test::new().with_tokens(btreemap! { "default.web" => "K" }).await;
    let status = test.post("/restart/default/missing", "b", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(test.restarts().is_empty());
}

#[tokio::test]
async fn unknown_deployment_is_not_found() {
    let test = Test::new().with_tokens(btreemap! { "default.web" => "K" }).await;

    let status = test
        .post("/restart/default/missing", "b", Some(&sign("K", "b")))
        .await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(test.restarts().is_empty());
}

#[tokio::test]
async fn wrong_token_is_unauthorized() {
    let test = Test::new().with_tokens(btreemap! { "default.web" => "K" }).await;

    let status = test
        .post("/restart/default/web", "b", Some(&sign("not-K", "b")))
        .await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(test.restarts().is_empty());
}

#[tokio::test]
async fn tampered_body_is_unauthorized() {
    let test = Test::new().with_tokens(btreemap! { "default.web" => "K" }).await;

    let status = test
        .post("/restart/default/web", "b2", Some(&sign("K", "b")))
        .await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(test.restarts().is_empty());
}

#[tokio::test]
async fn tokens_are_scoped_to_their_deployment() {
    let test = Test::new()
        .with_tokens(btreemap! {
            "default.web" => "K",
            "default.api" => "L",
        })
        .await;

    let status = test
        .post("/restart/default/api", "b", Some(&sign("K", "b")))
        .await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(test.restarts().is_empty());
}

#[tokio::test]
async fn restart_failure_is_internal_error() {
    let test = Test::with_recorder(Recorder {
        fail: true,
        ..Default::default()
    })
    .with_tokens(btreemap! { "default.web" => "K" })
    .await;

    let status = test
        .post("/restart/default/web", "b", Some(&sign("K", "b")))
        .await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(test.restarts(), vec![web()]);
    assert_eq!(test.trigger.metrics.count(Outcome::Failed), 1);
}

#[tokio::test]
async fn oversized_body_is_bad_request() {
    let mut test = Test::new().with_tokens(btreemap! { "default.web" => "K" }).await;
    test.trigger = test.trigger.clone().with_max_body_bytes(4);

    let status = test
        .post("/restart/default/web", "too long", Some(&sign("K", "too long")))
        .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(test.restarts().is_empty());
}

#[tokio::test]
async fn malformed_paths_are_not_found() {
    let test = Test::new().with_tokens(btreemap! { "default.web" => "K" }).await;
    let signature = sign("K", "b");
    for path in [
        "/restart",
        "/restart/",
        "/restart/default",
        "/restart/default/",
        "/restart//web",
        "/restart/default/web/",
        "/restart/default/web/extra",
        "/other",
    ] {
        let status = test.post(path, "b", Some(&signature)).await;
        assert_eq!(status, StatusCode::NOT_FOUND, "{path}");
    }
    assert!(test.restarts().is_empty());
}

#[tokio::test]
async fn restart_requires_post() {
    let test = Test::new().with_tokens(btreemap! { "default.web" => "K" }).await;
    assert_eq!(
        test.get("/restart/default/web").await,
        StatusCode::METHOD_NOT_ALLOWED
    );
    assert!(test.restarts().is_empty());
}

#[tokio::test]
async fn live_without_tokens() {
    let test = Test::new();
    assert_eq!(test.get("/live").await, StatusCode::OK);
    assert_eq!(test.post("/live", "", None).await, StatusCode::METHOD_NOT_ALLOWED);
}

#[tokio::test]
async fn live_does_not_depend_on_the_store() {
    let (handle, store) = store::channel(store::DEFAULT_CAPACITY);
    drop(store);
    let trigger = Trigger::new(Gate::new(handle), Arc::new(Recorder::default()));

    let req = Request::get("/live").body(Full::<Bytes>::default()).unwrap();
    let rsp = trigger.clone().oneshot(req).await.unwrap();
    assert_eq!(rsp.status(), StatusCode::OK);

    // Restart requests fail once the store is gone.
    let req = Request::post("/restart/default/web")
        .header(SIGNATURE_HEADER, sign("K", ""))
        .body(Full::<Bytes>::default())
        .unwrap();
    let rsp = trigger.oneshot(req).await.unwrap();
    assert_eq!(rsp.status(), StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn probes_and_metrics_are_not_served() {
    let test = Test::new().with_tokens(btreemap! { "default.web" => "K" }).await;
    assert_eq!(test.get("/ready").await, StatusCode::NOT_FOUND);
    assert_eq!(test.get("/metrics").await, StatusCode::NOT_FOUND);
}

/// Feeds watch events from the test.
struct FakeSource {
    secret: Option<Secret>,
    events: Mutex<Option<mpsc::UnboundedReceiver<Event<Secret>>>>,
}

#[async_trait::async_trait]
impl TokenSource for FakeSource {
    async fn fetch(&self) -> Result<Option<Secret>> {
        Ok(self.secret.clone())
    }

    fn watch(&self) -> SecretEvents {
        match self.events.lock().take() {
            Some(rx) => stream::unfold(rx, |mut rx| async move {
                let event = rx.recv().await?;
                Some((Ok(event), rx))
            })
            .boxed(),
            None => stream::pending().boxed(),
        }
    }
}

fn mk_secret(data: impl IntoIterator<Item = (&'static str, &'static str)>) -> Secret {
    Secret {
        metadata: ObjectMeta {
            namespace: Some("default".to_string()),
            name: Some(crate::k8s::DEFAULT_TOKEN_SECRET.to_string()),
            ..Default::default()
        },
        data: Some(
            data.into_iter()
                .map(|(k, v)| (k.to_string(), ByteString(v.as_bytes().to_vec())))
                .collect(),
        ),
        ..Default::default()
    }
}

#[tokio::test(start_paused = true)]
async fn watch_update_revokes_deployment() {
    let test = Test::new();
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let watcher = Watcher::new(
        FakeSource {
            secret: Some(mk_secret(btreemap! { "default.web" => "K" })),
            events: Mutex::new(Some(events_rx)),
        },
        test.store.clone(),
        WatchMetrics::default(),
    );
    watcher.init().await.expect("init must succeed");
    tokio::spawn(watcher.run());

    assert_eq!(
        test.post("/restart/default/web", "b", Some(&sign("K", "b")))
            .await,
        StatusCode::NO_CONTENT
    );

    events_tx
        .send(Event::Apply(mk_secret(btreemap! { "default.api" => "L" })))
        .unwrap();

    let mut status = StatusCode::NO_CONTENT;
    for _ in 0..100 {
        status = test
            .post("/restart/default/web", "b", Some(&sign("K", "b")))
            .await;
        if status == StatusCode::NOT_FOUND {
            break;
        }
        time::sleep(time::Duration::from_millis(10)).await;
    }
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(
        test.post("/restart/default/api", "b", Some(&sign("L", "b")))
            .await,
        StatusCode::NO_CONTENT
    );

    let restarts = test.restarts();
    assert_eq!(restarts.first(), Some(&web()));
    assert_eq!(
        restarts.last(),
        Some(&DeploymentRef::new("default", "api").unwrap())
    );
}

#[tokio::test]
async fn snapshots_are_replaced_wholesale() {
    let test = Test::new()
        .with_tokens(btreemap! {
            "default.web" => "K",
            "default.api" => "L",
        })
        .await;
    let tokens: Tokens = tokens::decode([("default.api", b"L2".to_vec())]).unwrap();
    test.store.replace(tokens).await.unwrap();

    assert_eq!(
        test.post("/restart/default/web", "b", Some(&sign("K", "b")))
            .await,
        StatusCode::NOT_FOUND
    );
    assert_eq!(
        test.post("/restart/default/api", "b", Some(&sign("L", "b")))
            .await,
        StatusCode::UNAUTHORIZED
    );
    assert_eq!(
        test.post("/restart/default/api", "b", Some(&sign("L2", "b")))
            .await,
        StatusCode::NO_CONTENT
    );
}
