//! An actor that owns the current [`Tokens`] snapshot.
//!
//! All reads and writes are messages processed in order by a single task, so a reader always
//! receives one complete snapshot: the initial empty one or one that was passed to
//! [`Handle::replace`].

use crate::Tokens;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

/// Bounds the number of unprocessed requests.
pub const DEFAULT_CAPACITY: usize = 1024;

/// Processes requests against the current snapshot.
#[derive(Debug)]
pub struct Store {
    rx: mpsc::Receiver<Request>,
    tokens: Tokens,
}

/// Issues requests to a [`Store`].
#[derive(Clone, Debug)]
pub struct Handle {
    tx: mpsc::Sender<Request>,
}

#[derive(Debug, Error)]
#[error("token store is no longer running")]
pub struct Closed(());

#[derive(Debug)]
enum Request {
    Get(oneshot::Sender<Tokens>),
    Replace(Tokens),
}

/// Creates a store that starts with an empty snapshot.
pub fn channel(capacity: usize) -> (Handle, Store) {
    let (tx, rx) = mpsc::channel(capacity);
    let store = Store {
        rx,
        tokens: Tokens::default(),
    };
    (Handle { tx }, store)
}

// === impl Store ===

impl Store {
    /// Serves requests until every [`Handle`] has been dropped.
    pub async fn run(mut self) {
        while let Some(req) = self.rx.recv().await {
            match req {
                Request::Get(rsp) => {
                    // The requester may have gone away.
                    let _ = rsp.send(self.tokens.clone());
                }
                Request::Replace(tokens) => {
                    debug!(tokens = tokens.len(), "Replacing tokens");
                    self.tokens = tokens;
                }
            }
        }
        debug!("All handles dropped");
    }
}

// === impl Handle ===

impl Handle {
    /// Returns the current snapshot.
    pub async fn get(&self) -> Result<Tokens, Closed> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(Request::Get(tx))
            .await
            .map_err(|_| Closed(()))?;
        rx.await.map_err(|_| Closed(()))
    }

    /// Replaces the current snapshot.
    ///
    /// Returns once the request is queued; any `get` queued after it observes `tokens`.
    pub async fn replace(&self, tokens: Tokens) -> Result<(), Closed> {
        self.tx
            .send(Request::Replace(tokens))
            .await
            .map_err(|_| Closed(()))
    }
}
