use crate::{store, DeploymentRef, Token};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;
use tracing::trace;

/// The request header carrying the body signature.
pub const SIGNATURE_HEADER: &str = "x-hub-signature-256";

const SIGNATURE_PREFIX: &str = "sha256=";

type HmacSha256 = Hmac<Sha256>;

/// Verifies request signatures against the current tokens.
#[derive(Clone, Debug)]
pub struct Gate {
    store: store::Handle,
}

/// A decoded HMAC-SHA256 digest presented by a client.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Signature(Vec<u8>);

#[derive(Debug, Error, PartialEq)]
pub enum SignatureError {
    #[error("signature header is not valid UTF-8")]
    NotUtf8,

    #[error("invalid signature encoding: {0}")]
    Hex(#[from] hex::FromHexError),
}

/// Why a request was not authorized.
#[derive(Debug, Error)]
pub enum Denied {
    #[error(transparent)]
    Malformed(#[from] SignatureError),

    #[error("no token registered for {0}")]
    UnknownDeployment(DeploymentRef),

    #[error("signature does not match the token for {0}")]
    Unauthorized(DeploymentRef),

    #[error(transparent)]
    Store(#[from] store::Closed),
}

// === impl Gate ===

impl Gate {
    pub fn new(store: store::Handle) -> Self {
        Self { store }
    }

    /// Authorizes a request to act on `target`.
    ///
    /// The signature is decoded before the token lookup so that malformed requests never reach the
    /// store.
    pub async fn authorize(
        &self,
        target: &DeploymentRef,
        body: &[u8],
        signature: Option<&[u8]>,
    ) -> Result<(), Denied> {
        let signature = Signature::from_header(signature)?;

        let tokens = self.store.get().await?;
        let token = tokens
            .get(target)
            .ok_or_else(|| Denied::UnknownDeployment(target.clone()))?;

        if !signature.verify(token, body) {
            return Err(Denied::Unauthorized(target.clone()));
        }
        trace!(%target, "Authorized");
        Ok(())
    }
}

// === impl Signature ===

impl Signature {
    /// Parses a header value of the form `sha256=<hex>`. The prefix is optional.
    ///
    /// A missing header is read as an empty signature, which never verifies.
    pub fn from_header(value: Option<&[u8]>) -> Result<Self, SignatureError> {
        let value = value.unwrap_or_default();
        let value = std::str::from_utf8(value).map_err(|_| SignatureError::NotUtf8)?;
        let hex = value.strip_prefix(SIGNATURE_PREFIX).unwrap_or(value);
        Ok(Self(hex::decode(hex)?))
    }

    /// Signs `body` with `token`.
    pub fn compute(token: &Token, body: &[u8]) -> Self {
        Self(hmac(token, body).finalize().into_bytes().to_vec())
    }

    /// Checks the signature against `body` in constant time.
    pub fn verify(&self, token: &Token, body: &[u8]) -> bool {
        hmac(token, body).verify_slice(&self.0).is_ok()
    }

    /// Formats the signature as a header value.
    pub fn to_header(&self) -> String {
        format!("{SIGNATURE_PREFIX}{}", hex::encode(&self.0))
    }
}

fn hmac(token: &Token, body: &[u8]) -> HmacSha256 {
    let mut mac =
        HmacSha256::new_from_slice(token.as_bytes()).expect("HMAC can take a key of any size");
    mac.update(body);
    mac
}
