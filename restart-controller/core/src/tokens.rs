use crate::DeploymentRef;
use ahash::AHashMap as HashMap;
use std::{fmt, sync::Arc};
use thiserror::Error;

/// Separates the namespace from the deployment name in a credential bundle key.
pub const KEY_SEPARATOR: char = '.';

/// A deployment's shared secret.
#[derive(Clone, PartialEq, Eq)]
pub struct Token(Vec<u8>);

/// An immutable snapshot of every deployment's token.
///
/// Snapshots are never modified. A new bundle always produces a new snapshot, and cloning a
/// snapshot only bumps a reference count.
#[derive(Clone, Debug, Default)]
pub struct Tokens(Arc<HashMap<DeploymentRef, Token>>);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("key {0:?} could not be split into a namespace and name at '.'")]
    MalformedKey(String),
}

/// Decodes a credential bundle, keyed by `<namespace>.<name>`, into a snapshot.
///
/// A single malformed key rejects the whole bundle.
pub fn decode<K, V>(bundle: impl IntoIterator<Item = (K, V)>) -> Result<Tokens, DecodeError>
where
    K: AsRef<str>,
    V: Into<Vec<u8>>,
{
    let tokens = bundle
        .into_iter()
        .map(|(key, token)| {
            let key = key.as_ref();
            let deployment = parse_key(key).ok_or_else(|| DecodeError::MalformedKey(key.into()))?;
            Ok((deployment, Token(token.into())))
        })
        .collect::<Result<HashMap<_, _>, DecodeError>>()?;
    Ok(Tokens(Arc::new(tokens)))
}

fn parse_key(key: &str) -> Option<DeploymentRef> {
    let (namespace, name) = key.split_once(KEY_SEPARATOR)?;
    if name.contains(KEY_SEPARATOR) {
        return None;
    }
    DeploymentRef::new(namespace, name).ok()
}

// === impl Token ===

impl Token {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<Vec<u8>> for Token {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Token(<redacted>)")
    }
}

// === impl Tokens ===

impl Tokens {
    pub fn get(&self, deployment: &DeploymentRef) -> Option<&Token> {
        self.0.get(deployment)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns true if both values refer to the same snapshot.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl FromIterator<(DeploymentRef, Token)> for Tokens {
    fn from_iter<I: IntoIterator<Item = (DeploymentRef, Token)>>(iter: I) -> Self {
        Self(Arc::new(iter.into_iter().collect()))
    }
}
