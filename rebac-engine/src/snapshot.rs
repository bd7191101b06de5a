use crate::error::{EngineError, Result};
use async_trait::async_trait;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Opaque, totally ordered consistency marker.
///
/// Callers only ever see the encoded string form; ordering is the only
/// property the engine relies on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SnapshotToken(u64);

impl SnapshotToken {
    /// Token issued by a store implementation for its own revision counter.
    pub fn from_revision(revision: u64) -> Self {
        Self(revision)
    }

    pub fn revision(self) -> u64 {
        self.0
    }

    pub fn encode(self) -> String {
        base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(self.0.to_be_bytes())
    }
}

impl fmt::Display for SnapshotToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

impl FromStr for SnapshotToken {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(s)
            .map_err(|e| EngineError::InvalidSnapshotToken(format!("{s}: {e}")))?;
        let bytes: [u8; 8] = bytes
            .try_into()
            .map_err(|_| EngineError::InvalidSnapshotToken(format!("{s}: wrong length")))?;
        Ok(Self(u64::from_be_bytes(bytes)))
    }
}

impl TryFrom<String> for SnapshotToken {
    type Error = EngineError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<SnapshotToken> for String {
    fn from(token: SnapshotToken) -> Self {
        token.encode()
    }
}

/// Issues and validates snapshot tokens for a relationship store.
#[async_trait]
pub trait SnapshotTokenService: Send + Sync {
    /// Token for the latest consistent state.
    async fn head_token(&self) -> Result<SnapshotToken>;

    /// Fails with `InvalidSnapshotToken` if `token` cannot be served.
    async fn validate_token(&self, token: &SnapshotToken) -> Result<()>;
}
