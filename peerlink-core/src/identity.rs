//! Peer identity: the name a peer is reachable under, and the logged-in user context.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Remote or local peer identity. Peers address each other by name.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(name: impl Into<String>) -> Self {
        PeerId(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        PeerId::new(s)
    }
}

/// Logged-in user. Built on login, consumed on logout; the session holds the only copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    peer_id: PeerId,
}

impl Identity {
    /// Validate and build an identity. Names are trimmed; empty names and names with
    /// whitespace or control characters are rejected.
    pub fn login(name: &str) -> Result<Self, IdentityError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(IdentityError::Empty);
        }
        if name.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(IdentityError::InvalidName(name.to_string()));
        }
        Ok(Self {
            peer_id: PeerId::new(name),
        })
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }
}

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("peer name must not be empty")]
    Empty,
    #[error("invalid peer name: {0:?}")]
    InvalidName(String),
}
