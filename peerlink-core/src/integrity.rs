//! Integrity: SHA-256 digest of reassembled files, and the immutable artifact handed to the UI.

use std::fmt;
use std::sync::Arc;

use sha2::{Digest, Sha256};

use crate::protocol::TransferId;

/// Hash a payload. Returns the 32-byte digest.
pub fn hash_bytes(payload: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(payload);
    hasher.finalize().into()
}

/// Verify a payload against an expected digest.
pub fn verify_bytes(payload: &[u8], expected: &[u8; 32]) -> bool {
    hash_bytes(payload) == *expected
}

/// Reference to a completed inbound file, stored in its chat entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArtifactHandle {
    pub transfer_id: TransferId,
    pub digest: [u8; 32],
}

impl ArtifactHandle {
    pub fn digest_hex(&self) -> String {
        hex::encode(self.digest)
    }
}

impl fmt::Display for ArtifactHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.transfer_id, &self.digest_hex()[..12])
    }
}

/// A reassembled inbound file. Immutable once built; cheap to clone.
#[derive(Debug, Clone)]
pub struct Artifact {
    pub name: String,
    pub mime_type: String,
    bytes: Arc<[u8]>,
    handle: ArtifactHandle,
}

impl Artifact {
    pub fn new(transfer_id: TransferId, name: String, mime_type: String, bytes: Vec<u8>) -> Self {
        let digest = hash_bytes(&bytes);
        Self {
            name,
            mime_type,
            bytes: bytes.into(),
            handle: ArtifactHandle {
                transfer_id,
                digest,
            },
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> u64 {
        self.bytes.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn handle(&self) -> &ArtifactHandle {
        &self.handle
    }

    /// Re-hash the content and compare against the handle's digest.
    pub fn verify(&self) -> bool {
        verify_bytes(&self.bytes, &self.handle.digest)
    }
}
