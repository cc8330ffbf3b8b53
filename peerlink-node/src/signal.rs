//! Node-level control frames sharing the TCP link with chat traffic: the hello
//! handshake and call signaling. Split off before anything reaches the session router.

use peerlink_core::{decode_envelope, frame_body, Envelope, MediaKind, WireError};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum Control {
    /// First frame on a link, each direction: the sender's login name.
    Hello(String),
    CallOffer { call: u64, kind: MediaKind },
    CallAnswer { call: u64 },
    CallEnd { call: u64 },
}

const CONTROL_KINDS: [&str; 4] = ["hello", "call-offer", "call-answer", "call-end"];

impl Control {
    pub fn to_frame(&self) -> Result<Vec<u8>, WireError> {
        frame_body(&serde_json::to_vec(self)?)
    }
}

/// One inbound frame body, classified.
#[derive(Debug, PartialEq)]
pub enum Frame {
    Control(Control),
    Chat(Envelope),
}

pub fn demux(body: &[u8]) -> Result<Frame, WireError> {
    let env = decode_envelope(body)?;
    if CONTROL_KINDS.contains(&env.kind.as_str()) {
        Ok(Frame::Control(serde_json::from_slice(body)?))
    } else {
        Ok(Frame::Chat(env))
    }
}
