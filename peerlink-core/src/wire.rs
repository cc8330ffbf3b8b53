//! Encoding: one JSON object per message; framing for byte streams is a 4-byte LE length prefix.

use crate::protocol::{Envelope, Message};

const LEN_SIZE: usize = 4;
/// Largest accepted frame body. 4 MiB, well above one base64 chunk.
pub const MAX_FRAME_LEN: u32 = 4 * 1024 * 1024;

/// Encode a message as its JSON object.
pub fn encode_message(msg: &Message) -> Result<Vec<u8>, WireError> {
    Ok(serde_json::to_vec(msg)?)
}

/// Decode a JSON object into an envelope. Unknown kinds decode fine.
pub fn decode_envelope(bytes: &[u8]) -> Result<Envelope, WireError> {
    Ok(serde_json::from_slice(bytes)?)
}

/// Encode a message into a single frame: 4 bytes LE length + JSON body.
pub fn encode_frame(msg: &Message) -> Result<Vec<u8>, WireError> {
    frame_body(&encode_message(msg)?)
}

/// Frame an already-encoded body (used by hosts that add their own message kinds).
pub fn frame_body(body: &[u8]) -> Result<Vec<u8>, WireError> {
    let len = u32::try_from(body.len()).map_err(|_| WireError::TooLarge)?;
    if len > MAX_FRAME_LEN {
        return Err(WireError::TooLarge);
    }
    let mut out = Vec::with_capacity(LEN_SIZE + body.len());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(body);
    Ok(out)
}

/// Decode one frame from the front of `bytes`. Returns the envelope and the number of bytes consumed.
/// Call with partial buffer; returns `NeedMore` if not enough bytes (caller should try again after more data).
pub fn decode_frame(bytes: &[u8]) -> Result<(Envelope, usize), WireError> {
    let body_len = frame_len(bytes)?;
    let env = decode_envelope(&bytes[LEN_SIZE..LEN_SIZE + body_len])?;
    Ok((env, LEN_SIZE + body_len))
}

/// Length of the body of the frame at the front of `bytes`, once it is fully buffered.
pub fn frame_len(bytes: &[u8]) -> Result<usize, WireError> {
    if bytes.len() < LEN_SIZE {
        return Err(WireError::NeedMore);
    }
    let len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    if len > MAX_FRAME_LEN {
        return Err(WireError::TooLarge);
    }
    let len = len as usize;
    if bytes.len() < LEN_SIZE + len {
        return Err(WireError::NeedMore);
    }
    Ok(len)
}

/// Error encoding or decoding (need more bytes, too large, or malformed JSON).
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("need more bytes")]
    NeedMore,
    #[error("frame too large")]
    TooLarge,
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}
