//! Peer session wire protocol: message kinds carried over a data channel.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Kind tag of a chat text message.
pub const KIND_CHAT: &str = "chat";
/// Kind tag of the metadata message that opens a file transfer.
pub const KIND_FILE_METADATA: &str = "file-metadata";
/// Kind tag of one file chunk.
pub const KIND_FILE_CHUNK: &str = "file-chunk";

/// Transfer identifier, unique within one chat session.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransferId(String);

impl TransferId {
    /// Fresh random id for an outbound transfer.
    pub fn generate() -> Self {
        TransferId(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TransferId {
    fn from(s: &str) -> Self {
        TransferId(s.to_string())
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Announces a file before its first chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub id: TransferId,
    pub name: String,
    pub size: u64,
    #[serde(rename = "type", default)]
    pub mime_type: String,
}

/// One slice of a file. Position is implied by arrival order.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChunk {
    pub id: TransferId,
    #[serde(with = "base64_bytes")]
    pub chunk: Vec<u8>,
}

impl fmt::Debug for FileChunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileChunk")
            .field("id", &self.id)
            .field("len", &self.chunk.len())
            .finish()
    }
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(v))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s: String = Deserialize::deserialize(d)?;
        STANDARD
            .decode(s.as_bytes())
            .map_err(|e| serde::de::Error::custom(format!("invalid base64 chunk: {e}")))
    }
}

/// All known message kinds. Serialized as `{ "type": ..., "payload": ... }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum Message {
    /// Plain chat text.
    Chat(String),
    FileMetadata(FileMetadata),
    FileChunk(FileChunk),
}

impl Message {
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Chat(_) => KIND_CHAT,
            Message::FileMetadata(_) => KIND_FILE_METADATA,
            Message::FileChunk(_) => KIND_FILE_CHUNK,
        }
    }
}

/// A structured message as it arrives from a channel, before its kind is interpreted.
/// Kinds this build does not know about survive decoding so they can be dropped by the
/// router instead of failing the whole frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Envelope {
    /// Interpret the envelope. `Ok(None)` for an unknown kind; `Err` when the kind is
    /// known but its payload does not match.
    pub fn into_message(self) -> Result<Option<Message>, serde_json::Error> {
        let msg = match self.kind.as_str() {
            KIND_CHAT => Message::Chat(serde_json::from_value(self.payload)?),
            KIND_FILE_METADATA => Message::FileMetadata(serde_json::from_value(self.payload)?),
            KIND_FILE_CHUNK => Message::FileChunk(serde_json::from_value(self.payload)?),
            _ => return Ok(None),
        };
        Ok(Some(msg))
    }
}

impl TryFrom<&Message> for Envelope {
    type Error = serde_json::Error;

    fn try_from(msg: &Message) -> Result<Self, Self::Error> {
        let payload = match msg {
            Message::Chat(text) => serde_json::Value::String(text.clone()),
            Message::FileMetadata(meta) => serde_json::to_value(meta)?,
            Message::FileChunk(chunk) => serde_json::to_value(chunk)?,
        };
        Ok(Envelope {
            kind: msg.kind().to_string(),
            payload,
        })
    }
}
