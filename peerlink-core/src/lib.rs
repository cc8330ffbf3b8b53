//! PeerLink core: one-to-one chat, file transfer and call signaling between two peers.
//! Host-driven: no I/O; the host owns channels and media devices, passes events in and
//! drains notices out.

pub mod call;
pub mod channel;
pub mod chat;
pub mod chunk;
pub mod identity;
pub mod integrity;
pub mod media;
pub mod protocol;
pub mod router;
pub mod session;
pub mod transfer;
pub mod wire;

pub use call::{CallError, CallSession, CallStatus, EndReason};
pub use channel::{ChannelAdapter, ChannelError};
pub use chat::{format_bytes, ChatEntry, ChatLog, Direction, EntryBody, EntryKind, TransferStatus, TransferView};
pub use chunk::{effective_chunk_size, ChunkSource, DEFAULT_CHUNK_SIZE, MAX_CHUNK_SIZE};
pub use identity::{Identity, IdentityError, PeerId};
pub use integrity::{Artifact, ArtifactHandle};
pub use media::{CallHandle, MediaError, MediaHandle, MediaKind, MediaProvider};
pub use protocol::{Envelope, FileChunk, FileMetadata, Message, TransferId};
pub use router::RouteOutcome;
pub use session::{Notice, Session, SessionConfig, SessionError};
pub use transfer::{OutgoingFile, TransferError};
pub use wire::{decode_envelope, decode_frame, encode_frame, encode_message, frame_body, WireError, MAX_FRAME_LEN};
