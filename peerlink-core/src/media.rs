//! Media collaborator: local capture devices and the call transport, both owned by the host.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::identity::PeerId;

/// What a call carries. Video calls capture audio as well.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    pub fn wants_video(self) -> bool {
        matches!(self, MediaKind::Video)
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Audio => f.write_str("audio"),
            MediaKind::Video => f.write_str("video"),
        }
    }
}

/// Opaque reference to a media stream (local capture or remote feed).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MediaHandle(pub u64);

/// Opaque reference to one call at the media transport.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CallHandle(pub u64);

pub trait MediaProvider {
    /// Open capture devices for `kind`: microphone, plus camera for video.
    fn acquire_local_media(&mut self, kind: MediaKind) -> Result<MediaHandle, MediaError>;

    /// Start a call to `peer`, offering `local`. Remote stream, close and error for the
    /// returned handle are reported back by the host.
    fn place_call(
        &mut self,
        peer: &PeerId,
        local: &MediaHandle,
        kind: MediaKind,
    ) -> Result<CallHandle, MediaError>;

    /// Accept an incoming call with `local` as our side of the media.
    fn answer(&mut self, call: &CallHandle, local: &MediaHandle) -> Result<(), MediaError>;

    /// Tear down the call at the transport. Idempotent.
    fn close_call(&mut self, call: &CallHandle);

    /// Stop every capture track of `media`. Idempotent.
    fn stop_tracks(&mut self, media: &MediaHandle);

    /// Enable or disable the audio tracks of `media`.
    fn set_audio_enabled(&mut self, media: &MediaHandle, enabled: bool);
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MediaError {
    #[error("media device unavailable: {0}")]
    Unavailable(String),
    #[error("media permission denied")]
    Denied,
    #[error("call transport error: {0}")]
    Transport(String),
}
