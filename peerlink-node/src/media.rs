//! Simulated media: capture devices come from config, call signaling goes out as
//! control frames over the chat link. No audio or video is actually captured.

use std::collections::HashSet;
use std::mem;

use peerlink_core::{CallHandle, MediaError, MediaHandle, MediaKind, MediaProvider, PeerId};
use tracing::{debug, info};

use crate::config::MediaConfig;
use crate::signal::Control;

pub struct NodeMedia {
    audio: bool,
    video: bool,
    next_media: u64,
    /// Calls the peer still knows about.
    live: HashSet<u64>,
    outbox: Vec<Control>,
}

impl NodeMedia {
    pub fn new(cfg: &MediaConfig) -> Self {
        Self {
            audio: cfg.audio,
            video: cfg.video,
            next_media: 0,
            live: HashSet::new(),
            outbox: Vec::new(),
        }
    }

    fn next_handle(&mut self) -> MediaHandle {
        self.next_media += 1;
        MediaHandle(self.next_media)
    }

    /// The peer offered `call`; closing it from here must tell them.
    pub fn track_incoming(&mut self, call: &CallHandle) {
        self.live.insert(call.0);
    }

    /// The peer ended `call`; closing it from here must not echo back.
    pub fn remote_ended(&mut self, call: &CallHandle) {
        self.live.remove(&call.0);
    }

    /// Stands in for the remote feed once the call connects.
    pub fn remote_stream(&mut self) -> MediaHandle {
        self.next_handle()
    }

    /// Control frames waiting to go out on the link.
    pub fn take_outbox(&mut self) -> Vec<Control> {
        mem::take(&mut self.outbox)
    }
}

impl MediaProvider for NodeMedia {
    fn acquire_local_media(&mut self, kind: MediaKind) -> Result<MediaHandle, MediaError> {
        if !self.audio {
            return Err(MediaError::Unavailable("no microphone".into()));
        }
        if kind.wants_video() && !self.video {
            return Err(MediaError::Unavailable("no camera".into()));
        }
        let h = self.next_handle();
        debug!(media = h.0, %kind, "local media acquired");
        Ok(h)
    }

    fn place_call(
        &mut self,
        peer: &PeerId,
        _local: &MediaHandle,
        kind: MediaKind,
    ) -> Result<CallHandle, MediaError> {
        let call = uuid::Uuid::new_v4().as_u64_pair().0;
        self.live.insert(call);
        self.outbox.push(Control::CallOffer { call, kind });
        info!(%peer, call, %kind, "calling");
        Ok(CallHandle(call))
    }

    fn answer(&mut self, call: &CallHandle, _local: &MediaHandle) -> Result<(), MediaError> {
        if !self.live.contains(&call.0) {
            return Err(MediaError::Transport("offer withdrawn".into()));
        }
        self.outbox.push(Control::CallAnswer { call: call.0 });
        Ok(())
    }

    fn close_call(&mut self, call: &CallHandle) {
        if self.live.remove(&call.0) {
            self.outbox.push(Control::CallEnd { call: call.0 });
        }
    }

    fn stop_tracks(&mut self, media: &MediaHandle) {
        debug!(media = media.0, "tracks stopped");
    }

    fn set_audio_enabled(&mut self, media: &MediaHandle, enabled: bool) {
        debug!(media = media.0, enabled, "microphone");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn media(audio: bool, video: bool) -> NodeMedia {
        NodeMedia::new(&MediaConfig { audio, video })
    }

    #[test]
    fn missing_devices_fail_acquisition() {
        let mut m = media(true, false);
        assert!(m.acquire_local_media(MediaKind::Audio).is_ok());
        assert_eq!(
            m.acquire_local_media(MediaKind::Video),
            Err(MediaError::Unavailable("no camera".into()))
        );
        let mut m = media(false, true);
        assert!(m.acquire_local_media(MediaKind::Video).is_err());
    }

    #[test]
    fn placed_call_emits_offer_and_single_end() {
        let mut m = media(true, true);
        let local = m.acquire_local_media(MediaKind::Audio).unwrap();
        let call = m.place_call(&PeerId::new("kate"), &local, MediaKind::Audio).unwrap();
        m.close_call(&call);
        m.close_call(&call);
        assert_eq!(
            m.take_outbox(),
            vec![
                Control::CallOffer {
                    call: call.0,
                    kind: MediaKind::Audio
                },
                Control::CallEnd { call: call.0 },
            ]
        );
    }

    #[test]
    fn remote_end_is_not_echoed() {
        let mut m = media(true, true);
        let call = CallHandle(42);
        m.track_incoming(&call);
        m.remote_ended(&call);
        m.close_call(&call);
        assert!(m.take_outbox().is_empty());
        let local = m.acquire_local_media(MediaKind::Audio).unwrap();
        assert!(m.answer(&call, &local).is_err());
    }

    #[test]
    fn answer_tracked_offer() {
        let mut m = media(true, true);
        let call = CallHandle(9);
        m.track_incoming(&call);
        let local = m.acquire_local_media(MediaKind::Video).unwrap();
        m.answer(&call, &local).unwrap();
        assert_eq!(m.take_outbox(), vec![Control::CallAnswer { call: 9 }]);
    }
}
