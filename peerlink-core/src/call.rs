//! Call signaling state machine: one audio/video call at a time against the host's media collaborator.
//!
//! ```text
//! idle --start_call--> outgoing --remote stream--> active
//! idle --remote offer--> incoming --answer, remote stream--> active
//! outgoing | incoming | active --hang up | remote close | transport error--> idle
//! active --toggle_mute--> active
//! ```
//!
//! Idle is the absence of a [`CallSession`]. Every way back to idle goes through one
//! teardown that stops local tracks, closes the call at the transport and drops the session.

use std::fmt;
use std::mem;

use tracing::{error, info, warn};

use crate::identity::PeerId;
use crate::media::{CallHandle, MediaError, MediaHandle, MediaKind, MediaProvider};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallStatus {
    Idle,
    Outgoing,
    Incoming,
    Active,
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CallStatus::Idle => "idle",
            CallStatus::Outgoing => "outgoing",
            CallStatus::Incoming => "incoming",
            CallStatus::Active => "active",
        };
        f.write_str(s)
    }
}

/// The single live call. Never in `Idle` status; idle means no session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSession {
    remote_peer: PeerId,
    kind: MediaKind,
    status: CallStatus,
    muted: bool,
    local_media: Option<MediaHandle>,
    remote_media: Option<MediaHandle>,
    call: CallHandle,
}

impl CallSession {
    pub fn remote_peer(&self) -> &PeerId {
        &self.remote_peer
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn status(&self) -> CallStatus {
        self.status
    }

    pub fn muted(&self) -> bool {
        self.muted
    }

    pub fn local_media(&self) -> Option<&MediaHandle> {
        self.local_media.as_ref()
    }

    pub fn remote_media(&self) -> Option<&MediaHandle> {
        self.remote_media.as_ref()
    }

    pub fn call(&self) -> &CallHandle {
        &self.call
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndReason {
    HungUp,
    RemoteClosed,
    TransportError(String),
    /// Answering failed locally (media or transport); the offer is dropped.
    AnswerFailed,
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndReason::HungUp => f.write_str("hung up"),
            EndReason::RemoteClosed => f.write_str("remote closed"),
            EndReason::TransportError(e) => write!(f, "transport error: {e}"),
            EndReason::AnswerFailed => f.write_str("answer failed"),
        }
    }
}

/// Outward report of what the machine did, drained by the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallEvent {
    StatusChanged {
        peer: PeerId,
        kind: MediaKind,
        status: CallStatus,
    },
    Failed {
        peer: PeerId,
        error: CallError,
    },
    Ended {
        peer: PeerId,
        reason: EndReason,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CallError {
    #[error("a call is already {0}")]
    Busy(CallStatus),
    #[error("cannot {action} while {status}")]
    InvalidState {
        action: &'static str,
        status: CallStatus,
    },
    #[error(transparent)]
    Media(#[from] MediaError),
}

pub struct CallMachine<M> {
    media: M,
    session: Option<CallSession>,
    events: Vec<CallEvent>,
}

impl<M: MediaProvider> CallMachine<M> {
    pub fn new(media: M) -> Self {
        Self {
            media,
            session: None,
            events: Vec::new(),
        }
    }

    pub fn status(&self) -> CallStatus {
        self.session
            .as_ref()
            .map_or(CallStatus::Idle, |s| s.status)
    }

    pub fn session(&self) -> Option<&CallSession> {
        self.session.as_ref()
    }

    pub fn media(&self) -> &M {
        &self.media
    }

    pub fn media_mut(&mut self) -> &mut M {
        &mut self.media
    }

    /// Events produced since the last call, oldest first.
    pub fn take_events(&mut self) -> Vec<CallEvent> {
        mem::take(&mut self.events)
    }

    fn refuse_if_busy(&self, action: &'static str) -> Result<(), CallError> {
        match &self.session {
            Some(s) => {
                error!(action, status = %s.status, peer = %s.remote_peer, "call machine occupied");
                Err(CallError::Busy(s.status))
            }
            None => Ok(()),
        }
    }

    fn set_status(&mut self, status: CallStatus) {
        if let Some(s) = &mut self.session {
            s.status = status;
            info!(peer = %s.remote_peer, kind = %s.kind, %status, "call status");
            self.events.push(CallEvent::StatusChanged {
                peer: s.remote_peer.clone(),
                kind: s.kind,
                status,
            });
        }
    }

    /// Local intent to call `peer`. Acquires media first; nothing is created if that fails.
    pub fn start_call(&mut self, peer: PeerId, kind: MediaKind) -> Result<(), CallError> {
        self.refuse_if_busy("start a call")?;
        let local = match self.media.acquire_local_media(kind) {
            Ok(h) => h,
            Err(e) => return Err(self.fail(peer, e.into())),
        };
        let call = match self.media.place_call(&peer, &local, kind) {
            Ok(c) => c,
            Err(e) => {
                self.media.stop_tracks(&local);
                return Err(self.fail(peer, e.into()));
            }
        };
        self.session = Some(CallSession {
            remote_peer: peer,
            kind,
            status: CallStatus::Outgoing,
            muted: false,
            local_media: Some(local),
            remote_media: None,
            call,
        });
        self.set_status(CallStatus::Outgoing);
        Ok(())
    }

    /// Inbound offer. While busy the offer is refused at the transport and the current
    /// call is left untouched.
    pub fn on_remote_offer(
        &mut self,
        peer: PeerId,
        kind: MediaKind,
        call: CallHandle,
    ) -> Result<(), CallError> {
        if let Some(s) = &self.session {
            warn!(from = %peer, current = %s.remote_peer, "refusing call offer while busy");
            let status = s.status;
            // A repeated offer for the live call must not tear it down.
            if call != s.call {
                self.media.close_call(&call);
            }
            return Err(CallError::Busy(status));
        }
        self.session = Some(CallSession {
            remote_peer: peer,
            kind,
            status: CallStatus::Incoming,
            muted: false,
            local_media: None,
            remote_media: None,
            call,
        });
        self.set_status(CallStatus::Incoming);
        Ok(())
    }

    /// Accept the incoming call. The call turns active once the remote stream shows up.
    pub fn answer(&mut self) -> Result<(), CallError> {
        let (kind, call) = match &self.session {
            Some(s) if s.status == CallStatus::Incoming && s.local_media.is_none() => {
                (s.kind, s.call.clone())
            }
            _ => {
                return Err(CallError::InvalidState {
                    action: "answer",
                    status: self.status(),
                })
            }
        };
        let local = match self.media.acquire_local_media(kind) {
            Ok(h) => h,
            Err(e) => return Err(self.abort_answer(e)),
        };
        if let Some(s) = &mut self.session {
            s.local_media = Some(local.clone());
        }
        if let Err(e) = self.media.answer(&call, &local) {
            return Err(self.abort_answer(e));
        }
        Ok(())
    }

    fn abort_answer(&mut self, e: MediaError) -> CallError {
        let err = CallError::from(e);
        if let Some(s) = &self.session {
            self.events.push(CallEvent::Failed {
                peer: s.remote_peer.clone(),
                error: err.clone(),
            });
        }
        self.teardown(EndReason::AnswerFailed);
        err
    }

    /// The transport delivered the remote peer's stream for `call`.
    pub fn on_remote_stream(&mut self, call: &CallHandle, stream: MediaHandle) {
        let Some(s) = self.session.as_mut().filter(|s| s.call == *call) else {
            warn!(?call, "remote stream for unknown call, ignoring");
            return;
        };
        let ready = match s.status {
            CallStatus::Outgoing | CallStatus::Active => true,
            CallStatus::Incoming => s.local_media.is_some(),
            CallStatus::Idle => false,
        };
        if !ready {
            warn!(peer = %s.remote_peer, "remote stream before answer, ignoring");
            return;
        }
        s.remote_media = Some(stream);
        if s.status != CallStatus::Active {
            self.set_status(CallStatus::Active);
        }
    }

    /// Local hang-up, reject or cancel. No-op when idle.
    pub fn hang_up(&mut self) {
        self.teardown(EndReason::HungUp);
    }

    /// The transport reports the call closed by the remote side.
    pub fn on_call_closed(&mut self, call: &CallHandle) {
        if self.owns(call) {
            self.teardown(EndReason::RemoteClosed);
        }
    }

    /// The transport reports an error on the call.
    pub fn on_call_error(&mut self, call: &CallHandle, message: &str) {
        if self.owns(call) {
            warn!(error = message, "call transport error");
            self.teardown(EndReason::TransportError(message.to_string()));
        }
    }

    /// Flip mute on an active call. Returns the new muted state.
    pub fn toggle_mute(&mut self) -> Result<bool, CallError> {
        let status = self.status();
        let Some(s) = self
            .session
            .as_mut()
            .filter(|s| s.status == CallStatus::Active)
        else {
            return Err(CallError::InvalidState {
                action: "toggle mute",
                status,
            });
        };
        s.muted = !s.muted;
        if let Some(local) = &s.local_media {
            self.media.set_audio_enabled(local, !s.muted);
        }
        info!(peer = %s.remote_peer, muted = s.muted, "mute toggled");
        Ok(s.muted)
    }

    fn owns(&self, call: &CallHandle) -> bool {
        let owned = self.session.as_ref().is_some_and(|s| s.call == *call);
        if !owned {
            warn!(?call, "event for stale call, ignoring");
        }
        owned
    }

    fn fail(&mut self, peer: PeerId, error: CallError) -> CallError {
        warn!(%peer, %error, "call failed");
        self.events.push(CallEvent::Failed {
            peer,
            error: error.clone(),
        });
        error
    }

    /// Release everything the session holds and return to idle.
    fn teardown(&mut self, reason: EndReason) {
        let Some(s) = self.session.take() else {
            return;
        };
        self.media.close_call(&s.call);
        if let Some(local) = &s.local_media {
            self.media.stop_tracks(local);
        }
        info!(peer = %s.remote_peer, %reason, "call ended");
        self.events.push(CallEvent::Ended {
            peer: s.remote_peer,
            reason,
        });
    }
}
