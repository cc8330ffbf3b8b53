//! Host-driven API: `Session` receives events from the host and surfaces notices.
//!
//! A session exists between login and logout. It holds at most one chat (a channel
//! adapter with its log and transfers) and one call machine.

use std::mem;

use tracing::{debug, info, warn};

use crate::call::{CallError, CallEvent, CallMachine, CallSession, CallStatus, EndReason};
use crate::channel::{ChannelAdapter, ChannelError};
use crate::chat::{ChatLog, Direction};
use crate::chunk::DEFAULT_CHUNK_SIZE;
use crate::identity::{Identity, IdentityError, PeerId};
use crate::integrity::{Artifact, ArtifactHandle};
use crate::media::{CallHandle, MediaHandle, MediaKind, MediaProvider};
use crate::protocol::{Envelope, Message, TransferId};
use crate::router::{self, RouteOutcome};
use crate::transfer::{OutboundStatus, OutgoingFile, TransferEngine, TransferError, TransferEvent};
use crate::wire;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    /// Outbound chunk size in bytes. Zero means [`DEFAULT_CHUNK_SIZE`]; values above
    /// [`MAX_CHUNK_SIZE`](crate::chunk::MAX_CHUNK_SIZE) are capped.
    pub chunk_size: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

/// UI-facing notification, drained with [`Session::take_notices`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    ChatOpened {
        peer: PeerId,
    },
    ChatClosed {
        peer: PeerId,
    },
    /// Outbound: every byte handed to the channel (`artifact` is `None`).
    /// Inbound: reassembled and retrievable through `artifact`.
    TransferComplete {
        id: TransferId,
        direction: Direction,
        artifact: Option<ArtifactHandle>,
    },
    TransferFailed {
        id: TransferId,
        direction: Direction,
        reason: TransferError,
    },
    CallStatusChanged {
        peer: PeerId,
        kind: MediaKind,
        status: CallStatus,
    },
    CallFailed {
        peer: PeerId,
        error: CallError,
    },
    CallEnded {
        peer: PeerId,
        reason: EndReason,
    },
}

impl From<TransferEvent> for Notice {
    fn from(ev: TransferEvent) -> Self {
        match ev {
            TransferEvent::Sent { id } => Notice::TransferComplete {
                id,
                direction: Direction::Outbound,
                artifact: None,
            },
            TransferEvent::Completed { id, handle, .. } => Notice::TransferComplete {
                id,
                direction: Direction::Inbound,
                artifact: Some(handle),
            },
            TransferEvent::Failed {
                id,
                direction,
                reason,
            } => Notice::TransferFailed {
                id,
                direction,
                reason,
            },
        }
    }
}

impl From<CallEvent> for Notice {
    fn from(ev: CallEvent) -> Self {
        match ev {
            CallEvent::StatusChanged { peer, kind, status } => {
                Notice::CallStatusChanged { peer, kind, status }
            }
            CallEvent::Failed { peer, error } => Notice::CallFailed { peer, error },
            CallEvent::Ended { peer, reason } => Notice::CallEnded { peer, reason },
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Identity(#[from] IdentityError),
    #[error("no chat in progress")]
    NoChat,
    #[error("already chatting with {0}")]
    ChatInProgress(PeerId),
    #[error("channel to {0} is not open yet")]
    ChannelNotOpen(PeerId),
    #[error("message is empty")]
    EmptyMessage,
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Transfer(#[from] TransferError),
    #[error(transparent)]
    Call(#[from] CallError),
}

struct Chat<C> {
    channel: C,
    log: ChatLog,
    transfers: TransferEngine,
    open: bool,
}

pub struct Session<C, M> {
    identity: Identity,
    config: SessionConfig,
    chat: Option<Chat<C>>,
    calls: CallMachine<M>,
    notices: Vec<Notice>,
}

impl<C: ChannelAdapter, M: MediaProvider> Session<C, M> {
    /// Log in as `name`. The session owns the media collaborator until logout.
    pub fn login(name: &str, media: M, config: SessionConfig) -> Result<Self, SessionError> {
        let identity = Identity::login(name)?;
        info!(user = %identity.peer_id(), "logged in");
        Ok(Self {
            identity,
            config,
            chat: None,
            calls: CallMachine::new(media),
            notices: Vec::new(),
        })
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn peer_id(&self) -> &PeerId {
        self.identity.peer_id()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Tear down chat and call, then give the identity back.
    pub fn logout(mut self) -> Identity {
        self.teardown();
        info!(user = %self.identity.peer_id(), "logged out");
        self.identity
    }

    fn teardown(&mut self) {
        self.end_chat();
        self.hang_up();
    }

    /// Notices raised since the last drain, oldest first.
    pub fn take_notices(&mut self) -> Vec<Notice> {
        mem::take(&mut self.notices)
    }

    // ---- chat ----

    /// Install the host's channel to a peer. One chat at a time.
    pub fn start_chat(&mut self, channel: C) -> Result<(), SessionError> {
        if let Some(chat) = &self.chat {
            return Err(SessionError::ChatInProgress(chat.channel.peer().clone()));
        }
        let open = channel.is_open();
        info!(peer = %channel.peer(), open, "chat started");
        let peer = channel.peer().clone();
        self.chat = Some(Chat {
            channel,
            log: ChatLog::new(),
            transfers: TransferEngine::new(self.config.chunk_size),
            open,
        });
        if open {
            self.notices.push(Notice::ChatOpened { peer });
        }
        Ok(())
    }

    /// The host's channel finished opening.
    pub fn on_channel_open(&mut self) {
        let Some(chat) = &mut self.chat else {
            warn!("channel open without a chat, ignoring");
            return;
        };
        if chat.open {
            return;
        }
        chat.open = true;
        let peer = chat.channel.peer().clone();
        info!(%peer, "chat opened");
        self.notices.push(Notice::ChatOpened { peer });
    }

    /// One structured message arrived on the channel.
    pub fn on_channel_message(&mut self, envelope: Envelope) -> RouteOutcome {
        let Some(chat) = &mut self.chat else {
            warn!(kind = %envelope.kind, "message without a chat, dropping");
            return RouteOutcome::Dropped;
        };
        let origin = chat.channel.peer().clone();
        let outcome = router::route(envelope, &origin, &mut chat.log, &mut chat.transfers);
        if let RouteOutcome::Transfer(Some(ev)) = &outcome {
            self.notices.push(ev.clone().into());
        }
        outcome
    }

    /// Raw JSON bytes of one message, for hosts that do not decode themselves.
    pub fn on_channel_frame(&mut self, bytes: &[u8]) -> RouteOutcome {
        match wire::decode_envelope(bytes) {
            Ok(env) => self.on_channel_message(env),
            Err(e) => {
                warn!(error = %e, len = bytes.len(), "undecodable message, dropping");
                RouteOutcome::Dropped
            }
        }
    }

    /// The remote side closed the channel or the transport failed.
    pub fn on_channel_closed(&mut self) {
        if let Some(chat) = self.chat.take() {
            let peer = chat.channel.peer().clone();
            info!(%peer, abandoned = chat.transfers.has_pending_outbound(), "chat closed by remote");
            self.notices.push(Notice::ChatClosed { peer });
        }
    }

    /// Local end of the chat. In-flight transfers are abandoned without telling the peer.
    pub fn end_chat(&mut self) {
        if let Some(mut chat) = self.chat.take() {
            chat.channel.close();
            let peer = chat.channel.peer().clone();
            info!(%peer, "chat ended");
            self.notices.push(Notice::ChatClosed { peer });
        }
    }

    fn open_chat(&mut self) -> Result<&mut Chat<C>, SessionError> {
        let chat = self.chat.as_mut().ok_or(SessionError::NoChat)?;
        if !chat.open || !chat.channel.is_open() {
            return Err(SessionError::ChannelNotOpen(chat.channel.peer().clone()));
        }
        Ok(chat)
    }

    /// Send a text message and record it locally. Returns its log position.
    pub fn send_chat(&mut self, text: &str) -> Result<u64, SessionError> {
        if text.trim().is_empty() {
            return Err(SessionError::EmptyMessage);
        }
        let local = self.identity.peer_id().clone();
        let chat = self.open_chat()?;
        chat.channel.send(&Message::Chat(text.to_string()))?;
        debug!(to = %chat.channel.peer(), len = text.len(), "chat sent");
        Ok(chat.log.append_text(local, text.to_string()))
    }

    /// Start an outbound transfer. Chunks go out on [`pump_transfers`](Self::pump_transfers).
    pub fn send_file(&mut self, file: OutgoingFile) -> Result<TransferId, SessionError> {
        let local = self.identity.peer_id().clone();
        let chat = self.open_chat()?;
        match chat
            .transfers
            .send_file(&local, file, &mut chat.channel, &mut chat.log)
        {
            Ok(id) => {
                if chat.transfers.outbound_status(&id) == Some(OutboundStatus::Sent) {
                    self.notices.push(Notice::TransferComplete {
                        id: id.clone(),
                        direction: Direction::Outbound,
                        artifact: None,
                    });
                }
                Ok(id)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Send one chunk of every active outbound transfer. Returns whether more remain.
    pub fn pump_transfers(&mut self) -> bool {
        self.pump_transfers_within(usize::MAX)
    }

    /// Like [`pump_transfers`](Self::pump_transfers), putting at most `budget` messages on
    /// the channel. Hosts with a bounded send queue pass its free room, minus whatever they
    /// keep for chat.
    pub fn pump_transfers_within(&mut self, budget: usize) -> bool {
        let Some(chat) = &mut self.chat else {
            return false;
        };
        let events = chat
            .transfers
            .pump_at_most(budget, &mut chat.channel, &mut chat.log);
        let pending = chat.transfers.has_pending_outbound();
        self.notices.extend(events.into_iter().map(Notice::from));
        pending
    }

    pub fn has_pending_transfers(&self) -> bool {
        self.chat
            .as_ref()
            .is_some_and(|c| c.transfers.has_pending_outbound())
    }

    /// Peer of the current chat, once its channel is open.
    pub fn chatting_with(&self) -> Option<&PeerId> {
        self.chat
            .as_ref()
            .filter(|c| c.open)
            .map(|c| c.channel.peer())
    }

    pub fn chat_log(&self) -> Option<&ChatLog> {
        self.chat.as_ref().map(|c| &c.log)
    }

    pub fn channel(&self) -> Option<&C> {
        self.chat.as_ref().map(|c| &c.channel)
    }

    pub fn channel_mut(&mut self) -> Option<&mut C> {
        self.chat.as_mut().map(|c| &mut c.channel)
    }

    /// A completed inbound file of the current chat.
    pub fn artifact(&self, handle: &ArtifactHandle) -> Option<&Artifact> {
        self.chat.as_ref()?.transfers.artifact(handle)
    }

    // ---- calls ----

    fn collect_call_events(&mut self) {
        self.notices
            .extend(self.calls.take_events().into_iter().map(Notice::from));
    }

    fn with_calls<T>(&mut self, f: impl FnOnce(&mut CallMachine<M>) -> T) -> T {
        let out = f(&mut self.calls);
        self.collect_call_events();
        out
    }

    pub fn call_status(&self) -> CallStatus {
        self.calls.status()
    }

    pub fn call(&self) -> Option<&CallSession> {
        self.calls.session()
    }

    pub fn media(&self) -> &M {
        self.calls.media()
    }

    pub fn media_mut(&mut self) -> &mut M {
        self.calls.media_mut()
    }

    pub fn start_call(&mut self, peer: PeerId, kind: MediaKind) -> Result<(), SessionError> {
        Ok(self.with_calls(|c| c.start_call(peer, kind))?)
    }

    pub fn on_remote_offer(
        &mut self,
        peer: PeerId,
        kind: MediaKind,
        call: CallHandle,
    ) -> Result<(), SessionError> {
        Ok(self.with_calls(|c| c.on_remote_offer(peer, kind, call))?)
    }

    pub fn answer(&mut self) -> Result<(), SessionError> {
        Ok(self.with_calls(CallMachine::answer)?)
    }

    /// Decline an incoming call. Same teardown as hanging up.
    pub fn reject(&mut self) {
        self.hang_up();
    }

    pub fn hang_up(&mut self) {
        self.with_calls(CallMachine::hang_up)
    }

    pub fn toggle_mute(&mut self) -> Result<bool, SessionError> {
        Ok(self.with_calls(CallMachine::toggle_mute)?)
    }

    pub fn on_remote_stream(&mut self, call: &CallHandle, stream: MediaHandle) {
        self.with_calls(|c| c.on_remote_stream(call, stream))
    }

    pub fn on_call_closed(&mut self, call: &CallHandle) {
        self.with_calls(|c| c.on_call_closed(call))
    }

    pub fn on_call_error(&mut self, call: &CallHandle, message: &str) {
        self.with_calls(|c| c.on_call_error(call, message))
    }
}
