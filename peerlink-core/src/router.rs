//! Message router: classify inbound envelopes by kind and dispatch to the chat log or the transfer engine.

use tracing::{debug, warn};

use crate::chat::ChatLog;
use crate::identity::PeerId;
use crate::protocol::{Envelope, Message};
use crate::transfer::{TransferEngine, TransferEvent};

/// What routing one envelope did.
#[derive(Debug, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Chat text appended at this log position.
    Chat(u64),
    /// Handed to the transfer engine; carries the transfer's terminal event, if any.
    Transfer(Option<TransferEvent>),
    /// Unknown kind or malformed payload; nothing changed.
    Dropped,
}

pub fn route(
    envelope: Envelope,
    origin: &PeerId,
    log: &mut ChatLog,
    transfers: &mut TransferEngine,
) -> RouteOutcome {
    let kind = envelope.kind.clone();
    let msg = match envelope.into_message() {
        Ok(Some(msg)) => msg,
        Ok(None) => {
            warn!(kind = %kind, from = %origin, "unknown message kind, dropping");
            return RouteOutcome::Dropped;
        }
        Err(e) => {
            warn!(kind = %kind, from = %origin, error = %e, "malformed payload, dropping");
            return RouteOutcome::Dropped;
        }
    };
    route_message(msg, origin, log, transfers)
}

/// Dispatch an already-decoded message.
pub fn route_message(
    msg: Message,
    origin: &PeerId,
    log: &mut ChatLog,
    transfers: &mut TransferEngine,
) -> RouteOutcome {
    match msg {
        Message::Chat(text) => {
            debug!(from = %origin, len = text.len(), "chat message");
            RouteOutcome::Chat(log.append_text(origin.clone(), text))
        }
        Message::FileMetadata(meta) => {
            RouteOutcome::Transfer(transfers.begin_inbound(meta, origin.clone(), log))
        }
        Message::FileChunk(chunk) => RouteOutcome::Transfer(transfers.append_inbound_chunk(chunk, log)),
    }
}
