//! Channel adapter: the host's handle on one ordered, reliable data channel to a peer.
//!
//! The core never opens channels. The host establishes one, wraps it in a
//! [`ChannelAdapter`] and hands it to the session; inbound traffic and open/close
//! notifications come back through the session's `on_channel_*` methods.

use crate::identity::PeerId;
use crate::protocol::Message;

pub trait ChannelAdapter {
    /// Peer at the other end.
    fn peer(&self) -> &PeerId;

    /// Whether the channel currently accepts sends.
    fn is_open(&self) -> bool;

    /// Queue one message. Must preserve call order.
    ///
    /// [`ChannelError::Full`] means nothing was queued and the channel is still usable;
    /// the caller may retry the same message later.
    fn send(&mut self, msg: &Message) -> Result<(), ChannelError>;

    /// Close the channel. Idempotent.
    fn close(&mut self);
}

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("channel closed")]
    Closed,
    #[error("channel send queue full")]
    Full,
    #[error("channel send failed: {0}")]
    Send(String),
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory channel that records everything sent through it.

    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;

    #[derive(Default)]
    pub struct Wire {
        pub sent: Vec<Message>,
        pub open: bool,
        pub closed_by_local: bool,
        /// Fail every send after this many successful ones.
        pub fail_after: Option<usize>,
        /// Refuse sends with `Full` while set.
        pub full: bool,
    }

    /// Cloneable view on the channel's recorded state, kept by tests after the
    /// channel itself moved into a session.
    #[derive(Clone)]
    pub struct MemoryChannel {
        pub peer: PeerId,
        pub wire: Rc<RefCell<Wire>>,
    }

    impl MemoryChannel {
        pub fn open(peer: &str) -> Self {
            Self {
                peer: PeerId::new(peer),
                wire: Rc::new(RefCell::new(Wire {
                    open: true,
                    ..Wire::default()
                })),
            }
        }

        pub fn pending(peer: &str) -> Self {
            let ch = Self::open(peer);
            ch.wire.borrow_mut().open = false;
            ch
        }

        pub fn sent(&self) -> Vec<Message> {
            self.wire.borrow().sent.clone()
        }
    }

    impl ChannelAdapter for MemoryChannel {
        fn peer(&self) -> &PeerId {
            &self.peer
        }

        fn is_open(&self) -> bool {
            self.wire.borrow().open
        }

        fn send(&mut self, msg: &Message) -> Result<(), ChannelError> {
            let mut w = self.wire.borrow_mut();
            if !w.open {
                return Err(ChannelError::Closed);
            }
            if w.full {
                return Err(ChannelError::Full);
            }
            if let Some(n) = w.fail_after {
                if w.sent.len() >= n {
                    w.open = false;
                    return Err(ChannelError::Closed);
                }
            }
            w.sent.push(msg.clone());
            Ok(())
        }

        fn close(&mut self) {
            let mut w = self.wire.borrow_mut();
            w.open = false;
            w.closed_by_local = true;
        }
    }
}
