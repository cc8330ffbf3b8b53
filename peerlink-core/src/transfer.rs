//! Transfer engine: chunked outbound sends and inbound reassembly, keyed by transfer id.
//!
//! Outbound transfers advance one chunk per [`TransferEngine::pump`] call, so at most
//! one chunk per transfer is held in memory and the host can interleave other events
//! between chunks. A channel reporting [`ChannelError::Full`] pauses the transfer in
//! place; the same message is retried on the next pump. Inbound chunks are concatenated strictly in arrival order; the
//! channel's ordering guarantee is what makes that the send order.

use std::collections::{HashMap, VecDeque};
use std::fmt;

use tracing::{debug, info, warn};

use crate::channel::{ChannelAdapter, ChannelError};
use crate::chat::{ChatLog, Direction, TransferStatus, TransferView};
use crate::chunk::{self, ChunkBuffer, ChunkReceiveResult, ChunkSource, DEFAULT_CHUNK_SIZE};
use crate::identity::PeerId;
use crate::integrity::{Artifact, ArtifactHandle};
use crate::protocol::{FileChunk, FileMetadata, Message, TransferId};

/// A local file the user picked for sending.
pub struct OutgoingFile {
    pub name: String,
    /// Declared size; exactly this many bytes are read from `source`.
    pub size: u64,
    pub mime_type: String,
    source: Box<dyn ChunkSource>,
}

impl OutgoingFile {
    pub fn new(
        name: impl Into<String>,
        size: u64,
        mime_type: impl Into<String>,
        source: impl ChunkSource + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            size,
            mime_type: mime_type.into(),
            source: Box::new(source),
        }
    }

    /// In-memory file, mostly for tests and small payloads.
    pub fn from_bytes(name: impl Into<String>, mime_type: impl Into<String>, bytes: Vec<u8>) -> Self {
        let size = bytes.len() as u64;
        Self::new(name, size, mime_type, std::io::Cursor::new(bytes))
    }
}

impl fmt::Debug for OutgoingFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutgoingFile")
            .field("name", &self.name)
            .field("size", &self.size)
            .field("mime_type", &self.mime_type)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboundStatus {
    Sending,
    Sent,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundStatus {
    Receiving,
    Complete,
    Failed,
}

struct OutboundTransfer {
    file_name: String,
    total_size: u64,
    bytes_sent: u64,
    status: OutboundStatus,
    /// Metadata still waiting for room on the channel.
    announce: Option<FileMetadata>,
    /// Released once the transfer is terminal.
    source: Option<Box<dyn ChunkSource>>,
}

/// Outcome of one outbound step.
enum Step {
    /// A message went out, or the transfer ended. Carries the terminal event, if any.
    Advanced(Option<TransferEvent>),
    /// The channel had no room. Nothing changed.
    Backlogged,
}

struct InboundTransfer {
    sender: PeerId,
    declared_name: String,
    mime_type: String,
    buffer: ChunkBuffer,
    status: InboundStatus,
}

/// Terminal outcome of a transfer, for the session to surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferEvent {
    Sent {
        id: TransferId,
    },
    Completed {
        id: TransferId,
        from: PeerId,
        handle: ArtifactHandle,
    },
    Failed {
        id: TransferId,
        direction: Direction,
        reason: TransferError,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransferError {
    #[error("no open channel")]
    NoChannel,
    #[error("channel failed: {0}")]
    Channel(String),
    #[error("reading source failed: {0}")]
    Source(String),
    #[error("source ended after {read} of {declared} bytes")]
    SourceTruncated { read: u64, declared: u64 },
    #[error("chunk overflows declared size {declared} (would reach {attempted})")]
    SizeOverflow { declared: u64, attempted: u64 },
}

impl From<ChannelError> for TransferError {
    fn from(e: ChannelError) -> Self {
        match e {
            ChannelError::Closed => TransferError::NoChannel,
            other => TransferError::Channel(other.to_string()),
        }
    }
}

pub struct TransferEngine {
    chunk_size: u64,
    outbound: HashMap<TransferId, OutboundTransfer>,
    /// Outbound transfers still sending, in start order.
    active: VecDeque<TransferId>,
    inbound: HashMap<TransferId, InboundTransfer>,
    artifacts: HashMap<TransferId, Artifact>,
}

impl TransferEngine {
    pub fn new(chunk_size: u64) -> Self {
        let effective = chunk::effective_chunk_size(chunk_size);
        if chunk_size != 0 && effective != chunk_size {
            warn!(requested = chunk_size, used = effective, "chunk size capped to fit a frame");
        }
        Self {
            chunk_size: effective,
            outbound: HashMap::new(),
            active: VecDeque::new(),
            inbound: HashMap::new(),
            artifacts: HashMap::new(),
        }
    }

    /// Start sending `file`: create the record and its chat entry, then emit the metadata
    /// message. Chunks follow on later [`pump`](Self::pump) calls.
    ///
    /// Fails without creating anything when the channel is not open. If the channel is
    /// full the metadata is held back and goes out on a later pump. Any other send error
    /// records the transfer as failed and is returned.
    pub fn send_file(
        &mut self,
        local: &PeerId,
        file: OutgoingFile,
        channel: &mut dyn ChannelAdapter,
        log: &mut ChatLog,
    ) -> Result<TransferId, TransferError> {
        if !channel.is_open() {
            return Err(TransferError::NoChannel);
        }
        let id = TransferId::generate();
        log.append_transfer(
            local.clone(),
            TransferView {
                transfer_id: id.clone(),
                direction: Direction::Outbound,
                file_name: file.name.clone(),
                file_size: file.size,
                progress_percent: 0,
                status: TransferStatus::Sending,
                artifact: None,
            },
        );
        let metadata = FileMetadata {
            id: id.clone(),
            name: file.name.clone(),
            size: file.size,
            mime_type: file.mime_type.clone(),
        };
        let mut record = OutboundTransfer {
            file_name: file.name,
            total_size: file.size,
            bytes_sent: 0,
            status: OutboundStatus::Sending,
            announce: None,
            source: Some(file.source),
        };
        match channel.send(&Message::FileMetadata(metadata.clone())) {
            Ok(()) => {
                info!(transfer = %id, name = %record.file_name, size = record.total_size, "sending file");
                if record.total_size == 0 {
                    finish_outbound(&id, &mut record, log);
                } else {
                    self.active.push_back(id.clone());
                }
            }
            Err(ChannelError::Full) => {
                debug!(transfer = %id, "channel full, metadata deferred");
                record.announce = Some(metadata);
                self.active.push_back(id.clone());
            }
            Err(e) => {
                let reason = TransferError::from(e);
                fail_outbound(&id, &mut record, log, reason.clone());
                self.outbound.insert(id, record);
                return Err(reason);
            }
        }
        self.outbound.insert(id.clone(), record);
        Ok(id)
    }

    /// Whether any outbound transfer still has chunks to send.
    pub fn has_pending_outbound(&self) -> bool {
        !self.active.is_empty()
    }

    /// Send the next chunk of every active outbound transfer. Returns terminal events.
    pub fn pump(&mut self, channel: &mut dyn ChannelAdapter, log: &mut ChatLog) -> Vec<TransferEvent> {
        self.pump_at_most(usize::MAX, channel, log)
    }

    /// Like [`pump`](Self::pump), but puts at most `budget` messages on the channel.
    ///
    /// Transfers take turns in rotation, so a small budget still reaches every transfer
    /// over successive calls. A full channel ends the round and the refused transfer goes
    /// first next time.
    pub fn pump_at_most(
        &mut self,
        budget: usize,
        channel: &mut dyn ChannelAdapter,
        log: &mut ChatLog,
    ) -> Vec<TransferEvent> {
        let mut events = Vec::new();
        let mut spent = 0;
        for _ in 0..self.active.len() {
            if spent >= budget {
                break;
            }
            let Some(id) = self.active.pop_front() else {
                break;
            };
            match self.step_outbound(&id, channel, log) {
                Step::Backlogged => {
                    self.active.push_front(id);
                    break;
                }
                Step::Advanced(event) => {
                    spent += 1;
                    events.extend(event);
                    if self.outbound_status(&id) == Some(OutboundStatus::Sending) {
                        self.active.push_back(id);
                    }
                }
            }
        }
        events
    }

    /// Send the pending metadata of `id`, or else read, send and account for exactly one chunk.
    fn step_outbound(&mut self, id: &TransferId, channel: &mut dyn ChannelAdapter, log: &mut ChatLog) -> Step {
        let Some(t) = self
            .outbound
            .get_mut(id)
            .filter(|t| t.status == OutboundStatus::Sending)
        else {
            return Step::Advanced(None);
        };
        if !channel.is_open() {
            return Step::Advanced(Some(fail_outbound(id, t, log, TransferError::NoChannel)));
        }
        if let Some(meta) = &t.announce {
            match channel.send(&Message::FileMetadata(meta.clone())) {
                Ok(()) => t.announce = None,
                Err(ChannelError::Full) => return Step::Backlogged,
                Err(e) => return Step::Advanced(Some(fail_outbound(id, t, log, e.into()))),
            }
            info!(transfer = %id, name = %t.file_name, size = t.total_size, "sending file");
            let done = (t.total_size == 0).then(|| finish_outbound(id, t, log));
            return Step::Advanced(done);
        }
        let Some(range) = chunk::next_range(t.bytes_sent, t.total_size, self.chunk_size) else {
            return Step::Advanced(None);
        };
        let Some(source) = t.source.as_mut() else {
            return Step::Advanced(None);
        };
        let bytes = match source.read_slice(range.start, range.size() as usize) {
            Ok(b) => b,
            Err(e) => {
                let reason = TransferError::Source(e.to_string());
                return Step::Advanced(Some(fail_outbound(id, t, log, reason)));
            }
        };
        if (bytes.len() as u64) < range.size() {
            let reason = TransferError::SourceTruncated {
                read: t.bytes_sent + bytes.len() as u64,
                declared: t.total_size,
            };
            return Step::Advanced(Some(fail_outbound(id, t, log, reason)));
        }
        let sent = bytes.len() as u64;
        let msg = Message::FileChunk(FileChunk {
            id: id.clone(),
            chunk: bytes,
        });
        match channel.send(&msg) {
            Ok(()) => {}
            // The range is re-read on the next attempt.
            Err(ChannelError::Full) => return Step::Backlogged,
            Err(e) => return Step::Advanced(Some(fail_outbound(id, t, log, e.into()))),
        }
        t.bytes_sent += sent;
        let progress = chunk::progress_percent(t.bytes_sent, t.total_size);
        log.set_transfer_progress(id, progress);
        debug!(transfer = %id, sent = t.bytes_sent, total = t.total_size, progress, "chunk sent");
        let done = (t.bytes_sent == t.total_size).then(|| finish_outbound(id, t, log));
        Step::Advanced(done)
    }

    /// Open an inbound transfer from its metadata. Duplicate ids are ignored.
    pub fn begin_inbound(
        &mut self,
        meta: FileMetadata,
        sender: PeerId,
        log: &mut ChatLog,
    ) -> Option<TransferEvent> {
        if self.inbound.contains_key(&meta.id) || self.outbound.contains_key(&meta.id) {
            warn!(transfer = %meta.id, "duplicate file metadata, ignoring");
            return None;
        }
        info!(transfer = %meta.id, name = %meta.name, size = meta.size, from = %sender, "receiving file");
        log.append_transfer(
            sender.clone(),
            TransferView {
                transfer_id: meta.id.clone(),
                direction: Direction::Inbound,
                file_name: meta.name.clone(),
                file_size: meta.size,
                progress_percent: 0,
                status: TransferStatus::Receiving,
                artifact: None,
            },
        );
        let mut record = InboundTransfer {
            sender,
            declared_name: meta.name,
            mime_type: meta.mime_type,
            buffer: ChunkBuffer::new(meta.size),
            status: InboundStatus::Receiving,
        };
        // Empty files have no chunks; they are complete as soon as they are announced.
        let event = (meta.size == 0)
            .then(|| self.complete_inbound(&meta.id, &mut record, Vec::new(), log));
        self.inbound.insert(meta.id, record);
        event
    }

    /// Append one inbound chunk. Orphan chunks and chunks for finished transfers are dropped.
    pub fn append_inbound_chunk(&mut self, payload: FileChunk, log: &mut ChatLog) -> Option<TransferEvent> {
        let FileChunk { id, chunk } = payload;
        let Some(mut record) = self.inbound.remove(&id) else {
            warn!(transfer = %id, "file chunk without metadata, dropping");
            return None;
        };
        let event = if record.status != InboundStatus::Receiving {
            debug!(transfer = %id, status = ?record.status, "chunk for finished transfer, dropping");
            None
        } else {
            let len = chunk.len() as u64;
            match record.buffer.push(chunk) {
                ChunkReceiveResult::InProgress => {
                    let progress =
                        chunk::progress_percent(record.buffer.received(), record.buffer.expected());
                    log.set_transfer_progress(&id, progress);
                    None
                }
                ChunkReceiveResult::Complete(bytes) => {
                    Some(self.complete_inbound(&id, &mut record, bytes, log))
                }
                ChunkReceiveResult::Overflow => {
                    let reason = TransferError::SizeOverflow {
                        declared: record.buffer.expected(),
                        attempted: record.buffer.received().saturating_add(len),
                    };
                    warn!(transfer = %id, %reason, "inbound transfer failed");
                    record.status = InboundStatus::Failed;
                    record.buffer.discard();
                    log.set_transfer_status(&id, TransferStatus::Failed, None);
                    Some(TransferEvent::Failed {
                        id: id.clone(),
                        direction: Direction::Inbound,
                        reason,
                    })
                }
            }
        };
        self.inbound.insert(id, record);
        event
    }

    fn complete_inbound(
        &mut self,
        id: &TransferId,
        record: &mut InboundTransfer,
        bytes: Vec<u8>,
        log: &mut ChatLog,
    ) -> TransferEvent {
        let artifact = Artifact::new(
            id.clone(),
            record.declared_name.clone(),
            record.mime_type.clone(),
            bytes,
        );
        let handle = artifact.handle().clone();
        record.status = InboundStatus::Complete;
        log.set_transfer_progress(id, 100);
        log.set_transfer_status(id, TransferStatus::Complete, Some(handle.clone()));
        info!(transfer = %id, name = %record.declared_name, digest = %handle.digest_hex(), "file received");
        self.artifacts.insert(id.clone(), artifact);
        TransferEvent::Completed {
            id: id.clone(),
            from: record.sender.clone(),
            handle,
        }
    }

    pub fn outbound_status(&self, id: &TransferId) -> Option<OutboundStatus> {
        self.outbound.get(id).map(|t| t.status)
    }

    pub fn inbound_status(&self, id: &TransferId) -> Option<InboundStatus> {
        self.inbound.get(id).map(|t| t.status)
    }

    /// Bytes received so far for an inbound transfer.
    pub fn inbound_received(&self, id: &TransferId) -> Option<u64> {
        self.inbound.get(id).map(|t| t.buffer.received())
    }

    pub fn artifact(&self, handle: &ArtifactHandle) -> Option<&Artifact> {
        self.artifacts
            .get(&handle.transfer_id)
            .filter(|a| a.handle() == handle)
    }
}

impl Default for TransferEngine {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_SIZE)
    }
}

fn finish_outbound(id: &TransferId, t: &mut OutboundTransfer, log: &mut ChatLog) -> TransferEvent {
    t.status = OutboundStatus::Sent;
    t.source = None;
    log.set_transfer_progress(id, 100);
    log.set_transfer_status(id, TransferStatus::Sent, None);
    info!(transfer = %id, name = %t.file_name, "file sent");
    TransferEvent::Sent { id: id.clone() }
}

fn fail_outbound(
    id: &TransferId,
    t: &mut OutboundTransfer,
    log: &mut ChatLog,
    reason: TransferError,
) -> TransferEvent {
    warn!(transfer = %id, sent = t.bytes_sent, total = t.total_size, %reason, "outbound transfer failed");
    t.status = OutboundStatus::Failed;
    t.source = None;
    log.set_transfer_status(id, TransferStatus::Failed, None);
    TransferEvent::Failed {
        id: id.clone(),
        direction: Direction::Outbound,
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::testing::MemoryChannel;
    use crate::integrity;
    use rand::RngCore;
    use std::io;

    fn random_bytes(n: usize) -> Vec<u8> {
        let mut v = vec![0u8; n];
        rand::thread_rng().fill_bytes(&mut v);
        v
    }

    fn local() -> PeerId {
        PeerId::new("john")
    }

    /// Drive every outbound transfer to a terminal state.
    fn pump_all(engine: &mut TransferEngine, ch: &mut MemoryChannel, log: &mut ChatLog) -> Vec<TransferEvent> {
        let mut events = Vec::new();
        while engine.has_pending_outbound() {
            events.extend(engine.pump(ch, log));
        }
        events
    }

    /// Feed every message the sender emitted into a receiving engine.
    fn deliver(sent: Vec<Message>, rx: &mut TransferEngine, log: &mut ChatLog) -> Vec<TransferEvent> {
        sent.into_iter()
            .filter_map(|m| match m {
                Message::FileMetadata(meta) => rx.begin_inbound(meta, local(), log),
                Message::FileChunk(c) => rx.append_inbound_chunk(c, log),
                Message::Chat(_) => None,
            })
            .collect()
    }

    #[test]
    fn report_pdf_scenario() {
        let data = random_bytes(140_000);
        let mut ch = MemoryChannel::open("kate");
        let mut tx_log = ChatLog::new();
        let mut tx = TransferEngine::default();
        let file = OutgoingFile::from_bytes("report.pdf", "application/pdf", data.clone());
        let id = tx.send_file(&local(), file, &mut ch, &mut tx_log).unwrap();

        let mut progress = Vec::new();
        while tx.has_pending_outbound() {
            tx.pump(&mut ch, &mut tx_log);
            progress.push(tx_log.transfer(&id).unwrap().progress_percent);
        }
        assert_eq!(progress, vec![47, 94, 100]);
        assert_eq!(tx.outbound_status(&id), Some(OutboundStatus::Sent));
        assert_eq!(tx_log.transfer(&id).unwrap().status, TransferStatus::Sent);

        let sent = ch.sent();
        assert!(matches!(sent[0], Message::FileMetadata(ref m) if m.size == 140_000));
        let chunk_lens: Vec<usize> = sent[1..]
            .iter()
            .map(|m| match m {
                Message::FileChunk(c) => c.chunk.len(),
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(chunk_lens, vec![65536, 65536, 8928]);

        // Receiver side: same progress points, then complete exactly at the last chunk.
        let mut rx = TransferEngine::default();
        let mut rx_log = ChatLog::new();
        let mut iter = sent.into_iter();
        let Some(Message::FileMetadata(meta)) = iter.next() else {
            panic!("metadata first")
        };
        assert!(rx.begin_inbound(meta, PeerId::new("john"), &mut rx_log).is_none());
        let mut rx_progress = Vec::new();
        let mut completions = 0;
        for m in iter {
            let Message::FileChunk(c) = m else { panic!() };
            if let Some(TransferEvent::Completed { handle, .. }) = rx.append_inbound_chunk(c, &mut rx_log) {
                completions += 1;
                let artifact = rx.artifact(&handle).unwrap();
                assert_eq!(artifact.bytes(), data.as_slice());
                assert_eq!(artifact.name, "report.pdf");
                assert_eq!(handle.digest, integrity::hash_bytes(&data));
            }
            rx_progress.push(rx_log.transfer(&id).unwrap().progress_percent);
        }
        assert_eq!(rx_progress, vec![47, 94, 100]);
        assert_eq!(completions, 1);
        assert_eq!(rx.inbound_status(&id), Some(InboundStatus::Complete));
        assert_eq!(rx_log.transfer(&id).unwrap().status, TransferStatus::Complete);
        assert!(rx_log.transfer(&id).unwrap().artifact.is_some());
    }

    #[test]
    fn reassembly_matches_source_for_many_sizes() {
        for size in [1usize, 100, 4096, 4097, 12_288, 30_001] {
            let data = random_bytes(size);
            let mut ch = MemoryChannel::open("kate");
            let mut log = ChatLog::new();
            let mut tx = TransferEngine::new(4096);
            let file = OutgoingFile::from_bytes("blob.bin", "application/octet-stream", data.clone());
            tx.send_file(&local(), file, &mut ch, &mut log).unwrap();
            pump_all(&mut tx, &mut ch, &mut log);

            let mut rx = TransferEngine::default();
            let mut rx_log = ChatLog::new();
            let events = deliver(ch.sent(), &mut rx, &mut rx_log);
            assert_eq!(events.len(), 1, "size {size}");
            let TransferEvent::Completed { handle, .. } = &events[0] else {
                panic!("expected completion for size {size}")
            };
            assert_eq!(rx.artifact(handle).unwrap().bytes(), data.as_slice());
        }
    }

    #[test]
    fn progress_is_monotonic() {
        let data = random_bytes(50_000);
        let mut ch = MemoryChannel::open("kate");
        let mut log = ChatLog::new();
        let mut tx = TransferEngine::new(3000);
        let id = tx
            .send_file(&local(), OutgoingFile::from_bytes("x", "", data), &mut ch, &mut log)
            .unwrap();
        let mut last = 0u8;
        while tx.has_pending_outbound() {
            tx.pump(&mut ch, &mut log);
            let p = log.transfer(&id).unwrap().progress_percent;
            assert!(p >= last);
            last = p;
        }
        assert_eq!(last, 100);
    }

    #[test]
    fn concurrent_outbound_transfers_interleave() {
        let mut ch = MemoryChannel::open("kate");
        let mut log = ChatLog::new();
        let mut tx = TransferEngine::new(10);
        let a = tx
            .send_file(&local(), OutgoingFile::from_bytes("a", "", vec![1u8; 30]), &mut ch, &mut log)
            .unwrap();
        let b = tx
            .send_file(&local(), OutgoingFile::from_bytes("b", "", vec![2u8; 20]), &mut ch, &mut log)
            .unwrap();
        assert_ne!(a, b);
        let events = pump_all(&mut tx, &mut ch, &mut log);
        assert_eq!(events.len(), 2);
        let order: Vec<TransferId> = ch
            .sent()
            .into_iter()
            .filter_map(|m| match m {
                Message::FileChunk(c) => Some(c.id),
                _ => None,
            })
            .collect();
        assert_eq!(order, vec![a.clone(), b.clone(), a.clone(), b, a]);

        let mut rx = TransferEngine::default();
        let mut rx_log = ChatLog::new();
        let done = deliver(ch.sent(), &mut rx, &mut rx_log);
        assert_eq!(done.len(), 2);
    }

    #[test]
    fn send_without_channel_creates_nothing() {
        let mut ch = MemoryChannel::pending("kate");
        let mut log = ChatLog::new();
        let mut tx = TransferEngine::default();
        let r = tx.send_file(&local(), OutgoingFile::from_bytes("a", "", vec![1]), &mut ch, &mut log);
        assert_eq!(r, Err(TransferError::NoChannel));
        assert!(log.is_empty());
        assert!(!tx.has_pending_outbound());
    }

    #[test]
    fn channel_closing_mid_transfer_fails_and_stops() {
        let mut ch = MemoryChannel::open("kate");
        ch.wire.borrow_mut().fail_after = Some(2); // metadata + one chunk
        let mut log = ChatLog::new();
        let mut tx = TransferEngine::new(10);
        let id = tx
            .send_file(&local(), OutgoingFile::from_bytes("a", "", vec![0u8; 50]), &mut ch, &mut log)
            .unwrap();
        let events = pump_all(&mut tx, &mut ch, &mut log);
        assert_eq!(
            events,
            vec![TransferEvent::Failed {
                id: id.clone(),
                direction: Direction::Outbound,
                reason: TransferError::NoChannel,
            }]
        );
        assert_eq!(tx.outbound_status(&id), Some(OutboundStatus::Failed));
        assert_eq!(log.transfer(&id).unwrap().status, TransferStatus::Failed);
        assert_eq!(log.transfer(&id).unwrap().progress_percent, 20);
        assert_eq!(ch.sent().len(), 2);
    }

    #[test]
    fn full_channel_pauses_instead_of_failing() {
        let data = random_bytes(35);
        let mut ch = MemoryChannel::open("kate");
        let mut log = ChatLog::new();
        let mut tx = TransferEngine::new(10);
        ch.wire.borrow_mut().full = true;
        let id = tx
            .send_file(&local(), OutgoingFile::from_bytes("a", "", data.clone()), &mut ch, &mut log)
            .unwrap();
        assert!(ch.sent().is_empty());
        for _ in 0..3 {
            assert!(tx.pump(&mut ch, &mut log).is_empty());
        }
        assert_eq!(tx.outbound_status(&id), Some(OutboundStatus::Sending));
        assert_eq!(log.transfer(&id).unwrap().status, TransferStatus::Sending);

        ch.wire.borrow_mut().full = false;
        tx.pump(&mut ch, &mut log);
        assert!(matches!(&ch.sent()[..], [Message::FileMetadata(_)]));
        tx.pump(&mut ch, &mut log);
        ch.wire.borrow_mut().full = true;
        tx.pump(&mut ch, &mut log);
        assert_eq!(log.transfer(&id).unwrap().progress_percent, 29);
        ch.wire.borrow_mut().full = false;
        let events = pump_all(&mut tx, &mut ch, &mut log);
        assert_eq!(events, vec![TransferEvent::Sent { id: id.clone() }]);

        let mut rx = TransferEngine::default();
        let mut rx_log = ChatLog::new();
        let done = deliver(ch.sent(), &mut rx, &mut rx_log);
        let [TransferEvent::Completed { handle, .. }] = &done[..] else {
            panic!("expected one completion, got {done:?}")
        };
        assert_eq!(rx.artifact(handle).unwrap().bytes(), data.as_slice());
    }

    #[test]
    fn deferred_empty_file_finishes_once_announced() {
        let mut ch = MemoryChannel::open("kate");
        let mut log = ChatLog::new();
        let mut tx = TransferEngine::default();
        ch.wire.borrow_mut().full = true;
        let id = tx
            .send_file(&local(), OutgoingFile::from_bytes("empty", "", Vec::new()), &mut ch, &mut log)
            .unwrap();
        assert!(tx.has_pending_outbound());
        ch.wire.borrow_mut().full = false;
        assert_eq!(tx.pump(&mut ch, &mut log), vec![TransferEvent::Sent { id }]);
        assert!(!tx.has_pending_outbound());
        assert_eq!(ch.sent().len(), 1);
    }

    #[test]
    fn budget_limits_messages_and_keeps_rotation() {
        let mut ch = MemoryChannel::open("kate");
        let mut log = ChatLog::new();
        let mut tx = TransferEngine::new(10);
        let ids: Vec<TransferId> = ["a", "b", "c"]
            .into_iter()
            .map(|n| {
                tx.send_file(&local(), OutgoingFile::from_bytes(n, "", vec![0u8; 20]), &mut ch, &mut log)
                    .unwrap()
            })
            .collect();
        let before = ch.sent().len();
        tx.pump_at_most(2, &mut ch, &mut log);
        tx.pump_at_most(2, &mut ch, &mut log);
        let order: Vec<TransferId> = ch.sent()[before..]
            .iter()
            .filter_map(|m| match m {
                Message::FileChunk(c) => Some(c.id.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(
            order,
            vec![ids[0].clone(), ids[1].clone(), ids[2].clone(), ids[0].clone()]
        );
        assert!(tx.pump_at_most(0, &mut ch, &mut log).is_empty());
        assert_eq!(ch.sent().len(), before + 4);
    }

    #[test]
    fn oversized_chunk_size_still_fits_a_frame() {
        let mut ch = MemoryChannel::open("kate");
        let mut log = ChatLog::new();
        let mut tx = TransferEngine::new(crate::wire::MAX_FRAME_LEN as u64);
        let data = vec![7u8; crate::wire::MAX_FRAME_LEN as usize];
        tx.send_file(&local(), OutgoingFile::from_bytes("big.bin", "", data), &mut ch, &mut log)
            .unwrap();
        tx.pump(&mut ch, &mut log);
        let sent = ch.sent();
        let Message::FileChunk(first) = &sent[1] else {
            panic!("expected a chunk")
        };
        assert_eq!(first.chunk.len() as u64, chunk::MAX_CHUNK_SIZE);
        assert!(crate::wire::encode_frame(&sent[1]).is_ok());
    }

    struct FailingSource;

    impl ChunkSource for FailingSource {
        fn read_slice(&mut self, _offset: u64, _len: usize) -> io::Result<Vec<u8>> {
            Err(io::Error::new(io::ErrorKind::PermissionDenied, "locked"))
        }
    }

    #[test]
    fn source_read_error_fails_transfer() {
        let mut ch = MemoryChannel::open("kate");
        let mut log = ChatLog::new();
        let mut tx = TransferEngine::default();
        let file = OutgoingFile::new("locked.bin", 10, "", FailingSource);
        let id = tx.send_file(&local(), file, &mut ch, &mut log).unwrap();
        let events = tx.pump(&mut ch, &mut log);
        assert!(matches!(&events[..], [TransferEvent::Failed { reason: TransferError::Source(_), .. }]));
        assert_eq!(tx.outbound_status(&id), Some(OutboundStatus::Failed));
        assert!(!tx.has_pending_outbound());
    }

    #[test]
    fn short_source_fails_transfer() {
        let mut ch = MemoryChannel::open("kate");
        let mut log = ChatLog::new();
        let mut tx = TransferEngine::new(4);
        let file = OutgoingFile::new("short", 10, "", io::Cursor::new(vec![1u8; 6]));
        tx.send_file(&local(), file, &mut ch, &mut log).unwrap();
        let events = pump_all(&mut tx, &mut ch, &mut log);
        assert_eq!(
            events.last().map(|e| matches!(e, TransferEvent::Failed {
                reason: TransferError::SourceTruncated { read: 6, declared: 10 },
                ..
            })),
            Some(true)
        );
    }

    #[test]
    fn empty_file_completes_without_chunks() {
        let mut ch = MemoryChannel::open("kate");
        let mut log = ChatLog::new();
        let mut tx = TransferEngine::default();
        let id = tx
            .send_file(&local(), OutgoingFile::from_bytes("empty", "", Vec::new()), &mut ch, &mut log)
            .unwrap();
        assert_eq!(tx.outbound_status(&id), Some(OutboundStatus::Sent));
        assert_eq!(ch.sent().len(), 1);

        let mut rx = TransferEngine::default();
        let mut rx_log = ChatLog::new();
        let events = deliver(ch.sent(), &mut rx, &mut rx_log);
        assert!(matches!(&events[..], [TransferEvent::Completed { .. }]));
        assert_eq!(rx_log.transfer(&id).unwrap().progress_percent, 100);
    }

    #[test]
    fn orphan_chunk_is_dropped() {
        let mut rx = TransferEngine::default();
        let mut log = ChatLog::new();
        let ev = rx.append_inbound_chunk(
            FileChunk {
                id: "ghost".into(),
                chunk: vec![1, 2, 3],
            },
            &mut log,
        );
        assert!(ev.is_none());
        assert!(log.is_empty());
        assert_eq!(rx.inbound_status(&"ghost".into()), None);
    }

    fn meta(id: &str, size: u64) -> FileMetadata {
        FileMetadata {
            id: id.into(),
            name: "f.bin".into(),
            size,
            mime_type: "application/octet-stream".into(),
        }
    }

    #[test]
    fn duplicate_metadata_is_ignored() {
        let mut rx = TransferEngine::default();
        let mut log = ChatLog::new();
        rx.begin_inbound(meta("t1", 4), "kate".into(), &mut log);
        rx.append_inbound_chunk(FileChunk { id: "t1".into(), chunk: vec![1, 2] }, &mut log);
        rx.begin_inbound(meta("t1", 4), "kate".into(), &mut log);
        assert_eq!(log.len(), 1);
        assert_eq!(rx.inbound_received(&"t1".into()), Some(2));
    }

    #[test]
    fn overflow_fails_and_discards_rest() {
        let mut rx = TransferEngine::default();
        let mut log = ChatLog::new();
        rx.begin_inbound(meta("t1", 4), "kate".into(), &mut log);
        assert!(rx
            .append_inbound_chunk(FileChunk { id: "t1".into(), chunk: vec![0; 3] }, &mut log)
            .is_none());
        let ev = rx.append_inbound_chunk(FileChunk { id: "t1".into(), chunk: vec![0; 3] }, &mut log);
        assert!(matches!(
            ev,
            Some(TransferEvent::Failed {
                reason: TransferError::SizeOverflow { declared: 4, attempted: 6 },
                ..
            })
        ));
        assert_eq!(rx.inbound_status(&"t1".into()), Some(InboundStatus::Failed));
        assert_eq!(log.transfer(&"t1".into()).unwrap().status, TransferStatus::Failed);
        // A chunk that would have fit is still ignored once failed.
        assert!(rx
            .append_inbound_chunk(FileChunk { id: "t1".into(), chunk: vec![0; 1] }, &mut log)
            .is_none());
        assert_eq!(rx.inbound_received(&"t1".into()), Some(3));
        assert_eq!(log.transfer(&"t1".into()).unwrap().status, TransferStatus::Failed);
    }

    #[test]
    fn chunk_after_completion_is_dropped() {
        let mut rx = TransferEngine::default();
        let mut log = ChatLog::new();
        rx.begin_inbound(meta("t1", 2), "kate".into(), &mut log);
        assert!(rx
            .append_inbound_chunk(FileChunk { id: "t1".into(), chunk: vec![1, 2] }, &mut log)
            .is_some());
        assert!(rx
            .append_inbound_chunk(FileChunk { id: "t1".into(), chunk: vec![3] }, &mut log)
            .is_none());
        assert_eq!(rx.inbound_status(&"t1".into()), Some(InboundStatus::Complete));
    }
}
