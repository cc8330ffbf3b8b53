//! Chat log: append-only record of text messages and file transfer status, in display order.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::identity::PeerId;
use crate::integrity::ArtifactHandle;
use crate::protocol::TransferId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Sending,
    Sent,
    Receiving,
    Complete,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outbound,
    Inbound,
}

/// UI projection of one transfer.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferView {
    pub transfer_id: TransferId,
    pub direction: Direction,
    pub file_name: String,
    pub file_size: u64,
    pub progress_percent: u8,
    pub status: TransferStatus,
    pub artifact: Option<ArtifactHandle>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Text,
    TransferStatus,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EntryBody {
    Text(String),
    Transfer(TransferView),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatEntry {
    /// Position in the log; strictly increasing.
    pub seq: u64,
    pub sender: PeerId,
    pub at: DateTime<Utc>,
    pub body: EntryBody,
}

impl ChatEntry {
    pub fn kind(&self) -> EntryKind {
        match self.body {
            EntryBody::Text(_) => EntryKind::Text,
            EntryBody::Transfer(_) => EntryKind::TransferStatus,
        }
    }

    pub fn text(&self) -> Option<&str> {
        match &self.body {
            EntryBody::Text(t) => Some(t),
            EntryBody::Transfer(_) => None,
        }
    }

    pub fn transfer(&self) -> Option<&TransferView> {
        match &self.body {
            EntryBody::Transfer(v) => Some(v),
            EntryBody::Text(_) => None,
        }
    }
}

#[derive(Debug, Default)]
pub struct ChatLog {
    entries: Vec<ChatEntry>,
    next_seq: u64,
    by_transfer: HashMap<TransferId, usize>,
}

impl ChatLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, sender: PeerId, body: EntryBody) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.push(ChatEntry {
            seq,
            sender,
            at: Utc::now(),
            body,
        });
        seq
    }

    pub fn append_text(&mut self, sender: PeerId, text: String) -> u64 {
        self.push(sender, EntryBody::Text(text))
    }

    /// Append the status entry of a new transfer. One entry per transfer id.
    pub fn append_transfer(&mut self, sender: PeerId, view: TransferView) -> u64 {
        let id = view.transfer_id.clone();
        let seq = self.push(sender, EntryBody::Transfer(view));
        self.by_transfer.insert(id, self.entries.len() - 1);
        seq
    }

    fn view_mut(&mut self, id: &TransferId) -> Option<&mut TransferView> {
        let idx = *self.by_transfer.get(id)?;
        match &mut self.entries[idx].body {
            EntryBody::Transfer(v) => Some(v),
            EntryBody::Text(_) => None,
        }
    }

    pub fn set_transfer_progress(&mut self, id: &TransferId, percent: u8) {
        if let Some(v) = self.view_mut(id) {
            v.progress_percent = percent;
        }
    }

    pub fn set_transfer_status(
        &mut self,
        id: &TransferId,
        status: TransferStatus,
        artifact: Option<ArtifactHandle>,
    ) {
        if let Some(v) = self.view_mut(id) {
            v.status = status;
            if artifact.is_some() {
                v.artifact = artifact;
            }
        }
    }

    pub fn transfer(&self, id: &TransferId) -> Option<&TransferView> {
        self.by_transfer
            .get(id)
            .and_then(|&idx| self.entries[idx].transfer())
    }

    pub fn entries(&self) -> &[ChatEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Human-readable size with binary units and up to two decimals, e.g. `136.72 KB`.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 7] = ["Bytes", "KB", "MB", "GB", "TB", "PB", "EB"];
    if bytes == 0 {
        return "0 Bytes".to_string();
    }
    let mut unit = 0;
    let mut value = bytes as f64;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    let s = format!("{value:.2}");
    let s = s.trim_end_matches('0').trim_end_matches('.');
    format!("{s} {}", UNITS[unit])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view(id: &str) -> TransferView {
        TransferView {
            transfer_id: id.into(),
            direction: Direction::Inbound,
            file_name: "a.bin".into(),
            file_size: 10,
            progress_percent: 0,
            status: TransferStatus::Receiving,
            artifact: None,
        }
    }

    #[test]
    fn entries_keep_append_order() {
        let mut log = ChatLog::new();
        let a = log.append_text("john".into(), "hi".into());
        let b = log.append_transfer("kate".into(), view("t1"));
        let c = log.append_text("kate".into(), "file incoming".into());
        assert!(a < b && b < c);
        let kinds: Vec<EntryKind> = log.entries().iter().map(ChatEntry::kind).collect();
        assert_eq!(
            kinds,
            vec![EntryKind::Text, EntryKind::TransferStatus, EntryKind::Text]
        );
    }

    #[test]
    fn transfer_updates_happen_in_place() {
        let mut log = ChatLog::new();
        log.append_transfer("kate".into(), view("t1"));
        log.append_text("john".into(), "ok".into());
        log.set_transfer_progress(&"t1".into(), 50);
        log.set_transfer_status(&"t1".into(), TransferStatus::Failed, None);
        assert_eq!(log.len(), 2);
        let v = log.transfer(&"t1".into()).unwrap();
        assert_eq!(v.progress_percent, 50);
        assert_eq!(v.status, TransferStatus::Failed);
    }

    #[test]
    fn unknown_transfer_update_is_ignored() {
        let mut log = ChatLog::new();
        log.set_transfer_progress(&"nope".into(), 10);
        assert!(log.is_empty());
    }

    #[test]
    fn format_bytes_units() {
        assert_eq!(format_bytes(0), "0 Bytes");
        assert_eq!(format_bytes(512), "512 Bytes");
        assert_eq!(format_bytes(1024), "1 KB");
        assert_eq!(format_bytes(140_000), "136.72 KB");
        assert_eq!(format_bytes(1_572_864), "1.5 MB");
    }
}
