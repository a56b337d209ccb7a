//! The append-only protocol event log every peer writes next to its working
//! directory, one timestamped entry per protocol event, using fixed message
//! templates.
//!
//! This log is part of the peer's observable behavior and is distinct from
//! the diagnostic logging done through the `log` facade.

use std::{
    fmt,
    fs::File,
    io::{BufWriter, Write},
    path::Path,
    sync::Mutex,
};

use chrono::Local;

use crate::{error::*, PeerId, PieceIndex};

/// The event log of one peer, safe to share across tasks.
///
/// A failure to append an entry is reported through the diagnostic log and
/// otherwise swallowed: the protocol must not stall because its audit trail
/// does.
pub(crate) struct EventLog {
    peer_id: PeerId,
    out: Mutex<BufWriter<File>>,
}

impl EventLog {
    /// Creates (truncating) `log_peer_<id>.log` in the given directory.
    pub fn create(dir: &Path, peer_id: PeerId) -> Result<Self> {
        let path = dir.join(format!("log_peer_{}.log", peer_id));
        let file = File::create(&path)?;
        Ok(Self {
            peer_id,
            out: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn connection_made(&self, other: PeerId) {
        self.append(format_args!(
            "Peer {} makes a connection to Peer {}.",
            self.peer_id, other
        ));
    }

    pub fn connected_from(&self, other: PeerId) {
        self.append(format_args!(
            "Peer {} is connected from Peer {}.",
            self.peer_id, other
        ));
    }

    pub fn preferred_neighbors(&self, neighbors: &[PeerId]) {
        let ids = neighbors
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(",");
        self.append(format_args!(
            "Peer {} has the preferred neighbors {}.",
            self.peer_id, ids
        ));
    }

    pub fn optimistic_unchoke(&self, other: PeerId) {
        self.append(format_args!(
            "Peer {} has the optimistically unchoked neighbor {}.",
            self.peer_id, other
        ));
    }

    pub fn unchoked_by(&self, other: PeerId) {
        self.append(format_args!("Peer {} is unchoked by {}.", self.peer_id, other));
    }

    pub fn choked_by(&self, other: PeerId) {
        self.append(format_args!("Peer {} is choked by {}.", self.peer_id, other));
    }

    pub fn have_received(&self, other: PeerId, piece: PieceIndex) {
        self.append(format_args!(
            "Peer {} received the 'have' message from {} for the piece {}.",
            self.peer_id, other, piece
        ));
    }

    pub fn interested_received(&self, other: PeerId) {
        self.append(format_args!(
            "Peer {} received the 'interested' message from {}.",
            self.peer_id, other
        ));
    }

    pub fn not_interested_received(&self, other: PeerId) {
        self.append(format_args!(
            "Peer {} received the 'not interested' message from {}.",
            self.peer_id, other
        ));
    }

    pub fn piece_downloaded(&self, piece: PieceIndex, from: PeerId, have_count: usize) {
        self.append(format_args!(
            "Peer {} has downloaded the piece {} from {}. Now the number of pieces it has is {}.",
            self.peer_id, piece, from, have_count
        ));
    }

    pub fn download_complete(&self) {
        self.append(format_args!(
            "Peer {} has downloaded the complete file.",
            self.peer_id
        ));
    }

    fn append(&self, entry: fmt::Arguments) {
        let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S");
        let mut out = match self.out.lock() {
            Ok(out) => out,
            Err(poisoned) => poisoned.into_inner(),
        };
        let res = writeln!(out, "[{}]: {}", timestamp, entry).and_then(|_| out.flush());
        if let Err(e) = res {
            log::warn!("Peer {} failed to append event log entry: {}", self.peer_id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_entries_use_the_fixed_templates() {
        let dir = tempfile::tempdir().unwrap();
        let log = EventLog::create(dir.path(), 1002).unwrap();

        log.connection_made(1001);
        log.connected_from(1003);
        log.preferred_neighbors(&[1001, 1003]);
        log.optimistic_unchoke(1001);
        log.unchoked_by(1001);
        log.choked_by(1001);
        log.have_received(1001, 7);
        log.interested_received(1003);
        log.not_interested_received(1003);
        log.piece_downloaded(7, 1001, 1);
        log.download_complete();

        let contents = fs::read_to_string(dir.path().join("log_peer_1002.log")).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 11);
        // every line is timestamped
        assert!(lines.iter().all(|l| l.starts_with('[') && l.contains("]: ")));

        let expected = [
            "Peer 1002 makes a connection to Peer 1001.",
            "Peer 1002 is connected from Peer 1003.",
            "Peer 1002 has the preferred neighbors 1001,1003.",
            "Peer 1002 has the optimistically unchoked neighbor 1001.",
            "Peer 1002 is unchoked by 1001.",
            "Peer 1002 is choked by 1001.",
            "Peer 1002 received the 'have' message from 1001 for the piece 7.",
            "Peer 1002 received the 'interested' message from 1003.",
            "Peer 1002 received the 'not interested' message from 1003.",
            "Peer 1002 has downloaded the piece 7 from 1001. Now the number of pieces it has is 1.",
            "Peer 1002 has downloaded the complete file.",
        ];
        for (line, expected) in lines.iter().zip(expected.iter()) {
            assert!(line.ends_with(expected), "{:?} should end with {:?}", line, expected);
        }
    }
}
