use {
    rand::thread_rng,
    std::{
        collections::{HashMap, HashSet},
        sync::Arc,
    },
    tokio::{
        sync::{mpsc, Mutex, RwLock},
        task,
    },
};

use crate::{
    disk::FileStore,
    error::*,
    event_log::EventLog,
    peer::{Command, Receiver, Sender, SessionState},
    piece_picker::PiecePicker,
    storage_info::StorageInfo,
    Bitfield, PeerId, PieceIndex,
};

/// The swarm-side face of one peer session: the channel into its task and
/// its shared protocol state.
pub(crate) struct SessionHandle {
    pub cmd: Sender,
    pub state: Arc<RwLock<SessionState>>,
}

/// A consistent-enough snapshot of one neighbor, taken by the choker. The
/// values of different neighbors may be from slightly different instants,
/// which is fine for a heuristic ranking.
#[derive(Clone, Copy, Debug)]
pub(crate) struct NeighborSnapshot {
    pub peer_id: PeerId,
    /// Whether the neighbor is interested in our pieces.
    pub interested: bool,
    /// Whether we are currently choking the neighbor.
    pub choked: bool,
    /// The piece payload bytes downloaded from the neighbor in the current
    /// rate window.
    pub window_bytes: u64,
}

/// The shared state of the running peer: its own piece possession, the map
/// of live sessions, and the ledger of remote peers known to own the whole
/// file.
///
/// The sessions map is only locked for membership changes and short
/// iterations; each session's mutable state sits behind its own lock.
pub(crate) struct Swarm {
    peer_id: PeerId,
    info: StorageInfo,
    store: Arc<FileStore>,
    events: Arc<EventLog>,
    /// The ids of every other peer in the roster. Termination requires all
    /// of them to be in `completed_remotes`.
    roster: HashSet<PeerId>,
    picker: RwLock<PiecePicker>,
    sessions: RwLock<HashMap<PeerId, SessionHandle>>,
    /// Remote peers whose bitmap has been observed universal. Outlives the
    /// sessions the observations were made on.
    completed_remotes: RwLock<HashSet<PeerId>>,
    /// Piece indices currently being written to disk, so concurrent
    /// deliveries of the same piece mark and announce it exactly once.
    pending_writes: Mutex<HashSet<PieceIndex>>,
}

impl Swarm {
    pub fn new(
        peer_id: PeerId,
        info: StorageInfo,
        store: Arc<FileStore>,
        events: Arc<EventLog>,
        roster: HashSet<PeerId>,
        is_seed: bool,
    ) -> Self {
        let picker = PiecePicker::new(info.piece_count, is_seed);
        Self {
            peer_id,
            info,
            store,
            events,
            roster,
            picker: RwLock::new(picker),
            sessions: RwLock::new(HashMap::new()),
            completed_remotes: RwLock::new(HashSet::new()),
            pending_writes: Mutex::new(HashSet::new()),
        }
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn storage_info(&self) -> &StorageInfo {
        &self.info
    }

    pub fn events(&self) -> &EventLog {
        &self.events
    }

    /// A copy of our own piece availability, for the bitfield frame.
    pub async fn own_pieces(&self) -> Bitfield {
        self.picker.read().await.own_pieces().clone()
    }

    pub async fn has_piece(&self, index: PieceIndex) -> bool {
        self.picker.read().await.has_piece(index)
    }

    /// Whether the remote availability contains any piece we still need.
    pub async fn is_interesting(&self, remote_pieces: &Bitfield) -> bool {
        self.picker.read().await.is_interesting(remote_pieces)
    }

    /// Whether we own the complete file (and thus act as a seeder).
    pub async fn self_complete(&self) -> bool {
        self.picker.read().await.is_complete()
    }

    /// Creates the session entry for a freshly handshaken connection.
    ///
    /// A session may exist per remote peer only while its transport is open,
    /// so a second transport claiming a connected id is refused.
    pub async fn register_session(
        &self,
        remote_id: PeerId,
    ) -> Result<(Arc<RwLock<SessionState>>, Receiver)> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&remote_id) {
            return Err(Error::DuplicatePeer(remote_id));
        }
        let (cmd_chan, cmd_port) = mpsc::unbounded_channel();
        let state = Arc::new(RwLock::new(SessionState::new(self.info.piece_count)));
        sessions.insert(
            remote_id,
            SessionHandle {
                cmd: cmd_chan,
                state: Arc::clone(&state),
            },
        );
        log::debug!("Registered session with peer {}", remote_id);
        Ok((state, cmd_port))
    }

    pub async fn remove_session(&self, remote_id: PeerId) {
        if self.sessions.write().await.remove(&remote_id).is_some() {
            log::debug!("Removed session with peer {}", remote_id);
        }
    }

    /// Records that the remote has been observed owning every piece. The
    /// record persists even if the session goes away afterwards.
    pub async fn mark_remote_complete(&self, remote_id: PeerId) {
        if self.completed_remotes.write().await.insert(remote_id) {
            log::info!("Peer {} now has the complete file", remote_id);
        }
    }

    /// Whether every peer of the roster, ourselves included, owns the
    /// complete file. This is the termination condition of the whole peer.
    pub async fn is_swarm_complete(&self) -> bool {
        if !self.self_complete().await {
            return false;
        }
        let completed = self.completed_remotes.read().await;
        self.roster.iter().all(|id| completed.contains(id))
    }

    /// Picks a piece to request from the given remote and records it as the
    /// session's outstanding request.
    ///
    /// Pieces outstanding at other sessions are excluded so parallel
    /// downloads don't duplicate work. The exclusion races with concurrent
    /// picks by design; a lost race only costs a redundant transfer, which
    /// the write path discards.
    pub async fn pick_and_reserve(
        &self,
        remote_id: PeerId,
        remote_pieces: &Bitfield,
    ) -> Option<PieceIndex> {
        let sessions = self.sessions.read().await;
        let mut in_flight = HashSet::new();
        for (peer_id, handle) in sessions.iter() {
            if *peer_id != remote_id {
                if let Some(index) = handle.state.read().await.outstanding_request {
                    in_flight.insert(index);
                }
            }
        }

        let picked = self
            .picker
            .read()
            .await
            .pick(remote_pieces, &in_flight, &mut thread_rng())?;
        if let Some(handle) = sessions.get(&remote_id) {
            handle.state.write().await.outstanding_request = Some(picked);
        }
        Some(picked)
    }

    /// Reads a piece from storage for serving.
    pub async fn read_piece(&self, index: PieceIndex) -> Result<Arc<Vec<u8>>> {
        let store = Arc::clone(&self.store);
        task::spawn_blocking(move || store.read_piece(index))
            .await
            .expect("piece read task panicked")
    }

    /// The piece write path: stores a downloaded piece, marks it possessed,
    /// announces it to every session and, when it was the last missing
    /// piece, assembles the complete file.
    ///
    /// Duplicate deliveries are discarded without error, no matter whether
    /// the piece is already on disk or still being written by a concurrent
    /// delivery.
    pub async fn handle_piece(
        &self,
        from: PeerId,
        index: PieceIndex,
        data: Vec<u8>,
    ) -> Result<()> {
        {
            if self.picker.read().await.has_piece(index) {
                log::debug!("Discarding duplicate piece {}", index);
                return Ok(());
            }
            let mut pending = self.pending_writes.lock().await;
            if !pending.insert(index) {
                log::debug!("Piece {} write already in flight", index);
                return Ok(());
            }
        }

        let store = Arc::clone(&self.store);
        let write_res = task::spawn_blocking(move || store.write_piece(index, &data))
            .await
            .expect("piece write task panicked");
        self.pending_writes.lock().await.remove(&index);
        // on failure the piece stays unpossessed and re-requestable
        write_res?;

        let have_count = {
            let mut picker = self.picker.write().await;
            picker.received_piece(index);
            picker.have_count()
        };
        self.events.piece_downloaded(index, from, have_count);
        log::info!(
            "Peer {} downloaded piece {} from peer {} ({}/{})",
            self.peer_id,
            index,
            from,
            have_count,
            self.info.piece_count
        );

        // every session learns of the new piece, the one it came from
        // included (the remote ignores the echo), and re-checks whether its
        // remote still interests us
        {
            let sessions = self.sessions.read().await;
            for handle in sessions.values() {
                let _ = handle.cmd.send(Command::Have(index));
                let _ = handle.cmd.send(Command::ReviseInterest);
            }
        }

        if self.picker.read().await.is_complete() {
            self.events.download_complete();
            log::info!("Peer {} has downloaded the complete file", self.peer_id);
            let store = Arc::clone(&self.store);
            task::spawn_blocking(move || store.assemble())
                .await
                .expect("file assembly task panicked")?;
        }

        Ok(())
    }

    /// Sends a command to the session of the given peer, if it is still
    /// connected.
    pub async fn command(&self, peer_id: PeerId, cmd: Command) {
        let sessions = self.sessions.read().await;
        if let Some(handle) = sessions.get(&peer_id) {
            if handle.cmd.send(cmd).is_err() {
                log::debug!("Session {} command channel is closed", peer_id);
            }
        }
    }

    /// Takes the choker's view of every live session.
    pub async fn neighbor_snapshot(&self) -> Vec<NeighborSnapshot> {
        let sessions = self.sessions.read().await;
        let mut snapshot = Vec::with_capacity(sessions.len());
        for (peer_id, handle) in sessions.iter() {
            let state = handle.state.read().await;
            snapshot.push(NeighborSnapshot {
                peer_id: *peer_id,
                interested: state.peer_interested,
                choked: state.am_choking,
                window_bytes: state.downloaded.window(),
            });
        }
        snapshot
    }

    /// Starts a new rate window on every session's download counter.
    pub async fn reset_download_windows(&self) {
        let sessions = self.sessions.read().await;
        for handle in sessions.values() {
            handle.state.write().await.downloaded.reset_window();
        }
    }

    /// Asks every session task to drain its queue and stop.
    pub async fn shutdown_sessions(&self) {
        let sessions = self.sessions.read().await;
        for handle in sessions.values() {
            let _ = handle.cmd.send(Command::Shutdown);
        }
    }
}
