pub(crate) mod codec;

use {
    futures::{select, stream::SplitSink, SinkExt, StreamExt},
    std::{net::SocketAddr, sync::Arc, time::Duration},
    tokio::{
        net::TcpStream,
        sync::{
            mpsc::{UnboundedReceiver, UnboundedSender},
            RwLock,
        },
        time,
    },
    tokio_util::codec::{Framed, FramedParts},
};

use {
    crate::{counter::Counter, error::*, swarm::Swarm, Bitfield, PeerId, PieceIndex},
    codec::*,
};

/// The time within which the remote's handshake must arrive once the
/// transport is up. A silent remote is disconnected.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// The channel on which the swarm and the choker send commands to a peer
/// session task.
pub(crate) type Sender = UnboundedSender<Command>;
pub(crate) type Receiver = UnboundedReceiver<Command>;

type MessageSink = SplitSink<Framed<TcpStream, PeerCodec>, Message>;

/// The commands a peer session can receive.
///
/// All outbound traffic of a session flows through its own task, so frames
/// initiated elsewhere (scheduler decisions, have broadcasts) arrive here and
/// are serialized with the session's other sends.
#[derive(Clone, Copy, Debug)]
pub(crate) enum Command {
    /// Stop serving the remote's requests and tell it so.
    Choke,
    /// Start serving the remote's requests and tell it so.
    Unchoke,
    /// Announce that we now have the piece.
    Have(PieceIndex),
    /// Our possession changed; drop our interest in the remote if it has
    /// nothing we need anymore.
    ReviseInterest,
    /// Eventually shut down the peer session.
    Shutdown,
}

/// The protocol state of one neighbor connection, shared between the session
/// task, the swarm and the choker.
///
/// By default, both sides of the connection start off as choked and not
/// interested in the other.
#[derive(Debug)]
pub(crate) struct SessionState {
    /// The remote's piece availability, all zeros until its bitfield frame
    /// arrives and kept current by its have announcements.
    pub bitfield: Bitfield,
    /// If true, we do not serve the remote's requests.
    pub am_choking: bool,
    /// If true, the remote has pieces that we need.
    pub am_interested: bool,
    /// If true, the remote doesn't allow us to download pieces from it.
    pub peer_choking: bool,
    /// If true, the remote means to download pieces that we have.
    pub peer_interested: bool,
    /// The piece we have requested from the remote and not yet received.
    /// There is never more than one.
    pub outstanding_request: Option<PieceIndex>,
    /// Piece payload bytes received from the remote.
    pub downloaded: Counter,
    /// Piece payload bytes served to the remote.
    pub uploaded: Counter,
}

impl SessionState {
    pub fn new(piece_count: usize) -> Self {
        Self {
            bitfield: Bitfield::repeat(false, piece_count),
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
            outstanding_request: None,
            downloaded: Counter::default(),
            uploaded: Counter::default(),
        }
    }
}

/// Which side established the transport.
#[derive(Clone, Copy, Debug)]
enum Direction {
    /// We dialed the remote and therefore know which peer id to expect.
    Outbound { dialed: PeerId },
    /// The remote dialed us; any peer id is accepted.
    Inbound,
}

pub(crate) struct PeerSession {
    swarm: Arc<Swarm>,
    /// The remote address of the peer.
    addr: SocketAddr,
    direction: Direction,
}

impl PeerSession {
    /// Creates a session for a connection we initiated towards the given
    /// peer.
    pub fn outbound(swarm: Arc<Swarm>, addr: SocketAddr, dialed: PeerId) -> Self {
        Self {
            swarm,
            addr,
            direction: Direction::Outbound { dialed },
        }
    }

    /// Creates a session for a connection accepted on our listening port.
    pub fn inbound(swarm: Arc<Swarm>, addr: SocketAddr) -> Self {
        Self {
            swarm,
            addr,
            direction: Direction::Inbound,
        }
    }

    /// Runs the handshake sub-protocol and then the session until the
    /// connection is closed, a protocol violation occurs, or shutdown is
    /// requested.
    pub async fn start(&mut self, socket: TcpStream) -> Result<()> {
        log::info!("Starting peer session with {}", self.addr);
        let mut socket = Framed::new(socket, HandshakeCodec);

        // both sides send their handshake first and read the remote's second
        socket.send(Handshake::new(self.swarm.peer_id())).await?;
        let remote_handshake = match time::timeout(HANDSHAKE_TIMEOUT, socket.next()).await {
            Ok(Some(handshake)) => handshake?,
            Ok(None) => return Err(Error::TransportClosed),
            Err(_) => return Err(Error::HandshakeTimeout),
        };
        let remote_id = remote_handshake.peer_id;
        log::debug!("Peer {} handshake: {:?}", self.addr, remote_handshake);

        if let Direction::Outbound { dialed } = self.direction {
            if remote_id != dialed {
                return Err(Error::PeerIdMismatch {
                    expected: dialed,
                    actual: remote_id,
                });
            }
        }

        let (state, cmd_port) = self.swarm.register_session(remote_id).await?;
        match self.direction {
            Direction::Outbound { .. } => self.swarm.events().connection_made(remote_id),
            Direction::Inbound => self.swarm.events().connected_from(remote_id),
        }
        log::info!("Session with peer {} at {} established", remote_id, self.addr);

        // now that we have the handshake, we need to switch to the peer
        // message codec and keep the buffers of the original codec, as they
        // may already contain bytes of frames the remote sent after its
        // handshake
        let old_parts = socket.into_parts();
        let mut new_parts = FramedParts::new(
            old_parts.io,
            PeerCodec::new(self.swarm.storage_info().clone()),
        );
        // reuse buffers of previous codec
        new_parts.read_buf = old_parts.read_buf;
        new_parts.write_buf = old_parts.write_buf;
        let socket = Framed::from_parts(new_parts);

        let res = self.run(socket, remote_id, &state, cmd_port).await;
        self.swarm.remove_session(remote_id).await;
        res
    }

    /// The main session loop: exchange of messages with the remote and
    /// commands from other parts of the engine.
    async fn run(
        &mut self,
        socket: Framed<TcpStream, PeerCodec>,
        remote_id: PeerId,
        state: &Arc<RwLock<SessionState>>,
        cmd_port: Receiver,
    ) -> Result<()> {
        // split the sink and stream so that we can pass the sink while
        // holding a reference to the stream in the loop
        let (mut sink, stream) = socket.split();
        let mut stream = stream.fuse();
        let mut cmd_port = cmd_port.fuse();

        // advertising possession is unconditional, even with an all-zero
        // bitmap: the remote relies on the frame to decide its interest
        sink.send(Message::Bitfield(self.swarm.own_pieces().await)).await?;

        loop {
            select! {
                msg = stream.next() => {
                    let msg = match msg {
                        Some(msg) => msg?,
                        None => return Err(Error::TransportClosed),
                    };
                    log::trace!(
                        "Received message {:?} from peer {}",
                        msg.id(),
                        remote_id
                    );
                    self.handle_msg(&mut sink, remote_id, state, msg).await?;
                }
                cmd = cmd_port.select_next_some() => {
                    if let Command::Shutdown = cmd {
                        log::info!("Shutting down session with peer {}", remote_id);
                        return Ok(());
                    }
                    self.handle_cmd(&mut sink, remote_id, state, cmd).await?;
                }
            }
        }
    }

    /// Applies one inbound frame to the session and swarm state.
    async fn handle_msg(
        &self,
        sink: &mut MessageSink,
        remote_id: PeerId,
        state: &Arc<RwLock<SessionState>>,
        msg: Message,
    ) -> Result<()> {
        match msg {
            Message::Bitfield(bitfield) => {
                log::debug!(
                    "Peer {} advertises {} of {} pieces",
                    remote_id,
                    bitfield.count_ones(),
                    bitfield.len()
                );
                let interesting = self.swarm.is_interesting(&bitfield).await;
                let complete = bitfield.all();
                {
                    let mut state = state.write().await;
                    state.bitfield = bitfield;
                    state.am_interested = interesting;
                }
                if complete {
                    self.swarm.mark_remote_complete(remote_id).await;
                }
                sink.send(if interesting {
                    Message::Interested
                } else {
                    Message::NotInterested
                })
                .await?;
                // normally requests wait for an unchoke, but a late bitfield
                // may arrive when the remote has already unchoked us
                self.request_if_able(sink, remote_id, state).await?;
            }
            Message::Interested => {
                state.write().await.peer_interested = true;
                self.swarm.events().interested_received(remote_id);
            }
            Message::NotInterested => {
                state.write().await.peer_interested = false;
                self.swarm.events().not_interested_received(remote_id);
            }
            Message::Choke => {
                {
                    let mut state = state.write().await;
                    state.peer_choking = true;
                    // the requested piece is not coming; it stays needed and
                    // may be requested again from any suitable peer
                    state.outstanding_request = None;
                }
                self.swarm.events().choked_by(remote_id);
            }
            Message::Unchoke => {
                state.write().await.peer_choking = false;
                self.swarm.events().unchoked_by(remote_id);
                // a duplicate unchoke must not stack a second request
                self.request_if_able(sink, remote_id, state).await?;
            }
            Message::Have(index) => {
                let needed = !self.swarm.has_piece(index).await;
                let (remote_complete, became_interested) = {
                    let mut state = state.write().await;
                    state.bitfield.set(index, true);
                    let became = needed && !state.am_interested;
                    if became {
                        state.am_interested = true;
                    }
                    (state.bitfield.all(), became)
                };
                if remote_complete {
                    self.swarm.mark_remote_complete(remote_id).await;
                }
                self.swarm.events().have_received(remote_id, index);
                if became_interested {
                    sink.send(Message::Interested).await?;
                    // the remote may have unchoked us back when it had
                    // nothing we needed
                    self.request_if_able(sink, remote_id, state).await?;
                }
            }
            Message::Request(index) => {
                self.handle_request_msg(sink, remote_id, state, index).await?;
            }
            Message::Piece { index, data } => {
                self.handle_piece_msg(sink, remote_id, state, index, data).await?;
            }
        }

        Ok(())
    }

    /// Serves a requested piece, unless the remote is choked or we don't
    /// have the piece, in which cases the request is dropped silently.
    async fn handle_request_msg(
        &self,
        sink: &mut MessageSink,
        remote_id: PeerId,
        state: &Arc<RwLock<SessionState>>,
        index: PieceIndex,
    ) -> Result<()> {
        if state.read().await.am_choking {
            log::debug!("Ignoring request {} from choked peer {}", index, remote_id);
            return Ok(());
        }
        if !self.swarm.has_piece(index).await {
            log::warn!("Peer {} requested piece {} we don't have", remote_id, index);
            return Ok(());
        }

        match self.swarm.read_piece(index).await {
            Ok(data) => {
                let len = data.len() as u64;
                sink.send(Message::Piece {
                    index,
                    data: data.to_vec(),
                })
                .await?;
                state.write().await.uploaded.record(len);
                log::debug!("Served piece {} to peer {} ({} bytes)", index, remote_id, len);
            }
            Err(Error::Storage(e)) => {
                // the session survives a failed read; the remote may simply
                // re-request
                log::warn!("Failed to read piece {} for peer {}: {}", index, remote_id, e);
            }
            Err(e) => return Err(e),
        }

        Ok(())
    }

    /// Accounts and stores a received piece and keeps the download pipeline
    /// going while the remote lets us.
    async fn handle_piece_msg(
        &self,
        sink: &mut MessageSink,
        remote_id: PeerId,
        state: &Arc<RwLock<SessionState>>,
        index: PieceIndex,
        data: Vec<u8>,
    ) -> Result<()> {
        log::debug!(
            "Received piece {} from peer {} ({} bytes)",
            index,
            remote_id,
            data.len()
        );
        {
            let mut state = state.write().await;
            if state.outstanding_request != Some(index) {
                // an unsolicited piece is still accepted and stored
                log::warn!("Peer {} sent piece {} we did not request", remote_id, index);
            }
            state.downloaded.record(data.len() as u64);
            state.outstanding_request = None;
        }

        match self.swarm.handle_piece(remote_id, index, data).await {
            Ok(()) => {}
            Err(Error::Storage(e)) => {
                // the piece was not marked possessed, so it stays needed and
                // will be picked again by a later request
                log::warn!("Failed to store piece {}: {}", index, e);
            }
            Err(e) => return Err(e),
        }

        self.request_if_able(sink, remote_id, state).await
    }

    /// Issues a request if the session is in the state that allows one:
    /// interested, unchoked by the remote, and nothing outstanding.
    async fn request_if_able(
        &self,
        sink: &mut MessageSink,
        remote_id: PeerId,
        state: &Arc<RwLock<SessionState>>,
    ) -> Result<()> {
        let can_request = {
            let state = state.read().await;
            state.am_interested && !state.peer_choking && state.outstanding_request.is_none()
        };
        if can_request {
            self.make_request(sink, remote_id, state).await?;
        }
        Ok(())
    }

    /// Requests one piece from the remote, or declares lost interest when
    /// the remote has nothing left that we need and that isn't already on
    /// its way from another peer.
    async fn make_request(
        &self,
        sink: &mut MessageSink,
        remote_id: PeerId,
        state: &Arc<RwLock<SessionState>>,
    ) -> Result<()> {
        let remote_pieces = state.read().await.bitfield.clone();
        match self.swarm.pick_and_reserve(remote_id, &remote_pieces).await {
            Some(index) => {
                log::debug!("Requesting piece {} from peer {}", index, remote_id);
                sink.send(Message::Request(index)).await?;
            }
            None => {
                let dropped = {
                    let mut state = state.write().await;
                    let dropped = state.am_interested;
                    state.am_interested = false;
                    dropped
                };
                if dropped {
                    log::debug!("No more pieces to fetch from peer {}", remote_id);
                    sink.send(Message::NotInterested).await?;
                }
            }
        }
        Ok(())
    }

    /// Applies a command from the swarm or the choker.
    async fn handle_cmd(
        &self,
        sink: &mut MessageSink,
        remote_id: PeerId,
        state: &Arc<RwLock<SessionState>>,
        cmd: Command,
    ) -> Result<()> {
        match cmd {
            Command::Choke => {
                let transition = {
                    let mut state = state.write().await;
                    let transition = !state.am_choking;
                    state.am_choking = true;
                    transition
                };
                if transition {
                    log::debug!("Choking peer {}", remote_id);
                    sink.send(Message::Choke).await?;
                }
            }
            Command::Unchoke => {
                let transition = {
                    let mut state = state.write().await;
                    let transition = state.am_choking;
                    state.am_choking = false;
                    transition
                };
                if transition {
                    log::debug!("Unchoking peer {}", remote_id);
                    sink.send(Message::Unchoke).await?;
                }
            }
            Command::Have(index) => {
                sink.send(Message::Have(index)).await?;
            }
            Command::ReviseInterest => {
                let remote_pieces = state.read().await.bitfield.clone();
                if !self.swarm.is_interesting(&remote_pieces).await {
                    let dropped = {
                        let mut state = state.write().await;
                        let dropped = state.am_interested;
                        state.am_interested = false;
                        dropped
                    };
                    if dropped {
                        log::debug!("No longer interested in peer {}", remote_id);
                        sink.send(Message::NotInterested).await?;
                    }
                }
            }
            Command::Shutdown => {
                // handled by the session loop
                debug_assert!(false, "Shutdown must be handled in run");
            }
        }

        Ok(())
    }
}
