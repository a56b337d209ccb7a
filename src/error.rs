//! The error type shared by all parts of the engine.
//!
//! Failures fall into a few broad kinds: handshake-phase failures and framing
//! violations close the offending connection, storage failures leave the
//! affected piece re-requestable, and configuration failures are fatal at
//! startup. Transport I/O errors are carried through transparently.

use std::io;

use thiserror::Error;

use crate::{PeerId, PieceIndex};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// The first 18 bytes of a handshake frame did not match the protocol
    /// header.
    #[error("invalid handshake header")]
    BadHandshakeHeader,

    /// An outbound connection was answered by a peer other than the one
    /// dialed.
    #[error("handshake peer id mismatch: dialed {expected}, got {actual}")]
    PeerIdMismatch { expected: PeerId, actual: PeerId },

    /// The remote did not complete the handshake within the allowed time.
    #[error("handshake timed out")]
    HandshakeTimeout,

    /// A frame carried a message type outside the protocol's range.
    #[error("unknown message type {0}")]
    UnknownMessageType(u8),

    /// A frame's payload did not have the shape its type requires.
    #[error("malformed {0} payload")]
    MalformedPayload(&'static str),

    /// A piece index referred to a piece outside the file.
    #[error("piece index {0} is out of bounds")]
    InvalidPieceIndex(PieceIndex),

    /// A second transport claimed a peer id that already has a live session.
    #[error("peer {0} is already connected")]
    DuplicatePeer(PeerId),

    /// The remote ended the connection cleanly.
    #[error("connection closed by remote")]
    TransportClosed,

    /// An in-process channel's receiving half is gone, which only happens
    /// during shutdown.
    #[error("command channel closed")]
    ChannelClosed,

    /// Reading or writing a piece on disk failed. A failed write leaves the
    /// piece unpossessed so it can be requested again.
    #[error("piece storage failure: {0}")]
    Storage(#[source] io::Error),

    /// Invalid or missing configuration, fatal at startup.
    #[error("configuration error: {0}")]
    Config(String),

    /// An I/O fault on a session's transport.
    #[error(transparent)]
    Io(#[from] io::Error),
}
