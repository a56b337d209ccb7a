// needed by the `select!` macro reaching the default recursion limit
#![recursion_limit = "256"]

mod choker;
pub mod conf;
mod counter;
mod disk;
pub mod engine;
pub mod error;
mod event_log;
mod peer;
mod piece_picker;
mod storage_info;
mod swarm;

use bitvec::prelude::{BitVec, Msb0};

pub use conf::Conf;

/// The type of a piece's index.
///
/// On the wire all integers are sent as 4-byte big endian integers, but in the
/// source code we use `usize` to be consistent with other index types in Rust.
pub type PieceIndex = usize;

/// Each peer is identified by a strictly positive 32-bit integer that is
/// unique within the swarm and fixed for the peer's lifetime. It is the only
/// variable part of the handshake.
pub type PeerId = u32;

/// The bitfield represents the piece availability of a peer.
///
/// It is a compact bool vector of most significant bits to least significants
/// bits, that is, where the first highest bit represents the first piece, the
/// second highest element the second piece, and so on (e.g. `0b1100_0001` would
/// mean that we have pieces 0, 1, and 7). A truthy boolean value of a piece's
/// position in this vector means that the peer has the piece, while a falsy
/// value means it doesn't have the piece.
pub type Bitfield = BitVec<Msb0, u8>;

/// Returns the number of pieces a file of the given length is partitioned
/// into.
///
/// All pieces but the last are exactly `piece_len` bytes long; the last piece
/// covers the remainder and may be shorter, so we round up before dividing.
///
/// # Panics
///
/// Panics if either argument is zero.
pub(crate) fn piece_count(file_len: u64, piece_len: u32) -> usize {
    assert!(file_len > 0);
    assert!(piece_len > 0);
    ((file_len + piece_len as u64 - 1) / piece_len as u64) as usize
}

/// Returns the number of bytes a serialized bitfield of the given piece count
/// occupies: one bit per piece, rounded up to a whole byte.
pub(crate) fn bitfield_byte_len(piece_count: usize) -> usize {
    (piece_count + 7) / 8
}
