use std::collections::HashSet;

use rand::{seq::IteratorRandom, Rng};

use crate::{Bitfield, PieceIndex};

/// Tracks which pieces the running peer possesses and picks the next piece to
/// request from a neighbor.
///
/// Possession is monotone: pieces are only ever added. The complement of the
/// possessed set is the set of needed pieces, and a neighbor is "interesting"
/// exactly when it advertises at least one needed piece.
pub(crate) struct PiecePicker {
    /// Which pieces the running peer has.
    own_pieces: Bitfield,
}

impl PiecePicker {
    pub fn new(piece_count: usize, has_all: bool) -> Self {
        let mut own_pieces = Bitfield::repeat(false, piece_count);
        if has_all {
            for index in 0..piece_count {
                own_pieces.set(index, true);
            }
        }
        Self { own_pieces }
    }

    /// The peer's own piece availability.
    pub fn own_pieces(&self) -> &Bitfield {
        &self.own_pieces
    }

    pub fn piece_count(&self) -> usize {
        self.own_pieces.len()
    }

    pub fn has_piece(&self, index: PieceIndex) -> bool {
        index < self.own_pieces.len() && self.own_pieces[index]
    }

    /// The number of pieces the peer has.
    pub fn have_count(&self) -> usize {
        self.own_pieces.count_ones()
    }

    /// Whether the peer has every piece of the file.
    pub fn is_complete(&self) -> bool {
        self.own_pieces.all()
    }

    /// Marks the piece as possessed. Returns false if the peer already had
    /// it, which callers treat as a harmless duplicate.
    pub fn received_piece(&mut self, index: PieceIndex) -> bool {
        if self.has_piece(index) {
            false
        } else {
            self.own_pieces.set(index, true);
            true
        }
    }

    /// Whether the remote peer advertising the given availability has any
    /// piece we still need.
    pub fn is_interesting(&self, remote_pieces: &Bitfield) -> bool {
        self.candidates(remote_pieces).next().is_some()
    }

    /// Picks one piece uniformly at random from the pieces the remote has,
    /// we need, and no other session is already requesting. Returns `None`
    /// when no such piece remains.
    pub fn pick(
        &self,
        remote_pieces: &Bitfield,
        in_flight: &HashSet<PieceIndex>,
        rng: &mut impl Rng,
    ) -> Option<PieceIndex> {
        self.candidates(remote_pieces)
            .filter(|index| !in_flight.contains(index))
            .choose(rng)
    }

    /// The pieces the remote has and we need.
    fn candidates<'a>(
        &'a self,
        remote_pieces: &'a Bitfield,
    ) -> impl Iterator<Item = PieceIndex> + 'a {
        let len = self.own_pieces.len().min(remote_pieces.len());
        (0..len).filter(move |&index| remote_pieces[index] && !self.own_pieces[index])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    fn bitfield_of(piece_count: usize, pieces: &[PieceIndex]) -> Bitfield {
        let mut bitfield = Bitfield::repeat(false, piece_count);
        for &index in pieces {
            bitfield.set(index, true);
        }
        bitfield
    }

    #[test]
    fn test_possession_is_monotone() {
        let mut picker = PiecePicker::new(4, false);
        assert_eq!(picker.have_count(), 0);
        assert!(!picker.is_complete());

        assert!(picker.received_piece(2));
        // a second receipt of the same piece is reported as a duplicate
        assert!(!picker.received_piece(2));
        assert_eq!(picker.have_count(), 1);
        assert!(picker.has_piece(2));

        for index in [0, 1, 3].iter() {
            assert!(picker.received_piece(*index));
        }
        assert!(picker.is_complete());
    }

    #[test]
    fn test_seed_starts_complete() {
        let picker = PiecePicker::new(9, true);
        assert!(picker.is_complete());
        assert_eq!(picker.have_count(), 9);
        assert!(!picker.is_interesting(&bitfield_of(9, &[0, 8])));
    }

    #[test]
    fn test_interest_requires_a_needed_piece() {
        let mut picker = PiecePicker::new(4, false);
        assert!(picker.is_interesting(&bitfield_of(4, &[1])));
        picker.received_piece(1);
        // the remote only has what we already have
        assert!(!picker.is_interesting(&bitfield_of(4, &[1])));
        assert!(picker.is_interesting(&bitfield_of(4, &[1, 3])));
        assert!(!picker.is_interesting(&bitfield_of(4, &[])));
    }

    #[test]
    fn test_pick_excludes_own_and_in_flight_pieces() {
        let mut rng = StdRng::seed_from_u64(42);
        let mut picker = PiecePicker::new(4, false);
        picker.received_piece(0);
        let remote = bitfield_of(4, &[0, 1, 2]);

        let mut in_flight = HashSet::new();
        in_flight.insert(1);
        // piece 0 is ours and piece 1 is requested elsewhere, leaving 2
        assert_eq!(picker.pick(&remote, &in_flight, &mut rng), Some(2));

        in_flight.insert(2);
        assert_eq!(picker.pick(&remote, &in_flight, &mut rng), None);
    }

    #[test]
    fn test_pick_is_deterministic_under_a_seeded_rng() {
        let picker = PiecePicker::new(16, false);
        let remote = bitfield_of(16, &[1, 5, 9, 13]);
        let none = HashSet::new();

        let mut first = StdRng::seed_from_u64(7);
        let mut second = StdRng::seed_from_u64(7);
        let picked = picker.pick(&remote, &none, &mut first);
        assert_eq!(picked, picker.pick(&remote, &none, &mut second));
        assert!([1, 5, 9, 13].contains(&picked.unwrap()));
    }
}
