use crate::{conf::CommonConf, error::*, piece_count, PieceIndex};

/// Information about the distributed file's piece geometry: the piece count,
/// the nominal and last piece lengths, and the file length itself.
///
/// A file of `file_len` bytes is partitioned into `piece_count` pieces of
/// `piece_len` bytes each, except for the last piece, which covers the
/// remainder and is `last_piece_len` bytes long. Piece indices are 0-based.
#[derive(Clone, Debug)]
pub(crate) struct StorageInfo {
    /// The number of pieces in the file.
    pub piece_count: usize,
    /// The nominal length of a piece.
    pub piece_len: u32,
    /// The length of the last piece in the file, which may differ from the
    /// normal piece length if the file length is not an exact multiple of the
    /// piece length.
    pub last_piece_len: u32,
    /// The length of the whole file.
    pub file_len: u64,
    /// The name of the distributed file within a peer's working directory.
    pub file_name: String,
}

impl StorageInfo {
    /// Derives the piece geometry from the shared configuration.
    pub fn new(common: &CommonConf) -> Self {
        let piece_count = piece_count(common.file_len, common.piece_len);
        let last_piece_len =
            common.file_len - common.piece_len as u64 * (piece_count - 1) as u64;
        Self {
            piece_count,
            piece_len: common.piece_len,
            last_piece_len: last_piece_len as u32,
            file_len: common.file_len,
            file_name: common.file_name.clone(),
        }
    }

    /// Returns the length of the piece at the given index.
    pub fn piece_len(&self, index: PieceIndex) -> Result<u32> {
        if index == self.piece_count - 1 {
            Ok(self.last_piece_len)
        } else if index < self.piece_count - 1 {
            Ok(self.piece_len)
        } else {
            log::error!("Piece {} is invalid for file: {:?}", index, self);
            Err(Error::InvalidPieceIndex(index))
        }
    }

    /// Returns the byte offset of the piece within the file.
    pub fn piece_offset(&self, index: PieceIndex) -> u64 {
        index as u64 * self.piece_len as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(file_len: u64, piece_len: u32) -> StorageInfo {
        let common = CommonConf {
            preferred_count: 2,
            unchoking_interval: std::time::Duration::from_secs(5),
            optimistic_interval: std::time::Duration::from_secs(10),
            file_name: "f.dat".to_string(),
            file_len,
            piece_len,
        };
        StorageInfo::new(&common)
    }

    #[test]
    fn test_single_piece_file() {
        // file equals the piece length: one piece, as long as the piece
        let info = info(16, 16);
        assert_eq!(info.piece_count, 1);
        assert_eq!(info.piece_len(0).unwrap(), 16);
        assert!(info.piece_len(1).is_err());
    }

    #[test]
    fn test_exact_multiple_file() {
        // the last piece is a whole piece, not zero bytes
        let info = info(64, 16);
        assert_eq!(info.piece_count, 4);
        assert_eq!(info.piece_len(2).unwrap(), 16);
        assert_eq!(info.piece_len(3).unwrap(), 16);
        assert_eq!(info.last_piece_len, 16);
    }

    #[test]
    fn test_remainder_file() {
        let info = info(64 + 5, 16);
        assert_eq!(info.piece_count, 5);
        assert_eq!(info.piece_len(3).unwrap(), 16);
        assert_eq!(info.piece_len(4).unwrap(), 5);
        assert_eq!(info.piece_offset(4), 64);
    }

    #[test]
    fn test_reference_geometry() {
        // the geometry of the canonical single-seeder scenario
        let info = info(24_301_474, 16_384);
        assert_eq!(info.piece_count, 1484);
        assert_eq!(info.last_piece_len, 13_026);
        assert_eq!(info.piece_len(1482).unwrap(), 16_384);
        assert_eq!(info.piece_len(1483).unwrap(), 13_026);
    }
}
