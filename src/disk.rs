//! On-disk piece storage.
//!
//! A seeder owns the complete file at `peer_<id>/<FileName>` from the start
//! and serves every piece out of it. A leecher stages each downloaded piece
//! as `peer_<id>/temp_pieces/piece_<i>.tmp` and, once all pieces are present,
//! reassembles them into the complete file and drops the staging area.
//!
//! All methods here perform blocking file I/O and are expected to be called
//! through `task::spawn_blocking` from async code.

use std::{
    fs::{self, File, OpenOptions},
    io::{self, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

use lru::LruCache;

use crate::{error::*, storage_info::StorageInfo, PeerId, PieceIndex};

/// The number of recently read pieces kept in memory. Serving several
/// leechers tends to re-read the same pieces in bursts.
const PIECE_CACHE_LEN: usize = 64;

/// The piece store of one peer.
///
/// Concurrent reads and writes are safe: reads open the backing file per
/// call, writes of the same piece produce identical bytes, and possession
/// bookkeeping lives elsewhere (in the piece picker), so a redundant write is
/// harmless.
pub(crate) struct FileStore {
    info: StorageInfo,
    /// `peer_<id>/<FileName>`, the complete file.
    file_path: PathBuf,
    /// `peer_<id>/temp_pieces`, the staging area of a leecher.
    temp_dir: PathBuf,
    /// Whether the complete file exists on disk. True from the start for
    /// a seeder, flipped by `assemble` for a leecher.
    complete: AtomicBool,
    cache: Mutex<LruCache<PieceIndex, Arc<Vec<u8>>>>,
}

impl FileStore {
    /// Sets up the peer's working directory under `root`.
    ///
    /// For a seeder the complete file must already exist with exactly the
    /// configured length; anything else is a fatal configuration error. For
    /// a leecher the staging directory is created.
    pub fn new(root: &Path, peer_id: PeerId, info: StorageInfo, is_seed: bool) -> Result<Self> {
        let peer_dir = root.join(format!("peer_{}", peer_id));
        fs::create_dir_all(&peer_dir)?;
        let file_path = peer_dir.join(&info.file_name);
        let temp_dir = peer_dir.join("temp_pieces");

        if is_seed {
            let metadata = fs::metadata(&file_path).map_err(|e| {
                Error::Config(format!("seed file {:?} is not readable: {}", file_path, e))
            })?;
            if metadata.len() != info.file_len {
                return Err(Error::Config(format!(
                    "seed file {:?} is {} bytes, expected {}",
                    file_path,
                    metadata.len(),
                    info.file_len
                )));
            }
        } else {
            fs::create_dir_all(&temp_dir)?;
        }

        Ok(Self {
            info,
            file_path,
            temp_dir,
            complete: AtomicBool::new(is_seed),
            cache: Mutex::new(LruCache::new(PIECE_CACHE_LEN)),
        })
    }

    /// Whether the complete file exists on disk.
    pub fn is_complete(&self) -> bool {
        self.complete.load(Ordering::Acquire)
    }

    /// Reads the piece at the given index, from the complete file if present
    /// and from the staging area otherwise.
    pub fn read_piece(&self, index: PieceIndex) -> Result<Arc<Vec<u8>>> {
        let piece_len = self.info.piece_len(index)? as usize;

        if let Some(piece) = self.cache_get(index) {
            return Ok(piece);
        }

        let mut data = vec![0; piece_len];
        if self.is_complete() {
            let mut file = File::open(&self.file_path).map_err(Error::Storage)?;
            file.seek(SeekFrom::Start(self.info.piece_offset(index)))
                .map_err(Error::Storage)?;
            file.read_exact(&mut data).map_err(Error::Storage)?;
        } else {
            let mut file = File::open(self.piece_path(index)).map_err(Error::Storage)?;
            file.read_exact(&mut data).map_err(Error::Storage)?;
            // a staged piece longer than its geometry allows never gets
            // written, so a trailing byte means the file is foreign
            if file.read(&mut [0]).map_err(Error::Storage)? != 0 {
                return Err(Error::Storage(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("staged piece {} is longer than expected", index),
                )));
            }
        }

        let data = Arc::new(data);
        self.cache_put(index, Arc::clone(&data));
        Ok(data)
    }

    /// Stages the piece at the given index. Writing a piece that is already
    /// staged is a no-op, which makes duplicate deliveries harmless.
    pub fn write_piece(&self, index: PieceIndex, data: &[u8]) -> Result<()> {
        let piece_len = self.info.piece_len(index)? as usize;
        if data.len() != piece_len {
            return Err(Error::Storage(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "piece {} is {} bytes, expected {}",
                    index,
                    data.len(),
                    piece_len
                ),
            )));
        }

        if self.is_complete() {
            log::debug!("Ignoring write of piece {}, file is complete", index);
            return Ok(());
        }

        let path = self.piece_path(index);
        if path.exists() {
            log::debug!("Piece {} is already staged", index);
            return Ok(());
        }

        fs::write(&path, data).map_err(Error::Storage)?;
        log::trace!("Staged piece {} ({} bytes)", index, data.len());
        self.cache_put(index, Arc::new(data.to_vec()));
        Ok(())
    }

    /// Concatenates all staged pieces, in index order, into the complete
    /// file, then removes the staging area.
    pub fn assemble(&self) -> Result<()> {
        if self.is_complete() {
            return Ok(());
        }
        log::info!(
            "Assembling {:?} from {} staged pieces",
            self.file_path,
            self.info.piece_count
        );

        let mut out = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.file_path)
            .map_err(Error::Storage)?;
        for index in 0..self.info.piece_count {
            let mut piece = Vec::with_capacity(self.info.piece_len(index)? as usize);
            File::open(self.piece_path(index))
                .and_then(|mut f| f.read_to_end(&mut piece))
                .map_err(Error::Storage)?;
            out.write_all(&piece).map_err(Error::Storage)?;
        }
        out.flush().map_err(Error::Storage)?;

        let written = out.metadata().map_err(Error::Storage)?.len();
        if written != self.info.file_len {
            return Err(Error::Storage(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "assembled file is {} bytes, expected {}",
                    written, self.info.file_len
                ),
            )));
        }

        self.complete.store(true, Ordering::Release);
        self.cleanup_staging();
        log::info!("Assembled {:?} ({} bytes)", self.file_path, written);
        Ok(())
    }

    /// Removes the staged piece files and the staging directory. Leftovers
    /// are only logged: the complete file already exists at this point.
    fn cleanup_staging(&self) {
        for index in 0..self.info.piece_count {
            if let Err(e) = fs::remove_file(self.piece_path(index)) {
                log::warn!("Failed to remove staged piece {}: {}", index, e);
            }
        }
        if let Err(e) = fs::remove_dir(&self.temp_dir) {
            log::warn!("Failed to remove staging dir {:?}: {}", self.temp_dir, e);
        }
    }

    fn piece_path(&self, index: PieceIndex) -> PathBuf {
        self.temp_dir.join(format!("piece_{}.tmp", index))
    }

    fn cache_get(&self, index: PieceIndex) -> Option<Arc<Vec<u8>>> {
        let mut cache = match self.cache.lock() {
            Ok(cache) => cache,
            Err(poisoned) => poisoned.into_inner(),
        };
        cache.get(&index).cloned()
    }

    fn cache_put(&self, index: PieceIndex, data: Arc<Vec<u8>>) {
        let mut cache = match self.cache.lock() {
            Ok(cache) => cache,
            Err(poisoned) => poisoned.into_inner(),
        };
        cache.put(index, data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conf::CommonConf;
    use std::time::Duration;

    fn storage_info(file_len: u64, piece_len: u32) -> StorageInfo {
        StorageInfo::new(&CommonConf {
            preferred_count: 2,
            unchoking_interval: Duration::from_secs(5),
            optimistic_interval: Duration::from_secs(10),
            file_name: "payload.dat".to_string(),
            file_len,
            piece_len,
        })
    }

    fn file_bytes(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn test_seed_requires_the_complete_file() {
        let dir = tempfile::tempdir().unwrap();
        let info = storage_info(10, 4);
        // missing file
        assert!(FileStore::new(dir.path(), 1001, info.clone(), true).is_err());
        // wrong length
        let peer_dir = dir.path().join("peer_1001");
        fs::create_dir_all(&peer_dir).unwrap();
        fs::write(peer_dir.join("payload.dat"), b"short").unwrap();
        assert!(FileStore::new(dir.path(), 1001, info.clone(), true).is_err());
        // exact length
        fs::write(peer_dir.join("payload.dat"), file_bytes(10)).unwrap();
        let store = FileStore::new(dir.path(), 1001, info, true).unwrap();
        assert!(store.is_complete());
    }

    #[test]
    fn test_seed_reads_pieces_from_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let info = storage_info(10, 4);
        let bytes = file_bytes(10);
        let peer_dir = dir.path().join("peer_1001");
        fs::create_dir_all(&peer_dir).unwrap();
        fs::write(peer_dir.join("payload.dat"), &bytes).unwrap();
        let store = FileStore::new(dir.path(), 1001, info, true).unwrap();

        assert_eq!(*store.read_piece(0).unwrap(), bytes[0..4]);
        assert_eq!(*store.read_piece(1).unwrap(), bytes[4..8]);
        // the last piece is the 2-byte remainder
        assert_eq!(*store.read_piece(2).unwrap(), bytes[8..10]);
        // and again, now out of the cache
        assert_eq!(*store.read_piece(2).unwrap(), bytes[8..10]);
        assert!(store.read_piece(3).is_err());
    }

    #[test]
    fn test_leech_stages_and_assembles() {
        let dir = tempfile::tempdir().unwrap();
        let info = storage_info(10, 4);
        let bytes = file_bytes(10);
        let store = FileStore::new(dir.path(), 1002, info, false).unwrap();
        assert!(!store.is_complete());

        store.write_piece(1, &bytes[4..8]).unwrap();
        store.write_piece(0, &bytes[0..4]).unwrap();
        // a duplicate write is accepted and changes nothing
        store.write_piece(0, &bytes[0..4]).unwrap();
        // a piece of the wrong length is refused
        assert!(store.write_piece(2, &bytes[4..8]).is_err());
        store.write_piece(2, &bytes[8..10]).unwrap();

        assert_eq!(*store.read_piece(1).unwrap(), bytes[4..8]);

        store.assemble().unwrap();
        assert!(store.is_complete());
        let assembled = fs::read(dir.path().join("peer_1002/payload.dat")).unwrap();
        assert_eq!(assembled, bytes);
        // the staging area is gone, reads now come from the file
        assert!(!dir.path().join("peer_1002/temp_pieces").exists());
        assert_eq!(*store.read_piece(2).unwrap(), bytes[8..10]);
    }
}
