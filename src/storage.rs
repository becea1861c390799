//! The storage collaborator seam.
//!
//! The engine does not persist anything itself: pieces are read and written
//! through the [`Storage`] trait, and resume-state bookkeeping is the
//! storage owner's job (see [`crate::piece::PieceState`] for the
//! serialization format). [`MemoryStorage`] is a complete in-memory
//! implementation used by the tests and useful for embedders that keep the
//! payload in RAM.

use std::{io, sync::Mutex};

use sha1::{Digest, Sha1};

use crate::{Bitfield, PieceIndex};

/// Piece geometry of one torrent.
#[derive(Clone, Copy, Debug)]
pub struct StorageInfo {
    /// The number of pieces in the torrent.
    pub piece_count: usize,
    /// The nominal piece length; every piece but possibly the last has it.
    pub piece_len: u32,
    /// The length of the last piece.
    pub last_piece_len: u32,
    /// The total download size in bytes.
    pub download_len: u64,
}

impl StorageInfo {
    /// Derives the geometry from the piece size and the total length.
    ///
    /// # Panics
    ///
    /// Panics if the piece length is zero or the total length is zero.
    pub fn new(piece_len: u32, download_len: u64) -> Self {
        assert!(piece_len > 0, "piece length must be greater than zero");
        assert!(download_len > 0, "download length must be greater than zero");

        let piece_count = download_len.div_ceil(u64::from(piece_len)) as usize;
        let rem = (download_len % u64::from(piece_len)) as u32;
        let last_piece_len = if rem == 0 { piece_len } else { rem };

        Self {
            piece_count,
            piece_len,
            last_piece_len,
            download_len,
        }
    }

    /// Returns the length of the given piece.
    ///
    /// # Panics
    ///
    /// Panics if the index is out of range.
    pub fn piece_len(&self, index: PieceIndex) -> u32 {
        assert!(
            index < self.piece_count,
            "piece index {} out of range (max: {})",
            index,
            self.piece_count - 1
        );
        if index == self.piece_count - 1 {
            self.last_piece_len
        } else {
            self.piece_len
        }
    }

    /// Byte offset of the piece within the whole download.
    pub fn piece_offset(&self, index: PieceIndex) -> u64 {
        index as u64 * u64::from(self.piece_len)
    }
}

/// Random access to the torrent payload.
///
/// Read failures during outbound piece service close the offending
/// connection; write failures propagate as I/O errors out of the
/// coordinator's piece assembly.
pub trait Storage: Send + Sync {
    /// Reads `len` bytes starting at `offset` within the given piece.
    fn read(&self, piece: PieceIndex, offset: u32, len: u32) -> io::Result<Vec<u8>>;

    /// Writes a block at `offset` within the given piece.
    fn write(&self, piece: PieceIndex, offset: u32, data: &[u8]) -> io::Result<()>;

    /// The pieces already present when the storage was opened. Bit `i` set
    /// means piece `i` is fully present and verified.
    fn bitfield(&self) -> Bitfield;

    /// Hex digest identifying the stored content, for logging and resume
    /// file naming.
    fn hex_hash(&self) -> String;
}

/// Payload kept entirely in memory.
pub struct MemoryStorage {
    info: StorageInfo,
    data: Mutex<Vec<u8>>,
    have: Bitfield,
}

impl MemoryStorage {
    /// Creates empty storage for a download in progress.
    pub fn new(info: StorageInfo) -> Self {
        Self {
            data: Mutex::new(vec![0; info.download_len as usize]),
            have: Bitfield::repeat(false, info.piece_count),
            info,
        }
    }

    /// Creates storage already holding the complete payload, as a seed
    /// would have it.
    ///
    /// # Panics
    ///
    /// Panics if the payload length disagrees with the geometry.
    pub fn seeded(info: StorageInfo, data: Vec<u8>) -> Self {
        assert_eq!(
            data.len() as u64,
            info.download_len,
            "payload length must match the storage geometry"
        );
        Self {
            data: Mutex::new(data),
            have: Bitfield::repeat(true, info.piece_count),
            info,
        }
    }

    /// A copy of the current payload bytes.
    pub fn data(&self) -> Vec<u8> {
        self.data.lock().expect("storage lock poisoned").clone()
    }

    fn range(&self, piece: PieceIndex, offset: u32, len: u32) -> io::Result<(usize, usize)> {
        if piece >= self.info.piece_count {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "piece index out of range",
            ));
        }
        let start = self.info.piece_offset(piece) + u64::from(offset);
        let end = start + u64::from(len);
        if u64::from(offset) + u64::from(len) > u64::from(self.info.piece_len(piece)) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "byte range exceeds piece",
            ));
        }
        Ok((start as usize, end as usize))
    }
}

impl Storage for MemoryStorage {
    fn read(&self, piece: PieceIndex, offset: u32, len: u32) -> io::Result<Vec<u8>> {
        let (start, end) = self.range(piece, offset, len)?;
        let data = self.data.lock().expect("storage lock poisoned");
        Ok(data[start..end].to_vec())
    }

    fn write(&self, piece: PieceIndex, offset: u32, block: &[u8]) -> io::Result<()> {
        let (start, end) = self.range(piece, offset, block.len() as u32)?;
        let mut data = self.data.lock().expect("storage lock poisoned");
        data[start..end].copy_from_slice(block);
        Ok(())
    }

    fn bitfield(&self) -> Bitfield {
        self.have.clone()
    }

    fn hex_hash(&self) -> String {
        let data = self.data.lock().expect("storage lock poisoned");
        let mut hasher = Sha1::new();
        hasher.update(&data[..]);
        hex::encode(hasher.finalize())
    }
}
