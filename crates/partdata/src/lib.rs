//! Part files.
//!
//! A [`PartData`] tracks one in-progress download: which byte ranges are
//! complete, verified or corrupt, which chunks exist for each registered
//! hash set, how available each chunk is across known sources, and which
//! regions are currently locked by writers. Disk writes are buffered and
//! flushed positionally; hashing and disk allocation are *requested* by the
//! part file and executed elsewhere (a worker pool in the daemon, direct
//! injection in tests), with outcomes fed back through explicit methods.
//!
//! Nothing here blocks: the type is single-threaded state plus short
//! positional file I/O on flush, per the engine's concurrency model.

mod hash;
mod part;
mod store;

pub use hash::{
    ed2k_file_hash, ed2k_part_hashes, HashJob, HashJobKind, HashOutcome, HashSetRef, Hasher,
    ED2K_PARTSIZE,
};
pub use part::{
    run_alloc_job, AllocRequest, LockedRange, PartData, RunState, UsedRange, WriteOutcome,
};
pub use store::{load_dat, DatError};

use rangelist::Range;
use thiserror::Error;

/// Write buffer flush threshold.
pub const BUF_SIZE_LIMIT: usize = 512 * 1024;

/// 16-byte hash digest.
pub type Hash16 = [u8; 16];

/// Events emitted by a part file, drained by its owner.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PartEvent {
    /// Data entered the write buffer.
    DataAdded,
    /// The write buffer was flushed to disk.
    DataFlushed,
    /// The download was paused.
    Paused,
    /// The download was stopped.
    Stopped,
    /// The download was resumed.
    Resumed,
    /// The final rehash is running.
    Verifying,
    /// All data present and verified; the file moved to its destination.
    Completed,
    /// The download was canceled and its files deleted.
    Canceled,
    /// A region failed verification.
    Corruption(Range),
    /// A chunk passed verification.
    Verified {
        /// Chunk size of the hash set that verified.
        chunk_size: u64,
        /// Chunk index within that set.
        index: u32,
    },
    /// Disk allocation failed; the download auto-paused.
    AllocFailed,
    /// Disk allocation finished.
    AllocDone,
}

/// Errors from part-file operations.
#[derive(Debug, Error)]
pub enum PartError {
    /// Write outside the boundaries of the held lock.
    #[error("write outside locked range")]
    OutsideLock,
    /// Write into a region that is already complete or locked.
    #[error("write overlaps complete or locked data")]
    Overlap,
    /// The download is paused or stopped.
    #[error("part file is not running")]
    NotRunning,
    /// Zero-sized files cannot accept data.
    #[error("part file has zero size")]
    ZeroSize,
    /// A source-mask update did not match the chunk count.
    #[error("chunk mask has {got} bits, expected {expected}")]
    BadMask {
        /// Bits supplied by the caller.
        got: usize,
        /// Bits the chunk map requires.
        expected: usize,
    },
    /// Source counters would underflow.
    #[error("source count underflow")]
    SourceUnderflow,
    /// Disk I/O failed.
    #[error("part file I/O: {0}")]
    Io(#[from] std::io::Error),
}
