//! ed2k hash sets and background hash jobs.
//!
//! The ed2k hash tree is MD4 over 9 500 KiB parts; the file hash is MD4 of
//! the concatenated part digests, except for single-part files where the
//! part digest *is* the file hash. Files whose size is an exact multiple of
//! the part size carry one extra digest for the empty tail — this
//! convention is a property of the hash set, not of the chunk map, so it is
//! carried as a flag here.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;

use crossbeam_channel::Sender;
use digest::Digest;
use md4::Md4;
use tracing::{debug, error};

use crate::Hash16;

/// ed2k part size: availability bitmaps and the hash tree both use it.
pub const ED2K_PARTSIZE: u64 = 9_728_000;

/// One reference hash set: per-chunk digests for a given chunk size.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HashSetRef {
    /// Chunk size the digests cover.
    pub chunk_size: u64,
    /// Whole-file digest, when known.
    pub file_hash: Option<Hash16>,
    /// Per-chunk digests, in file order.
    pub chunk_hashes: Vec<Hash16>,
    /// Whether a `size % chunk_size == 0` file carries one extra digest
    /// covering the empty tail (the ed2k convention).
    pub pad_tail_hash: bool,
}

impl HashSetRef {
    /// Creates an ed2k hash set (part-size chunks, padded tail digest).
    #[must_use]
    pub fn ed2k(file_hash: Option<Hash16>, chunk_hashes: Vec<Hash16>) -> Self {
        Self {
            chunk_size: ED2K_PARTSIZE,
            file_hash,
            chunk_hashes,
            pad_tail_hash: true,
        }
    }

    /// Number of chunk digests a file of `size` bytes must carry in this
    /// set.
    #[must_use]
    pub fn expected_count(&self, size: u64) -> usize {
        let full = (size / self.chunk_size) as usize;
        let rem = (size % self.chunk_size != 0) as usize;
        let pad = usize::from(self.pad_tail_hash && size > 0 && size % self.chunk_size == 0);
        full + rem + pad
    }
}

/// Computes the ed2k part digests of `data`.
#[must_use]
pub fn ed2k_part_hashes(data: &[u8]) -> Vec<Hash16> {
    let mut hashes: Vec<Hash16> = data
        .chunks(ED2K_PARTSIZE as usize)
        .map(|part| Md4::digest(part).into())
        .collect();
    if data.is_empty() || data.len() as u64 % ED2K_PARTSIZE == 0 {
        // empty-tail digest for exact multiples (and the empty file)
        hashes.push(Md4::digest([]).into());
    }
    hashes
}

/// Folds part digests into the ed2k file hash.
#[must_use]
pub fn ed2k_file_hash(part_hashes: &[Hash16]) -> Hash16 {
    match part_hashes {
        [] => Md4::digest([]).into(),
        [single] => *single,
        many => {
            let mut md4 = Md4::new();
            for h in many {
                md4.update(h);
            }
            md4.finalize().into()
        }
    }
}

/// What a hash job should compute.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HashJobKind {
    /// Hash `range` of the file and compare against `expected`.
    Chunk {
        /// Chunk size of the owning hash set.
        chunk_size: u64,
        /// Chunk index within that set.
        index: u32,
        /// First byte of the chunk.
        begin: u64,
        /// Last byte of the chunk (inclusive).
        end: u64,
        /// Reference digest.
        expected: Hash16,
    },
    /// Hash the entire file and build a fresh ed2k hash set.
    Full {
        /// Expected file size; a mismatch is fatal.
        size: u64,
    },
}

/// A hashing work item. Jobs only carry the path and range: the part file
/// itself is never touched from a worker thread.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HashJob {
    /// Identifier of the part file that requested the job.
    pub part: u64,
    /// File to read.
    pub path: PathBuf,
    /// What to compute.
    pub kind: HashJobKind,
}

/// Result of a hash job, posted back into the main loop.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HashOutcome {
    /// The chunk digest matched.
    ChunkVerified {
        /// Requesting part file.
        part: u64,
        /// Chunk size of the owning hash set.
        chunk_size: u64,
        /// Chunk index within that set.
        index: u32,
    },
    /// The chunk digest did not match.
    ChunkFailed {
        /// Requesting part file.
        part: u64,
        /// Chunk size of the owning hash set.
        chunk_size: u64,
        /// Chunk index within that set.
        index: u32,
    },
    /// The whole file was hashed; digests are ready for cross-checking.
    FullDone {
        /// Requesting part file.
        part: u64,
        /// Generated ed2k hash set.
        hashes: HashSetRef,
        /// Size observed on disk.
        size: u64,
    },
    /// The file could not be read at all.
    Fatal {
        /// Requesting part file.
        part: u64,
    },
}

/// Executes [`HashJob`]s, posting [`HashOutcome`]s to a channel. The daemon
/// runs this on the worker pool; tests may call [`Hasher::run`] inline.
pub struct Hasher {
    tx: Sender<HashOutcome>,
}

impl Hasher {
    /// Creates a hasher posting outcomes to `tx`.
    #[must_use]
    pub const fn new(tx: Sender<HashOutcome>) -> Self {
        Self { tx }
    }

    /// Runs one job to completion.
    pub fn run(&self, job: &HashJob) {
        let outcome = Self::execute(job);
        let _ = self.tx.send(outcome);
    }

    fn execute(job: &HashJob) -> HashOutcome {
        match &job.kind {
            HashJobKind::Chunk {
                chunk_size,
                index,
                begin,
                end,
                expected,
            } => match hash_range(&job.path, *begin, *end) {
                Ok(digest) if digest == *expected => HashOutcome::ChunkVerified {
                    part: job.part,
                    chunk_size: *chunk_size,
                    index: *index,
                },
                Ok(_) => {
                    debug!(target: "partdata", part = job.part, index, "chunk hash mismatch");
                    HashOutcome::ChunkFailed {
                        part: job.part,
                        chunk_size: *chunk_size,
                        index: *index,
                    }
                }
                Err(e) => {
                    error!(target: "partdata", part = job.part, error = %e, "chunk hash I/O");
                    HashOutcome::Fatal { part: job.part }
                }
            },
            HashJobKind::Full { size } => match hash_full(&job.path) {
                Ok((hashes, observed)) => {
                    if observed != *size {
                        error!(
                            target: "partdata",
                            part = job.part,
                            expected = size,
                            observed,
                            "size mismatch during final rehash"
                        );
                        return HashOutcome::Fatal { part: job.part };
                    }
                    HashOutcome::FullDone {
                        part: job.part,
                        hashes,
                        size: observed,
                    }
                }
                Err(e) => {
                    error!(target: "partdata", part = job.part, error = %e, "full hash I/O");
                    HashOutcome::Fatal { part: job.part }
                }
            },
        }
    }
}

fn hash_range(path: &PathBuf, begin: u64, end: u64) -> std::io::Result<Hash16> {
    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(begin))?;
    let mut left = end - begin + 1;
    let mut md4 = Md4::new();
    let mut buf = vec![0u8; 256 * 1024];
    while left > 0 {
        let want = buf.len().min(left as usize);
        let n = file.read(&mut buf[..want])?;
        if n == 0 {
            return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof));
        }
        md4.update(&buf[..n]);
        left -= n as u64;
    }
    Ok(md4.finalize().into())
}

fn hash_full(path: &PathBuf) -> std::io::Result<(HashSetRef, u64)> {
    let mut file = File::open(path)?;
    let mut part_hashes = Vec::new();
    let mut size = 0u64;
    let mut buf = vec![0u8; 256 * 1024];
    'parts: loop {
        let mut md4 = Md4::new();
        let mut part_len = 0u64;
        while part_len < ED2K_PARTSIZE {
            let want = buf.len().min((ED2K_PARTSIZE - part_len) as usize);
            let n = file.read(&mut buf[..want])?;
            if n == 0 {
                if part_len > 0 {
                    part_hashes.push(md4.finalize().into());
                    size += part_len;
                }
                break 'parts;
            }
            md4.update(&buf[..n]);
            part_len += n as u64;
        }
        part_hashes.push(md4.finalize().into());
        size += part_len;
    }
    if size % ED2K_PARTSIZE == 0 {
        part_hashes.push(Md4::digest([]).into());
    }
    let file_hash = ed2k_file_hash(&part_hashes);
    Ok((
        HashSetRef::ed2k(Some(file_hash), part_hashes),
        size,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;
    use std::io::Write;

    fn md4_of(data: &[u8]) -> Hash16 {
        Md4::digest(data).into()
    }

    #[test]
    fn single_part_file_hash_is_the_part_hash() {
        let data = vec![0x5au8; 1000];
        let parts = ed2k_part_hashes(&data);
        assert_eq!(parts.len(), 1);
        assert_eq!(ed2k_file_hash(&parts), md4_of(&data));
    }

    #[test]
    fn exact_multiple_gets_empty_tail_digest() {
        let data = vec![1u8; ED2K_PARTSIZE as usize];
        let parts = ed2k_part_hashes(&data);
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[1], md4_of(&[]));
    }

    #[test]
    fn multi_part_file_hash_folds_part_digests() {
        let data = vec![7u8; ED2K_PARTSIZE as usize + 10];
        let parts = ed2k_part_hashes(&data);
        assert_eq!(parts.len(), 2);
        let mut md4 = Md4::new();
        md4.update(parts[0]);
        md4.update(parts[1]);
        let expected: Hash16 = md4.finalize().into();
        assert_eq!(ed2k_file_hash(&parts), expected);
    }

    #[test]
    fn expected_count_honours_tail_convention() {
        let ed2k = HashSetRef::ed2k(None, Vec::new());
        assert_eq!(ed2k.expected_count(1), 1);
        assert_eq!(ed2k.expected_count(ED2K_PARTSIZE - 1), 1);
        assert_eq!(ed2k.expected_count(ED2K_PARTSIZE), 2);
        assert_eq!(ed2k.expected_count(ED2K_PARTSIZE + 1), 2);

        let plain = HashSetRef {
            chunk_size: 1000,
            file_hash: None,
            chunk_hashes: Vec::new(),
            pad_tail_hash: false,
        };
        assert_eq!(plain.expected_count(1000), 1);
        assert_eq!(plain.expected_count(1001), 2);
    }

    #[test]
    fn chunk_job_verifies_matching_range() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chunk.part");
        std::fs::File::create(&path)
            .unwrap()
            .write_all(b"0123456789")
            .unwrap();

        let (tx, rx) = unbounded();
        let hasher = Hasher::new(tx);
        hasher.run(&HashJob {
            part: 7,
            path: path.clone(),
            kind: HashJobKind::Chunk {
                chunk_size: 5,
                index: 1,
                begin: 5,
                end: 9,
                expected: md4_of(b"56789"),
            },
        });
        assert_eq!(
            rx.recv().unwrap(),
            HashOutcome::ChunkVerified {
                part: 7,
                chunk_size: 5,
                index: 1
            }
        );

        hasher.run(&HashJob {
            part: 7,
            path,
            kind: HashJobKind::Chunk {
                chunk_size: 5,
                index: 0,
                begin: 0,
                end: 4,
                expected: md4_of(b"wrong"),
            },
        });
        assert_eq!(
            rx.recv().unwrap(),
            HashOutcome::ChunkFailed {
                part: 7,
                chunk_size: 5,
                index: 0
            }
        );
    }

    #[test]
    fn full_job_rebuilds_the_hash_set() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("full.part");
        let data = vec![0xabu8; 4096];
        std::fs::File::create(&path)
            .unwrap()
            .write_all(&data)
            .unwrap();

        let (tx, rx) = unbounded();
        Hasher::new(tx).run(&HashJob {
            part: 1,
            path,
            kind: HashJobKind::Full { size: 4096 },
        });
        match rx.recv().unwrap() {
            HashOutcome::FullDone { hashes, size, .. } => {
                assert_eq!(size, 4096);
                assert_eq!(hashes.chunk_hashes, ed2k_part_hashes(&data));
                assert_eq!(hashes.file_hash, Some(md4_of(&data)));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn full_job_size_mismatch_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.part");
        std::fs::File::create(&path)
            .unwrap()
            .write_all(b"abc")
            .unwrap();
        let (tx, rx) = unbounded();
        Hasher::new(tx).run(&HashJob {
            part: 2,
            path,
            kind: HashJobKind::Full { size: 100 },
        });
        assert_eq!(rx.recv().unwrap(), HashOutcome::Fatal { part: 2 });
    }

    #[test]
    fn missing_file_is_fatal() {
        let (tx, rx) = unbounded();
        Hasher::new(tx).run(&HashJob {
            part: 3,
            path: PathBuf::from("/nonexistent/file.part"),
            kind: HashJobKind::Full { size: 1 },
        });
        assert_eq!(rx.recv().unwrap(), HashOutcome::Fatal { part: 3 });
    }
}
