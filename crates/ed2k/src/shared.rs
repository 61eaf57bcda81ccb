//! Shared-file catalog.
//!
//! The full metadata database lives outside this engine; sessions only
//! need a hash-keyed view of what we serve: name, size, on-disk location,
//! the backing download for partial files, and the ed2k hash set for
//! `HashSet` answers.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;

use partdata::HashSetRef;
use rustc_hash::FxHashMap;

use crate::Hash16;

/// One file we serve.
#[derive(Clone, Debug)]
pub struct SharedFile {
    /// The file's ed2k hash.
    pub hash: Hash16,
    /// Published name.
    pub name: String,
    /// Size in bytes.
    pub size: u64,
    /// On-disk location (the temp file for partial downloads).
    pub path: PathBuf,
    /// Backing download id when the file is still partial.
    pub download: Option<u64>,
    /// The ed2k hash set, when known.
    pub hash_set: Option<HashSetRef>,
}

impl SharedFile {
    /// Returns true when the file is still being downloaded.
    #[must_use]
    pub const fn is_partial(&self) -> bool {
        self.download.is_some()
    }

    /// Reads `len` bytes at `begin` from the on-disk file.
    pub fn read_block(&self, begin: u64, len: usize) -> std::io::Result<Vec<u8>> {
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(begin))?;
        let mut buf = vec![0u8; len];
        file.read_exact(&mut buf)?;
        Ok(buf)
    }
}

/// Hash-keyed catalog of everything we serve.
#[derive(Default)]
pub struct SharedFiles {
    by_hash: FxHashMap<Hash16, SharedFile>,
}

impl SharedFiles {
    /// Creates an empty catalog.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a shared file.
    pub fn insert(&mut self, file: SharedFile) {
        self.by_hash.insert(file.hash, file);
    }

    /// Removes a file from the catalog.
    pub fn remove(&mut self, hash: &Hash16) -> Option<SharedFile> {
        self.by_hash.remove(hash)
    }

    /// Looks up a file by hash.
    #[must_use]
    pub fn find(&self, hash: &Hash16) -> Option<&SharedFile> {
        self.by_hash.get(hash)
    }

    /// Mutable lookup.
    pub fn find_mut(&mut self, hash: &Hash16) -> Option<&mut SharedFile> {
        self.by_hash.get_mut(hash)
    }

    /// Number of shared files.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_hash.len()
    }

    /// Returns true when nothing is shared.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_hash.is_empty()
    }

    /// Iterates over the catalog.
    pub fn iter(&self) -> impl Iterator<Item = &SharedFile> {
        self.by_hash.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn read_block_returns_exact_slice() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shared.bin");
        File::create(&path)
            .unwrap()
            .write_all(b"0123456789")
            .unwrap();
        let file = SharedFile {
            hash: [1; 16],
            name: "shared.bin".into(),
            size: 10,
            path,
            download: None,
            hash_set: None,
        };
        assert_eq!(file.read_block(3, 4).unwrap(), b"3456");
        assert!(file.read_block(8, 5).is_err()); // past EOF
    }

    #[test]
    fn catalog_finds_by_hash() {
        let mut files = SharedFiles::new();
        files.insert(SharedFile {
            hash: [7; 16],
            name: "a".into(),
            size: 1,
            path: PathBuf::from("/nope"),
            download: Some(3),
            hash_set: None,
        });
        assert!(files.find(&[7; 16]).unwrap().is_partial());
        assert!(files.find(&[8; 16]).is_none());
        assert_eq!(files.len(), 1);
        files.remove(&[7; 16]);
        assert!(files.is_empty());
    }
}
