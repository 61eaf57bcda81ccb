//! Download registry.
//!
//! A [`Download`] couples a part file with its ed2k hash and the source
//! endpoints we have seen for it (fed back out through source exchange).
//! The [`DownloadList`] indexes downloads by id and hash.

use std::net::SocketAddrV4;
use std::path::Path;

use partdata::{PartData, PartError};
use rustc_hash::FxHashMap;
use tracing::info;

use crate::Hash16;

/// How many source endpoints we remember per download for source
/// exchange; answers are capped well below the packet limit.
const MAX_REMEMBERED_SOURCES: usize = 50;

/// Source-exchange netiquette: rare files may be re-asked per peer every
/// 40 minutes, common files every 2 hours.
const SRC_EXCH_RARE_MS: u64 = 40 * 60 * 1000;
const SRC_EXCH_COMMON_MS: u64 = 2 * 60 * 60 * 1000;
const RARE_SOURCE_LIMIT: u32 = 10;

/// One endpoint another peer told us about.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KnownSource {
    /// The peer's address.
    pub addr: SocketAddrV4,
    /// The server it sits on, when known.
    pub server: Option<SocketAddrV4>,
}

/// One in-progress download.
pub struct Download {
    hash: Hash16,
    /// The underlying part file.
    pub part: PartData,
    known_sources: Vec<KnownSource>,
    last_src_exch: u64,
}

impl Download {
    /// The file's ed2k hash.
    #[must_use]
    pub const fn hash(&self) -> Hash16 {
        self.hash
    }

    /// Registry id (same as the part-file id).
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.part.id()
    }

    /// Endpoints known for source exchange.
    #[must_use]
    pub fn known_sources(&self) -> &[KnownSource] {
        &self.known_sources
    }

    /// Remembers an endpoint, bounded.
    pub fn remember_source(&mut self, addr: SocketAddrV4, server: Option<SocketAddrV4>) {
        if self.known_sources.iter().any(|s| s.addr == addr) {
            return;
        }
        if self.known_sources.len() >= MAX_REMEMBERED_SOURCES {
            self.known_sources.remove(0);
        }
        self.known_sources.push(KnownSource { addr, server });
    }

    /// Forgets an endpoint (dead source).
    pub fn forget_source(&mut self, addr: SocketAddrV4) {
        self.known_sources.retain(|s| s.addr != addr);
    }

    /// Whether a source-exchange request to a peer is allowed now, per the
    /// rare/common re-ask intervals.
    #[must_use]
    pub fn source_req_allowed(&self, now: u64) -> bool {
        let interval = if self.part.source_count() < RARE_SOURCE_LIMIT {
            SRC_EXCH_RARE_MS
        } else {
            SRC_EXCH_COMMON_MS
        };
        now >= self.last_src_exch.saturating_add(interval)
    }

    /// Stamps the last source-exchange request time.
    pub fn set_last_src_exch(&mut self, now: u64) {
        self.last_src_exch = now;
    }
}

/// All active downloads.
#[derive(Default)]
pub struct DownloadList {
    next_id: u64,
    by_id: FxHashMap<u64, Download>,
    by_hash: FxHashMap<Hash16, u64>,
}

impl DownloadList {
    /// Creates an empty list.
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_id: 1,
            ..Self::default()
        }
    }

    /// Starts a new download, creating the part file in `temp_dir`.
    pub fn create(
        &mut self,
        hash: Hash16,
        size: u64,
        temp_dir: &Path,
        destination: &Path,
    ) -> Result<u64, PartError> {
        let id = self.next_id;
        self.next_id += 1;
        let temp = temp_dir.join(format!("{id:03}.part"));
        let part = PartData::create(id, size, temp, destination.to_path_buf())?;
        info!(
            target: "ed2k",
            id,
            size,
            dest = %destination.display(),
            "download started"
        );
        self.by_hash.insert(hash, id);
        self.by_id.insert(
            id,
            Download {
                hash,
                part,
                known_sources: Vec::new(),
                last_src_exch: 0,
            },
        );
        Ok(id)
    }

    /// Adopts a part file restored from its sidecar.
    pub fn adopt(&mut self, hash: Hash16, part: PartData) -> u64 {
        let id = part.id().max(self.next_id);
        self.next_id = id + 1;
        self.by_hash.insert(hash, id);
        self.by_id.insert(
            id,
            Download {
                hash,
                part,
                known_sources: Vec::new(),
                last_src_exch: 0,
            },
        );
        id
    }

    /// Number of downloads.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    /// Returns true when no downloads exist.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Returns true when `id` is a live download.
    #[must_use]
    pub fn valid(&self, id: u64) -> bool {
        self.by_id.contains_key(&id)
    }

    /// Download id for a hash.
    #[must_use]
    pub fn find(&self, hash: &Hash16) -> Option<u64> {
        self.by_hash.get(hash).copied()
    }

    /// Borrows a download.
    #[must_use]
    pub fn get(&self, id: u64) -> Option<&Download> {
        self.by_id.get(&id)
    }

    /// Mutably borrows a download.
    pub fn get_mut(&mut self, id: u64) -> Option<&mut Download> {
        self.by_id.get_mut(&id)
    }

    /// Removes a download, returning it.
    pub fn remove(&mut self, id: u64) -> Option<Download> {
        let d = self.by_id.remove(&id)?;
        self.by_hash.remove(&d.hash);
        Some(d)
    }

    /// Iterates over all downloads.
    pub fn iter(&self) -> impl Iterator<Item = &Download> {
        self.by_id.values()
    }

    /// Iterates mutably over all downloads.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Download> {
        self.by_id.values_mut()
    }

    /// Running download ids ordered by ascending known-source count, so
    /// the rarest files get queried first.
    #[must_use]
    pub fn ids_rarest_first(&self) -> Vec<u64> {
        let mut ids: Vec<(u32, u64)> = self
            .by_id
            .values()
            .filter(|d| d.part.is_running())
            .map(|d| (d.part.source_count(), d.id()))
            .collect();
        ids.sort_unstable();
        ids.into_iter().map(|(_, id)| id).collect()
    }
}
