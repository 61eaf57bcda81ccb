//! The part file: range bookkeeping, chunk maps, locking and buffering.

use std::collections::{BTreeMap, VecDeque};
use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use rangelist::{Range, RangeList};
use tracing::{debug, info, trace, warn};

use crate::hash::{HashJob, HashJobKind, HashOutcome, HashSetRef, ED2K_PARTSIZE};
use crate::{PartError, PartEvent, BUF_SIZE_LIMIT};

/// Run state persisted in the sidecar.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RunState {
    /// Accepting writes.
    Running,
    /// Temporarily paused; sources are kept.
    Paused,
    /// Stopped; sources are dropped by the owner.
    Stopped,
}

#[derive(Clone, Debug)]
struct Chunk {
    range: Range,
    hash: Option<crate::Hash16>,
    avail: u32,
    use_cnt: u32,
    partial: bool,
    complete: bool,
    verified: bool,
}

/// A range handed to a writer, pinning its chunk's use count until
/// released with [`PartData::release_range`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UsedRange {
    chunk: Option<(u64, usize)>,
    range: Range,
}

impl UsedRange {
    /// The byte range covered.
    #[must_use]
    pub const fn range(&self) -> Range {
        self.range
    }
}

/// A sub-range locked for writing; release with [`PartData::unlock`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LockedRange {
    chunk: Option<(u64, usize)>,
    range: Range,
}

impl LockedRange {
    /// The locked byte range.
    #[must_use]
    pub const fn range(&self) -> Range {
        self.range
    }
}

/// Result of a locked write.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct WriteOutcome {
    /// A chunk transitioned to complete because of this write.
    pub chunk_completed: bool,
}

/// A pending background disk allocation.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AllocRequest {
    /// Temp file to grow.
    pub path: PathBuf,
    /// Target size in bytes.
    pub size: u64,
}

/// One in-progress download. See the crate docs for the model.
pub struct PartData {
    id: u64,
    size: u64,
    location: PathBuf,
    destination: PathBuf,
    complete: RangeList,
    verified: RangeList,
    corrupt: RangeList,
    dont_download: RangeList,
    locked: RangeList,
    buffer: BTreeMap<u64, Vec<u8>>,
    to_flush: usize,
    chunk_maps: BTreeMap<u64, Vec<Chunk>>,
    part_status: BTreeMap<u64, Vec<bool>>,
    hash_sets: Vec<HashSetRef>,
    source_cnt: u32,
    full_source_cnt: u32,
    paused: bool,
    stopped: bool,
    auto_paused: bool,
    completed: bool,
    pending_hashes: u32,
    full_job: bool,
    alloc_pending: bool,
    alloc_request: Option<AllocRequest>,
    hash_jobs: Vec<HashJob>,
    deferred_jobs: Vec<HashJob>,
    events: VecDeque<PartEvent>,
}

impl PartData {
    /// Creates a fresh download of `size` bytes, creating the (empty) temp
    /// file at `location`.
    pub fn create(
        id: u64,
        size: u64,
        location: PathBuf,
        destination: PathBuf,
    ) -> Result<Self, PartError> {
        std::fs::File::create(&location)?;
        info!(target: "partdata", id, size, temp = %location.display(), "new part file");
        Ok(Self::raw(id, size, location, destination))
    }

    pub(crate) fn raw(id: u64, size: u64, location: PathBuf, destination: PathBuf) -> Self {
        Self {
            id,
            size,
            location,
            destination,
            complete: RangeList::new(),
            verified: RangeList::new(),
            corrupt: RangeList::new(),
            dont_download: RangeList::new(),
            locked: RangeList::new(),
            buffer: BTreeMap::new(),
            to_flush: 0,
            chunk_maps: BTreeMap::new(),
            part_status: BTreeMap::new(),
            hash_sets: Vec::new(),
            source_cnt: 0,
            full_source_cnt: 0,
            paused: false,
            stopped: false,
            auto_paused: false,
            completed: false,
            pending_hashes: 0,
            full_job: false,
            alloc_pending: false,
            alloc_request: None,
            hash_jobs: Vec::new(),
            deferred_jobs: Vec::new(),
            events: VecDeque::new(),
        }
    }

    pub(crate) fn restore_ranges(&mut self, complete: RangeList, verified: RangeList) {
        self.complete = complete;
        self.verified = verified;
    }

    pub(crate) fn restore_state(&mut self, state: RunState) {
        match state {
            RunState::Running => {}
            RunState::Paused => self.paused = true,
            RunState::Stopped => self.stopped = true,
        }
    }

    /// Identifier assigned by the owning registry.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Total file size.
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    /// Temp-file path.
    #[must_use]
    pub fn location(&self) -> &Path {
        &self.location
    }

    /// Final destination path.
    #[must_use]
    pub fn destination(&self) -> &Path {
        &self.destination
    }

    /// File name component of the destination.
    #[must_use]
    pub fn name(&self) -> String {
        self.destination
            .file_name()
            .map_or_else(String::new, |n| n.to_string_lossy().into_owned())
    }

    /// Changes the destination path.
    pub fn set_destination(&mut self, dest: PathBuf) {
        self.destination = dest;
    }

    /// Bytes known complete.
    #[must_use]
    pub fn completed_bytes(&self) -> u64 {
        self.complete.total_length()
    }

    /// Registered hash sets.
    #[must_use]
    pub fn hash_sets(&self) -> &[HashSetRef] {
        &self.hash_sets
    }

    /// Number of known sources.
    #[must_use]
    pub const fn source_count(&self) -> u32 {
        self.source_cnt
    }

    /// Number of known full sources.
    #[must_use]
    pub const fn full_source_count(&self) -> u32 {
        self.full_source_cnt
    }

    /// Completed range list (for persistence).
    #[must_use]
    pub const fn complete_ranges(&self) -> &RangeList {
        &self.complete
    }

    /// Verified range list (for persistence).
    #[must_use]
    pub const fn verified_ranges(&self) -> &RangeList {
        &self.verified
    }

    /// Corrupt range list.
    #[must_use]
    pub const fn corrupt_ranges(&self) -> &RangeList {
        &self.corrupt
    }

    /// Currently locked ranges.
    #[must_use]
    pub const fn locked_ranges(&self) -> &RangeList {
        &self.locked
    }

    /// Bytes sitting in the write buffer.
    #[must_use]
    pub const fn buffered_bytes(&self) -> usize {
        self.to_flush
    }

    /// Run state for persistence and reporting.
    #[must_use]
    pub const fn run_state(&self) -> RunState {
        if self.paused {
            RunState::Paused
        } else if self.stopped {
            RunState::Stopped
        } else {
            RunState::Running
        }
    }

    /// Returns true when writes are accepted.
    #[must_use]
    pub const fn is_running(&self) -> bool {
        !self.paused && !self.stopped && !self.completed
    }

    /// Returns true when the disk-full handler paused this download.
    #[must_use]
    pub const fn is_auto_paused(&self) -> bool {
        self.auto_paused
    }

    /// Returns true when the final verification finished and the file
    /// moved to its destination.
    #[must_use]
    pub const fn is_completed(&self) -> bool {
        self.completed
    }

    /// Returns true when every byte is in `complete`.
    #[must_use]
    pub fn is_file_complete(&self) -> bool {
        self.size > 0 && self.complete.contains_full(&Range::new(0, self.size - 1))
    }

    /// Returns true when `r` lies fully inside the complete set.
    #[must_use]
    pub fn is_range_complete(&self, r: &Range) -> bool {
        self.complete.contains_full(r)
    }

    /// Drains queued events.
    pub fn poll_events(&mut self) -> Vec<PartEvent> {
        self.events.drain(..).collect()
    }

    /// Takes queued hash jobs for execution on the worker pool.
    pub fn take_hash_jobs(&mut self) -> Vec<HashJob> {
        std::mem::take(&mut self.hash_jobs)
    }

    /// Takes the pending allocation request, if one was just raised.
    pub fn take_alloc_request(&mut self) -> Option<AllocRequest> {
        self.alloc_request.take()
    }

    // ---- chunk maps -----------------------------------------------------

    /// Number of chunks of `chunk_size` the file divides into.
    #[must_use]
    pub const fn chunk_count(&self, chunk_size: u64) -> usize {
        (self.size / chunk_size) as usize + (self.size % chunk_size != 0) as usize
    }

    fn ensure_chunk_map(&mut self, chunk_size: u64) {
        if self.chunk_maps.contains_key(&chunk_size) {
            return;
        }
        trace!(target: "partdata", id = self.id, chunk_size, "adding chunk map");
        let count = self.chunk_count(chunk_size);
        let mut chunks = Vec::with_capacity(count);
        let mut status = Vec::with_capacity(count);
        for i in 0..count {
            let begin = i as u64 * chunk_size;
            let end = (begin + chunk_size - 1).min(self.size - 1);
            let range = Range::new(begin, end);
            let complete = self.complete.contains_full(&range);
            let verified = self.verified.contains_full(&range);
            chunks.push(Chunk {
                range,
                hash: None,
                avail: 0,
                use_cnt: 0,
                partial: self.complete.contains(&range) && !complete,
                complete,
                verified,
            });
            status.push(complete);
        }
        self.chunk_maps.insert(chunk_size, chunks);
        self.part_status.insert(chunk_size, status);
    }

    /// Registers a reference hash set, creating its chunk map on demand.
    /// Chunks already complete but unverified get verification scheduled.
    pub fn add_hash_set(&mut self, hs: HashSetRef) -> Result<(), PartError> {
        if self.size == 0 {
            return Err(PartError::ZeroSize);
        }
        let expected = hs.expected_count(self.size);
        if hs.chunk_hashes.len() != expected {
            return Err(PartError::BadMask {
                got: hs.chunk_hashes.len(),
                expected,
            });
        }
        debug!(
            target: "partdata",
            id = self.id,
            chunk_size = hs.chunk_size,
            chunks = hs.chunk_hashes.len(),
            "adding hash set"
        );
        self.ensure_chunk_map(hs.chunk_size);
        let count = self.chunk_count(hs.chunk_size);
        let mut to_verify = Vec::new();
        {
            let chunks = self
                .chunk_maps
                .get_mut(&hs.chunk_size)
                .expect("map just ensured");
            // the padded tail digest (if any) has no chunk behind it
            for (i, chunk) in chunks.iter_mut().take(count).enumerate() {
                chunk.hash = Some(hs.chunk_hashes[i]);
                if chunk.complete && !chunk.verified {
                    to_verify.push((hs.chunk_size, i));
                }
            }
        }
        self.hash_sets.retain(|s| s.chunk_size != hs.chunk_size);
        self.hash_sets.push(hs);
        for (cs, idx) in to_verify {
            self.schedule_chunk_verify(cs, idx, true);
        }
        Ok(())
    }

    /// Re-verifies every complete chunk that has a hash, e.g. after the
    /// temp file's modification date no longer matches the sidecar.
    pub fn rehash_completed(&mut self) {
        let mut jobs = Vec::new();
        for (cs, chunks) in &self.chunk_maps {
            for (i, c) in chunks.iter().enumerate() {
                if c.hash.is_some() && c.complete {
                    jobs.push((*cs, i));
                }
            }
        }
        for (cs, idx) in jobs {
            self.schedule_chunk_verify(cs, idx, false);
        }
    }

    fn mask_len_matches(&self, chunk_size: u64, got: usize) -> Result<(), PartError> {
        let expected = self.chunk_count(chunk_size);
        // the ed2k hash-set convention grows an extra (empty) tail entry
        // for exact multiples; tolerate masks that carry it
        let padded = expected
            + usize::from(chunk_size == ED2K_PARTSIZE && self.size % chunk_size == 0);
        if got == expected || got == padded {
            Ok(())
        } else {
            Err(PartError::BadMask { got, expected })
        }
    }

    /// Accounts a new source offering the chunks in `mask` (empty mask =
    /// full source).
    pub fn add_source_mask(&mut self, chunk_size: u64, mask: &[bool]) -> Result<(), PartError> {
        if mask.is_empty() {
            // an empty mask means the source has the whole file
            self.add_full_source(chunk_size);
            return Ok(());
        }
        self.mask_len_matches(chunk_size, mask.len())?;
        self.source_cnt += 1;
        self.ensure_chunk_map(chunk_size);
        let chunks = self.chunk_maps.get_mut(&chunk_size).expect("ensured");
        for (c, bit) in chunks.iter_mut().zip(mask) {
            c.avail += u32::from(*bit);
        }
        Ok(())
    }

    /// Accounts a source that has the whole file.
    pub fn add_full_source(&mut self, chunk_size: u64) {
        self.ensure_chunk_map(chunk_size);
        let chunks = self.chunk_maps.get_mut(&chunk_size).expect("ensured");
        for c in chunks.iter_mut() {
            c.avail += 1;
        }
        self.source_cnt += 1;
        self.full_source_cnt += 1;
    }

    /// Removes a source previously added with the same mask.
    pub fn del_source_mask(&mut self, chunk_size: u64, mask: &[bool]) -> Result<(), PartError> {
        if self.source_cnt == 0 {
            return Err(PartError::SourceUnderflow);
        }
        if mask.is_empty() {
            return self.del_full_source(chunk_size);
        }
        self.mask_len_matches(chunk_size, mask.len())?;
        let chunks = self
            .chunk_maps
            .get_mut(&chunk_size)
            .ok_or(PartError::SourceUnderflow)?;
        for (c, bit) in chunks.iter_mut().zip(mask) {
            if *bit {
                if c.avail == 0 {
                    return Err(PartError::SourceUnderflow);
                }
                c.avail -= 1;
            }
        }
        self.source_cnt -= 1;
        Ok(())
    }

    /// Removes a full source.
    pub fn del_full_source(&mut self, chunk_size: u64) -> Result<(), PartError> {
        if self.source_cnt == 0 || self.full_source_cnt == 0 {
            return Err(PartError::SourceUnderflow);
        }
        let chunks = self
            .chunk_maps
            .get_mut(&chunk_size)
            .ok_or(PartError::SourceUnderflow)?;
        for c in chunks.iter_mut() {
            if c.avail == 0 {
                return Err(PartError::SourceUnderflow);
            }
            c.avail -= 1;
        }
        self.source_cnt -= 1;
        self.full_source_cnt -= 1;
        Ok(())
    }

    /// The presentation partmap for `chunk_size`: one bit per chunk, set
    /// when the chunk verified (or, with no hash registered, when it is
    /// complete).
    #[must_use]
    pub fn part_map(&self, chunk_size: u64) -> Vec<bool> {
        if let Some(status) = self.part_status.get(&chunk_size) {
            return status.clone();
        }
        (0..self.chunk_count(chunk_size))
            .map(|i| {
                let begin = i as u64 * chunk_size;
                let end = (begin + chunk_size - 1).min(self.size - 1);
                self.complete.contains_full(&Range::new(begin, end))
            })
            .collect()
    }

    // ---- range selection and locking ------------------------------------

    fn next_gap(&self, want: u64) -> Option<Range> {
        let mut at = 0u64;
        loop {
            if at >= self.size {
                return None;
            }
            let probe = Range::new(at, at);
            if let Some(r) = self.complete.get_contains(&probe) {
                at = r.end().checked_add(1)?;
                continue;
            }
            if let Some(r) = self.locked.get_contains(&probe) {
                at = r.end().checked_add(1)?;
                continue;
            }
            if let Some(r) = self.dont_download.get_contains(&probe) {
                at = r.end().checked_add(1)?;
                continue;
            }
            let end = at.saturating_add(want - 1).min(self.size - 1);
            return Some(Range::new(at, end));
        }
    }

    fn can_lock(&self, r: &Range) -> bool {
        self.first_lockable(r).is_some()
    }

    /// First offset within `r` not covered by complete, locked or
    /// dont-download data.
    fn first_lockable(&self, r: &Range) -> Option<u64> {
        let mut at = r.begin();
        while at <= r.end() {
            let probe = Range::new(at, at);
            let next = self
                .complete
                .get_contains(&probe)
                .or_else(|| self.locked.get_contains(&probe))
                .or_else(|| self.dont_download.get_contains(&probe));
            match next {
                Some(cover) => at = cover.end().checked_add(1)?,
                None => return Some(at),
            }
        }
        None
    }

    fn mask_allows(mask: &[bool], mask_chunk_size: u64, r: &Range) -> bool {
        let first = (r.begin() / mask_chunk_size) as usize;
        let last = (r.end() / mask_chunk_size) as usize;
        (first..=last).all(|i| mask.get(i).copied().unwrap_or(false))
    }

    /// Picks the best range to download next.
    ///
    /// Candidate chunks are ordered: incomplete with availability first,
    /// higher availability, then lower use count, then lower offset. With
    /// no chunk maps, the first writable gap up to `want` bytes is used.
    /// `mask` (indexed in chunks of `want` bytes) excludes chunks the peer
    /// does not have. Returns `None` when nothing is lockable.
    pub fn get_range(&mut self, want: u64, mask: Option<&[bool]>) -> Option<UsedRange> {
        if want == 0 || self.size == 0 {
            return None;
        }
        if self.chunk_maps.is_empty() {
            let range = self.next_gap(want)?;
            return Some(UsedRange { chunk: None, range });
        }

        let mut order: Vec<(u32, u32, u64, u64, usize)> = Vec::new();
        for (cs, chunks) in &self.chunk_maps {
            for (i, c) in chunks.iter().enumerate() {
                if c.complete || c.avail == 0 {
                    continue;
                }
                order.push((c.avail, c.use_cnt, c.range.begin(), *cs, i));
            }
        }
        // higher availability, then lower use count, then lower offset
        order.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)).then(a.2.cmp(&b.2)));

        for (_, _, _, cs, idx) in order {
            let range = self.chunk_maps[&cs][idx].range;
            if let Some(mask) = mask {
                if !Self::mask_allows(mask, want, &range) {
                    continue;
                }
            }
            if !self.can_lock(&range) {
                continue;
            }
            let chunk = &mut self
                .chunk_maps
                .get_mut(&cs)
                .expect("map exists")[idx];
            chunk.use_cnt += 1;
            trace!(
                target: "partdata",
                id = self.id,
                begin = range.begin(),
                end = range.end(),
                avail = chunk.avail,
                "selected chunk"
            );
            return Some(UsedRange {
                chunk: Some((cs, idx)),
                range,
            });
        }
        None
    }

    /// Releases a range obtained from [`PartData::get_range`].
    pub fn release_range(&mut self, ur: &UsedRange) {
        if let Some((cs, idx)) = ur.chunk {
            if let Some(chunk) = self.chunk_maps.get_mut(&cs).and_then(|v| v.get_mut(idx)) {
                chunk.use_cnt = chunk.use_cnt.saturating_sub(1);
            }
        }
    }

    /// Locks the next writable sub-range of `ur`, up to `max_len` bytes.
    /// The locked region is skipped by other writers until unlocked.
    pub fn get_lock(&mut self, ur: &UsedRange, max_len: u64) -> Option<LockedRange> {
        if max_len == 0 {
            return None;
        }
        let start = self.first_lockable(&ur.range())?;
        let mut cand = Range::new(
            start,
            start.saturating_add(max_len - 1).min(ur.range().end()),
        );
        for list in [&self.complete, &self.locked, &self.dont_download] {
            if let Some(cover) = list.get_contains(&cand) {
                if cover.begin() > cand.begin() {
                    cand.set_end(cover.begin() - 1);
                }
            }
        }
        trace!(
            target: "partdata",
            id = self.id,
            begin = cand.begin(),
            end = cand.end(),
            "locking range"
        );
        self.locked.merge(cand);
        Some(LockedRange {
            chunk: ur.chunk,
            range: cand,
        })
    }

    /// Releases a locked range.
    pub fn unlock(&mut self, lr: &LockedRange) {
        trace!(
            target: "partdata",
            id = self.id,
            begin = lr.range.begin(),
            end = lr.range.end(),
            "unlocking range"
        );
        self.locked.erase(lr.range);
    }

    // ---- writing --------------------------------------------------------

    /// Writes data through a lock. `begin` and the data must lie within the
    /// locked region.
    pub fn write_locked(
        &mut self,
        lr: &LockedRange,
        begin: u64,
        data: &[u8],
    ) -> Result<WriteOutcome, PartError> {
        if data.is_empty() {
            return Ok(WriteOutcome::default());
        }
        let end = begin + data.len() as u64 - 1;
        if begin < lr.range.begin() || end > lr.range.end() {
            return Err(PartError::OutsideLock);
        }
        // the lock keeps complete data out of this region, so the write
        // cannot overlap either list
        self.locked.erase(Range::new(begin, end));
        self.do_write(begin, data)
    }

    /// Writes data without holding a lock, for callers that manage their
    /// own ranges. The target region must be neither locked nor complete.
    pub fn write(&mut self, begin: u64, data: &[u8]) -> Result<WriteOutcome, PartError> {
        if data.is_empty() {
            return Ok(WriteOutcome::default());
        }
        let range = Range::new(begin, begin + data.len() as u64 - 1);
        if self.locked.contains(&range) || self.complete.contains(&range) {
            return Err(PartError::Overlap);
        }
        self.do_write(begin, data)
    }

    fn do_write(&mut self, begin: u64, data: &[u8]) -> Result<WriteOutcome, PartError> {
        if self.size == 0 {
            return Err(PartError::ZeroSize);
        }
        if !self.is_running() {
            return Err(PartError::NotRunning);
        }
        let range = Range::new(begin, begin + data.len() as u64 - 1);
        if self.complete.contains(&range) {
            return Err(PartError::Overlap);
        }
        trace!(
            target: "partdata",
            id = self.id,
            begin,
            len = data.len(),
            "buffering write"
        );
        self.buffer.insert(begin, data.to_vec());
        self.to_flush += data.len();
        self.complete.merge(range);
        self.dont_download.erase(range);
        let outcome = self.update_chunks(range);
        self.events.push_back(PartEvent::DataAdded);
        if self.to_flush >= BUF_SIZE_LIMIT {
            self.save();
        }
        if self.is_file_complete() {
            self.try_complete();
        }
        Ok(outcome)
    }

    /// Re-derives partial/complete flags for every chunk touching `range`,
    /// scheduling verification for chunks that just completed.
    fn update_chunks(&mut self, range: Range) -> WriteOutcome {
        let mut outcome = WriteOutcome::default();
        let mut to_verify = Vec::new();
        let sizes: Vec<u64> = self.chunk_maps.keys().copied().collect();
        for cs in sizes {
            let first = (range.begin() / cs) as usize;
            let last = (range.end() / cs) as usize;
            let chunks = self.chunk_maps.get_mut(&cs).expect("listed key");
            let status = self.part_status.get_mut(&cs).expect("created with map");
            for idx in first..=last.min(chunks.len().saturating_sub(1)) {
                let chunk_range = chunks[idx].range;
                let covered = self.complete.contains_full(&chunk_range);
                let touched = self.complete.contains(&chunk_range);
                let c = &mut chunks[idx];
                let was_complete = c.complete;
                c.complete = covered;
                c.partial = touched && !covered;
                if c.hash.is_none() {
                    // without a reference digest, complete is as good as
                    // verified for presentation
                    status[idx] = covered;
                }
                if covered && !was_complete && !c.verified {
                    outcome.chunk_completed = true;
                    if c.hash.is_some() {
                        to_verify.push((cs, idx));
                    }
                }
            }
        }
        for (cs, idx) in to_verify {
            self.schedule_chunk_verify(cs, idx, true);
        }
        outcome
    }

    /// Marks a region as never-download (e.g. user-deselected).
    pub fn dont_download(&mut self, range: Range) {
        self.dont_download.merge(range);
    }

    /// Re-enables downloading of a region.
    pub fn do_download(&mut self, range: Range) {
        self.dont_download.erase(range);
    }

    // ---- hashing --------------------------------------------------------

    fn schedule_chunk_verify(&mut self, cs: u64, idx: usize, flush_first: bool) {
        let Some(chunk) = self.chunk_maps.get(&cs).and_then(|v| v.get(idx)) else {
            return;
        };
        let Some(expected) = chunk.hash else {
            // a final whole-file rehash covers hashless chunks
            return;
        };
        let (begin, end) = (chunk.range.begin(), chunk.range.end());
        debug!(target: "partdata", id = self.id, cs, idx, "chunk complete, verifying");
        if flush_first {
            self.save();
        }
        let job = HashJob {
            part: self.id,
            path: self.location.clone(),
            kind: HashJobKind::Chunk {
                chunk_size: cs,
                index: idx as u32,
                begin,
                end,
                expected,
            },
        };
        self.pending_hashes += 1;
        if self.alloc_pending {
            self.deferred_jobs.push(job);
        } else {
            self.hash_jobs.push(job);
        }
    }

    /// Applies a hash-job outcome.
    pub fn on_hash_outcome(&mut self, outcome: &HashOutcome) {
        match outcome {
            HashOutcome::ChunkVerified {
                chunk_size, index, ..
            } => {
                self.pending_hashes = self.pending_hashes.saturating_sub(1);
                self.set_chunk_verified(*chunk_size, *index as usize);
                self.try_complete();
            }
            HashOutcome::ChunkFailed {
                chunk_size, index, ..
            } => {
                self.pending_hashes = self.pending_hashes.saturating_sub(1);
                self.set_chunk_corrupt(*chunk_size, *index as usize);
            }
            HashOutcome::FullDone { hashes, .. } => {
                if !self.full_job {
                    return; // canceled by an interim corruption
                }
                self.full_job = false;
                self.cross_check(hashes);
                if self.is_file_complete() {
                    self.finish_complete();
                }
            }
            HashOutcome::Fatal { .. } => {
                warn!(target: "partdata", id = self.id, "fatal hash error");
                if self.full_job {
                    self.full_job = false;
                } else {
                    self.pending_hashes = self.pending_hashes.saturating_sub(1);
                }
            }
        }
    }

    fn set_chunk_verified(&mut self, cs: u64, idx: usize) {
        let Some(chunk) = self.chunk_maps.get_mut(&cs).and_then(|v| v.get_mut(idx)) else {
            return;
        };
        chunk.verified = true;
        chunk.complete = true;
        chunk.partial = false;
        let range = chunk.range;
        self.verified.merge(range);
        self.complete.merge(range);
        self.corrupt.erase(range);
        if let Some(status) = self.part_status.get_mut(&cs) {
            if let Some(bit) = status.get_mut(idx) {
                *bit = true;
            }
        }
        debug!(target: "partdata", id = self.id, idx, "chunk verified");
        self.events.push_back(PartEvent::Verified {
            chunk_size: cs,
            index: idx as u32,
        });
    }

    fn set_chunk_corrupt(&mut self, cs: u64, idx: usize) {
        let Some(chunk) = self.chunk_maps.get_mut(&cs).and_then(|v| v.get_mut(idx)) else {
            return;
        };
        chunk.verified = false;
        chunk.complete = false;
        chunk.partial = false;
        let range = chunk.range;
        if let Some(status) = self.part_status.get_mut(&cs) {
            if let Some(bit) = status.get_mut(idx) {
                *bit = false;
            }
        }
        warn!(
            target: "partdata",
            id = self.id,
            idx,
            begin = range.begin(),
            end = range.end(),
            "chunk is corrupt"
        );
        self.corruption(range);
        // a queued full rehash would race the re-download
        self.full_job = false;
    }

    /// Records corruption of `range`: drops it from complete/verified and
    /// surfaces the event so sources get re-asked.
    pub fn corruption(&mut self, range: Range) {
        self.complete.erase(range);
        self.verified.erase(range);
        self.corrupt.merge(range);
        self.events.push_back(PartEvent::Corruption(range));
        // chunk flags for other chunk sizes overlapping the range
        self.refresh_chunks_overlapping(range);
    }

    fn refresh_chunks_overlapping(&mut self, range: Range) {
        let sizes: Vec<u64> = self.chunk_maps.keys().copied().collect();
        for cs in sizes {
            let first = (range.begin() / cs) as usize;
            let last = (range.end() / cs) as usize;
            let chunks = self.chunk_maps.get_mut(&cs).expect("listed key");
            let status = self.part_status.get_mut(&cs).expect("created with map");
            for idx in first..=last.min(chunks.len().saturating_sub(1)) {
                let chunk_range = chunks[idx].range;
                let covered = self.complete.contains_full(&chunk_range);
                let touched = self.complete.contains(&chunk_range);
                let verified = self.verified.contains_full(&chunk_range);
                let c = &mut chunks[idx];
                c.complete = covered;
                c.partial = touched && !covered;
                c.verified = verified;
                status[idx] = verified || (c.hash.is_none() && covered);
            }
        }
    }

    /// Cross-checks a generated hash set against the stored references;
    /// per-chunk mismatches mark only those ranges corrupt.
    fn cross_check(&mut self, generated: &HashSetRef) {
        let reference: Vec<HashSetRef> = self
            .hash_sets
            .iter()
            .filter(|r| r.chunk_size == generated.chunk_size)
            .cloned()
            .collect();
        if reference.is_empty() {
            // nothing to check against (hashless download)
            if !self.verified.contains_full(&Range::new(0, self.size - 1)) {
                self.verified = self.complete.clone();
            }
            return;
        }
        for orig in reference {
            if orig.chunk_hashes.len() != generated.chunk_hashes.len() {
                debug!(target: "partdata", id = self.id, "hash set count mismatch, skipping");
                continue;
            }
            if orig.chunk_hashes.is_empty() {
                let matches = orig.file_hash.is_some() && orig.file_hash == generated.file_hash;
                if matches {
                    self.set_range_verified(Range::new(0, self.size - 1));
                } else {
                    self.corruption(Range::new(0, self.size - 1));
                }
                continue;
            }
            for (i, (gen_hash, ref_hash)) in generated
                .chunk_hashes
                .iter()
                .zip(&orig.chunk_hashes)
                .enumerate()
            {
                let begin = i as u64 * orig.chunk_size;
                if begin >= self.size {
                    break; // padded tail digest, nothing behind it
                }
                let end = (begin + orig.chunk_size - 1).min(self.size - 1);
                let range = Range::new(begin, end);
                if gen_hash == ref_hash {
                    self.set_range_verified(range);
                } else {
                    warn!(
                        target: "partdata",
                        id = self.id,
                        chunk = i,
                        "final rehash: chunk digest mismatch"
                    );
                    self.corruption(range);
                }
            }
        }
    }

    fn set_range_verified(&mut self, range: Range) {
        self.verified.merge(range);
        self.complete.merge(range);
        self.corrupt.erase(range);
        self.refresh_chunks_overlapping(range);
    }

    /// Starts the final whole-file rehash once everything is complete and
    /// no chunk verification is in flight.
    pub fn try_complete(&mut self) {
        if self.completed
            || self.full_job
            || self.pending_hashes > 0
            || self.alloc_pending
            || !self.is_file_complete()
        {
            return;
        }
        self.save();
        if self.alloc_pending || self.to_flush > 0 {
            return; // retried once the flush goes through
        }
        info!(target: "partdata", id = self.id, "file complete, starting final rehash");
        self.full_job = true;
        self.hash_jobs.push(HashJob {
            part: self.id,
            path: self.location.clone(),
            kind: HashJobKind::Full { size: self.size },
        });
        self.events.push_back(PartEvent::Verifying);
    }

    fn finish_complete(&mut self) {
        if self.completed {
            return;
        }
        self.completed = true;
        if let Some(parent) = self.destination.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        match std::fs::rename(&self.location, &self.destination) {
            Ok(()) => {
                info!(
                    target: "partdata",
                    id = self.id,
                    dest = %self.destination.display(),
                    "download complete"
                );
                let _ = std::fs::remove_file(self.dat_path());
                let _ = std::fs::remove_file(self.bak_path());
            }
            Err(e) => {
                warn!(target: "partdata", id = self.id, error = %e, "moving completed file");
            }
        }
        self.events.push_back(PartEvent::Completed);
    }

    // ---- flushing and allocation ----------------------------------------

    fn file_size(&self) -> u64 {
        std::fs::metadata(&self.location).map_or(0, |m| m.len())
    }

    /// Path of the sidecar file.
    #[must_use]
    pub fn dat_path(&self) -> PathBuf {
        let mut p = self.location.clone().into_os_string();
        p.push(".dat");
        PathBuf::from(p)
    }

    fn bak_path(&self) -> PathBuf {
        let mut p = self.dat_path().into_os_string();
        p.push(".bak");
        PathBuf::from(p)
    }

    fn flush_buffer(&mut self) -> Result<(), PartError> {
        if self.alloc_pending {
            return Ok(()); // flushed once allocation finishes
        }
        if self.to_flush > 0 && self.file_size() < self.size {
            self.request_alloc();
            return Ok(());
        }
        if self.buffer.is_empty() {
            return Ok(());
        }
        trace!(target: "partdata", id = self.id, bytes = self.to_flush, "flushing buffer");
        let mut file = OpenOptions::new().write(true).open(&self.location)?;
        for (offset, data) in &self.buffer {
            file.seek(SeekFrom::Start(*offset))?;
            file.write_all(data)?;
        }
        file.sync_data()?;
        self.buffer.clear();
        self.to_flush = 0;
        self.events.push_back(PartEvent::DataFlushed);
        Ok(())
    }

    fn request_alloc(&mut self) {
        if self.alloc_pending {
            return;
        }
        info!(target: "partdata", id = self.id, size = self.size, "allocating disk space");
        self.alloc_pending = true;
        self.alloc_request = Some(AllocRequest {
            path: self.location.clone(),
            size: self.size,
        });
    }

    /// Requests allocation if the temp file is shorter than the download.
    /// Called after restoring from the sidecar.
    pub fn check_allocation(&mut self) {
        if self.file_size() < self.size {
            self.request_alloc();
        }
    }

    /// Applies the allocation outcome from the worker.
    pub fn on_alloc_done(&mut self, ok: bool) {
        self.alloc_pending = false;
        if ok {
            self.events.push_back(PartEvent::AllocDone);
            let deferred = std::mem::take(&mut self.deferred_jobs);
            self.hash_jobs.extend(deferred);
            self.save();
            self.try_complete();
        } else {
            warn!(target: "partdata", id = self.id, "disk allocation failed, auto-pausing");
            self.events.push_back(PartEvent::AllocFailed);
            self.pause();
            self.auto_paused = true;
        }
    }

    /// Flushes the buffer and writes the sidecar. I/O failures auto-pause
    /// the download instead of propagating; a later successful save
    /// auto-resumes it.
    pub fn save(&mut self) {
        let result = self
            .flush_buffer()
            .and_then(|()| crate::store::save_dat(self));
        match result {
            Ok(()) => {
                if self.auto_paused && !self.alloc_pending {
                    info!(target: "partdata", id = self.id, "auto-resuming after successful save");
                    self.resume();
                }
            }
            Err(e) => {
                warn!(target: "partdata", id = self.id, error = %e, "saving part file");
                if self.is_running() {
                    self.pause();
                    self.auto_paused = true;
                }
            }
        }
    }

    // ---- run state -------------------------------------------------------

    /// Pauses the download.
    pub fn pause(&mut self) {
        if !self.paused {
            self.paused = true;
            self.stopped = false;
            self.events.push_back(PartEvent::Paused);
        }
    }

    /// Stops the download.
    pub fn stop(&mut self) {
        if !self.stopped {
            self.stopped = true;
            self.paused = false;
            self.events.push_back(PartEvent::Stopped);
        }
    }

    /// Resumes a paused or stopped download.
    pub fn resume(&mut self) {
        if self.paused || self.stopped {
            self.paused = false;
            self.stopped = false;
            self.auto_paused = false;
            self.events.push_back(PartEvent::Resumed);
        }
    }

    /// Cancels the download, deleting the temp file and sidecars.
    pub fn cancel(&mut self) {
        for path in [
            self.location.clone(),
            self.dat_path(),
            self.bak_path(),
        ] {
            if path.exists() {
                if let Err(e) = std::fs::remove_file(&path) {
                    debug!(target: "partdata", id = self.id, error = %e, "deleting file");
                }
            }
        }
        self.events.push_back(PartEvent::Canceled);
    }
}

/// Grows the temp file to its full size: seek to the last byte, write one
/// byte, fsync. Runs on the worker pool.
#[must_use]
pub fn run_alloc_job(req: &AllocRequest) -> bool {
    let grow = || -> std::io::Result<bool> {
        let mut file = OpenOptions::new().write(true).open(&req.path)?;
        if file.metadata()?.len() >= req.size {
            return Ok(true);
        }
        file.seek(SeekFrom::Start(req.size - 1))?;
        file.write_all(&[1u8])?;
        file.sync_all()?;
        Ok(file.metadata()?.len() == req.size)
    };
    match grow() {
        Ok(ok) => ok,
        Err(e) => {
            warn!(target: "partdata", path = %req.path.display(), error = %e, "allocation failed");
            false
        }
    }
}
