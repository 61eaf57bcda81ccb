//! End-to-end part-file scenarios: sequential hashless downloads,
//! chunk verification and corruption recovery, range selection policy,
//! and the universal range-set invariants.

use crossbeam_channel::unbounded;
use partdata::{
    ed2k_part_hashes, run_alloc_job, HashOutcome, HashSetRef, Hasher, PartData, PartEvent,
    ED2K_PARTSIZE,
};
use rangelist::Range;
use std::path::PathBuf;

struct Fixture {
    part: PartData,
    _dir: tempfile::TempDir,
}

fn fixture(size: u64) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let part = PartData::create(
        1,
        size,
        dir.path().join("file.part"),
        dir.path().join("incoming").join("file.bin"),
    )
    .unwrap();
    Fixture { part, _dir: dir }
}

/// Runs any pending allocation to completion.
fn settle_alloc(part: &mut PartData) {
    if let Some(req) = part.take_alloc_request() {
        assert!(run_alloc_job(&req));
        part.on_alloc_done(true);
    }
}

fn assert_invariants(part: &PartData) {
    let complete = part.complete_ranges();
    let verified = part.verified_ranges();
    let corrupt = part.corrupt_ranges();
    for v in verified.iter() {
        assert!(
            complete.contains_full(v),
            "verified range {v:?} not inside complete"
        );
        assert!(!corrupt.contains(v), "range {v:?} both verified and corrupt");
    }
    for l in part.locked_ranges().iter() {
        assert!(
            !complete.contains(l),
            "locked range {l:?} overlaps complete data"
        );
    }
    assert!(part.completed_bytes() <= part.size());
}

#[test]
fn solo_download_without_hashes_completes_and_moves() {
    let size = 10_000_000u64;
    let mut fx = fixture(size);
    let block = vec![0x42u8; 10_000];

    let mut offset = 0u64;
    while offset < size {
        fx.part.write(offset, &block).unwrap();
        settle_alloc(&mut fx.part);
        offset += 10_000;
    }

    assert!(fx.part.is_file_complete());
    assert_eq!(
        fx.part.complete_ranges().get_contains(&Range::new(0, 0)),
        Some(Range::new(0, size - 1))
    );
    assert_invariants(&fx.part);

    // no hash sets were registered, so no chunk map exists...
    assert!(fx.part.part_map(ED2K_PARTSIZE).iter().all(|b| *b));

    // ...and the full-file rehash was scheduled on the last write
    let jobs = fx.part.take_hash_jobs();
    assert_eq!(jobs.len(), 1, "expected exactly the final rehash job");

    // run it for real: the flushed temp file holds the data
    let (tx, rx) = unbounded();
    Hasher::new(tx).run(&jobs[0]);
    let outcome = rx.recv().unwrap();
    fx.part.on_hash_outcome(&outcome);

    let events = fx.part.poll_events();
    assert!(events.contains(&PartEvent::Completed));
    assert!(fx.part.is_completed());
    assert!(fx.part.destination().exists(), "file moved to destination");
    assert!(!fx.part.location().exists(), "temp file renamed away");
}

#[test]
fn chunk_corruption_recovers_on_second_attempt() {
    // one full ed2k part plus one byte
    let size = ED2K_PARTSIZE + 1;
    let mut fx = fixture(size);
    let good = vec![0x5au8; ED2K_PARTSIZE as usize];
    let hashes = vec![ed2k_part_hashes(&good)[0], ed2k_part_hashes(&[0x99])[0]];
    fx.part
        .add_hash_set(HashSetRef {
            chunk_size: ED2K_PARTSIZE,
            file_hash: None,
            chunk_hashes: hashes,
            pad_tail_hash: true,
        })
        .unwrap();

    fx.part.write(0, &good).unwrap();
    settle_alloc(&mut fx.part);
    let jobs = fx.part.take_hash_jobs();
    assert_eq!(jobs.len(), 1, "chunk completion schedules verification");

    // pretend the data was bad
    fx.part.on_hash_outcome(&HashOutcome::ChunkFailed {
        part: 1,
        chunk_size: ED2K_PARTSIZE,
        index: 0,
    });
    assert!(fx.part.complete_ranges().is_empty(), "complete reset");
    assert!(
        fx.part
            .corrupt_ranges()
            .contains_full(&Range::new(0, ED2K_PARTSIZE - 1)),
        "corrupt covers the failed chunk"
    );
    assert!(!fx.part.part_map(ED2K_PARTSIZE)[0]);
    assert_invariants(&fx.part);

    // second attempt with (nominally) correct data
    fx.part.write(0, &good).unwrap();
    settle_alloc(&mut fx.part);
    let jobs = fx.part.take_hash_jobs();
    assert_eq!(jobs.len(), 1);
    fx.part.on_hash_outcome(&HashOutcome::ChunkVerified {
        part: 1,
        chunk_size: ED2K_PARTSIZE,
        index: 0,
    });

    assert!(fx
        .part
        .verified_ranges()
        .contains_full(&Range::new(0, ED2K_PARTSIZE - 1)));
    assert!(fx.part.part_map(ED2K_PARTSIZE)[0]);
    assert!(fx
        .part
        .poll_events()
        .iter()
        .any(|e| matches!(e, PartEvent::Verified { index: 0, .. })));
    assert_invariants(&fx.part);
}

#[test]
fn exact_multiple_of_chunk_size_accepts_padded_hash_set() {
    let size = 2 * ED2K_PARTSIZE;
    let mut fx = fixture(size);
    // the ed2k convention: one extra digest for the empty tail
    let hashes = vec![[1u8; 16], [2u8; 16], [3u8; 16]];
    fx.part
        .add_hash_set(HashSetRef {
            chunk_size: ED2K_PARTSIZE,
            file_hash: None,
            chunk_hashes: hashes,
            pad_tail_hash: true,
        })
        .unwrap();
    // the chunk map itself never grows the phantom chunk
    assert_eq!(fx.part.chunk_count(ED2K_PARTSIZE), 2);
    assert_eq!(fx.part.part_map(ED2K_PARTSIZE).len(), 2);

    // availability masks may carry the extra bit; it is tolerated
    fx.part
        .add_source_mask(ED2K_PARTSIZE, &[true, false, false])
        .unwrap();
    fx.part.add_source_mask(ED2K_PARTSIZE, &[true, true]).unwrap();
    assert_eq!(fx.part.source_count(), 2);
}

#[test]
fn wrong_hash_count_is_rejected() {
    let mut fx = fixture(ED2K_PARTSIZE + 1);
    let err = fx.part.add_hash_set(HashSetRef {
        chunk_size: ED2K_PARTSIZE,
        file_hash: None,
        chunk_hashes: vec![[0u8; 16]; 5],
        pad_tail_hash: true,
    });
    assert!(err.is_err());
}

#[test]
fn range_selection_prefers_available_unused_chunks() {
    let size = 4 * ED2K_PARTSIZE;
    let mut fx = fixture(size);
    fx.part
        .add_hash_set(HashSetRef {
            chunk_size: ED2K_PARTSIZE,
            file_hash: None,
            chunk_hashes: vec![[0u8; 16]; 4],
            pad_tail_hash: true,
        })
        .unwrap();

    // chunk 3 is the most available; 0 and 2 tie below; 1 has no source
    fx.part
        .add_source_mask(ED2K_PARTSIZE, &[true, false, true, true])
        .unwrap();
    fx.part
        .add_source_mask(ED2K_PARTSIZE, &[false, false, false, true])
        .unwrap();

    // highest availability wins even at a higher offset
    let first = fx.part.get_range(ED2K_PARTSIZE, None).unwrap();
    assert_eq!(first.range().begin(), 3 * ED2K_PARTSIZE);

    // it keeps winning while its availability lead holds
    let second = fx.part.get_range(ED2K_PARTSIZE, None).unwrap();
    assert_eq!(second.range().begin(), 3 * ED2K_PARTSIZE);

    // the second source leaves: chunk 3 drops to the common availability
    fx.part
        .del_source_mask(ED2K_PARTSIZE, &[false, false, false, true])
        .unwrap();
    // among the availability-1 chunks the lower offset wins first...
    let third = fx.part.get_range(ED2K_PARTSIZE, None).unwrap();
    assert_eq!(third.range().begin(), 0);
    // ...then the untouched equal-availability chunk
    let fourth = fx.part.get_range(ED2K_PARTSIZE, None).unwrap();
    assert_eq!(fourth.range().begin(), 2 * ED2K_PARTSIZE);

    for used in [&first, &second, &third, &fourth] {
        fx.part.release_range(used);
    }
}

#[test]
fn range_selection_respects_availability_mask() {
    let size = 2 * ED2K_PARTSIZE;
    let mut fx = fixture(size);
    fx.part
        .add_hash_set(HashSetRef {
            chunk_size: ED2K_PARTSIZE,
            file_hash: None,
            chunk_hashes: vec![[0u8; 16]; 3],
            pad_tail_hash: true,
        })
        .unwrap();
    fx.part.add_full_source(ED2K_PARTSIZE);

    // the peer only has chunk 1
    let mask = vec![false, true];
    let picked = fx.part.get_range(ED2K_PARTSIZE, Some(&mask)).unwrap();
    assert_eq!(picked.range().begin(), ED2K_PARTSIZE);
}

#[test]
fn locks_are_disjoint_and_skip_complete_data() {
    let mut fx = fixture(1_000_000);
    // no chunk maps: unanchored gap selection
    let used = fx.part.get_range(500_000, None).unwrap();
    let lock_a = fx.part.get_lock(&used, 100_000).unwrap();
    let lock_b = fx.part.get_lock(&used, 100_000).unwrap();
    assert!(
        !lock_a.range().overlaps(&lock_b.range()),
        "locks {:?} and {:?} overlap",
        lock_a.range(),
        lock_b.range()
    );
    assert_eq!(lock_b.range().begin(), lock_a.range().end() + 1);
    assert_invariants(&fx.part);

    // write through lock A, release B: the next lock may not touch the
    // written region
    let data = vec![1u8; lock_a.range().length() as usize];
    fx.part
        .write_locked(&lock_a, lock_a.range().begin(), &data)
        .unwrap();
    settle_alloc(&mut fx.part);
    fx.part.unlock(&lock_b);

    let lock_c = fx.part.get_lock(&used, 200_000).unwrap();
    assert!(lock_c.range().begin() > lock_a.range().end());
    assert_invariants(&fx.part);
}

#[test]
fn writes_outside_lock_are_rejected() {
    let mut fx = fixture(100_000);
    let used = fx.part.get_range(50_000, None).unwrap();
    let lock = fx.part.get_lock(&used, 10_000).unwrap();
    let out = fx.part.write_locked(&lock, lock.range().end() + 1, &[0u8; 10]);
    assert!(out.is_err());
}

#[test]
fn writes_rejected_when_paused_or_stopped() {
    let mut fx = fixture(100_000);
    fx.part.pause();
    assert!(fx.part.write(0, &[1, 2, 3]).is_err());
    fx.part.resume();
    fx.part.stop();
    assert!(fx.part.write(0, &[1, 2, 3]).is_err());
    fx.part.resume();
    assert!(fx.part.write(0, &[1, 2, 3]).is_ok());
}

#[test]
fn dont_download_regions_are_skipped() {
    let mut fx = fixture(100_000);
    fx.part.dont_download(Range::new(0, 49_999));
    let used = fx.part.get_range(100_000, None).unwrap();
    assert_eq!(used.range().begin(), 50_000);
    fx.part.do_download(Range::new(0, 49_999));
    let again = fx.part.get_range(10_000, None).unwrap();
    assert_eq!(again.range().begin(), 0);
}

#[test]
fn write_at_last_byte_triggers_allocation_first() {
    let size = 1_000_000u64;
    let mut fx = fixture(size);
    fx.part.write(size - 1, &[0xee]).unwrap();
    // flushing is deferred behind the allocation
    fx.part.save();
    let req = fx.part.take_alloc_request().expect("allocation requested");
    assert_eq!(req.size, size);

    // allocation failure must not corrupt the complete set
    fx.part.on_alloc_done(false);
    assert!(fx.part.is_auto_paused());
    assert!(fx
        .part
        .complete_ranges()
        .contains_full(&Range::new(size - 1, size - 1)));
    assert_invariants(&fx.part);

    // a later successful allocation resumes the download
    assert!(run_alloc_job(&partdata::AllocRequest {
        path: fx.part.location().to_path_buf(),
        size,
    }));
    fx.part.on_alloc_done(true);
    assert!(!fx.part.is_auto_paused());
    assert!(fx.part.is_running());
}

#[test]
fn source_mask_underflow_is_an_error() {
    let mut fx = fixture(ED2K_PARTSIZE * 2);
    assert!(fx
        .part
        .del_source_mask(ED2K_PARTSIZE, &[true, true])
        .is_err());
    fx.part
        .add_source_mask(ED2K_PARTSIZE, &[true, false])
        .unwrap();
    fx.part
        .del_source_mask(ED2K_PARTSIZE, &[true, false])
        .unwrap();
    assert_eq!(fx.part.source_count(), 0);
}

#[test]
fn cancel_deletes_files() {
    let mut fx = fixture(10_000);
    fx.part.write(0, &[1u8; 100]).unwrap();
    fx.part.save();
    let location = PathBuf::from(fx.part.location());
    let dat = fx.part.dat_path();
    assert!(location.exists());
    assert!(dat.exists());
    fx.part.cancel();
    assert!(!location.exists());
    assert!(!dat.exists());
    assert!(fx.part.poll_events().contains(&PartEvent::Canceled));
}
