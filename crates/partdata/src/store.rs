//! The `.dat` sidecar.
//!
//! Layout: `u8 OP_PARTDATA | u16 len | u8 VER | u64 size | u16 tagcount |
//! tags | OP_METADATA | u16 len | metadata blob`. Tags are
//! `u8 opcode | u16 len | payload`; range-list payloads nest an
//! `OP_RANGELIST | u16 len` header around the serialized list. The
//! metadata blob stores the reference hash sets and the temp file's
//! modification time.
//!
//! Writes go to `.dat_` and rename over the previous file, keeping a
//! `.bak` copy, so a full disk can never corrupt both generations.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use rangelist::RangeList;
use thiserror::Error;
use tracing::{debug, warn};

use crate::part::{PartData, RunState};
use crate::{HashSetRef, PartError};

const OP_PARTDATA: u8 = 0x50;
const OP_PD_VER: u8 = 0x01;
const OP_PD_DESTINATION: u8 = 0x01;
const OP_PD_COMPLETED: u8 = 0x02;
const OP_PD_VERIFIED: u8 = 0x03;
const OP_PD_STATE: u8 = 0x04;
const OP_RANGELIST: u8 = 0x0a;
const OP_METADATA: u8 = 0x11;

const STATE_RUNNING: u8 = 0;
const STATE_PAUSED: u8 = 1;
const STATE_STOPPED: u8 = 2;

/// Errors raised while loading a sidecar.
#[derive(Debug, Error)]
pub enum DatError {
    /// The file does not start with the part-data opcode.
    #[error("not a part-data sidecar")]
    BadMagic,
    /// The file ended prematurely or a length field is inconsistent.
    #[error("truncated sidecar")]
    Truncated,
    /// A stored range list failed to parse.
    #[error("malformed range list")]
    BadRanges,
    /// Underlying I/O failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

fn put_u16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put_u64(out: &mut Vec<u8>, v: u64) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put_tag(out: &mut Vec<u8>, opcode: u8, payload: &[u8]) {
    out.push(opcode);
    put_u16(out, payload.len() as u16);
    out.extend_from_slice(payload);
}

fn rangelist_payload(list: &RangeList) -> Vec<u8> {
    let blob = list.to_bytes();
    let mut payload = Vec::with_capacity(blob.len() + 3);
    payload.push(OP_RANGELIST);
    put_u16(&mut payload, blob.len() as u16);
    payload.extend_from_slice(&blob);
    payload
}

fn metadata_blob(part: &PartData) -> Vec<u8> {
    let mut out = Vec::new();
    put_u64(&mut out, file_mod_secs(part.location()));
    let sets = part.hash_sets();
    put_u16(&mut out, sets.len() as u16);
    for hs in sets {
        put_u64(&mut out, hs.chunk_size);
        out.push(u8::from(hs.pad_tail_hash));
        match hs.file_hash {
            Some(h) => {
                out.push(1);
                out.extend_from_slice(&h);
            }
            None => out.push(0),
        }
        put_u16(&mut out, hs.chunk_hashes.len() as u16);
        for h in &hs.chunk_hashes {
            out.extend_from_slice(h);
        }
    }
    out
}

fn file_mod_secs(path: &Path) -> u64 {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map_or(0, |d| d.as_secs())
}

/// Serializes `part` into sidecar bytes.
#[must_use]
pub(crate) fn encode_dat(part: &PartData) -> Vec<u8> {
    let mut body = Vec::new();
    body.push(OP_PD_VER);
    put_u64(&mut body, part.size());
    put_u16(&mut body, 4); // tagcount

    put_tag(
        &mut body,
        OP_PD_DESTINATION,
        part.destination().to_string_lossy().as_bytes(),
    );
    put_tag(
        &mut body,
        OP_PD_COMPLETED,
        &rangelist_payload(part.complete_ranges()),
    );
    put_tag(
        &mut body,
        OP_PD_VERIFIED,
        &rangelist_payload(part.verified_ranges()),
    );
    let state = match part.run_state() {
        RunState::Running => STATE_RUNNING,
        RunState::Paused => STATE_PAUSED,
        RunState::Stopped => STATE_STOPPED,
    };
    put_tag(&mut body, OP_PD_STATE, &[state]);

    let mut out = Vec::with_capacity(body.len() + 8);
    out.push(OP_PARTDATA);
    put_u16(&mut out, body.len().min(u16::MAX as usize) as u16);
    out.extend_from_slice(&body);

    let md = metadata_blob(part);
    out.push(OP_METADATA);
    put_u16(&mut out, md.len().min(u16::MAX as usize) as u16);
    out.extend_from_slice(&md);
    out
}

/// Writes the sidecar through a temp file, keeping the previous version as
/// `.bak`.
pub(crate) fn save_dat(part: &PartData) -> Result<(), PartError> {
    let dat = part.dat_path();
    let tmp = with_suffix(&dat, "_");
    let bak = with_suffix(&dat, ".bak");

    if dat.exists() {
        let bak_tmp = with_suffix(&bak, "_");
        if bak_tmp.exists() {
            fs::remove_file(&bak_tmp)?;
        }
        fs::copy(&dat, &bak_tmp)?;
        if fs::metadata(&dat)?.len() != fs::metadata(&bak_tmp)?.len() {
            let _ = fs::remove_file(&bak_tmp);
            return Err(PartError::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "no space left for sidecar backup",
            )));
        }
        if bak.exists() {
            fs::remove_file(&bak)?;
        }
        fs::rename(&bak_tmp, &bak)?;
    }

    let bytes = encode_dat(part);
    fs::write(&tmp, &bytes)?;
    if fs::metadata(&tmp)?.len() != bytes.len() as u64 {
        let _ = fs::remove_file(&tmp);
        return Err(PartError::Io(std::io::Error::new(
            std::io::ErrorKind::WriteZero,
            "short sidecar write",
        )));
    }
    if dat.exists() {
        fs::remove_file(&dat)?;
    }
    fs::rename(&tmp, &dat)?;
    Ok(())
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut s = path.to_path_buf().into_os_string();
    s.push(suffix);
    PathBuf::from(s)
}

struct Cursor<'a> {
    data: &'a [u8],
    at: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], DatError> {
        if self.data.len() - self.at < n {
            return Err(DatError::Truncated);
        }
        let s = &self.data[self.at..self.at + n];
        self.at += n;
        Ok(s)
    }

    fn u8(&mut self) -> Result<u8, DatError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, DatError> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64, DatError> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn done(&self) -> bool {
        self.at >= self.data.len()
    }
}

fn parse_rangelist(payload: &[u8]) -> Result<RangeList, DatError> {
    let mut c = Cursor {
        data: payload,
        at: 0,
    };
    if c.u8()? != OP_RANGELIST {
        return Err(DatError::BadRanges);
    }
    let len = c.u16()? as usize;
    let blob = c.take(len)?;
    RangeList::from_bytes(blob).ok_or(DatError::BadRanges)
}

fn parse_metadata(payload: &[u8]) -> Result<(u64, Vec<HashSetRef>), DatError> {
    let mut c = Cursor {
        data: payload,
        at: 0,
    };
    let mod_secs = c.u64()?;
    let set_count = c.u16()?;
    let mut sets = Vec::with_capacity(set_count as usize);
    for _ in 0..set_count {
        let chunk_size = c.u64()?;
        if chunk_size == 0 {
            return Err(DatError::Truncated);
        }
        let pad_tail_hash = c.u8()? != 0;
        let file_hash = if c.u8()? != 0 {
            Some(c.take(16)?.try_into().expect("fixed length"))
        } else {
            None
        };
        let hash_count = c.u16()?;
        let mut chunk_hashes = Vec::with_capacity(hash_count as usize);
        for _ in 0..hash_count {
            chunk_hashes.push(c.take(16)?.try_into().expect("fixed length"));
        }
        sets.push(HashSetRef {
            chunk_size,
            file_hash,
            chunk_hashes,
            pad_tail_hash,
        });
    }
    Ok((mod_secs, sets))
}

/// Loads a part file from its sidecar at `dat`. The temp-file path is the
/// sidecar path minus the `.dat` (or `.dat.bak`) suffix.
pub fn load_dat(id: u64, dat: &Path) -> Result<PartData, DatError> {
    let bytes = fs::read(dat)?;
    let mut c = Cursor {
        data: &bytes,
        at: 0,
    };
    if c.u8()? != OP_PARTDATA {
        return Err(DatError::BadMagic);
    }
    let _body_len = c.u16()?;
    if c.u8()? != OP_PD_VER {
        warn!(target: "partdata", path = %dat.display(), "unknown sidecar version");
    }
    let size = c.u64()?;

    let location = location_from_dat(dat);
    let mut destination = PathBuf::new();
    let mut complete = RangeList::new();
    let mut verified = RangeList::new();
    let mut state = RunState::Running;

    let tag_count = c.u16()?;
    for _ in 0..tag_count {
        if c.done() {
            break;
        }
        let opcode = c.u8()?;
        let len = c.u16()? as usize;
        let payload = c.take(len)?;
        match opcode {
            OP_PD_DESTINATION => {
                destination = PathBuf::from(String::from_utf8_lossy(payload).into_owned());
            }
            OP_PD_COMPLETED => complete = parse_rangelist(payload)?,
            OP_PD_VERIFIED => verified = parse_rangelist(payload)?,
            OP_PD_STATE => {
                state = match payload.first() {
                    Some(&STATE_PAUSED) => RunState::Paused,
                    Some(&STATE_STOPPED) => RunState::Stopped,
                    _ => RunState::Running,
                };
            }
            other => {
                debug!(target: "partdata", opcode = other, "skipping unknown sidecar tag");
            }
        }
    }

    let mut part = PartData::raw(id, size, location, destination);
    part.restore_ranges(complete, verified);
    part.restore_state(state);

    if !c.done() && c.u8()? == OP_METADATA {
        let len = c.u16()? as usize;
        let payload = c.take(len)?;
        let (mod_secs, sets) = parse_metadata(payload)?;
        for hs in sets {
            // complete-but-unverified chunks get re-verified here
            let _ = part.add_hash_set(hs);
        }
        let on_disk = file_mod_secs(part.location());
        // FAT32 timestamps wobble by a second
        if mod_secs != 0 && on_disk != mod_secs && on_disk + 1 != mod_secs {
            debug!(
                target: "partdata",
                id,
                stored = mod_secs,
                on_disk,
                "modification date changed, rehashing completed chunks"
            );
            part.rehash_completed();
        }
    }

    part.check_allocation();
    Ok(part)
}

fn location_from_dat(dat: &Path) -> PathBuf {
    let s = dat.to_string_lossy();
    let trimmed = s
        .strip_suffix(".dat.bak")
        .or_else(|| s.strip_suffix(".dat"))
        .unwrap_or(&s);
    PathBuf::from(trimmed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rangelist::Range;

    fn part_on_disk(dir: &Path, size: u64) -> PartData {
        PartData::create(
            1,
            size,
            dir.join("file.part"),
            dir.join("incoming/file.bin"),
        )
        .expect("create part")
    }

    #[test]
    fn sidecar_round_trips_ranges_and_state() {
        let dir = tempfile::tempdir().unwrap();
        let mut part = part_on_disk(dir.path(), 100_000);
        part.write(0, &[1u8; 1000]).unwrap();
        part.write(5000, &[2u8; 500]).unwrap();
        part.pause();
        part.save();

        let loaded = load_dat(2, &part.dat_path()).unwrap();
        assert_eq!(loaded.size(), 100_000);
        assert_eq!(loaded.complete_ranges(), part.complete_ranges());
        assert_eq!(loaded.verified_ranges(), part.verified_ranges());
        assert_eq!(loaded.run_state(), RunState::Paused);
        assert_eq!(loaded.destination(), dir.path().join("incoming/file.bin"));
        assert_eq!(loaded.location(), dir.path().join("file.part"));
    }

    #[test]
    fn sidecar_preserves_hash_sets() {
        let dir = tempfile::tempdir().unwrap();
        let mut part = part_on_disk(dir.path(), 1000);
        part.add_hash_set(HashSetRef {
            chunk_size: 1000,
            file_hash: Some([9u8; 16]),
            chunk_hashes: vec![[7u8; 16]],
            pad_tail_hash: false,
        })
        .unwrap();
        part.save();

        let loaded = load_dat(1, &part.dat_path()).unwrap();
        assert_eq!(loaded.hash_sets().len(), 1);
        assert_eq!(loaded.hash_sets()[0].chunk_hashes, vec![[7u8; 16]]);
        assert_eq!(loaded.hash_sets()[0].file_hash, Some([9u8; 16]));
    }

    #[test]
    fn save_keeps_a_backup_generation() {
        let dir = tempfile::tempdir().unwrap();
        let mut part = part_on_disk(dir.path(), 1000);
        part.save();
        part.write(0, &[1u8; 10]).unwrap();
        part.save();

        let bak = with_suffix(&part.dat_path(), ".bak");
        assert!(part.dat_path().exists());
        assert!(bak.exists());
        // the backup is the previous generation and still parses
        let old = load_dat(3, &bak).unwrap();
        assert!(old.complete_ranges().is_empty());
    }

    #[test]
    fn short_temp_file_triggers_allocation_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let mut part = part_on_disk(dir.path(), 50_000);
        part.save();
        let mut loaded = load_dat(1, &part.dat_path()).unwrap();
        let req = loaded.take_alloc_request().expect("alloc requested");
        assert_eq!(req.size, 50_000);
        assert!(crate::run_alloc_job(&req));
        loaded.on_alloc_done(true);
        assert_eq!(std::fs::metadata(loaded.location()).unwrap().len(), 50_000);
    }

    #[test]
    fn garbage_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("junk.dat");
        fs::write(&path, b"junk").unwrap();
        assert!(matches!(load_dat(1, &path), Err(DatError::BadMagic)));
    }

    #[test]
    fn truncated_sidecar_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut part = part_on_disk(dir.path(), 1000);
        part.write(0, &[0u8; 100]).unwrap();
        part.save();
        let bytes = fs::read(part.dat_path()).unwrap();
        let cut = dir.path().join("cut.dat");
        fs::write(&cut, &bytes[..bytes.len() / 2]).unwrap();
        assert!(load_dat(1, &cut).is_err());
    }

    #[test]
    fn mod_date_mismatch_rehashes_completed_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let mut part = part_on_disk(dir.path(), 1000);
        part.add_hash_set(HashSetRef {
            chunk_size: 1000,
            file_hash: None,
            chunk_hashes: vec![crate::ed2k_part_hashes(&[3u8; 1000])[0]],
            pad_tail_hash: false,
        })
        .unwrap();
        part.write(0, &[3u8; 1000]).unwrap();
        // chunk-verify job was queued by the write
        let _ = part.take_hash_jobs();
        part.save();

        // forge a stale stored mtime by rewriting the temp file later
        std::thread::sleep(std::time::Duration::from_millis(1100));
        std::fs::write(part.location(), [3u8; 1000]).unwrap();

        let mut loaded = load_dat(1, &part.dat_path()).unwrap();
        let jobs = loaded.take_hash_jobs();
        assert!(
            !jobs.is_empty(),
            "mtime mismatch must re-verify completed chunks"
        );
    }

    #[test]
    fn range_payload_rejects_bad_header() {
        assert!(matches!(
            parse_rangelist(&[0xff, 0, 0]),
            Err(DatError::BadRanges)
        ));
    }
}
