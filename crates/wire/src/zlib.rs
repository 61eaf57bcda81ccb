//! zlib payload wrapping.
//!
//! eDonkey2000 compresses packet payloads and packed data chunks with plain
//! zlib streams (header and Adler-32 trailer included). Decompression is
//! bounded so a hostile peer cannot expand a small frame into an arbitrary
//! allocation.

use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

use crate::WireError;

/// Hard cap for a single inflated payload. The largest legitimate payload
/// is one packed 9.28 MiB part.
pub const MAX_INFLATED: usize = 16 * 1024 * 1024;

/// Compresses `input` into a fresh zlib stream.
#[must_use]
pub fn zlib_pack(input: &[u8]) -> Vec<u8> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    // writing to a Vec cannot fail
    encoder.write_all(input).expect("write to Vec");
    encoder.finish().expect("finish to Vec")
}

/// Inflates `input`, capped at [`MAX_INFLATED`] bytes.
pub fn zlib_unpack(input: &[u8]) -> Result<Vec<u8>, WireError> {
    zlib_unpack_limited(input, MAX_INFLATED)
}

/// Inflates `input`, refusing to produce more than `limit` bytes.
pub fn zlib_unpack_limited(input: &[u8], limit: usize) -> Result<Vec<u8>, WireError> {
    let mut decoder = ZlibDecoder::new(input).take(limit as u64 + 1);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|_| WireError::BadCompression)?;
    if out.len() > limit {
        return Err(WireError::BadCompression);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_unpack_round_trips() {
        let payload = b"the quick brown donkey".repeat(64);
        let packed = zlib_pack(&payload);
        assert!(packed.len() < payload.len());
        assert_eq!(zlib_unpack(&packed).unwrap(), payload);
    }

    #[test]
    fn empty_payload_round_trips() {
        let packed = zlib_pack(b"");
        assert_eq!(zlib_unpack(&packed).unwrap(), b"");
    }

    #[test]
    fn garbage_input_is_rejected() {
        assert_eq!(
            zlib_unpack(b"not a zlib stream"),
            Err(WireError::BadCompression)
        );
    }

    #[test]
    fn inflation_limit_is_enforced() {
        let bomb = zlib_pack(&vec![0u8; 64 * 1024]);
        assert_eq!(
            zlib_unpack_limited(&bomb, 1024),
            Err(WireError::BadCompression)
        );
        assert!(zlib_unpack_limited(&bomb, 64 * 1024).is_ok());
    }
}
