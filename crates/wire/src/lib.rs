//! Codec primitives shared by the peer and server protocols.
//!
//! Everything on the eDonkey2000 wire is little-endian. This crate provides
//! the byte-level [`Reader`]/[`Writer`] pair, the tagged-value ("tag")
//! encoding, zlib payload wrapping, and the TCP/UDP frame envelopes. Packet
//! structs themselves live in the protocol crate; this layer knows nothing
//! about opcodes beyond the envelope.

use thiserror::Error;

mod frame;
mod io;
mod tag;
mod zlib;

pub use frame::{Frame, FrameReader, Proto, encode_frame, udp};
pub use io::{Reader, Writer};
pub use tag::{Tag, TagName, TagValue};
pub use zlib::{zlib_pack, zlib_unpack, zlib_unpack_limited};

/// 16-byte MD4 digest as it appears on the wire.
pub type Hash16 = [u8; 16];

/// Errors raised while decoding wire data.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum WireError {
    /// The input ended before the expected field.
    #[error("truncated input: needed {needed} bytes, {remaining} remain")]
    Truncated {
        /// Bytes the decoder tried to take.
        needed: usize,
        /// Bytes left in the buffer.
        remaining: usize,
    },
    /// A tag carried a type code this implementation does not know, so its
    /// length cannot be derived and the stream cannot be resynchronised.
    #[error("unknown tag type 0x{0:02x}")]
    UnknownTagType(u8),
    /// A string field was not valid UTF-8 and could not be lossily decoded.
    #[error("malformed string field")]
    BadString,
    /// Frame header carried an unknown protocol byte.
    #[error("unknown protocol byte 0x{0:02x}")]
    BadProtocol(u8),
    /// Frame length field exceeds the sanity limit.
    #[error("oversized frame: {0} bytes")]
    OversizedFrame(u32),
    /// A zero-length frame cannot carry an opcode.
    #[error("empty frame")]
    EmptyFrame,
    /// Compressed payload failed to inflate.
    #[error("zlib inflate failed")]
    BadCompression,
    /// A count or length field is inconsistent with the payload size.
    #[error("malformed packet: {0}")]
    Malformed(&'static str),
}
