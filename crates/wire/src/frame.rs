//! Packet frame envelopes.
//!
//! TCP packets are `u8 proto | u32 len | u8 opcode | payload`, where `len`
//! counts the opcode plus payload. Protocol `0xd4` means the payload (not
//! the opcode) is zlib-compressed; the emitter reverts to the plain protocol
//! when compression does not shrink the data, and the reader inflates
//! transparently so upper layers only ever see plain frames.
//!
//! UDP datagrams omit the length field: `u8 proto | u8 opcode | payload`.

use crate::zlib::{zlib_pack, zlib_unpack};
use crate::WireError;

/// Protocol bytes appearing in frame headers.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum Proto {
    /// Standard eDonkey2000 protocol.
    Ed2k = 0xe3,
    /// eMule extended protocol.
    Emule = 0xc5,
    /// Payload compressed with zlib.
    Zlib = 0xd4,
}

impl Proto {
    /// Maps a wire byte to a protocol, if known.
    #[must_use]
    pub const fn from_byte(b: u8) -> Option<Self> {
        match b {
            0xe3 => Some(Self::Ed2k),
            0xc5 => Some(Self::Emule),
            0xd4 => Some(Self::Zlib),
            _ => None,
        }
    }

    /// The wire byte for this protocol.
    #[must_use]
    pub const fn byte(self) -> u8 {
        self as u8
    }
}

/// Largest frame the reader will buffer. Bigger than any legitimate packet
/// (the largest are packed chunk blocks and full hash sets).
pub const MAX_FRAME: u32 = 4 * 1024 * 1024;

/// One decoded TCP frame. Compressed frames have already been inflated;
/// `proto` then reports [`Proto::Ed2k`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Frame {
    /// Protocol the frame arrived under (post-inflation).
    pub proto: Proto,
    /// Packet opcode.
    pub opcode: u8,
    /// Packet payload, excluding the opcode.
    pub payload: Vec<u8>,
}

/// Encodes a TCP frame. With [`Proto::Zlib`] the payload is compressed and
/// the frame reverts to [`Proto::Ed2k`] if compression does not help.
#[must_use]
pub fn encode_frame(proto: Proto, opcode: u8, payload: &[u8]) -> Vec<u8> {
    let (proto, body): (Proto, std::borrow::Cow<'_, [u8]>) = if proto == Proto::Zlib {
        let packed = zlib_pack(payload);
        if packed.len() < payload.len() {
            (Proto::Zlib, packed.into())
        } else {
            (Proto::Ed2k, payload.into())
        }
    } else {
        (proto, payload.into())
    };

    let mut out = Vec::with_capacity(6 + body.len());
    out.push(proto.byte());
    out.extend_from_slice(&((body.len() as u32 + 1).to_le_bytes()));
    out.push(opcode);
    out.extend_from_slice(&body);
    out
}

/// Incremental TCP frame reassembler.
///
/// Feed raw socket bytes with [`FrameReader::feed`], then drain complete
/// frames with [`FrameReader::next_frame`]. Errors are fatal for the stream:
/// the caller is expected to drop the connection (§7 protocol-violation
/// policy), so no resynchronisation is attempted.
#[derive(Debug, Default)]
pub struct FrameReader {
    buf: Vec<u8>,
}

impl FrameReader {
    /// Creates an empty reassembler.
    #[must_use]
    pub const fn new() -> Self {
        Self { buf: Vec::new() }
    }

    /// Bytes buffered but not yet framed.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Appends raw bytes from the socket.
    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Extracts the next complete frame, or `None` when more bytes are
    /// needed.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, WireError> {
        if self.buf.len() < 6 {
            return Ok(None);
        }
        let proto_byte = self.buf[0];
        let proto = Proto::from_byte(proto_byte).ok_or(WireError::BadProtocol(proto_byte))?;
        let len = u32::from_le_bytes(self.buf[1..5].try_into().unwrap());
        if len == 0 {
            return Err(WireError::EmptyFrame);
        }
        if len > MAX_FRAME {
            return Err(WireError::OversizedFrame(len));
        }
        let total = 5 + len as usize;
        if self.buf.len() < total {
            return Ok(None);
        }

        let opcode = self.buf[5];
        let body = self.buf[6..total].to_vec();
        self.buf.drain(..total);

        if proto == Proto::Zlib {
            let payload = zlib_unpack(&body)?;
            // compressed frames surface as the plain protocol, mirroring
            // the server-side convention
            return Ok(Some(Frame {
                proto: Proto::Ed2k,
                opcode,
                payload,
            }));
        }
        Ok(Some(Frame {
            proto,
            opcode,
            payload: body,
        }))
    }
}

/// UDP datagram helpers.
pub mod udp {
    use super::Proto;
    use crate::WireError;

    /// Encodes a UDP datagram: `proto | opcode | payload`.
    #[must_use]
    pub fn encode(proto: Proto, opcode: u8, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(2 + payload.len());
        out.push(proto.byte());
        out.push(opcode);
        out.extend_from_slice(payload);
        out
    }

    /// Splits a datagram into `(proto, opcode, payload)`.
    pub fn decode(data: &[u8]) -> Result<(Proto, u8, &[u8]), WireError> {
        if data.len() < 2 {
            return Err(WireError::Truncated {
                needed: 2,
                remaining: data.len(),
            });
        }
        let proto = Proto::from_byte(data[0]).ok_or(WireError::BadProtocol(data[0]))?;
        Ok((proto, data[1], &data[2..]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_frame_round_trips() {
        let encoded = encode_frame(Proto::Ed2k, 0x58, b"payload");
        let mut rd = FrameReader::new();
        rd.feed(&encoded);
        let frame = rd.next_frame().unwrap().unwrap();
        assert_eq!(frame.proto, Proto::Ed2k);
        assert_eq!(frame.opcode, 0x58);
        assert_eq!(frame.payload, b"payload");
        assert!(rd.next_frame().unwrap().is_none());
    }

    #[test]
    fn length_counts_opcode() {
        let encoded = encode_frame(Proto::Ed2k, 0x55, b"");
        assert_eq!(&encoded, &[0xe3, 1, 0, 0, 0, 0x55]);
    }

    #[test]
    fn compressible_payload_is_sent_compressed() {
        let payload = vec![0u8; 4096];
        let encoded = encode_frame(Proto::Zlib, 0x40, &payload);
        assert_eq!(encoded[0], 0xd4);
        assert!(encoded.len() < payload.len());

        let mut rd = FrameReader::new();
        rd.feed(&encoded);
        let frame = rd.next_frame().unwrap().unwrap();
        // inflated frames surface as the plain protocol
        assert_eq!(frame.proto, Proto::Ed2k);
        assert_eq!(frame.payload, payload);
    }

    #[test]
    fn incompressible_payload_reverts_to_plain() {
        // high-entropy bytes: zlib output will not be smaller
        let payload: Vec<u8> = (0..64u32).map(|i| (i * 193 + 71) as u8).collect();
        let encoded = encode_frame(Proto::Zlib, 0x46, &payload);
        assert_eq!(encoded[0], 0xe3);
        assert_eq!(&encoded[6..], &payload[..]);
    }

    #[test]
    fn partial_feed_waits_for_more() {
        let encoded = encode_frame(Proto::Emule, 0x60, &[1, 2, 3]);
        let mut rd = FrameReader::new();
        rd.feed(&encoded[..4]);
        assert!(rd.next_frame().unwrap().is_none());
        rd.feed(&encoded[4..]);
        let frame = rd.next_frame().unwrap().unwrap();
        assert_eq!(frame.proto, Proto::Emule);
        assert_eq!(frame.payload, vec![1, 2, 3]);
    }

    #[test]
    fn two_frames_in_one_feed() {
        let mut bytes = encode_frame(Proto::Ed2k, 0x01, b"a");
        bytes.extend(encode_frame(Proto::Ed2k, 0x02, b"bb"));
        let mut rd = FrameReader::new();
        rd.feed(&bytes);
        assert_eq!(rd.next_frame().unwrap().unwrap().opcode, 0x01);
        assert_eq!(rd.next_frame().unwrap().unwrap().opcode, 0x02);
        assert!(rd.next_frame().unwrap().is_none());
    }

    #[test]
    fn unknown_protocol_is_fatal() {
        let mut rd = FrameReader::new();
        rd.feed(&[0x42, 1, 0, 0, 0, 0x01]);
        assert_eq!(rd.next_frame(), Err(WireError::BadProtocol(0x42)));
    }

    #[test]
    fn oversized_frame_is_fatal() {
        let mut rd = FrameReader::new();
        let mut bytes = vec![0xe3];
        bytes.extend_from_slice(&(MAX_FRAME + 1).to_le_bytes());
        bytes.push(0x01);
        rd.feed(&bytes);
        assert!(matches!(
            rd.next_frame(),
            Err(WireError::OversizedFrame(_))
        ));
    }

    #[test]
    fn zero_length_frame_is_fatal() {
        let mut rd = FrameReader::new();
        rd.feed(&[0xe3, 0, 0, 0, 0, 0x00]);
        assert_eq!(rd.next_frame(), Err(WireError::EmptyFrame));
    }

    #[test]
    fn udp_round_trips() {
        let datagram = udp::encode(Proto::Emule, 0x90, b"hashbytes");
        let (proto, opcode, payload) = udp::decode(&datagram).unwrap();
        assert_eq!(proto, Proto::Emule);
        assert_eq!(opcode, 0x90);
        assert_eq!(payload, b"hashbytes");
    }

    #[test]
    fn udp_too_short_is_rejected() {
        assert!(udp::decode(&[0xe3]).is_err());
    }
}
