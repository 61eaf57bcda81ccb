//! Packet encoding and decoding.
//!
//! Every struct here mirrors one wire packet. Outgoing packets build a
//! complete TCP frame (or UDP datagram) including the envelope; incoming
//! packets decode from a [`Frame`] payload. Integers are little-endian,
//! range ends are exclusive on the wire and converted to the engine's
//! inclusive convention at this boundary, and optional trailing fields are
//! probed rather than assumed.

use rangelist::Range;
use wire::{encode_frame, udp, Frame, Hash16, Proto, Reader, Tag, TagValue, WireError, Writer};

use crate::opcodes::*;
use crate::Identity;

/// Upper bound on sources in one `AnswerSources` packet.
pub const MAX_ANSWER_SOURCES: usize = 500;

fn read_part_map(r: &mut Reader<'_>) -> Result<Vec<bool>, WireError> {
    let count = r.u16()? as usize;
    let mut bits = Vec::with_capacity(count);
    let bytes = count.div_ceil(8);
    let raw = r.bytes(bytes)?;
    for i in 0..count {
        bits.push(raw[i / 8] >> (i % 8) & 1 != 0);
    }
    Ok(bits)
}

fn write_part_map(w: &mut Writer, bits: &[bool]) {
    w.u16(bits.len() as u16);
    let mut acc = 0u8;
    for (i, bit) in bits.iter().enumerate() {
        acc |= u8::from(*bit) << (i % 8);
        if i % 8 == 7 {
            w.u8(acc);
            acc = 0;
        }
    }
    if bits.len() % 8 != 0 {
        w.u8(acc);
    }
}

// ---------------------------------------------------------------------------
// client <-> client handshake
// ---------------------------------------------------------------------------

/// `Hello` / `HelloAnswer`: who we are. HelloAnswer differs only by the
/// missing hash-length byte and opcode.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Hello {
    pub hash: Hash16,
    pub client_id: u32,
    pub tcp_port: u16,
    pub nick: String,
    pub version: u32,
    pub mod_str: String,
    pub mule_ver: u32,
    pub udp_port: u16,
    pub features: u32,
    pub server: Option<(u32, u16)>,
}

impl Hello {
    /// Builds our own greeting from the identity.
    #[must_use]
    pub fn ours(ident: &Identity, server: Option<(u32, u16)>) -> Self {
        Self {
            hash: ident.user_hash,
            client_id: ident.id,
            tcp_port: ident.tcp_port,
            nick: ident.nick.clone(),
            version: VER_EDONKEY,
            mod_str: String::new(),
            mule_ver: own_version(0, 4, 0),
            udp_port: ident.udp_port,
            features: Features::ours().to_bits(),
            server,
        }
    }

    fn encode_body(&self, opcode: u8, hash_len: bool) -> Vec<u8> {
        let mut w = Writer::new();
        if hash_len {
            w.u8(16);
        }
        w.hash(&self.hash);
        w.u32(self.client_id);
        w.u16(self.tcp_port);

        let mut tags = Vec::new();
        if !self.mod_str.is_empty() {
            tags.push(Tag::string(CT_MODSTR, self.mod_str.clone()));
        }
        tags.push(Tag::string(CT_NICK, self.nick.clone()));
        tags.push(Tag::u32(CT_VERSION, self.version));
        tags.push(Tag::u32(CT_MULEVERSION, self.mule_ver));
        tags.push(Tag::u32(CT_UDPPORTS, u32::from(self.udp_port)));
        tags.push(Tag::u32(CT_MISCFEATURES, self.features));
        Tag::write_list(&tags, &mut w);

        let (srv_ip, srv_port) = self.server.unwrap_or((0, 0));
        w.u32(srv_ip);
        w.u16(srv_port);

        let mut out = vec![opcode];
        out.extend_from_slice(w.as_bytes());
        out
    }

    /// Encodes as a `Hello` frame.
    #[must_use]
    pub fn to_hello_frame(&self) -> Vec<u8> {
        let body = self.encode_body(OP_HELLO, true);
        encode_frame(Proto::Ed2k, body[0], &body[1..])
    }

    /// Encodes as a `HelloAnswer` frame.
    #[must_use]
    pub fn to_answer_frame(&self) -> Vec<u8> {
        let body = self.encode_body(OP_HELLOANSWER, false);
        encode_frame(Proto::Ed2k, body[0], &body[1..])
    }

    /// Decodes from a payload; `hash_len` selects the Hello layout.
    pub fn decode(payload: &[u8], hash_len: bool) -> Result<Self, WireError> {
        let mut r = Reader::new(payload);
        if hash_len && r.u8()? != 16 {
            return Err(WireError::Malformed("hello hash length is not 16"));
        }
        let hash = r.hash()?;
        let client_id = r.u32()?;
        let tcp_port = r.u16()?;

        let mut hello = Self {
            hash,
            client_id,
            tcp_port,
            nick: String::new(),
            version: 0,
            mod_str: String::new(),
            mule_ver: 0,
            udp_port: 0,
            features: 0,
            server: None,
        };
        for tag in Tag::read_list(&mut r)? {
            match (tag.code(), &tag.value) {
                (Some(CT_NICK), TagValue::Str(s)) => hello.nick = s.clone(),
                (Some(CT_VERSION), _) => {
                    hello.version = tag.value_u64().unwrap_or(0) as u32;
                }
                (Some(CT_MODSTR), TagValue::Str(s)) => hello.mod_str = s.clone(),
                (Some(CT_MULEVERSION), _) => {
                    hello.mule_ver = tag.value_u64().unwrap_or(0) as u32;
                }
                (Some(CT_UDPPORTS), _) => {
                    hello.udp_port = tag.value_u64().unwrap_or(0) as u16;
                }
                (Some(CT_MISCFEATURES), _) => {
                    hello.features = tag.value_u64().unwrap_or(0) as u32;
                }
                _ => {} // unknown tags are ignored
            }
        }
        // servers don't send their address; tolerate the short form
        if r.remaining() >= 6 {
            let ip = r.u32()?;
            let port = r.u16()?;
            hello.server = Some((ip, port));
        }
        if hello.tcp_port == 0 {
            return Err(WireError::Malformed("hello without tcp port"));
        }
        Ok(hello)
    }

    /// Negotiated feature versions.
    #[must_use]
    pub const fn feature_set(&self) -> Features {
        Features::from_bits(self.features)
    }
}

/// Legacy `MuleInfo` / `MuleInfoAnswer` exchange spoken by old mules.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MuleInfo {
    pub version: u8,
    pub protocol: u8,
    pub compr_ver: u8,
    pub udp_ver: u8,
    pub udp_port: u16,
    pub src_exch_ver: u8,
    pub comment_ver: u8,
    pub ext_req_ver: u8,
    pub features: u16,
    pub compat_client: u8,
    pub mod_str: String,
}

impl MuleInfo {
    /// Our own legacy info packet.
    #[must_use]
    pub fn ours(ident: &Identity) -> Self {
        Self {
            version: 0x44,
            protocol: 0x01,
            compr_ver: 0,
            udp_ver: 4,
            udp_port: ident.udp_port,
            src_exch_ver: 3,
            comment_ver: 1,
            ext_req_ver: 2,
            features: 0x03, // secident
            compat_client: CS_HYDRANODE,
            mod_str: String::new(),
        }
    }

    fn encode(&self, opcode: u8) -> Vec<u8> {
        let mut w = Writer::new();
        w.u8(self.version);
        w.u8(self.protocol);
        let tags = vec![
            Tag::u32(CT_COMPRESSION, u32::from(self.compr_ver)),
            Tag::u32(CT_UDPVER, u32::from(self.udp_ver)),
            Tag::u32(CT_UDPPORT, u32::from(self.udp_port)),
            Tag::u32(CT_SOURCEEXCH, u32::from(self.src_exch_ver)),
            Tag::u32(CT_COMMENTS, u32::from(self.comment_ver)),
            Tag::u32(CT_EXTREQ, u32::from(self.ext_req_ver)),
            Tag::u32(CT_FEATURES, u32::from(self.features)),
            Tag::u32(CT_COMPATCLIENT, u32::from(self.compat_client)),
        ];
        Tag::write_list(&tags, &mut w);
        encode_frame(Proto::Emule, opcode, w.as_bytes())
    }

    /// Encodes as `MuleInfo`.
    #[must_use]
    pub fn to_info_frame(&self) -> Vec<u8> {
        self.encode(OP_MULEINFO)
    }

    /// Encodes as `MuleInfoAnswer`.
    #[must_use]
    pub fn to_answer_frame(&self) -> Vec<u8> {
        self.encode(OP_MULEINFOANSWER)
    }

    /// Decodes from a payload.
    pub fn decode(payload: &[u8]) -> Result<Self, WireError> {
        let mut r = Reader::new(payload);
        let mut info = Self {
            version: r.u8()?,
            protocol: r.u8()?,
            ..Self::default()
        };
        for tag in Tag::read_list(&mut r)? {
            let v = tag.value_u64().unwrap_or(0);
            match tag.code() {
                Some(CT_COMPRESSION) => info.compr_ver = v as u8,
                Some(CT_UDPVER) => info.udp_ver = v as u8,
                Some(CT_UDPPORT) => info.udp_port = v as u16,
                Some(CT_SOURCEEXCH) => info.src_exch_ver = v as u8,
                Some(CT_COMMENTS) => info.comment_ver = v as u8,
                Some(CT_EXTREQ) => info.ext_req_ver = v as u8,
                Some(CT_FEATURES) => info.features = v as u16,
                Some(CT_COMPATCLIENT) => info.compat_client = v as u8,
                Some(CT_MODVERSION) => {
                    info.mod_str = tag
                        .value
                        .as_str()
                        .map_or_else(|| format!("ModID: {v}"), ToOwned::to_owned);
                }
                _ => {}
            }
        }
        Ok(info)
    }
}

// ---------------------------------------------------------------------------
// file requests
// ---------------------------------------------------------------------------

/// `ReqFile`: we want this file. Extended-request peers append their own
/// partmap and complete-source count.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReqFile {
    pub hash: Hash16,
    pub part_map: Vec<bool>,
    pub src_count: u16,
}

impl ReqFile {
    /// Encodes into a frame.
    #[must_use]
    pub fn to_frame(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.hash(&self.hash);
        write_part_map(&mut w, &self.part_map);
        w.u16(self.src_count);
        encode_frame(Proto::Ed2k, OP_REQFILE, w.as_bytes())
    }

    /// Decodes from a payload; the extended fields are optional.
    pub fn decode(payload: &[u8]) -> Result<Self, WireError> {
        let mut r = Reader::new(payload);
        let hash = r.hash()?;
        let mut out = Self {
            hash,
            ..Self::default()
        };
        if r.remaining() >= 2 {
            if let Ok(map) = read_part_map(&mut r) {
                out.part_map = map;
                if let Ok(cnt) = r.u16() {
                    out.src_count = cnt;
                }
            }
        }
        Ok(out)
    }
}

/// `FileName`: the name we share the hash under.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileName {
    pub hash: Hash16,
    pub name: String,
}

impl FileName {
    #[must_use]
    pub fn to_frame(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.hash(&self.hash);
        w.string16(&self.name);
        encode_frame(Proto::Ed2k, OP_FILENAME, w.as_bytes())
    }

    pub fn decode(payload: &[u8]) -> Result<Self, WireError> {
        let mut r = Reader::new(payload);
        Ok(Self {
            hash: r.hash()?,
            name: r.string16()?,
        })
    }
}

/// `FileDesc`: rating and comment, sent alongside `FileName`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileDesc {
    pub rating: u8,
    pub comment: String,
}

impl FileDesc {
    #[must_use]
    pub fn to_frame(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.u8(self.rating);
        w.u32(self.comment.len() as u32);
        w.bytes(self.comment.as_bytes());
        encode_frame(Proto::Emule, OP_FILEDESC, w.as_bytes())
    }

    pub fn decode(payload: &[u8]) -> Result<Self, WireError> {
        let mut r = Reader::new(payload);
        let rating = r.u8()?;
        let len = r.u32()? as usize;
        let comment = String::from_utf8_lossy(r.bytes(len)?).into_owned();
        Ok(Self { rating, comment })
    }
}

/// `FileStatus`: which parts of the file the sender has. An empty map
/// means the whole file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileStatus {
    pub hash: Hash16,
    pub part_map: Vec<bool>,
}

impl FileStatus {
    #[must_use]
    pub fn to_frame(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.hash(&self.hash);
        write_part_map(&mut w, &self.part_map);
        encode_frame(Proto::Ed2k, OP_REQFILE_STATUS, w.as_bytes())
    }

    pub fn decode(payload: &[u8]) -> Result<Self, WireError> {
        let mut r = Reader::new(payload);
        let hash = r.hash()?;
        let part_map = if r.remaining() >= 2 {
            read_part_map(&mut r)?
        } else {
            Vec::new()
        };
        Ok(Self { hash, part_map })
    }
}

/// `HashSet`: the part digests for a file hash.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HashSetPacket {
    pub file_hash: Hash16,
    pub chunk_hashes: Vec<Hash16>,
}

impl HashSetPacket {
    #[must_use]
    pub fn to_frame(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.hash(&self.file_hash);
        w.u16(self.chunk_hashes.len() as u16);
        for h in &self.chunk_hashes {
            w.hash(h);
        }
        encode_frame(Proto::Ed2k, OP_HASHSET, w.as_bytes())
    }

    pub fn decode(payload: &[u8]) -> Result<Self, WireError> {
        let mut r = Reader::new(payload);
        let file_hash = r.hash()?;
        let count = r.u16()?;
        let mut chunk_hashes = Vec::with_capacity(count as usize);
        for _ in 0..count {
            chunk_hashes.push(r.hash()?);
        }
        Ok(Self {
            file_hash,
            chunk_hashes,
        })
    }
}

// ---------------------------------------------------------------------------
// transfer
// ---------------------------------------------------------------------------

/// `ReqChunks`: up to three ranges we want next. The wire stores three
/// begin offsets then three *exclusive* end offsets; `(0, 0)` marks an
/// unused slot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReqChunks {
    pub hash: Hash16,
    /// Requested ranges, inclusive ends.
    pub ranges: Vec<Range>,
}

impl ReqChunks {
    #[must_use]
    pub fn to_frame(&self) -> Vec<u8> {
        debug_assert!(!self.ranges.is_empty() && self.ranges.len() <= 3);
        let mut w = Writer::new();
        w.hash(&self.hash);
        for i in 0..3 {
            w.u32(self.ranges.get(i).map_or(0, |r| r.begin() as u32));
        }
        for i in 0..3 {
            w.u32(self.ranges.get(i).map_or(0, |r| r.end() as u32 + 1));
        }
        encode_frame(Proto::Ed2k, OP_REQCHUNKS, w.as_bytes())
    }

    pub fn decode(payload: &[u8]) -> Result<Self, WireError> {
        let mut r = Reader::new(payload);
        let hash = r.hash()?;
        let begins = [r.u32()?, r.u32()?, r.u32()?];
        let ends = [r.u32()?, r.u32()?, r.u32()?];
        let mut ranges = Vec::new();
        for (b, e) in begins.into_iter().zip(ends) {
            if e == 0 {
                continue; // unused slot
            }
            if e <= b {
                return Err(WireError::Malformed("inverted chunk range"));
            }
            ranges.push(Range::new(u64::from(b), u64::from(e) - 1));
        }
        Ok(Self { hash, ranges })
    }
}

/// `DataChunk`: one ≤10 KiB block of plain file data.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DataChunk {
    pub hash: Hash16,
    pub begin: u32,
    /// Exclusive end offset.
    pub end: u32,
    pub data: Vec<u8>,
}

impl DataChunk {
    #[must_use]
    pub fn to_frame(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.hash(&self.hash);
        w.u32(self.begin);
        w.u32(self.end);
        w.bytes(&self.data);
        encode_frame(Proto::Ed2k, OP_SENDINGCHUNK, w.as_bytes())
    }

    pub fn decode(payload: &[u8]) -> Result<Self, WireError> {
        let mut r = Reader::new(payload);
        let hash = r.hash()?;
        let begin = r.u32()?;
        let end = r.u32()?;
        if end <= begin {
            return Err(WireError::Malformed("inverted data chunk"));
        }
        let data = r.bytes((end - begin) as usize)?.to_vec();
        Ok(Self {
            hash,
            begin,
            end,
            data,
        })
    }
}

/// `PackedChunk`: part of a zlib-compressed chunk. `packed_total` is the
/// size of the whole compressed stream, of which this frame carries a
/// fragment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PackedChunk {
    pub hash: Hash16,
    pub begin: u32,
    pub packed_total: u32,
    pub data: Vec<u8>,
}

impl PackedChunk {
    #[must_use]
    pub fn to_frame(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.hash(&self.hash);
        w.u32(self.begin);
        w.u32(self.packed_total);
        w.bytes(&self.data);
        encode_frame(Proto::Emule, OP_PACKEDCHUNK, w.as_bytes())
    }

    pub fn decode(payload: &[u8]) -> Result<Self, WireError> {
        let mut r = Reader::new(payload);
        Ok(Self {
            hash: r.hash()?,
            begin: r.u32()?,
            packed_total: r.u32()?,
            data: r.rest().to_vec(),
        })
    }
}

// ---------------------------------------------------------------------------
// source exchange, secident, misc
// ---------------------------------------------------------------------------

/// One source in an `AnswerSources` packet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SourceEntry {
    pub id: u32,
    pub port: u16,
    pub server_ip: u32,
    pub server_port: u16,
}

/// `AnswerSources`: the sources we know for a hash.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AnswerSources {
    pub hash: Hash16,
    pub sources: Vec<SourceEntry>,
    /// SrcExch v3 byte-swaps the client id on the wire.
    pub swap_ids: bool,
}

impl AnswerSources {
    #[must_use]
    pub fn to_frame(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.hash(&self.hash);
        w.u16(self.sources.len() as u16);
        for s in &self.sources {
            let id = if self.swap_ids { s.id.swap_bytes() } else { s.id };
            w.u32(id);
            w.u16(s.port);
            w.u32(s.server_ip);
            w.u16(s.server_port);
        }
        encode_frame(Proto::Zlib, OP_ANSWERSOURCES, w.as_bytes())
    }

    /// Decodes; item length is derived from the payload size so v2's extra
    /// user hash (and anything future) is skipped safely. `swap_ids`
    /// reverses the v3 id swap.
    pub fn decode(payload: &[u8], swap_ids: bool) -> Result<Self, WireError> {
        let mut r = Reader::new(payload);
        let hash = r.hash()?;
        let count = r.u16()? as usize;
        if count == 0 {
            return Ok(Self {
                hash,
                sources: Vec::new(),
                swap_ids,
            });
        }
        let item_len = r.remaining() / count;
        if item_len < 6 {
            return Err(WireError::Malformed("answer-sources item too small"));
        }
        let mut sources = Vec::with_capacity(count.min(MAX_ANSWER_SOURCES));
        for _ in 0..count.min(MAX_ANSWER_SOURCES) {
            let mut id = r.u32()?;
            let port = r.u16()?;
            let (mut server_ip, mut server_port) = (0u32, 0u16);
            if item_len >= 12 {
                server_ip = r.u32()?;
                server_port = r.u16()?;
            }
            let used = if item_len >= 12 { 12 } else { 6 };
            r.skip(item_len - used)?; // v2 user hash etc.
            if swap_ids {
                id = id.swap_bytes();
            }
            sources.push(SourceEntry {
                id,
                port,
                server_ip,
                server_port,
            });
        }
        Ok(Self {
            hash,
            sources,
            swap_ids,
        })
    }
}

/// `SecIdentState`: request the peer's signature (and public key when we
/// do not have it cached).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SecIdentState {
    pub state: u8,
    pub challenge: u32,
}

impl SecIdentState {
    #[must_use]
    pub fn to_frame(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.u8(self.state);
        w.u32(self.challenge);
        encode_frame(Proto::Emule, OP_SECIDENTSTATE, w.as_bytes())
    }

    pub fn decode(payload: &[u8]) -> Result<Self, WireError> {
        let mut r = Reader::new(payload);
        Ok(Self {
            state: r.u8()?,
            challenge: r.u32()?,
        })
    }
}

/// `Signature` over a SecIdent challenge; v2 appends the ip type byte.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Signature {
    pub sign: Vec<u8>,
    pub ip_type: u8,
}

impl Signature {
    #[must_use]
    pub fn to_frame(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.u8(self.sign.len() as u8);
        w.bytes(&self.sign);
        if self.ip_type != IP_NONE {
            w.u8(self.ip_type);
        }
        encode_frame(Proto::Emule, OP_SIGNATURE, w.as_bytes())
    }

    pub fn decode(payload: &[u8]) -> Result<Self, WireError> {
        let mut r = Reader::new(payload);
        let len = r.u8()? as usize;
        let sign = r.bytes(len)?.to_vec();
        let ip_type = if r.remaining() >= 1 { r.u8()? } else { IP_NONE };
        Ok(Self { sign, ip_type })
    }
}

/// Encodes a `PublicKey` frame.
#[must_use]
pub fn public_key_frame(key: &[u8]) -> Vec<u8> {
    let mut w = Writer::new();
    w.u8(key.len() as u8);
    w.bytes(key);
    encode_frame(Proto::Emule, OP_PUBLICKEY, w.as_bytes())
}

fn decode_public_key(payload: &[u8]) -> Result<Vec<u8>, WireError> {
    let mut r = Reader::new(payload);
    let len = r.u8()? as usize;
    Ok(r.bytes(len)?.to_vec())
}

// ---------------------------------------------------------------------------
// client <-> client UDP
// ---------------------------------------------------------------------------

/// `ReaskFilePing`: keep our place in the peer's upload queue. UDP v4 adds
/// our partmap, v3 the complete-source count (partmap comes first).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReaskFilePing {
    pub hash: Hash16,
    pub part_map: Vec<bool>,
    pub src_count: u16,
}

impl ReaskFilePing {
    /// Encodes at the negotiated UDP version.
    #[must_use]
    pub fn to_datagram(&self, udp_version: u8) -> Vec<u8> {
        let mut w = Writer::new();
        w.hash(&self.hash);
        if udp_version >= 4 {
            write_part_map(&mut w, &self.part_map);
        }
        if udp_version >= 3 {
            w.u16(self.src_count);
        }
        udp::encode(Proto::Emule, OP_REASKFILEPING, w.as_bytes())
    }

    pub fn decode(payload: &[u8]) -> Result<Self, WireError> {
        let mut r = Reader::new(payload);
        let hash = r.hash()?;
        let mut out = Self {
            hash,
            ..Self::default()
        };
        // v4 payloads are at least hash + count word + source count
        if r.remaining() > 2 {
            out.part_map = read_part_map(&mut r)?;
        }
        if r.remaining() >= 2 {
            out.src_count = r.u16()?;
        }
        Ok(out)
    }
}

/// `ReaskAck`: the peer's answer with our queue rank (v4 adds their
/// partmap before it).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReaskAck {
    pub part_map: Vec<bool>,
    pub qr: u16,
}

impl ReaskAck {
    #[must_use]
    pub fn to_datagram(&self, udp_version: u8) -> Vec<u8> {
        let mut w = Writer::new();
        if udp_version >= 4 {
            write_part_map(&mut w, &self.part_map);
        }
        w.u16(self.qr);
        udp::encode(Proto::Emule, OP_REASKACK, w.as_bytes())
    }

    pub fn decode(payload: &[u8]) -> Result<Self, WireError> {
        let mut r = Reader::new(payload);
        let mut out = Self::default();
        if r.remaining() > 2 {
            out.part_map = read_part_map(&mut r)?;
        }
        out.qr = r.u16()?;
        Ok(out)
    }
}

/// Encodes the empty `FileNotFound` answer.
#[must_use]
pub fn file_not_found_datagram() -> Vec<u8> {
    udp::encode(Proto::Emule, OP_FILENOTFOUND, &[])
}

/// Encodes the empty `QueueFull` answer.
#[must_use]
pub fn queue_full_datagram() -> Vec<u8> {
    udp::encode(Proto::Emule, OP_QUEUEFULL, &[])
}

// ---------------------------------------------------------------------------
// client <-> server TCP
// ---------------------------------------------------------------------------

/// Builds the `LoginRequest` frame.
#[must_use]
pub fn login_request_frame(ident: &Identity) -> Vec<u8> {
    let mut w = Writer::new();
    w.hash(&ident.user_hash);
    w.u32(0); // client id, assigned by the server
    w.u16(ident.tcp_port);
    let tags = vec![
        Tag::string(CT_NICK, ident.nick.clone()),
        Tag::u32(CT_VERSION, VER_EDONKEY),
        Tag::u32(CT_PORT, u32::from(ident.tcp_port)),
        Tag::u32(CT_MULEVERSION, own_version(0, 4, 0)),
        Tag::u32(CT_FLAGS, FL_ZLIB | FL_NEWTAGS),
    ];
    Tag::write_list(&tags, &mut w);
    encode_frame(Proto::Ed2k, OP_LOGINREQUEST, w.as_bytes())
}

/// `IdChange` from the server: our new id plus the optional TCP feature
/// flags newer servers append.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IdChange {
    pub id: u32,
    pub flags: u32,
}

impl IdChange {
    pub fn decode(payload: &[u8]) -> Result<Self, WireError> {
        let mut r = Reader::new(payload);
        let id = r.u32()?;
        let flags = if r.remaining() >= 4 { r.u32()? } else { 0 };
        Ok(Self { id, flags })
    }
}

/// A file we publish to the server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OfferedFile {
    pub hash: Hash16,
    /// `FL_COMPLETE_ID`/`FL_PARTIAL_ID`, or our real id.
    pub id: u32,
    pub port: u16,
    pub name: String,
    pub size: u32,
    pub file_type: Option<String>,
}

/// Builds an `OfferFiles` frame; compressed when the server supports zlib.
#[must_use]
pub fn offer_files_frame(files: &[OfferedFile], zlib: bool) -> Vec<u8> {
    let mut w = Writer::new();
    w.u32(files.len() as u32);
    for f in files {
        w.hash(&f.hash);
        w.u32(f.id);
        w.u16(f.port);
        let mut tags = vec![
            Tag::string(CT_FILENAME, f.name.clone()),
            Tag::u32(CT_FILESIZE, f.size),
        ];
        if let Some(t) = &f.file_type {
            tags.push(Tag::string(CT_FILETYPE, t.clone()));
        }
        Tag::write_list(&tags, &mut w);
    }
    let proto = if zlib { Proto::Zlib } else { Proto::Ed2k };
    encode_frame(proto, OP_OFFERFILES, w.as_bytes())
}

/// Builds a `ReqCallback` frame asking the server to relay a callback.
#[must_use]
pub fn req_callback_frame(id: u32) -> Vec<u8> {
    let mut w = Writer::new();
    w.u32(id);
    encode_frame(Proto::Ed2k, OP_REQCALLBACK, w.as_bytes())
}

/// Builds one `ReqSources` frame. The server list batches several of
/// these back-to-back into a single TCP write.
#[must_use]
pub fn req_sources_frame(hash: &Hash16, size: u32) -> Vec<u8> {
    let mut w = Writer::new();
    w.hash(hash);
    w.u32(size);
    encode_frame(Proto::Ed2k, OP_GETSOURCES, w.as_bytes())
}

/// Builds the `GetServerList` frame.
#[must_use]
pub fn get_server_list_frame() -> Vec<u8> {
    encode_frame(Proto::Ed2k, OP_GETSERVERLIST, &[])
}

/// `FoundSources` reply to `ReqSources`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FoundSources {
    pub hash: Hash16,
    pub sources: Vec<(u32, u16)>,
}

impl FoundSources {
    pub fn decode(payload: &[u8]) -> Result<Self, WireError> {
        let mut r = Reader::new(payload);
        let hash = r.hash()?;
        let count = r.u8()?;
        let mut sources = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let id = r.u32()?;
            let port = r.u16()?;
            sources.push((id, port));
        }
        Ok(Self { hash, sources })
    }

    /// Number of low-id sources in the list.
    #[must_use]
    pub fn low_id_count(&self) -> usize {
        self.sources
            .iter()
            .filter(|(id, _)| crate::is_low_id(*id))
            .count()
    }
}

/// `ServerList`: addresses of other known servers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerListPacket {
    pub servers: Vec<(u32, u16)>,
}

impl ServerListPacket {
    pub fn decode(payload: &[u8]) -> Result<Self, WireError> {
        let mut r = Reader::new(payload);
        let count = r.u8()?;
        let mut servers = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let ip = r.u32()?;
            let port = r.u16()?;
            servers.push((ip, port));
        }
        Ok(Self { servers })
    }
}

/// `ServerIdent`: the connected server describing itself.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerIdent {
    pub hash: Hash16,
    pub ip: u32,
    pub port: u16,
    pub name: String,
    pub desc: String,
}

impl ServerIdent {
    pub fn decode(payload: &[u8]) -> Result<Self, WireError> {
        let mut r = Reader::new(payload);
        let hash = r.hash()?;
        let ip = r.u32()?;
        let port = r.u16()?;
        let mut name = String::new();
        let mut desc = String::new();
        for tag in Tag::read_list(&mut r)? {
            match (tag.code(), &tag.value) {
                (Some(CT_SERVERNAME), TagValue::Str(s)) => name = s.clone(),
                (Some(CT_SERVERDESC), TagValue::Str(s)) => desc = s.clone(),
                _ => {}
            }
        }
        Ok(Self {
            hash,
            ip,
            port,
            name,
            desc,
        })
    }
}

/// `CallbackReq` relayed by the server: connect this peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CallbackReq {
    pub ip: u32,
    pub port: u16,
}

impl CallbackReq {
    pub fn decode(payload: &[u8]) -> Result<Self, WireError> {
        let mut r = Reader::new(payload);
        Ok(Self {
            ip: r.u32()?,
            port: r.u16()?,
        })
    }
}

/// One entry of a `SearchResult`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SearchResultEntry {
    pub hash: Hash16,
    pub id: u32,
    pub port: u16,
    pub name: String,
    pub size: u32,
    pub sources: u32,
    pub complete_sources: u32,
    pub rating: u8,
    pub bitrate: u32,
    pub length: u32,
    pub codec: String,
}

/// `SearchResult` from the connected server.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SearchResultPacket {
    pub results: Vec<SearchResultEntry>,
}

impl SearchResultPacket {
    pub fn decode(payload: &[u8]) -> Result<Self, WireError> {
        let mut r = Reader::new(payload);
        let count = r.u32()?;
        let mut results = Vec::new();
        for _ in 0..count {
            if r.is_empty() {
                break;
            }
            results.push(Self::read_entry(&mut r)?);
        }
        Ok(Self { results })
    }

    fn read_entry(r: &mut Reader<'_>) -> Result<SearchResultEntry, WireError> {
        let mut entry = SearchResultEntry {
            hash: r.hash()?,
            id: r.u32()?,
            port: r.u16()?,
            ..SearchResultEntry::default()
        };
        for tag in Tag::read_list(r)? {
            let v = tag.value_u64().unwrap_or(0);
            match (tag.code(), &tag.value) {
                (Some(CT_FILENAME), TagValue::Str(s)) => entry.name = s.clone(),
                (Some(CT_FILESIZE), _) => entry.size = v as u32,
                (Some(CT_SOURCES), _) => entry.sources = v as u32,
                (Some(CT_COMPLSRC), _) => entry.complete_sources = v as u32,
                (Some(CT_FILERATING), _) => entry.rating = v as u8,
                (Some(CT_MEDIA_BITRATE), _) => entry.bitrate = v as u32,
                (Some(CT_MEDIA_LENGTH), _) => entry.length = v as u32,
                (Some(CT_MEDIA_CODEC), TagValue::Str(s)) => entry.codec = s.clone(),
                _ => {}
            }
        }
        Ok(entry)
    }
}

/// A search query: terms plus optional type and size bounds.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Search {
    pub terms: Vec<String>,
    pub file_type: Option<String>,
    pub min_size: u32,
    pub max_size: u32,
}

impl Search {
    /// Encodes the search expression tree: `and` operators precede their
    /// operands, the type parameter uses a 24-bit nemonic, size bounds the
    /// 32-bit min/max nemonics.
    fn encode_expr(&self) -> Vec<u8> {
        const STRING_PARAM: u8 = 0x01;
        const TYPE_PARAM: u8 = 0x02;
        const NUMERIC_PARAM: u8 = 0x03;
        const AND_PARAM: u16 = 0x0000;
        const TYPE_NEMONIC: u32 = 0x030001; // 24-bit field
        const MIN_NEMONIC: u32 = 0x02000101;
        const MAX_NEMONIC: u32 = 0x02000102;

        let mut body = Writer::new();
        let mut params = 0u16;

        let terms = self.terms.join(" ");
        body.u8(STRING_PARAM);
        body.string16(&terms);
        params += 1;

        let ftype = self.file_type.clone().unwrap_or_else(|| "Any".into());
        body.u8(TYPE_PARAM);
        body.string16(&ftype);
        body.bytes(&TYPE_NEMONIC.to_le_bytes()[..3]);

        if self.min_size > 0 {
            body.u8(NUMERIC_PARAM);
            body.u32(self.min_size);
            body.u32(MIN_NEMONIC);
            params += 1;
        }
        if self.max_size > 0 && self.max_size < u32::MAX {
            body.u8(NUMERIC_PARAM);
            body.u32(self.max_size);
            body.u32(MAX_NEMONIC);
            params += 1;
        }

        let mut out = Writer::new();
        for _ in 0..params {
            out.u16(AND_PARAM);
        }
        out.bytes(body.as_bytes());
        out.into_bytes()
    }

    /// Encodes as a TCP `Search` frame.
    #[must_use]
    pub fn to_frame(&self) -> Vec<u8> {
        encode_frame(Proto::Ed2k, OP_SEARCH, &self.encode_expr())
    }

    /// Encodes as a UDP `GlobSearchReq` datagram.
    #[must_use]
    pub fn to_datagram(&self) -> Vec<u8> {
        udp::encode(Proto::Ed2k, OP_GLOBSEARCHREQ, &self.encode_expr())
    }
}

// ---------------------------------------------------------------------------
// client <-> server UDP
// ---------------------------------------------------------------------------

/// Builds a `GlobStatReq` datagram; the challenge's top half is the fixed
/// `0x55aa` marker.
#[must_use]
pub fn glob_stat_req_datagram(challenge: u32) -> Vec<u8> {
    let mut w = Writer::new();
    w.u32(challenge);
    udp::encode(Proto::Ed2k, OP_GLOBSTATREQ, w.as_bytes())
}

/// Builds a `GlobGetSources`/`GlobGetSources2` datagram. With `with_size`
/// each entry carries the 32-bit file size (requires the server's
/// `GetSources2` flag).
#[must_use]
pub fn glob_get_sources_datagram(hashes: &[(Hash16, u32)], with_size: bool) -> Vec<u8> {
    let mut w = Writer::new();
    for (hash, size) in hashes {
        w.hash(hash);
        if with_size {
            w.u32(*size);
        }
    }
    let opcode = if with_size {
        OP_GLOBGETSOURCES2
    } else {
        OP_GLOBGETSOURCES
    };
    udp::encode(Proto::Ed2k, opcode, w.as_bytes())
}

/// `GlobStatRes`: server stats. Only challenge/users/files are mandatory.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GlobStatRes {
    pub challenge: u32,
    pub users: u32,
    pub files: u32,
    pub max_users: u32,
    pub soft_limit: u32,
    pub hard_limit: u32,
    pub udp_flags: u32,
    pub low_id_users: u32,
}

impl GlobStatRes {
    pub fn decode(payload: &[u8]) -> Result<Self, WireError> {
        let mut r = Reader::new(payload);
        let mut out = Self {
            challenge: r.u32()?,
            users: r.u32()?,
            files: r.u32()?,
            ..Self::default()
        };
        // the rest appeared over successive server generations
        if let Ok(v) = r.u32() {
            out.max_users = v;
        }
        if let Ok(v) = r.u32() {
            out.soft_limit = v;
        }
        if let Ok(v) = r.u32() {
            out.hard_limit = v;
        }
        if let Ok(v) = r.u32() {
            out.udp_flags = v;
        }
        if let Ok(v) = r.u32() {
            out.low_id_users = v;
        }
        Ok(out)
    }

    /// Encodes (used by the test fixtures standing in for servers).
    #[must_use]
    pub fn to_datagram(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.u32(self.challenge);
        w.u32(self.users);
        w.u32(self.files);
        w.u32(self.max_users);
        w.u32(self.soft_limit);
        w.u32(self.hard_limit);
        w.u32(self.udp_flags);
        w.u32(self.low_id_users);
        udp::encode(Proto::Ed2k, OP_GLOBSTATRES, w.as_bytes())
    }
}

/// One `GlobFoundSources` answer; several may be concatenated in a single
/// datagram.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GlobFoundSources {
    pub hash: Hash16,
    pub sources: Vec<(u32, u16)>,
}

impl GlobFoundSources {
    fn read_one(r: &mut Reader<'_>) -> Result<Self, WireError> {
        let hash = r.hash()?;
        let count = r.u8()?;
        let mut sources = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let id = r.u32()?;
            let port = r.u16()?;
            sources.push((id, port));
        }
        Ok(Self { hash, sources })
    }

    /// Parses a datagram payload that may hold several answers separated
    /// by repeated `proto | opcode` headers.
    pub fn decode_concatenated(payload: &[u8]) -> Result<Vec<Self>, WireError> {
        let mut r = Reader::new(payload);
        let mut out = vec![Self::read_one(&mut r)?];
        while r.remaining() >= 2 {
            let proto = r.u8()?;
            let opcode = r.u8()?;
            if proto != Proto::Ed2k.byte() || opcode != OP_GLOBFOUNDSOURCES {
                break; // trailing noise, ignore
            }
            out.push(Self::read_one(&mut r)?);
        }
        Ok(out)
    }

    /// Encodes one answer as a datagram (test fixtures).
    #[must_use]
    pub fn to_datagram(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.hash(&self.hash);
        w.u8(self.sources.len() as u8);
        for (id, port) in &self.sources {
            w.u32(*id);
            w.u16(*port);
        }
        udp::encode(Proto::Ed2k, OP_GLOBFOUNDSOURCES, w.as_bytes())
    }
}

// ---------------------------------------------------------------------------
// frame dispatch enums
// ---------------------------------------------------------------------------

/// Every packet a peer session understands.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClientMessage {
    Hello(Hello),
    HelloAnswer(Hello),
    MuleInfo(MuleInfo),
    MuleInfoAnswer(MuleInfo),
    ReqFile(ReqFile),
    FileName(FileName),
    FileDesc(FileDesc),
    SetReqFileId(Hash16),
    FileStatus(FileStatus),
    NoFile(Hash16),
    ReqHashSet(Hash16),
    HashSet(HashSetPacket),
    StartUploadReq(Option<Hash16>),
    AcceptUploadReq,
    QueueRanking(u32),
    MuleQueueRank(u16),
    ReqChunks(ReqChunks),
    DataChunk(DataChunk),
    PackedChunk(PackedChunk),
    CancelTransfer,
    SourceExchReq(Hash16),
    AnswerSources(AnswerSources),
    Message(String),
    ChangeId { old: u32, new: u32 },
    SecIdentState(SecIdentState),
    PublicKey(Vec<u8>),
    Signature(Signature),
    PortTest,
}

impl ClientMessage {
    /// Decodes a TCP frame from a peer. `src_exch_swap` applies the
    /// SrcExch v3 id swap to `AnswerSources`.
    pub fn decode(frame: &Frame, src_exch_swap: bool) -> Result<Self, WireError> {
        let p = &frame.payload;
        let msg = match (frame.proto, frame.opcode) {
            (Proto::Emule, OP_MULEINFO) => Self::MuleInfo(MuleInfo::decode(p)?),
            (Proto::Emule, OP_MULEINFOANSWER) => Self::MuleInfoAnswer(MuleInfo::decode(p)?),
            (_, OP_HELLO) => Self::Hello(Hello::decode(p, true)?),
            (_, OP_HELLOANSWER) => Self::HelloAnswer(Hello::decode(p, false)?),
            (_, OP_REQFILE) => Self::ReqFile(ReqFile::decode(p)?),
            (_, OP_FILENAME) => Self::FileName(FileName::decode(p)?),
            (_, OP_FILEDESC) => Self::FileDesc(FileDesc::decode(p)?),
            (_, OP_SETREQFILEID) => Self::SetReqFileId(Reader::new(p).hash()?),
            (_, OP_REQFILE_STATUS) => Self::FileStatus(FileStatus::decode(p)?),
            (_, OP_REQFILE_NOFILE) => Self::NoFile(Reader::new(p).hash()?),
            (_, OP_REQHASHSET) => Self::ReqHashSet(Reader::new(p).hash()?),
            (_, OP_HASHSET) => Self::HashSet(HashSetPacket::decode(p)?),
            (_, OP_STARTUPLOADREQ) => {
                let mut r = Reader::new(p);
                Self::StartUploadReq(r.hash().ok())
            }
            (_, OP_ACCEPTUPLOADREQ) => Self::AcceptUploadReq,
            (_, OP_QUEUERANKING) => Self::QueueRanking(Reader::new(p).u32()?),
            (Proto::Emule, OP_MULEQUEUERANK) => {
                // eMule enforces exactly 12 payload bytes here
                if p.len() != 12 {
                    return Err(WireError::Malformed("mule queue rank must be 12 bytes"));
                }
                Self::MuleQueueRank(Reader::new(p).u16()?)
            }
            (_, OP_REQCHUNKS) => Self::ReqChunks(ReqChunks::decode(p)?),
            (_, OP_SENDINGCHUNK) => Self::DataChunk(DataChunk::decode(p)?),
            (Proto::Emule, OP_PACKEDCHUNK) => Self::PackedChunk(PackedChunk::decode(p)?),
            (_, OP_CANCELTRANSFER) => Self::CancelTransfer,
            (_, OP_REQSOURCES) => Self::SourceExchReq(Reader::new(p).hash()?),
            (_, OP_ANSWERSOURCES) => {
                Self::AnswerSources(AnswerSources::decode(p, src_exch_swap)?)
            }
            (_, OP_MESSAGE) => Self::Message(Reader::new(p).string16()?),
            (_, OP_CHANGEID) => {
                let mut r = Reader::new(p);
                Self::ChangeId {
                    old: r.u32()?,
                    new: r.u32()?,
                }
            }
            (Proto::Emule, OP_SECIDENTSTATE) => {
                Self::SecIdentState(SecIdentState::decode(p)?)
            }
            (Proto::Emule, OP_PUBLICKEY) => Self::PublicKey(decode_public_key(p)?),
            (Proto::Emule, OP_SIGNATURE) => Self::Signature(Signature::decode(p)?),
            (_, OP_PORTTEST) => Self::PortTest,
            (proto, opcode) => {
                tracing::debug!(
                    target: "ed2k",
                    proto = proto.byte(),
                    opcode,
                    "unknown client packet"
                );
                return Err(WireError::Malformed("unknown client opcode"));
            }
        };
        Ok(msg)
    }
}

/// Every TCP packet the server session understands.
#[derive(Clone, Debug, PartialEq)]
pub enum ServerTcpMessage {
    Message(String),
    Status { users: u32, files: u32 },
    IdChange(IdChange),
    ServerList(ServerListPacket),
    ServerIdent(ServerIdent),
    SearchResult(SearchResultPacket),
    CallbackReq(CallbackReq),
    CallbackFail,
    FoundSources(FoundSources),
}

impl ServerTcpMessage {
    /// Decodes a TCP frame from the connected server.
    pub fn decode(frame: &Frame) -> Result<Self, WireError> {
        let p = &frame.payload;
        let msg = match frame.opcode {
            OP_SERVERMESSAGE => Self::Message(Reader::new(p).string16()?),
            OP_SERVERSTATUS => {
                let mut r = Reader::new(p);
                Self::Status {
                    users: r.u32()?,
                    files: r.u32()?,
                }
            }
            OP_IDCHANGE => Self::IdChange(IdChange::decode(p)?),
            OP_SERVERLIST => Self::ServerList(ServerListPacket::decode(p)?),
            OP_SERVERIDENT => Self::ServerIdent(ServerIdent::decode(p)?),
            OP_SEARCHRESULT => Self::SearchResult(SearchResultPacket::decode(p)?),
            OP_CBREQUESTED => Self::CallbackReq(CallbackReq::decode(p)?),
            OP_CALLBACKFAIL => Self::CallbackFail,
            OP_FOUNDSOURCES => Self::FoundSources(FoundSources::decode(p)?),
            opcode => {
                tracing::debug!(target: "ed2k", opcode, "unknown server packet");
                return Err(WireError::Malformed("unknown server opcode"));
            }
        };
        Ok(msg)
    }
}

/// Every UDP datagram the engine understands.
#[derive(Clone, Debug, PartialEq)]
pub enum UdpMessage {
    ReaskFilePing(ReaskFilePing),
    ReaskAck(ReaskAck),
    FileNotFound,
    QueueFull,
    GlobStatRes(GlobStatRes),
    GlobFoundSources(Vec<GlobFoundSources>),
    GlobSearchRes(SearchResultPacket),
    PortTest,
}

impl UdpMessage {
    /// Decodes one datagram.
    pub fn decode(datagram: &[u8]) -> Result<Self, WireError> {
        let (_proto, opcode, payload) = udp::decode(datagram)?;
        let msg = match opcode {
            OP_REASKFILEPING => Self::ReaskFilePing(ReaskFilePing::decode(payload)?),
            OP_REASKACK => Self::ReaskAck(ReaskAck::decode(payload)?),
            OP_FILENOTFOUND => Self::FileNotFound,
            OP_QUEUEFULL => Self::QueueFull,
            OP_GLOBSTATRES => Self::GlobStatRes(GlobStatRes::decode(payload)?),
            OP_GLOBFOUNDSOURCES => {
                Self::GlobFoundSources(GlobFoundSources::decode_concatenated(payload)?)
            }
            OP_GLOBSEARCHRES => Self::GlobSearchRes(SearchResultPacket::decode(payload)?),
            OP_PORTTEST => Self::PortTest,
            opcode => {
                tracing::debug!(target: "ed2k", opcode, "unknown datagram");
                return Err(WireError::Malformed("unknown udp opcode"));
            }
        };
        Ok(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wire::FrameReader;

    fn hash(seed: u8) -> Hash16 {
        [seed; 16]
    }

    fn ident() -> Identity {
        Identity {
            user_hash: hash(0xaa),
            nick: "hydranode".into(),
            tcp_port: 4662,
            udp_port: 4672,
            id: 0x01020304,
        }
    }

    fn frame_of(bytes: &[u8]) -> Frame {
        let mut rd = FrameReader::new();
        rd.feed(bytes);
        rd.next_frame().expect("valid frame").expect("one frame")
    }

    #[test]
    fn part_map_round_trips_odd_lengths() {
        for count in [0usize, 1, 7, 8, 9, 16, 37] {
            let bits: Vec<bool> = (0..count).map(|i| i % 3 == 0).collect();
            let mut w = Writer::new();
            write_part_map(&mut w, &bits);
            let bytes = w.into_bytes();
            let mut r = Reader::new(&bytes);
            assert_eq!(read_part_map(&mut r).unwrap(), bits, "count {count}");
            assert!(r.is_empty());
        }
    }

    #[test]
    fn hello_round_trips() {
        let hello = Hello::ours(&ident(), Some((0x55667788, 4661)));
        let frame = frame_of(&hello.to_hello_frame());
        assert_eq!(frame.opcode, OP_HELLO);
        match ClientMessage::decode(&frame, false).unwrap() {
            ClientMessage::Hello(h) => assert_eq!(h, hello),
            other => panic!("wrong decode {other:?}"),
        }
    }

    #[test]
    fn hello_answer_lacks_hash_length_byte() {
        let hello = Hello::ours(&ident(), None);
        let hello_frame = hello.to_hello_frame();
        let answer_frame = hello.to_answer_frame();
        // answer payload is exactly one byte shorter
        assert_eq!(hello_frame.len(), answer_frame.len() + 1);

        let frame = frame_of(&answer_frame);
        match ClientMessage::decode(&frame, false).unwrap() {
            ClientMessage::HelloAnswer(h) => {
                let mut expected = hello;
                expected.server = Some((0, 0));
                assert_eq!(h, expected);
            }
            other => panic!("wrong decode {other:?}"),
        }
    }

    #[test]
    fn mule_info_round_trips() {
        let info = MuleInfo::ours(&ident());
        let frame = frame_of(&info.to_info_frame());
        match ClientMessage::decode(&frame, false).unwrap() {
            ClientMessage::MuleInfo(i) => assert_eq!(i, info),
            other => panic!("wrong decode {other:?}"),
        }
    }

    #[test]
    fn req_file_extended_fields_round_trip() {
        let req = ReqFile {
            hash: hash(1),
            part_map: vec![true, false, true],
            src_count: 7,
        };
        let frame = frame_of(&req.to_frame());
        assert_eq!(ReqFile::decode(&frame.payload).unwrap(), req);
    }

    #[test]
    fn req_file_tolerates_bare_hash() {
        let bare = hash(2);
        let decoded = ReqFile::decode(&bare).unwrap();
        assert_eq!(decoded.hash, bare);
        assert!(decoded.part_map.is_empty());
    }

    #[test]
    fn file_status_empty_map_means_whole_file() {
        let status = FileStatus {
            hash: hash(3),
            part_map: Vec::new(),
        };
        let frame = frame_of(&status.to_frame());
        assert_eq!(FileStatus::decode(&frame.payload).unwrap(), status);
    }

    #[test]
    fn req_chunks_converts_exclusive_ends() {
        let req = ReqChunks {
            hash: hash(4),
            ranges: vec![Range::new(0, 9999), Range::new(180_000, 359_999)],
        };
        let frame = frame_of(&req.to_frame());
        let mut r = Reader::new(&frame.payload);
        r.skip(16).unwrap();
        assert_eq!(r.u32().unwrap(), 0); // begin 0
        assert_eq!(r.u32().unwrap(), 180_000);
        assert_eq!(r.u32().unwrap(), 0); // unused slot begin
        assert_eq!(r.u32().unwrap(), 10_000); // exclusive end
        assert_eq!(r.u32().unwrap(), 360_000);
        assert_eq!(r.u32().unwrap(), 0); // unused slot end

        assert_eq!(ReqChunks::decode(&frame.payload).unwrap(), req);
    }

    #[test]
    fn req_chunks_rejects_inverted_range() {
        let mut w = Writer::new();
        w.hash(&hash(5));
        for v in [10u32, 0, 0, 5, 0, 0] {
            w.u32(v);
        }
        assert!(ReqChunks::decode(w.as_bytes()).is_err());
    }

    #[test]
    fn data_chunk_length_must_match() {
        let chunk = DataChunk {
            hash: hash(6),
            begin: 100,
            end: 110,
            data: vec![9u8; 10],
        };
        let frame = frame_of(&chunk.to_frame());
        assert_eq!(DataChunk::decode(&frame.payload).unwrap(), chunk);

        let mut w = Writer::new();
        w.hash(&hash(6)).u32(100).u32(110).bytes(&[1, 2, 3]);
        assert!(DataChunk::decode(w.as_bytes()).is_err());
    }

    #[test]
    fn packed_chunk_keeps_fragment_and_total() {
        let packed = PackedChunk {
            hash: hash(7),
            begin: 0,
            packed_total: 123_456,
            data: vec![1, 2, 3, 4],
        };
        let frame = frame_of(&packed.to_frame());
        assert_eq!(PackedChunk::decode(&frame.payload).unwrap(), packed);
    }

    #[test]
    fn mule_queue_rank_enforces_length() {
        let mut w = Writer::new();
        w.u16(12).u16(0).u32(0).u32(0);
        let frame = Frame {
            proto: Proto::Emule,
            opcode: OP_MULEQUEUERANK,
            payload: w.into_bytes(),
        };
        assert_eq!(
            ClientMessage::decode(&frame, false).unwrap(),
            ClientMessage::MuleQueueRank(12)
        );

        let short = Frame {
            proto: Proto::Emule,
            opcode: OP_MULEQUEUERANK,
            payload: vec![1, 0],
        };
        assert!(ClientMessage::decode(&short, false).is_err());
    }

    #[test]
    fn answer_sources_v3_swaps_ids() {
        let answer = AnswerSources {
            hash: hash(8),
            sources: vec![SourceEntry {
                id: 0x01020304,
                port: 4662,
                server_ip: 0x0a0b0c0d,
                server_port: 4661,
            }],
            swap_ids: true,
        };
        let frame = frame_of(&answer.to_frame());
        let decoded = AnswerSources::decode(&frame.payload, true).unwrap();
        assert_eq!(decoded.sources[0].id, 0x01020304);

        // a v1 reader sees the swapped value
        let raw = AnswerSources::decode(&frame.payload, false).unwrap();
        assert_eq!(raw.sources[0].id, 0x04030201);
    }

    #[test]
    fn answer_sources_skips_v2_user_hash() {
        // count 1, item length 28 (6 + 6 + 16-byte hash)
        let mut w = Writer::new();
        w.hash(&hash(9));
        w.u16(1);
        w.u32(0x11223344);
        w.u16(4662);
        w.u32(0x55667788);
        w.u16(4661);
        w.hash(&hash(0xee)); // v2 user hash
        let decoded = AnswerSources::decode(w.as_bytes(), false).unwrap();
        assert_eq!(decoded.sources.len(), 1);
        assert_eq!(decoded.sources[0].id, 0x11223344);
        assert_eq!(decoded.sources[0].server_port, 4661);
    }

    #[test]
    fn answer_sources_rejects_pathological_count() {
        let mut w = Writer::new();
        w.hash(&hash(9));
        w.u16(1000); // claims 1000 entries in 6 bytes
        w.u32(1);
        w.u16(2);
        assert!(AnswerSources::decode(w.as_bytes(), false).is_err());
    }

    #[test]
    fn signature_optional_ip_type() {
        let with = Signature {
            sign: vec![1, 2, 3],
            ip_type: IP_REMOTE,
        };
        let frame = frame_of(&with.to_frame());
        assert_eq!(Signature::decode(&frame.payload).unwrap(), with);

        let without = Signature {
            sign: vec![4, 5],
            ip_type: IP_NONE,
        };
        let frame = frame_of(&without.to_frame());
        assert_eq!(Signature::decode(&frame.payload).unwrap(), without);
    }

    #[test]
    fn reask_ping_layout_depends_on_udp_version() {
        let ping = ReaskFilePing {
            hash: hash(10),
            part_map: vec![true, true, false],
            src_count: 5,
        };
        // v4: partmap before source count
        let v4 = ping.to_datagram(4);
        let (_, opcode, payload) = udp::decode(&v4).unwrap();
        assert_eq!(opcode, OP_REASKFILEPING);
        assert_eq!(ReaskFilePing::decode(payload).unwrap(), ping);

        // v3: no partmap
        let v3 = ping.to_datagram(3);
        let (_, _, payload) = udp::decode(&v3).unwrap();
        let decoded = ReaskFilePing::decode(payload).unwrap();
        assert!(decoded.part_map.is_empty());
        assert_eq!(decoded.src_count, 5);

        // v2: bare hash
        let v2 = ping.to_datagram(2);
        let (_, _, payload) = udp::decode(&v2).unwrap();
        let decoded = ReaskFilePing::decode(payload).unwrap();
        assert_eq!(decoded.hash, ping.hash);
        assert_eq!(decoded.src_count, 0);
    }

    #[test]
    fn reask_ack_round_trips() {
        let ack = ReaskAck {
            part_map: vec![true; 12],
            qr: 42,
        };
        let v4 = ack.to_datagram(4);
        let (_, opcode, payload) = udp::decode(&v4).unwrap();
        assert_eq!(opcode, OP_REASKACK);
        assert_eq!(ReaskAck::decode(payload).unwrap(), ack);

        let v3 = ack.to_datagram(3);
        let (_, _, payload) = udp::decode(&v3).unwrap();
        let decoded = ReaskAck::decode(payload).unwrap();
        assert!(decoded.part_map.is_empty());
        assert_eq!(decoded.qr, 42);
    }

    #[test]
    fn login_request_carries_identity_tags() {
        let frame = frame_of(&login_request_frame(&ident()));
        assert_eq!(frame.opcode, OP_LOGINREQUEST);
        let mut r = Reader::new(&frame.payload);
        assert_eq!(r.hash().unwrap(), hash(0xaa));
        assert_eq!(r.u32().unwrap(), 0);
        assert_eq!(r.u16().unwrap(), 4662);
        let tags = Tag::read_list(&mut r).unwrap();
        assert_eq!(tags.len(), 5);
    }

    #[test]
    fn id_change_optional_flags() {
        let with_flags = IdChange::decode(&{
            let mut w = Writer::new();
            w.u32(0x0100_0001).u32(FL_ZLIB);
            w.into_bytes()
        })
        .unwrap();
        assert_eq!(with_flags.id, 0x0100_0001);
        assert_eq!(with_flags.flags, FL_ZLIB);

        let without = IdChange::decode(&0x42u32.to_le_bytes()).unwrap();
        assert_eq!(without.id, 0x42);
        assert_eq!(without.flags, 0);
    }

    #[test]
    fn offer_files_compresses_for_zlib_servers() {
        let files: Vec<OfferedFile> = (0..40)
            .map(|i| OfferedFile {
                hash: hash(i),
                id: FL_PARTIAL_ID,
                port: FL_PARTIAL_PORT,
                name: format!("file-{i:03}.iso"),
                size: 1 << 20,
                file_type: Some("Pro".into()),
            })
            .collect();
        let plain = offer_files_frame(&files, false);
        let packed = offer_files_frame(&files, true);
        assert_eq!(plain[0], Proto::Ed2k.byte());
        assert_eq!(packed[0], Proto::Zlib.byte());
        assert!(packed.len() < plain.len());

        // both inflate to the same payload
        let frame = frame_of(&packed);
        let plain_frame = frame_of(&plain);
        assert_eq!(frame.payload, plain_frame.payload);
    }

    #[test]
    fn glob_get_sources_respects_size_flag() {
        let entries = vec![(hash(1), 1000u32), (hash(2), 2000)];
        let without = glob_get_sources_datagram(&entries, false);
        let with = glob_get_sources_datagram(&entries, true);
        assert_eq!(without.len(), 2 + 32);
        assert_eq!(with.len(), 2 + 32 + 8);
        assert_eq!(without[1], OP_GLOBGETSOURCES);
        assert_eq!(with[1], OP_GLOBGETSOURCES2);
    }

    #[test]
    fn glob_stat_res_tolerates_short_payload() {
        let mut w = Writer::new();
        w.u32(0x55aa_1234).u32(100).u32(200);
        let stats = GlobStatRes::decode(w.as_bytes()).unwrap();
        assert_eq!(stats.challenge, 0x55aa_1234);
        assert_eq!(stats.users, 100);
        assert_eq!(stats.udp_flags, 0);
    }

    #[test]
    fn glob_found_sources_concatenated_parse() {
        let a = GlobFoundSources {
            hash: hash(1),
            sources: vec![(0x0a000001, 4662)],
        };
        let b = GlobFoundSources {
            hash: hash(2),
            sources: vec![(0x0a000002, 4663), (0x0a000003, 4664)],
        };
        let mut datagram = a.to_datagram();
        datagram.extend_from_slice(&b.to_datagram());

        match UdpMessage::decode(&datagram).unwrap() {
            UdpMessage::GlobFoundSources(list) => {
                assert_eq!(list, vec![a, b]);
            }
            other => panic!("wrong decode {other:?}"),
        }
    }

    #[test]
    fn search_expression_layout() {
        let search = Search {
            terms: vec!["one".into(), "two".into()],
            file_type: None,
            min_size: 1 << 20,
            max_size: 0,
        };
        let frame = frame_of(&search.to_frame());
        let p = &frame.payload;
        // two and-operators precede the operands
        assert_eq!(&p[..4], &[0, 0, 0, 0]);
        // then the string parameter with both terms joined
        assert_eq!(p[4], 0x01);
        assert_eq!(&p[7..14], b"one two");
    }

    #[test]
    fn server_message_decode() {
        let mut w = Writer::new();
        w.string16("WARNING : server full");
        let frame = Frame {
            proto: Proto::Ed2k,
            opcode: OP_SERVERMESSAGE,
            payload: w.into_bytes(),
        };
        assert_eq!(
            ServerTcpMessage::decode(&frame).unwrap(),
            ServerTcpMessage::Message("WARNING : server full".into())
        );
    }

    #[test]
    fn found_sources_counts_low_ids() {
        let mut w = Writer::new();
        w.hash(&hash(4));
        w.u8(3);
        for (id, port) in [(0x100u32, 1u16), (0x0100_0000, 2), (0xff, 3)] {
            w.u32(id);
            w.u16(port);
        }
        let found = FoundSources::decode(w.as_bytes()).unwrap();
        assert_eq!(found.sources.len(), 3);
        assert_eq!(found.low_id_count(), 2);
    }

    #[test]
    fn unknown_opcode_is_rejected() {
        let frame = Frame {
            proto: Proto::Ed2k,
            opcode: 0xde,
            payload: Vec::new(),
        };
        assert!(ClientMessage::decode(&frame, false).is_err());
        assert!(ServerTcpMessage::decode(&frame).is_err());
    }
}
