//! eDonkey2000 tagged values.
//!
//! A tag is `u8 type | u16 namelen | name | value`; tag lists are prefixed
//! with a `u32` count. Almost every tag on the wire uses a single-byte name
//! (the tag "opcode"), but a few legacy clients send full string names, so
//! both forms are kept. Tags with a known type but an unrecognised name
//! decode fine and are simply ignored by the caller; an unknown *type* byte
//! is unrecoverable because the value length cannot be derived.

use crate::io::{Reader, Writer};
use crate::{Hash16, WireError};

const TT_HASH: u8 = 0x01;
const TT_STRING: u8 = 0x02;
const TT_U32: u8 = 0x03;
const TT_FLOAT: u8 = 0x04;
const TT_BOOL: u8 = 0x05;
const TT_U16: u8 = 0x08;
const TT_U8: u8 = 0x09;
const TT_U64: u8 = 0x0b;

/// Tag name: the common single-byte opcode, or a legacy string name.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TagName {
    /// One-byte tag opcode (`CT_*` / `ST_*` constants).
    Code(u8),
    /// Full string name sent by legacy clients.
    Name(String),
}

impl TagName {
    /// The opcode, when the name is the single-byte form.
    #[must_use]
    pub const fn code(&self) -> Option<u8> {
        match self {
            Self::Code(c) => Some(*c),
            Self::Name(_) => None,
        }
    }
}

/// Typed tag payload.
#[derive(Clone, Debug, PartialEq)]
pub enum TagValue {
    /// Unsigned integer, stored in the narrowest wire type that fits.
    U8(u8),
    /// 16-bit unsigned integer.
    U16(u16),
    /// 32-bit unsigned integer.
    U32(u32),
    /// 64-bit unsigned integer.
    U64(u64),
    /// Length-prefixed string.
    Str(String),
    /// 16-byte hash.
    Hash(Hash16),
    /// 32-bit float (search results carry these).
    Float(f32),
    /// Boolean flag.
    Bool(bool),
}

impl TagValue {
    /// The value widened to u64, when it is numeric.
    #[must_use]
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Self::U8(v) => Some(u64::from(*v)),
            Self::U16(v) => Some(u64::from(*v)),
            Self::U32(v) => Some(u64::from(*v)),
            Self::U64(v) => Some(*v),
            Self::Bool(v) => Some(u64::from(*v)),
            _ => None,
        }
    }

    /// The string payload, when present.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }
}

/// A named, typed value in a tag list.
#[derive(Clone, Debug, PartialEq)]
pub struct Tag {
    /// Tag name (opcode or legacy string).
    pub name: TagName,
    /// Tag payload.
    pub value: TagValue,
}

impl Tag {
    /// Convenience constructor for the common opcode-named form.
    #[must_use]
    pub const fn new(code: u8, value: TagValue) -> Self {
        Self {
            name: TagName::Code(code),
            value,
        }
    }

    /// Opcode-named u32 tag.
    #[must_use]
    pub const fn u32(code: u8, v: u32) -> Self {
        Self::new(code, TagValue::U32(v))
    }

    /// Opcode-named u16 tag.
    #[must_use]
    pub const fn u16(code: u8, v: u16) -> Self {
        Self::new(code, TagValue::U16(v))
    }

    /// Opcode-named u8 tag.
    #[must_use]
    pub const fn u8(code: u8, v: u8) -> Self {
        Self::new(code, TagValue::U8(v))
    }

    /// Opcode-named string tag.
    #[must_use]
    pub fn string(code: u8, s: impl Into<String>) -> Self {
        Self::new(code, TagValue::Str(s.into()))
    }

    /// The tag opcode, if the single-byte form.
    #[must_use]
    pub const fn code(&self) -> Option<u8> {
        self.name.code()
    }

    /// Numeric payload widened to u64.
    #[must_use]
    pub fn value_u64(&self) -> Option<u64> {
        self.value.as_u64()
    }

    /// Reads one tag from `r`.
    pub fn read(r: &mut Reader<'_>) -> Result<Self, WireError> {
        let tag_type = r.u8()?;
        let name_len = r.u16()? as usize;
        let name = if name_len == 1 {
            TagName::Code(r.u8()?)
        } else {
            let raw = r.bytes(name_len)?;
            TagName::Name(String::from_utf8_lossy(raw).into_owned())
        };
        let value = match tag_type {
            TT_U8 => TagValue::U8(r.u8()?),
            TT_U16 => TagValue::U16(r.u16()?),
            TT_U32 => TagValue::U32(r.u32()?),
            TT_U64 => TagValue::U64(r.u64()?),
            TT_STRING => TagValue::Str(r.string16()?),
            TT_HASH => TagValue::Hash(r.hash()?),
            TT_FLOAT => TagValue::Float(f32::from_le_bytes(
                r.bytes(4)?.try_into().unwrap(),
            )),
            TT_BOOL => TagValue::Bool(r.u8()? != 0),
            other => return Err(WireError::UnknownTagType(other)),
        };
        Ok(Self { name, value })
    }

    /// Writes the tag to `w`.
    pub fn write(&self, w: &mut Writer) {
        let tag_type = match &self.value {
            TagValue::U8(_) => TT_U8,
            TagValue::U16(_) => TT_U16,
            TagValue::U32(_) => TT_U32,
            TagValue::U64(_) => TT_U64,
            TagValue::Str(_) => TT_STRING,
            TagValue::Hash(_) => TT_HASH,
            TagValue::Float(_) => TT_FLOAT,
            TagValue::Bool(_) => TT_BOOL,
        };
        w.u8(tag_type);
        match &self.name {
            TagName::Code(c) => {
                w.u16(1);
                w.u8(*c);
            }
            TagName::Name(s) => {
                w.string16(s);
            }
        }
        match &self.value {
            TagValue::U8(v) => {
                w.u8(*v);
            }
            TagValue::U16(v) => {
                w.u16(*v);
            }
            TagValue::U32(v) => {
                w.u32(*v);
            }
            TagValue::U64(v) => {
                w.u64(*v);
            }
            TagValue::Str(s) => {
                w.string16(s);
            }
            TagValue::Hash(h) => {
                w.hash(h);
            }
            TagValue::Float(v) => {
                w.bytes(&v.to_le_bytes());
            }
            TagValue::Bool(v) => {
                w.u8(u8::from(*v));
            }
        }
    }

    /// Reads a `u32 count`-prefixed tag list.
    pub fn read_list(r: &mut Reader<'_>) -> Result<Vec<Self>, WireError> {
        let count = r.u32()?;
        let mut tags = Vec::new();
        for _ in 0..count {
            if r.is_empty() {
                break;
            }
            tags.push(Self::read(r)?);
        }
        Ok(tags)
    }

    /// Writes a `u32 count`-prefixed tag list.
    pub fn write_list(tags: &[Self], w: &mut Writer) {
        w.u32(tags.len() as u32);
        for t in tags {
            t.write(w);
        }
    }
}
