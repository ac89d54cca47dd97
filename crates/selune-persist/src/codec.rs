//! Snapshot wire format: primitives, tagged values, record framing.
//!
//! ```text
//! header  : magic | version u8 | flags u8 | bytecode revision u8 | object count varint
//! record* : kind tag u8 | id varint | payload length varint | payload
//! trailer : 0xFF | payload length varint | root payload
//! ```
//!
//! Integers are LEB128 varints unless noted. Fixed-width numbers are
//! little-endian; floats are written as their raw bit pattern.

use crate::error::{Phase, RestoreError};
use selune_core::object::ObjectKind;
use thiserror::Error;

pub const MAGIC: &[u8; 4] = b"\x1bSLS";
pub const VERSION: u8 = 1;

/// Threads were captured with stacks, frames and open upvalues.
pub const FLAG_DEEP_THREADS: u8 = 0x01;
/// The root payload is a single value rather than a runtime root set.
pub const FLAG_SINGLE_VALUE: u8 = 0x02;

/// Marks the end of the record stream.
pub const TRAILER_TAG: u8 = 0xFF;

// Value tags
const VT_NIL: u8 = 0;
const VT_FALSE: u8 = 1;
const VT_TRUE: u8 = 2;
const VT_INT: u8 = 3;
const VT_FLOAT: u8 = 4;
const VT_REF: u8 = 5;

/// A value as it appears on the wire. Objects are `(kind, id)` pairs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WireValue {
    Nil,
    Bool(bool),
    Int(i64),
    /// Raw `f64` bits.
    Float(u64),
    Ref(ObjectKind, u64),
}

// ---------------------------------------------------------------------------
// Encoder
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Clone)]
pub struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_u8(&mut self, b: u8) {
        self.buf.push(b);
    }

    pub fn write_varint(&mut self, mut n: u64) {
        loop {
            let byte = (n & 0x7f) as u8;
            n >>= 7;
            if n == 0 {
                self.buf.push(byte);
                return;
            }
            self.buf.push(byte | 0x80);
        }
    }

    pub fn write_len(&mut self, n: usize) {
        self.write_varint(n as u64);
    }

    pub fn write_u32(&mut self, n: u32) {
        self.buf.extend_from_slice(&n.to_le_bytes());
    }

    pub fn write_i64(&mut self, n: i64) {
        self.buf.extend_from_slice(&n.to_le_bytes());
    }

    pub fn write_f64_bits(&mut self, bits: u64) {
        self.buf.extend_from_slice(&bits.to_le_bytes());
    }

    /// Length-prefixed byte string.
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.write_len(bytes.len());
        self.buf.extend_from_slice(bytes);
    }

    pub fn write_raw(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn write_ref(&mut self, kind: ObjectKind, id: u64) {
        self.write_u8(kind.tag());
        self.write_varint(id);
    }

    pub fn write_value(&mut self, v: WireValue) {
        match v {
            WireValue::Nil => self.write_u8(VT_NIL),
            WireValue::Bool(false) => self.write_u8(VT_FALSE),
            WireValue::Bool(true) => self.write_u8(VT_TRUE),
            WireValue::Int(i) => {
                self.write_u8(VT_INT);
                self.write_i64(i);
            }
            WireValue::Float(bits) => {
                self.write_u8(VT_FLOAT);
                self.write_f64_bits(bits);
            }
            WireValue::Ref(kind, id) => {
                self.write_u8(VT_REF);
                self.write_ref(kind, id);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

// ---------------------------------------------------------------------------
// Decoder
// ---------------------------------------------------------------------------

/// Low-level decode failure. Offsets are absolute within the snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("truncated")]
    Truncated { offset: usize },
    #[error("varint overflows 64 bits")]
    VarintOverflow { offset: usize },
    #[error("bad value tag {tag:#04x}")]
    BadValueTag { offset: usize, tag: u8 },
    #[error("bad object kind tag {tag:#04x}")]
    BadKindTag { offset: usize, tag: u8 },
    /// A count or length larger than the bytes that could back it.
    #[error("length {len} exceeds remaining input")]
    LengthOverflow { offset: usize, len: u64 },
}

impl DecodeError {
    pub fn offset(&self) -> usize {
        match *self {
            DecodeError::Truncated { offset }
            | DecodeError::VarintOverflow { offset }
            | DecodeError::BadValueTag { offset, .. }
            | DecodeError::BadKindTag { offset, .. }
            | DecodeError::LengthOverflow { offset, .. } => offset,
        }
    }

    /// Lift into a restore error with phase context.
    pub fn at(self, phase: Phase) -> RestoreError {
        match self {
            DecodeError::Truncated { offset } => RestoreError::Truncated { offset, phase },
            other => RestoreError::Framing {
                phase,
                offset: other.offset(),
                detail: other.to_string(),
            },
        }
    }
}

pub struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
    /// Absolute offset of `data[0]` within the whole snapshot.
    base: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self::at_offset(data, 0)
    }

    pub fn at_offset(data: &'a [u8], base: usize) -> Self {
        Decoder { data, pos: 0, base }
    }

    /// Absolute offset of the next byte.
    pub fn offset(&self) -> usize {
        self.base + self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn peek_u8(&self) -> Option<u8> {
        self.data.get(self.pos).copied()
    }

    pub fn read_u8(&mut self) -> Result<u8, DecodeError> {
        let b = self.peek_u8().ok_or(DecodeError::Truncated {
            offset: self.offset(),
        })?;
        self.pos += 1;
        Ok(b)
    }

    pub fn read_raw(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if n > self.remaining() {
            return Err(DecodeError::Truncated {
                offset: self.offset(),
            });
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_raw(N)?);
        Ok(out)
    }

    pub fn read_varint(&mut self) -> Result<u64, DecodeError> {
        let start = self.offset();
        let mut n: u64 = 0;
        let mut shift = 0u32;
        loop {
            let b = self.read_u8()?;
            let bits = (b & 0x7f) as u64;
            if shift == 63 && bits > 1 {
                return Err(DecodeError::VarintOverflow { offset: start });
            }
            n |= bits << shift;
            if b & 0x80 == 0 {
                return Ok(n);
            }
            shift += 7;
            if shift > 63 {
                return Err(DecodeError::VarintOverflow { offset: start });
            }
        }
    }

    /// A length or element count. Every element occupies at least one byte,
    /// so a count beyond the remaining input is rejected before allocating.
    pub fn read_len(&mut self) -> Result<usize, DecodeError> {
        let offset = self.offset();
        let n = self.read_varint()?;
        if n > self.remaining() as u64 {
            return Err(DecodeError::LengthOverflow { offset, len: n });
        }
        Ok(n as usize)
    }

    pub fn read_u32(&mut self) -> Result<u32, DecodeError> {
        Ok(u32::from_le_bytes(self.read_array()?))
    }

    pub fn read_i64(&mut self) -> Result<i64, DecodeError> {
        Ok(i64::from_le_bytes(self.read_array()?))
    }

    pub fn read_f64_bits(&mut self) -> Result<u64, DecodeError> {
        Ok(u64::from_le_bytes(self.read_array()?))
    }

    pub fn read_bytes(&mut self) -> Result<&'a [u8], DecodeError> {
        let n = self.read_len()?;
        self.read_raw(n)
    }

    pub fn read_kind(&mut self) -> Result<ObjectKind, DecodeError> {
        let offset = self.offset();
        let tag = self.read_u8()?;
        ObjectKind::from_tag(tag).ok_or(DecodeError::BadKindTag { offset, tag })
    }

    pub fn read_ref(&mut self) -> Result<(ObjectKind, u64), DecodeError> {
        let kind = self.read_kind()?;
        Ok((kind, self.read_varint()?))
    }

    pub fn read_value(&mut self) -> Result<WireValue, DecodeError> {
        let offset = self.offset();
        match self.read_u8()? {
            VT_NIL => Ok(WireValue::Nil),
            VT_FALSE => Ok(WireValue::Bool(false)),
            VT_TRUE => Ok(WireValue::Bool(true)),
            VT_INT => Ok(WireValue::Int(self.read_i64()?)),
            VT_FLOAT => Ok(WireValue::Float(self.read_f64_bits()?)),
            VT_REF => {
                let (kind, id) = self.read_ref()?;
                Ok(WireValue::Ref(kind, id))
            }
            tag => Err(DecodeError::BadValueTag { offset, tag }),
        }
    }
}

// ---------------------------------------------------------------------------
// Framing
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub flags: u8,
    pub bytecode_revision: u8,
    pub object_count: u64,
}

impl Header {
    pub fn is_deep(&self) -> bool {
        self.flags & FLAG_DEEP_THREADS != 0
    }

    pub fn is_single_value(&self) -> bool {
        self.flags & FLAG_SINGLE_VALUE != 0
    }

    pub fn mode_name(&self) -> &'static str {
        if self.is_single_value() {
            "single-value"
        } else {
            "full-state"
        }
    }

    pub fn write(&self, enc: &mut Encoder) {
        enc.write_raw(MAGIC);
        enc.write_u8(self.version);
        enc.write_u8(self.flags);
        enc.write_u8(self.bytecode_revision);
        enc.write_varint(self.object_count);
    }

    pub fn read(dec: &mut Decoder<'_>) -> Result<Header, RestoreError> {
        let magic = dec.read_raw(MAGIC.len()).map_err(|e| e.at(Phase::Header))?;
        if magic != MAGIC {
            return Err(RestoreError::BadMagic);
        }
        let version = dec.read_u8().map_err(|e| e.at(Phase::Header))?;
        if version != VERSION {
            return Err(RestoreError::UnsupportedVersion(version));
        }
        let flags = dec.read_u8().map_err(|e| e.at(Phase::Header))?;
        let offset = dec.offset() - 1;
        if flags & !(FLAG_DEEP_THREADS | FLAG_SINGLE_VALUE) != 0 {
            return Err(RestoreError::Framing {
                phase: Phase::Header,
                offset,
                detail: format!("unknown flags {flags:#04x}"),
            });
        }
        let bytecode_revision = dec.read_u8().map_err(|e| e.at(Phase::Header))?;
        let object_count = dec.read_varint().map_err(|e| e.at(Phase::Header))?;
        Ok(Header {
            version,
            flags,
            bytecode_revision,
            object_count,
        })
    }
}

/// One object record, payload still encoded.
#[derive(Clone, Copy, Debug)]
pub struct RawRecord<'a> {
    pub kind: ObjectKind,
    pub id: u64,
    /// Absolute offset of the payload.
    pub offset: usize,
    pub payload: &'a [u8],
}

/// A snapshot split into header, records and root payload.
#[derive(Debug)]
pub struct Frame<'a> {
    pub header: Header,
    pub records: Vec<RawRecord<'a>>,
    pub roots_offset: usize,
    pub roots: &'a [u8],
}

pub fn write_record(enc: &mut Encoder, kind: ObjectKind, id: u64, payload: &[u8]) {
    enc.write_u8(kind.tag());
    enc.write_varint(id);
    enc.write_bytes(payload);
}

pub fn write_trailer(enc: &mut Encoder, roots: &[u8]) {
    enc.write_u8(TRAILER_TAG);
    enc.write_bytes(roots);
}

/// Split a snapshot into its parts without interpreting any payload.
pub fn read_frame(bytes: &[u8]) -> Result<Frame<'_>, RestoreError> {
    let mut dec = Decoder::new(bytes);
    let header = Header::read(&mut dec)?;

    let cap = usize::try_from(header.object_count)
        .unwrap_or(usize::MAX)
        .min(dec.remaining());
    let mut records = Vec::with_capacity(cap);
    loop {
        let offset = dec.offset();
        let tag = dec.read_u8().map_err(|e| e.at(Phase::Allocate))?;
        if tag == TRAILER_TAG {
            break;
        }
        let kind = ObjectKind::from_tag(tag).ok_or_else(|| DecodeError::BadKindTag { offset, tag }.at(Phase::Allocate))?;
        let id = dec.read_varint().map_err(|e| e.at(Phase::Allocate))?;
        let len = dec.read_len().map_err(|e| e.at(Phase::Allocate))?;
        let payload_offset = dec.offset();
        let payload = dec.read_raw(len).map_err(|e| e.at(Phase::Allocate))?;
        records.push(RawRecord {
            kind,
            id,
            offset: payload_offset,
            payload,
        });
    }

    let len = dec.read_len().map_err(|e| e.at(Phase::Roots))?;
    let roots_offset = dec.offset();
    let roots = dec.read_raw(len).map_err(|e| e.at(Phase::Roots))?;
    if !dec.is_empty() {
        return Err(RestoreError::Framing {
            phase: Phase::Roots,
            offset: dec.offset(),
            detail: format!("{} trailing bytes", dec.remaining()),
        });
    }

    if records.len() as u64 != header.object_count {
        return Err(RestoreError::CountMismatch {
            declared: header.object_count,
            found: records.len() as u64,
        });
    }

    Ok(Frame {
        header,
        records,
        roots_offset,
        roots,
    })
}
