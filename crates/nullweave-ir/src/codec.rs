//! Byte-level primitives for the unit format: a cursor-style reader, an
//! append-only writer, and the error type shared by every decode path.

use thiserror::Error;

/// Any way a unit's binary form can be rejected.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FormatError {
    #[error("bad magic number")]
    BadMagic,
    #[error("unsupported format version {0}")]
    UnsupportedVersion(u16),
    #[error("unexpected end of input at offset {0}")]
    UnexpectedEof(usize),
    #[error("invalid varint encoding at offset {0}")]
    InvalidVarint(usize),
    #[error("invalid UTF-8 in string at offset {0}")]
    InvalidUtf8(usize),
    #[error("string index {0} out of range")]
    BadStringIndex(u32),
    #[error("unknown opcode 0x{opcode:02x} at body offset {offset}")]
    UnknownOpcode { opcode: u8, offset: usize },
    #[error("branch target {0} is not an instruction boundary")]
    BadBranchTarget(u32),
    #[error("malformed signature descriptor `{0}`")]
    BadDescriptor(String),
}

/// Sequential reader over a byte slice. All reads advance the cursor and
/// fail with the offset at which input ran out.
pub(crate) struct Reader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, offset: 0 }
    }

    pub(crate) fn offset(&self) -> usize {
        self.offset
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.offset >= self.bytes.len()
    }

    pub(crate) fn read_u8(&mut self) -> Result<u8, FormatError> {
        let b = *self
            .bytes
            .get(self.offset)
            .ok_or(FormatError::UnexpectedEof(self.offset))?;
        self.offset += 1;
        Ok(b)
    }

    pub(crate) fn read_u16_le(&mut self) -> Result<u16, FormatError> {
        let lo = self.read_u8()?;
        let hi = self.read_u8()?;
        Ok(u16::from_le_bytes([lo, hi]))
    }

    pub(crate) fn read_u32_le(&mut self) -> Result<u32, FormatError> {
        let start = self.offset;
        let end = start
            .checked_add(4)
            .filter(|&e| e <= self.bytes.len())
            .ok_or(FormatError::UnexpectedEof(start))?;
        let mut buf = [0u8; 4];
        buf.copy_from_slice(&self.bytes[start..end]);
        self.offset = end;
        Ok(u32::from_le_bytes(buf))
    }

    /// Unsigned LEB128, at most ten bytes for a u64.
    pub(crate) fn read_uleb(&mut self) -> Result<u64, FormatError> {
        let start = self.offset;
        let mut value: u64 = 0;
        let mut shift = 0u32;
        loop {
            let byte = self.read_u8()?;
            if shift >= 64 || (shift == 63 && byte > 1) {
                return Err(FormatError::InvalidVarint(start));
            }
            value |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
        }
    }

    pub(crate) fn read_uleb_u32(&mut self) -> Result<u32, FormatError> {
        let start = self.offset;
        let v = self.read_uleb()?;
        u32::try_from(v).map_err(|_| FormatError::InvalidVarint(start))
    }

    /// Signed LEB128, sign-extended from the final byte.
    pub(crate) fn read_sleb(&mut self) -> Result<i64, FormatError> {
        let start = self.offset;
        let mut value: i64 = 0;
        let mut shift = 0u32;
        loop {
            let byte = self.read_u8()?;
            if shift >= 64 {
                return Err(FormatError::InvalidVarint(start));
            }
            value |= i64::from(byte & 0x7f) << shift;
            shift += 7;
            if byte & 0x80 == 0 {
                if shift < 64 && byte & 0x40 != 0 {
                    value |= -1i64 << shift;
                }
                return Ok(value);
            }
        }
    }

    pub(crate) fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], FormatError> {
        let start = self.offset;
        let end = start
            .checked_add(len)
            .filter(|&e| e <= self.bytes.len())
            .ok_or(FormatError::UnexpectedEof(start))?;
        self.offset = end;
        Ok(&self.bytes[start..end])
    }

    /// Length-prefixed UTF-8 string.
    pub(crate) fn read_str(&mut self) -> Result<&'a str, FormatError> {
        let len = self.read_uleb_u32()? as usize;
        let start = self.offset;
        let raw = self.read_bytes(len)?;
        std::str::from_utf8(raw).map_err(|_| FormatError::InvalidUtf8(start))
    }
}

/// Append-only writer mirroring [`Reader`]. Writes never fail.
#[derive(Default)]
pub(crate) struct Writer {
    bytes: Vec<u8>,
}

impl Writer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn len(&self) -> usize {
        self.bytes.len()
    }

    pub(crate) fn into_vec(self) -> Vec<u8> {
        self.bytes
    }

    pub(crate) fn write_u8(&mut self, v: u8) {
        self.bytes.push(v);
    }

    pub(crate) fn write_u16_le(&mut self, v: u16) {
        self.bytes.extend_from_slice(&v.to_le_bytes());
    }

    pub(crate) fn write_u32_le(&mut self, v: u32) {
        self.bytes.extend_from_slice(&v.to_le_bytes());
    }

    /// Overwrite four bytes written earlier, used for branch fixups.
    pub(crate) fn patch_u32_le(&mut self, at: usize, v: u32) {
        self.bytes[at..at + 4].copy_from_slice(&v.to_le_bytes());
    }

    pub(crate) fn write_uleb(&mut self, mut v: u64) {
        loop {
            let mut byte = (v & 0x7f) as u8;
            v >>= 7;
            if v != 0 {
                byte |= 0x80;
            }
            self.bytes.push(byte);
            if v == 0 {
                return;
            }
        }
    }

    pub(crate) fn write_sleb(&mut self, mut v: i64) {
        loop {
            let byte = (v & 0x7f) as u8;
            v >>= 7;
            let done = (v == 0 && byte & 0x40 == 0) || (v == -1 && byte & 0x40 != 0);
            self.bytes.push(if done { byte } else { byte | 0x80 });
            if done {
                return;
            }
        }
    }

    pub(crate) fn write_bytes(&mut self, b: &[u8]) {
        self.bytes.extend_from_slice(b);
    }

    pub(crate) fn write_str(&mut self, s: &str) {
        self.write_uleb(s.len() as u64);
        self.bytes.extend_from_slice(s.as_bytes());
    }
}
