//! LEB128 decoding over link-edit byte streams.
//!
//! Every dyld byte-code stream (rebase, bind, export trie) encodes offsets,
//! counts and addends as little-endian base-128 integers. [`ByteCursor`]
//! walks such a stream and keeps the read position explicit so interpreters
//! can report where a malformed value starts.

use super::DyldError;

/// A forward-only reader over a dyld byte stream.
#[derive(Debug, Clone)]
pub struct ByteCursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteCursor<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Creates a cursor positioned at `pos` within `data`.
    pub fn at(data: &'a [u8], pos: usize) -> Self {
        Self { data, pos }
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn is_at_end(&self) -> bool {
        self.pos >= self.data.len()
    }

    pub fn read_u8(&mut self) -> Result<u8, DyldError> {
        let byte = *self
            .data
            .get(self.pos)
            .ok_or(DyldError::UnexpectedEnd { offset: self.pos })?;
        self.pos += 1;
        Ok(byte)
    }

    /// Decodes an unsigned LEB128 value.
    ///
    /// Groups beyond the 64th bit are dropped rather than rejected, so
    /// over-long encodings still decode to their low 64 bits.
    pub fn read_uleb128(&mut self) -> Result<u64, DyldError> {
        let start = self.pos;
        let mut result: u64 = 0;
        let mut bit = 0u32;
        loop {
            let byte = *self
                .data
                .get(self.pos)
                .ok_or(DyldError::MalformedLeb128 { offset: start })?;
            self.pos += 1;
            let slice = u64::from(byte & 0x7f);
            if bit < 64 {
                result |= slice << bit;
                bit += 7;
            }
            if byte & 0x80 == 0 {
                return Ok(result);
            }
        }
    }

    /// Decodes a signed LEB128 value, sign-extending from the last group.
    pub fn read_sleb128(&mut self) -> Result<i64, DyldError> {
        let start = self.pos;
        let mut result: i64 = 0;
        let mut bit = 0u32;
        loop {
            let byte = *self
                .data
                .get(self.pos)
                .ok_or(DyldError::MalformedLeb128 { offset: start })?;
            self.pos += 1;
            if bit < 64 {
                result |= i64::from(byte & 0x7f) << bit;
            }
            bit += 7;
            if byte & 0x80 == 0 {
                if byte & 0x40 != 0 && bit < 64 {
                    result |= -1i64 << bit;
                }
                return Ok(result);
            }
        }
    }

    /// Reads a NUL-terminated byte string, leaving the cursor past the NUL.
    pub fn read_cstr(&mut self) -> Result<&'a [u8], DyldError> {
        let rest = self
            .data
            .get(self.pos..)
            .ok_or(DyldError::UnexpectedEnd { offset: self.pos })?;
        let len = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or(DyldError::UnterminatedString { offset: self.pos })?;
        self.pos += len + 1;
        Ok(&rest[..len])
    }
}

/// Decodes an unsigned LEB128 value at `start`, returning the value and the
/// number of bytes consumed.
pub fn read_uleb128(data: &[u8], start: usize) -> Result<(u64, usize), DyldError> {
    let mut cursor = ByteCursor::at(data, start);
    let value = cursor.read_uleb128()?;
    Ok((value, cursor.pos() - start))
}

/// Decodes a signed LEB128 value at `start`, returning the value and the
/// number of bytes consumed.
pub fn read_sleb128(data: &[u8], start: usize) -> Result<(i64, usize), DyldError> {
    let mut cursor = ByteCursor::at(data, start);
    let value = cursor.read_sleb128()?;
    Ok((value, cursor.pos() - start))
}
