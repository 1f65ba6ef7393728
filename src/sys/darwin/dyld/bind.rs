//! Dyld Bind/Rebase Opcode Interpreters
//!
//! This module runs the LC_DYLD_INFO rebase and bind opcode streams, which
//! encode pointer fixups in a compact opcode-based format (the "compressed"
//! format in Apple's terminology). Each control byte packs an opcode in the
//! high nibble and an immediate in the low nibble.
//!
//! The interpreters do not touch memory themselves: every fixup is handed to
//! a [`RebaseHandler`] or [`BindHandler`], and the loader decides how to apply it.

use super::leb128::ByteCursor;
use super::{DyldError, Segment};
use crate::Result;
use tracing::trace;

pub const POINTER_SIZE: u64 = 8;

pub const REBASE_TYPE_POINTER: u8 = 1;
pub const REBASE_TYPE_TEXT_ABSOLUTE32: u8 = 2;

pub const BIND_TYPE_POINTER: u8 = 1;
pub const BIND_TYPE_TEXT_ABSOLUTE32: u8 = 2;
pub const BIND_TYPE_TEXT_PCREL32: u8 = 3;

pub const BIND_SPECIAL_DYLIB_SELF: i64 = 0;
pub const BIND_SPECIAL_DYLIB_MAIN_EXECUTABLE: i64 = -1;
pub const BIND_SPECIAL_DYLIB_FLAT_LOOKUP: i64 = -2;

pub const BIND_SYMBOL_FLAGS_WEAK_IMPORT: u8 = 0x1;

const OPCODE_MASK: u8 = 0xF0;
const IMMEDIATE_MASK: u8 = 0x0F;

/// Rebase opcodes, decoded from the high nibble of a control byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebaseOpcode {
    Done,
    SetTypeImm,
    SetSegmentAndOffsetUleb,
    AddAddrUleb,
    AddAddrImmScaled,
    DoRebaseImmTimes,
    DoRebaseUlebTimes,
    DoRebaseAddAddrUleb,
    DoRebaseUlebTimesSkippingUleb,
}

impl RebaseOpcode {
    pub fn decode(byte: u8) -> Option<(Self, u8)> {
        let opcode = match byte & OPCODE_MASK {
            0x00 => Self::Done,
            0x10 => Self::SetTypeImm,
            0x20 => Self::SetSegmentAndOffsetUleb,
            0x30 => Self::AddAddrUleb,
            0x40 => Self::AddAddrImmScaled,
            0x50 => Self::DoRebaseImmTimes,
            0x60 => Self::DoRebaseUlebTimes,
            0x70 => Self::DoRebaseAddAddrUleb,
            0x80 => Self::DoRebaseUlebTimesSkippingUleb,
            _ => return None,
        };
        Some((opcode, byte & IMMEDIATE_MASK))
    }
}

/// Bind opcodes, decoded from the high nibble of a control byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindOpcode {
    Done,
    SetDylibOrdinalImm,
    SetDylibOrdinalUleb,
    SetDylibSpecialImm,
    SetSymbolTrailingFlagsImm,
    SetTypeImm,
    SetAddendSleb,
    SetSegmentAndOffsetUleb,
    AddAddrUleb,
    DoBind,
    DoBindAddAddrUleb,
    DoBindAddAddrImmScaled,
    DoBindUlebTimesSkippingUleb,
}

impl BindOpcode {
    pub fn decode(byte: u8) -> Option<(Self, u8)> {
        let opcode = match byte & OPCODE_MASK {
            0x00 => Self::Done,
            0x10 => Self::SetDylibOrdinalImm,
            0x20 => Self::SetDylibOrdinalUleb,
            0x30 => Self::SetDylibSpecialImm,
            0x40 => Self::SetSymbolTrailingFlagsImm,
            0x50 => Self::SetTypeImm,
            0x60 => Self::SetAddendSleb,
            0x70 => Self::SetSegmentAndOffsetUleb,
            0x80 => Self::AddAddrUleb,
            0x90 => Self::DoBind,
            0xA0 => Self::DoBindAddAddrUleb,
            0xB0 => Self::DoBindAddAddrImmScaled,
            0xC0 => Self::DoBindUlebTimesSkippingUleb,
            _ => return None,
        };
        Some((opcode, byte & IMMEDIATE_MASK))
    }
}

/// Receives every pointer location the rebase stream names.
pub trait RebaseHandler {
    fn rebase(&mut self, address: u64, slide: u64, rebase_type: u8) -> Result<()>;
}

impl<F> RebaseHandler for F
where
    F: FnMut(u64, u64, u8) -> Result<()>,
{
    fn rebase(&mut self, address: u64, slide: u64, rebase_type: u8) -> Result<()> {
        self(address, slide, rebase_type)
    }
}

/// One binding action produced by the bind stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindAction<'a> {
    pub address: u64,
    pub bind_type: u8,
    pub symbol_name: &'a str,
    pub symbol_flags: u8,
    pub addend: i64,
    pub library_ordinal: i64,
}

/// Receives every binding action the bind stream names.
pub trait BindHandler {
    fn bind(&mut self, action: &BindAction<'_>) -> Result<()>;
}

impl<F> BindHandler for F
where
    F: FnMut(&BindAction<'_>) -> Result<()>,
{
    fn bind(&mut self, action: &BindAction<'_>) -> Result<()> {
        self(action)
    }
}

/// Which of the LC_DYLD_INFO bind streams is being interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindStream {
    /// `bind_off`: `DONE` ends the stream.
    Eager,
    /// `lazy_bind_off`: every entry ends with `DONE`, so it only separates entries.
    Lazy,
}

#[derive(Debug, Default)]
struct RebaseState {
    rebase_type: u8,
    address: u64,
    segment_start: u64,
    segment_end: u64,
}

impl RebaseState {
    fn select_segment(&mut self, segments: &[Segment], index: u8, offset: u64) -> Result<()> {
        let segment = segment_at(segments, index)?;
        self.segment_start = segment.vmaddr;
        self.segment_end = segment.end()?;
        self.address = segment.vmaddr.wrapping_add(offset);
        Ok(())
    }

    fn fire(&mut self, handler: &mut impl RebaseHandler, slide: u64) -> Result<()> {
        if self.address < self.segment_start || self.address >= self.segment_end {
            return Err(DyldError::AddressOutOfSegment {
                address: self.address,
                start: self.segment_start,
                end: self.segment_end,
            }
            .into());
        }
        handler.rebase(self.address, slide, self.rebase_type)
    }
}

#[derive(Debug)]
struct BindState<'a> {
    library_ordinal: i64,
    symbol_name: &'a [u8],
    symbol_flags: u8,
    bind_type: u8,
    addend: i64,
    address: u64,
    segment_start: u64,
    segment_end: u64,
}

impl<'a> BindState<'a> {
    fn new() -> Self {
        Self {
            library_ordinal: 0,
            symbol_name: &[],
            symbol_flags: 0,
            bind_type: BIND_TYPE_POINTER,
            addend: 0,
            address: 0,
            segment_start: 0,
            segment_end: 0,
        }
    }

    fn select_segment(&mut self, segments: &[Segment], index: u8, offset: u64) -> Result<()> {
        let segment = segment_at(segments, index)?;
        self.segment_start = segment.vmaddr;
        self.segment_end = segment.end()?;
        self.address = segment.vmaddr.wrapping_add(offset);
        Ok(())
    }

    fn fire(&self, handler: &mut impl BindHandler, name_offset: usize) -> Result<()> {
        if self.address < self.segment_start || self.address >= self.segment_end {
            return Err(DyldError::AddressOutOfSegment {
                address: self.address,
                start: self.segment_start,
                end: self.segment_end,
            }
            .into());
        }
        let symbol_name = std::str::from_utf8(self.symbol_name)
            .map_err(|_| DyldError::InvalidSymbolName { offset: name_offset })?;
        handler.bind(&BindAction {
            address: self.address,
            bind_type: self.bind_type,
            symbol_name,
            symbol_flags: self.symbol_flags,
            addend: self.addend,
            library_ordinal: self.library_ordinal,
        })
    }
}

fn segment_at(segments: &[Segment], index: u8) -> Result<&Segment> {
    segments.get(index as usize).ok_or_else(|| {
        DyldError::SegmentIndexOutOfRange {
            index: index as usize,
            count: segments.len(),
        }
        .into()
    })
}

/// Interprets a rebase opcode stream, invoking `handler` for every pointer
/// that must be slid by `slide`.
pub fn run_rebase_opcodes(
    opcodes: &[u8],
    segments: &[Segment],
    slide: u64,
    handler: &mut impl RebaseHandler,
) -> Result<()> {
    let mut cursor = ByteCursor::new(opcodes);
    let mut state = RebaseState {
        rebase_type: REBASE_TYPE_POINTER,
        ..Default::default()
    };

    while !cursor.is_at_end() {
        let offset = cursor.pos();
        let byte = cursor.read_u8()?;
        let (opcode, immediate) =
            RebaseOpcode::decode(byte).ok_or(DyldError::UnknownRebaseOpcode { opcode: byte, offset })?;
        trace!("rebase opcode {:?} (imm {}) at {}", opcode, immediate, offset);

        match opcode {
            RebaseOpcode::Done => break,
            RebaseOpcode::SetTypeImm => {
                state.rebase_type = immediate;
            }
            RebaseOpcode::SetSegmentAndOffsetUleb => {
                let seg_offset = cursor.read_uleb128()?;
                state.select_segment(segments, immediate, seg_offset)?;
            }
            RebaseOpcode::AddAddrUleb => {
                state.address = state.address.wrapping_add(cursor.read_uleb128()?);
            }
            RebaseOpcode::AddAddrImmScaled => {
                state.address = state
                    .address
                    .wrapping_add(u64::from(immediate) * POINTER_SIZE);
            }
            RebaseOpcode::DoRebaseImmTimes => {
                for _ in 0..immediate {
                    state.fire(handler, slide)?;
                    state.address = state.address.wrapping_add(POINTER_SIZE);
                }
            }
            RebaseOpcode::DoRebaseUlebTimes => {
                let count = cursor.read_uleb128()?;
                for _ in 0..count {
                    state.fire(handler, slide)?;
                    state.address = state.address.wrapping_add(POINTER_SIZE);
                }
            }
            RebaseOpcode::DoRebaseAddAddrUleb => {
                state.fire(handler, slide)?;
                let skip = cursor.read_uleb128()?;
                state.address = state
                    .address
                    .wrapping_add(skip)
                    .wrapping_add(POINTER_SIZE);
            }
            RebaseOpcode::DoRebaseUlebTimesSkippingUleb => {
                let count = cursor.read_uleb128()?;
                let skip = cursor.read_uleb128()?;
                for _ in 0..count {
                    state.fire(handler, slide)?;
                    state.address = state
                        .address
                        .wrapping_add(skip)
                        .wrapping_add(POINTER_SIZE);
                }
            }
        }
    }
    Ok(())
}

/// Interprets a bind opcode stream, invoking `handler` for every binding.
pub fn run_bind_opcodes(
    opcodes: &[u8],
    segments: &[Segment],
    stream: BindStream,
    handler: &mut impl BindHandler,
) -> Result<()> {
    let mut cursor = ByteCursor::new(opcodes);
    let mut state = BindState::new();
    let mut name_offset = 0;

    while !cursor.is_at_end() {
        let offset = cursor.pos();
        let byte = cursor.read_u8()?;
        let (opcode, immediate) =
            BindOpcode::decode(byte).ok_or(DyldError::UnknownBindOpcode { opcode: byte, offset })?;
        trace!("bind opcode {:?} (imm {}) at {}", opcode, immediate, offset);

        match opcode {
            BindOpcode::Done => {
                if stream == BindStream::Eager {
                    break;
                }
            }
            BindOpcode::SetDylibOrdinalImm => {
                state.library_ordinal = i64::from(immediate);
            }
            BindOpcode::SetDylibOrdinalUleb => {
                state.library_ordinal = cursor.read_uleb128()? as i64;
            }
            BindOpcode::SetDylibSpecialImm => {
                // Special ordinals are the sign-extended immediate: 0, -1, -2, -3.
                state.library_ordinal = if immediate == 0 {
                    0
                } else {
                    i64::from((OPCODE_MASK | immediate) as i8)
                };
            }
            BindOpcode::SetSymbolTrailingFlagsImm => {
                state.symbol_flags = immediate;
                name_offset = cursor.pos();
                state.symbol_name = cursor.read_cstr()?;
            }
            BindOpcode::SetTypeImm => {
                state.bind_type = immediate;
            }
            BindOpcode::SetAddendSleb => {
                state.addend = cursor.read_sleb128()?;
            }
            BindOpcode::SetSegmentAndOffsetUleb => {
                let seg_offset = cursor.read_uleb128()?;
                state.select_segment(segments, immediate, seg_offset)?;
            }
            BindOpcode::AddAddrUleb => {
                state.address = state.address.wrapping_add(cursor.read_uleb128()?);
            }
            BindOpcode::DoBind => {
                state.fire(handler, name_offset)?;
                state.address = state.address.wrapping_add(POINTER_SIZE);
            }
            BindOpcode::DoBindAddAddrUleb => {
                state.fire(handler, name_offset)?;
                let skip = cursor.read_uleb128()?;
                state.address = state
                    .address
                    .wrapping_add(skip)
                    .wrapping_add(POINTER_SIZE);
            }
            BindOpcode::DoBindAddAddrImmScaled => {
                state.fire(handler, name_offset)?;
                state.address = state
                    .address
                    .wrapping_add(u64::from(immediate) * POINTER_SIZE)
                    .wrapping_add(POINTER_SIZE);
            }
            BindOpcode::DoBindUlebTimesSkippingUleb => {
                let count = cursor.read_uleb128()?;
                let skip = cursor.read_uleb128()?;
                for _ in 0..count {
                    state.fire(handler, name_offset)?;
                    state.address = state
                        .address
                        .wrapping_add(skip)
                        .wrapping_add(POINTER_SIZE);
                }
            }
        }
    }
    Ok(())
}
