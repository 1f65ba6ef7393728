//! Mach-O binary format structures and constants.
//!
//! This module contains the on-disk structures of 64-bit Mach-O images and a
//! load-command scanner that turns the raw command list into a
//! [`LoadCommands`] summary. Nothing here touches the emulated address space;
//! the loader does the mapping.

#![allow(non_camel_case_types)]

use super::MachError;
use crate::ObjectFormatError;
use goblin::mach::{cputype::CPU_TYPE_ARM64, fat::FAT_MAGIC, header};
use tracing::{trace, warn};

// Load command types
pub const LC_REQ_DYLD: u32 = 0x80000000;
pub const LC_SYMTAB: u32 = 0x2;
pub const LC_DYSYMTAB: u32 = 0xb;
pub const LC_LOAD_DYLIB: u32 = 0xc;
pub const LC_ID_DYLIB: u32 = 0xd;
pub const LC_LOAD_WEAK_DYLIB: u32 = 0x18 | LC_REQ_DYLD;
pub const LC_SEGMENT_64: u32 = 0x19;
pub const LC_ROUTINES_64: u32 = 0x1a;
pub const LC_REEXPORT_DYLIB: u32 = 0x1f | LC_REQ_DYLD;
pub const LC_LAZY_LOAD_DYLIB: u32 = 0x20;
pub const LC_DYLD_INFO: u32 = 0x22;
pub const LC_DYLD_INFO_ONLY: u32 = 0x22 | LC_REQ_DYLD;
pub const LC_LOAD_UPWARD_DYLIB: u32 = 0x23 | LC_REQ_DYLD;
pub const LC_MAIN: u32 = 0x28 | LC_REQ_DYLD;
pub const LC_DYLD_EXPORTS_TRIE: u32 = 0x33 | LC_REQ_DYLD;
pub const LC_DYLD_CHAINED_FIXUPS: u32 = 0x34 | LC_REQ_DYLD;

// Section types (low byte of section_64::flags)
pub const SECTION_TYPE_MASK: u32 = 0x000000ff;
pub const S_ZEROFILL: u32 = 0x1;
pub const S_NON_LAZY_SYMBOL_POINTERS: u32 = 0x6;
pub const S_LAZY_SYMBOL_POINTERS: u32 = 0x7;
pub const S_SYMBOL_STUBS: u32 = 0x8;
pub const S_MOD_INIT_FUNC_POINTERS: u32 = 0x9;
pub const S_GB_ZEROFILL: u32 = 0xc;
pub const S_THREAD_LOCAL_ZEROFILL: u32 = 0x12;
pub const S_INIT_FUNC_OFFSETS: u32 = 0x16;

// nlist_64::n_type bits
pub const N_STAB: u8 = 0xe0;
pub const N_PEXT: u8 = 0x10;
pub const N_TYPE: u8 = 0x0e;
pub const N_EXT: u8 = 0x01;
pub const N_UNDF: u8 = 0x0;
pub const N_ABS: u8 = 0x2;
pub const N_SECT: u8 = 0xe;
pub const N_INDR: u8 = 0xa;

pub const INDIRECT_SYMBOL_LOCAL: u32 = 0x80000000;
pub const INDIRECT_SYMBOL_ABS: u32 = 0x40000000;

/// Mach-O 64-bit header
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct mach_header_64 {
    pub magic: u32,
    pub cputype: u32,
    pub cpusubtype: u32,
    pub filetype: u32,
    pub ncmds: u32,
    pub sizeofcmds: u32,
    pub flags: u32,
    pub reserved: u32,
}

/// Generic load command header
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct load_command {
    pub cmd: u32,
    pub cmdsize: u32,
}

/// 64-bit segment load command
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct segment_command_64 {
    pub cmd: u32,
    pub cmdsize: u32,
    pub segname: [u8; 16],
    pub vmaddr: u64,
    pub vmsize: u64,
    pub fileoff: u64,
    pub filesize: u64,
    pub maxprot: u32,
    pub initprot: u32,
    pub nsects: u32,
    pub flags: u32,
}

/// 64-bit section within a segment
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct section_64 {
    pub sectname: [u8; 16],
    pub segname: [u8; 16],
    pub addr: u64,
    pub size: u64,
    pub offset: u32,
    pub align: u32,
    pub reloff: u32,
    pub nreloc: u32,
    pub flags: u32,
    pub reserved1: u32,
    pub reserved2: u32,
    pub reserved3: u32,
}

/// Symbol table load command (LC_SYMTAB)
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct symtab_command {
    pub cmd: u32,
    pub cmdsize: u32,
    pub symoff: u32,
    pub nsyms: u32,
    pub stroff: u32,
    pub strsize: u32,
}

/// Dynamic symbol table load command (LC_DYSYMTAB)
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct dysymtab_command {
    pub cmd: u32,
    pub cmdsize: u32,
    pub ilocalsym: u32,
    pub nlocalsym: u32,
    pub iextdefsym: u32,
    pub nextdefsym: u32,
    pub iundefsym: u32,
    pub nundefsym: u32,
    pub tocoff: u32,
    pub ntoc: u32,
    pub modtaboff: u32,
    pub nmodtab: u32,
    pub extrefsymoff: u32,
    pub nextrefsyms: u32,
    pub indirectsymoff: u32,
    pub nindirectsyms: u32,
    pub extreloff: u32,
    pub nextrel: u32,
    pub locreloff: u32,
    pub nlocrel: u32,
}

/// Symbol table entry
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct nlist_64 {
    pub n_strx: u32,
    pub n_type: u8,
    pub n_sect: u8,
    pub n_desc: u16,
    pub n_value: u64,
}

/// Entry point load command (LC_MAIN)
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct entry_point_command {
    pub cmd: u32,
    pub cmdsize: u32,
    pub entryoff: u64,
    pub stacksize: u64,
}

/// Dynamic library load command (LC_LOAD_DYLIB and friends)
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct dylib_command {
    pub cmd: u32,
    pub cmdsize: u32,
    pub dylib_name_offset: u32,
    pub timestamp: u32,
    pub current_version: u32,
    pub compatibility_version: u32,
}

/// Image initializer load command (LC_ROUTINES_64)
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct routines_command_64 {
    pub cmd: u32,
    pub cmdsize: u32,
    pub init_address: u64,
    pub init_module: u64,
    pub reserved: [u64; 6],
}

/// LinkEdit data command (LC_DYLD_EXPORTS_TRIE, LC_FUNCTION_STARTS, etc.)
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct linkedit_data_command {
    pub cmd: u32,
    pub cmdsize: u32,
    pub dataoff: u32,
    pub datasize: u32,
}

/// Dynamic linker info command (LC_DYLD_INFO_ONLY)
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct dyld_info_command {
    pub cmd: u32,
    pub cmdsize: u32,
    pub rebase_off: u32,
    pub rebase_size: u32,
    pub bind_off: u32,
    pub bind_size: u32,
    pub weak_bind_off: u32,
    pub weak_bind_size: u32,
    pub lazy_bind_off: u32,
    pub lazy_bind_size: u32,
    pub export_off: u32,
    pub export_size: u32,
}

/// Plain-old-data structures that may be read from arbitrary bytes.
///
/// # Safety
///
/// Implementors must be `repr(C)` and valid for every bit pattern.
pub unsafe trait Pod: Copy {}

unsafe impl Pod for mach_header_64 {}
unsafe impl Pod for load_command {}
unsafe impl Pod for segment_command_64 {}
unsafe impl Pod for section_64 {}
unsafe impl Pod for symtab_command {}
unsafe impl Pod for dysymtab_command {}
unsafe impl Pod for nlist_64 {}
unsafe impl Pod for entry_point_command {}
unsafe impl Pod for dylib_command {}
unsafe impl Pod for routines_command_64 {}
unsafe impl Pod for linkedit_data_command {}
unsafe impl Pod for dyld_info_command {}

/// Reads a `T` at `offset`, failing if it would run past the end of `data`.
pub fn read_struct<T: Pod>(data: &[u8], offset: usize) -> Result<T, MachError> {
    let size = std::mem::size_of::<T>();
    match offset.checked_add(size) {
        Some(end) if end <= data.len() => {}
        _ => {
            return Err(MachError::Truncated {
                offset,
                size,
                len: data.len(),
            });
        }
    }
    // SAFETY: bounds checked above and `T: Pod` accepts any bit pattern.
    Ok(unsafe { std::ptr::read_unaligned(data.as_ptr().add(offset) as *const T) })
}

/// Converts a fixed-size, NUL-padded name field into a string.
pub fn fixed_name(raw: &[u8; 16]) -> String {
    let len = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..len]).into_owned()
}

/// Validates the image header: little-endian 64-bit ARM64 executable or dylib.
pub fn parse_header(data: &[u8]) -> Result<mach_header_64, ObjectFormatError> {
    // goblin peeks the magic big-endian, so a little-endian image reads as CIGAM.
    match goblin::mach::peek(data, 0)? {
        header::MH_CIGAM_64 => {}
        FAT_MAGIC => return Err(ObjectFormatError::FatBinary),
        header::MH_MAGIC | header::MH_CIGAM => {
            return Err(ObjectFormatError::UnsupportedLayout("32-bit"));
        }
        header::MH_MAGIC_64 => return Err(ObjectFormatError::UnsupportedLayout("big-endian")),
        _ => return Err(ObjectFormatError::InvalidFormat),
    }
    let mh: mach_header_64 = read_struct(data, 0)?;
    if mh.cputype != CPU_TYPE_ARM64 {
        return Err(ObjectFormatError::UnsupportedCpuType(mh.cputype));
    }
    match mh.filetype {
        header::MH_EXECUTE | header::MH_DYLIB => Ok(mh),
        other => Err(ObjectFormatError::UnsupportedFileType(other)),
    }
}

/// How a dependent library is declared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DylibKind {
    Load,
    Weak,
    ReExport,
    Lazy,
    Upward,
}

impl DylibKind {
    fn from_cmd(cmd: u32) -> Option<Self> {
        match cmd {
            LC_LOAD_DYLIB => Some(Self::Load),
            LC_LOAD_WEAK_DYLIB => Some(Self::Weak),
            LC_REEXPORT_DYLIB => Some(Self::ReExport),
            LC_LAZY_LOAD_DYLIB => Some(Self::Lazy),
            LC_LOAD_UPWARD_DYLIB => Some(Self::Upward),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DylibCommand {
    pub kind: DylibKind,
    pub path: String,
}

#[derive(Debug, Clone)]
pub struct SegmentCommand {
    pub command: segment_command_64,
    pub sections: Vec<section_64>,
}

/// Everything the loader needs from one image's load commands, in file order.
#[derive(Debug, Clone)]
pub struct LoadCommands {
    pub header: mach_header_64,
    pub segments: Vec<SegmentCommand>,
    pub symtab: Option<symtab_command>,
    pub dysymtab: Option<dysymtab_command>,
    pub dyld_info: Option<dyld_info_command>,
    pub exports_trie: Option<linkedit_data_command>,
    pub entry_point: Option<entry_point_command>,
    pub routines: Option<routines_command_64>,
    pub dylibs: Vec<DylibCommand>,
}

impl LoadCommands {
    pub fn parse(data: &[u8]) -> Result<Self, ObjectFormatError> {
        let header = parse_header(data)?;
        let mut commands = LoadCommands {
            header,
            segments: Vec::new(),
            symtab: None,
            dysymtab: None,
            dyld_info: None,
            exports_trie: None,
            entry_point: None,
            routines: None,
            dylibs: Vec::new(),
        };

        let mut offset = std::mem::size_of::<mach_header_64>();
        for _ in 0..header.ncmds {
            let lc: load_command = read_struct(data, offset)?;
            if (lc.cmdsize as usize) < std::mem::size_of::<load_command>() {
                return Err(MachError::BadCommandSize {
                    offset,
                    cmdsize: lc.cmdsize,
                }
                .into());
            }
            trace!("load command 0x{:x} at {} ({} bytes)", lc.cmd, offset, lc.cmdsize);
            match lc.cmd {
                LC_SEGMENT_64 => {
                    let command: segment_command_64 = read_struct(data, offset)?;
                    let mut sections = Vec::with_capacity(command.nsects as usize);
                    let mut sect_offset = offset + std::mem::size_of::<segment_command_64>();
                    for _ in 0..command.nsects {
                        sections.push(read_struct::<section_64>(data, sect_offset)?);
                        sect_offset += std::mem::size_of::<section_64>();
                    }
                    check_segment_extent(&command, &sections)?;
                    commands.segments.push(SegmentCommand { command, sections });
                }
                LC_SYMTAB => commands.symtab = Some(read_struct(data, offset)?),
                LC_DYSYMTAB => commands.dysymtab = Some(read_struct(data, offset)?),
                LC_DYLD_INFO | LC_DYLD_INFO_ONLY => {
                    commands.dyld_info = Some(read_struct(data, offset)?);
                }
                LC_DYLD_EXPORTS_TRIE => commands.exports_trie = Some(read_struct(data, offset)?),
                LC_MAIN => commands.entry_point = Some(read_struct(data, offset)?),
                LC_ROUTINES_64 => commands.routines = Some(read_struct(data, offset)?),
                LC_DYLD_CHAINED_FIXUPS => {
                    warn!("image uses chained fixups, which are not applied");
                }
                cmd => {
                    if let Some(kind) = DylibKind::from_cmd(cmd) {
                        let path = read_dylib_path(data, offset, lc.cmdsize)?;
                        commands.dylibs.push(DylibCommand { kind, path });
                    }
                }
            }
            offset += lc.cmdsize as usize;
        }
        Ok(commands)
    }
}

/// Rejects segments that wrap the address space and sections that spill
/// out of their segment.
fn check_segment_extent(command: &segment_command_64, sections: &[section_64]) -> Result<(), MachError> {
    let Some(end) = command.vmaddr.checked_add(command.vmsize) else {
        return Err(MachError::SegmentOutOfRange {
            name: fixed_name(&command.segname),
            vmaddr: command.vmaddr,
            vmsize: command.vmsize,
        });
    };
    for section in sections {
        let inside = section
            .addr
            .checked_add(section.size)
            .is_some_and(|section_end| section.addr >= command.vmaddr && section_end <= end);
        if !inside {
            return Err(MachError::SectionOutOfRange {
                segname: fixed_name(&section.segname),
                sectname: fixed_name(&section.sectname),
                addr: section.addr,
                size: section.size,
            });
        }
    }
    Ok(())
}

fn read_dylib_path(data: &[u8], offset: usize, cmdsize: u32) -> Result<String, MachError> {
    let command: dylib_command = read_struct(data, offset)?;
    let start = offset + command.dylib_name_offset as usize;
    let end = offset + cmdsize as usize;
    let raw = data
        .get(start..end.min(data.len()))
        .ok_or(MachError::BadDylibName { offset })?;
    let len = raw
        .iter()
        .position(|&b| b == 0)
        .ok_or(MachError::BadDylibName { offset })?;
    Ok(String::from_utf8_lossy(&raw[..len]).into_owned())
}
