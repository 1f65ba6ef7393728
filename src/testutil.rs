//! Test fixtures: a synthetic Mach-O image builder, a scripted CPU double
//! and scratch directories.

use crate::runtime::{CodeHook, Cpu, InterruptHook, LR, Protection, Reg, StaticMemory};
use crate::sys::darwin::dyld::macho::*;
use crate::{Error, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};

pub const SEGMENT_SIZE: u64 = 0x4000;
/// Offset of `__text` within `__TEXT`.
pub const TEXT_OFFSET: u64 = 0x1000;
pub const MH_EXECUTE: u32 = 0x2;
pub const MH_DYLIB: u32 = 0x6;
const CPU_TYPE_ARM64: u32 = 0x0100_000c;

struct SectionSpec {
    name: String,
    offset: u64,
    size: u64,
    flags: u32,
    reserved1: u32,
    reserved2: u32,
}

struct SymbolSpec {
    name: String,
    n_type: u8,
    n_sect: u8,
    value: u64,
}

/// Builds a minimal ARM64 Mach-O with `__TEXT`, `__DATA` and `__LINKEDIT`
/// segments (indices 0, 1, 2), each `SEGMENT_SIZE` bytes of address space.
pub struct MachOBuilder {
    filetype: u32,
    vmaddr: u64,
    text: Vec<u8>,
    data: Vec<u8>,
    data_sections: Vec<SectionSpec>,
    dylibs: Vec<(u32, String)>,
    symbols: Vec<SymbolSpec>,
    indirect: Vec<u32>,
    rebase: Vec<u8>,
    bind: Vec<u8>,
    lazy_bind: Vec<u8>,
    exports: Vec<u8>,
    entry: Option<u64>,
    routine: Option<u64>,
}

impl MachOBuilder {
    fn new(filetype: u32, vmaddr: u64) -> Self {
        Self {
            filetype,
            vmaddr,
            text: vec![0; 0x100],
            data: Vec::new(),
            data_sections: Vec::new(),
            dylibs: Vec::new(),
            symbols: Vec::new(),
            indirect: Vec::new(),
            rebase: Vec::new(),
            bind: Vec::new(),
            lazy_bind: Vec::new(),
            exports: Vec::new(),
            entry: None,
            routine: None,
        }
    }

    /// Executable linked at the usual `0x1_0000_0000`.
    pub fn executable() -> Self {
        Self::new(MH_EXECUTE, 0x1_0000_0000)
    }

    pub fn dylib(vmaddr: u64) -> Self {
        Self::new(MH_DYLIB, vmaddr)
    }

    pub fn text_address(&self) -> u64 {
        self.vmaddr + TEXT_OFFSET
    }

    pub fn data_address(&self) -> u64 {
        self.vmaddr + SEGMENT_SIZE
    }

    pub fn text(mut self, bytes: &[u8]) -> Self {
        self.text = bytes.to_vec();
        self
    }

    pub fn data(mut self, bytes: &[u8]) -> Self {
        self.data = bytes.to_vec();
        self
    }

    pub fn data_section(mut self, name: &str, offset: u64, size: u64, flags: u32) -> Self {
        self.data_sections.push(SectionSpec {
            name: name.to_string(),
            offset,
            size,
            flags,
            reserved1: 0,
            reserved2: 0,
        });
        self
    }

    /// Adds a symbol-pointer section whose slots map to indirect entries from `first_indirect`.
    pub fn pointer_section(mut self, name: &str, offset: u64, size: u64, flags: u32, first_indirect: u32) -> Self {
        self.data_sections.push(SectionSpec {
            name: name.to_string(),
            offset,
            size,
            flags,
            reserved1: first_indirect,
            reserved2: 0,
        });
        self
    }

    pub fn dependency(mut self, cmd: u32, path: &str) -> Self {
        self.dylibs.push((cmd, path.to_string()));
        self
    }

    /// Defines an external symbol in `__text` at `text_address() + offset`.
    pub fn export_symbol(mut self, name: &str, offset: u64) -> Self {
        let value = self.text_address() + offset;
        self.symbols.push(SymbolSpec {
            name: name.to_string(),
            n_type: N_SECT | N_EXT,
            n_sect: 1,
            value,
        });
        self
    }

    pub fn symbol(mut self, name: &str, n_type: u8, n_sect: u8, value: u64) -> Self {
        self.symbols.push(SymbolSpec {
            name: name.to_string(),
            n_type,
            n_sect,
            value,
        });
        self
    }

    pub fn undefined_symbol(self, name: &str) -> Self {
        self.symbol(name, N_UNDF | N_EXT, 0, 0)
    }

    pub fn indirect_symbols(mut self, indices: &[u32]) -> Self {
        self.indirect = indices.to_vec();
        self
    }

    pub fn rebase(mut self, opcodes: &[u8]) -> Self {
        self.rebase = opcodes.to_vec();
        self
    }

    pub fn bind(mut self, opcodes: &[u8]) -> Self {
        self.bind = opcodes.to_vec();
        self
    }

    pub fn lazy_bind(mut self, opcodes: &[u8]) -> Self {
        self.lazy_bind = opcodes.to_vec();
        self
    }

    pub fn exports(mut self, trie: &[u8]) -> Self {
        self.exports = trie.to_vec();
        self
    }

    pub fn entry(mut self, text_offset: u64) -> Self {
        self.entry = Some(TEXT_OFFSET + text_offset);
        self
    }

    pub fn routine(mut self, text_offset: u64) -> Self {
        self.routine = Some(self.text_address() + text_offset);
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let text_fileoff = 0u64;
        let data_fileoff = SEGMENT_SIZE;
        let linkedit_fileoff = 2 * SEGMENT_SIZE;

        // Link-edit blob: rebase | bind | lazy bind | exports | symtab | indirect | strings
        let mut linkedit = Vec::new();
        let place = |blob: &[u8], align: usize, linkedit: &mut Vec<u8>| -> (u32, u32) {
            while linkedit.len() % align != 0 {
                linkedit.push(0);
            }
            let off = linkedit_fileoff as usize + linkedit.len();
            linkedit.extend_from_slice(blob);
            (off as u32, blob.len() as u32)
        };
        let rebase = place(&self.rebase, 1, &mut linkedit);
        let bind = place(&self.bind, 1, &mut linkedit);
        let lazy_bind = place(&self.lazy_bind, 1, &mut linkedit);
        let exports = place(&self.exports, 1, &mut linkedit);

        let mut strtab = vec![b' ', 0];
        let mut nlists = Vec::new();
        for sym in &self.symbols {
            let strx = strtab.len() as u32;
            strtab.extend_from_slice(sym.name.as_bytes());
            strtab.push(0);
            nlists.extend_from_slice(&strx.to_le_bytes());
            nlists.push(sym.n_type);
            nlists.push(sym.n_sect);
            nlists.extend_from_slice(&0u16.to_le_bytes());
            nlists.extend_from_slice(&sym.value.to_le_bytes());
        }
        let symtab = place(&nlists, 8, &mut linkedit);
        let indirect_bytes: Vec<u8> = self.indirect.iter().flat_map(|i| i.to_le_bytes()).collect();
        let indirect = place(&indirect_bytes, 4, &mut linkedit);
        let strings = place(&strtab, 1, &mut linkedit);
        let linkedit_vmsize = crate::runtime::align_up(linkedit.len().max(1) as u64, SEGMENT_SIZE);

        let mut cmds = Vec::new();
        let mut ncmds = 0u32;

        let text_sect = Section {
            sectname: "__text",
            segname: "__TEXT",
            addr: self.text_address(),
            size: self.text.len() as u64,
            offset: (text_fileoff + TEXT_OFFSET) as u32,
            flags: 0x8000_0400,
            reserved1: 0,
            reserved2: 0,
        };
        push_segment(&mut cmds, "__TEXT", self.vmaddr, SEGMENT_SIZE, text_fileoff, SEGMENT_SIZE, 5, &[text_sect]);
        ncmds += 1;

        let data_sects: Vec<Section<'_>> = self
            .data_sections
            .iter()
            .map(|s| Section {
                sectname: &s.name,
                segname: "__DATA",
                addr: self.data_address() + s.offset,
                size: s.size,
                offset: if s.flags & SECTION_TYPE_MASK == S_ZEROFILL {
                    0
                } else {
                    (data_fileoff + s.offset) as u32
                },
                flags: s.flags,
                reserved1: s.reserved1,
                reserved2: s.reserved2,
            })
            .collect();
        push_segment(&mut cmds, "__DATA", self.data_address(), SEGMENT_SIZE, data_fileoff, SEGMENT_SIZE, 3, &data_sects);
        ncmds += 1;

        push_segment(
            &mut cmds,
            "__LINKEDIT",
            self.vmaddr + 2 * SEGMENT_SIZE,
            linkedit_vmsize,
            linkedit_fileoff,
            linkedit.len() as u64,
            1,
            &[],
        );
        ncmds += 1;

        push_u32s(&mut cmds, &[
            LC_DYLD_INFO_ONLY, 48,
            rebase.0, rebase.1, bind.0, bind.1, 0, 0,
            lazy_bind.0, lazy_bind.1, exports.0, exports.1,
        ]);
        ncmds += 1;

        push_u32s(&mut cmds, &[
            LC_SYMTAB, 24,
            symtab.0, self.symbols.len() as u32, strings.0, strings.1,
        ]);
        ncmds += 1;

        let mut dysymtab = [0u32; 20];
        dysymtab[0] = LC_DYSYMTAB;
        dysymtab[1] = 80;
        dysymtab[14] = indirect.0;
        dysymtab[15] = self.indirect.len() as u32;
        push_u32s(&mut cmds, &dysymtab);
        ncmds += 1;

        if let Some(entryoff) = self.entry {
            push_u32s(&mut cmds, &[LC_MAIN, 24]);
            cmds.extend_from_slice(&entryoff.to_le_bytes());
            cmds.extend_from_slice(&0u64.to_le_bytes());
            ncmds += 1;
        }

        if let Some(init) = self.routine {
            push_u32s(&mut cmds, &[LC_ROUTINES_64, 72]);
            cmds.extend_from_slice(&init.to_le_bytes());
            cmds.extend_from_slice(&[0u8; 56]);
            ncmds += 1;
        }

        for (cmd, path) in &self.dylibs {
            let size = (24 + path.len() + 1).next_multiple_of(8);
            push_u32s(&mut cmds, &[*cmd, size as u32, 24, 2, 0x10000, 0x10000]);
            let mut name = path.as_bytes().to_vec();
            name.resize(size - 24, 0);
            cmds.extend_from_slice(&name);
            ncmds += 1;
        }

        let mut image = Vec::new();
        push_u32s(&mut image, &[
            0xfeed_facf,
            CPU_TYPE_ARM64,
            0,
            self.filetype,
            ncmds,
            cmds.len() as u32,
            0x0020_0085,
            0,
        ]);
        image.extend_from_slice(&cmds);
        assert!(image.len() as u64 <= TEXT_OFFSET, "load commands overflow __TEXT");
        image.resize(TEXT_OFFSET as usize, 0);
        image.extend_from_slice(&self.text);
        image.resize(data_fileoff as usize, 0);
        image.extend_from_slice(&self.data);
        image.resize(linkedit_fileoff as usize, 0);
        image.extend_from_slice(&linkedit);
        image
    }
}

struct Section<'a> {
    sectname: &'a str,
    segname: &'a str,
    addr: u64,
    size: u64,
    offset: u32,
    flags: u32,
    reserved1: u32,
    reserved2: u32,
}

fn push_u32s(out: &mut Vec<u8>, values: &[u32]) {
    for v in values {
        out.extend_from_slice(&v.to_le_bytes());
    }
}

fn push_name(out: &mut Vec<u8>, name: &str) {
    let mut raw = [0u8; 16];
    raw[..name.len()].copy_from_slice(name.as_bytes());
    out.extend_from_slice(&raw);
}

#[allow(clippy::too_many_arguments)]
fn push_segment(
    out: &mut Vec<u8>,
    name: &str,
    vmaddr: u64,
    vmsize: u64,
    fileoff: u64,
    filesize: u64,
    prot: u32,
    sections: &[Section<'_>],
) {
    push_u32s(out, &[LC_SEGMENT_64, (72 + 80 * sections.len()) as u32]);
    push_name(out, name);
    for v in [vmaddr, vmsize, fileoff, filesize] {
        out.extend_from_slice(&v.to_le_bytes());
    }
    push_u32s(out, &[prot, prot, sections.len() as u32, 0]);
    for s in sections {
        push_name(out, s.sectname);
        push_name(out, s.segname);
        out.extend_from_slice(&s.addr.to_le_bytes());
        out.extend_from_slice(&s.size.to_le_bytes());
        push_u32s(out, &[s.offset, 3, 0, 0, s.flags, s.reserved1, s.reserved2, 0]);
    }
}

/// A scratch directory removed on drop.
pub struct TempDir {
    path: PathBuf,
}

impl TempDir {
    pub fn new(tag: &str) -> Self {
        static COUNTER: AtomicUsize = AtomicUsize::new(0);
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        let path = std::env::temp_dir().join(format!("machemu-{}-{}-{}", tag, std::process::id(), n));
        let _ = std::fs::remove_dir_all(&path);
        std::fs::create_dir_all(&path).unwrap();
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write(&self, name: &str, bytes: &[u8]) -> PathBuf {
        let path = self.path.join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&path, bytes).unwrap();
        path
    }
}

impl Drop for TempDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.path);
    }
}

type HostFn = Rc<dyn Fn(&mut ScriptedCpu) -> Result<()>>;

/// A CPU double that "executes" host closures registered at emulated
/// addresses, plus `svc; ret` trampolines found in memory.
///
/// Returning from a closure jumps to the link register, which must equal the
/// `until` address passed to `emu_start`, as it would on real hardware.
pub struct ScriptedCpu {
    memory: StaticMemory,
    functions: HashMap<u64, HostFn>,
    executed: Vec<u64>,
    maps: usize,
    writes: usize,
}

impl Default for ScriptedCpu {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedCpu {
    pub fn new() -> Self {
        Self {
            memory: StaticMemory::new(),
            functions: HashMap::new(),
            executed: Vec::new(),
            maps: 0,
            writes: 0,
        }
    }

    pub fn function(&mut self, address: u64, f: impl Fn(&mut ScriptedCpu) -> Result<()> + 'static) {
        self.functions.insert(address, Rc::new(f));
    }

    /// Entry addresses passed to `emu_start`, in order.
    pub fn executed(&self) -> &[u64] {
        &self.executed
    }

    /// Number of `mem_map` and `mem_write` calls so far.
    pub fn access_counts(&self) -> (usize, usize) {
        (self.maps, self.writes)
    }

    /// Raises the interrupt an `svc #imm` placed at `address` would raise.
    pub fn trap_svc(&mut self, address: u64, imm: u16) -> Result<()> {
        self.write_u32(address, 0xd400_0001 | (u32::from(imm) << 5))?;
        self.reg_write(Reg::Pc, address + 4)?;
        self.raise(2)
    }

    fn raise(&mut self, intno: u32) -> Result<()> {
        let hooks: Vec<Rc<dyn InterruptHook>> = self.memory.interrupt_hooks().to_vec();
        for hook in hooks {
            hook.on_interrupt(self, intno)?;
        }
        Ok(())
    }
}

impl Cpu for ScriptedCpu {
    fn mem_map(&mut self, address: u64, size: u64, prot: Protection) -> Result<()> {
        self.maps += 1;
        self.memory.mem_map(address, size, prot)
    }

    fn mem_read(&mut self, address: u64, buf: &mut [u8]) -> Result<()> {
        self.memory.mem_read(address, buf)
    }

    fn mem_write(&mut self, address: u64, data: &[u8]) -> Result<()> {
        self.writes += 1;
        self.memory.mem_write(address, data)
    }

    fn reg_read(&mut self, reg: Reg) -> Result<u64> {
        self.memory.reg_read(reg)
    }

    fn reg_write(&mut self, reg: Reg, value: u64) -> Result<()> {
        self.memory.reg_write(reg, value)
    }

    fn add_interrupt_hook(&mut self, hook: Rc<dyn InterruptHook>) -> Result<()> {
        self.memory.add_interrupt_hook(hook)
    }

    fn add_code_hook(&mut self, hook: Rc<dyn CodeHook>) -> Result<()> {
        self.memory.add_code_hook(hook)
    }

    fn emu_start(&mut self, begin: u64, until: u64) -> Result<()> {
        self.executed.push(begin);
        self.reg_write(Reg::Pc, begin)?;
        let code_hooks: Vec<Rc<dyn CodeHook>> = self.memory.code_hooks().to_vec();
        for hook in code_hooks {
            hook.on_code(self, begin, 4)?;
        }

        if let Some(f) = self.functions.get(&begin).cloned() {
            f(self)?;
        } else {
            let insn = self.read_u32(begin)?;
            let next = self.read_u32(begin + 4)?;
            if insn & 0xffe0_001f != 0xd400_0001 || next != 0xd65f_03c0 {
                return Err(Error::Emulator(format!("nothing to run at 0x{:x}", begin)));
            }
            self.reg_write(Reg::Pc, begin + 4)?;
            self.raise(2)?;
        }

        let lr = self.reg_read(LR)?;
        if lr != until {
            return Err(Error::Emulator(format!(
                "returned to 0x{:x} instead of 0x{:x}",
                lr, until
            )));
        }
        self.reg_write(Reg::Pc, until)
    }

    fn emu_stop(&mut self) -> Result<()> {
        Ok(())
    }
}
