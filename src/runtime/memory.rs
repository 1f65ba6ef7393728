//! Static address space backend.
//!
//! [`StaticMemory`] keeps emulated memory in lazily allocated pages and the
//! register file in a map. It is enough to load and link images, inspect the
//! result and drive the harness setup code, but it cannot execute
//! instructions: `emu_start` fails.

use super::{CodeHook, Cpu, InterruptHook, Protection, Reg, check_gpr};
use crate::{Error, Result};
use std::collections::HashMap;
use std::rc::Rc;

pub const PAGE_SIZE: u64 = 0x1000;

#[derive(Debug, Clone, Copy)]
struct Region {
    start: u64,
    end: u64,
    prot: Protection,
}

/// A sparse emulated address space with a register file.
#[derive(Default)]
pub struct StaticMemory {
    regions: Vec<Region>,
    pages: HashMap<u64, Box<[u8]>>,
    regs: HashMap<Reg, u64>,
    interrupt_hooks: Vec<Rc<dyn InterruptHook>>,
    code_hooks: Vec<Rc<dyn CodeHook>>,
}

impl StaticMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the protection of the region containing `address`.
    pub fn protection(&self, address: u64) -> Option<Protection> {
        self.region(address).map(|r| r.prot)
    }

    pub fn interrupt_hooks(&self) -> &[Rc<dyn InterruptHook>] {
        &self.interrupt_hooks
    }

    pub fn code_hooks(&self) -> &[Rc<dyn CodeHook>] {
        &self.code_hooks
    }

    fn region(&self, address: u64) -> Option<&Region> {
        self.regions
            .iter()
            .find(|r| address >= r.start && address < r.end)
    }

    fn check_mapped(&self, address: u64, len: usize) -> Result<()> {
        let mut cursor = address;
        let end = address
            .checked_add(len as u64)
            .ok_or_else(|| Error::MemoryMapping(format!("range overflow at 0x{:x}", address)))?;
        while cursor < end {
            let region = self.region(cursor).ok_or_else(|| {
                Error::MemoryMapping(format!("access to unmapped memory at 0x{:x}", cursor))
            })?;
            cursor = region.end;
        }
        Ok(())
    }
}

impl Cpu for StaticMemory {
    fn mem_map(&mut self, address: u64, size: u64, prot: Protection) -> Result<()> {
        if address % PAGE_SIZE != 0 || size % PAGE_SIZE != 0 || size == 0 {
            return Err(Error::MemoryMapping(format!(
                "unaligned mapping 0x{:x} (+0x{:x})",
                address, size
            )));
        }
        let end = address
            .checked_add(size)
            .ok_or_else(|| Error::MemoryMapping(format!("mapping overflow at 0x{:x}", address)))?;
        if self
            .regions
            .iter()
            .any(|r| address < r.end && r.start < end)
        {
            return Err(Error::MemoryMapping(format!(
                "mapping 0x{:x}..0x{:x} overlaps an existing region",
                address, end
            )));
        }
        self.regions.push(Region {
            start: address,
            end,
            prot,
        });
        Ok(())
    }

    fn mem_read(&mut self, address: u64, buf: &mut [u8]) -> Result<()> {
        self.check_mapped(address, buf.len())?;
        let mut done = 0;
        while done < buf.len() {
            let addr = address + done as u64;
            let page = addr & !(PAGE_SIZE - 1);
            let offset = (addr - page) as usize;
            let n = (PAGE_SIZE as usize - offset).min(buf.len() - done);
            match self.pages.get(&page) {
                Some(data) => buf[done..done + n].copy_from_slice(&data[offset..offset + n]),
                None => buf[done..done + n].fill(0),
            }
            done += n;
        }
        Ok(())
    }

    fn mem_write(&mut self, address: u64, data: &[u8]) -> Result<()> {
        self.check_mapped(address, data.len())?;
        let mut done = 0;
        while done < data.len() {
            let addr = address + done as u64;
            let page = addr & !(PAGE_SIZE - 1);
            let offset = (addr - page) as usize;
            let n = (PAGE_SIZE as usize - offset).min(data.len() - done);
            let bytes = self
                .pages
                .entry(page)
                .or_insert_with(|| vec![0; PAGE_SIZE as usize].into_boxed_slice());
            bytes[offset..offset + n].copy_from_slice(&data[done..done + n]);
            done += n;
        }
        Ok(())
    }

    fn reg_read(&mut self, reg: Reg) -> Result<u64> {
        check_gpr(reg)?;
        Ok(self.regs.get(&reg).copied().unwrap_or(0))
    }

    fn reg_write(&mut self, reg: Reg, value: u64) -> Result<()> {
        check_gpr(reg)?;
        self.regs.insert(reg, value);
        Ok(())
    }

    fn add_interrupt_hook(&mut self, hook: Rc<dyn InterruptHook>) -> Result<()> {
        self.interrupt_hooks.push(hook);
        Ok(())
    }

    fn add_code_hook(&mut self, hook: Rc<dyn CodeHook>) -> Result<()> {
        self.code_hooks.push(hook);
        Ok(())
    }

    fn emu_start(&mut self, begin: u64, _until: u64) -> Result<()> {
        Err(Error::Emulator(format!(
            "static address space cannot execute code at 0x{:x}",
            begin
        )))
    }

    fn emu_stop(&mut self) -> Result<()> {
        Ok(())
    }
}
