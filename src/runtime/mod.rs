//! Execution runtime for emulated ARM64 code.
//!
//! The loader, the supervisor-call dispatcher and the execution harness all
//! talk to the CPU through the [`Cpu`] trait: memory mapping, register and
//! memory access, hook registration and starting emulation. Two backends
//! implement it:
//!
//! - [`memory::StaticMemory`]: a sparse address space with a register file
//!   that cannot execute code. Used for load-only inspection and tests.
//! - `unicorn::UnicornCpu` (feature `unicorn`): the Unicorn CPU emulator.
//!
//! Hooks are trait objects handed over at registration time; when the CPU
//! traps, the hook receives the CPU itself, so no global registry is needed
//! to find the owning process.

use crate::{Error, Result};
use std::rc::Rc;

pub mod call;
pub mod memory;
#[cfg(feature = "unicorn")]
pub mod unicorn;

pub use call::{CallArg, FunctionCaller, ReturnType};
pub use memory::StaticMemory;

/// ARM64 registers the runtime reads or writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Reg {
    /// General purpose register `x0`..`x30`.
    X(u8),
    Sp,
    Pc,
    Nzcv,
    /// Read-only thread pointer, holds the TSD base on Darwin.
    TpidrroEl0,
    TpidrEl0,
    CpacrEl1,
}

/// Link register.
pub const LR: Reg = Reg::X(30);

/// Number of general purpose registers, `x0`..`x30`.
pub const GPR_COUNT: u8 = 31;

/// Carry flag in NZCV.
pub const NZCV_C: u64 = 1 << 29;

/// CPACR_EL1.FPEN: do not trap FP/SIMD instructions at EL0 or EL1.
pub const CPACR_FPEN: u64 = 0x3 << 20;

/// Memory protection for mapped regions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protection {
    Read,
    ReadWrite,
    All,
}

impl Protection {
    pub fn is_writable(self) -> bool {
        matches!(self, Protection::ReadWrite | Protection::All)
    }
}

/// Called when the CPU raises an interrupt (an `svc` for instance).
pub trait InterruptHook {
    fn on_interrupt(&self, cpu: &mut dyn Cpu, intno: u32) -> Result<()>;
}

/// Called before every instruction executes.
pub trait CodeHook {
    fn on_code(&self, cpu: &mut dyn Cpu, address: u64, size: u32) -> Result<()>;
}

/// The CPU emulator interface consumed by the loader and the harness.
pub trait Cpu {
    fn mem_map(&mut self, address: u64, size: u64, prot: Protection) -> Result<()>;
    fn mem_read(&mut self, address: u64, buf: &mut [u8]) -> Result<()>;
    fn mem_write(&mut self, address: u64, data: &[u8]) -> Result<()>;
    fn reg_read(&mut self, reg: Reg) -> Result<u64>;
    fn reg_write(&mut self, reg: Reg, value: u64) -> Result<()>;
    fn add_interrupt_hook(&mut self, hook: Rc<dyn InterruptHook>) -> Result<()>;
    fn add_code_hook(&mut self, hook: Rc<dyn CodeHook>) -> Result<()>;

    /// Runs from `begin` until the program counter reaches `until`.
    fn emu_start(&mut self, begin: u64, until: u64) -> Result<()>;
    fn emu_stop(&mut self) -> Result<()>;

    fn read_bytes(&mut self, address: u64, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0; len];
        self.mem_read(address, &mut buf)?;
        Ok(buf)
    }

    fn read_u64(&mut self, address: u64) -> Result<u64> {
        let mut buf = [0; 8];
        self.mem_read(address, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    fn read_u32(&mut self, address: u64) -> Result<u32> {
        let mut buf = [0; 4];
        self.mem_read(address, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn write_u64(&mut self, address: u64, value: u64) -> Result<()> {
        self.mem_write(address, &value.to_le_bytes())
    }

    fn write_u32(&mut self, address: u64, value: u32) -> Result<()> {
        self.mem_write(address, &value.to_le_bytes())
    }

    /// Reads a NUL-terminated string of at most `max` bytes.
    fn read_cstring(&mut self, address: u64, max: usize) -> Result<String> {
        let mut bytes = Vec::new();
        let mut byte = [0u8; 1];
        while bytes.len() < max {
            self.mem_read(address + bytes.len() as u64, &mut byte)?;
            if byte[0] == 0 {
                break;
            }
            bytes.push(byte[0]);
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Writes `s` followed by a NUL terminator.
    fn write_cstring(&mut self, address: u64, s: &str) -> Result<()> {
        let mut bytes = Vec::with_capacity(s.len() + 1);
        bytes.extend_from_slice(s.as_bytes());
        bytes.push(0);
        self.mem_write(address, &bytes)
    }

    fn reg_read32(&mut self, reg: Reg) -> Result<u32> {
        Ok(self.reg_read(reg)? as u32)
    }

    /// Writes the W view of `reg`, zeroing the upper half like the hardware does.
    fn reg_write32(&mut self, reg: Reg, value: u32) -> Result<()> {
        self.reg_write(reg, u64::from(value))
    }
}

pub(crate) fn check_gpr(reg: Reg) -> Result<()> {
    match reg {
        Reg::X(n) if n >= GPR_COUNT => Err(Error::Emulator(format!("no such register x{}", n))),
        _ => Ok(()),
    }
}

/// Rounds `value` down to a multiple of `align` (a power of two).
pub fn align_down(value: u64, align: u64) -> u64 {
    value & !(align - 1)
}

/// Rounds `value` up to a multiple of `align` (a power of two).
pub fn align_up(value: u64, align: u64) -> u64 {
    (value + align - 1) & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alignment_helpers() {
        assert_eq!(align_down(0x1234, 0x10), 0x1230);
        assert_eq!(align_up(0x1234, 0x1000), 0x2000);
        assert_eq!(align_up(0x2000, 0x1000), 0x2000);
    }

    #[test]
    fn test_cstring_helpers() {
        let mut cpu = StaticMemory::new();
        cpu.mem_map(0x1000, 0x1000, Protection::ReadWrite).unwrap();
        cpu.write_cstring(0x1000, "MallocCorruptionAbort=0").unwrap();
        assert_eq!(cpu.read_cstring(0x1000, 256).unwrap(), "MallocCorruptionAbort=0");
        assert_eq!(cpu.read_cstring(0x1000, 6).unwrap(), "Malloc");
    }

    #[test]
    fn test_w_register_writes_zero_extend() {
        let mut cpu = StaticMemory::new();
        cpu.reg_write(Reg::X(0), u64::MAX).unwrap();
        cpu.reg_write32(Reg::X(0), 0xdead_beef).unwrap();
        assert_eq!(cpu.reg_read(Reg::X(0)).unwrap(), 0xdead_beef);
        assert!(cpu.reg_read(Reg::X(31)).is_err());
    }
}
