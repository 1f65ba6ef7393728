//! Calling into emulated code from the host.
//!
//! A call loads arguments into `x0`..`x7`, points the link register at a
//! sentinel address holding a `nop`, and runs the CPU until it reaches the
//! sentinel. Calls may nest: a supervisor-call handler running inside one
//! emulated call can call back into emulated code. Each nesting level gets
//! its own sentinel slot so an inner return never satisfies an outer stop
//! condition, and the caller's registers are restored afterwards.

use super::{Cpu, GPR_COUNT, LR, Reg, align_down};
use crate::{Error, Result};
use std::cell::Cell;
use std::rc::Rc;
use tracing::trace;

/// `nop`
pub const NOP: u32 = 0xd503201f;

/// Maximum number of register arguments in the AAPCS64 calling convention.
pub const MAX_REGISTER_ARGS: usize = 8;

/// Sentinel slots reserved for nested calls.
pub const SENTINEL_SLOTS: u32 = 16;

/// Bytes skipped below the interrupted stack pointer before a nested call.
pub const RED_ZONE: u64 = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnType {
    Void,
    Int32,
    Int64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallArg {
    Int32(u32),
    Int64(u64),
}

/// Register state saved around a call.
struct RegisterSnapshot {
    gprs: [u64; GPR_COUNT as usize],
    sp: u64,
    pc: u64,
    nzcv: u64,
}

impl RegisterSnapshot {
    fn capture(cpu: &mut dyn Cpu) -> Result<Self> {
        let mut gprs = [0u64; GPR_COUNT as usize];
        for (n, slot) in gprs.iter_mut().enumerate() {
            *slot = cpu.reg_read(Reg::X(n as u8))?;
        }
        Ok(Self {
            gprs,
            sp: cpu.reg_read(Reg::Sp)?,
            pc: cpu.reg_read(Reg::Pc)?,
            nzcv: cpu.reg_read(Reg::Nzcv)?,
        })
    }

    fn restore(&self, cpu: &mut dyn Cpu) -> Result<()> {
        for (n, value) in self.gprs.iter().enumerate() {
            cpu.reg_write(Reg::X(n as u8), *value)?;
        }
        cpu.reg_write(Reg::Sp, self.sp)?;
        cpu.reg_write(Reg::Pc, self.pc)?;
        cpu.reg_write(Reg::Nzcv, self.nzcv)
    }
}

/// Calls emulated functions, tracking how deeply calls are nested.
///
/// Clones share the nesting depth, so a clone captured by a trap handler
/// sees the depth of the call that trapped.
#[derive(Debug, Clone)]
pub struct FunctionCaller {
    sentinel_base: u64,
    depth: Rc<Cell<u32>>,
}

impl FunctionCaller {
    /// `sentinel_base` must point at [`SENTINEL_SLOTS`] consecutive `nop`s.
    pub fn new(sentinel_base: u64) -> Self {
        Self {
            sentinel_base,
            depth: Rc::new(Cell::new(0)),
        }
    }

    pub fn sentinel_base(&self) -> u64 {
        self.sentinel_base
    }

    /// Return address used by calls at nesting level `depth`.
    pub fn sentinel(&self, depth: u32) -> u64 {
        self.sentinel_base + u64::from(depth) * 4
    }

    pub fn depth(&self) -> u32 {
        self.depth.get()
    }

    /// Calls the function at `address` and returns its result.
    ///
    /// Void calls return 0; 32-bit results are zero-extended.
    pub fn call_function(
        &self,
        cpu: &mut dyn Cpu,
        address: u64,
        ret: ReturnType,
        args: &[CallArg],
    ) -> Result<u64> {
        if args.len() > MAX_REGISTER_ARGS {
            return Err(Error::Call(format!(
                "{} arguments passed, at most {} fit in registers",
                args.len(),
                MAX_REGISTER_ARGS
            )));
        }
        let depth = self.depth.get();
        if depth >= SENTINEL_SLOTS {
            return Err(Error::Call(format!("calls nested deeper than {}", SENTINEL_SLOTS)));
        }

        let saved = RegisterSnapshot::capture(cpu)?;
        if depth > 0 {
            let sp = saved.sp.checked_sub(RED_ZONE).ok_or_else(|| {
                Error::Call(format!("stack exhausted at sp 0x{:x} for nested call", saved.sp))
            })?;
            cpu.reg_write(Reg::Sp, align_down(sp, 16))?;
        }
        for (n, arg) in args.iter().enumerate() {
            match *arg {
                CallArg::Int64(value) => cpu.reg_write(Reg::X(n as u8), value)?,
                CallArg::Int32(value) => cpu.reg_write32(Reg::X(n as u8), value)?,
            }
        }
        let sentinel = self.sentinel(depth);
        cpu.reg_write(LR, sentinel)?;
        trace!("call 0x{:x} at depth {} (returns to 0x{:x})", address, depth, sentinel);

        self.depth.set(depth + 1);
        let run = cpu.emu_start(address, sentinel);
        self.depth.set(depth);
        run?;

        let value = match ret {
            ReturnType::Void => 0,
            ReturnType::Int32 => u64::from(cpu.reg_read32(Reg::X(0))?),
            ReturnType::Int64 => cpu.reg_read(Reg::X(0))?,
        };
        saved.restore(cpu)?;
        Ok(value)
    }
}
