//! Supervisor-call dispatch.
//!
//! Host functions are exposed to emulated code as `svc #n; ret` trampolines
//! emitted into a dedicated code region. When the CPU traps on an `svc`,
//! the immediate of the trapping instruction selects the handler. `svc #0x80`
//! without a registered handler is a system call and goes to the
//! [`Kernel`].

use super::syscall::Kernel;
use crate::runtime::{Cpu, InterruptHook, Protection, Reg};
use crate::Result;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use thiserror::Error;
use tracing::{debug, trace};

/// `svc #0`
pub const SVC_INSN: u32 = 0xd400_0001;
/// Bits of an `svc` instruction that are not the immediate.
pub const SVC_MASK: u32 = 0xffe0_001f;
/// `ret`
pub const RET_INSN: u32 = 0xd65f_03c0;
pub const TRAMPOLINE_SIZE: u64 = 8;

/// Exception number the emulator reports for `svc`.
pub const EXCP_SWI: u32 = 2;
/// Call number of Darwin system calls.
pub const SYSCALL_SVC: u16 = 0x80;
/// First number handed out by automatic allocation.
pub const FIRST_AUTO_SVC: u32 = 0x100;

#[derive(Debug, Error)]
pub enum SvcError {
    #[error("svc #0x{number:x} already has a handler")]
    DuplicateHandler { number: u16 },
    #[error("svc trampoline region exhausted")]
    CodeCacheExhausted,
    #[error("no svc numbers left")]
    NumbersExhausted,
    #[error("unregistered svc #0x{number:x}")]
    UnregisteredSvc { number: u16 },
    #[error("unexpected interrupt {intno} at 0x{pc:x}")]
    UnexpectedInterrupt { intno: u32, pc: u64 },
    #[error("instruction 0x{insn:08x} at 0x{address:x} is not an svc")]
    NotSvcInstruction { address: u64, insn: u32 },
}

/// Encodes `svc #number`.
pub fn encode_svc(number: u16) -> u32 {
    SVC_INSN | (u32::from(number) << 5)
}

/// Decodes the immediate of an `svc` instruction.
pub fn decode_svc(insn: u32) -> Option<u16> {
    if insn & SVC_MASK != SVC_INSN {
        return None;
    }
    Some(((insn >> 5) & 0xffff) as u16)
}

/// What the CPU reported when it trapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SvcTrap {
    pub intno: u32,
    pub number: u16,
    /// Address following the `svc` instruction.
    pub pc: u64,
}

pub type SvcCallback = Rc<dyn Fn(&mut dyn Cpu, &SvcTrap) -> Result<()>>;

struct SvcState {
    cursor: u64,
    next_number: u32,
    handlers: HashMap<u16, SvcCallback>,
}

/// Owns the trampoline region and the call number table.
pub struct SvcManager {
    base: u64,
    size: u64,
    state: RefCell<SvcState>,
    kernel: Kernel,
}

impl SvcManager {
    pub fn new(base: u64, size: u64, kernel: Kernel) -> Self {
        Self {
            base,
            size,
            state: RefCell::new(SvcState {
                cursor: base,
                next_number: FIRST_AUTO_SVC,
                handlers: HashMap::new(),
            }),
            kernel,
        }
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn kernel(&self) -> &Kernel {
        &self.kernel
    }

    /// Maps the trampoline region.
    pub fn map(&self, cpu: &mut dyn Cpu) -> Result<()> {
        debug!("svc region 0x{:x}-0x{:x}", self.base, self.base + self.size);
        cpu.mem_map(self.base, self.size, Protection::All)
    }

    /// Registers `callback` under `number`, or the next free number when
    /// `None`, and returns the address of its trampoline.
    pub fn register_handler(
        &self,
        cpu: &mut dyn Cpu,
        number: Option<u16>,
        callback: impl Fn(&mut dyn Cpu, &SvcTrap) -> Result<()> + 'static,
    ) -> Result<u64> {
        let mut state = self.state.borrow_mut();
        let number = match number {
            Some(number) => {
                if state.handlers.contains_key(&number) {
                    return Err(SvcError::DuplicateHandler { number }.into());
                }
                number
            }
            None => {
                let mut candidate = state.next_number;
                loop {
                    let number = u16::try_from(candidate).map_err(|_| SvcError::NumbersExhausted)?;
                    if number != SYSCALL_SVC && !state.handlers.contains_key(&number) {
                        break;
                    }
                    candidate += 1;
                }
                state.next_number = candidate + 1;
                candidate as u16
            }
        };
        let address = state.cursor;
        if address + TRAMPOLINE_SIZE > self.base + self.size {
            return Err(SvcError::CodeCacheExhausted.into());
        }
        let mut trampoline = [0u8; TRAMPOLINE_SIZE as usize];
        trampoline[..4].copy_from_slice(&encode_svc(number).to_le_bytes());
        trampoline[4..].copy_from_slice(&RET_INSN.to_le_bytes());
        cpu.mem_write(address, &trampoline)?;
        state.cursor += TRAMPOLINE_SIZE;
        state.handlers.insert(number, Rc::new(callback));
        trace!("svc #0x{:x} at 0x{:x}", number, address);
        Ok(address)
    }

    pub fn is_registered(&self, number: u16) -> bool {
        self.state.borrow().handlers.contains_key(&number)
    }

    /// Handles an interrupt raised by the CPU.
    pub fn handle(&self, cpu: &mut dyn Cpu, intno: u32) -> Result<()> {
        let pc = cpu.reg_read(Reg::Pc)?;
        if intno != EXCP_SWI {
            return Err(SvcError::UnexpectedInterrupt { intno, pc }.into());
        }
        let address = pc.wrapping_sub(4);
        let insn = cpu.read_u32(address)?;
        let number = decode_svc(insn).ok_or(SvcError::NotSvcInstruction { address, insn })?;
        let trap = SvcTrap { intno, number, pc };

        // The borrow ends before the callback runs: handlers may register more.
        let callback = self.state.borrow().handlers.get(&number).cloned();
        match callback {
            Some(callback) => callback(cpu, &trap),
            None if number == SYSCALL_SVC => self.kernel.handle_syscall(cpu),
            None => Err(SvcError::UnregisteredSvc { number }.into()),
        }
    }
}

impl InterruptHook for SvcManager {
    fn on_interrupt(&self, cpu: &mut dyn Cpu, intno: u32) -> Result<()> {
        self.handle(cpu, intno)
    }
}
