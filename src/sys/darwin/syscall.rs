//! XNU system call emulation.
//!
//! `svc #0x80` traps land here. The trap number is in `x16`: positive
//! numbers are BSD syscalls, negative numbers are Mach traps. Handlers are
//! registered with `#[xnu_trap(...)]` into [`XNU_TRAPS`].
//!
//! BSD syscalls report success by clearing the carry flag; Mach traps only
//! set `x0`. Every request outside the emulated subset is a fatal
//! [`KernelError`].

use super::mach_msg::{MachMessage, find_routine};
use crate::runtime::{Cpu, NZCV_C, Reg};
use crate::{Error, Result};
use linkme::distributed_slice;
use macros::xnu_trap;
use std::cell::OnceCell;
use std::fmt;
use thiserror::Error;
use tracing::{debug, trace};

pub const SYSCALL_IOCTL: i64 = 54;
pub const SYSCALL_GETRLIMIT: i64 = 194;
pub const SYSCALL_SYSCTL: i64 = 202;
pub const SYSCALL_FSTAT64: i64 = 339;
pub const SYSCALL_BSDTHREAD_REGISTER: i64 = 366;
pub const SYSCALL_THREAD_SELFID: i64 = 372;
/// Platform-specific calls (`mov x16, #0x80000000`).
pub const SYSCALL_PLATFORM: i64 = 0x8000_0000;

pub const MACH_TRAP_PORT_DEALLOCATE: i64 = 18;
pub const MACH_TRAP_REPLY_PORT: i64 = 26;
pub const MACH_TRAP_THREAD_SELF: i64 = 27;
pub const MACH_TRAP_TASK_SELF: i64 = 28;
pub const MACH_TRAP_HOST_SELF: i64 = 29;
pub const MACH_TRAP_MACH_MSG: i64 = 31;

/// Port names returned by the `*_self` traps.
pub const TASK_SELF_PORT: u32 = 1;
pub const HOST_SELF_PORT: u32 = 2;
pub const THREAD_SELF_PORT: u32 = 3;
pub const REPLY_PORT: u32 = 4;

/// Thread id returned by `thread_selfid`.
pub const MAIN_THREAD_ID: u64 = 1;

/// Platform call selector for `pthread_set_self`.
pub const PLATFORM_SET_SELF: u64 = 2;
/// Offset of the thread pointer within the pthread structure.
pub const PTHREAD_SELF_OFFSET: u64 = 0;

pub const CTL_KERN: i32 = 1;
/// `KERN_USRSTACK64`
pub const KERN_USRSTACK64: i32 = 59;

pub const RLIMIT_NOFILE: i32 = 8;
/// Mask applied to the resource argument of `getrlimit`; the high bits
/// carry the POSIX-conformance flag.
pub const RLIMIT_RESOURCE_MASK: i32 = 0x1000 - 1;
pub const NOFILE_SOFT_LIMIT: u64 = 128;
pub const NOFILE_HARD_LIMIT: u64 = 256;

/// The only ioctl answered: `fd 1`, yielding this value.
pub const STDOUT_IOCTL_VALUE: u32 = 3;

/// `sizeof(struct stat64)`
pub const STAT64_SIZE: usize = 144;
pub const STAT_BLOCK_SIZE: u64 = 0x4000;
pub const STAT_BLOCKS: u64 = 100;
/// Character device, `rwxrwxrwx`.
pub const STDOUT_MODE: u16 = 0x21ff;
/// Regular file.
pub const STDIO_MODE: u16 = 0x8000;

#[derive(Debug, Error)]
pub enum KernelError {
    #[error("unsupported BSD syscall {number}")]
    UnsupportedSyscall { number: i64 },
    #[error("unsupported Mach trap {number}")]
    UnsupportedMachTrap { number: i64 },
    #[error("unsupported ioctl(fd {fd}, request 0x{request:x})")]
    UnsupportedIoctl { fd: i32, request: u64 },
    #[error("unsupported getrlimit resource {resource}")]
    UnsupportedRlimit { resource: i32 },
    #[error("unsupported sysctl {{{mib0}, {mib1}}}")]
    UnsupportedSysctl { mib0: i32, mib1: i32 },
    #[error("unsupported fstat64 on fd {fd}")]
    UnsupportedFstat { fd: i32 },
    #[error("unsupported platform call selector {selector}")]
    UnsupportedPlatformCall { selector: u64 },
    #[error("unsupported Mach message id {id}")]
    UnsupportedMachMessage { id: u32 },
    #[error("unsupported host_info flavor {flavor}")]
    UnsupportedHostInfoFlavor { flavor: i32 },
    #[error("unsupported special port {which}")]
    UnsupportedSpecialPort { which: i32 },
    #[error("Mach message {id} too short ({len} bytes)")]
    MessageTooShort { id: u32, len: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrapClass {
    Bsd,
    Mach,
}

impl fmt::Display for TrapClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrapClass::Bsd => write!(f, "XNU syscall"),
            TrapClass::Mach => write!(f, "Mach trap"),
        }
    }
}

pub type TrapHandler = fn(&Kernel, &mut SyscallContext<'_>) -> Result<()>;

/// A BSD syscall or Mach trap handler.
pub struct XnuTrap {
    pub class: TrapClass,
    /// Syscall number, or the negated `x16` for Mach traps.
    pub number: i64,
    pub name: &'static str,
    pub handler: TrapHandler,
}

/// Trap handlers registered with `#[xnu_trap(bsd = N)]` or `#[xnu_trap(mach = N)]`.
#[distributed_slice]
pub static XNU_TRAPS: [XnuTrap] = [..];

pub fn find_trap(class: TrapClass, number: i64) -> Option<&'static XnuTrap> {
    XNU_TRAPS
        .iter()
        .find(|trap| trap.class == class && trap.number == number)
}

/// Registers of the trapping thread, as seen by a handler.
pub struct SyscallContext<'a> {
    pub cpu: &'a mut dyn Cpu,
}

impl SyscallContext<'_> {
    pub fn arg(&mut self, n: u8) -> Result<u64> {
        self.cpu.reg_read(Reg::X(n))
    }

    pub fn arg32(&mut self, n: u8) -> Result<u32> {
        self.cpu.reg_read32(Reg::X(n))
    }

    /// Sets the return value and clears the carry flag.
    pub fn bsd_return(&mut self, ret: u64) -> Result<()> {
        self.cpu.reg_write(Reg::X(0), ret)?;
        let nzcv = self.cpu.reg_read(Reg::Nzcv)?;
        self.cpu.reg_write(Reg::Nzcv, nzcv & !NZCV_C)
    }

    pub fn mach_return(&mut self, ret: u32) -> Result<()> {
        self.cpu.reg_write32(Reg::X(0), ret)
    }
}

/// Emulated kernel state shared by the trap handlers.
#[derive(Debug)]
pub struct Kernel {
    stack_top: u64,
    nofile_limit: OnceCell<(u64, u64)>,
}

impl Kernel {
    pub fn new(stack_top: u64) -> Self {
        Self {
            stack_top,
            nofile_limit: OnceCell::new(),
        }
    }

    /// Value reported for `KERN_USRSTACK64`.
    pub fn stack_top(&self) -> u64 {
        self.stack_top
    }

    /// Dispatches the syscall or Mach trap selected by `x16`.
    pub fn handle_syscall(&self, cpu: &mut dyn Cpu) -> Result<()> {
        let raw = cpu.reg_read(Reg::X(16))? as i64;
        let (class, number) = if raw < 0 {
            (TrapClass::Mach, raw.wrapping_neg())
        } else {
            (TrapClass::Bsd, raw)
        };
        let trap = find_trap(class, number).ok_or_else(|| -> Error {
            match class {
                TrapClass::Bsd => KernelError::UnsupportedSyscall { number }.into(),
                TrapClass::Mach => KernelError::UnsupportedMachTrap { number }.into(),
            }
        })?;
        trace!("{}: {} ({})", class, trap.name, number);
        let mut ctx = SyscallContext { cpu };
        (trap.handler)(self, &mut ctx)
    }
}

#[xnu_trap(bsd = 54)]
fn ioctl(_kernel: &Kernel, ctx: &mut SyscallContext<'_>) -> Result<()> {
    let fd = ctx.arg32(0)? as i32;
    let request = ctx.arg(1)?;
    let arg = ctx.arg(2)?;
    trace!("XNU syscall: ioctl({}, 0x{:x}, 0x{:x})", fd, request, arg);
    if fd != 1 {
        return Err(KernelError::UnsupportedIoctl { fd, request }.into());
    }
    ctx.cpu.write_u32(arg, STDOUT_IOCTL_VALUE)?;
    ctx.bsd_return(0)
}

#[xnu_trap(bsd = 194)]
fn getrlimit(kernel: &Kernel, ctx: &mut SyscallContext<'_>) -> Result<()> {
    let resource = ctx.arg32(0)? as i32;
    let rlp = ctx.arg(1)?;
    trace!("XNU syscall: getrlimit(0x{:x}, 0x{:x})", resource, rlp);
    if resource & RLIMIT_RESOURCE_MASK != RLIMIT_NOFILE {
        return Err(KernelError::UnsupportedRlimit { resource }.into());
    }
    let (cur, max) = *kernel
        .nofile_limit
        .get_or_init(|| (NOFILE_SOFT_LIMIT, NOFILE_HARD_LIMIT));
    ctx.cpu.write_u64(rlp, cur)?;
    ctx.cpu.write_u64(rlp + 8, max)?;
    ctx.bsd_return(0)
}

#[xnu_trap(bsd = 202)]
fn sysctl(kernel: &Kernel, ctx: &mut SyscallContext<'_>) -> Result<()> {
    let name = ctx.arg(0)?;
    let namelen = ctx.arg32(1)?;
    let oldp = ctx.arg(2)?;
    let oldlenp = ctx.arg(3)?;
    trace!(
        "XNU syscall: sysctl(0x{:x}, {}, 0x{:x}, 0x{:x})",
        name, namelen, oldp, oldlenp
    );
    let mib0 = ctx.cpu.read_u32(name)? as i32;
    let mib1 = if namelen >= 2 {
        ctx.cpu.read_u32(name + 4)? as i32
    } else {
        0
    };
    if mib0 != CTL_KERN || mib1 != KERN_USRSTACK64 {
        return Err(KernelError::UnsupportedSysctl { mib0, mib1 }.into());
    }
    if oldlenp != 0 {
        ctx.cpu.write_u64(oldlenp, 8)?;
    }
    if oldp != 0 {
        ctx.cpu.write_u64(oldp, kernel.stack_top())?;
    }
    ctx.bsd_return(0)
}

#[xnu_trap(bsd = 339)]
fn fstat64(_kernel: &Kernel, ctx: &mut SyscallContext<'_>) -> Result<()> {
    let fd = ctx.arg32(0)? as i32;
    let buf = ctx.arg(1)?;
    trace!("XNU syscall: fstat64({}, 0x{:x})", fd, buf);
    let mode = match fd {
        1 => STDOUT_MODE,
        0 | 2 => STDIO_MODE,
        _ => return Err(KernelError::UnsupportedFstat { fd }.into()),
    };
    ctx.cpu.mem_write(buf, &stdio_stat64(mode))?;
    ctx.bsd_return(0)
}

/// `struct stat64` describing a standard stream.
fn stdio_stat64(mode: u16) -> [u8; STAT64_SIZE] {
    let mut st = [0u8; STAT64_SIZE];
    // st_dev
    st[0..4].copy_from_slice(&1i32.to_le_bytes());
    st[4..6].copy_from_slice(&mode.to_le_bytes());
    // st_ino
    st[8..16].copy_from_slice(&7u64.to_le_bytes());
    // st_size, st_blocks, st_blksize
    st[96..104].copy_from_slice(&(STAT_BLOCK_SIZE * STAT_BLOCKS).to_le_bytes());
    st[104..112].copy_from_slice(&STAT_BLOCKS.to_le_bytes());
    st[112..116].copy_from_slice(&(STAT_BLOCK_SIZE as i32).to_le_bytes());
    st
}

#[xnu_trap(bsd = 366)]
fn bsdthread_register(_kernel: &Kernel, ctx: &mut SyscallContext<'_>) -> Result<()> {
    debug!(
        "XNU syscall: bsdthread_register(0x{:x}, 0x{:x}, {})",
        ctx.arg(0)?,
        ctx.arg(1)?,
        ctx.arg32(2)?
    );
    ctx.bsd_return(0)
}

#[xnu_trap(bsd = 372)]
fn thread_selfid(_kernel: &Kernel, ctx: &mut SyscallContext<'_>) -> Result<()> {
    ctx.bsd_return(MAIN_THREAD_ID)
}

#[xnu_trap(bsd = 0x8000_0000)]
fn platform_call(_kernel: &Kernel, ctx: &mut SyscallContext<'_>) -> Result<()> {
    let selector = ctx.arg(3)?;
    if selector != PLATFORM_SET_SELF {
        return Err(KernelError::UnsupportedPlatformCall { selector }.into());
    }
    let self_ptr = ctx.arg(0)?;
    let thread = ctx.cpu.read_u64(self_ptr)?;
    trace!("XNU syscall: pthread_set_self(0x{:x}) -> 0x{:x}", self_ptr, thread);
    ctx.cpu
        .reg_write(Reg::TpidrroEl0, thread + PTHREAD_SELF_OFFSET)?;
    ctx.bsd_return(0)
}

#[xnu_trap(mach = 18)]
fn mach_port_deallocate(_kernel: &Kernel, ctx: &mut SyscallContext<'_>) -> Result<()> {
    trace!(
        "Mach trap: mach_port_deallocate({}, {})",
        ctx.arg32(0)?,
        ctx.arg32(1)?
    );
    ctx.mach_return(0)
}

#[xnu_trap(mach = 26)]
fn mach_reply_port(_kernel: &Kernel, ctx: &mut SyscallContext<'_>) -> Result<()> {
    ctx.mach_return(REPLY_PORT)
}

#[xnu_trap(mach = 27)]
fn thread_self_trap(_kernel: &Kernel, ctx: &mut SyscallContext<'_>) -> Result<()> {
    ctx.mach_return(THREAD_SELF_PORT)
}

#[xnu_trap(mach = 28)]
fn task_self_trap(_kernel: &Kernel, ctx: &mut SyscallContext<'_>) -> Result<()> {
    ctx.mach_return(TASK_SELF_PORT)
}

#[xnu_trap(mach = 29)]
fn host_self_trap(_kernel: &Kernel, ctx: &mut SyscallContext<'_>) -> Result<()> {
    ctx.mach_return(HOST_SELF_PORT)
}

/// Answers the request with the matching MIG routine and writes the reply
/// over the request buffer.
#[xnu_trap(mach = 31)]
fn mach_msg_trap(kernel: &Kernel, ctx: &mut SyscallContext<'_>) -> Result<()> {
    let msg_addr = ctx.arg(0)?;
    let option = ctx.arg32(1)?;
    let send_size = ctx.arg32(2)?;
    let rcv_size = ctx.arg32(3)?;
    trace!(
        "Mach trap: mach_msg(0x{:x}, 0x{:x}, {}, {})",
        msg_addr, option, send_size, rcv_size
    );
    let size = send_size.max(rcv_size) as usize;
    let msg = MachMessage::parse(ctx.cpu.read_bytes(msg_addr, size)?)?;
    let routine =
        find_routine(msg.id()).ok_or(KernelError::UnsupportedMachMessage { id: msg.id() })?;
    debug!("Mach message {} ({})", msg.id(), routine.name);
    let reply = (routine.handler)(kernel, &msg)?;
    ctx.cpu.mem_write(msg_addr, &reply)?;
    ctx.mach_return(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{Protection, StaticMemory};
    use crate::sys::darwin::mach_msg::{MachMsgHeader, TASK_BOOTSTRAP_PORT};
    use std::collections::HashSet;

    const STACK_TOP: u64 = 0x3_ffff_0000;
    const BUF: u64 = 0x10_0000;

    fn cpu() -> StaticMemory {
        let mut cpu = StaticMemory::new();
        cpu.mem_map(BUF, 0x1000, Protection::ReadWrite).unwrap();
        cpu.reg_write(Reg::Nzcv, NZCV_C | 0x4000_0000).unwrap();
        cpu
    }

    fn syscall(kernel: &Kernel, cpu: &mut StaticMemory, number: i64, args: &[u64]) -> Result<u64> {
        cpu.reg_write(Reg::X(16), number as u64).unwrap();
        for (n, arg) in args.iter().enumerate() {
            cpu.reg_write(Reg::X(n as u8), *arg).unwrap();
        }
        kernel.handle_syscall(cpu)?;
        cpu.reg_read(Reg::X(0))
    }

    #[test]
    fn test_trap_table_has_no_duplicates() {
        let mut seen = HashSet::new();
        for trap in XNU_TRAPS.iter() {
            assert!(seen.insert((trap.class, trap.number)), "{} registered twice", trap.name);
        }
        assert!(find_trap(TrapClass::Bsd, SYSCALL_THREAD_SELFID).is_some());
        assert!(find_trap(TrapClass::Mach, MACH_TRAP_MACH_MSG).is_some());
    }

    #[test]
    fn test_bsd_success_clears_carry() {
        let kernel = Kernel::new(STACK_TOP);
        let mut cpu = cpu();
        assert_eq!(syscall(&kernel, &mut cpu, SYSCALL_THREAD_SELFID, &[]).unwrap(), 1);
        assert_eq!(cpu.reg_read(Reg::Nzcv).unwrap(), 0x4000_0000);
    }

    #[test]
    fn test_mach_ports_leave_flags_alone() {
        let kernel = Kernel::new(STACK_TOP);
        let mut cpu = cpu();
        let expected = [
            (MACH_TRAP_REPLY_PORT, 4),
            (MACH_TRAP_THREAD_SELF, 3),
            (MACH_TRAP_TASK_SELF, 1),
            (MACH_TRAP_HOST_SELF, 2),
            (MACH_TRAP_PORT_DEALLOCATE, 0),
        ];
        for (trap, port) in expected {
            cpu.reg_write(Reg::X(0), u64::MAX).unwrap();
            assert_eq!(syscall(&kernel, &mut cpu, -trap, &[]).unwrap(), port);
        }
        assert_eq!(cpu.reg_read(Reg::Nzcv).unwrap(), NZCV_C | 0x4000_0000);
    }

    #[test]
    fn test_fstat64_standard_streams() {
        let kernel = Kernel::new(STACK_TOP);
        let mut cpu = cpu();
        for (fd, mode) in [(0, STDIO_MODE), (1, STDOUT_MODE), (2, STDIO_MODE)] {
            cpu.mem_write(BUF, &[0xaa; STAT64_SIZE]).unwrap();
            syscall(&kernel, &mut cpu, SYSCALL_FSTAT64, &[fd, BUF]).unwrap();
            let st = cpu.read_bytes(BUF, STAT64_SIZE).unwrap();
            assert_eq!(i32::from_le_bytes(st[0..4].try_into().unwrap()), 1);
            assert_eq!(u16::from_le_bytes(st[4..6].try_into().unwrap()), mode);
            assert_eq!(u64::from_le_bytes(st[8..16].try_into().unwrap()), 7);
            assert_eq!(&st[16..24], &[0; 8]);
            assert_eq!(u64::from_le_bytes(st[96..104].try_into().unwrap()), 0x4000 * 100);
            assert_eq!(u64::from_le_bytes(st[104..112].try_into().unwrap()), 100);
            assert_eq!(u32::from_le_bytes(st[112..116].try_into().unwrap()), 0x4000);
        }
        assert!(matches!(
            syscall(&kernel, &mut cpu, SYSCALL_FSTAT64, &[3, BUF]),
            Err(Error::Kernel(KernelError::UnsupportedFstat { fd: 3 }))
        ));
    }

    #[test]
    fn test_getrlimit_nofile() {
        let kernel = Kernel::new(STACK_TOP);
        let mut cpu = cpu();
        // POSIX-conformance flag set in the high bits.
        for resource in [RLIMIT_NOFILE as u64, 0x1000 | RLIMIT_NOFILE as u64] {
            cpu.mem_write(BUF, &[0; 16]).unwrap();
            syscall(&kernel, &mut cpu, SYSCALL_GETRLIMIT, &[resource, BUF]).unwrap();
            assert_eq!(cpu.read_u64(BUF).unwrap(), 128);
            assert_eq!(cpu.read_u64(BUF + 8).unwrap(), 256);
        }
        assert!(matches!(
            syscall(&kernel, &mut cpu, SYSCALL_GETRLIMIT, &[3, BUF]),
            Err(Error::Kernel(KernelError::UnsupportedRlimit { resource: 3 }))
        ));
    }

    #[test]
    fn test_sysctl_user_stack() {
        let kernel = Kernel::new(STACK_TOP);
        let mut cpu = cpu();
        cpu.write_u32(BUF, 1).unwrap();
        cpu.write_u32(BUF + 4, 59).unwrap();
        syscall(&kernel, &mut cpu, SYSCALL_SYSCTL, &[BUF, 2, BUF + 0x10, BUF + 0x20]).unwrap();
        assert_eq!(cpu.read_u64(BUF + 0x10).unwrap(), STACK_TOP);
        assert_eq!(cpu.read_u64(BUF + 0x20).unwrap(), 8);

        // Null output pointers are skipped.
        syscall(&kernel, &mut cpu, SYSCALL_SYSCTL, &[BUF, 2, 0, 0]).unwrap();

        cpu.write_u32(BUF + 4, 24).unwrap();
        assert!(matches!(
            syscall(&kernel, &mut cpu, SYSCALL_SYSCTL, &[BUF, 2, BUF + 0x10, BUF + 0x20]),
            Err(Error::Kernel(KernelError::UnsupportedSysctl { mib0: 1, mib1: 24 }))
        ));
    }

    #[test]
    fn test_ioctl_stdout_only() {
        let kernel = Kernel::new(STACK_TOP);
        let mut cpu = cpu();
        syscall(&kernel, &mut cpu, SYSCALL_IOCTL, &[1, 0x4004_667a, BUF]).unwrap();
        assert_eq!(cpu.read_u32(BUF).unwrap(), 3);
        assert!(syscall(&kernel, &mut cpu, SYSCALL_IOCTL, &[2, 0x4004_667a, BUF]).is_err());
    }

    #[test]
    fn test_pthread_set_self() {
        let kernel = Kernel::new(STACK_TOP);
        let mut cpu = cpu();
        cpu.write_u64(BUF, 0x7777_0000).unwrap();
        syscall(&kernel, &mut cpu, SYSCALL_PLATFORM, &[BUF, 0, 0, PLATFORM_SET_SELF]).unwrap();
        assert_eq!(cpu.reg_read(Reg::TpidrroEl0).unwrap(), 0x7777_0000);
        assert!(matches!(
            syscall(&kernel, &mut cpu, SYSCALL_PLATFORM, &[BUF, 0, 0, 3]),
            Err(Error::Kernel(KernelError::UnsupportedPlatformCall { selector: 3 }))
        ));
    }

    #[test]
    fn test_unknown_traps() {
        let kernel = Kernel::new(STACK_TOP);
        let mut cpu = cpu();
        assert!(matches!(
            syscall(&kernel, &mut cpu, 4, &[]),
            Err(Error::Kernel(KernelError::UnsupportedSyscall { number: 4 }))
        ));
        assert!(matches!(
            syscall(&kernel, &mut cpu, -36, &[]),
            Err(Error::Kernel(KernelError::UnsupportedMachTrap { number: 36 }))
        ));
    }

    #[test]
    fn test_mach_msg_writes_reply_in_place() {
        let kernel = Kernel::new(STACK_TOP);
        let mut cpu = cpu();
        let header = MachMsgHeader {
            bits: 0x1513,
            size: 36,
            remote_port: 1,
            local_port: 0x303,
            voucher_port: 0,
            id: 3409,
        };
        let mut request = Vec::new();
        header.encode(&mut request);
        request.extend_from_slice(&[0, 0, 0, 0, 1, 0, 0, 0]);
        request.extend_from_slice(&TASK_BOOTSTRAP_PORT.to_le_bytes());
        cpu.mem_write(BUF, &request).unwrap();
        let ret = syscall(&kernel, &mut cpu, -MACH_TRAP_MACH_MSG, &[BUF, 3, 36, 40]).unwrap();
        assert_eq!(ret, 0);
        let reply = MachMsgHeader::decode(&cpu.read_bytes(BUF, 24).unwrap()).unwrap();
        assert_eq!(reply.id, 3509);
        assert_eq!(reply.remote_port, 0x303);
        assert_eq!(reply.size, 40);

        cpu.write_u32(BUF + 20, 999).unwrap();
        assert!(matches!(
            syscall(&kernel, &mut cpu, -MACH_TRAP_MACH_MSG, &[BUF, 3, 36, 40]),
            Err(Error::Kernel(KernelError::UnsupportedMachMessage { id: 999 }))
        ));
    }
}
