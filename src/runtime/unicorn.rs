//! Unicorn CPU backend.
//!
//! Hook callbacks get a [`Guest`] view of the engine so the harness sees the
//! same [`Cpu`] interface inside a hook as outside. A hook that fails stores
//! its error in the engine's data and stops emulation; `emu_start` returns
//! the stored error in place of the engine's own status.

use super::{CodeHook, Cpu, InterruptHook, Protection, Reg, check_gpr};
use crate::{Error, Result};
use std::rc::Rc;
use tracing::error;
use unicorn_engine::unicorn_const::{Arch, HookType, MemType, Mode, Permission, uc_error};
use unicorn_engine::{RegisterARM64, Unicorn};

/// Engine data shared with hook callbacks.
#[derive(Default)]
pub struct HookState {
    fault: Option<Error>,
}

type Engine = Unicorn<'static, HookState>;

const GPRS: [RegisterARM64; 31] = [
    RegisterARM64::X0,
    RegisterARM64::X1,
    RegisterARM64::X2,
    RegisterARM64::X3,
    RegisterARM64::X4,
    RegisterARM64::X5,
    RegisterARM64::X6,
    RegisterARM64::X7,
    RegisterARM64::X8,
    RegisterARM64::X9,
    RegisterARM64::X10,
    RegisterARM64::X11,
    RegisterARM64::X12,
    RegisterARM64::X13,
    RegisterARM64::X14,
    RegisterARM64::X15,
    RegisterARM64::X16,
    RegisterARM64::X17,
    RegisterARM64::X18,
    RegisterARM64::X19,
    RegisterARM64::X20,
    RegisterARM64::X21,
    RegisterARM64::X22,
    RegisterARM64::X23,
    RegisterARM64::X24,
    RegisterARM64::X25,
    RegisterARM64::X26,
    RegisterARM64::X27,
    RegisterARM64::X28,
    RegisterARM64::X29,
    RegisterARM64::X30,
];

fn register(reg: Reg) -> Result<RegisterARM64> {
    check_gpr(reg)?;
    Ok(match reg {
        Reg::X(n) => GPRS[n as usize],
        Reg::Sp => RegisterARM64::SP,
        Reg::Pc => RegisterARM64::PC,
        Reg::Nzcv => RegisterARM64::NZCV,
        Reg::TpidrroEl0 => RegisterARM64::TPIDRRO_EL0,
        Reg::TpidrEl0 => RegisterARM64::TPIDR_EL0,
        Reg::CpacrEl1 => RegisterARM64::CPACR_EL1,
    })
}

fn permission(prot: Protection) -> Permission {
    match prot {
        Protection::Read => Permission::READ,
        Protection::ReadWrite => Permission::READ | Permission::WRITE,
        Protection::All => Permission::ALL,
    }
}

fn engine_error(what: &str, err: uc_error) -> Error {
    Error::Emulator(format!("{}: {:?}", what, err))
}

/// Runs a hook body against a [`Guest`] view and stashes any failure.
fn run_hook(uc: &mut Unicorn<'_, HookState>, body: impl FnOnce(&mut dyn Cpu) -> Result<()>) {
    if uc.get_data().fault.is_some() {
        return;
    }
    let result = body(&mut Guest(&mut *uc));
    if let Err(e) = result {
        error!("{}", e);
        uc.get_data_mut().fault = Some(e);
        let _ = uc.emu_stop();
    }
}

/// The engine as seen from inside a hook.
pub struct Guest<'u, 'e>(&'u mut Unicorn<'e, HookState>);

impl Cpu for Guest<'_, '_> {
    fn mem_map(&mut self, address: u64, size: u64, prot: Protection) -> Result<()> {
        self.0
            .mem_map(address, size as usize, permission(prot))
            .map_err(|e| {
                Error::MemoryMapping(format!("mapping 0x{:x} (+0x{:x}): {:?}", address, size, e))
            })
    }

    fn mem_read(&mut self, address: u64, buf: &mut [u8]) -> Result<()> {
        self.0.mem_read(address, buf).map_err(|e| {
            Error::MemoryMapping(format!("reading {} bytes at 0x{:x}: {:?}", buf.len(), address, e))
        })
    }

    fn mem_write(&mut self, address: u64, data: &[u8]) -> Result<()> {
        self.0.mem_write(address, data).map_err(|e| {
            Error::MemoryMapping(format!("writing {} bytes at 0x{:x}: {:?}", data.len(), address, e))
        })
    }

    fn reg_read(&mut self, reg: Reg) -> Result<u64> {
        let id = register(reg)?;
        self.0
            .reg_read(id)
            .map_err(|e| engine_error(&format!("reading {:?}", reg), e))
    }

    fn reg_write(&mut self, reg: Reg, value: u64) -> Result<()> {
        let id = register(reg)?;
        self.0
            .reg_write(id, value)
            .map_err(|e| engine_error(&format!("writing {:?}", reg), e))
    }

    fn add_interrupt_hook(&mut self, hook: Rc<dyn InterruptHook>) -> Result<()> {
        self.0
            .add_intr_hook(move |uc, intno| {
                run_hook(uc, |cpu| hook.on_interrupt(cpu, intno));
            })
            .map_err(|e| engine_error("adding interrupt hook", e))?;
        Ok(())
    }

    fn add_code_hook(&mut self, hook: Rc<dyn CodeHook>) -> Result<()> {
        self.0
            .add_code_hook(1, 0, move |uc, address, size| {
                run_hook(uc, |cpu| hook.on_code(cpu, address, size));
            })
            .map_err(|e| engine_error("adding code hook", e))?;
        Ok(())
    }

    fn emu_start(&mut self, begin: u64, until: u64) -> Result<()> {
        let status = self.0.emu_start(begin, until, 0, 0);
        if let Some(fault) = self.0.get_data_mut().fault.take() {
            return Err(fault);
        }
        status.map_err(|e| engine_error(&format!("emulation from 0x{:x}", begin), e))
    }

    fn emu_stop(&mut self) -> Result<()> {
        self.0.emu_stop().map_err(|e| engine_error("stopping emulation", e))
    }
}

/// An ARM64 Unicorn engine.
pub struct UnicornCpu {
    uc: Engine,
}

impl UnicornCpu {
    pub fn new() -> Result<Self> {
        let mut uc = Unicorn::new_with_data(Arch::ARM64, Mode::ARM, HookState::default())
            .map_err(|e| engine_error("creating arm64 engine", e))?;
        uc.add_mem_hook(
            HookType::MEM_INVALID,
            1,
            0,
            |uc, kind: MemType, address, size, value| {
                let pc = uc.reg_read(RegisterARM64::PC).unwrap_or(0);
                error!(
                    "invalid memory access {:?} at 0x{:x} ({} bytes, value 0x{:x}), pc 0x{:x}",
                    kind, address, size, value, pc
                );
                if uc.get_data().fault.is_none() {
                    uc.get_data_mut().fault = Some(Error::MemoryMapping(format!(
                        "invalid {:?} at 0x{:x} from pc 0x{:x}",
                        kind, address, pc
                    )));
                }
                false
            },
        )
        .map_err(|e| engine_error("adding invalid memory hook", e))?;
        Ok(Self { uc })
    }

    fn guest(&mut self) -> Guest<'_, 'static> {
        Guest(&mut self.uc)
    }
}

impl Cpu for UnicornCpu {
    fn mem_map(&mut self, address: u64, size: u64, prot: Protection) -> Result<()> {
        self.guest().mem_map(address, size, prot)
    }

    fn mem_read(&mut self, address: u64, buf: &mut [u8]) -> Result<()> {
        self.guest().mem_read(address, buf)
    }

    fn mem_write(&mut self, address: u64, data: &[u8]) -> Result<()> {
        self.guest().mem_write(address, data)
    }

    fn reg_read(&mut self, reg: Reg) -> Result<u64> {
        self.guest().reg_read(reg)
    }

    fn reg_write(&mut self, reg: Reg, value: u64) -> Result<()> {
        self.guest().reg_write(reg, value)
    }

    fn add_interrupt_hook(&mut self, hook: Rc<dyn InterruptHook>) -> Result<()> {
        self.guest().add_interrupt_hook(hook)
    }

    fn add_code_hook(&mut self, hook: Rc<dyn CodeHook>) -> Result<()> {
        self.guest().add_code_hook(hook)
    }

    fn emu_start(&mut self, begin: u64, until: u64) -> Result<()> {
        self.guest().emu_start(begin, until)
    }

    fn emu_stop(&mut self) -> Result<()> {
        self.guest().emu_stop()
    }
}
