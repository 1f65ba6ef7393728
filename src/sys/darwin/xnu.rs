//! Darwin task: an emulated process running loaded Mach-O images.
//!
//! A [`Task`] owns the CPU, the dynamic linker state and the supervisor-call
//! dispatcher. Calling into an image sets up what the process would have
//! after launch on the device: a stack with the environment and argument
//! vectors, a thread-specific data block, the comm page, and every loaded
//! module initialized in dependency order.

use super::dyld::{ImageId, LoaderConfig, MachOLoader};
use super::svc::SvcManager;
use super::syscall::Kernel;
use crate::runtime::{
    CPACR_FPEN, CallArg, CodeHook, Cpu, FunctionCaller, Protection, Reg, ReturnType,
    call::{NOP, SENTINEL_SLOTS},
};
use crate::staging::{FileStager, InPlace, LibraryResolver};
use crate::{Error, Result};
use std::cell::{Ref, RefCell};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use tracing::{debug, info, trace, warn};

/// Offsets of the comm page fields the harness fills in.
pub const COMM_PAGE_NCPUS: u64 = 0x22;
pub const COMM_PAGE_ACTIVE_CPUS: u64 = 0x34;
pub const COMM_PAGE_PHYSICAL_CPUS: u64 = 0x35;
pub const COMM_PAGE_LOGICAL_CPUS: u64 = 0x36;
pub const COMM_PAGE_MEMORY_SIZE: u64 = 0x38;

/// Words in the thread-specific data block.
pub const TSD_SLOTS: usize = 256;
pub const TSD_SLOT_SELF: usize = 0;
pub const TSD_SLOT_ERRNO: usize = 1;
pub const TSD_SLOT_MIG_REPLY: usize = 2;

/// Frameworks whose initializers are never run.
pub const DEFAULT_INIT_DENY_LIST: [&str; 4] = ["UIKit", "CoreGraphics", "AdSupport", "CoreTelephony"];
pub const DEFAULT_ENVIRONMENT: [&str; 1] = ["MallocCorruptionAbort=0"];

const NS_SET_LOG_FUNCTION: &str = "__NSSetLogCStringFunction";
/// Longest log message read from emulated memory.
const MAX_LOG_MESSAGE: usize = 64 * 1024;

/// Where the task places things in the emulated address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressSpaceLayout {
    /// Region image slabs and the stack live in.
    pub vm_start: u64,
    pub vm_size: u64,
    pub stack_top: u64,
    /// Trampoline region of the supervisor-call dispatcher.
    pub svc_base: u64,
    pub svc_size: u64,
    /// libsystem kernel trace page.
    pub trace_page: u64,
    pub trace_page_size: u64,
    pub comm_page: u64,
    pub comm_page_size: u64,
    /// Memory size published on the comm page.
    pub memory_size: u64,
}

impl Default for AddressSpaceLayout {
    fn default() -> Self {
        Self {
            vm_start: 0x1_0000_0000,
            vm_size: 12 << 30,
            stack_top: 0x3_ffff_0000,
            svc_base: 0x8_0000_0000,
            svc_size: 0x10000,
            trace_page: 0xf_ffff_0000,
            trace_page_size: 0xc000,
            comm_page: 0xf_ffff_c000,
            comm_page_size: 0x4000,
            memory_size: 1 << 30,
        }
    }
}

pub struct TaskBuilder {
    trace_code: bool,
    environment: Vec<String>,
    init_deny_list: Vec<String>,
    resolver: Option<Box<dyn LibraryResolver>>,
    stager: Box<dyn FileStager>,
    layout: AddressSpaceLayout,
}

impl Default for TaskBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskBuilder {
    pub fn new() -> Self {
        Self {
            trace_code: false,
            environment: DEFAULT_ENVIRONMENT.iter().map(|s| s.to_string()).collect(),
            init_deny_list: DEFAULT_INIT_DENY_LIST.iter().map(|s| s.to_string()).collect(),
            resolver: None,
            stager: Box::new(InPlace),
            layout: AddressSpaceLayout::default(),
        }
    }

    /// Logs every executed instruction at trace level.
    pub fn trace_code(mut self, trace_code: bool) -> Self {
        self.trace_code = trace_code;
        self
    }

    /// Replaces the environment strings (`NAME=value`).
    pub fn environment(mut self, environment: Vec<String>) -> Self {
        self.environment = environment;
        self
    }

    /// Replaces the list of modules that are never initialized.
    pub fn init_deny_list(mut self, names: Vec<String>) -> Self {
        self.init_deny_list = names;
        self
    }

    pub fn resolver(mut self, resolver: impl LibraryResolver + 'static) -> Self {
        self.resolver = Some(Box::new(resolver));
        self
    }

    pub fn stager(mut self, stager: impl FileStager + 'static) -> Self {
        self.stager = Box::new(stager);
        self
    }

    pub fn layout(mut self, layout: AddressSpaceLayout) -> Self {
        self.layout = layout;
        self
    }

    /// Maps the task's fixed regions on `cpu` and installs the trap hook.
    pub fn build<C: Cpu>(self, mut cpu: C) -> Result<Task<C>> {
        let layout = self.layout;
        let mut config = LoaderConfig {
            vm_start: layout.vm_start,
            vm_size: layout.vm_size,
            stager: self.stager,
            ..LoaderConfig::default()
        };
        if let Some(resolver) = self.resolver {
            config.resolver = resolver;
        }
        let mut loader = MachOLoader::new(config);
        loader.map_address_space(&mut cpu)?;

        let svc = Rc::new(SvcManager::new(
            layout.svc_base,
            layout.svc_size,
            Kernel::new(layout.stack_top),
        ));
        svc.map(&mut cpu)?;
        cpu.add_interrupt_hook(svc.clone())?;

        Ok(Task {
            cpu,
            loader: Rc::new(RefCell::new(loader)),
            svc,
            layout,
            trace_code: self.trace_code,
            environment: self.environment,
            init_deny_list: self.init_deny_list,
            main_image: None,
            process: None,
            initializing: HashSet::new(),
        })
    }
}

/// Addresses of the process environment on the emulated stack.
#[derive(Debug, Clone)]
pub struct ProcessEnvironment {
    pub caller: FunctionCaller,
    pub program_name: String,
    pub argc: u64,
    pub argv: u64,
    pub envp: u64,
    pub apple: u64,
    /// `{mach_header, &argc, &argv, &environ, &progname}` for initializers.
    pub vars: u64,
    pub tsd: u64,
    pub sp: u64,
}

/// Bump allocator growing down from the stack top.
struct StackBuilder {
    sp: u64,
}

impl StackBuilder {
    fn alloca(&mut self, size: u64) -> Result<u64> {
        let sp = self.sp.checked_sub(size).ok_or_else(|| {
            Error::Call(format!("stack exhausted allocating 0x{:x} bytes at 0x{:x}", size, self.sp))
        })?;
        self.sp = sp & !15;
        Ok(self.sp)
    }

    fn push_cstring(&mut self, cpu: &mut dyn Cpu, s: &str) -> Result<u64> {
        let address = self.alloca(s.len() as u64 + 1)?;
        cpu.write_cstring(address, s)?;
        Ok(address)
    }

    fn push_words(&mut self, cpu: &mut dyn Cpu, words: &[u64]) -> Result<u64> {
        let address = self.alloca(words.len() as u64 * 8)?;
        let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
        cpu.mem_write(address, &bytes)?;
        Ok(address)
    }

    /// Writes a NULL-terminated pointer vector of fresh copies of `strings`.
    fn push_string_vector(&mut self, cpu: &mut dyn Cpu, strings: &[String]) -> Result<u64> {
        let mut pointers = Vec::with_capacity(strings.len() + 1);
        for s in strings {
            pointers.push(self.push_cstring(cpu, s)?);
        }
        pointers.push(0);
        self.push_words(cpu, &pointers)
    }
}

/// Logs every executed instruction with the image and nearest symbol.
struct CodeTracer {
    loader: Rc<RefCell<MachOLoader>>,
}

impl CodeHook for CodeTracer {
    fn on_code(&self, cpu: &mut dyn Cpu, address: u64, _size: u32) -> Result<()> {
        let insn = match cpu.read_u32(address) {
            Ok(insn) => insn,
            Err(e) => {
                trace!("0x{:x}: unreadable ({})", address, e);
                return Ok(());
            }
        };
        let Ok(loader) = self.loader.try_borrow() else {
            trace!("0x{:x}: {:08x}", address, insn);
            return Ok(());
        };
        match loader.image_containing(address) {
            Some(image) => {
                let symbol = image
                    .symbols
                    .get_symbol_near_address(address)
                    .map(|s| format!("{}+0x{:x}", s.name, address - s.address))
                    .unwrap_or_default();
                trace!(
                    "0x{:x}: {:08x} ; {} (0x{:x}) {}",
                    address, insn, image.name, image.base, symbol
                );
            }
            None => trace!("0x{:x}: {:08x}", address, insn),
        }
        Ok(())
    }
}

/// An emulated Darwin process.
pub struct Task<C: Cpu> {
    cpu: C,
    loader: Rc<RefCell<MachOLoader>>,
    svc: Rc<SvcManager>,
    layout: AddressSpaceLayout,
    trace_code: bool,
    environment: Vec<String>,
    init_deny_list: Vec<String>,
    main_image: Option<ImageId>,
    process: Option<ProcessEnvironment>,
    initializing: HashSet<ImageId>,
}

impl<C: Cpu> Task<C> {
    pub fn cpu(&self) -> &C {
        &self.cpu
    }

    pub fn cpu_mut(&mut self) -> &mut C {
        &mut self.cpu
    }

    pub fn loader(&self) -> Ref<'_, MachOLoader> {
        self.loader.borrow()
    }

    pub fn svc(&self) -> &Rc<SvcManager> {
        &self.svc
    }

    pub fn layout(&self) -> &AddressSpaceLayout {
        &self.layout
    }

    /// The process environment, once the first call has set it up.
    pub fn process(&self) -> Option<&ProcessEnvironment> {
        self.process.as_ref()
    }

    /// Loads `path` and its dependency graph and binds everything. The
    /// first image loaded is the main executable.
    pub fn load(&mut self, path: &Path) -> Result<ImageId> {
        let id = self
            .loader
            .borrow_mut()
            .load_module_from_file(&mut self.cpu, path, true)?;
        self.main_image.get_or_insert(id);
        Ok(id)
    }

    pub fn main_image(&self) -> Option<ImageId> {
        self.main_image
    }

    /// Runs `symbol` of `image` after initializing every loaded module and
    /// returns `x0`.
    pub fn call(&mut self, image: ImageId, symbol: &str) -> Result<u64> {
        let (address, name) = {
            let loader = self.loader.borrow();
            let address = loader
                .resolve_symbol(image, symbol)
                .ok_or_else(|| Error::SymbolNotFound(symbol.to_string()))?;
            (address, loader.image(image).name.clone())
        };
        info!("call {} (0x{:x}) in {}", symbol, address, name);
        self.prepare(Some(image))?;
        self.init_all_modules()?;
        let ret = self.call_function(address, ReturnType::Int64, &[])?;
        debug!("{} returned 0x{:x}", symbol, ret);
        Ok(ret)
    }

    /// Runs the `LC_MAIN` entry point of `image` as `main(argc, argv, envp, apple)`.
    pub fn run_entry(&mut self, image: ImageId) -> Result<u64> {
        let entry = self
            .loader
            .borrow()
            .image(image)
            .entry_point
            .ok_or_else(|| Error::SymbolNotFound("entry point".to_string()))?;
        info!("run entry point 0x{:x}", entry);
        let process = self.prepare(Some(image))?;
        self.init_all_modules()?;
        let argc = self.cpu.read_u64(process.argc)?;
        self.call_function(
            entry,
            ReturnType::Int32,
            &[
                CallArg::Int32(argc as u32),
                CallArg::Int64(process.argv),
                CallArg::Int64(process.envp),
                CallArg::Int64(process.apple),
            ],
        )
    }

    /// Calls emulated code at `address`, setting up the process first if
    /// needed.
    pub fn call_function(&mut self, address: u64, ret: ReturnType, args: &[CallArg]) -> Result<u64> {
        let process = self.prepare(None)?;
        process.caller.call_function(&mut self.cpu, address, ret, args)
    }

    /// Sets up the process once: FP enable, hooks, stack environment,
    /// kernel pages and the log function.
    fn prepare(&mut self, image: Option<ImageId>) -> Result<ProcessEnvironment> {
        if let Some(process) = &self.process {
            return Ok(process.clone());
        }
        let cpacr = self.cpu.reg_read(Reg::CpacrEl1)?;
        self.cpu.reg_write(Reg::CpacrEl1, cpacr | CPACR_FPEN)?;
        if self.trace_code {
            self.cpu.add_code_hook(Rc::new(CodeTracer {
                loader: self.loader.clone(),
            }))?;
        }

        let (header, program_name) = match image.or(self.main_image) {
            Some(id) => {
                let loader = self.loader.borrow();
                let image = loader.image(id);
                (image.header_address, image.name.clone())
            }
            None => (0, "main".to_string()),
        };
        let process = self.build_environment(header, program_name)?;
        self.map_kernel_pages()?;
        self.process = Some(process.clone());
        self.setup_log_function()?;
        Ok(process)
    }

    fn build_environment(&mut self, header: u64, program_name: String) -> Result<ProcessEnvironment> {
        let cpu: &mut dyn Cpu = &mut self.cpu;
        let mut stack = StackBuilder {
            sp: self.layout.stack_top,
        };

        let sentinels = vec![NOP; SENTINEL_SLOTS as usize];
        let sentinel_base = stack.alloca(u64::from(SENTINEL_SLOTS) * 4)?;
        let bytes: Vec<u8> = sentinels.iter().flat_map(|i| i.to_le_bytes()).collect();
        cpu.mem_write(sentinel_base, &bytes)?;

        let envp = stack.push_string_vector(cpu, &self.environment)?;
        let environ_cell = stack.push_words(cpu, &[envp])?;
        let progname = stack.push_cstring(cpu, &program_name)?;
        let argc = stack.push_words(cpu, &[1])?;
        let argv = stack.push_words(cpu, &[progname, 0])?;
        let argv_cell = stack.push_words(cpu, &[argv])?;
        let apple = stack.push_string_vector(cpu, &[format!("executable_path={}", program_name)])?;
        let progname_cell = stack.push_words(cpu, &[progname])?;
        let vars = stack.push_words(cpu, &[header, argc, argv_cell, environ_cell, progname_cell])?;

        let tsd = stack.alloca(TSD_SLOTS as u64 * 8)?;
        let mut block = vec![0u64; TSD_SLOTS];
        block[TSD_SLOT_SELF] = tsd;
        block[TSD_SLOT_ERRNO] = 0;
        block[TSD_SLOT_MIG_REPLY] = 0;
        let bytes: Vec<u8> = block.iter().flat_map(|w| w.to_le_bytes()).collect();
        cpu.mem_write(tsd, &bytes)?;
        cpu.reg_write(Reg::TpidrroEl0, tsd + (TSD_SLOT_SELF as u64) * 8)?;
        cpu.reg_write(Reg::Sp, stack.sp)?;
        debug!(
            "process {}: vars 0x{:x}, tsd 0x{:x}, sp 0x{:x}",
            program_name, vars, tsd, stack.sp
        );

        Ok(ProcessEnvironment {
            caller: FunctionCaller::new(sentinel_base),
            program_name,
            argc,
            argv,
            envp,
            apple,
            vars,
            tsd,
            sp: stack.sp,
        })
    }

    fn map_kernel_pages(&mut self) -> Result<()> {
        let layout = self.layout;
        self.cpu
            .mem_map(layout.trace_page, layout.trace_page_size, Protection::Read)?;
        self.cpu
            .mem_map(layout.comm_page, layout.comm_page_size, Protection::Read)?;
        for field in [
            COMM_PAGE_NCPUS,
            COMM_PAGE_ACTIVE_CPUS,
            COMM_PAGE_PHYSICAL_CPUS,
            COMM_PAGE_LOGICAL_CPUS,
        ] {
            self.cpu.mem_write(layout.comm_page + field, &[1])?;
        }
        self.cpu
            .write_u64(layout.comm_page + COMM_PAGE_MEMORY_SIZE, layout.memory_size)
    }

    /// Points Foundation's log output at a trampoline that prints each
    /// message.
    fn setup_log_function(&mut self) -> Result<()> {
        let target = {
            let loader = self.loader.borrow();
            loader
                .find_image("Foundation")
                .and_then(|id| loader.resolve_symbol(id, NS_SET_LOG_FUNCTION))
        };
        let Some(setter) = target else {
            debug!("Foundation not loaded, NSLog output is not captured");
            return Ok(());
        };
        let callback = self.svc.register_handler(&mut self.cpu, None, |cpu, _trap| {
            let message = cpu.reg_read(Reg::X(0))?;
            let len = cpu.reg_read(Reg::X(1))? as usize;
            let text = cpu.read_cstring(message, len.min(MAX_LOG_MESSAGE))?;
            info!("NSLog: {}", text);
            Ok(())
        })?;
        self.call_function(setter, ReturnType::Void, &[CallArg::Int64(callback)])?;
        Ok(())
    }

    /// Initializes every loaded module not initialized yet, in load order.
    pub fn init_all_modules(&mut self) -> Result<()> {
        let count = self.loader.borrow().images().len();
        for index in 0..count {
            self.init_module(ImageId(index))?;
        }
        Ok(())
    }

    /// Runs the routines of `id`, initializes its non-upward dependencies,
    /// then runs its module initializers.
    pub fn init_module(&mut self, id: ImageId) -> Result<()> {
        let (name, routines, dependencies, init_funcs) = {
            let loader = self.loader.borrow();
            let image = loader.image(id);
            if image.initialized || self.initializing.contains(&id) {
                return Ok(());
            }
            let dependencies: Vec<ImageId> = image
                .dependencies
                .iter()
                .filter(|dep| !dep.upward)
                .filter_map(|dep| loader.find_image(&dep.name))
                .collect();
            (
                image.name.clone(),
                image.routines.clone(),
                dependencies,
                image.mod_init_funcs.clone(),
            )
        };
        if self.init_deny_list.iter().any(|denied| *denied == name) {
            debug!("skipping initializers of {}", name);
            self.loader.borrow_mut().image_mut(id).initialized = true;
            return Ok(());
        }
        let process = self.prepare(None)?;
        self.initializing.insert(id);
        debug!("init module {}", name);

        let result = (|| -> Result<()> {
            for routine in routines {
                trace!("routine 0x{:x}", routine);
                process
                    .caller
                    .call_function(&mut self.cpu, routine, ReturnType::Void, &[])?;
            }
            for dependency in dependencies {
                self.init_module(dependency)?;
            }
            for init in init_funcs {
                trace!("mod_init_func 0x{:x}", init);
                process.caller.call_function(
                    &mut self.cpu,
                    init,
                    ReturnType::Void,
                    &[
                        CallArg::Int64(0),
                        CallArg::Int64(0),
                        CallArg::Int64(0),
                        CallArg::Int64(0),
                        CallArg::Int64(process.vars),
                    ],
                )?;
            }
            Ok(())
        })();
        self.initializing.remove(&id);
        if let Err(e) = result {
            warn!("initializing {} failed", name);
            return Err(e);
        }
        self.loader.borrow_mut().image_mut(id).initialized = true;
        Ok(())
    }
}

/// Resolver used by the CLI when no library root is given.
pub fn host_path_resolver(install_path: &str) -> Option<PathBuf> {
    let path = PathBuf::from(install_path);
    if path.is_file() {
        Some(path)
    } else {
        warn!("missing library {}", install_path);
        None
    }
}
