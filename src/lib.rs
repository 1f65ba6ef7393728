//! Machemu - A Mach-O loader and emulation harness for ARM64 binaries.
//!
//! Machemu maps a 64-bit Mach-O executable or dynamic library and its
//! dependencies into an emulated ARM64 address space, does the work of the
//! platform dynamic linker (segment mapping, rebasing, binding, module
//! initialization) and runs the result on a CPU emulator, answering the
//! supervisor calls the code makes with a small BSD and Mach emulation layer.
//!
//! # Modules
//!
//! - [`runtime`] - CPU emulator interface, backends and host-to-guest calls
//! - [`sys`] - Darwin dynamic linker, supervisor-call dispatcher and task harness
//! - [`symbols`] - Per-image symbol tables
//! - [`staging`] - Library path resolution and working copies of input files
//! - [`mmap`] - Memory-mapped file handling
//!
//! # Error Handling
//!
//! All operations use the consolidated [`Error`] type, which provides specific
//! error variants for different failure modes (object format, dynamic linking,
//! supervisor calls, emulation, etc.).

pub mod staging;
pub mod symbols;
pub mod sys;

pub mod mmap;
pub mod runtime;

#[cfg(test)]
mod testutil;

use sys::darwin::dyld::{DyldError, MachError};
use sys::darwin::svc::SvcError;
use sys::darwin::syscall::KernelError;

/// Consolidated error type for all Machemu operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("object format error: {0}")]
    ObjectFormat(#[from] ObjectFormatError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("dynamic linker error: {0}")]
    DynamicLinker(#[from] DyldError),

    #[error("kernel emulation error: {0}")]
    Kernel(#[from] KernelError),

    #[error("supervisor call error: {0}")]
    Svc(#[from] SvcError),

    #[error("emulator error: {0}")]
    Emulator(String),

    #[error("memory mapping error: {0}")]
    MemoryMapping(String),

    #[error("symbol not found: {0}")]
    SymbolNotFound(String),

    #[error("call error: {0}")]
    Call(String),
}

/// Error type for object file format parsing and loading
#[derive(Debug, thiserror::Error)]
pub enum ObjectFormatError {
    #[error("not a valid object file")]
    InvalidFormat,

    #[error("goblin parse error: {0}")]
    GoblinError(#[from] goblin::error::Error),

    #[error("mach-o error: {0}")]
    MachError(#[from] MachError),

    #[error("fat binaries are not supported, extract the arm64 slice first")]
    FatBinary,

    #[error("unsupported {0} Mach-O image")]
    UnsupportedLayout(&'static str),

    #[error("unsupported CPU type 0x{0:x}, only arm64 images can be loaded")]
    UnsupportedCpuType(u32),

    #[error("unsupported file type {0}, only executables and dylibs can be loaded")]
    UnsupportedFileType(u32),
}

pub type Result<T> = core::result::Result<T, Error>;

pub use mmap::MappedFile;

pub use runtime::{Cpu, Reg};
pub use sys::darwin::dyld::{Image, ImageId, LoaderConfig, MachOLoader};
pub use sys::darwin::xnu::{Task, TaskBuilder};
