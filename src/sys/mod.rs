//! Platform-specific system interfaces.
//!
//! Only Darwin is emulated: the dynamic linker, the kernel interface
//! reached through supervisor calls, and the task harness tying them to a
//! CPU.

pub mod darwin;
