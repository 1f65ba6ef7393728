pub mod dyld;
pub mod mach_msg;
pub mod svc;
pub mod syscall;
pub mod xnu;

pub use svc::{SvcManager, SvcTrap};
pub use syscall::Kernel;
pub use xnu::{AddressSpaceLayout, Task, TaskBuilder};
