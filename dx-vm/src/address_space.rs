//! Fixed regions of the simulated 32-bit address space.

pub use crate::stack::memory::{DEFAULT_STACK_BASE, DEFAULT_STACK_SIZE};

pub const HEAP_BASE: u32 = 0x2000_0000;
pub const DEFAULT_HEAP_SIZE: usize = 256 * 1024;

/// Out-of-line templates, one slot of `TEMPLATE_STRIDE` bytes each.
pub const TEMPLATE_BASE: u32 = 0x6000_0000;
pub const TEMPLATE_STRIDE: u32 = 0x40;

pub const STUB_BASE: u32 = 0x6008_0000;
/// Return address handed to compiled methods entered from the runtime.
pub const INVOKE_RETURN_PC: u32 = STUB_BASE;
/// Trace exits and unchained cells call here with the dex pc in the following word.
pub const INTERPRETER_EXIT_PC: u32 = STUB_BASE + 0x10;
/// Punts: interpret one instruction, then resume after the following word.
pub const SINGLE_STEP_PC: u32 = STUB_BASE + 0x20;
/// Return address substituted by instrumentation exit stubs.
pub const INSTRUMENTATION_EXIT_PC: u32 = STUB_BASE + 0x30;

/// Code cache; kept within direct-call range of the templates on every target.
pub const CODE_CACHE_BASE: u32 = 0x6010_0000;
pub const CODE_CACHE_SIZE: u32 = 0x00e0_0000;

pub fn is_stub(addr: u32) -> bool {
    (STUB_BASE..CODE_CACHE_BASE).contains(&addr)
}

pub fn is_template(addr: u32) -> bool {
    (TEMPLATE_BASE..STUB_BASE).contains(&addr)
}
