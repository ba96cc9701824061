//! Register state reconstructed during a stack walk.
//!
//! A context maps each machine register to where its value lives for the frame being
//! visited: a callee-save slot in stack memory, a scratch word owned by the context, or
//! the always-zero sentinel. Long jumps materialise the whole register file from it.

mod arm;
mod mips;
mod x86;

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind, panic_any, resume_unwind};

pub use arm::ArmContext;
pub use mips::MipsContext;
pub use x86::X86Context;

use crate::isa::InstructionSet;
use crate::stack::frame_layout::{FrameInfo, POINTER_SIZE};
use crate::stack::memory::StackMemory;

pub const BAD_GPR_BASE: u32 = 0xebad_6070;
pub const BAD_FPR_BASE: u32 = 0xebad_8070;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Location {
    Unset,
    Stack(u32),
    Scratch(usize),
    /// Reads as zero; writes are a bug.
    Zero,
}

/// Register file handed to a [`Trampoline`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LongJumpImage {
    pub isa: InstructionSet,
    /// Machine register order, except on x86 where the buffer is reversed for `popad`.
    pub gprs: Vec<u32>,
    pub fprs: Vec<u32>,
    /// Word the trampoline expects on the stack before it runs.
    pub stack_write: Option<(u32, u32)>,
}

/// The one place control leaves compiled code without returning.
pub trait Trampoline {
    fn long_jump(&mut self, image: &LongJumpImage) -> !;
}

pub trait Context {
    fn instruction_set(&self) -> InstructionSet;
    fn reset(&mut self);
    /// Binds every callee-save register of `frame` to its spill slot.
    fn fill_callee_saves(&mut self, frame_sp: u32, frame: &FrameInfo);
    fn set_sp(&mut self, value: u32);
    fn set_pc(&mut self, value: u32);
    fn location(&self, reg: usize) -> Location;
    fn get_gpr(&self, memory: &StackMemory, reg: usize) -> u32;
    fn set_gpr(&mut self, memory: &StackMemory, reg: usize, value: u32);
    fn get_fpr(&self, memory: &StackMemory, reg: usize) -> u32;
    fn set_fpr(&mut self, memory: &StackMemory, reg: usize, value: u32);
    fn smash_caller_saves(&mut self);
    fn long_jump_image(&self, memory: &StackMemory) -> LongJumpImage;

    fn do_long_jump(&self, memory: &StackMemory, self_word: u32, trampoline: &mut dyn Trampoline) -> ! {
        let image = self.long_jump_image(memory);
        if let Some((addr, value)) = image.stack_write {
            memory.write_u32(addr, value);
        }
        if let Some(reg) = thread_register(image.isa) {
            assert_eq!(
                image.gprs[reg], self_word,
                "thread register does not hold the running thread"
            );
        }
        trampoline.long_jump(&image)
    }
}

pub fn create_context(isa: InstructionSet) -> Box<dyn Context> {
    match isa {
        InstructionSet::Arm => Box::new(ArmContext::new(false)),
        InstructionSet::Thumb2 => Box::new(ArmContext::new(true)),
        InstructionSet::X86 => Box::new(X86Context::new()),
        InstructionSet::Mips => Box::new(MipsContext::new()),
    }
}

fn thread_register(isa: InstructionSet) -> Option<usize> {
    match isa {
        InstructionSet::Arm | InstructionSet::Thumb2 => Some(crate::isa::arm::TR),
        InstructionSet::Mips => Some(crate::isa::mips::TR),
        InstructionSet::X86 => None,
    }
}

/// Location storage shared by the three architectures.
#[derive(Clone, Debug)]
pub(crate) struct Locations {
    gprs: Vec<Location>,
    fprs: Vec<Location>,
    scratch: [u32; 2],
}

impl Locations {
    pub(crate) fn new(num_gprs: usize, num_fprs: usize) -> Self {
        Self {
            gprs: vec![Location::Unset; num_gprs],
            fprs: vec![Location::Unset; num_fprs],
            scratch: [0; 2],
        }
    }

    pub(crate) fn clear(&mut self) {
        self.gprs.fill(Location::Unset);
        self.fprs.fill(Location::Unset);
    }

    pub(crate) fn bind_scratch(&mut self, reg: usize, slot: usize, value: u32) {
        self.gprs[reg] = Location::Scratch(slot);
        self.scratch[slot] = value;
    }

    pub(crate) fn set_scratch(&mut self, slot: usize, value: u32) {
        self.scratch[slot] = value;
    }

    pub(crate) fn scratch(&self, slot: usize) -> u32 {
        self.scratch[slot]
    }

    pub(crate) fn gpr_location(&self, reg: usize) -> Location {
        assert!(reg < self.gprs.len(), "register {reg} out of range");
        self.gprs[reg]
    }

    fn read(&self, memory: &StackMemory, location: Location, what: &str) -> u32 {
        match location {
            Location::Unset => panic!("{what} has no location"),
            Location::Stack(addr) => memory.read_u32(addr),
            Location::Scratch(slot) => self.scratch[slot],
            Location::Zero => 0,
        }
    }

    fn write(&mut self, memory: &StackMemory, location: Location, what: &str, value: u32) {
        match location {
            Location::Unset => panic!("{what} has no location"),
            Location::Zero => panic!("write to {what}, bound to the zero sentinel"),
            Location::Stack(addr) => memory.write_u32(addr, value),
            Location::Scratch(slot) => self.scratch[slot] = value,
        }
    }

    pub(crate) fn get_gpr(&self, memory: &StackMemory, reg: usize) -> u32 {
        let location = self.gpr_location(reg);
        self.read(memory, location, &format!("gpr {reg}"))
    }

    pub(crate) fn set_gpr(&mut self, memory: &StackMemory, reg: usize, value: u32) {
        let location = self.gpr_location(reg);
        self.write(memory, location, &format!("gpr {reg}"), value);
    }

    pub(crate) fn get_fpr(&self, memory: &StackMemory, reg: usize) -> u32 {
        assert!(reg < self.fprs.len(), "fp register {reg} out of range");
        self.read(memory, self.fprs[reg], &format!("fpr {reg}"))
    }

    pub(crate) fn set_fpr(&mut self, memory: &StackMemory, reg: usize, value: u32) {
        assert!(reg < self.fprs.len(), "fp register {reg} out of range");
        let location = self.fprs[reg];
        self.write(memory, location, &format!("fpr {reg}"), value);
    }

    /// The i-th of k core spills sits `(k - i)` words below the frame top; fp spills follow.
    pub(crate) fn fill_callee_saves(&mut self, frame_sp: u32, frame: &FrameInfo) {
        let core_spills = frame.num_core_spills();
        let fp_spills = frame.num_fp_spills();
        let mut seen = 0;
        for reg in 0..self.gprs.len() {
            if frame.core_spill_mask & (1 << reg) != 0 {
                let num = core_spills - 1 - seen;
                self.gprs[reg] = Location::Stack(frame_sp + frame.callee_save_offset(num));
                seen += 1;
            }
        }
        let mut seen = 0;
        for reg in 0..self.fprs.len() {
            if frame.fp_spill_mask & (1 << reg) != 0 {
                let num = core_spills + fp_spills - 1 - seen;
                self.fprs[reg] = Location::Stack(frame_sp + frame.callee_save_offset(num));
                seen += 1;
            }
        }
        debug_assert!(frame.frame_size >= (core_spills + fp_spills) * POINTER_SIZE);
    }

    pub(crate) fn smash(&mut self, zero: &[usize], unset: &[usize]) {
        for &reg in zero {
            self.gprs[reg] = Location::Zero;
        }
        for &reg in unset {
            self.gprs[reg] = Location::Unset;
        }
    }

    /// Every register's value, with unset ones replaced by their debug pattern.
    pub(crate) fn materialise(&self, memory: &StackMemory) -> (Vec<u32>, Vec<u32>) {
        let gprs = self
            .gprs
            .iter()
            .enumerate()
            .map(|(reg, location)| match location {
                Location::Unset => BAD_GPR_BASE + reg as u32,
                other => self.read(memory, *other, "gpr"),
            })
            .collect();
        let fprs = self
            .fprs
            .iter()
            .enumerate()
            .map(|(reg, location)| match location {
                Location::Unset => BAD_FPR_BASE + reg as u32,
                other => self.read(memory, *other, "fpr"),
            })
            .collect();
        (gprs, fprs)
    }
}

/// Trampoline that unwinds to [`catch_long_jump`] carrying the image.
pub struct UnwindTrampoline;

impl Trampoline for UnwindTrampoline {
    fn long_jump(&mut self, image: &LongJumpImage) -> ! {
        panic_any(image.clone())
    }
}

/// Runs `body`, returning the image if it long-jumped through an [`UnwindTrampoline`].
pub fn catch_long_jump<T>(body: impl FnOnce() -> T) -> Result<T, LongJumpImage> {
    match catch_unwind(AssertUnwindSafe(body)) {
        Ok(value) => Ok(value),
        Err(payload) => match downcast_image(payload) {
            Ok(image) => Err(image),
            Err(payload) => resume_unwind(payload),
        },
    }
}

fn downcast_image(payload: Box<dyn Any + Send>) -> Result<LongJumpImage, Box<dyn Any + Send>> {
    payload.downcast::<LongJumpImage>().map(|image| *image)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stack::memory::DEFAULT_STACK_BASE;

    #[test]
    fn every_context_reports_its_isa() {
        for isa in [
            InstructionSet::Arm,
            InstructionSet::Thumb2,
            InstructionSet::X86,
            InstructionSet::Mips,
        ] {
            assert_eq!(create_context(isa).instruction_set(), isa);
        }
    }

    #[test]
    fn long_jump_unwinds_to_the_catcher() {
        let memory = StackMemory::new(DEFAULT_STACK_BASE, 256);
        let mut context = create_context(InstructionSet::Mips);
        context.set_sp(DEFAULT_STACK_BASE + 128);
        context.set_pc(0x6010_0040);
        context.smash_caller_saves();
        let result: Result<(), LongJumpImage> = catch_long_jump(|| {
            // No thread register is bound, so the pattern stands in for the self word.
            context.do_long_jump(
                &memory,
                BAD_GPR_BASE + crate::isa::mips::TR as u32,
                &mut UnwindTrampoline,
            );
        });
        let image = result.expect_err("long jump never returns");
        assert_eq!(image.gprs[crate::isa::mips::SP], DEFAULT_STACK_BASE + 128);
        assert_eq!(image.gprs[crate::isa::mips::RA], 0x6010_0040);
        assert_eq!(image.gprs[crate::isa::mips::V0], 0);
    }
}
