use super::{BAD_GPR_BASE, Context, Location, Locations, LongJumpImage};
use crate::isa::InstructionSet;
use crate::isa::mips::{A1, A2, A3, NUM_CORE_REGISTERS, NUM_F_REGISTERS, RA, SP, V0, V1};
use crate::stack::frame_layout::FrameInfo;
use crate::stack::memory::StackMemory;

const SP_SLOT: usize = 0;
const RA_SLOT: usize = 1;

/// MIPS resumes through RA, so the PC is written there.
pub struct MipsContext {
    locations: Locations,
}

impl Default for MipsContext {
    fn default() -> Self {
        Self::new()
    }
}

impl MipsContext {
    pub fn new() -> Self {
        let mut context = Self {
            locations: Locations::new(NUM_CORE_REGISTERS, NUM_F_REGISTERS),
        };
        context.reset();
        context
    }
}

impl Context for MipsContext {
    fn instruction_set(&self) -> InstructionSet {
        InstructionSet::Mips
    }

    fn reset(&mut self) {
        self.locations.clear();
        self.locations
            .bind_scratch(SP, SP_SLOT, BAD_GPR_BASE + SP as u32);
        self.locations
            .bind_scratch(RA, RA_SLOT, BAD_GPR_BASE + RA as u32);
    }

    fn fill_callee_saves(&mut self, frame_sp: u32, frame: &FrameInfo) {
        self.locations.fill_callee_saves(frame_sp, frame);
    }

    fn set_sp(&mut self, value: u32) {
        assert_eq!(self.locations.gpr_location(SP), Location::Scratch(SP_SLOT));
        self.locations.set_scratch(SP_SLOT, value);
    }

    fn set_pc(&mut self, value: u32) {
        // RA may have been rebound to a spill slot by fill_callee_saves.
        self.locations.bind_scratch(RA, RA_SLOT, value);
    }

    fn location(&self, reg: usize) -> Location {
        self.locations.gpr_location(reg)
    }

    fn get_gpr(&self, memory: &StackMemory, reg: usize) -> u32 {
        self.locations.get_gpr(memory, reg)
    }

    fn set_gpr(&mut self, memory: &StackMemory, reg: usize, value: u32) {
        self.locations.set_gpr(memory, reg, value);
    }

    fn get_fpr(&self, memory: &StackMemory, reg: usize) -> u32 {
        self.locations.get_fpr(memory, reg)
    }

    fn set_fpr(&mut self, memory: &StackMemory, reg: usize, value: u32) {
        self.locations.set_fpr(memory, reg, value);
    }

    fn smash_caller_saves(&mut self) {
        self.locations.smash(&[V0, V1], &[A1, A2, A3]);
    }

    fn long_jump_image(&self, memory: &StackMemory) -> LongJumpImage {
        let (gprs, fprs) = self.locations.materialise(memory);
        LongJumpImage {
            isa: InstructionSet::Mips,
            gprs,
            fprs,
            stack_write: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isa::mips::{FP, S0, S2, S7};
    use crate::stack::memory::DEFAULT_STACK_BASE;

    #[test]
    fn reset_binds_sp_and_ra() {
        let memory = StackMemory::new(DEFAULT_STACK_BASE, 256);
        let context = MipsContext::new();
        assert_eq!(context.get_gpr(&memory, SP), BAD_GPR_BASE + 29);
        assert_eq!(context.get_gpr(&memory, RA), BAD_GPR_BASE + 31);
    }

    #[test]
    fn single_spill_sits_just_below_the_top() {
        let mut context = MipsContext::new();
        let sp = DEFAULT_STACK_BASE + 64;
        context.fill_callee_saves(sp, &FrameInfo::new(16, 1 << RA, 0));
        assert_eq!(context.location(RA), Location::Stack(sp + 12));
    }

    #[test]
    fn round_trip_through_spill_slots() {
        let memory = StackMemory::new(DEFAULT_STACK_BASE, 256);
        let mut context = MipsContext::new();
        let sp = DEFAULT_STACK_BASE + 64;
        let frame = FrameInfo::new(48, 1 << S0 | 1 << S2 | 1 << S7 | 1 << FP | 1 << RA, 0);
        context.fill_callee_saves(sp, &frame);
        for (reg, value) in [(S0, 10), (S2, 20), (S7, 70), (FP, 30)] {
            context.set_gpr(&memory, reg, value);
        }
        for (reg, value) in [(S0, 10), (S2, 20), (S7, 70), (FP, 30)] {
            assert_eq!(context.get_gpr(&memory, reg), value);
        }
        assert_eq!(memory.read_u32(sp + 48 - 20), 10);
    }

    #[test]
    #[should_panic(expected = "zero sentinel")]
    fn smashed_v0_rejects_writes() {
        let memory = StackMemory::new(DEFAULT_STACK_BASE, 256);
        let mut context = MipsContext::new();
        context.smash_caller_saves();
        context.set_gpr(&memory, V0, 1);
    }
}
