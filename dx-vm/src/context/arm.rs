use super::{BAD_GPR_BASE, Context, Location, Locations, LongJumpImage};
use crate::isa::InstructionSet;
use crate::isa::arm::{NUM_CORE_REGISTERS, NUM_S_REGISTERS, PC, R0, R1, R2, R3, SP};
use crate::stack::frame_layout::FrameInfo;
use crate::stack::memory::StackMemory;

const SP_SLOT: usize = 0;
const PC_SLOT: usize = 1;

/// ARM and Thumb2 share a register file; Thumb2 marks the resumed PC with bit 0.
pub struct ArmContext {
    thumb: bool,
    locations: Locations,
}

impl ArmContext {
    pub fn new(thumb: bool) -> Self {
        let mut context = Self {
            thumb,
            locations: Locations::new(NUM_CORE_REGISTERS, NUM_S_REGISTERS),
        };
        context.reset();
        context
    }
}

impl Context for ArmContext {
    fn instruction_set(&self) -> InstructionSet {
        if self.thumb {
            InstructionSet::Thumb2
        } else {
            InstructionSet::Arm
        }
    }

    fn reset(&mut self) {
        self.locations.clear();
        self.locations
            .bind_scratch(SP, SP_SLOT, BAD_GPR_BASE + SP as u32);
        self.locations
            .bind_scratch(PC, PC_SLOT, BAD_GPR_BASE + PC as u32);
    }

    fn fill_callee_saves(&mut self, frame_sp: u32, frame: &FrameInfo) {
        self.locations.fill_callee_saves(frame_sp, frame);
    }

    fn set_sp(&mut self, value: u32) {
        assert_eq!(self.locations.gpr_location(SP), Location::Scratch(SP_SLOT));
        self.locations.set_scratch(SP_SLOT, value);
    }

    fn set_pc(&mut self, value: u32) {
        assert_eq!(self.locations.gpr_location(PC), Location::Scratch(PC_SLOT));
        self.locations.set_scratch(PC_SLOT, value);
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
        self.locations.smash(&[R0, R1], &[R2, R3]);
    }

    fn long_jump_image(&self, memory: &StackMemory) -> LongJumpImage {
        let (mut gprs, fprs) = self.locations.materialise(memory);
        if self.thumb {
            gprs[PC] |= 1;
        }
        LongJumpImage {
            isa: self.instruction_set(),
            gprs,
            fprs,
            stack_write: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::BAD_FPR_BASE;
    use crate::isa::arm::{LR, R4, R5, R7, R9, R11};
    use crate::stack::memory::DEFAULT_STACK_BASE;

    fn memory() -> StackMemory {
        StackMemory::new(DEFAULT_STACK_BASE, 1024)
    }

    #[test]
    fn reset_leaves_only_sp_and_pc_bound() {
        let memory = memory();
        let context = ArmContext::new(true);
        assert_eq!(context.get_gpr(&memory, SP), BAD_GPR_BASE + 13);
        assert_eq!(context.get_gpr(&memory, PC), BAD_GPR_BASE + 15);
        assert_eq!(context.location(R4), Location::Unset);
    }

    #[test]
    fn callee_saves_pack_downward_from_the_frame_top() {
        let memory = memory();
        let mut context = ArmContext::new(false);
        let sp = DEFAULT_STACK_BASE + 256;
        // Four non-contiguous core spills and two fp spills.
        let frame = FrameInfo::new(64, 1 << R4 | 1 << R7 | 1 << R11 | 1 << LR, 1 << 16 | 1 << 20);
        context.fill_callee_saves(sp, &frame);
        let top = sp + 64;
        assert_eq!(context.location(R4), Location::Stack(top - 16));
        assert_eq!(context.location(R7), Location::Stack(top - 12));
        assert_eq!(context.location(R11), Location::Stack(top - 8));
        assert_eq!(context.location(LR), Location::Stack(top - 4));
        memory.write_u32(top - 24, 0x3f80_0000);
        assert_eq!(context.get_fpr(&memory, 16), 0x3f80_0000);
        memory.write_u32(top - 20, 7);
        assert_eq!(context.get_fpr(&memory, 20), 7);
    }

    #[test]
    fn thumb_long_jump_sets_the_mode_bit() {
        let memory = memory();
        let mut context = ArmContext::new(true);
        context.set_pc(0x6010_0040);
        context.set_sp(DEFAULT_STACK_BASE + 512);
        let image = context.long_jump_image(&memory);
        assert_eq!(image.gprs[PC], 0x6010_0041);
        assert_eq!(image.gprs[R5], BAD_GPR_BASE + 5);
        assert_eq!(image.gprs[R9], BAD_GPR_BASE + 9);
        assert_eq!(image.fprs[3], BAD_FPR_BASE + 3);
    }

    #[test]
    #[should_panic(expected = "zero sentinel")]
    fn smashed_return_registers_reject_writes() {
        let memory = memory();
        let mut context = ArmContext::new(false);
        context.smash_caller_saves();
        assert_eq!(context.get_gpr(&memory, R0), 0);
        context.set_gpr(&memory, R1, 5);
    }

    #[test]
    #[should_panic(expected = "zero sentinel")]
    fn thumb2_smashed_return_registers_reject_writes() {
        let memory = memory();
        let mut context = ArmContext::new(true);
        context.smash_caller_saves();
        assert_eq!(context.get_gpr(&memory, R0), 0);
        context.set_gpr(&memory, R1, 5);
    }

    #[test]
    #[should_panic(expected = "no location")]
    fn smashed_argument_registers_are_unset() {
        let memory = memory();
        let mut context = ArmContext::new(false);
        context.smash_caller_saves();
        context.get_gpr(&memory, R2);
    }
}
