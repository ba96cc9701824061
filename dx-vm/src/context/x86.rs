use super::{BAD_GPR_BASE, Context, Location, Locations, LongJumpImage};
use crate::isa::InstructionSet;
use crate::isa::x86::{EAX, EBX, ECX, EDX, ESP, NUM_CPU_REGISTERS, RETURN_ADDRESS};
use crate::stack::frame_layout::{FrameInfo, POINTER_SIZE};
use crate::stack::memory::StackMemory;

const ESP_SLOT: usize = 0;
const EIP_SLOT: usize = 1;

/// x86 has no architectural PC register; EIP lives in a scratch word and is restored by `ret`.
pub struct X86Context {
    locations: Locations,
}

impl Default for X86Context {
    fn default() -> Self {
        Self::new()
    }
}

impl X86Context {
    pub fn new() -> Self {
        let mut context = Self {
            locations: Locations::new(NUM_CPU_REGISTERS, 0),
        };
        context.reset();
        context
    }

    pub fn eip(&self) -> u32 {
        self.locations.scratch(EIP_SLOT)
    }
}

impl Context for X86Context {
    fn instruction_set(&self) -> InstructionSet {
        InstructionSet::X86
    }

    fn reset(&mut self) {
        self.locations.clear();
        self.locations
            .bind_scratch(ESP, ESP_SLOT, BAD_GPR_BASE + ESP as u32);
        self.locations
            .set_scratch(EIP_SLOT, BAD_GPR_BASE + RETURN_ADDRESS as u32);
    }

    fn fill_callee_saves(&mut self, frame_sp: u32, frame: &FrameInfo) {
        // The return-address bit counts toward the packing but is not a register.
        self.locations.fill_callee_saves(frame_sp, frame);
    }

    fn set_sp(&mut self, value: u32) {
        assert_eq!(self.locations.gpr_location(ESP), Location::Scratch(ESP_SLOT));
        self.locations.set_scratch(ESP_SLOT, value);
    }

    fn set_pc(&mut self, value: u32) {
        self.locations.set_scratch(EIP_SLOT, value);
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

    fn get_fpr(&self, _memory: &StackMemory, reg: usize) -> u32 {
        panic!("x86 context has no fp register {reg}")
    }

    fn set_fpr(&mut self, _memory: &StackMemory, reg: usize, _value: u32) {
        panic!("x86 context has no fp register {reg}")
    }

    fn smash_caller_saves(&mut self) {
        self.locations.smash(&[EAX, EDX], &[ECX, EBX]);
    }

    /// Reverse register order plus one slot: `popad; pop esp; ret` resumes at EIP.
    fn long_jump_image(&self, memory: &StackMemory) -> LongJumpImage {
        let (registers, _) = self.locations.materialise(memory);
        let mut gprs = vec![0; NUM_CPU_REGISTERS + 1];
        for (reg, value) in registers.iter().enumerate() {
            gprs[NUM_CPU_REGISTERS - reg - 1] = *value;
        }
        let esp = gprs[NUM_CPU_REGISTERS - ESP - 1] - POINTER_SIZE;
        gprs[NUM_CPU_REGISTERS] = esp;
        LongJumpImage {
            isa: InstructionSet::X86,
            gprs,
            fprs: Vec::new(),
            stack_write: Some((esp, self.eip())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isa::x86::{EBP, EDI, ESI};
    use crate::stack::memory::DEFAULT_STACK_BASE;

    #[test]
    fn reset_pattern() {
        let memory = StackMemory::new(DEFAULT_STACK_BASE, 256);
        let context = X86Context::new();
        assert_eq!(context.get_gpr(&memory, ESP), BAD_GPR_BASE + 4);
        assert_eq!(context.eip(), BAD_GPR_BASE + 8);
        assert_eq!(context.location(EAX), Location::Unset);
    }

    #[test]
    fn return_address_counts_toward_spill_packing() {
        let mut context = X86Context::new();
        let sp = DEFAULT_STACK_BASE + 128;
        let frame = FrameInfo::new(32, 1 << EBP | 1 << EDI | 1 << RETURN_ADDRESS, 0);
        context.fill_callee_saves(sp, &frame);
        assert_eq!(context.location(EBP), Location::Stack(sp + 32 - 12));
        assert_eq!(context.location(EDI), Location::Stack(sp + 32 - 8));
        assert_eq!(context.location(ESI), Location::Unset);
    }

    #[test]
    fn long_jump_image_is_reversed_with_an_esp_slot() {
        let memory = StackMemory::new(DEFAULT_STACK_BASE, 256);
        let mut context = X86Context::new();
        let esp = DEFAULT_STACK_BASE + 0x80;
        context.set_sp(esp);
        context.set_pc(0x6010_0020);
        context.smash_caller_saves();
        let image = context.long_jump_image(&memory);
        assert_eq!(image.gprs.len(), 9);
        assert_eq!(image.gprs[NUM_CPU_REGISTERS - 1], 0, "eax restored as zero");
        assert_eq!(image.gprs[NUM_CPU_REGISTERS - ESP - 1], esp);
        assert_eq!(image.gprs[0], BAD_GPR_BASE + EDI as u32);
        assert_eq!(image.gprs[8], esp - 4);
        assert_eq!(image.stack_write, Some((esp - 4, 0x6010_0020)));
    }

    #[test]
    #[should_panic(expected = "zero sentinel")]
    fn smashed_edx_rejects_writes() {
        let memory = StackMemory::new(DEFAULT_STACK_BASE, 256);
        let mut context = X86Context::new();
        context.smash_caller_saves();
        context.set_gpr(&memory, EDX, 1);
    }
}
