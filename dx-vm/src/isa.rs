use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstructionSet {
    Arm,
    Thumb2,
    X86,
    Mips,
}

impl InstructionSet {
    pub fn name(self) -> &'static str {
        match self {
            InstructionSet::Arm => "arm",
            InstructionSet::Thumb2 => "thumb2",
            InstructionSet::X86 => "x86",
            InstructionSet::Mips => "mips",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "arm" => Some(InstructionSet::Arm),
            "thumb2" | "thumb" => Some(InstructionSet::Thumb2),
            "x86" => Some(InstructionSet::X86),
            "mips" => Some(InstructionSet::Mips),
            _ => None,
        }
    }

    /// Register number of the slot holding the return address in the core spill mask.
    pub fn return_address_register(self) -> usize {
        match self {
            InstructionSet::Arm | InstructionSet::Thumb2 => arm::LR,
            InstructionSet::X86 => x86::RETURN_ADDRESS,
            InstructionSet::Mips => mips::RA,
        }
    }

    /// Spill masks of the runtime frame that saves every callee-save register.
    pub fn callee_save_masks(self) -> (u32, u32) {
        match self {
            InstructionSet::Arm | InstructionSet::Thumb2 => {
                let core = (4..=11).fold(1 << arm::LR, |mask, reg| mask | 1 << reg);
                let fp = (16..32).fold(0u32, |mask, reg| mask | 1 << reg);
                (core, fp)
            }
            InstructionSet::X86 => (
                1 << x86::EBP | 1 << x86::ESI | 1 << x86::EDI | 1 << x86::RETURN_ADDRESS,
                0,
            ),
            InstructionSet::Mips => {
                let core = (16..=23).fold(1 << mips::FP | 1 << mips::RA, |mask, reg| {
                    mask | 1 << reg
                });
                (core, 0)
            }
        }
    }
}

impl fmt::Display for InstructionSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

pub mod arm {
    pub const R0: usize = 0;
    pub const R1: usize = 1;
    pub const R2: usize = 2;
    pub const R3: usize = 3;
    pub const R4: usize = 4;
    pub const R5: usize = 5;
    pub const R6: usize = 6;
    pub const R7: usize = 7;
    pub const R8: usize = 8;
    pub const R9: usize = 9;
    pub const R10: usize = 10;
    pub const R11: usize = 11;
    pub const R12: usize = 12;
    pub const SP: usize = 13;
    pub const LR: usize = 14;
    pub const PC: usize = 15;
    /// Thread register.
    pub const TR: usize = R9;
    pub const NUM_CORE_REGISTERS: usize = 16;
    pub const NUM_S_REGISTERS: usize = 32;
}

pub mod x86 {
    pub const EAX: usize = 0;
    pub const ECX: usize = 1;
    pub const EDX: usize = 2;
    pub const EBX: usize = 3;
    pub const ESP: usize = 4;
    pub const EBP: usize = 5;
    pub const ESI: usize = 6;
    pub const EDI: usize = 7;
    /// Pseudo register standing for the return address pushed by `call`.
    pub const RETURN_ADDRESS: usize = 8;
    pub const NUM_CPU_REGISTERS: usize = 8;
}

pub mod mips {
    pub const ZERO: usize = 0;
    pub const AT: usize = 1;
    pub const V0: usize = 2;
    pub const V1: usize = 3;
    pub const A0: usize = 4;
    pub const A1: usize = 5;
    pub const A2: usize = 6;
    pub const A3: usize = 7;
    pub const T0: usize = 8;
    pub const T1: usize = 9;
    pub const T2: usize = 10;
    pub const T3: usize = 11;
    pub const T4: usize = 12;
    pub const T5: usize = 13;
    pub const T6: usize = 14;
    pub const T7: usize = 15;
    pub const S0: usize = 16;
    pub const S1: usize = 17;
    pub const S2: usize = 18;
    pub const S3: usize = 19;
    pub const S4: usize = 20;
    pub const S5: usize = 21;
    pub const S6: usize = 22;
    pub const S7: usize = 23;
    pub const T8: usize = 24;
    pub const T9: usize = 25;
    pub const K0: usize = 26;
    pub const K1: usize = 27;
    pub const GP: usize = 28;
    pub const SP: usize = 29;
    pub const FP: usize = 30;
    pub const RA: usize = 31;
    /// Thread register.
    pub const TR: usize = S1;
    pub const NUM_CORE_REGISTERS: usize = 32;
    pub const NUM_F_REGISTERS: usize = 32;
}
