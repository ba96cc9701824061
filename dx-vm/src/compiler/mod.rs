//! Method and trace compiler.
//!
//! A [`CompilationUnit`] lives for one compilation and borrows every list it builds from the
//! context's [`Arena`]. The driver resets the arena once the unit is gone.

pub mod arena;
pub mod bit_vector;
pub mod code_cache;
pub mod codegen;
pub mod dataflow;
pub mod driver;
pub mod growable_list;
pub mod lir;
pub mod local_opt;
pub mod mir;
pub mod ralloc;
pub mod templates;
pub mod worker;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::bytecode::Opcode;
use crate::decoder::DecodeError;
use crate::isa::InstructionSet;
use crate::method::Method;
use crate::stack::frame_layout::FrameInfo;

use arena::Arena;
use bit_vector::BitVector;
use growable_list::GrowableList;
use lir::{INVALID_REG, Lir, LirId};
use mir::{BasicBlock, BlockId, Mir};
use ralloc::RegisterPool;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CompileAbort {
    NoCode,
    UnsupportedOpcode { dex_pc: u32, opcode: Opcode },
    OutOfTemps { dex_pc: u32 },
    BranchOutOfRange { offset: u32 },
    CodeCacheFull { requested: u32 },
    FrameTooLarge { frame_size: u32 },
    EmptyTrace { dex_pc: u32 },
    Decode(DecodeError),
    AssemblerRetries,
    Internal(String),
}

impl fmt::Display for CompileAbort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompileAbort::NoCode => f.write_str("method has no code item"),
            CompileAbort::UnsupportedOpcode { dex_pc, opcode } => {
                write!(f, "unsupported opcode {opcode} at 0x{dex_pc:04x}")
            }
            CompileAbort::OutOfTemps { dex_pc } => {
                write!(f, "ran out of temp registers at 0x{dex_pc:04x}")
            }
            CompileAbort::BranchOutOfRange { offset } => {
                write!(f, "branch at native offset 0x{offset:x} is out of range")
            }
            CompileAbort::CodeCacheFull { requested } => {
                write!(f, "code cache cannot fit {requested} more bytes")
            }
            CompileAbort::FrameTooLarge { frame_size } => {
                write!(f, "frame of {frame_size} bytes exceeds the walker limit")
            }
            CompileAbort::EmptyTrace { dex_pc } => {
                write!(f, "no compilable instruction at trace head 0x{dex_pc:04x}")
            }
            CompileAbort::Decode(err) => write!(f, "decode failed: {err}"),
            CompileAbort::AssemblerRetries => {
                f.write_str("assembler did not converge on instruction sizes")
            }
            CompileAbort::Internal(message) => write!(f, "internal error: {message}"),
        }
    }
}

impl std::error::Error for CompileAbort {}

impl From<DecodeError> for CompileAbort {
    fn from(err: DecodeError) -> Self {
        CompileAbort::Decode(err)
    }
}

pub type CompileResult<T> = Result<T, CompileAbort>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompileMode {
    Method,
    Trace,
}

/// Literal indices at or above this name the class pointer pool.
pub const CLASS_LITERAL_FLAG: usize = 1 << 20;

/// One entry of a literal pool; `lir` is the data word once the pool is emitted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Literal {
    pub value: u32,
    pub lir: Option<LirId>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FixupTarget {
    Block(BlockId),
    PcReconstruction(usize),
}

/// Branch whose label did not exist when it was emitted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Fixup {
    pub branch: LirId,
    pub target: FixupTarget,
}

pub struct CompilationUnit<'a> {
    pub arena: &'a Arena,
    pub method: Arc<Method>,
    pub code: &'a [u16],
    pub isa: InstructionSet,
    pub mode: CompileMode,
    pub entry_dex_pc: u32,
    pub num_regs: u32,
    pub num_ins: u32,
    pub num_locals: u32,
    pub blocks: GrowableList<'a, BasicBlock>,
    pub mirs: GrowableList<'a, Mir>,
    pub lirs: GrowableList<'a, Lir>,
    pub literals: GrowableList<'a, Literal>,
    pub class_literals: GrowableList<'a, Literal>,
    pub fixups: GrowableList<'a, Fixup>,
    /// Dex pcs of the interpreter re-entry cells, one per throwing site.
    pub pc_reconstruction: GrowableList<'a, u32>,
    pub pcr_labels: GrowableList<'a, Option<LirId>>,
    pub reg_pool: RegisterPool<'a>,
    pub ssa_to_vreg: GrowableList<'a, i32>,
    /// SSA names already known to be non-null.
    pub null_checked: BitVector<'a>,
    /// Physical register per vreg, `INVALID_REG` when the vreg lives in the frame.
    pub promoted: &'a mut [i32],
    pub promotion_enabled: bool,
    pub frame: FrameInfo,
    /// Reference bitmap in effect before each instruction.
    pub reference_maps: BTreeMap<u32, Vec<u8>>,
    pub current_dalvik_offset: u32,
    pub punts: u32,
}

impl<'a> CompilationUnit<'a> {
    pub fn new(
        arena: &'a Arena,
        method: Arc<Method>,
        isa: InstructionSet,
        mode: CompileMode,
        entry_dex_pc: u32,
        reg_pool: RegisterPool<'a>,
    ) -> CompileResult<Self> {
        let Some(item) = method.code_item() else {
            return Err(CompileAbort::NoCode);
        };
        let code: &'a mut [u16] = arena.alloc_slice(item.insns.len(), 0u16);
        code.copy_from_slice(&item.insns);
        let num_regs = item.registers_size as u32;
        let num_ins = item.ins_size as u32;
        let num_locals = item.num_locals();
        let promoted = arena.alloc_slice(num_regs as usize, INVALID_REG);
        Ok(Self {
            arena,
            code,
            isa,
            mode,
            entry_dex_pc,
            num_regs,
            num_ins,
            num_locals,
            blocks: GrowableList::new(arena, 8),
            mirs: GrowableList::new(arena, 32),
            lirs: GrowableList::new(arena, 128),
            literals: GrowableList::new(arena, 8),
            class_literals: GrowableList::new(arena, 4),
            fixups: GrowableList::new(arena, 16),
            pc_reconstruction: GrowableList::new(arena, 8),
            pcr_labels: GrowableList::new(arena, 8),
            reg_pool,
            ssa_to_vreg: GrowableList::new(arena, num_regs as usize * 2 + 4),
            null_checked: BitVector::new(arena, num_regs as usize + 32, true),
            promoted,
            promotion_enabled: true,
            frame: FrameInfo::new(0, 0, 0),
            reference_maps: BTreeMap::new(),
            current_dalvik_offset: 0,
            punts: 0,
            method,
        })
    }

    pub fn is_method(&self) -> bool {
        self.mode == CompileMode::Method
    }

    pub fn append_lir(&mut self, mut lir: Lir) -> LirId {
        lir.dalvik_offset = self.current_dalvik_offset;
        self.lirs.push(lir)
    }

    pub fn vreg_of(&self, s_reg: i32) -> i32 {
        self.ssa_to_vreg.get(s_reg as usize)
    }

    pub fn new_ssa_name(&mut self, vreg: i32) -> i32 {
        self.ssa_to_vreg.push(vreg) as i32
    }

    pub fn promoted_reg(&self, vreg: i32) -> Option<i32> {
        if vreg < 0 {
            return None;
        }
        match self.promoted.get(vreg as usize) {
            Some(&reg) if reg != INVALID_REG => Some(reg),
            _ => None,
        }
    }

    pub fn add_literal(&mut self, value: u32) -> usize {
        if let Some(index) = self.literals.iter().position(|lit| lit.value == value) {
            return index;
        }
        self.literals.push(Literal { value, lir: None })
    }

    /// Existing literal `base` with `value - base` in `0..=255`.
    pub fn find_near_literal(&self, value: u32) -> Option<(usize, u32)> {
        self.literals
            .iter()
            .enumerate()
            .find(|(_, lit)| value.wrapping_sub(lit.value) <= 255)
            .map(|(index, lit)| (index, value.wrapping_sub(lit.value)))
    }

    pub fn add_class_literal(&mut self, value: u32) -> usize {
        if let Some(index) = self.class_literals.iter().position(|lit| lit.value == value) {
            return index;
        }
        self.class_literals.push(Literal { value, lir: None })
    }

    fn literal(&self, literal: usize) -> Option<Literal> {
        if literal >= CLASS_LITERAL_FLAG {
            let index = literal - CLASS_LITERAL_FLAG;
            (index < self.class_literals.len()).then(|| self.class_literals.get(index))
        } else {
            (literal < self.literals.len()).then(|| self.literals.get(literal))
        }
    }

    /// Data word emitted for a literal, once the pools are laid out.
    pub fn literal_lir(&self, literal: usize) -> Option<LirId> {
        self.literal(literal).and_then(|lit| lit.lir)
    }

    pub fn literal_value(&self, literal: usize) -> Option<u32> {
        self.literal(literal).map(|lit| lit.value)
    }

    /// Index of the re-entry cell for `dex_pc`, created on first use.
    pub fn pc_reconstruction_cell(&mut self, dex_pc: u32) -> usize {
        if let Some(index) = self.pc_reconstruction.iter().position(|pc| pc == dex_pc) {
            return index;
        }
        self.pcr_labels.push(None);
        self.pc_reconstruction.push(dex_pc)
    }

    pub fn add_fixup(&mut self, branch: LirId, target: FixupTarget) {
        self.fixups.push(Fixup { branch, target });
    }
}

impl fmt::Debug for CompilationUnit<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompilationUnit")
            .field("method", &self.method.pretty_name())
            .field("isa", &self.isa)
            .field("mode", &self.mode)
            .field("blocks", &self.blocks.len())
            .field("mirs", &self.mirs.len())
            .field("lirs", &self.lirs.len())
            .finish()
    }
}
