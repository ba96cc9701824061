//! Target-independent code generation over the [`CodegenTarget`] seam.
//!
//! `translate` lowers MIR to LIR through the trait's emitters, and `assemble` turns LIR into
//! bytes and [`MachineInsn`](crate::compiler::lir::MachineInsn) records. Each backend owns
//! its encoding table.

/// Declares a backend's opcode enum together with its static encoding table.
macro_rules! encoding_table {
    ($vis:vis enum $name:ident {
        $($op:ident => ($mnemonic:literal, $fmt:literal, $size:literal, $flags:expr, $kind:expr),)*
    }) => {
        #[derive(Clone, Copy, Debug, PartialEq, Eq)]
        #[repr(u16)]
        $vis enum $name {
            $($op,)*
        }

        impl $name {
            const ALL: &'static [$name] = &[$($name::$op,)*];

            fn from_u16(value: u16) -> Option<Self> {
                Self::ALL.get(value as usize).copied()
            }
        }

        static ENCODINGS: &[$crate::compiler::lir::EncodingInfo] = &[$(
            $crate::compiler::lir::EncodingInfo {
                name: $mnemonic,
                fmt: $fmt,
                size: $size,
                flags: $flags,
                kind: $kind,
            },
        )*];
    };
}

pub mod assemble;
pub mod mips;
pub mod thumb2;
pub mod translate;
pub mod x86;

use crate::compiler::lir::{
    AliasInfo, AluOp, Cond, EncodingInfo, FpOp, Lir, LirId, LirOp, PseudoOp,
    UnaryOp, setup_resource_masks,
};
use crate::compiler::{CompilationUnit, CompileAbort, CompileResult};
use crate::isa::InstructionSet;

/// Fixed register conventions of one backend.
#[derive(Debug)]
pub struct TargetInfo {
    pub isa: InstructionSet,
    pub sp: i32,
    pub lr: i32,
    pub pc: i32,
    pub core_temps: &'static [i32],
    pub fp_temps: &'static [i32],
    /// Callee-save registers available for promotion, in preference order.
    pub promotable: &'static [i32],
    /// Argument registers of template and stub calls.
    pub args: &'static [i32],
    pub rets: [i32; 2],
    /// Holds the method id on entry to compiled code.
    pub method_reg: i32,
    /// Base of the vreg array inside a trace.
    pub trace_fp: i32,
    /// Reserved for the assembler and multi-instruction sequences.
    pub scratch: Option<i32>,
    /// Register shift counts must be in.
    pub shift_count_reg: Option<i32>,
    /// Register shifts use the low byte of the count, so the count needs `& 31`.
    pub mask_shift_count: bool,
    pub inline_fp: bool,
    pub inline_int_div: bool,
    /// `(dividend, remainder)` registers an inline divide is tied to.
    pub div_regs: Option<(i32, i32)>,
}

impl TargetInfo {
    /// Slot in the core spill mask for the return address.
    pub fn return_register(&self) -> usize {
        self.isa.return_address_register()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EncodeContext {
    pub code_begin: u32,
    /// Code-relative offset of the instruction.
    pub pc: u32,
    pub target_offset: Option<u32>,
    pub literal_offset: Option<u32>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EncodeError {
    /// The short form cannot reach; retry with `long_form` set.
    NeedsLongForm,
    OutOfRange,
}

pub trait CodegenTarget: Sync {
    fn info(&self) -> &'static TargetInfo;
    fn encoding(&self, opcode: u16) -> &'static EncodingInfo;
    /// Byte size of `lir` as it would currently encode.
    fn lir_size(&self, lir: &Lir) -> u8;
    fn encode(&self, lir: &Lir, ctx: &EncodeContext) -> Result<Vec<u8>, EncodeError>;
    /// Bytes replacing the call at absolute `from` with a jump to absolute `to`, or `None`
    /// when `to` is out of reach.
    fn chain_patch(&self, from: u32, to: u32) -> Option<Vec<u8>>;

    fn op_reg_copy(&self, cu: &mut CompilationUnit<'_>, rd: i32, rs: i32) -> LirId;
    fn load_constant(&self, cu: &mut CompilationUnit<'_>, rd: i32, value: i32) -> CompileResult<()>;
    fn load_class_literal(
        &self,
        cu: &mut CompilationUnit<'_>,
        rd: i32,
        value: u32,
    ) -> CompileResult<()> {
        cu.add_class_literal(value);
        self.load_constant(cu, rd, value as i32)
    }
    fn op_reg_reg_reg(
        &self,
        cu: &mut CompilationUnit<'_>,
        op: AluOp,
        rd: i32,
        rs: i32,
        rt: i32,
    ) -> CompileResult<()>;
    fn op_reg_reg_imm(
        &self,
        cu: &mut CompilationUnit<'_>,
        op: AluOp,
        rd: i32,
        rs: i32,
        imm: i32,
    ) -> CompileResult<()>;
    fn op_unary(&self, cu: &mut CompilationUnit<'_>, op: UnaryOp, rd: i32, rs: i32)
    -> CompileResult<()>;
    fn op_fp_rrr(
        &self,
        cu: &mut CompilationUnit<'_>,
        _op: FpOp,
        _fd: i32,
        _fs: i32,
        _ft: i32,
    ) -> CompileResult<()> {
        Err(CompileAbort::Internal(format!(
            "{} has no inline float arithmetic",
            cu.isa
        )))
    }
    fn load_base_disp(
        &self,
        cu: &mut CompilationUnit<'_>,
        rd: i32,
        base: i32,
        disp: i32,
        alias: Option<AliasInfo>,
    ) -> CompileResult<LirId>;
    fn store_base_disp(
        &self,
        cu: &mut CompilationUnit<'_>,
        rs: i32,
        base: i32,
        disp: i32,
        alias: Option<AliasInfo>,
    ) -> CompileResult<LirId>;
    fn load_base_indexed(
        &self,
        cu: &mut CompilationUnit<'_>,
        rd: i32,
        base: i32,
        index: i32,
        scale: i32,
        disp: i32,
    ) -> CompileResult<()>;
    fn store_base_indexed(
        &self,
        cu: &mut CompilationUnit<'_>,
        rs: i32,
        base: i32,
        index: i32,
        scale: i32,
        disp: i32,
    ) -> CompileResult<()>;
    /// Emits `if (rs cond rt) goto ?` and returns the branch to aim later.
    fn op_cmp_branch(
        &self,
        cu: &mut CompilationUnit<'_>,
        cond: Cond,
        rs: i32,
        rt: i32,
    ) -> CompileResult<LirId>;
    fn op_cmp_imm_branch(
        &self,
        cu: &mut CompilationUnit<'_>,
        cond: Cond,
        rs: i32,
        imm: i32,
    ) -> CompileResult<LirId>;
    fn op_branch(&self, cu: &mut CompilationUnit<'_>) -> LirId;
    fn call_direct(&self, cu: &mut CompilationUnit<'_>, target: u32) -> LirId;
    fn emit_data_word(&self, cu: &mut CompilationUnit<'_>, value: u32) -> LirId;
    fn gen_prologue(&self, cu: &mut CompilationUnit<'_>) -> CompileResult<()>;
    fn gen_epilogue(&self, cu: &mut CompilationUnit<'_>) -> CompileResult<()>;

    /// 64-bit add or subtract on register pairs `(lo, hi)`.
    fn gen_long_arith(
        &self,
        cu: &mut CompilationUnit<'_>,
        op: AluOp,
        dest: (i32, i32),
        a: (i32, i32),
        b: (i32, i32),
    ) -> CompileResult<()> {
        let (low, high) = match op {
            AluOp::Add => (AluOp::Adds, AluOp::Adc),
            AluOp::Sub => (AluOp::Subs, AluOp::Sbc),
            other => {
                self.op_reg_reg_reg(cu, other, dest.0, a.0, b.0)?;
                return self.op_reg_reg_reg(cu, other, dest.1, a.1, b.1);
            }
        };
        self.op_reg_reg_reg(cu, low, dest.0, a.0, b.0)?;
        self.op_reg_reg_reg(cu, high, dest.1, a.1, b.1)
    }

    /// Inline integer division of registers already checked for a zero divisor; returns the
    /// register holding the result. Only called when `inline_int_div` is set.
    fn gen_div_rem(
        &self,
        cu: &mut CompilationUnit<'_>,
        _dividend: i32,
        _divisor: i32,
        _is_div: bool,
    ) -> CompileResult<i32> {
        Err(CompileAbort::Internal(format!(
            "{} divides through a template",
            cu.isa
        )))
    }
}

/// Fills size and resource masks of `lir` and appends it.
pub fn emit_lir(cu: &mut CompilationUnit<'_>, target: &dyn CodegenTarget, mut lir: Lir) -> LirId {
    if let LirOp::Target(opcode) = lir.opcode {
        let info = target.info();
        setup_resource_masks(&mut lir, target.encoding(opcode), info.sp, info.lr, info.pc);
        lir.size = target.lir_size(&lir);
    }
    cu.append_lir(lir)
}

pub fn emit(
    cu: &mut CompilationUnit<'_>,
    target: &dyn CodegenTarget,
    opcode: u16,
    operands: [i32; 5],
) -> LirId {
    let lir = Lir::new(LirOp::Target(opcode), cu.current_dalvik_offset, operands);
    emit_lir(cu, target, lir)
}

pub fn emit_pseudo(cu: &mut CompilationUnit<'_>, op: PseudoOp, operand: i32) -> LirId {
    let lir = Lir::pseudo(op, cu.current_dalvik_offset, operand);
    cu.append_lir(lir)
}

/// Pads `values` to a LIR operand array.
pub fn operands(values: &[i32]) -> [i32; 5] {
    let mut out = [0; 5];
    for (slot, value) in out.iter_mut().zip(values) {
        *slot = *value;
    }
    out
}

/// Temp for a short sequence; freed by the next `reset_reg_pool`.
pub fn scratch_temp(cu: &mut CompilationUnit<'_>) -> CompileResult<i32> {
    let dex_pc = cu.current_dalvik_offset;
    cu.reg_pool
        .alloc_temp()
        .ok_or(CompileAbort::OutOfTemps { dex_pc })
}

/// Backend for `isa`; ARM code is generated as Thumb2.
pub fn target_for(isa: InstructionSet) -> &'static dyn CodegenTarget {
    match isa {
        InstructionSet::Arm | InstructionSet::Thumb2 => &thumb2::Thumb2Target,
        InstructionSet::X86 => &x86::X86Target,
        InstructionSet::Mips => &mips::MipsTarget,
    }
}
