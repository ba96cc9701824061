//! Thumb2 backend.
//!
//! Register and displacement driven 16-bit forms are chosen when the LIR is built. Literal
//! loads and branches start short and the assembler widens them when they cannot reach.

use crate::compiler::codegen::{
    CodegenTarget, EncodeContext, EncodeError, TargetInfo, emit, emit_lir, operands,
};
use crate::compiler::lir::{
    AliasInfo, AluOp, Cond, EncodingInfo, FP_REG_MASK, FP_REG_OFFSET, FpOp, IS_BRANCH,
    IS_CALL, IS_DATA, IS_LOAD, IS_STORE, Lir, LirId, LirOp, NEEDS_FIXUP, OpKind, REG_DEF_LIST0,
    REG_DEF_LR, REG_DEF_SP, REG_DEF0, REG_DEF0_USE1, REG_DEF0_USE12, REG_USE_LIST0,
    REG_USE_PC, REG_USE_SP, REG_USE0, REG_USE01, REG_USE12, SETS_CCODES, USES_CCODES,
    USES_LITERAL, UnaryOp, is_fp_reg,
};
use crate::compiler::{CLASS_LITERAL_FLAG, CompilationUnit, CompileResult};
use crate::isa::{InstructionSet, arm};

const R12: i32 = 12;
const SP: i32 = arm::SP as i32;
const LR: i32 = arm::LR as i32;
const PC: i32 = arm::PC as i32;

encoding_table! {
    pub enum ThumbOp {
        Nop16 => ("nop", "", 2, 0, OpKind::Nop),
        Mov16 => ("mov", "!0r, !1r", 2, REG_DEF0_USE1, OpKind::Mov),
        MovImm8 => ("movs", "!0r, #!1d", 2, REG_DEF0 | SETS_CCODES, OpKind::MovImm),
        Movw => ("movw", "!0r, #!1x", 4, REG_DEF0, OpKind::MovImm),
        Mvn16 => ("mvns", "!0r, !1r", 2, REG_DEF0_USE1 | SETS_CCODES, OpKind::Unary(UnaryOp::Not)),
        MvnW => ("mvn", "!0r, !1r", 4, REG_DEF0_USE1, OpKind::Unary(UnaryOp::Not)),
        LdrPcRel => (
            "ldr",
            "!0r, [pc, #lit]",
            2,
            REG_DEF0 | REG_USE_PC | IS_LOAD | USES_LITERAL | NEEDS_FIXUP,
            OpKind::LoadLiteral
        ),
        AndW => ("and", "!0r, !1r, !2r", 4, REG_DEF0_USE12, OpKind::AluRRR(AluOp::And)),
        OrrW => ("orr", "!0r, !1r, !2r", 4, REG_DEF0_USE12, OpKind::AluRRR(AluOp::Or)),
        EorW => ("eor", "!0r, !1r, !2r", 4, REG_DEF0_USE12, OpKind::AluRRR(AluOp::Xor)),
        AddW => ("add", "!0r, !1r, !2r", 4, REG_DEF0_USE12, OpKind::AluRRR(AluOp::Add)),
        AddsW => (
            "adds",
            "!0r, !1r, !2r",
            4,
            REG_DEF0_USE12 | SETS_CCODES,
            OpKind::AluRRR(AluOp::Adds)
        ),
        AdcsW => (
            "adcs",
            "!0r, !1r, !2r",
            4,
            REG_DEF0_USE12 | SETS_CCODES | USES_CCODES,
            OpKind::AluRRR(AluOp::Adc)
        ),
        SubW => ("sub", "!0r, !1r, !2r", 4, REG_DEF0_USE12, OpKind::AluRRR(AluOp::Sub)),
        SubsW => (
            "subs",
            "!0r, !1r, !2r",
            4,
            REG_DEF0_USE12 | SETS_CCODES,
            OpKind::AluRRR(AluOp::Subs)
        ),
        SbcsW => (
            "sbcs",
            "!0r, !1r, !2r",
            4,
            REG_DEF0_USE12 | SETS_CCODES | USES_CCODES,
            OpKind::AluRRR(AluOp::Sbc)
        ),
        RsbW => ("rsb", "!0r, !1r, !2r", 4, REG_DEF0_USE12, OpKind::AluRRR(AluOp::Rsub)),
        MulW => ("mul", "!0r, !1r, !2r", 4, REG_DEF0_USE12, OpKind::AluRRR(AluOp::Mul)),
        LslW => ("lsl", "!0r, !1r, !2r", 4, REG_DEF0_USE12, OpKind::AluRRR(AluOp::Lsl)),
        LsrW => ("lsr", "!0r, !1r, !2r", 4, REG_DEF0_USE12, OpKind::AluRRR(AluOp::Lsr)),
        AsrW => ("asr", "!0r, !1r, !2r", 4, REG_DEF0_USE12, OpKind::AluRRR(AluOp::Asr)),
        RorW => ("ror", "!0r, !1r, !2r", 4, REG_DEF0_USE12, OpKind::AluRRR(AluOp::Ror)),
        LslImm => ("lsl", "!0r, !1r, #!2d", 4, REG_DEF0_USE1, OpKind::AluRRI(AluOp::Lsl)),
        LsrImm => ("lsr", "!0r, !1r, #!2d", 4, REG_DEF0_USE1, OpKind::AluRRI(AluOp::Lsr)),
        AsrImm => ("asr", "!0r, !1r, #!2d", 4, REG_DEF0_USE1, OpKind::AluRRI(AluOp::Asr)),
        AddRRI12 => ("addw", "!0r, !1r, #!2d", 4, REG_DEF0_USE1, OpKind::AluRRI(AluOp::Add)),
        SubRRI12 => ("subw", "!0r, !1r, #!2d", 4, REG_DEF0_USE1, OpKind::AluRRI(AluOp::Sub)),
        AndRRI => ("and", "!0r, !1r, #!2x", 4, REG_DEF0_USE1, OpKind::AluRRI(AluOp::And)),
        OrrRRI => ("orr", "!0r, !1r, #!2x", 4, REG_DEF0_USE1, OpKind::AluRRI(AluOp::Or)),
        EorRRI => ("eor", "!0r, !1r, #!2x", 4, REG_DEF0_USE1, OpKind::AluRRI(AluOp::Xor)),
        RsbRRI => ("rsb", "!0r, !1r, #!2d", 4, REG_DEF0_USE1, OpKind::AluRRI(AluOp::Rsub)),
        Cmp16 => ("cmp", "!0r, !1r", 2, REG_USE01 | SETS_CCODES, OpKind::Cmp),
        CmpImm8 => ("cmp", "!0r, #!1d", 2, REG_USE0 | SETS_CCODES, OpKind::CmpImm),
        CmpImmW => ("cmp.w", "!0r, #!1d", 4, REG_USE0 | SETS_CCODES, OpKind::CmpImm),
        // Operand 1 holds the value compared against; the encoding adds its negation.
        CmnImmW => ("cmn", "!0r, #!1d", 4, REG_USE0 | SETS_CCODES, OpKind::CmpImm),
        BCond => (
            "b!3c",
            "!0t",
            2,
            IS_BRANCH | USES_CCODES | NEEDS_FIXUP,
            OpKind::CondBranch(Cond::Al)
        ),
        B16 => ("b", "!0t", 2, IS_BRANCH | NEEDS_FIXUP, OpKind::Branch),
        Bl => ("bl", "", 4, IS_CALL | REG_DEF_LR, OpKind::Call),
        Push => (
            "push",
            "{!0x}",
            2,
            REG_USE_LIST0 | REG_USE_SP | REG_DEF_SP | IS_STORE,
            OpKind::Push
        ),
        Pop => (
            "pop",
            "{!0x}",
            2,
            REG_DEF_LIST0 | REG_USE_SP | REG_DEF_SP | IS_LOAD,
            OpKind::Pop
        ),
        SubSp => ("sub", "sp, #!1d", 2, REG_USE_SP | REG_DEF_SP, OpKind::AluRI(AluOp::Sub)),
        AddSp => ("add", "sp, #!1d", 2, REG_USE_SP | REG_DEF_SP, OpKind::AluRI(AluOp::Add)),
        LdrRRI5 => ("ldr", "!0r, [!1r, #!2d]", 2, REG_DEF0_USE1 | IS_LOAD, OpKind::Load),
        StrRRI5 => ("str", "!0r, [!1r, #!2d]", 2, REG_USE01 | IS_STORE, OpKind::Store),
        LdrSpRel => ("ldr", "!0r, [sp, #!2d]", 2, REG_DEF0_USE1 | IS_LOAD, OpKind::Load),
        StrSpRel => ("str", "!0r, [sp, #!2d]", 2, REG_USE01 | IS_STORE, OpKind::Store),
        LdrW => ("ldr.w", "!0r, [!1r, #!2d]", 4, REG_DEF0_USE1 | IS_LOAD, OpKind::Load),
        StrW => ("str.w", "!0r, [!1r, #!2d]", 4, REG_USE01 | IS_STORE, OpKind::Store),
        LdrIdx => (
            "ldr.w",
            "!0r, [!1r, !2r, lsl #!3d]",
            4,
            REG_DEF0 | REG_USE12 | IS_LOAD,
            OpKind::LoadIndexed
        ),
        StrIdx => (
            "str.w",
            "!0r, [!1r, !2r, lsl #!3d]",
            4,
            REG_USE0 | REG_USE12 | IS_STORE,
            OpKind::StoreIndexed
        ),
        Vldrs => ("vldr", "!0r, [!1r, #!2d]", 4, REG_DEF0_USE1 | IS_LOAD, OpKind::Load),
        Vstrs => ("vstr", "!0r, [!1r, #!2d]", 4, REG_USE01 | IS_STORE, OpKind::Store),
        Vadds => ("vadd.f32", "!0r, !1r, !2r", 4, REG_DEF0_USE12, OpKind::FpRRR(FpOp::Add)),
        Vsubs => ("vsub.f32", "!0r, !1r, !2r", 4, REG_DEF0_USE12, OpKind::FpRRR(FpOp::Sub)),
        Vmuls => ("vmul.f32", "!0r, !1r, !2r", 4, REG_DEF0_USE12, OpKind::FpRRR(FpOp::Mul)),
        Vdivs => ("vdiv.f32", "!0r, !1r, !2r", 4, REG_DEF0_USE12, OpKind::FpRRR(FpOp::Div)),
        VmovS => ("vmov.f32", "!0r, !1r", 4, REG_DEF0_USE1, OpKind::Mov),
        VmovSR => ("vmov", "!0r, !1r", 4, REG_DEF0_USE1, OpKind::Mov),
        VmovRS => ("vmov", "!0r, !1r", 4, REG_DEF0_USE1, OpKind::Mov),
        Data => (".word", "!0x", 4, IS_DATA, OpKind::Data),
    }
}

static INFO: TargetInfo = TargetInfo {
    isa: InstructionSet::Thumb2,
    sp: SP,
    lr: LR,
    pc: PC,
    core_temps: &[0, 1, 2, 3],
    fp_temps: &[
        FP_REG_OFFSET,
        FP_REG_OFFSET + 1,
        FP_REG_OFFSET + 2,
        FP_REG_OFFSET + 3,
        FP_REG_OFFSET + 4,
        FP_REG_OFFSET + 5,
        FP_REG_OFFSET + 6,
        FP_REG_OFFSET + 7,
        FP_REG_OFFSET + 8,
        FP_REG_OFFSET + 9,
        FP_REG_OFFSET + 10,
        FP_REG_OFFSET + 11,
        FP_REG_OFFSET + 12,
        FP_REG_OFFSET + 13,
        FP_REG_OFFSET + 14,
        FP_REG_OFFSET + 15,
    ],
    // r5 is the trace frame pointer.
    promotable: &[4, 6, 7],
    args: &[0, 1, 2, 3],
    rets: [0, 1],
    method_reg: 0,
    trace_fp: 5,
    scratch: Some(R12),
    shift_count_reg: None,
    mask_shift_count: true,
    inline_fp: true,
    inline_int_div: false,
    div_regs: None,
};

pub struct Thumb2Target;

fn is_low(reg: i32) -> bool {
    (0..8).contains(&reg)
}

fn core(reg: i32) -> u32 {
    (reg & 0xf) as u32
}

/// `(Vx, x)` fields of a single-precision register.
fn sreg(reg: i32) -> (u32, u32) {
    let index = (reg & FP_REG_MASK) as u32;
    (index >> 1, index & 1)
}

fn arm_cond(cond: Cond) -> u32 {
    match cond {
        Cond::Eq => 0x0,
        Cond::Ne => 0x1,
        Cond::Cs => 0x2,
        Cond::Cc => 0x3,
        Cond::Mi => 0x4,
        Cond::Pl => 0x5,
        Cond::Hi => 0x8,
        Cond::Ls => 0x9,
        Cond::Ge => 0xa,
        Cond::Lt => 0xb,
        Cond::Gt => 0xc,
        Cond::Le => 0xd,
        Cond::Al => 0xe,
    }
}

/// Thumb2 modified immediate `i:imm3:imm8` for `value`, if it has one.
pub fn modified_immediate(value: u32) -> Option<u32> {
    if value <= 0xff {
        return Some(value);
    }
    let low = value & 0xff;
    if low != 0 && value == low << 16 | low {
        return Some(0x100 | low);
    }
    let second = (value >> 8) & 0xff;
    if second != 0 && value == second << 24 | second << 8 {
        return Some(0x200 | second);
    }
    if low != 0 && value == low * 0x0101_0101 {
        return Some(0x300 | low);
    }
    (8..32)
        .find(|&rotation| (0x80..=0xff).contains(&value.rotate_left(rotation)))
        .map(|rotation| rotation << 7 | (value.rotate_left(rotation) & 0x7f))
}

/// Splits a 12-bit immediate into its `(i, imm3, imm8)` fields.
fn split_imm12(imm: u32) -> (u32, u32, u32) {
    ((imm >> 11) & 1, (imm >> 8) & 7, imm & 0xff)
}

fn thumb16(hw: u32) -> Vec<u8> {
    (hw as u16).to_le_bytes().to_vec()
}

fn thumb32(hw1: u32, hw2: u32) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(4);
    bytes.extend_from_slice(&(hw1 as u16).to_le_bytes());
    bytes.extend_from_slice(&(hw2 as u16).to_le_bytes());
    bytes
}

fn require(ok: bool) -> Result<(), EncodeError> {
    if ok { Ok(()) } else { Err(EncodeError::OutOfRange) }
}

/// B.W and BL share the T4 offset layout; `hw2_base` selects which.
fn encode_branch_t4(delta: i64, hw2_base: u32) -> Result<Vec<u8>, EncodeError> {
    require((-(1 << 24)..(1 << 24)).contains(&delta) && delta % 2 == 0)?;
    let offset = delta as u32;
    let s = (offset >> 24) & 1;
    let i1 = (offset >> 23) & 1;
    let i2 = (offset >> 22) & 1;
    let j1 = !(i1 ^ s) & 1;
    let j2 = !(i2 ^ s) & 1;
    Ok(thumb32(
        0xF000 | s << 10 | (offset >> 12) & 0x3ff,
        hw2_base | j1 << 13 | j2 << 11 | (offset >> 1) & 0x7ff,
    ))
}

fn encode_cond_branch(cond: Cond, delta: i64, long_form: bool) -> Result<Vec<u8>, EncodeError> {
    if cond == Cond::Al {
        return encode_branch(delta, long_form);
    }
    let cond = arm_cond(cond);
    if !long_form {
        if (-256..=254).contains(&delta) {
            return Ok(thumb16(0xD000 | cond << 8 | ((delta >> 1) as u32 & 0xff)));
        }
        return Err(EncodeError::NeedsLongForm);
    }
    require((-(1 << 20)..(1 << 20)).contains(&delta))?;
    let offset = delta as u32;
    let s = (offset >> 20) & 1;
    let j2 = (offset >> 19) & 1;
    let j1 = (offset >> 18) & 1;
    Ok(thumb32(
        0xF000 | s << 10 | cond << 6 | (offset >> 12) & 0x3f,
        0x8000 | j1 << 13 | j2 << 11 | (offset >> 1) & 0x7ff,
    ))
}

fn encode_branch(delta: i64, long_form: bool) -> Result<Vec<u8>, EncodeError> {
    if !long_form {
        if (-2048..=2046).contains(&delta) {
            return Ok(thumb16(0xE000 | ((delta >> 1) as u32 & 0x7ff)));
        }
        return Err(EncodeError::NeedsLongForm);
    }
    encode_branch_t4(delta, 0x9000)
}

fn branch_delta(ctx: &EncodeContext) -> Result<i64, EncodeError> {
    let target = ctx.target_offset.ok_or(EncodeError::OutOfRange)?;
    Ok(target as i64 - (ctx.pc as i64 + 4))
}

fn data_processing_imm(base: u32, rd: u32, rn: u32, imm12: u32) -> Vec<u8> {
    let (i, imm3, imm8) = split_imm12(imm12);
    thumb32(base | i << 10 | rn, imm3 << 12 | rd << 8 | imm8)
}

fn vfp_rrr(hw1: u32, extra: u32, fd: i32, fn_: i32, fm: i32) -> Vec<u8> {
    let (vd, d) = sreg(fd);
    let (vn, n) = sreg(fn_);
    let (vm, m) = sreg(fm);
    thumb32(
        hw1 | d << 6 | vn,
        vd << 12 | 0xA00 | n << 7 | extra | m << 5 | vm,
    )
}

impl Thumb2Target {
    fn op(&self, cu: &mut CompilationUnit<'_>, op: ThumbOp, values: &[i32]) -> LirId {
        emit(cu, self, op as u16, operands(values))
    }

    fn load_literal(&self, cu: &mut CompilationUnit<'_>, rd: i32, literal: usize) -> LirId {
        let mut lir = Lir::new(
            LirOp::Target(ThumbOp::LdrPcRel as u16),
            cu.current_dalvik_offset,
            operands(&[rd]),
        );
        lir.literal = Some(literal);
        emit_lir(cu, self, lir)
    }

    fn cond_branch(&self, cu: &mut CompilationUnit<'_>, cond: Cond) -> LirId {
        self.op(cu, ThumbOp::BCond, &[0, 0, 0, cond.to_operand()])
    }

    fn adjust_sp(&self, cu: &mut CompilationUnit<'_>, op: AluOp, bytes: i32) -> CompileResult<()> {
        if bytes == 0 {
            return Ok(());
        }
        if bytes <= 508 && bytes % 4 == 0 {
            let short = if op == AluOp::Add {
                ThumbOp::AddSp
            } else {
                ThumbOp::SubSp
            };
            self.op(cu, short, &[SP, bytes]);
            return Ok(());
        }
        self.op_reg_reg_imm(cu, op, SP, SP, bytes)
    }

    /// `(base, disp)` reachable by an immediate offset of at most `max`; `r12` holds the
    /// address otherwise.
    fn reachable(
        &self,
        cu: &mut CompilationUnit<'_>,
        base: i32,
        disp: i32,
        max: i32,
        word_aligned: bool,
    ) -> CompileResult<(i32, i32)> {
        if (0..=max).contains(&disp) && (!word_aligned || disp % 4 == 0) {
            return Ok((base, disp));
        }
        self.load_constant(cu, R12, disp)?;
        self.op(cu, ThumbOp::AddW, &[R12, base, R12]);
        Ok((R12, 0))
    }

    fn memory_op(
        &self,
        cu: &mut CompilationUnit<'_>,
        load: bool,
        reg: i32,
        base: i32,
        disp: i32,
        alias: Option<AliasInfo>,
    ) -> CompileResult<LirId> {
        let fp = is_fp_reg(reg);
        let (base, disp) = if fp {
            self.reachable(cu, base, disp, 1020, true)?
        } else {
            self.reachable(cu, base, disp, 4095, false)?
        };
        let aligned = disp % 4 == 0;
        let op = match (fp, load) {
            (true, true) => ThumbOp::Vldrs,
            (true, false) => ThumbOp::Vstrs,
            _ if is_low(reg) && is_low(base) && aligned && disp <= 124 => {
                if load {
                    ThumbOp::LdrRRI5
                } else {
                    ThumbOp::StrRRI5
                }
            }
            _ if is_low(reg) && base == SP && aligned && disp <= 1020 => {
                if load {
                    ThumbOp::LdrSpRel
                } else {
                    ThumbOp::StrSpRel
                }
            }
            (false, true) => ThumbOp::LdrW,
            (false, false) => ThumbOp::StrW,
        };
        let mut lir = Lir::new(
            LirOp::Target(op as u16),
            cu.current_dalvik_offset,
            operands(&[reg, base, disp]),
        );
        lir.alias = alias;
        Ok(emit_lir(cu, self, lir))
    }

    fn indexed_op(
        &self,
        cu: &mut CompilationUnit<'_>,
        op: ThumbOp,
        reg: i32,
        base: i32,
        index: i32,
        scale: i32,
        disp: i32,
    ) -> CompileResult<()> {
        let base = if disp == 0 {
            base
        } else {
            self.op_reg_reg_imm(cu, AluOp::Add, R12, base, disp)?;
            R12
        };
        self.op(cu, op, &[reg, base, index, scale]);
        Ok(())
    }
}

impl CodegenTarget for Thumb2Target {
    fn info(&self) -> &'static TargetInfo {
        &INFO
    }

    fn encoding(&self, opcode: u16) -> &'static EncodingInfo {
        ENCODINGS
            .get(opcode as usize)
            .unwrap_or(&ENCODINGS[ThumbOp::Nop16 as usize])
    }

    fn lir_size(&self, lir: &Lir) -> u8 {
        match lir.target_opcode().and_then(ThumbOp::from_u16) {
            Some(ThumbOp::LdrPcRel) if lir.long_form || !is_low(lir.operands[0]) => 4,
            Some(ThumbOp::BCond | ThumbOp::B16) if lir.long_form => 4,
            Some(op) => ENCODINGS[op as usize].size,
            None => 0,
        }
    }

    fn encode(&self, lir: &Lir, ctx: &EncodeContext) -> Result<Vec<u8>, EncodeError> {
        let op = lir
            .target_opcode()
            .and_then(ThumbOp::from_u16)
            .ok_or(EncodeError::OutOfRange)?;
        let [a, b, c, d, _] = lir.operands;
        let bytes = match op {
            ThumbOp::Nop16 => thumb16(0xBF00),
            ThumbOp::Mov16 => thumb16(0x4600 | (core(a) & 8) << 4 | core(b) << 3 | core(a) & 7),
            ThumbOp::MovImm8 => {
                require(is_low(a) && (0..=0xff).contains(&b))?;
                thumb16(0x2000 | core(a) << 8 | b as u32)
            }
            ThumbOp::Movw => {
                let value = b as u32 & 0xffff;
                let (i, imm3, imm8) = split_imm12(value & 0xfff);
                thumb32(0xF240 | i << 10 | value >> 12, imm3 << 12 | core(a) << 8 | imm8)
            }
            ThumbOp::Mvn16 => thumb16(0x43C0 | core(b) << 3 | core(a)),
            ThumbOp::MvnW => thumb32(0xEA6F, core(a) << 8 | core(b)),
            ThumbOp::LdrPcRel => {
                let literal = ctx.literal_offset.ok_or(EncodeError::OutOfRange)?;
                let base = (ctx.code_begin as i64 + ctx.pc as i64 + 4) & !3;
                let delta = ctx.code_begin as i64 + literal as i64 - base;
                require(delta >= 0 && delta % 4 == 0)?;
                if !lir.long_form && is_low(a) {
                    if delta > 1020 {
                        return Err(EncodeError::NeedsLongForm);
                    }
                    thumb16(0x4800 | core(a) << 8 | (delta / 4) as u32)
                } else {
                    require(delta <= 4095)?;
                    thumb32(0xF8DF, core(a) << 12 | delta as u32)
                }
            }
            ThumbOp::AndW => thumb32(0xEA00 | core(b), core(a) << 8 | core(c)),
            ThumbOp::OrrW => thumb32(0xEA40 | core(b), core(a) << 8 | core(c)),
            ThumbOp::EorW => thumb32(0xEA80 | core(b), core(a) << 8 | core(c)),
            ThumbOp::AddW => thumb32(0xEB00 | core(b), core(a) << 8 | core(c)),
            ThumbOp::AddsW => thumb32(0xEB10 | core(b), core(a) << 8 | core(c)),
            ThumbOp::AdcsW => thumb32(0xEB50 | core(b), core(a) << 8 | core(c)),
            ThumbOp::SubW => thumb32(0xEBA0 | core(b), core(a) << 8 | core(c)),
            ThumbOp::SubsW => thumb32(0xEBB0 | core(b), core(a) << 8 | core(c)),
            ThumbOp::SbcsW => thumb32(0xEB70 | core(b), core(a) << 8 | core(c)),
            ThumbOp::RsbW => thumb32(0xEBC0 | core(b), core(a) << 8 | core(c)),
            ThumbOp::MulW => thumb32(0xFB00 | core(b), 0xF000 | core(a) << 8 | core(c)),
            ThumbOp::LslW => thumb32(0xFA00 | core(b), 0xF000 | core(a) << 8 | core(c)),
            ThumbOp::LsrW => thumb32(0xFA20 | core(b), 0xF000 | core(a) << 8 | core(c)),
            ThumbOp::AsrW => thumb32(0xFA40 | core(b), 0xF000 | core(a) << 8 | core(c)),
            ThumbOp::RorW => thumb32(0xFA60 | core(b), 0xF000 | core(a) << 8 | core(c)),
            ThumbOp::LslImm | ThumbOp::LsrImm | ThumbOp::AsrImm => {
                require((1..32).contains(&c))?;
                let kind = match op {
                    ThumbOp::LslImm => 0,
                    ThumbOp::LsrImm => 1,
                    _ => 2,
                };
                let imm5 = c as u32;
                thumb32(
                    0xEA4F,
                    (imm5 >> 2) << 12 | core(a) << 8 | (imm5 & 3) << 6 | kind << 4 | core(b),
                )
            }
            ThumbOp::AddRRI12 | ThumbOp::SubRRI12 => {
                require((0..=4095).contains(&c))?;
                let base = if op == ThumbOp::AddRRI12 { 0xF200 } else { 0xF2A0 };
                data_processing_imm(base, core(a), core(b), c as u32)
            }
            ThumbOp::AndRRI | ThumbOp::OrrRRI | ThumbOp::EorRRI | ThumbOp::RsbRRI => {
                let imm = modified_immediate(c as u32).ok_or(EncodeError::OutOfRange)?;
                let base = match op {
                    ThumbOp::AndRRI => 0xF000,
                    ThumbOp::OrrRRI => 0xF040,
                    ThumbOp::EorRRI => 0xF080,
                    _ => 0xF1C0,
                };
                data_processing_imm(base, core(a), core(b), imm)
            }
            ThumbOp::Cmp16 => {
                if is_low(a) && is_low(b) {
                    thumb16(0x4280 | core(b) << 3 | core(a))
                } else {
                    thumb16(0x4500 | (core(a) >> 3) << 7 | core(b) << 3 | core(a) & 7)
                }
            }
            ThumbOp::CmpImm8 => {
                require(is_low(a) && (0..=0xff).contains(&b))?;
                thumb16(0x2800 | core(a) << 8 | b as u32)
            }
            ThumbOp::CmpImmW => {
                let imm = modified_immediate(b as u32).ok_or(EncodeError::OutOfRange)?;
                data_processing_imm(0xF1B0, 0xf, core(a), imm)
            }
            ThumbOp::CmnImmW => {
                let imm = modified_immediate(b.wrapping_neg() as u32)
                    .ok_or(EncodeError::OutOfRange)?;
                data_processing_imm(0xF110, 0xf, core(a), imm)
            }
            ThumbOp::BCond => {
                encode_cond_branch(Cond::from_operand(d), branch_delta(ctx)?, lir.long_form)?
            }
            ThumbOp::B16 => encode_branch(branch_delta(ctx)?, lir.long_form)?,
            ThumbOp::Bl => {
                let target = lir.call_target.ok_or(EncodeError::OutOfRange)?;
                let from = ctx.code_begin as i64 + ctx.pc as i64;
                encode_branch_t4(target as i64 - (from + 4), 0xD000)?
            }
            ThumbOp::Push => {
                let mask = a as u32;
                require(mask & !(0xff | 1 << LR) == 0)?;
                thumb16(0xB400 | ((mask >> LR) & 1) << 8 | mask & 0xff)
            }
            ThumbOp::Pop => {
                let mask = a as u32;
                require(mask & !(0xff | 1 << PC) == 0)?;
                thumb16(0xBC00 | ((mask >> PC) & 1) << 8 | mask & 0xff)
            }
            ThumbOp::SubSp | ThumbOp::AddSp => {
                require((0..=508).contains(&b) && b % 4 == 0)?;
                let base = if op == ThumbOp::SubSp { 0xB080 } else { 0xB000 };
                thumb16(base | (b / 4) as u32)
            }
            ThumbOp::LdrRRI5 | ThumbOp::StrRRI5 => {
                require((0..=124).contains(&c) && c % 4 == 0)?;
                let base = if op == ThumbOp::LdrRRI5 { 0x6800 } else { 0x6000 };
                thumb16(base | ((c / 4) as u32) << 6 | core(b) << 3 | core(a))
            }
            ThumbOp::LdrSpRel | ThumbOp::StrSpRel => {
                require((0..=1020).contains(&c) && c % 4 == 0)?;
                let base = if op == ThumbOp::LdrSpRel { 0x9800 } else { 0x9000 };
                thumb16(base | core(a) << 8 | (c / 4) as u32)
            }
            ThumbOp::LdrW | ThumbOp::StrW => {
                require((0..=4095).contains(&c))?;
                let base = if op == ThumbOp::LdrW { 0xF8D0 } else { 0xF8C0 };
                thumb32(base | core(b), core(a) << 12 | c as u32)
            }
            ThumbOp::LdrIdx | ThumbOp::StrIdx => {
                require((0..4).contains(&d))?;
                let base = if op == ThumbOp::LdrIdx { 0xF850 } else { 0xF840 };
                thumb32(base | core(b), core(a) << 12 | (d as u32) << 4 | core(c))
            }
            ThumbOp::Vldrs | ThumbOp::Vstrs => {
                require((0..=1020).contains(&c) && c % 4 == 0)?;
                let (vd, dbit) = sreg(a);
                let base = if op == ThumbOp::Vldrs { 0xED90 } else { 0xED80 };
                thumb32(base | dbit << 6 | core(b), vd << 12 | 0xA00 | (c / 4) as u32)
            }
            ThumbOp::Vadds => vfp_rrr(0xEE30, 0, a, b, c),
            ThumbOp::Vsubs => vfp_rrr(0xEE30, 0x40, a, b, c),
            ThumbOp::Vmuls => vfp_rrr(0xEE20, 0, a, b, c),
            ThumbOp::Vdivs => vfp_rrr(0xEE80, 0, a, b, c),
            ThumbOp::VmovS => {
                let (vd, dbit) = sreg(a);
                let (vm, m) = sreg(b);
                thumb32(0xEEB0 | dbit << 6, vd << 12 | 0xA40 | m << 5 | vm)
            }
            ThumbOp::VmovSR => {
                let (vn, n) = sreg(a);
                thumb32(0xEE00 | vn, core(b) << 12 | 0xA10 | n << 7)
            }
            ThumbOp::VmovRS => {
                let (vn, n) = sreg(b);
                thumb32(0xEE10 | vn, core(a) << 12 | 0xA10 | n << 7)
            }
            ThumbOp::Data => (a as u32).to_le_bytes().to_vec(),
        };
        Ok(bytes)
    }

    fn chain_patch(&self, from: u32, to: u32) -> Option<Vec<u8>> {
        encode_branch_t4(to as i64 - (from as i64 + 4), 0x9000).ok()
    }

    fn op_reg_copy(&self, cu: &mut CompilationUnit<'_>, rd: i32, rs: i32) -> LirId {
        let op = match (is_fp_reg(rd), is_fp_reg(rs)) {
            (false, false) => ThumbOp::Mov16,
            (true, true) => ThumbOp::VmovS,
            (true, false) => ThumbOp::VmovSR,
            (false, true) => ThumbOp::VmovRS,
        };
        self.op(cu, op, &[rd, rs])
    }

    fn load_constant(&self, cu: &mut CompilationUnit<'_>, rd: i32, value: i32) -> CompileResult<()> {
        if is_fp_reg(rd) {
            self.load_constant(cu, R12, value)?;
            self.op(cu, ThumbOp::VmovSR, &[rd, R12]);
            return Ok(());
        }
        let bits = value as u32;
        if is_low(rd) && bits <= 0xff {
            self.op(cu, ThumbOp::MovImm8, &[rd, value]);
        } else if is_low(rd) && !bits <= 0xff {
            self.op(cu, ThumbOp::MovImm8, &[rd, !value]);
            self.op(cu, ThumbOp::Mvn16, &[rd, rd]);
        } else if bits <= 0xffff {
            self.op(cu, ThumbOp::Movw, &[rd, value]);
        } else if let Some((literal, delta)) = cu.find_near_literal(bits) {
            self.load_literal(cu, rd, literal);
            if delta != 0 {
                self.op(cu, ThumbOp::AddRRI12, &[rd, rd, delta as i32]);
            }
        } else {
            let literal = cu.add_literal(bits);
            self.load_literal(cu, rd, literal);
        }
        Ok(())
    }

    fn load_class_literal(
        &self,
        cu: &mut CompilationUnit<'_>,
        rd: i32,
        value: u32,
    ) -> CompileResult<()> {
        let index = cu.add_class_literal(value);
        self.load_literal(cu, rd, CLASS_LITERAL_FLAG + index);
        Ok(())
    }

    fn op_reg_reg_reg(
        &self,
        cu: &mut CompilationUnit<'_>,
        op: AluOp,
        rd: i32,
        rs: i32,
        rt: i32,
    ) -> CompileResult<()> {
        let thumb = match op {
            AluOp::Add => ThumbOp::AddW,
            AluOp::Adds => ThumbOp::AddsW,
            AluOp::Adc => ThumbOp::AdcsW,
            AluOp::Sub => ThumbOp::SubW,
            AluOp::Subs => ThumbOp::SubsW,
            AluOp::Sbc => ThumbOp::SbcsW,
            AluOp::Rsub => ThumbOp::RsbW,
            AluOp::Mul => ThumbOp::MulW,
            AluOp::And => ThumbOp::AndW,
            AluOp::Or => ThumbOp::OrrW,
            AluOp::Xor => ThumbOp::EorW,
            AluOp::Lsl => ThumbOp::LslW,
            AluOp::Lsr => ThumbOp::LsrW,
            AluOp::Asr => ThumbOp::AsrW,
            AluOp::Ror => ThumbOp::RorW,
            AluOp::Nor => {
                self.op(cu, ThumbOp::OrrW, &[rd, rs, rt]);
                self.op(cu, ThumbOp::MvnW, &[rd, rd]);
                return Ok(());
            }
        };
        self.op(cu, thumb, &[rd, rs, rt]);
        Ok(())
    }

    fn op_reg_reg_imm(
        &self,
        cu: &mut CompilationUnit<'_>,
        op: AluOp,
        rd: i32,
        rs: i32,
        imm: i32,
    ) -> CompileResult<()> {
        match op {
            AluOp::Add | AluOp::Sub => {
                let addend = if op == AluOp::Sub {
                    imm.wrapping_neg()
                } else {
                    imm
                };
                if (0..=4095).contains(&addend) {
                    self.op(cu, ThumbOp::AddRRI12, &[rd, rs, addend]);
                    return Ok(());
                }
                if (-4095..0).contains(&addend) {
                    self.op(cu, ThumbOp::SubRRI12, &[rd, rs, -addend]);
                    return Ok(());
                }
            }
            AluOp::And | AluOp::Or | AluOp::Xor | AluOp::Rsub
                if modified_immediate(imm as u32).is_some() =>
            {
                let thumb = match op {
                    AluOp::And => ThumbOp::AndRRI,
                    AluOp::Or => ThumbOp::OrrRRI,
                    AluOp::Xor => ThumbOp::EorRRI,
                    _ => ThumbOp::RsbRRI,
                };
                self.op(cu, thumb, &[rd, rs, imm]);
                return Ok(());
            }
            AluOp::Lsl | AluOp::Lsr | AluOp::Asr => {
                let shift = imm & 31;
                if shift == 0 {
                    if rd != rs {
                        self.op_reg_copy(cu, rd, rs);
                    }
                    return Ok(());
                }
                let thumb = match op {
                    AluOp::Lsl => ThumbOp::LslImm,
                    AluOp::Lsr => ThumbOp::LsrImm,
                    _ => ThumbOp::AsrImm,
                };
                self.op(cu, thumb, &[rd, rs, shift]);
                return Ok(());
            }
            _ => {}
        }
        self.load_constant(cu, R12, imm)?;
        self.op_reg_reg_reg(cu, op, rd, rs, R12)
    }

    fn op_unary(
        &self,
        cu: &mut CompilationUnit<'_>,
        op: UnaryOp,
        rd: i32,
        rs: i32,
    ) -> CompileResult<()> {
        match op {
            UnaryOp::Neg => self.op(cu, ThumbOp::RsbRRI, &[rd, rs, 0]),
            UnaryOp::Not if is_low(rd) && is_low(rs) => self.op(cu, ThumbOp::Mvn16, &[rd, rs]),
            UnaryOp::Not => self.op(cu, ThumbOp::MvnW, &[rd, rs]),
        };
        Ok(())
    }

    fn op_fp_rrr(
        &self,
        cu: &mut CompilationUnit<'_>,
        op: FpOp,
        fd: i32,
        fs: i32,
        ft: i32,
    ) -> CompileResult<()> {
        let thumb = match op {
            FpOp::Add => ThumbOp::Vadds,
            FpOp::Sub => ThumbOp::Vsubs,
            FpOp::Mul => ThumbOp::Vmuls,
            FpOp::Div => ThumbOp::Vdivs,
        };
        self.op(cu, thumb, &[fd, fs, ft]);
        Ok(())
    }

    fn load_base_disp(
        &self,
        cu: &mut CompilationUnit<'_>,
        rd: i32,
        base: i32,
        disp: i32,
        alias: Option<AliasInfo>,
    ) -> CompileResult<LirId> {
        self.memory_op(cu, true, rd, base, disp, alias)
    }

    fn store_base_disp(
        &self,
        cu: &mut CompilationUnit<'_>,
        rs: i32,
        base: i32,
        disp: i32,
        alias: Option<AliasInfo>,
    ) -> CompileResult<LirId> {
        self.memory_op(cu, false, rs, base, disp, alias)
    }

    fn load_base_indexed(
        &self,
        cu: &mut CompilationUnit<'_>,
        rd: i32,
        base: i32,
        index: i32,
        scale: i32,
        disp: i32,
    ) -> CompileResult<()> {
        self.indexed_op(cu, ThumbOp::LdrIdx, rd, base, index, scale, disp)
    }

    fn store_base_indexed(
        &self,
        cu: &mut CompilationUnit<'_>,
        rs: i32,
        base: i32,
        index: i32,
        scale: i32,
        disp: i32,
    ) -> CompileResult<()> {
        self.indexed_op(cu, ThumbOp::StrIdx, rs, base, index, scale, disp)
    }

    fn op_cmp_branch(
        &self,
        cu: &mut CompilationUnit<'_>,
        cond: Cond,
        rs: i32,
        rt: i32,
    ) -> CompileResult<LirId> {
        self.op(cu, ThumbOp::Cmp16, &[rs, rt]);
        Ok(self.cond_branch(cu, cond))
    }

    fn op_cmp_imm_branch(
        &self,
        cu: &mut CompilationUnit<'_>,
        cond: Cond,
        rs: i32,
        imm: i32,
    ) -> CompileResult<LirId> {
        if is_low(rs) && (0..=0xff).contains(&imm) {
            self.op(cu, ThumbOp::CmpImm8, &[rs, imm]);
        } else if modified_immediate(imm as u32).is_some() {
            self.op(cu, ThumbOp::CmpImmW, &[rs, imm]);
        } else if modified_immediate(imm.wrapping_neg() as u32).is_some() {
            self.op(cu, ThumbOp::CmnImmW, &[rs, imm]);
        } else {
            self.load_constant(cu, R12, imm)?;
            self.op(cu, ThumbOp::Cmp16, &[rs, R12]);
        }
        Ok(self.cond_branch(cu, cond))
    }

    fn op_branch(&self, cu: &mut CompilationUnit<'_>) -> LirId {
        self.op(cu, ThumbOp::B16, &[])
    }

    fn call_direct(&self, cu: &mut CompilationUnit<'_>, target: u32) -> LirId {
        let mut lir = Lir::new(
            LirOp::Target(ThumbOp::Bl as u16),
            cu.current_dalvik_offset,
            [0; 5],
        );
        lir.call_target = Some(target);
        emit_lir(cu, self, lir)
    }

    fn emit_data_word(&self, cu: &mut CompilationUnit<'_>, value: u32) -> LirId {
        self.op(cu, ThumbOp::Data, &[value as i32])
    }

    fn gen_prologue(&self, cu: &mut CompilationUnit<'_>) -> CompileResult<()> {
        let frame = cu.frame;
        let spills = frame.core_spill_mask;
        self.op(cu, ThumbOp::Push, &[spills as i32]);
        let adjust = frame.frame_size as i32 - 4 * spills.count_ones() as i32;
        self.adjust_sp(cu, AluOp::Sub, adjust)?;
        self.store_base_disp(cu, INFO.method_reg, SP, 0, None)?;
        Ok(())
    }

    fn gen_epilogue(&self, cu: &mut CompilationUnit<'_>) -> CompileResult<()> {
        let frame = cu.frame;
        let spills = frame.core_spill_mask;
        let adjust = frame.frame_size as i32 - 4 * spills.count_ones() as i32;
        self.adjust_sp(cu, AluOp::Add, adjust)?;
        let restore = (spills & !(1 << LR)) | 1 << PC;
        self.op(cu, ThumbOp::Pop, &[restore as i32]);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(pc: u32, target: Option<u32>) -> EncodeContext {
        EncodeContext {
            code_begin: 0x1000,
            pc,
            target_offset: target,
            literal_offset: None,
        }
    }

    fn encode(op: ThumbOp, values: &[i32], ctx: &EncodeContext) -> Result<Vec<u8>, EncodeError> {
        let lir = Lir::new(LirOp::Target(op as u16), 0, operands(values));
        Thumb2Target.encode(&lir, ctx)
    }

    fn bytes(op: ThumbOp, values: &[i32]) -> Vec<u8> {
        encode(op, values, &context(0, None)).expect("encodes")
    }

    #[test]
    fn encodes_register_forms() {
        assert_eq!(bytes(ThumbOp::Mov16, &[0, 1]), [0x08, 0x46]);
        assert_eq!(bytes(ThumbOp::MovImm8, &[2, 5]), [0x05, 0x22]);
        assert_eq!(bytes(ThumbOp::Movw, &[1, 0x1234]), [0x41, 0xF2, 0x34, 0x21]);
        assert_eq!(bytes(ThumbOp::AddW, &[0, 1, 2]), [0x01, 0xEB, 0x02, 0x00]);
        assert_eq!(bytes(ThumbOp::Push, &[1 << 4 | 1 << 14]), [0x10, 0xB5]);
        assert_eq!(bytes(ThumbOp::Pop, &[1 << 4 | 1 << 15]), [0x10, 0xBD]);
        assert_eq!(bytes(ThumbOp::Nop16, &[]), [0x00, 0xBF]);
    }

    #[test]
    fn rejects_forms_outside_their_encoding() {
        let ctx = context(0, None);
        assert_eq!(
            encode(ThumbOp::MovImm8, &[8, 1], &ctx),
            Err(EncodeError::OutOfRange)
        );
        assert_eq!(
            encode(ThumbOp::Push, &[1 << 9], &ctx),
            Err(EncodeError::OutOfRange)
        );
    }

    #[test]
    fn modified_immediates() {
        assert_eq!(modified_immediate(0xff), Some(0xff));
        assert_eq!(modified_immediate(0x00ab_00ab), Some(0x1ab));
        assert_eq!(modified_immediate(0xab00_ab00), Some(0x2ab));
        assert_eq!(modified_immediate(0x8000_0000), Some(0x400));
        assert_eq!(modified_immediate(0x3fc), Some(0xf7f));
        assert_eq!(modified_immediate(0x1234_5678), None);
    }

    #[test]
    fn short_branches_widen_when_out_of_reach() {
        let near = encode(ThumbOp::B16, &[], &context(0, Some(8))).expect("near branch");
        assert_eq!(near, [0x02, 0xE0]);
        let beq = encode(
            ThumbOp::BCond,
            &[0, 0, 0, Cond::Eq.to_operand()],
            &context(0, Some(0x10)),
        )
        .expect("near conditional");
        assert_eq!(beq, [0x06, 0xD0]);
        assert_eq!(
            encode(ThumbOp::B16, &[], &context(0, Some(4000))),
            Err(EncodeError::NeedsLongForm)
        );

        let mut far = Lir::new(LirOp::Target(ThumbOp::B16 as u16), 0, [0; 5]);
        far.long_form = true;
        assert_eq!(Thumb2Target.lir_size(&far), 4);
        let wide = Thumb2Target
            .encode(&far, &context(0, Some(4000)))
            .expect("wide branch");
        assert_eq!(wide.len(), 4);
    }

    #[test]
    fn calls_are_relative_to_the_absolute_pc() {
        let mut lir = Lir::new(LirOp::Target(ThumbOp::Bl as u16), 0, [0; 5]);
        lir.call_target = Some(0x1008);
        let encoded = Thumb2Target
            .encode(&lir, &context(0, None))
            .expect("call encodes");
        assert_eq!(encoded, [0x00, 0xF0, 0x02, 0xF8]);
        let patch = Thumb2Target.chain_patch(0x1000, 0x1008).expect("reachable");
        assert_eq!(patch, [0x00, 0xF0, 0x02, 0xB8]);
    }

    #[test]
    fn literal_loads_use_the_aligned_pc() {
        let mut lir = Lir::new(LirOp::Target(ThumbOp::LdrPcRel as u16), 0, [0; 5]);
        lir.literal = Some(0);
        let ctx = EncodeContext {
            code_begin: 0x1000,
            pc: 2,
            target_offset: None,
            literal_offset: Some(8),
        };
        assert_eq!(Thumb2Target.encode(&lir, &ctx), Ok(vec![0x01, 0x48]));

        lir.operands[0] = R12;
        assert_eq!(Thumb2Target.lir_size(&lir), 4);
        assert_eq!(
            Thumb2Target.encode(&lir, &ctx),
            Ok(vec![0xDF, 0xF8, 0x04, 0xC0])
        );
    }
}
