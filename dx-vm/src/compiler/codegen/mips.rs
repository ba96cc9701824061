//! MIPS32 (little-endian) backend.
//!
//! Branches, jumps and calls carry their delay slot: each encodes as the instruction followed
//! by a nop, so the return address of a call is the end of its LIR. There are no condition
//! codes; compares materialise into `at` through `slt`/`sltu`.

use crate::compiler::codegen::{
    CodegenTarget, EncodeContext, EncodeError, TargetInfo, emit, emit_lir, operands,
    scratch_temp,
};
use crate::compiler::lir::{
    AliasInfo, AluOp, Cond, EncodingInfo, FP_REG_MASK, FP_REG_OFFSET, FpOp, INVALID_REG,
    IS_BRANCH, IS_CALL, IS_DATA, IS_LOAD, IS_STORE, Lir, LirId, LirOp, NEEDS_FIXUP, OpKind,
    REG_DEF_HI_LO, REG_DEF_LR, REG_DEF0, REG_DEF0_USE1, REG_DEF0_USE12, REG_USE_HI_LO,
    REG_USE_LR, REG_USE0, REG_USE01, UnaryOp, is_fp_reg,
};
use crate::compiler::{CompilationUnit, CompileAbort, CompileResult};
use crate::isa::{InstructionSet, mips};

const ZERO: i32 = mips::ZERO as i32;
const AT: i32 = mips::AT as i32;
const V0: i32 = mips::V0 as i32;
const V1: i32 = mips::V1 as i32;
const A0: i32 = mips::A0 as i32;
const SP: i32 = mips::SP as i32;
const RA: i32 = mips::RA as i32;

const NOP_WORD: u32 = 0;
const REGION_MASK: u32 = 0xF000_0000;

encoding_table! {
    pub enum MipsOp {
        Nop => ("nop", "", 4, 0, OpKind::Nop),
        Move => ("move", "!0r, !1r", 4, REG_DEF0_USE1, OpKind::Mov),
        Addu => ("addu", "!0r, !1r, !2r", 4, REG_DEF0_USE12, OpKind::AluRRR(AluOp::Add)),
        Subu => ("subu", "!0r, !1r, !2r", 4, REG_DEF0_USE12, OpKind::AluRRR(AluOp::Sub)),
        And => ("and", "!0r, !1r, !2r", 4, REG_DEF0_USE12, OpKind::AluRRR(AluOp::And)),
        Or => ("or", "!0r, !1r, !2r", 4, REG_DEF0_USE12, OpKind::AluRRR(AluOp::Or)),
        Xor => ("xor", "!0r, !1r, !2r", 4, REG_DEF0_USE12, OpKind::AluRRR(AluOp::Xor)),
        Nor => ("nor", "!0r, !1r, !2r", 4, REG_DEF0_USE12, OpKind::AluRRR(AluOp::Nor)),
        Slt => (
            "slt",
            "!0r, !1r, !2r",
            4,
            REG_DEF0_USE12,
            OpKind::SetLessThan { unsigned: false }
        ),
        Sltu => (
            "sltu",
            "!0r, !1r, !2r",
            4,
            REG_DEF0_USE12,
            OpKind::SetLessThan { unsigned: true }
        ),
        // Operand 1 is the value and operand 2 the count.
        Sllv => ("sllv", "!0r, !1r, !2r", 4, REG_DEF0_USE12, OpKind::AluRRR(AluOp::Lsl)),
        Srlv => ("srlv", "!0r, !1r, !2r", 4, REG_DEF0_USE12, OpKind::AluRRR(AluOp::Lsr)),
        Srav => ("srav", "!0r, !1r, !2r", 4, REG_DEF0_USE12, OpKind::AluRRR(AluOp::Asr)),
        Addiu => ("addiu", "!0r, !1r, #!2d", 4, REG_DEF0_USE1, OpKind::AluRRI(AluOp::Add)),
        Andi => ("andi", "!0r, !1r, #!2x", 4, REG_DEF0_USE1, OpKind::AluRRI(AluOp::And)),
        Ori => ("ori", "!0r, !1r, #!2x", 4, REG_DEF0_USE1, OpKind::AluRRI(AluOp::Or)),
        Xori => ("xori", "!0r, !1r, #!2x", 4, REG_DEF0_USE1, OpKind::AluRRI(AluOp::Xor)),
        Slti => (
            "slti",
            "!0r, !1r, #!2d",
            4,
            REG_DEF0_USE1,
            OpKind::SetLessThanImm { unsigned: false }
        ),
        Sltiu => (
            "sltiu",
            "!0r, !1r, #!2d",
            4,
            REG_DEF0_USE1,
            OpKind::SetLessThanImm { unsigned: true }
        ),
        Lui => ("lui", "!0r, #!1x", 4, REG_DEF0, OpKind::LoadUpper),
        Sll => ("sll", "!0r, !1r, #!2d", 4, REG_DEF0_USE1, OpKind::AluRRI(AluOp::Lsl)),
        Srl => ("srl", "!0r, !1r, #!2d", 4, REG_DEF0_USE1, OpKind::AluRRI(AluOp::Lsr)),
        Sra => ("sra", "!0r, !1r, #!2d", 4, REG_DEF0_USE1, OpKind::AluRRI(AluOp::Asr)),
        Mult => ("mult", "!0r, !1r", 4, REG_USE01 | REG_DEF_HI_LO, OpKind::MultHiLo),
        Div => ("div", "!0r, !1r", 4, REG_USE01 | REG_DEF_HI_LO, OpKind::DivHiLo),
        Mflo => ("mflo", "!0r", 4, REG_DEF0 | REG_USE_HI_LO, OpKind::MoveFromLo),
        Mfhi => ("mfhi", "!0r", 4, REG_DEF0 | REG_USE_HI_LO, OpKind::MoveFromHi),
        Lw => ("lw", "!0r, !2d(!1r)", 4, REG_DEF0_USE1 | IS_LOAD, OpKind::Load),
        Sw => ("sw", "!0r, !2d(!1r)", 4, REG_USE01 | IS_STORE, OpKind::Store),
        Lwc1 => ("lwc1", "!0r, !2d(!1r)", 4, REG_DEF0_USE1 | IS_LOAD, OpKind::Load),
        Swc1 => ("swc1", "!0r, !2d(!1r)", 4, REG_USE01 | IS_STORE, OpKind::Store),
        Bcmp => (
            "b!3c",
            "!0r, !1r, !0t",
            8,
            REG_USE01 | IS_BRANCH | NEEDS_FIXUP,
            OpKind::CmpBranch(Cond::Al)
        ),
        Bz => (
            "b!3cz",
            "!0r, !0t",
            8,
            REG_USE0 | IS_BRANCH | NEEDS_FIXUP,
            OpKind::CmpZeroBranch(Cond::Al)
        ),
        B => ("b", "!0t", 8, IS_BRANCH | NEEDS_FIXUP, OpKind::Branch),
        Jal => ("jal", "", 8, IS_CALL | REG_DEF_LR, OpKind::Call),
        Jr => ("jr", "ra", 8, IS_BRANCH | REG_USE_LR, OpKind::Return),
        AddS => ("add.s", "!0r, !1r, !2r", 4, REG_DEF0_USE12, OpKind::FpRRR(FpOp::Add)),
        SubS => ("sub.s", "!0r, !1r, !2r", 4, REG_DEF0_USE12, OpKind::FpRRR(FpOp::Sub)),
        MulS => ("mul.s", "!0r, !1r, !2r", 4, REG_DEF0_USE12, OpKind::FpRRR(FpOp::Mul)),
        DivS => ("div.s", "!0r, !1r, !2r", 4, REG_DEF0_USE12, OpKind::FpRRR(FpOp::Div)),
        MovS => ("mov.s", "!0r, !1r", 4, REG_DEF0_USE1, OpKind::Mov),
        Mtc1 => ("mtc1", "!1r, !0r", 4, REG_DEF0_USE1, OpKind::Mov),
        Mfc1 => ("mfc1", "!0r, !1r", 4, REG_DEF0_USE1, OpKind::Mov),
        Data => (".word", "!0x", 4, IS_DATA, OpKind::Data),
    }
}

static INFO: TargetInfo = TargetInfo {
    isa: InstructionSet::Mips,
    sp: SP,
    lr: RA,
    pc: INVALID_REG,
    core_temps: &[V0, V1, A0, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15],
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
    promotable: &[18, 19, 20, 21, 22, 23],
    args: &[A0, 5, 6, 7],
    rets: [V0, V1],
    method_reg: A0,
    trace_fp: mips::S0 as i32,
    scratch: Some(AT),
    shift_count_reg: None,
    mask_shift_count: false,
    inline_fp: true,
    inline_int_div: true,
    div_regs: None,
};

pub struct MipsTarget;

fn field(reg: i32) -> u32 {
    (reg & 31) as u32
}

fn fp_field(reg: i32) -> u32 {
    (reg & FP_REG_MASK) as u32
}

fn r_type(rs: u32, rt: u32, rd: u32, shamt: u32, funct: u32) -> u32 {
    rs << 21 | rt << 16 | rd << 11 | (shamt & 31) << 6 | funct
}

fn i_type(opcode: u32, rs: u32, rt: u32, imm: u32) -> u32 {
    opcode << 26 | rs << 21 | rt << 16 | imm & 0xffff
}

fn cop1_s(ft: u32, fs: u32, fd: u32, funct: u32) -> u32 {
    0x4600_0000 | ft << 16 | fs << 11 | fd << 6 | funct
}

fn fits_i16(value: i32) -> bool {
    i16::try_from(value).is_ok()
}

fn words(values: &[u32]) -> Vec<u8> {
    values.iter().flat_map(|word| word.to_le_bytes()).collect()
}

/// `j`/`jal` to absolute `target` from the instruction at absolute `pc`.
fn jump_word(opcode: u32, pc: u32, target: u32) -> Result<u32, EncodeError> {
    if target % 4 != 0 || (pc.wrapping_add(4) & REGION_MASK) != (target & REGION_MASK) {
        return Err(EncodeError::OutOfRange);
    }
    Ok(opcode << 26 | (target >> 2) & 0x03ff_ffff)
}

/// Compare-and-branch word for `cond`, or `None` when the hardware has no such branch.
fn branch_word(op: MipsOp, cond: Cond, rs: i32, rt: i32, offset: u32) -> Option<u32> {
    let rs = field(rs);
    Some(match (op, cond) {
        (MipsOp::Bcmp, Cond::Eq) => i_type(0x04, rs, field(rt), offset),
        (MipsOp::Bcmp, Cond::Ne) => i_type(0x05, rs, field(rt), offset),
        (MipsOp::Bz, Cond::Eq) => i_type(0x04, rs, 0, offset),
        (MipsOp::Bz, Cond::Ne) => i_type(0x05, rs, 0, offset),
        (MipsOp::Bz, Cond::Lt) => i_type(0x01, rs, 0, offset),
        (MipsOp::Bz, Cond::Ge) => i_type(0x01, rs, 1, offset),
        (MipsOp::Bz, Cond::Gt) => i_type(0x07, rs, 0, offset),
        (MipsOp::Bz, Cond::Le) => i_type(0x06, rs, 0, offset),
        (MipsOp::B, _) => i_type(0x04, 0, 0, offset),
        _ => return None,
    })
}

impl MipsTarget {
    fn op(&self, cu: &mut CompilationUnit<'_>, op: MipsOp, values: &[i32]) -> LirId {
        emit(cu, self, op as u16, operands(values))
    }

    fn cmp_branch(&self, cu: &mut CompilationUnit<'_>, cond: Cond, rs: i32, rt: i32) -> LirId {
        self.op(cu, MipsOp::Bcmp, &[rs, rt, 0, cond.to_operand()])
    }

    fn zero_branch(&self, cu: &mut CompilationUnit<'_>, cond: Cond, rs: i32) -> LirId {
        self.op(cu, MipsOp::Bz, &[rs, 0, 0, cond.to_operand()])
    }

    /// `(base, disp)` with `disp` in signed 16-bit range, going through `at` if needed.
    fn reachable(&self, cu: &mut CompilationUnit<'_>, base: i32, disp: i32) -> CompileResult<(i32, i32)> {
        if fits_i16(disp) {
            return Ok((base, disp));
        }
        self.load_constant(cu, AT, disp)?;
        self.op(cu, MipsOp::Addu, &[AT, AT, base]);
        Ok((AT, 0))
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
        let (base, disp) = self.reachable(cu, base, disp)?;
        let op = match (is_fp_reg(reg), load) {
            (true, true) => MipsOp::Lwc1,
            (true, false) => MipsOp::Swc1,
            (false, true) => MipsOp::Lw,
            (false, false) => MipsOp::Sw,
        };
        let mut lir = Lir::new(
            LirOp::Target(op as u16),
            cu.current_dalvik_offset,
            operands(&[reg, base, disp]),
        );
        lir.alias = alias;
        Ok(emit_lir(cu, self, lir))
    }

    fn indexed_address(
        &self,
        cu: &mut CompilationUnit<'_>,
        base: i32,
        index: i32,
        scale: i32,
    ) -> i32 {
        if scale == 0 {
            self.op(cu, MipsOp::Addu, &[AT, base, index]);
        } else {
            self.op(cu, MipsOp::Sll, &[AT, index, scale]);
            self.op(cu, MipsOp::Addu, &[AT, AT, base]);
        }
        AT
    }

    fn encode_branch(
        &self,
        op: MipsOp,
        lir: &Lir,
        ctx: &EncodeContext,
    ) -> Result<Vec<u8>, EncodeError> {
        let [rs, rt, _, cond, _] = lir.operands;
        let cond = Cond::from_operand(cond);
        let target = ctx.target_offset.ok_or(EncodeError::OutOfRange)?;
        let delta = target as i64 - (ctx.pc as i64 + 4);
        if delta % 4 != 0 {
            return Err(EncodeError::OutOfRange);
        }
        let offset = delta / 4;
        if !lir.long_form {
            if !(i16::MIN as i64..=i16::MAX as i64).contains(&offset) {
                return Err(EncodeError::NeedsLongForm);
            }
            let word = branch_word(op, cond, rs, rt, offset as u32)
                .ok_or(EncodeError::OutOfRange)?;
            return Ok(words(&[word, NOP_WORD]));
        }
        let absolute = ctx.code_begin.wrapping_add(target);
        if op == MipsOp::B {
            let pc = ctx.code_begin.wrapping_add(ctx.pc);
            return Ok(words(&[jump_word(0x02, pc, absolute)?, NOP_WORD]));
        }
        // Inverted branch over the delay slot and the jump.
        let skip = branch_word(op, cond.flip(), rs, rt, 3).ok_or(EncodeError::OutOfRange)?;
        let jump_pc = ctx.code_begin.wrapping_add(ctx.pc + 8);
        Ok(words(&[
            skip,
            NOP_WORD,
            jump_word(0x02, jump_pc, absolute)?,
            NOP_WORD,
        ]))
    }
}

impl CodegenTarget for MipsTarget {
    fn info(&self) -> &'static TargetInfo {
        &INFO
    }

    fn encoding(&self, opcode: u16) -> &'static EncodingInfo {
        ENCODINGS
            .get(opcode as usize)
            .unwrap_or(&ENCODINGS[MipsOp::Nop as usize])
    }

    fn lir_size(&self, lir: &Lir) -> u8 {
        match lir.target_opcode().and_then(MipsOp::from_u16) {
            Some(MipsOp::Bcmp | MipsOp::Bz) if lir.long_form => 16,
            Some(op) => ENCODINGS[op as usize].size,
            None => 0,
        }
    }

    fn encode(&self, lir: &Lir, ctx: &EncodeContext) -> Result<Vec<u8>, EncodeError> {
        let op = lir
            .target_opcode()
            .and_then(MipsOp::from_u16)
            .ok_or(EncodeError::OutOfRange)?;
        let [a, b, c, _, _] = lir.operands;
        let (ra, rb, rc) = (field(a), field(b), field(c));
        let word = match op {
            MipsOp::Nop => NOP_WORD,
            MipsOp::Move => r_type(rb, 0, ra, 0, 0x21),
            MipsOp::Addu => r_type(rb, rc, ra, 0, 0x21),
            MipsOp::Subu => r_type(rb, rc, ra, 0, 0x23),
            MipsOp::And => r_type(rb, rc, ra, 0, 0x24),
            MipsOp::Or => r_type(rb, rc, ra, 0, 0x25),
            MipsOp::Xor => r_type(rb, rc, ra, 0, 0x26),
            MipsOp::Nor => r_type(rb, rc, ra, 0, 0x27),
            MipsOp::Slt => r_type(rb, rc, ra, 0, 0x2a),
            MipsOp::Sltu => r_type(rb, rc, ra, 0, 0x2b),
            MipsOp::Sllv => r_type(rc, rb, ra, 0, 0x04),
            MipsOp::Srlv => r_type(rc, rb, ra, 0, 0x06),
            MipsOp::Srav => r_type(rc, rb, ra, 0, 0x07),
            MipsOp::Addiu | MipsOp::Slti | MipsOp::Sltiu => {
                if !fits_i16(c) {
                    return Err(EncodeError::OutOfRange);
                }
                let opcode = match op {
                    MipsOp::Addiu => 0x09,
                    MipsOp::Slti => 0x0a,
                    _ => 0x0b,
                };
                i_type(opcode, rb, ra, c as u32)
            }
            MipsOp::Andi | MipsOp::Ori | MipsOp::Xori => {
                if !(0..=0xffff).contains(&c) {
                    return Err(EncodeError::OutOfRange);
                }
                let opcode = match op {
                    MipsOp::Andi => 0x0c,
                    MipsOp::Ori => 0x0d,
                    _ => 0x0e,
                };
                i_type(opcode, rb, ra, c as u32)
            }
            MipsOp::Lui => i_type(0x0f, 0, ra, b as u32),
            MipsOp::Sll => r_type(0, rb, ra, c as u32, 0x00),
            MipsOp::Srl => r_type(0, rb, ra, c as u32, 0x02),
            MipsOp::Sra => r_type(0, rb, ra, c as u32, 0x03),
            MipsOp::Mult => r_type(ra, rb, 0, 0, 0x18),
            MipsOp::Div => r_type(ra, rb, 0, 0, 0x1a),
            MipsOp::Mflo => r_type(0, 0, ra, 0, 0x12),
            MipsOp::Mfhi => r_type(0, 0, ra, 0, 0x10),
            MipsOp::Lw | MipsOp::Sw | MipsOp::Lwc1 | MipsOp::Swc1 => {
                if !fits_i16(c) {
                    return Err(EncodeError::OutOfRange);
                }
                let (opcode, rt) = match op {
                    MipsOp::Lw => (0x23, ra),
                    MipsOp::Sw => (0x2b, ra),
                    MipsOp::Lwc1 => (0x31, fp_field(a)),
                    _ => (0x39, fp_field(a)),
                };
                i_type(opcode, rb, rt, c as u32)
            }
            MipsOp::Bcmp | MipsOp::Bz | MipsOp::B => return self.encode_branch(op, lir, ctx),
            MipsOp::Jal => {
                let target = lir.call_target.ok_or(EncodeError::OutOfRange)?;
                let pc = ctx.code_begin.wrapping_add(ctx.pc);
                return Ok(words(&[jump_word(0x03, pc, target)?, NOP_WORD]));
            }
            MipsOp::Jr => return Ok(words(&[r_type(field(RA), 0, 0, 0, 0x08), NOP_WORD])),
            MipsOp::AddS => cop1_s(fp_field(c), fp_field(b), fp_field(a), 0),
            MipsOp::SubS => cop1_s(fp_field(c), fp_field(b), fp_field(a), 1),
            MipsOp::MulS => cop1_s(fp_field(c), fp_field(b), fp_field(a), 2),
            MipsOp::DivS => cop1_s(fp_field(c), fp_field(b), fp_field(a), 3),
            MipsOp::MovS => cop1_s(0, fp_field(b), fp_field(a), 6),
            MipsOp::Mtc1 => 0x4480_0000 | rb << 16 | fp_field(a) << 11,
            MipsOp::Mfc1 => 0x4400_0000 | ra << 16 | fp_field(b) << 11,
            MipsOp::Data => a as u32,
        };
        Ok(words(&[word]))
    }

    fn chain_patch(&self, from: u32, to: u32) -> Option<Vec<u8>> {
        jump_word(0x02, from, to)
            .ok()
            .map(|jump| words(&[jump, NOP_WORD]))
    }

    fn op_reg_copy(&self, cu: &mut CompilationUnit<'_>, rd: i32, rs: i32) -> LirId {
        let op = match (is_fp_reg(rd), is_fp_reg(rs)) {
            (false, false) => MipsOp::Move,
            (true, true) => MipsOp::MovS,
            (true, false) => MipsOp::Mtc1,
            (false, true) => MipsOp::Mfc1,
        };
        self.op(cu, op, &[rd, rs])
    }

    fn load_constant(&self, cu: &mut CompilationUnit<'_>, rd: i32, value: i32) -> CompileResult<()> {
        if is_fp_reg(rd) {
            self.load_constant(cu, AT, value)?;
            self.op(cu, MipsOp::Mtc1, &[rd, AT]);
            return Ok(());
        }
        if (0..=0xffff).contains(&value) {
            self.op(cu, MipsOp::Ori, &[rd, ZERO, value]);
        } else if fits_i16(value) {
            self.op(cu, MipsOp::Addiu, &[rd, ZERO, value]);
        } else {
            let bits = value as u32;
            self.op(cu, MipsOp::Lui, &[rd, (bits >> 16) as i32]);
            if bits & 0xffff != 0 {
                self.op(cu, MipsOp::Ori, &[rd, rd, (bits & 0xffff) as i32]);
            }
        }
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
        let mips = match op {
            AluOp::Add => MipsOp::Addu,
            AluOp::Sub => MipsOp::Subu,
            AluOp::And => MipsOp::And,
            AluOp::Or => MipsOp::Or,
            AluOp::Xor => MipsOp::Xor,
            AluOp::Nor => MipsOp::Nor,
            AluOp::Lsl => MipsOp::Sllv,
            AluOp::Lsr => MipsOp::Srlv,
            AluOp::Asr => MipsOp::Srav,
            AluOp::Rsub => {
                self.op(cu, MipsOp::Subu, &[rd, rt, rs]);
                return Ok(());
            }
            AluOp::Mul => {
                self.op(cu, MipsOp::Mult, &[rs, rt]);
                self.op(cu, MipsOp::Mflo, &[rd]);
                return Ok(());
            }
            AluOp::Adds | AluOp::Adc | AluOp::Subs | AluOp::Sbc | AluOp::Ror => {
                return Err(CompileAbort::Internal(format!("no {op:?} on mips")));
            }
        };
        self.op(cu, mips, &[rd, rs, rt]);
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
            AluOp::Add if fits_i16(imm) => {
                self.op(cu, MipsOp::Addiu, &[rd, rs, imm]);
                return Ok(());
            }
            AluOp::Sub if imm != i32::MIN && fits_i16(-imm) => {
                self.op(cu, MipsOp::Addiu, &[rd, rs, -imm]);
                return Ok(());
            }
            AluOp::And | AluOp::Or | AluOp::Xor if (0..=0xffff).contains(&imm) => {
                let mips = match op {
                    AluOp::And => MipsOp::Andi,
                    AluOp::Or => MipsOp::Ori,
                    _ => MipsOp::Xori,
                };
                self.op(cu, mips, &[rd, rs, imm]);
                return Ok(());
            }
            AluOp::Lsl | AluOp::Lsr | AluOp::Asr => {
                let mips = match op {
                    AluOp::Lsl => MipsOp::Sll,
                    AluOp::Lsr => MipsOp::Srl,
                    _ => MipsOp::Sra,
                };
                self.op(cu, mips, &[rd, rs, imm & 31]);
                return Ok(());
            }
            AluOp::Ror => {
                let shift = imm & 31;
                if shift == 0 {
                    if rd != rs {
                        self.op_reg_copy(cu, rd, rs);
                    }
                    return Ok(());
                }
                self.op(cu, MipsOp::Srl, &[AT, rs, shift]);
                self.op(cu, MipsOp::Sll, &[rd, rs, 32 - shift]);
                self.op(cu, MipsOp::Or, &[rd, rd, AT]);
                return Ok(());
            }
            _ => {}
        }
        self.load_constant(cu, AT, imm)?;
        self.op_reg_reg_reg(cu, op, rd, rs, AT)
    }

    fn op_unary(
        &self,
        cu: &mut CompilationUnit<'_>,
        op: UnaryOp,
        rd: i32,
        rs: i32,
    ) -> CompileResult<()> {
        match op {
            UnaryOp::Neg => self.op(cu, MipsOp::Subu, &[rd, ZERO, rs]),
            UnaryOp::Not => self.op(cu, MipsOp::Nor, &[rd, rs, ZERO]),
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
        let mips = match op {
            FpOp::Add => MipsOp::AddS,
            FpOp::Sub => MipsOp::SubS,
            FpOp::Mul => MipsOp::MulS,
            FpOp::Div => MipsOp::DivS,
        };
        self.op(cu, mips, &[fd, fs, ft]);
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
        let address = self.indexed_address(cu, base, index, scale);
        self.memory_op(cu, true, rd, address, disp, None)?;
        Ok(())
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
        let address = self.indexed_address(cu, base, index, scale);
        self.memory_op(cu, false, rs, address, disp, None)?;
        Ok(())
    }

    fn op_cmp_branch(
        &self,
        cu: &mut CompilationUnit<'_>,
        cond: Cond,
        rs: i32,
        rt: i32,
    ) -> CompileResult<LirId> {
        let branch = match cond {
            Cond::Eq | Cond::Ne => self.cmp_branch(cu, cond, rs, rt),
            Cond::Al => self.op(cu, MipsOp::B, &[]),
            Cond::Mi | Cond::Pl => {
                self.op(cu, MipsOp::Subu, &[AT, rs, rt]);
                let sign = if cond == Cond::Mi { Cond::Lt } else { Cond::Ge };
                self.zero_branch(cu, sign, AT)
            }
            _ => {
                // at = (lhs < rhs); branch on it being set or clear.
                let (unsigned, swap, taken_when_set) = match cond {
                    Cond::Lt => (false, false, true),
                    Cond::Ge => (false, false, false),
                    Cond::Gt => (false, true, true),
                    Cond::Le => (false, true, false),
                    Cond::Cc => (true, false, true),
                    Cond::Cs => (true, false, false),
                    Cond::Hi => (true, true, true),
                    _ => (true, true, false),
                };
                let (lhs, rhs) = if swap { (rt, rs) } else { (rs, rt) };
                let slt = if unsigned { MipsOp::Sltu } else { MipsOp::Slt };
                self.op(cu, slt, &[AT, lhs, rhs]);
                let test = if taken_when_set { Cond::Ne } else { Cond::Eq };
                self.cmp_branch(cu, test, AT, ZERO)
            }
        };
        Ok(branch)
    }

    fn op_cmp_imm_branch(
        &self,
        cu: &mut CompilationUnit<'_>,
        cond: Cond,
        rs: i32,
        imm: i32,
    ) -> CompileResult<LirId> {
        if imm == 0 {
            let branch = match cond {
                Cond::Eq | Cond::Ne => self.cmp_branch(cu, cond, rs, ZERO),
                Cond::Lt | Cond::Ge | Cond::Gt | Cond::Le => self.zero_branch(cu, cond, rs),
                Cond::Mi => self.zero_branch(cu, Cond::Lt, rs),
                Cond::Pl => self.zero_branch(cu, Cond::Ge, rs),
                Cond::Hi => self.cmp_branch(cu, Cond::Ne, rs, ZERO),
                Cond::Ls => self.cmp_branch(cu, Cond::Eq, rs, ZERO),
                // Unsigned >= 0 always holds and < 0 never does.
                Cond::Cs | Cond::Al => self.op(cu, MipsOp::B, &[]),
                Cond::Cc => self.cmp_branch(cu, Cond::Ne, ZERO, ZERO),
            };
            return Ok(branch);
        }
        let set_less = match cond {
            Cond::Lt | Cond::Ge | Cond::Cc | Cond::Cs if fits_i16(imm) => Some((imm, cond)),
            Cond::Gt | Cond::Le | Cond::Hi | Cond::Ls
                if imm != -1 && imm != i32::MAX && fits_i16(imm + 1) =>
            {
                Some((imm + 1, cond))
            }
            _ => None,
        };
        let Some((bound, cond)) = set_less else {
            self.load_constant(cu, AT, imm)?;
            return self.op_cmp_branch(cu, cond, rs, AT);
        };
        let unsigned = matches!(cond, Cond::Cc | Cond::Cs | Cond::Hi | Cond::Ls);
        let slti = if unsigned { MipsOp::Sltiu } else { MipsOp::Slti };
        self.op(cu, slti, &[AT, rs, bound]);
        // rs < bound for Lt/Cc and for Le/Ls once the bound is bumped.
        let taken_when_set = matches!(cond, Cond::Lt | Cond::Cc | Cond::Le | Cond::Ls);
        let test = if taken_when_set { Cond::Ne } else { Cond::Eq };
        Ok(self.cmp_branch(cu, test, AT, ZERO))
    }

    fn op_branch(&self, cu: &mut CompilationUnit<'_>) -> LirId {
        self.op(cu, MipsOp::B, &[])
    }

    fn call_direct(&self, cu: &mut CompilationUnit<'_>, target: u32) -> LirId {
        let mut lir = Lir::new(
            LirOp::Target(MipsOp::Jal as u16),
            cu.current_dalvik_offset,
            [0; 5],
        );
        lir.call_target = Some(target);
        emit_lir(cu, self, lir)
    }

    fn emit_data_word(&self, cu: &mut CompilationUnit<'_>, value: u32) -> LirId {
        self.op(cu, MipsOp::Data, &[value as i32])
    }

    fn gen_prologue(&self, cu: &mut CompilationUnit<'_>) -> CompileResult<()> {
        let frame = cu.frame;
        self.op(cu, MipsOp::Addiu, &[SP, SP, -(frame.frame_size as i32)]);
        for reg in 0..mips::NUM_CORE_REGISTERS {
            if let Some(offset) = frame.core_spill_offset(reg) {
                self.store_base_disp(cu, reg as i32, SP, offset as i32, None)?;
            }
        }
        self.store_base_disp(cu, INFO.method_reg, SP, 0, None)?;
        Ok(())
    }

    fn gen_epilogue(&self, cu: &mut CompilationUnit<'_>) -> CompileResult<()> {
        let frame = cu.frame;
        for reg in 0..mips::NUM_CORE_REGISTERS {
            if let Some(offset) = frame.core_spill_offset(reg) {
                self.load_base_disp(cu, reg as i32, SP, offset as i32, None)?;
            }
        }
        self.op(cu, MipsOp::Addiu, &[SP, SP, frame.frame_size as i32]);
        self.op(cu, MipsOp::Jr, &[RA]);
        Ok(())
    }

    fn gen_long_arith(
        &self,
        cu: &mut CompilationUnit<'_>,
        op: AluOp,
        dest: (i32, i32),
        a: (i32, i32),
        b: (i32, i32),
    ) -> CompileResult<()> {
        match op {
            AluOp::Add => {
                self.op(cu, MipsOp::Addu, &[dest.0, a.0, b.0]);
                self.op(cu, MipsOp::Sltu, &[AT, dest.0, b.0]);
                self.op(cu, MipsOp::Addu, &[dest.1, a.1, b.1]);
                self.op(cu, MipsOp::Addu, &[dest.1, dest.1, AT]);
            }
            AluOp::Sub => {
                self.op(cu, MipsOp::Sltu, &[AT, a.0, b.0]);
                self.op(cu, MipsOp::Subu, &[dest.0, a.0, b.0]);
                self.op(cu, MipsOp::Subu, &[dest.1, a.1, b.1]);
                self.op(cu, MipsOp::Subu, &[dest.1, dest.1, AT]);
            }
            other => {
                self.op_reg_reg_reg(cu, other, dest.0, a.0, b.0)?;
                self.op_reg_reg_reg(cu, other, dest.1, a.1, b.1)?;
            }
        }
        Ok(())
    }

    fn gen_div_rem(
        &self,
        cu: &mut CompilationUnit<'_>,
        dividend: i32,
        divisor: i32,
        is_div: bool,
    ) -> CompileResult<i32> {
        let result = scratch_temp(cu)?;
        self.op(cu, MipsOp::Div, &[dividend, divisor]);
        let mov = if is_div { MipsOp::Mflo } else { MipsOp::Mfhi };
        self.op(cu, mov, &[result]);
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CODE_BEGIN: u32 = 0x6010_0000;

    fn context(pc: u32, target: Option<u32>) -> EncodeContext {
        EncodeContext {
            code_begin: CODE_BEGIN,
            pc,
            target_offset: target,
            literal_offset: None,
        }
    }

    fn lir(op: MipsOp, values: &[i32]) -> Lir {
        Lir::new(LirOp::Target(op as u16), 0, operands(values))
    }

    fn word_bytes(word: u32) -> Vec<u8> {
        word.to_le_bytes().to_vec()
    }

    #[test]
    fn encodes_alu_and_memory_words() {
        let ctx = context(0, None);
        let encode = |op, values: &[i32]| MipsTarget.encode(&lir(op, values), &ctx);
        assert_eq!(encode(MipsOp::Addu, &[V0, A0, 5]), Ok(word_bytes(0x0085_1021)));
        assert_eq!(encode(MipsOp::Addiu, &[SP, SP, -16]), Ok(word_bytes(0x27BD_FFF0)));
        assert_eq!(encode(MipsOp::Lw, &[RA, SP, 12]), Ok(word_bytes(0x8FBF_000C)));
        assert_eq!(encode(MipsOp::Lui, &[8, 0x1234]), Ok(word_bytes(0x3C08_1234)));
        assert_eq!(
            encode(MipsOp::AddS, &[FP_REG_OFFSET, FP_REG_OFFSET + 2, FP_REG_OFFSET + 4]),
            Ok(word_bytes(0x4604_1000))
        );
        assert_eq!(
            encode(MipsOp::Addiu, &[V0, V0, 0x12345]),
            Err(EncodeError::OutOfRange)
        );
    }

    #[test]
    fn control_transfers_carry_their_delay_slot() {
        let ret = MipsTarget
            .encode(&lir(MipsOp::Jr, &[RA]), &context(0, None))
            .expect("jr encodes");
        assert_eq!(ret, [0x08, 0x00, 0xE0, 0x03, 0, 0, 0, 0]);

        let mut call = lir(MipsOp::Jal, &[]);
        call.call_target = Some(0x6000_0040);
        let encoded = MipsTarget
            .encode(&call, &context(0, None))
            .expect("jal encodes");
        assert_eq!(encoded[..4], word_bytes(0x0C00_0010)[..]);
        assert_eq!(encoded.len(), 8);
    }

    #[test]
    fn far_conditional_branches_invert_around_a_jump() {
        let mut branch = lir(MipsOp::Bcmp, &[A0, 5, 0, Cond::Eq.to_operand()]);
        let near = MipsTarget
            .encode(&branch, &context(0, Some(0x10)))
            .expect("near branch");
        assert_eq!(near[..4], word_bytes(0x1085_0003)[..]);

        let far = context(0, Some(0x4_0000));
        assert_eq!(MipsTarget.encode(&branch, &far), Err(EncodeError::NeedsLongForm));
        branch.long_form = true;
        assert_eq!(MipsTarget.lir_size(&branch), 16);
        let long = MipsTarget.encode(&branch, &far).expect("long branch");
        assert_eq!(long[..4], word_bytes(0x1485_0003)[..]);
        assert_eq!(long[8..12], word_bytes(0x0805_0000)[..]);
    }

    #[test]
    fn chaining_stays_within_the_jump_region() {
        assert!(MipsTarget.chain_patch(CODE_BEGIN, CODE_BEGIN + 0x100).is_some());
        assert!(MipsTarget.chain_patch(CODE_BEGIN, 0x1000_0000).is_none());
    }
}
