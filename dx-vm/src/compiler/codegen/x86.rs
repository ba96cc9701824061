//! x86 backend.
//!
//! Two-address ALU forms only; three-address LIR requests are lowered through a copy into the
//! destination. There is no scratch register and no fp register file, so floats go through
//! templates.

use crate::compiler::codegen::{
    CodegenTarget, EncodeContext, EncodeError, TargetInfo, emit, emit_lir, emit_pseudo, operands,
};
use crate::compiler::lir::{
    AliasInfo, AluOp, Cond, EncodingInfo, INVALID_REG, IS_BRANCH, IS_CALL, IS_DATA, IS_LOAD,
    IS_STORE, Lir, LirId, LirOp, NEEDS_FIXUP, OpKind, PseudoOp, REG_DEF_LIST0, REG_DEF_SP,
    REG_DEF0, REG_DEF0_USE0, REG_DEF0_USE01, REG_DEF0_USE1, REG_USE_LIST0, REG_USE_SP,
    REG_USE0, REG_USE01, REG_USE12, SETS_CCODES, USES_CCODES, UnaryOp,
};
use crate::compiler::{CompilationUnit, CompileAbort, CompileResult};
use crate::isa::{InstructionSet, x86};

const EAX: i32 = x86::EAX as i32;
const ECX: i32 = x86::ECX as i32;
const EDX: i32 = x86::EDX as i32;
const EBX: i32 = x86::EBX as i32;
const ESP: i32 = x86::ESP as i32;
const EBP: i32 = x86::EBP as i32;
const ESI: i32 = x86::ESI as i32;
const EDI: i32 = x86::EDI as i32;

encoding_table! {
    pub enum X86Op {
        Nop => ("nop", "", 1, 0, OpKind::Nop),
        MovRR => ("mov", "!0r, !1r", 2, REG_DEF0_USE1, OpKind::Mov),
        MovRI => ("mov", "!0r, #!1d", 5, REG_DEF0, OpKind::MovImm),
        AddRR => ("add", "!0r, !1r", 2, REG_DEF0_USE01 | SETS_CCODES, OpKind::AluRR(AluOp::Add)),
        AddsRR => ("add", "!0r, !1r", 2, REG_DEF0_USE01 | SETS_CCODES, OpKind::AluRR(AluOp::Adds)),
        AdcRR => (
            "adc",
            "!0r, !1r",
            2,
            REG_DEF0_USE01 | SETS_CCODES | USES_CCODES,
            OpKind::AluRR(AluOp::Adc)
        ),
        SubRR => ("sub", "!0r, !1r", 2, REG_DEF0_USE01 | SETS_CCODES, OpKind::AluRR(AluOp::Sub)),
        SubsRR => ("sub", "!0r, !1r", 2, REG_DEF0_USE01 | SETS_CCODES, OpKind::AluRR(AluOp::Subs)),
        SbbRR => (
            "sbb",
            "!0r, !1r",
            2,
            REG_DEF0_USE01 | SETS_CCODES | USES_CCODES,
            OpKind::AluRR(AluOp::Sbc)
        ),
        AndRR => ("and", "!0r, !1r", 2, REG_DEF0_USE01 | SETS_CCODES, OpKind::AluRR(AluOp::And)),
        OrRR => ("or", "!0r, !1r", 2, REG_DEF0_USE01 | SETS_CCODES, OpKind::AluRR(AluOp::Or)),
        XorRR => ("xor", "!0r, !1r", 2, REG_DEF0_USE01 | SETS_CCODES, OpKind::AluRR(AluOp::Xor)),
        ImulRR => ("imul", "!0r, !1r", 3, REG_DEF0_USE01 | SETS_CCODES, OpKind::AluRR(AluOp::Mul)),
        ShlRC => ("shl", "!0r, cl", 2, REG_DEF0_USE01 | SETS_CCODES, OpKind::AluRR(AluOp::Lsl)),
        ShrRC => ("shr", "!0r, cl", 2, REG_DEF0_USE01 | SETS_CCODES, OpKind::AluRR(AluOp::Lsr)),
        SarRC => ("sar", "!0r, cl", 2, REG_DEF0_USE01 | SETS_CCODES, OpKind::AluRR(AluOp::Asr)),
        RorRC => ("ror", "!0r, cl", 2, REG_DEF0_USE01 | SETS_CCODES, OpKind::AluRR(AluOp::Ror)),
        AddRI => ("add", "!0r, #!1d", 3, REG_DEF0_USE0 | SETS_CCODES, OpKind::AluRI(AluOp::Add)),
        AddsRI => ("add", "!0r, #!1d", 3, REG_DEF0_USE0 | SETS_CCODES, OpKind::AluRI(AluOp::Adds)),
        AdcRI => (
            "adc",
            "!0r, #!1d",
            3,
            REG_DEF0_USE0 | SETS_CCODES | USES_CCODES,
            OpKind::AluRI(AluOp::Adc)
        ),
        SubRI => ("sub", "!0r, #!1d", 3, REG_DEF0_USE0 | SETS_CCODES, OpKind::AluRI(AluOp::Sub)),
        SubsRI => ("sub", "!0r, #!1d", 3, REG_DEF0_USE0 | SETS_CCODES, OpKind::AluRI(AluOp::Subs)),
        SbbRI => (
            "sbb",
            "!0r, #!1d",
            3,
            REG_DEF0_USE0 | SETS_CCODES | USES_CCODES,
            OpKind::AluRI(AluOp::Sbc)
        ),
        AndRI => ("and", "!0r, #!1x", 3, REG_DEF0_USE0 | SETS_CCODES, OpKind::AluRI(AluOp::And)),
        OrRI => ("or", "!0r, #!1x", 3, REG_DEF0_USE0 | SETS_CCODES, OpKind::AluRI(AluOp::Or)),
        XorRI => ("xor", "!0r, #!1x", 3, REG_DEF0_USE0 | SETS_CCODES, OpKind::AluRI(AluOp::Xor)),
        ShlRI => ("shl", "!0r, #!1d", 3, REG_DEF0_USE0 | SETS_CCODES, OpKind::AluRI(AluOp::Lsl)),
        ShrRI => ("shr", "!0r, #!1d", 3, REG_DEF0_USE0 | SETS_CCODES, OpKind::AluRI(AluOp::Lsr)),
        SarRI => ("sar", "!0r, #!1d", 3, REG_DEF0_USE0 | SETS_CCODES, OpKind::AluRI(AluOp::Asr)),
        RorRI => ("ror", "!0r, #!1d", 3, REG_DEF0_USE0 | SETS_CCODES, OpKind::AluRI(AluOp::Ror)),
        ImulRRI => (
            "imul",
            "!0r, !1r, #!2d",
            3,
            REG_DEF0_USE1 | SETS_CCODES,
            OpKind::AluRRI(AluOp::Mul)
        ),
        Neg => ("neg", "!0r", 2, REG_DEF0_USE0 | SETS_CCODES, OpKind::Unary(UnaryOp::Neg)),
        Not => ("not", "!0r", 2, REG_DEF0_USE0, OpKind::Unary(UnaryOp::Not)),
        CmpRR => ("cmp", "!0r, !1r", 2, REG_USE01 | SETS_CCODES, OpKind::Cmp),
        CmpRI => ("cmp", "!0r, #!1d", 3, REG_USE0 | SETS_CCODES, OpKind::CmpImm),
        Jcc => (
            "j!3c",
            "!0t",
            2,
            IS_BRANCH | USES_CCODES | NEEDS_FIXUP,
            OpKind::CondBranch(Cond::Al)
        ),
        Jmp => ("jmp", "!0t", 2, IS_BRANCH | NEEDS_FIXUP, OpKind::Branch),
        Call => ("call", "", 5, IS_CALL, OpKind::Call),
        Ret => ("ret", "", 1, IS_BRANCH | REG_USE_SP | REG_DEF_SP, OpKind::Return),
        Push => (
            "push",
            "{!0x}",
            1,
            REG_USE_LIST0 | REG_USE_SP | REG_DEF_SP | IS_STORE,
            OpKind::Push
        ),
        Pop => (
            "pop",
            "{!0x}",
            1,
            REG_DEF_LIST0 | REG_USE_SP | REG_DEF_SP | IS_LOAD,
            OpKind::Pop
        ),
        Load => ("mov", "!0r, [!1r + !2d]", 2, REG_DEF0_USE1 | IS_LOAD, OpKind::Load),
        Store => ("mov", "[!1r + !2d], !0r", 2, REG_USE01 | IS_STORE, OpKind::Store),
        LoadIdx => (
            "mov",
            "!0r, [!1r + !2r << !3d + !4d]",
            3,
            REG_DEF0 | REG_USE12 | IS_LOAD,
            OpKind::LoadIndexed
        ),
        StoreIdx => (
            "mov",
            "[!1r + !2r << !3d + !4d], !0r",
            3,
            REG_USE0 | REG_USE12 | IS_STORE,
            OpKind::StoreIndexed
        ),
        Cdq => ("cdq", "", 1, 0, OpKind::Cdq),
        Idiv => ("idiv", "!0r", 2, REG_USE0 | SETS_CCODES, OpKind::Idiv),
        Data => (".long", "!0x", 4, IS_DATA, OpKind::Data),
    }
}

static INFO: TargetInfo = TargetInfo {
    isa: InstructionSet::X86,
    sp: ESP,
    lr: INVALID_REG,
    pc: INVALID_REG,
    core_temps: &[EAX, ECX, EDX, EBX],
    fp_temps: &[],
    // EBP only doubles as the trace frame pointer, and traces promote nothing.
    promotable: &[ESI, EDI, EBP],
    args: &[EAX, ECX, EDX, EBX],
    rets: [EAX, EDX],
    method_reg: EAX,
    trace_fp: EBP,
    scratch: None,
    shift_count_reg: Some(ECX),
    mask_shift_count: false,
    inline_fp: false,
    inline_int_div: true,
    div_regs: Some((EAX, EDX)),
};

pub struct X86Target;

fn x86_cond(cond: Cond) -> u8 {
    match cond {
        Cond::Eq => 0x4,
        Cond::Ne => 0x5,
        Cond::Lt => 0xC,
        Cond::Ge => 0xD,
        Cond::Gt => 0xF,
        Cond::Le => 0xE,
        Cond::Cs => 0x3,
        Cond::Cc => 0x2,
        Cond::Hi => 0x7,
        Cond::Ls => 0x6,
        Cond::Mi => 0x8,
        Cond::Pl => 0x9,
        Cond::Al => 0xB,
    }
}

fn reg(value: i32) -> u8 {
    (value & 7) as u8
}

fn fits_i8(value: i32) -> bool {
    i8::try_from(value).is_ok()
}

fn modrm_reg(code: &mut Vec<u8>, reg_field: u8, rm: i32) {
    code.push(0xC0 | reg_field << 3 | reg(rm));
}

fn push_disp(code: &mut Vec<u8>, mode: u8, disp: i32) {
    match mode {
        1 => code.push(disp as i8 as u8),
        2 => code.extend_from_slice(&disp.to_le_bytes()),
        _ => {}
    }
}

fn disp_mode(base: i32, disp: i32) -> u8 {
    if disp == 0 && base != EBP {
        0
    } else if fits_i8(disp) {
        1
    } else {
        2
    }
}

/// `[base + disp]` operand; ESP needs a SIB byte and EBP cannot use the no-displacement form.
fn modrm_mem(code: &mut Vec<u8>, reg_field: u8, base: i32, disp: i32) {
    let mode = disp_mode(base, disp);
    if base == ESP {
        code.push(mode << 6 | reg_field << 3 | 0b100);
        code.push(0x24);
    } else {
        code.push(mode << 6 | reg_field << 3 | reg(base));
    }
    push_disp(code, mode, disp);
}

fn modrm_sib(code: &mut Vec<u8>, reg_field: u8, base: i32, index: i32, scale: i32, disp: i32) {
    let mode = disp_mode(base, disp);
    code.push(mode << 6 | reg_field << 3 | 0b100);
    code.push(((scale & 3) as u8) << 6 | reg(index) << 3 | reg(base));
    push_disp(code, mode, disp);
}

/// `op r/m32, imm` through the 0x83/0x81 group.
fn group1_imm(code: &mut Vec<u8>, digit: u8, rm: i32, imm: i32) {
    if fits_i8(imm) {
        code.push(0x83);
        modrm_reg(code, digit, rm);
        code.push(imm as i8 as u8);
    } else {
        code.push(0x81);
        modrm_reg(code, digit, rm);
        code.extend_from_slice(&imm.to_le_bytes());
    }
}

fn rel_branch(
    code: &mut Vec<u8>,
    short: &[u8],
    long: &[u8],
    ctx: &EncodeContext,
    long_form: bool,
) -> Result<(), EncodeError> {
    let target = ctx.target_offset.ok_or(EncodeError::OutOfRange)? as i64;
    let pc = ctx.pc as i64;
    if !long_form {
        let delta = target - (pc + short.len() as i64 + 1);
        let Ok(rel) = i8::try_from(delta) else {
            return Err(EncodeError::NeedsLongForm);
        };
        code.extend_from_slice(short);
        code.push(rel as u8);
        return Ok(());
    }
    let delta = target - (pc + long.len() as i64 + 4);
    let rel = i32::try_from(delta).map_err(|_| EncodeError::OutOfRange)?;
    code.extend_from_slice(long);
    code.extend_from_slice(&rel.to_le_bytes());
    Ok(())
}

fn rel32_from(from: u32, size: u32, to: u32) -> i32 {
    to.wrapping_sub(from.wrapping_add(size)) as i32
}

impl X86Target {
    fn op(&self, cu: &mut CompilationUnit<'_>, op: X86Op, values: &[i32]) -> LirId {
        emit(cu, self, op as u16, operands(values))
    }

    fn copy_if_needed(&self, cu: &mut CompilationUnit<'_>, rd: i32, rs: i32) {
        if rd != rs {
            self.op(cu, X86Op::MovRR, &[rd, rs]);
        }
    }

    fn cond_branch(&self, cu: &mut CompilationUnit<'_>, cond: Cond) -> LirId {
        if cond == Cond::Al {
            return self.op(cu, X86Op::Jmp, &[]);
        }
        self.op(cu, X86Op::Jcc, &[0, 0, 0, cond.to_operand()])
    }

    fn label(&self, cu: &mut CompilationUnit<'_>, branch: LirId) {
        let label = emit_pseudo(cu, PseudoOp::TargetLabel, 0);
        cu.lirs.get_mut(branch).target = Some(label);
    }

    fn rr_op(op: AluOp) -> X86Op {
        match op {
            AluOp::Add => X86Op::AddRR,
            AluOp::Adds => X86Op::AddsRR,
            AluOp::Adc => X86Op::AdcRR,
            AluOp::Sub => X86Op::SubRR,
            AluOp::Subs => X86Op::SubsRR,
            AluOp::Sbc => X86Op::SbbRR,
            AluOp::Mul => X86Op::ImulRR,
            AluOp::And => X86Op::AndRR,
            AluOp::Or | AluOp::Nor => X86Op::OrRR,
            AluOp::Xor => X86Op::XorRR,
            AluOp::Lsl => X86Op::ShlRC,
            AluOp::Lsr => X86Op::ShrRC,
            AluOp::Asr => X86Op::SarRC,
            AluOp::Ror => X86Op::RorRC,
            AluOp::Rsub => X86Op::SubRR,
        }
    }

    fn ri_op(op: AluOp) -> Option<X86Op> {
        Some(match op {
            AluOp::Add => X86Op::AddRI,
            AluOp::Adds => X86Op::AddsRI,
            AluOp::Adc => X86Op::AdcRI,
            AluOp::Sub => X86Op::SubRI,
            AluOp::Subs => X86Op::SubsRI,
            AluOp::Sbc => X86Op::SbbRI,
            AluOp::And => X86Op::AndRI,
            AluOp::Or => X86Op::OrRI,
            AluOp::Xor => X86Op::XorRI,
            AluOp::Lsl => X86Op::ShlRI,
            AluOp::Lsr => X86Op::ShrRI,
            AluOp::Asr => X86Op::SarRI,
            AluOp::Ror => X86Op::RorRI,
            AluOp::Mul | AluOp::Rsub | AluOp::Nor => return None,
        })
    }

    fn encode_op(&self, op: X86Op, lir: &Lir, ctx: &EncodeContext) -> Result<Vec<u8>, EncodeError> {
        let [a, b, c, d, e] = lir.operands;
        let mut code = Vec::with_capacity(6);
        match op {
            X86Op::Nop => code.push(0x90),
            X86Op::MovRR => {
                code.push(0x89);
                modrm_reg(&mut code, reg(b), a);
            }
            X86Op::MovRI => {
                code.push(0xB8 + reg(a));
                code.extend_from_slice(&b.to_le_bytes());
            }
            X86Op::AddRR
            | X86Op::AddsRR
            | X86Op::AdcRR
            | X86Op::SubRR
            | X86Op::SubsRR
            | X86Op::SbbRR
            | X86Op::AndRR
            | X86Op::OrRR
            | X86Op::XorRR
            | X86Op::CmpRR => {
                let opcode = match op {
                    X86Op::AddRR | X86Op::AddsRR => 0x01,
                    X86Op::OrRR => 0x09,
                    X86Op::AdcRR => 0x11,
                    X86Op::SbbRR => 0x19,
                    X86Op::AndRR => 0x21,
                    X86Op::SubRR | X86Op::SubsRR => 0x29,
                    X86Op::XorRR => 0x31,
                    _ => 0x39,
                };
                code.push(opcode);
                modrm_reg(&mut code, reg(b), a);
            }
            X86Op::ImulRR => {
                code.extend_from_slice(&[0x0F, 0xAF]);
                modrm_reg(&mut code, reg(a), b);
            }
            X86Op::ShlRC | X86Op::ShrRC | X86Op::SarRC | X86Op::RorRC => {
                if b != ECX {
                    return Err(EncodeError::OutOfRange);
                }
                let digit = match op {
                    X86Op::ShlRC => 4,
                    X86Op::ShrRC => 5,
                    X86Op::SarRC => 7,
                    _ => 1,
                };
                code.push(0xD3);
                modrm_reg(&mut code, digit, a);
            }
            X86Op::AddRI
            | X86Op::AddsRI
            | X86Op::AdcRI
            | X86Op::SubRI
            | X86Op::SubsRI
            | X86Op::SbbRI
            | X86Op::AndRI
            | X86Op::OrRI
            | X86Op::XorRI
            | X86Op::CmpRI => {
                let digit = match op {
                    X86Op::AddRI | X86Op::AddsRI => 0,
                    X86Op::OrRI => 1,
                    X86Op::AdcRI => 2,
                    X86Op::SbbRI => 3,
                    X86Op::AndRI => 4,
                    X86Op::SubRI | X86Op::SubsRI => 5,
                    X86Op::XorRI => 6,
                    _ => 7,
                };
                group1_imm(&mut code, digit, a, b);
            }
            X86Op::ShlRI | X86Op::ShrRI | X86Op::SarRI | X86Op::RorRI => {
                let digit = match op {
                    X86Op::ShlRI => 4,
                    X86Op::ShrRI => 5,
                    X86Op::SarRI => 7,
                    _ => 1,
                };
                code.push(0xC1);
                modrm_reg(&mut code, digit, a);
                code.push((b & 31) as u8);
            }
            X86Op::ImulRRI => {
                if fits_i8(c) {
                    code.push(0x6B);
                    modrm_reg(&mut code, reg(a), b);
                    code.push(c as i8 as u8);
                } else {
                    code.push(0x69);
                    modrm_reg(&mut code, reg(a), b);
                    code.extend_from_slice(&c.to_le_bytes());
                }
            }
            X86Op::Neg | X86Op::Not => {
                code.push(0xF7);
                modrm_reg(&mut code, if op == X86Op::Neg { 3 } else { 2 }, a);
            }
            X86Op::Jcc => {
                let cc = x86_cond(Cond::from_operand(d));
                rel_branch(&mut code, &[0x70 + cc], &[0x0F, 0x80 + cc], ctx, lir.long_form)?;
            }
            X86Op::Jmp => rel_branch(&mut code, &[0xEB], &[0xE9], ctx, lir.long_form)?,
            X86Op::Call => {
                let target = lir.call_target.ok_or(EncodeError::OutOfRange)?;
                code.push(0xE8);
                let rel = rel32_from(ctx.code_begin.wrapping_add(ctx.pc), 5, target);
                code.extend_from_slice(&rel.to_le_bytes());
            }
            X86Op::Ret => code.push(0xC3),
            X86Op::Push | X86Op::Pop => {
                let mask = a as u32;
                if mask.count_ones() != 1 || mask > 0xff {
                    return Err(EncodeError::OutOfRange);
                }
                let base = if op == X86Op::Push { 0x50 } else { 0x58 };
                code.push(base + mask.trailing_zeros() as u8);
            }
            X86Op::Load => {
                code.push(0x8B);
                modrm_mem(&mut code, reg(a), b, c);
            }
            X86Op::Store => {
                code.push(0x89);
                modrm_mem(&mut code, reg(a), b, c);
            }
            X86Op::LoadIdx => {
                code.push(0x8B);
                modrm_sib(&mut code, reg(a), b, c, d, e);
            }
            X86Op::StoreIdx => {
                code.push(0x89);
                modrm_sib(&mut code, reg(a), b, c, d, e);
            }
            X86Op::Cdq => code.push(0x99),
            X86Op::Idiv => {
                code.push(0xF7);
                modrm_reg(&mut code, 7, a);
            }
            X86Op::Data => code.extend_from_slice(&a.to_le_bytes()),
        }
        Ok(code)
    }

    fn stack_adjust(frame_size: u32, spill_mask: u32) -> i32 {
        frame_size as i32 - 4 * spill_mask.count_ones() as i32
    }
}

impl CodegenTarget for X86Target {
    fn info(&self) -> &'static TargetInfo {
        &INFO
    }

    fn encoding(&self, opcode: u16) -> &'static EncodingInfo {
        ENCODINGS
            .get(opcode as usize)
            .unwrap_or(&ENCODINGS[X86Op::Nop as usize])
    }

    fn lir_size(&self, lir: &Lir) -> u8 {
        let Some(op) = lir.target_opcode().and_then(X86Op::from_u16) else {
            return 0;
        };
        match op {
            X86Op::Jcc if lir.long_form => 6,
            X86Op::Jmp if lir.long_form => 5,
            X86Op::Jcc | X86Op::Jmp | X86Op::Call => ENCODINGS[op as usize].size,
            _ => {
                let probe = EncodeContext {
                    code_begin: 0,
                    pc: 0,
                    target_offset: None,
                    literal_offset: None,
                };
                self.encode_op(op, lir, &probe)
                    .map(|code| code.len() as u8)
                    .unwrap_or(ENCODINGS[op as usize].size)
            }
        }
    }

    fn encode(&self, lir: &Lir, ctx: &EncodeContext) -> Result<Vec<u8>, EncodeError> {
        let op = lir
            .target_opcode()
            .and_then(X86Op::from_u16)
            .ok_or(EncodeError::OutOfRange)?;
        self.encode_op(op, lir, ctx)
    }

    fn chain_patch(&self, from: u32, to: u32) -> Option<Vec<u8>> {
        let mut code = vec![0xE9];
        code.extend_from_slice(&rel32_from(from, 5, to).to_le_bytes());
        Some(code)
    }

    fn op_reg_copy(&self, cu: &mut CompilationUnit<'_>, rd: i32, rs: i32) -> LirId {
        self.op(cu, X86Op::MovRR, &[rd, rs])
    }

    fn load_constant(&self, cu: &mut CompilationUnit<'_>, rd: i32, value: i32) -> CompileResult<()> {
        self.op(cu, X86Op::MovRI, &[rd, value]);
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
        match op {
            AluOp::Rsub => {
                // rd = rt - rs
                if rd == rs {
                    self.op(cu, X86Op::Neg, &[rd, rd]);
                    self.op(cu, X86Op::AddRR, &[rd, rt]);
                } else {
                    self.copy_if_needed(cu, rd, rt);
                    self.op(cu, X86Op::SubRR, &[rd, rs]);
                }
                return Ok(());
            }
            AluOp::Sub if rd == rt && rd != rs => {
                self.op(cu, X86Op::Neg, &[rd, rd]);
                self.op(cu, X86Op::AddRR, &[rd, rs]);
                return Ok(());
            }
            AluOp::Add | AluOp::Mul | AluOp::And | AluOp::Or | AluOp::Xor
                if rd == rt && rd != rs =>
            {
                self.op(cu, Self::rr_op(op), &[rd, rs]);
                return Ok(());
            }
            _ => {}
        }
        if rd == rt && rd != rs {
            return Err(CompileAbort::Internal(format!(
                "{op:?} into its own second operand on x86"
            )));
        }
        self.copy_if_needed(cu, rd, rs);
        self.op(cu, Self::rr_op(op), &[rd, rt]);
        if op == AluOp::Nor {
            self.op(cu, X86Op::Not, &[rd, rd]);
        }
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
            AluOp::Mul => {
                self.op(cu, X86Op::ImulRRI, &[rd, rs, imm]);
            }
            AluOp::Rsub => {
                self.copy_if_needed(cu, rd, rs);
                self.op(cu, X86Op::Neg, &[rd, rd]);
                if imm != 0 {
                    self.op(cu, X86Op::AddRI, &[rd, imm]);
                }
            }
            AluOp::Nor => {
                self.copy_if_needed(cu, rd, rs);
                self.op(cu, X86Op::OrRI, &[rd, imm]);
                self.op(cu, X86Op::Not, &[rd, rd]);
            }
            AluOp::Lsl | AluOp::Lsr | AluOp::Asr | AluOp::Ror if imm & 31 == 0 => {
                self.copy_if_needed(cu, rd, rs);
            }
            _ => {
                let ri = Self::ri_op(op).ok_or_else(|| {
                    CompileAbort::Internal(format!("no immediate form of {op:?} on x86"))
                })?;
                self.copy_if_needed(cu, rd, rs);
                let imm = if matches!(op, AluOp::Lsl | AluOp::Lsr | AluOp::Asr | AluOp::Ror) {
                    imm & 31
                } else {
                    imm
                };
                self.op(cu, ri, &[rd, imm]);
            }
        }
        Ok(())
    }

    fn op_unary(
        &self,
        cu: &mut CompilationUnit<'_>,
        op: UnaryOp,
        rd: i32,
        rs: i32,
    ) -> CompileResult<()> {
        self.copy_if_needed(cu, rd, rs);
        let x86 = match op {
            UnaryOp::Neg => X86Op::Neg,
            UnaryOp::Not => X86Op::Not,
        };
        self.op(cu, x86, &[rd, rd]);
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
        let mut lir = Lir::new(
            LirOp::Target(X86Op::Load as u16),
            cu.current_dalvik_offset,
            operands(&[rd, base, disp]),
        );
        lir.alias = alias;
        Ok(emit_lir(cu, self, lir))
    }

    fn store_base_disp(
        &self,
        cu: &mut CompilationUnit<'_>,
        rs: i32,
        base: i32,
        disp: i32,
        alias: Option<AliasInfo>,
    ) -> CompileResult<LirId> {
        let mut lir = Lir::new(
            LirOp::Target(X86Op::Store as u16),
            cu.current_dalvik_offset,
            operands(&[rs, base, disp]),
        );
        lir.alias = alias;
        Ok(emit_lir(cu, self, lir))
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
        self.op(cu, X86Op::LoadIdx, &[rd, base, index, scale, disp]);
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
        self.op(cu, X86Op::StoreIdx, &[rs, base, index, scale, disp]);
        Ok(())
    }

    fn op_cmp_branch(
        &self,
        cu: &mut CompilationUnit<'_>,
        cond: Cond,
        rs: i32,
        rt: i32,
    ) -> CompileResult<LirId> {
        self.op(cu, X86Op::CmpRR, &[rs, rt]);
        Ok(self.cond_branch(cu, cond))
    }

    fn op_cmp_imm_branch(
        &self,
        cu: &mut CompilationUnit<'_>,
        cond: Cond,
        rs: i32,
        imm: i32,
    ) -> CompileResult<LirId> {
        self.op(cu, X86Op::CmpRI, &[rs, imm]);
        Ok(self.cond_branch(cu, cond))
    }

    fn op_branch(&self, cu: &mut CompilationUnit<'_>) -> LirId {
        self.op(cu, X86Op::Jmp, &[])
    }

    fn call_direct(&self, cu: &mut CompilationUnit<'_>, target: u32) -> LirId {
        let mut lir = Lir::new(
            LirOp::Target(X86Op::Call as u16),
            cu.current_dalvik_offset,
            [0; 5],
        );
        lir.call_target = Some(target);
        emit_lir(cu, self, lir)
    }

    fn emit_data_word(&self, cu: &mut CompilationUnit<'_>, value: u32) -> LirId {
        self.op(cu, X86Op::Data, &[value as i32])
    }

    fn gen_prologue(&self, cu: &mut CompilationUnit<'_>) -> CompileResult<()> {
        let frame = cu.frame;
        // The return address is already on the stack; push the rest top down.
        for reg in (0..x86::NUM_CPU_REGISTERS as i32).rev() {
            if frame.core_spill_mask & (1 << reg) != 0 {
                self.op(cu, X86Op::Push, &[1 << reg]);
            }
        }
        let adjust = Self::stack_adjust(frame.frame_size, frame.core_spill_mask);
        if adjust != 0 {
            self.op(cu, X86Op::SubRI, &[ESP, adjust]);
        }
        self.store_base_disp(cu, INFO.method_reg, ESP, 0, None)?;
        Ok(())
    }

    fn gen_epilogue(&self, cu: &mut CompilationUnit<'_>) -> CompileResult<()> {
        let frame = cu.frame;
        let adjust = Self::stack_adjust(frame.frame_size, frame.core_spill_mask);
        if adjust != 0 {
            self.op(cu, X86Op::AddRI, &[ESP, adjust]);
        }
        for reg in 0..x86::NUM_CPU_REGISTERS as i32 {
            if frame.core_spill_mask & (1 << reg) != 0 {
                self.op(cu, X86Op::Pop, &[1 << reg]);
            }
        }
        self.op(cu, X86Op::Ret, &[]);
        Ok(())
    }

    fn gen_div_rem(
        &self,
        cu: &mut CompilationUnit<'_>,
        dividend: i32,
        divisor: i32,
        is_div: bool,
    ) -> CompileResult<i32> {
        if dividend != EAX || divisor == EAX || divisor == EDX {
            return Err(CompileAbort::Internal(
                "x86 division needs the dividend in eax and the divisor elsewhere".into(),
            ));
        }
        // idiv faults on INT_MIN / -1; the quotient is -dividend and the remainder 0.
        self.op(cu, X86Op::CmpRI, &[divisor, -1]);
        let divide = self.cond_branch(cu, Cond::Ne);
        if is_div {
            self.op(cu, X86Op::Neg, &[EAX, EAX]);
        } else {
            self.op(cu, X86Op::MovRI, &[EDX, 0]);
        }
        let done = self.op(cu, X86Op::Jmp, &[]);
        self.label(cu, divide);
        self.op(cu, X86Op::Cdq, &[]);
        self.op(cu, X86Op::Idiv, &[divisor]);
        self.label(cu, done);
        Ok(if is_div { EAX } else { EDX })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bytes(op: X86Op, values: &[i32]) -> Vec<u8> {
        let lir = Lir::new(LirOp::Target(op as u16), 0, operands(values));
        let ctx = EncodeContext {
            code_begin: 0x1000,
            pc: 0,
            target_offset: None,
            literal_offset: None,
        };
        X86Target.encode(&lir, &ctx).expect("encodes")
    }

    #[test]
    fn encodes_register_and_immediate_forms() {
        assert_eq!(bytes(X86Op::MovRR, &[EAX, ECX]), [0x89, 0xC8]);
        assert_eq!(bytes(X86Op::MovRI, &[EBX, 1]), [0xBB, 1, 0, 0, 0]);
        assert_eq!(bytes(X86Op::AddRR, &[EDX, EBX]), [0x01, 0xDA]);
        assert_eq!(bytes(X86Op::AddRI, &[EAX, 4]), [0x83, 0xC0, 0x04]);
        assert_eq!(
            bytes(X86Op::XorRI, &[ECX, i32::MIN]),
            [0x81, 0xF1, 0x00, 0x00, 0x00, 0x80]
        );
        assert_eq!(bytes(X86Op::ImulRR, &[EAX, ECX]), [0x0F, 0xAF, 0xC1]);
        assert_eq!(bytes(X86Op::ShlRC, &[EDX, ECX]), [0xD3, 0xE2]);
        assert_eq!(bytes(X86Op::Cdq, &[]), [0x99]);
        assert_eq!(bytes(X86Op::Idiv, &[EBX]), [0xF7, 0xFB]);
        assert_eq!(bytes(X86Op::Push, &[1 << EBP]), [0x55]);
        assert_eq!(bytes(X86Op::Pop, &[1 << EDI]), [0x5F]);
    }

    #[test]
    fn memory_operands_special_case_esp_and_ebp() {
        assert_eq!(bytes(X86Op::Load, &[EAX, ESP, 8]), [0x8B, 0x44, 0x24, 0x08]);
        assert_eq!(bytes(X86Op::Store, &[EAX, ESP, 0]), [0x89, 0x04, 0x24]);
        assert_eq!(bytes(X86Op::Load, &[ECX, EBP, 0]), [0x8B, 0x4D, 0x00]);
        assert_eq!(
            bytes(X86Op::Load, &[EDX, ESI, 0x200]),
            [0x8B, 0x96, 0x00, 0x02, 0x00, 0x00]
        );
        assert_eq!(
            bytes(X86Op::LoadIdx, &[EAX, EBX, ECX, 2, 12]),
            [0x8B, 0x44, 0x8B, 0x0C]
        );
    }

    #[test]
    fn sizes_track_operand_forms() {
        let short = Lir::new(LirOp::Target(X86Op::AddRI as u16), 0, operands(&[EAX, 4]));
        let long = Lir::new(LirOp::Target(X86Op::AddRI as u16), 0, operands(&[EAX, 400]));
        assert_eq!(X86Target.lir_size(&short), 3);
        assert_eq!(X86Target.lir_size(&long), 6);
        let mut jump = Lir::new(LirOp::Target(X86Op::Jcc as u16), 0, [0; 5]);
        assert_eq!(X86Target.lir_size(&jump), 2);
        jump.long_form = true;
        assert_eq!(X86Target.lir_size(&jump), 6);
    }

    #[test]
    fn branches_are_relative_to_the_next_instruction() {
        let mut lir = Lir::new(
            LirOp::Target(X86Op::Jcc as u16),
            0,
            operands(&[0, 0, 0, Cond::Lt.to_operand()]),
        );
        let ctx = EncodeContext {
            code_begin: 0,
            pc: 0x10,
            target_offset: Some(0x20),
            literal_offset: None,
        };
        assert_eq!(X86Target.encode(&lir, &ctx), Ok(vec![0x7C, 0x0E]));
        let far = EncodeContext {
            target_offset: Some(0x400),
            ..ctx
        };
        assert_eq!(X86Target.encode(&lir, &far), Err(EncodeError::NeedsLongForm));
        lir.long_form = true;
        assert_eq!(
            X86Target.encode(&lir, &far),
            Ok(vec![0x0F, 0x8C, 0xEA, 0x03, 0x00, 0x00])
        );
        assert_eq!(
            X86Target.chain_patch(0x1000, 0x1100),
            Some(vec![0xE9, 0xFB, 0x00, 0x00, 0x00])
        );
    }
}
