//! MIR to LIR.
//!
//! Values are written through to their frame home on every store, so a register cache entry
//! can be dropped at any point. A store made dead by a later store to the same vreg before any
//! load, branch or call is turned into a nop.

use crate::address_space::{INTERPRETER_EXIT_PC, SINGLE_STEP_PC};
use crate::bytecode::{Format, Opcode};
use crate::compiler::codegen::{CodegenTarget, emit_pseudo, scratch_temp};
use crate::compiler::dataflow::wide_overlaps_by_one_slot;
use crate::compiler::lir::{AliasInfo, AluOp, CellKind, Cond, FpOp, LirId, PseudoOp, UnaryOp};
use crate::compiler::mir::{self, BlockId, BlockKind, MIR_IGNORE_NULL_CHECK, Mir, Support};
use crate::compiler::ralloc::{
    Location, RegLocation, eval_loc, get_dest, get_dest_wide, get_src, get_src_wide, update_loc,
};
use crate::compiler::templates::Template;
use crate::compiler::{CompilationUnit, CompileAbort, CompileResult, FixupTarget};
use crate::decoder;
use crate::heap::{ARRAY_DATA_OFFSET, ARRAY_LENGTH_OFFSET, class_word};
use crate::stack::frame_layout::vreg_offset;

/// Lowers every block of `cu`, then the re-entry cells and literal pools.
pub fn gen_code(cu: &mut CompilationUnit<'_>, target: &dyn CodegenTarget) -> CompileResult<()> {
    for block_id in 0..cu.blocks.len() {
        let block = cu.blocks.get(block_id);
        cu.current_dalvik_offset = block.start_offset;
        match block.kind {
            BlockKind::Entry => {
                let label = emit_pseudo(cu, PseudoOp::EntryBlock, block.start_offset as i32);
                cu.blocks.get_mut(block_id).label = Some(label);
                if cu.is_method() {
                    target.gen_prologue(cu)?;
                    load_promoted_ins(cu, target)?;
                }
            }
            BlockKind::DalvikByteCode => gen_block(cu, target, block_id)?,
            BlockKind::Exit => {
                let label = emit_pseudo(cu, PseudoOp::ExitBlock, 0);
                cu.blocks.get_mut(block_id).label = Some(label);
            }
            kind => {
                if let Some(cell) = kind.cell_kind() {
                    gen_chaining_cell(cu, target, block_id, cell);
                }
            }
        }
    }
    gen_pc_reconstruction_cells(cu, target);
    resolve_fixups(cu)?;
    emit_literal_pools(cu, target);
    Ok(())
}

fn gen_block(
    cu: &mut CompilationUnit<'_>,
    target: &dyn CodegenTarget,
    block_id: BlockId,
) -> CompileResult<()> {
    let label = emit_pseudo(cu, PseudoOp::BlockLabel, block_id as i32);
    cu.blocks.get_mut(block_id).label = Some(label);
    cu.reg_pool.clobber_all();
    cu.reg_pool.reset_def_tracking();

    let mirs = mir::block_mirs(cu, block_id);
    let mut continues = true;
    for &index in &mirs {
        let mir = cu.mirs.get(index);
        cu.current_dalvik_offset = mir.offset;
        emit_pseudo(cu, PseudoOp::DalvikBoundary, mir.offset as i32);
        cu.reg_pool.reset_reg_pool();
        let support = if wide_overlaps_by_one_slot(&mir) {
            Support::Punt
        } else {
            mir::support(mir.insn.opcode, cu.mode)
        };
        match support {
            Support::Inline => gen_mir(cu, target, &mir)?,
            Support::Punt => gen_punt(cu, target, mir.offset),
            Support::Unsupported => {
                return Err(CompileAbort::UnsupportedOpcode {
                    dex_pc: mir.offset,
                    opcode: mir.insn.opcode,
                });
            }
        }
        continues = mir.insn.opcode.can_continue();
    }

    let block = cu.blocks.get(block_id);
    if let Some(next) = block.fall_through {
        if continues && next != block_id + 1 {
            cu.reg_pool.reset_def_tracking();
            let branch = target.op_branch(cu);
            cu.add_fixup(branch, FixupTarget::Block(next));
        }
    }
    Ok(())
}

fn load_promoted_ins(cu: &mut CompilationUnit<'_>, target: &dyn CodegenTarget) -> CompileResult<()> {
    for vreg in cu.num_locals..cu.num_regs {
        if let Some(reg) = cu.promoted_reg(vreg as i32) {
            load_home(cu, target, reg, vreg as i32)?;
        }
    }
    Ok(())
}

fn gen_chaining_cell(
    cu: &mut CompilationUnit<'_>,
    target: &dyn CodegenTarget,
    block_id: BlockId,
    kind: CellKind,
) {
    let dex_pc = cu.blocks.get(block_id).start_offset;
    cu.current_dalvik_offset = dex_pc;
    let label = emit_pseudo(cu, PseudoOp::ChainingCell(kind), dex_pc as i32);
    cu.blocks.get_mut(block_id).label = Some(label);
    target.call_direct(cu, INTERPRETER_EXIT_PC);
    emit_pseudo(cu, PseudoOp::Safepoint, dex_pc as i32);
    target.emit_data_word(cu, dex_pc);
}

fn gen_pc_reconstruction_cells(cu: &mut CompilationUnit<'_>, target: &dyn CodegenTarget) {
    for index in 0..cu.pc_reconstruction.len() {
        let dex_pc = cu.pc_reconstruction.get(index);
        cu.current_dalvik_offset = dex_pc;
        let label = emit_pseudo(cu, PseudoOp::PcReconstructionCell, dex_pc as i32);
        cu.pcr_labels.set(index, Some(label));
        target.call_direct(cu, INTERPRETER_EXIT_PC);
        emit_pseudo(cu, PseudoOp::Safepoint, dex_pc as i32);
        target.emit_data_word(cu, dex_pc);
    }
}

fn resolve_fixups(cu: &mut CompilationUnit<'_>) -> CompileResult<()> {
    let fixups: Vec<_> = cu.fixups.iter().collect();
    for fixup in fixups {
        let label = match fixup.target {
            FixupTarget::Block(id) => cu.blocks.get(id).label,
            FixupTarget::PcReconstruction(index) => cu.pcr_labels.get(index),
        };
        let label = label.ok_or_else(|| {
            CompileAbort::Internal(format!("no label for branch target {:?}", fixup.target))
        })?;
        cu.lirs.get_mut(fixup.branch).target = Some(label);
    }
    Ok(())
}

fn emit_literal_pools(cu: &mut CompilationUnit<'_>, target: &dyn CodegenTarget) {
    if cu.literals.is_empty() && cu.class_literals.is_empty() {
        return;
    }
    emit_pseudo(cu, PseudoOp::Align4, 0);
    for index in 0..cu.literals.len() {
        let value = cu.literals.get(index).value;
        let lir = target.emit_data_word(cu, value);
        cu.literals.get_mut(index).lir = Some(lir);
    }
    for index in 0..cu.class_literals.len() {
        let value = cu.class_literals.get(index).value;
        let lir = target.emit_data_word(cu, value);
        cu.class_literals.get_mut(index).lir = Some(lir);
    }
}

/// Hands one instruction to the interpreter and resumes after the dex pc word.
fn gen_punt(cu: &mut CompilationUnit<'_>, target: &dyn CodegenTarget, dex_pc: u32) {
    cu.reg_pool.flush_all();
    cu.reg_pool.reset_def_tracking();
    cu.reg_pool.clobber_all();
    target.call_direct(cu, SINGLE_STEP_PC);
    emit_pseudo(cu, PseudoOp::Safepoint, dex_pc as i32);
    target.emit_data_word(cu, dex_pc);
    cu.punts += 1;
}

// Frame homes.

fn frame_home(cu: &CompilationUnit<'_>, target: &dyn CodegenTarget, vreg: i32) -> (i32, i32) {
    let info = target.info();
    if cu.is_method() {
        (info.sp, vreg_offset(&cu.frame, cu.num_locals, vreg))
    } else {
        (info.trace_fp, 4 * vreg)
    }
}

fn load_home(
    cu: &mut CompilationUnit<'_>,
    target: &dyn CodegenTarget,
    reg: i32,
    vreg: i32,
) -> CompileResult<LirId> {
    let (base, disp) = frame_home(cu, target, vreg);
    cu.reg_pool.note_vreg_load(vreg);
    let alias = AliasInfo {
        vreg,
        is_load: true,
        wide: false,
    };
    target.load_base_disp(cu, reg, base, disp, Some(alias))
}

fn store_home(
    cu: &mut CompilationUnit<'_>,
    target: &dyn CodegenTarget,
    reg: i32,
    vreg: i32,
) -> CompileResult<()> {
    let (base, disp) = frame_home(cu, target, vreg);
    let alias = AliasInfo {
        vreg,
        is_load: false,
        wide: false,
    };
    let store = target.store_base_disp(cu, reg, base, disp, Some(alias))?;
    if let Some(dead) = cu.reg_pool.note_vreg_store(vreg, store) {
        cu.lirs.get_mut(dead).is_nop = true;
    }
    Ok(())
}

// Value movement.

fn out_of_temps(cu: &CompilationUnit<'_>) -> CompileAbort {
    CompileAbort::OutOfTemps {
        dex_pc: cu.current_dalvik_offset,
    }
}

/// Register holding the narrow value `loc`, loading it if no register caches it.
fn load_value(
    cu: &mut CompilationUnit<'_>,
    target: &dyn CodegenTarget,
    loc: RegLocation,
) -> CompileResult<i32> {
    let loc = update_loc(cu, loc);
    if loc.location == Location::PhysReg {
        cu.reg_pool.mark_in_use(loc.low_reg);
        return Ok(loc.low_reg);
    }
    let reg = if loc.fp {
        cu.reg_pool.alloc_temp_float()
    } else {
        cu.reg_pool.alloc_temp()
    };
    let reg = reg.ok_or_else(|| out_of_temps(cu))?;
    load_home(cu, target, reg, loc.vreg)?;
    cu.reg_pool.mark_live(reg, loc.s_reg_low);
    Ok(reg)
}

/// Loads a wide value into a fresh pair; wide values are never cached.
fn load_value_wide(
    cu: &mut CompilationUnit<'_>,
    target: &dyn CodegenTarget,
    loc: RegLocation,
) -> CompileResult<(i32, i32)> {
    let pair = cu
        .reg_pool
        .alloc_typed_temp_pair(false)
        .ok_or_else(|| out_of_temps(cu))?;
    let (low, high) = (pair & 0xff, (pair >> 8) & 0xff);
    load_home(cu, target, low, loc.vreg)?;
    load_home(cu, target, high, loc.vreg + 1)?;
    Ok((low, high))
}

/// Puts the narrow value `loc` into the fixed register `reg`.
fn load_value_direct_fixed(
    cu: &mut CompilationUnit<'_>,
    target: &dyn CodegenTarget,
    loc: RegLocation,
    reg: i32,
) -> CompileResult<()> {
    let loc = update_loc(cu, loc);
    if loc.location == Location::PhysReg {
        if loc.low_reg != reg {
            target.op_reg_copy(cu, reg, loc.low_reg);
        }
        return Ok(());
    }
    load_home(cu, target, reg, loc.vreg)?;
    Ok(())
}

fn store_value(
    cu: &mut CompilationUnit<'_>,
    target: &dyn CodegenTarget,
    dest: RegLocation,
    reg: i32,
) -> CompileResult<()> {
    if let Some(promoted) = cu.promoted_reg(dest.vreg) {
        if promoted != reg {
            target.op_reg_copy(cu, promoted, reg);
        }
        cu.reg_pool.clobber_sreg(dest.s_reg_low);
        return Ok(());
    }
    store_home(cu, target, reg, dest.vreg)?;
    if cu.reg_pool.is_temp(reg) {
        cu.reg_pool.mark_live(reg, dest.s_reg_low);
    } else {
        cu.reg_pool.clobber_sreg(dest.s_reg_low);
    }
    Ok(())
}

fn store_value_wide(
    cu: &mut CompilationUnit<'_>,
    target: &dyn CodegenTarget,
    dest: RegLocation,
    low: i32,
    high: i32,
) -> CompileResult<()> {
    cu.reg_pool.clobber_sreg(dest.s_reg_low);
    cu.reg_pool.clobber_sreg(dest.s_reg_high());
    store_home(cu, target, low, dest.vreg)?;
    store_home(cu, target, high, dest.vreg + 1)
}

/// Register to compute a narrow result into: the promoted register or a fresh temp.
fn dest_reg(cu: &mut CompilationUnit<'_>, dest: RegLocation) -> CompileResult<i32> {
    Ok(eval_loc(cu, dest)?.low_reg)
}

fn dest_pair(cu: &mut CompilationUnit<'_>) -> CompileResult<(i32, i32)> {
    let pair = cu
        .reg_pool
        .alloc_typed_temp_pair(false)
        .ok_or_else(|| out_of_temps(cu))?;
    Ok((pair & 0xff, (pair >> 8) & 0xff))
}

fn as_fp(mut loc: RegLocation) -> RegLocation {
    loc.fp = true;
    loc
}

// Checks. Every check leaves through a re-entry cell that resumes the interpreter at the
// faulting instruction, which then raises the exception itself.

fn branch_to_pcr(cu: &mut CompilationUnit<'_>, branch: LirId) {
    let cell = cu.pc_reconstruction_cell(cu.current_dalvik_offset);
    cu.add_fixup(branch, FixupTarget::PcReconstruction(cell));
}

fn gen_null_check(
    cu: &mut CompilationUnit<'_>,
    target: &dyn CodegenTarget,
    mir: &Mir,
    loc: RegLocation,
    reg: i32,
) -> CompileResult<()> {
    if mir.optimization_flags & MIR_IGNORE_NULL_CHECK != 0 {
        return Ok(());
    }
    let s_reg = loc.s_reg_low;
    if s_reg >= 0 && cu.null_checked.is_bit_set(s_reg as usize) {
        return Ok(());
    }
    cu.reg_pool.reset_def_tracking();
    let branch = target.op_cmp_imm_branch(cu, Cond::Eq, reg, 0)?;
    branch_to_pcr(cu, branch);
    if s_reg >= 0 {
        cu.null_checked.set_bit(s_reg as usize);
    }
    Ok(())
}

fn gen_bounds_check(
    cu: &mut CompilationUnit<'_>,
    target: &dyn CodegenTarget,
    array: i32,
    index: i32,
) -> CompileResult<()> {
    let length = scratch_temp(cu)?;
    target.load_base_disp(cu, length, array, ARRAY_LENGTH_OFFSET as i32, None)?;
    cu.reg_pool.reset_def_tracking();
    let branch = target.op_cmp_branch(cu, Cond::Cs, index, length)?;
    branch_to_pcr(cu, branch);
    cu.reg_pool.free_temp(length);
    Ok(())
}

// Template calls.

#[derive(Clone, Copy, Debug)]
enum TemplateArg {
    Value(RegLocation),
    Constant(i32),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ZeroCheck {
    None,
    /// The second argument word.
    Narrow,
    /// Argument words two and three.
    Wide,
}

fn gen_template_call(
    cu: &mut CompilationUnit<'_>,
    target: &dyn CodegenTarget,
    template: Template,
    args: &[TemplateArg],
    dest: RegLocation,
    zero_check: ZeroCheck,
) -> CompileResult<()> {
    let info = target.info();
    cu.reg_pool.flush_all();
    cu.reg_pool.reset_def_tracking();
    cu.reg_pool.clobber_all();
    for &reg in info.args {
        cu.reg_pool.lock_temp(reg);
    }

    let mut slot = 0;
    for arg in args {
        match *arg {
            TemplateArg::Value(loc) if loc.wide => {
                load_home(cu, target, info.args[slot], loc.vreg)?;
                load_home(cu, target, info.args[slot + 1], loc.vreg + 1)?;
                slot += 2;
            }
            TemplateArg::Value(loc) => {
                load_value_direct_fixed(cu, target, loc, info.args[slot])?;
                slot += 1;
            }
            TemplateArg::Constant(value) => {
                target.load_constant(cu, info.args[slot], value)?;
                slot += 1;
            }
        }
    }

    match zero_check {
        ZeroCheck::None => {}
        ZeroCheck::Narrow => {
            let branch = target.op_cmp_imm_branch(cu, Cond::Eq, info.args[1], 0)?;
            branch_to_pcr(cu, branch);
        }
        ZeroCheck::Wide => {
            let low_nonzero = target.op_cmp_imm_branch(cu, Cond::Ne, info.args[2], 0)?;
            let both_zero = target.op_cmp_imm_branch(cu, Cond::Eq, info.args[3], 0)?;
            branch_to_pcr(cu, both_zero);
            let label = emit_pseudo(cu, PseudoOp::TargetLabel, 0);
            cu.lirs.get_mut(low_nonzero).target = Some(label);
        }
    }

    target.call_direct(cu, template.address());
    cu.reg_pool.clobber_all();
    cu.reg_pool.unlock_all();
    let (_, result_words) = template.shape();
    if result_words == 2 {
        cu.reg_pool.mark_in_use(info.rets[0]);
        cu.reg_pool.mark_in_use(info.rets[1]);
        store_value_wide(cu, target, dest, info.rets[0], info.rets[1])
    } else {
        cu.reg_pool.mark_in_use(info.rets[0]);
        store_value(cu, target, dest, info.rets[0])
    }
}

// Instruction lowering.

fn alu_op(opcode: Opcode) -> Option<AluOp> {
    use Opcode::*;
    Some(match opcode {
        AddInt | AddInt2Addr | AddIntLit16 | AddIntLit8 => AluOp::Add,
        SubInt | SubInt2Addr => AluOp::Sub,
        RsubInt | RsubIntLit8 => AluOp::Rsub,
        MulInt | MulInt2Addr | MulIntLit16 | MulIntLit8 => AluOp::Mul,
        AndInt | AndInt2Addr | AndIntLit16 | AndIntLit8 => AluOp::And,
        OrInt | OrInt2Addr | OrIntLit16 | OrIntLit8 => AluOp::Or,
        XorInt | XorInt2Addr | XorIntLit16 | XorIntLit8 => AluOp::Xor,
        ShlInt | ShlInt2Addr | ShlIntLit8 => AluOp::Lsl,
        ShrInt | ShrInt2Addr | ShrIntLit8 => AluOp::Asr,
        UshrInt | UshrInt2Addr | UshrIntLit8 => AluOp::Lsr,
        _ => return None,
    })
}

fn is_shift(op: AluOp) -> bool {
    matches!(op, AluOp::Lsl | AluOp::Lsr | AluOp::Asr)
}

fn gen_mir(cu: &mut CompilationUnit<'_>, target: &dyn CodegenTarget, mir: &Mir) -> CompileResult<()> {
    use Opcode::*;
    let insn = mir.insn;
    match insn.opcode {
        Nop => Ok(()),
        Move | MoveFrom16 | Move16 | MoveObject | MoveObjectFrom16 | MoveObject16 => {
            let src = load_value(cu, target, get_src(cu, mir, 0)?)?;
            store_value(cu, target, get_dest(cu, mir)?, src)
        }
        MoveWide | MoveWideFrom16 | MoveWide16 => {
            let (low, high) = load_value_wide(cu, target, get_src_wide(cu, mir, 0)?)?;
            store_value_wide(cu, target, get_dest_wide(cu, mir)?, low, high)
        }
        Const4 | Const16 | Const => gen_const(cu, target, mir, insn.v_b as i32),
        ConstHigh16 => gen_const(cu, target, mir, (insn.v_b << 16) as i32),
        ConstWide16 | ConstWide32 => gen_const_wide(cu, target, mir, insn.v_b as i32 as i64),
        ConstWide => gen_const_wide(cu, target, mir, insn.v_b_wide as i64),
        ConstWideHigh16 => gen_const_wide(cu, target, mir, ((insn.v_b as u64) << 48) as i64),
        ConstClass => {
            let dest = get_dest(cu, mir)?;
            let reg = dest_reg(cu, dest)?;
            target.load_class_literal(cu, reg, class_word(insn.v_b))?;
            store_value(cu, target, dest, reg)
        }
        ArrayLength => {
            let loc = get_src(cu, mir, 0)?;
            let array = load_value(cu, target, loc)?;
            gen_null_check(cu, target, mir, loc, array)?;
            let dest = get_dest(cu, mir)?;
            let reg = dest_reg(cu, dest)?;
            target.load_base_disp(cu, reg, array, ARRAY_LENGTH_OFFSET as i32, None)?;
            store_value(cu, target, dest, reg)
        }
        Aget | AgetObject => {
            let array_loc = get_src(cu, mir, 0)?;
            let array = load_value(cu, target, array_loc)?;
            let index = load_value(cu, target, get_src(cu, mir, 1)?)?;
            gen_null_check(cu, target, mir, array_loc, array)?;
            if mir.optimization_flags & mir::MIR_IGNORE_RANGE_CHECK == 0 {
                gen_bounds_check(cu, target, array, index)?;
            }
            let dest = get_dest(cu, mir)?;
            let reg = dest_reg(cu, dest)?;
            target.load_base_indexed(cu, reg, array, index, 2, ARRAY_DATA_OFFSET as i32)?;
            store_value(cu, target, dest, reg)
        }
        Aput | AputObject => {
            let value = load_value(cu, target, get_src(cu, mir, 0)?)?;
            let array_loc = get_src(cu, mir, 1)?;
            let array = load_value(cu, target, array_loc)?;
            let index = load_value(cu, target, get_src(cu, mir, 2)?)?;
            gen_null_check(cu, target, mir, array_loc, array)?;
            if mir.optimization_flags & mir::MIR_IGNORE_RANGE_CHECK == 0 {
                gen_bounds_check(cu, target, array, index)?;
            }
            target.store_base_indexed(cu, value, array, index, 2, ARRAY_DATA_OFFSET as i32)
        }
        IgetQuick | IgetObjectQuick => {
            let obj_loc = get_src(cu, mir, 0)?;
            let obj = load_value(cu, target, obj_loc)?;
            gen_null_check(cu, target, mir, obj_loc, obj)?;
            let dest = get_dest(cu, mir)?;
            let reg = dest_reg(cu, dest)?;
            target.load_base_disp(cu, reg, obj, insn.v_c as i32, None)?;
            store_value(cu, target, dest, reg)
        }
        IputQuick | IputObjectQuick => {
            let value = load_value(cu, target, get_src(cu, mir, 0)?)?;
            let obj_loc = get_src(cu, mir, 1)?;
            let obj = load_value(cu, target, obj_loc)?;
            gen_null_check(cu, target, mir, obj_loc, obj)?;
            target.store_base_disp(cu, value, obj, insn.v_c as i32, None)?;
            Ok(())
        }
        Goto | Goto16 | Goto32 => {
            cu.reg_pool.reset_def_tracking();
            let taken = taken_block(cu, mir)?;
            let branch = target.op_branch(cu);
            cu.add_fixup(branch, FixupTarget::Block(taken));
            Ok(())
        }
        IfEq | IfNe | IfLt | IfGe | IfGt | IfLe => {
            let a = load_value(cu, target, get_src(cu, mir, 0)?)?;
            let b = load_value(cu, target, get_src(cu, mir, 1)?)?;
            let taken = taken_block(cu, mir)?;
            cu.reg_pool.reset_def_tracking();
            let branch = target.op_cmp_branch(cu, if_cond(insn.opcode), a, b)?;
            cu.add_fixup(branch, FixupTarget::Block(taken));
            Ok(())
        }
        IfEqz | IfNez | IfLtz | IfGez | IfGtz | IfLez => {
            let a = load_value(cu, target, get_src(cu, mir, 0)?)?;
            let taken = taken_block(cu, mir)?;
            cu.reg_pool.reset_def_tracking();
            let branch = target.op_cmp_imm_branch(cu, if_cond(insn.opcode), a, 0)?;
            cu.add_fixup(branch, FixupTarget::Block(taken));
            Ok(())
        }
        PackedSwitch | SparseSwitch => gen_switch(cu, target, mir),
        ReturnVoid => target.gen_epilogue(cu),
        Return | ReturnObject => {
            let rets = target.info().rets;
            cu.reg_pool.lock_temp(rets[0]);
            load_value_direct_fixed(cu, target, get_src(cu, mir, 0)?, rets[0])?;
            target.gen_epilogue(cu)
        }
        ReturnWide => {
            let rets = target.info().rets;
            let loc = get_src_wide(cu, mir, 0)?;
            cu.reg_pool.lock_temp(rets[0]);
            cu.reg_pool.lock_temp(rets[1]);
            load_home(cu, target, rets[0], loc.vreg)?;
            load_home(cu, target, rets[1], loc.vreg + 1)?;
            target.gen_epilogue(cu)
        }
        CmplFloat | CmpgFloat => {
            let template = if insn.opcode == CmplFloat {
                Template::CmplFloat
            } else {
                Template::CmpgFloat
            };
            let args = [
                TemplateArg::Value(get_src(cu, mir, 0)?),
                TemplateArg::Value(get_src(cu, mir, 1)?),
            ];
            gen_template_call(cu, target, template, &args, get_dest(cu, mir)?, ZeroCheck::None)
        }
        CmplDouble | CmpgDouble | CmpLong => {
            let template = match insn.opcode {
                CmplDouble => Template::CmplDouble,
                CmpgDouble => Template::CmpgDouble,
                _ => Template::CmpLong,
            };
            let args = [
                TemplateArg::Value(get_src_wide(cu, mir, 0)?),
                TemplateArg::Value(get_src_wide(cu, mir, 2)?),
            ];
            gen_template_call(cu, target, template, &args, get_dest(cu, mir)?, ZeroCheck::None)
        }
        _ => gen_arith(cu, target, mir),
    }
}

fn taken_block(cu: &CompilationUnit<'_>, mir: &Mir) -> CompileResult<BlockId> {
    cu.blocks.get(mir.block).taken.ok_or_else(|| {
        CompileAbort::Internal(format!("branch at 0x{:04x} has no taken block", mir.offset))
    })
}

fn if_cond(opcode: Opcode) -> Cond {
    use Opcode::*;
    match opcode {
        IfEq | IfEqz => Cond::Eq,
        IfNe | IfNez => Cond::Ne,
        IfLt | IfLtz => Cond::Lt,
        IfGe | IfGez => Cond::Ge,
        IfGt | IfGtz => Cond::Gt,
        _ => Cond::Le,
    }
}

fn gen_const(
    cu: &mut CompilationUnit<'_>,
    target: &dyn CodegenTarget,
    mir: &Mir,
    value: i32,
) -> CompileResult<()> {
    let dest = get_dest(cu, mir)?;
    let reg = dest_reg(cu, dest)?;
    target.load_constant(cu, reg, value)?;
    store_value(cu, target, dest, reg)
}

fn gen_const_wide(
    cu: &mut CompilationUnit<'_>,
    target: &dyn CodegenTarget,
    mir: &Mir,
    value: i64,
) -> CompileResult<()> {
    let dest = get_dest_wide(cu, mir)?;
    let (low, high) = dest_pair(cu)?;
    target.load_constant(cu, low, value as i32)?;
    target.load_constant(cu, high, (value >> 32) as i32)?;
    store_value_wide(cu, target, dest, low, high)
}

/// Method-mode switches become a chain of compares against each key.
fn gen_switch(cu: &mut CompilationUnit<'_>, target: &dyn CodegenTarget, mir: &Mir) -> CompileResult<()> {
    let payload = (mir.offset as i64 + mir.insn.v_b as i32 as i64) as usize;
    let cases: Vec<(i32, i32)> = if mir.insn.opcode == Opcode::PackedSwitch {
        let table = decoder::read_packed_switch(cu.code, payload)?;
        table
            .targets
            .iter()
            .enumerate()
            .map(|(index, offset)| (table.first_key.wrapping_add(index as i32), *offset))
            .collect()
    } else {
        decoder::read_sparse_switch(cu.code, payload)?
    };
    let value = load_value(cu, target, get_src(cu, mir, 0)?)?;
    cu.reg_pool.reset_def_tracking();
    for (key, offset) in cases {
        let dex_pc = (mir.offset as i64 + offset as i64) as u32;
        let block = mir::block_at(cu, dex_pc).ok_or_else(|| {
            CompileAbort::Internal(format!("switch target 0x{dex_pc:04x} starts no block"))
        })?;
        let branch = target.op_cmp_imm_branch(cu, Cond::Eq, value, key)?;
        cu.add_fixup(branch, FixupTarget::Block(block));
    }
    Ok(())
}

fn gen_arith(cu: &mut CompilationUnit<'_>, target: &dyn CodegenTarget, mir: &Mir) -> CompileResult<()> {
    use Opcode::*;
    let opcode = mir.insn.opcode;
    match opcode {
        NegInt | NotInt => {
            let src = load_value(cu, target, get_src(cu, mir, 0)?)?;
            let dest = get_dest(cu, mir)?;
            let reg = dest_reg(cu, dest)?;
            let op = if opcode == NegInt {
                UnaryOp::Neg
            } else {
                UnaryOp::Not
            };
            target.op_unary(cu, op, reg, src)?;
            store_value(cu, target, dest, reg)
        }
        NegLong => {
            let src = load_value_wide(cu, target, get_src_wide(cu, mir, 0)?)?;
            let zero = dest_pair(cu)?;
            target.load_constant(cu, zero.0, 0)?;
            target.load_constant(cu, zero.1, 0)?;
            target.gen_long_arith(cu, AluOp::Sub, zero, zero, src)?;
            store_value_wide(cu, target, get_dest_wide(cu, mir)?, zero.0, zero.1)
        }
        NotLong => {
            let (low, high) = load_value_wide(cu, target, get_src_wide(cu, mir, 0)?)?;
            target.op_unary(cu, UnaryOp::Not, low, low)?;
            target.op_unary(cu, UnaryOp::Not, high, high)?;
            store_value_wide(cu, target, get_dest_wide(cu, mir)?, low, high)
        }
        NegFloat => {
            let src = load_value(cu, target, get_src(cu, mir, 0)?)?;
            let dest = get_dest(cu, mir)?;
            let reg = dest_reg(cu, dest)?;
            target.op_reg_reg_imm(cu, AluOp::Xor, reg, src, i32::MIN)?;
            store_value(cu, target, dest, reg)
        }
        NegDouble => {
            let (low, high) = load_value_wide(cu, target, get_src_wide(cu, mir, 0)?)?;
            target.op_reg_reg_imm(cu, AluOp::Xor, high, high, i32::MIN)?;
            store_value_wide(cu, target, get_dest_wide(cu, mir)?, low, high)
        }
        IntToLong => {
            let src = load_value(cu, target, get_src(cu, mir, 0)?)?;
            let (low, high) = dest_pair(cu)?;
            target.op_reg_copy(cu, low, src);
            target.op_reg_reg_imm(cu, AluOp::Asr, high, src, 31)?;
            store_value_wide(cu, target, get_dest_wide(cu, mir)?, low, high)
        }
        LongToInt => {
            let src = get_src_wide(cu, mir, 0)?;
            let reg = cu.reg_pool.alloc_temp().ok_or_else(|| out_of_temps(cu))?;
            load_home(cu, target, reg, src.vreg)?;
            store_value(cu, target, get_dest(cu, mir)?, reg)
        }
        IntToByte | IntToShort | IntToChar => {
            let src = load_value(cu, target, get_src(cu, mir, 0)?)?;
            let dest = get_dest(cu, mir)?;
            let reg = dest_reg(cu, dest)?;
            let (bits, right) = match opcode {
                IntToByte => (24, AluOp::Asr),
                IntToShort => (16, AluOp::Asr),
                _ => (16, AluOp::Lsr),
            };
            target.op_reg_reg_imm(cu, AluOp::Lsl, reg, src, bits)?;
            target.op_reg_reg_imm(cu, right, reg, reg, bits)?;
            store_value(cu, target, dest, reg)
        }
        IntToFloat | FloatToInt | IntToDouble | FloatToLong | FloatToDouble | LongToFloat
        | DoubleToInt | DoubleToFloat | LongToDouble | DoubleToLong => gen_conversion(cu, target, mir),
        AddLong | SubLong | AndLong | OrLong | XorLong | AddLong2Addr | SubLong2Addr
        | AndLong2Addr | OrLong2Addr | XorLong2Addr => {
            let op = match opcode {
                AddLong | AddLong2Addr => AluOp::Add,
                SubLong | SubLong2Addr => AluOp::Sub,
                AndLong | AndLong2Addr => AluOp::And,
                OrLong | OrLong2Addr => AluOp::Or,
                _ => AluOp::Xor,
            };
            let a = load_value_wide(cu, target, get_src_wide(cu, mir, 0)?)?;
            let b = load_value_wide(cu, target, get_src_wide(cu, mir, 2)?)?;
            target.gen_long_arith(cu, op, a, a, b)?;
            store_value_wide(cu, target, get_dest_wide(cu, mir)?, a.0, a.1)
        }
        MulLong | DivLong | RemLong | MulLong2Addr | DivLong2Addr | RemLong2Addr => {
            let (template, check) = match opcode {
                MulLong | MulLong2Addr => (Template::MulLong, ZeroCheck::None),
                DivLong | DivLong2Addr => (Template::DivLong, ZeroCheck::Wide),
                _ => (Template::RemLong, ZeroCheck::Wide),
            };
            let args = [
                TemplateArg::Value(get_src_wide(cu, mir, 0)?),
                TemplateArg::Value(get_src_wide(cu, mir, 2)?),
            ];
            gen_template_call(cu, target, template, &args, get_dest_wide(cu, mir)?, check)
        }
        ShlLong | ShrLong | UshrLong | ShlLong2Addr | ShrLong2Addr | UshrLong2Addr => {
            let template = match opcode {
                ShlLong | ShlLong2Addr => Template::ShlLong,
                ShrLong | ShrLong2Addr => Template::ShrLong,
                _ => Template::UshrLong,
            };
            let args = [
                TemplateArg::Value(get_src_wide(cu, mir, 0)?),
                TemplateArg::Value(get_src(cu, mir, 2)?),
            ];
            gen_template_call(cu, target, template, &args, get_dest_wide(cu, mir)?, ZeroCheck::None)
        }
        AddFloat | SubFloat | MulFloat | DivFloat | RemFloat | AddFloat2Addr | SubFloat2Addr
        | MulFloat2Addr | DivFloat2Addr | RemFloat2Addr => gen_float_arith(cu, target, mir),
        AddDouble | SubDouble | MulDouble | DivDouble | RemDouble | AddDouble2Addr
        | SubDouble2Addr | MulDouble2Addr | DivDouble2Addr | RemDouble2Addr => {
            let template = match opcode {
                AddDouble | AddDouble2Addr => Template::AddDouble,
                SubDouble | SubDouble2Addr => Template::SubDouble,
                MulDouble | MulDouble2Addr => Template::MulDouble,
                DivDouble | DivDouble2Addr => Template::DivDouble,
                _ => Template::RemDouble,
            };
            let args = [
                TemplateArg::Value(get_src_wide(cu, mir, 0)?),
                TemplateArg::Value(get_src_wide(cu, mir, 2)?),
            ];
            gen_template_call(cu, target, template, &args, get_dest_wide(cu, mir)?, ZeroCheck::None)
        }
        DivInt | RemInt | DivInt2Addr | RemInt2Addr => {
            let is_div = matches!(opcode, DivInt | DivInt2Addr);
            let divisor = TemplateArg::Value(get_src(cu, mir, 1)?);
            gen_div_rem(cu, target, mir, divisor, is_div)
        }
        DivIntLit16 | RemIntLit16 | DivIntLit8 | RemIntLit8 => {
            let is_div = matches!(opcode, DivIntLit16 | DivIntLit8);
            let literal = mir.insn.v_c as i32;
            if literal == 0 {
                // Always throws; let the interpreter raise it.
                cu.reg_pool.reset_def_tracking();
                let branch = target.op_branch(cu);
                branch_to_pcr(cu, branch);
                return Ok(());
            }
            gen_div_rem(cu, target, mir, TemplateArg::Constant(literal), is_div)
        }
        _ => match alu_op(opcode) {
            Some(op) => gen_int_arith(cu, target, mir, op),
            None => Err(CompileAbort::UnsupportedOpcode {
                dex_pc: mir.offset,
                opcode,
            }),
        },
    }
}

fn gen_int_arith(
    cu: &mut CompilationUnit<'_>,
    target: &dyn CodegenTarget,
    mir: &Mir,
    op: AluOp,
) -> CompileResult<()> {
    let info = target.info();
    let literal = matches!(mir.insn.opcode.format(), Format::F22s | Format::F22b);
    if literal {
        let src = load_value(cu, target, get_src(cu, mir, 0)?)?;
        let dest = get_dest(cu, mir)?;
        let reg = dest_reg(cu, dest)?;
        let mut value = mir.insn.v_c as i32;
        if is_shift(op) {
            value &= 31;
        }
        target.op_reg_reg_imm(cu, op, reg, src, value)?;
        return store_value(cu, target, dest, reg);
    }

    if !is_shift(op) {
        let a = load_value(cu, target, get_src(cu, mir, 0)?)?;
        let b = load_value(cu, target, get_src(cu, mir, 1)?)?;
        let dest = get_dest(cu, mir)?;
        let reg = dest_reg(cu, dest)?;
        target.op_reg_reg_reg(cu, op, reg, a, b)?;
        return store_value(cu, target, dest, reg);
    }

    if let Some(count_reg) = info.shift_count_reg {
        cu.reg_pool.lock_temp(count_reg);
        let src = load_value(cu, target, get_src(cu, mir, 0)?)?;
        load_value_direct_fixed(cu, target, get_src(cu, mir, 1)?, count_reg)?;
        let dest = get_dest(cu, mir)?;
        let reg = dest_reg(cu, dest)?;
        target.op_reg_reg_reg(cu, op, reg, src, count_reg)?;
        cu.reg_pool.clobber(count_reg);
        return store_value(cu, target, dest, reg);
    }
    let src = load_value(cu, target, get_src(cu, mir, 0)?)?;
    let mut count = load_value(cu, target, get_src(cu, mir, 1)?)?;
    if info.mask_shift_count {
        let masked = scratch_temp(cu)?;
        target.op_reg_reg_imm(cu, AluOp::And, masked, count, 31)?;
        count = masked;
    }
    let dest = get_dest(cu, mir)?;
    let reg = dest_reg(cu, dest)?;
    target.op_reg_reg_reg(cu, op, reg, src, count)?;
    store_value(cu, target, dest, reg)
}

fn gen_div_rem(
    cu: &mut CompilationUnit<'_>,
    target: &dyn CodegenTarget,
    mir: &Mir,
    divisor: TemplateArg,
    is_div: bool,
) -> CompileResult<()> {
    let info = target.info();
    let dividend = get_src(cu, mir, 0)?;
    let dest = get_dest(cu, mir)?;
    if !info.inline_int_div {
        let template = if is_div {
            Template::DivInt
        } else {
            Template::RemInt
        };
        let check = match divisor {
            TemplateArg::Constant(_) => ZeroCheck::None,
            TemplateArg::Value(_) => ZeroCheck::Narrow,
        };
        let args = [TemplateArg::Value(dividend), divisor];
        return gen_template_call(cu, target, template, &args, dest, check);
    }

    let dividend_reg = match info.div_regs {
        Some((fixed, remainder)) => {
            cu.reg_pool.lock_temp(fixed);
            cu.reg_pool.lock_temp(remainder);
            load_value_direct_fixed(cu, target, dividend, fixed)?;
            fixed
        }
        None => load_value(cu, target, dividend)?,
    };
    let divisor_reg = match divisor {
        TemplateArg::Value(loc) => {
            let reg = load_value(cu, target, loc)?;
            cu.reg_pool.reset_def_tracking();
            let branch = target.op_cmp_imm_branch(cu, Cond::Eq, reg, 0)?;
            branch_to_pcr(cu, branch);
            reg
        }
        TemplateArg::Constant(value) => {
            let reg = scratch_temp(cu)?;
            target.load_constant(cu, reg, value)?;
            reg
        }
    };
    let result = target.gen_div_rem(cu, dividend_reg, divisor_reg, is_div)?;
    if let Some((fixed, remainder)) = info.div_regs {
        cu.reg_pool.clobber(fixed);
        cu.reg_pool.clobber(remainder);
    }
    store_value(cu, target, dest, result)
}

fn gen_float_arith(
    cu: &mut CompilationUnit<'_>,
    target: &dyn CodegenTarget,
    mir: &Mir,
) -> CompileResult<()> {
    use Opcode::*;
    let opcode = mir.insn.opcode;
    let (fp_op, template) = match opcode {
        AddFloat | AddFloat2Addr => (Some(FpOp::Add), Template::AddFloat),
        SubFloat | SubFloat2Addr => (Some(FpOp::Sub), Template::SubFloat),
        MulFloat | MulFloat2Addr => (Some(FpOp::Mul), Template::MulFloat),
        DivFloat | DivFloat2Addr => (Some(FpOp::Div), Template::DivFloat),
        _ => (None, Template::RemFloat),
    };
    let a = get_src(cu, mir, 0)?;
    let b = get_src(cu, mir, 1)?;
    let dest = get_dest(cu, mir)?;
    match fp_op {
        Some(op) if target.info().inline_fp => {
            let fa = load_value(cu, target, as_fp(a))?;
            let fb = load_value(cu, target, as_fp(b))?;
            let fd = dest_reg(cu, as_fp(dest))?;
            target.op_fp_rrr(cu, op, fd, fa, fb)?;
            store_value(cu, target, as_fp(dest), fd)
        }
        _ => {
            let args = [TemplateArg::Value(a), TemplateArg::Value(b)];
            gen_template_call(cu, target, template, &args, dest, ZeroCheck::None)
        }
    }
}

fn gen_conversion(
    cu: &mut CompilationUnit<'_>,
    target: &dyn CodegenTarget,
    mir: &Mir,
) -> CompileResult<()> {
    use Opcode::*;
    let opcode = mir.insn.opcode;
    let template = match opcode {
        IntToFloat => Template::IntToFloat,
        FloatToInt => Template::FloatToInt,
        IntToDouble => Template::IntToDouble,
        FloatToLong => Template::FloatToLong,
        FloatToDouble => Template::FloatToDouble,
        LongToFloat => Template::LongToFloat,
        DoubleToInt => Template::DoubleToInt,
        DoubleToFloat => Template::DoubleToFloat,
        LongToDouble => Template::LongToDouble,
        _ => Template::DoubleToLong,
    };
    let (sources, result_words) = template.shape();
    let src = if sources[0] == 2 {
        get_src_wide(cu, mir, 0)?
    } else {
        get_src(cu, mir, 0)?
    };
    let dest = if result_words == 2 {
        get_dest_wide(cu, mir)?
    } else {
        get_dest(cu, mir)?
    };
    gen_template_call(cu, target, template, &[TemplateArg::Value(src)], dest, ZeroCheck::None)
}
