//! Per-opcode dataflow attributes, SSA naming, promotion candidates and reference inference.

use std::collections::BTreeMap;

use crate::bytecode::Opcode;
use crate::compiler::bit_vector::BitVector;
use crate::compiler::mir::{self, BlockKind, MAX_SSA_USES, SsaRep};
use crate::compiler::{CompilationUnit, CompileAbort, CompileMode, CompileResult};

pub const DF_DA: u32 = 1;
pub const DF_DA_WIDE: u32 = 1 << 1;
pub const DF_UA: u32 = 1 << 2;
pub const DF_UA_WIDE: u32 = 1 << 3;
pub const DF_UB: u32 = 1 << 4;
pub const DF_UB_WIDE: u32 = 1 << 5;
pub const DF_UC: u32 = 1 << 6;
pub const DF_UC_WIDE: u32 = 1 << 7;
pub const DF_FORMAT_35C: u32 = 1 << 8;
pub const DF_FORMAT_3RC: u32 = 1 << 9;
pub const DF_FP_A: u32 = 1 << 10;
pub const DF_FP_B: u32 = 1 << 11;
pub const DF_FP_C: u32 = 1 << 12;
/// The defined value is an object reference.
pub const DF_REF_A: u32 = 1 << 13;
pub const DF_NULL_CHK_B: u32 = 1 << 14;

const DF_FP_ABC: u32 = DF_FP_A | DF_FP_B | DF_FP_C;

pub fn attributes(opcode: Opcode) -> u32 {
    use Opcode::*;
    match opcode {
        Move | MoveFrom16 | Move16 => DF_DA | DF_UB,
        MoveObject | MoveObjectFrom16 | MoveObject16 => DF_DA | DF_UB | DF_REF_A,
        MoveWide | MoveWideFrom16 | MoveWide16 => DF_DA_WIDE | DF_UB_WIDE,
        MoveResult => DF_DA,
        MoveResultWide => DF_DA_WIDE,
        MoveResultObject | MoveException => DF_DA | DF_REF_A,
        Return | ReturnObject => DF_UA,
        ReturnWide => DF_UA_WIDE,
        Const4 | Const16 | Const | ConstHigh16 => DF_DA,
        ConstWide16 | ConstWide32 | ConstWide | ConstWideHigh16 => DF_DA_WIDE,
        ConstString | ConstStringJumbo | ConstClass | NewInstance => DF_DA | DF_REF_A,
        MonitorEnter | MonitorExit | CheckCast | Throw | FillArrayData | PackedSwitch
        | SparseSwitch | Sput | SputObject | SputBoolean | SputByte | SputChar | SputShort
        | SputVolatile | SputObjectVolatile => DF_UA,
        SputWide | SputWideVolatile => DF_UA_WIDE,
        InstanceOf => DF_DA | DF_UB,
        ArrayLength => DF_DA | DF_UB | DF_NULL_CHK_B,
        NewArray => DF_DA | DF_UB | DF_REF_A,
        FilledNewArray | InvokeVirtual | InvokeSuper | InvokeDirect | InvokeStatic
        | InvokeInterface | InvokeVirtualQuick | InvokeSuperQuick | ExecuteInline => DF_FORMAT_35C,
        FilledNewArrayRange | InvokeVirtualRange | InvokeSuperRange | InvokeDirectRange
        | InvokeStaticRange | InvokeInterfaceRange | InvokeObjectInitRange
        | InvokeVirtualQuickRange | InvokeSuperQuickRange | ExecuteInlineRange => DF_FORMAT_3RC,
        CmplFloat | CmpgFloat => DF_DA | DF_UB | DF_UC | DF_FP_B | DF_FP_C,
        CmplDouble | CmpgDouble => DF_DA | DF_UB_WIDE | DF_UC_WIDE | DF_FP_B | DF_FP_C,
        CmpLong => DF_DA | DF_UB_WIDE | DF_UC_WIDE,
        IfEq | IfNe | IfLt | IfGe | IfGt | IfLe => DF_UA | DF_UB,
        IfEqz | IfNez | IfLtz | IfGez | IfGtz | IfLez => DF_UA,
        Aget | AgetBoolean | AgetByte | AgetChar | AgetShort => {
            DF_DA | DF_UB | DF_UC | DF_NULL_CHK_B
        }
        AgetWide => DF_DA_WIDE | DF_UB | DF_UC | DF_NULL_CHK_B,
        AgetObject => DF_DA | DF_UB | DF_UC | DF_REF_A | DF_NULL_CHK_B,
        Aput | AputObject | AputBoolean | AputByte | AputChar | AputShort => {
            DF_UA | DF_UB | DF_UC | DF_NULL_CHK_B
        }
        AputWide => DF_UA_WIDE | DF_UB | DF_UC | DF_NULL_CHK_B,
        Iget | IgetBoolean | IgetByte | IgetChar | IgetShort | IgetVolatile | IgetQuick => {
            DF_DA | DF_UB | DF_NULL_CHK_B
        }
        IgetWide | IgetWideVolatile | IgetWideQuick => DF_DA_WIDE | DF_UB | DF_NULL_CHK_B,
        IgetObject | IgetObjectVolatile | IgetObjectQuick => {
            DF_DA | DF_UB | DF_REF_A | DF_NULL_CHK_B
        }
        Iput | IputObject | IputBoolean | IputByte | IputChar | IputShort | IputVolatile
        | IputObjectVolatile | IputQuick | IputObjectQuick => DF_UA | DF_UB | DF_NULL_CHK_B,
        IputWide | IputWideVolatile | IputWideQuick => DF_UA_WIDE | DF_UB | DF_NULL_CHK_B,
        Sget | SgetBoolean | SgetByte | SgetChar | SgetShort | SgetVolatile => DF_DA,
        SgetWide | SgetWideVolatile => DF_DA_WIDE,
        SgetObject | SgetObjectVolatile => DF_DA | DF_REF_A,
        NegInt | NotInt | IntToByte | IntToChar | IntToShort => DF_DA | DF_UB,
        NegLong | NotLong => DF_DA_WIDE | DF_UB_WIDE,
        NegFloat => DF_DA | DF_UB | DF_FP_A | DF_FP_B,
        NegDouble => DF_DA_WIDE | DF_UB_WIDE | DF_FP_A | DF_FP_B,
        IntToLong => DF_DA_WIDE | DF_UB,
        IntToFloat => DF_DA | DF_UB | DF_FP_A,
        IntToDouble => DF_DA_WIDE | DF_UB | DF_FP_A,
        LongToInt => DF_DA | DF_UB_WIDE,
        LongToFloat => DF_DA | DF_UB_WIDE | DF_FP_A,
        LongToDouble => DF_DA_WIDE | DF_UB_WIDE | DF_FP_A,
        FloatToInt => DF_DA | DF_UB | DF_FP_B,
        FloatToLong => DF_DA_WIDE | DF_UB | DF_FP_B,
        FloatToDouble => DF_DA_WIDE | DF_UB | DF_FP_A | DF_FP_B,
        DoubleToInt => DF_DA | DF_UB_WIDE | DF_FP_B,
        DoubleToLong => DF_DA_WIDE | DF_UB_WIDE | DF_FP_B,
        DoubleToFloat => DF_DA | DF_UB_WIDE | DF_FP_A | DF_FP_B,
        AddInt | SubInt | MulInt | DivInt | RemInt | AndInt | OrInt | XorInt | ShlInt
        | ShrInt | UshrInt => DF_DA | DF_UB | DF_UC,
        AddLong | SubLong | MulLong | DivLong | RemLong | AndLong | OrLong | XorLong => {
            DF_DA_WIDE | DF_UB_WIDE | DF_UC_WIDE
        }
        ShlLong | ShrLong | UshrLong => DF_DA_WIDE | DF_UB_WIDE | DF_UC,
        AddFloat | SubFloat | MulFloat | DivFloat | RemFloat => {
            DF_DA | DF_UB | DF_UC | DF_FP_ABC
        }
        AddDouble | SubDouble | MulDouble | DivDouble | RemDouble => {
            DF_DA_WIDE | DF_UB_WIDE | DF_UC_WIDE | DF_FP_ABC
        }
        AddInt2Addr | SubInt2Addr | MulInt2Addr | DivInt2Addr | RemInt2Addr | AndInt2Addr
        | OrInt2Addr | XorInt2Addr | ShlInt2Addr | ShrInt2Addr | UshrInt2Addr => {
            DF_DA | DF_UA | DF_UB
        }
        AddLong2Addr | SubLong2Addr | MulLong2Addr | DivLong2Addr | RemLong2Addr
        | AndLong2Addr | OrLong2Addr | XorLong2Addr => DF_DA_WIDE | DF_UA_WIDE | DF_UB_WIDE,
        ShlLong2Addr | ShrLong2Addr | UshrLong2Addr => DF_DA_WIDE | DF_UA_WIDE | DF_UB,
        AddFloat2Addr | SubFloat2Addr | MulFloat2Addr | DivFloat2Addr | RemFloat2Addr => {
            DF_DA | DF_UA | DF_UB | DF_FP_ABC
        }
        AddDouble2Addr | SubDouble2Addr | MulDouble2Addr | DivDouble2Addr | RemDouble2Addr => {
            DF_DA_WIDE | DF_UA_WIDE | DF_UB_WIDE | DF_FP_ABC
        }
        AddIntLit16 | RsubInt | MulIntLit16 | DivIntLit16 | RemIntLit16 | AndIntLit16
        | OrIntLit16 | XorIntLit16 | AddIntLit8 | RsubIntLit8 | MulIntLit8 | DivIntLit8
        | RemIntLit8 | AndIntLit8 | OrIntLit8 | XorIntLit8 | ShlIntLit8 | ShrIntLit8
        | UshrIntLit8 => DF_DA | DF_UB,
        _ => 0,
    }
}

/// Virtual registers an instruction reads, in operand order; wide operands name their low half.
pub fn vreg_uses(mir: &mir::Mir) -> Vec<(u32, bool)> {
    let insn = &mir.insn;
    let attrs = attributes(insn.opcode);
    if attrs & (DF_FORMAT_35C | DF_FORMAT_3RC) != 0 {
        return insn
            .argument_registers()
            .into_iter()
            .map(|reg| (reg, false))
            .collect();
    }
    let mut uses = Vec::new();
    for (narrow, wide, reg) in [
        (DF_UA, DF_UA_WIDE, insn.v_a),
        (DF_UB, DF_UB_WIDE, insn.v_b),
        (DF_UC, DF_UC_WIDE, insn.v_c),
    ] {
        if attrs & narrow != 0 {
            uses.push((reg, false));
        } else if attrs & wide != 0 {
            uses.push((reg, true));
        }
    }
    uses
}

/// Defined vreg and whether it is wide.
pub fn vreg_def(mir: &mir::Mir) -> Option<(u32, bool)> {
    let attrs = attributes(mir.insn.opcode);
    if attrs & DF_DA != 0 {
        Some((mir.insn.v_a, false))
    } else if attrs & DF_DA_WIDE != 0 {
        Some((mir.insn.v_a, true))
    } else {
        None
    }
}

/// A wide result sharing exactly one slot with a wide source, such as `add-long v1, v0, v2`.
pub fn wide_overlaps_by_one_slot(mir: &mir::Mir) -> bool {
    let Some((def, true)) = vreg_def(mir) else {
        return false;
    };
    vreg_uses(mir)
        .into_iter()
        .any(|(reg, wide)| wide && def.abs_diff(reg) == 1)
}

/// Names every use and def. Each block starts with fresh names so no phi nodes are needed.
pub fn compute_ssa(cu: &mut CompilationUnit<'_>) -> CompileResult<()> {
    let num_regs = cu.num_regs as usize;
    for vreg in 0..num_regs {
        cu.new_ssa_name(vreg as i32);
    }
    let mut current: Vec<i32> = (0..num_regs as i32).collect();
    for block_id in 0..cu.blocks.len() {
        if cu.blocks.get(block_id).kind != BlockKind::DalvikByteCode {
            continue;
        }
        for vreg in 0..num_regs {
            current[vreg] = cu.new_ssa_name(vreg as i32);
        }
        for index in mir::block_mirs(cu, block_id) {
            let mir = cu.mirs.get(index);
            let mut ssa = SsaRep::default();
            for (reg, wide) in vreg_uses(&mir) {
                let halves = if wide { 2 } else { 1 };
                for half in 0..halves {
                    let vreg = reg as usize + half;
                    if vreg >= num_regs || ssa.num_uses as usize >= MAX_SSA_USES {
                        return Err(CompileAbort::Internal(format!(
                            "operand v{vreg} out of range at 0x{:04x}",
                            mir.offset
                        )));
                    }
                    ssa.uses[ssa.num_uses as usize] = current[vreg];
                    ssa.num_uses += 1;
                }
            }
            if let Some((reg, wide)) = vreg_def(&mir) {
                let halves = if wide { 2 } else { 1 };
                for half in 0..halves {
                    let vreg = reg as usize + half;
                    if vreg >= num_regs {
                        return Err(CompileAbort::Internal(format!(
                            "destination v{vreg} out of range at 0x{:04x}",
                            mir.offset
                        )));
                    }
                    let name = cu.new_ssa_name(vreg as i32);
                    current[vreg] = name;
                    ssa.defs[ssa.num_defs as usize] = name;
                    ssa.num_defs += 1;
                }
            }
            cu.mirs.get_mut(index).ssa = ssa;
        }
    }
    Ok(())
}

/// Narrow, non-float vregs ordered by how often they are touched, most used first.
pub fn promotion_candidates(cu: &CompilationUnit<'_>) -> Vec<(u32, u32)> {
    let num_regs = cu.num_regs as usize;
    let mut counts = vec![0u32; num_regs];
    let mut excluded = vec![false; num_regs];
    for mir in cu.mirs.iter() {
        let attrs = attributes(mir.insn.opcode);
        let uses = vreg_uses(&mir);
        let fp_flags = [DF_FP_A, DF_FP_B, DF_FP_C];
        for (position, (reg, wide)) in uses.iter().enumerate() {
            let reg = *reg as usize;
            if reg >= num_regs {
                continue;
            }
            counts[reg] += 1;
            // The operand slot tells which fp flag applies: A, B, C in order of the bits present.
            let slot = operand_slot(attrs, position);
            let fp = slot.is_some_and(|slot| attrs & fp_flags[slot] != 0);
            if *wide || fp {
                excluded[reg] = true;
                if *wide && reg + 1 < num_regs {
                    excluded[reg + 1] = true;
                }
            }
        }
        if let Some((reg, wide)) = vreg_def(&mir) {
            let reg = reg as usize;
            if reg < num_regs {
                counts[reg] += 1;
                if wide || attrs & DF_FP_A != 0 {
                    excluded[reg] = true;
                    if wide && reg + 1 < num_regs {
                        excluded[reg + 1] = true;
                    }
                }
            }
        }
    }
    let mut candidates: Vec<(u32, u32)> = (0..num_regs)
        .filter(|reg| !excluded[*reg] && counts[*reg] > 0)
        .map(|reg| (reg as u32, counts[reg]))
        .collect();
    candidates.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    candidates
}

fn operand_slot(attrs: u32, position: usize) -> Option<usize> {
    if attrs & (DF_FORMAT_35C | DF_FORMAT_3RC) != 0 {
        return None;
    }
    let present: Vec<usize> = [
        (DF_UA | DF_UA_WIDE, 0),
        (DF_UB | DF_UB_WIDE, 1),
        (DF_UC | DF_UC_WIDE, 2),
    ]
    .into_iter()
    .filter(|(bits, _)| attrs & bits != 0)
    .map(|(_, slot)| slot)
    .collect();
    present.get(position).copied()
}

/// Vregs holding references at method entry.
fn entry_references(cu: &CompilationUnit<'_>) -> Vec<u32> {
    if cu.mode == CompileMode::Trace {
        return Vec::new();
    }
    let mut refs = Vec::new();
    let mut reg = cu.num_locals;
    if !cu.method.is_static() {
        refs.push(reg);
        reg += 1;
    }
    for ch in cu.method.shorty().chars().skip(1) {
        match ch {
            'L' | '[' => refs.push(reg),
            _ => {}
        }
        reg += if matches!(ch, 'J' | 'D') { 2 } else { 1 };
    }
    refs
}

fn transfer(bits: &mut BitVector<'_>, mir: &mir::Mir, num_regs: usize) {
    let Some((reg, wide)) = vreg_def(mir) else {
        return;
    };
    let reg = reg as usize;
    if reg >= num_regs {
        return;
    }
    let attrs = attributes(mir.insn.opcode);
    if attrs & DF_REF_A != 0 {
        bits.set_bit(reg);
        return;
    }
    // Plain moves carry the source's kind along.
    if matches!(
        mir.insn.opcode,
        Opcode::Move | Opcode::MoveFrom16 | Opcode::Move16
    ) && bits.is_bit_set(mir.insn.v_b as usize)
    {
        bits.set_bit(reg);
        return;
    }
    bits.clear_bit(reg);
    if wide && reg + 1 < num_regs {
        bits.clear_bit(reg + 1);
    }
}

/// Records which vregs hold references before every instruction.
///
/// A vreg counts as a reference only when every path into the instruction agrees.
pub fn infer_references(cu: &mut CompilationUnit<'_>) {
    let num_regs = cu.num_regs as usize;
    let arena = cu.arena;
    let block_count = cu.blocks.len();
    let code_blocks: Vec<usize> = (0..block_count)
        .filter(|id| cu.blocks.get(*id).kind == BlockKind::DalvikByteCode)
        .collect();
    let mut preds: Vec<Vec<usize>> = vec![Vec::new(); block_count];
    for id in 0..block_count {
        for succ in mir::successors(cu, id) {
            preds[succ].push(id);
        }
    }
    let entry_block = cu.blocks.get(0).fall_through;
    let mut entry = BitVector::new(arena, num_regs, false);
    for reg in entry_references(cu) {
        if (reg as usize) < num_regs {
            entry.set_bit(reg as usize);
        }
    }
    let mut outs: Vec<BitVector<'_>> = (0..block_count)
        .map(|_| {
            let mut bits = BitVector::new(arena, num_regs, false);
            bits.mark_all_bits(true);
            bits
        })
        .collect();
    let mut scratch = BitVector::new(arena, num_regs, false);
    let mut changed = true;
    while changed {
        changed = false;
        for &id in &code_blocks {
            block_in(&mut scratch, id, entry_block, &entry, &preds[id], &outs);
            for index in mir::block_mirs(cu, id) {
                transfer(&mut scratch, &cu.mirs.get(index), num_regs);
            }
            if !scratch.same_bits(&outs[id]) {
                outs[id].copy_from(&scratch);
                changed = true;
            }
        }
    }
    let mut maps = BTreeMap::new();
    for &id in &code_blocks {
        block_in(&mut scratch, id, entry_block, &entry, &preds[id], &outs);
        for index in mir::block_mirs(cu, id) {
            let mir = cu.mirs.get(index);
            maps.insert(mir.offset, pack_bits(&scratch, num_regs));
            transfer(&mut scratch, &mir, num_regs);
        }
    }
    cu.reference_maps = maps;
}

fn block_in(
    scratch: &mut BitVector<'_>,
    id: usize,
    entry_block: Option<usize>,
    entry: &BitVector<'_>,
    preds: &[usize],
    outs: &[BitVector<'_>],
) {
    scratch.mark_all_bits(true);
    let mut any = false;
    if entry_block == Some(id) {
        scratch.intersect_with(entry);
        any = true;
    }
    for &pred in preds {
        if pred == 0 {
            continue;
        }
        scratch.intersect_with(&outs[pred]);
        any = true;
    }
    if !any {
        scratch.clear_all();
    }
}

pub fn pack_bits(bits: &BitVector<'_>, num_regs: usize) -> Vec<u8> {
    let mut out = vec![0u8; num_regs.div_ceil(8)];
    for reg in 0..num_regs {
        if bits.is_bit_set(reg) {
            out[reg / 8] |= 1 << (reg % 8);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembler::assemble_method;
    use crate::compiler::arena::Arena;
    use crate::compiler::mir::build_method_blocks;
    use crate::compiler::ralloc::RegisterPool;
    use crate::isa::InstructionSet;
    use crate::method::MethodTable;

    fn method_unit<'a>(arena: &'a Arena, source: &str) -> CompilationUnit<'a> {
        let table = MethodTable::new();
        let method = table.register(assemble_method(source).expect("assemble"));
        let pool = RegisterPool::new(arena, &[0, 1, 2, 3], &[], 8);
        let mut cu =
            CompilationUnit::new(arena, method, InstructionSet::Thumb2, CompileMode::Method, 0, pool)
                .expect("unit");
        build_method_blocks(&mut cu).expect("blocks");
        compute_ssa(&mut cu).expect("ssa");
        cu
    }

    #[test]
    fn half_overlapping_wide_operands_are_flagged() {
        let arena = Arena::new();
        let cu = method_unit(
            &arena,
            "
.method static LFoo;->k(JJ)V
.registers 6
.ins 4
    add-long v1, v2, v4
    add-long v2, v2, v4
    return-void
.end method
",
        );
        assert!(wide_overlaps_by_one_slot(&cu.mirs.get(0)));
        assert!(!wide_overlaps_by_one_slot(&cu.mirs.get(1)));
    }

    #[test]
    fn defs_get_fresh_names() {
        let arena = Arena::new();
        let cu = method_unit(
            &arena,
            "
.method static LFoo;->f(II)I
.registers 3
.ins 2
    add-int v0, v1, v2
    add-int/2addr v0, v0
    return v0
.end method
",
        );
        let first = cu.mirs.get(0).ssa;
        let second = cu.mirs.get(1).ssa;
        assert_eq!(first.num_uses, 2);
        assert_eq!(second.uses(), &[first.defs[0], first.defs[0]]);
        assert_eq!(cu.vreg_of(second.defs[0]), 0);
        assert_ne!(second.defs[0], first.defs[0]);
    }

    #[test]
    fn wide_and_float_vregs_are_not_promotion_candidates() {
        let arena = Arena::new();
        let cu = method_unit(
            &arena,
            "
.method static LFoo;->g(IJ)I
.registers 5
.ins 3
    add-int/lit8 v0, v2, 1
    add-int/2addr v0, v2
    add-long/2addr v3, v3
    int-to-float v1, v0
    return v0
.end method
",
        );
        let regs: Vec<u32> = promotion_candidates(&cu).iter().map(|(reg, _)| *reg).collect();
        assert_eq!(regs.first(), Some(&0));
        assert!(regs.contains(&2));
        assert!(!regs.contains(&3) && !regs.contains(&4));
        assert!(!regs.contains(&1));
    }

    #[test]
    fn references_need_agreement_on_every_path() {
        let arena = Arena::new();
        let mut cu = method_unit(
            &arena,
            "
.method LFoo;->h([II)I
.registers 4
.ins 3
    if-eqz v3, :skip
    const/4 v1, 0
:skip
    aget v0, v1, v3
    move-object v2, v1
    return v0
.end method
",
        );
        infer_references(&mut cu);
        // v1 is `this`, v2 the array, v3 the int.
        let at_entry = cu.reference_maps.get(&0).expect("entry map");
        assert_eq!(at_entry[0], 0b0110);
        // After the join v1 is a reference on one path only.
        let at_aget = cu.reference_maps.get(&3).expect("join map");
        assert_eq!(at_aget[0] & 0b0010, 0);
        let at_return = cu.reference_maps.get(&6).expect("return map");
        assert_eq!(at_return[0] & 0b0100, 0b0100);
    }
}
