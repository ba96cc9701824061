//! Mid-level IR: decoded instructions grouped into basic blocks.

use std::collections::{BTreeMap, BTreeSet};

use crate::bytecode::Opcode;
use crate::compiler::lir::{CellKind, LirId};
use crate::compiler::{CompilationUnit, CompileAbort, CompileMode, CompileResult};
use crate::decoder::{self, DecodedInstruction, InstructionIter};

pub type BlockId = usize;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockKind {
    Entry,
    DalvikByteCode,
    ChainingCellNormal,
    ChainingCellHot,
    ChainingCellInvokeSingleton,
    ChainingCellInvokePredicted,
    ChainingCellBackwardBranch,
    ChainingCellGap,
    PcReconstruction,
    ExceptionHandling,
    Exit,
}

impl BlockKind {
    pub fn cell_kind(self) -> Option<CellKind> {
        match self {
            BlockKind::ChainingCellNormal => Some(CellKind::Normal),
            BlockKind::ChainingCellHot => Some(CellKind::Hot),
            BlockKind::ChainingCellInvokeSingleton => Some(CellKind::InvokeSingleton),
            BlockKind::ChainingCellInvokePredicted => Some(CellKind::InvokePredicted),
            BlockKind::ChainingCellBackwardBranch => Some(CellKind::BackwardBranch),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BasicBlock {
    pub id: BlockId,
    pub kind: BlockKind,
    /// First dex pc of a bytecode block, or the target dex pc of a chaining cell.
    pub start_offset: u32,
    pub taken: Option<BlockId>,
    pub fall_through: Option<BlockId>,
    pub first_mir: Option<usize>,
    pub last_mir: Option<usize>,
    pub visited: bool,
    pub label: Option<LirId>,
}

impl BasicBlock {
    pub fn new(id: BlockId, kind: BlockKind, start_offset: u32) -> Self {
        Self {
            id,
            kind,
            start_offset,
            taken: None,
            fall_through: None,
            first_mir: None,
            last_mir: None,
            visited: false,
            label: None,
        }
    }
}

pub const MAX_SSA_USES: usize = 6;

/// SSA names read and written by one instruction. Wide values take two consecutive names.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SsaRep {
    pub uses: [i32; MAX_SSA_USES],
    pub num_uses: u8,
    pub defs: [i32; 2],
    pub num_defs: u8,
}

impl SsaRep {
    pub fn uses(&self) -> &[i32] {
        &self.uses[..self.num_uses as usize]
    }

    pub fn defs(&self) -> &[i32] {
        &self.defs[..self.num_defs as usize]
    }
}

/// The value is proven non-null on entry.
pub const MIR_IGNORE_NULL_CHECK: u32 = 1;
/// Index already proven within bounds.
pub const MIR_IGNORE_RANGE_CHECK: u32 = 1 << 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Mir {
    pub insn: DecodedInstruction,
    pub offset: u32,
    pub ssa: SsaRep,
    pub next: Option<usize>,
    pub block: BlockId,
    pub optimization_flags: u32,
}

/// How the code generator handles an opcode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Support {
    /// Compiled to native code, possibly through a template call.
    Inline,
    /// Handed to the interpreter for a single step.
    Punt,
    Unsupported,
}

pub fn support(opcode: Opcode, mode: CompileMode) -> Support {
    use Opcode::*;
    let value = opcode as u8;
    match opcode {
        Nop | Move | MoveFrom16 | Move16 | MoveWide | MoveWideFrom16 | MoveWide16 | MoveObject
        | MoveObjectFrom16 | MoveObject16 | Const4 | Const16 | Const | ConstHigh16
        | ConstWide16 | ConstWide32 | ConstWide | ConstWideHigh16 | ConstClass | ArrayLength
        | Aget | AgetObject | Aput | AputObject | IgetQuick | IgetObjectQuick | IputQuick
        | IputObjectQuick | Goto | Goto16 | Goto32 | CmplFloat | CmpgFloat | CmplDouble
        | CmpgDouble | CmpLong | IfEq | IfNe | IfLt | IfGe | IfGt | IfLe | IfEqz | IfNez
        | IfLtz | IfGez | IfGtz | IfLez => Support::Inline,
        _ if (0x7b..=0xe2).contains(&value) => Support::Inline,
        NewArray | FillArrayData | AgetWide | AgetBoolean | AgetByte | AgetChar | AgetShort
        | AputWide | AputBoolean | AputByte | AputChar | AputShort | IgetWideQuick
        | IputWideQuick => Support::Punt,
        ReturnVoid | Return | ReturnWide | ReturnObject | PackedSwitch | SparseSwitch
            if mode == CompileMode::Method =>
        {
            Support::Inline
        }
        InvokeStatic | InvokeDirect | InvokeStaticRange | InvokeDirectRange | MoveResult
        | MoveResultWide | MoveResultObject
            if mode == CompileMode::Method =>
        {
            Support::Punt
        }
        _ => Support::Unsupported,
    }
}

/// Why trace selection stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TraceStop {
    /// The last selected instruction is a goto or an if.
    Branch,
    /// The instruction at `dex_pc` cannot be part of a trace.
    Before { dex_pc: u32, invoke: bool },
    Length { dex_pc: u32 },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TraceSelection {
    pub entry: u32,
    pub insns: Vec<(u32, DecodedInstruction)>,
    pub stop: TraceStop,
}

/// Collects a straight-line run of trace-compilable instructions starting at `entry`.
pub fn select_trace(code: &[u16], entry: u32, max_len: usize) -> CompileResult<TraceSelection> {
    let mut insns = Vec::new();
    let mut pc = entry as usize;
    let stop = loop {
        if insns.len() >= max_len.max(1) {
            break TraceStop::Length { dex_pc: pc as u32 };
        }
        let insn = decoder::decode(code, pc)?;
        let opcode = insn.opcode;
        if insn.is_payload() || support(opcode, CompileMode::Trace) == Support::Unsupported {
            break TraceStop::Before {
                dex_pc: pc as u32,
                invoke: opcode.is_invoke(),
            };
        }
        insns.push((pc as u32, insn));
        if opcode.can_branch() {
            break TraceStop::Branch;
        }
        pc += insn.width;
    };
    if insns.is_empty() {
        return Err(CompileAbort::EmptyTrace { dex_pc: entry });
    }
    Ok(TraceSelection { entry, insns, stop })
}

fn push_mir(cu: &mut CompilationUnit<'_>, block: BlockId, pc: u32, insn: DecodedInstruction) {
    let index = cu.mirs.push(Mir {
        insn,
        offset: pc,
        ssa: SsaRep::default(),
        next: None,
        block,
        optimization_flags: 0,
    });
    match cu.blocks.get(block).last_mir {
        Some(last) => cu.mirs.get_mut(last).next = Some(index),
        None => cu.blocks.get_mut(block).first_mir = Some(index),
    }
    cu.blocks.get_mut(block).last_mir = Some(index);
}

fn new_block(cu: &mut CompilationUnit<'_>, kind: BlockKind, start: u32) -> BlockId {
    let id = cu.blocks.len();
    cu.blocks.push(BasicBlock::new(id, kind, start))
}

/// Loops back into the body, or leaves through a chaining cell.
fn trace_target(
    cu: &mut CompilationUnit<'_>,
    selection: &TraceSelection,
    body: BlockId,
    last_pc: u32,
    target: u32,
) -> BlockId {
    if target == selection.entry {
        body
    } else if target < last_pc {
        new_block(cu, BlockKind::ChainingCellBackwardBranch, target)
    } else {
        new_block(cu, BlockKind::ChainingCellNormal, target)
    }
}

/// Splits the whole method into basic blocks, with an entry block first and the exit block last.
pub fn build_method_blocks(cu: &mut CompilationUnit<'_>) -> CompileResult<()> {
    let code = cu.code;
    let mut insns = Vec::new();
    for item in InstructionIter::new(code) {
        let (pc, insn) = item?;
        if !insn.is_payload() {
            insns.push((pc as u32, insn));
        }
    }
    if insns.is_empty() {
        return Err(CompileAbort::NoCode);
    }
    let starts: BTreeSet<u32> = insns.iter().map(|(pc, _)| *pc).collect();

    let mut leaders = BTreeSet::from([0u32]);
    for (index, (pc, insn)) in insns.iter().enumerate() {
        for target in static_targets(code, *pc, insn)? {
            if !starts.contains(&target) {
                return Err(CompileAbort::Internal(format!(
                    "branch at 0x{pc:04x} lands inside an instruction at 0x{target:04x}"
                )));
            }
            leaders.insert(target);
        }
        if insn.opcode.ends_block() {
            if let Some((next, _)) = insns.get(index + 1) {
                leaders.insert(*next);
            }
        }
    }

    let entry = new_block(cu, BlockKind::Entry, 0);
    let mut block_at = BTreeMap::new();
    for leader in &leaders {
        let id = new_block(cu, BlockKind::DalvikByteCode, *leader);
        block_at.insert(*leader, id);
    }
    let mut current = entry;
    for (pc, insn) in &insns {
        if let Some(id) = block_at.get(pc) {
            current = *id;
        }
        push_mir(cu, current, *pc, *insn);
    }
    let exit = new_block(cu, BlockKind::Exit, 0);
    cu.blocks.get_mut(entry).fall_through = block_at.get(&0).copied();

    for (_, id) in block_at.iter() {
        let block = cu.blocks.get(*id);
        let Some(last) = block.last_mir else {
            continue;
        };
        let mir = cu.mirs.get(last);
        let opcode = mir.insn.opcode;
        let next_pc = mir.offset + mir.insn.width as u32;
        let mut taken = None;
        let mut fall_through = None;
        if opcode.can_branch() {
            if let Some(offset) = mir.insn.branch_offset() {
                let target = (mir.offset as i64 + offset as i64) as u32;
                taken = block_at.get(&target).copied();
            }
        }
        if opcode.is_return() {
            fall_through = Some(exit);
        } else if opcode.can_continue() {
            fall_through = block_at.get(&next_pc).copied();
        }
        let block = cu.blocks.get_mut(*id);
        block.taken = taken;
        block.fall_through = fall_through;
    }
    Ok(())
}

/// Branch and switch targets of one instruction, as absolute dex pcs.
pub fn static_targets(
    code: &[u16],
    pc: u32,
    insn: &DecodedInstruction,
) -> CompileResult<Vec<u32>> {
    let opcode = insn.opcode;
    let absolute = |offset: i32| (pc as i64 + offset as i64) as u32;
    if opcode.can_branch() {
        return Ok(insn.branch_offset().map(absolute).into_iter().collect());
    }
    if opcode.can_switch() {
        let payload = absolute(insn.v_b as i32) as usize;
        let targets = if opcode == Opcode::PackedSwitch {
            decoder::read_packed_switch(code, payload)?.targets
        } else {
            decoder::read_sparse_switch(code, payload)?
                .into_iter()
                .map(|(_, target)| target)
                .collect()
        };
        return Ok(targets.into_iter().map(absolute).collect());
    }
    Ok(Vec::new())
}

/// Builds the single-body block graph of a trace plus its chaining cells.
pub fn build_trace_blocks(
    cu: &mut CompilationUnit<'_>,
    selection: &TraceSelection,
) -> CompileResult<()> {
    let entry = new_block(cu, BlockKind::Entry, selection.entry);
    let body = new_block(cu, BlockKind::DalvikByteCode, selection.entry);
    cu.blocks.get_mut(entry).fall_through = Some(body);
    for (pc, insn) in &selection.insns {
        push_mir(cu, body, *pc, *insn);
    }
    let Some(&(last_pc, last)) = selection.insns.last() else {
        return Err(CompileAbort::EmptyTrace {
            dex_pc: selection.entry,
        });
    };
    let (taken, fall_through) = match selection.stop {
        TraceStop::Branch => {
            let offset = last.branch_offset().unwrap_or(0);
            let target = (last_pc as i64 + offset as i64) as u32;
            let taken = trace_target(cu, selection, body, last_pc, target);
            let fall_through = if last.opcode.can_continue() {
                let next = last_pc + last.width as u32;
                Some(trace_target(cu, selection, body, last_pc, next))
            } else {
                None
            };
            (Some(taken), fall_through)
        }
        TraceStop::Before { dex_pc, invoke } => {
            let kind = if invoke {
                BlockKind::ChainingCellHot
            } else {
                BlockKind::ChainingCellNormal
            };
            (None, Some(new_block(cu, kind, dex_pc)))
        }
        TraceStop::Length { dex_pc } => {
            (None, Some(new_block(cu, BlockKind::ChainingCellNormal, dex_pc)))
        }
    };
    let block = cu.blocks.get_mut(body);
    block.taken = taken;
    block.fall_through = fall_through;
    new_block(cu, BlockKind::Exit, 0);
    Ok(())
}

/// Block whose first instruction is at `dex_pc`.
pub fn block_at(cu: &CompilationUnit<'_>, dex_pc: u32) -> Option<BlockId> {
    cu.blocks
        .iter()
        .find(|block| block.kind == BlockKind::DalvikByteCode && block.start_offset == dex_pc)
        .map(|block| block.id)
}

/// Every successor, switch targets included.
pub fn successors(cu: &CompilationUnit<'_>, id: BlockId) -> Vec<BlockId> {
    let block = cu.blocks.get(id);
    let mut out: Vec<BlockId> = block.taken.into_iter().chain(block.fall_through).collect();
    if let Some(last) = block.last_mir {
        let mir = cu.mirs.get(last);
        if mir.insn.opcode.can_switch() {
            if let Ok(targets) = static_targets(cu.code, mir.offset, &mir.insn) {
                out.extend(targets.into_iter().filter_map(|pc| block_at(cu, pc)));
            }
        }
    }
    out.sort_unstable();
    out.dedup();
    out
}

/// Iterates the MIR indices of one block in order.
pub fn block_mirs(cu: &CompilationUnit<'_>, id: BlockId) -> Vec<usize> {
    let mut out = Vec::new();
    let mut next = cu.blocks.get(id).first_mir;
    while let Some(index) = next {
        out.push(index);
        next = cu.mirs.get(index).next;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembler::assemble_method;
    use crate::compiler::arena::Arena;
    use crate::compiler::ralloc::RegisterPool;
    use crate::isa::InstructionSet;
    use crate::method::MethodTable;

    fn unit<'a>(arena: &'a Arena, source: &str, mode: CompileMode) -> CompilationUnit<'a> {
        let table = MethodTable::new();
        let builder = assemble_method(source).expect("assemble");
        let method = table.register(builder);
        let pool = RegisterPool::new(arena, &[0, 1, 2, 3], &[], 8);
        CompilationUnit::new(arena, method, InstructionSet::Thumb2, mode, 0, pool).expect("unit")
    }

    const LOOP: &str = "
.method static LFoo;->sum(I)I
.registers 3
.ins 1
    const/4 v0, 0
    const/4 v1, 0
:loop
    if-ge v1, v2, :done
    add-int/2addr v0, v1
    add-int/lit8 v1, v1, 1
    goto :loop
:done
    return v0
.end method
";

    #[test]
    fn method_blocks_split_at_branch_targets() {
        let arena = Arena::new();
        let mut cu = unit(&arena, LOOP, CompileMode::Method);
        build_method_blocks(&mut cu).expect("blocks");
        let kinds: Vec<BlockKind> = cu.blocks.iter().map(|block| block.kind).collect();
        assert_eq!(kinds.first(), Some(&BlockKind::Entry));
        assert_eq!(kinds.last(), Some(&BlockKind::Exit));
        let starts: Vec<u32> = cu
            .blocks
            .iter()
            .filter(|block| block.kind == BlockKind::DalvikByteCode)
            .map(|block| block.start_offset)
            .collect();
        // 0: const, 1: const, 2: if-ge (2 units), 4: add/2addr, 5: add-lit8, 7: goto, 8: return
        assert_eq!(starts, vec![0, 2, 4, 8]);
        let loop_head = block_at(&cu, 2).expect("loop head");
        let body = block_at(&cu, 4).expect("body");
        assert_eq!(cu.blocks.get(body).taken, Some(loop_head));
        assert_eq!(block_mirs(&cu, body).len(), 3);
    }

    #[test]
    fn trace_selection_stops_after_branch() {
        let arena = Arena::new();
        let cu = unit(&arena, LOOP, CompileMode::Trace);
        let selection = select_trace(cu.code, 2, 32).expect("trace");
        assert_eq!(selection.stop, TraceStop::Branch);
        assert_eq!(selection.insns.len(), 1);
        let selection = select_trace(cu.code, 4, 32).expect("trace");
        assert_eq!(selection.insns.len(), 3);
        let selection = select_trace(cu.code, 4, 2).expect("trace");
        assert_eq!(selection.stop, TraceStop::Length { dex_pc: 7 });
    }

    #[test]
    fn trace_cells_follow_branch_direction() {
        let arena = Arena::new();
        let mut cu = unit(&arena, LOOP, CompileMode::Trace);
        let selection = select_trace(cu.code, 4, 32).expect("trace");
        build_trace_blocks(&mut cu, &selection).expect("blocks");
        let body = cu.blocks.get(1);
        let taken = cu.blocks.get(body.taken.expect("goto target"));
        assert_eq!(taken.kind, BlockKind::ChainingCellBackwardBranch);
        assert_eq!(taken.start_offset, 2);
        assert_eq!(body.fall_through, None);
    }

    #[test]
    fn return_cannot_start_a_trace() {
        let arena = Arena::new();
        let cu = unit(&arena, LOOP, CompileMode::Trace);
        assert_eq!(
            select_trace(cu.code, 8, 32),
            Err(CompileAbort::EmptyTrace { dex_pc: 8 })
        );
    }
}
