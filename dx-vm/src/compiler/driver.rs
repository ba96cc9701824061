//! Compilation driver.
//!
//! One request runs initialise → build blocks → translate → patch → finalise → publish. Any
//! [`CompileAbort`] on the way is caught here, once: the method is marked interpret-only and
//! the arena is rewound for the next unit either way.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::compiled::{
    ChainingCell, CodeKind, CompiledCode, CompiledCodeParts, GcMap, MappingTable, VmapTable,
};
use crate::compiler::arena::Arena;
use crate::compiler::code_cache::CodeCache;
use crate::compiler::codegen::assemble::{Assembled, assemble};
use crate::compiler::codegen::translate::gen_code;
use crate::compiler::codegen::{CodegenTarget, TargetInfo, target_for};
use crate::compiler::dataflow::{compute_ssa, infer_references, promotion_candidates};
use crate::compiler::lir::{CellKind, LirOp, PseudoOp};
use crate::compiler::local_opt::eliminate_redundant_loads;
use crate::compiler::mir::{build_method_blocks, build_trace_blocks, select_trace};
use crate::compiler::ralloc::RegisterPool;
use crate::compiler::{CompilationUnit, CompileAbort, CompileMode, CompileResult};
use crate::isa::InstructionSet;
use crate::method::Method;
use crate::stack::frame_layout::{FrameInfo, MAX_FRAME_SIZE, compute_frame_size};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompilerOptions {
    pub isa: InstructionSet,
    pub promotion_enabled: bool,
    pub max_trace_len: usize,
}

impl Default for CompilerOptions {
    fn default() -> Self {
        Self {
            isa: InstructionSet::Thumb2,
            promotion_enabled: true,
            max_trace_len: 32,
        }
    }
}

/// What one request compiles.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnitKind {
    Method,
    Trace { entry_dex_pc: u32 },
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompileStats {
    pub methods: u64,
    pub traces: u64,
    pub aborts: u64,
    pub code_bytes: u64,
    pub punts: u64,
}

pub struct CompilerDriver {
    options: CompilerOptions,
    arena: Arena,
    cache: Arc<CodeCache>,
    stats: CompileStats,
}

impl CompilerDriver {
    pub fn new(options: CompilerOptions, cache: Arc<CodeCache>) -> Self {
        Self {
            options,
            arena: Arena::new(),
            cache,
            stats: CompileStats::default(),
        }
    }

    pub fn options(&self) -> &CompilerOptions {
        &self.options
    }

    pub fn stats(&self) -> CompileStats {
        self.stats
    }

    pub fn cache(&self) -> &Arc<CodeCache> {
        &self.cache
    }

    pub fn arena(&self) -> &Arena {
        &self.arena
    }

    /// Compiles the whole method and publishes it on `method`.
    pub fn compile_method(&mut self, method: &Arc<Method>) -> CompileResult<Arc<CompiledCode>> {
        if let Some(code) = method.compiled() {
            return Ok(Arc::clone(code));
        }
        let code = self.compile(method, UnitKind::Method)?;
        if !method.publish_code(Arc::clone(&code)) {
            debug!(method = %method.pretty_name(), "method already published");
        }
        Ok(method.compiled().map_or(code, Arc::clone))
    }

    /// Compiles the trace starting at `entry_dex_pc`; publishing it is up to the caller.
    pub fn compile_trace(
        &mut self,
        method: &Arc<Method>,
        entry_dex_pc: u32,
    ) -> CompileResult<Arc<CompiledCode>> {
        self.compile(method, UnitKind::Trace { entry_dex_pc })
    }

    fn compile(&mut self, method: &Arc<Method>, kind: UnitKind) -> CompileResult<Arc<CompiledCode>> {
        debug!(method = %method.pretty_name(), isa = %self.options.isa, ?kind, "compile attempt");
        let result = compile_unit(&self.arena, &self.cache, &self.options, method, kind);
        let arena_bytes = self.arena.bytes_in_use();
        self.arena.reset();
        match &result {
            Ok((code, punts)) => {
                match kind {
                    UnitKind::Method => self.stats.methods += 1,
                    UnitKind::Trace { .. } => self.stats.traces += 1,
                }
                self.stats.code_bytes += code.code_size() as u64;
                self.stats.punts += *punts as u64;
                info!(
                    method = %method.pretty_name(),
                    isa = %self.options.isa,
                    ?kind,
                    code_begin = format_args!("0x{:08x}", code.code_begin()),
                    size = code.code_size(),
                    punts,
                    arena_bytes,
                    "compiled"
                );
            }
            Err(abort) => {
                self.stats.aborts += 1;
                if kind == UnitKind::Method {
                    method.mark_interpret_only();
                }
                warn!(
                    method = %method.pretty_name(),
                    isa = %self.options.isa,
                    ?kind,
                    %abort,
                    "compilation aborted"
                );
            }
        }
        result.map(|(code, _)| code)
    }
}

impl std::fmt::Debug for CompilerDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompilerDriver")
            .field("options", &self.options)
            .field("stats", &self.stats)
            .finish()
    }
}

fn compile_unit(
    arena: &Arena,
    cache: &CodeCache,
    options: &CompilerOptions,
    method: &Arc<Method>,
    kind: UnitKind,
) -> CompileResult<(Arc<CompiledCode>, u32)> {
    let target = target_for(options.isa);
    let info = target.info();
    let num_regs = method.code_item().ok_or(CompileAbort::NoCode)?.registers_size as usize;
    let pool = RegisterPool::new(arena, info.core_temps, info.fp_temps, num_regs);
    let (mode, entry_dex_pc) = match kind {
        UnitKind::Method => (CompileMode::Method, 0),
        UnitKind::Trace { entry_dex_pc } => (CompileMode::Trace, entry_dex_pc),
    };
    let mut cu = CompilationUnit::new(arena, Arc::clone(method), options.isa, mode, entry_dex_pc, pool)?;
    cu.promotion_enabled = options.promotion_enabled && cu.is_method();

    match kind {
        UnitKind::Method => build_method_blocks(&mut cu)?,
        UnitKind::Trace { entry_dex_pc } => {
            let selection = select_trace(cu.code, entry_dex_pc, options.max_trace_len)?;
            build_trace_blocks(&mut cu, &selection)?;
        }
    }
    compute_ssa(&mut cu)?;
    let promoted = if cu.promotion_enabled {
        promote(&mut cu, info)
    } else {
        Vec::new()
    };
    if cu.is_method() {
        cu.frame = method_frame(&cu, info, &promoted)?;
        infer_references(&mut cu);
    }

    gen_code(&mut cu, target)?;
    eliminate_redundant_loads(&mut cu, target);

    let code = cache.install(|code_begin| {
        let assembled = assemble(&mut cu, target, code_begin)?;
        finalise(&cu, target, code_begin, assembled, &promoted, kind)
    })?;
    Ok((code, cu.punts))
}

/// Hands the most used candidates the callee-save registers, in the backend's order.
fn promote(cu: &mut CompilationUnit<'_>, info: &TargetInfo) -> Vec<(usize, u16)> {
    let mut promoted = Vec::new();
    for ((vreg, uses), &reg) in promotion_candidates(cu).into_iter().zip(info.promotable) {
        cu.promoted[vreg as usize] = reg;
        promoted.push((reg as usize, vreg as u16));
        debug!(vreg, uses, reg, "promoted vreg");
    }
    promoted
}

fn method_frame(
    cu: &CompilationUnit<'_>,
    info: &TargetInfo,
    promoted: &[(usize, u16)],
) -> CompileResult<FrameInfo> {
    let core_mask = promoted
        .iter()
        .fold(1u32 << info.return_register(), |mask, (reg, _)| mask | 1 << reg);
    let frame_size = compute_frame_size(
        core_mask.count_ones(),
        0,
        cu.num_locals,
        cu.method.outs_size() as u32,
        0,
    );
    if frame_size > MAX_FRAME_SIZE {
        return Err(CompileAbort::FrameTooLarge { frame_size });
    }
    Ok(FrameInfo::new(frame_size, core_mask, 0))
}

fn push_gc_entry(gc_map: &mut GcMap, offset: u32, bitmap: &[u8]) {
    match gc_map.entries.last_mut() {
        Some((last, existing)) if *last == offset => *existing = bitmap.to_vec(),
        _ => gc_map.entries.push((offset, bitmap.to_vec())),
    }
}

/// Builds the mapping table, GC map, chaining cells and vmap from the assembled LIR.
fn finalise(
    cu: &CompilationUnit<'_>,
    target: &dyn CodegenTarget,
    code_begin: u32,
    assembled: Assembled,
    promoted: &[(usize, u16)],
    kind: UnitKind,
) -> CompileResult<CompiledCode> {
    let mut mapping = MappingTable::default();
    let mut gc_map = GcMap::default();
    let mut cells = Vec::new();
    let mut open_cell: Option<(CellKind, u32, u32)> = None;

    for index in 0..cu.lirs.len() {
        let lir = cu.lirs.get(index);
        let LirOp::Pseudo(op) = lir.opcode else {
            continue;
        };
        if lir.is_nop {
            continue;
        }
        let dex_pc = lir.operands[0] as u32;
        match op {
            PseudoOp::DalvikBoundary => {
                mapping.boundaries.push((lir.offset, dex_pc));
                if let Some(bitmap) = cu.reference_maps.get(&dex_pc) {
                    push_gc_entry(&mut gc_map, lir.offset, bitmap);
                }
            }
            PseudoOp::ChainingCell(cell_kind) => open_cell = Some((cell_kind, dex_pc, lir.offset)),
            PseudoOp::Safepoint => {
                mapping.safepoints.push((lir.offset, dex_pc));
                if let Some((cell_kind, target_dex_pc, native_offset)) = open_cell.take() {
                    let insn_index = assembled
                        .insns
                        .binary_search_by_key(&native_offset, |insn| insn.offset)
                        .map_err(|_| {
                            CompileAbort::Internal(format!(
                                "chaining cell at 0x{native_offset:x} has no instruction"
                            ))
                        })?;
                    cells.push(ChainingCell::new(
                        cell_kind,
                        target_dex_pc,
                        insn_index,
                        native_offset,
                        lir.offset,
                    ));
                } else if let Some(bitmap) = cu.reference_maps.get(&dex_pc) {
                    push_gc_entry(&mut gc_map, lir.offset, bitmap);
                }
            }
            _ => {}
        }
    }
    let entry_dex_pc = match kind {
        UnitKind::Method => 0,
        UnitKind::Trace { entry_dex_pc } => entry_dex_pc,
    };
    if mapping.boundaries.first().is_none_or(|(offset, _)| *offset != 0) {
        // Prologue pcs report the entry instruction.
        mapping.boundaries.insert(0, (0, entry_dex_pc));
    }

    let info = target.info();
    let vmap = if cu.is_method() {
        VmapTable::from_promotions(cu.frame.core_spill_mask, info.return_register(), promoted)
    } else {
        VmapTable::empty()
    };
    let code_kind = match kind {
        UnitKind::Method => CodeKind::Method,
        UnitKind::Trace { entry_dex_pc } => CodeKind::Trace { entry_dex_pc },
    };
    Ok(CompiledCode::new(CompiledCodeParts {
        kind: code_kind,
        isa: cu.isa,
        method: cu.method.id(),
        code_begin,
        bytes: assembled.bytes,
        insns: assembled.insns,
        frame: cu.frame,
        vmap,
        mapping,
        gc_map,
        cells,
        promoted: promoted.to_vec(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address_space::INTERPRETER_EXIT_PC;
    use crate::assembler::assemble_method;
    use crate::compiled::VMAP_RETURN_ADDRESS_MARKER;
    use crate::method::MethodTable;

    const ADD: &str = "
.method static LFoo;->add(II)I
.registers 3
.ins 2
    add-int v0, v1, v2
    return v0
.end method
";

    const COUNT: &str = "
.method static LFoo;->count(I)I
.registers 3
.ins 1
    const/4 v0, 0
:loop
    if-ge v0, v2, :done
    add-int/lit8 v0, v0, 1
    goto :loop
:done
    return v0
.end method
";

    fn driver(isa: InstructionSet) -> CompilerDriver {
        let options = CompilerOptions {
            isa,
            ..CompilerOptions::default()
        };
        CompilerDriver::new(options, Arc::new(CodeCache::new()))
    }

    #[test]
    fn methods_publish_with_frame_and_mapping() {
        for isa in [InstructionSet::Thumb2, InstructionSet::X86, InstructionSet::Mips] {
            let table = MethodTable::new();
            let method = table.register(assemble_method(ADD).expect("assemble"));
            let mut driver = driver(isa);
            let code = driver.compile_method(&method).expect("compile");
            assert_eq!(method.entry_point(), Some(code.code_begin()));
            let frame = code.frame();
            assert_eq!(frame.frame_size % 16, 0);
            assert!(frame.core_spill_mask & (1 << isa.return_address_register()) != 0);
            assert_eq!(code.vmap().entries().last(), Some(&VMAP_RETURN_ADDRESS_MARKER));
            assert_eq!(code.mapping.dex_pc_for(0), Some(0));
            let body = code.mapping.native_offset_for(0).expect("first instruction");
            assert!(body > 0, "{isa}: prologue is empty");
            assert_eq!(code.mapping.dex_pc_for(body - 1), Some(0));
            assert!(code.cells.is_empty());
            assert_eq!(driver.arena().bytes_in_use(), 0);
            assert_eq!(driver.stats().methods, 1);
        }
    }

    #[test]
    fn promotion_is_recorded_in_the_vmap() {
        let table = MethodTable::new();
        let method = table.register(assemble_method(COUNT).expect("assemble"));
        let mut driver = driver(InstructionSet::Thumb2);
        let code = driver.compile_method(&method).expect("compile");
        assert!(!code.promoted.is_empty());
        let (reg, vreg) = code.promoted[0];
        assert_eq!(vreg, 0);
        assert!(code.frame().core_spill_mask & (1 << reg) != 0);
        assert!(code.vmap().is_in_context(0, crate::compiled::VRegKind::Int).is_some());
    }

    #[test]
    fn unsupported_opcode_marks_the_method_interpret_only() {
        let table = MethodTable::new();
        let method = table.register(
            assemble_method(
                "
.method LFoo;->virt()V
.registers 1
.ins 1
    invoke-virtual {v0}, method@1
    return-void
.end method
",
            )
            .expect("assemble"),
        );
        let mut driver = driver(InstructionSet::Mips);
        let err = driver.compile_method(&method).expect_err("must abort");
        assert!(matches!(err, CompileAbort::UnsupportedOpcode { dex_pc: 0, .. }));
        assert!(method.is_interpret_only());
        assert!(method.compiled().is_none());
        assert_eq!(driver.arena().bytes_in_use(), 0);
        assert_eq!(driver.stats().aborts, 1);
    }

    #[test]
    fn traces_leave_through_chaining_cells() {
        let table = MethodTable::new();
        let method = table.register(assemble_method(COUNT).expect("assemble"));
        let mut driver = driver(InstructionSet::X86);
        // `if-ge` at dex pc 1 ends the trace; both exits leave the trace.
        let code = driver.compile_trace(&method, 1).expect("trace");
        assert_eq!(code.kind, CodeKind::Trace { entry_dex_pc: 1 });
        assert_eq!(code.cells.len(), 2);
        let targets: Vec<u32> = code.cells.iter().map(|cell| cell.target_dex_pc).collect();
        assert!(targets.contains(&3));
        assert!(targets.contains(&6));
        for cell in &code.cells {
            let insn = &code.insns[cell.insn_index];
            assert_eq!(insn.call_target, Some(INTERPRETER_EXIT_PC));
            assert_eq!(insn.offset + insn.size, cell.return_offset);
            assert_eq!(code.mapping.dex_pc_for(cell.return_offset), Some(cell.target_dex_pc));
        }
        assert!(method.compiled().is_none());
    }
}
