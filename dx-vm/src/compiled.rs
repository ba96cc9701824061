//! Metadata published alongside compiled code.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::compiler::lir::{CellKind, MachineInsn};
use crate::isa::InstructionSet;
use crate::method::MethodId;
use crate::stack::frame_layout::FrameInfo;

/// Vmap entry standing for the return-address register.
pub const VMAP_RETURN_ADDRESS_MARKER: u16 = 0xffff;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VRegKind {
    Reference,
    Int,
    Float,
    LongLo,
    LongHi,
    DoubleLo,
    DoubleHi,
}

impl VRegKind {
    pub fn is_float(self) -> bool {
        matches!(self, VRegKind::Float | VRegKind::DoubleLo | VRegKind::DoubleHi)
    }
}

/// Which vregs live in callee-save registers, in spill-mask bit order.
///
/// Core entries come first and end with the return-address marker (the highest core
/// spill); floating-point entries follow.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmapTable {
    entries: Vec<u16>,
}

impl VmapTable {
    pub fn new(entries: Vec<u16>) -> Self {
        Self { entries }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    /// Builds the table for a frame whose non-return core spills hold `promoted` vregs.
    pub fn from_promotions(core_spill_mask: u32, return_register: usize, promoted: &[(usize, u16)]) -> Self {
        let mut entries = Vec::new();
        for reg in 0..32usize {
            if core_spill_mask & (1 << reg) == 0 || reg == return_register {
                continue;
            }
            let vreg = promoted
                .iter()
                .find(|(promoted_reg, _)| *promoted_reg == reg)
                .map(|(_, vreg)| *vreg);
            assert!(vreg.is_some(), "spilled r{reg} holds no promoted vreg");
            if let Some(vreg) = vreg {
                entries.push(vreg);
            }
        }
        if core_spill_mask & (1 << return_register) != 0 {
            entries.push(VMAP_RETURN_ADDRESS_MARKER);
        }
        Self { entries }
    }

    pub fn entries(&self) -> &[u16] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Offset of `vreg` within its register group when it is held in a register.
    pub fn is_in_context(&self, vreg: u16, kind: VRegKind) -> Option<usize> {
        let want_float = kind.is_float();
        let mut in_floats = false;
        let mut float_start = 0;
        for (index, &entry) in self.entries.iter().enumerate() {
            if entry == VMAP_RETURN_ADDRESS_MARKER {
                in_floats = true;
                float_start = index + 1;
                continue;
            }
            if entry == vreg && in_floats == want_float {
                return Some(if in_floats { index - float_start } else { index });
            }
        }
        None
    }

    /// Physical register for the `offset`-th set bit of `spill_mask`.
    pub fn compute_register(spill_mask: u32, offset: usize, _kind: VRegKind) -> usize {
        let mut seen = 0;
        for reg in 0..32 {
            if spill_mask & (1 << reg) != 0 {
                if seen == offset {
                    return reg;
                }
                seen += 1;
            }
        }
        panic!("vmap offset {offset} beyond spill mask 0x{spill_mask:x}");
    }
}

/// Native offset ↔ dex pc.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingTable {
    /// Return sites and other exact safepoints.
    pub safepoints: Vec<(u32, u32)>,
    /// Start of each dalvik instruction, sorted by native offset.
    pub boundaries: Vec<(u32, u32)>,
}

impl MappingTable {
    pub fn dex_pc_for(&self, native_offset: u32) -> Option<u32> {
        if let Some(&(_, dex_pc)) = self
            .safepoints
            .iter()
            .find(|(offset, _)| *offset == native_offset)
        {
            return Some(dex_pc);
        }
        let index = self
            .boundaries
            .partition_point(|(offset, _)| *offset <= native_offset);
        index.checked_sub(1).map(|found| self.boundaries[found].1)
    }

    /// Start of the instruction at `dex_pc`, skipping the prologue entry.
    pub fn native_offset_for(&self, dex_pc: u32) -> Option<u32> {
        self.boundaries
            .iter()
            .rev()
            .find(|(_, pc)| *pc == dex_pc)
            .map(|(offset, _)| *offset)
    }
}

/// Native offset → bitmap of vregs holding references.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GcMap {
    pub entries: Vec<(u32, Vec<u8>)>,
}

impl GcMap {
    pub fn bitmap_at(&self, native_offset: u32) -> Option<&[u8]> {
        let index = self
            .entries
            .partition_point(|(offset, _)| *offset <= native_offset);
        index
            .checked_sub(1)
            .map(|found| self.entries[found].1.as_slice())
    }

    pub fn is_reference(&self, native_offset: u32, vreg: usize) -> bool {
        self.bitmap_at(native_offset).is_some_and(|bitmap| {
            bitmap
                .get(vreg / 8)
                .is_some_and(|byte| byte & (1 << (vreg % 8)) != 0)
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CodeKind {
    Method,
    Trace { entry_dex_pc: u32 },
}

/// Patchable exit of a trace. Unchained cells call the interpreter exit stub.
#[derive(Debug)]
pub struct ChainingCell {
    pub kind: CellKind,
    pub target_dex_pc: u32,
    /// Index of the cell's first instruction.
    pub insn_index: usize,
    pub native_offset: u32,
    /// Offset the exit stub sees as its return address; the data word sits here.
    pub return_offset: u32,
    chained_to: AtomicU32,
}

impl ChainingCell {
    pub fn new(
        kind: CellKind,
        target_dex_pc: u32,
        insn_index: usize,
        native_offset: u32,
        return_offset: u32,
    ) -> Self {
        Self {
            kind,
            target_dex_pc,
            insn_index,
            native_offset,
            return_offset,
            chained_to: AtomicU32::new(0),
        }
    }

    /// Absolute address of the trace this cell branches to, once chained.
    pub fn chained_to(&self) -> Option<u32> {
        match self.chained_to.load(Ordering::Acquire) {
            0 => None,
            addr => Some(addr),
        }
    }

    pub(crate) fn chain(&self, target: u32) -> bool {
        self.chained_to
            .compare_exchange(0, target, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn unchain(&self) {
        self.chained_to.store(0, Ordering::Release);
    }
}

pub struct CompiledCode {
    pub kind: CodeKind,
    pub isa: InstructionSet,
    pub method: MethodId,
    code_begin: u32,
    bytes: Mutex<Vec<u8>>,
    pub insns: Vec<MachineInsn>,
    frame: FrameInfo,
    vmap: VmapTable,
    pub mapping: MappingTable,
    pub gc_map: GcMap,
    pub cells: Vec<ChainingCell>,
    /// Vregs held in callee-save registers for the whole unit: (register, vreg).
    pub promoted: Vec<(usize, u16)>,
}

pub struct CompiledCodeParts {
    pub kind: CodeKind,
    pub isa: InstructionSet,
    pub method: MethodId,
    pub code_begin: u32,
    pub bytes: Vec<u8>,
    pub insns: Vec<MachineInsn>,
    pub frame: FrameInfo,
    pub vmap: VmapTable,
    pub mapping: MappingTable,
    pub gc_map: GcMap,
    pub cells: Vec<ChainingCell>,
    pub promoted: Vec<(usize, u16)>,
}

impl CompiledCode {
    pub fn new(parts: CompiledCodeParts) -> Self {
        Self {
            kind: parts.kind,
            isa: parts.isa,
            method: parts.method,
            code_begin: parts.code_begin,
            bytes: Mutex::new(parts.bytes),
            insns: parts.insns,
            frame: parts.frame,
            vmap: parts.vmap,
            mapping: parts.mapping,
            gc_map: parts.gc_map,
            cells: parts.cells,
            promoted: parts.promoted,
        }
    }

    pub fn code_begin(&self) -> u32 {
        self.code_begin
    }

    pub fn code_size(&self) -> u32 {
        self.bytes.lock().len() as u32
    }

    pub fn code_end(&self) -> u32 {
        self.code_begin + self.code_size()
    }

    pub fn contains_pc(&self, pc: u32) -> bool {
        pc >= self.code_begin && pc < self.code_end()
    }

    pub fn frame(&self) -> FrameInfo {
        self.frame
    }

    pub fn vmap(&self) -> &VmapTable {
        &self.vmap
    }

    pub fn bytes(&self) -> Vec<u8> {
        self.bytes.lock().clone()
    }

    pub fn patch_bytes(&self, offset: u32, patch: &[u8]) {
        let mut bytes = self.bytes.lock();
        let start = offset as usize;
        assert!(start + patch.len() <= bytes.len(), "patch past the end of the code");
        bytes[start..start + patch.len()].copy_from_slice(patch);
    }

    pub fn insn_index_at(&self, native_offset: u32) -> Option<usize> {
        self.insns
            .binary_search_by_key(&native_offset, |insn| insn.offset)
            .ok()
    }

    pub fn cell_at_insn(&self, index: usize) -> Option<&ChainingCell> {
        self.cells.iter().find(|cell| cell.insn_index == index)
    }

    pub fn dex_pc_at(&self, pc: u32) -> Option<u32> {
        if !self.contains_pc(pc) && pc != self.code_end() {
            return None;
        }
        self.mapping.dex_pc_for(pc - self.code_begin)
    }

    pub fn disassemble(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "{:?} {} @0x{:08x} size={} frame={} core=0x{:x} fp=0x{:x}",
            self.kind,
            self.isa,
            self.code_begin,
            self.code_size(),
            self.frame.frame_size,
            self.frame.core_spill_mask,
            self.frame.fp_spill_mask
        );
        let mut last_dex = None;
        for insn in &self.insns {
            if last_dex != Some(insn.dalvik_offset) {
                let _ = writeln!(out, "  -------- dalvik offset 0x{:04x}", insn.dalvik_offset);
                last_dex = Some(insn.dalvik_offset);
            }
            let _ = writeln!(out, "  {insn}");
        }
        out
    }
}

impl std::fmt::Debug for CompiledCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledCode")
            .field("kind", &self.kind)
            .field("isa", &self.isa)
            .field("method", &self.method)
            .field("code_begin", &format_args!("0x{:08x}", self.code_begin))
            .field("frame", &self.frame)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vmap_offsets_are_group_relative() {
        // r5 holds v3, r6 holds v1, lr spilled, s16 holds v2 as a float.
        let table = VmapTable::new(vec![3, 1, VMAP_RETURN_ADDRESS_MARKER, 2]);
        assert_eq!(table.is_in_context(3, VRegKind::Int), Some(0));
        assert_eq!(table.is_in_context(1, VRegKind::Reference), Some(1));
        assert_eq!(table.is_in_context(2, VRegKind::Float), Some(0));
        assert_eq!(table.is_in_context(2, VRegKind::Int), None);
        assert_eq!(table.is_in_context(0, VRegKind::Int), None);
    }

    #[test]
    fn compute_register_walks_the_mask() {
        let mask = 1 << 5 | 1 << 6 | 1 << 14;
        assert_eq!(VmapTable::compute_register(mask, 0, VRegKind::Int), 5);
        assert_eq!(VmapTable::compute_register(mask, 1, VRegKind::Int), 6);
        assert_eq!(VmapTable::compute_register(mask, 2, VRegKind::Int), 14);
    }

    #[test]
    fn promotions_follow_bit_order() {
        let table = VmapTable::from_promotions(1 << 7 | 1 << 5 | 1 << 14, 14, &[(7, 0), (5, 4)]);
        assert_eq!(table.entries(), &[4, 0, VMAP_RETURN_ADDRESS_MARKER]);
    }

    #[test]
    fn mapping_prefers_exact_safepoints() {
        let mapping = MappingTable {
            safepoints: vec![(0x14, 0x6)],
            boundaries: vec![(0x0, 0x0), (0x8, 0x2), (0x10, 0x4)],
        };
        assert_eq!(mapping.dex_pc_for(0x14), Some(0x6));
        assert_eq!(mapping.dex_pc_for(0xa), Some(0x2));
        assert_eq!(mapping.native_offset_for(0x4), Some(0x10));
    }

    #[test]
    fn prologue_maps_to_the_entry_instruction() {
        let mapping = MappingTable {
            safepoints: Vec::new(),
            boundaries: vec![(0x0, 0x0), (0xc, 0x0), (0x14, 0x2)],
        };
        assert_eq!(mapping.dex_pc_for(0x4), Some(0x0));
        assert_eq!(mapping.native_offset_for(0x0), Some(0xc));
        assert_eq!(mapping.native_offset_for(0x2), Some(0x14));
    }

    #[test]
    fn gc_map_floor_lookup() {
        let map = GcMap {
            entries: vec![(0, vec![0b0000_0010]), (0x10, vec![0b0000_0101])],
        };
        assert!(map.is_reference(0x4, 1));
        assert!(!map.is_reference(0x12, 1));
        assert!(map.is_reference(0x12, 2));
    }
}
