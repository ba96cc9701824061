//! Code cache and JIT table.
//!
//! Compiled units are carved from one address range by a bump pointer. Publication takes the
//! cache lock after every byte and every metadata table of the unit is built, so a reader
//! that finds a unit through [`CodeCache::lookup`] or the [`JitTable`] sees it complete.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::address_space::{CODE_CACHE_BASE, CODE_CACHE_SIZE};
use crate::compiled::CompiledCode;
use crate::compiler::codegen::target_for;
use crate::compiler::{CompileAbort, CompileResult};
use crate::method::MethodId;

const UNIT_ALIGNMENT: u32 = 16;

struct CacheState {
    next: u32,
    units: BTreeMap<u32, Arc<CompiledCode>>,
    /// Call bytes displaced by chaining, keyed by absolute cell address.
    displaced: HashMap<u32, Vec<u8>>,
}

pub struct CodeCache {
    base: u32,
    end: u32,
    state: Mutex<CacheState>,
}

impl Default for CodeCache {
    fn default() -> Self {
        Self::new()
    }
}

impl CodeCache {
    pub fn new() -> Self {
        Self::with_range(CODE_CACHE_BASE, CODE_CACHE_SIZE)
    }

    pub fn with_range(base: u32, size: u32) -> Self {
        Self {
            base,
            end: base + size,
            state: Mutex::new(CacheState {
                next: base,
                units: BTreeMap::new(),
                displaced: HashMap::new(),
            }),
        }
    }

    pub fn bytes_used(&self) -> u32 {
        self.state.lock().next - self.base
    }

    pub fn capacity(&self) -> u32 {
        self.end - self.base
    }

    pub fn len(&self) -> usize {
        self.state.lock().units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Builds a unit at the next free address and publishes it.
    ///
    /// `build` receives the address the code will live at. The lock is held across the build
    /// so the address cannot be handed out twice.
    pub fn install(
        &self,
        build: impl FnOnce(u32) -> CompileResult<CompiledCode>,
    ) -> CompileResult<Arc<CompiledCode>> {
        let mut state = self.state.lock();
        let code_begin = state.next;
        let code = build(code_begin)?;
        let size = code.code_size();
        let end = code_begin
            .checked_add(size)
            .filter(|end| *end <= self.end)
            .ok_or_else(|| {
                warn!(requested = size, used = code_begin - self.base, "code cache full");
                CompileAbort::CodeCacheFull { requested: size }
            })?;
        state.next = end.next_multiple_of(UNIT_ALIGNMENT).min(self.end);
        let code = Arc::new(code);
        state.units.insert(code_begin, Arc::clone(&code));
        debug!(
            code_begin = format_args!("0x{code_begin:08x}"),
            size, "installed compiled unit"
        );
        Ok(code)
    }

    /// Unit whose code covers absolute address `pc`.
    pub fn lookup(&self, pc: u32) -> Option<Arc<CompiledCode>> {
        let state = self.state.lock();
        let (_, code) = state.units.range(..=pc).next_back()?;
        code.contains_pc(pc).then(|| Arc::clone(code))
    }

    /// Points cell `cell_index` of `from` at the code starting at `to`.
    ///
    /// Returns false when the cell is already chained or the target is out of reach.
    pub fn chain(&self, from: &CompiledCode, cell_index: usize, to: u32) -> bool {
        let Some(cell) = from.cells.get(cell_index) else {
            return false;
        };
        let cell_addr = from.code_begin() + cell.native_offset;
        let Some(patch) = target_for(from.isa).chain_patch(cell_addr, to) else {
            debug!(
                from = format_args!("0x{cell_addr:08x}"),
                to = format_args!("0x{to:08x}"),
                "chaining target out of reach"
            );
            return false;
        };
        let mut state = self.state.lock();
        if !cell.chain(to) {
            return false;
        }
        let start = cell.native_offset as usize;
        let original = from.bytes()[start..start + patch.len()].to_vec();
        state.displaced.insert(cell_addr, original);
        from.patch_bytes(cell.native_offset, &patch);
        info!(
            from = format_args!("0x{cell_addr:08x}"),
            to = format_args!("0x{to:08x}"),
            target_dex_pc = cell.target_dex_pc,
            "chained trace exit"
        );
        true
    }

    /// Restores every chained cell to its interpreter-exit call.
    pub fn unchain_all(&self) -> usize {
        let mut state = self.state.lock();
        let mut restored = 0;
        let CacheState {
            units, displaced, ..
        } = &mut *state;
        for code in units.values() {
            for cell in &code.cells {
                if cell.chained_to().is_none() {
                    continue;
                }
                let cell_addr = code.code_begin() + cell.native_offset;
                if let Some(original) = displaced.remove(&cell_addr) {
                    code.patch_bytes(cell.native_offset, &original);
                }
                cell.unchain();
                restored += 1;
            }
        }
        if restored > 0 {
            info!(restored, "unchained trace exits");
        }
        restored
    }
}

impl std::fmt::Debug for CodeCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodeCache")
            .field("base", &format_args!("0x{:08x}", self.base))
            .field("used", &self.bytes_used())
            .field("units", &self.len())
            .finish()
    }
}

/// Compiled traces keyed by `(method, entry dex pc)`.
#[derive(Debug, Default)]
pub struct JitTable {
    traces: RwLock<HashMap<(MethodId, u32), Arc<CompiledCode>>>,
}

impl JitTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes a trace; an entry that is already compiled keeps its first trace.
    pub fn publish(&self, method: MethodId, entry_dex_pc: u32, code: Arc<CompiledCode>) -> bool {
        let mut traces = self.traces.write();
        if traces.contains_key(&(method, entry_dex_pc)) {
            return false;
        }
        traces.insert((method, entry_dex_pc), code);
        true
    }

    pub fn lookup(&self, method: MethodId, entry_dex_pc: u32) -> Option<Arc<CompiledCode>> {
        self.traces.read().get(&(method, entry_dex_pc)).cloned()
    }

    pub fn len(&self) -> usize {
        self.traces.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.traces.write().clear();
    }

    /// Entries sorted by method and dex pc.
    pub fn entries(&self) -> Vec<(MethodId, u32, Arc<CompiledCode>)> {
        let mut entries: Vec<_> = self
            .traces
            .read()
            .iter()
            .map(|((method, pc), code)| (*method, *pc, Arc::clone(code)))
            .collect();
        entries.sort_by_key(|(method, pc, _)| (method.0, *pc));
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiled::{CodeKind, CompiledCodeParts, GcMap, MappingTable, VmapTable};
    use crate::isa::InstructionSet;
    use crate::stack::frame_layout::FrameInfo;

    fn unit(code_begin: u32, size: usize) -> CompiledCode {
        CompiledCode::new(CompiledCodeParts {
            kind: CodeKind::Trace { entry_dex_pc: 0 },
            isa: InstructionSet::Mips,
            method: MethodId(1),
            code_begin,
            bytes: vec![0; size],
            insns: Vec::new(),
            frame: FrameInfo::new(0, 0, 0),
            vmap: VmapTable::empty(),
            mapping: MappingTable::default(),
            gc_map: GcMap::default(),
            cells: Vec::new(),
            promoted: Vec::new(),
        })
    }

    #[test]
    fn units_are_aligned_and_found_by_pc() {
        let cache = CodeCache::with_range(0x1000, 0x100);
        let first = cache.install(|begin| Ok(unit(begin, 10))).expect("first");
        let second = cache.install(|begin| Ok(unit(begin, 8))).expect("second");
        assert_eq!(first.code_begin(), 0x1000);
        assert_eq!(second.code_begin(), 0x1010);
        let found = cache.lookup(0x1014).expect("second unit");
        assert_eq!(found.code_begin(), 0x1010);
        assert!(cache.lookup(0x100c).is_none());
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn exhaustion_is_a_compile_abort() {
        let cache = CodeCache::with_range(0x1000, 0x20);
        cache.install(|begin| Ok(unit(begin, 16))).expect("fits");
        let err = cache
            .install(|begin| Ok(unit(begin, 32)))
            .expect_err("too large");
        assert_eq!(err, CompileAbort::CodeCacheFull { requested: 32 });
        assert_eq!(cache.bytes_used(), 16);
    }

    #[test]
    fn jit_table_keeps_the_first_trace() {
        let table = JitTable::new();
        let a = Arc::new(unit(0x1000, 4));
        let b = Arc::new(unit(0x2000, 4));
        assert!(table.publish(MethodId(1), 4, a));
        assert!(!table.publish(MethodId(1), 4, b));
        let found = table.lookup(MethodId(1), 4).expect("trace");
        assert_eq!(found.code_begin(), 0x1000);
        assert!(table.lookup(MethodId(1), 6).is_none());
    }
}
