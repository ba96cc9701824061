//! Local register allocation: a pool of temps that cache vreg values within a block.
//!
//! Values are always written back to their home, so a cached copy can be dropped at any point
//! without a flush. Promoted vregs live in callee-save registers for the whole method.

use crate::compiler::arena::Arena;
use crate::compiler::growable_list::GrowableList;
use crate::compiler::lir::{INVALID_REG, LirId, is_fp_reg};
use crate::compiler::mir::Mir;
use crate::compiler::{CompilationUnit, CompileAbort, CompileResult};

pub const INVALID_SREG: i32 = -1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegisterInfo {
    pub reg: i32,
    pub in_use: bool,
    pub is_temp: bool,
    /// Holds the current value of `s_reg`.
    pub live: bool,
    pub dirty: bool,
    pub pair: bool,
    pub partner: i32,
    pub s_reg: i32,
    /// Reserved for a fixed-register sequence such as a call.
    pub locked: bool,
}

impl RegisterInfo {
    fn temp(reg: i32) -> Self {
        Self {
            reg,
            in_use: false,
            is_temp: true,
            live: false,
            dirty: false,
            pair: false,
            partner: INVALID_REG,
            s_reg: INVALID_SREG,
            locked: false,
        }
    }
}

pub struct RegisterPool<'a> {
    core: GrowableList<'a, RegisterInfo>,
    fp: GrowableList<'a, RegisterInfo>,
    next_core: usize,
    next_fp: usize,
    /// Last frame store per vreg with no load since.
    last_store: GrowableList<'a, Option<LirId>>,
}

impl<'a> RegisterPool<'a> {
    pub fn new(arena: &'a Arena, core_temps: &[i32], fp_temps: &[i32], num_vregs: usize) -> Self {
        let mut core = GrowableList::new(arena, core_temps.len());
        for &reg in core_temps {
            core.push(RegisterInfo::temp(reg));
        }
        let mut fp = GrowableList::new(arena, fp_temps.len());
        for &reg in fp_temps {
            fp.push(RegisterInfo::temp(reg));
        }
        let mut last_store = GrowableList::new(arena, num_vregs);
        for _ in 0..num_vregs {
            last_store.push(None);
        }
        Self {
            core,
            fp,
            next_core: 0,
            next_fp: 0,
            last_store,
        }
    }

    fn slot(&self, reg: i32) -> Option<(bool, usize)> {
        let list = if is_fp_reg(reg) { &self.fp } else { &self.core };
        list.iter()
            .position(|info| info.reg == reg)
            .map(|index| (is_fp_reg(reg), index))
    }

    fn info_mut(&mut self, reg: i32) -> Option<&mut RegisterInfo> {
        let (fp, index) = self.slot(reg)?;
        Some(if fp {
            self.fp.get_mut(index)
        } else {
            self.core.get_mut(index)
        })
    }

    pub fn info(&self, reg: i32) -> Option<RegisterInfo> {
        let (fp, index) = self.slot(reg)?;
        Some(if fp {
            self.fp.get(index)
        } else {
            self.core.get(index)
        })
    }

    pub fn is_temp(&self, reg: i32) -> bool {
        self.slot(reg).is_some()
    }

    fn alloc_from(list: &mut GrowableList<'a, RegisterInfo>, next: &mut usize) -> Option<i32> {
        let len = list.len();
        if len == 0 {
            return None;
        }
        // Prefer a register that caches nothing, then any free one.
        for want_dead in [true, false] {
            for step in 0..len {
                let index = (*next + step) % len;
                let info = list.get(index);
                if info.in_use || info.locked || (want_dead && info.live) {
                    continue;
                }
                *next = (index + 1) % len;
                let entry = list.get_mut(index);
                entry.in_use = true;
                entry.live = false;
                entry.dirty = false;
                entry.pair = false;
                entry.partner = INVALID_REG;
                entry.s_reg = INVALID_SREG;
                return Some(entry.reg);
            }
        }
        None
    }

    pub fn alloc_temp(&mut self) -> Option<i32> {
        Self::alloc_from(&mut self.core, &mut self.next_core)
    }

    pub fn alloc_temp_float(&mut self) -> Option<i32> {
        Self::alloc_from(&mut self.fp, &mut self.next_fp)
    }

    /// Two temps packed as `low | high << 8`.
    pub fn alloc_typed_temp_pair(&mut self, fp: bool) -> Option<i32> {
        let low = if fp {
            self.alloc_temp_float()?
        } else {
            self.alloc_temp()?
        };
        let high = if fp {
            self.alloc_temp_float()
        } else {
            self.alloc_temp()
        };
        let Some(high) = high else {
            self.free_temp(low);
            return None;
        };
        self.mark_pair(low, high);
        Some((low & 0xff) | (high & 0xff) << 8)
    }

    pub fn free_temp(&mut self, reg: i32) {
        if let Some(info) = self.info_mut(reg) {
            info.in_use = false;
            info.pair = false;
            info.partner = INVALID_REG;
        }
    }

    pub fn clobber(&mut self, reg: i32) {
        if let Some(info) = self.info_mut(reg) {
            info.live = false;
            info.dirty = false;
            info.pair = false;
            info.partner = INVALID_REG;
            info.s_reg = INVALID_SREG;
        }
    }

    /// Forgets every cached copy of `s_reg`.
    pub fn clobber_sreg(&mut self, s_reg: i32) {
        let regs: Vec<i32> = self
            .core
            .iter()
            .chain(self.fp.iter())
            .filter(|info| info.live && info.s_reg == s_reg)
            .map(|info| info.reg)
            .collect();
        for reg in regs {
            self.clobber(reg);
        }
    }

    /// Drops every cached value; used around calls.
    pub fn clobber_all(&mut self) {
        let regs: Vec<i32> = self.core.iter().chain(self.fp.iter()).map(|info| info.reg).collect();
        for reg in regs {
            self.clobber(reg);
        }
    }

    pub fn mark_in_use(&mut self, reg: i32) {
        if let Some(info) = self.info_mut(reg) {
            info.in_use = true;
        }
    }

    /// Reserves `reg` for fixed use; its cached value is gone.
    pub fn lock_temp(&mut self, reg: i32) {
        self.clobber(reg);
        if let Some(info) = self.info_mut(reg) {
            info.in_use = true;
            info.locked = true;
        }
    }

    pub fn unlock_all(&mut self) {
        for index in 0..self.core.len() {
            self.core.get_mut(index).locked = false;
        }
        for index in 0..self.fp.len() {
            self.fp.get_mut(index).locked = false;
        }
    }

    /// Records that `reg` now holds `s_reg`; any other copy becomes stale.
    pub fn mark_live(&mut self, reg: i32, s_reg: i32) {
        if s_reg == INVALID_SREG {
            return;
        }
        self.clobber_sreg(s_reg);
        if let Some(info) = self.info_mut(reg) {
            info.live = true;
            info.s_reg = s_reg;
        }
    }

    pub fn mark_pair(&mut self, low: i32, high: i32) {
        if let Some(info) = self.info_mut(low) {
            info.pair = true;
            info.partner = high;
        }
        if let Some(info) = self.info_mut(high) {
            info.pair = true;
            info.partner = low;
        }
    }

    pub fn mark_dirty(&mut self, reg: i32) {
        if let Some(info) = self.info_mut(reg) {
            info.dirty = true;
        }
    }

    pub fn mark_clean(&mut self, reg: i32) {
        if let Some(info) = self.info_mut(reg) {
            info.dirty = false;
        }
    }

    /// Returns `(reg, s_reg)` of every dirty temp and marks them clean.
    pub fn flush_all(&mut self) -> Vec<(i32, i32)> {
        let dirty: Vec<(i32, i32)> = self
            .core
            .iter()
            .chain(self.fp.iter())
            .filter(|info| info.dirty && info.live)
            .map(|info| (info.reg, info.s_reg))
            .collect();
        for (reg, _) in &dirty {
            self.mark_clean(*reg);
        }
        dirty
    }

    /// Frees all temps between instructions; cached values survive.
    pub fn reset_reg_pool(&mut self) {
        for index in 0..self.core.len() {
            let info = self.core.get_mut(index);
            info.in_use = false;
            info.locked = false;
        }
        for index in 0..self.fp.len() {
            let info = self.fp.get_mut(index);
            info.in_use = false;
            info.locked = false;
        }
    }

    pub fn is_live(&self, s_reg: i32) -> Option<i32> {
        if s_reg == INVALID_SREG {
            return None;
        }
        self.core
            .iter()
            .chain(self.fp.iter())
            .find(|info| info.live && info.s_reg == s_reg)
            .map(|info| info.reg)
    }

    pub fn is_live_core(&self, s_reg: i32) -> Option<i32> {
        self.is_live(s_reg).filter(|reg| !is_fp_reg(*reg))
    }

    pub fn reset_def_tracking(&mut self) {
        for index in 0..self.last_store.len() {
            self.last_store.set(index, None);
        }
    }

    pub fn note_vreg_load(&mut self, vreg: i32) {
        if vreg >= 0 && (vreg as usize) < self.last_store.len() {
            self.last_store.set(vreg as usize, None);
        }
    }

    /// Records a frame store of `vreg` and returns the earlier store it makes dead.
    pub fn note_vreg_store(&mut self, vreg: i32, lir: LirId) -> Option<LirId> {
        if vreg < 0 || vreg as usize >= self.last_store.len() {
            return None;
        }
        let previous = self.last_store.get(vreg as usize);
        self.last_store.set(vreg as usize, Some(lir));
        previous
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Location {
    DalvikFrame,
    PhysReg,
}

/// Where a Dalvik value currently is.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegLocation {
    pub location: Location,
    pub wide: bool,
    pub fp: bool,
    pub low_reg: i32,
    pub high_reg: i32,
    pub s_reg_low: i32,
    pub vreg: i32,
}

impl RegLocation {
    pub fn in_frame(vreg: i32, s_reg: i32, wide: bool, fp: bool) -> Self {
        Self {
            location: Location::DalvikFrame,
            wide,
            fp,
            low_reg: INVALID_REG,
            high_reg: INVALID_REG,
            s_reg_low: s_reg,
            vreg,
        }
    }

    /// Name of the high half of a wide value.
    pub fn s_reg_high(&self) -> i32 {
        if self.s_reg_low == INVALID_SREG {
            INVALID_SREG
        } else {
            self.s_reg_low + 1
        }
    }
}

fn location_from(cu: &CompilationUnit<'_>, s_reg: i32, wide: bool, fp: bool) -> RegLocation {
    RegLocation::in_frame(cu.vreg_of(s_reg), s_reg, wide, fp)
}

/// Source operand `index` of `mir`, counted in SSA uses.
pub fn get_src(cu: &CompilationUnit<'_>, mir: &Mir, index: usize) -> CompileResult<RegLocation> {
    let uses = mir.ssa.uses();
    let s_reg = *uses.get(index).ok_or_else(|| operand_error(mir, index))?;
    Ok(location_from(cu, s_reg, false, false))
}

pub fn get_src_wide(
    cu: &CompilationUnit<'_>,
    mir: &Mir,
    low_index: usize,
) -> CompileResult<RegLocation> {
    let uses = mir.ssa.uses();
    if low_index + 1 >= uses.len() {
        return Err(operand_error(mir, low_index + 1));
    }
    Ok(location_from(cu, uses[low_index], true, false))
}

pub fn get_dest(cu: &CompilationUnit<'_>, mir: &Mir) -> CompileResult<RegLocation> {
    let defs = mir.ssa.defs();
    let s_reg = *defs.first().ok_or_else(|| operand_error(mir, 0))?;
    Ok(location_from(cu, s_reg, false, false))
}

pub fn get_dest_wide(cu: &CompilationUnit<'_>, mir: &Mir) -> CompileResult<RegLocation> {
    let defs = mir.ssa.defs();
    if defs.len() < 2 {
        return Err(operand_error(mir, 1));
    }
    Ok(location_from(cu, defs[0], true, false))
}

fn operand_error(mir: &Mir, index: usize) -> CompileAbort {
    CompileAbort::Internal(format!(
        "{} at 0x{:04x} has no operand {index}",
        mir.insn.opcode, mir.offset
    ))
}

/// Updates `loc` with a register already holding its value, if any.
pub fn update_loc(cu: &CompilationUnit<'_>, mut loc: RegLocation) -> RegLocation {
    if loc.wide {
        return loc;
    }
    if let Some(reg) = cu.promoted_reg(loc.vreg) {
        if !loc.fp {
            loc.location = Location::PhysReg;
            loc.low_reg = reg;
            return loc;
        }
    }
    let live = if loc.fp {
        cu.reg_pool.is_live(loc.s_reg_low).filter(|reg| is_fp_reg(*reg))
    } else {
        cu.reg_pool.is_live_core(loc.s_reg_low)
    };
    if let Some(reg) = live {
        loc.location = Location::PhysReg;
        loc.low_reg = reg;
    }
    loc
}

/// Gives `loc` a register to be written, allocating temps as needed.
pub fn eval_loc(cu: &mut CompilationUnit<'_>, loc: RegLocation) -> CompileResult<RegLocation> {
    let mut loc = update_loc(cu, loc);
    let dex_pc = cu.current_dalvik_offset;
    if loc.wide {
        let pair = cu
            .reg_pool
            .alloc_typed_temp_pair(false)
            .ok_or(CompileAbort::OutOfTemps { dex_pc })?;
        loc.location = Location::PhysReg;
        loc.low_reg = pair & 0xff;
        loc.high_reg = (pair >> 8) & 0xff;
        return Ok(loc);
    }
    if loc.location == Location::PhysReg {
        if cu.promoted_reg(loc.vreg) != Some(loc.low_reg) {
            cu.reg_pool.mark_in_use(loc.low_reg);
        }
        return Ok(loc);
    }
    let reg = if loc.fp {
        cu.reg_pool.alloc_temp_float()
    } else {
        cu.reg_pool.alloc_temp()
    };
    loc.low_reg = reg.ok_or(CompileAbort::OutOfTemps { dex_pc })?;
    loc.location = Location::PhysReg;
    Ok(loc)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temps_round_robin_and_prefer_dead_registers() {
        let arena = Arena::new();
        let mut pool = RegisterPool::new(&arena, &[0, 1, 2], &[], 4);
        let a = pool.alloc_temp().expect("first");
        pool.mark_live(a, 7);
        pool.reset_reg_pool();
        let b = pool.alloc_temp().expect("second");
        assert_ne!(a, b);
        assert_eq!(pool.is_live(7), Some(a));
        let c = pool.alloc_temp().expect("third");
        // Only the live register is left.
        let d = pool.alloc_temp().expect("fourth");
        assert_eq!(d, a);
        assert_eq!(pool.is_live(7), None);
        assert!(pool.alloc_temp().is_none());
        assert_ne!(b, c);
    }

    #[test]
    fn pairs_release_the_low_half_on_failure() {
        let arena = Arena::new();
        let mut pool = RegisterPool::new(&arena, &[0, 1, 2], &[], 4);
        let pair = pool.alloc_typed_temp_pair(false).expect("pair");
        assert_eq!(pool.info(pair & 0xff).map(|info| info.partner), Some(pair >> 8));
        assert!(pool.alloc_typed_temp_pair(false).is_none());
        assert!(pool.alloc_temp().is_some());
    }

    #[test]
    fn consecutive_stores_report_the_dead_one() {
        let arena = Arena::new();
        let mut pool = RegisterPool::new(&arena, &[0], &[], 4);
        assert_eq!(pool.note_vreg_store(2, 10), None);
        assert_eq!(pool.note_vreg_store(2, 14), Some(10));
        pool.note_vreg_load(2);
        assert_eq!(pool.note_vreg_store(2, 20), None);
        pool.reset_def_tracking();
        assert_eq!(pool.note_vreg_store(2, 30), None);
    }

    #[test]
    fn locked_registers_are_not_handed_out() {
        let arena = Arena::new();
        let mut pool = RegisterPool::new(&arena, &[0, 1], &[], 1);
        pool.mark_live(0, 3);
        pool.lock_temp(0);
        assert_eq!(pool.is_live(3), None);
        assert_eq!(pool.alloc_temp(), Some(1));
        assert!(pool.alloc_temp().is_none());
        pool.reset_reg_pool();
        assert!(pool.alloc_temp().is_some());
    }
}
