//! Quick frame layout shared by the code generators and the stack walker.
//!
//! ```text
//!   +------------------------+  <- frame top (caller's SP)
//!   | core spills            |  lowest register farthest from the top
//!   | fp spills              |
//!   | filler                 |
//!   +------------------------+
//!   | v[num_regs - 1] .. v0  |  locals_start = v0
//!   +------------------------+
//!   | compiler temps, outs   |
//!   | Method*                |  <- SP
//!   +------------------------+
//! ```
//! Incoming arguments live in the caller's out area, above the frame top.

use serde::{Deserialize, Serialize};

pub const POINTER_SIZE: u32 = 4;
pub const STACK_ALIGNMENT: u32 = 16;
/// Largest frame the walker accepts as sane.
pub const MAX_FRAME_SIZE: u32 = 256 * POINTER_SIZE + STACK_ALIGNMENT;
/// Pseudo vreg naming the Method* slot.
pub const METHOD_PTR_VREG: i32 = -2;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameInfo {
    pub frame_size: u32,
    pub core_spill_mask: u32,
    pub fp_spill_mask: u32,
}

impl FrameInfo {
    pub fn new(frame_size: u32, core_spill_mask: u32, fp_spill_mask: u32) -> Self {
        assert_eq!(
            frame_size % STACK_ALIGNMENT,
            0,
            "frame size {frame_size} is not {STACK_ALIGNMENT}-byte aligned"
        );
        Self {
            frame_size,
            core_spill_mask,
            fp_spill_mask,
        }
    }

    /// Callee-save frame of a runtime method: spills plus Method*, rounded to alignment.
    pub fn callee_save(core_spill_mask: u32, fp_spill_mask: u32) -> Self {
        let words = core_spill_mask.count_ones() + fp_spill_mask.count_ones() + 1;
        Self::new(
            align_up(words * POINTER_SIZE, STACK_ALIGNMENT),
            core_spill_mask,
            fp_spill_mask,
        )
    }

    pub fn return_pc_offset(&self) -> u32 {
        self.frame_size - POINTER_SIZE
    }

    pub fn num_core_spills(&self) -> u32 {
        self.core_spill_mask.count_ones()
    }

    pub fn num_fp_spills(&self) -> u32 {
        self.fp_spill_mask.count_ones()
    }

    /// Offset from SP of the `num`-th callee-save slot counted down from the frame top.
    pub fn callee_save_offset(&self, num: u32) -> u32 {
        self.frame_size - (num + 1) * POINTER_SIZE
    }

    /// Offset from SP where core register `reg` is spilled, if it is.
    pub fn core_spill_offset(&self, reg: usize) -> Option<u32> {
        let rank = spill_rank(self.core_spill_mask, reg)?;
        Some(self.callee_save_offset(self.num_core_spills() - 1 - rank))
    }

    pub fn fp_spill_offset(&self, reg: usize) -> Option<u32> {
        let rank = spill_rank(self.fp_spill_mask, reg)?;
        Some(self.callee_save_offset(
            self.num_core_spills() + self.num_fp_spills() - 1 - rank,
        ))
    }
}

fn spill_rank(mask: u32, reg: usize) -> Option<u32> {
    if reg >= 32 || mask & (1 << reg) == 0 {
        return None;
    }
    Some((mask & ((1u32 << reg) - 1)).count_ones())
}

pub fn align_up(value: u32, alignment: u32) -> u32 {
    (value + alignment - 1) & !(alignment - 1)
}

/// Frame size for a compiled method; one filler word and the Method* slot are included.
pub fn compute_frame_size(
    num_core_spills: u32,
    num_fp_spills: u32,
    num_regs: u32,
    num_outs: u32,
    num_temps: u32,
) -> u32 {
    let words = num_core_spills + num_fp_spills + 1 + num_regs + num_outs + num_temps + 1;
    align_up(words * POINTER_SIZE, STACK_ALIGNMENT)
}

/// Byte offset from SP of virtual register `reg`.
///
/// `num_regs` counts locals only (registers minus ins). `-2` names the Method* slot and
/// values `<= -3` name compiler temps.
///
/// Temps count up from `locals_start + 2 * word`, so temp `-3` shares the slot of `v2` and
/// later temps reach the higher locals and then the filler word. Frames built with
/// `num_temps > 0` need the temps placed below the locals before any codegen uses them; the
/// compiler currently reserves none.
pub fn vreg_offset(frame: &FrameInfo, num_regs: u32, reg: i32) -> i32 {
    assert_eq!(frame.frame_size % STACK_ALIGNMENT, 0, "misaligned frame size");
    let num_spills = (frame.num_core_spills() + frame.num_fp_spills() + 1) as i32;
    let num_regs = num_regs as i32;
    let word = POINTER_SIZE as i32;
    let frame_size = frame.frame_size as i32;
    let locals_start = frame_size - (num_spills + num_regs) * word;
    if reg == METHOD_PTR_VREG {
        0
    } else if reg <= -3 {
        locals_start - (reg + 1) * word
    } else if reg < num_regs {
        locals_start + reg * word
    } else {
        frame_size + (reg - num_regs) * word + word
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_sizes_are_aligned() {
        assert_eq!(compute_frame_size(1, 0, 3, 0, 0), 32);
        assert_eq!(compute_frame_size(4, 0, 10, 2, 0), 80);
        assert_eq!(compute_frame_size(0, 0, 0, 0, 0), 16);
    }

    #[test]
    fn spill_offsets_pack_from_the_top() {
        // r5, r7 and lr spilled; lr is highest so it sits at the top.
        let frame = FrameInfo::new(48, 1 << 5 | 1 << 7 | 1 << 14, 1 << 16);
        assert_eq!(frame.core_spill_offset(14), Some(44));
        assert_eq!(frame.core_spill_offset(7), Some(40));
        assert_eq!(frame.core_spill_offset(5), Some(36));
        assert_eq!(frame.fp_spill_offset(16), Some(32));
        assert_eq!(frame.core_spill_offset(6), None);
        assert_eq!(frame.return_pc_offset(), 44);
    }

    #[test]
    fn vreg_offsets_land_in_their_regions() {
        // (frame, locals, first in)
        let frames = [
            (FrameInfo::new(48, 1 << 5 | 1 << 14, 0), 3, 52),
            (FrameInfo::new(64, 1 << 4 | 1 << 5 | 1 << 6 | 1 << 14, 1 << 16), 5, 68),
            (FrameInfo::new(32, 1 << 8, 0), 2, 36),
            (FrameInfo::new(16, 1 << 31, 0), 0, 20),
        ];
        for (frame, num_regs, first_in) in frames {
            let spills = frame.num_core_spills() + frame.num_fp_spills() + 1;
            let spill_start = (frame.frame_size - spills * POINTER_SIZE) as i32;
            let locals_start = spill_start - (num_regs * POINTER_SIZE) as i32;
            assert_eq!(vreg_offset(&frame, num_regs, METHOD_PTR_VREG), 0);
            for reg in 0..num_regs as i32 {
                let offset = vreg_offset(&frame, num_regs, reg);
                assert!(offset > 0, "{frame:?} v{reg}");
                assert!((locals_start..spill_start).contains(&offset), "{frame:?} v{reg} at {offset}");
            }
            let first = vreg_offset(&frame, num_regs, num_regs as i32);
            assert_eq!(first, first_in, "{frame:?}");
            assert!(first >= frame.frame_size as i32);
            assert_eq!(vreg_offset(&frame, num_regs, num_regs as i32 + 1), first_in + 4);
        }
    }

    #[test]
    fn compiler_temps_alias_the_upper_locals() {
        let frame = FrameInfo::new(48, 1 << 5 | 1 << 14, 0);
        assert_eq!(vreg_offset(&frame, 3, 0), 24);
        assert_eq!(vreg_offset(&frame, 3, 2), 32);
        assert_eq!(vreg_offset(&frame, 3, -3), vreg_offset(&frame, 3, 2));
        // The next temp is the filler word under the spills.
        assert_eq!(vreg_offset(&frame, 3, -4), 36);
        assert_eq!(frame.core_spill_offset(5), Some(40));
    }

    #[test]
    fn runtime_callee_save_frame() {
        let frame = FrameInfo::callee_save(0x4ff0, 0xffff_0000);
        assert_eq!(frame.frame_size, 112);
    }
}
