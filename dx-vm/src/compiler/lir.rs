//! Low-level IR shared by the three backends.

use std::fmt;

pub type LirId = usize;

/// Register operands with this bit set name floating-point registers.
pub const FP_REG_OFFSET: i32 = 32;
pub const FP_DOUBLE: i32 = 64;
pub const FP_REG_MASK: i32 = FP_REG_OFFSET - 1;
pub const INVALID_REG: i32 = -1;

pub fn is_fp_reg(reg: i32) -> bool {
    reg >= 0 && reg & FP_REG_OFFSET != 0
}

// Encoding flags.
pub const IS_BRANCH: u32 = 1;
pub const IS_LOAD: u32 = 1 << 1;
pub const IS_STORE: u32 = 1 << 2;
pub const REG_DEF0: u32 = 1 << 3;
pub const REG_DEF1: u32 = 1 << 4;
pub const REG_DEF_SP: u32 = 1 << 5;
pub const REG_DEF_LR: u32 = 1 << 6;
pub const REG_DEF_LIST0: u32 = 1 << 7;
pub const REG_USE0: u32 = 1 << 8;
pub const REG_USE1: u32 = 1 << 9;
pub const REG_USE2: u32 = 1 << 10;
pub const REG_USE3: u32 = 1 << 11;
pub const REG_USE_SP: u32 = 1 << 12;
pub const REG_USE_PC: u32 = 1 << 13;
pub const REG_USE_LR: u32 = 1 << 14;
pub const REG_USE_LIST0: u32 = 1 << 15;
pub const SETS_CCODES: u32 = 1 << 16;
pub const USES_CCODES: u32 = 1 << 17;
pub const NEEDS_FIXUP: u32 = 1 << 18;
pub const IS_CALL: u32 = 1 << 19;
pub const IS_DATA: u32 = 1 << 20;
pub const USES_LITERAL: u32 = 1 << 21;
pub const REG_DEF_HI_LO: u32 = 1 << 22;
pub const REG_USE_HI_LO: u32 = 1 << 23;

pub const REG_DEF01: u32 = REG_DEF0 | REG_DEF1;
pub const REG_USE01: u32 = REG_USE0 | REG_USE1;
pub const REG_USE12: u32 = REG_USE1 | REG_USE2;
pub const REG_DEF0_USE1: u32 = REG_DEF0 | REG_USE1;
pub const REG_DEF0_USE0: u32 = REG_DEF0 | REG_USE0;
pub const REG_DEF0_USE01: u32 = REG_DEF0 | REG_USE01;
pub const REG_DEF0_USE12: u32 = REG_DEF0 | REG_USE12;

// Non-register resources.
pub const RES_CCODE: u8 = 1;
pub const RES_DALVIK_REG: u8 = 1 << 1;
pub const RES_LITERAL: u8 = 1 << 2;
pub const RES_HEAP: u8 = 1 << 3;
pub const RES_MUST_NOT_ALIAS: u8 = 1 << 4;
pub const RES_HI_LO: u8 = 1 << 5;

/// Resources an instruction uses or defines.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ResourceMask {
    pub core: u32,
    pub fp: u32,
    pub other: u8,
}

impl ResourceMask {
    pub const NONE: ResourceMask = ResourceMask {
        core: 0,
        fp: 0,
        other: 0,
    };
    pub const ALL: ResourceMask = ResourceMask {
        core: u32::MAX,
        fp: u32::MAX,
        other: u8::MAX,
    };

    pub fn reg(reg: i32) -> Self {
        let mut mask = Self::NONE;
        mask.add_reg(reg);
        mask
    }

    pub fn add_reg(&mut self, reg: i32) {
        if reg < 0 {
            return;
        }
        if is_fp_reg(reg) {
            let index = reg & FP_REG_MASK;
            self.fp |= 1 << index;
            if reg & FP_DOUBLE != 0 {
                self.fp |= 1 << ((index + 1) & FP_REG_MASK);
            }
        } else {
            self.core |= 1 << (reg & 31);
        }
    }

    pub fn union(self, other: ResourceMask) -> Self {
        Self {
            core: self.core | other.core,
            fp: self.fp | other.fp,
            other: self.other | other.other,
        }
    }

    pub fn intersects(self, other: ResourceMask) -> bool {
        self.core & other.core != 0 || self.fp & other.fp != 0 || self.other & other.other != 0
    }

    pub fn is_empty(self) -> bool {
        self == Self::NONE
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Cond {
    Eq,
    Ne,
    Lt,
    Ge,
    Gt,
    Le,
    /// Unsigned >=.
    Cs,
    /// Unsigned <.
    Cc,
    Hi,
    Ls,
    Mi,
    Pl,
    Al,
}

/// Conditional branch LIRs carry their condition in this operand slot.
pub const COND_OPERAND: usize = 3;

impl Cond {
    const ALL: [Cond; 13] = [
        Cond::Eq,
        Cond::Ne,
        Cond::Lt,
        Cond::Ge,
        Cond::Gt,
        Cond::Le,
        Cond::Cs,
        Cond::Cc,
        Cond::Hi,
        Cond::Ls,
        Cond::Mi,
        Cond::Pl,
        Cond::Al,
    ];

    pub fn to_operand(self) -> i32 {
        self as i32
    }

    pub fn from_operand(value: i32) -> Self {
        usize::try_from(value)
            .ok()
            .and_then(|index| Self::ALL.get(index).copied())
            .unwrap_or(Cond::Al)
    }

    pub fn flip(self) -> Self {
        match self {
            Cond::Eq => Cond::Ne,
            Cond::Ne => Cond::Eq,
            Cond::Lt => Cond::Ge,
            Cond::Ge => Cond::Lt,
            Cond::Gt => Cond::Le,
            Cond::Le => Cond::Gt,
            Cond::Cs => Cond::Cc,
            Cond::Cc => Cond::Cs,
            Cond::Hi => Cond::Ls,
            Cond::Ls => Cond::Hi,
            Cond::Mi => Cond::Pl,
            Cond::Pl => Cond::Mi,
            Cond::Al => Cond::Al,
        }
    }

    pub fn suffix(self) -> &'static str {
        match self {
            Cond::Eq => "eq",
            Cond::Ne => "ne",
            Cond::Lt => "lt",
            Cond::Ge => "ge",
            Cond::Gt => "gt",
            Cond::Le => "le",
            Cond::Cs => "cs",
            Cond::Cc => "cc",
            Cond::Hi => "hi",
            Cond::Ls => "ls",
            Cond::Mi => "mi",
            Cond::Pl => "pl",
            Cond::Al => "al",
        }
    }

    /// Condition that holds for `(b, a)` whenever `self` holds for `(a, b)`.
    pub fn swap_operands(self) -> Self {
        match self {
            Cond::Lt => Cond::Gt,
            Cond::Gt => Cond::Lt,
            Cond::Le => Cond::Ge,
            Cond::Ge => Cond::Le,
            Cond::Cs => Cond::Ls,
            Cond::Ls => Cond::Cs,
            Cond::Cc => Cond::Hi,
            Cond::Hi => Cond::Cc,
            other => other,
        }
    }

    /// Evaluates the condition on a signed comparison of `a` against `b`.
    pub fn holds(self, a: i32, b: i32) -> bool {
        match self {
            Cond::Eq => a == b,
            Cond::Ne => a != b,
            Cond::Lt => a < b,
            Cond::Ge => a >= b,
            Cond::Gt => a > b,
            Cond::Le => a <= b,
            Cond::Cs => (a as u32) >= (b as u32),
            Cond::Cc => (a as u32) < (b as u32),
            Cond::Hi => (a as u32) > (b as u32),
            Cond::Ls => (a as u32) <= (b as u32),
            Cond::Mi => a.wrapping_sub(b) < 0,
            Cond::Pl => a.wrapping_sub(b) >= 0,
            Cond::Al => true,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AluOp {
    Add,
    /// Add that produces the carry flag.
    Adds,
    /// Add with carry in; produces carry.
    Adc,
    Sub,
    /// Subtract that produces the carry (not-borrow) flag.
    Subs,
    /// Subtract with borrow in.
    Sbc,
    Rsub,
    Mul,
    And,
    Or,
    Xor,
    Nor,
    Lsl,
    Lsr,
    Asr,
    Ror,
}

/// Single-precision operations the targets with an fp register file do inline.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FpOp {
    Add,
    Sub,
    Mul,
    Div,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Neg,
    Not,
}

/// What an encoded instruction does; the simulator and the optimiser key off this.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OpKind {
    Nop,
    /// `[rd, rs]`
    Mov,
    /// `[rd, imm]`
    MovImm,
    /// `[rd, imm]`: rd = imm << 16
    LoadUpper,
    /// `[rd, rs, rt]`
    AluRRR(AluOp),
    /// `[rd, rs, imm]`
    AluRRI(AluOp),
    /// `[rd, rs]`: rd = rd op rs
    AluRR(AluOp),
    /// `[rd, imm]`: rd = rd op imm
    AluRI(AluOp),
    /// `[rd, rs]`
    Unary(UnaryOp),
    /// `[fd, fs, ft]`
    FpRRR(FpOp),
    /// `[rs, rt]`: flags from rs - rt
    Cmp,
    /// `[rs, imm]`
    CmpImm,
    /// `[rd, rs, rt]`
    SetLessThan { unsigned: bool },
    /// `[rd, rs, imm]`
    SetLessThanImm { unsigned: bool },
    /// `[rs, rt]`: hi:lo = rs * rt (signed)
    MultHiLo,
    /// `[rd]`
    MoveFromLo,
    /// `[rd]`
    MoveFromHi,
    /// `[rs, rt]`: lo = rs / rt, hi = rs % rt
    DivHiLo,
    /// edx = sign of eax
    Cdq,
    /// `[rs]`: eax = edx:eax / rs, edx = edx:eax % rs
    Idiv,
    /// `[rd, base, disp]`
    Load,
    /// `[rs, base, disp]`
    Store,
    /// `[rd, base, index, scale, disp]`
    LoadIndexed,
    /// `[rs, base, index, scale, disp]`
    StoreIndexed,
    /// `[rd]`, value carried in the assembled record
    LoadLiteral,
    /// `[reg_mask]`
    Push,
    /// `[reg_mask]`
    Pop,
    Branch,
    CondBranch(Cond),
    /// `[rs, rt]`
    CmpBranch(Cond),
    /// `[rs]`, compared against zero
    CmpZeroBranch(Cond),
    /// Direct call to an absolute address carried in the assembled record.
    Call,
    /// `[reg]`
    CallReg,
    /// `[reg]`
    JumpReg,
    /// Pops or reads the return address, depending on the target.
    Return,
    /// `[value]`, never executed
    Data,
}

impl OpKind {
    /// Replaces the placeholder condition of a branch kind.
    pub fn with_cond(self, cond: Cond) -> Self {
        match self {
            OpKind::CondBranch(_) => OpKind::CondBranch(cond),
            OpKind::CmpBranch(_) => OpKind::CmpBranch(cond),
            OpKind::CmpZeroBranch(_) => OpKind::CmpZeroBranch(cond),
            other => other,
        }
    }

    pub fn is_conditional_branch(self) -> bool {
        matches!(
            self,
            OpKind::CondBranch(_) | OpKind::CmpBranch(_) | OpKind::CmpZeroBranch(_)
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EncodingInfo {
    pub name: &'static str,
    /// Disassembly template: `!0r` register, `!1d` decimal, `!2x` hex, `!0t` branch target.
    pub fmt: &'static str,
    /// Size in bytes; variable-length x86 forms record their smallest size.
    pub size: u8,
    pub flags: u32,
    pub kind: OpKind,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CellKind {
    Normal,
    Hot,
    InvokeSingleton,
    InvokePredicted,
    BackwardBranch,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PseudoOp {
    EntryBlock,
    ExitBlock,
    /// `operands[0]` = block id
    BlockLabel,
    TargetLabel,
    /// `operands[0]` = dex pc of the instruction that follows
    DalvikBoundary,
    /// `operands[0]` = dex pc of the interpreter exit
    PcReconstructionCell,
    /// `operands[0]` = target dex pc
    ChainingCell(CellKind),
    /// Records a safepoint at the following offset; `operands[0]` = dex pc
    Safepoint,
    Barrier,
    /// Pads to a 4-byte boundary; the literal pool follows.
    Align4,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LirOp {
    Pseudo(PseudoOp),
    Target(u16),
}

/// `(vreg, is_load)` annotation for frame accesses.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AliasInfo {
    pub vreg: i32,
    pub is_load: bool,
    pub wide: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Lir {
    pub offset: u32,
    pub dalvik_offset: u32,
    pub opcode: LirOp,
    pub operands: [i32; 5],
    /// Branch target label or literal index.
    pub target: Option<LirId>,
    pub literal: Option<usize>,
    /// Absolute call target.
    pub call_target: Option<u32>,
    pub is_nop: bool,
    /// Set by the assembler when the short form did not fit.
    pub long_form: bool,
    pub size: u8,
    pub alias: Option<AliasInfo>,
    pub use_mask: ResourceMask,
    pub def_mask: ResourceMask,
}

impl Lir {
    pub fn new(opcode: LirOp, dalvik_offset: u32, operands: [i32; 5]) -> Self {
        Self {
            offset: 0,
            dalvik_offset,
            opcode,
            operands,
            target: None,
            literal: None,
            call_target: None,
            is_nop: false,
            long_form: false,
            size: 0,
            alias: None,
            use_mask: ResourceMask::NONE,
            def_mask: ResourceMask::NONE,
        }
    }

    pub fn pseudo(op: PseudoOp, dalvik_offset: u32, operand: i32) -> Self {
        Self::new(LirOp::Pseudo(op), dalvik_offset, [operand, 0, 0, 0, 0])
    }

    pub fn is_pseudo(&self) -> bool {
        matches!(self.opcode, LirOp::Pseudo(_))
    }

    pub fn is_label(&self) -> bool {
        matches!(
            self.opcode,
            LirOp::Pseudo(
                PseudoOp::BlockLabel
                    | PseudoOp::TargetLabel
                    | PseudoOp::PcReconstructionCell
                    | PseudoOp::ChainingCell(_)
                    | PseudoOp::EntryBlock
                    | PseudoOp::ExitBlock
            )
        )
    }

    pub fn target_opcode(&self) -> Option<u16> {
        match self.opcode {
            LirOp::Target(op) => Some(op),
            LirOp::Pseudo(_) => None,
        }
    }
}

/// Fills use/def masks from the encoding flags.
pub fn setup_resource_masks(lir: &mut Lir, info: &EncodingInfo, sp: i32, lr: i32, pc: i32) {
    let flags = info.flags;
    let mut uses = ResourceMask::NONE;
    let mut defs = ResourceMask::NONE;

    if flags & (IS_LOAD | IS_STORE) != 0 {
        let memory = if lir.alias.is_some() {
            RES_DALVIK_REG
        } else if flags & USES_LITERAL != 0 {
            RES_LITERAL
        } else {
            RES_HEAP
        };
        if flags & IS_LOAD != 0 {
            uses.other |= memory;
        }
        if flags & IS_STORE != 0 {
            defs.other |= memory;
        }
    }
    if flags & USES_LITERAL != 0 {
        uses.other |= RES_LITERAL;
    }
    if flags & IS_BRANCH != 0 {
        // Nothing moves across a branch.
        uses = ResourceMask::ALL;
    }
    if flags & IS_CALL != 0 {
        defs = ResourceMask::ALL;
    }

    let def_bits = [(REG_DEF0, 0), (REG_DEF1, 1)];
    for (bit, index) in def_bits {
        if flags & bit != 0 {
            defs.add_reg(lir.operands[index]);
        }
    }
    let use_bits = [(REG_USE0, 0), (REG_USE1, 1), (REG_USE2, 2), (REG_USE3, 3)];
    for (bit, index) in use_bits {
        if flags & bit != 0 {
            uses.add_reg(lir.operands[index]);
        }
    }
    if flags & REG_DEF_SP != 0 {
        defs.add_reg(sp);
    }
    if flags & REG_USE_SP != 0 {
        uses.add_reg(sp);
    }
    if flags & REG_DEF_LR != 0 {
        defs.add_reg(lr);
    }
    if flags & REG_USE_LR != 0 {
        uses.add_reg(lr);
    }
    if flags & REG_USE_PC != 0 {
        uses.add_reg(pc);
    }
    if flags & REG_DEF_LIST0 != 0 {
        defs.core |= lir.operands[0] as u32;
    }
    if flags & REG_USE_LIST0 != 0 {
        uses.core |= lir.operands[0] as u32;
    }
    if flags & SETS_CCODES != 0 {
        defs.other |= RES_CCODE;
    }
    if flags & USES_CCODES != 0 {
        uses.other |= RES_CCODE;
    }
    if flags & REG_DEF_HI_LO != 0 {
        defs.other |= RES_HI_LO;
    }
    if flags & REG_USE_HI_LO != 0 {
        uses.other |= RES_HI_LO;
    }
    lir.use_mask = uses;
    lir.def_mask = defs;
}

/// One instruction of published code, as the simulator and disassembler see it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MachineInsn {
    pub offset: u32,
    pub size: u32,
    pub opcode: u16,
    pub name: &'static str,
    pub fmt: &'static str,
    pub kind: OpKind,
    /// Encoding flags, see `SETS_CCODES` and friends.
    pub flags: u32,
    pub operands: [i32; 5],
    pub dalvik_offset: u32,
    /// Code-relative branch target.
    pub target_offset: Option<u32>,
    /// Absolute call target.
    pub call_target: Option<u32>,
    pub literal: Option<u32>,
}

impl fmt::Display for MachineInsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = render_operands(self.name, &self.operands, self.target_offset);
        let operands = render_operands(self.fmt, &self.operands, self.target_offset);
        write!(f, "0x{:04x}: {:<8} {}", self.offset, name, operands)?;
        if let Some(call) = self.call_target {
            write!(f, " ; call 0x{call:08x}")?;
        }
        if let Some(value) = self.literal {
            write!(f, " ; =0x{value:x}")?;
        }
        Ok(())
    }
}

/// Expands a disassembly template: `!<n><kind>` prints operand `n` as a register (`r`),
/// decimal (`d`), hex (`x`), condition (`c`) or, for `t`, the resolved branch target.
pub fn render_operands(fmt: &str, operands: &[i32; 5], target: Option<u32>) -> String {
    use std::fmt::Write as _;

    let mut out = String::new();
    let mut chars = fmt.chars();
    while let Some(c) = chars.next() {
        if c != '!' {
            out.push(c);
            continue;
        }
        let (Some(index), Some(kind)) = (chars.next(), chars.next()) else {
            break;
        };
        let value = index
            .to_digit(10)
            .and_then(|index| operands.get(index as usize))
            .copied()
            .unwrap_or(0);
        let _ = match kind {
            'r' if is_fp_reg(value) => write!(out, "f{}", value & FP_REG_MASK),
            'r' => write!(out, "r{value}"),
            'd' => write!(out, "{value}"),
            'x' => write!(out, "0x{value:x}"),
            'c' => write!(out, "{}", Cond::from_operand(value).suffix()),
            't' => match target {
                Some(offset) => write!(out, "0x{offset:04x}"),
                None => write!(out, "?"),
            },
            other => write!(out, "!{index}{other}"),
        };
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masks_follow_flags() {
        let info = EncodingInfo {
            name: "adds",
            fmt: "!0r, !1r, !2r",
            size: 2,
            flags: REG_DEF0_USE12 | SETS_CCODES,
            kind: OpKind::AluRRR(AluOp::Adds),
        };
        let mut lir = Lir::new(LirOp::Target(0), 0, [0, 1, 2, 0, 0]);
        setup_resource_masks(&mut lir, &info, 13, 14, 15);
        assert_eq!(lir.def_mask.core, 1);
        assert_eq!(lir.use_mask.core, 0b110);
        assert_eq!(lir.def_mask.other, RES_CCODE);
    }

    #[test]
    fn frame_loads_touch_dalvik_memory_only() {
        let info = EncodingInfo {
            name: "ldr",
            fmt: "!0r, [!1r, #!2d]",
            size: 2,
            flags: REG_DEF0_USE1 | IS_LOAD,
            kind: OpKind::Load,
        };
        let mut lir = Lir::new(LirOp::Target(0), 0, [3, 13, 8, 0, 0]);
        lir.alias = Some(AliasInfo {
            vreg: 1,
            is_load: true,
            wide: false,
        });
        setup_resource_masks(&mut lir, &info, 13, 14, 15);
        assert_eq!(lir.use_mask.other, RES_DALVIK_REG);
        assert!(lir.use_mask.core & (1 << 13) != 0);
    }

    #[test]
    fn condition_helpers() {
        assert_eq!(Cond::Lt.flip(), Cond::Ge);
        assert_eq!(Cond::Lt.swap_operands(), Cond::Gt);
        assert!(Cond::Cc.holds(1, -1));
        assert!(!Cond::Lt.holds(1, -1));
        assert_eq!(Cond::from_operand(Cond::Hi.to_operand()), Cond::Hi);
        assert_eq!(Cond::from_operand(99), Cond::Al);
    }

    #[test]
    fn templates_render_operands() {
        let operands = [3, FP_REG_OFFSET + 2, 16, Cond::Ne.to_operand(), 0];
        assert_eq!(
            render_operands("!0r, [!1r, #!2d]", &operands, None),
            "r3, [f2, #16]"
        );
        assert_eq!(render_operands("b!3c !0t", &operands, Some(0x40)), "bne 0x0040");
        assert_eq!(render_operands("#!2x", &operands, None), "#0x10");
    }
}
