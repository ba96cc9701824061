use std::fmt;

use crate::bytecode::{
    ARRAY_DATA_SIGNATURE, Format, IndexKind, Opcode, PACKED_SWITCH_SIGNATURE,
    SPARSE_SWITCH_SIGNATURE,
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DecodeError {
    Truncated { pc: usize, needed: usize, available: usize },
    InvalidArgCount { pc: usize, count: u32 },
    NotAPayload { pc: usize, unit: u16 },
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::Truncated {
                pc,
                needed,
                available,
            } => write!(
                f,
                "instruction at 0x{pc:04x} needs {needed} code units but only {available} remain"
            ),
            DecodeError::InvalidArgCount { pc, count } => {
                write!(f, "invalid argument count {count} at 0x{pc:04x}")
            }
            DecodeError::NotAPayload { pc, unit } => {
                write!(f, "expected payload at 0x{pc:04x}, found unit 0x{unit:04x}")
            }
        }
    }
}

impl std::error::Error for DecodeError {}

pub type DecodeResult<T> = Result<T, DecodeError>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PayloadKind {
    PackedSwitch,
    SparseSwitch,
    ArrayData,
}

/// One decoded instruction. Unused operand fields are zero.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DecodedInstruction {
    pub opcode: Opcode,
    pub v_a: u32,
    pub v_b: u32,
    pub v_b_wide: u64,
    pub v_c: u32,
    pub arg: [u32; 5],
    /// Width in code units, including any embedded payload.
    pub width: usize,
    pub payload: Option<PayloadKind>,
}

impl DecodedInstruction {
    fn empty(opcode: Opcode) -> Self {
        Self {
            opcode,
            v_a: 0,
            v_b: 0,
            v_b_wide: 0,
            v_c: 0,
            arg: [0; 5],
            width: opcode.width(),
            payload: None,
        }
    }

    pub fn index_kind(&self) -> IndexKind {
        self.opcode.index_kind()
    }

    pub fn is_payload(&self) -> bool {
        self.payload.is_some()
    }

    /// Relative branch offset in code units for goto/if instructions.
    pub fn branch_offset(&self) -> Option<i32> {
        match self.opcode.format() {
            Format::F10t | Format::F20t | Format::F30t => Some(self.v_a as i32),
            Format::F21t => Some(self.v_b as i32),
            Format::F22t => Some(self.v_c as i32),
            Format::F31t => Some(self.v_b as i32),
            _ => None,
        }
    }

    /// Registers named by a 35c-style argument list or a range instruction.
    pub fn argument_registers(&self) -> Vec<u32> {
        match self.opcode.format() {
            Format::F35c | Format::F35ms | Format::F35mi => {
                self.arg[..self.v_a as usize].to_vec()
            }
            Format::F3rc | Format::F3rms | Format::F3rmi => {
                (self.v_c..self.v_c + self.v_a).collect()
            }
            _ => Vec::new(),
        }
    }

    /// Renders the instruction the way a disassembler listing shows it.
    pub fn to_text(&self, pc: usize) -> String {
        if let Some(kind) = self.payload {
            let name = match kind {
                PayloadKind::PackedSwitch => "packed-switch-payload",
                PayloadKind::SparseSwitch => "sparse-switch-payload",
                PayloadKind::ArrayData => "array-data-payload",
            };
            return format!("{name} ({} units)", self.width);
        }
        let name = self.opcode.mnemonic();
        let target = |offset: i32| format!("0x{:04x}", pc as i64 + offset as i64);
        match self.opcode.format() {
            Format::F10x => name.to_string(),
            Format::F12x => format!("{name} v{}, v{}", self.v_a, self.v_b),
            Format::F11n => format!("{name} v{}, #{}", self.v_a, self.v_b as i32),
            Format::F11x => format!("{name} v{}", self.v_a),
            Format::F10t | Format::F20t | Format::F30t => {
                format!("{name} {}", target(self.v_a as i32))
            }
            Format::F20bc => format!("{name} #{}, kind@{}", self.v_a, self.v_b),
            Format::F22x | Format::F32x => format!("{name} v{}, v{}", self.v_a, self.v_b),
            Format::F21t => format!("{name} v{}, {}", self.v_a, target(self.v_b as i32)),
            Format::F21s | Format::F31i => format!("{name} v{}, #{}", self.v_a, self.v_b as i32),
            Format::F21h => format!("{name} v{}, #0x{:04x}", self.v_a, self.v_b),
            Format::F21c | Format::F31c => {
                format!("{name} v{}, {}@{}", self.v_a, index_label(self), self.v_b)
            }
            Format::F23x => format!("{name} v{}, v{}, v{}", self.v_a, self.v_b, self.v_c),
            Format::F22b | Format::F22s => format!(
                "{name} v{}, v{}, #{}",
                self.v_a, self.v_b, self.v_c as i32
            ),
            Format::F22t => format!(
                "{name} v{}, v{}, {}",
                self.v_a,
                self.v_b,
                target(self.v_c as i32)
            ),
            Format::F22c | Format::F22cs => format!(
                "{name} v{}, v{}, {}@{}",
                self.v_a,
                self.v_b,
                index_label(self),
                self.v_c
            ),
            Format::F31t => format!("{name} v{}, {}", self.v_a, target(self.v_b as i32)),
            Format::F35c | Format::F35ms | Format::F35mi => {
                let regs = self
                    .argument_registers()
                    .iter()
                    .map(|reg| format!("v{reg}"))
                    .collect::<Vec<_>>()
                    .join(", ");
                format!("{name} {{{regs}}}, {}@{}", index_label(self), self.v_b)
            }
            Format::F3rc | Format::F3rms | Format::F3rmi => {
                let last = (self.v_c + self.v_a).saturating_sub(1);
                format!(
                    "{name} {{v{} .. v{last}}}, {}@{}",
                    self.v_c,
                    index_label(self),
                    self.v_b
                )
            }
            Format::F51l => format!("{name} v{}, #{}", self.v_a, self.v_b_wide as i64),
        }
    }
}

fn index_label(insn: &DecodedInstruction) -> &'static str {
    match insn.index_kind() {
        IndexKind::TypeRef => "type",
        IndexKind::StringRef => "string",
        IndexKind::MethodRef => "method",
        IndexKind::FieldRef => "field",
        IndexKind::InlineMethod => "inline",
        IndexKind::VtableOffset => "vtable",
        IndexKind::FieldOffset => "offset",
        IndexKind::VarRef => "ref",
        IndexKind::None | IndexKind::Unknown => "index",
    }
}

fn fetch(insns: &[u16], pc: usize, offset: usize) -> u16 {
    insns[pc + offset]
}

fn fetch_u32(insns: &[u16], pc: usize, offset: usize) -> u32 {
    fetch(insns, pc, offset) as u32 | (fetch(insns, pc, offset + 1) as u32) << 16
}

fn ensure(insns: &[u16], pc: usize, needed: usize) -> DecodeResult<()> {
    let available = insns.len().saturating_sub(pc);
    if available < needed {
        return Err(DecodeError::Truncated {
            pc,
            needed,
            available,
        });
    }
    Ok(())
}

/// Width in code units of the instruction at `pc`, payloads included.
pub fn instruction_width(insns: &[u16], pc: usize) -> DecodeResult<usize> {
    ensure(insns, pc, 1)?;
    let unit = insns[pc];
    match payload_kind(unit) {
        Some(kind) => payload_width(insns, pc, kind),
        None => Ok(Opcode::from_u8((unit & 0xff) as u8).width()),
    }
}

fn payload_kind(unit: u16) -> Option<PayloadKind> {
    match unit {
        PACKED_SWITCH_SIGNATURE => Some(PayloadKind::PackedSwitch),
        SPARSE_SWITCH_SIGNATURE => Some(PayloadKind::SparseSwitch),
        ARRAY_DATA_SIGNATURE => Some(PayloadKind::ArrayData),
        _ => None,
    }
}

fn payload_width(insns: &[u16], pc: usize, kind: PayloadKind) -> DecodeResult<usize> {
    let header = match kind {
        PayloadKind::PackedSwitch | PayloadKind::SparseSwitch => 2,
        PayloadKind::ArrayData => 4,
    };
    ensure(insns, pc, header)?;
    let width = match kind {
        PayloadKind::PackedSwitch => 4 + insns[pc + 1] as usize * 2,
        PayloadKind::SparseSwitch => 2 + insns[pc + 1] as usize * 4,
        PayloadKind::ArrayData => {
            let element_width = insns[pc + 1] as usize;
            let length = fetch_u32(insns, pc, 2) as usize;
            4 + (element_width * length + 1) / 2
        }
    };
    ensure(insns, pc, width)?;
    Ok(width)
}

/// Decodes the instruction at `pc`.
pub fn decode(insns: &[u16], pc: usize) -> DecodeResult<DecodedInstruction> {
    ensure(insns, pc, 1)?;
    let inst = insns[pc];
    if let Some(kind) = payload_kind(inst) {
        let mut decoded = DecodedInstruction::empty(Opcode::Nop);
        decoded.width = payload_width(insns, pc, kind)?;
        decoded.payload = Some(kind);
        return Ok(decoded);
    }

    let opcode = Opcode::from_u8((inst & 0xff) as u8);
    let format = opcode.format();
    ensure(insns, pc, format.width())?;
    let mut d = DecodedInstruction::empty(opcode);
    let inst_a = ((inst >> 8) & 0x0f) as u32;
    let inst_b = (inst >> 12) as u32;
    let inst_aa = (inst >> 8) as u32;

    match format {
        Format::F10x => {}
        Format::F12x => {
            d.v_a = inst_a;
            d.v_b = inst_b;
        }
        Format::F11n => {
            d.v_a = inst_a;
            d.v_b = (((inst_b as i32) << 28) >> 28) as u32;
        }
        Format::F11x => d.v_a = inst_aa,
        Format::F10t => d.v_a = (inst_aa as u8 as i8) as i32 as u32,
        Format::F20t => d.v_a = fetch(insns, pc, 1) as i16 as i32 as u32,
        Format::F20bc | Format::F22x | Format::F21h | Format::F21c => {
            d.v_a = inst_aa;
            d.v_b = fetch(insns, pc, 1) as u32;
        }
        Format::F21t | Format::F21s => {
            d.v_a = inst_aa;
            d.v_b = fetch(insns, pc, 1) as i16 as i32 as u32;
        }
        Format::F23x => {
            let unit = fetch(insns, pc, 1);
            d.v_a = inst_aa;
            d.v_b = (unit & 0xff) as u32;
            d.v_c = (unit >> 8) as u32;
        }
        Format::F22b => {
            let unit = fetch(insns, pc, 1);
            d.v_a = inst_aa;
            d.v_b = (unit & 0xff) as u32;
            d.v_c = ((unit >> 8) as u8 as i8) as i32 as u32;
        }
        Format::F22s | Format::F22t => {
            d.v_a = inst_a;
            d.v_b = inst_b;
            d.v_c = fetch(insns, pc, 1) as i16 as i32 as u32;
        }
        Format::F22c | Format::F22cs => {
            d.v_a = inst_a;
            d.v_b = inst_b;
            d.v_c = fetch(insns, pc, 1) as u32;
        }
        Format::F30t => d.v_a = fetch_u32(insns, pc, 1),
        Format::F31t | Format::F31c | Format::F31i => {
            d.v_a = inst_aa;
            d.v_b = fetch_u32(insns, pc, 1);
        }
        Format::F32x => {
            d.v_a = fetch(insns, pc, 1) as u32;
            d.v_b = fetch(insns, pc, 2) as u32;
        }
        Format::F35c | Format::F35ms | Format::F35mi => {
            let count = inst_b;
            let reg_list = fetch(insns, pc, 2) as u32;
            if count > 5 || (count == 5 && format == Format::F35mi) {
                return Err(DecodeError::InvalidArgCount { pc, count });
            }
            d.v_a = count;
            d.v_b = fetch(insns, pc, 1) as u32;
            if count == 5 {
                d.arg[4] = inst_a;
            }
            for (slot, arg) in d.arg.iter_mut().enumerate().take(count.min(4) as usize) {
                *arg = (reg_list >> (slot * 4)) & 0x0f;
            }
            if count > 0 {
                d.v_c = d.arg[0];
            }
        }
        Format::F3rc | Format::F3rms | Format::F3rmi => {
            d.v_a = inst_aa;
            d.v_b = fetch(insns, pc, 1) as u32;
            d.v_c = fetch(insns, pc, 2) as u32;
        }
        Format::F51l => {
            d.v_a = inst_aa;
            d.v_b_wide = fetch_u32(insns, pc, 1) as u64 | (fetch_u32(insns, pc, 3) as u64) << 32;
        }
    }
    Ok(d)
}

/// Iterates every instruction, payloads included, in code order.
pub struct InstructionIter<'a> {
    insns: &'a [u16],
    pc: usize,
}

impl<'a> InstructionIter<'a> {
    pub fn new(insns: &'a [u16]) -> Self {
        Self { insns, pc: 0 }
    }
}

impl Iterator for InstructionIter<'_> {
    type Item = DecodeResult<(usize, DecodedInstruction)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pc >= self.insns.len() {
            return None;
        }
        let pc = self.pc;
        match decode(self.insns, pc) {
            Ok(insn) => {
                self.pc += insn.width;
                Some(Ok((pc, insn)))
            }
            Err(err) => {
                self.pc = self.insns.len();
                Some(Err(err))
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PackedSwitch {
    pub first_key: i32,
    pub targets: Vec<i32>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArrayData {
    pub element_width: usize,
    pub length: usize,
    pub bytes: Vec<u8>,
}

pub fn read_packed_switch(insns: &[u16], pc: usize) -> DecodeResult<PackedSwitch> {
    expect_payload(insns, pc, PACKED_SWITCH_SIGNATURE)?;
    payload_width(insns, pc, PayloadKind::PackedSwitch)?;
    let size = insns[pc + 1] as usize;
    let first_key = fetch_u32(insns, pc, 2) as i32;
    let targets = (0..size)
        .map(|i| fetch_u32(insns, pc, 4 + i * 2) as i32)
        .collect();
    Ok(PackedSwitch { first_key, targets })
}

/// Returns `(key, target)` pairs in payload order.
pub fn read_sparse_switch(insns: &[u16], pc: usize) -> DecodeResult<Vec<(i32, i32)>> {
    expect_payload(insns, pc, SPARSE_SWITCH_SIGNATURE)?;
    payload_width(insns, pc, PayloadKind::SparseSwitch)?;
    let size = insns[pc + 1] as usize;
    Ok((0..size)
        .map(|i| {
            let key = fetch_u32(insns, pc, 2 + i * 2) as i32;
            let target = fetch_u32(insns, pc, 2 + size * 2 + i * 2) as i32;
            (key, target)
        })
        .collect())
}

pub fn read_array_data(insns: &[u16], pc: usize) -> DecodeResult<ArrayData> {
    expect_payload(insns, pc, ARRAY_DATA_SIGNATURE)?;
    payload_width(insns, pc, PayloadKind::ArrayData)?;
    let element_width = insns[pc + 1] as usize;
    let length = fetch_u32(insns, pc, 2) as usize;
    let total = element_width * length;
    let bytes = insns[pc + 4..]
        .iter()
        .flat_map(|unit| unit.to_le_bytes())
        .take(total)
        .collect();
    Ok(ArrayData {
        element_width,
        length,
        bytes,
    })
}

fn expect_payload(insns: &[u16], pc: usize, signature: u16) -> DecodeResult<()> {
    ensure(insns, pc, 1)?;
    if insns[pc] != signature {
        return Err(DecodeError::NotAPayload {
            pc,
            unit: insns[pc],
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_23x_operands() {
        let insns = [0x0090 | (3 << 8), 0x0201];
        let insn = decode(&insns, 0).expect("add-int should decode");
        assert_eq!(insn.opcode, Opcode::AddInt);
        assert_eq!((insn.v_a, insn.v_b, insn.v_c), (3, 1, 2));
        assert_eq!(insn.width, 2);
    }

    #[test]
    fn sign_extends_nibble_literal() {
        let insns = [0x0012 | (0xf << 12) | (1 << 8)];
        let insn = decode(&insns, 0).expect("const/4 should decode");
        assert_eq!(insn.v_a, 1);
        assert_eq!(insn.v_b as i32, -1);
    }

    #[test]
    fn decodes_five_argument_invoke() {
        // invoke-static {v1, v2, v3, v4, v5}, method@7
        let insns = [0x0071 | (5 << 12) | (5 << 8), 7, 0x4321];
        let insn = decode(&insns, 0).expect("invoke should decode");
        assert_eq!(insn.v_a, 5);
        assert_eq!(insn.v_b, 7);
        assert_eq!(insn.arg, [1, 2, 3, 4, 5]);
        assert_eq!(insn.v_c, 1);
        assert_eq!(insn.argument_registers(), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn rejects_fifth_inline_argument() {
        let insns = [0x00ee | (5 << 12), 0, 0];
        assert_eq!(
            decode(&insns, 0),
            Err(DecodeError::InvalidArgCount { pc: 0, count: 5 })
        );
    }

    #[test]
    fn decodes_wide_literal() {
        let insns = [0x0018, 0x5678, 0x1234, 0xdef0, 0x9abc];
        let insn = decode(&insns, 0).expect("const-wide should decode");
        assert_eq!(insn.v_b_wide, 0x9abc_def0_1234_5678);
        assert_eq!(insn.width, 5);
    }

    #[test]
    fn payload_widths_come_from_embedded_counts() {
        let packed = [PACKED_SWITCH_SIGNATURE, 2, 0, 0, 4, 0, 6, 0];
        assert_eq!(instruction_width(&packed, 0), Ok(8));
        let sparse = [SPARSE_SWITCH_SIGNATURE, 1, 5, 0, 9, 0];
        assert_eq!(instruction_width(&sparse, 0), Ok(6));
        let array = [ARRAY_DATA_SIGNATURE, 1, 3, 0, 0x0201, 0x0003];
        assert_eq!(instruction_width(&array, 0), Ok(6));
        let data = read_array_data(&array, 0).expect("array data should read");
        assert_eq!(data.bytes, vec![1, 2, 3]);
    }

    #[test]
    fn truncated_instruction_is_reported() {
        let insns = [0x0014];
        assert!(matches!(
            decode(&insns, 0),
            Err(DecodeError::Truncated { needed: 3, .. })
        ));
    }

    #[test]
    fn iterator_walks_over_payloads() {
        let insns = [0x002b, 4, 0, 0x000e, PACKED_SWITCH_SIGNATURE, 1, 0, 0, 3, 0];
        let pcs: Vec<usize> = InstructionIter::new(&insns)
            .map(|item| item.expect("decode").0)
            .collect();
        assert_eq!(pcs, vec![0, 3, 4]);
        let switch = read_packed_switch(&insns, 4).expect("payload");
        assert_eq!(switch.targets, vec![3]);
    }
}
