//! Text assembler for register bytecode.
//!
//! ```text
//! .method static LFoo;->count(I)I
//! .registers 3
//! .ins 1
//!     const/4 v0, 0
//! :loop
//!     if-ge v0, v2, :done
//!     add-int/lit8 v0, v0, 1
//!     goto :loop
//! :done
//!     return v0
//! .end method
//! ```
//!
//! Operands are registers (`v3`, or `p0` for the first incoming argument), literals (`5`,
//! `-0x10`, optionally prefixed with `#`), labels (`:loop`), pool indices (`method@3`) and
//! register lists (`{v0, v1}` or `{v0 .. v4}`). `.packed-switch`, `.sparse-switch` and
//! `.array-data` blocks emit payloads, padded to an even code unit.

use std::collections::HashMap;
use std::fmt;
use std::sync::LazyLock;

use regex::Regex;

use crate::bytecode::{
    ARRAY_DATA_SIGNATURE, Format, Opcode, PACKED_SWITCH_SIGNATURE, SPARSE_SWITCH_SIGNATURE,
};
use crate::method::{CodeItem, MethodBuilder};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AsmError {
    pub line: usize,
    pub message: String,
}

impl AsmError {
    fn new(line: usize, message: impl Into<String>) -> Self {
        Self {
            line,
            message: message.into(),
        }
    }
}

impl fmt::Display for AsmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}: {}", self.line, self.message)
    }
}

impl std::error::Error for AsmError {}

type AsmResult<T> = Result<T, AsmError>;

fn pattern(source: &str) -> Regex {
    Regex::new(source).unwrap_or_else(|err| panic!("bad assembler pattern {source}: {err}"))
}

static METHOD_RE: LazyLock<Regex> = LazyLock::new(|| {
    pattern(r"^\.method\s+((?:[a-z]+\s+)*)(L[^;\s]+;)->([\w<>$-]+)\(([^)]*)\)(\S+)$")
});
static DIRECTIVE_RE: LazyLock<Regex> =
    LazyLock::new(|| pattern(r"^\.(registers|ins)\s+(\d+)$"));
static LABEL_RE: LazyLock<Regex> = LazyLock::new(|| pattern(r"^:([\w$-]+)$"));
static OPERAND_RE: LazyLock<Regex> = LazyLock::new(|| pattern(r"\{[^}]*\}|[^,\s][^,]*"));
static REGISTER_RE: LazyLock<Regex> = LazyLock::new(|| pattern(r"^([vp])(\d+)$"));
static INDEX_RE: LazyLock<Regex> = LazyLock::new(|| pattern(r"^([a-z]+)@(\d+|0x[0-9a-fA-F]+)$"));
static RANGE_RE: LazyLock<Regex> =
    LazyLock::new(|| pattern(r"^\{\s*([vp]\d+)\s*\.\.\s*([vp]\d+)\s*\}$"));
static CASE_RE: LazyLock<Regex> = LazyLock::new(|| pattern(r"^(\S+)\s*->\s*:([\w$-]+)$"));

/// Assembles a source holding exactly one method.
pub fn assemble_method(source: &str) -> Result<MethodBuilder, AsmError> {
    let mut methods = assemble_methods(source)?;
    match methods.len() {
        1 => Ok(methods.remove(0)),
        count => Err(AsmError::new(
            0,
            format!("expected exactly one method, found {count}"),
        )),
    }
}

pub fn assemble_methods(source: &str) -> Result<Vec<MethodBuilder>, AsmError> {
    let mut methods = Vec::new();
    let mut current: Option<MethodSource> = None;
    let mut lines = source.lines().enumerate();

    while let Some((index, raw)) = lines.next() {
        let line_no = index + 1;
        let line = strip_comments(raw).trim();
        if line.is_empty() {
            continue;
        }

        let Some(method) = current.as_mut() else {
            if line.starts_with(".method") {
                current = Some(MethodSource::header(line, line_no)?);
                continue;
            }
            return Err(AsmError::new(line_no, format!("expected .method, found '{line}'")));
        };

        if line == ".end method" {
            if let Some(method) = current.take() {
                methods.push(method.finish()?);
            }
            continue;
        }
        if let Some(caps) = DIRECTIVE_RE.captures(line) {
            let value: u16 = caps[2]
                .parse()
                .map_err(|_| AsmError::new(line_no, format!("invalid count '{}'", &caps[2])))?;
            match &caps[1] {
                "registers" => method.registers = Some(value),
                _ => method.ins = Some(value),
            }
            continue;
        }
        if let Some(caps) = LABEL_RE.captures(line) {
            method.items.push(Item::Label(caps[1].to_string(), line_no));
            continue;
        }
        if let Some(rest) = line.strip_prefix(".packed-switch") {
            let first_key = parse_literal(rest.trim(), line_no)?;
            let targets = payload_body(&mut lines, ".end packed-switch", line_no)?
                .into_iter()
                .map(|(body_line, text)| {
                    LABEL_RE
                        .captures(&text)
                        .map(|caps| caps[1].to_string())
                        .ok_or_else(|| {
                            AsmError::new(body_line, format!("expected case label, found '{text}'"))
                        })
                })
                .collect::<AsmResult<Vec<_>>>()?;
            method.items.push(Item::Payload(
                Payload::Packed {
                    first_key: to_i32(first_key, line_no)?,
                    targets,
                },
                line_no,
            ));
            continue;
        }
        if line == ".sparse-switch" {
            let cases = payload_body(&mut lines, ".end sparse-switch", line_no)?
                .into_iter()
                .map(|(body_line, text)| {
                    let caps = CASE_RE.captures(&text).ok_or_else(|| {
                        AsmError::new(body_line, format!("expected 'key -> :label', found '{text}'"))
                    })?;
                    let key = to_i32(parse_literal(&caps[1], body_line)?, body_line)?;
                    Ok((key, caps[2].to_string()))
                })
                .collect::<AsmResult<Vec<_>>>()?;
            method.items.push(Item::Payload(Payload::Sparse { cases }, line_no));
            continue;
        }
        if let Some(rest) = line.strip_prefix(".array-data") {
            let element_width = match parse_literal(rest.trim(), line_no)? {
                width @ (1 | 2 | 4 | 8) => width as usize,
                other => {
                    return Err(AsmError::new(line_no, format!("invalid element width {other}")));
                }
            };
            let mut bytes = Vec::new();
            for (body_line, text) in payload_body(&mut lines, ".end array-data", line_no)? {
                for token in text.split_whitespace() {
                    let value = parse_literal(token, body_line)?;
                    bytes.extend_from_slice(&value.to_le_bytes()[..element_width]);
                }
            }
            method.items.push(Item::Payload(
                Payload::Array {
                    element_width,
                    bytes,
                },
                line_no,
            ));
            continue;
        }
        if line.starts_with('.') {
            return Err(AsmError::new(line_no, format!("unknown directive '{line}'")));
        }
        method.items.push(Item::Insn(parse_insn(line, line_no)?));
    }

    if let Some(method) = current {
        return Err(AsmError::new(
            method.line,
            format!("method {} has no .end method", method.name),
        ));
    }
    Ok(methods)
}

fn strip_comments(line: &str) -> &str {
    let bytes = line.as_bytes();
    for (at, byte) in bytes.iter().enumerate() {
        let next = bytes.get(at + 1).copied();
        match (byte, next) {
            (b'/', Some(b'/')) => return &line[..at],
            // `#5` is a literal, `# text` a comment.
            (b'#', None) => return &line[..at],
            (b'#', Some(next)) if next.is_ascii_whitespace() => return &line[..at],
            _ => {}
        }
    }
    line
}

fn payload_body<'a>(
    lines: &mut impl Iterator<Item = (usize, &'a str)>,
    end: &str,
    start_line: usize,
) -> AsmResult<Vec<(usize, String)>> {
    let mut body = Vec::new();
    for (index, raw) in lines.by_ref() {
        let text = strip_comments(raw).trim();
        if text.is_empty() {
            continue;
        }
        if text == end {
            return Ok(body);
        }
        body.push((index + 1, text.to_string()));
    }
    Err(AsmError::new(start_line, format!("missing {end}")))
}

struct MethodSource {
    line: usize,
    class_descriptor: String,
    name: String,
    shorty: String,
    is_static: bool,
    /// Incoming argument words implied by the signature, `this` included.
    signature_ins: u16,
    registers: Option<u16>,
    ins: Option<u16>,
    items: Vec<Item>,
}

enum Item {
    Label(String, usize),
    Insn(Insn),
    Payload(Payload, usize),
}

enum Payload {
    Packed { first_key: i32, targets: Vec<String> },
    Sparse { cases: Vec<(i32, String)> },
    Array { element_width: usize, bytes: Vec<u8> },
}

impl Payload {
    fn width(&self) -> usize {
        match self {
            Payload::Packed { targets, .. } => 4 + targets.len() * 2,
            Payload::Sparse { cases } => 2 + cases.len() * 4,
            Payload::Array { bytes, .. } => 4 + bytes.len().div_ceil(2),
        }
    }
}

struct Insn {
    opcode: Opcode,
    operands: Vec<String>,
    line: usize,
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Operand {
    Reg(u32),
    Literal(i64),
    Label(String),
    Index(u32),
    RegList(Vec<u32>),
    RegRange(u32, u32),
}

impl MethodSource {
    fn header(line: &str, line_no: usize) -> AsmResult<Self> {
        let caps = METHOD_RE
            .captures(line)
            .ok_or_else(|| AsmError::new(line_no, format!("malformed method header '{line}'")))?;
        let mut is_static = false;
        for modifier in caps[1].split_whitespace() {
            match modifier {
                "static" => is_static = true,
                "public" | "private" | "protected" | "final" => {}
                other => {
                    return Err(AsmError::new(line_no, format!("unsupported modifier '{other}'")));
                }
            }
        }
        let params = parse_types(&caps[4], line_no)?;
        let ret = parse_types(&caps[5], line_no)?;
        let [ret] = ret.as_slice() else {
            return Err(AsmError::new(line_no, "expected a single return type"));
        };
        let mut shorty = String::new();
        shorty.push(*ret);
        let mut signature_ins = u16::from(!is_static);
        for param in &params {
            shorty.push(*param);
            signature_ins += if matches!(param, 'J' | 'D') { 2 } else { 1 };
        }
        Ok(Self {
            line: line_no,
            class_descriptor: caps[2].to_string(),
            name: caps[3].to_string(),
            shorty,
            is_static,
            signature_ins,
            registers: None,
            ins: None,
            items: Vec::new(),
        })
    }

    fn finish(self) -> AsmResult<MethodBuilder> {
        let registers = self.registers.ok_or_else(|| {
            AsmError::new(self.line, format!("method {} is missing .registers", self.name))
        })?;
        let ins = self.ins.unwrap_or(self.signature_ins);
        if ins > registers {
            return Err(AsmError::new(
                self.line,
                format!("{ins} ins do not fit in {registers} registers"),
            ));
        }
        let insns = encode_items(&self.items, registers, ins)?;
        let mut builder = MethodBuilder::new(&self.class_descriptor, &self.name, &self.shorty)
            .code(CodeItem::new(registers, ins, insns));
        if self.is_static {
            builder = builder.static_method();
        }
        Ok(builder)
    }
}

/// Maps a type list such as `IJ[ILFoo;` to shorty characters.
fn parse_types(text: &str, line_no: usize) -> AsmResult<Vec<char>> {
    let mut out = Vec::new();
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            'V' | 'Z' | 'B' | 'S' | 'C' | 'I' | 'J' | 'F' | 'D' => out.push(c),
            'L' => {
                if !chars.by_ref().any(|c| c == ';') {
                    return Err(AsmError::new(line_no, format!("unterminated class in '{text}'")));
                }
                out.push('L');
            }
            '[' => {
                while chars.next_if_eq(&'[').is_some() {}
                match chars.next() {
                    Some('L') => {
                        if !chars.by_ref().any(|c| c == ';') {
                            return Err(AsmError::new(
                                line_no,
                                format!("unterminated class in '{text}'"),
                            ));
                        }
                    }
                    Some('Z' | 'B' | 'S' | 'C' | 'I' | 'J' | 'F' | 'D') => {}
                    _ => return Err(AsmError::new(line_no, format!("bad array type in '{text}'"))),
                }
                out.push('L');
            }
            other => {
                return Err(AsmError::new(line_no, format!("unknown type '{other}' in '{text}'")));
            }
        }
    }
    Ok(out)
}

fn parse_insn(line: &str, line_no: usize) -> AsmResult<Insn> {
    let (mnemonic, rest) = line
        .split_once(char::is_whitespace)
        .map_or((line, ""), |(mnemonic, rest)| (mnemonic, rest.trim()));
    let opcode = Opcode::parse_mnemonic(mnemonic)
        .ok_or_else(|| AsmError::new(line_no, format!("unknown opcode '{mnemonic}'")))?;
    let operands = OPERAND_RE
        .find_iter(rest)
        .map(|found| found.as_str().trim().to_string())
        .collect();
    Ok(Insn {
        opcode,
        operands,
        line: line_no,
    })
}

fn parse_literal(token: &str, line_no: usize) -> AsmResult<i64> {
    let text = token.strip_prefix('#').unwrap_or(token);
    let text = text.strip_suffix(['L', 'l']).unwrap_or(text);
    let (negative, digits) = match text.strip_prefix('-') {
        Some(digits) => (true, digits),
        None => (false, text),
    };
    let magnitude = match digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => digits.parse::<u64>(),
    }
    .map_err(|_| AsmError::new(line_no, format!("invalid literal '{token}'")))?;
    let value = magnitude as i64;
    Ok(if negative { value.wrapping_neg() } else { value })
}

fn to_i32(value: i64, line_no: usize) -> AsmResult<i32> {
    i32::try_from(value)
        .or_else(|_| u32::try_from(value).map(|bits| bits as i32))
        .map_err(|_| AsmError::new(line_no, format!("{value} does not fit in 32 bits")))
}

struct Encoder<'a> {
    registers: u16,
    ins: u16,
    labels: &'a HashMap<String, usize>,
    /// Payload label to the pc of the instruction that refers to it.
    payload_users: &'a HashMap<String, usize>,
}

impl Encoder<'_> {
    fn register(&self, token: &str, line_no: usize) -> AsmResult<u32> {
        let caps = REGISTER_RE
            .captures(token)
            .ok_or_else(|| AsmError::new(line_no, format!("expected register, found '{token}'")))?;
        let number: u32 = caps[2]
            .parse()
            .map_err(|_| AsmError::new(line_no, format!("invalid register '{token}'")))?;
        let reg = match &caps[1] {
            "p" => number + (self.registers - self.ins) as u32,
            _ => number,
        };
        if reg >= self.registers as u32 {
            return Err(AsmError::new(
                line_no,
                format!("register {token} outside the {} declared", self.registers),
            ));
        }
        Ok(reg)
    }

    fn operand(&self, token: &str, line_no: usize) -> AsmResult<Operand> {
        if let Some(caps) = RANGE_RE.captures(token) {
            let first = self.register(&caps[1], line_no)?;
            let last = self.register(&caps[2], line_no)?;
            if last < first {
                return Err(AsmError::new(line_no, format!("empty register range '{token}'")));
            }
            return Ok(Operand::RegRange(first, last - first + 1));
        }
        if let Some(inner) = token.strip_prefix('{').and_then(|t| t.strip_suffix('}')) {
            let regs = inner
                .split(',')
                .map(str::trim)
                .filter(|reg| !reg.is_empty())
                .map(|reg| self.register(reg, line_no))
                .collect::<AsmResult<Vec<_>>>()?;
            return Ok(Operand::RegList(regs));
        }
        if let Some(label) = token.strip_prefix(':') {
            return Ok(Operand::Label(label.to_string()));
        }
        if REGISTER_RE.is_match(token) {
            return self.register(token, line_no).map(Operand::Reg);
        }
        if let Some(caps) = INDEX_RE.captures(token) {
            let index = parse_literal(&caps[2], line_no)?;
            return u32::try_from(index)
                .map(Operand::Index)
                .map_err(|_| AsmError::new(line_no, format!("index out of range in '{token}'")));
        }
        parse_literal(token, line_no).map(Operand::Literal)
    }

    fn target(&self, label: &str, pc: usize, line_no: usize) -> AsmResult<i64> {
        let target = self
            .labels
            .get(label)
            .ok_or_else(|| AsmError::new(line_no, format!("unknown label ':{label}'")))?;
        Ok(*target as i64 - pc as i64)
    }

    fn encode(&self, insn: &Insn, pc: usize, out: &mut Vec<u16>) -> AsmResult<()> {
        let line_no = insn.line;
        let operands = insn
            .operands
            .iter()
            .map(|token| self.operand(token, line_no))
            .collect::<AsmResult<Vec<_>>>()?;
        let op = insn.opcode as u16;
        let format = insn.opcode.format();
        let bad = || {
            AsmError::new(
                line_no,
                format!("operands {:?} do not match {}", insn.operands, insn.opcode),
            )
        };
        let fit = |value: i64, bits: u32, signed: bool| -> AsmResult<u32> {
            let (min, max) = if signed {
                (-(1i64 << (bits - 1)), (1i64 << (bits - 1)) - 1)
            } else {
                (0, (1i64 << bits) - 1)
            };
            if value < min || value > max {
                return Err(AsmError::new(
                    line_no,
                    format!("{value} does not fit the {bits}-bit field of {}", insn.opcode),
                ));
            }
            Ok((value as u32) & (((1u64 << bits) - 1) as u32))
        };
        let branch = |label: &str| self.target(label, pc, line_no);

        use Operand::{Index, Label, Literal, Reg, RegList, RegRange};
        match (format, operands.as_slice()) {
            (Format::F10x, []) => out.push(op),
            (Format::F12x, [Reg(a), Reg(b)]) => {
                out.push(op | (fit(*a as i64, 4, false)? as u16) << 8 | (fit(*b as i64, 4, false)? as u16) << 12);
            }
            (Format::F11n, [Reg(a), Literal(lit)]) => {
                out.push(op | (fit(*a as i64, 4, false)? as u16) << 8 | (fit(*lit, 4, true)? as u16) << 12);
            }
            (Format::F11x, [Reg(a)]) => out.push(op | (fit(*a as i64, 8, false)? as u16) << 8),
            (Format::F10t, [Label(label)]) => {
                out.push(op | (fit(branch(label)?, 8, true)? as u16) << 8);
            }
            (Format::F20t, [Label(label)]) => {
                out.extend([op, fit(branch(label)?, 16, true)? as u16]);
            }
            (Format::F20bc, [Literal(kind), Index(index)]) => {
                out.extend([op | (fit(*kind, 8, false)? as u16) << 8, fit(*index as i64, 16, false)? as u16]);
            }
            (Format::F22x, [Reg(a), Reg(b)]) => {
                out.extend([op | (fit(*a as i64, 8, false)? as u16) << 8, fit(*b as i64, 16, false)? as u16]);
            }
            (Format::F21t, [Reg(a), Label(label)]) => {
                out.extend([op | (fit(*a as i64, 8, false)? as u16) << 8, fit(branch(label)?, 16, true)? as u16]);
            }
            (Format::F21s, [Reg(a), Literal(lit)]) => {
                out.extend([op | (fit(*a as i64, 8, false)? as u16) << 8, fit(*lit, 16, true)? as u16]);
            }
            (Format::F21h, [Reg(a), Literal(lit)]) => {
                let shift = if insn.opcode == Opcode::ConstWideHigh16 { 48 } else { 16 };
                let low_mask = (1u64 << shift) - 1;
                if (*lit as u64) & low_mask != 0 {
                    return Err(AsmError::new(
                        line_no,
                        format!("{} only sets the top 16 bits", insn.opcode),
                    ));
                }
                let high = ((*lit as u64) >> shift) as u16;
                out.extend([op | (fit(*a as i64, 8, false)? as u16) << 8, high]);
            }
            (Format::F21c, [Reg(a), Index(index)]) => {
                out.extend([op | (fit(*a as i64, 8, false)? as u16) << 8, fit(*index as i64, 16, false)? as u16]);
            }
            (Format::F23x, [Reg(a), Reg(b), Reg(c)]) => {
                out.extend([
                    op | (fit(*a as i64, 8, false)? as u16) << 8,
                    fit(*b as i64, 8, false)? as u16 | (fit(*c as i64, 8, false)? as u16) << 8,
                ]);
            }
            (Format::F22b, [Reg(a), Reg(b), Literal(lit)]) => {
                out.extend([
                    op | (fit(*a as i64, 8, false)? as u16) << 8,
                    fit(*b as i64, 8, false)? as u16 | (fit(*lit, 8, true)? as u16) << 8,
                ]);
            }
            (Format::F22t, [Reg(a), Reg(b), Label(label)]) => {
                out.extend([
                    op | (fit(*a as i64, 4, false)? as u16) << 8 | (fit(*b as i64, 4, false)? as u16) << 12,
                    fit(branch(label)?, 16, true)? as u16,
                ]);
            }
            (Format::F22s, [Reg(a), Reg(b), Literal(lit)]) => {
                out.extend([
                    op | (fit(*a as i64, 4, false)? as u16) << 8 | (fit(*b as i64, 4, false)? as u16) << 12,
                    fit(*lit, 16, true)? as u16,
                ]);
            }
            (Format::F22c | Format::F22cs, [Reg(a), Reg(b), Index(index)]) => {
                out.extend([
                    op | (fit(*a as i64, 4, false)? as u16) << 8 | (fit(*b as i64, 4, false)? as u16) << 12,
                    fit(*index as i64, 16, false)? as u16,
                ]);
            }
            (Format::F30t, [Label(label)]) => {
                let offset = fit(branch(label)?, 32, true)?;
                out.extend([op, offset as u16, (offset >> 16) as u16]);
            }
            (Format::F32x, [Reg(a), Reg(b)]) => {
                out.extend([op, fit(*a as i64, 16, false)? as u16, fit(*b as i64, 16, false)? as u16]);
            }
            (Format::F31i, [Reg(a), Literal(lit)]) => {
                let value = if insn.opcode == Opcode::ConstWide32 {
                    fit(*lit, 32, true)?
                } else {
                    to_i32(*lit, line_no)? as u32
                };
                out.extend([op | (fit(*a as i64, 8, false)? as u16) << 8, value as u16, (value >> 16) as u16]);
            }
            (Format::F31t, [Reg(a), Label(label)]) => {
                if self.payload_users.get(label) != Some(&pc) {
                    return Err(AsmError::new(
                        line_no,
                        format!("payload ':{label}' is referenced more than once"),
                    ));
                }
                let offset = fit(branch(label)?, 32, true)?;
                out.extend([op | (fit(*a as i64, 8, false)? as u16) << 8, offset as u16, (offset >> 16) as u16]);
            }
            (Format::F31c, [Reg(a), Index(index)]) => {
                out.extend([op | (fit(*a as i64, 8, false)? as u16) << 8, *index as u16, (*index >> 16) as u16]);
            }
            (Format::F35c | Format::F35ms | Format::F35mi, [RegList(regs), Index(index)]) => {
                let max = if format == Format::F35mi { 4 } else { 5 };
                if regs.len() > max {
                    return Err(AsmError::new(line_no, format!("at most {max} registers in a list")));
                }
                let mut list = 0u16;
                for (slot, reg) in regs.iter().take(4).enumerate() {
                    list |= (fit(*reg as i64, 4, false)? as u16) << (slot * 4);
                }
                let fifth = match regs.get(4) {
                    Some(reg) => fit(*reg as i64, 4, false)? as u16,
                    None => 0,
                };
                out.extend([
                    op | fifth << 8 | (regs.len() as u16) << 12,
                    fit(*index as i64, 16, false)? as u16,
                    list,
                ]);
            }
            (Format::F3rc | Format::F3rms | Format::F3rmi, [range, Index(index)]) => {
                let (first, count) = match range {
                    RegRange(first, count) => (*first, *count),
                    RegList(regs) if regs.is_empty() => (0, 0),
                    RegList(regs) if regs.windows(2).all(|pair| pair[1] == pair[0] + 1) => {
                        (regs[0], regs.len() as u32)
                    }
                    _ => return Err(bad()),
                };
                out.extend([
                    op | (fit(count as i64, 8, false)? as u16) << 8,
                    fit(*index as i64, 16, false)? as u16,
                    fit(first as i64, 16, false)? as u16,
                ]);
            }
            (Format::F51l, [Reg(a), Literal(lit)]) => {
                let bits = *lit as u64;
                out.extend([
                    op | (fit(*a as i64, 8, false)? as u16) << 8,
                    bits as u16,
                    (bits >> 16) as u16,
                    (bits >> 32) as u16,
                    (bits >> 48) as u16,
                ]);
            }
            _ => return Err(bad()),
        }
        Ok(())
    }

    fn encode_payload(
        &self,
        payload: &Payload,
        label: Option<&str>,
        line_no: usize,
        out: &mut Vec<u16>,
    ) -> AsmResult<()> {
        let base = match payload {
            Payload::Array { .. } => 0,
            _ => label
                .and_then(|label| self.payload_users.get(label))
                .copied()
                .ok_or_else(|| AsmError::new(line_no, "switch payload is never referenced"))?,
        };
        let relative = |label: &str| -> AsmResult<u32> {
            let target = self.target(label, base, line_no)?;
            Ok(to_i32(target, line_no)? as u32)
        };
        let push_u32 = |out: &mut Vec<u16>, value: u32| out.extend([value as u16, (value >> 16) as u16]);
        match payload {
            Payload::Packed { first_key, targets } => {
                out.extend([PACKED_SWITCH_SIGNATURE, targets.len() as u16]);
                push_u32(out, *first_key as u32);
                for target in targets {
                    push_u32(out, relative(target)?);
                }
            }
            Payload::Sparse { cases } => {
                if cases.windows(2).any(|pair| pair[0].0 >= pair[1].0) {
                    return Err(AsmError::new(line_no, "sparse-switch keys must be ascending"));
                }
                out.extend([SPARSE_SWITCH_SIGNATURE, cases.len() as u16]);
                for (key, _) in cases {
                    push_u32(out, *key as u32);
                }
                for (_, target) in cases {
                    push_u32(out, relative(target)?);
                }
            }
            Payload::Array {
                element_width,
                bytes,
            } => {
                let length = (bytes.len() / element_width) as u32;
                out.extend([ARRAY_DATA_SIGNATURE, *element_width as u16]);
                push_u32(out, length);
                out.extend(
                    bytes
                        .chunks(2)
                        .map(|pair| pair[0] as u16 | (pair.get(1).copied().unwrap_or(0) as u16) << 8),
                );
            }
        }
        Ok(())
    }
}

fn encode_items(items: &[Item], registers: u16, ins: u16) -> AsmResult<Vec<u16>> {
    // Layout pass: pcs of labels and instructions.
    let mut labels = HashMap::new();
    let mut pcs = Vec::with_capacity(items.len());
    let mut pc = 0usize;
    for item in items {
        match item {
            Item::Label(name, line_no) => {
                if labels.insert(name.clone(), pc).is_some() {
                    return Err(AsmError::new(*line_no, format!("duplicate label ':{name}'")));
                }
            }
            Item::Payload(payload, _) => {
                pc += pc % 2;
                // A label written just before the payload names the aligned address.
                for label in preceding_labels(items, pcs.len()) {
                    labels.insert(label.to_string(), pc);
                }
                pcs.push(pc);
                pc += payload.width();
                continue;
            }
            Item::Insn(insn) => {
                pcs.push(pc);
                pc += insn.opcode.width();
                continue;
            }
        }
        pcs.push(pc);
    }

    let mut payload_users = HashMap::new();
    for (item, pc) in items.iter().zip(&pcs) {
        if let Item::Insn(insn) = item {
            if insn.opcode.format() == Format::F31t {
                if let Some(label) = insn.operands.get(1).and_then(|op| op.strip_prefix(':')) {
                    payload_users.entry(label.to_string()).or_insert(*pc);
                }
            }
        }
    }

    let encoder = Encoder {
        registers,
        ins,
        labels: &labels,
        payload_users: &payload_users,
    };
    let mut out = Vec::with_capacity(pc);
    for (index, (item, pc)) in items.iter().zip(&pcs).enumerate() {
        match item {
            Item::Label(..) => {}
            Item::Insn(insn) => encoder.encode(insn, *pc, &mut out)?,
            Item::Payload(payload, line_no) => {
                while out.len() < *pc {
                    out.push(Opcode::Nop as u16);
                }
                let label = preceding_labels(items, index).last().copied();
                encoder.encode_payload(payload, label, *line_no, &mut out)?;
            }
        }
    }
    Ok(out)
}

/// Labels written immediately before item `index`.
fn preceding_labels(items: &[Item], index: usize) -> Vec<&str> {
    let mut labels: Vec<&str> = items[..index]
        .iter()
        .rev()
        .map_while(|item| match item {
            Item::Label(name, _) => Some(name.as_str()),
            _ => None,
        })
        .collect();
    labels.reverse();
    labels
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::{decode, read_array_data, read_packed_switch, read_sparse_switch};
    use crate::method::MethodTable;

    fn insns(source: &str) -> Vec<u16> {
        let table = MethodTable::new();
        let method = table.register(assemble_method(source).expect("assemble"));
        method.code_item().expect("code").insns.clone()
    }

    #[test]
    fn header_sets_shorty_and_ins() {
        let table = MethodTable::new();
        let method = table.register(
            assemble_method(
                "
.method LFoo;->mix(J[ILjava/lang/String;)Z
.registers 6
    return-void
.end method
",
            )
            .expect("assemble"),
        );
        assert_eq!(method.shorty(), "ZJLL");
        assert_eq!(method.ins_size(), 5);
        assert!(!method.is_static());
        assert_eq!(method.pretty_name(), "Foo.mix");
    }

    #[test]
    fn branches_resolve_relative_to_the_instruction() {
        let code = insns(
            "
.method static LFoo;->f(I)I
.registers 2
.ins 1
:top
    if-eqz p0, :out   # forward
    add-int/lit8 v0, v0, -1
    goto :top
:out
    return v0
.end method
",
        );
        let if_eqz = decode(&code, 0).expect("if");
        assert_eq!(if_eqz.v_a, 1);
        assert_eq!(if_eqz.branch_offset(), Some(5));
        let add = decode(&code, 2).expect("add");
        assert_eq!(add.v_c as i32, -1);
        let goto = decode(&code, 4).expect("goto");
        assert_eq!(goto.branch_offset(), Some(-4));
    }

    #[test]
    fn invoke_lists_and_ranges() {
        let code = insns(
            "
.method static LFoo;->g()V
.registers 6
    invoke-static {v1, v2, v5}, method@7
    invoke-static/range {v2 .. v4}, method@0x10
    return-void
.end method
",
        );
        let list = decode(&code, 0).expect("list");
        assert_eq!(list.v_b, 7);
        assert_eq!(list.argument_registers(), vec![1, 2, 5]);
        let range = decode(&code, 3).expect("range");
        assert_eq!(range.v_b, 16);
        assert_eq!(range.argument_registers(), vec![2, 3, 4]);
    }

    #[test]
    fn switch_payloads_are_aligned_and_relative_to_the_switch() {
        let code = insns(
            "
.method static LFoo;->s(I)I
.registers 2
.ins 1
    nop
    packed-switch v1, :table
    const/4 v0, 0
    return v0
:one
    const/4 v0, 1
    return v0
:table
.packed-switch 0x0
    :one
.end packed-switch
.end method
",
        );
        let switch = decode(&code, 1).expect("switch");
        let payload_pc = (1 + switch.v_b as i32) as usize;
        assert_eq!(payload_pc % 2, 0);
        let table = read_packed_switch(&code, payload_pc).expect("payload");
        assert_eq!(table.first_key, 0);
        assert_eq!(table.targets, vec![5]);
    }

    #[test]
    fn sparse_and_array_payloads() {
        let code = insns(
            "
.method static LFoo;->t(I)V
.registers 2
.ins 1
    sparse-switch v1, :cases
    fill-array-data v0, :data
:a
    return-void
:cases
.sparse-switch
    -1 -> :a
    0x10 -> :a
.end sparse-switch
:data
.array-data 2
    1 2 0x300
.end array-data
.end method
",
        );
        let switch = decode(&code, 0).expect("switch");
        assert_eq!(switch.v_b, 8);
        let cases = read_sparse_switch(&code, 8).expect("sparse");
        assert_eq!(cases, vec![(-1, 6), (16, 6)]);
        let fill = decode(&code, 3).expect("fill");
        let data = read_array_data(&code, (3 + fill.v_b as i32) as usize).expect("array");
        assert_eq!(data.length, 3);
        assert_eq!(data.bytes, vec![1, 0, 2, 0, 0, 3]);
    }

    #[test]
    fn wide_literals() {
        let code = insns(
            "
.method static LFoo;->w()J
.registers 2
    const-wide v0, 0x123456789abcdef0
    const/high16 v0, 0x41200000
    return-wide v0
.end method
",
        );
        assert_eq!(decode(&code, 0).expect("wide").v_b_wide, 0x1234_5678_9abc_def0);
        assert_eq!(decode(&code, 5).expect("high16").v_b, 0x4120);
    }

    #[test]
    fn errors_carry_the_line() {
        let err = assemble_method(".method static LFoo;->f()V\n.registers 1\n    bogus v0\n.end method")
            .expect_err("unknown opcode");
        assert_eq!(err.line, 3);
        assert_eq!(err.to_string(), "line 3: unknown opcode 'bogus'");

        let err = assemble_method(".method static LFoo;->f()V\n.registers 1\n    goto :nowhere\n.end method")
            .expect_err("unknown label");
        assert_eq!(err.message, "unknown label ':nowhere'");

        let err = assemble_method(".method static LFoo;->f()V\n.registers 1\n    const/4 v0, 9\n.end method")
            .expect_err("literal");
        assert!(err.message.contains("4-bit"), "{err}");

        let err = assemble_method(".method static LFoo;->f()V\n.registers 1\n    return v3\n.end method")
            .expect_err("register");
        assert!(err.message.contains("outside"), "{err}");
    }

    #[test]
    fn several_methods() {
        let methods = assemble_methods(
            "
.method static LFoo;->a()V
.registers 0
    return-void
.end method
// second
.method static LFoo;->b()V
.registers 0
    return-void
.end method
",
        )
        .expect("assemble");
        assert_eq!(methods.len(), 2);
        assert!(assemble_method("").is_err());
    }
}
