//! Switch interpreter over decoded instructions.
//!
//! The same `step` runs whole methods on shadow frames and single instructions punted out of
//! compiled code, where the vregs live in a native frame or a trace's vreg array. Exceptions
//! are raised as a pending exception object plus an `Err`; there are no catch handlers, so a
//! throw unwinds the whole invocation.

use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

use tracing::{debug, trace};

use crate::arith;
use crate::bytecode::Opcode;
use crate::decoder::{self, DecodeError, DecodedInstruction};
use crate::heap::{ComponentType, HeapError, class_word};
use crate::method::{Method, MethodId, ObjectRef};
use crate::runtime::{Runtime, Value, parameter_kinds, simulator};
use crate::stack::ShadowFrame;
use crate::stack::managed_stack::FragmentTop;
use crate::thread::Thread;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExceptionKind {
    Arithmetic,
    NullPointer,
    ArrayIndex,
    NegativeArraySize,
    OutOfMemory,
    /// Raised by a `throw` instruction.
    Thrown,
}

impl ExceptionKind {
    fn class_index(self) -> u32 {
        0xff00 + self as u32
    }

    pub fn descriptor(self) -> &'static str {
        match self {
            ExceptionKind::Arithmetic => "Ljava/lang/ArithmeticException;",
            ExceptionKind::NullPointer => "Ljava/lang/NullPointerException;",
            ExceptionKind::ArrayIndex => "Ljava/lang/ArrayIndexOutOfBoundsException;",
            ExceptionKind::NegativeArraySize => "Ljava/lang/NegativeArraySizeException;",
            ExceptionKind::OutOfMemory => "Ljava/lang/OutOfMemoryError;",
            ExceptionKind::Thrown => "Ljava/lang/Throwable;",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum InterpError {
    Exception {
        kind: ExceptionKind,
        dex_pc: u32,
        method: String,
    },
    Decode(DecodeError),
    UnsupportedOpcode {
        opcode: Opcode,
        dex_pc: u32,
    },
    UnknownMethod(u32),
    MethodNotFound(String),
    UnknownType(u32),
    NoCode(String),
    UnboundNative(String),
    AbstractMethod(String),
    ArgumentCount {
        expected: usize,
        actual: usize,
    },
    StackOverflow,
    BadAddress(u32),
    Simulator(String),
}

impl fmt::Display for InterpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InterpError::Exception {
                kind,
                dex_pc,
                method,
            } => write!(f, "{} at {method}:0x{dex_pc:04x}", kind.descriptor()),
            InterpError::Decode(err) => write!(f, "decode error: {err}"),
            InterpError::UnsupportedOpcode { opcode, dex_pc } => {
                write!(f, "unsupported opcode {} at 0x{dex_pc:04x}", opcode.mnemonic())
            }
            InterpError::UnknownMethod(index) => write!(f, "unknown method@{index}"),
            InterpError::MethodNotFound(name) => write!(f, "no method named {name}"),
            InterpError::UnknownType(index) => write!(f, "unknown type@{index}"),
            InterpError::NoCode(name) => write!(f, "{name} has no code item"),
            InterpError::UnboundNative(name) => write!(f, "native method {name} is not bound"),
            InterpError::AbstractMethod(name) => write!(f, "abstract method {name} invoked"),
            InterpError::ArgumentCount { expected, actual } => {
                write!(f, "expected {expected} arguments, got {actual}")
            }
            InterpError::StackOverflow => write!(f, "stack overflow"),
            InterpError::BadAddress(addr) => write!(f, "bad address 0x{addr:08x}"),
            InterpError::Simulator(message) => write!(f, "simulator: {message}"),
        }
    }
}

impl std::error::Error for InterpError {}

impl From<DecodeError> for InterpError {
    fn from(err: DecodeError) -> Self {
        InterpError::Decode(err)
    }
}

pub type InterpResult<T> = Result<T, InterpError>;

/// Storage of one frame's vregs.
pub trait VRegFile {
    fn get(&self, vreg: usize) -> u32;
    fn set(&self, vreg: usize, value: u32);

    fn set_reference(&self, vreg: usize, value: ObjectRef) {
        self.set(vreg, value);
    }

    fn get_wide(&self, vreg: usize) -> u64 {
        self.get(vreg) as u64 | (self.get(vreg + 1) as u64) << 32
    }

    fn set_wide(&self, vreg: usize, value: u64) {
        self.set(vreg, value as u32);
        self.set(vreg + 1, (value >> 32) as u32);
    }
}

impl VRegFile for ShadowFrame {
    fn get(&self, vreg: usize) -> u32 {
        self.get_vreg(vreg)
    }

    fn set(&self, vreg: usize, value: u32) {
        self.set_vreg(vreg, value);
    }

    fn set_reference(&self, vreg: usize, value: ObjectRef) {
        self.set_vreg_reference(vreg, value);
    }

    fn get_wide(&self, vreg: usize) -> u64 {
        self.get_vreg_long(vreg)
    }

    fn set_wide(&self, vreg: usize, value: u64) {
        self.set_vreg_long(vreg, value);
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Step {
    /// Continue at this dex pc.
    Next(u32),
    Return(Value),
}

#[derive(Clone, Copy)]
enum ArithOp {
    Add,
    Sub,
    Rsub,
    Mul,
    Div,
    Rem,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    Ushr,
}

const BINOP_ORDER: [ArithOp; 11] = [
    ArithOp::Add,
    ArithOp::Sub,
    ArithOp::Mul,
    ArithOp::Div,
    ArithOp::Rem,
    ArithOp::And,
    ArithOp::Or,
    ArithOp::Xor,
    ArithOp::Shl,
    ArithOp::Shr,
    ArithOp::Ushr,
];

const LIT_ORDER: [ArithOp; 11] = [
    ArithOp::Add,
    ArithOp::Rsub,
    ArithOp::Mul,
    ArithOp::Div,
    ArithOp::Rem,
    ArithOp::And,
    ArithOp::Or,
    ArithOp::Xor,
    ArithOp::Shl,
    ArithOp::Shr,
    ArithOp::Ushr,
];

/// `None` on division by zero.
fn int_op(op: ArithOp, a: i32, b: i32) -> Option<i32> {
    Some(match op {
        ArithOp::Add => a.wrapping_add(b),
        ArithOp::Sub => a.wrapping_sub(b),
        ArithOp::Rsub => b.wrapping_sub(a),
        ArithOp::Mul => a.wrapping_mul(b),
        ArithOp::Div => arith::div_int(a, b)?,
        ArithOp::Rem => arith::rem_int(a, b)?,
        ArithOp::And => a & b,
        ArithOp::Or => a | b,
        ArithOp::Xor => a ^ b,
        ArithOp::Shl => arith::shl_int(a, b),
        ArithOp::Shr => arith::shr_int(a, b),
        ArithOp::Ushr => arith::ushr_int(a, b),
    })
}

fn long_op(op: ArithOp, a: i64, b: i64) -> Option<i64> {
    Some(match op {
        ArithOp::Add => a.wrapping_add(b),
        ArithOp::Sub => a.wrapping_sub(b),
        ArithOp::Rsub => b.wrapping_sub(a),
        ArithOp::Mul => a.wrapping_mul(b),
        ArithOp::Div => arith::div_long(a, b)?,
        ArithOp::Rem => arith::rem_long(a, b)?,
        ArithOp::And => a & b,
        ArithOp::Or => a | b,
        ArithOp::Xor => a ^ b,
        ArithOp::Shl => arith::shl_long(a, b as i32),
        ArithOp::Shr => arith::shr_long(a, b as i32),
        ArithOp::Ushr => arith::ushr_long(a, b as i32),
    })
}

fn float_op(op: ArithOp, a: f32, b: f32) -> f32 {
    match op {
        ArithOp::Add => a + b,
        ArithOp::Sub => a - b,
        ArithOp::Mul => a * b,
        ArithOp::Div => a / b,
        _ => arith::rem_float(a, b),
    }
}

fn double_op(op: ArithOp, a: f64, b: f64) -> f64 {
    match op {
        ArithOp::Add => a + b,
        ArithOp::Sub => a - b,
        ArithOp::Mul => a * b,
        ArithOp::Div => a / b,
        _ => arith::rem_double(a, b),
    }
}

fn array_component(opcode: Opcode) -> ComponentType {
    use Opcode::*;
    match opcode {
        AgetWide | AputWide => ComponentType::Long,
        AgetObject | AputObject => ComponentType::Reference,
        AgetBoolean | AputBoolean => ComponentType::Boolean,
        AgetByte | AputByte => ComponentType::Byte,
        AgetChar | AputChar => ComponentType::Char,
        AgetShort | AputShort => ComponentType::Short,
        _ => ComponentType::Int,
    }
}

struct Exec<'a> {
    rt: &'a Runtime,
    thread: &'a Thread,
    method: &'a Arc<Method>,
    regs: &'a dyn VRegFile,
    pc: u32,
}

impl Exec<'_> {
    fn throw(&self, kind: ExceptionKind) -> InterpError {
        match self.thread.heap().alloc_object(kind.class_index(), 1) {
            Ok(exception) => self.thread.set_pending_exception(exception),
            Err(err) => debug!(%err, "no room for the exception object"),
        }
        debug!(
            method = %self.method.pretty_name(),
            dex_pc = self.pc,
            exception = kind.descriptor(),
            "exception raised"
        );
        InterpError::Exception {
            kind,
            dex_pc: self.pc,
            method: self.method.pretty_name(),
        }
    }

    fn heap_error(&self, err: HeapError) -> InterpError {
        match err {
            HeapError::OutOfMemory { .. } => self.throw(ExceptionKind::OutOfMemory),
            HeapError::NegativeArraySize(_) => self.throw(ExceptionKind::NegativeArraySize),
            HeapError::NotAnArray(obj) => InterpError::BadAddress(obj),
        }
    }

    fn non_null(&self, obj: ObjectRef) -> InterpResult<ObjectRef> {
        if obj == 0 {
            return Err(self.throw(ExceptionKind::NullPointer));
        }
        Ok(obj)
    }

    fn element(&self, array: ObjectRef, index: i32, component: ComponentType) -> InterpResult<u32> {
        let heap = self.thread.heap();
        let array = self.non_null(array)?;
        heap.component_type(array).map_err(|err| self.heap_error(err))?;
        let length = heap.array_length(array);
        if index < 0 || index as u32 >= length {
            return Err(self.throw(ExceptionKind::ArrayIndex));
        }
        Ok(heap.element_address(array, component, index as u32))
    }

    fn field(&self, obj: ObjectRef, offset: u32, width: u32) -> InterpResult<u32> {
        let obj = self.non_null(obj)?;
        let addr = obj.wrapping_add(offset);
        if !self.thread.heap().contains(addr, width) {
            return Err(InterpError::BadAddress(addr));
        }
        Ok(addr)
    }

    fn branch(&self, offset: i32) -> u32 {
        (self.pc as i32).wrapping_add(offset) as u32
    }

    fn invoke(&self, insn: &DecodedInstruction) -> InterpResult<()> {
        let callee = self
            .rt
            .methods()
            .get(MethodId(insn.v_b))
            .ok_or(InterpError::UnknownMethod(insn.v_b))?;
        let registers = insn.argument_registers();
        let kinds = parameter_kinds(&callee);
        let mut args = Vec::with_capacity(kinds.len());
        let mut cursor = 0usize;
        for kind in kinds {
            let Some(&reg) = registers.get(cursor) else {
                return Err(InterpError::ArgumentCount {
                    expected: cursor + 1,
                    actual: registers.len(),
                });
            };
            let reg = reg as usize;
            let value = if matches!(kind, 'J' | 'D') {
                cursor += 2;
                Value::from_bits(kind, self.regs.get_wide(reg))
            } else {
                cursor += 1;
                Value::from_bits(kind, self.regs.get(reg) as u64)
            };
            args.push(value);
        }
        if !callee.is_static() {
            if let Some(Value::Object(receiver)) = args.first() {
                self.non_null(*receiver)?;
            }
        }
        let result = self.rt.invoke(self.thread, &callee, &args)?;
        self.thread.set_result_register(result.to_bits());
        Ok(())
    }

    fn fill_array_data(&self, array: ObjectRef, payload_offset: i32) -> InterpResult<()> {
        let insns = code_units(self.method)?;
        let data = decoder::read_array_data(insns, self.branch(payload_offset) as usize)?;
        let heap = self.thread.heap();
        let array = self.non_null(array)?;
        let component = heap.component_type(array).map_err(|err| self.heap_error(err))?;
        if data.length as u32 > heap.array_length(array) {
            return Err(self.throw(ExceptionKind::ArrayIndex));
        }
        let start = heap.element_address(array, component, 0);
        for (offset, byte) in data.bytes.iter().enumerate() {
            heap.write_u8(start + offset as u32, *byte);
        }
        Ok(())
    }

    fn execute(&self, insn: &DecodedInstruction) -> InterpResult<Step> {
        use Opcode::*;
        let regs = self.regs;
        let heap = self.thread.heap();
        let (a, b, c) = (insn.v_a as usize, insn.v_b as usize, insn.v_c as usize);
        let next = Step::Next(self.pc + insn.width as u32);
        let int = |reg: usize| regs.get(reg) as i32;
        let long = |reg: usize| regs.get_wide(reg) as i64;
        let float = |reg: usize| f32::from_bits(regs.get(reg));
        let double = |reg: usize| f64::from_bits(regs.get_wide(reg));
        let set_int = |reg: usize, value: i32| regs.set(reg, value as u32);
        let set_long = |reg: usize, value: i64| regs.set_wide(reg, value as u64);
        let set_float = |reg: usize, value: f32| regs.set(reg, value.to_bits());
        let set_double = |reg: usize, value: f64| regs.set_wide(reg, value.to_bits());

        match insn.opcode {
            Nop => {}
            Move | MoveFrom16 | Move16 => regs.set(a, regs.get(b)),
            MoveWide | MoveWideFrom16 | MoveWide16 => {
                let value = regs.get_wide(b);
                regs.set_wide(a, value);
            }
            MoveObject | MoveObjectFrom16 | MoveObject16 => regs.set_reference(a, regs.get(b)),
            MoveResult => regs.set(a, self.thread.result_register() as u32),
            MoveResultWide => regs.set_wide(a, self.thread.result_register()),
            MoveResultObject => regs.set_reference(a, self.thread.result_register() as u32),
            ReturnVoid | ReturnVoidBarrier => return Ok(Step::Return(Value::Void)),
            Return | ReturnObject => {
                return Ok(Step::Return(Value::from_bits(return_kind(self.method), regs.get(a) as u64)));
            }
            ReturnWide => {
                return Ok(Step::Return(Value::from_bits(return_kind(self.method), regs.get_wide(a))));
            }
            Const4 | Const16 | Const => regs.set(a, insn.v_b),
            ConstHigh16 => regs.set(a, insn.v_b << 16),
            ConstWide16 | ConstWide32 => set_long(a, insn.v_b as i32 as i64),
            ConstWide => regs.set_wide(a, insn.v_b_wide),
            ConstWideHigh16 => regs.set_wide(a, (insn.v_b as u64) << 48),
            ConstClass => regs.set_reference(a, class_word(insn.v_b)),
            MonitorEnter | MonitorExit => {
                self.non_null(regs.get(a))?;
            }
            ArrayLength => {
                let array = self.non_null(regs.get(b))?;
                heap.component_type(array).map_err(|err| self.heap_error(err))?;
                regs.set(a, heap.array_length(array));
            }
            NewInstance => {
                let obj = heap.alloc_object(insn.v_b, 8).map_err(|err| self.heap_error(err))?;
                regs.set_reference(a, obj);
            }
            NewArray => {
                let component = ComponentType::from_type_index(insn.v_c)
                    .ok_or(InterpError::UnknownType(insn.v_c))?;
                let array = heap
                    .alloc_array(component, int(b))
                    .map_err(|err| self.heap_error(err))?;
                regs.set_reference(a, array);
            }
            FillArrayData => self.fill_array_data(regs.get(a), insn.v_b as i32)?,
            Throw => {
                let exception = self.non_null(regs.get(a))?;
                self.thread.set_pending_exception(exception);
                return Err(InterpError::Exception {
                    kind: ExceptionKind::Thrown,
                    dex_pc: self.pc,
                    method: self.method.pretty_name(),
                });
            }
            Goto | Goto16 | Goto32 => return Ok(Step::Next(self.branch(insn.v_a as i32))),
            PackedSwitch => {
                let payload = self.branch(insn.v_b as i32) as usize;
                let table = decoder::read_packed_switch(code_units(self.method)?, payload)?;
                let index = (int(a) as i64) - table.first_key as i64;
                if let Some(target) = usize::try_from(index).ok().and_then(|i| table.targets.get(i)) {
                    return Ok(Step::Next(self.branch(*target)));
                }
            }
            SparseSwitch => {
                let payload = self.branch(insn.v_b as i32) as usize;
                let table = decoder::read_sparse_switch(code_units(self.method)?, payload)?;
                let key = int(a);
                if let Some((_, target)) = table.iter().find(|(k, _)| *k == key) {
                    return Ok(Step::Next(self.branch(*target)));
                }
            }
            CmplFloat => set_int(a, arith::cmpl_float(float(b), float(c))),
            CmpgFloat => set_int(a, arith::cmpg_float(float(b), float(c))),
            CmplDouble => set_int(a, arith::cmpl_double(double(b), double(c))),
            CmpgDouble => set_int(a, arith::cmpg_double(double(b), double(c))),
            CmpLong => set_int(a, arith::cmp_long(long(b), long(c))),
            IfEq | IfNe | IfLt | IfGe | IfGt | IfLe => {
                let (lhs, rhs) = (int(a), int(b));
                let taken = match insn.opcode {
                    IfEq => lhs == rhs,
                    IfNe => lhs != rhs,
                    IfLt => lhs < rhs,
                    IfGe => lhs >= rhs,
                    IfGt => lhs > rhs,
                    _ => lhs <= rhs,
                };
                if taken {
                    return Ok(Step::Next(self.branch(insn.v_c as i32)));
                }
            }
            IfEqz | IfNez | IfLtz | IfGez | IfGtz | IfLez => {
                let value = int(a);
                let taken = match insn.opcode {
                    IfEqz => value == 0,
                    IfNez => value != 0,
                    IfLtz => value < 0,
                    IfGez => value >= 0,
                    IfGtz => value > 0,
                    _ => value <= 0,
                };
                if taken {
                    return Ok(Step::Next(self.branch(insn.v_b as i32)));
                }
            }
            Aget | AgetObject | AgetBoolean | AgetByte | AgetChar | AgetShort | AgetWide => {
                let component = array_component(insn.opcode);
                let addr = self.element(regs.get(b), int(c), component)?;
                match insn.opcode {
                    AgetWide => regs.set_wide(a, heap.read_u64(addr)),
                    AgetObject => regs.set_reference(a, heap.read_u32(addr)),
                    AgetBoolean => regs.set(a, heap.read_u8(addr) as u32),
                    AgetByte => set_int(a, heap.read_u8(addr) as i8 as i32),
                    AgetChar => regs.set(a, heap.read_u16(addr) as u32),
                    AgetShort => set_int(a, heap.read_u16(addr) as i16 as i32),
                    _ => regs.set(a, heap.read_u32(addr)),
                }
            }
            Aput | AputObject | AputBoolean | AputByte | AputChar | AputShort | AputWide => {
                let component = array_component(insn.opcode);
                let addr = self.element(regs.get(b), int(c), component)?;
                match component.width() {
                    8 => heap.write_u64(addr, regs.get_wide(a)),
                    4 => heap.write_u32(addr, regs.get(a)),
                    2 => heap.write_u16(addr, regs.get(a) as u16),
                    _ => heap.write_u8(addr, regs.get(a) as u8),
                }
            }
            IgetQuick | IgetObjectQuick => {
                let addr = self.field(regs.get(b), insn.v_c, 4)?;
                if insn.opcode == IgetObjectQuick {
                    regs.set_reference(a, heap.read_u32(addr));
                } else {
                    regs.set(a, heap.read_u32(addr));
                }
            }
            IgetWideQuick => {
                let addr = self.field(regs.get(b), insn.v_c, 8)?;
                regs.set_wide(a, heap.read_u64(addr));
            }
            IputQuick | IputObjectQuick => {
                let addr = self.field(regs.get(b), insn.v_c, 4)?;
                heap.write_u32(addr, regs.get(a));
            }
            IputWideQuick => {
                let addr = self.field(regs.get(b), insn.v_c, 8)?;
                heap.write_u64(addr, regs.get_wide(a));
            }
            InvokeStatic | InvokeDirect | InvokeVirtual | InvokeSuper | InvokeInterface
            | InvokeStaticRange | InvokeDirectRange | InvokeVirtualRange | InvokeSuperRange
            | InvokeInterfaceRange => self.invoke(insn)?,
            NegInt => set_int(a, int(b).wrapping_neg()),
            NotInt => set_int(a, !int(b)),
            NegLong => set_long(a, long(b).wrapping_neg()),
            NotLong => set_long(a, !long(b)),
            NegFloat => set_float(a, -float(b)),
            NegDouble => set_double(a, -double(b)),
            IntToLong => set_long(a, int(b) as i64),
            IntToFloat => set_float(a, int(b) as f32),
            IntToDouble => set_double(a, int(b) as f64),
            LongToInt => set_int(a, long(b) as i32),
            LongToFloat => set_float(a, long(b) as f32),
            LongToDouble => set_double(a, long(b) as f64),
            FloatToInt => set_int(a, arith::float_to_int(float(b))),
            FloatToLong => set_long(a, arith::float_to_long(float(b))),
            FloatToDouble => set_double(a, float(b) as f64),
            DoubleToInt => set_int(a, arith::double_to_int(double(b))),
            DoubleToLong => set_long(a, arith::double_to_long(double(b))),
            DoubleToFloat => set_float(a, double(b) as f32),
            IntToByte => set_int(a, arith::int_to_byte(int(b))),
            IntToChar => set_int(a, arith::int_to_char(int(b))),
            IntToShort => set_int(a, arith::int_to_short(int(b))),
            op if (AddInt..=UshrInt).contains(&op) => {
                let kind = BINOP_ORDER[(op as u8 - AddInt as u8) as usize];
                let value = int_op(kind, int(b), int(c)).ok_or_else(|| self.throw(ExceptionKind::Arithmetic))?;
                set_int(a, value);
            }
            op if (AddLong..=UshrLong).contains(&op) => {
                let kind = BINOP_ORDER[(op as u8 - AddLong as u8) as usize];
                let rhs = if matches!(op, ShlLong | ShrLong | UshrLong) {
                    int(c) as i64
                } else {
                    long(c)
                };
                let value = long_op(kind, long(b), rhs).ok_or_else(|| self.throw(ExceptionKind::Arithmetic))?;
                set_long(a, value);
            }
            op if (AddFloat..=RemFloat).contains(&op) => {
                let kind = BINOP_ORDER[(op as u8 - AddFloat as u8) as usize];
                set_float(a, float_op(kind, float(b), float(c)));
            }
            op if (AddDouble..=RemDouble).contains(&op) => {
                let kind = BINOP_ORDER[(op as u8 - AddDouble as u8) as usize];
                set_double(a, double_op(kind, double(b), double(c)));
            }
            op if (AddInt2Addr..=UshrInt2Addr).contains(&op) => {
                let kind = BINOP_ORDER[(op as u8 - AddInt2Addr as u8) as usize];
                let value = int_op(kind, int(a), int(b)).ok_or_else(|| self.throw(ExceptionKind::Arithmetic))?;
                set_int(a, value);
            }
            op if (AddLong2Addr..=UshrLong2Addr).contains(&op) => {
                let kind = BINOP_ORDER[(op as u8 - AddLong2Addr as u8) as usize];
                let rhs = if matches!(op, ShlLong2Addr | ShrLong2Addr | UshrLong2Addr) {
                    int(b) as i64
                } else {
                    long(b)
                };
                let value = long_op(kind, long(a), rhs).ok_or_else(|| self.throw(ExceptionKind::Arithmetic))?;
                set_long(a, value);
            }
            op if (AddFloat2Addr..=RemFloat2Addr).contains(&op) => {
                let kind = BINOP_ORDER[(op as u8 - AddFloat2Addr as u8) as usize];
                set_float(a, float_op(kind, float(a), float(b)));
            }
            op if (AddDouble2Addr..=RemDouble2Addr).contains(&op) => {
                let kind = BINOP_ORDER[(op as u8 - AddDouble2Addr as u8) as usize];
                set_double(a, double_op(kind, double(a), double(b)));
            }
            op if (AddIntLit16..=XorIntLit16).contains(&op) => {
                let kind = LIT_ORDER[(op as u8 - AddIntLit16 as u8) as usize];
                let value = int_op(kind, int(b), insn.v_c as i32)
                    .ok_or_else(|| self.throw(ExceptionKind::Arithmetic))?;
                set_int(a, value);
            }
            op if (AddIntLit8..=UshrIntLit8).contains(&op) => {
                let kind = LIT_ORDER[(op as u8 - AddIntLit8 as u8) as usize];
                let value = int_op(kind, int(b), insn.v_c as i32)
                    .ok_or_else(|| self.throw(ExceptionKind::Arithmetic))?;
                set_int(a, value);
            }
            opcode => {
                return Err(InterpError::UnsupportedOpcode {
                    opcode,
                    dex_pc: self.pc,
                });
            }
        }
        Ok(next)
    }
}

fn code_units(method: &Method) -> InterpResult<&[u16]> {
    method
        .code_item()
        .map(|code| code.insns.as_slice())
        .ok_or_else(|| InterpError::NoCode(method.pretty_name()))
}

fn return_kind(method: &Method) -> char {
    method.shorty().chars().next().unwrap_or('V')
}

/// Executes the instruction at `dex_pc` against `regs`.
pub fn step(
    rt: &Runtime,
    thread: &Thread,
    method: &Arc<Method>,
    regs: &dyn VRegFile,
    dex_pc: u32,
) -> InterpResult<Step> {
    let insns = code_units(method)?;
    let insn = decoder::decode(insns, dex_pc as usize)?;
    trace!(dex_pc, insn = %insn.to_text(dex_pc as usize), "step");
    Exec {
        rt,
        thread,
        method,
        regs,
        pc: dex_pc,
    }
    .execute(&insn)
}

/// Interprets `method` from its first instruction.
pub fn execute(rt: &Runtime, thread: &Thread, method: &Arc<Method>, args: &[Value]) -> InterpResult<Value> {
    let code = method
        .code_item()
        .ok_or_else(|| InterpError::NoCode(method.pretty_name()))?;
    let frame = Rc::new(ShadowFrame::for_method(
        Arc::clone(method),
        rt.config().reference_layout,
    ));
    let mut reg = (code.registers_size - code.ins_size) as usize;
    for (kind, value) in parameter_kinds(method).into_iter().zip(args) {
        match kind {
            'J' | 'D' => {
                frame.set_vreg_long(reg, value.to_bits());
                reg += 2;
            }
            'L' | '[' => {
                frame.set_vreg_reference(reg, value.to_bits() as u32);
                reg += 1;
            }
            _ => {
                frame.set_vreg(reg, value.to_bits() as u32);
                reg += 1;
            }
        }
    }
    execute_from(rt, thread, frame, 0)
}

/// Runs `frame` from `dex_pc` until its method returns.
///
/// Backward branches feed the trace JIT; once a trace exists for the branch target it runs
/// on the simulator and interpretation resumes at the trace's exit.
pub fn execute_from(rt: &Runtime, thread: &Thread, frame: Rc<ShadowFrame>, dex_pc: u32) -> InterpResult<Value> {
    let below_quick = matches!(thread.managed_stack().top(), FragmentTop::Quick { .. });
    if below_quick {
        thread.managed_stack_mut().push_fragment();
    }
    thread.managed_stack_mut().push_shadow_frame(Rc::clone(&frame));
    let result = run_frame(rt, thread, &frame, dex_pc);
    thread.managed_stack_mut().pop_shadow_frame();
    if below_quick {
        thread.managed_stack_mut().pop_fragment();
    }
    result
}

fn run_frame(rt: &Runtime, thread: &Thread, frame: &Rc<ShadowFrame>, start: u32) -> InterpResult<Value> {
    let method = Arc::clone(frame.method());
    let mut pc = start;
    loop {
        frame.set_dex_pc(pc);
        match step(rt, thread, &method, frame.as_ref(), pc)? {
            Step::Return(value) => return Ok(value),
            Step::Next(next) if next <= pc => {
                pc = next;
                if let Some(code) = rt.with_jit(|jit| jit.observe_hot_pc(&method, next)) {
                    frame.set_dex_pc(next);
                    pc = simulator::run_trace(rt, thread, frame, &code)?;
                }
            }
            Step::Next(next) => pc = next,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembler::assemble_methods;
    use crate::method::MethodTable;
    use crate::runtime::jit::JitConfig;

    fn runtime(source: &str) -> (Runtime, Vec<Arc<Method>>) {
        let methods = Arc::new(MethodTable::new());
        let registered = assemble_methods(source)
            .expect("assemble")
            .into_iter()
            .map(|builder| methods.register(builder))
            .collect();
        let config = JitConfig {
            enabled: false,
            ..JitConfig::default()
        };
        (Runtime::new(config, methods).expect("runtime"), registered)
    }

    #[test]
    fn integer_division_follows_java() {
        let (rt, methods) = runtime(
            "
.method static LT;->div(II)I
.registers 3
.ins 2
    div-int v0, v1, v2
    return v0
.end method
",
        );
        let thread = rt.new_thread();
        let div = &methods[0];
        let result = rt
            .invoke(&thread, div, &[Value::Int(i32::MIN), Value::Int(-1)])
            .expect("min / -1");
        assert_eq!(result, Value::Int(i32::MIN));
        let err = rt
            .invoke(&thread, div, &[Value::Int(1), Value::Int(0)])
            .expect_err("divide by zero");
        assert!(matches!(
            err,
            InterpError::Exception {
                kind: ExceptionKind::Arithmetic,
                dex_pc: 0,
                ..
            }
        ));
        assert!(thread.pending_exception().is_some());
    }

    #[test]
    fn arrays_check_null_and_bounds() {
        let (rt, methods) = runtime(
            "
.method static LT;->at(I)I
.registers 3
.ins 1
    const/4 v0, 3
    new-array v0, v0, type@4
    aget v0, v0, v2
    return v0
.end method
",
        );
        let thread = rt.new_thread();
        let at = &methods[0];
        assert_eq!(rt.invoke(&thread, at, &[Value::Int(2)]).expect("in bounds"), Value::Int(0));
        let err = rt.invoke(&thread, at, &[Value::Int(3)]).expect_err("out of bounds");
        assert!(matches!(
            err,
            InterpError::Exception {
                kind: ExceptionKind::ArrayIndex,
                ..
            }
        ));
    }

    #[test]
    fn packed_switch_picks_targets() {
        let (rt, methods) = runtime(
            "
.method static LT;->pick(I)I
.registers 2
.ins 1
    packed-switch v1, :table
    const/4 v0, -1
    return v0
:one
    const/4 v0, 7
    return v0
:two
    const/16 v0, 9
    return v0
:table
    .packed-switch 1
        :one
        :two
    .end packed-switch
.end method
",
        );
        let thread = rt.new_thread();
        let pick = &methods[0];
        assert_eq!(rt.invoke(&thread, pick, &[Value::Int(1)]).expect("1"), Value::Int(7));
        assert_eq!(rt.invoke(&thread, pick, &[Value::Int(2)]).expect("2"), Value::Int(9));
        assert_eq!(rt.invoke(&thread, pick, &[Value::Int(5)]).expect("5"), Value::Int(-1));
    }

    #[test]
    fn static_invokes_pass_wide_arguments() {
        let (rt, methods) = runtime(
            "
.method static LT;->twice(J)J
.registers 4
.ins 2
    add-long v0, v2, v2
    return-wide v0
.end method

.method static LT;->caller(J)J
.registers 4
.ins 2
    invoke-static {v2, v3}, method@1
    move-result-wide v0
    return-wide v0
.end method
",
        );
        let thread = rt.new_thread();
        let result = rt
            .invoke(&thread, &methods[1], &[Value::Long(1 << 40)])
            .expect("call");
        assert_eq!(result, Value::Long(1 << 41));
        assert_eq!(thread.managed_stack().num_shadow_frames(), 0);
    }

    #[test]
    fn float_conversions_saturate() {
        let (rt, methods) = runtime(
            "
.method static LT;->conv(F)I
.registers 2
.ins 1
    float-to-int v0, v1
    return v0
.end method
",
        );
        let thread = rt.new_thread();
        let conv = &methods[0];
        assert_eq!(rt.invoke(&thread, conv, &[Value::Float(f32::NAN)]).expect("nan"), Value::Int(0));
        assert_eq!(
            rt.invoke(&thread, conv, &[Value::Float(1e20)]).expect("big"),
            Value::Int(i32::MAX)
        );
    }
}
