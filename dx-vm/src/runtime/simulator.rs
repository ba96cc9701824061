//! Executes published code instruction by instruction.
//!
//! Each [`MachineInsn`] carries an [`OpKind`], so one machine model serves every target. Calls
//! into the template region are evaluated natively; calls into the stub region reach the
//! interpreter. Returning to [`INVOKE_RETURN_PC`] ends a method invocation.

use std::rc::Rc;
use std::sync::Arc;

use tracing::{debug, trace};

use crate::address_space::{
    INSTRUMENTATION_EXIT_PC, INTERPRETER_EXIT_PC, INVOKE_RETURN_PC, SINGLE_STEP_PC, is_template,
};
use crate::arith;
use crate::compiled::{CodeKind, CompiledCode};
use crate::compiler::codegen::{TargetInfo, target_for};
use crate::compiler::lir::{AluOp, FpOp, MachineInsn, OpKind, UnaryOp};
use crate::compiler::templates::Template;
use crate::isa::{InstructionSet, arm, mips, x86};
use crate::method::Method;
use crate::runtime::interpreter::{self, InterpError, InterpResult, Step, VRegFile};
use crate::runtime::{Runtime, Value};
use crate::stack::ShadowFrame;
use crate::stack::frame_layout::{FrameInfo, STACK_ALIGNMENT, vreg_offset};
use crate::thread::Thread;

/// Bytes kept free below the stack cursor before refusing to enter more code.
const STACK_RESERVE: u32 = 1024;

enum Exit {
    /// Returned to the invoke stub.
    Returned,
    /// A trace left through an unchained cell or a branch-free end.
    TraceExit(u32),
    /// The method finished in the interpreter after leaving compiled code.
    Interpreted(Value),
}

struct Machine<'a> {
    rt: &'a Runtime,
    thread: &'a Thread,
    isa: InstructionSet,
    info: &'static TargetInfo,
    regs: [u32; 64],
    hi: u32,
    lo: u32,
    lhs: i32,
    rhs: i32,
    /// Carry out of `Adds`/`Adc`, borrow out of `Subs`/`Sbc`.
    carry: bool,
    code: Arc<CompiledCode>,
    pc: u32,
}

fn reg_index(reg: i32) -> Option<usize> {
    usize::try_from(reg).ok().map(|index| index & 63)
}

impl<'a> Machine<'a> {
    fn new(rt: &'a Runtime, thread: &'a Thread, code: Arc<CompiledCode>) -> Self {
        let isa = code.isa;
        let mut machine = Self {
            rt,
            thread,
            isa,
            info: target_for(isa).info(),
            regs: [0; 64],
            hi: 0,
            lo: 0,
            lhs: 0,
            rhs: 0,
            carry: false,
            pc: code.code_begin(),
            code,
        };
        match isa {
            InstructionSet::Arm | InstructionSet::Thumb2 => machine.regs[arm::TR] = thread.self_word(),
            InstructionSet::Mips => machine.regs[mips::TR] = thread.self_word(),
            InstructionSet::X86 => {}
        }
        machine
    }

    fn reg(&self, reg: i32) -> u32 {
        match reg_index(reg) {
            Some(0) if self.isa == InstructionSet::Mips => 0,
            Some(index) => self.regs[index],
            None => 0,
        }
    }

    fn set_reg(&mut self, reg: i32, value: u32) {
        match reg_index(reg) {
            Some(0) if self.isa == InstructionSet::Mips => {}
            Some(index) => self.regs[index] = value,
            None => {}
        }
    }

    fn sp(&self) -> u32 {
        self.reg(self.info.sp)
    }

    fn set_sp(&mut self, value: u32) {
        self.set_reg(self.info.sp, value);
    }

    fn load(&self, addr: u32) -> InterpResult<u32> {
        let heap = self.thread.heap();
        let memory = self.thread.memory();
        if heap.contains(addr, 4) {
            Ok(heap.read_u32(addr))
        } else if memory.contains(addr, 4) {
            Ok(memory.read_u32(addr))
        } else {
            Err(InterpError::BadAddress(addr))
        }
    }

    fn store(&self, addr: u32, value: u32) -> InterpResult<()> {
        let heap = self.thread.heap();
        let memory = self.thread.memory();
        if heap.contains(addr, 4) {
            heap.write_u32(addr, value);
        } else if memory.contains(addr, 4) {
            memory.write_u32(addr, value);
        } else {
            return Err(InterpError::BadAddress(addr));
        }
        Ok(())
    }

    fn push(&mut self, value: u32) -> InterpResult<()> {
        let sp = self.sp().wrapping_sub(4);
        self.store(sp, value)?;
        self.set_sp(sp);
        Ok(())
    }

    fn pop(&mut self) -> InterpResult<u32> {
        let sp = self.sp();
        let value = self.load(sp)?;
        self.set_sp(sp + 4);
        Ok(value)
    }

    fn alu(&mut self, op: AluOp, a: u32, b: u32) -> u32 {
        match op {
            AluOp::Add => a.wrapping_add(b),
            AluOp::Adds => {
                let (sum, carry) = a.overflowing_add(b);
                self.carry = carry;
                sum
            }
            AluOp::Adc => {
                let sum = a as u64 + b as u64 + self.carry as u64;
                self.carry = sum > u32::MAX as u64;
                sum as u32
            }
            AluOp::Sub => a.wrapping_sub(b),
            AluOp::Subs => {
                self.carry = a < b;
                a.wrapping_sub(b)
            }
            AluOp::Sbc => {
                let borrow_in = self.carry as u64;
                self.carry = (a as u64) < b as u64 + borrow_in;
                a.wrapping_sub(b).wrapping_sub(borrow_in as u32)
            }
            AluOp::Rsub => b.wrapping_sub(a),
            AluOp::Mul => a.wrapping_mul(b),
            AluOp::And => a & b,
            AluOp::Or => a | b,
            AluOp::Xor => a ^ b,
            AluOp::Nor => !(a | b),
            AluOp::Lsl => a << (b & 31),
            AluOp::Lsr => a >> (b & 31),
            AluOp::Asr => ((a as i32) >> (b & 31)) as u32,
            AluOp::Ror => a.rotate_right(b & 31),
        }
    }

    fn run(&mut self) -> InterpResult<Exit> {
        loop {
            if !self.code.contains_pc(self.pc) {
                match self.pc {
                    INVOKE_RETURN_PC => return Ok(Exit::Returned),
                    INSTRUMENTATION_EXIT_PC => {
                        let frame = self
                            .thread
                            .instrumentation()
                            .pop_exit(self.thread)
                            .ok_or_else(|| InterpError::Simulator("instrumentation stack is empty".to_string()))?;
                        self.pc = frame.return_pc;
                        continue;
                    }
                    pc => {
                        self.code = self
                            .rt
                            .code_cache()
                            .lookup(pc)
                            .ok_or(InterpError::BadAddress(pc))?;
                    }
                }
            }
            let code = Arc::clone(&self.code);
            let index = code
                .insn_index_at(self.pc - code.code_begin())
                .ok_or_else(|| InterpError::Simulator(format!("no instruction at 0x{:08x}", self.pc)))?;
            if let Some(target) = code.cell_at_insn(index).and_then(|cell| cell.chained_to()) {
                trace!(to = format_args!("0x{target:08x}"), "chained exit");
                self.pc = target;
                continue;
            }
            let insn = &code.insns[index];
            if let Some(exit) = self.execute(&code, insn)? {
                return Ok(exit);
            }
        }
    }

    fn execute(&mut self, code: &CompiledCode, insn: &MachineInsn) -> InterpResult<Option<Exit>> {
        let [o0, o1, o2, o3, o4] = insn.operands;
        let next = self.pc + insn.size;
        let target = || code.code_begin() + insn.target_offset.unwrap_or(insn.offset + insn.size);
        self.pc = next;
        match insn.kind {
            OpKind::Nop => {}
            OpKind::Mov => self.set_reg(o0, self.reg(o1)),
            OpKind::MovImm => self.set_reg(o0, o1 as u32),
            OpKind::LoadUpper => self.set_reg(o0, (o1 as u32) << 16),
            OpKind::AluRRR(op) => {
                let value = self.alu(op, self.reg(o1), self.reg(o2));
                self.set_reg(o0, value);
            }
            OpKind::AluRRI(op) => {
                let value = self.alu(op, self.reg(o1), o2 as u32);
                self.set_reg(o0, value);
            }
            OpKind::AluRR(op) => {
                let value = self.alu(op, self.reg(o0), self.reg(o1));
                self.set_reg(o0, value);
            }
            OpKind::AluRI(op) => {
                let value = self.alu(op, self.reg(o0), o1 as u32);
                self.set_reg(o0, value);
            }
            OpKind::Unary(UnaryOp::Neg) => self.set_reg(o0, self.reg(o1).wrapping_neg()),
            OpKind::Unary(UnaryOp::Not) => self.set_reg(o0, !self.reg(o1)),
            OpKind::FpRRR(op) => {
                let (a, b) = (f32::from_bits(self.reg(o1)), f32::from_bits(self.reg(o2)));
                let value = match op {
                    FpOp::Add => a + b,
                    FpOp::Sub => a - b,
                    FpOp::Mul => a * b,
                    FpOp::Div => a / b,
                };
                self.set_reg(o0, value.to_bits());
            }
            OpKind::Cmp => {
                self.lhs = self.reg(o0) as i32;
                self.rhs = self.reg(o1) as i32;
            }
            OpKind::CmpImm => {
                self.lhs = self.reg(o0) as i32;
                self.rhs = o1;
            }
            OpKind::SetLessThan { unsigned } => {
                let (a, b) = (self.reg(o1), self.reg(o2));
                let less = if unsigned { a < b } else { (a as i32) < (b as i32) };
                self.set_reg(o0, less as u32);
            }
            OpKind::SetLessThanImm { unsigned } => {
                let a = self.reg(o1);
                let less = if unsigned { a < o2 as u32 } else { (a as i32) < o2 };
                self.set_reg(o0, less as u32);
            }
            OpKind::MultHiLo => {
                let product = (self.reg(o0) as i32 as i64) * (self.reg(o1) as i32 as i64);
                let (lo, hi) = arith::split_long(product);
                self.lo = lo;
                self.hi = hi;
            }
            OpKind::MoveFromLo => self.set_reg(o0, self.lo),
            OpKind::MoveFromHi => self.set_reg(o0, self.hi),
            OpKind::DivHiLo => {
                let (a, b) = (self.reg(o0) as i32, self.reg(o1) as i32);
                // Result is unpredictable on a zero divisor; compiled code checks first.
                if b != 0 {
                    self.lo = a.wrapping_div(b) as u32;
                    self.hi = a.wrapping_rem(b) as u32;
                }
            }
            OpKind::Cdq => {
                let sign = if (self.regs[x86::EAX] as i32) < 0 { u32::MAX } else { 0 };
                self.regs[x86::EDX] = sign;
            }
            OpKind::Idiv => {
                let dividend = arith::join_long(self.regs[x86::EAX], self.regs[x86::EDX]);
                let divisor = self.reg(o0) as i32 as i64;
                if divisor == 0 {
                    return Err(InterpError::Simulator(format!("divide error at 0x{:08x}", self.pc - insn.size)));
                }
                self.regs[x86::EAX] = dividend.wrapping_div(divisor) as u32;
                self.regs[x86::EDX] = dividend.wrapping_rem(divisor) as u32;
            }
            OpKind::Load => {
                let value = self.load(self.reg(o1).wrapping_add(o2 as u32))?;
                self.set_reg(o0, value);
            }
            OpKind::Store => self.store(self.reg(o1).wrapping_add(o2 as u32), self.reg(o0))?,
            OpKind::LoadIndexed => {
                let addr = self.indexed(o1, o2, o3, o4);
                let value = self.load(addr)?;
                self.set_reg(o0, value);
            }
            OpKind::StoreIndexed => {
                let addr = self.indexed(o1, o2, o3, o4);
                self.store(addr, self.reg(o0))?;
            }
            OpKind::LoadLiteral => {
                let value = insn
                    .literal
                    .ok_or_else(|| InterpError::Simulator(format!("literal load without a value: {insn}")))?;
                self.set_reg(o0, value);
            }
            OpKind::Push => self.push_mask(o0 as u32)?,
            OpKind::Pop => self.pop_mask(o0 as u32)?,
            OpKind::Branch => self.pc = target(),
            OpKind::CondBranch(cond) => {
                if cond.holds(self.lhs, self.rhs) {
                    self.pc = target();
                }
            }
            OpKind::CmpBranch(cond) => {
                if cond.holds(self.reg(o0) as i32, self.reg(o1) as i32) {
                    self.pc = target();
                }
            }
            OpKind::CmpZeroBranch(cond) => {
                if cond.holds(self.reg(o0) as i32, 0) {
                    self.pc = target();
                }
            }
            OpKind::Call => {
                let callee = insn
                    .call_target
                    .ok_or_else(|| InterpError::Simulator(format!("call without a target: {insn}")))?;
                return self.call(callee, next);
            }
            OpKind::CallReg => {
                let callee = self.reg(o0);
                return self.call(callee, next);
            }
            OpKind::JumpReg => self.pc = self.reg(o0),
            OpKind::Return => {
                self.pc = match self.isa {
                    InstructionSet::X86 => self.pop()?,
                    _ => self.reg(self.info.lr),
                };
            }
            OpKind::Data => {
                return Err(InterpError::Simulator(format!(
                    "executed data word at 0x{:08x}",
                    next - insn.size
                )));
            }
        }
        Ok(None)
    }

    fn indexed(&self, base: i32, index: i32, scale: i32, disp: i32) -> u32 {
        self.reg(base)
            .wrapping_add(self.reg(index) << (scale & 31))
            .wrapping_add(disp as u32)
    }

    /// Lowest register at the lowest address.
    fn push_mask(&mut self, mask: u32) -> InterpResult<()> {
        let count = mask.count_ones();
        let base = self.sp().wrapping_sub(4 * count);
        let mut addr = base;
        for reg in (0..32).filter(|reg| mask & (1 << reg) != 0) {
            self.store(addr, self.regs[reg])?;
            addr += 4;
        }
        self.set_sp(base);
        Ok(())
    }

    fn pop_mask(&mut self, mask: u32) -> InterpResult<()> {
        let mut addr = self.sp();
        let loads_pc = matches!(self.isa, InstructionSet::Arm | InstructionSet::Thumb2)
            && mask & (1 << arm::PC) != 0;
        for reg in (0..32).filter(|reg| mask & (1 << reg) != 0) {
            let value = self.load(addr)?;
            addr += 4;
            if loads_pc && reg == arm::PC {
                self.pc = value;
            } else {
                self.regs[reg] = value;
            }
        }
        self.set_sp(addr);
        Ok(())
    }

    fn call(&mut self, callee: u32, ret: u32) -> InterpResult<Option<Exit>> {
        if is_template(callee) {
            self.call_template(callee)?;
            self.pc = ret;
            return Ok(None);
        }
        match callee {
            SINGLE_STEP_PC => {
                self.link(ret)?;
                self.single_step(ret).map(|()| None)
            }
            INTERPRETER_EXIT_PC => {
                self.link(ret)?;
                self.interpreter_exit(ret)
            }
            _ => {
                self.link(ret)?;
                self.pc = callee;
                Ok(None)
            }
        }
    }

    /// Records the return address the way the target's call instruction does.
    fn link(&mut self, ret: u32) -> InterpResult<()> {
        match self.isa {
            InstructionSet::X86 => self.push(ret),
            _ => {
                self.set_reg(self.info.lr, ret);
                Ok(())
            }
        }
    }

    /// Undoes `link` when a stub returns to the instruction after its data word.
    fn unlink(&mut self) -> InterpResult<()> {
        if self.isa == InstructionSet::X86 {
            self.pop()?;
        }
        Ok(())
    }

    fn call_template(&mut self, callee: u32) -> InterpResult<()> {
        let template = Template::at(callee)
            .ok_or_else(|| InterpError::Simulator(format!("no template at 0x{callee:08x}")))?;
        let mut args = [0u32; 4];
        for (slot, &reg) in args.iter_mut().zip(self.info.args) {
            *slot = self.reg(reg);
        }
        let (lo, hi) = template
            .evaluate(args)
            .map_err(|_| InterpError::Simulator(format!("{} divided by zero", template.name())))?;
        let (_, result_words) = template.shape();
        self.set_reg(self.info.rets[0], lo);
        if result_words == 2 {
            self.set_reg(self.info.rets[1], hi);
        }
        Ok(())
    }

    /// The dex pc stored in the data word a stub call is followed by.
    fn data_word(&self, ret: u32) -> InterpResult<u32> {
        let code = &self.code;
        ret.checked_sub(code.code_begin())
            .and_then(|offset| code.insn_index_at(offset))
            .map(|index| &code.insns[index])
            .filter(|insn| insn.kind == OpKind::Data)
            .map(|insn| insn.operands[0] as u32)
            .ok_or_else(|| InterpError::Simulator(format!("no data word at 0x{ret:08x}")))
    }

    fn method(&self) -> InterpResult<Arc<Method>> {
        let id = self.code.method;
        self.thread
            .methods()
            .get(id)
            .ok_or(InterpError::UnknownMethod(id.0))
    }

    /// Stack pointer of the compiled frame that made the current stub call.
    fn caller_frame(&self) -> u32 {
        match self.isa {
            InstructionSet::X86 => self.sp() + 4,
            _ => self.sp(),
        }
    }

    fn spill_callee_saves(&self, frame_sp: u32, frame: &FrameInfo, ret: u32) -> InterpResult<()> {
        let return_reg = self.isa.return_address_register();
        for reg in 0..32usize {
            let Some(offset) = frame.core_spill_offset(reg) else {
                continue;
            };
            let value = if reg == return_reg { ret } else { self.regs[reg] };
            self.store(frame_sp + offset, value)?;
        }
        for reg in 0..32usize {
            if let Some(offset) = frame.fp_spill_offset(reg) {
                self.store(frame_sp + offset, self.regs[32 + reg])?;
            }
        }
        Ok(())
    }

    fn reload_callee_saves(&mut self, frame_sp: u32, frame: &FrameInfo) -> InterpResult<()> {
        let return_reg = self.isa.return_address_register();
        for reg in 0..32usize {
            if reg == return_reg {
                continue;
            }
            if let Some(offset) = frame.core_spill_offset(reg) {
                self.regs[reg] = self.load(frame_sp + offset)?;
            }
        }
        for reg in 0..32usize {
            if let Some(offset) = frame.fp_spill_offset(reg) {
                self.regs[32 + reg] = self.load(frame_sp + offset)?;
            }
        }
        Ok(())
    }

    /// Interprets the one dalvik instruction compiled code punted on, inside a save-all
    /// frame so walkers see the compiled caller and its promoted registers.
    fn single_step(&mut self, ret: u32) -> InterpResult<()> {
        let save_all = Arc::clone(self.rt.save_all_method());
        let frame = save_all
            .frame_info()
            .ok_or_else(|| InterpError::Simulator("save-all method has no frame".to_string()))?;
        let caller_sp = self.caller_frame();
        let frame_sp = caller_sp - frame.frame_size;
        self.spill_callee_saves(frame_sp, &frame, ret)?;
        self.store(frame_sp, save_all.id().0)?;

        let dex_pc = self.data_word(ret)?;
        let method = self.method()?;
        let saved_cursor = self.thread.stack_cursor();
        self.thread.set_stack_cursor(frame_sp);
        self.thread.managed_stack_mut().push_fragment();
        self.thread
            .managed_stack_mut()
            .set_top_quick_frame(frame_sp, SINGLE_STEP_PC);

        trace!(dex_pc, method = %method.pretty_name(), "single-stepping punted instruction");
        let result = match self.code.kind {
            CodeKind::Method => {
                let regs = QuickFrameVRegs::new(self.thread, &self.code, &method, caller_sp, |reg| {
                    frame.core_spill_offset(reg).map(|offset| frame_sp + offset)
                });
                interpreter::step(self.rt, self.thread, &method, &regs, dex_pc)
            }
            CodeKind::Trace { .. } => {
                let regs = TraceVRegs {
                    thread: self.thread,
                    base: self.reg(self.info.trace_fp),
                };
                interpreter::step(self.rt, self.thread, &method, &regs, dex_pc)
            }
        };

        self.thread.managed_stack_mut().pop_fragment();
        self.thread.set_stack_cursor(saved_cursor);
        self.reload_callee_saves(frame_sp, &frame)?;
        match result? {
            Step::Next(_) => {
                self.unlink()?;
                self.pc = ret + 4;
                Ok(())
            }
            Step::Return(_) => Err(InterpError::Simulator(format!(
                "punted a return at 0x{dex_pc:04x}"
            ))),
        }
    }

    /// Leaves compiled code at a chaining cell or a punt-to-interpreter cell.
    fn interpreter_exit(&mut self, ret: u32) -> InterpResult<Option<Exit>> {
        let dex_pc = self.data_word(ret)?;
        let code = Arc::clone(&self.code);
        match code.kind {
            CodeKind::Trace { .. } => {
                let cell = code
                    .cells
                    .iter()
                    .position(|cell| code.code_begin() + cell.return_offset == ret);
                if let Some(index) = cell {
                    let target_dex_pc = code.cells[index].target_dex_pc;
                    if let Some(next) = self.rt.jit_table().lookup(code.method, target_dex_pc) {
                        self.rt.code_cache().chain(&code, index, next.code_begin());
                        self.rt
                            .with_jit(|jit| jit.mark_trace_executed(code.method, target_dex_pc));
                        self.unlink()?;
                        self.pc = next.code_begin();
                        return Ok(None);
                    }
                }
                Ok(Some(Exit::TraceExit(dex_pc)))
            }
            CodeKind::Method => {
                let value = self.finish_in_interpreter(&code, dex_pc)?;
                Ok(Some(Exit::Interpreted(value)))
            }
        }
    }

    /// Rebuilds the compiled frame as a shadow frame and interprets the rest of the method.
    fn finish_in_interpreter(&mut self, code: &CompiledCode, dex_pc: u32) -> InterpResult<Value> {
        let method = self.method()?;
        let num_locals = method.code_item().map_or(0, |item| item.num_locals());
        let caller_sp = self.caller_frame();
        let frame_info = code.frame();
        let frame = Rc::new(ShadowFrame::for_method(
            Arc::clone(&method),
            self.rt.config().reference_layout,
        ));
        let boundary = code.mapping.native_offset_for(dex_pc);
        for vreg in 0..frame.number_of_vregs() {
            let promoted = code
                .promoted
                .iter()
                .find(|(_, promoted_vreg)| *promoted_vreg as usize == vreg)
                .map(|(reg, _)| self.regs[*reg]);
            let value = match promoted {
                Some(value) => value,
                None => {
                    let offset = vreg_offset(&frame_info, num_locals, vreg as i32);
                    self.load(caller_sp.wrapping_add(offset as u32))?
                }
            };
            if boundary.is_some_and(|offset| code.gc_map.is_reference(offset, vreg)) {
                frame.set_vreg_reference(vreg, value);
            } else {
                frame.set_vreg(vreg, value);
            }
        }
        debug!(
            method = %method.pretty_name(),
            dex_pc,
            "compiled method continues in the interpreter"
        );
        let saved_cursor = self.thread.stack_cursor();
        self.thread.set_stack_cursor(self.sp());
        let result = interpreter::execute_from(self.rt, self.thread, frame, dex_pc);
        self.thread.set_stack_cursor(saved_cursor);
        result
    }
}

/// Vregs of a compiled method frame; promoted vregs live at their register's spill slot.
struct QuickFrameVRegs<'a> {
    thread: &'a Thread,
    frame_sp: u32,
    frame: FrameInfo,
    num_locals: u32,
    promoted: Vec<(usize, u32)>,
}

impl<'a> QuickFrameVRegs<'a> {
    fn new(
        thread: &'a Thread,
        code: &CompiledCode,
        method: &Method,
        frame_sp: u32,
        spill_slot: impl Fn(usize) -> Option<u32>,
    ) -> Self {
        let promoted = code
            .promoted
            .iter()
            .filter_map(|&(reg, vreg)| spill_slot(reg).map(|addr| (vreg as usize, addr)))
            .collect();
        Self {
            thread,
            frame_sp,
            frame: code.frame(),
            num_locals: method.code_item().map_or(0, |item| item.num_locals()),
            promoted,
        }
    }

    fn home(&self, vreg: usize) -> u32 {
        self.promoted
            .iter()
            .find(|(promoted, _)| *promoted == vreg)
            .map(|(_, addr)| *addr)
            .unwrap_or_else(|| {
                let offset = vreg_offset(&self.frame, self.num_locals, vreg as i32);
                self.frame_sp.wrapping_add(offset as u32)
            })
    }
}

impl VRegFile for QuickFrameVRegs<'_> {
    fn get(&self, vreg: usize) -> u32 {
        self.thread.memory().read_u32(self.home(vreg))
    }

    fn set(&self, vreg: usize, value: u32) {
        self.thread.memory().write_u32(self.home(vreg), value);
    }
}

/// Vregs of a trace, one word each above the trace frame pointer.
struct TraceVRegs<'a> {
    thread: &'a Thread,
    base: u32,
}

impl VRegFile for TraceVRegs<'_> {
    fn get(&self, vreg: usize) -> u32 {
        self.thread.memory().read_u32(self.base + 4 * vreg as u32)
    }

    fn set(&self, vreg: usize, value: u32) {
        self.thread.memory().write_u32(self.base + 4 * vreg as u32, value);
    }
}

fn align_down(value: u32) -> u32 {
    value & !(STACK_ALIGNMENT - 1)
}

fn reserve(thread: &Thread, bytes: u32) -> InterpResult<u32> {
    let cursor = thread.stack_cursor();
    let floor = thread.memory().base() + STACK_RESERVE;
    cursor
        .checked_sub(bytes)
        .map(align_down)
        .filter(|sp| *sp >= floor)
        .ok_or(InterpError::StackOverflow)
}

/// Calls compiled `code` for `method` and returns its result.
///
/// The caller's outgoing area is laid out below the stack cursor: a null method word, then
/// the arguments, which the callee reads as its ins.
pub fn run_method(
    rt: &Runtime,
    thread: &Thread,
    method: &Arc<Method>,
    code: &Arc<CompiledCode>,
    args: &[Value],
) -> InterpResult<Value> {
    let mut words = Vec::new();
    for arg in args {
        match arg.words() {
            2 => {
                let (lo, hi) = arith::split_long(arg.to_bits() as i64);
                words.extend([lo, hi]);
            }
            _ => words.push(arg.to_bits() as u32),
        }
    }
    let entry_sp = reserve(thread, 4 * (words.len() as u32 + 1))?;
    let memory = thread.memory();
    memory.write_u32(entry_sp, 0);
    for (index, word) in words.iter().enumerate() {
        memory.write_u32(entry_sp + 4 + 4 * index as u32, *word);
    }

    let mut machine = Machine::new(rt, thread, Arc::clone(code));
    machine.set_reg(machine.info.method_reg, method.id().0);
    machine.set_sp(entry_sp);
    match machine.isa {
        InstructionSet::X86 => machine.push(INVOKE_RETURN_PC)?,
        _ => machine.set_reg(machine.info.lr, INVOKE_RETURN_PC),
    }

    let saved_cursor = thread.stack_cursor();
    thread.set_stack_cursor(entry_sp);
    let exit = machine.run();
    thread.set_stack_cursor(saved_cursor);

    match exit? {
        Exit::Returned => {
            let kind = method.shorty().chars().next().unwrap_or('V');
            let lo = machine.reg(machine.info.rets[0]);
            let hi = machine.reg(machine.info.rets[1]);
            let bits = match kind {
                'J' | 'D' => arith::join_long(lo, hi) as u64,
                _ => lo as u64,
            };
            Ok(Value::from_bits(kind, bits))
        }
        Exit::Interpreted(value) => Ok(value),
        Exit::TraceExit(dex_pc) => Err(InterpError::Simulator(format!(
            "method code left through a trace exit at 0x{dex_pc:04x}"
        ))),
    }
}

/// Runs a trace over the vregs of `frame` and returns the dex pc it exits at.
///
/// The vregs are copied into a native array for the trace and back afterwards. A changed
/// value that points into the heap is recorded as a reference.
pub fn run_trace(rt: &Runtime, thread: &Thread, frame: &ShadowFrame, code: &Arc<CompiledCode>) -> InterpResult<u32> {
    let count = frame.number_of_vregs();
    let base = reserve(thread, 4 * count as u32)?;
    let sp = base - STACK_ALIGNMENT;
    let memory = thread.memory();
    for vreg in 0..count {
        memory.write_u32(base + 4 * vreg as u32, frame.get_vreg(vreg));
    }
    memory.write_u32(sp, 0);

    let mut machine = Machine::new(rt, thread, Arc::clone(code));
    machine.set_reg(machine.info.trace_fp, base);
    machine.set_sp(sp);
    let saved_cursor = thread.stack_cursor();
    thread.set_stack_cursor(sp);
    let exit = machine.run();
    thread.set_stack_cursor(saved_cursor);

    let heap = thread.heap();
    for vreg in 0..count {
        let value = memory.read_u32(base + 4 * vreg as u32);
        if value == frame.get_vreg(vreg) {
            continue;
        }
        if value != 0 && heap.contains(value, 4) {
            frame.set_vreg_reference(vreg, value);
        } else {
            frame.set_vreg(vreg, value);
        }
    }

    let entry = match code.kind {
        CodeKind::Trace { entry_dex_pc } => entry_dex_pc,
        CodeKind::Method => 0,
    };
    rt.with_jit(|jit| jit.mark_trace_executed(code.method, entry));
    match exit? {
        Exit::TraceExit(dex_pc) => {
            trace!(entry, exit = dex_pc, "trace exit");
            Ok(dex_pc)
        }
        Exit::Returned | Exit::Interpreted(_) => Err(InterpError::Simulator(
            "trace returned instead of exiting".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembler::assemble_method;
    use crate::method::MethodTable;
    use crate::runtime::jit::JitConfig;

    const SUM: &str = "
.method static LT;->sum(II)I
.registers 5
.ins 2
    add-int v0, p0, p1
    mul-int/lit8 v1, v0, 3
    sub-int v2, v1, p0
    return v2
.end method
";

    fn runtime(isa: InstructionSet, source: &str) -> (Runtime, Arc<Method>) {
        let methods = Arc::new(MethodTable::new());
        let method = methods.register(assemble_method(source).expect("assemble"));
        let config = JitConfig {
            isa,
            enabled: false,
            ..JitConfig::default()
        };
        (Runtime::new(config, methods).expect("runtime"), method)
    }

    #[test]
    fn compiled_methods_match_the_interpreter_on_every_target() {
        for isa in [InstructionSet::Thumb2, InstructionSet::X86, InstructionSet::Mips] {
            let (rt, method) = runtime(isa, SUM);
            let thread = rt.new_thread();
            let args = [Value::Int(4), Value::Int(-9)];
            let interpreted = rt.invoke(&thread, &method, &args).expect("interpret");
            rt.compile_method_now(&method).expect("compile");
            let compiled = rt.invoke(&thread, &method, &args).expect("run compiled");
            assert_eq!(compiled, interpreted, "{isa}");
            assert_eq!(compiled, Value::Int(-19), "{isa}");
            assert_eq!(thread.stack_cursor(), thread.memory().end(), "{isa}");
        }
    }

    #[test]
    fn wide_results_come_back_in_two_registers() {
        let source = "
.method static LT;->widen(I)J
.registers 3
.ins 1
    int-to-long v0, v2
    return-wide v0
.end method
";
        for isa in [InstructionSet::Thumb2, InstructionSet::X86, InstructionSet::Mips] {
            let (rt, method) = runtime(isa, source);
            let thread = rt.new_thread();
            rt.compile_method_now(&method).expect("compile");
            let result = rt.invoke(&thread, &method, &[Value::Int(-5)]).expect("run");
            assert_eq!(result, Value::Long(-5), "{isa}");
        }
    }

    #[test]
    fn alu_carries_chain_through_adc_and_sbc() {
        let (rt, method) = runtime(InstructionSet::Thumb2, SUM);
        rt.compile_method_now(&method).expect("compile");
        let thread = rt.new_thread();
        let code = Arc::clone(method.compiled().expect("code"));
        let mut machine = Machine::new(&rt, &thread, code);
        assert_eq!(machine.alu(AluOp::Adds, u32::MAX, 1), 0);
        assert_eq!(machine.alu(AluOp::Adc, 1, 1), 3);
        assert_eq!(machine.alu(AluOp::Subs, 0, 1), u32::MAX);
        assert_eq!(machine.alu(AluOp::Sbc, 5, 1), 3);
        assert_eq!(machine.alu(AluOp::Asr, 0x8000_0000, 33), 0xc000_0000);
    }
}
