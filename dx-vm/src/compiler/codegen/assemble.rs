//! LIR to bytes.
//!
//! Offsets are assigned from the current size estimate of every LIR, then everything is
//! encoded. A LIR whose encoding comes out at a different size, or whose short branch form
//! cannot reach its label, changes the layout, so the pass repeats until it is stable.

use tracing::trace;

use crate::compiler::codegen::{CodegenTarget, EncodeContext, EncodeError};
use crate::compiler::lir::{COND_OPERAND, Cond, Lir, LirOp, MachineInsn, PseudoOp};
use crate::compiler::{CompilationUnit, CompileAbort, CompileResult};

const MAX_ASSEMBLER_RETRIES: usize = 24;

#[derive(Debug)]
pub struct Assembled {
    pub bytes: Vec<u8>,
    pub insns: Vec<MachineInsn>,
}

/// Assigns code-relative offsets and returns the total size.
pub fn assign_offsets(cu: &mut CompilationUnit<'_>) -> u32 {
    let mut offset = 0u32;
    for index in 0..cu.lirs.len() {
        let lir = cu.lirs.get_mut(index);
        lir.offset = offset;
        if lir.is_nop {
            continue;
        }
        match lir.opcode {
            LirOp::Pseudo(PseudoOp::Align4) => {
                offset = offset.next_multiple_of(4);
                lir.offset = offset;
            }
            LirOp::Pseudo(_) => {}
            LirOp::Target(_) => offset += lir.size as u32,
        }
    }
    offset
}

fn encode_context(cu: &CompilationUnit<'_>, lir: &Lir, code_begin: u32) -> EncodeContext {
    EncodeContext {
        code_begin,
        pc: lir.offset,
        target_offset: lir.target.map(|label| cu.lirs.get(label).offset),
        literal_offset: lir
            .literal
            .and_then(|literal| cu.literal_lir(literal))
            .map(|data| cu.lirs.get(data).offset),
    }
}

fn machine_insn(
    cu: &CompilationUnit<'_>,
    target: &dyn CodegenTarget,
    lir: &Lir,
    opcode: u16,
    ctx: &EncodeContext,
    size: usize,
) -> MachineInsn {
    let info = target.encoding(opcode);
    let kind = if info.kind.is_conditional_branch() {
        info.kind
            .with_cond(Cond::from_operand(lir.operands[COND_OPERAND]))
    } else {
        info.kind
    };
    MachineInsn {
        offset: lir.offset,
        size: size as u32,
        opcode,
        name: info.name,
        fmt: info.fmt,
        kind,
        flags: info.flags,
        operands: lir.operands,
        dalvik_offset: lir.dalvik_offset,
        target_offset: ctx.target_offset,
        call_target: lir.call_target,
        literal: lir.literal.and_then(|literal| cu.literal_value(literal)),
    }
}

/// Encodes the unit's LIR list for code that will live at `code_begin`.
pub fn assemble(
    cu: &mut CompilationUnit<'_>,
    target: &dyn CodegenTarget,
    code_begin: u32,
) -> CompileResult<Assembled> {
    for attempt in 0..MAX_ASSEMBLER_RETRIES {
        let total = assign_offsets(cu);
        let mut bytes = Vec::with_capacity(total as usize);
        let mut insns = Vec::new();
        let mut retry = false;

        for index in 0..cu.lirs.len() {
            let lir = cu.lirs.get(index);
            if lir.is_nop {
                continue;
            }
            let opcode = match lir.opcode {
                LirOp::Pseudo(PseudoOp::Align4) => {
                    bytes.resize(bytes.len().next_multiple_of(4), 0);
                    continue;
                }
                LirOp::Pseudo(_) => continue,
                LirOp::Target(opcode) => opcode,
            };
            let ctx = encode_context(cu, &lir, code_begin);
            match target.encode(&lir, &ctx) {
                Ok(encoded) => {
                    if encoded.len() != lir.size as usize {
                        cu.lirs.get_mut(index).size = encoded.len() as u8;
                        retry = true;
                    }
                    insns.push(machine_insn(cu, target, &lir, opcode, &ctx, encoded.len()));
                    bytes.extend_from_slice(&encoded);
                }
                Err(EncodeError::NeedsLongForm) if !lir.long_form => {
                    let entry = cu.lirs.get_mut(index);
                    entry.long_form = true;
                    let size = target.lir_size(entry);
                    entry.size = size;
                    retry = true;
                }
                Err(_) => {
                    return Err(CompileAbort::BranchOutOfRange { offset: lir.offset });
                }
            }
        }

        if !retry {
            trace!(attempt, size = bytes.len(), "assembled");
            return Ok(Assembled { bytes, insns });
        }
    }
    Err(CompileAbort::AssemblerRetries)
}
