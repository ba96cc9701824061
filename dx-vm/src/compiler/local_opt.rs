//! Local LIR optimisation: redundant frame-load elimination.
//!
//! A load of a vreg into the register that was just stored to that vreg's home is dropped,
//! provided nothing in between redefines the register or the home, and no label, branch or
//! call separates the two.

use tracing::debug;

use crate::compiler::CompilationUnit;
use crate::compiler::codegen::CodegenTarget;
use crate::compiler::lir::{IS_BRANCH, IS_CALL, Lir, LirOp, PseudoOp, RES_DALVIK_REG, ResourceMask};

fn is_barrier(target: &dyn CodegenTarget, lir: &Lir) -> bool {
    match lir.opcode {
        LirOp::Pseudo(PseudoOp::DalvikBoundary) => false,
        LirOp::Pseudo(_) => true,
        LirOp::Target(opcode) => {
            target.encoding(opcode).flags & (IS_BRANCH | IS_CALL) != 0
                || lir.use_mask == ResourceMask::ALL
                || lir.def_mask == ResourceMask::ALL
        }
    }
}

/// Turns redundant vreg loads into nops and returns how many were removed.
pub fn eliminate_redundant_loads(cu: &mut CompilationUnit<'_>, target: &dyn CodegenTarget) -> usize {
    let mut removed = 0;
    for index in 0..cu.lirs.len() {
        let store = cu.lirs.get(index);
        if store.is_nop {
            continue;
        }
        let Some(alias) = store.alias.filter(|alias| !alias.is_load) else {
            continue;
        };
        let [value_reg, base_reg, disp, _, _] = store.operands;
        let watched = ResourceMask::reg(value_reg).union(ResourceMask::reg(base_reg));

        for next in index + 1..cu.lirs.len() {
            let lir = cu.lirs.get(next);
            if lir.is_nop {
                continue;
            }
            if is_barrier(target, &lir) {
                break;
            }
            if let Some(other) = lir.alias {
                if other.vreg == alias.vreg && other.is_load && other.wide == alias.wide {
                    let [load_reg, load_base, load_disp, _, _] = lir.operands;
                    if load_reg == value_reg && load_base == base_reg && load_disp == disp {
                        cu.lirs.get_mut(next).is_nop = true;
                        removed += 1;
                        continue;
                    }
                }
                if other.vreg == alias.vreg && !other.is_load {
                    break;
                }
            }
            if lir.def_mask.intersects(watched) {
                break;
            }
            if lir.alias.is_none() && lir.def_mask.other & RES_DALVIK_REG != 0 {
                break;
            }
        }
    }
    if removed > 0 {
        debug!(removed, "eliminated redundant vreg loads");
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembler::assemble_method;
    use crate::compiler::arena::Arena;
    use crate::compiler::codegen::{emit_pseudo, target_for};
    use crate::compiler::lir::{AliasInfo, AluOp};
    use crate::compiler::ralloc::RegisterPool;
    use crate::compiler::{CompilationUnit, CompileMode};
    use crate::isa::InstructionSet;
    use crate::method::MethodTable;

    const SOURCE: &str = "
.method static LFoo;->f()V
.registers 4
    return-void
.end method
";

    fn alias(vreg: i32, is_load: bool) -> Option<AliasInfo> {
        Some(AliasInfo {
            vreg,
            is_load,
            wide: false,
        })
    }

    fn with_unit(check: impl FnOnce(&mut CompilationUnit<'_>, &dyn CodegenTarget)) {
        let arena = Arena::new();
        let table = MethodTable::new();
        let method = table.register(assemble_method(SOURCE).expect("assemble"));
        let target = target_for(InstructionSet::Thumb2);
        let pool = RegisterPool::new(&arena, &[0, 1, 2, 3], &[], 4);
        let mut cu = CompilationUnit::new(
            &arena,
            method,
            InstructionSet::Thumb2,
            CompileMode::Trace,
            0,
            pool,
        )
        .expect("unit");
        check(&mut cu, target);
    }

    #[test]
    fn reload_into_the_stored_register_is_dropped() {
        with_unit(|cu, target| {
            target.store_base_disp(cu, 1, 5, 8, alias(2, false)).expect("store");
            emit_pseudo(cu, PseudoOp::DalvikBoundary, 2);
            let reload = target.load_base_disp(cu, 1, 5, 8, alias(2, true)).expect("load");
            let other = target.load_base_disp(cu, 2, 5, 8, alias(2, true)).expect("load");
            assert_eq!(eliminate_redundant_loads(cu, target), 1);
            assert!(cu.lirs.get(reload).is_nop);
            assert!(!cu.lirs.get(other).is_nop);
        });
    }

    #[test]
    fn redefinition_or_label_keeps_the_load() {
        with_unit(|cu, target| {
            target.store_base_disp(cu, 1, 5, 8, alias(2, false)).expect("store");
            target
                .op_reg_reg_imm(cu, AluOp::Add, 1, 1, 1)
                .expect("add");
            let clobbered = target.load_base_disp(cu, 1, 5, 8, alias(2, true)).expect("load");
            target.store_base_disp(cu, 3, 5, 12, alias(3, false)).expect("store");
            emit_pseudo(cu, PseudoOp::TargetLabel, 0);
            let joined = target.load_base_disp(cu, 3, 5, 12, alias(3, true)).expect("load");
            assert_eq!(eliminate_redundant_loads(cu, target), 0);
            assert!(!cu.lirs.get(clobbered).is_nop);
            assert!(!cu.lirs.get(joined).is_nop);
        });
    }
}
